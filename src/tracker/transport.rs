//! Datagram transport seam
//!
//! The session only needs "send these bytes to that address" and "give me
//! the next datagram". Keeping that behind a trait lets tests drive the
//! protocol over in-memory channels.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;

/// Unreliable, unordered datagram transport
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one datagram, returning the number of bytes written
    async fn send_to(&self, payload: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Receive the next datagram into `buf`
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Local address, when there is one
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Transport for UdpSocket {
    async fn send_to(&self, payload: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, payload, addr).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}
