//! In-memory transport for protocol tests

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::tracker::transport::Transport;

type Datagram = (Bytes, SocketAddr);

/// Transport whose peer is the test itself
pub struct MockTransport {
    sent: mpsc::UnboundedSender<Datagram>,
    inbound: Mutex<mpsc::UnboundedReceiver<Datagram>>,
    failing_sends: AtomicUsize,
}

/// The test's side of a [`MockTransport`]
pub struct MockRemote {
    sent: mpsc::UnboundedReceiver<Datagram>,
    inbound: mpsc::UnboundedSender<Datagram>,
}

impl MockTransport {
    pub fn pair() -> (Self, MockRemote) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                sent: sent_tx,
                inbound: Mutex::new(inbound_rx),
                failing_sends: AtomicUsize::new(0),
            },
            MockRemote {
                sent: sent_rx,
                inbound: inbound_tx,
            },
        )
    }

    /// Make the next `count` sends fail without reaching the remote
    pub fn fail_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_to(&self, payload: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let failed = self
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(io::Error::new(io::ErrorKind::Other, "no buffer space available"));
        }
        let _ = self.sent.send((Bytes::copy_from_slice(payload), addr));
        Ok(payload.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some((datagram, from)) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok((len, from))
            }
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 6881)))
    }
}

impl MockRemote {
    /// Inject a datagram as if `from` had sent it
    pub fn deliver(&mut self, datagram: Bytes, from: SocketAddr) {
        let _ = self.inbound.send((datagram, from));
    }

    /// Next datagram the transport sent
    pub async fn next_sent(&mut self) -> Datagram {
        self.sent.recv().await.expect("transport dropped")
    }

    /// Everything sent so far that has not been read yet
    pub fn drain_sent(&mut self) -> Vec<Datagram> {
        let mut out = Vec::new();
        while let Ok(datagram) = self.sent.try_recv() {
            out.push(datagram);
        }
        out
    }
}
