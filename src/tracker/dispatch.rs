//! Transaction dispatch over one datagram socket
//!
//! A single reader task receives every inbound datagram and routes it to
//! the caller waiting on its transaction id. Lookup, source check and
//! removal happen under one lock, so a reply is delivered at most once and
//! never to a request it does not belong to.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, trace, warn};

use crate::error::{Result, TorrentError};
use crate::tracker::transport::Transport;
use crate::tracker::wire::peek_header;

/// Pause after a failed receive before reading again
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A routed reply, or `Truncated` when it filled the whole receive buffer
pub type Inbound = Result<Bytes>;

/// One outstanding request
struct PendingEntry {
    /// Address the reply must come from
    addr: SocketAddr,
    serial: u64,
    tx: oneshot::Sender<Inbound>,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<u32, PendingEntry>,
    next_serial: u64,
}

type SharedPendingTable = Arc<Mutex<PendingTable>>;

/// Routes replies to waiting requests by transaction id
pub struct Dispatcher<T: Transport> {
    transport: Arc<T>,
    pending: SharedPendingTable,
    reader: JoinHandle<()>,
}

impl<T: Transport> Dispatcher<T> {
    /// Start dispatching datagrams received on `transport`.
    ///
    /// A datagram that fills all `recv_buffer_size` bytes may have been cut
    /// short by the socket and is delivered as `Truncated`. Must be called from within a tokio runtime. The reader task stops
    /// when the dispatcher is dropped.
    pub fn new(transport: Arc<T>, recv_buffer_size: usize) -> Arc<Self> {
        let pending: SharedPendingTable = Arc::new(Mutex::new(PendingTable::default()));
        let reader = tokio::spawn(read_loop(
            Arc::clone(&transport),
            Arc::clone(&pending),
            recv_buffer_size,
        ));
        Arc::new(Self {
            transport,
            pending,
            reader,
        })
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Reserve a fresh, unused transaction id for a request to `addr`.
    ///
    /// The reservation is released when the returned handle is dropped.
    pub fn register(&self, addr: SocketAddr) -> Pending {
        let (tx, rx) = oneshot::channel();
        let mut table = self.pending.lock();
        let mut rng = rand::thread_rng();
        let transaction_id = loop {
            let candidate: u32 = rng.gen();
            if !table.entries.contains_key(&candidate) {
                break candidate;
            }
        };
        let serial = table.next_serial;
        table.next_serial += 1;
        table.entries.insert(transaction_id, PendingEntry { addr, serial, tx });
        trace!("Registered transaction {:#010x} for {}", transaction_id, addr);

        Pending {
            transaction_id,
            serial,
            rx,
            table: Arc::clone(&self.pending),
        }
    }

    /// Send one datagram. A partial write is an error.
    pub async fn send(&self, payload: &[u8], addr: SocketAddr) -> Result<()> {
        let written = self.transport.send_to(payload, addr).await?;
        if written != payload.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short datagram write: {} of {} bytes", written, payload.len()),
            )
            .into());
        }
        trace!("Sent {} bytes to {}", written, addr);
        Ok(())
    }

    /// Number of requests currently waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.pending.lock().entries.len()
    }
}

impl<T: Transport> Drop for Dispatcher<T> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Handle for one registered transaction
pub struct Pending {
    transaction_id: u32,
    serial: u64,
    rx: oneshot::Receiver<Inbound>,
    table: SharedPendingTable,
}

impl Pending {
    pub fn transaction_id(&self) -> u32 {
        self.transaction_id
    }

    /// Wait up to `limit` for the matching reply
    pub async fn wait(&mut self, limit: Duration) -> Option<Inbound> {
        match timeout(limit, &mut self.rx).await {
            Ok(Ok(datagram)) => Some(datagram),
            Ok(Err(_)) => None,
            Err(_) => {
                debug!(
                    "Transaction {:#010x} timed out after {:?}",
                    self.transaction_id, limit
                );
                None
            }
        }
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        if let Entry::Occupied(entry) = table.entries.entry(self.transaction_id) {
            if entry.get().serial == self.serial {
                entry.remove();
            }
        }
    }
}

async fn read_loop<T: Transport>(transport: Arc<T>, pending: SharedPendingTable, buffer_size: usize) {
    let mut buffer = vec![0u8; buffer_size];
    loop {
        match transport.recv_from(&mut buffer).await {
            Ok((len, from)) => {
                let truncated = len == buffer.len();
                if truncated {
                    warn!(
                        "Datagram from {} filled the {} byte receive buffer",
                        from, len
                    );
                }
                dispatch(&pending, &buffer[..len], from, truncated);
            }
            Err(e) => {
                error!("Error receiving tracker datagram: {}", e);
                tokio::time::sleep(RECV_ERROR_BACKOFF).await;
            }
        }
    }
}

fn dispatch(pending: &Mutex<PendingTable>, datagram: &[u8], from: SocketAddr, truncated: bool) {
    let header = match peek_header(datagram) {
        Ok(header) => header,
        Err(e) => {
            warn!("Dropping datagram from {}: {}", from, e);
            return;
        }
    };

    let routed = {
        let mut table = pending.lock();
        match table.entries.entry(header.transaction_id) {
            Entry::Occupied(entry) if entry.get().addr == from => Routed::Matched(entry.remove()),
            Entry::Occupied(entry) => Routed::WrongSource(entry.get().addr),
            Entry::Vacant(_) => Routed::Unknown,
        }
    };

    match routed {
        Routed::Matched(entry) => {
            let inbound = if truncated {
                Err(TorrentError::Truncated {
                    needed: datagram.len() + 1,
                    available: datagram.len(),
                })
            } else {
                Ok(Bytes::copy_from_slice(datagram))
            };
            if entry.tx.send(inbound).is_err() {
                trace!("Waiter for transaction {:#010x} is gone", header.transaction_id);
            }
        }
        Routed::WrongSource(expected) => warn!(
            "Transaction {:#010x} answered by {} instead of {}",
            header.transaction_id, from, expected
        ),
        Routed::Unknown => debug!(
            "Discarding datagram from {} for unknown transaction {:#010x}",
            from, header.transaction_id
        ),
    }
}

enum Routed {
    Matched(PendingEntry),
    WrongSource(SocketAddr),
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::mock::MockTransport;
    use crate::tracker::wire::{ConnectResponse, Wire};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn tracker_addr() -> SocketAddr {
        "10.0.0.1:6969".parse().unwrap()
    }

    fn reply(transaction_id: u32) -> Bytes {
        ConnectResponse {
            transaction_id,
            connection_id: 42,
        }
        .encode()
    }

    #[tokio::test]
    async fn test_reply_routed_by_transaction_id() {
        let (transport, mut remote) = MockTransport::pair();
        let dispatcher = Dispatcher::new(Arc::new(transport), 2048);

        let mut a = dispatcher.register(tracker_addr());
        let mut b = dispatcher.register(tracker_addr());
        assert_ne!(a.transaction_id(), b.transaction_id());
        assert_eq!(dispatcher.pending_count(), 2);

        remote.deliver(reply(b.transaction_id()), tracker_addr());
        let got = b.wait(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(got, reply(b.transaction_id()));
        assert_eq!(dispatcher.pending_count(), 1);

        remote.deliver(reply(a.transaction_id()), tracker_addr());
        assert!(a.wait(Duration::from_secs(5)).await.is_some());
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_from_wrong_address_dropped() {
        let (transport, mut remote) = MockTransport::pair();
        let dispatcher = Dispatcher::new(Arc::new(transport), 2048);

        let mut pending = dispatcher.register(tracker_addr());
        let spoofer: SocketAddr = "10.0.0.66:6969".parse().unwrap();
        remote.deliver(reply(pending.transaction_id()), spoofer);

        assert!(pending.wait(Duration::from_secs(1)).await.is_none());
        assert_eq!(dispatcher.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_transaction_discarded() {
        let (transport, mut remote) = MockTransport::pair();
        let dispatcher = Dispatcher::new(Arc::new(transport), 2048);

        let mut pending = dispatcher.register(tracker_addr());
        remote.deliver(reply(pending.transaction_id().wrapping_add(1)), tracker_addr());
        remote.deliver(Bytes::from_static(&[0, 0, 0]), tracker_addr());

        assert!(pending.wait(Duration::from_secs(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_drop_releases_transaction() {
        let (transport, _remote) = MockTransport::pair();
        let dispatcher = Dispatcher::new(Arc::new(transport), 2048);

        let pending = dispatcher.register(tracker_addr());
        assert_eq!(dispatcher.pending_count(), 1);
        drop(pending);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_full_buffer_reported_truncated() {
        let (transport, mut remote) = MockTransport::pair();
        let dispatcher = Dispatcher::new(Arc::new(transport), 32);

        let mut fits = dispatcher.register(tracker_addr());
        remote.deliver(reply(fits.transaction_id()), tracker_addr());
        let got = fits.wait(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(got.len(), 16);

        let mut oversized = dispatcher.register(tracker_addr());
        let mut datagram = reply(oversized.transaction_id()).to_vec();
        datagram.resize(50, 0);
        remote.deliver(Bytes::from(datagram), tracker_addr());
        let err = oversized
            .wait(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err,
            TorrentError::Truncated {
                needed: 33,
                available: 32
            }
        ));
    }

    struct BrokenSocket {
        recv_calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for BrokenSocket {
        async fn send_to(&self, payload: &[u8], _addr: SocketAddr) -> io::Result<usize> {
            Ok(payload.len())
        }

        async fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            self.recv_calls.fetch_add(1, AtomicOrdering::SeqCst);
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "icmp unreachable"))
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 6881)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_errors_back_off() {
        let socket = Arc::new(BrokenSocket {
            recv_calls: AtomicUsize::new(0),
        });
        let _dispatcher = Dispatcher::new(Arc::clone(&socket), 2048);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let calls = socket.recv_calls.load(AtomicOrdering::SeqCst);
        assert!(calls >= 2, "reader stopped after {} receives", calls);
        assert!(calls <= 12, "reader spun {} times in one second", calls);
    }

    #[tokio::test]
    async fn test_send_records_datagram() {
        let (transport, mut remote) = MockTransport::pair();
        let dispatcher = Dispatcher::new(Arc::new(transport), 2048);

        dispatcher.send(b"hello", tracker_addr()).await.unwrap();
        let (payload, addr) = remote.next_sent().await;
        assert_eq!(&payload[..], b"hello");
        assert_eq!(addr, tracker_addr());
    }
}
