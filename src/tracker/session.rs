//! UDP tracker session (BEP 15)
//!
//! Drives connect, announce and scrape exchanges against one tracker:
//! connection-id caching, a fresh transaction id per transmission, and
//! retransmission on the [`RetryPolicy`] schedule. Replies are matched by
//! the shared [`Dispatcher`], so many sessions can use one socket.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::{Host, Url};

use crate::config::TrackerConfig;
use crate::error::{Result, TorrentError};
use crate::hash::{InfoHash, PeerId};
use crate::tracker::backoff::RetryPolicy;
use crate::tracker::dispatch::{Dispatcher, Inbound};
use crate::tracker::transport::Transport;
use crate::tracker::wire::{
    decode_reply, AnnounceEvent, AnnounceRequest, AnnounceResponse, ConnectRequest,
    ConnectResponse, Reply, ScrapeRequest, ScrapeResponse, ScrapeStats, Wire, MAX_SCRAPE_HASHES,
};

/// Parsed `udp://host:port[/path][?query]` tracker address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerUrl {
    pub host: Host,
    pub port: u16,
    /// Path and query, sent as the URL-data announce option
    pub url_data: Option<String>,
}

impl TrackerUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| TorrentError::invalid_url(raw, e.to_string()))?;
        if url.scheme() != "udp" {
            return Err(TorrentError::invalid_url(
                raw,
                format!("scheme must be udp, got {}", url.scheme()),
            ));
        }
        // udp is not a special scheme, so IPv4 literals come back as domains.
        let host = match url.host() {
            Some(Host::Domain(domain)) => match domain.parse::<Ipv4Addr>() {
                Ok(ip) => Host::Ipv4(ip),
                Err(_) => Host::Domain(domain.to_string()),
            },
            Some(Host::Ipv4(ip)) => Host::Ipv4(ip),
            Some(Host::Ipv6(ip)) => Host::Ipv6(ip),
            None => return Err(TorrentError::invalid_url(raw, "missing host")),
        };
        let port = url
            .port()
            .ok_or_else(|| TorrentError::invalid_url(raw, "missing port"))?;

        let mut url_data = url.path().to_string();
        if let Some(query) = url.query() {
            url_data.push('?');
            url_data.push_str(query);
        }
        let url_data = match url_data.as_str() {
            "" | "/" => None,
            _ => Some(url_data),
        };

        Ok(Self {
            host,
            port,
            url_data,
        })
    }

    /// Resolve to a socket address, preferring IPv4
    pub async fn resolve(&self) -> Result<SocketAddr> {
        match &self.host {
            Host::Ipv4(ip) => Ok(SocketAddr::new(IpAddr::V4(*ip), self.port)),
            Host::Ipv6(ip) => Ok(SocketAddr::new(IpAddr::V6(*ip), self.port)),
            Host::Domain(domain) => {
                let addrs: Vec<SocketAddr> =
                    tokio::net::lookup_host((domain.as_str(), self.port)).await?.collect();
                addrs
                    .iter()
                    .find(|a| a.is_ipv4())
                    .or_else(|| addrs.first())
                    .copied()
                    .ok_or_else(|| {
                        TorrentError::invalid_url(
                            format!("udp://{}:{}", domain, self.port),
                            "host did not resolve",
                        )
                    })
            }
        }
    }
}

/// What to announce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceParams {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: AnnounceEvent,
    pub ip: Option<Ipv4Addr>,
    /// -1 for the tracker's default
    pub num_want: i32,
    pub port: u16,
}

impl AnnounceParams {
    pub fn new(info_hash: InfoHash, peer_id: PeerId, port: u16) -> Self {
        Self {
            info_hash,
            peer_id,
            downloaded: 0,
            left: 0,
            uploaded: 0,
            event: AnnounceEvent::None,
            ip: None,
            num_want: -1,
            port,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ConnectionId {
    id: u64,
    obtained_at: Instant,
}

/// Outcome of settling one attempt
enum Step<R> {
    Done(R),
    Retry,
}

/// Client state for one UDP tracker
pub struct TrackerSession<T: Transport> {
    dispatcher: Arc<Dispatcher<T>>,
    tracker: SocketAddr,
    url_data: Option<String>,
    policy: RetryPolicy,
    connection_ttl: Duration,
    key: u32,
    connection: Mutex<Option<ConnectionId>>,
}

impl TrackerSession<UdpSocket> {
    /// Bind a fresh socket for the tracker at `url`
    pub async fn bind(url: &str, config: &TrackerConfig) -> Result<Self> {
        config.validate()?;
        let target = TrackerUrl::parse(url)?;
        let addr = target.resolve().await?;
        let socket = UdpSocket::bind(config.bind_addr.as_str()).await?;
        debug!(
            "Bound tracker socket {} for {} ({})",
            socket.local_addr()?,
            url,
            addr
        );
        let dispatcher = Dispatcher::new(Arc::new(socket), config.recv_buffer_size);
        Ok(Self::new(dispatcher, addr, config).with_url_data(target.url_data))
    }
}

impl<T: Transport> TrackerSession<T> {
    pub fn new(dispatcher: Arc<Dispatcher<T>>, tracker: SocketAddr, config: &TrackerConfig) -> Self {
        Self {
            dispatcher,
            tracker,
            url_data: None,
            policy: config.retry_policy(),
            connection_ttl: config.connection_ttl(),
            key: rand::thread_rng().gen(),
            connection: Mutex::new(None),
        }
    }

    /// Path and query to send with every announce
    pub fn with_url_data(mut self, url_data: Option<String>) -> Self {
        self.url_data = url_data.filter(|data| !data.is_empty());
        self
    }

    pub fn tracker_addr(&self) -> SocketAddr {
        self.tracker
    }

    /// Per-session key sent with announces
    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<T>> {
        &self.dispatcher
    }

    /// Whether a connection id is cached and still fresh
    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .map(|conn| conn.obtained_at.elapsed() < self.connection_ttl)
            .unwrap_or(false)
    }

    /// Obtain a connection id, reusing the cached one while it is fresh.
    ///
    /// Concurrent callers wait for the first one and share its result.
    pub async fn connect(&self) -> Result<u64> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = *slot {
            if conn.obtained_at.elapsed() < self.connection_ttl {
                debug!("Reusing connection id {:#018x} for {}", conn.id, self.tracker);
                return Ok(conn.id);
            }
            debug!("Connection id for {} expired", self.tracker);
        }
        *slot = None;
        debug!(
            "Connecting to {} (giving up after {:?})",
            self.tracker,
            self.policy.total_timeout()
        );

        let mut attempt = 0;
        let mut last_malformed = None;
        while self.policy.retry_budget(attempt) {
            let reply = self
                .exchange(attempt, |transaction_id| {
                    ConnectRequest { transaction_id }.encode()
                })
                .await;
            attempt += 1;

            if let Step::Done(response) =
                self.settle::<ConnectResponse>(reply, &mut last_malformed)?
            {
                *slot = Some(ConnectionId {
                    id: response.connection_id,
                    obtained_at: Instant::now(),
                });
                info!(
                    "Connected to tracker {} (connection id {:#018x})",
                    self.tracker, response.connection_id
                );
                return Ok(response.connection_id);
            }
        }
        Err(self.exhausted(attempt, last_malformed))
    }

    /// Announce and return the tracker's peer list and interval
    pub async fn announce(&self, params: &AnnounceParams) -> Result<AnnounceResponse> {
        let mut attempt = 0;
        let mut last_malformed = None;
        while self.policy.retry_budget(attempt) {
            let connection_id = self.connect().await?;
            let reply = self
                .exchange(attempt, |transaction_id| {
                    self.announce_request(connection_id, transaction_id, params)
                        .encode()
                })
                .await;
            attempt += 1;

            match self.settle::<AnnounceResponse>(reply, &mut last_malformed) {
                Ok(Step::Done(response)) => {
                    info!(
                        "Announced {} to {}: {} peers, {} seeders, {} leechers, interval {}s",
                        params.info_hash,
                        self.tracker,
                        response.peers.len(),
                        response.seeders,
                        response.leechers,
                        response.interval
                    );
                    return Ok(response);
                }
                Ok(Step::Retry) => {}
                Err(e) => {
                    if e.is_tracker_final() {
                        self.forget_connection().await;
                    }
                    return Err(e);
                }
            }
        }
        Err(self.exhausted(attempt, last_malformed))
    }

    /// Swarm statistics for up to 74 info hashes, in request order
    pub async fn scrape(&self, info_hashes: &[InfoHash]) -> Result<Vec<ScrapeStats>> {
        if info_hashes.is_empty() || info_hashes.len() > MAX_SCRAPE_HASHES {
            return Err(TorrentError::config_error_with_field(
                format!(
                    "scrape takes 1 to {} info hashes, got {}",
                    MAX_SCRAPE_HASHES,
                    info_hashes.len()
                ),
                "info_hashes",
            ));
        }

        let mut attempt = 0;
        let mut last_malformed = None;
        while self.policy.retry_budget(attempt) {
            let connection_id = self.connect().await?;
            let reply = self
                .exchange(attempt, |transaction_id| {
                    ScrapeRequest {
                        connection_id,
                        transaction_id,
                        info_hashes: info_hashes.to_vec(),
                    }
                    .encode()
                })
                .await;
            attempt += 1;

            match self.settle::<ScrapeResponse>(reply, &mut last_malformed) {
                Ok(Step::Done(response)) if response.files.len() == info_hashes.len() => {
                    debug!(
                        "Scraped {} info hashes from {}",
                        info_hashes.len(),
                        self.tracker
                    );
                    return Ok(response.files);
                }
                Ok(Step::Done(response)) => {
                    warn!(
                        "Tracker {} returned {} scrape entries for {} hashes",
                        self.tracker,
                        response.files.len(),
                        info_hashes.len()
                    );
                    last_malformed = Some(TorrentError::malformed(format!(
                        "{} scrape entries for {} hashes",
                        response.files.len(),
                        info_hashes.len()
                    )));
                }
                Ok(Step::Retry) => {}
                Err(e) => {
                    if e.is_tracker_final() {
                        self.forget_connection().await;
                    }
                    return Err(e);
                }
            }
        }
        Err(self.exhausted(attempt, last_malformed))
    }

    fn announce_request(
        &self,
        connection_id: u64,
        transaction_id: u32,
        params: &AnnounceParams,
    ) -> AnnounceRequest {
        AnnounceRequest {
            connection_id,
            transaction_id,
            info_hash: params.info_hash,
            peer_id: params.peer_id,
            downloaded: params.downloaded,
            left: params.left,
            uploaded: params.uploaded,
            event: params.event,
            ip: params.ip,
            key: self.key,
            num_want: params.num_want,
            port: params.port,
            url_data: self.url_data.clone(),
        }
    }

    /// Send one attempt under a fresh transaction id and wait for its reply.
    ///
    /// `None` means the attempt window closed without a matching datagram.
    /// A failed send counts as a lost datagram.
    async fn exchange(&self, attempt: u32, build: impl FnOnce(u32) -> Bytes) -> Option<Inbound> {
        let mut pending = self.dispatcher.register(self.tracker);
        let transaction_id = pending.transaction_id();
        let window = self.policy.next_timeout(attempt);
        debug!(
            "Attempt {}/{} to {}: transaction {:#010x}, waiting {:?}",
            attempt + 1,
            self.policy.max_attempts(),
            self.tracker,
            transaction_id,
            window
        );
        if let Err(e) = self.dispatcher.send(&build(transaction_id), self.tracker).await {
            warn!(
                "Sending transaction {:#010x} to {} failed: {}",
                transaction_id, self.tracker, e
            );
        }
        pending.wait(window).await
    }

    /// Classify a matched reply. Malformed replies count as lost.
    fn settle<R: Wire>(
        &self,
        reply: Option<Inbound>,
        last_malformed: &mut Option<TorrentError>,
    ) -> Result<Step<R>> {
        let decoded = match reply {
            None => {
                *last_malformed = None;
                return Ok(Step::Retry);
            }
            Some(Ok(datagram)) => decode_reply::<R>(&datagram),
            Some(Err(e)) => Err(e),
        };
        match decoded {
            Ok(Reply::Ok(response)) => Ok(Step::Done(response)),
            Ok(Reply::Error(error)) => {
                warn!("Tracker {} returned error: {}", self.tracker, error.message);
                Err(TorrentError::TrackerError(error.message))
            }
            Err(e) if e.is_wire_error() => {
                warn!("Discarding malformed reply from {}: {}", self.tracker, e);
                *last_malformed = Some(e);
                Ok(Step::Retry)
            }
            Err(e) => Err(e),
        }
    }

    fn exhausted(&self, attempts: u32, last_malformed: Option<TorrentError>) -> TorrentError {
        match last_malformed {
            Some(TorrentError::MalformedResponse(message)) => TorrentError::MalformedResponse(message),
            Some(other) => TorrentError::malformed(other.to_string()),
            None => {
                warn!(
                    "Tracker {} unreachable after {} attempts",
                    self.tracker, attempts
                );
                TorrentError::TrackerUnreachable { attempts }
            }
        }
    }

    async fn forget_connection(&self) {
        *self.connection.lock().await = None;
    }
}
