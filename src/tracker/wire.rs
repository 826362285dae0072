//! UDP tracker wire format (BEP 15, with BEP 41 announce options)
//!
//! Fixed-width, big-endian structures. Everything here is pure: no state,
//! no I/O. Decoders report how many bytes they consumed and distinguish a
//! short buffer ([`TorrentError::Truncated`]) from a malformed one.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::{Result, TorrentError};
use crate::hash::{InfoHash, PeerId, HASH_LEN};

/// Connection id every connect request carries
pub const PROTOCOL_ID: u64 = 0x0417_2710_1980;

/// Size of the action + transaction id prefix of every response
pub const HEADER_LEN: usize = 8;
pub const CONNECT_LEN: usize = 16;
pub const ANNOUNCE_REQUEST_LEN: usize = 98;
pub const ANNOUNCE_RESPONSE_HEADER_LEN: usize = 20;
pub const COMPACT_PEER_LEN: usize = 6;
pub const SCRAPE_STATS_LEN: usize = 12;
/// Most info hashes one scrape request may carry
pub const MAX_SCRAPE_HASHES: usize = 74;

const OPTION_END: u8 = 0x0;
const OPTION_NOP: u8 = 0x1;
const OPTION_URL_DATA: u8 = 0x2;

/// Request/response action codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Action {
    Connect = 0,
    Announce = 1,
    Scrape = 2,
    Error = 3,
}

impl Action {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for Action {
    type Error = TorrentError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Action::Connect),
            1 => Ok(Action::Announce),
            2 => Ok(Action::Scrape),
            3 => Ok(Action::Error),
            _ => Err(TorrentError::malformed(format!("unknown action {}", value))),
        }
    }
}

/// Announce event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum AnnounceEvent {
    #[default]
    None = 0,
    Completed = 1,
    Started = 2,
    Stopped = 3,
}

impl TryFrom<u32> for AnnounceEvent {
    type Error = TorrentError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(AnnounceEvent::None),
            1 => Ok(AnnounceEvent::Completed),
            2 => Ok(AnnounceEvent::Started),
            3 => Ok(AnnounceEvent::Stopped),
            _ => Err(TorrentError::malformed(format!("unknown event {}", value))),
        }
    }
}

/// One peer in compact form: IPv4 address and port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompactPeer {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl CompactPeer {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl From<SocketAddrV4> for CompactPeer {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

/// Write peers in compact form
pub fn encode_compact_peers(peers: &[CompactPeer], buf: &mut BytesMut) {
    for peer in peers {
        buf.put_slice(&peer.ip.octets());
        buf.put_u16(peer.port);
    }
}

/// Parse a compact peer list that spans all of `bytes`
pub fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<CompactPeer>> {
    if bytes.len() % COMPACT_PEER_LEN != 0 {
        return Err(TorrentError::MalformedPeerList { len: bytes.len() });
    }
    Ok(bytes
        .chunks_exact(COMPACT_PEER_LEN)
        .map(|c| CompactPeer::new(Ipv4Addr::new(c[0], c[1], c[2], c[3]), u16::from_be_bytes([c[4], c[5]])))
        .collect())
}

fn ensure(bytes: &[u8], needed: usize) -> Result<()> {
    if bytes.len() < needed {
        return Err(TorrentError::Truncated {
            needed,
            available: bytes.len(),
        });
    }
    Ok(())
}

fn expect_action(buf: &mut &[u8], expected: Action) -> Result<()> {
    let actual = buf.get_u32();
    if actual != expected.code() {
        return Err(TorrentError::ActionMismatch {
            expected: expected.code(),
            actual,
        });
    }
    Ok(())
}

fn get_hash(buf: &mut &[u8]) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    buf.copy_to_slice(&mut out);
    out
}

/// A fixed-layout tracker protocol structure
pub trait Wire: Sized {
    /// Action code this structure carries
    const ACTION: Action;
    /// Smallest valid encoding
    const MIN_LEN: usize;

    fn encode_into(&self, buf: &mut BytesMut);

    /// Decode from the front of `bytes`, returning the value and the number
    /// of bytes consumed
    fn decode(bytes: &[u8]) -> Result<(Self, usize)>;

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::MIN_LEN);
        self.encode_into(&mut buf);
        trace!("Encoded {:?} datagram: {} bytes", Self::ACTION, buf.len());
        buf.freeze()
    }
}

/// Action and transaction id that prefix every response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub action: u32,
    pub transaction_id: u32,
}

impl ResponseHeader {
    /// Read the header without consuming the datagram
    pub fn peek(bytes: &[u8]) -> Result<Self> {
        ensure(bytes, HEADER_LEN)?;
        let mut buf = bytes;
        Ok(Self {
            action: buf.get_u32(),
            transaction_id: buf.get_u32(),
        })
    }
}

/// Read the response header used to route a datagram
pub fn peek_header(bytes: &[u8]) -> Result<ResponseHeader> {
    ResponseHeader::peek(bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub transaction_id: u32,
}

impl Wire for ConnectRequest {
    const ACTION: Action = Action::Connect;
    const MIN_LEN: usize = CONNECT_LEN;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64(PROTOCOL_ID);
        buf.put_u32(Self::ACTION.code());
        buf.put_u32(self.transaction_id);
    }

    fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        ensure(bytes, CONNECT_LEN)?;
        let mut buf = bytes;
        let protocol_id = buf.get_u64();
        if protocol_id != PROTOCOL_ID {
            return Err(TorrentError::malformed(format!(
                "bad protocol id {:#x}",
                protocol_id
            )));
        }
        expect_action(&mut buf, Self::ACTION)?;
        let transaction_id = buf.get_u32();
        Ok((Self { transaction_id }, CONNECT_LEN))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    pub transaction_id: u32,
    pub connection_id: u64,
}

impl Wire for ConnectResponse {
    const ACTION: Action = Action::Connect;
    const MIN_LEN: usize = CONNECT_LEN;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32(Self::ACTION.code());
        buf.put_u32(self.transaction_id);
        buf.put_u64(self.connection_id);
    }

    fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        ensure(bytes, CONNECT_LEN)?;
        let mut buf = bytes;
        expect_action(&mut buf, Self::ACTION)?;
        let transaction_id = buf.get_u32();
        let connection_id = buf.get_u64();
        Ok((
            Self {
                transaction_id,
                connection_id,
            },
            CONNECT_LEN,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub connection_id: u64,
    pub transaction_id: u32,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: AnnounceEvent,
    /// Address to announce; `None` lets the tracker use the source address
    pub ip: Option<Ipv4Addr>,
    pub key: u32,
    /// Peers wanted; -1 asks for the tracker's default
    pub num_want: i32,
    pub port: u16,
    /// Path and query of the tracker URL, sent as BEP 41 URL-data options.
    /// An empty string sends no option.
    pub url_data: Option<String>,
}

impl Wire for AnnounceRequest {
    const ACTION: Action = Action::Announce;
    const MIN_LEN: usize = ANNOUNCE_REQUEST_LEN;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64(self.connection_id);
        buf.put_u32(Self::ACTION.code());
        buf.put_u32(self.transaction_id);
        buf.put_slice(self.info_hash.as_bytes());
        buf.put_slice(self.peer_id.as_bytes());
        buf.put_u64(self.downloaded);
        buf.put_u64(self.left);
        buf.put_u64(self.uploaded);
        buf.put_u32(self.event as u32);
        buf.put_u32(self.ip.map(u32::from).unwrap_or(0));
        buf.put_u32(self.key);
        buf.put_i32(self.num_want);
        buf.put_u16(self.port);

        if let Some(url_data) = self.url_data.as_deref() {
            for part in url_data.as_bytes().chunks(u8::MAX as usize) {
                buf.put_u8(OPTION_URL_DATA);
                buf.put_u8(part.len() as u8);
                buf.put_slice(part);
            }
        }
    }

    fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        ensure(bytes, ANNOUNCE_REQUEST_LEN)?;
        let mut buf = bytes;
        let connection_id = buf.get_u64();
        expect_action(&mut buf, Self::ACTION)?;
        let transaction_id = buf.get_u32();
        let info_hash = InfoHash::new(get_hash(&mut buf));
        let peer_id = PeerId::new(get_hash(&mut buf));
        let downloaded = buf.get_u64();
        let left = buf.get_u64();
        let uploaded = buf.get_u64();
        let event = AnnounceEvent::try_from(buf.get_u32())?;
        let ip = match buf.get_u32() {
            0 => None,
            raw => Some(Ipv4Addr::from(raw)),
        };
        let key = buf.get_u32();
        let num_want = buf.get_i32();
        let port = buf.get_u16();

        let mut url_data: Option<Vec<u8>> = None;
        while buf.has_remaining() {
            match buf.get_u8() {
                OPTION_END => break,
                OPTION_NOP => {}
                OPTION_URL_DATA => {
                    if !buf.has_remaining() {
                        return Err(TorrentError::Truncated {
                            needed: bytes.len() + 1,
                            available: bytes.len(),
                        });
                    }
                    let len = buf.get_u8() as usize;
                    if buf.remaining() < len {
                        return Err(TorrentError::Truncated {
                            needed: bytes.len() - buf.remaining() + len,
                            available: bytes.len(),
                        });
                    }
                    url_data
                        .get_or_insert_with(Vec::new)
                        .extend_from_slice(&buf[..len]);
                    buf.advance(len);
                }
                other => {
                    return Err(TorrentError::malformed(format!(
                        "unknown announce option {:#x}",
                        other
                    )))
                }
            }
        }
        let url_data = url_data
            .map(String::from_utf8)
            .transpose()
            .map_err(|e| TorrentError::malformed(format!("url data is not utf-8: {}", e)))?;

        let consumed = bytes.len() - buf.remaining();
        Ok((
            Self {
                connection_id,
                transaction_id,
                info_hash,
                peer_id,
                downloaded,
                left,
                uploaded,
                event,
                ip,
                key,
                num_want,
                port,
                url_data,
            },
            consumed,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub transaction_id: u32,
    /// Seconds to wait before the next announce
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub peers: Vec<CompactPeer>,
}

impl AnnounceResponse {
    pub fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.peers.iter().map(CompactPeer::socket_addr).collect()
    }
}

impl Wire for AnnounceResponse {
    const ACTION: Action = Action::Announce;
    const MIN_LEN: usize = ANNOUNCE_RESPONSE_HEADER_LEN;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.peers.len() * COMPACT_PEER_LEN);
        buf.put_u32(Self::ACTION.code());
        buf.put_u32(self.transaction_id);
        buf.put_u32(self.interval);
        buf.put_u32(self.leechers);
        buf.put_u32(self.seeders);
        encode_compact_peers(&self.peers, buf);
    }

    fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        ensure(bytes, ANNOUNCE_RESPONSE_HEADER_LEN)?;
        let mut buf = bytes;
        expect_action(&mut buf, Self::ACTION)?;
        let transaction_id = buf.get_u32();
        let interval = buf.get_u32();
        let leechers = buf.get_u32();
        let seeders = buf.get_u32();
        let peers = parse_compact_peers(buf)?;
        Ok((
            Self {
                transaction_id,
                interval,
                leechers,
                seeders,
                peers,
            },
            bytes.len(),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeRequest {
    pub connection_id: u64,
    pub transaction_id: u32,
    pub info_hashes: Vec<InfoHash>,
}

impl Wire for ScrapeRequest {
    const ACTION: Action = Action::Scrape;
    const MIN_LEN: usize = 16;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.info_hashes.len() * HASH_LEN);
        buf.put_u64(self.connection_id);
        buf.put_u32(Self::ACTION.code());
        buf.put_u32(self.transaction_id);
        for info_hash in &self.info_hashes {
            buf.put_slice(info_hash.as_bytes());
        }
    }

    fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        ensure(bytes, Self::MIN_LEN)?;
        let mut buf = bytes;
        let connection_id = buf.get_u64();
        expect_action(&mut buf, Self::ACTION)?;
        let transaction_id = buf.get_u32();
        if buf.len() % HASH_LEN != 0 {
            return Err(TorrentError::malformed(format!(
                "scrape request carries {} trailing bytes",
                buf.len() % HASH_LEN
            )));
        }
        let info_hashes = buf
            .chunks_exact(HASH_LEN)
            .map(InfoHash::from_slice)
            .collect::<Result<Vec<_>>>()?;
        Ok((
            Self {
                connection_id,
                transaction_id,
                info_hashes,
            },
            bytes.len(),
        ))
    }
}

/// Swarm statistics for one info hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScrapeStats {
    pub seeders: u32,
    pub completed: u32,
    pub leechers: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeResponse {
    pub transaction_id: u32,
    /// One entry per requested info hash, in request order
    pub files: Vec<ScrapeStats>,
}

impl Wire for ScrapeResponse {
    const ACTION: Action = Action::Scrape;
    const MIN_LEN: usize = HEADER_LEN;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.files.len() * SCRAPE_STATS_LEN);
        buf.put_u32(Self::ACTION.code());
        buf.put_u32(self.transaction_id);
        for stats in &self.files {
            buf.put_u32(stats.seeders);
            buf.put_u32(stats.completed);
            buf.put_u32(stats.leechers);
        }
    }

    fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        ensure(bytes, HEADER_LEN)?;
        let mut buf = bytes;
        expect_action(&mut buf, Self::ACTION)?;
        let transaction_id = buf.get_u32();
        if buf.len() % SCRAPE_STATS_LEN != 0 {
            return Err(TorrentError::malformed(format!(
                "scrape response body of {} bytes is not a multiple of {}",
                buf.len(),
                SCRAPE_STATS_LEN
            )));
        }
        let mut files = Vec::with_capacity(buf.len() / SCRAPE_STATS_LEN);
        while buf.has_remaining() {
            files.push(ScrapeStats {
                seeders: buf.get_u32(),
                completed: buf.get_u32(),
                leechers: buf.get_u32(),
            });
        }
        Ok((
            Self {
                transaction_id,
                files,
            },
            bytes.len(),
        ))
    }
}

/// Tracker-reported failure with a human-readable message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub transaction_id: u32,
    pub message: String,
}

impl Wire for ErrorResponse {
    const ACTION: Action = Action::Error;
    const MIN_LEN: usize = HEADER_LEN;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32(Self::ACTION.code());
        buf.put_u32(self.transaction_id);
        buf.put_slice(self.message.as_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        ensure(bytes, HEADER_LEN)?;
        let mut buf = bytes;
        expect_action(&mut buf, Self::ACTION)?;
        let transaction_id = buf.get_u32();
        // Some trackers NUL-terminate the message.
        let message = String::from_utf8_lossy(buf)
            .trim_end_matches('\0')
            .to_string();
        Ok((
            Self {
                transaction_id,
                message,
            },
            bytes.len(),
        ))
    }
}

/// A matched response: the expected structure or a tracker error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<R> {
    Ok(R),
    Error(ErrorResponse),
}

/// Decode a response expected to be `R`, accepting an error action instead
pub fn decode_reply<R: Wire>(bytes: &[u8]) -> Result<Reply<R>> {
    let header = peek_header(bytes)?;
    if header.action == Action::Error.code() {
        let (error, _) = ErrorResponse::decode(bytes)?;
        return Ok(Reply::Error(error));
    }
    let (response, _) = R::decode(bytes)?;
    Ok(Reply::Ok(response))
}
