//! piece-tracker
//!
//! Piece and chunk bookkeeping, a multi-file address space, and a UDP
//! tracker client (BEP 15) for BitTorrent.

pub mod cli;
pub mod config;
pub mod error;
pub mod hash;
pub mod storage;
pub mod tracker;

pub use error::{Result, TorrentError};

pub use cli::{CliArgs, Config};
pub use config::TrackerConfig;
pub use hash::{InfoHash, PeerId, PieceHash};
pub use storage::{
    AddressSpace, ChunkSpec, FileEntry, FileSegment, FileStorage, PieceTable, Request,
    SharedPieceTable, CHUNK_SIZE,
};
pub use tracker::{
    AnnounceEvent, AnnounceParams, AnnounceResponse, CompactPeer, Dispatcher, RetryPolicy,
    ScrapeStats, TrackerSession, TrackerUrl, Transport,
};
