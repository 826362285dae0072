//! Error types for piece bookkeeping and the tracker protocol
//!
//! Every fallible operation in the crate returns [`TorrentError`]. The
//! variants fall into four groups: static configuration errors raised at
//! construction, caller misuse of the piece table or address space, wire
//! format violations, and final tracker outcomes.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, TorrentError>;

/// Error type for all torrent core operations
#[derive(Debug, Error)]
pub enum TorrentError {
    /// The file layout handed to the address space is unusable
    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    /// Piece or chunk geometry is unusable
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// A logical byte range extends past the end of the address space
    #[error("range {offset}+{length} out of range (total {total})")]
    OutOfRange { offset: u64, length: u64, total: u64 },

    /// Piece index outside the table
    #[error("unknown piece {index}")]
    UnknownPiece { index: u32 },

    /// Chunk that was never part of the piece's decomposition
    #[error("unknown chunk {begin}+{length} in piece {index}")]
    UnknownChunk { index: u32, begin: u32, length: u32 },

    /// `begin_hashing` without a preceding `request_hash`
    #[error("piece {index} was not queued for hashing")]
    NotQueued { index: u32 },

    /// `complete_hashing` without a running pass
    #[error("piece {index} is not being hashed")]
    NotHashing { index: u32 },

    /// Fewer bytes than the structure requires
    #[error("truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// Compact peer data whose length is not a multiple of 6
    #[error("malformed peer list: {len} bytes is not a multiple of 6")]
    MalformedPeerList { len: usize },

    /// Response action differs from the one the request expects
    #[error("action mismatch: expected {expected}, got {actual}")]
    ActionMismatch { expected: u32, actual: u32 },

    /// Any other malformed datagram
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The tracker answered with an error action
    #[error("tracker error: {0}")]
    TrackerError(String),

    /// Retry budget exhausted without a usable response
    #[error("tracker unreachable after {attempts} attempts")]
    TrackerUnreachable { attempts: u32 },

    /// A 20-byte identifier built from a slice of another length
    #[error("invalid hash length: expected 20 bytes, got {0}")]
    InvalidHashLength(usize),

    /// Tracker URL that cannot be used for the UDP protocol
    #[error("invalid tracker url '{url}': {reason}")]
    InvalidTrackerUrl { url: String, reason: String },

    /// Invalid configuration value
    #[error("config error: {message}")]
    Config { message: String, field: Option<String> },

    /// Socket or file I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl TorrentError {
    /// Create a new InvalidLayout error
    pub fn invalid_layout(message: impl Into<String>) -> Self {
        TorrentError::InvalidLayout(message.into())
    }

    /// Create a new InvalidGeometry error
    pub fn invalid_geometry(message: impl Into<String>) -> Self {
        TorrentError::InvalidGeometry(message.into())
    }

    /// Create a new MalformedResponse error
    pub fn malformed(message: impl Into<String>) -> Self {
        TorrentError::MalformedResponse(message.into())
    }

    /// Create a new InvalidTrackerUrl error
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        TorrentError::InvalidTrackerUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        TorrentError::Config {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::Config {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Whether this is a wire-format violation.
    ///
    /// These never end a tracker exchange on their own: the datagram is
    /// treated as absent and the retry cycle continues.
    pub fn is_wire_error(&self) -> bool {
        matches!(
            self,
            TorrentError::Truncated { .. }
                | TorrentError::MalformedPeerList { .. }
                | TorrentError::ActionMismatch { .. }
                | TorrentError::MalformedResponse(_)
        )
    }

    /// Whether this is a final tracker outcome
    pub fn is_tracker_final(&self) -> bool {
        matches!(
            self,
            TorrentError::TrackerError(_) | TorrentError::TrackerUnreachable { .. }
        )
    }
}
