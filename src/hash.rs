//! 20-byte identifiers
//!
//! Info hashes, piece hashes and peer ids share the same shape but are kept
//! as distinct types so they cannot be mixed up at call sites.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::info;

use crate::error::{Result, TorrentError};

/// Length of every identifier in this module
pub const HASH_LEN: usize = 20;

/// Client prefix used when generating peer ids
pub const PEER_ID_PREFIX: &[u8; 8] = b"-PT0100-";

fn copy_exact(bytes: &[u8]) -> Result<[u8; HASH_LEN]> {
    <[u8; HASH_LEN]>::try_from(bytes).map_err(|_| TorrentError::InvalidHashLength(bytes.len()))
}

fn parse_hex(hex_str: &str) -> Result<[u8; HASH_LEN]> {
    let bytes = hex::decode(hex_str).map_err(|e| {
        TorrentError::config_error(format!("invalid hex '{}': {}", hex_str, e))
    })?;
    copy_exact(&bytes)
}

/// Identifier of the shared content set
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InfoHash(pub [u8; HASH_LEN]);

impl InfoHash {
    pub fn new(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Build from a slice, failing unless it is exactly 20 bytes long
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        copy_exact(bytes).map(Self)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        parse_hex(hex_str).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Expected SHA-1 digest of one piece
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PieceHash(pub [u8; HASH_LEN]);

impl PieceHash {
    pub fn new(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Build from a slice, failing unless it is exactly 20 bytes long
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        copy_exact(bytes).map(Self)
    }

    /// Split the concatenated `pieces` string of a metainfo into hashes
    pub fn split_concatenated(pieces: &[u8]) -> Result<Vec<Self>> {
        if pieces.len() % HASH_LEN != 0 {
            return Err(TorrentError::InvalidHashLength(pieces.len()));
        }
        pieces.chunks_exact(HASH_LEN).map(Self::from_slice).collect()
    }

    /// SHA-1 of `data`
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&hasher.finalize());
        Self(out)
    }

    /// Whether `data` hashes to this digest
    pub fn matches(&self, data: &[u8]) -> bool {
        Self::digest(data) == *self
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PieceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PieceHash({})", self.to_hex())
    }
}

/// Our client's peer id
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; HASH_LEN]);

impl PeerId {
    pub fn new(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        copy_exact(bytes).map(Self)
    }

    /// Generate a random, client-prefixed peer id
    pub fn generate() -> Self {
        let mut id = [0u8; HASH_LEN];
        id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
        rand::thread_rng().fill(&mut id[PEER_ID_PREFIX.len()..]);
        info!("Generated new peer ID: {}", hex::encode(id));
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", String::from_utf8_lossy(&self.0))
    }
}
