//! Piece table
//!
//! Tracks, per piece, which chunks are still outstanding and where the piece
//! stands in its hash-verification lifecycle. A piece only counts as
//! complete once it has no pending chunks *and* has been hashed at least
//! once. No I/O happens here.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::error::{Result, TorrentError};
use crate::hash::PieceHash;
use crate::storage::layout::AddressSpace;

/// Default chunk size ceiling (16 KiB)
pub const CHUNK_SIZE: u32 = 0x4000;

/// Piece table guarded by a single writer lock
pub type SharedPieceTable = Arc<RwLock<PieceTable>>;

/// Span of bytes within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkSpec {
    /// Offset within the piece
    pub begin: u32,
    /// Length of the chunk
    pub length: u32,
}

impl ChunkSpec {
    pub fn new(begin: u32, length: u32) -> Self {
        Self { begin, length }
    }

    pub fn end(&self) -> u64 {
        u64::from(self.begin) + u64::from(self.length)
    }
}

/// A chunk of a specific piece, as requested from a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Request {
    pub piece_index: u32,
    pub chunk: ChunkSpec,
}

impl Request {
    pub fn new(piece_index: u32, chunk: ChunkSpec) -> Self {
        Self { piece_index, chunk }
    }
}

/// Partition `[0, piece_length)` into chunks of at most `chunk_size` bytes.
///
/// `chunk_size` must be non-zero; [`PieceTable::new`] rejects zero.
pub(crate) fn chunk_specs(piece_length: u32, chunk_size: u32) -> Vec<ChunkSpec> {
    let mut specs = Vec::with_capacity(piece_length.div_ceil(chunk_size) as usize);
    let mut begin = 0u32;
    while begin < piece_length {
        let length = chunk_size.min(piece_length - begin);
        specs.push(ChunkSpec::new(begin, length));
        begin += length;
    }
    specs
}

/// Whether `chunk` belongs to the decomposition of a piece of `length` bytes
fn in_decomposition(chunk_size: u32, length: u32, chunk: &ChunkSpec) -> bool {
    chunk.begin % chunk_size == 0
        && chunk.begin < length
        && chunk.length == chunk_size.min(length - chunk.begin)
}

/// Bookkeeping for one piece
#[derive(Debug, Clone)]
pub struct Piece {
    /// Expected SHA-1 hash
    pub hash: PieceHash,
    /// Length of this piece in bytes
    pub length: u32,
    /// Chunks not yet known to be stored locally
    pending_chunks: BTreeSet<ChunkSpec>,
    /// A verification pass is running
    hashing: bool,
    /// A verification pass was requested but has not started
    queued_for_hash: bool,
    /// At least one verification pass has finished
    ever_hashed: bool,
}

impl Piece {
    fn new(hash: PieceHash, length: u32, chunk_size: u32) -> Self {
        Self {
            hash,
            length,
            pending_chunks: chunk_specs(length, chunk_size).into_iter().collect(),
            hashing: false,
            queued_for_hash: false,
            ever_hashed: false,
        }
    }

    /// No pending chunks and verified at least once
    pub fn is_complete(&self) -> bool {
        self.pending_chunks.is_empty() && self.ever_hashed
    }

    pub fn is_hashing(&self) -> bool {
        self.hashing
    }

    pub fn is_queued_for_hash(&self) -> bool {
        self.queued_for_hash
    }

    pub fn ever_hashed(&self) -> bool {
        self.ever_hashed
    }

    /// Pending chunks in offset order
    pub fn pending_chunks(&self) -> impl Iterator<Item = &ChunkSpec> {
        self.pending_chunks.iter()
    }

    pub fn pending_chunk_count(&self) -> usize {
        self.pending_chunks.len()
    }

    pub fn bytes_pending(&self) -> u64 {
        self.pending_chunks.iter().map(|c| u64::from(c.length)).sum()
    }
}

/// Per-piece verification and chunk state for one torrent
#[derive(Debug, Clone)]
pub struct PieceTable {
    pieces: Vec<Piece>,
    piece_length: u32,
    last_piece_length: u32,
    chunk_size: u32,
}

impl PieceTable {
    /// Build the table from piece hashes and piece geometry.
    ///
    /// Every piece but the last is `piece_length` bytes long; the last one
    /// is `last_piece_length` bytes.
    pub fn new(
        piece_hashes: Vec<PieceHash>,
        piece_length: u32,
        last_piece_length: u32,
        chunk_size: u32,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(TorrentError::invalid_geometry("chunk size must be positive"));
        }
        if piece_length == 0 {
            return Err(TorrentError::invalid_geometry("piece length must be positive"));
        }
        if !piece_hashes.is_empty() && (last_piece_length == 0 || last_piece_length > piece_length)
        {
            return Err(TorrentError::invalid_geometry(format!(
                "last piece length {} not in 1..={}",
                last_piece_length, piece_length
            )));
        }
        if u32::try_from(piece_hashes.len()).is_err() {
            return Err(TorrentError::invalid_geometry("too many pieces"));
        }

        let num_pieces = piece_hashes.len();
        let pieces: Vec<Piece> = piece_hashes
            .into_iter()
            .enumerate()
            .map(|(index, hash)| {
                let length = if index + 1 == num_pieces {
                    last_piece_length
                } else {
                    piece_length
                };
                Piece::new(hash, length, chunk_size)
            })
            .collect();

        debug!(
            "Initialized piece table: {} pieces, piece length {}, last {}, chunk {}",
            pieces.len(),
            piece_length,
            last_piece_length,
            chunk_size
        );

        Ok(Self {
            pieces,
            piece_length,
            last_piece_length,
            chunk_size,
        })
    }

    /// Build the table for an address space, deriving the last piece length
    /// from its total size.
    pub fn for_layout(
        piece_hashes: Vec<PieceHash>,
        piece_length: u32,
        layout: &AddressSpace,
        chunk_size: u32,
    ) -> Result<Self> {
        if piece_length == 0 {
            return Err(TorrentError::invalid_geometry("piece length must be positive"));
        }
        let total = layout.total_length();
        let expected = total.div_ceil(u64::from(piece_length));
        if expected != piece_hashes.len() as u64 {
            return Err(TorrentError::invalid_geometry(format!(
                "{} bytes at piece length {} needs {} pieces, got {}",
                total,
                piece_length,
                expected,
                piece_hashes.len()
            )));
        }
        let remainder = (total % u64::from(piece_length)) as u32;
        let last_piece_length = if remainder == 0 { piece_length } else { remainder };
        Self::new(piece_hashes, piece_length, last_piece_length, chunk_size)
    }

    fn piece(&self, index: u32) -> Result<&Piece> {
        self.pieces
            .get(index as usize)
            .ok_or(TorrentError::UnknownPiece { index })
    }

    fn piece_mut(&mut self, index: u32) -> Result<&mut Piece> {
        self.pieces
            .get_mut(index as usize)
            .ok_or(TorrentError::UnknownPiece { index })
    }

    /// Read-only view of a piece
    pub fn get(&self, index: u32) -> Option<&Piece> {
        self.pieces.get(index as usize)
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Nominal piece length
    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn last_piece_length(&self) -> u32 {
        self.last_piece_length
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Length of piece `index`
    pub fn piece_len(&self, index: u32) -> Result<u32> {
        self.piece(index).map(|p| p.length)
    }

    /// Logical byte offset of piece `index`
    pub fn piece_offset(&self, index: u32) -> Result<u64> {
        self.piece(index)?;
        Ok(u64::from(index) * u64::from(self.piece_length))
    }

    /// Mark `chunk` of piece `index` as stored. Reporting the same chunk
    /// again is a no-op.
    pub fn chunk_completed(&mut self, index: u32, chunk: ChunkSpec) -> Result<()> {
        let chunk_size = self.chunk_size;
        let piece = self.piece_mut(index)?;
        if !in_decomposition(chunk_size, piece.length, &chunk) {
            return Err(TorrentError::UnknownChunk {
                index,
                begin: chunk.begin,
                length: chunk.length,
            });
        }
        if piece.pending_chunks.remove(&chunk) {
            trace!(
                "Piece {} chunk {}+{} completed, {} pending",
                index,
                chunk.begin,
                chunk.length,
                piece.pending_chunks.len()
            );
        }
        Ok(())
    }

    /// Ask for a verification pass of piece `index`.
    ///
    /// Returns true only when the piece goes from neither queued nor hashing
    /// to queued; the caller must then schedule the pass.
    pub fn request_hash(&mut self, index: u32) -> Result<bool> {
        let piece = self.piece_mut(index)?;
        if piece.hashing || piece.queued_for_hash {
            trace!("Piece {} already queued or hashing", index);
            return Ok(false);
        }
        piece.queued_for_hash = true;
        debug!("Piece {} queued for hashing", index);
        Ok(true)
    }

    /// Move piece `index` from queued to hashing
    pub fn begin_hashing(&mut self, index: u32) -> Result<()> {
        let piece = self.piece_mut(index)?;
        if !piece.queued_for_hash {
            return Err(TorrentError::NotQueued { index });
        }
        piece.queued_for_hash = false;
        piece.hashing = true;
        trace!("Piece {} hashing started", index);
        Ok(())
    }

    /// Record the outcome of the pass started by [`begin_hashing`](Self::begin_hashing).
    ///
    /// A failed pass puts every chunk of the piece back into the pending set.
    pub fn complete_hashing(&mut self, index: u32, verified: bool) -> Result<()> {
        let chunk_size = self.chunk_size;
        let piece = self.piece_mut(index)?;
        if !piece.hashing {
            return Err(TorrentError::NotHashing { index });
        }
        piece.hashing = false;
        piece.ever_hashed = true;
        if verified {
            debug!("Piece {} verification: PASSED", index);
        } else {
            warn!("Piece {} verification: FAILED (hash mismatch)", index);
            piece.pending_chunks = chunk_specs(piece.length, chunk_size).into_iter().collect();
        }
        Ok(())
    }

    /// Whether piece `index` is fully stored and verified
    pub fn is_complete(&self, index: u32) -> Result<bool> {
        self.piece(index).map(Piece::is_complete)
    }

    /// Sum of the lengths of the pending chunks of piece `index`
    pub fn piece_bytes_pending(&self, index: u32) -> Result<u64> {
        self.piece(index).map(Piece::bytes_pending)
    }

    /// Pending chunks of piece `index`, in offset order
    pub fn pending_chunks(&self, index: u32) -> Result<Vec<ChunkSpec>> {
        self.piece(index).map(|p| p.pending_chunks().copied().collect())
    }

    /// Pending chunks of piece `index` as peer requests
    pub fn pending_requests(&self, index: u32) -> Result<Vec<Request>> {
        self.piece(index)
            .map(|p| p.pending_chunks().map(|c| Request::new(index, *c)).collect())
    }

    /// Full decomposition of piece `index`
    pub fn all_chunks(&self, index: u32) -> Result<Vec<ChunkSpec>> {
        self.piece(index).map(|p| chunk_specs(p.length, self.chunk_size))
    }

    /// Whether `request` is a chunk of the table's decomposition
    pub fn is_valid_request(&self, request: &Request) -> bool {
        self.get(request.piece_index)
            .map(|p| in_decomposition(self.chunk_size, p.length, &request.chunk))
            .unwrap_or(false)
    }

    /// Order two pieces by pending bytes, ties broken by index.
    ///
    /// Unknown indices sort after every known piece.
    pub fn cmp_by_bytes_pending(&self, a: u32, b: u32) -> Ordering {
        let key = |i: u32| self.get(i).map(Piece::bytes_pending).unwrap_or(u64::MAX);
        key(a).cmp(&key(b)).then(a.cmp(&b))
    }

    /// Sort piece indices by pending bytes, fewest first
    pub fn sort_by_bytes_pending(&self, indices: &mut [u32]) {
        indices.sort_by(|a, b| self.cmp_by_bytes_pending(*a, *b));
    }

    pub fn completed_count(&self) -> usize {
        self.pieces.iter().filter(|p| p.is_complete()).count()
    }

    /// Whether every piece is complete
    pub fn is_all_complete(&self) -> bool {
        self.pieces.iter().all(Piece::is_complete)
    }

    /// Bitfield of complete pieces, most significant bit first
    pub fn bitfield(&self) -> Vec<u8> {
        let mut bitfield = vec![0u8; self.pieces.len().div_ceil(8)];
        for (i, piece) in self.pieces.iter().enumerate() {
            if piece.is_complete() {
                bitfield[i / 8] |= 1 << (7 - (i % 8));
            }
        }
        bitfield
    }

    /// Fraction of complete pieces (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.pieces.is_empty() {
            0.0
        } else {
            self.completed_count() as f64 / self.pieces.len() as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::layout::FileEntry;

    fn hashes(n: usize) -> Vec<PieceHash> {
        (0..n).map(|i| PieceHash([i as u8; 20])).collect()
    }

    fn table() -> PieceTable {
        PieceTable::new(hashes(2), 32 * 1024, 20000, CHUNK_SIZE).unwrap()
    }

    fn finish_all_chunks(table: &mut PieceTable, index: u32) {
        for chunk in table.all_chunks(index).unwrap() {
            table.chunk_completed(index, chunk).unwrap();
        }
    }

    #[test]
    fn test_chunk_specs_even_piece() {
        assert_eq!(
            chunk_specs(32 * 1024, CHUNK_SIZE),
            vec![ChunkSpec::new(0, 16384), ChunkSpec::new(16384, 16384)]
        );
    }

    #[test]
    fn test_chunk_specs_truncated_piece() {
        assert_eq!(
            chunk_specs(20000, CHUNK_SIZE),
            vec![ChunkSpec::new(0, 16384), ChunkSpec::new(16384, 3616)]
        );
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(matches!(
            PieceTable::new(hashes(1), 16384, 16384, 0).unwrap_err(),
            TorrentError::InvalidGeometry(_)
        ));
    }

    #[test]
    fn test_table_geometry() {
        let table = table();
        assert_eq!(
            table.pending_chunks(0).unwrap(),
            vec![ChunkSpec::new(0, 16384), ChunkSpec::new(16384, 16384)]
        );
        assert_eq!(
            table.pending_chunks(1).unwrap(),
            vec![ChunkSpec::new(0, 16384), ChunkSpec::new(16384, 3616)]
        );
        assert_eq!(table.piece_len(1).unwrap(), 20000);
        assert_eq!(table.piece_offset(1).unwrap(), 32768);
    }

    #[test]
    fn test_invalid_geometry() {
        for (piece, last, chunk) in [(0, 0, 16384), (16384, 16384, 0), (100, 0, 10), (100, 101, 10)] {
            let err = PieceTable::new(hashes(1), piece, last, chunk).unwrap_err();
            assert!(matches!(err, TorrentError::InvalidGeometry(_)));
        }
        assert!(PieceTable::new(vec![], 100, 0, 10).is_ok());
    }

    #[test]
    fn test_for_layout() {
        let layout = AddressSpace::build(vec![
            FileEntry::new(vec!["a".into()], 40000),
            FileEntry::new(vec!["b".into()], 12768),
        ])
        .unwrap();
        let table = PieceTable::for_layout(hashes(2), 32768, &layout, CHUNK_SIZE).unwrap();
        assert_eq!(table.last_piece_length(), 20000);

        let err = PieceTable::for_layout(hashes(3), 32768, &layout, CHUNK_SIZE).unwrap_err();
        assert!(matches!(err, TorrentError::InvalidGeometry(_)));
    }

    #[test]
    fn test_not_complete_until_hashed() {
        let mut table = table();
        finish_all_chunks(&mut table, 0);
        assert_eq!(table.piece_bytes_pending(0).unwrap(), 0);
        assert!(!table.is_complete(0).unwrap());

        assert!(table.request_hash(0).unwrap());
        table.begin_hashing(0).unwrap();
        assert!(!table.is_complete(0).unwrap());
        table.complete_hashing(0, true).unwrap();
        assert!(table.is_complete(0).unwrap());
    }

    #[test]
    fn test_hashed_but_pending_not_complete() {
        let mut table = table();
        table.request_hash(0).unwrap();
        table.begin_hashing(0).unwrap();
        table.complete_hashing(0, true).unwrap();
        assert!(table.get(0).unwrap().ever_hashed());
        assert!(!table.is_complete(0).unwrap());
    }

    #[test]
    fn test_chunk_completed_idempotent() {
        let mut once = table();
        let mut twice = table();
        let chunk = ChunkSpec::new(16384, 3616);
        once.chunk_completed(1, chunk).unwrap();
        twice.chunk_completed(1, chunk).unwrap();
        twice.chunk_completed(1, chunk).unwrap();
        assert_eq!(once.pending_chunks(1).unwrap(), twice.pending_chunks(1).unwrap());
        assert_eq!(twice.piece_bytes_pending(1).unwrap(), 16384);
    }

    #[test]
    fn test_chunk_completed_unknown() {
        let mut table = table();
        assert!(matches!(
            table.chunk_completed(2, ChunkSpec::new(0, 16384)).unwrap_err(),
            TorrentError::UnknownPiece { index: 2 }
        ));
        for chunk in [
            ChunkSpec::new(1, 16384),
            ChunkSpec::new(0, 100),
            ChunkSpec::new(16384, 16384),
            ChunkSpec::new(32768, 1),
        ] {
            assert!(matches!(
                table.chunk_completed(1, chunk).unwrap_err(),
                TorrentError::UnknownChunk { index: 1, .. }
            ));
        }
    }

    #[test]
    fn test_failed_hash_restores_full_decomposition() {
        let mut table = table();
        let full = table.pending_chunks(1).unwrap();
        table.chunk_completed(1, ChunkSpec::new(0, 16384)).unwrap();
        assert_eq!(table.pending_chunks(1).unwrap().len(), 1);

        table.request_hash(1).unwrap();
        table.begin_hashing(1).unwrap();
        table.complete_hashing(1, false).unwrap();
        assert_eq!(table.pending_chunks(1).unwrap(), full);
        assert!(!table.is_complete(1).unwrap());

        finish_all_chunks(&mut table, 1);
        table.request_hash(1).unwrap();
        table.begin_hashing(1).unwrap();
        table.complete_hashing(1, false).unwrap();
        assert_eq!(table.pending_chunks(1).unwrap(), full);
    }

    #[test]
    fn test_complete_hashing_requires_running_pass() {
        let mut table = table();
        finish_all_chunks(&mut table, 0);
        assert!(matches!(
            table.complete_hashing(0, true).unwrap_err(),
            TorrentError::NotHashing { index: 0 }
        ));
        assert!(!table.get(0).unwrap().ever_hashed());
        assert!(!table.is_complete(0).unwrap());

        // Queued is not enough either.
        table.request_hash(0).unwrap();
        assert!(matches!(
            table.complete_hashing(0, true).unwrap_err(),
            TorrentError::NotHashing { index: 0 }
        ));

        table.begin_hashing(0).unwrap();
        table.complete_hashing(0, true).unwrap();
        assert!(table.is_complete(0).unwrap());
        // A second completion of the same pass is rejected.
        assert!(matches!(
            table.complete_hashing(0, false).unwrap_err(),
            TorrentError::NotHashing { index: 0 }
        ));
        assert!(table.is_complete(0).unwrap());
    }

    #[test]
    fn test_request_hash_dedupes() {
        let mut table = table();
        assert!(table.request_hash(0).unwrap());
        assert!(!table.request_hash(0).unwrap());
        table.begin_hashing(0).unwrap();
        assert!(!table.request_hash(0).unwrap());
        assert!(!table.get(0).unwrap().is_queued_for_hash());

        table.complete_hashing(0, true).unwrap();
        assert!(table.request_hash(0).unwrap());
    }

    #[test]
    fn test_begin_hashing_requires_queue() {
        let mut table = table();
        assert!(matches!(
            table.begin_hashing(0).unwrap_err(),
            TorrentError::NotQueued { index: 0 }
        ));
        table.request_hash(0).unwrap();
        table.begin_hashing(0).unwrap();
        assert!(table.get(0).unwrap().is_hashing());
        assert!(matches!(
            table.begin_hashing(0).unwrap_err(),
            TorrentError::NotQueued { index: 0 }
        ));
        assert!(matches!(
            table.begin_hashing(5).unwrap_err(),
            TorrentError::UnknownPiece { index: 5 }
        ));
    }

    #[test]
    fn test_sort_by_bytes_pending() {
        let mut table = PieceTable::new(hashes(4), 32768, 32768, CHUNK_SIZE).unwrap();
        table.chunk_completed(2, ChunkSpec::new(0, 16384)).unwrap();
        table.chunk_completed(3, ChunkSpec::new(0, 16384)).unwrap();
        finish_all_chunks(&mut table, 1);

        let mut order = vec![0, 1, 2, 3];
        table.sort_by_bytes_pending(&mut order);
        assert_eq!(order, vec![1, 2, 3, 0]);
        assert_eq!(table.cmp_by_bytes_pending(3, 2), Ordering::Greater);
        assert_eq!(table.cmp_by_bytes_pending(0, 9), Ordering::Less);
    }

    #[test]
    fn test_pending_requests() {
        let table = table();
        let requests = table.pending_requests(1).unwrap();
        assert_eq!(
            requests,
            vec![
                Request::new(1, ChunkSpec::new(0, 16384)),
                Request::new(1, ChunkSpec::new(16384, 3616)),
            ]
        );
        assert!(table.is_valid_request(&requests[1]));
        assert!(!table.is_valid_request(&Request::new(1, ChunkSpec::new(16384, 16384))));
        assert!(!table.is_valid_request(&Request::new(7, ChunkSpec::new(0, 16384))));
    }

    #[test]
    fn test_bitfield_and_progress() {
        let mut table = PieceTable::new(hashes(3), 16384, 16384, CHUNK_SIZE).unwrap();
        assert_eq!(table.bitfield(), vec![0u8]);
        assert_eq!(table.progress(), 0.0);

        finish_all_chunks(&mut table, 0);
        table.request_hash(0).unwrap();
        table.begin_hashing(0).unwrap();
        table.complete_hashing(0, true).unwrap();

        assert_eq!(table.bitfield(), vec![0b1000_0000]);
        assert_eq!(table.completed_count(), 1);
        assert!((table.progress() - 1.0 / 3.0).abs() < 0.001);
        assert!(!table.is_all_complete());
    }

    #[test]
    fn test_request_is_structural_map_key() {
        use std::collections::HashMap;
        let mut outstanding = HashMap::new();
        outstanding.insert(Request::new(1, ChunkSpec::new(0, 16384)), "peer-a");
        assert_eq!(
            outstanding.get(&Request::new(1, ChunkSpec::new(0, 16384))),
            Some(&"peer-a")
        );
        assert!(outstanding.get(&Request::new(1, ChunkSpec::new(0, 3616))).is_none());
    }
}
