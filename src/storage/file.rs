//! File storage module
//!
//! Performs the disk I/O for the segments an [`AddressSpace`] resolves, and
//! runs verification passes for the piece table.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, error, info, trace};

use crate::error::{Result, TorrentError};
use crate::storage::layout::{AddressSpace, FileSegment};
use crate::storage::piece::{PieceTable, Request};

/// Files of one torrent below a base directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    /// Base download directory
    base_path: PathBuf,
    layout: Arc<AddressSpace>,
}

impl FileStorage {
    pub fn new(base_path: PathBuf, layout: Arc<AddressSpace>) -> Self {
        Self { base_path, layout }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn layout(&self) -> &Arc<AddressSpace> {
        &self.layout
    }

    fn segment_path(&self, segment: &FileSegment) -> Result<PathBuf> {
        self.layout
            .file_path(&self.base_path, segment.file_index)
            .ok_or_else(|| TorrentError::invalid_layout(format!("no file {}", segment.file_index)))
    }

    /// Create every file with its declared length.
    ///
    /// Missing directories are created. Existing files are grown when
    /// shorter than declared and never truncated.
    pub async fn create_files(&self) -> Result<()> {
        info!(
            "Creating {} files under {}",
            self.layout.files().len(),
            self.base_path.display()
        );

        for (index, entry) in self.layout.files().iter().enumerate() {
            let file_path = self
                .layout
                .file_path(&self.base_path, index)
                .ok_or_else(|| TorrentError::invalid_layout(format!("no file {}", index)))?;

            if let Some(parent) = file_path.parent() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    error!("Failed to create directory '{}': {}", parent.display(), e);
                    e
                })?;
            }

            let file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&file_path)
                .await
                .map_err(|e| {
                    error!("Failed to create file '{}': {}", file_path.display(), e);
                    e
                })?;

            let current = file.metadata().await?.len();
            if current < entry.length {
                debug!(
                    "Growing {} from {} to {} bytes",
                    file_path.display(),
                    current,
                    entry.length
                );
                file.set_len(entry.length).await.map_err(|e| {
                    error!("Failed to set file length for '{}': {}", file_path.display(), e);
                    e
                })?;
            } else {
                trace!("{} already {} bytes", file_path.display(), current);
            }
        }

        info!("File structure created successfully");
        Ok(())
    }

    /// Write `data` at logical `offset`
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let segments = self.layout.resolve(offset, data.len() as u64)?;
        let mut written = 0usize;
        for segment in &segments {
            let file_path = self.segment_path(segment)?;
            let len = segment.length as usize;
            trace!(
                "Writing {} bytes to {} at offset {}",
                len,
                file_path.display(),
                segment.file_offset
            );

            let mut file = fs::OpenOptions::new()
                .write(true)
                .open(&file_path)
                .await
                .map_err(|e| {
                    error!("Failed to open file '{}': {}", file_path.display(), e);
                    e
                })?;
            file.seek(SeekFrom::Start(segment.file_offset)).await?;
            file.write_all(&data[written..written + len]).await.map_err(|e| {
                error!("Failed to write to file '{}': {}", file_path.display(), e);
                e
            })?;
            file.flush().await?;
            written += len;
        }
        Ok(())
    }

    /// Read `length` bytes at logical `offset`
    pub async fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let segments = self.layout.resolve(offset, length as u64)?;
        let mut buffer = vec![0u8; length];
        let mut filled = 0usize;
        for segment in &segments {
            let file_path = self.segment_path(segment)?;
            let len = segment.length as usize;
            trace!(
                "Reading {} bytes from {} at offset {}",
                len,
                file_path.display(),
                segment.file_offset
            );

            let mut file = fs::File::open(&file_path).await.map_err(|e| {
                error!("Failed to open file '{}': {}", file_path.display(), e);
                e
            })?;
            file.seek(SeekFrom::Start(segment.file_offset)).await?;
            file.read_exact(&mut buffer[filled..filled + len])
                .await
                .map_err(|e| {
                    error!("Failed to read from file '{}': {}", file_path.display(), e);
                    e
                })?;
            filled += len;
        }
        Ok(buffer)
    }

    /// Store one received chunk and mark it completed in `table`.
    ///
    /// Returns true when the piece has no pending chunks left.
    pub async fn write_chunk(
        &self,
        table: &RwLock<PieceTable>,
        request: &Request,
        data: &[u8],
    ) -> Result<bool> {
        let index = request.piece_index;
        let offset = {
            let table = table.read().await;
            if !table.is_valid_request(request) {
                return Err(TorrentError::UnknownChunk {
                    index,
                    begin: request.chunk.begin,
                    length: request.chunk.length,
                });
            }
            table.piece_offset(index)? + u64::from(request.chunk.begin)
        };
        if data.len() != request.chunk.length as usize {
            return Err(TorrentError::invalid_geometry(format!(
                "chunk {}+{} of piece {} got {} bytes",
                request.chunk.begin,
                request.chunk.length,
                index,
                data.len()
            )));
        }

        self.write_at(offset, data).await?;

        let mut table = table.write().await;
        table.chunk_completed(index, request.chunk)?;
        Ok(table.piece_bytes_pending(index)? == 0)
    }

    /// Read the whole of piece `index`
    pub async fn read_piece(&self, table: &PieceTable, index: u32) -> Result<Vec<u8>> {
        let offset = table.piece_offset(index)?;
        let length = table.piece_len(index)?;
        self.read_at(offset, length as usize).await
    }

    /// Run one verification pass of piece `index`.
    ///
    /// Returns `None` when a pass is already queued or running, otherwise
    /// whether the stored bytes matched the expected hash. An unreadable
    /// piece counts as a failed pass.
    pub async fn hash_piece(&self, table: &RwLock<PieceTable>, index: u32) -> Result<Option<bool>> {
        let (offset, length, expected) = {
            let mut table = table.write().await;
            if !table.request_hash(index)? {
                return Ok(None);
            }
            table.begin_hashing(index)?;
            let piece = table.get(index).ok_or(TorrentError::UnknownPiece { index })?;
            (table.piece_offset(index)?, piece.length, piece.hash)
        };

        debug!("Verifying piece {}", index);
        let data = match self.read_at(offset, length as usize).await {
            Ok(data) => data,
            Err(e) => {
                table.write().await.complete_hashing(index, false)?;
                return Err(e);
            }
        };

        let verified = expected.matches(&data);
        let mut table = table.write().await;
        table.complete_hashing(index, verified)?;
        debug!(
            "Piece {} checked, {:.1}% of pieces complete",
            index,
            table.progress() * 100.0
        );
        Ok(Some(verified))
    }
}
