//! Multi-file address space
//!
//! Presents the ordered files of a torrent as one contiguous logical byte
//! range and splits logical ranges into per-file segments. Nothing here
//! touches the filesystem; [`FileStorage`](crate::storage::FileStorage)
//! performs the I/O for the segments this module produces.

use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::error::{Result, TorrentError};
use crate::storage::piece::Request;

/// One physical file of the layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path segments relative to the download directory
    pub path: Vec<String>,
    /// Declared length in bytes
    pub length: u64,
}

impl FileEntry {
    pub fn new(path: Vec<String>, length: u64) -> Self {
        Self { path, length }
    }

    /// Build from a signed length as found in metainfo integers
    pub fn try_from_signed(path: Vec<String>, length: i64) -> Result<Self> {
        let length = u64::try_from(length).map_err(|_| {
            TorrentError::invalid_layout(format!(
                "file '{}' has negative length {}",
                path.join("/"),
                length
            ))
        })?;
        Ok(Self { path, length })
    }

    fn validate(&self) -> Result<()> {
        if self.path.is_empty() {
            return Err(TorrentError::invalid_layout("file with empty path"));
        }
        for segment in &self.path {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(TorrentError::invalid_layout(format!(
                    "bad path segment '{}' in '{}'",
                    segment,
                    self.path.join("/")
                )));
            }
            if segment.contains('/') || segment.contains('\\') {
                return Err(TorrentError::invalid_layout(format!(
                    "path segment '{}' contains a separator",
                    segment
                )));
            }
        }
        Ok(())
    }
}

/// Part of a logical range that falls inside one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSegment {
    pub file_index: usize,
    pub file_offset: u64,
    pub length: u64,
}

/// Ordered files viewed as one logical byte range
#[derive(Debug, Clone)]
pub struct AddressSpace {
    files: Vec<FileEntry>,
    /// `starts[i]` is the logical offset of file `i`
    starts: Vec<u64>,
    total_length: u64,
}

impl AddressSpace {
    /// Build the address space from files in their fixed order
    pub fn build(files: Vec<FileEntry>) -> Result<Self> {
        if files.is_empty() {
            return Err(TorrentError::invalid_layout("no files in layout"));
        }

        let mut starts = Vec::with_capacity(files.len());
        let mut total_length: u64 = 0;
        for file in &files {
            file.validate()?;
            starts.push(total_length);
            total_length = total_length.checked_add(file.length).ok_or_else(|| {
                TorrentError::invalid_layout("total length overflows 64 bits")
            })?;
        }

        debug!(
            "Built address space over {} files ({} bytes)",
            files.len(),
            total_length
        );
        Ok(Self {
            files,
            starts,
            total_length,
        })
    }

    /// Sum of all file lengths
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn file(&self, index: usize) -> Option<&FileEntry> {
        self.files.get(index)
    }

    /// Logical offset at which file `index` starts
    pub fn file_offset(&self, index: usize) -> Option<u64> {
        self.starts.get(index).copied()
    }

    /// Location of file `index` below `base`
    pub fn file_path(&self, base: &Path, index: usize) -> Option<PathBuf> {
        self.files
            .get(index)
            .map(|file| file.path.iter().fold(base.to_path_buf(), |acc, seg| acc.join(seg)))
    }

    /// Split `[offset, offset + length)` into per-file segments.
    ///
    /// Segments come back in logical order and never cross a file boundary.
    /// Zero-length files are skipped.
    pub fn resolve(&self, offset: u64, length: u64) -> Result<Vec<FileSegment>> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= self.total_length)
            .ok_or(TorrentError::OutOfRange {
                offset,
                length,
                total: self.total_length,
            })?;

        let mut segments = Vec::new();
        if length == 0 {
            return Ok(segments);
        }

        // First file whose end lies past `offset`.
        let mut index = self.starts.partition_point(|start| *start <= offset) - 1;
        let mut cursor = offset;
        while cursor < end {
            let start = self.starts[index];
            let file_len = self.files[index].length;
            let file_end = start + file_len;
            if file_end > cursor {
                let seg_len = file_end.min(end) - cursor;
                trace!(
                    "Segment: file {} offset {} length {}",
                    index,
                    cursor - start,
                    seg_len
                );
                segments.push(FileSegment {
                    file_index: index,
                    file_offset: cursor - start,
                    length: seg_len,
                });
                cursor += seg_len;
            }
            index += 1;
        }

        Ok(segments)
    }

    /// Resolve a chunk request given the torrent's nominal piece length
    pub fn piece_segments(&self, piece_length: u64, request: &Request) -> Result<Vec<FileSegment>> {
        let offset = u64::from(request.piece_index)
            .checked_mul(piece_length)
            .and_then(|o| o.checked_add(u64::from(request.chunk.begin)))
            .ok_or(TorrentError::OutOfRange {
                offset: u64::MAX,
                length: u64::from(request.chunk.length),
                total: self.total_length,
            })?;
        self.resolve(offset, u64::from(request.chunk.length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::piece::ChunkSpec;

    fn entry(name: &str, length: u64) -> FileEntry {
        FileEntry::new(vec![name.to_string()], length)
    }

    fn three_files() -> AddressSpace {
        AddressSpace::build(vec![entry("a", 10), entry("b", 5), entry("c", 20)]).unwrap()
    }

    #[test]
    fn test_build_empty_fails() {
        let err = AddressSpace::build(vec![]).unwrap_err();
        assert!(matches!(err, TorrentError::InvalidLayout(_)));
    }

    #[test]
    fn test_negative_length_fails() {
        let err = FileEntry::try_from_signed(vec!["a".into()], -1).unwrap_err();
        assert!(matches!(err, TorrentError::InvalidLayout(_)));
        assert_eq!(
            FileEntry::try_from_signed(vec!["a".into()], 7).unwrap().length,
            7
        );
    }

    #[test]
    fn test_traversal_path_rejected() {
        let bad = FileEntry::new(vec!["..".into(), "etc".into()], 1);
        assert!(AddressSpace::build(vec![bad]).is_err());
        let empty = FileEntry::new(vec![], 1);
        assert!(AddressSpace::build(vec![empty]).is_err());
    }

    #[test]
    fn test_total_length() {
        assert_eq!(three_files().total_length(), 35);
        assert_eq!(three_files().file_offset(2), Some(15));
    }

    #[test]
    fn test_resolve_within_single_file() {
        let space = three_files();
        let segments = space.resolve(2, 4).unwrap();
        assert_eq!(
            segments,
            vec![FileSegment {
                file_index: 0,
                file_offset: 2,
                length: 4
            }]
        );
    }

    #[test]
    fn test_resolve_spans_files() {
        let space = three_files();
        let segments = space.resolve(8, 10).unwrap();
        assert_eq!(
            segments,
            vec![
                FileSegment { file_index: 0, file_offset: 8, length: 2 },
                FileSegment { file_index: 1, file_offset: 0, length: 5 },
                FileSegment { file_index: 2, file_offset: 0, length: 3 },
            ]
        );
    }

    #[test]
    fn test_resolve_starting_on_boundary() {
        let space = three_files();
        let segments = space.resolve(10, 5).unwrap();
        assert_eq!(
            segments,
            vec![FileSegment { file_index: 1, file_offset: 0, length: 5 }]
        );
    }

    #[test]
    fn test_resolve_out_of_range() {
        let space = three_files();
        assert!(space.resolve(0, 35).is_ok());
        let err = space.resolve(30, 6).unwrap_err();
        assert!(matches!(
            err,
            TorrentError::OutOfRange { offset: 30, length: 6, total: 35 }
        ));
        assert!(space.resolve(u64::MAX, 2).is_err());
    }

    #[test]
    fn test_resolve_zero_length() {
        let space = three_files();
        assert!(space.resolve(35, 0).unwrap().is_empty());
        assert!(space.resolve(36, 0).is_err());
    }

    #[test]
    fn test_zero_length_files_skipped() {
        let space =
            AddressSpace::build(vec![entry("a", 4), entry("empty", 0), entry("b", 4)]).unwrap();
        let segments = space.resolve(2, 4).unwrap();
        assert_eq!(
            segments,
            vec![
                FileSegment { file_index: 0, file_offset: 2, length: 2 },
                FileSegment { file_index: 2, file_offset: 0, length: 2 },
            ]
        );
    }

    #[test]
    fn test_segments_reassemble_logical_range() {
        let space = three_files();
        let logical: Vec<u8> = (0..35u8).collect();
        let physical: Vec<Vec<u8>> = vec![
            logical[0..10].to_vec(),
            logical[10..15].to_vec(),
            logical[15..35].to_vec(),
        ];

        for offset in 0..35u64 {
            for length in 0..=(35 - offset) {
                let segments = space.resolve(offset, length).unwrap();
                let mut rebuilt = Vec::new();
                for seg in &segments {
                    let file = &physical[seg.file_index];
                    let start = seg.file_offset as usize;
                    let end = start + seg.length as usize;
                    assert!(end <= file.len(), "segment crosses file end");
                    rebuilt.extend_from_slice(&file[start..end]);
                }
                let expected = &logical[offset as usize..(offset + length) as usize];
                assert_eq!(rebuilt, expected);
            }
        }
    }

    #[test]
    fn test_piece_segments() {
        let space = three_files();
        let request = Request::new(1, ChunkSpec::new(2, 8));
        // piece length 8: piece 1 starts at 8, chunk at 10..18
        let segments = space.piece_segments(8, &request).unwrap();
        assert_eq!(
            segments,
            vec![
                FileSegment { file_index: 1, file_offset: 0, length: 5 },
                FileSegment { file_index: 2, file_offset: 0, length: 3 },
            ]
        );
    }

    #[test]
    fn test_file_path() {
        let space = AddressSpace::build(vec![FileEntry::new(
            vec!["dir".into(), "file.bin".into()],
            3,
        )])
        .unwrap();
        let path = space.file_path(Path::new("/tmp/base"), 0).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/base/dir/file.bin"));
        assert!(space.file_path(Path::new("/tmp"), 1).is_none());
    }
}
