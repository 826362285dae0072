//! Storage module
//!
//! Piece bookkeeping, the multi-file address space, and the file I/O that
//! sits on top of both.

pub mod file;
pub mod layout;
pub mod piece;

pub use file::FileStorage;
pub use layout::{AddressSpace, FileEntry, FileSegment};
pub use piece::{ChunkSpec, Piece, PieceTable, Request, SharedPieceTable, CHUNK_SIZE};
