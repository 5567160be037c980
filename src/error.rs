//! Error taxonomy.
//!
//! Every component gets its own `thiserror` enum, the way the teacher splits
//! `SuperblockError` from `CodecError` rather than using one grab-bag enum.
//! `DwarfsError` aggregates them at API boundaries where callers need a
//! single return type (e.g. `Filesystem::open`, `Writer::create`).

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SectionError {
    #[error("bad section magic")]
    BadMagic,
    #[error("unsupported section type tag {0}")]
    UnknownType(u8),
    #[error("section checksum mismatch (type {section_type:?}, offset {offset})")]
    ChecksumMismatch { section_type: u8, offset: u64 },
    #[error("section length {0} exceeds remaining image bytes")]
    Truncated(u64),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unknown codec tag {0}")]
    UnknownTag(u8),
    #[error("codec {0} is required by this image but not compiled in")]
    Unavailable(String),
    #[error("compression failed: {0}")]
    CompressFailed(String),
    #[error("decompression failed: {0}")]
    DecodeFailed(String),
}

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("corrupt metadata: {0}")]
    Corrupt(String),
    #[error("inode {0} out of range")]
    OutOfRangeInode(u32),
    #[error("chunk index {0} out of range")]
    OutOfRangeChunk(u32),
    #[error("block index {0} out of range")]
    OutOfRangeBlock(u32),
    #[error("schema field {0} has unsupported bit width {1}")]
    BadBitWidth(&'static str, u8),
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("block {block} decode error: {source}")]
    Decode { block: u32, source: CodecError },
    #[error("requested range {begin}..{end} exceeds block size {size}")]
    OutOfRange { begin: u64, end: u64, size: u64 },
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("{path}: {source}")]
    Io { path: String, source: io::Error },
    #[error("{path}: unsupported file type, skipped")]
    UnsupportedType { path: String },
    #[error("invalid filter pattern {0:?}: {1}")]
    BadPattern(String, glob::PatternError),
    #[error("invalid chmod spec: {0}")]
    BadChmodSpec(String),
}

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("failed to map image: {0}")]
    Map(#[from] io::Error),
    #[error("image is empty")]
    Empty,
}

#[derive(Error, Debug)]
pub enum DwarfsError {
    #[error("bad image magic — not a DwarFS archive")]
    BadMagic,
    #[error("unsupported image version {0}")]
    UnsupportedVersion(u32),
    #[error(transparent)]
    Section(#[from] SectionError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("operation cancelled")]
    Cancelled,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, DwarfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_compose() {
        let e: DwarfsError = SectionError::BadMagic.into();
        assert!(matches!(e, DwarfsError::Section(SectionError::BadMagic)));
    }
}
