//! # dwarfs — a read-only, deduplicating, compressed archive filesystem
//!
//! Format guarantees:
//! - All numeric fields are little-endian; never negotiated
//! - Every block is self-describing: magic, version, codec tag, checksum
//! - Every section header carries a mandatory CRC32; corrupt headers abort reads
//! - Inode numbers are assigned by rank (directories, then symlinks, then
//!   regular files, then devices) so a reader never needs a per-entry type tag
//! - Identical file content collapses to one inode; hardlinks and
//!   content-dedup duplicates both go through the same `shared_files_table`
//!   mechanism, a reader can't tell them apart and doesn't need to
//! - An archive is written once, front to back, and never mutated in place

pub mod error;
pub mod progress;
pub mod worker;
pub mod codec;
pub mod section;
pub mod image;
pub mod history;
pub mod metadata;
pub mod segmenter;
pub mod similarity;
pub mod order;
pub mod scanner;
pub mod hasher;
pub mod block_manager;
pub mod block_cache;
pub mod inode_reader;
pub mod filesystem;
pub mod writer;

// Flat re-exports for the most common types.
pub use error::{DwarfsError, CodecError, SectionError, MetadataError, CacheError, ScanError, ImageError};
pub use progress::{Level, Progress};
pub use worker::{JobKind, Pool, WorkerStats};
pub use codec::{CodecKind, CodecTag, get_codec, get_codec_by_tag};
pub use section::{SectionType, SectionHeader, write_section, read_section};
pub use metadata::{MetadataBuilder, FrozenMetadata, Schema};
pub use scanner::{Entry, EntryKind, Filter, Scanner};
pub use hasher::{FileHandle, HashAlgo, Hasher, DedupResult, InodeAssignment};
pub use order::{OrderMode, OrderableFile, NilsimsaOptions, compute_order};
pub use similarity::{Signature, compute_signature};
pub use segmenter::{Segmenter, SegmenterConfig, SegEvent};
pub use block_manager::{BlockManager, BlockManagerConfig, ChunkRef};
pub use filesystem::{Filesystem, FilesystemOptions, Attr, FileKind};
pub use writer::{Writer, WriterOptions};
