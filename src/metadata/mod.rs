//! Metadata container (C4) and builder (C13).
//!
//! Replaces the teacher's flat, serde/JSON-backed `FileIndex`
//! (`index/mod.rs`, dropped in the final trim) with the frozen, bit-packed
//! table set spec.md §3 mandates: `entries`, `dir_entries`, `directories`,
//! `chunk_table`, `chunks`, `symlink_table`, `symlinks`, `names`, `uids`,
//! `gids`, `modes`, `devices`, `shared_files_table`.

pub mod builder;
pub mod frozen;
pub mod schema;

pub use builder::MetadataBuilder;
pub use frozen::FrozenMetadata;
pub use schema::{Schema, TableId, Width};
