//! Metadata schema (part of C4/C13) — describes the bit-width and layout
//! of every packed table so the container is self-describing: a reader
//! never hardcodes field widths, it reads them from the `SCHEMA` section
//! that always precedes `METADATA` in the image.
//!
//! Open Question decision (see `SPEC_FULL.md`): bit widths are the
//! smallest byte-aligned integer (`u8`/`u16`/`u32`/`u64`) that fits the
//! observed maximum value for a table, not an arbitrary sub-byte bit
//! count — this keeps the frozen accessors simple, aligned reads.

use crate::error::MetadataError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    pub fn bytes(self) -> usize {
        match self {
            Width::W8 => 1,
            Width::W16 => 2,
            Width::W32 => 4,
            Width::W64 => 8,
        }
    }

    /// Smallest width that can hold `max_value`.
    pub fn for_max(max_value: u64) -> Width {
        if max_value <= u8::MAX as u64 {
            Width::W8
        } else if max_value <= u16::MAX as u64 {
            Width::W16
        } else if max_value <= u32::MAX as u64 {
            Width::W32
        } else {
            Width::W64
        }
    }
}

/// Every table this container can carry. Order here is not significant;
/// each field's byte offset within the `METADATA` section is recorded
/// explicitly in `FieldSchema::offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum TableId {
    Entries,
    DirEntries,
    Directories,
    ChunkTable,
    Chunks,
    SymlinkTable,
    Symlinks,
    Names,
    Uids,
    Gids,
    Modes,
    Devices,
    SharedFilesTable,
}

impl TableId {
    pub fn name(self) -> &'static str {
        match self {
            TableId::Entries => "entries",
            TableId::DirEntries => "dir_entries",
            TableId::Directories => "directories",
            TableId::ChunkTable => "chunk_table",
            TableId::Chunks => "chunks",
            TableId::SymlinkTable => "symlink_table",
            TableId::Symlinks => "symlinks",
            TableId::Names => "names",
            TableId::Uids => "uids",
            TableId::Gids => "gids",
            TableId::Modes => "modes",
            TableId::Devices => "devices",
            TableId::SharedFilesTable => "shared_files_table",
        }
    }
}

/// A single column: `count` packed integers of `width` bytes each, starting
/// at `offset` within the metadata payload (after the fixed scalar header).
/// Tables with more than one column per row (e.g. `chunks` = block/offset/
/// size triples) are stored as `columns` side-by-side sub-fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSchema {
    pub table: TableId,
    pub column: &'static str,
    pub width: Width,
    pub count: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<FieldSchema>,
}

impl Schema {
    pub fn field(&self, table: TableId, column: &'static str) -> Result<&FieldSchema, MetadataError> {
        self.fields
            .iter()
            .find(|f| f.table == table && f.column == column)
            .ok_or(MetadataError::Corrupt(format!(
                "schema missing {}.{}",
                table.name(),
                column
            )))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("schema serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MetadataError> {
        serde_json::from_slice(bytes).map_err(|e| MetadataError::Corrupt(e.to_string()))
    }

    pub fn total_payload_bytes(&self) -> usize {
        self.fields
            .iter()
            .map(|f| f.offset + f.count * f.width.bytes())
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_selection_picks_smallest() {
        assert_eq!(Width::for_max(0), Width::W8);
        assert_eq!(Width::for_max(255), Width::W8);
        assert_eq!(Width::for_max(256), Width::W16);
        assert_eq!(Width::for_max(u32::MAX as u64), Width::W32);
        assert_eq!(Width::for_max(u32::MAX as u64 + 1), Width::W64);
    }

    #[test]
    fn schema_round_trips_through_json() {
        let schema = Schema {
            fields: vec![FieldSchema {
                table: TableId::Names,
                column: "offset",
                width: Width::W32,
                count: 10,
                offset: 0,
            }],
        };
        let bytes = schema.to_bytes();
        let back = Schema::from_bytes(&bytes).unwrap();
        assert_eq!(back.fields.len(), 1);
        assert_eq!(back.total_payload_bytes(), 40);
    }
}
