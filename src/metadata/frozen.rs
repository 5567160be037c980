//! Frozen metadata (C4) — zero-copy accessors over the packed byte blob
//! produced by `metadata::builder`. No table is ever copied or parsed into
//! owned Rust structures; every accessor does O(1) bit-unpacking directly
//! against the borrowed payload (which, on the read side, is itself a
//! `&[u8]` slice of a `MappedImage`).

use super::schema::{FieldSchema, Schema, TableId, Width};
use crate::error::MetadataError;

/// One packed column of fixed-width little-endian integers.
#[derive(Debug, Clone, Copy)]
pub struct PackedArray<'a> {
    width: Width,
    bytes: &'a [u8],
    count: usize,
}

impl<'a> PackedArray<'a> {
    fn new(payload: &'a [u8], field: &FieldSchema) -> Result<Self, MetadataError> {
        let span = field.count * field.width.bytes();
        let end = field.offset + span;
        if end > payload.len() {
            return Err(MetadataError::Corrupt(format!(
                "field {}.{} extends past metadata payload ({}..{} > {})",
                field.table.name(),
                field.column,
                field.offset,
                end,
                payload.len()
            )));
        }
        Ok(Self {
            width: field.width,
            bytes: &payload[field.offset..end],
            count: field.count,
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, index: usize) -> Option<u64> {
        if index >= self.count {
            return None;
        }
        let w = self.width.bytes();
        let start = index * w;
        let slice = &self.bytes[start..start + w];
        Some(match self.width {
            Width::W8 => slice[0] as u64,
            Width::W16 => u16::from_le_bytes(slice.try_into().unwrap()) as u64,
            Width::W32 => u32::from_le_bytes(slice.try_into().unwrap()) as u64,
            Width::W64 => u64::from_le_bytes(slice.try_into().unwrap()),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.count).map(move |i| self.get(i).unwrap())
    }
}

/// Fixed-size scalar header preceding the packed tables within the
/// `METADATA` section payload.
pub const SCALAR_HEADER_SIZE: usize = 24;

pub struct ScalarHeader {
    pub block_size: u32,
    pub timestamp_base: u64,
    pub total_fs_size: u64,
    pub options: u32,
}

impl ScalarHeader {
    pub fn encode(&self) -> [u8; SCALAR_HEADER_SIZE] {
        let mut buf = [0u8; SCALAR_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.block_size.to_le_bytes());
        buf[4..12].copy_from_slice(&self.timestamp_base.to_le_bytes());
        buf[12..20].copy_from_slice(&self.total_fs_size.to_le_bytes());
        buf[20..24].copy_from_slice(&self.options.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MetadataError> {
        if buf.len() < SCALAR_HEADER_SIZE {
            return Err(MetadataError::Corrupt("metadata scalar header truncated".into()));
        }
        Ok(Self {
            block_size: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            timestamp_base: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
            total_fs_size: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
            options: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
        })
    }
}

pub struct FrozenMetadata<'a> {
    pub schema: &'a Schema,
    pub scalars: ScalarHeader,
    payload: &'a [u8],
}

macro_rules! column {
    ($self:ident, $table:expr, $col:literal) => {
        PackedArray::new($self.payload, $self.schema.field($table, $col)?)
    };
}

impl<'a> FrozenMetadata<'a> {
    pub fn open(schema: &'a Schema, section_bytes: &'a [u8]) -> Result<Self, MetadataError> {
        if section_bytes.len() < SCALAR_HEADER_SIZE {
            return Err(MetadataError::Corrupt("metadata section too small".into()));
        }
        let scalars = ScalarHeader::decode(section_bytes)?;
        let payload = &section_bytes[SCALAR_HEADER_SIZE..];
        Ok(Self {
            schema,
            scalars,
            payload,
        })
    }

    pub fn entry_name_index(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::Entries, "name_index")
    }
    pub fn entry_mode_index(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::Entries, "mode_index")
    }
    pub fn entry_uid_index(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::Entries, "uid_index")
    }
    pub fn entry_gid_index(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::Entries, "gid_index")
    }
    pub fn entry_mtime_offset(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::Entries, "mtime_offset")
    }
    pub fn entry_inode(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::Entries, "inode")
    }

    pub fn dir_entry_parent(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::DirEntries, "parent")
    }
    pub fn dir_entry_entry_index(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::DirEntries, "entry_index")
    }

    pub fn directory_first_entry(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::Directories, "first_entry")
    }
    pub fn directory_entry_count(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::Directories, "entry_count")
    }

    pub fn chunk_table(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::ChunkTable, "offset")
    }
    pub fn chunk_block(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::Chunks, "block")
    }
    pub fn chunk_offset(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::Chunks, "offset")
    }
    pub fn chunk_size(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::Chunks, "size")
    }

    pub fn symlink_table(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::SymlinkTable, "symlink_index")
    }
    pub fn symlink_offset(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::Symlinks, "offset")
    }
    pub fn symlink_length(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::Symlinks, "length")
    }

    pub fn names_offset(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::Names, "offset")
    }
    pub fn names_length(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::Names, "length")
    }

    pub fn uids(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::Uids, "value")
    }
    pub fn gids(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::Gids, "value")
    }
    pub fn modes(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::Modes, "value")
    }

    pub fn device_id(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::Devices, "device_id")
    }

    pub fn shared_files_table(&self) -> Result<PackedArray<'a>, MetadataError> {
        column!(self, TableId::SharedFilesTable, "inode")
    }

    /// Raw bytes of the string pool backing `names[]`/`symlinks[]`, stored
    /// immediately after every packed table (its own "table" has no fixed
    /// width, so it isn't represented as a `PackedArray`).
    pub fn string_pool(&self) -> &'a [u8] {
        let end = self.schema.total_payload_bytes();
        &self.payload[end.min(self.payload.len())..]
    }

    pub fn name_str(&self, index: usize) -> Result<&'a str, MetadataError> {
        let offs = self.names_offset()?;
        let lens = self.names_length()?;
        let offset = offs
            .get(index)
            .ok_or(MetadataError::Corrupt("name index out of range".into()))? as usize;
        let length = lens.get(index).unwrap_or(0) as usize;
        let pool = self.string_pool();
        pool.get(offset..offset + length)
            .and_then(|b| std::str::from_utf8(b).ok())
            .ok_or(MetadataError::Corrupt("name string out of range or invalid utf8".into()))
    }

    pub fn symlink_str(&self, symlink_index: usize) -> Result<&'a str, MetadataError> {
        let offs = self.symlink_offset()?;
        let lens = self.symlink_length()?;
        let offset = offs
            .get(symlink_index)
            .ok_or(MetadataError::Corrupt("symlink index out of range".into()))? as usize;
        let length = lens.get(symlink_index).unwrap_or(0) as usize;
        let pool = self.string_pool();
        pool.get(offset..offset + length)
            .and_then(|b| std::str::from_utf8(b).ok())
            .ok_or(MetadataError::Corrupt("symlink string out of range or invalid utf8".into()))
    }

    /// Validate the cross-table invariants spec.md §3 requires: monotonic
    /// `chunk_table`, in-range directory/entry/symlink indices, and a
    /// `chunk_table` sized to `num_files + 1`.
    pub fn check_consistency(&self) -> Result<(), MetadataError> {
        let chunk_table = self.chunk_table()?;
        let mut prev = 0u64;
        for i in 0..chunk_table.len() {
            let v = chunk_table.get(i).unwrap();
            if v < prev {
                return Err(MetadataError::Corrupt(format!(
                    "chunk_table not monotonic at index {i}: {v} < {prev}"
                )));
            }
            prev = v;
        }

        let chunks = self.chunk_block()?;
        if let Some(&last) = chunk_table.iter().collect::<Vec<_>>().last() {
            if last > chunks.len() as u64 {
                return Err(MetadataError::Corrupt(
                    "chunk_table's final offset exceeds chunks[] length".into(),
                ));
            }
        }

        let dir_first = self.directory_first_entry()?;
        let dir_count = self.directory_entry_count()?;
        let dir_entries = self.dir_entry_entry_index()?;
        for i in 0..dir_first.len() {
            let first = dir_first.get(i).unwrap();
            let count = dir_count.get(i).unwrap();
            if first + count > dir_entries.len() as u64 {
                return Err(MetadataError::Corrupt(format!(
                    "directory {i} entry range {first}..{} exceeds dir_entries[]",
                    first + count
                )));
            }
        }

        let symlink_table = self.symlink_table()?;
        let symlink_offsets = self.symlink_offset()?;
        for i in 0..symlink_table.len() {
            let idx = symlink_table.get(i).unwrap();
            if idx >= symlink_offsets.len() as u64 {
                return Err(MetadataError::Corrupt(format!(
                    "symlink_table[{i}] references out-of-range symlink {idx}"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::builder::MetadataBuilder;

    #[test]
    fn open_and_check_consistency_on_builder_output() {
        let mut b = MetadataBuilder::new(1 << 20);
        let root = b.add_directory(None);
        let name = b.intern_name("hello.txt");
        let file_inode = b.add_file_entry(root, name, 0o100644, 0, 0, 0);
        b.add_chunk(file_inode, 0, 0, 5);
        b.finish_file_chunks(file_inode);
        let (schema, bytes) = b.build();

        let meta = FrozenMetadata::open(&schema, &bytes).unwrap();
        meta.check_consistency().unwrap();
        assert_eq!(meta.name_str(name as usize).unwrap(), "hello.txt");
    }
}
