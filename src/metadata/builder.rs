//! Metadata builder (C13) — assembles the packed tables `frozen.rs` reads
//! back with zero-copy accessors. Inodes are assigned by rank (directories,
//! then symlinks, then regular files, then devices) exactly as spec.md §3
//! requires, so no per-entry type tag needs to be stored: a reader can tell
//! an entry's kind from which inode range it falls into.

use super::schema::{FieldSchema, Schema, TableId, Width};
use super::frozen::{ScalarHeader, SCALAR_HEADER_SIZE};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
enum Kind {
    Dir(u32),
    Symlink(u32),
    File(u32),
    Device(u32),
}

struct EntryRow {
    name_index: u32,
    mode_index: u32,
    uid_index: u32,
    gid_index: u32,
    mtime: u64,
    kind: Kind,
}

struct DirEntryRow {
    parent: u32,
    entry_index: u32,
}

pub struct MetadataBuilder {
    block_size: u32,
    timestamp_base: u64,

    string_pool: Vec<u8>,
    name_spans: Vec<(u32, u32)>,
    name_interned: HashMap<String, u32>,

    entries: Vec<EntryRow>,
    children: Vec<Vec<DirEntryRow>>, // indexed by directory ordinal

    symlink_targets: Vec<(u32, u32)>, // unique target spans, indexed by target id
    symlink_interned: HashMap<String, u32>,
    symlink_table: Vec<u32>, // symlink ordinal -> target id

    file_chunks: Vec<Vec<(u32, u32, u32)>>, // file ordinal -> (block, offset, size)

    device_ids: Vec<u64>,

    uid_values: Vec<u32>,
    uid_interned: HashMap<u32, u32>,
    gid_values: Vec<u32>,
    gid_interned: HashMap<u32, u32>,
    mode_values: Vec<u32>,
    mode_interned: HashMap<u32, u32>,

    shared_files_table: Vec<u32>,
    file_first_entry: HashMap<u32, u32>, // file ordinal -> first entries[] index that names it
}

impl MetadataBuilder {
    pub fn new(block_size: u32) -> Self {
        let mut b = Self {
            block_size,
            timestamp_base: 0,
            string_pool: Vec::new(),
            name_spans: Vec::new(),
            name_interned: HashMap::new(),
            entries: Vec::new(),
            children: Vec::new(),
            symlink_targets: Vec::new(),
            symlink_interned: HashMap::new(),
            symlink_table: Vec::new(),
            file_chunks: Vec::new(),
            device_ids: Vec::new(),
            uid_values: Vec::new(),
            uid_interned: HashMap::new(),
            gid_values: Vec::new(),
            gid_interned: HashMap::new(),
            mode_values: Vec::new(),
            mode_interned: HashMap::new(),
            shared_files_table: Vec::new(),
            file_first_entry: HashMap::new(),
        };
        // Intern the empty name once, used by the root directory entry.
        b.intern_name("");
        b
    }

    pub fn set_timestamp_base(&mut self, base: u64) {
        self.timestamp_base = base;
    }

    pub fn intern_name(&mut self, name: &str) -> u32 {
        if let Some(&idx) = self.name_interned.get(name) {
            return idx;
        }
        let offset = self.string_pool.len() as u32;
        self.string_pool.extend_from_slice(name.as_bytes());
        let idx = self.name_spans.len() as u32;
        self.name_spans.push((offset, name.len() as u32));
        self.name_interned.insert(name.to_string(), idx);
        idx
    }

    fn intern_symlink_target(&mut self, target: &str) -> u32 {
        if let Some(&idx) = self.symlink_interned.get(target) {
            return idx;
        }
        let offset = self.string_pool.len() as u32;
        self.string_pool.extend_from_slice(target.as_bytes());
        let idx = self.symlink_targets.len() as u32;
        self.symlink_targets.push((offset, target.len() as u32));
        self.symlink_interned.insert(target.to_string(), idx);
        idx
    }

    fn dedup_u32(values: &mut Vec<u32>, interned: &mut HashMap<u32, u32>, v: u32) -> u32 {
        if let Some(&idx) = interned.get(&v) {
            return idx;
        }
        let idx = values.len() as u32;
        values.push(v);
        interned.insert(v, idx);
        idx
    }

    /// Create a new directory. `parent` is the parent directory's ordinal
    /// (its eventual inode, since directories are ranked first); `None`
    /// only for the root.
    pub fn add_directory(&mut self, parent: Option<u32>) -> u32 {
        let ordinal = self.children.len() as u32;
        self.children.push(Vec::new());
        if let Some(p) = parent {
            // The directory itself still needs a name entry so its parent
            // can list it; callers pass the name via `add_directory_named`
            // when they have one. The anonymous root has none.
            let _ = p;
        }
        ordinal
    }

    /// Register `dir` (by ordinal) as a named child of `parent`, pointing
    /// at `name_index`. Call once per directory except the root.
    pub fn name_directory(&mut self, parent: u32, name_index: u32, dir_ordinal: u32, mode: u32, uid: u32, gid: u32, mtime: u64) {
        let mode_index = Self::dedup_u32(&mut self.mode_values, &mut self.mode_interned, mode);
        let uid_index = Self::dedup_u32(&mut self.uid_values, &mut self.uid_interned, uid);
        let gid_index = Self::dedup_u32(&mut self.gid_values, &mut self.gid_interned, gid);
        let entry_index = self.entries.len() as u32;
        self.entries.push(EntryRow {
            name_index,
            mode_index,
            uid_index,
            gid_index,
            mtime,
            kind: Kind::Dir(dir_ordinal),
        });
        self.children[parent as usize].push(DirEntryRow { parent, entry_index });
    }

    pub fn add_file_entry(
        &mut self,
        parent: u32,
        name_index: u32,
        mode: u32,
        uid: u32,
        gid: u32,
        mtime: u64,
    ) -> u32 {
        let file_ordinal = self.file_chunks.len() as u32;
        self.file_chunks.push(Vec::new());
        let mode_index = Self::dedup_u32(&mut self.mode_values, &mut self.mode_interned, mode);
        let uid_index = Self::dedup_u32(&mut self.uid_values, &mut self.uid_interned, uid);
        let gid_index = Self::dedup_u32(&mut self.gid_values, &mut self.gid_interned, gid);
        let entry_index = self.entries.len() as u32;
        self.entries.push(EntryRow {
            name_index,
            mode_index,
            uid_index,
            gid_index,
            mtime,
            kind: Kind::File(file_ordinal),
        });
        self.children[parent as usize].push(DirEntryRow { parent, entry_index });
        self.file_first_entry.insert(file_ordinal, entry_index);
        file_ordinal
    }

    /// Add another directory entry pointing at an existing file's content
    /// (a hardlink). Records the new entries[] row in `shared_files_table`
    /// so a reader can recognise shared inodes without a per-entry flag.
    pub fn add_hardlink(
        &mut self,
        parent: u32,
        name_index: u32,
        existing_file_ordinal: u32,
        mode: u32,
        uid: u32,
        gid: u32,
        mtime: u64,
    ) {
        let mode_index = Self::dedup_u32(&mut self.mode_values, &mut self.mode_interned, mode);
        let uid_index = Self::dedup_u32(&mut self.uid_values, &mut self.uid_interned, uid);
        let gid_index = Self::dedup_u32(&mut self.gid_values, &mut self.gid_interned, gid);
        let entry_index = self.entries.len() as u32;
        self.entries.push(EntryRow {
            name_index,
            mode_index,
            uid_index,
            gid_index,
            mtime,
            kind: Kind::File(existing_file_ordinal),
        });
        self.children[parent as usize].push(DirEntryRow { parent, entry_index });
        self.shared_files_table.push(entry_index);
    }

    pub fn add_symlink_entry(
        &mut self,
        parent: u32,
        name_index: u32,
        target: &str,
        uid: u32,
        gid: u32,
        mtime: u64,
    ) -> u32 {
        let target_id = self.intern_symlink_target(target);
        let symlink_ordinal = self.symlink_table.len() as u32;
        self.symlink_table.push(target_id);
        let mode_index = Self::dedup_u32(&mut self.mode_values, &mut self.mode_interned, 0o120777);
        let uid_index = Self::dedup_u32(&mut self.uid_values, &mut self.uid_interned, uid);
        let gid_index = Self::dedup_u32(&mut self.gid_values, &mut self.gid_interned, gid);
        let entry_index = self.entries.len() as u32;
        self.entries.push(EntryRow {
            name_index,
            mode_index,
            uid_index,
            gid_index,
            mtime,
            kind: Kind::Symlink(symlink_ordinal),
        });
        self.children[parent as usize].push(DirEntryRow { parent, entry_index });
        symlink_ordinal
    }

    pub fn add_device_entry(
        &mut self,
        parent: u32,
        name_index: u32,
        device_id: u64,
        mode: u32,
        uid: u32,
        gid: u32,
        mtime: u64,
    ) -> u32 {
        let device_ordinal = self.device_ids.len() as u32;
        self.device_ids.push(device_id);
        let mode_index = Self::dedup_u32(&mut self.mode_values, &mut self.mode_interned, mode);
        let uid_index = Self::dedup_u32(&mut self.uid_values, &mut self.uid_interned, uid);
        let gid_index = Self::dedup_u32(&mut self.gid_values, &mut self.gid_interned, gid);
        let entry_index = self.entries.len() as u32;
        self.entries.push(EntryRow {
            name_index,
            mode_index,
            uid_index,
            gid_index,
            mtime,
            kind: Kind::Device(device_ordinal),
        });
        self.children[parent as usize].push(DirEntryRow { parent, entry_index });
        device_ordinal
    }

    pub fn add_chunk(&mut self, file_ordinal: u32, block: u32, offset: u32, size: u32) {
        self.file_chunks[file_ordinal as usize].push((block, offset, size));
    }

    /// No-op marker kept for symmetry with a streaming writer that finalizes
    /// chunk lists incrementally; nothing to flush here since `add_chunk`
    /// already appends directly.
    pub fn finish_file_chunks(&mut self, file_ordinal: u32) {
        debug_assert!((file_ordinal as usize) < self.file_chunks.len());
    }

    pub fn num_dirs(&self) -> u32 {
        self.children.len() as u32
    }

    /// Pack everything built so far into `(schema, metadata_payload_bytes)`.
    pub fn build(self) -> (Schema, Vec<u8>) {
        let num_dirs = self.children.len() as u32;
        let num_symlinks = self.symlink_table.len() as u32;
        let num_files = self.file_chunks.len() as u32;
        let num_devices = self.device_ids.len() as u32;

        let inode_of = |kind: &Kind| -> u64 {
            match *kind {
                Kind::Dir(o) => o as u64,
                Kind::Symlink(o) => (num_dirs + o) as u64,
                Kind::File(o) => (num_dirs + num_symlinks + o) as u64,
                Kind::Device(o) => (num_dirs + num_symlinks + num_files + o) as u64,
            }
        };

        // Directories/symlinks/devices were appended to `children` in scan
        // order during the tree walk, and files were appended separately in
        // content layout order (`compute_order`'s output, e.g. `RevPath`) —
        // neither is alphabetical. Sort each directory's children by name
        // here so the flattened `dir_entries` satisfies the "sorted
        // children" invariant independent of layout order.
        let entry_names: Vec<Vec<u8>> = self
            .entries
            .iter()
            .map(|e| {
                let (off, len) = self.name_spans[e.name_index as usize];
                self.string_pool[off as usize..(off + len) as usize].to_vec()
            })
            .collect();
        for kids in self.children.iter_mut() {
            kids.sort_by(|a, b| entry_names[a.entry_index as usize].cmp(&entry_names[b.entry_index as usize]));
        }

        // Flatten dir_entries grouped by directory ordinal, recording each
        // directory's (first_entry, entry_count).
        let mut dir_entries_flat: Vec<u32> = Vec::new(); // entries[] index per dir_entries row
        let mut dir_first = vec![0u64; num_dirs as usize];
        let mut dir_count = vec![0u64; num_dirs as usize];
        for (dir_ordinal, kids) in self.children.iter().enumerate() {
            dir_first[dir_ordinal] = dir_entries_flat.len() as u64;
            dir_count[dir_ordinal] = kids.len() as u64;
            for k in kids {
                dir_entries_flat.push(k.entry_index);
            }
        }
        let dir_entry_parent: Vec<u64> = self
            .children
            .iter()
            .enumerate()
            .flat_map(|(ord, kids)| kids.iter().map(move |_| ord as u64))
            .collect();

        let chunk_counts: Vec<u64> = self.file_chunks.iter().map(|c| c.len() as u64).collect();
        let mut chunk_table = Vec::with_capacity(chunk_counts.len() + 1);
        let mut acc = 0u64;
        chunk_table.push(0u64);
        for c in &chunk_counts {
            acc += c;
            chunk_table.push(acc);
        }
        let chunks_flat: Vec<(u32, u32, u32)> =
            self.file_chunks.into_iter().flatten().collect();

        let entry_name_index: Vec<u64> = self.entries.iter().map(|e| e.name_index as u64).collect();
        let entry_mode_index: Vec<u64> = self.entries.iter().map(|e| e.mode_index as u64).collect();
        let entry_uid_index: Vec<u64> = self.entries.iter().map(|e| e.uid_index as u64).collect();
        let entry_gid_index: Vec<u64> = self.entries.iter().map(|e| e.gid_index as u64).collect();
        let entry_mtime: Vec<u64> = self
            .entries
            .iter()
            .map(|e| e.mtime.saturating_sub(self.timestamp_base))
            .collect();
        let entry_inode: Vec<u64> = self.entries.iter().map(|e| inode_of(&e.kind)).collect();

        let names_offset: Vec<u64> = self.name_spans.iter().map(|(o, _)| *o as u64).collect();
        let names_length: Vec<u64> = self.name_spans.iter().map(|(_, l)| *l as u64).collect();
        let symlinks_offset: Vec<u64> = self.symlink_targets.iter().map(|(o, _)| *o as u64).collect();
        let symlinks_length: Vec<u64> = self.symlink_targets.iter().map(|(_, l)| *l as u64).collect();
        let symlink_table: Vec<u64> = self.symlink_table.iter().map(|&t| t as u64).collect();

        let uids: Vec<u64> = self.uid_values.iter().map(|&v| v as u64).collect();
        let gids: Vec<u64> = self.gid_values.iter().map(|&v| v as u64).collect();
        let modes: Vec<u64> = self.mode_values.iter().map(|&v| v as u64).collect();
        let devices: Vec<u64> = self.device_ids.clone();
        let shared_files: Vec<u64> = self.shared_files_table.iter().map(|&v| v as u64).collect();
        let chunk_block: Vec<u64> = chunks_flat.iter().map(|(b, _, _)| *b as u64).collect();
        let chunk_offset: Vec<u64> = chunks_flat.iter().map(|(_, o, _)| *o as u64).collect();
        let chunk_size: Vec<u64> = chunks_flat.iter().map(|(_, _, s)| *s as u64).collect();

        let mut fields = Vec::new();
        let mut payload = Vec::new();

        macro_rules! pack {
            ($table:expr, $col:literal, $values:expr) => {{
                let values = $values;
                let max = values.iter().copied().max().unwrap_or(0);
                let width = Width::for_max(max);
                let offset = payload.len();
                for v in &values {
                    match width {
                        Width::W8 => payload.push(*v as u8),
                        Width::W16 => payload.extend_from_slice(&(*v as u16).to_le_bytes()),
                        Width::W32 => payload.extend_from_slice(&(*v as u32).to_le_bytes()),
                        Width::W64 => payload.extend_from_slice(&v.to_le_bytes()),
                    }
                }
                fields.push(FieldSchema {
                    table: $table,
                    column: $col,
                    width,
                    count: values.len(),
                    offset,
                });
            }};
        }

        pack!(TableId::Entries, "name_index", entry_name_index);
        pack!(TableId::Entries, "mode_index", entry_mode_index);
        pack!(TableId::Entries, "uid_index", entry_uid_index);
        pack!(TableId::Entries, "gid_index", entry_gid_index);
        pack!(TableId::Entries, "mtime_offset", entry_mtime);
        pack!(TableId::Entries, "inode", entry_inode);

        pack!(TableId::DirEntries, "parent", dir_entry_parent);
        let dir_entries_flat_u64: Vec<u64> = dir_entries_flat.iter().map(|&v| v as u64).collect();
        pack!(TableId::DirEntries, "entry_index", dir_entries_flat_u64);

        pack!(TableId::Directories, "first_entry", dir_first);
        pack!(TableId::Directories, "entry_count", dir_count);

        pack!(TableId::ChunkTable, "offset", chunk_table);
        pack!(TableId::Chunks, "block", chunk_block);
        pack!(TableId::Chunks, "offset", chunk_offset);
        pack!(TableId::Chunks, "size", chunk_size);

        pack!(TableId::SymlinkTable, "symlink_index", symlink_table);
        pack!(TableId::Symlinks, "offset", symlinks_offset);
        pack!(TableId::Symlinks, "length", symlinks_length);

        pack!(TableId::Names, "offset", names_offset);
        pack!(TableId::Names, "length", names_length);

        pack!(TableId::Uids, "value", uids);
        pack!(TableId::Gids, "value", gids);
        pack!(TableId::Modes, "value", modes);
        pack!(TableId::Devices, "device_id", devices);
        pack!(TableId::SharedFilesTable, "inode", shared_files);

        payload.extend_from_slice(&self.string_pool);

        let total_fs_size: u64 = chunks_flat.iter().map(|(_, _, s)| *s as u64).sum();
        let scalars = ScalarHeader {
            block_size: self.block_size,
            timestamp_base: self.timestamp_base,
            total_fs_size,
            options: 0,
        };

        let mut section_bytes = Vec::with_capacity(SCALAR_HEADER_SIZE + payload.len());
        section_bytes.extend_from_slice(&scalars.encode());
        section_bytes.extend_from_slice(&payload);

        (Schema { fields }, section_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::frozen::FrozenMetadata;

    #[test]
    fn single_file_tree_builds_and_reads_back() {
        let mut b = MetadataBuilder::new(1 << 20);
        let root = b.add_directory(None);
        let name = b.intern_name("hello.txt");
        let file = b.add_file_entry(root, name, 0o100644, 0, 0, 1_000);
        b.add_chunk(file, 0, 0, 13);
        b.finish_file_chunks(file);
        let (schema, bytes) = b.build();

        let meta = FrozenMetadata::open(&schema, &bytes).unwrap();
        meta.check_consistency().unwrap();
        assert_eq!(meta.chunk_table().unwrap().iter().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(meta.name_str(name as usize).unwrap(), "hello.txt");
    }

    #[test]
    fn hardlinked_file_shares_chunks_and_is_recorded() {
        let mut b = MetadataBuilder::new(1 << 20);
        let root = b.add_directory(None);
        let n1 = b.intern_name("a.txt");
        let n2 = b.intern_name("b.txt");
        let file = b.add_file_entry(root, n1, 0o100644, 0, 0, 0);
        b.add_chunk(file, 0, 0, 4);
        b.add_hardlink(root, n2, file, 0o100644, 0, 0, 0);
        let (schema, bytes) = b.build();

        let meta = FrozenMetadata::open(&schema, &bytes).unwrap();
        meta.check_consistency().unwrap();
        let inodes: Vec<u64> = meta.entry_inode().unwrap().iter().collect();
        assert_eq!(inodes[0], inodes[1], "hardlinked entries must share an inode");
        assert_eq!(meta.shared_files_table().unwrap().len(), 1);
    }

    #[test]
    fn directory_rank_precedes_file_rank() {
        let mut b = MetadataBuilder::new(4096);
        let root = b.add_directory(None);
        let sub = b.add_directory(Some(root));
        let sub_name = b.intern_name("sub");
        b.name_directory(root, sub_name, sub, 0o40755, 0, 0, 0);
        let file_name = b.intern_name("f");
        let file = b.add_file_entry(root, file_name, 0o100644, 0, 0, 0);
        b.add_chunk(file, 0, 0, 1);
        let (schema, bytes) = b.build();
        let meta = FrozenMetadata::open(&schema, &bytes).unwrap();
        let inodes: Vec<u64> = meta.entry_inode().unwrap().iter().collect();
        // sub (a dir) must get a lower inode than the file.
        assert!(inodes[0] < inodes[1]);
    }
}
