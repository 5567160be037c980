//! Top-level archive writer (C11's driver) — the write-side counterpart to
//! [`crate::filesystem::Filesystem`].
//!
//! Grounded on the teacher's `Archive::create`/`add_file`/`finalize` shape
//! (`archive.rs`), but DwarFS doesn't take an incremental per-file API from
//! its CLI: `mkdwarfs` scans a whole source tree and writes one image, so
//! `Writer::write` drives the whole pipeline spec.md §4.11 describes in one
//! call: scanner → hasher → similarity/order → segmenter → block_manager
//! for content, and scanner → metadata::builder for the directory tree,
//! joined back together once the content order is known (inode numbers come
//! from `metadata::builder`'s call order, so file entries are built in the
//! layout order `order::compute_order` picks, not scan order).

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use crate::block_manager::{BlockManager, BlockManagerConfig};
use crate::codec::CodecKind;
use crate::error::DwarfsError;
use crate::hasher::{FileHandle, HashAlgo, Hasher};
use crate::metadata::MetadataBuilder;
use crate::order::{compute_order, OrderMode, OrderableFile};
use crate::progress::{Level, Progress};
use crate::scanner::chmod::ChmodTransformer;
use crate::scanner::{Entry, EntryKind, Filter, Scanner};
use crate::section::{self, SectionType};
use crate::segmenter::{Segmenter, SegmenterConfig};
use crate::similarity::compute_signature;
use crate::worker::Pool;

pub struct WriterOptions {
    pub codec: CodecKind,
    pub compression_level: i32,
    pub block_size: u32,
    pub window_sizes: Vec<usize>,
    pub window_increment_shift: u32,
    pub table_bits: u32,
    pub max_similarity_size: u64,
    pub order: OrderMode,
    pub hash_algo: HashAlgo,
    pub filter: Option<Filter>,
    pub chmod: Option<ChmodTransformer>,
    pub num_workers: usize,
    pub progress_level: Level,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            codec: CodecKind::Zstd,
            compression_level: 19,
            block_size: 1 << 24,
            window_sizes: vec![1 << 12],
            window_increment_shift: 2,
            table_bits: 20,
            max_similarity_size: 256 << 20,
            order: OrderMode::RevPath,
            hash_algo: HashAlgo::Blake3,
            filter: None,
            chmod: None,
            num_workers: 0,
            progress_level: Level::Info,
        }
    }
}

/// One regular-file entry's directory placement, captured during the tree
/// walk so it can be replayed once content order is known. Indexed
/// 1:1 with the `FileHandle` list passed to `Hasher`.
struct PendingFile {
    parent: u32,
    name_index: u32,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: u64,
}

pub struct Writer {
    options: WriterOptions,
}

impl Writer {
    pub fn new(options: WriterOptions) -> Self {
        Self { options }
    }

    /// Scan `root` and write a complete image to `out`. Returns the shared
    /// [`Progress`] counters accumulated along the way.
    pub fn write<W: Write>(self, root: &Path, mut out: W) -> Result<Arc<Progress>, DwarfsError> {
        let progress = Arc::new(Progress::new(self.options.progress_level));

        let mut scanner = Scanner::new();
        if let Some(filter) = self.options.filter {
            scanner = scanner.with_filter(filter);
        }
        if let Some(chmod) = self.options.chmod {
            scanner = scanner.with_chmod(chmod);
        }
        let tree = scanner.scan(root, &progress)?;

        let mut builder = MetadataBuilder::new(self.options.block_size);
        let mut files: Vec<FileHandle> = Vec::new();
        let mut pending: Vec<PendingFile> = Vec::new();
        walk(&tree, None, &mut builder, &mut files, &mut pending);

        let pool = Pool::new(self.options.num_workers, 256);
        let hasher = Hasher::new(&pool, progress.clone(), self.options.hash_algo);
        let dedup = hasher.dedupe(files.clone());

        let mut representative_of: HashMap<u32, usize> = HashMap::with_capacity(dedup.num_unique_inodes as usize);
        for (idx, a) in dedup.assignments.iter().enumerate() {
            if !a.duplicate {
                representative_of.insert(a.inode, idx);
            }
        }

        let mut orderable = Vec::with_capacity(dedup.num_unique_inodes as usize);
        for inode in 0..dedup.num_unique_inodes {
            let idx = representative_of[&inode];
            let fh = &files[idx];
            let signature = if fh.size <= self.options.max_similarity_size {
                std::fs::read(&fh.source_path).ok().map(|data| compute_signature(&data))
            } else {
                None
            };
            orderable.push(OrderableFile {
                inode,
                path: fh.source_path.to_string_lossy().into_owned(),
                size: fh.size,
                signature,
            });
        }

        let layout = compute_order(&orderable, self.options.order, self.options.max_similarity_size);

        let segmenter_cfg = SegmenterConfig {
            window_sizes: self.options.window_sizes,
            window_increment_shift: self.options.window_increment_shift,
            block_size: self.options.block_size as usize,
        };
        let segmenter = Segmenter::new(segmenter_cfg, self.options.table_bits);
        let mut block_mgr = BlockManager::new(
            &pool,
            progress.clone(),
            segmenter,
            BlockManagerConfig {
                codec: self.options.codec.tag(),
                compression_level: self.options.compression_level,
            },
        );

        let mut file_ordinal_of: HashMap<u32, u32> = HashMap::with_capacity(dedup.num_unique_inodes as usize);
        for &inode in &layout {
            let idx = representative_of[&inode];
            let fh = &files[idx];
            let p = &pending[idx];
            let data = std::fs::read(&fh.source_path)?;

            let file_ordinal = builder.add_file_entry(p.parent, p.name_index, p.mode, p.uid, p.gid, p.mtime);
            for chunk in block_mgr.add_file(&data) {
                builder.add_chunk(file_ordinal, chunk.block_index, chunk.offset, chunk.size);
            }
            builder.finish_file_chunks(file_ordinal);
            file_ordinal_of.insert(inode, file_ordinal);
        }
        block_mgr.flush();

        for (idx, a) in dedup.assignments.iter().enumerate() {
            if a.duplicate {
                let p = &pending[idx];
                let file_ordinal = file_ordinal_of[&a.inode];
                builder.add_hardlink(p.parent, p.name_index, file_ordinal, p.mode, p.uid, p.gid, p.mtime);
            }
        }

        progress.log(
            Level::Info,
            &format!(
                "{} unique inodes, {} blocks, {} collisions",
                dedup.num_unique_inodes,
                block_mgr.blocks_submitted(),
                block_mgr.collisions()
            ),
        );

        section::write_image_header(&mut out)?;
        block_mgr.finalize(&mut out)?;

        let (schema, metadata_bytes) = builder.build();
        let codec = self.options.codec.tag();
        section::write_section(&mut out, SectionType::Schema, codec, self.options.compression_level, &schema.to_bytes())?;
        section::write_section(&mut out, SectionType::Metadata, codec, self.options.compression_level, &metadata_bytes)?;

        pool.shutdown();
        Ok(progress)
    }

    /// Convenience wrapper that scans `root` and writes the image to a new
    /// file at `dest`, overwriting any existing content.
    pub fn write_to_path<P: AsRef<Path>>(self, root: &Path, dest: P) -> Result<Arc<Progress>, DwarfsError> {
        let file = std::fs::File::create(dest)?;
        self.write(root, std::io::BufWriter::new(file))
    }
}

fn walk(
    entry: &Entry,
    parent: Option<u32>,
    builder: &mut MetadataBuilder,
    files: &mut Vec<FileHandle>,
    pending: &mut Vec<PendingFile>,
) {
    match &entry.kind {
        EntryKind::Dir { children } => {
            let ordinal = builder.add_directory(parent);
            if let Some(p) = parent {
                let name_index = builder.intern_name(&entry.name);
                builder.name_directory(p, name_index, ordinal, entry.mode, entry.uid, entry.gid, entry.mtime);
            }
            for child in children {
                walk(child, Some(ordinal), builder, files, pending);
            }
        }
        EntryKind::File { size, source_path } => {
            let parent = parent.expect("a file entry always has a parent directory");
            let name_index = builder.intern_name(&entry.name);
            let id = files.len() as u32;
            files.push(FileHandle {
                id,
                size: *size,
                source_path: source_path.clone(),
                raw_inode: entry.raw_inode,
                nlink: entry.nlink,
            });
            pending.push(PendingFile {
                parent,
                name_index,
                mode: entry.mode,
                uid: entry.uid,
                gid: entry.gid,
                mtime: entry.mtime,
            });
        }
        EntryKind::Link { target } => {
            let parent = parent.expect("a symlink entry always has a parent directory");
            let name_index = builder.intern_name(&entry.name);
            builder.add_symlink_entry(parent, name_index, target, entry.uid, entry.gid, entry.mtime);
        }
        EntryKind::Device { device_id } => {
            let parent = parent.expect("a device entry always has a parent directory");
            let name_index = builder.intern_name(&entry.name);
            builder.add_device_entry(parent, name_index, *device_id, entry.mode, entry.uid, entry.gid, entry.mtime);
        }
        EntryKind::Other => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::{Filesystem, FilesystemOptions};
    use std::fs;
    use tempfile::TempDir;

    fn small_options() -> WriterOptions {
        WriterOptions {
            block_size: 1 << 16,
            window_sizes: vec![64],
            table_bits: 10,
            compression_level: 3,
            progress_level: Level::Error,
            ..WriterOptions::default()
        }
    }

    #[test]
    fn round_trips_a_small_tree() {
        let src = TempDir::new().unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("a.txt"), b"hello from a").unwrap();
        fs::write(src.path().join("sub/b.txt"), b"hello from b, a bit longer").unwrap();

        let dest = TempDir::new().unwrap();
        let image_path = dest.path().join("out.dwarfs");

        let writer = Writer::new(small_options());
        writer.write_to_path(src.path(), &image_path).unwrap();

        let fs_img = Filesystem::open(&image_path, FilesystemOptions::default()).unwrap();
        let root = fs_img.root_inode();
        let children = fs_img.readdir(root, 0).unwrap();
        // Children are listed in name order, after the leading "." and "..".
        assert_eq!(
            children.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            vec![".", "..", "a.txt", "sub"]
        );

        let a_inode = fs_img.lookup(root, "a.txt").unwrap();
        let attr = fs_img.getattr(a_inode).unwrap();
        assert_eq!(attr.size, 12);
        let mut buf = vec![0u8; 12];
        fs_img.read(a_inode, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello from a");

        let sub_inode = fs_img.lookup(root, "sub").unwrap();
        let sub_children = fs_img.readdir(sub_inode, 0).unwrap();
        assert_eq!(
            sub_children.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            vec![".", "..", "b.txt"]
        );
    }

    #[test]
    fn directory_children_are_sorted_under_the_default_order() {
        // small_options() doesn't override `order`, so this exercises the
        // default `RevPath` layout order, which is not alphabetical — files
        // land in `children` in that order unless `build()` sorts them.
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("zebra.txt"), b"z").unwrap();
        fs::write(src.path().join("mango.txt"), b"m").unwrap();
        fs::write(src.path().join("apple.txt"), b"a").unwrap();
        fs::create_dir(src.path().join("nest")).unwrap();

        let dest = TempDir::new().unwrap();
        let image_path = dest.path().join("out.dwarfs");
        Writer::new(small_options()).write_to_path(src.path(), &image_path).unwrap();

        let fs_img = Filesystem::open(&image_path, FilesystemOptions::default()).unwrap();
        let root = fs_img.root_inode();
        let names: Vec<String> = fs_img
            .readdir(root, 0)
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .filter(|n| n != "." && n != "..")
            .collect();
        assert_eq!(names, vec!["apple.txt", "mango.txt", "nest", "zebra.txt"]);
    }

    #[test]
    fn readdir_offset_skips_leading_entries() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("a.txt"), b"a").unwrap();
        fs::write(src.path().join("b.txt"), b"b").unwrap();

        let dest = TempDir::new().unwrap();
        let image_path = dest.path().join("out.dwarfs");
        Writer::new(small_options()).write_to_path(src.path(), &image_path).unwrap();

        let fs_img = Filesystem::open(&image_path, FilesystemOptions::default()).unwrap();
        let root = fs_img.root_inode();
        let full = fs_img.readdir(root, 0).unwrap();
        assert_eq!(full.len(), 4); // ".", "..", "a.txt", "b.txt"

        for offset in 0..full.len() as u64 {
            let tail = fs_img.readdir(root, offset).unwrap();
            assert_eq!(tail, full[offset as usize..]);
        }
        assert!(fs_img.readdir(root, full.len() as u64).unwrap().is_empty());
    }

    #[test]
    fn duplicate_file_content_shares_one_inode() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("a.txt"), b"same content here").unwrap();
        fs::write(src.path().join("b.txt"), b"same content here").unwrap();

        let dest = TempDir::new().unwrap();
        let image_path = dest.path().join("out.dwarfs");
        Writer::new(small_options()).write_to_path(src.path(), &image_path).unwrap();

        let fs_img = Filesystem::open(&image_path, FilesystemOptions::default()).unwrap();
        let root = fs_img.root_inode();
        let a = fs_img.lookup(root, "a.txt").unwrap();
        let b = fs_img.lookup(root, "b.txt").unwrap();
        assert_eq!(a, b, "identical content must resolve to the same inode");
    }

    #[test]
    fn empty_file_round_trips() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("empty.txt"), b"").unwrap();

        let dest = TempDir::new().unwrap();
        let image_path = dest.path().join("out.dwarfs");
        Writer::new(small_options()).write_to_path(src.path(), &image_path).unwrap();

        let fs_img = Filesystem::open(&image_path, FilesystemOptions::default()).unwrap();
        let root = fs_img.root_inode();
        let inode = fs_img.lookup(root, "empty.txt").unwrap();
        let attr = fs_img.getattr(inode).unwrap();
        assert_eq!(attr.size, 0);
    }
}
