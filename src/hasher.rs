//! Whole-file hash deduplication (C9).
//!
//! Ported from `original_source/src/dwarfs/file_scanner.cpp`'s
//! `file_scanner_`: files are bucketed by size first, since two files of
//! different size can never be byte-identical. The first file seen at a
//! given size gets a new logical inode immediately, on the assumption it's
//! unique. Once a second file of that size shows up, both it and the first
//! file must be hashed, and a barrier ensures the first file's hash is
//! recorded in the shared `by_hash` table before any later file of that
//! size is allowed to check it — otherwise a hash race could make two
//! identical files land in separate inodes.
//!
//! Hard links (same raw inode, `nlink > 1`) are resolved separately and
//! never hashed: their content is identical by construction.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};

use crate::progress::{Level, Progress};
use crate::worker::{JobKind, Pool};

pub type InodeId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgo {
    #[default]
    Blake3,
    /// Disables content-based dedup; only hard links are collapsed.
    None,
}

/// One file discovered by the scanner, flattened out of the `Entry` tree.
#[derive(Debug, Clone)]
pub struct FileHandle {
    pub id: u32,
    pub size: u64,
    pub source_path: PathBuf,
    pub raw_inode: u64,
    pub nlink: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct InodeAssignment {
    pub inode: InodeId,
    pub duplicate: bool,
}

pub struct DedupResult {
    /// Indexed by `FileHandle::id`.
    pub assignments: Vec<InodeAssignment>,
    pub num_unique_inodes: u32,
}

/// A one-shot mutex+condvar gate, equivalent to the original's
/// `condition_barrier`: `set()` releases every current and future `wait()`.
struct Barrier {
    ready: Mutex<bool>,
    cv: Condvar,
}

impl Barrier {
    fn new() -> Self {
        Self {
            ready: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn set(&self) {
        let mut ready = self.ready.lock().unwrap();
        *ready = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let guard = self.ready.lock().unwrap();
        let _guard = self.cv.wait_while(guard, |ready| !*ready).unwrap();
    }
}

/// Tracks, per file size, how far along the dedup decision we are —
/// the direct equivalent of the original's `unique_size_` map, where
/// "is_new" and "vector now empty" were two different questions about the
/// same entry.
enum SizeState {
    /// Only one file of this size seen so far; it already has an inode.
    FirstSeen(usize),
    /// A second (or later) file arrived; both are being hashed.
    Hashing,
}

struct Shared {
    next_inode: InodeId,
    by_hash: HashMap<[u8; 32], usize>,
    assignments: Vec<Option<InodeAssignment>>,
    first_file_hashed: HashMap<u64, Arc<Barrier>>,
}

impl Shared {
    fn new(num_files: usize) -> Self {
        Self {
            next_inode: 0,
            by_hash: HashMap::new(),
            assignments: vec![None; num_files],
            first_file_hashed: HashMap::new(),
        }
    }

    fn new_inode(&mut self) -> InodeId {
        let id = self.next_inode;
        self.next_inode += 1;
        id
    }
}

fn hash_file(path: &std::path::Path, size: u64) -> [u8; 32] {
    if size == 0 {
        return blake3::hash(&[]).into();
    }
    match std::fs::read(path) {
        Ok(data) => blake3::hash(&data).into(),
        Err(_) => blake3::hash(path.as_os_str().as_encoded_bytes()).into(),
    }
}

pub struct Hasher<'a> {
    pool: &'a Pool,
    progress: Arc<Progress>,
    algo: HashAlgo,
}

impl<'a> Hasher<'a> {
    pub fn new(pool: &'a Pool, progress: Arc<Progress>, algo: HashAlgo) -> Self {
        Self {
            pool,
            progress,
            algo,
        }
    }

    /// Group `files` into logical inodes. Consumes `files` and returns one
    /// assignment per input, addressable by `FileHandle::id`.
    pub fn dedupe(&self, files: Vec<FileHandle>) -> DedupResult {
        let hardlink_leader_of = Self::hardlink_followers(&files);

        if matches!(self.algo, HashAlgo::None) {
            return self.dedupe_by_raw_inode(&files, &hardlink_leader_of);
        }

        let num_files = files.len();
        let shared = Arc::new(Mutex::new(Shared::new(num_files)));
        let files = Arc::new(files);

        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(num_files.max(1));
        let mut jobs_spawned = 0usize;
        let mut unique_size: HashMap<u64, SizeState> = HashMap::new();

        for (idx, f) in files.iter().enumerate() {
            if hardlink_leader_of.contains_key(&idx) {
                continue;
            }

            let size = f.size;
            match unique_size.get(&size) {
                None => {
                    unique_size.insert(size, SizeState::FirstSeen(idx));
                    let mut guard = shared.lock().unwrap();
                    let inode = guard.new_inode();
                    guard.assignments[idx] = Some(InodeAssignment {
                        inode,
                        duplicate: false,
                    });
                }
                Some(&SizeState::FirstSeen(first_idx)) => {
                    unique_size.insert(size, SizeState::Hashing);

                    let barrier = Arc::new(Barrier::new());
                    {
                        let mut guard = shared.lock().unwrap();
                        guard.first_file_hashed.insert(size, barrier.clone());
                    }

                    self.spawn_first_file_job(&files, &shared, &done_tx, first_idx, size, barrier.clone());
                    jobs_spawned += 1;

                    self.spawn_subsequent_job(&files, &shared, &done_tx, idx, Some(barrier));
                    jobs_spawned += 1;
                }
                Some(SizeState::Hashing) => {
                    let barrier = shared.lock().unwrap().first_file_hashed.get(&size).cloned();
                    self.spawn_subsequent_job(&files, &shared, &done_tx, idx, barrier);
                    jobs_spawned += 1;
                }
            }
        }

        for _ in 0..jobs_spawned {
            done_rx.recv().expect("hash job channel closed early");
        }

        let assignments = self.finish_hardlinks(&shared, &hardlink_leader_of, num_files);
        let num_unique_inodes = shared.lock().unwrap().next_inode;

        DedupResult {
            assignments,
            num_unique_inodes,
        }
    }

    fn spawn_first_file_job(
        &self,
        files: &Arc<Vec<FileHandle>>,
        shared: &Arc<Mutex<Shared>>,
        done_tx: &crossbeam_channel::Sender<()>,
        first_idx: usize,
        size: u64,
        barrier: Arc<Barrier>,
    ) {
        let files = files.clone();
        let shared = shared.clone();
        let done_tx = done_tx.clone();
        self.pool.submit(JobKind::Hash, move || {
            let f = &files[first_idx];
            let digest = hash_file(&f.source_path, f.size);

            {
                let mut guard = shared.lock().unwrap();
                debug_assert!(guard.assignments[first_idx].is_some());
                guard.by_hash.entry(digest).or_insert(first_idx);
                guard.first_file_hashed.remove(&size);
            }

            barrier.set();
            let _ = done_tx.send(());
        });
    }

    fn spawn_subsequent_job(
        &self,
        files: &Arc<Vec<FileHandle>>,
        shared: &Arc<Mutex<Shared>>,
        done_tx: &crossbeam_channel::Sender<()>,
        idx: usize,
        barrier: Option<Arc<Barrier>>,
    ) {
        let files = files.clone();
        let shared = shared.clone();
        let done_tx = done_tx.clone();
        let progress = self.progress.clone();
        self.pool.submit(JobKind::Hash, move || {
            let f = &files[idx];
            let digest = hash_file(&f.source_path, f.size);

            if let Some(barrier) = &barrier {
                barrier.wait();
            }

            let mut guard = shared.lock().unwrap();
            let assignment = match guard.by_hash.get(&digest) {
                Some(&rep) => {
                    let inode = guard.assignments[rep]
                        .expect("representative file already assigned")
                        .inode;
                    Progress::bump(&progress.files_deduped, 1);
                    InodeAssignment {
                        inode,
                        duplicate: true,
                    }
                }
                None => {
                    let inode = guard.new_inode();
                    InodeAssignment {
                        inode,
                        duplicate: false,
                    }
                }
            };
            guard.assignments[idx] = Some(assignment);
            guard.by_hash.entry(digest).or_insert(idx);
            drop(guard);

            let _ = done_tx.send(());
        });
    }

    fn finish_hardlinks(
        &self,
        shared: &Arc<Mutex<Shared>>,
        hardlink_leader_of: &HashMap<usize, usize>,
        num_files: usize,
    ) -> Vec<InodeAssignment> {
        let mut guard = shared.lock().unwrap();
        let mut out = Vec::with_capacity(num_files);
        for idx in 0..num_files {
            if let Some(&leader) = hardlink_leader_of.get(&idx) {
                let inode = guard.assignments[leader]
                    .expect("hardlink leader resolved before followers")
                    .inode;
                out.push(InodeAssignment {
                    inode,
                    duplicate: true,
                });
                Progress::bump(&self.progress.files_deduped, 1);
            } else {
                out.push(
                    guard.assignments[idx]
                        .take()
                        .expect("every non-follower file is assigned by dedupe"),
                );
            }
        }
        out
    }

    fn dedupe_by_raw_inode(
        &self,
        files: &[FileHandle],
        hardlink_leader_of: &HashMap<usize, usize>,
    ) -> DedupResult {
        let mut assignments = vec![
            InodeAssignment {
                inode: 0,
                duplicate: false
            };
            files.len()
        ];
        let mut next_inode: InodeId = 0;

        for idx in 0..files.len() {
            if hardlink_leader_of.contains_key(&idx) {
                continue;
            }
            assignments[idx] = InodeAssignment {
                inode: next_inode,
                duplicate: false,
            };
            next_inode += 1;
        }

        for (&follower, &leader) in hardlink_leader_of {
            assignments[follower] = InodeAssignment {
                inode: assignments[leader].inode,
                duplicate: true,
            };
            Progress::bump(&self.progress.files_deduped, 1);
        }

        self.progress.log(
            Level::Debug,
            &format!("hashing disabled, {next_inode} inodes from raw-inode grouping"),
        );

        DedupResult {
            assignments,
            num_unique_inodes: next_inode,
        }
    }

    /// Maps every hard-link follower (a later file sharing a raw inode
    /// number with an earlier one) to the index of that earlier file.
    fn hardlink_followers(files: &[FileHandle]) -> HashMap<usize, usize> {
        let mut by_raw_inode: HashMap<u64, Vec<usize>> = HashMap::new();
        for (idx, f) in files.iter().enumerate() {
            if f.nlink > 1 {
                by_raw_inode.entry(f.raw_inode).or_default().push(idx);
            }
        }
        let mut followers = HashMap::new();
        for group in by_raw_inode.values() {
            if group.len() > 1 {
                for &follower in &group[1..] {
                    followers.insert(follower, group[0]);
                }
            }
        }
        followers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn handle(id: u32, dir: &TempDir, name: &str, content: &[u8]) -> FileHandle {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        FileHandle {
            id,
            size: content.len() as u64,
            source_path: path,
            raw_inode: id as u64 + 1,
            nlink: 1,
        }
    }

    #[test]
    fn unique_sizes_each_get_their_own_inode() {
        let dir = TempDir::new().unwrap();
        let files = vec![
            handle(0, &dir, "a", b"hello"),
            handle(1, &dir, "b", b"worldly"),
            handle(2, &dir, "c", b"xy"),
        ];
        let pool = Pool::new(2, 8);
        let progress = Arc::new(Progress::new(Level::Error));
        let hasher = Hasher::new(&pool, progress, HashAlgo::Blake3);
        let result = hasher.dedupe(files);
        pool.shutdown();

        let inodes: Vec<InodeId> = result.assignments.iter().map(|a| a.inode).collect();
        assert_eq!(inodes.len(), 3);
        assert_ne!(inodes[0], inodes[1]);
        assert_ne!(inodes[1], inodes[2]);
        assert_eq!(result.num_unique_inodes, 3);
    }

    #[test]
    fn identical_content_same_size_shares_one_inode() {
        let dir = TempDir::new().unwrap();
        let files = vec![
            handle(0, &dir, "a", b"same bytes"),
            handle(1, &dir, "b", b"same bytes"),
        ];
        let pool = Pool::new(2, 8);
        let progress = Arc::new(Progress::new(Level::Error));
        let hasher = Hasher::new(&pool, progress, HashAlgo::Blake3);
        let result = hasher.dedupe(files);
        pool.shutdown();

        assert_eq!(result.assignments[0].inode, result.assignments[1].inode);
        assert!(result.assignments[1].duplicate || result.assignments[0].duplicate);
        assert_eq!(result.num_unique_inodes, 1);
    }

    #[test]
    fn same_size_different_content_get_distinct_inodes() {
        let dir = TempDir::new().unwrap();
        let files = vec![
            handle(0, &dir, "a", b"aaaaa"),
            handle(1, &dir, "b", b"bbbbb"),
        ];
        let pool = Pool::new(2, 8);
        let progress = Arc::new(Progress::new(Level::Error));
        let hasher = Hasher::new(&pool, progress, HashAlgo::Blake3);
        let result = hasher.dedupe(files);
        pool.shutdown();

        assert_ne!(result.assignments[0].inode, result.assignments[1].inode);
        assert_eq!(result.num_unique_inodes, 2);
    }

    #[test]
    fn three_files_same_size_two_duplicates_one_unique() {
        let dir = TempDir::new().unwrap();
        let files = vec![
            handle(0, &dir, "a", b"11111"),
            handle(1, &dir, "b", b"11111"),
            handle(2, &dir, "c", b"22222"),
        ];
        let pool = Pool::new(4, 8);
        let progress = Arc::new(Progress::new(Level::Error));
        let hasher = Hasher::new(&pool, progress, HashAlgo::Blake3);
        let result = hasher.dedupe(files);
        pool.shutdown();

        assert_eq!(result.assignments[0].inode, result.assignments[1].inode);
        assert_ne!(result.assignments[0].inode, result.assignments[2].inode);
        assert_eq!(result.num_unique_inodes, 2);
    }

    #[test]
    fn four_files_same_size_two_pairs_of_duplicates() {
        let dir = TempDir::new().unwrap();
        let files = vec![
            handle(0, &dir, "a", b"11111"),
            handle(1, &dir, "b", b"22222"),
            handle(2, &dir, "c", b"11111"),
            handle(3, &dir, "d", b"22222"),
        ];
        let pool = Pool::new(4, 8);
        let progress = Arc::new(Progress::new(Level::Error));
        let hasher = Hasher::new(&pool, progress, HashAlgo::Blake3);
        let result = hasher.dedupe(files);
        pool.shutdown();

        assert_eq!(result.assignments[0].inode, result.assignments[2].inode);
        assert_eq!(result.assignments[1].inode, result.assignments[3].inode);
        assert_ne!(result.assignments[0].inode, result.assignments[1].inode);
        assert_eq!(result.num_unique_inodes, 2);
    }

    #[cfg(unix)]
    #[test]
    fn hardlinked_files_share_an_inode_without_hashing() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"content").unwrap();
        fs::hard_link(&a, &b).unwrap();
        let meta = fs::metadata(&a).unwrap();
        use std::os::unix::fs::MetadataExt;

        let files = vec![
            FileHandle {
                id: 0,
                size: meta.len(),
                source_path: a,
                raw_inode: meta.ino(),
                nlink: meta.nlink(),
            },
            FileHandle {
                id: 1,
                size: meta.len(),
                source_path: b,
                raw_inode: meta.ino(),
                nlink: meta.nlink(),
            },
        ];
        let pool = Pool::new(2, 8);
        let progress = Arc::new(Progress::new(Level::Error));
        let hasher = Hasher::new(&pool, progress, HashAlgo::Blake3);
        let result = hasher.dedupe(files);
        pool.shutdown();

        assert_eq!(result.assignments[0].inode, result.assignments[1].inode);
        assert!(result.assignments[1].duplicate);
    }

    #[test]
    fn hash_algo_none_only_collapses_hardlinks() {
        let dir = TempDir::new().unwrap();
        let files = vec![
            handle(0, &dir, "a", b"same"),
            handle(1, &dir, "b", b"same"),
        ];
        let pool = Pool::new(2, 8);
        let progress = Arc::new(Progress::new(Level::Error));
        let hasher = Hasher::new(&pool, progress, HashAlgo::None);
        let result = hasher.dedupe(files);
        pool.shutdown();

        // Not hard-linked (distinct raw_inode), so each gets its own inode
        // even though their content is identical.
        assert_ne!(result.assignments[0].inode, result.assignments[1].inode);
    }
}
