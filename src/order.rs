//! Inode ordering (C10, part 2).
//!
//! Spec.md §4.9's six modes, operating over whatever per-inode
//! representative file the caller chooses (hardlinked/deduped files share
//! one inode and therefore one entry here). `max_similarity_size` is
//! enforced first and uniformly: any file above the cap never gets a
//! signature computed at all and is emitted ahead of everything else, in
//! size-descending order, exactly as spec.md describes (oversized files
//! dominate block layout regardless of ordering mode).

use crate::similarity::Signature;
use std::cmp::Ordering as CmpOrdering;

#[derive(Debug, Clone)]
pub struct OrderableFile {
    pub inode: u32,
    pub path: String,
    pub size: u64,
    pub signature: Option<Signature>,
}

#[derive(Debug, Clone, Copy)]
pub struct NilsimsaOptions {
    pub max_children: usize,
    pub max_cluster_size: usize,
}

impl Default for NilsimsaOptions {
    fn default() -> Self {
        Self {
            max_children: 16,
            max_cluster_size: 1024,
        }
    }
}

pub enum OrderMode {
    None,
    Path,
    RevPath,
    Similarity,
    Nilsimsa(NilsimsaOptions),
    /// Caller-supplied explicit inode order; unlisted inodes are appended
    /// afterward in their original relative order.
    Explicit(Vec<u32>),
    /// Caller-supplied external comparator, the `script` mode's Rust-idiomatic
    /// analogue — an external callback rather than an embedded interpreter.
    Script(Box<dyn Fn(&OrderableFile, &OrderableFile) -> CmpOrdering>),
}

/// Reversed path string, compared lexicographically byte-for-byte — i.e.
/// files are grouped by shared suffix (extension, then filename) before
/// shared prefix (directory).
fn revpath_key(path: &str) -> Vec<u8> {
    let mut bytes: Vec<u8> = path.bytes().collect();
    bytes.reverse();
    bytes
}

/// Returns the permutation of `files` (by index) to emit inodes in.
pub fn compute_order(files: &[OrderableFile], mode: OrderMode, max_similarity_size: u64) -> Vec<usize> {
    let n = files.len();
    if n == 0 {
        return Vec::new();
    }

    let (oversized, mut participants): (Vec<usize>, Vec<usize>) =
        (0..n).partition(|&i| files[i].size > max_similarity_size);

    let mut oversized = oversized;
    oversized.sort_by(|&a, &b| files[b].size.cmp(&files[a].size));

    match mode {
        OrderMode::None => {
            let mut order = oversized;
            order.extend(participants);
            order
        }
        OrderMode::Path => {
            participants.sort_by(|&a, &b| files[a].path.cmp(&files[b].path));
            let mut order = oversized;
            order.extend(participants);
            order
        }
        OrderMode::RevPath => {
            participants.sort_by(|&a, &b| revpath_key(&files[a].path).cmp(&revpath_key(&files[b].path)));
            let mut order = oversized;
            order.extend(participants);
            order
        }
        OrderMode::Similarity => {
            participants.sort_by(|&a, &b| {
                files[a]
                    .signature
                    .as_ref()
                    .zip(files[b].signature.as_ref())
                    .map(|(sa, sb)| sa.0.cmp(&sb.0))
                    .unwrap_or(CmpOrdering::Equal)
                    .then_with(|| files[b].size.cmp(&files[a].size))
                    .then_with(|| files[a].path.cmp(&files[b].path))
            });
            let mut order = oversized;
            order.extend(participants);
            order
        }
        OrderMode::Nilsimsa(opts) => {
            let chained = nilsimsa_chain(files, &participants, opts);
            let mut order = oversized;
            order.extend(chained);
            order
        }
        OrderMode::Explicit(inode_order) => {
            let mut order = oversized;
            order.extend(explicit_order(files, &participants, &inode_order));
            order
        }
        OrderMode::Script(cmp) => {
            participants.sort_by(|&a, &b| cmp(&files[a], &files[b]));
            let mut order = oversized;
            order.extend(participants);
            order
        }
    }
}

fn explicit_order(files: &[OrderableFile], participants: &[usize], inode_order: &[u32]) -> Vec<usize> {
    let mut by_inode: std::collections::HashMap<u32, usize> = std::collections::HashMap::new();
    for &idx in participants {
        by_inode.insert(files[idx].inode, idx);
    }
    let mut order = Vec::with_capacity(participants.len());
    for &inode in inode_order {
        if let Some(idx) = by_inode.remove(&inode) {
            order.push(idx);
        }
    }
    let mut remaining: Vec<usize> = by_inode.into_values().collect();
    remaining.sort_unstable();
    order.extend(remaining);
    order
}

/// Greedy nearest-neighbor chaining: repeatedly extend the current cluster
/// with whichever unvisited file is closest (by Hamming distance) to the
/// cluster's current tail, starting a new cluster once `max_children` or
/// `max_cluster_size` is hit. `O(n^2)` in the number of participants,
/// acceptable at the scale this crate targets (spec.md §9 leaves pacing
/// implementation-defined).
fn nilsimsa_chain(files: &[OrderableFile], participants: &[usize], opts: NilsimsaOptions) -> Vec<usize> {
    let mut remaining: Vec<usize> = participants.to_vec();
    remaining.sort_by(|&a, &b| files[b].size.cmp(&files[a].size));

    let mut order = Vec::with_capacity(remaining.len());
    let mut visited = vec![false; files.len()];

    while let Some(seed_pos) = remaining.iter().position(|&i| !visited[i]) {
        let seed = remaining[seed_pos];
        visited[seed] = true;
        order.push(seed);

        let mut tail = seed;
        let mut cluster_size = 1usize;
        let mut children = 0usize;

        while cluster_size < opts.max_cluster_size && children < opts.max_children {
            let tail_sig = match &files[tail].signature {
                Some(sig) => sig,
                None => break,
            };

            let next = remaining
                .iter()
                .copied()
                .filter(|&i| !visited[i])
                .filter_map(|i| files[i].signature.as_ref().map(|s| (i, tail_sig.hamming_distance(s))))
                .min_by_key(|&(_, dist)| dist);

            match next {
                Some((idx, _)) => {
                    visited[idx] = true;
                    order.push(idx);
                    tail = idx;
                    cluster_size += 1;
                    children += 1;
                }
                None => break,
            }
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::compute_signature;

    fn file(inode: u32, path: &str, size: u64, content: &[u8]) -> OrderableFile {
        OrderableFile {
            inode,
            path: path.to_string(),
            size,
            signature: Some(compute_signature(content)),
        }
    }

    #[test]
    fn none_mode_preserves_relative_order_after_oversized_files() {
        let files = vec![
            file(0, "b", 10, b"aaaa"),
            file(1, "a", 20000, b"bbbb"),
            file(2, "c", 5, b"cccc"),
        ];
        let order = compute_order(&files, OrderMode::None, 1000);
        assert_eq!(order, vec![1, 0, 2]);
    }

    #[test]
    fn path_mode_sorts_lexicographically() {
        let files = vec![
            file(0, "banana", 1, b"aaaa"),
            file(1, "apple", 1, b"bbbb"),
            file(2, "cherry", 1, b"cccc"),
        ];
        let order = compute_order(&files, OrderMode::Path, 1000);
        let paths: Vec<&str> = order.iter().map(|&i| files[i].path.as_str()).collect();
        assert_eq!(paths, vec!["apple", "banana", "cherry"]);
    }

    #[test]
    fn revpath_mode_groups_by_shared_suffix() {
        let files = vec![
            file(0, "src/main.rs", 1, b"aaaa"),
            file(1, "lib/main.rs", 1, b"bbbb"),
            file(2, "src/lib.rs", 1, b"cccc"),
        ];
        let order = compute_order(&files, OrderMode::RevPath, 1000);
        let paths: Vec<&str> = order.iter().map(|&i| files[i].path.as_str()).collect();
        // reversed-byte order: "sr.bil/crs" < "sr.niam/bil" < "sr.niam/crs"
        assert_eq!(paths, vec!["src/lib.rs", "lib/main.rs", "src/main.rs"]);
    }

    #[test]
    fn oversized_files_are_emitted_first_size_descending() {
        let files = vec![
            file(0, "small", 10, b"aaaa"),
            file(1, "big1", 2000, b"bbbb"),
            file(2, "big2", 3000, b"cccc"),
        ];
        let order = compute_order(&files, OrderMode::None, 1000);
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[test]
    fn explicit_mode_honors_given_order_then_appends_rest() {
        let files = vec![
            file(0, "a", 1, b"aaaa"),
            file(1, "b", 1, b"bbbb"),
            file(2, "c", 1, b"cccc"),
        ];
        let order = compute_order(&files, OrderMode::Explicit(vec![2, 0]), 1000);
        assert_eq!(order, vec![2, 0, 1]);
    }

    #[test]
    fn nilsimsa_chain_visits_every_participant_exactly_once() {
        let files: Vec<OrderableFile> = (0..10)
            .map(|i| file(i, &format!("f{i}"), 100, format!("content number {i} padding").as_bytes()))
            .collect();
        let opts = NilsimsaOptions {
            max_children: 3,
            max_cluster_size: 4,
        };
        let order = compute_order(&files, OrderMode::Nilsimsa(opts), 1000);
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn script_mode_uses_external_comparator() {
        let files = vec![
            file(0, "a", 30, b"aaaa"),
            file(1, "b", 10, b"bbbb"),
            file(2, "c", 20, b"cccc"),
        ];
        let order = compute_order(
            &files,
            OrderMode::Script(Box::new(|a, b| a.size.cmp(&b.size))),
            1000,
        );
        assert_eq!(order, vec![1, 2, 0]);
    }
}
