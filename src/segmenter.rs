//! Cross-file content-defined segmentation (C11).
//!
//! `RsyncHash` is ported field-for-field from `original_source/include/
//! dwarfs/cyclic_hash.h`'s `rsync_hash`: two 16-bit accumulators updated in
//! O(1) as a window slides one byte at a time. `Segmenter` uses it to find,
//! for each configured window size (largest first), byte spans already
//! present in the *currently open block* so they can be referenced instead
//! of duplicated. A hash hit is always confirmed with a byte comparison
//! before being trusted, and an accepted match is greedily extended forward
//! as far as the bytes keep agreeing. Matches and indexing never cross a
//! block boundary: closing a block clears every window table.

use std::sync::atomic::{AtomicU64, Ordering};

/// Rolling checksum: low 16 bits are a running byte sum, high 16 bits are a
/// running sum-of-sums, matching rsync's weak checksum.
#[derive(Debug, Clone, Copy, Default)]
pub struct RsyncHash {
    a: u16,
    b: u16,
    len: i32,
}

impl RsyncHash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn digest(&self) -> u32 {
        self.a as u32 | ((self.b as u32) << 16)
    }

    pub fn update(&mut self, inbyte: u8) {
        self.a = self.a.wrapping_add(inbyte as u16);
        self.b = self.b.wrapping_add(self.a);
        self.len += 1;
    }

    /// Slide the window forward by one byte: `outbyte` leaves, `inbyte` enters.
    pub fn roll(&mut self, outbyte: u8, inbyte: u8) {
        self.a = self.a.wrapping_sub(outbyte as u16).wrapping_add(inbyte as u16);
        let delta = (self.len as u32).wrapping_mul(outbyte as u32) as u16;
        self.b = self.b.wrapping_sub(delta);
        self.b = self.b.wrapping_add(self.a);
    }

    pub fn clear(&mut self) {
        self.a = 0;
        self.b = 0;
        self.len = 0;
    }

    /// Digest of a window of `length` repetitions of `byte`, closed form.
    pub fn repeating_window(byte: u8, length: usize) -> u32 {
        let v = byte as u64;
        let length = length as u64;
        let a = (v * length) as u16;
        let b = ((v * length * (length + 1)) / 2) as u16;
        (a as u32) | ((b as u32) << 16)
    }
}

fn hash_window(window: &[u8]) -> u32 {
    let mut h = RsyncHash::new();
    for &b in window {
        h.update(b);
    }
    h.digest()
}

/// Incrementally tracks the rolling hash of the window ending at the last
/// position passed to `advance_to`, re-priming from scratch whenever the
/// scan jumps (e.g. past an accepted match) instead of stepping by one.
struct RollingWindow {
    window_size: usize,
    hash: RsyncHash,
    primed_at: Option<usize>,
}

impl RollingWindow {
    fn new(window_size: usize) -> Self {
        Self {
            window_size,
            hash: RsyncHash::new(),
            primed_at: None,
        }
    }

    fn prime(&mut self, data: &[u8], end: usize) {
        self.hash.clear();
        let start = end + 1 - self.window_size;
        for &b in &data[start..=end] {
            self.hash.update(b);
        }
        self.primed_at = Some(end);
    }

    fn advance_to(&mut self, data: &[u8], end: usize) {
        if end + 1 < self.window_size {
            self.primed_at = None;
            return;
        }
        if let Some(prev) = self.primed_at {
            if end == prev + 1 {
                let outbyte = data[end - self.window_size];
                let inbyte = data[end];
                self.hash.roll(outbyte, inbyte);
                self.primed_at = Some(end);
                return;
            }
        }
        self.prime(data, end);
    }

    fn digest(&self, end: usize) -> Option<u32> {
        (self.primed_at == Some(end)).then(|| self.hash.digest())
    }
}

/// Open-addressed table of window-hash -> block offset, scoped to a single
/// open block. Collisions (same digest, different bytes) are counted but
/// resolved purely by byte comparison, never by rehashing.
struct WindowIndex {
    window_size: usize,
    stride: usize,
    slots: Vec<Option<(u32, usize)>>,
    mask: usize,
    collisions: u64,
}

impl WindowIndex {
    fn new(window_size: usize, stride: usize, table_bits: u32) -> Self {
        let size = 1usize << table_bits;
        Self {
            window_size,
            stride: stride.max(1),
            slots: vec![None; size],
            mask: size - 1,
            collisions: 0,
        }
    }

    fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.collisions = 0;
    }

    fn probe(&mut self, digest: u32, window: &[u8], block: &[u8]) -> Option<usize> {
        let mut idx = (digest as usize) & self.mask;
        for _ in 0..self.slots.len() {
            match self.slots[idx] {
                None => return None,
                Some((h, offset)) => {
                    if h == digest {
                        if block.get(offset..offset + self.window_size) == Some(window) {
                            return Some(offset);
                        }
                        self.collisions += 1;
                    }
                    idx = (idx + 1) & self.mask;
                }
            }
        }
        None
    }

    fn insert(&mut self, digest: u32, offset: usize) {
        let home = (digest as usize) & self.mask;
        let mut idx = home;
        for _ in 0..self.slots.len() {
            if self.slots[idx].is_none() {
                self.slots[idx] = Some((digest, offset));
                return;
            }
            idx = (idx + 1) & self.mask;
        }
        self.slots[home] = Some((digest, offset));
    }
}

#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Window sizes to index, largest first; empty disables segmentation.
    pub window_sizes: Vec<usize>,
    /// Stride for a window of size `w` is `w >> window_increment_shift`.
    pub window_increment_shift: u32,
    pub block_size: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            window_sizes: vec![1 << 12],
            window_increment_shift: 2,
            block_size: 1 << 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegEvent {
    Literal(Vec<u8>),
    Match { offset: usize, len: usize },
    /// The open block reached capacity; here are its final bytes. The next
    /// event (if any) belongs to a fresh, empty block.
    BlockClosed(Vec<u8>),
}

pub struct Segmenter {
    cfg: SegmenterConfig,
    tables: Vec<WindowIndex>,
    strides: Vec<usize>,
    block: Vec<u8>,
    total_collisions: AtomicU64,
}

impl Segmenter {
    pub fn new(cfg: SegmenterConfig, table_bits: u32) -> Self {
        let strides: Vec<usize> = cfg
            .window_sizes
            .iter()
            .map(|&w| (w >> cfg.window_increment_shift).max(1))
            .collect();
        let tables = cfg
            .window_sizes
            .iter()
            .zip(&strides)
            .map(|(&w, &s)| WindowIndex::new(w, s, table_bits))
            .collect();
        Self {
            cfg,
            tables,
            strides,
            block: Vec::new(),
            total_collisions: AtomicU64::new(0),
        }
    }

    pub fn segmentation_enabled(&self) -> bool {
        !self.cfg.window_sizes.is_empty()
    }

    pub fn collisions(&self) -> u64 {
        self.total_collisions.load(Ordering::Relaxed)
    }

    /// Feed one file's full content through the segmenter.
    pub fn process(&mut self, data: &[u8]) -> Vec<SegEvent> {
        let mut spans = Vec::new();

        if !self.segmentation_enabled() || data.is_empty() {
            self.flush_and_index_run(data, 0, data.len(), &mut spans);
            return spans;
        }

        let mut rolling: Vec<RollingWindow> = self
            .cfg
            .window_sizes
            .iter()
            .map(|&w| RollingWindow::new(w))
            .collect();

        let mut run_start = 0usize;
        let mut i = 0usize;

        while i < data.len() {
            for r in rolling.iter_mut() {
                r.advance_to(data, i);
            }

            let mut found: Option<(usize, usize, usize)> = None;
            for (t_idx, table) in self.tables.iter_mut().enumerate() {
                let window_size = table.window_size;
                if window_size == 0 || i + 1 < window_size {
                    continue;
                }
                let window_start = i + 1 - window_size;
                if window_start % self.strides[t_idx] != 0 {
                    continue;
                }
                let Some(digest) = rolling[t_idx].digest(i) else {
                    continue;
                };
                let window = &data[window_start..=i];
                if let Some(offset) = table.probe(digest, window, &self.block) {
                    let mut len = window_size;
                    while window_start + len < data.len()
                        && offset + len < self.block.len()
                        && data[window_start + len] == self.block[offset + len]
                    {
                        len += 1;
                    }
                    found = Some((offset, len, window_start));
                    self.total_collisions
                        .fetch_add(table.collisions, Ordering::Relaxed);
                    table.collisions = 0;
                    break;
                }
                self.total_collisions
                    .fetch_add(table.collisions, Ordering::Relaxed);
                table.collisions = 0;
            }

            match found {
                Some((offset, len, window_start)) => {
                    self.flush_and_index_run(data, run_start, window_start, &mut spans);
                    spans.push(SegEvent::Match { offset, len });
                    i = window_start + len;
                    run_start = i;
                    for r in rolling.iter_mut() {
                        r.primed_at = None;
                    }
                }
                None => {
                    i += 1;
                }
            }
        }

        self.flush_and_index_run(data, run_start, data.len(), &mut spans);
        spans
    }

    /// Closes the currently open block even if it isn't full, returning its
    /// contents if non-empty. Used at the end of the writer pipeline.
    pub fn finish(&mut self) -> Option<SegEvent> {
        if self.block.is_empty() {
            return None;
        }
        let mut spans = Vec::new();
        self.close_block(&mut spans);
        spans.into_iter().next()
    }

    fn close_block(&mut self, spans: &mut Vec<SegEvent>) {
        let finished = std::mem::take(&mut self.block);
        for t in &mut self.tables {
            t.clear();
        }
        spans.push(SegEvent::BlockClosed(finished));
    }

    fn flush_and_index_run(&mut self, data: &[u8], start: usize, end: usize, spans: &mut Vec<SegEvent>) {
        let mut pos = start;
        while pos < end {
            let space = self.cfg.block_size.saturating_sub(self.block.len());
            if space == 0 {
                self.close_block(spans);
                continue;
            }
            let take = space.min(end - pos);
            let chunk_offset_in_block = self.block.len();
            let chunk = &data[pos..pos + take];
            self.block.extend_from_slice(chunk);
            spans.push(SegEvent::Literal(chunk.to_vec()));

            if self.segmentation_enabled() {
                for (t_idx, table) in self.tables.iter_mut().enumerate() {
                    let window_size = table.window_size;
                    if window_size == 0 || window_size > chunk.len() {
                        continue;
                    }
                    let mut local = 0usize;
                    while local + window_size <= chunk.len() {
                        if local % self.strides[t_idx] == 0 {
                            let digest = hash_window(&chunk[local..local + window_size]);
                            table.insert(digest, chunk_offset_in_block + local);
                        }
                        local += 1;
                    }
                }
            }

            pos += take;

            // Close as soon as capacity is reached rather than waiting for a
            // later write to notice: a lingering full-but-open block would
            // let a later match reference data that should already be
            // sealed behind a block boundary.
            if self.block.len() == self.cfg.block_size {
                self.close_block(spans);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsync_hash_roll_matches_fresh_computation() {
        let data = b"the quick brown fox";
        let window_size = 5;
        let mut rolled = RsyncHash::new();
        for &b in &data[0..window_size] {
            rolled.update(b);
        }
        for i in window_size..data.len() {
            rolled.roll(data[i - window_size], data[i]);
            let mut fresh = RsyncHash::new();
            for &b in &data[i + 1 - window_size..=i] {
                fresh.update(b);
            }
            assert_eq!(rolled.digest(), fresh.digest());
        }
    }

    #[test]
    fn repeating_window_matches_incremental_update() {
        let byte = 7u8;
        let length = 6usize;
        let mut h = RsyncHash::new();
        for _ in 0..length {
            h.update(byte);
        }
        assert_eq!(h.digest(), RsyncHash::repeating_window(byte, length));
    }

    fn cfg(window_size: usize, block_size: usize) -> SegmenterConfig {
        SegmenterConfig {
            window_sizes: vec![window_size],
            window_increment_shift: 2,
            block_size,
        }
    }

    #[test]
    fn disabled_segmentation_emits_plain_literals() {
        let mut seg = Segmenter::new(
            SegmenterConfig {
                window_sizes: vec![],
                window_increment_shift: 0,
                block_size: 1024,
            },
            10,
        );
        let spans = seg.process(b"hello world");
        assert_eq!(spans, vec![SegEvent::Literal(b"hello world".to_vec())]);
    }

    #[test]
    fn repeated_block_is_referenced_not_duplicated() {
        let mut seg = Segmenter::new(cfg(8, 1 << 20), 10);
        let chunk = b"abcdefgh".to_vec();

        let first = seg.process(&chunk);
        assert!(first.iter().all(|s| matches!(s, SegEvent::Literal(_))));

        let mut prefix = b"XXXX".to_vec();
        prefix.extend_from_slice(&chunk);
        let second = seg.process(&prefix);

        let has_match = second
            .iter()
            .any(|s| matches!(s, SegEvent::Match { len, .. } if *len >= 8));
        assert!(has_match, "expected a back-reference to the earlier identical chunk: {second:?}");
    }

    #[test]
    fn distinct_content_produces_no_match() {
        let mut seg = Segmenter::new(cfg(8, 1 << 20), 10);
        seg.process(b"abcdefgh");
        let spans = seg.process(b"12345678");
        assert!(spans.iter().all(|s| !matches!(s, SegEvent::Match { .. })));
    }

    #[test]
    fn block_closes_when_capacity_is_reached() {
        let mut seg = Segmenter::new(cfg(4, 8), 10);
        let spans = seg.process(b"0123456789");
        let closed: Vec<_> = spans
            .iter()
            .filter(|s| matches!(s, SegEvent::BlockClosed(_)))
            .collect();
        assert_eq!(closed.len(), 1);
        if let SegEvent::BlockClosed(bytes) = closed[0] {
            assert_eq!(bytes.len(), 8);
        }
    }

    #[test]
    fn finish_flushes_a_partially_filled_block() {
        let mut seg = Segmenter::new(cfg(4, 1024), 10);
        seg.process(b"short");
        let ev = seg.finish().expect("non-empty open block");
        assert_eq!(ev, SegEvent::BlockClosed(b"short".to_vec()));
        assert!(seg.finish().is_none());
    }

    #[test]
    fn match_never_crosses_a_block_boundary() {
        // Block size smaller than the window: the first chunk closes its
        // block before a second, identical chunk arrives, so no match
        // should be found (tables were cleared on close).
        let mut seg = Segmenter::new(cfg(8, 8), 10);
        seg.process(b"abcdefgh");
        let spans = seg.process(b"abcdefgh");
        assert!(spans.iter().all(|s| !matches!(s, SegEvent::Match { .. })));
    }
}
