//! Block cache (C5) — the hard part.
//!
//! Grounded almost verbatim on `original_source/src/dwarfs/block_cache.cpp`:
//! `cached_block` (here `SharedBlock`, with an atomic `decoded_end` and a
//! streaming decoder swapped in for `block_decompressor`), `block_request`/
//! `block_request_set` (here `PendingRead`/`RequestSet`, a min-heap ordered
//! by `end` with a `mpsc` oneshot per request replacing `std::promise`),
//! and `block_cache_<LoggerPolicy>` (here `BlockCache`, with the same
//! two-map split: `lru` for completed/resident blocks, `decompressing` for
//! blocks a worker is actively unpacking).
//!
//! Translated from shared_ptr/weak_ptr/promise into `Arc`/`Weak` plus
//! `std::sync::mpsc` — see `DESIGN.md` for the one safety-driven departure
//! from the original: the growing decode buffer lives behind a `Mutex`
//! instead of being read via raw pointer arithmetic into an
//! unsynchronized `Vec`, trading the original's zero-copy read for a short
//! copy-out, which is sound in safe Rust without `unsafe`.

use crate::codec::{get_codec_by_tag, CodecTag};
use crate::error::CacheError;
use crate::worker::{JobKind, Pool};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};

/// Where the compressed bytes for a block live, supplied by the
/// filesystem facade (which owns the `MappedImage`).
#[derive(Clone)]
pub struct BlockLocation {
    pub codec: CodecTag,
    pub compressed: Arc<[u8]>,
    pub uncompressed_size: u64,
}

pub trait BlockSource: Send + Sync {
    fn block(&self, block_no: u32) -> Option<BlockLocation>;
    fn num_blocks(&self) -> usize;
}

#[derive(Debug, Clone, Copy)]
pub struct BlockCacheOptions {
    pub max_bytes: u64,
    pub num_workers: usize,
    /// Fraction of a block that must be requested before the worker
    /// decodes straight to the block's end instead of stopping exactly at
    /// the requested range (avoids re-entering the decoder for a handful
    /// of trailing bytes).
    pub decompress_ratio: f64,
    pub sequential_prefetch_threshold: u32,
}

impl Default for BlockCacheOptions {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024,
            num_workers: 0,
            decompress_ratio: 0.8,
            sequential_prefetch_threshold: 4,
        }
    }
}

/// One block's decode state, shared between the worker decompressing it
/// and every reader whose range already landed within `decoded_end`.
pub struct SharedBlock {
    block_no: u32,
    buffer: Mutex<Vec<u8>>,
    decoded_end: AtomicU64,
    uncompressed_size: u64,
    decoder: Mutex<Option<Box<dyn crate::codec::Decoder>>>,
}

impl SharedBlock {
    fn new(block_no: u32, location: &BlockLocation) -> Result<Self, CacheError> {
        let codec = get_codec_by_tag(location.codec).map_err(|e| CacheError::Decode {
            block: block_no,
            source: e,
        })?;
        let decoder = codec
            .new_decoder(location.compressed.to_vec())
            .map_err(|e| CacheError::Decode { block: block_no, source: e })?;
        Ok(Self {
            block_no,
            buffer: Mutex::new(Vec::with_capacity(location.uncompressed_size as usize)),
            decoded_end: AtomicU64::new(0),
            uncompressed_size: location.uncompressed_size,
            decoder: Mutex::new(Some(decoder)),
        })
    }

    pub fn decoded_end(&self) -> u64 {
        self.decoded_end.load(Ordering::Acquire)
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size
    }

    /// Decode forward until at least `end` bytes are available, or the
    /// block is fully decoded. Must only be called by the single worker
    /// currently owning this block's `RequestSet`.
    fn decompress_until(&self, end: u64) -> Result<(), CacheError> {
        loop {
            if self.decoded_end() >= end.min(self.uncompressed_size) {
                return Ok(());
            }
            let mut decoder_guard = self.decoder.lock().unwrap();
            let Some(decoder) = decoder_guard.as_mut() else {
                // Decoder already finished; decoded_end is final.
                return Ok(());
            };
            let mut chunk = Vec::new();
            let more = decoder.decompress_frame(&mut chunk).map_err(|e| CacheError::Decode {
                block: self.block_no,
                source: e,
            })?;
            {
                let mut buf = self.buffer.lock().unwrap();
                buf.extend_from_slice(&chunk);
                self.decoded_end.store(buf.len() as u64, Ordering::Release);
            }
            if !more {
                *decoder_guard = None;
            }
        }
    }

    fn read_range(&self, begin: u64, end: u64) -> Result<Vec<u8>, CacheError> {
        let buf = self.buffer.lock().unwrap();
        if end as usize > buf.len() {
            return Err(CacheError::OutOfRange {
                begin,
                end,
                size: buf.len() as u64,
            });
        }
        Ok(buf[begin as usize..end as usize].to_vec())
    }
}

struct PendingRead {
    begin: u64,
    end: u64,
    reply: mpsc::Sender<Result<Vec<u8>, CacheError>>,
}

impl PartialEq for PendingRead {
    fn eq(&self, other: &Self) -> bool {
        self.end == other.end
    }
}
impl Eq for PendingRead {}
impl PartialOrd for PendingRead {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for PendingRead {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse so the smallest `end` pops first,
        // matching block_request_set's `operator<` on `end_`.
        other.end.cmp(&self.end)
    }
}

struct RequestSet {
    block: Arc<SharedBlock>,
    queue: BinaryHeap<PendingRead>,
    range_end: u64,
}

impl RequestSet {
    fn add(&mut self, begin: u64, end: u64, reply: mpsc::Sender<Result<Vec<u8>, CacheError>>) {
        self.range_end = self.range_end.max(end);
        self.queue.push(PendingRead { begin, end, reply });
    }
}

struct CacheState {
    lru_order: VecDeque<u32>,
    lru: HashMap<u32, Arc<SharedBlock>>,
    decompressing: HashMap<u32, Arc<Mutex<RequestSet>>>,
    last_block_touched: Option<u32>,
    sequential_run: u32,
}

pub struct BlockCache {
    source: Arc<dyn BlockSource>,
    pool: Arc<Pool>,
    options: BlockCacheOptions,
    max_blocks: usize,
    state: Mutex<CacheState>,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub blocks_evicted: AtomicU64,
}

impl BlockCache {
    pub fn new(source: Arc<dyn BlockSource>, pool: Arc<Pool>, options: BlockCacheOptions, block_size: u64) -> Self {
        let max_blocks = ((options.max_bytes / block_size.max(1)) as usize).max(1);
        Self {
            source,
            pool,
            options,
            max_blocks,
            state: Mutex::new(CacheState {
                lru_order: VecDeque::new(),
                lru: HashMap::new(),
                decompressing: HashMap::new(),
                last_block_touched: None,
                sequential_run: 0,
            }),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            blocks_evicted: AtomicU64::new(0),
        }
    }

    /// Read `[begin, end)` from `block_no`, blocking the caller until the
    /// bytes are available. Exactly one decompression of a given block is
    /// ever in flight at a time, and `decoded_end` only moves forward.
    ///
    /// Takes `self: &Arc<Self>` because a cache miss hands the decompress
    /// job to the worker pool, which needs a `'static` handle back to the
    /// cache to retire the block into the LRU once done.
    pub fn read(self: &Arc<Self>, block_no: u32, begin: u64, end: u64) -> Result<Vec<u8>, CacheError> {
        self.maybe_prefetch(block_no);

        let mut state = self.state.lock().unwrap();

        if let Some(shared) = state.lru.get(&block_no).cloned() {
            self.touch_lru(&mut state, block_no);
            if shared.decoded_end() >= end {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                drop(state);
                return shared.read_range(begin, end);
            }
            // Resident but not decoded far enough: fall through to extend
            // via a fresh/merged request set, same as a "slow" cache hit.
        }

        if let Some(existing) = state.decompressing.get(&block_no).cloned() {
            let (tx, rx) = mpsc::channel();
            existing.lock().unwrap().add(begin, end, tx);
            drop(state);
            return rx.recv().expect("worker dropped reply sender");
        }

        // Miss: create the block and its first request set, then dispatch
        // a worker to drain it.
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let location = match self.source.block(block_no) {
            Some(l) => l,
            None => {
                return Err(CacheError::OutOfRange {
                    begin,
                    end,
                    size: 0,
                })
            }
        };
        let shared = Arc::new(SharedBlock::new(block_no, &location)?);
        let (tx, rx) = mpsc::channel();
        let mut set = RequestSet {
            block: shared,
            queue: BinaryHeap::new(),
            range_end: 0,
        };
        set.add(begin, end, tx);
        let set = Arc::new(Mutex::new(set));
        state.decompressing.insert(block_no, set);
        drop(state);

        let cache = self.clone();
        self.pool.submit(JobKind::Decompress, move || {
            cache.run_decompress_loop(block_no);
        });
        rx.recv().expect("worker dropped reply sender")
    }

    fn run_decompress_loop(&self, block_no: u32) {
        loop {
            let set = {
                let state = self.state.lock().unwrap();
                match state.decompressing.get(&block_no).cloned() {
                    Some(s) => s,
                    None => return,
                }
            };

            let next = {
                let mut guard = set.lock().unwrap();
                guard.queue.pop().map(|req| (guard.block.clone(), req, guard.queue.is_empty()))
            };

            let Some((shared, req, was_last)) = next else {
                // Nothing left to serve: promote to the LRU and retire.
                let mut state = self.state.lock().unwrap();
                if let Some(set) = state.decompressing.remove(&block_no) {
                    let shared = set.lock().unwrap().block.clone();
                    self.insert_lru(&mut state, block_no, shared);
                }
                return;
            };

            // Rounding up to the end of the block only pays off for the last
            // request in the set: an earlier request still has later,
            // smaller requests queued behind it that must not be forced to
            // wait on a bigger decode than they asked for.
            let target_end = if was_last
                && (req.end as f64) >= shared.uncompressed_size() as f64 * self.options.decompress_ratio
            {
                shared.uncompressed_size()
            } else {
                req.end
            };

            match shared.decompress_until(target_end) {
                Ok(()) => {
                    let result = shared.read_range(req.begin, req.end);
                    // Promote to the LRU before replying: a waiter that
                    // wakes up the instant it receives its reply must
                    // already be able to find the block resident, not
                    // caught in the gap between removal from
                    // `decompressing` and insertion into `lru`.
                    if was_last {
                        let mut state = self.state.lock().unwrap();
                        // Someone may have merged a new request between our
                        // pop and now; only retire if truly empty.
                        if let Some(set_now) = state.decompressing.get(&block_no).cloned() {
                            if set_now.lock().unwrap().queue.is_empty() {
                                state.decompressing.remove(&block_no);
                                self.insert_lru(&mut state, block_no, shared.clone());
                            }
                        }
                    }
                    let _ = req.reply.send(result);
                }
                Err(e) => {
                    // Fail this request and every request still queued for
                    // this block, then drop the block without caching it.
                    let mut state = self.state.lock().unwrap();
                    if let Some(set) = state.decompressing.remove(&block_no) {
                        let mut guard = set.lock().unwrap();
                        while let Some(remaining) = guard.queue.pop() {
                            let _ = remaining.reply.send(Err(CacheError::Decode {
                                block: block_no,
                                source: crate::error::CodecError::DecodeFailed(
                                    "sibling request failed".into(),
                                ),
                            }));
                        }
                    }
                    drop(state);
                    let _ = req.reply.send(Err(CacheError::Decode {
                        block: block_no,
                        source: crate::error::CodecError::DecodeFailed(e.to_string()),
                    }));
                    return;
                }
            }
        }
    }

    fn insert_lru(&self, state: &mut CacheState, block_no: u32, shared: Arc<SharedBlock>) {
        state.lru.insert(block_no, shared);
        state.lru_order.push_back(block_no);
        while state.lru.len() > self.max_blocks {
            if let Some(oldest) = state.lru_order.pop_front() {
                if oldest != block_no {
                    state.lru.remove(&oldest);
                    self.blocks_evicted.fetch_add(1, Ordering::Relaxed);
                }
            } else {
                break;
            }
        }
    }

    fn touch_lru(&self, state: &mut CacheState, block_no: u32) {
        if let Some(pos) = state.lru_order.iter().position(|&b| b == block_no) {
            state.lru_order.remove(pos);
            state.lru_order.push_back(block_no);
        }
    }

    fn maybe_prefetch(&self, block_no: u32) {
        let mut to_prefetch = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let sequential = state.last_block_touched == Some(block_no.wrapping_sub(1));
            state.sequential_run = if sequential { state.sequential_run + 1 } else { 0 };
            state.last_block_touched = Some(block_no);
            if state.sequential_run >= self.options.sequential_prefetch_threshold {
                let free_slots = self.max_blocks.saturating_sub(state.lru.len());
                let k = free_slots.min(2);
                for i in 1..=k as u32 {
                    let candidate = block_no + i;
                    if (candidate as usize) < self.source.num_blocks() && !state.lru.contains_key(&candidate) {
                        to_prefetch.push(candidate);
                    }
                }
            }
        }
        for block_no in to_prefetch {
            if let Some(location) = self.source.block(block_no) {
                let uncompressed_size = location.uncompressed_size;
                if let Ok(shared) = SharedBlock::new(block_no, &location) {
                    let _ = shared.decompress_until(uncompressed_size.min(4096));
                    let mut state = self.state.lock().unwrap();
                    if !state.lru.contains_key(&block_no) && !state.decompressing.contains_key(&block_no) {
                        self.insert_lru(&mut state, block_no, Arc::new(shared));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{get_codec, CodecKind};

    struct TestSource {
        blocks: Vec<(CodecTag, Arc<[u8]>, u64)>,
    }

    impl BlockSource for TestSource {
        fn block(&self, block_no: u32) -> Option<BlockLocation> {
            self.blocks.get(block_no as usize).map(|(codec, data, size)| BlockLocation {
                codec: *codec,
                compressed: data.clone(),
                uncompressed_size: *size,
            })
        }
        fn num_blocks(&self) -> usize {
            self.blocks.len()
        }
    }

    fn make_source(payload: &[u8]) -> Arc<dyn BlockSource> {
        let codec = get_codec(CodecKind::Zstd);
        let compressed = codec.compress(payload, 3).unwrap();
        Arc::new(TestSource {
            blocks: vec![(CodecKind::Zstd.tag(), Arc::from(compressed.into_boxed_slice()), payload.len() as u64)],
        })
    }

    #[test]
    fn reads_exact_range() {
        let payload = b"0123456789abcdefghij".to_vec();
        let source = make_source(&payload);
        let pool = Arc::new(Pool::new(2, 8));
        let cache = Arc::new(BlockCache::new(source, pool, BlockCacheOptions::default(), 4096));
        let got = cache.read(0, 3, 10).unwrap();
        assert_eq!(got, payload[3..10]);
    }

    #[test]
    fn second_read_is_a_cache_hit() {
        let payload = b"the quick brown fox".to_vec();
        let source = make_source(&payload);
        let pool = Arc::new(Pool::new(2, 8));
        let cache = Arc::new(BlockCache::new(source, pool, BlockCacheOptions::default(), 4096));
        cache.read(0, 0, payload.len() as u64).unwrap();
        let before_misses = cache.cache_misses.load(Ordering::Relaxed);
        cache.read(0, 0, 4).unwrap();
        assert_eq!(cache.cache_misses.load(Ordering::Relaxed), before_misses);
        assert!(cache.cache_hits.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn concurrent_reads_of_same_block_all_succeed() {
        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let source = make_source(&payload);
        let pool = Arc::new(Pool::new(4, 16));
        let cache = Arc::new(BlockCache::new(source, pool, BlockCacheOptions::default(), 4096));

        let mut handles = Vec::new();
        for i in 0..8u64 {
            let cache = cache.clone();
            let payload = payload.clone();
            handles.push(std::thread::spawn(move || {
                let begin = i * 100;
                let end = begin + 50;
                let got = cache.read(0, begin, end).unwrap();
                assert_eq!(got, payload[begin as usize..end as usize]);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn out_of_range_request_errors() {
        let payload = b"short".to_vec();
        let source = make_source(&payload);
        let pool = Arc::new(Pool::new(1, 4));
        let cache = Arc::new(BlockCache::new(source, pool, BlockCacheOptions::default(), 4096));
        assert!(cache.read(0, 0, 1000).is_err());
    }
}
