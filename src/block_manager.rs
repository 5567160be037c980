//! Block assembly and filesystem writer (C12).
//!
//! Generalizes the teacher's `io_stream::SixCyWriter`: instead of one
//! open buffer per file shipped to compression as soon as that file is
//! done, one open block is shared across however many files fit before it
//! closes. [`segmenter::Segmenter`] decides the literal/back-reference
//! boundaries within that shared block; `BlockManager` turns its events
//! into the `(block_index, offset, size)` chunk triples spec.md §3
//! describes and, once a block closes, hands its raw bytes to a
//! `Compress` job on the shared [`worker::Pool`] — mirroring the teacher's
//! `block_dedup` CAS map, whose `archive_offset` is likewise assigned in
//! submission order rather than completion order.

use crate::codec::CodecTag;
use crate::error::SectionError;
use crate::progress::Progress;
use crate::section::{self, SectionType};
use crate::segmenter::{SegEvent, Segmenter};
use crate::worker::{JobKind, Pool};
use crossbeam_channel::{bounded, Receiver};
use std::io::{self, Write};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRef {
    pub block_index: u32,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct BlockManagerConfig {
    pub codec: CodecTag,
    pub compression_level: i32,
}

/// Encoded section bytes for one closed block, or the error hit while
/// compressing it; produced on a worker thread, consumed at `finalize`.
type CompressResult = Result<Vec<u8>, SectionError>;

pub struct BlockManager<'a> {
    pool: &'a Pool,
    progress: Arc<Progress>,
    config: BlockManagerConfig,
    segmenter: Segmenter,
    current_block_index: u32,
    current_offset: u32,
    pending: Vec<Receiver<CompressResult>>,
}

impl<'a> BlockManager<'a> {
    pub fn new(pool: &'a Pool, progress: Arc<Progress>, segmenter: Segmenter, config: BlockManagerConfig) -> Self {
        Self {
            pool,
            progress,
            config,
            segmenter,
            current_block_index: 0,
            current_offset: 0,
            pending: Vec::new(),
        }
    }

    /// Feed one file's bytes through the segmenter, returning its chunk
    /// list (the sequence a reader replays to reconstruct the file).
    pub fn add_file(&mut self, data: &[u8]) -> Vec<ChunkRef> {
        let events = self.segmenter.process(data);
        self.apply_events(events)
    }

    fn apply_events(&mut self, events: Vec<SegEvent>) -> Vec<ChunkRef> {
        let mut chunks = Vec::with_capacity(events.len());
        for event in events {
            match event {
                SegEvent::Literal(bytes) => {
                    let size = bytes.len() as u32;
                    chunks.push(ChunkRef {
                        block_index: self.current_block_index,
                        offset: self.current_offset,
                        size,
                    });
                    self.current_offset += size;
                }
                SegEvent::Match { offset, len } => {
                    chunks.push(ChunkRef {
                        block_index: self.current_block_index,
                        offset: offset as u32,
                        size: len as u32,
                    });
                }
                SegEvent::BlockClosed(bytes) => {
                    self.submit_block(bytes);
                    self.current_block_index += 1;
                    self.current_offset = 0;
                }
            }
        }
        chunks
    }

    /// Closes whatever block is still open (even partially full). Must be
    /// called once, after the last `add_file`, before `finalize`.
    pub fn flush(&mut self) {
        if let Some(SegEvent::BlockClosed(bytes)) = self.segmenter.finish() {
            self.submit_block(bytes);
            self.current_block_index += 1;
            self.current_offset = 0;
        }
    }

    fn submit_block(&mut self, raw: Vec<u8>) {
        let (tx, rx) = bounded::<CompressResult>(1);
        self.pending.push(rx);
        let codec = self.config.codec;
        let level = self.config.compression_level;
        let progress = self.progress.clone();
        let uncompressed_len = raw.len() as u64;

        self.pool.submit(JobKind::Compress, move || {
            let mut buf = Vec::new();
            let result = section::write_section(&mut buf, SectionType::Block, codec, level, &raw)
                .map(|_| buf);
            if let Ok(ref bytes) = result {
                Progress::bump(&progress.blocks_written, 1);
                Progress::bump(&progress.bytes_uncompressed, uncompressed_len);
                Progress::bump(&progress.bytes_compressed, bytes.len() as u64);
            }
            let _ = tx.send(result);
        });
    }

    /// Drains every pending compression job in block-submission order and
    /// writes the finished sections to `w`. Must be called after `flush`.
    pub fn finalize<W: Write>(&mut self, mut w: W) -> io::Result<()> {
        for rx in self.pending.drain(..) {
            let encoded = rx
                .recv()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "compress job channel closed early"))?
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            w.write_all(&encoded)?;
        }
        Ok(())
    }

    pub fn blocks_submitted(&self) -> u32 {
        self.current_block_index
    }

    pub fn collisions(&self) -> u64 {
        self.segmenter.collisions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TAG_ZSTD;
    use crate::progress::{Level, Progress};
    use crate::section::read_section;
    use crate::segmenter::SegmenterConfig;
    use std::sync::Arc;

    fn manager(pool: &Pool) -> BlockManager<'_> {
        let cfg = SegmenterConfig {
            window_sizes: vec![8],
            window_increment_shift: 2,
            block_size: 32,
        };
        let segmenter = Segmenter::new(cfg, 10);
        let progress = Arc::new(Progress::new(Level::Error));
        BlockManager::new(
            pool,
            progress,
            segmenter,
            BlockManagerConfig {
                codec: TAG_ZSTD,
                compression_level: 3,
            },
        )
    }

    #[test]
    fn single_small_file_produces_one_literal_chunk_after_flush() {
        let pool = Pool::new(1, 8);
        let mut mgr = manager(&pool);
        let chunks = mgr.add_file(b"hello world");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], ChunkRef { block_index: 0, offset: 0, size: 11 });

        mgr.flush();
        assert_eq!(mgr.blocks_submitted(), 1);

        let mut out = Vec::new();
        mgr.finalize(&mut out).unwrap();

        let parsed = read_section(&out[..], false).unwrap();
        assert_eq!(parsed.header.uncompressed_length, 11);
        pool.shutdown();
    }

    #[test]
    fn duplicate_content_across_files_shares_a_back_reference() {
        let pool = Pool::new(1, 8);
        let mut mgr = manager(&pool);
        let first = mgr.add_file(b"abcdefgh");
        assert_eq!(first, vec![ChunkRef { block_index: 0, offset: 0, size: 8 }]);

        let second = mgr.add_file(b"abcdefgh");
        assert_eq!(second, vec![ChunkRef { block_index: 0, offset: 0, size: 8 }]);

        mgr.flush();
        assert_eq!(mgr.blocks_submitted(), 1);
        pool.shutdown();
    }

    #[test]
    fn block_boundary_starts_a_new_block_index() {
        let pool = Pool::new(1, 8);
        let mut mgr = manager(&pool);
        // block_size is 32; two 20-byte files force a second block.
        let a = vec![b'a'; 20];
        let b = vec![b'b'; 20];
        let chunks_a = mgr.add_file(&a);
        let chunks_b = mgr.add_file(&b);

        assert_eq!(chunks_a[0].block_index, 0);
        assert!(chunks_b.iter().any(|c| c.block_index == 1));

        mgr.flush();
        let mut out = Vec::new();
        mgr.finalize(&mut out).unwrap();

        let mut slice = &out[..];
        let mut sections = 0;
        while !slice.is_empty() {
            let parsed = read_section(slice, false).unwrap();
            sections += 1;
            let consumed = crate::section::SECTION_HEADER_SIZE + parsed.payload.len();
            slice = &slice[consumed..];
        }
        assert_eq!(sections, mgr.blocks_submitted() as usize);
        pool.shutdown();
    }
}
