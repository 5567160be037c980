//! Codec registry (C1).
//!
//! Every codec is compiled in, so identity is a single frozen byte tag
//! instead of the 16-byte UUID the teacher uses for its out-of-tree plugin
//! surface (see `DESIGN.md`). The tag is written into every section header
//! and is never negotiated at runtime: a reader that doesn't recognise a
//! tag fails immediately, same discipline as the teacher's `CodecId`.
//!
//! Beyond one-shot `compress`/`decompress`, each codec also exposes a
//! streaming decoder (`new_decoder` + `Decoder::decompress_frame`) so the
//! block cache (C5) can decompress a block incrementally instead of paying
//! for the whole block just to serve a small read.

use crate::error::CodecError;
use std::io::{Cursor, Read, Write};

/// On-disk codec identity. One byte, frozen once shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodecTag(pub u8);

pub const TAG_NONE: CodecTag = CodecTag(0);
pub const TAG_ZSTD: CodecTag = CodecTag(1);
pub const TAG_LZ4: CodecTag = CodecTag(2);
pub const TAG_BROTLI: CodecTag = CodecTag(3);
pub const TAG_LZMA: CodecTag = CodecTag(4);
pub const TAG_FSST: CodecTag = CodecTag(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    None,
    Zstd,
    Lz4,
    Brotli,
    Lzma,
    Fsst,
}

impl CodecKind {
    pub fn tag(self) -> CodecTag {
        match self {
            CodecKind::None => TAG_NONE,
            CodecKind::Zstd => TAG_ZSTD,
            CodecKind::Lz4 => TAG_LZ4,
            CodecKind::Brotli => TAG_BROTLI,
            CodecKind::Lzma => TAG_LZMA,
            CodecKind::Fsst => TAG_FSST,
        }
    }

    pub fn from_tag(tag: CodecTag) -> Option<Self> {
        match tag {
            TAG_NONE => Some(CodecKind::None),
            TAG_ZSTD => Some(CodecKind::Zstd),
            TAG_LZ4 => Some(CodecKind::Lz4),
            TAG_BROTLI => Some(CodecKind::Brotli),
            TAG_LZMA => Some(CodecKind::Lzma),
            TAG_FSST => Some(CodecKind::Fsst),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CodecKind::None => "none",
            CodecKind::Zstd => "zstd",
            CodecKind::Lz4 => "lz4",
            CodecKind::Brotli => "brotli",
            CodecKind::Lzma => "lzma",
            CodecKind::Fsst => "fsst",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(CodecKind::None),
            "zstd" => Some(CodecKind::Zstd),
            "lz4" => Some(CodecKind::Lz4),
            "brotli" => Some(CodecKind::Brotli),
            "lzma" => Some(CodecKind::Lzma),
            "fsst" => Some(CodecKind::Fsst),
            _ => None,
        }
    }
}

/// A streaming decoder over one block's compressed payload. `decompress_frame`
/// appends whatever it can decode this call into `out` and returns whether
/// more output remains — the block cache calls it in a loop until either the
/// caller-requested range is satisfied or it returns `false`.
pub trait Decoder: Send {
    fn decompress_frame(&mut self, out: &mut Vec<u8>) -> Result<bool, CodecError>;
}

pub trait Codec: Send + Sync {
    fn kind(&self) -> CodecKind;
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
    fn new_decoder(&self, data: Vec<u8>) -> Result<Box<dyn Decoder>, CodecError>;
}

// ── NoneCodec ────────────────────────────────────────────────────────────

pub struct NoneCodec;

struct NoneDecoder {
    data: Vec<u8>,
    pos: usize,
}

impl Decoder for NoneDecoder {
    fn decompress_frame(&mut self, out: &mut Vec<u8>) -> Result<bool, CodecError> {
        const CHUNK: usize = 64 * 1024;
        let end = (self.pos + CHUNK).min(self.data.len());
        out.extend_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(self.pos < self.data.len())
    }
}

impl Codec for NoneCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::None
    }
    fn compress(&self, data: &[u8], _level: i32) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
    fn new_decoder(&self, data: Vec<u8>) -> Result<Box<dyn Decoder>, CodecError> {
        Ok(Box::new(NoneDecoder { data, pos: 0 }))
    }
}

// ── ZstdCodec ────────────────────────────────────────────────────────────

pub struct ZstdCodec;

struct ZstdDecoder<'a> {
    inner: zstd::stream::Decoder<'a, std::io::BufReader<Cursor<Vec<u8>>>>,
    done: bool,
}

impl<'a> Decoder for ZstdDecoder<'a> {
    fn decompress_frame(&mut self, out: &mut Vec<u8>) -> Result<bool, CodecError> {
        if self.done {
            return Ok(false);
        }
        let mut buf = [0u8; 64 * 1024];
        let n = self
            .inner
            .read(&mut buf)
            .map_err(|e| CodecError::DecodeFailed(e.to_string()))?;
        out.extend_from_slice(&buf[..n]);
        if n == 0 {
            self.done = true;
        }
        Ok(!self.done)
    }
}

impl Codec for ZstdCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Zstd
    }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, level).map_err(|e| CodecError::CompressFailed(e.to_string()))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::decode_all(data).map_err(|e| CodecError::DecodeFailed(e.to_string()))
    }
    fn new_decoder(&self, data: Vec<u8>) -> Result<Box<dyn Decoder>, CodecError> {
        let inner = zstd::stream::Decoder::new(Cursor::new(data))
            .map_err(|e| CodecError::DecodeFailed(e.to_string()))?;
        Ok(Box::new(ZstdDecoder { inner, done: false }))
    }
}

// ── Lz4Codec ─────────────────────────────────────────────────────────────

pub struct Lz4Codec;

/// `lz4_flex` has no streaming decompressor in this crate's dependency set,
/// so the "frame" here is the whole block, same limitation documented for
/// LZMA below.
struct BufferedDecoder {
    data: Vec<u8>,
    pos: usize,
}

impl Decoder for BufferedDecoder {
    fn decompress_frame(&mut self, out: &mut Vec<u8>) -> Result<bool, CodecError> {
        const CHUNK: usize = 64 * 1024;
        let end = (self.pos + CHUNK).min(self.data.len());
        out.extend_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(self.pos < self.data.len())
    }
}

impl Codec for Lz4Codec {
    fn kind(&self) -> CodecKind {
        CodecKind::Lz4
    }
    fn compress(&self, data: &[u8], _level: i32) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::compress_prepend_size(data))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| CodecError::DecodeFailed(e.to_string()))
    }
    fn new_decoder(&self, data: Vec<u8>) -> Result<Box<dyn Decoder>, CodecError> {
        let decoded = self.decompress(&data)?;
        Ok(Box::new(BufferedDecoder { data: decoded, pos: 0 }))
    }
}

// ── BrotliCodec ──────────────────────────────────────────────────────────

pub struct BrotliCodec;

struct BrotliDecoder {
    inner: brotli::Decompressor<Cursor<Vec<u8>>>,
    done: bool,
}

impl Decoder for BrotliDecoder {
    fn decompress_frame(&mut self, out: &mut Vec<u8>) -> Result<bool, CodecError> {
        if self.done {
            return Ok(false);
        }
        let mut buf = [0u8; 64 * 1024];
        let n = self
            .inner
            .read(&mut buf)
            .map_err(|e| CodecError::DecodeFailed(e.to_string()))?;
        out.extend_from_slice(&buf[..n]);
        if n == 0 {
            self.done = true;
        }
        Ok(!self.done)
    }
}

impl Codec for BrotliCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Brotli
    }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        let quality = level.clamp(0, 11) as u32;
        let mut out = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut out, 4096, quality, 22);
            w.write_all(data)
                .map_err(|e| CodecError::CompressFailed(e.to_string()))?;
        }
        Ok(out)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        brotli::Decompressor::new(data, 4096)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::DecodeFailed(e.to_string()))?;
        Ok(out)
    }
    fn new_decoder(&self, data: Vec<u8>) -> Result<Box<dyn Decoder>, CodecError> {
        let inner = brotli::Decompressor::new(Cursor::new(data), 4096);
        Ok(Box::new(BrotliDecoder { inner, done: false }))
    }
}

// ── LzmaCodec ────────────────────────────────────────────────────────────

pub struct LzmaCodec;

impl Codec for LzmaCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Lzma
    }
    fn compress(&self, data: &[u8], _level: i32) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut Cursor::new(data), &mut out)
            .map_err(|e| CodecError::CompressFailed(e.to_string()))?;
        Ok(out)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_decompress(&mut Cursor::new(data), &mut out)
            .map_err(|e| CodecError::DecodeFailed(e.to_string()))?;
        Ok(out)
    }
    fn new_decoder(&self, data: Vec<u8>) -> Result<Box<dyn Decoder>, CodecError> {
        // `lzma-rs` has no incremental API; decode the whole block up front
        // and replay it frame-wise, same documented limitation as the
        // teacher's note that lzma is the slowest, single-threaded codec.
        let decoded = self.decompress(&data)?;
        Ok(Box::new(BufferedDecoder { data: decoded, pos: 0 }))
    }
}

// ── FsstCodec ────────────────────────────────────────────────────────────

/// A simplified dictionary coder standing in for real FSST (see
/// `DESIGN.md`'s Open Questions): it builds an order-0 byte->code table
/// from the 255 most frequent bytes and emits `[escape][literal]` pairs for
/// the rest. Good enough for the metadata string tables it targets
/// (`names[]`), not intended to compete with zstd on arbitrary file data.
pub struct FsstCodec;

const FSST_ESCAPE: u8 = 0xFF;

impl Codec for FsstCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Fsst
    }

    fn compress(&self, data: &[u8], _level: i32) -> Result<Vec<u8>, CodecError> {
        let mut counts = [0u64; 256];
        for &b in data {
            counts[b as usize] += 1;
        }
        let mut order: Vec<u8> = (0..=254u8).collect();
        order.sort_by(|&a, &b| counts[b as usize].cmp(&counts[a as usize]));
        let mut code_of = [0u8; 256];
        for (code, &byte) in order.iter().enumerate() {
            code_of[byte as usize] = code as u8;
        }

        let mut out = Vec::with_capacity(data.len() + 256 + 8);
        out.extend_from_slice(&(data.len() as u64).to_le_bytes());
        out.extend_from_slice(&order); // 255-byte table: code -> byte
        for &b in data {
            if b == 255 {
                out.push(FSST_ESCAPE);
                out.push(b);
            } else {
                out.push(code_of[b as usize]);
            }
        }
        Ok(out)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        if data.len() < 8 + 255 {
            return Err(CodecError::DecodeFailed("fsst header truncated".into()));
        }
        let orig_len = u64::from_le_bytes(data[0..8].try_into().unwrap()) as usize;
        let table = &data[8..8 + 255];
        let mut byte_of = [0u8; 255];
        byte_of.copy_from_slice(table);
        let payload = &data[8 + 255..];

        let mut out = Vec::with_capacity(orig_len);
        let mut i = 0;
        while i < payload.len() && out.len() < orig_len {
            let code = payload[i];
            if code == FSST_ESCAPE {
                i += 1;
                out.push(payload[i]);
            } else {
                out.push(byte_of[code as usize]);
            }
            i += 1;
        }
        Ok(out)
    }

    fn new_decoder(&self, data: Vec<u8>) -> Result<Box<dyn Decoder>, CodecError> {
        let decoded = self.decompress(&data)?;
        Ok(Box::new(BufferedDecoder { data: decoded, pos: 0 }))
    }
}

// ── Factory ──────────────────────────────────────────────────────────────

pub fn get_codec(kind: CodecKind) -> Box<dyn Codec> {
    match kind {
        CodecKind::None => Box::new(NoneCodec),
        CodecKind::Zstd => Box::new(ZstdCodec),
        CodecKind::Lz4 => Box::new(Lz4Codec),
        CodecKind::Brotli => Box::new(BrotliCodec),
        CodecKind::Lzma => Box::new(LzmaCodec),
        CodecKind::Fsst => Box::new(FsstCodec),
    }
}

pub fn get_codec_by_tag(tag: CodecTag) -> Result<Box<dyn Codec>, CodecError> {
    CodecKind::from_tag(tag)
        .map(get_codec)
        .ok_or(CodecError::UnknownTag(tag.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(kind: CodecKind, data: &[u8]) {
        let codec = get_codec(kind);
        let compressed = codec.compress(data, 3).unwrap();
        let decompressed = codec.decompress(&compressed).unwrap();
        assert_eq!(decompressed, data, "codec {:?} round trip failed", kind);
    }

    #[test]
    fn all_codecs_round_trip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(50);
        for kind in [
            CodecKind::None,
            CodecKind::Zstd,
            CodecKind::Lz4,
            CodecKind::Brotli,
            CodecKind::Lzma,
            CodecKind::Fsst,
        ] {
            round_trip(kind, &data);
        }
    }

    #[test]
    fn streaming_decoder_matches_one_shot() {
        let data = b"abcabcabcabcabcabcabcabc".repeat(200);
        let codec = get_codec(CodecKind::Zstd);
        let compressed = codec.compress(&data, 3).unwrap();
        let mut decoder = codec.new_decoder(compressed).unwrap();
        let mut out = Vec::new();
        while decoder.decompress_frame(&mut out).unwrap() {}
        assert_eq!(out, data);
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(get_codec_by_tag(CodecTag(200)).is_err());
    }

    #[test]
    fn tag_round_trips_through_kind() {
        for kind in [CodecKind::None, CodecKind::Zstd, CodecKind::Fsst] {
            assert_eq!(CodecKind::from_tag(kind.tag()), Some(kind));
        }
    }
}
