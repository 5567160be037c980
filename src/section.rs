//! Section framing (C2) — the image-wide header plus the self-describing
//! per-section header that replaces the teacher's two-tier
//! `Superblock`/`BlockHeader` split (see `superblock.rs`/`block.rs`,
//! dropped in the final trim pass).
//!
//! # Image layout
//!
//! ```text
//! [optional opaque HEADER bytes, e.g. a shebang script] MAGIC VERSION
//! SECTION* [INDEX section]
//! ```
//!
//! `MAGIC` can be preceded by arbitrary bytes (a self-extracting prefix);
//! a reader locates it by scanning forward, exactly as `original_source`'s
//! `mkdwarfs --header` feature requires. Every section after that point has
//! its own 28-byte header with a dedicated magic, a CRC32 covering header
//! and payload, and a frozen codec tag (see `codec.rs`).
//!
//! # Endianness
//! All numeric fields are little-endian, same discipline the teacher
//! documents for `Superblock`/`BlockHeader`.

use crate::codec::{get_codec_by_tag, CodecTag};
use crate::error::SectionError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use std::io::{self, Read, Write};

pub const IMAGE_MAGIC: &[u8; 6] = b"DWARFS";
pub const FORMAT_MAJOR: u8 = 2;
pub const FORMAT_MINOR: u8 = 5;
/// Bytes scanned from the start of the file looking for `IMAGE_MAGIC`,
/// bounding the size of an allowed opaque prefix.
pub const MAX_HEADER_SCAN: usize = 16 * 1024 * 1024;

pub const SECTION_MAGIC: u32 = 0x4353_5744; // "DWSC" read as LE u32
pub const SECTION_HEADER_SIZE: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SectionType {
    Block = 0,
    Schema = 1,
    Metadata = 2,
    History = 3,
    Index = 4,
}

impl SectionType {
    pub fn from_u8(v: u8) -> Result<Self, SectionError> {
        match v {
            0 => Ok(SectionType::Block),
            1 => Ok(SectionType::Schema),
            2 => Ok(SectionType::Metadata),
            3 => Ok(SectionType::History),
            4 => Ok(SectionType::Index),
            other => Err(SectionError::UnknownType(other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SectionHeader {
    pub section_type: SectionType,
    pub codec: CodecTag,
    pub flags: u16,
    /// Bytes of the compressed payload immediately following this header.
    pub length: u64,
    /// Size of the payload once decompressed; lets callers preallocate and
    /// lets the block cache know a block's full extent up front.
    pub uncompressed_length: u64,
}

impl SectionHeader {
    fn encode(&self) -> [u8; SECTION_HEADER_SIZE] {
        let mut buf = [0u8; SECTION_HEADER_SIZE];
        buf[0..4].copy_from_slice(&SECTION_MAGIC.to_le_bytes());
        buf[4] = self.section_type as u8;
        buf[5] = self.codec.0;
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..16].copy_from_slice(&self.length.to_le_bytes());
        buf[16..24].copy_from_slice(&self.uncompressed_length.to_le_bytes());
        // bytes 24..28 (checksum) left zeroed; filled in by the caller after
        // the header+payload CRC is computed.
        buf
    }
}

/// Compress `data` with `codec` and write a complete section (header +
/// payload) to `w`. Returns the number of bytes written.
pub fn write_section<W: Write>(
    mut w: W,
    section_type: SectionType,
    codec: CodecTag,
    level: i32,
    data: &[u8],
) -> Result<u64, SectionError> {
    let compressor = get_codec_by_tag(codec)?;
    let payload = compressor
        .compress(data, level)
        .map_err(|e| SectionError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;

    let header = SectionHeader {
        section_type,
        codec,
        flags: 0,
        length: payload.len() as u64,
        uncompressed_length: data.len() as u64,
    };
    let mut buf = header.encode();

    let mut h = Hasher::new();
    h.update(&buf[..24]);
    h.update(&payload);
    let checksum = h.finalize();
    buf[24..28].copy_from_slice(&checksum.to_le_bytes());

    w.write_all(&buf)?;
    w.write_all(&payload)?;
    Ok((SECTION_HEADER_SIZE + payload.len()) as u64)
}

/// Parsed section header plus the byte range of its (still compressed)
/// payload relative to the start of the header read.
pub struct ParsedSection {
    pub header: SectionHeader,
    pub payload: Vec<u8>,
}

/// Read one section (header + payload) from a sequential reader, verifying
/// the CRC32 unless `skip_check` is set (the `dwarfsck --no-check` path).
pub fn read_section<R: Read>(mut r: R, skip_check: bool) -> Result<ParsedSection, SectionError> {
    let mut hdr_buf = [0u8; SECTION_HEADER_SIZE];
    r.read_exact(&mut hdr_buf)?;

    let magic = u32::from_le_bytes(hdr_buf[0..4].try_into().unwrap());
    if magic != SECTION_MAGIC {
        return Err(SectionError::BadMagic);
    }
    let section_type = SectionType::from_u8(hdr_buf[4])?;
    let codec = CodecTag(hdr_buf[5]);
    let flags = u16::from_le_bytes(hdr_buf[6..8].try_into().unwrap());
    let length = u64::from_le_bytes(hdr_buf[8..16].try_into().unwrap());
    let uncompressed_length = u64::from_le_bytes(hdr_buf[16..24].try_into().unwrap());
    let stored_checksum = u32::from_le_bytes(hdr_buf[24..28].try_into().unwrap());

    let mut payload = vec![0u8; length as usize];
    r.read_exact(&mut payload)?;

    if !skip_check {
        let mut h = Hasher::new();
        h.update(&hdr_buf[..24]);
        h.update(&payload);
        if h.finalize() != stored_checksum {
            return Err(SectionError::ChecksumMismatch {
                section_type: section_type as u8,
                offset: 0,
            });
        }
    }

    Ok(ParsedSection {
        header: SectionHeader {
            section_type,
            codec,
            flags,
            length,
            uncompressed_length,
        },
        payload,
    })
}

/// Parse a section header in place within an in-memory image (used by the
/// block cache, which maps the payload instead of copying it). Returns the
/// header and the payload's `[start, end)` byte range within `image`.
pub fn parse_section_header_at(
    image: &[u8],
    offset: usize,
) -> Result<(SectionHeader, std::ops::Range<usize>), SectionError> {
    if offset + SECTION_HEADER_SIZE > image.len() {
        return Err(SectionError::Truncated(SECTION_HEADER_SIZE as u64));
    }
    let hdr_buf = &image[offset..offset + SECTION_HEADER_SIZE];
    let magic = u32::from_le_bytes(hdr_buf[0..4].try_into().unwrap());
    if magic != SECTION_MAGIC {
        return Err(SectionError::BadMagic);
    }
    let section_type = SectionType::from_u8(hdr_buf[4])?;
    let codec = CodecTag(hdr_buf[5]);
    let flags = u16::from_le_bytes(hdr_buf[6..8].try_into().unwrap());
    let length = u64::from_le_bytes(hdr_buf[8..16].try_into().unwrap());
    let uncompressed_length = u64::from_le_bytes(hdr_buf[16..24].try_into().unwrap());

    let payload_start = offset + SECTION_HEADER_SIZE;
    let payload_end = payload_start + length as usize;
    if payload_end > image.len() {
        return Err(SectionError::Truncated(length));
    }

    Ok((
        SectionHeader {
            section_type,
            codec,
            flags,
            length,
            uncompressed_length,
        },
        payload_start..payload_end,
    ))
}

/// Verify the checksum of a section whose bytes are already resident in
/// memory (the `dwarfsck` consistency-check path, and the default-on path
/// for non-BLOCK sections which are always read eagerly).
pub fn verify_section_checksum(image: &[u8], offset: usize) -> Result<(), SectionError> {
    let hdr_buf = &image[offset..offset + SECTION_HEADER_SIZE];
    let stored_checksum = u32::from_le_bytes(hdr_buf[24..28].try_into().unwrap());
    let (_header, range) = parse_section_header_at(image, offset)?;
    let mut h = Hasher::new();
    h.update(&hdr_buf[..24]);
    h.update(&image[range]);
    if h.finalize() != stored_checksum {
        return Err(SectionError::ChecksumMismatch {
            section_type: hdr_buf[4],
            offset: offset as u64,
        });
    }
    Ok(())
}

/// Write the image-wide magic + version. Call once, after any opaque
/// header bytes, before the first section.
pub fn write_image_header<W: Write>(mut w: W) -> io::Result<()> {
    w.write_all(IMAGE_MAGIC)?;
    w.write_u8(FORMAT_MAJOR)?;
    w.write_u8(FORMAT_MINOR)?;
    Ok(())
}

/// Scan `data` for `IMAGE_MAGIC`, returning the byte offset it starts at.
/// Returns `None` if not found within `MAX_HEADER_SCAN` bytes.
pub fn find_image_start(data: &[u8]) -> Option<usize> {
    let scan_end = data.len().min(MAX_HEADER_SCAN);
    data[..scan_end]
        .windows(IMAGE_MAGIC.len())
        .position(|w| w == IMAGE_MAGIC)
}

/// Read and validate the 2-byte version following the magic at `offset`.
pub fn read_image_version(data: &[u8], offset: usize) -> Result<(u8, u8), SectionError> {
    let vstart = offset + IMAGE_MAGIC.len();
    if vstart + 2 > data.len() {
        return Err(SectionError::Truncated(2));
    }
    let mut cursor = &data[vstart..vstart + 2];
    let major = cursor.read_u8()?;
    let minor = cursor.read_u8()?;
    Ok((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TAG_ZSTD;

    #[test]
    fn write_then_read_section_round_trips() {
        let data = b"hello dwarfs section framing".repeat(10);
        let mut buf = Vec::new();
        write_section(&mut buf, SectionType::Metadata, TAG_ZSTD, 3, &data).unwrap();

        let parsed = read_section(&buf[..], false).unwrap();
        assert_eq!(parsed.header.section_type, SectionType::Metadata);
        let codec = get_codec_by_tag(parsed.header.codec).unwrap();
        let decoded = codec.decompress(&parsed.payload).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn corrupt_payload_is_detected() {
        let data = b"corrupt me".to_vec();
        let mut buf = Vec::new();
        write_section(&mut buf, SectionType::Schema, TAG_ZSTD, 3, &data).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        assert!(matches!(
            read_section(&buf[..], false),
            Err(SectionError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn skip_check_bypasses_checksum() {
        let data = b"corrupt me too".to_vec();
        let mut buf = Vec::new();
        write_section(&mut buf, SectionType::Schema, TAG_ZSTD, 3, &data).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        // checksum would fail, but since the corrupted byte is payload data
        // and not structural, a skip-check read still succeeds structurally.
        assert!(read_section(&buf[..], true).is_ok());
    }

    #[test]
    fn finds_magic_after_opaque_prefix() {
        let mut image = b"#!/bin/sh\nexit 0\n".to_vec();
        let prefix_len = image.len();
        write_image_header(&mut image).unwrap();
        let offset = find_image_start(&image).unwrap();
        assert_eq!(offset, prefix_len);
        let (major, minor) = read_image_version(&image, offset).unwrap();
        assert_eq!((major, minor), (FORMAT_MAJOR, FORMAT_MINOR));
    }

    #[test]
    fn parse_header_at_offset_matches_sequential_read() {
        let data = b"in-memory parse path".repeat(4);
        let mut image = Vec::new();
        write_section(&mut image, SectionType::Block, TAG_ZSTD, 3, &data).unwrap();
        let (header, range) = parse_section_header_at(&image, 0).unwrap();
        assert_eq!(header.uncompressed_length, data.len() as u64);
        assert_eq!(range.len(), header.length as usize);
        verify_section_checksum(&image, 0).unwrap();
    }
}
