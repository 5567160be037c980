//! Mapped image (C3) — zero-copy access to the on-disk archive, with a
//! buffered-read fallback when mmap isn't available or fails (an empty
//! file, or a filesystem that doesn't support it).
//!
//! Grounded on `other_examples/cpg314-squashfs-async` and
//! `other_examples/alexqqqqqq777-BlitzArch`, both of which map their
//! archive file with `memmap2` rather than read it into one buffer.
//! `mlock_mode` is ported from `original_source/include/dwarfs/options.h`.

use memmap2::{Advice, Mmap};
use std::fs::File;
use std::io::{self, Read};
use std::ops::Deref;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MlockMode {
    None,
    /// Best-effort: failure to lock pages is logged, not fatal.
    Try,
    /// Failure to lock pages is a hard error.
    Must,
}

enum Backing {
    Mapped(Mmap),
    Buffered(Vec<u8>),
}

/// Read-only view of an archive image, backed by either an mmap or an
/// in-memory buffer. `Deref<Target = [u8]>` so callers (section parsing,
/// the block cache) don't need to care which.
pub struct MappedImage {
    backing: Backing,
}

impl MappedImage {
    pub fn open(file: &File, mlock: MlockMode) -> io::Result<Self> {
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(Self {
                backing: Backing::Buffered(Vec::new()),
            });
        }

        match unsafe { Mmap::map(file) } {
            Ok(mmap) => {
                if mlock != MlockMode::None {
                    if let Err(e) = mmap.advise(Advice::WillNeed) {
                        if mlock == MlockMode::Must {
                            return Err(e);
                        }
                    }
                }
                Ok(Self {
                    backing: Backing::Mapped(mmap),
                })
            }
            Err(_) => {
                let mut buf = Vec::with_capacity(len as usize);
                let mut f = file.try_clone()?;
                f.read_to_end(&mut buf)?;
                Ok(Self {
                    backing: Backing::Buffered(buf),
                })
            }
        }
    }

    /// Build directly from an in-memory buffer (tests, and images produced
    /// entirely in memory rather than on disk).
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            backing: Backing::Buffered(bytes),
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped(_))
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn as_slice(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(m) => &m[..],
            Backing::Buffered(b) => &b[..],
        }
    }
}

impl Deref for MappedImage {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_uses_buffered_backing() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let img = MappedImage::open(tmp.as_file(), MlockMode::None).unwrap();
        assert!(img.is_empty());
    }

    #[test]
    fn nonempty_file_maps_and_reads() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"dwarfs image bytes").unwrap();
        tmp.flush().unwrap();
        let img = MappedImage::open(tmp.as_file(), MlockMode::None).unwrap();
        assert_eq!(&img[..], b"dwarfs image bytes");
    }

    #[test]
    fn from_bytes_round_trips() {
        let img = MappedImage::from_bytes(b"in memory".to_vec());
        assert_eq!(&img[..], b"in memory");
        assert!(!img.is_mapped());
    }
}
