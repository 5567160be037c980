//! Similarity hashing (C10, part 1).
//!
//! Spec calls for an order-insensitive n-gram signature, "Nilsimsa-like":
//! small Hamming distance between two signatures should track similar file
//! content. Classic Nilsimsa hashes every rolling 5-byte window through
//! eight fixed trigram combinations into a 256-bucket accumulator, then
//! sets each output bit from whichever bucket majority. This is a smaller
//! variant of the same idea: every 4-byte window is hashed four ways
//! (`xxhash-rust`'s `xxh32`, four distinct seeds, already a declared but
//! otherwise-unused teacher dependency) into the same 256-bucket
//! accumulator, and a bit is set wherever its bucket saw more than the
//! average number of hits. Locality is preserved the same way Nilsimsa's
//! is: two inputs sharing many 4-byte windows light up many of the same
//! buckets.

use xxhash_rust::xxh32::xxh32;

const NUM_BITS: usize = 256;
const NUM_BYTES: usize = NUM_BITS / 8;
const SEEDS: [u32; 4] = [0x9747_b28c, 0x1000_193, 0x85eb_ca6b, 0xc2b2_ae35];

/// A 256-bit content signature. Two signatures of similar content should
/// have a small `hamming_distance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; NUM_BYTES]);

impl Signature {
    pub fn hamming_distance(&self, other: &Signature) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// Computes a [`Signature`] over `data`. Files shorter than 4 bytes have no
/// complete n-gram and get the all-zero signature, which compares as
/// maximally dissimilar to everything (including another empty file, which
/// is fine: near-empty files gain nothing from block-sharing heuristics).
pub fn compute_signature(data: &[u8]) -> Signature {
    if data.len() < 4 {
        return Signature([0u8; NUM_BYTES]);
    }

    let mut acc = [0u32; NUM_BITS];
    let mut windows = 0u32;

    for window in data.windows(4) {
        for seed in SEEDS {
            let h = xxh32(window, seed);
            acc[(h % NUM_BITS as u32) as usize] += 1;
        }
        windows += 1;
    }

    let total_hits = windows as u64 * SEEDS.len() as u64;
    let threshold = total_hits / NUM_BITS as u64;

    let mut bytes = [0u8; NUM_BYTES];
    for (bit, &count) in acc.iter().enumerate() {
        if count as u64 > threshold {
            bytes[bit / 8] |= 1 << (bit % 8);
        }
    }

    Signature(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_content_has_zero_distance() {
        let data = b"the quick brown fox jumps over the lazy dog, repeatedly, many times over";
        let a = compute_signature(data);
        let b = compute_signature(data);
        assert_eq!(a.hamming_distance(&b), 0);
    }

    #[test]
    fn similar_content_has_small_distance() {
        let a = compute_signature(b"the quick brown fox jumps over the lazy dog repeatedly many times over and over");
        let b = compute_signature(b"the quick brown fox jumps over the lazy cat repeatedly many times over and over");
        let unrelated = compute_signature(b"\x01\x02\x03\x04\x05\x06\x99\x88\x77\x66\x55\x44\x33\x22\x11\x00\xfe\xdc\xba\x98\x76\x54\x32\x10\xaa\xbb\xcc\xdd\xee\xff\x00\x01");
        assert!(a.hamming_distance(&b) < a.hamming_distance(&unrelated));
    }

    #[test]
    fn short_inputs_get_zero_signature() {
        assert_eq!(compute_signature(b"ab").0, [0u8; NUM_BYTES]);
        assert_eq!(compute_signature(b"").0, [0u8; NUM_BYTES]);
    }

    #[test]
    fn hamming_distance_is_symmetric() {
        let a = compute_signature(b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let b = compute_signature(b"bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
        assert_eq!(a.hamming_distance(&b), b.hamming_distance(&a));
    }
}
