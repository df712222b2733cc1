//! Content hash.
//!
//! A 128-bit fingerprint of a resource's type, metadata and decoded bytes. It is the
//! only identity a resource has; two producers creating the same content end up with
//! the same hash, across processes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Size of a serialized hash.
pub const CONTENT_HASH_BYTES: usize = 16;

/// 128-bit content hash, totally ordered by `(high, low)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ContentHash {
    pub high: u64,
    pub low: u64,
}

impl ContentHash {
    /// The all-zero hash. Never produced by [`ContentHash::compute`] in practice.
    pub const INVALID: ContentHash = ContentHash { high: 0, low: 0 };

    pub const fn new(low: u64, high: u64) -> Self {
        Self { high, low }
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// Hashes the given parts in order with BLAKE3 and keeps the first 16 bytes.
    pub fn compute(parts: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            // Length-prefix each part so ("ab", "c") and ("a", "bc") differ.
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; CONTENT_HASH_BYTES];
        bytes.copy_from_slice(&digest.as_bytes()[..CONTENT_HASH_BYTES]);
        Self::from_le_bytes(bytes)
    }

    /// Wire/disk representation: low half then high half, little-endian.
    pub fn to_le_bytes(&self) -> [u8; CONTENT_HASH_BYTES] {
        let mut out = [0u8; CONTENT_HASH_BYTES];
        out[..8].copy_from_slice(&self.low.to_le_bytes());
        out[8..].copy_from_slice(&self.high.to_le_bytes());
        out
    }

    pub fn from_le_bytes(bytes: [u8; CONTENT_HASH_BYTES]) -> Self {
        let mut low = [0u8; 8];
        let mut high = [0u8; 8];
        low.copy_from_slice(&bytes[..8]);
        high.copy_from_slice(&bytes[8..]);
        Self {
            high: u64::from_le_bytes(high),
            low: u64::from_le_bytes(low),
        }
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.high, self.low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_parts_same_hash() {
        let a = ContentHash::compute(&[b"texture", b"pixels"]);
        let b = ContentHash::compute(&[b"texture", b"pixels"]);
        assert_eq!(a, b);
        assert!(a.is_valid());
    }

    #[test]
    fn part_boundaries_matter() {
        let a = ContentHash::compute(&[b"ab", b"c"]);
        let b = ContentHash::compute(&[b"a", b"bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn orders_by_high_then_low() {
        let a = ContentHash::new(5, 1);
        let b = ContentHash::new(1, 2);
        let c = ContentHash::new(2, 2);
        let mut v = vec![c, a, b];
        v.sort();
        assert_eq!(v, vec![a, b, c]);
    }

    #[test]
    fn le_bytes_layout() {
        let h = ContentHash::new(0x0102030405060708, 0x1112131415161718);
        let bytes = h.to_le_bytes();
        assert_eq!(bytes[0], 0x08);
        assert_eq!(bytes[8], 0x18);
        assert_eq!(ContentHash::from_le_bytes(bytes), h);
    }

    #[test]
    fn display_is_32_hex_digits() {
        let h = ContentHash::new(0xab, 0x1);
        assert_eq!(h.to_string(), "000000000000000100000000000000ab");
    }
}
