//! Tagged content hashes
//!
//! A manifest identifies file content by either a 128-bit MD5 digest or a
//! 64-bit xxHash, formatted as lowercase hex. The two algorithms never mix
//! within one manifest; the tagged representation makes a cross-algorithm
//! comparison structurally unequal instead of silently wrong.

use std::fmt;

use xxhash_rust::xxh64::Xxh64;

use crate::error::{Error, Result};

/// Hash algorithm discriminator carried by a manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// 128-bit MD5
    Md5,
    /// 64-bit xxHash
    Xxh64,
}

impl HashAlgorithm {
    /// The manifest JSON key used for this algorithm
    pub fn key(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Xxh64 => "xxh",
        }
    }

    /// Hex digit count of a digest under this algorithm
    pub fn hex_len(self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Xxh64 => 16,
        }
    }
}

/// A tagged content hash value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hash {
    /// 128-bit MD5 digest
    Md5([u8; 16]),
    /// 64-bit xxHash, stored big-endian so hex output matches `{:016x}`
    Xxh64([u8; 8]),
}

impl Hash {
    /// Algorithm this value was produced by
    pub fn algorithm(&self) -> HashAlgorithm {
        match self {
            Self::Md5(_) => HashAlgorithm::Md5,
            Self::Xxh64(_) => HashAlgorithm::Xxh64,
        }
    }

    /// Lowercase hex rendering, 32 or 16 digits
    pub fn to_hex(&self) -> String {
        match self {
            Self::Md5(d) => hex::encode(d),
            Self::Xxh64(d) => hex::encode(d),
        }
    }

    /// Parse a lowercase hex literal under a known algorithm
    pub fn from_hex(algorithm: HashAlgorithm, literal: &str) -> Result<Self> {
        if literal.len() != algorithm.hex_len() {
            return Err(Error::invalid_hash(literal));
        }
        let bytes = hex::decode(literal).map_err(|_| Error::invalid_hash(literal))?;
        Ok(match algorithm {
            HashAlgorithm::Md5 => {
                let mut d = [0u8; 16];
                d.copy_from_slice(&bytes);
                Self::Md5(d)
            }
            HashAlgorithm::Xxh64 => {
                let mut d = [0u8; 8];
                d.copy_from_slice(&bytes);
                Self::Xxh64(d)
            }
        })
    }

    /// Hash a complete byte slice in one call
    pub fn digest(algorithm: HashAlgorithm, data: &[u8]) -> Self {
        let mut hasher = Hasher::new(algorithm);
        hasher.update(data);
        hasher.finalize()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Streaming hasher over either algorithm
///
/// Callers feed fixed-size chunks so long files can yield between updates.
pub enum Hasher {
    /// MD5 state
    Md5(md5::Context),
    /// xxHash-64 state, seed 0
    Xxh64(Xxh64),
}

impl Hasher {
    /// Create a hasher for the given algorithm
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Md5 => Self::Md5(md5::Context::new()),
            HashAlgorithm::Xxh64 => Self::Xxh64(Xxh64::new(0)),
        }
    }

    /// Feed a chunk of input
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(ctx) => ctx.consume(data),
            Self::Xxh64(state) => state.update(data),
        }
    }

    /// Finish and produce the tagged hash
    pub fn finalize(self) -> Hash {
        match self {
            Self::Md5(ctx) => Hash::Md5(ctx.compute().0),
            Self::Xxh64(state) => Hash::Xxh64(state.digest().to_be_bytes()),
        }
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Md5(_) => f.write_str("Hasher::Md5"),
            Self::Xxh64(_) => f.write_str("Hasher::Xxh64"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_hex_roundtrip() {
        let h = Hash::digest(HashAlgorithm::Md5, b"hello world");
        assert_eq!(h.to_hex(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(Hash::from_hex(HashAlgorithm::Md5, &h.to_hex()).unwrap(), h);
    }

    #[test]
    fn test_xxh64_hex_matches_u64_format() {
        let mut state = Xxh64::new(0);
        state.update(b"hello world");
        let expected = format!("{:016x}", state.digest());

        let h = Hash::digest(HashAlgorithm::Xxh64, b"hello world");
        assert_eq!(h.to_hex(), expected);
    }

    #[test]
    fn test_cross_algorithm_never_equal() {
        let a = Hash::digest(HashAlgorithm::Md5, b"same input");
        let b = Hash::digest(HashAlgorithm::Xxh64, b"same input");
        assert_ne!(a, b);
    }

    #[test]
    fn test_streaming_matches_oneshot() {
        let data = vec![0xA5u8; 1024 * 64];
        let mut hasher = Hasher::new(HashAlgorithm::Md5);
        for chunk in data.chunks(4096) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.finalize(), Hash::digest(HashAlgorithm::Md5, &data));
    }

    #[test]
    fn test_invalid_hex_rejected() {
        assert!(Hash::from_hex(HashAlgorithm::Md5, "zz").is_err());
        assert!(Hash::from_hex(HashAlgorithm::Xxh64, "0123").is_err());
        // 32 digits offered as xxh is a length mismatch, not a silent accept
        assert!(Hash::from_hex(HashAlgorithm::Xxh64, "5eb63bbbe01eeed093cb22bb8f5acdc3").is_err());
    }
}
