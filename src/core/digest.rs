//! Digest algorithms for the hash-tree
//!
//! Mirrors the shape of a fixed-width checksum enum, but dispatches to the
//! three digest algorithms the kernel dm-verity target accepts.

use sha1::Sha1;
use sha2::{Digest as _, Sha256, Sha512};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DigestError {
    #[error("unsupported hash algorithm: {0}")]
    Unsupported(String),
}

/// Hash algorithms supported by the dm-verity target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Parses an algorithm name, case-insensitively.
    pub fn from_name(name: &str) -> Result<Self, DigestError> {
        match name.to_ascii_lowercase().as_str() {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(DigestError::Unsupported(other.to_string())),
        }
    }

    /// The canonical lower-case name, as stored in the superblock and the
    /// target parameter string.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// The raw digest size in bytes.
    pub const fn digest_size(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    /// Returns a fresh digester for this algorithm.
    pub fn digester(&self) -> Digester {
        match self {
            Self::Sha1 => Digester::Sha1(Sha1::new()),
            Self::Sha256 => Digester::Sha256(Sha256::new()),
            Self::Sha512 => Digester::Sha512(Sha512::new()),
        }
    }
}

/// A uniform digest-computation handle over the three supported algorithms.
pub enum Digester {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Digester {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha1(h) => h.finalize().to_vec(),
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

/// Computes a single digest of `parts` concatenated in order.
pub fn digest(algorithm: HashAlgorithm, parts: &[&[u8]]) -> Vec<u8> {
    let mut d = algorithm.digester();
    for part in parts {
        d.update(part);
    }
    d.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name_case_insensitive() {
        assert_eq!(HashAlgorithm::from_name("SHA256").unwrap(), HashAlgorithm::Sha256);
        assert_eq!(HashAlgorithm::from_name("Sha1").unwrap(), HashAlgorithm::Sha1);
        assert_eq!(HashAlgorithm::from_name("sha512").unwrap(), HashAlgorithm::Sha512);
        assert!(HashAlgorithm::from_name("md5").is_err());
    }

    #[test]
    fn test_digest_sizes() {
        assert_eq!(HashAlgorithm::Sha1.digest_size(), 20);
        assert_eq!(HashAlgorithm::Sha256.digest_size(), 32);
        assert_eq!(HashAlgorithm::Sha512.digest_size(), 64);
    }

    #[test]
    fn test_digest_matches_raw_impl() {
        let expected = {
            let mut h = Sha256::new();
            h.update(b"salt");
            h.update(b"block");
            h.finalize().to_vec()
        };
        let actual = digest(HashAlgorithm::Sha256, &[b"salt", b"block"]);
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_names_round_trip() {
        for algo in [HashAlgorithm::Sha1, HashAlgorithm::Sha256, HashAlgorithm::Sha512] {
            assert_eq!(HashAlgorithm::from_name(algo.name()).unwrap(), algo);
        }
    }
}
