//! Verity tree parameters (C1)
//!
//! `Params` is a plain value object describing one hash tree: the algorithm,
//! block sizes, data-block count, salt, hash-area placement, and identity.
//! It is validated before any I/O and, once reconciled against an on-disk
//! superblock (see [`crate::core::superblock`]), is treated as read-only for
//! the remainder of an operation.

use thiserror::Error;
use uuid::Uuid;

use super::digest::HashAlgorithm;
use super::{align_up, is_power_of_two, SUPERBLOCK_SIZE};

/// Minimum permitted block size, in bytes.
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Maximum permitted block size, in bytes.
pub const MAX_BLOCK_SIZE: u32 = 524_288;

/// Kernel cap on digest size, in bytes.
pub const MAX_DIGEST_SIZE: usize = 1024;

/// Maximum salt length, in bytes.
pub const MAX_SALT_SIZE: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParamError {
    #[error("salt too large: {0} bytes (max {MAX_SALT_SIZE})")]
    SaltTooLarge(usize),

    #[error("digest too large: {0} bytes (max {MAX_DIGEST_SIZE})")]
    DigestTooLarge(usize),

    #[error("unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("invalid block size: {0} (must be a power of two in [{MIN_BLOCK_SIZE}, {MAX_BLOCK_SIZE}])")]
    InvalidBlockSize(u32),

    #[error("data_blocks * data_block_size overflows u64")]
    DataSizeOverflow,

    #[error("hash_area_offset {offset} is not aligned to hash_block_size {hash_block_size}")]
    MisalignedHashAreaOffset { offset: u64, hash_block_size: u32 },

    #[error("hash_area_offset is unset; it is assigned after the superblock is written")]
    HashAreaOffsetUnset,

    #[error("hash_type must be 0 or 1, got {0}")]
    InvalidHashType(u32),
}

/// Tree parameters, validated up front and reconciled with the on-disk
/// superblock before use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Params {
    /// Empty string means "unset"; reconciliation adopts it from the superblock.
    pub hash_algorithm: String,
    /// Zero means "unset" in superblock mode; reconciliation adopts it from the superblock.
    pub data_block_size: u32,
    /// Zero means "unset" in superblock mode; reconciliation adopts it from the superblock.
    pub hash_block_size: u32,
    /// Zero means "unset"; the caller or C4 derives it from the data device size.
    pub data_blocks: u64,
    pub hash_type: u32,
    pub salt: Vec<u8>,
    /// Zero means "unset" in superblock mode; assigned by reconciliation.
    pub hash_area_offset: u64,
    pub uuid: Option<Uuid>,
    pub no_superblock: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            hash_algorithm: String::new(),
            data_block_size: 0,
            hash_block_size: 0,
            data_blocks: 0,
            hash_type: 1,
            salt: Vec::new(),
            hash_area_offset: 0,
            uuid: None,
            no_superblock: false,
        }
    }
}

fn is_valid_block_size(size: u32) -> bool {
    size >= MIN_BLOCK_SIZE
        && size <= MAX_BLOCK_SIZE
        && is_power_of_two(size as u64)
}

impl Params {
    /// The offset the hash area begins at in superblock mode: the first
    /// `hash_block_size`-aligned offset strictly greater than the 512-byte
    /// superblock.
    pub fn superblock_hash_area_offset(hash_block_size: u32) -> u64 {
        align_up(SUPERBLOCK_SIZE as u64, hash_block_size as u64)
    }

    /// Returns the resolved `HashAlgorithm`, failing if unset or unknown.
    pub fn algorithm(&self) -> Result<HashAlgorithm, ParamError> {
        HashAlgorithm::from_name(&self.hash_algorithm)
            .map_err(|_| ParamError::UnsupportedAlgorithm(self.hash_algorithm.clone()))
    }

    /// Validates every invariant from the spec's parameter contract.
    pub fn validate(&self) -> Result<(), ParamError> {
        if self.salt.len() > MAX_SALT_SIZE {
            return Err(ParamError::SaltTooLarge(self.salt.len()));
        }

        if self.hash_type > 1 {
            return Err(ParamError::InvalidHashType(self.hash_type));
        }

        if !self.hash_algorithm.is_empty() {
            let algo = self
                .algorithm()
                .map_err(|_| ParamError::UnsupportedAlgorithm(self.hash_algorithm.clone()))?;
            if algo.digest_size() > MAX_DIGEST_SIZE {
                return Err(ParamError::DigestTooLarge(algo.digest_size()));
            }
        }

        if !is_valid_block_size(self.data_block_size) {
            return Err(ParamError::InvalidBlockSize(self.data_block_size));
        }
        if !is_valid_block_size(self.hash_block_size) {
            return Err(ParamError::InvalidBlockSize(self.hash_block_size));
        }

        if self
            .data_blocks
            .checked_mul(self.data_block_size as u64)
            .is_none()
        {
            return Err(ParamError::DataSizeOverflow);
        }

        if self.no_superblock {
            if self.hash_area_offset % self.hash_block_size as u64 != 0 {
                return Err(ParamError::MisalignedHashAreaOffset {
                    offset: self.hash_area_offset,
                    hash_block_size: self.hash_block_size,
                });
            }
        } else if self.hash_area_offset != 0 {
            // Already reconciled; must match the canonical superblock-mode offset.
            let expected = Self::superblock_hash_area_offset(self.hash_block_size);
            if self.hash_area_offset != expected {
                return Err(ParamError::MisalignedHashAreaOffset {
                    offset: self.hash_area_offset,
                    hash_block_size: self.hash_block_size,
                });
            }
        }

        if self.data_block_size as usize > page_size_hint() {
            tracing::warn!(
                data_block_size = self.data_block_size,
                "data_block_size exceeds the system page size; the kernel cannot activate this device"
            );
        }

        Ok(())
    }
}

/// Best-effort page size for the warning in `validate`; never fails hard
/// since it is advisory only.
fn page_size_hint() -> usize {
    4096
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_params() -> Params {
        Params {
            hash_algorithm: "sha256".to_string(),
            data_block_size: 4096,
            hash_block_size: 4096,
            data_blocks: 16,
            hash_type: 1,
            salt: Vec::new(),
            hash_area_offset: 0,
            uuid: None,
            no_superblock: false,
        }
    }

    #[test]
    fn test_valid_params_pass() {
        assert!(valid_params().validate().is_ok());
    }

    #[test]
    fn test_salt_too_large() {
        let mut p = valid_params();
        p.salt = vec![0u8; 257];
        assert_eq!(p.validate(), Err(ParamError::SaltTooLarge(257)));
    }

    #[test]
    fn test_salt_max_size_ok() {
        let mut p = valid_params();
        p.salt = vec![0u8; 256];
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_invalid_hash_type() {
        let mut p = valid_params();
        p.hash_type = 2;
        assert_eq!(p.validate(), Err(ParamError::InvalidHashType(2)));
    }

    #[test]
    fn test_invalid_block_size_not_power_of_two() {
        let mut p = valid_params();
        p.data_block_size = 4097;
        assert!(matches!(p.validate(), Err(ParamError::InvalidBlockSize(_))));
    }

    #[test]
    fn test_block_size_boundaries() {
        let mut p = valid_params();
        p.data_block_size = 512;
        p.hash_block_size = 512;
        assert!(p.validate().is_ok());

        p.data_block_size = 524_288;
        p.hash_block_size = 524_288;
        assert!(p.validate().is_ok());

        p.data_block_size = 1_048_576;
        assert!(p.validate().is_err());

        p.data_block_size = 256;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_unsupported_algorithm() {
        let mut p = valid_params();
        p.hash_algorithm = "md5".to_string();
        assert!(matches!(
            p.validate(),
            Err(ParamError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_no_superblock_requires_alignment() {
        let mut p = valid_params();
        p.no_superblock = true;
        p.hash_area_offset = 100;
        assert!(matches!(
            p.validate(),
            Err(ParamError::MisalignedHashAreaOffset { .. })
        ));

        p.hash_area_offset = 4096;
        assert!(p.validate().is_ok());

        p.hash_area_offset = 0;
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_superblock_hash_area_offset() {
        assert_eq!(Params::superblock_hash_area_offset(4096), 4096);
        assert_eq!(Params::superblock_hash_area_offset(512), 512);
        assert_eq!(Params::superblock_hash_area_offset(1024), 1024);
    }

    #[test]
    fn test_data_size_overflow() {
        let mut p = valid_params();
        p.data_blocks = u64::MAX;
        p.data_block_size = 4096;
        assert_eq!(p.validate(), Err(ParamError::DataSizeOverflow));
    }
}
