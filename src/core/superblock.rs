//! Verity superblock codec (C2)
//!
//! The superblock is a fixed 512-byte little-endian record at the start of
//! the hash device, identifying the algorithm, block sizes, data-block
//! count, salt, and UUID used to build the tree that follows it.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;
use uuid::Uuid;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::params::{ParamError, Params, MAX_SALT_SIZE};
use super::{align_up, VERITY_SIGNATURE, VERITY_SUPERBLOCK_VERSION, SUPERBLOCK_SIZE};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SuperblockError {
    #[error("superblock too small: {0} bytes (need at least {SUPERBLOCK_SIZE})")]
    TooSmall(usize),

    #[error("bad superblock signature")]
    BadSignature,

    #[error("unsupported superblock version: {0}")]
    UnsupportedVersion(u32),

    #[error("invalid hash_type in superblock: {0}")]
    InvalidHashType(u32),

    #[error("unsupported hash algorithm in superblock: {0}")]
    UnsupportedAlgorithm(String),

    #[error("invalid block size in superblock: {0}")]
    InvalidBlockSize(u32),

    #[error("salt_size too large in superblock: {0}")]
    SaltTooLarge(u16),

    #[error("superblock UUID is all-zero")]
    MissingUuid,

    #[error("field '{field}' mismatch: caller={caller}, on-disk={on_disk}")]
    FieldMismatch {
        field: &'static str,
        caller: String,
        on_disk: String,
    },

    #[error(transparent)]
    Param(#[from] ParamError),
}

/// Fixed on-disk layout of the 512-byte verity superblock.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct SuperblockRaw {
    pub signature: [u8; 8],
    pub version: u32,
    pub hash_type: u32,
    pub uuid: [u8; 16],
    pub algorithm: [u8; 32],
    pub data_block_size: u32,
    pub hash_block_size: u32,
    pub data_blocks: u64,
    pub salt_size: u16,
    pub pad1: [u8; 6],
    pub salt: [u8; 256],
    pub pad2: [u8; 168],
}

const _: () = assert!(std::mem::size_of::<SuperblockRaw>() == SUPERBLOCK_SIZE);

/// A parsed superblock with convenient accessors.
#[derive(Debug, Clone)]
pub struct Superblock {
    raw: SuperblockRaw,
}

impl Superblock {
    /// Builds a superblock record from already-validated params.
    ///
    /// Fails if `params.salt` is too large, the algorithm is unresolved, or
    /// either block size is invalid — `Params::validate` should already have
    /// rejected these, but the codec re-checks so it never emits a
    /// corrupt record.
    pub fn build(params: &Params) -> Result<Self, SuperblockError> {
        if params.salt.len() > MAX_SALT_SIZE {
            return Err(SuperblockError::SaltTooLarge(params.salt.len() as u16));
        }
        let algorithm = params
            .algorithm()
            .map_err(|_| SuperblockError::UnsupportedAlgorithm(params.hash_algorithm.clone()))?;

        let mut algorithm_bytes = [0u8; 32];
        let name = algorithm.name().as_bytes();
        algorithm_bytes[..name.len()].copy_from_slice(name);

        let mut salt = [0u8; 256];
        salt[..params.salt.len()].copy_from_slice(&params.salt);

        let uuid = params.uuid.unwrap_or_else(Uuid::new_v4);

        Ok(Self {
            raw: SuperblockRaw {
                signature: VERITY_SIGNATURE,
                version: VERITY_SUPERBLOCK_VERSION,
                hash_type: params.hash_type,
                uuid: *uuid.as_bytes(),
                algorithm: algorithm_bytes,
                data_block_size: params.data_block_size,
                hash_block_size: params.hash_block_size,
                data_blocks: params.data_blocks,
                salt_size: params.salt.len() as u16,
                pad1: [0u8; 6],
                salt,
                pad2: [0u8; 168],
            },
        })
    }

    /// Serializes to exactly 512 little-endian bytes.
    pub fn serialize(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        buf.copy_from_slice(self.raw.as_bytes());
        buf
    }

    /// Parses and validates a superblock from raw bytes (must be `>= 512`).
    pub fn deserialize(data: &[u8]) -> Result<Self, SuperblockError> {
        if data.len() < SUPERBLOCK_SIZE {
            return Err(SuperblockError::TooSmall(data.len()));
        }

        let raw = SuperblockRaw::read_from_bytes(&data[..SUPERBLOCK_SIZE])
            .map_err(|_| SuperblockError::TooSmall(data.len()))?;

        if raw.signature != VERITY_SIGNATURE {
            return Err(SuperblockError::BadSignature);
        }
        let version = { raw.version };
        if version != VERITY_SUPERBLOCK_VERSION {
            return Err(SuperblockError::UnsupportedVersion(version));
        }
        let hash_type = { raw.hash_type };
        if hash_type > 1 {
            return Err(SuperblockError::InvalidHashType(hash_type));
        }

        let sb = Self { raw };

        let algo_name = sb.algorithm_name();
        crate::core::digest::HashAlgorithm::from_name(algo_name)
            .map_err(|_| SuperblockError::UnsupportedAlgorithm(algo_name.to_string()))?;

        if !super::is_power_of_two(sb.data_block_size() as u64)
            || sb.data_block_size() < 512
            || sb.data_block_size() > 524_288
        {
            return Err(SuperblockError::InvalidBlockSize(sb.data_block_size()));
        }
        if !super::is_power_of_two(sb.hash_block_size() as u64)
            || sb.hash_block_size() < 512
            || sb.hash_block_size() > 524_288
        {
            return Err(SuperblockError::InvalidBlockSize(sb.hash_block_size()));
        }

        let salt_size = { sb.raw.salt_size };
        if salt_size as usize > MAX_SALT_SIZE {
            return Err(SuperblockError::SaltTooLarge(salt_size));
        }

        if sb.raw.uuid == [0u8; 16] {
            return Err(SuperblockError::MissingUuid);
        }

        Ok(sb)
    }

    pub fn hash_type(&self) -> u32 {
        self.raw.hash_type
    }

    pub fn uuid(&self) -> Uuid {
        Uuid::from_bytes(self.raw.uuid)
    }

    pub fn algorithm_name(&self) -> &str {
        let algo = &self.raw.algorithm;
        let end = algo.iter().position(|&b| b == 0).unwrap_or(algo.len());
        std::str::from_utf8(&algo[..end]).unwrap_or("")
    }

    pub fn data_block_size(&self) -> u32 {
        self.raw.data_block_size
    }

    pub fn hash_block_size(&self) -> u32 {
        self.raw.hash_block_size
    }

    pub fn data_blocks(&self) -> u64 {
        self.raw.data_blocks
    }

    pub fn salt_size(&self) -> u16 {
        self.raw.salt_size
    }

    pub fn salt(&self) -> &[u8] {
        &self.raw.salt[..self.raw.salt_size as usize]
    }

    pub fn raw(&self) -> &SuperblockRaw {
        &self.raw
    }

    /// Reconciles caller-supplied `params` against this on-disk superblock.
    ///
    /// For each of `{hash_algorithm, data_block_size, hash_block_size,
    /// data_blocks, uuid, salt}`: an unset caller field is adopted from the
    /// superblock; a set field must match exactly or reconciliation fails.
    /// `hash_area_offset` is then assigned the canonical superblock-mode
    /// offset and `no_superblock` is cleared.
    pub fn reconcile(mut params: Params, sb: &Superblock) -> Result<Params, SuperblockError> {
        if params.hash_algorithm.is_empty() {
            params.hash_algorithm = sb.algorithm_name().to_string();
        } else if !params.hash_algorithm.eq_ignore_ascii_case(sb.algorithm_name()) {
            return Err(SuperblockError::FieldMismatch {
                field: "hash_algorithm",
                caller: params.hash_algorithm.clone(),
                on_disk: sb.algorithm_name().to_string(),
            });
        }
        params.hash_algorithm = params.hash_algorithm.to_ascii_lowercase();

        if params.data_block_size == 0 {
            params.data_block_size = sb.data_block_size();
        } else if params.data_block_size != sb.data_block_size() {
            return Err(SuperblockError::FieldMismatch {
                field: "data_block_size",
                caller: params.data_block_size.to_string(),
                on_disk: sb.data_block_size().to_string(),
            });
        }

        if params.hash_block_size == 0 {
            params.hash_block_size = sb.hash_block_size();
        } else if params.hash_block_size != sb.hash_block_size() {
            return Err(SuperblockError::FieldMismatch {
                field: "hash_block_size",
                caller: params.hash_block_size.to_string(),
                on_disk: sb.hash_block_size().to_string(),
            });
        }

        if params.data_blocks == 0 {
            params.data_blocks = sb.data_blocks();
        } else if params.data_blocks != sb.data_blocks() {
            return Err(SuperblockError::FieldMismatch {
                field: "data_blocks",
                caller: params.data_blocks.to_string(),
                on_disk: sb.data_blocks().to_string(),
            });
        }

        match params.uuid {
            None => params.uuid = Some(sb.uuid()),
            Some(u) if u == sb.uuid() => {}
            Some(u) => {
                return Err(SuperblockError::FieldMismatch {
                    field: "uuid",
                    caller: u.to_string(),
                    on_disk: sb.uuid().to_string(),
                })
            }
        }

        if params.salt.is_empty() {
            params.salt = sb.salt().to_vec();
        } else if params.salt != sb.salt() {
            return Err(SuperblockError::FieldMismatch {
                field: "salt",
                caller: hex::encode(&params.salt),
                on_disk: hex::encode(sb.salt()),
            });
        }

        params.hash_area_offset = align_up(SUPERBLOCK_SIZE as u64, params.hash_block_size as u64);
        params.no_superblock = false;

        Ok(params)
    }
}
