//! Merkle hash-tree engine (C3)
//!
//! Builds and verifies the multi-level dm-verity Merkle tree over a data
//! device, laying out levels root-first on the hash device exactly as the
//! kernel and `veritysetup` do.

use std::collections::HashSet;

use thiserror::Error;

use super::digest::digest as compute_raw_digest;
use super::params::{ParamError, Params};
use super::{next_power_of_two, DigestError};
use crate::blockdev::{BlockDevice, BlockDeviceError};

/// Maximum number of tree levels the kernel accepts.
pub const MAX_LEVELS: usize = 63;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HashTreeError {
    #[error("data_blocks is zero; not a valid verity device")]
    ZeroDataBlocks,

    #[error("hash_block_size {hash_block_size} holds zero digests of size {digest_size_full} each")]
    ZeroHashesPerBlock {
        hash_block_size: u32,
        digest_size_full: usize,
    },

    #[error("hash tree exceeds {MAX_LEVELS} levels")]
    TooManyLevels,

    #[error("root hash length mismatch: expected {expected}, got {got}")]
    RootSizeMismatch { expected: usize, got: usize },

    #[error("digest mismatch at level {level}, index {index}")]
    DigestMismatch { level: u8, index: u64 },

    #[error("non-zero padding/spare byte at level {level}, block {block}")]
    NonZeroPadding { level: u8, block: u64 },

    #[error("root digest mismatch")]
    RootMismatch,

    #[error(transparent)]
    Param(#[from] ParamError),

    #[error(transparent)]
    Digest(#[from] DigestError),

    #[error(transparent)]
    Io(#[from] BlockDeviceError),
}

/// A single tree level: computed on demand, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashLevel {
    /// Byte offset on the hash device of this level's first block.
    /// Meaningless for the root level, which has no on-disk slot.
    pub offset: u64,
    /// Number of digests at this level.
    pub num_hashes: u64,
    /// Number of `hash_block_size` blocks this level occupies.
    pub num_blocks: u64,
}

/// Returns `digest_size_full`: the on-disk width of one digest slot.
/// `hash_type == 1` pads to the next power of two `>= digest_size`;
/// `hash_type == 0` stores the raw digest with no padding.
pub fn digest_size_full(digest_size: usize, hash_type: u32) -> usize {
    if hash_type == 1 {
        next_power_of_two(digest_size)
    } else {
        digest_size
    }
}

/// Enumerates tree levels bottom-up and assigns root-first on-disk offsets.
///
/// The last element of the returned vector is always the root level (not
/// written to disk); all others are real on-disk levels, offset-assigned so
/// that the topmost non-root level sits at `hash_area_offset` and the leaf
/// level sits at the greatest offset.
pub fn levels(
    data_blocks: u64,
    digest_size_full: usize,
    hash_block_size: u32,
    hash_area_offset: u64,
) -> Result<Vec<HashLevel>, HashTreeError> {
    if data_blocks == 0 {
        return Err(HashTreeError::ZeroDataBlocks);
    }

    let hpb = (hash_block_size as usize) / digest_size_full;
    if hpb == 0 {
        return Err(HashTreeError::ZeroHashesPerBlock {
            hash_block_size,
            digest_size_full,
        });
    }
    // A tree with more than one level must actually shrink each level;
    // hpb == 1 would loop forever since num_blocks == num_hashes.
    if hpb < 2 && data_blocks > 1 {
        return Err(HashTreeError::ZeroHashesPerBlock {
            hash_block_size,
            digest_size_full,
        });
    }

    let mut levels = Vec::new();
    let mut remaining = data_blocks;
    loop {
        let num_blocks = remaining.div_ceil(hpb as u64);
        levels.push(HashLevel {
            offset: 0,
            num_hashes: remaining,
            num_blocks,
        });
        if remaining == 1 {
            break;
        }
        if levels.len() > MAX_LEVELS {
            return Err(HashTreeError::TooManyLevels);
        }
        remaining = num_blocks;
    }
    if levels.len() > MAX_LEVELS {
        return Err(HashTreeError::TooManyLevels);
    }

    // Assign offsets from the topmost non-root level down to the leaf.
    let mut offset = hash_area_offset;
    if levels.len() >= 2 {
        for i in (0..levels.len() - 1).rev() {
            levels[i].offset = offset;
            offset += levels[i].num_blocks * hash_block_size as u64;
        }
    }

    Ok(levels)
}

/// Total byte size of the on-disk tree (excluding the superblock, but
/// including any gap between the superblock and `hash_area_offset`).
pub fn tree_end_offset(levels: &[HashLevel], hash_block_size: u32) -> u64 {
    levels
        .iter()
        .take(levels.len().saturating_sub(1))
        .map(|l| l.offset + l.num_blocks * hash_block_size as u64)
        .max()
        .unwrap_or(0)
}

fn digest_of_block(
    algorithm: super::digest::HashAlgorithm,
    hash_type: u32,
    salt: &[u8],
    block: &[u8],
) -> Vec<u8> {
    if hash_type == 1 {
        compute_raw_digest(algorithm, &[salt, block])
    } else {
        compute_raw_digest(algorithm, &[block, salt])
    }
}

/// Builds the full tree over `data`, writing levels to `hash`, and returns
/// the root digest. `hash` must already contain the superblock (if any) at
/// the front; this call truncates/extends it to the final tree size.
pub fn build(
    params: &Params,
    data: &dyn BlockDevice,
    hash: &dyn BlockDevice,
) -> Result<Vec<u8>, HashTreeError> {
    let algorithm = params.algorithm()?;
    let h = algorithm.digest_size();
    let dsf = digest_size_full(h, params.hash_type);
    let lv = levels(
        params.data_blocks,
        dsf,
        params.hash_block_size,
        params.hash_area_offset,
    )?;

    let total_size = tree_end_offset(&lv, params.hash_block_size).max(params.hash_area_offset);
    hash.set_len(total_size)?;

    let hpb = (params.hash_block_size as usize) / dsf;
    let mut root = None;

    for (li, level) in lv.iter().enumerate() {
        let is_root = li == lv.len() - 1;
        let (source, source_base, child_size): (&dyn BlockDevice, u64, u64) = if li == 0 {
            (data, 0, params.data_block_size as u64)
        } else {
            (hash, lv[li - 1].offset, params.hash_block_size as u64)
        };

        let mut out_buf = vec![0u8; params.hash_block_size as usize];
        let mut slot = 0usize;
        let mut write_offset = level.offset;
        let mut child_buf = vec![0u8; child_size as usize];

        for idx in 0..level.num_hashes {
            source.read_at(source_base + idx * child_size, &mut child_buf)?;
            let d = digest_of_block(algorithm, params.hash_type, &params.salt, &child_buf);

            if is_root {
                root = Some(d);
                break;
            }

            let pos = slot * dsf;
            out_buf[pos..pos + d.len()].copy_from_slice(&d);
            slot += 1;

            if slot == hpb {
                hash.write_at(write_offset, &out_buf)?;
                write_offset += params.hash_block_size as u64;
                out_buf.iter_mut().for_each(|b| *b = 0);
                slot = 0;
            }
        }

        if !is_root && slot > 0 {
            hash.write_at(write_offset, &out_buf)?;
        }
    }

    Ok(root.expect("root level always yields exactly one digest"))
}

/// Verifies the full tree, re-reading the data device and every stored hash
/// block, and checks the recomputed root against `expected_root`.
pub fn verify(
    params: &Params,
    data: &dyn BlockDevice,
    hash: &dyn BlockDevice,
    expected_root: &[u8],
) -> Result<(), HashTreeError> {
    let algorithm = params.algorithm()?;
    let h = algorithm.digest_size();
    if expected_root.len() != h {
        return Err(HashTreeError::RootSizeMismatch {
            expected: h,
            got: expected_root.len(),
        });
    }
    let dsf = digest_size_full(h, params.hash_type);
    let lv = levels(
        params.data_blocks,
        dsf,
        params.hash_block_size,
        params.hash_area_offset,
    )?;

    let hpb = (params.hash_block_size as usize) / dsf;
    let mut root = None;

    for (li, level) in lv.iter().enumerate() {
        let is_root = li == lv.len() - 1;
        let (source, source_base, child_size): (&dyn BlockDevice, u64, u64) = if li == 0 {
            (data, 0, params.data_block_size as u64)
        } else {
            (hash, lv[li - 1].offset, params.hash_block_size as u64)
        };

        let mut expect_buf = vec![0u8; params.hash_block_size as usize];
        let mut stored_buf = vec![0u8; params.hash_block_size as usize];
        let mut slot = 0usize;
        let mut block_index = 0u64;
        let mut read_offset = level.offset;
        let mut child_buf = vec![0u8; child_size as usize];

        for idx in 0..level.num_hashes {
            source.read_at(source_base + idx * child_size, &mut child_buf)?;
            let d = digest_of_block(algorithm, params.hash_type, &params.salt, &child_buf);

            if is_root {
                root = Some(d);
                break;
            }

            let pos = slot * dsf;
            expect_buf[pos..pos + d.len()].copy_from_slice(&d);
            slot += 1;

            if slot == hpb {
                hash.read_at(read_offset, &mut stored_buf)?;
                if stored_buf != expect_buf {
                    return Err(first_mismatch_error(
                        li as u8,
                        block_index,
                        hpb,
                        dsf,
                        &expect_buf,
                        &stored_buf,
                    ));
                }
                read_offset += params.hash_block_size as u64;
                block_index += 1;
                expect_buf.iter_mut().for_each(|b| *b = 0);
                slot = 0;
            }
        }

        if !is_root && slot > 0 {
            hash.read_at(read_offset, &mut stored_buf)?;
            if stored_buf != expect_buf {
                return Err(first_mismatch_error(
                    li as u8,
                    block_index,
                    hpb,
                    dsf,
                    &expect_buf,
                    &stored_buf,
                ));
            }
        }
    }

    let root = root.expect("root level always yields exactly one digest");
    if root != expected_root {
        return Err(HashTreeError::RootMismatch);
    }
    Ok(())
}

fn first_mismatch_error(
    level: u8,
    block_index: u64,
    hpb: usize,
    dsf: usize,
    expect_buf: &[u8],
    stored_buf: &[u8],
) -> HashTreeError {
    for slot in 0..hpb {
        let pos = slot * dsf;
        if expect_buf[pos..pos + dsf] != stored_buf[pos..pos + dsf] {
            let index = block_index * hpb as u64 + slot as u64;
            return HashTreeError::DigestMismatch { level, index };
        }
    }
    HashTreeError::NonZeroPadding {
        level,
        block: block_index,
    }
}

/// Thin cache of `(level, index)` pairs already verified, per the
/// `VerifyAtMostOnce` design note. Orthogonal to [`verify`], which always
/// re-reads every block; this is for callers that want to avoid redundant
/// re-checks of blocks already confirmed earlier in a session.
#[derive(Debug, Default)]
pub struct VerifyAtMostOnceCache {
    seen: HashSet<(u8, u64)>,
}

impl VerifyAtMostOnceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_verified(&self, level: u8, index: u64) -> bool {
        self.seen.contains(&(level, index))
    }

    pub fn mark_verified(&mut self, level: u8, index: u64) {
        self.seen.insert((level, index));
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
