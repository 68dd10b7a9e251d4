//! High-level format/verify/dump operations (C4)
//!
//! Orchestrates superblock I/O, data-block counting, and parameter
//! adoption, then hands off to the hash-tree engine (C3).

use super::hashtree;
use super::params::Params;
use super::superblock::Superblock;
use super::{Result, VerityError, SUPERBLOCK_SIZE};
use crate::blockdev::{self, BlockDevice};

/// Offset the superblock is written at (superblock mode only).
pub const SB_OFFSET: u64 = 0;

/// Result of a successful `format`.
#[derive(Debug, Clone)]
pub struct Report {
    pub root_hash: Vec<u8>,
    pub params: Params,
}

/// Builds a tree over `data_path`, writing the superblock (unless
/// `params.no_superblock`) and tree to `hash_path`.
pub fn format(mut params: Params, data_path: &str, hash_path: &str) -> Result<Report> {
    let data = blockdev::open(data_path, true)?;

    if params.data_blocks == 0 {
        let size = data.size();
        if size % params.data_block_size as u64 != 0 {
            return Err(VerityError::Param(super::ParamError::DataSizeOverflow));
        }
        params.data_blocks = size / params.data_block_size as u64;
        tracing::debug!(data_blocks = params.data_blocks, "derived data_blocks from data device size");
    }

    params.validate()?;

    let hash = open_hash_for_write(hash_path)?;

    if !params.no_superblock {
        let hash_area_offset = Params::superblock_hash_area_offset(params.hash_block_size);
        let algorithm = params.algorithm()?;
        let dsf = hashtree::digest_size_full(algorithm.digest_size(), params.hash_type);
        let lv = hashtree::levels(params.data_blocks, dsf, params.hash_block_size, hash_area_offset)?;
        let total_size = hashtree::tree_end_offset(&lv, params.hash_block_size).max(hash_area_offset);
        hash.set_len(total_size)?;

        let sb = Superblock::build(&params)?;
        hash.write_at(SB_OFFSET, &sb.serialize())?;
        params.hash_area_offset = hash_area_offset;
        tracing::debug!(offset = params.hash_area_offset, "wrote superblock");
    }

    let root_hash = hashtree::build(&params, data.as_ref(), hash.as_ref())?;
    tracing::info!(root_hash = %hex::encode(&root_hash), "built hash tree");

    Ok(Report { root_hash, params })
}

/// Verifies the tree stored at `hash_path` over `data_path` against
/// `expected_root`.
pub fn verify(mut params: Params, data_path: &str, hash_path: &str, expected_root: &[u8]) -> Result<()> {
    let data = blockdev::open(data_path, true)?;
    let hash = blockdev::open(hash_path, true)?;

    if !params.no_superblock {
        let mut sb_bytes = [0u8; SUPERBLOCK_SIZE];
        hash.read_at(SB_OFFSET, &mut sb_bytes)?;
        let sb = Superblock::deserialize(&sb_bytes)?;
        params = Superblock::reconcile(params, &sb)?;
    }

    params.validate()?;

    hashtree::verify(&params, data.as_ref(), hash.as_ref(), expected_root)?;
    tracing::info!("verification succeeded");
    Ok(())
}

/// Human-readable summary of a hash device's header and tree layout.
#[derive(Debug, Clone)]
pub struct DumpReport {
    pub has_superblock: bool,
    pub algorithm: String,
    pub hash_type: u32,
    pub data_blocks: u64,
    pub data_block_size: u32,
    pub hash_block_size: u32,
    pub hash_blocks_count: u64,
    pub salt_hex: Option<String>,
    pub hash_device_size: u64,
    pub levels: Vec<hashtree::HashLevel>,
}

/// Produces a dump report for the hash device at `hash_path`. Falls back to
/// reporting only the raw device size when no superblock is present (the
/// no-superblock caller is expected to supply the layout out of band).
pub fn dump(hash_path: &str, params_hint: Option<&Params>) -> Result<DumpReport> {
    let hash = blockdev::open(hash_path, true)?;

    let mut sb_bytes = [0u8; SUPERBLOCK_SIZE];
    let sb_result = hash
        .read_at(SB_OFFSET, &mut sb_bytes)
        .map_err(VerityError::from)
        .and_then(|_| Ok(Superblock::deserialize(&sb_bytes)?));

    let params = match sb_result {
        Ok(sb) => Superblock::reconcile(Params::default(), &sb)?,
        Err(_) => match params_hint {
            Some(p) => p.clone(),
            None => {
                return Ok(DumpReport {
                    has_superblock: false,
                    algorithm: String::new(),
                    hash_type: 0,
                    data_blocks: 0,
                    data_block_size: 0,
                    hash_block_size: 0,
                    hash_blocks_count: 0,
                    salt_hex: None,
                    hash_device_size: hash.size(),
                    levels: Vec::new(),
                })
            }
        },
    };

    let algorithm = params.algorithm()?;
    let dsf = hashtree::digest_size_full(algorithm.digest_size(), params.hash_type);
    let levels = hashtree::levels(
        params.data_blocks,
        dsf,
        params.hash_block_size,
        params.hash_area_offset,
    )?;
    let hash_blocks_count: u64 = levels
        .iter()
        .take(levels.len().saturating_sub(1))
        .map(|l| l.num_blocks)
        .sum();

    Ok(DumpReport {
        has_superblock: !params.no_superblock,
        algorithm: params.hash_algorithm.clone(),
        hash_type: params.hash_type,
        data_blocks: params.data_blocks,
        data_block_size: params.data_block_size,
        hash_block_size: params.hash_block_size,
        hash_blocks_count,
        salt_hex: if params.salt.is_empty() {
            None
        } else {
            Some(hex::encode(&params.salt))
        },
        hash_device_size: hash.size(),
        levels,
    })
}

fn open_hash_for_write(path: &str) -> Result<Box<dyn BlockDevice>> {
    match blockdev::open(path, false) {
        Ok(dev) => Ok(dev),
        Err(_) => Ok(blockdev::create(path, 0)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn write_random_data(path: &std::path::Path, size: usize) {
        use std::io::Write;
        let mut file = std::fs::File::create(path).unwrap();
        let data = vec![0x42u8; size];
        file.write_all(&data).unwrap();
    }

    #[test]
    fn test_format_then_verify_round_trip() {
        let data_file = NamedTempFile::new().unwrap();
        let hash_file = NamedTempFile::new().unwrap();
        write_random_data(data_file.path(), 16 * 4096);

        let params = Params {
            hash_algorithm: "sha256".to_string(),
            data_block_size: 4096,
            hash_block_size: 4096,
            data_blocks: 0,
            hash_type: 1,
            salt: Vec::new(),
            hash_area_offset: 0,
            uuid: None,
            no_superblock: false,
        };

        let report = format(
            params,
            data_file.path().to_str().unwrap(),
            hash_file.path().to_str().unwrap(),
        )
        .unwrap();

        assert_eq!(report.root_hash.len(), 32);
        assert_eq!(report.params.data_blocks, 16);

        let verify_params = Params::default();
        verify(
            verify_params,
            data_file.path().to_str().unwrap(),
            hash_file.path().to_str().unwrap(),
            &report.root_hash,
        )
        .unwrap();
    }

    #[test]
    fn test_verify_fails_on_bad_root() {
        let data_file = NamedTempFile::new().unwrap();
        let hash_file = NamedTempFile::new().unwrap();
        write_random_data(data_file.path(), 16 * 4096);

        let params = Params {
            hash_algorithm: "sha256".to_string(),
            data_block_size: 4096,
            hash_block_size: 4096,
            data_blocks: 0,
            hash_type: 1,
            salt: Vec::new(),
            hash_area_offset: 0,
            uuid: None,
            no_superblock: false,
        };

        let report = format(
            params,
            data_file.path().to_str().unwrap(),
            hash_file.path().to_str().unwrap(),
        )
        .unwrap();

        let mut bad_root = report.root_hash.clone();
        for b in bad_root.iter_mut() {
            *b = !*b;
        }

        let result = verify(
            Params::default(),
            data_file.path().to_str().unwrap(),
            hash_file.path().to_str().unwrap(),
            &bad_root,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_verify_fails_on_corrupted_data() {
        let data_file = NamedTempFile::new().unwrap();
        let hash_file = NamedTempFile::new().unwrap();
        write_random_data(data_file.path(), 16 * 4096);

        let params = Params {
            hash_algorithm: "sha256".to_string(),
            data_block_size: 4096,
            hash_block_size: 4096,
            data_blocks: 0,
            hash_type: 1,
            salt: Vec::new(),
            hash_area_offset: 0,
            uuid: None,
            no_superblock: false,
        };

        let report = format(
            params,
            data_file.path().to_str().unwrap(),
            hash_file.path().to_str().unwrap(),
        )
        .unwrap();

        // Corrupt a byte in the data device.
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut f = std::fs::OpenOptions::new()
                .write(true)
                .open(data_file.path())
                .unwrap();
            f.seek(SeekFrom::Start(0)).unwrap();
            f.write_all(&[0xFF]).unwrap();
        }

        let result = verify(
            Params::default(),
            data_file.path().to_str().unwrap(),
            hash_file.path().to_str().unwrap(),
            &report.root_hash,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_no_superblock_round_trip() {
        let data_file = NamedTempFile::new().unwrap();
        let hash_file = NamedTempFile::new().unwrap();
        write_random_data(data_file.path(), 16 * 4096);
        std::fs::write(hash_file.path(), Vec::new()).unwrap();

        let params = Params {
            hash_algorithm: "sha256".to_string(),
            data_block_size: 4096,
            hash_block_size: 4096,
            data_blocks: 0,
            hash_type: 1,
            salt: Vec::new(),
            hash_area_offset: 0,
            uuid: None,
            no_superblock: true,
        };

        let report = format(
            params.clone(),
            data_file.path().to_str().unwrap(),
            hash_file.path().to_str().unwrap(),
        )
        .unwrap();

        let mut verify_params = params;
        verify_params.data_blocks = 16;
        verify(
            verify_params,
            data_file.path().to_str().unwrap(),
            hash_file.path().to_str().unwrap(),
            &report.root_hash,
        )
        .unwrap();

        // No-superblock hash file must not start with the verity signature.
        let bytes = std::fs::read(hash_file.path()).unwrap();
        assert_ne!(&bytes[..8.min(bytes.len())], b"verity\0\0".get(..8.min(bytes.len())).unwrap());
    }
}
