//! dm-verity target parameter string builder (C5)

use thiserror::Error;

/// Flags passed through verbatim to the kernel target, in emission order.
pub const PASSTHROUGH_FLAGS: &[&str] = &[
    "ignore_corruption",
    "panic_on_corruption",
    "restart_on_corruption",
    "error_on_corruption",
    "ignore_zero_blocks",
    "check_at_most_once",
    "use_tasklets",
    "shared",
];

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("{0} device path must not be empty")]
    EmptyDevice(&'static str),

    #[error("block size must be nonzero")]
    ZeroBlockSize,

    #[error("data_blocks must be nonzero")]
    ZeroDataBlocks,

    #[error("root hash must not be empty")]
    EmptyRootHash,

    #[error("hash_area_offset {offset} is not a multiple of hash_block_size {hash_block_size}")]
    MisalignedHashAreaOffset { offset: u64, hash_block_size: u32 },
}

/// Inputs to the verity target-string grammar (spec section 4.5).
#[derive(Debug, Clone)]
pub struct TargetParams {
    pub version: u32,
    pub data_dev: String,
    pub hash_dev: String,
    pub data_block_size: u32,
    pub hash_block_size: u32,
    pub data_blocks: u64,
    pub hash_area_offset: u64,
    pub algorithm: String,
    pub root_hash: Vec<u8>,
    pub salt: Vec<u8>,
    pub opts: Vec<String>,
    pub root_hash_sig_key_desc: Option<String>,
}

impl Default for TargetParams {
    fn default() -> Self {
        Self {
            version: 1,
            data_dev: String::new(),
            hash_dev: String::new(),
            data_block_size: 0,
            hash_block_size: 0,
            data_blocks: 0,
            hash_area_offset: 0,
            algorithm: String::new(),
            root_hash: Vec::new(),
            salt: Vec::new(),
            opts: Vec::new(),
            root_hash_sig_key_desc: None,
        }
    }
}

impl TargetParams {
    fn validate(&self) -> Result<(), TargetError> {
        if self.data_dev.is_empty() {
            return Err(TargetError::EmptyDevice("data"));
        }
        if self.hash_dev.is_empty() {
            return Err(TargetError::EmptyDevice("hash"));
        }
        if self.data_block_size == 0 || self.hash_block_size == 0 {
            return Err(TargetError::ZeroBlockSize);
        }
        if self.data_blocks == 0 {
            return Err(TargetError::ZeroDataBlocks);
        }
        if self.root_hash.is_empty() {
            return Err(TargetError::EmptyRootHash);
        }
        if self.hash_area_offset % self.hash_block_size as u64 != 0 {
            return Err(TargetError::MisalignedHashAreaOffset {
                offset: self.hash_area_offset,
                hash_block_size: self.hash_block_size,
            });
        }
        Ok(())
    }

    /// Builds the single ASCII parameter line consumed by the kernel target.
    pub fn to_line(&self) -> Result<String, TargetError> {
        self.validate()?;

        let hash_start_blocks = self.hash_area_offset / self.hash_block_size as u64;
        let algorithm = if self.algorithm.is_empty() {
            "sha256".to_string()
        } else {
            self.algorithm.to_lowercase()
        };
        let root_hex = hex::encode(&self.root_hash);
        let salt_hex = if self.salt.is_empty() {
            "-".to_string()
        } else {
            hex::encode(&self.salt)
        };

        let mut line = format!(
            "{} {} {} {} {} {} {} {} {} {}",
            self.version,
            self.data_dev,
            self.hash_dev,
            self.data_block_size,
            self.hash_block_size,
            self.data_blocks,
            hash_start_blocks,
            algorithm,
            root_hex,
            salt_hex,
        );

        let has_sig = self.root_hash_sig_key_desc.is_some();
        if !self.opts.is_empty() || has_sig {
            let n = self.opts.len() + if has_sig { 2 } else { 0 };
            line.push_str(&format!(" {n}"));
            for opt in &self.opts {
                line.push(' ');
                line.push_str(opt);
            }
            if let Some(desc) = &self.root_hash_sig_key_desc {
                line.push_str(" root_hash_sig_key_desc ");
                line.push_str(desc);
            }
        }

        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_params() -> TargetParams {
        TargetParams {
            version: 1,
            data_dev: "/dev/loop0".to_string(),
            hash_dev: "/dev/loop1".to_string(),
            data_block_size: 4096,
            hash_block_size: 4096,
            data_blocks: 16,
            hash_area_offset: 4096,
            algorithm: "sha256".to_string(),
            root_hash: vec![0xab; 32],
            salt: Vec::new(),
            opts: Vec::new(),
            root_hash_sig_key_desc: None,
        }
    }

    #[test]
    fn test_basic_line() {
        let line = base_params().to_line().unwrap();
        assert_eq!(
            line,
            format!(
                "1 /dev/loop0 /dev/loop1 4096 4096 16 1 sha256 {} -",
                "ab".repeat(32)
            )
        );
    }

    #[test]
    fn test_empty_salt_emits_dash() {
        let line = base_params().to_line().unwrap();
        assert!(line.ends_with('-'));
    }

    #[test]
    fn test_salt_hex_encoded() {
        let mut p = base_params();
        p.salt = vec![0xde, 0xad, 0xbe, 0xef];
        let line = p.to_line().unwrap();
        assert!(line.ends_with("deadbeef"));
    }

    #[test]
    fn test_default_algorithm() {
        let mut p = base_params();
        p.algorithm = String::new();
        let line = p.to_line().unwrap();
        assert!(line.contains(" sha256 "));
    }

    #[test]
    fn test_algorithm_lowercased() {
        let mut p = base_params();
        p.algorithm = "SHA256".to_string();
        let line = p.to_line().unwrap();
        assert!(line.contains(" sha256 "));
    }

    #[test]
    fn test_opts_emit_count_and_tokens() {
        let mut p = base_params();
        p.opts = vec!["ignore_corruption".to_string(), "check_at_most_once".to_string()];
        let line = p.to_line().unwrap();
        let tokens: Vec<&str> = line.split(' ').collect();
        let n_pos = tokens.len() - 3;
        assert_eq!(tokens[n_pos], "2");
        assert_eq!(tokens[n_pos + 1], "ignore_corruption");
        assert_eq!(tokens[n_pos + 2], "check_at_most_once");
    }

    #[test]
    fn test_sig_key_desc_counts_as_two_tokens() {
        let mut p = base_params();
        p.root_hash_sig_key_desc = Some("my-key".to_string());
        let line = p.to_line().unwrap();
        let tokens: Vec<&str> = line.split(' ').collect();
        let n_pos = tokens.len() - 3;
        assert_eq!(tokens[n_pos], "2");
        assert_eq!(tokens[n_pos + 1], "root_hash_sig_key_desc");
        assert_eq!(tokens[n_pos + 2], "my-key");
    }

    #[test]
    fn test_opts_and_sig_key_desc_combined_count() {
        let mut p = base_params();
        p.opts = vec!["shared".to_string()];
        p.root_hash_sig_key_desc = Some("desc".to_string());
        let line = p.to_line().unwrap();
        let tokens: Vec<&str> = line.split(' ').collect();
        // 10 base tokens + "n" + 1 opt + 2 sig tokens = 14
        assert_eq!(tokens.len(), 14);
        let n_pos = 10;
        assert_eq!(tokens[n_pos], "3");
    }

    #[test]
    fn test_no_optional_tail_when_nothing_to_emit() {
        let line = base_params().to_line().unwrap();
        let tokens: Vec<&str> = line.split(' ').collect();
        assert_eq!(tokens.len(), 10);
    }

    #[test]
    fn test_rejects_empty_data_dev() {
        let mut p = base_params();
        p.data_dev = String::new();
        assert!(matches!(p.to_line(), Err(TargetError::EmptyDevice("data"))));
    }

    #[test]
    fn test_rejects_zero_data_blocks() {
        let mut p = base_params();
        p.data_blocks = 0;
        assert!(matches!(p.to_line(), Err(TargetError::ZeroDataBlocks)));
    }

    #[test]
    fn test_rejects_empty_root_hash() {
        let mut p = base_params();
        p.root_hash = Vec::new();
        assert!(matches!(p.to_line(), Err(TargetError::EmptyRootHash)));
    }

    #[test]
    fn test_rejects_misaligned_hash_area_offset() {
        let mut p = base_params();
        p.hash_area_offset = 100;
        assert!(matches!(
            p.to_line(),
            Err(TargetError::MisalignedHashAreaOffset { .. })
        ));
    }
}
