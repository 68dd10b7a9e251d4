//! rsverity
//!
//! A user-space dm-verity toolkit: a pure-Rust Merkle hash-tree engine for
//! building and checking the on-disk verity format, plus a Linux
//! device-mapper ioctl client for activating kernel-enforced mappings.
//!
//! # Architecture
//!
//! - [`blockdev`]: block device abstraction layer for data/hash devices
//!   backed by regular files or block-special device nodes
//! - [`core`]: parameter validation, the on-disk superblock, the hash-tree
//!   engine, and the high-level format/verify/dump operations
//! - [`dm`]: dm-verity target-string builder and device-mapper ioctl client
//!   (Linux only)

pub mod blockdev;
pub mod core;

#[cfg(target_os = "linux")]
pub mod dm;

pub use blockdev::{BlockDevice, BlockDeviceError};
pub use core::{
    DigestError, DumpReport, HashAlgorithm, HashLevel, HashTreeError, ParamError, Params, Report,
    Superblock, SuperblockError, VerityError,
};

#[cfg(target_os = "linux")]
pub use dm::{DmError, TargetParams};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
