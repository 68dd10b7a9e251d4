//! Block device abstraction layer
//!
//! Unifies access to the data and hash devices a verity tree is built over.
//! Both may be regular files (disk images) or Linux block-special device
//! nodes; either way the kernel treats `open()` + `pread`/`pwrite`
//! identically, so a single backend suffices for both.

pub mod image;

use std::io;
use thiserror::Error;

pub use image::ImageFile;

/// Errors that can occur during block device operations
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("device not found: {0}")]
    NotFound(String),

    #[error("invalid offset: {offset} (device size: {size})")]
    InvalidOffset { offset: u64, size: u64 },

    #[error("short read at offset {offset}: wanted {wanted} bytes, got {got}")]
    ShortRead {
        offset: u64,
        wanted: usize,
        got: usize,
    },

    #[error("device is read-only")]
    ReadOnly,
}

pub type Result<T> = std::result::Result<T, BlockDeviceError>;

/// Trait for block device access
pub trait BlockDevice: Send + Sync {
    /// Returns the total size of the device in bytes
    fn size(&self) -> u64;

    /// Returns true if the device is read-only
    fn is_read_only(&self) -> bool;

    /// Reads exactly `buf.len()` bytes at the specified offset
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes all of `buf` at the specified offset
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Truncates/extends the device to exactly `size` bytes
    fn set_len(&self, size: u64) -> Result<()>;

    /// Flushes any buffered data to the device
    fn flush(&self) -> Result<()>;
}

/// Opens a path as a block device, read-only or read-write.
pub fn open(path: &str, read_only: bool) -> Result<Box<dyn BlockDevice>> {
    Ok(Box::new(ImageFile::open(path, read_only)?))
}

/// Creates a new image file of the given size, truncating any existing file.
pub fn create(path: &str, size: u64) -> Result<Box<dyn BlockDevice>> {
    Ok(Box::new(ImageFile::create(path, size)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_device_error_display() {
        let err = BlockDeviceError::NotFound("test".to_string());
        assert_eq!(format!("{}", err), "device not found: test");

        let err = BlockDeviceError::InvalidOffset {
            offset: 1000,
            size: 500,
        };
        assert!(format!("{}", err).contains("1000"));
        assert!(format!("{}", err).contains("500"));

        let err = BlockDeviceError::ReadOnly;
        assert!(format!("{}", err).contains("read-only"));
    }

    #[test]
    fn test_open_image_file() {
        use tempfile::NamedTempFile;

        let temp = NamedTempFile::new().unwrap();
        let path = temp.path().to_str().unwrap();

        std::fs::write(path, vec![0u8; 1024]).unwrap();

        let device = open(path, true).unwrap();
        assert_eq!(device.size(), 1024);
        assert!(device.is_read_only());
    }

    #[test]
    fn test_open_nonexistent_file() {
        let result = open("/nonexistent/path/to/file.img", true);
        assert!(result.is_err());
    }
}
