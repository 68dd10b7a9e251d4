//! Image file access
//!
//! Provides access to data and hash devices stored in regular files or
//! block-special device nodes; both are opened and accessed identically.

use super::{BlockDevice, BlockDeviceError, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// An image-file-backed block device
pub struct ImageFile {
    file: RwLock<File>,
    /// `None` once the file has been resized via `set_len`: the mapping
    /// would be stale, so reads/writes fall back to positioned file I/O.
    mmap: RwLock<Option<MmapMut>>,
    size: AtomicU64,
    read_only: bool,
}

impl ImageFile {
    /// Opens an existing image file or device node.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path.as_ref())?;

        let metadata = file.metadata()?;
        let size = metadata.len();

        let mmap = if size > 0 && !read_only {
            unsafe { MmapOptions::new().map_mut(&file) }.ok()
        } else {
            None
        };

        Ok(Self {
            file: RwLock::new(file),
            mmap: RwLock::new(mmap),
            size: AtomicU64::new(size),
            read_only,
        })
    }

    /// Creates a new image file with the specified size, truncating any
    /// existing file at `path`.
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;

        file.set_len(size)?;

        let mmap = if size > 0 {
            unsafe { MmapOptions::new().map_mut(&file) }.ok()
        } else {
            None
        };

        Ok(Self {
            file: RwLock::new(file),
            mmap: RwLock::new(mmap),
            size: AtomicU64::new(size),
            read_only: false,
        })
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<()> {
        let size = self.size.load(Ordering::Acquire);
        let end = offset
            .checked_add(len as u64)
            .ok_or(BlockDeviceError::InvalidOffset { offset, size })?;
        if end > size {
            return Err(BlockDeviceError::InvalidOffset { offset, size });
        }
        Ok(())
    }
}

impl BlockDevice for ImageFile {
    fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;

        if let Some(mmap) = self.mmap.read().unwrap().as_ref() {
            buf.copy_from_slice(&mmap[offset as usize..offset as usize + buf.len()]);
            return Ok(());
        }

        let mut file = self.file.write().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        let n = file.read(buf)?;
        if n != buf.len() {
            return Err(BlockDeviceError::ShortRead {
                offset,
                wanted: buf.len(),
                got: n,
            });
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        self.check_bounds(offset, buf.len())?;

        if let Some(mmap) = self.mmap.write().unwrap().as_mut() {
            mmap[offset as usize..offset as usize + buf.len()].copy_from_slice(buf);
            return Ok(());
        }

        let mut file = self.file.write().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn set_len(&self, size: u64) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        {
            let file = self.file.write().unwrap();
            file.set_len(size)?;
        }
        *self.mmap.write().unwrap() = None;
        self.size.store(size, Ordering::Release);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        if let Some(mmap) = self.mmap.write().unwrap().as_mut() {
            mmap.flush()?;
        }
        self.file.write().unwrap().flush()?;
        Ok(())
    }
}

// ImageFile is Send + Sync because all mutable state is behind RwLock
unsafe impl Send for ImageFile {}
unsafe impl Sync for ImageFile {}
