//! Device-mapper control client (C6)
//!
//! Drives `/dev/mapper/control` through the raw ioctl ABI in [`super::ioctl`]
//! to activate, inspect, and tear down verity mappings.

use super::ioctl::{
    self, header_from_bytes, spec_from_bytes, struct_as_bytes, DmIoctl, DmTargetSpec,
    DM_NOFLUSH_FLAG, DM_STATUS_TABLE_FLAG, DM_SUSPEND_FLAG,
};
use nix::errno::Errno;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use thiserror::Error;

const CONTROL_PATH: &str = "/dev/mapper/control";
const DEV_MAPPER_DIR: &str = "/dev/mapper";
const ACTIVATION_POLL_ATTEMPTS: u32 = 50;
const ACTIVATION_POLL_INTERVAL: Duration = Duration::from_millis(20);
const STATUS_BUFFER_RETRIES: u32 = 3;
const INITIAL_STATUS_BUFFER: usize = 4096;

#[derive(Error, Debug)]
pub enum DmError {
    #[error("invalid device name {0:?}: must be non-empty, contain no '/', and be under 128 bytes")]
    InvalidName(String),

    #[error("failed to open {CONTROL_PATH}: {0}")]
    ControlOpen(#[source] Errno),

    #[error("ioctl {op} failed: {source}")]
    Ioctl { op: &'static str, source: Errno },

    #[error("kernel rejected root-hash signature")]
    SignatureRejected,

    #[error("device {0:?} not found")]
    NotFound(String),

    #[error("table status buffer still too small after {0} retries")]
    InsufficientBuffer(u32),
}

impl DmError {
    fn from_errno(op: &'static str, err: Errno) -> Self {
        if err == Errno::EKEYREJECTED {
            DmError::SignatureRejected
        } else {
            DmError::Ioctl { op, source: err }
        }
    }
}

/// Validates a device name per the activation-sequence contract.
pub fn validate_name(name: &str) -> Result<(), DmError> {
    if name.is_empty() || name.contains('/') || name.len() >= 128 {
        return Err(DmError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Handle to `/dev/mapper/control`, closed when dropped.
pub struct DmControl {
    file: File,
}

impl DmControl {
    pub fn open() -> Result<Self, DmError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(CONTROL_PATH)
            .map_err(|e| {
                DmError::ControlOpen(Errno::from_raw(e.raw_os_error().unwrap_or(nix::libc::EIO)))
            })?;
        Ok(Self { file })
    }

    fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn create_device(&self, name: &str) -> Result<(), DmError> {
        let mut header = DmIoctl::for_name(name, std::mem::size_of::<DmIoctl>() as u32);
        unsafe { ioctl::dev_create(self.raw_fd(), &mut header as *mut DmIoctl) }
            .map_err(|e| DmError::from_errno("create device", e))?;
        Ok(())
    }

    pub fn remove_device(&self, name: &str) -> Result<(), DmError> {
        let mut header = DmIoctl::for_name(name, std::mem::size_of::<DmIoctl>() as u32);
        unsafe { ioctl::dev_remove(self.raw_fd(), &mut header as *mut DmIoctl) }
            .map_err(|e| DmError::from_errno("remove device", e))?;
        Ok(())
    }

    pub fn load_table(&self, name: &str, spec: DmTargetSpec, params: &str) -> Result<(), DmError> {
        let header = DmIoctl::for_name(name, 0);
        let mut buf = ioctl::encode_table(header, &[(spec, params.to_string())]);
        let total_len = buf.len() as u32;
        {
            let mut reloaded = header_from_bytes(&buf);
            reloaded.data_size = total_len;
            reloaded.target_count = 1;
            buf[..std::mem::size_of::<DmIoctl>()].copy_from_slice(struct_as_bytes(&reloaded));
        }
        unsafe { ioctl::table_load(self.raw_fd(), buf.as_mut_ptr() as *mut DmIoctl) }
            .map_err(|e| DmError::from_errno("table load", e))?;
        Ok(())
    }

    fn set_suspended(&self, name: &str, suspend: bool, noflush: bool) -> Result<(), DmError> {
        let mut header = DmIoctl::for_name(name, std::mem::size_of::<DmIoctl>() as u32);
        if suspend {
            header.flags |= DM_SUSPEND_FLAG;
        }
        if noflush {
            header.flags |= DM_NOFLUSH_FLAG;
        }
        unsafe { ioctl::dev_suspend_resume(self.raw_fd(), &mut header as *mut DmIoctl) }
            .map_err(|e| DmError::from_errno("suspend/resume", e))?;
        Ok(())
    }

    pub fn suspend(&self, name: &str) -> Result<(), DmError> {
        self.set_suspended(name, true, false)
    }

    pub fn resume(&self, name: &str) -> Result<(), DmError> {
        self.set_suspended(name, false, false)
    }

    /// Clears any inactive (loaded-but-not-live) table. Tolerates `EINVAL`
    /// and `ENXIO` as a no-op: there may be nothing to clear.
    pub fn clear_inactive_table(&self, name: &str) -> Result<(), DmError> {
        let mut header = DmIoctl::for_name(name, std::mem::size_of::<DmIoctl>() as u32);
        match unsafe { ioctl::table_clear(self.raw_fd(), &mut header as *mut DmIoctl) } {
            Ok(_) => Ok(()),
            Err(Errno::EINVAL) | Err(Errno::ENXIO) => Ok(()),
            Err(e) => Err(DmError::from_errno("clear inactive table", e)),
        }
    }

    /// Fetches the live table-status line, growing the buffer up to
    /// [`STATUS_BUFFER_RETRIES`] times if the kernel reports it as too small.
    pub fn table_status(&self, name: &str) -> Result<DeviceStatus, DmError> {
        let mut buf_size = INITIAL_STATUS_BUFFER;
        for attempt in 0..STATUS_BUFFER_RETRIES {
            let mut buf = vec![0u8; buf_size];
            let mut header = DmIoctl::for_name(name, buf_size as u32);
            header.flags |= DM_STATUS_TABLE_FLAG;
            buf[..std::mem::size_of::<DmIoctl>()].copy_from_slice(struct_as_bytes(&header));

            match unsafe { ioctl::table_status(self.raw_fd(), buf.as_mut_ptr() as *mut DmIoctl) } {
                Ok(_) => return Ok(parse_status_response(&buf)),
                Err(Errno::ENOSPC) | Err(Errno::EINVAL) if attempt + 1 < STATUS_BUFFER_RETRIES => {
                    buf_size *= 2;
                    continue;
                }
                Err(Errno::ENXIO) => return Err(DmError::NotFound(name.to_string())),
                Err(e) => return Err(DmError::from_errno("table status", e)),
            }
        }
        Err(DmError::InsufficientBuffer(STATUS_BUFFER_RETRIES))
    }
}

/// Parsed result of a table-status ioctl.
#[derive(Debug, Clone)]
pub struct DeviceStatus {
    pub active: bool,
    pub open_count: i32,
    pub event_nr: u32,
    pub dev: u64,
    pub table_line: Option<String>,
}

impl DeviceStatus {
    /// `major:minor` formatted from the packed `dev_t`.
    pub fn major_minor(&self) -> (u32, u32) {
        let major = (self.dev >> 8) as u32 & 0xfff;
        let minor = ((self.dev & 0xff) | ((self.dev >> 12) & 0xfff00)) as u32;
        (major, minor)
    }
}

fn parse_status_response(buf: &[u8]) -> DeviceStatus {
    let header = header_from_bytes(buf);
    let header_size = std::mem::size_of::<DmIoctl>();
    let spec_size = std::mem::size_of::<DmTargetSpec>();

    let active = header.flags & super::ioctl::DM_ACTIVE_PRESENT_FLAG != 0 || header.target_count > 0;

    let table_line = if header.target_count > 0 && buf.len() >= header_size + spec_size {
        let spec = spec_from_bytes(buf, header_size);
        let str_start = header_size + spec_size;
        let str_end = buf[str_start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| str_start + p)
            .unwrap_or(buf.len());
        let _ = spec.target_type;
        Some(String::from_utf8_lossy(&buf[str_start..str_end]).into_owned())
    } else {
        None
    };

    DeviceStatus {
        active,
        open_count: header.open_count,
        event_nr: header.event_nr,
        dev: header.dev,
        table_line,
    }
}

/// Returns the `/dev/mapper/<name>` path, without checking it exists.
pub fn device_path(name: &str) -> PathBuf {
    PathBuf::from(DEV_MAPPER_DIR).join(name)
}

/// Activates a verity mapping: create, load, resume, then wait briefly for
/// the mapper node to appear. On any failure after device creation, the
/// partial device is removed before the original error is returned.
pub fn activate(name: &str, target_line: &str, spec: DmTargetSpec) -> Result<PathBuf, DmError> {
    validate_name(name)?;
    let ctl = DmControl::open()?;

    ctl.create_device(name)?;

    if let Err(err) = ctl.load_table(name, spec, target_line) {
        let _ = ctl.remove_device(name);
        return Err(err);
    }

    if let Err(err) = ctl.resume(name) {
        let _ = ctl.remove_device(name);
        return Err(err);
    }

    for _ in 0..ACTIVATION_POLL_ATTEMPTS {
        if device_path(name).exists() {
            break;
        }
        thread::sleep(ACTIVATION_POLL_INTERVAL);
    }

    Ok(device_path(name))
}

/// Removes a mapping by name. Fails if the device is unknown.
pub fn deactivate(name: &str) -> Result<PathBuf, DmError> {
    validate_name(name)?;
    let ctl = DmControl::open()?;
    match ctl.table_status(name) {
        Ok(_) => {}
        Err(DmError::NotFound(n)) => return Err(DmError::NotFound(n)),
        Err(e) => return Err(e),
    }
    ctl.remove_device(name)?;
    Ok(device_path(name))
}

/// Queries the live status of a mapping by name.
pub fn status(name: &str) -> Result<DeviceStatus, DmError> {
    validate_name(name)?;
    let ctl = DmControl::open()?;
    ctl.table_status(name)
}

/// RAII guard that removes the mapping on drop, logging (not panicking) on
/// failure to close.
pub struct VerityDeviceGuard {
    name: String,
    active: bool,
}

impl VerityDeviceGuard {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            active: true,
        }
    }

    /// Detaches the guard so dropping it no longer closes the device.
    pub fn disarm(&mut self) {
        self.active = false;
    }
}

impl Drop for VerityDeviceGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(err) = deactivate(&self.name) {
            tracing::error!(name = %self.name, error = %err, "failed to close verity device");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name_rejects_empty() {
        assert!(validate_name("").is_err());
    }

    #[test]
    fn test_validate_name_rejects_slash() {
        assert!(validate_name("foo/bar").is_err());
    }

    #[test]
    fn test_validate_name_rejects_too_long() {
        let name = "a".repeat(128);
        assert!(validate_name(&name).is_err());
    }

    #[test]
    fn test_validate_name_accepts_127_chars() {
        let name = "a".repeat(127);
        assert!(validate_name(&name).is_ok());
    }

    #[test]
    fn test_validate_name_accepts_normal_name() {
        assert!(validate_name("my-verity-dev").is_ok());
    }

    #[test]
    fn test_device_path() {
        assert_eq!(device_path("root"), PathBuf::from("/dev/mapper/root"));
    }

    #[test]
    fn test_major_minor_decoding() {
        let status = DeviceStatus {
            active: true,
            open_count: 0,
            event_nr: 0,
            dev: (253u64 << 8) | 7,
            table_line: None,
        };
        let (major, minor) = status.major_minor();
        assert_eq!(major, 253);
        assert_eq!(minor, 7);
    }
}
