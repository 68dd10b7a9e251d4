//! Device-mapper ioctl ABI
//!
//! The raw request/response structs mirror the kernel's `dm_ioctl` and
//! `dm_target_spec` layout exactly, including trailing padding to bring
//! `dm_ioctl` to the kernel's 312-byte, 8-byte-aligned size.

use nix::ioctl_readwrite;

/// `dm_ioctl.name` capacity.
pub const DM_NAME_LEN: usize = 128;
/// `dm_ioctl.uuid` capacity.
pub const DM_UUID_LEN: usize = 129;
/// `dm_target_spec.target_type` capacity.
pub const DM_MAX_TYPE_NAME: usize = 16;

/// Version advertised in every request (major, minor, patch).
pub const DM_VERSION: [u32; 3] = [4, 0, 0];

/// Set on `dm_ioctl.flags` to suspend an active device.
pub const DM_SUSPEND_FLAG: u32 = 1 << 1;
/// Set on `dm_ioctl.flags` to request the inactive (not live) table on status.
pub const DM_STATUS_TABLE_FLAG: u32 = 1 << 4;
/// Set on `dm_ioctl.flags` to skip a device flush before suspend/remove.
pub const DM_NOFLUSH_FLAG: u32 = 1 << 11;
/// Set on `dm_ioctl.flags` when a mapped device has an active table.
pub const DM_ACTIVE_PRESENT_FLAG: u32 = 1 << 5;

ioctl_readwrite!(dm_dev_create_ioctl, 0xfd, 3, DmIoctl);
ioctl_readwrite!(dm_dev_remove_ioctl, 0xfd, 4, DmIoctl);
ioctl_readwrite!(dm_table_load_ioctl, 0xfd, 2, DmIoctl);
ioctl_readwrite!(dm_dev_suspend_ioctl, 0xfd, 6, DmIoctl);
ioctl_readwrite!(dm_table_clear_ioctl, 0xfd, 9, DmIoctl);
ioctl_readwrite!(dm_table_status_ioctl, 0xfd, 11, DmIoctl);

/// The fixed header prefixing every dm-ioctl payload.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DmIoctl {
    pub version: [u32; 3],
    pub data_size: u32,
    pub data_start: u32,
    pub target_count: u32,
    pub open_count: i32,
    pub flags: u32,
    pub event_nr: u32,
    pub padding: u32,
    pub dev: u64,
    pub name: [u8; DM_NAME_LEN],
    pub uuid: [u8; DM_UUID_LEN],
    pub data: [u8; 7],
}

const _: () = assert!(std::mem::size_of::<DmIoctl>() == 312);

impl Default for DmIoctl {
    fn default() -> Self {
        Self {
            version: DM_VERSION,
            data_size: 0,
            data_start: 0,
            target_count: 0,
            open_count: 0,
            flags: 0,
            event_nr: 0,
            padding: 0,
            dev: 0,
            name: [0; DM_NAME_LEN],
            uuid: [0; DM_UUID_LEN],
            data: [0; 7],
        }
    }
}

impl DmIoctl {
    /// Builds a header for `data_size` total bytes and the given device name.
    pub fn for_name(name: &str, data_size: u32) -> Self {
        let mut header = Self {
            data_size,
            data_start: std::mem::size_of::<DmIoctl>() as u32,
            ..Self::default()
        };
        let name_bytes = name.as_bytes();
        header.name[..name_bytes.len()].copy_from_slice(name_bytes);
        header
    }

    pub fn name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}

/// One `dm_target_spec` record, as laid out ahead of each target's parameter
/// string in a table-load or table-status payload.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DmTargetSpec {
    pub sector_start: u64,
    pub length: u64,
    pub status: i32,
    pub next: u32,
    pub target_type: [u8; DM_MAX_TYPE_NAME],
}

const _: () = assert!(std::mem::size_of::<DmTargetSpec>() == 40);

impl Default for DmTargetSpec {
    fn default() -> Self {
        Self {
            sector_start: 0,
            length: 0,
            status: 0,
            next: 0,
            target_type: [0; DM_MAX_TYPE_NAME],
        }
    }
}

impl DmTargetSpec {
    pub fn new(sector_start: u64, length: u64, target_type: &str) -> Self {
        let mut spec = Self {
            sector_start,
            length,
            ..Self::default()
        };
        let ty = target_type.as_bytes();
        spec.target_type[..ty.len()].copy_from_slice(ty);
        spec
    }
}

/// Serializes `header` followed by a sequence of `(spec, params)` targets,
/// NUL-terminating and zero-padding each parameter string to the next
/// multiple of 8 bytes from its spec's start, per the kernel's table-load
/// wire format.
pub fn encode_table(header: DmIoctl, targets: &[(DmTargetSpec, String)]) -> Vec<u8> {
    let header_size = std::mem::size_of::<DmIoctl>();
    let spec_size = std::mem::size_of::<DmTargetSpec>();

    let mut buf = Vec::new();
    buf.extend_from_slice(struct_as_bytes(&header));

    for (i, (spec, params)) in targets.iter().enumerate() {
        let spec_start = buf.len();
        let mut spec = *spec;

        let mut param_bytes = params.as_bytes().to_vec();
        param_bytes.push(0);
        let unpadded_len = spec_size + param_bytes.len();
        let padded_len = align_up_usize(unpadded_len, 8);
        param_bytes.resize(padded_len - spec_size, 0);

        spec.next = if i + 1 < targets.len() {
            padded_len as u32
        } else {
            0
        };

        buf.extend_from_slice(struct_as_bytes(&spec));
        buf.extend_from_slice(&param_bytes);
        debug_assert_eq!(buf.len() - spec_start, padded_len);
    }

    buf.resize(buf.len().max(header_size), 0);
    buf
}

fn align_up_usize(value: usize, align: usize) -> usize {
    let rem = value % align;
    if rem == 0 {
        value
    } else {
        value + (align - rem)
    }
}

/// # Safety-free reinterpretation
///
/// These structs are `#[repr(C)]` plain-old-data with no padding bytes that
/// matter for correctness (explicit `padding`/`data` fields cover kernel
/// alignment), so a byte view is safe to construct from a shared reference.
pub(crate) fn struct_as_bytes<T>(value: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts((value as *const T) as *const u8, std::mem::size_of::<T>()) }
}

/// Reads a `DmIoctl` header back out of a raw ioctl response buffer.
pub(crate) fn header_from_bytes(buf: &[u8]) -> DmIoctl {
    assert!(buf.len() >= std::mem::size_of::<DmIoctl>());
    unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const DmIoctl) }
}

/// Reads a `DmTargetSpec` out of a raw ioctl response buffer at `offset`.
pub(crate) fn spec_from_bytes(buf: &[u8], offset: usize) -> DmTargetSpec {
    assert!(buf.len() >= offset + std::mem::size_of::<DmTargetSpec>());
    unsafe { std::ptr::read_unaligned(buf[offset..].as_ptr() as *const DmTargetSpec) }
}

pub use dm_dev_create_ioctl as dev_create;
pub use dm_dev_remove_ioctl as dev_remove;
pub use dm_dev_suspend_ioctl as dev_suspend_resume;
pub use dm_table_clear_ioctl as table_clear;
pub use dm_table_load_ioctl as table_load;
pub use dm_table_status_ioctl as table_status;
