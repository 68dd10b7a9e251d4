//! Device-mapper integration
//!
//! Builds dm-verity target strings and drives the kernel's device-mapper
//! ioctl ABI to activate, inspect, and tear down verity mappings.

pub mod client;
pub mod ioctl;
pub mod target;

pub use client::{activate, deactivate, status, DeviceStatus, DmControl, DmError, VerityDeviceGuard};
pub use target::{TargetError, TargetParams};
