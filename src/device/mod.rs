//! Device catalog: memory spaces, their allocators and the global
//! operating mode that governs how aggressively weights are offloaded.

mod allocator;
mod catalog;
mod dtype;
mod info;
mod mode;

pub use allocator::{
    allocate_on, DeviceAllocation, DeviceAllocator, DeviceError, MockDeviceAllocator, RawAllocation,
};
pub use catalog::{DeviceCatalog, DeviceConfig, DeviceSpec};
pub use dtype::DType;
pub use info::{CapabilityTier, DeviceId, DeviceInfo};
pub use mode::{ModeTransition, OperatingMode, ParseModeError};

/// One gibibyte.
pub const GIB: u64 = 1024 * 1024 * 1024;
/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;
