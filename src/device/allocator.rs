// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Device allocator trait, RAII allocations and the mock allocator used for
//! tests and host-side accounting.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use super::info::DeviceId;

/// Device-level failures.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("out of memory on {device}: requested {requested} bytes, available {available} bytes")]
    OutOfMemory {
        device: DeviceId,
        requested: u64,
        available: u64,
    },

    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("allocation failed: {0}")]
    AllocationFailed(String),
}

impl DeviceError {
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, DeviceError::OutOfMemory { .. })
    }
}

/// A raw allocation as reported by an allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawAllocation {
    pub id: u64,
    pub size: u64,
    pub device: DeviceId,
    pub pinned: bool,
}

/// Trait abstracting byte accounting on one device.
pub trait DeviceAllocator: Send + Sync {
    fn device(&self) -> DeviceId;
    fn capacity(&self) -> u64;
    fn allocate(&self, size: u64, pinned: bool) -> Result<RawAllocation, DeviceError>;
    fn deallocate(&self, allocation_id: u64) -> Result<(), DeviceError>;
    fn allocated_bytes(&self) -> u64;

    fn pinned_bytes(&self) -> u64 {
        0
    }

    /// Return cached-but-unused blocks to the driver.
    fn release_cached(&self) {}
}

/// An allocation that is returned to its allocator on drop.
pub struct DeviceAllocation {
    raw: RawAllocation,
    allocator: Arc<dyn DeviceAllocator>,
}

impl DeviceAllocation {
    pub fn id(&self) -> u64 {
        self.raw.id
    }

    pub fn size(&self) -> u64 {
        self.raw.size
    }

    pub fn device(&self) -> DeviceId {
        self.raw.device
    }

    pub fn is_pinned(&self) -> bool {
        self.raw.pinned
    }
}

impl fmt::Debug for DeviceAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAllocation")
            .field("id", &self.raw.id)
            .field("size", &self.raw.size)
            .field("device", &self.raw.device)
            .field("pinned", &self.raw.pinned)
            .finish()
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        if let Err(e) = self.allocator.deallocate(self.raw.id) {
            tracing::warn!(device = %self.raw.device, id = self.raw.id, error = %e, "deallocation failed");
        }
    }
}

/// Allocate `size` bytes and wrap the result so it is freed on drop.
pub fn allocate_on(
    allocator: &Arc<dyn DeviceAllocator>,
    size: u64,
    pinned: bool,
) -> Result<DeviceAllocation, DeviceError> {
    let raw = allocator.allocate(size, pinned)?;
    Ok(DeviceAllocation {
        raw,
        allocator: Arc::clone(allocator),
    })
}

// -- Mock allocator (testing + host accounting) -------------------------------

struct MockState {
    allocations: HashMap<u64, (u64, bool)>,
    total: u64,
    pinned: u64,
}

/// Mock allocator backed by a HashMap, with OOM fault injection.
pub struct MockDeviceAllocator {
    device: DeviceId,
    capacity: u64,
    next_id: AtomicU64,
    injected_failures: AtomicUsize,
    cache_releases: AtomicUsize,
    state: Mutex<MockState>,
}

impl MockDeviceAllocator {
    pub fn new(device: DeviceId, capacity: u64) -> Self {
        Self {
            device,
            capacity,
            next_id: AtomicU64::new(1),
            injected_failures: AtomicUsize::new(0),
            cache_releases: AtomicUsize::new(0),
            state: Mutex::new(MockState {
                allocations: HashMap::new(),
                total: 0,
                pinned: 0,
            }),
        }
    }

    /// Make the next `count` allocations fail with `OutOfMemory`
    /// regardless of remaining capacity.
    pub fn inject_oom(&self, count: usize) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Count of live (un-freed) allocations, for leak detection.
    pub fn leak_count(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// How many times `release_cached` was called.
    pub fn cache_releases(&self) -> usize {
        self.cache_releases.load(Ordering::Relaxed)
    }

    fn take_injected_failure(&self) -> bool {
        self.injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl DeviceAllocator for MockDeviceAllocator {
    fn device(&self) -> DeviceId {
        self.device
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn allocate(&self, size: u64, pinned: bool) -> Result<RawAllocation, DeviceError> {
        let mut s = self.state.lock();
        let available = self.capacity.saturating_sub(s.total);
        if self.take_injected_failure() || size > available {
            return Err(DeviceError::OutOfMemory {
                device: self.device,
                requested: size,
                available,
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        s.allocations.insert(id, (size, pinned));
        s.total += size;
        if pinned {
            s.pinned += size;
        }
        Ok(RawAllocation { id, size, device: self.device, pinned })
    }

    fn deallocate(&self, allocation_id: u64) -> Result<(), DeviceError> {
        let mut s = self.state.lock();
        match s.allocations.remove(&allocation_id) {
            Some((size, pinned)) => {
                s.total -= size;
                if pinned {
                    s.pinned -= size;
                }
                Ok(())
            }
            None => Err(DeviceError::AllocationFailed(format!(
                "double-free or unknown allocation id={allocation_id}"
            ))),
        }
    }

    fn allocated_bytes(&self) -> u64 {
        self.state.lock().total
    }

    fn pinned_bytes(&self) -> u64 {
        self.state.lock().pinned
    }

    fn release_cached(&self) {
        self.cache_releases.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
#[path = "allocator_tests.rs"]
mod tests;
