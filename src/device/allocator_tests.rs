//! Tests for the allocator trait, RAII allocations and MockDeviceAllocator.

use std::sync::Arc;

use super::{allocate_on, DeviceAllocator, DeviceError, MockDeviceAllocator};
use crate::device::DeviceId;

const ACCEL: DeviceId = DeviceId::Accelerator(0);

#[test]
fn allocate_and_deallocate_all_returns_zero() {
    let alloc = MockDeviceAllocator::new(ACCEL, 4096);
    let mut handles = Vec::new();
    for _ in 0..8 {
        handles.push(alloc.allocate(512, false).unwrap());
    }
    assert_eq!(alloc.allocated_bytes(), 4096);
    for h in &handles {
        alloc.deallocate(h.id).unwrap();
    }
    assert_eq!(alloc.allocated_bytes(), 0);
    assert_eq!(alloc.leak_count(), 0);
}

#[test]
fn raii_drop_deallocates() {
    let mock = Arc::new(MockDeviceAllocator::new(ACCEL, 4096));
    let alloc: Arc<dyn DeviceAllocator> = mock.clone();
    let allocation = allocate_on(&alloc, 1024, false).unwrap();
    assert_eq!(mock.allocated_bytes(), 1024);
    assert_eq!(allocation.device(), ACCEL);
    drop(allocation);
    assert_eq!(mock.allocated_bytes(), 0);
}

#[test]
fn beyond_capacity_returns_out_of_memory() {
    let alloc = MockDeviceAllocator::new(ACCEL, 1024);
    let _a = alloc.allocate(512, false).unwrap();
    let result = alloc.allocate(1024, false);
    match result {
        Err(DeviceError::OutOfMemory { requested, available, device }) => {
            assert_eq!(requested, 1024);
            assert_eq!(available, 512);
            assert_eq!(device, ACCEL);
        }
        other => panic!("expected OutOfMemory, got {other:?}"),
    }
}

#[test]
fn double_free_detection() {
    let alloc = MockDeviceAllocator::new(ACCEL, 4096);
    let handle = alloc.allocate(256, false).unwrap();
    alloc.deallocate(handle.id).unwrap();
    let result = alloc.deallocate(handle.id);
    assert!(matches!(result, Err(DeviceError::AllocationFailed(_))));
}

#[test]
fn injected_failures_are_consumed() {
    let alloc = MockDeviceAllocator::new(ACCEL, 4096);
    alloc.inject_oom(2);
    assert!(alloc.allocate(1, false).unwrap_err().is_out_of_memory());
    assert!(alloc.allocate(1, false).unwrap_err().is_out_of_memory());
    assert!(alloc.allocate(1, false).is_ok());
}

#[test]
fn pinned_bytes_are_tracked_separately() {
    let alloc = MockDeviceAllocator::new(DeviceId::Host, 4096);
    let a = alloc.allocate(100, true).unwrap();
    let _b = alloc.allocate(50, false).unwrap();
    assert_eq!(alloc.pinned_bytes(), 100);
    assert_eq!(alloc.allocated_bytes(), 150);
    alloc.deallocate(a.id).unwrap();
    assert_eq!(alloc.pinned_bytes(), 0);
}

#[test]
fn allocation_ids_are_unique() {
    let alloc = MockDeviceAllocator::new(ACCEL, 4096);
    let a = alloc.allocate(64, false).unwrap();
    let b = alloc.allocate(64, false).unwrap();
    assert_ne!(a.id, b.id);
}

#[test]
fn stress_1000_cycles_zero_drift() {
    let mock = Arc::new(MockDeviceAllocator::new(ACCEL, 1024 * 1024));
    let alloc: Arc<dyn DeviceAllocator> = mock.clone();
    for _ in 0..1000 {
        let a = allocate_on(&alloc, 1024, false).unwrap();
        drop(a);
    }
    assert_eq!(mock.allocated_bytes(), 0);
    assert_eq!(mock.leak_count(), 0);
}
