// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Device Catalog - detected devices, their allocators and the operating mode.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::allocator::{DeviceAllocator, DeviceError, MockDeviceAllocator};
use super::info::{CapabilityTier, DeviceId, DeviceInfo};
use super::mode::{ModeTransition, OperatingMode};
use super::GIB;

/// Startup device configuration. Read once, immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Operator override for the initial operating mode
    pub mode_override: Option<OperatingMode>,
    /// Fraction of accelerator capacity the manager may use (0.0 - 1.0)
    pub budget_fraction: f64,
    /// Pin host memory for offloaded weights
    pub pin_host_memory: bool,
    /// Evict every unpinned model from the accelerator on each load
    pub always_offload: bool,
    /// Use an independent copy stream when the device supports it
    pub async_streams: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mode_override: None,
            budget_fraction: 1.0,
            pin_host_memory: false,
            always_offload: false,
            async_streams: true,
        }
    }
}

/// A device handed to the catalog at startup.
pub struct DeviceSpec {
    pub name: String,
    pub tier: CapabilityTier,
    pub allocator: Arc<dyn DeviceAllocator>,
}

impl DeviceSpec {
    pub fn new(name: impl Into<String>, tier: CapabilityTier, allocator: Arc<dyn DeviceAllocator>) -> Self {
        Self {
            name: name.into(),
            tier,
            allocator,
        }
    }

    /// Host memory space.
    pub fn host(allocator: Arc<dyn DeviceAllocator>) -> Self {
        Self::new("host", CapabilityTier::HostOnly, allocator)
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.allocator.device(),
            name: self.name.clone(),
            tier: self.tier,
            total_memory: self.allocator.capacity(),
        }
    }
}

/// Device catalog and owner of the global operating mode.
pub struct DeviceCatalog {
    host: DeviceInfo,
    accelerator: Option<DeviceInfo>,
    allocators: HashMap<DeviceId, Arc<dyn DeviceAllocator>>,
    mode: OperatingMode,
    config: DeviceConfig,
}

impl DeviceCatalog {
    /// Build the catalog and resolve the initial operating mode.
    pub fn detect(config: &DeviceConfig, host: DeviceSpec, accelerator: Option<DeviceSpec>) -> Self {
        let mut allocators = HashMap::new();
        let host_info = host.info();
        allocators.insert(host_info.id, host.allocator);

        let accel_info = accelerator.map(|spec| {
            let info = spec.info();
            allocators.insert(info.id, spec.allocator);
            info
        });

        let mode = resolve_initial_mode(config, accel_info.as_ref());
        tracing::info!(
            mode = %mode,
            accelerator = accel_info.as_ref().map(|a| a.name.as_str()).unwrap_or("none"),
            tier = %accel_info.as_ref().map(|a| a.tier).unwrap_or(CapabilityTier::HostOnly),
            "device catalog initialized"
        );

        Self {
            host: host_info,
            accelerator: accel_info,
            allocators,
            mode,
            config: config.clone(),
        }
    }

    /// Catalog over mock allocators: one accelerator of `accelerator_bytes`
    /// (or none) and 64 GiB of host memory.
    pub fn mock(config: &DeviceConfig, accelerator_bytes: Option<u64>, tier: CapabilityTier) -> Self {
        let host = Arc::new(MockDeviceAllocator::new(DeviceId::Host, 64 * GIB));
        let accelerator = accelerator_bytes.map(|bytes| {
            let alloc = Arc::new(MockDeviceAllocator::new(DeviceId::Accelerator(0), bytes));
            DeviceSpec::new("mock-accelerator", tier, alloc)
        });
        Self::detect(config, DeviceSpec::host(host), accelerator)
    }

    pub fn current_mode(&self) -> OperatingMode {
        self.mode
    }

    /// Step the mode one level down the budget chain. Returns `None` when
    /// already at the floor or in a mode that never steps down.
    pub fn downgrade(&mut self) -> Option<ModeTransition> {
        let to = self.mode.next_lower()?;
        let transition = ModeTransition { from: self.mode, to };
        self.mode = to;
        Some(transition)
    }

    pub fn capability_tier(&self, device: DeviceId) -> CapabilityTier {
        match &self.accelerator {
            Some(a) if a.id == device => a.tier,
            _ => CapabilityTier::HostOnly,
        }
    }

    pub fn host(&self) -> &DeviceInfo {
        &self.host
    }

    pub fn accelerator(&self) -> Option<&DeviceInfo> {
        self.accelerator.as_ref()
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceInfo> {
        std::iter::once(&self.host).chain(self.accelerator.iter())
    }

    pub fn is_host(&self, device: DeviceId) -> bool {
        device == self.host.id
    }

    /// Where compute runs: the accelerator unless the mode is `Disabled`.
    pub fn load_device(&self) -> DeviceId {
        match (&self.accelerator, self.mode) {
            (Some(a), mode) if mode != OperatingMode::Disabled => a.id,
            _ => self.host.id,
        }
    }

    pub fn offload_device(&self) -> DeviceId {
        self.host.id
    }

    /// Map a model's requested load device onto a device that exists.
    pub fn resolve_load_device(&self, requested: DeviceId) -> DeviceId {
        if self.mode == OperatingMode::Disabled || !self.allocators.contains_key(&requested) {
            return self.load_device();
        }
        requested
    }

    /// Where a freshly constructed model should have its weights placed.
    /// Only high-budget and shared modes skip the trip through host memory.
    pub fn initial_load_device(&self) -> DeviceId {
        match self.mode {
            OperatingMode::HighBudget | OperatingMode::Shared => self.load_device(),
            _ => self.offload_device(),
        }
    }

    pub fn allocator(&self, device: DeviceId) -> Result<&Arc<dyn DeviceAllocator>, DeviceError> {
        self.allocators.get(&device).ok_or(DeviceError::UnknownDevice(device))
    }

    /// Usable bytes on `device`, after the budget fraction.
    pub fn total_memory(&self, device: DeviceId) -> u64 {
        let Some(alloc) = self.allocators.get(&device) else { return 0 };
        if self.is_host(device) {
            return alloc.capacity();
        }
        (alloc.capacity() as f64 * self.config.budget_fraction.clamp(0.0, 1.0)) as u64
    }

    pub fn free_memory(&self, device: DeviceId) -> u64 {
        let allocated = self.allocators.get(&device).map_or(0, |a| a.allocated_bytes());
        self.total_memory(device).saturating_sub(allocated)
    }

    pub fn allocated_bytes(&self, device: DeviceId) -> u64 {
        self.allocators.get(&device).map_or(0, |a| a.allocated_bytes())
    }

    pub fn supports_async_streams(&self) -> bool {
        self.config.async_streams
            && self.mode != OperatingMode::Disabled
            && self.accelerator.as_ref().is_some_and(|a| a.tier.supports_streams())
    }

    pub fn always_offload(&self) -> bool {
        self.config.always_offload
    }

    pub fn pin_host_memory(&self) -> bool {
        self.config.pin_host_memory
    }

    /// Soft empty-cache on every device.
    pub fn release_cached(&self) {
        for alloc in self.allocators.values() {
            alloc.release_cached();
        }
    }
}

fn resolve_initial_mode(config: &DeviceConfig, accelerator: Option<&DeviceInfo>) -> OperatingMode {
    let Some(accel) = accelerator else {
        return OperatingMode::Disabled;
    };
    if accel.tier.is_unified() {
        return OperatingMode::Shared;
    }
    match config.mode_override {
        Some(OperatingMode::Shared) | None => OperatingMode::NormalBudget,
        Some(mode) => mode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(config: DeviceConfig, tier: CapabilityTier) -> DeviceCatalog {
        DeviceCatalog::mock(&config, Some(8 * GIB), tier)
    }

    #[test]
    fn no_accelerator_means_disabled() {
        let c = DeviceCatalog::mock(&DeviceConfig::default(), None, CapabilityTier::Discrete);
        assert_eq!(c.current_mode(), OperatingMode::Disabled);
        assert_eq!(c.load_device(), DeviceId::Host);
        assert!(!c.supports_async_streams());
    }

    #[test]
    fn unified_memory_means_shared() {
        let c = catalog(DeviceConfig::default(), CapabilityTier::Unified);
        assert_eq!(c.current_mode(), OperatingMode::Shared);
    }

    #[test]
    fn override_sets_initial_mode() {
        let config = DeviceConfig {
            mode_override: Some(OperatingMode::LowBudget),
            ..Default::default()
        };
        let c = catalog(config, CapabilityTier::Discrete);
        assert_eq!(c.current_mode(), OperatingMode::LowBudget);
    }

    #[test]
    fn downgrade_is_idempotent_at_floor() {
        let mut c = catalog(DeviceConfig::default(), CapabilityTier::Discrete);
        assert_eq!(
            c.downgrade(),
            Some(ModeTransition { from: OperatingMode::NormalBudget, to: OperatingMode::LowBudget })
        );
        assert!(c.downgrade().is_some());
        assert_eq!(c.current_mode(), OperatingMode::NoBudget);
        assert_eq!(c.downgrade(), None);
        assert_eq!(c.current_mode(), OperatingMode::NoBudget);
    }

    #[test]
    fn budget_fraction_limits_free_memory() {
        let config = DeviceConfig {
            budget_fraction: 0.5,
            ..Default::default()
        };
        let c = catalog(config, CapabilityTier::Discrete);
        assert_eq!(c.free_memory(DeviceId::Accelerator(0)), 4 * GIB);
    }

    #[test]
    fn capability_tier_per_device() {
        let c = catalog(DeviceConfig::default(), CapabilityTier::DiscreteAsync);
        assert_eq!(c.capability_tier(DeviceId::Accelerator(0)), CapabilityTier::DiscreteAsync);
        assert_eq!(c.capability_tier(DeviceId::Host), CapabilityTier::HostOnly);
        assert!(c.supports_async_streams());
    }

    #[test]
    fn initial_placement_follows_mode() {
        let c = catalog(DeviceConfig::default(), CapabilityTier::Discrete);
        assert_eq!(c.initial_load_device(), DeviceId::Host);
        let c = catalog(DeviceConfig::default(), CapabilityTier::Unified);
        assert_eq!(c.initial_load_device(), DeviceId::Accelerator(0));
    }

    #[test]
    fn unknown_load_device_resolves_to_default() {
        let c = catalog(DeviceConfig::default(), CapabilityTier::Discrete);
        assert_eq!(c.resolve_load_device(DeviceId::Accelerator(3)), DeviceId::Accelerator(0));
    }
}
