// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Device identity and capability tiers.

use std::fmt;

use serde::{Deserialize, Serialize, Serializer};

/// A memory space that can hold weight buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceId {
    /// Host (system) memory
    Host,
    /// Accelerator with its own memory, by index
    Accelerator(u32),
}

impl DeviceId {
    pub fn is_host(&self) -> bool {
        matches!(self, DeviceId::Host)
    }

    pub fn accelerator_index(&self) -> Option<u32> {
        match self {
            DeviceId::Accelerator(idx) => Some(*idx),
            DeviceId::Host => None,
        }
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::Host
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Host => write!(f, "cpu"),
            DeviceId::Accelerator(idx) => write!(f, "accel:{idx}"),
        }
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// What a device can do, as far as placement is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityTier {
    /// Plain host memory, no accelerator
    HostOnly,
    /// Accelerator sharing one memory pool with the host
    Unified,
    /// Discrete accelerator, transfers block the compute stream
    Discrete,
    /// Discrete accelerator with an independent copy stream
    DiscreteAsync,
}

impl CapabilityTier {
    /// Whether transfers can run on a stream separate from compute.
    pub fn supports_streams(&self) -> bool {
        matches!(self, CapabilityTier::DiscreteAsync)
    }

    pub fn is_unified(&self) -> bool {
        matches!(self, CapabilityTier::Unified)
    }
}

impl fmt::Display for CapabilityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CapabilityTier::HostOnly => "host-only",
            CapabilityTier::Unified => "unified",
            CapabilityTier::Discrete => "discrete",
            CapabilityTier::DiscreteAsync => "discrete-async",
        };
        f.write_str(name)
    }
}

/// Static description of a detected device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub tier: CapabilityTier,
    /// Physical capacity in bytes, before any budget fraction is applied
    pub total_memory: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names() {
        assert_eq!(DeviceId::Host.to_string(), "cpu");
        assert_eq!(DeviceId::Accelerator(1).to_string(), "accel:1");
    }

    #[test]
    fn only_async_tier_supports_streams() {
        assert!(CapabilityTier::DiscreteAsync.supports_streams());
        assert!(!CapabilityTier::Discrete.supports_streams());
        assert!(!CapabilityTier::Unified.supports_streams());
        assert!(!CapabilityTier::HostOnly.supports_streams());
    }

    #[test]
    fn device_id_serializes_as_string() {
        let json = serde_json::to_string(&DeviceId::Accelerator(0)).unwrap();
        assert_eq!(json, "\"accel:0\"");
    }
}
