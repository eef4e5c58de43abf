//! Loaded-model registry, ordered most recently used first.
//!
//! Eviction never fails: a buffer that cannot be moved off its device is
//! logged and left in place.

use std::collections::HashSet;

use serde::Serialize;

use super::handle::{ModelHandle, ModelId};
use super::record::{LoadedModel, ModelSnapshot};
use crate::device::{DeviceCatalog, DeviceId, OperatingMode};
use crate::error::OffloadError;

/// How much `evict_until` should free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionTarget {
    /// Stop once the device has more than this many free bytes
    Bytes(u64),
    /// Unload every evictable record on the device
    All,
}

/// Result of an eviction pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvictionReport {
    pub unloaded: Vec<String>,
    pub freed_bytes: u64,
}

impl EvictionReport {
    pub fn is_empty(&self) -> bool {
        self.unloaded.is_empty()
    }

    pub fn merge(&mut self, other: EvictionReport) {
        self.unloaded.extend(other.unloaded);
        self.freed_bytes += other.freed_bytes;
    }
}

/// Ordered list of loaded models; index 0 is the most recently used.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    entries: Vec<LoadedModel>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: ModelId) -> bool {
        self.position(id).is_some()
    }

    fn position(&self, id: ModelId) -> Option<usize> {
        self.entries.iter().position(|r| r.model_id() == id)
    }

    pub fn get(&self, id: ModelId) -> Option<&LoadedModel> {
        self.entries.iter().find(|r| r.model_id() == id)
    }

    pub fn get_mut(&mut self, id: ModelId) -> Option<&mut LoadedModel> {
        self.entries.iter_mut().find(|r| r.model_id() == id)
    }

    /// Records from most to least recently used.
    pub fn iter(&self) -> impl Iterator<Item = &LoadedModel> {
        self.entries.iter()
    }

    /// Find a record by identity and move it to the MRU position.
    pub fn lookup(&mut self, id: ModelId) -> Option<&LoadedModel> {
        let pos = self.position(id)?;
        let record = self.entries.remove(pos);
        self.entries.insert(0, record);
        self.entries.first()
    }

    /// Insert at the MRU position.
    pub fn insert(&mut self, record: LoadedModel) -> Result<(), OffloadError> {
        if self.contains(record.model_id()) {
            return Err(OffloadError::PlacementInconsistency(format!(
                "{} ({}) is already registered",
                record.name(),
                record.model_id()
            )));
        }
        self.entries.insert(0, record);
        Ok(())
    }

    /// Drop records nobody references any more. Weights stay where they
    /// are; they go away with the last owner.
    pub fn evict_unreferenced(&mut self, catalog: &DeviceCatalog) -> Vec<String> {
        let mut dropped = Vec::new();
        let mut i = self.entries.len();
        while i > 0 {
            i -= 1;
            if !self.entries[i].is_referenced() {
                let mut record = self.entries.remove(i);
                record.unload(catalog, false);
                dropped.push(record.name().to_string());
            }
        }
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "dropped unreferenced records");
        }
        dropped
    }

    /// Unload records on `device`, least recently used first, until the
    /// target is met. Records in `pinned` are never touched.
    pub fn evict_until(
        &mut self,
        catalog: &DeviceCatalog,
        device: DeviceId,
        target: EvictionTarget,
        pinned: &HashSet<ModelId>,
    ) -> EvictionReport {
        self.evict_unreferenced(catalog);

        let needed = match target {
            EvictionTarget::Bytes(bytes) => bytes,
            EvictionTarget::All => u64::MAX,
        };
        let offload_everything =
            catalog.always_offload() || catalog.current_mode() == OperatingMode::NoBudget;

        let mut report = EvictionReport::default();
        let mut i = self.entries.len();
        while i > 0 {
            i -= 1;
            if !offload_everything && catalog.free_memory(device) > needed {
                break;
            }
            let record = &self.entries[i];
            if record.device() != device || pinned.contains(&record.model_id()) {
                continue;
            }
            let mut record = self.entries.remove(i);
            report.freed_bytes += record.unload(catalog, true);
            tracing::info!(model = %record.name(), device = %device, "evicted model");
            report.unloaded.push(record.name().to_string());
        }

        if !report.is_empty() {
            catalog.release_cached();
        } else if catalog.current_mode() != OperatingMode::HighBudget
            && catalog.free_memory(device) > catalog.total_memory(device) / 4
        {
            catalog.release_cached();
        }

        tracing::debug!(
            device = %device,
            target = ?target,
            unloaded = report.unloaded.len(),
            freed = report.freed_bytes,
            free = catalog.free_memory(device),
            "eviction pass complete"
        );
        report
    }

    /// Unload everything on `device` except `pinned`.
    pub fn free_all(&mut self, catalog: &DeviceCatalog, device: DeviceId, pinned: &HashSet<ModelId>) -> EvictionReport {
        self.evict_until(catalog, device, EvictionTarget::All, pinned)
    }

    /// Remove records that are clones of `handle` without moving their
    /// weights; the caller's new record counts them instead.
    pub fn unload_clones(&mut self, catalog: &DeviceCatalog, handle: &ModelHandle) -> Vec<String> {
        let mut removed = Vec::new();
        let mut i = self.entries.len();
        while i > 0 {
            i -= 1;
            if self.entries[i].is_clone_of(handle) {
                let mut record = self.entries.remove(i);
                record.unload(catalog, false);
                removed.push(record.name().to_string());
            }
        }
        removed
    }

    /// Unload unreferenced records, moving their weights to the offload device.
    pub fn cleanup_unreferenced(&mut self, catalog: &DeviceCatalog) -> EvictionReport {
        let mut report = EvictionReport::default();
        let mut i = self.entries.len();
        while i > 0 {
            i -= 1;
            if !self.entries[i].is_referenced() {
                let mut record = self.entries.remove(i);
                report.freed_bytes += record.unload(catalog, true);
                report.unloaded.push(record.name().to_string());
            }
        }
        report
    }

    /// Forget every record without moving weights.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn snapshot(&self) -> Vec<ModelSnapshot> {
        self.entries.iter().map(LoadedModel::snapshot).collect()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
