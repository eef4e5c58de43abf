//! Loaded-model records kept by the registry.

use std::sync::Arc;

use serde::Serialize;

use super::handle::{ModelHandle, ModelId, SharedWeights, WeakModelHandle};
use crate::device::{DeviceCatalog, DeviceId};

/// Residency bookkeeping for one model identity.
#[derive(Debug)]
pub struct LoadedModel {
    handle: WeakModelHandle,
    model_id: ModelId,
    name: String,
    weights: Arc<SharedWeights>,
    device: DeviceId,
    offload_device: DeviceId,
    /// Bytes already on `device`
    pub inclusive_memory: u64,
    /// Bytes elsewhere
    pub exclusive_memory: u64,
    /// Set while modules are streamed from the offload device
    pub accelerated: bool,
    pub load_attempts: u32,
}

impl LoadedModel {
    pub fn new(handle: &ModelHandle, device: DeviceId) -> Self {
        Self {
            handle: handle.downgrade(),
            model_id: handle.id(),
            name: handle.name().to_string(),
            weights: Arc::clone(handle.weights()),
            device,
            offload_device: handle.offload_device(),
            inclusive_memory: 0,
            exclusive_memory: 0,
            accelerated: false,
            load_attempts: 0,
        }
    }

    pub fn model_id(&self) -> ModelId {
        self.model_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn offload_device(&self) -> DeviceId {
        self.offload_device
    }

    pub fn weights(&self) -> &Arc<SharedWeights> {
        &self.weights
    }

    pub fn handle(&self) -> Option<ModelHandle> {
        self.handle.upgrade()
    }

    pub fn is_referenced(&self) -> bool {
        self.handle.is_referenced()
    }

    /// Distinct identity over the same weight storage as `handle`.
    pub fn is_clone_of(&self, handle: &ModelHandle) -> bool {
        self.model_id != handle.id() && self.weights.id() == handle.weights_id()
    }

    pub fn compute_inclusive_exclusive_memory(&mut self) {
        let total = self.weights.total_bytes();
        self.inclusive_memory = self.weights.bytes_on(self.device);
        self.exclusive_memory = total - self.inclusive_memory;
    }

    /// Bytes this model currently holds on its target device.
    pub fn resident_bytes(&self) -> u64 {
        self.weights.bytes_on(self.device)
    }

    /// Restore manual-cast flags and, unless the weights are about to be
    /// re-counted by another record, move everything to the offload device.
    /// Returns the bytes freed on the target device.
    pub fn unload(&mut self, catalog: &DeviceCatalog, move_weights: bool) -> u64 {
        let before = self.resident_bytes();
        let pinned = catalog.is_host(self.offload_device) && catalog.pin_host_memory();
        {
            let mut modules = self.weights.lock();
            for module in modules.iter_mut() {
                if self.accelerated {
                    module.restore_manual_cast();
                }
                if move_weights {
                    module.release_all(catalog, self.offload_device, pinned);
                }
            }
        }
        self.accelerated = false;
        self.compute_inclusive_exclusive_memory();
        tracing::debug!(
            model = %self.name,
            device = %self.device,
            moved = move_weights,
            freed = before.saturating_sub(self.inclusive_memory),
            "model unloaded"
        );
        before.saturating_sub(self.inclusive_memory)
    }

    /// Every buffer's allocation lives where the buffer says it does.
    pub fn verify_residency(&self) -> bool {
        self.weights.lock().iter().all(|m| m.verify())
    }

    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            id: self.model_id,
            name: self.name.clone(),
            device: self.device,
            inclusive_memory: self.inclusive_memory,
            exclusive_memory: self.exclusive_memory,
            accelerated: self.accelerated,
            referenced: self.is_referenced(),
            load_attempts: self.load_attempts,
        }
    }
}

/// Serializable view of one registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSnapshot {
    pub id: ModelId,
    pub name: String,
    pub device: DeviceId,
    pub inclusive_memory: u64,
    pub exclusive_memory: u64,
    pub accelerated: bool,
    pub referenced: bool,
    pub load_attempts: u32,
}
