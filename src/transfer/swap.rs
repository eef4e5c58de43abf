//! Location-aware access to a model's modules.
//!
//! Offloaded modules live on the host; compute needs them on the load
//! device. A `SwapAccessor` resolves that at read time instead of patching
//! the module.

use std::sync::Arc;

use super::engine::{CastBuffers, TransferEngine, TransferError};
use crate::device::{DType, DeviceCatalog, DeviceId};
use crate::models::{ModelHandle, SharedWeights};

#[derive(Clone)]
pub struct SwapAccessor {
    weights: Arc<SharedWeights>,
    target: DeviceId,
    dtype: DType,
}

impl SwapAccessor {
    pub fn new(weights: Arc<SharedWeights>, target: DeviceId, dtype: DType) -> Self {
        Self { weights, target, dtype }
    }

    /// Accessor reading `handle`'s modules on its load device.
    pub fn for_model(handle: &ModelHandle) -> Self {
        Self::new(Arc::clone(handle.weights()), handle.load_device(), handle.dtype())
    }

    pub fn target(&self) -> DeviceId {
        self.target
    }

    /// Devices currently holding any of `module`'s buffers.
    pub fn locations(&self, module: &str) -> Option<Vec<DeviceId>> {
        let modules = self.weights.lock();
        let m = modules.iter().find(|m| m.name() == module)?;
        let mut devices: Vec<_> = m.buffers().map(|b| b.location()).collect();
        devices.sort();
        devices.dedup();
        Some(devices)
    }

    /// Every buffer of `module` already sits on the target device.
    pub fn is_resident(&self, module: &str) -> bool {
        self.locations(module).is_some_and(|d| d == [self.target])
    }

    /// Run `f` over `module`'s buffers as seen on the target device.
    pub fn read<R>(
        &self,
        engine: &mut TransferEngine,
        catalog: &DeviceCatalog,
        module: &str,
        f: impl FnOnce(&CastBuffers) -> R,
    ) -> Result<R, TransferError> {
        engine.consume(catalog, &self.weights, module, self.target, self.dtype, f)
    }
}
