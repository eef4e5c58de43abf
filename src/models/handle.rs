//! Model handles, weight sharing and identity.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use super::module::{ModuleSpec, WeightModule};
use crate::device::{DType, DeviceCatalog, DeviceError, DeviceId};

static NEXT_MODEL_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_WEIGHTS_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a model handle. Clones made with `share_weights` get a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ModelId(u64);

impl ModelId {
    fn next() -> Self {
        Self(NEXT_MODEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "model#{}", self.0)
    }
}

/// Identity of a weight storage, shared between clones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WeightsId(u64);

impl WeightsId {
    fn next() -> Self {
        Self(NEXT_WEIGHTS_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Estimates activation memory for an input shape.
pub type MemoryEstimator = Arc<dyn Fn(&[usize]) -> u64 + Send + Sync>;

/// Weight storage shared by a model and its clones.
pub struct SharedWeights {
    id: WeightsId,
    modules: Mutex<Vec<WeightModule>>,
}

impl SharedWeights {
    fn new(modules: Vec<WeightModule>) -> Self {
        Self {
            id: WeightsId::next(),
            modules: Mutex::new(modules),
        }
    }

    pub fn id(&self) -> WeightsId {
        self.id
    }

    /// Lock the module list. Not re-entrant; do not call other
    /// `SharedWeights` methods while holding the guard.
    pub fn lock(&self) -> MutexGuard<'_, Vec<WeightModule>> {
        self.modules.lock()
    }

    pub fn total_bytes(&self) -> u64 {
        self.modules.lock().iter().map(WeightModule::total_bytes).sum()
    }

    pub fn bytes_on(&self, device: DeviceId) -> u64 {
        self.modules.lock().iter().map(|m| m.bytes_on(device)).sum()
    }

    pub fn module_count(&self) -> usize {
        self.modules.lock().len()
    }
}

impl fmt::Debug for SharedWeights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedWeights")
            .field("id", &self.id)
            .field("modules", &self.module_count())
            .finish()
    }
}

struct HandleInner {
    id: ModelId,
    name: String,
    load_device: DeviceId,
    offload_device: DeviceId,
    dtype: DType,
    weights: Arc<SharedWeights>,
    estimator: Option<MemoryEstimator>,
}

/// Opaque reference to a model, compared by identity.
#[derive(Clone)]
pub struct ModelHandle {
    inner: Arc<HandleInner>,
}

impl ModelHandle {
    pub fn builder(name: impl Into<String>) -> ModelBuilder {
        ModelBuilder::new(name)
    }

    pub fn id(&self) -> ModelId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn load_device(&self) -> DeviceId {
        self.inner.load_device
    }

    pub fn offload_device(&self) -> DeviceId {
        self.inner.offload_device
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn weights(&self) -> &Arc<SharedWeights> {
        &self.inner.weights
    }

    pub fn weights_id(&self) -> WeightsId {
        self.inner.weights.id()
    }

    /// New identity over the same weight storage.
    pub fn share_weights(&self, name: impl Into<String>) -> ModelHandle {
        ModelHandle {
            inner: Arc::new(HandleInner {
                id: ModelId::next(),
                name: name.into(),
                load_device: self.inner.load_device,
                offload_device: self.inner.offload_device,
                dtype: self.inner.dtype,
                weights: Arc::clone(&self.inner.weights),
                estimator: self.inner.estimator.clone(),
            }),
        }
    }

    /// Distinct identity sharing weight storage with `other`.
    pub fn is_clone_of(&self, other: &ModelHandle) -> bool {
        self.id() != other.id() && self.weights_id() == other.weights_id()
    }

    /// Strong references to this identity, including this one.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn downgrade(&self) -> WeakModelHandle {
        WeakModelHandle {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Activation memory needed for an input of `shape`; zero without an estimator.
    pub fn memory_required(&self, shape: &[usize]) -> u64 {
        self.inner.estimator.as_ref().map_or(0, |f| f(shape))
    }

    /// Toggle manual casting on every module.
    pub fn shift_manual_cast(&self, enabled: bool) {
        for module in self.inner.weights.lock().iter_mut() {
            module.set_manual_cast(enabled);
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.weights.total_bytes()
    }

    pub fn bytes_on(&self, device: DeviceId) -> u64 {
        self.inner.weights.bytes_on(device)
    }
}

impl PartialEq for ModelHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for ModelHandle {}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("weights", &self.inner.weights.id())
            .finish()
    }
}

/// Non-owning reference held by the registry.
#[derive(Clone)]
pub struct WeakModelHandle {
    id: ModelId,
    inner: Weak<HandleInner>,
}

impl WeakModelHandle {
    pub fn id(&self) -> ModelId {
        self.id
    }

    pub fn upgrade(&self) -> Option<ModelHandle> {
        self.inner.upgrade().map(|inner| ModelHandle { inner })
    }

    pub fn is_referenced(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl fmt::Debug for WeakModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakModelHandle({})", self.id)
    }
}

/// Builder for `ModelHandle`. Materializes every module on `build`.
pub struct ModelBuilder {
    name: String,
    load_device: Option<DeviceId>,
    offload_device: Option<DeviceId>,
    initial_device: Option<DeviceId>,
    dtype: DType,
    modules: Vec<ModuleSpec>,
    estimator: Option<MemoryEstimator>,
}

impl ModelBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            load_device: None,
            offload_device: None,
            initial_device: None,
            dtype: DType::default(),
            modules: Vec::new(),
            estimator: None,
        }
    }

    pub fn load_device(mut self, device: DeviceId) -> Self {
        self.load_device = Some(device);
        self
    }

    pub fn offload_device(mut self, device: DeviceId) -> Self {
        self.offload_device = Some(device);
        self
    }

    /// Where the weights start out. Defaults to the catalog's choice.
    pub fn initial_device(mut self, device: DeviceId) -> Self {
        self.initial_device = Some(device);
        self
    }

    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn module(mut self, spec: ModuleSpec) -> Self {
        self.modules.push(spec);
        self
    }

    pub fn modules(mut self, specs: impl IntoIterator<Item = ModuleSpec>) -> Self {
        self.modules.extend(specs);
        self
    }

    pub fn estimator<F>(mut self, f: F) -> Self
    where
        F: Fn(&[usize]) -> u64 + Send + Sync + 'static,
    {
        self.estimator = Some(Arc::new(f));
        self
    }

    pub fn build(self, catalog: &DeviceCatalog) -> Result<ModelHandle, DeviceError> {
        let load_device = catalog.resolve_load_device(self.load_device.unwrap_or_else(|| catalog.load_device()));
        let offload_device = self.offload_device.unwrap_or_else(|| catalog.offload_device());
        let initial = self.initial_device.unwrap_or_else(|| catalog.initial_load_device());
        let pinned = catalog.is_host(initial) && catalog.pin_host_memory();

        let modules = self
            .modules
            .iter()
            .map(|spec| WeightModule::materialize(catalog, spec, self.dtype, initial, pinned))
            .collect::<Result<Vec<_>, _>>()?;

        let handle = ModelHandle {
            inner: Arc::new(HandleInner {
                id: ModelId::next(),
                name: self.name,
                load_device,
                offload_device,
                dtype: self.dtype,
                weights: Arc::new(SharedWeights::new(modules)),
                estimator: self.estimator,
            }),
        };
        tracing::debug!(
            model = %handle.name(),
            id = %handle.id(),
            device = %initial,
            bytes = handle.total_bytes(),
            "model constructed"
        );
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CapabilityTier, DeviceConfig, GIB, MIB};

    fn catalog() -> DeviceCatalog {
        DeviceCatalog::mock(&DeviceConfig::default(), Some(4 * GIB), CapabilityTier::Discrete)
    }

    fn model(c: &DeviceCatalog) -> ModelHandle {
        ModelHandle::builder("unet")
            .module(ModuleSpec::offloadable("a", MIB, 1024))
            .module(ModuleSpec::legacy("b", MIB, 0))
            .estimator(|shape| shape.iter().product::<usize>() as u64)
            .build(c)
            .unwrap()
    }

    #[test]
    fn builds_on_host_in_normal_mode() {
        let c = catalog();
        let m = model(&c);
        assert_eq!(m.load_device(), DeviceId::Accelerator(0));
        assert_eq!(m.bytes_on(DeviceId::Host), m.total_bytes());
        assert_eq!(m.total_bytes(), 2 * 2 * MIB + 2048);
    }

    #[test]
    fn clones_share_weights_not_identity() {
        let c = catalog();
        let m = model(&c);
        let clone = m.share_weights("unet-clone");
        assert!(clone.is_clone_of(&m));
        assert!(!m.is_clone_of(&m));
        assert_ne!(m, clone);
        assert_eq!(m.weights_id(), clone.weights_id());
        assert_eq!(c.allocated_bytes(DeviceId::Host), m.total_bytes());
    }

    #[test]
    fn weak_handle_tracks_liveness() {
        let c = catalog();
        let m = model(&c);
        let weak = m.downgrade();
        assert!(weak.is_referenced());
        assert_eq!(m.ref_count(), 1);
        drop(m);
        assert!(!weak.is_referenced());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn estimator_drives_memory_required() {
        let c = catalog();
        let m = model(&c);
        assert_eq!(m.memory_required(&[2, 3, 4]), 24);
    }

    #[test]
    fn shift_manual_cast_toggles_every_module() {
        let c = catalog();
        let m = model(&c);
        m.shift_manual_cast(true);
        assert!(m.weights().lock().iter().all(|m| m.manual_cast()));
        m.shift_manual_cast(false);
        assert!(m.weights().lock().iter().all(|m| !m.manual_cast()));
    }
}
