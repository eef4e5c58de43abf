//! Weight modules and the buffers they own.
//!
//! A buffer always holds a live allocation on the device it claims to be on,
//! so byte accounting on every allocator equals the sum of resident buffers.

use serde::{Deserialize, Serialize};

use crate::device::{allocate_on, DType, DeviceAllocation, DeviceCatalog, DeviceError, DeviceId};

/// Whether a module takes part in partial offload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    /// Placed on the accelerator unconditionally
    Legacy,
    /// May be split between accelerator and host
    Offloadable,
}

impl Default for ModuleKind {
    fn default() -> Self {
        Self::Offloadable
    }
}

/// Declarative description of a module, materialized when a model is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub name: String,
    #[serde(default)]
    pub kind: ModuleKind,
    /// Logical elements in the core weight tensor
    pub weight_elements: u64,
    /// Logical elements in bias and side buffers
    #[serde(default)]
    pub extra_elements: u64,
    /// Storage type override; the model dtype otherwise
    #[serde(default)]
    pub dtype: Option<DType>,
}

impl ModuleSpec {
    pub fn offloadable(name: impl Into<String>, weight_elements: u64, extra_elements: u64) -> Self {
        Self {
            name: name.into(),
            kind: ModuleKind::Offloadable,
            weight_elements,
            extra_elements,
            dtype: None,
        }
    }

    pub fn legacy(name: impl Into<String>, weight_elements: u64, extra_elements: u64) -> Self {
        Self {
            kind: ModuleKind::Legacy,
            ..Self::offloadable(name, weight_elements, extra_elements)
        }
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }
}

/// One tensor and the device allocation backing it.
#[derive(Debug)]
pub struct WeightBuffer {
    name: String,
    elements: u64,
    dtype: DType,
    location: DeviceId,
    allocation: DeviceAllocation,
}

impl WeightBuffer {
    pub(crate) fn allocate(
        catalog: &DeviceCatalog,
        name: String,
        elements: u64,
        dtype: DType,
        device: DeviceId,
        pinned: bool,
    ) -> Result<Self, DeviceError> {
        let allocator = catalog.allocator(device)?;
        let allocation = allocate_on(allocator, dtype.storage_bytes(elements), pinned)?;
        Ok(Self {
            name,
            elements,
            dtype,
            location: device,
            allocation,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn elements(&self) -> u64 {
        self.elements
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn bytes(&self) -> u64 {
        self.dtype.storage_bytes(self.elements)
    }

    pub fn location(&self) -> DeviceId {
        self.location
    }

    pub fn is_pinned(&self) -> bool {
        self.allocation.is_pinned()
    }

    /// Move to `device`. The destination is allocated before the source is
    /// released, so a failed move leaves the buffer where it was.
    pub fn move_to(&mut self, catalog: &DeviceCatalog, device: DeviceId, pinned: bool) -> Result<(), DeviceError> {
        if self.location == device && self.allocation.is_pinned() == pinned {
            return Ok(());
        }
        let allocator = catalog.allocator(device)?;
        let allocation = allocate_on(allocator, self.bytes(), pinned)?;
        // Old allocation is returned to its device on drop.
        self.allocation = allocation;
        self.location = device;
        Ok(())
    }

    /// Best-effort move used by eviction, which never fails.
    pub fn release_to(&mut self, catalog: &DeviceCatalog, device: DeviceId, pinned: bool) {
        if let Err(e) = self.move_to(catalog, device, pinned) {
            tracing::warn!(buffer = %self.name, from = %self.location, to = %device, error = %e, "buffer release failed");
        }
    }

    /// Location and allocation agree.
    pub fn verify(&self) -> bool {
        self.allocation.device() == self.location && self.allocation.size() == self.bytes()
    }
}

/// A named unit of weight parameters.
#[derive(Debug)]
pub struct WeightModule {
    name: String,
    kind: ModuleKind,
    weight: WeightBuffer,
    extras: Vec<WeightBuffer>,
    manual_cast: bool,
    saved_manual_cast: Option<bool>,
}

impl WeightModule {
    pub(crate) fn materialize(
        catalog: &DeviceCatalog,
        spec: &ModuleSpec,
        model_dtype: DType,
        device: DeviceId,
        pinned: bool,
    ) -> Result<Self, DeviceError> {
        let dtype = spec.dtype.unwrap_or(model_dtype);
        let weight = WeightBuffer::allocate(
            catalog,
            format!("{}.weight", spec.name),
            spec.weight_elements,
            dtype,
            device,
            pinned,
        )?;
        let mut extras = Vec::new();
        if spec.extra_elements > 0 {
            // Side buffers keep full precision even for packed weights.
            let extra_dtype = if dtype.is_quantized() { DType::F16 } else { dtype };
            extras.push(WeightBuffer::allocate(
                catalog,
                format!("{}.bias", spec.name),
                spec.extra_elements,
                extra_dtype,
                device,
                pinned,
            )?);
        }
        Ok(Self {
            name: spec.name.clone(),
            kind: spec.kind,
            weight,
            extras,
            manual_cast: false,
            saved_manual_cast: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    pub fn weight(&self) -> &WeightBuffer {
        &self.weight
    }

    pub fn extras(&self) -> &[WeightBuffer] {
        &self.extras
    }

    pub fn buffers(&self) -> impl Iterator<Item = &WeightBuffer> {
        std::iter::once(&self.weight).chain(self.extras.iter())
    }

    pub fn weight_bytes(&self) -> u64 {
        self.weight.bytes()
    }

    pub fn extra_bytes(&self) -> u64 {
        self.extras.iter().map(WeightBuffer::bytes).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.weight_bytes() + self.extra_bytes()
    }

    pub fn bytes_on(&self, device: DeviceId) -> u64 {
        self.buffers().filter(|b| b.location() == device).map(WeightBuffer::bytes).sum()
    }

    pub fn manual_cast(&self) -> bool {
        self.manual_cast
    }

    pub fn set_manual_cast(&mut self, enabled: bool) {
        self.manual_cast = enabled;
    }

    /// Turn manual casting on for an offload placement, remembering the
    /// previous value so unload can put it back.
    pub fn enable_manual_cast(&mut self) {
        if self.saved_manual_cast.is_none() {
            self.saved_manual_cast = Some(self.manual_cast);
        }
        self.manual_cast = true;
    }

    pub fn restore_manual_cast(&mut self) {
        if let Some(prev) = self.saved_manual_cast.take() {
            self.manual_cast = prev;
        }
    }

    pub fn move_all(&mut self, catalog: &DeviceCatalog, device: DeviceId, pinned: bool) -> Result<(), DeviceError> {
        self.weight.move_to(catalog, device, pinned)?;
        self.move_extras(catalog, device, pinned)
    }

    pub fn move_extras(&mut self, catalog: &DeviceCatalog, device: DeviceId, pinned: bool) -> Result<(), DeviceError> {
        for extra in &mut self.extras {
            extra.move_to(catalog, device, pinned)?;
        }
        Ok(())
    }

    pub fn move_weight(&mut self, catalog: &DeviceCatalog, device: DeviceId, pinned: bool) -> Result<(), DeviceError> {
        self.weight.move_to(catalog, device, pinned)
    }

    pub fn release_all(&mut self, catalog: &DeviceCatalog, device: DeviceId, pinned: bool) {
        self.weight.release_to(catalog, device, pinned);
        for extra in &mut self.extras {
            extra.release_to(catalog, device, pinned);
        }
    }

    pub fn verify(&self) -> bool {
        self.buffers().all(WeightBuffer::verify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CapabilityTier, DeviceConfig, GIB};

    const ACCEL: DeviceId = DeviceId::Accelerator(0);

    fn catalog() -> DeviceCatalog {
        DeviceCatalog::mock(&DeviceConfig::default(), Some(GIB), CapabilityTier::Discrete)
    }

    #[test]
    fn split_sizes_follow_dtype() {
        let c = catalog();
        let spec = ModuleSpec::offloadable("blk", 1000, 10);
        let m = WeightModule::materialize(&c, &spec, DType::F16, DeviceId::Host, false).unwrap();
        assert_eq!(m.weight_bytes(), 2000);
        assert_eq!(m.extra_bytes(), 20);
        assert_eq!(m.bytes_on(DeviceId::Host), 2020);
    }

    #[test]
    fn packed_weights_keep_f16_bias() {
        let c = catalog();
        let spec = ModuleSpec::offloadable("q", 1000, 10).with_dtype(DType::Nf4);
        let m = WeightModule::materialize(&c, &spec, DType::F16, DeviceId::Host, false).unwrap();
        assert_eq!(m.weight_bytes(), 550);
        assert_eq!(m.extra_bytes(), 20);
    }

    #[test]
    fn move_updates_both_allocators() {
        let c = catalog();
        let spec = ModuleSpec::offloadable("blk", 1000, 10);
        let mut m = WeightModule::materialize(&c, &spec, DType::F16, DeviceId::Host, false).unwrap();
        m.move_extras(&c, ACCEL, false).unwrap();
        assert_eq!(c.allocated_bytes(ACCEL), 20);
        assert_eq!(c.allocated_bytes(DeviceId::Host), 2000);
        m.move_all(&c, ACCEL, false).unwrap();
        assert_eq!(c.allocated_bytes(ACCEL), 2020);
        assert_eq!(c.allocated_bytes(DeviceId::Host), 0);
        assert!(m.verify());
    }

    #[test]
    fn failed_move_leaves_buffer_in_place() {
        let c = catalog();
        let spec = ModuleSpec::offloadable("huge", GIB, 0);
        let mut m = WeightModule::materialize(&c, &spec, DType::F16, DeviceId::Host, false).unwrap();
        let err = m.move_all(&c, ACCEL, false).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(m.weight().location(), DeviceId::Host);
        assert_eq!(c.allocated_bytes(ACCEL), 0);
    }

    #[test]
    fn manual_cast_round_trips_through_save() {
        let c = catalog();
        let spec = ModuleSpec::offloadable("blk", 10, 0);
        let mut m = WeightModule::materialize(&c, &spec, DType::F16, DeviceId::Host, false).unwrap();
        m.enable_manual_cast();
        m.enable_manual_cast();
        assert!(m.manual_cast());
        m.restore_manual_cast();
        assert!(!m.manual_cast());
    }
}
