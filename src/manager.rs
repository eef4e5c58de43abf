//! The offload manager: owns the catalog, registry and transfer engine and
//! turns load requests into placements.
//!
//! Not thread-safe on its own; `OffloadService` runs it on the task queue's
//! worker thread.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::OffloadConfig;
use crate::device::{CapabilityTier, DeviceCatalog, DeviceId, ModeTransition, OperatingMode};
use crate::error::OffloadError;
use crate::models::{
    EvictionReport, EvictionTarget, LoadedModel, ModelBuilder, ModelHandle, ModelId, ModelRegistry, ModelSnapshot,
    SharedWeights,
};
use crate::placement::{
    build_module_profile, ModuleCost, ModulePlacement, OomRecovery, PlacementClass, PlacementDecision, PlannerConfig,
    Reservations,
};
use crate::telemetry;
use crate::transfer::{CastBuffers, SwapAccessor, TransferEngine};

/// How a requested model ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Residency {
    /// Already registered; only moved to the front
    AlreadyLoaded,
    /// Every module on the load device
    Full,
    /// Some modules streamed from the offload device
    Partial,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelLoadOutcome {
    pub id: ModelId,
    pub model: String,
    pub device: DeviceId,
    pub residency: Residency,
    pub decision: Option<PlacementDecision>,
    pub resident_modules: usize,
    pub extras_only_modules: usize,
    pub host_modules: usize,
    pub accelerator_bytes: u64,
    pub swap_bytes: u64,
    pub load_attempts: u32,
}

impl ModelLoadOutcome {
    fn already_loaded(record: &LoadedModel) -> Self {
        Self {
            id: record.model_id(),
            model: record.name().to_string(),
            device: record.device(),
            residency: Residency::AlreadyLoaded,
            decision: None,
            resident_modules: 0,
            extras_only_modules: 0,
            host_modules: 0,
            accelerator_bytes: record.inclusive_memory,
            swap_bytes: record.exclusive_memory,
            load_attempts: record.load_attempts,
        }
    }

    fn placed(record: &LoadedModel, decision: PlacementDecision, placement: &ModulePlacement) -> Self {
        Self {
            id: record.model_id(),
            model: record.name().to_string(),
            device: record.device(),
            residency: if placement.is_partial() { Residency::Partial } else { Residency::Full },
            decision: Some(decision),
            resident_modules: placement.accelerator_resident.len(),
            extras_only_modules: placement.accelerator_resident_extras_only.len(),
            host_modules: placement.host_resident.len(),
            accelerator_bytes: record.inclusive_memory,
            swap_bytes: record.exclusive_memory,
            load_attempts: record.load_attempts,
        }
    }
}

/// Result of one `load` call.
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    /// Every requested model was already loaded
    pub fast_path: bool,
    pub models: Vec<ModelLoadOutcome>,
    pub evicted: EvictionReport,
    pub unloaded_clones: Vec<String>,
    pub downgrades: Vec<ModeTransition>,
    /// Operating mode after the call
    pub mode: OperatingMode,
    pub elapsed: Duration,
}

impl LoadReport {
    fn new(mode: OperatingMode) -> Self {
        Self {
            fast_path: false,
            models: Vec::new(),
            evicted: EvictionReport::default(),
            unloaded_clones: Vec::new(),
            downgrades: Vec::new(),
            mode,
            elapsed: Duration::ZERO,
        }
    }

    pub fn outcome(&self, id: ModelId) -> Option<&ModelLoadOutcome> {
        self.models.iter().find(|m| m.id == id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub id: DeviceId,
    pub name: String,
    pub tier: CapabilityTier,
    pub total_bytes: u64,
    pub allocated_bytes: u64,
    pub free_bytes: u64,
}

/// Point-in-time view of the manager.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub mode: OperatingMode,
    pub devices: Vec<DeviceStatus>,
    pub models: Vec<ModelSnapshot>,
    pub pending_transfers: usize,
    pub cast_cache_entries: usize,
    pub cast_cache_hits: u64,
    pub cast_cache_misses: u64,
    pub downgrades: usize,
}

pub struct OffloadManager {
    catalog: DeviceCatalog,
    registry: ModelRegistry,
    transfer: TransferEngine,
    recovery: OomRecovery,
    planner: PlannerConfig,
}

impl OffloadManager {
    pub fn new(catalog: DeviceCatalog, planner: PlannerConfig, transfer: TransferEngine) -> Self {
        Self {
            catalog,
            registry: ModelRegistry::new(),
            transfer,
            recovery: OomRecovery::new(),
            planner,
        }
    }

    /// Manager over `catalog` with planner and transfer settings from `config`.
    pub fn from_config(config: &OffloadConfig, catalog: DeviceCatalog) -> Self {
        let transfer = TransferEngine::for_catalog(&config.transfer, &catalog);
        Self::new(catalog, config.planner.clone(), transfer)
    }

    pub fn catalog(&self) -> &DeviceCatalog {
        &self.catalog
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn transfer(&self) -> &TransferEngine {
        &self.transfer
    }

    pub fn recovery(&self) -> &OomRecovery {
        &self.recovery
    }

    pub fn planner(&self) -> &PlannerConfig {
        &self.planner
    }

    pub fn current_mode(&self) -> OperatingMode {
        self.catalog.current_mode()
    }

    /// Materialize a model against this manager's devices.
    pub fn build_model(&self, builder: ModelBuilder) -> Result<ModelHandle, OffloadError> {
        Ok(builder.build(&self.catalog)?)
    }

    /// Make every model in `models` usable on its load device, evicting and
    /// partially offloading as needed.
    ///
    /// `memory_required` is the activation memory the caller expects to need
    /// and `reservation` extra bytes to keep free on top of it.
    pub fn load(
        &mut self,
        models: &[ModelHandle],
        memory_required: u64,
        reservation: u64,
    ) -> Result<LoadReport, OffloadError> {
        let started = Instant::now();
        let downgrades_before = self.recovery.downgrade_count();
        let reservations = self.planner.reservations(memory_required, reservation);
        let mut report = LoadReport::new(self.catalog.current_mode());

        let mut seen = HashSet::new();
        let mut already_loaded = Vec::new();
        let mut to_load = Vec::new();
        for handle in models {
            if !seen.insert(handle.id()) {
                continue;
            }
            match self.registry.lookup(handle.id()) {
                Some(record) => already_loaded.push(ModelLoadOutcome::already_loaded(record)),
                None => to_load.push(handle),
            }
        }
        let pinned: HashSet<ModelId> = already_loaded.iter().map(|o| o.id).collect();

        // Transient copies must go before free memory is measured.
        self.transfer.cleanup_cache();

        if to_load.is_empty() {
            let devices: HashSet<DeviceId> = already_loaded
                .iter()
                .map(|o| o.device)
                .filter(|d| !self.catalog.is_host(*d))
                .collect();
            for device in devices {
                let evicted = self.registry.evict_until(
                    &self.catalog,
                    device,
                    EvictionTarget::Bytes(reservations.eviction),
                    &pinned,
                );
                telemetry::record_eviction(device, evicted.unloaded.len(), evicted.freed_bytes);
                report.evicted.merge(evicted);
            }
            report.fast_path = true;
            report.models = already_loaded;
            return Ok(self.finish(report, started, downgrades_before));
        }

        for handle in &to_load {
            let removed = self.registry.unload_clones(&self.catalog, handle);
            report.unloaded_clones.extend(removed);
        }

        let mut records: Vec<LoadedModel> = to_load
            .iter()
            .map(|handle| {
                let device = self.catalog.resolve_load_device(handle.load_device());
                let mut record = LoadedModel::new(handle, device);
                record.compute_inclusive_exclusive_memory();
                record
            })
            .collect();

        let mut required: BTreeMap<DeviceId, u64> = BTreeMap::new();
        for record in &records {
            if !self.catalog.is_host(record.device()) {
                *required.entry(record.device()).or_default() +=
                    self.planner.load_requirement(record.exclusive_memory, record.inclusive_memory);
            }
        }
        for (device, bytes) in required {
            let target = self.planner.eviction_target(bytes, &reservations);
            let evicted = self
                .registry
                .evict_until(&self.catalog, device, EvictionTarget::Bytes(target), &pinned);
            telemetry::record_eviction(device, evicted.unloaded.len(), evicted.freed_bytes);
            report.evicted.merge(evicted);
        }

        report.models = already_loaded;
        for mut record in records.drain(..) {
            record.load_attempts += 1;
            match self.place_model(&mut record, &reservations) {
                Ok((decision, placement)) => {
                    record.compute_inclusive_exclusive_memory();
                    report.models.push(ModelLoadOutcome::placed(&record, decision, &placement));
                    self.registry.insert(record)?;
                }
                Err(e) => {
                    self.transfer.clear_cast_cache();
                    telemetry::record_load("failed", started.elapsed());
                    return Err(e);
                }
            }
        }
        self.transfer.clear_cast_cache();

        Ok(self.finish(report, started, downgrades_before))
    }

    fn finish(&self, mut report: LoadReport, started: Instant, downgrades_before: usize) -> LoadReport {
        report.elapsed = started.elapsed();
        report.mode = self.catalog.current_mode();
        report.downgrades = self.recovery.history()[downgrades_before..]
            .iter()
            .map(|(t, _)| *t)
            .collect();
        for device in self.catalog.devices() {
            telemetry::record_device_bytes(device.id, self.catalog.allocated_bytes(device.id));
        }
        telemetry::record_load(if report.fast_path { "fast_path" } else { "loaded" }, report.elapsed);
        if report.elapsed > Duration::from_millis(100) {
            tracing::info!(elapsed_ms = report.elapsed.as_millis() as u64, "model load finished");
        }
        report
    }

    /// Decide and apply a placement for one record. On failure the record's
    /// weights go back to the offload device and an OOM lowers the mode.
    fn place_model(
        &mut self,
        record: &mut LoadedModel,
        reservations: &Reservations,
    ) -> Result<(PlacementDecision, ModulePlacement), OffloadError> {
        let device = record.device();
        let costs: Vec<ModuleCost> = record.weights().lock().iter().map(ModuleCost::of).collect();

        let decision = if self.catalog.is_host(device) {
            PlacementDecision::Full
        } else {
            self.planner.decide(
                self.catalog.current_mode(),
                self.catalog.free_memory(device),
                record.exclusive_memory,
                record.inclusive_memory,
                reservations,
            )
        };
        let placement = match decision {
            PlacementDecision::Full => ModulePlacement::full(&costs),
            PlacementDecision::Partial { budget } => build_module_profile(&costs, budget),
        };
        placement.validate(&costs)?;

        tracing::info!(
            model = %record.name(),
            device = %device,
            mode = %self.catalog.current_mode(),
            free = self.catalog.free_memory(device),
            require = record.exclusive_memory,
            previously_loaded = record.inclusive_memory,
            decision = ?decision,
            "placing model"
        );

        record.accelerated = placement.is_partial();
        let offload = record.offload_device();
        let pin = self.catalog.pin_host_memory() && self.catalog.is_host(offload);
        if let Err(e) = apply_placement(&self.catalog, record.weights(), &placement, device, offload, pin) {
            record.unload(&self.catalog, true);
            if e.is_out_of_memory() {
                tracing::warn!(model = %record.name(), error = %e, "out of memory during placement");
                self.recovery.on_out_of_memory(&mut self.catalog);
            }
            return Err(e);
        }

        if placement.is_partial() {
            tracing::info!(
                model = %record.name(),
                swap_bytes = placement.swap_bytes,
                accelerator_bytes = placement.accelerator_bytes,
                method = if self.transfer.uses_streams() { "asynchronous" } else { "blocked" },
                "partial offload applied"
            );
            self.recovery.on_offload_imbalance(&mut self.catalog, &placement);
        }
        Ok((decision, placement))
    }

    /// Evict from `device` until more than `bytes` are free, keeping `keep_loaded`.
    pub fn free_memory(&mut self, bytes: u64, device: DeviceId, keep_loaded: &[ModelHandle]) -> EvictionReport {
        let pinned: HashSet<ModelId> = keep_loaded.iter().map(ModelHandle::id).collect();
        let report = self
            .registry
            .evict_until(&self.catalog, device, EvictionTarget::Bytes(bytes), &pinned);
        telemetry::record_eviction(device, report.unloaded.len(), report.freed_bytes);
        report
    }

    /// Unload everything from the accelerator and forget every record.
    pub fn unload_all(&mut self) -> EvictionReport {
        self.transfer.cleanup_cache();
        let device = self.catalog.load_device();
        let mut report = EvictionReport::default();
        if !self.catalog.is_host(device) {
            report = self.registry.free_all(&self.catalog, device, &HashSet::new());
            telemetry::record_eviction(device, report.unloaded.len(), report.freed_bytes);
        }
        self.registry.clear();
        tracing::info!(unloaded = report.unloaded.len(), freed = report.freed_bytes, "all models unloaded");
        report
    }

    /// Unload records whose handles were dropped.
    pub fn cleanup_models(&mut self) -> EvictionReport {
        let report = self.registry.cleanup_unreferenced(&self.catalog);
        if !report.is_empty() {
            self.transfer.clear_cast_cache();
        }
        report
    }

    /// Synchronize streams, release transient copies and soft-empty device caches.
    pub fn cleanup_cache(&mut self) {
        self.transfer.cleanup_cache();
        self.catalog.release_cached();
    }

    pub fn swap_accessor(&self, handle: &ModelHandle) -> SwapAccessor {
        let target = self
            .registry
            .get(handle.id())
            .map(LoadedModel::device)
            .unwrap_or_else(|| self.catalog.resolve_load_device(handle.load_device()));
        SwapAccessor::new(Arc::clone(handle.weights()), target, handle.dtype())
    }

    /// Run `f` over `module`'s buffers as compute on the load device sees them.
    pub fn with_module_weights<R>(
        &mut self,
        handle: &ModelHandle,
        module: &str,
        f: impl FnOnce(&CastBuffers) -> R,
    ) -> Result<R, OffloadError> {
        let accessor = self.swap_accessor(handle);
        Ok(accessor.read(&mut self.transfer, &self.catalog, module, f)?)
    }

    pub fn status(&self) -> ManagerStatus {
        let devices = self
            .catalog
            .devices()
            .map(|d| DeviceStatus {
                id: d.id,
                name: d.name.clone(),
                tier: d.tier,
                total_bytes: self.catalog.total_memory(d.id),
                allocated_bytes: self.catalog.allocated_bytes(d.id),
                free_bytes: self.catalog.free_memory(d.id),
            })
            .collect();
        ManagerStatus {
            mode: self.catalog.current_mode(),
            devices,
            models: self.registry.snapshot(),
            pending_transfers: self.transfer.pending_len(),
            cast_cache_entries: self.transfer.cast_cache_len(),
            cast_cache_hits: self.transfer.cast_cache_hits(),
            cast_cache_misses: self.transfer.cast_cache_misses(),
            downgrades: self.recovery.downgrade_count(),
        }
    }
}

/// Move modules per `placement`. Host-bound moves run first so the
/// accelerator frees bytes before it is asked for new ones.
fn apply_placement(
    catalog: &DeviceCatalog,
    weights: &SharedWeights,
    placement: &ModulePlacement,
    device: DeviceId,
    offload: DeviceId,
    pin: bool,
) -> Result<(), OffloadError> {
    let mut modules = weights.lock();
    let mut classes = Vec::with_capacity(modules.len());
    for m in modules.iter() {
        let class = placement.class_of(m.name()).ok_or_else(|| {
            OffloadError::PlacementInconsistency(format!("module {} has no placement", m.name()))
        })?;
        classes.push(class);
    }

    for (m, class) in modules.iter_mut().zip(&classes) {
        match class {
            PlacementClass::Host => {
                m.enable_manual_cast();
                m.move_all(catalog, offload, pin)?;
            }
            PlacementClass::ExtrasOnly => {
                m.enable_manual_cast();
                m.move_weight(catalog, offload, pin)?;
            }
            PlacementClass::Resident => {}
        }
    }
    let device_pin = pin && device == offload;
    for (m, class) in modules.iter_mut().zip(&classes) {
        match class {
            PlacementClass::Resident => m.move_all(catalog, device, device_pin)?,
            PlacementClass::ExtrasOnly => m.move_extras(catalog, device, device_pin)?,
            PlacementClass::Host => {}
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
