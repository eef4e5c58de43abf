// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! `simulate`: replay a scripted sequence of loads against mock devices and
//! print what the manager decided at each step.
//!
//! ```toml
//! [accelerator]
//! bytes = 8589934592
//! tier = "discrete"
//!
//! [[models]]
//! name = "unet"
//! modules = [
//!     { name = "in", kind = "legacy", weight_elements = 1048576 },
//!     { name = "block0", weight_elements = 536870912, extra_elements = 4096 },
//! ]
//!
//! [[steps]]
//! action = "load"
//! models = ["unet"]
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConfigError, OffloadConfig};
use crate::device::{
    CapabilityTier, DType, DeviceCatalog, DeviceId, DeviceSpec, MockDeviceAllocator, GIB,
};
use crate::error::OffloadError;
use crate::manager::{LoadReport, ManagerStatus, OffloadManager};
use crate::models::{EvictionReport, ModelHandle, ModuleSpec};

const HOST_BYTES: u64 = 64 * GIB;

#[derive(Debug, Error)]
pub enum SimulateError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse scenario: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("scenario refers to unknown model '{0}'")]
    UnknownModel(String),

    #[error("failed to build model: {0}")]
    Build(#[from] OffloadError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcceleratorSpec {
    pub bytes: u64,
    #[serde(default = "default_tier")]
    pub tier: CapabilityTier,
}

fn default_tier() -> CapabilityTier {
    CapabilityTier::Discrete
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulatedModel {
    pub name: String,
    #[serde(default)]
    pub dtype: DType,
    /// Share the weights of an earlier model instead of declaring modules
    #[serde(default)]
    pub clone_of: Option<String>,
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Load {
        models: Vec<String>,
        #[serde(default)]
        memory_required: u64,
        #[serde(default)]
        reservation: u64,
    },
    /// Release the caller's handle so the record becomes unreferenced
    Drop { model: String },
    Cleanup,
    UnloadAll,
    /// Fail the next `count` accelerator allocations
    InjectOom { count: usize },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub config: OffloadConfig,
    /// No accelerator when absent
    pub accelerator: Option<AcceleratorSpec>,
    #[serde(default)]
    pub models: Vec<SimulatedModel>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn from_toml(text: &str) -> Result<Self, SimulateError> {
        let scenario: Scenario = toml::from_str(text)?;
        scenario.config.validate()?;
        Ok(scenario)
    }

    pub fn from_file(path: &Path) -> Result<Self, SimulateError> {
        let text = std::fs::read_to_string(path).map_err(|source| SimulateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub index: usize,
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<LoadReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evicted: Option<EvictionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepOutcome {
    fn new(index: usize, action: &'static str) -> Self {
        Self {
            index,
            action,
            load: None,
            evicted: None,
            error: None,
        }
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub steps: Vec<StepOutcome>,
    pub status: ManagerStatus,
}

impl SimulationReport {
    pub fn failures(&self) -> usize {
        self.steps.iter().filter(|s| s.failed()).count()
    }
}

/// Run every step of `scenario`. Load failures are recorded in the report,
/// not returned; only malformed scenarios are errors.
pub fn run_scenario(scenario: &Scenario) -> Result<SimulationReport, SimulateError> {
    let host = Arc::new(MockDeviceAllocator::new(DeviceId::Host, HOST_BYTES));
    let accel = scenario
        .accelerator
        .as_ref()
        .map(|a| (a.tier, Arc::new(MockDeviceAllocator::new(DeviceId::Accelerator(0), a.bytes))));
    let catalog = DeviceCatalog::detect(
        &scenario.config.device,
        DeviceSpec::host(host),
        accel
            .as_ref()
            .map(|(tier, alloc)| DeviceSpec::new("simulated-accelerator", *tier, Arc::clone(alloc) as _)),
    );
    let mut manager = OffloadManager::from_config(&scenario.config, catalog);

    let mut handles: HashMap<String, ModelHandle> = HashMap::new();
    for model in &scenario.models {
        let handle = match &model.clone_of {
            Some(source) => handles
                .get(source)
                .ok_or_else(|| SimulateError::UnknownModel(source.clone()))?
                .share_weights(model.name.clone()),
            None => manager.build_model(
                ModelHandle::builder(model.name.clone())
                    .dtype(model.dtype)
                    .modules(model.modules.iter().cloned()),
            )?,
        };
        handles.insert(model.name.clone(), handle);
    }

    let mut steps = Vec::with_capacity(scenario.steps.len());
    for (index, step) in scenario.steps.iter().enumerate() {
        let outcome = match step {
            Step::Load {
                models,
                memory_required,
                reservation,
            } => {
                let mut outcome = StepOutcome::new(index, "load");
                let requested = models
                    .iter()
                    .map(|name| handles.get(name).cloned().ok_or_else(|| SimulateError::UnknownModel(name.clone())))
                    .collect::<Result<Vec<_>, _>>()?;
                match manager.load(&requested, *memory_required, *reservation) {
                    Ok(report) => outcome.load = Some(report),
                    Err(e) => outcome.error = Some(e.to_string()),
                }
                outcome
            }
            Step::Drop { model } => {
                handles
                    .remove(model)
                    .ok_or_else(|| SimulateError::UnknownModel(model.clone()))?;
                StepOutcome::new(index, "drop")
            }
            Step::Cleanup => {
                let mut outcome = StepOutcome::new(index, "cleanup");
                outcome.evicted = Some(manager.cleanup_models());
                manager.cleanup_cache();
                outcome
            }
            Step::UnloadAll => {
                let mut outcome = StepOutcome::new(index, "unload_all");
                outcome.evicted = Some(manager.unload_all());
                outcome
            }
            Step::InjectOom { count } => {
                if let Some((_, alloc)) = &accel {
                    alloc.inject_oom(*count);
                }
                StepOutcome::new(index, "inject_oom")
            }
        };
        tracing::debug!(step = index, action = outcome.action, failed = outcome.failed(), "simulation step");
        steps.push(outcome);
    }

    Ok(SimulationReport {
        steps,
        status: manager.status(),
    })
}

/// Run a scenario file and print the report as JSON.
///
/// Returns 0 if every step succeeded, 1 if a step failed, 2 on a bad scenario.
pub fn run_simulate(path: &Path) -> i32 {
    let report = match Scenario::from_file(path).and_then(|s| run_scenario(&s)) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error: {e}");
            return 2;
        }
    };
    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("Error: failed to encode report: {e}");
            return 2;
        }
    }
    if report.failures() == 0 {
        0
    } else {
        1
    }
}
