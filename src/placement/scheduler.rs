//! Module placement under a byte budget.
//!
//! Legacy modules go to the accelerator first regardless of budget. Offloadable
//! modules are admitted for their extras in ascending extra size, then the
//! admitted set is promoted to full residency in ascending weight size. Both
//! admissions use a strict `counter + size < budget` test, so a zero budget
//! sends every offloadable module to host.

use std::collections::HashSet;

use serde::Serialize;

use crate::error::OffloadError;
use crate::models::{ModuleKind, WeightModule};

/// Byte cost of one module, split the way placement needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleCost {
    pub name: String,
    pub kind: ModuleKind,
    pub weight_bytes: u64,
    pub extra_bytes: u64,
}

impl ModuleCost {
    pub fn new(name: impl Into<String>, kind: ModuleKind, weight_bytes: u64, extra_bytes: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            weight_bytes,
            extra_bytes,
        }
    }

    pub fn of(module: &WeightModule) -> Self {
        Self::new(module.name(), module.kind(), module.weight_bytes(), module.extra_bytes())
    }

    pub fn total_bytes(&self) -> u64 {
        self.weight_bytes + self.extra_bytes
    }
}

/// Where a single module ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementClass {
    /// Weight and extras on the accelerator
    Resident,
    /// Extras on the accelerator, weight streamed from host
    ExtrasOnly,
    /// Everything on host, streamed at use
    Host,
}

/// Three disjoint module sets covering a whole model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModulePlacement {
    pub accelerator_resident: Vec<String>,
    pub accelerator_resident_extras_only: Vec<String>,
    pub host_resident: Vec<String>,
    /// Accelerator bytes the placement commits
    pub accelerator_bytes: u64,
    /// Bytes left on the offload device
    pub swap_bytes: u64,
}

impl ModulePlacement {
    /// Every module fully resident.
    pub fn full(costs: &[ModuleCost]) -> Self {
        Self {
            accelerator_resident: costs.iter().map(|c| c.name.clone()).collect(),
            accelerator_bytes: costs.iter().map(ModuleCost::total_bytes).sum(),
            ..Self::default()
        }
    }

    pub fn class_of(&self, name: &str) -> Option<PlacementClass> {
        let has = |set: &Vec<String>| set.iter().any(|n| n == name);
        if has(&self.accelerator_resident) {
            Some(PlacementClass::Resident)
        } else if has(&self.accelerator_resident_extras_only) {
            Some(PlacementClass::ExtrasOnly)
        } else if has(&self.host_resident) {
            Some(PlacementClass::Host)
        } else {
            None
        }
    }

    pub fn module_count(&self) -> usize {
        self.accelerator_resident.len() + self.accelerator_resident_extras_only.len() + self.host_resident.len()
    }

    /// More modules on host than fully on the accelerator.
    pub fn is_offload_heavy(&self) -> bool {
        self.host_resident.len() > self.accelerator_resident.len()
    }

    pub fn is_partial(&self) -> bool {
        !self.accelerator_resident_extras_only.is_empty() || !self.host_resident.is_empty()
    }

    /// The sets must be disjoint and cover exactly `costs`.
    pub fn validate(&self, costs: &[ModuleCost]) -> Result<(), OffloadError> {
        let mut seen = HashSet::new();
        let all = self
            .accelerator_resident
            .iter()
            .chain(&self.accelerator_resident_extras_only)
            .chain(&self.host_resident);
        for name in all {
            if !seen.insert(name.as_str()) {
                return Err(OffloadError::PlacementInconsistency(format!(
                    "module {name} placed more than once"
                )));
            }
        }
        for cost in costs {
            if !seen.remove(cost.name.as_str()) {
                return Err(OffloadError::PlacementInconsistency(format!(
                    "module {} was not placed",
                    cost.name
                )));
            }
        }
        if let Some(extra) = seen.into_iter().next() {
            return Err(OffloadError::PlacementInconsistency(format!(
                "placement names unknown module {extra}"
            )));
        }
        Ok(())
    }
}

/// Split `costs` between accelerator and host under `budget` bytes.
pub fn build_module_profile(costs: &[ModuleCost], budget: u64) -> ModulePlacement {
    let mut placement = ModulePlacement::default();
    let mut counter: u64 = 0;

    let (legacy, mut offloadable): (Vec<&ModuleCost>, Vec<&ModuleCost>) =
        costs.iter().partition(|c| c.kind == ModuleKind::Legacy);

    for m in legacy {
        placement.accelerator_resident.push(m.name.clone());
        counter += m.total_bytes();
    }

    // Stable sorts keep declaration order among equal sizes.
    offloadable.sort_by_key(|c| c.extra_bytes);
    let mut extras_only = Vec::new();
    for m in offloadable {
        if counter + m.extra_bytes < budget {
            counter += m.extra_bytes;
            extras_only.push(m);
        } else {
            placement.host_resident.push(m.name.clone());
            placement.swap_bytes += m.total_bytes();
        }
    }

    extras_only.sort_by_key(|c| c.weight_bytes);
    for m in extras_only {
        if counter + m.weight_bytes < budget {
            counter += m.weight_bytes;
            placement.accelerator_resident.push(m.name.clone());
        } else {
            placement.accelerator_resident_extras_only.push(m.name.clone());
            placement.swap_bytes += m.weight_bytes;
        }
    }

    placement.accelerator_bytes = counter;
    placement
}
