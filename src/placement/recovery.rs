//! Out-of-memory recovery: the only thing allowed to lower the operating mode.

use crate::device::{DeviceCatalog, ModeTransition, OperatingMode};
use crate::telemetry;

use super::scheduler::ModulePlacement;

/// Why a downgrade happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DowngradeCause {
    OutOfMemory,
    OffloadImbalance,
}

impl DowngradeCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            DowngradeCause::OutOfMemory => "out_of_memory",
            DowngradeCause::OffloadImbalance => "offload_imbalance",
        }
    }
}

/// Records and applies mode downgrades. Never retries.
#[derive(Debug, Default)]
pub struct OomRecovery {
    history: Vec<(ModeTransition, DowngradeCause)>,
}

impl OomRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// One step down the budget chain for the next load. The failing call
    /// still returns its error.
    pub fn on_out_of_memory(&mut self, catalog: &mut DeviceCatalog) -> Option<ModeTransition> {
        self.step(catalog, DowngradeCause::OutOfMemory)
    }

    /// A partial placement left more modules on host than fully on the
    /// accelerator. Only lowers `NormalBudget`.
    pub fn on_offload_imbalance(
        &mut self,
        catalog: &mut DeviceCatalog,
        placement: &ModulePlacement,
    ) -> Option<ModeTransition> {
        if catalog.current_mode() != OperatingMode::NormalBudget || !placement.is_offload_heavy() {
            return None;
        }
        self.step(catalog, DowngradeCause::OffloadImbalance)
    }

    fn step(&mut self, catalog: &mut DeviceCatalog, cause: DowngradeCause) -> Option<ModeTransition> {
        let transition = catalog.downgrade()?;
        tracing::warn!(
            from = %transition.from,
            to = %transition.to,
            cause = cause.as_str(),
            "operating mode lowered"
        );
        telemetry::record_downgrade(transition, cause.as_str());
        self.history.push((transition, cause));
        Some(transition)
    }

    pub fn downgrade_count(&self) -> usize {
        self.history.len()
    }

    pub fn history(&self) -> &[(ModeTransition, DowngradeCause)] {
        &self.history
    }
}
