//! Memory budget arithmetic for a load request.

use serde::{Deserialize, Serialize};

use crate::device::{OperatingMode, GIB};

/// Margins and multipliers used by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Bytes always kept free for activations
    pub minimum_inference_memory: u64,
    /// Share of already-resident bytes re-counted against a load
    pub shared_tensor_margin: f64,
    /// Multiplier on the per-device requirement before eviction
    pub eviction_headroom: f64,
    /// Divisor applied to free memory when computing a swap budget
    pub swap_headroom_divisor: f64,
    /// Bytes subtracted from free memory when computing a swap budget
    pub swap_reserve_floor: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            minimum_inference_memory: GIB,
            shared_tensor_margin: 0.25,
            eviction_headroom: 1.3,
            swap_headroom_divisor: 1.3,
            swap_reserve_floor: GIB + GIB / 4,
        }
    }
}

/// Byte reservations derived from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reservations {
    /// Kept free while deciding whether a model fits
    pub inference: u64,
    /// Added to the eviction target
    pub eviction: u64,
}

/// Outcome for one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlacementDecision {
    /// Move the whole model to its load device
    Full,
    /// Split modules under `budget` accelerator bytes
    Partial { budget: u64 },
}

impl PlannerConfig {
    pub fn reservations(&self, memory_required: u64, reservation: u64) -> Reservations {
        Reservations {
            inference: self.minimum_inference_memory.saturating_add(reservation),
            eviction: self
                .minimum_inference_memory
                .max(memory_required)
                .saturating_add(reservation),
        }
    }

    /// Bytes a model needs on its device: what is missing plus a share of what
    /// is already there.
    pub fn load_requirement(&self, exclusive: u64, inclusive: u64) -> u64 {
        exclusive.saturating_add((inclusive as f64 * self.shared_tensor_margin) as u64)
    }

    /// Free bytes to target when evicting for a device requirement.
    pub fn eviction_target(&self, required: u64, reservations: &Reservations) -> u64 {
        ((required as f64 * self.eviction_headroom) as u64).saturating_add(reservations.eviction)
    }

    /// Accelerator bytes a partially offloaded model may use.
    pub fn swap_budget(&self, free: u64, inference_reservation: u64) -> u64 {
        let available = free as f64 - inference_reservation as f64;
        let scaled = available / self.swap_headroom_divisor.max(1.0);
        let floored = available - self.swap_reserve_floor as f64;
        scaled.min(floored).max(0.0) as u64
    }

    /// Full or partial placement for one model on an accelerator.
    ///
    /// `free` is the device's free bytes after eviction, `exclusive` and
    /// `inclusive` the model's bytes off and on the device.
    pub fn decide(
        &self,
        mode: OperatingMode,
        free: u64,
        exclusive: u64,
        inclusive: u64,
        reservations: &Reservations,
    ) -> PlacementDecision {
        let partial_budget = || {
            if inclusive > 0 {
                inclusive
            } else {
                self.swap_budget(free, reservations.inference)
            }
        };
        if mode.skips_budget_check() {
            return PlacementDecision::Full;
        }
        if !mode.permits_full_residency() {
            return PlacementDecision::Partial { budget: 0 };
        }
        let remaining = free as i128 - exclusive as i128 - reservations.inference as i128;
        if remaining >= 0 {
            PlacementDecision::Full
        } else {
            PlacementDecision::Partial { budget: partial_budget() }
        }
    }
}
