//! Operating mode state machine.
//!
//! The mode is chosen once at startup and afterwards only moves down the
//! `NormalBudget -> LowBudget -> NoBudget` chain. Nothing raises it again.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How aggressively weights are kept on the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// No accelerator; everything runs from host memory
    Disabled,
    /// Force offloadable weights to host
    NoBudget,
    /// Expect partial offload; full residency only when the model fits
    LowBudget,
    /// Attempt full residency, fall back to partial offload
    NormalBudget,
    /// Always fully resident
    HighBudget,
    /// Accelerator and host share one memory pool
    Shared,
}

impl OperatingMode {
    /// The next mode down the budget chain, if any.
    pub fn next_lower(self) -> Option<Self> {
        match self {
            OperatingMode::NormalBudget => Some(OperatingMode::LowBudget),
            OperatingMode::LowBudget => Some(OperatingMode::NoBudget),
            _ => None,
        }
    }

    /// Whether a model may be placed fully when it fits.
    pub fn permits_full_residency(self) -> bool {
        self != OperatingMode::NoBudget
    }

    /// Modes that place fully without checking free memory.
    pub fn skips_budget_check(self) -> bool {
        matches!(
            self,
            OperatingMode::HighBudget | OperatingMode::Shared | OperatingMode::Disabled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::Disabled => "disabled",
            OperatingMode::NoBudget => "no_budget",
            OperatingMode::LowBudget => "low_budget",
            OperatingMode::NormalBudget => "normal_budget",
            OperatingMode::HighBudget => "high_budget",
            OperatingMode::Shared => "shared",
        }
    }
}

impl Default for OperatingMode {
    fn default() -> Self {
        Self::NormalBudget
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown operating mode: {0}")]
pub struct ParseModeError(pub String);

impl FromStr for OperatingMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "cpu" => Ok(OperatingMode::Disabled),
            "none" | "no" | "no_budget" => Ok(OperatingMode::NoBudget),
            "low" | "low_budget" => Ok(OperatingMode::LowBudget),
            "normal" | "normal_budget" => Ok(OperatingMode::NormalBudget),
            "high" | "high_budget" => Ok(OperatingMode::HighBudget),
            "shared" => Ok(OperatingMode::Shared),
            other => Err(ParseModeError(other.to_string())),
        }
    }
}

/// A recorded mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModeTransition {
    pub from: OperatingMode,
    pub to: OperatingMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_bottoms_out_at_no_budget() {
        assert_eq!(OperatingMode::NormalBudget.next_lower(), Some(OperatingMode::LowBudget));
        assert_eq!(OperatingMode::LowBudget.next_lower(), Some(OperatingMode::NoBudget));
        assert_eq!(OperatingMode::NoBudget.next_lower(), None);
    }

    #[test]
    fn high_shared_and_disabled_never_step_down() {
        assert_eq!(OperatingMode::HighBudget.next_lower(), None);
        assert_eq!(OperatingMode::Shared.next_lower(), None);
        assert_eq!(OperatingMode::Disabled.next_lower(), None);
    }

    #[test]
    fn only_no_budget_forbids_full_residency() {
        assert!(!OperatingMode::NoBudget.permits_full_residency());
        assert!(OperatingMode::LowBudget.permits_full_residency());
        assert!(OperatingMode::NormalBudget.permits_full_residency());
        assert!(OperatingMode::HighBudget.skips_budget_check());
        assert!(!OperatingMode::LowBudget.skips_budget_check());
    }

    #[test]
    fn parse_accepts_short_and_long_names() {
        assert_eq!("low".parse::<OperatingMode>(), Ok(OperatingMode::LowBudget));
        assert_eq!("NO_BUDGET".parse::<OperatingMode>(), Ok(OperatingMode::NoBudget));
        assert_eq!(" high ".parse::<OperatingMode>(), Ok(OperatingMode::HighBudget));
        assert!("turbo".parse::<OperatingMode>().is_err());
    }
}
