//! Placement: budget planning, module scheduling and OOM recovery.

mod planner;
mod recovery;
mod scheduler;

pub use planner::{PlacementDecision, PlannerConfig, Reservations};
pub use recovery::{DowngradeCause, OomRecovery};
pub use scheduler::{build_module_profile, ModuleCost, ModulePlacement, PlacementClass};
