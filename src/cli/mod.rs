// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! CLI subcommands for `gg-offload-cli`.
//!
//! ## Usage
//!
//! ```bash
//! gg-offload-cli config show            # Effective config from GG_OFFLOAD_* vars
//! gg-offload-cli config validate FILE   # Check a TOML config file
//! gg-offload-cli simulate scenario.toml # Replay loads against mock devices
//! ```

pub mod config_cmd;
pub mod simulate_cmd;

pub use simulate_cmd::{run_scenario, Scenario, SimulateError, SimulationReport};
