// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Config CLI subcommands: show, defaults, validate.
//!
//! These read configuration from `GG_OFFLOAD_*` environment variables, or
//! from a TOML file when one is given.

use std::path::Path;

use crate::config::{self, ConfigError, EffectiveConfig, OffloadConfig};

fn resolve(path: Option<&Path>) -> Result<OffloadConfig, ConfigError> {
    match path {
        Some(path) => config::load_file(path),
        None => Ok(config::load()),
    }
}

/// Print effective config as key-value pairs to stdout.
pub fn run_show(path: Option<&Path>) -> i32 {
    match resolve(path) {
        Ok(cfg) => {
            print_config(&cfg.effective_config());
            0
        }
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    }
}

/// Print the default config as a TOML document.
pub fn run_defaults() -> i32 {
    match OffloadConfig::default().to_toml() {
        Ok(text) => {
            print!("{text}");
            0
        }
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    }
}

/// Validate configuration for obvious misconfigurations.
///
/// Returns 0 if valid, 1 if any errors or warnings are found.
pub fn run_validate(path: Option<&Path>) -> i32 {
    let cfg = match resolve(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return 1;
        }
    };
    let warnings = check(&cfg.effective_config());
    for w in &warnings {
        eprintln!("WARNING: {w}");
    }
    if warnings.is_empty() {
        println!("Configuration is valid.");
        0
    } else {
        1
    }
}

/// Combinations that parse but are unlikely to be what the operator wants.
fn check(cfg: &EffectiveConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    if cfg.always_offload && cfg.mode_override == Some(crate::device::OperatingMode::HighBudget) {
        warnings.push("always_offload evicts every load while high_budget expects full residency".to_string());
    }
    if cfg.swap_reserve_floor < cfg.minimum_inference_memory {
        warnings.push(format!(
            "swap_reserve_floor ({}) is below minimum_inference_memory ({})",
            cfg.swap_reserve_floor, cfg.minimum_inference_memory
        ));
    }
    if cfg.cast_cache_capacity == 0 {
        warnings.push("cast cache disabled; every offloaded read copies".to_string());
    }
    warnings
}

fn print_config(cfg: &EffectiveConfig) {
    let mode = cfg.mode_override.map_or("auto", |m| m.as_str());
    println!("GG_OFFLOAD_MODE={mode}");
    println!("GG_OFFLOAD_BUDGET_FRACTION={}", cfg.budget_fraction);
    println!("GG_OFFLOAD_PIN_HOST_MEMORY={}", cfg.pin_host_memory);
    println!("GG_OFFLOAD_ALWAYS_OFFLOAD={}", cfg.always_offload);
    println!("GG_OFFLOAD_ASYNC_STREAMS={}", cfg.async_streams);
    println!("GG_OFFLOAD_MIN_INFERENCE_MEMORY={}", cfg.minimum_inference_memory);
    println!("GG_OFFLOAD_SHARED_TENSOR_MARGIN={}", cfg.shared_tensor_margin);
    println!("GG_OFFLOAD_EVICTION_HEADROOM={}", cfg.eviction_headroom);
    println!("GG_OFFLOAD_SWAP_HEADROOM={}", cfg.swap_headroom_divisor);
    println!("GG_OFFLOAD_SWAP_RESERVE_FLOOR={}", cfg.swap_reserve_floor);
    println!("GG_OFFLOAD_CAST_CACHE_CAPACITY={}", cfg.cast_cache_capacity);
    println!("GG_OFFLOAD_QUEUE_BACKOFF_MIN_MS={}", cfg.queue_backoff_min_ms);
    println!("GG_OFFLOAD_QUEUE_BACKOFF_MAX_MS={}", cfg.queue_backoff_max_ms);
}
