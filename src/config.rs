//! Startup configuration, from environment variables or a TOML file.
//!
//! Read once at startup and immutable afterwards. Invalid environment values
//! fall back to defaults without crashing; a config file with out-of-range
//! values is rejected by `validate`.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `GG_OFFLOAD_MODE` | auto | Initial operating mode override |
//! | `GG_OFFLOAD_BUDGET_FRACTION` | 1.0 | Share of accelerator memory the manager may use |
//! | `GG_OFFLOAD_PIN_HOST_MEMORY` | false | Pin host memory for offloaded weights |
//! | `GG_OFFLOAD_ALWAYS_OFFLOAD` | false | Evict every unpinned model on each load |
//! | `GG_OFFLOAD_ASYNC_STREAMS` | true | Use a separate copy stream when supported |
//! | `GG_OFFLOAD_MIN_INFERENCE_MEMORY` | 1073741824 | Bytes always kept free for activations |
//! | `GG_OFFLOAD_SHARED_TENSOR_MARGIN` | 0.25 | Share of resident bytes re-counted on load |
//! | `GG_OFFLOAD_EVICTION_HEADROOM` | 1.3 | Multiplier on the eviction requirement |
//! | `GG_OFFLOAD_SWAP_HEADROOM` | 1.3 | Divisor on free memory for the swap budget |
//! | `GG_OFFLOAD_SWAP_RESERVE_FLOOR` | 1342177280 | Bytes subtracted for the swap budget |
//! | `GG_OFFLOAD_CAST_CACHE_CAPACITY` | 1000 | Cast cache entries (0 disables) |
//! | `GG_OFFLOAD_QUEUE_BACKOFF_MIN_MS` | 1 | Worker idle backoff floor |
//! | `GG_OFFLOAD_QUEUE_BACKOFF_MAX_MS` | 64 | Worker idle backoff ceiling |

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::{DeviceConfig, OperatingMode};
use crate::placement::PlannerConfig;
use crate::scheduler::TaskQueueConfig;
use crate::transfer::TransferConfig;

const MAX_HEADROOM: f64 = 4.0;
const MIN_BUDGET_FRACTION: f64 = 0.05;
const MAX_CAST_CACHE: usize = 100_000;
const MAX_BACKOFF_MS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Everything the manager reads at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    pub device: DeviceConfig,
    pub planner: PlannerConfig,
    pub transfer: TransferConfig,
    pub queue: TaskQueueConfig,
}

/// Flat, serializable summary of the effective values.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub mode_override: Option<OperatingMode>,
    pub budget_fraction: f64,
    pub pin_host_memory: bool,
    pub always_offload: bool,
    pub async_streams: bool,
    pub minimum_inference_memory: u64,
    pub shared_tensor_margin: f64,
    pub eviction_headroom: f64,
    pub swap_headroom_divisor: f64,
    pub swap_reserve_floor: u64,
    pub cast_cache_capacity: usize,
    pub queue_backoff_min_ms: u64,
    pub queue_backoff_max_ms: u64,
}

fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Finite floats only; NaN and infinities fall back to `default`.
fn parse_f64(key: &str, default: f64) -> f64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<f64>().ok().filter(|v| v.is_finite()).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// `auto` or an unknown value means no override.
fn parse_mode(key: &str) -> Option<OperatingMode> {
    let val = std::env::var(key).ok()?;
    if val.trim().eq_ignore_ascii_case("auto") {
        return None;
    }
    match val.parse::<OperatingMode>() {
        Ok(mode) => Some(mode),
        Err(e) => {
            tracing::warn!(key, error = %e, "ignoring operating mode override");
            None
        }
    }
}

fn load_device_config() -> DeviceConfig {
    let defaults = DeviceConfig::default();
    let budget_fraction = parse_f64("GG_OFFLOAD_BUDGET_FRACTION", defaults.budget_fraction);
    DeviceConfig {
        mode_override: parse_mode("GG_OFFLOAD_MODE"),
        budget_fraction: budget_fraction.clamp(MIN_BUDGET_FRACTION, 1.0),
        pin_host_memory: parse_bool("GG_OFFLOAD_PIN_HOST_MEMORY", defaults.pin_host_memory),
        always_offload: parse_bool("GG_OFFLOAD_ALWAYS_OFFLOAD", defaults.always_offload),
        async_streams: parse_bool("GG_OFFLOAD_ASYNC_STREAMS", defaults.async_streams),
    }
}

fn load_planner_config() -> PlannerConfig {
    let defaults = PlannerConfig::default();
    let margin = parse_f64("GG_OFFLOAD_SHARED_TENSOR_MARGIN", defaults.shared_tensor_margin);
    let eviction = parse_f64("GG_OFFLOAD_EVICTION_HEADROOM", defaults.eviction_headroom);
    let swap = parse_f64("GG_OFFLOAD_SWAP_HEADROOM", defaults.swap_headroom_divisor);
    PlannerConfig {
        minimum_inference_memory: parse_u64("GG_OFFLOAD_MIN_INFERENCE_MEMORY", defaults.minimum_inference_memory),
        shared_tensor_margin: margin.clamp(0.0, 1.0),
        eviction_headroom: eviction.clamp(1.0, MAX_HEADROOM),
        swap_headroom_divisor: swap.clamp(1.0, MAX_HEADROOM),
        swap_reserve_floor: parse_u64("GG_OFFLOAD_SWAP_RESERVE_FLOOR", defaults.swap_reserve_floor),
    }
}

fn load_transfer_config() -> TransferConfig {
    let capacity = parse_usize("GG_OFFLOAD_CAST_CACHE_CAPACITY", TransferConfig::default().cast_cache_capacity);
    TransferConfig {
        cast_cache_capacity: capacity.min(MAX_CAST_CACHE),
    }
}

fn load_queue_config() -> TaskQueueConfig {
    let defaults = TaskQueueConfig::default();
    let min = parse_u64("GG_OFFLOAD_QUEUE_BACKOFF_MIN_MS", defaults.backoff_min_ms).clamp(1, MAX_BACKOFF_MS);
    let max = parse_u64("GG_OFFLOAD_QUEUE_BACKOFF_MAX_MS", defaults.backoff_max_ms).clamp(min, MAX_BACKOFF_MS);
    TaskQueueConfig {
        backoff_min_ms: min,
        backoff_max_ms: max,
    }
}

/// Load all configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> OffloadConfig {
    OffloadConfig {
        device: load_device_config(),
        planner: load_planner_config(),
        transfer: load_transfer_config(),
        queue: load_queue_config(),
    }
}

/// Load a TOML config file. Missing fields take their defaults.
pub fn load_file(path: &Path) -> Result<OffloadConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = OffloadConfig::from_toml(&text)?;
    tracing::debug!(path = %path.display(), "config file loaded");
    Ok(config)
}

impl OffloadConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: OffloadConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the environment loader would have clamped.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: String| Err(ConfigError::Invalid { field, reason });

        let fraction = self.device.budget_fraction;
        if !(MIN_BUDGET_FRACTION..=1.0).contains(&fraction) {
            return invalid(
                "device.budget_fraction",
                format!("{fraction} is outside {MIN_BUDGET_FRACTION}..=1.0"),
            );
        }
        let margin = self.planner.shared_tensor_margin;
        if !(0.0..=1.0).contains(&margin) {
            return invalid("planner.shared_tensor_margin", format!("{margin} is outside 0.0..=1.0"));
        }
        for (field, value) in [
            ("planner.eviction_headroom", self.planner.eviction_headroom),
            ("planner.swap_headroom_divisor", self.planner.swap_headroom_divisor),
        ] {
            if !(1.0..=MAX_HEADROOM).contains(&value) {
                return invalid(field, format!("{value} is outside 1.0..={MAX_HEADROOM}"));
            }
        }
        if self.transfer.cast_cache_capacity > MAX_CAST_CACHE {
            return invalid(
                "transfer.cast_cache_capacity",
                format!("{} exceeds {MAX_CAST_CACHE}", self.transfer.cast_cache_capacity),
            );
        }
        let (min, max) = (self.queue.backoff_min_ms, self.queue.backoff_max_ms);
        if min == 0 || min > max || max > MAX_BACKOFF_MS {
            return invalid(
                "queue.backoff_min_ms",
                format!("backoff bounds {min}..{max} must satisfy 1 <= min <= max <= {MAX_BACKOFF_MS}"),
            );
        }
        Ok(())
    }

    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            mode_override: self.device.mode_override,
            budget_fraction: self.device.budget_fraction,
            pin_host_memory: self.device.pin_host_memory,
            always_offload: self.device.always_offload,
            async_streams: self.device.async_streams,
            minimum_inference_memory: self.planner.minimum_inference_memory,
            shared_tensor_margin: self.planner.shared_tensor_margin,
            eviction_headroom: self.planner.eviction_headroom,
            swap_headroom_divisor: self.planner.swap_headroom_divisor,
            swap_reserve_floor: self.planner.swap_reserve_floor,
            cast_cache_capacity: self.transfer.cast_cache_capacity,
            queue_backoff_min_ms: self.queue.backoff_min_ms,
            queue_backoff_max_ms: self.queue.backoff_max_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::GIB;
    use std::io::Write;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "GG_OFFLOAD_MODE",
        "GG_OFFLOAD_BUDGET_FRACTION",
        "GG_OFFLOAD_PIN_HOST_MEMORY",
        "GG_OFFLOAD_ALWAYS_OFFLOAD",
        "GG_OFFLOAD_ASYNC_STREAMS",
        "GG_OFFLOAD_MIN_INFERENCE_MEMORY",
        "GG_OFFLOAD_SHARED_TENSOR_MARGIN",
        "GG_OFFLOAD_EVICTION_HEADROOM",
        "GG_OFFLOAD_SWAP_HEADROOM",
        "GG_OFFLOAD_SWAP_RESERVE_FLOOR",
        "GG_OFFLOAD_CAST_CACHE_CAPACITY",
        "GG_OFFLOAD_QUEUE_BACKOFF_MIN_MS",
        "GG_OFFLOAD_QUEUE_BACKOFF_MAX_MS",
    ];

    fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn test_defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load();
        assert_eq!(cfg.device.mode_override, None);
        assert_eq!(cfg.device.budget_fraction, 1.0);
        assert!(cfg.device.async_streams);
        assert!(!cfg.device.always_offload);
        assert_eq!(cfg.planner.minimum_inference_memory, GIB);
        assert_eq!(cfg.planner.shared_tensor_margin, 0.25);
        assert_eq!(cfg.planner.eviction_headroom, 1.3);
        assert_eq!(cfg.planner.swap_reserve_floor, GIB + GIB / 4);
        assert_eq!(cfg.transfer.cast_cache_capacity, 1000);
        assert_eq!(cfg.queue.backoff_min_ms, 1);
        assert_eq!(cfg.queue.backoff_max_ms, 64);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_env_vars_override_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("GG_OFFLOAD_MODE", "low");
        std::env::set_var("GG_OFFLOAD_BUDGET_FRACTION", "0.5");
        std::env::set_var("GG_OFFLOAD_ALWAYS_OFFLOAD", "yes");
        std::env::set_var("GG_OFFLOAD_EVICTION_HEADROOM", "1.5");
        std::env::set_var("GG_OFFLOAD_CAST_CACHE_CAPACITY", "0");
        let cfg = load();
        assert_eq!(cfg.device.mode_override, Some(OperatingMode::LowBudget));
        assert_eq!(cfg.device.budget_fraction, 0.5);
        assert!(cfg.device.always_offload);
        assert_eq!(cfg.planner.eviction_headroom, 1.5);
        assert_eq!(cfg.transfer.cast_cache_capacity, 0);
        clear_env_vars();
    }

    #[test]
    fn test_invalid_env_falls_back_to_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("GG_OFFLOAD_MODE", "turbo");
        std::env::set_var("GG_OFFLOAD_BUDGET_FRACTION", "NaN");
        std::env::set_var("GG_OFFLOAD_PIN_HOST_MEMORY", "maybe");
        std::env::set_var("GG_OFFLOAD_MIN_INFERENCE_MEMORY", "-1");
        let cfg = load();
        assert_eq!(cfg.device.mode_override, None);
        assert_eq!(cfg.device.budget_fraction, 1.0);
        assert!(!cfg.device.pin_host_memory);
        assert_eq!(cfg.planner.minimum_inference_memory, GIB);
        clear_env_vars();
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("GG_OFFLOAD_BUDGET_FRACTION", "7");
        std::env::set_var("GG_OFFLOAD_SWAP_HEADROOM", "0.2");
        std::env::set_var("GG_OFFLOAD_QUEUE_BACKOFF_MIN_MS", "50");
        std::env::set_var("GG_OFFLOAD_QUEUE_BACKOFF_MAX_MS", "10");
        let cfg = load();
        assert_eq!(cfg.device.budget_fraction, 1.0);
        assert_eq!(cfg.planner.swap_headroom_divisor, 1.0);
        assert_eq!(cfg.queue.backoff_min_ms, 50);
        assert_eq!(cfg.queue.backoff_max_ms, 50);
        assert!(cfg.validate().is_ok());
        clear_env_vars();
    }

    #[test]
    fn test_file_fills_missing_fields_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[device]\nmode_override = \"high_budget\"\nbudget_fraction = 0.75\n\n[planner]\neviction_headroom = 2.0\n"
        )
        .unwrap();
        let cfg = load_file(file.path()).unwrap();
        assert_eq!(cfg.device.mode_override, Some(OperatingMode::HighBudget));
        assert_eq!(cfg.device.budget_fraction, 0.75);
        assert_eq!(cfg.planner.eviction_headroom, 2.0);
        assert_eq!(cfg.planner.shared_tensor_margin, 0.25);
        assert_eq!(cfg.transfer.cast_cache_capacity, 1000);
    }

    #[test]
    fn test_file_with_bad_values_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[planner]\nswap_headroom_divisor = 0.5\n").unwrap();
        assert!(matches!(
            load_file(file.path()),
            Err(ConfigError::Invalid { field: "planner.swap_headroom_divisor", .. })
        ));

        assert!(matches!(OffloadConfig::from_toml("device = 3"), Err(ConfigError::Parse(_))));
        assert!(matches!(
            load_file(Path::new("/nonexistent/gg-offload.toml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_toml_round_trip_keeps_values() {
        let mut cfg = OffloadConfig::default();
        cfg.device.pin_host_memory = true;
        cfg.queue.backoff_max_ms = 128;
        let parsed = OffloadConfig::from_toml(&cfg.to_toml().unwrap()).unwrap();
        assert!(parsed.device.pin_host_memory);
        assert_eq!(parsed.queue.backoff_max_ms, 128);
    }

    #[test]
    fn test_effective_config_serializes() {
        let eff = OffloadConfig::default().effective_config();
        let json = serde_json::to_value(&eff).unwrap();
        assert_eq!(json["cast_cache_capacity"], 1000);
        assert!(json["mode_override"].is_null());
    }
}
