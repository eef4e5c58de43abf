//! Structured logging and metrics.

mod logging;
mod metrics;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    init_metrics, record_device_bytes, record_downgrade, record_eviction, record_load, record_queue_depth,
    record_swap_bytes, record_transfer_state,
};
