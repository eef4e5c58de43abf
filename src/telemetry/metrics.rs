//! Metrics emitted through the `metrics` facade. Without an installed
//! recorder every call is a no-op.

use std::time::Duration;

use ::metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

use crate::device::{DeviceId, ModeTransition};

/// Register metric descriptions with the installed recorder.
pub fn init_metrics() {
    describe_counter!("gg_offload_loads_total", "Load requests by outcome");
    describe_counter!("gg_offload_evictions_total", Unit::Count, "Models evicted from a device");
    describe_counter!("gg_offload_evicted_bytes_total", Unit::Bytes, "Bytes freed by eviction");
    describe_counter!("gg_offload_mode_downgrades_total", "Operating mode downgrades by cause");
    describe_counter!("gg_offload_swap_bytes_total", Unit::Bytes, "Bytes streamed from offload devices");
    describe_gauge!("gg_offload_device_allocated_bytes", Unit::Bytes, "Bytes allocated per device");
    describe_gauge!("gg_offload_pending_transfers", "Stashed transfers awaiting completion");
    describe_gauge!("gg_offload_cast_cache_entries", "Entries in the cast cache");
    describe_gauge!("gg_offload_queue_depth", "Tasks waiting on the worker");
    describe_histogram!("gg_offload_load_seconds", Unit::Seconds, "Load request latency");
}

pub fn record_load(outcome: &'static str, elapsed: Duration) {
    counter!("gg_offload_loads_total", "outcome" => outcome).increment(1);
    histogram!("gg_offload_load_seconds").record(elapsed.as_secs_f64());
}

pub fn record_eviction(device: DeviceId, models: usize, bytes: u64) {
    if models == 0 {
        return;
    }
    let device = device.to_string();
    counter!("gg_offload_evictions_total", "device" => device.clone()).increment(models as u64);
    counter!("gg_offload_evicted_bytes_total", "device" => device).increment(bytes);
}

pub fn record_downgrade(transition: ModeTransition, cause: &'static str) {
    counter!(
        "gg_offload_mode_downgrades_total",
        "from" => transition.from.as_str(),
        "to" => transition.to.as_str(),
        "cause" => cause
    )
    .increment(1);
}

pub fn record_swap_bytes(bytes: u64) {
    counter!("gg_offload_swap_bytes_total").increment(bytes);
}

pub fn record_device_bytes(device: DeviceId, bytes: u64) {
    gauge!("gg_offload_device_allocated_bytes", "device" => device.to_string()).set(bytes as f64);
}

pub fn record_transfer_state(pending: usize, cache_entries: usize) {
    gauge!("gg_offload_pending_transfers").set(pending as f64);
    gauge!("gg_offload_cast_cache_entries").set(cache_entries as f64);
}

pub fn record_queue_depth(depth: usize) {
    gauge!("gg_offload_queue_depth").set(depth as f64);
}
