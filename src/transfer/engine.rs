//! Async transfer engine.
//!
//! Copies run on the mover stream; compute runs on the main stream after
//! waiting for the copy. Buffers used by in-flight compute are stashed with
//! the signal recorded after it and only released once that signal is done.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::cast_cache::{CastCache, CastKey};
use super::stream::{CompletionSignal, StreamPair};
use crate::device::{allocate_on, DType, DeviceAllocation, DeviceCatalog, DeviceError, DeviceId};
use crate::models::{SharedWeights, WeightBuffer};
use crate::telemetry;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("device error during transfer: {0}")]
    Device(#[from] DeviceError),

    #[error("unknown module: {module}")]
    UnknownModule { module: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Entries kept in the cast cache before it is cleared (0 disables it)
    pub cast_cache_capacity: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            cast_cache_capacity: 1000,
        }
    }
}

/// One tensor as seen by compute on the target device.
#[derive(Debug)]
pub struct TransientBuffer {
    name: String,
    bytes: u64,
    dtype: DType,
    device: DeviceId,
    /// `None` when this is a view of a buffer already resident on the device
    allocation: Option<DeviceAllocation>,
}

impl TransientBuffer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn is_copy(&self) -> bool {
        self.allocation.is_some()
    }
}

/// A module's buffers, materialized on a compute device.
#[derive(Debug)]
pub struct CastBuffers {
    module: String,
    device: DeviceId,
    weight: TransientBuffer,
    extras: Vec<TransientBuffer>,
}

impl CastBuffers {
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn weight(&self) -> &TransientBuffer {
        &self.weight
    }

    pub fn extras(&self) -> &[TransientBuffer] {
        &self.extras
    }

    fn buffers(&self) -> impl Iterator<Item = &TransientBuffer> {
        std::iter::once(&self.weight).chain(self.extras.iter())
    }

    /// Nothing was copied; every buffer is a view.
    pub fn resident(&self) -> bool {
        self.buffers().all(|b| !b.is_copy())
    }

    pub fn transient_bytes(&self) -> u64 {
        self.buffers().filter(|b| b.is_copy()).map(TransientBuffer::bytes).sum()
    }
}

/// Stashed buffers that in-flight compute may still read.
#[derive(Debug)]
pub struct PendingTransfer {
    pub buffers: Arc<CastBuffers>,
    pub source: DeviceId,
    pub destination: DeviceId,
    pub signal: CompletionSignal,
}

pub struct TransferEngine {
    streams: Option<StreamPair>,
    pending: Vec<PendingTransfer>,
    cast_cache: CastCache,
}

impl TransferEngine {
    /// Without streams every transfer is a synchronous copy.
    pub fn new(config: &TransferConfig, streams: Option<StreamPair>) -> Self {
        Self {
            streams,
            pending: Vec::new(),
            cast_cache: CastCache::new(config.cast_cache_capacity),
        }
    }

    /// Streams when the catalog supports them, synchronous otherwise.
    pub fn for_catalog(config: &TransferConfig, catalog: &DeviceCatalog) -> Self {
        let streams = catalog.supports_async_streams().then(|| StreamPair::simulated(true));
        Self::new(config, streams)
    }

    pub fn uses_streams(&self) -> bool {
        self.streams.is_some()
    }

    /// Copy a module's buffers to `device` as `dtype`. Returns the mover-stream
    /// signal when the copy is asynchronous.
    pub fn cast_module(
        &mut self,
        catalog: &DeviceCatalog,
        weights: &SharedWeights,
        module: &str,
        device: DeviceId,
        dtype: DType,
    ) -> Result<(CastBuffers, Option<CompletionSignal>), TransferError> {
        let allocator = catalog.allocator(device)?;
        let modules = weights.lock();
        let m = modules
            .iter()
            .find(|m| m.name() == module)
            .ok_or_else(|| TransferError::UnknownModule { module: module.to_string() })?;

        let cast = |buffer: &WeightBuffer| -> Result<TransientBuffer, DeviceError> {
            // Packed formats are consumed as-is; dequantization is the kernel's job.
            let target = if buffer.dtype().is_quantized() { buffer.dtype() } else { dtype };
            let bytes = target.storage_bytes(buffer.elements());
            let allocation = if buffer.location() == device && buffer.dtype() == target {
                None
            } else {
                Some(allocate_on(allocator, bytes, false)?)
            };
            Ok(TransientBuffer {
                name: buffer.name().to_string(),
                bytes,
                dtype: target,
                device,
                allocation,
            })
        };

        let buffers = CastBuffers {
            module: module.to_string(),
            device,
            weight: cast(m.weight())?,
            extras: m.extras().iter().map(&cast).collect::<Result<_, _>>()?,
        };
        drop(modules);

        let signal = match self.streams.as_mut() {
            Some(streams) if !buffers.resident() => Some(streams.mover.record_signal()),
            _ => None,
        };
        Ok((buffers, signal))
    }

    /// Run `f` over a module's buffers on `device`. Copies are issued on the
    /// mover stream, compute waits for them on the main stream, and the
    /// buffers stay stashed until the main stream has moved past them.
    pub fn consume<R>(
        &mut self,
        catalog: &DeviceCatalog,
        weights: &SharedWeights,
        module: &str,
        device: DeviceId,
        dtype: DType,
        f: impl FnOnce(&CastBuffers) -> R,
    ) -> Result<R, TransferError> {
        self.sweep();

        let key = CastKey {
            weights: weights.id(),
            module: module.to_string(),
            device,
            dtype,
        };
        if let Some(cached) = self.cast_cache.get(&key) {
            return Ok(f(&cached));
        }

        let source = weights
            .lock()
            .iter()
            .find(|m| m.name() == module)
            .map(|m| m.weight().location())
            .unwrap_or(device);
        let (buffers, signal) = self.cast_module(catalog, weights, module, device, dtype)?;
        if buffers.resident() {
            return Ok(f(&buffers));
        }
        telemetry::record_swap_bytes(buffers.transient_bytes());

        let buffers = Arc::new(buffers);
        let out = match (self.streams.as_mut(), signal) {
            (Some(streams), Some(copied)) => {
                streams.main.wait_signal(&copied);
                let out = f(&buffers);
                let finished = streams.main.record_signal();
                self.pending.push(PendingTransfer {
                    buffers: Arc::clone(&buffers),
                    source,
                    destination: device,
                    signal: finished,
                });
                out
            }
            _ => f(&buffers),
        };
        self.cast_cache.insert(key, buffers);
        telemetry::record_transfer_state(self.pending.len(), self.cast_cache.len());
        Ok(out)
    }

    /// Drop stash entries whose signal is done. Returns how many went.
    pub fn sweep(&mut self) -> usize {
        let before = self.pending.len();
        self.pending.retain(|p| !p.signal.is_done());
        before - self.pending.len()
    }

    /// Synchronize both streams and release every stashed buffer and cached
    /// copy, leaving no transient allocation on any device.
    pub fn cleanup_cache(&mut self) {
        if let Some(streams) = self.streams.as_mut() {
            streams.synchronize();
        }
        let released = self.pending.len();
        self.pending.clear();
        let cached = self.cast_cache.len();
        self.cast_cache.clear();
        if released > 0 || cached > 0 {
            tracing::debug!(released, cached, "transfer stash cleared");
        }
        telemetry::record_transfer_state(0, 0);
    }

    pub fn clear_cast_cache(&mut self) {
        self.cast_cache.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> &[PendingTransfer] {
        &self.pending
    }

    pub fn cast_cache_len(&self) -> usize {
        self.cast_cache.len()
    }

    pub fn cast_cache_hits(&self) -> u64 {
        self.cast_cache.hits()
    }

    pub fn cast_cache_misses(&self) -> u64 {
        self.cast_cache.misses()
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
