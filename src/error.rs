//! Errors surfaced by the offload manager.

use thiserror::Error;

use crate::device::{DeviceError, DeviceId};
use crate::scheduler::QueueError;
use crate::transfer::TransferError;

#[derive(Debug, Error)]
pub enum OffloadError {
    /// An allocation did not fit. The operating mode has already been
    /// lowered for the next request when this is returned from a load.
    #[error("resource exhausted on {device}: requested {requested} bytes, available {available} bytes")]
    ResourceExhausted {
        device: DeviceId,
        requested: u64,
        available: u64,
    },

    #[error("placement inconsistency: {0}")]
    PlacementInconsistency(String),

    #[error("queued task failed: {0}")]
    QueueTaskFailure(#[from] QueueError),

    #[error("device error: {0}")]
    Device(DeviceError),

    #[error("transfer error: {0}")]
    Transfer(TransferError),
}

impl OffloadError {
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, OffloadError::ResourceExhausted { .. })
    }
}

impl From<DeviceError> for OffloadError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::OutOfMemory { device, requested, available } => OffloadError::ResourceExhausted {
                device,
                requested,
                available,
            },
            other => OffloadError::Device(other),
        }
    }
}

impl From<TransferError> for OffloadError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Device(d) => d.into(),
            other => OffloadError::Transfer(other),
        }
    }
}
