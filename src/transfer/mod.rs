//! Weight movement between devices: streams, the stash, the cast cache and
//! swap accessors.

mod cast_cache;
mod engine;
mod stream;
mod swap;

pub use cast_cache::{CastCache, CastKey};
pub use engine::{CastBuffers, PendingTransfer, TransferConfig, TransferEngine, TransferError, TransientBuffer};
pub use stream::{CompletionSignal, DeviceStream, SimulatedStream, StreamPair};
pub use swap::SwapAccessor;
