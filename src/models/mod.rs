//! Model handles, weight modules and the loaded-model registry.

mod handle;
mod module;
mod record;
mod registry;

pub use handle::{MemoryEstimator, ModelBuilder, ModelHandle, ModelId, SharedWeights, WeakModelHandle, WeightsId};
pub use module::{ModuleKind, ModuleSpec, WeightBuffer, WeightModule};
pub use record::{LoadedModel, ModelSnapshot};
pub use registry::{EvictionReport, EvictionTarget, ModelRegistry};
