//! GG-OFFLOAD
//!
//! Adaptive model-memory manager for inference workloads that run on a
//! memory-constrained accelerator backed by host memory.
//!
//! Given a set of models to run, the manager decides which weights live on
//! the accelerator, which stay on the host and are streamed per use, and
//! which previously loaded models must be evicted first. When the
//! accelerator runs out of memory it lowers its operating mode so the next
//! load is planned more conservatively.
//!
//! # Layout
//!
//! - [`device`]: memory spaces, allocators and the operating mode
//! - [`models`]: handles, weight modules and the loaded-model registry
//! - [`placement`]: budget arithmetic, module scheduling and OOM recovery
//! - [`transfer`]: swap-in of offloaded weights, streams and cast cache
//! - [`scheduler`]: the single worker thread that owns manager state
//! - [`manager`] / [`service`]: the load pipeline and its caller API

pub mod cli;
pub mod config;
pub mod device;
pub mod error;
pub mod manager;
pub mod models;
pub mod placement;
pub mod scheduler;
pub mod service;
pub mod telemetry;
pub mod transfer;

pub use config::{ConfigError, EffectiveConfig, OffloadConfig};
pub use device::{CapabilityTier, DType, DeviceCatalog, DeviceConfig, DeviceId, OperatingMode, GIB, MIB};
pub use error::OffloadError;
pub use manager::{LoadReport, ManagerStatus, ModelLoadOutcome, OffloadManager, Residency};
pub use models::{ModelBuilder, ModelHandle, ModelId, ModuleKind, ModuleSpec};
pub use placement::{PlacementDecision, PlannerConfig};
pub use service::OffloadService;
