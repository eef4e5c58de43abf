//! Caller-facing entry point. Every operation is marshalled onto the task
//! queue's worker thread, which is the only place the manager is touched.

use crate::config::OffloadConfig;
use crate::device::DeviceCatalog;
use crate::error::OffloadError;
use crate::manager::{LoadReport, ManagerStatus, OffloadManager};
use crate::models::{EvictionReport, ModelBuilder, ModelHandle};
use crate::scheduler::{TaskQueue, TaskQueueConfig};
use crate::telemetry;

pub struct OffloadService {
    queue: TaskQueue<OffloadManager>,
}

impl OffloadService {
    /// Move `manager` onto a new worker thread.
    pub fn start(manager: OffloadManager, config: &TaskQueueConfig) -> Result<Self, OffloadError> {
        telemetry::init_metrics();
        let queue = TaskQueue::spawn(manager, config)?;
        tracing::info!("offload service started");
        Ok(Self { queue })
    }

    pub fn from_config(config: &OffloadConfig, catalog: DeviceCatalog) -> Result<Self, OffloadError> {
        Self::start(OffloadManager::from_config(config, catalog), &config.queue)
    }

    /// Tasks waiting behind the one in progress.
    pub fn pending_tasks(&self) -> usize {
        self.queue.len()
    }

    /// Materialize a model on the worker, against the manager's devices.
    pub fn build_model(&self, builder: ModelBuilder) -> Result<ModelHandle, OffloadError> {
        self.queue.run_and_wait("build_model", move |m| m.build_model(builder))?
    }

    /// Blocking load. Must not be called from the worker thread or from
    /// inside an async runtime; use `load_async` there.
    pub fn load(
        &self,
        models: &[ModelHandle],
        memory_required: u64,
        reservation: u64,
    ) -> Result<LoadReport, OffloadError> {
        let models = models.to_vec();
        self.queue
            .run_and_wait("load", move |m| m.load(&models, memory_required, reservation))?
    }

    pub async fn load_async(
        &self,
        models: &[ModelHandle],
        memory_required: u64,
        reservation: u64,
    ) -> Result<LoadReport, OffloadError> {
        let models = models.to_vec();
        let ticket = self
            .queue
            .run("load", move |m| m.load(&models, memory_required, reservation))?;
        ticket.wait_async().await?
    }

    pub fn unload_all(&self) -> Result<EvictionReport, OffloadError> {
        Ok(self.queue.run_and_wait("unload_all", OffloadManager::unload_all)?)
    }

    pub fn cleanup_models(&self) -> Result<EvictionReport, OffloadError> {
        Ok(self.queue.run_and_wait("cleanup_models", OffloadManager::cleanup_models)?)
    }

    pub fn status(&self) -> Result<ManagerStatus, OffloadError> {
        Ok(self.queue.run_and_wait("status", |m| m.status())?)
    }

    /// Fire-and-forget work on the worker. Panics are logged, not returned.
    pub fn submit<F>(&self, label: &'static str, f: F) -> Result<(), OffloadError>
    where
        F: FnOnce(&mut OffloadManager) + Send + 'static,
    {
        Ok(self.queue.submit(label, f)?)
    }

    /// Run `f` on the worker and wait for its result.
    pub fn execute<F, R>(&self, label: &'static str, f: F) -> Result<R, OffloadError>
    where
        F: FnOnce(&mut OffloadManager) -> R + Send + 'static,
        R: Send + 'static,
    {
        Ok(self.queue.run_and_wait(label, f)?)
    }
}
