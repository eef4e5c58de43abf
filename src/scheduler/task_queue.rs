//! Single worker thread that owns the manager state.
//!
//! Tasks run one at a time, in submission order, against `&mut S`. Callers
//! either fire and forget, block on a ticket, or await it. While idle the
//! worker waits with an exponential backoff that resets when work arrives.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::telemetry;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task '{task}' panicked: {message}")]
    TaskPanicked { task: String, message: String },

    #[error("worker has stopped")]
    WorkerStopped,

    #[error("blocking submission from the worker thread would deadlock")]
    Reentrant,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Idle backoff bounds for the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskQueueConfig {
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            backoff_min_ms: 1,
            backoff_max_ms: 64,
        }
    }
}

impl TaskQueueConfig {
    fn bounds(&self) -> (Duration, Duration) {
        let min = self.backoff_min_ms.max(1);
        let max = self.backoff_max_ms.max(min);
        (Duration::from_millis(min), Duration::from_millis(max))
    }
}

type Job<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

struct Task<S> {
    label: &'static str,
    job: Job<S>,
}

struct Shared<S> {
    tasks: Mutex<VecDeque<Task<S>>>,
    available: Condvar,
    stopping: AtomicBool,
}

/// Pending result of a task submitted with `run`.
pub struct TaskTicket<R> {
    rx: oneshot::Receiver<Result<R, QueueError>>,
}

impl<R> TaskTicket<R> {
    /// Block the current thread until the task finishes. Must not be called
    /// from inside an async runtime; use `wait_async` there.
    pub fn wait(self) -> Result<R, QueueError> {
        self.rx.blocking_recv().map_err(|_| QueueError::WorkerStopped)?
    }

    pub async fn wait_async(self) -> Result<R, QueueError> {
        self.rx.await.map_err(|_| QueueError::WorkerStopped)?
    }
}

/// FIFO of closures executed on a dedicated thread that owns `S`.
pub struct TaskQueue<S: Send + 'static> {
    shared: Arc<Shared<S>>,
    worker: Option<JoinHandle<()>>,
    worker_thread: ThreadId,
}

impl<S: Send + 'static> TaskQueue<S> {
    /// Move `state` onto a new worker thread.
    pub fn spawn(state: S, config: &TaskQueueConfig) -> Result<Self, QueueError> {
        let shared = Arc::new(Shared {
            tasks: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stopping: AtomicBool::new(false),
        });
        let bounds = config.bounds();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("gg-offload-worker".into())
            .spawn(move || worker_loop(state, &worker_shared, bounds))?;
        let worker_thread = worker.thread().id();
        tracing::debug!(min_ms = bounds.0.as_millis() as u64, max_ms = bounds.1.as_millis() as u64, "task queue started");
        Ok(Self {
            shared,
            worker: Some(worker),
            worker_thread,
        })
    }

    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_thread
    }

    /// Tasks waiting to run, not counting the one in progress.
    pub fn len(&self) -> usize {
        self.shared.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, label: &'static str, job: Job<S>) -> Result<(), QueueError> {
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(QueueError::WorkerStopped);
        }
        let depth = {
            let mut tasks = self.shared.tasks.lock();
            tasks.push_back(Task { label, job });
            tasks.len()
        };
        self.shared.available.notify_one();
        telemetry::record_queue_depth(depth);
        Ok(())
    }

    /// Enqueue without waiting. A panic is logged and otherwise dropped.
    pub fn submit<F>(&self, label: &'static str, f: F) -> Result<(), QueueError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.push(label, Box::new(f))
    }

    /// Enqueue and get a ticket for the result.
    pub fn run<F, R>(&self, label: &'static str, f: F) -> Result<TaskTicket<R>, QueueError>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = move |state: &mut S| {
            let result = panic::catch_unwind(AssertUnwindSafe(|| f(state))).map_err(|payload| {
                QueueError::TaskPanicked {
                    task: label.to_string(),
                    message: panic_message(payload.as_ref()),
                }
            });
            // The caller may have dropped its ticket.
            let _ = tx.send(result);
        };
        self.push(label, Box::new(job))?;
        Ok(TaskTicket { rx })
    }

    /// Enqueue and block until the task finishes.
    pub fn run_and_wait<F, R>(&self, label: &'static str, f: F) -> Result<R, QueueError>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_worker_thread() {
            return Err(QueueError::Reentrant);
        }
        self.run(label, f)?.wait()
    }
}

impl<S: Send + 'static> Drop for TaskQueue<S> {
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.available.notify_all();
        let Some(worker) = self.worker.take() else { return };
        if self.is_worker_thread() {
            return;
        }
        if worker.join().is_err() {
            tracing::error!("task queue worker panicked during shutdown");
        }
    }
}

fn worker_loop<S>(mut state: S, shared: &Shared<S>, (min, max): (Duration, Duration)) {
    let mut backoff = min;
    loop {
        let next = {
            let mut tasks = shared.tasks.lock();
            loop {
                if let Some(task) = tasks.pop_front() {
                    break Some(task);
                }
                if shared.stopping.load(Ordering::Acquire) {
                    break None;
                }
                if shared.available.wait_for(&mut tasks, backoff).timed_out() {
                    backoff = (backoff * 2).min(max);
                }
            }
        };
        let Some(task) = next else { break };
        backoff = min;

        let label = task.label;
        let job = task.job;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job(&mut state))) {
            tracing::error!(task = label, message = %panic_message(payload.as_ref()), "queued task panicked");
        }
    }
    tracing::debug!("task queue worker exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
#[path = "task_queue_tests.rs"]
mod tests;
