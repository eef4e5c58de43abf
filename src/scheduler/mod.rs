//! Serialized execution of manager operations.

mod task_queue;

pub use task_queue::{QueueError, TaskQueue, TaskQueueConfig, TaskTicket};
