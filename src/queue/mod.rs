//! Work queues feeding the per-kind reconcile workers

mod task_queue;

pub use task_queue::{TaskQueue, TaskQueueConfig};
