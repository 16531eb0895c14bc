//! Bounded admission and execution: a FIFO counted semaphore, a priority
//! heap, and the concurrency manager that ties them together around a
//! per-task state machine (enqueued → running → resolved).

mod heap;
mod manager;
mod semaphore;

pub use heap::PriorityQueue;
pub use manager::{
    ConcurrencyConfig, ConcurrencyManager, ProcessingTask, ProxyResult, QueueStats, QueueTask,
    TaskExecutor,
};
pub use semaphore::{InvalidPermits, Lease, Semaphore};
