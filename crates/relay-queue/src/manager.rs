use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use relay_common::{RelayError, RelayResult};

use crate::heap::PriorityQueue;
use crate::semaphore::{InvalidPermits, Lease, Semaphore};

const DEFAULT_MAX_QUEUE_SIZE: usize = 10_000;

/// Admission settings for one manager. A `max_queue_size` of 0 falls back to
/// 10000; a `timeout_ms` of 0 disables the queue-wait timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub max_concurrency: usize,
    #[serde(default)]
    pub max_queue_size: usize,
    #[serde(default)]
    pub timeout_ms: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            max_queue_size: 0,
            timeout_ms: 0,
        }
    }
}

impl ConcurrencyConfig {
    fn effective_queue_size(&self) -> usize {
        if self.max_queue_size == 0 {
            DEFAULT_MAX_QUEUE_SIZE
        } else {
            self.max_queue_size
        }
    }
}

/// What the executor hands back for one upstream attempt. Upstream HTTP
/// status codes pass through here untouched; relay failures travel as
/// `RelayError` instead.
#[derive(Debug, Clone)]
pub struct ProxyResult {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<bytes::Bytes>,
    pub streamed: bool,
    pub duration: Duration,
}

/// The slice of a task the manager needs: identity, ranking, timeout
/// override, and a way to trigger its one-shot cancellation handle.
pub trait QueueTask: Send + Sync + 'static {
    fn id(&self) -> &str;
    fn priority(&self) -> i32;
    fn timeout_override_ms(&self) -> Option<u64> {
        None
    }
    /// Record `reason` on the task and fire its cancellation handle.
    fn cancel(&self, reason: &str);
}

/// Performs the single upstream attempt for an admitted task. The future
/// must resolve on cancellation (the manager never aborts it from outside).
pub trait TaskExecutor: Send + Sync + 'static {
    type Task: QueueTask;
    fn execute(
        &self,
        task: Arc<Self::Task>,
    ) -> Pin<Box<dyn Future<Output = RelayResult<ProxyResult>> + Send>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue_length: usize,
    pub active_workers: usize,
    pub max_concurrency: usize,
    pub total_processed: u64,
    pub total_failed: u64,
    pub avg_wait_ms: u64,
    pub avg_process_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingTask {
    pub id: String,
    pub elapsed_ms: u64,
}

/// One admission pool: a bounded wait queue in front of a bounded worker
/// set. All state lives behind a single mutex; executors run on spawned
/// tasks and re-enter scheduling when they settle.
pub struct ConcurrencyManager<E: TaskExecutor> {
    name: String,
    executor: Arc<E>,
    semaphore: Arc<Semaphore>,
    inner: Mutex<Inner<E::Task>>,
    weak: Weak<Self>,
}

struct Inner<T> {
    queue: PriorityQueue<Queued<T>>,
    running: HashMap<String, Running<T>>,
    shutdown: bool,
    max_concurrency: usize,
    max_queue_size: usize,
    timeout_ms: u64,
    stats: StatsAcc,
}

struct Queued<T> {
    task: Arc<T>,
    queued_at: Instant,
    budget: Option<Duration>,
    responder: oneshot::Sender<RelayResult<ProxyResult>>,
}

struct Running<T> {
    task: Arc<T>,
    started_at: Instant,
}

#[derive(Default)]
struct StatsAcc {
    total_processed: u64,
    total_failed: u64,
    wait_ms_total: u64,
    wait_count: u64,
    process_ms_total: u64,
    process_count: u64,
}

impl StatsAcc {
    fn record_wait(&mut self, waited: Duration) {
        self.wait_ms_total += waited.as_millis() as u64;
        self.wait_count += 1;
    }

    fn record_process(&mut self, took: Duration) {
        self.process_ms_total += took.as_millis() as u64;
        self.process_count += 1;
    }
}

impl<E: TaskExecutor> ConcurrencyManager<E> {
    pub fn new(
        name: impl Into<String>,
        config: ConcurrencyConfig,
        executor: Arc<E>,
    ) -> Result<Arc<Self>, InvalidPermits> {
        let semaphore = Semaphore::new(config.max_concurrency)?;
        Ok(Arc::new_cyclic(|weak| Self {
            name: name.into(),
            executor,
            semaphore,
            inner: Mutex::new(Inner {
                queue: PriorityQueue::new(),
                running: HashMap::new(),
                shutdown: false,
                max_concurrency: config.max_concurrency,
                max_queue_size: config.effective_queue_size(),
                timeout_ms: config.timeout_ms,
                stats: StatsAcc::default(),
            }),
            weak: weak.clone(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admit and run one task. Resolves exactly once: with the executor's
    /// result, or with the error that removed the task from the pipeline.
    /// The worker slot is released before the future resolves.
    pub async fn submit(&self, task: Arc<E::Task>) -> RelayResult<ProxyResult> {
        let rx = self.enqueue(task)?;
        self.process_next();
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RelayError::cancelled("task dropped")),
        }
    }

    fn enqueue(
        &self,
        task: Arc<E::Task>,
    ) -> RelayResult<oneshot::Receiver<RelayResult<ProxyResult>>> {
        let mut inner = self.lock();
        if inner.shutdown {
            return Err(RelayError::cancelled("shutting down"));
        }
        if inner.queue.len() >= inner.max_queue_size {
            return Err(RelayError::QueueFull {
                current_size: inner.queue.len() + inner.running.len(),
                limit: inner.max_queue_size,
            });
        }

        let (tx, rx) = oneshot::channel();
        let budget = effective_budget(task.timeout_override_ms(), inner.timeout_ms);
        let id = task.id().to_string();
        let priority = task.priority();
        inner.queue.enqueue(
            Queued {
                task,
                queued_at: Instant::now(),
                budget,
                responder: tx,
            },
            priority,
        );
        drop(inner);

        tracing::debug!(queue = %self.name, task = %id, priority, "task enqueued");
        if let Some(budget) = budget {
            self.spawn_timer(id, budget);
        }
        Ok(rx)
    }

    /// One scheduling step: pick the highest-ranked waiter and start it if a
    /// worker is free. Expired waiters are rejected along the way. Triggered
    /// on submit, on settle, and on concurrency bumps.
    fn process_next(&self) {
        loop {
            let mut inner = self.lock();
            if inner.shutdown {
                return;
            }
            let Some((queued, priority, seq)) = inner.queue.dequeue_keyed() else {
                return;
            };

            if let Some(budget) = queued.budget {
                let waited = queued.queued_at.elapsed();
                if waited >= budget {
                    inner.stats.record_wait(waited);
                    inner.stats.total_failed += 1;
                    drop(inner);
                    let _ = queued.responder.send(Err(RelayError::QueueTimeout {
                        waited_ms: waited.as_millis() as u64,
                        budget_ms: budget.as_millis() as u64,
                    }));
                    continue;
                }
            }

            let Some(lease) = self.semaphore.try_acquire() else {
                // No worker free. Put the waiter back under its original
                // stamp; its timer still covers the remaining budget.
                inner.queue.restore(queued, priority, seq);
                return;
            };

            let id = queued.task.id().to_string();
            inner.stats.record_wait(queued.queued_at.elapsed());
            inner.running.insert(
                id.clone(),
                Running {
                    task: queued.task.clone(),
                    started_at: Instant::now(),
                },
            );
            drop(inner);

            tracing::debug!(queue = %self.name, task = %id, "task running");
            let future = self.executor.execute(queued.task);
            let responder = queued.responder;
            let manager = self.weak.upgrade().expect("manager still referenced");
            tokio::spawn(async move {
                let started = Instant::now();
                let result = future.await;
                manager.settle(&id, lease, started.elapsed(), responder, result);
            });
            return;
        }
    }

    fn settle(
        &self,
        id: &str,
        lease: Lease,
        took: Duration,
        responder: oneshot::Sender<RelayResult<ProxyResult>>,
        result: RelayResult<ProxyResult>,
    ) {
        {
            let mut inner = self.lock();
            inner.running.remove(id);
            inner.stats.record_process(took);
            match &result {
                Ok(_) => inner.stats.total_processed += 1,
                Err(err) => {
                    inner.stats.total_failed += 1;
                    tracing::warn!(queue = %self.name, task = %id, error = %err, "task failed");
                }
            }
        }
        // Free the worker before the submitter can observe the outcome.
        lease.release();
        let _ = responder.send(result);
        self.process_next();
    }

    /// Remove a queued task (true) or flag a running one (false). Unknown
    /// ids return false.
    pub fn cancel_task(&self, id: &str, reason: &str) -> bool {
        let (removed, running_task) = {
            let mut inner = self.lock();
            match inner.queue.remove(|queued| queued.task.id() == id) {
                Some(queued) => {
                    inner.stats.record_wait(queued.queued_at.elapsed());
                    inner.stats.total_failed += 1;
                    (Some(queued), None)
                }
                None => {
                    let task = inner.running.get(id).map(|running| running.task.clone());
                    (None, task)
                }
            }
        };

        if let Some(queued) = removed {
            queued.task.cancel(reason);
            let _ = queued.responder.send(Err(RelayError::cancelled(reason)));
            return true;
        }
        if let Some(task) = running_task {
            task.cancel(reason);
        }
        false
    }

    /// Drain the wait queue. Unless `silently`, each drained task rejects
    /// with "Queue cleared". Running tasks are untouched.
    pub fn clear_queue(&self, silently: bool) -> usize {
        let drained = {
            let mut inner = self.lock();
            let drained = inner.queue.clear();
            if !silently {
                for queued in &drained {
                    inner.stats.record_wait(queued.queued_at.elapsed());
                    inner.stats.total_failed += 1;
                }
            }
            drained
        };
        let count = drained.len();
        if !silently {
            for queued in drained {
                let _ = queued
                    .responder
                    .send(Err(RelayError::cancelled("Queue cleared")));
            }
        }
        count
    }

    /// Reject all queued tasks with "shutting down" and refuse new submits.
    /// Running tasks finish naturally.
    pub fn shutdown(&self) {
        let drained = {
            let mut inner = self.lock();
            inner.shutdown = true;
            let drained = inner.queue.clear();
            for queued in &drained {
                inner.stats.record_wait(queued.queued_at.elapsed());
                inner.stats.total_failed += 1;
            }
            drained
        };
        for queued in drained {
            let _ = queued
                .responder
                .send(Err(RelayError::cancelled("shutting down")));
        }
    }

    /// Resize the worker bound. Growing fires one scheduling attempt per new
    /// slot; shrinking never preempts running tasks.
    pub fn update_max_concurrency(&self, permits: usize) -> Result<(), InvalidPermits> {
        self.semaphore.update_permits(permits)?;
        let old = {
            let mut inner = self.lock();
            std::mem::replace(&mut inner.max_concurrency, permits)
        };
        if permits > old {
            for _ in 0..permits - old {
                self.process_next();
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        QueueStats {
            queue_length: inner.queue.len(),
            active_workers: inner.running.len(),
            max_concurrency: inner.max_concurrency,
            total_processed: inner.stats.total_processed,
            total_failed: inner.stats.total_failed,
            avg_wait_ms: mean(inner.stats.wait_ms_total, inner.stats.wait_count),
            avg_process_ms: mean(inner.stats.process_ms_total, inner.stats.process_count),
        }
    }

    pub fn processing_tasks(&self) -> Vec<ProcessingTask> {
        let inner = self.lock();
        inner
            .running
            .values()
            .map(|running| ProcessingTask {
                id: running.task.id().to_string(),
                elapsed_ms: running.started_at.elapsed().as_millis() as u64,
            })
            .collect()
    }

    fn spawn_timer(&self, id: String, budget: Duration) {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            if let Some(manager) = weak.upgrade() {
                manager.expire(&id);
            }
        });
    }

    /// Active queue-wait timeout. A task that already left the queue makes
    /// this a stale no-op.
    fn expire(&self, id: &str) {
        let removed = {
            let mut inner = self.lock();
            let removed = inner.queue.remove(|queued| queued.task.id() == id);
            if let Some(queued) = &removed {
                inner.stats.record_wait(queued.queued_at.elapsed());
                inner.stats.total_failed += 1;
            }
            removed
        };
        if let Some(queued) = removed {
            let waited = queued.queued_at.elapsed();
            tracing::debug!(queue = %self.name, task = %id, waited_ms = waited.as_millis() as u64, "queue wait timeout");
            let _ = queued.responder.send(Err(RelayError::QueueTimeout {
                waited_ms: waited.as_millis() as u64,
                budget_ms: queued.budget.map(|b| b.as_millis() as u64).unwrap_or(0),
            }));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<E::Task>> {
        self.inner.lock().expect("manager state poisoned")
    }
}

fn effective_budget(override_ms: Option<u64>, default_ms: u64) -> Option<Duration> {
    let ms = override_ms.unwrap_or(default_ms);
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn mean(total: u64, count: u64) -> u64 {
    if count == 0 { 0 } else { total / count }
}
