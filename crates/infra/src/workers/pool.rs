//! Worker pool executing dispatched work orders.
//!
//! Workers run on their own threads, fully decoupled from request handling.
//! Each order for a fan-out item is protected by the task-item lock: if the
//! lock is held, someone else is already on it and the worker skips silently.
//! Business collaborators (categorizer, OCR engine, document generator) are
//! opaque processors registered per namespace; their failures are recorded on
//! the item and never propagate.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use docuflow_core::{ItemId, JobId};
use docuflow_jobs::{
    Aggregator, CursorRegistry, ItemStatus, JOBS_TOPIC, JobNamespace, JobStatus, JobStore,
};

use crate::locks::{DEFAULT_ITEM_LOCK_TTL, LeaseGuard, LeaseLock, item_lock_key};

/// One dispatched unit of background work.
///
/// Fan-out jobs dispatch one order per item; single-shot jobs dispatch a
/// single order with no `item_id`.
#[derive(Debug, Clone)]
pub struct WorkOrder {
    pub job_id: JobId,
    pub item_id: Option<ItemId>,
    pub namespace: JobNamespace,
    pub params: serde_json::Value,
}

/// Opaque business collaborator invoked for one unit of work.
pub type UnitProcessor = Box<dyn Fn(&WorkOrder) -> Result<serde_json::Value, String> + Send + Sync>;

/// Hand-off boundary between the enqueue side and the worker pool.
pub trait TaskQueue: Send + Sync {
    fn dispatch(&self, order: WorkOrder) -> Result<(), String>;
}

enum Message {
    Order(WorkOrder),
    Shutdown,
}

/// Cloneable dispatch handle backed by the pool's channel.
#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<Message>,
}

impl TaskQueue for QueueSender {
    fn dispatch(&self, order: WorkOrder) -> Result<(), String> {
        self.tx
            .send(Message::Order(order))
            .map_err(|_| "worker pool is shut down".to_string())
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    /// Name prefix for worker threads and logging.
    pub name: String,
    pub item_lock_ttl: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            name: "job-worker".to_string(),
            item_lock_ttl: DEFAULT_ITEM_LOCK_TTL,
        }
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub orders_processed: u64,
    pub units_succeeded: u64,
    pub units_failed: u64,
    /// Orders dropped because another worker held the item lock.
    pub skipped_locked: u64,
    /// Redeliveries dropped because the item was no longer queued.
    pub skipped_stale: u64,
}

/// Handle to control a running pool.
pub struct WorkerPoolHandle {
    tx: mpsc::Sender<Message>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerPoolHandle {
    /// Request graceful shutdown and wait for workers to drain.
    pub fn shutdown(mut self) {
        for _ in 0..self.joins.len() {
            let _ = self.tx.send(Message::Shutdown);
        }
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap().clone()
    }
}

/// Executes work orders against the store, locks, and aggregator.
pub struct WorkerEngine<S: JobStore + ?Sized> {
    store: Arc<S>,
    locks: Arc<dyn LeaseLock>,
    cursors: Arc<CursorRegistry>,
    processors: HashMap<JobNamespace, UnitProcessor>,
    item_lock_ttl: Duration,
}

impl<S: JobStore + ?Sized + 'static> WorkerEngine<S> {
    pub fn new(store: Arc<S>, locks: Arc<dyn LeaseLock>, cursors: Arc<CursorRegistry>) -> Self {
        Self {
            store,
            locks,
            cursors,
            processors: HashMap::new(),
            item_lock_ttl: DEFAULT_ITEM_LOCK_TTL,
        }
    }

    /// Register the business collaborator for a namespace.
    pub fn register_processor<F>(&mut self, namespace: JobNamespace, processor: F)
    where
        F: Fn(&WorkOrder) -> Result<serde_json::Value, String> + Send + Sync + 'static,
    {
        self.processors.insert(namespace, Box::new(processor));
    }

    /// Spawn the pool; returns a control handle and a dispatch sender.
    pub fn spawn(self, config: WorkerPoolConfig) -> (WorkerPoolHandle, QueueSender)
    where
        S: Send + Sync,
    {
        let (tx, rx) = mpsc::channel::<Message>();
        let rx = Arc::new(Mutex::new(rx));
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let engine = Arc::new(self);

        let item_lock_ttl = config.item_lock_ttl;
        let mut joins = Vec::with_capacity(config.workers);
        for i in 0..config.workers {
            let rx = rx.clone();
            let stats = stats.clone();
            let engine = engine.clone();
            let name = format!("{}-{i}", config.name);
            let join = thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    info!(worker = %name, "worker started");
                    loop {
                        let message = rx.lock().unwrap().recv();
                        match message {
                            Ok(Message::Order(order)) => {
                                let outcome = engine.process_order(&order, item_lock_ttl);
                                let mut s = stats.lock().unwrap();
                                s.orders_processed += 1;
                                match outcome {
                                    OrderOutcome::Succeeded => s.units_succeeded += 1,
                                    OrderOutcome::Failed => s.units_failed += 1,
                                    OrderOutcome::SkippedLocked => s.skipped_locked += 1,
                                    OrderOutcome::SkippedStale => s.skipped_stale += 1,
                                }
                            }
                            Ok(Message::Shutdown) | Err(_) => break,
                        }
                    }
                    info!(worker = %name, "worker stopped");
                })
                .expect("failed to spawn worker thread");
            joins.push(join);
        }

        (
            WorkerPoolHandle {
                tx: tx.clone(),
                joins,
                stats,
            },
            QueueSender { tx },
        )
    }

    /// Execute one order synchronously (also used directly in tests).
    pub fn process_order(&self, order: &WorkOrder, item_lock_ttl: Duration) -> OrderOutcome {
        match order.item_id {
            Some(item_id) => self.process_item(order, item_id, item_lock_ttl),
            None => self.process_single_shot(order),
        }
    }

    fn invoke_processor(&self, order: &WorkOrder) -> Result<serde_json::Value, String> {
        let processor = self
            .processors
            .get(&order.namespace)
            .ok_or_else(|| format!("no processor for namespace: {}", order.namespace))?;

        // Collaborator panics count as unit failures, never as worker crashes.
        match catch_unwind(AssertUnwindSafe(|| processor(order))) {
            Ok(result) => result,
            Err(_) => Err("processor panicked".to_string()),
        }
    }

    fn process_item(
        &self,
        order: &WorkOrder,
        item_id: ItemId,
        item_lock_ttl: Duration,
    ) -> OrderOutcome {
        let key = item_lock_key(order.namespace, item_id);
        let guard = match LeaseGuard::acquire(self.locks.as_ref(), key, item_lock_ttl) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                // Someone else is already on it (redelivery or racing retry).
                debug!(item_id = %item_id, "item lock held, skipping");
                return OrderOutcome::SkippedLocked;
            }
            Err(e) => {
                error!(item_id = %item_id, error = %e, "item lock unavailable");
                return OrderOutcome::Failed;
            }
        };

        // Only queued items are picked up; a terminal or in-progress item
        // observed here means this delivery is stale. The lock was acquired,
        // so this is not lock contention and is counted separately.
        match self.store.get_item(item_id) {
            Ok(Some(item)) if item.status == ItemStatus::Queued => {}
            Ok(_) => {
                debug!(item_id = %item_id, "item not queued, skipping");
                return OrderOutcome::SkippedStale;
            }
            Err(e) => {
                error!(item_id = %item_id, error = %e, "failed to load item");
                return OrderOutcome::Failed;
            }
        }

        if let Err(e) =
            self.store
                .update_item_status(item_id, ItemStatus::Processing, None, None)
        {
            error!(item_id = %item_id, error = %e, "failed to mark item processing");
            return OrderOutcome::Failed;
        }
        self.recompute_and_bump(order.job_id, item_id.to_string(), "item_started");

        let (status, result, error_message, outcome) = match self.invoke_processor(order) {
            Ok(value) => (ItemStatus::DoneSuccess, Some(value), None, OrderOutcome::Succeeded),
            Err(message) => {
                warn!(item_id = %item_id, error = %message, "unit failed");
                (
                    ItemStatus::DoneError,
                    None,
                    Some(message),
                    OrderOutcome::Failed,
                )
            }
        };

        if let Err(e) = self
            .store
            .update_item_status(item_id, status, result, error_message)
        {
            error!(item_id = %item_id, error = %e, "failed to write item result");
            return OrderOutcome::Failed;
        }
        self.recompute_and_bump(order.job_id, item_id.to_string(), "item_done");

        drop(guard);
        outcome
    }

    fn process_single_shot(&self, order: &WorkOrder) -> OrderOutcome {
        let started = self.store.lock_and_apply(order.job_id, &|job, _items| {
            if job.status == JobStatus::Queued {
                job.status = JobStatus::Processing;
                true
            } else {
                false
            }
        });
        if let Err(e) = started {
            error!(job_id = %order.job_id, error = %e, "failed to start single-shot job");
            return OrderOutcome::Failed;
        }
        self.cursors
            .topic(JOBS_TOPIC)
            .bump(order.job_id.to_string(), "job_started");

        let (status, result, error_message, outcome, reason) = match self.invoke_processor(order) {
            Ok(value) => (
                JobStatus::Completed,
                Some(value),
                None,
                OrderOutcome::Succeeded,
                "job_completed",
            ),
            Err(message) => {
                warn!(job_id = %order.job_id, error = %message, "single-shot job failed");
                (
                    JobStatus::Failed,
                    None,
                    Some(message),
                    OrderOutcome::Failed,
                    "job_failed",
                )
            }
        };

        if let Err(e) = self
            .store
            .mark_job_terminal(order.job_id, status, result, error_message)
        {
            error!(job_id = %order.job_id, error = %e, "failed to finish single-shot job");
            return OrderOutcome::Failed;
        }
        self.cursors
            .topic(JOBS_TOPIC)
            .bump(order.job_id.to_string(), reason);
        outcome
    }

    fn recompute_and_bump(&self, job_id: JobId, entity: String, reason: &str) {
        let aggregator = Aggregator::new(self.store.clone());
        match aggregator.recompute(job_id) {
            Ok(job) => {
                let cursor = self.cursors.topic(JOBS_TOPIC);
                cursor.bump(entity, reason);
                if job.status.is_terminal() {
                    let terminal_reason = if job.status == JobStatus::Failed {
                        "job_failed"
                    } else {
                        "job_completed"
                    };
                    cursor.bump(job.id.to_string(), terminal_reason);
                }
            }
            Err(e) => error!(job_id = %job_id, error = %e, "aggregation failed"),
        }
    }
}

/// Result of executing one work order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderOutcome {
    Succeeded,
    Failed,
    /// The item lock was held by another worker.
    SkippedLocked,
    /// The lock was free but the item had already left `Queued`.
    SkippedStale,
}
