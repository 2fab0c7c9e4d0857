//! Dedup-aware enqueue: the boundary operation that turns a trigger request
//! into at most one inflight job.
//!
//! The sequence is check → lock → re-check → create → dispatch, with the
//! guard released on every exit path. The first check runs outside any lock,
//! so a second check inside the critical section is required to close the
//! race between it and acquisition. When the guard itself is contended, the
//! racing caller is very likely about to create exactly the job we want, so
//! we re-query for it before surfacing a retry-later error.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use docuflow_core::OwnerId;
use docuflow_jobs::{
    CursorRegistry, ItemSpec, JOBS_TOPIC, Job, JobNamespace, JobStatus, JobStore, JobStoreError,
};

use crate::locks::{DEFAULT_ENQUEUE_GUARD_TTL, LeaseGuard, LeaseLock, LockError, enqueue_guard_key};
use crate::workers::{TaskQueue, WorkOrder};

/// One logical trigger of a background operation.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub namespace: JobNamespace,
    pub owner_id: OwnerId,
    /// Optional guard scope (e.g. an export query hash), held as an extra
    /// scoped guard. Exclusion and dedup stay per namespace/owner.
    pub scope: Option<String>,
    /// Namespace-specific parameters for single-shot jobs.
    pub params: serde_json::Value,
    /// Fan-out unit specs; required for fan-out namespaces.
    pub units: Vec<ItemSpec>,
}

/// Result of an enqueue attempt that produced (or found) a job.
#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub job: Job,
    /// False when an already-inflight job was returned instead.
    pub queued: bool,
    pub deduplicated: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// Guard contended and no inflight job discoverable; caller should retry
    /// shortly (HTTP 429).
    #[error("another request is enqueuing this operation; try again shortly")]
    Contended,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

pub struct EnqueueService<S: JobStore + ?Sized> {
    store: Arc<S>,
    guard: Arc<dyn LeaseLock>,
    queue: Arc<dyn TaskQueue>,
    cursors: Arc<CursorRegistry>,
    guard_ttl: Duration,
}

impl<S: JobStore + ?Sized> EnqueueService<S> {
    pub fn new(
        store: Arc<S>,
        guard: Arc<dyn LeaseLock>,
        queue: Arc<dyn TaskQueue>,
        cursors: Arc<CursorRegistry>,
    ) -> Self {
        Self {
            store,
            guard,
            queue,
            cursors,
            guard_ttl: DEFAULT_ENQUEUE_GUARD_TTL,
        }
    }

    pub fn with_guard_ttl(mut self, ttl: Duration) -> Self {
        self.guard_ttl = ttl;
        self
    }

    /// Run one trigger request through the full check/lock/re-check/create
    /// sequence. Exactly one job is created per logical trigger, regardless
    /// of request concurrency.
    pub fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome, EnqueueError> {
        self.validate(&request)?;

        // Step 1: cheap check outside any lock.
        if let Some(job) = self.check_inflight(&request)? {
            return Ok(Self::deduplicated(job));
        }

        // Step 2: acquire the guards; on contention, the competing request is
        // probably creating the job right now. Exclusion comes from the
        // owner-wide key: the inflight lookup ignores scope, so two requests
        // differing only in scope must still serialize on the same guard.
        // The scoped key, when present, is held on top so same-scope callers
        // back off before ever touching the shared key.
        let _scope_guard = match request.scope.as_deref() {
            Some(scope) => {
                let key = enqueue_guard_key(request.namespace, request.owner_id, Some(scope));
                match LeaseGuard::acquire(self.guard.as_ref(), key.clone(), self.guard_ttl)? {
                    Some(guard) => Some(guard),
                    None => {
                        debug!(key = %key, "scoped enqueue guard contended");
                        return self.contended(&request);
                    }
                }
            }
            None => None,
        };
        let key = enqueue_guard_key(request.namespace, request.owner_id, None);
        let guard = match LeaseGuard::acquire(self.guard.as_ref(), key.clone(), self.guard_ttl)? {
            Some(guard) => guard,
            None => {
                debug!(key = %key, "enqueue guard contended, re-checking for inflight job");
                return self.contended(&request);
            }
        };

        // Step 3: re-check inside the critical section; step 1 raced against
        // whoever held the guard before us.
        if let Some(job) = self.check_inflight(&request)? {
            return Ok(Self::deduplicated(job));
        }

        // Step 4: create and dispatch. The guard is dropped (released) on
        // every path out of this scope.
        let outcome = self.create_and_dispatch(&request);
        drop(guard);
        outcome
    }

    fn validate(&self, request: &EnqueueRequest) -> Result<(), EnqueueError> {
        if request.namespace.is_fan_out() {
            if request.units.is_empty() {
                return Err(EnqueueError::Validation(format!(
                    "{} requires at least one unit",
                    request.namespace
                )));
            }
        } else if !request.units.is_empty() {
            return Err(EnqueueError::Validation(format!(
                "{} is single-shot and takes no units",
                request.namespace
            )));
        }
        Ok(())
    }

    /// Fallback when a guard is held elsewhere: the holder has either created
    /// the job already (dedup against it) or is about to (retry later).
    fn contended(&self, request: &EnqueueRequest) -> Result<EnqueueOutcome, EnqueueError> {
        if let Some(job) = self.check_inflight(request)? {
            return Ok(Self::deduplicated(job));
        }
        Err(EnqueueError::Contended)
    }

    fn check_inflight(&self, request: &EnqueueRequest) -> Result<Option<Job>, EnqueueError> {
        Ok(self.store.find_latest_inflight(
            request.namespace,
            request.owner_id,
            JobStatus::INFLIGHT,
        )?)
    }

    fn deduplicated(job: Job) -> EnqueueOutcome {
        debug!(job_id = %job.id, "returning already-inflight job");
        EnqueueOutcome {
            job,
            queued: false,
            deduplicated: true,
        }
    }

    fn create_and_dispatch(&self, request: &EnqueueRequest) -> Result<EnqueueOutcome, EnqueueError> {
        let job = self.store.create_job(
            request.namespace,
            request.owner_id,
            request.units.len() as u32,
        )?;

        let orders: Vec<WorkOrder> = if request.namespace.is_fan_out() {
            let items = self.store.create_items(job.id, request.units.clone())?;
            items
                .into_iter()
                .map(|item| WorkOrder {
                    job_id: job.id,
                    item_id: Some(item.id),
                    namespace: request.namespace,
                    params: item.payload,
                })
                .collect()
        } else {
            vec![WorkOrder {
                job_id: job.id,
                item_id: None,
                namespace: request.namespace,
                params: request.params.clone(),
            }]
        };

        for order in orders {
            self.queue.dispatch(order).map_err(EnqueueError::Dispatch)?;
        }

        self.cursors
            .topic(JOBS_TOPIC)
            .bump(job.id.to_string(), "job_created");
        info!(
            job_id = %job.id,
            namespace = %request.namespace,
            owner_id = %request.owner_id,
            units = request.units.len(),
            "job enqueued"
        );

        Ok(EnqueueOutcome {
            job,
            queued: true,
            deduplicated: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::InMemoryLeaseLock;
    use std::sync::Mutex;

    use docuflow_jobs::InMemoryJobStore;

    /// Queue stub capturing dispatched orders.
    #[derive(Default)]
    struct RecordingQueue {
        orders: Mutex<Vec<WorkOrder>>,
    }

    impl TaskQueue for RecordingQueue {
        fn dispatch(&self, order: WorkOrder) -> Result<(), String> {
            self.orders.lock().unwrap().push(order);
            Ok(())
        }
    }

    fn service() -> (
        EnqueueService<InMemoryJobStore>,
        Arc<InMemoryJobStore>,
        Arc<InMemoryLeaseLock>,
        Arc<RecordingQueue>,
    ) {
        let store = InMemoryJobStore::arc();
        let locks = Arc::new(InMemoryLeaseLock::new());
        let queue = Arc::new(RecordingQueue::default());
        let cursors = CursorRegistry::arc();
        let service = EnqueueService::new(
            store.clone(),
            locks.clone(),
            queue.clone(),
            cursors,
        );
        (service, store, locks, queue)
    }

    fn categorization_request(owner: OwnerId, units: usize) -> EnqueueRequest {
        EnqueueRequest {
            namespace: JobNamespace::DocumentCategorization,
            owner_id: owner,
            scope: None,
            params: serde_json::json!({}),
            units: (0..units)
                .map(|i| ItemSpec {
                    label: format!("doc-{i}.pdf"),
                    payload: serde_json::json!({"index": i}),
                })
                .collect(),
        }
    }

    #[test]
    fn enqueue_creates_job_and_dispatches_per_item() {
        let (service, store, _locks, queue) = service();
        let owner = OwnerId::new();

        let outcome = service.enqueue(categorization_request(owner, 3)).unwrap();
        assert!(outcome.queued);
        assert!(!outcome.deduplicated);
        assert_eq!(outcome.job.total_units, 3);

        assert_eq!(store.list_items(outcome.job.id).unwrap().len(), 3);
        let orders = queue.orders.lock().unwrap();
        assert_eq!(orders.len(), 3);
        assert!(orders.iter().all(|o| o.item_id.is_some()));
    }

    #[test]
    fn second_enqueue_deduplicates() {
        let (service, _store, _locks, queue) = service();
        let owner = OwnerId::new();

        let first = service.enqueue(categorization_request(owner, 2)).unwrap();
        let second = service.enqueue(categorization_request(owner, 2)).unwrap();

        assert!(second.deduplicated);
        assert!(!second.queued);
        assert_eq!(second.job.id, first.job.id);
        // Nothing new was dispatched for the dedup.
        assert_eq!(queue.orders.lock().unwrap().len(), 2);
    }

    #[test]
    fn contended_guard_with_no_job_is_retry_later() {
        let (service, _store, locks, _queue) = service();
        let owner = OwnerId::new();

        // Simulate a racing request holding the guard without having created
        // the job yet.
        let key = enqueue_guard_key(JobNamespace::DocumentCategorization, owner, None);
        let _held = locks.acquire(&key, Duration::from_secs(10)).unwrap().unwrap();

        let err = service
            .enqueue(categorization_request(owner, 1))
            .unwrap_err();
        assert!(matches!(err, EnqueueError::Contended));
    }

    #[test]
    fn contended_guard_dedups_when_job_exists() {
        let (service, store, locks, _queue) = service();
        let owner = OwnerId::new();

        // The racing request already created its job but still holds the
        // guard.
        let existing = store
            .create_job(JobNamespace::DocumentCategorization, owner, 1)
            .unwrap();
        let key = enqueue_guard_key(JobNamespace::DocumentCategorization, owner, None);
        let _held = locks.acquire(&key, Duration::from_secs(10)).unwrap().unwrap();

        let outcome = service.enqueue(categorization_request(owner, 1)).unwrap();
        assert!(outcome.deduplicated);
        assert_eq!(outcome.job.id, existing.id);
    }

    #[test]
    fn guard_is_released_after_enqueue() {
        let (service, _store, locks, _queue) = service();
        let owner = OwnerId::new();

        service.enqueue(categorization_request(owner, 1)).unwrap();

        let key = enqueue_guard_key(JobNamespace::DocumentCategorization, owner, None);
        assert!(
            locks
                .acquire(&key, Duration::from_secs(1))
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn dedup_lookup_ignores_scope() {
        let (service, _store, _locks, _queue) = service();
        let owner = OwnerId::new();

        let export = |scope: &str| EnqueueRequest {
            namespace: JobNamespace::BulkExport,
            owner_id: owner,
            scope: Some(scope.to_string()),
            params: serde_json::json!({"query": scope}),
            units: Vec::new(),
        };

        let first = service.enqueue(export("q-1")).unwrap();
        assert!(first.queued);
        // Dedup still applies: inflight lookup is per namespace/owner, and
        // the first export is still queued.
        let second = service.enqueue(export("q-2")).unwrap();
        assert!(second.deduplicated);
        assert_eq!(second.job.id, first.job.id);
    }

    fn export_request(owner: OwnerId, scope: &str) -> EnqueueRequest {
        EnqueueRequest {
            namespace: JobNamespace::BulkExport,
            owner_id: owner,
            scope: Some(scope.to_string()),
            params: serde_json::json!({"query": scope}),
            units: Vec::new(),
        }
    }

    #[test]
    fn scoped_triggers_share_the_owner_guard() {
        let (service, _store, locks, _queue) = service();
        let owner = OwnerId::new();

        // A racing request inside its critical section holds the owner-wide
        // key. A trigger carrying a different scope must not slip past it.
        let key = enqueue_guard_key(JobNamespace::BulkExport, owner, None);
        let _held = locks.acquire(&key, Duration::from_secs(10)).unwrap().unwrap();

        let err = service.enqueue(export_request(owner, "q-2")).unwrap_err();
        assert!(matches!(err, EnqueueError::Contended));
    }

    #[test]
    fn concurrent_triggers_with_distinct_scopes_create_one_job() {
        let (service, _store, _locks, _queue) = service();
        let service = Arc::new(service);
        let owner = OwnerId::new();

        let mut handles = Vec::new();
        for i in 0..8 {
            let service = service.clone();
            handles.push(std::thread::spawn(move || {
                loop {
                    match service.enqueue(export_request(owner, &format!("q-{i}"))) {
                        Ok(outcome) => return outcome,
                        Err(EnqueueError::Contended) => std::thread::yield_now(),
                        Err(e) => panic!("unexpected enqueue error: {e}"),
                    }
                }
            }));
        }
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(outcomes.iter().filter(|o| o.queued).count(), 1);
        let job_id = outcomes[0].job.id;
        assert!(outcomes.iter().all(|o| o.job.id == job_id));
    }

    #[test]
    fn both_guards_are_released_after_scoped_enqueue() {
        let (service, _store, locks, _queue) = service();
        let owner = OwnerId::new();

        let outcome = service.enqueue(export_request(owner, "q-1")).unwrap();
        assert!(outcome.queued);

        for scope in [None, Some("q-1")] {
            let key = enqueue_guard_key(JobNamespace::BulkExport, owner, scope);
            assert!(
                locks
                    .acquire(&key, Duration::from_secs(1))
                    .unwrap()
                    .is_some()
            );
        }
    }

    #[test]
    fn fan_out_without_units_is_rejected_before_any_job() {
        let (service, store, _locks, _queue) = service();
        let owner = OwnerId::new();

        let err = service
            .enqueue(categorization_request(owner, 0))
            .unwrap_err();
        assert!(matches!(err, EnqueueError::Validation(_)));
        assert!(
            store
                .find_latest_inflight(
                    JobNamespace::DocumentCategorization,
                    owner,
                    JobStatus::INFLIGHT
                )
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn single_shot_with_units_is_rejected() {
        let (service, _store, _locks, _queue) = service();
        let err = service
            .enqueue(EnqueueRequest {
                namespace: JobNamespace::Backup,
                owner_id: OwnerId::new(),
                scope: None,
                params: serde_json::json!({}),
                units: vec![ItemSpec {
                    label: "x".into(),
                    payload: serde_json::json!({}),
                }],
            })
            .unwrap_err();
        assert!(matches!(err, EnqueueError::Validation(_)));
    }
}
