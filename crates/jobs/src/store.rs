//! Job/item state store abstraction and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;

use docuflow_core::{ItemId, JobId, OwnerId};

use super::types::{Item, ItemSpec, ItemStatus, Job, JobNamespace, JobStatus};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("item not found: {0}")]
    ItemNotFound(ItemId),
    #[error("job {0} is terminal and cannot be written again")]
    TerminalJob(JobId),
    #[error("item {item} cannot move {from:?} -> {to:?}")]
    InvalidTransition {
        item: ItemId,
        from: ItemStatus,
        to: ItemStatus,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Persisted state for jobs and their fan-out items.
///
/// All cross-worker coordination funnels through this store plus the two
/// lease locks; no other shared mutable state exists.
pub trait JobStore: Send + Sync {
    /// Create and persist a new job in `Queued` state.
    fn create_job(
        &self,
        namespace: JobNamespace,
        owner_id: OwnerId,
        total_units: u32,
    ) -> Result<Job, JobStoreError>;

    /// Create the fan-out items for a job, in spec order.
    fn create_items(&self, job_id: JobId, specs: Vec<ItemSpec>) -> Result<Vec<Item>, JobStoreError>;

    fn get_job(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    fn get_item(&self, id: ItemId) -> Result<Option<Item>, JobStoreError>;

    /// Items of a job, ordered by `sort_index`.
    fn list_items(&self, job_id: JobId) -> Result<Vec<Item>, JobStoreError>;

    /// Most recent job of this namespace/owner in one of `statuses`.
    ///
    /// Ordered by `created_at` desc then `updated_at` desc so the newest
    /// match wins; this is the dedup lookup for the enqueue guard.
    fn find_latest_inflight(
        &self,
        namespace: JobNamespace,
        owner_id: OwnerId,
        statuses: &[JobStatus],
    ) -> Result<Option<Job>, JobStoreError>;

    /// Write an item status transition (forward-only).
    fn update_item_status(
        &self,
        item_id: ItemId,
        status: ItemStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> Result<Item, JobStoreError>;

    /// Finish a single-shot job. Terminal jobs are never written again.
    fn mark_job_terminal(
        &self,
        job_id: JobId,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> Result<Job, JobStoreError>;

    /// Run `apply` on the job row and its current items under a per-job row
    /// lock, persisting the job iff `apply` returns true.
    ///
    /// Concurrent invocations for the same job serialize; this is what makes
    /// the aggregator's read-modify-write safe under parallel workers.
    fn lock_and_apply(
        &self,
        job_id: JobId,
        apply: &dyn Fn(&mut Job, &[Item]) -> bool,
    ) -> Result<Job, JobStoreError>;

    /// Delete a job together with all of its items.
    fn delete_job(&self, job_id: JobId) -> Result<(), JobStoreError>;
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    items: RwLock<HashMap<ItemId, Item>>,
    // Per-job entry mutexes backing `lock_and_apply` (the "row lock").
    row_locks: Mutex<HashMap<JobId, Arc<Mutex<()>>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn row_lock(&self, job_id: JobId) -> Arc<Mutex<()>> {
        let mut locks = self.row_locks.lock().unwrap();
        locks.entry(job_id).or_default().clone()
    }
}

impl JobStore for InMemoryJobStore {
    fn create_job(
        &self,
        namespace: JobNamespace,
        owner_id: OwnerId,
        total_units: u32,
    ) -> Result<Job, JobStoreError> {
        let job = Job::new(namespace, owner_id, total_units);
        self.jobs.write().unwrap().insert(job.id, job.clone());
        Ok(job)
    }

    fn create_items(&self, job_id: JobId, specs: Vec<ItemSpec>) -> Result<Vec<Item>, JobStoreError> {
        if !self.jobs.read().unwrap().contains_key(&job_id) {
            return Err(JobStoreError::NotFound(job_id));
        }
        let mut items = self.items.write().unwrap();
        let created: Vec<Item> = specs
            .into_iter()
            .enumerate()
            .map(|(i, spec)| Item::new(job_id, i as u32, spec))
            .collect();
        for item in &created {
            items.insert(item.id, item.clone());
        }
        Ok(created)
    }

    fn get_job(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.read().unwrap().get(&id).cloned())
    }

    fn get_item(&self, id: ItemId) -> Result<Option<Item>, JobStoreError> {
        Ok(self.items.read().unwrap().get(&id).cloned())
    }

    fn list_items(&self, job_id: JobId) -> Result<Vec<Item>, JobStoreError> {
        let items = self.items.read().unwrap();
        let mut result: Vec<Item> = items
            .values()
            .filter(|i| i.job_id == job_id)
            .cloned()
            .collect();
        result.sort_by_key(|i| i.sort_index);
        Ok(result)
    }

    fn find_latest_inflight(
        &self,
        namespace: JobNamespace,
        owner_id: OwnerId,
        statuses: &[JobStatus],
    ) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut matches: Vec<&Job> = jobs
            .values()
            .filter(|j| {
                j.namespace == namespace && j.owner_id == owner_id && statuses.contains(&j.status)
            })
            .collect();
        matches.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.updated_at.cmp(&a.updated_at))
        });
        Ok(matches.first().map(|j| (*j).clone()))
    }

    fn update_item_status(
        &self,
        item_id: ItemId,
        status: ItemStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> Result<Item, JobStoreError> {
        let mut items = self.items.write().unwrap();
        let item = items
            .get_mut(&item_id)
            .ok_or(JobStoreError::ItemNotFound(item_id))?;

        if !item.status.can_transition_to(status) {
            return Err(JobStoreError::InvalidTransition {
                item: item_id,
                from: item.status,
                to: status,
            });
        }

        item.status = status;
        item.result = result;
        item.error_message = error_message;
        item.updated_at = Utc::now();
        Ok(item.clone())
    }

    fn mark_job_terminal(
        &self,
        job_id: JobId,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        if job.status.is_terminal() {
            return Err(JobStoreError::TerminalJob(job_id));
        }

        job.status = status;
        job.processed_units = job.total_units;
        if status == JobStatus::Completed {
            job.progress = 100;
        }
        job.result = result;
        job.error_message = error_message;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    fn lock_and_apply(
        &self,
        job_id: JobId,
        apply: &dyn Fn(&mut Job, &[Item]) -> bool,
    ) -> Result<Job, JobStoreError> {
        let row_lock = self.row_lock(job_id);
        let _held = row_lock.lock().unwrap();

        let items = self.list_items(job_id)?;
        let mut job = self
            .get_job(job_id)?
            .ok_or(JobStoreError::NotFound(job_id))?;

        if apply(&mut job, &items) {
            job.updated_at = Utc::now();
            self.jobs.write().unwrap().insert(job.id, job.clone());
        }
        Ok(job)
    }

    fn delete_job(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let removed = self.jobs.write().unwrap().remove(&job_id);
        if removed.is_none() {
            return Err(JobStoreError::NotFound(job_id));
        }
        // Items are exclusively owned by the job; they go with it.
        self.items
            .write()
            .unwrap()
            .retain(|_, item| item.job_id != job_id);
        self.row_locks.lock().unwrap().remove(&job_id);
        Ok(())
    }
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn create_job(
        &self,
        namespace: JobNamespace,
        owner_id: OwnerId,
        total_units: u32,
    ) -> Result<Job, JobStoreError> {
        (**self).create_job(namespace, owner_id, total_units)
    }

    fn create_items(&self, job_id: JobId, specs: Vec<ItemSpec>) -> Result<Vec<Item>, JobStoreError> {
        (**self).create_items(job_id, specs)
    }

    fn get_job(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get_job(id)
    }

    fn get_item(&self, id: ItemId) -> Result<Option<Item>, JobStoreError> {
        (**self).get_item(id)
    }

    fn list_items(&self, job_id: JobId) -> Result<Vec<Item>, JobStoreError> {
        (**self).list_items(job_id)
    }

    fn find_latest_inflight(
        &self,
        namespace: JobNamespace,
        owner_id: OwnerId,
        statuses: &[JobStatus],
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).find_latest_inflight(namespace, owner_id, statuses)
    }

    fn update_item_status(
        &self,
        item_id: ItemId,
        status: ItemStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> Result<Item, JobStoreError> {
        (**self).update_item_status(item_id, status, result, error_message)
    }

    fn mark_job_terminal(
        &self,
        job_id: JobId,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> Result<Job, JobStoreError> {
        (**self).mark_job_terminal(job_id, status, result, error_message)
    }

    fn lock_and_apply(
        &self,
        job_id: JobId,
        apply: &dyn Fn(&mut Job, &[Item]) -> bool,
    ) -> Result<Job, JobStoreError> {
        (**self).lock_and_apply(job_id, apply)
    }

    fn delete_job(&self, job_id: JobId) -> Result<(), JobStoreError> {
        (**self).delete_job(job_id)
    }
}
