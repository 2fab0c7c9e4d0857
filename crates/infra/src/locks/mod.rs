//! Short-TTL lease locks: the enqueue guard and the task-item lock.
//!
//! Both are the same primitive — an atomic set-if-absent with expiry — used
//! with different keys, TTLs, and contention policies:
//!
//! - **Enqueue guard** (`enqueue:{namespace}:{owner}[:{scope}]`): held only
//!   across the check/create critical section of an enqueue. The unscoped
//!   key is what serializes the critical section; a scoped key is only held
//!   in addition to it. On contention the caller dedups against the store
//!   instead of erroring.
//! - **Task-item lock** (`item:{namespace}:{item_id}`): held while a worker
//!   processes one item. On contention the worker skips silently.
//!
//! TTL expiry favors liveness over strict mutual exclusion when a holder
//! crashes before releasing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use docuflow_core::{ItemId, OwnerId};
use docuflow_jobs::JobNamespace;
use uuid::Uuid;

#[cfg(feature = "redis")]
pub mod redis;

/// Default TTL for the enqueue guard. The guard only covers the enqueue
/// critical section, not the job's runtime.
pub const DEFAULT_ENQUEUE_GUARD_TTL: Duration = Duration::from_secs(10);

/// Default TTL for the per-item worker lock.
pub const DEFAULT_ITEM_LOCK_TTL: Duration = Duration::from_secs(300);

/// Opaque token proving ownership of an acquired lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken(String);

impl LeaseToken {
    fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Lease lock error (infrastructure failures, not contention).
#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    #[error("lock backend connection error: {0}")]
    Connection(String),
    #[error("lock backend command error: {0}")]
    Command(String),
}

/// Atomic set-if-absent lock with TTL.
///
/// `acquire` returning `None` means another holder currently owns the key;
/// that is contention, not an error.
pub trait LeaseLock: Send + Sync {
    fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LeaseToken>, LockError>;

    /// Release the lease iff `token` still owns it. Releasing an expired or
    /// stolen lease is a no-op.
    fn release(&self, key: &str, token: &LeaseToken) -> Result<(), LockError>;
}

/// Guard key for the dedup critical section of one (namespace, owner, scope).
pub fn enqueue_guard_key(
    namespace: JobNamespace,
    owner_id: OwnerId,
    scope: Option<&str>,
) -> String {
    match scope {
        Some(scope) => format!("enqueue:{}:{}:{}", namespace.as_str(), owner_id, scope),
        None => format!("enqueue:{}:{}", namespace.as_str(), owner_id),
    }
}

/// Lock key protecting a single work item from double execution.
pub fn item_lock_key(namespace: JobNamespace, item_id: ItemId) -> String {
    format!("item:{}:{}", namespace.as_str(), item_id)
}

/// RAII wrapper guaranteeing release on every exit path.
pub struct LeaseGuard<'a> {
    lock: &'a dyn LeaseLock,
    key: String,
    token: Option<LeaseToken>,
}

impl<'a> LeaseGuard<'a> {
    /// Try to acquire `key`; `None` means the lease is currently held.
    pub fn acquire(
        lock: &'a dyn LeaseLock,
        key: impl Into<String>,
        ttl: Duration,
    ) -> Result<Option<Self>, LockError> {
        let key = key.into();
        Ok(lock.acquire(&key, ttl)?.map(|token| Self {
            lock,
            key,
            token: Some(token),
        }))
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(e) = self.lock.release(&self.key, &token) {
                tracing::warn!(key = %self.key, error = %e, "failed to release lease");
            }
        }
    }
}

/// In-memory lease lock for tests/dev (single-process mutual exclusion).
#[derive(Debug, Default)]
pub struct InMemoryLeaseLock {
    leases: Mutex<HashMap<String, (LeaseToken, Instant)>>,
}

impl InMemoryLeaseLock {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn live_lease_count(&self) -> usize {
        self.leases.lock().unwrap().len()
    }
}

impl LeaseLock for InMemoryLeaseLock {
    fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LeaseToken>, LockError> {
        let mut leases = self.leases.lock().unwrap();
        let now = Instant::now();

        // Sweep expired leases so keys abandoned by crashed holders do not
        // accumulate across the process lifetime.
        leases.retain(|_, (_, expires_at)| *expires_at > now);

        if leases.contains_key(key) {
            return Ok(None);
        }

        let token = LeaseToken::generate();
        leases.insert(key.to_string(), (token.clone(), now + ttl));
        Ok(Some(token))
    }

    fn release(&self, key: &str, token: &LeaseToken) -> Result<(), LockError> {
        let mut leases = self.leases.lock().unwrap();
        if let Some((held, _)) = leases.get(key) {
            if held == token {
                leases.remove(key);
            }
        }
        Ok(())
    }
}
