//! Infrastructure layer: lease locks, durable job store, worker pool, and
//! the dedup-aware enqueue service.

pub mod enqueue;
pub mod locks;
pub mod store;
pub mod workers;


pub use enqueue::{EnqueueError, EnqueueOutcome, EnqueueRequest, EnqueueService};
pub use locks::{
    DEFAULT_ENQUEUE_GUARD_TTL, DEFAULT_ITEM_LOCK_TTL, InMemoryLeaseLock, LeaseGuard, LeaseLock,
    LeaseToken, LockError, enqueue_guard_key, item_lock_key,
};
pub use store::PostgresJobStore;
pub use workers::{
    OrderOutcome, QueueSender, TaskQueue, UnitProcessor, WorkOrder, WorkerEngine, WorkerPoolConfig,
    WorkerPoolHandle, WorkerStats,
};

#[cfg(feature = "redis")]
pub use locks::redis::RedisLeaseLock;
