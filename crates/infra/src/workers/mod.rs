//! Worker execution units: the background side of the job core.

pub mod pool;

pub use pool::{
    OrderOutcome, QueueSender, TaskQueue, UnitProcessor, WorkOrder, WorkerEngine,
    WorkerPoolConfig, WorkerPoolHandle, WorkerStats,
};
