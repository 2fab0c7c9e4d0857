//! `docuflow-jobs` — job/item state machines, progress aggregation, and
//! stream cursors.
//!
//! ## Design
//!
//! - Jobs are owner-scoped parents; fan-out jobs own one item per unit
//! - Statuses are closed enums; item transitions are forward-only
//! - The aggregator recomputes counters from the item rows, never increments
//! - Stream cursors make change detection O(1) for SSE consumers
//!
//! ## Components
//!
//! - `Job`/`Item`: persisted state machines
//! - `JobStore`: persistence trait (in-memory here, Postgres in infra)
//! - `Aggregator`: row-locked recompute of counters and derived status
//! - `CursorRegistry`: per-topic monotonic counters

pub mod aggregate;
pub mod cursor;
pub mod store;
pub mod types;

pub use aggregate::{Aggregator, Tally, apply_tally, tally};
pub use cursor::{CursorEvent, CursorRegistry, JOBS_TOPIC, TopicCursor};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{Item, ItemSpec, ItemStatus, Job, JobNamespace, JobStatus};
