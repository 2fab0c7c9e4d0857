//! Durable store implementations for jobs and items.

pub mod postgres;

pub use postgres::PostgresJobStore;
