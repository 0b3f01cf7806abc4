//! Estimate job lifecycle: storage, the manager and background workers.

pub mod manager;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod worker;

pub use manager::{JobManager, ProcessOutcome};
pub use memory::InMemoryJobStore;
pub use postgres::PgJobStore;
pub use store::{ClaimOutcome, Completion, JobStore, RecoveredJob, SweptJob};
pub use worker::WorkerPool;
