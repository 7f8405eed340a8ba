//! Bulk import/export jobs
//!
//! - [`queue`]: in-memory job map, bounded dispatcher and lease sweep
//! - [`import`] / [`export`]: the two workers
//! - [`store`] / [`memory`]: durable job rows, in Postgres or in memory
//! - [`types`]: job model and lifecycle rules

pub mod export;
pub mod import;
pub mod memory;
pub mod queue;
pub mod store;
pub mod types;

pub use export::ExportWorker;
pub use import::ImportWorker;
pub use memory::MemoryJobStore;
pub use queue::{JobHandle, JobQueue, JobWorker, WorkerRegistry};
pub use store::{JobStore, PgJobStore};
pub use types::{Job, JobKind, JobResult, JobStatus, JobUpdate};
