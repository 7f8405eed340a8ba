//! Dataport Server Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Asynchronous bulk import/export for data models.
//!
//! # Overview
//!
//! - **Job Queue**: tracks job lifecycle, mirrors it to the durable job tables and
//!   runs jobs on a bounded pool ([`jobs::JobQueue`])
//! - **Workers**: format-agnostic import and export pipelines
//!   ([`jobs::ImportWorker`], [`jobs::ExportWorker`])
//! - **Storage**: MinIO/S3 adapter with environment fallback ([`storage::StorageService`])
//! - **Records**: data record access ([`records::RecordStore`])
//! - **HTTP**: a small control surface for submitting, polling and cancelling jobs
//!
//! Codecs live in `dataport_common::codec`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dataport_server::config::JobsConfig;
//! use dataport_server::jobs::{
//!     ExportWorker, ImportWorker, JobQueue, MemoryJobStore, WorkerRegistry,
//! };
//! use dataport_server::records::MemoryRecordStore;
//! use dataport_server::storage::{MemoryBackend, StorageService};
//!
//! let config = JobsConfig::default();
//! let jobs = Arc::new(MemoryJobStore::new());
//! let records = Arc::new(MemoryRecordStore::new());
//! let storage = StorageService::new(Arc::new(MemoryBackend::new()));
//!
//! let workers = WorkerRegistry::new(
//!     Arc::new(ImportWorker::new(jobs.clone(), records.clone(), storage.clone(), config.clone())),
//!     Arc::new(ExportWorker::new(jobs.clone(), records, storage, config.clone())),
//! );
//! let queue = JobQueue::new(jobs, workers, config);
//! ```

pub mod config;
pub mod error;
pub mod features;
pub mod jobs;
pub mod middleware;
pub mod records;
pub mod storage;

// Re-export commonly used types
pub use error::{AppError, JobError, RecordError, StorageError};
