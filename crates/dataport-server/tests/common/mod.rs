//! Shared harness for job integration tests
//!
//! Wires a [`JobQueue`] to the in-memory job store, record store and blob
//! backend so whole import/export runs can be driven without Postgres or S3.

#![allow(dead_code)]

use chrono::Utc;
use dataport_common::Row;
use dataport_server::config::JobsConfig;
use dataport_server::jobs::types::{
    ColumnMapping, ExportFilters, ExportJobRecord, FileReference, ImportJobRecord, JobState,
};
use dataport_server::jobs::{
    ExportWorker, ImportWorker, Job, JobKind, JobQueue, MemoryJobStore, WorkerRegistry,
};
use dataport_server::records::MemoryRecordStore;
use dataport_server::storage::{MemoryBackend, StorageService};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Upper bound for a job to reach a terminal status
pub const TERMINAL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub queue: JobQueue,
    pub jobs: Arc<MemoryJobStore>,
    pub records: Arc<MemoryRecordStore>,
    pub blobs: Arc<MemoryBackend>,
    pub config: JobsConfig,
}

impl Harness {
    pub fn new(config: JobsConfig) -> Self {
        Self::build(config, MemoryRecordStore::new(), Some(MemoryBackend::new()))
    }

    /// Harness whose storage service has no backend at all
    pub fn without_storage(config: JobsConfig) -> Self {
        Self::build(config, MemoryRecordStore::new(), None)
    }

    pub fn build(
        config: JobsConfig,
        records: MemoryRecordStore,
        backend: Option<MemoryBackend>,
    ) -> Self {
        let jobs = Arc::new(MemoryJobStore::new());
        let records = Arc::new(records);
        let configured = backend.is_some();
        let blobs = Arc::new(backend.unwrap_or_default());
        let storage = if configured {
            StorageService::new(blobs.clone())
        } else {
            StorageService::unconfigured()
        };

        let workers = WorkerRegistry::new(
            Arc::new(ImportWorker::new(
                jobs.clone(),
                records.clone(),
                storage.clone(),
                config.clone(),
            )),
            Arc::new(ExportWorker::new(
                jobs.clone(),
                records.clone(),
                storage,
                config.clone(),
            )),
        );
        let queue = JobQueue::new(jobs.clone(), workers, config.clone());

        Self {
            queue,
            jobs,
            records,
            blobs,
            config,
        }
    }

    /// Store an import row and hand it to the queue
    pub async fn submit_import(&self, record: ImportJobRecord) -> Uuid {
        let id = record.id;
        let job = record.state.to_job(id, JobKind::Import);
        self.jobs.insert_import(record);
        self.queue.add(job).await;
        id
    }

    /// Store an export row and hand it to the queue
    pub async fn submit_export(&self, record: ExportJobRecord) -> Uuid {
        let id = record.id;
        let job = record.state.to_job(id, JobKind::Export);
        self.jobs.insert_export(record);
        self.queue.add(job).await;
        id
    }

    pub async fn wait_for_terminal(&self, id: Uuid) -> Job {
        wait_for_terminal(&self.queue, id).await
    }

    /// Progress values persisted for `id`, in write order
    pub fn progress_checkpoints(&self, id: Uuid) -> Vec<u8> {
        self.jobs.writes_for(id).iter().map(|w| w.progress).collect()
    }
}

/// Jobs config with small batches so tests cross batch boundaries
pub fn small_batches() -> JobsConfig {
    JobsConfig {
        import_batch_size: 10,
        export_batch_size: 10,
        progress_interval: 10,
        ..JobsConfig::default()
    }
}

/// Poll the queue until the job is terminal
///
/// Panics after [`TERMINAL_TIMEOUT`].
pub async fn wait_for_terminal(queue: &JobQueue, id: Uuid) -> Job {
    let poll = async {
        loop {
            if let Some(job) = queue.get_job(id).await {
                if job.status.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };

    match tokio::time::timeout(TERMINAL_TIMEOUT, poll).await {
        Ok(job) => job,
        Err(_) => panic!("job {} did not reach a terminal status", id),
    }
}

pub fn import_record(
    data_model_id: Uuid,
    file: Option<FileReference>,
    column_mapping: Vec<ColumnMapping>,
) -> ImportJobRecord {
    ImportJobRecord {
        id: Uuid::new_v4(),
        data_model_id,
        column_mapping,
        file,
        state: JobState::pending(Utc::now()),
    }
}

pub fn export_record(
    data_model_id: Uuid,
    format: &str,
    filters: ExportFilters,
    columns: Vec<String>,
) -> ExportJobRecord {
    ExportJobRecord {
        id: Uuid::new_v4(),
        data_model_id,
        format: format.to_string(),
        filters,
        columns,
        state: JobState::pending(Utc::now()),
    }
}

pub fn csv_file(path: &str) -> FileReference {
    FileReference {
        path: path.to_string(),
        name: Some(path.rsplit('/').next().unwrap_or(path).to_string()),
        mime_type: Some("text/csv".to_string()),
    }
}

/// `header` followed by `count` generated lines of `name,age`
pub fn people_csv(count: usize) -> String {
    let mut csv = String::from("name,age");
    for i in 1..=count {
        csv.push_str(&format!("\nperson-{},{}", i, 20 + i));
    }
    csv
}

pub fn row(value: serde_json::Value) -> Row {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected an object, got {}", other),
    }
}
