//! Export worker
//!
//! Collects every matching record, encodes the lot and uploads a single file.
//! Nothing is uploaded unless every step succeeds.

use async_trait::async_trait;
use chrono::Utc;
use dataport_common::{codec, FileFormat, Row};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::queue::{JobHandle, JobWorker};
use super::store::JobStore;
use super::types::{running_progress, ExportResult, JobResult};
use crate::config::JobsConfig;
use crate::error::JobError;
use crate::records::{DataRecord, RecordStore};
use crate::storage::StorageService;

/// Storage prefix of export files
pub const EXPORT_PREFIX: &str = "exports";

pub struct ExportWorker {
    jobs: Arc<dyn JobStore>,
    records: Arc<dyn RecordStore>,
    storage: StorageService,
    config: JobsConfig,
}

impl ExportWorker {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        records: Arc<dyn RecordStore>,
        storage: StorageService,
        config: JobsConfig,
    ) -> Self {
        Self {
            jobs,
            records,
            storage,
            config,
        }
    }
}

/// `id`, every payload key in first-seen order, then the timestamps
fn default_columns(records: &[DataRecord]) -> Vec<String> {
    if records.is_empty() {
        return Vec::new();
    }

    let mut columns = vec!["id".to_string()];
    for record in records {
        for key in record.payload.keys() {
            if matches!(key.as_str(), "id" | "created_at" | "updated_at") {
                continue;
            }
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }
    columns.push("created_at".to_string());
    columns.push("updated_at".to_string());
    columns
}

pub fn export_file_name(job_id: uuid::Uuid, format: FileFormat) -> String {
    format!(
        "export_{}_{}.{}",
        job_id,
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        format.extension()
    )
}

#[async_trait]
impl JobWorker for ExportWorker {
    #[instrument(skip_all, fields(job_id = %handle.id()))]
    async fn run(&self, handle: &JobHandle) -> Result<JobResult, JobError> {
        let record = self
            .jobs
            .load_export_job(handle.id())
            .await?
            .ok_or(JobError::JobNotFound(handle.id()))?;
        let format: FileFormat = record
            .format
            .parse()
            .map_err(|_| JobError::UnsupportedFormat(record.format.clone()))?;

        let total = self
            .records
            .count_matching(record.data_model_id, &record.filters)
            .await?;
        handle.set_total_rows(total).await?;
        info!(rows = total, format = %format, "Export started");

        let batch_size = self.config.export_batch_size.max(1) as i64;
        let mut records: Vec<DataRecord> = Vec::with_capacity(usize::try_from(total).unwrap_or(0));
        let mut offset: i64 = 0;

        while offset < total {
            let batch = self
                .records
                .fetch_batch(record.data_model_id, &record.filters, offset, batch_size)
                .await?;
            let fetched = batch.len() as i64;
            debug!(offset, rows = fetched, "Fetched export batch");
            records.extend(batch);
            offset += fetched;

            handle
                .report_progress(offset.min(total), running_progress(offset, total))
                .await?;

            if fetched < batch_size {
                break;
            }
        }

        let columns = if record.columns.is_empty() {
            default_columns(&records)
        } else {
            record.columns.clone()
        };
        let rows: Vec<Row> = records.into_iter().map(DataRecord::into_row).collect();
        let bytes = codec::encode(&rows, &columns, format, self.config.csv_dialect)?;

        let file_name = export_file_name(handle.id(), format);
        let path = format!("{}/{}", EXPORT_PREFIX, file_name);
        let uploaded = self
            .storage
            .upload_file(&path, bytes, format.content_type())
            .await?;

        info!(rows = rows.len(), size = uploaded.size, path = %uploaded.path, "Export uploaded");
        Ok(JobResult::Export(ExportResult {
            file_url: uploaded.url,
            file_name,
            file_size: uploaded.size,
        }))
    }
}
