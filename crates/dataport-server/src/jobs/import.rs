//! Import worker
//!
//! Downloads the uploaded file, decodes it and inserts one data record per row.
//! A rejected row is counted and logged on the result; the job carries on. Only
//! store-level failures (connection loss and the like) stop an import.

use async_trait::async_trait;
use dataport_common::{codec, FileFormat, Row};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::queue::{JobHandle, JobWorker};
use super::store::JobStore;
use super::types::{running_progress, ColumnMapping, ImportResult, JobResult, MAX_IMPORT_ERRORS};
use crate::config::JobsConfig;
use crate::error::{JobError, RecordError};
use crate::records::RecordStore;
use crate::storage::StorageService;

pub struct ImportWorker {
    jobs: Arc<dyn JobStore>,
    records: Arc<dyn RecordStore>,
    storage: StorageService,
    config: JobsConfig,
}

impl ImportWorker {
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

/// Most recent row errors, oldest evicted first
#[derive(Debug, Default)]
struct ErrorLog {
    entries: VecDeque<String>,
}

impl ErrorLog {
    fn push(&mut self, message: String) {
        if self.entries.len() == MAX_IMPORT_ERRORS {
            self.entries.pop_front();
        }
        self.entries.push_back(message);
    }

    fn into_vec(self) -> Vec<String> {
        self.entries.into()
    }
}

/// Translate a decoded row into a record payload
///
/// An explicit mapping renames source columns; without one, columns whose name
/// is a data-model attribute are kept.
fn map_row(row: &Row, mapping: &[ColumnMapping], attributes: &[String]) -> Result<Row, JobError> {
    let mut payload = Row::new();

    if mapping.is_empty() {
        for (key, value) in row {
            if attributes.iter().any(|attribute| attribute == key) {
                payload.insert(key.clone(), value.clone());
            }
        }
    } else {
        for entry in mapping {
            if entry.target_attribute.is_empty() {
                continue;
            }
            if let Some(value) = row.get(&entry.source_column) {
                payload.insert(entry.target_attribute.clone(), value.clone());
            }
        }
    }

    if payload.is_empty() {
        return Err(JobError::RowMapping(
            "no column matches a data model attribute".to_string(),
        ));
    }
    Ok(payload)
}

#[async_trait]
impl JobWorker for ImportWorker {
    #[instrument(skip_all, fields(job_id = %handle.id()))]
    async fn run(&self, handle: &JobHandle) -> Result<JobResult, JobError> {
        let record = self
            .jobs
            .load_import_job(handle.id())
            .await?
            .ok_or(JobError::JobNotFound(handle.id()))?;
        let file = record.file.ok_or(JobError::FileMissing)?;

        let bytes = self.storage.download_file(&file.path).await?;

        let file_name = file.name.as_deref().unwrap_or(&file.path);
        let format = FileFormat::detect(file.mime_type.as_deref(), Some(file_name)).map_err(|_| {
            JobError::UnsupportedFormat(
                file.mime_type.clone().unwrap_or_else(|| file_name.to_string()),
            )
        })?;
        let rows = codec::decode(&bytes, format, self.config.csv_dialect)?;

        let total = rows.len() as i64;
        handle.set_total_rows(total).await?;
        info!(rows = total, format = %format, "Import file decoded");

        let attributes = if record.column_mapping.is_empty() {
            self.records
                .attribute_names(record.data_model_id)
                .await
                .map_err(JobError::from)?
        } else {
            Vec::new()
        };

        let mut result = ImportResult::default();
        let mut errors = ErrorLog::default();
        let mut processed: i64 = 0;
        let interval = self.config.progress_interval.max(1) as i64;

        for (batch_index, batch) in rows.chunks(self.config.import_batch_size.max(1)).enumerate() {
            debug!(batch = batch_index, rows = batch.len(), "Importing batch");

            for row in batch {
                let row_number = processed + 1;
                let inserted = match map_row(row, &record.column_mapping, &attributes) {
                    Ok(payload) => self.records.insert_record(record.data_model_id, &payload).await,
                    Err(err) => Err(RecordError::Row(err.to_string())),
                };

                match inserted {
                    Ok(_) => result.imported_count += 1,
                    Err(RecordError::Row(message)) => {
                        warn!(row = row_number, "Row skipped: {}", message);
                        result.skipped_count += 1;
                        errors.push(format!("Row {}: {}", row_number, message));
                    },
                    Err(fatal @ RecordError::Fatal(_)) => return Err(fatal.into()),
                }

                processed += 1;
                if processed % interval == 0 || processed == total {
                    handle
                        .report_progress(processed, running_progress(processed, total))
                        .await?;
                }
            }
        }

        result.errors = errors.into_vec();
        info!(
            imported = result.imported_count,
            skipped = result.skipped_count,
            "Import finished"
        );
        Ok(JobResult::Import(result))
    }
}
