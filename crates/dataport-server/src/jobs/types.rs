//! Job model
//!
//! [`Job`] is the in-memory view the queue keeps per job. Every change goes through
//! [`Job::apply`], which enforces the lifecycle rules and produces the [`JobWrite`]
//! that is mirrored to the durable job table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Maximum number of row errors kept on an import result
pub const MAX_IMPORT_ERRORS: usize = 10;

/// Highest progress value a job can report before it completes
pub const MAX_RUNNING_PROGRESS: u8 = 99;

/// Job type; each kind has its own durable table and worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Import,
    Export,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Import => "import",
            JobKind::Export => "export",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle status, stored upper-case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
    pub processed_rows: i64,
    pub total_rows: Option<i64>,
}

/// Outcome of a finished import
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub imported_count: i64,
    pub skipped_count: i64,
    pub errors: Vec<String>,
}

/// Outcome of a finished export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub file_url: String,
    pub file_name: String,
    pub file_size: i64,
}

/// Type-specific job result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobResult {
    Import(ImportResult),
    Export(ExportResult),
}

/// In-memory job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: u8,
    pub data: JobData,
    pub error: Option<String>,
    pub result: Option<JobResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Partial update merged by [`Job::apply`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub processed_rows: Option<i64>,
    pub total_rows: Option<i64>,
    pub error: Option<String>,
    pub result: Option<JobResult>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(processed_rows: i64, progress: u8) -> Self {
        Self {
            processed_rows: Some(processed_rows),
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn total_rows(total_rows: i64) -> Self {
        Self {
            total_rows: Some(total_rows),
            ..Default::default()
        }
    }

    pub fn completed(result: JobResult) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            progress: Some(100),
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Lease held by the process running a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub claimed_by: String,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// The persisted subset of a job after an update
#[derive(Debug, Clone, PartialEq)]
pub struct JobWrite {
    pub status: JobStatus,
    pub progress: u8,
    pub processed_rows: i64,
    pub total_rows: Option<i64>,
    pub error_message: Option<String>,
    pub result: Option<JobResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// `None` leaves the stored lease untouched
    pub lease: Option<Lease>,
}

impl Job {
    pub fn new(id: Uuid, kind: JobKind) -> Self {
        Self {
            id,
            kind,
            status: JobStatus::Pending,
            progress: 0,
            data: JobData::default(),
            error: None,
            result: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Merge `update` into this job
    ///
    /// Returns the write to persist, or `None` when the job is already terminal
    /// and the update is discarded.
    pub fn apply(&mut self, update: JobUpdate, now: DateTime<Utc>) -> Option<JobWrite> {
        if self.status.is_terminal() {
            return None;
        }

        if self.data.total_rows.is_none() {
            if let Some(total) = update.total_rows {
                self.data.total_rows = Some(total.max(0));
            }
        }

        if let Some(processed) = update.processed_rows {
            self.data.processed_rows = self.data.processed_rows.max(processed);
        }
        if let Some(total) = self.data.total_rows {
            self.data.processed_rows = self.data.processed_rows.min(total);
        }

        if let Some(status) = update.status {
            if status == JobStatus::Processing && self.started_at.is_none() {
                self.started_at = Some(now);
            }
            if status.is_terminal() && self.completed_at.is_none() {
                self.completed_at = Some(now);
            }
            self.status = status;
        }

        if let Some(progress) = update.progress {
            self.progress = self.progress.max(progress);
        }

        if self.status == JobStatus::Completed {
            self.progress = 100;
            match self.data.total_rows {
                Some(total) => self.data.processed_rows = total,
                None => self.data.total_rows = Some(self.data.processed_rows),
            }
        } else {
            self.progress = self.progress.min(MAX_RUNNING_PROGRESS);
        }

        if update.error.is_some() {
            self.error = update.error;
        }
        if update.result.is_some() {
            self.result = update.result;
        }

        Some(self.to_write())
    }

    pub fn to_write(&self) -> JobWrite {
        JobWrite {
            status: self.status,
            progress: self.progress,
            processed_rows: self.data.processed_rows,
            total_rows: self.data.total_rows,
            error_message: self.error.clone(),
            result: self.result.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            lease: None,
        }
    }
}

/// Percentage of `processed` over `total`, capped below completion
pub fn running_progress(processed: i64, total: i64) -> u8 {
    if total <= 0 {
        return 0;
    }
    let percent = (processed.max(0) * 100 / total).min(i64::from(MAX_RUNNING_PROGRESS));
    u8::try_from(percent).unwrap_or(MAX_RUNNING_PROGRESS)
}

/// Source column to data-model attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMapping {
    pub source_column: String,
    pub target_attribute: String,
}

/// Uploaded file an import reads from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    pub path: String,
    pub name: Option<String>,
    pub mime_type: Option<String>,
}

/// Record filter of an export
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportFilters {
    /// Case-insensitive substring matched against the serialized payload
    pub search: Option<String>,
    /// Explicit id allow-list
    pub ids: Option<Vec<Uuid>>,
}

/// Durable state shared by both job tables
#[derive(Debug, Clone, PartialEq)]
pub struct JobState {
    pub status: JobStatus,
    pub progress: u8,
    pub processed_rows: i64,
    pub total_rows: Option<i64>,
    pub error_message: Option<String>,
    pub result: Option<JobResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl JobState {
    pub fn pending(created_at: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Pending,
            progress: 0,
            processed_rows: 0,
            total_rows: None,
            error_message: None,
            result: None,
            created_at,
            started_at: None,
            completed_at: None,
            claimed_by: None,
            claimed_at: None,
            lease_expires_at: None,
        }
    }

    /// In-memory job for a durable row
    pub fn to_job(&self, id: Uuid, kind: JobKind) -> Job {
        Job {
            id,
            kind,
            status: self.status,
            progress: self.progress,
            data: JobData {
                processed_rows: self.processed_rows,
                total_rows: self.total_rows,
            },
            error: self.error_message.clone(),
            result: self.result.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Durable import job row
#[derive(Debug, Clone, PartialEq)]
pub struct ImportJobRecord {
    pub id: Uuid,
    pub data_model_id: Uuid,
    pub column_mapping: Vec<ColumnMapping>,
    pub file: Option<FileReference>,
    pub state: JobState,
}

/// Durable export job row
#[derive(Debug, Clone, PartialEq)]
pub struct ExportJobRecord {
    pub id: Uuid,
    pub data_model_id: Uuid,
    pub format: String,
    pub filters: ExportFilters,
    pub columns: Vec<String>,
    pub state: JobState,
}

/// What the lease sweep did to a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    Requeued,
    Failed,
}

/// A job whose lease expired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimedJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub outcome: LeaseOutcome,
}

/// Message stored on imports failed by the lease sweep
pub const LEASE_EXPIRED_MESSAGE: &str = "Job lease expired before the import finished";
