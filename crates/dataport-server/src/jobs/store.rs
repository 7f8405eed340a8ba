//! Durable job persistence
//!
//! The queue and workers only see [`JobStore`]. [`PgJobStore`] keeps the lifecycle
//! rules in SQL as well: progress only grows, timestamps are written once and rows
//! already in a terminal status are never touched again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use super::types::{
    ColumnMapping, ExportFilters, ExportJobRecord, ExportResult, FileReference,
    ImportJobRecord, Job, JobKind, JobResult, JobState, JobStatus, JobWrite, LeaseOutcome,
    ReclaimedJob, LEASE_EXPIRED_MESSAGE,
};
use crate::error::JobError;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load_import_job(&self, id: Uuid) -> Result<Option<ImportJobRecord>, JobError>;

    async fn load_export_job(&self, id: Uuid) -> Result<Option<ExportJobRecord>, JobError>;

    /// Write the persisted subset of a job to the table of its kind
    ///
    /// Rows already in a terminal status are left untouched.
    async fn persist(&self, kind: JobKind, id: Uuid, write: &JobWrite) -> Result<(), JobError>;

    /// Apply `write` only if the row is still PENDING
    ///
    /// Claims and cancellations go through here. Returns `false` when the row is
    /// missing or has already left PENDING.
    async fn persist_from_pending(
        &self,
        kind: JobKind,
        id: Uuid,
        write: &JobWrite,
    ) -> Result<bool, JobError>;

    /// Oldest PENDING jobs across both tables
    async fn pending_jobs(&self, limit: i64) -> Result<Vec<Job>, JobError>;

    /// Requeue expired exports and fail expired imports, skipping `exclude`
    async fn reclaim_expired_leases(
        &self,
        now: DateTime<Utc>,
        exclude: &[Uuid],
    ) -> Result<Vec<ReclaimedJob>, JobError>;

    /// Load a job row of either kind as an in-memory job
    async fn load_job(&self, kind: JobKind, id: Uuid) -> Result<Option<Job>, JobError> {
        let job = match kind {
            JobKind::Import => self
                .load_import_job(id)
                .await?
                .map(|record| record.state.to_job(record.id, kind)),
            JobKind::Export => self
                .load_export_job(id)
                .await?
                .map(|record| record.state.to_job(record.id, kind)),
        };
        Ok(job)
    }
}

/// Postgres-backed job store
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Which row statuses an UPDATE may overwrite
#[derive(Debug, Clone, Copy)]
enum WriteGuard {
    NotTerminal,
    Pending,
}

impl WriteGuard {
    fn clause(self) -> &'static str {
        match self {
            WriteGuard::NotTerminal => "status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')",
            WriteGuard::Pending => "status = 'PENDING'",
        }
    }
}

#[derive(sqlx::FromRow)]
struct StateRow {
    status: String,
    progress: i32,
    processed_rows: i64,
    total_rows: Option<i64>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    lease_expires_at: Option<DateTime<Utc>>,
}

impl StateRow {
    fn into_state(self, result: Option<JobResult>) -> Result<JobState, JobError> {
        Ok(JobState {
            status: parse_status(&self.status)?,
            progress: u8::try_from(self.progress.clamp(0, 100)).unwrap_or(0),
            processed_rows: self.processed_rows,
            total_rows: self.total_rows,
            error_message: self.error_message,
            result,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            claimed_by: self.claimed_by,
            claimed_at: self.claimed_at,
            lease_expires_at: self.lease_expires_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ImportJobRow {
    id: Uuid,
    data_model_id: Uuid,
    column_mapping: Option<Value>,
    file_path: Option<String>,
    file_name: Option<String>,
    mime_type: Option<String>,
    result: Option<Value>,
    #[sqlx(flatten)]
    state: StateRow,
}

#[derive(sqlx::FromRow)]
struct ExportJobRow {
    id: Uuid,
    data_model_id: Uuid,
    format: String,
    filters: Option<Value>,
    columns: Option<Value>,
    file_url: Option<String>,
    file_name: Option<String>,
    file_size: Option<i64>,
    #[sqlx(flatten)]
    state: StateRow,
}

#[derive(sqlx::FromRow)]
struct PendingRow {
    id: Uuid,
    kind: String,
    #[sqlx(flatten)]
    state: StateRow,
}

const STATE_COLUMNS: &str = "status, progress, processed_rows, total_rows, error_message, \
     created_at, started_at, completed_at, claimed_by, claimed_at, lease_expires_at";

fn parse_status(value: &str) -> Result<JobStatus, JobError> {
    value
        .parse::<JobStatus>()
        .map_err(|e| JobError::Database(sqlx::Error::Decode(e.into())))
}

fn decode_json<T: serde::de::DeserializeOwned + Default>(
    value: Option<Value>,
    column: &str,
) -> Result<T, JobError> {
    match value {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value).map_err(|e| {
            JobError::Database(sqlx::Error::Decode(format!("{}: {}", column, e).into()))
        }),
    }
}

impl ImportJobRow {
    fn into_record(self) -> Result<ImportJobRecord, JobError> {
        let column_mapping: Vec<ColumnMapping> =
            decode_json(self.column_mapping, "column_mapping")?;
        let result = match self.result {
            None | Some(Value::Null) => None,
            Some(value) => serde_json::from_value(value).ok().map(JobResult::Import),
        };
        let file = self.file_path.filter(|p| !p.is_empty()).map(|path| FileReference {
            path,
            name: self.file_name,
            mime_type: self.mime_type,
        });

        Ok(ImportJobRecord {
            id: self.id,
            data_model_id: self.data_model_id,
            column_mapping,
            file,
            state: self.state.into_state(result)?,
        })
    }
}

impl ExportJobRow {
    fn into_record(self) -> Result<ExportJobRecord, JobError> {
        let filters: ExportFilters = decode_json(self.filters, "filters")?;
        let columns: Vec<String> = decode_json(self.columns, "columns")?;
        let result = match (self.file_url, self.file_name) {
            (Some(file_url), Some(file_name)) => Some(JobResult::Export(ExportResult {
                file_url,
                file_name,
                file_size: self.file_size.unwrap_or(0),
            })),
            _ => None,
        };

        Ok(ExportJobRecord {
            id: self.id,
            data_model_id: self.data_model_id,
            format: self.format,
            filters,
            columns,
            state: self.state.into_state(result)?,
        })
    }
}

impl PgJobStore {
    /// Guarded UPDATE of one job row; `true` when the row changed
    async fn update_row(
        &self,
        kind: JobKind,
        id: Uuid,
        write: &JobWrite,
        guard: WriteGuard,
    ) -> Result<bool, JobError> {
        let (claimed_by, claimed_at, lease_expires_at) = match &write.lease {
            Some(lease) => (
                Some(lease.claimed_by.as_str()),
                Some(lease.claimed_at),
                Some(lease.expires_at),
            ),
            None => (None, None, None),
        };

        let import_sql;
        let export_sql;
        let query = match kind {
            JobKind::Import => {
                let result = match &write.result {
                    Some(JobResult::Import(result)) => Some(serde_json::to_value(result).map_err(
                        |e| JobError::Database(sqlx::Error::Encode(Box::new(e))),
                    )?),
                    _ => None,
                };
                import_sql = format!(
                    r#"
                    UPDATE import_jobs
                    SET status = $2,
                        progress = GREATEST(progress, $3),
                        processed_rows = GREATEST(processed_rows, $4),
                        total_rows = COALESCE(total_rows, $5),
                        error_message = COALESCE($6, error_message),
                        result = COALESCE($7, result),
                        started_at = COALESCE(started_at, $8),
                        completed_at = COALESCE(completed_at, $9),
                        claimed_by = COALESCE($10, claimed_by),
                        claimed_at = COALESCE($11, claimed_at),
                        lease_expires_at = COALESCE($12, lease_expires_at),
                        updated_at = NOW()
                    WHERE id = $1
                      AND {}
                    "#,
                    guard.clause()
                );
                sqlx::query(&import_sql)
                    .bind(id)
                    .bind(write.status.as_str())
                    .bind(i32::from(write.progress))
                    .bind(write.processed_rows)
                    .bind(write.total_rows)
                    .bind(write.error_message.as_deref())
                    .bind(result)
                    .bind(write.started_at)
                    .bind(write.completed_at)
                    .bind(claimed_by)
                    .bind(claimed_at)
                    .bind(lease_expires_at)
            },
            JobKind::Export => {
                let (file_url, file_name, file_size) = match &write.result {
                    Some(JobResult::Export(result)) => (
                        Some(result.file_url.as_str()),
                        Some(result.file_name.as_str()),
                        Some(result.file_size),
                    ),
                    _ => (None, None, None),
                };
                export_sql = format!(
                    r#"
                    UPDATE export_jobs
                    SET status = $2,
                        progress = GREATEST(progress, $3),
                        processed_rows = GREATEST(processed_rows, $4),
                        total_rows = COALESCE(total_rows, $5),
                        error_message = COALESCE($6, error_message),
                        file_url = COALESCE($7, file_url),
                        file_name = COALESCE($8, file_name),
                        file_size = COALESCE($9, file_size),
                        started_at = COALESCE(started_at, $10),
                        completed_at = COALESCE(completed_at, $11),
                        claimed_by = COALESCE($12, claimed_by),
                        claimed_at = COALESCE($13, claimed_at),
                        lease_expires_at = COALESCE($14, lease_expires_at),
                        updated_at = NOW()
                    WHERE id = $1
                      AND {}
                    "#,
                    guard.clause()
                );
                sqlx::query(&export_sql)
                    .bind(id)
                    .bind(write.status.as_str())
                    .bind(i32::from(write.progress))
                    .bind(write.processed_rows)
                    .bind(write.total_rows)
                    .bind(write.error_message.as_deref())
                    .bind(file_url)
                    .bind(file_name)
                    .bind(file_size)
                    .bind(write.started_at)
                    .bind(write.completed_at)
                    .bind(claimed_by)
                    .bind(claimed_at)
                    .bind(lease_expires_at)
            },
        };

        let outcome = query.execute(&self.pool).await?;
        let applied = outcome.rows_affected() > 0;
        if !applied {
            debug!(job_id = %id, kind = %kind, status = %write.status, ?guard, "Job write discarded");
        }

        Ok(applied)
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn load_import_job(&self, id: Uuid) -> Result<Option<ImportJobRecord>, JobError> {
        let sql = format!(
            "SELECT id, data_model_id, column_mapping, file_path, file_name, mime_type, result, {} \
             FROM import_jobs WHERE id = $1",
            STATE_COLUMNS
        );
        let row: Option<ImportJobRow> =
            sqlx::query_as(&sql).bind(id).fetch_optional(&self.pool).await?;

        row.map(ImportJobRow::into_record).transpose()
    }

    async fn load_export_job(&self, id: Uuid) -> Result<Option<ExportJobRecord>, JobError> {
        let sql = format!(
            "SELECT id, data_model_id, format, filters, columns, file_url, file_name, file_size, {} \
             FROM export_jobs WHERE id = $1",
            STATE_COLUMNS
        );
        let row: Option<ExportJobRow> =
            sqlx::query_as(&sql).bind(id).fetch_optional(&self.pool).await?;

        row.map(ExportJobRow::into_record).transpose()
    }

    async fn persist(&self, kind: JobKind, id: Uuid, write: &JobWrite) -> Result<(), JobError> {
        self.update_row(kind, id, write, WriteGuard::NotTerminal).await?;
        Ok(())
    }

    async fn persist_from_pending(
        &self,
        kind: JobKind,
        id: Uuid,
        write: &JobWrite,
    ) -> Result<bool, JobError> {
        self.update_row(kind, id, write, WriteGuard::Pending).await
    }

    async fn pending_jobs(&self, limit: i64) -> Result<Vec<Job>, JobError> {
        let sql = format!(
            "SELECT id, kind, {cols} FROM ( \
                 SELECT id, 'import' AS kind, {cols} FROM import_jobs WHERE status = 'PENDING' \
                 UNION ALL \
                 SELECT id, 'export' AS kind, {cols} FROM export_jobs WHERE status = 'PENDING' \
             ) pending \
             ORDER BY created_at ASC \
             LIMIT $1",
            cols = STATE_COLUMNS
        );
        let rows: Vec<PendingRow> = sqlx::query_as(&sql).bind(limit).fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|row| {
                let kind = match row.kind.as_str() {
                    "import" => JobKind::Import,
                    _ => JobKind::Export,
                };
                Ok(row.state.into_state(None)?.to_job(row.id, kind))
            })
            .collect()
    }

    async fn reclaim_expired_leases(
        &self,
        now: DateTime<Utc>,
        exclude: &[Uuid],
    ) -> Result<Vec<ReclaimedJob>, JobError> {
        let requeued: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE export_jobs
            SET status = 'PENDING',
                claimed_by = NULL,
                claimed_at = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE status = 'PROCESSING'
              AND lease_expires_at < $1
              AND NOT (id = ANY($2))
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(exclude)
        .fetch_all(&self.pool)
        .await?;

        let failed: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE import_jobs
            SET status = 'FAILED',
                error_message = $3,
                completed_at = COALESCE(completed_at, $1),
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE status = 'PROCESSING'
              AND lease_expires_at < $1
              AND NOT (id = ANY($2))
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(exclude)
        .bind(LEASE_EXPIRED_MESSAGE)
        .fetch_all(&self.pool)
        .await?;

        let reclaimed = requeued
            .into_iter()
            .map(|id| ReclaimedJob {
                id,
                kind: JobKind::Export,
                outcome: LeaseOutcome::Requeued,
            })
            .chain(failed.into_iter().map(|id| ReclaimedJob {
                id,
                kind: JobKind::Import,
                outcome: LeaseOutcome::Failed,
            }))
            .collect();

        Ok(reclaimed)
    }
}
