//! In-process job store
//!
//! Applies writes with the same guards as the Postgres store and keeps a log of
//! every write it received, so tests can assert on checkpoints.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::store::JobStore;
use super::types::{
    ExportJobRecord, ImportJobRecord, Job, JobKind, JobState, JobStatus, JobWrite, LeaseOutcome,
    ReclaimedJob, LEASE_EXPIRED_MESSAGE,
};
use crate::error::JobError;

#[derive(Default)]
struct Tables {
    imports: HashMap<Uuid, ImportJobRecord>,
    exports: HashMap<Uuid, ExportJobRecord>,
    writes: Vec<(JobKind, Uuid, JobWrite)>,
}

/// Job store held entirely in memory
#[derive(Default)]
pub struct MemoryJobStore {
    tables: Mutex<Tables>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_import(&self, record: ImportJobRecord) {
        self.tables().imports.insert(record.id, record);
    }

    pub fn insert_export(&self, record: ExportJobRecord) {
        self.tables().exports.insert(record.id, record);
    }

    /// Every write received for `id`, oldest first
    pub fn writes_for(&self, id: Uuid) -> Vec<JobWrite> {
        self.tables()
            .writes
            .iter()
            .filter(|(_, job_id, _)| *job_id == id)
            .map(|(_, _, write)| write.clone())
            .collect()
    }

    /// Stored state of a job of either kind
    pub fn state(&self, kind: JobKind, id: Uuid) -> Option<JobState> {
        let tables = self.tables();
        match kind {
            JobKind::Import => tables.imports.get(&id).map(|r| r.state.clone()),
            JobKind::Export => tables.exports.get(&id).map(|r| r.state.clone()),
        }
    }
}

impl MemoryJobStore {
    /// Log `write` and apply it when the stored status passes `guard`
    fn write(
        &self,
        kind: JobKind,
        id: Uuid,
        write: &JobWrite,
        guard: impl Fn(JobStatus) -> bool,
    ) -> bool {
        let mut tables = self.tables();
        tables.writes.push((kind, id, write.clone()));

        let state = match kind {
            JobKind::Import => tables.imports.get_mut(&id).map(|r| &mut r.state),
            JobKind::Export => tables.exports.get_mut(&id).map(|r| &mut r.state),
        };
        match state {
            Some(state) if guard(state.status) => apply_write(state, write),
            _ => false,
        }
    }
}

fn apply_write(state: &mut JobState, write: &JobWrite) -> bool {
    if state.status.is_terminal() {
        return false;
    }

    state.status = write.status;
    state.progress = state.progress.max(write.progress);
    state.processed_rows = state.processed_rows.max(write.processed_rows);
    state.total_rows = state.total_rows.or(write.total_rows);
    if write.error_message.is_some() {
        state.error_message = write.error_message.clone();
    }
    if write.result.is_some() {
        state.result = write.result.clone();
    }
    state.started_at = state.started_at.or(write.started_at);
    state.completed_at = state.completed_at.or(write.completed_at);
    if let Some(lease) = &write.lease {
        state.claimed_by = Some(lease.claimed_by.clone());
        state.claimed_at = Some(lease.claimed_at);
        state.lease_expires_at = Some(lease.expires_at);
    }
    true
}

fn lease_expired(state: &JobState, now: DateTime<Utc>) -> bool {
    state.status == JobStatus::Processing
        && state.lease_expires_at.is_some_and(|expires_at| expires_at < now)
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn load_import_job(&self, id: Uuid) -> Result<Option<ImportJobRecord>, JobError> {
        Ok(self.tables().imports.get(&id).cloned())
    }

    async fn load_export_job(&self, id: Uuid) -> Result<Option<ExportJobRecord>, JobError> {
        Ok(self.tables().exports.get(&id).cloned())
    }

    async fn persist(&self, kind: JobKind, id: Uuid, write: &JobWrite) -> Result<(), JobError> {
        self.write(kind, id, write, |_| true);
        Ok(())
    }

    async fn persist_from_pending(
        &self,
        kind: JobKind,
        id: Uuid,
        write: &JobWrite,
    ) -> Result<bool, JobError> {
        Ok(self.write(kind, id, write, |status| status == JobStatus::Pending))
    }

    async fn pending_jobs(&self, limit: i64) -> Result<Vec<Job>, JobError> {
        let tables = self.tables();
        let mut pending: Vec<(DateTime<Utc>, Job)> = tables
            .imports
            .values()
            .filter(|r| r.state.status == JobStatus::Pending)
            .map(|r| (r.state.created_at, r.state.to_job(r.id, JobKind::Import)))
            .chain(
                tables
                    .exports
                    .values()
                    .filter(|r| r.state.status == JobStatus::Pending)
                    .map(|r| (r.state.created_at, r.state.to_job(r.id, JobKind::Export))),
            )
            .collect();

        pending.sort_by_key(|(created_at, _)| *created_at);
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(pending.into_iter().take(limit).map(|(_, job)| job).collect())
    }

    async fn reclaim_expired_leases(
        &self,
        now: DateTime<Utc>,
        exclude: &[Uuid],
    ) -> Result<Vec<ReclaimedJob>, JobError> {
        let mut tables = self.tables();
        let mut reclaimed = Vec::new();

        for record in tables.exports.values_mut() {
            if exclude.contains(&record.id) || !lease_expired(&record.state, now) {
                continue;
            }
            record.state.status = JobStatus::Pending;
            record.state.claimed_by = None;
            record.state.claimed_at = None;
            record.state.lease_expires_at = None;
            reclaimed.push(ReclaimedJob {
                id: record.id,
                kind: JobKind::Export,
                outcome: LeaseOutcome::Requeued,
            });
        }

        for record in tables.imports.values_mut() {
            if exclude.contains(&record.id) || !lease_expired(&record.state, now) {
                continue;
            }
            record.state.status = JobStatus::Failed;
            record.state.error_message = Some(LEASE_EXPIRED_MESSAGE.to_string());
            record.state.completed_at = record.state.completed_at.or(Some(now));
            record.state.lease_expires_at = None;
            reclaimed.push(ReclaimedJob {
                id: record.id,
                kind: JobKind::Import,
                outcome: LeaseOutcome::Failed,
            });
        }

        Ok(reclaimed)
    }
}
