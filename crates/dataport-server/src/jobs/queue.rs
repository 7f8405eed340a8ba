//! Job queue and dispatcher
//!
//! [`JobQueue`] keeps the in-memory job map, mirrors every transition to the
//! [`JobStore`] and runs jobs on a bounded pool: a semaphore permit is taken per
//! running job and a job without a permit stays PENDING until one frees up.
//!
//! The state lock is never held across store or worker calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::store::JobStore;
use super::types::{
    Job, JobKind, JobResult, JobStatus, JobUpdate, Lease, LeaseOutcome, ReclaimedJob,
    LEASE_EXPIRED_MESSAGE,
};
use crate::config::JobsConfig;
use crate::error::JobError;

/// Processing function for one job kind
#[async_trait]
pub trait JobWorker: Send + Sync {
    async fn run(&self, handle: &JobHandle) -> Result<JobResult, JobError>;
}

/// One worker per job kind
#[derive(Clone)]
pub struct WorkerRegistry {
    import: Arc<dyn JobWorker>,
    export: Arc<dyn JobWorker>,
}

impl WorkerRegistry {
    pub fn new(import: Arc<dyn JobWorker>, export: Arc<dyn JobWorker>) -> Self {
        Self { import, export }
    }

    pub fn get(&self, kind: JobKind) -> Arc<dyn JobWorker> {
        match kind {
            JobKind::Import => self.import.clone(),
            JobKind::Export => self.export.clone(),
        }
    }

    pub fn set(&mut self, kind: JobKind, worker: Arc<dyn JobWorker>) {
        match kind {
            JobKind::Import => self.import = worker,
            JobKind::Export => self.export = worker,
        }
    }
}

/// What a running worker sees of its job
#[derive(Clone)]
pub struct JobHandle {
    id: Uuid,
    kind: JobKind,
    queue: JobQueue,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub async fn set_total_rows(&self, total_rows: i64) -> Result<(), JobError> {
        self.queue
            .update_job(self.id, JobUpdate::total_rows(total_rows))
            .await
            .map(|_| ())
    }

    pub async fn report_progress(&self, processed_rows: i64, progress: u8) -> Result<(), JobError> {
        self.queue
            .update_job(self.id, JobUpdate::progress(processed_rows, progress))
            .await
            .map(|_| ())
    }
}

struct QueuedJob {
    job: Job,
    seq: u64,
    claimed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<Uuid, QueuedJob>,
    in_flight: HashSet<Uuid>,
    next_seq: u64,
}

impl QueueState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Drop terminal jobs that finished at or before `cutoff`
    fn evict_finished(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, queued| {
            !queued.job.status.is_terminal()
                || queued.job.completed_at.is_some_and(|completed_at| completed_at > cutoff)
        });
        before - self.jobs.len()
    }

    /// Oldest-enqueued PENDING job that is not running
    fn next_pending(&self) -> Option<Uuid> {
        self.jobs
            .iter()
            .filter(|(id, queued)| {
                queued.job.status == JobStatus::Pending && !self.in_flight.contains(id)
            })
            .min_by_key(|(_, queued)| queued.seq)
            .map(|(id, _)| *id)
    }
}

struct Inner {
    store: Arc<dyn JobStore>,
    workers: RwLock<WorkerRegistry>,
    state: Mutex<QueueState>,
    permits: Arc<Semaphore>,
    config: JobsConfig,
    owner: String,
}

/// Cheaply clonable handle to the job queue
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, workers: WorkerRegistry, config: JobsConfig) -> Self {
        let hostname = hostname::get()
            .unwrap_or_else(|_| "unknown".into())
            .to_string_lossy()
            .to_string();

        Self {
            inner: Arc::new(Inner {
                store,
                workers: RwLock::new(workers),
                state: Mutex::new(QueueState::default()),
                permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
                config,
                owner: format!("{}/{}", hostname, Uuid::new_v4()),
            }),
        }
    }

    /// Lease owner written to claimed rows, `<hostname>/<uuid>`
    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    /// Replace the worker for `kind`
    pub async fn register_worker(&self, kind: JobKind, worker: Arc<dyn JobWorker>) {
        self.inner.workers.write().await.set(kind, worker);
    }

    /// Track `job` and try to dispatch
    pub async fn add(&self, job: Job) {
        let id = job.id;
        if self.enqueue(job).await {
            debug!(job_id = %id, "Job added");
        }
        self.process_next().await;
    }

    /// Insert into the map unless the job is already running or finished here
    ///
    /// Finished jobs older than the retention window are evicted first.
    async fn enqueue(&self, job: Job) -> bool {
        let retention = std::time::Duration::from_secs(self.inner.config.retention_secs);
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        let mut state = self.inner.state.lock().await;
        let evicted = cutoff.map_or(0, |cutoff| state.evict_finished(cutoff));
        if evicted > 0 {
            debug!(evicted, "Finished jobs evicted");
        }
        if state.in_flight.contains(&job.id) {
            return false;
        }
        if let Some(existing) = state.jobs.get(&job.id) {
            if existing.job.status.is_terminal() || existing.job.status == JobStatus::Pending {
                return false;
            }
        }
        let seq = state.next_seq();
        state.jobs.insert(
            job.id,
            QueuedJob {
                job,
                seq,
                claimed_at: None,
            },
        );
        true
    }

    pub async fn get_job(&self, id: Uuid) -> Option<Job> {
        self.inner.state.lock().await.jobs.get(&id).map(|queued| queued.job.clone())
    }

    /// In-memory job if tracked here, otherwise the durable row
    pub async fn find_job(&self, id: Uuid) -> Result<Option<Job>, JobError> {
        if let Some(job) = self.get_job(id).await {
            return Ok(Some(job));
        }
        self.find_durable(id).await
    }

    /// Number of jobs currently running in this process
    pub async fn in_flight(&self) -> usize {
        self.inner.state.lock().await.in_flight.len()
    }

    /// Merge `update` into the job and persist the result
    ///
    /// Returns the updated job, or `None` if the job is unknown or already terminal.
    pub async fn update_job(&self, id: Uuid, update: JobUpdate) -> Result<Option<Job>, JobError> {
        let now = Utc::now();
        let (job, write) = {
            let mut state = self.inner.state.lock().await;
            let Some(queued) = state.jobs.get_mut(&id) else {
                return Ok(None);
            };
            let Some(mut write) = queued.job.apply(update, now) else {
                debug!(job_id = %id, status = %queued.job.status, "Update after terminal status ignored");
                return Ok(None);
            };
            if queued.job.status == JobStatus::Processing {
                write.lease = Some(self.lease(queued.claimed_at.unwrap_or(now), now));
            }
            (queued.job.clone(), write)
        };

        self.inner.store.persist(job.kind, id, &write).await?;
        Ok(Some(job))
    }

    fn lease(&self, claimed_at: DateTime<Utc>, now: DateTime<Utc>) -> Lease {
        let lease_secs = i64::try_from(self.inner.config.lease_secs).unwrap_or(i64::MAX);
        Lease {
            claimed_by: self.inner.owner.clone(),
            claimed_at,
            expires_at: now + chrono::Duration::seconds(lease_secs),
        }
    }

    /// Cancel a PENDING job; anything else is left alone
    ///
    /// The durable row only moves to CANCELLED if it is still PENDING, so a
    /// concurrent claim always wins over a cancel.
    pub async fn cancel(&self, id: Uuid) -> Result<bool, JobError> {
        let now = Utc::now();
        let tracked = {
            let state = self.inner.state.lock().await;
            if state.in_flight.contains(&id) {
                return Ok(false);
            }
            match state.jobs.get(&id).map(|queued| &queued.job) {
                Some(job) if job.status == JobStatus::Pending => Some(job.clone()),
                Some(_) => return Ok(false),
                None => None,
            }
        };

        let mut job = match tracked {
            Some(job) => job,
            // Not tracked here; a PENDING durable row can still be cancelled
            None => match self.find_durable(id).await? {
                Some(job) if job.status == JobStatus::Pending => job,
                _ => return Ok(false),
            },
        };

        let Some(write) = job.apply(JobUpdate::status(JobStatus::Cancelled), now) else {
            return Ok(false);
        };
        if !self.inner.store.persist_from_pending(job.kind, id, &write).await? {
            debug!(job_id = %id, "Job left PENDING before it could be cancelled");
            return Ok(false);
        }

        {
            let mut state = self.inner.state.lock().await;
            if !state.in_flight.contains(&id) {
                state.jobs.remove(&id);
            }
        }
        info!(job_id = %id, kind = %job.kind, "Job cancelled");
        Ok(true)
    }

    async fn find_durable(&self, id: Uuid) -> Result<Option<Job>, JobError> {
        if let Some(job) = self.inner.store.load_job(JobKind::Import, id).await? {
            return Ok(Some(job));
        }
        self.inner.store.load_job(JobKind::Export, id).await
    }

    /// Enqueue PENDING durable jobs not already tracked and dispatch them
    ///
    /// Returns how many jobs were newly enqueued.
    pub async fn process_pending_jobs(&self) -> Result<usize, JobError> {
        let pending = self
            .inner
            .store
            .pending_jobs(self.inner.config.pending_scan_limit)
            .await?;

        let mut enqueued = 0;
        for job in pending {
            if self.enqueue(job).await {
                enqueued += 1;
            }
            self.process_next().await;
        }

        if enqueued > 0 {
            info!(enqueued, "Pending jobs enqueued");
        }
        Ok(enqueued)
    }

    /// Sweep expired leases held by dead processes
    ///
    /// Expired exports go back to PENDING, expired imports are failed. Jobs
    /// running in this process are skipped.
    pub async fn reclaim_expired_leases(&self) -> Result<Vec<ReclaimedJob>, JobError> {
        let now = Utc::now();
        let running: Vec<Uuid> = self.inner.state.lock().await.in_flight.iter().copied().collect();
        let reclaimed = self.inner.store.reclaim_expired_leases(now, &running).await?;

        let mut state = self.inner.state.lock().await;
        for job in &reclaimed {
            match job.outcome {
                LeaseOutcome::Requeued => {
                    warn!(job_id = %job.id, kind = %job.kind, "Lease expired, job requeued");
                    let seq = state.next_seq();
                    if let Some(queued) = state.jobs.get_mut(&job.id) {
                        if !queued.job.status.is_terminal() {
                            queued.job.status = JobStatus::Pending;
                            queued.claimed_at = None;
                            queued.seq = seq;
                        }
                    }
                },
                LeaseOutcome::Failed => {
                    warn!(job_id = %job.id, kind = %job.kind, "Lease expired, job failed");
                    if let Some(queued) = state.jobs.get_mut(&job.id) {
                        queued.job.apply(JobUpdate::failed(LEASE_EXPIRED_MESSAGE), now);
                    }
                },
            }
        }

        Ok(reclaimed)
    }

    /// Claim the oldest PENDING job and run it in the background
    ///
    /// Returns `false` without touching any state when nothing is PENDING or the
    /// pool is full. A job whose durable row is no longer PENDING is dropped from
    /// the map instead of being run.
    pub async fn process_next(&self) -> bool {
        let Ok(permit) = self.inner.permits.clone().try_acquire_owned() else {
            return false;
        };

        let now = Utc::now();
        let claimed = {
            let mut state = self.inner.state.lock().await;
            let Some(id) = state.next_pending() else {
                return false;
            };
            let claimed = state.jobs.get_mut(&id).and_then(|queued| {
                queued.claimed_at = Some(now);
                let write = queued.job.apply(JobUpdate::status(JobStatus::Processing), now)?;
                Some((queued.job.clone(), write))
            });
            if claimed.is_some() {
                state.in_flight.insert(id);
            }
            claimed
        };

        let Some((job, mut write)) = claimed else {
            return false;
        };
        write.lease = Some(self.lease(now, now));

        let claimed = match self.inner.store.persist_from_pending(job.kind, job.id, &write).await {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(job_id = %job.id, "Failed to persist job claim: {}", e);
                false
            },
        };
        if !claimed {
            // The durable row left PENDING or could not be written
            debug!(job_id = %job.id, "Job no longer claimable, dropped");
            {
                let mut state = self.inner.state.lock().await;
                state.jobs.remove(&job.id);
                state.in_flight.remove(&job.id);
            }
            drop(permit);
            self.dispatch_next();
            return false;
        }

        let worker = self.inner.workers.read().await.get(job.kind);
        let span = info_span!("job", job_id = %job.id, kind = %job.kind);
        let queue = self.clone();
        tokio::spawn(async move { queue.run_job(job, worker, permit).await }.instrument(span));

        true
    }

    async fn run_job(self, job: Job, worker: Arc<dyn JobWorker>, permit: OwnedSemaphorePermit) {
        info!("Job started");
        let handle = JobHandle {
            id: job.id,
            kind: job.kind,
            queue: self.clone(),
        };

        // A panicking worker only takes down its own task
        let outcome = tokio::spawn(async move { worker.run(&handle).await }.in_current_span()).await;

        let update = match outcome {
            Ok(Ok(result)) => {
                info!("Job completed");
                JobUpdate::completed(result)
            },
            Ok(Err(err)) => {
                error!("Job failed: {}", err);
                JobUpdate::failed(err.to_string())
            },
            Err(join_error) => {
                let err = JobError::Panicked(panic_message(join_error));
                error!("Job failed: {}", err);
                JobUpdate::failed(err.to_string())
            },
        };

        if let Err(e) = self.update_job(job.id, update).await {
            error!("Failed to persist final job state: {}", e);
        }

        self.inner.state.lock().await.in_flight.remove(&job.id);
        drop(permit);
        self.dispatch_next();
    }

    fn dispatch_next(&self) {
        let queue = self.clone();
        tokio::spawn(async move {
            queue.process_next().await;
        });
    }
}

fn panic_message(error: tokio::task::JoinError) -> String {
    if error.is_cancelled() {
        return "worker task was cancelled".to_string();
    }
    match error.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(error) => error.to_string(),
    }
}
