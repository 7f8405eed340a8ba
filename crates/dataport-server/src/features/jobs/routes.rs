//! Job routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use uuid::Uuid;

use crate::error::AppError;
use crate::features::FeatureState;
use crate::jobs::{JobKind, JobStatus};

/// Create job routes
pub fn jobs_routes() -> Router<FeatureState> {
    Router::new()
        .route("/jobs/reconcile", post(reconcile))
        .route("/jobs/import/:job_id", post(submit_import))
        .route("/jobs/export/:job_id", post(submit_export))
        .route("/jobs/:job_id", get(get_job))
        .route("/jobs/:job_id/cancel", post(cancel_job))
}

/// Get a job, from memory while tracked and from its row otherwise
///
/// GET /jobs/:job_id
async fn get_job(
    State(state): State<FeatureState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response, AppError> {
    match state.queue.find_job(job_id).await? {
        Some(job) => Ok((StatusCode::OK, Json(json!(job))).into_response()),
        None => Err(AppError::NotFound(format!("Job not found: {}", job_id))),
    }
}

/// POST /jobs/import/:job_id
async fn submit_import(
    State(state): State<FeatureState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response, AppError> {
    submit(state, JobKind::Import, job_id).await
}

/// POST /jobs/export/:job_id
async fn submit_export(
    State(state): State<FeatureState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response, AppError> {
    submit(state, JobKind::Export, job_id).await
}

async fn submit(state: FeatureState, kind: JobKind, job_id: Uuid) -> Result<Response, AppError> {
    let job = state
        .jobs
        .load_job(kind, job_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Job not found: {}", job_id)))?;

    if job.status != JobStatus::Pending {
        return Err(AppError::Conflict(format!(
            "Job {} is {}, only PENDING jobs can be submitted",
            job_id, job.status
        )));
    }

    state.queue.add(job).await;
    tracing::info!(job_id = %job_id, kind = %kind, "Job submitted");

    let snapshot = state.queue.get_job(job_id).await;
    Ok((StatusCode::ACCEPTED, Json(json!(snapshot))).into_response())
}

/// POST /jobs/:job_id/cancel
async fn cancel_job(
    State(state): State<FeatureState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let cancelled = state.queue.cancel(job_id).await?;
    Ok((StatusCode::OK, Json(json!({ "cancelled": cancelled }))).into_response())
}

/// Sweep expired leases, then pick up PENDING rows
///
/// POST /jobs/reconcile
async fn reconcile(State(state): State<FeatureState>) -> Result<Response, AppError> {
    let reclaimed = state.queue.reclaim_expired_leases().await?;
    let enqueued = state.queue.process_pending_jobs().await?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "reclaimed": reclaimed.len(),
            "enqueued": enqueued,
        })),
    )
        .into_response())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use std::sync::Arc;
    use tower::ServiceExt;

    use crate::config::JobsConfig;
    use crate::error::JobError;
    use crate::jobs::types::{ExportFilters, ExportJobRecord, ImportResult, JobResult, JobState};
    use crate::jobs::{JobHandle, JobQueue, JobWorker, MemoryJobStore, WorkerRegistry};

    struct Noop;

    #[async_trait]
    impl JobWorker for Noop {
        async fn run(&self, _handle: &JobHandle) -> Result<JobResult, JobError> {
            Ok(JobResult::Import(ImportResult::default()))
        }
    }

    fn app() -> (Router, Arc<MemoryJobStore>) {
        let store = Arc::new(MemoryJobStore::new());
        let queue = JobQueue::new(
            store.clone(),
            WorkerRegistry::new(Arc::new(Noop), Arc::new(Noop)),
            JobsConfig::default(),
        );
        let state = FeatureState {
            queue,
            jobs: store.clone(),
        };
        (jobs_routes().with_state(state), store)
    }

    fn post_request(uri: &str) -> Request<Body> {
        Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let (app, _) = app();
        let uri = format!("/jobs/{}", Uuid::new_v4());
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_finished_job_is_served_from_its_row() {
        let (app, store) = app();
        let mut state = JobState::pending(Utc::now());
        state.status = JobStatus::Completed;
        state.progress = 100;
        let record = ExportJobRecord {
            id: Uuid::new_v4(),
            data_model_id: Uuid::new_v4(),
            format: "csv".to_string(),
            filters: ExportFilters::default(),
            columns: Vec::new(),
            state,
        };
        let id = record.id;
        store.insert_export(record);

        let uri = format!("/jobs/{}", id);
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "COMPLETED");
        assert_eq!(value["progress"], 100);
    }

    #[tokio::test]
    async fn test_submit_missing_row_is_not_found() {
        let (app, _) = app();
        let response = app
            .oneshot(post_request(&format!("/jobs/import/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_submit_finished_job_conflicts() {
        let (app, store) = app();
        let mut state = JobState::pending(Utc::now());
        state.status = JobStatus::Completed;
        let record = ExportJobRecord {
            id: Uuid::new_v4(),
            data_model_id: Uuid::new_v4(),
            format: "csv".to_string(),
            filters: ExportFilters::default(),
            columns: Vec::new(),
            state,
        };
        let id = record.id;
        store.insert_export(record);

        let response = app.oneshot(post_request(&format!("/jobs/export/{}", id))).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_reports_false() {
        let (app, _) = app();
        let response = app
            .oneshot(post_request(&format!("/jobs/{}/cancel", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["cancelled"], false);
    }

    #[tokio::test]
    async fn test_reconcile_with_nothing_pending() {
        let (app, _) = app();
        let response = app.oneshot(post_request("/jobs/reconcile")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["reclaimed"], 0);
        assert_eq!(value["enqueued"], 0);
    }
}
