//! HTTP feature slices
//!
//! - **jobs**: job status, submission, cancellation and reconciliation

pub mod jobs;

use axum::Router;
use std::sync::Arc;

use crate::jobs::{JobQueue, JobStore};

/// Shared state for feature routes
#[derive(Clone)]
pub struct FeatureState {
    /// Queue the handlers submit to and read from
    pub queue: JobQueue,
    /// Durable job rows, read when a job is submitted
    pub jobs: Arc<dyn JobStore>,
}

/// API router with every feature mounted
pub fn router(state: FeatureState) -> Router<()> {
    Router::new().merge(jobs::jobs_routes().with_state(state))
}
