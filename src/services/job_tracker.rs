//! In-memory job registry with an explicit state machine.
//!
//! Legal transitions are `pending -> running -> succeeded | failed`, plus
//! `pending -> failed` for jobs that die before the engine starts.
//! Terminal states are final.

use crate::errors::ErrorKind;
use crate::models::job::{Job, JobResult, JobStatus};
use crate::models::options::{Operation, ProcessingOptions};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("job {0} not found")]
    UnknownJob(Uuid),
    #[error("job {id} cannot move from {from} to {to}")]
    Illegal {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Shared handle to the job table; clones see the same jobs.
#[derive(Clone, Debug, Default)]
pub struct JobTracker {
    jobs: Arc<RwLock<HashMap<Uuid, Job>>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending job and return a snapshot of it.
    pub async fn create(
        &self,
        source_artifact_id: &str,
        operation: Operation,
        options: ProcessingOptions,
    ) -> Job {
        let job = Job::new(source_artifact_id.to_string(), operation, options);
        self.jobs.write().await.insert(job.id, job.clone());
        debug!("job {} created for {} ({})", job.id, source_artifact_id, operation);
        job
    }

    pub async fn start(&self, id: Uuid) -> Result<Job, TransitionError> {
        self.transition(id, JobStatus::Running, |_| {}).await
    }

    pub async fn succeed(&self, id: Uuid, result: JobResult) -> Result<Job, TransitionError> {
        self.transition(id, JobStatus::Succeeded, |job| job.result = Some(result))
            .await
    }

    pub async fn fail(&self, id: Uuid, kind: ErrorKind) -> Result<Job, TransitionError> {
        self.transition(id, JobStatus::Failed, |job| job.error_kind = Some(kind))
            .await
    }

    pub async fn get(&self, id: Uuid) -> Result<Job, TransitionError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(TransitionError::UnknownJob(id))
    }

    /// Drop every job whose source or result is one of `artifact_ids`.
    /// Returns how many were removed.
    pub async fn forget_artifacts(&self, artifact_ids: &[String]) -> usize {
        if artifact_ids.is_empty() {
            return 0;
        }
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| !job.references_any(artifact_ids));
        before - jobs.len()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    async fn transition(
        &self,
        id: Uuid,
        to: JobStatus,
        apply: impl FnOnce(&mut Job),
    ) -> Result<Job, TransitionError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(TransitionError::UnknownJob(id))?;
        if !is_legal(job.status, to) {
            return Err(TransitionError::Illegal {
                id,
                from: job.status,
                to,
            });
        }
        apply(job);
        job.status = to;
        job.updated_at = Utc::now();
        debug!("job {} -> {}", id, to);
        Ok(job.clone())
    }
}

fn is_legal(from: JobStatus, to: JobStatus) -> bool {
    matches!(
        (from, to),
        (JobStatus::Pending, JobStatus::Running)
            | (JobStatus::Pending, JobStatus::Failed)
            | (JobStatus::Running, JobStatus::Succeeded)
            | (JobStatus::Running, JobStatus::Failed)
    )
}
