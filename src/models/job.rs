//! Transform jobs: one per compression or conversion request.

use crate::errors::ErrorKind;
use crate::models::options::{Operation, ProcessingOptions};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, strategy not yet running.
    Pending,
    /// Engine invocation in progress.
    Running,
    /// Result artifact registered.
    Succeeded,
    /// Failed with an error kind; no result artifact.
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Sizes and result id recorded on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub result_artifact_id: String,
    pub original_size: u64,
    pub result_size: u64,
    /// `result_size / original_size`, rounded to two decimals.
    pub ratio: f64,
}

impl JobResult {
    pub fn new(result_artifact_id: String, original_size: u64, result_size: u64) -> Self {
        Self {
            result_artifact_id,
            original_size,
            result_size,
            ratio: size_ratio(original_size, result_size),
        }
    }
}

/// A compression or conversion job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub source_artifact_id: String,
    pub operation: Operation,
    pub requested_options: ProcessingOptions,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(source_artifact_id: String, operation: Operation, options: ProcessingOptions) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_artifact_id,
            operation,
            requested_options: options,
            status: JobStatus::Pending,
            result: None,
            error_kind: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True if either the source or the result artifact is in `ids`.
    pub fn references_any(&self, ids: &[String]) -> bool {
        ids.iter().any(|id| {
            *id == self.source_artifact_id
                || self
                    .result
                    .as_ref()
                    .is_some_and(|r| r.result_artifact_id == *id)
        })
    }
}

/// Ratio of result to original size, rounded to two decimals.
/// An empty original yields 0.
pub fn size_ratio(original_size: u64, result_size: u64) -> f64 {
    if original_size == 0 {
        return 0.0;
    }
    let ratio = result_size as f64 / original_size as f64;
    (ratio * 100.0).round() / 100.0
}
