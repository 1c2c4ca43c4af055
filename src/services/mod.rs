//! Pipeline services: storage, classification, strategy selection, engine
//! invocation, job tracking and retention.

pub mod artifact_store;
pub mod classifier;
pub mod engine;
pub mod job_tracker;
pub mod pipeline;
pub mod strategy;
pub mod sweeper;
