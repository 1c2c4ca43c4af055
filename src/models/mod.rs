//! Core data models for the transform pipeline.
//!
//! Artifacts are files in the store, jobs are the lifetime of one transform
//! request, and options are what the client asked for. All of them
//! serialize as camelCase JSON for the browser client.

pub mod artifact;
pub mod job;
pub mod options;
