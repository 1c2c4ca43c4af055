//! The transform pipeline: classify, select, run the engine, record the job.
//!
//! Requests are resolved synchronously; the job record exists so clients
//! (and logs) can refer to a transform after the fact.

use crate::errors::ErrorKind;
use crate::models::artifact::{Artifact, DerivedNaming};
use crate::models::job::{Job, JobResult};
use crate::models::options::{Operation, ProcessingOptions};
use crate::services::artifact_store::{ArtifactStore, StoreError, derived_id};
use crate::services::classifier::classify;
use crate::services::engine::{EngineError, EngineInvoker};
use crate::services::job_tracker::{JobTracker, TransitionError};
use crate::services::strategy::{self, Strategy};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Busy(String),

    #[error("{label} failed: {source}")]
    Engine {
        label: &'static str,
        #[source]
        source: EngineError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl TransformError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransformError::Validation(_) => ErrorKind::ValidationError,
            TransformError::Busy(_) => ErrorKind::BusyError,
            TransformError::Engine { source, .. } if source.is_timeout() => {
                ErrorKind::EngineTimeout
            }
            TransformError::Engine { .. } => ErrorKind::EngineError,
            TransformError::Store(StoreError::NotFound(_) | StoreError::InvalidId(_)) => {
                ErrorKind::NotFoundError
            }
            TransformError::Store(StoreError::TooLarge { .. }) => ErrorKind::ValidationError,
            TransformError::Store(StoreError::Io(_)) | TransformError::Transition(_) => {
                ErrorKind::StorageError
            }
        }
    }
}

/// A finished transform.
#[derive(Debug, Clone)]
pub struct TransformOutcome {
    pub job: Job,
    pub source: Artifact,
    pub result: Artifact,
    pub strategy: Strategy,
}

/// Ids with a transform in flight, either as source or as output.
#[derive(Debug, Default)]
struct InFlight(Mutex<HashSet<String>>);

impl InFlight {
    /// Claim every id or none of them.
    fn claim(self: &Arc<Self>, ids: &[&str]) -> Option<InFlightGuard> {
        let mut held = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if ids.iter().any(|id| held.contains(*id)) {
            return None;
        }
        let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        held.extend(ids.iter().cloned());
        Some(InFlightGuard {
            owner: Arc::clone(self),
            ids,
        })
    }
}

struct InFlightGuard {
    owner: Arc<InFlight>,
    ids: Vec<String>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut held = self
            .owner
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for id in &self.ids {
            held.remove(id);
        }
    }
}

/// Cheap to clone; clones share the store, job table and in-flight set.
#[derive(Clone)]
pub struct TransformService {
    store: ArtifactStore,
    tracker: JobTracker,
    invoker: EngineInvoker,
    in_flight: Arc<InFlight>,
}

impl TransformService {
    pub fn new(store: ArtifactStore, tracker: JobTracker, invoker: EngineInvoker) -> Self {
        Self {
            store,
            tracker,
            invoker,
            in_flight: Arc::default(),
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    pub async fn compress(
        &self,
        source_id: &str,
        options: ProcessingOptions,
    ) -> Result<TransformOutcome, TransformError> {
        self.run(source_id, Operation::Compress, options).await
    }

    pub async fn convert(
        &self,
        source_id: &str,
        options: ProcessingOptions,
    ) -> Result<TransformOutcome, TransformError> {
        self.run(source_id, Operation::Convert, options).await
    }

    async fn run(
        &self,
        source_id: &str,
        operation: Operation,
        options: ProcessingOptions,
    ) -> Result<TransformOutcome, TransformError> {
        let source = self.store.get(source_id).await?;

        // Everything below up to the engine call is validation; nothing is
        // spawned and no job is recorded if it fails.
        let category = classify(source.extension()).map_err(|_| {
            TransformError::Validation(format!("Unsupported file type for {}", noun(operation)))
        })?;
        let strategy = strategy::select(category, operation, source.extension(), &options)
            .map_err(|err| TransformError::Validation(err.to_string()))?;
        let naming = match operation {
            Operation::Compress => DerivedNaming::Compressed,
            Operation::Convert => DerivedNaming::Converted,
        };
        let candidate = derived_id(naming, source_id, strategy.output_extension())?;

        let Some(_guard) = self.in_flight.claim(&[source_id, &candidate]) else {
            return Err(TransformError::Busy(
                "File is already being processed".to_string(),
            ));
        };
        let output_id = self.store.unused_id(candidate, naming).await?;

        let job = self.tracker.create(source_id, operation, options).await;
        self.tracker.start(job.id).await?;
        info!(
            "job {}: {} {} -> {} ({})",
            job.id,
            operation,
            source_id,
            output_id,
            strategy.name()
        );

        let input = self.store.path_for(source_id)?;
        let output = self.store.path_for(&output_id)?;
        if let Err(source_err) = self.invoker.invoke(&strategy, &input, &output).await {
            self.store.discard(&output_id).await;
            let err = TransformError::Engine {
                label: strategy.label(),
                source: source_err,
            };
            self.record_failure(job.id, err.kind()).await;
            return Err(err);
        }

        let result = match self.store.adopt(&output_id).await {
            Ok(result) => result,
            Err(err) => {
                self.store.discard(&output_id).await;
                let err = TransformError::from(err);
                self.record_failure(job.id, err.kind()).await;
                return Err(err);
            }
        };

        let job = self
            .tracker
            .succeed(
                job.id,
                JobResult::new(result.id.clone(), source.size_bytes, result.size_bytes),
            )
            .await?;
        info!(
            "job {} succeeded: {} -> {} bytes",
            job.id, source.size_bytes, result.size_bytes
        );

        Ok(TransformOutcome {
            job,
            source,
            result,
            strategy,
        })
    }

    async fn record_failure(&self, job_id: uuid::Uuid, kind: ErrorKind) {
        if let Err(err) = self.tracker.fail(job_id, kind).await {
            warn!("could not mark job {} failed: {}", job_id, err);
        }
    }
}

fn noun(operation: Operation) -> &'static str {
    match operation {
        Operation::Compress => "compression",
        Operation::Convert => "conversion",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::JobStatus;
    use crate::models::options::QualityParam;
    use crate::services::engine::raster::RasterEngine;
    use crate::services::engine::{Engine, EngineJob, process};
    use crate::test_support::noisy_jpeg;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Stands in for an external tool that never finishes in time.
    struct HangingEngine;

    #[async_trait]
    impl Engine for HangingEngine {
        fn name(&self) -> &'static str {
            "hanging"
        }

        fn handles(&self, _strategy: &Strategy) -> bool {
            true
        }

        async fn check_available(&self) -> Result<(), EngineError> {
            Ok(())
        }

        async fn execute(&self, _strategy: &Strategy, job: &EngineJob) -> Result<(), EngineError> {
            tokio::fs::write(&job.output, b"partial").await?;
            let mut cmd = tokio::process::Command::new("sleep");
            cmd.arg("30");
            process::run("sleep", cmd, job.timeout).await?;
            Ok(())
        }
    }

    /// Blocks until released, so a second request can race it.
    struct GatedEngine {
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Engine for GatedEngine {
        fn name(&self) -> &'static str {
            "gated"
        }

        fn handles(&self, _strategy: &Strategy) -> bool {
            true
        }

        async fn check_available(&self) -> Result<(), EngineError> {
            Ok(())
        }

        async fn execute(&self, _strategy: &Strategy, job: &EngineJob) -> Result<(), EngineError> {
            self.started.notify_one();
            self.release.notified().await;
            tokio::fs::write(&job.output, b"%PDF-1.4 done").await?;
            Ok(())
        }
    }

    async fn service(
        dir: &TempDir,
        engine: Arc<dyn Engine>,
        timeout: Duration,
    ) -> TransformService {
        let store = ArtifactStore::open(dir.path(), 10 * 1024 * 1024, Duration::from_secs(3600))
            .await
            .unwrap();
        let invoker = EngineInvoker::new(store.root(), timeout, vec![engine]);
        TransformService::new(store, JobTracker::new(), invoker)
    }

    async fn upload(service: &TransformService, ext: &str, bytes: Vec<u8>) -> Artifact {
        let stream = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(bytes))]);
        service.store().put_stream(ext, stream).await.unwrap()
    }

    fn quality(level: i64) -> ProcessingOptions {
        ProcessingOptions {
            quality: Some(QualityParam::Level(level)),
            format: Some("original".into()),
            max_size: None,
        }
    }

    #[tokio::test]
    async fn jpeg_compression_end_to_end() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, Arc::new(RasterEngine), Duration::from_secs(60)).await;
        let source = upload(&service, "jpg", noisy_jpeg(320, 240, 100)).await;

        let outcome = service.compress(&source.id, quality(50)).await.unwrap();

        assert_eq!(outcome.result.id, format!("compressed-{}", source.id));
        assert!(outcome.result.size_bytes < source.size_bytes);
        assert_eq!(outcome.job.status, JobStatus::Succeeded);
        let recorded = outcome.job.result.as_ref().unwrap();
        assert_eq!(recorded.result_artifact_id, outcome.result.id);
        assert!(recorded.ratio < 1.0);
        let bytes = std::fs::read(service.store().path_for(&outcome.result.id).unwrap()).unwrap();
        assert!(image::load_from_memory(&bytes).is_ok());
    }

    #[tokio::test]
    async fn office_to_image_is_rejected_before_any_job() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, Arc::new(HangingEngine), Duration::from_secs(60)).await;
        let source = upload(&service, "docx", b"PK\x03\x04".to_vec()).await;

        let err = service
            .convert(
                &source.id,
                ProcessingOptions {
                    format: Some("png".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert_eq!(err.to_string(), "Office documents can only be converted to PDF");
        assert_eq!(service.tracker().len().await, 0);
    }

    #[tokio::test]
    async fn timeout_fails_job_and_discards_output() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, Arc::new(HangingEngine), Duration::from_millis(300)).await;
        let source = upload(&service, "pdf", b"%PDF-1.4".to_vec()).await;

        let err = service
            .compress(&source.id, ProcessingOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::EngineTimeout);
        let output_id = format!("compressed-{}", source.id);
        assert!(!service.store().path_for(&output_id).unwrap().exists());
        assert!(service.store().get(&output_id).await.is_err());
    }

    #[tokio::test]
    async fn failed_job_is_recorded_without_result() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, Arc::new(HangingEngine), Duration::from_millis(300)).await;
        let source = upload(&service, "mp4", b"not really a video".to_vec()).await;

        service
            .compress(&source.id, ProcessingOptions::default())
            .await
            .unwrap_err();

        assert_eq!(service.tracker().len().await, 1);
        assert_eq!(
            service
                .tracker()
                .forget_artifacts(&[source.id.clone()])
                .await,
            1
        );
    }

    #[tokio::test]
    async fn concurrent_transform_of_same_source_is_busy() {
        let dir = TempDir::new().unwrap();
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let engine = GatedEngine {
            started: started.clone(),
            release: release.clone(),
        };
        let service = service(&dir, Arc::new(engine), Duration::from_secs(30)).await;
        let source = upload(&service, "pdf", b"%PDF-1.4".to_vec()).await;

        let first = {
            let service = service.clone();
            let id = source.id.clone();
            tokio::spawn(async move { service.compress(&id, ProcessingOptions::default()).await })
        };
        started.notified().await;

        let err = service
            .compress(&source.id, ProcessingOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BusyError);

        release.notify_one();
        let outcome = first.await.unwrap().unwrap();
        assert_eq!(outcome.job.status, JobStatus::Succeeded);

        // Released once the first transform finished.
        let again = service.compress(&source.id, ProcessingOptions::default());
        release.notify_one();
        assert!(again.await.is_ok());
    }

    fn to_format(format: &str) -> ProcessingOptions {
        ProcessingOptions {
            format: Some(format.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn round_trip_conversion_keeps_the_original() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, Arc::new(RasterEngine), Duration::from_secs(60)).await;
        let original = noisy_jpeg(64, 48, 90);
        let source = upload(&service, "jpg", original.clone()).await;

        let png = service.convert(&source.id, to_format("png")).await.unwrap();
        let stem = source.id.trim_end_matches(".jpg");
        assert_eq!(png.result.id, format!("{stem}.png"));

        let back = service.convert(&png.result.id, to_format("jpg")).await.unwrap();
        assert_ne!(back.result.id, source.id);
        assert!(back.result.id.starts_with("converted-"));
        assert!(back.result.id.ends_with(".jpg"));

        let stored = std::fs::read(service.store().path_for(&source.id).unwrap()).unwrap();
        assert_eq!(stored, original);
    }

    #[tokio::test]
    async fn repeated_compression_keeps_earlier_results() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, Arc::new(RasterEngine), Duration::from_secs(60)).await;
        let source = upload(&service, "jpg", noisy_jpeg(64, 48, 100)).await;

        let first = service.compress(&source.id, quality(80)).await.unwrap();
        let first_bytes = std::fs::read(service.store().path_for(&first.result.id).unwrap()).unwrap();
        let second = service.compress(&source.id, quality(10)).await.unwrap();

        assert_eq!(first.result.id, format!("compressed-{}", source.id));
        assert_ne!(second.result.id, first.result.id);
        assert!(second.result.id.starts_with("compressed-"));
        let still = std::fs::read(service.store().path_for(&first.result.id).unwrap()).unwrap();
        assert_eq!(still, first_bytes);
    }

    #[tokio::test]
    async fn missing_source_is_not_found() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, Arc::new(RasterEngine), Duration::from_secs(5)).await;
        let err = service
            .compress(
                &format!("{}.jpg", uuid::Uuid::new_v4()),
                ProcessingOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFoundError);
    }
}
