//! Background retention sweep.
//!
//! Periodically deletes artifacts older than the retention window and
//! forgets the jobs that referenced them. Started once at boot and stopped
//! during graceful shutdown.

use crate::models::artifact::SweepReport;
use crate::services::artifact_store::{ArtifactStore, StoreResult};
use crate::services::job_tracker::JobTracker;
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

pub struct RetentionSweeper {
    store: ArtifactStore,
    tracker: JobTracker,
    interval: Duration,
    max_age: Duration,
}

/// Running sweeper; dropping it without `stop` leaves the task detached.
pub struct SweeperHandle {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the loop and wait for it to exit; an in-progress pass finishes first.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(err) = self.task.await {
            error!("retention sweeper panicked: {}", err);
        }
    }
}

impl RetentionSweeper {
    pub fn new(
        store: ArtifactStore,
        tracker: JobTracker,
        interval: Duration,
        max_age: Duration,
    ) -> Self {
        Self {
            store,
            tracker,
            interval,
            max_age,
        }
    }

    /// One pass: sweep the store, then drop jobs for deleted artifacts.
    pub async fn sweep_once(&self) -> StoreResult<SweepReport> {
        let report = self.store.sweep(SystemTime::now(), self.max_age).await?;
        let forgotten = self.tracker.forget_artifacts(&report.deleted).await;
        if report.deleted.is_empty() && report.failed == 0 {
            debug!(
                "retention sweep: nothing expired ({} retained, {} jobs tracked)",
                report.retained,
                self.tracker.len().await
            );
        } else {
            info!(
                "retention sweep: {} deleted, {} retained, {} failed, {} jobs forgotten",
                report.deleted.len(),
                report.retained,
                report.failed,
                forgotten
            );
        }
        Ok(report)
    }

    /// Spawn the sweep loop. The first pass runs immediately.
    pub fn start(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        info!(
            "starting retention sweeper (every {:?}, max age {:?})",
            self.interval, self.max_age
        );

        let task = tokio::spawn(async move {
            let mut ticker = time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.sweep_once().await {
                            error!("retention sweep failed: {}", err);
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("retention sweeper stopped");
                        break;
                    }
                }
            }
        });

        SweeperHandle { shutdown_tx, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::options::{Operation, ProcessingOptions};
    use bytes::Bytes;
    use tempfile::TempDir;

    async fn put(store: &ArtifactStore, ext: &str) -> String {
        let body = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(b"x"))]);
        store.put_stream(ext, body).await.unwrap().id
    }

    fn age(store: &ArtifactStore, id: &str, by: Duration) {
        std::fs::File::options()
            .write(true)
            .open(store.path_for(id).unwrap())
            .unwrap()
            .set_modified(SystemTime::now() - by)
            .unwrap();
    }

    #[tokio::test]
    async fn sweep_forgets_jobs_of_deleted_artifacts() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path(), 1024, Duration::from_secs(3600))
            .await
            .unwrap();
        let tracker = JobTracker::new();

        let old = put(&store, "pdf").await;
        let fresh = put(&store, "pdf").await;
        age(&store, &old, Duration::from_secs(61 * 60));
        age(&store, &fresh, Duration::from_secs(30 * 60));
        tracker
            .create(&old, Operation::Compress, ProcessingOptions::default())
            .await;
        let kept = tracker
            .create(&fresh, Operation::Compress, ProcessingOptions::default())
            .await;

        let sweeper = RetentionSweeper::new(
            store.clone(),
            tracker.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        let report = sweeper.sweep_once().await.unwrap();

        assert_eq!(report.deleted, vec![old]);
        assert_eq!(report.retained, 1);
        assert_eq!(tracker.len().await, 1);
        assert!(tracker.get(kept.id).await.is_ok());
    }

    #[tokio::test]
    async fn start_runs_a_pass_and_stop_joins() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path(), 1024, Duration::from_secs(3600))
            .await
            .unwrap();
        let old = put(&store, "jpg").await;
        age(&store, &old, Duration::from_secs(2 * 3600));

        let handle = RetentionSweeper::new(
            store.clone(),
            JobTracker::new(),
            Duration::from_millis(20),
            Duration::from_secs(3600),
        )
        .start();

        let path = store.path_for(&old).unwrap();
        for _ in 0..100 {
            if !path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!path.exists());

        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .unwrap();
    }
}
