//! Shared state handed to every handler.

use crate::services::artifact_store::ArtifactStore;
use crate::services::job_tracker::JobTracker;
use crate::services::pipeline::TransformService;

#[derive(Clone)]
pub struct AppState {
    pub transforms: TransformService,
    /// Maximum number of files accepted by one upload request.
    pub max_files: usize,
}

impl AppState {
    pub fn new(transforms: TransformService, max_files: usize) -> Self {
        Self {
            transforms,
            max_files,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        self.transforms.store()
    }

    pub fn tracker(&self) -> &JobTracker {
        self.transforms.tracker()
    }
}
