//! External engine invocation.
//!
//! Each tool sits behind the [`Engine`] trait. The [`EngineInvoker`] picks
//! the engine for a strategy, checks that every path handed to it lives in
//! the store root, runs it, and refuses to report success unless a
//! non-empty output file exists.

pub mod ffmpeg;
pub mod ghostscript;
pub mod imagemagick;
pub mod libreoffice;
pub mod process;
pub mod raster;

use crate::config::AppConfig;
use crate::services::strategy::Strategy;
use async_trait::async_trait;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("{tool} did not finish within {after:?}")]
    Timeout { tool: String, after: Duration },

    #[error("{tool} reported success but produced no output at {}", path.display())]
    NoOutput { tool: String, path: PathBuf },

    #[error("path {} is outside the managed store root", .0.display())]
    PathOutsideRoot(PathBuf),

    #[error("probe failed: {0}")]
    Probe(String),

    #[error("image processing failed: {0}")]
    Image(String),

    #[error("no engine registered for strategy {0}")]
    Unhandled(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl EngineError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::Timeout { .. })
    }
}

/// Everything an engine needs for one run.
#[derive(Debug, Clone)]
pub struct EngineJob {
    /// Source artifact, inside the store root.
    pub input: PathBuf,
    /// Where the result must be written, inside the store root.
    pub output: PathBuf,
    /// Scratch directory for side files (two-pass logs, office output).
    pub workdir: PathBuf,
    /// Upper bound for each external process.
    pub timeout: Duration,
}

/// A capability wrapper around one external tool (or in-process codec).
#[async_trait]
pub trait Engine: Send + Sync {
    /// Short name for logs and preflight reports.
    fn name(&self) -> &'static str;

    fn handles(&self, strategy: &Strategy) -> bool;

    /// Startup check; an error here names the missing dependency.
    async fn check_available(&self) -> Result<(), EngineError>;

    async fn execute(&self, strategy: &Strategy, job: &EngineJob) -> Result<(), EngineError>;
}

/// Routes strategies to engines and enforces the output contract.
#[derive(Clone)]
pub struct EngineInvoker {
    root: PathBuf,
    timeout: Duration,
    engines: Vec<Arc<dyn Engine>>,
}

impl EngineInvoker {
    pub fn new(root: impl Into<PathBuf>, timeout: Duration, engines: Vec<Arc<dyn Engine>>) -> Self {
        Self {
            root: root.into(),
            timeout,
            engines,
        }
    }

    /// The standard engine set with binaries taken from configuration.
    pub fn from_config(cfg: &AppConfig, root: impl Into<PathBuf>) -> Self {
        let engines: Vec<Arc<dyn Engine>> = vec![
            Arc::new(raster::RasterEngine),
            Arc::new(ghostscript::GhostscriptEngine::new(cfg.ghostscript_bin.clone())),
            Arc::new(ffmpeg::FfmpegEngine::new(
                cfg.ffmpeg_bin.clone(),
                cfg.ffprobe_bin.clone(),
            )),
            Arc::new(libreoffice::LibreOfficeEngine::new(cfg.libreoffice_bin.clone())),
            Arc::new(imagemagick::ImageMagickEngine::new(cfg.imagemagick_bin.clone())),
        ];
        Self::new(root, cfg.engine_timeout, engines)
    }

    /// Run every engine's availability check.
    pub async fn preflight(&self) -> Vec<(&'static str, Result<(), EngineError>)> {
        let mut report = Vec::with_capacity(self.engines.len());
        for engine in &self.engines {
            let result = engine.check_available().await;
            match &result {
                Ok(()) => info!("engine {} available", engine.name()),
                Err(err) => tracing::error!("engine {} unavailable: {}", engine.name(), err),
            }
            report.push((engine.name(), result));
        }
        report
    }

    /// Execute `strategy` reading `input` and producing `output`.
    pub async fn invoke(
        &self,
        strategy: &Strategy,
        input: &Path,
        output: &Path,
    ) -> Result<PathBuf, EngineError> {
        let input = ensure_within_root(&self.root, input)?;
        let output = ensure_within_root(&self.root, output)?;

        let engine = self
            .engines
            .iter()
            .find(|engine| engine.handles(strategy))
            .ok_or(EngineError::Unhandled(strategy.name()))?;

        let job = EngineJob {
            input,
            output,
            workdir: self.root.clone(),
            timeout: self.timeout,
        };
        debug!(
            "{} via {}: {} -> {}",
            strategy.name(),
            engine.name(),
            job.input.display(),
            job.output.display()
        );
        engine.execute(strategy, &job).await?;

        match tokio::fs::metadata(&job.output).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(job.output),
            Ok(_) => Err(EngineError::NoOutput {
                tool: engine.name().to_string(),
                path: job.output,
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(EngineError::NoOutput {
                tool: engine.name().to_string(),
                path: job.output,
            }),
            Err(err) => Err(EngineError::Io(err)),
        }
    }
}

/// Resolve `path` and require that it sits directly in `root`.
///
/// The file itself may not exist yet (outputs), so the parent directory is
/// canonicalized and the final component must be a plain file name.
pub fn ensure_within_root(root: &Path, path: &Path) -> Result<PathBuf, EngineError> {
    let outside = || EngineError::PathOutsideRoot(path.to_path_buf());
    let file_name = path.file_name().ok_or_else(outside)?;
    if file_name == ".." || file_name == "." {
        return Err(outside());
    }
    let parent = path.parent().ok_or_else(outside)?;
    let parent = std::fs::canonicalize(parent).map_err(|_| outside())?;
    let root = std::fs::canonicalize(root).map_err(|_| outside())?;
    if parent != root {
        return Err(outside());
    }
    Ok(parent.join(file_name))
}
