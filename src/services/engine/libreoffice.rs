//! LibreOffice headless conversion of office documents to PDF.

use super::{Engine, EngineError, EngineJob, ensure_within_root, process};
use crate::services::strategy::Strategy;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct LibreOfficeEngine {
    binary: String,
}

impl LibreOfficeEngine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// `soffice` run with a throwaway user profile so concurrent
    /// conversions do not fight over the default one.
    pub fn build_command(&self, profile_dir: &Path, outdir: &Path, input: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["--headless", "--norestore"])
            .arg(format!("-env:UserInstallation=file://{}", profile_dir.display()))
            .args(["--convert-to", "pdf", "--outdir"])
            .arg(outdir)
            .arg(input);
        cmd
    }
}

/// Where soffice writes its result: the input's stem with a `.pdf` extension.
pub fn produced_path(outdir: &Path, input: &Path) -> PathBuf {
    let stem = input.file_stem().unwrap_or_default();
    outdir.join(stem).with_extension("pdf")
}

/// Private profile and output directories, both hidden entries of
/// `workdir` and removed on drop.
fn scratch_dirs(workdir: &Path) -> Result<(TempDir, TempDir), EngineError> {
    let profile = tempfile::Builder::new()
        .prefix(".soffice-profile-")
        .tempdir_in(workdir)?;
    let outdir = tempfile::Builder::new()
        .prefix(".soffice-out-")
        .tempdir_in(workdir)?;
    ensure_within_root(workdir, profile.path())?;
    ensure_within_root(workdir, outdir.path())?;
    Ok((profile, outdir))
}

#[async_trait]
impl Engine for LibreOfficeEngine {
    fn name(&self) -> &'static str {
        "libreoffice"
    }

    fn handles(&self, strategy: &Strategy) -> bool {
        matches!(strategy, Strategy::OfficeToPdf)
    }

    async fn check_available(&self) -> Result<(), EngineError> {
        process::probe_binary(self.name(), &self.binary, "--version").await
    }

    async fn execute(&self, strategy: &Strategy, job: &EngineJob) -> Result<(), EngineError> {
        if !self.handles(strategy) {
            return Err(EngineError::Unhandled(strategy.name()));
        }
        let (profile, outdir) = scratch_dirs(&job.workdir)?;

        let cmd = self.build_command(profile.path(), outdir.path(), &job.input);
        process::run(self.name(), cmd, job.timeout).await?;

        let produced = produced_path(outdir.path(), &job.input);
        match tokio::fs::rename(&produced, &job.output).await {
            Ok(()) => {
                debug!("moved {} to {}", produced.display(), job.output.display());
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(EngineError::NoOutput {
                tool: self.name().to_string(),
                path: produced,
            }),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::engine::process::command_args;

    #[test]
    fn command_is_headless_with_private_profile() {
        let engine = LibreOfficeEngine::new("soffice");
        let cmd = engine.build_command(
            Path::new("/tmp/profile-1"),
            Path::new("/store/.out"),
            Path::new("/store/report.docx"),
        );
        let args = command_args(&cmd);
        assert_eq!(
            args,
            [
                "--headless",
                "--norestore",
                "-env:UserInstallation=file:///tmp/profile-1",
                "--convert-to",
                "pdf",
                "--outdir",
                "/store/.out",
                "/store/report.docx",
            ]
        );
    }

    #[test]
    fn produced_path_swaps_extension() {
        assert_eq!(
            produced_path(Path::new("/store/.out"), Path::new("/store/abc.pptx")),
            PathBuf::from("/store/.out/abc.pdf")
        );
    }

    #[test]
    fn scratch_dirs_live_in_the_workdir() {
        let store = TempDir::new().unwrap();
        let root = std::fs::canonicalize(store.path()).unwrap();
        let (profile, outdir) = scratch_dirs(&root).unwrap();

        for dir in [profile.path(), outdir.path()] {
            assert_eq!(dir.parent(), Some(root.as_path()));
            let name = dir.file_name().unwrap().to_string_lossy();
            assert!(name.starts_with(".soffice-"), "{name}");
        }
        assert_ne!(profile.path(), outdir.path());

        let (profile_path, outdir_path) = (profile.path().to_path_buf(), outdir.path().to_path_buf());
        drop((profile, outdir));
        assert!(!profile_path.exists() && !outdir_path.exists());
    }

    #[tokio::test]
    async fn missing_binary_fails_preflight() {
        let engine = LibreOfficeEngine::new("soffice-not-installed-here");
        assert!(matches!(
            engine.check_available().await,
            Err(EngineError::Spawn { .. })
        ));
    }
}
