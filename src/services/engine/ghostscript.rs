//! Ghostscript PDF recompression.

use super::{Engine, EngineError, EngineJob, process};
use crate::services::strategy::{QualityTier, Strategy, pdf_settings};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct GhostscriptEngine {
    binary: String,
}

impl GhostscriptEngine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// `gs` invocation rewriting `input` through the pdfwrite device.
    pub fn build_command(&self, tier: QualityTier, input: &Path, output: &Path) -> Command {
        let settings = pdf_settings(tier);
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-sDEVICE=pdfwrite")
            .arg("-dCompatibilityLevel=1.4")
            .arg("-dNOPAUSE")
            .arg("-dQUIET")
            .arg("-dBATCH")
            .arg("-dSAFER")
            .arg(format!("-dPDFSETTINGS=/{}", settings.preset))
            .arg("-dColorImageDownsampleType=/Bicubic")
            .arg(format!("-dColorImageResolution={}", settings.resolution_dpi))
            .arg(format!("-sOutputFile={}", output.display()))
            .arg(input);
        cmd
    }
}

#[async_trait]
impl Engine for GhostscriptEngine {
    fn name(&self) -> &'static str {
        "ghostscript"
    }

    fn handles(&self, strategy: &Strategy) -> bool {
        matches!(strategy, Strategy::PdfRecompress { .. })
    }

    async fn check_available(&self) -> Result<(), EngineError> {
        process::probe_binary(self.name(), &self.binary, "--version").await
    }

    async fn execute(&self, strategy: &Strategy, job: &EngineJob) -> Result<(), EngineError> {
        let Strategy::PdfRecompress { tier } = strategy else {
            return Err(EngineError::Unhandled(strategy.name()));
        };
        let cmd = self.build_command(*tier, &job.input, &job.output);
        process::run(self.name(), cmd, job.timeout).await?;
        Ok(())
    }
}
