//! ImageMagick conversions between raster images and PDF.

use super::{Engine, EngineError, EngineJob, process};
use crate::services::strategy::Strategy;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct ImageMagickEngine {
    binary: String,
}

impl ImageMagickEngine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Wrap a raster image into a single-page PDF.
    pub fn build_image_to_pdf(&self, input: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(input).arg(output);
        cmd
    }

    /// Rasterize the first page of a PDF; the output extension picks the codec.
    pub fn build_pdf_to_image(&self, input: &Path, output: &Path) -> Command {
        let mut first_page = OsString::from(input.as_os_str());
        first_page.push("[0]");
        let mut cmd = Command::new(&self.binary);
        cmd.arg(first_page).arg(output);
        cmd
    }
}

#[async_trait]
impl Engine for ImageMagickEngine {
    fn name(&self) -> &'static str {
        "imagemagick"
    }

    fn handles(&self, strategy: &Strategy) -> bool {
        matches!(strategy, Strategy::ImageToPdf | Strategy::PdfToImage { .. })
    }

    async fn check_available(&self) -> Result<(), EngineError> {
        process::probe_binary(self.name(), &self.binary, "-version").await
    }

    async fn execute(&self, strategy: &Strategy, job: &EngineJob) -> Result<(), EngineError> {
        let cmd = match strategy {
            Strategy::ImageToPdf => self.build_image_to_pdf(&job.input, &job.output),
            Strategy::PdfToImage { .. } => self.build_pdf_to_image(&job.input, &job.output),
            _ => return Err(EngineError::Unhandled(strategy.name())),
        };
        process::run(self.name(), cmd, job.timeout).await?;
        Ok(())
    }
}
