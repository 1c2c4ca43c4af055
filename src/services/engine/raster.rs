//! In-process raster engine: decode, optional downscale, re-encode.

use super::{Engine, EngineError, EngineJob};
use crate::services::strategy::{DEFAULT_IMAGE_QUALITY, Strategy, downscale_dimensions};
use async_trait::async_trait;
use image::codecs::gif::GifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, GenericImageView, ImageEncoder};
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Handles image recompression and image-to-image conversion with the
/// `image` crate on the blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct RasterEngine;

#[async_trait]
impl Engine for RasterEngine {
    fn name(&self) -> &'static str {
        "raster"
    }

    fn handles(&self, strategy: &Strategy) -> bool {
        matches!(
            strategy,
            Strategy::ImageRecompress { .. } | Strategy::ImageReformat { .. }
        )
    }

    async fn check_available(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn execute(&self, strategy: &Strategy, job: &EngineJob) -> Result<(), EngineError> {
        let plan = match strategy {
            Strategy::ImageRecompress {
                format,
                quality,
                max_size_mb,
            } => RasterPlan {
                format: format.clone(),
                quality: *quality,
                max_size_mb: *max_size_mb,
            },
            Strategy::ImageReformat { format } => RasterPlan {
                format: format.clone(),
                quality: DEFAULT_IMAGE_QUALITY,
                max_size_mb: None,
            },
            _ => return Err(EngineError::Unhandled(strategy.name())),
        };

        let input = job.input.clone();
        let task = tokio::task::spawn_blocking(move || transcode(&input, &plan));

        // A blocking thread cannot be killed. On timeout the task is
        // abandoned; since it encodes into memory, nothing reaches disk.
        let encoded = match tokio::time::timeout(job.timeout, task).await {
            Ok(joined) => joined.map_err(|err| EngineError::Image(err.to_string()))??,
            Err(_) => {
                return Err(EngineError::Timeout {
                    tool: self.name().to_string(),
                    after: job.timeout,
                });
            }
        };
        tokio::fs::write(&job.output, encoded).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct RasterPlan {
    format: String,
    quality: u8,
    max_size_mb: Option<f64>,
}

fn transcode(input: &Path, plan: &RasterPlan) -> Result<Vec<u8>, EngineError> {
    let img = image::io::Reader::open(input)?
        .with_guessed_format()?
        .decode()
        .map_err(|err| EngineError::Image(err.to_string()))?;

    let img = match plan
        .max_size_mb
        .and_then(|mb| downscale_dimensions(img.width(), img.height(), mb))
    {
        Some((width, height)) => {
            debug!(
                "downscaling {}x{} to {}x{}",
                img.width(),
                img.height(),
                width,
                height
            );
            img.resize_exact(width, height, FilterType::Lanczos3)
        }
        None => img,
    };

    let mut encoded = Vec::new();
    encode(&img, &plan.format, plan.quality, &mut encoded)?;
    Ok(encoded)
}

/// Encode `img` as `format`.
///
/// JPEG and WebP honour `quality` directly (lossy); PNG trades it for
/// deflate effort; GIF is palette-quantized and ignores it.
pub fn encode<W: Write>(
    img: &DynamicImage,
    format: &str,
    quality: u8,
    writer: &mut W,
) -> Result<(), EngineError> {
    let image_err = |err: image::ImageError| EngineError::Image(err.to_string());
    match format {
        "jpg" | "jpeg" => {
            let rgb = img.to_rgb8();
            JpegEncoder::new_with_quality(writer, quality.clamp(1, 100))
                .encode(&rgb, rgb.width(), rgb.height(), ColorType::Rgb8)
                .map_err(image_err)
        }
        "png" => {
            let rgba = img.to_rgba8();
            let compression = if quality < 50 {
                CompressionType::Best
            } else {
                CompressionType::Default
            };
            PngEncoder::new_with_quality(writer, compression, PngFilter::Adaptive)
                .write_image(&rgba, rgba.width(), rgba.height(), ColorType::Rgba8)
                .map_err(image_err)
        }
        "webp" => {
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            let encoded = webp::Encoder::from_image(&rgba)
                .map_err(|err| EngineError::Image(format!("webp: {}", err)))?
                .encode(f32::from(quality.clamp(1, 100)));
            writer.write_all(&encoded)?;
            Ok(())
        }
        "gif" => {
            let rgba = img.to_rgba8();
            GifEncoder::new(writer)
                .encode(&rgba, rgba.width(), rgba.height(), ColorType::Rgba8)
                .map_err(image_err)
        }
        other => Err(EngineError::Image(format!("cannot encode `{}`", other))),
    }
}
