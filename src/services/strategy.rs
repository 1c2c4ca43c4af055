//! Transform strategy selection.
//!
//! Maps (source category, operation, requested options) to a concrete
//! [`Strategy`], rejecting every combination outside the legality matrix
//! before anything is spawned. Also home of the quality tier tables and the
//! max-size arithmetic used by the engines.

use crate::models::options::{Operation, ProcessingOptions, QualityParam};
use crate::services::classifier::{Category, IMAGE_EXTENSIONS, VIDEO_EXTENSIONS};
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_IMAGE_QUALITY: u8 = 80;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectError {
    #[error("{0}")]
    InvalidRequest(String),
}

fn invalid(msg: impl Into<String>) -> SelectError {
    SelectError::InvalidRequest(msg.into())
}

/// Named quality bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Low,
    Medium,
    High,
    /// Ghostscript's prepress preset; accepted for PDFs, resolved like `Medium`.
    Prepress,
}

impl QualityTier {
    /// Parse a tier name, including the Ghostscript preset aliases.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "low" | "screen" => Some(QualityTier::Low),
            "medium" | "ebook" => Some(QualityTier::Medium),
            "high" | "printer" => Some(QualityTier::High),
            "prepress" => Some(QualityTier::Prepress),
            _ => None,
        }
    }

    /// Bucket a 1–100 quality level.
    pub fn from_level(level: u8) -> Self {
        match level {
            0..=33 => QualityTier::Low,
            34..=66 => QualityTier::Medium,
            _ => QualityTier::High,
        }
    }
}

/// Ghostscript parameters for a PDF tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdfSettings {
    /// Value of `-dPDFSETTINGS` without the leading slash.
    pub preset: &'static str,
    /// Colour image resolution in dpi.
    pub resolution_dpi: u32,
}

pub fn pdf_settings(tier: QualityTier) -> PdfSettings {
    match tier {
        QualityTier::Low => PdfSettings {
            preset: "screen",
            resolution_dpi: 72,
        },
        QualityTier::Medium | QualityTier::Prepress => PdfSettings {
            preset: "ebook",
            resolution_dpi: 150,
        },
        QualityTier::High => PdfSettings {
            preset: "printer",
            resolution_dpi: 300,
        },
    }
}

/// x264 constant rate factor and speed preset for a video tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoSettings {
    pub crf: u8,
    pub preset: &'static str,
}

pub fn video_settings(tier: QualityTier) -> VideoSettings {
    match tier {
        QualityTier::Low => VideoSettings {
            crf: 28,
            preset: "fast",
        },
        QualityTier::Medium | QualityTier::Prepress => VideoSettings {
            crf: 23,
            preset: "medium",
        },
        QualityTier::High => VideoSettings {
            crf: 18,
            preset: "slow",
        },
    }
}

/// Encoder quality used for a named tier on raster images.
fn image_quality_for_tier(tier: QualityTier) -> u8 {
    match tier {
        QualityTier::Low => 40,
        QualityTier::Medium | QualityTier::Prepress => 70,
        QualityTier::High => 90,
    }
}

/// The concrete engine plan for a transform.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    ImageRecompress {
        format: String,
        quality: u8,
        max_size_mb: Option<f64>,
    },
    ImageReformat {
        format: String,
    },
    ImageToPdf,
    PdfRecompress {
        tier: QualityTier,
    },
    PdfToImage {
        format: String,
    },
    VideoRecompress {
        format: String,
        tier: QualityTier,
        max_size_mb: Option<f64>,
    },
    VideoReformat {
        format: String,
    },
    OfficeToPdf,
}

impl Strategy {
    /// Kebab-case name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::ImageRecompress { .. } => "image-recompress",
            Strategy::ImageReformat { .. } => "image-reformat",
            Strategy::ImageToPdf => "image-to-pdf",
            Strategy::PdfRecompress { .. } => "pdf-recompress",
            Strategy::PdfToImage { .. } => "pdf-to-image",
            Strategy::VideoRecompress { .. } => "video-recompress",
            Strategy::VideoReformat { .. } => "video-reformat",
            Strategy::OfficeToPdf => "office-to-pdf",
        }
    }

    /// Human label used in client-facing failure messages.
    pub fn label(&self) -> &'static str {
        match self {
            Strategy::ImageRecompress { .. } => "Image compression",
            Strategy::ImageReformat { .. } => "Image conversion",
            Strategy::ImageToPdf => "Image to PDF conversion",
            Strategy::PdfRecompress { .. } => "PDF compression",
            Strategy::PdfToImage { .. } => "PDF to image conversion",
            Strategy::VideoRecompress { .. } => "Video compression",
            Strategy::VideoReformat { .. } => "Video conversion",
            Strategy::OfficeToPdf => "Office to PDF conversion",
        }
    }

    /// Extension of the artifact this strategy produces.
    pub fn output_extension(&self) -> &str {
        match self {
            Strategy::ImageRecompress { format, .. }
            | Strategy::ImageReformat { format }
            | Strategy::PdfToImage { format }
            | Strategy::VideoRecompress { format, .. }
            | Strategy::VideoReformat { format } => format,
            Strategy::ImageToPdf | Strategy::PdfRecompress { .. } | Strategy::OfficeToPdf => "pdf",
        }
    }
}

/// Resolve a strategy.
///
/// `source_ext` is the source artifact's extension; it is what "keep
/// original" resolves to.
pub fn select(
    category: Category,
    operation: Operation,
    source_ext: &str,
    options: &ProcessingOptions,
) -> Result<Strategy, SelectError> {
    let target = options.target_format();
    let max_size_mb = validate_max_size(options.max_size)?;

    match (category, operation) {
        (Category::Image, Operation::Compress) => {
            let format = target.unwrap_or_else(|| source_ext.to_ascii_lowercase());
            if !is_image_format(&format) {
                return Err(invalid("Unsupported image format"));
            }
            Ok(Strategy::ImageRecompress {
                format,
                quality: image_quality(options.quality.as_ref())?,
                max_size_mb,
            })
        }
        (Category::Image, Operation::Convert) => match target.as_deref() {
            None => Err(invalid("Format is required for conversion")),
            Some("pdf") => Ok(Strategy::ImageToPdf),
            Some(format) if is_image_format(format) => Ok(Strategy::ImageReformat {
                format: format.to_string(),
            }),
            Some(_) => Err(invalid("Unsupported image format")),
        },
        (Category::Pdf, Operation::Compress) => match target.as_deref() {
            None | Some("pdf") => Ok(Strategy::PdfRecompress {
                tier: tier(options.quality.as_ref())?,
            }),
            Some(_) => Err(invalid("PDFs can only be compressed to PDF")),
        },
        (Category::Pdf, Operation::Convert) => match target.as_deref() {
            None => Err(invalid("Format is required for conversion")),
            Some(format) if is_image_format(format) => Ok(Strategy::PdfToImage {
                format: format.to_string(),
            }),
            Some(_) => Err(invalid(
                "PDFs can only be converted to image formats (JPG, PNG, WebP, GIF)",
            )),
        },
        (Category::Video, Operation::Compress) => {
            let format = target.unwrap_or_else(|| source_ext.to_ascii_lowercase());
            if !is_video_format(&format) {
                return Err(invalid("Unsupported video format"));
            }
            Ok(Strategy::VideoRecompress {
                format,
                tier: tier(options.quality.as_ref())?,
                max_size_mb,
            })
        }
        (Category::Video, Operation::Convert) => match target.as_deref() {
            None => Err(invalid("Format is required for conversion")),
            Some(format) if is_video_format(format) => Ok(Strategy::VideoReformat {
                format: format.to_string(),
            }),
            Some(_) => Err(invalid("Unsupported video format")),
        },
        (Category::Office, Operation::Compress) => {
            Err(invalid("Office documents cannot be compressed"))
        }
        (Category::Office, Operation::Convert) => match target.as_deref() {
            None | Some("pdf") => Ok(Strategy::OfficeToPdf),
            Some(_) => Err(invalid("Office documents can only be converted to PDF")),
        },
    }
}

fn is_image_format(format: &str) -> bool {
    IMAGE_EXTENSIONS.contains(&format)
}

fn is_video_format(format: &str) -> bool {
    VIDEO_EXTENSIONS.contains(&format)
}

fn validate_max_size(max_size: Option<f64>) -> Result<Option<f64>, SelectError> {
    match max_size {
        None => Ok(None),
        Some(mb) if mb.is_finite() && mb > 0.0 => Ok(Some(mb)),
        Some(_) => Err(invalid("maxSize must be a positive number of megabytes")),
    }
}

fn quality_level(level: i64) -> Result<u8, SelectError> {
    u8::try_from(level)
        .ok()
        .filter(|q| (1..=100).contains(q))
        .ok_or_else(|| invalid("quality must be between 1 and 100"))
}

fn image_quality(quality: Option<&QualityParam>) -> Result<u8, SelectError> {
    match quality {
        None => Ok(DEFAULT_IMAGE_QUALITY),
        Some(QualityParam::Level(level)) => quality_level(*level),
        Some(QualityParam::Named(name)) => match name.trim().parse::<i64>() {
            Ok(level) => quality_level(level),
            Err(_) => QualityTier::parse(name)
                .map(image_quality_for_tier)
                .ok_or_else(|| invalid(format!("unknown quality `{}`", name))),
        },
    }
}

fn tier(quality: Option<&QualityParam>) -> Result<QualityTier, SelectError> {
    match quality {
        None => Ok(QualityTier::Medium),
        Some(QualityParam::Level(level)) => quality_level(*level).map(QualityTier::from_level),
        Some(QualityParam::Named(name)) => match name.trim().parse::<i64>() {
            Ok(level) => quality_level(level).map(QualityTier::from_level),
            Err(_) => QualityTier::parse(name)
                .ok_or_else(|| invalid(format!("unknown quality `{}`", name))),
        },
    }
}

/// Downscaled dimensions for an image that exceeds its max-size pixel budget.
///
/// The budget is `max_size_mb * 1_000_000` pixels; both sides shrink by
/// `sqrt(budget / area)`, rounded down so the result never exceeds the
/// budget. Returns `None` when the image already fits.
pub fn downscale_dimensions(width: u32, height: u32, max_size_mb: f64) -> Option<(u32, u32)> {
    let ceiling = max_size_mb * 1_000_000.0;
    let area = width as f64 * height as f64;
    if area <= ceiling {
        return None;
    }
    let scale = (ceiling / area).sqrt();
    let mut new_width = ((width as f64 * scale).floor() as u32).max(1);
    let mut new_height = ((height as f64 * scale).floor() as u32).max(1);
    // Float error can land a side exactly on the next integer.
    while new_width as f64 * new_height as f64 > ceiling && new_width.max(new_height) > 1 {
        if new_width >= new_height {
            new_width -= 1;
        } else {
            new_height -= 1;
        }
    }
    Some((new_width, new_height))
}

/// Video bitrate in kbps that fits `max_size_mb` over `duration_secs`.
pub fn target_bitrate_kbps(max_size_mb: f64, duration_secs: f64) -> Option<u64> {
    if !(duration_secs.is_finite() && duration_secs > 0.0) {
        return None;
    }
    let kbps = ((max_size_mb * 1024.0 * 8.0) / duration_secs).floor();
    (kbps >= 1.0).then_some(kbps as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::Strategy;
    use proptest::prelude::*;

    fn opts(format: Option<&str>) -> ProcessingOptions {
        ProcessingOptions {
            format: format.map(String::from),
            ..Default::default()
        }
    }

    const TARGETS: [&str; 13] = [
        "original", "jpg", "jpeg", "png", "webp", "gif", "pdf", "mp4", "webm", "mov", "avi",
        "docx", "bmp",
    ];

    /// The legality matrix, written out independently of `select`.
    fn expected(category: Category, op: Operation, target: &str) -> Option<&'static str> {
        let image = ["jpg", "jpeg", "png", "webp", "gif"].contains(&target);
        let video = ["mp4", "webm", "mov", "avi"].contains(&target);
        let keep = target == "original";
        match (category, op) {
            (Category::Image, Operation::Compress) if keep || image => Some("image-recompress"),
            (Category::Image, Operation::Convert) if image => Some("image-reformat"),
            (Category::Image, Operation::Convert) if target == "pdf" => Some("image-to-pdf"),
            (Category::Pdf, Operation::Compress) if keep || target == "pdf" => {
                Some("pdf-recompress")
            }
            (Category::Pdf, Operation::Convert) if image => Some("pdf-to-image"),
            (Category::Video, Operation::Compress) if keep || video => Some("video-recompress"),
            (Category::Video, Operation::Convert) if video => Some("video-reformat"),
            (Category::Office, Operation::Convert) if keep || target == "pdf" => {
                Some("office-to-pdf")
            }
            _ => None,
        }
    }

    #[test]
    fn legality_matrix_is_exhaustive() {
        let sources = [
            (Category::Image, "png"),
            (Category::Video, "mp4"),
            (Category::Pdf, "pdf"),
            (Category::Office, "docx"),
        ];
        for (category, ext) in sources {
            for op in [Operation::Compress, Operation::Convert] {
                for target in TARGETS {
                    let result = select(category, op, ext, &opts(Some(target)));
                    match expected(category, op, target) {
                        Some(name) => assert_eq!(
                            result.as_ref().map(Strategy::name),
                            Ok(name),
                            "{category} {op} -> {target}"
                        ),
                        None => assert!(
                            matches!(result, Err(SelectError::InvalidRequest(_))),
                            "{category} {op} -> {target} should be rejected, got {result:?}"
                        ),
                    }
                }
            }
        }
    }

    #[test]
    fn office_rejection_message() {
        let err = select(Category::Office, Operation::Convert, "docx", &opts(Some("png")))
            .unwrap_err();
        assert_eq!(err.to_string(), "Office documents can only be converted to PDF");
    }

    #[test]
    fn pdf_rejection_message() {
        let err =
            select(Category::Pdf, Operation::Convert, "pdf", &opts(Some("docx"))).unwrap_err();
        assert_eq!(
            err.to_string(),
            "PDFs can only be converted to image formats (JPG, PNG, WebP, GIF)"
        );
    }

    #[test]
    fn keep_original_resolves_to_source_format() {
        let strategy = select(Category::Image, Operation::Compress, "webp", &opts(None)).unwrap();
        assert_eq!(
            strategy,
            Strategy::ImageRecompress {
                format: "webp".into(),
                quality: DEFAULT_IMAGE_QUALITY,
                max_size_mb: None,
            }
        );
        let strategy = select(Category::Video, Operation::Compress, "mov", &opts(None)).unwrap();
        assert_eq!(strategy.output_extension(), "mov");
    }

    #[test]
    fn image_quality_passes_through() {
        let options = ProcessingOptions {
            quality: Some(QualityParam::Level(50)),
            format: Some("original".into()),
            max_size: Some(5.0),
        };
        let strategy = select(Category::Image, Operation::Compress, "jpg", &options).unwrap();
        assert_eq!(
            strategy,
            Strategy::ImageRecompress {
                format: "jpg".into(),
                quality: 50,
                max_size_mb: Some(5.0),
            }
        );
    }

    #[test]
    fn out_of_range_options_are_rejected() {
        for quality in [0, 101, -5] {
            let options = ProcessingOptions {
                quality: Some(QualityParam::Level(quality)),
                ..Default::default()
            };
            assert!(select(Category::Image, Operation::Compress, "jpg", &options).is_err());
        }
        let options = ProcessingOptions {
            max_size: Some(0.0),
            ..Default::default()
        };
        assert!(select(Category::Video, Operation::Compress, "mp4", &options).is_err());
        let options = ProcessingOptions {
            quality: Some(QualityParam::Named("ultra".into())),
            ..Default::default()
        };
        assert!(select(Category::Pdf, Operation::Compress, "pdf", &options).is_err());
    }

    #[test]
    fn pdf_tiers_map_exactly() {
        assert_eq!(
            pdf_settings(QualityTier::Low),
            PdfSettings {
                preset: "screen",
                resolution_dpi: 72
            }
        );
        assert_eq!(
            pdf_settings(QualityTier::Medium),
            PdfSettings {
                preset: "ebook",
                resolution_dpi: 150
            }
        );
        assert_eq!(
            pdf_settings(QualityTier::High),
            PdfSettings {
                preset: "printer",
                resolution_dpi: 300
            }
        );
        assert_eq!(QualityTier::parse("prepress"), Some(QualityTier::Prepress));
    }

    #[test]
    fn video_tiers_map_exactly() {
        assert_eq!(
            video_settings(QualityTier::Low),
            VideoSettings {
                crf: 28,
                preset: "fast"
            }
        );
        assert_eq!(
            video_settings(QualityTier::Medium),
            VideoSettings {
                crf: 23,
                preset: "medium"
            }
        );
        assert_eq!(
            video_settings(QualityTier::High),
            VideoSettings {
                crf: 18,
                preset: "slow"
            }
        );
    }

    #[test]
    fn tier_names_and_levels_resolve() {
        let named = |name: &str| ProcessingOptions {
            quality: Some(QualityParam::Named(name.into())),
            ..Default::default()
        };
        let pick = |options: &ProcessingOptions| {
            match select(Category::Video, Operation::Compress, "mp4", options).unwrap() {
                Strategy::VideoRecompress { tier, .. } => tier,
                other => panic!("unexpected {other:?}"),
            }
        };
        assert_eq!(pick(&named("low")), QualityTier::Low);
        assert_eq!(pick(&named("HIGH")), QualityTier::High);
        assert_eq!(pick(&ProcessingOptions::default()), QualityTier::Medium);
        assert_eq!(
            pick(&ProcessingOptions {
                quality: Some(QualityParam::Level(80)),
                ..Default::default()
            }),
            QualityTier::High
        );
    }

    #[test]
    fn downscale_matches_documented_example() {
        let (w, h) = downscale_dimensions(4000, 3000, 5.0).unwrap();
        // Floored: 4000 * 0.6455 = 2581.99.
        assert_eq!((w, h), (2581, 1936));
        assert_eq!(downscale_dimensions(1000, 700, 0.5), Some((845, 591)));
        let scale = (5_000_000f64 / 12_000_000f64).sqrt();
        assert!((scale - 0.6455).abs() < 1e-4);
        assert_eq!(downscale_dimensions(2000, 1000, 5.0), None);
    }

    #[test]
    fn bitrate_matches_documented_example() {
        assert_eq!(target_bitrate_kbps(10.0, 60.0), Some(1365));
        assert_eq!(target_bitrate_kbps(10.0, 0.0), None);
        assert_eq!(target_bitrate_kbps(10.0, f64::NAN), None);
    }

    proptest! {
        #[test]
        fn downscale_preserves_aspect_and_budget(
            width in 1u32..20_000,
            height in 1u32..20_000,
            max_mb in 0.1f64..50.0,
        ) {
            if let Some((w, h)) = downscale_dimensions(width, height, max_mb) {
                prop_assert!(w <= width && h <= height);
                let before = width as f64 / height as f64;
                let after = w as f64 / h as f64;
                // Flooring moves each side by less than a pixel.
                let tolerance = 2.0 * before * (1.0 / w as f64 + 1.0 / h as f64);
                prop_assert!((before - after).abs() <= tolerance);
                prop_assert!((w as f64) * (h as f64) <= max_mb * 1_000_000.0);
            } else {
                prop_assert!((width as f64) * (height as f64) <= max_mb * 1_000_000.0);
            }
        }

        #[test]
        fn tier_mapping_is_deterministic(level in 1u8..=100) {
            let tier = QualityTier::from_level(level);
            prop_assert_eq!(pdf_settings(tier), pdf_settings(QualityTier::from_level(level)));
            prop_assert_eq!(video_settings(tier), video_settings(QualityTier::from_level(level)));
        }
    }
}
