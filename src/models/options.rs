//! Request-scoped processing options and the operations they apply to.

use serde::{Deserialize, Serialize};

/// Sentinel sent by the browser client for "keep the source format".
pub const KEEP_ORIGINAL: &str = "original";

/// Kind of transform a client asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Compress,
    Convert,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Compress => write!(f, "compress"),
            Operation::Convert => write!(f, "convert"),
        }
    }
}

/// Quality as sent by clients: either a 1–100 number or a tier name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QualityParam {
    Level(i64),
    Named(String),
}

/// Options accepted by the compression and conversion endpoints.
///
/// Field names follow the JSON the browser client posts
/// (`{"quality":80,"format":"original","maxSize":10}`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityParam>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    /// Upper bound hint in megabytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<f64>,
}

impl ProcessingOptions {
    /// Requested target format, lower-cased, or `None` for "keep original".
    pub fn target_format(&self) -> Option<String> {
        self.format
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty() && !f.eq_ignore_ascii_case(KEEP_ORIGINAL))
            .map(|f| f.trim_start_matches('.').to_ascii_lowercase())
    }
}

/// Body of `POST /conversion/{id}`; the client may nest options.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversionRequest {
    #[serde(flatten)]
    pub options: ProcessingOptions,

    #[serde(default, rename = "options")]
    pub nested: Option<ProcessingOptions>,
}

impl ConversionRequest {
    /// Nested `options.format` wins over the top-level field.
    pub fn into_options(self) -> ProcessingOptions {
        let mut options = self.options;
        if let Some(format) = self.nested.and_then(|n| n.format) {
            options.format = Some(format);
        }
        options
    }
}
