//! Represents a stored file, either uploaded by a client or produced by a transform.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single artifact held by the artifact store.
///
/// The struct carries metadata only; the payload lives on disk under the
/// store root and is addressed exclusively through `id`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Opaque identifier, also the on-disk file name (e.g. `3f2c…e1.jpg`).
    pub id: String,

    /// Payload size in bytes.
    pub size_bytes: u64,

    /// MIME type derived from the artifact extension.
    pub media_type: String,

    /// Last modification time of the payload; retention is measured from here.
    pub created_at: DateTime<Utc>,

    /// MD5 of the payload, only known for artifacts written through `put`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl Artifact {
    /// Lower-case extension of the artifact id, without the dot.
    pub fn extension(&self) -> &str {
        self.id.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("")
    }
}

/// How a derived artifact id is built from its source id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivedNaming {
    /// `compressed-<uuid>.<ext>`
    Compressed,
    /// `<uuid>.<ext>`
    Converted,
}

/// Outcome of a single retention sweep pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Ids (file names) removed during the pass.
    pub deleted: Vec<String>,
    /// Entries younger than the retention window.
    pub retained: usize,
    /// Entries that were due but could not be inspected or removed.
    pub failed: usize,
}
