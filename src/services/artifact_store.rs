//! src/services/artifact_store.rs
//!
//! ArtifactStore — flat, filesystem-backed storage for uploaded and derived
//! artifacts. There is no metadata database: an artifact's id is its file
//! name under `root`, and size / media type / age come from the file itself.
//! Every path is built as `root.join(id)` from an id that passed
//! [`parse_id`], so client-supplied names never reach the filesystem.

use crate::models::artifact::{Artifact, DerivedNaming, SweepReport};
use crate::services::classifier::media_type_for_extension;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use std::{
    fs::Metadata,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact `{0}` not found")]
    NotFound(String),
    #[error("invalid artifact id `{0}`")]
    InvalidId(String),
    #[error("artifact exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

const MAX_ID_LEN: usize = 160;
const DERIVED_PREFIXES: [&str; 2] = ["compressed-", "converted-"];
const TMP_PREFIX: &str = ".tmp-";

/// Components of a well-formed artifact id: `[prefix…]<uuid>.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedId<'a> {
    /// Everything before the extension, prefixes included.
    pub stem: &'a str,
    pub ext: &'a str,
}

/// Validate an artifact id.
///
/// Accepts only the shapes this store generates: optional derived prefixes,
/// a canonical hyphenated v4-style uuid, and a short lower-case alphanumeric
/// extension. Anything with separators, dots in the stem or control bytes is
/// rejected before it gets near a path.
pub fn parse_id(id: &str) -> StoreResult<ParsedId<'_>> {
    let invalid = || StoreError::InvalidId(id.to_string());
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(invalid());
    }
    let (stem, ext) = id.rsplit_once('.').ok_or_else(invalid)?;
    if ext.is_empty()
        || ext.len() > 5
        || !ext
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    {
        return Err(invalid());
    }

    let mut rest = stem;
    while let Some(stripped) = DERIVED_PREFIXES
        .iter()
        .find_map(|prefix| rest.strip_prefix(prefix))
    {
        rest = stripped;
    }
    let uuid = Uuid::try_parse(rest).map_err(|_| invalid())?;
    if uuid.hyphenated().to_string() != rest {
        return Err(invalid());
    }

    Ok(ParsedId { stem, ext })
}

/// Derived artifact id for a transform of `source_id` producing `ext`.
///
/// Compression yields `compressed-<stem>.<ext>`, conversion `<stem>.<ext>`;
/// a conversion that would reproduce the source id becomes
/// `converted-<stem>.<ext>`.
pub fn derived_id(naming: DerivedNaming, source_id: &str, ext: &str) -> StoreResult<String> {
    let parsed = parse_id(source_id)?;
    let candidate = match naming {
        DerivedNaming::Compressed => format!("compressed-{}.{}", parsed.stem, ext),
        DerivedNaming::Converted => format!("{}.{}", parsed.stem, ext),
    };
    let id = if candidate == source_id {
        format!("converted-{}.{}", parsed.stem, ext)
    } else {
        candidate
    };
    parse_id(&id)?;
    Ok(id)
}

/// ArtifactStore provides the pipeline's storage operations:
/// - `put_stream`: write an upload under a fresh id
/// - `get` / `open_reader`: look up or stream an unexpired artifact
/// - `delete`: explicit removal
/// - `adopt` / `discard`: accept or drop an engine's output
/// - `sweep`: retention pass over the whole directory
///
/// Cloning is cheap; all clones share the same root directory.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    /// Directory holding every artifact, originals and derived alike.
    root: PathBuf,

    /// Upload ceiling in bytes.
    max_bytes: u64,

    /// Retention window; older artifacts are treated as deleted.
    max_age: Duration,
}

impl ArtifactStore {
    /// Open (and create if needed) a store rooted at `root`.
    ///
    /// The root is canonicalized so containment checks on engine paths
    /// compare like with like.
    pub async fn open(
        root: impl Into<PathBuf>,
        max_bytes: u64,
        max_age: Duration,
    ) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        let root = fs::canonicalize(&root).await?;
        Ok(Self {
            root,
            max_bytes,
            max_age,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem location of a (possibly not yet existing) artifact.
    pub fn path_for(&self, id: &str) -> StoreResult<PathBuf> {
        parse_id(id)?;
        Ok(self.root.join(id))
    }

    /// Stream an upload to disk under a fresh `<uuid>.<ext>` id.
    ///
    /// - Writes chunks to a hidden temporary file, enforcing `max_bytes`.
    /// - Computes the MD5 etag while streaming.
    /// - fsyncs, then renames into place.
    ///
    /// The temporary file is removed on every error path.
    pub async fn put_stream<S>(&self, ext: &str, stream: S) -> StoreResult<Artifact>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let id = format!("{}.{}", Uuid::new_v4(), ext);
        let final_path = self.path_for(&id)?;
        let tmp_path = self.root.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StoreError::Io(err));
                }
            };
            size_bytes += chunk.len() as u64;
            if size_bytes > self.max_bytes {
                drop(file);
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::TooLarge {
                    limit: self.max_bytes,
                });
            }
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        debug!("stored {} ({} bytes)", id, size_bytes);
        Ok(Artifact {
            media_type: media_type_for_extension(ext).to_string(),
            id,
            size_bytes,
            created_at: Utc::now(),
            etag: Some(format!("{:x}", digest.compute())),
        })
    }

    /// Look up an artifact.
    ///
    /// Returns NotFound for missing files and for files past the retention
    /// window, even if the sweep has not removed them yet.
    pub async fn get(&self, id: &str) -> StoreResult<Artifact> {
        let path = self.path_for(id)?;
        let meta = fs::metadata(&path).await.map_err(|err| match err.kind() {
            ErrorKind::NotFound => StoreError::NotFound(id.to_string()),
            _ => StoreError::Io(err),
        })?;
        if !meta.is_file() || self.is_expired(&meta, SystemTime::now()) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(artifact_from_metadata(id, &meta))
    }

    /// Fetch an artifact for reading; the File handle is ready for streaming.
    pub async fn open_reader(&self, id: &str) -> StoreResult<(Artifact, File)> {
        let artifact = self.get(id).await?;
        let file = File::open(self.path_for(id)?)
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => StoreError::NotFound(id.to_string()),
                _ => StoreError::Io(err),
            })?;
        Ok((artifact, file))
    }

    /// Delete an artifact. Returns NotFound if it does not exist (or expired).
    pub async fn delete(&self, id: &str) -> StoreResult<Artifact> {
        let artifact = self.get(id).await?;
        match fs::remove_file(self.path_for(id)?).await {
            Ok(()) => {
                debug!("removed artifact {}", id);
                Ok(artifact)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(id.to_string()))
            }
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    /// `candidate` if nothing is stored under it, otherwise a fresh
    /// `<prefix><uuid>.<ext>` id. An existing artifact is never overwritten.
    pub async fn unused_id(&self, candidate: String, naming: DerivedNaming) -> StoreResult<String> {
        if !fs::try_exists(self.path_for(&candidate)?).await? {
            return Ok(candidate);
        }
        let prefix = match naming {
            DerivedNaming::Compressed => "compressed-",
            DerivedNaming::Converted => "converted-",
        };
        let id = format!("{}{}.{}", prefix, Uuid::new_v4(), parse_id(&candidate)?.ext);
        debug!("{} already exists, using {}", candidate, id);
        Ok(id)
    }

    /// Register a file an engine wrote at `path_for(id)` as an artifact.
    pub async fn adopt(&self, id: &str) -> StoreResult<Artifact> {
        let artifact = self.get(id).await?;
        info!("registered derived artifact {} ({} bytes)", id, artifact.size_bytes);
        Ok(artifact)
    }

    /// Best-effort removal of a partial or unwanted output.
    pub async fn discard(&self, id: &str) {
        let Ok(path) = self.path_for(id) else {
            return;
        };
        match fs::remove_file(&path).await {
            Ok(()) => debug!("discarded {}", id),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("failed to discard {}: {}", id, err),
        }
    }

    /// Delete every entry whose modification time is older than `max_age`
    /// relative to `now`.
    ///
    /// Individual failures are logged and counted; they never abort the
    /// pass. Directories are left alone.
    pub async fn sweep(&self, now: SystemTime, max_age: Duration) -> StoreResult<SweepReport> {
        let mut report = SweepReport::default();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    warn!("sweep: cannot stat {}: {}", name, err);
                    report.failed += 1;
                    continue;
                }
            };
            if !meta.is_file() {
                continue;
            }
            if !is_older_than(&meta, now, max_age) {
                report.retained += 1;
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    info!("Deleted old temp file: {}", name);
                    report.deleted.push(name);
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!("sweep: error deleting {}: {}", name, err);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    fn is_expired(&self, meta: &Metadata, now: SystemTime) -> bool {
        is_older_than(meta, now, self.max_age)
    }
}

fn is_older_than(meta: &Metadata, now: SystemTime, max_age: Duration) -> bool {
    meta.modified()
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .is_some_and(|age| age > max_age)
}

fn artifact_from_metadata(id: &str, meta: &Metadata) -> Artifact {
    let ext = parse_id(id).map(|parsed| parsed.ext).unwrap_or("");
    let created_at = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Artifact {
        id: id.to_string(),
        size_bytes: meta.len(),
        media_type: media_type_for_extension(ext).to_string(),
        created_at,
        etag: None,
    }
}
