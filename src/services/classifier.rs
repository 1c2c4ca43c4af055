//! Format classification: file extension or MIME type to a semantic category.
//!
//! Everything here is a pure lookup over static tables.

use serde::Serialize;

/// Semantic category of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Image,
    Video,
    Pdf,
    Office,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Image => write!(f, "image"),
            Category::Video => write!(f, "video"),
            Category::Pdf => write!(f, "pdf"),
            Category::Office => write!(f, "office"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported file type `{0}`")]
pub struct Unsupported(pub String);

pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "webp", "gif"];
pub const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "webm", "mov", "avi"];
pub const OFFICE_EXTENSIONS: [&str; 6] = ["doc", "docx", "xls", "xlsx", "ppt", "pptx"];

/// (MIME type, canonical extension, category) for every transformable type.
const MIME_TABLE: [(&str, &str, Category); 16] = [
    ("image/jpeg", "jpg", Category::Image),
    ("image/png", "png", Category::Image),
    ("image/webp", "webp", Category::Image),
    ("image/gif", "gif", Category::Image),
    ("video/mp4", "mp4", Category::Video),
    ("video/webm", "webm", Category::Video),
    ("video/quicktime", "mov", Category::Video),
    ("video/x-msvideo", "avi", Category::Video),
    ("application/pdf", "pdf", Category::Pdf),
    ("application/msword", "doc", Category::Office),
    (
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "docx",
        Category::Office,
    ),
    ("application/vnd.ms-excel", "xls", Category::Office),
    (
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "xlsx",
        Category::Office,
    ),
    ("application/vnd.ms-powerpoint", "ppt", Category::Office),
    (
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "pptx",
        Category::Office,
    ),
    ("image/jpg", "jpg", Category::Image),
];

/// Accepted at upload time but not transformable.
const UPLOAD_ONLY: [(&str, &str); 1] = [("image/svg+xml", "svg")];

/// Classify an extension (`"png"`, `".png"`), a file name (`"a.PNG"`) or a MIME type.
pub fn classify(name_or_mime: &str) -> Result<Category, Unsupported> {
    let input = name_or_mime.trim().to_ascii_lowercase();
    let unsupported = || Unsupported(name_or_mime.to_string());

    if input.contains('/') {
        let mime = input.split(';').next().unwrap_or("").trim();
        return MIME_TABLE
            .iter()
            .find(|(m, _, _)| *m == mime)
            .map(|(_, _, category)| *category)
            .ok_or_else(unsupported);
    }

    let ext = input.rsplit_once('.').map(|(_, ext)| ext).unwrap_or(&input);
    category_of_extension(ext).ok_or_else(unsupported)
}

fn category_of_extension(ext: &str) -> Option<Category> {
    if IMAGE_EXTENSIONS.contains(&ext) {
        Some(Category::Image)
    } else if VIDEO_EXTENSIONS.contains(&ext) {
        Some(Category::Video)
    } else if ext == "pdf" {
        Some(Category::Pdf)
    } else if OFFICE_EXTENSIONS.contains(&ext) {
        Some(Category::Office)
    } else {
        None
    }
}

/// Whether a MIME type is on the upload allow-list.
pub fn is_upload_allowed(mime: &str) -> bool {
    canonical_extension(mime).is_some()
}

/// Canonical extension for an allowed MIME type.
pub fn canonical_extension(mime: &str) -> Option<&'static str> {
    let mime = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    MIME_TABLE
        .iter()
        .map(|(m, ext, _)| (*m, *ext))
        .chain(UPLOAD_ONLY)
        .find(|(m, _)| *m == mime)
        .map(|(_, ext)| ext)
}

/// MIME type served for an extension; unknown extensions are octet streams.
pub fn media_type_for_extension(ext: &str) -> &'static str {
    let ext = ext.to_ascii_lowercase();
    let ext = if ext == "jpeg" { "jpg" } else { ext.as_str() };
    MIME_TABLE
        .iter()
        .map(|(m, e, _)| (*m, *e))
        .chain(UPLOAD_ONLY)
        .find(|(_, e)| *e == ext)
        .map(|(m, _)| m)
        .unwrap_or("application/octet-stream")
}

/// Extension a stored upload gets.
///
/// The declared file name's extension is kept only when it is a known
/// extension of the same category as the MIME type, so a `photo.JPEG` upload
/// stays `.jpeg` while `notes.exe` sent as `image/png` becomes `.png`.
pub fn extension_for_upload(declared_name: &str, mime: &str) -> Option<&'static str> {
    let canonical = canonical_extension(mime)?;
    let declared = declared_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());

    let Some(declared) = declared else {
        return Some(canonical);
    };
    let known = IMAGE_EXTENSIONS
        .iter()
        .chain(VIDEO_EXTENSIONS.iter())
        .chain(OFFICE_EXTENSIONS.iter())
        .chain(["pdf", "svg"].iter())
        .copied()
        .find(|ext| *ext == declared);

    match (known, classify(mime).ok()) {
        (Some(ext), Some(category)) if category_of_extension(ext) == Some(category) => Some(ext),
        _ => Some(canonical),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn classifies_every_accepted_extension() {
        for ext in IMAGE_EXTENSIONS {
            assert_eq!(classify(ext), Ok(Category::Image));
        }
        for ext in VIDEO_EXTENSIONS {
            assert_eq!(classify(ext), Ok(Category::Video));
        }
        for ext in OFFICE_EXTENSIONS {
            assert_eq!(classify(ext), Ok(Category::Office));
        }
        assert_eq!(classify("pdf"), Ok(Category::Pdf));
    }

    #[test]
    fn classifies_names_and_mime_types() {
        assert_eq!(classify("Holiday.JPEG"), Ok(Category::Image));
        assert_eq!(classify(".mov"), Ok(Category::Video));
        assert_eq!(classify("report.final.docx"), Ok(Category::Office));
        assert_eq!(classify("video/quicktime"), Ok(Category::Video));
        assert_eq!(classify("application/pdf; charset=binary"), Ok(Category::Pdf));
        assert_eq!(
            classify("application/vnd.openxmlformats-officedocument.presentationml.presentation"),
            Ok(Category::Office)
        );
    }

    #[test]
    fn rejects_unknown_inputs() {
        assert!(classify("image/svg+xml").is_err());
        assert!(classify("drawing.svg").is_err());
        assert!(classify("archive.zip").is_err());
        assert!(classify("").is_err());
    }

    #[test]
    fn upload_allow_list_includes_svg() {
        assert!(is_upload_allowed("image/svg+xml"));
        assert!(is_upload_allowed("video/x-msvideo"));
        assert!(!is_upload_allowed("application/zip"));
        assert!(!is_upload_allowed("text/html"));
    }

    #[test]
    fn upload_extension_prefers_consistent_declared_name() {
        assert_eq!(extension_for_upload("photo.JPEG", "image/jpeg"), Some("jpeg"));
        assert_eq!(extension_for_upload("photo.png", "image/jpeg"), Some("png"));
        assert_eq!(extension_for_upload("clip.exe", "video/mp4"), Some("mp4"));
        assert_eq!(extension_for_upload("noext", "application/pdf"), Some("pdf"));
        assert_eq!(extension_for_upload("a.docx", "application/pdf"), Some("pdf"));
        assert_eq!(extension_for_upload("a.bin", "application/zip"), None);
    }

    #[test]
    fn media_types_round_trip_through_extensions() {
        assert_eq!(media_type_for_extension("jpeg"), "image/jpeg");
        assert_eq!(media_type_for_extension("MOV"), "video/quicktime");
        assert_eq!(media_type_for_extension("svg"), "image/svg+xml");
        assert_eq!(media_type_for_extension("xyz"), "application/octet-stream");
    }

    proptest! {
        #[test]
        fn classification_is_deterministic(input in "[a-zA-Z0-9./+-]{0,40}") {
            prop_assert_eq!(classify(&input), classify(&input));
        }

        #[test]
        fn case_does_not_change_category(ext in prop::sample::select(vec![
            "jpg", "jpeg", "png", "webp", "gif", "mp4", "webm", "mov", "avi",
            "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx",
        ])) {
            prop_assert_eq!(classify(ext), classify(&ext.to_ascii_uppercase()));
        }
    }
}
