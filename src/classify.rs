//! Pure mapping from an item's name and declared content type to an [`ItemKind`].
//!
//! A recognized name suffix decides. Remote providers frequently report the wrong content type
//! (`application/octet-stream` for PDFs, `application/zip` for Office files), so the declared
//! type is consulted only when the suffix is unknown, and generic types are ignored entirely.

use crate::model::{ItemKind, WorkItem};

const GENERIC_CONTENT_TYPES: &[&str] = &[
    "application/octet-stream",
    "binary/octet-stream",
    "application/binary",
    "application/unknown",
    "application/x-download",
    "application/force-download",
    "application/download",
];

const VISUAL_SUFFIXES: &[&str] = &["pdf", "docx", "doc", "odt", "pptx", "ppt", "odp", "rtf"];
const CONTAINER_SUFFIXES: &[&str] = &["zip"];
const TEXT_SUFFIXES: &[&str] = &[
    "txt", "text", "md", "markdown", "csv", "tsv", "json", "xml", "html", "htm", "eml", "log",
];

/// Classify a discovered item.
pub fn classify_item(item: &WorkItem) -> ItemKind {
    classify(&item.name, item.content_type.as_deref())
}

/// Classify by name and optional content type. Total: every input maps to exactly one kind.
pub fn classify(name: &str, content_type: Option<&str>) -> ItemKind {
    kind_from_suffix(name)
        .or_else(|| {
            let declared = content_type
                .map(normalize_content_type)
                .filter(|value| !GENERIC_CONTENT_TYPES.contains(&value.as_str()))?;
            kind_from_content_type(&declared)
        })
        .unwrap_or(ItemKind::Unsupported)
}

/// Lower-cased file suffix without the dot.
pub fn suffix(name: &str) -> Option<String> {
    let file_name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn normalize_content_type(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn kind_from_suffix(name: &str) -> Option<ItemKind> {
    let ext = suffix(name)?;
    let ext = ext.as_str();
    if VISUAL_SUFFIXES.contains(&ext) {
        Some(ItemKind::VisualDocument)
    } else if CONTAINER_SUFFIXES.contains(&ext) {
        Some(ItemKind::Container)
    } else if TEXT_SUFFIXES.contains(&ext) {
        Some(ItemKind::StructuredText)
    } else {
        None
    }
}

fn kind_from_content_type(content_type: &str) -> Option<ItemKind> {
    match content_type {
        "application/pdf"
        | "application/x-pdf"
        | "application/msword"
        | "application/rtf"
        | "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        | "application/vnd.openxmlformats-officedocument.presentationml.presentation"
        | "application/vnd.ms-powerpoint"
        | "application/vnd.oasis.opendocument.text"
        | "application/vnd.oasis.opendocument.presentation" => Some(ItemKind::VisualDocument),
        "application/zip"
        | "application/x-zip"
        | "application/x-zip-compressed"
        | "multipart/x-zip" => Some(ItemKind::Container),
        "application/json" | "application/xml" | "message/rfc822" | "application/xhtml+xml" => {
            Some(ItemKind::StructuredText)
        }
        // `text/rtf` is really a visual document; let the suffix decide.
        "text/rtf" => None,
        other if other.starts_with("text/") => Some(ItemKind::StructuredText),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_content_type_defers_to_suffix() {
        assert_eq!(
            classify("Report.PDF", Some("application/octet-stream")),
            ItemKind::VisualDocument
        );
        assert_eq!(classify("bundle.zip", Some("")), ItemKind::Container);
        assert_eq!(classify("notes.md", None), ItemKind::StructuredText);
    }

    #[test]
    fn known_suffix_wins_over_a_misreported_content_type() {
        let cases = [
            ("report.pdf", "text/plain", ItemKind::VisualDocument),
            ("contract.docx", "application/zip", ItemKind::VisualDocument),
            ("bundle.zip", "application/pdf", ItemKind::Container),
            ("notes.txt", "application/pdf", ItemKind::StructuredText),
            ("slides.PPTX", "application/x-zip-compressed", ItemKind::VisualDocument),
        ];
        for (name, content_type, expected) in cases {
            assert_eq!(classify(name, Some(content_type)), expected, "{name}");
        }
    }

    #[test]
    fn content_type_decides_when_the_suffix_is_unknown() {
        assert_eq!(
            classify("download", Some("application/pdf; charset=binary")),
            ItemKind::VisualDocument
        );
        assert_eq!(classify("data.bin", Some("text/csv")), ItemKind::StructuredText);
        assert_eq!(
            classify("archive", Some("application/x-zip-compressed")),
            ItemKind::Container
        );
        assert_eq!(classify("letter.rtf.bak", Some("text/rtf")), ItemKind::Unsupported);
    }

    #[test]
    fn unrecognized_specific_type_falls_back_to_suffix() {
        assert_eq!(
            classify("scan.pdf", Some("application/vnd.vendor.custom")),
            ItemKind::VisualDocument
        );
        assert_eq!(
            classify("Quarterly plan", Some("application/vnd.google-apps.document")),
            ItemKind::Unsupported
        );
    }

    #[test]
    fn unknown_inputs_are_unsupported_not_errors() {
        let samples = [
            ("", None),
            (".", Some("")),
            (".hidden", None),
            ("photo.heic", Some("image/heic")),
            ("noext", Some("application/octet-stream")),
            ("weird.", Some(";;;")),
            ("a/b\\c.tar.gz", None),
        ];
        for (name, content_type) in samples {
            assert_eq!(classify(name, content_type), ItemKind::Unsupported, "{name}");
        }
    }

    #[test]
    fn suffix_ignores_directories_and_case() {
        assert_eq!(suffix("dir.v2/File.DocX").as_deref(), Some("docx"));
        assert_eq!(suffix("dir.v2/README"), None);
        assert_eq!(suffix(".env"), None);
    }
}
