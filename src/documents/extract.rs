//! Text extraction
//!
//! Turns a file on disk into plain text plus a page count. Only UTF-8 text
//! formats are handled here; binary formats plug in through [`TextExtractor`].

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Files larger than this are refused
pub const MAX_FILE_BYTES: u64 = 50 * 1024 * 1024;

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "text", "md", "markdown", "rst", "org", "adoc", "csv", "tsv", "json", "yaml", "yml",
    "toml", "xml", "html", "htm", "log", "tex",
];

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Unsupported file type: {0}")]
    Unsupported(String),
    #[error("File too large: {size} bytes (limit {limit})")]
    FileTooLarge { size: u64, limit: u64 },
    #[error("No text extracted from {0}")]
    Empty(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedText {
    pub text: String,
    pub page_count: u32,
}

pub trait TextExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<ExtractedText, ExtractError>;
}

/// Reads UTF-8 text files; pages are separated by form feeds
#[derive(Debug, Clone, Default)]
pub struct PlainTextExtractor;

impl PlainTextExtractor {
    pub fn supports(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| TEXT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }
}

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedText, ExtractError> {
        let shown = path.display().to_string();
        if !path.exists() {
            return Err(ExtractError::NotFound(shown));
        }
        if !path.is_file() || !Self::supports(path) {
            return Err(ExtractError::Unsupported(shown));
        }

        let size = std::fs::metadata(path)?.len();
        if size > MAX_FILE_BYTES {
            return Err(ExtractError::FileTooLarge { size, limit: MAX_FILE_BYTES });
        }

        let bytes = std::fs::read(path)?;
        let text = String::from_utf8_lossy(&bytes)
            .trim_start_matches('\u{feff}')
            .to_string();
        if text.trim().is_empty() {
            return Err(ExtractError::Empty(shown));
        }

        let page_count = text
            .split('\u{000C}')
            .filter(|page| !page.trim().is_empty())
            .count()
            .max(1) as u32;

        debug!(path = %shown, bytes = size, pages = page_count, "Extracted text");
        Ok(ExtractedText { text, page_count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[test]
    fn test_extracts_text_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "notes.md", b"# Title\n\nSome body text.");

        let extracted = PlainTextExtractor.extract(&path).unwrap();
        assert_eq!(extracted.text, "# Title\n\nSome body text.");
        assert_eq!(extracted.page_count, 1);
    }

    #[test]
    fn test_form_feeds_count_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "paged.txt", b"Page one.\x0cPage two.\x0cPage three.\x0c");

        assert_eq!(PlainTextExtractor.extract(&path).unwrap().page_count, 3);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = PlainTextExtractor.extract(&dir.path().join("absent.txt"));
        assert!(matches!(result, Err(ExtractError::NotFound(_))));
    }

    #[test]
    fn test_unsupported_extension_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "image.png", b"\x89PNG");

        assert!(matches!(PlainTextExtractor.extract(&path), Err(ExtractError::Unsupported(_))));
        assert!(matches!(PlainTextExtractor.extract(dir.path()), Err(ExtractError::Unsupported(_))));
    }

    #[test]
    fn test_whitespace_only_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "blank.txt", b"  \n\t \n");
        assert!(matches!(PlainTextExtractor.extract(&path), Err(ExtractError::Empty(_))));
    }

    #[test]
    fn test_bom_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "bom.txt", "\u{feff}Hello there.".as_bytes());
        assert_eq!(PlainTextExtractor.extract(&path).unwrap().text, "Hello there.");
    }

    #[test]
    fn test_supports_is_case_insensitive() {
        assert!(PlainTextExtractor::supports(Path::new("README.MD")));
        assert!(!PlainTextExtractor::supports(Path::new("archive.zip")));
        assert!(!PlainTextExtractor::supports(Path::new("Makefile")));
    }
}
