// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Plain-text extraction from uploaded documents.
//!
//! Checks run in a fixed order: extension, then size, then parsing. An
//! oversized file with an unsupported extension is therefore reported as
//! unsupported.

use std::path::Path;

use thiserror::Error;
use tracing::debug;

mod docx;
mod pdf;

pub const SUPPORTED_EXTENSIONS: [&str; 4] = [".pdf", ".docx", ".txt", ".md"];

const MB: usize = 1024 * 1024;

fn megabytes(bytes: &usize) -> f64 {
    *bytes as f64 / MB as f64
}

fn whole_megabytes(bytes: &usize) -> usize {
    bytes / MB
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Unsupported file type: {extension}. Supported types: .pdf, .docx, .txt, .md")]
    UnsupportedType { extension: String },

    #[error(
        "File size is {:.1}MB. Maximum supported size is {}MB.",
        megabytes(.size),
        whole_megabytes(.max)
    )]
    TooLarge { size: usize, max: usize },

    #[error("failed to read {kind} document: {reason}")]
    Malformed { kind: &'static str, reason: String },
}

/// Supported document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Docx,
    Text,
}

impl DocumentKind {
    /// Classify by the (case-insensitive) extension of `filename`.
    pub fn from_filename(filename: &str) -> Result<Self, ExtractError> {
        let extension = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_lowercase()))
            .unwrap_or_default();
        match extension.as_str() {
            ".pdf" => Ok(DocumentKind::Pdf),
            ".docx" => Ok(DocumentKind::Docx),
            ".txt" | ".md" => Ok(DocumentKind::Text),
            _ => Err(ExtractError::UnsupportedType { extension }),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            DocumentKind::Pdf => "PDF",
            DocumentKind::Docx => "DOCX",
            DocumentKind::Text => "text",
        }
    }
}

/// Extract the text of an uploaded document.
pub fn extract_text(bytes: &[u8], filename: &str, max_bytes: usize) -> Result<String, ExtractError> {
    let kind = DocumentKind::from_filename(filename)?;
    if bytes.len() > max_bytes {
        return Err(ExtractError::TooLarge {
            size: bytes.len(),
            max: max_bytes,
        });
    }

    let text = match kind {
        DocumentKind::Text => String::from_utf8(bytes.to_vec()).map_err(|e| malformed(kind, e))?,
        DocumentKind::Docx => docx::extract(bytes).map_err(|e| malformed(kind, e))?,
        DocumentKind::Pdf => pdf::extract(bytes).map_err(|e| malformed(kind, e))?,
    };
    debug!(
        "extracted {} chars from {} ({} bytes)",
        text.chars().count(),
        filename,
        bytes.len()
    );
    Ok(text)
}

fn malformed(kind: DocumentKind, err: impl std::fmt::Display) -> ExtractError {
    ExtractError::Malformed {
        kind: kind.label(),
        reason: err.to_string(),
    }
}
