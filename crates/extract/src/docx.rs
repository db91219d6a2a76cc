// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::io::{Cursor, Read};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;

const DOCUMENT_PART: &str = "word/document.xml";

/// Paragraph and run markup that contributes to the visible text.
const TOKEN_PATTERN: &str =
    r"<w:p\b[^>]*/>|<w:p\b[^>]*>|</w:p>|<w:t\b[^>]*/>|<w:t\b[^>]*>([^<]*)</w:t>|<w:tab/>|<w:br\b[^>]*/>";

fn tokens() -> Result<&'static Regex> {
    static TOKENS: OnceLock<Regex> = OnceLock::new();
    if let Some(re) = TOKENS.get() {
        return Ok(re);
    }
    let re = Regex::new(TOKEN_PATTERN).context("invalid docx token pattern")?;
    Ok(TOKENS.get_or_init(|| re))
}

/// Paragraph texts of the main document part, one per line.
pub(crate) fn extract(bytes: &[u8]) -> Result<String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).context("not a zip archive")?;
    let mut xml = String::new();
    archive
        .by_name(DOCUMENT_PART)
        .with_context(|| format!("missing {DOCUMENT_PART}"))?
        .read_to_string(&mut xml)
        .with_context(|| format!("unreadable {DOCUMENT_PART}"))?;

    paragraphs(&xml).map(|p| p.join("\n"))
}

fn paragraphs(xml: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut current: Option<String> = None;

    for cap in tokens()?.captures_iter(xml) {
        let tag = cap.get(0).map(|m| m.as_str()).unwrap_or_default();
        if let Some(text) = cap.get(1) {
            if let Some(p) = current.as_mut() {
                p.push_str(&unescape(text.as_str()));
            }
        } else if tag == "</w:p>" {
            if let Some(p) = current.take() {
                out.push(p);
            }
        } else if tag.starts_with("<w:p") {
            if tag.ends_with("/>") {
                out.push(String::new());
            } else {
                current = Some(String::new());
            }
        } else if tag == "<w:tab/>" {
            if let Some(p) = current.as_mut() {
                p.push('\t');
            }
        } else if tag.starts_with("<w:br") {
            if let Some(p) = current.as_mut() {
                p.push('\n');
            }
        }
    }
    Ok(out)
}

fn unescape(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
