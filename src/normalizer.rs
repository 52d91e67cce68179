//! Deterministic HTML-to-text normalization for downstream chunking.

use once_cell::sync::Lazy;
use regex::Regex;

static BR_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").expect("br regex"));
static BLOCK_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<(?:p|div|h[1-6]|li)(?:\s[^>]*)?>").expect("block open regex"));
static BLOCK_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</(?:p|div|h[1-6]|li)>").expect("block close regex"));
static ANY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]+>").expect("tag regex"));
static LINE_TRAILING: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+\n").expect("trailing regex"));
static EXTRA_NEWLINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("newline regex"));

/// Converts marked-up content into paragraph-bounded plain text.
///
/// Explicit line breaks become single newlines, block-level openings become
/// paragraph breaks, all other markup is stripped, and whitespace is
/// normalized so that paragraphs are separated by exactly one blank line.
pub fn html_to_text(html: &str) -> String {
    let text = BR_TAG.replace_all(html, "\n");
    let text = BLOCK_OPEN.replace_all(&text, "\n\n");
    let text = BLOCK_CLOSE.replace_all(&text, "");
    let text = ANY_TAG.replace_all(&text, "");
    let text = html_escape::decode_html_entities(&text);
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let text = LINE_TRAILING.replace_all(&text, "\n");
    let text = EXTRA_NEWLINES.replace_all(&text, "\n\n");
    text.trim().to_string()
}
