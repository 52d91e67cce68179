//! Super-header synthesis: one bounded representative text per document.

use crate::keywords::KeywordSet;
use crate::reader::ReaderDocument;

/// Upper bound on the assembled super-header.
pub const HEADER_MAX_CHARS: usize = 1800;

const TITLE_MAX_CHARS: usize = 100;
const AUTHOR_MAX_CHARS: usize = 100;
const TAGS_MAX_CHARS: usize = 100;
const SUMMARY_MAX_CHARS: usize = 1000;

/// Assembles the labeled super-header text for one document.
///
/// Sections appear in a fixed order, each bounded, separated by blank lines;
/// the whole is capped at [`HEADER_MAX_CHARS`].
pub fn compose_super_header(doc: &ReaderDocument, keywords: &KeywordSet) -> String {
    let mut sections = Vec::with_capacity(6);
    sections.push(format!(
        "Title: {}",
        truncate_chars(doc.title_or_default(), TITLE_MAX_CHARS)
    ));
    sections.push(format!(
        "Author: {}",
        truncate_chars(doc.author_or_default(), AUTHOR_MAX_CHARS)
    ));

    let tags = doc.tag_names();
    if !tags.is_empty() {
        sections.push(format!(
            "Tags: {}",
            truncate_chars(&tags.join(", "), TAGS_MAX_CHARS)
        ));
    }
    if let Some(summary) = doc.summary.as_deref().filter(|s| !s.trim().is_empty()) {
        sections.push(format!(
            "Summary: {}",
            truncate_chars(summary.trim(), SUMMARY_MAX_CHARS)
        ));
    }

    sections.push(format!("RAKE Keywords: {}", join_terms(&keywords.rake)));
    sections.push(format!("TF-IDF Terms: {}", join_terms(&keywords.tfidf)));

    truncate_chars(&sections.join("\n\n"), HEADER_MAX_CHARS)
}

fn join_terms(terms: &[(String, f64)]) -> String {
    terms
        .iter()
        .map(|(term, _)| term.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}
