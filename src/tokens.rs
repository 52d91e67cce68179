//! Exact token accounting and stop-word stripping shared across the pipeline.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;
use tiktoken_rs::{cl100k_base, CoreBPE};

/// Fixed English stop-word reference list used by sparse construction,
/// keyword extraction, and query preprocessing.
pub const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "am", "an", "and", "any", "are",
    "aren't", "as", "at", "be", "because", "been", "before", "being", "below", "between", "both",
    "but", "by", "can", "can't", "cannot", "could", "couldn't", "did", "didn't", "do", "does",
    "doesn't", "doing", "don't", "down", "during", "each", "few", "for", "from", "further", "had",
    "hadn't", "has", "hasn't", "have", "haven't", "having", "he", "he'd", "he'll", "he's", "her",
    "here", "here's", "hers", "herself", "him", "himself", "his", "how", "how's", "i", "i'd",
    "i'll", "i'm", "i've", "if", "in", "into", "is", "isn't", "it", "it's", "its", "itself",
    "let's", "me", "more", "most", "mustn't", "my", "myself", "no", "nor", "not", "of", "off",
    "on", "once", "only", "or", "other", "ought", "our", "ours", "ourselves", "out", "over",
    "own", "same", "shan't", "she", "she'd", "she'll", "she's", "should", "shouldn't", "so",
    "some", "such", "than", "that", "that's", "the", "their", "theirs", "them", "themselves",
    "then", "there", "there's", "these", "they", "they'd", "they'll", "they're", "they've",
    "this", "those", "through", "to", "too", "under", "until", "up", "very", "was", "wasn't",
    "we", "we'd", "we'll", "we're", "we've", "were", "weren't", "what", "what's", "when",
    "when's", "where", "where's", "which", "while", "who", "who's", "whom", "why", "why's",
    "with", "won't", "would", "wouldn't", "you", "you'd", "you'll", "you're", "you've", "your",
    "yours", "yourself", "yourselves",
];

static STOP_SET: Lazy<HashSet<&'static str>> = Lazy::new(|| STOP_WORDS.iter().copied().collect());

static BPE: Lazy<CoreBPE> = Lazy::new(|| cl100k_base().expect("cl100k_base vocabulary"));

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9']+").expect("word regex"));

/// Returns true when the word matches the stop-word reference list
/// (comparison is case-insensitive).
pub fn is_stop_word(word: &str) -> bool {
    STOP_SET.contains(word.to_lowercase().as_str())
}

/// Removes English stop-words from the text, preserving the casing of the
/// surviving words, then collapses whitespace runs to single spaces.
pub fn strip_stops(text: &str) -> String {
    let mut kept = String::with_capacity(text.len());
    let mut last = 0;
    for m in WORD.find_iter(text) {
        kept.push_str(&text[last..m.start()]);
        if !is_stop_word(m.as_str()) {
            kept.push_str(m.as_str());
        }
        last = m.end();
    }
    kept.push_str(&text[last..]);
    collapse_whitespace(&kept)
}

fn collapse_whitespace(input: &str) -> String {
    let mut buf = String::with_capacity(input.len());
    let mut last_space = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            if !last_space && !buf.is_empty() {
                buf.push(' ');
            }
            last_space = true;
        } else {
            buf.push(ch);
            last_space = false;
        }
    }
    buf.trim_end().to_string()
}

/// Exact token counter for the embedding model's `cl100k_base` scheme.
///
/// Callers use these counts to decide whether inputs fit a hard context
/// limit, so the count is the real encoded length rather than a word-count
/// heuristic. Repeated lookups within a pipeline run hit an in-memory cache
/// keyed by the exact string; entries are never evicted, so the cache is
/// bounded by the corpus handed to one run.
#[derive(Default)]
pub struct TokenCounter {
    cache: Mutex<HashMap<String, usize>>,
}

impl TokenCounter {
    /// Creates a counter with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Exact encoded token count of `text`.
    pub fn token_len(&self, text: &str) -> usize {
        {
            let cache = self.cache.lock().expect("token cache poisoned");
            if let Some(&len) = cache.get(text) {
                return len;
            }
        }
        let len = BPE.encode_with_special_tokens(text).len();
        let mut cache = self.cache.lock().expect("token cache poisoned");
        cache.insert(text.to_string(), len);
        len
    }

    /// Recursively bisects `text` until every piece encodes to at most `ctx`
    /// tokens. Splits prefer the latest sentence-terminating punctuation
    /// before the character midpoint, falling back to the raw midpoint when
    /// none lies after the first 100 characters.
    pub fn split_to_fit(&self, text: &str, ctx: usize) -> Vec<String> {
        if self.token_len(text) <= ctx {
            return vec![text.to_string()];
        }
        let (head, tail) = bisect(text);
        if head.is_empty() || tail.is_empty() {
            return vec![text.to_string()];
        }
        let mut pieces = self.split_to_fit(head, ctx);
        pieces.extend(self.split_to_fit(tail, ctx));
        pieces
    }
}

/// Splits `text` at the latest `.`/`!`/`?` before the character midpoint,
/// provided it lies after the first 100 characters; otherwise at the raw
/// midpoint.
pub(crate) fn bisect(text: &str) -> (&str, &str) {
    let total_chars = text.chars().count();
    let mid_chars = total_chars / 2;

    let mut mid_byte = text.len();
    let mut sentence_end = None;
    for (chars_seen, (byte_idx, ch)) in text.char_indices().enumerate() {
        if chars_seen == mid_chars {
            mid_byte = byte_idx;
            break;
        }
        if matches!(ch, '.' | '!' | '?') && chars_seen > 100 {
            sentence_end = Some(byte_idx + ch.len_utf8());
        }
    }

    match sentence_end {
        Some(at) => text.split_at(at),
        None => text.split_at(mid_byte),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn strips_stop_words_and_collapses_whitespace() {
        assert_eq!(
            strip_stops("the operator pattern is a way to extend Kubernetes"),
            "operator pattern way extend Kubernetes"
        );
    }

    #[test]
    fn strip_preserves_casing() {
        assert_eq!(strip_stops("The Rust Book"), "Rust Book");
    }

    #[test]
    fn strip_of_pure_stop_text_is_empty() {
        assert_eq!(strip_stops("the of and to"), "");
    }

    #[test]
    fn token_len_is_cached_and_stable() {
        let counter = TokenCounter::new();
        let a = counter.token_len("hello world");
        let b = counter.token_len("hello world");
        assert_eq!(a, b);
        assert!(a >= 1);
    }

    #[test]
    fn split_to_fit_returns_whole_text_when_it_fits() {
        let counter = TokenCounter::new();
        let text = "short enough";
        let ctx = counter.token_len(text);
        assert_eq!(counter.split_to_fit(text, ctx), vec![text.to_string()]);
    }

    #[test]
    fn split_to_fit_pieces_fit_and_concatenate() {
        let counter = TokenCounter::new();
        let mut text = String::new();
        for i in 0..120 {
            text.push_str(&format!("Sentence number {i} talks about embeddings. "));
        }
        let ctx = 64;
        let pieces = counter.split_to_fit(&text, ctx);
        assert!(pieces.len() > 1);
        for piece in &pieces {
            assert!(counter.token_len(piece) <= ctx, "piece exceeds ctx");
        }
        let rejoined: String = pieces.concat();
        assert_eq!(rejoined, text);
    }

    #[test]
    fn bisect_prefers_sentence_boundary() {
        let mut text = String::new();
        for i in 0..40 {
            text.push_str(&format!("Clause {i} ends here. "));
        }
        let (head, _) = bisect(&text);
        assert!(head.ends_with('.') || head.ends_with(". "));
    }
}
