//! Corpus-wide TF-IDF and per-document RAKE keyword extraction.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::tokens::is_stop_word;

/// Number of RAKE phrases kept per document.
pub const RAKE_TOP_N: usize = 10;
/// Number of TF-IDF terms kept per document.
pub const TFIDF_TOP_N: usize = 10;
/// Minimum RAKE phrase score for a phrase to be kept.
pub const RAKE_SCORE_THRESHOLD: f64 = 2.0;
/// Cap on how many times one term is repeated in the boosted text.
const BOOST_REPEAT_CAP: usize = 5;

static NON_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\p{L}\p{N}\s.!?,;:]+").expect("rake strip regex"));
static PHRASE_DELIM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?,;:]+").expect("delim regex"));

/// Errors surfaced by TF-IDF queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TfIdfError {
    /// The model has documents that were added after the last `build`.
    NotBuilt,
}

impl fmt::Display for TfIdfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotBuilt => write!(f, "tf-idf model queried before build()"),
        }
    }
}

impl std::error::Error for TfIdfError {}

/// Keyword lists extracted for one document, plus a frequency-boosted text
/// used to concentrate keyword signal in sparse vectors.
#[derive(Debug, Clone, Default)]
pub struct KeywordSet {
    /// RAKE phrases, best first.
    pub rake: Vec<(String, f64)>,
    /// TF-IDF terms, best first.
    pub tfidf: Vec<(String, f64)>,
    /// Top terms repeated in proportion to their normalized weight.
    pub boosted_text: String,
}

/// Corpus-lifetime TF-IDF table.
///
/// Documents accumulate via [`add_document`](Self::add_document); queries are
/// only valid after [`build`](Self::build) has run since the most recent
/// addition, and fail with [`TfIdfError::NotBuilt`] otherwise.
#[derive(Debug, Default)]
pub struct TfIdfModel {
    term_counts: HashMap<String, HashMap<String, usize>>,
    doc_freq: HashMap<String, usize>,
    built: bool,
}

impl TfIdfModel {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents added so far.
    pub fn document_count(&self) -> usize {
        self.term_counts.len()
    }

    /// Adds (or replaces) a document's raw term frequencies and invalidates
    /// any previous build.
    pub fn add_document(&mut self, id: &str, text: &str) {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for term in tokenize_terms(text) {
            *counts.entry(term).or_insert(0) += 1;
        }
        self.term_counts.insert(id.to_string(), counts);
        self.built = false;
    }

    /// Recomputes document frequencies over the current documents and marks
    /// the model queryable.
    pub fn build(&mut self) {
        self.doc_freq.clear();
        for counts in self.term_counts.values() {
            for term in counts.keys() {
                *self.doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
        }
        self.built = true;
    }

    /// TF·IDF score of `term` within document `id`. TF is the raw count, IDF
    /// is `ln(N / df)`; unknown documents and terms score zero.
    pub fn tf_idf(&self, id: &str, term: &str) -> Result<f64, TfIdfError> {
        if !self.built {
            return Err(TfIdfError::NotBuilt);
        }
        let tf = self
            .term_counts
            .get(id)
            .and_then(|counts| counts.get(term))
            .copied()
            .unwrap_or(0);
        let df = self.doc_freq.get(term).copied().unwrap_or(0);
        if tf == 0 || df == 0 {
            return Ok(0.0);
        }
        let idf = (self.term_counts.len() as f64 / df as f64).ln();
        Ok(tf as f64 * idf)
    }

    /// The `n` highest-scoring terms of document `id`, excluding terms
    /// shorter than three characters and purely numeric terms. Unknown
    /// documents yield an empty list.
    pub fn top_terms(&self, id: &str, n: usize) -> Result<Vec<(String, f64)>, TfIdfError> {
        if !self.built {
            return Err(TfIdfError::NotBuilt);
        }
        let Some(counts) = self.term_counts.get(id) else {
            return Ok(Vec::new());
        };
        let total_docs = self.term_counts.len() as f64;
        let mut scored: Vec<(String, f64)> = counts
            .iter()
            .filter(|(term, _)| term.chars().count() >= 3 && !is_purely_numeric(term))
            .map(|(term, &tf)| {
                let df = self.doc_freq.get(term).copied().unwrap_or(0).max(1) as f64;
                (term.clone(), tf as f64 * (total_docs / df).ln())
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(n);
        Ok(scored)
    }

    /// Composes RAKE and TF-IDF extraction for one document, emitting the
    /// boosted text alongside both keyword lists.
    pub fn extract_keywords(&self, id: &str, text: &str) -> Result<KeywordSet, TfIdfError> {
        let tfidf = self.top_terms(id, TFIDF_TOP_N)?;
        let rake = rake_keywords(text, RAKE_TOP_N);

        let mut boosted = Vec::new();
        push_boosted(&rake, &mut boosted);
        push_boosted(&tfidf, &mut boosted);

        Ok(KeywordSet {
            rake,
            tfidf,
            boosted_text: boosted.join(" "),
        })
    }
}

/// RAKE: scores stop-word-bounded candidate phrases by summed word
/// degree-to-frequency ratios and returns the best `top_n` phrases whose
/// score clears [`RAKE_SCORE_THRESHOLD`].
pub fn rake_keywords(text: &str, top_n: usize) -> Vec<(String, f64)> {
    let lowered = text.to_lowercase().replace('\n', " ");
    let cleaned = NON_WORD.replace_all(&lowered, " ");

    let mut phrases: Vec<Vec<&str>> = Vec::new();
    for fragment in PHRASE_DELIM.split(&cleaned) {
        let mut current: Vec<&str> = Vec::new();
        for word in fragment.split_whitespace() {
            if is_stop_word(word) || word.chars().count() < 2 {
                if !current.is_empty() {
                    phrases.push(std::mem::take(&mut current));
                }
            } else {
                current.push(word);
            }
        }
        if !current.is_empty() {
            phrases.push(current);
        }
    }

    let mut freq: HashMap<&str, f64> = HashMap::new();
    let mut degree: HashMap<&str, f64> = HashMap::new();
    for phrase in &phrases {
        for &word in phrase {
            *freq.entry(word).or_insert(0.0) += 1.0;
            *degree.entry(word).or_insert(0.0) += phrase.len() as f64;
        }
    }

    let mut scored: HashMap<String, f64> = HashMap::new();
    for phrase in &phrases {
        let score: f64 = phrase.iter().map(|&word| degree[word] / freq[word]).sum();
        scored.entry(phrase.join(" ")).or_insert(score);
    }

    let mut ranked: Vec<(String, f64)> = scored
        .into_iter()
        .filter(|(_, score)| *score >= RAKE_SCORE_THRESHOLD)
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(top_n);
    ranked
}

/// Lowercased alphanumeric terms of length two or more, stop-words removed.
fn tokenize_terms(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|term| term.chars().count() >= 2 && !is_stop_word(term))
        .map(str::to_string)
        .collect()
}

fn is_purely_numeric(term: &str) -> bool {
    !term.is_empty() && term.chars().all(|ch| ch.is_ascii_digit())
}

fn push_boosted(terms: &[(String, f64)], out: &mut Vec<String>) {
    let max = terms
        .iter()
        .map(|(_, weight)| *weight)
        .fold(0.0_f64, f64::max);
    if max <= 0.0 {
        return;
    }
    for (term, weight) in terms {
        let reps = ((3.0 * (weight / max)).ceil() as usize).min(BOOST_REPEAT_CAP);
        for _ in 0..reps {
            out.push(term.clone());
        }
    }
}
