//! Two-stage hybrid retrieval: a header pass to pick candidate documents,
//! then a chunk pass to rank passages within them.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::embedder::{EmbedError, Embedder};
use crate::rewriter::Rewriter;
use crate::sparse::{SparseVector, DEFAULT_MAX_TERMS};
use crate::tokens::strip_stops;
use crate::vector_store::{
    chunk_filter, doc_id_from_record_id, header_filter, VectorIndex, VectorQuery, VectorStoreError,
};

/// Characters of the title kept in an in-text citation.
const CITATION_CHARS: usize = 12;

/// Retrieval tuning knobs.
///
/// Scores are dot products over hybrid records. The dense side uses
/// unit-normalized embeddings, so its contribution is cosine-like; the
/// defaults assume that scale and are configurable for other setups.
#[derive(Debug, Clone, Copy)]
pub struct RetrieverConfig {
    /// Final passage count.
    pub top_k: usize,
    /// Minimum chunk score kept.
    pub min_score: f32,
    /// Candidate documents requested in the header pass.
    pub header_top_k: usize,
    /// Minimum header score kept; higher than `min_score` because header
    /// vectors concentrate tag and keyword signal.
    pub header_min_score: f32,
    /// Sparse term budget for the query vector.
    pub max_terms: usize,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            top_k: 12,
            min_score: 0.7,
            header_top_k: 10,
            header_min_score: 0.75,
            max_terms: DEFAULT_MAX_TERMS,
        }
    }
}

/// One retrieved passage with provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Passage {
    /// Hybrid similarity score.
    pub score: f32,
    /// Owning document title.
    pub title: String,
    /// Passage text.
    pub text: String,
    /// Owning document id.
    pub doc_id: String,
    /// Owning document URL.
    pub url: String,
}

/// Context rendered for a downstream language model.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedContext {
    /// Formatted excerpt blocks plus the sources list.
    pub text: String,
    /// False when no passage survived retrieval.
    pub has_sources: bool,
}

/// Errors surfaced by a search.
#[derive(Debug)]
pub enum SearchError {
    /// Query embedding failed.
    Embed(EmbedError),
    /// A header or chunk query failed.
    Store(VectorStoreError),
}

impl fmt::Display for SearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed(err) => write!(f, "query embedding failed: {err}"),
            Self::Store(err) => write!(f, "search failed: {err}"),
        }
    }
}

impl std::error::Error for SearchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Embed(err) => Some(err),
            Self::Store(err) => Some(err),
        }
    }
}

/// Stateless two-stage retriever over a hybrid vector index.
pub struct Retriever {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    rewriter: Arc<dyn Rewriter>,
    config: RetrieverConfig,
}

impl Retriever {
    /// Builds a retriever over the given collaborators.
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        rewriter: Arc<dyn Rewriter>,
        config: RetrieverConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            rewriter,
            config,
        }
    }

    /// Runs the full query path: rewrite, stop-strip, hybrid header pass,
    /// hybrid chunk pass. An empty candidate set is a normal empty result.
    pub async fn search(&self, query: &str) -> Result<Vec<Passage>, SearchError> {
        let rewritten = self.rewriter.rewrite(query).await;
        let stripped = strip_stops(&rewritten);
        if stripped.is_empty() {
            return Ok(Vec::new());
        }

        let dense = self
            .embedder
            .embed(&stripped)
            .await
            .map_err(SearchError::Embed)?;
        let sparse = SparseVector::from_text(&stripped, self.config.max_terms);
        let sparse = (!sparse.is_empty()).then_some(sparse);

        let candidates = self.header_pass(&dense, sparse.clone()).await?;
        if candidates.is_empty() {
            debug!("header pass produced no candidate documents");
            return Ok(Vec::new());
        }
        self.chunk_pass(&dense, sparse, &candidates).await
    }

    async fn header_pass(
        &self,
        dense: &[f32],
        sparse: Option<SparseVector>,
    ) -> Result<Vec<String>, SearchError> {
        let matches = self
            .index
            .query(VectorQuery {
                vector: dense.to_vec(),
                sparse_vector: sparse,
                top_k: self.config.header_top_k,
                filter: Some(header_filter(true)),
                include_metadata: true,
            })
            .await
            .map_err(SearchError::Store)?;

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for m in matches {
            if m.score < self.config.header_min_score {
                continue;
            }
            let doc_id = m
                .metadata
                .as_ref()
                .map(|meta| meta.doc_id.clone())
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| doc_id_from_record_id(&m.id).to_string());
            if seen.insert(doc_id.clone()) {
                candidates.push(doc_id);
            }
        }
        debug!(candidates = candidates.len(), "header pass complete");
        Ok(candidates)
    }

    async fn chunk_pass(
        &self,
        dense: &[f32],
        sparse: Option<SparseVector>,
        candidates: &[String],
    ) -> Result<Vec<Passage>, SearchError> {
        let matches = self
            .index
            .query(VectorQuery {
                vector: dense.to_vec(),
                sparse_vector: sparse,
                top_k: 2 * self.config.top_k,
                filter: Some(chunk_filter(candidates)),
                include_metadata: true,
            })
            .await
            .map_err(SearchError::Store)?;

        let mut seen = HashSet::new();
        let mut passages = Vec::new();
        for m in matches {
            if m.score < self.config.min_score || !seen.insert(m.id.clone()) {
                continue;
            }
            let meta = m.metadata.unwrap_or_default();
            let doc_id = if meta.doc_id.is_empty() {
                doc_id_from_record_id(&m.id).to_string()
            } else {
                meta.doc_id
            };
            passages.push(Passage {
                score: m.score,
                title: meta.title,
                text: meta.text.unwrap_or_default(),
                doc_id,
                url: meta.url,
            });
            if passages.len() == self.config.top_k {
                break;
            }
        }
        Ok(passages)
    }
}

/// Renders passages into citation-mapped context blocks followed by a
/// markdown sources list.
pub fn render_context(passages: &[Passage]) -> RenderedContext {
    let mut blocks: Vec<String> = Vec::with_capacity(passages.len() + 1);
    let mut titles: Vec<&str> = Vec::new();
    let mut seen_titles = HashSet::new();
    for passage in passages {
        blocks.push(format!(
            "Document Title: {}\nIn-Text Citation: [{}]\nDocument URL: {}\nExcerpt: {}\n",
            passage.title,
            abbreviate_title(&passage.title),
            passage.url,
            repair_markdown(&passage.text),
        ));
        if seen_titles.insert(passage.title.as_str()) {
            titles.push(&passage.title);
        }
    }

    if !titles.is_empty() {
        let mut sources = String::from("## Sources\n");
        for title in titles {
            sources.push_str(&format!("- {title}\n"));
        }
        blocks.push(sources);
    }

    RenderedContext {
        text: blocks.join("\n"),
        has_sources: !passages.is_empty(),
    }
}

/// First [`CITATION_CHARS`] characters of the title, with an ellipsis when
/// truncated.
fn abbreviate_title(title: &str) -> String {
    if title.chars().count() <= CITATION_CHARS {
        return title.to_string();
    }
    let head: String = title.chars().take(CITATION_CHARS).collect();
    format!("{head}...")
}

static INLINE_BEFORE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([^\s`])(`[^`\n]+`)").expect("inline regex"));
static INLINE_AFTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(`[^`\n]+`)([^\s`])").expect("inline regex"));

/// Light markdown repair for downstream rendering: fenced code blocks get
/// surrounding blank lines, inline code gets padding spaces, headings get a
/// preceding blank line. A no-op on already-correct input.
pub fn repair_markdown(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut in_fence = false;
    for raw_line in text.lines() {
        let is_fence = raw_line.trim_start().starts_with("```");
        if is_fence {
            if !in_fence {
                if matches!(out.last(), Some(prev) if !prev.is_empty()) {
                    out.push(String::new());
                }
                in_fence = true;
            } else {
                in_fence = false;
            }
            out.push(raw_line.to_string());
            continue;
        }
        if in_fence {
            out.push(raw_line.to_string());
            continue;
        }

        let after_closing_fence =
            matches!(out.last(), Some(prev) if prev.trim_start().starts_with("```"));
        if !raw_line.is_empty() && (after_closing_fence || is_heading(raw_line)) {
            if matches!(out.last(), Some(prev) if !prev.is_empty()) {
                out.push(String::new());
            }
        }

        let padded = INLINE_BEFORE.replace_all(raw_line, "$1 $2");
        let padded = INLINE_AFTER.replace_all(&padded, "$1 $2");
        out.push(padded.into_owned());
    }
    out.join("\n")
}

fn is_heading(line: &str) -> bool {
    let hashes = line.chars().take_while(|&c| c == '#').count();
    (1..=6).contains(&hashes) && line[hashes..].starts_with(' ')
}
