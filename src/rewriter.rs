//! LLM-backed query expansion with graceful degradation to the raw query.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

// Non-greedy so the match ends at the first closing brace: the expected
// object nests no braces, and stray `{...}` text later in the response must
// not be swallowed into the candidate.
static BRACED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{.*?\}").expect("brace regex"));

const REWRITE_PROMPT: &str = "You rewrite search queries for a personal reading archive. \
Respond with a single JSON object and nothing else, with exactly these keys: \
\"Optimized Query\" (a longer, technically specific restatement preserving the original intent), \
\"Related Topics\" (a list of synonyms and adjacent concepts), and \
\"Tags\" (a list of precise technical labels).\n\nQuery: ";

/// Capability trait for query rewriting. Implementations never fail: any
/// internal error degrades to returning the query unchanged, so substituting
/// a no-op implementation yields a working retriever.
#[async_trait]
pub trait Rewriter: Send + Sync {
    /// Expands `query` into a richer search text, or returns it unchanged.
    async fn rewrite(&self, query: &str) -> String;
}

/// No-op rewriter.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughRewriter;

#[async_trait]
impl Rewriter for PassthroughRewriter {
    async fn rewrite(&self, query: &str) -> String {
        query.to_string()
    }
}

/// Gemini-backed rewriter.
#[derive(Clone)]
pub struct GeminiRewriter {
    client: Client,
    endpoint: String,
}

impl GeminiRewriter {
    /// Builds a rewriter calling the given Gemini model.
    pub fn new(api_key: String, model: String, timeout: Duration) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing Gemini API key");
        anyhow::ensure!(!model.trim().is_empty(), "missing Gemini model name");
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "x-goog-api-key",
            HeaderValue::from_str(api_key.trim()).context("invalid Gemini API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build Gemini HTTP client")?;
        let endpoint = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            model.trim()
        );
        Ok(Self { client, endpoint })
    }

    async fn complete(&self, prompt: String) -> Result<String> {
        let body = json!({
            "contents": [ { "parts": [ { "text": prompt } ] } ]
        });
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .context("failed to call Gemini")?;
        let status = resp.status();
        anyhow::ensure!(status.is_success(), "Gemini returned {status}");
        let parsed: GenerateResponse = resp.json().await.context("invalid Gemini payload")?;
        parsed
            .candidates
            .into_iter()
            .flat_map(|c| c.content.parts)
            .map(|p| p.text)
            .next()
            .context("Gemini response carried no text")
    }
}

#[async_trait]
impl Rewriter for GeminiRewriter {
    async fn rewrite(&self, query: &str) -> String {
        let prompt = format!("{REWRITE_PROMPT}{query}");
        match self.complete(prompt).await {
            Ok(raw) => match parse_rewrite(&raw) {
                Some(expanded) => expanded,
                None => {
                    warn!("rewriter output was not parseable, using raw query");
                    query.to_string()
                }
            },
            Err(err) => {
                warn!(error = %err, "query rewrite failed, using raw query");
                query.to_string()
            }
        }
    }
}

/// Extracts the first brace-delimited object from `raw`, tolerating curly
/// quotes and stray prose around the object, and renders the expansion as
/// three labeled lines separated by blank lines. `None` on any shortfall.
pub fn parse_rewrite(raw: &str) -> Option<String> {
    let braced = BRACED.find(raw)?.as_str();
    let straightened = braced
        .replace(['\u{201c}', '\u{201d}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");
    let plan: RewritePlan = serde_json::from_str(&straightened).ok()?;
    Some(format!(
        "Optimized Query: {}\n\nRelated Topics: {}\n\nTags: {}",
        plan.optimized_query,
        plan.related_topics.join(", "),
        plan.tags.join(", ")
    ))
}

#[derive(Debug, Serialize, Deserialize)]
struct RewritePlan {
    #[serde(rename = "Optimized Query")]
    optimized_query: String,
    #[serde(rename = "Related Topics")]
    related_topics: Vec<String>,
    #[serde(rename = "Tags")]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}
