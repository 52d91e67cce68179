//! Hybrid vector index capability and the Pinecone-backed implementation.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use crate::sparse::SparseVector;

/// Record id for a document's super-header vector.
pub fn header_record_id(doc_id: &str) -> String {
    format!("{doc_id}-header")
}

/// Record id for a document's `i`-th chunk vector.
pub fn chunk_record_id(doc_id: &str, index: u32) -> String {
    format!("{doc_id}-chunk-{index}")
}

/// Recovers the owning document id from a record id.
pub fn doc_id_from_record_id(record_id: &str) -> &str {
    if let Some(stripped) = record_id.strip_suffix("-header") {
        return stripped;
    }
    if let Some(at) = record_id.rfind("-chunk-") {
        return &record_id[..at];
    }
    record_id
}

/// Metadata stored alongside every vector record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordMetadata {
    /// Owning document identifier.
    pub doc_id: String,
    /// Document title.
    pub title: String,
    /// Document author.
    pub author: String,
    /// Canonical document URL.
    pub url: String,
    /// Reader-assigned category.
    pub category: String,
    /// Chunk body text (chunk records only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Document summary (header records only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Tag labels (header records only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// True for the super-header record, false for chunks.
    pub header: bool,
    /// Zero-based chunk index (chunk records only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<u32>,
    /// Document creation timestamp, ISO-8601.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// One hybrid record as stored in the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorRecord {
    /// `"<docId>-header"` or `"<docId>-chunk-<i>"`.
    pub id: String,
    /// Dense vector, padded to the configured dimension.
    pub values: Vec<f32>,
    /// Sparse bag-of-terms companion vector.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sparse_values: Option<SparseVector>,
    /// Record metadata.
    pub metadata: RecordMetadata,
}

/// Parameters for one hybrid query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorQuery {
    /// Dense query vector.
    pub vector: Vec<f32>,
    /// Sparse query vector.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sparse_vector: Option<SparseVector>,
    /// Number of matches requested.
    pub top_k: usize,
    /// Metadata filter (`$eq` on booleans, `$in` on id lists).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<serde_json::Value>,
    /// Whether match metadata is returned.
    pub include_metadata: bool,
}

/// One scored match returned by a query.
#[derive(Debug, Clone, Deserialize)]
pub struct VectorMatch {
    /// Record id.
    pub id: String,
    /// Dot-product hybrid score.
    #[serde(default)]
    pub score: f32,
    /// Stored metadata, when requested.
    #[serde(default)]
    pub metadata: Option<RecordMetadata>,
}

/// Aggregate index statistics.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexStats {
    /// Total records stored.
    pub total_vector_count: u64,
    /// Index dimension.
    pub dimension: usize,
}

/// Filter matching header records (`true`) or chunk records (`false`).
pub fn header_filter(is_header: bool) -> serde_json::Value {
    json!({ "header": { "$eq": is_header } })
}

/// Filter matching chunk records belonging to the candidate documents.
pub fn chunk_filter(doc_ids: &[String]) -> serde_json::Value {
    json!({ "header": { "$eq": false }, "doc_id": { "$in": doc_ids } })
}

/// Errors surfaced by vector store operations.
#[derive(Debug)]
pub enum VectorStoreError {
    /// Non-success response from the store, message embedded verbatim.
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },
    /// Transport-level failure.
    Http(reqwest::Error),
}

impl fmt::Display for VectorStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Api { status, message } => {
                write!(f, "vector store request failed ({status}): {message}")
            }
            Self::Http(err) => write!(f, "vector store http error: {err}"),
        }
    }
}

impl std::error::Error for VectorStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Http(err) => Some(err),
            Self::Api { .. } => None,
        }
    }
}

/// Capability trait over hybrid-capable vector stores.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Aggregate statistics for the index.
    async fn describe_stats(&self) -> Result<IndexStats, VectorStoreError>;

    /// Inserts or replaces records by id.
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), VectorStoreError>;

    /// Runs one hybrid similarity query.
    async fn query(&self, query: VectorQuery) -> Result<Vec<VectorMatch>, VectorStoreError>;
}

/// Pinecone index client speaking the data-plane HTTP API.
///
/// The index must be configured with dot-product similarity; hybrid scoring
/// is undefined under other metrics.
#[derive(Clone)]
pub struct PineconeIndex {
    client: Client,
    host: String,
    max_retries: usize,
}

impl PineconeIndex {
    /// Builds a client for the index served at `host`.
    pub fn new(api_key: String, host: String, timeout: Duration, max_retries: usize) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing Pinecone API key");
        let parsed = Url::parse(host.trim()).context("invalid Pinecone index host")?;
        anyhow::ensure!(
            matches!(parsed.scheme(), "http" | "https"),
            "Pinecone index host must be an http(s) URL"
        );
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "Api-Key",
            HeaderValue::from_str(api_key.trim()).context("invalid Pinecone API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build Pinecone HTTP client")?;
        Ok(Self {
            client,
            host: host.trim().trim_end_matches('/').to_string(),
            max_retries: max_retries.max(1),
        })
    }

    async fn post<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, VectorStoreError> {
        let url = format!("{}{path}", self.host);
        let mut attempt = 0usize;
        loop {
            let response = self.client.post(&url).json(body).send().await;
            match response {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    let message = resp
                        .text()
                        .await
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if should_retry(status) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        tokio::time::sleep(retry_backoff(attempt)).await;
                        continue;
                    }
                    return Err(VectorStoreError::Api {
                        status: status.as_u16(),
                        message,
                    });
                }
                Err(err) => {
                    let retryable = err.is_timeout() || err.is_connect() || err.is_request();
                    if retryable && attempt + 1 < self.max_retries {
                        attempt += 1;
                        tokio::time::sleep(retry_backoff(attempt)).await;
                        continue;
                    }
                    return Err(VectorStoreError::Http(err));
                }
            }
        }
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    async fn describe_stats(&self) -> Result<IndexStats, VectorStoreError> {
        let resp = self.post("/describe_index_stats", &json!({})).await?;
        resp.json().await.map_err(VectorStoreError::Http)
    }

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), VectorStoreError> {
        let body = json!({ "vectors": records });
        self.post("/vectors/upsert", &body).await?;
        Ok(())
    }

    async fn query(&self, query: VectorQuery) -> Result<Vec<VectorMatch>, VectorStoreError> {
        let resp = self.post("/query", &query).await?;
        let parsed: QueryResponse = resp.json().await.map_err(VectorStoreError::Http)?;
        Ok(parsed.matches)
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<VectorMatch>,
}
