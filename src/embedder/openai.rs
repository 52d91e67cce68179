//! OpenAI-compatible embedding client with context-overflow recovery.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{average, pad_to, Embedder, EmbedError, BATCH_HEADROOM, EMBED_CONTEXT_LIMIT};
use crate::tokens::{bisect, TokenCounter};

/// Embedding client for OpenAI-compatible `/embeddings` endpoints.
///
/// Inputs that overflow the model context are bisected at sentence
/// boundaries and the halves embedded in parallel, recursively, with the
/// component-wise average standing in for the whole.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimension: usize,
    max_retries: usize,
    tokens: Arc<TokenCounter>,
}

impl OpenAiEmbedder {
    /// Builds a new embedding client.
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        dimension: usize,
        timeout: Duration,
        max_retries: usize,
        tokens: Arc<TokenCounter>,
    ) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing OpenAI API key");
        anyhow::ensure!(!model.trim().is_empty(), "missing embedding model name");
        anyhow::ensure!(dimension > 0, "embedding dimension must be positive");
        let mut headers = reqwest::header::HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid OpenAI API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build embedding HTTP client")?;
        let endpoint = format!("{}/embeddings", base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            model,
            dimension,
            max_retries: max_retries.max(1),
            tokens,
        })
    }

    /// One raw request for a batch of inputs, with backoff on transient
    /// failures. Context-length rejections surface as
    /// [`EmbedError::ContextOverflow`].
    async fn raw_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let mut attempt = 0usize;
        loop {
            let request = EmbeddingRequest {
                model: &self.model,
                input: inputs,
                dimensions: Some(self.dimension),
            };
            let response = self.client.post(&self.endpoint).json(&request).send().await;
            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let mut parsed: EmbeddingResponse =
                            resp.json().await.map_err(EmbedError::Http)?;
                        parsed.data.sort_by_key(|entry| entry.index);
                        if parsed.data.len() != inputs.len() {
                            return Err(EmbedError::Api {
                                status: status.as_u16(),
                                message: format!(
                                    "{} embeddings returned for {} inputs",
                                    parsed.data.len(),
                                    inputs.len()
                                ),
                            });
                        }
                        return Ok(parsed
                            .data
                            .into_iter()
                            .map(|entry| entry.embedding)
                            .collect());
                    }

                    let body = resp
                        .text()
                        .await
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if is_context_overflow(status, &body) {
                        return Err(EmbedError::ContextOverflow(body));
                    }
                    if should_retry(status) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        tokio::time::sleep(retry_backoff(attempt)).await;
                        continue;
                    }
                    return Err(EmbedError::Api {
                        status: status.as_u16(),
                        message: body,
                    });
                }
                Err(err) => {
                    let retryable = err.is_timeout() || err.is_connect() || err.is_request();
                    if retryable && attempt + 1 < self.max_retries {
                        attempt += 1;
                        tokio::time::sleep(retry_backoff(attempt)).await;
                        continue;
                    }
                    return Err(EmbedError::Http(err));
                }
            }
        }
    }

    /// Embeds one text, splitting at the latest sentence boundary before the
    /// character midpoint whenever the service reports a context overflow.
    fn safe_embed<'a>(
        &'a self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<f32>, EmbedError>> + Send + 'a>> {
        Box::pin(async move {
            match self.raw_batch(&[text]).await {
                Ok(mut vectors) => Ok(pad_to(vectors.remove(0), self.dimension)),
                Err(EmbedError::ContextOverflow(msg)) => {
                    let (head, tail) = bisect(text);
                    if head.is_empty() || tail.is_empty() {
                        return Err(EmbedError::ContextOverflow(msg));
                    }
                    debug!(
                        head_chars = head.len(),
                        tail_chars = tail.len(),
                        "bisecting oversize embedding input"
                    );
                    let (left, right) =
                        futures_util::future::try_join(self.safe_embed(head), self.safe_embed(tail))
                            .await?;
                    Ok(average(&left, &right))
                }
                Err(err) => Err(err),
            }
        })
    }

    async fn flush(&self, batch: &[&str]) -> Result<Vec<Vec<f32>>, EmbedError> {
        match self.raw_batch(batch).await {
            Ok(vectors) => Ok(vectors
                .into_iter()
                .map(|v| pad_to(v, self.dimension))
                .collect()),
            Err(EmbedError::ContextOverflow(_)) => {
                warn!("batch rejected for context length, retrying items individually");
                let mut out = Vec::with_capacity(batch.len());
                for text in batch {
                    out.push(self.safe_embed(text).await?);
                }
                Ok(out)
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        self.safe_embed(text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let budget = EMBED_CONTEXT_LIMIT - BATCH_HEADROOM;
        let mut out: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        let mut batch: Vec<&str> = Vec::new();
        let mut batch_tokens = 0usize;

        for text in texts {
            let len = self.tokens.token_len(text);
            if len > budget {
                if !batch.is_empty() {
                    out.extend(self.flush(&batch).await?);
                    batch.clear();
                    batch_tokens = 0;
                }
                out.push(self.safe_embed(text).await?);
                continue;
            }
            if batch_tokens + len > budget && !batch.is_empty() {
                out.extend(self.flush(&batch).await?);
                batch.clear();
                batch_tokens = 0;
            }
            batch.push(text.as_str());
            batch_tokens += len;
        }
        if !batch.is_empty() {
            out.extend(self.flush(&batch).await?);
        }
        Ok(out)
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_context_overflow(status: StatusCode, body: &str) -> bool {
    status.is_client_error()
        && (body.contains("context_length_exceeded") || body.contains("maximum context length"))
}

fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}
