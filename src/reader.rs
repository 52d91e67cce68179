//! Reader-service client: cursor paging across locations with rate-limit
//! handling, and the document snapshot model it returns.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::normalizer::html_to_text;

/// Default reader API base URL.
pub const DEFAULT_READER_BASE_URL: &str = "https://readwise.io/api/v3";

/// Fallback wait when a 429 response carries no `Retry-After` header.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Reading-list locations, paged in this fixed order.
pub const LOCATIONS: [Location; 3] = [Location::New, Location::Later, Location::Archive];

/// A reader-service document location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Unread queue.
    New,
    /// Deferred queue.
    Later,
    /// Archived items.
    Archive,
}

impl Location {
    /// Query-parameter value for this location.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Later => "later",
            Self::Archive => "archive",
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tag label as delivered by the reader API: either a bare string or an
/// object carrying a `name` attribute.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    /// Bare string label.
    Plain(String),
    /// Object form.
    Named {
        /// The tag's display name.
        name: String,
    },
}

impl TagValue {
    /// The tag's name regardless of wire shape.
    pub fn name(&self) -> &str {
        match self {
            Self::Plain(name) => name,
            Self::Named { name } => name,
        }
    }
}

/// Immutable document snapshot from the reader service.
#[derive(Debug, Clone, Deserialize)]
pub struct ReaderDocument {
    /// Stable document identifier.
    pub id: String,
    /// Document title.
    #[serde(default)]
    pub title: Option<String>,
    /// Document author.
    #[serde(default)]
    pub author: Option<String>,
    /// Canonical URL.
    #[serde(default)]
    pub source_url: Option<String>,
    /// Reader-hosted URL, used when no canonical URL exists.
    #[serde(default)]
    pub url: Option<String>,
    /// Reader-assigned category.
    #[serde(default)]
    pub category: Option<String>,
    /// Raw HTML body, present when requested.
    #[serde(default)]
    pub html_content: Option<String>,
    /// Plain-text body.
    #[serde(default)]
    pub content: Option<String>,
    /// Service-provided summary.
    #[serde(default)]
    pub summary: Option<String>,
    /// Creation timestamp, ISO-8601.
    #[serde(default)]
    pub created_at: Option<String>,
    /// Tag labels in either wire shape.
    #[serde(default)]
    pub tags: Option<Vec<TagValue>>,
}

impl ReaderDocument {
    /// Title, or a placeholder when the service omitted one.
    pub fn title_or_default(&self) -> &str {
        self.title.as_deref().filter(|t| !t.is_empty()).unwrap_or("Untitled")
    }

    /// Author, possibly empty.
    pub fn author_or_default(&self) -> &str {
        self.author.as_deref().unwrap_or("")
    }

    /// Canonical URL, preferring the source link over the reader-hosted one.
    pub fn link(&self) -> &str {
        self.source_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .or(self.url.as_deref())
            .unwrap_or("")
    }

    /// Tag names normalized into a plain string list.
    pub fn tag_names(&self) -> Vec<String> {
        self.tags
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|tag| tag.name().to_string())
            .filter(|name| !name.is_empty())
            .collect()
    }

    /// Document body as normalized plain text, preferring the HTML body over
    /// the plain content. `None` when the document carries no body at all.
    pub fn body_text(&self) -> Option<String> {
        if let Some(html) = self.html_content.as_deref() {
            let text = html_to_text(html);
            if !text.is_empty() {
                return Some(text);
            }
        }
        self.content
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    }
}

/// One page of list results.
#[derive(Debug, Deserialize)]
pub struct ListPage {
    /// Documents on this page.
    #[serde(default)]
    pub results: Vec<ReaderDocument>,
    /// Cursor for the next page, absent on the last page.
    #[serde(rename = "nextPageCursor", default)]
    pub next_page_cursor: Option<String>,
}

/// Errors surfaced by the reader client.
#[derive(Debug)]
pub enum ReaderError {
    /// The credential was rejected.
    Unauthorized,
    /// Transport-level failure that exhausted its retries.
    Transient(String),
    /// Any other non-success response; aborts the sync.
    Fatal {
        /// HTTP status code.
        status: u16,
        /// Response body or decode failure description.
        message: String,
    },
}

impl fmt::Display for ReaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "reader API rejected the credential"),
            Self::Transient(msg) => write!(f, "reader API transport error: {msg}"),
            Self::Fatal { status, message } => {
                write!(f, "reader API request failed ({status}): {message}")
            }
        }
    }
}

impl std::error::Error for ReaderError {}

/// Client for the reader service's document list endpoint.
#[derive(Clone)]
pub struct ReaderClient {
    client: Client,
    base_url: String,
    max_retries: usize,
}

impl ReaderClient {
    /// Builds a new reader client authenticated with `token`.
    pub fn new(
        token: String,
        base_url: String,
        timeout: Duration,
        max_retries: usize,
    ) -> Result<Self> {
        anyhow::ensure!(!token.trim().is_empty(), "missing reader API token");
        let mut headers = reqwest::header::HeaderMap::new();
        let auth = format!("Token {}", token.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid reader API token")?,
        );
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build reader HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries: max_retries.max(1),
        })
    }

    /// Fetches one list page with HTML content included.
    ///
    /// 429 responses are honored by sleeping for the advertised `Retry-After`
    /// and re-issuing the same cursor; they do not count against the
    /// transport retry budget.
    pub async fn list_page(
        &self,
        location: Location,
        cursor: Option<&str>,
        updated_after: Option<&str>,
    ) -> Result<ListPage, ReaderError> {
        let url = format!("{}/list/", self.base_url);
        let mut attempt = 0usize;
        loop {
            let mut request = self
                .client
                .get(&url)
                .query(&[("withHtmlContent", "true"), ("location", location.as_str())]);
            if let Some(cursor) = cursor {
                request = request.query(&[("pageCursor", cursor)]);
            }
            if let Some(updated_after) = updated_after {
                request = request.query(&[("updatedAfter", updated_after)]);
            }

            let response = match request.send().await {
                Ok(resp) => resp,
                Err(err) => {
                    if attempt + 1 < self.max_retries {
                        attempt += 1;
                        tokio::time::sleep(retry_backoff(attempt)).await;
                        continue;
                    }
                    return Err(ReaderError::Transient(err.to_string()));
                }
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                let wait = retry_after(&response).unwrap_or(DEFAULT_RETRY_AFTER);
                warn!(location = %location, wait_secs = wait.as_secs(), "reader API rate limited");
                tokio::time::sleep(wait).await;
                continue;
            }
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(ReaderError::Unauthorized);
            }
            if !status.is_success() {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "<body unavailable>".to_string());
                return Err(ReaderError::Fatal {
                    status: status.as_u16(),
                    message,
                });
            }

            let is_json = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.contains("application/json"))
                .unwrap_or(false);
            if !is_json {
                return Err(ReaderError::Fatal {
                    status: status.as_u16(),
                    message: "unexpected non-JSON response".to_string(),
                });
            }

            return response.json().await.map_err(|err| ReaderError::Fatal {
                status: status.as_u16(),
                message: format!("invalid list payload: {err}"),
            });
        }
    }

    /// Pages every location in order and returns the run-wide deduplicated
    /// document set.
    pub async fn fetch_all(
        &self,
        updated_after: Option<&str>,
    ) -> Result<Vec<ReaderDocument>, ReaderError> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut documents = Vec::new();
        for location in LOCATIONS {
            let mut cursor: Option<String> = None;
            loop {
                let page = self
                    .list_page(location, cursor.as_deref(), updated_after)
                    .await?;
                debug!(
                    location = %location,
                    results = page.results.len(),
                    has_next = page.next_page_cursor.is_some(),
                    "fetched reader page"
                );
                for document in page.results {
                    if seen.insert(document.id.clone()) {
                        documents.push(document);
                    }
                }
                match page.next_page_cursor {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
        }
        Ok(documents)
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tags_deserialize_from_both_wire_shapes() {
        let doc: ReaderDocument = serde_json::from_str(
            r#"{"id":"d1","tags":["rust",{"name":"distributed systems"},{"name":""}]}"#,
        )
        .unwrap();
        assert_eq!(doc.tag_names(), vec!["rust", "distributed systems"]);
    }

    #[test]
    fn missing_tags_normalize_to_empty() {
        let doc: ReaderDocument = serde_json::from_str(r#"{"id":"d1"}"#).unwrap();
        assert_eq!(doc.tag_names(), Vec::<String>::new());
    }

    #[test]
    fn body_prefers_html_over_plain_content() {
        let doc: ReaderDocument = serde_json::from_str(
            r#"{"id":"d1","html_content":"<p>from html</p>","content":"from plain"}"#,
        )
        .unwrap();
        assert_eq!(doc.body_text().unwrap(), "from html");
    }

    #[test]
    fn body_falls_back_to_plain_content() {
        let doc: ReaderDocument =
            serde_json::from_str(r#"{"id":"d1","content":"plain body"}"#).unwrap();
        assert_eq!(doc.body_text().unwrap(), "plain body");
        let empty: ReaderDocument = serde_json::from_str(r#"{"id":"d2"}"#).unwrap();
        assert!(empty.body_text().is_none());
    }

    #[test]
    fn link_prefers_canonical_url() {
        let doc: ReaderDocument = serde_json::from_str(
            r#"{"id":"d1","source_url":"https://origin.example/a","url":"https://reader.example/a"}"#,
        )
        .unwrap();
        assert_eq!(doc.link(), "https://origin.example/a");
    }

    #[test]
    fn list_page_reads_camel_case_cursor() {
        let page: ListPage =
            serde_json::from_str(r#"{"results":[],"nextPageCursor":"abc"}"#).unwrap();
        assert_eq!(page.next_page_cursor.as_deref(), Some("abc"));
    }
}
