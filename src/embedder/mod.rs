//! Dense embedding capability shared by the pipeline and the retriever.

use std::fmt;

use async_trait::async_trait;

pub mod openai;

pub use openai::OpenAiEmbedder;

/// Hard context limit, in tokens, for a single embedding input.
pub const EMBED_CONTEXT_LIMIT: usize = 8192;
/// Headroom subtracted from the context limit when packing batches.
pub const BATCH_HEADROOM: usize = 32;
/// Configured dense vector dimension.
pub const DENSE_DIMENSION: usize = 1536;

/// Errors surfaced by embedding clients.
#[derive(Debug)]
pub enum EmbedError {
    /// The service rejected the input for exceeding its context window.
    /// Consumed internally by recursive bisection; callers of `embed` and
    /// `embed_batch` never observe it.
    ContextOverflow(String),
    /// Any other non-success response from the service.
    Api {
        /// HTTP status code returned by the service.
        status: u16,
        /// Response body, verbatim.
        message: String,
    },
    /// Transport-level failure.
    Http(reqwest::Error),
}

impl fmt::Display for EmbedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContextOverflow(msg) => write!(f, "embedding context overflow: {msg}"),
            Self::Api { status, message } => {
                write!(f, "embedding request failed ({status}): {message}")
            }
            Self::Http(err) => write!(f, "embedding http error: {err}"),
        }
    }
}

impl std::error::Error for EmbedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Http(err) => Some(err),
            _ => None,
        }
    }
}

/// Capability trait over dense embedding vendors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Output dimension; shorter native vectors are zero-padded to this.
    fn dimension(&self) -> usize;

    /// Embeds one text, recursively bisecting on context-limit faults.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    /// Embeds many texts, batching under the context budget and falling back
    /// to per-item recursion for oversize inputs. Output order matches input
    /// order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Zero-pads `vector` on the right to `dim` components.
pub(crate) fn pad_to(mut vector: Vec<f32>, dim: usize) -> Vec<f32> {
    if vector.len() < dim {
        vector.resize(dim, 0.0);
    }
    vector
}

/// Component-wise average of two equal-length vectors.
pub(crate) fn average(a: &[f32], b: &[f32]) -> Vec<f32> {
    a.iter().zip(b).map(|(x, y)| (x + y) / 2.0).collect()
}
