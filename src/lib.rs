#![warn(missing_docs)]
//! Retrieval-augmented search backend over a personal reading-history
//! corpus: reader-service ingestion, hybrid sparse/dense vector
//! construction, and two-stage coarse-to-fine retrieval.

pub mod chunker;
pub mod embedder;
pub mod header;
pub mod keywords;
pub mod normalizer;
pub mod reader;
pub mod retriever;
pub mod rewriter;
pub mod sparse;
pub mod sync;
pub mod tokens;
pub mod vector_store;

pub use chunker::{ChunkerConfig, SemanticChunker};
pub use embedder::{Embedder, OpenAiEmbedder, DENSE_DIMENSION};
pub use header::compose_super_header;
pub use keywords::{KeywordSet, TfIdfModel};
pub use normalizer::html_to_text;
pub use reader::{ReaderClient, ReaderDocument};
pub use retriever::{render_context, Passage, RenderedContext, Retriever, RetrieverConfig};
pub use rewriter::{GeminiRewriter, PassthroughRewriter, Rewriter};
pub use sparse::SparseVector;
pub use sync::{SyncOptions, SyncPipeline, SyncReport};
pub use tokens::{strip_stops, TokenCounter};
pub use vector_store::{PineconeIndex, VectorIndex, VectorRecord};
