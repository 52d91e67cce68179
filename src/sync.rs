//! Ingestion orchestration: page the reader service, build the TF-IDF
//! corpus, then chunk, embed, and upsert every candidate document.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::chunker::{ChunkerConfig, SemanticChunker};
use crate::embedder::{EmbedError, Embedder};
use crate::header::compose_super_header;
use crate::keywords::TfIdfModel;
use crate::reader::{ReaderClient, ReaderDocument, ReaderError};
use crate::sparse::{SparseVector, DEFAULT_MAX_TERMS};
use crate::tokens::TokenCounter;
use crate::vector_store::{
    chunk_record_id, doc_id_from_record_id, header_record_id, RecordMetadata, VectorIndex,
    VectorQuery, VectorRecord, VectorStoreError,
};

/// Token length above which a chunk is defensively truncated before
/// embedding.
const CHUNK_TOKEN_GUARD: usize = 8000;
/// Character count a guarded chunk is truncated to.
const CHUNK_TRUNCATE_CHARS: usize = 6000;
/// Match count requested when enumerating existing ids.
const EXISTING_ID_PROBE_TOP_K: usize = 10_000;

/// Options accepted by the `sync` entry point.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Incremental mode: only documents updated after this ISO-8601 instant.
    pub updated_after: Option<String>,
    /// Bypass existing-id deduplication and reprocess everything.
    pub force_update: bool,
}

/// Counters describing one sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Documents returned by the reader across all locations.
    pub scanned: usize,
    /// Documents skipped because the store already holds them.
    pub skipped_existing: usize,
    /// Documents skipped for carrying no body text.
    pub empty_bodies: usize,
    /// Documents fully processed and upserted.
    pub processed: usize,
    /// Documents abandoned after a processing or upsert failure.
    pub failed: usize,
    /// Header records written.
    pub headers_upserted: usize,
    /// Chunk records written.
    pub chunks_upserted: usize,
}

impl SyncReport {
    /// Prints a run summary to stdout.
    pub fn report(&self) {
        println!("--- sync report ---");
        println!("documents scanned: {}", self.scanned);
        println!("skipped (already indexed): {}", self.skipped_existing);
        println!("skipped (no body): {}", self.empty_bodies);
        println!("processed: {}", self.processed);
        println!("failed: {}", self.failed);
        println!("headers upserted: {}", self.headers_upserted);
        println!("chunks upserted: {}", self.chunks_upserted);
    }
}

/// Errors that abandon a single document mid-sync.
#[derive(Debug)]
pub enum ProcessError {
    /// Embedding the header or a chunk failed.
    Embed(EmbedError),
    /// An upsert failed; earlier records of the document may persist.
    Store(VectorStoreError),
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed(err) => write!(f, "embedding failed: {err}"),
            Self::Store(err) => write!(f, "upsert failed: {err}"),
        }
    }
}

impl std::error::Error for ProcessError {}

/// One-shot ingestion pipeline over the reader service and a hybrid index.
pub struct SyncPipeline {
    reader: ReaderClient,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    tokens: Arc<TokenCounter>,
    chunker: SemanticChunker,
    max_terms: usize,
}

impl SyncPipeline {
    /// Assembles a pipeline from its collaborators.
    pub fn new(
        reader: ReaderClient,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        tokens: Arc<TokenCounter>,
        chunker_config: ChunkerConfig,
    ) -> Self {
        let chunker = SemanticChunker::new(chunker_config, Arc::clone(&tokens));
        Self {
            reader,
            index,
            embedder,
            tokens,
            chunker,
            max_terms: DEFAULT_MAX_TERMS,
        }
    }

    /// Runs a full sync: enumerate known ids, page the reader, and ingest
    /// every document not yet indexed. Reader failures abort the run;
    /// per-document failures are counted and skipped.
    pub async fn sync(&self, options: &SyncOptions) -> Result<SyncReport, ReaderError> {
        let existing = if options.force_update {
            HashSet::new()
        } else {
            self.existing_ids().await
        };
        info!(known = existing.len(), "starting sync");
        let documents = self.reader.fetch_all(options.updated_after.as_deref()).await?;
        Ok(self.ingest_documents(documents, &existing).await)
    }

    /// Ingests an explicit document set, deduplicating against `existing`.
    ///
    /// Phase one adds every candidate body to a fresh TF-IDF corpus and
    /// builds it once; phase two processes documents sequentially so a
    /// failure abandons only the document that caused it.
    pub async fn ingest_documents(
        &self,
        documents: Vec<ReaderDocument>,
        existing: &HashSet<String>,
    ) -> SyncReport {
        let mut report = SyncReport {
            scanned: documents.len(),
            ..Default::default()
        };

        let mut model = TfIdfModel::new();
        let mut candidates: Vec<(ReaderDocument, String)> = Vec::new();
        for document in documents {
            if existing.contains(&document.id) {
                report.skipped_existing += 1;
                continue;
            }
            match document.body_text() {
                Some(text) => {
                    model.add_document(&document.id, &text);
                    candidates.push((document, text));
                }
                None => {
                    debug!(doc_id = %document.id, "document has no body text");
                    report.empty_bodies += 1;
                }
            }
        }
        model.build();

        for (document, text) in candidates {
            match self.process_document(&document, &text, &model).await {
                Ok(chunk_count) => {
                    report.processed += 1;
                    report.headers_upserted += 1;
                    report.chunks_upserted += chunk_count;
                    info!(
                        doc_id = %document.id,
                        title = document.title_or_default(),
                        chunks = chunk_count,
                        "document indexed"
                    );
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(doc_id = %document.id, error = %err, "document abandoned");
                }
            }
        }
        report
    }

    /// Processes one document: header synthesis, semantic chunking, hybrid
    /// vector construction, and ordered upserts (header first, then chunks
    /// by ascending index). Returns the chunk count.
    async fn process_document(
        &self,
        document: &ReaderDocument,
        text: &str,
        model: &TfIdfModel,
    ) -> Result<usize, ProcessError> {
        // build() runs before phase two; a miss here is a programming error.
        let keywords = model
            .extract_keywords(&document.id, text)
            .expect("tf-idf corpus built before document processing");
        let header_text = compose_super_header(document, &keywords);

        let chunks = self
            .chunker
            .chunk(text, self.embedder.as_ref())
            .await
            .map_err(ProcessError::Embed)?;
        let chunks: Vec<String> = chunks
            .into_iter()
            .map(|chunk| self.guard_chunk(&document.id, chunk))
            .collect();

        let mut inputs = Vec::with_capacity(chunks.len() + 1);
        inputs.push(header_text.clone());
        inputs.extend(chunks.iter().cloned());
        let mut vectors = self
            .embedder
            .embed_batch(&inputs)
            .await
            .map_err(ProcessError::Embed)?;
        let header_vector = vectors.remove(0);

        let tags = document.tag_names();
        let base = RecordMetadata {
            doc_id: document.id.clone(),
            title: document.title_or_default().to_string(),
            author: document.author_or_default().to_string(),
            url: document.link().to_string(),
            category: document.category.clone().unwrap_or_default(),
            created_at: document.created_at.clone(),
            ..Default::default()
        };

        let header_sparse_text = format!("{header_text} {}", keywords.boosted_text);
        let header_record = VectorRecord {
            id: header_record_id(&document.id),
            values: header_vector,
            sparse_values: non_empty(SparseVector::from_text(&header_sparse_text, self.max_terms)),
            metadata: RecordMetadata {
                summary: document.summary.clone().filter(|s| !s.is_empty()),
                tags: (!tags.is_empty()).then_some(tags),
                header: true,
                ..base.clone()
            },
        };
        self.index
            .upsert(vec![header_record])
            .await
            .map_err(ProcessError::Store)?;

        let chunk_count = chunks.len();
        for (i, (chunk, vector)) in chunks.into_iter().zip(vectors).enumerate() {
            let record = VectorRecord {
                id: chunk_record_id(&document.id, i as u32),
                values: vector,
                sparse_values: non_empty(SparseVector::from_text(&chunk, self.max_terms)),
                metadata: RecordMetadata {
                    text: Some(chunk),
                    header: false,
                    chunk_id: Some(i as u32),
                    ..base.clone()
                },
            };
            self.index
                .upsert(vec![record])
                .await
                .map_err(ProcessError::Store)?;
        }
        Ok(chunk_count)
    }

    /// Truncates a chunk that would overflow the embedding context.
    fn guard_chunk(&self, doc_id: &str, chunk: String) -> String {
        if self.tokens.token_len(&chunk) <= CHUNK_TOKEN_GUARD {
            return chunk;
        }
        warn!(doc_id = %doc_id, "truncating oversize chunk before embedding");
        chunk.chars().take(CHUNK_TRUNCATE_CHARS).collect()
    }

    /// Best-effort enumeration of document ids already present in the index.
    /// Any failure degrades to an empty set: deduplication suffers but the
    /// sync proceeds.
    async fn existing_ids(&self) -> HashSet<String> {
        let stats = match self.index.describe_stats().await {
            Ok(stats) => stats,
            Err(err) => {
                warn!(error = %err, "could not describe index, assuming empty");
                return HashSet::new();
            }
        };
        if stats.total_vector_count == 0 {
            return HashSet::new();
        }

        let probe = VectorQuery {
            vector: vec![0.0; self.embedder.dimension()],
            sparse_vector: None,
            top_k: EXISTING_ID_PROBE_TOP_K,
            filter: None,
            include_metadata: true,
        };
        match self.index.query(probe).await {
            Ok(matches) => matches
                .into_iter()
                .map(|m| {
                    m.metadata
                        .and_then(|meta| (!meta.doc_id.is_empty()).then_some(meta.doc_id))
                        .unwrap_or_else(|| doc_id_from_record_id(&m.id).to_string())
                })
                .collect(),
            Err(err) => {
                warn!(error = %err, "existing-id probe failed, assuming empty");
                HashSet::new()
            }
        }
    }
}

fn non_empty(sparse: SparseVector) -> Option<SparseVector> {
    (!sparse.is_empty()).then_some(sparse)
}
