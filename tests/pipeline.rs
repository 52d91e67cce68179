//! End-to-end ingestion and retrieval against in-memory collaborators.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;

use noteseek::embedder::{EmbedError, Embedder};
use noteseek::reader::{ReaderClient, ReaderDocument};
use noteseek::sparse::SparseVector;
use noteseek::vector_store::{
    IndexStats, RecordMetadata, VectorIndex, VectorMatch, VectorQuery, VectorRecord,
    VectorStoreError,
};
use noteseek::{
    render_context, ChunkerConfig, PassthroughRewriter, Retriever, RetrieverConfig, SyncPipeline,
    TokenCounter,
};

const DIM: usize = 64;

/// Deterministic bag-of-words embedder: lowercased tokens hashed into a
/// fixed number of buckets, L2-normalized.
struct BagEmbedder;

fn bag_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIM];
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let mut h = 0usize;
        for b in token.bytes() {
            h = h.wrapping_mul(31).wrapping_add(b as usize);
        }
        v[h % DIM] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

#[async_trait]
impl Embedder for BagEmbedder {
    fn dimension(&self) -> usize {
        DIM
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        Ok(bag_vector(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|t| bag_vector(t)).collect())
    }
}

/// In-memory hybrid index scoring by dense-plus-sparse dot product.
#[derive(Default)]
struct MemoryIndex {
    records: Mutex<HashMap<String, VectorRecord>>,
    upsert_calls: Mutex<usize>,
}

impl MemoryIndex {
    fn snapshot(&self) -> Vec<VectorRecord> {
        self.records.lock().unwrap().values().cloned().collect()
    }
}

fn sparse_dot(query: &Option<SparseVector>, record: &Option<SparseVector>) -> f32 {
    let (Some(query), Some(record)) = (query, record) else {
        return 0.0;
    };
    let stored: HashMap<u32, u32> = record
        .indices
        .iter()
        .copied()
        .zip(record.values.iter().copied())
        .collect();
    query
        .indices
        .iter()
        .zip(&query.values)
        .map(|(idx, value)| stored.get(idx).copied().unwrap_or(0) as f32 * *value as f32)
        .sum()
}

fn matches_filter(meta: &RecordMetadata, filter: &Option<serde_json::Value>) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    if let Some(wanted) = filter
        .get("header")
        .and_then(|v| v.get("$eq"))
        .and_then(|v| v.as_bool())
    {
        if meta.header != wanted {
            return false;
        }
    }
    if let Some(ids) = filter
        .get("doc_id")
        .and_then(|v| v.get("$in"))
        .and_then(|v| v.as_array())
    {
        if !ids
            .iter()
            .filter_map(|v| v.as_str())
            .any(|id| id == meta.doc_id)
        {
            return false;
        }
    }
    true
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn describe_stats(&self) -> Result<IndexStats, VectorStoreError> {
        Ok(IndexStats {
            total_vector_count: self.records.lock().unwrap().len() as u64,
            dimension: DIM,
        })
    }

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), VectorStoreError> {
        *self.upsert_calls.lock().unwrap() += 1;
        let mut stored = self.records.lock().unwrap();
        for record in records {
            stored.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn query(&self, query: VectorQuery) -> Result<Vec<VectorMatch>, VectorStoreError> {
        let stored = self.records.lock().unwrap();
        let mut scored: Vec<VectorMatch> = stored
            .values()
            .filter(|record| matches_filter(&record.metadata, &query.filter))
            .map(|record| {
                let dense: f32 = query
                    .vector
                    .iter()
                    .zip(&record.values)
                    .map(|(a, b)| a * b)
                    .sum();
                VectorMatch {
                    id: record.id.clone(),
                    score: dense + sparse_dot(&query.sparse_vector, &record.sparse_values),
                    metadata: Some(record.metadata.clone()),
                }
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        scored.truncate(query.top_k);
        Ok(scored)
    }
}

fn document(json: &str) -> ReaderDocument {
    serde_json::from_str(json).unwrap()
}

fn operators_doc() -> ReaderDocument {
    document(
        r#"{
            "id": "doc-operators",
            "title": "Kubernetes Operators",
            "author": "A. Writer",
            "source_url": "https://example.com/operators",
            "category": "article",
            "summary": "Operators and the controller pattern.",
            "tags": ["kubernetes", {"name": "infrastructure"}],
            "created_at": "2024-03-01T09:00:00Z",
            "html_content": "<p>The operator pattern lets kubernetes controllers reconcile cluster state. The operator pattern packages operational knowledge.</p><p>Controllers watch custom resources and react when the observed state drifts from the declared state.</p><p>Writing an operator means encoding runbooks as reconciliation loops.</p>"
        }"#,
    )
}

fn cooking_doc() -> ReaderDocument {
    document(
        r#"{
            "id": "doc-sourdough",
            "title": "Sourdough Basics",
            "author": "B. Baker",
            "source_url": "https://example.com/sourdough",
            "category": "article",
            "html_content": "<p>Feeding a starter daily keeps the culture active and ready for baking.</p><p>Long cold fermentation develops flavor in the finished loaf.</p>"
        }"#,
    )
}

fn pipeline(index: Arc<MemoryIndex>) -> SyncPipeline {
    let reader = ReaderClient::new(
        "test-token".to_string(),
        "http://localhost:9".to_string(),
        Duration::from_secs(5),
        1,
    )
    .unwrap();
    SyncPipeline::new(
        reader,
        index,
        Arc::new(BagEmbedder),
        Arc::new(TokenCounter::new()),
        ChunkerConfig::default(),
    )
}

#[tokio::test]
async fn ingest_then_retrieve_with_citations() {
    let index = Arc::new(MemoryIndex::default());
    let report = pipeline(Arc::clone(&index))
        .ingest_documents(vec![operators_doc(), cooking_doc()], &HashSet::new())
        .await;

    assert_eq!(report.scanned, 2);
    assert_eq!(report.processed, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(report.headers_upserted, 2);
    assert!(report.chunks_upserted >= 2);

    // Every chunk has a header with the same doc_id, and chunk indices form
    // a contiguous zero-based sequence per document.
    let records = index.snapshot();
    let headers: HashSet<&str> = records
        .iter()
        .filter(|r| r.metadata.header)
        .map(|r| r.metadata.doc_id.as_str())
        .collect();
    let mut chunk_ids: HashMap<&str, Vec<u32>> = HashMap::new();
    for record in records.iter().filter(|r| !r.metadata.header) {
        assert!(headers.contains(record.metadata.doc_id.as_str()));
        assert!(record.metadata.text.is_some());
        chunk_ids
            .entry(record.metadata.doc_id.as_str())
            .or_default()
            .push(record.metadata.chunk_id.unwrap());
    }
    for (_, mut ids) in chunk_ids {
        ids.sort_unstable();
        let expected: Vec<u32> = (0..ids.len() as u32).collect();
        assert_eq!(ids, expected);
    }

    let retriever = Retriever::new(
        index,
        Arc::new(BagEmbedder),
        Arc::new(PassthroughRewriter),
        RetrieverConfig {
            top_k: 3,
            min_score: 1.0,
            header_top_k: 8,
            header_min_score: 1.0,
            max_terms: 1536,
        },
    );
    let results = retriever
        .search("operator pattern kubernetes")
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert!(results.len() <= 3);
    assert!(results.iter().all(|p| p.doc_id == "doc-operators"));
    assert!(results.iter().all(|p| p.score >= 1.0));

    let rendered = render_context(&results);
    assert!(rendered.has_sources);
    assert!(rendered.text.contains("Document Title: Kubernetes Operators"));
    assert!(rendered.text.contains("In-Text Citation: [Kubernetes O...]"));
    assert!(rendered
        .text
        .contains("Document URL: https://example.com/operators"));
    assert!(rendered.text.contains("## Sources\n- Kubernetes Operators"));
    assert!(!rendered.text.contains("Sourdough"));
}

#[tokio::test]
async fn reingesting_known_documents_is_a_no_op() {
    let index = Arc::new(MemoryIndex::default());
    let pipeline = pipeline(Arc::clone(&index));
    pipeline
        .ingest_documents(vec![operators_doc(), cooking_doc()], &HashSet::new())
        .await;
    let upserts_after_first = *index.upsert_calls.lock().unwrap();

    let known: HashSet<String> = index
        .snapshot()
        .iter()
        .map(|r| r.metadata.doc_id.clone())
        .collect();
    let report = pipeline
        .ingest_documents(vec![operators_doc(), cooking_doc()], &known)
        .await;

    assert_eq!(report.skipped_existing, 2);
    assert_eq!(report.processed, 0);
    assert_eq!(*index.upsert_calls.lock().unwrap(), upserts_after_first);
}

#[tokio::test]
async fn unrelated_query_returns_no_sources() {
    let index = Arc::new(MemoryIndex::default());
    pipeline(Arc::clone(&index))
        .ingest_documents(vec![operators_doc()], &HashSet::new())
        .await;

    let retriever = Retriever::new(
        index,
        Arc::new(BagEmbedder),
        Arc::new(PassthroughRewriter),
        RetrieverConfig {
            top_k: 3,
            min_score: 1.0,
            header_top_k: 8,
            header_min_score: 1.0,
            max_terms: 1536,
        },
    );
    let results = retriever.search("medieval falconry techniques").await.unwrap();
    assert!(results.is_empty());
    assert!(!render_context(&results).has_sources);
}
