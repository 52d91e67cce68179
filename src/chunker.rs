//! Embedding-guided semantic chunking of normalized document text.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::embedder::{EmbedError, Embedder, EMBED_CONTEXT_LIMIT};
use crate::tokens::TokenCounter;

/// Chunker tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    /// Lower bound before a flush decision is even considered.
    pub min_tokens: usize,
    /// Upper bound on a chunk's token length.
    pub max_tokens: usize,
    /// Paragraph count per similarity window.
    pub window_size: usize,
    /// Cosine similarity below which adjacent windows are split apart.
    pub threshold: f32,
    /// Largest single piece fed to the embedding service.
    pub single_limit: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_tokens: 300,
            max_tokens: 800,
            window_size: 1,
            threshold: 0.75,
            single_limit: EMBED_CONTEXT_LIMIT - 1000,
        }
    }
}

/// Splits normalized text into token-bounded fragments, joining or breaking
/// neighbors by cosine similarity over sliding paragraph windows.
///
/// A sentence with no internal split point may exceed `max_tokens` and is
/// emitted intact; downstream embedding guards against such outliers.
pub struct SemanticChunker {
    config: ChunkerConfig,
    tokens: Arc<TokenCounter>,
}

impl SemanticChunker {
    /// Creates a chunker with the provided configuration.
    pub fn new(config: ChunkerConfig, tokens: Arc<TokenCounter>) -> Self {
        Self { config, tokens }
    }

    /// Chunks `text`, embedding each unique similarity window exactly once.
    pub async fn chunk(
        &self,
        text: &str,
        embedder: &dyn Embedder,
    ) -> Result<Vec<String>, EmbedError> {
        let merged = self.merge_paragraphs(text);
        if merged.is_empty() {
            return Ok(Vec::new());
        }
        let pairs = self.window_pairs(&merged);
        let embeddings = self.embed_windows(&pairs, embedder).await?;
        Ok(self.walk(&merged, &pairs, &embeddings))
    }

    /// First pass: sentence-splits paragraphs that alone exceed the single
    /// embedding limit, then greedily merges consecutive pieces while the
    /// merged length stays within `min(max_tokens, single_limit)`.
    fn merge_paragraphs(&self, text: &str) -> Vec<String> {
        let cap = self.config.max_tokens.min(self.config.single_limit);
        let mut queue: Vec<String> = Vec::new();
        for paragraph in text.split("\n\n") {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }
            if self.tokens.token_len(paragraph) > self.config.single_limit {
                queue.extend(self.group_sentences(paragraph, self.config.single_limit));
            } else {
                queue.push(paragraph.to_string());
            }
        }

        // The separator costs tokens too, so the budget is checked against
        // the real joined text rather than a sum of piece lengths.
        let mut merged: Vec<String> = Vec::new();
        for piece in queue {
            if let Some(last) = merged.last_mut() {
                let candidate = format!("{last}\n\n{piece}");
                if self.tokens.token_len(&candidate) <= cap {
                    *last = candidate;
                    continue;
                }
            }
            merged.push(piece);
        }
        merged
    }

    /// Second pass: the sliding window pair at every adjacent boundary,
    /// skipping boundaries where either window exceeds `max_tokens`.
    fn window_pairs(&self, merged: &[String]) -> HashMap<usize, (String, String)> {
        let w = self.config.window_size.max(1);
        let mut pairs = HashMap::new();
        for i in 0..merged.len().saturating_sub(1) {
            let start = (i + 1).saturating_sub(w);
            let current = merged[start..=i].join("\n\n");
            let end = (i + 1 + w).min(merged.len());
            let next = merged[i + 1..end].join("\n\n");
            if self.tokens.token_len(&current) > self.config.max_tokens
                || self.tokens.token_len(&next) > self.config.max_tokens
            {
                continue;
            }
            pairs.insert(i, (current, next));
        }
        pairs
    }

    async fn embed_windows(
        &self,
        pairs: &HashMap<usize, (String, String)>,
        embedder: &dyn Embedder,
    ) -> Result<HashMap<String, Vec<f32>>, EmbedError> {
        let mut unique: Vec<String> = Vec::new();
        let mut seen: HashMap<&str, ()> = HashMap::new();
        for (current, next) in pairs.values() {
            for window in [current, next] {
                if seen.insert(window.as_str(), ()).is_none() {
                    unique.push(window.clone());
                }
            }
        }
        drop(seen);
        if unique.is_empty() {
            return Ok(HashMap::new());
        }
        debug!(windows = unique.len(), "embedding similarity windows");
        let vectors = embedder.embed_batch(&unique).await?;
        Ok(unique.into_iter().zip(vectors).collect())
    }

    /// Third pass: accumulate merged paragraphs into chunks, flushing on
    /// token-budget overruns and on similarity drops at window boundaries.
    ///
    /// Every budget comparison measures the real joined buffer text, so a
    /// flushed chunk never exceeds `max_tokens` unless it is a lone
    /// unsplittable sentence from the sentence-split path.
    fn walk(
        &self,
        merged: &[String],
        pairs: &HashMap<usize, (String, String)>,
        embeddings: &HashMap<String, Vec<f32>>,
    ) -> Vec<String> {
        let mut chunks: Vec<String> = Vec::new();
        let mut buffer: Vec<&str> = Vec::new();

        for (i, paragraph) in merged.iter().enumerate() {
            if self.tokens.token_len(paragraph) > self.config.max_tokens {
                flush(&mut chunks, &mut buffer);
                chunks.extend(self.group_sentences(paragraph, self.config.max_tokens));
                continue;
            }

            buffer.push(paragraph.as_str());
            let mut joined = buffer.join("\n\n");
            if buffer.len() > 1 && self.tokens.token_len(&joined) > self.config.max_tokens {
                // Appending this paragraph pushed the buffer over the limit:
                // emit what preceded it and start over from the paragraph,
                // which fits on its own.
                buffer.pop();
                flush(&mut chunks, &mut buffer);
                buffer.push(paragraph.as_str());
                joined = paragraph.clone();
            }
            let running = self.tokens.token_len(&joined);

            let is_last = i + 1 == merged.len();
            if running < self.config.min_tokens && !is_last {
                continue;
            }

            if let Some((current, next)) = pairs.get(&i) {
                let with_next = format!("{joined}\n\n{next}");
                if self.tokens.token_len(&with_next) > self.config.max_tokens {
                    flush(&mut chunks, &mut buffer);
                    continue;
                }
                let similarity = match (embeddings.get(current), embeddings.get(next)) {
                    (Some(a), Some(b)) => cosine_similarity(a, b),
                    _ => 1.0,
                };
                if similarity < self.config.threshold {
                    flush(&mut chunks, &mut buffer);
                }
            }
        }
        flush(&mut chunks, &mut buffer);
        chunks
    }

    /// Groups a paragraph's sentences into pieces of at most `cap` tokens; a
    /// single sentence beyond the cap is emitted intact.
    fn group_sentences(&self, text: &str, cap: usize) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut current_len = 0usize;
        for sentence in split_sentences(text) {
            let sentence_len = self.tokens.token_len(&sentence);
            if current_len + sentence_len > cap && !current.is_empty() {
                out.push(std::mem::take(&mut current));
                current_len = 0;
            }
            if sentence_len > cap {
                out.push(sentence);
                continue;
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&sentence);
            current_len += sentence_len;
        }
        if !current.is_empty() {
            out.push(current);
        }
        out
    }
}

fn flush(chunks: &mut Vec<String>, buffer: &mut Vec<&str>) {
    if buffer.is_empty() {
        return;
    }
    chunks.push(buffer.join("\n\n"));
    buffer.clear();
}

/// Splits text into sentences at `.`/`!`/`?` runs followed by whitespace.
pub(crate) fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut prev_terminator = false;
    for (idx, ch) in text.char_indices() {
        if prev_terminator && ch.is_whitespace() {
            let sentence = text[start..idx].trim();
            if !sentence.is_empty() {
                out.push(sentence.to_string());
            }
            start = idx;
        }
        prev_terminator = matches!(ch, '.' | '!' | '?');
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail.to_string());
    }
    out
}

/// Cosine similarity of two dense vectors; zero vectors compare as zero.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    /// Deterministic embedder: fixed vectors per window text, with a shared
    /// fallback so unknown texts compare as identical.
    struct StubEmbedder {
        vectors: HashMap<String, Vec<f32>>,
    }

    impl StubEmbedder {
        fn new(entries: &[(&str, [f32; 4])]) -> Self {
            let vectors = entries
                .iter()
                .map(|(text, v)| (text.to_string(), v.to_vec()))
                .collect();
            Self { vectors }
        }

        fn vector_for(&self, text: &str) -> Vec<f32> {
            self.vectors
                .get(text)
                .cloned()
                .unwrap_or_else(|| vec![1.0, 0.0, 0.0, 0.0])
        }
    }

    #[async_trait]
    impl Embedder for StubEmbedder {
        fn dimension(&self) -> usize {
            4
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
            Ok(self.vector_for(text))
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            Ok(texts.iter().map(|t| self.vector_for(t)).collect())
        }
    }

    fn chunker(config: ChunkerConfig) -> SemanticChunker {
        SemanticChunker::new(config, Arc::new(TokenCounter::new()))
    }

    #[test]
    fn sentences_split_on_terminators() {
        let sentences = split_sentences("One thing. Another thing! A question? Tail");
        assert_eq!(sentences, vec!["One thing.", "Another thing!", "A question?", "Tail"]);
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let sim = cosine_similarity(&[1.0, 2.0], &[1.0, 2.0]);
        assert!((sim - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn empty_text_yields_no_chunks() {
        let chunker = chunker(ChunkerConfig::default());
        let embedder = StubEmbedder::new(&[]);
        let chunks = chunker.chunk("", &embedder).await.unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn similar_neighbors_stay_in_one_chunk() {
        // single_limit below max_tokens keeps first-pass merging small enough
        // that the similarity decision is what joins the paragraphs.
        let config = ChunkerConfig {
            min_tokens: 2,
            max_tokens: 200,
            window_size: 1,
            threshold: 0.75,
            single_limit: 10,
        };
        let a = "Cats are wonderful companions at home.";
        let b = "Dogs are loyal companions at home.";
        let text = format!("{a}\n\n{b}");
        let embedder = StubEmbedder::new(&[(a, [1.0, 0.0, 0.0, 0.0]), (b, [1.0, 0.1, 0.0, 0.0])]);
        let chunks = chunker(config).chunk(&text, &embedder).await.unwrap();
        assert_eq!(chunks, vec![text.clone()]);
    }

    #[tokio::test]
    async fn dissimilar_neighbors_split_apart() {
        let config = ChunkerConfig {
            min_tokens: 2,
            max_tokens: 200,
            window_size: 1,
            threshold: 0.75,
            single_limit: 10,
        };
        let a = "Cats are wonderful companions at home.";
        let b = "Quarterly revenue grew by seven percent.";
        let text = format!("{a}\n\n{b}");
        let embedder = StubEmbedder::new(&[(a, [1.0, 0.0, 0.0, 0.0]), (b, [0.0, 1.0, 0.0, 0.0])]);
        let chunks = chunker(config).chunk(&text, &embedder).await.unwrap();
        assert_eq!(chunks, vec![a.to_string(), b.to_string()]);
    }

    #[tokio::test]
    async fn buffer_below_min_keeps_accumulating() {
        let config = ChunkerConfig {
            min_tokens: 10_000,
            max_tokens: 20_000,
            window_size: 1,
            threshold: 0.99,
            single_limit: 10,
        };
        let text = "First idea here.\n\nSecond idea here.\n\nThird idea here.";
        let embedder = StubEmbedder::new(&[]);
        let chunks = chunker(config).chunk(text, &embedder).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].matches("\n\n").count(), 2);
    }

    #[tokio::test]
    async fn oversize_paragraph_is_sentence_split_within_bounds() {
        let tokens = Arc::new(TokenCounter::new());
        let config = ChunkerConfig {
            min_tokens: 5,
            max_tokens: 30,
            window_size: 1,
            threshold: 0.75,
            single_limit: 7000,
        };
        let mut paragraph = String::new();
        for i in 0..40 {
            paragraph.push_str(&format!("Sentence {i} covers a distinct small topic. "));
        }
        let paragraph = paragraph.trim().to_string();
        let embedder = StubEmbedder::new(&[]);
        let chunker = SemanticChunker::new(config, Arc::clone(&tokens));
        let chunks = chunker.chunk(&paragraph, &embedder).await.unwrap();
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(!chunk.is_empty());
            let within = tokens.token_len(chunk) <= config.max_tokens;
            let single_sentence = split_sentences(chunk).len() == 1;
            assert!(within || single_sentence);
        }
        // Sentence-split boundaries aside, every word survives in order.
        let original: Vec<&str> = paragraph.split_whitespace().collect();
        let rebuilt: String = chunks.join(" ");
        let rebuilt: Vec<&str> = rebuilt.split_whitespace().collect();
        assert_eq!(original, rebuilt);
    }

    #[tokio::test]
    async fn oversize_single_sentence_is_emitted_intact() {
        let tokens = Arc::new(TokenCounter::new());
        let config = ChunkerConfig {
            min_tokens: 2,
            max_tokens: 10,
            window_size: 1,
            threshold: 0.75,
            single_limit: 7000,
        };
        let sentence = "word ".repeat(60).trim().to_string();
        let embedder = StubEmbedder::new(&[]);
        let chunker = SemanticChunker::new(config, Arc::clone(&tokens));
        let chunks = chunker.chunk(&sentence, &embedder).await.unwrap();
        assert_eq!(chunks, vec![sentence.clone()]);
        assert!(tokens.token_len(&chunks[0]) > config.max_tokens);
    }

    #[tokio::test]
    async fn crossing_max_with_next_window_flushes_unconditionally() {
        let config = ChunkerConfig {
            min_tokens: 2,
            max_tokens: 20,
            window_size: 1,
            threshold: 0.1,
            single_limit: 16,
        };
        // Each paragraph fits alone but any two exceed max_tokens, so even a
        // perfect similarity cannot join them.
        let a = "Alpha paragraph describes the first recorded topic in considerable depth and detail.";
        let b = "Beta paragraph describes the second recorded topic in considerable depth and detail.";
        let text = format!("{a}\n\n{b}");
        let embedder = StubEmbedder::new(&[]);
        let chunks = chunker(config).chunk(&text, &embedder).await.unwrap();
        assert_eq!(chunks, vec![a.to_string(), b.to_string()]);
    }

    #[tokio::test]
    async fn merged_chunks_measure_within_max_tokens() {
        // Many short paragraphs merged through the walk: the separators
        // folded into each chunk cost tokens, so the bound must hold on the
        // joined text exactly as the counter reports it.
        let tokens = Arc::new(TokenCounter::new());
        let config = ChunkerConfig {
            min_tokens: 2,
            max_tokens: 50,
            window_size: 1,
            threshold: 0.5,
            single_limit: 10,
        };
        let paragraphs: Vec<String> = (0..20)
            .map(|i| format!("Point {i} stands alone without punctuation"))
            .collect();
        let text = paragraphs.join("\n\n");
        let embedder = StubEmbedder::new(&[]);
        let chunker = SemanticChunker::new(config, Arc::clone(&tokens));
        let chunks = chunker.chunk(&text, &embedder).await.unwrap();

        assert!(chunks.len() > 1);
        assert!(chunks.iter().any(|chunk| chunk.contains("\n\n")));
        for chunk in &chunks {
            assert!(
                tokens.token_len(chunk) <= config.max_tokens,
                "chunk exceeds max_tokens"
            );
        }
        assert_eq!(chunks.join("\n\n"), text);
    }
}
