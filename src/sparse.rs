//! Sparse bag-of-terms vectors for hybrid search.

use std::collections::HashMap;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::tokens::strip_stops;

/// Default cap on the number of terms kept in one sparse vector.
pub const DEFAULT_MAX_TERMS: usize = 1536;

/// Parallel-array sparse vector: stable 32-bit term ids with positive
/// occurrence counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseVector {
    /// Stable term ids.
    pub indices: Vec<u32>,
    /// Occurrence counts, strictly positive, non-increasing.
    pub values: Vec<u32>,
}

impl SparseVector {
    /// Builds a sparse vector from `text`, keeping at most `max_terms` of the
    /// most frequent stop-filtered tokens.
    ///
    /// Tokens are whitespace-separated words after stop-word removal; each is
    /// hashed to a stable 32-bit id. Hash collisions at this width are
    /// accepted and left unresolved. Empty input yields empty arrays.
    pub fn from_text(text: &str, max_terms: usize) -> Self {
        let filtered = strip_stops(text);
        let mut counts: HashMap<u32, u32> = HashMap::new();
        for token in filtered.split_whitespace() {
            *counts.entry(term_id(token)).or_insert(0) += 1;
        }

        let mut pairs: Vec<(u32, u32)> = counts.into_iter().collect();
        pairs.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        pairs.truncate(max_terms);

        let mut indices = Vec::with_capacity(pairs.len());
        let mut values = Vec::with_capacity(pairs.len());
        for (id, count) in pairs {
            indices.push(id);
            values.push(count);
        }
        Self { indices, values }
    }

    /// True when no terms survived stop filtering.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Stable term id: the first four bytes, big-endian, of the MD5 digest of the
/// token's UTF-8 bytes.
pub fn term_id(token: &str) -> u32 {
    let digest = Md5::digest(token.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_input_yields_empty_arrays() {
        let v = SparseVector::from_text("", DEFAULT_MAX_TERMS);
        assert!(v.is_empty());
        assert_eq!(v.values.len(), 0);
    }

    #[test]
    fn pure_stop_word_input_yields_empty_arrays() {
        let v = SparseVector::from_text("the and of to is", DEFAULT_MAX_TERMS);
        assert!(v.is_empty());
    }

    #[test]
    fn term_ids_are_stable_across_calls() {
        assert_eq!(term_id("kubernetes"), term_id("kubernetes"));
        assert_ne!(term_id("kubernetes"), term_id("operator"));
    }

    #[test]
    fn counts_are_positive_and_non_increasing() {
        let v = SparseVector::from_text(
            "raft raft raft consensus consensus election",
            DEFAULT_MAX_TERMS,
        );
        assert_eq!(v.indices.len(), 3);
        assert!(v.values.iter().all(|&count| count > 0));
        assert!(v.values.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(v.values[0], 3);
    }

    #[test]
    fn max_terms_bounds_the_output() {
        let text: Vec<String> = (0..3000).map(|i| format!("term{i}")).collect();
        let v = SparseVector::from_text(&text.join(" "), DEFAULT_MAX_TERMS);
        assert_eq!(v.indices.len(), DEFAULT_MAX_TERMS);
        assert!(v.values.iter().all(|&count| count == 1));
    }

    #[test]
    fn repeated_token_counts_accumulate() {
        let v = SparseVector::from_text("alpha alpha beta", 1);
        assert_eq!(v.indices.len(), 1);
        assert_eq!(v.values, vec![2]);
        assert_eq!(v.indices[0], term_id("alpha"));
    }
}
