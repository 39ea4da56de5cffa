//! Semantic description similarity and embeddings.
//!
//! The engine depends only on the `SemanticService` contract; which backend
//! implements it is a deployment decision. The shipped `LexicalSemanticService`
//! is fully deterministic: token-sort similarity for comparisons and a hashed
//! bag-of-tokens projection for embeddings. It underestimates paraphrase
//! similarity compared to a model-backed service; tier thresholds are
//! unchanged, so paraphrase-only pairs land in lower tiers.
//!
//! The embedding cache is process-wide, read-mostly and grows monotonically,
//! which makes it safe under concurrent readers.

use crate::fuzzy;
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub const EMBEDDING_DIM: usize = 384;

/// Short-circuit threshold: a token-sort score this high needs no model call.
const LEXICAL_SHORT_CIRCUIT: f64 = 0.85;

pub trait SemanticService: Send + Sync {
    /// Conceptual similarity of two descriptions in [0,1].
    fn similarity(&self, a: &str, b: &str) -> f64;

    /// Fixed-dimension embedding of a text.
    fn embed(&self, text: &str) -> Vec<f64>;
}

/// Deterministic lexical implementation.
pub struct LexicalSemanticService {
    cache: RwLock<HashMap<String, Arc<Vec<f64>>>>,
}

impl Default for LexicalSemanticService {
    fn default() -> Self {
        Self::new()
    }
}

impl LexicalSemanticService {
    pub fn new() -> Self {
        Self { cache: RwLock::new(HashMap::new()) }
    }

    pub fn cache_size(&self) -> usize {
        self.cache.read().len()
    }

    fn compute_embedding(text: &str) -> Vec<f64> {
        let mut vector = vec![0.0f64; EMBEDDING_DIM];
        for token in text.to_lowercase().split_whitespace() {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let h = hasher.finish();
            let slot = (h as usize) % EMBEDDING_DIM;
            // Signed hashing keeps the expectation of random collisions at 0.
            let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl SemanticService for LexicalSemanticService {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        if a.to_lowercase() == b.to_lowercase() {
            return 1.0;
        }
        let token_sort = fuzzy::token_sort_ratio(&a.to_lowercase(), &b.to_lowercase()) / 100.0;
        if token_sort >= LEXICAL_SHORT_CIRCUIT {
            return token_sort;
        }
        // No model behind this implementation: weaker pairs score by the
        // better of token overlap and embedding-space similarity.
        let embedded = cosine_similarity(&self.embed(a), &self.embed(b)).max(0.0);
        token_sort.max(embedded * 0.8)
    }

    fn embed(&self, text: &str) -> Vec<f64> {
        let key = text.to_lowercase();
        if let Some(cached) = self.cache.read().get(&key) {
            return cached.as_ref().clone();
        }
        let vector = Arc::new(Self::compute_embedding(text));
        self.cache.write().entry(key).or_insert_with(|| vector.clone());
        vector.as_ref().clone()
    }
}

/// Cosine similarity of two vectors; 0.0 on dimension mismatch or zero norm.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_is_one() {
        let svc = LexicalSemanticService::new();
        assert_eq!(svc.similarity("Pembelian Semen", "pembelian semen"), 1.0);
    }

    #[test]
    fn empty_input_is_zero() {
        let svc = LexicalSemanticService::new();
        assert_eq!(svc.similarity("", "anything"), 0.0);
    }

    #[test]
    fn token_sort_short_circuits_reordered_text() {
        let svc = LexicalSemanticService::new();
        let score = svc.similarity("semen 50 sak pembelian", "pembelian semen 50 sak");
        assert!(score >= 0.85, "got {score}");
    }

    #[test]
    fn embedding_is_deterministic_and_cached() {
        let svc = LexicalSemanticService::new();
        let a = svc.embed("TRF PT SEMEN INDONESIA");
        let b = svc.embed("TRF PT SEMEN INDONESIA");
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIM);
        assert_eq!(svc.cache_size(), 1);
    }

    #[test]
    fn cosine_of_identical_embeddings_is_one() {
        let svc = LexicalSemanticService::new();
        let v = svc.embed("pembelian batu split");
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_handles_dimension_mismatch() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
    }

    #[test]
    fn shared_tokens_raise_embedding_similarity() {
        let svc = LexicalSemanticService::new();
        let a = svc.embed("pembayaran semen gresik proyek");
        let b = svc.embed("pembayaran semen gresik");
        let c = svc.embed("sewa excavator bulanan");
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }
}
