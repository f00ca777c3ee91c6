// src/index/embedder.rs

use crate::error::Result;
use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;

/// Pluggable text embedder. The gateway only ever compares vectors it
/// produced against each other, so dimension and model id travel with the
/// persisted index and gate reuse.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimensions(&self) -> usize;

    /// Identifier stored in the index metadata; vectors from a different
    /// model are never mixed.
    fn model_id(&self) -> &str;
}

pub const DEFAULT_DIMENSIONS: usize = 256;

/// The default offline embedder: a deterministic hashed bag of tokens and
/// character trigrams, L2-normalized. No model download, no network, and
/// bitwise-reproducible across runs, which is what makes the persisted
/// index cache verifiable in tests.
pub struct LexicalEmbedder {
    dimensions: usize,
}

impl Default for LexicalEmbedder {
    fn default() -> Self {
        LexicalEmbedder {
            dimensions: DEFAULT_DIMENSIONS,
        }
    }
}

impl LexicalEmbedder {
    pub fn new(dimensions: usize) -> Self {
        LexicalEmbedder {
            dimensions: dimensions.max(16),
        }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions];
        for token in tokenize(text) {
            bump(&mut vector, &token, 1.0);
            // Trigrams blur morphology: "repositories" still lands near
            // "repository".
            let chars: Vec<char> = token.chars().collect();
            if chars.len() > 3 {
                for window in chars.windows(3) {
                    let gram: String = window.iter().collect();
                    bump(&mut vector, &gram, 0.5);
                }
            }
        }
        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for LexicalEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        "lexical-trigram-v1"
    }
}

pub fn tokenize(text: &str) -> Vec<String> {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    let token = TOKEN.get_or_init(|| Regex::new(r"[a-z0-9]+").expect("static pattern"));
    token
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

fn bump(vector: &mut [f32], term: &str, weight: f32) {
    let bucket = (fnv1a(term.as_bytes()) as usize) % vector.len();
    vector[bucket] += weight;
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Cosine similarity for unit vectors: the plain dot product.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_embedding_is_deterministic() {
        let embedder = LexicalEmbedder::default();
        let a = embedder.embed("echo a string back").await.unwrap();
        let b = embedder.embed("echo a string back").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), DEFAULT_DIMENSIONS);
    }

    #[tokio::test]
    async fn test_vectors_are_normalized() {
        let embedder = LexicalEmbedder::default();
        let v = embedder.embed("list github repositories").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_related_text_scores_higher_than_unrelated() {
        let embedder = LexicalEmbedder::default();
        let doc = embedder.embed("echo repeat a string back").await.unwrap();
        let near = embedder.embed("repeat some text").await.unwrap();
        let far = embedder.embed("delete kubernetes cluster").await.unwrap();
        assert!(cosine(&doc, &near) > cosine(&doc, &far));
    }

    #[tokio::test]
    async fn test_empty_text_embeds_to_zero_vector() {
        let embedder = LexicalEmbedder::default();
        let v = embedder.embed("").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_tokenize_lowercases_and_splits() {
        assert_eq!(
            tokenize("List_GitHub repos-2!"),
            vec!["list", "github", "repos", "2"]
        );
    }
}
