//! Embedding provider contract and a deterministic mock.

use async_trait::async_trait;

use crate::types::RagError;

/// Batched text embedding with a fixed output dimension.
///
/// Implementations wrap a vendor API (or a local model) and must return one
/// vector per input text, each of exactly [`dimensions`](Self::dimensions)
/// components, for the lifetime of an index.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Output vector dimension; constant for the provider's lifetime.
    fn dimensions(&self) -> usize;

    /// Embed a batch of texts, one vector per text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError>;
}

/// Deterministic hash-based embeddings for tests and offline demos.
///
/// Texts that share word content produce nearby vectors, which is enough to
/// make similarity search meaningful in fixtures.
#[derive(Debug, Clone)]
pub struct MockEmbeddingProvider {
    dimensions: usize,
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        Self { dimensions: 32 }
    }
}

impl MockEmbeddingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for word in text.split_whitespace() {
            let mut hash = 0xcbf2_9ce4_8422_2325u64;
            for byte in word.to_lowercase().bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
            let slot = (hash % self.dimensions as u64) as usize;
            vector[slot] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_embeddings_are_deterministic_and_sized() {
        let provider = MockEmbeddingProvider::new(16);
        let texts = vec!["alpha beta".to_string(), "gamma".to_string()];
        let first = provider.embed(&texts).await.unwrap();
        let second = provider.embed(&texts).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|v| v.len() == provider.dimensions()));
    }

    #[tokio::test]
    async fn similar_texts_score_higher_than_unrelated() {
        let provider = MockEmbeddingProvider::new(32);
        let texts = vec![
            "rust async runtime".to_string(),
            "rust async executor runtime".to_string(),
            "gardening tips for spring".to_string(),
        ];
        let vectors = provider.embed(&texts).await.unwrap();

        let dot = |a: &[f32], b: &[f32]| -> f32 { a.iter().zip(b).map(|(x, y)| x * y).sum() };
        assert!(dot(&vectors[0], &vectors[1]) > dot(&vectors[0], &vectors[2]));
    }
}
