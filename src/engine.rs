//! Hybrid query engine: vector similarity, graph traversal, or both.

use std::collections::HashMap;
use std::sync::Arc;

use unicode_segmentation::UnicodeSegmentation;

use crate::config::RagConfig;
use crate::providers::completion::{CompletionProvider, DeltaStream};
use crate::providers::embeddings::EmbeddingProvider;
use crate::stores::graph::GraphBackend;
use crate::stores::{ChunkRecord, VectorBackend};
use crate::types::RagError;

/// Retrieval mode for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Vector,
    Graph,
    Hybrid,
}

/// A grounded answer with the chunk ids that backed it.
#[derive(Debug, Clone)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<String>,
    pub mode: QueryMode,
}

/// A streaming answer: deltas plus the sources known up front.
pub struct AnswerStream {
    pub deltas: DeltaStream,
    pub sources: Vec<String>,
    pub mode: QueryMode,
}

/// Instruction passed to the completion provider when neither retrieval mode
/// found anything; the caller still gets an answer, not an error.
pub const NO_CONTEXT_MARKER: &str = "No relevant context was retrieved for this question. \
Say so explicitly and answer only from general knowledge, or state that you cannot.";

#[derive(Debug, Clone)]
struct ScoredChunk {
    record: ChunkRecord,
    similarity: Option<f32>,
    proximity: Option<f32>,
}

/// Answers natural-language queries against the ingested index.
#[derive(Clone)]
pub struct HybridQueryEngine {
    embeddings: Arc<dyn EmbeddingProvider>,
    completion: Arc<dyn CompletionProvider>,
    vector: Arc<dyn VectorBackend>,
    graph: Arc<dyn GraphBackend>,
    config: RagConfig,
}

impl HybridQueryEngine {
    pub fn new(
        embeddings: Arc<dyn EmbeddingProvider>,
        completion: Arc<dyn CompletionProvider>,
        vector: Arc<dyn VectorBackend>,
        graph: Arc<dyn GraphBackend>,
        config: RagConfig,
    ) -> Self {
        Self {
            embeddings,
            completion,
            vector,
            graph,
            config,
        }
    }

    /// Runs retrieval and produces a complete answer.
    #[tracing::instrument(skip_all, fields(mode = ?mode))]
    pub async fn query(&self, text: &str, mode: QueryMode) -> Result<Answer, RagError> {
        let (prompt, sources) = self.build_prompt(text, mode).await?;
        let answer = self
            .completion
            .complete(&prompt)
            .await
            .map_err(|err| RagError::Query(err.to_string()))?;
        Ok(Answer {
            text: answer,
            sources,
            mode,
        })
    }

    /// Runs retrieval and streams the answer as deltas.
    pub async fn query_stream(&self, text: &str, mode: QueryMode) -> Result<AnswerStream, RagError> {
        let (prompt, sources) = self.build_prompt(text, mode).await?;
        let deltas = self
            .completion
            .complete_stream(&prompt)
            .await
            .map_err(|err| RagError::Query(err.to_string()))?;
        Ok(AnswerStream {
            deltas,
            sources,
            mode,
        })
    }

    async fn build_prompt(
        &self,
        text: &str,
        mode: QueryMode,
    ) -> Result<(String, Vec<String>), RagError> {
        let merged = self.retrieve(text, mode).await?;
        let top: Vec<&ScoredChunk> = merged.iter().take(self.config.context_chunks).collect();
        let sources: Vec<String> = top.iter().map(|s| s.record.chunk.id.clone()).collect();

        let prompt = if top.is_empty() {
            format!("{NO_CONTEXT_MARKER}\n\nQuestion: {text}")
        } else {
            let context = top
                .iter()
                .map(|scored| {
                    format!("[{}]\n{}", scored.record.chunk.id, scored.record.chunk.content)
                })
                .collect::<Vec<_>>()
                .join("\n\n---\n\n");
            format!(
                "Answer the question using only the context below. Cite nothing outside it.\n\n\
                 Context:\n{context}\n\nQuestion: {text}"
            )
        };
        tracing::debug!(sources = sources.len(), "prompt assembled");
        Ok((prompt, sources))
    }

    /// Runs the configured retrieval modes and merges their results.
    ///
    /// Both score families are min-max normalized to [0, 1], combined with
    /// the configured vector weight, and sorted descending; equal scores
    /// keep insertion order (vector results first, then graph-only results).
    async fn retrieve(&self, text: &str, mode: QueryMode) -> Result<Vec<ScoredChunk>, RagError> {
        let mut merged: Vec<ScoredChunk> = Vec::new();
        let mut by_id: HashMap<String, usize> = HashMap::new();

        if matches!(mode, QueryMode::Vector | QueryMode::Hybrid) {
            for (record, similarity) in self.vector_results(text).await? {
                let id = record.chunk.id.clone();
                let entry = ScoredChunk {
                    record,
                    similarity: Some(similarity),
                    proximity: None,
                };
                by_id.insert(id, merged.len());
                merged.push(entry);
            }
        }

        if matches!(mode, QueryMode::Graph | QueryMode::Hybrid) {
            for (record, proximity) in self.graph_results(text).await? {
                match by_id.get(&record.chunk.id) {
                    Some(&index) => {
                        let existing = &mut merged[index];
                        existing.proximity =
                            Some(existing.proximity.unwrap_or(0.0).max(proximity));
                    }
                    None => {
                        by_id.insert(record.chunk.id.clone(), merged.len());
                        merged.push(ScoredChunk {
                            record,
                            similarity: None,
                            proximity: Some(proximity),
                        });
                    }
                }
            }
        }

        let sim_norm = normalizer(merged.iter().filter_map(|s| s.similarity).collect());
        let prox_norm = normalizer(merged.iter().filter_map(|s| s.proximity).collect());
        let weight = self.config.vector_weight;

        let combined = |scored: &ScoredChunk| -> f32 {
            let sim = scored.similarity.map(&sim_norm).unwrap_or(0.0);
            let prox = scored.proximity.map(&prox_norm).unwrap_or(0.0);
            weight * sim + (1.0 - weight) * prox
        };

        // Stable sort: ties keep insertion order.
        merged.sort_by(|a, b| {
            combined(b)
                .partial_cmp(&combined(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(merged)
    }

    async fn vector_results(&self, text: &str) -> Result<Vec<(ChunkRecord, f32)>, RagError> {
        let query = vec![text.to_string()];
        let mut vectors = self
            .embeddings
            .embed(&query)
            .await
            .map_err(|err| RagError::Query(format!("query embedding failed: {err}")))?;
        let Some(query_vector) = vectors.pop() else {
            return Ok(Vec::new());
        };
        self.vector
            .search_similar(&query_vector, self.config.top_k)
            .await
    }

    /// Graph retrieval: seed traversal from entities named in the query,
    /// then collect the provenance chunks of every reached entity, scored by
    /// hop distance (`1 / (1 + hops)`).
    async fn graph_results(&self, text: &str) -> Result<Vec<(ChunkRecord, f32)>, RagError> {
        let terms: Vec<String> = text
            .unicode_words()
            .filter(|word| word.len() > 2)
            .map(str::to_lowercase)
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let seeds = self.graph.match_entities(&terms).await?;
        if seeds.is_empty() {
            return Ok(Vec::new());
        }
        let subgraph = self.graph.traverse(&seeds, self.config.hop_limit).await?;

        // Best (lowest-hop) score per chunk across all reached entities.
        let mut chunk_scores: Vec<(String, f32)> = Vec::new();
        let mut seen: HashMap<String, usize> = HashMap::new();
        for (entity, hops) in &subgraph.entities {
            let proximity = 1.0 / (1.0 + *hops as f32);
            for chunk_id in &entity.source_chunks {
                match seen.get(chunk_id) {
                    Some(&index) => {
                        if proximity > chunk_scores[index].1 {
                            chunk_scores[index].1 = proximity;
                        }
                    }
                    None => {
                        seen.insert(chunk_id.clone(), chunk_scores.len());
                        chunk_scores.push((chunk_id.clone(), proximity));
                    }
                }
            }
        }

        let mut results = Vec::with_capacity(chunk_scores.len());
        for (chunk_id, proximity) in chunk_scores {
            match self.vector.get_chunk_by_id(&chunk_id).await? {
                Some(record) => results.push((record, proximity)),
                // Dangling provenance would be an ingestion bug; tolerate it
                // on the read path rather than failing the query.
                None => tracing::warn!(chunk = %chunk_id, "provenance chunk missing from store"),
            }
        }
        Ok(results)
    }
}

/// Builds a min-max normalizer over the observed scores.
///
/// Takes the scores by value so the returned closure owns plain floats and
/// borrows nothing from the result set it will be applied to.
fn normalizer(scores: Vec<f32>) -> impl Fn(f32) -> f32 {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for score in scores {
        min = min.min(score);
        max = max.max(score);
    }
    move |score: f32| {
        if !min.is_finite() || max <= min {
            1.0
        } else {
            (score - min) / (max - min)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizer_maps_to_unit_interval() {
        let norm = normalizer(vec![2.0f32, 4.0, 6.0]);
        assert!((norm(2.0) - 0.0).abs() < f32::EPSILON);
        assert!((norm(4.0) - 0.5).abs() < f32::EPSILON);
        assert!((norm(6.0) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn degenerate_score_sets_normalize_to_one() {
        let norm = normalizer(vec![3.0f32, 3.0]);
        assert!((norm(3.0) - 1.0).abs() < f32::EPSILON);
        let empty = normalizer(Vec::new());
        assert!((empty(0.7) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn normalized_blend_outlives_the_score_source() {
        // The closures must not borrow the vector the scores came from.
        let mut scores = vec![0.2f32, 0.8, 0.5];
        let norm = normalizer(scores.clone());
        scores.sort_by(|a, b| norm(*b).partial_cmp(&norm(*a)).unwrap());
        assert_eq!(scores, vec![0.8, 0.5, 0.2]);
    }
}
