//! Ingestion orchestration: one document in, vectors and graph writes out.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RagConfig;
use crate::ingestion::chunker::split_document;
use crate::providers::embeddings::EmbeddingProvider;
use crate::providers::extraction::EntityExtractor;
use crate::stores::graph::GraphAdapter;
use crate::stores::{ChunkRecord, VectorBackend};
use crate::types::{Chunk, Document, Entity, RagError, Relation};

/// Summary of one ingestion job.
///
/// Unit-level failures are recorded here rather than aborting the job: a bad
/// chunk loses its entities, a failed embedding batch loses its vectors, a
/// failed graph batch loses its writes — everything else lands.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub chunks_processed: usize,
    /// Chunk ids whose extraction failed, with the error message.
    pub extraction_failures: Vec<(String, String)>,
    /// Indices of embedding batches that failed.
    pub failed_embed_batches: Vec<usize>,
    /// Indices of graph batch writes that failed.
    pub failed_graph_batches: Vec<usize>,
    pub chunks_embedded: usize,
    pub entities_written: usize,
    pub relations_written: usize,
}

impl IngestReport {
    /// True when every unit of the job landed.
    pub fn is_clean(&self) -> bool {
        self.extraction_failures.is_empty()
            && self.failed_embed_batches.is_empty()
            && self.failed_graph_batches.is_empty()
    }
}

/// Runs the ingestion path for one document: chunk, extract, embed, persist.
#[derive(Clone)]
pub struct Ingestor {
    embeddings: Arc<dyn EmbeddingProvider>,
    extractor: Arc<dyn EntityExtractor>,
    vector: Arc<dyn VectorBackend>,
    graph: GraphAdapter,
    config: RagConfig,
}

impl Ingestor {
    pub fn new(
        embeddings: Arc<dyn EmbeddingProvider>,
        extractor: Arc<dyn EntityExtractor>,
        vector: Arc<dyn VectorBackend>,
        graph: GraphAdapter,
        config: RagConfig,
    ) -> Self {
        Self {
            embeddings,
            extractor,
            vector,
            graph,
            config,
        }
    }

    /// Ingests one document.
    ///
    /// Chunk order follows document order throughout. Re-running over the
    /// same document upserts everywhere, so the merged index is unchanged.
    #[tracing::instrument(skip_all, fields(source = %document.source))]
    pub async fn ingest(&self, document: &Document) -> Result<IngestReport, RagError> {
        let chunks = split_document(document, self.config.max_chunk_chars);
        if chunks.is_empty() {
            return Err(RagError::InvalidDocument(
                "document produced no chunks".to_string(),
            ));
        }

        let mut report = IngestReport {
            chunks_processed: chunks.len(),
            ..IngestReport::default()
        };

        // Extraction runs per chunk, sequentially; one bad chunk is recorded
        // and skipped without touching its siblings.
        let mut entities: Vec<Entity> = Vec::new();
        let mut relations: Vec<Relation> = Vec::new();
        for chunk in &chunks {
            match self.extractor.extract(chunk).await {
                Ok(extraction) => {
                    entities.extend(extraction.entities);
                    relations.extend(extraction.relations);
                }
                Err(err) => {
                    tracing::warn!(chunk = %chunk.id, error = %err, "extraction failed, skipping chunk");
                    report
                        .extraction_failures
                        .push((chunk.id.clone(), err.to_string()));
                }
            }
        }

        // Re-ingest resume: chunks already stored with an embedding and
        // unchanged content keep their vector instead of being re-embedded.
        let prior: HashMap<String, (String, Vec<f32>)> = self
            .vector
            .get_chunks_by_source(document.source.as_str())
            .await?
            .into_iter()
            .filter_map(|record| {
                let embedding = record.embedding?;
                Some((record.chunk.id, (record.chunk.content, embedding)))
            })
            .collect();

        let mut records: Vec<ChunkRecord> = Vec::new();
        let mut pending: Vec<&Chunk> = Vec::new();
        for chunk in &chunks {
            match prior.get(&chunk.id) {
                Some((content, embedding)) if *content == chunk.content => {
                    report.chunks_embedded += 1;
                    records.push(ChunkRecord::new(chunk.clone()).with_embedding(embedding.clone()));
                }
                _ => pending.push(chunk),
            }
        }

        // Embed in batches; a failed batch leaves its chunks stored without
        // vectors so a later re-ingest can fill them in (resumable, not
        // transactional across the document).
        for (batch_index, batch) in pending.chunks(self.config.embed_batch_size).enumerate() {
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            match self.embeddings.embed(&texts).await {
                Ok(vectors) if vectors.len() == batch.len() => {
                    report.chunks_embedded += batch.len();
                    records.extend(
                        batch
                            .iter()
                            .zip(vectors)
                            .map(|(chunk, vector)| {
                                ChunkRecord::new((*chunk).clone()).with_embedding(vector)
                            }),
                    );
                }
                Ok(vectors) => {
                    tracing::warn!(
                        batch_index,
                        expected = batch.len(),
                        got = vectors.len(),
                        "embedding batch returned wrong count, storing chunks unembedded"
                    );
                    report.failed_embed_batches.push(batch_index);
                    records.extend(batch.iter().map(|chunk| ChunkRecord::new((*chunk).clone())));
                }
                Err(err) => {
                    tracing::warn!(batch_index, error = %err, "embedding batch failed");
                    report.failed_embed_batches.push(batch_index);
                    records.extend(batch.iter().map(|chunk| ChunkRecord::new((*chunk).clone())));
                }
            }
        }
        self.vector.insert_chunks(records).await?;

        // Local merge before the graph writes keeps the upserts small and
        // makes re-ingestion counts stable.
        let entities = merge_entities(entities);
        let relations = merge_relations(relations);

        let node_outcome = self.graph.upsert_nodes(entities).await;
        for failure in &node_outcome.failures {
            tracing::warn!(error = %failure, "graph node batch failed");
        }
        report.entities_written = node_outcome.items_written;
        report.failed_graph_batches.extend(node_outcome.failed_indices());

        let edge_outcome = self.graph.upsert_edges(relations).await;
        for failure in &edge_outcome.failures {
            tracing::warn!(error = %failure, "graph edge batch failed");
        }
        report.relations_written = edge_outcome.items_written;
        report.failed_graph_batches.extend(edge_outcome.failed_indices());

        tracing::info!(
            chunks = report.chunks_processed,
            embedded = report.chunks_embedded,
            entities = report.entities_written,
            relations = report.relations_written,
            extraction_failures = report.extraction_failures.len(),
            "ingestion finished"
        );
        Ok(report)
    }
}

/// Merges entity observations by canonical name, preserving first-seen order.
pub fn merge_entities(entities: Vec<Entity>) -> Vec<Entity> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, Entity> = HashMap::new();
    for entity in entities {
        let key = entity.canonical_name();
        match merged.get_mut(&key) {
            Some(existing) => existing.merge(&entity),
            None => {
                order.push(key.clone());
                merged.insert(key, entity);
            }
        }
    }
    order
        .into_iter()
        .filter_map(|key| merged.remove(&key))
        .collect()
}

/// Merges relation observations by (source, target, type), preserving
/// first-seen order.
pub fn merge_relations(relations: Vec<Relation>) -> Vec<Relation> {
    let mut order: Vec<(String, String, String)> = Vec::new();
    let mut merged: HashMap<(String, String, String), Relation> = HashMap::new();
    for relation in relations {
        let key = relation.canonical_key();
        match merged.get_mut(&key) {
            Some(existing) => existing.merge(&relation),
            None => {
                order.push(key.clone());
                merged.insert(key, relation);
            }
        }
    }
    order
        .into_iter()
        .filter_map(|key| merged.remove(&key))
        .collect()
}
