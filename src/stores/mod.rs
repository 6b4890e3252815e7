//! Storage backends for embedded chunks and the extracted knowledge graph.
//!
//! Two seams live here:
//!
//! * [`VectorBackend`] — chunk persistence plus vector similarity search.
//!   Implemented by [`sqlite::SqliteChunkStore`] (sqlite-vec cosine search).
//! * [`graph::GraphBackend`] — batched node/edge upserts and hop-limited
//!   traversal. Implemented by [`graph::MemoryGraphStore`] (petgraph, local)
//!   and [`neo4j::Neo4jHttpStore`] (remote, transactional HTTP endpoint).
//!   [`graph::GraphAdapter`] sits in front of any backend and partitions
//!   writes into bounded batches.

pub mod graph;
pub mod neo4j;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Chunk, RagError};

pub use graph::{GraphAdapter, GraphBackend, MemoryGraphStore};
pub use neo4j::Neo4jHttpStore;
pub use sqlite::SqliteChunkStore;

/// A chunk paired with its (optional) embedding, ready for storage.
///
/// Chunks whose embedding batch failed are still persisted so provenance
/// references stay valid; they are simply invisible to similarity search
/// until a later re-ingest fills the vector in.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk: Chunk,
    pub embedding: Option<Vec<f32>>,
}

impl ChunkRecord {
    pub fn new(chunk: Chunk) -> Self {
        Self {
            chunk,
            embedding: None,
        }
    }

    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

impl From<Chunk> for ChunkRecord {
    fn from(chunk: Chunk) -> Self {
        Self::new(chunk)
    }
}

/// Chunk storage with vector similarity search.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Upsert a batch of chunk records atomically (a reader never observes a
    /// partially written batch). Records are keyed by chunk id.
    async fn insert_chunks(&self, records: Vec<ChunkRecord>) -> Result<(), RagError>;

    /// Retrieve a specific chunk by its id.
    async fn get_chunk_by_id(&self, id: &str) -> Result<Option<ChunkRecord>, RagError>;

    /// Retrieve all chunks for a source, in document order.
    async fn get_chunks_by_source(&self, source: &str) -> Result<Vec<ChunkRecord>, RagError>;

    /// Similarity search: results ordered by descending similarity, ties
    /// broken by ascending chunk id.
    async fn search_similar(
        &self,
        query_embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<(ChunkRecord, f32)>, RagError>;

    /// Total number of chunks in the store.
    async fn count(&self) -> Result<usize, RagError>;
}
