//! Core data model and error taxonomy shared across the pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// A raw source document fetched from a corpus location.
///
/// Documents are immutable once fetched; the ingestion pipeline only ever
/// derives chunks from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Origin of the document (used in chunk identifiers and provenance).
    pub source: Url,
    /// Full text content.
    pub content: String,
}

impl Document {
    pub fn new(source: Url, content: impl Into<String>) -> Self {
        Self {
            source,
            content: content.into(),
        }
    }
}

/// A bounded-size fragment of a document; the unit of embedding and extraction.
///
/// Chunk identifiers are deterministic (`"{source}#{index}"`, zero-padded) so
/// re-ingesting the same document produces the same ids and upserts cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    /// Source URL the chunk was derived from.
    pub source: String,
    /// Zero-based position of this chunk within the document.
    pub index: usize,
    pub content: String,
}

impl Chunk {
    pub fn new(source: &Url, index: usize, content: impl Into<String>) -> Self {
        Self {
            id: Self::id_for(source, index),
            source: source.to_string(),
            index,
            content: content.into(),
        }
    }

    /// Deterministic identifier for a chunk of a given source document.
    pub fn id_for(source: &Url, index: usize) -> String {
        format!("{source}#{index:05}")
    }
}

/// A named node extracted from one or more chunks.
///
/// Entities are upserted by canonical name (lowercased, trimmed); merging
/// unions provenance and keeps the first non-empty type and description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(default)]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
    /// Ids of the chunks this entity was extracted from.
    #[serde(default)]
    pub source_chunks: Vec<String>,
}

impl Entity {
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            description: String::new(),
            source_chunks: Vec::new(),
        }
    }

    /// Canonical upsert key for this entity.
    pub fn canonical_name(&self) -> String {
        canonicalize(&self.name)
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_provenance(mut self, chunk_id: impl Into<String>) -> Self {
        self.source_chunks.push(chunk_id.into());
        self
    }

    /// Merge another observation of the same entity into this one.
    pub fn merge(&mut self, other: &Entity) {
        if self.entity_type.is_empty() {
            self.entity_type = other.entity_type.clone();
        }
        if self.description.is_empty() {
            self.description = other.description.clone();
        }
        for chunk in &other.source_chunks {
            if !self.source_chunks.contains(chunk) {
                self.source_chunks.push(chunk.clone());
            }
        }
    }
}

/// A directed, typed edge between two entities.
///
/// Relations are upserted by `(source, target, rel_type)`; merging unions
/// provenance and accumulates weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub source: String,
    pub target: String,
    pub rel_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_weight")]
    pub weight: f32,
    #[serde(default)]
    pub source_chunks: Vec<String>,
}

fn default_weight() -> f32 {
    1.0
}

impl Relation {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        rel_type: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            rel_type: rel_type.into(),
            description: String::new(),
            weight: 1.0,
            source_chunks: Vec::new(),
        }
    }

    /// Canonical upsert key: (source, target, type), all canonicalized.
    pub fn canonical_key(&self) -> (String, String, String) {
        (
            canonicalize(&self.source),
            canonicalize(&self.target),
            canonicalize(&self.rel_type),
        )
    }

    #[must_use]
    pub fn with_provenance(mut self, chunk_id: impl Into<String>) -> Self {
        self.source_chunks.push(chunk_id.into());
        self
    }

    /// Merge another observation of the same relation into this one.
    pub fn merge(&mut self, other: &Relation) {
        if self.description.is_empty() {
            self.description = other.description.clone();
        }
        self.weight += other.weight;
        for chunk in &other.source_chunks {
            if !self.source_chunks.contains(chunk) {
                self.source_chunks.push(chunk.clone());
            }
        }
    }
}

/// Normalizes an entity name into its canonical upsert key.
pub fn canonicalize(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Entities and relations reachable from a set of seeds within a hop limit.
#[derive(Debug, Clone, Default)]
pub struct Subgraph {
    /// Each entity paired with its hop distance from the nearest seed.
    pub entities: Vec<(Entity, usize)>,
    pub relations: Vec<Relation>,
}

impl Subgraph {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Errors surfaced by the ingestion and query pipeline.
///
/// Per-chunk and per-batch failures (`Extraction`, `Embedding`, `GraphWrite`)
/// are recorded in the ingest report and skipped; they never abort a whole
/// job. `NotInitialized` indicates a programming error: the pipeline was
/// consulted before `initialize` completed.
#[derive(Debug, Error)]
pub enum RagError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("extraction failed for chunk {chunk_id}: {message}")]
    Extraction { chunk_id: String, message: String },

    #[error("embedding batch {batch_index} failed: {message}")]
    Embedding { batch_index: usize, message: String },

    #[error("graph write failed at batch {batch_index}: {message}")]
    GraphWrite { batch_index: usize, message: String },

    #[error("pipeline consulted before initialization")]
    NotInitialized,

    #[error("query failed: {0}")]
    Query(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
