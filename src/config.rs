//! Pipeline configuration and graph backend connection settings.

use std::env;
use std::path::PathBuf;

use url::Url;

use crate::types::RagError;

/// Tunable knobs for ingestion, retrieval, and streaming.
///
/// Defaults follow the reference deployment: node batches of 500 and edge
/// batches of 100 against the graph backend, character-budgeted chunks, and
/// an even vector/graph blend for hybrid ranking.
#[derive(Debug, Clone)]
pub struct RagConfig {
    /// Directory holding locally cached index artifacts (document cache,
    /// sqlite chunk store). Created on initialization if absent.
    pub working_dir: PathBuf,
    /// Maximum characters per chunk; split points prefer paragraph and
    /// sentence boundaries.
    pub max_chunk_chars: usize,
    /// Number of chunk texts sent to the embedding provider per call.
    pub embed_batch_size: usize,
    /// Maximum entities per graph node write.
    pub node_batch_size: usize,
    /// Maximum relations per graph edge write.
    pub edge_batch_size: usize,
    /// Bound on concurrently dispatched graph batch writes.
    pub max_concurrent_batches: usize,
    /// Result count for vector similarity search.
    pub top_k: usize,
    /// Hop limit for graph traversal seeded from query entities.
    pub hop_limit: usize,
    /// Weight of the vector similarity score in hybrid ranking, in [0, 1];
    /// the graph proximity score receives `1 - vector_weight`.
    pub vector_weight: f32,
    /// Number of merged chunks handed to the completion provider as context.
    pub context_chunks: usize,
    /// Capacity of the bounded per-turn delta channel.
    pub delta_capacity: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("./ragweave"),
            max_chunk_chars: 1200,
            embed_batch_size: 32,
            node_batch_size: 500,
            edge_batch_size: 100,
            max_concurrent_batches: 4,
            top_k: 8,
            hop_limit: 2,
            vector_weight: 0.5,
            context_chunks: 8,
            delta_capacity: 32,
        }
    }
}

impl RagConfig {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_chunk_chars(mut self, max: usize) -> Self {
        self.max_chunk_chars = max;
        self
    }

    #[must_use]
    pub fn with_embed_batch_size(mut self, size: usize) -> Self {
        self.embed_batch_size = size.max(1);
        self
    }

    #[must_use]
    pub fn with_graph_batch_sizes(mut self, nodes: usize, edges: usize) -> Self {
        self.node_batch_size = nodes.max(1);
        self.edge_batch_size = edges.max(1);
        self
    }

    #[must_use]
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    #[must_use]
    pub fn with_hop_limit(mut self, hops: usize) -> Self {
        self.hop_limit = hops;
        self
    }

    #[must_use]
    pub fn with_vector_weight(mut self, weight: f32) -> Self {
        self.vector_weight = weight.clamp(0.0, 1.0);
        self
    }

    /// Path of the sqlite chunk store inside the working directory.
    pub fn chunk_db_path(&self) -> PathBuf {
        self.working_dir.join("chunks.sqlite")
    }

    /// Root of the document cache inside the working directory.
    pub fn document_cache_dir(&self) -> PathBuf {
        self.working_dir.join("documents")
    }
}

/// Connection settings for a remote graph backend.
///
/// Read from the `NEO4J_URI`, `NEO4J_USERNAME`, `NEO4J_PASSWORD`, and
/// `NEO4J_DATABASE` environment variables; username and database fall back
/// to `neo4j` when absent, matching the backend's own defaults.
#[derive(Debug, Clone)]
pub struct GraphConnection {
    pub uri: Url,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl GraphConnection {
    pub fn new(uri: Url, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            uri,
            username: username.into(),
            password: password.into(),
            database: "neo4j".to_string(),
        }
    }

    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Loads connection settings from the environment (and `.env` if present).
    pub fn from_env() -> Result<Self, RagError> {
        dotenvy::dotenv().ok();

        let uri = env::var("NEO4J_URI")
            .map_err(|_| RagError::Config("NEO4J_URI is not set".to_string()))?;
        let uri = Url::parse(&uri)
            .map_err(|err| RagError::Config(format!("invalid NEO4J_URI '{uri}': {err}")))?;
        let username = env::var("NEO4J_USERNAME").unwrap_or_else(|_| "neo4j".to_string());
        let password = env::var("NEO4J_PASSWORD")
            .map_err(|_| RagError::Config("NEO4J_PASSWORD is not set".to_string()))?;
        let database = env::var("NEO4J_DATABASE").unwrap_or_else(|_| "neo4j".to_string());

        Ok(Self {
            uri,
            username,
            password,
            database,
        })
    }
}
