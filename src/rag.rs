//! Top-level facade tying the ingestion and query paths together.
//!
//! Mirrors the lifecycle the rest of the crate assumes: construct with
//! providers, call [`Rag::initialize`] once (creates the working directory,
//! opens the chunk store, constructs the status coordinator), then ingest
//! and query. Operations invoked before initialization fail with
//! [`RagError::NotInitialized`].

use std::sync::Arc;

use reqwest::Client;
use url::Url;

use crate::config::RagConfig;
use crate::engine::{Answer, HybridQueryEngine, QueryMode};
use crate::ingestion::fetch::{DocumentCache, fetch_document};
use crate::ingestion::pipeline::{IngestReport, Ingestor};
use crate::providers::completion::CompletionProvider;
use crate::providers::embeddings::EmbeddingProvider;
use crate::providers::extraction::EntityExtractor;
use crate::session::StreamingSession;
use crate::status::{JobOutcome, PipelineStatus, PipelineStatusCoordinator};
use crate::stores::graph::{GraphAdapter, GraphBackend, MemoryGraphStore};
use crate::stores::sqlite::SqliteChunkStore;
use crate::stores::VectorBackend;
use crate::types::{Document, RagError};

/// The assembled pipeline: one corpus, one index, one status coordinator.
pub struct Rag {
    config: RagConfig,
    embeddings: Arc<dyn EmbeddingProvider>,
    completion: Arc<dyn CompletionProvider>,
    extractor: Arc<dyn EntityExtractor>,
    graph_backend: Arc<dyn GraphBackend>,
    client: Client,
    state: Option<State>,
}

struct State {
    ingestor: Ingestor,
    engine: Arc<HybridQueryEngine>,
    coordinator: PipelineStatusCoordinator,
    cache: DocumentCache,
}

impl Rag {
    /// Builds an uninitialized pipeline with an in-memory graph backend.
    pub fn new(
        config: RagConfig,
        embeddings: Arc<dyn EmbeddingProvider>,
        completion: Arc<dyn CompletionProvider>,
        extractor: Arc<dyn EntityExtractor>,
    ) -> Self {
        Self::with_graph_backend(
            config,
            embeddings,
            completion,
            extractor,
            Arc::new(MemoryGraphStore::new()),
        )
    }

    /// Builds an uninitialized pipeline against a specific graph backend
    /// (e.g. [`crate::stores::Neo4jHttpStore`]).
    pub fn with_graph_backend(
        config: RagConfig,
        embeddings: Arc<dyn EmbeddingProvider>,
        completion: Arc<dyn CompletionProvider>,
        extractor: Arc<dyn EntityExtractor>,
        graph_backend: Arc<dyn GraphBackend>,
    ) -> Self {
        Self {
            config,
            embeddings,
            completion,
            extractor,
            graph_backend,
            client: Client::new(),
            state: None,
        }
    }

    /// Creates the working directory, opens the chunk store, and constructs
    /// the pipeline status coordinator. Must complete before any ingestion
    /// or query call; repeated calls are a no-op.
    pub async fn initialize(&mut self) -> Result<(), RagError> {
        if self.state.is_some() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.config.working_dir).await?;
        tokio::fs::create_dir_all(self.config.document_cache_dir()).await?;

        let vector: Arc<dyn VectorBackend> = Arc::new(
            SqliteChunkStore::open(self.config.chunk_db_path(), self.embeddings.dimensions())
                .await?,
        );

        let adapter = GraphAdapter::new(
            Arc::clone(&self.graph_backend),
            self.config.node_batch_size,
            self.config.edge_batch_size,
            self.config.max_concurrent_batches,
        );
        let ingestor = Ingestor::new(
            Arc::clone(&self.embeddings),
            Arc::clone(&self.extractor),
            Arc::clone(&vector),
            adapter,
            self.config.clone(),
        );
        let engine = Arc::new(HybridQueryEngine::new(
            Arc::clone(&self.embeddings),
            Arc::clone(&self.completion),
            vector,
            Arc::clone(&self.graph_backend),
            self.config.clone(),
        ));

        self.state = Some(State {
            ingestor,
            engine,
            coordinator: PipelineStatusCoordinator::initialize(),
            cache: DocumentCache::new(self.config.document_cache_dir()),
        });
        tracing::info!(working_dir = %self.config.working_dir.display(), "pipeline initialized");
        Ok(())
    }

    fn state(&self) -> Result<&State, RagError> {
        self.state.as_ref().ok_or(RagError::NotInitialized)
    }

    /// Fetches a corpus from a URL (through the document cache) and ingests
    /// it.
    pub async fn insert_url(&self, url: &Url) -> Result<IngestReport, RagError> {
        let state = self.state()?;
        let outcome = fetch_document(&self.client, url, Some(&state.cache)).await?;
        self.insert(&outcome.document).await
    }

    /// Ingests an already-fetched document, tracking it as a pipeline job.
    pub async fn insert(&self, document: &Document) -> Result<IngestReport, RagError> {
        let state = self.state()?;
        let guard = state.coordinator.begin_job("ingest");
        match state.ingestor.ingest(document).await {
            Ok(report) => {
                guard.finish(JobOutcome::Completed);
                Ok(report)
            }
            Err(err) => {
                guard.finish(JobOutcome::Failed);
                Err(err)
            }
        }
    }

    /// Answers a query against the last-committed index state. Queries are
    /// not blocked by in-flight ingestion jobs.
    pub async fn query(&self, text: &str, mode: QueryMode) -> Result<Answer, RagError> {
        let state = self.state()?;
        state.engine.query(text, mode).await
    }

    /// Opens a streaming conversational session over this pipeline.
    pub fn session(&self, mode: QueryMode) -> Result<StreamingSession, RagError> {
        let state = self.state()?;
        Ok(StreamingSession::new(
            Arc::clone(&state.engine),
            state.coordinator.clone(),
            mode,
            self.config.delta_capacity,
        ))
    }

    /// Current pipeline status snapshot.
    pub fn status(&self) -> Result<PipelineStatus, RagError> {
        Ok(self.state()?.coordinator.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::completion::MockCompletionProvider;
    use crate::providers::embeddings::MockEmbeddingProvider;
    use crate::providers::extraction::MockExtractor;

    fn unready_rag() -> Rag {
        let completion = Arc::new(MockCompletionProvider::new("ok"));
        Rag::new(
            RagConfig::new("/tmp/never-created"),
            Arc::new(MockEmbeddingProvider::new(8)),
            completion,
            Arc::new(MockExtractor),
        )
    }

    #[tokio::test]
    async fn operations_before_initialize_fail() {
        let rag = unready_rag();
        let url = Url::parse("https://example.com/doc").unwrap();
        let doc = Document::new(url, "text");

        assert!(matches!(
            rag.insert(&doc).await.unwrap_err(),
            RagError::NotInitialized
        ));
        assert!(matches!(
            rag.query("q", QueryMode::Hybrid).await.unwrap_err(),
            RagError::NotInitialized
        ));
        assert!(matches!(
            rag.session(QueryMode::Hybrid).map(|_| ()).unwrap_err(),
            RagError::NotInitialized
        ));
        assert!(matches!(rag.status().unwrap_err(), RagError::NotInitialized));
    }
}
