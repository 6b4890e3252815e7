//! End-to-end pipeline tests with mock providers.
//!
//! Everything here runs deterministically and offline: hash-based mock
//! embeddings, a scripted completion provider, and an in-memory graph
//! backend, with the real sqlite-vec chunk store on a temp directory.

use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::tempdir;
use url::Url;

use ragweave::config::RagConfig;
use ragweave::engine::{HybridQueryEngine, QueryMode};
use ragweave::providers::completion::{CompletionProvider, DeltaStream, MockCompletionProvider};
use ragweave::providers::embeddings::{EmbeddingProvider, MockEmbeddingProvider};
use ragweave::providers::extraction::{EntityExtractor, Extraction, MockExtractor};
use ragweave::rag::Rag;
use ragweave::session::TurnEvent;
use ragweave::stores::graph::MemoryGraphStore;
use ragweave::stores::sqlite::SqliteChunkStore;
use ragweave::stores::{ChunkRecord, GraphBackend, VectorBackend};
use ragweave::types::{Chunk, Document, Entity, RagError, Relation, Subgraph};

use async_trait::async_trait;

fn three_paragraph_doc() -> Document {
    let url = Url::parse("https://docs.example.com/guide").unwrap();
    Document::new(
        url,
        "Weavegraph schedules Nodes concurrently.\n\n\
         Ragsmith chunks Documents semantically.\n\n\
         Tokio drives the Runtime underneath.",
    )
}

fn small_chunk_config(dir: &std::path::Path) -> RagConfig {
    RagConfig::new(dir).with_max_chunk_chars(60)
}

/// Extractor that fails on one chunk index and delegates otherwise.
struct FlakyExtractor {
    fail_index: usize,
    inner: MockExtractor,
}

#[async_trait]
impl EntityExtractor for FlakyExtractor {
    async fn extract(&self, chunk: &Chunk) -> Result<Extraction, RagError> {
        if chunk.index == self.fail_index {
            return Err(RagError::Extraction {
                chunk_id: chunk.id.clone(),
                message: "model returned garbage".to_string(),
            });
        }
        self.inner.extract(chunk).await
    }
}

async fn build_rag(dir: &std::path::Path) -> (Rag, Arc<MemoryGraphStore>, Arc<MockCompletionProvider>) {
    let graph = Arc::new(MemoryGraphStore::new());
    let completion = Arc::new(MockCompletionProvider::new("grounded answer text"));
    let mut rag = Rag::with_graph_backend(
        small_chunk_config(dir),
        Arc::new(MockEmbeddingProvider::new(16)),
        completion.clone(),
        Arc::new(MockExtractor),
        graph.clone(),
    );
    rag.initialize().await.unwrap();
    (rag, graph, completion)
}

#[tokio::test]
async fn reingesting_the_same_document_is_idempotent() {
    let dir = tempdir().unwrap();
    let (rag, graph, _) = build_rag(dir.path()).await;
    let doc = three_paragraph_doc();

    let first = rag.insert(&doc).await.unwrap();
    let nodes_after_first = graph.node_count().await.unwrap();
    let edges_after_first = graph.edge_count().await.unwrap();

    let second = rag.insert(&doc).await.unwrap();
    assert_eq!(first.chunks_processed, second.chunks_processed);
    assert_eq!(graph.node_count().await.unwrap(), nodes_after_first);
    assert_eq!(graph.edge_count().await.unwrap(), edges_after_first);
}

/// Embedding provider that counts how many texts it is asked to embed.
struct CountingEmbeddings {
    inner: MockEmbeddingProvider,
    embedded: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for CountingEmbeddings {
    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        self.embedded
            .fetch_add(texts.len(), std::sync::atomic::Ordering::SeqCst);
        self.inner.embed(texts).await
    }
}

#[tokio::test]
async fn reingest_reuses_stored_embeddings() {
    let dir = tempdir().unwrap();
    let embeddings = Arc::new(CountingEmbeddings {
        inner: MockEmbeddingProvider::new(16),
        embedded: std::sync::atomic::AtomicUsize::new(0),
    });
    let mut rag = Rag::with_graph_backend(
        small_chunk_config(dir.path()),
        embeddings.clone(),
        Arc::new(MockCompletionProvider::new("answer")),
        Arc::new(MockExtractor),
        Arc::new(MemoryGraphStore::new()),
    );
    rag.initialize().await.unwrap();
    let doc = three_paragraph_doc();

    let first = rag.insert(&doc).await.unwrap();
    assert_eq!(first.chunks_embedded, 3);
    let after_first = embeddings.embedded.load(std::sync::atomic::Ordering::SeqCst);
    assert_eq!(after_first, 3);

    // Unchanged chunks keep their stored vectors; no provider calls.
    let second = rag.insert(&doc).await.unwrap();
    assert_eq!(second.chunks_embedded, 3);
    assert_eq!(
        embeddings.embedded.load(std::sync::atomic::Ordering::SeqCst),
        after_first
    );
}

#[tokio::test]
async fn chunk_ids_are_strictly_increasing_in_document_order() {
    let doc = three_paragraph_doc();
    let chunks = ragweave::ingestion::split_document(&doc, 60);
    assert_eq!(chunks.len(), 3);
    for window in chunks.windows(2) {
        assert!(window[0].index < window[1].index);
        assert!(window[0].id < window[1].id);
    }
}

#[tokio::test]
async fn failed_extraction_skips_only_its_chunk() {
    let dir = tempdir().unwrap();
    let graph = Arc::new(MemoryGraphStore::new());
    let mut rag = Rag::with_graph_backend(
        small_chunk_config(dir.path()),
        Arc::new(MockEmbeddingProvider::new(16)),
        Arc::new(MockCompletionProvider::new("answer")),
        Arc::new(FlakyExtractor {
            fail_index: 1,
            inner: MockExtractor,
        }),
        graph.clone(),
    );
    rag.initialize().await.unwrap();

    let report = rag.insert(&three_paragraph_doc()).await.unwrap();

    assert_eq!(report.chunks_processed, 3);
    assert_eq!(report.extraction_failures.len(), 1);
    assert!(report.extraction_failures[0].0.ends_with("00001"));
    // All three chunks still got embeddings.
    assert_eq!(report.chunks_embedded, 3);
    // Entities only from the two surviving chunks.
    assert!(report.entities_written > 0);
    let nodes = graph.node_count().await.unwrap();
    assert!(nodes >= report.entities_written);
}

/// Graph backend that rejects its first node batch, then recovers.
struct FlakyGraph {
    inner: MemoryGraphStore,
    failed_once: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl GraphBackend for FlakyGraph {
    async fn upsert_node_batch(&self, nodes: Vec<Entity>) -> Result<(), RagError> {
        use std::sync::atomic::Ordering;
        if !self.failed_once.swap(true, Ordering::SeqCst) {
            return Err(RagError::Storage("graph backend unavailable".to_string()));
        }
        self.inner.upsert_node_batch(nodes).await
    }

    async fn upsert_edge_batch(&self, edges: Vec<Relation>) -> Result<(), RagError> {
        self.inner.upsert_edge_batch(edges).await
    }

    async fn match_entities(&self, terms: &[String]) -> Result<Vec<String>, RagError> {
        self.inner.match_entities(terms).await
    }

    async fn traverse(&self, seeds: &[String], hop_limit: usize) -> Result<Subgraph, RagError> {
        self.inner.traverse(seeds, hop_limit).await
    }

    async fn node_count(&self) -> Result<usize, RagError> {
        self.inner.node_count().await
    }

    async fn edge_count(&self) -> Result<usize, RagError> {
        self.inner.edge_count().await
    }
}

#[tokio::test]
async fn failed_graph_batch_does_not_stop_the_rest() {
    let dir = tempdir().unwrap();
    // Two entities per batch, sequential dispatch, so the first batch is
    // deterministically batch 0.
    let mut config = small_chunk_config(dir.path()).with_graph_batch_sizes(2, 100);
    config.max_concurrent_batches = 1;

    let graph = Arc::new(FlakyGraph {
        inner: MemoryGraphStore::new(),
        failed_once: std::sync::atomic::AtomicBool::new(false),
    });
    let mut rag = Rag::with_graph_backend(
        config,
        Arc::new(MockEmbeddingProvider::new(16)),
        Arc::new(MockCompletionProvider::new("answer")),
        Arc::new(MockExtractor),
        graph.clone(),
    );
    rag.initialize().await.unwrap();

    let report = rag.insert(&three_paragraph_doc()).await.unwrap();

    // Six entities in three batches of two; only the first batch is lost.
    assert_eq!(report.failed_graph_batches, vec![0]);
    assert_eq!(report.entities_written, 4);
    // Edge writes were untouched by the node failure. The lost batch's two
    // endpoints come back as bare entities, so the node count still reads 6.
    assert_eq!(report.relations_written, 3);
    assert_eq!(graph.edge_count().await.unwrap(), 3);
    assert_eq!(graph.node_count().await.unwrap(), 6);
    assert!(!report.is_clean());
}

#[tokio::test]
async fn hybrid_merge_deduplicates_and_ranks() {
    let dir = tempdir().unwrap();
    let embeddings = Arc::new(MockEmbeddingProvider::new(16));
    let store = Arc::new(
        SqliteChunkStore::open(dir.path().join("chunks.sqlite"), 16)
            .await
            .unwrap(),
    );

    let url = Url::parse("https://docs.example.com/guide").unwrap();
    let contents = [
        "zeus rules olympus with thunder",
        "poseidon commands the seas",
        "hades keeps the underworld",
    ];
    let texts: Vec<String> = contents.iter().map(|s| s.to_string()).collect();
    let vectors = embeddings.embed(&texts).await.unwrap();
    let records: Vec<ChunkRecord> = contents
        .iter()
        .zip(vectors)
        .enumerate()
        .map(|(i, (content, vector))| {
            ChunkRecord::new(Chunk::new(&url, i, *content)).with_embedding(vector)
        })
        .collect();
    store.insert_chunks(records).await.unwrap();

    // Graph knows "zeus" (chunk 0) and links it to "hades" (chunk 2):
    // vector search and traversal overlap on chunk 0.
    let graph = Arc::new(MemoryGraphStore::new());
    graph
        .upsert_node_batch(vec![
            Entity::new("zeus", "god").with_provenance(Chunk::id_for(&url, 0)),
            Entity::new("hades", "god").with_provenance(Chunk::id_for(&url, 2)),
        ])
        .await
        .unwrap();
    graph
        .upsert_edge_batch(vec![Relation::new("zeus", "hades", "brother_of")])
        .await
        .unwrap();

    let completion = Arc::new(MockCompletionProvider::new("merged answer"));
    let engine = HybridQueryEngine::new(
        embeddings,
        completion.clone(),
        store,
        graph,
        RagConfig::new(dir.path()).with_top_k(2),
    );

    let answer = engine
        .query("zeus rules olympus with thunder", QueryMode::Hybrid)
        .await
        .unwrap();

    // Vector search returns chunks 0 and one other; graph adds chunk 2.
    // Chunk 0 appears once despite being in both result sets.
    let unique: std::collections::HashSet<_> = answer.sources.iter().collect();
    assert_eq!(unique.len(), answer.sources.len(), "no duplicate sources");
    assert!(answer.sources.contains(&Chunk::id_for(&url, 0)));
    assert!(answer.sources.contains(&Chunk::id_for(&url, 2)));
    // The chunk that scored in both modes ranks first.
    assert_eq!(answer.sources[0], Chunk::id_for(&url, 0));

    let prompt = completion.last_prompt().unwrap();
    assert!(prompt.contains("zeus rules olympus"));
}

#[tokio::test]
async fn empty_retrieval_still_yields_an_answer() {
    let dir = tempdir().unwrap();
    let (rag, _, completion) = build_rag(dir.path()).await;

    let answer = rag
        .query("anything at all", QueryMode::Hybrid)
        .await
        .unwrap();
    assert_eq!(answer.text, "grounded answer text");
    assert!(answer.sources.is_empty());

    let prompt = completion.last_prompt().unwrap();
    assert!(prompt.contains("No relevant context was retrieved"));
}

#[tokio::test]
async fn completed_turn_commits_exactly_two_messages() {
    let dir = tempdir().unwrap();
    let (rag, _, _) = build_rag(dir.path()).await;
    rag.insert(&three_paragraph_doc()).await.unwrap();

    let session = rag.session(QueryMode::Hybrid).unwrap();
    assert_eq!(session.history().len(), 0);

    let stream = session.send("What does Tokio drive?").unwrap();
    let mut deltas = 0;
    let mut final_text = String::new();
    while let Some(event) = stream.next().await {
        match event {
            TurnEvent::Delta(_) => deltas += 1,
            TurnEvent::End { text, .. } => {
                final_text = text;
                break;
            }
            TurnEvent::Error(message) => panic!("turn failed: {message}"),
        }
    }
    assert!(deltas > 1, "mock completion streams word by word");
    assert_eq!(final_text, "grounded answer text");
    assert_eq!(session.history().len(), 2);

    // Status went back to idle once the turn committed.
    assert!(!rag.status().unwrap().busy);
}

/// Completion provider whose delta stream is driven by the test.
struct ManualCompletion {
    stream: Mutex<Option<DeltaStream>>,
}

#[async_trait]
impl CompletionProvider for ManualCompletion {
    async fn complete(&self, _prompt: &str) -> Result<String, RagError> {
        Ok("unused".to_string())
    }

    async fn complete_stream(&self, _prompt: &str) -> Result<DeltaStream, RagError> {
        self.stream
            .lock()
            .take()
            .ok_or_else(|| RagError::Query("stream already taken".to_string()))
    }
}

#[tokio::test]
async fn cancelled_turn_leaves_history_untouched_and_pipeline_idle() {
    let dir = tempdir().unwrap();
    let (delta_tx, delta_rx) = flume::unbounded();
    let completion = Arc::new(ManualCompletion {
        stream: Mutex::new(Some(delta_rx)),
    });

    let mut rag = Rag::new(
        small_chunk_config(dir.path()),
        Arc::new(MockEmbeddingProvider::new(16)),
        completion,
        Arc::new(MockExtractor),
    );
    rag.initialize().await.unwrap();

    let session = rag.session(QueryMode::Hybrid).unwrap();
    let stream = session.send("partial question").unwrap();

    delta_tx.send(Ok("partial ".to_string())).unwrap();
    let first = stream.next().await;
    assert_eq!(first, Some(TurnEvent::Delta("partial ".to_string())));

    // Client walks away mid-stream.
    stream.cancel();

    // The next delta hits the closed channel and aborts the turn.
    delta_tx.send(Ok("answer".to_string())).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    assert_eq!(session.history().len(), 0, "no partial commit");
    assert!(!rag.status().unwrap().busy, "cancelled turn released its job");
}

#[tokio::test]
async fn query_round_trip_over_ingested_corpus() {
    let dir = tempdir().unwrap();
    let (rag, _, completion) = build_rag(dir.path()).await;
    rag.insert(&three_paragraph_doc()).await.unwrap();

    let answer = rag
        .query("How does Weavegraph schedule Nodes?", QueryMode::Hybrid)
        .await
        .unwrap();
    assert_eq!(answer.text, "grounded answer text");
    assert!(!answer.sources.is_empty());

    let prompt = completion.last_prompt().unwrap();
    assert!(prompt.contains("Weavegraph schedules Nodes"));
    assert!(!prompt.contains("No relevant context"));
}
