use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::fs;
use tracing_subscriber::FmtSubscriber;
use url::Url;

use ragweave::engine::QueryMode;
use ragweave::providers::completion::MockCompletionProvider;
use ragweave::providers::embeddings::MockEmbeddingProvider;
use ragweave::providers::extraction::MockExtractor;
use ragweave::rag::Rag;
use ragweave::session::TurnEvent;
use ragweave::types::{Document, RagError};
use ragweave::RagConfig;

/// Walks the full pipeline offline: ingest a small corpus with mock
/// providers, run a hybrid query, then stream one conversational turn.
///
/// Set `RAGWEAVE_DIR` to choose the working directory (default
/// `./ragweave_demo`) and `RAGWEAVE_URL` to ingest a live page instead of
/// the built-in corpus.
#[tokio::main]
async fn main() -> Result<(), RagError> {
    init_tracing();

    let working_dir = env::var("RAGWEAVE_DIR").unwrap_or_else(|_| "./ragweave_demo".to_string());
    let working_dir = PathBuf::from(working_dir);
    fs::create_dir_all(&working_dir).await?;

    let config = RagConfig::new(&working_dir).with_max_chunk_chars(400);
    let mut rag = Rag::new(
        config,
        Arc::new(MockEmbeddingProvider::new(64)),
        Arc::new(MockCompletionProvider::new(
            "Weavegraph runs Nodes concurrently on a Tokio runtime, per the context.",
        )),
        Arc::new(MockExtractor),
    );
    rag.initialize().await?;

    let start = Instant::now();
    let mut chunks_written = 0usize;
    let mut entities_written = 0usize;

    if let Ok(live_url) = env::var("RAGWEAVE_URL") {
        let url = Url::parse(&live_url).map_err(|err| RagError::InvalidDocument(err.to_string()))?;
        println!("→ Fetching {}", url);
        let report = rag.insert_url(&url).await?;
        chunks_written += report.chunks_processed;
        entities_written += report.entities_written;
    } else {
        for document in builtin_corpus() {
            println!("→ Ingesting {}", document.source);
            let report = rag.insert(&document).await?;
            if !report.is_clean() {
                println!(
                    "   {} extraction failures recorded",
                    report.extraction_failures.len()
                );
            }
            chunks_written += report.chunks_processed;
            entities_written += report.entities_written;
        }
    }

    println!("\n✅ Ingestion complete!");
    println!("  chunks written  : {}", chunks_written);
    println!("  entities written: {}", entities_written);
    println!("  duration        : {:?}", start.elapsed());
    println!("  working dir     : {}", working_dir.display());

    let question = "How does Weavegraph schedule work?";
    let answer = rag.query(question, QueryMode::Hybrid).await?;
    println!("\nQ: {question}");
    println!("A: {}", answer.text);
    println!("   sources: {:?}", answer.sources);

    // Same question again, streamed through a session this time.
    let session = rag.session(QueryMode::Hybrid)?;
    let stream = session.send(question)?;
    print!("\nstreamed: ");
    while let Some(event) = stream.next().await {
        match event {
            TurnEvent::Delta(delta) => print!("{delta}"),
            TurnEvent::End { sources, .. } => {
                println!("\n   done ({} sources)", sources.len());
                break;
            }
            TurnEvent::Error(message) => {
                println!("\n   turn failed: {message}");
                break;
            }
        }
    }
    println!("history messages: {}", session.history().len());

    Ok(())
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let subscriber = FmtSubscriber::builder().with_env_filter("info").finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn builtin_corpus() -> Vec<Document> {
    let texts = [
        (
            "https://docs.example.com/weavegraph",
            "Weavegraph executes a workflow as a graph of Nodes.\n\n\
             Each Node runs on the Tokio runtime and exchanges state through Channels.\n\n\
             A Scheduler decides which Nodes are ready each superstep.",
        ),
        (
            "https://docs.example.com/ragsmith",
            "Ragsmith ingests Documents and splits them into semantic Chunks.\n\n\
             Chunks are embedded and stored in a Sqlite index for retrieval.",
        ),
    ];
    texts
        .iter()
        .map(|(url, text)| Document::new(Url::parse(url).unwrap(), *text))
        .collect()
}
