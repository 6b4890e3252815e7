//! ragweave: hybrid vector + knowledge-graph retrieval with streaming
//! sessions.
//!
//! A corpus flows through the pipeline like this:
//!
//! ```text
//! Source URL ──► ingestion::fetch ──► DocumentCache (working dir)
//!                        │
//!                        ▼
//!          ingestion::chunker (boundary-aware, budgeted)
//!                        │
//!          ┌─────────────┴──────────────┐
//!          ▼                            ▼
//! providers::extraction        providers::embeddings
//!   entities / relations          batched vectors
//!          │                            │
//!          ▼                            ▼
//! stores::graph (batched           stores::sqlite
//!   node/edge upserts)            (sqlite-vec search)
//!          │                            │
//!          └───────────┬────────────────┘
//!                      ▼
//!          engine::HybridQueryEngine
//!            vector ∪ graph, ranked
//!                      │
//!                      ▼
//!          session::StreamingSession
//!        deltas ──► commit ──► history
//! ```
//!
//! The [`rag::Rag`] facade wires everything together: construct it with your
//! embedding/completion/extraction providers, call
//! [`initialize`](rag::Rag::initialize) once, then `insert` documents and
//! `query` or open a streaming [`session`](rag::Rag::session). The
//! [`status::PipelineStatusCoordinator`] tracks in-flight jobs; queries read
//! the last-committed index state and are never blocked by ingestion.

pub mod config;
pub mod engine;
pub mod ingestion;
pub mod providers;
pub mod rag;
pub mod session;
pub mod status;
pub mod stores;
pub mod types;

pub use config::{GraphConnection, RagConfig};
pub use engine::{Answer, HybridQueryEngine, QueryMode};
pub use ingestion::{IngestReport, Ingestor};
pub use rag::Rag;
pub use session::{Message, MessagePart, SessionHistory, StreamingSession, TurnEvent, TurnStream};
pub use status::{PipelineStatus, PipelineStatusCoordinator};
pub use types::{Chunk, Document, Entity, RagError, Relation, Subgraph};
