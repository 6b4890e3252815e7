//! Ingestion path: fetch, chunk, extract, embed, persist.
//!
//! * [`fetch`] — corpus fetcher with a working-directory document cache.
//! * [`chunker`] — boundary-aware splitting of documents into chunks.
//! * [`pipeline`] — the [`Ingestor`](pipeline::Ingestor) orchestrating the
//!   full ingestion of one document and reporting per-unit failures.

pub mod chunker;
pub mod fetch;
pub mod pipeline;

pub use chunker::split_document;
pub use fetch::{DocumentCache, FetchOutcome, fetch_document};
pub use pipeline::{IngestReport, Ingestor};
