//! Injected capability interfaces for the external model providers.
//!
//! The pipeline never talks to a model vendor directly. Embedding, completion,
//! and entity extraction are each behind a trait chosen at configuration time:
//!
//! * [`embeddings::EmbeddingProvider`] — batched text-to-vector with a fixed
//!   output dimension.
//! * [`completion::CompletionProvider`] — prompt-to-text, with a streaming
//!   variant that yields deltas over a channel.
//! * [`extraction::EntityExtractor`] — per-chunk entity/relation extraction,
//!   typically layered on a completion provider.
//!
//! Mock implementations live alongside each trait so the pipeline can be
//! exercised deterministically without network access.

pub mod completion;
pub mod embeddings;
pub mod extraction;

pub use completion::{CompletionProvider, DeltaStream, MockCompletionProvider};
pub use embeddings::{EmbeddingProvider, MockEmbeddingProvider};
pub use extraction::{CompletionExtractor, EntityExtractor, Extraction, MockExtractor};
