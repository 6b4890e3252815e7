//! Per-chunk entity/relation extraction.
//!
//! The pipeline does not fix an extraction algorithm; it delegates to an
//! [`EntityExtractor`]. [`CompletionExtractor`] is the production path — it
//! prompts a completion provider for structured JSON — while
//! [`MockExtractor`] gives deterministic output for tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use unicode_segmentation::UnicodeSegmentation;

use crate::providers::completion::CompletionProvider;
use crate::types::{Chunk, Entity, RagError, Relation};

/// Candidate entities and relations extracted from a single chunk.
///
/// Every entity and relation carries the chunk's id as provenance.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

/// Extracts entities and relations from one chunk.
///
/// A failure applies to that chunk only; the ingestor records it and moves on
/// to sibling chunks. Extraction must be safe to re-run: the same chunk with
/// the same extractor yields output that upserts without duplication.
#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(&self, chunk: &Chunk) -> Result<Extraction, RagError>;
}

const EXTRACTION_PROMPT: &str = "Extract the named entities and the directed relations between \
them from the passage below. Respond with JSON only, shaped as \
{\"entities\": [{\"name\": \"..\", \"type\": \"..\", \"description\": \"..\"}], \
\"relations\": [{\"source\": \"..\", \"target\": \"..\", \"type\": \"..\", \"description\": \"..\"}]}.\
\n\nPassage:\n";

#[derive(Debug, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    entities: Vec<RawEntity>,
    #[serde(default)]
    relations: Vec<RawRelation>,
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    name: String,
    #[serde(default, rename = "type")]
    entity_type: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct RawRelation {
    source: String,
    target: String,
    #[serde(default, rename = "type")]
    rel_type: String,
    #[serde(default)]
    description: String,
}

/// Extraction backed by a completion provider returning structured JSON.
pub struct CompletionExtractor {
    completion: Arc<dyn CompletionProvider>,
}

impl CompletionExtractor {
    pub fn new(completion: Arc<dyn CompletionProvider>) -> Self {
        Self { completion }
    }

    fn parse(chunk: &Chunk, raw: &str) -> Result<Extraction, RagError> {
        // Some models wrap JSON in code fences; strip to the outermost braces.
        let json = raw
            .find('{')
            .and_then(|start| raw.rfind('}').map(|end| &raw[start..=end]))
            .unwrap_or(raw);

        let parsed: RawExtraction =
            serde_json::from_str(json).map_err(|err| RagError::Extraction {
                chunk_id: chunk.id.clone(),
                message: format!("malformed extraction payload: {err}"),
            })?;

        let entities = parsed
            .entities
            .into_iter()
            .filter(|e| !e.name.trim().is_empty())
            .map(|e| {
                Entity::new(e.name, e.entity_type)
                    .with_description(e.description)
                    .with_provenance(chunk.id.clone())
            })
            .collect();

        let relations = parsed
            .relations
            .into_iter()
            .filter(|r| !r.source.trim().is_empty() && !r.target.trim().is_empty())
            .map(|r| {
                let mut relation = Relation::new(r.source, r.target, r.rel_type);
                relation.description = r.description;
                relation.with_provenance(chunk.id.clone())
            })
            .collect();

        Ok(Extraction {
            entities,
            relations,
        })
    }
}

#[async_trait]
impl EntityExtractor for CompletionExtractor {
    async fn extract(&self, chunk: &Chunk) -> Result<Extraction, RagError> {
        let prompt = format!("{EXTRACTION_PROMPT}{}", chunk.content);
        let raw = self
            .completion
            .complete(&prompt)
            .await
            .map_err(|err| RagError::Extraction {
                chunk_id: chunk.id.clone(),
                message: err.to_string(),
            })?;
        Self::parse(chunk, &raw)
    }
}

/// Deterministic extractor for tests and offline demos.
///
/// Treats every capitalized word as an entity and links consecutive entities
/// within a chunk with a `mentions_with` relation.
#[derive(Debug, Clone, Default)]
pub struct MockExtractor;

#[async_trait]
impl EntityExtractor for MockExtractor {
    async fn extract(&self, chunk: &Chunk) -> Result<Extraction, RagError> {
        let mut entities: Vec<Entity> = Vec::new();
        for word in chunk.content.unicode_words() {
            let capitalized = word.chars().next().is_some_and(char::is_uppercase);
            if !capitalized || word.len() < 3 {
                continue;
            }
            if entities
                .iter()
                .any(|e| e.canonical_name() == word.to_lowercase())
            {
                continue;
            }
            entities.push(Entity::new(word, "term").with_provenance(chunk.id.clone()));
        }

        let relations = entities
            .windows(2)
            .map(|pair| {
                Relation::new(pair[0].name.clone(), pair[1].name.clone(), "mentions_with")
                    .with_provenance(chunk.id.clone())
            })
            .collect();

        Ok(Extraction {
            entities,
            relations,
        })
    }
}
