//! Knowledge-graph storage: backend trait, in-memory petgraph store, and the
//! batching adapter that partitions writes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::RwLock;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::types::{Entity, RagError, Relation, Subgraph, canonicalize};

/// Graph backend with upsert-by-key write semantics.
///
/// Each batch write is atomic from a reader's point of view. Entities are
/// keyed by canonical name; relations by (source, target, type). Writing an
/// existing key merges provenance instead of duplicating.
#[async_trait]
pub trait GraphBackend: Send + Sync {
    /// Upsert one batch of entities. The caller has already partitioned to
    /// the configured batch size.
    async fn upsert_node_batch(&self, nodes: Vec<Entity>) -> Result<(), RagError>;

    /// Upsert one batch of relations. Missing endpoints are created as bare
    /// entities so provenance never dangles.
    async fn upsert_edge_batch(&self, edges: Vec<Relation>) -> Result<(), RagError>;

    /// Canonical names of stored entities matching any of the given terms.
    async fn match_entities(&self, terms: &[String]) -> Result<Vec<String>, RagError>;

    /// Entities and relations reachable from the seeds within `hop_limit`
    /// hops (direction-agnostic), with hop distance per entity.
    async fn traverse(&self, seeds: &[String], hop_limit: usize) -> Result<Subgraph, RagError>;

    async fn node_count(&self) -> Result<usize, RagError>;

    async fn edge_count(&self) -> Result<usize, RagError>;
}

/// In-memory graph backend over a petgraph `DiGraph`.
///
/// The default backend for local corpora and tests; single-writer access is
/// enforced by the interior `RwLock`.
#[derive(Default)]
pub struct MemoryGraphStore {
    inner: RwLock<GraphInner>,
}

#[derive(Default)]
struct GraphInner {
    graph: DiGraph<Entity, Relation>,
    index: HashMap<String, NodeIndex>,
}

impl GraphInner {
    fn upsert_entity(&mut self, entity: Entity) -> NodeIndex {
        let key = entity.canonical_name();
        match self.index.get(&key) {
            Some(&idx) => {
                if let Some(existing) = self.graph.node_weight_mut(idx) {
                    existing.merge(&entity);
                }
                idx
            }
            None => {
                let idx = self.graph.add_node(entity);
                self.index.insert(key, idx);
                idx
            }
        }
    }

    fn upsert_relation(&mut self, relation: Relation) {
        let source_idx = self.ensure_endpoint(&relation.source);
        let target_idx = self.ensure_endpoint(&relation.target);

        let rel_key = canonicalize(&relation.rel_type);
        let existing = self
            .graph
            .edges_connecting(source_idx, target_idx)
            .find(|edge| canonicalize(&edge.weight().rel_type) == rel_key)
            .map(|edge| edge.id());

        match existing {
            Some(edge_idx) => {
                if let Some(edge) = self.graph.edge_weight_mut(edge_idx) {
                    edge.merge(&relation);
                }
            }
            None => {
                self.graph.add_edge(source_idx, target_idx, relation);
            }
        }
    }

    fn ensure_endpoint(&mut self, name: &str) -> NodeIndex {
        let key = canonicalize(name);
        if let Some(&idx) = self.index.get(&key) {
            return idx;
        }
        let idx = self.graph.add_node(Entity::new(name, ""));
        self.index.insert(key, idx);
        idx
    }
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphBackend for MemoryGraphStore {
    async fn upsert_node_batch(&self, nodes: Vec<Entity>) -> Result<(), RagError> {
        let mut inner = self.inner.write();
        for entity in nodes {
            inner.upsert_entity(entity);
        }
        Ok(())
    }

    async fn upsert_edge_batch(&self, edges: Vec<Relation>) -> Result<(), RagError> {
        let mut inner = self.inner.write();
        for relation in edges {
            inner.upsert_relation(relation);
        }
        Ok(())
    }

    async fn match_entities(&self, terms: &[String]) -> Result<Vec<String>, RagError> {
        let inner = self.inner.read();
        let terms: HashSet<String> = terms.iter().map(|t| canonicalize(t)).collect();
        let mut matched: Vec<String> = inner
            .index
            .keys()
            .filter(|name| terms.contains(*name))
            .cloned()
            .collect();
        matched.sort();
        Ok(matched)
    }

    async fn traverse(&self, seeds: &[String], hop_limit: usize) -> Result<Subgraph, RagError> {
        let inner = self.inner.read();

        // Breadth-first from all seeds at once; hop distance is the distance
        // to the nearest seed.
        let mut distance: HashMap<NodeIndex, usize> = HashMap::new();
        let mut queue: VecDeque<NodeIndex> = VecDeque::new();
        for seed in seeds {
            if let Some(&idx) = inner.index.get(&canonicalize(seed)) {
                distance.entry(idx).or_insert(0);
                queue.push_back(idx);
            }
        }

        while let Some(idx) = queue.pop_front() {
            let hops = distance[&idx];
            if hops >= hop_limit {
                continue;
            }
            for neighbor in inner.graph.neighbors_undirected(idx) {
                if !distance.contains_key(&neighbor) {
                    distance.insert(neighbor, hops + 1);
                    queue.push_back(neighbor);
                }
            }
        }

        let mut entities: Vec<(Entity, usize)> = distance
            .iter()
            .filter_map(|(&idx, &hops)| {
                inner
                    .graph
                    .node_weight(idx)
                    .map(|entity| (entity.clone(), hops))
            })
            .collect();
        entities.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.name.cmp(&b.0.name)));

        let relations: Vec<Relation> = inner
            .graph
            .edge_references()
            .filter(|edge| {
                distance.contains_key(&edge.source()) && distance.contains_key(&edge.target())
            })
            .map(|edge| edge.weight().clone())
            .collect();

        Ok(Subgraph {
            entities,
            relations,
        })
    }

    async fn node_count(&self) -> Result<usize, RagError> {
        Ok(self.inner.read().graph.node_count())
    }

    async fn edge_count(&self) -> Result<usize, RagError> {
        Ok(self.inner.read().graph.edge_count())
    }
}

/// Result of one partitioned graph write.
///
/// Every batch is attempted even when an earlier one fails, so a transient
/// backend error costs exactly the batches it hit; the caller retries those
/// by index instead of re-sending the whole job.
#[derive(Debug, Default)]
pub struct BatchWriteOutcome {
    /// Number of batches dispatched.
    pub batches: usize,
    /// Items carried by the batches that landed.
    pub items_written: usize,
    /// One [`RagError::GraphWrite`] per failed batch, ascending by index.
    pub failures: Vec<RagError>,
}

impl BatchWriteOutcome {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Indices of the failed batches, ascending.
    pub fn failed_indices(&self) -> Vec<usize> {
        self.failures
            .iter()
            .filter_map(|err| match err {
                RagError::GraphWrite { batch_index, .. } => Some(*batch_index),
                _ => None,
            })
            .collect()
    }
}

/// Partitions node and edge writes into bounded batches before handing them
/// to a [`GraphBackend`].
///
/// For an input of size M and batch size B the adapter issues exactly
/// ⌈M/B⌉ writes, none exceeding B, dispatched with bounded concurrency. A
/// failed batch is reported with its index so the caller can retry at batch
/// granularity.
#[derive(Clone)]
pub struct GraphAdapter {
    backend: Arc<dyn GraphBackend>,
    node_batch_size: usize,
    edge_batch_size: usize,
    max_concurrent: usize,
}

impl GraphAdapter {
    pub fn new(
        backend: Arc<dyn GraphBackend>,
        node_batch_size: usize,
        edge_batch_size: usize,
        max_concurrent: usize,
    ) -> Self {
        Self {
            backend,
            node_batch_size: node_batch_size.max(1),
            edge_batch_size: edge_batch_size.max(1),
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// The backend this adapter writes to (used by the query path for
    /// traversal).
    pub fn backend(&self) -> Arc<dyn GraphBackend> {
        Arc::clone(&self.backend)
    }

    /// Upsert entities in batches of at most the configured node batch size.
    pub async fn upsert_nodes(&self, nodes: Vec<Entity>) -> BatchWriteOutcome {
        let batches: Vec<Vec<Entity>> = nodes
            .chunks(self.node_batch_size)
            .map(<[Entity]>::to_vec)
            .collect();
        let total = batches.len();

        let results = stream::iter(batches.into_iter().enumerate())
            .map(|(batch_index, batch)| {
                let backend = Arc::clone(&self.backend);
                async move {
                    let size = batch.len();
                    tracing::debug!(batch_index, total, size, "node batch write");
                    (batch_index, size, backend.upsert_node_batch(batch).await)
                }
            })
            .buffer_unordered(self.max_concurrent)
            .collect::<Vec<_>>()
            .await;
        collect_outcome(results)
    }

    /// Upsert relations in batches of at most the configured edge batch size.
    pub async fn upsert_edges(&self, edges: Vec<Relation>) -> BatchWriteOutcome {
        let batches: Vec<Vec<Relation>> = edges
            .chunks(self.edge_batch_size)
            .map(<[Relation]>::to_vec)
            .collect();
        let total = batches.len();

        let results = stream::iter(batches.into_iter().enumerate())
            .map(|(batch_index, batch)| {
                let backend = Arc::clone(&self.backend);
                async move {
                    let size = batch.len();
                    tracing::debug!(batch_index, total, size, "edge batch write");
                    (batch_index, size, backend.upsert_edge_batch(batch).await)
                }
            })
            .buffer_unordered(self.max_concurrent)
            .collect::<Vec<_>>()
            .await;
        collect_outcome(results)
    }
}

fn collect_outcome(mut results: Vec<(usize, usize, Result<(), RagError>)>) -> BatchWriteOutcome {
    // buffer_unordered completes out of order.
    results.sort_by_key(|(batch_index, ..)| *batch_index);
    let mut outcome = BatchWriteOutcome {
        batches: results.len(),
        ..BatchWriteOutcome::default()
    };
    for (batch_index, size, result) in results {
        match result {
            Ok(()) => outcome.items_written += size,
            Err(err) => outcome.failures.push(RagError::GraphWrite {
                batch_index,
                message: err.to_string(),
            }),
        }
    }
    outcome
}
