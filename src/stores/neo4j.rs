//! Remote graph backend speaking Neo4j's transactional HTTP endpoint.
//!
//! Every batch write is a single `tx/commit` request, so the backend applies
//! it atomically; readers never observe half a batch. Connection settings
//! come from [`GraphConnection`], typically loaded from the environment.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use url::Url;

use crate::config::GraphConnection;
use crate::types::{Entity, RagError, Relation, Subgraph, canonicalize};

use super::graph::GraphBackend;

const UPSERT_NODES: &str = "UNWIND $batch AS row \
MERGE (e:Entity {key: row.key}) \
ON CREATE SET e.name = row.name, e.type = row.type, \
              e.description = row.description, e.chunks = row.chunks \
ON MATCH SET \
    e.type = CASE WHEN e.type = '' THEN row.type ELSE e.type END, \
    e.description = CASE WHEN e.description = '' THEN row.description ELSE e.description END, \
    e.chunks = e.chunks + [c IN row.chunks WHERE NOT c IN e.chunks]";

const UPSERT_EDGES: &str = "UNWIND $batch AS row \
MERGE (s:Entity {key: row.source}) ON CREATE SET s.name = row.source_name, s.type = '', s.description = '', s.chunks = [] \
MERGE (t:Entity {key: row.target}) ON CREATE SET t.name = row.target_name, t.type = '', t.description = '', t.chunks = [] \
MERGE (s)-[r:RELATED {type: row.type}]->(t) \
ON CREATE SET r.description = row.description, r.weight = row.weight, r.chunks = row.chunks \
ON MATCH SET r.weight = r.weight + row.weight, \
             r.chunks = r.chunks + [c IN row.chunks WHERE NOT c IN r.chunks]";

const MATCH_ENTITIES: &str = "MATCH (e:Entity) WHERE e.key IN $terms RETURN e.key ORDER BY e.key";

/// Graph backend over Neo4j's `db/{name}/tx/commit` HTTP API.
pub struct Neo4jHttpStore {
    client: Client,
    connection: GraphConnection,
    endpoint: Url,
}

impl Neo4jHttpStore {
    pub fn new(client: Client, connection: GraphConnection) -> Result<Self, RagError> {
        let endpoint = connection
            .uri
            .join(&format!("db/{}/tx/commit", connection.database))
            .map_err(|err| RagError::Config(format!("invalid graph endpoint: {err}")))?;
        Ok(Self {
            client,
            connection,
            endpoint,
        })
    }

    /// Runs one Cypher statement in an auto-committed transaction and returns
    /// the result rows.
    async fn run(&self, statement: &str, parameters: Value) -> Result<Vec<Vec<Value>>, RagError> {
        let body = json!({
            "statements": [{
                "statement": statement,
                "parameters": parameters,
            }]
        });

        let response = self
            .client
            .post(self.endpoint.clone())
            .basic_auth(&self.connection.username, Some(&self.connection.password))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let payload: Value = response.json().await?;
        if let Some(errors) = payload.get("errors").and_then(Value::as_array) {
            if let Some(first) = errors.first() {
                let code = first.get("code").and_then(Value::as_str).unwrap_or("unknown");
                let message = first
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("no message");
                return Err(RagError::Storage(format!(
                    "graph backend rejected statement ({code}): {message}"
                )));
            }
        }

        let rows = payload
            .get("results")
            .and_then(Value::as_array)
            .and_then(|results| results.first())
            .and_then(|result| result.get("data"))
            .and_then(Value::as_array)
            .map(|data| {
                data.iter()
                    .filter_map(|entry| entry.get("row").and_then(Value::as_array).cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }
}

fn entity_from_row(row: &[Value]) -> Option<(Entity, usize)> {
    let name = row.get(1).and_then(Value::as_str)?.to_string();
    let entity = Entity {
        name,
        entity_type: row
            .get(2)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        description: row
            .get(3)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        source_chunks: string_array(row.get(4)),
    };
    let hops = row.get(5).and_then(Value::as_u64).unwrap_or(0) as usize;
    Some((entity, hops))
}

fn string_array(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl GraphBackend for Neo4jHttpStore {
    async fn upsert_node_batch(&self, nodes: Vec<Entity>) -> Result<(), RagError> {
        if nodes.is_empty() {
            return Ok(());
        }
        let batch: Vec<Value> = nodes
            .iter()
            .map(|entity| {
                json!({
                    "key": entity.canonical_name(),
                    "name": entity.name,
                    "type": entity.entity_type,
                    "description": entity.description,
                    "chunks": entity.source_chunks,
                })
            })
            .collect();
        self.run(UPSERT_NODES, json!({ "batch": batch })).await?;
        Ok(())
    }

    async fn upsert_edge_batch(&self, edges: Vec<Relation>) -> Result<(), RagError> {
        if edges.is_empty() {
            return Ok(());
        }
        let batch: Vec<Value> = edges
            .iter()
            .map(|relation| {
                json!({
                    "source": canonicalize(&relation.source),
                    "source_name": relation.source,
                    "target": canonicalize(&relation.target),
                    "target_name": relation.target,
                    "type": canonicalize(&relation.rel_type),
                    "description": relation.description,
                    "weight": relation.weight,
                    "chunks": relation.source_chunks,
                })
            })
            .collect();
        self.run(UPSERT_EDGES, json!({ "batch": batch })).await?;
        Ok(())
    }

    async fn match_entities(&self, terms: &[String]) -> Result<Vec<String>, RagError> {
        let canonical: Vec<String> = terms.iter().map(|t| canonicalize(t)).collect();
        let rows = self
            .run(MATCH_ENTITIES, json!({ "terms": canonical }))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.first().and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    async fn traverse(&self, seeds: &[String], hop_limit: usize) -> Result<Subgraph, RagError> {
        let canonical: Vec<String> = seeds.iter().map(|s| canonicalize(s)).collect();

        // Variable-length patterns cannot take a parameterized bound, so the
        // hop limit is formatted into the statement.
        let entity_statement = format!(
            "MATCH p = (s:Entity)-[*0..{hop_limit}]-(m:Entity) WHERE s.key IN $seeds \
             RETURN m.key, m.name, m.type, m.description, m.chunks, min(length(p)) AS hops \
             ORDER BY hops, m.key"
        );
        let entity_rows = self
            .run(&entity_statement, json!({ "seeds": canonical }))
            .await?;
        let entities: Vec<(Entity, usize)> = entity_rows
            .iter()
            .filter_map(|row| entity_from_row(row))
            .collect();

        let relation_statement = format!(
            "MATCH p = (s:Entity)-[*0..{hop_limit}]-(:Entity) WHERE s.key IN $seeds \
             UNWIND relationships(p) AS rel \
             WITH DISTINCT rel \
             MATCH (a)-[rel]->(b) \
             RETURN a.name, b.name, rel.type, rel.description, rel.weight, rel.chunks"
        );
        let relation_rows = self
            .run(&relation_statement, json!({ "seeds": canonical }))
            .await?;
        let relations: Vec<Relation> = relation_rows
            .iter()
            .filter_map(|row| {
                Some(Relation {
                    source: row.first().and_then(Value::as_str)?.to_string(),
                    target: row.get(1).and_then(Value::as_str)?.to_string(),
                    rel_type: row
                        .get(2)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    description: row
                        .get(3)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    weight: row.get(4).and_then(Value::as_f64).unwrap_or(1.0) as f32,
                    source_chunks: string_array(row.get(5)),
                })
            })
            .collect();

        Ok(Subgraph {
            entities,
            relations,
        })
    }

    async fn node_count(&self) -> Result<usize, RagError> {
        let rows = self.run("MATCH (e:Entity) RETURN count(e)", json!({})).await?;
        Ok(rows
            .first()
            .and_then(|row| row.first())
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }

    async fn edge_count(&self) -> Result<usize, RagError> {
        let rows = self
            .run("MATCH ()-[r:RELATED]->() RETURN count(r)", json!({}))
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.first())
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn store_for(server: &MockServer) -> Neo4jHttpStore {
        let connection = GraphConnection::new(
            Url::parse(&server.base_url()).unwrap(),
            "neo4j",
            "secret",
        );
        Neo4jHttpStore::new(Client::new(), connection).unwrap()
    }

    #[tokio::test]
    async fn node_batch_posts_to_tx_commit() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/db/neo4j/tx/commit")
                    .body_contains("UNWIND $batch AS row");
                then.status(200)
                    .json_body(serde_json::json!({ "results": [], "errors": [] }));
            })
            .await;

        let store = store_for(&server);
        store
            .upsert_node_batch(vec![Entity::new("Tokio", "runtime").with_provenance("c1")])
            .await
            .unwrap();
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn backend_errors_surface_as_storage_errors() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/db/neo4j/tx/commit");
                then.status(200).json_body(serde_json::json!({
                    "results": [],
                    "errors": [{ "code": "Neo.ClientError", "message": "boom" }]
                }));
            })
            .await;

        let store = store_for(&server);
        let err = store
            .upsert_node_batch(vec![Entity::new("x", "")])
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Storage(_)));
    }

    #[tokio::test]
    async fn match_entities_parses_rows() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/db/neo4j/tx/commit");
                then.status(200).json_body(serde_json::json!({
                    "results": [{ "columns": ["e.key"], "data": [
                        { "row": ["tokio"] },
                        { "row": ["rust"] }
                    ]}],
                    "errors": []
                }));
            })
            .await;

        let store = store_for(&server);
        let matched = store
            .match_entities(&["Tokio".to_string(), "Rust".to_string()])
            .await
            .unwrap();
        assert_eq!(matched, vec!["tokio".to_string(), "rust".to_string()]);
    }
}
