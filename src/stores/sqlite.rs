//! SQLite chunk store with vector search via `sqlite-vec`.

use std::mem::transmute;
use std::os::raw::c_char;
use std::path::Path;
use std::sync::Once;

use async_trait::async_trait;
use tokio_rusqlite::{Connection, OptionalExtension, ffi, rusqlite};

use crate::types::{Chunk, RagError};

use super::{ChunkRecord, VectorBackend};

/// Chunk store backed by a single SQLite database under the working
/// directory.
///
/// Chunk bodies live in `chunks`; embeddings live in `chunk_embeddings` as
/// JSON float arrays and are compared with `vec_distance_cosine` at query
/// time. The embedding dimension is pinned in `index_meta` when the store is
/// first opened and enforced on every insert.
#[derive(Clone)]
pub struct SqliteChunkStore {
    conn: Connection,
    dimensions: usize,
}

impl SqliteChunkStore {
    /// Opens (or creates) a store at `path` for embeddings of the given
    /// dimension. Fails if the store was created with a different dimension.
    pub async fn open(path: impl AsRef<Path>, dimensions: usize) -> Result<Self, RagError> {
        Self::register_sqlite_vec()?;
        let conn = Connection::open(path)
            .await
            .map_err(|err| RagError::Storage(err.to_string()))?;

        let pinned: Option<String> = conn
            .call(move |conn| {
                // Confirm the extension registered before touching the schema.
                conn.query_row("select vec_version()", [], |row| row.get::<_, String>(0))?;

                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS chunks (
                         id TEXT PRIMARY KEY,
                         source TEXT NOT NULL,
                         chunk_index INTEGER NOT NULL,
                         content TEXT NOT NULL
                     );
                     CREATE INDEX IF NOT EXISTS chunks_source ON chunks (source);
                     CREATE TABLE IF NOT EXISTS chunk_embeddings (
                         id TEXT PRIMARY KEY,
                         embedding TEXT NOT NULL
                     );
                     CREATE TABLE IF NOT EXISTS index_meta (
                         key TEXT PRIMARY KEY,
                         value TEXT NOT NULL
                     );",
                )?;

                let existing: Option<String> = conn
                    .query_row(
                        "SELECT value FROM index_meta WHERE key = 'dimensions'",
                        [],
                        |row| row.get(0),
                    )
                    .optional()?;

                if existing.is_none() {
                    conn.execute(
                        "INSERT INTO index_meta (key, value) VALUES ('dimensions', ?1)",
                        [dimensions.to_string()],
                    )?;
                }
                Ok::<_, rusqlite::Error>(existing)
            })
            .await
            .map_err(|err| RagError::Storage(err.to_string()))?;

        if let Some(value) = pinned {
            if value != dimensions.to_string() {
                return Err(RagError::Storage(format!(
                    "store was created with dimension {value}, provider outputs {dimensions}"
                )));
            }
        }

        Ok(Self { conn, dimensions })
    }

    /// The embedding dimension this store was opened with.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn register_sqlite_vec() -> Result<(), RagError> {
        use std::sync::Mutex;

        static INIT: Once = Once::new();
        static INIT_RESULT: Mutex<Option<Result<(), String>>> = Mutex::new(None);

        INIT.call_once(|| {
            let result = unsafe {
                type SqliteExtensionInit = unsafe extern "C" fn(
                    *mut ffi::sqlite3,
                    *mut *mut c_char,
                    *const ffi::sqlite3_api_routines,
                ) -> i32;

                let init: unsafe extern "C" fn() = sqlite_vec::sqlite3_vec_init;
                let init_fn: SqliteExtensionInit =
                    transmute::<unsafe extern "C" fn(), SqliteExtensionInit>(init);
                let rc = ffi::sqlite3_auto_extension(Some(init_fn));
                if rc != 0 {
                    Err(format!(
                        "failed to register sqlite-vec extension (code {rc})"
                    ))
                } else {
                    Ok(())
                }
            };
            *INIT_RESULT.lock().expect("init result mutex poisoned") = Some(result);
        });

        INIT_RESULT
            .lock()
            .expect("init result mutex poisoned")
            .clone()
            .expect("init was called but result not set")
            .map_err(RagError::Storage)
    }
}

fn row_to_record(
    id: String,
    source: String,
    index: i64,
    content: String,
    embedding: Option<String>,
) -> ChunkRecord {
    ChunkRecord {
        chunk: Chunk {
            id,
            source,
            index: index.max(0) as usize,
            content,
        },
        embedding: embedding.and_then(|json| serde_json::from_str(&json).ok()),
    }
}

#[async_trait]
impl VectorBackend for SqliteChunkStore {
    async fn insert_chunks(&self, records: Vec<ChunkRecord>) -> Result<(), RagError> {
        if records.is_empty() {
            return Ok(());
        }
        // Validate dimensions and serialize vectors before entering the
        // connection task, so the closure only talks to SQLite.
        let mut rows: Vec<(Chunk, Option<String>)> = Vec::with_capacity(records.len());
        for record in records {
            let json = match &record.embedding {
                Some(embedding) if embedding.len() != self.dimensions => {
                    return Err(RagError::Storage(format!(
                        "embedding for chunk {} has dimension {}, store expects {}",
                        record.chunk.id,
                        embedding.len(),
                        self.dimensions
                    )));
                }
                Some(embedding) => Some(
                    serde_json::to_string(embedding)
                        .map_err(|err| RagError::Storage(err.to_string()))?,
                ),
                None => None,
            };
            rows.push((record.chunk, json));
        }

        self.conn
            .call(move |conn| {
                // One transaction per batch: readers see all rows or none.
                let tx = conn.transaction()?;
                for (chunk, embedding_json) in rows {
                    tx.execute(
                        "INSERT OR REPLACE INTO chunks (id, source, chunk_index, content) \
                         VALUES (?1, ?2, ?3, ?4)",
                        (&chunk.id, &chunk.source, chunk.index as i64, &chunk.content),
                    )?;

                    if let Some(json) = embedding_json {
                        tx.execute(
                            "INSERT OR REPLACE INTO chunk_embeddings (id, embedding) \
                             VALUES (?1, ?2)",
                            (&chunk.id, &json),
                        )?;
                    }
                }
                tx.commit()?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|err| RagError::Storage(err.to_string()))
    }

    async fn get_chunk_by_id(&self, id: &str) -> Result<Option<ChunkRecord>, RagError> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT c.id, c.source, c.chunk_index, c.content, e.embedding \
                     FROM chunks c LEFT JOIN chunk_embeddings e ON c.id = e.id \
                     WHERE c.id = ?1",
                    [&id],
                    |row| {
                        Ok(row_to_record(
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                        ))
                    },
                )
                .optional()
            })
            .await
            .map_err(|err| RagError::Storage(err.to_string()))
    }

    async fn get_chunks_by_source(&self, source: &str) -> Result<Vec<ChunkRecord>, RagError> {
        let source = source.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT c.id, c.source, c.chunk_index, c.content, e.embedding \
                     FROM chunks c LEFT JOIN chunk_embeddings e ON c.id = e.id \
                     WHERE c.source = ?1 ORDER BY c.chunk_index ASC",
                )?;

                let rows = stmt.query_map([&source], |row| {
                    Ok(row_to_record(
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                })?;

                rows.collect::<Result<Vec<_>, _>>()
            })
            .await
            .map_err(|err| RagError::Storage(err.to_string()))
    }

    async fn search_similar(
        &self,
        query_embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<(ChunkRecord, f32)>, RagError> {
        if query_embedding.len() != self.dimensions {
            return Err(RagError::Storage(format!(
                "query embedding has dimension {}, store expects {}",
                query_embedding.len(),
                self.dimensions
            )));
        }
        let embedding_json = serde_json::to_string(query_embedding)
            .map_err(|err| RagError::Storage(err.to_string()))?;

        self.conn
            .call(move |conn| {
                // Cosine distance via sqlite-vec; ties broken by chunk id so
                // result order is stable across runs.
                let mut stmt = conn.prepare(&format!(
                    "SELECT c.id, c.source, c.chunk_index, c.content, e.embedding, \
                     vec_distance_cosine(vec_f32(e.embedding), vec_f32(?1)) AS distance \
                     FROM chunks c \
                     JOIN chunk_embeddings e ON c.id = e.id \
                     ORDER BY distance ASC, c.id ASC \
                     LIMIT {top_k}"
                ))?;

                let rows = stmt.query_map([&embedding_json], |row| {
                    let record = row_to_record(
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    );
                    let distance: f32 = row.get(5)?;
                    Ok((record, 1.0 - distance))
                })?;

                rows.collect::<Result<Vec<_>, _>>()
            })
            .await
            .map_err(|err| RagError::Storage(err.to_string()))
    }

    async fn count(&self) -> Result<usize, RagError> {
        self.conn
            .call(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
                Ok::<_, rusqlite::Error>(count as usize)
            })
            .await
            .map_err(|err| RagError::Storage(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use url::Url;

    fn record(index: usize, content: &str, embedding: Vec<f32>) -> ChunkRecord {
        let url = Url::parse("https://example.com/doc").unwrap();
        ChunkRecord::new(Chunk::new(&url, index, content)).with_embedding(embedding)
    }

    #[tokio::test]
    async fn insert_is_keyed_upsert() {
        let dir = tempdir().unwrap();
        let store = SqliteChunkStore::open(dir.path().join("chunks.sqlite"), 3)
            .await
            .unwrap();

        let records = vec![
            record(0, "alpha", vec![1.0, 0.0, 0.0]),
            record(1, "beta", vec![0.0, 1.0, 0.0]),
        ];
        store.insert_chunks(records.clone()).await.unwrap();
        store.insert_chunks(records).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn search_orders_by_similarity() {
        let dir = tempdir().unwrap();
        let store = SqliteChunkStore::open(dir.path().join("chunks.sqlite"), 3)
            .await
            .unwrap();

        store
            .insert_chunks(vec![
                record(0, "close", vec![1.0, 0.0, 0.0]),
                record(1, "closer", vec![0.9, 0.1, 0.0]),
                record(2, "far", vec![0.0, 0.0, 1.0]),
            ])
            .await
            .unwrap();

        let results = store.search_similar(&[1.0, 0.0, 0.0], 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0.chunk.content, "close");
        assert_eq!(results[1].0.chunk.content, "closer");
        assert!(results[0].1 >= results[1].1);
    }

    #[tokio::test]
    async fn chunks_by_source_come_back_in_document_order() {
        let dir = tempdir().unwrap();
        let store = SqliteChunkStore::open(dir.path().join("chunks.sqlite"), 3)
            .await
            .unwrap();

        store
            .insert_chunks(vec![
                record(1, "second", vec![0.0, 1.0, 0.0]),
                record(0, "first", vec![1.0, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let url = Url::parse("https://example.com/doc").unwrap();
        let records = store.get_chunks_by_source(url.as_str()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].chunk.content, "first");
        assert_eq!(records[1].chunk.content, "second");
        assert!(records.iter().all(|r| r.embedding.is_some()));

        let other = store.get_chunks_by_source("https://other.com/").await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let store = SqliteChunkStore::open(dir.path().join("chunks.sqlite"), 3)
            .await
            .unwrap();

        let bad = record(0, "bad", vec![1.0, 0.0]);
        let err = store.insert_chunks(vec![bad]).await.unwrap_err();
        assert!(matches!(err, RagError::Storage(_)));
    }

    #[tokio::test]
    async fn reopening_with_other_dimension_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.sqlite");
        SqliteChunkStore::open(&path, 3).await.unwrap();
        assert!(SqliteChunkStore::open(&path, 8).await.is_err());
    }

    #[tokio::test]
    async fn chunks_without_embeddings_are_stored_but_unsearchable() {
        let dir = tempdir().unwrap();
        let store = SqliteChunkStore::open(dir.path().join("chunks.sqlite"), 3)
            .await
            .unwrap();

        let url = Url::parse("https://example.com/doc").unwrap();
        store
            .insert_chunks(vec![ChunkRecord::new(Chunk::new(&url, 0, "no vector"))])
            .await
            .unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let results = store.search_similar(&[1.0, 0.0, 0.0], 5).await.unwrap();
        assert!(results.is_empty());

        let fetched = store
            .get_chunk_by_id(&Chunk::id_for(&url, 0))
            .await
            .unwrap()
            .unwrap();
        assert!(fetched.embedding.is_none());
    }
}
