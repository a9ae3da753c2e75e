//! SQLite-persisted [`VectorEngine`].
//!
//! Vectors are stored as little-endian f32 BLOBs next to the chunk text and
//! metadata in `<index.dir>/vectors.sqlite`. Search loads every vector and
//! ranks by cosine similarity in Rust.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;
use std::sync::Arc;

use super::{MetadataFilter, VectorBackend, VectorEngine, VectorEntry};
use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::EngineError;
use crate::models::{Chunk, ChunkMetadata};

pub const INDEX_FILE: &str = "vectors.sqlite";

pub struct SqliteVectorEngine {
    pool: SqlitePool,
}

impl SqliteVectorEngine {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vector_entries (
                id TEXT PRIMARY KEY,
                document_id TEXT,
                source TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                page INTEGER NOT NULL DEFAULT 0,
                enriched INTEGER NOT NULL DEFAULT 0,
                content TEXT NOT NULL,
                embedding BLOB NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_vector_entries_document ON vector_entries(document_id)",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_vector_entries_source ON vector_entries(source)")
            .execute(&pool)
            .await?;
        Ok(Self { pool })
    }
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<Chunk, sqlx::Error> {
    Ok(Chunk {
        id: row.try_get("id")?,
        content: row.try_get("content")?,
        metadata: ChunkMetadata {
            document_id: row.try_get("document_id")?,
            source: row.try_get("source")?,
            chunk_index: row.try_get("chunk_index")?,
            page: row.try_get("page")?,
            enriched: row.try_get("enriched")?,
        },
    })
}

#[async_trait]
impl VectorEngine for SqliteVectorEngine {
    async fn insert(&self, entries: Vec<VectorEntry>) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;
        for entry in &entries {
            let meta = &entry.chunk.metadata;
            sqlx::query(
                "INSERT OR REPLACE INTO vector_entries
                 (id, document_id, source, chunk_index, page, enriched, content, embedding)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&entry.chunk.id)
            .bind(&meta.document_id)
            .bind(&meta.source)
            .bind(meta.chunk_index)
            .bind(meta.page)
            .bind(meta.enriched)
            .bind(&entry.chunk.content)
            .bind(vec_to_blob(&entry.embedding))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_where(&self, filter: &MetadataFilter) -> Result<usize, EngineError> {
        let result = match filter {
            MetadataFilter::Source(source) => {
                sqlx::query("DELETE FROM vector_entries WHERE source = ?")
                    .bind(source)
                    .execute(&self.pool)
                    .await?
            }
            MetadataFilter::DocumentId(id) => {
                sqlx::query("DELETE FROM vector_entries WHERE document_id = ?")
                    .bind(id)
                    .execute(&self.pool)
                    .await?
            }
            MetadataFilter::MissingDocumentId => {
                sqlx::query("DELETE FROM vector_entries WHERE document_id IS NULL OR document_id = ''")
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected() as usize)
    }

    async fn delete_ids(&self, ids: &[String]) -> Result<usize, EngineError> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0usize;
        for id in ids {
            let result = sqlx::query("DELETE FROM vector_entries WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            deleted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(deleted)
    }

    async fn scan(&self) -> Result<Vec<Chunk>, EngineError> {
        let rows = sqlx::query(
            "SELECT id, document_id, source, chunk_index, page, enriched, content
             FROM vector_entries ORDER BY source, chunk_index",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_chunk).collect::<Result<_, _>>()?)
    }

    async fn count(&self) -> Result<usize, EngineError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vector_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<(Chunk, f32)>, EngineError> {
        let rows = sqlx::query("SELECT * FROM vector_entries")
            .fetch_all(&self.pool)
            .await?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.try_get("embedding")?;
            let similarity = cosine_similarity(query, &blob_to_vec(&blob));
            scored.push((row_to_chunk(row)?, similarity));
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}

/// Opens or creates the index file under `dir`.
pub struct SqliteVectorBackend {
    dir: PathBuf,
}

impl SqliteVectorBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }
}

#[async_trait]
impl VectorBackend for SqliteVectorBackend {
    async fn open(&self) -> Result<Option<Arc<dyn VectorEngine>>> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let engine: Arc<dyn VectorEngine> = Arc::new(SqliteVectorEngine::new(db::open_pool(&path).await?).await?);
        Ok(Some(engine))
    }

    async fn create(&self) -> Result<Arc<dyn VectorEngine>> {
        let pool = db::open_pool(&self.path()).await?;
        Ok(Arc::new(SqliteVectorEngine::new(pool).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(doc: Option<&str>, source: &str, index: i64, content: &str, v: Vec<f32>) -> VectorEntry {
        VectorEntry {
            chunk: Chunk::new(
                content.to_string(),
                ChunkMetadata {
                    document_id: doc.map(str::to_string),
                    source: source.to_string(),
                    chunk_index: index,
                    page: 2,
                    enriched: true,
                },
            ),
            embedding: v,
        }
    }

    #[tokio::test]
    async fn test_backend_persists_across_reopen() {
        let tmp = tempfile::TempDir::new().unwrap();
        let backend = SqliteVectorBackend::new(tmp.path().join("vector"));
        assert!(backend.open().await.unwrap().is_none());

        let engine = backend.create().await.unwrap();
        engine
            .insert(vec![
                entry(Some("d1"), "/a.txt", 0, "alpha", vec![1.0, 0.0]),
                entry(None, "/b.txt", 0, "beta", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let reopened = backend.open().await.unwrap().unwrap();
        assert_eq!(reopened.count().await.unwrap(), 2);

        let chunks = reopened.scan().await.unwrap();
        assert_eq!(chunks[0].metadata.document_id.as_deref(), Some("d1"));
        assert_eq!(chunks[0].metadata.page, 2);
        assert!(chunks[0].metadata.enriched);
        assert_eq!(chunks[1].metadata.document_id, None);
    }

    #[tokio::test]
    async fn test_filters_and_nearest() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = SqliteVectorBackend::new(tmp.path()).create().await.unwrap();
        engine
            .insert(vec![
                entry(Some("d1"), "/a.txt", 0, "alpha", vec![1.0, 0.0]),
                entry(Some("d1"), "/a.txt", 1, "alpha two", vec![0.9, 0.1]),
                entry(Some("d2"), "/b.txt", 0, "beta", vec![0.0, 1.0]),
                entry(None, "/c.txt", 0, "orphan", vec![0.5, 0.5]),
            ])
            .await
            .unwrap();

        let hits = engine.nearest(&[0.0, 1.0], 2).await.unwrap();
        assert_eq!(hits[0].0.content, "beta");
        assert_eq!(hits.len(), 2);

        assert_eq!(
            engine.delete_where(&MetadataFilter::MissingDocumentId).await.unwrap(),
            1
        );
        assert_eq!(
            engine.delete_where(&MetadataFilter::Source("/a.txt".into())).await.unwrap(),
            2
        );
        assert_eq!(
            engine.delete_where(&MetadataFilter::DocumentId("d2".into())).await.unwrap(),
            1
        );
        assert_eq!(engine.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_ids_counts_only_existing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = SqliteVectorBackend::new(tmp.path()).create().await.unwrap();
        let e = entry(Some("d1"), "/a.txt", 0, "alpha", vec![1.0]);
        let id = e.chunk.id.clone();
        engine.insert(vec![e]).await.unwrap();
        assert_eq!(engine.delete_ids(&[id.clone(), "missing".into()]).await.unwrap(), 1);
        assert_eq!(engine.delete_ids(&[id]).await.unwrap(), 0);
    }
}
