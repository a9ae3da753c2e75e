//! Document registry and status transitions.
//!
//! The [`StatusStore`] is the system of record for a document's lifecycle.
//! Transitions that end a run are conditional writes so that a concurrent
//! cancellation always wins over a late `processed`/`error` update:
//!
//! | operation | allowed from | result |
//! |---|---|---|
//! | `begin_processing` | any | `processing` |
//! | `finish` | `processing` | `processed` / `error` |
//! | `cancel` | `uploading`, `processing` | `cancelled` |
//!
//! [`CancellationProbe`] is the in-process view of one run's cancellation
//! state: a local latch plus a status refresh at each stage boundary.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::models::{Document, DocumentStatus};

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Insert a new document row (status as given, usually `uploading`).
    async fn register(&self, document: &Document) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Document>>;
    async fn status(&self, id: &str) -> Result<Option<DocumentStatus>>;
    /// Start a new run: unconditionally `processing`, chunk count reset.
    async fn begin_processing(&self, id: &str) -> Result<()>;
    /// End a run. Applies only while the row is still `processing`;
    /// returns whether it did.
    async fn finish(&self, id: &str, status: DocumentStatus, chunks_count: i64) -> Result<bool>;
    /// Returns whether the row moved to `cancelled`.
    async fn cancel(&self, id: &str) -> Result<bool>;
    async fn remove(&self, id: &str) -> Result<bool>;
    /// Newest first.
    async fn list(&self) -> Result<Vec<Document>>;
}

// ============ SQLite ============

pub struct SqliteStatusStore {
    pool: SqlitePool,
}

impl SqliteStatusStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let status: String = row.try_get("status")?;
    Ok(Document {
        id: row.try_get("id")?,
        original_name: row.try_get("original_name")?,
        path: row.try_get("path")?,
        file_type: row.try_get("file_type")?,
        file_size: row.try_get("file_size")?,
        uploaded_at: row.try_get("uploaded_at")?,
        status: status.parse()?,
        chunks_count: row.try_get("chunks_count")?,
    })
}

#[async_trait]
impl StatusStore for SqliteStatusStore {
    async fn register(&self, document: &Document) -> Result<()> {
        sqlx::query(
            "INSERT INTO documents (id, original_name, path, file_type, file_size, uploaded_at, status, chunks_count)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&document.id)
        .bind(&document.original_name)
        .bind(&document.path)
        .bind(&document.file_type)
        .bind(document.file_size)
        .bind(document.uploaded_at)
        .bind(document.status.as_str())
        .bind(document.chunks_count)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to register document {}", document.id))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn status(&self, id: &str) -> Result<Option<DocumentStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        status.map(|s| s.parse()).transpose()
    }

    async fn begin_processing(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE documents SET status = 'processing', chunks_count = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finish(&self, id: &str, status: DocumentStatus, chunks_count: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE documents SET status = ?, chunks_count = ? WHERE id = ? AND status = 'processing'",
        )
        .bind(status.as_str())
        .bind(chunks_count)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cancel(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE documents SET status = 'cancelled'
             WHERE id = ? AND status IN ('uploading', 'processing')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents ORDER BY uploaded_at DESC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_document).collect()
    }
}

// ============ In-memory ============

/// Status store backed by a `HashMap`, for tests and embedding the service
/// without a database.
#[derive(Default)]
pub struct MemoryStatusStore {
    docs: RwLock<HashMap<String, Document>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_doc<T>(&self, id: &str, f: impl FnOnce(&mut Document) -> T) -> Option<T> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        docs.get_mut(id).map(f)
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn register(&self, document: &Document) -> Result<()> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        if docs.contains_key(&document.id) {
            anyhow::bail!("document {} is already registered", document.id);
        }
        docs.insert(document.id.clone(), document.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Document>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(docs.get(id).cloned())
    }

    async fn status(&self, id: &str) -> Result<Option<DocumentStatus>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(docs.get(id).map(|d| d.status))
    }

    async fn begin_processing(&self, id: &str) -> Result<()> {
        self.with_doc(id, |doc| {
            doc.status = DocumentStatus::Processing;
            doc.chunks_count = 0;
        });
        Ok(())
    }

    async fn finish(&self, id: &str, status: DocumentStatus, chunks_count: i64) -> Result<bool> {
        Ok(self
            .with_doc(id, |doc| {
                if doc.status != DocumentStatus::Processing {
                    return false;
                }
                doc.status = status;
                doc.chunks_count = chunks_count;
                true
            })
            .unwrap_or(false))
    }

    async fn cancel(&self, id: &str) -> Result<bool> {
        Ok(self
            .with_doc(id, |doc| {
                if !doc.status.is_active() {
                    return false;
                }
                doc.status = DocumentStatus::Cancelled;
                true
            })
            .unwrap_or(false))
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        Ok(docs.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<Document>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<Document> = docs.values().cloned().collect();
        all.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }
}

// ============ Cancellation ============

/// Cancellation view for one processing run.
///
/// Once the probe observes cancellation it stays cancelled. A document row
/// that disappears mid-run counts as cancelled.
#[derive(Clone)]
pub struct CancellationProbe {
    document_id: String,
    store: Arc<dyn StatusStore>,
    latch: Arc<AtomicBool>,
}

impl CancellationProbe {
    pub fn new(document_id: impl Into<String>, store: Arc<dyn StatusStore>) -> Self {
        Self {
            document_id: document_id.into(),
            store,
            latch: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Shared latch, set by [`crate::service::RagService::cancel`] for runs in this process.
    pub fn latch(&self) -> Arc<AtomicBool> {
        self.latch.clone()
    }

    pub fn trip(&self) {
        self.latch.store(true, Ordering::SeqCst);
    }

    /// Check the local latch, then refresh from the status store.
    /// A store read failure is logged and does not cancel the run.
    pub async fn is_cancelled(&self) -> bool {
        if self.latch.load(Ordering::SeqCst) {
            return true;
        }
        match self.store.status(&self.document_id).await {
            Ok(Some(DocumentStatus::Cancelled)) | Ok(None) => {
                self.trip();
                true
            }
            Ok(Some(_)) => false,
            Err(e) => {
                tracing::warn!(document_id = %self.document_id, error = %e, "status check failed");
                false
            }
        }
    }
}
