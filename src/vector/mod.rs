//! Vector index adapter.
//!
//! [`VectorIndex`] owns the current [`Embedder`] and a lazily created
//! [`VectorEngine`]. Engines are opened or created through a
//! [`VectorBackend`]:
//!
//! - **[`sqlite::SqliteVectorBackend`]**: `<index.dir>/vectors.sqlite`, brute-force cosine.
//! - **[`memory::MemoryVectorBackend`]**: process-local, optionally without filtered delete.
//!
//! # Deletes
//!
//! Deletes never fail the caller: engine errors are logged and count as zero
//! entries removed.
//!
//! - [`VectorIndex::delete_by_source_path`] matches the lexically normalized
//!   path exactly. Engines without filtered delete fall back to a full scan,
//!   comparing normalized sources, then delete by id.
//! - [`VectorIndex::delete_by_document_id`] uses the same fallback.
//! - [`VectorIndex::maintenance`] removes entries with no document id.
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use knowledge_rag::embedding::DisabledEmbedder;
//! # use knowledge_rag::vector::{memory::MemoryVectorBackend, VectorIndex};
//! # async fn demo() -> anyhow::Result<()> {
//! let backend = Arc::new(MemoryVectorBackend::new(true));
//! let index = VectorIndex::open(backend, Arc::new(DisabledEmbedder)).await?;
//! assert!(!index.is_initialized().await);
//! assert_eq!(index.delete_by_source_path("/data/uploads/missing.txt").await, 0);
//! # Ok(())
//! # }
//! ```

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use crate::embedding::Embedder;
use crate::error::EngineError;
use crate::models::{Chunk, ChunkMetadata};

/// Metadata predicate for [`VectorEngine::delete_where`].
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataFilter {
    Source(String),
    DocumentId(String),
    MissingDocumentId,
}

impl MetadataFilter {
    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        match self {
            MetadataFilter::Source(source) => &metadata.source == source,
            MetadataFilter::DocumentId(id) => metadata.document_id.as_deref() == Some(id.as_str()),
            MetadataFilter::MissingDocumentId => metadata
                .document_id
                .as_deref()
                .map_or(true, str::is_empty),
        }
    }
}

/// A chunk together with its embedding, as handed to an engine.
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

#[async_trait]
pub trait VectorEngine: Send + Sync {
    /// Insert or replace entries by chunk id.
    async fn insert(&self, entries: Vec<VectorEntry>) -> Result<(), EngineError>;
    /// Delete entries matching `filter`. Engines without filtered delete
    /// return [`EngineError::Unsupported`].
    async fn delete_where(&self, filter: &MetadataFilter) -> Result<usize, EngineError>;
    async fn delete_ids(&self, ids: &[String]) -> Result<usize, EngineError>;
    /// Every stored chunk, without vectors.
    async fn scan(&self) -> Result<Vec<Chunk>, EngineError>;
    async fn count(&self) -> Result<usize, EngineError>;
    /// Up to `k` chunks by descending cosine similarity.
    async fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<(Chunk, f32)>, EngineError>;
}

#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// The persisted engine, if one has been created before.
    async fn open(&self) -> Result<Option<Arc<dyn VectorEngine>>>;
    async fn create(&self) -> Result<Arc<dyn VectorEngine>>;
}

/// Result of [`VectorIndex::maintenance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub total_count: usize,
    pub cleaned_count: usize,
}

pub struct VectorIndex {
    backend: Arc<dyn VectorBackend>,
    embedder: RwLock<Arc<dyn Embedder>>,
    engine: tokio::sync::RwLock<Option<Arc<dyn VectorEngine>>>,
}

impl VectorIndex {
    /// Open the persisted index if there is one; otherwise it is created by
    /// the first [`add`](Self::add).
    pub async fn open(backend: Arc<dyn VectorBackend>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let engine = backend.open().await?;
        match &engine {
            Some(_) => tracing::info!(model = embedder.model_name(), "opened vector index"),
            None => tracing::info!("vector index not initialized; it will be created on first add"),
        }
        Ok(Self {
            backend,
            embedder: RwLock::new(embedder),
            engine: tokio::sync::RwLock::new(engine),
        })
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        self.embedder
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn is_initialized(&self) -> bool {
        self.engine.read().await.is_some()
    }

    async fn engine(&self) -> Option<Arc<dyn VectorEngine>> {
        self.engine.read().await.clone()
    }

    async fn engine_or_create(&self) -> Result<Arc<dyn VectorEngine>> {
        let mut slot = self.engine.write().await;
        if let Some(engine) = slot.as_ref() {
            return Ok(engine.clone());
        }
        let engine = self.backend.create().await?;
        tracing::info!("created vector index");
        *slot = Some(engine.clone());
        Ok(engine)
    }

    /// Embed and store `chunks`. Chunks without a document id are stored
    /// but cannot be removed by [`delete_by_document_id`](Self::delete_by_document_id).
    pub async fn add(&self, chunks: &[Chunk]) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let orphans = chunks
            .iter()
            .filter(|c| MetadataFilter::MissingDocumentId.matches(&c.metadata))
            .count();
        if orphans > 0 {
            tracing::warn!(
                orphans,
                "adding chunks without a document id; they cannot be deleted by id later"
            );
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self.embedder().embed(&texts).await?;
        anyhow::ensure!(
            vectors.len() == chunks.len(),
            "embedder returned {} vectors for {} chunks",
            vectors.len(),
            chunks.len()
        );

        let entries: Vec<VectorEntry> = chunks
            .iter()
            .cloned()
            .zip(vectors)
            .map(|(chunk, embedding)| VectorEntry { chunk, embedding })
            .collect();

        let engine = self.engine_or_create().await?;
        engine.insert(entries).await?;
        tracing::debug!(count = chunks.len(), "added chunks to vector index");
        Ok(chunks.len())
    }

    /// Remove every entry recorded under `path`. Returns 0 on any failure.
    pub async fn delete_by_source_path(&self, path: &str) -> usize {
        let Some(engine) = self.engine().await else {
            return 0;
        };
        let normalized = normalize_path(path);

        match engine.delete_where(&MetadataFilter::Source(normalized.clone())).await {
            Ok(n) => {
                tracing::debug!(source = %normalized, deleted = n, "deleted entries by source");
                return n;
            }
            Err(EngineError::Unsupported(_)) => {}
            Err(e) => tracing::warn!(source = %normalized, error = %e, "filtered delete failed; scanning"),
        }

        // Stored sources may be unnormalized; compare both sides normalized.
        let matched = |meta: &ChunkMetadata| {
            !meta.source.is_empty()
                && (meta.source == normalized || normalize_path(&meta.source) == normalized)
        };
        self.delete_scanned(engine.as_ref(), matched, "source").await
    }

    /// Remove every entry tagged with `document_id`. Returns 0 on any failure.
    pub async fn delete_by_document_id(&self, document_id: &str) -> usize {
        let Some(engine) = self.engine().await else {
            return 0;
        };
        let filter = MetadataFilter::DocumentId(document_id.to_string());
        match engine.delete_where(&filter).await {
            Ok(n) => n,
            Err(EngineError::Unsupported(_)) => {
                self.delete_scanned(engine.as_ref(), |m| filter.matches(m), "document id")
                    .await
            }
            Err(e) => {
                tracing::warn!(document_id, error = %e, "delete by document id failed");
                0
            }
        }
    }

    async fn delete_scanned(
        &self,
        engine: &dyn VectorEngine,
        predicate: impl Fn(&ChunkMetadata) -> bool,
        what: &str,
    ) -> usize {
        let ids: Vec<String> = match engine.scan().await {
            Ok(chunks) => chunks
                .into_iter()
                .filter(|c| predicate(&c.metadata))
                .map(|c| c.id)
                .collect(),
            Err(e) => {
                tracing::warn!(what, error = %e, "scan for delete failed");
                return 0;
            }
        };
        if ids.is_empty() {
            return 0;
        }
        match engine.delete_ids(&ids).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(what, error = %e, "delete by ids failed");
                0
            }
        }
    }

    /// Total entries; 0 when the index does not exist yet.
    pub async fn count(&self) -> usize {
        let Some(engine) = self.engine().await else {
            return 0;
        };
        match engine.count().await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "vector count failed");
                0
            }
        }
    }

    /// Drop entries that have no document id, then report the remaining
    /// total and how many were removed.
    pub async fn maintenance(&self) -> MaintenanceReport {
        let Some(engine) = self.engine().await else {
            tracing::info!("vector index not initialized; nothing to maintain");
            return MaintenanceReport {
                total_count: 0,
                cleaned_count: 0,
            };
        };

        let filter = MetadataFilter::MissingDocumentId;
        let cleaned_count = match engine.delete_where(&filter).await {
            Ok(n) => n,
            Err(EngineError::Unsupported(_)) => {
                self.delete_scanned(engine.as_ref(), |m| filter.matches(m), "orphans")
                    .await
            }
            Err(e) => {
                tracing::warn!(error = %e, "orphan cleanup failed");
                0
            }
        };
        let total_count = self.count().await;
        tracing::info!(total_count, cleaned_count, "vector index maintenance finished");
        MaintenanceReport {
            total_count,
            cleaned_count,
        }
    }

    /// Swap the embedder and reopen the persisted engine. Stored vectors are
    /// kept as they are.
    pub async fn update_embedding_function(&self, embedder: Arc<dyn Embedder>) -> Result<()> {
        tracing::info!(model = embedder.model_name(), "switching embedding model");
        *self.embedder.write().unwrap_or_else(PoisonError::into_inner) = embedder;
        let mut slot = self.engine.write().await;
        if slot.is_some() {
            *slot = self.backend.open().await?;
        }
        Ok(())
    }

    /// Top `k` chunks for `query`; empty when the index does not exist.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<Chunk>> {
        let Some(engine) = self.engine().await else {
            return Ok(Vec::new());
        };
        let vector = self.embedder().embed_query(query).await?;
        let hits = engine.nearest(&vector, k).await?;
        Ok(hits.into_iter().map(|(chunk, _)| chunk).collect())
    }

    pub async fn all_chunks(&self) -> Result<Vec<Chunk>> {
        match self.engine().await {
            Some(engine) => Ok(engine.scan().await?),
            None => Ok(Vec::new()),
        }
    }
}

/// Lexically normalize a path: drop `.` components and resolve `..`
/// against preceding normal components. The filesystem is not consulted.
pub fn normalize_path(path: &str) -> String {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in Path::new(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if depth > 0 {
                    out.pop();
                    depth -= 1;
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        return ".".to_string();
    }
    out.to_string_lossy().into_owned()
}
