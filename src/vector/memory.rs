//! In-memory [`VectorEngine`] for tests and ephemeral indexes.
//!
//! Entries live in a `Vec` behind `std::sync::RwLock`; search is brute-force
//! cosine similarity. The engine can be built without filtered delete to
//! exercise the scan-and-delete-by-id fallback.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use super::{MetadataFilter, VectorBackend, VectorEngine, VectorEntry};
use crate::embedding::cosine_similarity;
use crate::error::EngineError;
use crate::models::Chunk;

pub struct MemoryVectorEngine {
    entries: RwLock<Vec<VectorEntry>>,
    filtered_delete: bool,
}

impl MemoryVectorEngine {
    pub fn new(filtered_delete: bool) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            filtered_delete,
        }
    }

    fn retain(&self, keep: impl Fn(&VectorEntry) -> bool) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|e| keep(e));
        before - entries.len()
    }
}

#[async_trait]
impl VectorEngine for MemoryVectorEngine {
    async fn insert(&self, new_entries: Vec<VectorEntry>) -> Result<(), EngineError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for entry in new_entries {
            match entries.iter_mut().find(|e| e.chunk.id == entry.chunk.id) {
                Some(existing) => *existing = entry,
                None => entries.push(entry),
            }
        }
        Ok(())
    }

    async fn delete_where(&self, filter: &MetadataFilter) -> Result<usize, EngineError> {
        if !self.filtered_delete {
            return Err(EngineError::Unsupported("delete_where"));
        }
        Ok(self.retain(|e| !filter.matches(&e.chunk.metadata)))
    }

    async fn delete_ids(&self, ids: &[String]) -> Result<usize, EngineError> {
        Ok(self.retain(|e| !ids.contains(&e.chunk.id)))
    }

    async fn scan(&self) -> Result<Vec<Chunk>, EngineError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.iter().map(|e| e.chunk.clone()).collect())
    }

    async fn count(&self) -> Result<usize, EngineError> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len())
    }

    async fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<(Chunk, f32)>, EngineError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut scored: Vec<(Chunk, f32)> = entries
            .iter()
            .map(|e| (e.chunk.clone(), cosine_similarity(query, &e.embedding)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}

/// Backend whose single engine exists from the first `create` until the
/// backend is dropped.
pub struct MemoryVectorBackend {
    filtered_delete: bool,
    engine: Mutex<Option<Arc<MemoryVectorEngine>>>,
}

impl MemoryVectorBackend {
    pub fn new(filtered_delete: bool) -> Self {
        Self {
            filtered_delete,
            engine: Mutex::new(None),
        }
    }
}

#[async_trait]
impl VectorBackend for MemoryVectorBackend {
    async fn open(&self) -> Result<Option<Arc<dyn VectorEngine>>> {
        let engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(engine.clone().map(|e| e as Arc<dyn VectorEngine>))
    }

    async fn create(&self) -> Result<Arc<dyn VectorEngine>> {
        let mut engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
        let created: Arc<dyn VectorEngine> = engine
            .get_or_insert_with(|| Arc::new(MemoryVectorEngine::new(self.filtered_delete)))
            .clone();
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;

    fn entry(id_seed: &str, doc: &str, embedding: Vec<f32>) -> VectorEntry {
        VectorEntry {
            chunk: Chunk::new(
                id_seed.to_string(),
                ChunkMetadata {
                    document_id: Some(doc.to_string()),
                    source: format!("/{}.txt", doc),
                    chunk_index: 0,
                    page: 0,
                    enriched: false,
                },
            ),
            embedding,
        }
    }

    #[tokio::test]
    async fn test_insert_replaces_same_id() {
        let engine = MemoryVectorEngine::new(true);
        engine.insert(vec![entry("a", "d1", vec![1.0, 0.0])]).await.unwrap();
        engine.insert(vec![entry("a", "d1", vec![0.0, 1.0])]).await.unwrap();
        assert_eq!(engine.count().await.unwrap(), 1);
        let hits = engine.nearest(&[0.0, 1.0], 1).await.unwrap();
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_filtered_delete_can_be_unsupported() {
        let engine = MemoryVectorEngine::new(false);
        let err = engine
            .delete_where(&MetadataFilter::DocumentId("d1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_backend_open_sees_created_engine() {
        let backend = MemoryVectorBackend::new(true);
        assert!(backend.open().await.unwrap().is_none());
        let engine = backend.create().await.unwrap();
        engine.insert(vec![entry("a", "d1", vec![1.0])]).await.unwrap();
        let reopened = backend.open().await.unwrap().unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
    }
}
