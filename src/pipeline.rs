//! File processing pipeline.
//!
//! One run takes a registered document from `processing` to a terminal
//! status: check the file, pick a loader, load, clean, split, optionally
//! enrich, then replace the document's entries in both indexes and record
//! the chunk count.
//!
//! Cancellation is cooperative. The run's [`CancellationProbe`] is checked
//! before load, clean, split, every enrichment call and the index commit.
//! Once cancellation is seen at or after the commit point, the run's index
//! entries are removed again, so a cancelled document never keeps chunks
//! from the run that observed the cancellation.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::chunk::{clean_text, ChunkSplitter, PageMap};
use crate::enrich::ContextEnricher;
use crate::lexical::LexicalIndex;
use crate::llm::Generator;
use crate::loader::{self, FileKind};
use crate::models::{Chunk, ChunkMetadata, DocumentStatus, Page};
use crate::settings::Settings;
use crate::status::{CancellationProbe, StatusStore};
use crate::vector::{normalize_path, VectorIndex};

/// Terminal result of one processing run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Processed(usize),
    Cancelled,
    Failed(String),
}

impl ProcessOutcome {
    pub fn is_processed(&self) -> bool {
        matches!(self, ProcessOutcome::Processed(_))
    }
}

pub struct FileProcessor {
    vector: Arc<VectorIndex>,
    lexical: Option<Arc<LexicalIndex>>,
    store: Arc<dyn StatusStore>,
}

impl FileProcessor {
    pub fn new(
        vector: Arc<VectorIndex>,
        lexical: Option<Arc<LexicalIndex>>,
        store: Arc<dyn StatusStore>,
    ) -> Self {
        Self {
            vector,
            lexical,
            store,
        }
    }

    /// Process `path` for the document `probe` watches. The document must
    /// already be `processing`; the run ends it as `processed` or `error`
    /// unless it is cancelled first.
    pub async fn run(
        &self,
        path: &Path,
        settings: &Settings,
        generator: Option<Arc<dyn Generator>>,
        probe: &CancellationProbe,
    ) -> ProcessOutcome {
        let document_id = probe.document_id();
        if !path.exists() {
            tracing::warn!(document_id, path = %path.display(), "source file not found");
            return self.fail(probe, "file not found".to_string()).await;
        }
        let kind = match FileKind::from_path(path) {
            Ok(kind) => kind,
            Err(e) => {
                tracing::warn!(document_id, error = %e, "no loader for file");
                return self.fail(probe, e.to_string()).await;
            }
        };

        let source = normalize_path(&path.to_string_lossy());
        let chunks = match self
            .prepare(path, kind, &source, settings, generator, probe)
            .await
        {
            Ok(Some(chunks)) => chunks,
            Ok(None) => return self.cancelled(probe, &source).await,
            Err(e) => {
                tracing::error!(document_id, error = %e, "processing failed");
                return self.fail(probe, format!("{:#}", e)).await;
            }
        };

        match self.commit(&chunks, &source, settings, probe).await {
            Ok(true) => {}
            Ok(false) => return self.cancelled(probe, &source).await,
            Err(e) => {
                tracing::error!(document_id, error = %e, "indexing failed");
                self.remove_entries(document_id, &source).await;
                return self.fail(probe, format!("{:#}", e)).await;
            }
        }

        match self
            .store
            .finish(document_id, DocumentStatus::Processed, chunks.len() as i64)
            .await
        {
            Ok(true) => {
                tracing::info!(document_id, chunks = chunks.len(), "document processed");
                ProcessOutcome::Processed(chunks.len())
            }
            Ok(false) => self.cancelled(probe, &source).await,
            Err(e) => {
                tracing::error!(document_id, error = %e, "failed to record processed status");
                ProcessOutcome::Failed(format!("{:#}", e))
            }
        }
    }

    /// Stages load through enrichment. `None` means the run was cancelled.
    async fn prepare(
        &self,
        path: &Path,
        kind: FileKind,
        source: &str,
        settings: &Settings,
        generator: Option<Arc<dyn Generator>>,
        probe: &CancellationProbe,
    ) -> Result<Option<Vec<Chunk>>> {
        let document_id = probe.document_id();

        if probe.is_cancelled().await {
            return Ok(None);
        }
        tracing::info!(document_id, kind = kind.label(), path = %path.display(), "loading");
        let owned: PathBuf = path.to_path_buf();
        let pages = tokio::task::spawn_blocking(move || loader::load_document(&owned))
            .await
            .context("loader task panicked")??;

        if probe.is_cancelled().await {
            return Ok(None);
        }
        let cleaned: Vec<Page> = pages
            .into_iter()
            .map(|page| Page {
                number: page.number,
                text: clean_text(&page.text),
            })
            .collect();
        let page_map = PageMap::new(&cleaned);
        anyhow::ensure!(!page_map.text().is_empty(), "no text content extracted");

        if probe.is_cancelled().await {
            return Ok(None);
        }
        let splitter = ChunkSplitter::from_settings(settings)?;
        let pieces = splitter.split(page_map.text());
        let page_numbers = page_map.pages_for(&pieces);
        tracing::info!(
            document_id,
            chunks = pieces.len(),
            intelligent = splitter.is_intelligent(),
            "split document"
        );

        let enricher = match generator {
            Some(generator) if settings.use_contextual_embeddings => {
                Some(ContextEnricher::new(generator))
            }
            _ => None,
        };

        let mut chunks = Vec::with_capacity(pieces.len());
        for (index, (piece, page)) in pieces.into_iter().zip(page_numbers).enumerate() {
            let mut content = piece;
            let mut enriched = false;
            if let Some(enricher) = &enricher {
                if probe.is_cancelled().await {
                    return Ok(None);
                }
                if let Some(with_context) = enricher.enrich(page_map.text(), &content).await {
                    content = with_context;
                    enriched = true;
                }
            }
            chunks.push(Chunk::new(
                content,
                ChunkMetadata {
                    document_id: Some(document_id.to_string()),
                    source: source.to_string(),
                    chunk_index: index as i64,
                    page,
                    enriched,
                },
            ));
        }
        Ok(Some(chunks))
    }

    /// Replace the document's index entries with `chunks`. Returns
    /// `Ok(false)` when cancellation was seen at or after the commit point.
    async fn commit(
        &self,
        chunks: &[Chunk],
        source: &str,
        settings: &Settings,
        probe: &CancellationProbe,
    ) -> Result<bool> {
        let document_id = probe.document_id();
        if probe.is_cancelled().await {
            return Ok(false);
        }

        self.remove_entries(document_id, source).await;
        self.vector
            .add(chunks)
            .await
            .with_context(|| format!("failed to index {} chunks", chunks.len()))?;

        if probe.is_cancelled().await {
            return Ok(false);
        }
        if settings.use_bm25 {
            if let Some(lexical) = &self.lexical {
                lexical.update(chunks);
            }
        }
        Ok(true)
    }

    /// Delete every vector and lexical entry of the document.
    async fn remove_entries(&self, document_id: &str, source: &str) {
        let by_source = self.vector.delete_by_source_path(source).await;
        let by_id = self.vector.delete_by_document_id(document_id).await;
        let lexical = self
            .lexical
            .as_ref()
            .map(|l| l.remove_document(document_id))
            .unwrap_or(0);
        tracing::debug!(document_id, by_source, by_id, lexical, "removed index entries");
    }

    async fn cancelled(&self, probe: &CancellationProbe, source: &str) -> ProcessOutcome {
        tracing::info!(document_id = probe.document_id(), "processing cancelled");
        self.remove_entries(probe.document_id(), source).await;
        ProcessOutcome::Cancelled
    }

    async fn fail(&self, probe: &CancellationProbe, reason: String) -> ProcessOutcome {
        let document_id = probe.document_id();
        match self.store.finish(document_id, DocumentStatus::Error, 0).await {
            Ok(true) => ProcessOutcome::Failed(reason),
            // the row left `processing` under us, which only cancel does
            Ok(false) => ProcessOutcome::Cancelled,
            Err(e) => {
                tracing::error!(document_id, error = %e, "failed to record error status");
                ProcessOutcome::Failed(reason)
            }
        }
    }
}
