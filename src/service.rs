//! The RAG service: the operations callers use to feed documents in and
//! ask questions.
//!
//! [`RagService`] owns the shared state (settings snapshot, status store,
//! vector and lexical indexes, language model) and hands each processing run
//! or query what it needs. Processing runs can be awaited inline
//! ([`RagService::process`]) or launched as tokio tasks
//! ([`RagService::spawn_process`]).
//!
//! # Answers
//!
//! [`RagService::query`] returns a plain-language answer instead of an error
//! when the index is empty ([`EMPTY_INDEX_ANSWER`]), when no language model
//! is configured ([`NO_GENERATOR_ANSWER`]) and when retrieval finds nothing
//! ([`NOT_FOUND_ANSWER`]). Only answered questions are logged to history.
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::path::Path;
//! # use knowledge_rag::config::load_config;
//! # use knowledge_rag::service::RagService;
//! # async fn demo() -> anyhow::Result<()> {
//! let service = RagService::open(load_config(Path::new("config/krag.toml"))?).await?;
//! let doc = service.import_file(Path::new("handbook.pdf"), None).await?;
//! service.process(&doc.id, Path::new(&doc.path)).await;
//!
//! let answer = service.query("How many vacation days do new hires get?", false).await?;
//! println!("{}", answer.answer);
//! # Ok(())
//! # }
//! ```

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::{self, Embedder};
use crate::history::{self, ConversationEntry};
use crate::lexical::LexicalIndex;
use crate::llm::{self, Generator};
use crate::loader::{self, FileKind};
use crate::models::{Chunk, Document, DocumentStatus, Passage, QueryAnswer};
use crate::pipeline::{FileProcessor, ProcessOutcome};
use crate::prompts;
use crate::retrieval::{QueryToggles, Retriever};
use crate::settings::{self, Settings, SettingsHandle, SettingsPatch};
use crate::status::{CancellationProbe, SqliteStatusStore, StatusStore};
use crate::vector::sqlite::SqliteVectorBackend;
use crate::vector::{normalize_path, MaintenanceReport, MetadataFilter, VectorBackend, VectorIndex};
use crate::{db, migrate};

pub const EMPTY_INDEX_ANSWER: &str =
    "The knowledge base is empty. Add and process documents before asking questions.";
pub const NO_GENERATOR_ANSWER: &str =
    "The language model is not configured. Check the [llm] section of the configuration and the API key.";
pub const NOT_FOUND_ANSWER: &str = "I could not find any information related to your question.";

/// Longest passage excerpt returned to callers, in characters.
pub const PASSAGE_DISPLAY_CHARS: usize = 300;

const UNKNOWN_DOCUMENT: &str = "Unknown";

pub struct RagService {
    config: Config,
    pool: SqlitePool,
    settings: SettingsHandle,
    store: Arc<dyn StatusStore>,
    vector: Arc<VectorIndex>,
    lexical: Option<Arc<LexicalIndex>>,
    generator: RwLock<Option<Arc<dyn Generator>>>,
    processor: FileProcessor,
    /// Cancellation latches of runs in flight in this process.
    active: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl RagService {
    /// Open the database and indexes described by `config`, with providers
    /// built from the configuration and the persisted settings.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;
        let current = settings::load_settings(&pool).await?;

        // Providers that cannot be built (missing API key) degrade to disabled.
        let embedder = embedding::create_embedder(&config.embedding, &current.embedding_model)
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "embedding provider unavailable");
                Arc::new(embedding::DisabledEmbedder)
            });
        let generator = llm::create_generator(&config.llm, &current).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "language model unavailable");
            None
        });
        let store: Arc<dyn StatusStore> = Arc::new(SqliteStatusStore::new(pool.clone()));
        let backend: Arc<dyn VectorBackend> = Arc::new(SqliteVectorBackend::new(&config.index.dir));

        Self::new(config, pool, store, backend, embedder, generator).await
    }

    /// Assemble a service from explicit components.
    pub async fn new(
        config: Config,
        pool: SqlitePool,
        store: Arc<dyn StatusStore>,
        backend: Arc<dyn VectorBackend>,
        embedder: Arc<dyn Embedder>,
        generator: Option<Arc<dyn Generator>>,
    ) -> Result<Self> {
        migrate::run_migrations(&pool).await?;
        let current = settings::load_settings(&pool).await?;
        let vector = Arc::new(VectorIndex::open(backend, embedder).await?);

        let lexical = if config.index.lexical {
            let lexical = Arc::new(LexicalIndex::new());
            match vector.all_chunks().await {
                Ok(chunks) => {
                    lexical.update(&chunks);
                    tracing::info!(chunks = chunks.len(), "lexical index warmed");
                }
                Err(e) => tracing::warn!(error = %e, "could not warm lexical index"),
            }
            Some(lexical)
        } else {
            tracing::info!("lexical index disabled; hybrid retrieval falls back to vector search");
            None
        };

        if generator.is_none() {
            tracing::info!("no language model configured");
        }

        let processor = FileProcessor::new(vector.clone(), lexical.clone(), store.clone());
        Ok(Self {
            config,
            pool,
            settings: SettingsHandle::new(current),
            store,
            vector,
            lexical,
            generator: RwLock::new(generator),
            processor,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.snapshot()
    }

    pub fn lexical_available(&self) -> bool {
        self.lexical.is_some()
    }

    /// Entries in the lexical index, or `None` when it is disabled.
    pub fn lexical_len(&self) -> Option<usize> {
        self.lexical.as_ref().map(|l| l.len())
    }

    fn generator(&self) -> Option<Arc<dyn Generator>> {
        self.generator
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ============ Documents ============

    /// Copy `source` into the upload directory and register it as
    /// `uploading`. Unsupported file types are rejected before anything is
    /// written.
    pub async fn import_file(&self, source: &Path, display_name: Option<&str>) -> Result<Document> {
        FileKind::from_path(source)?;
        let metadata = std::fs::metadata(source)
            .with_context(|| format!("Failed to read {}", source.display()))?;
        let original_name = match display_name {
            Some(name) => name.to_string(),
            None => source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| source.display().to_string()),
        };

        let id = Uuid::new_v4().to_string();
        let upload_dir = &self.config.storage.upload_dir;
        std::fs::create_dir_all(upload_dir)
            .with_context(|| format!("Failed to create {}", upload_dir.display()))?;
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let stored = upload_dir.join(format!("{}_{}", id, file_name));
        std::fs::copy(source, &stored)
            .with_context(|| format!("Failed to copy {} to {}", source.display(), stored.display()))?;

        let document = Document {
            id,
            original_name,
            path: stored.to_string_lossy().into_owned(),
            file_type: loader::file_extension(source),
            file_size: metadata.len() as i64,
            uploaded_at: chrono::Utc::now().timestamp(),
            status: DocumentStatus::Uploading,
            chunks_count: 0,
        };
        self.store.register(&document).await?;
        tracing::info!(document_id = %document.id, name = %document.original_name, "registered document");
        Ok(document)
    }

    pub async fn document(&self, document_id: &str) -> Result<Option<Document>> {
        self.store.get(document_id).await
    }

    /// Stored file of a registered document.
    pub async fn document_path(&self, document_id: &str) -> Result<PathBuf> {
        match self.store.get(document_id).await? {
            Some(document) => Ok(PathBuf::from(document.path)),
            None => bail!("No document with id {}", document_id),
        }
    }

    pub async fn documents(&self) -> Result<Vec<Document>> {
        self.store.list().await
    }

    // ============ Processing ============

    /// Run the processing pipeline for a registered document and wait for it.
    pub async fn process(&self, document_id: &str, file_path: &Path) -> ProcessOutcome {
        if let Err(e) = self.store.begin_processing(document_id).await {
            tracing::error!(document_id, error = %e, "could not mark document as processing");
            return ProcessOutcome::Failed(format!("{:#}", e));
        }

        let probe = CancellationProbe::new(document_id, self.store.clone());
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(document_id.to_string(), probe.latch());

        let settings = self.settings.snapshot();
        let outcome = self
            .processor
            .run(file_path, &settings, self.generator(), &probe)
            .await;

        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active
            .get(document_id)
            .is_some_and(|latch| Arc::ptr_eq(latch, &probe.latch()))
        {
            active.remove(document_id);
        }
        outcome
    }

    /// Launch [`process`](Self::process) on the tokio runtime and return
    /// without waiting.
    pub fn spawn_process(self: &Arc<Self>, document_id: &str, file_path: &Path) -> JoinHandle<ProcessOutcome> {
        let service = Arc::clone(self);
        let document_id = document_id.to_string();
        let file_path = file_path.to_path_buf();
        tokio::spawn(async move { service.process(&document_id, &file_path).await })
    }

    /// Register the document if it is unknown, then process it inline.
    /// Returns whether it ended up `processed`.
    pub async fn add(&self, file_path: &Path, document_id: &str, display_name: &str) -> Result<bool> {
        if self.store.get(document_id).await?.is_none() {
            let size = std::fs::metadata(file_path).map(|m| m.len() as i64).unwrap_or(0);
            self.store
                .register(&Document {
                    id: document_id.to_string(),
                    original_name: display_name.to_string(),
                    path: file_path.to_string_lossy().into_owned(),
                    file_type: loader::file_extension(file_path),
                    file_size: size,
                    uploaded_at: chrono::Utc::now().timestamp(),
                    status: DocumentStatus::Uploading,
                    chunks_count: 0,
                })
                .await?;
        }
        let outcome = self.process(document_id, file_path).await;
        if let ProcessOutcome::Failed(reason) = &outcome {
            tracing::warn!(document_id, reason = %reason, "document was not added");
        }
        Ok(outcome.is_processed())
    }

    /// Cancel a document that is `uploading` or `processing`. Returns false
    /// for any other status.
    pub async fn cancel(&self, document_id: &str) -> Result<bool> {
        if !self.store.cancel(document_id).await? {
            let status = self.store.status(document_id).await?;
            tracing::info!(document_id, status = ?status, "nothing to cancel");
            return Ok(false);
        }
        if let Some(latch) = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(document_id)
        {
            latch.store(true, Ordering::SeqCst);
        }

        let path = self.store.get(document_id).await?.map(|d| d.path);
        self.remove_index_entries(document_id, path.as_deref()).await;
        tracing::info!(document_id, "document cancelled");
        Ok(true)
    }

    /// Remove a document from both indexes and the registry. Files kept in
    /// the upload directory are deleted too.
    pub async fn delete(&self, document_id: &str) -> Result<bool> {
        let document = self.store.get(document_id).await?;
        if let Some(latch) = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(document_id)
        {
            latch.store(true, Ordering::SeqCst);
        }

        self.remove_index_entries(document_id, document.as_ref().map(|d| d.path.as_str()))
            .await;
        self.store.remove(document_id).await?;

        if let Some(document) = document {
            let path = PathBuf::from(&document.path);
            if path.starts_with(&self.config.storage.upload_dir) && path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        }
        tracing::info!(document_id, "document deleted");
        Ok(true)
    }

    async fn remove_index_entries(&self, document_id: &str, path: Option<&str>) {
        let by_source = match path {
            Some(path) => {
                self.vector
                    .delete_by_source_path(&normalize_path(path))
                    .await
            }
            None => 0,
        };
        let by_id = self.vector.delete_by_document_id(document_id).await;
        let lexical = self
            .lexical
            .as_ref()
            .map(|l| l.remove_document(document_id))
            .unwrap_or(0);
        tracing::debug!(document_id, by_source, by_id, lexical, "removed index entries");
    }

    // ============ Query ============

    /// Answer `question` from the indexed documents. With
    /// `use_alternate_strategy` every retrieval toggle is flipped.
    pub async fn query(&self, question: &str, use_alternate_strategy: bool) -> Result<QueryAnswer> {
        if !self.vector.is_initialized().await {
            return Ok(QueryAnswer::message(EMPTY_INDEX_ANSWER));
        }
        let Some(generator) = self.generator() else {
            return Ok(QueryAnswer::message(NO_GENERATOR_ANSWER));
        };

        let settings = self.settings.snapshot();
        let mut toggles = QueryToggles::from_settings(&settings);
        if use_alternate_strategy {
            toggles = toggles.inverted();
        }

        let retriever = Retriever::new(
            &self.vector,
            self.lexical.as_deref(),
            Some(generator.as_ref()),
            settings.top_k,
        );
        let chunks = retriever.retrieve(question, toggles).await?;
        if chunks.is_empty() {
            return Ok(QueryAnswer::message(NOT_FOUND_ANSWER));
        }

        let names = self.document_names(&chunks).await;
        let name_of = |chunk: &Chunk| -> String {
            chunk
                .document_id()
                .and_then(|id| names.get(id).cloned())
                .unwrap_or_else(|| UNKNOWN_DOCUMENT.to_string())
        };

        let context = chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                format!(
                    "[Document {}] source: {}, page: {}\n{}\n",
                    i + 1,
                    name_of(chunk),
                    chunk.metadata.page + 1,
                    chunk.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = if toggles.chain_of_thought {
            prompts::chain_of_thought_answer(&context, question)
        } else {
            prompts::standard_answer(&context, question)
        };
        let answer = generator
            .complete(&prompt)
            .await
            .context("answer generation failed")?;

        let passages: Vec<Passage> = chunks
            .iter()
            .map(|chunk| Passage {
                content: display_content(chunk.original_content()),
                document_id: chunk.document_id().unwrap_or_default().to_string(),
                document_name: name_of(chunk),
                page: Some(chunk.metadata.page + 1),
            })
            .collect();

        if let Err(e) = history::record(&self.pool, question, &answer, &passages).await {
            tracing::warn!(error = %e, "failed to log conversation");
        }
        Ok(QueryAnswer { answer, passages })
    }

    async fn document_names(&self, chunks: &[Chunk]) -> HashMap<String, String> {
        let mut names = HashMap::new();
        for id in chunks.iter().filter_map(Chunk::document_id) {
            if names.contains_key(id) {
                continue;
            }
            match self.store.get(id).await {
                Ok(Some(document)) => {
                    names.insert(id.to_string(), document.original_name);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(document_id = id, error = %e, "document lookup failed"),
            }
        }
        names
    }

    pub async fn history(&self, limit: i64) -> Result<Vec<ConversationEntry>> {
        history::recent(&self.pool, limit).await
    }

    // ============ Settings & maintenance ============

    /// Validate, persist and publish a settings change. Providers that
    /// depend on changed fields are rebuilt before anything is saved.
    pub async fn update_settings(&self, patch: &SettingsPatch) -> Result<Arc<Settings>> {
        let current = self.settings.snapshot();
        if patch.is_empty() {
            return Ok(current);
        }
        let next = current.apply(patch);
        next.validate()?;

        let embedder = if next.embedding_model != current.embedding_model {
            Some(embedding::create_embedder(&self.config.embedding, &next.embedding_model)?)
        } else {
            None
        };
        let generator = if current.generator_changed(&next) {
            Some(llm::create_generator(&self.config.llm, &next)?)
        } else {
            None
        };

        settings::save_settings(&self.pool, &next).await?;

        if let Some(embedder) = embedder {
            self.vector.update_embedding_function(embedder).await?;
        }
        if let Some(generator) = generator {
            *self.generator.write().unwrap_or_else(PoisonError::into_inner) = generator;
        }
        let published = self.settings.replace(next);
        tracing::info!("settings updated");
        Ok(published)
    }

    /// Drop entries without a document id from both indexes.
    pub async fn maintenance(&self) -> MaintenanceReport {
        let report = self.vector.maintenance().await;
        if let Some(lexical) = &self.lexical {
            let orphans = MetadataFilter::MissingDocumentId;
            let removed = lexical.remove_where(|chunk| orphans.matches(&chunk.metadata));
            tracing::info!(removed, "lexical orphans removed");
        }
        report
    }

    pub async fn chunk_count(&self) -> usize {
        self.vector.count().await
    }

    /// Close the database pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Passage text as shown to callers: blank-line runs and repeated spaces
/// collapsed, cut to [`PASSAGE_DISPLAY_CHARS`] characters plus `...`.
pub fn display_content(content: &str) -> String {
    let mut collapsed = String::with_capacity(content.len());
    let mut newlines = 0usize;
    let mut spaces = 0usize;
    for c in content.chars() {
        match c {
            '\n' => {
                newlines += 1;
                spaces = 0;
                if newlines <= 2 {
                    collapsed.push(c);
                }
            }
            ' ' => {
                spaces += 1;
                newlines = 0;
                if spaces == 1 {
                    collapsed.push(c);
                }
            }
            _ => {
                newlines = 0;
                spaces = 0;
                collapsed.push(c);
            }
        }
    }

    let shown = if collapsed.chars().count() > PASSAGE_DISPLAY_CHARS {
        let cut: String = collapsed.chars().take(PASSAGE_DISPLAY_CHARS).collect();
        format!("{}...", cut)
    } else {
        collapsed
    };
    shown.trim().to_string()
}
