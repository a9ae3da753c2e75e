//! Library-level tests of the service with scripted providers.

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use knowledge_rag::config::Config;
use knowledge_rag::db;
use knowledge_rag::embedding::Embedder;
use knowledge_rag::llm::Generator;
use knowledge_rag::models::DocumentStatus;
use knowledge_rag::pipeline::ProcessOutcome;
use knowledge_rag::service::{RagService, EMPTY_INDEX_ANSWER, NOT_FOUND_ANSWER, NO_GENERATOR_ANSWER};
use knowledge_rag::settings::SettingsPatch;
use knowledge_rag::status::SqliteStatusStore;
use knowledge_rag::vector::sqlite::SqliteVectorBackend;

/// Letter-frequency vectors: texts sharing letters land close together.
struct LetterEmbedder;

#[async_trait]
impl Embedder for LetterEmbedder {
    fn model_name(&self) -> &str {
        "letters"
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0f32; 26];
                for c in t.to_ascii_lowercase().bytes() {
                    if c.is_ascii_lowercase() {
                        v[(c - b'a') as usize] += 1.0;
                    }
                }
                v
            })
            .collect())
    }
}

/// Answers each kind of prompt the service sends with a fixed reply and
/// remembers the answer prompts.
#[derive(Default)]
struct ScriptedGenerator {
    answer_prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn model_name(&self) -> &str {
        "scripted"
    }
    async fn complete(&self, prompt: &str) -> Result<String> {
        if prompt.contains("<document>") {
            return Ok("Context line.".into());
        }
        if prompt.contains("alternative queries") {
            return Ok("1. rust crates\n2. cargo builds".into());
        }
        if prompt.trim_end().ends_with("Extracted relevant parts:") {
            return Ok(if prompt.contains("cargo") {
                "cargo and crates".into()
            } else {
                "NO_OUTPUT".into()
            });
        }
        self.answer_prompts.lock().unwrap().push(prompt.to_string());
        if prompt.trim_end().ends_with("Reasoning:") {
            Ok("reasoned answer".into())
        } else {
            Ok("standard answer".into())
        }
    }
}

async fn open_service(dir: &Path, generator: Option<Arc<dyn Generator>>) -> RagService {
    let config = Config::rooted_at(dir);
    let pool = db::connect(&config).await.unwrap();
    let store = Arc::new(SqliteStatusStore::new(pool.clone()));
    let backend = Arc::new(SqliteVectorBackend::new(&config.index.dir));
    RagService::new(config, pool, store, backend, Arc::new(LetterEmbedder), generator)
        .await
        .unwrap()
}

fn write_file(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

const ALPHA: &str = "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\n\
                     It contains information about cargo and crates.";
const BETA: &str = "Beta notes on Python and machine learning. PyTorch is covered.";

#[tokio::test]
async fn test_add_then_query_returns_answer_with_passages() {
    let tmp = TempDir::new().unwrap();
    let generator = Arc::new(ScriptedGenerator::default());
    let service = open_service(tmp.path(), Some(generator.clone())).await;

    let path = write_file(tmp.path(), "alpha.md", ALPHA);
    assert!(service.add(&path, "doc-alpha", "Alpha").await.unwrap());
    let doc = service.document("doc-alpha").await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Processed);
    assert_eq!(doc.chunks_count, 1);
    assert_eq!(service.lexical_len(), Some(1));

    let answer = service.query("tell me about cargo", false).await.unwrap();
    assert_eq!(answer.answer, "standard answer");
    assert_eq!(answer.passages.len(), 1);
    let passage = &answer.passages[0];
    assert_eq!(passage.document_id, "doc-alpha");
    assert_eq!(passage.document_name, "Alpha");
    assert_eq!(passage.page, Some(1));
    assert!(passage.content.starts_with("# Alpha Document"));

    let prompts = generator.answer_prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("[Document 1] source: Alpha, page: 1\nContext line.\n\n# Alpha"));

    let history = service.history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].question, "tell me about cargo");
    assert_eq!(history[0].passages, answer.passages);
}

#[tokio::test]
async fn test_alternate_strategy_uses_chain_of_thought() {
    let tmp = TempDir::new().unwrap();
    let service = open_service(tmp.path(), Some(Arc::new(ScriptedGenerator::default()))).await;
    let path = write_file(tmp.path(), "alpha.md", ALPHA);
    assert!(service.add(&path, "doc-alpha", "Alpha").await.unwrap());

    // inverted defaults: fusion + reranking + chain-of-thought
    let answer = service.query("cargo", true).await.unwrap();
    assert_eq!(answer.answer, "reasoned answer");
    assert_eq!(answer.passages.len(), 1);
}

#[tokio::test]
async fn test_user_facing_messages() {
    let tmp = TempDir::new().unwrap();
    let service = open_service(tmp.path(), None).await;
    assert_eq!(service.query("anything", false).await.unwrap().answer, EMPTY_INDEX_ANSWER);

    let path = write_file(tmp.path(), "beta.txt", BETA);
    assert!(service.add(&path, "doc-beta", "Beta").await.unwrap());
    let answer = service.query("anything", false).await.unwrap();
    assert_eq!(answer.answer, NO_GENERATOR_ANSWER);
    assert!(answer.passages.is_empty());
    service.close().await;

    // reranking drops every passage that says nothing about cargo
    let service = open_service(tmp.path(), Some(Arc::new(ScriptedGenerator::default()))).await;
    let mut patch = SettingsPatch::default();
    patch.set("use_hybrid=false").unwrap();
    patch.set("use_reranking=true").unwrap();
    service.update_settings(&patch).await.unwrap();
    let answer = service.query("gardening", false).await.unwrap();
    assert_eq!(answer.answer, NOT_FOUND_ANSWER);
    assert!(service.history(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_only_from_active_states() {
    let tmp = TempDir::new().unwrap();
    let service = open_service(tmp.path(), None).await;
    let source = write_file(tmp.path(), "beta.txt", BETA);

    let doc = service.import_file(&source, Some("Beta")).await.unwrap();
    assert_eq!(doc.status, DocumentStatus::Uploading);
    assert!(Path::new(&doc.path).starts_with(&service.config().storage.upload_dir));

    assert!(service.cancel(&doc.id).await.unwrap());
    assert!(!service.cancel(&doc.id).await.unwrap());
    let status = service.document(&doc.id).await.unwrap().unwrap().status;
    assert_eq!(status, DocumentStatus::Cancelled);
    assert!(!service.cancel("unknown").await.unwrap());

    // a new run starts over from processing
    let outcome = service.process(&doc.id, Path::new(&doc.path)).await;
    assert_eq!(outcome, ProcessOutcome::Processed(1));
}

#[tokio::test]
async fn test_delete_is_idempotent_and_removes_uploads() {
    let tmp = TempDir::new().unwrap();
    let service = open_service(tmp.path(), None).await;
    let source = write_file(tmp.path(), "alpha.md", ALPHA);

    let doc = service.import_file(&source, None).await.unwrap();
    assert_eq!(doc.original_name, "alpha.md");
    let outcome = service.process(&doc.id, Path::new(&doc.path)).await;
    assert!(outcome.is_processed());
    assert_eq!(service.chunk_count().await, 1);

    assert!(service.delete(&doc.id).await.unwrap());
    assert_eq!(service.chunk_count().await, 0);
    assert_eq!(service.lexical_len(), Some(0));
    assert!(!Path::new(&doc.path).exists());
    assert!(source.exists());
    assert!(service.document(&doc.id).await.unwrap().is_none());

    assert!(service.delete(&doc.id).await.unwrap());
}

#[tokio::test]
async fn test_spawned_runs_process_concurrently() {
    let tmp = TempDir::new().unwrap();
    let service = Arc::new(open_service(tmp.path(), None).await);
    let alpha = service
        .import_file(&write_file(tmp.path(), "alpha.md", ALPHA), None)
        .await
        .unwrap();
    let beta = service
        .import_file(&write_file(tmp.path(), "beta.txt", BETA), None)
        .await
        .unwrap();

    let a = service.spawn_process(&alpha.id, Path::new(&alpha.path));
    let b = service.spawn_process(&beta.id, Path::new(&beta.path));
    assert!(a.await.unwrap().is_processed());
    assert!(b.await.unwrap().is_processed());
    assert_eq!(service.chunk_count().await, 2);
    assert_eq!(service.lexical_len(), Some(2));
    assert_eq!(service.documents().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_settings_update_persists_and_validates() {
    let tmp = TempDir::new().unwrap();
    let service = open_service(tmp.path(), None).await;

    let mut patch = SettingsPatch::default();
    patch.set("top_k=2").unwrap();
    patch.set("chunk_size=500").unwrap();
    patch.set("chunk_overlap=50").unwrap();
    let updated = service.update_settings(&patch).await.unwrap();
    assert_eq!(updated.top_k, 2);
    assert_eq!(service.settings().chunk_size, 500);

    let mut bad = SettingsPatch::default();
    bad.set("chunk_overlap=800").unwrap();
    assert!(service.update_settings(&bad).await.is_err());
    assert_eq!(service.settings().chunk_overlap, 50);
    service.close().await;

    let reopened = open_service(tmp.path(), None).await;
    assert_eq!(reopened.settings().top_k, 2);
    assert_eq!(reopened.settings().chunk_overlap, 50);
}

#[tokio::test]
async fn test_reopen_warms_lexical_index_from_vectors() {
    let tmp = TempDir::new().unwrap();
    let service = open_service(tmp.path(), None).await;
    let alpha = write_file(tmp.path(), "alpha.md", ALPHA);
    let beta = write_file(tmp.path(), "beta.txt", BETA);
    assert!(service.add(&alpha, "a", "Alpha").await.unwrap());
    assert!(service.add(&beta, "b", "Beta").await.unwrap());
    service.close().await;

    let reopened = open_service(tmp.path(), None).await;
    assert!(reopened.lexical_available());
    assert_eq!(reopened.lexical_len(), Some(2));
    assert_eq!(reopened.chunk_count().await, 2);

    let report = reopened.maintenance().await;
    assert_eq!(report.total_count, 2);
    assert_eq!(report.cleaned_count, 0);
}
