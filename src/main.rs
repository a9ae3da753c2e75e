//! # knowledge-rag CLI (`krag`)
//!
//! The `krag` binary drives the RAG service: register and process
//! documents, ask questions, and manage runtime settings.
//!
//! ## Usage
//!
//! ```bash
//! krag --config ./config/krag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `krag init` | Create the SQLite database and run schema migrations |
//! | `krag add <file>` | Register a file and process it |
//! | `krag ingest <files...>` | Register and process several files concurrently |
//! | `krag process <id>` | Re-run processing for a registered document |
//! | `krag cancel <id>` | Cancel an uploading or processing document |
//! | `krag delete <id>` | Remove a document and its index entries |
//! | `krag list` | List registered documents |
//! | `krag query "<question>"` | Answer a question from the indexed documents |
//! | `krag settings show\|set` | Inspect or change runtime settings |
//! | `krag maintenance` | Remove orphaned vector entries |
//! | `krag history` | Show recent questions and answers |
//!
//! Logs go to stderr; set `RUST_LOG` (default `info`) to change verbosity.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use knowledge_rag::config;
use knowledge_rag::models::Document;
use knowledge_rag::pipeline::ProcessOutcome;
use knowledge_rag::service::RagService;
use knowledge_rag::settings::SettingsPatch;
use knowledge_rag::{db, migrate};

/// knowledge-rag: retrieval-augmented question answering over your documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/krag.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "krag",
    about = "knowledge-rag: retrieval-augmented question answering over your documents",
    version,
    long_about = "knowledge-rag splits documents into chunks, indexes them in a vector index and a \
    BM25 lexical index, and answers questions by retrieving the most relevant passages and \
    handing them to a language model."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/krag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Register a file and process it.
    ///
    /// The file is copied into the upload directory, then loaded, chunked,
    /// optionally enriched, and indexed.
    Add {
        /// Path to a pdf, txt, md, docx, csv or html file.
        file: PathBuf,

        /// Display name shown in answers (defaults to the file name).
        #[arg(long)]
        name: Option<String>,
    },

    /// Register several files and process them concurrently.
    Ingest {
        /// Files to ingest.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Re-run processing for a registered document.
    Process {
        /// Document id.
        id: String,
    },

    /// Cancel a document that is still uploading or processing.
    Cancel {
        /// Document id.
        id: String,
    },

    /// Delete a document and all its index entries.
    Delete {
        /// Document id.
        id: String,
    },

    /// List registered documents, newest first.
    List,

    /// Ask a question.
    Query {
        /// The question.
        question: String,

        /// Flip every retrieval toggle (hybrid, fusion, reranking,
        /// chain-of-thought) for an alternative answer.
        #[arg(long)]
        alternate: bool,

        /// Print the answer and passages as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Inspect or change runtime settings.
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Remove vector entries that have no document id.
    Maintenance,

    /// Show recent questions and answers.
    History {
        /// Maximum number of entries to show.
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print the current settings.
    Show,
    /// Change settings, e.g. `krag settings set top_k=6 use_hybrid=false`.
    Set {
        /// Assignments as `key=value` pairs.
        #[arg(required = true)]
        assignments: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        let pool = db::connect(&cfg).await?;
        migrate::run_migrations(&pool).await?;
        pool.close().await;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let service = Arc::new(RagService::open(cfg).await?);
    let result = run(&service, cli.command).await;
    service.close().await;
    result
}

async fn run(service: &Arc<RagService>, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init => {}
        Commands::Add { file, name } => {
            let document = service.import_file(&file, name.as_deref()).await?;
            let path = PathBuf::from(&document.path);
            let outcome = service.process(&document.id, &path).await;
            print_outcome(&document, &outcome);
        }
        Commands::Ingest { files } => {
            let mut runs = Vec::new();
            for file in &files {
                match service.import_file(file, None).await {
                    Ok(document) => {
                        let handle =
                            service.spawn_process(&document.id, &PathBuf::from(&document.path));
                        runs.push((document, handle));
                    }
                    Err(e) => eprintln!("skip {}: {:#}", file.display(), e),
                }
            }
            for (document, handle) in runs {
                let outcome = handle
                    .await
                    .with_context(|| format!("worker for {} panicked", document.id))?;
                print_outcome(&document, &outcome);
            }
        }
        Commands::Process { id } => {
            let path = service.document_path(&id).await?;
            let outcome = service.process(&id, &path).await;
            if let Some(document) = service.document(&id).await? {
                print_outcome(&document, &outcome);
            }
        }
        Commands::Cancel { id } => {
            if service.cancel(&id).await? {
                println!("cancelled {}", id);
            } else {
                println!("{} is not uploading or processing; nothing to cancel", id);
            }
        }
        Commands::Delete { id } => {
            service.delete(&id).await?;
            println!("deleted {}", id);
        }
        Commands::List => {
            let documents = service.documents().await?;
            if documents.is_empty() {
                println!("No documents.");
            }
            for doc in documents {
                let uploaded = chrono::DateTime::from_timestamp(doc.uploaded_at, 0)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!(
                    "{}  {:<10}  {:>5} chunks  {}  {}",
                    doc.id, doc.status, doc.chunks_count, uploaded, doc.original_name
                );
            }
        }
        Commands::Query {
            question,
            alternate,
            json,
        } => {
            let answer = service.query(&question, alternate).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
                return Ok(());
            }
            println!("{}", answer.answer);
            if !answer.passages.is_empty() {
                println!();
                println!("--- Sources ({}) ---", answer.passages.len());
            }
            for (i, passage) in answer.passages.iter().enumerate() {
                match passage.page {
                    Some(page) => println!("[{}] {} (page {})", i + 1, passage.document_name, page),
                    None => println!("[{}] {}", i + 1, passage.document_name),
                }
                println!("    {}", passage.content.replace('\n', "\n    "));
                println!();
            }
        }
        Commands::Settings { action } => match action {
            SettingsAction::Show => {
                print!("{}", toml::to_string_pretty(service.settings().as_ref())?);
            }
            SettingsAction::Set { assignments } => {
                let mut patch = SettingsPatch::default();
                for assignment in &assignments {
                    patch.set(assignment)?;
                }
                let updated = service.update_settings(&patch).await?;
                print!("{}", toml::to_string_pretty(updated.as_ref())?);
                println!("ok");
            }
        },
        Commands::Maintenance => {
            let report = service.maintenance().await;
            println!("maintenance");
            println!("  total entries:   {}", report.total_count);
            println!("  cleaned orphans: {}", report.cleaned_count);
            match service.lexical_len() {
                Some(n) => println!("  lexical entries: {}", n),
                None => println!("  lexical index:   disabled"),
            }
        }
        Commands::History { limit } => {
            let entries = service.history(limit).await?;
            if entries.is_empty() {
                println!("No history.");
            }
            for entry in entries {
                let asked = chrono::DateTime::from_timestamp(entry.created_at, 0)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!("[{}] Q: {}", asked, entry.question);
                println!("A: {}", entry.answer);
                println!();
            }
        }
    }
    Ok(())
}

fn print_outcome(document: &Document, outcome: &ProcessOutcome) {
    match outcome {
        ProcessOutcome::Processed(chunks) => println!(
            "processed {} ({}): {} chunks",
            document.id, document.original_name, chunks
        ),
        ProcessOutcome::Cancelled => {
            println!("cancelled {} ({})", document.id, document.original_name)
        }
        ProcessOutcome::Failed(reason) => println!(
            "error {} ({}): {}",
            document.id, document.original_name, reason
        ),
    }
}
