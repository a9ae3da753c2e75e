//! # knowledge-rag
//!
//! A retrieval-augmented question answering service.
//!
//! Documents are loaded, split into chunks along their structure, optionally
//! prefixed with model-written context, and indexed twice: in a vector index
//! and in a BM25 lexical index. Questions are answered by retrieving passages
//! with a standard, hybrid or multi-query fusion strategy and handing them to
//! a language model.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────┐   ┌──────────────┐
//! │ Loaders  │──▶│      Pipeline        │──▶│ Vector index │
//! │ pdf/docx │   │ clean+split+enrich   │   │ BM25 index   │
//! └──────────┘   └──────────────────────┘   └──────┬───────┘
//!                                                  │
//!                 ┌──────────────┐   ┌─────────────▼──┐
//!                 │  RagService  │◀──│   Retriever    │
//!                 │ (krag CLI)   │   │ std/hyb/fusion │
//!                 └──────────────┘   └────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! krag init
//! krag add ./handbook.pdf
//! krag query "How many vacation days do new hires get?"
//! krag settings set use_rag_fusion=true top_k=6
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`settings`] | Persisted runtime settings and snapshots |
//! | [`models`] | Core data types |
//! | [`loader`] | Document loaders by file type |
//! | [`chunk`] | Structural and fixed-window text splitting |
//! | [`enrich`] | Model-written chunk context |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`llm`] | Language model provider abstraction |
//! | [`vector`] | Vector index adapter and engines |
//! | [`lexical`] | BM25 lexical index |
//! | [`retrieval`] | Retrieval strategies and reranking |
//! | [`pipeline`] | Cancellable file processing |
//! | [`status`] | Document registry and cancellation |
//! | [`service`] | The service facade |
//! | [`history`] | Conversation log |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod enrich;
pub mod error;
pub mod history;
pub mod http;
pub mod lexical;
pub mod llm;
pub mod loader;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod prompts;
pub mod retrieval;
pub mod service;
pub mod settings;
pub mod status;
pub mod vector;
