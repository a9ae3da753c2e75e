//! Retrieval strategies: standard vector search, hybrid vector + BM25,
//! and multi-query fusion, with an optional reranking pass.
//!
//! Strategy selection is stateless per call. Results from several searches
//! are merged on a content-prefix key: the first occurrence keeps its
//! position, and a later duplicate with strictly longer content replaces it
//! in place.
//!
//! # Strategy Selection
//!
//! | toggles | lexical index | strategy |
//! |---|---|---|
//! | `hybrid` | present | [`Strategy::Hybrid`] |
//! | `fusion` (and not hybrid) | any | [`Strategy::Fusion`] |
//! | neither | any | [`Strategy::Standard`] |
//!
//! Reranking applies to standard and hybrid results. Fusion runs a plain
//! standard search per expanded query.
//!
//! # Query Expansion
//!
//! The model's reply is parsed line by line; list markers are stripped and
//! the original query always comes first:
//!
//! ```rust
//! use knowledge_rag::retrieval::parse_expansions;
//!
//! let queries = parse_expansions(
//!     "vacation policy",
//!     "1. paid leave rules\n2) holiday allowance\n- vacation policy",
//! );
//! assert_eq!(queries, vec!["vacation policy", "paid leave rules", "holiday allowance"]);
//! ```

use anyhow::Result;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::lexical::LexicalIndex;
use crate::llm::Generator;
use crate::models::Chunk;
use crate::prompts::{self, EXPANSION_COUNT, NO_OUTPUT};
use crate::settings::Settings;
use crate::vector::VectorIndex;

/// Characters of content that identify a passage when merging result sets.
pub const DEDUP_PREFIX_CHARS: usize = 100;

pub fn prefix_key(content: &str) -> String {
    content.chars().take(DEDUP_PREFIX_CHARS).collect()
}

/// Merge ranked chunks, dropping prefix duplicates, then keep `top_k`.
pub fn merge_dedup(chunks: impl IntoIterator<Item = Chunk>, top_k: usize) -> Vec<Chunk> {
    let mut merged: Vec<Chunk> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for chunk in chunks {
        let key = prefix_key(&chunk.content);
        match positions.get(&key) {
            Some(&i) => {
                if chunk.content.chars().count() > merged[i].content.chars().count() {
                    merged[i] = chunk;
                }
            }
            None => {
                positions.insert(key, merged.len());
                merged.push(chunk);
            }
        }
    }
    merged.truncate(top_k);
    merged
}

fn list_prefix() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:(?:query|q)\s*\d+\s*[:.)]|\d+\s*[.)、:：]|[-*•])\s*").ok()
    })
    .as_ref()
}

/// Queries for fusion retrieval: `original` first, then each non-empty line
/// of `response` with its list marker removed. Exact duplicates are dropped.
pub fn parse_expansions(original: &str, response: &str) -> Vec<String> {
    let mut queries = vec![original.to_string()];
    for line in response.lines() {
        let line = line.trim();
        let query = match list_prefix() {
            Some(re) => re.replace(line, "").trim().to_string(),
            None => line.to_string(),
        };
        if !query.is_empty() && !queries.contains(&query) {
            queries.push(query);
        }
    }
    queries
}

/// Boolean switches that shape one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryToggles {
    pub hybrid: bool,
    pub fusion: bool,
    pub reranking: bool,
    pub chain_of_thought: bool,
}

impl QueryToggles {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            hybrid: settings.use_hybrid,
            fusion: settings.use_rag_fusion,
            reranking: settings.use_reranking,
            chain_of_thought: settings.use_cot,
        }
    }

    /// Every switch flipped; used to produce an alternative answer.
    pub fn inverted(self) -> Self {
        Self {
            hybrid: !self.hybrid,
            fusion: !self.fusion,
            reranking: !self.reranking,
            chain_of_thought: !self.chain_of_thought,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Standard,
    Hybrid,
    Fusion,
}

impl Strategy {
    /// Hybrid wins when enabled and a lexical index exists, then fusion,
    /// then standard.
    pub fn select(toggles: QueryToggles, lexical_available: bool) -> Self {
        if toggles.hybrid && lexical_available {
            Strategy::Hybrid
        } else if toggles.fusion {
            Strategy::Fusion
        } else {
            Strategy::Standard
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Standard => "standard",
            Strategy::Hybrid => "hybrid",
            Strategy::Fusion => "fusion",
        }
    }
}

pub struct Retriever<'a> {
    vector: &'a VectorIndex,
    lexical: Option<&'a LexicalIndex>,
    generator: Option<&'a dyn Generator>,
    top_k: usize,
}

impl<'a> Retriever<'a> {
    pub fn new(
        vector: &'a VectorIndex,
        lexical: Option<&'a LexicalIndex>,
        generator: Option<&'a dyn Generator>,
        top_k: usize,
    ) -> Self {
        Self {
            vector,
            lexical,
            generator,
            top_k,
        }
    }

    pub async fn retrieve(&self, query: &str, toggles: QueryToggles) -> Result<Vec<Chunk>> {
        let strategy = Strategy::select(toggles, self.lexical.is_some());
        tracing::debug!(
            strategy = strategy.as_str(),
            reranking = toggles.reranking,
            top_k = self.top_k,
            "retrieving"
        );
        let chunks = match strategy {
            Strategy::Standard => self.standard(query, toggles.reranking).await?,
            Strategy::Hybrid => self.hybrid(query, toggles.reranking).await?,
            Strategy::Fusion => self.fusion(query).await?,
        };
        tracing::debug!(strategy = strategy.as_str(), hits = chunks.len(), "retrieved");
        Ok(chunks)
    }

    pub async fn standard(&self, query: &str, rerank: bool) -> Result<Vec<Chunk>> {
        let chunks = self.vector.search(query, self.top_k).await?;
        if rerank {
            Ok(self.rerank(query, chunks).await)
        } else {
            Ok(chunks)
        }
    }

    /// Vector hits followed by lexical hits, merged and cut to `top_k`.
    pub async fn hybrid(&self, query: &str, rerank: bool) -> Result<Vec<Chunk>> {
        let vector_hits = self.vector.search(query, self.top_k).await?;
        let lexical_hits = match self.lexical {
            Some(lexical) => lexical.search(query, self.top_k),
            None => Vec::new(),
        };
        let merged = merge_dedup(vector_hits.into_iter().chain(lexical_hits), self.top_k);
        if rerank {
            Ok(self.rerank(query, merged).await)
        } else {
            Ok(merged)
        }
    }

    /// Standard retrieval for the query and each of its expansions, merged.
    pub async fn fusion(&self, query: &str) -> Result<Vec<Chunk>> {
        let queries = self.expand_query(query).await;
        let mut all = Vec::new();
        for q in &queries {
            all.extend(self.standard(q, false).await?);
        }
        Ok(merge_dedup(all, self.top_k))
    }

    /// Alternative phrasings of `query`, original first. Falls back to the
    /// original alone when there is no generator or it fails.
    pub async fn expand_query(&self, query: &str) -> Vec<String> {
        let Some(generator) = self.generator else {
            tracing::debug!("no language model; skipping query expansion");
            return vec![query.to_string()];
        };
        match generator
            .complete(&prompts::query_expansion(query, EXPANSION_COUNT))
            .await
        {
            Ok(response) => parse_expansions(query, &response),
            Err(e) => {
                tracing::warn!(error = %e, "query expansion failed; using original query");
                vec![query.to_string()]
            }
        }
    }

    /// Replace each passage with the parts the model judges relevant.
    /// Passages answered with `NO_OUTPUT` (or nothing) are dropped; a
    /// failed call keeps the passage unchanged.
    pub async fn rerank(&self, query: &str, chunks: Vec<Chunk>) -> Vec<Chunk> {
        let Some(generator) = self.generator else {
            return chunks;
        };
        let mut kept = Vec::with_capacity(chunks.len());
        for mut chunk in chunks {
            let prompt = prompts::extract_relevant(query, &chunk.content);
            match generator.complete(&prompt).await {
                Ok(extracted) => {
                    let extracted = extracted.trim();
                    if extracted.is_empty() || extracted == NO_OUTPUT {
                        continue;
                    }
                    chunk.content = extracted.to_string();
                    chunk.metadata.enriched = false;
                    kept.push(chunk);
                }
                Err(e) => {
                    tracing::warn!(error = %e, chunk = %chunk.id, "reranking failed; keeping passage");
                    kept.push(chunk);
                }
            }
        }
        kept
    }
}
