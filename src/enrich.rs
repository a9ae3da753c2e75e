//! Contextual chunk enrichment.
//!
//! Before indexing, each chunk can be prefixed with a short description of
//! where it sits in its document, written by the language model. Enrichment
//! never fails a run: any generator error is logged and the chunk is indexed
//! unchanged.

use std::sync::Arc;

use crate::llm::Generator;
use crate::prompts;

/// Documents longer than this (in characters) are cut down before prompting.
pub const DOCUMENT_CEILING: usize = 10_000;
/// Characters kept on each side of the chunk when the document is cut.
pub const CONTEXT_WINDOW: usize = 2_000;

pub struct ContextEnricher {
    generator: Arc<dyn Generator>,
}

impl ContextEnricher {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }

    /// Situating context for `chunk`, or `""` when the model fails.
    pub async fn context_for(&self, document: &str, chunk: &str) -> String {
        let excerpt = truncate_document(document, chunk);
        let prompt = prompts::chunk_context(&excerpt, chunk);
        match self.generator.complete(&prompt).await {
            Ok(context) => context.trim().to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "context generation failed; indexing chunk without context");
                String::new()
            }
        }
    }

    /// `context + "\n\n" + chunk`, or `None` when no context was produced.
    pub async fn enrich(&self, document: &str, chunk: &str) -> Option<String> {
        let context = self.context_for(document, chunk).await;
        if context.is_empty() {
            None
        } else {
            Some(format!("{}\n\n{}", context, chunk))
        }
    }
}

/// The part of `document` sent along with `chunk`.
///
/// Short documents are sent whole. Otherwise a window of
/// [`CONTEXT_WINDOW`] characters either side of the chunk is kept, marked
/// with `...` where it was cut; if the chunk cannot be found, the first and
/// last halves of the ceiling are joined with ` ... `.
pub fn truncate_document(document: &str, chunk: &str) -> String {
    let total = document.chars().count();
    if total <= DOCUMENT_CEILING {
        return document.to_string();
    }

    match document.find(chunk) {
        Some(byte_pos) => {
            let pos = document[..byte_pos].chars().count();
            let start = pos.saturating_sub(CONTEXT_WINDOW);
            let end = (pos + chunk.chars().count() + CONTEXT_WINDOW).min(total);
            let prefix = if start > 0 { "..." } else { "" };
            let suffix = if end < total { " ..." } else { "" };
            format!("{}{}{}", prefix, char_slice(document, start, end), suffix)
        }
        None => {
            let half = DOCUMENT_CEILING / 2;
            format!(
                "{} ... {}",
                char_slice(document, 0, half),
                char_slice(document, total - half, total)
            )
        }
    }
}

/// Substring by character positions `[start, end)`.
fn char_slice(s: &str, start: usize, end: usize) -> &str {
    let byte_at = |n: usize| s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len());
    &s[byte_at(start)..byte_at(end)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;

    struct Fixed(Result<String, String>);

    #[async_trait]
    impl Generator for Fixed {
        fn model_name(&self) -> &str {
            "fixed"
        }
        async fn complete(&self, _prompt: &str) -> Result<String> {
            self.0.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }

    fn filler(n: usize) -> String {
        "x".repeat(n)
    }

    #[test]
    fn test_short_document_is_sent_whole() {
        let doc = "short doc with CHUNK inside";
        assert_eq!(truncate_document(doc, "CHUNK"), doc);
    }

    #[test]
    fn test_window_around_located_chunk() {
        let doc = format!("{}CHUNK{}", filler(6_000), filler(6_000));
        let out = truncate_document(&doc, "CHUNK");
        assert!(out.starts_with("..."));
        assert!(out.ends_with(" ..."));
        assert_eq!(out.chars().count(), 3 + 2_000 + 5 + 2_000 + 4);
        assert!(out.contains("CHUNK"));
    }

    #[test]
    fn test_window_at_document_start_has_no_prefix() {
        let doc = format!("CHUNK{}", filler(12_000));
        let out = truncate_document(&doc, "CHUNK");
        assert!(out.starts_with("CHUNK"));
        assert!(out.ends_with(" ..."));
    }

    #[test]
    fn test_unlocated_chunk_uses_head_and_tail() {
        let doc = format!("{}{}", "a".repeat(6_000), "b".repeat(6_000));
        let out = truncate_document(&doc, "missing");
        assert_eq!(out, format!("{} ... {}", "a".repeat(5_000), "b".repeat(5_000)));
    }

    #[test]
    fn test_window_counts_characters() {
        let doc = format!("{}目標{}", "字".repeat(6_000), "字".repeat(6_000));
        let out = truncate_document(&doc, "目標");
        assert_eq!(out.chars().count(), 3 + 2_000 + 2 + 2_000 + 4);
    }

    #[tokio::test]
    async fn test_enrich_prefixes_context() {
        let enricher = ContextEnricher::new(Arc::new(Fixed(Ok(" From the intro. ".into()))));
        assert_eq!(
            enricher.enrich("doc", "chunk").await,
            Some("From the intro.\n\nchunk".to_string())
        );
    }

    #[tokio::test]
    async fn test_generator_failure_yields_no_context() {
        let enricher = ContextEnricher::new(Arc::new(Fixed(Err("rate limited".into()))));
        assert_eq!(enricher.context_for("doc", "chunk").await, "");
        assert_eq!(enricher.enrich("doc", "chunk").await, None);
    }

    #[tokio::test]
    async fn test_blank_context_is_not_prefixed() {
        let enricher = ContextEnricher::new(Arc::new(Fixed(Ok("   ".into()))));
        assert_eq!(enricher.enrich("doc", "chunk").await, None);
    }
}
