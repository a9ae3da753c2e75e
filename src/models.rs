//! Core data models used throughout the service.
//!
//! These types represent the documents, chunks, and query answers that flow
//! through the ingestion and retrieval pipeline.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of one document's ingestion.
///
/// `uploading → processing → {processed | error | cancelled}`. Cancellation
/// is only accepted while uploading or processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Uploading,
    Processing,
    Processed,
    Error,
    Cancelled,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploading => "uploading",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Processed => "processed",
            DocumentStatus::Error => "error",
            DocumentStatus::Cancelled => "cancelled",
        }
    }

    /// True while a run may still be cancelled.
    pub fn is_active(&self) -> bool {
        matches!(self, DocumentStatus::Uploading | DocumentStatus::Processing)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(DocumentStatus::Uploading),
            "processing" => Ok(DocumentStatus::Processing),
            "processed" => Ok(DocumentStatus::Processed),
            "error" => Ok(DocumentStatus::Error),
            "cancelled" => Ok(DocumentStatus::Cancelled),
            other => anyhow::bail!("unknown document status: '{}'", other),
        }
    }
}

/// A registered input file.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub original_name: String,
    pub path: String,
    pub file_type: String,
    pub file_size: i64,
    pub uploaded_at: i64,
    pub status: DocumentStatus,
    pub chunks_count: i64,
}

/// Metadata recorded alongside every indexed chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Document-group identifier; `None` marks an orphan that cannot be
    /// deleted by document id.
    pub document_id: Option<String>,
    pub source: String,
    pub chunk_index: i64,
    /// 0-based page or section number, best effort.
    pub page: i64,
    /// Content starts with a generated context paragraph.
    pub enriched: bool,
}

/// A contiguous span of a document's cleaned text.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub content: String,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// Build a chunk whose id is derived from its owner, position and text,
    /// so re-processing unchanged input yields identical ids.
    pub fn new(content: String, metadata: ChunkMetadata) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(metadata.document_id.as_deref().unwrap_or("").as_bytes());
        hasher.update(metadata.source.as_bytes());
        hasher.update(metadata.chunk_index.to_le_bytes());
        hasher.update(content.as_bytes());
        let id = format!("{:x}", hasher.finalize());
        Self {
            id,
            content,
            metadata,
        }
    }

    pub fn document_id(&self) -> Option<&str> {
        self.metadata.document_id.as_deref()
    }

    /// The chunk text without any generated context prefix.
    pub fn original_content(&self) -> &str {
        if self.metadata.enriched {
            if let Some((_, rest)) = self.content.split_once("\n\n") {
                return rest;
            }
        }
        &self.content
    }
}

/// One page (or section) produced by a document loader.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub number: i64,
    pub text: String,
}

/// A retrieved passage with provenance, as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub content: String,
    pub document_id: String,
    pub document_name: String,
    /// 1-based page number.
    pub page: Option<i64>,
}

/// Result of a question against the knowledge base.
#[derive(Debug, Clone, Serialize)]
pub struct QueryAnswer {
    pub answer: String,
    pub passages: Vec<Passage>,
}

impl QueryAnswer {
    pub fn message(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            passages: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(doc: &str, index: i64, enriched: bool) -> ChunkMetadata {
        ChunkMetadata {
            document_id: Some(doc.to_string()),
            source: "/data/a.txt".to_string(),
            chunk_index: index,
            page: 0,
            enriched,
        }
    }

    #[test]
    fn test_status_roundtrip_strings() {
        for status in [
            DocumentStatus::Uploading,
            DocumentStatus::Processing,
            DocumentStatus::Processed,
            DocumentStatus::Error,
            DocumentStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<DocumentStatus>().unwrap(), status);
        }
        assert!("done".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn test_only_uploading_and_processing_are_active() {
        assert!(DocumentStatus::Uploading.is_active());
        assert!(DocumentStatus::Processing.is_active());
        assert!(!DocumentStatus::Processed.is_active());
        assert!(!DocumentStatus::Error.is_active());
        assert!(!DocumentStatus::Cancelled.is_active());
    }

    #[test]
    fn test_chunk_ids_are_deterministic() {
        let a = Chunk::new("hello".into(), meta("d1", 0, false));
        let b = Chunk::new("hello".into(), meta("d1", 0, false));
        let c = Chunk::new("hello".into(), meta("d1", 1, false));
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_original_content_strips_context_only_when_enriched() {
        let enriched = Chunk::new("Context line.\n\nBody\n\nMore".into(), meta("d1", 0, true));
        assert_eq!(enriched.original_content(), "Body\n\nMore");

        let plain = Chunk::new("Body\n\nMore".into(), meta("d1", 0, false));
        assert_eq!(plain.original_content(), "Body\n\nMore");
    }
}
