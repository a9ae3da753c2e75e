//! Conversation log: every answered question with the passages behind it.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::Passage;

#[derive(Debug, Clone, Serialize)]
pub struct ConversationEntry {
    pub id: String,
    pub question: String,
    pub answer: String,
    pub passages: Vec<Passage>,
    pub created_at: i64,
}

pub async fn record(
    pool: &SqlitePool,
    question: &str,
    answer: &str,
    passages: &[Passage],
) -> Result<ConversationEntry> {
    let entry = ConversationEntry {
        id: Uuid::new_v4().to_string(),
        question: question.to_string(),
        answer: answer.to_string(),
        passages: passages.to_vec(),
        created_at: chrono::Utc::now().timestamp(),
    };
    sqlx::query(
        "INSERT INTO conversation_log (id, question, answer, passages_json, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&entry.id)
    .bind(&entry.question)
    .bind(&entry.answer)
    .bind(serde_json::to_string(&entry.passages)?)
    .bind(entry.created_at)
    .execute(pool)
    .await
    .context("failed to write conversation log")?;
    Ok(entry)
}

/// Most recent entries first.
pub async fn recent(pool: &SqlitePool, limit: i64) -> Result<Vec<ConversationEntry>> {
    let rows = sqlx::query(
        "SELECT id, question, answer, passages_json, created_at
         FROM conversation_log ORDER BY created_at DESC, rowid DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let passages_json: String = row.get("passages_json");
        let passages: Vec<Passage> = serde_json::from_str(&passages_json).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "unreadable passages in conversation log");
            Vec::new()
        });
        entries.push(ConversationEntry {
            id: row.get("id"),
            question: row.get("question"),
            answer: row.get("answer"),
            passages,
            created_at: row.get("created_at"),
        });
    }
    Ok(entries)
}
