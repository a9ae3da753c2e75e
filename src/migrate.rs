use anyhow::Result;
use sqlx::SqlitePool;

/// Create the metadata schema. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            original_name TEXT NOT NULL,
            path TEXT NOT NULL,
            file_type TEXT NOT NULL,
            file_size INTEGER NOT NULL DEFAULT 0,
            uploaded_at INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'uploading',
            chunks_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Every column is nullable so rows written by older builds load with defaults.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            embedding_model TEXT,
            llm_model TEXT,
            temperature REAL,
            max_tokens INTEGER,
            chunk_size INTEGER,
            chunk_overlap INTEGER,
            top_k INTEGER,
            use_rag_fusion INTEGER,
            use_reranking INTEGER,
            use_cot INTEGER,
            use_bm25 INTEGER,
            use_contextual_embeddings INTEGER,
            use_hybrid INTEGER,
            use_intelligent_splitting INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversation_log (
            id TEXT PRIMARY KEY,
            question TEXT NOT NULL,
            answer TEXT NOT NULL,
            passages_json TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_conversation_created_at ON conversation_log(created_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
