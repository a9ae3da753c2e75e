//! Runtime-tunable settings.
//!
//! A single row in the `settings` table holds the current values. Missing
//! rows and NULL columns load as defaults. Updates go through a
//! [`SettingsPatch`], are validated, persisted, and then published as a new
//! immutable snapshot in a [`SettingsHandle`]. Readers take a snapshot at the
//! start of each processing run or query and keep it for the whole call.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub embedding_model: String,
    pub llm_model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Characters per chunk for the fixed-window splitter and the paragraph
    /// accumulation budget.
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub use_rag_fusion: bool,
    pub use_reranking: bool,
    pub use_cot: bool,
    pub use_bm25: bool,
    pub use_contextual_embeddings: bool,
    pub use_hybrid: bool,
    pub use_intelligent_splitting: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            embedding_model: "text-embedding-3-small".to_string(),
            llm_model: "gpt-4o-mini".to_string(),
            temperature: 0.1,
            max_tokens: 1000,
            chunk_size: 1000,
            chunk_overlap: 200,
            top_k: 4,
            use_rag_fusion: false,
            use_reranking: false,
            use_cot: false,
            use_bm25: true,
            use_contextual_embeddings: true,
            use_hybrid: true,
            use_intelligent_splitting: true,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be > 0");
        }
        if self.chunk_overlap >= self.chunk_size {
            bail!(
                "chunk_overlap ({}) must be less than chunk_size ({})",
                self.chunk_overlap,
                self.chunk_size
            );
        }
        if self.top_k == 0 {
            bail!("top_k must be >= 1");
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            bail!("temperature must be between 0.0 and 2.0");
        }
        if self.max_tokens == 0 {
            bail!("max_tokens must be > 0");
        }
        if self.embedding_model.trim().is_empty() {
            bail!("embedding_model must not be empty");
        }
        if self.llm_model.trim().is_empty() {
            bail!("llm_model must not be empty");
        }
        Ok(())
    }

    /// A copy of `self` with every field present in `patch` replaced.
    pub fn apply(&self, patch: &SettingsPatch) -> Settings {
        let mut next = self.clone();
        if let Some(v) = &patch.embedding_model {
            next.embedding_model = v.clone();
        }
        if let Some(v) = &patch.llm_model {
            next.llm_model = v.clone();
        }
        if let Some(v) = patch.temperature {
            next.temperature = v;
        }
        if let Some(v) = patch.max_tokens {
            next.max_tokens = v;
        }
        if let Some(v) = patch.chunk_size {
            next.chunk_size = v;
        }
        if let Some(v) = patch.chunk_overlap {
            next.chunk_overlap = v;
        }
        if let Some(v) = patch.top_k {
            next.top_k = v;
        }
        if let Some(v) = patch.use_rag_fusion {
            next.use_rag_fusion = v;
        }
        if let Some(v) = patch.use_reranking {
            next.use_reranking = v;
        }
        if let Some(v) = patch.use_cot {
            next.use_cot = v;
        }
        if let Some(v) = patch.use_bm25 {
            next.use_bm25 = v;
        }
        if let Some(v) = patch.use_contextual_embeddings {
            next.use_contextual_embeddings = v;
        }
        if let Some(v) = patch.use_hybrid {
            next.use_hybrid = v;
        }
        if let Some(v) = patch.use_intelligent_splitting {
            next.use_intelligent_splitting = v;
        }
        next
    }

    /// Whether switching from `self` to `next` requires a new generator.
    pub fn generator_changed(&self, next: &Settings) -> bool {
        self.llm_model != next.llm_model
            || self.temperature != next.temperature
            || self.max_tokens != next.max_tokens
    }
}

/// Partial update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsPatch {
    pub embedding_model: Option<String>,
    pub llm_model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub top_k: Option<usize>,
    pub use_rag_fusion: Option<bool>,
    pub use_reranking: Option<bool>,
    pub use_cot: Option<bool>,
    pub use_bm25: Option<bool>,
    pub use_contextual_embeddings: Option<bool>,
    pub use_hybrid: Option<bool>,
    pub use_intelligent_splitting: Option<bool>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        self == &SettingsPatch::default()
    }

    /// Parse a `key=value` assignment (as given on the command line) into
    /// this patch.
    pub fn set(&mut self, assignment: &str) -> Result<()> {
        let (key, value) = assignment
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("expected key=value, got '{}'", assignment))?;
        let key = key.trim();
        let value = value.trim();

        match key {
            "embedding_model" => self.embedding_model = Some(value.to_string()),
            "llm_model" => self.llm_model = Some(value.to_string()),
            "temperature" => self.temperature = Some(parse_number(key, value)?),
            "max_tokens" => self.max_tokens = Some(parse_number(key, value)?),
            "chunk_size" => self.chunk_size = Some(parse_number(key, value)?),
            "chunk_overlap" => self.chunk_overlap = Some(parse_number(key, value)?),
            "top_k" => self.top_k = Some(parse_number(key, value)?),
            "use_rag_fusion" => self.use_rag_fusion = Some(parse_bool(key, value)?),
            "use_reranking" => self.use_reranking = Some(parse_bool(key, value)?),
            "use_cot" => self.use_cot = Some(parse_bool(key, value)?),
            "use_bm25" => self.use_bm25 = Some(parse_bool(key, value)?),
            "use_contextual_embeddings" => {
                self.use_contextual_embeddings = Some(parse_bool(key, value)?)
            }
            "use_hybrid" => self.use_hybrid = Some(parse_bool(key, value)?),
            "use_intelligent_splitting" => {
                self.use_intelligent_splitting = Some(parse_bool(key, value)?)
            }
            other => bail!("unknown setting: '{}'", other),
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid value for {}: '{}'", key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => bail!("invalid boolean for {}: '{}'", key, value),
    }
}

/// Holder for the current settings snapshot.
pub struct SettingsHandle {
    current: RwLock<Arc<Settings>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            current: RwLock::new(Arc::new(settings)),
        }
    }

    pub fn snapshot(&self) -> Arc<Settings> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, settings: Settings) -> Arc<Settings> {
        let next = Arc::new(settings);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next.clone();
        next
    }
}

/// Load settings, filling anything not yet persisted with defaults.
pub async fn load_settings(pool: &SqlitePool) -> Result<Settings> {
    let row = sqlx::query("SELECT * FROM settings WHERE id = 1")
        .fetch_optional(pool)
        .await
        .context("Failed to read settings")?;

    let defaults = Settings::default();
    let Some(row) = row else {
        return Ok(defaults);
    };

    let int = |name: &str| -> Result<Option<i64>> { Ok(row.try_get::<Option<i64>, _>(name)?) };
    let flag = |name: &str| -> Result<Option<bool>> { Ok(row.try_get::<Option<bool>, _>(name)?) };
    let count = |name: &str, default: usize| -> Result<usize> {
        Ok(int(name)?
            .map(|v| {
                usize::try_from(v).unwrap_or_else(|_| {
                    tracing::warn!(setting = name, value = v, "stored setting out of range; using default");
                    default
                })
            })
            .unwrap_or(default))
    };

    let max_tokens = int("max_tokens")?
        .map(|v| {
            u32::try_from(v).unwrap_or_else(|_| {
                tracing::warn!(setting = "max_tokens", value = v, "stored setting out of range; using default");
                defaults.max_tokens
            })
        })
        .unwrap_or(defaults.max_tokens);

    let loaded = Settings {
        embedding_model: row
            .try_get::<Option<String>, _>("embedding_model")?
            .unwrap_or_else(|| defaults.embedding_model.clone()),
        llm_model: row
            .try_get::<Option<String>, _>("llm_model")?
            .unwrap_or_else(|| defaults.llm_model.clone()),
        temperature: row
            .try_get::<Option<f64>, _>("temperature")?
            .unwrap_or(defaults.temperature),
        max_tokens,
        chunk_size: count("chunk_size", defaults.chunk_size)?,
        chunk_overlap: count("chunk_overlap", defaults.chunk_overlap)?,
        top_k: count("top_k", defaults.top_k)?,
        use_rag_fusion: flag("use_rag_fusion")?.unwrap_or(defaults.use_rag_fusion),
        use_reranking: flag("use_reranking")?.unwrap_or(defaults.use_reranking),
        use_cot: flag("use_cot")?.unwrap_or(defaults.use_cot),
        use_bm25: flag("use_bm25")?.unwrap_or(defaults.use_bm25),
        use_contextual_embeddings: flag("use_contextual_embeddings")?
            .unwrap_or(defaults.use_contextual_embeddings),
        use_hybrid: flag("use_hybrid")?.unwrap_or(defaults.use_hybrid),
        use_intelligent_splitting: flag("use_intelligent_splitting")?
            .unwrap_or(defaults.use_intelligent_splitting),
    };

    if let Err(e) = loaded.validate() {
        tracing::warn!(error = %e, "stored settings are invalid; using defaults");
        return Ok(defaults);
    }
    Ok(loaded)
}

pub async fn save_settings(pool: &SqlitePool, settings: &Settings) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (
            id, embedding_model, llm_model, temperature, max_tokens,
            chunk_size, chunk_overlap, top_k,
            use_rag_fusion, use_reranking, use_cot, use_bm25,
            use_contextual_embeddings, use_hybrid, use_intelligent_splitting
        ) VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            embedding_model = excluded.embedding_model,
            llm_model = excluded.llm_model,
            temperature = excluded.temperature,
            max_tokens = excluded.max_tokens,
            chunk_size = excluded.chunk_size,
            chunk_overlap = excluded.chunk_overlap,
            top_k = excluded.top_k,
            use_rag_fusion = excluded.use_rag_fusion,
            use_reranking = excluded.use_reranking,
            use_cot = excluded.use_cot,
            use_bm25 = excluded.use_bm25,
            use_contextual_embeddings = excluded.use_contextual_embeddings,
            use_hybrid = excluded.use_hybrid,
            use_intelligent_splitting = excluded.use_intelligent_splitting
        "#,
    )
    .bind(&settings.embedding_model)
    .bind(&settings.llm_model)
    .bind(settings.temperature)
    .bind(settings.max_tokens as i64)
    .bind(settings.chunk_size as i64)
    .bind(settings.chunk_overlap as i64)
    .bind(settings.top_k as i64)
    .bind(settings.use_rag_fusion)
    .bind(settings.use_reranking)
    .bind(settings.use_cot)
    .bind(settings.use_bm25)
    .bind(settings.use_contextual_embeddings)
    .bind(settings.use_hybrid)
    .bind(settings.use_intelligent_splitting)
    .execute(pool)
    .await
    .context("Failed to save settings")?;

    Ok(())
}
