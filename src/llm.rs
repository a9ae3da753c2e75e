//! Language model providers.
//!
//! The [`Generator`] turns a prompt into text. It is used for context
//! enrichment, query expansion, reranking and answer synthesis.
//!
//! | `llm.provider` | implementation | endpoint |
//! |---|---|---|
//! | `disabled` | none (`create_generator` returns `None`) | |
//! | `openai` | [`OpenAIGenerator`] | `POST /v1/chat/completions` |
//! | `ollama` | [`OllamaGenerator`] | `POST /api/generate` |

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::LlmConfig;
use crate::http;
use crate::settings::Settings;

#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Sampling parameters taken from the settings snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl GenerationParams {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            model: settings.llm_model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        }
    }
}

pub struct OpenAIGenerator {
    params: GenerationParams,
    api_key: String,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIGenerator {
    pub fn new(config: &LlmConfig, params: GenerationParams) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        Ok(Self {
            params,
            api_key,
            url: format!("{}/v1/chat/completions", base.trim_end_matches('/')),
            max_retries: config.max_retries,
            client: http::build_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Generator for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.params.model
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.params.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": self.params.temperature,
            "max_tokens": self.params.max_tokens,
        });
        let json = http::post_json(
            &self.client,
            &self.url,
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        parse_chat_response(&json)
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing choices[0].message.content"))
}

pub struct OllamaGenerator {
    params: GenerationParams,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &LlmConfig, params: GenerationParams) -> Result<Self> {
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            params,
            url: format!("{}/api/generate", base.trim_end_matches('/')),
            max_retries: config.max_retries,
            client: http::build_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.params.model
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.params.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": self.params.temperature,
                "num_predict": self.params.max_tokens,
            },
        });
        let json =
            http::post_json(&self.client, &self.url, None, &body, self.max_retries, "Ollama")
                .await?;
        parse_generate_response(&json)
    }
}

fn parse_generate_response(json: &serde_json::Value) -> Result<String> {
    json.get("response")
        .and_then(|r| r.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing response"))
}

/// Build the generator for the current settings, or `None` when no language
/// model is configured.
pub fn create_generator(config: &LlmConfig, settings: &Settings) -> Result<Option<Arc<dyn Generator>>> {
    let params = GenerationParams::from_settings(settings);
    let generator: Arc<dyn Generator> = match config.provider.as_str() {
        "disabled" => return Ok(None),
        "openai" => Arc::new(OpenAIGenerator::new(config, params)?),
        "ollama" => Arc::new(OllamaGenerator::new(config, params)?),
        other => bail!("Unknown llm provider: {}", other),
    };
    Ok(Some(generator))
}
