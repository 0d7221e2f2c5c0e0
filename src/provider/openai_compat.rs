//! OpenAI-format HTTP backend for the provider gateway.
//!
//! Connects to any server exposing `/chat/completions` and `/embeddings` in
//! the OpenAI wire format — LiteLLM, OpenRouter, and Ollama all do. Transient
//! failures (5xx, 429, timeouts) are retried with exponential backoff up to
//! `max_retries`; each attempt is capped by the client timeout.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{
    extract_json, validate_against_schema, ChatMessage, ChatOutput, ProviderError,
    ProviderErrorKind, ProviderGateway,
};
use crate::config::LlmConfig;

/// Initial backoff between retry attempts; doubles per attempt.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

pub struct OpenAiCompatGateway {
    client: Client,
    base_url: String,
    api_key: String,
    llm_model: String,
    embedding_model: String,
    embedding_dim: usize,
    temperature: f64,
    max_retries: u32,
}

impl OpenAiCompatGateway {
    /// Build a gateway for one tenant's credential against the configured
    /// provider base URL.
    pub fn new(config: &LlmConfig, base_url: String, api_key: String) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::permanent(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            api_key,
            llm_model: config.llm_model.clone(),
            embedding_model: config.embedding_model.clone(),
            embedding_dim: config.embedding_dimension,
            temperature: config.temperature,
            max_retries: config.max_retries,
        })
    }

    /// POST a JSON body, retrying transient failures with exponential backoff.
    async fn post_with_retry(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        let mut backoff = RETRY_BACKOFF;
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }

            match self.post_once(url, body).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    tracing::warn!(url, attempt, error = %err, "transient provider failure, retrying");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or_else(|| ProviderError::transient("retries exhausted")))
    }

    async fn post_once(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        let response = self
            .client
            .post(url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    ProviderError::transient(e.to_string())
                } else {
                    ProviderError::permanent(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                classify_status(status),
                format!("{status}: {text}"),
            ));
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::permanent(format!("malformed provider response: {e}")))
    }
}

fn classify_status(status: StatusCode) -> ProviderErrorKind {
    match status.as_u16() {
        401 | 403 => ProviderErrorKind::Auth,
        402 => ProviderErrorKind::Budget,
        429 => ProviderErrorKind::Transient,
        s if s >= 500 => ProviderErrorKind::Transient,
        _ => ProviderErrorKind::Permanent,
    }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[async_trait]
impl ProviderGateway for OpenAiCompatGateway {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.base_url);
        let body = json!({
            "model": self.embedding_model,
            "input": texts,
        });

        let raw = self.post_with_retry(&url, &body).await?;
        let parsed: EmbeddingResponse = serde_json::from_value(raw)
            .map_err(|e| ProviderError::permanent(format!("malformed embedding response: {e}")))?;

        if parsed.data.len() != texts.len() {
            return Err(ProviderError::permanent(format!(
                "embedding count mismatch: sent {}, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        let mut vectors = Vec::with_capacity(parsed.data.len());
        for datum in parsed.data {
            if datum.embedding.len() != self.embedding_dim {
                return Err(ProviderError::permanent(format!(
                    "embedding dimension mismatch: got {}, expected {}",
                    datum.embedding.len(),
                    self.embedding_dim
                )));
            }
            vectors.push(datum.embedding);
        }
        Ok(vectors)
    }

    async fn chat(
        &self,
        system: &str,
        messages: &[ChatMessage],
        schema: Option<&serde_json::Value>,
    ) -> Result<ChatOutput, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut wire_messages = vec![json!({"role": "system", "content": system})];
        for message in messages {
            wire_messages.push(json!({"role": message.role, "content": message.content}));
        }

        let mut body = json!({
            "model": self.llm_model,
            "messages": wire_messages,
            "temperature": self.temperature,
        });
        if schema.is_some() {
            body["response_format"] = json!({"type": "json_object"});
        }

        let raw = self.post_with_retry(&url, &body).await?;
        let parsed: ChatCompletionResponse = serde_json::from_value(raw)
            .map_err(|e| ProviderError::permanent(format!("malformed chat response: {e}")))?;

        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        match schema {
            None => Ok(ChatOutput::Text(content)),
            Some(schema) => {
                let value = extract_json(&content).ok_or_else(|| {
                    ProviderError::permanent("provider returned no parseable JSON")
                })?;
                validate_against_schema(&value, schema)?;
                Ok(ChatOutput::Structured(value))
            }
        }
    }

    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }
}
