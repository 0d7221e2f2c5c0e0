//! Provider gateway — uniform access to chat-completion and embedding
//! capabilities.
//!
//! Every provider the server supports (LiteLLM, OpenRouter, Ollama) speaks
//! the OpenAI wire format behind a configurable base URL, so a single HTTP
//! backend ([`openai_compat`]) covers all of them. The compressor,
//! synthesizer, planner, and answerer all parameterize over the
//! [`ProviderGateway`] trait; tests substitute a deterministic stub.

pub mod openai_compat;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How an upstream failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// 5xx, 429, timeouts, connection failures — retried with backoff.
    Transient,
    /// Malformed request or response — retrying won't help.
    Permanent,
    /// Credential rejected upstream.
    Auth,
    /// Quota or spend cap exhausted.
    Budget,
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Permanent, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }
}

/// One message of a chat exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Chat result: free text, or a schema-validated JSON object.
#[derive(Debug, Clone)]
pub enum ChatOutput {
    Text(String),
    Structured(serde_json::Value),
}

impl ChatOutput {
    pub fn into_text(self) -> String {
        match self {
            Self::Text(t) => t,
            Self::Structured(v) => v.to_string(),
        }
    }

    pub fn into_structured(self) -> Result<serde_json::Value, ProviderError> {
        match self {
            Self::Structured(v) => Ok(v),
            Self::Text(t) => extract_json(&t)
                .ok_or_else(|| ProviderError::permanent("expected structured output, got text")),
        }
    }
}

/// Uniform capability interface over LLM providers.
///
/// Implementations retry transient failures internally with exponential
/// backoff and cap total wall time per call; errors surfacing from these
/// methods are post-retry.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Embed a batch of texts. Vectors are exactly [`Self::embedding_dim`]
    /// wide, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;

    /// Chat completion. With `schema`, the provider is asked for JSON and the
    /// response is validated against the schema's required keys before it is
    /// returned as [`ChatOutput::Structured`].
    async fn chat(
        &self,
        system: &str,
        messages: &[ChatMessage],
        schema: Option<&serde_json::Value>,
    ) -> Result<ChatOutput, ProviderError>;

    /// The embedding dimension this gateway produces (tenant-bound constant).
    fn embedding_dim(&self) -> usize;
}

/// Leniently extract a JSON value from LLM response text.
///
/// Models wrap JSON in prose or fenced blocks; try direct parse, then
/// ```` ```json ```` fences, then the first balanced object or array.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    // Fenced block: ```json ... ``` or plain ``` ... ```
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            if let Ok(value) = serde_json::from_str(after[..end].trim()) {
                return Some(value);
            }
        }
    }

    // First balanced {...} or [...]
    for open in ['{', '['] {
        if let Some(start) = trimmed.find(open) {
            if let Some(candidate) = balanced_slice(&trimmed[start..], open) {
                if let Ok(value) = serde_json::from_str(candidate) {
                    return Some(value);
                }
            }
        }
    }

    None
}

/// Slice of `text` covering one balanced bracket pair starting at index 0.
fn balanced_slice(text: &str, open: char) -> Option<&str> {
    let close = match open {
        '{' => '}',
        '[' => ']',
        _ => return None,
    };
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => in_string = !in_string,
            _ if in_string => {}
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[..i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Shallow validation: every key in the schema's `required` array must be
/// present in the object.
pub fn validate_against_schema(
    value: &serde_json::Value,
    schema: &serde_json::Value,
) -> Result<(), ProviderError> {
    let Some(required) = schema.get("required").and_then(|r| r.as_array()) else {
        return Ok(());
    };
    let Some(object) = value.as_object() else {
        return Err(ProviderError::permanent("structured output is not an object"));
    };
    for key in required {
        if let Some(key) = key.as_str() {
            if !object.contains_key(key) {
                return Err(ProviderError::permanent(format!(
                    "structured output missing required key '{key}'"
                )));
            }
        }
    }
    Ok(())
}
