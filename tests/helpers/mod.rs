#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{json, Value};
use tempfile::TempDir;

use simplemem::auth::{AuthKeys, TenantContext};
use simplemem::config::SimpleMemConfig;
use simplemem::db;
use simplemem::engine::{Engine, GatewayFactory};
use simplemem::provider::{ChatMessage, ChatOutput, ProviderError, ProviderGateway};

/// Embedding dimension used by all integration fixtures.
pub const DIM: usize = 16;

/// Deterministic bag-of-words embedding: each token bumps one dimension, so
/// texts sharing vocabulary land close in cosine space. Good enough to make
/// semantic retrieval behave without a model.
pub fn bag_of_words_embedding(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIM];
    for token in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
        if token.len() < 2 {
            continue;
        }
        let mut hash: usize = 0;
        for b in token.bytes() {
            hash = hash.wrapping_mul(31).wrapping_add(b as usize);
        }
        v[hash % DIM] += 1.0;
    }
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

/// Scripted gateway: routes each chat by the system prompt and falls back to
/// deterministic derivations, so whole pipelines run without a provider.
pub struct StubGateway {
    /// Density score returned for every window.
    pub density: f64,
    /// Scripted atomicization output; `None` derives one statement per turn.
    pub statements: Mutex<Option<Value>>,
    /// Scripted synthesis verdicts; `None` keeps everything separate.
    pub verdicts: Mutex<Option<Value>>,
}

impl Default for StubGateway {
    fn default() -> Self {
        Self {
            density: 0.9,
            statements: Mutex::new(None),
            verdicts: Mutex::new(None),
        }
    }
}

impl StubGateway {
    pub fn with_statements(self, statements: Value) -> Self {
        *self.statements.lock().unwrap() = Some(statements);
        self
    }

    pub fn with_verdicts(self, verdicts: Value) -> Self {
        *self.verdicts.lock().unwrap() = Some(verdicts);
        self
    }

    /// Derive one statement per window line: `[ts] speaker: content`.
    fn derive_statements(window: &str) -> Value {
        let statements: Vec<Value> = window
            .lines()
            .filter_map(|line| {
                let rest = line.strip_prefix('[')?;
                let (ts, rest) = rest.split_once("] ")?;
                let (_speaker, content) = rest.split_once(": ")?;
                Some(json!({
                    "text": content,
                    "timestamp_utc": ts,
                    "entities": [],
                    "persons": []
                }))
            })
            .collect();
        json!({ "statements": statements })
    }

    /// Derive one observation per event line: `[id] (kind @ ts) payload`.
    fn derive_observations(events: &str) -> Value {
        let observations: Vec<Value> = events
            .lines()
            .filter_map(|line| {
                let rest = line.strip_prefix('[')?;
                let (id, rest) = rest.split_once("] ")?;
                let (_meta, payload) = rest.split_once(") ")?;
                let id: i64 = id.parse().ok()?;
                Some(json!({
                    "category": "discovery",
                    "text": payload,
                    "evidence_event_ids": [id]
                }))
            })
            .collect();
        json!({ "observations": observations })
    }

    /// Answer with the concatenated unit texts, citing every listed unit.
    fn derive_answer(prompt: &str) -> Value {
        let mut cited = Vec::new();
        let mut texts = Vec::new();
        for line in prompt.lines() {
            let Some(rest) = line.strip_prefix('[') else {
                continue;
            };
            let Some((id, rest)) = rest.split_once("] ") else {
                continue;
            };
            let Ok(id) = id.parse::<i64>() else { continue };
            let text = rest.split_once(") ").map(|(_, t)| t).unwrap_or(rest);
            cited.push(id);
            texts.push(text.to_string());
        }
        json!({ "answer": texts.join(" ; "), "cited_unit_ids": cited })
    }
}

#[async_trait]
impl ProviderGateway for StubGateway {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| bag_of_words_embedding(t)).collect())
    }

    async fn chat(
        &self,
        system: &str,
        messages: &[ChatMessage],
        _schema: Option<&Value>,
    ) -> Result<ChatOutput, ProviderError> {
        let prompt = messages.last().map(|m| m.content.as_str()).unwrap_or("");

        if system.contains("rate conversation windows") {
            return Ok(ChatOutput::Structured(json!({ "score": self.density })));
        }
        if system.contains("distill conversation") {
            let scripted = self.statements.lock().unwrap().clone();
            let value = scripted.unwrap_or_else(|| {
                // The window follows the anchor block.
                let window = prompt.split_once("Conversation window:\n").map_or("", |x| x.1);
                Self::derive_statements(window)
            });
            return Ok(ChatOutput::Structured(value));
        }
        if system.contains("compare a new memory statement") {
            let mut scripted = self.verdicts.lock().unwrap();
            let value = match scripted.as_mut() {
                // An array scripts one verdict per call, consumed in order.
                Some(Value::Array(queue)) if !queue.is_empty() => queue.remove(0),
                Some(Value::Array(_)) | None => json!({ "verdicts": [] }),
                Some(other) => other.clone(),
            };
            return Ok(ChatOutput::Structured(value));
        }
        if system.contains("plan memory retrieval") {
            let query = prompt.strip_prefix("Question: ").unwrap_or(prompt);
            return Ok(ChatOutput::Structured(json!({
                "q_sem": query,
                "q_lex": [],
                "q_sym": null,
                "intent": "unknown"
            })));
        }
        if system.contains("answer questions strictly") {
            return Ok(ChatOutput::Structured(Self::derive_answer(prompt)));
        }
        if system.contains("extract durable observations") {
            return Ok(ChatOutput::Structured(Self::derive_observations(prompt)));
        }
        if system.contains("Summarize this agent session") {
            let first = prompt.lines().next().unwrap_or("nothing");
            return Ok(ChatOutput::Text(format!("Session summary: {first}")));
        }
        Ok(ChatOutput::Text("ok".into()))
    }

    fn embedding_dim(&self) -> usize {
        DIM
    }
}

/// Config pinned to a temp directory, small dimension, and test keys.
pub fn test_config(tmp: &TempDir) -> SimpleMemConfig {
    let mut config = SimpleMemConfig::default();
    config.auth.jwt_secret_key = "integration-test-secret".into();
    config.auth.encryption_key =
        base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
    config.storage.user_db_path = tmp
        .path()
        .join("users.db")
        .to_string_lossy()
        .into_owned();
    config.storage.vector_db_path = tmp
        .path()
        .join("tenants")
        .to_string_lossy()
        .into_owned();
    config.llm.embedding_dimension = DIM;
    config.memory.window_size = 10;
    config.session.context_token_budget = 300;
    config
}

/// An engine wired to the stub gateway, rooted in a fresh temp directory.
pub fn test_engine() -> (Engine, TempDir) {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let engine = engine_with(config, || Arc::new(StubGateway::default()));
    (engine, tmp)
}

/// Engine whose gateway comes from the given constructor (scripted stubs).
pub fn engine_with<F>(config: SimpleMemConfig, make_gateway: F) -> Engine
where
    F: Fn() -> Arc<dyn ProviderGateway> + Send + Sync + 'static,
{
    let keys = Arc::new(AuthKeys::from_config(&config.auth).unwrap());
    let meta = db::open_meta_database(config.resolved_user_db_path()).unwrap();
    let factory: GatewayFactory = Box::new(move |_api_key| Ok(make_gateway()));
    Engine::with_gateway_factory(config, keys, meta, factory)
}

/// Register a tenant and hand back its verified context.
pub fn register_tenant(engine: &Engine) -> TenantContext {
    let (user_id, token) = engine.register("sk-test-provider-key").unwrap();
    let ctx = engine.auth_keys().verify_token(&token).unwrap();
    assert_eq!(ctx.user_id, user_id);
    ctx
}
