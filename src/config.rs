use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimpleMemConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
    pub llm: LlmConfig,
    pub memory: MemoryConfig,
    pub session: SessionConfig,
    pub consolidation: ConsolidationConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub base_url: Option<String>,
    pub log_level: String,
    /// Per-request deadline applied to tool calls and retrieval.
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 signing secret for bearer tokens.
    pub jwt_secret_key: String,
    /// Base64-encoded 32-byte AEAD key for stored provider credentials.
    pub encryption_key: String,
    pub jwt_expiration_days: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Metadata database: users, sessions, events, observations.
    pub user_db_path: String,
    /// Directory holding one unit database per tenant.
    pub vector_db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    /// One of "litellm", "openrouter", "ollama".
    pub provider: String,
    pub litellm_base_url: Option<String>,
    pub openrouter_base_url: String,
    pub ollama_base_url: String,
    pub llm_model: String,
    pub embedding_model: String,
    /// Write-once per tenant: checked against the tenant database on open.
    pub embedding_dimension: usize,
    pub temperature: f64,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MemoryConfig {
    /// Compressor window size W (dialogue turns per window).
    pub window_size: usize,
    /// Density-gate threshold; windows scoring below are dropped.
    pub density_threshold: f64,
    /// Retrieval depth when the planner yields none.
    pub top_k: usize,
    /// Synthesizer candidate count per new unit.
    pub synthesis_candidates: usize,
    /// View weights for retrieval ranking.
    pub semantic_weight: f64,
    pub lexical_weight: f64,
    pub symbolic_weight: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    /// Token budget B for injected context bundles.
    pub context_token_budget: usize,
    /// Redaction tier 3: cap on persisted event payload bytes.
    pub max_event_bytes: usize,
    /// Redaction tier 2: additional identifier patterns (regex source).
    pub redact_patterns: Vec<String>,
    /// Gap (seconds) that splits events into separate topical runs.
    pub segment_gap_secs: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Cosine similarity floor for merge candidates.
    pub merge_threshold: f64,
    /// Decay half-life in days (λ = ln 2 / half_life).
    pub decay_half_life_days: f64,
    /// Units below this score with no parent are tombstoned.
    pub prune_floor: f64,
    /// Tombstones older than this are hard-deleted.
    pub tombstone_grace_days: i64,
}

impl Default for SimpleMemConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            storage: StorageConfig::default(),
            llm: LlmConfig::default(),
            memory: MemoryConfig::default(),
            session: SessionConfig::default(),
            consolidation: ConsolidationConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            base_url: None,
            log_level: "info".into(),
            request_timeout_secs: 30,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret_key: String::new(),
            encryption_key: String::new(),
            jwt_expiration_days: 30,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            user_db_path: data_dir.join("users.db").to_string_lossy().into_owned(),
            vector_db_path: data_dir.join("tenants").to_string_lossy().into_owned(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openrouter".into(),
            litellm_base_url: None,
            openrouter_base_url: "https://openrouter.ai/api/v1".into(),
            ollama_base_url: "http://localhost:11434/v1".into(),
            llm_model: "openai/gpt-4.1-mini".into(),
            embedding_model: "text-embedding-3-small".into(),
            embedding_dimension: 1536,
            temperature: 0.1,
            max_retries: 3,
            timeout_secs: 120,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            density_threshold: 0.3,
            top_k: 8,
            synthesis_candidates: 8,
            semantic_weight: 0.6,
            lexical_weight: 0.3,
            symbolic_weight: 0.1,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            context_token_budget: 2000,
            max_event_bytes: 16 * 1024,
            redact_patterns: Vec::new(),
            segment_gap_secs: 300,
        }
    }
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            merge_threshold: 0.88,
            decay_half_life_days: 30.0,
            prune_floor: 0.05,
            tombstone_grace_days: 7,
        }
    }
}

/// Returns `~/.simplemem/`
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".simplemem")
}

/// Returns the default config file path: `~/.simplemem/config.toml`
pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.toml")
}

impl SimpleMemConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            SimpleMemConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (see README for the full list).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("HOST") {
            self.server.host = val;
        }
        if let Ok(val) = std::env::var("PORT") {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }
        if let Ok(val) = std::env::var("BASE_URL") {
            self.server.base_url = Some(val);
        }
        if let Ok(val) = std::env::var("SIMPLEMEM_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("JWT_SECRET_KEY") {
            self.auth.jwt_secret_key = val;
        }
        if let Ok(val) = std::env::var("ENCRYPTION_KEY") {
            self.auth.encryption_key = val;
        }
        if let Ok(val) = std::env::var("JWT_EXPIRATION_DAYS") {
            if let Ok(days) = val.parse() {
                self.auth.jwt_expiration_days = days;
            }
        }
        if let Ok(val) = std::env::var("USER_DB_PATH") {
            self.storage.user_db_path = val;
        }
        if let Ok(val) = std::env::var("VECTOR_DB_PATH") {
            self.storage.vector_db_path = val;
        }
        if let Ok(val) = std::env::var("LLM_PROVIDER") {
            self.llm.provider = val;
        }
        if let Ok(val) = std::env::var("LITELLM_BASE_URL") {
            self.llm.litellm_base_url = Some(val);
        }
        if let Ok(val) = std::env::var("OPENROUTER_BASE_URL") {
            self.llm.openrouter_base_url = val;
        }
        if let Ok(val) = std::env::var("OLLAMA_BASE_URL") {
            self.llm.ollama_base_url = val;
        }
        if let Ok(val) = std::env::var("LLM_MODEL") {
            self.llm.llm_model = val;
        }
        if let Ok(val) = std::env::var("EMBEDDING_MODEL") {
            self.llm.embedding_model = val;
        }
        if let Ok(val) = std::env::var("EMBEDDING_DIMENSION") {
            if let Ok(dim) = val.parse() {
                self.llm.embedding_dimension = dim;
            }
        }
        if let Ok(val) = std::env::var("WINDOW_SIZE") {
            if let Ok(w) = val.parse() {
                self.memory.window_size = w;
            }
        }
        if let Ok(val) = std::env::var("TOP_K") {
            if let Ok(k) = val.parse() {
                self.memory.top_k = k;
            }
        }
    }

    /// The base URL of the configured LLM provider.
    pub fn provider_base_url(&self) -> Result<String> {
        match self.llm.provider.as_str() {
            "litellm" => self
                .llm
                .litellm_base_url
                .clone()
                .context("LITELLM_BASE_URL is required when LLM_PROVIDER=litellm"),
            "openrouter" => Ok(self.llm.openrouter_base_url.clone()),
            "ollama" => Ok(self.llm.ollama_base_url.clone()),
            other => anyhow::bail!(
                "unknown LLM provider: {other}. Supported: litellm, openrouter, ollama"
            ),
        }
    }

    /// Resolve the metadata database path, expanding `~` if needed.
    pub fn resolved_user_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.user_db_path)
    }

    /// Resolve the tenant store directory, expanding `~` if needed.
    pub fn resolved_vector_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.vector_db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SimpleMemConfig::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.auth.jwt_expiration_days, 30);
        assert_eq!(config.memory.window_size, 10);
        assert_eq!(config.llm.embedding_dimension, 1536);
        assert!(config.storage.user_db_path.ends_with("users.db"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
port = 9000
log_level = "debug"

[llm]
provider = "ollama"
embedding_dimension = 768

[memory]
window_size = 6
"#;
        let config: SimpleMemConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.llm.provider, "ollama");
        assert_eq!(config.llm.embedding_dimension, 768);
        assert_eq!(config.memory.window_size, 6);
        // defaults still apply for unset fields
        assert_eq!(config.memory.top_k, 8);
        assert_eq!(config.consolidation.merge_threshold, 0.88);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = SimpleMemConfig::default();
        std::env::set_var("JWT_SECRET_KEY", "test-secret");
        std::env::set_var("EMBEDDING_DIMENSION", "384");
        std::env::set_var("WINDOW_SIZE", "4");

        config.apply_env_overrides();

        assert_eq!(config.auth.jwt_secret_key, "test-secret");
        assert_eq!(config.llm.embedding_dimension, 384);
        assert_eq!(config.memory.window_size, 4);

        // Clean up
        std::env::remove_var("JWT_SECRET_KEY");
        std::env::remove_var("EMBEDDING_DIMENSION");
        std::env::remove_var("WINDOW_SIZE");
    }

    #[test]
    fn provider_base_url_selection() {
        let mut config = SimpleMemConfig::default();
        assert!(config
            .provider_base_url()
            .unwrap()
            .contains("openrouter.ai"));

        config.llm.provider = "ollama".into();
        assert!(config.provider_base_url().unwrap().contains("11434"));

        config.llm.provider = "litellm".into();
        assert!(config.provider_base_url().is_err());
        config.llm.litellm_base_url = Some("http://litellm:4000/v1".into());
        assert_eq!(
            config.provider_base_url().unwrap(),
            "http://litellm:4000/v1"
        );

        config.llm.provider = "nope".into();
        assert!(config.provider_base_url().is_err());
    }
}
