//! SimpleMem — multi-tenant long-term memory for LLM agents.
//!
//! Agents write free-form dialogue turns and tool events; SimpleMem distills
//! them into compact, self-contained memory units and indexes each unit three
//! ways: dense semantic (sqlite-vec), sparse lexical (FTS5 BM25), and
//! structured symbolic (metadata filters). Queries are answered by planning an
//! intent-aware retrieval across all three views of a single tenant's store.
//!
//! A second subsystem maintains a session lifecycle on top of the same store:
//! events are recorded (with mandatory redaction), observations are extracted
//! at session stop, and prior-session context is injected at session start
//! under a token budget.
//!
//! # Architecture
//!
//! - **Storage**: SQLite with FTS5 for lexical search and
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) for vector search —
//!   one database per tenant plus a shared metadata database
//! - **Providers**: chat completion and embeddings via any OpenAI-format
//!   endpoint (LiteLLM, OpenRouter, Ollama)
//! - **Transport**: MCP (JSON-RPC 2.0) over Streamable HTTP with SSE,
//!   bearer-token authentication per tenant
//!
//! # Modules
//!
//! - [`config`] — Configuration from TOML files and environment variables
//! - [`db`] — SQLite initialization, schemas, migrations, and health checks
//! - [`provider`] — LLM and embedding gateway with retry/backoff
//! - [`auth`] — Registration, token issuance, credential encryption
//! - [`memory`] — The engine: compression, synthesis, planning, retrieval
//! - [`engine`] — Per-tenant store registry and the end-to-end pipelines
//! - [`session`] — Cross-session lifecycle, redaction, context injection
//! - [`server`] — HTTP/MCP transport

pub mod auth;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod memory;
pub mod provider;
pub mod server;
pub mod session;
