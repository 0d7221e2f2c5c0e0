//! The per-tenant engine: store registry, gateway registry, and the
//! end-to-end pipelines behind every tool call.
//!
//! Write path: dialogue → compressor → synthesizer → tenant store.
//! Read path: planner → retriever → answerer.
//! Session path: lifecycle rows + redaction + observation extraction +
//! context injection, all flowing through the same store.
//!
//! Tenant isolation is structural: every operation resolves its store and
//! gateway from the verified [`TenantContext`], so one tenant's handles can
//! never reach another tenant's tables.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use serde::Serialize;

use crate::auth::{self, AuthKeys, TenantContext};
use crate::config::SimpleMemConfig;
use crate::db;
use crate::error::{ServiceError, ServiceResult};
use crate::memory::answerer::{self, Answer};
use crate::memory::compressor;
use crate::memory::consolidator::{self, ConsolidationReport};
use crate::memory::planner;
use crate::memory::retriever::{self, RetrievedUnit, ViewWeights};
use crate::memory::store;
use crate::memory::synthesizer;
use crate::memory::types::DialogueTurn;
use crate::provider::{openai_compat::OpenAiCompatGateway, ChatMessage, ProviderGateway};
use crate::session::context::{self, ContextBundle};
use crate::session::observations;
use crate::session::redaction::Redactor;
use crate::session;
use crate::session::types::{EventKind, Observation, SessionStatus};

/// Builds a gateway from a tenant's decrypted provider credential.
/// Swapped for a stub in tests.
pub type GatewayFactory =
    Box<dyn Fn(&str) -> ServiceResult<Arc<dyn ProviderGateway>> + Send + Sync>;

pub struct Engine {
    config: Arc<SimpleMemConfig>,
    keys: Arc<AuthKeys>,
    meta_db: Arc<Mutex<Connection>>,
    tenants: Mutex<HashMap<String, Arc<Mutex<Connection>>>>,
    gateways: Mutex<HashMap<String, Arc<dyn ProviderGateway>>>,
    gateway_factory: GatewayFactory,
    redactor: Redactor,
}

#[derive(Debug, Serialize)]
pub struct AddReport {
    pub units_created: usize,
    pub unit_ids: Vec<i64>,
    pub deduplicated: usize,
}

#[derive(Debug, Serialize)]
pub struct QueryResult {
    pub answer_text: String,
    pub cited_unit_ids: Vec<i64>,
    pub units: Vec<RetrievedUnit>,
}

#[derive(Debug, Serialize)]
pub struct DeleteReport {
    pub tombstoned: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct StartReport {
    pub memory_session_id: String,
    pub context: ContextBundle,
}

#[derive(Debug, Serialize)]
pub struct StopReport {
    pub entries_stored: usize,
    pub observations: Vec<Observation>,
    pub summary: String,
}

impl Engine {
    /// Production engine: gateways talk to the configured provider.
    pub fn new(config: SimpleMemConfig) -> anyhow::Result<Self> {
        let keys = Arc::new(AuthKeys::from_config(&config.auth)?);
        let meta_conn = db::open_meta_database(config.resolved_user_db_path())?;

        let base_url = config.provider_base_url()?;
        let llm_config = config.llm.clone();
        let factory: GatewayFactory = Box::new(move |api_key: &str| {
            let gateway = OpenAiCompatGateway::new(&llm_config, base_url.clone(), api_key.into())?;
            Ok(Arc::new(gateway) as Arc<dyn ProviderGateway>)
        });

        Ok(Self::with_gateway_factory(config, keys, meta_conn, factory))
    }

    /// Engine with an injected gateway factory (tests use a stub gateway).
    pub fn with_gateway_factory(
        config: SimpleMemConfig,
        keys: Arc<AuthKeys>,
        meta_conn: Connection,
        gateway_factory: GatewayFactory,
    ) -> Self {
        let redactor = Redactor::new(&config.session.redact_patterns, config.session.max_event_bytes);
        Self {
            config: Arc::new(config),
            keys,
            meta_db: Arc::new(Mutex::new(meta_conn)),
            tenants: Mutex::new(HashMap::new()),
            gateways: Mutex::new(HashMap::new()),
            gateway_factory,
            redactor,
        }
    }

    pub fn config(&self) -> &SimpleMemConfig {
        &self.config
    }

    pub fn auth_keys(&self) -> &AuthKeys {
        &self.keys
    }

    pub fn meta_db(&self) -> &Arc<Mutex<Connection>> {
        &self.meta_db
    }

    fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.config.server.request_timeout_secs)
    }

    fn view_weights(&self) -> ViewWeights {
        ViewWeights {
            semantic: self.config.memory.semantic_weight,
            lexical: self.config.memory.lexical_weight,
            symbolic: self.config.memory.symbolic_weight,
        }
    }

    /// Best-effort upstream check of a provider key before registration.
    ///
    /// A definitive rejection (auth error) fails registration; transient
    /// provider trouble does not block a new tenant.
    pub async fn verify_provider_key(&self, api_key: &str) -> ServiceResult<()> {
        if api_key.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "provider_api_key must not be empty".into(),
            ));
        }
        let gateway = (self.gateway_factory)(api_key)?;
        match gateway
            .chat("Connectivity check.", &[ChatMessage::user("ping")], None)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.kind == crate::provider::ProviderErrorKind::Auth => Err(
                ServiceError::InvalidArgument("provider rejected the API key".into()),
            ),
            Err(err) => {
                tracing::warn!(error = %err, "provider unreachable during key verification");
                Ok(())
            }
        }
    }

    /// Register a tenant and issue their first token.
    pub fn register(&self, provider_api_key: &str) -> ServiceResult<(String, String)> {
        if provider_api_key.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "provider_api_key must not be empty".into(),
            ));
        }
        let meta = self.lock_meta()?;
        let user_id = auth::register_user(
            &meta,
            &self.keys,
            provider_api_key,
            self.config.llm.embedding_dimension,
        )
        .map_err(|e| ServiceError::Store(e.to_string()))?;
        drop(meta);

        let token = self
            .keys
            .issue_token(&user_id)
            .map_err(|e| ServiceError::Store(e.to_string()))?;
        Ok((user_id, token))
    }

    /// The tenant's store handle, opened on first use. The handle is only
    /// returned fully initialized (schema, dimension check, journal replay).
    pub fn tenant_store(&self, ctx: &TenantContext) -> ServiceResult<Arc<Mutex<Connection>>> {
        {
            let tenants = self
                .tenants
                .lock()
                .map_err(|e| ServiceError::Store(format!("registry lock poisoned: {e}")))?;
            if let Some(handle) = tenants.get(&ctx.user_id) {
                return Ok(handle.clone());
            }
        }

        let dim = {
            let meta = self.lock_meta()?;
            auth::get_user_embedding_dim(&meta, &ctx.user_id)?
        };
        let path = self
            .config
            .resolved_vector_db_path()
            .join(format!("{}.db", ctx.user_id));
        let conn = db::open_tenant_database(&path, dim)
            .map_err(|e| ServiceError::Store(format!("{e:#}")))?;
        let handle = Arc::new(Mutex::new(conn));

        let mut tenants = self
            .tenants
            .lock()
            .map_err(|e| ServiceError::Store(format!("registry lock poisoned: {e}")))?;
        Ok(tenants
            .entry(ctx.user_id.clone())
            .or_insert(handle)
            .clone())
    }

    /// The tenant's provider gateway, created from their stored credential.
    pub fn gateway(&self, ctx: &TenantContext) -> ServiceResult<Arc<dyn ProviderGateway>> {
        {
            let gateways = self
                .gateways
                .lock()
                .map_err(|e| ServiceError::Store(format!("registry lock poisoned: {e}")))?;
            if let Some(gateway) = gateways.get(&ctx.user_id) {
                return Ok(gateway.clone());
            }
        }

        let api_key = {
            let meta = self.lock_meta()?;
            auth::get_user_api_key(&meta, &self.keys, &ctx.user_id)?
        };
        let gateway = (self.gateway_factory)(&api_key)?;

        let mut gateways = self
            .gateways
            .lock()
            .map_err(|e| ServiceError::Store(format!("registry lock poisoned: {e}")))?;
        Ok(gateways
            .entry(ctx.user_id.clone())
            .or_insert(gateway)
            .clone())
    }

    // ── Memory tools ─────────────────────────────────────────────────────────

    /// Ingest dialogue turns: window, compress, synthesize, store.
    pub async fn memory_add(
        &self,
        ctx: &TenantContext,
        turns: Vec<DialogueTurn>,
        session_id: Option<&str>,
        source_event_ids: &[i64],
    ) -> ServiceResult<AddReport> {
        if turns.is_empty() {
            return Err(ServiceError::InvalidArgument("no dialogue turns given".into()));
        }

        let gateway = self.gateway(ctx)?;
        let store = self.tenant_store(ctx)?;
        let window_size = self.config.memory.window_size;

        let mut unit_ids = Vec::new();
        let mut deduplicated = 0;
        for window in turns.chunks(window_size) {
            // Anchor relative-time resolution at the window's latest turn.
            let anchor = window
                .iter()
                .map(|t| t.timestamp)
                .max()
                .unwrap_or_else(chrono::Utc::now);

            let units = compressor::compress_window(
                gateway.as_ref(),
                window,
                anchor,
                self.config.memory.density_threshold,
                session_id,
                source_event_ids,
            )
            .await?;

            for unit in units {
                let outcome = synthesizer::ingest_unit(
                    &store,
                    gateway.as_ref(),
                    unit,
                    self.config.memory.synthesis_candidates,
                )
                .await?;
                if outcome.deduplicated {
                    deduplicated += 1;
                } else {
                    unit_ids.push(outcome.unit_id);
                }
            }
        }

        tracing::info!(
            tenant = %ctx.user_id,
            created = unit_ids.len(),
            deduplicated,
            "memory_add complete"
        );
        Ok(AddReport {
            units_created: unit_ids.len(),
            unit_ids,
            deduplicated,
        })
    }

    /// Answer a query: plan, retrieve across the three views, compose.
    pub async fn memory_query(
        &self,
        ctx: &TenantContext,
        query: &str,
        history: &[ChatMessage],
    ) -> ServiceResult<QueryResult> {
        if query.is_empty() {
            return Err(ServiceError::InvalidArgument("query must not be empty".into()));
        }

        let gateway = self.gateway(ctx)?;
        let store = self.tenant_store(ctx)?;

        let plan =
            planner::plan_query(gateway.as_ref(), query, history, self.config.memory.top_k)
                .await?;

        // Retrieval degrades to the lexical and symbolic views when the
        // embedding call fails.
        let query_embedding = match gateway.embed(&[plan.q_sem.clone()]).await {
            Ok(mut vectors) => vectors.pop(),
            Err(err) => {
                tracing::warn!(error = %err, "query embedding failed, degrading to lexical");
                None
            }
        };

        let retrieved = retriever::execute_plan(
            &store,
            &plan,
            query_embedding,
            self.view_weights(),
            self.request_deadline(),
        )
        .await?;

        let answer: Answer = answerer::compose_answer(gateway.as_ref(), query, &retrieved).await?;
        Ok(QueryResult {
            answer_text: answer.answer_text,
            cited_unit_ids: answer.cited_unit_ids,
            units: retrieved,
        })
    }

    /// Tombstone units by id.
    pub fn memory_delete(&self, ctx: &TenantContext, unit_ids: &[i64]) -> ServiceResult<DeleteReport> {
        if unit_ids.is_empty() {
            return Err(ServiceError::InvalidArgument("no unit ids given".into()));
        }
        let store_handle = self.tenant_store(ctx)?;
        let mut conn = store_handle
            .lock()
            .map_err(|e| ServiceError::Store(format!("db lock poisoned: {e}")))?;

        let mut tombstoned = Vec::new();
        for id in unit_ids {
            store::get_unit(&conn, *id)?
                .ok_or_else(|| ServiceError::NotFound(format!("unit {id}")))?;
            store::tombstone_unit(&mut conn, *id, "deleted by tenant")
                .map_err(|e| ServiceError::Store(e.to_string()))?;
            tombstoned.push(*id);
        }
        Ok(DeleteReport { tombstoned })
    }

    /// Run a consolidation pass over the tenant's store.
    pub async fn consolidate(&self, ctx: &TenantContext) -> ServiceResult<ConsolidationReport> {
        let gateway = self.gateway(ctx)?;
        let store = self.tenant_store(ctx)?;
        consolidator::consolidate(
            &store,
            gateway.as_ref(),
            &self.config.consolidation,
            self.config.memory.synthesis_candidates,
        )
        .await
    }

    // ── Session tools ────────────────────────────────────────────────────────

    /// Start a session and build the injected context bundle.
    pub async fn session_start(
        &self,
        ctx: &TenantContext,
        content_session_id: &str,
        project: &str,
        user_prompt: &str,
    ) -> ServiceResult<StartReport> {
        let session = {
            let meta = self.lock_meta()?;
            session::create_session(&meta, &ctx.user_id, content_session_id, project)
                .map_err(|e| ServiceError::Store(e.to_string()))?
        };

        // Context injection is best-effort: a fresh tenant or a provider
        // outage yields an empty bundle, not a failed start.
        let context = match self.build_context(ctx, user_prompt).await {
            Ok(bundle) => bundle,
            Err(err) => {
                tracing::warn!(error = %err, "context injection failed, starting bare");
                context::build_bundle(None, &[], self.config.session.context_token_budget)
            }
        };

        tracing::info!(
            tenant = %ctx.user_id,
            session = %session.memory_session_id,
            context_tokens = context.token_estimate,
            "session started"
        );
        Ok(StartReport {
            memory_session_id: session.memory_session_id,
            context,
        })
    }

    async fn build_context(
        &self,
        ctx: &TenantContext,
        user_prompt: &str,
    ) -> ServiceResult<ContextBundle> {
        let budget = self.config.session.context_token_budget;
        let summary = {
            let meta = self.lock_meta()?;
            session::latest_summary(&meta, &ctx.user_id)
                .map_err(|e| ServiceError::Store(e.to_string()))?
        };

        if user_prompt.is_empty() {
            return Ok(context::build_bundle(summary.as_deref(), &[], budget));
        }

        let gateway = self.gateway(ctx)?;
        let store = self.tenant_store(ctx)?;
        let plan = planner::plan_query(
            gateway.as_ref(),
            user_prompt,
            &[],
            self.config.memory.top_k,
        )
        .await?;
        let query_embedding = match gateway.embed(&[plan.q_sem.clone()]).await {
            Ok(mut vectors) => vectors.pop(),
            Err(_) => None,
        };
        let retrieved = retriever::execute_plan(
            &store,
            &plan,
            query_embedding,
            self.view_weights(),
            self.request_deadline(),
        )
        .await?;

        Ok(context::build_bundle(summary.as_deref(), &retrieved, budget))
    }

    /// Record one event into an active session. The payload is redacted
    /// before it is persisted; this cannot be disabled.
    pub fn session_record(
        &self,
        ctx: &TenantContext,
        memory_session_id: &str,
        kind: EventKind,
        payload: &str,
    ) -> ServiceResult<i64> {
        let meta = self.lock_meta()?;
        let session = session::get_session(&meta, &ctx.user_id, memory_session_id)?;
        if session.status != SessionStatus::Active {
            return Err(ServiceError::SessionState(format!(
                "cannot record into a {} session",
                session.status
            )));
        }

        let redacted = self.redactor.redact(payload);
        session::append_event(&meta, memory_session_id, kind, &redacted)
            .map_err(|e| ServiceError::Store(e.to_string()))
    }

    /// Stop a session: freeze events, extract observations, compress them
    /// into memory units, summarize. Idempotent — stopping a stopped
    /// session returns the stored report without re-extracting.
    pub async fn session_stop(
        &self,
        ctx: &TenantContext,
        memory_session_id: &str,
    ) -> ServiceResult<StopReport> {
        let (session, events) = {
            let meta = self.lock_meta()?;
            let session = session::get_session(&meta, &ctx.user_id, memory_session_id)?;
            let events = session::list_events(&meta, memory_session_id)
                .map_err(|e| ServiceError::Store(e.to_string()))?;
            (session, events)
        };

        match session.status {
            SessionStatus::Active => {}
            SessionStatus::Stopped => {
                return Ok(StopReport {
                    entries_stored: 0,
                    observations: Vec::new(),
                    summary: session.summary.unwrap_or_default(),
                });
            }
            SessionStatus::Ended => {
                return Err(ServiceError::SessionState(
                    "cannot stop an ended session".into(),
                ));
            }
        }

        let gateway = self.gateway(ctx)?;

        // Observation extraction degrades gracefully: the session still
        // stops with a summary and zero observations.
        let observations = match observations::extract_observations(
            gateway.as_ref(),
            memory_session_id,
            &events,
            self.config.session.segment_gap_secs,
        )
        .await
        {
            Ok(observations) => observations,
            // Store failures must surface; only extraction-side trouble
            // degrades to a summary-only stop.
            Err(err @ ServiceError::Store(_)) => return Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "observation extraction failed, stopping without");
                Vec::new()
            }
        };

        let entries_stored = match self
            .store_observations(ctx, memory_session_id, &observations)
            .await
        {
            Ok(count) => count,
            Err(err @ ServiceError::Store(_)) => return Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "observation compression failed, stopping without");
                0
            }
        };

        let summary = match self.summarize_events(gateway.as_ref(), &events).await {
            Ok(summary) => summary,
            Err(err) => {
                tracing::warn!(error = %err, "summary generation failed, using digest");
                fallback_summary(&events)
            }
        };

        {
            let meta = self.lock_meta()?;
            session::insert_observations(&meta, &observations)
                .map_err(|e| ServiceError::Store(e.to_string()))?;
            session::set_status(&meta, memory_session_id, SessionStatus::Stopped, Some(&summary))
                .map_err(|e| ServiceError::Store(e.to_string()))?;
        }

        tracing::info!(
            tenant = %ctx.user_id,
            session = %memory_session_id,
            observations = observations.len(),
            entries_stored,
            "session stopped"
        );
        Ok(StopReport {
            entries_stored,
            observations,
            summary,
        })
    }

    /// Feed observations through the compressor pipeline into the store.
    async fn store_observations(
        &self,
        ctx: &TenantContext,
        memory_session_id: &str,
        observations: &[Observation],
    ) -> ServiceResult<usize> {
        if observations.is_empty() {
            return Ok(0);
        }
        let now = chrono::Utc::now();
        let turns: Vec<DialogueTurn> = observations
            .iter()
            .map(|obs| DialogueTurn {
                speaker: obs.category.as_str().to_string(),
                content: obs.text.clone(),
                timestamp: now,
            })
            .collect();
        let evidence: Vec<i64> = observations
            .iter()
            .flat_map(|o| o.evidence_event_ids.iter().copied())
            .collect();

        let report = self
            .memory_add(ctx, turns, Some(memory_session_id), &evidence)
            .await?;
        Ok(report.units_created)
    }

    async fn summarize_events(
        &self,
        gateway: &dyn ProviderGateway,
        events: &[crate::session::types::Event],
    ) -> ServiceResult<String> {
        if events.is_empty() {
            return Ok("Empty session: no events recorded.".into());
        }
        let event_block = events
            .iter()
            .map(|e| format!("({}) {}", e.kind.as_str(), e.payload))
            .collect::<Vec<_>>()
            .join("\n");
        let output = gateway
            .chat(
                "Summarize this agent session in 2-3 sentences: what was worked on, what was \
                 decided, and where it left off.",
                &[ChatMessage::user(event_block)],
                None,
            )
            .await?;
        Ok(output.into_text())
    }

    /// End a stopped session: the row becomes immutable and the event log
    /// is pruned per retention policy.
    pub fn session_end(&self, ctx: &TenantContext, memory_session_id: &str) -> ServiceResult<()> {
        let meta = self.lock_meta()?;
        let session = session::get_session(&meta, &ctx.user_id, memory_session_id)?;
        session.status.transition(SessionStatus::Ended)?;

        session::set_status(&meta, memory_session_id, SessionStatus::Ended, None)
            .map_err(|e| ServiceError::Store(e.to_string()))?;
        let pruned = session::prune_events(&meta, memory_session_id)
            .map_err(|e| ServiceError::Store(e.to_string()))?;

        tracing::info!(
            tenant = %ctx.user_id,
            session = %memory_session_id,
            pruned_events = pruned,
            "session ended"
        );
        Ok(())
    }

    fn lock_meta(&self) -> ServiceResult<std::sync::MutexGuard<'_, Connection>> {
        self.meta_db
            .lock()
            .map_err(|e| ServiceError::Store(format!("meta db lock poisoned: {e}")))
    }
}

/// Deterministic summary when the gateway is unavailable: a digest of the
/// first and last event payloads.
fn fallback_summary(events: &[crate::session::types::Event]) -> String {
    match (events.first(), events.last()) {
        (Some(first), Some(last)) if events.len() > 1 => format!(
            "Session with {} events. Started with: {}. Ended with: {}.",
            events.len(),
            digest(&first.payload),
            digest(&last.payload)
        ),
        (Some(only), _) => format!("Session with 1 event: {}.", digest(&only.payload)),
        _ => "Empty session: no events recorded.".into(),
    }
}

fn digest(payload: &str) -> String {
    let line = payload.lines().next().unwrap_or_default();
    if line.len() <= 120 {
        line.to_string()
    } else {
        let end = line
            .char_indices()
            .take_while(|(i, _)| *i < 120)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(120);
        format!("{}…", &line[..end])
    }
}
