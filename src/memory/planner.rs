//! Query planning: turn a natural-language question into a retrieval plan.
//!
//! The plan is a data structure — a semantic paraphrase for the vector view,
//! keywords for the lexical view, an optional metadata predicate for the
//! symbolic view, and a depth derived from the inferred intent. When the
//! gateway is unavailable the planner degrades to a heuristic plan so
//! retrieval never depends on the LLM being up.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ServiceResult;
use crate::memory::search::SymbolicPredicate;
use crate::memory::tokenize;
use crate::provider::{ChatMessage, ProviderGateway};

const PLANNER_SYSTEM: &str = "You plan memory retrieval for a question. Produce: \
\"q_sem\" — a paraphrase optimized for embedding similarity; \
\"q_lex\" — the distinctive keywords (proper nouns, domain terms); \
\"q_sym\" — a metadata filter with any of \"time_start\"/\"time_end\" (RFC 3339 UTC), \
\"persons\", \"entities\", or null when nothing structural applies; \
\"intent\" — one of \"lookup\" (a specific fact), \"aggregation\" (summarize many facts), \
\"temporal\" (a when-question or time range), \"unknown\". \
Respond with JSON: {\"q_sem\": \"...\", \"q_lex\": [\"...\"], \"q_sym\": {...}|null, \
\"intent\": \"...\"}";

/// Query intent category; controls retrieval depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    Lookup,
    Aggregation,
    Temporal,
    Unknown,
}

impl QueryIntent {
    /// Target total units to retrieve across views for this intent.
    pub fn depth(&self, default_top_k: usize) -> usize {
        match self {
            Self::Lookup => 4,
            Self::Aggregation => 20,
            Self::Temporal => 8,
            Self::Unknown => default_top_k,
        }
    }
}

/// The retrieval plan executed by the retriever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalPlan {
    /// Paraphrase optimized for embedding match.
    pub q_sem: String,
    /// Lexical keywords; may be empty.
    pub q_lex: Vec<String>,
    /// Metadata filter; `None` when inference yields nothing useful.
    pub q_sym: Option<SymbolicPredicate>,
    pub intent: QueryIntent,
    /// Target total units across views.
    pub depth: usize,
}

#[derive(Debug, Deserialize)]
struct PlannerResponse {
    q_sem: Option<String>,
    #[serde(default)]
    q_lex: Vec<String>,
    #[serde(default)]
    q_sym: Option<SymbolicPredicate>,
    intent: Option<QueryIntent>,
}

/// Build a retrieval plan for `query`, optionally informed by recent
/// conversation history.
pub async fn plan_query(
    gateway: &dyn ProviderGateway,
    query: &str,
    history: &[ChatMessage],
    default_top_k: usize,
) -> ServiceResult<RetrievalPlan> {
    let schema = json!({"type": "object", "required": ["q_sem", "intent"]});

    let mut messages: Vec<ChatMessage> = history.to_vec();
    messages.push(ChatMessage::user(format!("Question: {query}")));

    let response = match gateway.chat(PLANNER_SYSTEM, &messages, Some(&schema)).await {
        Ok(output) => {
            let value = output.into_structured()?;
            serde_json::from_value::<PlannerResponse>(value).ok()
        }
        Err(err) if err.is_retryable() => {
            tracing::warn!(error = %err, "planner unavailable, using heuristic plan");
            None
        }
        Err(err) => return Err(err.into()),
    };

    let plan = match response {
        Some(parsed) => {
            let intent = parsed.intent.unwrap_or(QueryIntent::Unknown);
            let q_sym = parsed.q_sym.filter(|p| !p.is_empty());
            RetrievalPlan {
                q_sem: parsed
                    .q_sem
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| query.to_string()),
                q_lex: parsed.q_lex,
                q_sym,
                intent,
                depth: intent.depth(default_top_k),
            }
        }
        None => heuristic_plan(query, default_top_k),
    };

    tracing::debug!(intent = ?plan.intent, depth = plan.depth, "retrieval plan ready");
    Ok(plan)
}

/// Fallback plan when the gateway can't help: raw query as the semantic
/// probe, tokenized keywords for the lexical view, no symbolic filter.
pub fn heuristic_plan(query: &str, default_top_k: usize) -> RetrievalPlan {
    RetrievalPlan {
        q_sem: query.to_string(),
        q_lex: tokenize(query),
        q_sym: None,
        intent: QueryIntent::Unknown,
        depth: default_top_k,
    }
}
