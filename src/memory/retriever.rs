//! Plan execution: the three view searches in parallel, score fusion, and
//! one-hop evidence expansion.
//!
//! Each view runs under a shared deadline; a view that misses it simply
//! contributes nothing, and the merged result is returned from whatever
//! materialized. Only when every view misses does the retriever fail with
//! `DeadlineExceeded`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use serde::Serialize;

use crate::error::{ServiceError, ServiceResult};
use crate::memory::planner::RetrievalPlan;
use crate::memory::search::{lexical_search, symbolic_filter, vector_search};
use crate::memory::store;
use crate::memory::types::{MemoryUnit, UnitKind};

/// One ranked retrieval result.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedUnit {
    #[serde(flatten)]
    pub unit: MemoryUnit,
    pub score: f64,
    /// True for children pulled in as supporting evidence of a synthesized
    /// unit rather than direct matches.
    pub supporting: bool,
}

/// View weights (semantic, lexical, symbolic).
#[derive(Debug, Clone, Copy)]
pub struct ViewWeights {
    pub semantic: f64,
    pub lexical: f64,
    pub symbolic: f64,
}

impl Default for ViewWeights {
    fn default() -> Self {
        Self {
            semantic: 0.6,
            lexical: 0.3,
            symbolic: 0.1,
        }
    }
}

/// Execute a retrieval plan against one tenant's store.
///
/// `query_embedding` is the embedded `q_sem`; the engine computes it before
/// calling so a provider outage degrades retrieval to the lexical and
/// symbolic views instead of failing it.
pub async fn execute_plan(
    db: &Arc<Mutex<Connection>>,
    plan: &RetrievalPlan,
    query_embedding: Option<Vec<f32>>,
    weights: ViewWeights,
    deadline: Duration,
) -> ServiceResult<Vec<RetrievedUnit>> {
    let candidate_limit = plan.depth.saturating_mul(3).max(plan.depth);

    // The three views race the shared deadline independently.
    let sem_view = {
        let db = db.clone();
        async move {
            let Some(embedding) = query_embedding else {
                return Ok(Some(Vec::new()));
            };
            run_view(deadline, move || {
                let conn = lock(&db)?;
                Ok(vector_search(&conn, &embedding, candidate_limit)?)
            })
            .await
        }
    };

    let lex_view = {
        let db = db.clone();
        let terms = plan.q_lex.clone();
        async move {
            if terms.is_empty() {
                return Ok(Some(Vec::new()));
            }
            run_view(deadline, move || {
                let conn = lock(&db)?;
                Ok(lexical_search(&conn, &terms, candidate_limit)?)
            })
            .await
        }
    };

    let sym_view = {
        let db = db.clone();
        let predicate = plan.q_sym.clone();
        async move {
            let Some(predicate) = predicate else {
                return Ok(Some(Vec::new()));
            };
            run_view(deadline, move || {
                let conn = lock(&db)?;
                Ok(symbolic_filter(&conn, &predicate, candidate_limit)?
                    .into_iter()
                    .map(|id| (id, 1.0))
                    .collect())
            })
            .await
        }
    };

    let (sem, lex, sym) = tokio::join!(sem_view, lex_view, sym_view);
    let (sem, lex, sym) = (sem?, lex?, sym?);

    if sem.is_none() && lex.is_none() && sym.is_none() {
        return Err(ServiceError::DeadlineExceeded(
            "no retrieval view completed before the deadline".into(),
        ));
    }
    let sem = sem.unwrap_or_default();
    let lex = lex.unwrap_or_default();
    let sym: Vec<i64> = sym
        .unwrap_or_default()
        .into_iter()
        .map(|(id, _)| id)
        .collect();

    // Fuse: dedup by id, weighted normalized score per view.
    // Vector distance and FTS rank both order best-first ascending, so both
    // are negated before min-max normalization.
    let sem_norm = normalize(&sem.iter().map(|(id, d)| (*id, -d)).collect::<Vec<_>>());
    let lex_norm = normalize(&lex.iter().map(|(id, r)| (*id, -r)).collect::<Vec<_>>());
    let sym_set: std::collections::HashSet<i64> = sym.iter().copied().collect();

    let mut scores: HashMap<i64, f64> = HashMap::new();
    for (id, s) in &sem_norm {
        *scores.entry(*id).or_insert(0.0) += weights.semantic * s;
    }
    for (id, s) in &lex_norm {
        *scores.entry(*id).or_insert(0.0) += weights.lexical * s;
    }
    for id in &sym_set {
        *scores.entry(*id).or_insert(0.0) += weights.symbolic;
    }

    if scores.is_empty() {
        return Ok(Vec::new());
    }

    // Hydrate and rank.
    let ids: Vec<i64> = scores.keys().copied().collect();
    let units = {
        let conn = lock(db)?;
        store::get_units(&conn, &ids)?
    };

    let mut ranked: Vec<RetrievedUnit> = units
        .into_iter()
        .filter(|u| u.is_live())
        .map(|unit| RetrievedUnit {
            score: scores[&unit.id],
            supporting: false,
            unit,
        })
        .collect();
    sort_ranked(&mut ranked);
    ranked.truncate(plan.depth);

    // One-hop expansion: children of synthesized units come along as
    // supporting evidence at half their parent's weight.
    let mut expansion: Vec<RetrievedUnit> = Vec::new();
    {
        let conn = lock(db)?;
        let present: std::collections::HashSet<i64> =
            ranked.iter().map(|r| r.unit.id).collect();
        for parent in ranked.iter().filter(|r| r.unit.kind == UnitKind::Synthesized) {
            for child in store::get_units(&conn, &parent.unit.children)? {
                if !present.contains(&child.id)
                    && !expansion.iter().any(|e| e.unit.id == child.id)
                {
                    expansion.push(RetrievedUnit {
                        score: parent.score * 0.5,
                        supporting: true,
                        unit: child,
                    });
                }
            }
        }
    }
    ranked.extend(expansion);
    sort_ranked(&mut ranked);
    ranked.truncate(plan.depth);

    // Recall feedback for consolidation decay.
    {
        let conn = lock(db)?;
        let recalled: Vec<i64> = ranked
            .iter()
            .filter(|r| !r.supporting)
            .map(|r| r.unit.id)
            .collect();
        store::mark_recalled(&conn, &recalled)?;
    }

    Ok(ranked)
}

/// Run one blocking view search with a deadline. `Ok(None)` means the
/// deadline fired; `Ok(Some(results))` is the (possibly empty) view output.
/// Store errors propagate — they are never folded into a timeout.
async fn run_view<F>(deadline: Duration, f: F) -> ServiceResult<Option<Vec<(i64, f64)>>>
where
    F: FnOnce() -> ServiceResult<Vec<(i64, f64)>> + Send + 'static,
{
    match tokio::time::timeout(deadline, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(results)) => results.map(Some),
        Ok(Err(join_err)) => Err(ServiceError::Store(format!(
            "retrieval view task failed: {join_err}"
        ))),
        Err(_) => {
            tracing::warn!("retrieval view missed the deadline");
            Ok(None)
        }
    }
}

/// Min-max normalization within one view's returned set. A single result
/// normalizes to 1.0.
fn normalize(results: &[(i64, f64)]) -> Vec<(i64, f64)> {
    if results.is_empty() {
        return Vec::new();
    }
    let min = results.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
    let max = results
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    results
        .iter()
        .map(|(id, s)| {
            let norm = if range > 0.0 { (s - min) / range } else { 1.0 };
            (*id, norm)
        })
        .collect()
}

/// Score descending; ties break to the newer fact, then the higher id.
fn sort_ranked(ranked: &mut [RetrievedUnit]) {
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.unit.metadata.timestamp_utc.cmp(&a.unit.metadata.timestamp_utc))
            .then_with(|| b.unit.id.cmp(&a.unit.id))
    });
}

fn lock(db: &Arc<Mutex<Connection>>) -> ServiceResult<std::sync::MutexGuard<'_, Connection>> {
    db.lock()
        .map_err(|e| ServiceError::Store(format!("db lock poisoned: {e}")))
}
