//! Online synthesis: merge related units into abstractions at write time.
//!
//! Runs inside the write path of every new unit. Nearby candidates come from
//! vector search; the gateway issues a verdict per candidate, and merges
//! produce a synthesized unit that subsumes (tombstones) its children. The
//! hot path already pays for embedding and chat round-trips, so merging
//! inline keeps the index compact without a second pass.

use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::error::{ServiceError, ServiceResult};
use crate::memory::search::vector_search;
use crate::memory::store;
use crate::memory::types::{MemoryUnit, NewUnit, UnitKind, UnitMetadata};
use crate::memory::tokenize;
use crate::provider::{ChatMessage, ProviderGateway};

const VERDICT_SYSTEM: &str = "You compare a new memory statement against stored candidates. \
For each candidate decide: \"keep_separate\" (different facts), \
\"merge\" (same topic, combine both into one richer statement), \
\"unit_subsumes_candidate\" (the new statement already covers the candidate), or \
\"candidate_subsumes_unit\" (the candidate already covers the new statement). \
Respond with JSON: {\"verdicts\": [{\"unit_id\": <id>, \"decision\": \"...\"}], \
\"merged_text\": \"<combined statement, required if any decision is merge>\"}";

#[derive(Debug, Deserialize)]
struct VerdictResponse {
    verdicts: Vec<Verdict>,
    #[serde(default)]
    merged_text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Verdict {
    unit_id: i64,
    decision: String,
}

/// Result of pushing one unit through the synthesizer.
#[derive(Debug)]
pub struct SynthesisOutcome {
    /// The unit now representing this fact (new or pre-existing).
    pub unit_id: i64,
    /// Units tombstoned by a merge or subsumption, if any.
    pub merged_children: Vec<i64>,
    /// True when an existing unit already covered the fact and nothing was
    /// inserted.
    pub deduplicated: bool,
}

/// Insert a new unit, merging it with near neighbors when the gateway says so.
///
/// The database lock is never held across a gateway call: candidates are
/// read under the lock, the verdict happens outside it, and the write is
/// re-applied under the lock.
pub async fn ingest_unit(
    db: &Arc<Mutex<Connection>>,
    gateway: &dyn ProviderGateway,
    unit: NewUnit,
    max_candidates: usize,
) -> ServiceResult<SynthesisOutcome> {
    // 1. Candidate lookup
    let candidates = {
        let conn = lock(db)?;
        let neighbors = vector_search(&conn, &unit.embedding, max_candidates)?;
        let ids: Vec<i64> = neighbors.iter().map(|(id, _)| *id).collect();
        let mut found = store::get_units(&conn, &ids)?;
        found.retain(|u| u.is_live());
        // Prefer candidates from the same session when the unit has one.
        if let Some(ref session) = unit.metadata.source_session_id {
            let same_session: Vec<MemoryUnit> = found
                .iter()
                .filter(|u| u.metadata.source_session_id.as_ref() == Some(session))
                .cloned()
                .collect();
            if !same_session.is_empty() {
                found = same_session;
            }
        }
        found
    };

    if candidates.is_empty() {
        let id = insert(db, &unit)?;
        return Ok(SynthesisOutcome {
            unit_id: id,
            merged_children: Vec::new(),
            deduplicated: false,
        });
    }

    // 2. Verdict
    let response = request_verdicts(gateway, &unit, &candidates).await?;

    let mut merge_ids: Vec<i64> = Vec::new();
    let mut subsumed_ids: Vec<i64> = Vec::new();
    for verdict in &response.verdicts {
        let Some(candidate) = candidates.iter().find(|c| c.id == verdict.unit_id) else {
            continue; // hallucinated id
        };
        match verdict.decision.as_str() {
            "merge" => merge_ids.push(candidate.id),
            "unit_subsumes_candidate" => subsumed_ids.push(candidate.id),
            "candidate_subsumes_unit" => {
                // An existing unit already covers this fact: record the
                // recall and insert nothing.
                let conn = lock(db)?;
                store::mark_recalled(&conn, &[candidate.id])?;
                return Ok(SynthesisOutcome {
                    unit_id: candidate.id,
                    merged_children: Vec::new(),
                    deduplicated: true,
                });
            }
            _ => {} // keep_separate
        }
    }

    // 3. Apply
    if merge_ids.is_empty() && subsumed_ids.is_empty() {
        let id = insert(db, &unit)?;
        return Ok(SynthesisOutcome {
            unit_id: id,
            merged_children: Vec::new(),
            deduplicated: false,
        });
    }

    if merge_ids.is_empty() {
        // Pure subsumption: the new statement already covers the candidates,
        // so it stays live as a plain atomic unit and the covered candidates
        // are tombstoned. Nothing was synthesized — no wrapper row.
        let unit_id = insert(db, &unit)?;
        {
            let mut conn = lock(db)?;
            for id in &subsumed_ids {
                store::tombstone_unit(&mut conn, *id, "subsumed by newer statement")?;
            }
        }
        tracing::info!(unit = unit_id, subsumed = ?subsumed_ids, "statement subsumed candidates");
        return Ok(SynthesisOutcome {
            unit_id,
            merged_children: subsumed_ids,
            deduplicated: false,
        });
    }

    // Merge: the new statement lands atomically first, then gets subsumed
    // together with the involved candidates under one synthesized unit, so
    // every ancestor of an abstraction survives as a tombstoned row.
    let merged_text = response.merged_text.filter(|t| !t.is_empty()).ok_or_else(|| {
        ServiceError::InvalidArgument("merge verdict without merged_text".into())
    })?;
    let unit_id = insert(db, &unit)?;
    let mut children = vec![unit_id];
    children.extend(merge_ids);
    children.extend(subsumed_ids);
    merge_into_abstraction(db, gateway, &unit, merged_text, children).await
}

/// Re-run synthesis over an already-stored unit (consolidation merge pass).
///
/// Idempotent: a unit that has been tombstoned, or that is already a child
/// of a synthesized unit, is skipped without any writes.
pub async fn resynthesize(
    db: &Arc<Mutex<Connection>>,
    gateway: &dyn ProviderGateway,
    unit_id: i64,
    max_candidates: usize,
) -> ServiceResult<Option<SynthesisOutcome>> {
    let (unit, embedding) = {
        let conn = lock(db)?;
        let Some(unit) = store::get_unit(&conn, unit_id)? else {
            return Err(ServiceError::NotFound(format!("unit {unit_id}")));
        };
        if !unit.is_live() || has_synthesized_parent(&conn, unit_id)? {
            return Ok(None);
        }
        let embedding = read_embedding(&conn, unit_id)?;
        (unit, embedding)
    };

    // Rebuild a NewUnit view of the stored row, excluding itself from the
    // candidate pool by searching one extra neighbor.
    let candidates = {
        let conn = lock(db)?;
        let neighbors = vector_search(&conn, &embedding, max_candidates + 1)?;
        let ids: Vec<i64> = neighbors
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| *id != unit_id)
            .collect();
        let mut found = store::get_units(&conn, &ids)?;
        found.retain(|u| u.is_live());
        found
    };
    if candidates.is_empty() {
        return Ok(None);
    }

    let new_view = NewUnit {
        text: unit.text.clone(),
        kind: unit.kind,
        children: unit.children.clone(),
        metadata: unit.metadata.clone(),
        embedding,
        tokens: tokenize(&unit.text),
    };
    let response = request_verdicts(gateway, &new_view, &candidates).await?;

    let merge_ids: Vec<i64> = response
        .verdicts
        .iter()
        .filter(|v| v.decision == "merge")
        .filter_map(|v| candidates.iter().find(|c| c.id == v.unit_id).map(|c| c.id))
        .collect();
    if merge_ids.is_empty() {
        return Ok(None);
    }

    let merged_text = response.merged_text.filter(|t| !t.is_empty()).ok_or_else(|| {
        ServiceError::InvalidArgument("merge verdict without merged_text".into())
    })?;
    let mut children = vec![unit_id];
    children.extend(merge_ids);
    let outcome = merge_into_abstraction(db, gateway, &new_view, merged_text, children).await?;
    Ok(Some(outcome))
}

async fn request_verdicts(
    gateway: &dyn ProviderGateway,
    unit: &NewUnit,
    candidates: &[MemoryUnit],
) -> ServiceResult<VerdictResponse> {
    let candidate_block = candidates
        .iter()
        .map(|c| format!("[{}] {}", c.id, c.text))
        .collect::<Vec<_>>()
        .join("\n");
    let prompt = format!(
        "New statement:\n{}\n\nStored candidates:\n{}",
        unit.text, candidate_block
    );
    let schema = json!({"type": "object", "required": ["verdicts"]});
    let output = gateway
        .chat(VERDICT_SYSTEM, &[ChatMessage::user(prompt)], Some(&schema))
        .await?;
    serde_json::from_value(output.into_structured()?)
        .map_err(|e| ServiceError::InvalidArgument(format!("bad synthesis verdict: {e}")))
}

/// Create a synthesized unit subsuming `children`, then tombstone them.
///
/// The new unit inherits the earliest timestamp and the union of
/// entities/persons across itself and all children.
async fn merge_into_abstraction(
    db: &Arc<Mutex<Connection>>,
    gateway: &dyn ProviderGateway,
    unit: &NewUnit,
    merged_text: String,
    children: Vec<i64>,
) -> ServiceResult<SynthesisOutcome> {
    let embedding = gateway
        .embed(&[merged_text.clone()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ServiceError::Store("provider returned no embedding".into()))?;

    let conn_children = {
        let conn = lock(db)?;
        let found = store::get_units(&conn, &children)?;
        // Acyclicity / presence guard: every child must exist before the
        // merge is written, and a child may not itself list one of its
        // siblings-to-be as an ancestor of the new unit (fresh ids make a
        // cycle impossible; missing children would break I4).
        if found.len() != children.len() {
            return Err(ServiceError::Store(
                "merge references a missing child unit".into(),
            ));
        }
        found
    };

    let mut timestamp_utc = unit.metadata.timestamp_utc.clone();
    let mut entities = unit.metadata.entities.clone();
    let mut persons = unit.metadata.persons.clone();
    for child in &conn_children {
        if child.metadata.timestamp_utc < timestamp_utc {
            timestamp_utc = child.metadata.timestamp_utc.clone();
        }
        for e in &child.metadata.entities {
            if !entities.contains(e) {
                entities.push(e.clone());
            }
        }
        for p in &child.metadata.persons {
            if !persons.contains(p) {
                persons.push(p.clone());
            }
        }
    }

    let synthesized = NewUnit {
        tokens: tokenize(&merged_text),
        text: merged_text,
        kind: UnitKind::Synthesized,
        children: children.clone(),
        metadata: UnitMetadata {
            timestamp_utc,
            entities,
            persons,
            source_session_id: unit.metadata.source_session_id.clone(),
            source_event_ids: unit.metadata.source_event_ids.clone(),
        },
        embedding,
    };

    let unit_id = {
        let mut conn = lock_mut(db)?;
        let id = store::insert_unit(&mut conn, &synthesized)?;
        for child in &children {
            store::tombstone_unit(&mut conn, *child, "subsumed by synthesis")?;
        }
        id
    };

    tracing::info!(unit = unit_id, children = ?children, "synthesized abstraction");
    Ok(SynthesisOutcome {
        unit_id,
        merged_children: children,
        deduplicated: false,
    })
}

/// Whether any live synthesized unit lists `unit_id` among its children.
pub fn has_synthesized_parent(conn: &Connection, unit_id: i64) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM units, json_each(units.children) \
         WHERE units.kind = 'synthesized' AND units.tombstoned_at IS NULL \
         AND json_each.value = ?1)",
        rusqlite::params![unit_id],
        |row| row.get(0),
    )
}

fn read_embedding(conn: &Connection, unit_id: i64) -> ServiceResult<Vec<f32>> {
    let bytes: Vec<u8> = conn
        .query_row(
            "SELECT embedding FROM units_vec WHERE unit_id = ?1",
            rusqlite::params![unit_id],
            |row| row.get(0),
        )
        .map_err(|_| ServiceError::NotFound(format!("embedding for unit {unit_id}")))?;
    Ok(super::bytes_to_embedding(&bytes))
}

fn insert(db: &Arc<Mutex<Connection>>, unit: &NewUnit) -> ServiceResult<i64> {
    let mut conn = lock_mut(db)?;
    Ok(store::insert_unit(&mut conn, unit)?)
}

fn lock(db: &Arc<Mutex<Connection>>) -> ServiceResult<std::sync::MutexGuard<'_, Connection>> {
    db.lock()
        .map_err(|e| ServiceError::Store(format!("db lock poisoned: {e}")))
}

fn lock_mut(db: &Arc<Mutex<Connection>>) -> ServiceResult<std::sync::MutexGuard<'_, Connection>> {
    lock(db)
}
