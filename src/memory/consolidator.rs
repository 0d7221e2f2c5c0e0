//! Background consolidation: decay, merge, prune, and tombstone GC.
//!
//! Runs on demand (CLI) or on a timer, per tenant. All mutations go through
//! the same serialized write path as normal inserts, so consolidation is
//! safe under concurrent writes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::config::ConsolidationConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::memory::search::vector_search;
use crate::memory::store;
use crate::memory::synthesizer;
use crate::provider::ProviderGateway;

#[derive(Debug, Default, Serialize)]
pub struct ConsolidationReport {
    pub decayed: usize,
    pub merged: usize,
    pub pruned: usize,
    pub purged: usize,
}

/// One full consolidation pass over a tenant store.
pub async fn consolidate(
    db: &Arc<Mutex<Connection>>,
    gateway: &dyn ProviderGateway,
    config: &ConsolidationConfig,
    merge_candidates: usize,
) -> ServiceResult<ConsolidationReport> {
    let mut report = ConsolidationReport::default();

    report.decayed = {
        let conn = lock(db)?;
        apply_decay(&conn, config.decay_half_life_days)?
    };

    report.merged = merge_pass(db, gateway, config, merge_candidates).await?;

    {
        let mut conn = lock(db)?;
        report.pruned = prune(&mut conn, config.prune_floor)?;
        report.purged = gc_tombstones(&mut conn, config.tombstone_grace_days)?;
    }

    tracing::info!(
        decayed = report.decayed,
        merged = report.merged,
        pruned = report.pruned,
        purged = report.purged,
        "consolidation pass complete"
    );
    Ok(report)
}

/// Exponential decay: `score ← score · e^(−λ·Δt)`, λ = ln 2 / half-life.
///
/// Δt is the interval since the score was last current: the later of the
/// last recall and the last decay pass (falling back to creation). Each
/// pass stamps `last_decayed_at`, so the factor is applied over the
/// incremental interval only — repeated passes compose to the continuous
/// formula instead of compounding on an already-decayed score.
pub fn apply_decay(conn: &Connection, half_life_days: f64) -> ServiceResult<usize> {
    let lambda = std::f64::consts::LN_2 / half_life_days.max(f64::EPSILON);
    let now = chrono::Utc::now();

    struct Row {
        id: i64,
        score: f64,
        created_at: String,
        last_accessed: Option<String>,
        last_decayed_at: Option<String>,
    }

    let rows: Vec<Row> = {
        let mut stmt = conn.prepare(
            "SELECT id, score_decay, created_at, last_accessed, last_decayed_at \
             FROM units WHERE tombstoned_at IS NULL AND score_decay > 0.0",
        )?;
        let collected = stmt
            .query_map([], |row| {
                Ok(Row {
                    id: row.get(0)?,
                    score: row.get(1)?,
                    created_at: row.get(2)?,
                    last_accessed: row.get(3)?,
                    last_decayed_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        collected
    };

    let mut affected = 0;
    for row in rows {
        let reference = [
            row.last_decayed_at.as_deref(),
            row.last_accessed.as_deref(),
            Some(row.created_at.as_str()),
        ]
        .into_iter()
        .flatten()
        .filter_map(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&chrono::Utc))
        .max();
        let Some(reference) = reference else {
            continue;
        };

        let age_days = (now - reference).num_seconds() as f64 / 86_400.0;
        if age_days <= 0.0 {
            continue;
        }
        let decayed = row.score * (-lambda * age_days).exp();
        conn.execute(
            "UPDATE units SET score_decay = ?1, last_decayed_at = ?2 WHERE id = ?3",
            params![decayed, now.to_rfc3339(), row.id],
        )?;
        store::write_unit_log(
            conn,
            "decay",
            row.id,
            Some(&serde_json::json!({"from": row.score, "to": decayed})),
        )?;
        affected += 1;
    }

    Ok(affected)
}

/// Sample live units with a near neighbor above the merge threshold and push
/// them back through the synthesizer. Each unit participates in at most one
/// merge per pass.
async fn merge_pass(
    db: &Arc<Mutex<Connection>>,
    gateway: &dyn ProviderGateway,
    config: &ConsolidationConfig,
    merge_candidates: usize,
) -> ServiceResult<usize> {
    let max_distance = super::cosine_threshold_to_l2(config.merge_threshold);

    let candidates: Vec<i64> = {
        let conn = lock(db)?;
        let live = store::live_unit_ids(&conn)?;
        let mut with_close_neighbor = Vec::new();
        for id in live {
            let Some(embedding) = read_embedding(&conn, id)? else {
                continue;
            };
            let neighbors = vector_search(&conn, &embedding, 2)?;
            if neighbors
                .iter()
                .any(|(nid, dist)| *nid != id && *dist <= max_distance)
            {
                with_close_neighbor.push(id);
            }
        }
        with_close_neighbor
    };

    let mut consumed: HashSet<i64> = HashSet::new();
    let mut merged = 0;
    for id in candidates {
        if consumed.contains(&id) {
            continue;
        }
        match synthesizer::resynthesize(db, gateway, id, merge_candidates).await {
            Ok(Some(outcome)) => {
                consumed.insert(id);
                consumed.extend(outcome.merged_children.iter().copied());
                merged += 1;
            }
            Ok(None) => {}
            // A provider failure degrades the pass, it doesn't abort it.
            Err(ServiceError::Provider { message, .. }) => {
                tracing::warn!(unit = id, error = %message, "merge pass skipped unit");
            }
            Err(other) => return Err(other),
        }
    }

    Ok(merged)
}

/// Tombstone live units whose score fell below the floor, unless a live
/// synthesized unit still references them as children.
pub fn prune(conn: &mut Connection, floor: f64) -> ServiceResult<usize> {
    let candidates: Vec<i64> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM units WHERE tombstoned_at IS NULL AND score_decay < ?1",
        )?;
        let collected = stmt
            .query_map(params![floor], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        collected
    };

    let mut pruned = 0;
    for id in candidates {
        if synthesizer::has_synthesized_parent(conn, id)? {
            continue;
        }
        store::tombstone_unit(conn, id, "pruned: score below floor")?;
        pruned += 1;
    }
    Ok(pruned)
}

/// Hard-delete tombstones past the grace interval that no live synthesized
/// unit still references.
pub fn gc_tombstones(conn: &mut Connection, grace_days: i64) -> ServiceResult<usize> {
    let cutoff = (chrono::Utc::now() - chrono::Duration::days(grace_days)).to_rfc3339();
    let candidates: Vec<i64> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM units WHERE tombstoned_at IS NOT NULL AND tombstoned_at < ?1",
        )?;
        let collected = stmt
            .query_map(params![cutoff], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        collected
    };

    let mut purged = 0;
    for id in candidates {
        if synthesizer::has_synthesized_parent(conn, id)? {
            continue;
        }
        store::purge_unit(conn, id)?;
        purged += 1;
    }
    Ok(purged)
}

fn read_embedding(conn: &Connection, unit_id: i64) -> ServiceResult<Option<Vec<f32>>> {
    use rusqlite::OptionalExtension;
    let bytes: Option<Vec<u8>> = conn
        .query_row(
            "SELECT embedding FROM units_vec WHERE unit_id = ?1",
            params![unit_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(bytes.map(|b| super::bytes_to_embedding(&b)))
}

fn lock(db: &Arc<Mutex<Connection>>) -> ServiceResult<std::sync::MutexGuard<'_, Connection>> {
    db.lock()
        .map_err(|e| ServiceError::Store(format!("db lock poisoned: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::memory::store::insert_unit;
    use crate::memory::tokenize;
    use crate::memory::types::{NewUnit, UnitKind, UnitMetadata};
    use crate::provider::{ChatMessage, ChatOutput, ProviderError};
    use async_trait::async_trait;
    use serde_json::json;

    const DIM: usize = 8;

    fn test_db() -> Arc<Mutex<Connection>> {
        Arc::new(Mutex::new(db::open_memory_tenant_database(DIM).unwrap()))
    }

    fn insert(db: &Arc<Mutex<Connection>>, text: &str, embedding: Vec<f32>) -> i64 {
        let mut conn = db.lock().unwrap();
        insert_unit(
            &mut conn,
            &NewUnit {
                text: text.to_string(),
                kind: UnitKind::Atomic,
                children: Vec::new(),
                metadata: UnitMetadata {
                    timestamp_utc: "2025-01-01T00:00:00Z".into(),
                    ..Default::default()
                },
                embedding,
                tokens: tokenize(text),
            },
        )
        .unwrap()
    }

    fn spike(i: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; DIM];
        v[i % DIM] = 1.0;
        v
    }

    /// Pretend the unit was created and last recalled `days` ago.
    fn backdate_access(db: &Arc<Mutex<Connection>>, id: i64, days: i64) {
        let when = (chrono::Utc::now() - chrono::Duration::days(days)).to_rfc3339();
        let conn = db.lock().unwrap();
        conn.execute(
            "UPDATE units SET last_accessed = ?1, created_at = ?1 WHERE id = ?2",
            params![when, id],
        )
        .unwrap();
    }

    fn score_of(db: &Arc<Mutex<Connection>>, id: i64) -> f64 {
        let conn = db.lock().unwrap();
        conn.query_row(
            "SELECT score_decay FROM units WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )
        .unwrap()
    }

    #[test]
    fn decay_halves_score_at_half_life() {
        let db = test_db();
        let id = insert(&db, "aging fact", spike(0));
        backdate_access(&db, id, 30);

        {
            let conn = db.lock().unwrap();
            apply_decay(&conn, 30.0).unwrap();
        }
        assert!((score_of(&db, id) - 0.5).abs() < 0.01);
    }

    #[test]
    fn decay_skips_fresh_units() {
        let db = test_db();
        let id = insert(&db, "fresh fact", spike(0));
        backdate_access(&db, id, 0);

        {
            let conn = db.lock().unwrap();
            apply_decay(&conn, 30.0).unwrap();
        }
        assert!(score_of(&db, id) > 0.99);
    }

    #[test]
    fn repeated_passes_follow_the_continuous_formula() {
        let db = test_db();
        let id = insert(&db, "long unrecalled fact", spike(0));
        backdate_access(&db, id, 60);

        // 60 days at a 30-day half-life: e^(−ln2·2) = 0.25.
        {
            let conn = db.lock().unwrap();
            apply_decay(&conn, 30.0).unwrap();
        }
        assert!((score_of(&db, id) - 0.25).abs() < 0.01);

        // An immediate second pass covers a ~zero interval: no extra decay.
        {
            let conn = db.lock().unwrap();
            apply_decay(&conn, 30.0).unwrap();
        }
        assert!((score_of(&db, id) - 0.25).abs() < 0.01);

        // Pretend that pass happened 30 days ago; the next pass decays only
        // the incremental interval, landing on the continuous total:
        // 90 days ≡ e^(−ln2·3) = 0.125, not 0.25·e^(−ln2·3).
        {
            let conn = db.lock().unwrap();
            let then = (chrono::Utc::now() - chrono::Duration::days(30)).to_rfc3339();
            conn.execute(
                "UPDATE units SET last_decayed_at = ?1 WHERE id = ?2",
                params![then, id],
            )
            .unwrap();
            apply_decay(&conn, 30.0).unwrap();
        }
        assert!((score_of(&db, id) - 0.125).abs() < 0.01);
    }

    #[test]
    fn recall_restarts_the_decay_clock() {
        let db = test_db();
        let id = insert(&db, "re-read fact", spike(0));
        backdate_access(&db, id, 60);

        {
            let conn = db.lock().unwrap();
            apply_decay(&conn, 30.0).unwrap();
        }
        let after_first = score_of(&db, id);

        // A recall after the pass moves the reference forward, so the next
        // pass sees no un-decayed interval (only the recall bump applies).
        {
            let conn = db.lock().unwrap();
            store::mark_recalled(&conn, &[id]).unwrap();
            apply_decay(&conn, 30.0).unwrap();
        }
        assert!((score_of(&db, id) - (after_first + 0.1)).abs() < 0.01);
    }

    #[test]
    fn prune_tombstones_low_score_units() {
        let db = test_db();
        let id = insert(&db, "faded fact", spike(0));
        {
            let conn = db.lock().unwrap();
            conn.execute(
                "UPDATE units SET score_decay = 0.01 WHERE id = ?1",
                params![id],
            )
            .unwrap();
        }

        let mut conn = db.lock().unwrap();
        let pruned = prune(&mut conn, 0.05).unwrap();
        assert_eq!(pruned, 1);

        let unit = store::get_unit(&conn, id).unwrap().unwrap();
        assert!(!unit.is_live());
    }

    #[test]
    fn prune_spares_children_of_synthesized_units() {
        let db = test_db();
        let child = insert(&db, "child fact", spike(0));
        {
            let mut conn = db.lock().unwrap();
            insert_unit(
                &mut conn,
                &NewUnit {
                    text: "parent abstraction".into(),
                    kind: UnitKind::Synthesized,
                    children: vec![child],
                    metadata: UnitMetadata {
                        timestamp_utc: "2025-01-01T00:00:00Z".into(),
                        ..Default::default()
                    },
                    embedding: spike(1),
                    tokens: tokenize("parent abstraction"),
                },
            )
            .unwrap();
            conn.execute(
                "UPDATE units SET score_decay = 0.01 WHERE id = ?1",
                params![child],
            )
            .unwrap();
        }

        let mut conn = db.lock().unwrap();
        let pruned = prune(&mut conn, 0.05).unwrap();
        assert_eq!(pruned, 0);
    }

    #[test]
    fn gc_purges_old_unreferenced_tombstones() {
        let db = test_db();
        let id = insert(&db, "long dead", spike(0));
        {
            let mut conn = db.lock().unwrap();
            store::tombstone_unit(&mut conn, id, "test").unwrap();
            let old = (chrono::Utc::now() - chrono::Duration::days(30)).to_rfc3339();
            conn.execute(
                "UPDATE units SET tombstoned_at = ?1 WHERE id = ?2",
                params![old, id],
            )
            .unwrap();
        }

        let mut conn = db.lock().unwrap();
        let purged = gc_tombstones(&mut conn, 7).unwrap();
        assert_eq!(purged, 1);
        assert!(store::get_unit(&conn, id).unwrap().is_none());
    }

    #[test]
    fn gc_keeps_recent_tombstones() {
        let db = test_db();
        let id = insert(&db, "freshly dead", spike(0));
        {
            let mut conn = db.lock().unwrap();
            store::tombstone_unit(&mut conn, id, "test").unwrap();
        }

        let mut conn = db.lock().unwrap();
        let purged = gc_tombstones(&mut conn, 7).unwrap();
        assert_eq!(purged, 0);
        assert!(store::get_unit(&conn, id).unwrap().is_some());
    }

    /// Gateway that merges any pair it is shown.
    struct MergingGateway;

    #[async_trait]
    impl ProviderGateway for MergingGateway {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(texts.iter().map(|_| spike(0)).collect())
        }

        async fn chat(
            &self,
            _: &str,
            messages: &[ChatMessage],
            _: Option<&serde_json::Value>,
        ) -> Result<ChatOutput, ProviderError> {
            // Merge the first candidate listed in the prompt.
            let prompt = &messages[0].content;
            let candidate_id = prompt
                .lines()
                .filter_map(|l| {
                    l.strip_prefix('[')
                        .and_then(|r| r.split(']').next())
                        .and_then(|n| n.parse::<i64>().ok())
                })
                .next();
            match candidate_id {
                Some(id) => Ok(ChatOutput::Structured(json!({
                    "verdicts": [{"unit_id": id, "decision": "merge"}],
                    "merged_text": "merged abstraction of near-duplicate facts"
                }))),
                None => Ok(ChatOutput::Structured(json!({"verdicts": []}))),
            }
        }

        fn embedding_dim(&self) -> usize {
            DIM
        }
    }

    #[tokio::test]
    async fn full_pass_merges_near_duplicates() {
        let db = test_db();
        // Two nearly identical embeddings: cosine similarity ~0.995
        let a = {
            let mut v = spike(0);
            v[1] = 0.1;
            let n: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            v.iter_mut().for_each(|x| *x /= n);
            v
        };
        insert(&db, "User lives in Lisbon", spike(0));
        insert(&db, "User is based in Lisbon", a);

        let config = ConsolidationConfig::default();
        let report = consolidate(&db, &MergingGateway, &config, 8).await.unwrap();

        assert!(report.merged >= 1);
        let conn = db.lock().unwrap();
        let live = store::live_unit_ids(&conn).unwrap();
        assert_eq!(live.len(), 1);
        let survivor = store::get_unit(&conn, live[0]).unwrap().unwrap();
        assert_eq!(survivor.kind, UnitKind::Synthesized);
    }
}
