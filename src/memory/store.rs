//! Tenant store write path — journaled tri-index inserts, tombstones, and
//! audit logging.
//!
//! [`insert_unit`] is the single entry point for new units. Writes are atomic
//! across the three indexes: the unit's full payload is first committed to the
//! `pending_units` journal, then a second transaction applies the row to
//! `units`, `units_fts`, and `units_vec` and deletes the journal entry. A
//! crash between the two leaves the journal row behind; [`recover_pending`]
//! replays it on the next open, so every id appears in all three indexes or
//! in none.

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::memory::types::{MemoryUnit, NewUnit, UnitKind, UnitMetadata};

/// Full write path: dimension check → journal commit → tri-index apply.
///
/// Returns the id assigned to the new unit.
pub fn insert_unit(conn: &mut Connection, unit: &NewUnit) -> Result<i64> {
    check_dimension(conn, unit.embedding.len())?;

    // Phase 1: commit the intent. If we crash after this point the write
    // is recovered on the next open.
    let payload = serde_json::to_string(unit).context("failed to serialize unit payload")?;
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO pending_units (payload, created_at) VALUES (?1, ?2)",
        params![payload, now],
    )?;
    let journal_id = conn.last_insert_rowid();

    // Phase 2: apply to all three indexes and consume the journal entry.
    let tx = conn.transaction()?;
    let id = apply_unit(&tx, unit)?;
    tx.execute(
        "DELETE FROM pending_units WHERE journal_id = ?1",
        params![journal_id],
    )?;
    tx.commit()?;

    Ok(id)
}

/// Apply a unit to units + units_fts + units_vec inside one transaction.
fn apply_unit(tx: &Transaction, unit: &NewUnit) -> Result<i64> {
    let now = chrono::Utc::now().to_rfc3339();
    let children_json = if unit.children.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&unit.children)?)
    };

    tx.execute(
        "INSERT INTO units (text, kind, children, timestamp_utc, entities, persons, \
         source_session_id, source_event_ids, score_decay, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1.0, ?9, ?9)",
        params![
            unit.text,
            unit.kind.as_str(),
            children_json,
            unit.metadata.timestamp_utc,
            serde_json::to_string(&unit.metadata.entities)?,
            serde_json::to_string(&unit.metadata.persons)?,
            unit.metadata.source_session_id,
            serde_json::to_string(&unit.metadata.source_event_ids)?,
            now,
        ],
    )?;
    let id = tx.last_insert_rowid();

    tx.execute(
        "INSERT INTO units_fts (tokens, unit_id) VALUES (?1, ?2)",
        params![unit.tokens.join(" "), id],
    )?;

    tx.execute(
        "INSERT INTO units_vec (unit_id, embedding) VALUES (?1, ?2)",
        params![id, super::embedding_to_bytes(&unit.embedding)],
    )?;

    let operation = match unit.kind {
        UnitKind::Atomic => "create",
        UnitKind::Synthesized => "synthesize",
    };
    write_unit_log(tx, operation, id, None)?;

    Ok(id)
}

/// Replay any journal entries that survived a crash. Returns the count.
///
/// A surviving entry means the tri-index transaction never committed, so the
/// unit is absent from all three tables and can be applied fresh.
pub fn recover_pending(conn: &Connection) -> Result<usize> {
    let pending: Vec<(i64, String)> = {
        let mut stmt = conn
            .prepare("SELECT journal_id, payload FROM pending_units ORDER BY journal_id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut replayed = 0;
    for (journal_id, payload) in pending {
        let unit: NewUnit = serde_json::from_str(&payload)
            .with_context(|| format!("corrupt journal entry {journal_id}"))?;

        // Recovery runs on a freshly opened connection with no other
        // statements in flight, so an unchecked transaction is safe.
        let tx = conn.unchecked_transaction()?;
        let id = apply_unit(&tx, &unit)?;
        tx.execute(
            "DELETE FROM pending_units WHERE journal_id = ?1",
            params![journal_id],
        )?;
        tx.commit()?;

        tracing::info!(unit = id, journal = journal_id, "replayed pending unit write");
        replayed += 1;
    }

    Ok(replayed)
}

/// Tombstone a unit: mark the row and drop it from the search indexes.
///
/// The raw row stays in `units` so synthesized parents can still resolve
/// their children; hard deletes happen only in consolidation GC.
pub fn tombstone_unit(conn: &mut Connection, id: i64, reason: &str) -> Result<()> {
    let tx = conn.transaction()?;
    let now = chrono::Utc::now().to_rfc3339();

    let rows = tx.execute(
        "UPDATE units SET tombstoned_at = ?1, updated_at = ?1 \
         WHERE id = ?2 AND tombstoned_at IS NULL",
        params![now, id],
    )?;
    if rows == 0 {
        // Already tombstoned or missing — check which.
        let exists: bool = tx
            .query_row("SELECT 1 FROM units WHERE id = ?1", params![id], |_| Ok(true))
            .optional()?
            .unwrap_or(false);
        if !exists {
            bail!("unit not found: {id}");
        }
        tx.commit()?;
        return Ok(());
    }

    tx.execute("DELETE FROM units_fts WHERE unit_id = ?1", params![id])?;
    tx.execute("DELETE FROM units_vec WHERE unit_id = ?1", params![id])?;
    write_unit_log(
        &tx,
        "tombstone",
        id,
        Some(&serde_json::json!({ "reason": reason })),
    )?;

    tx.commit()?;
    Ok(())
}

/// Hard-delete a tombstoned unit from every table. Consolidation GC only.
pub fn purge_unit(conn: &mut Connection, id: i64) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM units_fts WHERE unit_id = ?1", params![id])?;
    tx.execute("DELETE FROM units_vec WHERE unit_id = ?1", params![id])?;
    write_unit_log(&tx, "prune", id, Some(&serde_json::json!({"hard_delete": true})))?;
    tx.execute("DELETE FROM units WHERE id = ?1", params![id])?;
    tx.commit()?;
    Ok(())
}

/// Fetch a single unit by id (tombstoned rows included).
pub fn get_unit(conn: &Connection, id: i64) -> Result<Option<MemoryUnit>> {
    let unit = conn
        .query_row(
            &format!("SELECT {UNIT_COLUMNS} FROM units WHERE id = ?1"),
            params![id],
            unit_from_row,
        )
        .optional()?;
    Ok(unit)
}

/// Batch-fetch units by id, in the order given. Missing ids are skipped.
pub fn get_units(conn: &Connection, ids: &[i64]) -> Result<Vec<MemoryUnit>> {
    let mut out = Vec::with_capacity(ids.len());
    let mut stmt =
        conn.prepare(&format!("SELECT {UNIT_COLUMNS} FROM units WHERE id = ?1"))?;
    for id in ids {
        if let Some(unit) = stmt.query_row(params![id], unit_from_row).optional()? {
            out.push(unit);
        }
    }
    Ok(out)
}

/// Bump recall state for returned units: `score_decay` rises, `last_accessed`
/// moves to now. Feeds consolidation decay.
pub fn mark_recalled(conn: &Connection, ids: &[i64]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let now = chrono::Utc::now().to_rfc3339();
    let mut stmt = conn.prepare(
        "UPDATE units SET score_decay = score_decay + 0.1, last_accessed = ?1 WHERE id = ?2",
    )?;
    for id in ids {
        stmt.execute(params![now, id])?;
        write_unit_log(conn, "recall", *id, None)?;
    }
    Ok(())
}

/// Ids of live (non-tombstoned) units.
pub fn live_unit_ids(conn: &Connection) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM units WHERE tombstoned_at IS NULL")?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Write an entry to the unit_log audit table.
pub(crate) fn write_unit_log(
    conn: &Connection,
    operation: &str,
    unit_id: i64,
    details: Option<&serde_json::Value>,
) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    let details_json = details.map(|d| d.to_string());
    conn.execute(
        "INSERT INTO unit_log (operation, unit_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![operation, unit_id, details_json, now],
    )?;
    Ok(())
}

/// Reject embeddings that don't match the tenant's declared dimension.
fn check_dimension(conn: &Connection, len: usize) -> Result<()> {
    let stored = crate::db::migrations::get_embedding_dim(conn)?
        .context("tenant store has no recorded embedding dimension")?;
    if len != stored {
        bail!("embedding dimension mismatch: got {len}, tenant requires {stored}");
    }
    Ok(())
}

const UNIT_COLUMNS: &str = "id, text, kind, children, timestamp_utc, entities, persons, \
     source_session_id, source_event_ids, score_decay, last_accessed, tombstoned_at, \
     created_at, updated_at";

fn unit_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryUnit> {
    let kind_str: String = row.get(2)?;
    let children_json: Option<String> = row.get(3)?;
    let entities_json: String = row.get(5)?;
    let persons_json: String = row.get(6)?;
    let event_ids_json: String = row.get(8)?;

    Ok(MemoryUnit {
        id: row.get(0)?,
        text: row.get(1)?,
        kind: kind_str.parse().unwrap_or(UnitKind::Atomic),
        children: children_json
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        metadata: UnitMetadata {
            timestamp_utc: row.get(4)?,
            entities: serde_json::from_str(&entities_json).unwrap_or_default(),
            persons: serde_json::from_str(&persons_json).unwrap_or_default(),
            source_session_id: row.get(7)?,
            source_event_ids: serde_json::from_str(&event_ids_json).unwrap_or_default(),
        },
        score_decay: row.get(9)?,
        last_accessed: row.get(10)?,
        tombstoned_at: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::memory::tokenize;

    const DIM: usize = 8;

    fn test_db() -> Connection {
        db::open_memory_tenant_database(DIM).unwrap()
    }

    fn test_unit(text: &str, spike: usize) -> NewUnit {
        let mut embedding = vec![0.0f32; DIM];
        embedding[spike % DIM] = 1.0;
        NewUnit {
            text: text.to_string(),
            kind: UnitKind::Atomic,
            children: Vec::new(),
            metadata: UnitMetadata {
                timestamp_utc: "2025-11-15T14:30:00Z".into(),
                entities: vec!["Starbucks".into()],
                persons: vec!["Alice".into()],
                source_session_id: None,
                source_event_ids: Vec::new(),
            },
            embedding,
            tokens: tokenize(text),
        }
    }

    #[test]
    fn insert_populates_all_three_indexes() {
        let mut conn = test_db();
        let id = insert_unit(&mut conn, &test_unit("Alice likes quantum coffee", 0)).unwrap();

        let text: String = conn
            .query_row("SELECT text FROM units WHERE id = ?1", params![id], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(text, "Alice likes quantum coffee");

        let fts_id: i64 = conn
            .query_row(
                "SELECT unit_id FROM units_fts WHERE units_fts MATCH 'quantum'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(fts_id, id);

        let vec_id: i64 = conn
            .query_row(
                "SELECT unit_id FROM units_vec WHERE unit_id = ?1",
                params![id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(vec_id, id);

        // Journal is consumed
        let pending: i64 = conn
            .query_row("SELECT COUNT(*) FROM pending_units", [], |r| r.get(0))
            .unwrap();
        assert_eq!(pending, 0);
    }

    #[test]
    fn ids_are_monotonic() {
        let mut conn = test_db();
        let a = insert_unit(&mut conn, &test_unit("first", 0)).unwrap();
        let b = insert_unit(&mut conn, &test_unit("second", 1)).unwrap();
        assert!(b > a);
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let mut conn = test_db();
        let mut unit = test_unit("bad", 0);
        unit.embedding = vec![0.0f32; DIM + 1];
        let err = insert_unit(&mut conn, &unit).unwrap_err();
        assert!(err.to_string().contains("dimension mismatch"));

        // Nothing leaked into any table, journal included
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM units", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
        let pending: i64 = conn
            .query_row("SELECT COUNT(*) FROM pending_units", [], |r| r.get(0))
            .unwrap();
        assert_eq!(pending, 0);
    }

    #[test]
    fn recover_replays_orphaned_journal_entry() {
        let conn = test_db();

        // Simulate a crash between journal commit and the tri-index apply.
        let payload = serde_json::to_string(&test_unit("recovered fact", 2)).unwrap();
        conn.execute(
            "INSERT INTO pending_units (payload, created_at) VALUES (?1, ?2)",
            params![payload, chrono::Utc::now().to_rfc3339()],
        )
        .unwrap();

        let replayed = recover_pending(&conn).unwrap();
        assert_eq!(replayed, 1);

        // Unit exists in all three indexes, journal is empty
        let id: i64 = conn
            .query_row("SELECT id FROM units WHERE text = 'recovered fact'", [], |r| {
                r.get(0)
            })
            .unwrap();
        let fts: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM units_fts WHERE unit_id = ?1",
                params![id],
                |r| r.get(0),
            )
            .unwrap();
        let vec: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM units_vec WHERE unit_id = ?1",
                params![id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!((fts, vec), (1, 1));

        let pending: i64 = conn
            .query_row("SELECT COUNT(*) FROM pending_units", [], |r| r.get(0))
            .unwrap();
        assert_eq!(pending, 0);
    }

    #[test]
    fn recover_is_noop_on_clean_store() {
        let conn = test_db();
        assert_eq!(recover_pending(&conn).unwrap(), 0);
    }

    #[test]
    fn tombstone_removes_from_search_indexes() {
        let mut conn = test_db();
        let id = insert_unit(&mut conn, &test_unit("ephemeral fact", 0)).unwrap();

        tombstone_unit(&mut conn, id, "test").unwrap();

        let unit = get_unit(&conn, id).unwrap().unwrap();
        assert!(!unit.is_live());

        let fts: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM units_fts WHERE unit_id = ?1",
                params![id],
                |r| r.get(0),
            )
            .unwrap();
        let vec: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM units_vec WHERE unit_id = ?1",
                params![id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!((fts, vec), (0, 0));
    }

    #[test]
    fn tombstone_is_idempotent() {
        let mut conn = test_db();
        let id = insert_unit(&mut conn, &test_unit("once", 0)).unwrap();
        tombstone_unit(&mut conn, id, "first").unwrap();
        tombstone_unit(&mut conn, id, "second").unwrap();

        let unit = get_unit(&conn, id).unwrap().unwrap();
        assert!(unit.tombstoned_at.is_some());
    }

    #[test]
    fn tombstone_missing_unit_fails() {
        let mut conn = test_db();
        let err = tombstone_unit(&mut conn, 999, "test").unwrap_err();
        assert!(err.to_string().contains("unit not found"));
    }

    #[test]
    fn get_units_preserves_order_and_skips_missing() {
        let mut conn = test_db();
        let a = insert_unit(&mut conn, &test_unit("alpha", 0)).unwrap();
        let b = insert_unit(&mut conn, &test_unit("beta", 1)).unwrap();

        let units = get_units(&conn, &[b, 999, a]).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].id, b);
        assert_eq!(units[1].id, a);
    }

    #[test]
    fn mark_recalled_bumps_score_and_access() {
        let mut conn = test_db();
        let id = insert_unit(&mut conn, &test_unit("popular fact", 0)).unwrap();

        mark_recalled(&conn, &[id]).unwrap();

        let unit = get_unit(&conn, id).unwrap().unwrap();
        assert!(unit.score_decay > 1.0);
        assert!(unit.last_accessed.is_some());
    }

    #[test]
    fn purge_removes_everything() {
        let mut conn = test_db();
        let id = insert_unit(&mut conn, &test_unit("to purge", 0)).unwrap();
        tombstone_unit(&mut conn, id, "test").unwrap();
        purge_unit(&mut conn, id).unwrap();

        assert!(get_unit(&conn, id).unwrap().is_none());
    }

    #[test]
    fn audit_log_written_on_create() {
        let mut conn = test_db();
        let id = insert_unit(&mut conn, &test_unit("logged", 0)).unwrap();

        let op: String = conn
            .query_row(
                "SELECT operation FROM unit_log WHERE unit_id = ?1",
                params![id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(op, "create");
    }
}
