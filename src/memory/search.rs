//! The three per-tenant index primitives: dense vector KNN, sparse lexical
//! BM25, and symbolic metadata filtering.
//!
//! Vector and lexical results come back as `(id, score)` ranked lists; the
//! symbolic filter returns an unordered id set. Score fusion happens in the
//! retriever, not here.

use anyhow::Result;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

/// Metadata predicate for the symbolic view.
///
/// All present clauses must hold (conjunction). An empty predicate matches
/// nothing — the planner omits `q_sym` instead of sending an empty filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolicPredicate {
    /// Inclusive RFC 3339 bounds on `timestamp_utc`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_end: Option<String>,
    /// Unit must mention every listed person.
    #[serde(default)]
    pub persons: Vec<String>,
    /// Unit must mention every listed entity.
    #[serde(default)]
    pub entities: Vec<String>,
}

impl SymbolicPredicate {
    pub fn is_empty(&self) -> bool {
        self.time_start.is_none()
            && self.time_end.is_none()
            && self.persons.is_empty()
            && self.entities.is_empty()
    }
}

/// Vector KNN over live units via sqlite-vec. Returns (id, L2 distance),
/// nearest first.
pub fn vector_search(
    conn: &Connection,
    embedding: &[f32],
    k: usize,
) -> Result<Vec<(i64, f64)>> {
    let mut stmt = conn.prepare(
        "SELECT unit_id, distance FROM units_vec \
         WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    let results = stmt
        .query_map(
            params![super::embedding_to_bytes(embedding), k as i64],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(results)
}

/// FTS5 BM25 search over the lexical index. Returns (id, rank), best first.
///
/// FTS5 rank is negative (more negative = better); callers normalize before
/// fusing, so the raw rank is returned as-is.
pub fn lexical_search(conn: &Connection, terms: &[String], k: usize) -> Result<Vec<(i64, f64)>> {
    let query = escape_fts_query(terms);
    if query.is_empty() {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(
        "SELECT unit_id, rank FROM units_fts \
         WHERE units_fts MATCH ?1 ORDER BY rank LIMIT ?2",
    )?;
    let results = stmt
        .query_map(params![query, k as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(results)
}

/// Escape query terms for FTS5 MATCH syntax.
///
/// Each term is stripped of quotes and wrapped in fresh ones, joined with OR
/// so any matching term contributes (BM25 still ranks multi-term matches
/// higher). Empty tokens are dropped.
fn escape_fts_query(terms: &[String]) -> String {
    terms
        .iter()
        .map(|word| format!("\"{}\"", word.replace('"', "")))
        .filter(|w| w != "\"\"")
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Symbolic metadata filter over live units. Returns matching ids, unordered.
pub fn symbolic_filter(
    conn: &Connection,
    predicate: &SymbolicPredicate,
    k: usize,
) -> Result<Vec<i64>> {
    if predicate.is_empty() {
        return Ok(Vec::new());
    }

    let mut sql = String::from("SELECT id FROM units WHERE tombstoned_at IS NULL");
    let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(ref start) = predicate.time_start {
        sql.push_str(&format!(" AND timestamp_utc >= ?{}", args.len() + 1));
        args.push(Box::new(start.clone()));
    }
    if let Some(ref end) = predicate.time_end {
        sql.push_str(&format!(" AND timestamp_utc <= ?{}", args.len() + 1));
        args.push(Box::new(end.clone()));
    }
    for person in &predicate.persons {
        sql.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM json_each(units.persons) WHERE json_each.value = ?{})",
            args.len() + 1
        ));
        args.push(Box::new(person.clone()));
    }
    for entity in &predicate.entities {
        sql.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM json_each(units.entities) WHERE json_each.value = ?{})",
            args.len() + 1
        ));
        args.push(Box::new(entity.clone()));
    }
    sql.push_str(&format!(" LIMIT ?{}", args.len() + 1));
    args.push(Box::new(k as i64));

    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::types::ToSql> = args.iter().map(|a| a.as_ref()).collect();
    let ids = stmt
        .query_map(params.as_slice(), |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}
