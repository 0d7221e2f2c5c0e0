//! SQL DDL for the metadata and tenant databases.
//!
//! The metadata database holds `users`, `sessions`, `events`, `observations`,
//! and `schema_meta`. Each tenant database holds `units`, `units_fts` (FTS5),
//! `units_vec` (vec0), `pending_units` (write-ahead journal), `unit_log`, and
//! `schema_meta`. All DDL uses `IF NOT EXISTS` for idempotent initialization.

use rusqlite::Connection;

/// DDL for the shared metadata database.
const META_SCHEMA_SQL: &str = r#"
-- Tenant registry: one row per registered user
CREATE TABLE IF NOT EXISTS users (
    user_id TEXT PRIMARY KEY,
    api_key_enc TEXT NOT NULL,
    embedding_dim INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

-- Cross-session lifecycle
CREATE TABLE IF NOT EXISTS sessions (
    memory_session_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(user_id),
    content_session_id TEXT NOT NULL,
    project TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active','stopped','ended')),
    started_at TEXT NOT NULL,
    ended_at TEXT,
    summary TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);

-- Append-only event log, ordered by recording order (event_id)
CREATE TABLE IF NOT EXISTS events (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    memory_session_id TEXT NOT NULL REFERENCES sessions(memory_session_id),
    kind TEXT NOT NULL CHECK(kind IN ('message','tool_use','file_change')),
    payload TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_session ON events(memory_session_id);

-- Observations extracted at session stop
CREATE TABLE IF NOT EXISTS observations (
    observation_id TEXT PRIMARY KEY,
    memory_session_id TEXT NOT NULL REFERENCES sessions(memory_session_id),
    category TEXT NOT NULL CHECK(category IN ('decision','discovery','learning','other')),
    text TEXT NOT NULL,
    evidence_event_ids TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_observations_session ON observations(memory_session_id);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// DDL for a tenant's unit store (everything except the vec0 table).
const TENANT_SCHEMA_SQL: &str = r#"
-- Memory units. AUTOINCREMENT guarantees ids are monotonic and never reused.
CREATE TABLE IF NOT EXISTS units (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    text TEXT NOT NULL,
    kind TEXT NOT NULL CHECK(kind IN ('atomic','synthesized')),
    children TEXT,
    timestamp_utc TEXT NOT NULL,
    entities TEXT NOT NULL DEFAULT '[]',
    persons TEXT NOT NULL DEFAULT '[]',
    source_session_id TEXT,
    source_event_ids TEXT NOT NULL DEFAULT '[]',
    score_decay REAL NOT NULL DEFAULT 1.0 CHECK(score_decay >= 0.0),
    last_accessed TEXT,
    last_decayed_at TEXT,
    tombstoned_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_units_kind ON units(kind);
CREATE INDEX IF NOT EXISTS idx_units_timestamp ON units(timestamp_utc);
CREATE INDEX IF NOT EXISTS idx_units_tombstone ON units(tombstoned_at);
CREATE INDEX IF NOT EXISTS idx_units_session ON units(source_session_id);

-- Lexical index (BM25). Stores the normalized token text per unit.
CREATE VIRTUAL TABLE IF NOT EXISTS units_fts USING fts5(
    tokens,
    unit_id UNINDEXED
);

-- Write-ahead journal: a unit's full payload is committed here before the
-- tri-index write, and the row is deleted in the same transaction that
-- applies the write. Surviving rows are replayed on open.
CREATE TABLE IF NOT EXISTS pending_units (
    journal_id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Audit log
CREATE TABLE IF NOT EXISTS unit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN ('create','synthesize','tombstone','decay','prune','recall')),
    unit_id INTEGER NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

-- Schema metadata (schema_version, embedding_dim, embedding_model)
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize the metadata database schema. Idempotent.
pub fn init_meta_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(META_SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;
    Ok(())
}

/// Initialize a tenant database schema for the given embedding dimension.
///
/// The vec0 virtual table is dimension-bound, so it is created from the
/// tenant's declared dimension (sqlite-vec requires the dimension in DDL).
/// Idempotent for a fixed dimension; the caller verifies the stored
/// dimension before opening (see [`crate::db::migrations`]).
pub fn init_tenant_schema(conn: &Connection, embedding_dim: usize) -> rusqlite::Result<()> {
    conn.execute_batch(TENANT_SCHEMA_SQL)?;
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS units_vec USING vec0(
            unit_id INTEGER PRIMARY KEY,
            embedding FLOAT[{embedding_dim}]
        );"
    ))?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('embedding_dim', ?1)",
        [embedding_dim.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_schema_creates_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        init_meta_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"users".to_string()));
        assert!(tables.contains(&"sessions".to_string()));
        assert!(tables.contains(&"events".to_string()));
        assert!(tables.contains(&"observations".to_string()));
        assert!(tables.contains(&"schema_meta".to_string()));
    }

    #[test]
    fn tenant_schema_creates_all_tables() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_tenant_schema(&conn, 8).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"units".to_string()));
        assert!(tables.contains(&"pending_units".to_string()));
        assert!(tables.contains(&"unit_log".to_string()));

        // Virtual tables are functional
        let version: String = conn
            .query_row("SELECT vec_version()", [], |r| r.get(0))
            .unwrap();
        assert!(!version.is_empty());
    }

    #[test]
    fn tenant_schema_is_idempotent() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_tenant_schema(&conn, 8).unwrap();
        init_tenant_schema(&conn, 8).unwrap(); // second call should not error
    }

    #[test]
    fn tenant_schema_records_dimension() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_tenant_schema(&conn, 384).unwrap();

        let dim: String = conn
            .query_row(
                "SELECT value FROM schema_meta WHERE key = 'embedding_dim'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(dim, "384");
    }
}
