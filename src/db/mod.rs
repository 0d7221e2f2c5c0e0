pub mod migrations;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

fn open_with_pragmas(path: &Path) -> Result<Connection> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    load_sqlite_vec();

    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    // WAL mode for concurrent read performance
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    // Wait up to 5 seconds for locks instead of failing immediately
    conn.pragma_update(None, "busy_timeout", "5000")?;

    Ok(conn)
}

/// Open (or create) the shared metadata database (users, sessions, events,
/// observations) at the given path.
pub fn open_meta_database(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();
    let conn = open_with_pragmas(path)?;

    schema::init_meta_schema(&conn).context("failed to initialize metadata schema")?;
    migrations::run_migrations(&conn).context("failed to run migrations")?;

    let integrity: String = conn.pragma_query_value(None, "quick_check", |row| row.get(0))?;
    if integrity != "ok" {
        anyhow::bail!("metadata database integrity check failed: {integrity}");
    }

    tracing::info!(path = %path.display(), "metadata database initialized");
    Ok(conn)
}

/// Open (or create) a tenant's unit database.
///
/// The returned connection is fully initialized: schema applied, the stored
/// embedding dimension verified against `embedding_dim`, pending journal
/// entries replayed, and integrity checked. A tenant handle is never handed
/// out in a partially-open state.
pub fn open_tenant_database(path: impl AsRef<Path>, embedding_dim: usize) -> Result<Connection> {
    let path = path.as_ref();
    let conn = open_with_pragmas(path)?;

    schema::init_tenant_schema(&conn, embedding_dim)
        .context("failed to initialize tenant schema")?;
    migrations::run_migrations(&conn).context("failed to run migrations")?;

    // The dimension is write-once per tenant: reject a reconfigured dimension
    // rather than silently corrupting the vector table.
    if let Some(stored) = migrations::get_embedding_dim(&conn)? {
        if stored != embedding_dim {
            anyhow::bail!(
                "embedding dimension mismatch: tenant store was created with {stored}, \
                 configured {embedding_dim}"
            );
        }
    }

    let replayed = crate::memory::store::recover_pending(&conn)
        .context("failed to recover pending writes")?;
    if replayed > 0 {
        tracing::warn!(replayed, path = %path.display(), "replayed pending unit writes");
    }

    let integrity: String = conn.pragma_query_value(None, "quick_check", |row| row.get(0))?;
    if integrity != "ok" {
        anyhow::bail!("tenant database integrity check failed: {integrity}");
    }

    tracing::info!(path = %path.display(), "tenant database initialized");
    Ok(conn)
}

/// Result of a metadata database health check.
pub struct HealthReport {
    pub schema_version: u32,
    pub integrity_ok: bool,
    pub integrity_details: String,
    pub user_count: i64,
    pub session_count: i64,
    pub event_count: i64,
}

/// Run a health check on the metadata database.
pub fn check_database_health(conn: &Connection) -> Result<HealthReport> {
    let schema_version =
        migrations::get_schema_version(conn).context("failed to read schema version")?;

    let integrity_details: String = conn
        .pragma_query_value(None, "integrity_check", |row| row.get(0))
        .context("failed to run integrity check")?;
    let integrity_ok = integrity_details == "ok";

    let user_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
        .unwrap_or(0);

    let session_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
        .unwrap_or(0);

    let event_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(HealthReport {
        schema_version,
        integrity_ok,
        integrity_details,
        user_count,
        session_count,
        event_count,
    })
}

/// Open an in-memory metadata database for testing.
pub fn open_memory_meta_database() -> Result<Connection> {
    load_sqlite_vec();
    let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::init_meta_schema(&conn).context("failed to initialize schema")?;
    Ok(conn)
}

/// Open an in-memory tenant database for testing.
pub fn open_memory_tenant_database(embedding_dim: usize) -> Result<Connection> {
    load_sqlite_vec();
    let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::init_tenant_schema(&conn, embedding_dim)
        .context("failed to initialize schema")?;
    Ok(conn)
}
