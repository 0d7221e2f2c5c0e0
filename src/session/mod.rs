//! Cross-session memory: lifecycle rows, redaction, observation extraction,
//! and context injection.
//!
//! This module owns the metadata-database rows (sessions, events,
//! observations); the orchestration that ties them to the memory engine —
//! context injection at start, observation extraction and compression at
//! stop — lives in [`crate::engine`].

pub mod context;
pub mod observations;
pub mod redaction;
pub mod types;

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{ServiceError, ServiceResult};
use types::{Event, EventKind, Observation, Session, SessionStatus};

/// Create a session row in `active` state. Returns the new session.
pub fn create_session(
    conn: &Connection,
    user_id: &str,
    content_session_id: &str,
    project: &str,
) -> Result<Session> {
    let memory_session_id = uuid::Uuid::now_v7().to_string();
    let started_at = chrono::Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO sessions (memory_session_id, user_id, content_session_id, project, \
         status, started_at) VALUES (?1, ?2, ?3, ?4, 'active', ?5)",
        params![memory_session_id, user_id, content_session_id, project, started_at],
    )?;

    Ok(Session {
        memory_session_id,
        user_id: user_id.to_string(),
        content_session_id: content_session_id.to_string(),
        project: project.to_string(),
        status: SessionStatus::Active,
        started_at,
        ended_at: None,
        summary: None,
    })
}

/// Fetch a session, enforcing tenant ownership.
///
/// An id owned by another tenant reads as `NotFound` — existence never leaks
/// across tenants.
pub fn get_session(
    conn: &Connection,
    user_id: &str,
    memory_session_id: &str,
) -> ServiceResult<Session> {
    let session = conn
        .query_row(
            "SELECT memory_session_id, user_id, content_session_id, project, status, \
             started_at, ended_at, summary FROM sessions WHERE memory_session_id = ?1",
            params![memory_session_id],
            |row| {
                let status: String = row.get(4)?;
                Ok(Session {
                    memory_session_id: row.get(0)?,
                    user_id: row.get(1)?,
                    content_session_id: row.get(2)?,
                    project: row.get(3)?,
                    status: status.parse().unwrap_or(SessionStatus::Ended),
                    started_at: row.get(5)?,
                    ended_at: row.get(6)?,
                    summary: row.get(7)?,
                })
            },
        )
        .optional()?;

    match session {
        Some(session) if session.user_id == user_id => Ok(session),
        _ => Err(ServiceError::NotFound(format!(
            "session {memory_session_id}"
        ))),
    }
}

/// Persist a validated status transition, with the summary at stop and the
/// end timestamp at end.
pub fn set_status(
    conn: &Connection,
    memory_session_id: &str,
    status: SessionStatus,
    summary: Option<&str>,
) -> Result<()> {
    match status {
        SessionStatus::Ended => {
            conn.execute(
                "UPDATE sessions SET status = ?1, ended_at = ?2 WHERE memory_session_id = ?3",
                params![status.as_str(), chrono::Utc::now().to_rfc3339(), memory_session_id],
            )?;
        }
        _ => {
            conn.execute(
                "UPDATE sessions SET status = ?1, summary = COALESCE(?2, summary) \
                 WHERE memory_session_id = ?3",
                params![status.as_str(), summary, memory_session_id],
            )?;
        }
    }
    Ok(())
}

/// Append an event. The payload must already be redacted. Returns the
/// event id, which is the session's total order.
pub fn append_event(
    conn: &Connection,
    memory_session_id: &str,
    kind: EventKind,
    redacted_payload: &str,
) -> Result<i64> {
    let timestamp = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO events (memory_session_id, kind, payload, timestamp) \
         VALUES (?1, ?2, ?3, ?4)",
        params![memory_session_id, kind.as_str(), redacted_payload, timestamp],
    )?;
    Ok(conn.last_insert_rowid())
}

/// All events of a session in recording order.
pub fn list_events(conn: &Connection, memory_session_id: &str) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, memory_session_id, kind, payload, timestamp \
         FROM events WHERE memory_session_id = ?1 ORDER BY event_id",
    )?;
    let events = stmt
        .query_map(params![memory_session_id], |row| {
            let kind: String = row.get(2)?;
            Ok(Event {
                event_id: row.get(0)?,
                memory_session_id: row.get(1)?,
                kind: kind.parse().unwrap_or(EventKind::Message),
                payload: row.get(3)?,
                timestamp: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(events)
}

/// Persist extracted observations.
pub fn insert_observations(conn: &Connection, observations: &[Observation]) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    let mut stmt = conn.prepare(
        "INSERT INTO observations (observation_id, memory_session_id, category, text, \
         evidence_event_ids, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for obs in observations {
        stmt.execute(params![
            obs.observation_id,
            obs.memory_session_id,
            obs.category.as_str(),
            obs.text,
            serde_json::to_string(&obs.evidence_event_ids)?,
            now,
        ])?;
    }
    Ok(())
}

/// The summary of the tenant's most recently stopped or ended session.
pub fn latest_summary(conn: &Connection, user_id: &str) -> Result<Option<String>> {
    let summary = conn
        .query_row(
            "SELECT summary FROM sessions \
             WHERE user_id = ?1 AND summary IS NOT NULL \
             ORDER BY started_at DESC LIMIT 1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(summary)
}

/// Prune a finalized session's events per retention policy.
pub fn prune_events(conn: &Connection, memory_session_id: &str) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM events WHERE memory_session_id = ?1",
        params![memory_session_id],
    )?;
    Ok(deleted)
}
