//! Cross-session type definitions and the session state machine.

use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, ServiceResult};

/// Session lifecycle: `active → stopped → ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Accepting event records.
    Active,
    /// Frozen: summary and observations extracted; no further records.
    Stopped,
    /// Finalized and immutable.
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Stopped => "stopped",
            Self::Ended => "ended",
        }
    }

    /// Validate a transition; illegal moves fail with `SessionState`.
    pub fn transition(self, target: SessionStatus) -> ServiceResult<SessionStatus> {
        match (self, target) {
            (Self::Active, Self::Stopped) => Ok(Self::Stopped),
            (Self::Stopped, Self::Ended) => Ok(Self::Ended),
            (from, to) => Err(ServiceError::SessionState(format!(
                "illegal transition: {} -> {}",
                from.as_str(),
                to.as_str()
            ))),
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "stopped" => Ok(Self::Stopped),
            "ended" => Ok(Self::Ended),
            _ => Err(format!("unknown session status: {s}")),
        }
    }
}

/// A session row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Server-assigned UUID v7.
    pub memory_session_id: String,
    pub user_id: String,
    /// Client-provided tag correlating with the client's own session.
    pub content_session_id: String,
    pub project: String,
    pub status: SessionStatus,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub summary: Option<String>,
}

/// Kinds of recordable events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    ToolUse,
    FileChange,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::ToolUse => "tool_use",
            Self::FileChange => "file_change",
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "tool_use" => Ok(Self::ToolUse),
            "file_change" => Ok(Self::FileChange),
            _ => Err(format!("unknown event kind: {s}")),
        }
    }
}

/// An append-only event row. The payload is stored post-redaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Autoincrement id — total order within a session is recording order.
    pub event_id: i64,
    pub memory_session_id: String,
    pub kind: EventKind,
    pub payload: String,
    pub timestamp: String,
}

/// Observation categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationCategory {
    Decision,
    Discovery,
    Learning,
    Other,
}

impl ObservationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::Discovery => "discovery",
            Self::Learning => "learning",
            Self::Other => "other",
        }
    }
}

impl std::str::FromStr for ObservationCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "decision" => Ok(Self::Decision),
            "discovery" => Ok(Self::Discovery),
            "learning" => Ok(Self::Learning),
            "other" => Ok(Self::Other),
            _ => Err(format!("unknown observation category: {s}")),
        }
    }
}

/// An observation derived from a session's events at stop time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub observation_id: String,
    pub memory_session_id: String,
    pub category: ObservationCategory,
    pub text: String,
    pub evidence_event_ids: Vec<i64>,
}
