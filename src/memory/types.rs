//! Core memory type definitions.
//!
//! Defines [`UnitKind`] (atomic vs synthesized), [`MemoryUnit`] (a full unit
//! row), [`UnitMetadata`] (the symbolic view of a unit), and [`DialogueTurn`]
//! (compressor input).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a unit came straight from the compressor or was produced by merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// Emitted by the compressor: one self-contained statement.
    Atomic,
    /// Produced by the synthesizer: subsumes one or more children.
    Synthesized,
}

impl UnitKind {
    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Atomic => "atomic",
            Self::Synthesized => "synthesized",
        }
    }
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UnitKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "atomic" => Ok(Self::Atomic),
            "synthesized" => Ok(Self::Synthesized),
            _ => Err(format!("unknown unit kind: {s}")),
        }
    }
}

/// The symbolic (structured) view of a unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitMetadata {
    /// Absolute UTC timestamp of the fact (RFC 3339).
    pub timestamp_utc: String,
    /// Named non-person entities the fact mentions.
    #[serde(default)]
    pub entities: Vec<String>,
    /// People the fact mentions.
    #[serde(default)]
    pub persons: Vec<String>,
    /// Session that produced the unit, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_session_id: Option<String>,
    /// Events that supplied the evidence, if any.
    #[serde(default)]
    pub source_event_ids: Vec<i64>,
}

/// A memory unit row, matching the `units` table schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryUnit {
    /// Monotonic id within the tenant; never reused.
    pub id: i64,
    /// Self-contained statement: no unresolved pronouns, no relative times.
    pub text: String,
    pub kind: UnitKind,
    /// Ids of the units this one subsumes. Empty for atomic units.
    #[serde(default)]
    pub children: Vec<i64>,
    pub metadata: UnitMetadata,
    /// Rises on recall, decays with age; consolidation prunes near zero.
    pub score_decay: f64,
    /// ISO 8601 timestamp of the last recall, or `None` if never accessed.
    pub last_accessed: Option<String>,
    /// Set when the unit is subsumed or pruned; hard deletes happen only in GC.
    pub tombstoned_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl MemoryUnit {
    /// Whether the unit is still live (not tombstoned).
    pub fn is_live(&self) -> bool {
        self.tombstoned_at.is_none()
    }
}

/// A unit as it exists before insertion (no id yet).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUnit {
    pub text: String,
    pub kind: UnitKind,
    #[serde(default)]
    pub children: Vec<i64>,
    pub metadata: UnitMetadata,
    pub embedding: Vec<f32>,
    /// Normalized lexical tokens for the FTS index.
    pub tokens: Vec<String>,
}

/// One turn of dialogue handed to the compressor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueTurn {
    pub speaker: String,
    pub content: String,
    /// Absolute UTC time of the turn; the anchor for relative-time resolution.
    pub timestamp: DateTime<Utc>,
}
