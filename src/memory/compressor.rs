//! Write-path compression: windowed dialogue → atomic memory units.
//!
//! A window of dialogue turns is first scored for informational density;
//! windows below the threshold produce nothing. Dense windows are atomicized
//! by the gateway into self-contained statements — coreferences resolved to
//! named entities, relative times converted to absolute UTC against the
//! window's anchor clock — then embedded and tokenized for the tri-index.
//!
//! A provider failure aborts the whole window; the caller may retry. No
//! partial unit sets are ever returned.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::error::{ServiceError, ServiceResult};
use crate::memory::types::{DialogueTurn, NewUnit, UnitKind, UnitMetadata};
use crate::memory::tokenize;
use crate::provider::{ChatMessage, ProviderGateway};

const DENSITY_SYSTEM: &str = "You rate conversation windows for long-term memory value. \
Score 0.0 for small talk and filler, 1.0 for dense factual content (plans, decisions, \
preferences, commitments, facts about people or projects). Respond with JSON: \
{\"score\": <0.0-1.0>}";

const ATOMIZE_SYSTEM: &str = "You distill conversation into atomic memory statements. \
Each statement must stand alone: resolve every pronoun to a named person or entity, and \
convert every relative time (\"yesterday\", \"next week\", \"at 2pm\") to an absolute UTC \
timestamp using the anchor time provided. Respond with JSON: \
{\"statements\": [{\"text\": \"...\", \"timestamp_utc\": \"<RFC 3339>\", \
\"entities\": [\"...\"], \"persons\": [\"...\"]}]}";

/// Pronouns that mark an unresolved coreference in a finished statement.
const PRONOUNS: &[&str] = &[
    "he", "she", "him", "her", "hers", "his", "they", "them", "their", "theirs",
];

/// Relative-time phrases that must not survive atomicization.
const RELATIVE_TIMES: &[&str] = &[
    "yesterday",
    "today",
    "tomorrow",
    "tonight",
    "last week",
    "next week",
    "last month",
    "next month",
    "last year",
    "next year",
    "ago",
];

#[derive(Debug, Deserialize)]
struct DensityVerdict {
    score: f64,
}

#[derive(Debug, Deserialize)]
struct AtomizeResponse {
    statements: Vec<Statement>,
}

#[derive(Debug, Deserialize)]
struct Statement {
    text: String,
    #[serde(default)]
    timestamp_utc: Option<String>,
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    persons: Vec<String>,
}

/// Compress one dialogue window into zero or more atomic units.
///
/// `anchor` is the tenant's current clock, used by the gateway to resolve
/// relative times; statements that come back with no usable timestamp fall
/// back to it.
pub async fn compress_window(
    gateway: &dyn ProviderGateway,
    turns: &[DialogueTurn],
    anchor: DateTime<Utc>,
    density_threshold: f64,
    session_id: Option<&str>,
    source_event_ids: &[i64],
) -> ServiceResult<Vec<NewUnit>> {
    if turns.is_empty() {
        return Ok(Vec::new());
    }

    let window_text = render_window(turns);

    // 1. Density gate
    let score = density_score(gateway, &window_text).await?;
    if score < density_threshold {
        tracing::debug!(score, threshold = density_threshold, "window below density gate");
        return Ok(Vec::new());
    }

    // 2. Atomicization
    let statements = atomicize(gateway, &window_text, anchor).await?;

    // 3. Validate and index
    let mut accepted: Vec<Statement> = Vec::new();
    for statement in statements {
        if let Some(problem) = self_containment_violation(&statement.text) {
            tracing::warn!(text = %statement.text, problem, "dropping non-atomic statement");
            continue;
        }
        accepted.push(statement);
    }
    if accepted.is_empty() {
        return Ok(Vec::new());
    }

    let texts: Vec<String> = accepted.iter().map(|s| s.text.clone()).collect();
    let embeddings = gateway.embed(&texts).await?;

    let units = accepted
        .into_iter()
        .zip(embeddings)
        .map(|(statement, embedding)| {
            let timestamp_utc = statement
                .timestamp_utc
                .filter(|t| is_plausible_timestamp(t, anchor))
                .unwrap_or_else(|| anchor.to_rfc3339());
            NewUnit {
                tokens: tokenize(&statement.text),
                text: statement.text,
                kind: UnitKind::Atomic,
                children: Vec::new(),
                metadata: UnitMetadata {
                    timestamp_utc,
                    entities: statement.entities,
                    persons: statement.persons,
                    source_session_id: session_id.map(|s| s.to_string()),
                    source_event_ids: source_event_ids.to_vec(),
                },
                embedding,
            }
        })
        .collect();

    Ok(units)
}

async fn density_score(gateway: &dyn ProviderGateway, window_text: &str) -> ServiceResult<f64> {
    let schema = json!({"type": "object", "required": ["score"]});
    let output = gateway
        .chat(
            DENSITY_SYSTEM,
            &[ChatMessage::user(window_text)],
            Some(&schema),
        )
        .await?;
    let verdict: DensityVerdict = serde_json::from_value(output.into_structured()?)
        .map_err(|e| ServiceError::InvalidArgument(format!("bad density verdict: {e}")))?;
    Ok(verdict.score.clamp(0.0, 1.0))
}

async fn atomicize(
    gateway: &dyn ProviderGateway,
    window_text: &str,
    anchor: DateTime<Utc>,
) -> ServiceResult<Vec<Statement>> {
    let schema = json!({"type": "object", "required": ["statements"]});
    let prompt = format!(
        "Anchor time (current UTC): {}\n\nConversation window:\n{}",
        anchor.to_rfc3339(),
        window_text
    );
    let output = gateway
        .chat(ATOMIZE_SYSTEM, &[ChatMessage::user(prompt)], Some(&schema))
        .await?;
    let response: AtomizeResponse = serde_json::from_value(output.into_structured()?)
        .map_err(|e| ServiceError::InvalidArgument(format!("bad atomicization: {e}")))?;
    Ok(response.statements)
}

fn render_window(turns: &[DialogueTurn]) -> String {
    turns
        .iter()
        .map(|t| format!("[{}] {}: {}", t.timestamp.to_rfc3339(), t.speaker, t.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Check a finished statement for unresolved pronouns or relative-time
/// phrases. Returns a description of the first violation found.
pub fn self_containment_violation(text: &str) -> Option<&'static str> {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    for pronoun in PRONOUNS {
        if words.contains(pronoun) {
            return Some("unresolved pronoun");
        }
    }
    for phrase in RELATIVE_TIMES {
        if phrase.contains(' ') {
            if lowered.contains(phrase) {
                return Some("relative time phrase");
            }
        } else if words.contains(phrase) {
            return Some("relative time phrase");
        }
    }
    None
}

/// A usable timestamp parses as RFC 3339 and is not in the future beyond
/// one day of the anchor.
fn is_plausible_timestamp(value: &str, anchor: DateTime<Utc>) -> bool {
    match DateTime::parse_from_rfc3339(value) {
        Ok(parsed) => parsed.with_timezone(&Utc) <= anchor + chrono::Duration::days(1),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatOutput, ProviderError};
    use async_trait::async_trait;

    /// Stub gateway with a fixed density score and canned statements.
    struct StubGateway {
        density: f64,
        statements: serde_json::Value,
    }

    #[async_trait]
    impl ProviderGateway for StubGateway {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0f32; 8];
                    v[t.len() % 8] = 1.0;
                    v
                })
                .collect())
        }

        async fn chat(
            &self,
            system: &str,
            _messages: &[ChatMessage],
            _schema: Option<&serde_json::Value>,
        ) -> Result<ChatOutput, ProviderError> {
            if system.contains("rate conversation windows") {
                Ok(ChatOutput::Structured(json!({"score": self.density})))
            } else {
                Ok(ChatOutput::Structured(self.statements.clone()))
            }
        }

        fn embedding_dim(&self) -> usize {
            8
        }
    }

    fn turns() -> Vec<DialogueTurn> {
        vec![DialogueTurn {
            speaker: "Alice".into(),
            content: "Bob, let's meet at Starbucks tomorrow at 2pm".into(),
            timestamp: "2025-11-15T14:30:00Z".parse().unwrap(),
        }]
    }

    fn anchor() -> DateTime<Utc> {
        "2025-11-15T14:30:00Z".parse().unwrap()
    }

    #[tokio::test]
    async fn sparse_window_yields_nothing() {
        let gateway = StubGateway {
            density: 0.1,
            statements: json!({"statements": []}),
        };
        let units = compress_window(&gateway, &turns(), anchor(), 0.3, None, &[])
            .await
            .unwrap();
        assert!(units.is_empty());
    }

    #[tokio::test]
    async fn dense_window_produces_units() {
        let gateway = StubGateway {
            density: 0.9,
            statements: json!({"statements": [{
                "text": "Alice and Bob will meet at Starbucks on 2025-11-16 at 14:00 UTC",
                "timestamp_utc": "2025-11-15T14:30:00Z",
                "entities": ["Starbucks"],
                "persons": ["Alice", "Bob"]
            }]}),
        };
        let units = compress_window(&gateway, &turns(), anchor(), 0.3, Some("sess-1"), &[1, 2])
            .await
            .unwrap();

        assert_eq!(units.len(), 1);
        let unit = &units[0];
        assert!(unit.text.contains("Starbucks"));
        assert_eq!(unit.kind, UnitKind::Atomic);
        assert_eq!(unit.metadata.persons, vec!["Alice", "Bob"]);
        assert_eq!(unit.metadata.source_session_id.as_deref(), Some("sess-1"));
        assert_eq!(unit.metadata.source_event_ids, vec![1, 2]);
        assert_eq!(unit.embedding.len(), 8);
        assert!(unit.tokens.contains(&"starbucks".to_string()));
    }

    #[tokio::test]
    async fn non_atomic_statements_are_dropped() {
        let gateway = StubGateway {
            density: 0.9,
            statements: json!({"statements": [
                {"text": "She will bring the report tomorrow", "timestamp_utc": "2025-11-15T14:30:00Z"},
                {"text": "Alice confirmed the venue is Starbucks", "timestamp_utc": "2025-11-15T14:30:00Z"}
            ]}),
        };
        let units = compress_window(&gateway, &turns(), anchor(), 0.3, None, &[])
            .await
            .unwrap();

        assert_eq!(units.len(), 1);
        assert!(units[0].text.starts_with("Alice"));
    }

    #[tokio::test]
    async fn implausible_timestamp_falls_back_to_anchor() {
        let gateway = StubGateway {
            density: 0.9,
            statements: json!({"statements": [{
                "text": "Alice booked the venue",
                "timestamp_utc": "not-a-date"
            }]}),
        };
        let units = compress_window(&gateway, &turns(), anchor(), 0.3, None, &[])
            .await
            .unwrap();
        assert_eq!(units[0].metadata.timestamp_utc, anchor().to_rfc3339());
    }

    #[tokio::test]
    async fn provider_failure_aborts_window() {
        struct FailingGateway;

        #[async_trait]
        impl ProviderGateway for FailingGateway {
            async fn embed(&self, _: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
                Err(ProviderError::transient("down"))
            }
            async fn chat(
                &self,
                _: &str,
                _: &[ChatMessage],
                _: Option<&serde_json::Value>,
            ) -> Result<ChatOutput, ProviderError> {
                Err(ProviderError::transient("down"))
            }
            fn embedding_dim(&self) -> usize {
                8
            }
        }

        let result = compress_window(&FailingGateway, &turns(), anchor(), 0.3, None, &[]).await;
        assert!(matches!(result, Err(ServiceError::Provider { .. })));
    }

    #[test]
    fn violation_checks() {
        assert_eq!(
            self_containment_violation("She will arrive at noon"),
            Some("unresolved pronoun")
        );
        assert_eq!(
            self_containment_violation("Alice arrives next week"),
            Some("relative time phrase")
        );
        assert_eq!(
            self_containment_violation("Alice said this three days ago"),
            Some("relative time phrase")
        );
        assert!(self_containment_violation(
            "Alice and Bob will meet at Starbucks on 2025-11-16 at 14:00 UTC"
        )
        .is_none());
        // "It" as part of a word must not trigger
        assert!(self_containment_violation("The item ships on 2025-12-01").is_none());
    }
}
