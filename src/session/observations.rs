//! Observation extraction: events → categorized observations at session stop.
//!
//! Events are first segmented into topical runs — a new run starts on a time
//! gap or when an event shares no vocabulary with the run so far — then each
//! run is handed to the gateway for categorized observations carrying
//! back-references to the events that supplied the evidence.

use serde::Deserialize;
use serde_json::json;

use crate::error::{ServiceError, ServiceResult};
use crate::memory::tokenize;
use crate::provider::{ChatMessage, ProviderGateway};
use crate::session::types::{Event, Observation, ObservationCategory};

const EXTRACT_SYSTEM: &str = "You extract durable observations from a run of agent-session \
events. Categories: \"decision\" (a choice that was made), \"discovery\" (something found \
out about the system or codebase), \"learning\" (a general lesson or preference), \
\"other\". Each observation must reference the event ids that evidence it. Skip noise. \
Respond with JSON: {\"observations\": [{\"category\": \"...\", \"text\": \"...\", \
\"evidence_event_ids\": [<id>, ...]}]}";

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    observations: Vec<RawObservation>,
}

#[derive(Debug, Deserialize)]
struct RawObservation {
    category: Option<String>,
    text: String,
    #[serde(default)]
    evidence_event_ids: Vec<i64>,
}

/// Extract observations from a stopped session's full event log.
pub async fn extract_observations(
    gateway: &dyn ProviderGateway,
    session_id: &str,
    events: &[Event],
    segment_gap_secs: i64,
) -> ServiceResult<Vec<Observation>> {
    let mut observations = Vec::new();

    for run in segment_events(events, segment_gap_secs) {
        let extracted = extract_from_run(gateway, session_id, run).await?;
        observations.extend(extracted);
    }

    Ok(observations)
}

/// Split events into topical runs by time gap and vocabulary overlap.
pub fn segment_events(events: &[Event], gap_secs: i64) -> Vec<&[Event]> {
    if events.is_empty() {
        return Vec::new();
    }

    let mut runs: Vec<&[Event]> = Vec::new();
    let mut run_start = 0;
    let mut run_tokens: std::collections::HashSet<String> =
        tokenize(&events[0].payload).into_iter().collect();

    for i in 1..events.len() {
        let gap = seconds_between(&events[i - 1].timestamp, &events[i].timestamp);
        let event_tokens: std::collections::HashSet<String> =
            tokenize(&events[i].payload).into_iter().collect();
        let disjoint = !run_tokens.is_empty()
            && !event_tokens.is_empty()
            && run_tokens.is_disjoint(&event_tokens);

        // A hard gap always splits; a topic change splits on a smaller gap.
        if gap > gap_secs || (disjoint && gap > gap_secs / 5) {
            runs.push(&events[run_start..i]);
            run_start = i;
            run_tokens = event_tokens;
        } else {
            run_tokens.extend(event_tokens);
        }
    }
    runs.push(&events[run_start..]);
    runs
}

async fn extract_from_run(
    gateway: &dyn ProviderGateway,
    session_id: &str,
    run: &[Event],
) -> ServiceResult<Vec<Observation>> {
    let event_block = run
        .iter()
        .map(|e| {
            format!(
                "[{}] ({} @ {}) {}",
                e.event_id,
                e.kind.as_str(),
                e.timestamp,
                e.payload
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let schema = json!({"type": "object", "required": ["observations"]});
    let output = gateway
        .chat(EXTRACT_SYSTEM, &[ChatMessage::user(event_block)], Some(&schema))
        .await?;
    let parsed: ExtractResponse = serde_json::from_value(output.into_structured()?)
        .map_err(|e| ServiceError::InvalidArgument(format!("bad observation payload: {e}")))?;

    let run_ids: std::collections::HashSet<i64> = run.iter().map(|e| e.event_id).collect();
    let observations = parsed
        .observations
        .into_iter()
        .filter(|raw| !raw.text.is_empty())
        .map(|raw| Observation {
            observation_id: uuid::Uuid::now_v7().to_string(),
            memory_session_id: session_id.to_string(),
            category: raw
                .category
                .as_deref()
                .and_then(|c| c.parse().ok())
                .unwrap_or(ObservationCategory::Other),
            text: raw.text,
            evidence_event_ids: raw
                .evidence_event_ids
                .into_iter()
                .filter(|id| run_ids.contains(id))
                .collect(),
        })
        .collect();

    Ok(observations)
}

fn seconds_between(earlier: &str, later: &str) -> i64 {
    match (
        chrono::DateTime::parse_from_rfc3339(earlier),
        chrono::DateTime::parse_from_rfc3339(later),
    ) {
        (Ok(a), Ok(b)) => (b - a).num_seconds(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatOutput, ProviderError};
    use crate::session::types::EventKind;
    use async_trait::async_trait;

    fn event(id: i64, payload: &str, timestamp: &str) -> Event {
        Event {
            event_id: id,
            memory_session_id: "sess-1".into(),
            kind: EventKind::Message,
            payload: payload.into(),
            timestamp: timestamp.into(),
        }
    }

    #[test]
    fn segmentation_splits_on_time_gap() {
        let events = vec![
            event(1, "working on the JWT handler", "2025-11-15T10:00:00Z"),
            event(2, "JWT handler tests pass", "2025-11-15T10:01:00Z"),
            event(3, "switching to the JWT docs", "2025-11-15T11:00:00Z"),
        ];
        let runs = segment_events(&events, 300);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].len(), 2);
        assert_eq!(runs[1].len(), 1);
    }

    #[test]
    fn segmentation_splits_on_topic_change() {
        let events = vec![
            event(1, "debugging the auth flow", "2025-11-15T10:00:00Z"),
            event(2, "lunch plans ordering pizza", "2025-11-15T10:02:00Z"),
        ];
        // 120s gap < 300 but > 300/5 with zero shared vocabulary
        let runs = segment_events(&events, 300);
        assert_eq!(runs.len(), 2);
    }

    #[test]
    fn segmentation_keeps_one_run_for_contiguous_topic() {
        let events = vec![
            event(1, "refactoring the planner module", "2025-11-15T10:00:00Z"),
            event(2, "planner module refactor done", "2025-11-15T10:01:00Z"),
        ];
        let runs = segment_events(&events, 300);
        assert_eq!(runs.len(), 1);
    }

    #[test]
    fn segmentation_of_empty_events() {
        assert!(segment_events(&[], 300).is_empty());
    }

    struct StubGateway;

    #[async_trait]
    impl ProviderGateway for StubGateway {
        async fn embed(&self, _: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(Vec::new())
        }

        async fn chat(
            &self,
            _: &str,
            _: &[ChatMessage],
            _: Option<&serde_json::Value>,
        ) -> Result<ChatOutput, ProviderError> {
            Ok(ChatOutput::Structured(json!({"observations": [{
                "category": "decision",
                "text": "The team chose HS256 for token signing",
                "evidence_event_ids": [1, 99]
            }]})))
        }

        fn embedding_dim(&self) -> usize {
            8
        }
    }

    #[tokio::test]
    async fn extraction_filters_evidence_to_run() {
        let events = vec![event(1, "we will use HS256 signing", "2025-11-15T10:00:00Z")];
        let observations = extract_observations(&StubGateway, "sess-1", &events, 300)
            .await
            .unwrap();

        assert_eq!(observations.len(), 1);
        let obs = &observations[0];
        assert_eq!(obs.category, ObservationCategory::Decision);
        // Event 99 is not in the run — dropped
        assert_eq!(obs.evidence_event_ids, vec![1]);
        assert_eq!(obs.memory_session_id, "sess-1");
    }

    #[tokio::test]
    async fn unknown_category_falls_back_to_other() {
        struct WeirdGateway;

        #[async_trait]
        impl ProviderGateway for WeirdGateway {
            async fn embed(&self, _: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
                Ok(Vec::new())
            }
            async fn chat(
                &self,
                _: &str,
                _: &[ChatMessage],
                _: Option<&serde_json::Value>,
            ) -> Result<ChatOutput, ProviderError> {
                Ok(ChatOutput::Structured(json!({"observations": [{
                    "category": "epiphany",
                    "text": "something",
                    "evidence_event_ids": []
                }]})))
            }
            fn embedding_dim(&self) -> usize {
                8
            }
        }

        let events = vec![event(1, "payload", "2025-11-15T10:00:00Z")];
        let observations = extract_observations(&WeirdGateway, "s", &events, 300)
            .await
            .unwrap();
        assert_eq!(observations[0].category, ObservationCategory::Other);
    }
}
