//! Answer composition: grounded text over the retrieved unit set.
//!
//! The gateway is constrained to cite only the provided units; cited ids
//! that don't belong to the retrieved set are dropped. An empty retrieval
//! short-circuits to a fixed "no information" response without a gateway
//! call — never fabricated content.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{ServiceError, ServiceResult};
use crate::memory::retriever::RetrievedUnit;
use crate::provider::{ChatMessage, ProviderGateway};

const ANSWER_SYSTEM: &str = "You answer questions strictly from the provided memory units. \
Cite the unit ids your answer rests on. If the units do not contain the answer, say you \
have no stored information about it and cite nothing. Never invent facts. \
Respond with JSON: {\"answer\": \"...\", \"cited_unit_ids\": [<id>, ...]}";

/// Returned to the caller of `memory_query`.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer_text: String,
    pub cited_unit_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct AnswerResponse {
    answer: String,
    #[serde(default)]
    cited_unit_ids: Vec<i64>,
}

/// Compose an answer to `query` from the retrieved units.
pub async fn compose_answer(
    gateway: &dyn ProviderGateway,
    query: &str,
    retrieved: &[RetrievedUnit],
) -> ServiceResult<Answer> {
    if retrieved.is_empty() {
        return Ok(Answer {
            answer_text: "I have no stored information about that.".into(),
            cited_unit_ids: Vec::new(),
        });
    }

    let unit_block = retrieved
        .iter()
        .map(|r| {
            format!(
                "[{}] ({}) {}",
                r.unit.id, r.unit.metadata.timestamp_utc, r.unit.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let prompt = format!("Memory units:\n{unit_block}\n\nQuestion: {query}");

    let schema = json!({"type": "object", "required": ["answer"]});
    let output = gateway
        .chat(ANSWER_SYSTEM, &[ChatMessage::user(prompt)], Some(&schema))
        .await?;
    let parsed: AnswerResponse = serde_json::from_value(output.into_structured()?)
        .map_err(|e| ServiceError::InvalidArgument(format!("bad answer payload: {e}")))?;

    // Citations must come from the retrieved set.
    let valid: std::collections::HashSet<i64> = retrieved.iter().map(|r| r.unit.id).collect();
    let cited_unit_ids = parsed
        .cited_unit_ids
        .into_iter()
        .filter(|id| valid.contains(id))
        .collect();

    Ok(Answer {
        answer_text: parsed.answer,
        cited_unit_ids,
    })
}
