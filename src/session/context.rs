//! Context injection: the budgeted bundle returned at session start.
//!
//! The bundle opens with a compact summary of the most recent stopped
//! session (truncated when it alone would bust the budget), then greedily
//! takes retrieved units in rank order while the cumulative token estimate
//! stays within budget. Units are taken whole or not at all — never split
//! mid-sentence.

use serde::Serialize;

use crate::memory::estimate_tokens;
use crate::memory::retriever::RetrievedUnit;

/// The assembled context returned from `session_start`.
#[derive(Debug, Clone, Serialize)]
pub struct ContextBundle {
    /// Rendered context text, ready for prompt injection.
    pub text: String,
    /// Units included in the bundle, in rank order.
    pub cited_unit_ids: Vec<i64>,
    /// Estimated token footprint; always ≤ the configured budget.
    pub token_estimate: usize,
}

impl ContextBundle {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Assemble a bundle from a prior-session summary and ranked units under a
/// token budget.
pub fn build_bundle(
    previous_summary: Option<&str>,
    retrieved: &[RetrievedUnit],
    token_budget: usize,
) -> ContextBundle {
    let mut sections: Vec<String> = Vec::new();
    let mut used_tokens = 0usize;

    if let Some(summary) = previous_summary.filter(|s| !s.is_empty()) {
        // The summary always leads; truncate it rather than dropping it.
        let header = "## Previous session\n";
        let header_tokens = estimate_tokens(header);
        let available = token_budget.saturating_sub(header_tokens);
        let summary_block = truncate_to_tokens(summary, available);
        if !summary_block.is_empty() {
            used_tokens += header_tokens + estimate_tokens(&summary_block);
            sections.push(format!("{header}{summary_block}"));
        }
    }

    let mut cited_unit_ids = Vec::new();
    let mut unit_lines: Vec<String> = Vec::new();
    let memories_header = "## Relevant memories\n";
    let memories_header_tokens = estimate_tokens(memories_header);

    for result in retrieved {
        let line = format!("- ({}) {}", result.unit.metadata.timestamp_utc, result.unit.text);
        let line_tokens = estimate_tokens(&line);
        let header_cost = if unit_lines.is_empty() {
            memories_header_tokens
        } else {
            0
        };
        if used_tokens + header_cost + line_tokens > token_budget {
            // Skip units that would overflow; a later, shorter one may fit.
            continue;
        }
        used_tokens += header_cost + line_tokens;
        unit_lines.push(line);
        cited_unit_ids.push(result.unit.id);
    }

    if !unit_lines.is_empty() {
        sections.push(format!("{memories_header}{}", unit_lines.join("\n")));
    }

    ContextBundle {
        text: sections.join("\n\n"),
        cited_unit_ids,
        token_estimate: used_tokens,
    }
}

/// Truncate text to roughly `max_tokens`, cutting at a char boundary.
fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    let max_bytes = max_tokens * 4;
    if text.len() <= max_bytes {
        return text.to_string();
    }
    if max_bytes == 0 {
        return String::new();
    }
    let end = text
        .char_indices()
        .take_while(|(i, _)| *i < max_bytes.saturating_sub(1))
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    format!("{}…", &text[..end])
}
