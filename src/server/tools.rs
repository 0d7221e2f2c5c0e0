//! The MCP tool surface: catalog and dispatch into the engine.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::TenantContext;
use crate::engine::Engine;
use crate::error::{ServiceError, ServiceResult};
use crate::memory::types::DialogueTurn;
use crate::provider::ChatMessage;
use crate::server::protocol::{CallToolParams, Tool};
use crate::session::types::EventKind;

/// The tool catalog returned from `tools/list`.
pub fn list_tools() -> Vec<Tool> {
    vec![
        Tool {
            name: "memory_add".into(),
            description: Some(
                "Ingest dialogue turns into long-term memory. Turns are compressed into \
                 self-contained memory units and indexed for retrieval."
                    .into(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "messages": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "speaker": {"type": "string"},
                                "content": {"type": "string"},
                                "timestamp": {"type": "string", "format": "date-time"}
                            },
                            "required": ["speaker", "content"]
                        }
                    },
                    "session_id": {"type": "string"}
                },
                "required": ["messages"]
            }),
        },
        Tool {
            name: "memory_query".into(),
            description: Some(
                "Answer a question from stored memories using hybrid semantic, lexical, \
                 and metadata retrieval. Returns the answer with cited unit ids."
                    .into(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "history": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "role": {"type": "string"},
                                "content": {"type": "string"}
                            },
                            "required": ["role", "content"]
                        }
                    }
                },
                "required": ["query"]
            }),
        },
        Tool {
            name: "memory_delete".into(),
            description: Some("Tombstone memory units by id.".into()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "unit_ids": {"type": "array", "items": {"type": "integer"}}
                },
                "required": ["unit_ids"]
            }),
        },
        Tool {
            name: "session_start".into(),
            description: Some(
                "Start a cross-session memory session. Returns the session id and a \
                 token-budgeted context bundle from prior sessions."
                    .into(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "content_session_id": {"type": "string"},
                    "project": {"type": "string"},
                    "user_prompt": {"type": "string"}
                },
                "required": ["content_session_id", "project"]
            }),
        },
        Tool {
            name: "session_record".into(),
            description: Some(
                "Record one event (message, tool_use, file_change) into an active session. \
                 Payloads are redacted before storage."
                    .into(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "memory_session_id": {"type": "string"},
                    "kind": {"type": "string", "enum": ["message", "tool_use", "file_change"]},
                    "payload": {"type": "string"}
                },
                "required": ["memory_session_id", "kind", "payload"]
            }),
        },
        Tool {
            name: "session_stop".into(),
            description: Some(
                "Stop a session: freeze events, extract observations into memory, and \
                 produce a summary. Idempotent."
                    .into(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "memory_session_id": {"type": "string"}
                },
                "required": ["memory_session_id"]
            }),
        },
        Tool {
            name: "session_end".into(),
            description: Some("Finalize a stopped session and release its resources.".into()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "memory_session_id": {"type": "string"}
                },
                "required": ["memory_session_id"]
            }),
        },
    ]
}

#[derive(Deserialize)]
struct WireTurn {
    speaker: String,
    content: String,
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct MemoryAddArgs {
    messages: Vec<WireTurn>,
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct MemoryQueryArgs {
    query: String,
    #[serde(default)]
    history: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct MemoryDeleteArgs {
    unit_ids: Vec<i64>,
}

#[derive(Deserialize)]
struct SessionStartArgs {
    content_session_id: String,
    project: String,
    #[serde(default)]
    user_prompt: String,
}

#[derive(Deserialize)]
struct SessionRecordArgs {
    memory_session_id: String,
    kind: String,
    payload: String,
}

#[derive(Deserialize)]
struct SessionIdArgs {
    memory_session_id: String,
}

/// Route one `tools/call` to the engine. Returns the tool's JSON payload.
pub async fn dispatch(
    engine: &Engine,
    ctx: &TenantContext,
    params: CallToolParams,
) -> ServiceResult<Value> {
    // A caller-supplied user_id must match the authenticated tenant.
    if let Some(claimed) = params.arguments.get("user_id").and_then(|v| v.as_str()) {
        if claimed != ctx.user_id {
            return Err(ServiceError::TenantMismatch(format!(
                "token is not valid for user {claimed}"
            )));
        }
    }

    let args = Value::Object(params.arguments.into_iter().collect());

    match params.name.as_str() {
        "memory_add" => {
            let args: MemoryAddArgs = parse(args)?;
            let turns: Vec<DialogueTurn> = args
                .messages
                .into_iter()
                .map(|m| DialogueTurn {
                    speaker: m.speaker,
                    content: m.content,
                    timestamp: m.timestamp.unwrap_or_else(Utc::now),
                })
                .collect();
            let report = engine
                .memory_add(ctx, turns, args.session_id.as_deref(), &[])
                .await?;
            Ok(serde_json::to_value(report).unwrap_or_default())
        }
        "memory_query" => {
            let args: MemoryQueryArgs = parse(args)?;
            let result = engine.memory_query(ctx, &args.query, &args.history).await?;
            Ok(serde_json::to_value(result).unwrap_or_default())
        }
        "memory_delete" => {
            let args: MemoryDeleteArgs = parse(args)?;
            let report = engine.memory_delete(ctx, &args.unit_ids)?;
            Ok(serde_json::to_value(report).unwrap_or_default())
        }
        "session_start" => {
            let args: SessionStartArgs = parse(args)?;
            let report = engine
                .session_start(ctx, &args.content_session_id, &args.project, &args.user_prompt)
                .await?;
            Ok(serde_json::to_value(report).unwrap_or_default())
        }
        "session_record" => {
            let args: SessionRecordArgs = parse(args)?;
            let kind: EventKind = args
                .kind
                .parse()
                .map_err(ServiceError::InvalidArgument)?;
            let event_id =
                engine.session_record(ctx, &args.memory_session_id, kind, &args.payload)?;
            Ok(json!({ "event_id": event_id }))
        }
        "session_stop" => {
            let args: SessionIdArgs = parse(args)?;
            let report = engine.session_stop(ctx, &args.memory_session_id).await?;
            Ok(serde_json::to_value(report).unwrap_or_default())
        }
        "session_end" => {
            let args: SessionIdArgs = parse(args)?;
            engine.session_end(ctx, &args.memory_session_id)?;
            Ok(json!({ "ended": true }))
        }
        other => Err(ServiceError::InvalidArgument(format!(
            "unknown tool: {other}"
        ))),
    }
}

fn parse<T: serde::de::DeserializeOwned>(args: Value) -> ServiceResult<T> {
    serde_json::from_value(args)
        .map_err(|e| ServiceError::InvalidArgument(format!("malformed tool arguments: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lists_all_seven_tools() {
        let tools = list_tools();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "memory_add",
                "memory_query",
                "memory_delete",
                "session_start",
                "session_record",
                "session_stop",
                "session_end"
            ]
        );
        for tool in &tools {
            assert!(tool.input_schema.get("type").is_some());
            assert!(tool.description.is_some());
        }
    }
}
