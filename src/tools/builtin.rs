//! The two always-registered call-control tools.
//!
//! Schemas and dispatch are grounded on the `tools` array built in
//! `original_source/openai_client.py::connect` and the disconnect-context
//! handling in `_handle_function_call`. Canonical names are
//! `end_conversation_successfully` and `escalate_to_human`; `end_call` and
//! `handoff_to_human` are accepted as wire-compatible aliases since carrier
//! configurations authored against the source integration already reference
//! those names.

use serde_json::{json, Value};

use super::{DisconnectReason, ToolCall, ToolDefinition, ToolOutcome};
use crate::error::ToolError;

pub const END_CONVERSATION: &str = "end_conversation_successfully";
pub const ESCALATE_TO_HUMAN: &str = "escalate_to_human";

fn canonical_name(name: &str) -> Option<&'static str> {
    match name {
        "end_conversation_successfully" | "end_call" => Some(END_CONVERSATION),
        "escalate_to_human" | "handoff_to_human" => Some(ESCALATE_TO_HUMAN),
        _ => None,
    }
}

pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: END_CONVERSATION.to_string(),
            description: "End the call because the user's needs have been fully addressed."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "reason": { "type": "string", "description": "Short reason the call is ending." },
                    "note": { "type": "string", "description": "Optional free-form note for the summary." }
                },
                "required": ["reason"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: ESCALATE_TO_HUMAN.to_string(),
            description: "Transfer the call to a human agent.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "reason": { "type": "string", "description": "Why a human is needed." },
                    "department": { "type": "string", "description": "Target department, if known." }
                },
                "required": ["reason"],
                "additionalProperties": false
            }),
        },
    ]
}

/// Handle a call-control tool call. Returns `Ok(None)` if `call.name` isn't
/// one of the built-ins (so the caller can fall through to the data-action
/// registry), `Ok(Some(outcome))` on a match, or `Err` if the call is
/// recognized but malformed.
pub fn dispatch(call: &ToolCall) -> Result<Option<ToolOutcome>, ToolError> {
    let Some(canonical) = canonical_name(&call.name) else {
        return Ok(None);
    };

    let reason_text = call
        .arguments
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or("not specified")
        .to_string();

    // `action` uses the source integration's wire vocabulary ("end_call",
    // "handoff_to_human") rather than the tool names themselves, so
    // downstream consumers built against the original integration's
    // transcripts keep working.
    let outcome = match canonical {
        END_CONVERSATION => ToolOutcome::Disconnect {
            result: json!({ "result": "ok", "action": "end_call", "reason": "completed" }),
            reason: DisconnectReason::Completed,
        },
        ESCALATE_TO_HUMAN => {
            let department = call.arguments.get("department").and_then(Value::as_str);
            ToolOutcome::Disconnect {
                result: json!({
                    "result": "ok",
                    "action": "handoff_to_human",
                    "reason": "transfer",
                    "department": department,
                    "note": reason_text,
                }),
                reason: DisconnectReason::Transfer,
            }
        }
        _ => unreachable!("canonical_name only returns the two names matched above"),
    };

    Ok(Some(outcome))
}

/// Build the farewell-turn instruction sent immediately after the tool
/// result, before the connection is torn down. Mirrors the second
/// `response.create` the source integration issues with
/// `metadata.type = "final_farewell"`.
pub fn farewell_instructions(reason: DisconnectReason) -> &'static str {
    match reason {
        DisconnectReason::Completed => {
            "The call is ending. Give a brief, warm farewell in one or two sentences, then stop."
        }
        DisconnectReason::Transfer => {
            "The call is being transferred to a human agent. Briefly let the user know help is \
             on the way, then stop."
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recognizes_canonical_and_alias_names() {
        assert_eq!(canonical_name("end_conversation_successfully"), Some(END_CONVERSATION));
        assert_eq!(canonical_name("end_call"), Some(END_CONVERSATION));
        assert_eq!(canonical_name("escalate_to_human"), Some(ESCALATE_TO_HUMAN));
        assert_eq!(canonical_name("handoff_to_human"), Some(ESCALATE_TO_HUMAN));
        assert_eq!(canonical_name("something_else"), None);
    }

    #[test]
    fn unrecognized_tool_falls_through() {
        let call = ToolCall {
            name: "lookup_order".into(),
            call_id: "c1".into(),
            arguments: json!({}),
        };
        assert!(dispatch(&call).unwrap().is_none());
    }

    #[test]
    fn end_call_alias_produces_completed_disconnect() {
        let call = ToolCall {
            name: "end_call".into(),
            call_id: "c1".into(),
            arguments: json!({ "reason": "issue resolved" }),
        };
        match dispatch(&call).unwrap().unwrap() {
            ToolOutcome::Disconnect { reason, .. } => assert_eq!(reason, DisconnectReason::Completed),
            _ => panic!("expected Disconnect"),
        }
    }

    #[test]
    fn handoff_alias_produces_transfer_disconnect_with_department() {
        let call = ToolCall {
            name: "handoff_to_human".into(),
            call_id: "c1".into(),
            arguments: json!({ "reason": "needs billing", "department": "billing" }),
        };
        match dispatch(&call).unwrap().unwrap() {
            ToolOutcome::Disconnect { reason, result } => {
                assert_eq!(reason, DisconnectReason::Transfer);
                assert_eq!(result["department"], "billing");
            }
            _ => panic!("expected Disconnect"),
        }
    }
}
