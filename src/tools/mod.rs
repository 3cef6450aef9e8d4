//! Tool/function-call dispatch.
//!
//! Two families of tools are exposed to the model: built-in call-control
//! tools (always registered, see [`builtin`]) and externally registered data
//! actions (fetched, cached, and invoked over HTTP, see [`data_action`]).
//! Dispatch itself — matching a provider function-call event to a handler and
//! producing the `function_call_output` the provider expects back — is
//! grounded on `original_source/openai_client.py::_handle_function_call`.

pub mod builtin;
pub mod data_action;
pub mod remote_descriptors;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::Value;

use self::data_action::{DataAction, DataActionClient};
use crate::error::ToolError;

/// A tool definition advertised to the model provider in `session.update`.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// Strict-mode JSON schema for the function's parameters.
    pub parameters: Value,
}

/// A function call surfaced by the model provider, already stripped of the
/// provider's envelope (the source integration's `_handle_function_call`
/// tries `arguments`/`input`/`args`/`parameters` and a nested
/// `function.arguments` before giving up; that extraction lives in
/// `provider::mod` since it's a provider wire-format concern, not a dispatch
/// concern).
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub call_id: String,
    pub arguments: Value,
}

/// What a handler wants to happen after a tool call. Disconnect intents are
/// surfaced here rather than acted on directly, because the farewell-audio
/// sequencing and the actual WebSocket teardown belong to the session
/// controller, not to the tool layer.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    /// A plain result string; conversation continues.
    Result(Value),
    /// The call-control tools signal a disconnect here; the session
    /// controller is responsible for sequencing the farewell turn and the
    /// actual teardown afterward.
    Disconnect {
        result: Value,
        reason: DisconnectReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Completed,
    Transfer,
}

/// Local invocation policy applied before a call ever reaches a handler.
/// Mirrors the OpenAI-style `tool_choice` shapes `gemini_client.py`'s
/// `_build_tool_config` translates: a bare string (`"auto"`, `"none"`,
/// `"disabled"`) or a `{"type": "function", "function": {"name": ...}}`
/// object pinning one specific function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Specific(String),
}

impl ToolChoice {
    /// Parse a carrier-supplied `TOOL_CHOICE` input variable. Accepts the
    /// bare-string and JSON-object shapes; anything else falls back to
    /// `Auto` rather than failing the session.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return ToolChoice::Auto;
        }
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            if let Some(s) = value.as_str() {
                return Self::from_keyword(s);
            }
            if value.get("type").and_then(Value::as_str) == Some("function") {
                if let Some(name) = value.get("function").and_then(|f| f.get("name")).and_then(Value::as_str) {
                    return ToolChoice::Specific(name.to_string());
                }
            }
            return ToolChoice::Auto;
        }
        Self::from_keyword(trimmed)
    }

    fn from_keyword(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "disabled" => ToolChoice::None,
            _ => ToolChoice::Auto,
        }
    }

    fn admits(&self, call_name: &str) -> bool {
        match self {
            ToolChoice::Auto => true,
            ToolChoice::None => false,
            ToolChoice::Specific(name) => name == call_name,
        }
    }
}

impl DisconnectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::Completed => "completed",
            DisconnectReason::Transfer => "transfer",
        }
    }
}

/// Enforces the argument-size cap shared by all tool families before a
/// handler ever sees the payload.
pub fn check_argument_size(call: &ToolCall, max_bytes: usize) -> Result<(), ToolError> {
    let encoded = serde_json::to_vec(&call.arguments).unwrap_or_default();
    if encoded.len() > max_bytes {
        return Err(ToolError::ArgumentsTooLarge(max_bytes));
    }
    Ok(())
}

/// Routes a function call surfaced by the model provider to the right
/// handler: the two call-control built-ins first, then the session's
/// registered external data actions. One router is built per session from
/// the data actions the carrier's input variables resolved.
pub struct ToolRouter {
    data_actions: Vec<DataAction>,
    data_action_client: Option<Arc<DataActionClient>>,
    max_argument_bytes: usize,
    max_invocations: u32,
    invocation_count: AtomicU32,
    tool_choice: ToolChoice,
}

impl ToolRouter {
    pub fn new(
        data_actions: Vec<DataAction>,
        data_action_client: Option<Arc<DataActionClient>>,
        max_argument_bytes: usize,
        max_invocations: u32,
    ) -> Self {
        Self::with_tool_choice(data_actions, data_action_client, max_argument_bytes, max_invocations, ToolChoice::Auto)
    }

    pub fn with_tool_choice(
        data_actions: Vec<DataAction>,
        data_action_client: Option<Arc<DataActionClient>>,
        max_argument_bytes: usize,
        max_invocations: u32,
        tool_choice: ToolChoice,
    ) -> Self {
        Self {
            data_actions,
            data_action_client,
            max_argument_bytes,
            max_invocations,
            invocation_count: AtomicU32::new(0),
            tool_choice,
        }
    }

    /// Every tool definition advertised to the model provider in
    /// `session.update`: the two call-control built-ins plus this session's
    /// registered data actions.
    pub fn advertised_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = builtin::definitions();
        defs.extend(self.data_actions.iter().map(|a| a.definition.clone()));
        defs
    }

    pub async fn dispatch(&self, call: &ToolCall) -> Result<ToolOutcome, ToolError> {
        if !self.tool_choice.admits(&call.name) {
            return Err(ToolError::RejectedByPolicy);
        }

        check_argument_size(call, self.max_argument_bytes)?;

        if let Some(outcome) = builtin::dispatch(call)? {
            return Ok(outcome);
        }

        let action = self
            .data_actions
            .iter()
            .find(|a| a.definition.name == call.name)
            .ok_or_else(|| ToolError::UnknownTool(call.name.clone()))?;

        let count = self.invocation_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count > self.max_invocations {
            return Err(ToolError::InvocationCapReached(self.max_invocations));
        }

        let client = self
            .data_action_client
            .as_ref()
            .ok_or_else(|| ToolError::ActionRequest("no data action client configured".into()))?;
        let result = client.execute(&action.id, call).await?;
        Ok(ToolOutcome::Result(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn argument_size_cap_rejects_oversized_payload() {
        let call = ToolCall {
            name: "x".into(),
            call_id: "c1".into(),
            arguments: json!({ "blob": "a".repeat(100) }),
        };
        assert!(check_argument_size(&call, 16).is_err());
        assert!(check_argument_size(&call, 4096).is_ok());
    }

    #[test]
    fn tool_choice_parses_none_and_disabled_keywords() {
        assert_eq!(ToolChoice::parse("none"), ToolChoice::None);
        assert_eq!(ToolChoice::parse("\"disabled\""), ToolChoice::None);
        assert_eq!(ToolChoice::parse("DISABLED"), ToolChoice::None);
    }

    #[test]
    fn tool_choice_parses_specific_function_object() {
        let raw = json!({ "type": "function", "function": { "name": "lookup_order" } }).to_string();
        assert_eq!(ToolChoice::parse(&raw), ToolChoice::Specific("lookup_order".to_string()));
    }

    #[test]
    fn tool_choice_defaults_to_auto_on_blank_or_garbage() {
        assert_eq!(ToolChoice::parse(""), ToolChoice::Auto);
        assert_eq!(ToolChoice::parse("   "), ToolChoice::Auto);
        assert_eq!(ToolChoice::parse("not a valid choice"), ToolChoice::Auto);
    }

    #[tokio::test]
    async fn none_tool_choice_rejects_all_calls() {
        let router = ToolRouter::with_tool_choice(Vec::new(), None, 8192, 10, ToolChoice::None);
        let call = ToolCall { name: "end_conversation_successfully".into(), call_id: "c1".into(), arguments: json!({}) };
        assert!(matches!(router.dispatch(&call).await, Err(ToolError::RejectedByPolicy)));
    }

    #[tokio::test]
    async fn specific_tool_choice_only_admits_matching_name() {
        let router = ToolRouter::with_tool_choice(Vec::new(), None, 8192, 10, ToolChoice::Specific("escalate_to_human".to_string()));
        let wrong = ToolCall { name: "end_conversation_successfully".into(), call_id: "c1".into(), arguments: json!({ "reason": "x" }) };
        assert!(matches!(router.dispatch(&wrong).await, Err(ToolError::RejectedByPolicy)));

        let right = ToolCall { name: "escalate_to_human".into(), call_id: "c2".into(), arguments: json!({ "reason": "x" }) };
        assert!(router.dispatch(&right).await.is_ok());
    }
}
