//! Auxiliary pre-built tool-descriptor path: lets a carrier input variable
//! register already-shaped provider tool entries (e.g. remote MCP servers)
//! without going through the data-action registry's schema-fetch flow.
//!
//! Grounded on `original_source/mcp_tools.py::load_mcp_tool_context`, carried
//! over near-verbatim since it's a small, self-contained parse/validate step.

use serde_json::Value;
use tracing::{info, warn};

/// Parsed remote tool descriptors plus the instructions block to fold into
/// the system prompt's external-tools section.
#[derive(Debug, Clone)]
pub struct RemoteToolContext {
    pub tools: Vec<Value>,
    pub instructions: String,
}

const PREVIEW_LEN: usize = 200;

/// Parse a JSON array of already-shaped tool entries from a carrier input
/// variable. Returns `None` if the variable is blank, not valid JSON, not an
/// array, or contains no usable entries; individual malformed entries are
/// skipped with a warning rather than failing the whole batch.
pub fn load_remote_tool_context(raw: Option<&str>) -> Option<RemoteToolContext> {
    let blob = raw?.trim();
    if blob.is_empty() {
        return None;
    }

    let parsed: Value = match serde_json::from_str(blob) {
        Ok(v) => v,
        Err(e) => {
            let preview = preview(blob);
            warn!(error = %e, preview, "failed to parse remote tool descriptor JSON");
            return None;
        }
    };

    let Value::Array(entries) = parsed else {
        warn!(kind = value_kind(&parsed), "remote tool descriptor configuration must be a JSON array");
        return None;
    };

    let mut tools = Vec::new();
    let mut summaries = Vec::new();

    for (idx, entry) in entries.into_iter().enumerate() {
        let Value::Object(ref obj) = entry else {
            warn!(idx, "ignoring remote tool entry: not an object");
            continue;
        };

        let Some(tool_type) = obj.get("type").and_then(Value::as_str) else {
            warn!(idx, "ignoring remote tool entry: missing type");
            continue;
        };

        if tool_type == "mcp" {
            let has_connection = obj.contains_key("server_url") || obj.contains_key("url") || obj.contains_key("server");
            if !has_connection {
                warn!(idx, "skipping mcp tool entry: missing server_url/url/server");
                continue;
            }
        }

        summaries.push(summarize(&entry));
        tools.push(entry);
    }

    if tools.is_empty() {
        warn!("no valid remote tool descriptor entries found");
        return None;
    }

    let mut lines = vec![
        "Remote Model Context Protocol (MCP) integrations are enabled for this conversation.".to_string(),
        "When you need information or actions from these external systems, call the appropriate tool instead of guessing.".to_string(),
    ];
    if !summaries.is_empty() {
        lines.push("Registered endpoints:".to_string());
        lines.extend(summaries);
    }

    info!(count = tools.len(), "loaded remote tool descriptors");
    Some(RemoteToolContext { tools, instructions: lines.join("\n") })
}

fn summarize(entry: &Value) -> String {
    let tool_type = entry.get("type").and_then(Value::as_str).unwrap_or("mcp");
    if tool_type == "mcp" {
        let label = entry
            .get("server_label")
            .or_else(|| entry.get("server_name"))
            .or_else(|| entry.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("mcp_server");
        let url = entry
            .get("server_url")
            .or_else(|| entry.get("url"))
            .or_else(|| entry.get("server").and_then(|s| s.get("url")))
            .and_then(Value::as_str)
            .unwrap_or("custom transport");
        format!("- {label} (remote MCP server at {url})")
    } else {
        let name = entry.get("name").and_then(Value::as_str).unwrap_or(tool_type);
        format!("- {name} (built-in tool: {tool_type})")
    }
}

fn preview(blob: &str) -> String {
    if blob.len() > PREVIEW_LEN {
        format!("{}...", &blob[..PREVIEW_LEN])
    } else {
        blob.to_string()
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blank_input_yields_none() {
        assert!(load_remote_tool_context(None).is_none());
        assert!(load_remote_tool_context(Some("  ")).is_none());
    }

    #[test]
    fn malformed_json_yields_none() {
        assert!(load_remote_tool_context(Some("not json")).is_none());
    }

    #[test]
    fn non_array_yields_none() {
        assert!(load_remote_tool_context(Some("{}")).is_none());
    }

    #[test]
    fn mcp_entry_without_connection_info_is_skipped() {
        let raw = json!([{ "type": "mcp", "server_label": "orders" }]).to_string();
        assert!(load_remote_tool_context(Some(&raw)).is_none());
    }

    #[test]
    fn valid_mcp_entry_produces_context_with_instructions() {
        let raw = json!([
            { "type": "mcp", "server_label": "orders", "server_url": "https://mcp.example.com/orders" }
        ])
        .to_string();
        let ctx = load_remote_tool_context(Some(&raw)).unwrap();
        assert_eq!(ctx.tools.len(), 1);
        assert!(ctx.instructions.contains("orders"));
        assert!(ctx.instructions.contains("https://mcp.example.com/orders"));
    }

    #[test]
    fn entry_missing_type_is_skipped_and_others_still_load() {
        let raw = json!([
            { "server_url": "https://x" },
            { "type": "mcp", "server_url": "https://mcp.example.com/a" }
        ])
        .to_string();
        let ctx = load_remote_tool_context(Some(&raw)).unwrap();
        assert_eq!(ctx.tools.len(), 1);
    }
}
