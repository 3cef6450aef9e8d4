//! External data-action registry: schema fetch/cache/normalization, an
//! OAuth2 client-credentials token cache, redaction of sensitive response
//! fields, and allowlist/cap enforcement.
//!
//! Grounded on `original_source/genesys_actions.py`, generalized away from
//! that file's single named vendor: `GenesysOAuthClient` becomes
//! [`TokenCache`], `GenesysActionsClient` becomes [`DataActionClient`], and
//! `_normalize_parameters_schema`/`_redact_payload` are ported near-verbatim
//! since they're pure data transforms independent of any one vendor's API
//! shape.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

use super::{ToolCall, ToolDefinition};
use crate::error::ToolError;

const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);
const SCHEMA_CACHE_TTL: Duration = Duration::from_secs(300);

/// One externally registered action: its id, the endpoint used to invoke it,
/// and the already-normalized schema advertised to the model.
#[derive(Debug, Clone)]
pub struct DataAction {
    pub id: String,
    pub invoke_url: String,
    pub definition: ToolDefinition,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Caches an OAuth2 client-credentials token, refreshing it shortly before
/// expiry rather than on every call.
pub struct TokenCache {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new(http: reqwest::Client, token_url: String, client_id: String, client_secret: String) -> Self {
        Self {
            http,
            token_url,
            client_id,
            client_secret,
            cached: Mutex::new(None),
        }
    }

    pub async fn get_token(&self) -> Result<String, ToolError> {
        if let Some(token) = self.cached.lock().clone() {
            if token.expires_at > Instant::now() {
                return Ok(token.access_token);
            }
        }
        self.fetch_token().await
    }

    async fn fetch_token(&self) -> Result<String, ToolError> {
        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| ToolError::ActionRequest(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(ToolError::CredentialsRejected);
        }
        if !response.status().is_success() {
            return Err(ToolError::ActionRequest(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ToolError::ActionRequest(e.to_string()))?;

        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::ActionRequest("token response missing access_token".into()))?
            .to_string();
        let expires_in = body.get("expires_in").and_then(Value::as_u64).unwrap_or(3600);
        let ttl = Duration::from_secs(expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);

        let token = CachedToken {
            access_token: access_token.clone(),
            expires_at: Instant::now() + ttl,
        };
        *self.cached.lock() = Some(token);
        Ok(access_token)
    }
}

struct CachedSchema {
    value: Value,
    fetched_at: Instant,
}

/// Fetches, normalizes, and invokes externally registered data actions.
pub struct DataActionClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenCache>,
    schema_cache: Mutex<HashMap<String, CachedSchema>>,
    redact_fields: Vec<String>,
}

impl DataActionClient {
    pub fn new(http: reqwest::Client, base_url: String, tokens: Arc<TokenCache>, redact_fields: Vec<String>) -> Self {
        Self {
            http,
            base_url,
            tokens,
            schema_cache: Mutex::new(HashMap::new()),
            redact_fields,
        }
    }

    /// Fetch (or reuse) the input schema for an action and normalize it to the
    /// strict function-call shape the model provider requires.
    pub async fn get_input_schema(&self, action_id: &str) -> Result<Value, ToolError> {
        if let Some(cached) = self.schema_cache.lock().get(action_id) {
            if cached.fetched_at.elapsed() < SCHEMA_CACHE_TTL {
                return Ok(cached.value.clone());
            }
        }

        let token = self.tokens.get_token().await?;
        let url = format!("{}/api/v2/actions/{action_id}/schemas/input", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ToolError::ActionRequest(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ToolError::ActionRequest(format!(
                "schema fetch for {action_id} returned {}",
                response.status()
            )));
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| ToolError::ActionRequest(e.to_string()))?;
        let normalized = normalize_parameters_schema(raw);

        self.schema_cache.lock().insert(
            action_id.to_string(),
            CachedSchema { value: normalized.clone(), fetched_at: Instant::now() },
        );
        Ok(normalized)
    }

    /// Invoke an action with already-validated arguments, redacting
    /// sensitive fields from the response before it's handed back to the
    /// model as a tool result.
    pub async fn execute(&self, action_id: &str, call: &ToolCall) -> Result<Value, ToolError> {
        let token = self.tokens.get_token().await?;
        let url = format!("{}/api/v2/actions/{action_id}/execute", self.base_url);

        const MAX_RETRIES: u32 = 3;
        let mut attempt = 0u32;
        loop {
            let response = self
                .http
                .post(&url)
                .bearer_auth(&token)
                .json(&call.arguments)
                .send()
                .await
                .map_err(|e| ToolError::ActionRequest(e.to_string()))?;

            let status = response.status();
            if status.is_success() {
                let body: Value = response
                    .json()
                    .await
                    .map_err(|e| ToolError::ActionRequest(e.to_string()))?;
                return Ok(redact_payload(body, &self.redact_fields));
            }

            let retryable = status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            if !retryable || attempt >= MAX_RETRIES {
                return Err(ToolError::ActionRequest(format!(
                    "action {action_id} returned {status}"
                )));
            }
            attempt += 1;
            let backoff = Duration::from_secs(2u64.pow(attempt));
            warn!(action_id, attempt, ?backoff, %status, "retrying data action after transient failure");
            tokio::time::sleep(backoff).await;
        }
    }
}

/// Turn an arbitrary action id into a valid function-call name: lowercase
/// alphanumerics, collapsed underscores, `a_`-prefixed if it would otherwise
/// start with a digit, capped at 60 characters. Mirrors
/// `genesys_actions.py::_sanitize_function_name`.
pub fn sanitize_function_name(action_id: &str) -> String {
    let mut sanitized: String = action_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    while sanitized.contains("__") {
        sanitized = sanitized.replace("__", "_");
    }
    let sanitized = sanitized.trim_matches('_').to_string();
    let sanitized = if sanitized.is_empty() { "action".to_string() } else { sanitized };
    let sanitized = if sanitized.chars().next().map(|c| c.is_alphabetic()).unwrap_or(false) {
        sanitized
    } else {
        format!("a_{sanitized}")
    };
    sanitized.chars().take(60).collect()
}

/// Build a tool description from the action's input schema when the carrier
/// didn't supply a custom one via `DATA_ACTION_DESCRIPTIONS`.
pub fn build_tool_description(action_id: &str, schema: &Value, custom: Option<&str>) -> String {
    if let Some(custom) = custom {
        return custom.to_string();
    }
    let properties = schema.get("properties").and_then(Value::as_object);
    let Some(properties) = properties.filter(|p| !p.is_empty()) else {
        return format!("Executes the external data action {action_id}.");
    };
    let parts: Vec<String> = properties
        .iter()
        .map(|(key, prop)| match prop.get("description").and_then(Value::as_str) {
            Some(desc) => format!("{key}: {desc}"),
            None => key.clone(),
        })
        .collect();
    format!("Executes the external data action {action_id}. Input fields: {}", parts.join("; "))
}

/// Fetch schemas and build [`DataAction`]s for a session's resolved action
/// ids, assigning each a unique sanitized tool name. Actions whose schema
/// fetch fails are skipped with a warning rather than failing the session.
pub async fn prepare_session_actions(
    client: &DataActionClient,
    action_ids: &[String],
    descriptions: &HashMap<String, String>,
) -> Vec<DataAction> {
    let mut actions = Vec::new();
    let mut used_names = std::collections::HashSet::new();

    for action_id in action_ids {
        let schema = match client.get_input_schema(action_id).await {
            Ok(s) => s,
            Err(e) => {
                warn!(action_id, error = %e, "failed to fetch data action schema, skipping");
                continue;
            }
        };

        let base_name = format!("genesys_data_action_{}", sanitize_function_name(action_id));
        let mut name = base_name.clone();
        let mut suffix = 2;
        while used_names.contains(&name) {
            name = format!("{base_name}_{suffix}");
            suffix += 1;
        }
        used_names.insert(name.clone());

        let description = build_tool_description(action_id, &schema, descriptions.get(action_id).map(String::as_str));
        let invoke_url = format!("{}/api/v2/actions/{action_id}/execute", client.base_url);

        actions.push(DataAction {
            id: action_id.clone(),
            invoke_url,
            definition: ToolDefinition { name, description, parameters: schema },
        });
    }

    actions
}

/// Parse a comma/pipe/semicolon/newline-delimited list of action ids from a
/// carrier input variable, as the source integration's `_parse_action_ids`
/// does, filtered against the configured allowlist and truncated to the
/// per-session cap.
pub fn resolve_action_ids(raw: &str, allowlist: Option<&[String]>, max_actions: u32) -> Vec<String> {
    let ids: Vec<String> = raw
        .split(|c| c == ',' || c == '|' || c == ';' || c == '\n')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let filtered: Vec<String> = match allowlist {
        Some(allowed) => ids.into_iter().filter(|id| allowed.contains(id)).collect(),
        None => ids,
    };

    filtered.into_iter().take(max_actions as usize).collect()
}

/// Force a fetched schema into the strict shape the model provider requires:
/// `type: object`, `additionalProperties: false`, every property required,
/// recursively for nested objects and arrays-of-objects.
fn normalize_parameters_schema(mut schema: Value) -> Value {
    if let Some(obj) = schema.as_object_mut() {
        obj.remove("title");
        obj.remove("$schema");
        obj.insert("type".to_string(), Value::String("object".to_string()));
        obj.insert("additionalProperties".to_string(), Value::Bool(false));

        let property_names: Vec<String> = obj
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default();
        obj.insert(
            "required".to_string(),
            Value::Array(property_names.into_iter().map(Value::String).collect()),
        );

        if let Some(properties) = obj.get_mut("properties").and_then(Value::as_object_mut) {
            for value in properties.values_mut() {
                normalize_nested(value);
            }
        }
    }
    schema
}

fn normalize_nested(value: &mut Value) {
    let Some(obj) = value.as_object_mut() else { return };
    match obj.get("type").and_then(Value::as_str) {
        Some("object") => {
            obj.insert("additionalProperties".to_string(), Value::Bool(false));
            let property_names: Vec<String> = obj
                .get("properties")
                .and_then(Value::as_object)
                .map(|props| props.keys().cloned().collect())
                .unwrap_or_default();
            obj.insert(
                "required".to_string(),
                Value::Array(property_names.into_iter().map(Value::String).collect()),
            );
            if let Some(properties) = obj.get_mut("properties").and_then(Value::as_object_mut) {
                for nested in properties.values_mut() {
                    normalize_nested(nested);
                }
            }
        }
        Some("array") => {
            if let Some(items) = obj.get_mut("items") {
                normalize_nested(items);
            }
        }
        _ => {}
    }
}

/// Replace configured sensitive fields (dot-path, e.g. `"customer.ssn"`) with
/// a redaction marker before the payload is returned to the model.
fn redact_payload(mut payload: Value, fields: &[String]) -> Value {
    for path in fields {
        redact_path(&mut payload, path);
    }
    payload
}

fn redact_path(value: &mut Value, path: &str) {
    let mut segments = path.splitn(2, '.');
    let Some(head) = segments.next() else { return };
    let rest = segments.next();

    if let Some(obj) = value.as_object_mut() {
        match rest {
            Some(rest_path) => {
                if let Some(child) = obj.get_mut(head) {
                    redact_path(child, rest_path);
                }
            }
            None => {
                if obj.contains_key(head) {
                    obj.insert(head.to_string(), Value::String("[REDACTED]".to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_action_ids_filters_allowlist_and_caps() {
        let allowlist = vec!["a".to_string(), "b".to_string()];
        let ids = resolve_action_ids("a, b; c|d\ne", Some(&allowlist), 1);
        assert_eq!(ids, vec!["a".to_string()]);
    }

    #[test]
    fn resolve_action_ids_without_allowlist_keeps_all_up_to_cap() {
        let ids = resolve_action_ids("a,b,c", None, 2);
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn normalize_forces_strict_object_shape() {
        let raw = json!({
            "title": "Lookup",
            "$schema": "http://json-schema.org/draft-07/schema#",
            "properties": {
                "order_id": { "type": "string" },
                "address": {
                    "type": "object",
                    "properties": { "zip": { "type": "string" } }
                }
            }
        });
        let normalized = normalize_parameters_schema(raw);
        assert_eq!(normalized["type"], "object");
        assert_eq!(normalized["additionalProperties"], false);
        assert!(normalized.get("title").is_none());
        let required = normalized["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v == "order_id"));
        assert_eq!(normalized["properties"]["address"]["additionalProperties"], false);
    }

    #[test]
    fn redact_payload_masks_nested_field() {
        let payload = json!({ "customer": { "name": "Jane", "ssn": "123-45-6789" } });
        let redacted = redact_payload(payload, &["customer.ssn".to_string()]);
        assert_eq!(redacted["customer"]["ssn"], "[REDACTED]");
        assert_eq!(redacted["customer"]["name"], "Jane");
    }
}
