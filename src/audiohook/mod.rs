//! AudioHook protocol engine: carrier JSON envelope types, inbound message
//! parsing, and outbound framing helpers.
//!
//! Grounded on `original_source/audio_hook_server.py` (exact message shapes,
//! the probe sentinel, media negotiation, `max_output_tokens` clamping) and
//! the teacher's `voice/types.rs` convention of tagged-union message enums
//! for carrier/provider wire types (here realized as a small envelope struct
//! plus a message enum, since the carrier's `parameters` shape is keyed off
//! `type` rather than a single internally-tagged JSON object).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version carried on every envelope.
pub const PROTOCOL_VERSION: &str = "2";

/// The all-zeros sentinel that marks a probe connection.
const ZERO_UUID: &str = "00000000-0000-0000-0000-000000000000";

/// Raw inbound envelope as received on the wire, before type-specific
/// parameter extraction.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    #[allow(dead_code)]
    pub version: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub parameters: Value,
}

/// One offered/negotiated media format descriptor.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct MediaFormat {
    pub format: String,
    pub rate: u32,
}

/// `open` parameters, already picked apart into the fields the session cares
/// about.
#[derive(Debug, Clone)]
pub struct OpenParams {
    pub conversation_id: String,
    pub participant_id: String,
    pub media: Vec<MediaFormat>,
    pub input_variables: HashMap<String, String>,
}

/// `error` parameters.
#[derive(Debug, Clone)]
pub struct ErrorParams {
    pub code: Option<i64>,
    pub retry_after: Option<String>,
    pub text: Option<String>,
}

/// `close` parameters.
#[derive(Debug, Clone, Default)]
pub struct CloseParams {
    pub reason: Option<String>,
}

/// A parsed inbound carrier message, dispatched by the session controller.
#[derive(Debug, Clone)]
pub enum CarrierMessage {
    Open(OpenParams),
    Ping,
    Close(CloseParams),
    Error(ErrorParams),
    /// `update`, `resume`, `pause`, and anything else not acted on.
    Ignored(String),
}

/// Parse the envelope's `type` field and parameters into a [`CarrierMessage`].
pub fn parse_message(envelope: &InboundEnvelope) -> CarrierMessage {
    match envelope.msg_type.as_str() {
        "open" => CarrierMessage::Open(parse_open_params(&envelope.parameters)),
        "ping" => CarrierMessage::Ping,
        "close" => CarrierMessage::Close(CloseParams {
            reason: envelope.parameters.get("reason").and_then(Value::as_str).map(str::to_string),
        }),
        "error" => CarrierMessage::Error(ErrorParams {
            code: envelope.parameters.get("code").and_then(Value::as_i64),
            retry_after: envelope.parameters.get("retryAfter").and_then(Value::as_str).map(str::to_string),
            text: envelope.parameters.get("text").and_then(Value::as_str).map(str::to_string),
        }),
        other => CarrierMessage::Ignored(other.to_string()),
    }
}

fn parse_open_params(parameters: &Value) -> OpenParams {
    let conversation_id = parameters.get("conversationId").and_then(Value::as_str).unwrap_or_default().to_string();
    let participant_id = parameters
        .get("participant")
        .and_then(|p| p.get("id"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let media = parameters
        .get("media")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|m| {
                    let format = m.get("format")?.as_str()?.to_string();
                    let rate = m.get("rate")?.as_u64()? as u32;
                    Some(MediaFormat { format, rate })
                })
                .collect()
        })
        .unwrap_or_default();

    let input_variables = parameters
        .get("inputVariables")
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default();

    OpenParams { conversation_id, participant_id, media, input_variables }
}

/// True if both ids are the all-zeros sentinel the carrier uses for
/// reachability probes.
pub fn is_probe(params: &OpenParams) -> bool {
    params.conversation_id == ZERO_UUID && params.participant_id == ZERO_UUID
}

/// Choose the carrier's offered PCMU/8000 entry, if any.
pub fn select_media(offered: &[MediaFormat]) -> Option<MediaFormat> {
    offered.iter().find(|m| m.format == "PCMU" && m.rate == 8000).cloned()
}

/// Clamp a carrier-supplied `max_output_tokens` input variable to `"inf"` or
/// an integer in `[1, 4096]`, falling back to `default` on anything else.
pub fn clamp_max_output_tokens(raw: Option<&str>, default: &str) -> String {
    let Some(raw) = raw else { return default.to_string() };
    if raw.eq_ignore_ascii_case("inf") {
        return "inf".to_string();
    }
    match raw.parse::<i64>() {
        Ok(tokens) if (1..=4096).contains(&tokens) => tokens.to_string(),
        _ => default.to_string(),
    }
}

/// Outbound framing: every control frame shares this envelope shape, with a
/// type-specific `parameters` payload supplied by the caller.
pub fn outbound_envelope(msg_type: &str, server_seq: u64, client_seq: u64, session_id: &str, parameters: Value) -> Value {
    serde_json::json!({
        "version": PROTOCOL_VERSION,
        "type": msg_type,
        "seq": server_seq,
        "clientseq": client_seq,
        "id": session_id,
        "parameters": parameters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(msg_type: &str, parameters: Value) -> InboundEnvelope {
        InboundEnvelope {
            version: "2".to_string(),
            msg_type: msg_type.to_string(),
            seq: 1,
            id: "sess-1".to_string(),
            parameters,
        }
    }

    #[test]
    fn probe_open_is_detected() {
        let params = parse_open_params(&json!({
            "conversationId": "00000000-0000-0000-0000-000000000000",
            "participant": { "id": "00000000-0000-0000-0000-000000000000" },
            "media": [],
        }));
        assert!(is_probe(&params));
    }

    #[test]
    fn non_probe_open_with_real_ids_is_not_a_probe() {
        let params = parse_open_params(&json!({
            "conversationId": "11111111-1111-1111-1111-111111111111",
            "participant": { "id": "22222222-2222-2222-2222-222222222222" },
        }));
        assert!(!is_probe(&params));
    }

    #[test]
    fn selects_pcmu_8000_from_offer() {
        let offered = vec![
            MediaFormat { format: "PCMU".to_string(), rate: 8000 },
            MediaFormat { format: "OPUS".to_string(), rate: 48000 },
        ];
        assert_eq!(select_media(&offered), Some(MediaFormat { format: "PCMU".to_string(), rate: 8000 }));
    }

    #[test]
    fn no_pcmu_8000_offer_yields_none() {
        let offered = vec![MediaFormat { format: "OPUS".to_string(), rate: 48000 }];
        assert_eq!(select_media(&offered), None);
    }

    #[test]
    fn max_output_tokens_accepts_inf_and_in_range_ints() {
        assert_eq!(clamp_max_output_tokens(Some("inf"), "4096"), "inf");
        assert_eq!(clamp_max_output_tokens(Some("INF"), "4096"), "inf");
        assert_eq!(clamp_max_output_tokens(Some("2048"), "4096"), "2048");
    }

    #[test]
    fn max_output_tokens_falls_back_on_out_of_range_or_garbage() {
        assert_eq!(clamp_max_output_tokens(Some("5000"), "4096"), "4096");
        assert_eq!(clamp_max_output_tokens(Some("0"), "4096"), "4096");
        assert_eq!(clamp_max_output_tokens(Some("not-a-number"), "4096"), "4096");
        assert_eq!(clamp_max_output_tokens(None, "4096"), "4096");
    }

    #[test]
    fn parses_error_message_with_retry_after() {
        let env = envelope("error", json!({ "code": 429, "retryAfter": "PT2S" }));
        match parse_message(&env) {
            CarrierMessage::Error(e) => {
                assert_eq!(e.code, Some(429));
                assert_eq!(e.retry_after.as_deref(), Some("PT2S"));
            }
            _ => panic!("expected Error"),
        }
    }

    #[test]
    fn ignored_advisories_pass_through() {
        for t in ["update", "resume", "pause", "something_unknown"] {
            let env = envelope(t, json!({}));
            match parse_message(&env) {
                CarrierMessage::Ignored(name) => assert_eq!(name, t),
                _ => panic!("expected Ignored for {t}"),
            }
        }
    }

    #[test]
    fn outbound_envelope_has_expected_shape() {
        let env = outbound_envelope("pong", 3, 7, "sess-1", json!({}));
        assert_eq!(env["version"], "2");
        assert_eq!(env["type"], "pong");
        assert_eq!(env["seq"], 3);
        assert_eq!(env["clientseq"], 7);
        assert_eq!(env["id"], "sess-1");
    }
}
