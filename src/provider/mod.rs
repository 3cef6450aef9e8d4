//! Model-provider client: connects to the OpenAI-Realtime-shaped WebSocket
//! API, performs the session handshake, and relays audio and tool-call
//! events between the provider and the session controller.
//!
//! Grounded on `original_source/openai_client.py` (connect handshake,
//! `_safe_send`, `start_receiving`/`_read_loop`, `_handle_function_call`) and
//! the teacher's `voice/stt/openai_realtime.rs` (the `connect_async` +
//! bearer-header request-builder pattern and the tagged client/server event
//! enums).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn, Instrument};

use crate::config::Config;
use crate::error::ProviderError;
use crate::pacer::DownlinkPacer;
use crate::rate_limiter::parse_iso8601_duration;
use crate::tools::{DisconnectReason, ToolCall, ToolOutcome, ToolRouter};

const REALTIME_URL_BASE: &str = "wss://api.openai.com/v1/realtime";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_VOICE: &str = "echo";
const TEMPERATURE_RANGE: (f64, f64) = (0.6, 1.2);
const DEFAULT_TEMPERATURE: f64 = 0.8;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;

/// Parameters the session controller already resolved (media negotiation,
/// prompt composition, input-variable parsing) needed to start a provider
/// session.
pub struct ConnectParams {
    pub session_id: String,
    pub system_prompt: String,
    pub voice: String,
    pub temperature: f64,
    pub model: String,
    pub extra_tools: Vec<Value>,
}

/// Events the reader task surfaces to the session controller. The session
/// owns carrier-side framing (sequence numbers, the actual disconnect frame),
/// so the provider client never touches the carrier socket directly.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// The model detected the caller starting to speak; the session should
    /// emit a `barge_in` event frame and clear the downlink pacer.
    BargeIn,
    /// A call-control tool fired and its farewell turn has finished
    /// generating; the session should now send the carrier `disconnect`.
    Disconnect { reason: DisconnectReason, info: String },
    /// The provider connection dropped unexpectedly.
    Closed,
}

/// Connect to the model provider, complete the `session.created` /
/// `session.update` / `session.updated` handshake, and spawn the reader task.
///
/// Retries the whole handshake on a 429 up to `config.rate_limit_max_retries`
/// times, backing off for the configured phase delay between attempts.
pub async fn connect(
    config: Arc<Config>,
    params: ConnectParams,
    tool_router: Arc<ToolRouter>,
    pacer: Arc<DownlinkPacer>,
    events_tx: mpsc::Sender<ProviderEvent>,
) -> Result<Arc<ProviderClient>, ProviderError> {
    let start = Instant::now();
    let mut retry_count = 0u32;

    let voice = if params.voice.trim().is_empty() { DEFAULT_VOICE.to_string() } else { params.voice.clone() };
    let temperature = if params.temperature >= TEMPERATURE_RANGE.0 && params.temperature <= TEMPERATURE_RANGE.1 {
        params.temperature
    } else {
        warn!(temperature = params.temperature, "temperature out of range, using default");
        DEFAULT_TEMPERATURE
    };

    loop {
        match handshake(&config, &params, &voice, temperature, &tool_router).await {
            Ok((write, read)) => {
                let client = Arc::new(ProviderClient {
                    write: tokio::sync::Mutex::new(write),
                    running: Arc::new(AtomicBool::new(true)),
                    paused: Arc::new(AtomicBool::new(false)),
                    start,
                    session_id: params.session_id.clone(),
                    last_response: parking_lot::Mutex::new(None),
                    summary_waiter: parking_lot::Mutex::new(None),
                });

                spawn_reader(client.clone(), read, tool_router.clone(), pacer.clone(), events_tx.clone(), config.clone());
                info!(session_id = %params.session_id, voice, temperature, "model provider session established");
                return Ok(client);
            }
            Err(HandshakeOutcome::RateLimited) => {
                retry_count += 1;
                if retry_count > config.rate_limit_max_retries {
                    return Err(ProviderError::RateLimitExhausted(retry_count));
                }
                let delay = config.backoff_delay_for_session_age(start.elapsed().as_secs_f64());
                warn!(retry_count, delay, "model provider rate limited during handshake, backing off");
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
            Err(HandshakeOutcome::Fatal(e)) => return Err(e),
        }
    }
}

enum HandshakeOutcome {
    RateLimited,
    Fatal(ProviderError),
}

impl From<ProviderError> for HandshakeOutcome {
    fn from(e: ProviderError) -> Self {
        HandshakeOutcome::Fatal(e)
    }
}

async fn handshake(
    config: &Config,
    params: &ConnectParams,
    voice: &str,
    temperature: f64,
    tool_router: &ToolRouter,
) -> Result<(WsWriter, futures_util::stream::SplitStream<WsStream>), HandshakeOutcome> {
    let url = format!("{REALTIME_URL_BASE}?model={}", params.model);
    let request = Request::builder()
        .uri(&url)
        .header("Authorization", format!("Bearer {}", config.provider_api_key))
        .header("OpenAI-Beta", "realtime=v1")
        .body(())
        .map_err(|e| ProviderError::Remote(e.to_string()))?;

    let (ws, _) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(request))
        .await
        .map_err(|_| ProviderError::Timeout)?
        .map_err(ProviderError::Handshake)?;

    let (mut write, mut read) = ws.split();

    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, read.next())
        .await
        .map_err(|_| ProviderError::Timeout)?
        .ok_or(ProviderError::SessionNotCreated)?
        .map_err(ProviderError::Handshake)?;

    let first_event: Value = match first {
        Message::Text(t) => serde_json::from_str(&t).map_err(ProviderError::Json)?,
        _ => return Err(ProviderError::SessionNotCreated.into()),
    };

    if first_event.get("type").and_then(Value::as_str) == Some("error") {
        if first_event.get("code").and_then(Value::as_i64) == Some(429) {
            return Err(HandshakeOutcome::RateLimited);
        }
        let message = first_event.get("message").and_then(Value::as_str).unwrap_or("unknown error");
        return Err(ProviderError::Remote(message.to_string()).into());
    }
    if first_event.get("type").and_then(Value::as_str) != Some("session.created") {
        return Err(ProviderError::SessionNotCreated.into());
    }

    let mut tools = vec![
        json!({
            "type": "function",
            "name": crate::tools::builtin::END_CONVERSATION,
            "description": "End the call because the user's needs have been fully addressed.",
            "parameters": {
                "type": "object",
                "properties": {
                    "reason": { "type": "string", "description": "Short reason the call is ending." },
                    "note": { "type": "string", "description": "Optional free-form note for the summary." }
                }
            }
        }),
        json!({
            "type": "function",
            "name": crate::tools::builtin::ESCALATE_TO_HUMAN,
            "description": "Transfer the call to a human agent.",
            "parameters": {
                "type": "object",
                "properties": {
                    "reason": { "type": "string", "description": "Why a human is needed." },
                    "department": { "type": "string", "description": "Target department, if known." }
                }
            }
        }),
    ];
    for def in tool_router.advertised_definitions().into_iter().filter(|d| {
        d.name != crate::tools::builtin::END_CONVERSATION && d.name != crate::tools::builtin::ESCALATE_TO_HUMAN
    }) {
        tools.push(json!({
            "type": "function",
            "name": def.name,
            "description": def.description,
            "parameters": def.parameters,
        }));
    }
    tools.extend(params.extra_tools.iter().cloned());

    let session_update = json!({
        "type": "session.update",
        "session": {
            "type": "realtime",
            "model": params.model,
            "instructions": params.system_prompt,
            "output_modalities": ["audio"],
            "tools": tools,
            "tool_choice": "auto",
            "temperature": temperature,
            "audio": {
                "input": {
                    "format": { "type": "audio/pcmu" },
                    "turn_detection": { "type": "semantic_vad" }
                },
                "output": {
                    "format": { "type": "audio/pcmu" },
                    "voice": voice
                }
            }
        }
    });
    send_raw(&mut write, &session_update).await.map_err(ProviderError::from)?;

    loop {
        let msg = tokio::time::timeout(HANDSHAKE_TIMEOUT, read.next())
            .await
            .map_err(|_| ProviderError::Timeout)?
            .ok_or(ProviderError::SessionUpdateNotConfirmed)?
            .map_err(ProviderError::Handshake)?;

        let Message::Text(text) = msg else { continue };
        let event: Value = serde_json::from_str(&text).map_err(ProviderError::Json)?;
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();

        if event_type == "error" && event.get("code").and_then(Value::as_i64) == Some(429) {
            return Err(HandshakeOutcome::RateLimited);
        }
        if event_type == "session.updated" {
            debug!("model provider session updated with tools and audio settings");
            break;
        }
    }

    Ok((write, read))
}

async fn send_raw(write: &mut WsWriter, payload: &Value) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    write.send(Message::Text(payload.to_string())).await
}

/// A live provider session. Outbound sends are serialized through `write`;
/// the reader task (spawned by [`connect`]) owns all state mutation driven by
/// inbound events.
pub struct ProviderClient {
    write: tokio::sync::Mutex<WsWriter>,
    running: Arc<AtomicBool>,
    /// Set while the reader task is backing off from a mid-session 429;
    /// gates outbound sends the same way `running` does, without tearing
    /// the connection down.
    paused: Arc<AtomicBool>,
    start: Instant,
    session_id: String,
    last_response: parking_lot::Mutex<Option<Value>>,
    summary_waiter: parking_lot::Mutex<Option<oneshot::Sender<Value>>>,
}

impl ProviderClient {
    /// Forward one carrier-side uplink audio frame. Silently drops the frame
    /// if the session has already been torn down, or is paused for a
    /// mid-session rate-limit backoff, matching the source integration's
    /// guard in `send_audio`.
    pub async fn send_audio(&self, pcmu_8k: &[u8]) -> Result<(), ProviderError> {
        if !self.running.load(Ordering::SeqCst) || self.paused.load(Ordering::SeqCst) {
            return Ok(());
        }
        let encoded = base64::engine::general_purpose::STANDARD.encode(pcmu_8k);
        let event = json!({ "type": "input_audio_buffer.append", "audio": encoded });
        self.send(&event).await
    }

    async fn send(&self, payload: &Value) -> Result<(), ProviderError> {
        if !self.running.load(Ordering::SeqCst) || self.paused.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut write = self.write.lock().await;
        send_raw(&mut write, payload).await.map_err(ProviderError::Handshake)
    }

    /// Request an end-of-call summary via a tagged `response.create`, and
    /// wait up to `timeout` for the matching `response.done`.
    pub async fn request_summary(&self, prompt: &str, timeout: Duration) -> Result<Value, ProviderError> {
        let (tx, rx) = oneshot::channel();
        *self.summary_waiter.lock() = Some(tx);

        let event = json!({
            "type": "response.create",
            "response": {
                "conversation": "none",
                "output_modalities": ["text"],
                "instructions": prompt,
                "metadata": { "type": "ending_analysis" }
            }
        });
        self.send(&event).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            _ => {
                *self.summary_waiter.lock() = None;
                Err(ProviderError::Timeout)
            }
        }
    }

    pub fn last_response(&self) -> Option<Value> {
        self.last_response.lock().clone()
    }

    pub fn session_age(&self) -> Duration {
        self.start.elapsed()
    }

    pub async fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut write = self.write.lock().await;
        let _ = write.close().await;
    }
}

fn spawn_reader(
    client: Arc<ProviderClient>,
    mut read: futures_util::stream::SplitStream<WsStream>,
    tool_router: Arc<ToolRouter>,
    pacer: Arc<DownlinkPacer>,
    events_tx: mpsc::Sender<ProviderEvent>,
    config: Arc<Config>,
) -> tokio::task::JoinHandle<()> {
    // Captured at spawn time so the reader task's logs carry the same
    // `session_id` field as the rest of the connection, even though it runs
    // as its own tokio task rather than as part of the session's future.
    let parent_span = tracing::Span::current();
    tokio::spawn(async move {
        let mut disconnect_context: Option<(DisconnectReason, String)> = None;
        let mut mid_session_retry_count = 0u32;

        while client.running.load(Ordering::SeqCst) {
            let msg = match read.next().await {
                Some(Ok(m)) => m,
                Some(Err(e)) => {
                    warn!(session_id = %client.session_id, error = %e, "model provider websocket error");
                    break;
                }
                None => break,
            };

            let Message::Text(text) = msg else { continue };
            let event: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();

            match event_type {
                "error" if event.get("code").and_then(Value::as_i64) == Some(429) => {
                    mid_session_retry_count += 1;
                    if mid_session_retry_count > config.rate_limit_max_retries {
                        warn!(
                            session_id = %client.session_id,
                            retry_count = mid_session_retry_count,
                            "model provider rate limit max retries exceeded mid-session"
                        );
                        break;
                    }

                    let retry_after = event
                        .get("retry_after")
                        .or_else(|| event.get("retryAfter"))
                        .and_then(Value::as_str)
                        .and_then(|raw| parse_iso8601_duration(raw).ok());
                    let delay = retry_after
                        .unwrap_or_else(|| config.backoff_delay_for_session_age(client.start.elapsed().as_secs_f64()));

                    warn!(
                        session_id = %client.session_id,
                        retry_count = mid_session_retry_count,
                        delay,
                        "model provider rate limited mid-session, pausing uplink and downlink"
                    );
                    client.paused.store(true, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                    client.paused.store(false, Ordering::SeqCst);
                }
                "response.audio.delta" | "response.output_audio.delta" => {
                    if let Some(delta) = event.get("delta").and_then(Value::as_str) {
                        if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(delta) {
                            for frame in crate::pacer::chunk_to_frame_size(&bytes, crate::audio_constants::CARRIER_FRAME_BYTES) {
                                pacer.push(frame);
                            }
                        }
                    }
                }
                "input_audio_buffer.speech_started" => {
                    pacer.clear();
                    let _ = events_tx.send(ProviderEvent::BargeIn).await;
                }
                "input_audio_buffer.speech_stopped" => {
                    let commit = json!({ "type": "input_audio_buffer.commit" });
                    let _ = client.send(&commit).await;
                    let respond = json!({ "type": "response.create" });
                    let _ = client.send(&respond).await;
                }
                "response.done" => {
                    let response = event.get("response").cloned().unwrap_or(Value::Null);
                    *client.last_response.lock() = Some(response.clone());

                    // A pending disconnect means an earlier tool call already sent its
                    // result and requested the farewell turn; this `response.done` is
                    // that farewell completing (its audio already reached the pacer via
                    // the audio-delta events that preceded it), so disconnect now rather
                    // than dispatching this turn's own output items as new tool calls.
                    if let Some((reason, info)) = disconnect_context.take() {
                        let clear = json!({ "type": "input_audio_buffer.clear" });
                        let _ = client.send(&clear).await;
                        let _ = events_tx.send(ProviderEvent::Disconnect { reason, info }).await;
                        continue;
                    }

                    let is_ending_analysis =
                        response.get("metadata").and_then(|m| m.get("type")).and_then(Value::as_str) == Some("ending_analysis");
                    if is_ending_analysis {
                        if let Some(waiter) = client.summary_waiter.lock().take() {
                            let _ = waiter.send(event.clone());
                        }
                    }

                    let items = response
                        .get("output")
                        .or_else(|| response.get("content"))
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();

                    for item in items {
                        let Some(call) = extract_tool_call(&item) else { continue };
                        info!(session_id = %client.session_id, tool = %call.name, call_id = %call.call_id, "dispatching provider tool call");

                        let outcome = tool_router.dispatch(&call).await;
                        match outcome {
                            Ok(ToolOutcome::Result(result)) => {
                                send_tool_output(&client, &call.call_id, &result).await;
                                let respond = json!({ "type": "response.create" });
                                let _ = client.send(&respond).await;
                            }
                            Ok(ToolOutcome::Disconnect { result, reason }) => {
                                send_tool_output(&client, &call.call_id, &result).await;
                                let info = result
                                    .get("reason")
                                    .and_then(Value::as_str)
                                    .unwrap_or(reason.as_str())
                                    .to_string();
                                disconnect_context = Some((reason, info));
                                let farewell = json!({
                                    "type": "response.create",
                                    "response": {
                                        "conversation": "none",
                                        "output_modalities": ["audio"],
                                        "instructions": crate::tools::builtin::farewell_instructions(reason),
                                        "metadata": { "type": "final_farewell" }
                                    }
                                });
                                let _ = client.send(&farewell).await;
                            }
                            Err(e) => {
                                warn!(tool = %call.name, error = %e, "tool call failed");
                                let error_payload = json!({ "result": "error", "error": e.to_string() });
                                send_tool_output(&client, &call.call_id, &error_payload).await;
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        client.running.store(false, Ordering::SeqCst);
        let _ = events_tx.send(ProviderEvent::Closed).await;
    }.instrument(parent_span))
}

async fn send_tool_output(client: &ProviderClient, call_id: &str, output: &Value) {
    let event = json!({
        "type": "conversation.item.create",
        "item": {
            "type": "function_call_output",
            "call_id": call_id,
            "output": output.to_string()
        }
    });
    let _ = client.send(&event).await;
}

/// Pull a function call out of a `response.done` output item, trying the
/// provider's various historical field-name shapes before giving up.
/// Mirrors `_read_loop`'s fallback chain in the source integration.
fn extract_tool_call(item: &Value) -> Option<ToolCall> {
    let item_type = item.get("type").and_then(Value::as_str)?;
    if !matches!(item_type, "function_call" | "tool_call" | "tool" | "function") {
        return None;
    }

    let name = item
        .get("name")
        .or_else(|| item.get("function").and_then(|f| f.get("name")))
        .and_then(Value::as_str)?
        .to_string();

    let call_id = item
        .get("call_id")
        .or_else(|| item.get("id"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let raw_args = item
        .get("arguments")
        .or_else(|| item.get("input"))
        .or_else(|| item.get("args"))
        .or_else(|| item.get("parameters"))
        .or_else(|| item.get("function").and_then(|f| f.get("arguments")));

    let arguments = match raw_args {
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or(json!({})),
        Some(other) => other.clone(),
        None => json!({}),
    };

    Some(ToolCall { name, call_id, arguments })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_function_call_with_string_arguments() {
        let item = json!({
            "type": "function_call",
            "name": "end_conversation_successfully",
            "call_id": "call_1",
            "arguments": "{\"reason\": \"done\"}"
        });
        let call = extract_tool_call(&item).unwrap();
        assert_eq!(call.name, "end_conversation_successfully");
        assert_eq!(call.call_id, "call_1");
        assert_eq!(call.arguments["reason"], "done");
    }

    #[test]
    fn extracts_function_call_with_nested_function_object() {
        let item = json!({
            "type": "tool_call",
            "function": { "name": "lookup_order", "arguments": "{\"id\": 7}" },
            "id": "call_2"
        });
        let call = extract_tool_call(&item).unwrap();
        assert_eq!(call.name, "lookup_order");
        assert_eq!(call.call_id, "call_2");
        assert_eq!(call.arguments["id"], 7);
    }

    #[test]
    fn non_function_item_yields_none() {
        let item = json!({ "type": "message", "content": [] });
        assert!(extract_tool_call(&item).is_none());
    }

    #[test]
    fn malformed_arguments_string_falls_back_to_empty_object() {
        let item = json!({
            "type": "function_call",
            "name": "x",
            "call_id": "c",
            "arguments": "not json"
        });
        let call = extract_tool_call(&item).unwrap();
        assert_eq!(call.arguments, json!({}));
    }
}
