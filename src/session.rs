//! Session controller: one instance per carrier WebSocket connection. Owns
//! carrier-side sequencing, input-variable resolution, the model-provider
//! client, and the downlink pacer's bridge onto the carrier socket.
//!
//! Grounded on `original_source/audio_hook_server.py`'s `AudioHookServer`
//! class (`handle_open`/`handle_ping`/`handle_close`/`handle_error`/
//! `handle_audio_frame`/`generate_session_summary`/`disconnect_session`) and
//! `genesys_actions.py::build_genesys_tool_context` for per-session
//! data-action resolution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn, Instrument};

use crate::audiohook::{self, CarrierMessage, InboundEnvelope, OpenParams};
use crate::config::Config;
use crate::pacer::{self, DownlinkPacer};
use crate::prompt::{self, PromptInputs};
use crate::provider::{self, ConnectParams, ProviderClient, ProviderEvent};
use crate::rate_limiter::{parse_iso8601_duration, RateLimiter};
use crate::tools::data_action::{
    prepare_session_actions, resolve_action_ids, DataActionClient, TokenCache,
};
use crate::tools::remote_descriptors;
use crate::tools::{ToolChoice, ToolRouter};

const DEFAULT_MAX_OUTPUT_TOKENS: &str = "4096";
const SUMMARY_TIMEOUT: Duration = Duration::from_secs(10);

/// Drives the bridge state machine for one carrier connection, start to
/// finish. Created fresh per accepted WebSocket.
pub struct Session {
    config: Arc<Config>,
    data_action_client: Option<Arc<DataActionClient>>,
    http: reqwest::Client,

    session_id: String,
    client_seq: u64,
    server_seq: AtomicU64,
    running: bool,

    message_limiter: RateLimiter,
    binary_limiter: RateLimiter,

    retry_count: u32,
    start_time: Instant,

    audio_frames_sent: u64,
    audio_frames_received: u64,

    provider: Option<Arc<ProviderClient>>,
    pacer: Arc<DownlinkPacer>,
    pacer_shutdown: Option<mpsc::Sender<()>>,

    writer_tx: mpsc::UnboundedSender<Message>,
}

impl Session {
    pub fn new(config: Arc<Config>, http: reqwest::Client, writer_tx: mpsc::UnboundedSender<Message>) -> Self {
        let data_action_client = build_data_action_client(&config, http.clone());
        Session {
            session_id: uuid::Uuid::new_v4().to_string(),
            client_seq: 0,
            server_seq: AtomicU64::new(0),
            running: true,
            message_limiter: RateLimiter::new(config.carrier_msg_rate, config.carrier_msg_burst),
            binary_limiter: RateLimiter::new(config.carrier_binary_rate, config.carrier_binary_burst),
            retry_count: 0,
            start_time: Instant::now(),
            audio_frames_sent: 0,
            audio_frames_received: 0,
            provider: None,
            pacer: DownlinkPacer::new(config.pacer_capacity),
            pacer_shutdown: None,
            data_action_client,
            http,
            config,
            writer_tx,
        }
    }

    fn next_server_seq(&self) -> u64 {
        self.server_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Rate-limited send of a control-frame envelope, matching `_send_json`'s
    /// drop-on-exceeded behavior.
    fn send_control(&mut self, msg_type: &str, parameters: Value) {
        if !self.message_limiter.acquire() {
            warn!(msg_type, "carrier message rate limit exceeded, dropping frame");
            return;
        }
        let seq = self.next_server_seq();
        let envelope = audiohook::outbound_envelope(msg_type, seq, self.client_seq, &self.session_id, parameters);
        if self.writer_tx.send(Message::Text(envelope.to_string())).is_err() {
            warn!("carrier websocket writer gone while sending control frame");
            self.running = false;
        }
    }

    /// Top-level dispatch for one parsed inbound envelope, plus the raw
    /// rate-limit-backoff carve-out `handle_message` implements.
    pub async fn handle_envelope(&mut self, envelope: InboundEnvelope, events_rx: &mut mpsc::Receiver<ProviderEvent>) {
        self.client_seq = envelope.seq;
        let msg = audiohook::parse_message(&envelope);

        if let CarrierMessage::Error(ref params) = msg {
            if self.handle_error(params).await {
                return;
            }
        }

        match msg {
            CarrierMessage::Open(params) => {
                // The carrier assigns the session id on `open`; it is immutable
                // for the rest of the session from this point on.
                self.session_id = envelope.id.clone();
                tracing::Span::current().record("session_id", self.session_id.as_str());
                self.handle_open(params, events_rx).await
            }
            CarrierMessage::Ping => self.handle_ping().await,
            CarrierMessage::Close(params) => self.handle_close(params.reason.as_deref()).await,
            CarrierMessage::Error(_) => {}
            CarrierMessage::Ignored(kind) => debug!(kind, "ignoring carrier advisory message"),
        }
    }

    async fn handle_open(&mut self, params: OpenParams, events_rx: &mut mpsc::Receiver<ProviderEvent>) {
        if audiohook::is_probe(&params) {
            info!("detected probe connection");
            self.send_control("opened", json!({ "startPaused": false, "media": [] }));
            return;
        }

        let Some(chosen) = audiohook::select_media(&params.media) else {
            self.send_control("disconnect", json!({ "reason": "error", "info": "No supported format found" }));
            self.running = false;
            return;
        };

        self.send_control("opened", json!({ "startPaused": false, "media": [serde_json::to_value(&chosen).unwrap()] }));
        info!(format = %chosen.format, rate = chosen.rate, "session opened, negotiated media format");

        let vars = &params.input_variables;
        let voice = vars.get("OPENAI_VOICE").cloned().unwrap_or_else(|| "sage".to_string());
        let instructions = vars
            .get("OPENAI_SYSTEM_PROMPT")
            .cloned()
            .unwrap_or_else(|| "You are a helpful assistant.".to_string());
        let temperature: f64 = vars.get("OPENAI_TEMPERATURE").and_then(|v| v.parse().ok()).unwrap_or(0.8);
        let model = vars.get("OPENAI_MODEL").cloned().unwrap_or_else(|| self.config.default_model.clone());
        let max_output_tokens =
            audiohook::clamp_max_output_tokens(vars.get("OPENAI_MAX_OUTPUT_TOKENS").map(String::as_str), DEFAULT_MAX_OUTPUT_TOKENS);
        let language = vars.get("LANGUAGE").filter(|s| !s.is_empty());
        let customer_data = vars.get("CUSTOMER_DATA").filter(|s| !s.is_empty());
        let agent_name = vars.get("AGENT_NAME").cloned().unwrap_or_else(|| self.config.default_agent_name.clone());
        let company_name = vars.get("COMPANY_NAME").cloned().unwrap_or_else(|| self.config.default_company_name.clone());

        debug!(voice, max_output_tokens, model, "resolved session input variables");

        let (data_actions, tool_router, action_instructions) = self.build_tool_router(vars).await;
        let remote_ctx = remote_descriptors::load_remote_tool_context(vars.get("MCP_TOOLS").map(String::as_str));

        let mut external_instructions = String::new();
        if !action_instructions.is_empty() {
            external_instructions.push_str(&action_instructions);
        }
        if let Some(ctx) = &remote_ctx {
            if !external_instructions.is_empty() {
                external_instructions.push_str("\n\n");
            }
            external_instructions.push_str(&ctx.instructions);
        }

        let prompt_inputs = PromptInputs {
            admin_prompt: &instructions,
            language: language.map(String::as_str),
            customer_data: customer_data.map(String::as_str),
            agent_name: Some(&agent_name),
            company_name: Some(&company_name),
            external_tool_instructions: Some(external_instructions.as_str()),
        };
        let system_prompt = prompt::create_final_system_prompt(&prompt_inputs);

        let _ = data_actions;

        let tool_router = Arc::new(tool_router);
        let (events_tx, new_events_rx) = mpsc::channel(32);
        *events_rx = new_events_rx;

        let connect_params = ConnectParams {
            session_id: self.session_id.clone(),
            system_prompt,
            voice,
            temperature,
            model,
            extra_tools: remote_ctx.map(|c| c.tools).unwrap_or_default(),
        };

        match provider::connect(self.config.clone(), connect_params, tool_router, self.pacer.clone(), events_tx).await {
            Ok(client) => self.provider = Some(client),
            Err(e) => {
                error!(error = %e, "model provider connection failed");
                self.disconnect_session("error", &e.to_string()).await;
                return;
            }
        }

        self.spawn_pacer_writer();
    }

    /// Build the session's data-action registry from carrier input variables,
    /// mirroring `build_genesys_tool_context`'s id/description parsing and
    /// the per-session cap.
    async fn build_tool_router(&self, vars: &HashMap<String, String>) -> (Vec<crate::tools::data_action::DataAction>, ToolRouter, String) {
        let tool_choice = vars.get("TOOL_CHOICE").map(|raw| ToolChoice::parse(raw)).unwrap_or_default();

        let raw_ids = vars.get("DATA_ACTION_IDS").or_else(|| vars.get("GENESYS_DATA_ACTION_IDS"));
        let Some(raw_ids) = raw_ids.filter(|s| !s.is_empty()) else {
            let router = ToolRouter::with_tool_choice(
                Vec::new(),
                self.data_action_client.clone(),
                self.config.max_tool_argument_bytes,
                self.config.max_tool_invocations_per_session,
                tool_choice,
            );
            return (Vec::new(), router, String::new());
        };

        let Some(client) = &self.data_action_client else {
            warn!("DATA_ACTION_IDS set but no Genesys client credentials configured, ignoring");
            let router = ToolRouter::with_tool_choice(
                Vec::new(),
                None,
                self.config.max_tool_argument_bytes,
                self.config.max_tool_invocations_per_session,
                tool_choice,
            );
            return (Vec::new(), router, String::new());
        };

        let action_ids = resolve_action_ids(raw_ids, self.config.data_action_allowlist.as_deref(), self.config.max_data_actions_per_session);

        let descriptions: HashMap<String, String> = vars
            .get("DATA_ACTION_DESCRIPTIONS")
            .map(|raw| raw.split('|').map(str::to_string).collect::<Vec<_>>())
            .filter(|parts| parts.len() == action_ids.len())
            .map(|parts| action_ids.iter().cloned().zip(parts).collect())
            .unwrap_or_default();

        let actions = prepare_session_actions(client, &action_ids, &descriptions).await;
        let instructions = if actions.is_empty() {
            String::new()
        } else {
            let names: Vec<&str> = actions.iter().map(|a| a.definition.name.as_str()).collect();
            format!(
                "The following external data actions are available for this conversation: {}. \
                 Call them when the user's request requires live data this system doesn't already have.",
                names.join(", ")
            )
        };

        let router = ToolRouter::with_tool_choice(
            actions.clone(),
            Some(client.clone()),
            self.config.max_tool_argument_bytes,
            self.config.max_tool_invocations_per_session,
            tool_choice,
        );
        (actions, router, instructions)
    }

    /// Bridge the pacer's synchronous send closure onto the async carrier
    /// writer task via a channel, since the pacer tick cannot `.await`.
    fn spawn_pacer_writer(&mut self) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        self.pacer_shutdown = Some(shutdown_tx);

        let writer_tx = self.writer_tx.clone();
        let rate_limiter = RateLimiter::new(self.config.carrier_binary_rate, self.config.carrier_binary_burst);

        pacer::spawn(self.pacer.clone(), rate_limiter, self.config.frame_send_interval, shutdown_rx, move |frame| {
            writer_tx.send(Message::Binary(frame)).is_ok()
        });
    }

    async fn handle_ping(&mut self) {
        self.send_control("pong", json!({}));
    }

    /// 429 backoff, mirroring `handle_error`. Returns `true` if the error was
    /// consumed (caller should not continue dispatching this message).
    async fn handle_error(&mut self, params: &crate::audiohook::ErrorParams) -> bool {
        if params.code != Some(429) {
            return false;
        }

        let retry_after = params
            .retry_after
            .as_deref()
            .and_then(|raw| parse_iso8601_duration(raw).ok());

        self.retry_count += 1;
        warn!(retry_count = self.retry_count, ?retry_after, "received 429 from carrier");

        if self.retry_count > self.config.rate_limit_max_retries {
            error!(retry_count = self.retry_count, "rate limit max retries exceeded");
            self.disconnect_session("error", "Rate limit max retries exceeded").await;
            return true;
        }

        if let Some(client) = &self.provider {
            client.close().await;
            self.provider = None;
        }
        self.running = false;

        let session_duration = self.start_time.elapsed().as_secs_f64();
        let delay = retry_after.unwrap_or_else(|| self.config.backoff_delay_for_session_age(session_duration));
        info!(delay, "backing off after carrier rate limit");
        tokio::time::sleep(Duration::from_secs_f64(delay)).await;

        self.running = true;
        true
    }

    async fn handle_close(&mut self, reason: Option<&str>) {
        info!(reason, "received close from carrier");
        let summary = self.generate_session_summary().await;
        if let Some(s) = &summary {
            info!(?s, "session summary");
        }

        self.send_control("closed", json!({ "summary": summary }));

        let duration = self.start_time.elapsed().as_secs_f64();
        info!(
            duration,
            frames_sent = self.audio_frames_sent,
            frames_received = self.audio_frames_received,
            "session stats"
        );

        self.teardown().await;
    }

    async fn generate_session_summary(&self) -> Option<Value> {
        let client = self.provider.as_ref()?;
        match client.request_summary(&self.config.ending_analysis_prompt, SUMMARY_TIMEOUT).await {
            Ok(event) => {
                let text = event
                    .get("response")
                    .and_then(|r| r.get("output"))
                    .and_then(Value::as_array)
                    .and_then(|arr| arr.first())
                    .and_then(|item| item.get("text"))
                    .and_then(Value::as_str);
                match text {
                    Some(text) => match serde_json::from_str(text) {
                        Ok(summary) => Some(summary),
                        Err(_) => {
                            error!("failed to parse summary JSON");
                            Some(json!({ "error": "Failed to parse summary" }))
                        }
                    },
                    None => None,
                }
            }
            Err(e) => {
                error!(error = %e, "error generating session summary");
                Some(json!({ "error": e.to_string() }))
            }
        }
    }

    /// Server-initiated disconnect, triggered by a call-control tool firing
    /// (see the events loop in [`run`]) or by an unrecoverable error.
    async fn disconnect_session(&mut self, reason: &str, info: &str) {
        if self.session_id.is_empty() {
            return;
        }
        info!(reason, info, "initiating server-side disconnect");

        let summary = self.generate_session_summary().await;
        let token_metrics = self.token_metrics();

        let mut output_vars = json!({
            "CONVERSATION_SUMMARY": summary.as_ref().map(|s| s.to_string()).unwrap_or_default(),
            "CONVERSATION_DURATION": self.start_time.elapsed().as_secs_f64().to_string(),
        });
        if let Value::Object(ref mut obj) = output_vars {
            if let Value::Object(metrics) = token_metrics {
                obj.extend(metrics);
            }
        }

        self.send_control(
            "disconnect",
            json!({ "reason": reason, "info": info, "outputVariables": output_vars }),
        );

        self.teardown().await;
    }

    /// Token counters as strings, always carrying all six keys — zeros when
    /// no provider was ever connected or no response has completed yet, per
    /// the "always populated" output-variable guarantee.
    fn token_metrics(&self) -> Value {
        let zero_metrics = || {
            json!({
                "TOTAL_INPUT_TEXT_TOKENS": "0",
                "TOTAL_INPUT_CACHED_TEXT_TOKENS": "0",
                "TOTAL_INPUT_AUDIO_TOKENS": "0",
                "TOTAL_INPUT_CACHED_AUDIO_TOKENS": "0",
                "TOTAL_OUTPUT_TEXT_TOKENS": "0",
                "TOTAL_OUTPUT_AUDIO_TOKENS": "0",
            })
        };
        let Some(client) = &self.provider else { return zero_metrics() };
        let Some(last) = client.last_response() else { return zero_metrics() };
        let usage = last.get("usage").cloned().unwrap_or(Value::Null);
        let input_details = usage.get("input_token_details").cloned().unwrap_or(Value::Null);
        let cached_details = input_details.get("cached_tokens_details").cloned().unwrap_or(Value::Null);
        let output_details = usage.get("output_token_details").cloned().unwrap_or(Value::Null);

        json!({
            "TOTAL_INPUT_TEXT_TOKENS": input_details.get("text_tokens").and_then(Value::as_i64).unwrap_or(0).to_string(),
            "TOTAL_INPUT_CACHED_TEXT_TOKENS": cached_details.get("text_tokens").and_then(Value::as_i64).unwrap_or(0).to_string(),
            "TOTAL_INPUT_AUDIO_TOKENS": input_details.get("audio_tokens").and_then(Value::as_i64).unwrap_or(0).to_string(),
            "TOTAL_INPUT_CACHED_AUDIO_TOKENS": cached_details.get("audio_tokens").and_then(Value::as_i64).unwrap_or(0).to_string(),
            "TOTAL_OUTPUT_TEXT_TOKENS": output_details.get("text_tokens").and_then(Value::as_i64).unwrap_or(0).to_string(),
            "TOTAL_OUTPUT_AUDIO_TOKENS": output_details.get("audio_tokens").and_then(Value::as_i64).unwrap_or(0).to_string(),
        })
    }

    async fn teardown(&mut self) {
        self.running = false;
        if let Some(shutdown) = self.pacer_shutdown.take() {
            let _ = shutdown.send(()).await;
        }
        if let Some(client) = self.provider.take() {
            client.close().await;
        }
    }

    /// Forward a carrier-side binary audio frame to the model provider, if a
    /// session is live.
    pub async fn handle_audio_frame(&mut self, frame: Vec<u8>) {
        let Some(client) = &self.provider else { return };
        if !self.binary_limiter.acquire() {
            warn!("carrier binary rate limit exceeded, dropping uplink frame");
            return;
        }
        self.audio_frames_received += 1;
        if let Err(e) = client.send_audio(&frame).await {
            warn!(error = %e, "failed to forward audio frame to model provider");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Consume one event surfaced by the model-provider reader task.
    pub async fn handle_provider_event(&mut self, event: ProviderEvent) {
        match event {
            ProviderEvent::BargeIn => {
                self.pacer.clear();
                self.send_control("event", json!({ "entities": [{ "type": "barge_in", "data": {} }] }));
            }
            ProviderEvent::Disconnect { reason, info } => {
                self.disconnect_session(reason.as_str(), &info).await;
            }
            ProviderEvent::Closed => {
                if self.running {
                    warn!("model provider connection closed unexpectedly");
                    self.provider = None;
                    self.disconnect_session("error", "model provider connection closed unexpectedly").await;
                }
            }
        }
    }
}

fn build_data_action_client(config: &Config, http: reqwest::Client) -> Option<Arc<DataActionClient>> {
    let (Some(id), Some(secret)) = (config.data_action_client_id.clone(), config.data_action_client_secret.clone()) else {
        return None;
    };
    let token_url = format!("{}/oauth/token", config.data_action_login_url);
    let tokens = Arc::new(TokenCache::new(http.clone(), token_url, id, secret));
    Some(Arc::new(DataActionClient::new(
        http,
        config.data_action_base_url.clone(),
        tokens,
        config.data_action_redact_fields.clone(),
    )))
}

/// Run one carrier WebSocket connection to completion: spawns a dedicated
/// writer task (since the pacer's send closure can't `.await`), then loops
/// reading carrier frames and provider events until the session ends.
///
/// The whole run is wrapped in a `tracing` span keyed by session id so every
/// log line emitted while handling this connection — including from the
/// provider reader task spawned off `Session::handle_open` — carries that
/// context. The field starts as the pre-`open` placeholder id and is updated
/// in place once the carrier's `open` envelope assigns the real one.
pub async fn run(ws: WebSocketStream<TcpStream>, config: Arc<Config>, http: reqwest::Client) {
    let placeholder_id = uuid::Uuid::new_v4().to_string();
    let span = tracing::info_span!("session", session_id = %placeholder_id);
    run_inner(ws, config, http).instrument(span).await
}

async fn run_inner(ws: WebSocketStream<TcpStream>, config: Arc<Config>, http: reqwest::Client) {
    let (mut ws_write, mut ws_read) = ws.split();
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = writer_rx.recv().await {
            if ws_write.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session::new(config, http, writer_tx);
    let (_events_tx, mut events_rx) = mpsc::channel::<ProviderEvent>(1);

    while session.is_running() {
        tokio::select! {
            frame = ws_read.next() => {
                let Some(frame) = frame else { break };
                let frame = match frame {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(error = %e, "carrier websocket read error");
                        break;
                    }
                };
                match frame {
                    Message::Text(text) => {
                        match serde_json::from_str::<InboundEnvelope>(&text) {
                            Ok(envelope) => session.handle_envelope(envelope, &mut events_rx).await,
                            Err(e) => warn!(error = %e, "failed to parse carrier envelope"),
                        }
                    }
                    Message::Binary(bytes) => session.handle_audio_frame(bytes).await,
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(event) = events_rx.recv() => {
                session.handle_provider_event(event).await;
            }
        }
    }

    session.teardown().await;
    writer_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffPhase;
    use serde_json::json;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            carrier_api_key: "secret".into(),
            provider_api_key: "sk-test".into(),
            default_model: "gpt-4o-mini-realtime-preview".into(),
            default_agent_name: "Assistant".into(),
            default_company_name: "Acme".into(),
            pacer_capacity: 50,
            frame_send_interval: Duration::from_millis(150),
            carrier_msg_rate: 50.0,
            carrier_msg_burst: 50.0,
            carrier_binary_rate: 50.0,
            carrier_binary_burst: 50.0,
            rate_limit_max_retries: 3,
            rate_limit_phases: vec![BackoffPhase { window_secs: f64::INFINITY, delay_secs: 3.0 }],
            ending_analysis_prompt: "Summarize this call.".into(),
            ending_analysis_temperature: 0.2,
            max_data_actions_per_session: 10,
            max_tool_invocations_per_session: 20,
            max_tool_argument_bytes: 8192,
            data_action_allowlist: None,
            data_action_client_id: None,
            data_action_client_secret: None,
            data_action_base_url: "https://api.mypurecloud.com".into(),
            data_action_login_url: "https://login.mypurecloud.com".into(),
            data_action_redact_fields: Vec::new(),
            debug: false,
        })
    }

    fn test_session() -> (Session, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(test_config(), reqwest::Client::new(), tx);
        (session, rx)
    }

    fn open_envelope(seq: u64, conversation_id: &str, participant_id: &str, media: Value) -> InboundEnvelope {
        InboundEnvelope {
            version: "2".into(),
            msg_type: "open".into(),
            seq,
            id: "carrier-assigned-id".into(),
            parameters: json!({
                "conversationId": conversation_id,
                "participant": { "id": participant_id },
                "media": media,
                "inputVariables": {},
            }),
        }
    }

    fn ping_envelope(seq: u64) -> InboundEnvelope {
        InboundEnvelope { version: "2".into(), msg_type: "ping".into(), seq, id: "sess".into(), parameters: json!({}) }
    }

    fn drain_text_frames(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    /// Testable property 3: a probe `open` gets an empty-media `opened` and
    /// never starts a model-provider connection.
    #[tokio::test]
    async fn probe_open_yields_opened_with_empty_media_and_no_provider() {
        let (mut session, mut rx) = test_session();
        let (_tx, mut events_rx) = mpsc::channel(1);

        let envelope = open_envelope(
            1,
            "00000000-0000-0000-0000-000000000000",
            "00000000-0000-0000-0000-000000000000",
            json!([]),
        );
        session.handle_envelope(envelope, &mut events_rx).await;

        let frames = drain_text_frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "opened");
        assert_eq!(frames[0]["parameters"]["media"], json!([]));
        assert!(session.provider.is_none());
    }

    /// Testable property 4: no PCMU/8000 in the offer disconnects with reason
    /// "error" instead of opening a session.
    #[tokio::test]
    async fn unsupported_media_disconnects_with_error_reason() {
        let (mut session, mut rx) = test_session();
        let (_tx, mut events_rx) = mpsc::channel(1);

        let envelope = open_envelope(
            1,
            "11111111-1111-1111-1111-111111111111",
            "22222222-2222-2222-2222-222222222222",
            json!([{ "format": "OPUS", "rate": 48000 }]),
        );
        session.handle_envelope(envelope, &mut events_rx).await;

        let frames = drain_text_frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "disconnect");
        assert_eq!(frames[0]["parameters"]["reason"], "error");
        assert!(!session.is_running());
    }

    /// Testable properties 1 and 2: server sequence strictly increases across
    /// outbound frames, and each frame's `clientseq` echoes the most recently
    /// observed carrier `seq`.
    #[tokio::test]
    async fn server_sequence_strictly_increases_and_echoes_client_seq() {
        let (mut session, mut rx) = test_session();
        let (_tx, mut events_rx) = mpsc::channel(1);

        session.handle_envelope(ping_envelope(5), &mut events_rx).await;
        session.handle_envelope(ping_envelope(9), &mut events_rx).await;
        session.handle_envelope(ping_envelope(12), &mut events_rx).await;

        let frames = drain_text_frames(&mut rx);
        assert_eq!(frames.len(), 3);
        let seqs: Vec<u64> = frames.iter().map(|f| f["seq"].as_u64().unwrap()).collect();
        assert!(seqs.windows(2).all(|w| w[1] > w[0]), "sequences not strictly increasing: {seqs:?}");
        assert_eq!(frames[0]["clientseq"], 5);
        assert_eq!(frames[1]["clientseq"], 9);
        assert_eq!(frames[2]["clientseq"], 12);
    }

    /// Testable property 10: a disconnect frame always carries a summary
    /// field, a duration, and all six token counters, even with no provider
    /// ever having been connected.
    #[tokio::test]
    async fn disconnect_session_always_populates_output_variables() {
        let (mut session, mut rx) = test_session();
        session.disconnect_session("completed", "caller said goodbye").await;

        let frames = drain_text_frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "disconnect");
        assert_eq!(frames[0]["parameters"]["reason"], "completed");

        let vars = &frames[0]["parameters"]["outputVariables"];
        assert!(vars.get("CONVERSATION_SUMMARY").is_some());
        assert!(vars.get("CONVERSATION_DURATION").is_some());
        for key in [
            "TOTAL_INPUT_TEXT_TOKENS",
            "TOTAL_INPUT_CACHED_TEXT_TOKENS",
            "TOTAL_INPUT_AUDIO_TOKENS",
            "TOTAL_INPUT_CACHED_AUDIO_TOKENS",
            "TOTAL_OUTPUT_TEXT_TOKENS",
            "TOTAL_OUTPUT_AUDIO_TOKENS",
        ] {
            assert_eq!(vars[key], "0", "missing or non-zero {key}");
        }
        assert!(!session.is_running());
    }

    /// Disconnect is a no-op once the session id has been cleared — the guard
    /// `disconnect_session` relies on to keep a second disconnect call from
    /// re-sending a frame after teardown.
    #[tokio::test]
    async fn disconnect_is_a_no_op_once_session_id_is_cleared() {
        let (mut session, mut rx) = test_session();
        session.session_id.clear();
        session.disconnect_session("completed", "second").await;
        let frames = drain_text_frames(&mut rx);
        assert!(frames.is_empty());
    }
}
