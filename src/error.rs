//! Error taxonomy for the bridge. Each concern gets its own `thiserror` enum so
//! call sites can match on what actually went wrong instead of a string.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unknown path: {0}")]
    UnknownPath(String),

    #[error("missing 'x-api-key' header")]
    MissingApiKey,

    #[error("invalid API key")]
    InvalidApiKey,

    #[error("missing required headers: {}", .0.join(", "))]
    MissingHeaders(Vec<&'static str>),
}

impl HandshakeError {
    /// HTTP status this rejection should be reported with, per §6/§7: unknown
    /// path is a 404, API key problems are 401, missing AudioHook headers
    /// are a 400.
    pub fn status_code(&self) -> u16 {
        match self {
            HandshakeError::UnknownPath(_) => 404,
            HandshakeError::MissingApiKey | HandshakeError::InvalidApiKey => 401,
            HandshakeError::MissingHeaders(_) => 400,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no supported audio format offered")]
    UnsupportedMedia,

    #[error("carrier websocket closed")]
    CarrierClosed,

    #[error("rate limit max retries ({0}) exceeded")]
    RateLimitExhausted(u32),

    #[error("model provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("provider session was not created")]
    SessionNotCreated,

    #[error("provider did not confirm session.update")]
    SessionUpdateNotConfirmed,

    #[error("provider rate limit exceeded after {0} retries")]
    RateLimitExhausted(u32),

    #[error("provider connection timed out")]
    Timeout,

    #[error("provider returned error: {0}")]
    Remote(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool call rejected by tool_choice policy")]
    RejectedByPolicy,

    #[error("argument payload exceeds the configured byte cap ({0} bytes)")]
    ArgumentsTooLarge(usize),

    #[error("per-session tool invocation cap ({0}) reached")]
    InvocationCapReached(u32),

    #[error("external action request failed: {0}")]
    ActionRequest(String),

    #[error("external action credentials rejected")]
    CredentialsRejected,
}

#[derive(Debug, Error)]
pub enum DurationParseError {
    #[error("invalid ISO 8601 duration: {0}")]
    InvalidFormat(String),
}
