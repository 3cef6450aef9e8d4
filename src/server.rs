//! TCP listener, carrier HTTP handshake validation, and per-connection
//! session spawn.
//!
//! Grounded on the teacher's `voice/call_server.rs::start_call_server`/
//! `handle_connection` (bind-loop-spawn shape, `tokio_tungstenite` split) and
//! `original_source/oai_middleware.py::validate_request` for the exact
//! validation order and header names: health-check short-circuit at `/`,
//! path match against `/audiohook`, `x-api-key` presence/equality (401), then
//! the carrier's `audiohook-organization-id`/`audiohook-correlation-id`/
//! `audiohook-session-id` headers (400 if any are missing).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::HandshakeError;
use crate::session;

const AUDIOHOOK_PATH: &str = "/audiohook";

const REQUIRED_AUDIOHOOK_HEADERS: &[&str] =
    &["audiohook-organization-id", "audiohook-correlation-id", "audiohook-session-id"];

/// Bind `addr` and serve carrier connections until the process is killed or
/// the listener errors. One task is spawned per accepted connection.
pub async fn serve(addr: SocketAddr, config: Arc<Config>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "audiohook bridge listening");

    let http = reqwest::Client::new();

    loop {
        let (stream, peer) = listener.accept().await?;
        let config = config.clone();
        let http = http.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, config, http).await {
                warn!(%peer, error = %e, "connection handling failed");
            }
        });
    }
}

/// Branch between the plain-HTTP health check and the AudioHook WebSocket
/// upgrade without consuming bytes the eventual handshake reader still
/// needs: a non-destructive `peek` decides which path to take.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<Config>,
    http: reqwest::Client,
) -> std::io::Result<()> {
    let mut probe = [0u8; 4096];
    let peeked = stream.peek(&mut probe).await?;

    if !looks_like_websocket_upgrade(&probe[..peeked]) {
        return serve_plain_http(stream).await;
    }

    let api_key = config.carrier_api_key.clone();
    let callback = move |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        validate_audiohook_handshake(req, response, &api_key)
    };

    match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => {
            info!(%peer, "accepted audiohook session");
            session::run(ws, config, http).await;
        }
        Err(e) => warn!(%peer, error = %e, "audiohook handshake rejected"),
    }
    Ok(())
}

fn looks_like_websocket_upgrade(peeked: &[u8]) -> bool {
    let text = String::from_utf8_lossy(peeked).to_ascii_lowercase();
    text.lines().any(|line| line.starts_with("upgrade:") && line.contains("websocket"))
}

/// Carrier-side handshake validation. Runs after `tungstenite`'s own
/// Connection/Upgrade/Sec-WebSocket-* checks have already produced the
/// default 101 response in `response`; this layer adds the AudioHook-specific
/// path, API key, and header checks on top, short-circuiting with a custom
/// status + body on rejection.
fn validate_audiohook_handshake(req: &Request, response: Response, api_key: &str) -> Result<Response, ErrorResponse> {
    let path = req.uri().path();
    if path != AUDIOHOOK_PATH {
        return Err(handshake_rejection(HandshakeError::UnknownPath(path.to_string())));
    }

    let header = |name: &str| req.headers().get(name).and_then(|v| v.to_str().ok());

    match header("x-api-key") {
        None => return Err(handshake_rejection(HandshakeError::MissingApiKey)),
        Some(k) if k != api_key => return Err(handshake_rejection(HandshakeError::InvalidApiKey)),
        Some(_) => {}
    }

    let missing: Vec<&'static str> =
        REQUIRED_AUDIOHOOK_HEADERS.iter().copied().filter(|h| header(h).is_none()).collect();
    if !missing.is_empty() {
        return Err(handshake_rejection(HandshakeError::MissingHeaders(missing)));
    }

    Ok(response)
}

fn handshake_rejection(err: HandshakeError) -> ErrorResponse {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_REQUEST);
    text_response(status, &format!("{err}\n"))
}

fn text_response(status: StatusCode, body: &str) -> ErrorResponse {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Some(body.to_string()))
        .expect("static handshake rejection response is always well-formed")
}

/// A GET at `/` without an `Upgrade` header is a liveness check; anything
/// else reaching this path (no Upgrade header present) is a 404.
async fn serve_plain_http(mut stream: TcpStream) -> std::io::Result<()> {
    let mut head = Vec::with_capacity(512);
    read_request_head(&mut stream, &mut head).await?;

    let request_line = head.split(|&b| b == b'\n').next().unwrap_or(&[]);
    let request_line = String::from_utf8_lossy(request_line);
    let path = request_line.split_whitespace().nth(1).unwrap_or("");

    let (status_line, body) =
        if path == "/" { ("HTTP/1.1 200 OK", "OK\n") } else { ("HTTP/1.1 404 Not Found", "") };

    let response = format!("{status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}", body.len());
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Read raw bytes until the blank line terminating an HTTP request head, or
/// give up past a generous size guard (malformed/truncated request).
async fn read_request_head(stream: &mut TcpStream, buf: &mut Vec<u8>) -> std::io::Result<()> {
    let mut chunk = [0u8; 512];
    loop {
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(());
        }
        if buf.len() > 8192 {
            return Ok(());
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_websocket_upgrade_header_case_insensitively() {
        let req = b"GET /audiohook HTTP/1.1\r\nHost: x\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\n\r\n";
        assert!(looks_like_websocket_upgrade(req));
    }

    #[test]
    fn plain_get_is_not_an_upgrade() {
        let req = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        assert!(!looks_like_websocket_upgrade(req));
    }
}
