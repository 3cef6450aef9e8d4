//! Bootstrap: load configuration, initialize logging, then bind and serve
//! the carrier AudioHook WebSocket listener until the process is terminated.
//!
//! Grounded on the teacher's `main.rs` (`#[tokio::main]`, ordered
//! config-then-logging-then-serve bootstrap), generalized from a
//! Unix-socket IPC entrypoint to a TCP WebSocket listener.

mod audio_constants;
mod audiohook;
mod codec;
mod config;
mod error;
mod logging;
mod pacer;
mod prompt;
mod provider;
mod rate_limiter;
mod server;
mod session;
mod tools;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info};

use config::Config;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    logging::init(config.debug);

    let addr: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string())
        .parse()
        .unwrap_or_else(|e| {
            error!(error = %e, "invalid BIND_ADDR");
            std::process::exit(1);
        });

    info!(%addr, "starting audiohook bridge");

    if let Err(e) = server::serve(addr, Arc::new(config)).await {
        error!(error = %e, "server terminated");
        std::process::exit(1);
    }
}
