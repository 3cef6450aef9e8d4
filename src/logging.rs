//! Structured logging bootstrap.
//!
//! The upstream integration this bridge replaces logs through a bespoke
//! per-worker IPC logger (see the teacher's `logging/mod.rs`) because it ships
//! as one of many sibling processes. A standalone bridge binary has no sibling
//! workers to fan logs out to, so this installs a plain `tracing_subscriber`
//! `fmt` layer instead, with verbosity driven by `Config::debug`.

use tracing_subscriber::EnvFilter;

pub fn init(debug: bool) {
    let default_directive = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
