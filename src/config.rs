//! Process-wide configuration, loaded once at startup and passed around as an
//! `Arc<Config>`. The only global mutable state in the bridge is the
//! configuration itself, and it is immutable after construction.

use std::env;
use std::time::Duration;

use crate::error::ConfigError;

/// One phase of the default rate-limit backoff table: if the session has been
/// running for at most `window_secs`, back off for `delay_secs` on a 429 with
/// no carrier-supplied `retryAfter`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPhase {
    pub window_secs: f64,
    pub delay_secs: f64,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Secret the carrier must present in the `x-api-key` header.
    pub carrier_api_key: String,
    /// Bearer credential for the model-provider realtime API.
    pub provider_api_key: String,
    /// Default model id used when the carrier doesn't specify one.
    pub default_model: String,
    pub default_agent_name: String,
    pub default_company_name: String,

    pub pacer_capacity: usize,
    pub frame_send_interval: Duration,

    pub carrier_msg_rate: f64,
    pub carrier_msg_burst: f64,
    pub carrier_binary_rate: f64,
    pub carrier_binary_burst: f64,

    pub rate_limit_max_retries: u32,
    pub rate_limit_phases: Vec<BackoffPhase>,

    pub ending_analysis_prompt: String,
    pub ending_analysis_temperature: f64,

    pub max_data_actions_per_session: u32,
    pub max_tool_invocations_per_session: u32,
    pub max_tool_argument_bytes: usize,
    pub data_action_allowlist: Option<Vec<String>>,

    /// OAuth2 client-credentials pair for the data-action registry. Data
    /// actions are disabled for the process if either is absent.
    pub data_action_client_id: Option<String>,
    pub data_action_client_secret: Option<String>,
    pub data_action_base_url: String,
    pub data_action_login_url: String,
    pub data_action_redact_fields: Vec<String>,

    pub debug: bool,
}

impl Config {
    /// Build configuration from the process environment. Loads a local `.env`
    /// file first, if present, mirroring the source integration's behavior —
    /// but unlike it, a missing `.env` is not itself an error, only missing
    /// required variables are.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let carrier_api_key = require_var("GENESYS_API_KEY")?;
        let provider_api_key = require_var("OPENAI_API_KEY")?;

        let default_model = env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini-realtime-preview".to_string());
        let default_agent_name = env::var("AGENT_NAME").unwrap_or_else(|_| "AI Assistant".to_string());
        let default_company_name = env::var("COMPANY_NAME").unwrap_or_else(|_| "Our Company".to_string());

        let pacer_capacity = parse_env_or(
            "MAX_AUDIO_BUFFER_SIZE",
            crate::audio_constants::DEFAULT_PACER_CAPACITY,
        )?;
        let frame_send_interval_secs = parse_env_or::<f64>(
            "AUDIO_FRAME_SEND_INTERVAL",
            crate::audio_constants::DEFAULT_FRAME_SEND_INTERVAL_SECS,
        )?;

        let carrier_msg_rate = parse_env_or("GENESYS_MSG_RATE_LIMIT", 5.0)?;
        let carrier_msg_burst = parse_env_or("GENESYS_MSG_BURST_LIMIT", 25.0)?;
        let carrier_binary_rate = parse_env_or("GENESYS_BINARY_RATE_LIMIT", 5.0)?;
        let carrier_binary_burst = parse_env_or("GENESYS_BINARY_BURST_LIMIT", 25.0)?;

        let rate_limit_max_retries = parse_env_or("RATE_LIMIT_MAX_RETRIES", 3u32)?;
        let rate_limit_phases = vec![
            BackoffPhase { window_secs: 300.0, delay_secs: 3.0 },
            BackoffPhase { window_secs: 600.0, delay_secs: 9.0 },
            BackoffPhase { window_secs: f64::INFINITY, delay_secs: 27.0 },
        ];

        let ending_analysis_prompt = env::var("ENDING_PROMPT").unwrap_or_else(|_| {
            "Please analyze this conversation and provide a structured summary including: \
             main_topics, key_decisions, action_items, sentiment."
                .to_string()
        });
        let ending_analysis_temperature = parse_env_or("ENDING_TEMPERATURE", 0.2)?;

        let max_data_actions_per_session = parse_env_or("GENESYS_MAX_TOOLS_PER_SESSION", 10u32)?;
        let max_tool_invocations_per_session =
            parse_env_or("GENESYS_MAX_ACTION_CALLS_PER_SESSION", 20u32)?;
        let max_tool_argument_bytes = parse_env_or("GENESYS_MAX_TOOL_ARGUMENT_BYTES", 8192usize)?;

        let data_action_allowlist = env::var("GENESYS_ALLOWED_DATA_ACTION_IDS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty());

        let debug = env::var("DEBUG")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let data_action_client_id = env::var("GENESYS_CLIENT_ID").ok().filter(|v| !v.is_empty());
        let data_action_client_secret = env::var("GENESYS_CLIENT_SECRET").ok().filter(|v| !v.is_empty());
        let region = env::var("GENESYS_REGION").ok().filter(|v| !v.is_empty());
        let data_action_base_url = env::var("GENESYS_BASE_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or_else(|| derive_genesys_url("api", region.as_deref()));
        let data_action_login_url = env::var("GENESYS_LOGIN_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or_else(|| derive_genesys_url("login", region.as_deref()));
        let data_action_redact_fields = env::var("GENESYS_TOOL_OUTPUT_REDACTION_FIELDS")
            .ok()
            .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        Ok(Config {
            carrier_api_key,
            provider_api_key,
            default_model,
            default_agent_name,
            default_company_name,
            pacer_capacity,
            frame_send_interval: Duration::from_secs_f64(frame_send_interval_secs),
            carrier_msg_rate,
            carrier_msg_burst,
            carrier_binary_rate,
            carrier_binary_burst,
            rate_limit_max_retries,
            rate_limit_phases,
            ending_analysis_prompt,
            ending_analysis_temperature,
            max_data_actions_per_session,
            max_tool_invocations_per_session,
            max_tool_argument_bytes,
            data_action_allowlist,
            data_action_client_id,
            data_action_client_secret,
            data_action_base_url,
            data_action_login_url,
            data_action_redact_fields,
            debug,
        })
    }

    /// Look up the default backoff delay for a session of the given age, per
    /// the phase table. Falls back to the last phase's delay.
    pub fn backoff_delay_for_session_age(&self, session_age_secs: f64) -> f64 {
        self.rate_limit_phases
            .iter()
            .find(|phase| session_age_secs <= phase.window_secs)
            .or_else(|| self.rate_limit_phases.last())
            .map(|phase| phase.delay_secs)
            .unwrap_or(27.0)
    }
}

/// Derive a Genesys Cloud API or login base URL from a region code, mirroring
/// `genesys_actions.py::_derive_api_base_url`/`_derive_login_url`. Falls back
/// to the public `mypurecloud.com` region when no region is configured.
fn derive_genesys_url(subdomain: &str, region: Option<&str>) -> String {
    match region {
        Some(region) if region.contains("mypurecloud.com") || region.contains("mypurecloud.de") => {
            format!("https://{subdomain}.{region}")
        }
        Some(region) => format!("https://{subdomain}.{region}.mypurecloud.com"),
        None => format!("https://{subdomain}.mypurecloud.com"),
    }
}

fn require_var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingVar(name))
}

fn parse_env_or<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match env::var(name) {
        Ok(raw) => raw.parse::<T>().map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phases() -> Vec<BackoffPhase> {
        vec![
            BackoffPhase { window_secs: 300.0, delay_secs: 3.0 },
            BackoffPhase { window_secs: 600.0, delay_secs: 9.0 },
            BackoffPhase { window_secs: f64::INFINITY, delay_secs: 27.0 },
        ]
    }

    #[test]
    fn backoff_phase_lookup_picks_first_matching_window() {
        let cfg = Config {
            carrier_api_key: "k".into(),
            provider_api_key: "k".into(),
            default_model: "m".into(),
            default_agent_name: "a".into(),
            default_company_name: "c".into(),
            pacer_capacity: 50,
            frame_send_interval: Duration::from_millis(150),
            carrier_msg_rate: 5.0,
            carrier_msg_burst: 25.0,
            carrier_binary_rate: 5.0,
            carrier_binary_burst: 25.0,
            rate_limit_max_retries: 3,
            rate_limit_phases: phases(),
            ending_analysis_prompt: String::new(),
            ending_analysis_temperature: 0.2,
            max_data_actions_per_session: 10,
            max_tool_invocations_per_session: 20,
            max_tool_argument_bytes: 8192,
            data_action_allowlist: None,
            data_action_client_id: None,
            data_action_client_secret: None,
            data_action_base_url: "https://api.mypurecloud.com".to_string(),
            data_action_login_url: "https://login.mypurecloud.com".to_string(),
            data_action_redact_fields: Vec::new(),
            debug: false,
        };

        assert_eq!(cfg.backoff_delay_for_session_age(10.0), 3.0);
        assert_eq!(cfg.backoff_delay_for_session_age(450.0), 9.0);
        assert_eq!(cfg.backoff_delay_for_session_age(10_000.0), 27.0);
    }

    #[test]
    fn derives_default_genesys_urls_without_region_or_override() {
        assert_eq!(derive_genesys_url("api", None), "https://api.mypurecloud.com");
        assert_eq!(derive_genesys_url("login", None), "https://login.mypurecloud.com");
    }

    #[test]
    fn derives_genesys_urls_from_region_code() {
        assert_eq!(derive_genesys_url("api", Some("usw2.pure.cloud")), "https://api.usw2.pure.cloud.mypurecloud.com");
        assert_eq!(derive_genesys_url("api", Some("mypurecloud.de")), "https://api.mypurecloud.de");
    }
}
