//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::constants::{server, stt};
use crate::ConfigError;

/// Application settings.
///
/// Every field has a default so a partially configured process can still
/// start and report what is missing; the `*_configured` helpers gate the
/// operations that need credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// HPB signaling endpoint (http/https/ws/wss; normalized before use).
    #[serde(default)]
    pub hpb_url: String,

    /// Shared secret for the signaling `hello` HMAC.
    #[serde(default)]
    pub hpb_internal_secret: String,

    /// Nextcloud base URL; used for the hello `backend` parameter and the
    /// signaling settings fetch.
    #[serde(default)]
    pub backend_url: String,

    /// Speech service workspace name.
    #[serde(default)]
    pub stt_workspace: String,

    /// Speech service API key.
    #[serde(default)]
    pub stt_key: String,

    /// Speech service API secret.
    #[serde(default)]
    pub stt_secret: String,

    /// Host suffix of the deployed speech service.
    #[serde(default = "default_stt_host_suffix")]
    pub stt_host_suffix: String,

    /// Disable TLS verification on the signaling WebSocket.
    #[serde(default)]
    pub skip_cert_verify: bool,

    /// Signaling reconnect attempts before surfacing failure.
    #[serde(default = "default_max_connection_retries")]
    pub max_connection_retries: u32,

    /// Base of the exponential reconnect backoff, in seconds.
    #[serde(default = "default_retry_backoff_base")]
    pub retry_backoff_base: u64,

    /// Speech service connect timeout in seconds (cold starts are slow).
    #[serde(default = "default_stt_connect_timeout")]
    pub stt_connect_timeout_secs: u64,

    /// Warn when audio has been flowing upstream this long with no result.
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_secs: u64,

    /// Grace period before a room with no recipients leaves the call.
    #[serde(default = "default_call_leave_timeout")]
    pub call_leave_timeout_ms: u64,

    /// Control plane listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level when RUST_LOG is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON.
    #[serde(default)]
    pub log_json: bool,

    /// Hard RSS limit in MB for the memory watchdog; 0 disables it.
    #[serde(default)]
    pub max_memory_mb: u64,
}

fn default_stt_host_suffix() -> String {
    stt::DEFAULT_HOST_SUFFIX.to_string()
}

fn default_max_connection_retries() -> u32 {
    5
}

fn default_retry_backoff_base() -> u64 {
    2
}

fn default_stt_connect_timeout() -> u64 {
    120
}

fn default_stale_timeout() -> u64 {
    30
}

fn default_call_leave_timeout() -> u64 {
    2_000
}

fn default_port() -> u16 {
    server::DEFAULT_PORT
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hpb_url: String::new(),
            hpb_internal_secret: String::new(),
            backend_url: String::new(),
            stt_workspace: String::new(),
            stt_key: String::new(),
            stt_secret: String::new(),
            stt_host_suffix: default_stt_host_suffix(),
            skip_cert_verify: false,
            max_connection_retries: default_max_connection_retries(),
            retry_backoff_base: default_retry_backoff_base(),
            stt_connect_timeout_secs: default_stt_connect_timeout(),
            stale_timeout_secs: default_stale_timeout(),
            call_leave_timeout_ms: default_call_leave_timeout(),
            port: default_port(),
            log_level: default_log_level(),
            log_json: false,
            max_memory_mb: 0,
        }
    }
}

impl Settings {
    /// Whether the signaling side has the options it needs.
    pub fn is_hpb_configured(&self) -> bool {
        !self.hpb_url.is_empty() && !self.hpb_internal_secret.is_empty()
    }

    /// Whether the speech service credentials are present.
    pub fn is_stt_configured(&self) -> bool {
        !self.stt_workspace.is_empty() && !self.stt_key.is_empty() && !self.stt_secret.is_empty()
    }

    /// Validate required options, naming the first missing one.
    pub fn require_hpb(&self) -> Result<(), ConfigError> {
        if self.hpb_url.is_empty() {
            return Err(ConfigError::MissingOption("hpb_url"));
        }
        if self.hpb_internal_secret.is_empty() {
            return Err(ConfigError::MissingOption("hpb_internal_secret"));
        }
        Ok(())
    }
}

/// Load settings from an optional file plus `LT_`-prefixed environment
/// variables; the environment wins.
pub fn load_settings(path: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(File::from(Path::new(path)).required(false));
    }
    let cfg = builder
        .add_source(Environment::with_prefix("LT").try_parsing(true))
        .build()?;

    Ok(cfg.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_not_configured() {
        let settings = Settings::default();
        assert!(!settings.is_hpb_configured());
        assert!(!settings.is_stt_configured());
        assert_eq!(settings.port, 23000);
        assert_eq!(settings.max_connection_retries, 5);
        assert_eq!(settings.retry_backoff_base, 2);
        assert_eq!(settings.call_leave_timeout_ms, 2000);
    }

    #[test]
    fn require_hpb_names_missing_option() {
        let mut settings = Settings::default();
        assert!(matches!(
            settings.require_hpb(),
            Err(ConfigError::MissingOption("hpb_url"))
        ));

        settings.hpb_url = "https://cloud.example.org/standalone-signaling".into();
        assert!(matches!(
            settings.require_hpb(),
            Err(ConfigError::MissingOption("hpb_internal_secret"))
        ));

        settings.hpb_internal_secret = "secret".into();
        assert!(settings.require_hpb().is_ok());
    }

    #[test]
    fn stt_configured_needs_all_three() {
        let mut settings = Settings::default();
        settings.stt_workspace = "acme".into();
        settings.stt_key = "wk-1".into();
        assert!(!settings.is_stt_configured());
        settings.stt_secret = "ws-1".into();
        assert!(settings.is_stt_configured());
    }

    #[test]
    fn deserializes_partial_json() {
        let settings: Settings =
            serde_json::from_str(r#"{"hpb_url": "wss://hpb", "port": 9000}"#).unwrap();
        assert_eq!(settings.hpb_url, "wss://hpb");
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.stale_timeout_secs, 30);
    }
}
