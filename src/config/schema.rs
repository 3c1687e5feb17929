//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the dispatcher.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::transport::{OptionValue, TransferOption};

/// Root configuration for a dispatcher run.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum number of concurrently active exchanges.
    pub window_size: usize,

    /// Maximum number of times one logical request may be retried.
    pub max_retries: u32,

    /// Per-request timeout in seconds (whole exchange).
    pub timeout_secs: u64,

    /// Connection establishment timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Upper bound of one blocking wait on the event loop, in milliseconds.
    pub select_timeout_ms: u64,

    /// Delay after every admission, retries included, in milliseconds.
    pub pacing_delay_ms: u64,

    /// First sequence ID handed out in a dispatcher's lifetime.
    pub sequence_origin: u64,

    /// Rounds to retry when nothing at all could be registered.
    pub registration_retries: u32,

    /// PEM bundle of trusted CA certificates.
    pub ca_bundle: Option<PathBuf>,

    /// User-Agent sent unless the request carries its own.
    pub user_agent: String,

    /// Passthrough transfer options, keyed by option name.
    pub options: BTreeMap<String, OptionValue>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            window_size: 5,
            max_retries: 1,
            timeout_secs: 30,
            connect_timeout_secs: 10,
            select_timeout_ms: 1000,
            pacing_delay_ms: 0,
            sequence_origin: 1,
            registration_retries: 3,
            ca_bundle: None,
            user_agent: format!("http-fanout/{}", env!("CARGO_PKG_VERSION")),
            options: BTreeMap::new(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl DispatchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn select_timeout(&self) -> Duration {
        Duration::from_millis(self.select_timeout_ms)
    }

    pub fn pacing_delay(&self) -> Duration {
        Duration::from_millis(self.pacing_delay_ms)
    }

    /// Passthrough options with recognised names.
    ///
    /// Unknown names are reported by validation and skipped here.
    pub fn transfer_options(&self) -> BTreeMap<TransferOption, OptionValue> {
        self.options
            .iter()
            .filter_map(|(name, value)| {
                name.parse::<TransferOption>()
                    .ok()
                    .map(|opt| (opt, value.clone()))
            })
            .collect()
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable ones.
    pub json: bool,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
