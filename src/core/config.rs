use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

fn default_initial_credit_cap() -> u32 {
    300
}

fn default_scheduled_credit_cap_ms() -> u64 {
    500
}

fn default_dtx_timeout_secs() -> u64 {
    60
}

/// Per-session tunables for the session engine.
///
/// A zero `max_session_rate` disables producer rate flow control entirely.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Maximum messages per second a producer may publish (0 = unlimited).
    #[serde(default)]
    pub max_session_rate: u32,
    /// Upper bound on the initial producer credit grant.
    #[serde(default = "default_initial_credit_cap")]
    pub initial_credit_cap: u32,
    /// Cap on the delay before the scheduled credit retry fires.
    #[serde(default = "default_scheduled_credit_cap_ms")]
    pub scheduled_credit_cap_ms: u64,
    /// Default distributed-transaction timeout.
    #[serde(default = "default_dtx_timeout_secs")]
    pub dtx_default_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_session_rate: 0,
            initial_credit_cap: default_initial_credit_cap(),
            scheduled_credit_cap_ms: default_scheduled_credit_cap_ms(),
            dtx_default_timeout_secs: default_dtx_timeout_secs(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML or JSON file, keyed by extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading session config {}", path.display()))?;
        if path.extension().is_some_and(|ext| ext == "json") {
            Ok(serde_json::from_str(&data)
                .with_context(|| format!("parsing session config {}", path.display()))?)
        } else {
            Ok(toml::from_str(&data)
                .with_context(|| format!("parsing session config {}", path.display()))?)
        }
    }
}
