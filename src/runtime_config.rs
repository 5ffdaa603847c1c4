// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian engine. Every tunable parameter
// lives here so that the engine can be reconfigured at runtime without a
// restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_venue_api_url() -> String {
    "https://api.hyperliquid.xyz".to_string()
}

fn default_venue_ws_url() -> String {
    "wss://api.hyperliquid.xyz/ws".to_string()
}

fn default_db_path() -> String {
    "meridian.db".to_string()
}

fn default_candle_interval() -> String {
    "1m".to_string()
}

fn default_snapshot_cadence_secs() -> u64 {
    60
}

fn default_heartbeat_minutes() -> u64 {
    30
}

fn default_trigger_poll_secs() -> u64 {
    10
}

fn default_venue_deadline_secs() -> u64 {
    10
}

fn default_reasoning_deadline_secs() -> u64 {
    60
}

fn default_db_deadline_secs() -> u64 {
    5
}

fn default_platform_provider() -> String {
    "openai".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o".to_string()
}

fn default_anthropic_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_provider_concurrency() -> usize {
    4
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Transport -----------------------------------------------------------

    /// Bind address for the bridge API server.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // --- Venue ---------------------------------------------------------------

    /// Base URL of the venue's info + exchange HTTP endpoints.
    #[serde(default = "default_venue_api_url")]
    pub venue_api_url: String,

    /// URL of the venue's public market-data websocket.
    #[serde(default = "default_venue_ws_url")]
    pub venue_ws_url: String,

    // --- Persistence ---------------------------------------------------------

    /// Path of the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    // --- Control loop --------------------------------------------------------

    /// Candle interval fed to the indicator engine for every monitored symbol.
    #[serde(default = "default_candle_interval")]
    pub candle_interval: String,

    /// Cadence of periodic portfolio snapshots while any monitor is active.
    #[serde(default = "default_snapshot_cadence_secs")]
    pub snapshot_cadence_secs: u64,

    /// Fixed safety-heartbeat period for every control loop. Independent of
    /// any account's monitoring frequency; guarantees liveness when no
    /// trigger fires.
    #[serde(default = "default_heartbeat_minutes")]
    pub default_heartbeat_minutes: u64,

    /// Internal tick at which trigger supervisors sample the indicator engine.
    /// This is not the monitoring frequency.
    #[serde(default = "default_trigger_poll_secs")]
    pub trigger_poll_secs: u64,

    // --- RPC deadlines -------------------------------------------------------

    #[serde(default = "default_venue_deadline_secs")]
    pub venue_deadline_secs: u64,

    #[serde(default = "default_reasoning_deadline_secs")]
    pub reasoning_deadline_secs: u64,

    #[serde(default = "default_db_deadline_secs")]
    pub db_deadline_secs: u64,

    // --- Reasoning providers -------------------------------------------------

    /// Platform-default provider used when an account has no personal key:
    /// "openai" or "anthropic".
    #[serde(default = "default_platform_provider")]
    pub platform_provider: String,

    #[serde(default = "default_openai_model")]
    pub openai_model: String,

    #[serde(default = "default_anthropic_model")]
    pub anthropic_model: String,

    /// Maximum concurrent in-flight requests per provider. Excess invocations
    /// queue with a bounded wait, then fail rate-limited.
    #[serde(default = "default_provider_concurrency")]
    pub provider_concurrency: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            venue_api_url: default_venue_api_url(),
            venue_ws_url: default_venue_ws_url(),
            db_path: default_db_path(),
            candle_interval: default_candle_interval(),
            snapshot_cadence_secs: default_snapshot_cadence_secs(),
            default_heartbeat_minutes: default_heartbeat_minutes(),
            trigger_poll_secs: default_trigger_poll_secs(),
            venue_deadline_secs: default_venue_deadline_secs(),
            reasoning_deadline_secs: default_reasoning_deadline_secs(),
            db_deadline_secs: default_db_deadline_secs(),
            platform_provider: default_platform_provider(),
            openai_model: default_openai_model(),
            anthropic_model: default_anthropic_model(),
            provider_concurrency: default_provider_concurrency(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            venue = %config.venue_api_url,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise runtime config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}
