// =============================================================================
// Central Application State — Meridian Perps Autopilot
// =============================================================================
//
// The single wiring point for the engine. Subsystems own their state and are
// shared as Arcs; AppState ties them together and builds the snapshot the
// bridge serves over REST and pushes over WebSocket.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot::RwLock for the mutable ring buffers.
//   - Each engine manages its own interior mutability.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::executor::TradeExecutor;
use crate::indicators::IndicatorEngine;
use crate::market_data::MarketDataHub;
use crate::monitoring::MonitoringManager;
use crate::portfolio::PortfolioManager;
use crate::reasoning::ReasoningRouter;
use crate::runtime_config::RuntimeConfig;
use crate::secret_store::SecretStore;
use crate::store::Store;
use crate::venue::client::VenueClient;

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;
/// Maximum number of recent decisions to retain.
const MAX_RECENT_DECISIONS: usize = 100;

// =============================================================================
// Telemetry (shared with the monitoring manager)
// =============================================================================

/// A recorded error event for the operator feed.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub at: String,
}

/// One control-loop decision for the audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub account_id: String,
    pub strategy_id: String,
    pub triggered_by: String,
    pub interpretation: String,
    pub action_count: usize,
    pub executed: usize,
    pub at: String,
}

/// Version counter + capped rings, shared between AppState and the managers
/// that produce events.
pub struct Telemetry {
    /// Monotonically increasing version; the WebSocket feed pushes a fresh
    /// snapshot whenever it changes.
    pub state_version: AtomicU64,
    pub ws_sequence_number: AtomicU64,
    recent_errors: RwLock<Vec<ErrorRecord>>,
    recent_decisions: RwLock<Vec<DecisionRecord>>,
    pub start_time: std::time::Instant,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            state_version: AtomicU64::new(1),
            ws_sequence_number: AtomicU64::new(0),
            recent_errors: RwLock::new(Vec::new()),
            recent_decisions: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }
}

impl Telemetry {
    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn push_error(&self, message: String) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message,
            at: Utc::now().to_rfc3339(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);
        self.increment_version();
    }

    pub fn push_decision(&self, decision: DecisionRecord) {
        let mut decisions = self.recent_decisions.write();
        decisions.push(decision);
        while decisions.len() > MAX_RECENT_DECISIONS {
            decisions.remove(0);
        }
        drop(decisions);
        self.increment_version();
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.read().clone()
    }

    pub fn recent_decisions(&self) -> Vec<DecisionRecord> {
        self.recent_decisions.read().clone()
    }
}

// =============================================================================
// AppState
// =============================================================================

/// Everything the bridge and main wiring need, shared as `Arc<AppState>`.
pub struct AppState {
    pub config: Arc<RwLock<RuntimeConfig>>,
    pub store: Arc<Store>,
    pub secrets: Arc<SecretStore>,
    pub venue: Arc<VenueClient>,
    pub engine: Arc<IndicatorEngine>,
    pub hub: Arc<MarketDataHub>,
    pub router: Arc<ReasoningRouter>,
    pub portfolio: Arc<PortfolioManager>,
    pub executor: Arc<TradeExecutor>,
    pub monitoring: Arc<MonitoringManager>,
    pub telemetry: Arc<Telemetry>,
}

// =============================================================================
// Snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub account_id: String,
    pub interval_minutes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_seconds: u64,
    pub upstream_connected: bool,
    pub monitors: Vec<MonitorSnapshot>,
    pub recent_decisions: Vec<DecisionRecord>,
    pub recent_errors: Vec<ErrorRecord>,
}

impl AppState {
    /// Build the full serialisable snapshot for the REST endpoint and the
    /// WebSocket push feed.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let mut monitors: Vec<MonitorSnapshot> = self
            .monitoring
            .monitored_accounts()
            .into_iter()
            .map(|(account_id, interval_minutes)| MonitorSnapshot {
                account_id,
                interval_minutes,
            })
            .collect();
        monitors.sort_by(|a, b| a.account_id.cmp(&b.account_id));

        StateSnapshot {
            state_version: self.telemetry.current_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_seconds: self.telemetry.start_time.elapsed().as_secs(),
            upstream_connected: self.hub.is_connected(),
            monitors,
            recent_decisions: self.telemetry.recent_decisions(),
            recent_errors: self.telemetry.recent_errors(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_increments_on_pushes() {
        let telemetry = Telemetry::default();
        let v0 = telemetry.current_version();
        telemetry.push_error("boom".into());
        assert_eq!(telemetry.current_version(), v0 + 1);

        telemetry.push_decision(DecisionRecord {
            account_id: "a".into(),
            strategy_id: "s".into(),
            triggered_by: "heartbeat".into(),
            interpretation: "flat".into(),
            action_count: 0,
            executed: 0,
            at: Utc::now().to_rfc3339(),
        });
        assert_eq!(telemetry.current_version(), v0 + 2);
    }

    #[test]
    fn error_ring_is_capped() {
        let telemetry = Telemetry::default();
        for i in 0..60 {
            telemetry.push_error(format!("error {i}"));
        }
        let errors = telemetry.recent_errors();
        assert_eq!(errors.len(), 50);
        assert_eq!(errors[0].message, "error 10");
        assert_eq!(errors.last().unwrap().message, "error 59");
    }

    #[test]
    fn decision_ring_is_capped() {
        let telemetry = Telemetry::default();
        for i in 0..120 {
            telemetry.push_decision(DecisionRecord {
                account_id: format!("acct-{i}"),
                strategy_id: "s".into(),
                triggered_by: "heartbeat".into(),
                interpretation: String::new(),
                action_count: 0,
                executed: 0,
                at: Utc::now().to_rfc3339(),
            });
        }
        assert_eq!(telemetry.recent_decisions().len(), 100);
    }
}
