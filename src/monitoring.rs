// =============================================================================
// Monitoring Manager — one supervised control loop per active account
// =============================================================================
//
// A monitor owns its account's trigger supervisors and a wake loop: it ticks
// on trigger events and on a fixed-period safety heartbeat when no trigger
// has fired, guaranteeing liveness even when every indicator plateaus. The
// heartbeat period is independent of the account's monitoring frequency (the
// frequency only gates whether the loop runs at all and the restore-time
// catch-up decision). Each tick gathers venue + indicator
// context, consults the reasoning router, and (for active-mode accounts)
// pipes the returned actions through the executor. Passive accounts record
// the plan only.
//
// Cancellation: stop() cancels the account's token. The wake loop observes
// it between ticks and between network calls inside supervisors; a tick in
// progress runs to completion with its effects applied before the task exits.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app_state::{DecisionRecord, Telemetry};
use crate::error::EngineError;
use crate::executor::{ActionOutcome, TradeExecutor};
use crate::indicators::{IndicatorEngine, SeriesKey};
use crate::market_data::{normalize_symbol, MarketDataHub};
use crate::reasoning::{InvokeRequest, ReasoningRouter};
use crate::regime::classify_regime;
use crate::store::Store;
use crate::triggers::spec::parse_triggers;
use crate::triggers::{spawn_strategy_supervisor, TriggerEvent, WakeKind};
use crate::types::{AgentMode, PositionSide, VerificationStatus};
use crate::venue::client::VenueClient;
use crate::venue::types::VenueOrder;

/// Minimum monitoring frequency once an account goes active.
pub const MIN_ACTIVE_FREQUENCY_MINUTES: u64 = 5;

/// Fixed safety-heartbeat period. Fires when no trigger has woken the loop
/// for this long, regardless of the account's monitoring frequency.
pub const HEARTBEAT_PERIOD_MINUTES: u64 = 30;

// ---------------------------------------------------------------------------
// Order-role inference (context assembly, not the venue layer)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderRole {
    Entry,
    TakeProfit,
    StopLoss,
}

/// Infer an open order's role from its trigger price relative to the current
/// price and the position side.
pub fn infer_order_role(
    order: &VenueOrder,
    current_px: f64,
    position_side: Option<PositionSide>,
) -> OrderRole {
    if !order.reduce_only {
        return OrderRole::Entry;
    }
    let reference = order.trigger_px.unwrap_or(order.limit_px);
    match position_side {
        Some(PositionSide::Long) => {
            if reference > current_px {
                OrderRole::TakeProfit
            } else {
                OrderRole::StopLoss
            }
        }
        Some(PositionSide::Short) => {
            if reference < current_px {
                OrderRole::TakeProfit
            } else {
                OrderRole::StopLoss
            }
        }
        None => OrderRole::Entry,
    }
}

/// Whether a restored monitor should tick immediately: true when at least
/// `interval_minutes` have elapsed since the last monitoring log row.
pub fn should_run_immediately(
    last_log_at: Option<DateTime<Utc>>,
    interval_minutes: u64,
    now: DateTime<Utc>,
) -> bool {
    match last_log_at {
        None => true,
        Some(last) => now - last >= chrono::Duration::minutes(interval_minutes as i64),
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct MonitorHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
    interval_minutes: u64,
}

pub struct MonitoringManager {
    store: Arc<Store>,
    venue: Arc<VenueClient>,
    engine: Arc<IndicatorEngine>,
    hub: Arc<MarketDataHub>,
    router: Arc<ReasoningRouter>,
    executor: Arc<TradeExecutor>,
    telemetry: Arc<Telemetry>,
    candle_interval: String,
    trigger_poll: Duration,
    heartbeat: Duration,
    monitors: parking_lot::Mutex<HashMap<String, MonitorHandle>>,
}

impl MonitoringManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        venue: Arc<VenueClient>,
        engine: Arc<IndicatorEngine>,
        hub: Arc<MarketDataHub>,
        router: Arc<ReasoningRouter>,
        executor: Arc<TradeExecutor>,
        telemetry: Arc<Telemetry>,
        candle_interval: String,
        trigger_poll: Duration,
        heartbeat_minutes: u64,
    ) -> Arc<Self> {
        // A zero heartbeat would defeat the liveness guarantee; fall back to
        // the fixed period.
        let minutes = if heartbeat_minutes == 0 {
            HEARTBEAT_PERIOD_MINUTES
        } else {
            heartbeat_minutes
        };
        Arc::new(Self {
            store,
            venue,
            engine,
            hub,
            router,
            executor,
            telemetry,
            candle_interval,
            trigger_poll,
            heartbeat: Duration::from_secs(minutes * 60),
            monitors: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn is_monitored(&self, account_id: &str) -> bool {
        self.monitors.lock().contains_key(account_id)
    }

    pub fn monitored_accounts(&self) -> Vec<(String, u64)> {
        self.monitors
            .lock()
            .iter()
            .map(|(id, h)| (id.clone(), h.interval_minutes))
            .collect()
    }

    /// Start the control loop for an account. A frequency of zero means the
    /// loop stays suspended.
    pub fn start(
        self: &Arc<Self>,
        account_id: &str,
        interval_minutes: u64,
        run_immediately: bool,
    ) -> Result<(), EngineError> {
        if interval_minutes == 0 {
            debug!(account_id, "monitoring frequency 0 — loop stays suspended");
            return Ok(());
        }
        if self.is_monitored(account_id) {
            return Ok(());
        }

        let account = self
            .store
            .get_account(account_id)
            .map_err(|e| EngineError::Invariant(format!("account lookup failed: {e}")))?
            .ok_or_else(|| {
                EngineError::invalid("account_id", format!("unknown account {account_id}"))
            })?;
        if account.verification_status != VerificationStatus::Approved {
            return Err(EngineError::invalid(
                "account_id",
                format!("account {account_id} is not approved"),
            ));
        }

        let cancel = CancellationToken::new();
        let manager = self.clone();
        let id = account_id.to_string();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            manager.run_monitor(id, run_immediately, token).await;
        });

        self.monitors.lock().insert(
            account_id.to_string(),
            MonitorHandle {
                cancel,
                join,
                interval_minutes,
            },
        );
        info!(account_id, interval_minutes, "monitor started");
        Ok(())
    }

    /// Cancel the account's loop. The cancellation is observed at the next
    /// suspension point; a tick in flight completes first.
    pub fn stop(&self, account_id: &str) -> bool {
        if let Some(handle) = self.monitors.lock().remove(account_id) {
            handle.cancel.cancel();
            // The task drains naturally once the token lands; the join handle
            // is dropped, not aborted, so an in-flight tick completes.
            drop(handle.join);
            info!(account_id, "monitor stop requested");
            true
        } else {
            false
        }
    }

    pub fn restart(
        self: &Arc<Self>,
        account_id: &str,
        interval_minutes: u64,
    ) -> Result<(), EngineError> {
        self.stop(account_id);
        self.start(account_id, interval_minutes, false)
    }

    /// Restore monitors for every active + approved account. Whether to tick
    /// immediately is decided by the last monitoring log entry.
    pub fn restore_all(self: &Arc<Self>) {
        let accounts = match self.store.active_approved_accounts() {
            Ok(accounts) => accounts,
            Err(e) => {
                error!(error = %e, "failed to enumerate accounts for restore");
                return;
            }
        };

        let now = Utc::now();
        for account in accounts {
            if account.monitoring_frequency_minutes == 0 {
                continue;
            }
            let last = self
                .store
                .last_monitoring_log(&account.id)
                .ok()
                .flatten()
                .and_then(|row| DateTime::parse_from_rfc3339(&row.created_at).ok())
                .map(|t| t.with_timezone(&Utc));
            let immediately =
                should_run_immediately(last, account.monitoring_frequency_minutes, now);

            if let Err(e) = self.start(
                &account.id,
                account.monitoring_frequency_minutes,
                immediately,
            ) {
                error!(account_id = %account.id, error = %e, "monitor restore failed");
            }
        }
        info!(
            count = self.monitors.lock().len(),
            "monitors restored for active accounts"
        );
    }

    // -------------------------------------------------------------------------
    // The control loop
    // -------------------------------------------------------------------------

    async fn run_monitor(
        self: Arc<Self>,
        account_id: String,
        run_immediately: bool,
        cancel: CancellationToken,
    ) {
        let strategies = match self.store.active_strategies(&account_id) {
            Ok(strategies) => strategies,
            Err(e) => {
                error!(account_id, error = %e, "failed to load strategies — monitor exiting");
                return;
            }
        };

        // Keep candles flowing for every symbol the strategies reference.
        let symbols = strategy_symbols(&strategies);
        for symbol in &symbols {
            self.hub.pin_candles(symbol, &self.candle_interval);
        }

        // One supervisor per strategy with triggers.
        let (event_tx, mut event_rx) = mpsc::channel::<TriggerEvent>(32);
        let mut supervisors = Vec::new();
        for strategy in &strategies {
            let specs = match parse_triggers(&strategy.config) {
                Ok(specs) => specs,
                Err(e) => {
                    warn!(account_id, strategy = %strategy.id, error = %e, "trigger config unreadable");
                    continue;
                }
            };
            if specs.is_empty() {
                continue;
            }
            supervisors.push(spawn_strategy_supervisor(
                self.engine.clone(),
                account_id.clone(),
                strategy.id.clone(),
                specs,
                self.candle_interval.clone(),
                self.trigger_poll,
                event_tx.clone(),
                cancel.child_token(),
            ));
        }
        // Hold one sender so recv() blocks (instead of returning None) for
        // accounts whose strategies carry no triggers.
        let _event_keepalive = event_tx;

        let heartbeat = self.heartbeat;
        let default_strategy = strategies.first().map(|s| s.id.clone()).unwrap_or_default();

        if run_immediately && !cancel.is_cancelled() {
            self.tick(&account_id, TriggerEvent::heartbeat(&account_id), &default_strategy)
                .await;
        }

        loop {
            let wake = tokio::select! {
                _ = cancel.cancelled() => break,
                event = event_rx.recv() => {
                    match event {
                        Some(mut event) => {
                            // Coalesce triggers that fired on the same tick
                            // across strategies into one wake.
                            while let Ok(more) = event_rx.try_recv() {
                                event.fired.extend(more.fired);
                            }
                            event
                        }
                        None => TriggerEvent::heartbeat(&account_id),
                    }
                }
                _ = tokio::time::sleep(heartbeat) => TriggerEvent::heartbeat(&account_id),
            };

            let strategy_id = if wake.strategy_id.is_empty() {
                default_strategy.clone()
            } else {
                wake.strategy_id.clone()
            };
            self.tick(&account_id, wake, &strategy_id).await;

            if cancel.is_cancelled() {
                break;
            }
        }

        for handle in supervisors {
            handle.abort();
        }
        for symbol in &symbols {
            self.hub.unpin_candles(symbol, &self.candle_interval);
        }
        info!(account_id, "monitor exited");
    }

    /// One full control-loop tick. Runs to completion once entered; all
    /// failures are recorded, never propagated.
    async fn tick(&self, account_id: &str, wake: TriggerEvent, strategy_id: &str) {
        let triggered_by = match wake.kind {
            WakeKind::Heartbeat => "heartbeat".to_string(),
            WakeKind::Triggered => format!(
                "trigger:{}",
                wake.fired
                    .iter()
                    .map(|f| f.trigger_id.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            ),
        };
        debug!(account_id, %triggered_by, "monitor tick");

        let account = match self.store.get_account(account_id) {
            Ok(Some(account)) => account,
            _ => {
                warn!(account_id, "account vanished mid-monitor");
                return;
            }
        };

        let Some(address) = account.main_wallet_address.clone() else {
            self.log_tick(account_id, "error", &triggered_by, "no main wallet address on file");
            return;
        };

        // 1. Venue context.
        let user_state = match self.venue.user_state(&address).await {
            Ok(state) => state,
            Err(e) => {
                self.telemetry
                    .push_error(format!("user state fetch failed for {account_id}: {e}"));
                self.log_tick(account_id, "error", &triggered_by, &format!("venue: {e}"));
                return;
            }
        };
        let open_orders = self.venue.open_orders(&address).await.unwrap_or_default();

        // 2. Indicator + regime summary.
        let context = self.build_context(account_id, &wake, &user_state, &open_orders);

        // 3. Reasoning.
        let prompt = match wake.kind {
            WakeKind::Heartbeat => {
                "Periodic safety review: assess current positions and market state.".to_string()
            }
            WakeKind::Triggered => format!(
                "Triggers fired: {}. Decide whether to act.",
                wake.fired
                    .iter()
                    .map(|f| {
                        format!("{} ({} at {:.4}, threshold {:.4})", f.trigger_id, f.symbol, f.value, f.threshold)
                    })
                    .collect::<Vec<_>>()
                    .join("; ")
            ),
        };

        let outcome = match self
            .router
            .invoke(&InvokeRequest {
                account_id: account_id.to_string(),
                prompt: prompt.clone(),
                context,
                preferred_provider: None,
                model: None,
            })
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.telemetry
                    .push_error(format!("reasoning failed for {account_id}: {e}"));
                self.log_tick(account_id, "error", &triggered_by, &format!("reasoning: {e}"));
                return;
            }
        };

        // 4. Execution (or plan recording for passive accounts).
        let passive = account.agent_mode == AgentMode::Passive;
        let outcomes = self
            .executor
            .execute_batch(account_id, strategy_id, &outcome.actions, passive)
            .await;

        let executed = outcomes.iter().filter(|o| o.is_executed()).count();
        let needs_credentials = outcomes.iter().any(|o| {
            matches!(
                o,
                ActionOutcome::Failed {
                    needs_credentials: true,
                    ..
                }
            )
        });

        self.telemetry.push_decision(DecisionRecord {
            account_id: account_id.to_string(),
            strategy_id: strategy_id.to_string(),
            triggered_by: triggered_by.clone(),
            interpretation: outcome.interpretation.clone(),
            action_count: outcome.actions.len(),
            executed,
            at: Utc::now().to_rfc3339(),
        });

        // 5. Monitoring log row.
        let summary = format!(
            "{} actions, {} executed{}",
            outcome.actions.len(),
            executed,
            if passive { " (passive)" } else { "" }
        );
        self.log_tick(account_id, "ok", &triggered_by, &summary);

        // Credential failures pause the monitor; they are never retried
        // locally.
        if needs_credentials {
            let _ = self.store.set_strategy_status(strategy_id, "needs_credentials");
            self.telemetry.push_error(format!(
                "monitor for {account_id} paused: agent credentials missing or rejected"
            ));
            self.log_tick(account_id, "paused", &triggered_by, "needs credentials");
            self.stop(account_id);
        }
    }

    fn build_context(
        &self,
        account_id: &str,
        wake: &TriggerEvent,
        user_state: &crate::venue::types::UserState,
        open_orders: &[VenueOrder],
    ) -> serde_json::Value {
        let mut indicator_summaries = serde_json::Map::new();
        let mut regimes = serde_json::Map::new();

        let symbols: Vec<String> = match self.store.active_strategies(account_id) {
            Ok(strategies) => strategy_symbols(&strategies),
            Err(_) => Vec::new(),
        };
        for symbol in &symbols {
            let key = SeriesKey::new(symbol.clone(), self.candle_interval.clone());
            let snapshot = self.engine.snapshot(&key);
            let summary = classify_regime(&self.engine.closes(&key, 100));
            indicator_summaries.insert(
                symbol.clone(),
                serde_json::to_value(&snapshot).unwrap_or_default(),
            );
            regimes.insert(
                symbol.clone(),
                serde_json::to_value(summary).unwrap_or_default(),
            );
        }

        let orders_with_roles: Vec<serde_json::Value> = open_orders
            .iter()
            .map(|order| {
                let position_side = user_state
                    .positions
                    .iter()
                    .find(|p| p.symbol == order.symbol)
                    .map(|p| p.side);
                let key = SeriesKey::new(order.symbol.clone(), self.candle_interval.clone());
                let current = self.engine.last_close(&key).unwrap_or(order.limit_px);
                json!({
                    "order": order,
                    "role": infer_order_role(order, current, position_side),
                })
            })
            .collect();

        let learnings: Vec<serde_json::Value> = self
            .store
            .active_learnings(account_id)
            .map(|mut records| {
                records.sort_by(|a, b| {
                    b.effective_confidence()
                        .partial_cmp(&a.effective_confidence())
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                records
                    .into_iter()
                    .take(5)
                    .map(|r| json!({ "lesson": r.content, "confidence": r.effective_confidence() }))
                    .collect()
            })
            .unwrap_or_default();

        json!({
            "accountValue": user_state.account_value,
            "totalMarginUsed": user_state.total_margin_used,
            "withdrawable": user_state.withdrawable,
            "positions": user_state.positions,
            "openOrders": orders_with_roles,
            "indicators": indicator_summaries,
            "regimes": regimes,
            "firedTriggers": wake.fired,
            "learnings": learnings,
        })
    }

    fn log_tick(&self, account_id: &str, state: &str, triggered_by: &str, outcome: &str) {
        if let Err(e) = self
            .store
            .append_monitoring_log(account_id, state, triggered_by, outcome)
        {
            error!(account_id, error = %e, "failed to write monitoring log");
        }
        self.telemetry.increment_version();
    }
}

impl std::fmt::Debug for MonitoringManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoringManager")
            .field("monitors", &self.monitors.lock().len())
            .finish()
    }
}

fn strategy_symbols(strategies: &[crate::store::StrategyRow]) -> Vec<String> {
    let mut symbols: Vec<String> = strategies
        .iter()
        .filter_map(|s| s.config.get("symbols"))
        .filter_map(|v| v.as_array())
        .flatten()
        .filter_map(|v| v.as_str())
        .map(normalize_symbol)
        .collect();
    symbols.sort();
    symbols.dedup();
    symbols
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn order(reduce_only: bool, limit_px: f64, trigger_px: Option<f64>) -> VenueOrder {
        VenueOrder {
            oid: 1,
            symbol: "BTC".into(),
            is_buy: false,
            limit_px,
            size: 0.01,
            orig_size: 0.01,
            trigger_px,
            reduce_only,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn role_inference_for_longs() {
        // Reduce-only above market on a long: take profit.
        let role = infer_order_role(&order(true, 45000.0, None), 43000.0, Some(PositionSide::Long));
        assert_eq!(role, OrderRole::TakeProfit);

        // Reduce-only below market on a long: stop loss.
        let role = infer_order_role(&order(true, 41000.0, None), 43000.0, Some(PositionSide::Long));
        assert_eq!(role, OrderRole::StopLoss);
    }

    #[test]
    fn role_inference_for_shorts_inverts() {
        let role =
            infer_order_role(&order(true, 41000.0, None), 43000.0, Some(PositionSide::Short));
        assert_eq!(role, OrderRole::TakeProfit);

        let role =
            infer_order_role(&order(true, 45000.0, None), 43000.0, Some(PositionSide::Short));
        assert_eq!(role, OrderRole::StopLoss);
    }

    #[test]
    fn role_inference_prefers_trigger_price() {
        // Trigger below market even though the limit is above: stop loss.
        let role = infer_order_role(
            &order(true, 45000.0, Some(41000.0)),
            43000.0,
            Some(PositionSide::Long),
        );
        assert_eq!(role, OrderRole::StopLoss);
    }

    #[test]
    fn non_reduce_only_is_entry() {
        let role = infer_order_role(&order(false, 42000.0, None), 43000.0, Some(PositionSide::Long));
        assert_eq!(role, OrderRole::Entry);
    }

    #[test]
    fn run_immediately_decision() {
        let now = Utc::now();
        assert!(should_run_immediately(None, 15, now));
        assert!(should_run_immediately(
            Some(now - ChronoDuration::minutes(20)),
            15,
            now
        ));
        assert!(!should_run_immediately(
            Some(now - ChronoDuration::minutes(5)),
            15,
            now
        ));
    }
}
