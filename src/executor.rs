// =============================================================================
// Trade Executor — turns validated actions into venue orders
// =============================================================================
//
// Per account, at most one batch runs at a time (a per-account async lock).
// Within a batch every action is admitted, mapped to at most one venue order,
// and recorded; a failing action never aborts the rest of the batch. The
// caller receives one outcome per action.
//
// Mapping:
//   buy/sell -> order at expectedEntry (GTC limit) or an aggressive IOC
//               bound off the last close when no entry is given
//   close    -> reduce-only IOC limit at an aggressive bound, sized to the
//               open position
//   hold     -> no venue call; still writes a journal note
//
// Passive accounts record the full plan and never reach the venue.
// After a non-empty successful batch a portfolio snapshot is enqueued.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::evaluation;
use crate::indicators::{IndicatorEngine, SeriesKey};
use crate::market_data::normalize_symbol;
use crate::portfolio::PortfolioManager;
use crate::reasoning::{ActionKind, TradeAction};
use crate::regime::classify_regime;
use crate::secret_store::SecretStore;
use crate::store::{OrderRow, PositionRow, Store};
use crate::types::PositionSide;
use crate::venue::client::VenueClient;
use crate::venue::types::{OrderRequest, OrderStatus, OrderType, TimeInForce};

/// Price slippage bound for market-style and close orders (fraction).
const AGGRESSIVE_BOUND: f64 = 0.05;

/// Outcome of one action within a batch.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    Executed {
        order_id: String,
        venue_oid: Option<u64>,
    },
    /// Plan or note recorded without touching the venue.
    Noted,
    Skipped {
        reason: String,
    },
    Failed {
        error: String,
        needs_credentials: bool,
    },
}

impl ActionOutcome {
    pub fn is_executed(&self) -> bool {
        matches!(self, Self::Executed { .. })
    }

    fn failed(e: &EngineError) -> Self {
        Self::Failed {
            error: e.to_string(),
            needs_credentials: matches!(e, EngineError::NeedsCredentials(_)),
        }
    }

    fn skipped(e: &EngineError) -> Self {
        Self::Skipped {
            reason: e.to_string(),
        }
    }

    /// Classify a venue or admission error. Invalid parameters (unknown
    /// symbol, bad size or price) mean the action is skipped and the rest of
    /// the batch proceeds with normal bookkeeping; everything else is a
    /// failure.
    fn from_error(e: &EngineError) -> Self {
        match e {
            EngineError::InvalidParams { .. } => Self::skipped(e),
            _ => Self::failed(e),
        }
    }
}

pub struct TradeExecutor {
    venue: Arc<VenueClient>,
    secrets: Arc<SecretStore>,
    store: Arc<Store>,
    portfolio: Arc<PortfolioManager>,
    engine: Arc<IndicatorEngine>,
    candle_interval: String,
    /// One lock per account; acquired for the whole batch.
    locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    snapshot_tx: mpsc::Sender<String>,
}

impl TradeExecutor {
    pub fn new(
        venue: Arc<VenueClient>,
        secrets: Arc<SecretStore>,
        store: Arc<Store>,
        portfolio: Arc<PortfolioManager>,
        engine: Arc<IndicatorEngine>,
        candle_interval: String,
        snapshot_tx: mpsc::Sender<String>,
    ) -> Self {
        Self {
            venue,
            secrets,
            store,
            portfolio,
            engine,
            candle_interval,
            locks: parking_lot::Mutex::new(HashMap::new()),
            snapshot_tx,
        }
    }

    fn account_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Execute one action list for one account. Never errors past the batch
    /// boundary: every action yields an outcome.
    pub async fn execute_batch(
        &self,
        account_id: &str,
        strategy_id: &str,
        actions: &[TradeAction],
        passive: bool,
    ) -> Vec<ActionOutcome> {
        let lock = self.account_lock(account_id);
        let _guard = lock.lock().await;

        info!(
            account_id,
            strategy_id,
            actions = actions.len(),
            passive,
            "executing action batch"
        );

        let mut outcomes = Vec::with_capacity(actions.len());
        for action in actions {
            let outcome = if passive {
                self.record_plan(account_id, strategy_id, action)
            } else {
                match action.kind {
                    ActionKind::Hold => self.record_plan(account_id, strategy_id, action),
                    ActionKind::Buy | ActionKind::Sell => {
                        self.open_action(account_id, strategy_id, action).await
                    }
                    ActionKind::Close => self.close_action(account_id, strategy_id, action).await,
                }
            };

            if let ActionOutcome::Skipped { reason } = &outcome {
                let _ = self.store.append_monitoring_log(
                    account_id,
                    "skipped",
                    &format!("action:{}", action.kind),
                    reason,
                );
            }
            outcomes.push(outcome);
        }

        if outcomes.iter().any(ActionOutcome::is_executed) {
            if let Err(e) = self.snapshot_tx.try_send(account_id.to_string()) {
                warn!(account_id, error = %e, "snapshot queue full — skipping enqueue");
            }
        }

        outcomes
    }

    // -------------------------------------------------------------------------
    // Passive plans and hold notes
    // -------------------------------------------------------------------------

    fn record_plan(
        &self,
        account_id: &str,
        strategy_id: &str,
        action: &TradeAction,
    ) -> ActionOutcome {
        let side = action
            .side
            .map(|s| s.to_string())
            .unwrap_or_else(|| "flat".to_string());

        let result = self.store.create_journal_entry(
            account_id,
            strategy_id,
            &normalize_symbol(&action.symbol),
            &side,
            &action.reasoning,
            &format!("{} {}", action.kind, action.symbol),
            action.expected_entry,
            action.stop_loss,
            action.take_profit,
        );

        match result {
            Ok(_) => ActionOutcome::Noted,
            Err(e) => ActionOutcome::Failed {
                error: format!("journal write failed: {e}"),
                needs_credentials: false,
            },
        }
    }

    // -------------------------------------------------------------------------
    // Open (buy / sell)
    // -------------------------------------------------------------------------

    async fn open_action(
        &self,
        account_id: &str,
        strategy_id: &str,
        action: &TradeAction,
    ) -> ActionOutcome {
        let symbol = normalize_symbol(&action.symbol);
        let Some(side) = action.side else {
            return ActionOutcome::Skipped {
                reason: "open action without a side".into(),
            };
        };

        // Admission before anything is signed.
        match self.portfolio.can_execute(strategy_id, action.leverage) {
            Ok(admission) if !admission.allowed => {
                return ActionOutcome::Skipped {
                    reason: admission.reason.unwrap_or_else(|| "not admitted".into()),
                };
            }
            Ok(_) => {}
            Err(e) => return ActionOutcome::from_error(&e),
        }

        let signer = match self.secrets.signer(account_id) {
            Ok(signer) => signer,
            Err(e) => return ActionOutcome::failed(&e),
        };

        let is_buy = matches!(action.kind, ActionKind::Buy);
        let (limit_px, order_type) = match action.expected_entry {
            Some(px) => (px, OrderType::Limit(TimeInForce::Gtc)),
            None => {
                let Some(px) = self.aggressive_bound(&symbol, is_buy) else {
                    return ActionOutcome::Failed {
                        error: format!("no market price available for {symbol}"),
                        needs_credentials: false,
                    };
                };
                (px, OrderType::Market)
            }
        };

        // Leverage is set per instrument before the order goes out.
        if let Err(e) = self
            .venue
            .update_leverage(&signer, &symbol, true, action.leverage)
            .await
        {
            return ActionOutcome::from_error(&e);
        }

        let request = OrderRequest {
            symbol: symbol.clone(),
            is_buy,
            size: action.size,
            limit_px,
            order_type,
            reduce_only: false,
        };

        let status = match self.venue.place_order(&signer, &request).await {
            Ok(status) => status,
            Err(e) => return ActionOutcome::from_error(&e),
        };

        if let OrderStatus::Rejected { reason } = &status {
            return ActionOutcome::Skipped {
                reason: format!("venue rejected order: {reason}"),
            };
        }

        let order_id = match self.record_open(
            account_id,
            strategy_id,
            action,
            &symbol,
            side,
            limit_px,
            &status,
        ) {
            Ok(id) => id,
            Err(e) => {
                return ActionOutcome::Failed {
                    error: format!("order persisted partially: {e}"),
                    needs_credentials: false,
                }
            }
        };

        ActionOutcome::Executed {
            order_id,
            venue_oid: status.oid(),
        }
    }

    fn record_open(
        &self,
        account_id: &str,
        strategy_id: &str,
        action: &TradeAction,
        symbol: &str,
        side: PositionSide,
        limit_px: f64,
        status: &OrderStatus,
    ) -> anyhow::Result<String> {
        let (entry_px, filled, venue_oid, status_str) = match status {
            OrderStatus::Filled { oid, avg_px, .. } => (*avg_px, true, Some(*oid), "filled"),
            OrderStatus::Resting { oid } => (limit_px, false, Some(*oid), "resting"),
            OrderStatus::Rejected { .. } => (limit_px, false, None, "rejected"),
        };

        let order_id = self.store.insert_order(&OrderRow {
            id: String::new(),
            account_id: account_id.into(),
            strategy_id: strategy_id.into(),
            symbol: symbol.into(),
            side: if matches!(action.kind, ActionKind::Buy) {
                "buy".into()
            } else {
                "sell".into()
            },
            size: action.size,
            price: entry_px,
            order_type: match action.expected_entry {
                Some(_) => "limit_gtc".into(),
                None => "market".into(),
            },
            reduce_only: false,
            venue_oid,
            status: status_str.into(),
            created_at: String::new(),
        })?;

        if filled {
            self.store.open_position_row(&PositionRow {
                id: String::new(),
                account_id: account_id.into(),
                strategy_id: strategy_id.into(),
                symbol: symbol.into(),
                side,
                size: action.size,
                entry_price: entry_px,
                leverage: action.leverage,
                status: "open".into(),
                opened_at: String::new(),
                closed_at: None,
                realized_pnl: 0.0,
            })?;
        }

        // Journal: a fill activates the prior plan; otherwise a plan is
        // appended.
        match self.store.planned_journal_entry(account_id, symbol)? {
            Some(plan) if filled => {
                self.store
                    .activate_journal_entry(&plan.id, entry_px, action.size)?;
            }
            Some(_) => {}
            None => {
                let id = self.store.create_journal_entry(
                    account_id,
                    strategy_id,
                    symbol,
                    &side.to_string(),
                    &action.reasoning,
                    &format!("{} {}", action.kind, symbol),
                    action.expected_entry.or(Some(entry_px)),
                    action.stop_loss,
                    action.take_profit,
                )?;
                if filled {
                    self.store.activate_journal_entry(&id, entry_px, action.size)?;
                }
            }
        }

        Ok(order_id)
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    async fn close_action(
        &self,
        account_id: &str,
        strategy_id: &str,
        action: &TradeAction,
    ) -> ActionOutcome {
        let symbol = normalize_symbol(&action.symbol);

        let position = match self.store.open_position_for_symbol(account_id, &symbol) {
            Ok(Some(position)) => position,
            Ok(None) => {
                return ActionOutcome::Skipped {
                    reason: format!("no open position on {symbol}"),
                }
            }
            Err(e) => {
                return ActionOutcome::Failed {
                    error: format!("position lookup failed: {e}"),
                    needs_credentials: false,
                }
            }
        };

        let signer = match self.secrets.signer(account_id) {
            Ok(signer) => signer,
            Err(e) => return ActionOutcome::failed(&e),
        };

        // Closing buys back a short and sells out a long.
        let is_buy = position.side == PositionSide::Short;
        let Some(limit_px) = self.aggressive_bound(&symbol, is_buy) else {
            return ActionOutcome::Failed {
                error: format!("no market price available for {symbol}"),
                needs_credentials: false,
            };
        };

        let request = OrderRequest {
            symbol: symbol.clone(),
            is_buy,
            size: position.size,
            limit_px,
            order_type: OrderType::Limit(TimeInForce::Ioc),
            reduce_only: true,
        };

        let status = match self.venue.place_order(&signer, &request).await {
            Ok(status) => status,
            Err(e) => return ActionOutcome::from_error(&e),
        };

        let exit_px = match &status {
            OrderStatus::Filled { avg_px, .. } => *avg_px,
            OrderStatus::Resting { .. } => limit_px,
            OrderStatus::Rejected { reason } => {
                return ActionOutcome::Skipped {
                    reason: format!("venue rejected close: {reason}"),
                }
            }
        };

        match self.record_close(account_id, strategy_id, action, &position, exit_px, &status) {
            Ok(order_id) => ActionOutcome::Executed {
                order_id,
                venue_oid: status.oid(),
            },
            Err(e) => ActionOutcome::Failed {
                error: format!("close persisted partially: {e}"),
                needs_credentials: false,
            },
        }
    }

    fn record_close(
        &self,
        account_id: &str,
        strategy_id: &str,
        action: &TradeAction,
        position: &PositionRow,
        exit_px: f64,
        status: &OrderStatus,
    ) -> anyhow::Result<String> {
        let pnl = match position.side {
            PositionSide::Long => (exit_px - position.entry_price) * position.size,
            PositionSide::Short => (position.entry_price - exit_px) * position.size,
        };

        let order_id = self.store.insert_order(&OrderRow {
            id: String::new(),
            account_id: account_id.into(),
            strategy_id: strategy_id.into(),
            symbol: position.symbol.clone(),
            side: if position.side == PositionSide::Short {
                "buy".into()
            } else {
                "sell".into()
            },
            size: position.size,
            price: exit_px,
            order_type: "close_ioc".into(),
            reduce_only: true,
            venue_oid: status.oid(),
            status: "filled".into(),
            created_at: String::new(),
        })?;

        self.store.close_position_row(&position.id, pnl)?;

        // Losses accumulate against the strategy's daily budget; profits
        // release it.
        self.store.add_daily_loss(&position.strategy_id, -pnl)?;

        if let Some(entry) = self
            .store
            .active_journal_entry(account_id, &position.symbol)?
        {
            let analysis = if action.reasoning.is_empty() {
                format!("closed at {exit_px} for pnl {pnl:.2}")
            } else {
                action.reasoning.clone()
            };
            self.store
                .close_journal_entry(&entry.id, exit_px, pnl, &analysis)?;

            // Trade close feeds the evaluation pipeline.
            if let Some(closed) = self.store.journal_entry(&entry.id)? {
                let key = SeriesKey::new(position.symbol.clone(), self.candle_interval.clone());
                let regime = classify_regime(&self.engine.closes(&key, 100)).regime;
                if let Err(e) = evaluation::record_trade_close(&self.store, &closed, regime) {
                    warn!(account_id, error = %e, "trade-close evaluation failed");
                }
            }
        }

        Ok(order_id)
    }

    /// Aggressive price bound off the last close; crosses the spread by the
    /// slippage fraction.
    fn aggressive_bound(&self, symbol: &str, is_buy: bool) -> Option<f64> {
        let key = SeriesKey::new(symbol.to_string(), self.candle_interval.clone());
        let last = self.engine.last_close(&key)?;
        Some(if is_buy {
            last * (1.0 + AGGRESSIVE_BOUND)
        } else {
            last * (1.0 - AGGRESSIVE_BOUND)
        })
    }
}

impl std::fmt::Debug for TradeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeExecutor")
            .field("candle_interval", &self.candle_interval)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret_store::KEY_LEN;
    use crate::store::StrategyRow;
    use serde_json::json;
    use std::time::Duration;

    fn executor() -> (Arc<TradeExecutor>, Arc<Store>, mpsc::Receiver<String>) {
        let store = Store::open_in_memory().unwrap();
        let secrets = Arc::new(SecretStore::with_key([3u8; KEY_LEN], store.clone()));
        let venue = Arc::new(VenueClient::new(
            "http://127.0.0.1:0",
            Duration::from_millis(200),
        ));
        let portfolio = Arc::new(PortfolioManager::new(store.clone()));
        let engine = Arc::new(IndicatorEngine::new());
        let (tx, rx) = mpsc::channel(8);
        let executor = Arc::new(TradeExecutor::new(
            venue,
            secrets,
            store.clone(),
            portfolio,
            engine,
            "1m".into(),
            tx,
        ));
        (executor, store, rx)
    }

    fn seed_account_and_strategy(store: &Arc<Store>) -> String {
        store.create_account("acct-1", None).unwrap();
        store.insert_strategy(&StrategyRow {
            id: "strat-1".into(),
            account_id: "acct-1".into(),
            name: "dip buyer".into(),
            kind: "indicator".into(),
            is_active: true,
            allocated_percent: 50.0,
            max_positions: 1,
            max_leverage: 5,
            daily_loss_limit_percent: 3.0,
            current_daily_loss: 0.0,
            config: json!({}),
            status: "ok".into(),
        })
        .unwrap()
    }

    fn buy_action(symbol: &str) -> TradeAction {
        TradeAction {
            kind: ActionKind::Buy,
            symbol: symbol.into(),
            side: Some(PositionSide::Long),
            size: 0.01,
            leverage: 3,
            reasoning: "oversold".into(),
            expected_entry: Some(43000.0),
            stop_loss: Some(42000.0),
            take_profit: Some(44000.0),
        }
    }

    #[tokio::test]
    async fn passive_batch_records_plans_without_venue_calls() {
        let (executor, store, _rx) = executor();
        let strategy_id = seed_account_and_strategy(&store);

        let actions = vec![buy_action("BTC-PERP"), TradeAction {
            kind: ActionKind::Hold,
            symbol: "ETH".into(),
            side: None,
            size: 0.0,
            leverage: 1,
            reasoning: "no edge".into(),
            expected_entry: None,
            stop_loss: None,
            take_profit: None,
        }];

        let outcomes = executor
            .execute_batch("acct-1", &strategy_id, &actions, true)
            .await;

        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0], ActionOutcome::Noted));
        assert!(matches!(outcomes[1], ActionOutcome::Noted));

        // Plans landed in the journal, symbol normalized.
        let entries = store.journal_entries("acct-1", 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.symbol == "BTC"));
    }

    #[tokio::test]
    async fn admission_denial_is_skipped_not_failed() {
        let (executor, store, _rx) = executor();
        let strategy_id = seed_account_and_strategy(&store);

        // Fill the single position slot so admission denies the next open.
        store
            .open_position_row(&PositionRow {
                id: String::new(),
                account_id: "acct-1".into(),
                strategy_id: strategy_id.clone(),
                symbol: "BTC".into(),
                side: PositionSide::Long,
                size: 0.01,
                entry_price: 43000.0,
                leverage: 3,
                status: "open".into(),
                opened_at: String::new(),
                closed_at: None,
                realized_pnl: 0.0,
            })
            .unwrap();

        let outcomes = executor
            .execute_batch("acct-1", &strategy_id, &[buy_action("BTC")], false)
            .await;

        match &outcomes[0] {
            ActionOutcome::Skipped { reason } => {
                assert_eq!(reason, "Max positions (1) reached");
            }
            other => panic!("expected skip, got {other:?}"),
        }

        // The skip was logged.
        let log = store.last_monitoring_log("acct-1").unwrap().unwrap();
        assert_eq!(log.state, "skipped");
    }

    #[tokio::test]
    async fn missing_credentials_fail_without_aborting_batch() {
        let (executor, store, _rx) = executor();
        let strategy_id = seed_account_and_strategy(&store);

        let actions = vec![buy_action("BTC"), TradeAction {
            kind: ActionKind::Hold,
            symbol: "ETH".into(),
            side: None,
            size: 0.0,
            leverage: 1,
            reasoning: "wait".into(),
            expected_entry: None,
            stop_loss: None,
            take_profit: None,
        }];

        let outcomes = executor
            .execute_batch("acct-1", &strategy_id, &actions, false)
            .await;

        // No agent key stored: credential failure, batch continues.
        match &outcomes[0] {
            ActionOutcome::Failed {
                needs_credentials, ..
            } => assert!(needs_credentials),
            other => panic!("expected credential failure, got {other:?}"),
        }
        assert!(matches!(outcomes[1], ActionOutcome::Noted));
    }

    #[tokio::test]
    async fn close_without_position_is_skipped() {
        let (executor, store, _rx) = executor();
        let strategy_id = seed_account_and_strategy(&store);

        let close = TradeAction {
            kind: ActionKind::Close,
            symbol: "SOL".into(),
            side: None,
            size: 0.0,
            leverage: 1,
            reasoning: String::new(),
            expected_entry: None,
            stop_loss: None,
            take_profit: None,
        };
        let outcomes = executor
            .execute_batch("acct-1", &strategy_id, &[close], false)
            .await;
        match &outcomes[0] {
            ActionOutcome::Skipped { reason } => assert!(reason.contains("no open position")),
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn batches_serialize_per_account() {
        let (executor, store, _rx) = executor();
        let strategy_id = seed_account_and_strategy(&store);

        // Two concurrent passive batches: both must complete (the per-account
        // lock serializes them rather than deadlocking or interleaving).
        let btc_actions = [buy_action("BTC")];
        let eth_actions = [buy_action("ETH")];
        let a = executor.execute_batch("acct-1", &strategy_id, &btc_actions, true);
        let b = executor.execute_batch("acct-1", &strategy_id, &eth_actions, true);
        let (ra, rb) = tokio::join!(a, b);
        assert!(matches!(ra[0], ActionOutcome::Noted));
        assert!(matches!(rb[0], ActionOutcome::Noted));

        assert_eq!(store.journal_entries("acct-1", 10).unwrap().len(), 2);
    }

    #[test]
    fn invalid_params_classify_as_skipped_not_failed() {
        // An unknown symbol or bad price is a skip; the venue being down is
        // a failure; missing credentials stay a failure with the flag set.
        let invalid = EngineError::invalid("symbol", "unknown instrument: WAT");
        assert!(matches!(
            ActionOutcome::from_error(&invalid),
            ActionOutcome::Skipped { .. }
        ));

        let down = EngineError::Unavailable("venue returned 503".into());
        assert!(matches!(
            ActionOutcome::from_error(&down),
            ActionOutcome::Failed {
                needs_credentials: false,
                ..
            }
        ));

        let creds = EngineError::NeedsCredentials("no agent key".into());
        assert!(matches!(
            ActionOutcome::from_error(&creds),
            ActionOutcome::Failed {
                needs_credentials: true,
                ..
            }
        ));
    }
}
