// =============================================================================
// Trigger Supervisor — samples the indicator engine and wakes the monitor
// =============================================================================
//
// One task per strategy owns all of that strategy's trigger machines, so
// per-trigger transitions stay serialized and triggers firing on the same
// tick reach the monitor as one joint event.
//
// The 10-second sampling tick is an internal cadence, not the account's
// monitoring frequency. Near misses are context notes; they never wake the
// reasoning loop on their own.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::indicators::{IndicatorEngine, SeriesKey};
use crate::market_data::normalize_symbol;
use crate::triggers::machine::{MachineEvent, TriggerMachine};
use crate::triggers::spec::TriggerSpec;

/// Why a monitor tick is being woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeKind {
    Triggered,
    Heartbeat,
}

/// One trigger that fired this tick.
#[derive(Debug, Clone, Serialize)]
pub struct FiredTrigger {
    pub trigger_id: String,
    pub symbol: String,
    pub value: f64,
    pub threshold: f64,
    pub description: String,
    pub near_miss_count: u32,
}

/// The wake signal delivered to an account's monitor loop.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerEvent {
    pub account_id: String,
    pub strategy_id: String,
    pub kind: WakeKind,
    /// Every trigger that fired on this tick; the prompt carries them jointly.
    pub fired: Vec<FiredTrigger>,
}

impl TriggerEvent {
    pub fn heartbeat(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            strategy_id: String::new(),
            kind: WakeKind::Heartbeat,
            fired: Vec::new(),
        }
    }
}

/// Spawn the supervisor task for one strategy's triggers.
pub fn spawn_strategy_supervisor(
    engine: Arc<IndicatorEngine>,
    account_id: String,
    strategy_id: String,
    specs: Vec<TriggerSpec>,
    candle_interval: String,
    poll: Duration,
    events: mpsc::Sender<TriggerEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut machines: Vec<TriggerMachine> = specs.into_iter().map(TriggerMachine::new).collect();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll);
        info!(
            account_id,
            strategy_id,
            triggers = machines.len(),
            "trigger supervisor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(account_id, strategy_id, "trigger supervisor cancelled");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let now = Utc::now();
            let mut fired = Vec::new();

            for machine in &mut machines {
                let Some(values) = sample_conditions(&engine, machine, &candle_interval) else {
                    // Insufficient lookback on some condition: skip this
                    // trigger for this tick rather than feed partial values.
                    continue;
                };

                match machine.on_sample(&values, now) {
                    MachineEvent::Fired { value } => {
                        info!(
                            account_id,
                            strategy_id,
                            trigger = %machine.spec.id,
                            value,
                            "trigger fired"
                        );
                        fired.push(FiredTrigger {
                            trigger_id: machine.spec.id.clone(),
                            symbol: machine.spec.symbol.clone(),
                            value,
                            threshold: machine.spec.primary().threshold,
                            description: machine.spec.description.clone(),
                            near_miss_count: machine.near_miss_count(),
                        });
                    }
                    MachineEvent::NearMiss { value } => {
                        debug!(
                            account_id,
                            strategy_id,
                            trigger = %machine.spec.id,
                            value,
                            "near miss recorded"
                        );
                    }
                    MachineEvent::Armed => {
                        debug!(account_id, strategy_id, trigger = %machine.spec.id, "trigger armed");
                    }
                    _ => {}
                }
            }

            if !fired.is_empty() {
                let event = TriggerEvent {
                    account_id: account_id.clone(),
                    strategy_id: strategy_id.clone(),
                    kind: WakeKind::Triggered,
                    fired,
                };
                if events.send(event).await.is_err() {
                    warn!(account_id, strategy_id, "monitor event channel closed — stopping supervisor");
                    return;
                }
            }
        }
    })
}

fn sample_conditions(
    engine: &IndicatorEngine,
    machine: &TriggerMachine,
    interval: &str,
) -> Option<Vec<f64>> {
    let key = SeriesKey::new(normalize_symbol(&machine.spec.symbol), interval);
    machine
        .spec
        .conditions
        .iter()
        .map(|cond| engine.value(&key, cond.indicator, cond.period))
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::IndicatorKind;
    use crate::market_data::frames::CandleFrame;
    use crate::triggers::spec::{TriggerCondition, TriggerOp};

    fn candle(open_time: i64, close: f64) -> CandleFrame {
        CandleFrame {
            symbol: "BTC".into(),
            interval: "1m".into(),
            open_time_ms: open_time,
            close_time_ms: open_time + 59_999,
            open: close,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume: 10.0,
            trades_count: 5,
        }
    }

    fn price_spec(threshold: f64) -> TriggerSpec {
        TriggerSpec {
            id: "px-breakout".into(),
            symbol: "BTC-PERP".into(),
            conditions: vec![TriggerCondition {
                indicator: IndicatorKind::Price,
                period: 0,
                op: TriggerOp::Gt,
                threshold,
            }],
            hysteresis: 0.0,
            cooldown_minutes: 60,
            near_miss_fraction: 0.8,
            description: "price breakout".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_fires_joint_event() {
        let engine = Arc::new(IndicatorEngine::new());
        // Two closed candles above the threshold.
        engine.on_candle(&candle(0, 105.0));
        engine.on_candle(&candle(60_000, 106.0));
        engine.on_candle(&candle(120_000, 107.0));

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = spawn_strategy_supervisor(
            engine,
            "acct-1".into(),
            "strat-1".into(),
            vec![price_spec(100.0), price_spec(104.0)],
            "1m".into(),
            Duration::from_secs(10),
            tx,
            cancel.clone(),
        );

        // First tick arms both; second tick fires both jointly.
        tokio::time::sleep(Duration::from_secs(25)).await;

        let event = rx.recv().await.expect("expected a trigger event");
        assert_eq!(event.kind, WakeKind::Triggered);
        assert_eq!(event.account_id, "acct-1");
        assert_eq!(event.fired.len(), 2);

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_skips_triggers_with_missing_lookback() {
        let engine = Arc::new(IndicatorEngine::new());
        // No candles at all: every sample is absent.
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = spawn_strategy_supervisor(
            engine,
            "acct-1".into(),
            "strat-1".into(),
            vec![price_spec(100.0)],
            "1m".into(),
            Duration::from_secs(10),
            tx,
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        let _ = handle.await;
    }
}
