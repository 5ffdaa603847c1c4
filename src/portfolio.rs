// =============================================================================
// Portfolio Manager — admission checks and cross-strategy exposure
// =============================================================================
//
// Admission is a pure predicate over the strategy row and its open-position
// count; the manager only fetches rows and delegates. Exposure is
// reconstructed by index lookup over position rows, never by traversing
// object graphs.
//
// The daily-loss admission check compares the strategy's accumulated absolute
// loss against its configured limit; capital-derived loss budgets appear only
// in the status report.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;
use crate::store::{PositionRow, Store, StrategyRow};
use crate::types::PositionSide;

/// Margin-utilization thresholds for the health rollup (percent).
const UTILIZATION_WARNING: f64 = 70.0;
const UTILIZATION_CRITICAL: f64 = 85.0;

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Admission {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Admission {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Pure admission predicate for one prospective order.
pub fn admit(strategy: &StrategyRow, open_positions: usize, leverage: u32) -> Admission {
    if !strategy.is_active {
        return Admission::deny(format!("Strategy {} is not active", strategy.name));
    }
    if leverage > strategy.max_leverage {
        return Admission::deny(format!(
            "Leverage {}x exceeds strategy max {}x",
            leverage, strategy.max_leverage
        ));
    }
    if open_positions >= strategy.max_positions as usize {
        return Admission::deny(format!(
            "Max positions ({}) reached",
            strategy.max_positions
        ));
    }
    if strategy.daily_loss_limit_percent > 0.0
        && strategy.current_daily_loss >= strategy.daily_loss_limit_percent
    {
        return Admission::deny(format!(
            "Daily loss limit reached ({:.2} of {:.2})",
            strategy.current_daily_loss, strategy.daily_loss_limit_percent
        ));
    }
    Admission::allow()
}

// ---------------------------------------------------------------------------
// Status & conflicts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    OpposingPositions,
    OverConcentration,
    CorrelatedRisk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub severity: Severity,
    pub symbol: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortfolioHealth {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyAllocation {
    pub strategy_id: String,
    pub name: String,
    pub allocated_percent: f64,
    pub margin_used: f64,
    /// Capital still available under the allocation, given total capital.
    pub headroom: f64,
    pub open_positions: usize,
    pub daily_loss_budget: f64,
    pub current_daily_loss: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioStatus {
    pub total_margin_used: f64,
    pub utilization_percent: f64,
    /// Signed notional per symbol (long positive, short negative).
    pub net_exposure: HashMap<String, f64>,
    pub allocations: Vec<StrategyAllocation>,
    pub conflicts: Vec<Conflict>,
    pub health: PortfolioHealth,
}

fn position_notional(pos: &PositionRow) -> f64 {
    pos.size * pos.entry_price
}

fn position_margin(pos: &PositionRow) -> f64 {
    let lev = pos.leverage.max(1) as f64;
    position_notional(pos) / lev
}

/// Detect cross-strategy conflicts over the open-position set.
pub fn detect_conflicts(strategies: &[StrategyRow], positions: &[PositionRow]) -> Vec<Conflict> {
    let mut conflicts = Vec::new();

    // opposing_positions: long and short on the same symbol.
    let mut by_symbol: HashMap<&str, (f64, f64)> = HashMap::new();
    for pos in positions {
        let entry = by_symbol.entry(pos.symbol.as_str()).or_insert((0.0, 0.0));
        match pos.side {
            PositionSide::Long => entry.0 += position_notional(pos),
            PositionSide::Short => entry.1 += position_notional(pos),
        }
    }
    for (symbol, (long, short)) in &by_symbol {
        if *long > 0.0 && *short > 0.0 {
            let hedged_percent = 100.0 * long.min(*short) / long.max(*short);
            let severity = if hedged_percent >= 80.0 {
                Severity::High
            } else if hedged_percent >= 50.0 {
                Severity::Medium
            } else {
                Severity::Low
            };
            conflicts.push(Conflict {
                kind: ConflictKind::OpposingPositions,
                severity,
                symbol: Some(symbol.to_string()),
                description: format!(
                    "Long and short positions held on {symbol} ({hedged_percent:.0}% hedged)"
                ),
            });
        }
    }

    // over_concentration: too many positions in one symbol.
    if positions.len() > 1 {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for pos in positions {
            *counts.entry(pos.symbol.as_str()).or_insert(0) += 1;
        }
        for (symbol, count) in counts {
            let share = 100.0 * count as f64 / positions.len() as f64;
            if share > 40.0 {
                conflicts.push(Conflict {
                    kind: ConflictKind::OverConcentration,
                    severity: if share > 60.0 {
                        Severity::High
                    } else {
                        Severity::Medium
                    },
                    symbol: Some(symbol.to_string()),
                    description: format!("{share:.0}% of positions concentrated in {symbol}"),
                });
            }
        }
    }

    // correlated_risk: a strategy has burned through its daily loss budget.
    for strategy in strategies {
        if strategy.daily_loss_limit_percent > 0.0
            && strategy.current_daily_loss >= strategy.daily_loss_limit_percent
        {
            conflicts.push(Conflict {
                kind: ConflictKind::CorrelatedRisk,
                severity: Severity::Critical,
                symbol: None,
                description: format!(
                    "Strategy {} breached its daily loss limit",
                    strategy.name
                ),
            });
        }
    }

    conflicts
}

/// Aggregate status from rows; pure so tests can feed fixtures directly.
pub fn build_status(
    strategies: &[StrategyRow],
    positions: &[PositionRow],
    total_capital: f64,
) -> PortfolioStatus {
    let total_margin_used: f64 = positions.iter().map(position_margin).sum();
    let utilization_percent = if total_capital > 0.0 {
        100.0 * total_margin_used / total_capital
    } else {
        0.0
    };

    let mut net_exposure: HashMap<String, f64> = HashMap::new();
    for pos in positions {
        let signed = match pos.side {
            PositionSide::Long => position_notional(pos),
            PositionSide::Short => -position_notional(pos),
        };
        *net_exposure.entry(pos.symbol.clone()).or_insert(0.0) += signed;
    }

    let allocations = strategies
        .iter()
        .map(|strategy| {
            let strategy_positions: Vec<&PositionRow> = positions
                .iter()
                .filter(|p| p.strategy_id == strategy.id)
                .collect();
            let margin_used: f64 = strategy_positions
                .iter()
                .map(|p| position_margin(p))
                .sum();
            let budget = total_capital * strategy.allocated_percent / 100.0;
            StrategyAllocation {
                strategy_id: strategy.id.clone(),
                name: strategy.name.clone(),
                allocated_percent: strategy.allocated_percent,
                margin_used,
                headroom: (budget - margin_used).max(0.0),
                open_positions: strategy_positions.len(),
                daily_loss_budget: total_capital * strategy.daily_loss_limit_percent / 100.0,
                current_daily_loss: strategy.current_daily_loss,
            }
        })
        .collect();

    let conflicts = detect_conflicts(strategies, positions);

    let worst = conflicts.iter().map(|c| c.severity).max();
    let health = if utilization_percent >= UTILIZATION_CRITICAL
        || worst == Some(Severity::Critical)
    {
        PortfolioHealth::Critical
    } else if utilization_percent >= UTILIZATION_WARNING
        || matches!(worst, Some(Severity::High) | Some(Severity::Medium))
    {
        PortfolioHealth::Warning
    } else {
        PortfolioHealth::Healthy
    };

    PortfolioStatus {
        total_margin_used,
        utilization_percent,
        net_exposure,
        allocations,
        conflicts,
        health,
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Store-backed facade used by the executor and the bridge.
pub struct PortfolioManager {
    store: Arc<Store>,
}

impl PortfolioManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Can this strategy place this order right now?
    pub fn can_execute(
        &self,
        strategy_id: &str,
        leverage: u32,
    ) -> Result<Admission, EngineError> {
        let strategy = self
            .store
            .get_strategy(strategy_id)
            .map_err(|e| EngineError::Invariant(format!("strategy lookup failed: {e}")))?
            .ok_or_else(|| {
                EngineError::invalid("strategy_id", format!("unknown strategy {strategy_id}"))
            })?;

        let open = self
            .store
            .open_positions_for_strategy(strategy_id)
            .map_err(|e| EngineError::Invariant(format!("position lookup failed: {e}")))?;

        let admission = admit(&strategy, open.len(), leverage);
        if !admission.allowed {
            debug!(
                strategy_id,
                reason = admission.reason.as_deref().unwrap_or(""),
                "admission denied"
            );
        }
        Ok(admission)
    }

    pub fn status(&self, account_id: &str, total_capital: f64) -> Result<PortfolioStatus> {
        let strategies = self.store.strategies_for_account(account_id)?;
        let positions = self.store.open_positions(account_id)?;
        Ok(build_status(&strategies, &positions, total_capital))
    }
}

impl std::fmt::Debug for PortfolioManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortfolioManager").finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strategy(id: &str, max_positions: u32, max_leverage: u32) -> StrategyRow {
        StrategyRow {
            id: id.into(),
            account_id: "acct-1".into(),
            name: format!("strat-{id}"),
            kind: "indicator".into(),
            is_active: true,
            allocated_percent: 50.0,
            max_positions,
            max_leverage,
            daily_loss_limit_percent: 3.0,
            current_daily_loss: 0.0,
            config: json!({}),
            status: "ok".into(),
        }
    }

    fn position(strategy_id: &str, symbol: &str, side: PositionSide, notional: f64) -> PositionRow {
        PositionRow {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: "acct-1".into(),
            strategy_id: strategy_id.into(),
            symbol: symbol.into(),
            side,
            size: notional / 100.0,
            entry_price: 100.0,
            leverage: 5,
            status: "open".into(),
            opened_at: String::new(),
            closed_at: None,
            realized_pnl: 0.0,
        }
    }

    #[test]
    fn admission_max_positions() {
        let strat = strategy("s1", 2, 10);
        let admission = admit(&strat, 2, 3);
        assert!(!admission.allowed);
        assert_eq!(admission.reason.unwrap(), "Max positions (2) reached");

        assert!(admit(&strat, 1, 3).allowed);
    }

    #[test]
    fn admission_leverage_cap() {
        let strat = strategy("s1", 5, 5);
        let admission = admit(&strat, 0, 6);
        assert!(!admission.allowed);
        assert!(admission.reason.unwrap().contains("Leverage"));
    }

    #[test]
    fn admission_inactive_strategy() {
        let mut strat = strategy("s1", 5, 5);
        strat.is_active = false;
        assert!(!admit(&strat, 0, 1).allowed);
    }

    #[test]
    fn admission_daily_loss_limit() {
        let mut strat = strategy("s1", 5, 5);
        strat.current_daily_loss = 3.0;
        let admission = admit(&strat, 0, 1);
        assert!(!admission.allowed);
        assert!(admission.reason.unwrap().contains("Daily loss"));
    }

    #[test]
    fn opposing_positions_severity_from_hedged_percent() {
        let strategies = vec![strategy("s1", 5, 10), strategy("s2", 5, 10)];

        // 90% hedged: high severity.
        let positions = vec![
            position("s1", "BTC", PositionSide::Long, 1000.0),
            position("s2", "BTC", PositionSide::Short, 900.0),
        ];
        let conflicts = detect_conflicts(&strategies, &positions);
        let opposing = conflicts
            .iter()
            .find(|c| c.kind == ConflictKind::OpposingPositions)
            .unwrap();
        assert_eq!(opposing.severity, Severity::High);

        // 30% hedged: low severity.
        let positions = vec![
            position("s1", "BTC", PositionSide::Long, 1000.0),
            position("s2", "BTC", PositionSide::Short, 300.0),
        ];
        let conflicts = detect_conflicts(&strategies, &positions);
        let opposing = conflicts
            .iter()
            .find(|c| c.kind == ConflictKind::OpposingPositions)
            .unwrap();
        assert_eq!(opposing.severity, Severity::Low);
    }

    #[test]
    fn concentration_thresholds() {
        let strategies = vec![strategy("s1", 10, 10)];

        // 2 of 3 positions in BTC: 67% -> high.
        let positions = vec![
            position("s1", "BTC", PositionSide::Long, 100.0),
            position("s1", "BTC", PositionSide::Long, 100.0),
            position("s1", "ETH", PositionSide::Long, 100.0),
        ];
        let conflicts = detect_conflicts(&strategies, &positions);
        let conc = conflicts
            .iter()
            .find(|c| c.kind == ConflictKind::OverConcentration)
            .unwrap();
        assert_eq!(conc.severity, Severity::High);

        // 2 of 4: exactly 50% -> medium.
        let positions = vec![
            position("s1", "BTC", PositionSide::Long, 100.0),
            position("s1", "BTC", PositionSide::Long, 100.0),
            position("s1", "ETH", PositionSide::Long, 100.0),
            position("s1", "SOL", PositionSide::Long, 100.0),
        ];
        let conflicts = detect_conflicts(&strategies, &positions);
        let conc = conflicts
            .iter()
            .find(|c| c.kind == ConflictKind::OverConcentration)
            .unwrap();
        assert_eq!(conc.severity, Severity::Medium);
    }

    #[test]
    fn daily_loss_breach_is_critical_and_rolls_up() {
        let mut strat = strategy("s1", 5, 10);
        strat.current_daily_loss = 5.0; // limit is 3.0

        let status = build_status(&[strat], &[], 1000.0);
        assert_eq!(status.health, PortfolioHealth::Critical);
        assert!(status
            .conflicts
            .iter()
            .any(|c| c.kind == ConflictKind::CorrelatedRisk && c.severity == Severity::Critical));
    }

    #[test]
    fn utilization_drives_health() {
        let strategies = vec![strategy("s1", 10, 10)];
        // Margin = notional / leverage = 4000/5 = 800 on 1000 capital: 80%.
        let positions = vec![position("s1", "BTC", PositionSide::Long, 4000.0)];
        let status = build_status(&strategies, &positions, 1000.0);
        assert!((status.utilization_percent - 80.0).abs() < 1e-9);
        assert_eq!(status.health, PortfolioHealth::Warning);

        // 90% utilization: critical.
        let positions = vec![position("s1", "BTC", PositionSide::Long, 4500.0)];
        let status = build_status(&strategies, &positions, 1000.0);
        assert_eq!(status.health, PortfolioHealth::Critical);
    }

    #[test]
    fn net_exposure_is_signed() {
        let strategies = vec![strategy("s1", 10, 10), strategy("s2", 10, 10)];
        let positions = vec![
            position("s1", "BTC", PositionSide::Long, 1000.0),
            position("s2", "BTC", PositionSide::Short, 400.0),
            position("s2", "ETH", PositionSide::Short, 200.0),
        ];
        let status = build_status(&strategies, &positions, 10000.0);
        assert!((status.net_exposure["BTC"] - 600.0).abs() < 1e-9);
        assert!((status.net_exposure["ETH"] + 200.0).abs() < 1e-9);
    }

    #[test]
    fn manager_admission_against_store() {
        let store = Store::open_in_memory().unwrap();
        store.create_account("acct-1", None).unwrap();
        let mut strat = strategy("", 1, 5);
        strat.id = String::new();
        let id = store.insert_strategy(&strat).unwrap();

        let manager = PortfolioManager::new(store.clone());
        assert!(manager.can_execute(&id, 3).unwrap().allowed);

        // Fill the single slot.
        let pos = position(&id, "BTC", PositionSide::Long, 100.0);
        store.open_position_row(&pos).unwrap();
        let admission = manager.can_execute(&id, 3).unwrap();
        assert!(!admission.allowed);
        assert_eq!(admission.reason.unwrap(), "Max positions (1) reached");

        assert!(matches!(
            manager.can_execute("missing", 1),
            Err(EngineError::InvalidParams { .. })
        ));
    }
}
