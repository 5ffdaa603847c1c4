// =============================================================================
// Store: strategies
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::store::Store;

/// Tolerance on the 100% allocation invariant before the operator is warned.
pub const ALLOCATION_TOLERANCE: f64 = 1.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRow {
    pub id: String,
    pub account_id: String,
    pub name: String,
    /// indicator | order-flow | profile | hybrid | price-action
    pub kind: String,
    pub is_active: bool,
    pub allocated_percent: f64,
    pub max_positions: u32,
    pub max_leverage: u32,
    pub daily_loss_limit_percent: f64,
    pub current_daily_loss: f64,
    pub config: Value,
    pub status: String,
}

fn strategy_from_row(row: &Row<'_>) -> rusqlite::Result<StrategyRow> {
    let config_text: String = row.get("config")?;
    Ok(StrategyRow {
        id: row.get("id")?,
        account_id: row.get("account_id")?,
        name: row.get("name")?,
        kind: row.get("kind")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
        allocated_percent: row.get("allocated_percent")?,
        max_positions: row.get::<_, i64>("max_positions")? as u32,
        max_leverage: row.get::<_, i64>("max_leverage")? as u32,
        daily_loss_limit_percent: row.get("daily_loss_limit_percent")?,
        current_daily_loss: row.get("current_daily_loss")?,
        config: serde_json::from_str(&config_text).unwrap_or(Value::Null),
        status: row.get("status")?,
    })
}

/// Sum of active allocation percents; used for the <= 100 (+ tolerance)
/// invariant.
pub fn total_active_allocation(strategies: &[StrategyRow]) -> f64 {
    strategies
        .iter()
        .filter(|s| s.is_active)
        .map(|s| s.allocated_percent)
        .sum()
}

impl Store {
    pub fn insert_strategy(&self, strategy: &StrategyRow) -> Result<String> {
        let id = if strategy.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            strategy.id.clone()
        };
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO strategy
                     (id, account_id, name, kind, is_active, allocated_percent, max_positions,
                      max_leverage, daily_loss_limit_percent, current_daily_loss, config, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    id,
                    strategy.account_id,
                    strategy.name,
                    strategy.kind,
                    strategy.is_active as i64,
                    strategy.allocated_percent,
                    strategy.max_positions as i64,
                    strategy.max_leverage as i64,
                    strategy.daily_loss_limit_percent,
                    strategy.current_daily_loss,
                    strategy.config.to_string(),
                    strategy.status,
                ],
            )
            .context("failed to insert strategy")?;
        }

        // Allocation drift is an operator warning, not a hard rejection.
        let all = self.strategies_for_account(&strategy.account_id)?;
        let total = total_active_allocation(&all);
        if total > 100.0 + ALLOCATION_TOLERANCE {
            warn!(
                account_id = %strategy.account_id,
                total_allocated = total,
                "active strategy allocation exceeds 100%"
            );
        }
        Ok(id)
    }

    pub fn get_strategy(&self, id: &str) -> Result<Option<StrategyRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM strategy WHERE id = ?1",
            params![id],
            strategy_from_row,
        )
        .optional()
        .context("failed to load strategy")
    }

    pub fn strategies_for_account(&self, account_id: &str) -> Result<Vec<StrategyRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM strategy WHERE account_id = ?1")?;
        let rows = stmt
            .query_map(params![account_id], strategy_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn active_strategies(&self, account_id: &str) -> Result<Vec<StrategyRow>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM strategy WHERE account_id = ?1 AND is_active = 1")?;
        let rows = stmt
            .query_map(params![account_id], strategy_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn set_strategy_active(&self, id: &str, active: bool) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE strategy SET is_active = ?2 WHERE id = ?1",
            params![id, active as i64],
        )?;
        Ok(())
    }

    pub fn set_strategy_status(&self, id: &str, status: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE strategy SET status = ?2 WHERE id = ?1",
            params![id, status],
        )?;
        Ok(())
    }

    /// Accumulate realised daily loss (a positive delta means money lost).
    pub fn add_daily_loss(&self, id: &str, delta: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE strategy SET current_daily_loss = MAX(0, current_daily_loss + ?2)
             WHERE id = ?1",
            params![id, delta],
        )?;
        Ok(())
    }

    /// Daily rollover: zero every strategy's accumulated loss for an account.
    pub fn reset_daily_losses(&self, account_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE strategy SET current_daily_loss = 0 WHERE account_id = ?1",
            params![account_id],
        )?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    pub fn sample_strategy(account_id: &str, name: &str, allocated: f64) -> StrategyRow {
        StrategyRow {
            id: String::new(),
            account_id: account_id.into(),
            name: name.into(),
            kind: "indicator".into(),
            is_active: true,
            allocated_percent: allocated,
            max_positions: 2,
            max_leverage: 5,
            daily_loss_limit_percent: 3.0,
            current_daily_loss: 0.0,
            config: json!({ "triggers": [] }),
            status: "ok".into(),
        }
    }

    #[test]
    fn insert_and_query() {
        let store = Store::open_in_memory().unwrap();
        store.create_account("acct-1", None).unwrap();

        let id = store
            .insert_strategy(&sample_strategy("acct-1", "rsi-dip", 40.0))
            .unwrap();
        let strategy = store.get_strategy(&id).unwrap().unwrap();
        assert_eq!(strategy.name, "rsi-dip");
        assert_eq!(strategy.max_positions, 2);
        assert!(strategy.config.get("triggers").is_some());
    }

    #[test]
    fn active_filtering() {
        let store = Store::open_in_memory().unwrap();
        store.create_account("acct-1", None).unwrap();
        let id1 = store
            .insert_strategy(&sample_strategy("acct-1", "a", 30.0))
            .unwrap();
        store
            .insert_strategy(&sample_strategy("acct-1", "b", 30.0))
            .unwrap();

        store.set_strategy_active(&id1, false).unwrap();
        let active = store.active_strategies("acct-1").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "b");
    }

    #[test]
    fn allocation_sum_only_counts_active() {
        let mut a = sample_strategy("x", "a", 60.0);
        let b = sample_strategy("x", "b", 50.0);
        a.is_active = false;
        assert_eq!(total_active_allocation(&[a, b.clone()]), 50.0);
        assert_eq!(total_active_allocation(&[b.clone(), b]), 100.0);
    }

    #[test]
    fn daily_loss_accumulates_and_resets() {
        let store = Store::open_in_memory().unwrap();
        store.create_account("acct-1", None).unwrap();
        let id = store
            .insert_strategy(&sample_strategy("acct-1", "a", 10.0))
            .unwrap();

        store.add_daily_loss(&id, 1.5).unwrap();
        store.add_daily_loss(&id, 0.5).unwrap();
        assert!((store.get_strategy(&id).unwrap().unwrap().current_daily_loss - 2.0).abs() < 1e-9);

        // A profitable trade reduces the accumulated loss but never below 0.
        store.add_daily_loss(&id, -5.0).unwrap();
        assert_eq!(
            store.get_strategy(&id).unwrap().unwrap().current_daily_loss,
            0.0
        );

        store.add_daily_loss(&id, 2.0).unwrap();
        store.reset_daily_losses("acct-1").unwrap();
        assert_eq!(
            store.get_strategy(&id).unwrap().unwrap().current_daily_loss,
            0.0
        );
    }
}
