// =============================================================================
// Store: orders, positions, and the trade journal lifecycle
// =============================================================================
//
// Journal entries move planned -> active -> closed through dedicated
// operations; the UPDATE is guarded by the expected current status, so a
// write that would violate the lifecycle changes zero rows and is rejected.
// =============================================================================

use anyhow::{bail, Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::Store;
use crate::types::PositionSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalStatus {
    Planned,
    Active,
    Closed,
}

impl JournalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "planned" => Some(Self::Planned),
            "active" => Some(Self::Active),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRow {
    pub id: String,
    pub account_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: String,
    pub size: f64,
    pub price: f64,
    pub order_type: String,
    pub reduce_only: bool,
    pub venue_oid: Option<u64>,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRow {
    pub id: String,
    pub account_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub status: String,
    pub opened_at: String,
    pub closed_at: Option<String>,
    pub realized_pnl: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntryRow {
    pub id: String,
    pub account_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: String,
    pub status: JournalStatus,
    pub entry_reasoning: String,
    pub expectations: String,
    pub planned_entry: Option<f64>,
    pub planned_stop: Option<f64>,
    pub planned_target: Option<f64>,
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub size: Option<f64>,
    pub pnl: Option<f64>,
    pub close_analysis: Option<String>,
    pub created_at: String,
    pub activated_at: Option<String>,
    pub closed_at: Option<String>,
}

fn journal_from_row(row: &Row<'_>) -> rusqlite::Result<JournalEntryRow> {
    let status: String = row.get("status")?;
    Ok(JournalEntryRow {
        id: row.get("id")?,
        account_id: row.get("account_id")?,
        strategy_id: row.get("strategy_id")?,
        symbol: row.get("symbol")?,
        side: row.get("side")?,
        status: JournalStatus::parse(&status).unwrap_or(JournalStatus::Planned),
        entry_reasoning: row.get("entry_reasoning")?,
        expectations: row.get("expectations")?,
        planned_entry: row.get("planned_entry")?,
        planned_stop: row.get("planned_stop")?,
        planned_target: row.get("planned_target")?,
        entry_price: row.get("entry_price")?,
        exit_price: row.get("exit_price")?,
        size: row.get("size")?,
        pnl: row.get("pnl")?,
        close_analysis: row.get("close_analysis")?,
        created_at: row.get("created_at")?,
        activated_at: row.get("activated_at")?,
        closed_at: row.get("closed_at")?,
    })
}

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<PositionRow> {
    let side: String = row.get("side")?;
    Ok(PositionRow {
        id: row.get("id")?,
        account_id: row.get("account_id")?,
        strategy_id: row.get("strategy_id")?,
        symbol: row.get("symbol")?,
        side: PositionSide::parse(&side).unwrap_or(PositionSide::Long),
        size: row.get("size")?,
        entry_price: row.get("entry_price")?,
        leverage: row.get::<_, i64>("leverage")? as u32,
        status: row.get("status")?,
        opened_at: row.get("opened_at")?,
        closed_at: row.get("closed_at")?,
        realized_pnl: row.get("realized_pnl")?,
    })
}

impl Store {
    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Every executed order links back to the strategy and account that
    /// produced it.
    pub fn insert_order(&self, order: &OrderRow) -> Result<String> {
        let id = if order.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            order.id.clone()
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trade_order
                 (id, account_id, strategy_id, symbol, side, size, price, order_type,
                  reduce_only, venue_oid, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                id,
                order.account_id,
                order.strategy_id,
                order.symbol,
                order.side,
                order.size,
                order.price,
                order.order_type,
                order.reduce_only as i64,
                order.venue_oid.map(|o| o as i64),
                order.status,
                Self::now()
            ],
        )
        .context("failed to insert order")?;
        Ok(id)
    }

    pub fn orders_for_account(&self, account_id: &str, limit: usize) -> Result<Vec<OrderRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, strategy_id, symbol, side, size, price, order_type,
                    reduce_only, venue_oid, status, created_at
             FROM trade_order WHERE account_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![account_id, limit as i64], |row| {
                Ok(OrderRow {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    strategy_id: row.get(2)?,
                    symbol: row.get(3)?,
                    side: row.get(4)?,
                    size: row.get(5)?,
                    price: row.get(6)?,
                    order_type: row.get(7)?,
                    reduce_only: row.get::<_, i64>(8)? != 0,
                    venue_oid: row.get::<_, Option<i64>>(9)?.map(|o| o as u64),
                    status: row.get(10)?,
                    created_at: row.get(11)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Position projection
    // -------------------------------------------------------------------------

    pub fn open_position_row(&self, position: &PositionRow) -> Result<String> {
        let id = if position.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            position.id.clone()
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO position
                 (id, account_id, strategy_id, symbol, side, size, entry_price, leverage,
                  status, opened_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'open', ?9)",
            params![
                id,
                position.account_id,
                position.strategy_id,
                position.symbol,
                position.side.to_string(),
                position.size,
                position.entry_price,
                position.leverage as i64,
                Self::now()
            ],
        )
        .context("failed to insert position")?;
        Ok(id)
    }

    pub fn close_position_row(&self, id: &str, realized_pnl: f64) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE position SET status = 'closed', closed_at = ?2, realized_pnl = ?3
             WHERE id = ?1 AND status = 'open'",
            params![id, Self::now(), realized_pnl],
        )?;
        if changed == 0 {
            bail!("position {id} is not open");
        }
        Ok(())
    }

    pub fn open_positions(&self, account_id: &str) -> Result<Vec<PositionRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM position WHERE account_id = ?1 AND status = 'open'")?;
        let rows = stmt
            .query_map(params![account_id], position_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn open_positions_for_strategy(&self, strategy_id: &str) -> Result<Vec<PositionRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM position WHERE strategy_id = ?1 AND status = 'open'")?;
        let rows = stmt
            .query_map(params![strategy_id], position_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// The open position for (account, symbol), if any.
    pub fn open_position_for_symbol(
        &self,
        account_id: &str,
        symbol: &str,
    ) -> Result<Option<PositionRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM position WHERE account_id = ?1 AND symbol = ?2 AND status = 'open'
             ORDER BY opened_at DESC LIMIT 1",
            params![account_id, symbol],
            position_from_row,
        )
        .optional()
        .context("failed to load position")
    }

    // -------------------------------------------------------------------------
    // Trade journal lifecycle
    // -------------------------------------------------------------------------

    /// Create a journal entry in `planned`.
    #[allow(clippy::too_many_arguments)]
    pub fn create_journal_entry(
        &self,
        account_id: &str,
        strategy_id: &str,
        symbol: &str,
        side: &str,
        entry_reasoning: &str,
        expectations: &str,
        planned_entry: Option<f64>,
        planned_stop: Option<f64>,
        planned_target: Option<f64>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trade_journal
                 (id, account_id, strategy_id, symbol, side, status, entry_reasoning,
                  expectations, planned_entry, planned_stop, planned_target, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'planned', ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id,
                account_id,
                strategy_id,
                symbol,
                side,
                entry_reasoning,
                expectations,
                planned_entry,
                planned_stop,
                planned_target,
                Self::now()
            ],
        )
        .context("failed to create journal entry")?;
        Ok(id)
    }

    /// planned -> active. Rejects any other starting state.
    pub fn activate_journal_entry(&self, id: &str, entry_price: f64, size: f64) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE trade_journal
             SET status = 'active', entry_price = ?2, size = ?3, activated_at = ?4
             WHERE id = ?1 AND status = 'planned'",
            params![id, entry_price, size, Self::now()],
        )?;
        if changed == 0 {
            bail!("journal entry {id} cannot be activated (not in planned)");
        }
        Ok(())
    }

    /// active -> closed, attaching the close-analysis block. `planned`
    /// entries cannot be closed directly.
    pub fn close_journal_entry(
        &self,
        id: &str,
        exit_price: f64,
        pnl: f64,
        close_analysis: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE trade_journal
             SET status = 'closed', exit_price = ?2, pnl = ?3, close_analysis = ?4, closed_at = ?5
             WHERE id = ?1 AND status = 'active'",
            params![id, exit_price, pnl, close_analysis, Self::now()],
        )?;
        if changed == 0 {
            bail!("journal entry {id} cannot be closed (not in active)");
        }
        Ok(())
    }

    pub fn journal_entry(&self, id: &str) -> Result<Option<JournalEntryRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM trade_journal WHERE id = ?1",
            params![id],
            journal_from_row,
        )
        .optional()
        .context("failed to load journal entry")
    }

    pub fn journal_entries(&self, account_id: &str, limit: usize) -> Result<Vec<JournalEntryRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM trade_journal WHERE account_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![account_id, limit as i64], journal_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// The newest planned entry for (account, symbol): the plan an incoming
    /// activation refers to.
    pub fn planned_journal_entry(
        &self,
        account_id: &str,
        symbol: &str,
    ) -> Result<Option<JournalEntryRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM trade_journal
             WHERE account_id = ?1 AND symbol = ?2 AND status = 'planned'
             ORDER BY created_at DESC LIMIT 1",
            params![account_id, symbol],
            journal_from_row,
        )
        .optional()
        .context("failed to load planned journal entry")
    }

    /// The newest active entry for (account, symbol): the trade an incoming
    /// close refers to.
    pub fn active_journal_entry(
        &self,
        account_id: &str,
        symbol: &str,
    ) -> Result<Option<JournalEntryRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM trade_journal
             WHERE account_id = ?1 AND symbol = ?2 AND status = 'active'
             ORDER BY created_at DESC LIMIT 1",
            params![account_id, symbol],
            journal_from_row,
        )
        .optional()
        .context("failed to load active journal entry")
    }
}
