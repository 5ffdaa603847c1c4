// =============================================================================
// Store: portfolio snapshots
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::store::Store;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub id: String,
    pub account_id: String,
    pub account_value: f64,
    pub margin_used: f64,
    pub position_count: u32,
    pub detail: Value,
    pub created_at: String,
}

impl Store {
    pub fn insert_snapshot(
        &self,
        account_id: &str,
        account_value: f64,
        margin_used: f64,
        position_count: u32,
        detail: &Value,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO portfolio_snapshot
                 (id, account_id, account_value, margin_used, position_count, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                account_id,
                account_value,
                margin_used,
                position_count as i64,
                detail.to_string(),
                Self::now()
            ],
        )
        .context("failed to insert snapshot")?;
        Ok(id)
    }

    pub fn latest_snapshot(&self, account_id: &str) -> Result<Option<SnapshotRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, account_id, account_value, margin_used, position_count, detail, created_at
             FROM portfolio_snapshot WHERE account_id = ?1
             ORDER BY created_at DESC LIMIT 1",
            params![account_id],
            |row| {
                let detail: String = row.get(5)?;
                Ok(SnapshotRow {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    account_value: row.get(2)?,
                    margin_used: row.get(3)?,
                    position_count: row.get::<_, i64>(4)? as u32,
                    detail: serde_json::from_str(&detail).unwrap_or(Value::Null),
                    created_at: row.get(6)?,
                })
            },
        )
        .optional()
        .context("failed to load snapshot")
    }

    pub fn snapshot_count(&self, account_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM portfolio_snapshot WHERE account_id = ?1",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_and_fetch_latest() {
        let store = Store::open_in_memory().unwrap();
        store.create_account("acct-1", None).unwrap();

        store
            .insert_snapshot("acct-1", 1000.0, 100.0, 1, &json!({ "BTC": 0.01 }))
            .unwrap();
        store
            .insert_snapshot("acct-1", 1010.0, 120.0, 2, &json!({ "BTC": 0.01, "ETH": 0.5 }))
            .unwrap();

        let latest = store.latest_snapshot("acct-1").unwrap().unwrap();
        assert!((latest.account_value - 1010.0).abs() < 1e-9);
        assert_eq!(latest.position_count, 2);
        assert_eq!(store.snapshot_count("acct-1").unwrap(), 2);
    }
}
