// =============================================================================
// Store: learning records and trade evaluations
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::Store;
use crate::types::Regime;

/// Decay weights are clamped into [EPSILON_WEIGHT, 1.0].
pub const EPSILON_WEIGHT: f64 = 0.001;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningRow {
    pub id: String,
    pub account_id: String,
    pub category: String,
    pub subcategory: String,
    pub content: String,
    pub sample_size: u64,
    pub confidence_score: f64,
    pub decay_weight: f64,
    pub is_active: bool,
    pub updated_at: String,
}

impl LearningRow {
    /// Effective confidence drives archival: score x decay weight.
    pub fn effective_confidence(&self) -> f64 {
        self.confidence_score * self.decay_weight
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvaluationRow {
    pub id: String,
    pub account_id: String,
    pub journal_id: String,
    pub pnl: f64,
    pub target_hit: bool,
    pub regime: Regime,
    pub score: f64,
    pub created_at: String,
}

fn learning_from_row(row: &Row<'_>) -> rusqlite::Result<LearningRow> {
    Ok(LearningRow {
        id: row.get("id")?,
        account_id: row.get("account_id")?,
        category: row.get("category")?,
        subcategory: row.get("subcategory")?,
        content: row.get("content")?,
        sample_size: row.get::<_, i64>("sample_size")? as u64,
        confidence_score: row.get("confidence_score")?,
        decay_weight: row.get("decay_weight")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
        updated_at: row.get("updated_at")?,
    })
}

impl Store {
    // -------------------------------------------------------------------------
    // Learning records
    // -------------------------------------------------------------------------

    pub fn insert_learning(
        &self,
        account_id: &str,
        category: &str,
        subcategory: &str,
        content: &str,
        confidence_score: f64,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO learning_record
                 (id, account_id, category, subcategory, content, sample_size,
                  confidence_score, decay_weight, is_active, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, 1.0, 1, ?7)",
            params![
                id,
                account_id,
                category,
                subcategory,
                content,
                confidence_score,
                Self::now()
            ],
        )
        .context("failed to insert learning record")?;
        Ok(id)
    }

    /// The active record in a (category, subcategory) bucket, if any.
    pub fn active_learning(
        &self,
        account_id: &str,
        category: &str,
        subcategory: &str,
    ) -> Result<Option<LearningRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM learning_record
             WHERE account_id = ?1 AND category = ?2 AND subcategory = ?3 AND is_active = 1
             ORDER BY sample_size DESC LIMIT 1",
            params![account_id, category, subcategory],
            learning_from_row,
        )
        .optional()
        .context("failed to load learning record")
    }

    pub fn active_learnings(&self, account_id: &str) -> Result<Vec<LearningRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM learning_record WHERE account_id = ?1 AND is_active = 1")?;
        let rows = stmt
            .query_map(params![account_id], learning_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Reinforce a record: bump sample size, blend confidence, reset decay.
    pub fn reinforce_learning(
        &self,
        id: &str,
        new_confidence: f64,
        content: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE learning_record
             SET sample_size = sample_size + 1,
                 confidence_score = ?2,
                 content = ?3,
                 decay_weight = 1.0,
                 updated_at = ?4
             WHERE id = ?1",
            params![id, new_confidence, content, Self::now()],
        )?;
        Ok(())
    }

    /// Apply a decay pass result. `updated_at` is advanced so a second pass
    /// in the same run decays by a factor of 1.0.
    pub fn apply_learning_decay(&self, id: &str, new_weight: f64, now: &str) -> Result<()> {
        let clamped = new_weight.clamp(EPSILON_WEIGHT, 1.0);
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE learning_record SET decay_weight = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, clamped, now],
        )?;
        Ok(())
    }

    pub fn archive_learning(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE learning_record SET is_active = 0 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Trade evaluations
    // -------------------------------------------------------------------------

    pub fn insert_evaluation(
        &self,
        account_id: &str,
        journal_id: &str,
        pnl: f64,
        target_hit: bool,
        regime: Regime,
        score: f64,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trade_evaluation
                 (id, account_id, journal_id, pnl, target_hit, regime, score, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                account_id,
                journal_id,
                pnl,
                target_hit as i64,
                regime.to_string(),
                score,
                Self::now()
            ],
        )
        .context("failed to insert trade evaluation")?;
        Ok(id)
    }

    pub fn evaluations_for_account(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<TradeEvaluationRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, journal_id, pnl, target_hit, regime, score, created_at
             FROM trade_evaluation WHERE account_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![account_id, limit as i64], |row| {
                let regime: String = row.get(5)?;
                Ok(TradeEvaluationRow {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    journal_id: row.get(2)?,
                    pnl: row.get(3)?,
                    target_hit: row.get::<_, i64>(4)? != 0,
                    regime: Regime::parse(&regime).unwrap_or(Regime::Neutral),
                    score: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Aggregation bookkeeping
    // -------------------------------------------------------------------------

    pub fn last_aggregation_run(&self, account_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT ran_at FROM aggregation_run WHERE account_id = ?1",
            params![account_id],
            |row| row.get(0),
        )
        .optional()
        .context("failed to load aggregation run")
    }

    pub fn record_aggregation_run(&self, account_id: &str, ran_at: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO aggregation_run (account_id, ran_at) VALUES (?1, ?2)
             ON CONFLICT(account_id) DO UPDATE SET ran_at = excluded.ran_at",
            params![account_id, ran_at],
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

    #[test]
    fn learning_reinforce_and_archive() {
        let store = Store::open_in_memory().unwrap();
        store.create_account("acct-1", None).unwrap();

        let id = store
            .insert_learning("acct-1", "entry", "rsi-oversold", "buy dips works", 50.0)
            .unwrap();

        let rec = store
            .active_learning("acct-1", "entry", "rsi-oversold")
            .unwrap()
            .unwrap();
        assert_eq!(rec.sample_size, 1);
        assert!((rec.effective_confidence() - 50.0).abs() < 1e-9);

        store
            .reinforce_learning(&id, 55.0, "buy dips works, 2 samples")
            .unwrap();
        let rec = store
            .active_learning("acct-1", "entry", "rsi-oversold")
            .unwrap()
            .unwrap();
        assert_eq!(rec.sample_size, 2);
        assert!((rec.confidence_score - 55.0).abs() < 1e-9);

        store.archive_learning(&id).unwrap();
        assert!(store
            .active_learning("acct-1", "entry", "rsi-oversold")
            .unwrap()
            .is_none());
    }

    #[test]
    fn decay_clamps_to_epsilon() {
        let store = Store::open_in_memory().unwrap();
        store.create_account("acct-1", None).unwrap();
        let id = store
            .insert_learning("acct-1", "exit", "early", "exits too early", 40.0)
            .unwrap();

        store
            .apply_learning_decay(&id, 0.0000001, &Store::now())
            .unwrap();
        let rec = store.active_learnings("acct-1").unwrap().remove(0);
        assert!((rec.decay_weight - EPSILON_WEIGHT).abs() < 1e-12);

        store.apply_learning_decay(&id, 5.0, &Store::now()).unwrap();
        let rec = store.active_learnings("acct-1").unwrap().remove(0);
        assert!((rec.decay_weight - 1.0).abs() < 1e-12);
    }

    #[test]
    fn evaluations_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        store.create_account("acct-1", None).unwrap();

        store
            .insert_evaluation("acct-1", "journal-1", 12.5, true, Regime::Bullish, 0.8)
            .unwrap();
        store
            .insert_evaluation("acct-1", "journal-2", -4.0, false, Regime::Volatile, 0.3)
            .unwrap();

        let evals = store.evaluations_for_account("acct-1", 10).unwrap();
        assert_eq!(evals.len(), 2);
        assert!(evals.iter().any(|e| e.regime == Regime::Bullish));
    }

    #[test]
    fn aggregation_run_upserts() {
        let store = Store::open_in_memory().unwrap();
        store.create_account("acct-1", None).unwrap();

        assert!(store.last_aggregation_run("acct-1").unwrap().is_none());
        store.record_aggregation_run("acct-1", "2026-03-01T00:00:00Z").unwrap();
        store.record_aggregation_run("acct-1", "2026-03-02T00:00:00Z").unwrap();
        assert_eq!(
            store.last_aggregation_run("acct-1").unwrap().unwrap(),
            "2026-03-02T00:00:00Z"
        );
    }
}
