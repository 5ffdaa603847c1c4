// =============================================================================
// Evaluation & Aggregation — score closed trades, decay and consolidate
// learnings
// =============================================================================
//
// Per-close: score PnL and target attainment, classify the regime the trade
// ran in, persist a TradeEvaluation, and reinforce (or create) the learning
// record for its category bucket.
//
// Daily, per account:
//   1. Decay active learnings: exp(-daysSinceUpdate / 30), clamped into
//      [epsilon, 1]. updated_at is advanced to now, so a second pass within
//      the same run multiplies by exactly 1.0. Clock skew (negative age)
//      resets the weight to 1.0.
//   2. Archive records whose effective confidence drops below the floor.
//   3. Per-regime aggregates: count, win rate, average PnL, annualised
//      Sharpe with the √252 factor.
//   4. Consolidate duplicate (category, subcategory) buckets: the record
//      with the largest sample survives, the rest are archived.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::store::learnings::EPSILON_WEIGHT;
use crate::store::{JournalEntryRow, LearningRow, Store};
use crate::types::Regime;

/// Decay time constant in days.
pub const DECAY_HALF_DAYS: f64 = 30.0;
/// Records below this effective confidence are archived.
pub const ARCHIVE_CONFIDENCE_FLOOR: f64 = 20.0;
/// Annualisation factor for daily Sharpe.
const SHARPE_ANNUALISATION: f64 = 15.874_507_866_387_544; // sqrt(252)

// ---------------------------------------------------------------------------
// Per-close evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeScore {
    pub pnl: f64,
    pub target_hit: bool,
    pub regime: Regime,
    /// [-1, 1] composite used to adjust learning confidence.
    pub score: f64,
}

/// Score a closed journal entry against the regime its trade window ran in.
pub fn score_trade(entry: &JournalEntryRow, regime: Regime) -> TradeScore {
    let pnl = entry.pnl.unwrap_or(0.0);

    let target_hit = match (entry.planned_target, entry.exit_price, entry.side.as_str()) {
        (Some(target), Some(exit), "short") => exit <= target,
        (Some(target), Some(exit), _) => exit >= target,
        _ => false,
    };

    // Normalise PnL against the entry notional when available.
    let notional = entry
        .entry_price
        .zip(entry.size)
        .map(|(px, sz)| px * sz)
        .filter(|n| *n > 0.0);
    let pnl_fraction = notional.map(|n| pnl / n).unwrap_or(0.0);

    let mut score = pnl_fraction.clamp(-1.0, 1.0);
    if target_hit {
        score = (score + 0.25).min(1.0);
    }

    TradeScore {
        pnl,
        target_hit,
        regime,
        score,
    }
}

/// Persist the evaluation and reinforce the learning bucket for this close.
pub fn record_trade_close(
    store: &Arc<Store>,
    entry: &JournalEntryRow,
    regime: Regime,
) -> Result<TradeScore> {
    let score = score_trade(entry, regime);

    store.insert_evaluation(
        &entry.account_id,
        &entry.id,
        score.pnl,
        score.target_hit,
        score.regime,
        score.score,
    )?;

    // Bucket by (regime, symbol): the learning says how this setup behaves
    // in this market state.
    let category = format!("regime:{}", score.regime);
    let subcategory = entry.symbol.clone();
    let outcome = if score.pnl >= 0.0 { "profitable" } else { "losing" };
    let content = format!(
        "{} {} trades in a {} regime have been {}",
        entry.symbol, entry.side, score.regime, outcome
    );

    match store.active_learning(&entry.account_id, &category, &subcategory)? {
        Some(existing) => {
            // Blend confidence toward the new observation.
            let observation = 50.0 + score.score * 50.0;
            let blended = existing.confidence_score * 0.8 + observation * 0.2;
            store.reinforce_learning(&existing.id, blended, &content)?;
        }
        None => {
            let confidence = 50.0 + score.score * 25.0;
            store.insert_learning(&entry.account_id, &category, &subcategory, &content, confidence)?;
        }
    }

    info!(
        account_id = %entry.account_id,
        journal_id = %entry.id,
        pnl = score.pnl,
        regime = %score.regime,
        target_hit = score.target_hit,
        "trade close evaluated"
    );
    Ok(score)
}

// ---------------------------------------------------------------------------
// Decay
// ---------------------------------------------------------------------------

/// New decay weight for a record, given its age at `now`. Negative age
/// (clock skew) resets to 1.0.
pub fn decayed_weight(record: &LearningRow, now: DateTime<Utc>) -> f64 {
    let updated_at = match DateTime::parse_from_rfc3339(&record.updated_at) {
        Ok(t) => t.with_timezone(&Utc),
        Err(_) => return record.decay_weight,
    };

    let days_since_update = (now - updated_at).num_seconds() as f64 / 86_400.0;
    if days_since_update < 0.0 {
        return 1.0;
    }

    let decay = (-days_since_update / DECAY_HALF_DAYS).exp();
    (record.decay_weight * decay).clamp(EPSILON_WEIGHT, 1.0)
}

// ---------------------------------------------------------------------------
// Per-regime aggregates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeAggregate {
    pub regime: Regime,
    pub count: usize,
    pub win_rate: f64,
    pub avg_pnl: f64,
    pub sharpe: f64,
}

/// Count / win rate / average PnL / annualised Sharpe per regime bucket.
pub fn regime_aggregates(evaluations: &[(Regime, f64)]) -> Vec<RegimeAggregate> {
    let mut buckets: HashMap<Regime, Vec<f64>> = HashMap::new();
    for (regime, pnl) in evaluations {
        buckets.entry(*regime).or_default().push(*pnl);
    }

    let mut aggregates: Vec<RegimeAggregate> = buckets
        .into_iter()
        .map(|(regime, pnls)| {
            let count = pnls.len();
            let wins = pnls.iter().filter(|p| **p > 0.0).count();
            let mean = pnls.iter().sum::<f64>() / count as f64;
            let variance =
                pnls.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / count as f64;
            let std = variance.sqrt();
            let sharpe = if std > 0.0 {
                mean / std * SHARPE_ANNUALISATION
            } else {
                0.0
            };
            RegimeAggregate {
                regime,
                count,
                win_rate: wins as f64 / count as f64,
                avg_pnl: mean,
                sharpe,
            }
        })
        .collect();
    aggregates.sort_by_key(|a| a.regime.to_string());
    aggregates
}

// ---------------------------------------------------------------------------
// Daily aggregation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationReport {
    pub account_id: String,
    pub decayed: usize,
    pub archived: usize,
    pub consolidated: usize,
    pub aggregates: Vec<RegimeAggregate>,
}

/// One scheduled aggregation run for one account.
pub fn run_daily_aggregation(
    store: &Arc<Store>,
    account_id: &str,
    now: DateTime<Utc>,
) -> Result<AggregationReport> {
    let now_str = now.to_rfc3339();
    let records = store
        .active_learnings(account_id)
        .context("failed to load learnings for aggregation")?;

    // 1. Decay, advancing updated_at so the pass is idempotent within a run.
    let mut decayed = 0;
    for record in &records {
        let new_weight = decayed_weight(record, now);
        if (new_weight - record.decay_weight).abs() > f64::EPSILON {
            decayed += 1;
        }
        store.apply_learning_decay(&record.id, new_weight, &now_str)?;
    }

    // 2. Archive below the effective-confidence floor.
    let mut archived = 0;
    for record in store.active_learnings(account_id)? {
        if record.effective_confidence() < ARCHIVE_CONFIDENCE_FLOOR {
            debug!(
                id = %record.id,
                effective = record.effective_confidence(),
                "archiving low-confidence learning"
            );
            store.archive_learning(&record.id)?;
            archived += 1;
        }
    }

    // 3. Per-regime aggregates over recorded evaluations.
    let evaluations = store.evaluations_for_account(account_id, 1000)?;
    let aggregates =
        regime_aggregates(&evaluations.iter().map(|e| (e.regime, e.pnl)).collect::<Vec<_>>());

    // 4. Consolidate duplicates: keep the largest sample per bucket.
    let mut consolidated = 0;
    let mut buckets: HashMap<(String, String), Vec<LearningRow>> = HashMap::new();
    for record in store.active_learnings(account_id)? {
        buckets
            .entry((record.category.clone(), record.subcategory.clone()))
            .or_default()
            .push(record);
    }
    for (_, mut bucket) in buckets {
        if bucket.len() < 2 {
            continue;
        }
        bucket.sort_by(|a, b| b.sample_size.cmp(&a.sample_size));
        for duplicate in &bucket[1..] {
            store.archive_learning(&duplicate.id)?;
            consolidated += 1;
        }
    }

    store.record_aggregation_run(account_id, &now_str)?;

    let report = AggregationReport {
        account_id: account_id.to_string(),
        decayed,
        archived,
        consolidated,
        aggregates,
    };
    info!(
        account_id,
        decayed = report.decayed,
        archived = report.archived,
        consolidated = report.consolidated,
        "daily aggregation complete"
    );
    Ok(report)
}

/// Whether an account's daily aggregation is due at `now`.
pub fn aggregation_due(store: &Arc<Store>, account_id: &str, now: DateTime<Utc>) -> bool {
    match store.last_aggregation_run(account_id) {
        Ok(Some(last)) => match DateTime::parse_from_rfc3339(&last) {
            Ok(t) => now - t.with_timezone(&Utc) >= chrono::Duration::hours(24),
            Err(_) => true,
        },
        Ok(None) => true,
        Err(e) => {
            warn!(account_id, error = %e, "failed to read last aggregation run");
            false
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JournalStatus;
    use chrono::Duration;

    fn learning(weight: f64, confidence: f64, updated_at: DateTime<Utc>) -> LearningRow {
        LearningRow {
            id: "l1".into(),
            account_id: "acct-1".into(),
            category: "entry".into(),
            subcategory: "dip".into(),
            content: "x".into(),
            sample_size: 3,
            confidence_score: confidence,
            decay_weight: weight,
            is_active: true,
            updated_at: updated_at.to_rfc3339(),
        }
    }

    fn closed_entry(pnl: f64, target: Option<f64>, exit: Option<f64>) -> JournalEntryRow {
        JournalEntryRow {
            id: "j1".into(),
            account_id: "acct-1".into(),
            strategy_id: "s1".into(),
            symbol: "BTC".into(),
            side: "long".into(),
            status: JournalStatus::Closed,
            entry_reasoning: String::new(),
            expectations: String::new(),
            planned_entry: Some(43000.0),
            planned_stop: Some(42000.0),
            planned_target: target,
            entry_price: Some(43000.0),
            exit_price: exit,
            size: Some(0.01),
            pnl: Some(pnl),
            close_analysis: Some("done".into()),
            created_at: Utc::now().to_rfc3339(),
            activated_at: Some(Utc::now().to_rfc3339()),
            closed_at: Some(Utc::now().to_rfc3339()),
        }
    }

    #[test]
    fn decay_follows_exponential() {
        let now = Utc::now();
        let record = learning(1.0, 50.0, now - Duration::days(30));
        let weight = decayed_weight(&record, now);
        // exp(-1) = 0.3679
        assert!((weight - (-1.0f64).exp()).abs() < 1e-3);
    }

    #[test]
    fn decay_clock_skew_resets_to_one() {
        let now = Utc::now();
        let record = learning(0.5, 50.0, now + Duration::days(2));
        assert_eq!(decayed_weight(&record, now), 1.0);
    }

    #[test]
    fn decay_is_idempotent_after_updated_at_advances() {
        let now = Utc::now();
        // First pass: 60 days of age.
        let record = learning(1.0, 50.0, now - Duration::days(60));
        let first = decayed_weight(&record, now);
        // Second pass in the same run: updated_at has been advanced to now.
        let refreshed = learning(first, 50.0, now);
        let second = decayed_weight(&refreshed, now);
        assert!((second - first).abs() < 1e-12);
    }

    #[test]
    fn sixty_day_decay_archives_a_confidence_50_record() {
        // Spec scenario: 50 * e^(-60/30) ~= 6.77 < 20 -> archived.
        let store = Store::open_in_memory().unwrap();
        store.create_account("acct-1", None).unwrap();
        let id = store
            .insert_learning("acct-1", "entry", "dip", "buy dips", 50.0)
            .unwrap();

        // Backdate the record by 60 days.
        let past = (Utc::now() - Duration::days(60)).to_rfc3339();
        store
            .conn
            .lock()
            .execute(
                "UPDATE learning_record SET updated_at = ?2 WHERE id = ?1",
                rusqlite::params![id, past],
            )
            .unwrap();

        let report = run_daily_aggregation(&store, "acct-1", Utc::now()).unwrap();
        assert_eq!(report.archived, 1);
        assert!(store.active_learnings("acct-1").unwrap().is_empty());
    }

    #[test]
    fn score_trade_target_and_sides() {
        // Long that reached its target.
        let score = score_trade(&closed_entry(15.0, Some(44000.0), Some(44100.0)), Regime::Bullish);
        assert!(score.target_hit);
        assert!(score.score > 0.0);

        // Long that missed it.
        let score = score_trade(&closed_entry(-10.0, Some(44000.0), Some(42500.0)), Regime::Bearish);
        assert!(!score.target_hit);
        assert!(score.score < 0.0);

        // Short: target is below.
        let mut entry = closed_entry(5.0, Some(41000.0), Some(40900.0));
        entry.side = "short".into();
        assert!(score_trade(&entry, Regime::Neutral).target_hit);
    }

    #[test]
    fn record_trade_close_creates_then_reinforces_learning() {
        let store = Store::open_in_memory().unwrap();
        store.create_account("acct-1", None).unwrap();

        record_trade_close(&store, &closed_entry(15.0, None, None), Regime::Bullish).unwrap();
        let rec = store
            .active_learning("acct-1", "regime:bullish", "BTC")
            .unwrap()
            .unwrap();
        assert_eq!(rec.sample_size, 1);

        record_trade_close(&store, &closed_entry(-5.0, None, None), Regime::Bullish).unwrap();
        let rec = store
            .active_learning("acct-1", "regime:bullish", "BTC")
            .unwrap()
            .unwrap();
        assert_eq!(rec.sample_size, 2);
    }

    #[test]
    fn regime_aggregates_win_rate_and_sharpe() {
        let evals = vec![
            (Regime::Bullish, 10.0),
            (Regime::Bullish, -5.0),
            (Regime::Bullish, 20.0),
            (Regime::Volatile, -2.0),
        ];
        let aggregates = regime_aggregates(&evals);
        let bullish = aggregates
            .iter()
            .find(|a| a.regime == Regime::Bullish)
            .unwrap();
        assert_eq!(bullish.count, 3);
        assert!((bullish.win_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((bullish.avg_pnl - 25.0 / 3.0).abs() < 1e-9);
        assert!(bullish.sharpe > 0.0);

        let volatile = aggregates
            .iter()
            .find(|a| a.regime == Regime::Volatile)
            .unwrap();
        // Single sample: zero variance, Sharpe reported as zero.
        assert_eq!(volatile.sharpe, 0.0);
    }

    #[test]
    fn consolidation_keeps_largest_sample() {
        let store = Store::open_in_memory().unwrap();
        store.create_account("acct-1", None).unwrap();

        let small = store
            .insert_learning("acct-1", "entry", "dip", "few samples", 80.0)
            .unwrap();
        let big = store
            .insert_learning("acct-1", "entry", "dip", "many samples", 80.0)
            .unwrap();
        for _ in 0..4 {
            store.reinforce_learning(&big, 80.0, "many samples").unwrap();
        }

        let report = run_daily_aggregation(&store, "acct-1", Utc::now()).unwrap();
        assert_eq!(report.consolidated, 1);

        let remaining = store.active_learnings("acct-1").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, big);
        let _ = small;
    }

    #[test]
    fn aggregation_due_respects_24h() {
        let store = Store::open_in_memory().unwrap();
        store.create_account("acct-1", None).unwrap();
        let now = Utc::now();

        assert!(aggregation_due(&store, "acct-1", now));
        store
            .record_aggregation_run("acct-1", &now.to_rfc3339())
            .unwrap();
        assert!(!aggregation_due(&store, "acct-1", now + Duration::hours(1)));
        assert!(aggregation_due(&store, "acct-1", now + Duration::hours(25)));
    }
}
