// =============================================================================
// Trigger specifications
// =============================================================================
//
// Parsed from a strategy's kind-specific config object. An `indicator` trigger
// carries exactly one condition; a `composite` trigger arms only when all of
// its conditions are in the trigger zone simultaneously. Hysteresis and
// near-miss tracking always apply to the first (primary) condition.
// =============================================================================

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::indicators::IndicatorKind;

fn default_near_miss_fraction() -> f64 {
    0.8
}

/// Comparison operator against the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerOp {
    /// In the trigger zone when value < threshold.
    Lt,
    /// In the trigger zone when value > threshold.
    Gt,
}

/// One indicator comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerCondition {
    pub indicator: IndicatorKind,
    #[serde(default)]
    pub period: usize,
    pub op: TriggerOp,
    pub threshold: f64,
}

impl TriggerCondition {
    pub fn in_zone(&self, value: f64) -> bool {
        match self.op {
            TriggerOp::Lt => value < self.threshold,
            TriggerOp::Gt => value > self.threshold,
        }
    }

    /// Penetration depth past the threshold, in indicator units; zero when
    /// outside the zone.
    pub fn penetration(&self, value: f64) -> f64 {
        match self.op {
            TriggerOp::Lt => (self.threshold - value).max(0.0),
            TriggerOp::Gt => (value - self.threshold).max(0.0),
        }
    }

    /// Distance still to cover before entering the zone; zero when inside.
    pub fn approach_distance(&self, value: f64) -> f64 {
        match self.op {
            TriggerOp::Lt => (value - self.threshold).max(0.0),
            TriggerOp::Gt => (self.threshold - value).max(0.0),
        }
    }
}

/// A full trigger specification for one strategy symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSpec {
    pub id: String,
    /// Decorated or bare symbol; normalized before indicator lookup.
    pub symbol: String,
    pub conditions: Vec<TriggerCondition>,
    /// Hysteresis band in indicator units, applied to the primary condition.
    #[serde(default)]
    pub hysteresis: f64,
    #[serde(default)]
    pub cooldown_minutes: u64,
    #[serde(default = "default_near_miss_fraction")]
    pub near_miss_fraction: f64,
    #[serde(default)]
    pub description: String,
}

impl TriggerSpec {
    pub fn primary(&self) -> &TriggerCondition {
        &self.conditions[0]
    }

    pub fn is_composite(&self) -> bool {
        self.conditions.len() > 1
    }
}

// ---------------------------------------------------------------------------
// Config parsing
// ---------------------------------------------------------------------------

/// Wire shape inside a strategy config's `triggers` array. The `indicator`
/// kind inlines its single condition; `composite` nests a `conditions` list.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerSpecWire {
    id: String,
    kind: String,
    symbol: String,
    #[serde(default)]
    indicator: Option<IndicatorKind>,
    #[serde(default)]
    period: usize,
    #[serde(default)]
    op: Option<TriggerOp>,
    #[serde(default)]
    threshold: Option<f64>,
    #[serde(default)]
    conditions: Vec<TriggerCondition>,
    #[serde(default)]
    hysteresis: f64,
    #[serde(default)]
    cooldown_minutes: u64,
    #[serde(default = "default_near_miss_fraction")]
    near_miss_fraction: f64,
    #[serde(default)]
    description: String,
}

/// Parse the `triggers` array out of a strategy config object.
pub fn parse_triggers(config: &Value) -> Result<Vec<TriggerSpec>> {
    let raw = match config.get("triggers") {
        Some(Value::Array(entries)) => entries.clone(),
        Some(_) => bail!("strategy config `triggers` must be an array"),
        None => return Ok(Vec::new()),
    };

    let mut specs = Vec::with_capacity(raw.len());
    for entry in raw {
        let wire: TriggerSpecWire = serde_json::from_value(entry)
            .context("failed to parse trigger spec from strategy config")?;

        let conditions = match wire.kind.as_str() {
            "indicator" => {
                let indicator = wire
                    .indicator
                    .with_context(|| format!("trigger {} missing indicator", wire.id))?;
                let op = wire
                    .op
                    .with_context(|| format!("trigger {} missing op", wire.id))?;
                let threshold = wire
                    .threshold
                    .with_context(|| format!("trigger {} missing threshold", wire.id))?;
                vec![TriggerCondition {
                    indicator,
                    period: wire.period,
                    op,
                    threshold,
                }]
            }
            "composite" => {
                if wire.conditions.is_empty() {
                    bail!("composite trigger {} has no conditions", wire.id);
                }
                wire.conditions
            }
            other => bail!("trigger {} has unknown kind {other}", wire.id),
        };

        if !(0.0..=1.0).contains(&wire.near_miss_fraction) {
            bail!("trigger {} nearMissFraction out of [0, 1]", wire.id);
        }

        specs.push(TriggerSpec {
            id: wire.id,
            symbol: wire.symbol,
            conditions,
            hysteresis: wire.hysteresis.max(0.0),
            cooldown_minutes: wire.cooldown_minutes,
            near_miss_fraction: wire.near_miss_fraction,
            description: wire.description,
        });
    }

    Ok(specs)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn zone_and_penetration() {
        let cond = TriggerCondition {
            indicator: IndicatorKind::Rsi,
            period: 14,
            op: TriggerOp::Lt,
            threshold: 30.0,
        };
        assert!(cond.in_zone(25.0));
        assert!(!cond.in_zone(30.0));
        assert_eq!(cond.penetration(25.0), 5.0);
        assert_eq!(cond.penetration(35.0), 0.0);
        assert_eq!(cond.approach_distance(35.0), 5.0);
        assert_eq!(cond.approach_distance(25.0), 0.0);

        let gt = TriggerCondition {
            indicator: IndicatorKind::Rsi,
            period: 14,
            op: TriggerOp::Gt,
            threshold: 70.0,
        };
        assert!(gt.in_zone(75.0));
        assert_eq!(gt.penetration(75.0), 5.0);
        assert_eq!(gt.approach_distance(60.0), 10.0);
    }

    #[test]
    fn parse_indicator_trigger() {
        let config = json!({
            "triggers": [{
                "id": "rsi-oversold",
                "kind": "indicator",
                "symbol": "BTC-PERP",
                "indicator": "rsi",
                "period": 14,
                "op": "lt",
                "threshold": 30.0,
                "hysteresis": 5.0,
                "cooldownMinutes": 30,
                "description": "RSI oversold"
            }]
        });
        let specs = parse_triggers(&config).unwrap();
        assert_eq!(specs.len(), 1);
        let spec = &specs[0];
        assert_eq!(spec.id, "rsi-oversold");
        assert!(!spec.is_composite());
        assert_eq!(spec.primary().threshold, 30.0);
        assert_eq!(spec.cooldown_minutes, 30);
        assert_eq!(spec.near_miss_fraction, 0.8);
    }

    #[test]
    fn parse_composite_trigger() {
        let config = json!({
            "triggers": [{
                "id": "squeeze",
                "kind": "composite",
                "symbol": "ETH",
                "conditions": [
                    { "indicator": "bollinger_width", "op": "lt", "threshold": 0.04 },
                    { "indicator": "volume_sma", "period": 20, "op": "gt", "threshold": 1000.0 }
                ],
                "hysteresis": 0.005,
                "cooldownMinutes": 60
            }]
        });
        let specs = parse_triggers(&config).unwrap();
        assert!(specs[0].is_composite());
        assert_eq!(specs[0].conditions.len(), 2);
    }

    #[test]
    fn parse_rejects_malformed() {
        let missing_threshold = json!({
            "triggers": [{ "id": "x", "kind": "indicator", "symbol": "BTC",
                           "indicator": "rsi", "op": "lt" }]
        });
        assert!(parse_triggers(&missing_threshold).is_err());

        let bad_kind = json!({
            "triggers": [{ "id": "x", "kind": "mystery", "symbol": "BTC" }]
        });
        assert!(parse_triggers(&bad_kind).is_err());

        let empty_composite = json!({
            "triggers": [{ "id": "x", "kind": "composite", "symbol": "BTC" }]
        });
        assert!(parse_triggers(&empty_composite).is_err());
    }

    #[test]
    fn no_triggers_is_fine() {
        assert!(parse_triggers(&json!({})).unwrap().is_empty());
    }
}
