// =============================================================================
// Structured trade actions — the router's output contract
// =============================================================================
//
// The provider must return a single JSON object. It is parsed into a strict
// schema here; downstream components only ever see typed actions. Anything
// that does not fit the schema is a malformed response, never a guess.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::types::PositionSide;

pub const MIN_LEVERAGE: u32 = 1;
pub const MAX_LEVERAGE: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Buy,
    Sell,
    Hold,
    Close,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
            Self::Hold => write!(f, "hold"),
            Self::Close => write!(f, "close"),
        }
    }
}

/// One validated trade intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeAction {
    pub kind: ActionKind,
    pub symbol: String,
    #[serde(default)]
    pub side: Option<PositionSide>,
    #[serde(default)]
    pub size: f64,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub expected_entry: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
}

fn default_leverage() -> u32 {
    1
}

/// The provider's full structured response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningOutcome {
    #[serde(default)]
    pub interpretation: String,
    #[serde(default)]
    pub actions: Vec<TradeAction>,
    #[serde(default)]
    pub risk_management: String,
    #[serde(default)]
    pub expected_outcome: String,
}

/// Parse and validate a provider response body into a [`ReasoningOutcome`].
pub fn parse_outcome(raw: &str) -> Result<ReasoningOutcome, EngineError> {
    let body = strip_code_fences(raw);

    let outcome: ReasoningOutcome = serde_json::from_str(body)
        .map_err(|e| EngineError::MalformedResponse(format!("not a valid response object: {e}")))?;

    for (i, action) in outcome.actions.iter().enumerate() {
        validate_action(action)
            .map_err(|reason| EngineError::MalformedResponse(format!("action[{i}]: {reason}")))?;
    }

    Ok(outcome)
}

fn validate_action(action: &TradeAction) -> Result<(), String> {
    if action.symbol.trim().is_empty() {
        return Err("missing symbol".into());
    }
    if !(MIN_LEVERAGE..=MAX_LEVERAGE).contains(&action.leverage) {
        return Err(format!(
            "leverage {} outside [{MIN_LEVERAGE}, {MAX_LEVERAGE}]",
            action.leverage
        ));
    }
    match action.kind {
        ActionKind::Buy | ActionKind::Sell => {
            if action.side.is_none() {
                return Err("buy/sell requires a side".into());
            }
            if !(action.size > 0.0 && action.size.is_finite()) {
                return Err("buy/sell requires a positive size".into());
            }
        }
        ActionKind::Hold | ActionKind::Close => {}
    }
    for (name, value) in [
        ("expectedEntry", action.expected_entry),
        ("stopLoss", action.stop_loss),
        ("takeProfit", action.take_profit),
    ] {
        if let Some(v) = value {
            if !(v > 0.0 && v.is_finite()) {
                return Err(format!("{name} must be positive"));
            }
        }
    }
    Ok(())
}

/// Providers occasionally wrap the object in a markdown fence despite the
/// JSON instruction; tolerate exactly that and nothing else.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_response() {
        let raw = r#"{
            "interpretation": "BTC oversold on the 1m, book skewed to bids",
            "actions": [
                {
                    "kind": "buy", "symbol": "BTC", "side": "long", "size": 0.01,
                    "leverage": 3, "reasoning": "RSI 24 with bid support",
                    "expectedEntry": 43000.0, "stopLoss": 42000.0, "takeProfit": 44500.0
                },
                { "kind": "hold", "symbol": "ETH", "reasoning": "no edge" }
            ],
            "riskManagement": "stop at 42k caps loss to 2.3%",
            "expectedOutcome": "bounce to 44.5k within 4h"
        }"#;
        let outcome = parse_outcome(raw).unwrap();
        assert_eq!(outcome.actions.len(), 2);
        assert_eq!(outcome.actions[0].kind, ActionKind::Buy);
        assert_eq!(outcome.actions[0].side, Some(PositionSide::Long));
        assert_eq!(outcome.actions[0].leverage, 3);
        assert_eq!(outcome.actions[1].kind, ActionKind::Hold);
    }

    #[test]
    fn tolerates_markdown_fence() {
        let raw = "```json\n{\"interpretation\":\"flat\",\"actions\":[]}\n```";
        let outcome = parse_outcome(raw).unwrap();
        assert!(outcome.actions.is_empty());
    }

    #[test]
    fn rejects_non_json() {
        assert!(matches!(
            parse_outcome("I think you should buy BTC"),
            Err(EngineError::MalformedResponse(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_leverage() {
        let raw = r#"{ "actions": [
            { "kind": "buy", "symbol": "BTC", "side": "long", "size": 1.0, "leverage": 25 }
        ] }"#;
        let err = parse_outcome(raw).unwrap_err();
        assert!(err.to_string().contains("leverage"));
    }

    #[test]
    fn rejects_buy_without_side_or_size() {
        let no_side = r#"{ "actions": [ { "kind": "buy", "symbol": "BTC", "size": 1.0 } ] }"#;
        assert!(parse_outcome(no_side).is_err());

        let no_size = r#"{ "actions": [ { "kind": "sell", "symbol": "BTC", "side": "short" } ] }"#;
        assert!(parse_outcome(no_size).is_err());
    }

    #[test]
    fn close_needs_no_size() {
        let raw = r#"{ "actions": [ { "kind": "close", "symbol": "ETH" } ] }"#;
        let outcome = parse_outcome(raw).unwrap();
        assert_eq!(outcome.actions[0].kind, ActionKind::Close);
    }

    #[test]
    fn rejects_nonpositive_price_levels() {
        let raw = r#"{ "actions": [
            { "kind": "buy", "symbol": "BTC", "side": "long", "size": 1.0, "stopLoss": -5.0 }
        ] }"#;
        assert!(parse_outcome(raw).is_err());
    }
}
