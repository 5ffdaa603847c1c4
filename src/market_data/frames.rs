// =============================================================================
// Normalized market-data frames and channel keys
// =============================================================================
//
// Upstream always speaks canonical bare coins ("BTC"); downstream subscribers
// may use decorated symbols ("BTC-USD", "BTC-PERP", "BTC-SPOT"). The hub
// normalizes on subscribe and re-decorates frames per subscriber on delivery.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::TradeSide;

// ---------------------------------------------------------------------------
// Channel keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelKind {
    Trades,
    L2Book,
    Candle,
}

impl ChannelKind {
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Trades => "trades",
            Self::L2Book => "l2Book",
            Self::Candle => "candle",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trades" => Some(Self::Trades),
            "l2Book" => Some(Self::L2Book),
            "candle" => Some(Self::Candle),
            _ => None,
        }
    }
}

/// Canonical upstream channel key, e.g. `trades:BTC` or `candle:BTC:1h`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub kind: ChannelKind,
    /// Canonical bare coin.
    pub coin: String,
    /// Present for candle channels only.
    pub interval: Option<String>,
}

impl ChannelKey {
    pub fn trades(coin: impl Into<String>) -> Self {
        Self {
            kind: ChannelKind::Trades,
            coin: coin.into(),
            interval: None,
        }
    }

    pub fn book(coin: impl Into<String>) -> Self {
        Self {
            kind: ChannelKind::L2Book,
            coin: coin.into(),
            interval: None,
        }
    }

    pub fn candle(coin: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            kind: ChannelKind::Candle,
            coin: coin.into(),
            interval: Some(interval.into()),
        }
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.interval {
            Some(iv) => write!(f, "{}:{}:{}", self.kind.as_wire(), self.coin, iv),
            None => write!(f, "{}:{}", self.kind.as_wire(), self.coin),
        }
    }
}

/// Strip downstream decoration from a symbol: `BTC-USD`, `BTC-PERP`,
/// `BTC-SPOT`, `btc` all normalize to `BTC`.
pub fn normalize_symbol(decorated: &str) -> String {
    let upper = decorated.trim().to_uppercase();
    for suffix in ["-USD", "-PERP", "-SPOT", "/USD"] {
        if let Some(base) = upper.strip_suffix(suffix) {
            return base.to_string();
        }
    }
    upper
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeFrame {
    pub symbol: String,
    pub side: TradeSide,
    pub px: f64,
    pub sz: f64,
    pub time_ms: i64,
    pub tid: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookLevel {
    pub px: f64,
    pub sz: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookFrame {
    pub symbol: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub time_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleFrame {
    pub symbol: String,
    pub interval: String,
    pub open_time_ms: i64,
    pub close_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trades_count: u64,
}

/// A normalized frame from one upstream channel. Serialises as
/// `{"type": "trade"|"orderBook"|"candle", "data": {...}}`, the downstream
/// bridge wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum MarketFrame {
    Trade(TradeFrame),
    #[serde(rename = "orderBook")]
    Book(BookFrame),
    Candle(CandleFrame),
}

impl MarketFrame {
    pub fn symbol(&self) -> &str {
        match self {
            Self::Trade(t) => &t.symbol,
            Self::Book(b) => &b.symbol,
            Self::Candle(c) => &c.symbol,
        }
    }

    /// Clone with the symbol replaced by a subscriber's decorated spelling.
    pub fn with_symbol(&self, symbol: &str) -> Self {
        let mut frame = self.clone();
        match &mut frame {
            Self::Trade(t) => t.symbol = symbol.to_string(),
            Self::Book(b) => b.symbol = symbol.to_string(),
            Self::Candle(c) => c.symbol = symbol.to_string(),
        }
        frame
    }
}

// ---------------------------------------------------------------------------
// Upstream message parsing
// ---------------------------------------------------------------------------

fn parse_f64(val: &Value) -> Option<f64> {
    match val {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Parse one upstream websocket text message into its channel key and frames.
/// Returns `None` for control messages (subscription acks, pongs) and for
/// anything unrecognisable; the caller logs and moves on.
pub fn parse_upstream_message(text: &str) -> Option<(ChannelKey, Vec<MarketFrame>)> {
    let root: Value = serde_json::from_str(text).ok()?;
    let channel = root["channel"].as_str()?;
    let data = &root["data"];

    match channel {
        "trades" => {
            let entries = data.as_array()?;
            let first_coin = entries.first()?["coin"].as_str()?.to_string();
            let frames = entries
                .iter()
                .filter_map(|entry| {
                    let side = match entry["side"].as_str()? {
                        "B" => TradeSide::Buy,
                        _ => TradeSide::Sell,
                    };
                    Some(MarketFrame::Trade(TradeFrame {
                        symbol: entry["coin"].as_str()?.to_string(),
                        side,
                        px: parse_f64(&entry["px"])?,
                        sz: parse_f64(&entry["sz"])?,
                        time_ms: entry["time"].as_i64().unwrap_or(0),
                        tid: entry["tid"].as_u64().unwrap_or(0),
                    }))
                })
                .collect::<Vec<_>>();
            if frames.is_empty() {
                return None;
            }
            Some((ChannelKey::trades(first_coin), frames))
        }
        "l2Book" => {
            let coin = data["coin"].as_str()?.to_string();
            let levels = data["levels"].as_array()?;
            let parse_side = |side: &Value| -> Vec<BookLevel> {
                side.as_array()
                    .map(|entries| {
                        entries
                            .iter()
                            .filter_map(|lvl| {
                                Some(BookLevel {
                                    px: parse_f64(&lvl["px"])?,
                                    sz: parse_f64(&lvl["sz"])?,
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            };
            let bids = parse_side(levels.first()?);
            let asks = parse_side(levels.get(1)?);
            let frame = MarketFrame::Book(BookFrame {
                symbol: coin.clone(),
                bids,
                asks,
                time_ms: data["time"].as_i64().unwrap_or(0),
            });
            Some((ChannelKey::book(coin), vec![frame]))
        }
        "candle" => {
            let coin = data["s"].as_str()?.to_string();
            let interval = data["i"].as_str()?.to_string();
            let frame = MarketFrame::Candle(CandleFrame {
                symbol: coin.clone(),
                interval: interval.clone(),
                open_time_ms: data["t"].as_i64()?,
                close_time_ms: data["T"].as_i64().unwrap_or(0),
                open: parse_f64(&data["o"])?,
                high: parse_f64(&data["h"])?,
                low: parse_f64(&data["l"])?,
                close: parse_f64(&data["c"])?,
                volume: parse_f64(&data["v"]).unwrap_or(0.0),
                trades_count: data["n"].as_u64().unwrap_or(0),
            });
            Some((ChannelKey::candle(coin, interval), vec![frame]))
        }
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_known_decorations() {
        assert_eq!(normalize_symbol("BTC-USD"), "BTC");
        assert_eq!(normalize_symbol("BTC-PERP"), "BTC");
        assert_eq!(normalize_symbol("eth-spot"), "ETH");
        assert_eq!(normalize_symbol("SOL/USD"), "SOL");
        assert_eq!(normalize_symbol("btc"), "BTC");
        assert_eq!(normalize_symbol("BTC"), "BTC");
    }

    #[test]
    fn channel_key_display() {
        assert_eq!(ChannelKey::trades("BTC").to_string(), "trades:BTC");
        assert_eq!(ChannelKey::book("ETH").to_string(), "l2Book:ETH");
        assert_eq!(
            ChannelKey::candle("BTC", "1h").to_string(),
            "candle:BTC:1h"
        );
    }

    #[test]
    fn parse_trades_message() {
        let text = r#"{
            "channel": "trades",
            "data": [
                { "coin": "BTC", "side": "B", "px": "43000.5", "sz": "0.01", "time": 1700000000000, "tid": 42 },
                { "coin": "BTC", "side": "S", "px": "43000.0", "sz": "0.02", "time": 1700000000001, "tid": 43 }
            ]
        }"#;
        let (key, frames) = parse_upstream_message(text).unwrap();
        assert_eq!(key, ChannelKey::trades("BTC"));
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            MarketFrame::Trade(t) => {
                assert_eq!(t.side, TradeSide::Buy);
                assert!((t.px - 43000.5).abs() < 1e-9);
            }
            other => panic!("expected trade, got {other:?}"),
        }
        match &frames[1] {
            MarketFrame::Trade(t) => assert_eq!(t.side, TradeSide::Sell),
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn parse_book_message() {
        let text = r#"{
            "channel": "l2Book",
            "data": {
                "coin": "ETH",
                "levels": [
                    [ { "px": "2300.1", "sz": "5.0", "n": 3 } ],
                    [ { "px": "2300.5", "sz": "4.0", "n": 2 } ]
                ],
                "time": 1700000000000
            }
        }"#;
        let (key, frames) = parse_upstream_message(text).unwrap();
        assert_eq!(key, ChannelKey::book("ETH"));
        match &frames[0] {
            MarketFrame::Book(b) => {
                assert_eq!(b.bids.len(), 1);
                assert_eq!(b.asks.len(), 1);
                assert!((b.bids[0].px - 2300.1).abs() < 1e-9);
            }
            other => panic!("expected book, got {other:?}"),
        }
    }

    #[test]
    fn parse_candle_message() {
        let text = r#"{
            "channel": "candle",
            "data": {
                "t": 1700000000000, "T": 1700000059999, "s": "BTC", "i": "1m",
                "o": "43000", "c": "43010", "h": "43020", "l": "42990",
                "v": "12.5", "n": 150
            }
        }"#;
        let (key, frames) = parse_upstream_message(text).unwrap();
        assert_eq!(key, ChannelKey::candle("BTC", "1m"));
        match &frames[0] {
            MarketFrame::Candle(c) => {
                assert_eq!(c.interval, "1m");
                assert!((c.close - 43010.0).abs() < 1e-9);
                assert_eq!(c.trades_count, 150);
            }
            other => panic!("expected candle, got {other:?}"),
        }
    }

    #[test]
    fn control_messages_are_ignored() {
        assert!(parse_upstream_message(r#"{"channel":"pong"}"#).is_none());
        assert!(parse_upstream_message(
            r#"{"channel":"subscriptionResponse","data":{"method":"subscribe"}}"#
        )
        .is_none());
        assert!(parse_upstream_message("not json").is_none());
    }

    #[test]
    fn with_symbol_redecorates() {
        let frame = MarketFrame::Trade(TradeFrame {
            symbol: "BTC".into(),
            side: TradeSide::Buy,
            px: 1.0,
            sz: 1.0,
            time_ms: 0,
            tid: 0,
        });
        let decorated = frame.with_symbol("BTC-PERP");
        assert_eq!(decorated.symbol(), "BTC-PERP");
        assert_eq!(frame.symbol(), "BTC");
    }
}
