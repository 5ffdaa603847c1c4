// =============================================================================
// Venue wire types and tick rounding
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::PositionSide;

/// Maximum total decimal places for a perp price. Price decimals are capped at
/// `MAX_PRICE_DECIMALS - sz_decimals` per instrument.
pub const MAX_PRICE_DECIMALS: i32 = 6;

// ---------------------------------------------------------------------------
// Instruments
// ---------------------------------------------------------------------------

/// A tradeable instrument from the venue's `meta` enumeration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    /// Canonical bare coin, e.g. "BTC".
    pub symbol: String,
    /// Decimal places of the size tick.
    pub sz_decimals: u32,
    /// Venue-enforced maximum leverage.
    pub max_leverage: u32,
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
}

impl TimeInForce {
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Gtc => "Gtc",
            Self::Ioc => "Ioc",
        }
    }
}

/// Requested order type. A market order is encoded on the wire as an
/// aggressive IOC limit at the caller-supplied price bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit(TimeInForce),
}

/// One order to be signed and submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub is_buy: bool,
    pub size: f64,
    /// Limit price, or the price bound for a market order.
    pub limit_px: f64,
    pub order_type: OrderType,
    pub reduce_only: bool,
}

/// Parsed per-order status from the exchange response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrderStatus {
    Resting { oid: u64 },
    Filled { oid: u64, avg_px: f64, total_sz: f64 },
    Rejected { reason: String },
}

impl OrderStatus {
    pub fn oid(&self) -> Option<u64> {
        match self {
            Self::Resting { oid } | Self::Filled { oid, .. } => Some(*oid),
            Self::Rejected { .. } => None,
        }
    }
}

/// A raw open order as reported by the venue. TP/SL role is not a property of
/// this layer; callers infer it from trigger price vs. current price and
/// position side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueOrder {
    pub oid: u64,
    pub symbol: String,
    pub is_buy: bool,
    pub limit_px: f64,
    pub size: f64,
    pub orig_size: f64,
    pub trigger_px: Option<f64>,
    pub reduce_only: bool,
    pub timestamp_ms: i64,
}

// ---------------------------------------------------------------------------
// User state
// ---------------------------------------------------------------------------

/// One open perpetuals position from the clearinghouse state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: String,
    pub side: PositionSide,
    /// Absolute position size in coins.
    pub size: f64,
    pub entry_px: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
    pub margin_used: f64,
    pub liquidation_px: Option<f64>,
}

/// Aggregated account state from the clearinghouse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserState {
    pub account_value: f64,
    pub total_margin_used: f64,
    pub withdrawable: f64,
    pub positions: Vec<VenuePosition>,
}

// ---------------------------------------------------------------------------
// Tick rounding
// ---------------------------------------------------------------------------

/// Round a price to venue tick granularity: at most 5 significant figures and
/// at most `MAX_PRICE_DECIMALS - sz_decimals` decimal places.
pub fn round_price(px: f64, sz_decimals: u32) -> f64 {
    if px <= 0.0 || !px.is_finite() {
        return 0.0;
    }

    let max_decimals = (MAX_PRICE_DECIMALS - sz_decimals as i32).max(0);

    // 5 significant figures.
    let magnitude = px.abs().log10().floor() as i32;
    let sig_decimals = (4 - magnitude).clamp(0, 12);

    let decimals = sig_decimals.min(max_decimals) as u32;
    let factor = 10f64.powi(decimals as i32);
    (px * factor).round() / factor
}

/// Round a size down to the instrument's size tick. Rounding down never
/// produces an order larger than requested.
pub fn round_size(sz: f64, sz_decimals: u32) -> f64 {
    if sz <= 0.0 || !sz.is_finite() {
        return 0.0;
    }
    let factor = 10f64.powi(sz_decimals as i32);
    (sz * factor).floor() / factor
}

/// Format a rounded float the way the venue expects: no trailing zeros, no
/// scientific notation.
pub fn format_tick(value: f64) -> String {
    let mut s = format!("{value:.8}");
    while s.ends_with('0') {
        s.pop();
    }
    if s.ends_with('.') {
        s.pop();
    }
    s
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_price_five_sig_figs() {
        // 5 sig figs dominate for large prices.
        assert_eq!(round_price(43251.37, 4), 43251.0);
        assert_eq!(round_price(1234.567, 4), 1234.6);
    }

    #[test]
    fn round_price_decimal_cap() {
        // sz_decimals = 4 => at most 2 price decimals.
        assert_eq!(round_price(1.23456, 4), 1.23);
        // sz_decimals = 0 => up to 5 sig figs within 6 decimals.
        assert_eq!(round_price(0.0012344, 0), 0.001234); // capped at 6 decimals
    }

    #[test]
    fn round_price_rejects_garbage() {
        assert_eq!(round_price(0.0, 2), 0.0);
        assert_eq!(round_price(-5.0, 2), 0.0);
        assert_eq!(round_price(f64::NAN, 2), 0.0);
    }

    #[test]
    fn round_size_floors() {
        assert_eq!(round_size(0.123456, 3), 0.123);
        assert_eq!(round_size(0.9999, 2), 0.99);
        assert_eq!(round_size(5.0, 0), 5.0);
    }

    #[test]
    fn format_tick_strips_zeros() {
        assert_eq!(format_tick(43251.0), "43251");
        assert_eq!(format_tick(1.23), "1.23");
        assert_eq!(format_tick(0.001234), "0.001234");
    }

    #[test]
    fn order_status_oid() {
        assert_eq!(OrderStatus::Resting { oid: 7 }.oid(), Some(7));
        assert_eq!(
            OrderStatus::Rejected {
                reason: "x".into()
            }
            .oid(),
            None
        );
    }
}
