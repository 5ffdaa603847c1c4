// =============================================================================
// Moving Average Convergence / Divergence
// =============================================================================
//
// MACD line = EMA(fast) - EMA(slow); signal = EMA(macd line, signal period);
// histogram = macd - signal. Requires slow + signal - 1 closes.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::indicators::ema::calculate_ema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MacdValue {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// MACD over `closes` with the given fast/slow/signal periods.
pub fn current_macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Option<MacdValue> {
    if fast == 0 || signal == 0 || fast >= slow {
        return None;
    }

    let ema_fast = calculate_ema(closes, fast);
    let ema_slow = calculate_ema(closes, slow);
    if ema_slow.is_empty() {
        return None;
    }

    // The slow series starts (slow - fast) samples later than the fast one;
    // align their tails.
    let offset = slow - fast;
    let macd_line: Vec<f64> = ema_slow
        .iter()
        .enumerate()
        .filter_map(|(i, &slow_v)| ema_fast.get(i + offset).map(|&fast_v| fast_v - slow_v))
        .collect();

    let signal_series = calculate_ema(&macd_line, signal);
    let signal_v = *signal_series.last()?;
    let macd_v = *macd_line.last()?;

    Some(MacdValue {
        macd: macd_v,
        signal: signal_v,
        histogram: macd_v - signal_v,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_series_is_flat() {
        let closes = vec![100.0; 60];
        let macd = current_macd(&closes, 12, 26, 9).unwrap();
        assert!(macd.macd.abs() < 1e-12);
        assert!(macd.signal.abs() < 1e-12);
        assert!(macd.histogram.abs() < 1e-12);
    }

    #[test]
    fn rising_series_has_positive_macd() {
        let closes: Vec<f64> = (1..=80).map(|x| x as f64).collect();
        let macd = current_macd(&closes, 12, 26, 9).unwrap();
        // Fast EMA sits above slow EMA in an uptrend.
        assert!(macd.macd > 0.0);
    }

    #[test]
    fn falling_series_has_negative_macd() {
        let closes: Vec<f64> = (1..=80).rev().map(|x| x as f64).collect();
        let macd = current_macd(&closes, 12, 26, 9).unwrap();
        assert!(macd.macd < 0.0);
    }

    #[test]
    fn minimum_lookback_boundary() {
        // slow + signal - 1 = 34 closes is the minimum.
        let closes: Vec<f64> = (1..=34).map(|x| x as f64).collect();
        assert!(current_macd(&closes, 12, 26, 9).is_some());
        assert!(current_macd(&closes[..33], 12, 26, 9).is_none());
    }

    #[test]
    fn invalid_periods() {
        let closes = vec![1.0; 60];
        assert!(current_macd(&closes, 26, 12, 9).is_none());
        assert!(current_macd(&closes, 0, 26, 9).is_none());
        assert!(current_macd(&closes, 12, 26, 0).is_none());
    }
}
