// =============================================================================
// Regime classification — coarse market state from dispersion and slope
// =============================================================================
//
// bullish / bearish: trend slope dominates dispersion.
// volatile: dispersion dominates any trend.
// neutral: neither.
//
// Slope is a least-squares fit over the window, normalised by the mean price;
// dispersion is the coefficient of variation. Both are dimensionless, so the
// thresholds hold across symbols of very different price scales.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::Regime;

/// Minimum closes for a classification; shorter windows return Neutral.
pub const MIN_WINDOW: usize = 20;

/// Normalised slope above which a window counts as trending (per bar).
const TREND_THRESHOLD: f64 = 0.0004;
/// Coefficient of variation above which a window counts as volatile.
const DISPERSION_THRESHOLD: f64 = 0.02;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegimeSummary {
    pub regime: Regime,
    /// Normalised least-squares slope per bar.
    pub slope: f64,
    /// Coefficient of variation over the window.
    pub dispersion: f64,
}

/// Classify the regime over a window of closes.
pub fn classify_regime(closes: &[f64]) -> RegimeSummary {
    if closes.len() < MIN_WINDOW {
        return RegimeSummary {
            regime: Regime::Neutral,
            slope: 0.0,
            dispersion: 0.0,
        };
    }

    let n = closes.len() as f64;
    let mean = closes.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return RegimeSummary {
            regime: Regime::Neutral,
            slope: 0.0,
            dispersion: 0.0,
        };
    }

    // Least-squares slope against bar index.
    let mean_x = (n - 1.0) / 2.0;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    for (i, &close) in closes.iter().enumerate() {
        let dx = i as f64 - mean_x;
        cov += dx * (close - mean);
        var_x += dx * dx;
    }
    let slope = (cov / var_x) / mean;

    let variance = closes.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
    let dispersion = variance.sqrt() / mean;

    let regime = if dispersion >= DISPERSION_THRESHOLD && slope.abs() < TREND_THRESHOLD {
        Regime::Volatile
    } else if slope >= TREND_THRESHOLD {
        Regime::Bullish
    } else if slope <= -TREND_THRESHOLD {
        Regime::Bearish
    } else {
        Regime::Neutral
    };

    RegimeSummary {
        regime,
        slope,
        dispersion,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_window_is_neutral() {
        let closes = vec![100.0; 5];
        assert_eq!(classify_regime(&closes).regime, Regime::Neutral);
    }

    #[test]
    fn flat_series_is_neutral() {
        let closes = vec![100.0; 50];
        let summary = classify_regime(&closes);
        assert_eq!(summary.regime, Regime::Neutral);
        assert!(summary.slope.abs() < 1e-12);
        assert!(summary.dispersion < 1e-12);
    }

    #[test]
    fn steady_uptrend_is_bullish() {
        // +0.2% per bar.
        let closes: Vec<f64> = (0..50).map(|i| 100.0 * 1.002f64.powi(i)).collect();
        assert_eq!(classify_regime(&closes).regime, Regime::Bullish);
    }

    #[test]
    fn steady_downtrend_is_bearish() {
        let closes: Vec<f64> = (0..50).map(|i| 100.0 * 0.998f64.powi(i)).collect();
        assert_eq!(classify_regime(&closes).regime, Regime::Bearish);
    }

    #[test]
    fn trendless_chop_is_volatile() {
        // Big alternating swings around a flat mean.
        let closes: Vec<f64> = (0..50)
            .map(|i| if i % 2 == 0 { 97.0 } else { 103.0 })
            .collect();
        let summary = classify_regime(&closes);
        assert_eq!(summary.regime, Regime::Volatile);
        assert!(summary.dispersion > DISPERSION_THRESHOLD);
    }
}
