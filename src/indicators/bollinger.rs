// =============================================================================
// Bollinger Bands
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::indicators::sma::{current_sma, current_stddev};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// (upper - lower) / middle — dimensionless band width.
    pub width: f64,
}

/// Bands over the last `period` closes at `num_std` standard deviations.
pub fn current_bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerBands> {
    let middle = current_sma(closes, period)?;
    let sd = current_stddev(closes, period)?;

    let upper = middle + num_std * sd;
    let lower = middle - num_std * sd;
    let width = if middle.abs() > f64::EPSILON {
        (upper - lower) / middle
    } else {
        0.0
    };

    Some(BollingerBands {
        upper,
        middle,
        lower,
        width,
    })
}
