// =============================================================================
// Exponential Moving Average
// =============================================================================
//
// Seeded with the SMA of the first `period` values, then smoothed with
// alpha = 2 / (period + 1).
// =============================================================================

/// Compute the full EMA series. The returned vector holds one value per input
/// starting at index `period - 1`; empty when there is insufficient data.
pub fn calculate_ema(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;

    let mut result = Vec::with_capacity(values.len() - period + 1);
    result.push(seed);

    let mut ema = seed;
    for &value in &values[period..] {
        ema = value * alpha + ema * (1.0 - alpha);
        if !ema.is_finite() {
            break;
        }
        result.push(ema);
    }

    result
}

/// The most recent EMA value.
pub fn current_ema(values: &[f64], period: usize) -> Option<f64> {
    calculate_ema(values, period).last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_of_constant_is_constant() {
        let values = vec![42.0; 30];
        let series = calculate_ema(&values, 9);
        assert_eq!(series.len(), 22);
        for v in series {
            assert!((v - 42.0).abs() < 1e-12);
        }
    }

    #[test]
    fn ema_tracks_trend_with_lag() {
        let values: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let ema = current_ema(&values, 9).unwrap();
        // EMA lags a rising series: below the last value, above the seed.
        assert!(ema < 30.0);
        assert!(ema > 20.0);
    }

    #[test]
    fn ema_insufficient_data() {
        assert!(calculate_ema(&[1.0, 2.0], 3).is_empty());
        assert_eq!(current_ema(&[], 9), None);
        assert!(calculate_ema(&[1.0], 0).is_empty());
    }

    #[test]
    fn ema_hand_computed() {
        // period 3, alpha = 0.5: seed = (1+2+3)/3 = 2
        // next: 4*0.5 + 2*0.5 = 3; next: 5*0.5 + 3*0.5 = 4
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let series = calculate_ema(&values, 3);
        assert_eq!(series, vec![2.0, 3.0, 4.0]);
    }
}
