// =============================================================================
// Simple Moving Average
// =============================================================================

/// Mean of the last `period` values. `None` until enough samples exist.
pub fn current_sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    mean.is_finite().then_some(mean)
}

/// Population standard deviation of the last `period` values.
pub fn current_stddev(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
    let sd = variance.sqrt();
    sd.is_finite().then_some(sd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_of_known_window() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(current_sma(&values, 3), Some(4.0));
        assert_eq!(current_sma(&values, 5), Some(3.0));
    }

    #[test]
    fn sma_insufficient_data() {
        assert_eq!(current_sma(&[1.0, 2.0], 3), None);
        assert_eq!(current_sma(&[], 1), None);
        assert_eq!(current_sma(&[1.0], 0), None);
    }

    #[test]
    fn stddev_of_constant_is_zero() {
        let values = vec![7.0; 10];
        assert_eq!(current_stddev(&values, 5), Some(0.0));
    }

    #[test]
    fn stddev_known_value() {
        // Population stddev of [2, 4, 4, 4, 5, 5, 7, 9] is exactly 2.
        let values = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let sd = current_stddev(&values, 8).unwrap();
        assert!((sd - 2.0).abs() < 1e-12);
    }
}
