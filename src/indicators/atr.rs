// =============================================================================
// Average True Range — Wilder's smoothing
// =============================================================================
//
// TR_i = max(high - low, |high - prev_close|, |low - prev_close|).
// Seeded with the SMA of the first `period` true ranges, then smoothed.
// =============================================================================

/// The most recent ATR value over parallel high/low/close series. Requires
/// at least `period + 1` samples.
pub fn current_atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<f64> {
    let n = highs.len();
    if period == 0 || n != lows.len() || n != closes.len() || n < period + 1 {
        return None;
    }

    let mut trs = Vec::with_capacity(n - 1);
    for i in 1..n {
        let hl = highs[i] - lows[i];
        let hc = (highs[i] - closes[i - 1]).abs();
        let lc = (lows[i] - closes[i - 1]).abs();
        trs.push(hl.max(hc).max(lc));
    }

    let period_f = period as f64;
    let mut atr = trs[..period].iter().sum::<f64>() / period_f;
    for &tr in &trs[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
    }

    atr.is_finite().then_some(atr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atr_of_constant_range() {
        // Every candle spans exactly 2.0 with no gaps: ATR = 2.0.
        let highs = vec![102.0; 20];
        let lows = vec![100.0; 20];
        let closes = vec![101.0; 20];
        let atr = current_atr(&highs, &lows, &closes, 14).unwrap();
        assert!((atr - 2.0).abs() < 1e-12);
    }

    #[test]
    fn atr_uses_gaps_over_prev_close() {
        // A gap up makes |high - prev_close| dominate the high-low span.
        let highs = vec![10.5, 20.0];
        let lows = vec![9.5, 19.0];
        let closes = vec![10.0, 19.5];
        // Single TR: max(1.0, |20 - 10| = 10, |19 - 10| = 9) = 10.
        let atr = current_atr(&highs, &lows, &closes, 1).unwrap();
        assert!((atr - 10.0).abs() < 1e-12);
    }

    #[test]
    fn atr_insufficient_or_mismatched() {
        assert_eq!(current_atr(&[1.0], &[1.0], &[1.0], 14), None);
        assert_eq!(current_atr(&[1.0, 2.0], &[1.0], &[1.0, 2.0], 1), None);
        assert_eq!(current_atr(&[], &[], &[], 0), None);
    }
}
