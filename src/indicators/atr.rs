// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
//   TR_i   = max(high - low, |high - prev_close|, |low - prev_close|)
//   ATR_n  = mean(TR_1 ..= TR_n)
//   ATR_i  = (ATR_{i-1} * (n - 1) + TR_i) / n      for i > n
//
// The output is aligned with the input candles; indices below `period` are
// zero (one candle is consumed forming the first true range).
// =============================================================================

use rust_decimal::prelude::ToPrimitive;

use crate::types::Candle;

/// Compute the ATR series for `candles` with look-back `period`.
///
/// Inputs shorter than `period + 1` (or a zero period) yield an all-zero
/// series.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Vec<f64> {
    let len = candles.len();
    let mut atr = vec![0.0; len];
    if period == 0 || len < period + 1 {
        return atr;
    }

    // True ranges; tr[0] is undefined and left at zero.
    let mut tr = vec![0.0; len];
    for i in 1..len {
        let high = candles[i].high.to_f64().unwrap_or(0.0);
        let low = candles[i].low.to_f64().unwrap_or(0.0);
        let prev_close = candles[i - 1].close.to_f64().unwrap_or(0.0);

        tr[i] = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
    }

    // Seed with the mean of the first `period` true ranges.
    atr[period] = tr[1..=period].iter().sum::<f64>() / period as f64;

    for i in period + 1..len {
        atr[i] = (atr[i - 1] * (period as f64 - 1.0) + tr[i]) / period as f64;
    }

    atr
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Period;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    fn candle(high: i64, low: i64, close: i64) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            exchange: "binance".into(),
            period: Period::M1,
            open: Decimal::from(low),
            high: Decimal::from(high),
            low: Decimal::from(low),
            close: Decimal::from(close),
            volume: Decimal::ONE,
            timestamp: Utc.timestamp_millis_opt(0).unwrap(),
        }
    }

    #[test]
    fn atr_short_input_is_all_zeros() {
        let candles: Vec<Candle> = (0..10).map(|_| candle(105, 95, 100)).collect();
        assert_eq!(calculate_atr(&candles, 14), vec![0.0; 10]);
    }

    #[test]
    fn atr_flat_market_is_zero() {
        // high == low == close everywhere: every true range is zero.
        let candles: Vec<Candle> = (0..20).map(|_| candle(100, 100, 100)).collect();
        let out = calculate_atr(&candles, 14);
        assert!(out.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn atr_constant_range_equals_that_range() {
        // Every candle spans 10 around a close at the midpoint: TR = 10.
        let candles: Vec<Candle> = (0..30).map(|_| candle(105, 95, 100)).collect();
        let out = calculate_atr(&candles, 14);
        for v in &out[..14] {
            assert_eq!(*v, 0.0);
        }
        for v in &out[14..] {
            assert!((v - 10.0).abs() < 1e-9, "expected 10.0, got {v}");
        }
    }

    #[test]
    fn atr_gap_widens_true_range() {
        // Candle 2 gaps: prev close 100, new low 120 => TR = |130 - 100| = 30.
        let candles = vec![
            candle(105, 95, 100),
            candle(130, 120, 125),
            candle(130, 120, 125),
        ];
        let out = calculate_atr(&candles, 2);
        // Seed = mean(TR_1, TR_2) = mean(30, 10) = 20.
        assert!((out[2] - 20.0).abs() < 1e-9);
    }
}
