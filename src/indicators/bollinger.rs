// =============================================================================
// Bollinger Bands
// =============================================================================
//
//   middle = SMA(close, period)
//   band   = k * population-stddev(close over the window)
//   upper  = middle + band,  lower = middle - band
//
// Values exist from index `period - 1`; the warm-up range is zero-filled.
// Standard deviation needs a square root, so this indicator works in f64
// like the ATR does.
// =============================================================================

use rust_decimal::prelude::ToPrimitive;

use crate::types::Candle;

/// The three Bollinger series, index-aligned with the input candles.
#[derive(Debug, Clone, PartialEq)]
pub struct BollingerBands {
    pub middle: Vec<f64>,
    pub upper: Vec<f64>,
    pub lower: Vec<f64>,
}

/// Compute Bollinger bands over candle closes with `k` standard deviations
/// (classically `period = 20`, `k = 2.0`).
pub fn calculate_bollinger(candles: &[Candle], period: usize, k: f64) -> BollingerBands {
    let len = candles.len();
    let mut bands = BollingerBands {
        middle: vec![0.0; len],
        upper: vec![0.0; len],
        lower: vec![0.0; len],
    };
    if period == 0 || len < period {
        return bands;
    }

    let closes: Vec<f64> = candles
        .iter()
        .map(|c| c.close.to_f64().unwrap_or(0.0))
        .collect();

    for i in period - 1..len {
        let window = &closes[i + 1 - period..=i];
        let mean = window.iter().sum::<f64>() / period as f64;
        let variance = window
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / period as f64;
        let band = k * variance.sqrt();

        bands.middle[i] = mean;
        bands.upper[i] = mean + band;
        bands.lower[i] = mean - band;
    }

    bands
}
