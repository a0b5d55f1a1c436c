// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
//   MACD line   = EMA(data, fast) - EMA(data, slow)
//   Signal line = EMA(MACD line, signal)
//   Histogram   = MACD line - Signal line
//
// All three series are aligned with the input.
// =============================================================================

use rust_decimal::Decimal;

use super::ema::calculate_ema;

/// The three MACD output series, index-aligned with the input closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacdSeries {
    pub macd: Vec<Decimal>,
    pub signal: Vec<Decimal>,
    pub histogram: Vec<Decimal>,
}

/// Compute MACD with the given fast/slow/signal periods (classically
/// 12/26/9).
pub fn calculate_macd(
    data: &[Decimal],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> MacdSeries {
    let fast = calculate_ema(data, fast_period);
    let slow = calculate_ema(data, slow_period);

    let macd: Vec<Decimal> = fast
        .iter()
        .zip(slow.iter())
        .map(|(f, s)| *f - *s)
        .collect();

    let signal = calculate_ema(&macd, signal_period);

    let histogram = macd
        .iter()
        .zip(signal.iter())
        .map(|(m, s)| *m - *s)
        .collect();

    MacdSeries {
        macd,
        signal,
        histogram,
    }
}
