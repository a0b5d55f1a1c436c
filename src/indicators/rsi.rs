// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
// Step 1 — Seed average gain / average loss with the mean of the first
//          `period` absolute changes.
// Step 2 — Apply Wilder's smoothing for every later change:
//            avg = (avg * (period - 1) + current) / period
// Step 3 — RS  = avg_gain / avg_loss
//          RSI = 100 - 100 / (1 + RS); 100 when avg_loss is zero.
//
// The output is aligned with the input; indices below `period` are zero
// (`period` deltas are consumed before the first value exists).
// =============================================================================

use rust_decimal::Decimal;

/// Compute the RSI series for `data` with look-back `period`.
///
/// Inputs shorter than `period + 1` (or a zero period) yield an all-zero
/// series.
pub fn calculate_rsi(data: &[Decimal], period: usize) -> Vec<Decimal> {
    let mut rsi = vec![Decimal::ZERO; data.len()];
    if period == 0 || data.len() < period + 1 {
        return rsi;
    }

    let period_dec = Decimal::from(period as u64);
    let mut avg_gain = Decimal::ZERO;
    let mut avg_loss = Decimal::ZERO;

    // Seed averages from the first `period` changes.
    for i in 1..=period {
        let change = data[i] - data[i - 1];
        if change > Decimal::ZERO {
            avg_gain += change;
        } else {
            avg_loss += change.abs();
        }
    }
    avg_gain /= period_dec;
    avg_loss /= period_dec;

    rsi[period] = rsi_value(avg_gain, avg_loss);

    // Wilder smoothing for the remainder of the series.
    let smooth = Decimal::from(period as u64 - 1);
    for i in period + 1..data.len() {
        let change = data[i] - data[i - 1];
        let (gain, loss) = if change > Decimal::ZERO {
            (change, Decimal::ZERO)
        } else {
            (Decimal::ZERO, change.abs())
        };

        avg_gain = (avg_gain * smooth + gain) / period_dec;
        avg_loss = (avg_loss * smooth + loss) / period_dec;

        rsi[i] = rsi_value(avg_gain, avg_loss);
    }

    rsi
}

/// Convert smoothed averages into an RSI value in [0, 100].
/// A zero average loss (no down moves) pins the value at 100.
fn rsi_value(avg_gain: Decimal, avg_loss: Decimal) -> Decimal {
    if avg_loss.is_zero() {
        return Decimal::ONE_HUNDRED;
    }
    let rs = avg_gain / avg_loss;
    Decimal::ONE_HUNDRED - Decimal::ONE_HUNDRED / (Decimal::ONE + rs)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn series(values: impl IntoIterator<Item = i64>) -> Vec<Decimal> {
        values.into_iter().map(Decimal::from).collect()
    }

    #[test]
    fn rsi_short_input_is_all_zeros() {
        let data = series(1..=14); // 13 deltas < period 14
        assert_eq!(calculate_rsi(&data, 14), vec![Decimal::ZERO; 14]);
    }

    #[test]
    fn rsi_period_zero_is_all_zeros() {
        let data = series(1..=5);
        assert_eq!(calculate_rsi(&data, 0), vec![Decimal::ZERO; 5]);
    }

    #[test]
    fn rsi_warmup_range_is_zero() {
        let data = series(1..=30);
        let out = calculate_rsi(&data, 14);
        for v in &out[..14] {
            assert_eq!(*v, Decimal::ZERO);
        }
        assert_ne!(out[14], Decimal::ZERO);
    }

    #[test]
    fn rsi_monotonic_rise_pins_at_100() {
        let data = series(1..=30);
        let out = calculate_rsi(&data, 14);
        for v in &out[14..] {
            assert_eq!(*v, Decimal::ONE_HUNDRED);
        }
    }

    #[test]
    fn rsi_monotonic_fall_converges_to_zero() {
        let data = series((1..=30).rev());
        let out = calculate_rsi(&data, 14);
        for v in &out[14..] {
            assert_eq!(*v, Decimal::ZERO);
        }
    }

    #[test]
    fn rsi_stays_in_range() {
        let closes: Vec<Decimal> = [
            "44.34", "44.09", "44.15", "43.61", "44.33", "44.83", "45.10", "45.42", "45.84",
            "46.08", "45.89", "46.03", "44.18", "44.22", "44.57", "43.42", "42.66", "43.13",
        ]
        .iter()
        .map(|s| s.parse().unwrap())
        .collect();

        for v in calculate_rsi(&closes, 14) {
            assert!(v >= Decimal::ZERO && v <= Decimal::ONE_HUNDRED, "RSI {v} out of range");
        }
    }
}
