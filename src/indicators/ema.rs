// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// EMA gives more weight to recent values:
//   multiplier = 2 / (period + 1)
//   EMA_0      = data_0
//   EMA_i      = (data_i - EMA_{i-1}) * multiplier + EMA_{i-1}
//
// The series is seeded with the first data point, so there is no warm-up
// range: every index carries a value.
// =============================================================================

use rust_decimal::Decimal;

/// Compute the EMA series for `data`, aligned with the input.
///
/// Returns an empty series for empty input and an all-zero series for a zero
/// `period` (division-by-convention guard).
pub fn calculate_ema(data: &[Decimal], period: usize) -> Vec<Decimal> {
    if data.is_empty() {
        return Vec::new();
    }
    if period == 0 {
        return vec![Decimal::ZERO; data.len()];
    }

    let multiplier = Decimal::TWO / Decimal::from(period as u64 + 1);

    let mut ema = Vec::with_capacity(data.len());
    ema.push(data[0]);

    for i in 1..data.len() {
        let prev = ema[i - 1];
        ema.push((data[i] - prev) * multiplier + prev);
    }

    ema
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn ema_empty_input() {
        assert!(calculate_ema(&[], 5).is_empty());
    }

    #[test]
    fn ema_period_zero_is_all_zeros() {
        let data = vec![dec("1"), dec("2")];
        assert_eq!(calculate_ema(&data, 0), vec![Decimal::ZERO; 2]);
    }

    #[test]
    fn ema_seeds_with_first_value() {
        let data = vec![dec("10"), dec("20"), dec("30")];
        let out = calculate_ema(&data, 2);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], dec("10"));
    }

    #[test]
    fn ema_known_values() {
        // period 2 => multiplier = 2/3
        // EMA[1] = (20 - 10) * 2/3 + 10 = 16.666...
        // EMA[2] = (30 - 16.666) * 2/3 + 16.666 = 25.555...
        let data = vec![dec("10"), dec("20"), dec("30")];
        let out = calculate_ema(&data, 2);
        let tol = dec("0.0001");
        assert!((out[1] - dec("16.6667")).abs() < tol, "got {}", out[1]);
        assert!((out[2] - dec("25.5556")).abs() < tol, "got {}", out[2]);
    }

    #[test]
    fn ema_of_constant_series_is_that_constant() {
        let data = vec![dec("42.5"); 20];
        for v in calculate_ema(&data, 9) {
            assert_eq!(v, dec("42.5"));
        }
    }
}
