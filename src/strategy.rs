// =============================================================================
// Strategies — closed set of named candle-driven signal generators
// =============================================================================
//
// A strategy is a pure function of its internal state and each observed
// candle; it must not block. Instances are selected by name at startup via
// `build_strategy`. The sandboxed user-strategy runtime lives behind the
// same trait as an external collaborator.
// =============================================================================

use std::collections::HashMap;

use anyhow::Result;
use rust_decimal::Decimal;

use crate::indicators::{calculate_rsi, calculate_sma};
use crate::types::{Candle, Period};

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// What a strategy wants to do after seeing a candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
            Self::Hold => write!(f, "hold"),
        }
    }
}

// ---------------------------------------------------------------------------
// Strategy trait & registry
// ---------------------------------------------------------------------------

pub trait Strategy: Send {
    fn name(&self) -> &str;
    fn on_candle(&mut self, candle: &Candle) -> Action;
}

/// Build a strategy by name with a JSON parameter map.
///
/// Known names: `ma_cross`, `rsi_reversal`.
pub fn build_strategy(name: &str, params: &serde_json::Value) -> Result<Box<dyn Strategy>> {
    match name {
        "ma_cross" => {
            let short = param_usize(params, "short_period", 5);
            let long = param_usize(params, "long_period", 20);
            anyhow::ensure!(
                short > 0 && short < long,
                "ma_cross requires 0 < short_period < long_period (got {short}/{long})"
            );
            Ok(Box::new(MaCrossStrategy::new(short, long)))
        }
        "rsi_reversal" => {
            let period = param_usize(params, "period", 14);
            anyhow::ensure!(period > 0, "rsi_reversal requires a non-zero period");
            Ok(Box::new(RsiReversalStrategy::new(
                period,
                Decimal::from(param_usize(params, "overbought", 70) as u64),
                Decimal::from(param_usize(params, "oversold", 30) as u64),
            )))
        }
        other => anyhow::bail!("unknown strategy: {other}"),
    }
}

fn param_usize(params: &serde_json::Value, key: &str, default: usize) -> usize {
    params
        .get(key)
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(default)
}

/// Per-series state is keyed by (symbol, period) so one instance can follow
/// every stream it is subscribed to.
type SeriesKey = (String, Period);

// ---------------------------------------------------------------------------
// Moving-average cross
// ---------------------------------------------------------------------------

/// Signals on the bar where the short SMA crosses the long SMA: golden cross
/// => buy, death cross => sell. One signal per cross.
pub struct MaCrossStrategy {
    short: usize,
    long: usize,
    closes: HashMap<SeriesKey, Vec<Decimal>>,
}

impl MaCrossStrategy {
    pub fn new(short: usize, long: usize) -> Self {
        Self {
            short,
            long,
            closes: HashMap::new(),
        }
    }
}

impl Strategy for MaCrossStrategy {
    fn name(&self) -> &str {
        "ma_cross"
    }

    fn on_candle(&mut self, candle: &Candle) -> Action {
        let series = self
            .closes
            .entry((candle.symbol.clone(), candle.period))
            .or_default();
        series.push(candle.close);
        // One extra close beyond the long window gives the previous bar's SMAs.
        if series.len() > self.long + 1 {
            series.remove(0);
        }
        if series.len() < self.long + 1 {
            return Action::Hold;
        }

        let curr = series.as_slice();
        let prev = &series[..series.len() - 1];

        let curr_short = mean(&curr[curr.len() - self.short..]);
        let curr_long = mean(&curr[curr.len() - self.long..]);
        let prev_short = mean(&prev[prev.len() - self.short..]);
        let prev_long = mean(&prev[prev.len() - self.long..]);

        if prev_short <= prev_long && curr_short > curr_long {
            Action::Buy
        } else if prev_short >= prev_long && curr_short < curr_long {
            Action::Sell
        } else {
            Action::Hold
        }
    }
}

fn mean(values: &[Decimal]) -> Decimal {
    calculate_sma(values, values.len())
        .last()
        .copied()
        .unwrap_or(Decimal::ZERO)
}

// ---------------------------------------------------------------------------
// RSI reversal
// ---------------------------------------------------------------------------

/// Buys oversold, sells overbought, holds in between.
pub struct RsiReversalStrategy {
    period: usize,
    overbought: Decimal,
    oversold: Decimal,
    closes: HashMap<SeriesKey, Vec<Decimal>>,
}

/// Closes retained per series; enough for the RSI to stabilise.
const RSI_BUFFER: usize = 100;

impl RsiReversalStrategy {
    pub fn new(period: usize, overbought: Decimal, oversold: Decimal) -> Self {
        Self {
            period,
            overbought,
            oversold,
            closes: HashMap::new(),
        }
    }
}

impl Strategy for RsiReversalStrategy {
    fn name(&self) -> &str {
        "rsi_reversal"
    }

    fn on_candle(&mut self, candle: &Candle) -> Action {
        let series = self
            .closes
            .entry((candle.symbol.clone(), candle.period))
            .or_default();
        series.push(candle.close);
        if series.len() > RSI_BUFFER {
            series.remove(0);
        }
        if series.len() <= self.period {
            return Action::Hold;
        }

        let rsi = calculate_rsi(series, self.period);
        match rsi.last() {
            Some(value) if *value >= self.overbought => Action::Sell,
            Some(value) if *value <= self.oversold => Action::Buy,
            _ => Action::Hold,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candle(close: i64, minute: i64) -> Candle {
        let price = Decimal::from(close);
        Candle {
            symbol: "BTCUSDT".into(),
            exchange: "binance".into(),
            period: Period::M1,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: Decimal::ONE,
            timestamp: Utc.timestamp_millis_opt(minute * 60_000).unwrap(),
        }
    }

    fn feed(strategy: &mut dyn Strategy, closes: &[i64]) -> Vec<Action> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| strategy.on_candle(&candle(*c, i as i64)))
            .collect()
    }

    // ---- registry --------------------------------------------------------

    #[test]
    fn registry_builds_known_strategies() {
        let params = serde_json::json!({ "short_period": 5, "long_period": 20 });
        assert_eq!(build_strategy("ma_cross", &params).unwrap().name(), "ma_cross");
        assert_eq!(
            build_strategy("rsi_reversal", &serde_json::json!({})).unwrap().name(),
            "rsi_reversal"
        );
    }

    #[test]
    fn registry_rejects_unknown_and_invalid() {
        assert!(build_strategy("hodl_forever", &serde_json::json!({})).is_err());
        let bad = serde_json::json!({ "short_period": 20, "long_period": 5 });
        assert!(build_strategy("ma_cross", &bad).is_err());
    }

    // ---- ma_cross --------------------------------------------------------

    #[test]
    fn ma_cross_holds_during_warmup() {
        let mut s = MaCrossStrategy::new(2, 3);
        let actions = feed(&mut s, &[10, 10, 10]);
        assert!(actions.iter().all(|a| *a == Action::Hold));
    }

    #[test]
    fn ma_cross_buys_on_golden_cross_once() {
        let mut s = MaCrossStrategy::new(2, 3);
        // Flat, then a jump: short SMA crosses above long SMA on the jump bar.
        let actions = feed(&mut s, &[10, 10, 10, 10, 20, 30]);
        assert_eq!(actions[4], Action::Buy);
        // The bar after the cross is not a new cross.
        assert_eq!(actions[5], Action::Hold);
    }

    #[test]
    fn ma_cross_sells_on_death_cross() {
        let mut s = MaCrossStrategy::new(2, 3);
        let actions = feed(&mut s, &[30, 30, 30, 30, 20, 10]);
        assert_eq!(actions[4], Action::Sell);
    }

    #[test]
    fn ma_cross_keeps_series_separate_per_symbol() {
        let mut s = MaCrossStrategy::new(2, 3);
        feed(&mut s, &[10, 10, 10, 10]);
        // A candle for another symbol starts its own warm-up.
        let mut other = candle(10, 0);
        other.symbol = "ETHUSDT".into();
        assert_eq!(s.on_candle(&other), Action::Hold);
    }

    // ---- rsi_reversal ----------------------------------------------------

    #[test]
    fn rsi_reversal_buys_after_sustained_fall() {
        let mut s = RsiReversalStrategy::new(14, Decimal::from(70), Decimal::from(30));
        let closes: Vec<i64> = (1..=30).rev().map(|v| v * 10).collect();
        let actions = feed(&mut s, &closes);
        assert_eq!(*actions.last().unwrap(), Action::Buy);
    }

    #[test]
    fn rsi_reversal_sells_after_sustained_rise() {
        let mut s = RsiReversalStrategy::new(14, Decimal::from(70), Decimal::from(30));
        let closes: Vec<i64> = (1..=30).map(|v| v * 10).collect();
        let actions = feed(&mut s, &closes);
        assert_eq!(*actions.last().unwrap(), Action::Sell);
    }

    #[test]
    fn rsi_reversal_holds_in_choppy_market() {
        let mut s = RsiReversalStrategy::new(14, Decimal::from(70), Decimal::from(30));
        // Alternating equal up/down moves keep the RSI near 50.
        let closes: Vec<i64> = (0..30).map(|i| if i % 2 == 0 { 100 } else { 110 }).collect();
        let actions = feed(&mut s, &closes);
        assert_eq!(*actions.last().unwrap(), Action::Hold);
    }

    #[test]
    fn rsi_reversal_holds_during_warmup() {
        let mut s = RsiReversalStrategy::new(14, Decimal::from(70), Decimal::from(30));
        let actions = feed(&mut s, &[10; 10]);
        assert!(actions.iter().all(|a| *a == Action::Hold));
    }
}
