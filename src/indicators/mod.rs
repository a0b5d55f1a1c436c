// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free numerical routines consumed by the strategy runner,
// the alert evaluator, and external backtesters. Every function returns a
// series aligned with its input, zero-filled over the warm-up range, so
// callers may index by absolute position.

pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod rsi;
pub mod sma;

pub use atr::calculate_atr;
pub use bollinger::{calculate_bollinger, BollingerBands};
pub use ema::calculate_ema;
pub use macd::{calculate_macd, MacdSeries};
pub use rsi::calculate_rsi;
pub use sma::calculate_sma;
