// Technical indicators over a close-price series
// RSI (Wilder), MACD and moving averages

pub mod macd;
pub mod moving_average;
pub mod rsi;

pub use macd::calculate_macd;
pub use moving_average::{calculate_ema, calculate_sma};
pub use rsi::calculate_rsi;
