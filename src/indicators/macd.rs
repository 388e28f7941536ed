use super::moving_average::ema_series;

/// MACD line: fast EMA minus slow EMA of the closes
pub fn calculate_macd(closes: &[f64], fast: usize, slow: usize) -> Option<f64> {
    if fast == 0 || fast >= slow {
        return None;
    }

    let fast_series = ema_series(closes, fast);
    let slow_series = ema_series(closes, slow);

    Some(fast_series.last()? - slow_series.last()?)
}
