/// Simple moving average of the last `period` closes
pub fn calculate_sma(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let sum: f64 = closes.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Exponential moving average series, seeded with the SMA of the first `period` closes
///
/// Element `i` of the result lines up with `closes[period - 1 + i]`.
pub fn ema_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let seed = closes[..period].iter().sum::<f64>() / period as f64;

    let mut series = Vec::with_capacity(closes.len() - period + 1);
    series.push(seed);
    for close in &closes[period..] {
        let prev = series[series.len() - 1];
        series.push((close - prev) * multiplier + prev);
    }
    series
}

/// Latest value of the EMA
pub fn calculate_ema(closes: &[f64], period: usize) -> Option<f64> {
    ema_series(closes, period).last().copied()
}
