/// Relative Strength Index with Wilder smoothing
///
/// The first average gain/loss is a plain mean over `period` changes,
/// every later change is folded in as `(avg * (period - 1) + x) / period`.
///
/// Values:
/// - RSI > 70: Overbought
/// - RSI < 30: Oversold
///
/// Returns `None` until `period + 1` closes are available.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (seed, rest) = changes.split_at(period);
    let mut avg_gain = seed.iter().filter(|c| **c > 0.0).sum::<f64>() / period as f64;
    let mut avg_loss = seed.iter().filter(|c| **c < 0.0).map(|c| -c).sum::<f64>() / period as f64;

    let smoothing = (period - 1) as f64;
    for change in rest {
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        avg_gain = (avg_gain * smoothing + gain) / period as f64;
        avg_loss = (avg_loss * smoothing + loss) / period as f64;
    }

    if avg_loss == 0.0 {
        // Flat series has no strength either way
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }

    let rs = avg_gain / avg_loss;
    Some(100.0 - (100.0 / (1.0 + rs)))
}
