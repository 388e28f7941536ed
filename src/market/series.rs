use crate::models::Kline;
use std::collections::VecDeque;

/// Rolling window of closed 1m candles, ordered by open time
#[derive(Debug, Clone)]
pub struct KlineSeries {
    candles: VecDeque<Kline>,
    max_candles: usize,
}

impl KlineSeries {
    /// Create a new series
    ///
    /// # Arguments
    /// * `max_candles` - Maximum number of candles to keep
    pub fn new(max_candles: usize) -> Self {
        Self {
            candles: VecDeque::with_capacity(max_candles.min(1024)),
            max_candles,
        }
    }

    /// Append a closed candle
    ///
    /// Returns false (and keeps the series untouched) when the candle does
    /// not open strictly after the newest one already held.
    pub fn push(&mut self, kline: Kline) -> bool {
        if let Some(last) = self.candles.back() {
            if kline.open_time <= last.open_time {
                return false;
            }
        }

        self.candles.push_back(kline);
        while self.candles.len() > self.max_candles {
            self.candles.pop_front();
        }
        true
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|k| k.close).collect()
    }

    pub fn last(&self) -> Option<&Kline> {
        self.candles.back()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_kline(open_time: i64, close: f64) -> Kline {
        Kline {
            open_time,
            open: close,
            high: close,
            low: close,
            close,
            volume: 10.0,
            taker_buy_volume: 5.0,
        }
    }

    #[test]
    fn test_push_in_order() {
        let mut series = KlineSeries::new(100);
        assert!(series.push(create_test_kline(60_000, 100.0)));
        assert!(series.push(create_test_kline(120_000, 101.0)));
        assert_eq!(series.closes(), vec![100.0, 101.0]);
    }

    #[test]
    fn test_rejects_duplicate_and_older() {
        let mut series = KlineSeries::new(100);
        assert!(series.push(create_test_kline(120_000, 100.0)));
        assert!(!series.push(create_test_kline(120_000, 101.0)));
        assert!(!series.push(create_test_kline(60_000, 99.0)));
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn test_max_candles_limit() {
        let mut series = KlineSeries::new(5);
        for i in 0..10 {
            series.push(create_test_kline(i * 60_000, 100.0 + i as f64));
        }
        assert_eq!(series.len(), 5);
        assert_eq!(series.closes()[0], 105.0);
        assert_eq!(series.last().map(|k| k.close), Some(109.0));
    }
}
