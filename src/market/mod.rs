pub mod series;

pub use series::KlineSeries;

use crate::indicators::{calculate_macd, calculate_rsi, calculate_sma};
use crate::models::{Kline, KlineEvent, PriceChangeStats};
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Snapshots older than this are not traded on
pub const MAX_SNAPSHOT_AGE_SECS: i64 = 100;

const SERIES_CAPACITY: usize = 1000;

/// Point-in-time view of the market used by one decision
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MarketSnapshot {
    pub price: f64,
    pub rsi3: f64,
    pub rsi7: f64,
    pub rsi14: f64,
    pub macd: f64,
    pub ma7: f64,
    pub ma14: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    /// 0 after a sell-dominated candle update, +1 for every other update
    pub direction: i64,
    /// When indicators were last recomputed; `None` until the first closed candle
    pub updated_at: Option<DateTime<Utc>>,
}

impl MarketSnapshot {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.updated_at {
            Some(at) => now - at > Duration::seconds(MAX_SNAPSHOT_AGE_SECS),
            None => true,
        }
    }
}

#[derive(Debug)]
struct MarketState {
    snapshot: MarketSnapshot,
    series: KlineSeries,
    last_ticker_at: Option<DateTime<Utc>>,
    last_kline_at: Option<DateTime<Utc>>,
}

/// Shared, continuously updated market state
///
/// Field ownership: the ticker task writes `price`, the kline task writes
/// everything else.
#[derive(Clone)]
pub struct Market {
    state: Arc<RwLock<MarketState>>,
}

impl Default for Market {
    fn default() -> Self {
        Self::new()
    }
}

impl Market {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MarketState {
                snapshot: MarketSnapshot::default(),
                series: KlineSeries::new(SERIES_CAPACITY),
                last_ticker_at: None,
                last_kline_at: None,
            })),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, MarketState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MarketState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> MarketSnapshot {
        self.read().snapshot.clone()
    }

    /// Record a top-of-book price
    pub fn set_price(&self, price: f64, now: DateTime<Utc>) {
        let mut state = self.write();
        state.snapshot.price = price;
        state.last_ticker_at = Some(now);
    }

    /// Fold a kline update into the direction counter
    ///
    /// Returns true when the candle was final and extended the series; the
    /// caller then refreshes 24h stats and calls [`Market::recompute`].
    pub fn apply_kline(&self, event: &KlineEvent, now: DateTime<Utc>) -> bool {
        let mut state = self.write();
        state.last_kline_at = Some(now);

        let taker_buy = event.kline.taker_buy_volume;
        let active_sell = event.kline.volume - taker_buy;
        if active_sell > taker_buy {
            state.snapshot.direction = 0;
        } else {
            state.snapshot.direction += 1;
        }

        event.is_final && state.series.push(event.kline.clone())
    }

    /// Seed the series with historical candles
    pub fn load_history(&self, klines: Vec<Kline>) -> usize {
        let mut state = self.write();
        klines
            .into_iter()
            .filter(|k| state.series.push(k.clone()))
            .count()
    }

    /// Recompute indicators from the series and stamp the snapshot
    pub fn recompute(&self, stats: Option<PriceChangeStats>, now: DateTime<Utc>) {
        let mut state = self.write();
        let closes = state.series.closes();

        let snapshot = &mut state.snapshot;
        snapshot.rsi3 = calculate_rsi(&closes, 3).unwrap_or(0.0);
        snapshot.rsi7 = calculate_rsi(&closes, 7).unwrap_or(0.0);
        snapshot.rsi14 = calculate_rsi(&closes, 14).unwrap_or(0.0);
        snapshot.macd = calculate_macd(&closes, 12, 26).unwrap_or(0.0);
        snapshot.ma7 = calculate_sma(&closes, 7).unwrap_or(0.0);
        snapshot.ma14 = calculate_sma(&closes, 14).unwrap_or(0.0);
        if let Some(stats) = stats {
            snapshot.high_24h = stats.high_price;
            snapshot.low_24h = stats.low_price;
        }
        snapshot.updated_at = Some(now);
    }

    pub fn series_len(&self) -> usize {
        self.read().series.len()
    }

    pub fn last_ticker_at(&self) -> Option<DateTime<Utc>> {
        self.read().last_ticker_at
    }

    pub fn last_kline_at(&self) -> Option<DateTime<Utc>> {
        self.read().last_kline_at
    }

    /// Overwrite the snapshot wholesale
    pub fn replace_snapshot(&self, snapshot: MarketSnapshot) {
        self.write().snapshot = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kline_event(open_time: i64, close: f64, volume: f64, taker_buy: f64, is_final: bool) -> KlineEvent {
        KlineEvent {
            kline: Kline {
                open_time,
                open: close,
                high: close,
                low: close,
                close,
                volume,
                taker_buy_volume: taker_buy,
            },
            is_final,
        }
    }

    #[test]
    fn test_snapshot_staleness() {
        let now = Utc::now();
        let mut snapshot = MarketSnapshot::default();
        assert!(snapshot.is_stale(now));

        snapshot.updated_at = Some(now - Duration::seconds(100));
        assert!(!snapshot.is_stale(now));

        snapshot.updated_at = Some(now - Duration::seconds(101));
        assert!(snapshot.is_stale(now));
    }

    #[test]
    fn test_direction_counter() {
        let market = Market::new();
        let now = Utc::now();

        // Buy-dominated: 10 volume, 6 taker buy, 4 active sell
        market.apply_kline(&kline_event(0, 100.0, 10.0, 6.0, false), now);
        market.apply_kline(&kline_event(0, 100.0, 10.0, 5.0, false), now);
        assert_eq!(market.snapshot().direction, 2);

        // Sell-dominated resets
        market.apply_kline(&kline_event(0, 100.0, 10.0, 2.0, false), now);
        assert_eq!(market.snapshot().direction, 0);
    }

    #[test]
    fn test_only_final_klines_extend_series() {
        let market = Market::new();
        let now = Utc::now();

        assert!(!market.apply_kline(&kline_event(0, 100.0, 1.0, 1.0, false), now));
        assert!(market.apply_kline(&kline_event(0, 100.0, 1.0, 1.0, true), now));
        assert!(!market.apply_kline(&kline_event(0, 100.0, 1.0, 1.0, true), now));
        assert_eq!(market.series_len(), 1);
        assert_eq!(market.last_kline_at(), Some(now));
    }

    #[test]
    fn test_recompute_stamps_snapshot() {
        let market = Market::new();
        let now = Utc::now();
        let history: Vec<Kline> = (0..30)
            .map(|i| kline_event(i * 60_000, 100.0 + i as f64, 1.0, 1.0, true).kline)
            .collect();

        assert_eq!(market.load_history(history), 30);
        market.recompute(
            Some(PriceChangeStats {
                high_price: 140.0,
                low_price: 90.0,
            }),
            now,
        );

        let snapshot = market.snapshot();
        assert_eq!(snapshot.rsi7, 100.0);
        assert!(snapshot.macd > 0.0);
        assert_eq!(snapshot.ma7, 126.0);
        assert_eq!(snapshot.high_24h, 140.0);
        assert_eq!(snapshot.updated_at, Some(now));
    }

    #[test]
    fn test_set_price_keeps_indicators() {
        let market = Market::new();
        let now = Utc::now();
        market.set_price(250.5, now);
        assert_eq!(market.snapshot().price, 250.5);
        assert_eq!(market.last_ticker_at(), Some(now));
    }
}
