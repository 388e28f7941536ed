//! Position ledger: orders, open cycle positions and session rows
//!
//! The [`Ledger`] trait is the persistence seam. [`PostgresLedger`] is the
//! production backend, [`MemoryLedger`] backs dry runs without a database
//! and the test suite.

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PostgresLedger;

use crate::models::{OpenPosition, Order, OrderRecord, OrderSide};
use crate::session::SessionRow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("failed to decode {0}")]
    Decode(String),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// Realized profit and open exposure, for reports
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProfitSummary {
    /// Realized profit across all cycles
    pub total_profit: f64,
    /// Realized profit of this cycle
    pub thread_profit: f64,
    /// Open positions across all cycles
    pub open_positions: usize,
    /// Fiat cost of all open positions
    pub open_amount: f64,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn save_order(&self, record: &OrderRecord) -> Result<(), LedgerError>;

    /// Refresh status, fills and recorded price of a stored order
    async fn update_order(&self, order: &Order, recorded_price: f64) -> Result<(), LedgerError>;

    async fn save_position(
        &self,
        position: &OpenPosition,
        thread_id_session: &str,
    ) -> Result<(), LedgerError>;

    async fn delete_position(&self, order_id: i64) -> Result<(), LedgerError>;

    /// Open positions of a cycle, oldest first
    async fn open_positions(&self, thread_id: &str) -> Result<Vec<OpenPosition>, LedgerError>;

    async fn count_positions(&self, thread_id: &str) -> Result<usize, LedgerError>;

    /// Recorded price of the most recent filled order on `side`, 0 if none
    async fn last_price(&self, thread_id: &str, side: OrderSide) -> Result<f64, LedgerError>;

    /// Sides of the most recent filled orders, newest first
    async fn last_sides(&self, thread_id: &str, limit: usize)
        -> Result<Vec<OrderSide>, LedgerError>;

    /// Filled orders on `side` transacted at or after `since`
    async fn count_orders_since(
        &self,
        thread_id: &str,
        side: OrderSide,
        since: DateTime<Utc>,
    ) -> Result<usize, LedgerError>;

    /// Symbol traded by a cycle
    async fn thread_symbol(&self, thread_id: &str) -> Result<Option<String>, LedgerError>;

    /// Cycles that still hold open positions
    async fn resumable_threads(&self) -> Result<Vec<String>, LedgerError>;

    /// One NEW or PARTIALLY_FILLED order of the cycle, oldest first
    ///
    /// The ledger keeps a single price column, the recorded price, so the
    /// returned `order.price` equals `recorded_price`.
    async fn pending_order(&self, thread_id: &str) -> Result<Option<OrderRecord>, LedgerError>;

    /// Insert or replace the session row
    async fn save_session(&self, row: &SessionRow) -> Result<(), LedgerError>;

    /// Update an existing session row; returns false when there is none
    async fn update_session(&self, row: &SessionRow) -> Result<bool, LedgerError>;

    async fn get_session(&self, thread_id: &str) -> Result<Option<SessionRow>, LedgerError>;

    async fn delete_session(&self, thread_id: &str) -> Result<(), LedgerError>;

    async fn profit_summary(&self, thread_id: &str) -> Result<ProfitSummary, LedgerError>;

    /// Everything the decision engine needs about a cycle, read in one go
    async fn ledger_state(
        &self,
        thread_id: &str,
        now: DateTime<Utc>,
    ) -> Result<LedgerState, LedgerError> {
        Ok(LedgerState {
            positions: self.open_positions(thread_id).await?,
            last_buy_price: self.last_price(thread_id, OrderSide::Buy).await?,
            last_sell_price: self.last_price(thread_id, OrderSide::Sell).await?,
            last_sides: self.last_sides(thread_id, 2).await?,
            sells_last_hour: self
                .count_orders_since(thread_id, OrderSide::Sell, now - Duration::minutes(60))
                .await?,
        })
    }
}

/// Read-only view of one cycle's ledger
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerState {
    pub positions: Vec<OpenPosition>,
    pub last_buy_price: f64,
    pub last_sell_price: f64,
    /// Newest first
    pub last_sides: Vec<OrderSide>,
    pub sells_last_hour: usize,
}

impl LedgerState {
    pub fn count(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn last_side(&self) -> Option<OrderSide> {
        self.last_sides.first().copied()
    }

    /// True when the two most recent orders were both BUYs
    pub fn last_two_were_buys(&self) -> bool {
        self.last_sides.len() >= 2 && self.last_sides[..2].iter().all(|s| *s == OrderSide::Buy)
    }

    pub fn most_recent(&self) -> Option<&OpenPosition> {
        self.positions
            .iter()
            .max_by_key(|p| (p.transact_time, p.order_id))
    }

    pub fn find(&self, order_id: i64) -> Option<&OpenPosition> {
        self.positions.iter().find(|p| p.order_id == order_id)
    }

    /// Cheapest position that sells at a profit of `profit_ratio` after `fee`
    pub fn lowest_profitable(&self, price: f64, fee: f64, profit_ratio: f64) -> Option<&OpenPosition> {
        self.positions
            .iter()
            .filter(|p| price * (1.0 + fee) >= p.price * (1.0 + profit_ratio))
            .min_by(|a, b| a.price.total_cmp(&b.price))
    }

    /// Most expensive position whose stoploss level has been crossed
    pub fn highest_stoploss(&self, price: f64, stoploss: f64) -> Option<&OpenPosition> {
        self.positions
            .iter()
            .filter(|p| p.price * (1.0 - stoploss) >= price)
            .max_by(|a, b| a.price.total_cmp(&b.price))
    }

    pub fn count_priced_above(&self, threshold: f64) -> usize {
        self.positions.iter().filter(|p| p.price > threshold).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(order_id: i64, price: f64, transact_time: i64) -> OpenPosition {
        OpenPosition {
            order_id,
            thread_id: "t1".to_string(),
            price,
            executed_quantity: 1.0,
            cumulative_quote_quantity: price,
            transact_time,
        }
    }

    fn create_test_state() -> LedgerState {
        LedgerState {
            positions: vec![
                position(1, 100.0, 1_000),
                position(2, 95.0, 2_000),
                position(3, 105.0, 3_000),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_most_recent_by_transact_time() {
        let state = create_test_state();
        assert_eq!(state.most_recent().map(|p| p.order_id), Some(3));
    }

    #[test]
    fn test_lowest_profitable() {
        let state = create_test_state();
        // 101 * 1.001 = 101.101 clears 95 * 1.01 and 100 * 1.01, not 105 * 1.01
        let found = state.lowest_profitable(101.0, 0.001, 0.01);
        assert_eq!(found.map(|p| p.order_id), Some(2));

        assert!(state.lowest_profitable(90.0, 0.001, 0.01).is_none());
    }

    #[test]
    fn test_highest_stoploss() {
        let state = create_test_state();
        // 10% stoploss: 105 * 0.9 = 94.5, 100 * 0.9 = 90, 95 * 0.9 = 85.5
        let found = state.highest_stoploss(94.0, 0.1);
        assert_eq!(found.map(|p| p.order_id), Some(3));

        assert!(state.highest_stoploss(95.0, 0.1).is_none());
    }

    #[test]
    fn test_count_priced_above() {
        let state = create_test_state();
        assert_eq!(state.count_priced_above(99.0), 2);
        assert_eq!(state.count_priced_above(105.0), 0);
    }

    #[test]
    fn test_last_two_were_buys() {
        let mut state = LedgerState::default();
        assert!(!state.last_two_were_buys());

        state.last_sides = vec![OrderSide::Buy];
        assert!(!state.last_two_were_buys());

        state.last_sides = vec![OrderSide::Buy, OrderSide::Buy];
        assert!(state.last_two_were_buys());

        state.last_sides = vec![OrderSide::Buy, OrderSide::Sell];
        assert!(!state.last_two_were_buys());
    }
}
