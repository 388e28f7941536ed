use super::{Ledger, LedgerError, ProfitSummary};
use crate::models::{OpenPosition, Order, OrderRecord, OrderSide, OrderStatus};
use crate::session::SessionRow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Tables {
    orders: Vec<OrderRecord>,
    positions: Vec<(OpenPosition, String)>,
    sessions: HashMap<String, SessionRow>,
}

/// In-process ledger
///
/// Used when no database is configured and by tests. State is lost on
/// exit, so a restarted process cannot resume its cycle.
#[derive(Default)]
pub struct MemoryLedger {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every write fail, to exercise fatal persistence paths
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), LedgerError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }

    pub fn orders(&self) -> Vec<OrderRecord> {
        self.tables().orders.clone()
    }

    pub fn order(&self, order_id: i64) -> Option<OrderRecord> {
        self.tables()
            .orders
            .iter()
            .find(|r| r.order.order_id == order_id)
            .cloned()
    }

    /// Filled orders of a thread, newest first
    fn filled_orders<'a>(tables: &'a Tables, thread_id: &str) -> Vec<&'a OrderRecord> {
        let mut orders: Vec<&OrderRecord> = tables
            .orders
            .iter()
            .filter(|r| r.thread_id == thread_id && r.order.status.has_fill())
            .collect();
        orders.sort_by_key(|r| std::cmp::Reverse((r.order.transact_time, r.order.order_id)));
        orders
    }

    fn realized_profit<'a>(tables: &Tables, sells: impl Iterator<Item = &'a OrderRecord>) -> f64 {
        sells
            .filter_map(|sell| {
                let source = sell.order_id_source?;
                let buy = tables.orders.iter().find(|r| r.order.order_id == source)?;
                if buy.order.executed_quantity == 0.0 {
                    return None;
                }
                let cost = buy.order.cumulative_quote_quantity * sell.order.executed_quantity
                    / buy.order.executed_quantity;
                Some(sell.order.cumulative_quote_quantity - cost)
            })
            .sum()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn save_order(&self, record: &OrderRecord) -> Result<(), LedgerError> {
        self.check_writable()?;
        let mut tables = self.tables();
        tables.orders.retain(|r| r.order.order_id != record.order.order_id);
        tables.orders.push(record.clone());
        Ok(())
    }

    async fn update_order(&self, order: &Order, recorded_price: f64) -> Result<(), LedgerError> {
        self.check_writable()?;
        let mut tables = self.tables();
        if let Some(record) = tables
            .orders
            .iter_mut()
            .find(|r| r.order.order_id == order.order_id)
        {
            record.order.status = order.status;
            record.order.executed_quantity = order.executed_quantity;
            record.order.cumulative_quote_quantity = order.cumulative_quote_quantity;
            record.recorded_price = recorded_price;
        }
        Ok(())
    }

    async fn save_position(
        &self,
        position: &OpenPosition,
        thread_id_session: &str,
    ) -> Result<(), LedgerError> {
        self.check_writable()?;
        let mut tables = self.tables();
        tables.positions.retain(|(p, _)| p.order_id != position.order_id);
        tables
            .positions
            .push((position.clone(), thread_id_session.to_string()));
        Ok(())
    }

    async fn delete_position(&self, order_id: i64) -> Result<(), LedgerError> {
        self.check_writable()?;
        self.tables().positions.retain(|(p, _)| p.order_id != order_id);
        Ok(())
    }

    async fn open_positions(&self, thread_id: &str) -> Result<Vec<OpenPosition>, LedgerError> {
        let mut positions: Vec<OpenPosition> = self
            .tables()
            .positions
            .iter()
            .filter(|(p, _)| p.thread_id == thread_id)
            .map(|(p, _)| p.clone())
            .collect();
        positions.sort_by_key(|p| (p.transact_time, p.order_id));
        Ok(positions)
    }

    async fn count_positions(&self, thread_id: &str) -> Result<usize, LedgerError> {
        Ok(self
            .tables()
            .positions
            .iter()
            .filter(|(p, _)| p.thread_id == thread_id)
            .count())
    }

    async fn last_price(&self, thread_id: &str, side: OrderSide) -> Result<f64, LedgerError> {
        let tables = self.tables();
        Ok(Self::filled_orders(&tables, thread_id)
            .into_iter()
            .find(|r| r.order.side == side)
            .map(|r| r.recorded_price)
            .unwrap_or(0.0))
    }

    async fn last_sides(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<OrderSide>, LedgerError> {
        let tables = self.tables();
        Ok(Self::filled_orders(&tables, thread_id)
            .into_iter()
            .take(limit)
            .map(|r| r.order.side)
            .collect())
    }

    async fn count_orders_since(
        &self,
        thread_id: &str,
        side: OrderSide,
        since: DateTime<Utc>,
    ) -> Result<usize, LedgerError> {
        let since_ms = since.timestamp_millis();
        let tables = self.tables();
        Ok(Self::filled_orders(&tables, thread_id)
            .into_iter()
            .filter(|r| r.order.side == side && r.order.transact_time >= since_ms)
            .count())
    }

    async fn thread_symbol(&self, thread_id: &str) -> Result<Option<String>, LedgerError> {
        Ok(self
            .tables()
            .orders
            .iter()
            .find(|r| r.thread_id == thread_id)
            .map(|r| r.order.symbol.clone()))
    }

    async fn resumable_threads(&self) -> Result<Vec<String>, LedgerError> {
        let tables = self.tables();
        let mut threads: Vec<String> = Vec::new();
        for (position, _) in &tables.positions {
            if !threads.contains(&position.thread_id) {
                threads.push(position.thread_id.clone());
            }
        }
        Ok(threads)
    }

    async fn pending_order(&self, thread_id: &str) -> Result<Option<OrderRecord>, LedgerError> {
        Ok(self
            .tables()
            .orders
            .iter()
            .filter(|r| {
                r.thread_id == thread_id
                    && matches!(
                        r.order.status,
                        OrderStatus::New | OrderStatus::PartiallyFilled
                    )
            })
            .min_by_key(|r| r.order.transact_time)
            .map(|r| {
                let mut record = r.clone();
                record.order.price = record.recorded_price;
                record
            }))
    }

    async fn save_session(&self, row: &SessionRow) -> Result<(), LedgerError> {
        self.check_writable()?;
        self.tables()
            .sessions
            .insert(row.thread_id.clone(), row.clone());
        Ok(())
    }

    async fn update_session(&self, row: &SessionRow) -> Result<bool, LedgerError> {
        self.check_writable()?;
        let mut tables = self.tables();
        match tables.sessions.get_mut(&row.thread_id) {
            Some(existing) => {
                *existing = row.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_session(&self, thread_id: &str) -> Result<Option<SessionRow>, LedgerError> {
        Ok(self.tables().sessions.get(thread_id).cloned())
    }

    async fn delete_session(&self, thread_id: &str) -> Result<(), LedgerError> {
        self.check_writable()?;
        self.tables().sessions.remove(thread_id);
        Ok(())
    }

    async fn profit_summary(&self, thread_id: &str) -> Result<ProfitSummary, LedgerError> {
        let tables = self.tables();
        let sells = || {
            tables
                .orders
                .iter()
                .filter(|r| r.order.side == OrderSide::Sell && r.order.status.has_fill())
        };

        Ok(ProfitSummary {
            total_profit: Self::realized_profit(&tables, sells()),
            thread_profit: Self::realized_profit(
                &tables,
                sells().filter(|r| r.thread_id == thread_id),
            ),
            open_positions: tables.positions.len(),
            open_amount: tables
                .positions
                .iter()
                .map(|(p, _)| p.cumulative_quote_quantity)
                .sum(),
        })
    }
}
