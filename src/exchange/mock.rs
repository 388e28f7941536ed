//! Scripted exchange for testing
//!
//! Orders fill at a configurable price. Each call to `get_order` or
//! `cancel_order` consumes the next scripted response; once a script runs
//! dry the stored order is returned unchanged. Streams replay scripted
//! events and then stay open until dropped, unless scripted to close.

use super::{EventStream, Exchange, ExchangeError, StreamError};
use crate::models::{
    Balance, BookTicker, Kline, KlineEvent, LotSize, Order, OrderRequest, OrderStatus, OrderType,
    PriceChangeStats, UserDataEvent,
};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// Scripted events, and whether the stream ends once they are replayed
type Script<T> = VecDeque<(Vec<Result<T, StreamError>>, bool)>;

struct MockState {
    next_order_id: i64,
    fill_price: f64,
    orders: HashMap<i64, Order>,
    placed: Vec<OrderRequest>,
    place_script: VecDeque<Result<OrderStatus, ExchangeError>>,
    poll_script: VecDeque<Result<OrderStatus, ExchangeError>>,
    cancel_script: VecDeque<Result<OrderStatus, ExchangeError>>,
    get_calls: usize,
    cancel_calls: usize,
    reconnects: usize,
    keepalives: usize,
    balances: Vec<Balance>,
    lot_size: LotSize,
    lot_size_calls: usize,
    klines: Vec<Kline>,
    stats: PriceChangeStats,
    latency_ms: i64,
    user_streams: Script<UserDataEvent>,
    kline_streams: Script<KlineEvent>,
    ticker_streams: Script<BookTicker>,
    streams_opened: usize,
}

/// Programmable in-process exchange
pub struct MockExchange {
    state: Mutex<MockState>,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_order_id: 1000,
                fill_price: 100.0,
                orders: HashMap::new(),
                placed: Vec::new(),
                place_script: VecDeque::new(),
                poll_script: VecDeque::new(),
                cancel_script: VecDeque::new(),
                get_calls: 0,
                cancel_calls: 0,
                reconnects: 0,
                keepalives: 0,
                balances: Vec::new(),
                lot_size: LotSize::default(),
                lot_size_calls: 0,
                klines: Vec::new(),
                stats: PriceChangeStats {
                    high_price: 0.0,
                    low_price: 0.0,
                },
                latency_ms: 5,
                user_streams: VecDeque::new(),
                kline_streams: VecDeque::new(),
                ticker_streams: VecDeque::new(),
                streams_opened: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Price market orders fill at
    pub fn set_fill_price(&self, price: f64) {
        self.lock().fill_price = price;
    }

    /// Status returned by the next `place_order` (default FILLED)
    pub fn push_place_status(&self, status: OrderStatus) {
        self.lock().place_script.push_back(Ok(status));
    }

    pub fn push_place_error(&self, error: ExchangeError) {
        self.lock().place_script.push_back(Err(error));
    }

    /// Status the next `get_order` reports (and moves the order to)
    pub fn push_poll_status(&self, status: OrderStatus) {
        self.lock().poll_script.push_back(Ok(status));
    }

    pub fn push_poll_error(&self, error: ExchangeError) {
        self.lock().poll_script.push_back(Err(error));
    }

    /// Outcome of the next `cancel_order` (default CANCELED)
    pub fn push_cancel_result(&self, result: Result<OrderStatus, ExchangeError>) {
        self.lock().cancel_script.push_back(result);
    }

    pub fn set_balances(&self, balances: Vec<Balance>) {
        self.lock().balances = balances;
    }

    pub fn set_lot_size(&self, lot_size: LotSize) {
        self.lock().lot_size = lot_size;
    }

    pub fn set_history(&self, klines: Vec<Kline>, stats: PriceChangeStats) {
        let mut state = self.lock();
        state.klines = klines;
        state.stats = stats;
    }

    pub fn push_user_stream(&self, events: Vec<Result<UserDataEvent, StreamError>>) {
        self.lock().user_streams.push_back((events, false));
    }

    pub fn push_kline_stream(&self, events: Vec<Result<KlineEvent, StreamError>>) {
        self.lock().kline_streams.push_back((events, false));
    }

    pub fn push_ticker_stream(&self, events: Vec<Result<BookTicker, StreamError>>) {
        self.lock().ticker_streams.push_back((events, false));
    }

    /// Like [`MockExchange::push_ticker_stream`], but the stream then ends
    pub fn push_closing_ticker_stream(&self, events: Vec<Result<BookTicker, StreamError>>) {
        self.lock().ticker_streams.push_back((events, true));
    }

    pub fn placed(&self) -> Vec<OrderRequest> {
        self.lock().placed.clone()
    }

    pub fn order(&self, order_id: i64) -> Option<Order> {
        self.lock().orders.get(&order_id).cloned()
    }

    pub fn get_calls(&self) -> usize {
        self.lock().get_calls
    }

    pub fn cancel_calls(&self) -> usize {
        self.lock().cancel_calls
    }

    pub fn reconnects(&self) -> usize {
        self.lock().reconnects
    }

    pub fn keepalives(&self) -> usize {
        self.lock().keepalives
    }

    pub fn lot_size_calls(&self) -> usize {
        self.lock().lot_size_calls
    }

    /// Streams opened so far across all three kinds
    pub fn streams_opened(&self) -> usize {
        self.lock().streams_opened
    }
}

/// Move an order to `status`; market orders fill at `market_fill_price`
fn transition(order: &mut Order, status: OrderStatus, market_fill_price: f64) {
    order.status = status;
    let executed = match status {
        OrderStatus::Filled => order.requested_quantity,
        OrderStatus::PartiallyFilled => order.requested_quantity / 2.0,
        OrderStatus::New | OrderStatus::Canceled => order.executed_quantity,
    };
    order.executed_quantity = executed;
    let price = if order.price > 0.0 {
        order.price
    } else {
        market_fill_price
    };
    order.cumulative_quote_quantity = executed * price;
}

fn scripted<T: Send + 'static>(script: Option<(Vec<Result<T, StreamError>>, bool)>) -> EventStream<T> {
    match script {
        Some((events, true)) => Box::pin(stream::iter(events)),
        Some((events, false)) => Box::pin(stream::iter(events).chain(stream::pending())),
        None => Box::pin(stream::pending()),
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn place_order(&self, request: &OrderRequest) -> Result<Order, ExchangeError> {
        let mut state = self.lock();
        state.placed.push(request.clone());
        let status = state.place_script.pop_front().unwrap_or(Ok(OrderStatus::Filled))?;

        let order_id = state.next_order_id;
        state.next_order_id += 1;
        // Market orders carry no price of their own, as on the exchange
        let price = match request.order_type {
            OrderType::Market => 0.0,
            OrderType::Limit { price } => price,
        };
        let fill_price = state.fill_price;

        let mut order = Order {
            client_order_id: format!("mock-{}", order_id),
            order_id,
            symbol: request.symbol.clone(),
            side: request.side,
            status: OrderStatus::New,
            price,
            requested_quantity: request.quantity,
            executed_quantity: 0.0,
            cumulative_quote_quantity: 0.0,
            transact_time: chrono::Utc::now().timestamp_millis(),
        };
        transition(&mut order, status, fill_price);
        state.orders.insert(order_id, order.clone());
        Ok(order)
    }

    async fn get_order(&self, _symbol: &str, order_id: i64) -> Result<Order, ExchangeError> {
        let mut state = self.lock();
        state.get_calls += 1;
        let next = state.poll_script.pop_front();
        let fill_price = state.fill_price;
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or(ExchangeError::UnknownOrder)?;
        if let Some(next) = next {
            transition(order, next?, fill_price);
        }
        Ok(order.clone())
    }

    async fn cancel_order(&self, _symbol: &str, order_id: i64) -> Result<Order, ExchangeError> {
        let mut state = self.lock();
        state.cancel_calls += 1;
        let result = state.cancel_script.pop_front().unwrap_or(Ok(OrderStatus::Canceled));
        let fill_price = state.fill_price;
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or(ExchangeError::UnknownOrder)?;
        transition(order, result?, fill_price);
        Ok(order.clone())
    }

    async fn klines(&self, _symbol: &str, limit: u16) -> Result<Vec<Kline>, ExchangeError> {
        let state = self.lock();
        let skip = state.klines.len().saturating_sub(limit as usize);
        Ok(state.klines[skip..].to_vec())
    }

    async fn price_change_stats(&self, _symbol: &str) -> Result<PriceChangeStats, ExchangeError> {
        Ok(self.lock().stats)
    }

    async fn balances(&self) -> Result<Vec<Balance>, ExchangeError> {
        Ok(self.lock().balances.clone())
    }

    async fn lot_size(&self, _symbol: &str) -> Result<LotSize, ExchangeError> {
        let mut state = self.lock();
        state.lot_size_calls += 1;
        Ok(state.lot_size)
    }

    async fn sync_time(&self) -> Result<i64, ExchangeError> {
        Ok(self.lock().latency_ms)
    }

    async fn keepalive_user_stream(&self) -> Result<(), ExchangeError> {
        self.lock().keepalives += 1;
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), ExchangeError> {
        self.lock().reconnects += 1;
        Ok(())
    }

    async fn user_data_stream(&self) -> Result<EventStream<UserDataEvent>, ExchangeError> {
        let mut state = self.lock();
        state.streams_opened += 1;
        Ok(scripted(state.user_streams.pop_front()))
    }

    async fn kline_stream(&self, _symbol: &str) -> Result<EventStream<KlineEvent>, ExchangeError> {
        let mut state = self.lock();
        state.streams_opened += 1;
        Ok(scripted(state.kline_streams.pop_front()))
    }

    async fn book_ticker_stream(
        &self,
        _symbol: &str,
    ) -> Result<EventStream<BookTicker>, ExchangeError> {
        let mut state = self.lock();
        state.streams_opened += 1;
        Ok(scripted(state.ticker_streams.pop_front()))
    }
}
