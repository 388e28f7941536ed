use crate::models::LotSize;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Operator request to sell outside the normal rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForceSell {
    /// Specific open position to sell; `None` sells the most recent one
    pub order_id: Option<i64>,
}

/// Mutable per-process session state
///
/// Single-writer fields: wallet balances are written by the account
/// stream (and refreshed by the control loop), `last_buy_at` and
/// `last_sell_canceled_at` by the executor, counters by the ticker task
/// and the sale-count timer.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub thread_id_session: String,
    pub fiat_funds: f64,
    pub symbol_funds: f64,
    pub lot_size: LotSize,
    pub last_buy_at: Option<DateTime<Utc>>,
    pub last_sell_canceled_at: Option<DateTime<Utc>>,
    /// Open positions in the cycle
    pub thread_count: usize,
    /// SELL orders in the trailing 60 minutes
    pub sell_count_60m: usize,
    pub force_buy: bool,
    pub force_sell: Option<ForceSell>,
    pub master: bool,
    /// False once a status check found a silent stream
    pub status_ok: bool,
    pub latency_ms: i64,
    pub last_buy_reason: String,
    pub last_sell_reason: String,
}

/// The session fields a decision reads, copied out in one lock
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub fiat_funds: f64,
    pub symbol_funds: f64,
    pub last_buy_at: Option<DateTime<Utc>>,
    pub last_sell_canceled_at: Option<DateTime<Utc>>,
    pub force_buy: bool,
    pub force_sell: Option<ForceSell>,
    pub thread_count: usize,
}

/// Persisted heartbeat row for one running session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRow {
    pub thread_id: String,
    pub thread_id_session: String,
    pub exchange: String,
    pub symbol_fiat: String,
    pub symbol_fiat_funds: f64,
    pub symbol_funds: f64,
    pub master: bool,
    pub status_ok: bool,
    pub latency_ms: i64,
}

pub struct Session {
    pub thread_id: String,
    pub exchange: String,
    pub symbol: String,
    pub symbol_fiat: String,
    busy: AtomicBool,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(
        thread_id: impl Into<String>,
        exchange: impl Into<String>,
        symbol: impl Into<String>,
        symbol_fiat: impl Into<String>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            exchange: exchange.into(),
            symbol: symbol.into(),
            symbol_fiat: symbol_fiat.into(),
            busy: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                thread_id_session: uuid::Uuid::new_v4().simple().to_string(),
                status_ok: true,
                ..Default::default()
            }),
        }
    }

    /// Lock the mutable state; a poisoned lock still yields the data
    pub fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn view(&self) -> SessionView {
        let state = self.state();
        SessionView {
            fiat_funds: state.fiat_funds,
            symbol_funds: state.symbol_funds,
            last_buy_at: state.last_buy_at,
            last_sell_canceled_at: state.last_sell_canceled_at,
            force_buy: state.force_buy,
            force_sell: state.force_sell,
            thread_count: state.thread_count,
        }
    }

    pub fn row(&self) -> SessionRow {
        let state = self.state();
        SessionRow {
            thread_id: self.thread_id.clone(),
            thread_id_session: state.thread_id_session.clone(),
            exchange: self.exchange.clone(),
            symbol_fiat: self.symbol_fiat.clone(),
            symbol_fiat_funds: state.fiat_funds,
            symbol_funds: state.symbol_funds,
            master: state.master,
            status_ok: state.status_ok,
            latency_ms: state.latency_ms,
        }
    }

    /// Mint a new thread-id-session; done whenever the cycle is empty
    pub fn renew_thread_id_session(&self) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.state().thread_id_session = id.clone();
        id
    }

    pub fn thread_id_session(&self) -> String {
        self.state().thread_id_session.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Mark an order execution in flight until the guard drops
    pub fn begin_execution(&self) -> BusyGuard<'_> {
        self.busy.store(true, Ordering::SeqCst);
        BusyGuard { busy: &self.busy }
    }

    pub fn request_force_buy(&self) {
        self.state().force_buy = true;
    }

    pub fn request_force_sell(&self, order_id: Option<i64>) {
        self.state().force_sell = Some(ForceSell { order_id });
    }

    pub fn clear_force_buy(&self) {
        self.state().force_buy = false;
    }

    pub fn clear_force_sell(&self) {
        self.state().force_sell = None;
    }

    pub fn lot_size(&self) -> LotSize {
        self.state().lot_size
    }

    pub fn set_lot_size(&self, lot_size: LotSize) {
        self.state().lot_size = lot_size;
    }

    pub fn is_master(&self) -> bool {
        self.state().master
    }

    pub fn set_master(&self, master: bool) {
        self.state().master = master;
    }

    pub fn set_counts(&self, thread_count: usize, sell_count_60m: usize) {
        let mut state = self.state();
        state.thread_count = thread_count;
        state.sell_count_60m = sell_count_60m;
    }
}

/// Clears the busy flag on drop, including early returns and panics
pub struct BusyGuard<'a> {
    busy: &'a AtomicBool,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}
