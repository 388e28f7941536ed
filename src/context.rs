//! Shared state handed to every task, plus the single shutdown path

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::ParamsHandle;
use crate::db::Ledger;
use crate::exchange::Exchange;
use crate::execution::OrderExecutor;
use crate::market::Market;
use crate::node::{CycleLock, NodeCoordinator};
use crate::session::Session;

const BUSY_SPIN: Duration = Duration::from_millis(200);

/// Everything a stream handler or timer needs, passed explicitly
///
/// Field ownership: the user-data task writes wallet balances, the kline
/// task writes indicators, the ticker task writes price and drives orders.
pub struct AppContext {
    pub session: Session,
    pub market: Market,
    pub params: ParamsHandle,
    pub exchange: Arc<dyn Exchange>,
    pub ledger: Arc<dyn Ledger>,
    pub executor: OrderExecutor,
    pub node: NodeCoordinator,
    cycle_lock: Option<CycleLock>,
    /// Cancelled once, when the process is going down
    pub shutdown: CancellationToken,
    stop_reason: Mutex<Option<String>>,
}

impl AppContext {
    pub fn new(
        session: Session,
        params: ParamsHandle,
        exchange: Arc<dyn Exchange>,
        ledger: Arc<dyn Ledger>,
        node: NodeCoordinator,
    ) -> Self {
        let executor = OrderExecutor::new(exchange.clone(), ledger.clone());
        Self {
            session,
            market: Market::new(),
            params,
            exchange,
            ledger,
            executor,
            node,
            cycle_lock: None,
            shutdown: CancellationToken::new(),
            stop_reason: Mutex::new(None),
        }
    }

    pub fn with_executor(mut self, executor: OrderExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_cycle_lock(mut self, lock: CycleLock) -> Self {
        self.cycle_lock = Some(lock);
        self
    }

    /// Ask every task to wind down; the first reason given is kept
    pub fn request_stop(&self, reason: impl Into<String>) {
        let mut slot = self.stop_reason.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(reason.into());
        }
        self.shutdown.cancel();
    }

    /// Stop because the ledger can no longer be trusted
    pub fn fatal(&self, error: &dyn std::error::Error) {
        tracing::error!(thread_id = %self.session.thread_id, error = %error, "Fatal error, shutting down");
        self.request_stop(format!("fatal: {}", error));
    }

    pub fn stop_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn stop_reason(&self) -> Option<String> {
        self.stop_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Release everything this process holds, once no order is in flight
    ///
    /// Returns the stop reason.
    pub async fn finalize(&self) -> String {
        self.shutdown.cancel();
        while self.session.is_busy() {
            tokio::time::sleep(BUSY_SPIN).await;
        }

        self.node.release().await;
        self.session.set_master(false);

        if let Some(lock) = &self.cycle_lock {
            if let Err(e) = lock.release().await {
                tracing::warn!(thread_id = %lock.thread_id(), error = %e, "Cycle lock not released");
            }
        }

        if let Err(e) = self.ledger.delete_session(&self.session.thread_id).await {
            tracing::warn!(error = %e, "Session row not deleted");
        }

        let reason = self.stop_reason().unwrap_or_else(|| "shutdown".to_string());
        tracing::info!(
            target: "audit",
            thread_id = %self.session.thread_id,
            reason = %reason,
            "Clean Shutdown"
        );
        reason
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::config::StrategyParameters;
    use crate::db::MemoryLedger;
    use crate::exchange::mock::MockExchange;
    use crate::node::MemoryLease;

    pub struct TestContext {
        pub ctx: Arc<AppContext>,
        pub exchange: Arc<MockExchange>,
        pub ledger: Arc<MemoryLedger>,
        pub leases: Arc<MemoryLease>,
    }

    pub fn create_test_context(params: StrategyParameters) -> TestContext {
        create_test_context_with_handle(ParamsHandle::new(params, None))
    }

    pub fn create_test_context_with_handle(handle: ParamsHandle) -> TestContext {
        let exchange = Arc::new(MockExchange::new());
        let ledger = Arc::new(MemoryLedger::new());
        let leases = Arc::new(MemoryLease::new());
        let params = handle.snapshot();
        let session = Session::new("thread-1", "binance", params.symbol.clone(), params.symbol_fiat.clone());
        let executor = OrderExecutor::new(exchange.clone(), ledger.clone())
            .with_buy_poll_interval(Duration::ZERO)
            .with_sell_settle_delay(Duration::ZERO);
        let ctx = AppContext::new(
            session,
            handle,
            exchange.clone(),
            ledger.clone(),
            NodeCoordinator::new(leases.clone(), false),
        )
        .with_executor(executor);
        TestContext {
            ctx: Arc::new(ctx),
            exchange,
            ledger,
            leases,
        }
    }
}
