use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::quantity::order_quantity;
use crate::config::StrategyParameters;
use crate::db::{Ledger, LedgerError};
use crate::exchange::{Exchange, ExchangeError};
use crate::market::MarketSnapshot;
use crate::models::{
    OpenPosition, Order, OrderRecord, OrderRequest, OrderSide, OrderStatus, OrderType,
};
use crate::session::Session;
use crate::strategy::{BuyKind, SellKind};

/// Poll count after which an unfilled SELL is canceled
pub const SELL_CANCEL_AFTER_POLLS: u32 = 9;

const DEFAULT_BUY_POLL_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_SELL_SETTLE_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The ledger no longer reflects the exchange; the process must stop
    #[error("ledger write failed: {0}")]
    Fatal(#[from] LedgerError),

    /// This attempt was dropped; the next tick re-evaluates
    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("order not placed: {0}")]
    Rejected(String),
}

impl ExecutionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecutionError::Fatal(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuyOutcome {
    DryRun,
    Opened(OpenPosition),
    Canceled { order_id: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SellOutcome {
    DryRun,
    Sold { order_id: i64, profit: f64 },
    Canceled { order_id: i64 },
    /// Wallet held less than the position; a corrective buy went out instead
    Replenished(BuyOutcome),
}

/// Where a SELL ended up after polling
enum Settlement {
    Filled(Order),
    Canceled(Order),
}

/// Drives BUY and SELL orders from placement to a terminal state
///
/// Every call holds the session busy flag until it returns, so a shutdown
/// never tears the process down with an order in flight.
pub struct OrderExecutor {
    exchange: Arc<dyn Exchange>,
    ledger: Arc<dyn Ledger>,
    buy_poll_interval: Duration,
    sell_settle_delay: Duration,
}

impl OrderExecutor {
    pub fn new(exchange: Arc<dyn Exchange>, ledger: Arc<dyn Ledger>) -> Self {
        Self {
            exchange,
            ledger,
            buy_poll_interval: DEFAULT_BUY_POLL_INTERVAL,
            sell_settle_delay: DEFAULT_SELL_SETTLE_DELAY,
        }
    }

    pub fn with_buy_poll_interval(mut self, interval: Duration) -> Self {
        self.buy_poll_interval = interval;
        self
    }

    /// Pause between placing a SELL and its first status poll
    pub fn with_sell_settle_delay(mut self, delay: Duration) -> Self {
        self.sell_settle_delay = delay;
        self
    }

    pub async fn execute_buy(
        &self,
        session: &Session,
        params: &StrategyParameters,
        market: &MarketSnapshot,
        kind: BuyKind,
        fiat_amount: f64,
    ) -> Result<BuyOutcome, ExecutionError> {
        let _busy = session.begin_execution();

        if params.dry_run {
            tracing::info!(
                target: "audit",
                thread_id = %session.thread_id,
                kind = %kind,
                price = market.price,
                fiat_amount,
                "BUYDRYRUN"
            );
            return Ok(BuyOutcome::DryRun);
        }

        self.buy(session, market, kind, fiat_amount).await
    }

    async fn buy(
        &self,
        session: &Session,
        market: &MarketSnapshot,
        kind: BuyKind,
        fiat_amount: f64,
    ) -> Result<BuyOutcome, ExecutionError> {
        if market.price <= 0.0 {
            return Err(ExecutionError::Rejected("no market price".to_string()));
        }
        let quantity = order_quantity(fiat_amount / market.price, &session.lot_size());
        if quantity <= 0.0 {
            return Err(ExecutionError::Rejected(format!(
                "{:.2} {} is below the minimum lot",
                fiat_amount, session.symbol_fiat
            )));
        }

        let request = OrderRequest {
            symbol: session.symbol.clone(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity,
        };

        let placed = match self.exchange.place_order(&request).await {
            Ok(order) => order,
            Err(ExchangeError::LotSize) => {
                self.refresh_lot_size(session).await;
                return Err(ExchangeError::LotSize.into());
            }
            Err(e) => return Err(e.into()),
        };

        let thread_id_session = session.thread_id_session();
        self.ledger
            .save_order(&OrderRecord {
                order: placed.clone(),
                thread_id: session.thread_id.clone(),
                thread_id_session: thread_id_session.clone(),
                order_id_source: None,
                recorded_price: placed.average_price(),
            })
            .await?;
        session.state().last_buy_at = Some(Utc::now());

        let order = match placed.status {
            OrderStatus::New => {
                let settled = self.poll_while_new(&placed).await?;
                self.ledger
                    .update_order(&settled, settled.average_price())
                    .await?;
                settled
            }
            _ => placed,
        };

        if order.status == OrderStatus::Canceled {
            tracing::info!(
                target: "audit",
                thread_id = %session.thread_id,
                order_id = order.order_id,
                price = market.price,
                "CANCELED"
            );
            return Ok(BuyOutcome::Canceled {
                order_id: order.order_id,
            });
        }

        let position = OpenPosition {
            order_id: order.order_id,
            thread_id: session.thread_id.clone(),
            price: order.average_price(),
            executed_quantity: order.executed_quantity,
            cumulative_quote_quantity: order.cumulative_quote_quantity,
            transact_time: order.transact_time,
        };
        self.ledger
            .save_position(&position, &thread_id_session)
            .await?;

        tracing::info!(
            target: "audit",
            thread_id = %session.thread_id,
            order_id = position.order_id,
            kind = %kind,
            price = position.price,
            quantity = position.executed_quantity,
            "BUY"
        );
        Ok(BuyOutcome::Opened(position))
    }

    /// Poll a BUY until it leaves NEW; a failed poll abandons the attempt
    async fn poll_while_new(&self, placed: &Order) -> Result<Order, ExecutionError> {
        loop {
            let current = self
                .exchange
                .get_order(&placed.symbol, placed.order_id)
                .await?;
            if current.status != OrderStatus::New {
                return Ok(current);
            }
            tokio::time::sleep(self.buy_poll_interval).await;
        }
    }

    async fn refresh_lot_size(&self, session: &Session) {
        match self.exchange.lot_size(&session.symbol).await {
            Ok(lot_size) => {
                tracing::info!(
                    symbol = %session.symbol,
                    step_size = lot_size.step_size,
                    min_quantity = lot_size.min_quantity,
                    "Lot size refreshed"
                );
                session.set_lot_size(lot_size);
            }
            Err(e) => tracing::warn!(error = %e, "Lot size refresh failed"),
        }
    }

    pub async fn execute_sell(
        &self,
        session: &Session,
        params: &StrategyParameters,
        market: &MarketSnapshot,
        position: &OpenPosition,
        kind: SellKind,
    ) -> Result<SellOutcome, ExecutionError> {
        let _busy = session.begin_execution();

        if params.dry_run {
            tracing::info!(
                target: "audit",
                thread_id = %session.thread_id,
                order_id = position.order_id,
                kind = %kind,
                price = market.price,
                "SELLDRYRUN"
            );
            return Ok(SellOutcome::DryRun);
        }

        let lot_size = session.lot_size();
        let quantity = order_quantity(position.executed_quantity, &lot_size);
        let symbol_funds = session.state().symbol_funds;

        if symbol_funds < quantity {
            tracing::warn!(
                order_id = position.order_id,
                symbol_funds,
                quantity,
                "Wallet holds less than the position; buying to make up the difference"
            );
            let outcome = self
                .buy(session, market, BuyKind::Initial, params.buy_quantity_fiat_init)
                .await?;
            return Ok(SellOutcome::Replenished(outcome));
        }
        if quantity <= 0.0 {
            return Err(ExecutionError::Rejected(format!(
                "position {} is below the minimum lot",
                position.order_id
            )));
        }

        let order_type = if kind == SellKind::Forced {
            OrderType::Market
        } else {
            OrderType::Limit {
                price: market.price,
            }
        };
        let request = OrderRequest {
            symbol: session.symbol.clone(),
            side: OrderSide::Sell,
            order_type,
            quantity,
        };

        let placed = self.exchange.place_order(&request).await.map_err(|e| {
            tracing::debug!(order_id = position.order_id, error = %e, "SELL not placed");
            e
        })?;

        self.ledger
            .save_order(&OrderRecord {
                order: placed.clone(),
                thread_id: session.thread_id.clone(),
                thread_id_session: session.thread_id_session(),
                order_id_source: Some(position.order_id),
                recorded_price: market.price,
            })
            .await?;

        let settlement = match placed.status {
            OrderStatus::Filled => Settlement::Filled(placed),
            OrderStatus::Canceled => Settlement::Canceled(placed),
            OrderStatus::New | OrderStatus::PartiallyFilled => {
                let settlement = self.await_sell(session, params, &placed).await?;
                let latest = match &settlement {
                    Settlement::Filled(order) | Settlement::Canceled(order) => order,
                };
                self.ledger.update_order(latest, market.price).await?;
                settlement
            }
        };

        match settlement {
            Settlement::Canceled(order) => {
                tracing::info!(
                    target: "audit",
                    thread_id = %session.thread_id,
                    order_id = order.order_id,
                    source_order_id = position.order_id,
                    price = market.price,
                    "CANCELED"
                );
                Ok(SellOutcome::Canceled {
                    order_id: order.order_id,
                })
            }
            Settlement::Filled(order) => {
                self.ledger.delete_position(position.order_id).await?;
                let profit = realized_profit(position, &order);
                tracing::info!(
                    target: "audit",
                    thread_id = %session.thread_id,
                    order_id = order.order_id,
                    source_order_id = position.order_id,
                    kind = %kind,
                    price = market.price,
                    quantity = order.executed_quantity,
                    profit,
                    "SELL"
                );
                Ok(SellOutcome::Sold {
                    order_id: order.order_id,
                    profit,
                })
            }
        }
    }

    /// Poll an open SELL; cancel it on the ninth unfilled poll
    async fn await_sell(
        &self,
        session: &Session,
        params: &StrategyParameters,
        placed: &Order,
    ) -> Result<Settlement, ExecutionError> {
        let interval = Duration::from_millis(params.sell_wait_before_cancel * 100);
        let symbol = placed.symbol.as_str();
        let order_id = placed.order_id;

        tokio::time::sleep(self.sell_settle_delay).await;

        let mut polls = 0;
        loop {
            let current = self.exchange.get_order(symbol, order_id).await?;
            match current.status {
                OrderStatus::Filled => return Ok(Settlement::Filled(current)),
                OrderStatus::Canceled => return Ok(Settlement::Canceled(current)),
                OrderStatus::New | OrderStatus::PartiallyFilled => {}
            }

            polls += 1;
            if polls == SELL_CANCEL_AFTER_POLLS {
                return match self.exchange.cancel_order(symbol, order_id).await {
                    Ok(canceled) if canceled.status == OrderStatus::Canceled => {
                        session.state().last_sell_canceled_at = Some(Utc::now());
                        let latest = self.exchange.get_order(symbol, order_id).await?;
                        if latest.status == OrderStatus::Filled {
                            Ok(Settlement::Filled(latest))
                        } else {
                            Ok(Settlement::Canceled(latest))
                        }
                    }
                    Ok(other) => {
                        tracing::warn!(order_id, status = %other.status, "Cancel did not take effect");
                        let latest = self.exchange.get_order(symbol, order_id).await?;
                        resolve_after_cancel_race(latest)
                    }
                    Err(e) if e.is_cancel_race() => {
                        tracing::info!(order_id, error = %e, "Cancel raced with a fill; re-reading order");
                        let latest = self.exchange.get_order(symbol, order_id).await?;
                        resolve_after_cancel_race(latest)
                    }
                    Err(e) => {
                        tracing::warn!(order_id, error = %e, "Cancel failed; position stays open");
                        Err(e.into())
                    }
                };
            }

            tokio::time::sleep(interval).await;
        }
    }
}

/// The re-read status decides, not the cancel error
fn resolve_after_cancel_race(latest: Order) -> Result<Settlement, ExecutionError> {
    match latest.status {
        OrderStatus::Filled | OrderStatus::PartiallyFilled => Ok(Settlement::Filled(latest)),
        OrderStatus::Canceled => Ok(Settlement::Canceled(latest)),
        OrderStatus::New => Err(ExecutionError::Rejected(format!(
            "order {} still open after cancel attempt",
            latest.order_id
        ))),
    }
}

/// Proceeds of the sale minus the cost of the part of the lot it sold
pub fn realized_profit(position: &OpenPosition, sell: &Order) -> f64 {
    if position.executed_quantity <= 0.0 {
        return sell.cumulative_quote_quantity;
    }
    let sold_share = sell.executed_quantity / position.executed_quantity;
    sell.cumulative_quote_quantity - position.cumulative_quote_quantity * sold_share
}
