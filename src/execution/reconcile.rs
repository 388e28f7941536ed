use crate::db::Ledger;
use crate::exchange::Exchange;
use crate::models::{OpenPosition, Order, OrderSide, OrderStatus};

use super::ExecutionError;

/// Bring one stale NEW/PARTIALLY_FILLED order of the cycle up to date
///
/// A BUY that turns out to have filled becomes an open position of the
/// cycle. Returns the refreshed order, or `None` when nothing was pending
/// or the exchange could not be reached (retried on the next run).
pub async fn reconcile_pending(
    exchange: &dyn Exchange,
    ledger: &dyn Ledger,
    thread_id: &str,
) -> Result<Option<Order>, ExecutionError> {
    let Some(pending) = ledger.pending_order(thread_id).await? else {
        return Ok(None);
    };
    let order_id = pending.order.order_id;

    let current = match exchange.get_order(&pending.order.symbol, order_id).await {
        Ok(order) => order,
        Err(e) => {
            tracing::debug!(order_id, error = %e, "Pending order lookup failed");
            return Ok(None);
        }
    };

    // Market orders report no price of their own
    let average = current.average_price();
    let recorded_price = if average > 0.0 {
        average
    } else {
        pending.recorded_price
    };
    ledger.update_order(&current, recorded_price).await?;

    if current.side == OrderSide::Buy && current.status.has_fill() {
        let open = ledger
            .open_positions(thread_id)
            .await?
            .iter()
            .any(|p| p.order_id == order_id);

        // A partial fill already opened a position; if that is gone it was sold
        if open || pending.order.status == OrderStatus::New {
            let position = OpenPosition {
                order_id,
                thread_id: thread_id.to_string(),
                price: recorded_price,
                executed_quantity: current.executed_quantity,
                cumulative_quote_quantity: current.cumulative_quote_quantity,
                transact_time: current.transact_time,
            };
            ledger
                .save_position(&position, &pending.thread_id_session)
                .await?;
            tracing::info!(order_id, price = recorded_price, "Reconciled BUY added to cycle");
        }
    }

    if current.status != pending.order.status {
        tracing::info!(
            order_id,
            from = %pending.order.status,
            to = %current.status,
            "Pending order reconciled"
        );
    }
    Ok(Some(current))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryLedger;
    use crate::exchange::mock::MockExchange;
    use crate::models::{OrderRecord, OrderRequest, OrderSide, OrderStatus, OrderType};

    #[tokio::test]
    async fn test_pending_order_updated_from_exchange() {
        let exchange = MockExchange::new();
        let ledger = MemoryLedger::new();

        exchange.push_place_status(OrderStatus::New);
        let order = exchange
            .place_order(&OrderRequest {
                symbol: "BTCUSDT".to_string(),
                side: OrderSide::Sell,
                order_type: OrderType::Limit { price: 105.0 },
                quantity: 1.0,
            })
            .await
            .unwrap();
        ledger
            .save_order(&OrderRecord {
                order: order.clone(),
                thread_id: "thread-1".to_string(),
                thread_id_session: "s1".to_string(),
                order_id_source: Some(7),
                recorded_price: 105.0,
            })
            .await
            .unwrap();

        exchange.push_poll_status(OrderStatus::Filled);
        let refreshed = reconcile_pending(&exchange, &ledger, "thread-1")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(refreshed.status, OrderStatus::Filled);
        let stored = ledger.order(order.order_id).unwrap();
        assert_eq!(stored.order.status, OrderStatus::Filled);
        assert_eq!(stored.order.executed_quantity, 1.0);

        // Nothing left to reconcile
        assert!(reconcile_pending(&exchange, &ledger, "thread-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_exchange_failure_is_not_an_error() {
        let exchange = MockExchange::new();
        let ledger = MemoryLedger::new();
        ledger
            .save_order(&OrderRecord {
                order: Order {
                    client_order_id: "c".to_string(),
                    order_id: 42,
                    symbol: "BTCUSDT".to_string(),
                    side: OrderSide::Buy,
                    status: OrderStatus::New,
                    price: 0.0,
                    requested_quantity: 1.0,
                    executed_quantity: 0.0,
                    cumulative_quote_quantity: 0.0,
                    transact_time: 0,
                },
                thread_id: "thread-1".to_string(),
                thread_id_session: "s1".to_string(),
                order_id_source: None,
                recorded_price: 0.0,
            })
            .await
            .unwrap();

        // The mock does not know order 42
        let result = reconcile_pending(&exchange, &ledger, "thread-1").await.unwrap();
        assert!(result.is_none());
    }

    fn create_test_buy_record(order: Order) -> OrderRecord {
        OrderRecord {
            order,
            thread_id: "thread-1".to_string(),
            thread_id_session: "s1".to_string(),
            order_id_source: None,
            recorded_price: 0.0,
        }
    }

    async fn place_market_buy(exchange: &MockExchange) -> Order {
        exchange.push_place_status(OrderStatus::New);
        exchange
            .place_order(&OrderRequest {
                symbol: "BTCUSDT".to_string(),
                side: OrderSide::Buy,
                order_type: OrderType::Market,
                quantity: 0.2,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_filled_market_buy_opens_position() {
        let exchange = MockExchange::new();
        let ledger = MemoryLedger::new();
        exchange.set_fill_price(100.0);

        let order = place_market_buy(&exchange).await;
        assert_eq!(order.price, 0.0);
        ledger.save_order(&create_test_buy_record(order.clone())).await.unwrap();

        exchange.push_poll_status(OrderStatus::Filled);
        reconcile_pending(&exchange, &ledger, "thread-1").await.unwrap();

        let stored = ledger.order(order.order_id).unwrap();
        assert!((stored.recorded_price - 100.0).abs() < 1e-9);
        assert!((ledger.last_price("thread-1", OrderSide::Buy).await.unwrap() - 100.0).abs() < 1e-9);

        let positions = ledger.open_positions("thread-1").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].order_id, order.order_id);
        assert!((positions[0].price - 100.0).abs() < 1e-9);
        assert!((positions[0].executed_quantity - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unfilled_market_buy_keeps_recorded_price() {
        let exchange = MockExchange::new();
        let ledger = MemoryLedger::new();

        let order = place_market_buy(&exchange).await;
        let mut record = create_test_buy_record(order.clone());
        record.recorded_price = 99.5;
        ledger.save_order(&record).await.unwrap();

        exchange.push_poll_status(OrderStatus::Canceled);
        reconcile_pending(&exchange, &ledger, "thread-1").await.unwrap();

        assert_eq!(ledger.order(order.order_id).unwrap().recorded_price, 99.5);
        assert!(ledger.open_positions("thread-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sold_partial_buy_is_not_reopened() {
        let exchange = MockExchange::new();
        let ledger = MemoryLedger::new();

        let order = place_market_buy(&exchange).await;
        let mut record = create_test_buy_record(order.clone());
        record.order.status = OrderStatus::PartiallyFilled;
        ledger.save_order(&record).await.unwrap();

        exchange.push_poll_status(OrderStatus::Filled);
        reconcile_pending(&exchange, &ledger, "thread-1").await.unwrap();

        assert_eq!(ledger.order(order.order_id).unwrap().order.status, OrderStatus::Filled);
        assert!(ledger.open_positions("thread-1").await.unwrap().is_empty());
    }
}
