use chrono::Utc;

use crate::context::AppContext;
use crate::db::LedgerError;
use crate::exchange::free_balance;
use crate::execution::ExecutionError;
use crate::models::{BookTicker, KlineEvent, OrderSide, UserDataEvent};
use crate::strategy::{evaluate_buy, evaluate_sell, BuyAction, DecisionContext, SellAction};

/// Wallet and order pushes from the account stream
pub async fn on_user_data(ctx: &AppContext, event: UserDataEvent) -> Result<(), LedgerError> {
    match event {
        UserDataEvent::AccountPosition { balances } => {
            let params = ctx.params.snapshot();
            {
                let mut state = ctx.session.state();
                if balances.iter().any(|b| b.asset == params.symbol_fiat) {
                    state.fiat_funds = free_balance(&balances, &params.symbol_fiat);
                }
                if balances.iter().any(|b| b.asset == params.base_asset()) {
                    state.symbol_funds = free_balance(&balances, params.base_asset());
                }
            }
            ctx.ledger.update_session(&ctx.session.row()).await?;
        }
        UserDataEvent::ExecutionReport { order_id, status } => {
            tracing::debug!(order_id, status = %status, "Execution report");
        }
        UserDataEvent::Other => {}
    }
    Ok(())
}

/// Candle updates: direction on every event, indicators on close
pub async fn on_kline(ctx: &AppContext, event: KlineEvent) {
    let now = Utc::now();
    if !ctx.market.apply_kline(&event, now) {
        return;
    }

    let stats = match ctx.exchange.price_change_stats(&ctx.session.symbol).await {
        Ok(stats) => Some(stats),
        Err(e) => {
            tracing::warn!(error = %e, "24h stats unavailable, keeping previous");
            None
        }
    };
    ctx.market.recompute(stats, Utc::now());
}

/// One price tick: evaluate BUY first, SELL only when no BUY fired
///
/// Only ledger failures are returned; exchange failures drop the attempt
/// and the next tick re-evaluates.
pub async fn on_ticker(ctx: &AppContext, ticker: BookTicker) -> Result<(), ExecutionError> {
    let params = ctx.params.snapshot();
    let session = &ctx.session;

    if params.exit && session.state().thread_count == 0 {
        ctx.request_stop("exit");
        return Ok(());
    }

    if !ticker.best_ask_price.is_finite() || ticker.best_ask_price <= 0.0 {
        return Ok(());
    }

    let now = Utc::now();
    ctx.market.set_price(ticker.best_ask_price, now);

    let ledger = ctx.ledger.ledger_state(&session.thread_id, now).await?;
    let market = ctx.market.snapshot();
    let view = session.view();
    let decision_ctx = DecisionContext {
        params: &params,
        market: &market,
        session: &view,
        ledger: &ledger,
        now,
    };

    let buy = evaluate_buy(&decision_ctx);
    session.state().last_buy_reason = buy.reason.clone();
    if let BuyAction::Buy { kind, fiat_amount } = buy.action {
        if view.force_buy {
            session.clear_force_buy();
        }
        tracing::debug!(kind = %kind, fiat_amount, reason = %buy.reason, "Buying");
        let result = ctx
            .executor
            .execute_buy(session, &params, &market, kind, fiat_amount)
            .await;
        settle(ctx, result)?;
        refresh_counts(ctx).await?;
        return Ok(());
    }

    let sell = evaluate_sell(&decision_ctx);
    session.state().last_sell_reason = sell.reason.clone();
    if view.force_sell.is_some() {
        session.clear_force_sell();
        if !sell.should_sell() {
            tracing::info!(reason = %sell.reason, "Force sell rejected");
        }
    }
    if let SellAction::Sell { position, kind } = &sell.action {
        tracing::debug!(order_id = position.order_id, kind = %kind, reason = %sell.reason, "Selling");
        let result = ctx
            .executor
            .execute_sell(session, &params, &market, position, *kind)
            .await;
        settle(ctx, result)?;
        refresh_counts(ctx).await?;
    }

    Ok(())
}

/// Swallow non-fatal execution failures, pass fatal ones up
fn settle<T>(ctx: &AppContext, result: Result<T, ExecutionError>) -> Result<(), ExecutionError> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            tracing::warn!(thread_id = %ctx.session.thread_id, error = %e, "Order attempt dropped");
            Ok(())
        }
    }
}

/// Refresh open-position count and trailing-hour sell count
pub async fn refresh_counts(ctx: &AppContext) -> Result<(), LedgerError> {
    let thread_id = &ctx.session.thread_id;
    let positions = ctx.ledger.count_positions(thread_id).await?;
    let since = Utc::now() - chrono::Duration::minutes(60);
    let sells = ctx
        .ledger
        .count_orders_since(thread_id, OrderSide::Sell, since)
        .await?;
    ctx.session.set_counts(positions, sells);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Ledger;
    use crate::config::StrategyParameters;
    use crate::context::fixtures::create_test_context;
    use crate::market::MarketSnapshot;
    use crate::models::{Balance, Kline, OpenPosition};

    fn params() -> StrategyParameters {
        StrategyParameters {
            buy_quantity_fiat_init: 20.0,
            buy_quantity_fiat_down: 10.0,
            buy_wait: 0,
            ..Default::default()
        }
    }

    fn ticker(price: f64) -> BookTicker {
        BookTicker {
            symbol: "BTCUSDT".to_string(),
            best_bid_price: price,
            best_ask_price: price,
        }
    }

    fn ready_market(ctx: &AppContext) {
        ctx.market.replace_snapshot(MarketSnapshot {
            rsi3: 5.0,
            rsi7: 20.0,
            rsi14: 40.0,
            high_24h: 200.0,
            low_24h: 50.0,
            direction: 1,
            updated_at: Some(Utc::now()),
            ..Default::default()
        });
    }

    #[tokio::test]
    async fn test_balances_update_session_funds() {
        let test = create_test_context(params());
        let event = UserDataEvent::AccountPosition {
            balances: vec![
                Balance {
                    asset: "USDT".to_string(),
                    free: 250.0,
                    locked: 0.0,
                },
                Balance {
                    asset: "BTC".to_string(),
                    free: 0.5,
                    locked: 0.1,
                },
            ],
        };
        test.ledger.save_session(&test.ctx.session.row()).await.unwrap();

        on_user_data(&test.ctx, event).await.unwrap();

        let view = test.ctx.session.view();
        assert_eq!(view.fiat_funds, 250.0);
        assert_eq!(view.symbol_funds, 0.5);
        let row = test.ledger.get_session("thread-1").await.unwrap().unwrap();
        assert_eq!(row.symbol_fiat_funds, 250.0);
    }

    #[tokio::test]
    async fn test_partial_balance_update_keeps_other_asset() {
        let test = create_test_context(params());
        test.ctx.session.state().symbol_funds = 2.0;
        let event = UserDataEvent::AccountPosition {
            balances: vec![Balance {
                asset: "USDT".to_string(),
                free: 10.0,
                locked: 0.0,
            }],
        };
        on_user_data(&test.ctx, event).await.unwrap();
        assert_eq!(test.ctx.session.view().symbol_funds, 2.0);
    }

    #[tokio::test]
    async fn test_final_kline_recomputes_indicators() {
        let test = create_test_context(params());
        test.exchange.set_history(
            Vec::new(),
            crate::models::PriceChangeStats {
                high_price: 150.0,
                low_price: 90.0,
            },
        );
        let event = KlineEvent {
            kline: Kline {
                open_time: 60_000,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                volume: 10.0,
                taker_buy_volume: 6.0,
            },
            is_final: true,
        };

        on_kline(&test.ctx, event).await;

        let snapshot = test.ctx.market.snapshot();
        assert_eq!(snapshot.high_24h, 150.0);
        assert!(snapshot.updated_at.is_some());
        assert_eq!(snapshot.direction, 1);
    }

    #[tokio::test]
    async fn test_ticker_opens_initial_position() {
        let test = create_test_context(params());
        test.ctx.session.state().fiat_funds = 1_000.0;
        ready_market(&test.ctx);

        on_ticker(&test.ctx, ticker(100.0)).await.unwrap();

        assert_eq!(test.exchange.placed().len(), 1);
        assert_eq!(test.exchange.placed()[0].side, OrderSide::Buy);
        assert_eq!(test.ctx.session.state().thread_count, 1);
    }

    #[tokio::test]
    async fn test_ticker_sells_profitable_position() {
        let test = create_test_context(params());
        test.ctx.session.state().symbol_funds = 5.0;
        ready_market(&test.ctx);
        test.ledger
            .save_position(
                &OpenPosition {
                    order_id: 1,
                    thread_id: "thread-1".to_string(),
                    price: 100.0,
                    executed_quantity: 0.2,
                    cumulative_quote_quantity: 20.0,
                    transact_time: (Utc::now() - chrono::Duration::minutes(10)).timestamp_millis(),
                },
                "s1",
            )
            .await
            .unwrap();

        // No fiat: BUY is rejected on funds, SELL takes the profit
        on_ticker(&test.ctx, ticker(110.0)).await.unwrap();

        let placed = test.exchange.placed();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].side, OrderSide::Sell);
        assert_eq!(test.ledger.count_positions("thread-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_exit_mode_with_empty_cycle_stops() {
        let test = create_test_context(StrategyParameters {
            exit: true,
            ..params()
        });

        on_ticker(&test.ctx, ticker(100.0)).await.unwrap();

        assert!(test.ctx.stop_requested());
        assert_eq!(test.ctx.stop_reason().as_deref(), Some("exit"));
        assert!(test.exchange.placed().is_empty());
    }

    #[tokio::test]
    async fn test_force_flags_cleared_after_use() {
        let test = create_test_context(params());
        test.ctx.session.state().fiat_funds = 1_000.0;
        test.ctx.session.request_force_buy();

        on_ticker(&test.ctx, ticker(100.0)).await.unwrap();
        assert!(!test.ctx.session.view().force_buy);

        // Force sell naming an unknown order is dropped
        test.ctx.session.request_force_sell(Some(999));
        test.ctx.session.state().fiat_funds = 0.0;
        on_ticker(&test.ctx, ticker(100.0)).await.unwrap();
        assert!(test.ctx.session.view().force_sell.is_none());
        assert_eq!(test.exchange.placed().len(), 1);
    }

    #[tokio::test]
    async fn test_ledger_failure_is_returned() {
        let test = create_test_context(params());
        test.ctx.session.state().fiat_funds = 1_000.0;
        ready_market(&test.ctx);
        test.ledger.set_fail_writes(true);

        let err = on_ticker(&test.ctx, ticker(100.0)).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
