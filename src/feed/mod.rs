//! Realtime feed coordinator
//!
//! Each cycle opens the account, kline and ticker streams as three tasks
//! sharing one fresh cancellation token. Any task whose stream fails or
//! ends cancels the token; the others notice on their next wake-up and
//! exit. Once all three are joined the coordinator waits briefly and
//! starts a new cycle. Restarting all three together is the only recovery
//! path for stream failures.

pub mod handlers;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use futures_util::StreamExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::context::AppContext;
use crate::db::LedgerError;
use crate::exchange::{EventStream, ExchangeError, StreamAction, StreamError};

const RESTART_DELAY: Duration = Duration::from_secs(3);
const WINDOW_RECHECK: Duration = Duration::from_secs(300);
/// Candles loaded to warm indicators before the first close
const WARM_UP_CANDLES: u16 = 1000;

pub struct FeedCoordinator {
    ctx: Arc<AppContext>,
    restart_delay: Duration,
}

impl FeedCoordinator {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            restart_delay: RESTART_DELAY,
        }
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Run stream cycles until shutdown is requested
    pub async fn run(&self) {
        let shutdown = self.ctx.shutdown.clone();
        let mut cycles: u64 = 0;

        while !shutdown.is_cancelled() {
            if !self.wait_for_window().await {
                break;
            }

            if let Err(e) = self.prepare_cycle().await {
                self.ctx.fatal(&e);
                break;
            }

            cycles += 1;
            tracing::info!(cycle = cycles, thread_id = %self.ctx.session.thread_id, "📡 Starting realtime streams");
            self.run_cycle().await;

            self.ctx.params.reload();

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.restart_delay) => {}
            }
        }

        tracing::info!(cycles, "Feed coordinator stopped");
    }

    /// Sleep while outside the operating window; false if shutdown came first
    async fn wait_for_window(&self) -> bool {
        loop {
            let params = self.ctx.params.snapshot();
            if params.in_operating_window(Local::now().time()) {
                return true;
            }
            tracing::info!(
                start = %params.time_start,
                stop = %params.time_stop,
                "Outside operating window, sleeping"
            );
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(WINDOW_RECHECK) => {}
            }
            self.ctx.params.reload();
        }
    }

    /// Counts, session row and indicator warm-up before streams open
    pub async fn prepare_cycle(&self) -> Result<(), LedgerError> {
        let ctx = &self.ctx;
        handlers::refresh_counts(ctx).await?;

        if ctx.session.state().thread_count == 0 {
            let id = ctx.session.renew_thread_id_session();
            tracing::debug!(thread_id_session = %id, "Empty cycle, new session id");
        }

        let row = ctx.session.row();
        if !ctx.ledger.update_session(&row).await? {
            ctx.ledger.save_session(&row).await?;
        }

        if ctx.market.snapshot().high_24h == 0.0 {
            if let Err(e) = self.warm_up().await {
                tracing::warn!(error = %e, "Indicator warm-up failed");
            }
        }
        Ok(())
    }

    async fn warm_up(&self) -> Result<(), ExchangeError> {
        let ctx = &self.ctx;
        let symbol = &ctx.session.symbol;

        let klines = ctx.exchange.klines(symbol, WARM_UP_CANDLES).await?;
        let loaded = ctx.market.load_history(klines);
        let stats = ctx.exchange.price_change_stats(symbol).await?;
        ctx.market.recompute(Some(stats), Utc::now());

        tracing::info!(candles = loaded, high_24h = stats.high_price, "Indicators warmed up");
        Ok(())
    }

    /// Run the three streams until one of them fails or shutdown
    pub async fn run_cycle(&self) {
        let token = self.ctx.shutdown.child_token();
        let mut tasks = JoinSet::new();

        tasks.spawn(user_data_task(self.ctx.clone(), token.clone()));
        tasks.spawn(kline_task(self.ctx.clone(), token.clone()));
        tasks.spawn(ticker_task(self.ctx.clone(), token.clone()));

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Stream task panicked");
                token.cancel();
            }
        }
    }
}

async fn user_data_task(ctx: Arc<AppContext>, token: CancellationToken) {
    let stream = match ctx.exchange.user_data_stream().await {
        Ok(stream) => stream,
        Err(e) => return open_failed(&ctx, &token, "user data", e).await,
    };
    let ctx = &ctx;
    pump(ctx, &token, "user data", stream, |event| async move {
        if let Err(e) = handlers::on_user_data(ctx, event).await {
            ctx.fatal(&e);
        }
    })
    .await;
}

async fn kline_task(ctx: Arc<AppContext>, token: CancellationToken) {
    let stream = match ctx.exchange.kline_stream(&ctx.session.symbol).await {
        Ok(stream) => stream,
        Err(e) => return open_failed(&ctx, &token, "kline", e).await,
    };
    let ctx = &ctx;
    pump(ctx, &token, "kline", stream, |event| handlers::on_kline(ctx, event)).await;
}

async fn ticker_task(ctx: Arc<AppContext>, token: CancellationToken) {
    let stream = match ctx.exchange.book_ticker_stream(&ctx.session.symbol).await {
        Ok(stream) => stream,
        Err(e) => return open_failed(&ctx, &token, "ticker", e).await,
    };
    let ctx = &ctx;
    pump(ctx, &token, "ticker", stream, |event| async move {
        if let Err(e) = handlers::on_ticker(ctx, event).await {
            ctx.fatal(&e);
        }
    })
    .await;
}

/// Feed events to `handle` until the token is cancelled or the stream fails
///
/// The token is only checked between events, so a handler that is placing
/// an order always runs to completion.
async fn pump<T, H, Fut>(
    ctx: &AppContext,
    token: &CancellationToken,
    name: &'static str,
    mut stream: EventStream<T>,
    mut handle: H,
) where
    H: FnMut(T) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(event)) => handle(event).await,
            Some(Err(e)) => {
                stream_failed(ctx, token, name, e).await;
            }
            // A cycle never runs with fewer than all three streams
            None => {
                tracing::warn!(stream = name, "Stream closed");
                token.cancel();
                return;
            }
        }
    }
}

/// Classify a transport error and act on it
async fn stream_failed(
    ctx: &AppContext,
    token: &CancellationToken,
    name: &'static str,
    error: StreamError,
) -> StreamAction {
    let action = error.action();
    match action {
        StreamAction::Reconnect => {
            tracing::warn!(stream = name, error = %error, "Stream dropped, reconnecting");
            if let Err(e) = ctx.exchange.reconnect().await {
                tracing::warn!(error = %e, "Reconnect failed");
            }
            token.cancel();
        }
        StreamAction::Ignore => {
            tracing::debug!(stream = name, error = %error, "Ignoring stream error");
        }
        StreamAction::Restart => {
            tracing::warn!(stream = name, error = %error, "Stream error, restarting streams");
            token.cancel();
        }
    }
    action
}

async fn open_failed(ctx: &AppContext, token: &CancellationToken, name: &'static str, error: ExchangeError) {
    match error {
        ExchangeError::Stream(e) => {
            stream_failed(ctx, token, name, e).await;
        }
        other => {
            tracing::warn!(stream = name, error = %other, "Stream could not be opened");
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Overrides, ParamsHandle, StrategyParameters};
    use crate::context::fixtures::{create_test_context, create_test_context_with_handle};
    use crate::db::Ledger;
    use crate::models::{BookTicker, Kline, OrderSide, PriceChangeStats};

    fn ticker(price: f64) -> BookTicker {
        BookTicker {
            symbol: "BTCUSDT".to_string(),
            best_bid_price: price,
            best_ask_price: price,
        }
    }

    fn history() -> Vec<Kline> {
        (0..60)
            .map(|i| {
                let close = 100.0 - (i % 7) as f64;
                Kline {
                    open_time: i * 60_000,
                    open: close,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    volume: 10.0,
                    taker_buy_volume: 5.0,
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_failed_stream_restarts_all_three() {
        let test = create_test_context(StrategyParameters::default());
        test.exchange.push_kline_stream(vec![Err(StreamError::Reset("peer".to_string()))]);

        let feed = FeedCoordinator::new(test.ctx.clone());
        tokio::time::timeout(Duration::from_secs(5), feed.run_cycle())
            .await
            .expect("cycle should end once the kline stream fails");

        assert_eq!(test.exchange.reconnects(), 1);
        assert_eq!(test.exchange.streams_opened(), 3);
        assert!(!test.ctx.stop_requested());
    }

    #[tokio::test]
    async fn test_unknown_error_restarts_without_reconnect() {
        let test = create_test_context(StrategyParameters::default());
        test.exchange.push_user_stream(vec![Err(StreamError::Other("bad frame".to_string()))]);

        let feed = FeedCoordinator::new(test.ctx.clone());
        tokio::time::timeout(Duration::from_secs(5), feed.run_cycle())
            .await
            .unwrap();

        assert_eq!(test.exchange.reconnects(), 0);
    }

    #[tokio::test]
    async fn test_unexpected_eof_does_not_stop_cycle() {
        let test = create_test_context(StrategyParameters::default());
        test.exchange.push_ticker_stream(vec![Err(StreamError::UnexpectedEof)]);

        let feed = FeedCoordinator::new(test.ctx.clone());
        let still_running = tokio::time::timeout(Duration::from_millis(200), feed.run_cycle()).await;
        assert!(still_running.is_err());
    }

    #[tokio::test]
    async fn test_events_after_eof_are_still_handled() {
        let test = create_test_context(StrategyParameters::default());
        let token = CancellationToken::new();
        let stream: EventStream<BookTicker> = Box::pin(futures_util::stream::iter(vec![
            Err(StreamError::UnexpectedEof),
            Ok(ticker(100.0)),
        ]));

        let mut handled = 0;
        tokio::time::timeout(
            Duration::from_secs(2),
            pump(&test.ctx, &token, "ticker", stream, |_| {
                handled += 1;
                async {}
            }),
        )
        .await
        .unwrap();

        assert_eq!(handled, 1);
        assert_eq!(test.exchange.reconnects(), 0);
        // The stream ended, so the whole cycle restarts
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_stream_closing_after_eof_restarts_cycle() {
        let test = create_test_context(StrategyParameters::default());
        test.exchange.push_closing_ticker_stream(vec![Err(StreamError::UnexpectedEof)]);

        let feed = FeedCoordinator::new(test.ctx.clone());
        tokio::time::timeout(Duration::from_secs(5), feed.run_cycle())
            .await
            .expect("cycle should end once the ticker stream closes");

        assert_eq!(test.exchange.streams_opened(), 3);
        assert!(!test.ctx.stop_requested());
    }

    #[tokio::test]
    async fn test_shutdown_ends_cycle() {
        let test = create_test_context(StrategyParameters::default());
        let feed = FeedCoordinator::new(test.ctx.clone());

        let ctx = test.ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctx.request_stop("test");
        });
        tokio::time::timeout(Duration::from_secs(5), feed.run())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_strategy_file_edit_between_cycles_keeps_overrides() {
        let file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        std::fs::write(file.path(), "symbol: BTCUSDT\nsymbol_fiat: USDT\ndry_run: false\nprofit_min: 0.02\n").unwrap();
        let params = StrategyParameters::load(file.path()).unwrap();
        let handle = ParamsHandle::new(params, Some(file.path().to_path_buf())).with_overrides(Overrides {
            dry_run: true,
            test_net: true,
            symbol: Some("ETHUSDT".to_string()),
            ..Default::default()
        });
        let test = create_test_context_with_handle(handle);
        for _ in 0..50 {
            test.exchange.push_closing_ticker_stream(vec![]);
        }

        let feed = FeedCoordinator::new(test.ctx.clone()).with_restart_delay(Duration::from_millis(20));
        let edit = async {
            while test.exchange.streams_opened() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            std::fs::write(file.path(), "symbol: BTCUSDT\nsymbol_fiat: USDT\ndry_run: false\nprofit_min: 0.04\n")
                .unwrap();

            let reloaded = tokio::time::timeout(Duration::from_secs(5), async {
                while test.ctx.params.snapshot().profit_min != 0.04 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await;
            test.ctx.request_stop("test");
            reloaded.is_ok()
        };

        let (_, reloaded) = tokio::time::timeout(Duration::from_secs(10), async { tokio::join!(feed.run(), edit) })
            .await
            .unwrap();
        assert!(reloaded);

        let params = test.ctx.params.snapshot();
        assert_eq!(params.profit_min, 0.04);
        assert!(params.dry_run);
        assert!(params.test_net);
        assert_eq!(params.symbol, "ETHUSDT");
    }

    #[tokio::test]
    async fn test_prepare_cycle_saves_session_and_warms_up() {
        let test = create_test_context(StrategyParameters::default());
        test.exchange.set_history(
            history(),
            PriceChangeStats {
                high_price: 120.0,
                low_price: 80.0,
            },
        );
        let before = test.ctx.session.thread_id_session();

        let feed = FeedCoordinator::new(test.ctx.clone());
        tokio_test::assert_ok!(feed.prepare_cycle().await);

        assert_ne!(test.ctx.session.thread_id_session(), before);
        assert!(test.ledger.get_session("thread-1").await.unwrap().is_some());
        let snapshot = test.ctx.market.snapshot();
        assert_eq!(snapshot.high_24h, 120.0);
        assert!(snapshot.rsi14 > 0.0);
        assert_eq!(test.ctx.market.series_len(), 60);
    }

    #[tokio::test]
    async fn test_ticker_events_drive_trades() {
        let params = StrategyParameters {
            buy_wait: 0,
            ..Default::default()
        };
        let test = create_test_context(params);
        test.ctx.session.state().fiat_funds = 1_000.0;
        test.ctx.session.request_force_buy();
        test.exchange.push_ticker_stream(vec![
            Ok(ticker(100.0)),
            Err(StreamError::Timeout),
        ]);

        let feed = FeedCoordinator::new(test.ctx.clone());
        tokio::time::timeout(Duration::from_secs(5), feed.run_cycle())
            .await
            .unwrap();

        let placed = test.exchange.placed();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].side, OrderSide::Buy);
        assert_eq!(test.exchange.reconnects(), 1);
    }
}
