//! Fixed-interval background timers
//!
//! Each timer is its own task and never waits on another. Ticks that fall
//! behind are skipped rather than bunched up.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

use crate::context::AppContext;
use crate::execution::reconcile_pending;
use crate::feed::handlers::refresh_counts;
use crate::node::Role;
use crate::notify::TelegramBot;

const PARAMS_RELOAD: Duration = Duration::from_secs(10);
const HEARTBEAT: Duration = Duration::from_secs(60);
const RECONCILE: Duration = Duration::from_secs(180);
const LEASE_POLL: Duration = Duration::from_secs(60);
const KEEPALIVE: Duration = Duration::from_secs(60);
const TIME_SYNC: Duration = Duration::from_secs(300);
const SALE_COUNT: Duration = Duration::from_secs(180);

/// Ticker silence after which streams count as degraded
pub const TICKER_SILENCE_SECS: i64 = 30;
/// Kline silence after which streams count as degraded
pub const KLINE_SILENCE_SECS: i64 = 100;

pub struct Scheduler {
    ctx: Arc<AppContext>,
    notifier: Option<TelegramBot>,
}

impl Scheduler {
    pub fn new(ctx: Arc<AppContext>, notifier: Option<TelegramBot>) -> Self {
        Self { ctx, notifier }
    }

    /// Start every timer on `tasks`; they all end at shutdown
    pub fn spawn_all(self, tasks: &mut JoinSet<()>) {
        let reconcile_delay = Duration::from_secs(rand::thread_rng().gen_range(1..=RECONCILE.as_secs()));
        let ctx = self.ctx;

        tasks.spawn(every(ctx.clone(), "params reload", PARAMS_RELOAD, PARAMS_RELOAD, {
            let ctx = ctx.clone();
            move || {
                let ctx = ctx.clone();
                async move {
                    ctx.params.reload();
                }
            }
        }));

        let notifier = self.notifier;
        tasks.spawn(every(ctx.clone(), "heartbeat", HEARTBEAT, HEARTBEAT, {
            let ctx = ctx.clone();
            move || {
                let ctx = ctx.clone();
                let notifier = notifier.clone();
                async move { heartbeat(&ctx, notifier.as_ref(), Utc::now()).await }
            }
        }));

        tasks.spawn(every(ctx.clone(), "reconcile", reconcile_delay, RECONCILE, {
            let ctx = ctx.clone();
            move || {
                let ctx = ctx.clone();
                async move { reconcile(&ctx).await }
            }
        }));

        tasks.spawn(every(ctx.clone(), "lease poll", Duration::ZERO, LEASE_POLL, {
            let ctx = ctx.clone();
            move || {
                let ctx = ctx.clone();
                async move {
                    poll_lease(&ctx).await;
                }
            }
        }));

        tasks.spawn(every(ctx.clone(), "keepalive", KEEPALIVE, KEEPALIVE, {
            let ctx = ctx.clone();
            move || {
                let ctx = ctx.clone();
                async move { keepalive(&ctx).await }
            }
        }));

        tasks.spawn(every(ctx.clone(), "time sync", TIME_SYNC, TIME_SYNC, {
            let ctx = ctx.clone();
            move || {
                let ctx = ctx.clone();
                async move { sync_time(&ctx).await }
            }
        }));

        tasks.spawn(every(ctx.clone(), "sale count", SALE_COUNT, SALE_COUNT, {
            let ctx = ctx.clone();
            move || {
                let ctx = ctx.clone();
                async move {
                    if let Err(e) = refresh_counts(&ctx).await {
                        tracing::warn!(error = %e, "Sale count refresh failed");
                    }
                }
            }
        }));
    }
}

/// Run `tick` every `period` after `delay`, until shutdown
async fn every<F, Fut>(ctx: Arc<AppContext>, name: &'static str, delay: Duration, period: Duration, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut timer = interval_at(Instant::now() + delay, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::debug!(timer = name, period_secs = period.as_secs(), "⏰ Timer started");

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = timer.tick() => tick().await,
        }
    }
    tracing::debug!(timer = name, "Timer stopped");
}

/// Whether both market streams have been heard from recently
///
/// A stream that has not delivered anything yet is not judged.
pub fn streams_healthy(ctx: &AppContext, now: DateTime<Utc>) -> bool {
    let silent = |last: Option<DateTime<Utc>>, limit: i64| {
        last.map(|at| (now - at).num_seconds() > limit).unwrap_or(false)
    };
    !silent(ctx.market.last_ticker_at(), TICKER_SILENCE_SECS)
        && !silent(ctx.market.last_kline_at(), KLINE_SILENCE_SECS)
}

/// Persist the session row with the current stream status; alert when degraded
pub async fn heartbeat(ctx: &AppContext, notifier: Option<&TelegramBot>, now: DateTime<Utc>) {
    let healthy = streams_healthy(ctx, now);
    ctx.session.state().status_ok = healthy;

    if let Err(e) = ctx.ledger.update_session(&ctx.session.row()).await {
        tracing::warn!(error = %e, "Session heartbeat not saved");
    }

    if healthy {
        return;
    }
    tracing::warn!(thread_id = %ctx.session.thread_id, "💔 Market streams silent");

    if !ctx.session.is_master() {
        return;
    }
    if let Some(bot) = notifier {
        let text = format!("{}: market streams silent", ctx.session.thread_id);
        if let Err(e) = bot.send_message(&text).await {
            tracing::warn!("Fault alert not sent: {}", e);
        }
    }
}

pub async fn reconcile(ctx: &AppContext) {
    match reconcile_pending(ctx.exchange.as_ref(), ctx.ledger.as_ref(), &ctx.session.thread_id).await {
        Ok(_) => {}
        Err(e) if e.is_fatal() => ctx.fatal(&e),
        Err(e) => tracing::warn!(error = %e, "Reconciliation failed"),
    }
}

/// Run one election step and mirror the role into the session
pub async fn poll_lease(ctx: &AppContext) -> Role {
    let was_master = ctx.session.is_master();
    let role = ctx.node.poll().await;
    let master = role == Role::Master;
    ctx.session.set_master(master);
    if master != was_master {
        tracing::info!(thread_id = %ctx.session.thread_id, role = %role, "👑 Node role changed");
    }
    role
}

pub async fn keepalive(ctx: &AppContext) {
    if let Err(e) = ctx.exchange.keepalive_user_stream().await {
        tracing::warn!(error = %e, "User stream keepalive failed");
    }
}

pub async fn sync_time(ctx: &AppContext) {
    match ctx.exchange.sync_time().await {
        Ok(latency_ms) => {
            ctx.session.state().latency_ms = latency_ms;
            tracing::debug!(latency_ms, "Exchange clock synced");
        }
        Err(e) => tracing::warn!(error = %e, "Time sync failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyParameters;
    use crate::context::fixtures::create_test_context;
    use crate::db::Ledger;
    use crate::models::{Kline, KlineEvent, OrderRecord, OrderRequest, OrderSide, OrderStatus, OrderType};
    use crate::node::{LeaseStore, MASTER_LEASE};

    fn kline_event() -> KlineEvent {
        KlineEvent {
            kline: Kline {
                open_time: 0,
                open: 100.0,
                high: 100.0,
                low: 100.0,
                close: 100.0,
                volume: 1.0,
                taker_buy_volume: 1.0,
            },
            is_final: false,
        }
    }

    #[tokio::test]
    async fn test_heartbeat_marks_silent_ticker() {
        let test = create_test_context(StrategyParameters::default());
        let now = Utc::now();
        test.ctx.market.set_price(100.0, now - chrono::Duration::seconds(45));
        test.ctx.market.apply_kline(&kline_event(), now);
        test.ledger.save_session(&test.ctx.session.row()).await.unwrap();

        heartbeat(&test.ctx, None, now).await;

        assert!(!test.ctx.session.state().status_ok);
        let row = test.ledger.get_session("thread-1").await.unwrap().unwrap();
        assert!(!row.status_ok);
    }

    #[tokio::test]
    async fn test_heartbeat_healthy_streams() {
        let test = create_test_context(StrategyParameters::default());
        let now = Utc::now();
        test.ctx.market.set_price(100.0, now - chrono::Duration::seconds(5));
        test.ctx.market.apply_kline(&kline_event(), now - chrono::Duration::seconds(90));

        heartbeat(&test.ctx, None, now).await;
        assert!(test.ctx.session.state().status_ok);
    }

    #[test]
    fn test_kline_silence_threshold() {
        let test = create_test_context(StrategyParameters::default());
        let now = Utc::now();
        test.ctx.market.set_price(100.0, now);
        test.ctx.market.apply_kline(&kline_event(), now - chrono::Duration::seconds(101));

        assert!(!streams_healthy(&test.ctx, now));
    }

    #[tokio::test]
    async fn test_lease_poll_sets_master_flag() {
        let test = create_test_context(StrategyParameters::default());

        assert_eq!(poll_lease(&test.ctx).await, Role::Master);
        assert!(test.ctx.session.is_master());
        assert!(test.leases.stat(MASTER_LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sync_time_records_latency() {
        let test = create_test_context(StrategyParameters::default());
        sync_time(&test.ctx).await;
        assert_eq!(test.ctx.session.state().latency_ms, 5);
    }

    #[tokio::test]
    async fn test_keepalive_calls_exchange() {
        let test = create_test_context(StrategyParameters::default());
        keepalive(&test.ctx).await;
        assert_eq!(test.exchange.keepalives(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_refreshes_pending_order() {
        let test = create_test_context(StrategyParameters::default());
        test.exchange.push_place_status(OrderStatus::New);
        test.exchange.push_poll_status(OrderStatus::Filled);
        let order = crate::exchange::Exchange::place_order(
            test.exchange.as_ref(),
            &OrderRequest {
                symbol: "BTCUSDT".to_string(),
                side: OrderSide::Sell,
                order_type: OrderType::Limit { price: 101.0 },
                quantity: 0.5,
            },
        )
        .await
        .unwrap();
        test.ledger
            .save_order(&OrderRecord {
                order: order.clone(),
                thread_id: "thread-1".to_string(),
                thread_id_session: "s1".to_string(),
                order_id_source: Some(1),
                recorded_price: 101.0,
            })
            .await
            .unwrap();

        reconcile(&test.ctx).await;

        assert!(test.ledger.pending_order("thread-1").await.unwrap().is_none());
        assert!(!test.ctx.stop_requested());
    }

    #[tokio::test]
    async fn test_timers_stop_on_shutdown() {
        let test = create_test_context(StrategyParameters::default());
        let mut tasks = JoinSet::new();
        Scheduler::new(test.ctx.clone(), None).spawn_all(&mut tasks);

        test.ctx.request_stop("test");
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok());
    }
}
