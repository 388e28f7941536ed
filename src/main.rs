use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use cryptopump::config::{AppConfig, LeaseBackend, Overrides, ParamsHandle, StrategyParameters};
use cryptopump::db::{Ledger, MemoryLedger, PostgresLedger};
use cryptopump::exchange::{free_balance, BinanceClient, Exchange};
use cryptopump::feed::FeedCoordinator;
use cryptopump::node::{CycleLock, FileLease, LeaseStore, NodeCoordinator};
use cryptopump::notify::TelegramBot;
use cryptopump::persistence::RedisLeaseStore;
use cryptopump::scheduler::Scheduler;
use cryptopump::session::Session;
use cryptopump::AppContext;

#[derive(Debug, Parser)]
#[command(name = "cryptopump", about = "Autonomous spot trading agent")]
struct Args {
    /// Application settings file
    #[arg(long, default_value = "config/app.yml")]
    config: PathBuf,

    /// Strategy parameters file (overrides the one named in the settings)
    #[arg(long)]
    strategy: Option<PathBuf>,

    /// Start a fresh cycle instead of resuming one
    #[arg(long)]
    new_session: bool,

    /// Log decisions without placing orders
    #[arg(long)]
    dry_run: bool,

    /// Trade on the exchange testnet
    #[arg(long)]
    testnet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let app = AppConfig::load(&args.config).context("loading application settings")?;
    setup_logging(&app.log_filter);

    tracing::info!("🚀 cryptopump starting");

    let strategy_path = args.strategy.clone().unwrap_or_else(|| app.strategy_path.clone());
    let mut params = StrategyParameters::load(&strategy_path)
        .with_context(|| format!("loading strategy parameters from {}", strategy_path.display()))?;
    let mut overrides = Overrides {
        dry_run: args.dry_run,
        test_net: args.testnet,
        new_session: args.new_session,
        symbol: None,
    };
    overrides.apply(&mut params);

    let (api_key, secret_key) = app.credentials(params.test_net);
    let exchange: Arc<dyn Exchange> = Arc::new(
        BinanceClient::new(api_key, secret_key, params.test_net).context("creating exchange client")?,
    );

    let ledger = connect_ledger(&app).await?;
    let leases = connect_leases(&app).await?;

    let (thread_id, lock) = claim_cycle(ledger.as_ref(), leases.clone(), params.new_session).await?;
    if let Some(symbol) = ledger.thread_symbol(&thread_id).await? {
        if symbol != params.symbol {
            tracing::info!(configured = %params.symbol, resumed = %symbol, "Resumed cycle trades a different symbol");
            params.symbol = symbol.clone();
        }
        overrides.symbol = Some(symbol);
    }

    tracing::info!("📊 Configuration:");
    tracing::info!("  Thread: {}", thread_id);
    tracing::info!("  Symbol: {}", params.symbol);
    tracing::info!("  Testnet: {}", params.test_net);
    tracing::info!("  Dry run: {}", params.dry_run);

    let session = Session::new(&thread_id, &app.exchange_name, &params.symbol, &params.symbol_fiat);
    load_account(exchange.as_ref(), &session, &params).await;

    let node = NodeCoordinator::new(leases.clone(), params.test_net);
    let ctx = Arc::new(
        AppContext::new(
            session,
            ParamsHandle::new(params, Some(strategy_path)).with_overrides(overrides),
            exchange,
            ledger,
            node,
        )
        .with_cycle_lock(lock),
    );

    let notifier = match (&app.telegram_token, app.telegram_chat_id) {
        (Some(token), Some(chat_id)) => Some(TelegramBot::new(token, chat_id)),
        _ => {
            tracing::info!("Telegram not configured, notifications disabled");
            None
        }
    };

    tracing::info!("🔄 Spawning background timers...");
    let mut background = JoinSet::new();
    Scheduler::new(ctx.clone(), notifier.clone()).spawn_all(&mut background);
    if let Some(bot) = notifier {
        background.spawn(bot.run(ctx.clone()));
    }

    // The feed is never dropped mid-order; Ctrl-C only requests the stop
    background.spawn({
        let ctx = ctx.clone();
        async move {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => {}
                signal = tokio::signal::ctrl_c() => match signal {
                    Ok(()) => {
                        tracing::info!("Ctrl-C received, stopping");
                        ctx.request_stop("ctrl-c");
                    }
                    Err(e) => tracing::warn!(error = %e, "Ctrl-C handler unavailable"),
                },
            }
        }
    });

    FeedCoordinator::new(ctx.clone()).run().await;

    let reason = ctx.finalize().await;
    while background.join_next().await.is_some() {}

    tracing::info!("👋 Stopped: {}", reason);
    Ok(())
}

fn setup_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect_ledger(app: &AppConfig) -> anyhow::Result<Arc<dyn Ledger>> {
    match &app.database_url {
        Some(url) => {
            let ledger = PostgresLedger::new(url).await.context("connecting to Postgres")?;
            tracing::info!("Postgres ledger enabled");
            Ok(Arc::new(ledger))
        }
        None => {
            tracing::warn!("No database_url set, trades are kept in memory and lost on exit");
            Ok(Arc::new(MemoryLedger::new()))
        }
    }
}

async fn connect_leases(app: &AppConfig) -> anyhow::Result<Arc<dyn LeaseStore>> {
    match (app.lease_backend, &app.redis_url) {
        (LeaseBackend::Redis, Some(url)) => {
            let store = RedisLeaseStore::new(url).await.context("connecting to Redis")?;
            tracing::info!("Redis lease store enabled");
            Ok(Arc::new(store))
        }
        _ => {
            tracing::info!(dir = %app.lock_dir.display(), "File lease store enabled");
            Ok(Arc::new(FileLease::new(app.lock_dir.clone())))
        }
    }
}

/// Resume the first unlocked cycle with open positions, or start a new one
async fn claim_cycle(
    ledger: &dyn Ledger,
    leases: Arc<dyn LeaseStore>,
    new_session: bool,
) -> anyhow::Result<(String, CycleLock)> {
    if !new_session {
        for thread_id in ledger.resumable_threads().await? {
            if let Some(lock) = CycleLock::acquire(leases.clone(), &thread_id).await? {
                tracing::info!(thread_id = %thread_id, "♻️ Resuming cycle");
                return Ok((thread_id, lock));
            }
            tracing::debug!(thread_id = %thread_id, "Cycle held by another instance");
        }
    }

    loop {
        let thread_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        if let Some(lock) = CycleLock::acquire(leases.clone(), &thread_id).await? {
            tracing::info!(thread_id = %thread_id, "Starting new cycle");
            return Ok((thread_id, lock));
        }
    }
}

/// Initial balances and lot size; failures leave zeros and are retried by the streams
async fn load_account(exchange: &dyn Exchange, session: &Session, params: &StrategyParameters) {
    match exchange.balances().await {
        Ok(balances) => {
            let mut state = session.state();
            state.fiat_funds = free_balance(&balances, &params.symbol_fiat);
            state.symbol_funds = free_balance(&balances, params.base_asset());
        }
        Err(e) => tracing::warn!(error = %e, "Initial balances unavailable"),
    }

    match exchange.lot_size(&params.symbol).await {
        Ok(lot_size) => session.set_lot_size(lot_size),
        Err(e) => tracing::warn!(error = %e, "Lot size unavailable"),
    }
}
