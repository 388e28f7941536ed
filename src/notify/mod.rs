//! Operator commands and outbound status messages
//!
//! Transport lives in [`telegram`]; this module only knows how to parse a
//! command and act on it against the running agent.

pub mod telegram;

pub use telegram::TelegramBot;

use crate::context::AppContext;
use crate::db::ProfitSummary;

/// A command sent by the operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Buy,
    /// Sell a specific position, or the most recent one
    Sell(Option<i64>),
    Report,
    Funds,
    Master,
    Stop,
}

impl Command {
    /// Parse `/cmd [arg]`; a `@botname` suffix on the command is accepted
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        let head = parts.next()?.strip_prefix('/')?;
        let name = head.split('@').next().unwrap_or(head);
        let arg = parts.next();

        match (name.to_ascii_lowercase().as_str(), arg) {
            ("buy", None) => Some(Command::Buy),
            ("sell", None) => Some(Command::Sell(None)),
            ("sell", Some(id)) => id.parse().ok().map(|id| Command::Sell(Some(id))),
            ("report", None) => Some(Command::Report),
            ("funds", None) => Some(Command::Funds),
            ("master", None) => Some(Command::Master),
            ("stop", None) => Some(Command::Stop),
            _ => None,
        }
    }
}

/// Apply a command and return the reply text
pub async fn execute_command(ctx: &AppContext, command: Command) -> String {
    tracing::info!(target: "audit", thread_id = %ctx.session.thread_id, command = ?command, "Operator command");

    match command {
        Command::Buy => {
            ctx.session.request_force_buy();
            "Force buy requested".to_string()
        }
        Command::Sell(None) => {
            ctx.session.request_force_sell(None);
            "Force sell requested for the most recent position".to_string()
        }
        Command::Sell(Some(order_id)) => {
            ctx.session.request_force_sell(Some(order_id));
            format!("Force sell requested for order {}", order_id)
        }
        Command::Report => match ctx.ledger.profit_summary(&ctx.session.thread_id).await {
            Ok(summary) => format_report(ctx, &summary),
            Err(e) => {
                tracing::warn!(error = %e, "Report unavailable");
                format!("Report unavailable: {}", e)
            }
        },
        Command::Funds => format_funds(ctx),
        Command::Master => format!(
            "{} is {}",
            ctx.session.thread_id,
            if ctx.session.is_master() { "MASTER" } else { "SLAVE" }
        ),
        Command::Stop => {
            ctx.request_stop("operator stop");
            "Stopping".to_string()
        }
    }
}

fn format_funds(ctx: &AppContext) -> String {
    let params = ctx.params.snapshot();
    let state = ctx.session.state();
    format!(
        "Funds: {:.2} {} / {:.8} {}",
        state.fiat_funds,
        params.symbol_fiat,
        state.symbol_funds,
        params.base_asset()
    )
}

pub fn format_report(ctx: &AppContext, summary: &ProfitSummary) -> String {
    let params = ctx.params.snapshot();
    let market = ctx.market.snapshot();
    let state = ctx.session.state();

    let mut lines = vec![
        format!("{} {} on {}", ctx.session.thread_id, params.symbol, ctx.session.exchange),
        format!("Price: {:.4}  RSI14: {:.1}", market.price, market.rsi14),
        format!("Funds: {:.2} {}", state.fiat_funds, params.symbol_fiat),
        format!("Profit: {:.2} total / {:.2} this cycle", summary.total_profit, summary.thread_profit),
        format!(
            "Open: {} positions, {:.2} {}",
            summary.open_positions, summary.open_amount, params.symbol_fiat
        ),
        format!("Sells last hour: {}", state.sell_count_60m),
    ];
    if !state.status_ok {
        lines.push("Status: streams degraded".to_string());
    }
    lines.join("\n")
}
