//! Buy/sell decision engine
//!
//! Evaluation is pure: it reads one parameter snapshot, one market
//! snapshot, a session view and the cycle's ledger state, and returns a
//! decision with a human-readable reason. It never mutates its inputs and
//! never fails; a malformed input is a rejection, not an error.

pub mod buy;
pub mod sell;

pub use buy::evaluate_buy;
pub use sell::evaluate_sell;

use crate::config::StrategyParameters;
use crate::db::LedgerState;
use crate::market::MarketSnapshot;
use crate::models::OpenPosition;
use crate::session::SessionView;
use chrono::{DateTime, Utc};
use std::fmt;

/// Minimum age of a position before the profit rule may sell it
pub const MIN_POSITION_AGE_SECS: i64 = 60;

/// Everything one evaluation reads
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext<'a> {
    pub params: &'a StrategyParameters,
    pub market: &'a MarketSnapshot,
    pub session: &'a SessionView,
    pub ledger: &'a LedgerState,
    pub now: DateTime<Utc>,
}

impl DecisionContext<'_> {
    /// Fiat available after the stash is set aside
    pub fn deployable_fiat(&self) -> f64 {
        self.session.fiat_funds - self.params.symbol_fiat_stash
    }

    /// Whether deployable fiat covers a DOWN buy
    pub fn funds_available(&self) -> bool {
        self.deployable_fiat() >= self.params.buy_quantity_fiat_down
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuyKind {
    Initial,
    Down,
    Up,
    Forced,
}

impl fmt::Display for BuyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BuyKind::Initial => "INIT",
            BuyKind::Down => "DOWN",
            BuyKind::Up => "UP",
            BuyKind::Forced => "FORCE",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuyAction {
    Buy { kind: BuyKind, fiat_amount: f64 },
    Skip,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuyDecision {
    pub action: BuyAction,
    pub reason: String,
}

impl BuyDecision {
    pub fn buy(kind: BuyKind, fiat_amount: f64, reason: impl Into<String>) -> Self {
        Self {
            action: BuyAction::Buy { kind, fiat_amount },
            reason: reason.into(),
        }
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            action: BuyAction::Skip,
            reason: reason.into(),
        }
    }

    pub fn should_buy(&self) -> bool {
        matches!(self.action, BuyAction::Buy { .. })
    }

    /// Fiat amount to spend, 0 when skipping
    pub fn fiat_amount(&self) -> f64 {
        match self.action {
            BuyAction::Buy { fiat_amount, .. } => fiat_amount,
            BuyAction::Skip => 0.0,
        }
    }

    pub fn kind(&self) -> Option<BuyKind> {
        match self.action {
            BuyAction::Buy { kind, .. } => Some(kind),
            BuyAction::Skip => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SellKind {
    Forced,
    ToCover,
    Stoploss,
    Profit,
}

impl fmt::Display for SellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SellKind::Forced => "FORCE",
            SellKind::ToCover => "COVER",
            SellKind::Stoploss => "STOPLOSS",
            SellKind::Profit => "PROFIT",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SellAction {
    Sell {
        position: OpenPosition,
        kind: SellKind,
    },
    Skip,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SellDecision {
    pub action: SellAction,
    pub reason: String,
}

impl SellDecision {
    pub fn sell(position: &OpenPosition, kind: SellKind, reason: impl Into<String>) -> Self {
        Self {
            action: SellAction::Sell {
                position: position.clone(),
                kind,
            },
            reason: reason.into(),
        }
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            action: SellAction::Skip,
            reason: reason.into(),
        }
    }

    pub fn should_sell(&self) -> bool {
        matches!(self.action, SellAction::Sell { .. })
    }

    pub fn position(&self) -> Option<&OpenPosition> {
        match &self.action {
            SellAction::Sell { position, .. } => Some(position),
            SellAction::Skip => None,
        }
    }

    pub fn kind(&self) -> Option<SellKind> {
        match self.action {
            SellAction::Sell { kind, .. } => Some(kind),
            SellAction::Skip => None,
        }
    }

    /// Forced sells go out as market orders
    pub fn is_forced(&self) -> bool {
        self.kind() == Some(SellKind::Forced)
    }
}

/// Scale applied to the profit target from trailing-hour sell count
pub fn profit_multiplier(sells_last_hour: usize) -> f64 {
    match sells_last_hour {
        0..=2 => 1.0,
        3 => 2.0,
        _ => 2.5,
    }
}

/// Seconds elapsed since `at`, or `None` if it never happened
pub(crate) fn seconds_since(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<i64> {
    at.map(|at| (now - at).num_seconds())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profit_multiplier_steps() {
        assert_eq!(profit_multiplier(0), 1.0);
        assert_eq!(profit_multiplier(1), 1.0);
        assert_eq!(profit_multiplier(2), 1.0);
        assert_eq!(profit_multiplier(3), 2.0);
        assert_eq!(profit_multiplier(4), 2.5);
        assert_eq!(profit_multiplier(5), 2.5);
        assert_eq!(profit_multiplier(100), 2.5);
    }

    #[test]
    fn test_decision_accessors() {
        let buy = BuyDecision::buy(BuyKind::Up, 15.0, "up");
        assert!(buy.should_buy());
        assert_eq!(buy.fiat_amount(), 15.0);
        assert_eq!(buy.kind(), Some(BuyKind::Up));

        let skip = BuyDecision::skip("nope");
        assert!(!skip.should_buy());
        assert_eq!(skip.fiat_amount(), 0.0);

        let position = fixtures::position(1, 100.0, 120);
        let sell = SellDecision::sell(&position, SellKind::Forced, "forced");
        assert!(sell.is_forced());
        assert_eq!(sell.position().map(|p| p.order_id), Some(1));
    }

    #[test]
    fn test_funds_available_respects_stash() {
        let params = StrategyParameters {
            symbol_fiat_stash: 95.0,
            buy_quantity_fiat_down: 10.0,
            ..fixtures::params()
        };
        let market = fixtures::market(100.0);
        let mut session = fixtures::session();
        session.fiat_funds = 100.0;
        let ledger = fixtures::ledger(vec![]);

        let ctx = DecisionContext {
            params: &params,
            market: &market,
            session: &session,
            ledger: &ledger,
            now: fixtures::now(),
        };
        assert_eq!(ctx.deployable_fiat(), 5.0);
        assert!(!ctx.funds_available());
    }
}
