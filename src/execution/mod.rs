pub mod executor;
pub mod quantity;
pub mod reconcile;

pub use executor::{
    realized_profit, BuyOutcome, ExecutionError, OrderExecutor, SellOutcome,
    SELL_CANCEL_AFTER_POLLS,
};
pub use quantity::{normalize_quantity, order_quantity};
pub use reconcile::reconcile_pending;
