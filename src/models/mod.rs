use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(OrderSide::Buy),
            "SELL" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange order status
///
/// Anything the exchange reports that we don't drive (EXPIRED, REJECTED, ...)
/// is folded into `Canceled`: the order will never fill further.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "NEW" | "PENDING_NEW" => OrderStatus::New,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            _ => OrderStatus::Canceled,
        }
    }

    /// True once the order has executed (fully or partly)
    pub fn has_fill(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::PartiallyFilled)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderType {
    Market,
    Limit { price: f64 },
}

/// Request to place an order on the exchange
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Base-asset quantity, already normalized to the lot-size grid
    pub quantity: f64,
}

/// One exchange order as reported by the exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub client_order_id: String,
    pub order_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub price: f64,
    pub requested_quantity: f64,
    pub executed_quantity: f64,
    pub cumulative_quote_quantity: f64,
    /// Milliseconds since epoch
    pub transact_time: i64,
}

impl Order {
    /// Average fill price, 0 when nothing executed
    pub fn average_price(&self) -> f64 {
        average_price(self.cumulative_quote_quantity, self.executed_quantity)
    }

    pub fn transacted_at(&self) -> DateTime<Utc> {
        millis_to_datetime(self.transact_time)
    }
}

pub fn average_price(cumulative_quote_quantity: f64, executed_quantity: f64) -> f64 {
    if executed_quantity == 0.0 {
        return 0.0;
    }
    let price = cumulative_quote_quantity / executed_quantity;
    if price.is_finite() {
        price
    } else {
        0.0
    }
}

pub fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Order as stored in the ledger, with the thread it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRecord {
    pub order: Order,
    pub thread_id: String,
    pub thread_id_session: String,
    /// For SELL orders: the BUY order this sale closes
    pub order_id_source: Option<i64>,
    /// Price recorded for the trade (average fill for BUY, quote price for SELL)
    pub recorded_price: f64,
}

/// One unsold BUY lot in a cycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenPosition {
    pub order_id: i64,
    pub thread_id: String,
    pub price: f64,
    pub executed_quantity: f64,
    pub cumulative_quote_quantity: f64,
    /// Milliseconds since epoch
    pub transact_time: i64,
}

impl OpenPosition {
    pub fn opened_at(&self) -> DateTime<Utc> {
        millis_to_datetime(self.transact_time)
    }
}

/// OHLCV candle from the exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Kline {
    /// Milliseconds since epoch
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Taker buy base-asset volume
    pub taker_buy_volume: f64,
}

/// Candle update pushed by the kline stream
#[derive(Debug, Clone, PartialEq)]
pub struct KlineEvent {
    pub kline: Kline,
    pub is_final: bool,
}

/// Top-of-book update
#[derive(Debug, Clone, PartialEq)]
pub struct BookTicker {
    pub symbol: String,
    pub best_bid_price: f64,
    pub best_ask_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Balance {
    pub asset: String,
    pub free: f64,
    pub locked: f64,
}

/// Event pushed by the account stream
#[derive(Debug, Clone, PartialEq)]
pub enum UserDataEvent {
    AccountPosition { balances: Vec<Balance> },
    ExecutionReport { order_id: i64, status: OrderStatus },
    Other,
}

/// Symbol quantity constraints
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LotSize {
    pub min_quantity: f64,
    pub max_quantity: f64,
    pub step_size: f64,
}

impl Default for LotSize {
    fn default() -> Self {
        Self {
            min_quantity: 0.0,
            max_quantity: f64::MAX,
            step_size: 0.0,
        }
    }
}

/// 24h rolling window high/low
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PriceChangeStats {
    pub high_price: f64,
    pub low_price: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(cum: f64, executed: f64) -> Order {
        Order {
            client_order_id: "c1".to_string(),
            order_id: 1,
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            status: OrderStatus::Filled,
            price: 0.0,
            requested_quantity: executed,
            executed_quantity: executed,
            cumulative_quote_quantity: cum,
            transact_time: 0,
        }
    }

    #[test]
    fn test_average_price() {
        assert_eq!(order(200.0, 2.0).average_price(), 100.0);
    }

    #[test]
    fn test_average_price_zero_quantity() {
        assert_eq!(order(0.0, 0.0).average_price(), 0.0);
        assert_eq!(order(10.0, 0.0).average_price(), 0.0);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(OrderStatus::parse("NEW"), OrderStatus::New);
        assert_eq!(
            OrderStatus::parse("PARTIALLY_FILLED"),
            OrderStatus::PartiallyFilled
        );
        assert_eq!(OrderStatus::parse("FILLED"), OrderStatus::Filled);
        assert_eq!(OrderStatus::parse("EXPIRED"), OrderStatus::Canceled);
    }

    #[test]
    fn test_side_round_trip_strings() {
        assert_eq!(OrderSide::parse("BUY"), Some(OrderSide::Buy));
        assert_eq!(OrderSide::Sell.as_str(), "SELL");
        assert_eq!(OrderSide::parse("HOLD"), None);
    }
}
