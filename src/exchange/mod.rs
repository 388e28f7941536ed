//! Exchange collaborator: REST order lifecycle plus three realtime streams

pub mod binance;
pub mod mock;
pub mod signer;
pub mod stream;

pub use binance::BinanceClient;

use crate::models::{
    Balance, BookTicker, KlineEvent, Kline, LotSize, Order, OrderRequest, PriceChangeStats,
    UserDataEvent,
};
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

/// Realtime event source; ends (returns `None`) after its first error
pub type EventStream<T> = Pin<Box<dyn Stream<Item = Result<T, StreamError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("exchange API error {code}: {message}")]
    Api { code: i64, message: String },

    /// -1013 Filter failure: LOT_SIZE
    #[error("order rejected by LOT_SIZE filter")]
    LotSize,

    /// -1021 request timestamp outside the receive window
    #[error("request timestamp rejected (clock skew)")]
    ClockSkew,

    /// -2010 account has insufficient balance for requested action
    #[error("insufficient balance")]
    InsufficientBalance,

    /// -2011 / -2013, also returned when cancelling an order that already filled
    #[error("unknown order")]
    UnknownOrder,

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("failed to sign request: {0}")]
    Signing(String),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
}

impl ExchangeError {
    /// Parse a `{"code": -1000, "msg": "..."}` error body
    pub fn from_api_response(body: &str) -> Self {
        #[derive(serde::Deserialize)]
        struct ApiError {
            code: i64,
            msg: String,
        }

        match serde_json::from_str::<ApiError>(body) {
            Ok(err) => Self::classify(err.code, err.msg),
            Err(_) => Self::Parse(format!("unexpected error body: {}", body)),
        }
    }

    pub fn classify(code: i64, message: String) -> Self {
        match code {
            -1013 => Self::LotSize,
            -1021 => Self::ClockSkew,
            -2010 => Self::InsufficientBalance,
            -2011 | -2013 => Self::UnknownOrder,
            _ => Self::Api { code, message },
        }
    }

    /// Cancel failures that usually mean the order filled first
    ///
    /// The authoritative order status must still be fetched before acting.
    pub fn is_cancel_race(&self) -> bool {
        matches!(
            self,
            Self::UnknownOrder | Self::InsufficientBalance | Self::ClockSkew
        )
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamError {
    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("stream idle timeout")]
    Timeout,

    #[error("connection reset: {0}")]
    Reset(String),

    #[error("unexpected EOF")]
    UnexpectedEof,

    #[error("{0}")]
    Other(String),
}

/// What a stream task does about an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamAction {
    /// Reconnect the client, then restart all streams
    Reconnect,
    /// Benign, keep the other streams running
    Ignore,
    /// Restart all streams
    Restart,
}

impl StreamError {
    pub fn action(&self) -> StreamAction {
        match self {
            StreamError::Disconnected(_) | StreamError::Timeout | StreamError::Reset(_) => {
                StreamAction::Reconnect
            }
            StreamError::UnexpectedEof => StreamAction::Ignore,
            StreamError::Other(_) => StreamAction::Restart,
        }
    }
}

#[async_trait]
pub trait Exchange: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<Order, ExchangeError>;

    async fn get_order(&self, symbol: &str, order_id: i64) -> Result<Order, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<Order, ExchangeError>;

    /// Most recent 1m candles, oldest first
    async fn klines(&self, symbol: &str, limit: u16) -> Result<Vec<Kline>, ExchangeError>;

    async fn price_change_stats(&self, symbol: &str) -> Result<PriceChangeStats, ExchangeError>;

    async fn balances(&self) -> Result<Vec<Balance>, ExchangeError>;

    async fn lot_size(&self, symbol: &str) -> Result<LotSize, ExchangeError>;

    /// Re-sync the clock offset; returns round-trip latency in milliseconds
    async fn sync_time(&self) -> Result<i64, ExchangeError>;

    async fn keepalive_user_stream(&self) -> Result<(), ExchangeError>;

    /// Reset connection state after a transport failure
    async fn reconnect(&self) -> Result<(), ExchangeError>;

    async fn user_data_stream(&self) -> Result<EventStream<UserDataEvent>, ExchangeError>;

    async fn kline_stream(&self, symbol: &str) -> Result<EventStream<KlineEvent>, ExchangeError>;

    async fn book_ticker_stream(&self, symbol: &str)
        -> Result<EventStream<BookTicker>, ExchangeError>;
}

/// Free balance of `asset`, 0 when the account holds none
pub fn free_balance(balances: &[Balance], asset: &str) -> f64 {
    balances
        .iter()
        .find(|b| b.asset == asset)
        .map(|b| b.free)
        .unwrap_or(0.0)
}
