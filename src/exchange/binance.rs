use super::signer::RequestSigner;
use super::stream::{self, parse_book_ticker, parse_kline, parse_user_data};
use super::{EventStream, Exchange, ExchangeError};
use crate::models::{
    Balance, BookTicker, Kline, KlineEvent, LotSize, Order, OrderRequest, OrderSide,
    OrderStatus, OrderType, PriceChangeStats, UserDataEvent,
};
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const BINANCE_API_BASE: &str = "https://api.binance.com";
const BINANCE_WS_BASE: &str = "wss://stream.binance.com:9443/ws";
const TESTNET_API_BASE: &str = "https://testnet.binance.vision";
const TESTNET_WS_BASE: &str = "wss://testnet.binance.vision/ws";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RECV_WINDOW_MS: u64 = 5_000;

const REQUESTS_PER_SECOND: NonZeroU32 = match NonZeroU32::new(10) {
    Some(n) => n,
    None => NonZeroU32::MIN,
};

/// Idle limits per stream; the ticker and kline streams push every second
const MARKET_STREAM_IDLE: Duration = Duration::from_secs(60);
const USER_STREAM_IDLE: Duration = Duration::from_secs(3_600);

/// Client for the Binance spot REST API and websocket streams
pub struct BinanceClient {
    client: Client,
    api_base: String,
    ws_base: String,
    api_key: String,
    signer: RequestSigner,
    limiter: DefaultDirectRateLimiter,
    /// local clock minus server clock
    time_offset_ms: AtomicI64,
    listen_key: Mutex<Option<String>>,
}

// ============== Response Types ==============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    symbol: String,
    order_id: i64,
    client_order_id: String,
    #[serde(default)]
    price: String,
    #[serde(default)]
    orig_qty: String,
    executed_qty: String,
    cummulative_quote_qty: String,
    status: String,
    side: String,
    transact_time: Option<i64>,
    update_time: Option<i64>,
    time: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerResponse {
    high_price: String,
    low_price: String,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<BalanceResponse>,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    asset: String,
    free: String,
    locked: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoResponse {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    filters: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LotSizeFilter {
    min_qty: String,
    max_qty: String,
    step_size: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTimeResponse {
    server_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenKeyResponse {
    listen_key: String,
}

fn num(value: &str, field: &str) -> Result<f64, ExchangeError> {
    if value.is_empty() {
        return Ok(0.0);
    }
    value
        .parse()
        .map_err(|_| ExchangeError::Parse(format!("{} = {:?}", field, value)))
}

impl TryFrom<OrderResponse> for Order {
    type Error = ExchangeError;

    fn try_from(raw: OrderResponse) -> Result<Self, Self::Error> {
        let side = OrderSide::parse(&raw.side)
            .ok_or_else(|| ExchangeError::Parse(format!("side = {:?}", raw.side)))?;

        Ok(Order {
            price: num(&raw.price, "price")?,
            requested_quantity: num(&raw.orig_qty, "origQty")?,
            executed_quantity: num(&raw.executed_qty, "executedQty")?,
            cumulative_quote_quantity: num(&raw.cummulative_quote_qty, "cummulativeQuoteQty")?,
            status: OrderStatus::parse(&raw.status),
            side,
            client_order_id: raw.client_order_id,
            order_id: raw.order_id,
            symbol: raw.symbol,
            transact_time: raw
                .transact_time
                .or(raw.update_time)
                .or(raw.time)
                .unwrap_or(0),
        })
    }
}

/// Format a quantity or price without exponent or trailing zeros
fn format_decimal(value: f64) -> String {
    let formatted = format!("{:.8}", value);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

fn parse_kline_row(row: &serde_json::Value) -> Option<Kline> {
    let fields = row.as_array()?;
    let field = |i: usize| fields.get(i)?.as_str()?.parse::<f64>().ok();

    Some(Kline {
        open_time: fields.first()?.as_i64()?,
        open: field(1)?,
        high: field(2)?,
        low: field(3)?,
        close: field(4)?,
        volume: field(5)?,
        taker_buy_volume: field(9)?,
    })
}

// ============== Implementation ==============

impl BinanceClient {
    pub fn new(api_key: &str, secret_key: &str, testnet: bool) -> Result<Self, ExchangeError> {
        let (api_base, ws_base) = if testnet {
            (TESTNET_API_BASE, TESTNET_WS_BASE)
        } else {
            (BINANCE_API_BASE, BINANCE_WS_BASE)
        };
        Self::with_base_urls(api_base, ws_base, api_key, secret_key)
    }

    pub fn with_base_urls(
        api_base: &str,
        ws_base: &str,
        api_key: &str,
        secret_key: &str,
    ) -> Result<Self, ExchangeError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            ws_base: ws_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            signer: RequestSigner::new(secret_key),
            limiter: RateLimiter::direct(Quota::per_second(REQUESTS_PER_SECOND)),
            time_offset_ms: AtomicI64::new(0),
            listen_key: Mutex::new(None),
        })
    }

    fn server_timestamp_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() - self.time_offset_ms.load(Ordering::Relaxed)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: Option<String>,
        with_key: bool,
    ) -> Result<T, ExchangeError> {
        self.limiter.until_ready().await;

        let url = match query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", self.api_base, path, q),
            _ => format!("{}{}", self.api_base, path),
        };

        let mut request = self.client.request(method, &url);
        if with_key {
            request = request.header("X-MBX-APIKEY", &self.api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let err = ExchangeError::from_api_response(&body);
            tracing::debug!(path = %path, status = %status, error = %err, "Exchange request failed");
            return Err(err);
        }

        serde_json::from_str(&body).map_err(|e| ExchangeError::Parse(format!("{}: {}", path, e)))
    }

    async fn public<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        self.send(Method::GET, path, Some(query), false).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let query = self
            .signer
            .signed_query(params, self.server_timestamp_ms(), RECV_WINDOW_MS)?;
        self.send(method, path, Some(query), true).await
    }

    async fn listen_key(&self) -> Result<String, ExchangeError> {
        let mut guard = self.listen_key.lock().await;
        if let Some(key) = guard.as_ref() {
            return Ok(key.clone());
        }

        let response: ListenKeyResponse = self
            .send(Method::POST, "/api/v3/userDataStream", None, true)
            .await?;
        tracing::info!("Created user data listen key");

        *guard = Some(response.listen_key.clone());
        Ok(response.listen_key)
    }

    fn stream_url(&self, stream: &str) -> String {
        format!("{}/{}", self.ws_base, stream)
    }
}

#[async_trait]
impl Exchange for BinanceClient {
    async fn place_order(&self, request: &OrderRequest) -> Result<Order, ExchangeError> {
        let mut params = vec![
            ("symbol", request.symbol.clone()),
            ("side", request.side.as_str().to_string()),
        ];
        match request.order_type {
            OrderType::Market => params.push(("type", "MARKET".to_string())),
            OrderType::Limit { price } => {
                params.push(("type", "LIMIT".to_string()));
                params.push(("timeInForce", "GTC".to_string()));
                params.push(("price", format_decimal(price)));
            }
        }
        params.push(("quantity", format_decimal(request.quantity)));
        params.push(("newOrderRespType", "FULL".to_string()));

        let response: OrderResponse = self.signed(Method::POST, "/api/v3/order", &params).await?;
        let order = Order::try_from(response)?;

        tracing::debug!(
            order_id = order.order_id,
            side = %order.side,
            status = %order.status,
            "Order placed"
        );

        Ok(order)
    }

    async fn get_order(&self, symbol: &str, order_id: i64) -> Result<Order, ExchangeError> {
        let params = [("symbol", symbol.to_string()), ("orderId", order_id.to_string())];
        let response: OrderResponse = self.signed(Method::GET, "/api/v3/order", &params).await?;
        Order::try_from(response)
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<Order, ExchangeError> {
        let params = [("symbol", symbol.to_string()), ("orderId", order_id.to_string())];
        let response: OrderResponse = self
            .signed(Method::DELETE, "/api/v3/order", &params)
            .await?;
        Order::try_from(response)
    }

    async fn klines(&self, symbol: &str, limit: u16) -> Result<Vec<Kline>, ExchangeError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", "1m".to_string()),
            ("limit", limit.to_string()),
        ];
        let rows: Vec<serde_json::Value> = self.public("/api/v3/klines", &params).await?;

        rows.iter()
            .map(|row| {
                parse_kline_row(row)
                    .ok_or_else(|| ExchangeError::Parse(format!("kline row {}", row)))
            })
            .collect()
    }

    async fn price_change_stats(&self, symbol: &str) -> Result<PriceChangeStats, ExchangeError> {
        let params = [("symbol", symbol.to_string())];
        let ticker: TickerResponse = self.public("/api/v3/ticker/24hr", &params).await?;

        Ok(PriceChangeStats {
            high_price: num(&ticker.high_price, "highPrice")?,
            low_price: num(&ticker.low_price, "lowPrice")?,
        })
    }

    async fn balances(&self) -> Result<Vec<Balance>, ExchangeError> {
        let account: AccountResponse = self.signed(Method::GET, "/api/v3/account", &[]).await?;

        account
            .balances
            .into_iter()
            .map(|b| {
                Ok(Balance {
                    free: num(&b.free, "free")?,
                    locked: num(&b.locked, "locked")?,
                    asset: b.asset,
                })
            })
            .collect()
    }

    async fn lot_size(&self, symbol: &str) -> Result<LotSize, ExchangeError> {
        let params = [("symbol", symbol.to_string())];
        let info: ExchangeInfoResponse = self.public("/api/v3/exchangeInfo", &params).await?;

        let filter = info
            .symbols
            .into_iter()
            .next()
            .and_then(|s| {
                s.filters
                    .into_iter()
                    .find(|f| f.get("filterType").and_then(|t| t.as_str()) == Some("LOT_SIZE"))
            })
            .ok_or_else(|| ExchangeError::Parse(format!("no LOT_SIZE filter for {}", symbol)))?;

        let filter: LotSizeFilter = serde_json::from_value(filter)
            .map_err(|e| ExchangeError::Parse(format!("LOT_SIZE filter: {}", e)))?;

        Ok(LotSize {
            min_quantity: num(&filter.min_qty, "minQty")?,
            max_quantity: num(&filter.max_qty, "maxQty")?,
            step_size: num(&filter.step_size, "stepSize")?,
        })
    }

    async fn sync_time(&self) -> Result<i64, ExchangeError> {
        let before = Instant::now();
        let response: ServerTimeResponse = self.public("/api/v3/time", &[]).await?;
        let rtt = before.elapsed().as_millis() as i64;

        let local = chrono::Utc::now().timestamp_millis();
        let offset = local - (response.server_time + rtt / 2);
        self.time_offset_ms.store(offset, Ordering::Relaxed);

        tracing::debug!(offset_ms = offset, rtt_ms = rtt, "Time synchronized with exchange");

        Ok(rtt)
    }

    async fn keepalive_user_stream(&self) -> Result<(), ExchangeError> {
        let key = self.listen_key.lock().await.clone();
        let Some(key) = key else {
            return Ok(());
        };

        let _: serde_json::Value = self
            .send(
                Method::PUT,
                "/api/v3/userDataStream",
                Some(format!("listenKey={}", key)),
                true,
            )
            .await?;

        tracing::debug!("Listen key refreshed");
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), ExchangeError> {
        // A fresh listen key is created on the next user stream connect
        self.listen_key.lock().await.take();
        self.sync_time().await?;
        tracing::info!("Exchange client reconnected");
        Ok(())
    }

    async fn user_data_stream(&self) -> Result<EventStream<UserDataEvent>, ExchangeError> {
        let key = self.listen_key().await?;
        let ws = stream::connect(&self.stream_url(&key)).await?;
        Ok(stream::event_stream(ws, USER_STREAM_IDLE, parse_user_data))
    }

    async fn kline_stream(&self, symbol: &str) -> Result<EventStream<KlineEvent>, ExchangeError> {
        let url = self.stream_url(&format!("{}@kline_1m", symbol.to_lowercase()));
        let ws = stream::connect(&url).await?;
        Ok(stream::event_stream(ws, MARKET_STREAM_IDLE, parse_kline))
    }

    async fn book_ticker_stream(
        &self,
        symbol: &str,
    ) -> Result<EventStream<BookTicker>, ExchangeError> {
        let url = self.stream_url(&format!("{}@bookTicker", symbol.to_lowercase()));
        let ws = stream::connect(&url).await?;
        Ok(stream::event_stream(ws, MARKET_STREAM_IDLE, parse_book_ticker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn create_test_client(server: &mockito::ServerGuard) -> BinanceClient {
        BinanceClient::with_base_urls(&server.url(), "ws://127.0.0.1:1/ws", "key", "secret").unwrap()
    }

    #[test]
    fn test_format_decimal() {
        assert_eq!(format_decimal(0.00120000), "0.0012");
        assert_eq!(format_decimal(25.0), "25");
        assert_eq!(format_decimal(0.0), "0");
        assert_eq!(format_decimal(101.11), "101.11");
    }

    #[tokio::test]
    async fn test_place_market_order() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v3/order")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
                Matcher::UrlEncoded("side".into(), "BUY".into()),
                Matcher::UrlEncoded("type".into(), "MARKET".into()),
                Matcher::UrlEncoded("quantity".into(), "0.001".into()),
                Matcher::Regex("signature=[0-9a-f]{64}".into()),
            ]))
            .match_header("X-MBX-APIKEY", "key")
            .with_body(
                r#"{"symbol":"BTCUSDT","orderId":28,"clientOrderId":"abc","transactTime":1507725176595,
                    "price":"0.00000000","origQty":"0.00100000","executedQty":"0.00100000",
                    "cummulativeQuoteQty":"20.00000000","status":"FILLED","side":"BUY"}"#,
            )
            .create_async()
            .await;

        let client = create_test_client(&server);
        let order = client
            .place_order(&OrderRequest {
                symbol: "BTCUSDT".to_string(),
                side: OrderSide::Buy,
                order_type: OrderType::Market,
                quantity: 0.001,
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(order.order_id, 28);
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.average_price(), 20_000.0);
        assert_eq!(order.transact_time, 1507725176595);
    }

    #[tokio::test]
    async fn test_cancel_error_is_classified() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/api/v3/order")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"code":-2011,"msg":"Unknown order sent."}"#)
            .create_async()
            .await;

        let client = create_test_client(&server);
        let err = client.cancel_order("BTCUSDT", 1).await.unwrap_err();
        assert!(matches!(err, ExchangeError::UnknownOrder));
        assert!(err.is_cancel_race());
    }

    #[tokio::test]
    async fn test_klines() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v3/klines")
            .match_query(Matcher::UrlEncoded("interval".into(), "1m".into()))
            .with_body(
                r#"[[1499040000000,"0.01634790","0.80000000","0.01575800","0.01577100","148976.11427815",
                     1499644799999,"2434.19055334",308,"1756.87402397","28.46694368","0"]]"#,
            )
            .create_async()
            .await;

        let client = create_test_client(&server);
        let klines = client.klines("BTCUSDT", 500).await.unwrap();
        assert_eq!(klines.len(), 1);
        assert_eq!(klines[0].open_time, 1499040000000);
        assert_eq!(klines[0].close, 0.015771);
        assert_eq!(klines[0].taker_buy_volume, 1756.87402397);
    }

    #[tokio::test]
    async fn test_lot_size() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v3/exchangeInfo")
            .match_query(Matcher::Any)
            .with_body(
                r#"{"symbols":[{"symbol":"BTCUSDT","filters":[
                    {"filterType":"PRICE_FILTER","minPrice":"0.01","maxPrice":"1000000","tickSize":"0.01"},
                    {"filterType":"LOT_SIZE","minQty":"0.00001000","maxQty":"9000.00000000","stepSize":"0.00001000"}
                ]}]}"#,
            )
            .create_async()
            .await;

        let client = create_test_client(&server);
        let lot = client.lot_size("BTCUSDT").await.unwrap();
        assert_eq!(lot.min_quantity, 0.00001);
        assert_eq!(lot.step_size, 0.00001);
        assert_eq!(lot.max_quantity, 9000.0);
    }

    #[tokio::test]
    async fn test_price_change_stats_and_balances() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v3/ticker/24hr")
            .match_query(Matcher::Any)
            .with_body(r#"{"symbol":"BTCUSDT","highPrice":"105.5","lowPrice":"95.25"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/api/v3/account")
            .match_query(Matcher::Any)
            .with_body(r#"{"balances":[{"asset":"USDT","free":"250.0","locked":"0.0"}]}"#)
            .create_async()
            .await;

        let client = create_test_client(&server);
        let stats = client.price_change_stats("BTCUSDT").await.unwrap();
        assert_eq!(stats.high_price, 105.5);
        assert_eq!(stats.low_price, 95.25);

        let balances = client.balances().await.unwrap();
        assert_eq!(crate::exchange::free_balance(&balances, "USDT"), 250.0);
    }
}
