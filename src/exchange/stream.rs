//! Websocket plumbing and event parsers for the realtime streams

use super::{EventStream, StreamAction, StreamError};
use crate::models::{Balance, BookTicker, Kline, KlineEvent, OrderStatus, UserDataEvent};
use futures_util::StreamExt;
use serde::Deserialize;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

impl From<tungstenite::Error> for StreamError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                StreamError::Disconnected(err.to_string())
            }
            tungstenite::Error::Io(io) => match io.kind() {
                ErrorKind::UnexpectedEof => StreamError::UnexpectedEof,
                ErrorKind::TimedOut | ErrorKind::WouldBlock => StreamError::Timeout,
                ErrorKind::ConnectionReset => StreamError::Reset(io.to_string()),
                ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe | ErrorKind::NotConnected => {
                    StreamError::Disconnected(io.to_string())
                }
                _ => StreamError::Other(io.to_string()),
            },
            tungstenite::Error::Protocol(
                tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
            ) => StreamError::Reset(err.to_string()),
            other => StreamError::Other(other.to_string()),
        }
    }
}

/// Open a websocket, bounded by a connect timeout
pub async fn connect(url: &str) -> Result<WsStream, StreamError> {
    tracing::debug!(url = %url, "Connecting websocket");

    let (ws, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
        .await
        .map_err(|_| StreamError::Timeout)??;

    Ok(ws)
}

/// Turn a websocket into an event stream
///
/// Text frames go through `parse`; frames it does not recognise are
/// skipped. No frame within `idle` yields [`StreamError::Timeout`]. After
/// the first error the stream ends, except for errors that are ignored,
/// where reading carries on.
pub fn event_stream<T, F>(ws: WsStream, idle: Duration, parse: F) -> EventStream<T>
where
    T: Send + 'static,
    F: Fn(&str) -> Option<T> + Send + Sync + 'static,
{
    let state = (ws, parse, false);
    Box::pin(futures_util::stream::unfold(
        state,
        move |(mut ws, parse, failed)| async move {
            if failed {
                return None;
            }
            loop {
                let frame = match tokio::time::timeout(idle, ws.next()).await {
                    Err(_) => return Some((Err(StreamError::Timeout), (ws, parse, true))),
                    Ok(None) => return None,
                    Ok(Some(frame)) => frame,
                };

                match frame {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = parse(text.as_str()) {
                            return Some((Ok(event), (ws, parse, false)));
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "closed by server".to_string());
                        return Some((Err(StreamError::Disconnected(reason)), (ws, parse, true)));
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let error = StreamError::from(e);
                        let failed = error.action() != StreamAction::Ignore;
                        return Some((Err(error), (ws, parse, failed)));
                    }
                }
            }
        },
    ))
}

// ============== Wire Types ==============

#[derive(Debug, Deserialize)]
struct WsKlineEvent {
    #[serde(rename = "k")]
    kline: WsKline,
}

#[derive(Debug, Deserialize)]
struct WsKline {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "V")]
    taker_buy_volume: String,
    #[serde(rename = "x")]
    is_final: bool,
}

#[derive(Debug, Deserialize)]
struct WsBookTicker {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b")]
    best_bid: String,
    #[serde(rename = "a")]
    best_ask: String,
}

#[derive(Debug, Deserialize)]
struct WsUserEvent {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "B", default)]
    balances: Vec<WsBalance>,
    #[serde(rename = "i", default)]
    order_id: i64,
    #[serde(rename = "X", default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct WsBalance {
    #[serde(rename = "a")]
    asset: String,
    #[serde(rename = "f")]
    free: String,
    #[serde(rename = "l")]
    locked: String,
}

fn num(value: &str) -> Option<f64> {
    value.parse().ok()
}

// ============== Parsers ==============

pub fn parse_kline(text: &str) -> Option<KlineEvent> {
    let event: WsKlineEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::debug!(error = %e, "Skipping unrecognised kline frame");
            return None;
        }
    };
    let k = event.kline;

    Some(KlineEvent {
        kline: Kline {
            open_time: k.open_time,
            open: num(&k.open)?,
            high: num(&k.high)?,
            low: num(&k.low)?,
            close: num(&k.close)?,
            volume: num(&k.volume)?,
            taker_buy_volume: num(&k.taker_buy_volume)?,
        },
        is_final: k.is_final,
    })
}

pub fn parse_book_ticker(text: &str) -> Option<BookTicker> {
    let ticker: WsBookTicker = serde_json::from_str(text).ok()?;
    Some(BookTicker {
        symbol: ticker.symbol,
        best_bid_price: num(&ticker.best_bid)?,
        best_ask_price: num(&ticker.best_ask)?,
    })
}

pub fn parse_user_data(text: &str) -> Option<UserDataEvent> {
    let event: WsUserEvent = serde_json::from_str(text).ok()?;

    Some(match event.event_type.as_str() {
        "outboundAccountPosition" => UserDataEvent::AccountPosition {
            balances: event
                .balances
                .into_iter()
                .filter_map(|b| {
                    Some(Balance {
                        free: num(&b.free)?,
                        locked: num(&b.locked)?,
                        asset: b.asset,
                    })
                })
                .collect(),
        },
        "executionReport" => UserDataEvent::ExecutionReport {
            order_id: event.order_id,
            status: OrderStatus::parse(&event.status),
        },
        _ => UserDataEvent::Other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kline() {
        let text = r#"{"e":"kline","E":1672515782136,"s":"BTCUSDT","k":{"t":1672515780000,"T":1672515839999,"s":"BTCUSDT","i":"1m","f":100,"L":200,"o":"16500.10","c":"16510.00","h":"16512.00","l":"16499.00","v":"12.5","n":100,"x":true,"q":"206000","V":"7.5","Q":"123000","B":"0"}}"#;
        let event = parse_kline(text).unwrap();
        assert!(event.is_final);
        assert_eq!(event.kline.open_time, 1672515780000);
        assert_eq!(event.kline.close, 16510.0);
        assert_eq!(event.kline.volume, 12.5);
        assert_eq!(event.kline.taker_buy_volume, 7.5);
    }

    #[test]
    fn test_parse_kline_rejects_garbage() {
        assert!(parse_kline(r#"{"result":null,"id":1}"#).is_none());
    }

    #[test]
    fn test_parse_book_ticker() {
        let text = r#"{"u":400900217,"s":"BNBUSDT","b":"25.35190000","B":"31.21000000","a":"25.36520000","A":"40.66000000"}"#;
        let ticker = parse_book_ticker(text).unwrap();
        assert_eq!(ticker.symbol, "BNBUSDT");
        assert_eq!(ticker.best_ask_price, 25.3652);
        assert_eq!(ticker.best_bid_price, 25.3519);
    }

    #[test]
    fn test_parse_account_position() {
        let text = r#"{"e":"outboundAccountPosition","E":1564034571105,"u":1564034571073,"B":[{"a":"USDT","f":"100.50","l":"0.00"},{"a":"BTC","f":"0.002","l":"0.0"}]}"#;
        match parse_user_data(text) {
            Some(UserDataEvent::AccountPosition { balances }) => {
                assert_eq!(balances.len(), 2);
                assert_eq!(balances[0].asset, "USDT");
                assert_eq!(balances[0].free, 100.5);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_execution_report() {
        let text = r#"{"e":"executionReport","E":1499405658658,"s":"ETHBTC","i":4293153,"X":"FILLED"}"#;
        assert_eq!(
            parse_user_data(text),
            Some(UserDataEvent::ExecutionReport {
                order_id: 4293153,
                status: OrderStatus::Filled
            })
        );
        assert_eq!(
            parse_user_data(r#"{"e":"balanceUpdate","a":"BTC","d":"1.0"}"#),
            Some(UserDataEvent::Other)
        );
    }

    #[test]
    fn test_io_error_classification() {
        let reset = tungstenite::Error::Io(std::io::Error::new(ErrorKind::ConnectionReset, "reset"));
        assert!(matches!(StreamError::from(reset), StreamError::Reset(_)));

        let eof = tungstenite::Error::Io(std::io::Error::new(ErrorKind::UnexpectedEof, "eof"));
        assert_eq!(StreamError::from(eof), StreamError::UnexpectedEof);

        assert!(matches!(
            StreamError::from(tungstenite::Error::ConnectionClosed),
            StreamError::Disconnected(_)
        ));
    }
}
