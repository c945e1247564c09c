// ===============================
// src/feed.rs
// ===============================
//
// Market data wire codec + websocket connector (Binance USD-M futures).
//
// One raw stream per channel:
//   depth  : <sym>@depth<5|10|20>@100ms   {"b":[["px","qty"],..],"a":[..]}
//   trade  : <sym>@aggTrade               {"p":"px","q":"qty","T":ms}
//   candle : <sym>@kline_<interval>       {"k":{"h":..,"l":..,"c":..,"x":bool}}
//
// The connector only hands out text frames. Decoding happens in the channel
// task so a malformed frame is a discarded observation, not a disconnect.
//
// Closed candle history comes from REST (/fapi/v1/klines) once at startup.
//
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use thiserror::Error;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::info;
use url::Url;

use crate::config::Settings;
use crate::domain::{Candle, DepthUpdate, Level, MarketEvent, TradePrint};
use crate::ingest::{ChannelKind, Connector, FrameStream};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("websocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("bad stream url: {0}")]
    Url(#[from] url::ParseError),
    #[error("stream closed by peer")]
    Closed,
    #[error("no event since subscribe, forcing reconnect")]
    Silent,
    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid observation: {0}")]
    Invalid(String),
    #[error("rest: {0}")]
    Rest(#[from] reqwest::Error),
}

// ---- wire models ----

#[derive(Debug, Deserialize)]
struct DepthMsg {
    #[serde(rename = "b", alias = "bids")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a", alias = "asks")]
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct AggTradeMsg {
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    qty: String,
    #[serde(rename = "T")]
    trade_time: i64,
}

#[derive(Debug, Deserialize)]
struct KlineMsg {
    k: KlineBody,
}

#[derive(Debug, Deserialize)]
struct KlineBody {
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "x")]
    closed: bool,
}

fn num(field: &str, raw: &str) -> Result<f64, FeedError> {
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() && v > 0.0 => Ok(v),
        _ => Err(FeedError::Invalid(format!("{field}={raw:?}"))),
    }
}

fn levels(side: &str, raw: &[[String; 2]]) -> Result<Vec<Level>, FeedError> {
    raw.iter()
        .map(|[p, q]| -> Result<Level, FeedError> { Ok(Level { price: num(side, p)?, qty: num(side, q)? }) })
        .collect()
}

/// Subscription acks / control frames carry `result` or `id` and no payload.
fn is_control(txt: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(txt)
        .map(|v| v.get("result").is_some() || (v.get("id").is_some() && v.get("e").is_none()))
        .unwrap_or(false)
}

/// Parse one text frame of the given channel. `Ok(None)` for control frames.
pub fn decode(kind: ChannelKind, txt: &str) -> Result<Option<MarketEvent>, FeedError> {
    if is_control(txt) {
        return Ok(None);
    }
    let ev = match kind {
        ChannelKind::Depth => {
            let m: DepthMsg = serde_json::from_str(txt)?;
            MarketEvent::Depth(DepthUpdate { bids: levels("bid", &m.bids)?, asks: levels("ask", &m.asks)? })
        }
        ChannelKind::Trade => {
            let m: AggTradeMsg = serde_json::from_str(txt)?;
            let ts = DateTime::<Utc>::from_timestamp_millis(m.trade_time)
                .ok_or_else(|| FeedError::Invalid(format!("T={}", m.trade_time)))?;
            MarketEvent::Trade(TradePrint { price: num("p", &m.price)?, qty: num("q", &m.qty)?, ts })
        }
        ChannelKind::Candle => {
            let KlineMsg { k } = serde_json::from_str(txt)?;
            let c = Candle { high: num("h", &k.high)?, low: num("l", &k.low)?, close: num("c", &k.close)?, closed: k.closed };
            if c.high < c.low {
                return Err(FeedError::Invalid(format!("high {} < low {}", c.high, c.low)));
            }
            MarketEvent::Candle(c)
        }
    };
    Ok(Some(ev))
}

/// Closed candles from a klines REST body. Rows still forming at `now_ms` are dropped.
///
/// Row layout: [openTime, open, high, low, close, volume, closeTime, ...]
pub fn parse_klines(body: &str, now_ms: i64) -> Result<Vec<Candle>, FeedError> {
    let rows: Vec<Vec<serde_json::Value>> = serde_json::from_str(body)?;
    let field = |row: &[serde_json::Value], i: usize, name: &str| -> Result<f64, FeedError> {
        match row.get(i).and_then(|v| v.as_str()) {
            Some(raw) => num(name, raw),
            None => Err(FeedError::Invalid(format!("kline {name} missing"))),
        }
    };
    let mut out = Vec::with_capacity(rows.len());
    for row in rows.iter().map(Vec::as_slice) {
        let close_time = row.get(6).and_then(|v| v.as_i64()).unwrap_or(i64::MAX);
        if close_time >= now_ms {
            continue;
        }
        let c = Candle { high: field(row, 2, "h")?, low: field(row, 3, "l")?, close: field(row, 4, "c")?, closed: true };
        if c.high < c.low {
            return Err(FeedError::Invalid(format!("high {} < low {}", c.high, c.low)));
        }
        out.push(c);
    }
    Ok(out)
}

/// Last `limit` closed candles of `interval`, oldest first.
pub async fn fetch_closed_candles(
    rest_base: &str,
    symbol: &str,
    interval: &str,
    limit: usize,
) -> Result<Vec<Candle>, FeedError> {
    let http = reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;
    let url = format!("{}/fapi/v1/klines", rest_base.trim_end_matches('/'));
    let body = http
        .get(url)
        .query(&[("symbol", symbol.to_string()), ("interval", interval.to_string()), ("limit", limit.to_string())])
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    parse_klines(&body, Utc::now().timestamp_millis())
}

/// Partial book streams only exist at 5, 10 and 20 levels.
fn depth_stream_levels(depth_level: usize) -> usize {
    match depth_level {
        0..=5 => 5,
        6..=10 => 10,
        _ => 20,
    }
}

pub fn stream_name(kind: ChannelKind, symbol: &str, depth_level: usize, kline_interval: &str) -> String {
    let sym = symbol.to_ascii_lowercase();
    match kind {
        ChannelKind::Depth => format!("{sym}@depth{}@100ms", depth_stream_levels(depth_level)),
        ChannelKind::Trade => format!("{sym}@aggTrade"),
        ChannelKind::Candle => format!("{sym}@kline_{kline_interval}"),
    }
}

/// Live connector: one websocket per channel against `<ws_base>/<stream>`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    ws_base: String,
    symbol: String,
    depth_level: usize,
    kline_interval: String,
}

impl WsConnector {
    pub fn from_settings(s: &Settings) -> Self {
        Self {
            ws_base: s.args.ws_url.clone(),
            symbol: s.args.symbol.clone(),
            depth_level: s.imbalance.depth_level,
            kline_interval: s.args.kline_interval.clone(),
        }
    }

    pub fn url_for(&self, kind: ChannelKind) -> String {
        let stream = stream_name(kind, &self.symbol, self.depth_level, &self.kline_interval);
        format!("{}/{}", self.ws_base.trim_end_matches('/'), stream)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, kind: ChannelKind) -> Result<FrameStream, FeedError> {
        let url = Url::parse(&self.url_for(kind))?;
        info!(channel = %kind, %url, "connecting");
        let (ws, _resp) = connect_async(url).await?;
        let frames = ws.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(t)) => Some(Ok(t)),
                Ok(Message::Close(_)) => Some(Err(FeedError::Closed)),
                // ping/pong are answered by tungstenite, binary is unused
                Ok(_) => None,
                Err(e) => Some(Err(FeedError::from(e))),
            }
        });
        Ok(frames.boxed())
    }
}
