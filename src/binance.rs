// ===============================
// src/binance.rs
// ===============================
//
// USD-M futures REST helpers: signed query strings and response models.
//
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

/// Order unknown to the matching engine (filled, cancelled or never existed).
pub const ERR_UNKNOWN_ORDER: i64 = -2011;
pub const ERR_NO_SUCH_ORDER: i64 = -2013;
pub const ERR_MARGIN_INSUFFICIENT: i64 = -2019;

pub fn timestamp_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

pub fn sign_query(secret: &str, query: &str) -> Option<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(query.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

pub fn encode_params(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    secret: String,
    pub recv_window: u64,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").field("api_key", &"***").field("recv_window", &self.recv_window).finish()
    }
}

impl Credentials {
    pub fn new(api_key: String, secret: String) -> Self {
        Self { api_key, secret, recv_window: 5000 }
    }

    /// `params` + timestamp + recvWindow, followed by `&signature=`.
    pub fn signed_query(&self, params: &[(&str, String)]) -> Option<String> {
        let mut all: Vec<(&str, String)> = params.to_vec();
        all.push(("timestamp", timestamp_ms().to_string()));
        all.push(("recvWindow", self.recv_window.to_string()));
        let query = encode_params(&all);
        let sig = sign_query(&self.secret, &query)?;
        Some(format!("{query}&signature={sig}"))
    }
}

// ---- response models ----

#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    pub code: i64,
    pub msg: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    pub status: String,
    #[serde(default)]
    pub avg_price: Option<String>,
    #[serde(default)]
    pub executed_qty: Option<String>,
}

impl OrderResponse {
    fn parse(v: &Option<String>) -> f64 {
        v.as_deref().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0)
    }

    pub fn avg_px(&self) -> f64 { Self::parse(&self.avg_price) }
    pub fn filled_qty(&self) -> f64 { Self::parse(&self.executed_qty) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_documented_example() {
        // HMAC example from the exchange API docs
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_query(secret, query).as_deref(),
            Some("c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71")
        );
    }

    #[test]
    fn params_are_url_encoded_in_order() {
        let q = encode_params(&[("symbol", "BTCUSDT".into()), ("note", "a b".into())]);
        assert_eq!(q, "symbol=BTCUSDT&note=a%20b");
    }

    #[test]
    fn order_response_parses_numeric_strings() {
        let r: OrderResponse = serde_json::from_str(
            r#"{"orderId":42,"status":"FILLED","avgPrice":"100.50","executedQty":"0.002","origQty":"0.002"}"#,
        )
        .unwrap();
        assert_eq!(r.order_id, 42);
        assert_eq!(r.avg_px(), 100.5);
        assert_eq!(r.filled_qty(), 0.002);
        let e: ApiError = serde_json::from_str(r#"{"code":-2019,"msg":"Margin is insufficient."}"#).unwrap();
        assert_eq!(e.code, ERR_MARGIN_INSUFFICIENT);
    }
}
