// ===============================
// src/execution.rs
// ===============================
//
// Order-execution boundary. The lifecycle manager only sees the
// `ExecutionClient` trait; two implementations:
// - BinanceFutures : signed REST against /fapi/v1/order
//                    entries are LIMIT GTX (post-only), exits MARKET reduceOnly
// - PaperExecution : DRY_RUN, fills entries at their limit price and exits
//                    at the current snapshot mid
//
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::binance::{
    ApiError, Credentials, OrderResponse, ERR_MARGIN_INSUFFICIENT, ERR_NO_SUCH_ORDER, ERR_UNKNOWN_ORDER,
};
use crate::domain::Side;
use crate::metrics::EXEC_ERRORS;
use crate::snapshot::SharedSnapshot;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("no market price to fill against")]
    NoPrice,
    #[error("api secret unusable for signing")]
    Signing,
}

impl ExecError {
    pub fn label(&self) -> &'static str {
        match self {
            ExecError::Rejected(_) => "rejected",
            ExecError::InsufficientBalance(_) => "insufficient_balance",
            ExecError::Transport(_) => "transport",
            ExecError::Decode(_) => "decode",
            ExecError::NoPrice => "no_price",
            ExecError::Signing => "signing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillStatus {
    /// Resting, possibly partially filled.
    Open,
    Filled { avg_px: f64, qty: f64 },
    /// Cancelled, expired or rejected. `filled_qty` may be non-zero.
    Cancelled { filled_qty: f64, avg_px: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// Filled in full or in part before the cancel landed.
    AlreadyFilled,
    NotFound,
}

#[async_trait]
pub trait ExecutionClient: Send + Sync {
    /// Maker entry. Returns the exchange order id.
    async fn place_entry(&self, side: Side, price: f64, qty: f64) -> Result<String, ExecError>;
    /// Market exit. Returns the average fill price.
    async fn place_market_exit(&self, side: Side, qty: f64) -> Result<f64, ExecError>;
    async fn cancel(&self, order_id: &str) -> Result<CancelOutcome, ExecError>;
    async fn query_fill(&self, order_id: &str) -> Result<FillStatus, ExecError>;
    fn venue(&self) -> &'static str;
}

// -----------------------------------------------------------------------------
// Binance USD-M futures
// -----------------------------------------------------------------------------
pub struct BinanceFutures {
    http: reqwest::Client,
    rest_base: String,
    symbol: String,
    creds: Credentials,
}

enum Reply {
    Ok(OrderResponse),
    Api(ApiError),
}

impl BinanceFutures {
    pub fn new(rest_base: String, symbol: String, creds: Credentials) -> Self {
        Self { http: reqwest::Client::new(), rest_base, symbol, creds }
    }

    async fn call(&self, method: Method, params: Vec<(&str, String)>) -> Result<Reply, ExecError> {
        let mut all = vec![("symbol", self.symbol.clone())];
        all.extend(params);
        let query = self.creds.signed_query(&all).ok_or(ExecError::Signing)?;
        let url = format!("{}/fapi/v1/order?{}", self.rest_base.trim_end_matches('/'), query);

        let rsp = self
            .http
            .request(method, url)
            .header("X-MBX-APIKEY", &self.creds.api_key)
            .send()
            .await?;
        let status = rsp.status();
        let body = rsp.text().await?;
        if status.is_success() {
            return serde_json::from_str::<OrderResponse>(&body)
                .map(Reply::Ok)
                .map_err(|e| ExecError::Decode(format!("{e}: {body}")));
        }
        match serde_json::from_str::<ApiError>(&body) {
            Ok(api) => Ok(Reply::Api(api)),
            Err(_) if status == StatusCode::TOO_MANY_REQUESTS => Err(ExecError::Rejected("rate limited".into())),
            Err(_) => Err(ExecError::Decode(format!("{status}: {body}"))),
        }
    }

    fn api_error(e: ApiError) -> ExecError {
        if e.code == ERR_MARGIN_INSUFFICIENT {
            ExecError::InsufficientBalance(e.msg)
        } else {
            ExecError::Rejected(format!("{}: {}", e.code, e.msg))
        }
    }

    fn expect_ok(reply: Reply) -> Result<OrderResponse, ExecError> {
        match reply {
            Reply::Ok(r) => Ok(r),
            Reply::Api(e) => Err(Self::api_error(e)),
        }
    }
}

fn fill_status(r: &OrderResponse) -> FillStatus {
    match r.status.as_str() {
        "FILLED" => FillStatus::Filled { avg_px: r.avg_px(), qty: r.filled_qty() },
        "CANCELED" | "EXPIRED" | "REJECTED" | "EXPIRED_IN_MATCH" => {
            FillStatus::Cancelled { filled_qty: r.filled_qty(), avg_px: r.avg_px() }
        }
        _ => FillStatus::Open,
    }
}

#[async_trait]
impl ExecutionClient for BinanceFutures {
    async fn place_entry(&self, side: Side, price: f64, qty: f64) -> Result<String, ExecError> {
        let params = vec![
            ("side", side.as_str().to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", "GTX".to_string()),
            ("quantity", format!("{qty}")),
            ("price", format!("{price}")),
        ];
        let r = Self::expect_ok(self.call(Method::POST, params).await?)?;
        info!(order_id = r.order_id, %side, price, qty, "entry order accepted");
        Ok(r.order_id.to_string())
    }

    async fn place_market_exit(&self, side: Side, qty: f64) -> Result<f64, ExecError> {
        let params = vec![
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", format!("{qty}")),
            ("reduceOnly", "true".to_string()),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        let r = Self::expect_ok(self.call(Method::POST, params).await?)?;
        match fill_status(&r) {
            FillStatus::Filled { avg_px, .. } if avg_px > 0.0 => Ok(avg_px),
            _ => Err(ExecError::Decode(format!("market exit {} not filled: {}", r.order_id, r.status))),
        }
    }

    async fn cancel(&self, order_id: &str) -> Result<CancelOutcome, ExecError> {
        match self.call(Method::DELETE, vec![("orderId", order_id.to_string())]).await? {
            Reply::Ok(r) if r.filled_qty() > 0.0 => {
                debug!(order_id, filled = r.filled_qty(), "cancelled after a partial fill");
                Ok(CancelOutcome::AlreadyFilled)
            }
            Reply::Ok(r) => {
                debug!(order_id, status = %r.status, "cancel acknowledged");
                Ok(CancelOutcome::Cancelled)
            }
            // unknown to the book: filled already, or gone
            Reply::Api(e) if e.code == ERR_UNKNOWN_ORDER || e.code == ERR_NO_SUCH_ORDER => {
                match self.query_fill(order_id).await? {
                    FillStatus::Filled { .. } => Ok(CancelOutcome::AlreadyFilled),
                    _ => Ok(CancelOutcome::NotFound),
                }
            }
            Reply::Api(e) => Err(Self::api_error(e)),
        }
    }

    async fn query_fill(&self, order_id: &str) -> Result<FillStatus, ExecError> {
        match self.call(Method::GET, vec![("orderId", order_id.to_string())]).await? {
            Reply::Ok(r) => Ok(fill_status(&r)),
            Reply::Api(e) if e.code == ERR_NO_SUCH_ORDER => Ok(FillStatus::Cancelled { filled_qty: 0.0, avg_px: 0.0 }),
            Reply::Api(e) => Err(Self::api_error(e)),
        }
    }

    fn venue(&self) -> &'static str { "binance_futures" }
}

// -----------------------------------------------------------------------------
// Paper execution (DRY_RUN)
// -----------------------------------------------------------------------------
pub struct PaperExecution {
    snapshot: Arc<SharedSnapshot>,
    seq: AtomicU64,
    fills: Mutex<HashMap<String, (f64, f64)>>,
}

impl PaperExecution {
    pub fn new(snapshot: Arc<SharedSnapshot>) -> Self {
        Self { snapshot, seq: AtomicU64::new(1), fills: Mutex::new(HashMap::new()) }
    }
}

#[async_trait]
impl ExecutionClient for PaperExecution {
    async fn place_entry(&self, side: Side, price: f64, qty: f64) -> Result<String, ExecError> {
        if !(price > 0.0 && qty > 0.0) {
            return Err(ExecError::Rejected(format!("price {price} qty {qty}")));
        }
        let id = format!("PAPER-{}-{}", Utc::now().timestamp_millis(), self.seq.fetch_add(1, Ordering::Relaxed));
        self.fills.lock().insert(id.clone(), (price, qty));
        info!(order_id = %id, %side, price, qty, "paper entry filled");
        Ok(id)
    }

    async fn place_market_exit(&self, side: Side, qty: f64) -> Result<f64, ExecError> {
        let view = self.snapshot.view(Utc::now());
        let px = view.mid().or(view.last_trade).ok_or(ExecError::NoPrice)?;
        info!(%side, qty, px, "paper exit filled");
        Ok(px)
    }

    async fn cancel(&self, order_id: &str) -> Result<CancelOutcome, ExecError> {
        // paper entries fill on placement
        if self.fills.lock().contains_key(order_id) {
            Ok(CancelOutcome::AlreadyFilled)
        } else {
            Ok(CancelOutcome::NotFound)
        }
    }

    async fn query_fill(&self, order_id: &str) -> Result<FillStatus, ExecError> {
        match self.fills.lock().get(order_id) {
            Some(&(avg_px, qty)) => Ok(FillStatus::Filled { avg_px, qty }),
            None => {
                warn!(order_id, "paper: unknown order");
                Ok(FillStatus::Cancelled { filled_qty: 0.0, avg_px: 0.0 })
            }
        }
    }

    fn venue(&self) -> &'static str { "paper" }
}

/// Count an execution failure under its kind.
pub fn count_error(op: &str, e: &ExecError) {
    EXEC_ERRORS.with_label_values(&[op, e.label()]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DepthUpdate, Level};

    fn resp(status: &str, avg: &str, qty: &str) -> OrderResponse {
        OrderResponse {
            order_id: 7,
            status: status.to_string(),
            avg_price: Some(avg.to_string()),
            executed_qty: Some(qty.to_string()),
        }
    }

    #[test]
    fn exchange_status_maps_to_fill_status() {
        assert_eq!(fill_status(&resp("NEW", "0", "0")), FillStatus::Open);
        assert_eq!(fill_status(&resp("PARTIALLY_FILLED", "100", "0.1")), FillStatus::Open);
        assert_eq!(fill_status(&resp("FILLED", "100.5", "0.2")), FillStatus::Filled { avg_px: 100.5, qty: 0.2 });
        assert_eq!(
            fill_status(&resp("EXPIRED", "0", "0")),
            FillStatus::Cancelled { filled_qty: 0.0, avg_px: 0.0 }
        );
    }

    #[test]
    fn margin_error_is_insufficient_balance() {
        let e = BinanceFutures::api_error(ApiError { code: -2019, msg: "Margin is insufficient.".into() });
        assert!(matches!(e, ExecError::InsufficientBalance(_)));
        let e = BinanceFutures::api_error(ApiError { code: -5022, msg: "post only".into() });
        assert!(matches!(e, ExecError::Rejected(_)));
    }

    #[tokio::test]
    async fn paper_fills_entries_and_exits_at_mid() {
        let snap = Arc::new(SharedSnapshot::new());
        let paper = PaperExecution::new(snap.clone());
        let id = paper.place_entry(Side::Buy, 100.0, 0.2).await.unwrap();
        assert_eq!(paper.query_fill(&id).await.unwrap(), FillStatus::Filled { avg_px: 100.0, qty: 0.2 });
        assert_eq!(paper.cancel(&id).await.unwrap(), CancelOutcome::AlreadyFilled);
        assert_eq!(paper.cancel("nope").await.unwrap(), CancelOutcome::NotFound);

        assert!(matches!(paper.place_market_exit(Side::Sell, 0.2).await, Err(ExecError::NoPrice)));
        snap.set_book(DepthUpdate {
            bids: vec![Level { price: 100.5, qty: 1.0 }],
            asks: vec![Level { price: 100.7, qty: 1.0 }],
        });
        let px = paper.place_market_exit(Side::Sell, 0.2).await.unwrap();
        assert!((px - 100.6).abs() < 1e-9);
    }
}
