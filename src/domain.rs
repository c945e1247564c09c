// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side { Buy, Sell }

impl Side {
    pub fn opposite(&self) -> Side { match self { Side::Buy => Side::Sell, Side::Sell => Side::Buy } }
    pub fn sign(&self) -> f64 { match self { Side::Buy => 1.0, Side::Sell => -1.0 } }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "BUY", Side::Sell => "SELL" } }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Output of a signal policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision { Long, Short, None }

impl Decision {
    pub fn entry_side(&self) -> Option<Side> {
        match self {
            Decision::Long => Some(Side::Buy),
            Decision::Short => Some(Side::Sell),
            Decision::None => None,
        }
    }
    pub fn as_str(&self) -> &'static str {
        match self { Decision::Long => "LONG", Decision::Short => "SHORT", Decision::None => "NONE" }
    }
}

/// Strategy family. Doubles as the strategy tag stored on orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind { Imbalance, MeanReversion }

impl StrategyKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "obi" | "imbalance" | "obi_scalper" => Some(StrategyKind::Imbalance),
            "vwap" | "mean_reversion" | "vwap_mean_reversion" | "mr" => Some(StrategyKind::MeanReversion),
            _ => None,
        }
    }
    pub fn as_str(&self) -> &'static str {
        match self { StrategyKind::Imbalance => "imbalance", StrategyKind::MeanReversion => "mean_reversion" }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Indicator output. `NotReady` is distinct from any numeric value, zero included.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading<T> { Ready(T), NotReady }

impl<T> Reading<T> {
    pub fn ready(self) -> Option<T> { match self { Reading::Ready(v) => Some(v), Reading::NotReady => None } }
    #[cfg(test)]
    pub fn is_ready(&self) -> bool { matches!(self, Reading::Ready(_)) }
}

// ---- Inbound market data ----

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Level { pub price: f64, pub qty: f64 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthUpdate { pub bids: Vec<Level>, pub asks: Vec<Level> }

impl DepthUpdate {
    pub fn best_bid(&self) -> Option<f64> { self.bids.first().map(|l| l.price) }
    pub fn best_ask(&self) -> Option<f64> { self.asks.first().map(|l| l.price) }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradePrint { pub price: f64, pub qty: f64, pub ts: DateTime<Utc> }

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle { pub high: f64, pub low: f64, pub close: f64, pub closed: bool }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MarketEvent { Depth(DepthUpdate), Trade(TradePrint), Candle(Candle) }

// ---- Orders, positions, trades ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderState { Pending, Active, Closed }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub state: OrderState,
    pub strategy: StrategyKind,
    /// Indicator value at creation (VWAP for mean reversion, mid otherwise).
    pub reference_px: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_px: f64,
    pub qty: f64,
    pub strategy: StrategyKind,
    pub reference_px: f64,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn pnl_at(&self, exit_px: f64) -> f64 {
        (exit_px - self.entry_px) * self.qty * self.side.sign()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason { ProfitTarget, StopLoss, MeanReversionExit, Manual }

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::ProfitTarget => "PROFIT_TARGET",
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::MeanReversionExit => "MEAN_REVERSION_EXIT",
            ExitReason::Manual => "MANUAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub strategy: StrategyKind,
    pub entry_px: f64,
    pub exit_px: f64,
    pub qty: f64,
    pub pnl: f64,
    pub reason: ExitReason,
    pub closed_at: DateTime<Utc>,
}

// ---- Audit events (recorder) ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Decision { ts: DateTime<Utc>, strategy: StrategyKind, decision: Decision, px: f64 },
    Registered(Order),
    Filled(Position),
    Cancelled { ts: DateTime<Utc>, order_id: String },
    Closed(ClosedTrade),
    Channel { ts: DateTime<Utc>, channel: String, state: String },
    Note(String),
}
