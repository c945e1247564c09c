// ===============================
// src/snapshot.rs
// ===============================
//
// Shared market state written by the channel tasks / indicator bank and read
// by the signal loop and the exit monitor. Each field sits behind its own
// lock: a reader never sees half of a composite field (book, bands), but two
// fields may come from different moments.
//
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::domain::{DepthUpdate, Reading};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bands {
    pub upper: f64,
    pub lower: f64,
    pub sigma: f64,
}

#[derive(Debug)]
pub struct SharedSnapshot {
    book: RwLock<Option<DepthUpdate>>,
    last_trade: RwLock<Option<f64>>,
    vwap: RwLock<Reading<f64>>,
    trend: RwLock<Reading<f64>>,
    bands: RwLock<Reading<Bands>>,
    halt_until: RwLock<Option<DateTime<Utc>>>,
}

/// Point-in-time copy handed to signal policies and the exit monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketSnapshot {
    pub book: Option<DepthUpdate>,
    pub last_trade: Option<f64>,
    pub vwap: Reading<f64>,
    pub trend_strength: Reading<f64>,
    pub bands: Reading<Bands>,
    pub halted: bool,
}

impl MarketSnapshot {
    pub fn best_bid(&self) -> Option<f64> { self.book.as_ref().and_then(|b| b.best_bid()) }
    pub fn best_ask(&self) -> Option<f64> { self.book.as_ref().and_then(|b| b.best_ask()) }

    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            _ => None,
        }
    }

    /// Last trade, falling back to the book mid.
    pub fn price(&self) -> Option<f64> { self.last_trade.or_else(|| self.mid()) }
}

impl Default for MarketSnapshot {
    fn default() -> Self {
        Self {
            book: None,
            last_trade: None,
            vwap: Reading::NotReady,
            trend_strength: Reading::NotReady,
            bands: Reading::NotReady,
            halted: false,
        }
    }
}

impl SharedSnapshot {
    pub fn new() -> Self {
        Self {
            book: RwLock::new(None),
            last_trade: RwLock::new(None),
            vwap: RwLock::new(Reading::NotReady),
            trend: RwLock::new(Reading::NotReady),
            bands: RwLock::new(Reading::NotReady),
            halt_until: RwLock::new(None),
        }
    }

    pub fn set_book(&self, book: DepthUpdate) { *self.book.write() = Some(book); }
    pub fn set_last_trade(&self, px: f64) { *self.last_trade.write() = Some(px); }
    pub fn set_vwap(&self, v: Reading<f64>) { *self.vwap.write() = v; }
    pub fn set_trend(&self, v: Reading<f64>) { *self.trend.write() = v; }
    pub fn set_bands(&self, v: Reading<Bands>) { *self.bands.write() = v; }
    pub fn set_halt_until(&self, t: Option<DateTime<Utc>>) { *self.halt_until.write() = t; }

    pub fn view(&self, now: DateTime<Utc>) -> MarketSnapshot {
        // halt expiry is evaluated at read time, no timer involved
        let halted = matches!(*self.halt_until.read(), Some(until) if now < until);
        MarketSnapshot {
            book: self.book.read().clone(),
            last_trade: *self.last_trade.read(),
            vwap: *self.vwap.read(),
            trend_strength: *self.trend.read(),
            bands: *self.bands.read(),
            halted,
        }
    }
}

impl Default for SharedSnapshot {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Level;
    use chrono::Duration;

    #[test]
    fn price_prefers_last_trade_over_mid() {
        let snap = SharedSnapshot::new();
        snap.set_book(DepthUpdate {
            bids: vec![Level { price: 99.0, qty: 1.0 }],
            asks: vec![Level { price: 101.0, qty: 1.0 }],
        });
        let now = Utc::now();
        assert_eq!(snap.view(now).price(), Some(100.0));
        snap.set_last_trade(100.5);
        assert_eq!(snap.view(now).price(), Some(100.5));
    }

    #[test]
    fn halt_flag_expires_by_time_alone() {
        let snap = SharedSnapshot::new();
        let now = Utc::now();
        snap.set_halt_until(Some(now + Duration::seconds(10)));
        assert!(snap.view(now).halted);
        assert!(snap.view(now + Duration::seconds(9)).halted);
        assert!(!snap.view(now + Duration::seconds(10)).halted);
        assert!(!snap.view(now + Duration::seconds(11)).halted);
    }

    #[test]
    fn empty_snapshot_has_no_price() {
        let view = SharedSnapshot::new().view(Utc::now());
        assert_eq!(view, MarketSnapshot::default());
        assert_eq!(view.price(), None);
    }
}
