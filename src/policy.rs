// ===============================
// src/policy.rs
// ===============================
//
// Signal policies. Both are pure functions of a `MarketSnapshot`:
//
// 1) Order-book imbalance
//    ratio = bid notional / (bid + ask notional) over the top N levels
//    ratio >= long  -> LONG,  ratio <= short -> SHORT, otherwise NONE
//
// 2) VWAP mean reversion
//    volatility halt        -> NONE (checked first)
//    trend >= strong trend  -> NONE (market trending)
//    trend >= trend         -> NONE (trend developing, wait)
//    price >= upper && price > vwap -> SHORT
//    price <= lower && price < vwap -> LONG
//
// Any indicator still warming up means NONE.
//
use crate::config::Settings;
use crate::domain::{Decision, DepthUpdate, Level, Reading, StrategyKind};
use crate::snapshot::MarketSnapshot;

pub trait SignalPolicy {
    fn kind(&self) -> StrategyKind;
    fn evaluate(&self, snap: &MarketSnapshot) -> Decision;
}

#[derive(Debug, Clone)]
pub struct ImbalancePolicy {
    pub depth_level: usize,
    pub long: f64,
    pub short: f64,
}

/// Bid share of top-of-book notional, in [0, 1]. `None` for an empty book.
pub fn imbalance_ratio(book: &DepthUpdate, depth_level: usize) -> Option<f64> {
    let notional = |levels: &[Level]| -> f64 {
        levels.iter().take(depth_level).map(|l| l.price * l.qty).sum()
    };
    let bid = notional(book.bids.as_slice());
    let ask = notional(book.asks.as_slice());
    let total = bid + ask;
    if total > 0.0 && total.is_finite() { Some((bid / total).clamp(0.0, 1.0)) } else { None }
}

impl SignalPolicy for ImbalancePolicy {
    fn kind(&self) -> StrategyKind { StrategyKind::Imbalance }

    fn evaluate(&self, snap: &MarketSnapshot) -> Decision {
        let ratio = match snap.book.as_ref().and_then(|b| imbalance_ratio(b, self.depth_level)) {
            Some(r) => r,
            None => return Decision::None,
        };
        if ratio >= self.long {
            Decision::Long
        } else if ratio <= self.short {
            Decision::Short
        } else {
            Decision::None
        }
    }
}

#[derive(Debug, Clone)]
pub struct MeanReversionPolicy {
    pub trend_threshold: f64,
    pub strong_trend_threshold: f64,
}

impl SignalPolicy for MeanReversionPolicy {
    fn kind(&self) -> StrategyKind { StrategyKind::MeanReversion }

    fn evaluate(&self, snap: &MarketSnapshot) -> Decision {
        if snap.halted {
            return Decision::None;
        }
        let trend = match snap.trend_strength {
            Reading::Ready(t) => t,
            Reading::NotReady => return Decision::None,
        };
        if trend >= self.strong_trend_threshold || trend >= self.trend_threshold {
            return Decision::None;
        }
        let (price, vwap, bands) = match (snap.last_trade, snap.vwap, snap.bands) {
            (Some(p), Reading::Ready(v), Reading::Ready(b)) => (p, v, b),
            _ => return Decision::None,
        };
        if price >= bands.upper && price > vwap {
            Decision::Short
        } else if price <= bands.lower && price < vwap {
            Decision::Long
        } else {
            Decision::None
        }
    }
}

/// Strategy chosen once at startup.
#[derive(Debug, Clone)]
pub enum Policy {
    Imbalance(ImbalancePolicy),
    MeanReversion(MeanReversionPolicy),
}

impl Policy {
    pub fn from_settings(s: &Settings) -> Self {
        match s.args.strategy {
            StrategyKind::Imbalance => Policy::Imbalance(ImbalancePolicy {
                depth_level: s.imbalance.depth_level,
                long: s.imbalance.long,
                short: s.imbalance.short,
            }),
            StrategyKind::MeanReversion => Policy::MeanReversion(MeanReversionPolicy {
                trend_threshold: s.reversion.trend_threshold,
                strong_trend_threshold: s.reversion.strong_trend_threshold,
            }),
        }
    }
}

impl SignalPolicy for Policy {
    fn kind(&self) -> StrategyKind {
        match self {
            Policy::Imbalance(p) => p.kind(),
            Policy::MeanReversion(p) => p.kind(),
        }
    }

    fn evaluate(&self, snap: &MarketSnapshot) -> Decision {
        match self {
            Policy::Imbalance(p) => p.evaluate(snap),
            Policy::MeanReversion(p) => p.evaluate(snap),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Bands;

    fn book(bid_qty: f64, ask_qty: f64) -> DepthUpdate {
        DepthUpdate {
            bids: vec![Level { price: 100.0, qty: bid_qty }, Level { price: 99.9, qty: bid_qty }],
            asks: vec![Level { price: 100.1, qty: ask_qty }, Level { price: 100.2, qty: ask_qty }],
        }
    }

    fn obi() -> ImbalancePolicy { ImbalancePolicy { depth_level: 5, long: 0.70, short: 0.30 } }

    fn mr() -> MeanReversionPolicy { MeanReversionPolicy { trend_threshold: 20.0, strong_trend_threshold: 40.0 } }

    fn reversion_snap(price: f64, trend: f64) -> MarketSnapshot {
        MarketSnapshot {
            last_trade: Some(price),
            vwap: Reading::Ready(100.0),
            trend_strength: Reading::Ready(trend),
            bands: Reading::Ready(Bands { upper: 103.0, lower: 97.0, sigma: 2.0 }),
            ..MarketSnapshot::default()
        }
    }

    #[test]
    fn imbalance_thresholds() {
        let snap = |b, a| MarketSnapshot { book: Some(book(b, a)), ..MarketSnapshot::default() };
        assert_eq!(obi().evaluate(&snap(9.0, 1.0)), Decision::Long);
        assert_eq!(obi().evaluate(&snap(1.0, 9.0)), Decision::Short);
        assert_eq!(obi().evaluate(&snap(1.0, 1.0)), Decision::None);
        assert_eq!(obi().evaluate(&MarketSnapshot::default()), Decision::None);
        assert_eq!(obi().evaluate(&snap(0.0, 0.0)), Decision::None);
    }

    #[test]
    fn imbalance_ratio_respects_depth_and_bounds() {
        let b = DepthUpdate {
            bids: vec![Level { price: 10.0, qty: 1.0 }, Level { price: 9.0, qty: 100.0 }],
            asks: vec![Level { price: 10.0, qty: 1.0 }],
        };
        assert_eq!(imbalance_ratio(&b, 1), Some(0.5));
        let deep = imbalance_ratio(&b, 5).unwrap();
        assert!(deep > 0.98 && deep <= 1.0);
        let one_sided = DepthUpdate { bids: b.bids.clone(), asks: vec![] };
        assert_eq!(imbalance_ratio(&one_sided, 5), Some(1.0));
    }

    #[test]
    fn price_above_upper_band_in_quiet_market_is_short() {
        assert_eq!(mr().evaluate(&reversion_snap(104.0, 10.0)), Decision::Short);
        assert_eq!(mr().evaluate(&reversion_snap(96.0, 10.0)), Decision::Long);
        assert_eq!(mr().evaluate(&reversion_snap(101.0, 10.0)), Decision::None);
    }

    #[test]
    fn regime_filter_blocks_both_trend_tiers() {
        assert_eq!(mr().evaluate(&reversion_snap(104.0, 25.0)), Decision::None);
        assert_eq!(mr().evaluate(&reversion_snap(104.0, 45.0)), Decision::None);
        assert_eq!(mr().evaluate(&reversion_snap(96.0, 20.0)), Decision::None);
    }

    #[test]
    fn halt_wins_over_bands() {
        let snap = MarketSnapshot { halted: true, ..reversion_snap(104.0, 10.0) };
        assert_eq!(mr().evaluate(&snap), Decision::None);
    }

    #[test]
    fn warming_indicators_mean_none() {
        let mut snap = reversion_snap(104.0, 10.0);
        snap.trend_strength = Reading::NotReady;
        assert_eq!(mr().evaluate(&snap), Decision::None);
        let mut snap = reversion_snap(104.0, 10.0);
        snap.bands = Reading::NotReady;
        assert_eq!(mr().evaluate(&snap), Decision::None);
        let mut snap = reversion_snap(104.0, 10.0);
        snap.last_trade = None;
        assert_eq!(mr().evaluate(&snap), Decision::None);
    }

    #[test]
    fn evaluation_is_repeatable() {
        let policy = Policy::MeanReversion(mr());
        let snap = reversion_snap(104.0, 10.0);
        let first = policy.evaluate(&snap);
        for _ in 0..100 {
            assert_eq!(policy.evaluate(&snap), first);
        }
        assert_eq!(policy.kind(), StrategyKind::MeanReversion);
    }

    #[test]
    fn settings_select_policy() {
        let mut s = crate::config::test_settings();
        s.args.strategy = StrategyKind::Imbalance;
        assert_eq!(Policy::from_settings(&s).kind(), StrategyKind::Imbalance);
    }
}
