// ===============================
// src/indicators.rs
// ===============================
//
// Indicator bank. Every calculator consumes one observation at a time and
// keeps only what its window needs:
//   Vwap             running sums since the last session reset
//   TrendStrength    ADX-style, window of P true-range / DM samples + P DX values
//   DeviationBands   window of (price - vwap) deviations, VWAP +/- k*sigma,
//                    held back until the session has seen `warmup` trades
//   VolatilityMonitor (price, ts) buffer over a short lookback, halts on a jump
//
// Invalid observations are dropped (state untouched) and counted.
//
use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::domain::{Candle, MarketEvent, Reading, TradePrint};
use crate::ingest::EventSink;
use crate::metrics::DISCARDED;
use crate::snapshot::{Bands, SharedSnapshot};

fn discard(calculator: &str, reason: &str) {
    DISCARDED.with_label_values(&[calculator, reason]).inc();
}

fn positive(x: f64) -> bool { x.is_finite() && x > 0.0 }

fn push_bounded<T>(win: &mut VecDeque<T>, cap: usize, v: T) {
    if win.len() == cap {
        win.pop_front();
    }
    win.push_back(v);
}

// -----------------------------------------------------------------------------
// VWAP
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Default)]
pub struct Vwap {
    pv_sum: f64,
    vol_sum: f64,
    trades: u64,
}

impl Vwap {
    pub fn new() -> Self { Self::default() }

    pub fn update(&mut self, price: f64, qty: f64) -> Reading<f64> {
        if !positive(price) || !positive(qty) {
            warn!(price, qty, "vwap: non-positive trade discarded");
            discard("vwap", "non_positive");
            return self.current();
        }
        self.pv_sum += price * qty;
        self.vol_sum += qty;
        self.trades += 1;
        self.current()
    }

    pub fn current(&self) -> Reading<f64> {
        if self.vol_sum > 0.0 { Reading::Ready(self.pv_sum / self.vol_sum) } else { Reading::NotReady }
    }

    pub fn trades(&self) -> u64 { self.trades }

    /// Session boundary: both sums go to zero in one assignment.
    pub fn reset(&mut self) { *self = Vwap::default(); }
}

// -----------------------------------------------------------------------------
// TREND STRENGTH (ADX-style)
//   TR, +DM, -DM from consecutive closed candles, summed over the last P
//   samples -> +DI/-DI -> DX. ADX = mean of the last P DX values.
//   Ready only after P TR samples AND P DX values (2*P candles).
// -----------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct TrendStrength {
    period: usize,
    prev: Option<Candle>,
    tr: VecDeque<f64>,
    plus_dm: VecDeque<f64>,
    minus_dm: VecDeque<f64>,
    dx: VecDeque<f64>,
}

impl TrendStrength {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            prev: None,
            tr: VecDeque::with_capacity(period),
            plus_dm: VecDeque::with_capacity(period),
            minus_dm: VecDeque::with_capacity(period),
            dx: VecDeque::with_capacity(period),
        }
    }

    pub fn update(&mut self, c: Candle) -> Reading<f64> {
        if !c.closed {
            return self.current();
        }
        if !positive(c.high) || !positive(c.low) || !positive(c.close) || c.high < c.low {
            warn!(high = c.high, low = c.low, close = c.close, "trend: invalid candle discarded");
            discard("trend_strength", "invalid_candle");
            return self.current();
        }
        let prev = match self.prev.replace(c) {
            Some(p) => p,
            None => return Reading::NotReady,
        };

        let tr = (c.high - c.low)
            .max((c.high - prev.close).abs())
            .max((c.low - prev.close).abs());
        let up = c.high - prev.high;
        let down = prev.low - c.low;
        let pdm = if up > down && up > 0.0 { up } else { 0.0 };
        let mdm = if down > up && down > 0.0 { down } else { 0.0 };

        push_bounded(&mut self.tr, self.period, tr);
        push_bounded(&mut self.plus_dm, self.period, pdm);
        push_bounded(&mut self.minus_dm, self.period, mdm);

        if self.tr.len() < self.period {
            return Reading::NotReady;
        }

        let tr_sum: f64 = self.tr.iter().sum();
        let dx = if tr_sum > 0.0 {
            let pdi = 100.0 * self.plus_dm.iter().sum::<f64>() / tr_sum;
            let mdi = 100.0 * self.minus_dm.iter().sum::<f64>() / tr_sum;
            let di_sum = pdi + mdi;
            if di_sum > 0.0 { 100.0 * (pdi - mdi).abs() / di_sum } else { 0.0 }
        } else {
            0.0
        };
        push_bounded(&mut self.dx, self.period, dx);
        self.current()
    }

    pub fn current(&self) -> Reading<f64> {
        if self.tr.len() < self.period || self.dx.len() < self.period {
            return Reading::NotReady;
        }
        let adx = self.dx.iter().sum::<f64>() / self.dx.len() as f64;
        Reading::Ready(adx.clamp(0.0, 100.0))
    }
}

// -----------------------------------------------------------------------------
// DEVIATION BANDS
// -----------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct DeviationBands {
    window: usize,
    k: f64,
    /// Trades the session must see before the bands count as ready.
    warmup: u64,
    seen: u64,
    devs: VecDeque<f64>,
    last: Reading<Bands>,
}

impl DeviationBands {
    pub fn new(window: usize, k: f64, warmup: u64) -> Self {
        let window = window.max(2);
        Self { window, k: k.abs(), warmup, seen: 0, devs: VecDeque::with_capacity(window), last: Reading::NotReady }
    }

    pub fn update(&mut self, price: f64, vwap: f64) -> Reading<Bands> {
        if !positive(price) || !positive(vwap) {
            discard("bands", "non_positive");
            return self.last;
        }
        self.seen += 1;
        push_bounded(&mut self.devs, self.window, price - vwap);
        if self.devs.len() < 2 || self.seen < self.warmup {
            return Reading::NotReady;
        }
        let n = self.devs.len() as f64;
        let mean = self.devs.iter().sum::<f64>() / n;
        let var = self.devs.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n;
        let sigma = var.max(0.0).sqrt();
        self.last = Reading::Ready(Bands { upper: vwap + self.k * sigma, lower: vwap - self.k * sigma, sigma });
        self.last
    }

    pub fn current(&self) -> Reading<Bands> { self.last }

    pub fn reset(&mut self) {
        self.devs.clear();
        self.seen = 0;
        self.last = Reading::NotReady;
    }
}

// -----------------------------------------------------------------------------
// VOLATILITY MONITOR
//   Buffer is insertion-ordered. The anchor is the newest sample at or before
//   now - lookback; anything older than the anchor is pruned. Past the cap the
//   buffer is thinned right behind the oldest sample, which is never evicted.
// -----------------------------------------------------------------------------
const VOL_BUFFER_CAP: usize = 4096;

#[derive(Debug, Clone)]
pub struct VolatilityMonitor {
    threshold: f64,
    lookback: ChronoDuration,
    halt_for: ChronoDuration,
    buf: VecDeque<(f64, DateTime<Utc>)>,
    halt_until: Option<DateTime<Utc>>,
}

impl VolatilityMonitor {
    pub fn new(threshold: f64, lookback: std::time::Duration, halt_for: std::time::Duration) -> Self {
        Self {
            threshold,
            lookback: ChronoDuration::from_std(lookback).unwrap_or_else(|_| ChronoDuration::seconds(5)),
            halt_for: ChronoDuration::from_std(halt_for).unwrap_or_else(|_| ChronoDuration::seconds(600)),
            buf: VecDeque::new(),
            halt_until: None,
        }
    }

    /// Relative change against the lookback anchor; `NotReady` until an anchor exists.
    pub fn update(&mut self, price: f64, ts: DateTime<Utc>) -> Reading<f64> {
        if !positive(price) {
            discard("volatility", "non_positive");
            return Reading::NotReady;
        }
        self.buf.push_back((price, ts));

        let cutoff = ts - self.lookback;
        while self.buf.len() >= 2 && self.buf[1].1 <= cutoff {
            self.buf.pop_front();
        }
        while self.buf.len() > VOL_BUFFER_CAP {
            self.buf.remove(1);
        }
        let anchor = self.buf.iter().rev().find(|(_, t)| *t <= cutoff).map(|(p, _)| *p);
        let change = match anchor {
            Some(p0) => (price - p0).abs() / p0,
            None => return Reading::NotReady,
        };

        if change >= self.threshold && !self.is_halted(ts) {
            let until = ts + self.halt_for;
            info!(change, threshold = self.threshold, %until, "volatility halt");
            self.halt_until = Some(until);
        }
        Reading::Ready(change)
    }

    /// Clears itself once `now` reaches the wake time.
    pub fn is_halted(&mut self, now: DateTime<Utc>) -> bool {
        match self.halt_until {
            Some(until) if now < until => true,
            Some(_) => {
                self.halt_until = None;
                false
            }
            None => false,
        }
    }

    pub fn halt_until(&self) -> Option<DateTime<Utc>> { self.halt_until }
}

// -----------------------------------------------------------------------------
// BANK: routes normalized events to the calculators and publishes results
// -----------------------------------------------------------------------------
pub struct IndicatorBank {
    vwap: Mutex<Vwap>,
    bands: Mutex<DeviationBands>,
    trend: Mutex<TrendStrength>,
    volatility: Mutex<VolatilityMonitor>,
    snapshot: Arc<SharedSnapshot>,
}

impl IndicatorBank {
    pub fn new(
        vwap: Vwap,
        bands: DeviationBands,
        trend: TrendStrength,
        volatility: VolatilityMonitor,
        snapshot: Arc<SharedSnapshot>,
    ) -> Self {
        Self {
            vwap: Mutex::new(vwap),
            bands: Mutex::new(bands),
            trend: Mutex::new(trend),
            volatility: Mutex::new(volatility),
            snapshot,
        }
    }

    pub fn from_settings(s: &Settings, snapshot: Arc<SharedSnapshot>) -> Self {
        Self::new(
            Vwap::new(),
            DeviationBands::new(s.reversion.band_window, s.reversion.band_multiplier, s.reversion.warmup_trades),
            TrendStrength::new(s.reversion.adx_period),
            VolatilityMonitor::new(s.volatility.threshold, s.volatility.lookback, s.volatility.halt),
            snapshot,
        )
    }

    pub fn on_trade(&self, t: &TradePrint) {
        if !positive(t.price) || !positive(t.qty) {
            warn!(price = t.price, qty = t.qty, "trade discarded");
            discard("trade", "non_positive");
            return;
        }
        // vwap stays locked until both readings are published, so a session
        // reset lands between trades. Lock order: vwap -> bands.
        {
            let mut acc = self.vwap.lock();
            let vwap = acc.update(t.price, t.qty);
            self.snapshot.set_vwap(vwap);
            if let Reading::Ready(v) = vwap {
                let bands = self.bands.lock().update(t.price, v);
                self.snapshot.set_bands(bands);
            }
        }
        let halt_until = {
            let mut vol = self.volatility.lock();
            vol.update(t.price, t.ts);
            vol.halt_until()
        };
        self.snapshot.set_halt_until(halt_until);
        self.snapshot.set_last_trade(t.price);
    }

    pub fn on_candle(&self, c: &Candle) {
        let reading = self.trend.lock().update(*c);
        if c.closed {
            debug!(?reading, close = c.close, "closed candle");
        }
        self.snapshot.set_trend(reading);
    }

    /// Daily boundary: VWAP sums and the deviation window start over.
    pub fn reset_session(&self) {
        let trades = {
            let mut acc = self.vwap.lock();
            let n = acc.trades();
            acc.reset();
            self.bands.lock().reset();
            self.snapshot.set_vwap(Reading::NotReady);
            self.snapshot.set_bands(Reading::NotReady);
            n
        };
        info!(trades, "vwap session reset");
    }

    /// Replay closed historical candles so trend strength is ready at startup.
    pub fn warm_trend(&self, candles: &[Candle]) -> Reading<f64> {
        let reading = {
            let mut trend = self.trend.lock();
            for c in candles {
                trend.update(*c);
            }
            trend.current()
        };
        self.snapshot.set_trend(reading);
        info!(candles = candles.len(), ?reading, "trend strength warmed from history");
        reading
    }

    #[cfg(test)]
    pub fn vwap(&self) -> Reading<f64> { self.vwap.lock().current() }
}

impl EventSink for IndicatorBank {
    fn apply(&self, ev: MarketEvent) {
        match ev {
            MarketEvent::Depth(book) => self.snapshot.set_book(book),
            MarketEvent::Trade(t) => self.on_trade(&t),
            MarketEvent::Candle(c) => self.on_candle(&c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn candle(high: f64, low: f64, close: f64) -> Candle { Candle { high, low, close, closed: true } }

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn vwap_matches_independent_ratio() {
        let trades = [(100.0, 2.0), (101.5, 0.5), (99.25, 3.0), (100.75, 1.25), (102.0, 0.1)];
        let mut v = Vwap::new();
        for (p, q) in trades {
            v.update(p, q);
        }
        let pv: f64 = trades.iter().map(|(p, q)| p * q).sum();
        let vol: f64 = trades.iter().map(|(_, q)| q).sum();
        let got = v.current().ready().unwrap();
        assert!((got - pv / vol).abs() < 1e-9);
    }

    #[test]
    fn vwap_not_ready_without_volume_and_after_reset() {
        let mut v = Vwap::new();
        assert_eq!(v.current(), Reading::NotReady);
        assert_eq!(v.update(100.0, 0.0), Reading::NotReady);
        assert_eq!(v.update(-1.0, 1.0), Reading::NotReady);
        v.update(100.0, 1.0);
        assert!(v.current().is_ready());
        v.reset();
        assert_eq!(v.current(), Reading::NotReady);
        assert_eq!(v.trades(), 0);
    }

    fn wavy_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.7).sin() * 3.0 + i as f64 * 0.2;
                candle(base + 1.0, base - 1.0, base + 0.3)
            })
            .collect()
    }

    #[test]
    fn trend_needs_two_periods_of_candles() {
        let period = 14;
        let candles = wavy_candles(3 * period);
        let mut t = TrendStrength::new(period);
        for (i, c) in candles.iter().enumerate() {
            let r = t.update(*c);
            let seen = i + 1;
            if seen < 2 * period {
                assert_eq!(r, Reading::NotReady, "ready too early at {seen}");
            } else {
                let v = r.ready().unwrap_or_else(|| panic!("not ready at {seen}"));
                assert!((0.0..=100.0).contains(&v));
            }
        }
    }

    #[test]
    fn trend_ignores_open_and_invalid_candles() {
        let mut t = TrendStrength::new(2);
        for c in wavy_candles(4) {
            t.update(c);
        }
        let before = t.current();
        assert!(before.is_ready());
        t.update(Candle { high: 500.0, low: 1.0, close: 2.0, closed: false });
        t.update(candle(90.0, 95.0, 92.0));
        t.update(candle(-1.0, -2.0, -1.5));
        assert_eq!(t.current(), before);
    }

    #[test]
    fn flat_market_reads_zero_not_not_ready() {
        let mut t = TrendStrength::new(3);
        let mut last = Reading::NotReady;
        for _ in 0..6 {
            last = t.update(candle(100.0, 100.0, 100.0));
        }
        assert_eq!(last, Reading::Ready(0.0));
    }

    #[test]
    fn steady_uptrend_reads_strong() {
        let mut t = TrendStrength::new(5);
        let mut last = Reading::NotReady;
        for i in 0..20 {
            let b = 100.0 + i as f64 * 2.0;
            last = t.update(candle(b + 1.0, b - 1.0, b + 0.5));
        }
        assert!(last.ready().unwrap() > 90.0);
    }

    #[test]
    fn bands_bracket_vwap_and_collapse_with_no_dispersion() {
        let mut b = DeviationBands::new(20, 2.0, 0);
        assert_eq!(b.update(101.0, 100.0), Reading::NotReady);
        for (p, v) in [(99.0, 100.0), (102.0, 100.5), (98.5, 100.2), (100.1, 100.0)] {
            let bands = b.update(p, v).ready().unwrap();
            assert!(bands.lower <= v && v <= bands.upper);
        }

        let mut flat = DeviationBands::new(5, 1.5, 0);
        let mut last = Reading::NotReady;
        for _ in 0..5 {
            last = flat.update(101.0, 100.0);
        }
        let bands = last.ready().unwrap();
        assert!(bands.sigma.abs() < 1e-12);
        assert!((bands.upper - 100.0).abs() < 1e-9 && (bands.lower - 100.0).abs() < 1e-9);
    }

    #[test]
    fn bands_wait_for_session_warmup() {
        let mut b = DeviationBands::new(20, 1.5, 100);
        for i in 0..99 {
            assert_eq!(b.update(100.0 + (i % 3) as f64, 100.0), Reading::NotReady);
        }
        assert!(b.update(101.0, 100.0).is_ready());
        // a new session warms up again
        b.reset();
        assert_eq!(b.update(101.0, 100.0), Reading::NotReady);
        assert_eq!(b.update(99.0, 100.0), Reading::NotReady);
    }

    #[test]
    fn bands_window_is_bounded() {
        let mut b = DeviationBands::new(3, 1.0, 0);
        for i in 0..50 {
            b.update(100.0 + (i % 7) as f64, 100.0);
        }
        assert_eq!(b.devs.len(), 3);
    }

    fn monitor() -> VolatilityMonitor {
        VolatilityMonitor::new(0.0015, Duration::from_secs(5), Duration::from_secs(600))
    }

    #[test]
    fn jump_of_exactly_threshold_halts() {
        let mut m = monitor();
        m.update(1000.0, ts(0));
        let change = m.update(1001.5, ts(5)).ready().unwrap();
        assert_eq!(change, 0.0015);
        assert!(m.is_halted(ts(5)));
        assert_eq!(m.halt_until(), Some(ts(605)));
    }

    #[test]
    fn jump_just_under_threshold_does_not_halt() {
        let mut m = monitor();
        m.update(1000.0, ts(0));
        m.update(1001.49, ts(5));
        assert!(!m.is_halted(ts(5)));
    }

    #[test]
    fn halt_clears_on_query_after_wake_time() {
        let mut m = monitor();
        m.update(1000.0, ts(0));
        m.update(1010.0, ts(5));
        // updates keep flowing while halted
        m.update(1011.0, ts(100));
        assert!(m.is_halted(ts(604)));
        assert!(!m.is_halted(ts(605)));
        assert!(!m.is_halted(ts(605)));
        assert_eq!(m.halt_until(), None);
    }

    #[test]
    fn no_anchor_inside_lookback_is_not_ready() {
        let mut m = monitor();
        m.update(1000.0, ts(0));
        assert_eq!(m.update(1100.0, ts(2)), Reading::NotReady);
        assert!(!m.is_halted(ts(2)));
    }

    #[test]
    fn buffer_is_pruned_to_lookback() {
        let mut m = monitor();
        for s in 0..1000 {
            m.update(1000.0, ts(s));
        }
        // anchor at now-5s plus the five newer samples
        assert_eq!(m.buf.len(), 6);
    }

    #[test]
    fn burst_beyond_buffer_cap_keeps_the_anchor() {
        let mut m = monitor();
        let t0 = ts(0);
        for i in 0..5000 {
            m.update(1000.0, t0 + ChronoDuration::milliseconds(i));
        }
        assert!(m.buf.len() <= VOL_BUFFER_CAP);
        let change = m.update(1010.0, t0 + ChronoDuration::seconds(5)).ready();
        assert_eq!(change, Some(0.01));
        assert!(m.is_halted(t0 + ChronoDuration::seconds(5)));
    }

    #[test]
    fn stale_timestamp_is_appended_not_reordered() {
        let mut m = monitor();
        m.update(1000.0, ts(10));
        m.update(1000.0, ts(4));
        assert_eq!(m.buf.back().map(|(_, t)| *t), Some(ts(4)));
    }

    #[test]
    fn bank_publishes_to_snapshot_and_resets_session() {
        let snapshot = Arc::new(SharedSnapshot::new());
        let bank = IndicatorBank::new(
            Vwap::new(),
            DeviationBands::new(5, 1.5, 0),
            TrendStrength::new(2),
            monitor(),
            snapshot.clone(),
        );
        for (i, (p, q)) in [(100.0, 1.0), (102.0, 1.0), (101.0, 2.0)].into_iter().enumerate() {
            bank.apply(MarketEvent::Trade(TradePrint { price: p, qty: q, ts: ts(i as i64) }));
        }
        let view = snapshot.view(ts(3));
        assert_eq!(view.vwap, Reading::Ready(101.0));
        assert!(view.bands.is_ready());
        assert_eq!(view.last_trade, Some(101.0));

        bank.reset_session();
        let view = snapshot.view(ts(3));
        assert_eq!(view.vwap, Reading::NotReady);
        assert_eq!(view.bands, Reading::NotReady);
        assert_eq!(bank.vwap(), Reading::NotReady);
    }

    #[test]
    fn snapshot_agrees_with_accumulator_after_racing_resets() {
        let snapshot = Arc::new(SharedSnapshot::new());
        let bank = IndicatorBank::new(Vwap::new(), DeviationBands::new(5, 1.5, 0), TrendStrength::new(2), monitor(), snapshot.clone());
        for round in 0..50 {
            std::thread::scope(|s| {
                s.spawn(|| {
                    for i in 0..200 {
                        bank.on_trade(&TradePrint { price: 100.0 + (i % 5) as f64, qty: 1.0, ts: ts(round) });
                    }
                });
                s.spawn(|| {
                    for _ in 0..20 {
                        bank.reset_session();
                    }
                });
            });
            let view = snapshot.view(ts(round));
            assert_eq!(view.vwap, bank.vwap());
            assert_eq!(view.bands, bank.bands.lock().current());
        }
    }

    #[test]
    fn history_replay_makes_trend_ready() {
        let snapshot = Arc::new(SharedSnapshot::new());
        let bank = IndicatorBank::new(Vwap::new(), DeviationBands::new(5, 1.5, 0), TrendStrength::new(14), monitor(), snapshot.clone());
        assert_eq!(bank.warm_trend(&wavy_candles(27)), Reading::NotReady);

        let bank = IndicatorBank::new(Vwap::new(), DeviationBands::new(5, 1.5, 0), TrendStrength::new(14), monitor(), snapshot.clone());
        let reading = bank.warm_trend(&wavy_candles(30));
        assert!(reading.is_ready());
        assert_eq!(snapshot.view(ts(0)).trend_strength, reading);
    }

    #[test]
    fn bank_drops_invalid_trade_without_touching_state() {
        let snapshot = Arc::new(SharedSnapshot::new());
        let bank = IndicatorBank::new(Vwap::new(), DeviationBands::new(5, 1.5, 0), TrendStrength::new(2), monitor(), snapshot.clone());
        bank.on_trade(&TradePrint { price: 0.0, qty: 1.0, ts: ts(0) });
        assert_eq!(bank.vwap(), Reading::NotReady);
        assert_eq!(snapshot.view(ts(0)).last_trade, None);
    }
}
