// ===============================
// src/store.rs
// ===============================
//
// Durable order / position / trade store, split over two files:
//   <state>.json          pending orders + active positions, keyed by order id
//   <state>.trades.jsonl  closed trades, one JSON line each, append-only
//
// Open-book mutations run under the store lock against a copy of the book,
// write the copy (tmp file + fsync + rename), and only then swap it in. A
// failed write leaves both memory and disk at the previous state.
//
// A close commits when its journal line is synced. The state rewrite that
// follows only trims the book; if it fails, or the process dies first, the
// next open drops every active row the journal already holds, so a position
// is never both active and closed.
//
// Calls block on file IO; async callers go through `spawn_blocking`.
//
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{ClosedTrade, ExitReason, Order, OrderState, Position, StrategyKind};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file io: {0}")]
    Io(#[from] std::io::Error),
    #[error("state file format: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unknown order {0}")]
    UnknownOrder(String),
    #[error("order {order_id}: illegal transition {from:?} -> {to:?}")]
    InvalidTransition { order_id: String, from: OrderState, to: OrderState },
    #[error("{symbol}/{strategy} already holds open order {existing}")]
    DuplicateActive { symbol: String, strategy: StrategyKind, existing: String },
}

impl StoreError {
    /// Failures of the medium rather than of the request; worth retrying.
    pub fn is_io(&self) -> bool { matches!(self, StoreError::Io(_) | StoreError::Serde(_)) }
}

/// Open book: what the state file holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    pub pending: BTreeMap<String, Order>,
    pub active: BTreeMap<String, Position>,
}

impl Ledger {
    /// Order currently holding the (symbol, strategy) slot, pending or active.
    pub fn slot_holder(&self, symbol: &str, strategy: StrategyKind) -> Option<&str> {
        self.pending
            .values()
            .find(|o| o.symbol == symbol && o.strategy == strategy)
            .map(|o| o.id.as_str())
            .or_else(|| {
                self.active
                    .values()
                    .find(|p| p.symbol == symbol && p.strategy == strategy)
                    .map(|p| p.order_id.as_str())
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Accepted,
    DuplicateSuppressed { existing: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Summary {
    pub trades: usize,
    pub wins: usize,
    pub realized_pnl: f64,
}

impl Summary {
    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 { 0.0 } else { self.wins as f64 / self.trades as f64 }
    }

    fn add(&mut self, t: &ClosedTrade) {
        self.trades += 1;
        self.realized_pnl += t.pnl;
        if t.pnl > 0.0 {
            self.wins += 1;
        }
    }
}

#[derive(Debug, Default)]
struct Book {
    open: Ledger,
    closed: Vec<ClosedTrade>,
    summary: Summary,
}

impl Book {
    fn state_of(&self, order_id: &str) -> Option<OrderState> {
        if self.open.pending.contains_key(order_id) {
            Some(OrderState::Pending)
        } else if self.open.active.contains_key(order_id) {
            Some(OrderState::Active)
        } else if self.closed.iter().any(|t| t.order_id == order_id) {
            Some(OrderState::Closed)
        } else {
            None
        }
    }

    fn transition_error(&self, order_id: &str, to: OrderState) -> StoreError {
        match self.state_of(order_id) {
            Some(from) => StoreError::InvalidTransition { order_id: order_id.to_string(), from, to },
            None => StoreError::UnknownOrder(order_id.to_string()),
        }
    }
}

/// Where the closed-trade journal of a state file lives.
pub fn journal_path(state: &Path) -> PathBuf { state.with_extension("trades.jsonl") }

pub struct Store {
    path: Option<PathBuf>,
    journal: Option<PathBuf>,
    book: Mutex<Book>,
}

impl Store {
    /// Open (or create) the state file and trade journal and load what they hold.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut open: Ledger = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(|b| b.is_ascii_whitespace()) => Ledger::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == ErrorKind::NotFound => Ledger::default(),
            Err(e) => return Err(e.into()),
        };
        let journal = journal_path(&path);
        let closed = Self::read_journal(&journal)?;

        let settled: Vec<String> =
            open.active.keys().filter(|id| closed.iter().any(|t| &t.order_id == *id)).cloned().collect();
        if !settled.is_empty() {
            warn!(orders = ?settled, "closes found in the trade journal, dropping them from the open book");
            for id in &settled {
                open.active.remove(id);
            }
            Self::write_file(&path, &open)?;
        }

        let mut summary = Summary::default();
        closed.iter().for_each(|t| summary.add(t));
        info!(
            path = %path.display(),
            pending = open.pending.len(),
            active = open.active.len(),
            closed = closed.len(),
            "state loaded"
        );
        Ok(Self { path: Some(path), journal: Some(journal), book: Mutex::new(Book { open, closed, summary }) })
    }

    #[cfg(test)]
    pub fn in_memory() -> Self { Self { path: None, journal: None, book: Mutex::new(Book::default()) } }

    fn read_journal(path: &Path) -> Result<Vec<ClosedTrade>, StoreError> {
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut trades = Vec::new();
        for (n, line) in text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
            match serde_json::from_str::<ClosedTrade>(line) {
                Ok(t) => trades.push(t),
                Err(e) => warn!(line = n + 1, error = %e, "unreadable trade journal line skipped"),
            }
        }
        // a torn last line must not swallow the next append
        if !text.is_empty() && !text.ends_with('\n') {
            OpenOptions::new().append(true).open(path)?.write_all(b"\n")?;
        }
        Ok(trades)
    }

    fn append_trade(path: &Path, trade: &ClosedTrade) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(trade)?;
        line.push(b'\n');
        let mut f = OpenOptions::new().create(true).append(true).open(path)?;
        f.write_all(&line)?;
        f.sync_data()?;
        Ok(())
    }

    fn write_file(path: &Path, ledger: &Ledger) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(ledger)?;
        let tmp = path.with_extension("tmp");
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Apply `f` to a copy of the open book, persist the copy, then publish it.
    fn mutate<T>(&self, f: impl FnOnce(&mut Ledger, &Book) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut book = self.book.lock();
        let mut next = book.open.clone();
        let out = f(&mut next, &book)?;
        if next == book.open {
            return Ok(out);
        }
        if let Some(path) = &self.path {
            Self::write_file(path, &next)?;
        }
        book.open = next;
        Ok(out)
    }

    /// Check-then-insert under one lock: the (symbol, strategy) slot must be free.
    pub fn try_insert_pending(&self, order: Order) -> Result<Admission, StoreError> {
        self.mutate(|l, book| {
            if let Some(existing) = l.slot_holder(&order.symbol, order.strategy) {
                return Ok(Admission::DuplicateSuppressed { existing: existing.to_string() });
            }
            if let Some(from) = book.state_of(&order.id) {
                return Err(StoreError::InvalidTransition { order_id: order.id.clone(), from, to: OrderState::Pending });
            }
            debug!(order_id = %order.id, "pending stored");
            let mut order = order;
            order.state = OrderState::Pending;
            l.pending.insert(order.id.clone(), order);
            Ok(Admission::Accepted)
        })
    }

    /// PENDING -> ACTIVE at the confirmed fill.
    pub fn promote(&self, order_id: &str, entry_px: f64, qty: f64, at: DateTime<Utc>) -> Result<Position, StoreError> {
        self.mutate(|l, book| {
            let order = match l.pending.remove(order_id) {
                Some(o) => o,
                None => return Err(book.transition_error(order_id, OrderState::Active)),
            };
            if let Some(p) = l.active.values().find(|p| p.symbol == order.symbol && p.strategy == order.strategy) {
                return Err(StoreError::DuplicateActive {
                    symbol: order.symbol.clone(),
                    strategy: order.strategy,
                    existing: p.order_id.clone(),
                });
            }
            let pos = Position {
                order_id: order.id.clone(),
                symbol: order.symbol,
                side: order.side,
                entry_px,
                qty,
                strategy: order.strategy,
                reference_px: order.reference_px,
                opened_at: at,
            };
            l.active.insert(pos.order_id.clone(), pos.clone());
            Ok(pos)
        })
    }

    /// Remove a PENDING order that never filled (cancelled, expired, rejected).
    pub fn drop_pending(&self, order_id: &str) -> Result<Order, StoreError> {
        self.mutate(|l, book| l.pending.remove(order_id).ok_or_else(|| book.transition_error(order_id, OrderState::Closed)))
    }

    /// ACTIVE -> CLOSED: journal the trade, then drop the position from the book.
    pub fn close(&self, order_id: &str, exit_px: f64, reason: ExitReason, at: DateTime<Utc>) -> Result<ClosedTrade, StoreError> {
        let mut book = self.book.lock();
        let pos = match book.open.active.get(order_id) {
            Some(p) => p.clone(),
            None => return Err(book.transition_error(order_id, OrderState::Closed)),
        };
        let trade = ClosedTrade {
            order_id: pos.order_id.clone(),
            symbol: pos.symbol.clone(),
            side: pos.side,
            strategy: pos.strategy,
            entry_px: pos.entry_px,
            exit_px,
            qty: pos.qty,
            pnl: pos.pnl_at(exit_px),
            reason,
            closed_at: at,
        };
        if let Some(journal) = &self.journal {
            Self::append_trade(journal, &trade)?;
        }

        let mut next = book.open.clone();
        next.active.remove(order_id);
        if let Some(path) = &self.path {
            if let Err(e) = Self::write_file(path, &next) {
                // committed already; the next open settles the stale row
                warn!(order_id, error = %e, "state rewrite after close failed");
            }
        }
        book.open = next;
        book.summary.add(&trade);
        book.closed.push(trade.clone());
        Ok(trade)
    }

    pub fn slot_holder(&self, symbol: &str, strategy: StrategyKind) -> Option<String> {
        self.book.lock().open.slot_holder(symbol, strategy).map(str::to_string)
    }

    #[cfg(test)]
    pub fn order_state(&self, order_id: &str) -> Option<OrderState> { self.book.lock().state_of(order_id) }

    pub fn pending(&self) -> Vec<Order> { self.book.lock().open.pending.values().cloned().collect() }
    pub fn active(&self) -> Vec<Position> { self.book.lock().open.active.values().cloned().collect() }

    #[cfg(test)]
    pub fn closed(&self) -> Vec<ClosedTrade> { self.book.lock().closed.clone() }

    pub fn summary(&self) -> Summary { self.book.lock().summary }

    /// Rewrite the open book; used once at shutdown.
    pub fn flush(&self) -> Result<(), StoreError> {
        let book = self.book.lock();
        if let Some(path) = &self.path {
            Self::write_file(path, &book.open)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;

    fn order(id: &str, strategy: StrategyKind) -> Order {
        Order {
            id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            qty: 0.2,
            price: 100.0,
            state: OrderState::Pending,
            strategy,
            reference_px: 100.2,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn second_entry_for_same_slot_is_suppressed() {
        let store = Store::in_memory();
        assert_eq!(store.try_insert_pending(order("1", StrategyKind::MeanReversion)).unwrap(), Admission::Accepted);
        assert_eq!(
            store.try_insert_pending(order("2", StrategyKind::MeanReversion)).unwrap(),
            Admission::DuplicateSuppressed { existing: "1".into() }
        );
        // other strategy has its own slot
        assert_eq!(store.try_insert_pending(order("3", StrategyKind::Imbalance)).unwrap(), Admission::Accepted);
        assert_eq!(store.pending().len(), 2);

        // still blocked once active
        store.promote("1", 100.0, 0.2, Utc::now()).unwrap();
        assert!(matches!(
            store.try_insert_pending(order("4", StrategyKind::MeanReversion)).unwrap(),
            Admission::DuplicateSuppressed { .. }
        ));
        // free after close
        store.close("1", 101.0, ExitReason::ProfitTarget, Utc::now()).unwrap();
        assert_eq!(store.try_insert_pending(order("5", StrategyKind::MeanReversion)).unwrap(), Admission::Accepted);
    }

    #[test]
    fn lifecycle_is_linear() {
        let store = Store::in_memory();
        store.try_insert_pending(order("1", StrategyKind::Imbalance)).unwrap();
        assert!(matches!(
            store.close("1", 100.0, ExitReason::Manual, Utc::now()),
            Err(StoreError::InvalidTransition { from: OrderState::Pending, to: OrderState::Closed, .. })
        ));
        store.promote("1", 100.0, 0.2, Utc::now()).unwrap();
        assert!(matches!(
            store.promote("1", 100.0, 0.2, Utc::now()),
            Err(StoreError::InvalidTransition { from: OrderState::Active, to: OrderState::Active, .. })
        ));
        let trade = store.close("1", 99.0, ExitReason::StopLoss, Utc::now()).unwrap();
        assert!((trade.pnl - (-0.2)).abs() < 1e-9);
        assert_eq!(store.order_state("1"), Some(OrderState::Closed));
        assert!(matches!(
            store.close("1", 99.0, ExitReason::StopLoss, Utc::now()),
            Err(StoreError::InvalidTransition { from: OrderState::Closed, .. })
        ));
        assert!(matches!(store.promote("zzz", 1.0, 1.0, Utc::now()), Err(StoreError::UnknownOrder(_))));
        // reusing a closed id is rejected, not overwritten
        assert!(matches!(
            store.try_insert_pending(order("1", StrategyKind::Imbalance)),
            Err(StoreError::InvalidTransition { from: OrderState::Closed, .. })
        ));
    }

    #[test]
    fn reload_restores_open_book() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        {
            let store = Store::open(&path).unwrap();
            store.try_insert_pending(order("p", StrategyKind::Imbalance)).unwrap();
            store.try_insert_pending(order("a", StrategyKind::MeanReversion)).unwrap();
            store.promote("a", 100.0, 0.2, Utc::now()).unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.order_state("p"), Some(OrderState::Pending));
        assert_eq!(store.order_state("a"), Some(OrderState::Active));
        // reloaded rows keep blocking their slots
        assert_eq!(store.slot_holder("BTCUSDT", StrategyKind::MeanReversion).as_deref(), Some("a"));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn failed_write_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = Store::open(&path).unwrap();
        store.try_insert_pending(order("1", StrategyKind::Imbalance)).unwrap();
        store.promote("1", 100.0, 0.2, Utc::now()).unwrap();

        dir.close().unwrap();
        let err = store.close("1", 101.0, ExitReason::ProfitTarget, Utc::now()).unwrap_err();
        assert!(err.is_io());
        assert_eq!(store.order_state("1"), Some(OrderState::Active));
        assert!(store.closed().is_empty());
    }

    #[test]
    fn summary_from_closed_ledger() {
        let store = Store::in_memory();
        for (id, exit) in [("1", 101.0), ("2", 99.0), ("3", 102.0)] {
            store.try_insert_pending(order(id, StrategyKind::Imbalance)).unwrap();
            store.promote(id, 100.0, 1.0, Utc::now()).unwrap();
            store.close(id, exit, ExitReason::Manual, Utc::now()).unwrap();
        }
        let s = store.summary();
        assert_eq!(s.trades, 3);
        assert_eq!(s.wins, 2);
        assert!((s.realized_pnl - 2.0).abs() < 1e-9);
        assert!((s.win_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn closed_trades_go_to_the_journal_not_the_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = Store::open(&path).unwrap();
            for (id, exit) in [("1", 101.0), ("2", 99.0)] {
                store.try_insert_pending(order(id, StrategyKind::Imbalance)).unwrap();
                store.promote(id, 100.0, 1.0, Utc::now()).unwrap();
                store.close(id, exit, ExitReason::Manual, Utc::now()).unwrap();
            }
        }
        let state = fs::read_to_string(&path).unwrap();
        assert!(!state.contains("exit_px"));
        let journal = fs::read_to_string(journal_path(&path)).unwrap();
        assert_eq!(journal.lines().count(), 2);

        let store = Store::open(&path).unwrap();
        assert_eq!(store.closed().len(), 2);
        assert_eq!(store.order_state("2"), Some(OrderState::Closed));
        let s = store.summary();
        assert_eq!((s.trades, s.wins), (2, 1));
        assert!(s.realized_pnl.abs() < 1e-9);
    }

    #[test]
    fn journaled_close_wins_over_a_stale_active_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let stale = {
            let store = Store::open(&path).unwrap();
            store.try_insert_pending(order("1", StrategyKind::MeanReversion)).unwrap();
            store.promote("1", 100.0, 0.2, Utc::now()).unwrap();
            fs::read(&path).unwrap()
        };
        {
            let store = Store::open(&path).unwrap();
            store.close("1", 101.0, ExitReason::ProfitTarget, Utc::now()).unwrap();
        }
        // crash between the journal append and the state rewrite
        fs::write(&path, stale).unwrap();

        let store = Store::open(&path).unwrap();
        assert!(store.active().is_empty());
        assert_eq!(store.order_state("1"), Some(OrderState::Closed));
        assert_eq!(store.slot_holder("BTCUSDT", StrategyKind::MeanReversion), None);
        let reopened = Store::open(&path).unwrap();
        assert!(reopened.active().is_empty());
    }

    #[test]
    fn torn_journal_tail_is_skipped_and_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = Store::open(&path).unwrap();
            store.try_insert_pending(order("1", StrategyKind::Imbalance)).unwrap();
            store.promote("1", 100.0, 1.0, Utc::now()).unwrap();
            store.close("1", 101.0, ExitReason::Manual, Utc::now()).unwrap();
        }
        let journal = journal_path(&path);
        let mut f = OpenOptions::new().append(true).open(&journal).unwrap();
        f.write_all(br#"{"order_id":"2","sym"#).unwrap();
        drop(f);

        {
            let store = Store::open(&path).unwrap();
            assert_eq!(store.closed().len(), 1);
            store.try_insert_pending(order("3", StrategyKind::Imbalance)).unwrap();
            store.promote("3", 100.0, 1.0, Utc::now()).unwrap();
            store.close("3", 102.0, ExitReason::Manual, Utc::now()).unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.closed().len(), 2);
        assert_eq!(store.summary().trades, 2);
    }

    #[test]
    fn empty_file_loads_as_empty_ledger() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = Store::open(file.path()).unwrap();
        assert!(store.pending().is_empty() && store.active().is_empty());
    }
}
