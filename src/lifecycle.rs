// ===============================
// src/lifecycle.rs
// ===============================
//
// Order / position lifecycle: PENDING -> ACTIVE -> CLOSED.
//
// - submit_entry   : size, place the maker entry, record it PENDING. The
//                    (symbol, strategy) slot check + insert is one store op;
//                    an entry that loses the slot race is cancelled.
// - monitor_once   : reconcile PENDING orders (fill -> ACTIVE, TTL -> cancel),
//                    then test every ACTIVE position for an exit:
//                      1) profit target  2) stop loss  3) VWAP reversion
//                    first hit wins, exit at market, close in one write.
// - persist        : store writes run on the blocking pool, IO failures are
//                    retried; when retries run out new entries are halted and
//                    the monitor stops with `Persistence`.
//
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::config::{Settings, Sizing};
use crate::domain::{Event, ExitReason, Order, OrderState, Position, Reading, Side, StrategyKind};
use crate::execution::{count_error, CancelOutcome, ExecError, ExecutionClient, FillStatus};
use crate::metrics::{
    DUPLICATES, ENTRIES_HALTED, EXITS, OPEN_POSITIONS, ORDERS_PLACED, PENDING_ORDERS, REALIZED_PNL, TRADES,
    WIN_RATE,
};
use crate::risk::{self, RiskError};
use crate::shutdown::ShutdownToken;
use crate::snapshot::SharedSnapshot;
use crate::store::{Admission, Store, StoreError, Summary};

/// Store write attempts after the first one.
const PERSIST_RETRIES: u32 = 2;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("pre-trade check: {0}")]
    Risk(#[from] RiskError),
    #[error("execution: {0}")]
    Exec(#[from] ExecError),
    #[error("store rejected transition: {0}")]
    Store(StoreError),
    #[error("state not persisted, entries halted: {0}")]
    Persistence(StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitRules {
    pub tp_pct: f64,
    pub sl_pct: f64,
    /// Close when price crosses back through VWAP.
    pub reversion_exit: bool,
}

/// First exit condition that holds, in fixed precedence.
pub fn evaluate_exit(pos: &Position, price: f64, vwap: Reading<f64>, rules: &ExitRules) -> Option<ExitReason> {
    let (hit_target, hit_stop, reverted) = match pos.side {
        Side::Buy => (
            price >= pos.entry_px * (1.0 + rules.tp_pct),
            price <= pos.entry_px * (1.0 - rules.sl_pct),
            matches!(vwap, Reading::Ready(v) if price >= v),
        ),
        Side::Sell => (
            price <= pos.entry_px * (1.0 - rules.tp_pct),
            price >= pos.entry_px * (1.0 + rules.sl_pct),
            matches!(vwap, Reading::Ready(v) if price <= v),
        ),
    };
    if hit_target {
        Some(ExitReason::ProfitTarget)
    } else if hit_stop {
        Some(ExitReason::StopLoss)
    } else if rules.reversion_exit && reverted {
        Some(ExitReason::MeanReversionExit)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryIntent {
    pub strategy: StrategyKind,
    pub side: Side,
    pub price: f64,
    /// VWAP for mean reversion, mid for imbalance.
    pub reference_px: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Intake {
    Registered(Order),
    DuplicateSuppressed { existing: String },
    Halted,
}

pub struct LifecycleManager {
    symbol: String,
    store: Arc<Store>,
    exec: Arc<dyn ExecutionClient>,
    snapshot: Arc<SharedSnapshot>,
    imbalance_rules: ExitRules,
    reversion_rules: ExitRules,
    sizing: Sizing,
    order_ttl: Duration,
    monitor_interval: Duration,
    persist_policy: BackoffPolicy,
    halted: AtomicBool,
    recorder: Option<mpsc::Sender<Event>>,
    last_summary: Mutex<Option<Summary>>,
}

impl LifecycleManager {
    pub fn new(s: &Settings, store: Arc<Store>, exec: Arc<dyn ExecutionClient>, snapshot: Arc<SharedSnapshot>) -> Self {
        Self {
            symbol: s.args.symbol.clone(),
            store,
            exec,
            snapshot,
            imbalance_rules: ExitRules { tp_pct: s.imbalance.tp_pct, sl_pct: s.imbalance.sl_pct, reversion_exit: false },
            reversion_rules: ExitRules { tp_pct: s.reversion.tp_pct, sl_pct: s.reversion.sl_pct, reversion_exit: true },
            sizing: s.sizing.clone(),
            order_ttl: s.timing.order_ttl,
            monitor_interval: s.timing.monitor_interval,
            persist_policy: BackoffPolicy::new(
                PERSIST_RETRIES,
                Duration::from_millis(100),
                Duration::from_secs(1),
                Duration::ZERO,
            ),
            halted: AtomicBool::new(false),
            recorder: None,
            last_summary: Mutex::new(None),
        }
    }

    pub fn with_recorder(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.recorder = Some(tx);
        self
    }

    pub fn rules_for(&self, strategy: StrategyKind) -> ExitRules {
        match strategy {
            StrategyKind::Imbalance => self.imbalance_rules,
            StrategyKind::MeanReversion => self.reversion_rules,
        }
    }

    pub fn is_halted(&self) -> bool { self.halted.load(Ordering::SeqCst) }

    fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        ENTRIES_HALTED.set(1);
    }

    fn record(&self, ev: Event) {
        if let Some(tx) = &self.recorder {
            let _ = tx.try_send(ev);
        }
    }

    /// Run a store operation off the async threads, retrying IO failures.
    async fn persist<T, F>(&self, op: F) -> Result<T, LifecycleError>
    where
        T: Send + 'static,
        F: Fn(&Store) -> Result<T, StoreError> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let mut backoff = Backoff::new(self.persist_policy.clone());
        loop {
            let (store, op) = (Arc::clone(&self.store), Arc::clone(&op));
            let err = match tokio::task::spawn_blocking(move || op(&store)).await {
                Ok(Ok(v)) => return Ok(v),
                Ok(Err(e)) if !e.is_io() => return Err(LifecycleError::Store(e)),
                Ok(Err(e)) => e,
                Err(join) => StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, join.to_string())),
            };
            match backoff.next_delay() {
                Some(d) => {
                    warn!(error = %err, attempt = backoff.failures(), "state write failed, retrying");
                    tokio::time::sleep(d).await;
                }
                None => {
                    error!(error = %err, "state write failed, halting new entries");
                    self.halt();
                    return Err(LifecycleError::Persistence(err));
                }
            }
        }
    }

    // ---- entries ----

    pub async fn submit_entry(&self, intent: EntryIntent) -> Result<Intake, LifecycleError> {
        if self.is_halted() {
            return Ok(Intake::Halted);
        }
        let strategy = intent.strategy;
        if let Some(existing) = self.store.slot_holder(&self.symbol, strategy) {
            DUPLICATES.with_label_values(&[strategy.as_str()]).inc();
            debug!(%strategy, %existing, "entry suppressed, slot busy");
            return Ok(Intake::DuplicateSuppressed { existing });
        }

        let qty = risk::size_entry(&self.sizing, intent.price)?;
        let order_id = match self.exec.place_entry(intent.side, intent.price, qty).await {
            Ok(id) => id,
            Err(e) => {
                count_error("entry", &e);
                warn!(%strategy, side = %intent.side, price = intent.price, error = %e, "entry not placed");
                return Err(e.into());
            }
        };

        let order = Order {
            id: order_id.clone(),
            symbol: self.symbol.clone(),
            side: intent.side,
            qty,
            price: intent.price,
            state: OrderState::Pending,
            strategy,
            reference_px: intent.reference_px,
            created_at: Utc::now(),
        };
        let candidate = order.clone();
        let admission = match self.persist(move |s| s.try_insert_pending(candidate.clone())).await {
            Ok(a) => a,
            Err(e) => {
                // not tracked locally, so it must not stay live on the venue
                self.cancel_untracked(&order).await;
                return Err(e);
            }
        };

        match admission {
            Admission::Accepted => {
                ORDERS_PLACED.with_label_values(&[strategy.as_str()]).inc();
                info!(order_id = %order.id, %strategy, side = %order.side, price = order.price, qty, "entry pending");
                self.record(Event::Registered(order.clone()));
                Ok(Intake::Registered(order))
            }
            Admission::DuplicateSuppressed { existing } => {
                DUPLICATES.with_label_values(&[strategy.as_str()]).inc();
                info!(order_id = %order.id, %existing, %strategy, "entry lost the slot race, cancelling");
                self.cancel_untracked(&order).await;
                Ok(Intake::DuplicateSuppressed { existing })
            }
        }
    }

    async fn cancel_untracked(&self, order: &Order) {
        match self.exec.cancel(&order.id).await {
            Ok(CancelOutcome::AlreadyFilled) => {
                warn!(order_id = %order.id, "untracked entry already filled, closing it at market");
                if let Err(e) = self.exec.place_market_exit(order.side.opposite(), order.qty).await {
                    count_error("exit", &e);
                    error!(order_id = %order.id, error = %e, "could not close untracked fill");
                }
            }
            Ok(outcome) => debug!(order_id = %order.id, ?outcome, "untracked entry cancelled"),
            Err(e) => {
                count_error("cancel", &e);
                error!(order_id = %order.id, error = %e, "cancel of untracked entry failed");
            }
        }
    }

    // ---- pending reconciliation ----

    pub async fn reconcile_pending(&self, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        for order in self.store.pending() {
            let status = match self.exec.query_fill(&order.id).await {
                Ok(s) => s,
                Err(e) => {
                    count_error("query", &e);
                    warn!(order_id = %order.id, error = %e, "fill query failed");
                    continue;
                }
            };
            match status {
                FillStatus::Filled { avg_px, qty } => self.promote(&order, avg_px, qty, now).await?,
                FillStatus::Cancelled { filled_qty, avg_px } if filled_qty > 0.0 => {
                    self.promote(&order, avg_px, filled_qty, now).await?
                }
                FillStatus::Cancelled { .. } => self.forget(&order, now, "cancelled by venue").await?,
                FillStatus::Open => {
                    let age = (now - order.created_at).to_std().unwrap_or_default();
                    if age >= self.order_ttl {
                        self.expire(&order, now).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn promote(&self, order: &Order, avg_px: f64, qty: f64, at: DateTime<Utc>) -> Result<(), LifecycleError> {
        let px = if avg_px > 0.0 { avg_px } else { order.price };
        let qty = if qty > 0.0 { qty } else { order.qty };
        let id = order.id.clone();
        let pos = self.persist(move |s| s.promote(&id, px, qty, at)).await?;
        info!(order_id = %pos.order_id, side = %pos.side, entry_px = pos.entry_px, qty = pos.qty, "position active");
        self.record(Event::Filled(pos));
        Ok(())
    }

    async fn forget(&self, order: &Order, at: DateTime<Utc>, why: &str) -> Result<(), LifecycleError> {
        let id = order.id.clone();
        self.persist(move |s| s.drop_pending(&id)).await?;
        info!(order_id = %order.id, why, "pending entry removed");
        self.record(Event::Cancelled { ts: at, order_id: order.id.clone() });
        Ok(())
    }

    async fn expire(&self, order: &Order, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        match self.exec.cancel(&order.id).await {
            Ok(CancelOutcome::Cancelled) | Ok(CancelOutcome::NotFound) => self.forget(order, now, "ttl expired").await,
            Ok(CancelOutcome::AlreadyFilled) => match self.exec.query_fill(&order.id).await {
                Ok(FillStatus::Filled { avg_px, qty }) => self.promote(order, avg_px, qty, now).await,
                Ok(FillStatus::Cancelled { filled_qty, avg_px }) if filled_qty > 0.0 => {
                    self.promote(order, avg_px, filled_qty, now).await
                }
                // the next iteration sees the final status
                Ok(_) => Ok(()),
                Err(e) => {
                    count_error("query", &e);
                    warn!(order_id = %order.id, error = %e, "fill query after cancel failed");
                    Ok(())
                }
            },
            Err(e) => {
                count_error("cancel", &e);
                warn!(order_id = %order.id, error = %e, "ttl cancel failed, retrying next tick");
                Ok(())
            }
        }
    }

    // ---- exits ----

    pub async fn exit_position(&self, pos: &Position, reason: ExitReason, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        let fill_px = match self.exec.place_market_exit(pos.side.opposite(), pos.qty).await {
            Ok(px) => px,
            Err(e) => {
                count_error("exit", &e);
                return Err(e.into());
            }
        };
        let id = pos.order_id.clone();
        let trade = self.persist(move |s| s.close(&id, fill_px, reason, now)).await?;
        EXITS.with_label_values(&[reason.as_str()]).inc();
        info!(
            order_id = %trade.order_id,
            reason = reason.as_str(),
            entry_px = trade.entry_px,
            exit_px = trade.exit_px,
            pnl = trade.pnl,
            "position closed"
        );
        self.record(Event::Closed(trade));
        Ok(())
    }

    pub async fn monitor_once(&self, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        self.reconcile_pending(now).await?;

        let view = self.snapshot.view(now);
        if let Some(price) = view.price() {
            for pos in self.store.active() {
                let Some(reason) = evaluate_exit(&pos, price, view.vwap, &self.rules_for(pos.strategy)) else {
                    continue;
                };
                match self.exit_position(&pos, reason, now).await {
                    Ok(()) => {}
                    Err(LifecycleError::Exec(e)) => {
                        warn!(order_id = %pos.order_id, reason = reason.as_str(), error = %e, "exit failed, position stays active")
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        self.publish_summary();
        Ok(())
    }

    /// Exit every ACTIVE position with reason MANUAL. Returns how many closed.
    pub async fn flatten_all(&self, now: DateTime<Utc>) -> Result<usize, LifecycleError> {
        let mut closed = 0;
        for pos in self.store.active() {
            match self.exit_position(&pos, ExitReason::Manual, now).await {
                Ok(()) => closed += 1,
                Err(LifecycleError::Exec(e)) => warn!(order_id = %pos.order_id, error = %e, "flatten failed"),
                Err(e) => return Err(e),
            }
        }
        self.publish_summary();
        Ok(closed)
    }

    fn publish_summary(&self) {
        OPEN_POSITIONS.set(self.store.active().len() as i64);
        PENDING_ORDERS.set(self.store.pending().len() as i64);
        let summary = self.store.summary();
        REALIZED_PNL.set(summary.realized_pnl);
        TRADES.set(summary.trades as i64);
        WIN_RATE.set(summary.win_rate());

        let mut last = self.last_summary.lock();
        if last.as_ref() != Some(&summary) {
            info!(
                trades = summary.trades,
                wins = summary.wins,
                win_rate = summary.win_rate(),
                realized_pnl = summary.realized_pnl,
                "portfolio"
            );
            *last = Some(summary);
        }
    }

    /// Fixed-interval exit monitor. Shutdown is only observed between
    /// iterations, so an exit in progress always completes.
    pub async fn run_monitor(self: Arc<Self>, stop: ShutdownToken, flatten_on_shutdown: bool) -> Result<(), LifecycleError> {
        let mut tick = tokio::time::interval(self.monitor_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.wait() => break,
                _ = tick.tick() => {}
            }
            match self.monitor_once(Utc::now()).await {
                Ok(()) => {}
                Err(e @ LifecycleError::Persistence(_)) => {
                    error!(error = %e, "exit monitor halted");
                    return Err(e);
                }
                Err(e) => warn!(error = %e, "monitor iteration failed"),
            }
        }
        if flatten_on_shutdown {
            let closed = self.flatten_all(Utc::now()).await?;
            info!(closed, "flattened on shutdown");
        }
        info!("exit monitor stopped");
        Ok(())
    }
}
