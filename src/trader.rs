// ===============================
// src/trader.rs
// ===============================
//
// Periodic tasks around the lifecycle manager:
//   - signal loop   : snapshot -> policy -> entry intent
//   - session reset : VWAP restarts at the configured UTC hour
//
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::domain::{Decision, Event, Side, StrategyKind};
use crate::indicators::IndicatorBank;
use crate::lifecycle::{EntryIntent, Intake, LifecycleError, LifecycleManager};
use crate::metrics::{DECISIONS, VOL_HALT};
use crate::policy::{Policy, SignalPolicy};
use crate::shutdown::ShutdownToken;
use crate::snapshot::{MarketSnapshot, SharedSnapshot};

/// Maker entry price: join the bid when buying, the ask when selling.
pub fn entry_intent(kind: StrategyKind, decision: Decision, view: &MarketSnapshot) -> Option<EntryIntent> {
    let side = decision.entry_side()?;
    let touch = match side {
        Side::Buy => view.best_bid(),
        Side::Sell => view.best_ask(),
    };
    let price = touch.or_else(|| view.price())?;
    let reference_px = match kind {
        StrategyKind::MeanReversion => view.vwap.ready(),
        StrategyKind::Imbalance => view.mid(),
    }
    .unwrap_or(price);
    Some(EntryIntent { strategy: kind, side, price, reference_px })
}

/// One evaluation of the active policy. `None` when nothing was submitted.
pub async fn signal_once(
    policy: &Policy,
    snapshot: &SharedSnapshot,
    lifecycle: &LifecycleManager,
    now: DateTime<Utc>,
    recorder: Option<&mpsc::Sender<Event>>,
) -> Option<Intake> {
    let view = snapshot.view(now);
    VOL_HALT.set(view.halted as i64);

    let kind = policy.kind();
    let decision = policy.evaluate(&view);
    DECISIONS.with_label_values(&[kind.as_str(), decision.as_str()]).inc();

    let intent = entry_intent(kind, decision, &view)?;
    if let Some(tx) = recorder {
        let _ = tx.try_send(Event::Decision { ts: now, strategy: kind, decision, px: intent.price });
    }

    match lifecycle.submit_entry(intent).await {
        Ok(intake) => {
            if intake == Intake::Halted {
                debug!(strategy = %kind, "entries halted, signal ignored");
            }
            Some(intake)
        }
        Err(LifecycleError::Risk(e)) => {
            warn!(strategy = %kind, price = intent.price, error = %e, "entry rejected pre-trade");
            None
        }
        // already logged where the venue call failed
        Err(LifecycleError::Exec(_)) => None,
        Err(e @ LifecycleError::Persistence(_)) => {
            error!(strategy = %kind, error = %e, "entry not persisted");
            None
        }
        Err(e) => {
            warn!(strategy = %kind, error = %e, "entry failed");
            None
        }
    }
}

pub async fn run_signals(
    policy: Policy,
    snapshot: Arc<SharedSnapshot>,
    lifecycle: Arc<LifecycleManager>,
    every: Duration,
    stop: ShutdownToken,
    recorder: Option<mpsc::Sender<Event>>,
) {
    info!(strategy = %policy.kind(), every_ms = every.as_millis() as u64, "signal loop started");
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = stop.wait() => break,
            _ = tick.tick() => {}
        }
        signal_once(&policy, &snapshot, &lifecycle, Utc::now(), recorder.as_ref()).await;
    }
    info!("signal loop stopped");
}

/// Time from `now` to the next `hour`:00 UTC, strictly in the future.
pub fn until_next_reset(now: DateTime<Utc>, hour: u32) -> Duration {
    let day = chrono::Duration::days(1);
    let next = match now.date_naive().and_hms_opt(hour, 0, 0).map(|t| t.and_utc()) {
        Some(t) if t > now => t,
        Some(t) => t + day,
        None => now + day,
    };
    (next - now).to_std().unwrap_or_default()
}

pub async fn run_session_reset(bank: Arc<IndicatorBank>, hour: u32, stop: ShutdownToken) {
    loop {
        let wait = until_next_reset(Utc::now(), hour);
        debug!(hour, wait_secs = wait.as_secs(), "next session reset scheduled");
        if !stop.sleep(wait).await {
            break;
        }
        bank.reset_session();
    }
}
