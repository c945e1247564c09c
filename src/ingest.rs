// ===============================
// src/ingest.rs
// ===============================
//
// Ingestion supervisor. One task per channel (depth / trade / candle), each
// with its own connection, backoff budget and health record:
//
//   CONNECTING --ok--> STREAMING --closed/error/silent--> RECONNECTING
//        |                                                 |   ^
//        +--------------connect error----------------------+   | retry
//                                                          |---+
//                                                          +--budget spent--> FAILED (terminal)
//
// A channel's failure budget is refilled once a reconnected stream delivers
// its first event. FAILED ends that task only; siblings keep running.
//
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::config::HealthParams;
use crate::domain::{Event, MarketEvent};
use crate::feed::{self, FeedError};
use crate::metrics::{CHANNEL_EVENTS, CHANNEL_LAST_EVENT_AGE, CHANNEL_RECONNECTS, CHANNEL_STATE, DISCARDED};
use crate::shutdown::ShutdownToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKind { Depth, Trade, Candle }

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [ChannelKind::Depth, ChannelKind::Trade, ChannelKind::Candle];

    pub fn as_str(&self) -> &'static str {
        match self { ChannelKind::Depth => "depth", ChannelKind::Trade => "trade", ChannelKind::Candle => "candle" }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState { Connecting, Streaming, Reconnecting, Failed }

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Connecting => "CONNECTING",
            ChannelState::Streaming => "STREAMING",
            ChannelState::Reconnecting => "RECONNECTING",
            ChannelState::Failed => "FAILED",
        }
    }

    /// Gauge encoding.
    fn code(&self) -> i64 {
        match self {
            ChannelState::Connecting => 0,
            ChannelState::Streaming => 1,
            ChannelState::Reconnecting => 2,
            ChannelState::Failed => 3,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Consumer of normalized events (the indicator bank in production).
pub trait EventSink: Send + Sync {
    fn apply(&self, ev: MarketEvent);
}

pub type FrameStream = BoxStream<'static, Result<String, FeedError>>;

/// Opens one upstream subscription for a channel.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, kind: ChannelKind) -> Result<FrameStream, FeedError>;
}

const HISTORY_CAP: usize = 32;

#[derive(Debug, Clone)]
pub struct ChannelStatus {
    pub state: ChannelState,
    pub last_event: Option<Instant>,
    pub streaming_since: Option<Instant>,
    pub events_since_connect: u64,
    pub failures: u32,
    /// Distinct states entered, oldest first.
    pub history: VecDeque<ChannelState>,
}

impl ChannelStatus {
    fn new() -> Self {
        let mut history = VecDeque::with_capacity(HISTORY_CAP);
        history.push_back(ChannelState::Connecting);
        Self {
            state: ChannelState::Connecting,
            last_event: None,
            streaming_since: None,
            events_since_connect: 0,
            failures: 0,
            history,
        }
    }
}

struct Channel {
    status: Mutex<ChannelStatus>,
    kick: Notify,
}

/// Result of one health evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// Streaming, but the last event is older than the staleness threshold.
    Stale(Duration),
    /// Streaming with no event at all for longer than the startup grace.
    Silent(Duration),
    Down(ChannelState),
}

pub fn assess(status: &ChannelStatus, now: Instant, p: &HealthParams) -> Verdict {
    if status.state != ChannelState::Streaming {
        return Verdict::Down(status.state);
    }
    if status.events_since_connect == 0 {
        let since = status.streaming_since.map(|t| now.saturating_duration_since(t)).unwrap_or_default();
        return if since > p.startup_grace { Verdict::Silent(since) } else { Verdict::Healthy };
    }
    match status.last_event {
        Some(t) if now.saturating_duration_since(t) > p.stale_after => Verdict::Stale(now.saturating_duration_since(t)),
        _ => Verdict::Healthy,
    }
}

enum StreamEnd {
    Shutdown,
    Lost(FeedError),
}

pub struct Supervisor {
    connector: Arc<dyn Connector>,
    sink: Arc<dyn EventSink>,
    policy: BackoffPolicy,
    health: HealthParams,
    channels: BTreeMap<ChannelKind, Channel>,
    recorder: Option<mpsc::Sender<Event>>,
}

impl Supervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        sink: Arc<dyn EventSink>,
        policy: BackoffPolicy,
        health: HealthParams,
    ) -> Self {
        let channels = ChannelKind::ALL
            .into_iter()
            .map(|k| (k, Channel { status: Mutex::new(ChannelStatus::new()), kick: Notify::new() }))
            .collect();
        Self { connector, sink, policy, health, channels, recorder: None }
    }

    pub fn with_recorder(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.recorder = Some(tx);
        self
    }

    fn channel(&self, kind: ChannelKind) -> &Channel {
        // every kind is inserted in `new`
        &self.channels[&kind]
    }

    pub fn state(&self, kind: ChannelKind) -> ChannelState { self.channel(kind).status.lock().state }

    #[cfg(test)]
    pub fn status(&self, kind: ChannelKind) -> ChannelStatus { self.channel(kind).status.lock().clone() }

    pub fn states(&self) -> Vec<(ChannelKind, ChannelState)> {
        ChannelKind::ALL.into_iter().map(|k| (k, self.state(k))).collect()
    }

    pub fn spawn_all(self: &Arc<Self>, stop: &ShutdownToken) -> Vec<JoinHandle<()>> {
        ChannelKind::ALL.into_iter().map(|k| self.spawn_channel(k, stop.clone())).collect()
    }

    pub fn spawn_channel(self: &Arc<Self>, kind: ChannelKind, stop: ShutdownToken) -> JoinHandle<()> {
        let me = Arc::clone(self);
        tokio::spawn(async move { me.run_channel(kind, stop).await })
    }

    fn transition(&self, kind: ChannelKind, to: ChannelState) {
        let from = {
            let mut st = self.channel(kind).status.lock();
            let from = st.state;
            st.state = to;
            if to == ChannelState::Streaming {
                st.streaming_since = Some(Instant::now());
                st.events_since_connect = 0;
            }
            if st.history.back() != Some(&to) {
                if st.history.len() == HISTORY_CAP {
                    st.history.pop_front();
                }
                st.history.push_back(to);
            }
            from
        };
        CHANNEL_STATE.with_label_values(&[kind.as_str()]).set(to.code());
        if from != to {
            info!(channel = %kind, %from, %to, "channel state");
            if let Some(tx) = &self.recorder {
                let _ = tx.try_send(Event::Channel { ts: Utc::now(), channel: kind.to_string(), state: to.to_string() });
            }
        }
    }

    fn record_failures(&self, kind: ChannelKind, failures: u32) {
        self.channel(kind).status.lock().failures = failures;
    }

    async fn run_channel(&self, kind: ChannelKind, stop: ShutdownToken) {
        let mut backoff = Backoff::new(self.policy.clone());
        self.transition(kind, ChannelState::Connecting);

        loop {
            let connected = tokio::select! {
                _ = stop.wait() => break,
                r = self.connector.connect(kind) => r,
            };
            match connected {
                Ok(mut frames) => {
                    self.transition(kind, ChannelState::Streaming);
                    match self.pump(kind, &mut frames, &mut backoff, &stop).await {
                        StreamEnd::Shutdown => break,
                        StreamEnd::Lost(e) => warn!(channel = %kind, error = %e, "stream lost"),
                    }
                }
                Err(e) => warn!(channel = %kind, error = %e, attempt = backoff.failures() + 1, "connect failed"),
            }

            let delay = backoff.next_delay();
            self.record_failures(kind, backoff.failures());
            match delay {
                None => {
                    error!(channel = %kind, failures = backoff.failures(), "reconnect budget exhausted");
                    self.transition(kind, ChannelState::Failed);
                    return;
                }
                Some(d) => {
                    self.transition(kind, ChannelState::Reconnecting);
                    CHANNEL_RECONNECTS.with_label_values(&[kind.as_str()]).inc();
                    debug!(channel = %kind, delay_ms = d.as_millis() as u64, "backing off");
                    if !stop.sleep(d).await {
                        break;
                    }
                }
            }
        }
        info!(channel = %kind, "channel stopped");
    }

    /// Drain one connected stream until it ends, is kicked, or shutdown.
    async fn pump(
        &self,
        kind: ChannelKind,
        frames: &mut FrameStream,
        backoff: &mut Backoff,
        stop: &ShutdownToken,
    ) -> StreamEnd {
        let ch = self.channel(kind);
        loop {
            tokio::select! {
                _ = stop.wait() => return StreamEnd::Shutdown,
                _ = ch.kick.notified() => {
                    // a kick only counts if this connection is still silent past grace
                    let status = ch.status.lock().clone();
                    if matches!(assess(&status, Instant::now(), &self.health), Verdict::Silent(_)) {
                        return StreamEnd::Lost(FeedError::Silent);
                    }
                    debug!(channel = %kind, "stale kick ignored");
                }
                frame = frames.next() => match frame {
                    None => return StreamEnd::Lost(FeedError::Closed),
                    Some(Err(e)) => return StreamEnd::Lost(e),
                    Some(Ok(txt)) => match feed::decode(kind, &txt) {
                        Ok(Some(ev)) => {
                            self.sink.apply(ev);
                            CHANNEL_EVENTS.with_label_values(&[kind.as_str()]).inc();
                            let first = {
                                let mut st = ch.status.lock();
                                st.last_event = Some(Instant::now());
                                st.events_since_connect += 1;
                                st.events_since_connect == 1
                            };
                            if first && backoff.failures() > 0 {
                                info!(channel = %kind, after = backoff.failures(), "stream recovered");
                                backoff.reset();
                                self.record_failures(kind, 0);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(channel = %kind, error = %e, "frame discarded");
                            DISCARDED.with_label_values(&[kind.as_str(), "decode"]).inc();
                        }
                    },
                },
            }
        }
    }

    /// Evaluate every channel once. Silent channels are kicked into RECONNECTING;
    /// stale ones are only reported.
    pub fn check_health(&self) -> Vec<(ChannelKind, Verdict)> {
        let now = Instant::now();
        ChannelKind::ALL
            .into_iter()
            .map(|kind| {
                let ch = self.channel(kind);
                let status = ch.status.lock().clone();
                if let Some(t) = status.last_event {
                    let age = now.saturating_duration_since(t).as_secs() as i64;
                    CHANNEL_LAST_EVENT_AGE.with_label_values(&[kind.as_str()]).set(age);
                }
                let verdict = assess(&status, now, &self.health);
                match verdict {
                    Verdict::Healthy => {}
                    Verdict::Stale(age) => warn!(channel = %kind, age_s = age.as_secs(), "channel stale"),
                    Verdict::Silent(since) => {
                        warn!(channel = %kind, since_s = since.as_secs(), "no event since subscribe, reconnecting");
                        ch.kick.notify_one();
                    }
                    Verdict::Down(state) => debug!(channel = %kind, %state, "channel down"),
                }
                (kind, verdict)
            })
            .collect()
    }

    pub fn spawn_health_check(self: &Arc<Self>, stop: ShutdownToken) -> JoinHandle<()> {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            while stop.sleep(me.health.interval).await {
                me.check_health();
            }
        })
    }
}
