// ===============================
// src/main.rs
// ===============================
/*
 # active configuration
 curl -s localhost:9898/metrics | egrep '^config_(venue_mode|symbol|strategy)'

 # channel health, positions, P&L
 curl -s localhost:9898/metrics | egrep '^(channel_state|open_positions|pending_orders|pnl_realized|win_rate)'
*/
mod backoff;
mod binance;      // signer / response models for USD-M futures REST
mod config;
mod domain;
mod execution;    // ExecutionClient: Binance futures or paper
mod feed;
mod indicators;
mod ingest;
mod lifecycle;
mod metrics;
mod policy;
mod recorder;
mod risk;
mod shutdown;
mod snapshot;
mod store;
mod trader;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::backoff::BackoffPolicy;
use crate::binance::Credentials;
use crate::config::ConfigError;
use crate::domain::{Event, StrategyKind};
use crate::execution::{BinanceFutures, ExecutionClient, PaperExecution};
use crate::feed::WsConnector;
use crate::indicators::IndicatorBank;
use crate::ingest::Supervisor;
use crate::lifecycle::{LifecycleError, LifecycleManager};
use crate::policy::Policy;
use crate::shutdown::Shutdown;
use crate::snapshot::SharedSnapshot;
use crate::store::{Store, StoreError};

const HEARTBEAT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
enum AppError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("state store: {0}")]
    Store(#[from] StoreError),
    #[error("lifecycle: {0}")]
    Lifecycle(#[from] LifecycleError),
    #[error("task: {0}")]
    Task(#[from] JoinError),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = config::Cli::parse();

    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: config::Cli) -> Result<(), AppError> {
    let settings = config::load(&cli)?;
    let args = &settings.args;

    let venue_mode = match (args.dry_run, args.testnet) {
        (true, _) => "paper",
        (false, true) => "binance_testnet",
        (false, false) => "binance_mainnet",
    };
    info!(
        symbol = %args.symbol,
        strategy = %args.strategy,
        venue_mode,
        ws = %args.ws_url,
        rest = %args.rest_url,
        state_file = %args.state_file.display(),
        "startup config"
    );

    // ---- Metrics ----
    metrics::init();
    metrics::CONFIG_VENUE_MODE.with_label_values(&[venue_mode]).set(1);
    metrics::CONFIG_STRATEGY.with_label_values(&[args.strategy.as_str()]).set(1);
    metrics::CONFIG_SYMBOL.with_label_values(&[args.symbol.as_str()]).set(1);

    // Stages, stopped in this order
    let signals_stop = Shutdown::new();
    let monitor_stop = Shutdown::new();
    let feeds_stop = Shutdown::new();

    let metrics_task = tokio::spawn({
        let (port, stop) = (args.metrics_port, feeds_stop.token());
        async move {
            if let Err(e) = metrics::serve(port, stop).await {
                warn!(port, error = %e, "metrics server unavailable");
            }
        }
    });

    // ---- Recorder (optional) ----
    let (rec_tx, rec_task) = match args.record_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<Event>(8192);
            (Some(tx), Some(tokio::spawn(recorder::run(rx, path))))
        }
        None => (None, None),
    };

    // ---- State & execution ----
    let store = Arc::new(Store::open(&args.state_file)?);
    let snapshot = Arc::new(SharedSnapshot::new());
    let exec: Arc<dyn ExecutionClient> = if args.dry_run {
        Arc::new(PaperExecution::new(snapshot.clone()))
    } else {
        let key = args.api_key.clone().ok_or(ConfigError::MissingCredential("BINANCE_API_KEY"))?;
        let secret = args.api_secret.clone().ok_or(ConfigError::MissingCredential("BINANCE_API_SECRET"))?;
        Arc::new(BinanceFutures::new(args.rest_url.clone(), args.symbol.clone(), Credentials::new(key, secret)))
    };
    info!(venue = exec.venue(), pending = store.pending().len(), active = store.active().len(), "execution ready");

    // ---- Market data: three supervised channels feeding the indicator bank ----
    let bank = Arc::new(IndicatorBank::from_settings(&settings, snapshot.clone()));
    if args.strategy == StrategyKind::MeanReversion {
        // klines endpoint caps `limit` at 1500
        let limit = (2 * settings.reversion.adx_period + 2).min(1500);
        match feed::fetch_closed_candles(&args.rest_url, &args.symbol, &args.kline_interval, limit).await {
            Ok(candles) => {
                bank.warm_trend(&candles);
            }
            Err(e) => warn!(error = %e, "candle history unavailable, trend strength warms up live"),
        }
    }
    let mut supervisor = Supervisor::new(
        Arc::new(WsConnector::from_settings(&settings)),
        bank.clone(),
        BackoffPolicy::from_params(&settings.reconnect),
        settings.health.clone(),
    );
    if let Some(tx) = &rec_tx {
        supervisor = supervisor.with_recorder(tx.clone());
    }
    let supervisor = Arc::new(supervisor);
    let mut feed_tasks = supervisor.spawn_all(&feeds_stop.token());
    feed_tasks.push(supervisor.spawn_health_check(feeds_stop.token()));
    feed_tasks.push(tokio::spawn(trader::run_session_reset(
        bank.clone(),
        settings.timing.session_reset_hour,
        feeds_stop.token(),
    )));

    // ---- Lifecycle: exit monitor + signal loop ----
    let mut lifecycle = LifecycleManager::new(&settings, store.clone(), exec, snapshot.clone());
    if let Some(tx) = &rec_tx {
        lifecycle = lifecycle.with_recorder(tx.clone());
    }
    let lifecycle = Arc::new(lifecycle);
    let mut monitor = tokio::spawn(lifecycle.clone().run_monitor(monitor_stop.token(), args.flatten_on_shutdown));
    let signals = tokio::spawn(trader::run_signals(
        Policy::from_settings(&settings),
        snapshot.clone(),
        lifecycle.clone(),
        settings.timing.signal_interval,
        signals_stop.token(),
        rec_tx.clone(),
    ));

    // ---- Heartbeat until ctrl-c or the monitor gives up ----
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut beat = tokio::time::interval(HEARTBEAT);
    let finished_early = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("shutdown requested");
                break None;
            }
            res = &mut monitor => break Some(res),
            _ = beat.tick() => {
                info!(
                    channels = ?supervisor.states(),
                    pending = store.pending().len(),
                    active = store.active().len(),
                    halted = lifecycle.is_halted(),
                    "heartbeat"
                );
            }
        }
    };

    // ---- Ordered shutdown: signals -> monitor -> feeds -> store ----
    signals_stop.trigger();
    let _ = signals.await;

    let monitor_result = match finished_early {
        Some(res) => res,
        None => {
            monitor_stop.trigger();
            monitor.await
        }
    };

    feeds_stop.trigger();
    for t in feed_tasks {
        let _ = t.await;
    }
    let _ = metrics_task.await;

    if let Err(e) = store.flush() {
        error!(error = %e, "final state flush failed");
    }
    let summary = store.summary();
    info!(
        trades = summary.trades,
        win_rate = summary.win_rate(),
        realized_pnl = summary.realized_pnl,
        open = store.active().len(),
        "stopped"
    );

    // last senders gone -> recorder drains and exits
    drop((rec_tx, supervisor, lifecycle));
    if let Some(task) = rec_task {
        if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
            warn!("recorder did not drain in time");
        }
    }

    monitor_result??;
    Ok(())
}
