// ===============================
// src/metrics.rs
// ===============================
use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{Encoder, Gauge, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::info;

use crate::shutdown::ShutdownToken;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Market data channels --------
pub static CHANNEL_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("channel_state", "0 connecting, 1 streaming, 2 reconnecting, 3 failed"),
        &["channel"],
    )
    .unwrap()
});

pub static CHANNEL_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("channel_events_total", "decoded market events"), &["channel"]).unwrap()
});

pub static CHANNEL_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("channel_reconnects_total", "reconnect attempts"), &["channel"]).unwrap()
});

pub static CHANNEL_LAST_EVENT_AGE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("channel_last_event_age_seconds", "age of the last event at the last health check"),
        &["channel"],
    )
    .unwrap()
});

pub static DISCARDED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("inputs_discarded_total", "inputs dropped as malformed or non-positive"),
        &["source", "reason"],
    )
    .unwrap()
});

// -------- Signals --------
pub static DECISIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("decisions_total", "policy evaluations by outcome"), &["strategy", "decision"])
        .unwrap()
});

pub static VOL_HALT: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("volatility_halt", "1 while the volatility halt is active").unwrap());

// -------- Orders & positions --------
pub static ORDERS_PLACED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("orders_placed_total", "entries registered PENDING"), &["strategy"]).unwrap()
});

pub static DUPLICATES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("entries_suppressed_total", "entries suppressed by an open order on the same slot"),
        &["strategy"],
    )
    .unwrap()
});

pub static EXEC_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("exec_errors_total", "venue call failures"), &["op", "kind"]).unwrap()
});

pub static EXITS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("exits_total", "closed positions by exit reason"), &["reason"]).unwrap()
});

pub static PENDING_ORDERS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("pending_orders", "entries waiting for a fill").unwrap());

pub static OPEN_POSITIONS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("open_positions", "ACTIVE positions").unwrap());

pub static ENTRIES_HALTED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("entries_halted", "1 after a state write failed for good").unwrap());

// -------- Portfolio --------
pub static REALIZED_PNL: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_realized", "realized PnL over closed trades (quote)").unwrap());

pub static TRADES: Lazy<IntGauge> = Lazy::new(|| IntGauge::new("trades_closed", "closed trades").unwrap());

pub static WIN_RATE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("win_rate", "share of closed trades with positive PnL").unwrap());

// ---- Config visibility (venue / strategy / symbol) ----
pub static CONFIG_VENUE_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_venue_mode", "execution venue (label: mode)"), &["mode"]).unwrap()
});

pub static CONFIG_STRATEGY: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_strategy", "active strategy (label: strategy)"), &["strategy"]).unwrap()
});

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_symbol", "traded symbol (label: symbol)"), &["symbol"]).unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry; a second call is a no-op
    for m in [
        REGISTRY.register(Box::new(CHANNEL_STATE.clone())),
        REGISTRY.register(Box::new(CHANNEL_EVENTS.clone())),
        REGISTRY.register(Box::new(CHANNEL_RECONNECTS.clone())),
        REGISTRY.register(Box::new(CHANNEL_LAST_EVENT_AGE.clone())),
        REGISTRY.register(Box::new(DISCARDED.clone())),
        REGISTRY.register(Box::new(DECISIONS.clone())),
        REGISTRY.register(Box::new(VOL_HALT.clone())),
        REGISTRY.register(Box::new(ORDERS_PLACED.clone())),
        REGISTRY.register(Box::new(DUPLICATES.clone())),
        REGISTRY.register(Box::new(EXEC_ERRORS.clone())),
        REGISTRY.register(Box::new(EXITS.clone())),
        REGISTRY.register(Box::new(PENDING_ORDERS.clone())),
        REGISTRY.register(Box::new(OPEN_POSITIONS.clone())),
        REGISTRY.register(Box::new(ENTRIES_HALTED.clone())),
        REGISTRY.register(Box::new(REALIZED_PNL.clone())),
        REGISTRY.register(Box::new(TRADES.clone())),
        REGISTRY.register(Box::new(WIN_RATE.clone())),
        REGISTRY.register(Box::new(CONFIG_VENUE_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_STRATEGY.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let resp = match req.uri().path() {
        "/" | "/metrics" => Response::builder()
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Body::from(encode_metrics())),
        _ => Response::builder().status(StatusCode::NOT_FOUND).body(Body::from("not found")),
    };
    Ok(resp.unwrap_or_else(|_| Response::new(Body::empty())))
}

/// Serve `/metrics` until `stop` fires. Bind errors are returned, not fatal.
pub async fn serve(port: u16, stop: ShutdownToken) -> Result<(), hyper::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });
    let server = Server::try_bind(&addr)?.serve(make_svc);
    info!("metrics listening on http://{addr}/metrics");
    server.with_graceful_shutdown(async move { stop.wait().await }).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_metrics_show_up_in_exposition() {
        init();
        init();
        EXITS.with_label_values(&["PROFIT_TARGET"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("exits_total{reason=\"PROFIT_TARGET\"}"));
        assert!(text.contains("open_positions"));
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let resp = handle(Request::get("/nope").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = handle(Request::get("/metrics").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
