// ===============================
// src/config.rs
// ===============================
//
// Settings come from `.env` + environment variables, with a thin CLI layer
// on top (`--env-file`, `--dry-run`, `--strategy`, `--state-file`).
//
// Example .env:
//   SYMBOL=BTCUSDT
//   STRATEGY_TYPE=vwap          # or obi
//   DRY_RUN=true
//   VWAP_PROFIT_TARGET=0.006
//   RECONNECT_MAX_ATTEMPTS=5
//
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::domain::StrategyKind;

#[derive(Debug, Parser)]
#[command(name = "vwap_scalper", about = "single-symbol VWAP / order-book-imbalance trading engine")]
pub struct Cli {
    /// Alternate dotenv file (default: ./.env)
    #[arg(long)]
    pub env_file: Option<PathBuf>,
    /// Force paper execution regardless of DRY_RUN
    #[arg(long)]
    pub dry_run: bool,
    /// Strategy override: obi | vwap
    #[arg(long)]
    pub strategy: Option<String>,
    /// State file override (STATE_FILE)
    #[arg(long)]
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("inconsistent settings: {0}")]
    Inconsistent(String),
    #[error("missing credential {0} (required unless DRY_RUN=true)")]
    MissingCredential(&'static str),
}

#[derive(Clone, Debug)]
pub struct Args {
    pub symbol: String,
    pub strategy: StrategyKind,
    pub dry_run: bool,
    pub testnet: bool,
    pub ws_url: String,
    pub rest_url: String,
    pub kline_interval: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub state_file: PathBuf,
    pub record_file: Option<String>,
    pub metrics_port: u16,
    pub flatten_on_shutdown: bool,
}

#[derive(Clone, Debug)]
pub struct ImbalanceParams {
    pub depth_level: usize,
    pub long: f64,
    pub short: f64,
    pub tp_pct: f64,
    pub sl_pct: f64,
}

#[derive(Clone, Debug)]
pub struct ReversionParams {
    pub band_multiplier: f64,
    pub band_window: usize,
    pub tp_pct: f64,
    pub sl_pct: f64,
    pub adx_period: usize,
    pub trend_threshold: f64,
    pub strong_trend_threshold: f64,
    /// Trades per session before the bands may fire.
    pub warmup_trades: u64,
}

#[derive(Clone, Debug)]
pub struct VolatilityParams {
    pub threshold: f64,
    pub halt: Duration,
    pub lookback: Duration,
}

#[derive(Clone, Debug)]
pub struct ReconnectParams {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
}

#[derive(Clone, Debug)]
pub struct HealthParams {
    pub interval: Duration,
    pub stale_after: Duration,
    pub startup_grace: Duration,
}

#[derive(Clone, Debug)]
pub struct Timing {
    pub monitor_interval: Duration,
    pub signal_interval: Duration,
    pub order_ttl: Duration,
    pub session_reset_hour: u32,
}

#[derive(Clone, Debug)]
pub struct Sizing {
    pub size_quote: f64,
    pub max_notional: f64,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub args: Args,
    pub imbalance: ImbalanceParams,
    pub reversion: ReversionParams,
    pub volatility: VolatilityParams,
    pub reconnect: ReconnectParams,
    pub health: HealthParams,
    pub timing: Timing,
    pub sizing: Sizing,
}

/// Load `.env` (or `cli.env_file`) and build settings from the process environment.
pub fn load(cli: &Cli) -> Result<Settings, ConfigError> {
    match &cli.env_file {
        Some(p) => { let _ = dotenvy::from_path(p); }
        None => { let _ = dotenvy::dotenv(); }
    }
    let mut settings = from_lookup(|k| std::env::var(k).ok())?;

    if cli.dry_run {
        settings.args.dry_run = true;
    }
    if let Some(s) = &cli.strategy {
        settings.args.strategy = StrategyKind::parse(s)
            .ok_or_else(|| ConfigError::Invalid { key: "--strategy", value: s.clone() })?;
    }
    if let Some(p) = &cli.state_file {
        settings.args.state_file = p.clone();
    }
    if !settings.args.dry_run {
        if settings.args.api_key.is_none() { return Err(ConfigError::MissingCredential("BINANCE_API_KEY")); }
        if settings.args.api_secret.is_none() { return Err(ConfigError::MissingCredential("BINANCE_API_SECRET")); }
    }
    Ok(settings)
}

struct Env<F: Fn(&str) -> Option<String>>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn get<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.raw(key) {
            Some(v) => v.parse::<T>().map_err(|_| ConfigError::Invalid { key, value: v }),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.raw(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid { key, value: v }),
            },
        }
    }

    fn secs(&self, key: &'static str, default: f64) -> Result<Duration, ConfigError> {
        let v: f64 = self.get(key, default)?;
        if !(v.is_finite() && v >= 0.0) {
            return Err(ConfigError::Invalid { key, value: v.to_string() });
        }
        Ok(Duration::from_secs_f64(v))
    }

    fn millis(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        Ok(Duration::from_millis(self.get(key, default)?))
    }
}

/// Build settings from an arbitrary key lookup (process env in production, a map in tests).
pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Settings, ConfigError> {
    let env = Env(get);

    // ===== Basic =====
    let symbol = env.raw("SYMBOL").unwrap_or_else(|| "BTCUSDT".to_string()).to_ascii_uppercase();
    let strategy = match env.raw("STRATEGY_TYPE") {
        Some(s) => StrategyKind::parse(&s).ok_or(ConfigError::Invalid { key: "STRATEGY_TYPE", value: s })?,
        None => StrategyKind::MeanReversion,
    };
    let dry_run = env.flag("DRY_RUN", true)?;
    let testnet = env.flag("TESTNET", true)?;

    // Futures endpoints per mode
    let ws_url = env.raw("FUTURES_WS_URL").unwrap_or_else(|| {
        if testnet { "wss://fstream.binancefuture.com/ws" } else { "wss://fstream.binance.com/ws" }.to_string()
    });
    let rest_url = env.raw("FUTURES_REST_URL").unwrap_or_else(|| {
        if testnet { "https://testnet.binancefuture.com" } else { "https://fapi.binance.com" }.to_string()
    });

    let args = Args {
        symbol,
        strategy,
        dry_run,
        testnet,
        ws_url,
        rest_url,
        kline_interval: env.raw("KLINE_INTERVAL").unwrap_or_else(|| "1m".to_string()),
        api_key: env.raw("BINANCE_API_KEY"),
        api_secret: env.raw("BINANCE_API_SECRET"),
        state_file: PathBuf::from(env.raw("STATE_FILE").unwrap_or_else(|| "storage/state.json".to_string())),
        record_file: env.raw("RECORD_FILE"),
        metrics_port: env.get("METRICS_PORT", 9898)?,
        flatten_on_shutdown: env.flag("FLATTEN_ON_SHUTDOWN", false)?,
    };

    // ===== Strategy parameters =====
    let imbalance = ImbalanceParams {
        depth_level: env.get("DEPTH_LEVEL", 5)?,
        long: env.get("OBI_LONG", 0.70)?,
        short: env.get("OBI_SHORT", 0.30)?,
        tp_pct: env.get("OBI_TP_PCT", 0.0005)?,
        sl_pct: env.get("OBI_SL_PCT", 0.0005)?,
    };
    let reversion = ReversionParams {
        band_multiplier: env.get("VWAP_BAND_MULTIPLIER", 1.5)?,
        band_window: env.get("VWAP_STDDEV_PERIOD", 20)?,
        tp_pct: env.get("VWAP_PROFIT_TARGET", 0.006)?,
        sl_pct: env.get("VWAP_STOP_LOSS", 0.003)?,
        adx_period: env.get("ADX_PERIOD", 14)?,
        trend_threshold: env.get("ADX_TREND_THRESHOLD", 20.0)?,
        strong_trend_threshold: env.get("ADX_STRONG_TREND_THRESHOLD", 40.0)?,
        warmup_trades: env.get("WARMUP_TRADES", 100)?,
    };
    let volatility = VolatilityParams {
        threshold: env.get("VOLATILITY_THRESHOLD", 0.0015)?,
        halt: env.secs("VOLATILITY_HALT_SECS", 600.0)?,
        lookback: env.secs("VOLATILITY_LOOKBACK_SECS", 5.0)?,
    };

    // ===== Supervision & timing =====
    let reconnect = ReconnectParams {
        max_attempts: env.get("RECONNECT_MAX_ATTEMPTS", 5)?,
        base: env.millis("RECONNECT_BASE_MS", 500)?,
        cap: env.millis("RECONNECT_CAP_MS", 30_000)?,
        jitter: env.millis("RECONNECT_JITTER_MS", 250)?,
    };
    let health = HealthParams {
        interval: env.secs("HEALTH_INTERVAL_SECS", 30.0)?,
        stale_after: env.secs("STALE_AFTER_SECS", 60.0)?,
        startup_grace: env.secs("STARTUP_GRACE_SECS", 120.0)?,
    };
    let timing = Timing {
        monitor_interval: env.millis("MONITOR_INTERVAL_MS", 1000)?,
        signal_interval: env.millis("SIGNAL_INTERVAL_MS", 200)?,
        order_ttl: env.secs("ORDER_TTL_SECS", 2.0)?,
        session_reset_hour: env.get("SESSION_RESET_HOUR", 0)?,
    };
    let sizing = Sizing {
        size_quote: env.get("SIZE_QUOTE", 20.0)?,
        max_notional: env.get("MAX_NOTIONAL", 1000.0)?,
    };

    let settings = Settings { args, imbalance, reversion, volatility, reconnect, health, timing, sizing };
    settings.validate()?;
    Ok(settings)
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bad = |msg: &str| Err(ConfigError::Inconsistent(msg.to_string()));
        let i = &self.imbalance;
        if !(0.0..=1.0).contains(&i.short) || !(0.0..=1.0).contains(&i.long) || i.short >= i.long {
            return bad("OBI thresholds must satisfy 0 <= OBI_SHORT < OBI_LONG <= 1");
        }
        if i.depth_level == 0 {
            return bad("DEPTH_LEVEL must be >= 1");
        }
        let r = &self.reversion;
        if r.adx_period == 0 || r.band_window < 2 {
            return bad("ADX_PERIOD must be >= 1 and VWAP_STDDEV_PERIOD >= 2");
        }
        if r.trend_threshold > r.strong_trend_threshold {
            return bad("ADX_TREND_THRESHOLD must not exceed ADX_STRONG_TREND_THRESHOLD");
        }
        for (name, v) in [("tp/sl", i.tp_pct), ("tp/sl", i.sl_pct), ("tp/sl", r.tp_pct), ("tp/sl", r.sl_pct)] {
            if !(v > 0.0) {
                return bad(&format!("{name} percentages must be positive"));
            }
        }
        if self.volatility.threshold <= 0.0 {
            return bad("VOLATILITY_THRESHOLD must be positive");
        }
        if self.reconnect.base > self.reconnect.cap {
            return bad("RECONNECT_BASE_MS must not exceed RECONNECT_CAP_MS");
        }
        if self.timing.session_reset_hour > 23 {
            return bad("SESSION_RESET_HOUR must be 0..=23");
        }
        if self.timing.monitor_interval.is_zero() || self.timing.signal_interval.is_zero() {
            return bad("MONITOR_INTERVAL_MS and SIGNAL_INTERVAL_MS must be positive");
        }
        if !(self.sizing.size_quote > 0.0) || self.sizing.size_quote > self.sizing.max_notional {
            return bad("SIZE_QUOTE must be positive and not exceed MAX_NOTIONAL");
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_settings() -> Settings {
    from_lookup(|_| None).expect("defaults are valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let s = test_settings();
        assert_eq!(s.args.symbol, "BTCUSDT");
        assert_eq!(s.args.strategy, StrategyKind::MeanReversion);
        assert!(s.args.dry_run);
        assert_eq!(s.reversion.adx_period, 14);
        assert_eq!(s.reversion.band_window, 20);
        assert_eq!(s.reversion.warmup_trades, 100);
        assert_eq!(s.reconnect.max_attempts, 5);
        assert_eq!(s.health.interval, Duration::from_secs(30));
        assert_eq!(s.health.stale_after, Duration::from_secs(60));
        assert_eq!(s.volatility.lookback, Duration::from_secs(5));
        assert_eq!(s.timing.monitor_interval, Duration::from_secs(1));
        assert!(s.args.ws_url.contains("binancefuture"));
    }

    #[test]
    fn env_overrides_are_parsed() {
        let s = from_lookup(lookup(&[
            ("SYMBOL", "ethusdt"),
            ("STRATEGY_TYPE", "obi"),
            ("TESTNET", "false"),
            ("OBI_LONG", "0.8"),
            ("ORDER_TTL_SECS", "3.5"),
        ]))
        .unwrap();
        assert_eq!(s.args.symbol, "ETHUSDT");
        assert_eq!(s.args.strategy, StrategyKind::Imbalance);
        assert_eq!(s.args.ws_url, "wss://fstream.binance.com/ws");
        assert_eq!(s.imbalance.long, 0.8);
        assert_eq!(s.timing.order_ttl, Duration::from_millis(3500));
    }

    #[test]
    fn rejects_garbage_and_inconsistent_values() {
        assert!(matches!(
            from_lookup(lookup(&[("ADX_PERIOD", "fourteen")])),
            Err(ConfigError::Invalid { key: "ADX_PERIOD", .. })
        ));
        assert!(matches!(
            from_lookup(lookup(&[("OBI_LONG", "0.2"), ("OBI_SHORT", "0.4")])),
            Err(ConfigError::Inconsistent(_))
        ));
        assert!(matches!(
            from_lookup(lookup(&[("STRATEGY_TYPE", "martingale")])),
            Err(ConfigError::Invalid { key: "STRATEGY_TYPE", .. })
        ));
    }
}
