// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : mtf_bot_rust — multi-timeframe signal fusion futures bot in Rust
Module  : config.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Scores thirteen indicators per timeframe, trades only when 1m..4h
          agree, sizes by ATR, brackets every entry, halts on daily loss,
          exposes Prometheus metrics, and records JSONL events.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use thiserror::Error;
use tokio::time::Duration;

use crate::adjust::WeightSet;
use crate::domain::Timeframe;
use crate::execution::SizingParams;
use crate::resilience::ResilienceCfg;
use crate::signals::Indicator;

#[derive(Debug, Parser)]
#[command(name = "mtf_bot_rust", version, about = "Multi-timeframe confirmation futures bot")]
pub struct Cli {
    /// Dotenv file to load instead of ./.env
    #[arg(long)]
    pub env_file: Option<PathBuf>,
    /// Run a single control cycle and exit
    #[arg(long)]
    pub once: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} is required for {mode}")]
    Missing { key: &'static str, mode: &'static str },
    #[error("{key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { key, reason: reason.into() }
}

/// Venue: paper trading atau Binance futures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarketMode {
    Mock,
    BinanceTestnet,
    BinanceMainnet,
}

impl MarketMode {
    pub fn from_env(key: &str, default_mode: MarketMode) -> MarketMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "mock" | "paper"   => MarketMode::Mock,
            "binance_testnet"  => MarketMode::BinanceTestnet,
            "binance_mainnet"  => MarketMode::BinanceMainnet,
            _ => default_mode,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketMode::Mock           => "mock",
            MarketMode::BinanceTestnet => "binance_testnet",
            MarketMode::BinanceMainnet => "binance_mainnet",
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self, MarketMode::Mock)
    }

    // Endpoint default per mode (USDⓈ-M futures)
    pub fn default_ws_url(&self) -> &'static str {
        match self {
            MarketMode::Mock           => "wss://stream.binancefuture.com/ws", // tidak dipakai saat mock
            MarketMode::BinanceTestnet => "wss://stream.binancefuture.com/ws",
            MarketMode::BinanceMainnet => "wss://fstream.binance.com/ws",
        }
    }

    pub fn default_rest_url(&self) -> &'static str {
        match self {
            MarketMode::Mock           => "https://testnet.binancefuture.com", // placeholder
            MarketMode::BinanceTestnet => "https://testnet.binancefuture.com",
            MarketMode::BinanceMainnet => "https://fapi.binance.com",
        }
    }
}

#[derive(Clone, Debug)]
pub struct BinanceCfg {
    pub rest_url: String,
    pub ws_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub recv_window: u64,
}

/// Sleeps of the control loop and the monitor.
#[derive(Clone, Copy, Debug)]
pub struct Pacing {
    pub cycle: Duration,
    pub error_cooldown: Duration,
    pub zero_balance_pause: Duration,
    pub monitor: Duration,
}

#[derive(Clone, Debug)]
pub struct Args {
    pub mode: MarketMode,
    pub binance: BinanceCfg,

    // kosong = semua symbol dengan quote asset yang sama
    pub symbols: Vec<String>,
    pub quote_asset: String,
    pub paper_balance: f64,

    // files/metrics
    pub record_file: Option<String>,
    pub metrics_port: u16,

    pub cache_ttl: Duration,
    pub resilience: ResilienceCfg,
    pub pacing: Pacing,
}

#[derive(Clone, Debug)]
pub struct Limits {
    pub max_open_positions: usize,
    pub daily_loss_limit: f64,
    pub sizing: SizingParams,
    pub sizing_timeframe: Timeframe,
    pub base_threshold: f64,
    pub base_weights: WeightSet,
}

fn var<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(var(key, default))
}

/// `SYMBOLS=BTCUSDT, ethusdt` -> ["BTCUSDT", "ETHUSDT"]
pub fn parse_symbols(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = raw
        .split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|x| x.to_ascii_uppercase())
        .collect();
    out.dedup();
    out
}

/// `WEIGHTS=rsi:0.12,adx:0.05` overrides on top of `base`.
pub fn parse_weights(raw: &str, base: WeightSet) -> Result<WeightSet, ConfigError> {
    let mut w = base;
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, value) = item
            .split_once(':')
            .ok_or_else(|| invalid("WEIGHTS", format!("expected name:value, got {item:?}")))?;
        let ind = Indicator::parse(name).ok_or_else(|| invalid("WEIGHTS", format!("unknown indicator {name:?}")))?;
        let v: f64 = value
            .trim()
            .parse()
            .map_err(|_| invalid("WEIGHTS", format!("{name}: {value:?} is not a number")))?;
        w.set(ind, v);
    }
    Ok(w)
}

impl Args {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode.is_live() {
            if self.binance.api_key.is_empty() {
                return Err(ConfigError::Missing { key: "BINANCE_API_KEY", mode: self.mode.as_str() });
            }
            if self.binance.api_secret.is_empty() {
                return Err(ConfigError::Missing { key: "BINANCE_API_SECRET", mode: self.mode.as_str() });
            }
        } else if self.symbols.is_empty() {
            return Err(invalid("SYMBOLS", "paper mode needs at least one symbol"));
        }
        if self.quote_asset.is_empty() {
            return Err(invalid("QUOTE_ASSET", "must not be empty"));
        }
        if !(self.resilience.max_calls_per_sec > 0.0) {
            return Err(invalid("MAX_CALLS_PER_SEC", "must be > 0"));
        }
        Ok(())
    }
}

impl Limits {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_threshold > 0.0) {
            return Err(invalid("BASE_THRESHOLD", "must be > 0"));
        }
        if !self.base_weights.all_positive() {
            return Err(invalid("WEIGHTS", "every weight must be > 0"));
        }
        if !(self.daily_loss_limit > 0.0) {
            return Err(invalid("DAILY_LOSS_LIMIT", "must be > 0"));
        }
        if self.max_open_positions == 0 {
            return Err(invalid("MAX_OPEN_POSITIONS", "must be >= 1"));
        }
        let s = &self.sizing;
        if !(s.risk_fraction > 0.0 && s.risk_fraction <= 1.0) {
            return Err(invalid("RISK_FRACTION", "must be in (0, 1]"));
        }
        if !(s.leverage >= 1.0) {
            return Err(invalid("LEVERAGE", "must be >= 1"));
        }
        for (key, f) in [("STOP_FRACTION", s.stop_fraction), ("TP_FRACTION", s.tp_fraction), ("TRAIL_FRACTION", s.trail_fraction)] {
            if !(f > 0.0 && f < 1.0) {
                return Err(invalid(key, "must be in (0, 1)"));
            }
        }
        Ok(())
    }
}

/// Baca .env (atau `env_file`) lalu susun Args & Limits.
pub fn load(env_file: Option<&PathBuf>) -> Result<(Args, Limits), ConfigError> {
    // Pastikan .env dibaca (agar SYMBOLS, MODE, dll ter-load)
    match env_file {
        Some(p) => dotenvy::from_path(p).map_err(|e| invalid("--env-file", e.to_string()))?,
        None => {
            let _ = dotenvy::dotenv();
        }
    }

    // ===== Mode & venue =====
    let mode = MarketMode::from_env("MODE", MarketMode::Mock);
    let binance = BinanceCfg {
        rest_url: env::var("BINANCE_REST_URL").unwrap_or_else(|_| mode.default_rest_url().to_string()),
        ws_url: env::var("BINANCE_WS_URL").unwrap_or_else(|_| mode.default_ws_url().to_string()),
        api_key: env::var("BINANCE_API_KEY").unwrap_or_default(),
        api_secret: env::var("BINANCE_API_SECRET").unwrap_or_default(),
        recv_window: var("BINANCE_RECV_WINDOW", 5000),
    };

    let default_symbols = if mode.is_live() { "" } else { "BTCUSDT,ETHUSDT" };
    let symbols = parse_symbols(&env::var("SYMBOLS").unwrap_or_else(|_| default_symbols.to_string()));

    let args = Args {
        mode,
        binance,
        symbols,
        quote_asset: env::var("QUOTE_ASSET").unwrap_or_else(|_| "USDT".to_string()).trim().to_ascii_uppercase(),
        paper_balance: var("PAPER_BALANCE", 1_000.0),
        record_file: env::var("RECORD_FILE").ok().filter(|s| !s.trim().is_empty()),
        metrics_port: var("METRICS_PORT", 9898),
        cache_ttl: secs("CACHE_TTL_SECS", 60),
        resilience: ResilienceCfg {
            max_calls_per_sec: var("MAX_CALLS_PER_SEC", 5.0),
            max_failures: var("MAX_FAILURES", 3),
            reset_time: secs("BREAKER_RESET_SECS", 60),
            retry_pause: secs("RETRY_PAUSE_SECS", 2),
        },
        pacing: Pacing {
            cycle: secs("CYCLE_SECS", 180),
            error_cooldown: secs("ERROR_COOLDOWN_SECS", 300),
            zero_balance_pause: secs("ZERO_BALANCE_PAUSE_SECS", 60),
            monitor: secs("MONITOR_SECS", 30),
        },
    };
    args.validate()?;

    // ===== Limits =====
    let d = SizingParams::default();
    let sizing = SizingParams {
        risk_fraction: var("RISK_FRACTION", d.risk_fraction),
        leverage: var("LEVERAGE", d.leverage),
        size_precision: var("SIZE_PRECISION", d.size_precision),
        stop_fraction: var("STOP_FRACTION", d.stop_fraction),
        tp_fraction: var("TP_FRACTION", d.tp_fraction),
        trail_fraction: var("TRAIL_FRACTION", d.trail_fraction),
        min_notional: var("MIN_NOTIONAL", d.min_notional),
    };
    let sizing_timeframe = match env::var("SIZING_TIMEFRAME") {
        Ok(s) => Timeframe::parse(&s).ok_or_else(|| invalid("SIZING_TIMEFRAME", format!("unknown timeframe {s:?}")))?,
        Err(_) => Timeframe::M15,
    };
    let base_weights = match env::var("WEIGHTS") {
        Ok(raw) => parse_weights(&raw, WeightSet::default())?,
        Err(_) => WeightSet::default(),
    };

    let limits = Limits {
        max_open_positions: var("MAX_OPEN_POSITIONS", 3),
        daily_loss_limit: var("DAILY_LOSS_LIMIT", 50.0),
        sizing,
        sizing_timeframe,
        base_threshold: var("BASE_THRESHOLD", 0.2),
        base_weights,
    };
    limits.validate()?;
    Ok((args, limits))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Limits {
        Limits {
            max_open_positions: 3,
            daily_loss_limit: 50.0,
            sizing: SizingParams::default(),
            sizing_timeframe: Timeframe::M15,
            base_threshold: 0.2,
            base_weights: WeightSet::default(),
        }
    }

    fn args(mode: MarketMode) -> Args {
        Args {
            mode,
            binance: BinanceCfg {
                rest_url: mode.default_rest_url().into(),
                ws_url: mode.default_ws_url().into(),
                api_key: String::new(),
                api_secret: String::new(),
                recv_window: 5000,
            },
            symbols: vec!["BTCUSDT".into()],
            quote_asset: "USDT".into(),
            paper_balance: 1000.0,
            record_file: None,
            metrics_port: 9898,
            cache_ttl: Duration::from_secs(60),
            resilience: ResilienceCfg::default(),
            pacing: Pacing {
                cycle: Duration::from_secs(180),
                error_cooldown: Duration::from_secs(300),
                zero_balance_pause: Duration::from_secs(60),
                monitor: Duration::from_secs(30),
            },
        }
    }

    #[test]
    fn symbols_are_normalized() {
        assert_eq!(parse_symbols(" btcusdt, ,ETHUSDT,"), vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        assert!(parse_symbols("").is_empty());
    }

    #[test]
    fn weight_overrides() {
        let w = parse_weights("rsi:0.3, adx : 0.01", WeightSet::default()).unwrap();
        assert_eq!(w.get(Indicator::Rsi), 0.3);
        assert_eq!(w.get(Indicator::Adx), 0.01);
        assert_eq!(w.get(Indicator::Macd), WeightSet::default().get(Indicator::Macd));
        assert!(parse_weights("volume:1", WeightSet::default()).is_err());
        assert!(parse_weights("rsi=1", WeightSet::default()).is_err());
    }

    #[test]
    fn limits_reject_non_positive_threshold_and_weights() {
        assert!(limits().validate().is_ok());
        let mut l = limits();
        l.base_threshold = 0.0;
        assert!(l.validate().is_err());
        let mut l = limits();
        l.base_weights.set(Indicator::Momentum, 0.0);
        assert!(l.validate().is_err());
        let mut l = limits();
        l.sizing.stop_fraction = 1.5;
        assert!(l.validate().is_err());
    }

    #[test]
    fn live_modes_need_credentials() {
        assert!(args(MarketMode::Mock).validate().is_ok());
        let err = args(MarketMode::BinanceTestnet).validate().unwrap_err();
        assert!(matches!(err, ConfigError::Missing { key: "BINANCE_API_KEY", .. }));
    }
}
