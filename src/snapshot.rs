// ===============================
// src/snapshot.rs
// ===============================
//
// MarketSnapshot = candles + derived indicator columns, immutable once built.
// SnapshotProvider fetches through the venue, validates, computes, caches (TTL).
//
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use thiserror::Error;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::domain::{Candle, Timeframe};
use crate::indicators;
use crate::metrics::CACHE;
use crate::resilience::TtlCache;
use crate::venue::Venue;

/// Minimum usable rows for a snapshot to exist at all.
pub const MIN_CANDLES: usize = 20;
/// History window fetched per request; slow timeframes must have all of it to confirm.
pub const FULL_HISTORY: usize = 200;

/// Rolling window for volatility / volume averages.
const STAT_WINDOW: usize = 20;
const LEVEL_WINDOW: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Sma20,
    Sma50,
    Ema12,
    Ema26,
    Ema200,
    Rsi,
    Macd,
    MacdSignal,
    MacdHist,
    BbUpper,
    BbMiddle,
    BbLower,
    /// Rolling 50-bar low / high of the bars *before* the current one.
    Support,
    Resistance,
    Vwap,
    VolumeSma,
    VolumeSpike,
    SwingHigh,
    SwingLow,
    Fib236,
    StochK,
    StochD,
    Momentum,
    Atr,
    Adx,
    PlusDi,
    MinusDi,
    IchimokuConversion,
    IchimokuBase,
    CloseStd,
    CloseMean,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SnapshotError {
    #[error("unknown symbol {0}")]
    UnknownSymbol(String),
    #[error("insufficient data: {usable} usable rows")]
    InsufficientData { usable: usize },
    #[error("fetch failed: {0}")]
    Fetch(String),
}

#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub timeframe: Timeframe,
    candles: Vec<Candle>,
    columns: HashMap<Column, Vec<f64>>,
}

impl MarketSnapshot {
    /// Clean, validate and derive every indicator column.
    pub fn from_candles(symbol: &str, timeframe: Timeframe, raw: Vec<Candle>) -> Result<Self, SnapshotError> {
        let mut candles: Vec<Candle> = raw.into_iter().filter(Candle::is_well_formed).collect();
        candles.sort_by_key(|c| c.ts_ms);
        candles.dedup_by_key(|c| c.ts_ms);
        if candles.len() < MIN_CANDLES {
            return Err(SnapshotError::InsufficientData { usable: candles.len() });
        }
        let columns = derive_columns(&candles);
        Ok(Self { symbol: symbol.to_string(), timeframe, candles, columns })
    }

    /// Snapshot with caller-supplied columns (no derivation).
    #[cfg(test)]
    pub fn with_columns(symbol: &str, timeframe: Timeframe, candles: Vec<Candle>, columns: HashMap<Column, Vec<f64>>) -> Self {
        Self { symbol: symbol.to_string(), timeframe, candles, columns }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn has_full_history(&self) -> bool {
        self.candles.len() >= FULL_HISTORY
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    /// `back = 0` is the latest candle, `1` the one before it.
    pub fn candle(&self, back: usize) -> Option<&Candle> {
        self.candles.len().checked_sub(back + 1).and_then(|i| self.candles.get(i))
    }

    pub fn last_close(&self) -> Option<f64> {
        self.candle(0).map(|c| c.close)
    }

    /// Finite value of `col`, `back` rows from the end; `None` if the column is
    /// missing, too short, or still warming up.
    pub fn at(&self, col: Column, back: usize) -> Option<f64> {
        let values = self.columns.get(&col)?;
        let idx = values.len().checked_sub(back + 1)?;
        values.get(idx).copied().filter(|v| v.is_finite())
    }
}

fn derive_columns(candles: &[Candle]) -> HashMap<Column, Vec<f64>> {
    let column_of = |f: fn(&Candle) -> f64| candles.iter().map(f).collect::<Vec<f64>>();
    let high = column_of(|c| c.high);
    let low = column_of(|c| c.low);
    let close = column_of(|c| c.close);
    let volume = column_of(|c| c.volume);

    let mut cols = HashMap::new();
    cols.insert(Column::Sma20, indicators::sma(&close, 20));
    cols.insert(Column::Sma50, indicators::sma(&close, 50));
    cols.insert(Column::Ema12, indicators::ema(&close, 12));
    cols.insert(Column::Ema26, indicators::ema(&close, 26));
    cols.insert(Column::Ema200, indicators::ema(&close, 200));

    let rsi = indicators::rsi(&close, 14);
    cols.insert(Column::Rsi, rsi);

    let macd = indicators::macd(&close, 12, 26, 9);
    cols.insert(Column::Macd, macd.line);
    cols.insert(Column::MacdSignal, macd.signal);
    cols.insert(Column::MacdHist, macd.hist);

    let bands = indicators::bollinger(&close, 20, 2.0);
    cols.insert(Column::BbUpper, bands.upper);
    cols.insert(Column::BbMiddle, bands.middle);
    cols.insert(Column::BbLower, bands.lower);

    cols.insert(Column::Support, indicators::shift(&indicators::rolling_min(&low, LEVEL_WINDOW), 1));
    cols.insert(Column::Resistance, indicators::shift(&indicators::rolling_max(&high, LEVEL_WINDOW), 1));

    let swing_high = indicators::rolling_max(&high, LEVEL_WINDOW);
    let swing_low = indicators::rolling_min(&low, LEVEL_WINDOW);
    let fib = indicators::retracement(&swing_high, &swing_low, 0.236);
    cols.insert(Column::SwingHigh, swing_high);
    cols.insert(Column::SwingLow, swing_low);
    cols.insert(Column::Fib236, fib);

    cols.insert(Column::Vwap, indicators::vwap(&high, &low, &close, &volume));
    let vol_sma = indicators::sma(&volume, STAT_WINDOW);
    let spike = volume
        .iter()
        .zip(&vol_sma)
        .map(|(v, avg)| if *avg > 0.0 { v / avg } else { f64::NAN })
        .collect();
    cols.insert(Column::VolumeSma, vol_sma);
    cols.insert(Column::VolumeSpike, spike);

    let (k, d) = indicators::stochastic(&high, &low, &close, 14, 3);
    cols.insert(Column::StochK, k);
    cols.insert(Column::StochD, d);
    cols.insert(Column::Momentum, indicators::roc(&close, 10));
    cols.insert(Column::Atr, indicators::atr(&high, &low, &close, 14));

    let adx = indicators::adx(&high, &low, &close, 14);
    cols.insert(Column::Adx, adx.adx);
    cols.insert(Column::PlusDi, adx.plus_di);
    cols.insert(Column::MinusDi, adx.minus_di);

    cols.insert(Column::IchimokuConversion, indicators::midpoint(&high, &low, 9));
    cols.insert(Column::IchimokuBase, indicators::midpoint(&high, &low, 26));

    cols.insert(Column::CloseStd, indicators::rolling_std(&close, STAT_WINDOW));
    cols.insert(Column::CloseMean, indicators::sma(&close, STAT_WINDOW));
    cols
}

pub struct SnapshotProvider {
    venue: Arc<Venue>,
    cache: TtlCache<(String, Timeframe), Arc<MarketSnapshot>>,
    limit: usize,
}

impl SnapshotProvider {
    pub fn new(venue: Arc<Venue>, ttl: Duration) -> Self {
        Self { venue, cache: TtlCache::new(ttl), limit: FULL_HISTORY }
    }

    /// Cached snapshot, or `None` when the symbol should be skipped this round.
    pub async fn snapshot(&self, symbol: &str, timeframe: Timeframe) -> Option<Arc<MarketSnapshot>> {
        match self.try_snapshot(symbol, timeframe).await {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(%symbol, timeframe = timeframe.as_str(), error = %e, "snapshot unavailable");
                None
            }
        }
    }

    pub async fn try_snapshot(&self, symbol: &str, timeframe: Timeframe) -> Result<Arc<MarketSnapshot>, SnapshotError> {
        if self.venue.spec(symbol).is_none() {
            return Err(SnapshotError::UnknownSymbol(symbol.to_string()));
        }
        let key = (symbol.to_string(), timeframe);
        if let Some(hit) = self.cache.get(&key) {
            CACHE.with_label_values(&["hit"]).inc();
            return Ok(hit);
        }
        CACHE.with_label_values(&["miss"]).inc();

        let raw = self
            .venue
            .fetch_ohlcv(symbol, timeframe, self.limit)
            .await
            .map_err(|e| SnapshotError::Fetch(e.to_string()))?;
        let snap = Arc::new(MarketSnapshot::from_candles(symbol, timeframe, raw)?);
        debug!(%symbol, timeframe = timeframe.as_str(), rows = snap.len(), "snapshot refreshed");
        self.cache.set(key, snap.clone());
        Ok(snap)
    }

    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }
}

/// Deterministic candle series for tests: a drift plus a small zig-zag.
#[cfg(test)]
pub(crate) fn synthetic_candles(n: usize, start: f64, drift: f64) -> Vec<Candle> {
    (0..n)
        .map(|i| {
            let wobble = if i % 2 == 0 { 0.3 } else { -0.3 };
            let open = start + drift * i as f64;
            let close = open + drift + wobble;
            Candle {
                ts_ms: i as i64 * 60_000,
                open,
                high: open.max(close) + 0.5,
                low: open.min(close) - 0.5,
                close,
                volume: 1_000.0 + (i % 7) as f64 * 50.0,
            }
        })
        .collect()
}
