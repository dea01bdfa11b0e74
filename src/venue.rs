// ===============================
// src/venue.rs
// ===============================
//
// Guarded view of one exchange: every remote operation passes through its
// own rate limiter + circuit breaker, market rules are cached after
// load_markets, and tradable symbols are filtered by quote asset/allowlist.
//
use std::sync::{Arc, PoisonError, RwLock};

use ahash::AHashMap as HashMap;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::domain::{Candle, OrderAck, OrderRequest, PositionInfo, SymbolSpec, Timeframe};
use crate::exchange::{ErrorClass, Exchange, ExchangeError};
use crate::resilience::{ResilienceCfg, Resilient};

/// Waits between load_markets attempts; attempts = len + 1.
pub const MARKETS_BACKOFF: [Duration; 4] = [
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

struct Guards {
    balance: Resilient,
    ohlcv: Resilient,
    ticker: Resilient,
    positions: Resilient,
    orders: Resilient,
    cancel: Resilient,
}

pub struct Venue {
    inner: Arc<dyn Exchange>,
    quote_asset: String,
    allowlist: Vec<String>,
    markets: RwLock<HashMap<String, SymbolSpec>>,
    guards: Guards,
}

impl Venue {
    pub fn new(inner: Arc<dyn Exchange>, quote_asset: &str, allowlist: Vec<String>, cfg: &ResilienceCfg) -> Self {
        Self {
            inner,
            quote_asset: quote_asset.to_ascii_uppercase(),
            allowlist: allowlist.into_iter().map(|s| s.to_ascii_uppercase()).collect(),
            markets: RwLock::new(HashMap::new()),
            guards: Guards {
                balance: Resilient::new("fetch_balance", cfg),
                ohlcv: Resilient::new("fetch_ohlcv", cfg),
                ticker: Resilient::new("fetch_ticker", cfg),
                positions: Resilient::new("fetch_positions", cfg),
                orders: Resilient::new("create_order", cfg),
                cancel: Resilient::new("cancel_order", cfg),
            },
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Load market rules. Connectivity failures are retried along `backoff`;
    /// anything else, or running out of attempts, is returned to the caller.
    pub async fn load_markets(&self, backoff: &[Duration]) -> Result<usize, ExchangeError> {
        let mut attempt = 0usize;
        loop {
            match self.inner.load_markets().await {
                Ok(specs) => {
                    let n = specs.len();
                    let mut markets = self.markets.write().unwrap_or_else(PoisonError::into_inner);
                    markets.clear();
                    markets.extend(specs.into_iter().map(|s| (s.symbol.clone(), s)));
                    info!(venue = self.name(), markets = n, "markets loaded");
                    return Ok(n);
                }
                Err(e) if ErrorClass::of(&e).is_retryable() && attempt < backoff.len() => {
                    let wait = backoff[attempt];
                    attempt += 1;
                    warn!(venue = self.name(), attempt, wait_s = wait.as_secs(), error = %e, "load_markets failed, backing off");
                    sleep(wait).await;
                }
                Err(e) => {
                    error!(venue = self.name(), attempts = attempt + 1, error = %e, "load_markets gave up");
                    return Err(e);
                }
            }
        }
    }

    pub fn spec(&self, symbol: &str) -> Option<SymbolSpec> {
        self.markets.read().unwrap_or_else(PoisonError::into_inner).get(symbol).cloned()
    }

    /// Trading symbols quoted in the configured asset, sorted.
    pub fn list_symbols(&self) -> Vec<String> {
        let markets = self.markets.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<String> = markets
            .values()
            .filter(|s| s.trading && s.quote_asset == self.quote_asset)
            .filter(|s| self.allowlist.is_empty() || self.allowlist.contains(&s.symbol))
            .map(|s| s.symbol.clone())
            .collect();
        out.sort();
        out
    }

    pub async fn fetch_balance(&self) -> Result<f64, ExchangeError> {
        let (inner, quote) = (&self.inner, self.quote_asset.as_str());
        self.guards.balance.call(move || inner.fetch_balance(quote)).await
    }

    pub async fn fetch_ohlcv(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let inner = &self.inner;
        self.guards.ohlcv.call(move || inner.fetch_ohlcv(symbol, timeframe, limit)).await
    }

    pub async fn fetch_ticker(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let inner = &self.inner;
        self.guards.ticker.call(move || inner.fetch_ticker(symbol)).await
    }

    /// Non-flat positions only.
    pub async fn fetch_positions(&self) -> Result<Vec<PositionInfo>, ExchangeError> {
        let inner = &self.inner;
        let all = self.guards.positions.call(move || inner.fetch_positions()).await?;
        Ok(all.into_iter().filter(|p| p.amount != 0.0).collect())
    }

    /// Retried once on failure; the client order id keeps a replay from doubling the order.
    pub async fn create_order(&self, req: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let inner = &self.inner;
        self.guards.orders.call(move || inner.create_order(req)).await
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let inner = &self.inner;
        self.guards.cancel.call(move || inner.cancel_order(symbol, order_id)).await
    }
}
