// ===============================
// src/exchange.rs
// ===============================
use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Candle, OrderAck, OrderRequest, PositionInfo, SymbolSpec, Timeframe};

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("connectivity: {0}")]
    Connectivity(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("exchange rejected request (code {code}): {msg}")]
    Api { code: i64, msg: String },
    #[error("unexpected payload: {0}")]
    Decode(String),
    #[error("unknown symbol {0}")]
    UnknownSymbol(String),
    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ExchangeError::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            ExchangeError::Connectivity(e.to_string())
        } else if e.is_decode() {
            ExchangeError::Decode(e.to_string())
        } else {
            ExchangeError::Other(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(e: serde_json::Error) -> Self {
        ExchangeError::Decode(e.to_string())
    }
}

/// Failure taxonomy the control loop reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Connectivity,
    DataValidation,
    OrderConstraintViolation,
    Unclassified,
}

impl ErrorClass {
    pub fn of(e: &ExchangeError) -> Self {
        match e {
            ExchangeError::Connectivity(_) | ExchangeError::Timeout(_) => ErrorClass::Connectivity,
            ExchangeError::Decode(_) | ExchangeError::UnknownSymbol(_) => ErrorClass::DataValidation,
            // Binance filter failures: -1013 (filter), -1111 (precision), -2019 (margin), -4164 (notional)
            ExchangeError::Api { code, .. } if matches!(*code, -1013 | -1111 | -2019 | -4164) => {
                ErrorClass::OrderConstraintViolation
            }
            ExchangeError::Api { .. } | ExchangeError::Other(_) => ErrorClass::Unclassified,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Connectivity)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Connectivity => "connectivity",
            ErrorClass::DataValidation => "data_validation",
            ErrorClass::OrderConstraintViolation => "order_constraint",
            ErrorClass::Unclassified => "unclassified",
        }
    }
}

/// Remote venue contract. Implementations: Binance USDⓈ-M futures and the paper venue.
#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    async fn load_markets(&self) -> Result<Vec<SymbolSpec>, ExchangeError>;

    /// Available quote-currency balance.
    async fn fetch_balance(&self, quote_asset: &str) -> Result<f64, ExchangeError>;

    /// Most recent `limit` candles, oldest first.
    async fn fetch_ohlcv(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>, ExchangeError>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<f64, ExchangeError>;

    async fn fetch_positions(&self) -> Result<Vec<PositionInfo>, ExchangeError>;

    async fn create_order(&self, req: &OrderRequest) -> Result<OrderAck, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;
}
