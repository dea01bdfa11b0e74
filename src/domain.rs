// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side { Buy, Sell }

impl Side {
    pub fn sign(&self) -> f64 { match self { Side::Buy => 1.0, Side::Sell => -1.0 } }
    pub fn opposite(&self) -> Side { match self { Side::Buy => Side::Sell, Side::Sell => Side::Buy } }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "BUY", Side::Sell => "SELL" } }
}

/// Directional outcome of one evaluation. `None` means no actionable edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision { Up, Down, None }

impl Decision {
    pub fn side(&self) -> Option<Side> {
        match self {
            Decision::Up => Some(Side::Buy),
            Decision::Down => Some(Side::Sell),
            Decision::None => None,
        }
    }
    pub fn as_str(&self) -> &'static str {
        match self { Decision::Up => "up", Decision::Down => "down", Decision::None => "none" }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe { M1, M5, M15, H1, H4 }

impl Timeframe {
    /// Confirmation order, fastest first.
    pub const ALL: [Timeframe; 5] = [Timeframe::M1, Timeframe::M5, Timeframe::M15, Timeframe::H1, Timeframe::H4];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tf| tf.as_str() == s.trim().to_ascii_lowercase())
    }

    pub fn millis(&self) -> i64 {
        let min = match self {
            Timeframe::M1 => 1,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
        };
        min * 60_000
    }

    /// Slow timeframes must carry a full history window before they may confirm anything.
    pub fn needs_full_history(&self) -> bool {
        matches!(self, Timeframe::M15 | Timeframe::H1 | Timeframe::H4)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle { pub ts_ms: i64, pub open: f64, pub high: f64, pub low: f64, pub close: f64, pub volume: f64 }

impl Candle {
    pub fn body(&self) -> f64 { (self.close - self.open).abs() }
    pub fn is_bullish(&self) -> bool { self.close > self.open }
    pub fn is_bearish(&self) -> bool { self.close < self.open }
    pub fn upper_shadow(&self) -> f64 { self.high - self.open.max(self.close) }
    pub fn lower_shadow(&self) -> f64 { self.open.min(self.close) - self.low }
    pub fn is_well_formed(&self) -> bool {
        [self.open, self.high, self.low, self.close, self.volume].iter().all(|v| v.is_finite())
            && self.close > 0.0
            && self.volume >= 0.0
            && self.high >= self.low
    }
}

/// Per-symbol trading rules from the exchange market list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub symbol: String,
    pub quote_asset: String,
    pub price_precision: u32,
    pub quantity_precision: u32,
    pub min_notional: f64,
    pub trading: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind { Limit, StopMarket, TakeProfitMarket }

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Limit => "LIMIT",
            OrderKind::StopMarket => "STOP_MARKET",
            OrderKind::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
    pub fn leg(&self) -> &'static str {
        match self { OrderKind::Limit => "entry", OrderKind::StopMarket => "stop", OrderKind::TakeProfitMarket => "target" }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_id: String,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub quantity: f64,
    /// Limit price (entry only).
    pub price: Option<f64>,
    /// Trigger price (stop / take-profit legs).
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck { pub order_id: String, pub client_id: String, pub symbol: String }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionInfo { pub symbol: String, pub amount: f64, pub entry_price: f64 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionIntent {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    pub price_precision: u32,
    pub quantity_precision: u32,
}

/// Realized result of a (partially) closed position, reported by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill { pub symbol: String, pub realized_pnl: f64, pub ts_ms: i64 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Decision { symbol: String, decision: Decision, ts_ms: i64 },
    Ord(OrderRequest),
    Fill(Fill),
    Note(String),
}

pub fn round_to(value: f64, decimals: u32) -> f64 {
    let f = 10f64.powi(decimals as i32);
    (value * f).round() / f
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
