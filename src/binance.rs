// ===============================
// src/binance.rs
// ===============================
//
// Signing + wire models for Binance USDⓈ-M futures (/fapi).
// Numbers arrive as strings; conversion to domain types happens here so the
// gateway only moves bytes.
//
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::domain::{Candle, Fill, PositionInfo, SymbolSpec};
use crate::exchange::ExchangeError;

pub fn timestamp_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

pub fn sign_query(secret: &str, query: &str) -> String {
    // HMAC accepts keys of any length, new_from_slice cannot fail here
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// `k=v&k=v` with url-encoded values, in the given order.
pub fn encode_params(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Fixed-point text for price/quantity fields.
pub fn fmt_decimal(value: f64, precision: u32) -> String {
    format!("{:.*}", precision as usize, value)
}

pub fn num(field: &str, s: &str) -> Result<f64, ExchangeError> {
    s.parse::<f64>().map_err(|_| ExchangeError::Decode(format!("{field}: {s:?} is not a number")))
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}

// ---- exchangeInfo ----
#[derive(Debug, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    pub status: String,
    pub quote_asset: String,
    #[serde(default)]
    pub contract_type: String,
    pub price_precision: u32,
    pub quantity_precision: u32,
    #[serde(default)]
    pub filters: Vec<serde_json::Value>,
}

impl SymbolInfo {
    fn min_notional(&self) -> f64 {
        self.filters
            .iter()
            .find(|f| f.get("filterType").and_then(|t| t.as_str()) == Some("MIN_NOTIONAL"))
            .and_then(|f| f.get("notional"))
            .and_then(|n| n.as_str())
            .and_then(|n| n.parse().ok())
            .unwrap_or(0.0)
    }

    pub fn into_spec(self) -> SymbolSpec {
        let min_notional = self.min_notional();
        SymbolSpec {
            trading: self.status == "TRADING" && (self.contract_type.is_empty() || self.contract_type == "PERPETUAL"),
            symbol: self.symbol,
            quote_asset: self.quote_asset,
            price_precision: self.price_precision,
            quantity_precision: self.quantity_precision,
            min_notional,
        }
    }
}

// ---- klines: [openTime, open, high, low, close, volume, closeTime, ...] ----
pub fn parse_kline(row: &[serde_json::Value]) -> Result<Candle, ExchangeError> {
    let text = |i: usize, name: &str| -> Result<f64, ExchangeError> {
        let v = row.get(i).and_then(|v| v.as_str()).ok_or_else(|| ExchangeError::Decode(format!("kline {name} missing")))?;
        num(name, v)
    };
    let ts_ms = row
        .first()
        .and_then(|v| v.as_i64())
        .ok_or_else(|| ExchangeError::Decode("kline open time missing".into()))?;
    Ok(Candle {
        ts_ms,
        open: text(1, "open")?,
        high: text(2, "high")?,
        low: text(3, "low")?,
        close: text(4, "close")?,
        volume: text(5, "volume")?,
    })
}

#[derive(Debug, Deserialize)]
pub struct TickerPrice {
    pub symbol: String,
    pub price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceEntry {
    pub asset: String,
    pub available_balance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    pub symbol: String,
    pub position_amt: String,
    pub entry_price: String,
}

impl PositionRisk {
    pub fn into_info(self) -> Result<PositionInfo, ExchangeError> {
        Ok(PositionInfo {
            amount: num("positionAmt", &self.position_amt)?,
            entry_price: num("entryPrice", &self.entry_price)?,
            symbol: self.symbol,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    pub client_order_id: String,
    pub symbol: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenKey {
    pub listen_key: String,
}

// ---- user data stream ----
#[derive(Debug, Deserialize)]
pub struct WsEnvelope {
    #[serde(rename = "e", default)]
    pub event: Option<String>,
    #[serde(rename = "E", default)]
    pub event_time: Option<i64>,
    #[serde(rename = "o", default)]
    pub order: Option<OrderTradeUpdate>,
}

#[derive(Debug, Deserialize)]
pub struct OrderTradeUpdate {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c")]
    pub client_id: String,
    /// Order status: NEW, PARTIALLY_FILLED, FILLED, CANCELED, EXPIRED ...
    #[serde(rename = "X")]
    pub status: String,
    /// Execution type: NEW, TRADE, CANCELED ...
    #[serde(rename = "x")]
    pub exec_type: String,
    /// Realized profit of this trade.
    #[serde(rename = "rp", default)]
    pub realized_profit: Option<String>,
    #[serde(rename = "T", default)]
    pub trade_time: Option<i64>,
}

impl WsEnvelope {
    pub fn is_listen_key_expired(&self) -> bool {
        self.event.as_deref() == Some("listenKeyExpired")
    }

    /// A trade that realized PnL (closing side of a position).
    pub fn into_fill(self) -> Option<Fill> {
        if self.event.as_deref() != Some("ORDER_TRADE_UPDATE") {
            return None;
        }
        let o = self.order?;
        if o.exec_type != "TRADE" {
            return None;
        }
        let pnl: f64 = o.realized_profit.as_deref()?.parse().ok()?;
        if pnl == 0.0 {
            return None;
        }
        Some(Fill { symbol: o.symbol, realized_pnl: pnl, ts_ms: o.trade_time.or(self.event_time).unwrap_or(0) })
    }
}
