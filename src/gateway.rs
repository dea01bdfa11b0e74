// ===============================
// src/gateway.rs (paper venue)
// ===============================
//
// In-memory futures venue for MODE=mock:
// - price per symbol is a random walk, stepped on every ticker read
// - LIMIT entries fill immediately at the limit price
// - STOP_MARKET / TAKE_PROFIT_MARKET legs rest until the walk crosses them,
//   then close the position and emit a realized-PnL Fill
//
use std::sync::{Mutex, MutexGuard, PoisonError};

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::domain::{
    now_ms, round_to, Candle, Fill, OrderAck, OrderKind, OrderRequest, PositionInfo, Side, SymbolSpec, Timeframe,
};
use crate::exchange::{Exchange, ExchangeError};

/// Max relative move per ticker step.
const STEP: f64 = 0.002;

#[derive(Debug, Clone, Copy, Default)]
struct PaperPosition {
    amount: f64,
    entry_price: f64,
}

#[derive(Debug, Clone)]
struct Resting {
    id: String,
    req: OrderRequest,
}

#[derive(Debug, Default)]
struct Book {
    balance: f64,
    prices: HashMap<String, f64>,
    positions: HashMap<String, PaperPosition>,
    resting: Vec<Resting>,
    next_id: u64,
}

pub struct PaperExchange {
    quote_asset: String,
    markets: Vec<SymbolSpec>,
    book: Mutex<Book>,
    fill_tx: Option<mpsc::Sender<Fill>>,
}

pub fn starting_price(symbol: &str) -> f64 {
    match symbol {
        "BTCUSDT" => 60_000.0,
        "ETHUSDT" => 3_000.0,
        "SOLUSDT" => 150.0,
        "BNBUSDT" => 550.0,
        _ => 100.0,
    }
}

impl PaperExchange {
    pub fn new(symbols: &[String], quote_asset: &str, balance: f64) -> Self {
        let markets: Vec<SymbolSpec> = symbols
            .iter()
            .map(|s| SymbolSpec {
                symbol: s.clone(),
                quote_asset: quote_asset.to_string(),
                price_precision: 2,
                quantity_precision: 3,
                min_notional: 5.0,
                trading: true,
            })
            .collect();
        let prices = symbols.iter().map(|s| (s.clone(), starting_price(s))).collect();
        Self {
            quote_asset: quote_asset.to_string(),
            markets,
            book: Mutex::new(Book { balance, prices, ..Default::default() }),
            fill_tx: None,
        }
    }

    pub fn with_fills(mut self, tx: mpsc::Sender<Fill>) -> Self {
        self.fill_tx = Some(tx);
        self
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the mark price and settle any resting leg it crosses.
    pub fn mark(&self, symbol: &str, price: f64) -> Vec<Fill> {
        let fills = {
            let mut book = self.book();
            book.prices.insert(symbol.to_string(), price);
            settle(&mut book, symbol, price)
        };
        if let Some(tx) = &self.fill_tx {
            for f in &fills {
                let _ = tx.try_send(f.clone());
            }
        }
        fills
    }
}

fn triggered(req: &OrderRequest, price: f64) -> bool {
    let Some(level) = req.stop_price else { return false };
    match (req.kind, req.side) {
        // protective stop: sells below, buys above
        (OrderKind::StopMarket, Side::Sell) | (OrderKind::TakeProfitMarket, Side::Buy) => price <= level,
        (OrderKind::StopMarket, Side::Buy) | (OrderKind::TakeProfitMarket, Side::Sell) => price >= level,
        (OrderKind::Limit, _) => false,
    }
}

fn settle(book: &mut Book, symbol: &str, price: f64) -> Vec<Fill> {
    let (hit, keep): (Vec<Resting>, Vec<Resting>) = std::mem::take(&mut book.resting)
        .into_iter()
        .partition(|r| r.req.symbol == symbol && triggered(&r.req, price));
    book.resting = keep;

    let mut fills = Vec::new();
    for r in hit {
        let Some(pos) = book.positions.get_mut(symbol) else { continue };
        // reduce-only: never flip, never grow
        let closing = r.req.side.sign() * -pos.amount.signum();
        if pos.amount == 0.0 || closing <= 0.0 {
            continue;
        }
        let qty = r.req.quantity.min(pos.amount.abs());
        let pnl = (price - pos.entry_price) * qty * pos.amount.signum();
        pos.amount -= pos.amount.signum() * qty;
        if pos.amount.abs() < 1e-12 {
            book.positions.remove(symbol);
        }
        book.balance += pnl;
        info!(%symbol, leg = r.req.kind.leg(), price, pnl, "paper leg triggered");
        fills.push(Fill { symbol: symbol.to_string(), realized_pnl: pnl, ts_ms: now_ms() });
    }
    fills
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn load_markets(&self) -> Result<Vec<SymbolSpec>, ExchangeError> {
        Ok(self.markets.clone())
    }

    async fn fetch_balance(&self, quote_asset: &str) -> Result<f64, ExchangeError> {
        if !quote_asset.eq_ignore_ascii_case(&self.quote_asset) {
            return Ok(0.0);
        }
        Ok(self.book().balance)
    }

    /// Synthetic history: a walk backwards from the current mark.
    async fn fetch_ohlcv(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let last = self
            .book()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))?;
        let step_ms = timeframe.millis();
        let now = now_ms() / step_ms * step_ms;
        let mut rng = rand::thread_rng();
        let mut close = last;
        let mut out = Vec::with_capacity(limit);
        for i in 0..limit {
            let open = close * (1.0 + rng.gen_range(-STEP..=STEP) * 4.0);
            let high = open.max(close) * (1.0 + rng.gen_range(0.0..STEP));
            let low = open.min(close) * (1.0 - rng.gen_range(0.0..STEP));
            out.push(Candle {
                ts_ms: now - i as i64 * step_ms,
                open,
                high,
                low,
                close,
                volume: rng.gen_range(500.0..1500.0),
            });
            close = open;
        }
        out.reverse();
        Ok(out)
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let prev = self
            .book()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))?;
        let next = round_to(prev * (1.0 + rand::thread_rng().gen_range(-STEP..=STEP)), 2);
        self.mark(symbol, next);
        Ok(next)
    }

    async fn fetch_positions(&self) -> Result<Vec<PositionInfo>, ExchangeError> {
        Ok(self
            .book()
            .positions
            .iter()
            .map(|(s, p)| PositionInfo { symbol: s.clone(), amount: p.amount, entry_price: p.entry_price })
            .collect())
    }

    async fn create_order(&self, req: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        if !(req.quantity > 0.0) {
            return Err(ExchangeError::Api { code: -4003, msg: "quantity less than zero".into() });
        }
        let mut book = self.book();
        if !book.prices.contains_key(&req.symbol) {
            return Err(ExchangeError::UnknownSymbol(req.symbol.clone()));
        }
        book.next_id += 1;
        let id = book.next_id.to_string();
        match req.kind {
            OrderKind::Limit => {
                let px = req.price.unwrap_or_default();
                let pos = book.positions.entry(req.symbol.clone()).or_default();
                let signed = req.side.sign() * req.quantity;
                if pos.amount == 0.0 || pos.amount.signum() == signed.signum() {
                    let total = pos.amount.abs() + req.quantity;
                    pos.entry_price = (pos.entry_price * pos.amount.abs() + px * req.quantity) / total;
                }
                pos.amount += signed;
                debug!(symbol = %req.symbol, amount = pos.amount, px, "paper entry filled");
            }
            OrderKind::StopMarket | OrderKind::TakeProfitMarket => {
                book.resting.push(Resting { id: id.clone(), req: req.clone() });
            }
        }
        Ok(OrderAck { order_id: id, client_id: req.client_id.clone(), symbol: req.symbol.clone() })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let mut book = self.book();
        let before = book.resting.len();
        book.resting.retain(|r| !(r.id == order_id && r.req.symbol == symbol));
        if book.resting.len() == before {
            return Err(ExchangeError::Api { code: -2011, msg: "Unknown order sent.".into() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(kind: OrderKind, side: Side, qty: f64, price: Option<f64>, stop: Option<f64>) -> OrderRequest {
        OrderRequest {
            client_id: "t".into(),
            symbol: "ETHUSDT".into(),
            side,
            kind,
            quantity: qty,
            price,
            stop_price: stop,
            reduce_only: kind != OrderKind::Limit,
        }
    }

    fn paper() -> PaperExchange {
        PaperExchange::new(&["ETHUSDT".to_string()], "USDT", 1_000.0)
    }

    #[tokio::test]
    async fn entry_opens_and_target_closes_with_profit() {
        let (tx, mut rx) = mpsc::channel(4);
        let p = paper().with_fills(tx);
        p.create_order(&req(OrderKind::Limit, Side::Buy, 2.0, Some(3000.0), None)).await.unwrap();
        p.create_order(&req(OrderKind::StopMarket, Side::Sell, 2.0, None, Some(2940.0))).await.unwrap();
        p.create_order(&req(OrderKind::TakeProfitMarket, Side::Sell, 2.0, None, Some(3120.0))).await.unwrap();
        assert_eq!(p.fetch_positions().await.unwrap()[0].amount, 2.0);

        assert!(p.mark("ETHUSDT", 3050.0).is_empty());
        let fills = p.mark("ETHUSDT", 3125.0);
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].realized_pnl, 250.0);
        assert_eq!(rx.recv().await.unwrap().realized_pnl, 250.0);
        assert!(p.fetch_positions().await.unwrap().is_empty());
        assert_eq!(p.fetch_balance("USDT").await.unwrap(), 1_250.0);

        // stop leg left behind fires on nothing
        assert!(p.mark("ETHUSDT", 2900.0).is_empty());
    }

    #[tokio::test]
    async fn short_stop_realizes_loss() {
        let p = paper();
        p.create_order(&req(OrderKind::Limit, Side::Sell, 1.0, Some(3000.0), None)).await.unwrap();
        let stop = p.create_order(&req(OrderKind::StopMarket, Side::Buy, 1.0, None, Some(3060.0))).await.unwrap();
        let fills = p.mark("ETHUSDT", 3070.0);
        assert_eq!(fills[0].realized_pnl, -70.0);
        assert!(p.cancel_order("ETHUSDT", &stop.order_id).await.is_err());
    }

    #[tokio::test]
    async fn synthetic_history_is_ordered_and_sane() {
        let p = paper();
        let candles = p.fetch_ohlcv("ETHUSDT", Timeframe::M5, 200).await.unwrap();
        assert_eq!(candles.len(), 200);
        assert!(candles.windows(2).all(|w| w[0].ts_ms < w[1].ts_ms));
        assert!(candles.iter().all(Candle::is_well_formed));
        assert_eq!(candles[199].close, 3_000.0);
        assert!(matches!(p.fetch_ticker("NOPE").await, Err(ExchangeError::UnknownSymbol(_))));
    }
}
