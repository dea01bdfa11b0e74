// ===============================
// src/execution.rs
// ===============================
//
// Decision -> sized, notional-checked bracket (entry + stop + target).
// Legs go out one by one; a leg that fails after the entry is live is
// logged loudly, the rest of the bracket still goes out.
//
use std::sync::Arc;

use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::adjust::{AdjustmentFeatures, Adjuster};
use crate::domain::{
    now_ms, round_to, Decision, Event, OrderAck, OrderKind, OrderRequest, PositionIntent, Side, SymbolSpec,
};
use crate::exchange::ExchangeError;
use crate::metrics::ORDERS;
use crate::snapshot::{Column, MarketSnapshot};
use crate::venue::Venue;

const EPS: f64 = 1e-9;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("precision unavailable for {0}")]
    PrecisionUnavailable(String),
    #[error("notional {notional:.4} cannot reach minimum {min}")]
    MinNotional { notional: f64, min: f64 },
    #[error("invalid quantity {0}")]
    InvalidQuantity(f64),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

#[derive(Debug, Clone, Copy)]
pub struct SizingParams {
    pub risk_fraction: f64,
    pub leverage: f64,
    /// Decimal places of the raw ATR size, before exchange precision.
    pub size_precision: u32,
    pub stop_fraction: f64,
    pub tp_fraction: f64,
    pub trail_fraction: f64,
    /// Floor used when the market list carries no notional filter.
    pub min_notional: f64,
}

impl Default for SizingParams {
    fn default() -> Self {
        Self {
            risk_fraction: 0.01,
            leverage: 20.0,
            size_precision: 3,
            stop_fraction: 0.02,
            tp_fraction: 0.04,
            trail_fraction: 0.01,
            min_notional: 5.0,
        }
    }
}

/// `(balance * risk_fraction / atr) * leverage`, rounded; 0 when any input is unusable.
pub fn size_from_atr(balance: f64, risk_fraction: f64, atr: f64, leverage: f64, precision: u32) -> f64 {
    if !(balance > 0.0 && atr > 0.0 && risk_fraction > 0.0 && leverage > 0.0) {
        return 0.0;
    }
    round_to(balance * risk_fraction / atr * leverage, precision)
}

pub fn position_size(snap: &MarketSnapshot, balance: f64, p: &SizingParams) -> f64 {
    match (snap.last_close(), snap.at(Column::Atr, 0)) {
        (Some(price), Some(atr)) if price > 0.0 => size_from_atr(balance, p.risk_fraction, atr, p.leverage, p.size_precision),
        _ => 0.0,
    }
}

/// Raise `qty` to the smallest step at `precision` whose notional reaches `min_notional`.
/// Fails when that quantity would cost more than `max_notional`.
pub fn enforce_min_notional(qty: f64, price: f64, precision: u32, min_notional: f64, max_notional: f64) -> Result<f64, ExecError> {
    if !(price > 0.0) {
        return Err(ExecError::MinNotional { notional: 0.0, min: min_notional });
    }
    if qty * price + EPS >= min_notional {
        return Ok(qty);
    }
    let step = 10f64.powi(precision as i32);
    let mut scaled = ((min_notional / price) * step - EPS).ceil() / step;
    if scaled * price + EPS < min_notional {
        scaled += 1.0 / step;
    }
    let scaled = round_to(scaled, precision);
    let notional = scaled * price;
    if notional > max_notional + EPS {
        return Err(ExecError::MinNotional { notional, min: min_notional });
    }
    Ok(scaled)
}

pub fn build_intent(spec: &SymbolSpec, side: Side, quantity: f64, price: f64, p: &SizingParams) -> PositionIntent {
    let entry = round_to(price, spec.price_precision);
    let s = side.sign();
    PositionIntent {
        symbol: spec.symbol.clone(),
        side,
        quantity,
        entry_price: entry,
        stop_price: round_to(entry * (1.0 - s * p.stop_fraction), spec.price_precision),
        target_price: round_to(entry * (1.0 + s * p.tp_fraction), spec.price_precision),
        price_precision: spec.price_precision,
        quantity_precision: spec.quantity_precision,
    }
}

/// Unique per leg; Binance caps client ids at 36 chars.
pub fn client_id(leg: &str) -> String {
    format!("mtf-{}-{:08x}-{}", now_ms(), rand::thread_rng().gen::<u32>(), &leg[..1])
}

pub fn stop_order(intent: &PositionIntent, stop_price: f64) -> OrderRequest {
    OrderRequest {
        client_id: client_id(OrderKind::StopMarket.leg()),
        symbol: intent.symbol.clone(),
        side: intent.side.opposite(),
        kind: OrderKind::StopMarket,
        quantity: intent.quantity,
        price: None,
        stop_price: Some(stop_price),
        reduce_only: true,
    }
}

/// `[entry, stop, target]`.
pub fn bracket_orders(intent: &PositionIntent) -> [OrderRequest; 3] {
    let entry = OrderRequest {
        client_id: client_id(OrderKind::Limit.leg()),
        symbol: intent.symbol.clone(),
        side: intent.side,
        kind: OrderKind::Limit,
        quantity: intent.quantity,
        price: Some(intent.entry_price),
        stop_price: None,
        reduce_only: false,
    };
    let target = OrderRequest {
        client_id: client_id(OrderKind::TakeProfitMarket.leg()),
        kind: OrderKind::TakeProfitMarket,
        stop_price: Some(intent.target_price),
        ..stop_order(intent, intent.stop_price)
    };
    [entry, stop_order(intent, intent.stop_price), target]
}

/// Tighter of the current stop and `last_price` offset by `trail_fraction`,
/// moving only in the position's favor. `None` when nothing changes.
pub fn trail_stop(side: Side, current_stop: f64, last_price: f64, trail_fraction: f64, precision: u32) -> Option<f64> {
    if !(last_price > 0.0) {
        return None;
    }
    let candidate = last_price * (1.0 - side.sign() * trail_fraction);
    let tighter = match side {
        Side::Buy => current_stop.max(candidate),
        Side::Sell => current_stop.min(candidate),
    };
    let next = round_to(tighter, precision);
    let favorable = match side {
        Side::Buy => next > current_stop + EPS,
        Side::Sell => next < current_stop - EPS,
    };
    favorable.then_some(next)
}

/// A submitted bracket, handed to the monitor for trailing and cleanup.
#[derive(Debug, Clone)]
pub struct Bracket {
    pub intent: PositionIntent,
    pub entry: OrderAck,
    pub stop: Option<OrderAck>,
    pub target: Option<OrderAck>,
}

pub struct Executor {
    venue: Arc<Venue>,
    adjuster: Adjuster,
    params: SizingParams,
    brackets: Option<mpsc::Sender<Bracket>>,
    journal: Option<mpsc::Sender<Event>>,
}

impl Executor {
    pub fn new(venue: Arc<Venue>, adjuster: Adjuster, params: SizingParams) -> Self {
        Self { venue, adjuster, params, brackets: None, journal: None }
    }

    pub fn with_monitor(mut self, tx: mpsc::Sender<Bracket>) -> Self {
        self.brackets = Some(tx);
        self
    }

    pub fn with_journal(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.journal = Some(tx);
        self
    }

    fn record(&self, ev: Event) {
        if let Some(tx) = &self.journal {
            let _ = tx.try_send(ev);
        }
    }

    /// Size from the ATR of `snap`, scale by the adjustment model, round and
    /// floor to the venue's rules.
    pub fn quantity(&self, spec: &SymbolSpec, price: f64, balance: f64, snap: &MarketSnapshot) -> Result<f64, ExecError> {
        let raw = position_size(snap, balance, &self.params);
        if raw <= 0.0 {
            return Err(ExecError::InvalidQuantity(raw));
        }
        let features = AdjustmentFeatures::from_snapshot(snap);
        let qty = round_to(raw * self.adjuster.size_multiplier(&features), spec.quantity_precision);
        let min = if spec.min_notional > 0.0 { spec.min_notional } else { self.params.min_notional };
        let qty = enforce_min_notional(qty, price, spec.quantity_precision, min, balance * self.params.leverage)?;
        if !(qty > 0.0) {
            return Err(ExecError::InvalidQuantity(qty));
        }
        Ok(qty)
    }

    pub async fn execute(&self, symbol: &str, decision: Decision, balance: f64, snap: &MarketSnapshot) -> Result<Option<Bracket>, ExecError> {
        let Some(side) = decision.side() else {
            return Ok(None);
        };
        let spec = self
            .venue
            .spec(symbol)
            .ok_or_else(|| ExecError::PrecisionUnavailable(symbol.to_string()))?;
        let price = self.venue.fetch_ticker(symbol).await?;
        let qty = self.quantity(&spec, price, balance, snap)?;
        let intent = build_intent(&spec, side, qty, price, &self.params);
        info!(
            %symbol,
            side = side.as_str(),
            qty,
            entry = intent.entry_price,
            stop = intent.stop_price,
            target = intent.target_price,
            "submitting bracket"
        );

        let [entry_req, stop_req, target_req] = bracket_orders(&intent);
        let entry = self.submit(&entry_req).await?;
        let stop = self.submit(&stop_req).await.ok();
        let target = self.submit(&target_req).await.ok();
        if stop.is_none() || target.is_none() {
            error!(
                %symbol,
                entry_id = %entry.order_id,
                stop_live = stop.is_some(),
                target_live = target.is_some(),
                "partial bracket: entry is live without full protection"
            );
            self.record(Event::Note(format!("partial bracket on {symbol}")));
        }

        let bracket = Bracket { intent, entry, stop, target };
        if let Some(tx) = &self.brackets {
            if tx.send(bracket.clone()).await.is_err() {
                warn!(%symbol, "monitor gone; bracket not tracked");
            }
        }
        Ok(Some(bracket))
    }

    async fn submit(&self, req: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let leg = req.kind.leg();
        match self.venue.create_order(req).await {
            Ok(ack) => {
                ORDERS.with_label_values(&[leg, "ok"]).inc();
                self.record(Event::Ord(req.clone()));
                Ok(ack)
            }
            Err(e) => {
                ORDERS.with_label_values(&[leg, "err"]).inc();
                error!(symbol = %req.symbol, leg, error = %e, "order rejected");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adjust::FixedFactor;
    use crate::domain::{Candle, Timeframe};
    use crate::exchange::scripted::{spec, ScriptedExchange};
    use crate::resilience::ResilienceCfg;
    use crate::snapshot::synthetic_candles;
    use ahash::AHashMap as HashMap;

    fn atr_snapshot(close: f64, atr: f64) -> MarketSnapshot {
        let c = Candle { ts_ms: 0, open: close, high: close, low: close, close, volume: 1.0 };
        let mut cols = HashMap::new();
        cols.insert(Column::Atr, vec![atr]);
        MarketSnapshot::with_columns("BTCUSDT", Timeframe::M15, vec![c], cols)
    }

    #[test]
    fn atr_sizing() {
        let p = SizingParams { risk_fraction: 0.01, leverage: 20.0, size_precision: 3, ..Default::default() };
        assert_eq!(position_size(&atr_snapshot(100.0, 2.0), 1000.0, &p), 100.0);
        assert_eq!(position_size(&atr_snapshot(0.0, 2.0), 1000.0, &p), 0.0);
        let empty = MarketSnapshot::with_columns("BTCUSDT", Timeframe::M15, vec![], HashMap::new());
        assert_eq!(position_size(&empty, 1000.0, &p), 0.0);
    }

    #[test]
    fn min_notional_scales_up_to_integer_quantity() {
        assert_eq!(enforce_min_notional(10.0, 0.01, 0, 5.0, 1_000.0).unwrap(), 500.0);
        assert_eq!(enforce_min_notional(0.01, 300.0, 3, 5.0, 1_000.0).unwrap(), 0.017);
        assert_eq!(enforce_min_notional(1.0, 10.0, 0, 5.0, 1_000.0).unwrap(), 1.0);
    }

    #[test]
    fn min_notional_aborts_when_unaffordable() {
        assert!(matches!(enforce_min_notional(10.0, 0.01, 0, 5.0, 2.0), Err(ExecError::MinNotional { .. })));
        assert!(matches!(enforce_min_notional(10.0, 0.0, 0, 5.0, 1_000.0), Err(ExecError::MinNotional { .. })));
    }

    #[test]
    fn bracket_geometry_by_side() {
        let s = spec("BTCUSDT", 2, 3);
        let p = SizingParams::default();
        let long = build_intent(&s, Side::Buy, 1.0, 100.0, &p);
        assert!(long.stop_price < long.entry_price && long.entry_price < long.target_price);
        let short = build_intent(&s, Side::Sell, 1.0, 100.0, &p);
        assert!(short.target_price < short.entry_price && short.entry_price < short.stop_price);

        let [e, st, tp] = bracket_orders(&long);
        assert_eq!((e.kind, e.side, e.reduce_only), (OrderKind::Limit, Side::Buy, false));
        assert_eq!((st.kind, st.side, st.reduce_only), (OrderKind::StopMarket, Side::Sell, true));
        assert_eq!(tp.kind, OrderKind::TakeProfitMarket);
        assert_eq!(tp.stop_price, Some(104.0));
        assert_ne!(e.client_id, st.client_id);
        assert!(e.client_id.len() <= 36);
    }

    #[test]
    fn trailing_only_tightens() {
        assert_eq!(trail_stop(Side::Buy, 98.0, 105.0, 0.01, 2), Some(103.95));
        assert_eq!(trail_stop(Side::Buy, 98.0, 97.0, 0.01, 2), None);
        assert_eq!(trail_stop(Side::Sell, 102.0, 95.0, 0.01, 2), Some(95.95));
        assert_eq!(trail_stop(Side::Sell, 102.0, 110.0, 0.01, 2), None);
        assert_eq!(trail_stop(Side::Buy, 98.0, 0.0, 0.01, 2), None);
    }

    async fn executor(ex: Arc<ScriptedExchange>) -> (Executor, mpsc::Receiver<Bracket>) {
        let venue = Arc::new(Venue::new(ex, "USDT", vec![], &ResilienceCfg::default()));
        venue.load_markets(&[]).await.unwrap();
        let (tx, rx) = mpsc::channel(8);
        let adj = Adjuster::new(Arc::new(FixedFactor(0.0)));
        (Executor::new(venue, adj, SizingParams::default()).with_monitor(tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn buy_decision_submits_one_bracket() {
        let ex = Arc::new(ScriptedExchange::new(vec![spec("BTCUSDT", 2, 3)]));
        ex.set_price("BTCUSDT", 100.0);
        let (exec, mut rx) = executor(ex.clone()).await;
        let snap = MarketSnapshot::from_candles("BTCUSDT", Timeframe::M15, synthetic_candles(200, 90.0, 0.05)).unwrap();

        let bracket = exec.execute("BTCUSDT", Decision::Up, 1000.0, &snap).await.unwrap().unwrap();
        let orders = ex.orders();
        assert_eq!(orders.len(), 3);
        assert_eq!(orders.iter().filter(|o| o.kind == OrderKind::Limit).count(), 1);
        let entry = orders[0].price.unwrap();
        assert!(orders[1].stop_price.unwrap() < entry);
        assert!(orders[2].stop_price.unwrap() > entry);
        assert!(bracket.stop.is_some() && bracket.target.is_some());
        assert_eq!(rx.recv().await.unwrap().entry.order_id, bracket.entry.order_id);
    }

    #[tokio::test(start_paused = true)]
    async fn none_decision_is_a_noop() {
        let ex = Arc::new(ScriptedExchange::new(vec![spec("BTCUSDT", 2, 3)]));
        ex.set_price("BTCUSDT", 100.0);
        let (exec, _rx) = executor(ex.clone()).await;
        let snap = MarketSnapshot::from_candles("BTCUSDT", Timeframe::M15, synthetic_candles(60, 90.0, 0.05)).unwrap();
        assert!(exec.execute("BTCUSDT", Decision::None, 1000.0, &snap).await.unwrap().is_none());
        assert!(ex.orders().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_symbol_has_no_precision() {
        let ex = Arc::new(ScriptedExchange::new(vec![spec("BTCUSDT", 2, 3)]));
        let (exec, _rx) = executor(ex.clone()).await;
        let snap = atr_snapshot(100.0, 2.0);
        let err = exec.execute("DOGEUSDT", Decision::Up, 1000.0, &snap).await.unwrap_err();
        assert!(matches!(err, ExecError::PrecisionUnavailable(_)));
        assert!(ex.orders().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_leg_still_returns_tracked_bracket() {
        let ex = Arc::new(ScriptedExchange::new(vec![spec("BTCUSDT", 2, 3)]));
        ex.set_price("BTCUSDT", 100.0);
        ex.fail_kind(OrderKind::StopMarket);
        let (exec, _rx) = executor(ex.clone()).await;
        let snap = atr_snapshot(100.0, 2.0);
        let bracket = exec.execute("BTCUSDT", Decision::Up, 1000.0, &snap).await.unwrap().unwrap();
        assert!(bracket.stop.is_none());
        assert!(bracket.target.is_some());
        assert_eq!(ex.orders().len(), 2);
    }
}
