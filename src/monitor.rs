// ===============================
// src/monitor.rs (fills, daily risk & trailing stops)
// ===============================
//
// Background worker next to the control loop:
// - realized PnL from fills -> RiskGovernor::update_loss
// - day rollover -> RiskGovernor::reset_daily_loss
// - live brackets -> trail the stop leg (submit, then cancel the old one),
//   re-place a missing stop, forget once flat
//
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use tokio::{
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::domain::{Event, Fill, PositionInfo};
use crate::exchange::ExchangeError;
use crate::execution::{stop_order, trail_stop, Bracket};
use crate::metrics::{FILLS, OPEN_POSITIONS, ORDERS};
use crate::risk::RiskGovernor;
use crate::venue::Venue;

struct Tracked {
    bracket: Bracket,
    // entry is a resting limit; flat before it fills is not "closed"
    seen_open: bool,
}

pub struct Monitor {
    venue: Arc<Venue>,
    risk: Arc<RiskGovernor>,
    trail_fraction: f64,
    tracked: HashMap<String, Tracked>,
    journal: Option<mpsc::Sender<Event>>,
}

impl Monitor {
    pub fn new(venue: Arc<Venue>, risk: Arc<RiskGovernor>, trail_fraction: f64) -> Self {
        Self { venue, risk, trail_fraction, tracked: HashMap::new(), journal: None }
    }

    pub fn with_journal(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.journal = Some(tx);
        self
    }

    pub fn tracked(&self) -> usize {
        self.tracked.len()
    }

    pub fn track(&mut self, bracket: Bracket) {
        let symbol = bracket.intent.symbol.clone();
        if self.tracked.insert(symbol.clone(), Tracked { bracket, seen_open: false }).is_some() {
            warn!(%symbol, "replacing tracked bracket");
        }
    }

    pub fn on_fill(&self, fill: &Fill) {
        FILLS.inc();
        if let Some(tx) = &self.journal {
            let _ = tx.try_send(Event::Fill(fill.clone()));
        }
        debug!(symbol = %fill.symbol, pnl = fill.realized_pnl, "fill");
        if fill.realized_pnl < 0.0 {
            self.risk.update_loss(-fill.realized_pnl);
        }
    }

    /// One pass over tracked brackets against live positions and prices.
    pub async fn sweep(&mut self) -> Result<(), ExchangeError> {
        self.risk.reset_daily_loss();
        let positions = self.venue.fetch_positions().await?;
        OPEN_POSITIONS.set(positions.len() as i64);
        if self.tracked.is_empty() {
            return Ok(());
        }
        let open: HashMap<&str, &PositionInfo> = positions.iter().map(|p| (p.symbol.as_str(), p)).collect();

        let mut closed = Vec::new();
        for (symbol, t) in self.tracked.iter_mut() {
            if open.contains_key(symbol.as_str()) {
                t.seen_open = true;
                if let Err(e) = trail(&self.venue, t, self.trail_fraction).await {
                    warn!(%symbol, error = %e, "trailing stop update failed");
                }
            } else if t.seen_open {
                closed.push(symbol.clone());
            }
        }
        for symbol in closed {
            if let Some(t) = self.tracked.remove(&symbol) {
                info!(%symbol, "position flat, dropping bracket");
                for leg in [t.bracket.stop, t.bracket.target].into_iter().flatten() {
                    // the other leg usually already fired; a rejected cancel is expected
                    if let Err(e) = self.venue.cancel_order(&symbol, &leg.order_id).await {
                        debug!(%symbol, order_id = %leg.order_id, error = %e, "leftover leg cancel");
                    }
                }
            }
        }
        Ok(())
    }
}

/// Tighten the stop toward the live price, or restore it at the bracket level
/// when the position has no working stop. The replacement goes in before the
/// old leg is cancelled.
async fn trail(venue: &Venue, t: &mut Tracked, trail_fraction: f64) -> Result<(), ExchangeError> {
    let intent = t.bracket.intent.clone();
    let price = venue.fetch_ticker(&intent.symbol).await?;
    let tighter = trail_stop(intent.side, intent.stop_price, price, trail_fraction, intent.price_precision);
    let level = match (tighter, &t.bracket.stop) {
        (Some(next), _) => next,
        (None, None) => intent.stop_price,
        (None, Some(_)) => return Ok(()),
    };

    let ack = match venue.create_order(&stop_order(&intent, level)).await {
        Ok(ack) => {
            ORDERS.with_label_values(&["stop", "ok"]).inc();
            ack
        }
        Err(e) => {
            ORDERS.with_label_values(&["stop", "err"]).inc();
            return Err(e);
        }
    };
    match t.bracket.stop.replace(ack) {
        Some(old) => {
            info!(symbol = %intent.symbol, from = intent.stop_price, to = level, price, "stop trailed");
            if let Err(e) = venue.cancel_order(&intent.symbol, &old.order_id).await {
                warn!(symbol = %intent.symbol, order_id = %old.order_id, error = %e, "superseded stop cancel failed");
            }
        }
        None => warn!(symbol = %intent.symbol, stop = level, price, "unprotected position, stop restored"),
    }
    t.bracket.intent.stop_price = level;
    Ok(())
}

pub async fn run(
    mut monitor: Monitor,
    mut bracket_rx: mpsc::Receiver<Bracket>,
    mut fill_rx: mpsc::Receiver<Fill>,
    period: Duration,
) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(period_s = period.as_secs(), "monitor: started");
    loop {
        tokio::select! {
            Some(b) = bracket_rx.recv() => monitor.track(b),
            Some(f) = fill_rx.recv() => monitor.on_fill(&f),
            _ = tick.tick() => {
                if let Err(e) = monitor.sweep().await {
                    warn!(error = %e, "monitor sweep failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderAck, OrderKind, PositionIntent, Side};
    use crate::exchange::scripted::{spec, ScriptedExchange};
    use crate::resilience::ResilienceCfg;
    use chrono::Local;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ack(id: &str) -> OrderAck {
        OrderAck { order_id: id.into(), client_id: format!("c{id}"), symbol: "BTCUSDT".into() }
    }

    fn long_bracket() -> Bracket {
        Bracket {
            intent: PositionIntent {
                symbol: "BTCUSDT".into(),
                side: Side::Buy,
                quantity: 1.0,
                entry_price: 100.0,
                stop_price: 98.0,
                target_price: 104.0,
                price_precision: 2,
                quantity_precision: 3,
            },
            entry: ack("1"),
            stop: Some(ack("2")),
            target: Some(ack("3")),
        }
    }

    async fn setup() -> (Monitor, Arc<ScriptedExchange>, Arc<AtomicUsize>) {
        let ex = Arc::new(ScriptedExchange::new(vec![spec("BTCUSDT", 2, 3)]));
        let venue = Arc::new(Venue::new(ex.clone(), "USDT", vec![], &ResilienceCfg::default()));
        venue.load_markets(&[]).await.unwrap();
        let halts = Arc::new(AtomicUsize::new(0));
        let h = halts.clone();
        let risk = Arc::new(RiskGovernor::with_halt(50.0, Local::now().date_naive(), move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        (Monitor::new(venue, risk, 0.01), ex, halts)
    }

    #[tokio::test]
    async fn losing_fills_feed_the_governor() {
        let (m, _, halts) = setup().await;
        let fill = |pnl: f64| Fill { symbol: "BTCUSDT".into(), realized_pnl: pnl, ts_ms: 0 };
        m.on_fill(&fill(-30.0));
        m.on_fill(&fill(80.0));
        assert_eq!(m.risk.daily_loss(), 30.0);
        m.on_fill(&fill(-20.0));
        assert_eq!(halts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_long_trails_stop_upward() {
        let (mut m, ex, _) = setup().await;
        m.track(long_bracket());
        ex.set_position("BTCUSDT", 1.0, 100.0);
        ex.set_price("BTCUSDT", 110.0);
        m.sweep().await.unwrap();

        assert_eq!(ex.cancels.lock().unwrap().as_slice(), &[("BTCUSDT".to_string(), "2".to_string())]);
        let orders = ex.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].kind, OrderKind::StopMarket);
        assert_eq!(orders[0].stop_price, Some(108.9));
        assert_eq!(m.tracked.get("BTCUSDT").unwrap().bracket.intent.stop_price, 108.9);

        // price falls back: stop stays put
        ex.set_price("BTCUSDT", 105.0);
        m.sweep().await.unwrap();
        assert_eq!(ex.orders().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_entry_is_kept_then_flat_is_dropped() {
        let (mut m, ex, _) = setup().await;
        // below the trail trigger, so only the flat cleanup cancels
        ex.set_price("BTCUSDT", 98.5);
        m.track(long_bracket());
        m.sweep().await.unwrap();
        assert_eq!(m.tracked(), 1);

        ex.set_position("BTCUSDT", 1.0, 100.0);
        m.sweep().await.unwrap();
        ex.set_position("BTCUSDT", 0.0, 0.0);
        m.sweep().await.unwrap();
        assert_eq!(m.tracked(), 0);
        assert_eq!(ex.cancels.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_stop_is_restored_at_bracket_level() {
        let (mut m, ex, _) = setup().await;
        let mut b = long_bracket();
        b.stop = None;
        m.track(b);
        ex.set_position("BTCUSDT", 1.0, 100.0);
        ex.set_price("BTCUSDT", 98.5);

        for _ in 0..5 {
            m.sweep().await.unwrap();
        }
        let orders = ex.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].kind, OrderKind::StopMarket);
        assert_eq!(orders[0].side, Side::Sell);
        assert_eq!(orders[0].stop_price, Some(98.0));
        assert!(orders[0].reduce_only);
        assert!(m.tracked.get("BTCUSDT").unwrap().bracket.stop.is_some());
        assert!(ex.cancels.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_replacement_keeps_the_old_stop() {
        let (mut m, ex, _) = setup().await;
        m.track(long_bracket());
        ex.set_position("BTCUSDT", 1.0, 100.0);
        ex.set_price("BTCUSDT", 110.0);
        ex.fail_kind(OrderKind::StopMarket);

        assert!(m.sweep().await.is_ok());
        assert!(ex.cancels.lock().unwrap().is_empty());
        let t = m.tracked.get("BTCUSDT").unwrap();
        assert_eq!(t.bracket.stop.as_ref().unwrap().order_id, "2");
        assert_eq!(t.bracket.intent.stop_price, 98.0);
    }
}
