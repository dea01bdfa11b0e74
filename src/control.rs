// ===============================
// src/control.rs
// ===============================
//
// One cycle: daily reset -> balance -> symbols & open positions ->
// confirm each free symbol -> execute -> stop at the position cap.
// Cycle failures are classified, counted and cooled down; the loop never ends
// on its own (only the risk halt terminates the process).
//
use std::sync::Arc;

use ahash::AHashSet as HashSet;
use tokio::{
    sync::mpsc,
    time::{sleep, Duration},
};
use tracing::{debug, error, info, warn};

use crate::config::Pacing;
use crate::domain::{now_ms, Decision, Event, Timeframe};
use crate::engine::{confirm, Aggregator};
use crate::exchange::{ErrorClass, ExchangeError};
use crate::execution::{ExecError, Executor};
use crate::metrics::{BALANCE, CYCLES, CYCLE_ERRORS, DECISIONS};
use crate::risk::RiskGovernor;
use crate::snapshot::SnapshotProvider;
use crate::venue::Venue;

/// Cooldown multipliers for consecutive failed cycles; the last one repeats.
const COOLDOWN_STEPS: [u32; 4] = [1, 1, 2, 3];

pub fn cooldown_for(consecutive_failures: usize, base: Duration) -> Duration {
    let i = consecutive_failures.saturating_sub(1).min(COOLDOWN_STEPS.len() - 1);
    base * COOLDOWN_STEPS[i]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed { scanned: usize, opened: Vec<String> },
    NoBalance,
    Halted,
}

pub struct Controller {
    pub venue: Arc<Venue>,
    pub provider: SnapshotProvider,
    pub aggregator: Aggregator,
    pub executor: Executor,
    pub risk: Arc<RiskGovernor>,
    pub max_open_positions: usize,
    pub sizing_timeframe: Timeframe,
    pub pacing: Pacing,
    pub journal: Option<mpsc::Sender<Event>>,
}

impl Controller {
    fn record(&self, ev: Event) {
        if let Some(tx) = &self.journal {
            let _ = tx.try_send(ev);
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleOutcome, ExchangeError> {
        self.risk.reset_daily_loss();
        if self.risk.is_halted() {
            return Ok(CycleOutcome::Halted);
        }

        let balance = self.venue.fetch_balance().await?;
        BALANCE.set(balance);
        if !(balance > 0.0) {
            return Ok(CycleOutcome::NoBalance);
        }

        let symbols = self.venue.list_symbols();
        let mut open: HashSet<String> = self.venue.fetch_positions().await?.into_iter().map(|p| p.symbol).collect();
        let mut opened = Vec::new();
        let mut scanned = 0usize;
        debug!(symbols = symbols.len(), open = open.len(), balance, "cycle start");

        for symbol in &symbols {
            if open.len() >= self.max_open_positions {
                info!(cap = self.max_open_positions, "position cap reached, scan stopped");
                break;
            }
            if open.contains(symbol) {
                continue;
            }
            scanned += 1;

            let conf = confirm(&self.provider, &self.aggregator, symbol).await;
            DECISIONS.with_label_values(&[conf.decision.as_str()]).inc();
            if conf.decision == Decision::None {
                continue;
            }
            self.record(Event::Decision { symbol: symbol.clone(), decision: conf.decision, ts_ms: now_ms() });
            info!(%symbol, decision = conf.decision.as_str(), "all timeframes agree");

            let Some(snap) = conf.snapshot(self.sizing_timeframe) else {
                continue;
            };
            match self.executor.execute(symbol, conf.decision, balance, snap).await {
                Ok(Some(_)) => {
                    open.insert(symbol.clone());
                    opened.push(symbol.clone());
                }
                Ok(None) => {}
                Err(ExecError::Exchange(e)) => match ErrorClass::of(&e) {
                    ErrorClass::OrderConstraintViolation | ErrorClass::DataValidation => {
                        warn!(%symbol, error = %e, "trade aborted by exchange rules");
                    }
                    _ => return Err(e),
                },
                Err(e) => warn!(%symbol, error = %e, "trade aborted"),
            }
        }

        let purged = self.provider.purge_expired();
        CYCLES.inc();
        debug!(purged, "cycle done");
        Ok(CycleOutcome::Completed { scanned, opened })
    }
}

/// Forever (or once): cycle, then sleep according to the outcome.
pub async fn run(ctl: &Controller, once: bool) {
    let mut failures = 0usize;
    loop {
        let wait = match ctl.run_cycle().await {
            Ok(CycleOutcome::Completed { scanned, opened }) => {
                failures = 0;
                info!(scanned, opened = ?opened, "cycle complete");
                ctl.pacing.cycle
            }
            Ok(CycleOutcome::NoBalance) => {
                warn!(pause_s = ctl.pacing.zero_balance_pause.as_secs(), "no available balance, pausing");
                ctl.pacing.zero_balance_pause
            }
            Ok(CycleOutcome::Halted) => {
                error!("risk governor halted, no trading");
                ctl.pacing.cycle
            }
            Err(e) => {
                failures += 1;
                let class = ErrorClass::of(&e);
                CYCLE_ERRORS.with_label_values(&[class.as_str()]).inc();
                let wait = cooldown_for(failures, ctl.pacing.error_cooldown);
                error!(class = class.as_str(), error = %e, failures, cooldown_s = wait.as_secs(), "cycle failed");
                wait
            }
        };
        if once {
            return;
        }
        sleep(wait).await;
    }
}
