// ===============================
// src/risk.rs
// ===============================
//
// Daily-loss governor. Active -> Halted, and Halted never comes back:
// the halt hook terminates the process (a restart is an operator decision).
//
use std::sync::{Mutex, PoisonError};

use chrono::{Local, NaiveDate};
use tracing::{error, info, warn};

use crate::metrics::DAILY_LOSS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskState {
    Active,
    Halted,
}

#[derive(Debug)]
struct Ledger {
    daily_loss: f64,
    day: NaiveDate,
    state: RiskState,
}

type HaltHook = Box<dyn Fn(f64, f64) + Send + Sync>;

pub struct RiskGovernor {
    limit: f64,
    ledger: Mutex<Ledger>,
    on_halt: HaltHook,
}

impl RiskGovernor {
    /// Production governor: a breach exits the process with status 2.
    pub fn new(limit: f64) -> Self {
        Self::with_halt(limit, Local::now().date_naive(), |loss, limit| {
            error!(daily_loss = loss, limit, "daily loss limit reached, halting trading");
            std::process::exit(2);
        })
    }

    pub fn with_halt<F>(limit: f64, today: NaiveDate, on_halt: F) -> Self
    where
        F: Fn(f64, f64) + Send + Sync + 'static,
    {
        Self {
            limit,
            ledger: Mutex::new(Ledger { daily_loss: 0.0, day: today, state: RiskState::Active }),
            on_halt: Box::new(on_halt),
        }
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn daily_loss(&self) -> f64 {
        self.ledger().daily_loss
    }

    pub fn state(&self) -> RiskState {
        self.ledger().state
    }

    pub fn is_halted(&self) -> bool {
        self.state() == RiskState::Halted
    }

    /// Accumulate a realized loss (positive amount). Gains are ignored.
    pub fn update_loss(&self, amount: f64) {
        if !amount.is_finite() || amount <= 0.0 {
            return;
        }
        let breached = {
            let mut l = self.ledger();
            if l.state == RiskState::Halted {
                return;
            }
            l.daily_loss += amount;
            DAILY_LOSS.set(l.daily_loss);
            if l.daily_loss >= self.limit {
                l.state = RiskState::Halted;
                Some(l.daily_loss)
            } else {
                None
            }
        };
        match breached {
            // hook runs outside the lock; the state flip above makes it fire once
            Some(total) => (self.on_halt)(total, self.limit),
            None => info!(amount, daily_loss = self.daily_loss(), limit = self.limit, "loss recorded"),
        }
    }

    pub fn reset_daily_loss(&self) -> bool {
        self.reset_daily_loss_at(Local::now().date_naive())
    }

    /// Zero the accumulator if `today` is a new day. Returns whether it did.
    pub fn reset_daily_loss_at(&self, today: NaiveDate) -> bool {
        let mut l = self.ledger();
        if l.day == today {
            return false;
        }
        if l.state == RiskState::Halted {
            warn!("day rolled over while halted; staying halted");
        }
        info!(previous = %l.day, %today, carried = l.daily_loss, "daily loss reset");
        l.daily_loss = 0.0;
        l.day = today;
        DAILY_LOSS.set(0.0);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn governor(limit: f64) -> (RiskGovernor, Arc<AtomicUsize>) {
        let halts = Arc::new(AtomicUsize::new(0));
        let h = halts.clone();
        let g = RiskGovernor::with_halt(limit, day(1), move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        (g, halts)
    }

    #[test]
    fn halts_exactly_once_at_limit() {
        let (g, halts) = governor(100.0);
        g.update_loss(40.0);
        g.update_loss(59.0);
        assert_eq!(halts.load(Ordering::SeqCst), 0);
        assert_eq!(g.state(), RiskState::Active);
        g.update_loss(1.0);
        assert_eq!(halts.load(Ordering::SeqCst), 1);
        assert!(g.is_halted());
        g.update_loss(50.0);
        assert_eq!(halts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn gains_do_not_offset_losses() {
        let (g, _) = governor(100.0);
        g.update_loss(30.0);
        g.update_loss(-500.0);
        g.update_loss(f64::NAN);
        assert_eq!(g.daily_loss(), 30.0);
    }

    #[test]
    fn same_day_reset_is_noop() {
        let (g, _) = governor(100.0);
        g.update_loss(70.0);
        assert!(!g.reset_daily_loss_at(day(1)));
        assert_eq!(g.daily_loss(), 70.0);
    }

    #[test]
    fn new_day_zeroes_accumulator() {
        let (g, halts) = governor(100.0);
        g.update_loss(99.0);
        assert!(g.reset_daily_loss_at(day(2)));
        assert_eq!(g.daily_loss(), 0.0);
        g.update_loss(99.0);
        assert_eq!(halts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn halted_survives_day_rollover() {
        let (g, halts) = governor(10.0);
        g.update_loss(10.0);
        g.reset_daily_loss_at(day(3));
        assert!(g.is_halted());
        g.update_loss(20.0);
        assert_eq!(halts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_updates_are_not_torn() {
        let (g, halts) = governor(1_000_000.0);
        let g = Arc::new(g);
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let g = g.clone();
                std::thread::spawn(move || (0..1000).for_each(|_| g.update_loss(1.0)))
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(g.daily_loss(), 8000.0);
        assert_eq!(halts.load(Ordering::SeqCst), 0);
    }
}
