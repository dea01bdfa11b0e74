// ===============================
// src/resilience.rs
// ===============================
//
// Wrappers that make repeated remote calls safe:
// - RateLimiter    : minimum spacing between calls (FIFO, blocks only the caller)
// - CircuitBreaker : consecutive-failure counter with a full cooldown once tripped
// - TtlCache       : key -> (value, inserted_at), misses after expiry
// - Resilient      : limiter + breaker composed around one remote operation
//
// All clocks are tokio::time::Instant so paused-time tests drive them.
//
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

use ahash::AHashMap as HashMap;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, warn};

use crate::metrics::{API_CALLS, BREAKER_COOLDOWNS};

pub struct RateLimiter {
    min_interval: Duration,
    last: tokio::sync::Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(max_calls_per_sec: f64) -> Self {
        let min_interval = if max_calls_per_sec > 0.0 && max_calls_per_sec.is_finite() {
            Duration::from_secs_f64(1.0 / max_calls_per_sec)
        } else {
            Duration::ZERO
        };
        Self { min_interval, last: tokio::sync::Mutex::new(None) }
    }

    /// Wait until the next slot is free. The lock is held across the sleep so
    /// queued callers are released one interval apart, in arrival order.
    pub async fn acquire(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.min_interval;
            if Instant::now() < ready_at {
                sleep(ready_at - Instant::now()).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CircuitState {
    pub failure_count: u32,
    pub last_failure_at: Option<Instant>,
}

pub struct CircuitBreaker {
    max_failures: u32,
    reset_time: Duration,
    retry_pause: Duration,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, reset_time: Duration, retry_pause: Duration) -> Self {
        Self { max_failures: max_failures.max(1), reset_time, retry_pause, state: Mutex::new(CircuitState::default()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn retry_pause(&self) -> Duration {
        self.retry_pause
    }

    /// Returns the cooldown to serve before the next call, if the breaker is open.
    /// An expired cooldown closes the breaker on the spot.
    fn pending_cooldown(&self) -> Option<Duration> {
        let mut st = self.lock();
        if st.failure_count < self.max_failures {
            return None;
        }
        match st.last_failure_at {
            Some(at) if at.elapsed() < self.reset_time => Some(self.reset_time),
            _ => {
                st.failure_count = 0;
                None
            }
        }
    }

    /// Delay the caller by the full reset time when tripped, then close.
    pub async fn wait_if_open(&self, op: &str) -> bool {
        match self.pending_cooldown() {
            Some(cooldown) => {
                warn!(op, cooldown_s = cooldown.as_secs_f64(), "circuit open, cooling down");
                BREAKER_COOLDOWNS.with_label_values(&[op]).inc();
                sleep(cooldown).await;
                self.lock().failure_count = 0;
                true
            }
            None => false,
        }
    }

    pub fn record_success(&self) {
        let mut st = self.lock();
        st.failure_count = 0;
        st.last_failure_at = None;
    }

    pub fn record_failure(&self) {
        let mut st = self.lock();
        st.failure_count = st.failure_count.saturating_add(1);
        st.last_failure_at = Some(Instant::now());
    }
}

pub struct TtlCache<K, V> {
    expiry: Duration,
    entries: Mutex<HashMap<K, (V, Instant)>>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(expiry: Duration) -> Self {
        Self { expiry, entries: Mutex::new(HashMap::new()) }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some((value, inserted_at)) if inserted_at.elapsed() < self.expiry => Some(value.clone()),
            _ => None,
        }
    }

    /// Unconditional overwrite; entries are replaced, never merged.
    pub fn set(&self, key: K, value: V) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key, (value, Instant::now()));
    }

    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, (_, inserted_at)| inserted_at.elapsed() < self.expiry);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResilienceCfg {
    pub max_calls_per_sec: f64,
    pub max_failures: u32,
    pub reset_time: Duration,
    pub retry_pause: Duration,
}

impl Default for ResilienceCfg {
    fn default() -> Self {
        Self {
            max_calls_per_sec: 5.0,
            max_failures: 3,
            reset_time: Duration::from_secs(60),
            retry_pause: Duration::from_secs(2),
        }
    }
}

/// Rate limiter and circuit breaker guarding one remote operation.
pub struct Resilient {
    name: &'static str,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
}

impl Resilient {
    pub fn new(name: &'static str, cfg: &ResilienceCfg) -> Self {
        Self {
            name,
            limiter: RateLimiter::new(cfg.max_calls_per_sec),
            breaker: CircuitBreaker::new(cfg.max_failures, cfg.reset_time, cfg.retry_pause),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run `op` once, retrying exactly once after the breaker's pause on failure.
    /// Both attempts count against the breaker.
    pub async fn call<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.breaker.wait_if_open(self.name).await;
        self.limiter.acquire().await;
        match op().await {
            Ok(v) => {
                self.breaker.record_success();
                API_CALLS.with_label_values(&[self.name, "ok"]).inc();
                Ok(v)
            }
            Err(e) => {
                self.breaker.record_failure();
                API_CALLS.with_label_values(&[self.name, "err"]).inc();
                warn!(op = self.name, error = %e, "remote call failed, retrying once");
                sleep(self.breaker.retry_pause()).await;
                self.limiter.acquire().await;
                match op().await {
                    Ok(v) => {
                        self.breaker.record_success();
                        API_CALLS.with_label_values(&[self.name, "ok"]).inc();
                        debug!(op = self.name, "retry succeeded");
                        Ok(v)
                    }
                    Err(e) => {
                        self.breaker.record_failure();
                        API_CALLS.with_label_values(&[self.name, "err"]).inc();
                        Err(e)
                    }
                }
            }
        }
    }
}
