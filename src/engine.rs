// ===============================
// src/engine.rs
// ===============================
//
// Aggregation: signals x adjusted weights -> score -> decision.
// Confirmation: the same decision on every timeframe, or nothing.
//
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::debug;

use crate::adjust::{AdjustmentFeatures, Adjuster, WeightSet};
use crate::domain::{Decision, Timeframe};
use crate::signals::SignalVector;
use crate::snapshot::{MarketSnapshot, SnapshotProvider};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Evaluation {
    pub decision: Decision,
    pub score: f64,
    pub threshold: f64,
    pub signals: SignalVector,
}

/// Weighted sum over non-zero signals only.
pub fn score(signals: &SignalVector, weights: &WeightSet) -> f64 {
    signals.active().map(|(ind, v)| weights.get(ind) * f64::from(v)).sum()
}

pub fn decide(score: f64, threshold: f64) -> Decision {
    if score >= threshold {
        Decision::Up
    } else if score <= -threshold {
        Decision::Down
    } else {
        Decision::None
    }
}

#[derive(Clone)]
pub struct Aggregator {
    pub base_weights: WeightSet,
    pub base_threshold: f64,
    pub adjuster: Adjuster,
}

impl Aggregator {
    pub fn new(base_weights: WeightSet, base_threshold: f64, adjuster: Adjuster) -> Self {
        Self { base_weights, base_threshold, adjuster }
    }

    pub fn evaluate(&self, snap: &MarketSnapshot) -> Evaluation {
        let signals = SignalVector::compute(snap);
        let features = AdjustmentFeatures::from_snapshot(snap);
        self.evaluate_signals(signals, &features)
    }

    /// Weights and threshold come from one feature set, so they move together.
    pub fn evaluate_signals(&self, signals: SignalVector, features: &AdjustmentFeatures) -> Evaluation {
        let weights = self.adjuster.adjust_weights(&self.base_weights, features);
        let threshold = self.adjuster.adjust_threshold(self.base_threshold, features);
        // all-zero vector must never trade, even if a model drives the threshold to 0
        if signals.is_flat() {
            return Evaluation { decision: Decision::None, score: 0.0, threshold, signals };
        }
        let score = score(&signals, &weights);
        Evaluation { decision: decide(score, threshold), score, threshold, signals }
    }
}

/// Unanimous, non-empty agreement; anything else is `None`.
pub fn combine(decisions: &[Decision]) -> Decision {
    match decisions.split_first() {
        Some((first, rest)) if *first != Decision::None && rest.iter().all(|d| d == first) => *first,
        _ => Decision::None,
    }
}

#[derive(Debug, Clone)]
pub struct Confirmation {
    pub decision: Decision,
    pub snapshots: Vec<Arc<MarketSnapshot>>,
}

impl Confirmation {
    fn none(snapshots: Vec<Arc<MarketSnapshot>>) -> Self {
        Self { decision: Decision::None, snapshots }
    }

    pub fn snapshot(&self, tf: Timeframe) -> Option<&Arc<MarketSnapshot>> {
        self.snapshots.iter().find(|s| s.timeframe == tf)
    }
}

/// Decision across already-fetched snapshots, one per timeframe.
pub fn confirm_snapshots(agg: &Aggregator, snapshots: &[Arc<MarketSnapshot>]) -> Decision {
    if snapshots.len() != Timeframe::ALL.len() {
        return Decision::None;
    }
    if snapshots.iter().any(|s| s.timeframe.needs_full_history() && !s.has_full_history()) {
        return Decision::None;
    }
    let decisions: Vec<Decision> = snapshots
        .iter()
        .map(|s| {
            let ev = agg.evaluate(s);
            debug!(
                symbol = %s.symbol,
                timeframe = s.timeframe.as_str(),
                score = ev.score,
                threshold = ev.threshold,
                decision = ev.decision.as_str(),
                "timeframe evaluated"
            );
            ev.decision
        })
        .collect();
    combine(&decisions)
}

/// Slow timeframes first: a short history there ends the check before the
/// fast ones are fetched. Then require unanimity across all five.
pub async fn confirm(provider: &SnapshotProvider, agg: &Aggregator, symbol: &str) -> Confirmation {
    let (slow, fast): (Vec<Timeframe>, Vec<Timeframe>) =
        Timeframe::ALL.iter().copied().partition(|tf| tf.needs_full_history());

    let fetched = join_all(slow.iter().map(|tf| provider.snapshot(symbol, *tf))).await;
    let mut snapshots: Vec<Arc<MarketSnapshot>> = fetched.into_iter().flatten().collect();
    if snapshots.len() != slow.len() || snapshots.iter().any(|s| !s.has_full_history()) {
        debug!(%symbol, "slow timeframe history too short");
        return Confirmation::none(snapshots);
    }

    let fetched = join_all(fast.iter().map(|tf| provider.snapshot(symbol, *tf))).await;
    snapshots.extend(fetched.into_iter().flatten());
    if snapshots.len() != Timeframe::ALL.len() {
        return Confirmation::none(snapshots);
    }
    let decision = confirm_snapshots(agg, &snapshots);
    Confirmation { decision, snapshots }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adjust::FixedFactor;
    use crate::signals::Indicator;
    use crate::snapshot::synthetic_candles;

    fn agg(weights: WeightSet, threshold: f64, factor: f64) -> Aggregator {
        Aggregator::new(weights, threshold, Adjuster::new(Arc::new(FixedFactor(factor))))
    }

    #[test]
    fn zero_signals_never_decide() {
        let a = agg(WeightSet::default(), 0.0, 0.0);
        let ev = a.evaluate_signals(SignalVector::default(), &AdjustmentFeatures::default());
        assert_eq!(ev.decision, Decision::None);
        assert_eq!(ev.score, 0.0);
    }

    #[test]
    fn score_ignores_neutral_indicators() {
        let mut w = WeightSet::uniform(0.1);
        w.set(Indicator::Adx, 5.0);
        let v = SignalVector::from_pairs(&[(Indicator::Rsi, 1), (Indicator::Macd, -1), (Indicator::Bollinger, 1)]);
        assert!((score(&v, &w) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn decision_boundaries_are_inclusive() {
        assert_eq!(decide(0.2, 0.2), Decision::Up);
        assert_eq!(decide(-0.2, 0.2), Decision::Down);
        assert_eq!(decide(0.199, 0.2), Decision::None);
    }

    #[test]
    fn four_agree_one_none_is_none() {
        use Decision::*;
        assert_eq!(combine(&[Up, Up, Up, Up, None]), None);
        assert_eq!(combine(&[Down, Down, Down, Down, Up]), None);
        assert_eq!(combine(&[Down; 5]), Down);
        assert_eq!(combine(&[None; 5]), None);
        assert_eq!(combine(&[]), None);
    }

    #[test]
    fn adjusted_score_clears_adjusted_threshold() {
        let mut w = WeightSet::uniform(0.01);
        w.set(Indicator::Rsi, 0.125);
        w.set(Indicator::Macd, 0.125);
        w.set(Indicator::Ichimoku, 1.0 / 24.0);
        let a = agg(w, 0.2, 0.2);
        let v = SignalVector::from_pairs(&[(Indicator::Rsi, 1), (Indicator::Macd, 1), (Indicator::Ichimoku, 1)]);
        let decisions: Vec<Decision> = Timeframe::ALL
            .iter()
            .map(|_| {
                let ev = a.evaluate_signals(v, &AdjustmentFeatures::default());
                assert!((ev.score - 0.35).abs() < 1e-9);
                assert!((ev.threshold - 0.24).abs() < 1e-9);
                ev.decision
            })
            .collect();
        assert_eq!(combine(&decisions), Decision::Up);
    }

    #[test]
    fn short_slow_timeframe_blocks_confirmation() {
        let a = agg(WeightSet::default(), 0.2, 0.0);
        let snaps: Vec<Arc<MarketSnapshot>> = Timeframe::ALL
            .iter()
            .map(|tf| {
                let n = if *tf == Timeframe::H4 { 120 } else { 200 };
                Arc::new(MarketSnapshot::from_candles("BTCUSDT", *tf, synthetic_candles(n, 100.0, 0.2)).unwrap())
            })
            .collect();
        assert_eq!(confirm_snapshots(&a, &snaps), Decision::None);
        assert_eq!(confirm_snapshots(&a, &snaps[..4]), Decision::None);
    }

    #[tokio::test(start_paused = true)]
    async fn short_slow_history_skips_fast_fetches() {
        use crate::exchange::scripted::{spec, ScriptedExchange};
        use crate::resilience::ResilienceCfg;
        use crate::venue::Venue;
        use tokio::time::Duration;

        let ex = Arc::new(ScriptedExchange::new(vec![spec("BTCUSDT", 2, 3)]));
        for tf in Timeframe::ALL {
            let n = if tf == Timeframe::H1 { 150 } else { 200 };
            ex.set_candles(tf, synthetic_candles(n, 100.0, 0.2));
        }
        let venue = Arc::new(Venue::new(ex.clone(), "USDT", vec![], &ResilienceCfg::default()));
        venue.load_markets(&[]).await.unwrap();
        let provider = SnapshotProvider::new(venue, Duration::from_secs(60));

        let conf = confirm(&provider, &agg(WeightSet::default(), 0.2, 0.0), "BTCUSDT").await;
        assert_eq!(conf.decision, Decision::None);
        let asked = ex.ohlcv_calls.lock().unwrap().clone();
        assert_eq!(asked.len(), 3);
        assert!(asked.iter().all(|tf| tf.needs_full_history()));
        assert!(conf.snapshot(Timeframe::M1).is_none());
    }
}
