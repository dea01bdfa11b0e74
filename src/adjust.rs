// ===============================
// src/adjust.rs
// ===============================
//
// One adjustment factor per evaluation, derived from market features.
// Weights, decision threshold and position size all scale by (1 + factor),
// always computed from the same feature set.
//
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::signals::Indicator;
use crate::snapshot::{Column, MarketSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AdjustmentFeatures {
    /// Rolling close std / rolling mean close.
    pub volatility: f64,
    pub avg_volume: f64,
    /// Latest RSI minus the previous one.
    pub rsi_change: f64,
}

impl AdjustmentFeatures {
    pub fn from_snapshot(s: &MarketSnapshot) -> Self {
        let volatility = match (s.at(Column::CloseStd, 0), s.at(Column::CloseMean, 0)) {
            (Some(sd), Some(mean)) if mean > 0.0 => sd / mean,
            _ => 0.0,
        };
        let avg_volume = s.at(Column::VolumeSma, 0).unwrap_or(0.0);
        let rsi_change = match (s.at(Column::Rsi, 0), s.at(Column::Rsi, 1)) {
            (Some(now), Some(before)) => now - before,
            _ => 0.0,
        };
        Self { volatility, avg_volume, rsi_change }
    }
}

/// `features -> adjustment factor`. Swap in a trained estimator here.
pub trait AdjustmentModel: Send + Sync {
    fn factor(&self, features: &AdjustmentFeatures) -> f64;
}

/// Placeholder linear model. Volume enters on a log10 scale so raw
/// exchange volumes do not swamp the other terms.
#[derive(Debug, Clone, Copy)]
pub struct LinearAdjustment {
    pub volatility_coef: f64,
    pub volume_coef: f64,
    pub rsi_coef: f64,
    pub min_factor: f64,
    pub max_factor: f64,
}

impl Default for LinearAdjustment {
    fn default() -> Self {
        Self { volatility_coef: 0.5, volume_coef: 0.01, rsi_coef: 0.002, min_factor: -0.5, max_factor: 0.5 }
    }
}

impl AdjustmentModel for LinearAdjustment {
    fn factor(&self, f: &AdjustmentFeatures) -> f64 {
        let raw = self.volatility_coef * f.volatility
            + self.volume_coef * (1.0 + f.avg_volume.max(0.0)).log10()
            + self.rsi_coef * f.rsi_change.abs();
        if raw.is_finite() { raw.clamp(self.min_factor, self.max_factor) } else { 0.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightSet([f64; Indicator::COUNT]);

impl Default for WeightSet {
    fn default() -> Self {
        let mut w = [0.0; Indicator::COUNT];
        for ind in Indicator::ALL {
            w[ind.index()] = match ind {
                Indicator::Rsi | Indicator::Macd => 0.10,
                Indicator::Fibonacci | Indicator::Momentum | Indicator::Candlestick => 0.06,
                Indicator::VolumeSpike | Indicator::Stochastic => 0.07,
                _ => 0.08,
            };
        }
        Self(w)
    }
}

impl WeightSet {
    #[cfg(test)]
    pub fn uniform(w: f64) -> Self {
        Self([w; Indicator::COUNT])
    }

    pub fn get(&self, ind: Indicator) -> f64 {
        self.0[ind.index()]
    }

    pub fn set(&mut self, ind: Indicator, w: f64) {
        self.0[ind.index()] = w;
    }

    pub fn all_positive(&self) -> bool {
        self.0.iter().all(|w| w.is_finite() && *w > 0.0)
    }

    pub fn scaled(&self, k: f64) -> Self {
        let mut w = self.0;
        w.iter_mut().for_each(|x| *x *= k);
        Self(w)
    }
}

/// Shared handle on the active model.
#[derive(Clone)]
pub struct Adjuster {
    model: Arc<dyn AdjustmentModel>,
}

impl Adjuster {
    pub fn new(model: Arc<dyn AdjustmentModel>) -> Self {
        Self { model }
    }

    pub fn factor(&self, features: &AdjustmentFeatures) -> f64 {
        self.model.factor(features)
    }

    pub fn adjust_weights(&self, base: &WeightSet, features: &AdjustmentFeatures) -> WeightSet {
        base.scaled(1.0 + self.factor(features))
    }

    pub fn adjust_threshold(&self, base: f64, features: &AdjustmentFeatures) -> f64 {
        base * (1.0 + self.factor(features))
    }

    /// Multiplier applied to the raw position size.
    pub fn size_multiplier(&self, features: &AdjustmentFeatures) -> f64 {
        1.0 + self.factor(features)
    }
}

impl Default for Adjuster {
    fn default() -> Self {
        Self::new(Arc::new(LinearAdjustment::default()))
    }
}

#[cfg(test)]
pub(crate) struct FixedFactor(pub f64);

#[cfg(test)]
impl AdjustmentModel for FixedFactor {
    fn factor(&self, _: &AdjustmentFeatures) -> f64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Timeframe;
    use crate::snapshot::synthetic_candles;

    #[test]
    fn default_weights_are_positive_and_sum_to_one() {
        let w = WeightSet::default();
        assert!(w.all_positive());
        let total: f64 = Indicator::ALL.iter().map(|i| w.get(*i)).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn weights_and_threshold_scale_together() {
        let adj = Adjuster::new(Arc::new(FixedFactor(0.2)));
        let f = AdjustmentFeatures::default();
        let w = adj.adjust_weights(&WeightSet::uniform(0.1), &f);
        assert!((w.get(Indicator::Adx) - 0.12).abs() < 1e-12);
        assert!((adj.adjust_threshold(0.2, &f) - 0.24).abs() < 1e-12);
        assert!((adj.size_multiplier(&f) - 1.2).abs() < 1e-12);
    }

    #[test]
    fn linear_model_is_clamped() {
        let m = LinearAdjustment::default();
        let wild = AdjustmentFeatures { volatility: 10.0, avg_volume: 1e12, rsi_change: 90.0 };
        assert_eq!(m.factor(&wild), 0.5);
        let calm = AdjustmentFeatures { volatility: 0.01, avg_volume: 999.0, rsi_change: -5.0 };
        // 0.005 + 0.03 + 0.01
        assert!((m.factor(&calm) - 0.045).abs() < 1e-9);
        let broken = AdjustmentFeatures { volatility: f64::NAN, avg_volume: 0.0, rsi_change: 0.0 };
        assert_eq!(m.factor(&broken), 0.0);
    }

    #[test]
    fn features_from_snapshot() {
        let s = MarketSnapshot::from_candles("BTCUSDT", Timeframe::M15, synthetic_candles(60, 100.0, 0.5)).unwrap();
        let f = AdjustmentFeatures::from_snapshot(&s);
        assert!(f.volatility > 0.0);
        assert!(f.avg_volume > 1_000.0);
        assert!(f.rsi_change.is_finite());
    }
}
