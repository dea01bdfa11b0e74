// ===============================
// src/signals.rs
// ===============================
//
// Thirteen independent signals, each snapshot -> {-1, 0, 1}.
// Every rule is written as `Option<i8>`: a missing or warming-up column short
// circuits to None, which the public entry point turns into a neutral 0.
// Nothing here can fail.
//
use serde::{Deserialize, Serialize};

use crate::domain::Candle;
use crate::snapshot::{Column, MarketSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Indicator {
    Rsi,
    Macd,
    EmaCross,
    MaCross,
    SupportResistance,
    Fibonacci,
    VolumeSpike,
    Bollinger,
    Stochastic,
    Momentum,
    Candlestick,
    Ichimoku,
    Adx,
}

impl Indicator {
    pub const COUNT: usize = 13;
    pub const ALL: [Indicator; Indicator::COUNT] = [
        Indicator::Rsi,
        Indicator::Macd,
        Indicator::EmaCross,
        Indicator::MaCross,
        Indicator::SupportResistance,
        Indicator::Fibonacci,
        Indicator::VolumeSpike,
        Indicator::Bollinger,
        Indicator::Stochastic,
        Indicator::Momentum,
        Indicator::Candlestick,
        Indicator::Ichimoku,
        Indicator::Adx,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Indicator::Rsi => "rsi",
            Indicator::Macd => "macd",
            Indicator::EmaCross => "ema_cross",
            Indicator::MaCross => "ma_cross",
            Indicator::SupportResistance => "support_resistance",
            Indicator::Fibonacci => "fibonacci",
            Indicator::VolumeSpike => "volume_spike",
            Indicator::Bollinger => "bollinger",
            Indicator::Stochastic => "stochastic",
            Indicator::Momentum => "momentum",
            Indicator::Candlestick => "candlestick",
            Indicator::Ichimoku => "ichimoku",
            Indicator::Adx => "adx",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|i| i.name() == s)
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Evaluate against the latest row(s). Total: never fails, never leaves {-1, 0, 1}.
    pub fn evaluate(&self, s: &MarketSnapshot) -> i8 {
        let raw = match self {
            Indicator::Rsi => rsi(s),
            Indicator::Macd => macd(s),
            Indicator::EmaCross => cross(s, Column::Ema12, Column::Ema26),
            Indicator::MaCross => cross(s, Column::Sma20, Column::Sma50),
            Indicator::SupportResistance => support_resistance(s),
            Indicator::Fibonacci => fibonacci(s),
            Indicator::VolumeSpike => volume_spike(s),
            Indicator::Bollinger => bollinger(s),
            Indicator::Stochastic => stochastic(s),
            Indicator::Momentum => momentum(s),
            Indicator::Candlestick => candlestick(s),
            Indicator::Ichimoku => ichimoku(s),
            Indicator::Adx => adx(s),
        };
        raw.unwrap_or(0).signum()
    }
}

/// One value per indicator, recomputed each evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignalVector([i8; Indicator::COUNT]);

impl SignalVector {
    pub fn compute(s: &MarketSnapshot) -> Self {
        let mut v = [0i8; Indicator::COUNT];
        for ind in Indicator::ALL {
            v[ind.index()] = ind.evaluate(s);
        }
        Self(v)
    }

    #[cfg(test)]
    pub fn from_pairs(pairs: &[(Indicator, i8)]) -> Self {
        let mut v = [0i8; Indicator::COUNT];
        for (ind, sig) in pairs {
            v[ind.index()] = sig.signum();
        }
        Self(v)
    }

    pub fn get(&self, ind: Indicator) -> i8 {
        self.0[ind.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Indicator, i8)> + '_ {
        Indicator::ALL.into_iter().map(move |i| (i, self.get(i)))
    }

    pub fn active(&self) -> impl Iterator<Item = (Indicator, i8)> + '_ {
        self.iter().filter(|(_, v)| *v != 0)
    }

    pub fn is_flat(&self) -> bool {
        self.0.iter().all(|v| *v == 0)
    }
}

fn direction(long: bool, short: bool) -> i8 {
    match (long, short) {
        (true, false) => 1,
        (false, true) => -1,
        _ => 0,
    }
}

/// RSI bounds widen to (35, 65) when the close std exceeds 2% of the mean close.
pub fn rsi_bounds(s: &MarketSnapshot) -> (f64, f64) {
    let volatile = match (s.at(Column::CloseStd, 0), s.at(Column::CloseMean, 0)) {
        (Some(sd), Some(mean)) if mean > 0.0 => sd / mean > 0.02,
        _ => false,
    };
    if volatile { (35.0, 65.0) } else { (40.0, 60.0) }
}

fn rsi(s: &MarketSnapshot) -> Option<i8> {
    let rsi = s.at(Column::Rsi, 0)?;
    let spike = s.at(Column::VolumeSpike, 0)?;
    let (low, high) = rsi_bounds(s);
    let confirmed = spike > 1.2;
    Some(direction(confirmed && rsi < low, confirmed && rsi > high))
}

fn macd(s: &MarketSnapshot) -> Option<i8> {
    let hist = s.at(Column::MacdHist, 0)?;
    let trend = s.at(Column::Ema200, 0)?;
    let close = s.last_close()?;
    Some(direction(hist > 0.0 && close > trend, hist < 0.0 && close < trend))
}

/// Fires only on the bar where the fast/slow relation flips.
fn cross(s: &MarketSnapshot, fast: Column, slow: Column) -> Option<i8> {
    let now = relation(s.at(fast, 0)?, s.at(slow, 0)?);
    let before = relation(s.at(fast, 1)?, s.at(slow, 1)?);
    if now == before {
        return Some(0);
    }
    Some(now)
}

fn relation(a: f64, b: f64) -> i8 {
    direction(a > b, a < b)
}

fn support_resistance(s: &MarketSnapshot) -> Option<i8> {
    let c = s.candle(0)?;
    let resistance = s.at(Column::Resistance, 0)?;
    let support = s.at(Column::Support, 0)?;
    let heavy = c.volume > s.at(Column::VolumeSma, 0)?;
    Some(direction(heavy && c.close > resistance, heavy && c.close < support))
}

fn fibonacci(s: &MarketSnapshot) -> Option<i8> {
    let close = s.last_close()?;
    let rsi = s.at(Column::Rsi, 0)?;
    let level = s.at(Column::Fib236, 0)?;
    let swing_high = s.at(Column::SwingHigh, 0)?;
    Some(direction(close <= level && rsi < 40.0, close >= swing_high && rsi > 60.0))
}

fn volume_spike(s: &MarketSnapshot) -> Option<i8> {
    let spike = s.at(Column::VolumeSpike, 0)?;
    let vwap = s.at(Column::Vwap, 0)?;
    let close = s.last_close()?;
    if spike <= 2.0 {
        return Some(0);
    }
    Some(direction(close > vwap, close < vwap))
}

fn bollinger(s: &MarketSnapshot) -> Option<i8> {
    let close = s.last_close()?;
    Some(direction(close < s.at(Column::BbLower, 0)?, close > s.at(Column::BbUpper, 0)?))
}

fn stochastic(s: &MarketSnapshot) -> Option<i8> {
    let k = s.at(Column::StochK, 0)?;
    Some(direction(k < 20.0, k > 80.0))
}

fn momentum(s: &MarketSnapshot) -> Option<i8> {
    let roc = s.at(Column::Momentum, 0)?;
    Some(direction(roc > 0.0, roc < 0.0))
}

/// Running tally over the pattern checks; patterns may stack, the sign is what counts.
pub fn candle_patterns(prev: &Candle, cur: &Candle) -> i32 {
    let mut score = 0i32;
    let body = cur.body();

    // engulfing
    if prev.is_bearish() && cur.is_bullish() && cur.open <= prev.close && cur.close >= prev.open {
        score += 1;
    }
    if prev.is_bullish() && cur.is_bearish() && cur.open >= prev.close && cur.close <= prev.open {
        score -= 1;
    }
    // hammer / shooting star
    if body > 0.0 && cur.lower_shadow() >= 2.0 * body && cur.upper_shadow() <= body {
        score += 1;
    }
    if body > 0.0 && cur.upper_shadow() >= 2.0 * body && cur.lower_shadow() <= body {
        score -= 1;
    }
    // doji: indecision, contributes nothing
    // large engulfing: body at least 1.5x the prior body, opposite direction
    let opposite = (prev.is_bullish() && cur.is_bearish()) || (prev.is_bearish() && cur.is_bullish());
    if opposite && prev.body() > 0.0 && body >= 1.5 * prev.body() {
        score += if cur.is_bullish() { 1 } else { -1 };
    }
    score
}

fn candlestick(s: &MarketSnapshot) -> Option<i8> {
    let score = candle_patterns(s.candle(1)?, s.candle(0)?);
    Some(score.signum() as i8)
}

fn ichimoku(s: &MarketSnapshot) -> Option<i8> {
    let close = s.last_close()?;
    let conversion = s.at(Column::IchimokuConversion, 0)?;
    let base = s.at(Column::IchimokuBase, 0)?;
    Some(direction(
        close > conversion && conversion > base,
        close < conversion && conversion < base,
    ))
}

fn adx(s: &MarketSnapshot) -> Option<i8> {
    let strength = s.at(Column::Adx, 0)?;
    if strength <= 25.0 {
        return Some(0);
    }
    let plus = s.at(Column::PlusDi, 0)?;
    let minus = s.at(Column::MinusDi, 0)?;
    Some(direction(plus > minus, minus > plus))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Timeframe;
    use crate::indicators;
    use crate::snapshot::synthetic_candles;
    use ahash::AHashMap as HashMap;

    fn candle(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle { ts_ms: 0, open, high, low, close, volume }
    }

    /// Snapshot whose last candle closes at `close` with two-row columns.
    fn snap(close: f64, cols: &[(Column, [f64; 2])]) -> MarketSnapshot {
        let prev = candle(close, close + 1.0, close - 1.0, close, 100.0);
        let last = candle(close, close + 1.0, close - 1.0, close, 100.0);
        let columns: HashMap<Column, Vec<f64>> = cols.iter().map(|(c, v)| (*c, v.to_vec())).collect();
        MarketSnapshot::with_columns("BTCUSDT", Timeframe::M15, vec![prev, last], columns)
    }

    #[test]
    fn missing_columns_are_neutral_for_every_indicator() {
        let s = snap(100.0, &[]);
        for ind in Indicator::ALL {
            if ind == Indicator::Candlestick {
                continue; // reads candles only
            }
            assert_eq!(ind.evaluate(&s), 0, "{}", ind.name());
        }
    }

    #[test]
    fn empty_snapshot_is_neutral() {
        let s = MarketSnapshot::with_columns("BTCUSDT", Timeframe::M1, vec![], HashMap::new());
        assert!(SignalVector::compute(&s).is_flat());
    }

    #[test]
    fn every_signal_stays_in_range_on_real_columns() {
        for drift in [-0.4, 0.0, 0.4] {
            let s = MarketSnapshot::from_candles("BTCUSDT", Timeframe::H1, synthetic_candles(200, 100.0, drift)).unwrap();
            for (_, v) in SignalVector::compute(&s).iter() {
                assert!((-1..=1).contains(&v));
            }
        }
    }

    #[test]
    fn rsi_needs_volume_confirmation() {
        let calm = [(Column::CloseStd, [0.0, 1.0]), (Column::CloseMean, [0.0, 100.0])];
        let mut cols = calm.to_vec();
        cols.push((Column::Rsi, [50.0, 38.0]));
        cols.push((Column::VolumeSpike, [1.0, 1.5]));
        assert_eq!(Indicator::Rsi.evaluate(&snap(100.0, &cols)), 1);

        cols.pop();
        cols.push((Column::VolumeSpike, [1.0, 1.1]));
        assert_eq!(Indicator::Rsi.evaluate(&snap(100.0, &cols)), 0);
    }

    #[test]
    fn rsi_thresholds_widen_when_volatile() {
        let volatile = [
            (Column::CloseStd, [0.0, 3.0]),
            (Column::CloseMean, [0.0, 100.0]),
            (Column::Rsi, [50.0, 38.0]),
            (Column::VolumeSpike, [1.0, 1.5]),
        ];
        // 38 is below 40 but not below 35
        assert_eq!(Indicator::Rsi.evaluate(&snap(100.0, &volatile)), 0);
        assert_eq!(rsi_bounds(&snap(100.0, &volatile)), (35.0, 65.0));

        let hot = [
            (Column::CloseStd, [0.0, 3.0]),
            (Column::CloseMean, [0.0, 100.0]),
            (Column::Rsi, [50.0, 70.0]),
            (Column::VolumeSpike, [1.0, 1.5]),
        ];
        assert_eq!(Indicator::Rsi.evaluate(&snap(100.0, &hot)), -1);
    }

    #[test]
    fn macd_requires_trend_filter() {
        let up = [(Column::MacdHist, [0.0, 0.5]), (Column::Ema200, [0.0, 90.0])];
        assert_eq!(Indicator::Macd.evaluate(&snap(100.0, &up)), 1);
        let against = [(Column::MacdHist, [0.0, 0.5]), (Column::Ema200, [0.0, 110.0])];
        assert_eq!(Indicator::Macd.evaluate(&snap(100.0, &against)), 0);
        let down = [(Column::MacdHist, [0.0, -0.5]), (Column::Ema200, [0.0, 110.0])];
        assert_eq!(Indicator::Macd.evaluate(&snap(100.0, &down)), -1);
    }

    #[test]
    fn crosses_fire_only_on_the_crossing_bar() {
        let golden = [(Column::Ema12, [9.0, 11.0]), (Column::Ema26, [10.0, 10.0])];
        assert_eq!(Indicator::EmaCross.evaluate(&snap(100.0, &golden)), 1);
        let sustained = [(Column::Ema12, [11.0, 12.0]), (Column::Ema26, [10.0, 10.0])];
        assert_eq!(Indicator::EmaCross.evaluate(&snap(100.0, &sustained)), 0);
        let dead = [(Column::Sma20, [11.0, 9.0]), (Column::Sma50, [10.0, 10.0])];
        assert_eq!(Indicator::MaCross.evaluate(&snap(100.0, &dead)), -1);
    }

    #[test]
    fn breakout_needs_above_average_volume() {
        let base = [(Column::Resistance, [0.0, 99.0]), (Column::Support, [0.0, 80.0])];
        let mut loud = base.to_vec();
        loud.push((Column::VolumeSma, [0.0, 50.0]));
        assert_eq!(Indicator::SupportResistance.evaluate(&snap(100.0, &loud)), 1);
        let mut quiet = base.to_vec();
        quiet.push((Column::VolumeSma, [0.0, 500.0]));
        assert_eq!(Indicator::SupportResistance.evaluate(&snap(100.0, &quiet)), 0);
    }

    #[test]
    fn fibonacci_levels() {
        let (high, low) = (130.0, 100.0);
        let level = indicators::retracement(&[high], &[low], 0.236)[0];
        let swing = |rsi: f64| {
            [(Column::Rsi, [0.0, rsi]), (Column::Fib236, [0.0, level]), (Column::SwingHigh, [0.0, high]), (Column::SwingLow, [0.0, low])]
        };
        // shallow pullback to the 23.6% level
        assert_eq!(Indicator::Fibonacci.evaluate(&snap(122.0, &swing(35.0))), 1);
        assert_eq!(Indicator::Fibonacci.evaluate(&snap(125.0, &swing(35.0))), 0);
        assert_eq!(Indicator::Fibonacci.evaluate(&snap(122.0, &swing(45.0))), 0);
        assert_eq!(Indicator::Fibonacci.evaluate(&snap(130.0, &swing(65.0))), -1);
    }

    #[test]
    fn volume_spike_sides_with_vwap() {
        let above = [(Column::VolumeSpike, [0.0, 2.5]), (Column::Vwap, [0.0, 95.0])];
        assert_eq!(Indicator::VolumeSpike.evaluate(&snap(100.0, &above)), 1);
        let below = [(Column::VolumeSpike, [0.0, 2.5]), (Column::Vwap, [0.0, 105.0])];
        assert_eq!(Indicator::VolumeSpike.evaluate(&snap(100.0, &below)), -1);
        let mild = [(Column::VolumeSpike, [0.0, 2.0]), (Column::Vwap, [0.0, 95.0])];
        assert_eq!(Indicator::VolumeSpike.evaluate(&snap(100.0, &mild)), 0);
    }

    #[test]
    fn band_oscillator_and_momentum_rules() {
        let bands = [(Column::BbLower, [0.0, 101.0]), (Column::BbUpper, [0.0, 120.0])];
        assert_eq!(Indicator::Bollinger.evaluate(&snap(100.0, &bands)), 1);
        assert_eq!(Indicator::Stochastic.evaluate(&snap(100.0, &[(Column::StochK, [0.0, 85.0])])), -1);
        assert_eq!(Indicator::Stochastic.evaluate(&snap(100.0, &[(Column::StochK, [0.0, 50.0])])), 0);
        assert_eq!(Indicator::Momentum.evaluate(&snap(100.0, &[(Column::Momentum, [0.0, -1.2])])), -1);
        assert_eq!(Indicator::Momentum.evaluate(&snap(100.0, &[(Column::Momentum, [0.0, 0.0])])), 0);
    }

    #[test]
    fn ichimoku_and_adx() {
        let cloud = [(Column::IchimokuConversion, [0.0, 98.0]), (Column::IchimokuBase, [0.0, 95.0])];
        assert_eq!(Indicator::Ichimoku.evaluate(&snap(100.0, &cloud)), 1);
        let weak = [(Column::Adx, [0.0, 20.0]), (Column::PlusDi, [0.0, 30.0]), (Column::MinusDi, [0.0, 10.0])];
        assert_eq!(Indicator::Adx.evaluate(&snap(100.0, &weak)), 0);
        let strong = [(Column::Adx, [0.0, 30.0]), (Column::PlusDi, [0.0, 10.0]), (Column::MinusDi, [0.0, 30.0])];
        assert_eq!(Indicator::Adx.evaluate(&snap(100.0, &strong)), -1);
    }

    #[test]
    fn candle_patterns_stack_but_clamp() {
        // bearish bar then a big bullish engulfing bar: engulfing + large engulfing
        let prev = candle(10.0, 10.2, 9.4, 9.5, 1.0);
        let cur = candle(9.4, 10.8, 9.35, 10.7, 1.0);
        assert_eq!(candle_patterns(&prev, &cur), 2);
        let s = MarketSnapshot::with_columns("BTCUSDT", Timeframe::M5, vec![prev, cur], HashMap::new());
        assert_eq!(Indicator::Candlestick.evaluate(&s), 1);
    }

    #[test]
    fn hammer_shooting_star_and_doji() {
        let flat = candle(10.0, 10.1, 9.9, 10.0, 1.0);
        let hammer = candle(10.0, 10.12, 9.0, 10.1, 1.0);
        assert_eq!(candle_patterns(&flat, &hammer), 1);
        let star = candle(10.0, 11.0, 9.88, 9.9, 1.0);
        assert_eq!(candle_patterns(&flat, &star), -1);
        let doji = candle(10.0, 10.05, 9.95, 10.0, 1.0);
        assert_eq!(candle_patterns(&flat, &doji), 0);
    }

    #[test]
    fn vector_helpers() {
        let v = SignalVector::from_pairs(&[(Indicator::Rsi, 1), (Indicator::Adx, -3)]);
        assert_eq!(v.get(Indicator::Adx), -1);
        assert_eq!(v.active().count(), 2);
        assert_eq!(Indicator::parse("EMA_CROSS"), Some(Indicator::EmaCross));
        assert!(SignalVector::default().is_flat());
    }
}
