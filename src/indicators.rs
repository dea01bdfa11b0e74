// ===============================
// src/indicators.rs
// ===============================
//
// Column-wise indicator math over raw OHLCV slices.
// Every function returns a Vec the same length as its input; positions that
// are still warming up hold NaN so callers can treat them as "not available".
//

fn nan_vec(n: usize) -> Vec<f64> {
    vec![f64::NAN; n]
}

fn rolling<F>(v: &[f64], n: usize, f: F) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64,
{
    let mut out = nan_vec(v.len());
    if n == 0 {
        return out;
    }
    for i in (n - 1)..v.len() {
        out[i] = f(&v[i + 1 - n..=i]);
    }
    out
}

pub fn sma(v: &[f64], n: usize) -> Vec<f64> {
    rolling(v, n, |w| w.iter().sum::<f64>() / w.len() as f64)
}

/// Sample standard deviation (n - 1 denominator).
pub fn rolling_std(v: &[f64], n: usize) -> Vec<f64> {
    if n < 2 {
        return nan_vec(v.len());
    }
    rolling(v, n, |w| {
        let mean = w.iter().sum::<f64>() / w.len() as f64;
        let var = w.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (w.len() - 1) as f64;
        var.sqrt()
    })
}

pub fn rolling_max(v: &[f64], n: usize) -> Vec<f64> {
    rolling(v, n, |w| w.iter().copied().fold(f64::NEG_INFINITY, f64::max))
}

pub fn rolling_min(v: &[f64], n: usize) -> Vec<f64> {
    rolling(v, n, |w| w.iter().copied().fold(f64::INFINITY, f64::min))
}

/// Shift values forward by `k` rows (row i gets v[i - k]).
pub fn shift(v: &[f64], k: usize) -> Vec<f64> {
    let mut out = nan_vec(v.len());
    for i in k..v.len() {
        out[i] = v[i - k];
    }
    out
}

/// Exponential moving average, `k = 2 / (n + 1)`, seeded with the first value
/// so it is defined from row 0.
pub fn ema(v: &[f64], n: usize) -> Vec<f64> {
    let mut out = nan_vec(v.len());
    if n == 0 || v.is_empty() {
        return out;
    }
    let k = 2.0 / (n as f64 + 1.0);
    let mut prev = v[0];
    out[0] = prev;
    for i in 1..v.len() {
        prev = v[i] * k + prev * (1.0 - k);
        out[i] = prev;
    }
    out
}

/// Relative Strength Index with Wilder smoothing. First value at row `n`.
pub fn rsi(close: &[f64], n: usize) -> Vec<f64> {
    let mut out = nan_vec(close.len());
    if n == 0 || close.len() <= n {
        return out;
    }
    let nf = n as f64;
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=n {
        let d = close[i] - close[i - 1];
        if d > 0.0 { avg_gain += d } else { avg_loss -= d }
    }
    avg_gain /= nf;
    avg_loss /= nf;
    out[n] = rsi_from(avg_gain, avg_loss);
    for i in (n + 1)..close.len() {
        let d = close[i] - close[i - 1];
        let (g, l) = if d > 0.0 { (d, 0.0) } else { (0.0, -d) };
        avg_gain = (avg_gain * (nf - 1.0) + g) / nf;
        avg_loss = (avg_loss * (nf - 1.0) + l) / nf;
        out[i] = rsi_from(avg_gain, avg_loss);
    }
    out
}

fn rsi_from(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return if avg_gain == 0.0 { 50.0 } else { 100.0 };
    }
    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
}

pub struct Macd {
    pub line: Vec<f64>,
    pub signal: Vec<f64>,
    pub hist: Vec<f64>,
}

pub fn macd(close: &[f64], fast: usize, slow: usize, signal: usize) -> Macd {
    let f = ema(close, fast);
    let s = ema(close, slow);
    let line: Vec<f64> = f.iter().zip(&s).map(|(a, b)| a - b).collect();
    let sig = ema(&line, signal);
    let hist = line.iter().zip(&sig).map(|(a, b)| a - b).collect();
    Macd { line, signal: sig, hist }
}

pub struct Bands {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
}

pub fn bollinger(close: &[f64], n: usize, k: f64) -> Bands {
    let middle = sma(close, n);
    let sd = rolling_std(close, n);
    let upper = middle.iter().zip(&sd).map(|(m, s)| m + k * s).collect();
    let lower = middle.iter().zip(&sd).map(|(m, s)| m - k * s).collect();
    Bands { upper, middle, lower }
}

/// Stochastic oscillator: (%K over `k_n` rows, %D = SMA(`d_n`) of %K).
pub fn stochastic(high: &[f64], low: &[f64], close: &[f64], k_n: usize, d_n: usize) -> (Vec<f64>, Vec<f64>) {
    let hh = rolling_max(high, k_n);
    let ll = rolling_min(low, k_n);
    let k: Vec<f64> = (0..close.len())
        .map(|i| {
            let range = hh[i] - ll[i];
            if !range.is_finite() {
                f64::NAN
            } else if range == 0.0 {
                50.0
            } else {
                100.0 * (close[i] - ll[i]) / range
            }
        })
        .collect();
    let d = sma(&k, d_n);
    (k, d)
}

pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    (0..close.len())
        .map(|i| {
            if i == 0 {
                high[0] - low[0]
            } else {
                (high[i] - low[i])
                    .max((high[i] - close[i - 1]).abs())
                    .max((low[i] - close[i - 1]).abs())
            }
        })
        .collect()
}

/// Average True Range, Wilder smoothing seeded with the SMA of the first `n` ranges.
pub fn atr(high: &[f64], low: &[f64], close: &[f64], n: usize) -> Vec<f64> {
    let tr = true_range(high, low, close);
    let mut out = nan_vec(tr.len());
    if n == 0 || tr.len() < n {
        return out;
    }
    let nf = n as f64;
    let mut prev = tr[..n].iter().sum::<f64>() / nf;
    out[n - 1] = prev;
    for i in n..tr.len() {
        prev = (prev * (nf - 1.0) + tr[i]) / nf;
        out[i] = prev;
    }
    out
}

pub struct Adx {
    pub adx: Vec<f64>,
    pub plus_di: Vec<f64>,
    pub minus_di: Vec<f64>,
}

/// Wilder ADX with directional indicators. DI from row `n`, ADX from row `2n - 1`.
pub fn adx(high: &[f64], low: &[f64], close: &[f64], n: usize) -> Adx {
    let len = close.len();
    let mut out = Adx { adx: nan_vec(len), plus_di: nan_vec(len), minus_di: nan_vec(len) };
    if n == 0 || len <= n {
        return out;
    }
    let nf = n as f64;
    let tr = true_range(high, low, close);
    let mut pdm = vec![0.0; len];
    let mut mdm = vec![0.0; len];
    for i in 1..len {
        let up = high[i] - high[i - 1];
        let down = low[i - 1] - low[i];
        if up > down && up > 0.0 { pdm[i] = up; }
        if down > up && down > 0.0 { mdm[i] = down; }
    }

    let mut s_tr: f64 = tr[1..=n].iter().sum();
    let mut s_pdm: f64 = pdm[1..=n].iter().sum();
    let mut s_mdm: f64 = mdm[1..=n].iter().sum();
    let mut dx = nan_vec(len);
    for i in n..len {
        if i > n {
            s_tr = s_tr - s_tr / nf + tr[i];
            s_pdm = s_pdm - s_pdm / nf + pdm[i];
            s_mdm = s_mdm - s_mdm / nf + mdm[i];
        }
        let (p, m) = if s_tr > 0.0 { (100.0 * s_pdm / s_tr, 100.0 * s_mdm / s_tr) } else { (0.0, 0.0) };
        out.plus_di[i] = p;
        out.minus_di[i] = m;
        dx[i] = if p + m > 0.0 { 100.0 * (p - m).abs() / (p + m) } else { 0.0 };
    }

    let first = 2 * n - 1;
    if len > first {
        let mut prev = dx[n..=first].iter().sum::<f64>() / nf;
        out.adx[first] = prev;
        for i in (first + 1)..len {
            prev = (prev * (nf - 1.0) + dx[i]) / nf;
            out.adx[i] = prev;
        }
    }
    out
}

/// Midpoint of the rolling high/low range (Ichimoku conversion / base lines).
pub fn midpoint(high: &[f64], low: &[f64], n: usize) -> Vec<f64> {
    let hh = rolling_max(high, n);
    let ll = rolling_min(low, n);
    hh.iter().zip(&ll).map(|(h, l)| (h + l) / 2.0).collect()
}

/// Level `ratio` of the swing range below the swing high (0.236 -> 23.6% retracement).
pub fn retracement(swing_high: &[f64], swing_low: &[f64], ratio: f64) -> Vec<f64> {
    swing_high.iter().zip(swing_low).map(|(h, l)| h - ratio * (h - l)).collect()
}

/// Cumulative VWAP over the window, typical price weighted.
pub fn vwap(high: &[f64], low: &[f64], close: &[f64], volume: &[f64]) -> Vec<f64> {
    let mut pv = 0.0;
    let mut vol = 0.0;
    (0..close.len())
        .map(|i| {
            pv += (high[i] + low[i] + close[i]) / 3.0 * volume[i];
            vol += volume[i];
            if vol > 0.0 { pv / vol } else { f64::NAN }
        })
        .collect()
}

/// Rate of change in percent over `n` rows.
pub fn roc(close: &[f64], n: usize) -> Vec<f64> {
    let mut out = nan_vec(close.len());
    for i in n..close.len() {
        let base = close[i - n];
        if base != 0.0 {
            out[i] = (close[i] / base - 1.0) * 100.0;
        }
    }
    out
}
