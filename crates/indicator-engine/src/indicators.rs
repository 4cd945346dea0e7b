use market_core::Bar;
use serde::{Deserialize, Serialize};

/// Return val if it is finite, otherwise return default.
#[inline]
pub fn finite_or(val: f64, default: f64) -> f64 {
    if val.is_finite() {
        val
    } else {
        default
    }
}

/// Simple moving average of the last `period` values. Falls back to the
/// mean of whatever is available so short histories degrade instead of
/// failing.
pub fn sma_last(data: &[f64], period: usize) -> f64 {
    if data.is_empty() || period == 0 {
        return 0.0;
    }
    let window = if data.len() < period {
        data
    } else {
        &data[data.len() - period..]
    };
    finite_or(window.iter().sum::<f64>() / window.len() as f64, 0.0)
}

/// Exponential moving average over the whole series, seeded with the first
/// element; multiplier = 2/(period+1). Output length equals input length.
pub fn ema_series(data: &[f64], period: usize) -> Vec<f64> {
    if data.is_empty() || period == 0 {
        return vec![];
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut result = Vec::with_capacity(data.len());
    result.push(finite_or(data[0], 0.0));

    for &value in &data[1..] {
        let prev = result[result.len() - 1];
        result.push(finite_or((value - prev) * multiplier + prev, prev));
    }

    result
}

pub fn ema_last(data: &[f64], period: usize) -> f64 {
    ema_series(data, period).last().copied().unwrap_or(0.0)
}

/// Relative Strength Index with Wilder smoothing.
///
/// Returns the neutral 50 when there are fewer than `period + 1` closes,
/// and 100 when the average loss is zero.
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() < period + 1 {
        return 50.0;
    }

    let mut gains = Vec::with_capacity(closes.len() - 1);
    let mut losses = Vec::with_capacity(closes.len() - 1);
    for w in closes.windows(2) {
        let change = w[1] - w[0];
        if change > 0.0 {
            gains.push(change);
            losses.push(0.0);
        } else {
            gains.push(0.0);
            losses.push(change.abs());
        }
    }

    let mut avg_gain = gains[..period].iter().sum::<f64>() / period as f64;
    let mut avg_loss = losses[..period].iter().sum::<f64>() / period as f64;

    for i in period..gains.len() {
        avg_gain = (avg_gain * (period - 1) as f64 + gains[i]) / period as f64;
        avg_loss = (avg_loss * (period - 1) as f64 + losses[i]) / period as f64;
    }

    if avg_loss == 0.0 {
        // No movement at all is neutral; gains without losses pin to 100.
        return if avg_gain == 0.0 { 50.0 } else { 100.0 };
    }

    let rs = avg_gain / avg_loss;
    finite_or(100.0 - 100.0 / (1.0 + rs), 50.0)
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MacdValues {
    pub line: f64,
    pub signal: f64,
    pub hist: f64,
}

/// MACD with the signal line computed as an EMA of the MACD line over the
/// suffix starting at index `slow - 1`.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> MacdValues {
    if fast == 0 || slow == 0 || signal == 0 || slow < fast || closes.len() < slow {
        return MacdValues::default();
    }

    let ema_fast = ema_series(closes, fast);
    let ema_slow = ema_series(closes, slow);

    let line_series: Vec<f64> = (slow - 1..closes.len())
        .map(|i| ema_fast[i] - ema_slow[i])
        .collect();

    let line = *line_series.last().unwrap_or(&0.0);
    let signal_val = ema_last(&line_series, signal);

    MacdValues {
        line: finite_or(line, 0.0),
        signal: finite_or(signal_val, 0.0),
        hist: finite_or(line - signal_val, 0.0),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BollingerValues {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub width: f64,
    /// Where the last close sits between the bands, clamped to [0, 1].
    pub position: f64,
}

impl Default for BollingerValues {
    fn default() -> Self {
        Self {
            upper: 0.0,
            middle: 0.0,
            lower: 0.0,
            width: 0.0,
            position: 0.5,
        }
    }
}

pub fn bollinger(closes: &[f64], period: usize, k: f64) -> BollingerValues {
    if period == 0 || closes.len() < period {
        return BollingerValues::default();
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    let variance = window.iter().map(|c| (c - middle).powi(2)).sum::<f64>() / period as f64;
    let std = variance.sqrt();

    let upper = middle + k * std;
    let lower = middle - k * std;
    let last = *closes.last().unwrap_or(&middle);

    let position = if upper > lower {
        ((last - lower) / (upper - lower)).clamp(0.0, 1.0)
    } else {
        0.5
    };
    let width = if middle != 0.0 {
        (upper - lower) / middle
    } else {
        0.0
    };

    BollingerValues {
        upper: finite_or(upper, middle),
        middle: finite_or(middle, 0.0),
        lower: finite_or(lower, middle),
        width: finite_or(width, 0.0),
        position: finite_or(position, 0.5),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KdjValues {
    pub k: f64,
    pub d: f64,
    pub j: f64,
}

impl Default for KdjValues {
    fn default() -> Self {
        Self {
            k: 50.0,
            d: 50.0,
            j: 50.0,
        }
    }
}

/// KDJ stochastic. When history allows, K and D are recursively smoothed
/// from the raw %K (RSV) seeded at 50; otherwise the simplified D = K,
/// J = 3K - 2D form is used.
pub fn kdj(bars: &[Bar], period: usize) -> KdjValues {
    if period == 0 || bars.len() < period {
        return KdjValues::default();
    }

    let mut rsv_series = Vec::with_capacity(bars.len() - period + 1);
    for i in period - 1..bars.len() {
        let window = &bars[i + 1 - period..=i];
        let highest = window.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
        let lowest = window.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
        let rsv = if highest > lowest {
            100.0 * (bars[i].close - lowest) / (highest - lowest)
        } else {
            50.0
        };
        rsv_series.push(finite_or(rsv, 50.0));
    }

    if rsv_series.len() < 3 {
        let k = *rsv_series.last().unwrap_or(&50.0);
        return KdjValues { k, d: k, j: k };
    }

    let mut k = 50.0;
    let mut d = 50.0;
    for rsv in &rsv_series {
        k = (2.0 / 3.0) * k + (1.0 / 3.0) * rsv;
        d = (2.0 / 3.0) * d + (1.0 / 3.0) * k;
    }
    let j = 3.0 * k - 2.0 * d;

    KdjValues {
        k: finite_or(k, 50.0),
        d: finite_or(d, 50.0),
        j: finite_or(j, 50.0),
    }
}

/// On-Balance Volume: cumulative signed volume over the whole series.
pub fn obv(bars: &[Bar]) -> f64 {
    if bars.is_empty() {
        return 0.0;
    }

    let mut value = bars[0].volume;
    for w in bars.windows(2) {
        if w[1].close > w[0].close {
            value += w[1].volume;
        } else if w[1].close < w[0].close {
            value -= w[1].volume;
        }
    }
    finite_or(value, 0.0)
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SupportResistance {
    pub support: f64,
    pub resistance: f64,
    pub support_strength: f64,
    pub resistance_strength: f64,
}

/// Support/resistance from the min low / max high of the last `period`
/// bars; strength 0..100 grows as the current close approaches the level.
pub fn support_resistance(bars: &[Bar], period: usize) -> SupportResistance {
    if period == 0 || bars.is_empty() {
        return SupportResistance::default();
    }

    let window = if bars.len() < period {
        bars
    } else {
        &bars[bars.len() - period..]
    };
    let support = window.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
    let resistance = window.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
    let close = bars[bars.len() - 1].close;

    let strength = |level: f64| -> f64 {
        if close <= 0.0 {
            return 0.0;
        }
        let distance = ((close - level) / close).abs();
        ((1.0 - distance) * 100.0).clamp(0.0, 100.0)
    };

    SupportResistance {
        support: finite_or(support, 0.0),
        resistance: finite_or(resistance, 0.0),
        support_strength: finite_or(strength(support), 0.0),
        resistance_strength: finite_or(strength(resistance), 0.0),
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AdxValues {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
}

/// ADX with directional indicators. Returns zeros when history is shorter
/// than `2 * period + 1` bars.
pub fn adx(bars: &[Bar], period: usize) -> AdxValues {
    if period == 0 || bars.len() < period * 2 + 1 {
        return AdxValues::default();
    }

    let mut plus_dm = Vec::with_capacity(bars.len() - 1);
    let mut minus_dm = Vec::with_capacity(bars.len() - 1);
    let mut true_ranges = Vec::with_capacity(bars.len() - 1);

    for w in bars.windows(2) {
        let up_move = w[1].high - w[0].high;
        let down_move = w[0].low - w[1].low;

        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });

        let tr = (w[1].high - w[1].low)
            .max((w[1].high - w[0].close).abs())
            .max((w[1].low - w[0].close).abs());
        true_ranges.push(tr);
    }

    // Wilder-smoothed running sums.
    let mut sm_plus = plus_dm[..period].iter().sum::<f64>();
    let mut sm_minus = minus_dm[..period].iter().sum::<f64>();
    let mut sm_tr = true_ranges[..period].iter().sum::<f64>();

    let di = |plus: f64, minus: f64, tr: f64| -> (f64, f64, f64) {
        if tr == 0.0 {
            return (0.0, 0.0, 0.0);
        }
        let plus_di = 100.0 * plus / tr;
        let minus_di = 100.0 * minus / tr;
        let sum = plus_di + minus_di;
        let dx = if sum == 0.0 {
            0.0
        } else {
            100.0 * (plus_di - minus_di).abs() / sum
        };
        (plus_di, minus_di, dx)
    };

    let mut dx_values = Vec::new();
    let (_, _, dx0) = di(sm_plus, sm_minus, sm_tr);
    dx_values.push(dx0);

    let mut last_plus_di = 0.0;
    let mut last_minus_di = 0.0;
    for i in period..true_ranges.len() {
        sm_plus = sm_plus - sm_plus / period as f64 + plus_dm[i];
        sm_minus = sm_minus - sm_minus / period as f64 + minus_dm[i];
        sm_tr = sm_tr - sm_tr / period as f64 + true_ranges[i];
        let (p, m, dx) = di(sm_plus, sm_minus, sm_tr);
        last_plus_di = p;
        last_minus_di = m;
        dx_values.push(dx);
    }

    // ADX is the SMA of the trailing DX window.
    let adx = sma_last(&dx_values, period);

    AdxValues {
        adx: finite_or(adx, 0.0),
        plus_di: finite_or(last_plus_di, 0.0),
        minus_di: finite_or(last_minus_di, 0.0),
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IchimokuValues {
    pub tenkan: f64,
    pub kijun: f64,
    pub senkou_a: f64,
    pub senkou_b: f64,
    pub chikou: f64,
}

/// Ichimoku cloud with the standard 9/26/52 lookbacks. Returns the zero
/// bundle when fewer than 52 bars are available.
pub fn ichimoku(bars: &[Bar]) -> IchimokuValues {
    if bars.len() < 52 {
        return IchimokuValues::default();
    }

    let midpoint = |lookback: usize| -> f64 {
        let window = &bars[bars.len() - lookback..];
        let high = window.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
        let low = window.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
        (high + low) / 2.0
    };

    let tenkan = midpoint(9);
    let kijun = midpoint(26);

    IchimokuValues {
        tenkan: finite_or(tenkan, 0.0),
        kijun: finite_or(kijun, 0.0),
        senkou_a: finite_or((tenkan + kijun) / 2.0, 0.0),
        senkou_b: finite_or(midpoint(52), 0.0),
        chikou: bars[bars.len() - 1].close,
    }
}

/// Commodity Channel Index over typical prices. Returns the neutral 0 when
/// history is insufficient or the mean deviation vanishes.
pub fn cci(bars: &[Bar], period: usize) -> f64 {
    if period == 0 || bars.len() < period {
        return 0.0;
    }

    let typical: Vec<f64> = bars[bars.len() - period..]
        .iter()
        .map(|b| (b.high + b.low + b.close) / 3.0)
        .collect();
    let mean = typical.iter().sum::<f64>() / period as f64;
    let mean_dev = typical.iter().map(|t| (t - mean).abs()).sum::<f64>() / period as f64;

    if mean_dev == 0.0 {
        return 0.0;
    }

    finite_or((typical[typical.len() - 1] - mean) / (0.015 * mean_dev), 0.0)
}

/// Williams %R in [-100, 0]. Returns the neutral -50 on short history.
pub fn williams_r(bars: &[Bar], period: usize) -> f64 {
    if period == 0 || bars.len() < period {
        return -50.0;
    }

    let window = &bars[bars.len() - period..];
    let highest = window.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
    let lowest = window.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);

    if highest <= lowest {
        return -50.0;
    }

    finite_or(
        -100.0 * (highest - bars[bars.len() - 1].close) / (highest - lowest),
        -50.0,
    )
}

/// Standard deviation of the last `period` single-bar returns.
pub fn volatility(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() < period + 1 {
        return 0.0;
    }

    let returns: Vec<f64> = closes[closes.len() - period - 1..]
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.is_empty() {
        return 0.0;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    finite_or(variance.sqrt(), 0.0)
}

/// Fractional price change over the last `period` bars.
pub fn momentum(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() < period + 1 {
        return 0.0;
    }
    let base = closes[closes.len() - 1 - period];
    if base == 0.0 {
        return 0.0;
    }
    finite_or((closes[closes.len() - 1] - base) / base, 0.0)
}

/// Price/OBV divergence over a 10-bar window: -1 when price rises against
/// falling OBV, +1 when price falls against rising OBV, else 0.
pub fn divergence(bars: &[Bar]) -> f64 {
    const LOOKBACK: usize = 10;
    if bars.len() < LOOKBACK + 1 {
        return 0.0;
    }

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let price_mom = momentum(&closes, LOOKBACK);

    let obv_now = obv(bars);
    let obv_then = obv(&bars[..bars.len() - LOOKBACK]);
    let obv_delta = obv_now - obv_then;

    if price_mom > 0.0 && obv_delta < 0.0 {
        -1.0
    } else if price_mom < 0.0 && obv_delta > 0.0 {
        1.0
    } else {
        0.0
    }
}
