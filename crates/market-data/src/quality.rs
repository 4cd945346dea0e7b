use chrono::{DateTime, Duration, Utc};
use market_core::Bar;
use serde::{Deserialize, Serialize};

/// Four-dimension quality assessment of one source's bars, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QualityScore {
    /// Ratio of rows with positive prices, non-negative volume, and a
    /// plausible timestamp.
    pub completeness: f64,
    /// Penalises inverted time-ordering and >50% single-step price jumps.
    pub consistency: f64,
    /// Age of the newest bar: full credit within 24h, 0.1 beyond 30 days.
    pub timeliness: f64,
    /// Unique-price diversity plus volume validity.
    pub accuracy: f64,
    pub overall: f64,
}

/// Thresholds for the "unrealistic stability" reject. Tuned empirically;
/// exposed so operators can adjust per venue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StabilityConfig {
    /// Reject when at least this fraction of closes share a single value.
    pub max_identical_ratio: f64,
    /// Reject when the coefficient of variation falls below this.
    pub min_coefficient_of_variation: f64,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            max_identical_ratio: 0.95,
            min_coefficient_of_variation: 0.0002,
        }
    }
}

fn plausible_timestamp(t: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    t.timestamp_millis() > 0 && t <= now + Duration::days(1)
}

/// Score one source's series on the four quality dimensions. An empty
/// series scores zero everywhere.
pub fn assess_quality(bars: &[Bar], now: DateTime<Utc>) -> QualityScore {
    if bars.is_empty() {
        return QualityScore::default();
    }

    let n = bars.len() as f64;

    // Completeness.
    let complete_rows = bars
        .iter()
        .filter(|b| {
            b.open > 0.0
                && b.high > 0.0
                && b.low > 0.0
                && b.close > 0.0
                && b.volume >= 0.0
                && plausible_timestamp(b.open_time, now)
        })
        .count() as f64;
    let completeness = complete_rows / n;

    // Consistency.
    let pairs = bars.len().saturating_sub(1).max(1) as f64;
    let mut inversions = 0usize;
    let mut jumps = 0usize;
    for w in bars.windows(2) {
        if w[1].open_time <= w[0].open_time {
            inversions += 1;
        }
        if w[0].close > 0.0 {
            let step = ((w[1].close - w[0].close) / w[0].close).abs();
            if step > 0.5 {
                jumps += 1;
            }
        }
    }
    let consistency = (1.0 - (inversions + jumps) as f64 / pairs).clamp(0.0, 1.0);

    // Timeliness.
    let newest = bars
        .iter()
        .map(|b| b.open_time)
        .max()
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let age = now - newest;
    let timeliness = if age <= Duration::hours(24) {
        1.0
    } else if age >= Duration::days(30) {
        0.1
    } else {
        // Linear decay from 1.0 at 24h to 0.1 at 30 days.
        let span = (Duration::days(30) - Duration::hours(24)).num_seconds() as f64;
        let over = (age - Duration::hours(24)).num_seconds() as f64;
        (1.0 - 0.9 * over / span).clamp(0.1, 1.0)
    };

    // Accuracy.
    let mut closes: Vec<u64> = bars.iter().map(|b| b.close.to_bits()).collect();
    closes.sort_unstable();
    closes.dedup();
    let diversity = closes.len() as f64 / n;
    let valid_volume = bars.iter().filter(|b| b.volume > 0.0).count() as f64 / n;
    let accuracy = 0.5 * diversity + 0.5 * valid_volume;

    let overall =
        0.3 * completeness + 0.3 * consistency + 0.2 * timeliness + 0.2 * accuracy;

    QualityScore {
        completeness,
        consistency,
        timeliness,
        accuracy,
        overall,
    }
}

/// A source whose closes barely move is synthetic or broken; real markets
/// do not print ≥95% identical closes or vanishing variation.
pub fn is_unrealistically_stable(bars: &[Bar], config: &StabilityConfig) -> bool {
    if bars.len() < 2 {
        return false;
    }

    let n = bars.len() as f64;

    let mut counts: std::collections::HashMap<u64, usize> = std::collections::HashMap::new();
    for bar in bars {
        *counts.entry(bar.close.to_bits()).or_default() += 1;
    }
    let max_identical = counts.values().copied().max().unwrap_or(0) as f64 / n;
    if max_identical >= config.max_identical_ratio {
        return true;
    }

    let mean = bars.iter().map(|b| b.close).sum::<f64>() / n;
    if mean <= 0.0 {
        return false;
    }
    let variance = bars.iter().map(|b| (b.close - mean).powi(2)).sum::<f64>() / n;
    let cv = variance.sqrt() / mean;

    cv < config.min_coefficient_of_variation
}

/// Larger series earn up to a full multiplier at 100 points.
pub fn size_bonus(n: usize) -> f64 {
    (n as f64 / 100.0).min(1.0)
}
