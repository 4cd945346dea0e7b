use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Which market a bar was sampled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    Spot,
    Futures,
}

impl MarketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketKind::Spot => "spot",
            MarketKind::Futures => "futures",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "spot" => Some(MarketKind::Spot),
            "futures" => Some(MarketKind::Futures),
            _ => None,
        }
    }
}

/// Candle interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    Minute1,
    #[serde(rename = "5m")]
    Minute5,
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "30m")]
    Minute30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "1d")]
    Day1,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Minute1 => "1m",
            Interval::Minute5 => "5m",
            Interval::Minute15 => "15m",
            Interval::Minute30 => "30m",
            Interval::Hour1 => "1h",
            Interval::Hour4 => "4h",
            Interval::Day1 => "1d",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Interval::Minute1),
            "5m" => Some(Interval::Minute5),
            "15m" => Some(Interval::Minute15),
            "30m" => Some(Interval::Minute30),
            "1h" => Some(Interval::Hour1),
            "4h" => Some(Interval::Hour4),
            "1d" => Some(Interval::Day1),
            _ => None,
        }
    }

    /// Width of one bar at this interval.
    pub fn duration(&self) -> Duration {
        match self {
            Interval::Minute1 => Duration::minutes(1),
            Interval::Minute5 => Duration::minutes(5),
            Interval::Minute15 => Duration::minutes(15),
            Interval::Minute30 => Duration::minutes(30),
            Interval::Hour1 => Duration::hours(1),
            Interval::Hour4 => Duration::hours(4),
            Interval::Day1 => Duration::days(1),
        }
    }

    /// How stale the newest bar may be before a re-fetch is required.
    pub fn freshness_budget(&self) -> Duration {
        match self {
            Interval::Minute1 => Duration::minutes(5),
            Interval::Minute5 | Interval::Minute15 | Interval::Minute30 => Duration::minutes(30),
            Interval::Hour1 => Duration::hours(2),
            Interval::Hour4 => Duration::hours(8),
            Interval::Day1 => Duration::hours(24),
        }
    }
}

/// A half-open `[from, to)` window of open-times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.from && t < self.to
    }
}

/// One OHLCV candle.
///
/// Invariants: `low <= open,close <= high` for a valid bar;
/// `close_time = open_time + interval.duration()`. A gap in a series is
/// represented by a placeholder bar with `is_valid = false` whose OHLC
/// inherit the prior close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub kind: MarketKind,
    pub interval: Interval,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default = "default_true")]
    pub is_valid: bool,
    /// Source quality at fetch time, 0..=100.
    #[serde(default)]
    pub quality_score: u8,
}

fn default_true() -> bool {
    true
}

impl Bar {
    pub fn close_time(&self) -> DateTime<Utc> {
        self.open_time + self.interval.duration()
    }

    /// Structural validity: positive prices, ordered OHLC, non-negative volume.
    pub fn is_well_formed(&self) -> bool {
        self.open > 0.0
            && self.high > 0.0
            && self.low > 0.0
            && self.close > 0.0
            && self.low <= self.open
            && self.low <= self.close
            && self.high >= self.open
            && self.high >= self.close
            && self.volume >= 0.0
    }

    /// A placeholder for a missing slot: flat at the prior close, invalid.
    pub fn gap_placeholder(
        symbol: &str,
        kind: MarketKind,
        interval: Interval,
        open_time: DateTime<Utc>,
        prior_close: f64,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            kind,
            interval,
            open_time,
            open: prior_close,
            high: prior_close,
            low: prior_close,
            close: prior_close,
            volume: 0.0,
            is_valid: false,
            quality_score: 0,
        }
    }
}

/// Sort bars ascending by open-time and drop duplicate slots (last wins).
pub fn sort_dedup_bars(mut bars: Vec<Bar>) -> Vec<Bar> {
    bars.sort_by_key(|b| b.open_time);
    bars.dedup_by(|next, prev| {
        if next.open_time == prev.open_time {
            *prev = next.clone();
            true
        } else {
            false
        }
    });
    bars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_roundtrip() {
        for iv in [
            Interval::Minute1,
            Interval::Minute5,
            Interval::Minute15,
            Interval::Minute30,
            Interval::Hour1,
            Interval::Hour4,
            Interval::Day1,
        ] {
            assert_eq!(Interval::parse(iv.as_str()), Some(iv));
        }
        assert_eq!(Interval::parse("7m"), None);
    }

    #[test]
    fn freshness_budget_matches_interval_class() {
        assert_eq!(Interval::Minute1.freshness_budget(), Duration::minutes(5));
        assert_eq!(Interval::Minute15.freshness_budget(), Duration::minutes(30));
        assert_eq!(Interval::Hour4.freshness_budget(), Duration::hours(8));
    }

    #[test]
    fn gap_placeholder_is_flat_and_invalid() {
        let t = Utc::now();
        let bar = Bar::gap_placeholder("BTCUSDT", MarketKind::Spot, Interval::Hour1, t, 42.5);
        assert!(!bar.is_valid);
        assert_eq!(bar.open, 42.5);
        assert_eq!(bar.close, 42.5);
        assert_eq!(bar.volume, 0.0);
        assert_eq!(bar.close_time(), t + Duration::hours(1));
    }

    #[test]
    fn sort_dedup_keeps_last_write() {
        let t = Utc::now();
        let mk = |close: f64, offset: i64| Bar {
            symbol: "BTCUSDT".into(),
            kind: MarketKind::Spot,
            interval: Interval::Hour1,
            open_time: t + Duration::hours(offset),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            is_valid: true,
            quality_score: 100,
        };
        let bars = vec![mk(2.0, 1), mk(1.0, 0), mk(3.0, 1)];
        let sorted = sort_dedup_bars(bars);
        assert_eq!(sorted.len(), 2);
        assert_eq!(sorted[0].close, 1.0);
        assert_eq!(sorted[1].close, 3.0);
    }
}
