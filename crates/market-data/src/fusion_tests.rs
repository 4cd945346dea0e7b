use chrono::{Duration, Utc};
use market_core::{Bar, Interval, MarketError, MarketKind};

use crate::fusion::{fuse, SourcePull};
use crate::quality::{assess_quality, is_unrealistically_stable, size_bonus, StabilityConfig};
use crate::testkit::{ramp_bars, synthetic_bars};

fn fresh_start() -> chrono::DateTime<Utc> {
    Utc::now() - Duration::hours(60)
}

fn pull(name: &'static str, trust: u8, bars: Vec<Bar>) -> SourcePull {
    let quality = assess_quality(&bars, Utc::now());
    SourcePull {
        name,
        trust,
        bars,
        quality,
    }
}

#[test]
fn quality_rewards_clean_fresh_series() {
    let bars = synthetic_bars(
        "BTCUSDT",
        MarketKind::Spot,
        Interval::Hour1,
        fresh_start(),
        60,
        40_000.0,
        0.001,
        7,
    );
    let score = assess_quality(&bars, Utc::now());

    assert!(score.completeness > 0.99);
    assert!(score.consistency > 0.99);
    assert_eq!(score.timeliness, 1.0);
    assert!(score.overall > 0.9);
}

#[test]
fn quality_penalises_stale_and_jumpy_series() {
    let mut bars = synthetic_bars(
        "BTCUSDT",
        MarketKind::Spot,
        Interval::Hour1,
        Utc::now() - Duration::days(45),
        40,
        40_000.0,
        0.001,
        7,
    );
    // Inject a >50% jump.
    let n = bars.len();
    bars[n - 1].close = bars[n - 2].close * 2.0;

    let clean = synthetic_bars(
        "BTCUSDT",
        MarketKind::Spot,
        Interval::Hour1,
        fresh_start(),
        40,
        40_000.0,
        0.001,
        7,
    );

    let dirty_score = assess_quality(&bars, Utc::now());
    let clean_score = assess_quality(&clean, Utc::now());

    assert!(dirty_score.timeliness <= 0.1 + 1e-9);
    assert!(dirty_score.consistency < clean_score.consistency);
    assert!(dirty_score.overall < clean_score.overall);
}

#[test]
fn quality_monotone_on_each_dimension() {
    // Strictly better series must not score lower on any dimension.
    let good = synthetic_bars(
        "BTCUSDT",
        MarketKind::Spot,
        Interval::Hour1,
        fresh_start(),
        80,
        40_000.0,
        0.001,
        3,
    );
    let mut worse = good.clone();
    worse[10].close = -1.0; // breaks completeness and accuracy predicates
    worse.swap(20, 21); // breaks ordering

    let good_score = assess_quality(&good, Utc::now());
    let worse_score = assess_quality(&worse, Utc::now());

    assert!(good_score.completeness >= worse_score.completeness);
    assert!(good_score.consistency >= worse_score.consistency);
    assert!(good_score.timeliness >= worse_score.timeliness);
    assert!(good_score.accuracy >= worse_score.accuracy);
}

#[test]
fn flat_series_is_rejected_as_unrealistic() {
    let start = fresh_start();
    let flat: Vec<Bar> = (0..50)
        .map(|i| Bar {
            symbol: "BTCUSDT".into(),
            kind: MarketKind::Spot,
            interval: Interval::Hour1,
            open_time: start + Duration::hours(i),
            open: 100.0,
            high: 100.0,
            low: 100.0,
            close: 100.0,
            volume: 10.0,
            is_valid: true,
            quality_score: 100,
        })
        .collect();

    assert!(is_unrealistically_stable(&flat, &StabilityConfig::default()));

    let moving = synthetic_bars(
        "BTCUSDT",
        MarketKind::Spot,
        Interval::Hour1,
        start,
        50,
        100.0,
        0.002,
        11,
    );
    assert!(!is_unrealistically_stable(&moving, &StabilityConfig::default()));
}

#[test]
fn stability_thresholds_are_configurable() {
    let start = fresh_start();
    let mut bars = synthetic_bars(
        "BTCUSDT",
        MarketKind::Spot,
        Interval::Hour1,
        start,
        50,
        100.0,
        0.0,
        13,
    );
    // Half the closes identical: under the default 95% gate.
    for bar in bars.iter_mut().take(25) {
        bar.close = 100.0;
    }
    assert!(!is_unrealistically_stable(&bars, &StabilityConfig::default()));

    let strict = StabilityConfig {
        max_identical_ratio: 0.4,
        min_coefficient_of_variation: 0.0,
    };
    assert!(is_unrealistically_stable(&bars, &strict));
}

#[test]
fn size_bonus_caps_at_one() {
    assert!((size_bonus(50) - 0.5).abs() < 1e-9);
    assert_eq!(size_bonus(100), 1.0);
    assert_eq!(size_bonus(500), 1.0);
}

#[test]
fn fusion_prefers_highest_quality_times_size() {
    let start = fresh_start();
    let big = synthetic_bars(
        "BTCUSDT",
        MarketKind::Spot,
        Interval::Hour1,
        start,
        100,
        40_000.0,
        0.001,
        5,
    );
    let small = synthetic_bars(
        "BTCUSDT",
        MarketKind::Spot,
        Interval::Hour1,
        start,
        40,
        40_000.0,
        0.001,
        6,
    );

    let pulls = vec![pull("small", 8, small), pull("big", 6, big)];
    let expected = pulls
        .iter()
        .max_by(|a, b| {
            a.rank_score()
                .partial_cmp(&b.rank_score())
                .unwrap()
        })
        .map(|p| p.name)
        .unwrap();

    let outcome = fuse(pulls, &StabilityConfig::default()).unwrap();
    assert_eq!(outcome.report.base_source, expected);
}

#[test]
fn fusion_fails_without_thirty_valid_bars() {
    let bars = synthetic_bars(
        "BTCUSDT",
        MarketKind::Spot,
        Interval::Hour1,
        fresh_start(),
        20,
        40_000.0,
        0.001,
        5,
    );
    let result = fuse(vec![pull("short", 8, bars)], &StabilityConfig::default());
    assert!(matches!(result, Err(MarketError::InsufficientData(_))));
}

#[test]
fn fusion_fills_gaps_and_resolves_conflicts_by_trust() {
    let start = fresh_start();
    // Base: ranks first on quality × size.
    let base = synthetic_bars(
        "BTCUSDT",
        MarketKind::Spot,
        Interval::Hour1,
        start,
        100,
        40_000.0,
        0.001,
        5,
    );
    // DB source: fewer bars (ranks below base) but higher trust, with one
    // overlapping slot carrying a distinctive close and one extra slot
    // past the base's end.
    let mut db = synthetic_bars(
        "BTCUSDT",
        MarketKind::Spot,
        Interval::Hour1,
        start,
        31,
        41_000.0,
        0.001,
        9,
    );
    db[0].close = 55_555.0;
    let mut extra = db[30].clone();
    extra.open_time = start + Duration::hours(100);
    db.push(extra);

    let outcome = fuse(
        vec![pull("api", 8, base), pull("db", 10, db)],
        &StabilityConfig::default(),
    )
    .unwrap();

    assert_eq!(outcome.report.base_source, "api");
    assert!(outcome.report.conflicts_resolved >= 1);
    assert_eq!(outcome.report.points_filled, 1);

    // The overlapping slot took the higher-trust close.
    let first = outcome
        .bars
        .iter()
        .find(|b| b.open_time == start)
        .unwrap();
    assert_eq!(first.close, 55_555.0);

    // Ordering is ascending throughout.
    for w in outcome.bars.windows(2) {
        assert!(w[0].open_time < w[1].open_time);
    }
}

#[test]
fn fusion_cleans_broken_rows() {
    let start = fresh_start();
    let mut bars = synthetic_bars(
        "BTCUSDT",
        MarketKind::Spot,
        Interval::Hour1,
        start,
        60,
        40_000.0,
        0.001,
        5,
    );
    bars[5].volume = 0.0;
    bars[6].close = 0.0;
    bars[7].close = 5e7; // above the sanity ceiling
    bars[8].low = -5.0; // corrupt extreme
    bars[9].high = bars[9].low * 0.5; // inverted high/low

    let outcome = fuse(vec![pull("api", 8, bars)], &StabilityConfig::default()).unwrap();

    assert_eq!(outcome.bars.len(), 55);
    assert_eq!(outcome.report.points_dropped, 5);
    assert!((outcome.report.retention_ratio - 55.0 / 60.0).abs() < 1e-9);
}

#[tokio::test]
async fn data_manager_fuses_mock_sources() {
    use crate::testkit::MockSource;
    use crate::DataManager;
    use market_core::TimeRange;
    use tokio_util::sync::CancellationToken;

    let start = fresh_start();
    let bars = synthetic_bars(
        "BTCUSDT",
        MarketKind::Spot,
        Interval::Hour1,
        start,
        60,
        40_000.0,
        0.001,
        21,
    );
    let manager = DataManager::new(vec![MockSource::new(bars)]);

    let range = TimeRange::new(start - Duration::hours(1), Utc::now());
    let token = CancellationToken::new();
    let (fused, report) = manager
        .get_historical_data("BTCUSDT", MarketKind::Spot, Interval::Hour1, range, &token)
        .await
        .unwrap();

    assert!(fused.len() >= 30);
    assert_eq!(report.base_source, "mock");
}
