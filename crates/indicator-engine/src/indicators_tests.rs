use chrono::{Duration, Utc};
use market_core::{Bar, Interval, MarketKind};

use crate::bundle::compute_bundle;
use crate::composite::{score_risk, score_trend, RiskLevel, Trend};
use crate::indicators::*;

fn bar_at(i: usize, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Bar {
    Bar {
        symbol: "BTCUSDT".into(),
        kind: MarketKind::Spot,
        interval: Interval::Hour1,
        open_time: Utc::now() - Duration::hours(500 - i as i64),
        open,
        high,
        low,
        close,
        volume,
        is_valid: true,
        quality_score: 100,
    }
}

fn trending_bars(n: usize) -> Vec<Bar> {
    (0..n)
        .map(|i| {
            let base = 100.0 + i as f64;
            bar_at(i, base, base + 2.0, base - 1.0, base + 1.0, 1_000_000.0)
        })
        .collect()
}

#[test]
fn sma_last_uses_trailing_window() {
    let data = vec![1.0, 2.0, 3.0, 4.0, 5.0];
    assert!((sma_last(&data, 3) - 4.0).abs() < 1e-9);
}

#[test]
fn sma_last_degrades_to_partial_mean() {
    let data = vec![2.0, 4.0];
    assert!((sma_last(&data, 5) - 3.0).abs() < 1e-9);
}

#[test]
fn ema_is_seeded_with_first_element() {
    let data = vec![10.0, 12.0, 11.0];
    let series = ema_series(&data, 3);
    assert_eq!(series.len(), 3);
    assert!((series[0] - 10.0).abs() < 1e-9);
    // multiplier = 2/(3+1) = 0.5
    assert!((series[1] - 11.0).abs() < 1e-9);
    assert!((series[2] - 11.0).abs() < 1e-9);
}

#[test]
fn rsi_neutral_on_short_history() {
    let data = vec![1.0, 2.0, 3.0];
    assert_eq!(rsi(&data, 14), 50.0);
}

#[test]
fn rsi_of_identical_closes_is_neutral() {
    // 15 identical closes: zero gain and zero loss must read neutral.
    let data = vec![100.0; 15];
    assert_eq!(rsi(&data, 14), 50.0);
}

#[test]
fn rsi_pins_to_hundred_without_losses() {
    let data: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
    assert_eq!(rsi(&data, 14), 100.0);
}

#[test]
fn rsi_stays_in_range() {
    let data = vec![
        44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
        45.61, 46.28, 46.28, 46.00, 46.03, 46.41, 46.22, 45.64,
    ];
    let value = rsi(&data, 14);
    assert!((0.0..=100.0).contains(&value));
}

#[test]
fn macd_neutral_on_short_input() {
    let data = vec![1.0, 2.0, 3.0];
    let result = macd(&data, 12, 26, 9);
    assert_eq!(result.line, 0.0);
    assert_eq!(result.signal, 0.0);
    assert_eq!(result.hist, 0.0);
}

#[test]
fn macd_line_positive_in_uptrend() {
    let data: Vec<f64> = (0..60).map(|i| 100.0 * 1.01f64.powi(i)).collect();
    let result = macd(&data, 12, 26, 9);
    assert!(result.line > 0.0);
}

#[test]
fn bollinger_flat_series_centres_position() {
    let data = vec![50.0; 25];
    let bands = bollinger(&data, 20, 2.0);
    assert_eq!(bands.position, 0.5);
    assert_eq!(bands.width, 0.0);
    assert!((bands.middle - 50.0).abs() < 1e-9);
}

#[test]
fn bollinger_position_is_clamped() {
    let mut data = vec![100.0; 20];
    data.push(500.0); // violent breakout above the band
    let bands = bollinger(&data, 20, 2.0);
    assert!(bands.position <= 1.0);
    assert!(bands.position >= 0.0);
}

#[test]
fn kdj_short_history_collapses_to_k() {
    let bars = trending_bars(9);
    let result = kdj(&bars, 9);
    assert_eq!(result.k, result.d);
    assert_eq!(result.j, result.k);
}

#[test]
fn kdj_values_bounded_on_trend() {
    let bars = trending_bars(60);
    let result = kdj(&bars, 9);
    assert!(result.k > 50.0, "uptrend should lift K, got {}", result.k);
    assert!(result.d > 50.0);
}

#[test]
fn obv_accumulates_signed_volume() {
    let bars = vec![
        bar_at(0, 10.0, 11.0, 9.0, 10.0, 100.0),
        bar_at(1, 10.0, 12.0, 9.5, 11.0, 200.0), // up: +200
        bar_at(2, 11.0, 11.5, 9.0, 10.0, 50.0),  // down: -50
        bar_at(3, 10.0, 10.5, 9.5, 10.0, 75.0),  // flat: 0
    ];
    assert!((obv(&bars) - 250.0).abs() < 1e-9);
}

#[test]
fn support_strength_peaks_at_the_level() {
    let mut bars = trending_bars(30);
    // Park the close exactly on the window low.
    let low = bars[bars.len() - 20..]
        .iter()
        .map(|b| b.low)
        .fold(f64::INFINITY, f64::min);
    let last = bars.last_mut().unwrap();
    last.close = low;
    last.low = low;

    let levels = support_resistance(&bars, 20);
    assert!((levels.support_strength - 100.0).abs() < 1e-6);
}

#[test]
fn adx_zeros_on_short_history() {
    let bars = trending_bars(10);
    let result = adx(&bars, 14);
    assert_eq!(result.adx, 0.0);
    assert_eq!(result.plus_di, 0.0);
    assert_eq!(result.minus_di, 0.0);
}

#[test]
fn adx_detects_directional_trend() {
    let bars = trending_bars(80);
    let result = adx(&bars, 14);
    assert!(result.plus_di > result.minus_di);
    assert!(result.adx > 0.0);
}

#[test]
fn ichimoku_zero_bundle_below_52_bars() {
    let bars = trending_bars(51);
    let cloud = ichimoku(&bars);
    assert_eq!(cloud.tenkan, 0.0);
    assert_eq!(cloud.senkou_b, 0.0);
}

#[test]
fn ichimoku_tenkan_leads_kijun_in_uptrend() {
    let bars = trending_bars(80);
    let cloud = ichimoku(&bars);
    assert!(cloud.tenkan > cloud.kijun);
}

#[test]
fn williams_r_neutral_and_bounded() {
    assert_eq!(williams_r(&trending_bars(5), 14), -50.0);
    let value = williams_r(&trending_bars(40), 14);
    assert!((-100.0..=0.0).contains(&value));
}

#[test]
fn cci_zero_on_flat_series() {
    let bars: Vec<Bar> = (0..30)
        .map(|i| bar_at(i, 100.0, 100.0, 100.0, 100.0, 10.0))
        .collect();
    assert_eq!(cci(&bars, 20), 0.0);
}

#[test]
fn volatility_zero_on_flat_series() {
    let data = vec![42.0; 30];
    assert_eq!(volatility(&data, 20), 0.0);
}

#[test]
fn momentum_measures_fractional_change() {
    let data: Vec<f64> = vec![100.0, 101.0, 102.0, 103.0, 104.0, 110.0];
    assert!((momentum(&data, 5) - 0.10).abs() < 1e-9);
}

#[test]
fn trend_mapping_follows_scores() {
    let bullish_macd = MacdValues {
        line: 1.0,
        signal: 0.5,
        hist: 0.5,
    };
    assert_eq!(score_trend(75.0, &bullish_macd), Trend::Up);
    assert_eq!(
        score_trend(25.0, &MacdValues {
            line: -1.0,
            signal: -0.5,
            hist: -0.5,
        }),
        Trend::Down
    );
    assert_eq!(score_trend(50.0, &MacdValues::default()), Trend::Sideways);
}

#[test]
fn risk_scales_with_volatility() {
    let calm = score_risk(50.0, &BollingerValues::default(), 0.0);
    let wild = score_risk(80.0, &BollingerValues {
        position: 0.98,
        ..Default::default()
    }, 0.5);
    assert_eq!(calm, RiskLevel::Low);
    assert_eq!(wild, RiskLevel::Critical);
}

#[test]
fn bundle_is_deterministic_and_pure() {
    let bars = trending_bars(120);
    let snapshot = serde_json::to_string(&bars).unwrap();

    let first = serde_json::to_value(compute_bundle(&bars)).unwrap();
    let second = serde_json::to_value(compute_bundle(&bars)).unwrap();

    assert_eq!(first, second);
    // Input must be untouched.
    assert_eq!(serde_json::to_string(&bars).unwrap(), snapshot);
}

#[test]
fn bundle_neutral_on_tiny_window() {
    let bars = trending_bars(3);
    let bundle = compute_bundle(&bars);
    assert_eq!(bundle.rsi, 50.0);
    assert_eq!(bundle.macd.line, 0.0);
    assert_eq!(bundle.bollinger.position, 0.5);
}
