use serde::{Deserialize, Serialize};

use crate::indicators::{BollingerValues, MacdValues};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Sideways,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Trend regime from RSI and MACD: RSI contributes ±2 beyond 70/30 and ±1
/// either side of 50; MACD above/below its signal contributes ±1. Scores
/// >= 2 map to Up, <= -2 to Down, the rest to Sideways.
pub fn score_trend(rsi: f64, macd: &MacdValues) -> Trend {
    let mut score = 0i32;

    if rsi > 70.0 {
        score += 2;
    } else if rsi > 50.0 {
        score += 1;
    } else if rsi < 30.0 {
        score -= 2;
    } else if rsi < 50.0 {
        score -= 1;
    }

    if macd.line > macd.signal {
        score += 1;
    } else if macd.line < macd.signal {
        score -= 1;
    }

    if score >= 2 {
        Trend::Up
    } else if score <= -2 {
        Trend::Down
    } else {
        Trend::Sideways
    }
}

/// Aggregate signal strength in [0, 100] from RSI extremity, MACD
/// crossover agreement, and Bollinger-band extremity.
pub fn score_signal_strength(rsi: f64, macd: &MacdValues, bollinger: &BollingerValues) -> f64 {
    // RSI extremity: 0 at 50, up to 40 at the rails.
    let rsi_component = ((rsi - 50.0).abs() / 50.0) * 40.0;

    // MACD crossover aligned with the RSI side of 50 reads as confirmation.
    let macd_bullish = macd.line > macd.signal;
    let rsi_bullish = rsi >= 50.0;
    let macd_component = if macd_bullish == rsi_bullish { 30.0 } else { 10.0 };

    // Bollinger extremity: 0 mid-band, up to 30 at either band.
    let boll_component = ((bollinger.position - 0.5).abs() / 0.5) * 30.0;

    (rsi_component + macd_component + boll_component).clamp(0.0, 100.0)
}

/// Risk score from RSI extremity, Bollinger extremity, and 20-period
/// return volatility, mapped to Low < 20, Medium < 40, High < 60,
/// Critical >= 60.
pub fn score_risk(rsi: f64, bollinger: &BollingerValues, volatility_20: f64) -> RiskLevel {
    let rsi_component = (rsi - 50.0).abs() * 0.5; // 0..25
    let boll_component = (bollinger.position - 0.5).abs() * 50.0; // 0..25
    let vol_component = (volatility_20 * 100.0).min(50.0); // 0..50

    let score = rsi_component + boll_component + vol_component;

    if score < 20.0 {
        RiskLevel::Low
    } else if score < 40.0 {
        RiskLevel::Medium
    } else if score < 60.0 {
        RiskLevel::High
    } else {
        RiskLevel::Critical
    }
}
