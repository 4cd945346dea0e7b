use market_core::Bar;
use serde::{Deserialize, Serialize};

use crate::composite::{score_risk, score_signal_strength, score_trend, RiskLevel, Trend};
use crate::indicators::{
    self, AdxValues, BollingerValues, IchimokuValues, KdjValues, MacdValues, SupportResistance,
};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MovingAverages {
    pub ma5: f64,
    pub ma10: f64,
    pub ma20: f64,
    pub ma50: f64,
    pub ma60: f64,
    pub ma200: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VolumeProfile {
    pub ma5: f64,
    pub ma20: f64,
    /// Last volume relative to its 20-bar average (1.0 when flat).
    pub ratio: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MomentumSet {
    pub m5: f64,
    pub m10: f64,
    pub m20: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VolatilitySet {
    pub v5: f64,
    pub v20: f64,
    /// Short-term over long-term volatility (1.0 when either vanishes).
    pub ratio: f64,
}

/// Every indicator computed from one finite window of bars.
///
/// Derivation is pure: identical inputs always produce identical bundles,
/// and the input slice is never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorBundle {
    pub rsi: f64,
    pub macd: MacdValues,
    pub bollinger: BollingerValues,
    pub kdj: KdjValues,
    pub ma: MovingAverages,
    pub obv: f64,
    pub volume: VolumeProfile,
    pub levels: SupportResistance,
    pub momentum: MomentumSet,
    pub divergence: f64,
    pub volatility: VolatilitySet,
    pub williams_r: f64,
    pub cci: f64,
    pub adx: AdxValues,
    pub ichimoku: IchimokuValues,
    pub trend: Trend,
    pub signal_strength: f64,
    pub risk_level: RiskLevel,
}

/// Compute the full bundle from a bar window (oldest first).
///
/// Every constituent follows the degrade-gracefully policy: short history
/// yields neutral values, never an error.
pub fn compute_bundle(bars: &[Bar]) -> IndicatorBundle {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

    let rsi = indicators::rsi(&closes, 14);
    let macd = indicators::macd(&closes, 12, 26, 9);
    let bollinger = indicators::bollinger(&closes, 20, 2.0);

    let volume_ma5 = indicators::sma_last(&volumes, 5);
    let volume_ma20 = indicators::sma_last(&volumes, 20);
    let volume_ratio = if volume_ma20 > 0.0 {
        volumes.last().copied().unwrap_or(0.0) / volume_ma20
    } else {
        1.0
    };

    let v5 = indicators::volatility(&closes, 5);
    let v20 = indicators::volatility(&closes, 20);
    let vol_ratio = if v5 > 0.0 && v20 > 0.0 { v5 / v20 } else { 1.0 };
    let volatility = VolatilitySet {
        v5,
        v20,
        ratio: vol_ratio,
    };

    let trend = score_trend(rsi, &macd);
    let signal_strength = score_signal_strength(rsi, &macd, &bollinger);
    let risk_level = score_risk(rsi, &bollinger, v20);

    IndicatorBundle {
        rsi,
        macd,
        bollinger,
        kdj: indicators::kdj(bars, 9),
        ma: MovingAverages {
            ma5: indicators::sma_last(&closes, 5),
            ma10: indicators::sma_last(&closes, 10),
            ma20: indicators::sma_last(&closes, 20),
            ma50: indicators::sma_last(&closes, 50),
            ma60: indicators::sma_last(&closes, 60),
            ma200: indicators::sma_last(&closes, 200),
        },
        obv: indicators::obv(bars),
        volume: VolumeProfile {
            ma5: volume_ma5,
            ma20: volume_ma20,
            ratio: volume_ratio,
        },
        levels: indicators::support_resistance(bars, 20),
        momentum: MomentumSet {
            m5: indicators::momentum(&closes, 5),
            m10: indicators::momentum(&closes, 10),
            m20: indicators::momentum(&closes, 20),
        },
        divergence: indicators::divergence(bars),
        volatility,
        williams_r: indicators::williams_r(bars, 14),
        cci: indicators::cci(bars, 20),
        adx: indicators::adx(bars, 14),
        ichimoku: indicators::ichimoku(bars),
        trend,
        signal_strength,
        risk_level,
    }
}
