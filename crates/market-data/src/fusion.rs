use std::collections::BTreeMap;

use market_core::{Bar, MarketError};
use serde::{Deserialize, Serialize};

use crate::quality::{is_unrealistically_stable, size_bonus, QualityScore, StabilityConfig};

/// Fewer usable bars than this after fusion means the request fails with
/// `InsufficientData`; production never synthesises the difference.
pub const MIN_USABLE_BARS: usize = 30;

const PRICE_FLOOR: f64 = 1e-6;
const PRICE_CEIL: f64 = 1e7;

/// One source's contribution going into a fusion round.
pub struct SourcePull {
    pub name: &'static str,
    pub trust: u8,
    pub bars: Vec<Bar>,
    pub quality: QualityScore,
}

impl SourcePull {
    pub fn rank_score(&self) -> f64 {
        self.quality.overall * size_bonus(self.bars.len())
    }
}

/// What happened in one fusion round, for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionReport {
    pub sources_considered: usize,
    pub sources_rejected_stability: usize,
    pub base_source: String,
    pub base_quality: f64,
    pub points_from_base: usize,
    pub points_filled: usize,
    pub conflicts_resolved: usize,
    pub points_dropped: usize,
    /// Kept / (kept + dropped) after cleaning.
    pub retention_ratio: f64,
}

pub struct FusionOutcome {
    pub bars: Vec<Bar>,
    pub report: FusionReport,
}

/// Fuse multiple source pulls into one authoritative series.
///
/// The highest `quality × size-bonus` source becomes the base; lower
/// ranked sources only fill slots the base lacks, except that a
/// higher-trust source wins any shared timestamp. The merged series is
/// then cleaned and passed through the enhancement hook.
pub fn fuse(
    mut pulls: Vec<SourcePull>,
    stability: &StabilityConfig,
) -> Result<FusionOutcome, MarketError> {
    let sources_considered = pulls.len();

    let before = pulls.len();
    pulls.retain(|p| {
        let stable = is_unrealistically_stable(&p.bars, stability);
        if stable {
            tracing::warn!(
                "Rejecting source {} for unrealistic stability ({} bars)",
                p.name,
                p.bars.len()
            );
        }
        !stable
    });
    let sources_rejected_stability = before - pulls.len();

    let usable = |bars: &[Bar]| bars.iter().filter(|b| b.is_well_formed()).count();
    if !pulls.iter().any(|p| usable(&p.bars) >= MIN_USABLE_BARS) {
        return Err(MarketError::InsufficientData(format!(
            "no source yielded {MIN_USABLE_BARS} valid bars"
        )));
    }

    pulls.sort_by(|a, b| {
        b.rank_score()
            .partial_cmp(&a.rank_score())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let base = &pulls[0];
    let base_name = base.name.to_string();
    let base_quality = base.quality.overall;
    let points_from_base = base.bars.len();

    // Timestamp-keyed merge: base first, then fills/overrides.
    let mut merged: BTreeMap<i64, (Bar, u8)> = BTreeMap::new();
    for bar in &base.bars {
        merged.insert(bar.open_time.timestamp_millis(), (bar.clone(), base.trust));
    }

    let mut points_filled = 0usize;
    let mut conflicts_resolved = 0usize;
    for pull in &pulls[1..] {
        for bar in &pull.bars {
            let key = bar.open_time.timestamp_millis();
            match merged.get(&key) {
                None => {
                    merged.insert(key, (bar.clone(), pull.trust));
                    points_filled += 1;
                }
                Some((_, existing_trust)) if pull.trust > *existing_trust => {
                    merged.insert(key, (bar.clone(), pull.trust));
                    conflicts_resolved += 1;
                }
                Some(_) => {}
            }
        }
    }

    let total_before_clean = merged.len();
    let mut bars: Vec<Bar> = merged
        .into_values()
        .map(|(bar, _)| bar)
        .filter(is_clean)
        .collect();
    let points_dropped = total_before_clean - bars.len();

    enhance(&mut bars);

    let retention_ratio = if total_before_clean > 0 {
        bars.len() as f64 / total_before_clean as f64
    } else {
        0.0
    };

    if bars.len() < MIN_USABLE_BARS {
        return Err(MarketError::InsufficientData(format!(
            "{} bars remain after cleaning (minimum {MIN_USABLE_BARS})",
            bars.len()
        )));
    }

    let report = FusionReport {
        sources_considered,
        sources_rejected_stability,
        base_source: base_name,
        base_quality,
        points_from_base,
        points_filled,
        conflicts_resolved,
        points_dropped,
        retention_ratio,
    };

    tracing::debug!(
        "Fused {} bars (base {}, filled {}, conflicts {}, retention {:.2})",
        bars.len(),
        report.base_source,
        report.points_filled,
        report.conflicts_resolved,
        report.retention_ratio
    );

    Ok(FusionOutcome { bars, report })
}

/// Rows that would break downstream feature math are dropped outright:
/// non-positive or absurd prices on any OHLC field, an inverted
/// high/low pair, and zero-volume placeholders. Indicators fold over
/// high/low unguarded, so a corrupt extreme must never leave fusion.
fn is_clean(bar: &Bar) -> bool {
    let in_bounds = |price: f64| (PRICE_FLOOR..=PRICE_CEIL).contains(&price);

    bar.volume > 0.0
        && in_bounds(bar.open)
        && in_bounds(bar.high)
        && in_bounds(bar.low)
        && in_bounds(bar.close)
        && bar.high >= bar.low
}

/// Hook for downstream computed fields. Intentionally a no-op today.
fn enhance(_bars: &mut [Bar]) {}
