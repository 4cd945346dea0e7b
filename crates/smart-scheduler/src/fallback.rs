use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse degradation level controlling which code paths are permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackLevel {
    None,
    Partial,
    Degraded,
    Minimal,
}

/// Tracked subsystems. Database and recommendation are critical: either
/// one failing forces the minimal level on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Database,
    Recommendation,
    MarketData,
    IndicatorCache,
    Scheduler,
    Backtest,
}

impl Component {
    pub fn is_critical(&self) -> bool {
        matches!(self, Component::Database | Component::Recommendation)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LevelChange {
    pub at: DateTime<Utc>,
    pub from: FallbackLevel,
    pub to: FallbackLevel,
}

struct FallbackState {
    health: HashMap<Component, bool>,
    level: FallbackLevel,
    history: Vec<LevelChange>,
}

/// Derives the global degradation level from per-component health.
///
/// The level is a pure function of the current statuses: identical
/// health always yields an identical level.
pub struct FallbackStrategy {
    state: RwLock<FallbackState>,
}

impl FallbackStrategy {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(FallbackState {
                health: HashMap::new(),
                level: FallbackLevel::None,
                history: Vec::new(),
            }),
        }
    }

    pub fn record_failure(&self, component: Component) {
        self.set_health(component, false);
    }

    pub fn record_success(&self, component: Component) {
        self.set_health(component, true);
    }

    fn set_health(&self, component: Component, healthy: bool) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.health.insert(component, healthy);
        Self::apply(&mut state);
    }

    /// Re-derive the level from whatever the health map currently says.
    pub fn auto_adjust(&self) -> FallbackLevel {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        Self::apply(&mut state);
        state.level
    }

    fn apply(state: &mut FallbackState) {
        let new_level = Self::derive(&state.health);
        if new_level != state.level {
            let change = LevelChange {
                at: Utc::now(),
                from: state.level,
                to: new_level,
            };
            tracing::warn!(
                "Fallback level changed {:?} -> {:?}",
                change.from,
                change.to
            );
            state.history.push(change);
            state.level = new_level;
        }
    }

    fn derive(health: &HashMap<Component, bool>) -> FallbackLevel {
        let critical_failed = health
            .iter()
            .any(|(component, healthy)| !healthy && component.is_critical());
        if critical_failed {
            return FallbackLevel::Minimal;
        }

        let failed = health.values().filter(|healthy| !**healthy).count();
        match failed {
            0 => FallbackLevel::None,
            1 | 2 => FallbackLevel::Partial,
            _ => FallbackLevel::Degraded,
        }
    }

    pub fn level(&self) -> FallbackLevel {
        self.state.read().unwrap_or_else(|e| e.into_inner()).level
    }

    /// Cached results are preferred from the first degradation step.
    pub fn should_use_cache(&self) -> bool {
        self.level() >= FallbackLevel::Partial
    }

    /// Static defaults replace live computation once degraded.
    pub fn should_use_defaults(&self) -> bool {
        self.level() >= FallbackLevel::Degraded
    }

    pub fn history(&self) -> Vec<LevelChange> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .history
            .clone()
    }
}

impl Default for FallbackStrategy {
    fn default() -> Self {
        Self::new()
    }
}
