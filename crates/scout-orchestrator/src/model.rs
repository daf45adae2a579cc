//! Types for the worker model pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Instant;

/// Priority band of a worker model, used for graceful degradation.
///
/// Tiers are ordered: routing always prefers `Primary` and falls through
/// toward `Emergency` only when higher tiers have no admissible candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// Primary tier: preferred models under normal operation.
    Primary,
    /// Secondary tier: first fallback under exhaustion or failure.
    Secondary,
    /// Fallback tier: degraded-mode capacity.
    Fallback,
    /// Emergency tier: last resort before backpressure.
    Emergency,
}

impl ModelTier {
    /// All tiers in fixed preference order.
    pub const ALL: [Self; 4] = [Self::Primary, Self::Secondary, Self::Fallback, Self::Emergency];

    /// Converts a string to a ModelTier.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            "fallback" => Some(Self::Fallback),
            "emergency" => Some(Self::Emergency),
            _ => None,
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
            Self::Fallback => write!(f, "fallback"),
            Self::Emergency => write!(f, "emergency"),
        }
    }
}

/// Routing availability of a worker model.
///
/// A model that crosses the consecutive-error threshold leaves rotation and
/// cools down; once the cooldown elapses it re-enters as `Probing`, where a
/// single successful dispatch restores it and a failure sends it back to
/// cooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Model is in rotation.
    Available,
    /// Model is excluded from routing until the cooldown elapses.
    Cooling(Instant),
    /// Cooldown elapsed; the next dispatch acts as a recovery probe.
    Probing,
}

impl Availability {
    /// Whether the router may consider this model.
    #[must_use]
    pub fn is_routable(&self) -> bool {
        matches!(self, Self::Available | Self::Probing)
    }
}

/// A worker model endpoint capable of executing tasks.
///
/// Created at registry load time and mutated by every task outcome; models
/// are never removed during a run (tier and health change instead).
#[derive(Debug, Clone)]
pub struct WorkerModel {
    /// Unique model identifier.
    pub id: String,
    /// Priority tier.
    pub tier: ModelTier,
    /// Capability tags this model serves.
    pub specialties: HashSet<String>,
    /// Rolling health score in [0, 100], weighted toward recent outcomes.
    pub health_score: f64,
    /// Count of consecutive failed executions.
    pub consecutive_errors: u32,
    /// Current routing availability.
    pub availability: Availability,
    /// Exponential moving average of observed execution latency.
    pub avg_latency_ms: f64,
    /// When this model last finished a unit of work.
    pub last_active: Option<DateTime<Utc>>,
}

impl WorkerModel {
    /// Creates a model in its initial state.
    #[must_use]
    pub fn new(id: String, tier: ModelTier, specialties: HashSet<String>, health: f64) -> Self {
        Self {
            id,
            tier,
            specialties,
            health_score: health.clamp(0.0, 100.0),
            consecutive_errors: 0,
            availability: Availability::Available,
            avg_latency_ms: 0.0,
            last_active: None,
        }
    }

    /// Whether this model declares the given specialty.
    #[must_use]
    pub fn serves(&self, specialty: &str) -> bool {
        self.specialties.contains(specialty)
    }
}

/// Read-only view of a model merged with its quota usage, consumed by
/// dashboards and other collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSnapshot {
    /// Model identifier.
    pub id: String,
    /// Priority tier.
    pub tier: ModelTier,
    /// Current health score in [0, 100].
    pub health_score: f64,
    /// Units of quota consumed in the current window.
    pub quota_used: u32,
    /// Quota budget per window.
    pub quota_limit: u32,
    /// Whether the model is currently in rotation.
    pub is_healthy: bool,
    /// Count of consecutive failed executions.
    pub consecutive_errors: u32,
    /// When this model last finished a unit of work.
    pub last_active: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_preference_order() {
        assert_eq!(
            ModelTier::ALL,
            [
                ModelTier::Primary,
                ModelTier::Secondary,
                ModelTier::Fallback,
                ModelTier::Emergency
            ]
        );
        assert!(ModelTier::Primary < ModelTier::Emergency);
    }

    #[test]
    fn test_tier_string_roundtrip() {
        for tier in ModelTier::ALL {
            assert_eq!(ModelTier::from_str(&tier.to_string()), Some(tier));
        }
        assert_eq!(ModelTier::from_str("unknown"), None);
    }

    #[test]
    fn test_availability_routable() {
        assert!(Availability::Available.is_routable());
        assert!(Availability::Probing.is_routable());
        assert!(!Availability::Cooling(Instant::now()).is_routable());
    }

    #[test]
    fn test_health_clamped_on_construction() {
        let model = WorkerModel::new(
            "m1".to_string(),
            ModelTier::Primary,
            HashSet::new(),
            250.0,
        );
        assert!((model.health_score - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_serves_specialty() {
        let mut specialties = HashSet::new();
        specialties.insert("code-review".to_string());
        let model =
            WorkerModel::new("m1".to_string(), ModelTier::Primary, specialties, 100.0);
        assert!(model.serves("code-review"));
        assert!(!model.serves("translation"));
    }
}
