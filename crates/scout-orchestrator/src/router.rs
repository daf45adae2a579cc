//! Model router for tiered selection with graceful degradation.
//!
//! Selection walks the tiers in fixed preference order and applies admission
//! control inside each tier: specialty match, exclusion list, health floor,
//! availability, and a quota dry-run. A tier with no admissible candidate
//! falls through to the next; only after all four tiers are exhausted does
//! routing report that nothing is available, which callers treat as
//! backpressure rather than failure.

use crate::model::{ModelTier, WorkerModel};
use crate::quota::QuotaTracker;
use crate::registry::ModelRegistry;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur during model selection.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// Every tier was exhausted for this specialty; retry with backoff.
    #[error("No model available for specialty '{specialty}'")]
    NoneAvailable {
        /// The specialty that could not be routed.
        specialty: String,
    },

    /// No model in any tier declares this specialty; retrying cannot help.
    #[error("No model in any tier serves specialty '{specialty}'")]
    UnsupportedSpecialty {
        /// The unknown specialty.
        specialty: String,
    },

    /// Every model serving this specialty has already been tried and
    /// excluded; no window reset or recovery can produce a new candidate.
    #[error("All candidate models for specialty '{specialty}' have been tried")]
    AllCandidatesTried {
        /// The specialty whose candidates are exhausted.
        specialty: String,
    },
}

/// A routing decision: the chosen model and why it won.
#[derive(Debug, Clone)]
pub struct RouteSelection {
    /// The chosen model id.
    pub model_id: String,
    /// The tier the model was found in.
    pub tier: ModelTier,
    /// The model's health score at selection time.
    pub health_score: f64,
}

/// Router over the worker model pool.
pub struct ModelRouter {
    /// Model catalog (health, tiers, specialties).
    registry: Arc<ModelRegistry>,
    /// Quota tracker for admission dry-runs.
    quota: Arc<QuotaTracker>,
    /// Minimum health score a model must hold to be routable.
    health_floor: f64,
}

impl ModelRouter {
    /// Creates a new router.
    ///
    /// # Arguments
    /// * `registry` - Model catalog
    /// * `quota` - Quota tracker
    /// * `health_floor` - Minimum routable health score
    #[must_use]
    pub fn new(registry: Arc<ModelRegistry>, quota: Arc<QuotaTracker>, health_floor: f64) -> Self {
        Self { registry, quota, health_floor }
    }

    /// Selects the best admissible model for a unit of work.
    ///
    /// Within a tier, survivors are ranked by highest health score, ties
    /// broken by lowest quota consumption ratio, then by id for determinism.
    ///
    /// # Arguments
    /// * `specialty` - Required capability tag
    /// * `excluded` - Models already tried for this task
    /// * `cost` - Units of quota the work will consume
    ///
    /// # Errors
    /// Returns `UnsupportedSpecialty` if the catalog cannot ever serve this
    /// specialty, or `NoneAvailable` after all tiers are exhausted.
    pub fn select(
        &self,
        specialty: &str,
        excluded: &HashSet<String>,
        cost: u32,
    ) -> Result<RouteSelection, RoutingError> {
        if !self.registry.supports_specialty(specialty) {
            return Err(RoutingError::UnsupportedSpecialty { specialty: specialty.to_string() });
        }

        let mut serving = 0usize;
        let mut already_tried = 0usize;

        for tier in ModelTier::ALL {
            let mut survivors: Vec<(WorkerModel, f64)> = Vec::new();

            for model in self.registry.list_by_tier(tier) {
                if !model.serves(specialty) {
                    continue;
                }
                serving += 1;
                if excluded.contains(&model.id) {
                    already_tried += 1;
                    continue;
                }
                if !model.availability.is_routable() {
                    debug!(model_id = %model.id, "Skipping model outside rotation");
                    continue;
                }
                if model.health_score < self.health_floor {
                    debug!(
                        model_id = %model.id,
                        health_score = model.health_score,
                        floor = self.health_floor,
                        "Skipping model below health floor"
                    );
                    continue;
                }

                let ratio = match self.quota.headroom(&model.id, cost) {
                    Ok(true) => self
                        .quota
                        .usage(&model.id)
                        .map(|u| u.ratio())
                        .unwrap_or(1.0),
                    Ok(false) => {
                        debug!(model_id = %model.id, "Skipping model without quota headroom");
                        continue;
                    }
                    Err(e) => {
                        warn!(model_id = %model.id, error = %e, "Quota check failed, skipping model");
                        continue;
                    }
                };

                survivors.push((model, ratio));
            }

            survivors.sort_by(|(a, a_ratio), (b, b_ratio)| {
                b.health_score
                    .partial_cmp(&a.health_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        a_ratio.partial_cmp(b_ratio).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| a.id.cmp(&b.id))
            });

            if let Some((model, _)) = survivors.into_iter().next() {
                debug!(
                    model_id = %model.id,
                    tier = %tier,
                    health_score = model.health_score,
                    specialty = %specialty,
                    "Routing decision made"
                );
                return Ok(RouteSelection {
                    model_id: model.id,
                    tier,
                    health_score: model.health_score,
                });
            }
        }

        if serving > 0 && already_tried == serving {
            debug!(specialty = %specialty, "Every candidate model already tried");
            return Err(RoutingError::AllCandidatesTried { specialty: specialty.to_string() });
        }

        debug!(specialty = %specialty, "All tiers exhausted");
        Err(RoutingError::NoneAvailable { specialty: specialty.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelDefinition, SchedulerConfig};
    use std::time::Duration;

    fn build(
        definitions: Vec<ModelDefinition>,
    ) -> (Arc<ModelRegistry>, Arc<QuotaTracker>, ModelRouter) {
        let config = SchedulerConfig::default();
        let registry = Arc::new(ModelRegistry::new(&definitions, &config));
        let quota = Arc::new(QuotaTracker::new());
        for definition in &definitions {
            quota.register_model(
                &definition.id,
                definition.quota_limit,
                Duration::from_secs(60),
            );
        }
        let router =
            ModelRouter::new(Arc::clone(&registry), Arc::clone(&quota), config.health_floor);
        (registry, quota, router)
    }

    #[test]
    fn test_prefers_primary_tier() {
        let (_registry, _quota, router) = build(vec![
            ModelDefinition::new("atlas-1", ModelTier::Primary, "summarize"),
            ModelDefinition::new("pathfinder-1", ModelTier::Secondary, "summarize"),
        ]);

        let selection = router.select("summarize", &HashSet::new(), 1).unwrap();
        assert_eq!(selection.model_id, "atlas-1");
        assert_eq!(selection.tier, ModelTier::Primary);
    }

    #[test]
    fn test_falls_back_when_primary_unhealthy() {
        let (registry, _quota, router) = build(vec![
            ModelDefinition::new("atlas-1", ModelTier::Primary, "summarize"),
            ModelDefinition::new("pathfinder-1", ModelTier::Secondary, "summarize"),
        ]);

        for _ in 0..3 {
            registry.record_outcome("atlas-1", false, Duration::from_millis(10)).unwrap();
        }

        let selection = router.select("summarize", &HashSet::new(), 1).unwrap();
        assert_eq!(selection.model_id, "pathfinder-1");
        assert_eq!(selection.tier, ModelTier::Secondary);
    }

    #[test]
    fn test_falls_back_when_primary_exhausted() {
        let (_registry, quota, router) = build(vec![
            ModelDefinition::new("atlas-1", ModelTier::Primary, "summarize").with_quota_limit(1),
            ModelDefinition::new("pathfinder-1", ModelTier::Secondary, "summarize"),
        ]);

        quota.try_reserve("atlas-1", 1).unwrap();

        let selection = router.select("summarize", &HashSet::new(), 1).unwrap();
        assert_eq!(selection.model_id, "pathfinder-1");
    }

    #[test]
    fn test_specialty_only_in_secondary_never_none_available() {
        let (registry, quota, router) = build(vec![
            ModelDefinition::new("atlas-1", ModelTier::Primary, "code-review").with_quota_limit(1),
            ModelDefinition::new("pathfinder-1", ModelTier::Secondary, "translation"),
        ]);

        // Primary is both exhausted and unhealthy, and does not even serve
        // the specialty; the secondary model must still be found.
        quota.try_reserve("atlas-1", 1).unwrap();
        for _ in 0..3 {
            registry.record_outcome("atlas-1", false, Duration::from_millis(10)).unwrap();
        }

        let selection = router.select("translation", &HashSet::new(), 1).unwrap();
        assert_eq!(selection.model_id, "pathfinder-1");
    }

    #[test]
    fn test_excluded_models_skipped() {
        let (_registry, _quota, router) = build(vec![
            ModelDefinition::new("atlas-1", ModelTier::Primary, "summarize"),
            ModelDefinition::new("atlas-2", ModelTier::Primary, "summarize"),
        ]);

        let mut excluded = HashSet::new();
        excluded.insert("atlas-1".to_string());

        let selection = router.select("summarize", &excluded, 1).unwrap();
        assert_eq!(selection.model_id, "atlas-2");
    }

    #[test]
    fn test_ties_broken_by_quota_ratio_then_id() {
        let (_registry, quota, router) = build(vec![
            ModelDefinition::new("atlas-1", ModelTier::Primary, "summarize").with_quota_limit(10),
            ModelDefinition::new("atlas-2", ModelTier::Primary, "summarize").with_quota_limit(10),
        ]);

        // Equal health; atlas-1 carries more load.
        quota.try_reserve("atlas-1", 5).unwrap();
        let selection = router.select("summarize", &HashSet::new(), 1).unwrap();
        assert_eq!(selection.model_id, "atlas-2");

        // Equal health and equal load: deterministic id order.
        quota.try_reserve("atlas-2", 5).unwrap();
        let selection = router.select("summarize", &HashSet::new(), 1).unwrap();
        assert_eq!(selection.model_id, "atlas-1");
    }

    #[test]
    fn test_unsupported_specialty() {
        let (_registry, _quota, router) =
            build(vec![ModelDefinition::new("atlas-1", ModelTier::Primary, "summarize")]);

        let result = router.select("translation", &HashSet::new(), 1);
        assert!(matches!(result, Err(RoutingError::UnsupportedSpecialty { .. })));
    }

    #[test]
    fn test_all_candidates_tried() {
        let (_registry, _quota, router) = build(vec![
            ModelDefinition::new("atlas-1", ModelTier::Primary, "summarize"),
            ModelDefinition::new("pathfinder-1", ModelTier::Secondary, "summarize"),
        ]);

        let mut excluded = HashSet::new();
        excluded.insert("atlas-1".to_string());
        excluded.insert("pathfinder-1".to_string());

        let result = router.select("summarize", &excluded, 1);
        assert!(matches!(result, Err(RoutingError::AllCandidatesTried { .. })));
    }

    #[test]
    fn test_none_available_when_all_tiers_exhausted() {
        let (_registry, quota, router) = build(vec![
            ModelDefinition::new("atlas-1", ModelTier::Primary, "summarize").with_quota_limit(1),
            ModelDefinition::new("rescue-1", ModelTier::Emergency, "summarize").with_quota_limit(1),
        ]);

        quota.try_reserve("atlas-1", 1).unwrap();
        quota.try_reserve("rescue-1", 1).unwrap();

        let result = router.select("summarize", &HashSet::new(), 1);
        assert!(matches!(result, Err(RoutingError::NoneAvailable { .. })));
    }

    #[test]
    fn test_three_failures_drop_below_floor_and_exclude() {
        let (registry, _quota, router) =
            build(vec![ModelDefinition::new("atlas-1", ModelTier::Primary, "summarize")]);

        for _ in 0..3 {
            registry.record_outcome("atlas-1", false, Duration::from_millis(10)).unwrap();
        }
        assert!(registry.get("atlas-1").unwrap().health_score < 50.0);

        let result = router.select("summarize", &HashSet::new(), 1);
        assert!(matches!(result, Err(RoutingError::NoneAvailable { .. })));
    }
}
