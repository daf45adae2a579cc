//! Model registry for the worker pool.
//!
//! This module holds the catalog of worker models, their tier, specialties,
//! rolling health, and availability state. It is the single writer of model
//! state: every task outcome funnels through [`ModelRegistry::record_outcome`].
//! The registry never calls out to the router or scheduler.

use crate::config::{ModelDefinition, SchedulerConfig};
use crate::model::{Availability, ModelTier, WorkerModel};
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur when addressing the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No model with the given id exists in the pool.
    #[error("Model not found: {0}")]
    NotFound(String),
}

/// Registry for the worker model pool.
///
/// Constructed once per orchestrator instance from a configuration table;
/// there is no process-wide singleton, so tests get isolated pools.
pub struct ModelRegistry {
    /// Map of model id to model state.
    models: RwLock<HashMap<String, WorkerModel>>,
    /// Consecutive errors after which a model leaves rotation.
    unhealthy_threshold: u32,
    /// Cooldown before an unhealthy model may probe for recovery.
    cooldown: Duration,
    /// Weight of the most recent outcome in the health moving average.
    ema_alpha: f64,
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("model_count", &self.models.read().map(|m| m.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl ModelRegistry {
    /// Creates a registry from a pool definition table.
    ///
    /// # Arguments
    /// * `definitions` - The model pool (validated by the config loader)
    /// * `config` - Scheduler tuning for health tracking
    #[must_use]
    pub fn new(definitions: &[ModelDefinition], config: &SchedulerConfig) -> Self {
        let mut models = HashMap::new();
        for definition in definitions {
            let model = WorkerModel::new(
                definition.id.clone(),
                definition.tier,
                definition.specialties.iter().cloned().collect(),
                definition.initial_health.unwrap_or(100.0),
            );
            models.insert(definition.id.clone(), model);
        }

        debug!(model_count = models.len(), "Model registry loaded");

        Self {
            models: RwLock::new(models),
            unhealthy_threshold: config.unhealthy_threshold,
            cooldown: config.cooldown_after_unhealthy,
            ema_alpha: config.ema_alpha,
        }
    }

    /// Retrieves a model by id.
    ///
    /// # Errors
    /// Returns `RegistryError::NotFound` if the model is not in the pool.
    pub fn get(&self, id: &str) -> Result<WorkerModel, RegistryError> {
        let models = self.models.read().unwrap();
        models.get(id).cloned().ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Lists models in a tier, promoting any whose cooldown has elapsed into
    /// the probing state before returning.
    ///
    /// # Arguments
    /// * `tier` - The tier to list
    pub fn list_by_tier(&self, tier: ModelTier) -> Vec<WorkerModel> {
        let mut models = self.models.write().unwrap();
        let now = Instant::now();

        let mut out = Vec::new();
        for model in models.values_mut() {
            if model.tier != tier {
                continue;
            }
            if let Availability::Cooling(since) = model.availability {
                if now.duration_since(since) >= self.cooldown {
                    model.availability = Availability::Probing;
                    debug!(model_id = %model.id, "Cooldown elapsed, model probing for recovery");
                }
            }
            out.push(model.clone());
        }
        out
    }

    /// Records the outcome of one execution against a model.
    ///
    /// Updates the health moving average, the consecutive-error counter, the
    /// latency average, and the availability state machine.
    ///
    /// # Arguments
    /// * `id` - Model identifier
    /// * `success` - Whether the execution succeeded
    /// * `latency` - Observed execution latency
    ///
    /// # Errors
    /// Returns `RegistryError::NotFound` if the model is not in the pool.
    pub fn record_outcome(
        &self,
        id: &str,
        success: bool,
        latency: Duration,
    ) -> Result<(), RegistryError> {
        let mut models = self.models.write().unwrap();
        let model =
            models.get_mut(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let outcome_value = if success { 100.0 } else { 0.0 };
        model.health_score = (self.ema_alpha * outcome_value
            + (1.0 - self.ema_alpha) * model.health_score)
            .clamp(0.0, 100.0);

        let latency_ms = latency.as_secs_f64() * 1000.0;
        model.avg_latency_ms = if model.last_active.is_none() {
            latency_ms
        } else {
            self.ema_alpha * latency_ms + (1.0 - self.ema_alpha) * model.avg_latency_ms
        };
        model.last_active = Some(Utc::now());

        if success {
            model.consecutive_errors = 0;
            if model.availability == Availability::Probing {
                model.availability = Availability::Available;
                debug!(model_id = %id, "Probe succeeded, model back in rotation");
            }
        } else {
            model.consecutive_errors += 1;
            match model.availability {
                Availability::Probing => {
                    model.availability = Availability::Cooling(Instant::now());
                    warn!(model_id = %id, "Probe failed, model cooling down again");
                }
                Availability::Available
                    if model.consecutive_errors >= self.unhealthy_threshold =>
                {
                    model.availability = Availability::Cooling(Instant::now());
                    warn!(
                        model_id = %id,
                        consecutive_errors = model.consecutive_errors,
                        threshold = self.unhealthy_threshold,
                        "Model marked unhealthy, leaving rotation"
                    );
                }
                _ => {}
            }
        }

        debug!(
            model_id = %id,
            success = success,
            health_score = model.health_score,
            consecutive_errors = model.consecutive_errors,
            "Recorded outcome"
        );

        Ok(())
    }

    /// Whether any model in any tier declares the given specialty.
    ///
    /// Used by the router to distinguish a permanently unsupported specialty
    /// from transient exhaustion.
    pub fn supports_specialty(&self, specialty: &str) -> bool {
        let models = self.models.read().unwrap();
        models.values().any(|m| m.serves(specialty))
    }

    /// Returns a snapshot of every model in the pool.
    pub fn snapshot(&self) -> Vec<WorkerModel> {
        let models = self.models.read().unwrap();
        let mut out: Vec<WorkerModel> = models.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Returns the number of models in the pool.
    pub fn count(&self) -> usize {
        let models = self.models.read().unwrap();
        models.len()
    }
}
