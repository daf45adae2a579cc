//! TOML configuration file support for the orchestrator.

use crate::model::ModelTier;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the file.
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("Failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error.
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Tuning knobs for scheduling, routing, and health tracking.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Minimum health score a model must hold to be routable.
    pub health_floor: f64,
    /// Maximum number of (re)assignments before a task fails terminally.
    pub max_attempts: u32,
    /// Consecutive errors after which a model leaves rotation.
    pub unhealthy_threshold: u32,
    /// Default quota window duration for models that do not override it.
    pub quota_window: Duration,
    /// How long an unhealthy model cools down before a recovery probe.
    pub cooldown_after_unhealthy: Duration,
    /// Scheduling loop tick interval.
    pub tick_interval: Duration,
    /// Base delay for per-task retry backoff.
    pub retry_backoff_base: Duration,
    /// Upper bound on per-task retry backoff.
    pub retry_backoff_cap: Duration,
    /// Weight of the most recent outcome in the health moving average.
    pub ema_alpha: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            health_floor: 50.0,
            max_attempts: 3,
            unhealthy_threshold: 3,
            quota_window: Duration::from_secs(60),
            cooldown_after_unhealthy: Duration::from_secs(30),
            tick_interval: Duration::from_millis(100),
            retry_backoff_base: Duration::from_millis(250),
            retry_backoff_cap: Duration::from_secs(10),
            ema_alpha: 0.3,
        }
    }
}

/// Declaration of one worker model in the pool.
///
/// The pool is always loaded from a configuration table; there are no
/// compiled-in model lists.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelDefinition {
    /// Unique model identifier.
    pub id: String,

    /// Priority tier.
    pub tier: ModelTier,

    /// Capability tags this model serves.
    pub specialties: Vec<String>,

    /// Quota budget (units of work) per window.
    pub quota_limit: u32,

    /// Per-model quota window override, in (possibly fractional) seconds.
    pub quota_window_secs: Option<f64>,

    /// Starting health score (defaults to 100).
    pub initial_health: Option<f64>,
}

impl ModelDefinition {
    /// Creates a definition with the given id and tier, one specialty, and a
    /// generous quota. Primarily a convenience for tests and examples.
    #[must_use]
    pub fn new(id: impl Into<String>, tier: ModelTier, specialty: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tier,
            specialties: vec![specialty.into()],
            quota_limit: 100,
            quota_window_secs: None,
            initial_health: None,
        }
    }

    /// Sets the quota budget per window.
    #[must_use]
    pub fn with_quota_limit(mut self, limit: u32) -> Self {
        self.quota_limit = limit;
        self
    }

    /// Sets a per-model quota window override.
    #[must_use]
    pub fn with_quota_window(mut self, window: Duration) -> Self {
        self.quota_window_secs = Some(window.as_secs_f64());
        self
    }

    /// Adds a specialty to this model.
    #[must_use]
    pub fn with_specialty(mut self, specialty: impl Into<String>) -> Self {
        self.specialties.push(specialty.into());
        self
    }
}

/// Full orchestrator configuration: tuning plus the model pool.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Scheduler tuning.
    pub scheduler: SchedulerConfig,
    /// The worker model pool.
    pub models: Vec<ModelDefinition>,
}

impl OrchestratorConfig {
    /// Creates a configuration with default tuning and the given pool.
    #[must_use]
    pub fn new(models: Vec<ModelDefinition>) -> Self {
        Self { scheduler: SchedulerConfig::default(), models }
    }
}

/// Raw `[scheduler]` section as it appears in the TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
struct SchedulerSection {
    health_floor: Option<f64>,
    max_attempts: Option<u32>,
    unhealthy_threshold: Option<u32>,
    quota_window_secs: Option<u64>,
    cooldown_secs: Option<u64>,
    tick_interval_ms: Option<u64>,
    retry_backoff_ms: Option<u64>,
    retry_backoff_cap_ms: Option<u64>,
    ema_alpha: Option<f64>,
}

/// Raw configuration file shape.
#[derive(Debug, Clone, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    scheduler: SchedulerSection,
    #[serde(default)]
    models: Vec<ModelDefinition>,
}

/// Configuration loader for orchestrator settings.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads orchestrator configuration from a TOML file.
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<OrchestratorConfig> {
        let content = std::fs::read_to_string(path)?;
        let file: ConfigFile = toml::from_str(&content)?;

        let defaults = SchedulerConfig::default();
        let section = file.scheduler;
        let scheduler = SchedulerConfig {
            health_floor: section.health_floor.unwrap_or(defaults.health_floor),
            max_attempts: section.max_attempts.unwrap_or(defaults.max_attempts),
            unhealthy_threshold: section
                .unhealthy_threshold
                .unwrap_or(defaults.unhealthy_threshold),
            quota_window: section
                .quota_window_secs
                .map_or(defaults.quota_window, Duration::from_secs),
            cooldown_after_unhealthy: section
                .cooldown_secs
                .map_or(defaults.cooldown_after_unhealthy, Duration::from_secs),
            tick_interval: section
                .tick_interval_ms
                .map_or(defaults.tick_interval, Duration::from_millis),
            retry_backoff_base: section
                .retry_backoff_ms
                .map_or(defaults.retry_backoff_base, Duration::from_millis),
            retry_backoff_cap: section
                .retry_backoff_cap_ms
                .map_or(defaults.retry_backoff_cap, Duration::from_millis),
            ema_alpha: section.ema_alpha.unwrap_or(defaults.ema_alpha),
        };

        let config = OrchestratorConfig { scheduler, models: file.models };
        Self::validate(&config)?;
        Ok(config)
    }

    /// Validates orchestrator configuration.
    ///
    /// # Arguments
    /// * `config` - Configuration to validate
    ///
    /// # Errors
    /// Returns error if configuration is invalid.
    pub fn validate(config: &OrchestratorConfig) -> Result<()> {
        let scheduler = &config.scheduler;

        if !(0.0..=100.0).contains(&scheduler.health_floor) {
            return Err(ConfigError::Validation(format!(
                "Invalid health_floor: {}. Must be between 0.0 and 100.0",
                scheduler.health_floor
            )));
        }

        if scheduler.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        if scheduler.unhealthy_threshold == 0 {
            return Err(ConfigError::Validation(
                "unhealthy_threshold must be at least 1".to_string(),
            ));
        }

        if !(scheduler.ema_alpha > 0.0 && scheduler.ema_alpha <= 1.0) {
            return Err(ConfigError::Validation(format!(
                "Invalid ema_alpha: {}. Must be in (0.0, 1.0]",
                scheduler.ema_alpha
            )));
        }

        if scheduler.quota_window.is_zero() {
            return Err(ConfigError::Validation(
                "quota_window_secs must be non-zero".to_string(),
            ));
        }

        if scheduler.tick_interval.is_zero() {
            return Err(ConfigError::Validation(
                "tick_interval_ms must be non-zero".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for model in &config.models {
            if model.id.is_empty() {
                return Err(ConfigError::Validation(
                    "Model id must not be empty".to_string(),
                ));
            }

            if !seen.insert(model.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate model id: {}",
                    model.id
                )));
            }

            if model.specialties.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Model '{}' must declare at least one specialty",
                    model.id
                )));
            }

            if model.quota_limit == 0 {
                return Err(ConfigError::Validation(format!(
                    "Model '{}' must have a non-zero quota_limit",
                    model.id
                )));
            }

            if let Some(window) = model.quota_window_secs {
                if window <= 0.0 {
                    return Err(ConfigError::Validation(format!(
                        "Model '{}': quota_window_secs must be positive",
                        model.id
                    )));
                }
            }

            if let Some(health) = model.initial_health {
                if !(0.0..=100.0).contains(&health) {
                    return Err(ConfigError::Validation(format!(
                        "Model '{}': initial_health {} out of range [0, 100]",
                        model.id, health
                    )));
                }
            }
        }

        Ok(())
    }
}
