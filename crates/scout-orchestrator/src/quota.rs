//! Quota tracker for per-model, time-windowed usage budgets.
//!
//! Reservations against one model are serialized through that model's own
//! lock (no lost updates); different models reserve independently. The window
//! rolls lazily: any reserve/headroom/usage call first resets the budget when
//! a full window has elapsed.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur during quota accounting.
#[derive(Debug, Error)]
pub enum QuotaError {
    /// The model's budget for the current window is exhausted.
    #[error("Quota exhausted for model '{model_id}' ({used}/{limit})")]
    Exhausted {
        /// Model identifier.
        model_id: String,
        /// Units consumed in the current window.
        used: u32,
        /// Budget per window.
        limit: u32,
    },

    /// The model has no registered quota window.
    #[error("No quota window registered for model '{0}'")]
    UnknownModel(String),
}

/// Result type for quota operations.
pub type Result<T> = std::result::Result<T, QuotaError>;

/// Usage snapshot for one model's current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaUsage {
    /// Units consumed in the current window.
    pub used: u32,
    /// Budget per window.
    pub limit: u32,
}

impl QuotaUsage {
    /// Fraction of the budget consumed, in [0, 1].
    #[must_use]
    pub fn ratio(&self) -> f64 {
        if self.limit == 0 {
            return 1.0;
        }
        f64::from(self.used) / f64::from(self.limit)
    }
}

/// Budget state for one model.
#[derive(Debug)]
struct QuotaWindow {
    used: u32,
    limit: u32,
    window_started_at: Instant,
    window_duration: Duration,
}

impl QuotaWindow {
    fn new(limit: u32, window_duration: Duration) -> Self {
        Self { used: 0, limit, window_started_at: Instant::now(), window_duration }
    }

    /// Resets the budget if a full window has elapsed since the window start.
    fn roll_if_elapsed(&mut self, now: Instant) {
        if now.duration_since(self.window_started_at) >= self.window_duration {
            self.used = 0;
            self.window_started_at = now;
        }
    }
}

/// Quota tracker for the worker model pool.
pub struct QuotaTracker {
    /// Per-model windows; the outer map is read-mostly, each window has its
    /// own lock so models reserve independently.
    windows: RwLock<HashMap<String, Arc<Mutex<QuotaWindow>>>>,
}

impl fmt::Debug for QuotaTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaTracker")
            .field("model_count", &self.windows.read().map(|w| w.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl QuotaTracker {
    /// Creates an empty quota tracker.
    #[must_use]
    pub fn new() -> Self {
        Self { windows: RwLock::new(HashMap::new()) }
    }

    /// Registers a budget window for a model.
    ///
    /// # Arguments
    /// * `model_id` - Model identifier
    /// * `limit` - Units of work allowed per window
    /// * `window` - Window duration
    pub fn register_model(&self, model_id: &str, limit: u32, window: Duration) {
        let mut windows = self.windows.write().unwrap();
        if windows
            .insert(model_id.to_string(), Arc::new(Mutex::new(QuotaWindow::new(limit, window))))
            .is_some()
        {
            warn!(model_id = %model_id, "Quota window replaced for model");
        }
    }

    fn window(&self, model_id: &str) -> Result<Arc<Mutex<QuotaWindow>>> {
        let windows = self.windows.read().unwrap();
        windows
            .get(model_id)
            .cloned()
            .ok_or_else(|| QuotaError::UnknownModel(model_id.to_string()))
    }

    /// Attempts to reserve budget for one unit of work.
    ///
    /// Rolls the window first if it has elapsed, then grants the reservation
    /// only if it fits within the limit. Immediately after a granted reserve,
    /// `used` never exceeds `limit`.
    ///
    /// # Arguments
    /// * `model_id` - Model identifier
    /// * `cost` - Units of work to reserve
    ///
    /// # Errors
    /// Returns `QuotaError::Exhausted` if the reservation does not fit, or
    /// `QuotaError::UnknownModel` for an unregistered model.
    pub fn try_reserve(&self, model_id: &str, cost: u32) -> Result<()> {
        let window = self.window(model_id)?;
        let mut state = window.lock().unwrap();
        state.roll_if_elapsed(Instant::now());

        if state.used.saturating_add(cost) > state.limit {
            return Err(QuotaError::Exhausted {
                model_id: model_id.to_string(),
                used: state.used,
                limit: state.limit,
            });
        }

        state.used += cost;
        debug!(
            model_id = %model_id,
            cost = cost,
            used = state.used,
            limit = state.limit,
            "Reserved quota"
        );
        Ok(())
    }

    /// Releases previously reserved budget.
    ///
    /// Called when an execution fails (or is cancelled) before it benefited
    /// from the budget; completed work is never refunded. If the window
    /// rolled between reserve and release, the release is absorbed by the
    /// fresh window's zero floor.
    ///
    /// # Arguments
    /// * `model_id` - Model identifier
    /// * `cost` - Units of work to refund
    ///
    /// # Errors
    /// Returns `QuotaError::UnknownModel` for an unregistered model.
    pub fn release(&self, model_id: &str, cost: u32) -> Result<()> {
        let window = self.window(model_id)?;
        let mut state = window.lock().unwrap();
        state.used = state.used.saturating_sub(cost);
        debug!(model_id = %model_id, cost = cost, used = state.used, "Released quota");
        Ok(())
    }

    /// Dry-run admission check: whether a reservation of `cost` would fit.
    ///
    /// Rolls the window first if it has elapsed, but does not consume budget.
    ///
    /// # Errors
    /// Returns `QuotaError::UnknownModel` for an unregistered model.
    pub fn headroom(&self, model_id: &str, cost: u32) -> Result<bool> {
        let window = self.window(model_id)?;
        let mut state = window.lock().unwrap();
        state.roll_if_elapsed(Instant::now());
        Ok(state.used.saturating_add(cost) <= state.limit)
    }

    /// Returns the current usage for a model's window.
    ///
    /// # Errors
    /// Returns `QuotaError::UnknownModel` for an unregistered model.
    pub fn usage(&self, model_id: &str) -> Result<QuotaUsage> {
        let window = self.window(model_id)?;
        let mut state = window.lock().unwrap();
        state.roll_if_elapsed(Instant::now());
        Ok(QuotaUsage { used: state.used, limit: state.limit })
    }
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn tracker_with(limit: u32, window: Duration) -> QuotaTracker {
        let tracker = QuotaTracker::new();
        tracker.register_model("m1", limit, window);
        tracker
    }

    #[test]
    fn test_reserve_within_limit() {
        let tracker = tracker_with(3, Duration::from_secs(60));
        assert!(tracker.try_reserve("m1", 1).is_ok());
        assert!(tracker.try_reserve("m1", 2).is_ok());
        assert_eq!(tracker.usage("m1").unwrap(), QuotaUsage { used: 3, limit: 3 });
    }

    #[test]
    fn test_used_never_exceeds_limit() {
        let tracker = tracker_with(2, Duration::from_secs(60));
        assert!(tracker.try_reserve("m1", 1).is_ok());
        assert!(tracker.try_reserve("m1", 1).is_ok());

        let denied = tracker.try_reserve("m1", 1);
        assert!(matches!(denied, Err(QuotaError::Exhausted { used: 2, limit: 2, .. })));
        assert_eq!(tracker.usage("m1").unwrap().used, 2);
    }

    #[test]
    fn test_release_refunds_failed_work() {
        let tracker = tracker_with(1, Duration::from_secs(60));
        tracker.try_reserve("m1", 1).unwrap();
        assert!(tracker.try_reserve("m1", 1).is_err());

        tracker.release("m1", 1).unwrap();
        assert!(tracker.try_reserve("m1", 1).is_ok());
    }

    #[test]
    fn test_window_resets_once_after_elapse() {
        let tracker = tracker_with(1, Duration::from_millis(50));
        tracker.try_reserve("m1", 1).unwrap();
        assert!(tracker.try_reserve("m1", 1).is_err());

        thread::sleep(Duration::from_millis(80));

        // First touch after the elapse rolls the window exactly once.
        assert!(tracker.try_reserve("m1", 1).is_ok());
        assert_eq!(tracker.usage("m1").unwrap().used, 1);
        assert!(tracker.try_reserve("m1", 1).is_err());
    }

    #[test]
    fn test_headroom_does_not_consume() {
        let tracker = tracker_with(1, Duration::from_secs(60));
        assert!(tracker.headroom("m1", 1).unwrap());
        assert!(tracker.headroom("m1", 1).unwrap());
        assert_eq!(tracker.usage("m1").unwrap().used, 0);

        tracker.try_reserve("m1", 1).unwrap();
        assert!(!tracker.headroom("m1", 1).unwrap());
    }

    #[test]
    fn test_unknown_model() {
        let tracker = QuotaTracker::new();
        assert!(matches!(tracker.try_reserve("ghost", 1), Err(QuotaError::UnknownModel(_))));
        assert!(matches!(tracker.release("ghost", 1), Err(QuotaError::UnknownModel(_))));
    }

    #[test]
    fn test_release_saturates_at_zero() {
        let tracker = tracker_with(5, Duration::from_secs(60));
        tracker.release("m1", 3).unwrap();
        assert_eq!(tracker.usage("m1").unwrap().used, 0);
    }

    #[test]
    fn test_concurrent_reservations_no_lost_updates() {
        let tracker = Arc::new(tracker_with(64, Duration::from_secs(60)));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = Arc::clone(&tracker);
            handles.push(thread::spawn(move || {
                for _ in 0..8 {
                    tracker.try_reserve("m1", 1).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.usage("m1").unwrap().used, 64);
    }
}
