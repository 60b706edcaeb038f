//! The consolidation loop's adaptive cadence.

use data_types::OverlapStatus;
use std::time::Duration;

/// Multiplicative increase / decrease of the loop period, clamped to
/// `[period_min, period_max]`.
///
/// Overlap pressure slows the loop down (bigger batches accumulate between
/// rounds); calm phases speed it back up until it converges on
/// `period_min`.
#[derive(Debug, Clone)]
pub struct AdaptivePeriod {
    period: Duration,
    min: Duration,
    max: Duration,
    multiplier: f64,
}

impl AdaptivePeriod {
    /// Start at `min`.
    pub fn new(min: Duration, max: Duration, multiplier: f64) -> Self {
        assert!(multiplier > 1.0, "period multiplier must exceed 1");
        assert!(min <= max, "period bounds inverted");
        assert!(!min.is_zero(), "period floor must be positive");
        Self {
            period: min,
            min,
            max,
            multiplier,
        }
    }

    /// The current loop period.
    pub fn current(&self) -> Duration {
        self.period
    }

    /// Fold one overlap observation into the period. Returns whether this
    /// round should proceed to consolidation: critical pressure skips the
    /// round entirely.
    pub fn observe(&mut self, status: OverlapStatus) -> bool {
        match status {
            OverlapStatus::Critical => {
                self.grow();
                false
            }
            OverlapStatus::Soft => {
                self.grow();
                true
            }
            OverlapStatus::Ok => {
                self.shrink();
                true
            }
        }
    }

    /// Drop back to the base period after a swallowed error.
    pub fn reset(&mut self) {
        self.period = self.min;
    }

    fn grow(&mut self) {
        self.period = self.period.mul_f64(self.multiplier).min(self.max);
    }

    fn shrink(&mut self) {
        self.period = self.period.div_f64(self.multiplier).max(self.min);
    }
}
