//! Completion-time estimate from observed step durations.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::VerificationStep;

/// Number of most recent step durations averaged.
const WINDOW: usize = 5;

#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    default_step: Duration,
}

impl ProgressEstimator {
    pub fn new(default_step: Duration) -> Self {
        Self { default_step }
    }

    /// Moving average over the last few observed steps, or the default when
    /// nothing has been observed yet.
    pub fn average_step(&self, observed_ms: &[u64]) -> Duration {
        let recent = &observed_ms[observed_ms.len().saturating_sub(WINDOW)..];
        if recent.is_empty() {
            return self.default_step;
        }
        let total: u64 = recent.iter().sum();
        Duration::from_millis(total / recent.len() as u64)
    }

    /// Estimated completion when entering `step` at `now`.
    pub fn estimate(
        &self,
        step: VerificationStep,
        observed_ms: &[u64],
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let remaining = self.average_step(observed_ms) * step.remaining_including() as u32;
        now + chrono::Duration::from_std(remaining).unwrap_or(chrono::Duration::zero())
    }
}
