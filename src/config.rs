//! Configuration types.
//!
//! Every struct has a `Default` tuned for production and a `from_env()` that
//! overrides individual fields from `COMPLIANCE_*` environment variables.
//! Unparseable values fall back to the default with a warning.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Read an environment variable and parse it, falling back to `default`.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Unparseable config value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(key, default.as_secs()))
}

/// Verification pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Upper bound on concurrent model calls within one run.
    pub max_concurrent_evaluations: usize,
    /// Timeout applied to every individual model / store call.
    pub call_timeout: Duration,
    /// Timeout applied to a whole step.
    pub step_timeout: Duration,
    /// Step duration assumed before any step has been observed in a run.
    pub default_step_estimate: Duration,
    /// Guideline text is truncated to this many characters before evaluation.
    pub max_guideline_chars: usize,
    /// Content text is truncated to this many characters in the prompt.
    pub max_content_chars: usize,
    /// Sampling temperature for evaluation calls.
    pub evaluation_temperature: f32,
    /// Max output tokens for evaluation calls.
    pub evaluation_max_tokens: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_evaluations: 4,
            call_timeout: Duration::from_secs(60),
            step_timeout: Duration::from_secs(600),
            default_step_estimate: Duration::from_secs(30),
            max_guideline_chars: 12_000,
            max_content_chars: 4_000,
            evaluation_temperature: 0.1,
            evaluation_max_tokens: 1024,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_concurrent_evaluations: env_or(
                "COMPLIANCE_MAX_CONCURRENT_EVALUATIONS",
                d.max_concurrent_evaluations,
            )
            .max(1),
            call_timeout: env_secs("COMPLIANCE_CALL_TIMEOUT_SECS", d.call_timeout),
            step_timeout: env_secs("COMPLIANCE_STEP_TIMEOUT_SECS", d.step_timeout),
            default_step_estimate: env_secs(
                "COMPLIANCE_DEFAULT_STEP_ESTIMATE_SECS",
                d.default_step_estimate,
            ),
            max_guideline_chars: env_or("COMPLIANCE_MAX_GUIDELINE_CHARS", d.max_guideline_chars),
            max_content_chars: env_or("COMPLIANCE_MAX_CONTENT_CHARS", d.max_content_chars),
            evaluation_temperature: env_or(
                "COMPLIANCE_EVALUATION_TEMPERATURE",
                d.evaluation_temperature,
            ),
            evaluation_max_tokens: env_or(
                "COMPLIANCE_EVALUATION_MAX_TOKENS",
                d.evaluation_max_tokens,
            ),
        }
    }
}

/// Guideline retrieval policy.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub min_similarity: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_similarity: 0.65,
        }
    }
}

impl RetrievalConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            top_k: env_or("COMPLIANCE_RETRIEVAL_TOP_K", d.top_k).max(1),
            min_similarity: env_or("COMPLIANCE_RETRIEVAL_MIN_SIMILARITY", d.min_similarity)
                .clamp(0.0, 1.0),
        }
    }
}

/// Background loop settings: stall sweep and pending pickup.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// How often the stall sweep runs.
    pub interval: Duration,
    /// Minimum time a run may stay RUNNING before it is considered stalled.
    pub stall_floor: Duration,
    /// Additional allowance per content unit.
    pub per_unit_allowance: Duration,
    /// How often PENDING runs are picked up.
    pub pickup_interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(180),
            stall_floor: Duration::from_secs(600),
            per_unit_allowance: Duration::from_secs(30),
            pickup_interval: Duration::from_secs(60),
        }
    }
}

impl SweepConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            interval: env_secs("COMPLIANCE_SWEEP_INTERVAL_SECS", d.interval),
            stall_floor: env_secs("COMPLIANCE_STALL_FLOOR_SECS", d.stall_floor),
            per_unit_allowance: env_secs("COMPLIANCE_STALL_PER_UNIT_SECS", d.per_unit_allowance),
            pickup_interval: env_secs("COMPLIANCE_PICKUP_INTERVAL_SECS", d.pickup_interval),
        }
    }

    /// Stall threshold for a run over `unit_count` content units.
    pub fn stall_threshold(&self, unit_count: usize) -> Duration {
        let proportional = self.per_unit_allowance.saturating_mul(unit_count as u32);
        proportional.max(self.stall_floor)
    }
}

/// Process-level settings for the daemon binary.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    /// Directory of `.md` / `.txt` guideline documents indexed at startup.
    pub guidelines_dir: Option<PathBuf>,
    pub pipeline: PipelineConfig,
    pub retrieval: RetrievalConfig,
    pub sweep: SweepConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("COMPLIANCE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/compliance.db")),
            guidelines_dir: std::env::var("COMPLIANCE_GUIDELINES_DIR")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            pipeline: PipelineConfig::from_env(),
            retrieval: RetrievalConfig::from_env(),
            sweep: SweepConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stall_threshold_has_floor() {
        let cfg = SweepConfig::default();
        assert_eq!(cfg.stall_threshold(0), cfg.stall_floor);
        assert_eq!(cfg.stall_threshold(3), cfg.stall_floor);
    }

    #[test]
    fn stall_threshold_scales_with_units() {
        let cfg = SweepConfig {
            stall_floor: Duration::from_secs(60),
            per_unit_allowance: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(cfg.stall_threshold(20), Duration::from_secs(200));
    }

    #[test]
    fn retrieval_defaults() {
        let cfg = RetrievalConfig::default();
        assert_eq!(cfg.top_k, 5);
        assert!(cfg.min_similarity >= 0.6 && cfg.min_similarity <= 0.7);
    }
}
