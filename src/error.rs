//! Error types for the compliance review pipeline.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Guideline error: {0}")]
    Guideline(#[from] GuidelineError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    #[error("Carrier error: {0}")]
    Carrier(#[from] CarrierError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

impl LlmError {
    /// Whether a second attempt at the same call can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed { .. } | Self::RateLimited { .. } | Self::InvalidResponse { .. }
        )
    }
}

/// Embedding provider errors.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Cannot embed empty text")]
    EmptyInput,

    #[error("Embedding request to {provider} failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid embedding response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Guideline store / retrieval errors.
#[derive(Debug, thiserror::Error)]
pub enum GuidelineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Content-unit-scoped evaluation errors. These never fail a whole run.
#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("Model unavailable while evaluating unit {unit_id}: {reason}")]
    ModelUnavailable { unit_id: Uuid, reason: String },

    #[error("Malformed model output for unit {unit_id}: {reason}")]
    MalformedOutput { unit_id: Uuid, reason: String },

    #[error("Model call for unit {unit_id} timed out after {timeout:?}")]
    Timeout { unit_id: Uuid, timeout: Duration },
}

impl EvaluationError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Report assembly errors.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("No determinate findings for submission {submission_id}")]
    NoDeterminateFindings { submission_id: Uuid },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Carrier transport errors.
#[derive(Debug, thiserror::Error)]
pub enum CarrierError {
    #[error("Carrier transport {transport} failed: {reason}")]
    Transport { transport: String, reason: String },

    #[error("Carrier call to {transport} timed out after {timeout:?}")]
    Timeout { transport: String, timeout: Duration },

    #[error("Submission {0} not found")]
    SubmissionNotFound(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Pipeline-level errors surfaced to callers of the service API.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Submission {0} not found")]
    SubmissionNotFound(Uuid),

    #[error("Verification {id} is {from}, cannot transition to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn load_report(found: bool) -> Result<()> {
        if !found {
            Err(ReportError::NoDeterminateFindings {
                submission_id: Uuid::nil(),
            })?;
        }
        Ok(())
    }

    #[test]
    fn module_errors_lift_into_crate_error() {
        assert!(load_report(true).is_ok());
        let err = load_report(false).unwrap_err();
        assert!(matches!(err, Error::Report(_)));

        let err: Error = DatabaseError::Query("locked".into()).into();
        assert!(err.to_string().contains("locked"));
    }
}
