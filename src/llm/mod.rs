//! Generative model access.
//!
//! The pipeline only sees `Arc<dyn LlmProvider>`. Real backends go through
//! rig-core and `RigAdapter`; tests inject scripted providers.

pub mod provider;
pub(crate) mod retry;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::str::FromStr;
use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{ConfigError, LlmError};

/// Model backends reachable through rig-core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl LlmBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }

    fn api_key_var(&self) -> &'static str {
        match self {
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
        }
    }

    /// Model used when `COMPLIANCE_MODEL` is unset.
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Anthropic => "claude-sonnet-4-20250514",
            Self::OpenAi => "gpt-4o",
        }
    }
}

impl FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" | "gpt" => Ok(Self::OpenAi),
            other => Err(format!("unsupported backend '{other}'")),
        }
    }
}

/// Which model evaluates content, and the key to reach it.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: SecretString,
    pub model: String,
}

impl LlmConfig {
    /// `COMPLIANCE_LLM_BACKEND` (default anthropic), the backend's API key
    /// variable, and optionally `COMPLIANCE_MODEL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend: LlmBackend = std::env::var("COMPLIANCE_LLM_BACKEND")
            .unwrap_or_else(|_| "anthropic".to_string())
            .parse()
            .map_err(|message| ConfigError::InvalidValue {
                key: "COMPLIANCE_LLM_BACKEND".to_string(),
                message,
            })?;

        let key_var = backend.api_key_var();
        let api_key = std::env::var(key_var)
            .map_err(|_| ConfigError::MissingEnvVar(key_var.to_string()))?;
        let model = std::env::var("COMPLIANCE_MODEL")
            .unwrap_or_else(|_| backend.default_model().to_string());

        Ok(Self {
            backend,
            api_key: SecretString::from(api_key),
            model,
        })
    }
}

/// Build the configured provider. Construction does not contact the
/// backend; a bad key surfaces on the first request.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::{anthropic, openai};

    let client_error = |e: &dyn std::fmt::Display| LlmError::RequestFailed {
        provider: config.backend.as_str().to_string(),
        reason: format!("client construction failed: {e}"),
    };
    let key = config.api_key.expose_secret();

    let provider: Arc<dyn LlmProvider> = match config.backend {
        LlmBackend::Anthropic => {
            let client: rig::client::Client<anthropic::client::AnthropicExt> =
                anthropic::Client::new(key).map_err(|e| client_error(&e))?;
            Arc::new(RigAdapter::new(
                client.completion_model(&config.model),
                &config.model,
            ))
        }
        LlmBackend::OpenAi => {
            let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
                openai::Client::new(key).map_err(|e| client_error(&e))?;
            Arc::new(RigAdapter::new(
                client.completion_model(&config.model),
                &config.model,
            ))
        }
    };

    tracing::info!(backend = config.backend.as_str(), model = %config.model, "Evaluation model ready");
    Ok(provider)
}
