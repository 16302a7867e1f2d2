//! Bridges rig-core completion models to `LlmProvider`.

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionModel, Message};

use crate::error::LlmError;
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

/// Anthropic rejects requests without an explicit output limit.
const DEFAULT_MAX_TOKENS: u64 = 1024;

/// Adapter from a rig `CompletionModel` to our provider trait.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut preamble = String::new();
        let mut history: Vec<Message> = Vec::new();
        for msg in request.messages {
            match msg.role {
                Role::System => {
                    if !preamble.is_empty() {
                        preamble.push_str("\n\n");
                    }
                    preamble.push_str(&msg.content);
                }
                Role::User => history.push(Message::user(msg.content)),
                Role::Assistant => history.push(Message::assistant(msg.content)),
            }
        }

        let prompt = history.pop().ok_or_else(|| LlmError::InvalidResponse {
            provider: self.model_name.clone(),
            reason: "completion request has no user message".to_string(),
        })?;

        let mut builder = self.model.completion_request(prompt).messages(history);
        if !preamble.is_empty() {
            builder = builder.preamble(preamble);
        }
        if let Some(t) = request.temperature {
            builder = builder.temperature(t as f64);
        }
        builder = builder.max_tokens(
            request
                .max_tokens
                .map(u64::from)
                .unwrap_or(DEFAULT_MAX_TOKENS),
        );

        let response = builder
            .send()
            .await
            .map_err(|e| classify_error(&self.model_name, e.to_string()))?;

        let content = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        if content.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.model_name.clone(),
                reason: "response contained no text".to_string(),
            });
        }

        Ok(CompletionResponse {
            content,
            input_tokens: response.usage.input_tokens as u32,
            output_tokens: response.usage.output_tokens as u32,
            finish_reason: FinishReason::Stop,
        })
    }
}

/// Map a rig error message onto our error kinds. rig only exposes the HTTP
/// failure as text, so this keys on status codes in the message.
fn classify_error(provider: &str, reason: String) -> LlmError {
    let lower = reason.to_lowercase();
    if lower.contains("401") || lower.contains("403") || lower.contains("authentication") {
        LlmError::AuthFailed {
            provider: provider.to_string(),
        }
    } else if lower.contains("429") || lower.contains("rate limit") {
        LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        }
    } else {
        LlmError::RequestFailed {
            provider: provider.to_string(),
            reason,
        }
    }
}
