//! Evaluator: judges one content unit against guideline text.
//!
//! Flow per unit:
//! 1. Screening rules (fast, no model) → hints for the prompt
//! 2. Model call → structured JSON finding
//! 3. Malformed output → one retry with a stricter instruction
//! 4. Outcome persisted on the unit, write-once per run

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{EvaluationError, LlmError};
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::llm::retry::with_single_retry;
use crate::model::{ContentUnit, Finding, UnitOutcome, Verdict};
use crate::pipeline::screening::{ScreenNote, ScreeningRules};
use crate::store::Database;

/// Result of evaluating one unit within a run.
#[derive(Debug, Clone)]
pub struct UnitResult {
    pub unit_id: Uuid,
    pub outcome: UnitOutcome,
    /// The model call exceeded its timeout.
    pub timed_out: bool,
    /// Whether this call wrote the outcome (false if the run had already
    /// recorded one, or the write failed).
    pub recorded: bool,
}

impl UnitResult {
    pub fn verdict(&self) -> Verdict {
        self.outcome.verdict()
    }
}

/// Model-backed unit evaluator.
pub struct Evaluator {
    llm: Arc<dyn LlmProvider>,
    db: Arc<dyn Database>,
    screening: ScreeningRules,
    config: PipelineConfig,
}

impl Evaluator {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        db: Arc<dyn Database>,
        screening: ScreeningRules,
        config: PipelineConfig,
    ) -> Self {
        Self {
            llm,
            db,
            screening,
            config,
        }
    }

    /// Judge `unit` against `guideline_text`.
    pub async fn evaluate(
        &self,
        unit: &ContentUnit,
        guideline_text: &str,
        brand_name: &str,
    ) -> Result<Finding, EvaluationError> {
        let notes = self.screening.screen(unit, brand_name);
        let mut messages = vec![
            ChatMessage::system(build_evaluation_system_prompt()),
            ChatMessage::user(build_evaluation_user_prompt(
                unit,
                guideline_text,
                brand_name,
                &notes,
                self.config.max_content_chars,
            )),
        ];

        let raw = self.call_model(unit.id, &messages).await?;
        let finding = match parse_finding(&raw) {
            Ok(f) => f,
            Err(first_err) => {
                warn!(
                    unit_id = %unit.id,
                    error = %first_err,
                    "Malformed evaluation output, retrying with stricter instruction"
                );
                messages.push(ChatMessage::assistant(raw));
                messages.push(ChatMessage::user(STRICT_RETRY_INSTRUCTION));
                let retry_raw = self.call_model(unit.id, &messages).await?;
                parse_finding(&retry_raw).map_err(|reason| EvaluationError::MalformedOutput {
                    unit_id: unit.id,
                    reason,
                })?
            }
        };

        Ok(merge_screen_notes(finding, &notes))
    }

    /// Evaluate and persist. Never fails: errors become an indeterminate outcome.
    pub async fn evaluate_unit(
        &self,
        verification_id: Uuid,
        unit: &ContentUnit,
        guideline_text: &str,
        brand_name: &str,
    ) -> UnitResult {
        let (outcome, timed_out) = match self.evaluate(unit, guideline_text, brand_name).await {
            Ok(finding) => {
                debug!(unit_id = %unit.id, compliant = finding.compliant, "Unit evaluated");
                (UnitOutcome::Finding(finding), false)
            }
            Err(e) => {
                warn!(
                    verification_id = %verification_id,
                    unit_id = %unit.id,
                    error = %e,
                    "Unit evaluation failed, marking indeterminate"
                );
                (
                    UnitOutcome::Error {
                        reason: e.to_string(),
                    },
                    e.is_timeout(),
                )
            }
        };

        let recorded = match self
            .db
            .record_unit_outcome(unit.id, verification_id, &outcome, Utc::now())
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                info!(
                    verification_id = %verification_id,
                    unit_id = %unit.id,
                    "Unit already evaluated in this run, keeping first outcome"
                );
                false
            }
            Err(e) => {
                warn!(unit_id = %unit.id, error = %e, "Failed to persist unit outcome");
                false
            }
        };

        UnitResult {
            unit_id: unit.id,
            outcome,
            timed_out,
            recorded,
        }
    }

    /// One logical model call: transient failures retried once, the whole
    /// call bounded by `call_timeout`.
    async fn call_model(
        &self,
        unit_id: Uuid,
        messages: &[ChatMessage],
    ) -> Result<String, EvaluationError> {
        let request = CompletionRequest::new(messages.to_vec())
            .with_temperature(self.config.evaluation_temperature)
            .with_max_tokens(self.config.evaluation_max_tokens);

        let call = with_single_retry("evaluate", || self.llm.complete(request.clone()));
        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(Ok(response)) => Ok(response.content),
            Ok(Err(e)) => Err(model_unavailable(unit_id, e)),
            Err(_) => Err(EvaluationError::Timeout {
                unit_id,
                timeout: self.config.call_timeout,
            }),
        }
    }
}

fn model_unavailable(unit_id: Uuid, e: LlmError) -> EvaluationError {
    EvaluationError::ModelUnavailable {
        unit_id,
        reason: e.to_string(),
    }
}

/// Screening notes the model did not mention are kept as suggestions.
fn merge_screen_notes(mut finding: Finding, notes: &[ScreenNote]) -> Finding {
    for n in notes {
        let mentioned = finding
            .issues
            .iter()
            .chain(finding.suggestions.iter())
            .any(|s| s.contains(&n.note));
        if !mentioned {
            finding
                .suggestions
                .push(format!("Automated check ({}): {}", n.rule, n.note));
        }
    }
    finding
}

// ── Prompt construction ─────────────────────────────────────────────

const STRICT_RETRY_INSTRUCTION: &str = "Your previous reply could not be parsed. \
Respond with ONLY a single JSON object and nothing else, no markdown, no prose: \
{\"compliant\": true|false, \"issues\": [\"...\"], \"suggestions\": [\"...\"]}";

fn build_evaluation_system_prompt() -> String {
    "You are a 10DLC compliance reviewer for US carrier A2P messaging campaigns. \
     Judge whether one piece of campaign content complies with the carrier guidelines provided.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"compliant\": true, \"issues\": [\"...\"], \"suggestions\": [\"...\"]}\n\n\
     Rules:\n\
     - \"compliant\" is false if any guideline is violated\n\
     - Each issue cites the violated rule in one sentence\n\
     - Suggestions are concrete edits that would fix the issues\n\
     - Use empty arrays when there is nothing to report"
        .to_string()
}

fn build_evaluation_user_prompt(
    unit: &ContentUnit,
    guideline_text: &str,
    brand_name: &str,
    notes: &[ScreenNote],
    max_content_chars: usize,
) -> String {
    let mut prompt = String::with_capacity(guideline_text.len() + 1024);

    prompt.push_str("Guidelines:\n");
    prompt.push_str(guideline_text.trim());
    prompt.push_str("\n\n");

    prompt.push_str(&format!("Brand: {brand_name}\n"));
    prompt.push_str(&format!("Content type: {}\n", unit.kind));
    prompt.push_str(&format!(
        "{}: {}\n",
        unit.kind.classifier_label(),
        unit.classifier
    ));

    if !notes.is_empty() {
        prompt.push_str("Automated pre-check notes (verify, do not assume):\n");
        for n in notes {
            prompt.push_str(&format!("  - {}\n", n.note));
        }
    }

    let content_preview: String = unit.content.chars().take(max_content_chars).collect();
    prompt.push_str(&format!("\nContent:\n{content_preview}"));
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FindingResponse {
    compliant: bool,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    suggestions: Vec<String>,
}

fn parse_finding(raw: &str) -> Result<Finding, String> {
    let response: FindingResponse =
        serde_json::from_str(json_object_span(raw)).map_err(|e| format!("JSON parse error: {e}"))?;

    let clean = |v: Vec<String>| {
        v.into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
    };
    Ok(Finding {
        compliant: response.compliant,
        issues: clean(response.issues),
        suggestions: clean(response.suggestions),
    })
}

/// The outermost `{...}` span of a reply; covers fenced and prose-wrapped
/// objects alike.
fn json_object_span(text: &str) -> &str {
    let trimmed = text.trim();
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    }
}
