//! Verification run state machine.
//!
//! `Pending → Running → {Completed | Failed}`. The record carries a monotonic
//! `version` used for compare-and-swap writes; the struct itself never bumps
//! it, the store does on a successful swap.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;

/// Lifecycle status of a verification run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl VerificationStatus {
    pub fn can_transition_to(&self, target: VerificationStatus) -> bool {
        use VerificationStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Running, Completed) | (Running, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown verification status: {other}")),
        }
    }
}

/// Pipeline stage executed while a run is `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStep {
    RetrieveGuidelines,
    EvaluateContent,
    AssembleReport,
}

impl VerificationStep {
    /// All steps in execution order.
    pub const ALL: [VerificationStep; 3] = [
        Self::RetrieveGuidelines,
        Self::EvaluateContent,
        Self::AssembleReport,
    ];

    /// Number of steps still to run, counting this one.
    pub fn remaining_including(&self) -> usize {
        let idx = Self::ALL.iter().position(|s| s == self).unwrap_or(0);
        Self::ALL.len() - idx
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetrieveGuidelines => "RETRIEVE_GUIDELINES",
            Self::EvaluateContent => "EVALUATE_CONTENT",
            Self::AssembleReport => "ASSEMBLE_REPORT",
        }
    }
}

impl fmt::Display for VerificationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerificationStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RETRIEVE_GUIDELINES" => Ok(Self::RetrieveGuidelines),
            "EVALUATE_CONTENT" => Ok(Self::EvaluateContent),
            "ASSEMBLE_REPORT" => Ok(Self::AssembleReport),
            other => Err(format!("unknown verification step: {other}")),
        }
    }
}

/// Run-scoped terminal failure code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RetrievalFailed,
    EvaluationFailed,
    ReportFailed,
    Timeout,
    Stalled,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetrievalFailed => "RETRIEVAL_FAILED",
            Self::EvaluationFailed => "EVALUATION_FAILED",
            Self::ReportFailed => "REPORT_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Stalled => "STALLED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RETRIEVAL_FAILED" => Ok(Self::RetrievalFailed),
            "EVALUATION_FAILED" => Ok(Self::EvaluationFailed),
            "REPORT_FAILED" => Ok(Self::ReportFailed),
            "TIMEOUT" => Ok(Self::Timeout),
            "STALLED" => Ok(Self::Stalled),
            other => Err(format!("unknown error code: {other}")),
        }
    }
}

/// One verification run for a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub id: Uuid,
    pub submission_id: Uuid,
    pub status: VerificationStatus,
    pub current_step: Option<VerificationStep>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_completion_at: Option<DateTime<Utc>>,
    /// Set iff `status == Failed`.
    pub error_code: Option<ErrorCode>,
    pub error_detail: Option<String>,
    /// Observed durations of finished steps, in milliseconds.
    pub step_durations_ms: Vec<u64>,
    /// Optimistic concurrency token, bumped by the store on every swap.
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl Verification {
    /// Create a new `Pending` run.
    pub fn new(submission_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            submission_id,
            status: VerificationStatus::Pending,
            current_step: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            estimated_completion_at: None,
            error_code: None,
            error_detail: None,
            step_durations_ms: Vec::new(),
            version: 0,
            updated_at: now,
        }
    }

    fn transition_to(
        &mut self,
        target: VerificationStatus,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        if !self.status.can_transition_to(target) {
            return Err(PipelineError::InvalidTransition {
                id: self.id,
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        self.status = target;
        self.updated_at = now;
        Ok(())
    }

    /// `Pending → Running`, stamping `started_at` once.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), PipelineError> {
        self.transition_to(VerificationStatus::Running, now)?;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        Ok(())
    }

    /// Enter `step` and push the completion estimate forward.
    pub fn enter_step(&mut self, step: VerificationStep, estimate: DateTime<Utc>, now: DateTime<Utc>) {
        self.current_step = Some(step);
        self.advance_estimate(estimate);
        self.updated_at = now;
    }

    /// Record an estimate; the stored value never moves backwards.
    pub fn advance_estimate(&mut self, candidate: DateTime<Utc>) {
        self.estimated_completion_at = Some(match self.estimated_completion_at {
            Some(existing) if existing > candidate => existing,
            _ => candidate,
        });
    }

    pub fn record_step_duration(&mut self, elapsed: Duration) {
        self.step_durations_ms.push(elapsed.as_millis() as u64);
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), PipelineError> {
        self.transition_to(VerificationStatus::Completed, now)?;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn fail(
        &mut self,
        code: ErrorCode,
        detail: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        self.transition_to(VerificationStatus::Failed, now)?;
        self.error_code = Some(code);
        self.error_detail = Some(detail.into());
        self.completed_at = Some(now);
        Ok(())
    }

    /// `error_code` is present iff the run failed.
    pub fn is_consistent(&self) -> bool {
        self.error_code.is_some() == (self.status == VerificationStatus::Failed)
    }

    /// How long the run has been (or was) running.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.started_at.map(|start| {
            let end = self.completed_at.unwrap_or(now);
            end.signed_duration_since(start)
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }

    pub fn snapshot(&self) -> VerificationSnapshot {
        VerificationSnapshot {
            verification_id: self.id,
            submission_id: self.submission_id,
            status: self.status,
            current_step: self.current_step,
            started_at: self.started_at,
            estimated_completion_at: self.estimated_completion_at,
            completed_at: self.completed_at,
            error_code: self.error_code,
        }
    }
}

/// Read-only view returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationSnapshot {
    pub verification_id: Uuid,
    pub submission_id: Uuid,
    pub status: VerificationStatus,
    pub current_step: Option<VerificationStep>,
    pub started_at: Option<DateTime<Utc>>,
    pub estimated_completion_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_code: Option<ErrorCode>,
}
