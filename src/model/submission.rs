//! Submissions and their content units.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Review status of a brand/campaign submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Draft,
    Submitted,
    UnderReview,
    Approved,
    Rejected,
}

impl SubmissionStatus {
    pub fn can_transition_to(&self, target: SubmissionStatus) -> bool {
        use SubmissionStatus::*;

        matches!(
            (self, target),
            (Draft, Submitted)
                | (Draft, UnderReview)
                | (Submitted, UnderReview)
                | (Submitted, Approved)
                | (Submitted, Rejected)
                | (UnderReview, Approved)
                | (UnderReview, Rejected)
                // Resubmission after a carrier rejection
                | (Rejected, Submitted)
                | (Rejected, UnderReview)
                | (Rejected, Approved)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Submitted => "SUBMITTED",
            Self::UnderReview => "UNDER_REVIEW",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(Self::Draft),
            "SUBMITTED" => Ok(Self::Submitted),
            "UNDER_REVIEW" => Ok(Self::UnderReview),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            other => Err(format!("unknown submission status: {other}")),
        }
    }
}

/// A brand/campaign under review. Aggregate root for everything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub brand_name: String,
    /// Business types (brand vertical, campaign use cases) that select guidance.
    pub business_types: Vec<String>,
    pub status: SubmissionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Submission {
    pub fn new(brand_name: impl Into<String>, business_types: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            brand_name: brand_name.into(),
            business_types,
            status: SubmissionStatus::Draft,
            created_at: now,
            updated_at: now,
        }
    }

    /// Business types, trimmed, lowercased and de-duplicated in first-seen order.
    pub fn distinct_business_types(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for raw in &self.business_types {
            let normalized = raw.trim().to_lowercase();
            if !normalized.is_empty() && !seen.contains(&normalized) {
                seen.push(normalized);
            }
        }
        seen
    }
}

/// Kind of content unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Message,
    Document,
    Image,
}

impl UnitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Document => "document",
            Self::Image => "image",
        }
    }

    /// Name of the classifier attribute for this kind.
    pub fn classifier_label(&self) -> &'static str {
        match self {
            Self::Message => "opt_in_type",
            Self::Document => "document_type",
            Self::Image => "image_type",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "document" => Ok(Self::Document),
            "image" => Ok(Self::Image),
            other => Err(format!("unknown unit kind: {other}")),
        }
    }
}

/// Structured compliance judgement for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub compliant: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Outcome of evaluating a unit: a finding, or an error that leaves it indeterminate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitOutcome {
    Finding(Finding),
    Error { reason: String },
}

/// Tri-state compliance verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Compliant,
    NonCompliant,
    Indeterminate,
}

impl UnitOutcome {
    pub fn verdict(&self) -> Verdict {
        match self {
            Self::Finding(f) if f.compliant => Verdict::Compliant,
            Self::Finding(_) => Verdict::NonCompliant,
            Self::Error { .. } => Verdict::Indeterminate,
        }
    }
}

/// Evaluation recorded on a unit, tagged with the run that wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitEvaluation {
    pub verification_id: Uuid,
    pub outcome: UnitOutcome,
    pub evaluated_at: DateTime<Utc>,
}

/// A message, document, or image belonging to a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentUnit {
    pub id: Uuid,
    pub submission_id: Uuid,
    pub kind: UnitKind,
    /// `opt_in_type`, `document_type` or `image_type` depending on `kind`.
    pub classifier: String,
    /// Message body, extracted document text, or image metadata/caption.
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Latest evaluation; `None` until a run evaluates the unit.
    pub evaluation: Option<UnitEvaluation>,
}

impl ContentUnit {
    pub fn new(
        submission_id: Uuid,
        kind: UnitKind,
        classifier: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            submission_id,
            kind,
            classifier: classifier.into(),
            content: content.into(),
            created_at: Utc::now(),
            evaluation: None,
        }
    }

    /// `Some(true/false)` once a finding exists, `None` when unknown or indeterminate.
    pub fn compliant(&self) -> Option<bool> {
        match self.evaluation.as_ref().map(|e| &e.outcome) {
            Some(UnitOutcome::Finding(f)) => Some(f.compliant),
            _ => None,
        }
    }

    /// Verdict written by `verification_id`, if that run evaluated this unit.
    pub fn verdict_for(&self, verification_id: Uuid) -> Option<Verdict> {
        self.evaluation
            .as_ref()
            .filter(|e| e.verification_id == verification_id)
            .map(|e| e.outcome.verdict())
    }
}
