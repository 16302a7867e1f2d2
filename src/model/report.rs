//! Compliance reports.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::submission::{UnitKind, Verdict};

/// Score at or above which approval likelihood is `High`.
pub const HIGH_THRESHOLD: f64 = 0.85;
/// Score at or above which approval likelihood is `Medium`.
pub const MEDIUM_THRESHOLD: f64 = 0.5;

/// Coarse estimate of the chance of carrier approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalLikelihood {
    High,
    Medium,
    Low,
}

impl ApprovalLikelihood {
    pub fn from_score(score: f64) -> Self {
        if score >= HIGH_THRESHOLD {
            Self::High
        } else if score >= MEDIUM_THRESHOLD {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }
}

impl fmt::Display for ApprovalLikelihood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalLikelihood {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HIGH" => Ok(Self::High),
            "MEDIUM" => Ok(Self::Medium),
            "LOW" => Ok(Self::Low),
            other => Err(format!("unknown approval likelihood: {other}")),
        }
    }
}

/// Mean of binary compliance over determinate verdicts.
///
/// Returns `None` when no verdict is determinate.
pub fn overall_score(verdicts: &[Verdict]) -> Option<f64> {
    let mut compliant = 0usize;
    let mut determinate = 0usize;
    for v in verdicts {
        match v {
            Verdict::Compliant => {
                compliant += 1;
                determinate += 1;
            }
            Verdict::NonCompliant => determinate += 1,
            Verdict::Indeterminate => {}
        }
    }
    if determinate == 0 {
        None
    } else {
        Some(compliant as f64 / determinate as f64)
    }
}

/// Per-unit line of a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitFinding {
    pub unit_id: Uuid,
    pub kind: UnitKind,
    pub verdict: Verdict,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Submission-level compliance report. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub id: Uuid,
    pub submission_id: Uuid,
    pub verification_id: Uuid,
    pub overall_score: f64,
    pub approval_likelihood: ApprovalLikelihood,
    pub findings: Vec<UnitFinding>,
    pub created_at: DateTime<Utc>,
}

impl ComplianceReport {
    pub fn count(&self, verdict: Verdict) -> usize {
        self.findings.iter().filter(|f| f.verdict == verdict).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn likelihood_thresholds() {
        assert_eq!(ApprovalLikelihood::from_score(1.0), ApprovalLikelihood::High);
        assert_eq!(ApprovalLikelihood::from_score(0.85), ApprovalLikelihood::High);
        assert_eq!(ApprovalLikelihood::from_score(0.84), ApprovalLikelihood::Medium);
        assert_eq!(ApprovalLikelihood::from_score(0.5), ApprovalLikelihood::Medium);
        assert_eq!(ApprovalLikelihood::from_score(0.49), ApprovalLikelihood::Low);
        assert_eq!(ApprovalLikelihood::from_score(0.0), ApprovalLikelihood::Low);
    }

    #[test]
    fn score_excludes_indeterminate() {
        let score = overall_score(&[
            Verdict::Compliant,
            Verdict::Compliant,
            Verdict::NonCompliant,
            Verdict::Indeterminate,
        ])
        .unwrap();
        assert!((score - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(ApprovalLikelihood::from_score(score), ApprovalLikelihood::Medium);
    }

    #[test]
    fn score_undefined_when_all_indeterminate() {
        assert_eq!(overall_score(&[Verdict::Indeterminate, Verdict::Indeterminate]), None);
        assert_eq!(overall_score(&[]), None);
    }
}
