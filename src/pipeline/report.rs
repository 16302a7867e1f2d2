//! Report assembly: per-unit outcomes of one run → one submission report.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::error::ReportError;
use crate::model::report::overall_score;
use crate::model::{ApprovalLikelihood, ComplianceReport, UnitFinding, UnitOutcome, Verdict};
use crate::store::Database;

pub struct ReportAssembler {
    db: Arc<dyn Database>,
}

impl ReportAssembler {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Build and store a report from the outcomes `verification_id` recorded.
    ///
    /// Units the run did not evaluate count as indeterminate. If nothing is
    /// determinate no report is written. Earlier reports are left untouched;
    /// the newest one supersedes them.
    pub async fn assemble(
        &self,
        submission_id: Uuid,
        verification_id: Uuid,
    ) -> Result<ComplianceReport, ReportError> {
        let units = self.db.list_content_units(submission_id).await?;

        let findings: Vec<UnitFinding> = units
            .iter()
            .map(|unit| {
                let eval = unit
                    .evaluation
                    .as_ref()
                    .filter(|e| e.verification_id == verification_id);
                match eval.map(|e| &e.outcome) {
                    Some(UnitOutcome::Finding(f)) => UnitFinding {
                        unit_id: unit.id,
                        kind: unit.kind,
                        verdict: if f.compliant {
                            Verdict::Compliant
                        } else {
                            Verdict::NonCompliant
                        },
                        issues: f.issues.clone(),
                        suggestions: f.suggestions.clone(),
                        error: None,
                    },
                    Some(UnitOutcome::Error { reason }) => UnitFinding {
                        unit_id: unit.id,
                        kind: unit.kind,
                        verdict: Verdict::Indeterminate,
                        issues: vec![],
                        suggestions: vec![],
                        error: Some(reason.clone()),
                    },
                    None => UnitFinding {
                        unit_id: unit.id,
                        kind: unit.kind,
                        verdict: Verdict::Indeterminate,
                        issues: vec![],
                        suggestions: vec![],
                        error: Some("not evaluated in this run".to_string()),
                    },
                }
            })
            .collect();

        let verdicts: Vec<Verdict> = findings.iter().map(|f| f.verdict).collect();
        let Some(score) = overall_score(&verdicts) else {
            return Err(ReportError::NoDeterminateFindings { submission_id });
        };

        let report = ComplianceReport {
            id: Uuid::new_v4(),
            submission_id,
            verification_id,
            overall_score: score,
            approval_likelihood: ApprovalLikelihood::from_score(score),
            findings,
            created_at: Utc::now(),
        };
        self.db.insert_report(&report).await?;

        info!(
            submission_id = %submission_id,
            verification_id = %verification_id,
            score = report.overall_score,
            likelihood = %report.approval_likelihood,
            "Compliance report assembled"
        );
        Ok(report)
    }
}
