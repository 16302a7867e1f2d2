//! Exposed operations: intake, starting runs, status and report lookups.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::carrier::CarrierTracker;
use crate::error::{CarrierError, DatabaseError, PipelineError};
use crate::model::{
    CarrierSubmission, ComplianceReport, ContentUnit, ErrorCode, Submission, UnitKind,
    Verification, VerificationSnapshot, VerificationStatus, VerificationStep,
};
use crate::pipeline::{RunOutcome, VerificationMachine};
use crate::store::Database;

/// Answer to a report lookup.
#[derive(Debug, Clone)]
pub enum ReportLookup {
    Available(ComplianceReport),
    NotYetAvailable,
}

pub struct VerificationService {
    db: Arc<dyn Database>,
    machine: Arc<VerificationMachine>,
    carrier: Option<Arc<CarrierTracker>>,
}

impl VerificationService {
    pub fn new(db: Arc<dyn Database>, machine: Arc<VerificationMachine>) -> Self {
        Self {
            db,
            machine,
            carrier: None,
        }
    }

    pub fn with_carrier(mut self, tracker: Arc<CarrierTracker>) -> Self {
        self.carrier = Some(tracker);
        self
    }

    // ── Intake ──────────────────────────────────────────────────────

    pub async fn create_submission(
        &self,
        brand_name: &str,
        business_types: Vec<String>,
    ) -> Result<Submission, PipelineError> {
        let brand_name = brand_name.trim();
        if brand_name.is_empty() {
            return Err(PipelineError::InvalidInput(
                "brand name must not be empty".to_string(),
            ));
        }
        let submission = Submission::new(brand_name, business_types);
        self.db.insert_submission(&submission).await?;
        info!(submission_id = %submission.id, brand = %submission.brand_name, "Submission created");
        Ok(submission)
    }

    pub async fn add_content_unit(
        &self,
        submission_id: Uuid,
        kind: UnitKind,
        classifier: &str,
        content: &str,
    ) -> Result<ContentUnit, PipelineError> {
        if content.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "content must not be empty".to_string(),
            ));
        }
        self.require_submission(submission_id).await?;
        let unit = ContentUnit::new(submission_id, kind, classifier, content);
        self.db.insert_content_unit(&unit).await?;
        debug!(submission_id = %submission_id, unit_id = %unit.id, kind = %kind, "Content unit added");
        Ok(unit)
    }

    pub async fn get_submission(&self, id: Uuid) -> Result<Option<Submission>, PipelineError> {
        Ok(self.db.get_submission(id).await?)
    }

    pub async fn list_content_units(
        &self,
        submission_id: Uuid,
    ) -> Result<Vec<ContentUnit>, PipelineError> {
        Ok(self.db.list_content_units(submission_id).await?)
    }

    /// Delete a submission with its units, runs and reports. An in-flight
    /// run notices at its next write and aborts.
    pub async fn delete_submission(&self, id: Uuid) -> Result<bool, PipelineError> {
        let deleted = self.db.delete_submission(id).await?;
        if deleted {
            info!(submission_id = %id, "Submission deleted");
        }
        Ok(deleted)
    }

    // ── Verification ────────────────────────────────────────────────

    /// Start (or join) the submission's active run and drive it in the
    /// background. Returns the run as created or found.
    pub async fn start_verification(
        &self,
        submission_id: Uuid,
    ) -> Result<VerificationSnapshot, PipelineError> {
        let run = self.claim_run(submission_id).await?;
        let machine = self.machine.clone();
        let run_id = run.id;
        tokio::spawn(async move {
            if let Err(e) = machine.run(run_id).await {
                warn!(verification_id = %run_id, error = %e, "Background run errored");
            }
        });
        Ok(run.snapshot())
    }

    /// Like [`start_verification`](Self::start_verification) but waits for the
    /// run to finish.
    pub async fn verify_now(&self, submission_id: Uuid) -> Result<RunOutcome, PipelineError> {
        let run = self.claim_run(submission_id).await?;
        Ok(self.machine.run(run.id).await?)
    }

    /// Status of the most recent run, or `None` if the submission never ran.
    pub async fn get_verification_status(
        &self,
        submission_id: Uuid,
    ) -> Result<Option<VerificationSnapshot>, PipelineError> {
        Ok(self
            .db
            .get_latest_verification(submission_id)
            .await?
            .map(|v| v.snapshot()))
    }

    /// Newest report whose run reached COMPLETED. A report stored by a run
    /// that was then stalled is kept in the table but never served.
    pub async fn get_report(&self, submission_id: Uuid) -> Result<ReportLookup, PipelineError> {
        for report in self.db.list_reports(submission_id).await? {
            let completed = self
                .db
                .get_verification(report.verification_id)
                .await?
                .is_some_and(|run| run.status == VerificationStatus::Completed);
            if completed {
                return Ok(ReportLookup::Available(report));
            }
            debug!(report_id = %report.id, verification_id = %report.verification_id, "Skipping report of unfinished run");
        }
        Ok(ReportLookup::NotYetAvailable)
    }

    /// All runs for the submission, newest first.
    pub async fn history(&self, submission_id: Uuid) -> Result<Vec<Verification>, PipelineError> {
        Ok(self
            .db
            .list_verifications_for_submission(submission_id)
            .await?)
    }

    pub async fn failures_by_code(
        &self,
        code: ErrorCode,
    ) -> Result<Vec<VerificationSnapshot>, PipelineError> {
        Ok(self
            .db
            .list_verifications_by_status_and_error(VerificationStatus::Failed, code)
            .await?
            .iter()
            .map(Verification::snapshot)
            .collect())
    }

    /// RUNNING runs expected to finish before `cutoff`.
    pub async fn runs_due_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<VerificationSnapshot>, PipelineError> {
        Ok(self
            .db
            .list_verifications_due_before(cutoff)
            .await?
            .iter()
            .map(Verification::snapshot)
            .collect())
    }

    pub async fn runs_in_step(
        &self,
        step: VerificationStep,
    ) -> Result<Vec<VerificationSnapshot>, PipelineError> {
        Ok(self
            .db
            .list_verifications_by_step(step)
            .await?
            .iter()
            .map(Verification::snapshot)
            .collect())
    }

    // ── Carrier ─────────────────────────────────────────────────────

    pub async fn submit_to_carrier(
        &self,
        submission_id: Uuid,
    ) -> Result<CarrierSubmission, CarrierError> {
        let Some(tracker) = &self.carrier else {
            return Err(CarrierError::Transport {
                transport: "none".to_string(),
                reason: "no carrier transport configured".to_string(),
            });
        };
        tracker.submit(submission_id).await
    }

    async fn require_submission(&self, id: Uuid) -> Result<Submission, PipelineError> {
        self.db
            .get_submission(id)
            .await?
            .ok_or(PipelineError::SubmissionNotFound(id))
    }

    /// The active run, or a fresh PENDING one. Losing the insert race to a
    /// concurrent caller yields that caller's run.
    async fn claim_run(&self, submission_id: Uuid) -> Result<Verification, PipelineError> {
        self.require_submission(submission_id).await?;

        if let Some(active) = self.db.get_active_verification(submission_id).await? {
            debug!(verification_id = %active.id, status = %active.status, "Joining active run");
            return Ok(active);
        }

        let run = Verification::new(submission_id);
        match self.db.insert_verification(&run).await {
            Ok(()) => {
                info!(verification_id = %run.id, submission_id = %submission_id, "Verification created");
                Ok(run)
            }
            Err(DatabaseError::Constraint(_)) => self
                .db
                .get_active_verification(submission_id)
                .await?
                .ok_or_else(|| {
                    PipelineError::InvalidInput(format!(
                        "submission {submission_id} run finished while starting; retry"
                    ))
                }),
            Err(e) => Err(e.into()),
        }
    }
}
