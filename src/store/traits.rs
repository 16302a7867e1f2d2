//! `Database` trait: the single async interface for all persistence.
//!
//! Every finder is an explicit method with its own SQL. Callers never build
//! queries dynamically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    CarrierStatus, CarrierSubmission, ComplianceReport, ContentUnit, ErrorCode, Submission,
    SubmissionStatus, UnitOutcome, Verification, VerificationStatus, VerificationStep,
};

/// Result of a version-checked write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// Row matched the expected version and was updated.
    Applied,
    /// Row exists but someone else wrote it first.
    Conflict,
    /// Row no longer exists (submission deleted).
    Missing,
}

/// A persisted guideline document with its embedding.
#[derive(Debug, Clone)]
pub struct StoredGuideline {
    pub id: String,
    pub text: String,
    pub metadata: serde_json::Value,
    pub embedding: Vec<f32>,
    pub updated_at: DateTime<Utc>,
}

/// Backend-agnostic database trait covering submissions, runs, reports,
/// carrier submissions and the guideline index.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Submissions ─────────────────────────────────────────────────

    async fn insert_submission(&self, submission: &Submission) -> Result<(), DatabaseError>;

    async fn get_submission(&self, id: Uuid) -> Result<Option<Submission>, DatabaseError>;

    /// Returns `false` if the submission does not exist.
    async fn update_submission_status(
        &self,
        id: Uuid,
        status: SubmissionStatus,
    ) -> Result<bool, DatabaseError>;

    /// Delete a submission and everything it owns in one transaction.
    async fn delete_submission(&self, id: Uuid) -> Result<bool, DatabaseError>;

    async fn list_submissions_by_status(
        &self,
        status: SubmissionStatus,
    ) -> Result<Vec<Submission>, DatabaseError>;

    // ── Content units ───────────────────────────────────────────────

    async fn insert_content_unit(&self, unit: &ContentUnit) -> Result<(), DatabaseError>;

    /// Units of a submission in creation order.
    async fn list_content_units(
        &self,
        submission_id: Uuid,
    ) -> Result<Vec<ContentUnit>, DatabaseError>;

    async fn count_content_units(&self, submission_id: Uuid) -> Result<usize, DatabaseError>;

    /// Record a unit's evaluation for run `verification_id`.
    ///
    /// Write-once per run: returns `false` (and changes nothing) if this run
    /// already recorded an outcome for the unit, or the unit is gone.
    async fn record_unit_outcome(
        &self,
        unit_id: Uuid,
        verification_id: Uuid,
        outcome: &UnitOutcome,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // ── Verifications ───────────────────────────────────────────────

    /// Insert a new run. Fails with `Constraint` if the submission already has
    /// a PENDING or RUNNING run.
    async fn insert_verification(&self, verification: &Verification)
    -> Result<(), DatabaseError>;

    async fn get_verification(&self, id: Uuid) -> Result<Option<Verification>, DatabaseError>;

    /// Most recently created run for a submission, whatever its status.
    async fn get_latest_verification(
        &self,
        submission_id: Uuid,
    ) -> Result<Option<Verification>, DatabaseError>;

    /// The PENDING or RUNNING run for a submission, if any.
    async fn get_active_verification(
        &self,
        submission_id: Uuid,
    ) -> Result<Option<Verification>, DatabaseError>;

    /// All runs for a submission, newest first.
    async fn list_verifications_for_submission(
        &self,
        submission_id: Uuid,
    ) -> Result<Vec<Verification>, DatabaseError>;

    async fn list_verifications_by_status(
        &self,
        status: VerificationStatus,
    ) -> Result<Vec<Verification>, DatabaseError>;

    /// Runs with `status` whose `started_at` is strictly before `cutoff`.
    async fn list_verifications_started_before(
        &self,
        status: VerificationStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Verification>, DatabaseError>;

    async fn list_verifications_by_step(
        &self,
        step: VerificationStep,
    ) -> Result<Vec<Verification>, DatabaseError>;

    /// RUNNING runs whose estimated completion is before `cutoff`.
    async fn list_verifications_due_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Verification>, DatabaseError>;

    async fn list_verifications_by_status_and_error(
        &self,
        status: VerificationStatus,
        code: ErrorCode,
    ) -> Result<Vec<Verification>, DatabaseError>;

    /// Write `verification` if the stored row still has `verification.version`.
    /// On `Applied` the stored version is `verification.version + 1`.
    async fn compare_and_swap_verification(
        &self,
        verification: &Verification,
    ) -> Result<CasOutcome, DatabaseError>;

    // ── Reports ─────────────────────────────────────────────────────

    async fn insert_report(&self, report: &ComplianceReport) -> Result<(), DatabaseError>;

    async fn get_latest_report(
        &self,
        submission_id: Uuid,
    ) -> Result<Option<ComplianceReport>, DatabaseError>;

    /// All reports for a submission, newest first.
    async fn list_reports(
        &self,
        submission_id: Uuid,
    ) -> Result<Vec<ComplianceReport>, DatabaseError>;

    // ── Carrier submissions ─────────────────────────────────────────

    async fn insert_carrier_submission(
        &self,
        record: &CarrierSubmission,
    ) -> Result<(), DatabaseError>;

    async fn update_carrier_submission_status(
        &self,
        id: Uuid,
        status: CarrierStatus,
        detail: Option<&str>,
    ) -> Result<(), DatabaseError>;

    async fn get_latest_carrier_submission(
        &self,
        submission_id: Uuid,
    ) -> Result<Option<CarrierSubmission>, DatabaseError>;

    async fn list_carrier_submissions_by_status(
        &self,
        status: CarrierStatus,
    ) -> Result<Vec<CarrierSubmission>, DatabaseError>;

    // ── Guidelines ──────────────────────────────────────────────────

    async fn upsert_guideline(&self, guideline: &StoredGuideline) -> Result<(), DatabaseError>;

    async fn list_guidelines(&self) -> Result<Vec<StoredGuideline>, DatabaseError>;
}
