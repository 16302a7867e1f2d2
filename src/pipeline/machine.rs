//! Verification state machine.
//!
//! ```text
//! PENDING ──► RUNNING ──► COMPLETED
//!                │
//!                └──────► FAILED (error_code)
//! ```
//!
//! While RUNNING the run walks RETRIEVE_GUIDELINES → EVALUATE_CONTENT →
//! ASSEMBLE_REPORT. Every write to the run record is a compare-and-swap on
//! its `version`, so a concurrent writer (the stall sweep, a second starter)
//! makes this run stop instead of overwriting.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{DatabaseError, ReportError};
use crate::guidelines::GuidelineRetriever;
use crate::model::{
    ContentUnit, ErrorCode, Submission, SubmissionStatus, Verdict, Verification,
    VerificationStatus, VerificationStep,
};
use crate::pipeline::evaluator::{Evaluator, UnitResult};
use crate::pipeline::progress::ProgressEstimator;
use crate::pipeline::report::ReportAssembler;
use crate::store::{CasOutcome, Database};

/// How a call to [`VerificationMachine::run`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { report_id: Uuid },
    Failed(ErrorCode),
    /// The run was already COMPLETED or FAILED; nothing was done.
    AlreadyTerminal(VerificationStatus),
    /// Another caller moved the run to RUNNING first.
    AlreadyClaimed,
    /// Someone else wrote the record mid-run (usually the stall sweep).
    Preempted,
    /// The record disappeared (submission deleted).
    Aborted,
}

/// A step's unrecoverable failure.
struct StepFailure {
    code: ErrorCode,
    detail: String,
}

impl StepFailure {
    fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

/// Why the step loop stopped early.
enum Halt {
    Fail(StepFailure),
    Stop(RunOutcome),
    Db(DatabaseError),
}

impl From<DatabaseError> for Halt {
    fn from(e: DatabaseError) -> Self {
        Halt::Db(e)
    }
}

pub struct VerificationMachine {
    db: Arc<dyn Database>,
    retriever: Arc<GuidelineRetriever>,
    evaluator: Arc<Evaluator>,
    assembler: Arc<ReportAssembler>,
    estimator: ProgressEstimator,
    config: PipelineConfig,
}

impl VerificationMachine {
    pub fn new(
        db: Arc<dyn Database>,
        retriever: Arc<GuidelineRetriever>,
        evaluator: Arc<Evaluator>,
        assembler: Arc<ReportAssembler>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            db,
            retriever,
            evaluator,
            assembler,
            estimator: ProgressEstimator::new(config.default_step_estimate),
            config,
        }
    }

    /// Drive one run to a terminal state.
    ///
    /// No-op on COMPLETED/FAILED runs. A PENDING run moves to RUNNING exactly
    /// once even when several callers race here.
    pub async fn run(&self, verification_id: Uuid) -> Result<RunOutcome, DatabaseError> {
        let Some(mut v) = self.db.get_verification(verification_id).await? else {
            warn!(verification_id = %verification_id, "Verification not found, nothing to run");
            return Ok(RunOutcome::Aborted);
        };

        match v.status {
            VerificationStatus::Completed | VerificationStatus::Failed => {
                debug!(verification_id = %v.id, status = %v.status, "Run already terminal");
                return Ok(RunOutcome::AlreadyTerminal(v.status));
            }
            VerificationStatus::Running => return Ok(RunOutcome::AlreadyClaimed),
            VerificationStatus::Pending => {}
        }

        if v.start(Utc::now()).is_err() {
            return Ok(RunOutcome::AlreadyClaimed);
        }
        match self.db.compare_and_swap_verification(&v).await? {
            CasOutcome::Applied => v.version += 1,
            CasOutcome::Conflict => {
                debug!(verification_id = %v.id, "Lost the race to start this run");
                return Ok(RunOutcome::AlreadyClaimed);
            }
            CasOutcome::Missing => return Ok(RunOutcome::Aborted),
        }
        info!(
            verification_id = %v.id,
            submission_id = %v.submission_id,
            "Verification started"
        );

        match self.run_steps(&mut v).await {
            Ok(report_id) => Ok(RunOutcome::Completed { report_id }),
            Err(Halt::Stop(outcome)) => Ok(outcome),
            Err(Halt::Fail(failure)) => self.fail_run(&mut v, failure).await,
            Err(Halt::Db(e)) => {
                // Best effort; if this also fails the stall sweep will catch the run.
                error!(verification_id = %v.id, error = %e, "Database error mid-run");
                let code = match v.current_step {
                    Some(VerificationStep::RetrieveGuidelines) | None => ErrorCode::RetrievalFailed,
                    Some(VerificationStep::EvaluateContent) => ErrorCode::EvaluationFailed,
                    Some(VerificationStep::AssembleReport) => ErrorCode::ReportFailed,
                };
                self.fail_run(&mut v, StepFailure::new(code, e.to_string()))
                    .await
            }
        }
    }

    async fn run_steps(&self, v: &mut Verification) -> Result<Uuid, Halt> {
        let Some(submission) = self.db.get_submission(v.submission_id).await? else {
            info!(verification_id = %v.id, "Submission gone before first step, aborting");
            return Err(Halt::Stop(RunOutcome::Aborted));
        };
        self.mark_under_review(&submission).await;

        // ── Step 1: retrieve guidelines ─────────────────────────────
        self.enter_step(v, VerificationStep::RetrieveGuidelines).await?;
        let started = Instant::now();
        let guidance = self
            .within_step(ErrorCode::RetrievalFailed, self.retrieve(&submission))
            .await?;
        v.record_step_duration(started.elapsed());

        // ── Step 2: evaluate content ────────────────────────────────
        self.enter_step(v, VerificationStep::EvaluateContent).await?;
        let started = Instant::now();
        let units = self
            .db
            .list_content_units(submission.id)
            .await
            .map_err(|e| Halt::Fail(StepFailure::new(ErrorCode::EvaluationFailed, e.to_string())))?;
        let results = self
            .within_step(
                ErrorCode::EvaluationFailed,
                self.evaluate_all(v.id, &units, &guidance, &submission.brand_name),
            )
            .await?;
        v.record_step_duration(started.elapsed());

        let timed_out = results.iter().filter(|r| r.timed_out).count();
        if timed_out > 0 {
            return Err(Halt::Fail(StepFailure::new(
                ErrorCode::Timeout,
                format!("{timed_out} of {} unit evaluations timed out", results.len()),
            )));
        }

        // ── Step 3: assemble report ─────────────────────────────────
        self.enter_step(v, VerificationStep::AssembleReport).await?;
        let started = Instant::now();
        let run_id = v.id;
        let report = self
            .within_step(ErrorCode::ReportFailed, async {
                self.assembler
                    .assemble(submission.id, run_id)
                    .await
                    .map_err(|e| match e {
                        ReportError::NoDeterminateFindings { .. } => {
                            StepFailure::new(ErrorCode::EvaluationFailed, e.to_string())
                        }
                        ReportError::Database(_) => {
                            StepFailure::new(ErrorCode::ReportFailed, e.to_string())
                        }
                    })
            })
            .await?;
        v.record_step_duration(started.elapsed());

        let now = Utc::now();
        v.complete(now)
            .map_err(|e| Halt::Fail(StepFailure::new(ErrorCode::ReportFailed, e.to_string())))?;
        match self.db.compare_and_swap_verification(v).await? {
            CasOutcome::Applied => {
                v.version += 1;
                info!(
                    verification_id = %v.id,
                    report_id = %report.id,
                    likelihood = %report.approval_likelihood,
                    "Verification completed"
                );
                Ok(report.id)
            }
            CasOutcome::Conflict => {
                warn!(
                    verification_id = %v.id,
                    report_id = %report.id,
                    "Run was closed by another writer after its report was stored; keeping report"
                );
                Err(Halt::Stop(RunOutcome::Preempted))
            }
            CasOutcome::Missing => Err(Halt::Stop(RunOutcome::Aborted)),
        }
    }

    /// Update `current_step` and the estimate, then persist.
    async fn enter_step(&self, v: &mut Verification, step: VerificationStep) -> Result<(), Halt> {
        let now = Utc::now();
        let eta = self.estimator.estimate(step, &v.step_durations_ms, now);
        v.enter_step(step, eta, now);

        match self.db.compare_and_swap_verification(v).await? {
            CasOutcome::Applied => {
                v.version += 1;
                info!(
                    verification_id = %v.id,
                    step = %step,
                    eta = %v.estimated_completion_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                    "Entered step"
                );
                Ok(())
            }
            CasOutcome::Conflict => {
                let status = self
                    .db
                    .get_verification(v.id)
                    .await?
                    .map(|current| current.status.to_string())
                    .unwrap_or_default();
                warn!(verification_id = %v.id, step = %step, status = %status, "Run modified concurrently, stopping");
                Err(Halt::Stop(RunOutcome::Preempted))
            }
            CasOutcome::Missing => {
                info!(verification_id = %v.id, "Run record disappeared, aborting");
                Err(Halt::Stop(RunOutcome::Aborted))
            }
        }
    }

    /// Bound a step by `step_timeout`; expiry is `TIMEOUT`.
    async fn within_step<T>(
        &self,
        code: ErrorCode,
        step: impl Future<Output = Result<T, StepFailure>>,
    ) -> Result<T, Halt> {
        match tokio::time::timeout(self.config.step_timeout, step).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => Err(Halt::Fail(failure)),
            Err(_) => Err(Halt::Fail(StepFailure::new(
                ErrorCode::Timeout,
                format!("{code} step exceeded {:?}", self.config.step_timeout),
            ))),
        }
    }

    async fn retrieve(&self, submission: &Submission) -> Result<String, StepFailure> {
        let mut business_types = submission.distinct_business_types();
        if business_types.is_empty() {
            business_types.push("general".to_string());
        }

        let mut sections = Vec::with_capacity(business_types.len());
        for bt in &business_types {
            let text = tokio::time::timeout(
                self.config.call_timeout,
                self.retriever.retrieve_guidelines(bt),
            )
            .await
            .map_err(|_| {
                StepFailure::new(
                    ErrorCode::Timeout,
                    format!("guideline retrieval for '{bt}' timed out"),
                )
            })?
            .map_err(|e| StepFailure::new(ErrorCode::RetrievalFailed, e.to_string()))?;
            sections.push(text);
        }

        let combined = sections.join("\n\n");
        Ok(truncate_chars(&combined, self.config.max_guideline_chars))
    }

    /// Fan out over a bounded pool and wait for every unit.
    async fn evaluate_all(
        &self,
        verification_id: Uuid,
        units: &[ContentUnit],
        guidance: &str,
        brand_name: &str,
    ) -> Result<Vec<UnitResult>, StepFailure> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_evaluations.max(1)));

        let futures = units.iter().map(|unit| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|e| StepFailure::new(ErrorCode::EvaluationFailed, e.to_string()))?;
                Ok::<_, StepFailure>(
                    self.evaluator
                        .evaluate_unit(verification_id, unit, guidance, brand_name)
                        .await,
                )
            }
        });
        let results = join_all(futures)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        let scored = results
            .iter()
            .filter(|r| r.verdict() != Verdict::Indeterminate)
            .count();
        info!(
            verification_id = %verification_id,
            total = results.len(),
            scored,
            indeterminate = results.len() - scored,
            "Evaluation barrier reached"
        );
        Ok(results)
    }

    async fn fail_run(
        &self,
        v: &mut Verification,
        failure: StepFailure,
    ) -> Result<RunOutcome, DatabaseError> {
        if v.fail(failure.code, failure.detail.clone(), Utc::now()).is_err() {
            return Ok(RunOutcome::AlreadyTerminal(v.status));
        }
        match self.db.compare_and_swap_verification(v).await? {
            CasOutcome::Applied => {
                v.version += 1;
                error!(
                    verification_id = %v.id,
                    error_code = %failure.code,
                    detail = %failure.detail,
                    "Verification failed"
                );
                Ok(RunOutcome::Failed(failure.code))
            }
            CasOutcome::Conflict => Ok(RunOutcome::Preempted),
            CasOutcome::Missing => Ok(RunOutcome::Aborted),
        }
    }

    async fn mark_under_review(&self, submission: &Submission) {
        if !submission
            .status
            .can_transition_to(SubmissionStatus::UnderReview)
        {
            return;
        }
        if let Err(e) = self
            .db
            .update_submission_status(submission.id, SubmissionStatus::UnderReview)
            .await
        {
            warn!(submission_id = %submission.id, error = %e, "Failed to mark submission under review");
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
