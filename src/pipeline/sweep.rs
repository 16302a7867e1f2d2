//! Background loops: the stall sweep and the PENDING-run pickup.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SweepConfig;
use crate::error::DatabaseError;
use crate::model::{ErrorCode, VerificationStatus};
use crate::pipeline::machine::VerificationMachine;
use crate::store::{CasOutcome, Database};

/// Counts from one sweep cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// RUNNING runs older than the floor.
    pub examined: usize,
    /// Runs moved to FAILED/STALLED.
    pub stalled: usize,
    /// Candidates left alone (under their threshold, or changed underneath).
    pub skipped: usize,
}

/// Reclassifies runs stuck in RUNNING as FAILED with `STALLED`.
pub struct StallSweeper {
    db: Arc<dyn Database>,
    config: SweepConfig,
}

impl StallSweeper {
    pub fn new(db: Arc<dyn Database>, config: SweepConfig) -> Self {
        Self { db, config }
    }

    /// One pass over RUNNING runs as of `now`.
    ///
    /// The threshold scales with the run's unit count. Each candidate is
    /// re-read right before the write and the write itself is version-checked,
    /// so a run that completes concurrently is never overwritten.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, DatabaseError> {
        let floor = chrono::Duration::from_std(self.config.stall_floor)
            .unwrap_or(chrono::Duration::zero());
        let candidates = self
            .db
            .list_verifications_started_before(VerificationStatus::Running, now - floor)
            .await?;

        let mut report = SweepReport {
            examined: candidates.len(),
            ..SweepReport::default()
        };

        for candidate in candidates {
            let unit_count = match self.db.count_content_units(candidate.submission_id).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(verification_id = %candidate.id, error = %e, "Unit count failed, using floor");
                    0
                }
            };
            let threshold = self.config.stall_threshold(unit_count);
            let running_for = candidate.elapsed(now).unwrap_or(Duration::ZERO);
            if running_for < threshold {
                report.skipped += 1;
                continue;
            }

            // Re-check immediately before writing.
            let Some(mut current) = self.db.get_verification(candidate.id).await? else {
                report.skipped += 1;
                continue;
            };
            if current.status != VerificationStatus::Running {
                debug!(verification_id = %current.id, status = %current.status, "Run left RUNNING before sweep write");
                report.skipped += 1;
                continue;
            }

            let detail = format!(
                "no progress after {}s (threshold {}s, {} units, last step {})",
                running_for.as_secs(),
                threshold.as_secs(),
                unit_count,
                current
                    .current_step
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "none".to_string())
            );
            if current.fail(ErrorCode::Stalled, detail, now).is_err() {
                report.skipped += 1;
                continue;
            }

            match self.db.compare_and_swap_verification(&current).await? {
                CasOutcome::Applied => {
                    warn!(
                        verification_id = %current.id,
                        submission_id = %current.submission_id,
                        running_secs = running_for.as_secs(),
                        "Verification marked STALLED"
                    );
                    report.stalled += 1;
                }
                CasOutcome::Conflict | CasOutcome::Missing => {
                    debug!(verification_id = %current.id, "Run changed during sweep write, skipped");
                    report.skipped += 1;
                }
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                stalled = report.stalled,
                skipped = report.skipped,
                "Stall sweep complete"
            );
        }
        Ok(report)
    }
}

/// Run the stall sweep every `interval`.
pub fn spawn_stall_sweep(sweeper: Arc<StallSweeper>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Stall sweep started (interval: {}s)", interval.as_secs());
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = sweeper.sweep_once(Utc::now()).await {
                warn!(error = %e, "Stall sweep failed");
            }
        }
    })
}

/// Start any PENDING runs every `interval`. Races with direct starts are
/// harmless: only one caller wins the PENDING → RUNNING swap.
pub fn spawn_pending_pickup(
    db: Arc<dyn Database>,
    machine: Arc<VerificationMachine>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Pending pickup loop started (interval: {}s)", interval.as_secs());
        let mut tick = tokio::time::interval(interval);

        // First tick fires immediately
        loop {
            tick.tick().await;
            let pending = match db.list_verifications_by_status(VerificationStatus::Pending).await {
                Ok(runs) => runs,
                Err(e) => {
                    warn!(error = %e, "Failed to list pending verifications");
                    continue;
                }
            };
            if !pending.is_empty() {
                info!(count = pending.len(), "Picking up pending verifications");
            }
            for run in pending {
                let machine = machine.clone();
                tokio::spawn(async move {
                    if let Err(e) = machine.run(run.id).await {
                        warn!(verification_id = %run.id, error = %e, "Picked-up run errored");
                    }
                });
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentUnit, Submission, UnitKind, Verification, VerificationStep};
    use crate::store::LibSqlBackend;

    fn config() -> SweepConfig {
        SweepConfig {
            stall_floor: Duration::from_secs(600),
            per_unit_allowance: Duration::from_secs(30),
            ..SweepConfig::default()
        }
    }

    async fn running_run(
        db: &Arc<dyn Database>,
        started_ago: chrono::Duration,
        units: usize,
    ) -> Verification {
        let sub = Submission::new("Acme", vec![]);
        db.insert_submission(&sub).await.unwrap();
        for _ in 0..units {
            db.insert_content_unit(&ContentUnit::new(sub.id, UnitKind::Image, "logo", "alt text"))
                .await
                .unwrap();
        }
        let mut v = Verification::new(sub.id);
        v.start(Utc::now() - started_ago).unwrap();
        v.enter_step(VerificationStep::EvaluateContent, Utc::now(), Utc::now());
        db.insert_verification(&v).await.unwrap();
        v
    }

    #[tokio::test]
    async fn stalls_run_far_past_threshold() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let threshold = config().stall_threshold(1);
        let v = running_run(
            &db,
            chrono::Duration::from_std(threshold * 10).unwrap(),
            1,
        )
        .await;

        let report = StallSweeper::new(db.clone(), config())
            .sweep_once(Utc::now())
            .await
            .unwrap();
        assert_eq!(report.stalled, 1);

        let stored = db.get_verification(v.id).await.unwrap().unwrap();
        assert_eq!(stored.status, VerificationStatus::Failed);
        assert_eq!(stored.error_code, Some(ErrorCode::Stalled));
        assert!(stored.is_consistent());
    }

    #[tokio::test]
    async fn threshold_scales_with_unit_count() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        // 40 units × 30s = 20 min threshold; 15 min old is past the floor but not stalled.
        running_run(&db, chrono::Duration::minutes(15), 40).await;

        let report = StallSweeper::new(db, config())
            .sweep_once(Utc::now())
            .await
            .unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.stalled, 0);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn never_overwrites_completed_run() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mut v = running_run(&db, chrono::Duration::hours(5), 1).await;

        // The pipeline finishes just before the sweep writes.
        v.complete(Utc::now()).unwrap();
        assert_eq!(
            db.compare_and_swap_verification(&v).await.unwrap(),
            CasOutcome::Applied
        );

        let report = StallSweeper::new(db.clone(), config())
            .sweep_once(Utc::now())
            .await
            .unwrap();
        assert_eq!(report.stalled, 0);
        let stored = db.get_verification(v.id).await.unwrap().unwrap();
        assert_eq!(stored.status, VerificationStatus::Completed);
        assert!(stored.error_code.is_none());
    }

    #[tokio::test]
    async fn stale_snapshot_write_conflicts() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let v = running_run(&db, chrono::Duration::hours(5), 1).await;

        // Sweep's view of the run, then the pipeline completes it.
        let mut sweep_view = db.get_verification(v.id).await.unwrap().unwrap();
        let mut pipeline_view = sweep_view.clone();
        pipeline_view.complete(Utc::now()).unwrap();
        db.compare_and_swap_verification(&pipeline_view).await.unwrap();

        sweep_view.fail(ErrorCode::Stalled, "late", Utc::now()).unwrap();
        assert_eq!(
            db.compare_and_swap_verification(&sweep_view).await.unwrap(),
            CasOutcome::Conflict
        );
    }
}
