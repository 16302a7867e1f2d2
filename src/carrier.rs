//! Carrier-network submission tracking.
//!
//! The transport is opaque: submit returns the carrier's identifier, poll
//! reports its status. Records are kept per attempt; only the newest record
//! for a submission may move the submission to APPROVED or REJECTED.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CarrierError, DatabaseError};
use crate::model::{CarrierStatus, CarrierSubmission, Submission};
use crate::store::Database;

/// Carrier transport: pure I/O, no bookkeeping.
#[async_trait]
pub trait CarrierTransport: Send + Sync {
    /// Transport name (e.g. "tcr").
    fn name(&self) -> &str;

    /// Send a submission; returns the carrier-assigned identifier.
    async fn submit(&self, submission: &Submission) -> Result<String, CarrierError>;

    /// Current status of a previously submitted identifier.
    async fn poll(&self, carrier_submission_id: &str) -> Result<CarrierStatus, CarrierError>;
}

/// Counts from one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub polled: usize,
    pub resolved: usize,
    pub failed: usize,
}

pub struct CarrierTracker {
    db: Arc<dyn Database>,
    transport: Arc<dyn CarrierTransport>,
    call_timeout: Duration,
}

impl CarrierTracker {
    pub fn new(
        db: Arc<dyn Database>,
        transport: Arc<dyn CarrierTransport>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            db,
            transport,
            call_timeout,
        }
    }

    /// Submit to the carrier and record a PENDING attempt.
    pub async fn submit(&self, submission_id: Uuid) -> Result<CarrierSubmission, CarrierError> {
        let submission = self
            .db
            .get_submission(submission_id)
            .await?
            .ok_or(CarrierError::SubmissionNotFound(submission_id))?;

        let carrier_id = tokio::time::timeout(self.call_timeout, self.transport.submit(&submission))
            .await
            .map_err(|_| CarrierError::Timeout {
                transport: self.transport.name().to_string(),
                timeout: self.call_timeout,
            })??;

        let record = CarrierSubmission::new(submission_id, carrier_id);
        self.db.insert_carrier_submission(&record).await?;
        info!(
            submission_id = %submission_id,
            carrier_submission_id = %record.carrier_submission_id,
            transport = self.transport.name(),
            "Submitted to carrier"
        );
        Ok(record)
    }

    /// Poll every PENDING record once and apply terminal outcomes.
    ///
    /// A failed or timed-out poll leaves the record PENDING for the next cycle.
    pub async fn poll_pending(&self) -> Result<PollSummary, DatabaseError> {
        let pending = self
            .db
            .list_carrier_submissions_by_status(CarrierStatus::Pending)
            .await?;
        let mut summary = PollSummary::default();

        for record in pending {
            summary.polled += 1;
            let polled = tokio::time::timeout(
                self.call_timeout,
                self.transport.poll(&record.carrier_submission_id),
            )
            .await;

            let status = match polled {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    warn!(carrier_submission_id = %record.carrier_submission_id, error = %e, "Carrier poll failed");
                    summary.failed += 1;
                    continue;
                }
                Err(_) => {
                    warn!(
                        carrier_submission_id = %record.carrier_submission_id,
                        timeout_secs = self.call_timeout.as_secs(),
                        "Carrier poll timed out"
                    );
                    summary.failed += 1;
                    continue;
                }
            };

            if !status.is_terminal() {
                debug!(carrier_submission_id = %record.carrier_submission_id, "Still pending at carrier");
                continue;
            }

            self.db
                .update_carrier_submission_status(record.id, status, None)
                .await?;
            summary.resolved += 1;
            self.apply_outcome(&record, status).await?;
        }

        Ok(summary)
    }

    async fn apply_outcome(
        &self,
        record: &CarrierSubmission,
        status: CarrierStatus,
    ) -> Result<(), DatabaseError> {
        let Some(target) = status.submission_outcome() else {
            warn!(submission_id = %record.submission_id, status = %status, "Carrier reported an error; submission unchanged");
            return Ok(());
        };

        let latest = self
            .db
            .get_latest_carrier_submission(record.submission_id)
            .await?;
        if latest.map(|l| l.id) != Some(record.id) {
            debug!(submission_id = %record.submission_id, "Outcome is for a superseded carrier submission, ignoring");
            return Ok(());
        }

        let Some(submission) = self.db.get_submission(record.submission_id).await? else {
            return Ok(());
        };
        if !submission.status.can_transition_to(target) {
            warn!(
                submission_id = %submission.id,
                from = %submission.status,
                to = %target,
                "Carrier outcome does not apply to current submission status"
            );
            return Ok(());
        }

        self.db
            .update_submission_status(submission.id, target)
            .await?;
        info!(submission_id = %submission.id, status = %target, "Carrier decision applied");
        Ok(())
    }
}

/// Poll PENDING carrier submissions every `interval`.
pub fn spawn_carrier_poll_loop(tracker: Arc<CarrierTracker>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Carrier poll loop started (interval: {}s)", interval.as_secs());
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match tracker.poll_pending().await {
                Ok(summary) if summary.polled > 0 => {
                    info!(
                        polled = summary.polled,
                        resolved = summary.resolved,
                        failed = summary.failed,
                        "Carrier poll cycle complete"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Carrier poll cycle failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::model::SubmissionStatus;
    use crate::store::LibSqlBackend;

    struct MockTransport {
        counter: AtomicUsize,
        statuses: Mutex<HashMap<String, Result<CarrierStatus, ()>>>,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                counter: AtomicUsize::new(0),
                statuses: Mutex::new(HashMap::new()),
            }
        }

        fn set(&self, id: &str, status: Result<CarrierStatus, ()>) {
            self.statuses.lock().unwrap().insert(id.to_string(), status);
        }
    }

    #[async_trait]
    impl CarrierTransport for MockTransport {
        fn name(&self) -> &str {
            "mock"
        }

        async fn submit(&self, _submission: &Submission) -> Result<String, CarrierError> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("C-{n}"))
        }

        async fn poll(&self, id: &str) -> Result<CarrierStatus, CarrierError> {
            match self.statuses.lock().unwrap().get(id).cloned() {
                Some(Ok(status)) => Ok(status),
                Some(Err(())) => Err(CarrierError::Transport {
                    transport: "mock".into(),
                    reason: "unreachable".into(),
                }),
                None => Ok(CarrierStatus::Pending),
            }
        }
    }

    async fn setup() -> (Arc<dyn Database>, Arc<MockTransport>, CarrierTracker, Uuid) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let transport = Arc::new(MockTransport::new());
        let tracker = CarrierTracker::new(db.clone(), transport.clone(), Duration::from_secs(5));
        let sub = Submission::new("Acme", vec!["retail".into()]);
        db.insert_submission(&sub).await.unwrap();
        db.update_submission_status(sub.id, SubmissionStatus::UnderReview)
            .await
            .unwrap();
        (db, transport, tracker, sub.id)
    }

    #[tokio::test]
    async fn accepted_approves_submission() {
        let (db, transport, tracker, sub) = setup().await;
        let record = tracker.submit(sub).await.unwrap();
        assert_eq!(record.status, CarrierStatus::Pending);

        transport.set(&record.carrier_submission_id, Ok(CarrierStatus::Accepted));
        let summary = tracker.poll_pending().await.unwrap();
        assert_eq!(summary.resolved, 1);

        let stored = db.get_submission(sub).await.unwrap().unwrap();
        assert_eq!(stored.status, SubmissionStatus::Approved);
    }

    #[tokio::test]
    async fn error_leaves_submission_untouched() {
        let (db, transport, tracker, sub) = setup().await;
        let record = tracker.submit(sub).await.unwrap();
        transport.set(&record.carrier_submission_id, Ok(CarrierStatus::Error));
        tracker.poll_pending().await.unwrap();

        let stored = db.get_submission(sub).await.unwrap().unwrap();
        assert_eq!(stored.status, SubmissionStatus::UnderReview);
        let latest = db.get_latest_carrier_submission(sub).await.unwrap().unwrap();
        assert_eq!(latest.status, CarrierStatus::Error);
    }

    #[tokio::test]
    async fn superseded_outcome_ignored() {
        let (db, transport, tracker, sub) = setup().await;
        let first = tracker.submit(sub).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _second = tracker.submit(sub).await.unwrap();

        transport.set(&first.carrier_submission_id, Ok(CarrierStatus::Rejected));
        tracker.poll_pending().await.unwrap();

        let stored = db.get_submission(sub).await.unwrap().unwrap();
        assert_eq!(stored.status, SubmissionStatus::UnderReview);
    }

    #[tokio::test]
    async fn failed_poll_stays_pending() {
        let (db, transport, tracker, sub) = setup().await;
        let record = tracker.submit(sub).await.unwrap();
        transport.set(&record.carrier_submission_id, Err(()));

        let summary = tracker.poll_pending().await.unwrap();
        assert_eq!(summary.failed, 1);
        let latest = db.get_latest_carrier_submission(sub).await.unwrap().unwrap();
        assert_eq!(latest.status, CarrierStatus::Pending);
    }

    #[tokio::test]
    async fn unknown_submission_rejected() {
        let (_db, _transport, tracker, _sub) = setup().await;
        let err = tracker.submit(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, CarrierError::SubmissionNotFound(_)));
    }
}
