//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    ApprovalLikelihood, CarrierStatus, CarrierSubmission, ComplianceReport, ContentUnit,
    ErrorCode, Submission, SubmissionStatus, UnitEvaluation, UnitKind, UnitOutcome, Verification,
    VerificationStatus, VerificationStep,
};
use crate::store::migrations;
use crate::store::traits::{CasOutcome, Database, StoredGuideline};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_verifications(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Verification>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op} row: {e}")))?
        {
            out.push(row_to_verification(&row)?);
        }
        Ok(out)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed precision keeps lexical order equal to
/// chronological order, which the age-cutoff finders rely on.
fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str, op: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("{op}: bad uuid {s}: {e}")))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str, op: &str) -> Result<T, DatabaseError> {
    s.parse()
        .map_err(|e: String| DatabaseError::Serialization(format!("{op}: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn is_unique_violation(e: &libsql::Error) -> bool {
    e.to_string().contains("UNIQUE constraint failed")
}

fn row_text(row: &libsql::Row, idx: i32, op: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("{op} col {idx}: {e}")))
}

// ── Row mappers ─────────────────────────────────────────────────────

const SUBMISSION_COLUMNS: &str = "id, brand_name, business_types, status, created_at, updated_at";

fn row_to_submission(row: &libsql::Row) -> Result<Submission, DatabaseError> {
    let op = "row_to_submission";
    let business_types: Vec<String> =
        serde_json::from_str(&row_text(row, 2, op)?).unwrap_or_default();
    Ok(Submission {
        id: parse_uuid(&row_text(row, 0, op)?, op)?,
        brand_name: row_text(row, 1, op)?,
        business_types,
        status: parse_enum(&row_text(row, 3, op)?, op)?,
        created_at: parse_datetime(&row_text(row, 4, op)?),
        updated_at: parse_datetime(&row_text(row, 5, op)?),
    })
}

const UNIT_COLUMNS: &str =
    "id, submission_id, kind, classifier, content, created_at, eval_run_id, eval_outcome, evaluated_at";

/// Column order matches UNIT_COLUMNS. The evaluation columns are NULL until
/// a run records an outcome.
fn row_to_content_unit(row: &libsql::Row) -> Result<ContentUnit, DatabaseError> {
    let op = "row_to_content_unit";
    let kind: UnitKind = parse_enum(&row_text(row, 2, op)?, op)?;
    let eval_run_id: Option<String> = row.get(6).ok();
    let eval_outcome: Option<String> = row.get(7).ok();
    let evaluated_at: Option<String> = row.get(8).ok();

    let evaluation = match (eval_run_id, eval_outcome) {
        (Some(run), Some(outcome)) => Some(UnitEvaluation {
            verification_id: parse_uuid(&run, op)?,
            outcome: serde_json::from_str::<UnitOutcome>(&outcome)
                .map_err(|e| DatabaseError::Serialization(format!("{op}: {e}")))?,
            evaluated_at: parse_optional_datetime(&evaluated_at).unwrap_or(DateTime::<Utc>::MIN_UTC),
        }),
        _ => None,
    };

    Ok(ContentUnit {
        id: parse_uuid(&row_text(row, 0, op)?, op)?,
        submission_id: parse_uuid(&row_text(row, 1, op)?, op)?,
        kind,
        classifier: row_text(row, 3, op)?,
        content: row_text(row, 4, op)?,
        created_at: parse_datetime(&row_text(row, 5, op)?),
        evaluation,
    })
}

const VERIFICATION_COLUMNS: &str = "id, submission_id, status, current_step, created_at, started_at, completed_at, estimated_completion_at, error_code, error_detail, step_durations, version, updated_at";

fn row_to_verification(row: &libsql::Row) -> Result<Verification, DatabaseError> {
    let op = "row_to_verification";
    let current_step: Option<String> = row.get(3).ok();
    let error_code: Option<String> = row.get(8).ok();
    let step_durations: Vec<u64> =
        serde_json::from_str(&row_text(row, 10, op)?).unwrap_or_default();

    Ok(Verification {
        id: parse_uuid(&row_text(row, 0, op)?, op)?,
        submission_id: parse_uuid(&row_text(row, 1, op)?, op)?,
        status: parse_enum(&row_text(row, 2, op)?, op)?,
        current_step: current_step
            .map(|s| parse_enum::<VerificationStep>(&s, op))
            .transpose()?,
        created_at: parse_datetime(&row_text(row, 4, op)?),
        started_at: parse_optional_datetime(&row.get(5).ok()),
        completed_at: parse_optional_datetime(&row.get(6).ok()),
        estimated_completion_at: parse_optional_datetime(&row.get(7).ok()),
        error_code: error_code
            .map(|s| parse_enum::<ErrorCode>(&s, op))
            .transpose()?,
        error_detail: row.get(9).ok(),
        step_durations_ms: step_durations,
        version: row
            .get::<i64>(11)
            .map_err(|e| DatabaseError::Query(format!("{op} version: {e}")))?,
        updated_at: parse_datetime(&row_text(row, 12, op)?),
    })
}

const REPORT_COLUMNS: &str =
    "id, submission_id, verification_id, overall_score, approval_likelihood, findings, created_at";

fn row_to_report(row: &libsql::Row) -> Result<ComplianceReport, DatabaseError> {
    let op = "row_to_report";
    let likelihood: ApprovalLikelihood = parse_enum(&row_text(row, 4, op)?, op)?;
    Ok(ComplianceReport {
        id: parse_uuid(&row_text(row, 0, op)?, op)?,
        submission_id: parse_uuid(&row_text(row, 1, op)?, op)?,
        verification_id: parse_uuid(&row_text(row, 2, op)?, op)?,
        overall_score: row
            .get::<f64>(3)
            .map_err(|e| DatabaseError::Query(format!("{op} score: {e}")))?,
        approval_likelihood: likelihood,
        findings: serde_json::from_str(&row_text(row, 5, op)?)
            .map_err(|e| DatabaseError::Serialization(format!("{op}: {e}")))?,
        created_at: parse_datetime(&row_text(row, 6, op)?),
    })
}

const CARRIER_COLUMNS: &str =
    "id, submission_id, carrier_submission_id, status, detail, created_at, updated_at";

fn row_to_carrier_submission(row: &libsql::Row) -> Result<CarrierSubmission, DatabaseError> {
    let op = "row_to_carrier_submission";
    Ok(CarrierSubmission {
        id: parse_uuid(&row_text(row, 0, op)?, op)?,
        submission_id: parse_uuid(&row_text(row, 1, op)?, op)?,
        carrier_submission_id: row_text(row, 2, op)?,
        status: parse_enum(&row_text(row, 3, op)?, op)?,
        detail: row.get(4).ok(),
        created_at: parse_datetime(&row_text(row, 5, op)?),
        updated_at: parse_datetime(&row_text(row, 6, op)?),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Submissions ─────────────────────────────────────────────────

    async fn insert_submission(&self, submission: &Submission) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO submissions (id, brand_name, business_types, status, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    submission.id.to_string(),
                    submission.brand_name.as_str(),
                    to_json(&submission.business_types)?,
                    submission.status.as_str(),
                    fmt_ts(&submission.created_at),
                    fmt_ts(&submission.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_submission: {e}")))?;
        debug!(submission_id = %submission.id, "Submission inserted");
        Ok(())
    }

    async fn get_submission(&self, id: Uuid) -> Result<Option<Submission>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_submission: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_submission(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_submission row: {e}"))),
        }
    }

    async fn update_submission_status(
        &self,
        id: Uuid,
        status: SubmissionStatus,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE submissions SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), fmt_ts(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_submission_status: {e}")))?;
        Ok(count > 0)
    }

    async fn delete_submission(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_submission begin: {e}")))?;
        let id_str = id.to_string();

        for table in ["content_units", "verifications", "reports", "carrier_submissions"] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE submission_id = ?1"),
                params![id_str.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_submission {table}: {e}")))?;
        }
        let count = tx
            .execute("DELETE FROM submissions WHERE id = ?1", params![id_str.as_str()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_submission: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_submission commit: {e}")))?;
        if count > 0 {
            info!(submission_id = %id, "Submission deleted with owned records");
        }
        Ok(count > 0)
    }

    async fn list_submissions_by_status(
        &self,
        status: SubmissionStatus,
    ) -> Result<Vec<Submission>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE status = ?1 ORDER BY created_at ASC"),
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_submissions_by_status: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_submissions_by_status row: {e}")))?
        {
            out.push(row_to_submission(&row)?);
        }
        Ok(out)
    }

    // ── Content units ───────────────────────────────────────────────

    async fn insert_content_unit(&self, unit: &ContentUnit) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO content_units (id, submission_id, kind, classifier, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    unit.id.to_string(),
                    unit.submission_id.to_string(),
                    unit.kind.as_str(),
                    unit.classifier.as_str(),
                    unit.content.as_str(),
                    fmt_ts(&unit.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_content_unit: {e}")))?;
        debug!(unit_id = %unit.id, kind = %unit.kind, "Content unit inserted");
        Ok(())
    }

    async fn list_content_units(
        &self,
        submission_id: Uuid,
    ) -> Result<Vec<ContentUnit>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {UNIT_COLUMNS} FROM content_units WHERE submission_id = ?1 ORDER BY created_at ASC, rowid ASC"),
                params![submission_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_content_units: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_content_units row: {e}")))?
        {
            out.push(row_to_content_unit(&row)?);
        }
        Ok(out)
    }

    async fn count_content_units(&self, submission_id: Uuid) -> Result<usize, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM content_units WHERE submission_id = ?1",
                params![submission_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_content_units: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count_content_units: {e}")))?;
                Ok(count.max(0) as usize)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_content_units row: {e}"))),
        }
    }

    async fn record_unit_outcome(
        &self,
        unit_id: Uuid,
        verification_id: Uuid,
        outcome: &UnitOutcome,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let compliant: Option<i64> = match outcome {
            UnitOutcome::Finding(f) => Some(f.compliant as i64),
            UnitOutcome::Error { .. } => None,
        };
        let run_id = verification_id.to_string();
        let count = self
            .conn()
            .execute(
                "UPDATE content_units SET compliant = ?1, eval_run_id = ?2, eval_outcome = ?3, evaluated_at = ?4
                 WHERE id = ?5 AND (eval_run_id IS NULL OR eval_run_id != ?2)",
                params![
                    compliant,
                    run_id.as_str(),
                    to_json(outcome)?,
                    fmt_ts(&at),
                    unit_id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_unit_outcome: {e}")))?;
        Ok(count > 0)
    }

    // ── Verifications ───────────────────────────────────────────────

    async fn insert_verification(
        &self,
        verification: &Verification,
    ) -> Result<(), DatabaseError> {
        let v = verification;
        self.conn()
            .execute(
                &format!("INSERT INTO verifications ({VERIFICATION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"),
                params![
                    v.id.to_string(),
                    v.submission_id.to_string(),
                    v.status.as_str(),
                    v.current_step.map(|s| s.as_str().to_string()),
                    fmt_ts(&v.created_at),
                    v.started_at.as_ref().map(fmt_ts),
                    v.completed_at.as_ref().map(fmt_ts),
                    v.estimated_completion_at.as_ref().map(fmt_ts),
                    v.error_code.map(|c| c.as_str().to_string()),
                    v.error_detail.clone(),
                    to_json(&v.step_durations_ms)?,
                    v.version,
                    fmt_ts(&v.updated_at),
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DatabaseError::Constraint(format!(
                        "submission {} already has an active verification",
                        v.submission_id
                    ))
                } else {
                    DatabaseError::Query(format!("insert_verification: {e}"))
                }
            })?;
        debug!(verification_id = %v.id, submission_id = %v.submission_id, "Verification inserted");
        Ok(())
    }

    async fn get_verification(&self, id: Uuid) -> Result<Option<Verification>, DatabaseError> {
        let mut found = self
            .query_verifications(
                "get_verification",
                &format!("SELECT {VERIFICATION_COLUMNS} FROM verifications WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(found.pop())
    }

    async fn get_latest_verification(
        &self,
        submission_id: Uuid,
    ) -> Result<Option<Verification>, DatabaseError> {
        let mut found = self
            .query_verifications(
                "get_latest_verification",
                &format!("SELECT {VERIFICATION_COLUMNS} FROM verifications WHERE submission_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1"),
                params![submission_id.to_string()],
            )
            .await?;
        Ok(found.pop())
    }

    async fn get_active_verification(
        &self,
        submission_id: Uuid,
    ) -> Result<Option<Verification>, DatabaseError> {
        let mut found = self
            .query_verifications(
                "get_active_verification",
                &format!("SELECT {VERIFICATION_COLUMNS} FROM verifications WHERE submission_id = ?1 AND status IN ('PENDING', 'RUNNING') LIMIT 1"),
                params![submission_id.to_string()],
            )
            .await?;
        Ok(found.pop())
    }

    async fn list_verifications_for_submission(
        &self,
        submission_id: Uuid,
    ) -> Result<Vec<Verification>, DatabaseError> {
        self.query_verifications(
            "list_verifications_for_submission",
            &format!("SELECT {VERIFICATION_COLUMNS} FROM verifications WHERE submission_id = ?1 ORDER BY created_at DESC, rowid DESC"),
            params![submission_id.to_string()],
        )
        .await
    }

    async fn list_verifications_by_status(
        &self,
        status: VerificationStatus,
    ) -> Result<Vec<Verification>, DatabaseError> {
        self.query_verifications(
            "list_verifications_by_status",
            &format!("SELECT {VERIFICATION_COLUMNS} FROM verifications WHERE status = ?1 ORDER BY created_at ASC"),
            params![status.as_str()],
        )
        .await
    }

    async fn list_verifications_started_before(
        &self,
        status: VerificationStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Verification>, DatabaseError> {
        self.query_verifications(
            "list_verifications_started_before",
            &format!("SELECT {VERIFICATION_COLUMNS} FROM verifications WHERE status = ?1 AND started_at IS NOT NULL AND started_at < ?2 ORDER BY started_at ASC"),
            params![status.as_str(), fmt_ts(&cutoff)],
        )
        .await
    }

    async fn list_verifications_by_step(
        &self,
        step: VerificationStep,
    ) -> Result<Vec<Verification>, DatabaseError> {
        self.query_verifications(
            "list_verifications_by_step",
            &format!("SELECT {VERIFICATION_COLUMNS} FROM verifications WHERE current_step = ?1 AND status = 'RUNNING' ORDER BY started_at ASC"),
            params![step.as_str()],
        )
        .await
    }

    async fn list_verifications_due_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Verification>, DatabaseError> {
        self.query_verifications(
            "list_verifications_due_before",
            &format!("SELECT {VERIFICATION_COLUMNS} FROM verifications WHERE status = 'RUNNING' AND estimated_completion_at IS NOT NULL AND estimated_completion_at < ?1 ORDER BY estimated_completion_at ASC"),
            params![fmt_ts(&cutoff)],
        )
        .await
    }

    async fn list_verifications_by_status_and_error(
        &self,
        status: VerificationStatus,
        code: ErrorCode,
    ) -> Result<Vec<Verification>, DatabaseError> {
        self.query_verifications(
            "list_verifications_by_status_and_error",
            &format!("SELECT {VERIFICATION_COLUMNS} FROM verifications WHERE status = ?1 AND error_code = ?2 ORDER BY updated_at DESC"),
            params![status.as_str(), code.as_str()],
        )
        .await
    }

    async fn compare_and_swap_verification(
        &self,
        verification: &Verification,
    ) -> Result<CasOutcome, DatabaseError> {
        let v = verification;
        let id = v.id.to_string();
        let count = self
            .conn()
            .execute(
                "UPDATE verifications SET status = ?1, current_step = ?2, started_at = ?3, completed_at = ?4,
                    estimated_completion_at = ?5, error_code = ?6, error_detail = ?7, step_durations = ?8,
                    updated_at = ?9, version = version + 1
                 WHERE id = ?10 AND version = ?11",
                params![
                    v.status.as_str(),
                    v.current_step.map(|s| s.as_str().to_string()),
                    v.started_at.as_ref().map(fmt_ts),
                    v.completed_at.as_ref().map(fmt_ts),
                    v.estimated_completion_at.as_ref().map(fmt_ts),
                    v.error_code.map(|c| c.as_str().to_string()),
                    v.error_detail.clone(),
                    to_json(&v.step_durations_ms)?,
                    fmt_ts(&v.updated_at),
                    id.as_str(),
                    v.version,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("compare_and_swap_verification: {e}")))?;

        if count > 0 {
            return Ok(CasOutcome::Applied);
        }

        let mut rows = self
            .conn()
            .query("SELECT 1 FROM verifications WHERE id = ?1", params![id.as_str()])
            .await
            .map_err(|e| DatabaseError::Query(format!("compare_and_swap_verification: {e}")))?;
        match rows.next().await {
            Ok(Some(_)) => Ok(CasOutcome::Conflict),
            Ok(None) => Ok(CasOutcome::Missing),
            Err(e) => Err(DatabaseError::Query(format!(
                "compare_and_swap_verification row: {e}"
            ))),
        }
    }

    // ── Reports ─────────────────────────────────────────────────────

    async fn insert_report(&self, report: &ComplianceReport) -> Result<(), DatabaseError> {
        // Guarded insert: a submission deleted mid-run leaves no orphan report.
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO reports ({REPORT_COLUMNS}) \
                     SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7 \
                     WHERE EXISTS (SELECT 1 FROM submissions WHERE id = ?2)"
                ),
                params![
                    report.id.to_string(),
                    report.submission_id.to_string(),
                    report.verification_id.to_string(),
                    report.overall_score,
                    report.approval_likelihood.as_str(),
                    to_json(&report.findings)?,
                    fmt_ts(&report.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_report: {e}")))?;
        if inserted == 0 {
            return Err(DatabaseError::NotFound {
                entity: "submission".to_string(),
                id: report.submission_id.to_string(),
            });
        }
        debug!(report_id = %report.id, submission_id = %report.submission_id, "Report inserted");
        Ok(())
    }

    async fn get_latest_report(
        &self,
        submission_id: Uuid,
    ) -> Result<Option<ComplianceReport>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {REPORT_COLUMNS} FROM reports WHERE submission_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1"),
                params![submission_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_latest_report: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_report(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_latest_report row: {e}"))),
        }
    }

    async fn list_reports(
        &self,
        submission_id: Uuid,
    ) -> Result<Vec<ComplianceReport>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {REPORT_COLUMNS} FROM reports WHERE submission_id = ?1 ORDER BY created_at DESC, rowid DESC"),
                params![submission_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_reports: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_reports row: {e}")))?
        {
            out.push(row_to_report(&row)?);
        }
        Ok(out)
    }

    // ── Carrier submissions ─────────────────────────────────────────

    async fn insert_carrier_submission(
        &self,
        record: &CarrierSubmission,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO carrier_submissions ({CARRIER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    record.id.to_string(),
                    record.submission_id.to_string(),
                    record.carrier_submission_id.as_str(),
                    record.status.as_str(),
                    record.detail.clone(),
                    fmt_ts(&record.created_at),
                    fmt_ts(&record.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_carrier_submission: {e}")))?;
        Ok(())
    }

    async fn update_carrier_submission_status(
        &self,
        id: Uuid,
        status: CarrierStatus,
        detail: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE carrier_submissions SET status = ?1, detail = COALESCE(?2, detail), updated_at = ?3 WHERE id = ?4",
                params![
                    status.as_str(),
                    detail.map(str::to_string),
                    fmt_ts(&Utc::now()),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_carrier_submission_status: {e}")))?;
        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "carrier_submission".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_latest_carrier_submission(
        &self,
        submission_id: Uuid,
    ) -> Result<Option<CarrierSubmission>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CARRIER_COLUMNS} FROM carrier_submissions WHERE submission_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1"),
                params![submission_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_latest_carrier_submission: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_carrier_submission(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "get_latest_carrier_submission row: {e}"
            ))),
        }
    }

    async fn list_carrier_submissions_by_status(
        &self,
        status: CarrierStatus,
    ) -> Result<Vec<CarrierSubmission>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CARRIER_COLUMNS} FROM carrier_submissions WHERE status = ?1 ORDER BY created_at ASC"),
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_carrier_submissions_by_status: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| {
            DatabaseError::Query(format!("list_carrier_submissions_by_status row: {e}"))
        })? {
            out.push(row_to_carrier_submission(&row)?);
        }
        Ok(out)
    }

    // ── Guidelines ──────────────────────────────────────────────────

    async fn upsert_guideline(&self, guideline: &StoredGuideline) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO guidelines (id, text, metadata, embedding, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET text = excluded.text, metadata = excluded.metadata,
                    embedding = excluded.embedding, updated_at = excluded.updated_at",
                params![
                    guideline.id.as_str(),
                    guideline.text.as_str(),
                    to_json(&guideline.metadata)?,
                    to_json(&guideline.embedding)?,
                    fmt_ts(&guideline.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_guideline: {e}")))?;
        Ok(())
    }

    async fn list_guidelines(&self) -> Result<Vec<StoredGuideline>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, text, metadata, embedding, updated_at FROM guidelines ORDER BY id ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_guidelines: {e}")))?;

        let op = "list_guidelines";
        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op} row: {e}")))?
        {
            out.push(StoredGuideline {
                id: row_text(&row, 0, op)?,
                text: row_text(&row, 1, op)?,
                metadata: serde_json::from_str(&row_text(&row, 2, op)?)
                    .unwrap_or(serde_json::Value::Null),
                embedding: serde_json::from_str(&row_text(&row, 3, op)?)
                    .map_err(|e| DatabaseError::Serialization(format!("{op}: {e}")))?,
                updated_at: parse_datetime(&row_text(&row, 4, op)?),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Finding;
    use chrono::Duration as ChronoDuration;
    use chrono::TimeZone;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    async fn seeded_submission(db: &LibSqlBackend) -> Submission {
        let sub = Submission::new("Acme Dental", vec!["healthcare".into()]);
        db.insert_submission(&sub).await.unwrap();
        sub
    }

    fn finding(compliant: bool) -> UnitOutcome {
        UnitOutcome::Finding(Finding {
            compliant,
            issues: vec![],
            suggestions: vec![],
        })
    }

    // ── Submission tests ────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_get_submission() {
        let db = test_db().await;
        let sub = seeded_submission(&db).await;

        let fetched = db.get_submission(sub.id).await.unwrap().unwrap();
        assert_eq!(fetched.brand_name, "Acme Dental");
        assert_eq!(fetched.business_types, vec!["healthcare".to_string()]);
        assert_eq!(fetched.status, SubmissionStatus::Draft);
    }

    #[tokio::test]
    async fn get_submission_not_found() {
        let db = test_db().await;
        assert!(db.get_submission(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_submission_status_roundtrip() {
        let db = test_db().await;
        let sub = seeded_submission(&db).await;

        assert!(
            db.update_submission_status(sub.id, SubmissionStatus::UnderReview)
                .await
                .unwrap()
        );
        let listed = db
            .list_submissions_by_status(SubmissionStatus::UnderReview)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert!(
            !db.update_submission_status(Uuid::new_v4(), SubmissionStatus::Approved)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn delete_submission_cascades() {
        let db = test_db().await;
        let sub = seeded_submission(&db).await;
        let unit = ContentUnit::new(sub.id, UnitKind::Message, "web_form", "Reply STOP to opt out");
        db.insert_content_unit(&unit).await.unwrap();
        let run = Verification::new(sub.id);
        db.insert_verification(&run).await.unwrap();
        db.insert_carrier_submission(&CarrierSubmission::new(sub.id, "CR-1"))
            .await
            .unwrap();

        assert!(db.delete_submission(sub.id).await.unwrap());
        assert!(db.get_submission(sub.id).await.unwrap().is_none());
        assert!(db.list_content_units(sub.id).await.unwrap().is_empty());
        assert!(db.get_verification(run.id).await.unwrap().is_none());
        assert!(
            db.get_latest_carrier_submission(sub.id)
                .await
                .unwrap()
                .is_none()
        );
        assert!(!db.delete_submission(sub.id).await.unwrap());
    }

    // ── Content unit tests ──────────────────────────────────────────

    #[tokio::test]
    async fn unit_outcome_is_write_once_per_run() {
        let db = test_db().await;
        let sub = seeded_submission(&db).await;
        let unit = ContentUnit::new(sub.id, UnitKind::Message, "keyword", "Text JOIN for deals");
        db.insert_content_unit(&unit).await.unwrap();

        let run_a = Uuid::new_v4();
        assert!(
            db.record_unit_outcome(unit.id, run_a, &finding(true), Utc::now())
                .await
                .unwrap()
        );
        assert!(
            !db.record_unit_outcome(unit.id, run_a, &finding(false), Utc::now())
                .await
                .unwrap()
        );

        let units = db.list_content_units(sub.id).await.unwrap();
        assert_eq!(units[0].compliant(), Some(true));

        // A later run may re-evaluate.
        let run_b = Uuid::new_v4();
        assert!(
            db.record_unit_outcome(
                unit.id,
                run_b,
                &UnitOutcome::Error {
                    reason: "timeout".into()
                },
                Utc::now()
            )
            .await
            .unwrap()
        );
        let units = db.list_content_units(sub.id).await.unwrap();
        assert_eq!(units[0].compliant(), None);
        assert_eq!(units[0].verdict_for(run_b), Some(crate::model::Verdict::Indeterminate));
        assert_eq!(db.count_content_units(sub.id).await.unwrap(), 1);
    }

    // ── Verification tests ──────────────────────────────────────────

    #[tokio::test]
    async fn second_active_run_rejected() {
        let db = test_db().await;
        let sub = seeded_submission(&db).await;
        db.insert_verification(&Verification::new(sub.id))
            .await
            .unwrap();
        let err = db
            .insert_verification(&Verification::new(sub.id))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn compare_and_swap_detects_conflict_and_missing() {
        let db = test_db().await;
        let sub = seeded_submission(&db).await;
        let mut run = Verification::new(sub.id);
        db.insert_verification(&run).await.unwrap();

        let stale = run.clone();
        run.start(Utc::now()).unwrap();
        assert_eq!(
            db.compare_and_swap_verification(&run).await.unwrap(),
            CasOutcome::Applied
        );

        let mut racing = stale;
        racing.start(Utc::now()).unwrap();
        assert_eq!(
            db.compare_and_swap_verification(&racing).await.unwrap(),
            CasOutcome::Conflict
        );

        let stored = db.get_verification(run.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.status, VerificationStatus::Running);
        assert_eq!(stored.started_at, run.started_at);

        db.delete_submission(sub.id).await.unwrap();
        assert_eq!(
            db.compare_and_swap_verification(&stored).await.unwrap(),
            CasOutcome::Missing
        );
    }

    #[tokio::test]
    async fn stored_timestamps_keep_full_precision() {
        let db = test_db().await;
        let sub = seeded_submission(&db).await;
        let mut run = Verification::new(sub.id);
        run.created_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
            + ChronoDuration::nanoseconds(123_456_789);
        db.insert_verification(&run).await.unwrap();

        let stored = db.get_verification(run.id).await.unwrap().unwrap();
        assert_eq!(stored.created_at, run.created_at);

        let stamp = fmt_ts(&run.created_at);
        assert_eq!(stamp, "2026-03-01T12:00:00.123456789Z");
        let whole_second = fmt_ts(&Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 1).unwrap());
        assert_eq!(whole_second.len(), stamp.len());
        assert!(stamp < whole_second);
    }

    #[tokio::test]
    async fn finders_by_age_step_eta_and_error() {
        let db = test_db().await;
        let sub = seeded_submission(&db).await;
        let now = Utc::now();

        let mut old = Verification::new(sub.id);
        old.start(now - ChronoDuration::hours(2)).unwrap();
        old.enter_step(
            VerificationStep::EvaluateContent,
            now - ChronoDuration::minutes(30),
            now,
        );
        db.insert_verification(&old).await.unwrap();

        let cutoff = now - ChronoDuration::hours(1);
        let stale = db
            .list_verifications_started_before(VerificationStatus::Running, cutoff)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert!(
            db.list_verifications_started_before(
                VerificationStatus::Running,
                now - ChronoDuration::hours(3)
            )
            .await
            .unwrap()
            .is_empty()
        );

        let by_step = db
            .list_verifications_by_step(VerificationStep::EvaluateContent)
            .await
            .unwrap();
        assert_eq!(by_step.len(), 1);

        let overdue = db.list_verifications_due_before(now).await.unwrap();
        assert_eq!(overdue.len(), 1);

        let mut failed = old.clone();
        failed.fail(ErrorCode::Stalled, "stalled", now).unwrap();
        assert_eq!(
            db.compare_and_swap_verification(&failed).await.unwrap(),
            CasOutcome::Applied
        );
        let stalled = db
            .list_verifications_by_status_and_error(VerificationStatus::Failed, ErrorCode::Stalled)
            .await
            .unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].error_code, Some(ErrorCode::Stalled));
        assert!(db.get_active_verification(sub.id).await.unwrap().is_none());
        assert_eq!(
            db.get_latest_verification(sub.id).await.unwrap().unwrap().id,
            old.id
        );
    }

    // ── Report tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn latest_report_wins() {
        let db = test_db().await;
        let sub = seeded_submission(&db).await;
        let make = |score: f64| ComplianceReport {
            id: Uuid::new_v4(),
            submission_id: sub.id,
            verification_id: Uuid::new_v4(),
            overall_score: score,
            approval_likelihood: ApprovalLikelihood::from_score(score),
            findings: vec![],
            created_at: Utc::now(),
        };
        let first = make(0.2);
        let second = make(0.9);
        db.insert_report(&first).await.unwrap();
        db.insert_report(&second).await.unwrap();

        let latest = db.get_latest_report(sub.id).await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert_eq!(latest.approval_likelihood, ApprovalLikelihood::High);
        assert_eq!(db.list_reports(sub.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn report_for_deleted_submission_is_rejected() {
        let db = test_db().await;
        let sub = seeded_submission(&db).await;
        db.delete_submission(sub.id).await.unwrap();

        let report = ComplianceReport {
            id: Uuid::new_v4(),
            submission_id: sub.id,
            verification_id: Uuid::new_v4(),
            overall_score: 1.0,
            approval_likelihood: ApprovalLikelihood::High,
            findings: vec![],
            created_at: Utc::now(),
        };
        let err = db.insert_report(&report).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
        assert!(db.list_reports(sub.id).await.unwrap().is_empty());
    }

    // ── Carrier tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn carrier_submission_status_update() {
        let db = test_db().await;
        let sub = seeded_submission(&db).await;
        let record = CarrierSubmission::new(sub.id, "CR-42");
        db.insert_carrier_submission(&record).await.unwrap();

        let pending = db
            .list_carrier_submissions_by_status(CarrierStatus::Pending)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);

        db.update_carrier_submission_status(record.id, CarrierStatus::Accepted, Some("ok"))
            .await
            .unwrap();
        let latest = db
            .get_latest_carrier_submission(sub.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.status, CarrierStatus::Accepted);
        assert_eq!(latest.detail.as_deref(), Some("ok"));

        let missing = db
            .update_carrier_submission_status(Uuid::new_v4(), CarrierStatus::Error, None)
            .await;
        assert!(matches!(missing, Err(DatabaseError::NotFound { .. })));
    }

    // ── Guideline tests ─────────────────────────────────────────────

    #[tokio::test]
    async fn guideline_upsert_replaces() {
        let db = test_db().await;
        let mut g = StoredGuideline {
            id: "ctia-optin".into(),
            text: "v1".into(),
            metadata: serde_json::json!({"source": "ctia"}),
            embedding: vec![0.6, 0.8],
            updated_at: Utc::now(),
        };
        db.upsert_guideline(&g).await.unwrap();
        g.text = "v2".into();
        db.upsert_guideline(&g).await.unwrap();

        let all = db.list_guidelines().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].text, "v2");
        assert_eq!(all[0].embedding, vec![0.6, 0.8]);
        assert_eq!(all[0].metadata["source"], "ctia");
    }

    #[tokio::test]
    async fn on_disk_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("compliance.db");
        let id = {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            seeded_submission(&db).await.id
        };
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_submission(id).await.unwrap().is_some());
    }
}
