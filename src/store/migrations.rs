//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS submissions (
                id TEXT PRIMARY KEY,
                brand_name TEXT NOT NULL,
                business_types TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'DRAFT',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_submissions_status ON submissions(status);

            CREATE TABLE IF NOT EXISTS content_units (
                id TEXT PRIMARY KEY,
                submission_id TEXT NOT NULL REFERENCES submissions(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                classifier TEXT NOT NULL,
                content TEXT NOT NULL,
                compliant INTEGER,
                eval_run_id TEXT,
                eval_outcome TEXT,
                evaluated_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_content_units_submission
                ON content_units(submission_id);

            CREATE TABLE IF NOT EXISTS verifications (
                id TEXT PRIMARY KEY,
                submission_id TEXT NOT NULL REFERENCES submissions(id) ON DELETE CASCADE,
                status TEXT NOT NULL DEFAULT 'PENDING',
                current_step TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                estimated_completion_at TEXT,
                error_code TEXT,
                error_detail TEXT,
                step_durations TEXT NOT NULL DEFAULT '[]',
                version INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                CHECK ((status = 'FAILED') = (error_code IS NOT NULL))
            );
            CREATE INDEX IF NOT EXISTS idx_verifications_submission
                ON verifications(submission_id);
            CREATE INDEX IF NOT EXISTS idx_verifications_status_started
                ON verifications(status, started_at);
            CREATE INDEX IF NOT EXISTS idx_verifications_step ON verifications(current_step);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_verifications_one_active
                ON verifications(submission_id) WHERE status IN ('PENDING', 'RUNNING');

            CREATE TABLE IF NOT EXISTS reports (
                id TEXT PRIMARY KEY,
                submission_id TEXT NOT NULL REFERENCES submissions(id) ON DELETE CASCADE,
                verification_id TEXT NOT NULL,
                overall_score REAL NOT NULL,
                approval_likelihood TEXT NOT NULL,
                findings TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reports_submission ON reports(submission_id);

            CREATE TABLE IF NOT EXISTS carrier_submissions (
                id TEXT PRIMARY KEY,
                submission_id TEXT NOT NULL REFERENCES submissions(id) ON DELETE CASCADE,
                carrier_submission_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                detail TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_carrier_submissions_submission
                ON carrier_submissions(submission_id);
            CREATE INDEX IF NOT EXISTS idx_carrier_submissions_status
                ON carrier_submissions(status);
        "#,
    },
    Migration {
        version: 2,
        name: "guideline_index",
        sql: r#"
            CREATE TABLE IF NOT EXISTS guidelines (
                id TEXT PRIMARY KEY,
                text TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                embedding TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
        "#,
    },
];

/// Run all pending migrations against the given connection.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::info!(version, "Database migrations complete");
    Ok(())
}

async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, table: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                libsql::params![table],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let count: i64 = row.get(0).unwrap();
        count == 1
    }

    #[tokio::test]
    async fn fresh_db_creates_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in [
            "submissions",
            "content_units",
            "verifications",
            "reports",
            "carrier_submissions",
            "guidelines",
        ] {
            assert!(table_exists(&conn, table).await, "Table '{table}' should exist");
        }
    }

    #[tokio::test]
    async fn migration_future_is_send() {
        fn assert_send<T: Send>(fut: T) -> T {
            fut
        }
        let conn = test_conn().await;
        assert_send(run_migrations(&conn)).await.unwrap();
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let row1 = rows.next().await.unwrap().unwrap();
        assert_eq!(row1.get::<i64>(0).unwrap(), 1);
        assert_eq!(row1.get::<String>(1).unwrap(), "initial_schema");

        let row2 = rows.next().await.unwrap().unwrap();
        assert_eq!(row2.get::<i64>(0).unwrap(), 2);
        assert_eq!(row2.get::<String>(1).unwrap(), "guideline_index");
    }

    #[tokio::test]
    async fn one_active_run_per_submission() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO submissions (id, brand_name, created_at, updated_at) VALUES ('s1', 'Acme', 'x', 'x')",
            (),
        )
        .await
        .unwrap();
        let insert = "INSERT INTO verifications (id, submission_id, status, created_at, updated_at) VALUES (?1, 's1', ?2, 'x', 'x')";
        conn.execute(insert, libsql::params!["v1", "PENDING"])
            .await
            .unwrap();
        assert!(
            conn.execute(insert, libsql::params!["v2", "RUNNING"])
                .await
                .is_err()
        );

        // Terminal runs do not count as active.
        conn.execute(
            "UPDATE verifications SET status = 'COMPLETED' WHERE id = 'v1'",
            (),
        )
        .await
        .unwrap();
        conn.execute(insert, libsql::params!["v3", "PENDING"])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn error_code_required_iff_failed() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        conn.execute(
            "INSERT INTO submissions (id, brand_name, created_at, updated_at) VALUES ('s1', 'Acme', 'x', 'x')",
            (),
        )
        .await
        .unwrap();

        let failed_without_code = conn
            .execute(
                "INSERT INTO verifications (id, submission_id, status, created_at, updated_at) VALUES ('v1', 's1', 'FAILED', 'x', 'x')",
                (),
            )
            .await;
        assert!(failed_without_code.is_err());

        let running_with_code = conn
            .execute(
                "INSERT INTO verifications (id, submission_id, status, error_code, created_at, updated_at) VALUES ('v2', 's1', 'RUNNING', 'TIMEOUT', 'x', 'x')",
                (),
            )
            .await;
        assert!(running_with_code.is_err());
    }
}
