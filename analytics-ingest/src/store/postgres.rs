use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use uuid::Uuid;

use super::{
    ChallengeStats, DailyRegistrations, DailyStats, ExecutionQueries, LanguageStats, Page,
    Readiness, RecordStore, RegistrationQueries, StoreError, Stored, Upsert, Window,
};
use crate::domain::{
    ChallengeId, ExecutionId, ExecutionRecord, NewExecution, RegistrationRecord, StudentId,
    TestOutcome, UserId,
};

const UNIQUE_VIOLATION: &str = "23505";

const EXECUTION_COLUMNS: &str = r#"
    id, execution_id, challenge_id, code_version_id, student_id, language, status,
    timestamp, execution_time_ms, exit_code, total_tests, passed_tests, failed_tests,
    success, server_instance, created_at, updated_at
"#;

const REGISTRATION_COLUMNS: &str = r#"
    id, user_id, profile_id, username, profile_url, registered_at, created_at, updated_at
"#;

/// Postgres-backed store for both aggregates.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Attaches test outcomes to a batch of execution rows.
    async fn load_executions(
        &self,
        rows: Vec<ExecutionRow>,
    ) -> Result<Vec<Stored<ExecutionRecord>>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
        let children: Vec<TestResultRow> = sqlx::query_as(
            r#"
SELECT
    execution_analytics_id, test_id, test_name, passed, error_message
FROM
    test_results
WHERE
    execution_analytics_id = ANY($1)
ORDER BY
    id
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "SELECT",
            error,
        })?;

        let mut by_parent: HashMap<i64, Vec<TestOutcome>> = HashMap::new();
        for child in children {
            by_parent
                .entry(child.execution_analytics_id)
                .or_default()
                .push(child.into_outcome());
        }

        rows.into_iter()
            .map(|row| {
                let outcomes = by_parent.remove(&row.id).unwrap_or_default();
                row.into_stored(outcomes)
            })
            .collect()
    }

    async fn fetch_executions(
        &self,
        query: sqlx::query::QueryAs<'_, sqlx::Postgres, ExecutionRow, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<Stored<ExecutionRecord>>, StoreError> {
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "SELECT",
                error,
            })?;
        self.load_executions(rows).await
    }

    async fn fetch_f64(
        &self,
        sql: &str,
        id: Uuid,
    ) -> Result<f64, StoreError> {
        sqlx::query_scalar(sql)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "SELECT",
                error,
            })
    }

    async fn fetch_count(&self, sql: &str, id: Uuid) -> Result<i64, StoreError> {
        sqlx::query_scalar(sql)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "SELECT",
                error,
            })
    }

    async fn fetch_registrations(
        &self,
        query: sqlx::query::QueryAs<'_, sqlx::Postgres, RegistrationRow, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<Stored<RegistrationRecord>>, StoreError> {
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "SELECT",
                error,
            })?;
        rows.into_iter().map(RegistrationRow::into_stored).collect()
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_error) => db_error.code().as_deref() == Some(UNIQUE_VIOLATION),
        _ => false,
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: i64,
    execution_id: Uuid,
    challenge_id: Uuid,
    code_version_id: Option<String>,
    student_id: Uuid,
    language: String,
    status: String,
    timestamp: DateTime<Utc>,
    execution_time_ms: i64,
    exit_code: i32,
    total_tests: i32,
    passed_tests: i32,
    failed_tests: i32,
    success: bool,
    server_instance: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ExecutionRow {
    fn into_stored(self, outcomes: Vec<TestOutcome>) -> Result<Stored<ExecutionRecord>, StoreError> {
        let record = ExecutionRecord::new(NewExecution {
            execution_id: self.execution_id.into(),
            challenge_id: self.challenge_id.into(),
            code_version_id: self.code_version_id,
            student_id: self.student_id.into(),
            language: self.language.parse()?,
            status: self.status.parse()?,
            timestamp: self.timestamp,
            execution_time_ms: self.execution_time_ms,
            exit_code: self.exit_code,
            total_tests: self.total_tests,
            passed_tests: self.passed_tests,
            failed_tests: self.failed_tests,
            success: self.success,
            server_instance: self.server_instance,
        })?
        .with_test_outcomes(outcomes);

        Ok(Stored {
            id: self.id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            record,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TestResultRow {
    execution_analytics_id: i64,
    test_id: Uuid,
    test_name: String,
    passed: bool,
    error_message: Option<String>,
}

impl TestResultRow {
    fn into_outcome(self) -> TestOutcome {
        TestOutcome {
            test_id: self.test_id.into(),
            test_name: self.test_name,
            passed: self.passed,
            error_message: self.error_message,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RegistrationRow {
    id: i64,
    user_id: Uuid,
    profile_id: Uuid,
    username: String,
    profile_url: Option<String>,
    registered_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RegistrationRow {
    fn into_stored(self) -> Result<Stored<RegistrationRecord>, StoreError> {
        // Stored rows were valid when written, the clock check is not reapplied
        let record = RegistrationRecord::new_at(
            self.user_id.into(),
            self.profile_id.into(),
            self.username,
            self.profile_url,
            self.registered_at,
            self.registered_at,
        )?;
        Ok(Stored {
            id: self.id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            record,
        })
    }
}

#[async_trait]
impl Readiness for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "SELECT",
                error,
            })?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore<ExecutionRecord> for PgStore {
    async fn upsert_if_absent(&self, record: &ExecutionRecord) -> Result<Upsert, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::Query {
                command: "BEGIN",
                error,
            })?;

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM execution_analytics WHERE execution_id = $1")
                .bind(record.execution_id().as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|error| StoreError::Query {
                    command: "SELECT",
                    error,
                })?;
        if existing.is_some() {
            return Ok(Upsert::Duplicate);
        }

        let inserted = sqlx::query_scalar::<_, i64>(
            r#"
INSERT INTO execution_analytics
    (execution_id, challenge_id, code_version_id, student_id, language, status, timestamp,
     execution_time_ms, exit_code, total_tests, passed_tests, failed_tests, success,
     server_instance, created_at, updated_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW(), NOW())
RETURNING
    id
            "#,
        )
        .bind(record.execution_id().as_uuid())
        .bind(record.challenge_id().as_uuid())
        .bind(record.code_version_id())
        .bind(record.student_id().as_uuid())
        .bind(record.language().as_str())
        .bind(record.status().as_str())
        .bind(record.timestamp())
        .bind(record.execution_time_ms())
        .bind(record.exit_code())
        .bind(record.total_tests())
        .bind(record.passed_tests())
        .bind(record.failed_tests())
        .bind(record.success())
        .bind(record.server_instance())
        .fetch_one(&mut *tx)
        .await;

        let parent_id = match inserted {
            Ok(id) => id,
            // Lost the race against a concurrent insert of the same key
            Err(error) if is_unique_violation(&error) => return Ok(Upsert::Duplicate),
            Err(error) => {
                return Err(StoreError::Query {
                    command: "INSERT",
                    error,
                })
            }
        };

        for outcome in record.test_outcomes() {
            sqlx::query(
                r#"
INSERT INTO test_results
    (execution_analytics_id, test_id, test_name, passed, error_message, created_at)
VALUES
    ($1, $2, $3, $4, $5, NOW())
                "#,
            )
            .bind(parent_id)
            .bind(outcome.test_id.as_uuid())
            .bind(&outcome.test_name)
            .bind(outcome.passed)
            .bind(outcome.error_message.as_deref())
            .execute(&mut *tx)
            .await
            .map_err(|error| StoreError::Query {
                command: "INSERT",
                error,
            })?;
        }

        tx.commit().await.map_err(|error| StoreError::Query {
            command: "COMMIT",
            error,
        })?;

        Ok(Upsert::Inserted)
    }
}

#[async_trait]
impl RecordStore<RegistrationRecord> for PgStore {
    async fn upsert_if_absent(&self, record: &RegistrationRecord) -> Result<Upsert, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::Query {
                command: "BEGIN",
                error,
            })?;

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM user_registration_analytics WHERE user_id = $1")
                .bind(record.user_id().as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|error| StoreError::Query {
                    command: "SELECT",
                    error,
                })?;
        if existing.is_some() {
            return Ok(Upsert::Duplicate);
        }

        let inserted = sqlx::query(
            r#"
INSERT INTO user_registration_analytics
    (user_id, profile_id, username, profile_url, registered_at, created_at, updated_at)
VALUES
    ($1, $2, $3, $4, $5, NOW(), NOW())
            "#,
        )
        .bind(record.user_id().as_uuid())
        .bind(record.profile_id().as_uuid())
        .bind(record.username())
        .bind(record.profile_url())
        .bind(record.registered_at())
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(error) if is_unique_violation(&error) => return Ok(Upsert::Duplicate),
            Err(error) => {
                return Err(StoreError::Query {
                    command: "INSERT",
                    error,
                })
            }
        }

        tx.commit().await.map_err(|error| StoreError::Query {
            command: "COMMIT",
            error,
        })?;

        Ok(Upsert::Inserted)
    }
}

#[async_trait]
impl ExecutionQueries for PgStore {
    async fn find_by_execution_id(
        &self,
        id: ExecutionId,
    ) -> Result<Option<Stored<ExecutionRecord>>, StoreError> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM execution_analytics WHERE execution_id = $1"
        );
        let found = self
            .fetch_executions(sqlx::query_as(&sql).bind(id.as_uuid()))
            .await?;
        Ok(found.into_iter().next())
    }

    async fn find_by_student(
        &self,
        id: StudentId,
        page: Page,
    ) -> Result<Vec<Stored<ExecutionRecord>>, StoreError> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM execution_analytics WHERE student_id = $1 \
             ORDER BY timestamp DESC LIMIT $2 OFFSET $3"
        );
        self.fetch_executions(
            sqlx::query_as(&sql)
                .bind(id.as_uuid())
                .bind(page.limit())
                .bind(page.offset()),
        )
        .await
    }

    async fn find_by_challenge(
        &self,
        id: ChallengeId,
        page: Page,
    ) -> Result<Vec<Stored<ExecutionRecord>>, StoreError> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM execution_analytics WHERE challenge_id = $1 \
             ORDER BY timestamp DESC LIMIT $2 OFFSET $3"
        );
        self.fetch_executions(
            sqlx::query_as(&sql)
                .bind(id.as_uuid())
                .bind(page.limit())
                .bind(page.offset()),
        )
        .await
    }

    async fn find_by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page: Page,
    ) -> Result<Vec<Stored<ExecutionRecord>>, StoreError> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM execution_analytics \
             WHERE timestamp BETWEEN $1 AND $2 \
             ORDER BY timestamp DESC LIMIT $3 OFFSET $4"
        );
        self.fetch_executions(
            sqlx::query_as(&sql)
                .bind(start)
                .bind(end)
                .bind(page.limit())
                .bind(page.offset()),
        )
        .await
    }

    async fn count_by_student(&self, id: StudentId) -> Result<i64, StoreError> {
        self.fetch_count(
            "SELECT COUNT(*) FROM execution_analytics WHERE student_id = $1",
            id.as_uuid(),
        )
        .await
    }

    async fn count_by_challenge(&self, id: ChallengeId) -> Result<i64, StoreError> {
        self.fetch_count(
            "SELECT COUNT(*) FROM execution_analytics WHERE challenge_id = $1",
            id.as_uuid(),
        )
        .await
    }

    async fn success_rate_by_student(&self, id: StudentId) -> Result<f64, StoreError> {
        self.fetch_f64(
            "SELECT COALESCE(AVG(CASE WHEN success THEN 100.0 ELSE 0.0 END), 0)::FLOAT8 \
             FROM execution_analytics WHERE student_id = $1",
            id.as_uuid(),
        )
        .await
    }

    async fn success_rate_by_challenge(&self, id: ChallengeId) -> Result<f64, StoreError> {
        self.fetch_f64(
            "SELECT COALESCE(AVG(CASE WHEN success THEN 100.0 ELSE 0.0 END), 0)::FLOAT8 \
             FROM execution_analytics WHERE challenge_id = $1",
            id.as_uuid(),
        )
        .await
    }

    async fn average_execution_time_by_challenge(
        &self,
        id: ChallengeId,
    ) -> Result<f64, StoreError> {
        self.fetch_f64(
            "SELECT COALESCE(AVG(execution_time_ms), 0)::FLOAT8 \
             FROM execution_analytics WHERE challenge_id = $1",
            id.as_uuid(),
        )
        .await
    }

    async fn daily_stats(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DailyStats>, StoreError> {
        sqlx::query_as(
            r#"
SELECT
    (timestamp AT TIME ZONE 'UTC')::DATE AS date,
    COUNT(*) AS total_executions,
    COUNT(*) FILTER (WHERE success) AS successful_executions,
    COUNT(*) FILTER (WHERE NOT success) AS failed_executions,
    AVG(execution_time_ms)::FLOAT8 AS avg_execution_time_ms
FROM
    execution_analytics
WHERE
    timestamp BETWEEN $1 AND $2
GROUP BY
    1
ORDER BY
    date DESC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "SELECT",
            error,
        })
    }

    async fn language_stats(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LanguageStats>, StoreError> {
        sqlx::query_as(
            r#"
SELECT
    language,
    COUNT(*) AS total_executions,
    AVG(CASE WHEN success THEN 100.0 ELSE 0.0 END)::FLOAT8 AS success_rate
FROM
    execution_analytics
WHERE
    timestamp BETWEEN $1 AND $2
GROUP BY
    language
ORDER BY
    total_executions DESC, language
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "SELECT",
            error,
        })
    }

    async fn top_failed_challenges(&self, limit: i64) -> Result<Vec<ChallengeStats>, StoreError> {
        sqlx::query_as(
            r#"
SELECT
    challenge_id,
    COUNT(*) AS total_executions,
    AVG(CASE WHEN success THEN 100.0 ELSE 0.0 END)::FLOAT8 AS success_rate,
    AVG(execution_time_ms)::FLOAT8 AS avg_execution_time_ms
FROM
    execution_analytics
GROUP BY
    challenge_id
ORDER BY
    success_rate ASC, total_executions DESC
LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "SELECT",
            error,
        })
    }
}

#[async_trait]
impl RegistrationQueries for PgStore {
    async fn find_by_user_id(
        &self,
        id: UserId,
    ) -> Result<Option<Stored<RegistrationRecord>>, StoreError> {
        let sql = format!(
            "SELECT {REGISTRATION_COLUMNS} FROM user_registration_analytics WHERE user_id = $1"
        );
        let found = self
            .fetch_registrations(sqlx::query_as(&sql).bind(id.as_uuid()))
            .await?;
        Ok(found.into_iter().next())
    }

    async fn find_by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        window: Window,
    ) -> Result<Vec<Stored<RegistrationRecord>>, StoreError> {
        let sql = format!(
            "SELECT {REGISTRATION_COLUMNS} FROM user_registration_analytics \
             WHERE registered_at BETWEEN $1 AND $2 \
             ORDER BY registered_at DESC LIMIT $3 OFFSET $4"
        );
        self.fetch_registrations(
            sqlx::query_as(&sql)
                .bind(start)
                .bind(end)
                .bind(window.limit)
                .bind(window.offset),
        )
        .await
    }

    async fn find_all(&self, window: Window) -> Result<Vec<Stored<RegistrationRecord>>, StoreError> {
        let sql = format!(
            "SELECT {REGISTRATION_COLUMNS} FROM user_registration_analytics \
             ORDER BY registered_at DESC LIMIT $1 OFFSET $2"
        );
        self.fetch_registrations(
            sqlx::query_as(&sql)
                .bind(window.limit)
                .bind(window.offset),
        )
        .await
    }

    async fn count_total(&self) -> Result<i64, StoreError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM user_registration_analytics")
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "SELECT",
                error,
            })
    }

    async fn daily_registrations(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DailyRegistrations>, StoreError> {
        sqlx::query_as(
            r#"
SELECT
    (registered_at AT TIME ZONE 'UTC')::DATE AS date,
    COUNT(*) AS total_registrations
FROM
    user_registration_analytics
WHERE
    registered_at BETWEEN $1 AND $2
GROUP BY
    1
ORDER BY
    date DESC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "SELECT",
            error,
        })
    }
}
