//! Postgres result store
//!
//! Handles all database operations for stage results, summaries and build
//! output.

use anvil_core::domain::{BuildSummary, StageResult, StageStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

use super::{BuildOutput, ResultStore, StoreError};

/// sqlx implementation of ResultStore
#[derive(Clone)]
pub struct PgResultStore {
    pool: PgPool,
}

impl PgResultStore {
    /// Connects to the database and runs migrations
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS build_summary (
                build_id TEXT PRIMARY KEY,
                repo TEXT NOT NULL,
                branch TEXT NOT NULL,
                revision TEXT NOT NULL,
                queued_at TIMESTAMPTZ NOT NULL,
                failed BOOLEAN NOT NULL DEFAULT FALSE,
                duration DOUBLE PRECISION
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS build_stage_detail (
                id BIGSERIAL PRIMARY KEY,
                build_id TEXT NOT NULL REFERENCES build_summary(build_id) ON DELETE CASCADE,
                stage TEXT NOT NULL,
                status VARCHAR(10) NOT NULL,
                error TEXT,
                messages JSONB NOT NULL DEFAULT '[]',
                start_time TIMESTAMPTZ NOT NULL,
                duration DOUBLE PRECISION NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS build_output (
                build_id TEXT PRIMARY KEY REFERENCES build_summary(build_id) ON DELETE CASCADE,
                output BYTEA NOT NULL,
                cancelled BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_build_stage_detail_build_id ON build_stage_detail(build_id, id)",
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("Database migrations completed successfully");
        Ok(())
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    async fn start_summary(&self, summary: &BuildSummary) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM build_stage_detail WHERE build_id = $1")
            .bind(&summary.build_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM build_output WHERE build_id = $1")
            .bind(&summary.build_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO build_summary (build_id, repo, branch, revision, queued_at, failed, duration)
            VALUES ($1, $2, $3, $4, $5, FALSE, NULL)
            ON CONFLICT (build_id) DO UPDATE
            SET repo = EXCLUDED.repo,
                branch = EXCLUDED.branch,
                revision = EXCLUDED.revision,
                queued_at = EXCLUDED.queued_at,
                failed = FALSE,
                duration = NULL
            "#,
        )
        .bind(&summary.build_id)
        .bind(&summary.repo)
        .bind(&summary.branch)
        .bind(&summary.revision)
        .bind(summary.queued_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn add_stage_detail(&self, result: &StageResult) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO build_stage_detail (build_id, stage, status, error, messages, start_time, duration)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&result.build_id)
        .bind(&result.stage)
        .bind(result.status.as_str())
        .bind(&result.error)
        .bind(Json(&result.messages))
        .bind(result.start_time)
        .bind(result.duration)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn retrieve_stage_detail(&self, build_id: &str) -> Result<Vec<StageResult>, StoreError> {
        let rows = sqlx::query_as::<_, StageRow>(
            r#"
            SELECT build_id, stage, status, error, messages, start_time, duration
            FROM build_stage_detail
            WHERE build_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(build_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn update_summary(
        &self,
        failed: bool,
        duration: f64,
        build_id: &str,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE build_summary SET failed = $1, duration = $2 WHERE build_id = $3")
                .bind(failed)
                .bind(duration)
                .bind(build_id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(build_id.to_string()));
        }
        Ok(())
    }

    async fn retrieve_summary(&self, build_id: &str) -> Result<BuildSummary, StoreError> {
        let row = sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT build_id, repo, branch, revision, queued_at, failed, duration
            FROM build_summary
            WHERE build_id = $1
            "#,
        )
        .bind(build_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Into::into)
            .ok_or_else(|| StoreError::NotFound(build_id.to_string()))
    }

    async fn add_output(&self, build_id: &str, output: &BuildOutput) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO build_output (build_id, output, cancelled)
            VALUES ($1, $2, $3)
            ON CONFLICT (build_id) DO UPDATE
            SET output = EXCLUDED.output, cancelled = EXCLUDED.cancelled
            "#,
        )
        .bind(build_id)
        .bind(&output.content)
        .bind(output.cancelled)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn retrieve_output(&self, build_id: &str) -> Result<BuildOutput, StoreError> {
        let row: Option<(Vec<u8>, bool)> =
            sqlx::query_as("SELECT output, cancelled FROM build_output WHERE build_id = $1")
                .bind(build_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(content, cancelled)| BuildOutput { content, cancelled })
            .ok_or_else(|| StoreError::NotFound(build_id.to_string()))
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct StageRow {
    build_id: String,
    stage: String,
    status: String,
    error: Option<String>,
    messages: Json<Vec<String>>,
    start_time: DateTime<Utc>,
    duration: f64,
}

impl From<StageRow> for StageResult {
    fn from(row: StageRow) -> Self {
        StageResult {
            build_id: row.build_id,
            stage: row.stage,
            // Rows are only written by add_stage_detail, so unknown values never occur
            status: StageStatus::parse(&row.status).unwrap_or(StageStatus::Fail),
            error: row.error,
            messages: row.messages.0,
            start_time: row.start_time,
            duration: row.duration,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    build_id: String,
    repo: String,
    branch: String,
    revision: String,
    queued_at: DateTime<Utc>,
    failed: bool,
    duration: Option<f64>,
}

impl From<SummaryRow> for BuildSummary {
    fn from(row: SummaryRow) -> Self {
        BuildSummary {
            build_id: row.build_id,
            repo: row.repo,
            branch: row.branch,
            revision: row.revision,
            queued_at: row.queued_at,
            failed: row.failed,
            duration: row.duration,
        }
    }
}
