// Postgres repository implementation

use super::{check_transition, DbPool, Repository};
use crate::errors::RepositoryError;
use crate::models::{
    Assignment, DataSource, ExtractionJob, ExtractionMethod, ExtractionRule, JobStatus,
    ProcessLog, WebSource,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

pub struct PgRepository {
    pool: DbPool,
}

impl PgRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn parse<T, E: std::fmt::Display>(
        value: Result<T, E>,
        what: &str,
    ) -> Result<T, RepositoryError> {
        value.map_err(|e| RepositoryError::QueryFailed(format!("bad {}: {}", what, e)))
    }

    fn map_assignment(row: &PgRow) -> Result<Assignment, RepositoryError> {
        Ok(Assignment {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            data_source_id: row.try_get("data_source_id")?,
            web_source_id: row.try_get("web_source_id")?,
            start_url: row.try_get("start_url")?,
            target_schema: row.try_get("target_schema")?,
            target_table: row.try_get("target_table")?,
            sync_mode: Self::parse(
                row.try_get::<String, _>("sync_mode")?.try_into(),
                "sync_mode",
            )?,
            schedule_type: Self::parse(
                row.try_get::<String, _>("schedule_type")?.try_into(),
                "schedule_type",
            )?,
            cron_expression: row.try_get("cron_expression")?,
            status: Self::parse(row.try_get::<String, _>("status")?.try_into(), "status")?,
            extraction_method: Self::parse(
                row.try_get::<String, _>("extraction_method")?.try_into(),
                "extraction_method",
            )?,
            llm_capture_config: row.try_get("llm_capture_config")?,
            last_run_at: row.try_get("last_run_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn map_data_source(row: &PgRow) -> Result<DataSource, RepositoryError> {
        Ok(DataSource {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            db_type: Self::parse(row.try_get::<String, _>("db_type")?.try_into(), "db_type")?,
            host: row.try_get("host")?,
            port: row.try_get::<i32, _>("port")? as u16,
            database: row.try_get("database_name")?,
            username: row.try_get("username")?,
            password: row.try_get("password")?,
            ssl_enabled: row.try_get("ssl_enabled")?,
            connection_status: Self::parse(
                row.try_get::<String, _>("connection_status")?.try_into(),
                "connection_status",
            )?,
            last_tested_at: row.try_get("last_tested_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn map_web_source(row: &PgRow) -> Result<WebSource, RepositoryError> {
        let url_list: Value = row.try_get("url_list")?;
        Ok(WebSource {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            base_url: row.try_get("base_url")?,
            is_list_mode: row.try_get("is_list_mode")?,
            url_list: serde_json::from_value(url_list)
                .map_err(|e| RepositoryError::QueryFailed(format!("bad url_list: {}", e)))?,
            scraper_type: Self::parse(
                row.try_get::<String, _>("scraper_type")?.try_into(),
                "scraper_type",
            )?,
            auth_type: Self::parse(
                row.try_get::<String, _>("auth_type")?.try_into(),
                "auth_type",
            )?,
            auth_config: row.try_get("auth_config")?,
            request_delay_ms: row.try_get::<i64, _>("request_delay_ms")?.max(0) as u64,
            max_concurrent: row.try_get::<i32, _>("max_concurrent")?.max(1) as u32,
            pagination_type: Self::parse(
                row.try_get::<String, _>("pagination_type")?.try_into(),
                "pagination_type",
            )?,
            pagination_config: row.try_get("pagination_config")?,
            timeout_seconds: row.try_get::<i64, _>("timeout_seconds")?.max(0) as u64,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn map_job(row: &PgRow) -> Result<ExtractionJob, RepositoryError> {
        Ok(ExtractionJob {
            id: row.try_get("id")?,
            assignment_id: row.try_get("assignment_id")?,
            status: Self::parse(row.try_get::<String, _>("status")?.try_into(), "status")?,
            sync_mode: Self::parse(
                row.try_get::<String, _>("sync_mode")?.try_into(),
                "sync_mode",
            )?,
            triggered_by: Self::parse(
                row.try_get::<String, _>("triggered_by")?.try_into(),
                "triggered_by",
            )?,
            pages_total: row.try_get("pages_total")?,
            pages_processed: row.try_get("pages_processed")?,
            current_url: row.try_get("current_url")?,
            rows_extracted: row.try_get("rows_extracted")?,
            rows_inserted: row.try_get("rows_inserted")?,
            rows_failed: row.try_get("rows_failed")?,
            staged_row_count: row.try_get("staged_row_count")?,
            staged_data_inline: row.try_get("staged_data_inline")?,
            staged_data_path: row.try_get("staged_data_path")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
            error_details: row.try_get("error_details")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn map_rule(row: &PgRow) -> Result<ExtractionRule, RepositoryError> {
        let transform_type: Option<String> = row.try_get("transform_type")?;
        Ok(ExtractionRule {
            id: row.try_get("id")?,
            assignment_id: row.try_get("assignment_id")?,
            target_column: row.try_get("target_column")?,
            selector: row.try_get("selector")?,
            selector_type: Self::parse(
                row.try_get::<String, _>("selector_type")?.try_into(),
                "selector_type",
            )?,
            attribute: row.try_get("attribute")?,
            transform_type: match transform_type {
                Some(t) => Some(Self::parse(t.try_into(), "transform_type")?),
                None => None,
            },
            transform_config: row.try_get("transform_config")?,
            default_value: row.try_get("default_value")?,
            data_type: Self::parse(
                row.try_get::<String, _>("data_type")?.try_into(),
                "data_type",
            )?,
            is_required: row.try_get("is_required")?,
            validation_regex: row.try_get("validation_regex")?,
            is_active: row.try_get("is_active")?,
            sort_order: row.try_get("sort_order")?,
        })
    }
}

const JOB_COLUMNS: &str = "id, assignment_id, status, sync_mode, triggered_by, pages_total, \
     pages_processed, current_url, rows_extracted, rows_inserted, rows_failed, \
     staged_row_count, staged_data_inline, staged_data_path, started_at, completed_at, \
     error_message, error_details, created_at";

#[async_trait]
impl Repository for PgRepository {
    #[instrument(skip(self))]
    async fn assignment_get(&self, id: Uuid) -> Result<Option<Assignment>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM assignments WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;
        row.as_ref().map(Self::map_assignment).transpose()
    }

    #[instrument(skip(self))]
    async fn assignment_list_active_auto(&self) -> Result<Vec<Assignment>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM assignments
            WHERE status = 'active' AND sync_mode = 'auto' AND schedule_type <> 'manual'
            ORDER BY created_at
            "#,
        )
        .fetch_all(self.pool.pool())
        .await?;
        rows.iter().map(Self::map_assignment).collect()
    }

    #[instrument(skip(self))]
    async fn assignment_update_extraction_method(
        &self,
        id: Uuid,
        method: ExtractionMethod,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE assignments SET extraction_method = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(String::from(method))
        .execute(self.pool.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("assignment {}", id)));
        }
        Ok(())
    }

    #[instrument(skip(self, config))]
    async fn assignment_update_capture_config(
        &self,
        id: Uuid,
        config: Value,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE assignments SET llm_capture_config = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(config)
        .execute(self.pool.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("assignment {}", id)));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn assignment_set_last_run(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE assignments SET last_run_at = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn data_source_get(&self, id: Uuid) -> Result<Option<DataSource>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM data_sources WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;
        row.as_ref().map(Self::map_data_source).transpose()
    }

    #[instrument(skip(self))]
    async fn web_source_get(&self, id: Uuid) -> Result<Option<WebSource>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM web_sources WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;
        row.as_ref().map(Self::map_web_source).transpose()
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn job_create(&self, job: &ExtractionJob) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO extraction_jobs (
                id, assignment_id, status, sync_mode, triggered_by, pages_total,
                pages_processed, current_url, rows_extracted, rows_inserted, rows_failed,
                staged_row_count, staged_data_inline, staged_data_path, started_at,
                completed_at, error_message, error_details, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(job.id)
        .bind(job.assignment_id)
        .bind(String::from(job.status))
        .bind(String::from(job.sync_mode))
        .bind(String::from(job.triggered_by))
        .bind(job.pages_total)
        .bind(job.pages_processed)
        .bind(&job.current_url)
        .bind(job.rows_extracted)
        .bind(job.rows_inserted)
        .bind(job.rows_failed)
        .bind(job.staged_row_count)
        .bind(&job.staged_data_inline)
        .bind(&job.staged_data_path)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.error_message)
        .bind(&job.error_details)
        .bind(job.created_at)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn job_get(&self, id: Uuid) -> Result<Option<ExtractionJob>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM extraction_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;
        row.as_ref().map(Self::map_job).transpose()
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn job_update(&self, job: &ExtractionJob) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE extraction_jobs SET
                status = $2, pages_total = $3, pages_processed = $4, current_url = $5,
                rows_extracted = $6, rows_inserted = $7, rows_failed = $8,
                staged_row_count = $9, staged_data_inline = $10, staged_data_path = $11,
                started_at = $12, completed_at = $13, error_message = $14, error_details = $15
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(String::from(job.status))
        .bind(job.pages_total)
        .bind(job.pages_processed)
        .bind(&job.current_url)
        .bind(job.rows_extracted)
        .bind(job.rows_inserted)
        .bind(job.rows_failed)
        .bind(job.staged_row_count)
        .bind(&job.staged_data_inline)
        .bind(&job.staged_data_path)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.error_message)
        .bind(&job.error_details)
        .execute(self.pool.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("job {}", job.id)));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn job_set_status(
        &self,
        id: Uuid,
        status: JobStatus,
    ) -> Result<ExtractionJob, RepositoryError> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| RepositoryError::TransactionFailed(e.to_string()))?;

        let row = sqlx::query("SELECT status FROM extraction_jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("job {}", id)))?;
        let current: JobStatus =
            Self::parse(row.try_get::<String, _>("status")?.try_into(), "status")?;
        check_transition(current, status)?;

        let updated = sqlx::query(&format!(
            "UPDATE extraction_jobs SET status = $2 WHERE id = $1 RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(id)
        .bind(String::from(status))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit()
            .await
            .map_err(|e| RepositoryError::TransactionFailed(e.to_string()))?;

        Self::map_job(&updated)
    }

    #[instrument(skip(self, log), fields(job_id = %log.job_id))]
    async fn log_append(&self, log: &ProcessLog) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO process_logs (id, job_id, level, message, url, details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(log.id)
        .bind(log.job_id)
        .bind(String::from(log.level))
        .bind(&log.message)
        .bind(&log.url)
        .bind(&log.details)
        .bind(log.created_at)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn logs_for_job(&self, job_id: Uuid) -> Result<Vec<ProcessLog>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM process_logs WHERE job_id = $1 ORDER BY created_at, id",
        )
        .bind(job_id)
        .fetch_all(self.pool.pool())
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ProcessLog {
                    id: row.try_get("id")?,
                    job_id: row.try_get("job_id")?,
                    level: Self::parse(row.try_get::<String, _>("level")?.try_into(), "level")?,
                    message: row.try_get("message")?,
                    url: row.try_get("url")?,
                    details: row.try_get("details")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self, rules), fields(rule_count = rules.len()))]
    async fn rules_replace_all(
        &self,
        assignment_id: Uuid,
        rules: &[ExtractionRule],
    ) -> Result<(), RepositoryError> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| RepositoryError::TransactionFailed(e.to_string()))?;

        sqlx::query("DELETE FROM extraction_rules WHERE assignment_id = $1")
            .bind(assignment_id)
            .execute(&mut *tx)
            .await?;

        for rule in rules {
            sqlx::query(
                r#"
                INSERT INTO extraction_rules (
                    id, assignment_id, target_column, selector, selector_type, attribute,
                    transform_type, transform_config, default_value, data_type,
                    is_required, validation_regex, is_active, sort_order
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#,
            )
            .bind(rule.id)
            .bind(assignment_id)
            .bind(&rule.target_column)
            .bind(&rule.selector)
            .bind(String::from(rule.selector_type))
            .bind(&rule.attribute)
            .bind(rule.transform_type.map(String::from))
            .bind(&rule.transform_config)
            .bind(&rule.default_value)
            .bind(String::from(rule.data_type))
            .bind(rule.is_required)
            .bind(&rule.validation_regex)
            .bind(rule.is_active)
            .bind(rule.sort_order)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryError::TransactionFailed(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn rules_list(
        &self,
        assignment_id: Uuid,
    ) -> Result<Vec<ExtractionRule>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM extraction_rules WHERE assignment_id = $1 ORDER BY sort_order, id",
        )
        .bind(assignment_id)
        .fetch_all(self.pool.pool())
        .await?;
        rows.iter().map(Self::map_rule).collect()
    }
}
