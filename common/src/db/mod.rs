// Core repository: the narrow persistence port over assignments, sources,
// jobs, logs and rules

pub mod memory;
pub mod postgres;

pub use memory::MemoryRepository;
pub use postgres::PgRepository;

use crate::config::DatabaseConfig;
use crate::errors::RepositoryError;
use crate::models::{
    Assignment, DataSource, ExtractionJob, ExtractionRule, JobStatus, ProcessLog, WebSource,
};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

/// Postgres connection pool for the engine's own state
#[derive(Clone)]
pub struct DbPool {
    pool: PgPool,
}

impl DbPool {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .connect(&config.url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), RepositoryError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| RepositoryError::QueryFailed(e.to_string()))
    }
}

/// Read/write contract all core components use; each call is transactional.
#[async_trait]
pub trait Repository: Send + Sync {
    // Assignments
    async fn assignment_get(&self, id: Uuid) -> Result<Option<Assignment>, RepositoryError>;

    /// Assignments the scheduler picks up on startup: active, auto sync,
    /// non-manual schedule
    async fn assignment_list_active_auto(&self) -> Result<Vec<Assignment>, RepositoryError>;

    async fn assignment_update_extraction_method(
        &self,
        id: Uuid,
        method: crate::models::ExtractionMethod,
    ) -> Result<(), RepositoryError>;

    async fn assignment_update_capture_config(
        &self,
        id: Uuid,
        config: Value,
    ) -> Result<(), RepositoryError>;

    async fn assignment_set_last_run(
        &self,
        id: Uuid,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), RepositoryError>;

    // Sources
    async fn data_source_get(&self, id: Uuid) -> Result<Option<DataSource>, RepositoryError>;
    async fn web_source_get(&self, id: Uuid) -> Result<Option<WebSource>, RepositoryError>;

    // Jobs
    async fn job_create(&self, job: &ExtractionJob) -> Result<(), RepositoryError>;
    async fn job_get(&self, id: Uuid) -> Result<Option<ExtractionJob>, RepositoryError>;
    async fn job_update(&self, job: &ExtractionJob) -> Result<(), RepositoryError>;

    /// Transition a job, enforcing the state machine; returns the updated
    /// record or `IllegalTransition`
    async fn job_set_status(
        &self,
        id: Uuid,
        status: JobStatus,
    ) -> Result<ExtractionJob, RepositoryError>;

    // Logs
    async fn log_append(&self, log: &ProcessLog) -> Result<(), RepositoryError>;
    async fn logs_for_job(&self, job_id: Uuid) -> Result<Vec<ProcessLog>, RepositoryError>;

    // Rules
    /// Atomically replace an assignment's rule set; idempotent for an
    /// identical rule list
    async fn rules_replace_all(
        &self,
        assignment_id: Uuid,
        rules: &[ExtractionRule],
    ) -> Result<(), RepositoryError>;

    /// All rules for an assignment, ordered by sort order
    async fn rules_list(&self, assignment_id: Uuid) -> Result<Vec<ExtractionRule>, RepositoryError>;
}

/// Shared transition guard used by every implementation
pub(crate) fn check_transition(
    current: JobStatus,
    next: JobStatus,
) -> Result<(), RepositoryError> {
    if current.can_transition_to(next) {
        Ok(())
    } else {
        Err(RepositoryError::IllegalTransition {
            from: current.as_str().to_string(),
            to: next.as_str().to_string(),
        })
    }
}
