// Extraction facade: trigger, sample, commit, cancel, staged-data reads

use crate::db::Repository;
use crate::errors::JobError;
use crate::executor::{ExtractionExecutor, SampleOutcome};
use crate::models::{SyncMode, TriggeredBy};
use crate::scheduler::SchedulerEngine;
use crate::staging::{StagedPage, StagingStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitResult {
    pub rows_inserted: u64,
}

pub struct ExtractionService {
    scheduler: Arc<SchedulerEngine>,
    executor: Arc<ExtractionExecutor>,
    repo: Arc<dyn Repository>,
    staging: Arc<StagingStore>,
}

impl ExtractionService {
    pub fn new(
        scheduler: Arc<SchedulerEngine>,
        executor: Arc<ExtractionExecutor>,
        repo: Arc<dyn Repository>,
        staging: Arc<StagingStore>,
    ) -> Self {
        Self {
            scheduler,
            executor,
            repo,
            staging,
        }
    }

    /// Start a run for an assignment; single-flight with scheduled ticks.
    /// Returns the fresh job id while the run proceeds in the background.
    #[instrument(skip(self))]
    pub async fn trigger_extraction(
        &self,
        assignment_id: Uuid,
        mode: SyncMode,
    ) -> Result<Uuid, JobError> {
        self.scheduler
            .trigger_now(assignment_id, mode, TriggeredBy::Api)
            .await
    }

    /// Dry-run one page; no job, no pagination, no target writes
    pub async fn run_sample(&self, assignment_id: Uuid, max_rows: usize) -> SampleOutcome {
        self.executor.run_sample(assignment_id, max_rows).await
    }

    /// Commit a staged job into its target table
    #[instrument(skip(self))]
    pub async fn commit_job(&self, job_id: Uuid) -> Result<CommitResult, JobError> {
        let rows_inserted = self.executor.commit(job_id).await?;
        Ok(CommitResult { rows_inserted })
    }

    #[instrument(skip(self))]
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<(), JobError> {
        self.executor.cancel(job_id).await
    }

    /// Page through a staging job's rows for review
    #[instrument(skip(self))]
    pub async fn get_staged_data(
        &self,
        job_id: Uuid,
        page: usize,
        page_size: usize,
    ) -> Result<StagedPage, JobError> {
        let job = self
            .repo
            .job_get(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))?;

        Ok(self
            .staging
            .get(
                job_id,
                job.staged_data_inline.as_deref(),
                job.staged_data_path.as_deref(),
                page,
                page_size,
            )
            .await?)
    }
}
