// In-memory repository used by tests and sample runs

use super::{check_transition, Repository};
use crate::errors::RepositoryError;
use crate::models::{
    Assignment, AssignmentStatus, DataSource, ExtractionJob, ExtractionMethod, ExtractionRule,
    JobStatus, ProcessLog, ScheduleType, SyncMode, WebSource,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryRepository {
    assignments: RwLock<HashMap<Uuid, Assignment>>,
    data_sources: RwLock<HashMap<Uuid, DataSource>>,
    web_sources: RwLock<HashMap<Uuid, WebSource>>,
    jobs: RwLock<HashMap<Uuid, ExtractionJob>>,
    logs: RwLock<Vec<ProcessLog>>,
    rules: RwLock<HashMap<Uuid, Vec<ExtractionRule>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_assignment(&self, assignment: Assignment) {
        self.assignments
            .write()
            .await
            .insert(assignment.id, assignment);
    }

    pub async fn insert_data_source(&self, source: DataSource) {
        self.data_sources.write().await.insert(source.id, source);
    }

    pub async fn insert_web_source(&self, source: WebSource) {
        self.web_sources.write().await.insert(source.id, source);
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn assignment_get(&self, id: Uuid) -> Result<Option<Assignment>, RepositoryError> {
        Ok(self.assignments.read().await.get(&id).cloned())
    }

    async fn assignment_list_active_auto(&self) -> Result<Vec<Assignment>, RepositoryError> {
        Ok(self
            .assignments
            .read()
            .await
            .values()
            .filter(|a| {
                a.status == AssignmentStatus::Active
                    && a.sync_mode == SyncMode::Auto
                    && a.schedule_type != ScheduleType::Manual
            })
            .cloned()
            .collect())
    }

    async fn assignment_update_extraction_method(
        &self,
        id: Uuid,
        method: ExtractionMethod,
    ) -> Result<(), RepositoryError> {
        let mut assignments = self.assignments.write().await;
        let assignment = assignments
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("assignment {}", id)))?;
        assignment.extraction_method = method;
        Ok(())
    }

    async fn assignment_update_capture_config(
        &self,
        id: Uuid,
        config: Value,
    ) -> Result<(), RepositoryError> {
        let mut assignments = self.assignments.write().await;
        let assignment = assignments
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("assignment {}", id)))?;
        assignment.llm_capture_config = Some(config);
        Ok(())
    }

    async fn assignment_set_last_run(
        &self,
        id: Uuid,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), RepositoryError> {
        let mut assignments = self.assignments.write().await;
        if let Some(assignment) = assignments.get_mut(&id) {
            assignment.last_run_at = Some(at);
        }
        Ok(())
    }

    async fn data_source_get(&self, id: Uuid) -> Result<Option<DataSource>, RepositoryError> {
        Ok(self.data_sources.read().await.get(&id).cloned())
    }

    async fn web_source_get(&self, id: Uuid) -> Result<Option<WebSource>, RepositoryError> {
        Ok(self.web_sources.read().await.get(&id).cloned())
    }

    async fn job_create(&self, job: &ExtractionJob) -> Result<(), RepositoryError> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn job_get(&self, id: Uuid) -> Result<Option<ExtractionJob>, RepositoryError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn job_update(&self, job: &ExtractionJob) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().await;
        if !jobs.contains_key(&job.id) {
            return Err(RepositoryError::NotFound(format!("job {}", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn job_set_status(
        &self,
        id: Uuid,
        status: JobStatus,
    ) -> Result<ExtractionJob, RepositoryError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("job {}", id)))?;
        check_transition(job.status, status)?;
        job.status = status;
        Ok(job.clone())
    }

    async fn log_append(&self, log: &ProcessLog) -> Result<(), RepositoryError> {
        self.logs.write().await.push(log.clone());
        Ok(())
    }

    async fn logs_for_job(&self, job_id: Uuid) -> Result<Vec<ProcessLog>, RepositoryError> {
        Ok(self
            .logs
            .read()
            .await
            .iter()
            .filter(|l| l.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn rules_replace_all(
        &self,
        assignment_id: Uuid,
        rules: &[ExtractionRule],
    ) -> Result<(), RepositoryError> {
        let mut sorted = rules.to_vec();
        sorted.sort_by_key(|r| r.sort_order);
        self.rules.write().await.insert(assignment_id, sorted);
        Ok(())
    }

    async fn rules_list(
        &self,
        assignment_id: Uuid,
    ) -> Result<Vec<ExtractionRule>, RepositoryError> {
        Ok(self
            .rules
            .read()
            .await
            .get(&assignment_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::models::TriggeredBy;

    fn pending_job(assignment_id: Uuid) -> ExtractionJob {
        ExtractionJob::pending(assignment_id, SyncMode::Auto, TriggeredBy::Manual, Utc::now())
    }

    #[tokio::test]
    async fn test_job_status_machine_enforced() {
        let repo = MemoryRepository::new();
        let job = pending_job(Uuid::new_v4());
        repo.job_create(&job).await.unwrap();

        repo.job_set_status(job.id, JobStatus::Running).await.unwrap();
        repo.job_set_status(job.id, JobStatus::Completed).await.unwrap();

        let err = repo
            .job_set_status(job.id, JobStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn test_rules_replace_all_is_idempotent() {
        let repo = MemoryRepository::new();
        let assignment_id = Uuid::new_v4();
        let rule = ExtractionRule {
            id: Uuid::new_v4(),
            assignment_id,
            target_column: "name".to_string(),
            selector: ".name".to_string(),
            selector_type: crate::models::SelectorType::Css,
            attribute: "text".to_string(),
            transform_type: None,
            transform_config: None,
            default_value: None,
            data_type: crate::models::RuleDataType::String,
            is_required: false,
            validation_regex: None,
            is_active: true,
            sort_order: 0,
        };

        repo.rules_replace_all(assignment_id, &[rule.clone()]).await.unwrap();
        let first = repo.rules_list(assignment_id).await.unwrap();
        repo.rules_replace_all(assignment_id, &[rule]).await.unwrap();
        let second = repo.rules_list(assignment_id).await.unwrap();

        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].target_column, second[0].target_column);
        assert_eq!(first[0].sort_order, second[0].sort_order);
    }
}
