// Scheduler engine: a cron entry per assignment, one mutex around the entry
// table and the running set, manual triggers sharing the same single-flight
// guard as scheduled ticks

use crate::clock::Clock;
use crate::db::Repository;
use crate::errors::{JobError, ScheduleError};
use crate::executor::ExtractionExecutor;
use crate::models::{Assignment, ScheduleType, SyncMode, TriggeredBy};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Translate an assignment's schedule shorthand into a cron spec; `None`
/// means the assignment is not scheduled.
pub fn cron_spec_for(assignment: &Assignment) -> Result<Option<String>, ScheduleError> {
    match assignment.schedule_type {
        ScheduleType::Manual => Ok(None),
        ScheduleType::Hourly => Ok(Some("0 0 * * * *".to_string())),
        ScheduleType::Daily => Ok(Some("0 0 0 * * *".to_string())),
        ScheduleType::Weekly => Ok(Some("0 0 0 * * Sun".to_string())),
        ScheduleType::Cron => {
            let expression = assignment
                .cron_expression
                .as_deref()
                .ok_or(ScheduleError::NotSchedulable(assignment.id))?;
            normalize_cron(expression).map(Some)
        }
    }
}

/// Validate a cron expression; standard five-field expressions gain a
/// leading seconds field.
pub fn normalize_cron(expression: &str) -> Result<String, ScheduleError> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };

    CronSchedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })?;
    Ok(normalized)
}

struct ScheduledEntry {
    cron_spec: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct SchedulerState {
    entries: HashMap<Uuid, ScheduledEntry>,
    running: HashSet<Uuid>,
}

/// Inspectable snapshot of the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub entries: Vec<ScheduledEntrySnapshot>,
    pub running: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledEntrySnapshot {
    pub assignment_id: Uuid,
    pub cron_spec: String,
    pub next_fire: Option<DateTime<Utc>>,
}

pub struct SchedulerEngine {
    repo: Arc<dyn Repository>,
    executor: Arc<ExtractionExecutor>,
    clock: Arc<dyn Clock>,
    /// Timezone cron expressions are evaluated in
    timezone: Tz,
    state: Arc<Mutex<SchedulerState>>,
}

impl SchedulerEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        executor: Arc<ExtractionExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_timezone(repo, executor, clock, chrono_tz::UTC)
    }

    pub fn with_timezone(
        repo: Arc<dyn Repository>,
        executor: Arc<ExtractionExecutor>,
        clock: Arc<dyn Clock>,
        timezone: Tz,
    ) -> Self {
        Self {
            repo,
            executor,
            clock,
            timezone,
            state: Arc::new(Mutex::new(SchedulerState::default())),
        }
    }

    pub fn executor(&self) -> &Arc<ExtractionExecutor> {
        &self.executor
    }

    /// Register (or refresh) the cron entry for an assignment. Manual
    /// schedules unregister instead; invalid cron expressions are refused.
    #[instrument(skip(self, assignment), fields(assignment_id = %assignment.id))]
    pub async fn schedule(self: &Arc<Self>, assignment: &Assignment) -> Result<(), ScheduleError> {
        let spec = match cron_spec_for(assignment) {
            Ok(Some(spec)) => spec,
            Ok(None) => {
                self.unschedule(assignment.id).await;
                debug!("assignment is manual, not scheduled");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "refusing to schedule assignment");
                return Err(e);
            }
        };

        // replace any previous entry for this assignment
        self.unschedule(assignment.id).await;

        let schedule =
            CronSchedule::from_str(&spec).map_err(|e| ScheduleError::InvalidCronExpression {
                expression: spec.clone(),
                reason: e.to_string(),
            })?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Self::tick_loop(
            self.clone(),
            assignment.id,
            schedule,
            self.timezone,
            cancel.clone(),
        ));

        let mut state = self.state.lock().await;
        state.entries.insert(
            assignment.id,
            ScheduledEntry {
                cron_spec: spec.clone(),
                cancel,
                task,
            },
        );
        info!(cron_spec = %spec, "assignment scheduled");
        Ok(())
    }

    /// Drop the cron entry for an assignment, cancelling its pending tick
    #[instrument(skip(self))]
    pub async fn unschedule(&self, assignment_id: Uuid) {
        let entry = self.state.lock().await.entries.remove(&assignment_id);
        if let Some(entry) = entry {
            entry.cancel.cancel();
            entry.task.abort();
            info!("assignment unscheduled");
        }
    }

    async fn tick_loop(
        engine: Arc<SchedulerEngine>,
        assignment_id: Uuid,
        schedule: CronSchedule,
        timezone: Tz,
        cancel: CancellationToken,
    ) {
        loop {
            // evaluate the cron expression in the configured timezone
            let now = Utc::now();
            let Some(next) = schedule.after(&now.with_timezone(&timezone)).next() else {
                debug!(assignment_id = %assignment_id, "cron spec has no future fires");
                break;
            };
            let wait = (next.with_timezone(&Utc) - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            engine.on_tick(assignment_id).await;
        }
    }

    /// A scheduled fire: skipped when the assignment is already running
    #[instrument(skip(self))]
    pub async fn on_tick(self: &Arc<Self>, assignment_id: Uuid) {
        match self.launch(assignment_id, None, TriggeredBy::Schedule).await {
            Ok(job_id) => {
                info!(job_id = %job_id, "scheduled run started");
            }
            Err(JobError::AlreadyRunning(_)) => {
                info!("skipped — already running");
            }
            Err(e) => {
                error!(error = %e, "scheduled run failed to start");
            }
        }
    }

    /// Manual trigger sharing the scheduled ticks' single-flight guard
    #[instrument(skip(self))]
    pub async fn trigger_now(
        self: &Arc<Self>,
        assignment_id: Uuid,
        mode: SyncMode,
        triggered_by: TriggeredBy,
    ) -> Result<Uuid, JobError> {
        self.launch(assignment_id, Some(mode), triggered_by).await
    }

    /// Check-and-insert into the running set, create the job and spawn its
    /// execution; the slot is released when the run finishes.
    async fn launch(
        self: &Arc<Self>,
        assignment_id: Uuid,
        mode_override: Option<SyncMode>,
        triggered_by: TriggeredBy,
    ) -> Result<Uuid, JobError> {
        {
            let mut state = self.state.lock().await;
            if !state.running.insert(assignment_id) {
                return Err(JobError::AlreadyRunning(assignment_id));
            }
        }

        let prepared = async {
            let mode = match mode_override {
                Some(mode) => mode,
                None => {
                    let assignment = self
                        .repo
                        .assignment_get(assignment_id)
                        .await?
                        .ok_or(crate::errors::ConfigIssue::AssignmentNotFound(assignment_id))?;
                    assignment.sync_mode
                }
            };
            self.executor.prepare(assignment_id, mode, triggered_by).await
        }
        .await;

        match prepared {
            Ok(job_id) => {
                let engine = self.clone();
                tokio::spawn(async move {
                    engine.executor.execute_job(job_id).await;
                    engine.state.lock().await.running.remove(&assignment_id);
                });
                Ok(job_id)
            }
            Err(e) => {
                self.state.lock().await.running.remove(&assignment_id);
                Err(e)
            }
        }
    }

    /// On startup: schedule every active auto assignment with a non-manual
    /// schedule
    #[instrument(skip(self))]
    pub async fn initialize(self: &Arc<Self>) -> Result<usize, ScheduleError> {
        let assignments = self.repo.assignment_list_active_auto().await?;

        let mut scheduled = 0;
        for assignment in &assignments {
            match self.schedule(assignment).await {
                Ok(()) => scheduled += 1,
                Err(e) => {
                    warn!(assignment_id = %assignment.id, error = %e, "skipping unschedulable assignment");
                }
            }
        }

        info!(count = scheduled, "scheduler initialized");
        Ok(scheduled)
    }

    /// Cancel every entry; in-flight runs are left to finish
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        for (_, entry) in state.entries.drain() {
            entry.cancel.cancel();
            entry.task.abort();
        }
        info!("scheduler stopped");
    }

    /// Snapshot of scheduled entries and the running set
    pub async fn status(&self) -> SchedulerStatus {
        let state = self.state.lock().await;
        let now = self.clock.now();

        let entries = state
            .entries
            .iter()
            .map(|(assignment_id, entry)| ScheduledEntrySnapshot {
                assignment_id: *assignment_id,
                cron_spec: entry.cron_spec.clone(),
                next_fire: CronSchedule::from_str(&entry.cron_spec)
                    .ok()
                    .and_then(|s| s.after(&now.with_timezone(&self.timezone)).next())
                    .map(|t| t.with_timezone(&Utc)),
            })
            .collect();

        SchedulerStatus {
            entries,
            running: state.running.iter().copied().collect(),
        }
    }
}
