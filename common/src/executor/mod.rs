// Extraction executor: drives one job from pending through its terminal
// state, fanning pages through the scraper or the LLM capture runtime

pub mod insert;

use crate::audit::{AuditEvent, AuditEventType, AuditSink};
use crate::clock::Clock;
use crate::config::ScraperDefaults;
use crate::connector::connector_for;
use crate::db::Repository;
use crate::errors::{ConfigIssue, JobError, ScrapeError, StagingError};
use crate::llm::{extract_structured, LlmClient};
use crate::models::{
    Assignment, DataSource, ExtractionJob, ExtractionMethod, ExtractionRule, JobStatus,
    LlmCaptureConfig, LogLevel, PaginationType, ProcessLog, SyncMode, TriggeredBy, WebSource,
};
use crate::scrape::{find_next_url, ExtractedRow, Scraper};
use crate::secrets::{resolve_password, SecretBox};
use crate::staging::StagingStore;
use futures::StreamExt;
use insert::{insert_batch, InsertTotals, INSERT_BATCH_SIZE};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Builds the per-job scraper; tests inject stub fetchers through this seam
pub trait ScraperFactory: Send + Sync {
    fn build(&self, source: WebSource) -> Result<Scraper, ScrapeError>;
}

pub struct DefaultScraperFactory {
    pub defaults: ScraperDefaults,
}

impl ScraperFactory for DefaultScraperFactory {
    fn build(&self, source: WebSource) -> Result<Scraper, ScrapeError> {
        Scraper::new(source, &self.defaults)
    }
}

/// Result of a dry run; never touches the target database or the job table
#[derive(Debug, Clone)]
pub struct SampleOutcome {
    pub rows: Vec<ExtractedRow>,
    pub columns: Vec<String>,
    pub error: Option<String>,
    pub source_url: Option<String>,
}

/// Everything a run needs, loaded and validated up front
struct AssignmentBundle {
    assignment: Assignment,
    data_source: DataSource,
    web_source: WebSource,
    /// Active rules ordered by sort order
    rules: Vec<ExtractionRule>,
    capture: Option<LlmCaptureConfig>,
}

pub struct ExtractionExecutor {
    repo: Arc<dyn Repository>,
    secret_box: Arc<dyn SecretBox>,
    llm: Arc<dyn LlmClient>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    staging: Arc<StagingStore>,
    scraper_factory: Arc<dyn ScraperFactory>,
    controls: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl ExtractionExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn Repository>,
        secret_box: Arc<dyn SecretBox>,
        llm: Arc<dyn LlmClient>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        staging: Arc<StagingStore>,
        scraper_factory: Arc<dyn ScraperFactory>,
    ) -> Self {
        Self {
            repo,
            secret_box,
            llm,
            audit,
            clock,
            staging,
            scraper_factory,
            controls: Mutex::new(HashMap::new()),
        }
    }

    // ========================================================================
    // Job lifecycle entry points
    // ========================================================================

    /// Validate the assignment and create a pending job. Raises `ConfigIssue`
    /// without creating anything when the assignment cannot run.
    #[instrument(skip(self))]
    pub async fn prepare(
        &self,
        assignment_id: Uuid,
        mode: SyncMode,
        triggered_by: TriggeredBy,
    ) -> Result<Uuid, JobError> {
        self.load_bundle(assignment_id).await?;

        let job = ExtractionJob::pending(assignment_id, mode, triggered_by, self.clock.now());
        self.repo.job_create(&job).await?;
        self.controls
            .lock()
            .await
            .insert(job.id, CancellationToken::new());
        Ok(job.id)
    }

    /// Drive a prepared job to its terminal state. Never returns an error:
    /// failures land on the job record.
    #[instrument(skip(self))]
    pub async fn execute_job(&self, job_id: Uuid) {
        if let Err(e) = self.drive(job_id).await {
            self.finalize_error(job_id, &e).await;
        }
        self.controls.lock().await.remove(&job_id);
    }

    /// Prepare and run inline; returns once the job is terminal
    pub async fn run(
        &self,
        assignment_id: Uuid,
        mode: SyncMode,
        triggered_by: TriggeredBy,
    ) -> Result<Uuid, JobError> {
        let job_id = self.prepare(assignment_id, mode, triggered_by).await?;
        self.execute_job(job_id).await;
        Ok(job_id)
    }

    /// Cancel a job: flips status, cancels in-flight I/O, removes staged
    /// data. A no-op on terminal jobs.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: Uuid) -> Result<(), JobError> {
        let job = self
            .repo
            .job_get(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))?;
        if job.status.is_terminal() {
            return Ok(());
        }

        if let Some(token) = self.controls.lock().await.get(&job_id) {
            token.cancel();
        }

        let _ = self.repo.job_set_status(job_id, JobStatus::Cancelled).await;
        self.staging.delete(job_id).await;
        if let Some(mut cancelled) = self.repo.job_get(job_id).await? {
            cancelled.staged_data_inline = None;
            cancelled.staged_data_path = None;
            cancelled.completed_at = Some(self.clock.now());
            let _ = self.repo.job_update(&cancelled).await;
        }

        self.log(job_id, LogLevel::Info, "Job cancelled", None).await;
        self.emit_audit(&job, AuditEventType::ExtractionCancelled, json!({}));
        if job.sync_mode == SyncMode::Auto {
            self.emit_audit(&job, AuditEventType::SyncCancelled, json!({}));
        }
        Ok(())
    }

    /// Commit a staged job into the target table. Only valid in `staging`.
    #[instrument(skip(self))]
    pub async fn commit(&self, job_id: Uuid) -> Result<u64, JobError> {
        let job = self
            .repo
            .job_get(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))?;
        if job.status != JobStatus::Staging {
            return Err(JobError::WrongState {
                job_id,
                status: job.status.as_str().to_string(),
                expected: JobStatus::Staging.as_str().to_string(),
            });
        }

        match self.commit_inner(job).await {
            Ok(inserted) => Ok(inserted),
            Err(e) => {
                // the staged payload is retained so the operator can retry
                self.finalize_error(job_id, &e).await;
                Err(e)
            }
        }
    }

    async fn commit_inner(&self, job: ExtractionJob) -> Result<u64, JobError> {
        let job_id = job.id;
        let bundle = self.load_bundle(job.assignment_id).await?;

        let rows = self
            .staging
            .load_rows(
                job_id,
                job.staged_data_inline.as_deref(),
                job.staged_data_path.as_deref(),
            )
            .await
            .map_err(|e| match e {
                StagingError::InvalidJson(e) => JobError::StagedPayloadCorrupt(e.to_string()),
                other => JobError::Staging(other),
            })?;

        let mut job = self.repo.job_set_status(job_id, JobStatus::Running).await?;
        self.log(job_id, LogLevel::Info, "Committing staged rows", None)
            .await;

        let totals = self.insert_all(&bundle, &rows, &mut job).await?;

        self.staging.delete(job_id).await;
        job.staged_data_inline = None;
        job.staged_data_path = None;
        job.completed_at = Some(self.clock.now());
        self.repo.job_update(&job).await?;
        self.repo.job_set_status(job_id, JobStatus::Completed).await?;

        self.log(
            job_id,
            LogLevel::Info,
            format!(
                "Commit finished: {} inserted, {} failed",
                totals.inserted, totals.failed
            ),
            None,
        )
        .await;
        self.emit_audit(
            &job,
            AuditEventType::SyncCompleted,
            json!({"rowsInserted": totals.inserted, "rowsFailed": totals.failed}),
        );

        Ok(totals.inserted)
    }

    /// Dry-run one page of an assignment: no job record, no pagination, no
    /// target writes
    #[instrument(skip(self))]
    pub async fn run_sample(&self, assignment_id: Uuid, max_rows: usize) -> SampleOutcome {
        match self.sample_inner(assignment_id, max_rows).await {
            Ok((url, rows)) => {
                let mut columns = Vec::new();
                for row in &rows {
                    for key in row.keys() {
                        if !columns.iter().any(|c| c == key) {
                            columns.push(key.clone());
                        }
                    }
                }
                SampleOutcome {
                    rows,
                    columns,
                    error: None,
                    source_url: Some(url),
                }
            }
            Err(e) => SampleOutcome {
                rows: Vec::new(),
                columns: Vec::new(),
                error: Some(e.to_string()),
                source_url: None,
            },
        }
    }

    async fn sample_inner(
        &self,
        assignment_id: Uuid,
        max_rows: usize,
    ) -> Result<(String, Vec<ExtractedRow>), JobError> {
        let bundle = self.load_bundle(assignment_id).await?;
        let scraper = self.scraper_factory.build(bundle.web_source.clone())?;
        let url = bundle
            .assignment
            .start_url
            .clone()
            .unwrap_or_else(|| bundle.web_source.base_url.clone());

        let token = CancellationToken::new();
        let result = async {
            let html = scraper.fetch_html(&url, &token).await?;
            let mut rows = match bundle.assignment.extraction_method {
                ExtractionMethod::Selector => scraper.extract(&html, &bundle.rules)?,
                ExtractionMethod::Llm => {
                    let capture = bundle
                        .capture
                        .as_ref()
                        .ok_or(ConfigIssue::MissingCaptureConfig)?;
                    extract_structured(self.llm.as_ref(), &html, capture, &url).await
                }
            };
            rows.truncate(max_rows);
            Ok::<_, JobError>(rows)
        }
        .await;
        scraper.shutdown().await;

        Ok((url, result?))
    }

    // ========================================================================
    // The run itself
    // ========================================================================

    async fn drive(&self, job_id: Uuid) -> Result<(), JobError> {
        let mut job = self
            .repo
            .job_get(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))?;
        let bundle = self.load_bundle(job.assignment_id).await?;
        let token = self.token_for(job_id).await;

        job = self.repo.job_set_status(job_id, JobStatus::Running).await?;
        job.started_at = Some(self.clock.now());
        self.repo.job_update(&job).await?;

        let method = match bundle.assignment.extraction_method {
            ExtractionMethod::Selector => "selector",
            ExtractionMethod::Llm => "llm",
        };
        self.log(
            job_id,
            LogLevel::Info,
            format!("Starting extraction job ({})", method),
            None,
        )
        .await;
        self.emit_audit(
            &job,
            AuditEventType::ExtractionStarted,
            json!({"assignmentId": job.assignment_id, "method": method}),
        );
        if job.sync_mode == SyncMode::Auto {
            self.emit_audit(&job, AuditEventType::SyncStarted, json!({}));
        }

        let scraper = self.scraper_factory.build(bundle.web_source.clone())?;
        let pages_result = self.run_pages(&mut job, &bundle, &scraper, &token).await;
        scraper.shutdown().await;
        let rows = pages_result?;

        match job.sync_mode {
            SyncMode::Manual => {
                let payload = self.staging.put(job_id, &rows).await?;
                job.staged_row_count = payload.row_count as i64;
                job.staged_data_inline = payload.inline;
                job.staged_data_path = payload.path;
                self.repo.job_update(&job).await?;
                self.repo.job_set_status(job_id, JobStatus::Staging).await?;
                self.log(
                    job_id,
                    LogLevel::Info,
                    format!("Staged {} rows awaiting review", payload.row_count),
                    None,
                )
                .await;
            }
            SyncMode::Auto => {
                let totals = self.insert_all(&bundle, &rows, &mut job).await?;
                job.completed_at = Some(self.clock.now());
                self.repo.job_update(&job).await?;
                self.repo
                    .job_set_status(job_id, JobStatus::Completed)
                    .await?;
                self.log(
                    job_id,
                    LogLevel::Info,
                    format!(
                        "Extraction finished: {} inserted, {} failed",
                        totals.inserted, totals.failed
                    ),
                    None,
                )
                .await;
                self.emit_audit(
                    &job,
                    AuditEventType::SyncCompleted,
                    json!({"rowsInserted": totals.inserted, "rowsFailed": totals.failed}),
                );
            }
        }

        self.repo
            .assignment_set_last_run(job.assignment_id, self.clock.now())
            .await?;
        self.emit_audit(
            &job,
            AuditEventType::ExtractionCompleted,
            json!({"rowsExtracted": job.rows_extracted, "pagesProcessed": job.pages_processed}),
        );
        info!(job_id = %job_id, rows = job.rows_extracted, "extraction job finished");
        Ok(())
    }

    /// Fetch and extract every planned page, accumulating rows in page order.
    /// Per-URL failures are logged and the run continues.
    async fn run_pages(
        &self,
        job: &mut ExtractionJob,
        bundle: &AssignmentBundle,
        scraper: &Scraper,
        token: &CancellationToken,
    ) -> Result<Vec<ExtractedRow>, JobError> {
        let start_url = bundle
            .assignment
            .start_url
            .clone()
            .unwrap_or_else(|| bundle.web_source.base_url.clone());

        let pagination = bundle.web_source.pagination();
        let next_walk = bundle.web_source.pagination_type == PaginationType::NextButton
            && !bundle.web_source.is_list_mode;

        let mut rows: Vec<ExtractedRow> = Vec::new();

        if next_walk {
            let config = pagination.unwrap_or(crate::models::PaginationConfig {
                pagination_type: PaginationType::NextButton,
                param_name: None,
                selector: None,
                url_pattern: None,
                max_pages: None,
                start_page: None,
            });
            let max_pages = config.max_pages() as usize;
            let selector = config.selector.clone();

            let mut visited: HashSet<String> = HashSet::new();
            let mut current = Some(start_url);
            while let Some(url) = current.take() {
                if job.pages_processed as usize >= max_pages || !visited.insert(url.clone()) {
                    break;
                }
                self.check_cancel(token)?;

                let html = self
                    .process_page(job, bundle, scraper, &url, token, &mut rows)
                    .await?;
                self.check_cancel(token)?;

                current = html
                    .as_deref()
                    .and_then(|html| find_next_url(html, selector.as_deref(), &url));
            }
            job.pages_total = Some(job.pages_processed);
            self.repo.job_update(job).await?;
        } else {
            let urls = self.build_static_plan(bundle, &start_url, pagination)?;
            job.pages_total = Some(urls.len() as i32);
            self.repo.job_update(job).await?;

            // fetches fan out up to the source's concurrency cap; `buffered`
            // yields results in page order so row order stays deterministic
            let concurrency = bundle.web_source.max_concurrent();
            let mut pages = futures::stream::iter(urls.into_iter().map(|url| async move {
                let outcome = self.fetch_and_extract(bundle, scraper, &url, token).await;
                (url, outcome)
            }))
            .buffered(concurrency);

            while let Some((url, outcome)) = pages.next().await {
                self.check_cancel(token)?;
                match outcome {
                    Ok(page_rows) => {
                        self.log(
                            job.id,
                            LogLevel::Info,
                            format!("Extracted {} rows", page_rows.len()),
                            Some(&url),
                        )
                        .await;
                        rows.extend(page_rows);
                    }
                    Err(JobError::Cancelled) => return Err(JobError::Cancelled),
                    Err(e) => {
                        self.log(
                            job.id,
                            LogLevel::Error,
                            format!("Page failed: {}", e),
                            Some(&url),
                        )
                        .await;
                        error!(url, error = %e, "page extraction failed");
                    }
                }

                job.pages_processed += 1;
                job.rows_extracted = rows.len() as i64;
                job.current_url = Some(url);
                self.repo.job_update(job).await?;
            }
        }

        Ok(rows)
    }

    /// Fetch one page and pull rows out of it
    async fn fetch_and_extract(
        &self,
        bundle: &AssignmentBundle,
        scraper: &Scraper,
        url: &str,
        token: &CancellationToken,
    ) -> Result<Vec<ExtractedRow>, JobError> {
        let html = scraper.fetch_html(url, token).await.map_err(|e| match e {
            ScrapeError::Cancelled => JobError::Cancelled,
            other => JobError::Scrape(other),
        })?;
        self.extract_from_html(bundle, scraper, &html, url).await
    }

    async fn extract_from_html(
        &self,
        bundle: &AssignmentBundle,
        scraper: &Scraper,
        html: &str,
        url: &str,
    ) -> Result<Vec<ExtractedRow>, JobError> {
        match bundle.assignment.extraction_method {
            ExtractionMethod::Selector => Ok(scraper.extract(html, &bundle.rules)?),
            ExtractionMethod::Llm => {
                let capture = bundle
                    .capture
                    .as_ref()
                    .ok_or(ConfigIssue::MissingCaptureConfig)?;
                Ok(extract_structured(self.llm.as_ref(), html, capture, url).await)
            }
        }
    }

    /// One page: fetch, extract, log, bump counters. Returns the page HTML
    /// for next-link discovery; `None` when the page failed.
    async fn process_page(
        &self,
        job: &mut ExtractionJob,
        bundle: &AssignmentBundle,
        scraper: &Scraper,
        url: &str,
        token: &CancellationToken,
        rows: &mut Vec<ExtractedRow>,
    ) -> Result<Option<String>, JobError> {
        let outcome = async {
            let html = scraper.fetch_html(url, token).await.map_err(|e| match e {
                ScrapeError::Cancelled => JobError::Cancelled,
                other => JobError::Scrape(other),
            })?;
            let page_rows = self.extract_from_html(bundle, scraper, &html, url).await?;
            Ok::<_, JobError>((html, page_rows))
        }
        .await;

        let html = match outcome {
            Ok((html, page_rows)) => {
                self.log(
                    job.id,
                    LogLevel::Info,
                    format!("Extracted {} rows", page_rows.len()),
                    Some(url),
                )
                .await;
                rows.extend(page_rows);
                Some(html)
            }
            Err(JobError::Cancelled) => return Err(JobError::Cancelled),
            Err(e) => {
                self.log(
                    job.id,
                    LogLevel::Error,
                    format!("Page failed: {}", e),
                    Some(url),
                )
                .await;
                error!(url, error = %e, "page extraction failed");
                None
            }
        };

        job.pages_processed += 1;
        job.rows_extracted = rows.len() as i64;
        job.current_url = Some(url.to_string());
        self.repo.job_update(job).await?;
        Ok(html)
    }

    fn build_static_plan(
        &self,
        bundle: &AssignmentBundle,
        start_url: &str,
        pagination: Option<crate::models::PaginationConfig>,
    ) -> Result<Vec<String>, JobError> {
        // list mode uses the configured URLs verbatim, pagination suppressed
        if bundle.web_source.is_list_mode {
            let mut urls = vec![bundle.web_source.base_url.clone()];
            urls.extend(bundle.web_source.url_list.iter().cloned());
            return Ok(urls);
        }

        match (bundle.web_source.pagination_type, pagination) {
            (PaginationType::None, _) | (_, None) => Ok(vec![start_url.to_string()]),
            (_, Some(config)) => {
                let cap = config.max_pages();
                Ok(crate::scrape::generate_paginated_urls(
                    start_url, &config, cap,
                )?)
            }
        }
    }

    async fn insert_all(
        &self,
        bundle: &AssignmentBundle,
        rows: &[ExtractedRow],
        job: &mut ExtractionJob,
    ) -> Result<InsertTotals, JobError> {
        let columns = Self::target_columns(bundle);
        if columns.is_empty() {
            return Err(JobError::InvalidConfig(ConfigIssue::Invalid(
                "no target columns to insert".to_string(),
            )));
        }

        let password = resolve_password(self.secret_box.as_ref(), &bundle.data_source.password)
            .map_err(|e| JobError::InvalidConfig(ConfigIssue::Invalid(e.to_string())))?;
        let connector = connector_for(&bundle.data_source, password);
        connector.connect().await.map_err(JobError::Connector)?;

        let sql = insert::build_insert_sql(
            connector.db_type(),
            &bundle.assignment.target_schema,
            &bundle.assignment.target_table,
            &columns,
        );

        let mut totals = InsertTotals::default();
        let mut batch_error: Option<JobError> = None;
        for batch in rows.chunks(INSERT_BATCH_SIZE) {
            let batch_totals = insert_batch(connector.as_ref(), &sql, &columns, batch).await;
            totals.inserted += batch_totals.inserted;
            totals.failed += batch_totals.failed;
            if batch_totals.failed > 0 {
                self.log(
                    job.id,
                    LogLevel::Warn,
                    format!("{} rows failed in batch", batch_totals.failed),
                    None,
                )
                .await;
            }

            job.rows_inserted = totals.inserted as i64;
            job.rows_failed = totals.failed as i64;
            if let Err(e) = self.repo.job_update(job).await {
                batch_error = Some(e.into());
                break;
            }
        }

        // the pool is released on every path before errors surface
        let _ = connector.disconnect().await;

        match batch_error {
            Some(e) => Err(e),
            None => Ok(totals),
        }
    }

    /// Insert columns: rule targets in order for selector mode, capture
    /// mappings for llm mode
    fn target_columns(bundle: &AssignmentBundle) -> Vec<String> {
        let mut columns = Vec::new();
        match bundle.assignment.extraction_method {
            ExtractionMethod::Selector => {
                for rule in &bundle.rules {
                    if !columns.contains(&rule.target_column) {
                        columns.push(rule.target_column.clone());
                    }
                }
            }
            ExtractionMethod::Llm => {
                if let Some(capture) = &bundle.capture {
                    for mapping in &capture.column_mappings {
                        if !columns.contains(&mapping.column_name) {
                            columns.push(mapping.column_name.clone());
                        }
                    }
                }
            }
        }
        columns
    }

    // ========================================================================
    // Support
    // ========================================================================

    async fn load_bundle(&self, assignment_id: Uuid) -> Result<AssignmentBundle, JobError> {
        let assignment = self
            .repo
            .assignment_get(assignment_id)
            .await?
            .ok_or(ConfigIssue::AssignmentNotFound(assignment_id))?;
        let data_source = self
            .repo
            .data_source_get(assignment.data_source_id)
            .await?
            .ok_or(ConfigIssue::DataSourceNotFound(assignment.data_source_id))?;
        let web_source = self
            .repo
            .web_source_get(assignment.web_source_id)
            .await?
            .ok_or(ConfigIssue::WebSourceNotFound(assignment.web_source_id))?;

        let mut rules: Vec<ExtractionRule> = self
            .repo
            .rules_list(assignment_id)
            .await?
            .into_iter()
            .filter(|r| r.is_active)
            .collect();
        rules.sort_by_key(|r| r.sort_order);

        let capture = match assignment.extraction_method {
            ExtractionMethod::Selector => {
                if rules.is_empty() {
                    return Err(ConfigIssue::NoActiveRules.into());
                }
                None
            }
            ExtractionMethod::Llm => {
                let raw = assignment
                    .llm_capture_config
                    .clone()
                    .ok_or(ConfigIssue::MissingCaptureConfig)?;
                Some(
                    serde_json::from_value::<LlmCaptureConfig>(raw)
                        .map_err(|e| ConfigIssue::MalformedCaptureConfig(e.to_string()))?,
                )
            }
        };

        Ok(AssignmentBundle {
            assignment,
            data_source,
            web_source,
            rules,
            capture,
        })
    }

    async fn token_for(&self, job_id: Uuid) -> CancellationToken {
        self.controls
            .lock()
            .await
            .entry(job_id)
            .or_default()
            .clone()
    }

    fn check_cancel(&self, token: &CancellationToken) -> Result<(), JobError> {
        if token.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn finalize_error(&self, job_id: Uuid, err: &JobError) {
        match err {
            JobError::Cancelled => {
                self.staging.delete(job_id).await;
                if let Ok(Some(mut job)) = self.repo.job_get(job_id).await {
                    if !job.status.is_terminal() {
                        let _ = self.repo.job_set_status(job_id, JobStatus::Cancelled).await;
                        job.status = JobStatus::Cancelled;
                    }
                    job.staged_data_inline = None;
                    job.staged_data_path = None;
                    job.completed_at = Some(self.clock.now());
                    let _ = self.repo.job_update(&job).await;

                    self.log(job_id, LogLevel::Info, "Job cancelled", None).await;
                    self.emit_audit(&job, AuditEventType::ExtractionCancelled, json!({}));
                    if job.sync_mode == SyncMode::Auto {
                        self.emit_audit(&job, AuditEventType::SyncCancelled, json!({}));
                    }
                }
            }
            e => {
                warn!(job_id = %job_id, error = %e, "extraction job failed");
                if let Ok(Some(mut job)) = self.repo.job_get(job_id).await {
                    if !job.status.is_terminal() {
                        job.error_message = Some(e.to_string());
                        job.error_details = Some(json!({"error": format!("{:?}", e)}));
                        job.completed_at = Some(self.clock.now());
                        let _ = self.repo.job_update(&job).await;
                        let _ = self.repo.job_set_status(job_id, JobStatus::Failed).await;

                        self.log(
                            job_id,
                            LogLevel::Error,
                            format!("Job failed: {}", e),
                            None,
                        )
                        .await;
                        self.emit_audit(
                            &job,
                            AuditEventType::ExtractionFailed,
                            json!({"error": e.to_string()}),
                        );
                        if job.sync_mode == SyncMode::Auto {
                            self.emit_audit(
                                &job,
                                AuditEventType::SyncFailed,
                                json!({"error": e.to_string()}),
                            );
                        }
                    }
                }
            }
        }
    }

    async fn log(
        &self,
        job_id: Uuid,
        level: LogLevel,
        message: impl Into<String>,
        url: Option<&str>,
    ) {
        let mut entry = ProcessLog::new(job_id, level, message, self.clock.now());
        if let Some(url) = url {
            entry = entry.with_url(url);
        }
        if let Err(e) = self.repo.log_append(&entry).await {
            warn!(job_id = %job_id, error = %e, "failed to append process log");
        }
    }

    fn emit_audit(&self, job: &ExtractionJob, event_type: AuditEventType, details: serde_json::Value) {
        self.audit.record(AuditEvent {
            event_type,
            resource_type: "extraction_job".to_string(),
            resource_id: job.id,
            data_source_id: None,
            event_details: details.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RecordingAuditSink;
    use crate::clock::SystemClock;
    use crate::connector::SqliteConnector;
    use crate::connector::Connector;
    use crate::db::MemoryRepository;
    use crate::llm::testing::ScriptedLlm;
    use crate::models::{
        AssignmentStatus, AuthType, ConnectionStatus, DataSource, DbType, RuleDataType,
        ScheduleType, ScraperType, SelectorType, WebSource,
    };
    use crate::scrape::testing::StubFetcher;
    use crate::scrape::PageFetcher;
    use crate::secrets::PlaintextSecretBox;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    struct StubScraperFactory {
        pages: HashMap<String, String>,
    }

    impl ScraperFactory for StubScraperFactory {
        fn build(&self, source: WebSource) -> Result<Scraper, ScrapeError> {
            Ok(Scraper::with_fetcher(
                source,
                Arc::new(StubFetcher::new(self.pages.clone())),
            ))
        }
    }

    /// Fetcher that never answers, for cancellation tests
    struct HangingFetcher;

    #[async_trait]
    impl PageFetcher for HangingFetcher {
        async fn fetch(&self, url: &str) -> Result<String, ScrapeError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(ScrapeError::HttpStatus {
                url: url.to_string(),
                status: 504,
            })
        }
    }

    struct HangingScraperFactory;

    impl ScraperFactory for HangingScraperFactory {
        fn build(&self, source: WebSource) -> Result<Scraper, ScrapeError> {
            Ok(Scraper::with_fetcher(source, Arc::new(HangingFetcher)))
        }
    }

    struct Harness {
        repo: Arc<MemoryRepository>,
        audit: Arc<RecordingAuditSink>,
        executor: Arc<ExtractionExecutor>,
        assignment_id: Uuid,
        db_path: std::path::PathBuf,
        staging_root: std::path::PathBuf,
        _dir: tempfile::TempDir,
    }

    const PAGE_1: &str = r#"
        <html><body>
            <div class="p"><span class="name">Alpha</span><span class="price">$1.50</span></div>
            <div class="p"><span class="name">Beta</span><span class="price">$2.75</span></div>
            <div class="p"><span class="name">Gamma</span><span class="price">$3.00</span></div>
        </body></html>
    "#;
    const PAGE_2: &str = r#"
        <html><body>
            <div class="p"><span class="name">Delta</span><span class="price">$4.00</span></div>
            <div class="p"><span class="name">Echo</span><span class="price">$5.25</span></div>
            <div class="p"><span class="name">Foxtrot</span><span class="price">$6.50</span></div>
        </body></html>
    "#;

    fn web_source(id: Uuid) -> WebSource {
        WebSource {
            id,
            name: "listing".to_string(),
            base_url: "https://example.test/list".to_string(),
            is_list_mode: false,
            url_list: Vec::new(),
            scraper_type: ScraperType::Http,
            auth_type: AuthType::None,
            auth_config: None,
            request_delay_ms: 0,
            max_concurrent: 2,
            pagination_type: crate::models::PaginationType::None,
            pagination_config: None,
            timeout_seconds: 5,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn rule(assignment_id: Uuid, column: &str, selector: &str, sort_order: i32) -> ExtractionRule {
        ExtractionRule {
            id: Uuid::new_v4(),
            assignment_id,
            target_column: column.to_string(),
            selector: selector.to_string(),
            selector_type: SelectorType::Css,
            attribute: "text".to_string(),
            transform_type: None,
            transform_config: None,
            default_value: None,
            data_type: RuleDataType::String,
            is_required: false,
            validation_regex: None,
            is_active: true,
            sort_order,
        }
    }

    async fn harness(
        mutate_web: impl FnOnce(&mut WebSource),
        mutate_assignment: impl FnOnce(&mut Assignment),
        pages: Vec<(&str, &str)>,
        inline_threshold: usize,
    ) -> Harness {
        harness_with(
            mutate_web,
            mutate_assignment,
            Arc::new(StubScraperFactory {
                pages: pages
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            }),
            Arc::new(ScriptedLlm::new(Vec::new())),
            inline_threshold,
        )
        .await
    }

    async fn harness_with(
        mutate_web: impl FnOnce(&mut WebSource),
        mutate_assignment: impl FnOnce(&mut Assignment),
        scraper_factory: Arc<dyn ScraperFactory>,
        llm: Arc<dyn LlmClient>,
        inline_threshold: usize,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("target.db");
        let staging_root = dir.path().join("staging");

        // target table the auto path inserts into
        let connector = SqliteConnector::from_path(&db_path);
        connector.connect().await.unwrap();
        connector
            .exec("CREATE TABLE products (name TEXT, price TEXT)", &[])
            .await
            .unwrap();
        connector.disconnect().await.unwrap();

        let repo = Arc::new(MemoryRepository::new());
        let data_source_id = Uuid::new_v4();
        let web_source_id = Uuid::new_v4();
        let assignment_id = Uuid::new_v4();

        repo.insert_data_source(DataSource {
            id: data_source_id,
            name: "target".to_string(),
            db_type: DbType::Sqlite,
            host: String::new(),
            port: 0,
            database: db_path.to_string_lossy().into_owned(),
            username: String::new(),
            password: String::new(),
            ssl_enabled: false,
            connection_status: ConnectionStatus::Unknown,
            last_tested_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await;

        let mut web = web_source(web_source_id);
        mutate_web(&mut web);
        repo.insert_web_source(web).await;

        let mut assignment = Assignment {
            id: assignment_id,
            name: "products".to_string(),
            data_source_id,
            web_source_id,
            start_url: None,
            target_schema: String::new(),
            target_table: "products".to_string(),
            sync_mode: SyncMode::Auto,
            schedule_type: ScheduleType::Manual,
            cron_expression: None,
            status: AssignmentStatus::Active,
            extraction_method: ExtractionMethod::Selector,
            llm_capture_config: None,
            last_run_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        mutate_assignment(&mut assignment);
        repo.insert_assignment(assignment).await;

        repo.rules_replace_all(
            assignment_id,
            &[
                rule(assignment_id, "name", ".p .name", 0),
                rule(assignment_id, "price", ".p .price", 1),
            ],
        )
        .await
        .unwrap();

        let audit = Arc::new(RecordingAuditSink::default());
        let executor = Arc::new(ExtractionExecutor::new(
            repo.clone(),
            Arc::new(PlaintextSecretBox),
            llm,
            audit.clone(),
            Arc::new(SystemClock),
            Arc::new(StagingStore::new(staging_root.clone(), inline_threshold)),
            scraper_factory,
        ));

        Harness {
            repo,
            audit,
            executor,
            assignment_id,
            db_path,
            staging_root,
            _dir: dir,
        }
    }

    async fn count_target_rows(db_path: &std::path::Path) -> i64 {
        let connector = SqliteConnector::from_path(db_path);
        connector.connect().await.unwrap();
        let rows = connector
            .query("SELECT COUNT(*) AS n FROM products", &[])
            .await
            .unwrap();
        connector.disconnect().await.unwrap();
        rows[0]["n"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_auto_run_paginated_happy_path() {
        let h = harness(
            |web| {
                web.pagination_type = crate::models::PaginationType::QueryParam;
                web.pagination_config = Some(json!({
                    "type": "query_param",
                    "param_name": "page",
                    "max_pages": 2,
                }));
            },
            |_| {},
            vec![
                ("https://example.test/list?page=1", PAGE_1),
                ("https://example.test/list?page=2", PAGE_2),
            ],
            1024 * 1024,
        )
        .await;

        let job_id = h
            .executor
            .run(h.assignment_id, SyncMode::Auto, TriggeredBy::Manual)
            .await
            .unwrap();

        let job = h.repo.job_get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.pages_total, Some(2));
        assert_eq!(job.pages_processed, 2);
        assert_eq!(job.rows_extracted, 6);
        assert_eq!(job.rows_inserted, 6);
        assert_eq!(job.rows_failed, 0);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());

        assert_eq!(count_target_rows(&h.db_path).await, 6);

        let events: Vec<_> = h.audit.events().iter().map(|e| e.event_type).collect();
        assert!(events.contains(&AuditEventType::ExtractionStarted));
        assert!(events.contains(&AuditEventType::SyncStarted));
        assert!(events.contains(&AuditEventType::ExtractionCompleted));
        assert!(events.contains(&AuditEventType::SyncCompleted));

        // rows are conserved: inserted + failed = extracted
        assert_eq!(job.rows_inserted + job.rows_failed, job.rows_extracted);
    }

    #[tokio::test]
    async fn test_manual_run_stages_then_commits() {
        let h = harness(
            |web| web.is_list_mode = false,
            |a| a.sync_mode = SyncMode::Manual,
            vec![("https://example.test/list", PAGE_1)],
            16, // force a spill file
        )
        .await;

        let job_id = h
            .executor
            .run(h.assignment_id, SyncMode::Manual, TriggeredBy::Api)
            .await
            .unwrap();

        let staged = h.repo.job_get(job_id).await.unwrap().unwrap();
        assert_eq!(staged.status, JobStatus::Staging);
        assert_eq!(staged.staged_row_count, 3);
        assert!(staged.staged_data_path.is_some());
        assert!(staged.staged_data_inline.is_none());
        let spill = staged.staged_data_path.clone().unwrap();
        assert!(std::path::Path::new(&spill).exists());

        let inserted = h.executor.commit(job_id).await.unwrap();
        assert_eq!(inserted, 3);

        let done = h.repo.job_get(job_id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.rows_inserted, 3);
        assert_eq!(done.rows_inserted + done.rows_failed, done.staged_row_count);
        assert!(done.staged_data_path.is_none());
        assert!(!std::path::Path::new(&spill).exists());

        assert_eq!(count_target_rows(&h.db_path).await, 3);
    }

    #[tokio::test]
    async fn test_page_failure_does_not_abort_run() {
        let h = harness(
            |web| {
                web.is_list_mode = true;
                web.url_list = vec![
                    "https://example.test/broken".to_string(),
                    "https://example.test/extra".to_string(),
                ];
            },
            |_| {},
            vec![
                ("https://example.test/list", PAGE_1),
                // /broken is absent from the stub and yields a 404
                ("https://example.test/extra", PAGE_2),
            ],
            1024 * 1024,
        )
        .await;

        let job_id = h
            .executor
            .run(h.assignment_id, SyncMode::Auto, TriggeredBy::Manual)
            .await
            .unwrap();

        let job = h.repo.job_get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.pages_processed, 3);
        assert_eq!(job.rows_extracted, 6);

        let logs = h.repo.logs_for_job(job_id).await.unwrap();
        let failure = logs
            .iter()
            .find(|l| l.level == LogLevel::Error)
            .expect("page failure is logged at error");
        assert_eq!(failure.url.as_deref(), Some("https://example.test/broken"));
    }

    #[tokio::test]
    async fn test_cancel_during_run() {
        let h = harness_with(
            |_| {},
            |a| a.sync_mode = SyncMode::Manual,
            Arc::new(HangingScraperFactory),
            Arc::new(ScriptedLlm::new(Vec::new())),
            1024 * 1024,
        )
        .await;

        let job_id = h
            .executor
            .prepare(h.assignment_id, SyncMode::Manual, TriggeredBy::Api)
            .await
            .unwrap();

        let executor = h.executor.clone();
        let run = tokio::spawn(async move { executor.execute_job(job_id).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        h.executor.cancel(job_id).await.unwrap();
        run.await.unwrap();

        let job = h.repo.job_get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.staged_data_inline.is_none());
        assert!(job.staged_data_path.is_none());
        // staging file is gone
        assert!(!h.staging_root.join(format!("{}.json", job_id)).exists());

        // cancelling a terminal job is a no-op
        h.executor.cancel(job_id).await.unwrap();
        let again = h.repo.job_get(job_id).await.unwrap().unwrap();
        assert_eq!(again.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_prepare_fails_fast_without_rules() {
        let h = harness(|_| {}, |_| {}, vec![], 1024 * 1024).await;
        h.repo.rules_replace_all(h.assignment_id, &[]).await.unwrap();

        let err = h
            .executor
            .prepare(h.assignment_id, SyncMode::Auto, TriggeredBy::Manual)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            JobError::InvalidConfig(ConfigIssue::NoActiveRules)
        ));
        // fail-fast means no job record was created
        assert_eq!(h.repo.job_count().await, 0);
    }

    #[tokio::test]
    async fn test_llm_mode_requires_capture_config() {
        let h = harness(
            |_| {},
            |a| a.extraction_method = ExtractionMethod::Llm,
            vec![],
            1024 * 1024,
        )
        .await;

        let err = h
            .executor
            .prepare(h.assignment_id, SyncMode::Auto, TriggeredBy::Manual)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            JobError::InvalidConfig(ConfigIssue::MissingCaptureConfig)
        ));
    }

    #[tokio::test]
    async fn test_llm_extraction_run() {
        let capture = json!({
            "system_prompt": "Extract products.",
            "json_schema": {"type": "object"},
            "column_mappings": [
                {"column_name": "name", "json_field": "name", "description": "",
                 "data_type": "string", "is_required": true},
                {"column_name": "price", "json_field": "price", "description": "",
                 "data_type": "string", "is_required": false}
            ],
            "model": "gpt-4o",
            "temperature": 0.1
        });
        let llm = Arc::new(ScriptedLlm::replying(
            &json!({"items": [
                {"name": "Alpha", "price": "1.50"},
                {"name": "Beta", "price": "2.75"}
            ]})
            .to_string(),
        ));

        let h = harness_with(
            |_| {},
            |a| {
                a.extraction_method = ExtractionMethod::Llm;
                a.llm_capture_config = Some(capture);
            },
            Arc::new(StubScraperFactory {
                pages: [("https://example.test/list".to_string(), PAGE_1.to_string())]
                    .into_iter()
                    .collect(),
            }),
            llm,
            1024 * 1024,
        )
        .await;

        let job_id = h
            .executor
            .run(h.assignment_id, SyncMode::Auto, TriggeredBy::Manual)
            .await
            .unwrap();

        let job = h.repo.job_get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.rows_extracted, 2);
        assert_eq!(job.rows_inserted, 2);
        assert_eq!(count_target_rows(&h.db_path).await, 2);
    }

    #[tokio::test]
    async fn test_commit_rejects_non_staging_job() {
        let h = harness(
            |_| {},
            |_| {},
            vec![("https://example.test/list", PAGE_1)],
            1024 * 1024,
        )
        .await;

        let job_id = h
            .executor
            .run(h.assignment_id, SyncMode::Auto, TriggeredBy::Manual)
            .await
            .unwrap();

        let err = h.executor.commit(job_id).await.unwrap_err();
        assert!(matches!(err, JobError::WrongState { .. }));
    }

    #[tokio::test]
    async fn test_corrupt_staged_payload_fails_commit_and_retains_file() {
        let h = harness(
            |_| {},
            |a| a.sync_mode = SyncMode::Manual,
            vec![("https://example.test/list", PAGE_1)],
            16,
        )
        .await;

        let job_id = h
            .executor
            .run(h.assignment_id, SyncMode::Manual, TriggeredBy::Api)
            .await
            .unwrap();
        let staged = h.repo.job_get(job_id).await.unwrap().unwrap();
        let spill = staged.staged_data_path.clone().unwrap();
        std::fs::write(&spill, "not json").unwrap();

        let err = h.executor.commit(job_id).await.unwrap_err();
        assert!(matches!(err, JobError::StagedPayloadCorrupt(_)));

        let failed = h.repo.job_get(job_id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error_message.is_some());
        // the payload is retained so the operator can inspect and retry
        assert!(std::path::Path::new(&spill).exists());
    }

    #[tokio::test]
    async fn test_run_sample_returns_rows_without_job() {
        let h = harness(
            |_| {},
            |_| {},
            vec![("https://example.test/list", PAGE_1)],
            1024 * 1024,
        )
        .await;

        let sample = h.executor.run_sample(h.assignment_id, 2).await;
        assert!(sample.error.is_none());
        assert_eq!(sample.rows.len(), 2);
        assert_eq!(sample.columns, vec!["name", "price"]);
        assert_eq!(
            sample.source_url.as_deref(),
            Some("https://example.test/list")
        );
        assert_eq!(h.repo.job_count().await, 0);
        assert_eq!(count_target_rows(&h.db_path).await, 0);
    }

    #[tokio::test]
    async fn test_next_button_walk_terminates_on_repeat() {
        let page_with_next = |body: &str, next: &str| {
            format!(
                r#"<html><body>{}<a class="next" href="{}">Next</a></body></html>"#,
                body, next
            )
        };
        let row = r#"<div class="p"><span class="name">A</span><span class="price">$1</span></div>
                     <div class="p"><span class="name">B</span><span class="price">$2</span></div>"#;

        // the second page's next link loops back to page one
        let pages: HashMap<String, String> = [
            (
                "https://example.test/list".to_string(),
                page_with_next(row, "/list/2"),
            ),
            (
                "https://example.test/list/2".to_string(),
                page_with_next(row, "/list"),
            ),
        ]
        .into_iter()
        .collect();
        let h2 = harness_with(
            |web| {
                web.pagination_type = crate::models::PaginationType::NextButton;
                web.pagination_config = Some(json!({
                    "type": "next_button",
                    "selector": "a.next",
                    "max_pages": 10,
                }));
            },
            |_| {},
            Arc::new(StubScraperFactory { pages }),
            Arc::new(ScriptedLlm::new(Vec::new())),
            1024 * 1024,
        )
        .await;

        let job_id = h2
            .executor
            .run(h2.assignment_id, SyncMode::Auto, TriggeredBy::Manual)
            .await
            .unwrap();

        let job = h2.repo.job_get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        // the walk visits each page once and stops on the repeated URL
        assert_eq!(job.pages_processed, 2);
        assert_eq!(job.rows_extracted, 4);
    }
}
