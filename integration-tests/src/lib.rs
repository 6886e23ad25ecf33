// Shared fixtures for end-to-end scenario tests

use common::bootstrap::{build_engine_with, Engine};
use common::config::Settings;
use common::connector::{Connector, SqliteConnector};
use common::db::MemoryRepository;
use common::db::Repository;
use common::errors::LlmError;
use common::llm::{CompletionRequest, LlmClient};
use common::models::{
    Assignment, AssignmentStatus, AuthType, ConnectionStatus, DataSource, DbType,
    ExtractionMethod, ExtractionRule, JobStatus, PaginationType, RuleDataType, ScheduleType,
    ScraperType, SelectorType, SyncMode, TransformType, WebSource,
};
use common::secrets::PlaintextSecretBox;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Scripted LLM client for scenarios that exercise the capture workflow
pub struct StubLlm {
    responses: Mutex<Vec<String>>,
}

impl StubLlm {
    pub fn new(mut responses: Vec<String>) -> Self {
        responses.reverse();
        Self {
            responses: Mutex::new(responses),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait::async_trait]
impl LlmClient for StubLlm {
    async fn complete(&self, _request: CompletionRequest) -> Result<String, LlmError> {
        self.responses
            .lock()
            .expect("stub mutex poisoned")
            .pop()
            .ok_or_else(|| LlmError::RequestFailed("stub exhausted".to_string()))
    }
}

pub struct FixtureBuilder {
    pub base_url: String,
    pub sync_mode: SyncMode,
    pub extraction_method: ExtractionMethod,
    pub pagination_type: PaginationType,
    pub pagination_config: Option<Value>,
    pub is_list_mode: bool,
    pub url_list: Vec<String>,
    pub start_url: Option<String>,
    pub request_delay_ms: u64,
    pub inline_threshold: usize,
    pub target_table: String,
    pub target_ddl: String,
    pub rules: Vec<(String, String, RuleDataType, Option<(TransformType, Value)>)>,
    pub capture_config: Option<Value>,
    pub llm_responses: Vec<String>,
}

impl FixtureBuilder {
    /// Defaults mirror the canonical products listing scenario
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            sync_mode: SyncMode::Auto,
            extraction_method: ExtractionMethod::Selector,
            pagination_type: PaginationType::None,
            pagination_config: None,
            is_list_mode: false,
            url_list: Vec::new(),
            start_url: None,
            request_delay_ms: 0,
            inline_threshold: 1024 * 1024,
            target_table: "products".to_string(),
            target_ddl: "CREATE TABLE products (name TEXT, price NUMERIC)".to_string(),
            rules: vec![
                (
                    "name".to_string(),
                    ".p .name".to_string(),
                    RuleDataType::String,
                    None,
                ),
                (
                    "price".to_string(),
                    ".p .price".to_string(),
                    RuleDataType::Number,
                    Some((
                        TransformType::Regex,
                        json!({"pattern": r"\$([0-9.]+)", "group": 1}),
                    )),
                ),
            ],
            capture_config: None,
            llm_responses: Vec::new(),
        }
    }

    pub async fn build(self) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("target.db");
        let staging_root = dir.path().join("staging");

        let connector = SqliteConnector::from_path(&db_path);
        connector.connect().await.expect("target db");
        connector.exec(&self.target_ddl, &[]).await.expect("target ddl");
        connector.disconnect().await.expect("target close");

        let repo = Arc::new(MemoryRepository::new());
        let data_source_id = Uuid::new_v4();
        let web_source_id = Uuid::new_v4();
        let assignment_id = Uuid::new_v4();
        let now = chrono::Utc::now();

        repo.insert_data_source(DataSource {
            id: data_source_id,
            name: "target-db".to_string(),
            db_type: DbType::Sqlite,
            host: String::new(),
            port: 0,
            database: db_path.to_string_lossy().into_owned(),
            username: String::new(),
            password: String::new(),
            ssl_enabled: false,
            connection_status: ConnectionStatus::Unknown,
            last_tested_at: None,
            created_at: now,
            updated_at: now,
        })
        .await;

        repo.insert_web_source(WebSource {
            id: web_source_id,
            name: "listing".to_string(),
            base_url: self.base_url.clone(),
            is_list_mode: self.is_list_mode,
            url_list: self.url_list.clone(),
            scraper_type: ScraperType::Http,
            auth_type: AuthType::None,
            auth_config: None,
            request_delay_ms: self.request_delay_ms,
            max_concurrent: 2,
            pagination_type: self.pagination_type,
            pagination_config: self.pagination_config.clone(),
            timeout_seconds: 10,
            created_at: now,
            updated_at: now,
        })
        .await;

        repo.insert_assignment(Assignment {
            id: assignment_id,
            name: "scenario".to_string(),
            data_source_id,
            web_source_id,
            start_url: self.start_url.clone(),
            target_schema: String::new(),
            target_table: self.target_table.clone(),
            sync_mode: self.sync_mode,
            schedule_type: ScheduleType::Manual,
            cron_expression: None,
            status: AssignmentStatus::Active,
            extraction_method: self.extraction_method,
            llm_capture_config: self.capture_config.clone(),
            last_run_at: None,
            created_at: now,
            updated_at: now,
        })
        .await;

        let rules: Vec<ExtractionRule> = self
            .rules
            .iter()
            .enumerate()
            .map(|(i, (column, selector, data_type, transform))| ExtractionRule {
                id: Uuid::new_v4(),
                assignment_id,
                target_column: column.clone(),
                selector: selector.clone(),
                selector_type: SelectorType::Css,
                attribute: "text".to_string(),
                transform_type: transform.as_ref().map(|(t, _)| *t),
                transform_config: transform.as_ref().map(|(_, c)| c.clone()),
                default_value: None,
                data_type: *data_type,
                is_required: false,
                validation_regex: None,
                is_active: true,
                sort_order: i as i32,
            })
            .collect();
        repo.rules_replace_all(assignment_id, &rules)
            .await
            .expect("seed rules");

        let mut settings = Settings::default();
        settings.staging.root = staging_root.clone();
        settings.staging.inline_threshold_bytes = self.inline_threshold;

        let engine = build_engine_with(
            &settings,
            repo.clone(),
            Arc::new(StubLlm::new(self.llm_responses)),
            Arc::new(PlaintextSecretBox),
        );

        Fixture {
            engine,
            repo,
            assignment_id,
            db_path,
            staging_root,
            _dir: dir,
        }
    }
}

pub struct Fixture {
    pub engine: Engine,
    pub repo: Arc<MemoryRepository>,
    pub assignment_id: Uuid,
    pub db_path: PathBuf,
    pub staging_root: PathBuf,
    _dir: tempfile::TempDir,
}

impl Fixture {
    /// Poll until the job leaves its non-terminal states
    pub async fn wait_for_terminal(&self, job_id: Uuid) -> common::models::ExtractionJob {
        for _ in 0..300 {
            let job = self
                .repo
                .job_get(job_id)
                .await
                .expect("job lookup")
                .expect("job exists");
            if job.status.is_terminal() || job.status == JobStatus::Staging {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {} did not settle in time", job_id);
    }

    pub async fn count_target_rows(&self, table: &str) -> i64 {
        let connector = SqliteConnector::from_path(&self.db_path);
        connector.connect().await.expect("target db");
        let rows = connector
            .query(&format!("SELECT COUNT(*) AS n FROM {}", table), &[])
            .await
            .expect("count query");
        connector.disconnect().await.expect("target close");
        rows[0]["n"].as_i64().expect("count value")
    }

    pub fn staging_file(&self, job_id: Uuid) -> PathBuf {
        self.staging_root.join(format!("{}.json", job_id))
    }
}

/// Canonical three-item listing page
pub fn listing_page(items: &[(&str, &str)]) -> String {
    let rows = items
        .iter()
        .map(|(name, price)| {
            format!(
                r#"<div class="p"><span class="name">{}</span><span class="price">{}</span></div>"#,
                name, price
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!("<html><body>\n{}\n</body></html>", rows)
}
