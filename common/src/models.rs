use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Data source models
// ============================================================================

/// Supported relational database engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbType {
    #[serde(rename = "postgresql")]
    PostgreSql,
    #[serde(rename = "mysql")]
    MySql,
    #[serde(rename = "mssql")]
    MsSql,
    #[serde(rename = "sqlite")]
    Sqlite,
}

impl DbType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbType::PostgreSql => "postgresql",
            DbType::MySql => "mysql",
            DbType::MsSql => "mssql",
            DbType::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection health as last observed by `test_connection`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Unknown,
    Connected,
    Failed,
}

/// A target (or source) relational database connection descriptor.
///
/// `password` holds either ciphertext or plaintext; `SecretBox::is_encrypted`
/// decides, and decryption happens only at the connector boundary. The manual
/// `Debug` impl keeps it out of logs.
#[derive(Clone, Serialize, Deserialize)]
pub struct DataSource {
    pub id: Uuid,
    pub name: String,
    pub db_type: DbType,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub ssl_enabled: bool,
    pub connection_status: ConnectionStatus,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSource")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("db_type", &self.db_type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("ssl_enabled", &self.ssl_enabled)
            .field("connection_status", &self.connection_status)
            .finish()
    }
}

// ============================================================================
// Web source models
// ============================================================================

/// How pages are fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScraperType {
    Http,
    Browser,
    Hybrid,
}

/// Authentication applied to page fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    None,
    Cookie,
    Header,
    Basic,
}

/// Pagination strategy for a listing site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationType {
    None,
    QueryParam,
    Path,
    NextButton,
}

/// Declarative description of how to enumerate pages of a listing site.
///
/// Stored as JSON on the web source; `param_name` for `query_param`,
/// `selector` for `next_button`, `url_pattern` for `path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginationConfig {
    #[serde(rename = "type")]
    pub pagination_type: PaginationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_page: Option<u32>,
}

impl PaginationConfig {
    pub const DEFAULT_MAX_PAGES: u32 = 100;

    pub fn max_pages(&self) -> u32 {
        self.max_pages.unwrap_or(Self::DEFAULT_MAX_PAGES)
    }

    pub fn start_page(&self) -> u32 {
        self.start_page.unwrap_or(1)
    }
}

/// Typed view over `WebSource.auth_config`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    None,
    Basic {
        username: String,
        password: String,
    },
    Header {
        headers: HashMap<String, String>,
    },
    Cookie {
        cookies: HashMap<String, String>,
    },
}

/// A scrape target: one base URL (or an ordered URL list) plus fetch policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSource {
    pub id: Uuid,
    pub name: String,
    pub base_url: String,
    pub is_list_mode: bool,
    pub url_list: Vec<String>,
    pub scraper_type: ScraperType,
    pub auth_type: AuthType,
    pub auth_config: Option<Value>,
    /// Delay between fetch starts, milliseconds
    pub request_delay_ms: u64,
    /// Simultaneous fetches, clamped to 1..=10
    pub max_concurrent: u32,
    pub pagination_type: PaginationType,
    pub pagination_config: Option<Value>,
    /// Per-fetch timeout, seconds
    pub timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebSource {
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.clamp(1, 10) as usize
    }

    /// Parse the pagination JSON blob, if present and well-formed
    pub fn pagination(&self) -> Option<PaginationConfig> {
        self.pagination_config
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Parse the auth JSON blob; absent or malformed means no auth
    pub fn auth(&self) -> AuthConfig {
        match self.auth_type {
            AuthType::None => AuthConfig::None,
            _ => self
                .auth_config
                .as_ref()
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or(AuthConfig::None),
        }
    }
}

// ============================================================================
// Assignment models
// ============================================================================

/// Whether extracted rows are committed immediately or staged for review
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Manual,
    Auto,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Manual => "manual",
            SyncMode::Auto => "auto",
        }
    }
}

/// Schedule shorthand stored on the assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Manual,
    Hourly,
    Daily,
    Weekly,
    Cron,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Draft,
    Testing,
    Active,
    Paused,
    Error,
}

/// How rows are pulled out of a fetched page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Selector,
    Llm,
}

/// A bound configuration: web source x data source x target table, plus the
/// extraction method and schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    pub name: String,
    pub data_source_id: Uuid,
    pub web_source_id: Uuid,
    pub start_url: Option<String>,
    pub target_schema: String,
    pub target_table: String,
    pub sync_mode: SyncMode,
    pub schedule_type: ScheduleType,
    pub cron_expression: Option<String>,
    pub status: AssignmentStatus,
    pub extraction_method: ExtractionMethod,
    pub llm_capture_config: Option<Value>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Assignment {
    /// Parse the stored capture config, if any
    pub fn capture_config(&self) -> Option<LlmCaptureConfig> {
        self.llm_capture_config
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Fully qualified target table, quoted for ANSI dialects
    pub fn qualified_table(&self) -> String {
        if self.target_schema.is_empty() {
            format!("\"{}\"", self.target_table)
        } else {
            format!("\"{}\".\"{}\"", self.target_schema, self.target_table)
        }
    }
}

// ============================================================================
// Extraction rule models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorType {
    Css,
    Xpath,
}

/// Value transformation applied after raw extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformType {
    None,
    Trim,
    Regex,
    Date,
    Number,
    Json,
}

/// Target column data type a raw string is coerced to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleDataType {
    String,
    Number,
    Boolean,
    Date,
    Json,
}

/// A single `(selector, attribute, transform, data type) -> target column`
/// mapping. Rules are ordered by `sort_order` within their assignment and
/// `target_column` is unique among an assignment's active rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRule {
    pub id: Uuid,
    pub assignment_id: Uuid,
    pub target_column: String,
    pub selector: String,
    pub selector_type: SelectorType,
    /// `text`, `html`, or any attribute name (`href`, `src`, ...)
    pub attribute: String,
    pub transform_type: Option<TransformType>,
    pub transform_config: Option<Value>,
    pub default_value: Option<String>,
    pub data_type: RuleDataType,
    pub is_required: bool,
    pub validation_regex: Option<String>,
    pub is_active: bool,
    pub sort_order: i32,
}

// ============================================================================
// LLM capture models
// ============================================================================

/// One target-column binding inside an LLM capture config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub column_name: String,
    pub json_field: String,
    pub description: String,
    pub data_type: String,
    pub is_required: bool,
}

/// A reusable structured-output prompt + JSON schema for an assignment.
///
/// `json_schema.properties.items` is an array schema whose item shape agrees
/// with `column_mappings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCaptureConfig {
    pub system_prompt: String,
    pub json_schema: Value,
    pub column_mappings: Vec<ColumnMapping>,
    pub model: String,
    pub temperature: f32,
}

// ============================================================================
// Job models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Staging,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// The job state machine. Terminal states admit no transition; `staging`
    /// may re-enter `running` for the commit phase.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Failed) | (Pending, Cancelled) => true,
            (Running, Staging) | (Running, Completed) | (Running, Failed) | (Running, Cancelled) => {
                true
            }
            (Staging, Running) | (Staging, Failed) | (Staging, Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Staging => "staging",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Manual,
    Schedule,
    Api,
}

impl TriggeredBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggeredBy::Manual => "manual",
            TriggeredBy::Schedule => "schedule",
            TriggeredBy::Api => "api",
        }
    }
}

/// A single execution of an assignment.
///
/// While `status = staging` exactly one of `staged_data_inline` /
/// `staged_data_path` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionJob {
    pub id: Uuid,
    pub assignment_id: Uuid,
    pub status: JobStatus,
    pub sync_mode: SyncMode,
    pub triggered_by: TriggeredBy,
    pub pages_total: Option<i32>,
    pub pages_processed: i32,
    pub current_url: Option<String>,
    pub rows_extracted: i64,
    pub rows_inserted: i64,
    pub rows_failed: i64,
    pub staged_row_count: i64,
    pub staged_data_inline: Option<String>,
    pub staged_data_path: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_details: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl ExtractionJob {
    /// A fresh pending job for an assignment
    pub fn pending(
        assignment_id: Uuid,
        sync_mode: SyncMode,
        triggered_by: TriggeredBy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            assignment_id,
            status: JobStatus::Pending,
            sync_mode,
            triggered_by,
            pages_total: None,
            pages_processed: 0,
            current_url: None,
            rows_extracted: 0,
            rows_inserted: 0,
            rows_failed: 0,
            staged_row_count: 0,
            staged_data_inline: None,
            staged_data_path: None,
            started_at: None,
            completed_at: None,
            error_message: None,
            error_details: None,
            created_at: now,
        }
    }
}

// ============================================================================
// Process log models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Append-only per-job progress feed, separate from process tracing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessLog {
    pub id: Uuid,
    pub job_id: Uuid,
    pub level: LogLevel,
    pub message: String,
    pub url: Option<String>,
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl ProcessLog {
    pub fn new(
        job_id: Uuid,
        level: LogLevel,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            level,
            message: message.into(),
            url: None,
            details: None,
            created_at: now,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

// ============================================================================
// Mapping models (ephemeral)
// ============================================================================

/// A proposed web-field-to-column binding; never persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingSuggestion {
    /// 0.0..=1.0
    pub confidence: f64,
    pub web_field: String,
    pub db_column: String,
    pub table_name: String,
    pub selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform_type: Option<TransformType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform_config: Option<Value>,
}

// ============================================================================
// String round-trips for sqlx `try_from = "String"` columns
// ============================================================================

macro_rules! impl_str_enum {
    ($ty:ty { $($variant:path => $s:literal),+ $(,)? }) => {
        impl TryFrom<String> for $ty {
            type Error = String;

            fn try_from(value: String) -> Result<Self, <$ty as TryFrom<String>>::Error> {
                match value.as_str() {
                    $($s => Ok($variant),)+
                    other => Err(format!(
                        concat!("invalid ", stringify!($ty), ": {}"),
                        other
                    )),
                }
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> String {
                match value {
                    $($variant => $s.to_string(),)+
                }
            }
        }
    };
}

impl_str_enum!(DbType {
    DbType::PostgreSql => "postgresql",
    DbType::MySql => "mysql",
    DbType::MsSql => "mssql",
    DbType::Sqlite => "sqlite",
});

impl_str_enum!(ConnectionStatus {
    ConnectionStatus::Unknown => "unknown",
    ConnectionStatus::Connected => "connected",
    ConnectionStatus::Failed => "failed",
});

impl_str_enum!(ScraperType {
    ScraperType::Http => "http",
    ScraperType::Browser => "browser",
    ScraperType::Hybrid => "hybrid",
});

impl_str_enum!(AuthType {
    AuthType::None => "none",
    AuthType::Cookie => "cookie",
    AuthType::Header => "header",
    AuthType::Basic => "basic",
});

impl_str_enum!(PaginationType {
    PaginationType::None => "none",
    PaginationType::QueryParam => "query_param",
    PaginationType::Path => "path",
    PaginationType::NextButton => "next_button",
});

impl_str_enum!(SyncMode {
    SyncMode::Manual => "manual",
    SyncMode::Auto => "auto",
});

impl_str_enum!(ScheduleType {
    ScheduleType::Manual => "manual",
    ScheduleType::Hourly => "hourly",
    ScheduleType::Daily => "daily",
    ScheduleType::Weekly => "weekly",
    ScheduleType::Cron => "cron",
});

impl_str_enum!(AssignmentStatus {
    AssignmentStatus::Draft => "draft",
    AssignmentStatus::Testing => "testing",
    AssignmentStatus::Active => "active",
    AssignmentStatus::Paused => "paused",
    AssignmentStatus::Error => "error",
});

impl_str_enum!(ExtractionMethod {
    ExtractionMethod::Selector => "selector",
    ExtractionMethod::Llm => "llm",
});

impl_str_enum!(SelectorType {
    SelectorType::Css => "css",
    SelectorType::Xpath => "xpath",
});

impl_str_enum!(RuleDataType {
    RuleDataType::String => "string",
    RuleDataType::Number => "number",
    RuleDataType::Boolean => "boolean",
    RuleDataType::Date => "date",
    RuleDataType::Json => "json",
});

impl_str_enum!(JobStatus {
    JobStatus::Pending => "pending",
    JobStatus::Running => "running",
    JobStatus::Staging => "staging",
    JobStatus::Completed => "completed",
    JobStatus::Failed => "failed",
    JobStatus::Cancelled => "cancelled",
});

impl_str_enum!(TriggeredBy {
    TriggeredBy::Manual => "manual",
    TriggeredBy::Schedule => "schedule",
    TriggeredBy::Api => "api",
});

impl_str_enum!(LogLevel {
    LogLevel::Debug => "debug",
    LogLevel::Info => "info",
    LogLevel::Warn => "warn",
    LogLevel::Error => "error",
});

impl_str_enum!(TransformType {
    TransformType::None => "none",
    TransformType::Trim => "trim",
    TransformType::Regex => "regex",
    TransformType::Date => "date",
    TransformType::Number => "number",
    TransformType::Json => "json",
});
