// Error handling framework

use thiserror::Error;

/// Assignment/config validation errors raised before any job is created
#[derive(Error, Debug)]
pub enum ConfigIssue {
    #[error("Assignment not found: {0}")]
    AssignmentNotFound(uuid::Uuid),

    #[error("Data source not found: {0}")]
    DataSourceNotFound(uuid::Uuid),

    #[error("Web source not found: {0}")]
    WebSourceNotFound(uuid::Uuid),

    #[error("Selector extraction requires at least one active rule")]
    NoActiveRules,

    #[error("LLM extraction requires a capture config")]
    MissingCaptureConfig,

    #[error("Capture config is not parseable: {0}")]
    MalformedCaptureConfig(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Database connector errors
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection test failed: {0}")]
    ProbeFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Schema discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Unsupported parameter value for {dialect}: {value}")]
    UnsupportedParameter { dialect: String, value: String },

    #[error("Connector is not connected")]
    NotConnected,
}

/// Page fetch / extraction errors
#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("Fetch failed for {url}: {reason}")]
    FetchFailed { url: String, reason: String },

    #[error("HTTP status {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("Unsupported xpath expression: {0}")]
    UnsupportedXpath(String),

    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Fetch cancelled")]
    Cancelled,
}

/// LLM transport and response errors
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    RequestFailed(String),

    #[error("LLM returned status {status}: {body}")]
    ApiStatus { status: u16, body: String },

    #[error("LLM response was not valid JSON: {0}")]
    MalformedResponse(String),

    #[error("LLM response missing expected field: {0}")]
    MissingField(String),
}

/// Job-level errors: anything that terminates a run as `failed`
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(uuid::Uuid),

    #[error(transparent)]
    InvalidConfig(#[from] ConfigIssue),

    #[error("Assignment {0} is already running")]
    AlreadyRunning(uuid::Uuid),

    #[error("Job {job_id} is {status}, expected {expected}")]
    WrongState {
        job_id: uuid::Uuid,
        status: String,
        expected: String,
    },

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Scrape(#[from] ScrapeError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("Staged payload is not valid JSON: {0}")]
    StagedPayloadCorrupt(String),

    #[error("Job cancelled")]
    Cancelled,
}

/// Schedule parsing and registration errors
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Assignment {0} has no schedulable configuration")]
    NotSchedulable(uuid::Uuid),

    #[error("Assignment {0} is already running")]
    AlreadyRunning(uuid::Uuid),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Staging store errors
#[derive(Error, Debug)]
pub enum StagingError {
    #[error("Staging I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Staged rows are not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("No staged data for job {0}")]
    NotFound(uuid::Uuid),
}

/// Repository (persistence port) errors
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Illegal job transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("record not found".to_string()),
            other => RepositoryError::QueryFailed(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for ConnectorError {
    fn from(err: sqlx::Error) -> Self {
        ConnectorError::QueryFailed(err.to_string())
    }
}

impl From<reqwest::Error> for ScrapeError {
    fn from(err: reqwest::Error) -> Self {
        ScrapeError::FetchFailed {
            url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            reason: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        LlmError::RequestFailed(err.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::MalformedResponse(err.to_string())
    }
}
