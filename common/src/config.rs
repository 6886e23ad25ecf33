// Configuration management with layered configuration (defaults, file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub scraper: ScraperDefaults,
    pub llm: LlmConfig,
    pub staging: StagingConfig,
    pub scheduler: SchedulerConfig,
    pub observability: ObservabilityConfig,
}

/// Core repository (Postgres) connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_seconds: u64,
}

/// Fetch defaults applied when a web source leaves them unset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperDefaults {
    /// Per-fetch timeout, seconds
    pub fetch_timeout_seconds: u64,
    /// TCP connect timeout, seconds
    pub connect_timeout_seconds: u64,
    /// Hybrid mode: minimum visible text bytes before falling back to browser
    pub hybrid_min_text_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    pub root: PathBuf,
    /// Payloads below this many bytes stay inline on the job record
    pub inline_threshold_bytes: usize,
}

/// Cron evaluation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// IANA timezone cron expressions are evaluated in
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgres://localhost/extractor".to_string(),
                max_connections: 10,
                connect_timeout_seconds: 10,
            },
            scraper: ScraperDefaults {
                fetch_timeout_seconds: 30,
                connect_timeout_seconds: 10,
                hybrid_min_text_bytes: 512,
            },
            llm: LlmConfig {
                model: "gpt-4o".to_string(),
                base_url: "https://api.openai.com".to_string(),
                api_key: None,
                timeout_seconds: 120,
            },
            staging: StagingConfig {
                root: PathBuf::from("./output/staging"),
                inline_threshold_bytes: 1024 * 1024,
            },
            scheduler: SchedulerConfig {
                timezone: "UTC".to_string(),
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
            },
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults, file, env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let defaults = Settings::default();

        let builder = Config::builder()
            .add_source(Config::try_from(&defaults)?)
            .add_source(
                File::from(config_dir.as_ref().join("default"))
                    .required(false),
            )
            .add_source(
                File::from(config_dir.as_ref().join("local"))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("EXTRACTOR")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut settings: Settings = builder.build()?.try_deserialize()?;
        settings.apply_compat_env();
        Ok(settings)
    }

    /// Honour the flat legacy environment keys
    fn apply_compat_env(&mut self) {
        if let Ok(root) = std::env::var("STAGING_ROOT") {
            if !root.is_empty() {
                self.staging.root = PathBuf::from(root);
            }
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            if !model.is_empty() {
                self.llm.model = model;
            }
        }
        if self.llm.api_key.is_none() {
            self.llm.api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());
        }
    }
}
