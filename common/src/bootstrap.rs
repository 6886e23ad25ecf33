// Process wiring helpers shared by binaries

use crate::audit::{AuditSink, TracingAuditSink};
use crate::clock::{Clock, SystemClock};
use crate::config::Settings;
use crate::db::{DbPool, PgRepository, Repository};
use crate::errors::RepositoryError;
use crate::executor::{DefaultScraperFactory, ExtractionExecutor, ScraperFactory};
use crate::llm::{LlmClient, OpenAiChatClient};
use crate::scheduler::SchedulerEngine;
use crate::secrets::{PlaintextSecretBox, SecretBox};
use crate::service::{AnalysisService, ExtractionService};
use crate::staging::StagingStore;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

/// The wired-up engine: everything a binary needs to serve and schedule
pub struct Engine {
    pub repo: Arc<dyn Repository>,
    pub executor: Arc<ExtractionExecutor>,
    pub scheduler: Arc<SchedulerEngine>,
    pub extraction: ExtractionService,
    pub analysis: AnalysisService,
}

/// Connect the repository database and run pending migrations
pub async fn init_database_pool(settings: &Settings) -> Result<DbPool, RepositoryError> {
    let pool = DbPool::connect(&settings.database).await?;
    pool.run_migrations().await?;
    info!("repository database connected");
    Ok(pool)
}

/// Production wiring: Postgres repository, OpenAI-compatible LLM client,
/// system clock, tracing audit sink, plaintext secret box. Deployments with
/// encrypted credentials swap the secret box via `build_engine_with`.
pub async fn build_engine(settings: &Settings) -> Result<Engine> {
    let pool = init_database_pool(settings)
        .await
        .context("connecting repository database")?;
    let repo: Arc<dyn Repository> = Arc::new(PgRepository::new(pool));

    let llm: Arc<dyn LlmClient> = Arc::new(
        OpenAiChatClient::new(&settings.llm).context("building LLM client")?,
    );
    let secret_box: Arc<dyn SecretBox> = Arc::new(PlaintextSecretBox);

    Ok(build_engine_with(settings, repo, llm, secret_box))
}

/// Wiring with injectable ports, shared by production and tests
pub fn build_engine_with(
    settings: &Settings,
    repo: Arc<dyn Repository>,
    llm: Arc<dyn LlmClient>,
    secret_box: Arc<dyn SecretBox>,
) -> Engine {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    let staging = Arc::new(StagingStore::new(
        settings.staging.root.clone(),
        settings.staging.inline_threshold_bytes,
    ));
    let scraper_factory: Arc<dyn ScraperFactory> = Arc::new(DefaultScraperFactory {
        defaults: settings.scraper.clone(),
    });

    let executor = Arc::new(ExtractionExecutor::new(
        repo.clone(),
        secret_box.clone(),
        llm.clone(),
        audit,
        clock.clone(),
        staging.clone(),
        scraper_factory.clone(),
    ));

    let timezone = settings
        .scheduler
        .timezone
        .parse()
        .unwrap_or(chrono_tz::UTC);
    let scheduler = Arc::new(SchedulerEngine::with_timezone(
        repo.clone(),
        executor.clone(),
        clock,
        timezone,
    ));

    let extraction = ExtractionService::new(
        scheduler.clone(),
        executor.clone(),
        repo.clone(),
        staging,
    );
    let analysis = AnalysisService::new(
        repo.clone(),
        llm,
        secret_box,
        scraper_factory,
        settings.llm.model.clone(),
    );

    Engine {
        repo,
        executor,
        scheduler,
        extraction,
        analysis,
    }
}
