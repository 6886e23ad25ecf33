// Analysis facade: schema-aware mapping proposals and the two-phase LLM
// capture workflow, run out-of-band (no job records)

use crate::connector::{connector_for, ColumnInfo};
use crate::db::Repository;
use crate::errors::{ConfigIssue, JobError};
use crate::executor::ScraperFactory;
use crate::llm::{analyze_page, build_capture_config, ColumnAnalysis, LlmClient};
use crate::mapper::{self, DatabaseSchema};
use crate::models::{
    Assignment, DataSource, ExtractionMethod, ExtractionRule, MappingSuggestion, WebSource,
};
use crate::secrets::{resolve_password, SecretBox};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingProposal {
    pub proposed_rules: Vec<ExtractionRule>,
    pub suggestions: Vec<MappingSuggestion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaAwareSummary {
    pub total_columns: usize,
    pub mapped_columns: usize,
    pub unmapped_columns: usize,
    pub average_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaAwareAnalysis {
    pub proposed_mappings: Vec<MappingSuggestion>,
    pub summary: SchemaAwareSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmAnalysisSummary {
    pub total_columns: usize,
    pub available_columns: usize,
    pub unavailable_columns: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmAnalysisResult {
    pub assignment_id: Uuid,
    pub assignment_name: String,
    pub target_table: String,
    pub data_source_name: String,
    pub columns: Vec<ColumnAnalysis>,
    pub summary: LlmAnalysisSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureCreated {
    pub message: String,
    pub capture_config: crate::models::LlmCaptureConfig,
}

pub struct AnalysisService {
    repo: Arc<dyn Repository>,
    llm: Arc<dyn LlmClient>,
    secret_box: Arc<dyn SecretBox>,
    scraper_factory: Arc<dyn ScraperFactory>,
    model: String,
}

impl AnalysisService {
    pub fn new(
        repo: Arc<dyn Repository>,
        llm: Arc<dyn LlmClient>,
        secret_box: Arc<dyn SecretBox>,
        scraper_factory: Arc<dyn ScraperFactory>,
        model: String,
    ) -> Self {
        Self {
            repo,
            llm,
            secret_box,
            scraper_factory,
            model,
        }
    }

    /// Propose extraction rules for an assignment by matching its page
    /// structure against the target table
    #[instrument(skip(self))]
    pub async fn suggest_mappings(&self, assignment_id: Uuid) -> Result<MappingProposal, JobError> {
        let (assignment, data_source, web_source) = self.load(assignment_id).await?;

        let schema = self.discover_schema(&data_source).await?;
        let structure = self.analyze_page_structure(&assignment, &web_source).await?;

        let suggestions = mapper::suggest_mappings(
            Some(self.llm.as_ref()),
            &schema,
            &structure,
            Some(&assignment.target_table),
            &self.model,
        )
        .await;

        let proposed_rules =
            mapper::mappings_to_extraction_rules(&suggestions, assignment_id, &structure, &schema);

        Ok(MappingProposal {
            proposed_rules,
            suggestions,
        })
    }

    /// Full-schema view: map a web source's fields against every table of an
    /// assignment's target database
    #[instrument(skip(self))]
    pub async fn analyze_with_schema(
        &self,
        web_source_id: Uuid,
        assignment_id: Uuid,
    ) -> Result<SchemaAwareAnalysis, JobError> {
        let (assignment, data_source, _) = self.load(assignment_id).await?;
        let web_source = self
            .repo
            .web_source_get(web_source_id)
            .await?
            .ok_or(ConfigIssue::WebSourceNotFound(web_source_id))?;

        let schema = self.discover_schema(&data_source).await?;
        let structure = self.analyze_page_structure(&assignment, &web_source).await?;

        let proposed_mappings = mapper::suggest_mappings(
            Some(self.llm.as_ref()),
            &schema,
            &structure,
            Some(&assignment.target_table),
            &self.model,
        )
        .await;

        let total_columns = schema
            .find_table(&assignment.target_table)
            .map(|t| t.columns.len())
            .unwrap_or(0);
        let mapped_columns = {
            let mut mapped: Vec<&str> = proposed_mappings
                .iter()
                .map(|m| m.db_column.as_str())
                .collect();
            mapped.sort_unstable();
            mapped.dedup();
            mapped.len()
        };
        let average_confidence = if proposed_mappings.is_empty() {
            0.0
        } else {
            proposed_mappings.iter().map(|m| m.confidence).sum::<f64>()
                / proposed_mappings.len() as f64
        };

        Ok(SchemaAwareAnalysis {
            summary: SchemaAwareSummary {
                total_columns,
                mapped_columns,
                unmapped_columns: total_columns.saturating_sub(mapped_columns),
                average_confidence,
            },
            proposed_mappings,
        })
    }

    /// Phase one of LLM capture: per-column availability verdicts for the
    /// assignment's start page
    #[instrument(skip(self))]
    pub async fn llm_analyze(&self, assignment_id: Uuid) -> Result<LlmAnalysisResult, JobError> {
        let (assignment, data_source, web_source) = self.load(assignment_id).await?;
        let columns = self.target_columns(&assignment, &data_source).await?;

        let url = start_url(&assignment, &web_source);
        let html = self.fetch_page(&web_source, &url).await?;

        let analyses = analyze_page(self.llm.as_ref(), &html, &columns, &url, &self.model).await;
        let available = analyses.iter().filter(|a| a.is_available).count();

        Ok(LlmAnalysisResult {
            assignment_id,
            assignment_name: assignment.name,
            target_table: assignment.target_table,
            data_source_name: data_source.name,
            summary: LlmAnalysisSummary {
                total_columns: analyses.len(),
                available_columns: available,
                unavailable_columns: analyses.len() - available,
            },
            columns: analyses,
        })
    }

    /// Phase two: build the reusable capture config from accepted columns,
    /// persist it and flip the assignment to llm extraction
    #[instrument(skip(self, columns))]
    pub async fn llm_create_capture(
        &self,
        assignment_id: Uuid,
        columns: Vec<ColumnAnalysis>,
    ) -> Result<CaptureCreated, JobError> {
        let (assignment, data_source, _) = self.load(assignment_id).await?;
        let table_columns = self.target_columns(&assignment, &data_source).await?;

        let capture = build_capture_config(
            self.llm.as_ref(),
            &columns,
            &table_columns,
            &assignment.target_table,
            &self.model,
        )
        .await;

        let config_json = serde_json::to_value(&capture)
            .map_err(|e| ConfigIssue::MalformedCaptureConfig(e.to_string()))?;
        self.repo
            .assignment_update_capture_config(assignment_id, config_json)
            .await?;
        self.repo
            .assignment_update_extraction_method(assignment_id, ExtractionMethod::Llm)
            .await?;

        Ok(CaptureCreated {
            message: format!(
                "Capture config created with {} column mappings",
                capture.column_mappings.len()
            ),
            capture_config: capture,
        })
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn load(
        &self,
        assignment_id: Uuid,
    ) -> Result<(Assignment, DataSource, WebSource), JobError> {
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
        Ok((assignment, data_source, web_source))
    }

    async fn discover_schema(&self, data_source: &DataSource) -> Result<DatabaseSchema, JobError> {
        let password = resolve_password(self.secret_box.as_ref(), &data_source.password)
            .map_err(|e| ConfigIssue::Invalid(e.to_string()))?;
        let connector = connector_for(data_source, password);
        connector.connect().await?;
        let tables = connector.list_tables().await;
        let _ = connector.disconnect().await;
        Ok(mapper::analyze_database(tables?))
    }

    async fn target_columns(
        &self,
        assignment: &Assignment,
        data_source: &DataSource,
    ) -> Result<Vec<ColumnInfo>, JobError> {
        let schema = self.discover_schema(data_source).await?;
        let table = schema
            .find_table(&assignment.target_table)
            .ok_or_else(|| {
                ConfigIssue::Invalid(format!(
                    "target table {} not found in data source",
                    assignment.target_table
                ))
            })?;
        Ok(table.columns.clone())
    }

    async fn analyze_page_structure(
        &self,
        assignment: &Assignment,
        web_source: &WebSource,
    ) -> Result<crate::scrape::WebsiteStructure, JobError> {
        let url = start_url(assignment, web_source);
        let scraper = self.scraper_factory.build(web_source.clone())?;
        let cancel = CancellationToken::new();
        let result = scraper.analyze_structure(&url, &cancel).await;
        scraper.shutdown().await;
        Ok(result?)
    }

    async fn fetch_page(&self, web_source: &WebSource, url: &str) -> Result<String, JobError> {
        let scraper = self.scraper_factory.build(web_source.clone())?;
        let cancel = CancellationToken::new();
        let result = scraper.fetch_html(url, &cancel).await;
        scraper.shutdown().await;
        Ok(result?)
    }
}

fn start_url(assignment: &Assignment, web_source: &WebSource) -> String {
    assignment
        .start_url
        .clone()
        .unwrap_or_else(|| web_source.base_url.clone())
}
