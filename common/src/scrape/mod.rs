// Scraper: fetch pages for a web source, extract rows, discover structure

pub mod analyze;
pub mod extract;
pub mod fetch;
pub mod limiter;
pub mod pagination;

pub use analyze::{DetectedField, RepeatingElement, WebsiteStructure};
pub use extract::{extract_rows, ExtractedRow};
pub use fetch::{fetcher_for, BrowserFetcher, HttpFetcher, HybridFetcher, PageFetcher};
pub use limiter::FetchGate;
pub use pagination::{detect_pagination, find_next_url, generate_paginated_urls};

use crate::config::ScraperDefaults;
use crate::errors::ScrapeError;
use crate::models::{ExtractionRule, PaginationConfig, WebSource};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// One scraper per job, constructed from the assignment's web source. Holds
/// the fetcher (and with it any headless browser) plus the fetch gate that
/// enforces the source's concurrency cap and request spacing.
pub struct Scraper {
    source: WebSource,
    fetcher: Arc<dyn PageFetcher>,
    gate: FetchGate,
}

impl Scraper {
    pub fn new(source: WebSource, defaults: &ScraperDefaults) -> Result<Self, ScrapeError> {
        let fetcher: Arc<dyn PageFetcher> = Arc::from(fetcher_for(&source, defaults)?);
        Ok(Self::with_fetcher(source, fetcher))
    }

    /// Injection seam: tests supply a stub fetcher
    pub fn with_fetcher(source: WebSource, fetcher: Arc<dyn PageFetcher>) -> Self {
        let gate = FetchGate::new(
            source.max_concurrent(),
            Duration::from_millis(source.request_delay_ms),
        );
        Self {
            source,
            fetcher,
            gate,
        }
    }

    pub fn source(&self) -> &WebSource {
        &self.source
    }

    /// Fetch one page, honouring the source's rate limits and the job's
    /// cancellation token.
    #[instrument(skip(self, cancel))]
    pub async fn fetch_html(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ScrapeError> {
        let _permit = self.gate.admit(cancel).await?;
        tokio::select! {
            _ = cancel.cancelled() => Err(ScrapeError::Cancelled),
            result = self.fetcher.fetch(url) => result,
        }
    }

    /// Apply extraction rules to already-fetched HTML
    pub fn extract(
        &self,
        html: &str,
        rules: &[ExtractionRule],
    ) -> Result<Vec<ExtractedRow>, ScrapeError> {
        extract::extract_rows(html, rules)
    }

    /// Fetch a page and look for pagination affordances on it
    pub async fn detect_pagination(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<PaginationConfig>, ScrapeError> {
        let html = self.fetch_html(url, cancel).await?;
        Ok(pagination::detect_pagination(&html, url))
    }

    /// Expand the base URL into the page sequence described by `config`
    pub fn generate_paginated_urls(
        &self,
        base: &str,
        config: &PaginationConfig,
        cap: u32,
    ) -> Result<Vec<String>, ScrapeError> {
        pagination::generate_paginated_urls(base, config, cap)
    }

    /// Fetch a page and describe its structure
    pub async fn analyze_structure(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<WebsiteStructure, ScrapeError> {
        let html = self.fetch_html(url, cancel).await?;
        Ok(analyze::analyze_structure(&html, url))
    }

    /// Release the fetcher's resources (browser process, pools)
    pub async fn shutdown(&self) {
        self.fetcher.shutdown().await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Canned-page fetcher for unit tests
    pub struct StubFetcher {
        pages: HashMap<String, String>,
    }

    impl StubFetcher {
        pub fn new(pages: impl IntoIterator<Item = (String, String)>) -> Self {
            Self {
                pages: pages.into_iter().collect(),
            }
        }
    }

    #[async_trait]
    impl PageFetcher for StubFetcher {
        async fn fetch(&self, url: &str) -> Result<String, ScrapeError> {
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| ScrapeError::HttpStatus {
                    url: url.to_string(),
                    status: 404,
                })
        }
    }
}
