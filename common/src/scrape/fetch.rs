// Page fetchers: plain HTTP, managed headless browser, and the hybrid mode
// that falls back from HTTP to the browser on thin or client-rendered pages.

use crate::config::ScraperDefaults;
use crate::errors::ScrapeError;
use crate::models::{AuthConfig, ScraperType, WebSource};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// Markers that identify a client-rendered shell page
const CLIENT_RENDERED_MARKERS: &[&str] = &[
    "<div id=\"root\"></div>",
    "<div id=\"app\"></div>",
    "data-reactroot",
    "__NEXT_DATA__",
    "ng-version=",
];

/// Retrieval seam between the scraper and the network, so tests can stub
/// pages without a server.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, ScrapeError>;

    /// Release held resources (browser process, pools). Idempotent.
    async fn shutdown(&self) {}
}

/// Build the fetcher a web source asks for
pub fn fetcher_for(
    source: &WebSource,
    defaults: &ScraperDefaults,
) -> Result<Box<dyn PageFetcher>, ScrapeError> {
    let timeout = Duration::from_secs(if source.timeout_seconds > 0 {
        source.timeout_seconds
    } else {
        defaults.fetch_timeout_seconds
    });
    let connect_timeout = Duration::from_secs(defaults.connect_timeout_seconds);
    let auth = source.auth();

    match source.scraper_type {
        ScraperType::Http => Ok(Box::new(HttpFetcher::new(
            timeout,
            connect_timeout,
            auth,
        )?)),
        ScraperType::Browser => Ok(Box::new(BrowserFetcher::new(timeout, auth))),
        ScraperType::Hybrid => Ok(Box::new(HybridFetcher {
            http: HttpFetcher::new(timeout, connect_timeout, auth.clone())?,
            browser: BrowserFetcher::new(timeout, auth),
            min_text_bytes: defaults.hybrid_min_text_bytes,
        })),
    }
}

// ============================================================================
// HTTP mode
// ============================================================================

pub struct HttpFetcher {
    client: reqwest::Client,
    auth: AuthConfig,
}

impl HttpFetcher {
    pub fn new(
        timeout: Duration,
        connect_timeout: Duration,
        auth: AuthConfig,
    ) -> Result<Self, ScrapeError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HTML));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ScrapeError::FetchFailed {
                url: String::new(),
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self { client, auth })
    }

    /// Apply the configured authentication to one request
    fn apply_auth(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            AuthConfig::None => request,
            AuthConfig::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            AuthConfig::Header { headers } => {
                for (name, value) in headers {
                    request = request.header(name.as_str(), value.as_str());
                }
                request
            }
            AuthConfig::Cookie { cookies } => {
                // HTTP mode carries browser cookies as one serialized header
                let serialized = cookies
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join("; ");
                request.header(reqwest::header::COOKIE, serialized)
            }
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, url: &str) -> Result<String, ScrapeError> {
        let request = self.apply_auth(self.client.get(url));
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        debug!(bytes = body.len(), "page fetched");
        Ok(body)
    }
}

// ============================================================================
// Browser mode
// ============================================================================

struct BrowserHandle {
    browser: Browser,
    event_loop: JoinHandle<()>,
}

/// One long-lived headless browser per scraper instance; each fetch gets its
/// own page which is always closed before the fetch returns.
pub struct BrowserFetcher {
    timeout: Duration,
    auth: AuthConfig,
    handle: Mutex<Option<BrowserHandle>>,
}

impl BrowserFetcher {
    pub fn new(timeout: Duration, auth: AuthConfig) -> Self {
        Self {
            timeout,
            auth,
            handle: Mutex::new(None),
        }
    }

    async fn ensure_browser(&self) -> Result<(), ScrapeError> {
        let mut guard = self.handle.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let config = BrowserConfig::builder()
            .no_sandbox()
            .build()
            .map_err(ScrapeError::Browser)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| ScrapeError::Browser(e.to_string()))?;

        let event_loop = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        debug!("headless browser launched");
        *guard = Some(BrowserHandle {
            browser,
            event_loop,
        });
        Ok(())
    }

    async fn fetch_with_page(&self, url: &str) -> Result<String, ScrapeError> {
        self.ensure_browser().await?;
        let guard = self.handle.lock().await;
        let handle = guard.as_ref().ok_or_else(|| {
            ScrapeError::Browser("browser disappeared during fetch".to_string())
        })?;

        let page = handle
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| ScrapeError::Browser(e.to_string()))?;

        let result = async {
            if let AuthConfig::Cookie { cookies } = &self.auth {
                let params = cookies
                    .iter()
                    .filter_map(|(name, value)| {
                        CookieParam::builder()
                            .name(name.clone())
                            .value(value.clone())
                            .url(url.to_string())
                            .build()
                            .ok()
                    })
                    .collect::<Vec<_>>();
                page.set_cookies(params)
                    .await
                    .map_err(|e| ScrapeError::Browser(e.to_string()))?;
            }

            page.goto(url)
                .await
                .map_err(|e| ScrapeError::Browser(e.to_string()))?;
            // network-idle settle plus a short wait for the body element
            page.wait_for_navigation()
                .await
                .map_err(|e| ScrapeError::Browser(e.to_string()))?;
            let _ = tokio::time::timeout(Duration::from_secs(2), page.find_element("body")).await;

            page.content()
                .await
                .map_err(|e| ScrapeError::Browser(e.to_string()))
        };

        let content = tokio::time::timeout(self.timeout, result)
            .await
            .map_err(|_| ScrapeError::FetchFailed {
                url: url.to_string(),
                reason: "browser fetch timed out".to_string(),
            })?;

        if let Err(e) = page.close().await {
            warn!(error = %e, "failed to close browser page");
        }

        content
    }
}

#[async_trait]
impl PageFetcher for BrowserFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, url: &str) -> Result<String, ScrapeError> {
        self.fetch_with_page(url).await
    }

    async fn shutdown(&self) {
        if let Some(mut handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.browser.close().await {
                warn!(error = %e, "failed to close browser");
            }
            let _ = handle.browser.wait().await;
            handle.event_loop.abort();
        }
    }
}

// ============================================================================
// Hybrid mode
// ============================================================================

/// HTTP first; retry with the browser when the response looks client-rendered
pub struct HybridFetcher {
    pub(crate) http: HttpFetcher,
    pub(crate) browser: BrowserFetcher,
    pub(crate) min_text_bytes: usize,
}

/// Visible text length of an HTML document, after tag stripping
pub fn visible_text_len(html: &str) -> usize {
    let document = scraper::Html::parse_document(html);
    document.root_element().text().map(|t| t.trim().len()).sum()
}

pub fn looks_client_rendered(html: &str, min_text_bytes: usize) -> bool {
    if visible_text_len(html) < min_text_bytes {
        return true;
    }
    CLIENT_RENDERED_MARKERS.iter().any(|m| html.contains(m))
}

#[async_trait]
impl PageFetcher for HybridFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, url: &str) -> Result<String, ScrapeError> {
        match self.http.fetch(url).await {
            Ok(body) if !looks_client_rendered(&body, self.min_text_bytes) => Ok(body),
            Ok(_) => {
                debug!("thin or client-rendered response, retrying with browser");
                self.browser.fetch(url).await
            }
            Err(e) => {
                debug!(error = %e, "HTTP fetch failed, retrying with browser");
                self.browser.fetch(url).await
            }
        }
    }

    async fn shutdown(&self) {
        self.browser.shutdown().await;
    }
}
