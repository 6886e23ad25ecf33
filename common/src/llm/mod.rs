// LLM transport port and the OpenAI-compatible implementation
//
// The analyzer and capture runtime only ever speak through `LlmClient`, so
// tests stub the provider and production wiring picks the HTTP client.

pub mod analyze;
pub mod capture;

pub use analyze::{analyze_page, ColumnAnalysis};
pub use capture::{build_capture_config, extract_structured, json_type_for};

use crate::config::LlmConfig;
use crate::errors::LlmError;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// What shape of response the call demands
#[derive(Debug, Clone)]
pub enum ResponseFormat {
    Text,
    JsonObject,
    JsonSchema(Value),
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub temperature: f32,
    pub messages: Vec<ChatMessage>,
    pub response_format: ResponseFormat,
}

/// The only way the core speaks to an LLM provider
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError>;
}

/// OpenAI-compatible chat-completions client
pub struct OpenAiChatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiChatClient {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(60)))
            .build()
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().unwrap_or_default(),
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiChatClient {
    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        #[derive(Serialize)]
        struct ApiRequest<'a> {
            model: &'a str,
            temperature: f32,
            messages: &'a [ChatMessage],
            #[serde(skip_serializing_if = "Option::is_none")]
            response_format: Option<Value>,
        }

        #[derive(Deserialize)]
        struct ApiResponse {
            choices: Vec<ApiChoice>,
        }

        #[derive(Deserialize)]
        struct ApiChoice {
            message: ApiMessage,
        }

        #[derive(Deserialize)]
        struct ApiMessage {
            content: String,
        }

        let response_format = match &request.response_format {
            ResponseFormat::Text => None,
            ResponseFormat::JsonObject => Some(json!({"type": "json_object"})),
            ResponseFormat::JsonSchema(schema) => Some(json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "extraction",
                    "schema": schema,
                },
            })),
        };

        let body = ApiRequest {
            model: &request.model,
            temperature: request.temperature,
            messages: &request.messages,
            response_format,
        };

        debug!("calling chat completions endpoint");
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiStatus {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ApiResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::MissingField("choices[0].message.content".to_string()))
    }
}

// ============================================================================
// Prompt input preparation
// ============================================================================

/// Body-text excerpt cap sent to the model
pub const MAX_TEXT_EXCERPT: usize = 8_000;
/// Main-content HTML excerpt cap sent to the model
pub const MAX_HTML_EXCERPT: usize = 12_000;

lazy_static! {
    static ref STRIP_BLOCKS_RE: Regex = Regex::new(
        r"(?is)<(script|style|noscript|svg|nav|footer|header)\b.*?</(script|style|noscript|svg|nav|footer|header)>"
    )
    .expect("static regex");
    static ref MAIN_CONTENT_RE: Regex =
        Regex::new(r"(?is)<(main|article)\b.*?</(main|article)>").expect("static regex");
    static ref WHITESPACE_RE: Regex = Regex::new(r"\s+").expect("static regex");
}

/// Cleaned inputs an extraction prompt is built from
#[derive(Debug, Clone)]
pub struct PageExcerpts {
    pub text: String,
    pub html: String,
}

/// Reduce a fetched page to the excerpts the prompts carry: visible body
/// text (chrome stripped) and a main-content HTML slice, both capped.
pub fn page_excerpts(html: &str) -> PageExcerpts {
    let stripped = STRIP_BLOCKS_RE.replace_all(html, " ");

    let document = scraper::Html::parse_document(&stripped);
    let mut text = WHITESPACE_RE
        .replace_all(
            &document.root_element().text().collect::<Vec<_>>().join(" "),
            " ",
        )
        .trim()
        .to_string();
    truncate_on_char_boundary(&mut text, MAX_TEXT_EXCERPT);

    let mut content_html = MAIN_CONTENT_RE
        .find(&stripped)
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| stripped.into_owned());
    truncate_on_char_boundary(&mut content_html, MAX_HTML_EXCERPT);

    PageExcerpts {
        text,
        html: content_html,
    }
}

fn truncate_on_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

/// Unwrap a response body from markdown code fences, if any
pub fn strip_markdown_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.trim_end_matches('`').trim()
}

/// Parse an LLM response that must be a JSON object
pub fn parse_json_response(content: &str) -> Result<Value, LlmError> {
    let cleaned = strip_markdown_fences(content);
    serde_json::from_str(cleaned).map_err(|e| LlmError::MalformedResponse(e.to_string()))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Scripted client: pops canned responses in order
    pub struct ScriptedLlm {
        responses: Mutex<Vec<Result<String, LlmError>>>,
        pub requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedLlm {
        pub fn new(responses: Vec<Result<String, LlmError>>) -> Self {
            let mut reversed = responses;
            reversed.reverse();
            Self {
                responses: Mutex::new(reversed),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn replying(content: &str) -> Self {
            Self::new(vec![Ok(content.to_string())])
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(LlmError::RequestFailed("script exhausted".to_string())))
        }
    }
}
