// Phase one of LLM capture: rate how well each target column can be filled
// from a page

use super::{page_excerpts, parse_json_response, ChatMessage, CompletionRequest, LlmClient, ResponseFormat};
use crate::connector::ColumnInfo;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

/// Per-column availability verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnAnalysis {
    pub column_name: String,
    pub is_available: bool,
    /// 0.0..=1.0
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_value: Option<String>,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_hint: Option<String>,
}

const AUTO_GENERATED_REASON: &str = "Auto-generated column";
const FAILURE_REASON: &str = "LLM analysis failed";

/// Timestamp column names the database fills in by itself
const AUTO_TIMESTAMP_NAMES: &[&str] = &[
    "created_at",
    "updated_at",
    "createdat",
    "updatedat",
    "created_on",
    "updated_on",
];

/// Identity primary keys and bookkeeping timestamps are never scraped
pub fn is_auto_generated(column: &ColumnInfo) -> bool {
    let lowered_name = column.name.to_lowercase();
    if AUTO_TIMESTAMP_NAMES.contains(&lowered_name.as_str()) {
        return true;
    }

    if column.is_primary_key {
        let lowered_type = column.data_type.to_lowercase();
        let integral = ["int", "serial", "identity", "number"]
            .iter()
            .any(|t| lowered_type.contains(t));
        let defaulted = column
            .default_value
            .as_deref()
            .map(|d| {
                let d = d.to_lowercase();
                d.contains("nextval") || d.contains("identity") || d.contains("autoincrement")
            })
            .unwrap_or(false);
        return integral || defaulted;
    }

    false
}

/// Analyze a page against the target columns. The model sees a cleaned text
/// excerpt, a main-content HTML slice and the column descriptions, and must
/// answer with a fixed JSON shape. On any failure every non-auto column
/// degrades to unavailable.
#[instrument(skip(client, html, columns), fields(column_count = columns.len()))]
pub async fn analyze_page(
    client: &dyn LlmClient,
    html: &str,
    columns: &[ColumnInfo],
    url: &str,
    model: &str,
) -> Vec<ColumnAnalysis> {
    let mut results: Vec<ColumnAnalysis> = Vec::with_capacity(columns.len());
    let mut to_analyze: Vec<&ColumnInfo> = Vec::new();

    for column in columns {
        if is_auto_generated(column) {
            results.push(ColumnAnalysis {
                column_name: column.name.clone(),
                is_available: false,
                confidence: 0.0,
                sample_value: None,
                reasoning: AUTO_GENERATED_REASON.to_string(),
                extraction_hint: None,
            });
        } else {
            to_analyze.push(column);
        }
    }

    if to_analyze.is_empty() {
        return results;
    }

    let excerpts = page_excerpts(html);
    let column_list = to_analyze
        .iter()
        .map(|c| {
            format!(
                "- {} ({}, {})",
                c.name,
                c.data_type,
                if c.nullable { "nullable" } else { "required" }
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let system = "You analyze web pages for structured data extraction. For each \
        database column, judge whether the page contains data that could fill it. \
        Respond with JSON: {\"columns\": [{\"columnName\": string, \"isAvailable\": bool, \
        \"confidence\": number, \"sampleValue\": string|null, \"reasoning\": string, \
        \"extractionHint\": string|null}]}";

    let user = format!(
        "Page URL: {url}\n\nTarget columns:\n{column_list}\n\nVisible page text:\n{text}\n\nMain content HTML:\n{html}",
        url = url,
        column_list = column_list,
        text = excerpts.text,
        html = excerpts.html,
    );

    let request = CompletionRequest {
        model: model.to_string(),
        temperature: 0.1,
        messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
        response_format: ResponseFormat::JsonObject,
    };

    let parsed = match client.complete(request).await {
        Ok(content) => parse_json_response(&content),
        Err(e) => Err(e),
    };

    match parsed {
        Ok(value) => {
            let verdicts = value
                .get("columns")
                .and_then(|c| c.as_array())
                .cloned()
                .unwrap_or_default();

            for column in to_analyze {
                let verdict = verdicts.iter().find(|v| {
                    v.get("columnName").and_then(|n| n.as_str()) == Some(column.name.as_str())
                });
                results.push(match verdict {
                    Some(v) => ColumnAnalysis {
                        column_name: column.name.clone(),
                        is_available: v
                            .get("isAvailable")
                            .and_then(|b| b.as_bool())
                            .unwrap_or(false),
                        confidence: v
                            .get("confidence")
                            .and_then(|c| c.as_f64())
                            .unwrap_or(0.0)
                            .clamp(0.0, 1.0),
                        sample_value: v
                            .get("sampleValue")
                            .and_then(|s| s.as_str())
                            .map(|s| s.to_string()),
                        reasoning: v
                            .get("reasoning")
                            .and_then(|r| r.as_str())
                            .unwrap_or("No reasoning given")
                            .to_string(),
                        extraction_hint: v
                            .get("extractionHint")
                            .and_then(|h| h.as_str())
                            .map(|h| h.to_string()),
                    },
                    None => unavailable(column, "Column not mentioned in analysis"),
                });
            }
        }
        Err(e) => {
            warn!(error = %e, "page analysis failed, degrading to all-unavailable");
            for column in to_analyze {
                results.push(unavailable(column, FAILURE_REASON));
            }
        }
    }

    results
}

fn unavailable(column: &ColumnInfo, reasoning: &str) -> ColumnAnalysis {
    ColumnAnalysis {
        column_name: column.name.clone(),
        is_available: false,
        confidence: 0.0,
        sample_value: None,
        reasoning: reasoning.to_string(),
        extraction_hint: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::LlmError;
    use crate::llm::testing::ScriptedLlm;
    use serde_json::json;

    fn column(name: &str, data_type: &str, pk: bool) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: !pk,
            is_primary_key: pk,
            default_value: None,
        }
    }

    #[test]
    fn test_auto_generated_detection() {
        assert!(is_auto_generated(&column("id", "integer", true)));
        assert!(is_auto_generated(&column("created_at", "timestamp", false)));
        assert!(is_auto_generated(&column("updated_at", "datetime", false)));
        assert!(!is_auto_generated(&column("email", "text", false)));
        // a natural-key text primary key is extractable
        assert!(!is_auto_generated(&column("sku", "text", true)));
    }

    #[tokio::test]
    async fn test_analyze_marks_auto_columns_without_llm() {
        let llm = ScriptedLlm::replying(
            &json!({
                "columns": [{
                    "columnName": "email",
                    "isAvailable": true,
                    "confidence": 0.9,
                    "sampleValue": "a@b.test",
                    "reasoning": "mailto links present"
                }]
            })
            .to_string(),
        );

        let columns = vec![
            column("id", "integer", true),
            column("email", "text", false),
            column("created_at", "timestamp", false),
        ];
        let results =
            analyze_page(&llm, "<html></html>", &columns, "https://x.test", "gpt-4o").await;

        assert_eq!(results.len(), 3);
        let id = results.iter().find(|r| r.column_name == "id").unwrap();
        assert!(!id.is_available);
        assert_eq!(id.reasoning, "Auto-generated column");

        let email = results.iter().find(|r| r.column_name == "email").unwrap();
        assert!(email.is_available);
        assert!((email.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_analyze_degrades_on_llm_failure() {
        let llm = ScriptedLlm::new(vec![Err(LlmError::RequestFailed("down".to_string()))]);
        let columns = vec![column("email", "text", false)];
        let results =
            analyze_page(&llm, "<html></html>", &columns, "https://x.test", "gpt-4o").await;

        assert_eq!(results.len(), 1);
        assert!(!results[0].is_available);
        assert_eq!(results[0].reasoning, "LLM analysis failed");
    }

    #[tokio::test]
    async fn test_analyze_degrades_on_malformed_response() {
        let llm = ScriptedLlm::replying("this is not json");
        let columns = vec![column("email", "text", false)];
        let results =
            analyze_page(&llm, "<html></html>", &columns, "https://x.test", "gpt-4o").await;
        assert!(!results[0].is_available);
        assert_eq!(results[0].reasoning, "LLM analysis failed");
    }
}
