// Phase two of LLM capture: compose a reusable structured-output config and
// run it against fetched pages

use super::{
    page_excerpts, parse_json_response, ChatMessage, CompletionRequest, LlmClient, ResponseFormat,
};
use super::analyze::ColumnAnalysis;
use crate::connector::ColumnInfo;
use crate::models::{ColumnMapping, LlmCaptureConfig};
use crate::scrape::ExtractedRow;
use serde_json::{json, Map, Value};
use tracing::{instrument, warn};

/// Columns at or above this confidence become required in the item schema
const REQUIRED_CONFIDENCE: f64 = 0.7;

pub const DEFAULT_TEMPERATURE: f32 = 0.1;

/// Database type text to JSON schema type
pub fn json_type_for(db_type: &str) -> &'static str {
    let lowered = db_type.to_lowercase();
    if ["int", "float", "decimal", "numeric", "real", "double"]
        .iter()
        .any(|t| lowered.contains(t))
    {
        "number"
    } else if lowered.contains("bool") {
        "boolean"
    } else {
        "string"
    }
}

/// Build a capture config from the analyzer's available columns
/// (`confidence > 0`). The system prompt is model-written with a
/// deterministic template fallback.
#[instrument(skip(client, analyses, columns))]
pub async fn build_capture_config(
    client: &dyn LlmClient,
    analyses: &[ColumnAnalysis],
    columns: &[ColumnInfo],
    target_table: &str,
    model: &str,
) -> LlmCaptureConfig {
    let available: Vec<&ColumnAnalysis> =
        analyses.iter().filter(|a| a.confidence > 0.0).collect();

    let mut properties = Map::new();
    let mut required = Vec::new();
    let mut column_mappings = Vec::with_capacity(available.len());

    for analysis in &available {
        let db_type = columns
            .iter()
            .find(|c| c.name == analysis.column_name)
            .map(|c| c.data_type.as_str())
            .unwrap_or("text");
        let json_type = json_type_for(db_type);

        properties.insert(
            analysis.column_name.clone(),
            json!({"type": [json_type, "null"]}),
        );
        if analysis.confidence >= REQUIRED_CONFIDENCE {
            required.push(Value::String(analysis.column_name.clone()));
        }

        column_mappings.push(ColumnMapping {
            column_name: analysis.column_name.clone(),
            json_field: analysis.column_name.clone(),
            description: analysis
                .extraction_hint
                .clone()
                .unwrap_or_else(|| analysis.reasoning.clone()),
            data_type: json_type.to_string(),
            is_required: analysis.confidence >= REQUIRED_CONFIDENCE,
        });
    }

    let json_schema = json!({
        "type": "object",
        "required": ["items"],
        "properties": {
            "items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                },
            },
        },
    });

    let system_prompt =
        generate_system_prompt(client, &column_mappings, target_table, model).await;

    LlmCaptureConfig {
        system_prompt,
        json_schema,
        column_mappings,
        model: model.to_string(),
        temperature: DEFAULT_TEMPERATURE,
    }
}

async fn generate_system_prompt(
    client: &dyn LlmClient,
    mappings: &[ColumnMapping],
    target_table: &str,
    model: &str,
) -> String {
    let field_list = mappings
        .iter()
        .map(|m| format!("- {} ({}): {}", m.json_field, m.data_type, m.description))
        .collect::<Vec<_>>()
        .join("\n");

    let request = CompletionRequest {
        model: model.to_string(),
        temperature: 0.3,
        messages: vec![
            ChatMessage::system(
                "Write a concise system prompt for a data-extraction assistant. The prompt \
                 must instruct the assistant to read a web page and return a JSON object \
                 with an `items` array of records. Reply with the prompt text only.",
            ),
            ChatMessage::user(format!(
                "Target table: {}\nFields to extract:\n{}",
                target_table, field_list
            )),
        ],
        response_format: ResponseFormat::Text,
    };

    match client.complete(request).await {
        Ok(prompt) if !prompt.trim().is_empty() => prompt.trim().to_string(),
        Ok(_) | Err(_) => fallback_system_prompt(mappings, target_table),
    }
}

/// Deterministic prompt used when prompt generation fails
pub fn fallback_system_prompt(mappings: &[ColumnMapping], target_table: &str) -> String {
    let fields = mappings
        .iter()
        .map(|m| m.json_field.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Extract records for the {table} table from the provided web page. \
         Return a JSON object with an `items` array; each item has the fields: {fields}. \
         Use null for values the page does not show. Do not invent data.",
        table = target_table,
        fields = fields,
    )
}

/// Run a capture config against one fetched page. LLM failures and malformed
/// payloads yield zero rows; the caller treats that as a page-level error.
#[instrument(skip(client, html, config), fields(model = %config.model))]
pub async fn extract_structured(
    client: &dyn LlmClient,
    html: &str,
    config: &LlmCaptureConfig,
    url: &str,
) -> Vec<ExtractedRow> {
    let excerpts = page_excerpts(html);
    let user = format!(
        "Page URL: {url}\n\nVisible page text:\n{text}\n\nMain content HTML:\n{html}",
        url = url,
        text = excerpts.text,
        html = excerpts.html,
    );

    let request = CompletionRequest {
        model: config.model.clone(),
        temperature: config.temperature,
        messages: vec![
            ChatMessage::system(config.system_prompt.clone()),
            ChatMessage::user(user),
        ],
        response_format: ResponseFormat::JsonSchema(config.json_schema.clone()),
    };

    let content = match client.complete(request).await {
        Ok(content) => content,
        Err(e) => {
            warn!(error = %e, url, "structured extraction call failed");
            return Vec::new();
        }
    };

    let parsed = match parse_json_response(&content) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, url, "structured extraction returned malformed JSON");
            return Vec::new();
        }
    };

    let items = parsed
        .get("items")
        .and_then(|i| i.as_array())
        .cloned()
        .unwrap_or_default();

    let mut rows = Vec::with_capacity(items.len());
    for item in items {
        let mut row = ExtractedRow::new();
        for mapping in &config.column_mappings {
            match item.get(&mapping.json_field) {
                Some(value) if !value.is_null() => {
                    row.insert(mapping.column_name.clone(), value.clone());
                }
                Some(_) | None if mapping.is_required => {
                    row.insert(mapping.column_name.clone(), Value::Null);
                }
                _ => {}
            }
        }
        // a row of nothing but nulls carries no data
        if row.values().any(|v| !v.is_null()) {
            rows.push(row);
        }
    }

    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedLlm;

    fn analysis(name: &str, confidence: f64) -> ColumnAnalysis {
        ColumnAnalysis {
            column_name: name.to_string(),
            is_available: confidence > 0.0,
            confidence,
            sample_value: None,
            reasoning: format!("{} is visible", name),
            extraction_hint: None,
        }
    }

    fn column(name: &str, data_type: &str) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: true,
            is_primary_key: false,
            default_value: None,
        }
    }

    #[test]
    fn test_json_type_mapping() {
        assert_eq!(json_type_for("integer"), "number");
        assert_eq!(json_type_for("NUMERIC(10,2)"), "number");
        assert_eq!(json_type_for("double precision"), "number");
        assert_eq!(json_type_for("boolean"), "boolean");
        assert_eq!(json_type_for("text"), "string");
        assert_eq!(json_type_for("timestamp"), "string");
    }

    #[tokio::test]
    async fn test_capture_config_shape() {
        let llm = ScriptedLlm::replying("You extract product rows.");
        let analyses = vec![
            analysis("email", 0.9),
            analysis("nickname", 0.4),
            analysis("ignored", 0.0),
        ];
        let columns = vec![
            column("email", "text"),
            column("nickname", "varchar"),
            column("ignored", "text"),
        ];

        let config =
            build_capture_config(&llm, &analyses, &columns, "customers", "gpt-4o").await;

        assert_eq!(config.column_mappings.len(), 2);
        assert_eq!(config.model, "gpt-4o");
        assert!((config.temperature - 0.1).abs() < f32::EPSILON);

        let items = &config.json_schema["properties"]["items"];
        assert_eq!(items["type"], "array");
        let required = items["items"]["required"].as_array().unwrap();
        assert_eq!(required.len(), 1);
        assert_eq!(required[0], "email");
        assert!(items["items"]["properties"]["nickname"].is_object());
    }

    #[tokio::test]
    async fn test_prompt_falls_back_on_llm_failure() {
        let llm = ScriptedLlm::new(vec![Err(crate::errors::LlmError::RequestFailed(
            "down".to_string(),
        ))]);
        let analyses = vec![analysis("email", 0.9)];
        let columns = vec![column("email", "text")];

        let config =
            build_capture_config(&llm, &analyses, &columns, "customers", "gpt-4o").await;
        assert!(config.system_prompt.contains("customers"));
        assert!(config.system_prompt.contains("items"));
    }

    #[tokio::test]
    async fn test_extract_structured_builds_rows() {
        let llm = ScriptedLlm::replying(
            &json!({
                "items": [
                    {"email": "a@x.test", "nickname": "al"},
                    {"email": "b@x.test"},
                    {}
                ]
            })
            .to_string(),
        );

        let config = LlmCaptureConfig {
            system_prompt: "extract".to_string(),
            json_schema: json!({"type": "object"}),
            column_mappings: vec![
                ColumnMapping {
                    column_name: "email".to_string(),
                    json_field: "email".to_string(),
                    description: String::new(),
                    data_type: "string".to_string(),
                    is_required: true,
                },
                ColumnMapping {
                    column_name: "nickname".to_string(),
                    json_field: "nickname".to_string(),
                    description: String::new(),
                    data_type: "string".to_string(),
                    is_required: false,
                },
            ],
            model: "gpt-4o".to_string(),
            temperature: 0.1,
        };

        let rows = extract_structured(&llm, "<html></html>", &config, "https://x.test").await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["email"], json!("a@x.test"));
        assert_eq!(rows[0]["nickname"], json!("al"));
        // required field missing stays null; non-required is dropped
        assert_eq!(rows[1]["email"], json!("b@x.test"));
        assert!(!rows[1].contains_key("nickname"));
    }

    #[tokio::test]
    async fn test_extract_structured_empty_on_failure() {
        let llm = ScriptedLlm::replying("not json at all");
        let config = LlmCaptureConfig {
            system_prompt: "extract".to_string(),
            json_schema: json!({"type": "object"}),
            column_mappings: Vec::new(),
            model: "gpt-4o".to_string(),
            temperature: 0.1,
        };
        let rows = extract_structured(&llm, "<html></html>", &config, "https://x.test").await;
        assert!(rows.is_empty());
    }
}
