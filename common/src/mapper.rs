// Schema-aware mapping: match detected web fields to target-table columns
// and derive extraction rules from the winners

use crate::connector::{ColumnInfo, TableInfo};
use crate::errors::LlmError;
use crate::llm::{parse_json_response, ChatMessage, CompletionRequest, LlmClient, ResponseFormat};
use crate::models::{
    ExtractionRule, MappingSuggestion, RuleDataType, SelectorType, TransformType,
};
use crate::scrape::{DetectedField, WebsiteStructure};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Discovered schema handed to the mapper and the analysis facade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub tables: Vec<TableInfo>,
}

impl DatabaseSchema {
    pub fn from_tables(tables: Vec<TableInfo>) -> Self {
        Self { tables }
    }

    pub fn find_table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.iter().find(|t| {
            t.table == name || format!("{}.{}", t.schema, t.table) == name
        })
    }

    fn find_column(&self, table: &str, column: &str) -> Option<&ColumnInfo> {
        self.find_table(table)
            .and_then(|t| t.columns.iter().find(|c| c.name == column))
    }
}

/// Confidence assigned to rule-based synonym hits
const RULE_BASED_CONFIDENCE: f64 = 0.6;

lazy_static! {
    /// Common web-field-to-column synonym families
    static ref SYNONYMS: HashMap<&'static str, &'static [&'static str]> = {
        let mut m: HashMap<&'static str, &'static [&'static str]> = HashMap::new();
        m.insert("title", &["name", "heading", "subject", "label"]);
        m.insert("name", &["title", "label", "heading"]);
        m.insert("price", &["cost", "amount", "value"]);
        m.insert("image", &["img", "photo", "thumbnail", "picture", "image_url"]);
        m.insert("link_url", &["url", "link", "href", "website"]);
        m.insert("link", &["url", "href", "website"]);
        m.insert("date", &["created_at", "updated_at", "published_at", "posted_at"]);
        m.insert("description", &["summary", "details", "body", "content", "text"]);
        m.insert("heading", &["title", "header", "name"]);
        m
    };
}

/// Straightforward projection of connector discovery
pub fn analyze_database(tables: Vec<TableInfo>) -> DatabaseSchema {
    DatabaseSchema::from_tables(tables)
}

/// Propose field-to-column mappings. The LLM path is preferred; when it is
/// unavailable or answers nonsense the fixed synonym dictionary takes over.
/// The result is sorted by descending confidence.
#[instrument(skip(client, schema, structure))]
pub async fn suggest_mappings(
    client: Option<&dyn LlmClient>,
    schema: &DatabaseSchema,
    structure: &WebsiteStructure,
    target_table: Option<&str>,
    model: &str,
) -> Vec<MappingSuggestion> {
    let fields = flatten_fields(structure);
    if fields.is_empty() {
        return Vec::new();
    }

    let candidates: Vec<&TableInfo> = match target_table {
        Some(name) => schema.find_table(name).into_iter().collect(),
        None => schema.tables.iter().collect(),
    };
    if candidates.is_empty() {
        return Vec::new();
    }

    let mut suggestions = match client {
        Some(client) => {
            match llm_suggest(client, schema, &fields, &candidates, model).await {
                Ok(suggestions) if !suggestions.is_empty() => suggestions,
                Ok(_) => {
                    debug!("LLM proposed no mappings, using rule-based fallback");
                    rule_based_suggest(&fields, &candidates)
                }
                Err(e) => {
                    warn!(error = %e, "LLM mapping failed, using rule-based fallback");
                    rule_based_suggest(&fields, &candidates)
                }
            }
        }
        None => rule_based_suggest(&fields, &candidates),
    };

    suggestions.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    suggestions
}

/// Flatten detected fields across repeating elements, first occurrence of a
/// field name wins
fn flatten_fields(structure: &WebsiteStructure) -> Vec<DetectedField> {
    let mut seen = std::collections::HashSet::new();
    let mut fields = Vec::new();
    for element in &structure.repeating_elements {
        for field in &element.fields {
            if seen.insert(field.name.clone()) {
                fields.push(field.clone());
            }
        }
    }
    fields
}

async fn llm_suggest(
    client: &dyn LlmClient,
    schema: &DatabaseSchema,
    fields: &[DetectedField],
    candidates: &[&TableInfo],
    model: &str,
) -> Result<Vec<MappingSuggestion>, LlmError> {
    let field_list = fields
        .iter()
        .map(|f| {
            format!(
                "- {} (selector `{}`, sample: {:.60})",
                f.name, f.selector, f.sample_value
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let table_list = candidates
        .iter()
        .map(|t| {
            let columns = t
                .columns
                .iter()
                .map(|c| format!("{} {}", c.name, c.data_type))
                .collect::<Vec<_>>()
                .join(", ");
            format!("- {} ({})", t.table, columns)
        })
        .collect::<Vec<_>>()
        .join("\n");

    let request = CompletionRequest {
        model: model.to_string(),
        temperature: 0.1,
        messages: vec![
            ChatMessage::system(
                "You map scraped web fields to database columns. Respond with JSON: \
                 {\"mappings\": [{\"webFieldName\": string, \"tableName\": string, \
                 \"columnName\": string, \"confidence\": number, \"transformType\": \
                 string|null, \"transformConfig\": object|null, \"reasoning\": string}]}. \
                 transformType is one of trim, regex, date, number, json or null.",
            ),
            ChatMessage::user(format!(
                "Detected web fields:\n{}\n\nCandidate tables:\n{}",
                field_list, table_list
            )),
        ],
        response_format: ResponseFormat::JsonObject,
    };

    let content = client.complete(request).await?;
    let parsed = parse_json_response(&content)?;
    let raw_mappings = parsed
        .get("mappings")
        .and_then(|m| m.as_array())
        .cloned()
        .unwrap_or_default();

    let mut suggestions = Vec::new();
    for raw in raw_mappings {
        let Some(web_field) = raw.get("webFieldName").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(table_name) = raw.get("tableName").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(column_name) = raw.get("columnName").and_then(|v| v.as_str()) else {
            continue;
        };

        // keep only mappings whose field and column really exist
        let Some(field) = fields.iter().find(|f| f.name == web_field) else {
            continue;
        };
        if schema.find_column(table_name, column_name).is_none() {
            continue;
        }

        suggestions.push(MappingSuggestion {
            confidence: raw
                .get("confidence")
                .and_then(|c| c.as_f64())
                .unwrap_or(0.5)
                .clamp(0.0, 1.0),
            web_field: web_field.to_string(),
            db_column: column_name.to_string(),
            table_name: table_name.to_string(),
            selector: field.selector.clone(),
            transform_type: raw
                .get("transformType")
                .and_then(|t| t.as_str())
                .and_then(parse_transform),
            transform_config: raw.get("transformConfig").filter(|c| !c.is_null()).cloned(),
        });
    }

    Ok(suggestions)
}

fn rule_based_suggest(
    fields: &[DetectedField],
    candidates: &[&TableInfo],
) -> Vec<MappingSuggestion> {
    let mut suggestions = Vec::new();
    for field in fields {
        for table in candidates {
            for column in &table.columns {
                if !names_relate(&field.name, &column.name) {
                    continue;
                }
                suggestions.push(MappingSuggestion {
                    confidence: RULE_BASED_CONFIDENCE,
                    web_field: field.name.clone(),
                    db_column: column.name.clone(),
                    table_name: table.table.clone(),
                    selector: field.selector.clone(),
                    transform_type: Some(infer_transform(field, column)),
                    transform_config: None,
                });
            }
        }
    }
    suggestions
}

fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

fn names_relate(web_field: &str, column: &str) -> bool {
    let field_norm = normalize_name(web_field);
    let column_norm = normalize_name(column);
    if field_norm == column_norm {
        return true;
    }

    if let Some(synonyms) = SYNONYMS.get(web_field.to_lowercase().as_str()) {
        if synonyms.iter().any(|s| normalize_name(s) == column_norm) {
            return true;
        }
    }
    // the dictionary also reads in reverse (column families naming the field)
    if let Some(synonyms) = SYNONYMS.get(column.to_lowercase().as_str()) {
        if synonyms.iter().any(|s| normalize_name(s) == field_norm) {
            return true;
        }
    }
    false
}

/// Deterministic transform choice against the column type
pub fn infer_transform(_field: &DetectedField, column: &ColumnInfo) -> TransformType {
    let column_type = column.data_type.to_lowercase();
    let numeric = ["int", "float", "decimal", "numeric", "real", "double"]
        .iter()
        .any(|t| column_type.contains(t));
    if numeric {
        return TransformType::Number;
    }
    if ["date", "time"].iter().any(|t| column_type.contains(t)) {
        return TransformType::Date;
    }
    TransformType::Trim
}

fn parse_transform(name: &str) -> Option<TransformType> {
    match name {
        "trim" => Some(TransformType::Trim),
        "regex" => Some(TransformType::Regex),
        "date" => Some(TransformType::Date),
        "number" => Some(TransformType::Number),
        "json" => Some(TransformType::Json),
        _ => None,
    }
}

/// Turn accepted suggestions into ordered css extraction rules
pub fn mappings_to_extraction_rules(
    suggestions: &[MappingSuggestion],
    assignment_id: Uuid,
    structure: &WebsiteStructure,
    schema: &DatabaseSchema,
) -> Vec<ExtractionRule> {
    let fields = flatten_fields(structure);

    suggestions
        .iter()
        .enumerate()
        .map(|(i, suggestion)| {
            let field = fields.iter().find(|f| f.name == suggestion.web_field);
            let column = schema.find_column(&suggestion.table_name, &suggestion.db_column);

            let data_type = match field.map(|f| f.data_type.as_str()) {
                Some("number") => RuleDataType::Number,
                Some("date") => RuleDataType::Date,
                Some("boolean") => RuleDataType::Boolean,
                Some("json") => RuleDataType::Json,
                _ => RuleDataType::String,
            };

            ExtractionRule {
                id: Uuid::new_v4(),
                assignment_id,
                target_column: suggestion.db_column.clone(),
                selector: suggestion.selector.clone(),
                selector_type: SelectorType::Css,
                attribute: field
                    .map(|f| f.attribute.clone())
                    .unwrap_or_else(|| "text".to_string()),
                transform_type: suggestion.transform_type,
                transform_config: suggestion.transform_config.clone(),
                default_value: None,
                data_type,
                is_required: column.map(|c| !c.nullable).unwrap_or(false),
                validation_regex: None,
                is_active: true,
                sort_order: i as i32,
            }
        })
        .collect()
}
