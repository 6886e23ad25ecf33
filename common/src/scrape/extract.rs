// Rule-based field extraction from fetched HTML

use crate::errors::ScrapeError;
use crate::models::{ExtractionRule, RuleDataType, SelectorType, TransformType};
use chrono::NaiveDate;
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Value};

/// One extracted row, keyed by target column
pub type ExtractedRow = serde_json::Map<String, Value>;

/// How many ancestors a row context is widened by when a rule's selector
/// finds nothing inside the context element itself
const CONTEXT_ANCESTOR_LIMIT: usize = 3;

/// Apply the active rules to a document.
///
/// The first rule's selector anchors the rows: with two or more matches each
/// match is one row context; with exactly one the whole document is a single
/// row. Within a row, every rule resolves relative to the context (widening
/// to a few ancestors when the context itself contains no match).
pub fn extract_rows(
    html: &str,
    rules: &[ExtractionRule],
) -> Result<Vec<ExtractedRow>, ScrapeError> {
    let mut active: Vec<&ExtractionRule> = rules.iter().filter(|r| r.is_active).collect();
    active.sort_by_key(|r| r.sort_order);
    if active.is_empty() {
        return Ok(Vec::new());
    }

    let document = Html::parse_document(html);
    let anchor = parse_rule_selector(active[0])?;
    let anchors: Vec<ElementRef> = document.select(&anchor).collect();

    let mut rows = Vec::new();
    if anchors.len() >= 2 {
        for context in anchors {
            rows.push(extract_one(&document, Some(context), &active)?);
        }
    } else {
        rows.push(extract_one(&document, None, &active)?);
    }

    Ok(rows)
}

fn extract_one(
    document: &Html,
    context: Option<ElementRef>,
    rules: &[&ExtractionRule],
) -> Result<ExtractedRow, ScrapeError> {
    let mut row = ExtractedRow::new();
    for rule in rules {
        let selector = parse_rule_selector(rule)?;
        let element = match context {
            Some(context) => find_in_context(context, &selector),
            None => document.select(&selector).next(),
        };
        row.insert(rule.target_column.clone(), extract_value(element, rule));
    }
    Ok(row)
}

/// Resolve a selector relative to a row context, widening to nearby ancestors
/// when the context element itself has no matching descendant. The widening is
/// bounded so a miss does not grab fields from unrelated rows.
fn find_in_context<'a>(context: ElementRef<'a>, selector: &Selector) -> Option<ElementRef<'a>> {
    if selector.matches(&context) {
        return Some(context);
    }
    if let Some(found) = context.select(selector).next() {
        return Some(found);
    }

    let mut node = context;
    for _ in 0..CONTEXT_ANCESTOR_LIMIT {
        let Some(parent) = node.parent().and_then(ElementRef::wrap) else {
            return None;
        };
        if let Some(found) = parent.select(selector).next() {
            return Some(found);
        }
        node = parent;
    }
    None
}

fn extract_value(element: Option<ElementRef>, rule: &ExtractionRule) -> Value {
    let raw = match element {
        Some(el) => match rule.attribute.as_str() {
            "text" => el.text().collect::<String>().trim().to_string(),
            "html" => el.inner_html(),
            attr => el.value().attr(attr).unwrap_or_default().to_string(),
        },
        None => {
            return match &rule.default_value {
                Some(default) => coerce(default.clone(), rule.data_type),
                None => Value::Null,
            }
        }
    };

    let transformed = match apply_transform(&raw, rule) {
        Some(value) => value,
        None => return Value::Null,
    };

    if let Some(pattern) = &rule.validation_regex {
        match regex::Regex::new(pattern) {
            Ok(re) if !re.is_match(&transformed) => return Value::Null,
            _ => {}
        }
    }

    coerce(transformed, rule.data_type)
}

/// Apply the rule's transform; `None` means the value is lost (becomes null)
fn apply_transform(raw: &str, rule: &ExtractionRule) -> Option<String> {
    let config = rule.transform_config.as_ref();
    match rule.transform_type.unwrap_or(TransformType::None) {
        TransformType::None => Some(raw.to_string()),
        TransformType::Trim => Some(raw.trim().to_string()),
        TransformType::Regex => apply_regex_transform(raw, config?),
        TransformType::Date => normalize_date(raw),
        TransformType::Number => normalize_number(raw),
        TransformType::Json => {
            serde_json::from_str::<Value>(raw).ok().map(|_| raw.to_string())
        }
    }
}

/// Regex transform: `{pattern, flags, group, replacement}`. With a
/// replacement it is replace-all; otherwise it returns the requested capture
/// group (default 0) of the first match.
fn apply_regex_transform(raw: &str, config: &Value) -> Option<String> {
    let pattern = config.get("pattern")?.as_str()?;
    let flags = config.get("flags").and_then(|f| f.as_str()).unwrap_or("");

    let mut builder = regex::RegexBuilder::new(pattern);
    builder
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'));
    let re = builder.build().ok()?;

    if let Some(replacement) = config.get("replacement").and_then(|r| r.as_str()) {
        return Some(re.replace_all(raw, replacement).into_owned());
    }

    let group = config.get("group").and_then(|g| g.as_u64()).unwrap_or(0) as usize;
    re.captures(raw)?
        .get(group)
        .map(|m| m.as_str().to_string())
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%d-%m-%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
];

/// Parse common date spellings and normalize to ISO `YYYY-MM-DD`
pub(crate) fn normalize_date(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.date_naive().to_string());
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date.to_string());
        }
    }
    None
}

/// Strip currency symbols and separators, keep sign and decimal point
fn normalize_number(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    cleaned.parse::<f64>().ok().map(|_| cleaned)
}

/// Coerce a transformed string to the rule's data type; failures become null
fn coerce(value: String, data_type: RuleDataType) -> Value {
    match data_type {
        RuleDataType::String => Value::String(value),
        RuleDataType::Number => match value.trim().parse::<i64>() {
            Ok(i) => json!(i),
            Err(_) => value
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        },
        RuleDataType::Boolean => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Value::Bool(true),
            "false" | "no" | "0" | "off" => Value::Bool(false),
            _ => Value::Null,
        },
        RuleDataType::Date => normalize_date(&value).map(Value::String).unwrap_or(Value::Null),
        RuleDataType::Json => serde_json::from_str(&value).unwrap_or(Value::Null),
    }
}

fn parse_rule_selector(rule: &ExtractionRule) -> Result<Selector, ScrapeError> {
    let css = match rule.selector_type {
        SelectorType::Css => rule.selector.clone(),
        SelectorType::Xpath => xpath_to_css(&rule.selector)?,
    };
    Selector::parse(&css).map_err(|e| ScrapeError::InvalidSelector {
        selector: rule.selector.clone(),
        reason: e.to_string(),
    })
}

/// Translate the CSS-expressible subset of XPath.
///
/// Supported: `/` and `//` axes, tag names and `*`, `[@id='v']`,
/// `[@class='v']`, other `[@attr='v']` equality predicates, and positional
/// `[n]`. Anything else (functions, parent axes, unions) is rejected.
pub fn xpath_to_css(xpath: &str) -> Result<String, ScrapeError> {
    let expr = xpath.trim();
    if expr.is_empty() || !expr.starts_with('/') {
        return Err(ScrapeError::UnsupportedXpath(xpath.to_string()));
    }
    if expr.contains("..") || expr.contains("::") || expr.contains('|') || expr.contains("()") {
        return Err(ScrapeError::UnsupportedXpath(xpath.to_string()));
    }

    let mut css = String::new();
    let mut rest = expr;
    while !rest.is_empty() {
        let descendant = if let Some(r) = rest.strip_prefix("//") {
            rest = r;
            true
        } else if let Some(r) = rest.strip_prefix('/') {
            rest = r;
            false
        } else {
            return Err(ScrapeError::UnsupportedXpath(xpath.to_string()));
        };

        let end = rest.find('/').unwrap_or(rest.len());
        let step = &rest[..end];
        rest = &rest[end..];
        if step.is_empty() {
            return Err(ScrapeError::UnsupportedXpath(xpath.to_string()));
        }

        if !css.is_empty() {
            css.push_str(if descendant { " " } else { " > " });
        } else if !descendant {
            // a leading single slash anchors at the root element; CSS has no
            // equivalent anchor, descendant matching is the closest fit
        }

        css.push_str(&xpath_step_to_css(step, xpath)?);
    }

    Ok(css)
}

fn xpath_step_to_css(step: &str, original: &str) -> Result<String, ScrapeError> {
    let unsupported = || ScrapeError::UnsupportedXpath(original.to_string());

    let (tag, predicates) = match step.find('[') {
        Some(i) => (&step[..i], &step[i..]),
        None => (step, ""),
    };
    if tag.is_empty() {
        return Err(unsupported());
    }

    let mut css = if tag == "*" { String::from("*") } else { tag.to_string() };

    let mut rest = predicates;
    while !rest.is_empty() {
        if !rest.starts_with('[') {
            return Err(unsupported());
        }
        let end = rest.find(']').ok_or_else(unsupported)?;
        let predicate = &rest[1..end];
        rest = &rest[end + 1..];

        if let Ok(position) = predicate.parse::<usize>() {
            css.push_str(&format!(":nth-of-type({})", position));
        } else if let Some(attr_expr) = predicate.strip_prefix('@') {
            let (attr, value) = attr_expr.split_once('=').ok_or_else(unsupported)?;
            let value = value.trim_matches(|c| c == '\'' || c == '"');
            match attr {
                "id" => css.push_str(&format!("#{}", value)),
                "class" => {
                    for class in value.split_whitespace() {
                        css.push_str(&format!(".{}", class));
                    }
                }
                other => css.push_str(&format!("[{}=\"{}\"]", other, value)),
            }
        } else {
            return Err(unsupported());
        }
    }

    Ok(css)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn rule(column: &str, selector: &str, sort_order: i32) -> ExtractionRule {
        ExtractionRule {
            id: Uuid::new_v4(),
            assignment_id: Uuid::new_v4(),
            target_column: column.to_string(),
            selector: selector.to_string(),
            selector_type: SelectorType::Css,
            attribute: "text".to_string(),
            transform_type: None,
            transform_config: None,
            default_value: None,
            data_type: RuleDataType::String,
            is_required: false,
            validation_regex: None,
            is_active: true,
            sort_order,
        }
    }

    const LISTING: &str = r#"
        <html><body>
            <div class="p"><span class="name">Alpha</span><span class="price">$1.50</span></div>
            <div class="p"><span class="name">Beta</span><span class="price">$2.75</span></div>
            <div class="p"><span class="name">Gamma</span><span class="price">$3.00</span></div>
        </body></html>
    "#;

    #[test]
    fn test_repeated_anchor_yields_row_per_match() {
        let rules = vec![rule("name", ".p .name", 0), rule("price", ".p .price", 1)];
        let rows = extract_rows(LISTING, &rules).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["name"], json!("Alpha"));
        assert_eq!(rows[1]["price"], json!("$2.75"));
        assert_eq!(rows[2]["name"], json!("Gamma"));
    }

    #[test]
    fn test_single_match_treats_document_as_one_row() {
        let html = r#"<html><body><h1 class="title">Only</h1><p class="body">text</p></body></html>"#;
        let rules = vec![rule("title", ".title", 0), rule("body", ".body", 1)];
        let rows = extract_rows(html, &rules).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], json!("Only"));
        assert_eq!(rows[0]["body"], json!("text"));
    }

    #[test]
    fn test_missing_match_uses_default_then_null() {
        let mut with_default = rule("missing", ".nope", 0);
        with_default.default_value = Some("n/a".to_string());
        let without_default = rule("also_missing", ".nada", 1);
        let anchor = rule("title", ".title", 2);

        let html = r#"<html><body><h1 class="title">T</h1></body></html>"#;
        let rows = extract_rows(html, &[with_default, without_default, anchor]).unwrap();
        assert_eq!(rows[0]["missing"], json!("n/a"));
        assert_eq!(rows[0]["also_missing"], Value::Null);
    }

    #[test]
    fn test_regex_group_transform_and_number_coercion() {
        let mut price = rule("price", ".p .price", 1);
        price.data_type = RuleDataType::Number;
        price.transform_type = Some(TransformType::Regex);
        price.transform_config = Some(json!({"pattern": r"\$([0-9.]+)", "group": 1}));
        let name = rule("name", ".p .name", 0);

        let rows = extract_rows(LISTING, &[name, price]).unwrap();
        assert_eq!(rows[0]["price"], json!(1.5));
        assert_eq!(rows[2]["price"], json!(3.0));
    }

    #[test]
    fn test_regex_replacement_is_replace_all() {
        let mut r = rule("v", ".title", 0);
        r.transform_type = Some(TransformType::Regex);
        r.transform_config = Some(json!({"pattern": "-", "replacement": " "}));
        let html = r#"<html><body><h1 class="title">a-b-c</h1></body></html>"#;
        let rows = extract_rows(html, &[r]).unwrap();
        assert_eq!(rows[0]["v"], json!("a b c"));
    }

    #[test]
    fn test_attribute_extraction() {
        let mut href = rule("link", "a", 0);
        href.attribute = "href".to_string();
        let html = r#"<html><body><a href="/x">one</a></body></html>"#;
        let rows = extract_rows(html, &[href]).unwrap();
        assert_eq!(rows[0]["link"], json!("/x"));
    }

    #[test]
    fn test_failed_coercion_becomes_null() {
        let mut n = rule("n", ".title", 0);
        n.data_type = RuleDataType::Number;
        let html = r#"<html><body><h1 class="title">not a number</h1></body></html>"#;
        let rows = extract_rows(html, &[n]).unwrap();
        assert_eq!(rows[0]["n"], Value::Null);
    }

    #[test]
    fn test_date_normalization() {
        assert_eq!(normalize_date("2024-03-01"), Some("2024-03-01".to_string()));
        assert_eq!(normalize_date("03/01/2024"), Some("2024-01-03".to_string()));
        assert_eq!(
            normalize_date("March 1, 2024"),
            Some("2024-03-01".to_string())
        );
        assert_eq!(normalize_date("not a date"), None);
    }

    #[test]
    fn test_boolean_coercion_tokens() {
        assert_eq!(coerce("yes".to_string(), RuleDataType::Boolean), json!(true));
        assert_eq!(coerce("0".to_string(), RuleDataType::Boolean), json!(false));
        assert_eq!(
            coerce("maybe".to_string(), RuleDataType::Boolean),
            Value::Null
        );
    }

    #[test]
    fn test_inactive_rules_are_skipped() {
        let mut inactive = rule("ghost", ".p .name", 0);
        inactive.is_active = false;
        let name = rule("name", ".p .name", 1);
        let rows = extract_rows(LISTING, &[inactive, name]).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(!rows[0].contains_key("ghost"));
    }

    #[test]
    fn test_xpath_translation() {
        assert_eq!(xpath_to_css("//div").unwrap(), "div");
        assert_eq!(
            xpath_to_css("//div[@class='item']/span").unwrap(),
            "div.item > span"
        );
        assert_eq!(
            xpath_to_css("//ul/li[2]//a[@href='x']").unwrap(),
            "ul > li:nth-of-type(2) a[href=\"x\"]"
        );
        assert_eq!(xpath_to_css("//div[@id='main']").unwrap(), "div#main");
        assert!(xpath_to_css("//div[contains(@class, 'x')]").is_err());
        assert!(xpath_to_css("../div").is_err());
    }

    #[test]
    fn test_xpath_rule_extracts() {
        let mut r = rule("name", "//div[@class='p']/span[@class='name']", 0);
        r.selector_type = SelectorType::Xpath;
        let rows = extract_rows(LISTING, &[r]).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["name"], json!("Alpha"));
    }
}
