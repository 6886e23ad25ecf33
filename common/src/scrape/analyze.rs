// Page structure analysis: repeating elements, fields, forms, pagination

use super::pagination::detect_pagination;
use crate::models::PaginationConfig;
use lazy_static::lazy_static;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Candidate selectors for repeating row-like elements, most specific first
const REPEATING_CANDIDATES: &[&str] = &[
    "table tbody tr",
    "ul li",
    "ol li",
    ".item",
    ".card",
    ".product",
    ".listing",
    ".result",
    ".row",
    "[class*='item']",
    "[class*='card']",
    "[class*='product']",
    "[class*='listing']",
    "[class*='result']",
    "article",
];

/// Probes run inside a repeating element to discover its fields
const FIELD_PROBES: &[(&str, &str, &str)] = &[
    ("link", "a", "text"),
    ("link_url", "a", "href"),
    ("image", "img", "src"),
    ("heading", "h1, h2, h3, h4, h5, h6", "text"),
    ("price", "[class*='price']", "text"),
    ("title", "[class*='title']", "text"),
    ("name", "[class*='name']", "text"),
    ("description", "[class*='desc']", "text"),
    ("date", "[class*='date'], time", "text"),
    ("text", "span", "text"),
];

const MIN_REPEAT_COUNT: usize = 3;
const MAX_REPEATING_ELEMENTS: usize = 5;

lazy_static! {
    static ref FORM_SELECTOR: Selector = Selector::parse("form").expect("static selector");
    static ref INPUT_SELECTOR: Selector =
        Selector::parse("input[name], select[name], textarea[name]").expect("static selector");
    static ref LINK_SELECTOR: Selector = Selector::parse("a[href]").expect("static selector");
    static ref TITLE_SELECTOR: Selector = Selector::parse("title").expect("static selector");
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedField {
    pub name: String,
    pub selector: String,
    pub attribute: String,
    pub sample_value: String,
    /// Inferred from the sample: number, date, boolean, json or string
    pub data_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeatingElement {
    pub selector: String,
    pub count: usize,
    pub sample_html: String,
    pub fields: Vec<DetectedField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedForm {
    pub action: String,
    pub method: String,
    pub field_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageLink {
    pub href: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsiteStructure {
    pub url: String,
    pub title: String,
    pub repeating_elements: Vec<RepeatingElement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationConfig>,
    pub forms: Vec<DetectedForm>,
    pub links: Vec<PageLink>,
}

const MAX_SAMPLE_HTML: usize = 500;
const MAX_LINKS: usize = 50;

/// Analyze a fetched page: rank repeating-element candidates by
/// `match count x detected fields`, keep the top few, and describe forms,
/// links and pagination alongside.
pub fn analyze_structure(html: &str, url: &str) -> WebsiteStructure {
    let document = Html::parse_document(html);

    let title = document
        .select(&TITLE_SELECTOR)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default();

    let mut repeating = Vec::new();
    for candidate in REPEATING_CANDIDATES {
        let Ok(selector) = Selector::parse(candidate) else {
            continue;
        };
        let matches: Vec<ElementRef> = document.select(&selector).collect();
        if matches.len() < MIN_REPEAT_COUNT {
            continue;
        }

        let fields = detect_fields(matches[0]);
        if fields.is_empty() {
            continue;
        }

        let mut sample_html = matches[0].html();
        sample_html.truncate(MAX_SAMPLE_HTML);

        repeating.push(RepeatingElement {
            selector: candidate.to_string(),
            count: matches.len(),
            sample_html,
            fields,
        });
    }

    repeating.sort_by(|a, b| {
        (b.count * b.fields.len()).cmp(&(a.count * a.fields.len()))
    });
    repeating.truncate(MAX_REPEATING_ELEMENTS);

    WebsiteStructure {
        url: url.to_string(),
        title,
        repeating_elements: repeating,
        pagination: detect_pagination(html, url),
        forms: detect_forms(&document),
        links: collect_links(&document),
    }
}

fn detect_fields(element: ElementRef) -> Vec<DetectedField> {
    let mut fields = Vec::new();
    for (name, css, attribute) in FIELD_PROBES {
        let Ok(selector) = Selector::parse(css) else {
            continue;
        };
        let Some(found) = element.select(&selector).next() else {
            continue;
        };

        let sample_value = match *attribute {
            "text" => found.text().collect::<String>().trim().to_string(),
            attr => found.value().attr(attr).unwrap_or_default().to_string(),
        };
        if sample_value.is_empty() {
            continue;
        }
        // one field per distinct probe selector, first hit wins
        if fields
            .iter()
            .any(|f: &DetectedField| f.selector == *css && f.attribute == *attribute)
        {
            continue;
        }

        fields.push(DetectedField {
            name: name.to_string(),
            selector: css.to_string(),
            attribute: attribute.to_string(),
            data_type: infer_data_type(&sample_value),
            sample_value,
        });
    }
    fields
}

/// Infer a data type from a sample value
pub fn infer_data_type(sample: &str) -> String {
    let trimmed = sample.trim();
    let numericish: String = trimmed
        .chars()
        .filter(|c| !matches!(c, '$' | '€' | '£' | ',' | ' '))
        .collect();
    if !numericish.is_empty() && numericish.parse::<f64>().is_ok() {
        return "number".to_string();
    }
    if matches!(
        trimmed.to_ascii_lowercase().as_str(),
        "true" | "false" | "yes" | "no"
    ) {
        return "boolean".to_string();
    }
    if super::extract::normalize_date(trimmed).is_some() {
        return "date".to_string();
    }
    if (trimmed.starts_with('{') || trimmed.starts_with('['))
        && serde_json::from_str::<Value>(trimmed).is_ok()
    {
        return "json".to_string();
    }
    "string".to_string()
}

fn detect_forms(document: &Html) -> Vec<DetectedForm> {
    document
        .select(&FORM_SELECTOR)
        .map(|form| DetectedForm {
            action: form.value().attr("action").unwrap_or_default().to_string(),
            method: form
                .value()
                .attr("method")
                .unwrap_or("get")
                .to_lowercase(),
            field_names: form
                .select(&INPUT_SELECTOR)
                .filter_map(|input| input.value().attr("name").map(|n| n.to_string()))
                .collect(),
        })
        .collect()
}

fn collect_links(document: &Html) -> Vec<PageLink> {
    document
        .select(&LINK_SELECTOR)
        .take(MAX_LINKS)
        .filter_map(|a| {
            let href = a.value().attr("href")?.trim();
            if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
                return None;
            }
            Some(PageLink {
                href: href.to_string(),
                text: a.text().collect::<String>().trim().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRODUCT_PAGE: &str = r#"
        <html><head><title>Shop</title></head><body>
            <div class="product"><h3>One</h3><span class="price">$1</span><a href="/p/1">view</a></div>
            <div class="product"><h3>Two</h3><span class="price">$2</span><a href="/p/2">view</a></div>
            <div class="product"><h3>Three</h3><span class="price">$3</span><a href="/p/3">view</a></div>
            <form action="/search" method="get"><input name="q"></form>
        </body></html>
    "#;

    #[test]
    fn test_detects_repeating_products() {
        let structure = analyze_structure(PRODUCT_PAGE, "https://shop.test/");
        assert_eq!(structure.title, "Shop");
        assert!(!structure.repeating_elements.is_empty());

        let best = &structure.repeating_elements[0];
        assert!(best.count >= 3);
        assert!(!best.fields.is_empty());
        assert!(best.fields.iter().any(|f| f.name == "price"));
    }

    #[test]
    fn test_rejects_sparse_candidates() {
        let html = r#"
            <html><body>
                <div class="item"><span>only one</span></div>
                <p>filler</p>
            </body></html>
        "#;
        let structure = analyze_structure(html, "https://example.test/");
        assert!(structure.repeating_elements.is_empty());
    }

    #[test]
    fn test_forms_and_links_collected() {
        let structure = analyze_structure(PRODUCT_PAGE, "https://shop.test/");
        assert_eq!(structure.forms.len(), 1);
        assert_eq!(structure.forms[0].action, "/search");
        assert_eq!(structure.forms[0].field_names, vec!["q"]);
        assert_eq!(structure.links.len(), 3);
    }

    #[test]
    fn test_infer_data_type() {
        assert_eq!(infer_data_type("$12.99"), "number");
        assert_eq!(infer_data_type("42"), "number");
        assert_eq!(infer_data_type("2024-01-15"), "date");
        assert_eq!(infer_data_type("true"), "boolean");
        assert_eq!(infer_data_type(r#"{"a": 1}"#), "json");
        assert_eq!(infer_data_type("plain words"), "string");
    }

    #[test]
    fn test_pagination_included_when_present() {
        let html = r#"
            <html><body>
                <ul>
                    <li><a href="/a">a</a></li>
                    <li><a href="/b">b</a></li>
                    <li><a href="/c">c</a></li>
                </ul>
                <a href="/list?page=2">2</a>
            </body></html>
        "#;
        let structure = analyze_structure(html, "https://example.test/list");
        assert!(structure.pagination.is_some());
    }
}
