// Pagination discovery and URL sequence generation

use crate::errors::ScrapeError;
use crate::models::{PaginationConfig, PaginationType};
use lazy_static::lazy_static;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

/// Query parameter names that signal page enumeration
const PAGE_PARAM_NAMES: &[&str] = &["page", "p", "offset", "start"];

lazy_static! {
    static ref PATH_PAGE_RE: Regex = Regex::new(r"/page/(\d+)(?:/|$)").expect("static regex");
    static ref PATH_P_RE: Regex = Regex::new(r"/p/(\d+)(?:/|$)").expect("static regex");
    static ref PATH_TRAILING_RE: Regex = Regex::new(r"/(\d+)/?$").expect("static regex");
    static ref SUB_PAGE_RE: Regex = Regex::new(r"/page/\d+").expect("static regex");
    static ref SUB_P_RE: Regex = Regex::new(r"/p/\d+").expect("static regex");
    static ref NEXT_TEXT_RE: Regex =
        Regex::new(r"(?i)^\s*(next|→|»|next\s*page|older)\s*$").expect("static regex");
    static ref ANCHOR_SELECTOR: Selector = Selector::parse("a[href]").expect("static selector");
    static ref NEXT_CANDIDATE_SELECTOR: Selector =
        Selector::parse("a, button").expect("static selector");
}

/// Inspect a fetched page for pagination affordances. Patterns are tried in
/// order (query parameter, next button, path segment); the first hit wins.
pub fn detect_pagination(html: &str, base_url: &str) -> Option<PaginationConfig> {
    let document = Html::parse_document(html);
    let base = Url::parse(base_url).ok();

    detect_query_param(&document, base.as_ref())
        .or_else(|| detect_next_button(&document))
        .or_else(|| detect_path_segment(&document, base.as_ref()))
}

fn detect_query_param(document: &Html, base: Option<&Url>) -> Option<PaginationConfig> {
    for anchor in document.select(&ANCHOR_SELECTOR) {
        let href = anchor.value().attr("href")?;
        let resolved = resolve(base, href)?;
        for (key, _) in resolved.query_pairs() {
            let lowered = key.to_lowercase();
            if PAGE_PARAM_NAMES.contains(&lowered.as_str()) {
                return Some(PaginationConfig {
                    pagination_type: PaginationType::QueryParam,
                    param_name: Some(key.into_owned()),
                    selector: None,
                    url_pattern: None,
                    max_pages: None,
                    start_page: None,
                });
            }
        }
    }
    None
}

fn detect_next_button(document: &Html) -> Option<PaginationConfig> {
    for element in document.select(&NEXT_CANDIDATE_SELECTOR) {
        let rel_next = element.value().attr("rel") == Some("next");
        let class_next = element
            .value()
            .attr("class")
            .map(|c| c.to_lowercase().contains("next"))
            .unwrap_or(false);
        let text = element.text().collect::<String>();
        let text_next = NEXT_TEXT_RE.is_match(&text);

        if rel_next || class_next || text_next {
            let selector = if rel_next {
                Some("a[rel=\"next\"]".to_string())
            } else {
                element.value().attr("class").and_then(|classes| {
                    classes
                        .split_whitespace()
                        .find(|c| c.to_lowercase().contains("next"))
                        .map(|c| format!("{}.{}", element.value().name(), c))
                })
            };

            return Some(PaginationConfig {
                pagination_type: PaginationType::NextButton,
                param_name: None,
                selector,
                url_pattern: None,
                max_pages: None,
                start_page: None,
            });
        }
    }
    None
}

fn detect_path_segment(document: &Html, base: Option<&Url>) -> Option<PaginationConfig> {
    for anchor in document.select(&ANCHOR_SELECTOR) {
        let href = anchor.value().attr("href")?;
        let path = resolve(base, href)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|| href.to_string());

        let pattern = if PATH_PAGE_RE.is_match(&path) {
            "/page/{n}"
        } else if PATH_P_RE.is_match(&path) {
            "/p/{n}"
        } else if PATH_TRAILING_RE.is_match(&path) {
            "/{n}"
        } else {
            continue;
        };

        return Some(PaginationConfig {
            pagination_type: PaginationType::Path,
            param_name: None,
            selector: None,
            url_pattern: Some(pattern.to_string()),
            max_pages: None,
            start_page: None,
        });
    }
    None
}

/// Expand a base URL into the page sequence a config describes, capped at
/// `cap` pages (and by the config's own `max_pages`).
pub fn generate_paginated_urls(
    base: &str,
    config: &PaginationConfig,
    cap: u32,
) -> Result<Vec<String>, ScrapeError> {
    let count = cap.min(config.max_pages());
    let start = config.start_page();

    match config.pagination_type {
        PaginationType::None | PaginationType::NextButton => Ok(vec![base.to_string()]),
        PaginationType::QueryParam => {
            let param = config.param_name.as_deref().unwrap_or("page");
            let base_url = Url::parse(base).map_err(|e| ScrapeError::InvalidUrl {
                url: base.to_string(),
                reason: e.to_string(),
            })?;

            let mut urls = Vec::with_capacity(count as usize);
            for page in start..start + count {
                let mut url = base_url.clone();
                let others: Vec<(String, String)> = url
                    .query_pairs()
                    .filter(|(k, _)| k != param)
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect();
                {
                    let mut pairs = url.query_pairs_mut();
                    pairs.clear();
                    for (k, v) in &others {
                        pairs.append_pair(k, v);
                    }
                    pairs.append_pair(param, &page.to_string());
                }
                urls.push(url.to_string());
            }
            Ok(urls)
        }
        PaginationType::Path => {
            let pattern = config.url_pattern.as_deref().unwrap_or("/page/{n}");
            let mut urls = Vec::with_capacity(count as usize);
            for page in start..start + count {
                urls.push(substitute_path_page(base, pattern, page));
            }
            Ok(urls)
        }
    }
}

/// Replace (or append) the numeric page segment of a URL path
fn substitute_path_page(base: &str, pattern: &str, page: u32) -> String {
    let (re, replacement): (&Regex, String) = match pattern {
        "/p/{n}" => (&*SUB_P_RE, format!("/p/{}", page)),
        "/{n}" => (&*PATH_TRAILING_RE, format!("/{}", page)),
        _ => (&*SUB_PAGE_RE, format!("/page/{}", page)),
    };

    if re.is_match(base) {
        re.replace(base, replacement.as_str()).into_owned()
    } else {
        // base carries no numeric segment yet; append one
        format!("{}{}", base.trim_end_matches('/'), replacement)
    }
}

/// Locate the next-page link on a fetched page. A configured selector is
/// honoured first, then the built-in next-button heuristics.
pub fn find_next_url(html: &str, selector: Option<&str>, current_url: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let base = Url::parse(current_url).ok();

    if let Some(css) = selector {
        if let Ok(parsed) = Selector::parse(css) {
            if let Some(element) = document.select(&parsed).next() {
                if let Some(href) = element.value().attr("href") {
                    return resolve(base.as_ref(), href).map(|u| u.to_string());
                }
            }
        }
    }

    for element in document.select(&ANCHOR_SELECTOR) {
        let rel_next = element.value().attr("rel") == Some("next");
        let class_next = element
            .value()
            .attr("class")
            .map(|c| c.to_lowercase().contains("next"))
            .unwrap_or(false);
        let text_next = NEXT_TEXT_RE.is_match(&element.text().collect::<String>());

        if rel_next || class_next || text_next {
            if let Some(href) = element.value().attr("href") {
                return resolve(base.as_ref(), href).map(|u| u.to_string());
            }
        }
    }
    None
}

fn resolve(base: Option<&Url>, href: &str) -> Option<Url> {
    match base {
        Some(base) => base.join(href).ok(),
        None => Url::parse(href).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_query_param() {
        let html = r#"<html><body><a href="/list?page=2">2</a></body></html>"#;
        let cfg = detect_pagination(html, "https://example.test/list").unwrap();
        assert_eq!(cfg.pagination_type, PaginationType::QueryParam);
        assert_eq!(cfg.param_name.as_deref(), Some("page"));
    }

    #[test]
    fn test_detect_query_param_case_insensitive() {
        let html = r#"<html><body><a href="/list?Page=2">2</a></body></html>"#;
        let cfg = detect_pagination(html, "https://example.test/list").unwrap();
        assert_eq!(cfg.pagination_type, PaginationType::QueryParam);
        assert_eq!(cfg.param_name.as_deref(), Some("Page"));
    }

    #[test]
    fn test_detect_next_button_by_rel() {
        let html = r#"<html><body><a rel="next" href="/list/2">more</a></body></html>"#;
        let cfg = detect_pagination(html, "https://example.test/list").unwrap();
        assert_eq!(cfg.pagination_type, PaginationType::NextButton);
        assert_eq!(cfg.selector.as_deref(), Some("a[rel=\"next\"]"));
    }

    #[test]
    fn test_detect_next_button_by_class() {
        let html = r#"<html><body><a class="pagination-next" href="/x">»</a></body></html>"#;
        let cfg = detect_pagination(html, "https://example.test/list").unwrap();
        assert_eq!(cfg.pagination_type, PaginationType::NextButton);
        assert_eq!(cfg.selector.as_deref(), Some("a.pagination-next"));
    }

    #[test]
    fn test_detect_path_segment() {
        let html = r#"<html><body><a href="/list/page/2">2</a></body></html>"#;
        let cfg = detect_pagination(html, "https://example.test/list").unwrap();
        assert_eq!(cfg.pagination_type, PaginationType::Path);
        assert_eq!(cfg.url_pattern.as_deref(), Some("/page/{n}"));
    }

    #[test]
    fn test_query_param_wins_over_path() {
        let html = r#"
            <html><body>
                <a href="/list?page=2">2</a>
                <a href="/list/page/2">also 2</a>
            </body></html>
        "#;
        let cfg = detect_pagination(html, "https://example.test/list").unwrap();
        assert_eq!(cfg.pagination_type, PaginationType::QueryParam);
    }

    #[test]
    fn test_generate_query_param_urls() {
        let cfg = PaginationConfig {
            pagination_type: PaginationType::QueryParam,
            param_name: Some("page".to_string()),
            selector: None,
            url_pattern: None,
            max_pages: None,
            start_page: None,
        };
        let urls = generate_paginated_urls("https://example.test/list", &cfg, 3).unwrap();
        assert_eq!(
            urls,
            vec![
                "https://example.test/list?page=1",
                "https://example.test/list?page=2",
                "https://example.test/list?page=3",
            ]
        );
    }

    #[test]
    fn test_generate_replaces_existing_param() {
        let cfg = PaginationConfig {
            pagination_type: PaginationType::QueryParam,
            param_name: Some("page".to_string()),
            selector: None,
            url_pattern: None,
            max_pages: None,
            start_page: None,
        };
        let urls =
            generate_paginated_urls("https://example.test/list?page=9&q=x", &cfg, 2).unwrap();
        assert_eq!(urls[0], "https://example.test/list?q=x&page=1");
        assert_eq!(urls[1], "https://example.test/list?q=x&page=2");
    }

    #[test]
    fn test_generate_respects_max_pages() {
        let cfg = PaginationConfig {
            pagination_type: PaginationType::QueryParam,
            param_name: Some("p".to_string()),
            selector: None,
            url_pattern: None,
            max_pages: Some(2),
            start_page: None,
        };
        let urls = generate_paginated_urls("https://example.test/list", &cfg, 50).unwrap();
        assert_eq!(urls.len(), 2);
    }

    #[test]
    fn test_generate_path_urls() {
        let cfg = PaginationConfig {
            pagination_type: PaginationType::Path,
            param_name: None,
            selector: None,
            url_pattern: Some("/page/{n}".to_string()),
            max_pages: None,
            start_page: None,
        };
        let urls = generate_paginated_urls("https://example.test/list/page/1", &cfg, 2).unwrap();
        assert_eq!(
            urls,
            vec![
                "https://example.test/list/page/1",
                "https://example.test/list/page/2",
            ]
        );

        let appended = generate_paginated_urls("https://example.test/list", &cfg, 2).unwrap();
        assert_eq!(
            appended,
            vec![
                "https://example.test/list/page/1",
                "https://example.test/list/page/2",
            ]
        );
    }

    #[test]
    fn test_generate_next_button_returns_base_only() {
        let cfg = PaginationConfig {
            pagination_type: PaginationType::NextButton,
            param_name: None,
            selector: Some("a.next".to_string()),
            url_pattern: None,
            max_pages: None,
            start_page: None,
        };
        let urls = generate_paginated_urls("https://example.test/list", &cfg, 10).unwrap();
        assert_eq!(urls, vec!["https://example.test/list"]);
    }

    #[test]
    fn test_find_next_url_with_selector() {
        let html = r#"<html><body><a class="next" href="/list/2">next</a></body></html>"#;
        let next = find_next_url(html, Some("a.next"), "https://example.test/list");
        assert_eq!(next.as_deref(), Some("https://example.test/list/2"));
    }

    #[test]
    fn test_find_next_url_heuristic_fallback() {
        let html = r#"<html><body><a href="/list/3">Next</a></body></html>"#;
        let next = find_next_url(html, None, "https://example.test/list/2");
        assert_eq!(next.as_deref(), Some("https://example.test/list/3"));
    }

    #[test]
    fn test_find_next_url_absent() {
        let html = r#"<html><body><a href="/about">About</a></body></html>"#;
        assert!(find_next_url(html, None, "https://example.test/list").is_none());
    }
}
