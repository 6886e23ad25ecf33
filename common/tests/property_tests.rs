// Property-based tests for the extraction core

use common::connector::placeholder;
use common::executor::insert::{build_insert_sql, row_params};
use common::models::{DbType, PaginationConfig, PaginationType};
use common::scheduler::normalize_cron;
use common::scrape::extract::xpath_to_css;
use common::scrape::generate_paginated_urls;
use common::scrape::ExtractedRow;
use common::staging::StagingStore;
use proptest::prelude::*;
use serde_json::{json, Value};
use uuid::Uuid;

fn ident() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[a-z][a-z0-9_]{0,11}").unwrap()
}

fn query_param_config() -> impl Strategy<Value = PaginationConfig> {
    (
        prop_oneof!["page", "p", "offset", "start"],
        1u32..=200,
        1u32..=5,
    )
        .prop_map(|(param, max_pages, start_page)| PaginationConfig {
            pagination_type: PaginationType::QueryParam,
            param_name: Some(param.to_string()),
            selector: None,
            url_pattern: None,
            max_pages: Some(max_pages),
            start_page: Some(start_page),
        })
}

fn row_strategy() -> impl Strategy<Value = ExtractedRow> {
    proptest::collection::btree_map(
        ident(),
        prop_oneof![
            any::<i64>().prop_map(|n| json!(n)),
            "[a-zA-Z0-9 ]{0,20}".prop_map(|s| json!(s)),
            Just(Value::Null),
        ],
        1..6,
    )
    .prop_map(|m| m.into_iter().collect())
}

proptest! {
    // ========================================================================
    // Pagination
    // ========================================================================

    #[test]
    fn prop_query_param_expansion_length_and_distinctness(
        cfg in query_param_config(),
        cap in 1u32..=150,
    ) {
        let base = "https://example.test/list";
        let urls = generate_paginated_urls(base, &cfg, cap).unwrap();

        prop_assert_eq!(urls.len() as u32, cap.min(cfg.max_pages()));

        // every member parses and carries the parameter with the right value
        let param = cfg.param_name.clone().unwrap();
        for (i, url) in urls.iter().enumerate() {
            let parsed = url::Url::parse(url).unwrap();
            let value = parsed
                .query_pairs()
                .find(|(k, _)| *k == param)
                .map(|(_, v)| v.into_owned())
                .unwrap();
            prop_assert_eq!(value, (cfg.start_page() + i as u32).to_string());
        }

        // all members are pairwise distinct
        let mut sorted = urls.clone();
        sorted.sort();
        sorted.dedup();
        prop_assert_eq!(sorted.len(), urls.len());
    }

    #[test]
    fn prop_path_expansion_substitutes_sequentially(
        start in 1u32..=5,
        cap in 1u32..=30,
    ) {
        let cfg = PaginationConfig {
            pagination_type: PaginationType::Path,
            param_name: None,
            selector: None,
            url_pattern: Some("/page/{n}".to_string()),
            max_pages: None,
            start_page: Some(start),
        };
        let urls = generate_paginated_urls("https://example.test/list", &cfg, cap).unwrap();

        prop_assert_eq!(urls.len() as u32, cap);
        for (i, url) in urls.iter().enumerate() {
            prop_assert!(url.ends_with(&format!("/page/{}", start + i as u32)), "unexpected url: {}", url);
        }
    }

    // ========================================================================
    // Placeholders and insert SQL
    // ========================================================================

    #[test]
    fn prop_insert_sql_placeholder_counts(
        cols in proptest::collection::vec(ident(), 1..8),
        db_type in prop_oneof![
            Just(DbType::PostgreSql),
            Just(DbType::MySql),
            Just(DbType::MsSql),
            Just(DbType::Sqlite),
        ],
    ) {
        let mut cols = cols;
        cols.sort();
        cols.dedup();

        let sql = build_insert_sql(db_type, "s", "t", &cols);

        let expected: Vec<String> = (1..=cols.len()).map(|n| placeholder(db_type, n)).collect();
        let values_part = sql.split("VALUES").nth(1).unwrap();
        match db_type {
            DbType::MySql | DbType::Sqlite => {
                prop_assert_eq!(values_part.matches('?').count(), cols.len());
            }
            DbType::PostgreSql | DbType::MsSql => {
                for ph in &expected {
                    prop_assert!(values_part.contains(ph.as_str()));
                }
            }
        }

        // one placeholder slot per column
        prop_assert_eq!(values_part.matches(',').count(), cols.len() - 1);
    }

    #[test]
    fn prop_row_params_align_with_columns(
        row in row_strategy(),
    ) {
        let columns: Vec<String> = row.keys().cloned().collect();
        let params = row_params(&columns, &row);
        prop_assert_eq!(params.len(), columns.len());
        for (column, param) in columns.iter().zip(&params) {
            prop_assert_eq!(row.get(column).unwrap(), param);
        }
    }

    // ========================================================================
    // Cron normalization
    // ========================================================================

    #[test]
    fn prop_five_field_cron_normalizes_to_six(
        minute in 0u32..60,
        hour in 0u32..24,
    ) {
        let expr = format!("{} {} * * *", minute, hour);
        let normalized = normalize_cron(&expr).unwrap();
        prop_assert_eq!(normalized.split_whitespace().count(), 6);
        prop_assert!(normalized.starts_with("0 "));
        // normalization is idempotent on its own output
        prop_assert_eq!(normalize_cron(&normalized).unwrap(), normalized);
    }

    // ========================================================================
    // XPath translation
    // ========================================================================

    #[test]
    fn prop_xpath_subset_translates_to_parseable_css(
        tags in proptest::collection::vec(prop_oneof!["div", "span", "li", "a", "td"], 1..4),
        descendant in proptest::collection::vec(any::<bool>(), 1..4),
        class in proptest::option::of("[a-z]{1,8}"),
    ) {
        let mut xpath = String::new();
        for (i, tag) in tags.iter().enumerate() {
            let axis = if *descendant.get(i).unwrap_or(&true) { "//" } else { "/" };
            xpath.push_str(axis);
            xpath.push_str(tag);
        }
        if let Some(class) = &class {
            xpath.push_str(&format!("[@class='{}']", class));
        }

        let css = xpath_to_css(&xpath).unwrap();
        prop_assert!(scraper::Selector::parse(&css).is_ok(), "css `{}` must parse", css);
    }
}

// ============================================================================
// Staging fidelity (async, driven through a runtime per case)
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_staging_round_trip_preserves_rows(
        rows in proptest::collection::vec(row_strategy(), 0..20),
        inline_threshold in prop_oneof![Just(8usize), Just(1024 * 1024)],
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let store = StagingStore::new(dir.path().join("staging"), inline_threshold);
            let job_id = Uuid::new_v4();

            let payload = store.put(job_id, &rows).await.unwrap();
            prop_assert_eq!(payload.row_count, rows.len());
            prop_assert!(payload.inline.is_some() != payload.path.is_some());

            let page = store
                .get(
                    job_id,
                    payload.inline.as_deref(),
                    payload.path.as_deref(),
                    1,
                    rows.len().max(1),
                )
                .await
                .unwrap();

            prop_assert_eq!(page.total_row_count, rows.len());
            prop_assert_eq!(&page.rows, &rows);

            // column order is stable across repeated reads
            let again = store
                .get(
                    job_id,
                    payload.inline.as_deref(),
                    payload.path.as_deref(),
                    1,
                    rows.len().max(1),
                )
                .await
                .unwrap();
            prop_assert_eq!(again.columns, page.columns);

            store.delete(job_id).await;
            Ok(())
        })?;
    }
}
