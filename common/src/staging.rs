// Staging store: extracted rows parked between extract and commit
//
// Small payloads stay inline on the job record; large ones spill to
// `<staging_root>/<job_id>.json` as a pretty-printed JSON array.

use crate::errors::StagingError;
use crate::scrape::ExtractedRow;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Where `put` parked the rows
#[derive(Debug, Clone)]
pub struct StagedPayload {
    /// JSON text when small enough to live on the job record
    pub inline: Option<String>,
    /// Spill file path otherwise
    pub path: Option<String>,
    pub row_count: usize,
}

/// One page of staged rows, as the review UI consumes it
#[derive(Debug, Clone)]
pub struct StagedPage {
    pub rows: Vec<ExtractedRow>,
    /// Union of keys across the page, first-seen order
    pub columns: Vec<String>,
    pub total_row_count: usize,
}

pub struct StagingStore {
    root: PathBuf,
    inline_threshold: usize,
}

impl StagingStore {
    pub fn new(root: impl Into<PathBuf>, inline_threshold: usize) -> Self {
        Self {
            root: root.into(),
            inline_threshold,
        }
    }

    pub fn file_path(&self, job_id: Uuid) -> PathBuf {
        self.root.join(format!("{}.json", job_id))
    }

    /// Serialize rows; inline below the threshold, spill to disk above it
    #[instrument(skip(self, rows), fields(row_count = rows.len()))]
    pub async fn put(
        &self,
        job_id: Uuid,
        rows: &[ExtractedRow],
    ) -> Result<StagedPayload, StagingError> {
        let serialized = serde_json::to_string_pretty(rows)?;
        let row_count = rows.len();

        if serialized.len() < self.inline_threshold {
            debug!(bytes = serialized.len(), "staging payload kept inline");
            return Ok(StagedPayload {
                inline: Some(serialized),
                path: None,
                row_count,
            });
        }

        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.file_path(job_id);
        tokio::fs::write(&path, serialized.as_bytes()).await?;
        debug!(path = %path.display(), bytes = serialized.len(), "staging payload spilled to disk");

        Ok(StagedPayload {
            inline: None,
            path: Some(path.to_string_lossy().into_owned()),
            row_count,
        })
    }

    /// Read back a page of staged rows from either location
    pub async fn get(
        &self,
        job_id: Uuid,
        inline: Option<&str>,
        path: Option<&str>,
        page: usize,
        page_size: usize,
    ) -> Result<StagedPage, StagingError> {
        let rows = self.load_rows(job_id, inline, path).await?;
        let total_row_count = rows.len();

        let page = page.max(1);
        let page_size = page_size.max(1);
        let start = (page - 1) * page_size;
        let page_rows: Vec<ExtractedRow> =
            rows.into_iter().skip(start).take(page_size).collect();

        let mut columns = Vec::new();
        for row in &page_rows {
            for key in row.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }

        Ok(StagedPage {
            rows: page_rows,
            columns,
            total_row_count,
        })
    }

    /// All staged rows, for the commit path
    pub async fn load_rows(
        &self,
        job_id: Uuid,
        inline: Option<&str>,
        path: Option<&str>,
    ) -> Result<Vec<ExtractedRow>, StagingError> {
        let raw = match (inline, path) {
            (Some(inline), _) => inline.to_string(),
            (None, Some(path)) => tokio::fs::read_to_string(path).await?,
            (None, None) => return Err(StagingError::NotFound(job_id)),
        };

        let rows: Vec<Value> = serde_json::from_str(&raw)?;
        Ok(rows
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect())
    }

    /// Remove the spill file if present; missing files are not an error
    pub async fn delete(&self, job_id: Uuid) {
        let path = self.file_path(job_id);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to delete staging file");
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(name: &str, price: f64) -> ExtractedRow {
        let mut map = ExtractedRow::new();
        map.insert("name".to_string(), json!(name));
        map.insert("price".to_string(), json!(price));
        map
    }

    fn store(threshold: usize) -> (tempfile::TempDir, StagingStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StagingStore::new(dir.path().join("staging"), threshold);
        (dir, store)
    }

    #[tokio::test]
    async fn test_small_payload_stays_inline() {
        let (_dir, store) = store(1024 * 1024);
        let rows = vec![row("a", 1.0), row("b", 2.0)];
        let payload = store.put(Uuid::new_v4(), &rows).await.unwrap();

        assert!(payload.inline.is_some());
        assert!(payload.path.is_none());
        assert_eq!(payload.row_count, 2);
    }

    #[tokio::test]
    async fn test_large_payload_spills_to_disk() {
        let (_dir, store) = store(16);
        let job_id = Uuid::new_v4();
        let rows = vec![row("a", 1.0), row("b", 2.0)];
        let payload = store.put(job_id, &rows).await.unwrap();

        assert!(payload.inline.is_none());
        let path = payload.path.expect("spill path");
        assert!(path.ends_with(&format!("{}.json", job_id)));
        assert!(std::path::Path::new(&path).exists());
    }

    #[tokio::test]
    async fn test_round_trip_preserves_rows_and_column_order() {
        let (_dir, store) = store(16);
        let job_id = Uuid::new_v4();
        let rows = vec![row("a", 1.0), row("b", 2.0), row("c", 3.0)];
        let payload = store.put(job_id, &rows).await.unwrap();

        let page = store
            .get(job_id, payload.inline.as_deref(), payload.path.as_deref(), 1, 10)
            .await
            .unwrap();
        assert_eq!(page.total_row_count, 3);
        assert_eq!(page.rows.len(), 3);
        assert_eq!(page.rows[1]["name"], json!("b"));
        assert_eq!(page.columns, vec!["name", "price"]);

        // column order is stable across repeated reads
        let again = store
            .get(job_id, payload.inline.as_deref(), payload.path.as_deref(), 1, 10)
            .await
            .unwrap();
        assert_eq!(again.columns, page.columns);
    }

    #[tokio::test]
    async fn test_pagination_of_staged_rows() {
        let (_dir, store) = store(1024 * 1024);
        let job_id = Uuid::new_v4();
        let rows: Vec<ExtractedRow> = (0..5).map(|i| row(&format!("r{}", i), i as f64)).collect();
        let payload = store.put(job_id, &rows).await.unwrap();

        let page2 = store
            .get(job_id, payload.inline.as_deref(), None, 2, 2)
            .await
            .unwrap();
        assert_eq!(page2.total_row_count, 5);
        assert_eq!(page2.rows.len(), 2);
        assert_eq!(page2.rows[0]["name"], json!("r2"));
    }

    #[tokio::test]
    async fn test_delete_is_quiet_on_missing_file() {
        let (_dir, store) = store(16);
        store.delete(Uuid::new_v4()).await;

        let job_id = Uuid::new_v4();
        let rows = vec![row("a", 1.0)];
        let payload = store.put(job_id, &rows).await.unwrap();
        let path = payload.path.expect("spill path");
        store.delete(job_id).await;
        assert!(!std::path::Path::new(&path).exists());
    }

    #[tokio::test]
    async fn test_get_without_payload_is_not_found() {
        let (_dir, store) = store(16);
        let err = store.get(Uuid::new_v4(), None, None, 1, 10).await.unwrap_err();
        assert!(matches!(err, StagingError::NotFound(_)));
    }
}
