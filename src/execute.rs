//! Query execution against the project's SQLite database.

use crate::error::{AgentError, Result};
use crate::storage::ObjectStore;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;

/// Rows shown back to the user inline; the full set goes to storage.
pub const PREVIEW_ROWS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub query_id: String,
    pub sql: String,
    pub columns: Vec<String>,
    /// First rows only, every cell rendered as text.
    pub preview: Vec<Vec<String>>,
    pub row_count: usize,
    pub elapsed_ms: u64,
    /// Storage path of the full result CSV, when upload succeeded.
    #[serde(default)]
    pub results_path: Option<String>,
}

/// Run `sql` against the database at `db_path` and upload the full result
/// set as CSV. A missing database file is fatal: there is no degraded
/// answer to give at execution time. A failed upload only costs the
/// `results_path`, never the result.
pub async fn run_query(
    db_path: &Path,
    sql: &str,
    store: &dyn ObjectStore,
    project_key: &str,
) -> Result<QueryResult> {
    if !db_path.exists() {
        return Err(AgentError::Database(format!(
            "database file not found at {}",
            db_path.display()
        )));
    }

    let started = Instant::now();
    let (columns, rows) = fetch_rows(db_path, sql)?;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let query_id = uuid::Uuid::new_v4().to_string();
    let row_count = rows.len();
    tracing::info!(%query_id, rows = row_count, elapsed_ms, "query executed");

    let results_path = match upload_csv(store, project_key, &query_id, &columns, &rows).await {
        Ok(path) => Some(path),
        Err(e) => {
            tracing::warn!(error = %e, "result upload failed, returning preview only");
            None
        }
    };

    Ok(QueryResult {
        query_id,
        sql: sql.to_string(),
        columns,
        preview: rows.into_iter().take(PREVIEW_ROWS).collect(),
        row_count,
        elapsed_ms,
        results_path,
    })
}

fn fetch_rows(db_path: &Path, sql: &str) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let conn = Connection::open(db_path)
        .map_err(|e| AgentError::Database(format!("failed to open database: {}", e)))?;
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| AgentError::Database(format!("failed to prepare query: {}", e)))?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let column_count = columns.len();

    let mut raw = stmt
        .query([])
        .map_err(|e| AgentError::Database(format!("query failed: {}", e)))?;
    let mut rows: Vec<Vec<String>> = Vec::new();
    while let Some(row) = raw
        .next()
        .map_err(|e| AgentError::Database(format!("row fetch failed: {}", e)))?
    {
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            let cell = match row
                .get_ref(i)
                .map_err(|e| AgentError::Database(format!("cell read failed: {}", e)))?
            {
                rusqlite::types::ValueRef::Null => String::new(),
                rusqlite::types::ValueRef::Integer(v) => v.to_string(),
                rusqlite::types::ValueRef::Real(v) => v.to_string(),
                rusqlite::types::ValueRef::Text(v) => String::from_utf8_lossy(v).to_string(),
                rusqlite::types::ValueRef::Blob(_) => "<blob>".to_string(),
            };
            values.push(cell);
        }
        rows.push(values);
    }
    Ok((columns, rows))
}

async fn upload_csv(
    store: &dyn ObjectStore,
    project_key: &str,
    query_id: &str,
    columns: &[String],
    rows: &[Vec<String>],
) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(columns)?;
    for row in rows {
        writer.write_record(row)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| AgentError::Io(e.into_error()))?;
    let path = format!("{}/results/{}.csv", project_key, query_id);
    store.upload(&bytes, &path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsObjectStore;

    fn seeded_db(name: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("cohort_exec_{}_{}.db", name, std::process::id()));
        let _ = std::fs::remove_file(&path);
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE patient (patient_id INTEGER PRIMARY KEY, gender TEXT);
             INSERT INTO patient (patient_id, gender) VALUES (1, 'Female'), (2, 'Male'), (3, 'Female');",
        )
        .unwrap();
        path
    }

    #[tokio::test]
    async fn test_run_query_counts_and_previews() {
        let db = seeded_db("basic");
        let store_root = std::env::temp_dir().join(format!("cohort_exec_store_{}", std::process::id()));
        let store = FsObjectStore::new(&store_root);

        let result = run_query(
            &db,
            "SELECT patient.patient_id FROM patient WHERE patient.gender = 'Female'",
            &store,
            "p1",
        )
        .await
        .unwrap();

        assert_eq!(result.row_count, 2);
        assert_eq!(result.columns, vec!["patient_id"]);
        assert_eq!(result.preview.len(), 2);
        assert!(result.results_path.is_some());
        assert!(result.elapsed_ms < 10_000);

        let _ = std::fs::remove_file(db);
        let _ = std::fs::remove_dir_all(store_root);
    }

    #[tokio::test]
    async fn test_missing_db_file_is_fatal() {
        let store_root = std::env::temp_dir().join(format!("cohort_exec_missing_{}", std::process::id()));
        let store = FsObjectStore::new(&store_root);
        let err = run_query(Path::new("/nonexistent/project.db"), "SELECT 1", &store, "p1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("database file not found"));
    }
}
