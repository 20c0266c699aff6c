//! Offline artifact generation for a project database.
//!
//! Walks a SQLite file, builds the schema catalog and key graph with
//! LLM-written descriptions, collects concept rows from the vocabulary
//! fields, and produces the two embedding indexes. Concept embeddings are
//! streamed to disk batch by batch so a project with tens of thousands of
//! rows never holds the full matrix in memory twice.

use crate::concepts::{context_key, ConceptRow, ConceptTable};
use crate::config::EMBEDDING_DIM;
use crate::embedder::{EmbeddingService, MAX_BATCH_SIZE};
use crate::error::{AgentError, Result};
use crate::index::{EmbeddingIndex, FieldEntry, FieldEmbeddingIndex};
use crate::llm::{parse_structured, LlmService};
use crate::schema::{FieldInfo, KeyGraph, SchemaCatalog, TableInfo, TableKeys, ValueRange};
use crate::storage;
use rusqlite::Connection;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Distinct values sampled per field for description prompts.
const SAMPLE_VALUES: usize = 20;
/// Share of string values that must parse as numbers for a field to count
/// as numeric-looking.
const NUMERIC_STRING_SHARE: f64 = 0.90;

const DESCRIBE_SYSTEM: &str = "You document clinical database schemas. Respond with strict JSON only, no prose, no markdown fences.";

#[derive(Debug, Deserialize)]
struct TableDescription {
    table_description: String,
    /// Field name -> one-sentence description.
    fields: BTreeMap<String, String>,
}

pub struct SchemaGenerator {
    llm: Arc<dyn LlmService>,
    embedder: Arc<dyn EmbeddingService>,
}

struct FieldStats {
    data_type: String,
    samples: Vec<String>,
    uniqueness_percent: f64,
    numeric_looking: bool,
    range: Option<ValueRange>,
    distinct: Vec<String>,
}

impl SchemaGenerator {
    pub fn new(llm: Arc<dyn LlmService>, embedder: Arc<dyn EmbeddingService>) -> Self {
        Self { llm, embedder }
    }

    /// Build catalog, key graph, and concept table from a database file.
    pub async fn generate(
        &self,
        db_path: &Path,
    ) -> Result<(SchemaCatalog, KeyGraph, ConceptTable)> {
        let conn = Connection::open(db_path)
            .map_err(|e| AgentError::Database(format!("failed to open database: {}", e)))?;

        let mut catalog = SchemaCatalog::default();
        let mut key_graph = KeyGraph::default();
        let mut concept_rows: Vec<ConceptRow> = Vec::new();

        for table in list_tables(&conn)? {
            let (columns, keys) = table_structure(&conn, &table)?;
            key_graph.tables.insert(table.clone(), keys);

            let mut fields = BTreeMap::new();
            for (column, declared_type) in &columns {
                let stats = field_stats(&conn, &table, column, declared_type)?;
                let concept_source = !(is_numeric_type(&stats.data_type)
                    || stats.numeric_looking
                    || stats.uniqueness_percent >= 100.0);
                if concept_source {
                    for value in &stats.distinct {
                        concept_rows.push(ConceptRow {
                            concept_name: value.clone(),
                            table_name: table.clone(),
                            field_name: column.clone(),
                            concept_with_context: context_key(&table, column, value),
                        });
                    }
                }
                fields.insert(
                    column.clone(),
                    FieldInfo {
                        field_data_type: stats.data_type,
                        field_description: String::new(),
                        field_sample_values: stats.samples,
                        field_uniqueness_percent: stats.uniqueness_percent,
                        field_value_range: stats.range,
                    },
                );
            }

            let mut info = TableInfo {
                table_description: String::new(),
                fields,
            };
            self.describe_table(&table, &mut info).await;
            catalog.tables.insert(table, info);
        }

        tracing::info!(
            tables = catalog.tables.len(),
            concepts = concept_rows.len(),
            "generated schema artifacts"
        );
        Ok((catalog, key_graph, ConceptTable::new(concept_rows)))
    }

    /// One prompt per table covering the table and all its fields. A
    /// failed call leaves the descriptions empty rather than failing the
    /// whole generation run.
    async fn describe_table(&self, table: &str, info: &mut TableInfo) {
        let listing = info
            .fields
            .iter()
            .map(|(name, f)| {
                format!(
                    "- {} ({}): samples {}",
                    name,
                    f.field_data_type,
                    f.field_sample_values.join(", ")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            r#"Describe this clinical database table and each of its fields in one sentence each.

Table: {table}
Fields:
{listing}

Return JSON: {{"table_description": "...", "fields": {{"field_name": "description"}}}}"#
        );
        match self.llm.complete(DESCRIBE_SYSTEM, &prompt).await {
            Ok(response) => match parse_structured::<TableDescription>(&response) {
                Ok(described) => {
                    info.table_description = described.table_description;
                    for (name, description) in described.fields {
                        if let Some(field) = info.fields.get_mut(&name) {
                            field.field_description = description;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(table, error = %e, "table description malformed, leaving blank");
                }
            },
            Err(e) => {
                tracing::warn!(table, error = %e, "table description call failed, leaving blank");
            }
        }
    }

    /// One entry per catalog field: descriptive text plus its embedding.
    pub async fn build_field_embedding_index(
        &self,
        catalog: &SchemaCatalog,
    ) -> Result<FieldEmbeddingIndex> {
        let mut keys = Vec::new();
        let mut texts = Vec::new();
        for (table, info) in &catalog.tables {
            for (field, meta) in &info.fields {
                keys.push(format!("{}.{}", table, field));
                texts.push(format!(
                    "{} {} in table {}: {}. samples: {}",
                    field,
                    meta.field_data_type,
                    table,
                    meta.field_description,
                    meta.field_sample_values.join(", ")
                ));
            }
        }
        let embeddings = self.embedder.embed_batch(&texts).await?;
        let entries: Vec<(String, FieldEntry)> = keys
            .into_iter()
            .zip(texts.into_iter().zip(embeddings))
            .map(|(key, (text, embedding))| (key, FieldEntry { text, embedding }))
            .collect();
        FieldEmbeddingIndex::new(entries)
    }

    /// Embed every concept context key, appending each batch's vectors to
    /// the matrix file as it arrives. Returns the loaded index.
    pub async fn build_concept_embedding_index(
        &self,
        concepts: &ConceptTable,
        matrix_path: &Path,
    ) -> Result<EmbeddingIndex> {
        let keys: Vec<String> = concepts
            .rows
            .iter()
            .map(|r| r.concept_with_context.clone())
            .collect();

        if let Some(parent) = matrix_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(matrix_path)?;
        for (batch_no, batch) in keys.chunks(MAX_BATCH_SIZE).enumerate() {
            let embeddings = self.embedder.embed_batch(batch).await?;
            file.write_all(&storage::matrix_to_bytes(&embeddings))?;
            tracing::debug!(batch = batch_no, size = batch.len(), "wrote concept embedding batch");
        }
        file.flush()?;

        let bytes = std::fs::read(matrix_path)?;
        let dim = if keys.is_empty() {
            EMBEDDING_DIM
        } else {
            bytes.len() / (keys.len() * 4)
        };
        let matrix = if keys.is_empty() {
            Vec::new()
        } else {
            storage::bytes_to_matrix(&bytes, dim)?
        };
        EmbeddingIndex::new(keys, matrix)
    }
}

fn list_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
        .map_err(|e| AgentError::Database(e.to_string()))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| AgentError::Database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| AgentError::Database(e.to_string()))?;
    Ok(names)
}

/// Column names with declared types, plus declared PK and FKs.
fn table_structure(conn: &Connection, table: &str) -> Result<(Vec<(String, String)>, TableKeys)> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", table))
        .map_err(|e| AgentError::Database(e.to_string()))?;
    let mut columns = Vec::new();
    let mut pk = None;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(5)?,
            ))
        })
        .map_err(|e| AgentError::Database(e.to_string()))?;
    for row in rows {
        let (name, dtype, is_pk) = row.map_err(|e| AgentError::Database(e.to_string()))?;
        if is_pk > 0 && pk.is_none() {
            pk = Some(name.clone());
        }
        columns.push((name, dtype.to_lowercase()));
    }

    let mut fks = BTreeMap::new();
    let mut stmt = conn
        .prepare(&format!("PRAGMA foreign_key_list({})", table))
        .map_err(|e| AgentError::Database(e.to_string()))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(3)?, row.get::<_, String>(2)?))
        })
        .map_err(|e| AgentError::Database(e.to_string()))?;
    for row in rows {
        let (from_field, target_table) = row.map_err(|e| AgentError::Database(e.to_string()))?;
        fks.insert(from_field, target_table);
    }

    Ok((columns, TableKeys { pk, fks }))
}

fn field_stats(
    conn: &Connection,
    table: &str,
    column: &str,
    declared_type: &str,
) -> Result<FieldStats> {
    let (total, distinct_count): (i64, i64) = conn
        .query_row(
            &format!(
                "SELECT COUNT({col}), COUNT(DISTINCT {col}) FROM {table} WHERE {col} IS NOT NULL",
                col = column,
                table = table
            ),
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|e| AgentError::Database(e.to_string()))?;
    let uniqueness_percent = if total == 0 {
        0.0
    } else {
        distinct_count as f64 / total as f64 * 100.0
    };

    let mut stmt = conn
        .prepare(&format!(
            "SELECT DISTINCT CAST({col} AS TEXT) FROM {table} WHERE {col} IS NOT NULL",
            col = column,
            table = table
        ))
        .map_err(|e| AgentError::Database(e.to_string()))?;
    let distinct: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| AgentError::Database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| AgentError::Database(e.to_string()))?;

    let numeric_count = distinct
        .iter()
        .filter(|v| v.trim().parse::<f64>().is_ok())
        .count();
    let numeric_looking = !distinct.is_empty()
        && numeric_count as f64 / distinct.len() as f64 >= NUMERIC_STRING_SHARE;

    let range = if is_numeric_type(declared_type) || numeric_looking {
        let values: Vec<f64> = distinct
            .iter()
            .filter_map(|v| v.trim().parse::<f64>().ok())
            .collect();
        match (
            values.iter().cloned().fold(f64::INFINITY, f64::min),
            values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        ) {
            (min, max) if min.is_finite() && max.is_finite() => Some(ValueRange { min, max }),
            _ => None,
        }
    } else {
        None
    };

    Ok(FieldStats {
        data_type: declared_type.to_string(),
        samples: distinct.iter().take(SAMPLE_VALUES).cloned().collect(),
        uniqueness_percent,
        numeric_looking,
        range,
        distinct,
    })
}

fn is_numeric_type(dtype: &str) -> bool {
    let lower = dtype.to_lowercase();
    ["int", "real", "float", "double", "numeric", "decimal"]
        .iter()
        .any(|t| lower.contains(t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_type_detection() {
        assert!(is_numeric_type("INTEGER"));
        assert!(is_numeric_type("real"));
        assert!(is_numeric_type("NUMERIC(10,2)"));
        assert!(!is_numeric_type("TEXT"));
        assert!(!is_numeric_type("varchar(20)"));
    }

    fn seeded_db(name: &str) -> std::path::PathBuf {
        let path =
            std::env::temp_dir().join(format!("cohort_gen_{}_{}.db", name, std::process::id()));
        let _ = std::fs::remove_file(&path);
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE patient (
                 patient_id INTEGER PRIMARY KEY,
                 gender TEXT,
                 mrn TEXT,
                 age_text TEXT
             );
             INSERT INTO patient VALUES
                 (1, 'Female', 'MRN001', '34'),
                 (2, 'Male', 'MRN002', '61'),
                 (3, 'Female', 'MRN003', '48');",
        )
        .unwrap();
        path
    }

    #[test]
    fn test_field_stats_uniqueness_and_numeric_string() {
        let db = seeded_db("stats");
        let conn = Connection::open(&db).unwrap();

        let gender = field_stats(&conn, "patient", "gender", "text").unwrap();
        assert!(gender.uniqueness_percent < 100.0);
        assert!(!gender.numeric_looking);
        assert_eq!(gender.distinct.len(), 2);

        // Every mrn value is unique: excluded from concepts by the caller.
        let mrn = field_stats(&conn, "patient", "mrn", "text").unwrap();
        assert!((mrn.uniqueness_percent - 100.0).abs() < f64::EPSILON);

        // Text column whose values all parse as numbers.
        let age = field_stats(&conn, "patient", "age_text", "text").unwrap();
        assert!(age.numeric_looking);
        assert!(age.range.is_some());

        let _ = std::fs::remove_file(db);
    }

    #[test]
    fn test_table_structure_reads_pk() {
        let db = seeded_db("keys");
        let conn = Connection::open(&db).unwrap();
        let (columns, keys) = table_structure(&conn, "patient").unwrap();
        assert_eq!(columns.len(), 4);
        assert_eq!(keys.pk.as_deref(), Some("patient_id"));
        let _ = std::fs::remove_file(db);
    }
}
