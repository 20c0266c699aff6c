//! SQL synthesis, query assembly, and validation.

use super::{Criterion, CriterionKind, MappingEngine};
use crate::error::{AgentError, Result};
use crate::llm::parse_structured;
use crate::schema::resolve_primary_key;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeSet, HashSet, VecDeque};

const SQL_SYSTEM: &str = "You translate cohort criteria into SQL boolean expressions. Respond with strict JSON only, no prose, no markdown fences.";

/// How a criterion's comparison should be phrased. Decided from field
/// metadata, never by the model: a numeric field with a declared value
/// range gets a range comparison, everything else a single-value one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisMode {
    Range,
    SingleValue,
}

#[derive(Debug, Deserialize)]
struct SqlResponse {
    sql: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

fn field_token_regex() -> Regex {
    // Identifiers start with a letter or underscore so numeric literals
    // like 8.5 are never mistaken for field references.
    Regex::new(r"\b([A-Za-z_]\w*)\.([A-Za-z_]\w*)\b").expect("field token regex")
}

impl MappingEngine {
    /// Pick the synthesis mode for a resolved `table.field`.
    pub fn synthesis_mode(&self, field: &str) -> SynthesisMode {
        if let Some((table, column)) = field.split_once('.') {
            if let Some(info) = self.bundle.catalog.field(table, column) {
                if info.is_numeric() && info.field_value_range.is_some() {
                    return SynthesisMode::Range;
                }
            }
        }
        SynthesisMode::SingleValue
    }

    /// Rewrite one criterion into a SQL boolean expression over its
    /// resolved fields and values. Exclude criteria come back wrapped in
    /// `NOT (...)`.
    pub async fn synthesize_sql(&self, criterion: &Criterion) -> Result<String> {
        let mut mapped = Vec::new();
        for (entity, mapping) in &criterion.mappings {
            if mapping.field.is_empty() {
                continue;
            }
            let mode = match self.synthesis_mode(&mapping.field) {
                SynthesisMode::Range => "numeric range comparison (>, <, >=, <=, BETWEEN)",
                SynthesisMode::SingleValue => "single-value comparison (=, !=, IN)",
            };
            let range_note = mapping
                .field
                .split_once('.')
                .and_then(|(t, f)| self.bundle.catalog.field(t, f))
                .and_then(|info| info.field_value_range.as_ref())
                .map(|r| format!(" observed range [{}, {}]", r.min, r.max))
                .unwrap_or_default();
            let values = if mapping.concepts.is_empty() {
                mapping.value.clone()
            } else {
                mapping.concepts.join(", ")
            };
            mapped.push(format!(
                "- entity \"{}\" -> {} ({}{}), values: {}",
                entity, mapping.field, mode, range_note, values
            ));
        }
        if mapped.is_empty() {
            return Err(AgentError::Sql(format!(
                "criterion '{}' has no resolved field mappings",
                criterion.text
            )));
        }

        let prompt = format!(
            r#"Write a SQL boolean expression for this cohort criterion.

Criterion: {text}

Resolved mappings:
{mapped}

Rules:
- Reference fields as table.field.
- Operators allowed: =, !=, >, <, >=, <=, IN, BETWEEN.
- Quote string values with single quotes; leave numeric values unquoted.
- Follow the comparison style noted per mapping.
- Expression only, no SELECT, no WHERE keyword.

Return JSON: {{"sql": "..."}}"#,
            text = criterion.text,
            mapped = mapped.join("\n"),
        );
        let response = self.llm.complete(SQL_SYSTEM, &prompt).await?;
        let parsed: SqlResponse = parse_structured(&response)?;
        let expr = parsed.sql.trim().to_string();
        if expr.is_empty() {
            return Err(AgentError::Sql(format!(
                "empty SQL expression for criterion '{}'",
                criterion.text
            )));
        }
        Ok(match criterion.kind {
            CriterionKind::Include => expr,
            CriterionKind::Exclude => format!("NOT ({})", expr),
        })
    }

    /// Assemble the complete statement from per-criterion expressions:
    /// root selection, join discovery, AND-joined WHERE.
    pub fn build_query(&self, criteria: &[Criterion]) -> Result<String> {
        let clauses: Vec<&str> = criteria
            .iter()
            .filter_map(|c| c.sql.as_deref())
            .collect();

        // Referenced tables, sorted for deterministic root selection.
        let token_re = field_token_regex();
        let mut referenced: BTreeSet<String> = BTreeSet::new();
        for clause in &clauses {
            for cap in token_re.captures_iter(clause) {
                referenced.insert(cap[1].to_string());
            }
        }

        let root = referenced
            .iter()
            .find(|t| self.bundle.key_graph.declared_pk(t).is_some())
            .or_else(|| referenced.iter().next())
            .cloned()
            .or_else(|| self.bundle.catalog.tables.keys().next().cloned())
            .ok_or_else(|| AgentError::Sql("no tables available for query assembly".into()))?;

        let root_pk = resolve_primary_key(&root, &self.bundle.catalog, &self.bundle.key_graph);
        let joins = self.discover_joins(&root, &referenced);

        let mut query = format!("SELECT {root}.{root_pk} FROM {root}");
        for join in &joins {
            query.push(' ');
            query.push_str(join);
        }
        query.push_str(" WHERE ");
        if clauses.is_empty() {
            query.push_str("1=1");
        } else {
            query.push_str(&clauses.join(" AND "));
        }
        Ok(query)
    }

    /// Breadth-first walk from the root over forward and reverse FK edges,
    /// restricted to the required tables. One JOIN per table newly reached;
    /// tables unreachable over FK edges are silently left out.
    fn discover_joins(&self, root: &str, required: &BTreeSet<String>) -> Vec<String> {
        let catalog = &self.bundle.catalog;
        let keys = &self.bundle.key_graph;
        let mut joins = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(root.to_string());
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(root.to_string());

        while let Some(current) = queue.pop_front() {
            if required.iter().all(|t| visited.contains(t)) {
                break;
            }

            // Forward: current holds an FK pointing at another table.
            if let Some(fks) = keys.foreign_keys(&current) {
                for (fk_field, target) in fks {
                    if !required.contains(target) || visited.contains(target) {
                        continue;
                    }
                    let target_pk = resolve_primary_key(target, catalog, keys);
                    joins.push(format!(
                        "JOIN {target} ON {current}.{fk_field} = {target}.{target_pk}"
                    ));
                    visited.insert(target.clone());
                    queue.push_back(target.clone());
                }
            }

            // Reverse: another table holds an FK pointing at current.
            let current_pk = resolve_primary_key(&current, catalog, keys);
            for other in required {
                if visited.contains(other) {
                    continue;
                }
                let Some(fks) = keys.foreign_keys(other) else {
                    continue;
                };
                for (fk_field, target) in fks {
                    if target == &current {
                        joins.push(format!(
                            "JOIN {other} ON {other}.{fk_field} = {current}.{current_pk}"
                        ));
                        visited.insert(other.clone());
                        queue.push_back(other.clone());
                        break;
                    }
                }
            }
        }

        let unreachable: Vec<&String> = required.iter().filter(|t| !visited.contains(*t)).collect();
        if !unreachable.is_empty() {
            tracing::warn!(?unreachable, "tables unreachable over FK edges, omitting joins");
        }
        joins
    }

    /// Check every `table.field` token against the catalog. Unknown table
    /// or field is an error; an expression with no field token at all is a
    /// warning (query may still be attempted). A `table.None` token means
    /// an unresolved value leaked into SQL and fails validation outright.
    pub fn validate(&self, criteria: &[Criterion]) -> ValidationReport {
        let token_re = field_token_regex();
        let mut report = ValidationReport {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        };

        for criterion in criteria {
            let Some(sql) = criterion.sql.as_deref() else {
                continue;
            };
            let mut saw_token = false;
            for cap in token_re.captures_iter(sql) {
                saw_token = true;
                let (table, field) = (&cap[1], &cap[2]);
                if field == "None" {
                    report.errors.push(format!(
                        "criterion '{}': unresolved value reference {}.{}",
                        criterion.label, table, field
                    ));
                    continue;
                }
                if self.bundle.catalog.table(table).is_none() {
                    report.errors.push(format!(
                        "criterion '{}': unknown table '{}' in {}.{}",
                        criterion.label, table, table, field
                    ));
                } else if !self.bundle.catalog.has_field(table, field) {
                    report.errors.push(format!(
                        "criterion '{}': unknown field '{}.{}'",
                        criterion.label, table, field
                    ));
                }
            }
            if !saw_token {
                report.warnings.push(format!(
                    "criterion '{}': expression has no table.field reference",
                    criterion.label
                ));
            }
        }

        report.valid = report.errors.is_empty();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ArtifactBundle;
    use crate::concepts::ConceptTable;
    use crate::embedder::{Embedding, EmbeddingService};
    use crate::index::{EmbeddingIndex, FieldEmbeddingIndex};
    use crate::llm::LlmService;
    use crate::schema::{FieldInfo, KeyGraph, SchemaCatalog, TableInfo, TableKeys, ValueRange};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct NoLlm;
    #[async_trait::async_trait]
    impl LlmService for NoLlm {
        async fn complete(&self, _: &str, _: &str) -> crate::error::Result<String> {
            Err(AgentError::Llm("not wired in this test".into()))
        }
    }

    struct NoEmbed;
    #[async_trait::async_trait]
    impl EmbeddingService for NoEmbed {
        async fn embed(&self, _: &str) -> crate::error::Result<Embedding> {
            Err(AgentError::Embedding("not wired in this test".into()))
        }
        async fn embed_batch(&self, _: &[String]) -> crate::error::Result<Vec<Embedding>> {
            Err(AgentError::Embedding("not wired in this test".into()))
        }
    }

    fn field(dtype: &str) -> FieldInfo {
        FieldInfo {
            field_data_type: dtype.to_string(),
            ..Default::default()
        }
    }

    fn engine() -> MappingEngine {
        let mut tables = BTreeMap::new();
        tables.insert(
            "patient".to_string(),
            TableInfo {
                table_description: "one row per patient".to_string(),
                fields: BTreeMap::from([
                    ("patient_id".to_string(), field("integer")),
                    ("gender".to_string(), field("text")),
                    (
                        "age".to_string(),
                        FieldInfo {
                            field_data_type: "integer".to_string(),
                            field_value_range: Some(ValueRange { min: 0.0, max: 110.0 }),
                            ..Default::default()
                        },
                    ),
                ]),
            },
        );
        tables.insert(
            "lab_result".to_string(),
            TableInfo {
                table_description: "lab measurements".to_string(),
                fields: BTreeMap::from([
                    ("result_id".to_string(), field("integer")),
                    ("patient_id".to_string(), field("integer")),
                    ("hemoglobin".to_string(), field("real")),
                ]),
            },
        );
        tables.insert(
            "visit".to_string(),
            TableInfo {
                fields: BTreeMap::from([
                    ("visit_id".to_string(), field("integer")),
                    ("patient_id".to_string(), field("integer")),
                ]),
                ..Default::default()
            },
        );
        let catalog = SchemaCatalog { tables };

        let mut key_tables = BTreeMap::new();
        key_tables.insert(
            "patient".to_string(),
            TableKeys {
                pk: Some("patient_id".to_string()),
                fks: BTreeMap::new(),
            },
        );
        key_tables.insert(
            "lab_result".to_string(),
            TableKeys {
                pk: Some("result_id".to_string()),
                fks: BTreeMap::from([("patient_id".to_string(), "patient".to_string())]),
            },
        );
        key_tables.insert(
            "visit".to_string(),
            TableKeys {
                pk: Some("visit_id".to_string()),
                fks: BTreeMap::from([("patient_id".to_string(), "patient".to_string())]),
            },
        );
        let key_graph = KeyGraph { tables: key_tables };

        let bundle = ArtifactBundle {
            catalog,
            key_graph,
            field_index: FieldEmbeddingIndex::default(),
            concept_table: ConceptTable::default(),
            concept_index: EmbeddingIndex::default(),
            db_path: None,
        };
        MappingEngine::new(Arc::new(bundle), Arc::new(NoLlm), Arc::new(NoEmbed))
    }

    fn with_sql(kind: CriterionKind, text: &str, sql: &str) -> Criterion {
        let mut c = Criterion::new(kind, text);
        c.sql = Some(sql.to_string());
        c
    }

    #[test]
    fn test_query_shape_one_select_one_where() {
        let engine = engine();
        let criteria = vec![
            with_sql(CriterionKind::Include, "female", "patient.gender = 'Female'"),
            with_sql(
                CriterionKind::Include,
                "low hemoglobin",
                "lab_result.hemoglobin < 8",
            ),
        ];
        let query = engine.build_query(&criteria).unwrap();
        assert_eq!(query.matches("SELECT").count(), 1);
        assert_eq!(query.matches("WHERE").count(), 1);
        assert_eq!(query.matches(" AND ").count(), 1);
        assert!(query.starts_with("SELECT patient.patient_id FROM patient"));
        assert!(query.contains("JOIN lab_result ON lab_result.patient_id = patient.patient_id"));
    }

    #[test]
    fn test_empty_clause_list_gets_trivial_where() {
        let engine = engine();
        let query = engine.build_query(&[]).unwrap();
        assert!(query.ends_with("WHERE 1=1"));
    }

    #[test]
    fn test_root_selection_deterministic() {
        let engine = engine();
        let criteria = vec![
            with_sql(
                CriterionKind::Include,
                "visited",
                "visit.visit_id > 0",
            ),
            with_sql(
                CriterionKind::Include,
                "low hemoglobin",
                "lab_result.hemoglobin < 8",
            ),
        ];
        let first = engine.build_query(&criteria).unwrap();
        let second = engine.build_query(&criteria).unwrap();
        assert_eq!(first, second);
        // Sorted referenced set means lab_result wins the tie-break.
        assert!(first.starts_with("SELECT lab_result.result_id FROM lab_result"));
    }

    #[test]
    fn test_bfs_no_duplicate_or_extra_joins() {
        let engine = engine();
        let criteria = vec![
            with_sql(CriterionKind::Include, "female", "patient.gender = 'Female'"),
            with_sql(
                CriterionKind::Include,
                "low hemoglobin",
                "lab_result.hemoglobin < 8",
            ),
        ];
        let query = engine.build_query(&criteria).unwrap();
        assert_eq!(query.matches("JOIN lab_result").count(), 1);
        // visit is not referenced by any clause, so it never appears.
        assert!(!query.contains("visit"));
    }

    #[test]
    fn test_synthesis_mode_from_metadata() {
        let engine = engine();
        assert_eq!(engine.synthesis_mode("patient.age"), SynthesisMode::Range);
        // Numeric but no declared range.
        assert_eq!(
            engine.synthesis_mode("lab_result.hemoglobin"),
            SynthesisMode::SingleValue
        );
        assert_eq!(
            engine.synthesis_mode("patient.gender"),
            SynthesisMode::SingleValue
        );
    }

    #[test]
    fn test_validation_flags_unknown_field() {
        let engine = engine();
        let criteria = vec![with_sql(
            CriterionKind::Include,
            "smoker",
            "patient.smoking_status = 'Current'",
        )];
        let report = engine.validate(&criteria);
        assert!(!report.valid);
        assert!(report.errors[0].contains("patient.smoking_status"));
    }

    #[test]
    fn test_validation_table_none_is_hard_error() {
        let engine = engine();
        let criteria = vec![with_sql(
            CriterionKind::Include,
            "female",
            "patient.None = 'Female'",
        )];
        let report = engine.validate(&criteria);
        assert!(!report.valid);
        assert!(report.errors[0].contains("unresolved value"));
    }

    #[test]
    fn test_validation_warns_on_tokenless_expression() {
        let engine = engine();
        let criteria = vec![with_sql(CriterionKind::Include, "odd", "1 = 1")];
        let report = engine.validate(&criteria);
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
    }
}
