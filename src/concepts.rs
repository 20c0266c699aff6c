//! Concept table: distinct observed values of non-numeric, non-identifier
//! fields, used as resolvable row-level vocabulary.

use crate::error::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConceptRow {
    pub concept_name: String,
    pub table_name: String,
    pub field_name: String,
    pub concept_with_context: String,
}

/// Stable composite key used as the concept-embedding index key.
pub fn context_key(table: &str, field: &str, concept: &str) -> String {
    format!("{}_{}_{}", table, field, concept)
}

#[derive(Debug, Clone, Default)]
pub struct ConceptTable {
    pub rows: Vec<ConceptRow>,
}

impl ConceptTable {
    pub fn new(rows: Vec<ConceptRow>) -> Self {
        Self { rows }
    }

    pub fn from_csv(bytes: &[u8]) -> Result<Self> {
        let mut reader = csv::Reader::from_reader(bytes);
        let mut rows = Vec::new();
        for record in reader.deserialize() {
            let row: ConceptRow = record?;
            rows.push(row);
        }
        Ok(Self { rows })
    }

    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in &self.rows {
            writer.serialize(row)?;
        }
        writer
            .into_inner()
            .map_err(|e| crate::error::AgentError::Storage(format!("csv flush failed: {}", e)))
    }

    /// Distinct concept values for one table.field, order of first
    /// appearance preserved.
    pub fn distinct_values(&self, table: &str, field: &str) -> Vec<&ConceptRow> {
        let mut seen = std::collections::HashSet::new();
        self.rows
            .iter()
            .filter(|r| r.table_name == table && r.field_name == field)
            .filter(|r| seen.insert(r.concept_name.as_str()))
            .collect()
    }

    /// Number of distinct concept values for one table.field. Drives the
    /// cardinality-gated hybrid resolution policy.
    pub fn cardinality(&self, table: &str, field: &str) -> usize {
        self.distinct_values(table, field).len()
    }

    /// Owning table.field for a context key, if present.
    pub fn owner_of(&self, key: &str) -> Option<String> {
        self.rows
            .iter()
            .find(|r| r.concept_with_context == key)
            .map(|r| format!("{}.{}", r.table_name, r.field_name))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(concept: &str, table: &str, field: &str) -> ConceptRow {
        ConceptRow {
            concept_name: concept.to_string(),
            table_name: table.to_string(),
            field_name: field.to_string(),
            concept_with_context: context_key(table, field, concept),
        }
    }

    #[test]
    fn test_distinct_values_dedupes_and_preserves_order() {
        let table = ConceptTable::new(vec![
            row("Male", "patient", "gender"),
            row("Female", "patient", "gender"),
            row("Male", "patient", "gender"),
            row("Asthma", "diagnosis", "condition"),
        ]);
        let values: Vec<&str> = table
            .distinct_values("patient", "gender")
            .iter()
            .map(|r| r.concept_name.as_str())
            .collect();
        assert_eq!(values, vec!["Male", "Female"]);
        assert_eq!(table.cardinality("patient", "gender"), 2);
    }

    #[test]
    fn test_csv_round_trip() {
        let table = ConceptTable::new(vec![row("Asthma", "diagnosis", "condition")]);
        let bytes = table.to_csv().unwrap();
        let back = ConceptTable::from_csv(&bytes).unwrap();
        assert_eq!(back.rows, table.rows);
    }

    #[test]
    fn test_owner_of() {
        let table = ConceptTable::new(vec![row("Asthma", "diagnosis", "condition")]);
        assert_eq!(
            table.owner_of("diagnosis_condition_Asthma").as_deref(),
            Some("diagnosis.condition")
        );
        assert!(table.owner_of("missing").is_none());
    }
}
