//! Criterion mapping pipeline.
//!
//! Stateless operations over one project's cached artifacts: extract
//! attribute/value pairs from criterion text, resolve each to a
//! `table.field`, resolve the value to row-level vocabulary, synthesize a
//! SQL fragment per criterion, assemble the full query with discovered
//! joins, and validate field references against the catalog.

pub mod extract;
pub mod fields;
pub mod sql;
pub mod values;

use crate::cache::ArtifactBundle;
use crate::embedder::EmbeddingService;
use crate::llm::LlmService;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CriterionKind {
    Include,
    Exclude,
}

impl CriterionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CriterionKind::Include => "include",
            CriterionKind::Exclude => "exclude",
        }
    }
}

/// Where a criterion came from. Agent-derived criteria are owned by the
/// pipeline; user-provided ones arrive pre-resolved from a manual editing
/// surface and are trusted as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CriterionOrigin {
    #[default]
    Agent,
    User,
}

/// Resolution state for one extracted entity within a criterion.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FieldMapping {
    /// Attribute label the extractor assigned ("gender", "age", ...).
    pub attribute: String,
    /// Resolved `table.field`, empty until field resolution ran.
    #[serde(default)]
    pub field: String,
    /// Ranked candidates kept for the editing surface, at most five.
    #[serde(default)]
    pub candidates: Vec<String>,
    /// Concrete row-level vocabulary values chosen for this entity.
    #[serde(default)]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub operator: String,
    /// Current value as last edited by the user, raw entity text initially.
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Criterion {
    pub id: String,
    pub kind: CriterionKind,
    /// Free text as extracted ("diagnosed with type 2 diabetes").
    pub text: String,
    /// Short chip label for display.
    #[serde(default)]
    pub label: String,
    /// Category assigned at extraction ("demographics", "diagnosis", ...).
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub origin: CriterionOrigin,
    /// Entities pulled out of `text`, in extraction order.
    #[serde(default)]
    pub entities: Vec<String>,
    /// Entity -> resolution state. Keys are unique per criterion.
    #[serde(default)]
    pub mappings: BTreeMap<String, FieldMapping>,
    /// SQL boolean expression, set by synthesis; None until rewritten.
    #[serde(default)]
    pub sql: Option<String>,
}

impl Criterion {
    pub fn new(kind: CriterionKind, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            label: text.clone(),
            text,
            category: String::new(),
            origin: CriterionOrigin::Agent,
            entities: Vec::new(),
            mappings: BTreeMap::new(),
            sql: None,
        }
    }

    /// Normalized text used for collision detection across edits.
    pub fn normalized_text(&self) -> String {
        self.text.trim().to_lowercase()
    }
}

/// Engine over one project's artifact bundle. Cheap to clone per call
/// site; the bundle itself is shared and read-only.
pub struct MappingEngine {
    pub(crate) bundle: Arc<ArtifactBundle>,
    pub(crate) llm: Arc<dyn LlmService>,
    pub(crate) embedder: Arc<dyn EmbeddingService>,
}

impl MappingEngine {
    pub fn new(
        bundle: Arc<ArtifactBundle>,
        llm: Arc<dyn LlmService>,
        embedder: Arc<dyn EmbeddingService>,
    ) -> Self {
        Self {
            bundle,
            llm,
            embedder,
        }
    }

    pub fn bundle(&self) -> &ArtifactBundle {
        &self.bundle
    }

    pub fn llm_ref(&self) -> &dyn LlmService {
        self.llm.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_text_trims_and_lowercases() {
        let c = Criterion::new(CriterionKind::Include, "  Female  ");
        assert_eq!(c.normalized_text(), "female");
    }

    #[test]
    fn test_criterion_ids_unique() {
        let a = Criterion::new(CriterionKind::Include, "female");
        let b = Criterion::new(CriterionKind::Include, "female");
        assert_ne!(a.id, b.id);
    }
}
