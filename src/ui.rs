//! UI component-shape generation boundary.
//!
//! The actual shape generator (dropdown vs. autocomplete vs. range slider
//! per field type and cardinality) lives outside this crate. The pipeline
//! only promises to hand over criteria whose field mappings are fully
//! populated; implementations must be pure and deterministic.

use crate::concepts::ConceptTable;
use crate::mapping::Criterion;
use crate::schema::SchemaCatalog;

pub trait UiShapeGenerator: Send + Sync {
    fn generate(
        &self,
        criteria: &[Criterion],
        catalog: &SchemaCatalog,
        concepts: &ConceptTable,
    ) -> Vec<Criterion>;
}

/// Pass-through shaper for headless use.
pub struct NullShaper;

impl UiShapeGenerator for NullShaper {
    fn generate(
        &self,
        criteria: &[Criterion],
        _catalog: &SchemaCatalog,
        _concepts: &ConceptTable,
    ) -> Vec<Criterion> {
        criteria.to_vec()
    }
}
