//! Criterion and entity extraction.
//!
//! All prompts demand strict JSON; responses go through
//! [`crate::llm::parse_structured`] after fence stripping. Criterion
//! extraction fails closed (the caller decides what to do with an error),
//! entity extraction degrades to an empty list so the criterion survives
//! unmapped.

use super::{Criterion, CriterionKind, MappingEngine};
use crate::error::Result;
use crate::llm::parse_structured;
use serde::Deserialize;

const EXTRACT_SYSTEM: &str = "You are a clinical cohort analyst. You read free-text cohort descriptions and break them into atomic inclusion and exclusion criteria. Respond with strict JSON only, no prose, no markdown fences.";

#[derive(Debug, Deserialize)]
struct ExtractedCriterion {
    #[serde(rename = "type")]
    kind: String,
    text: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    category: String,
}

#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    criteria: Vec<ExtractedCriterion>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EntityPair {
    pub attribute: String,
    pub entity: String,
}

#[derive(Debug, Deserialize)]
struct EntityResponse {
    entities: Vec<EntityPair>,
}

fn into_criteria(raw: Vec<ExtractedCriterion>) -> Vec<Criterion> {
    raw.into_iter()
        .map(|r| {
            let kind = if r.kind.eq_ignore_ascii_case("exclude") {
                CriterionKind::Exclude
            } else {
                CriterionKind::Include
            };
            let mut c = Criterion::new(kind, r.text);
            if !r.label.is_empty() {
                c.label = r.label;
            }
            c.category = r.category;
            c
        })
        .collect()
}

impl MappingEngine {
    /// Extract include/exclude criteria from a cohort description. When
    /// `feedback` is present this is a re-extraction: the previous list and
    /// the user's correction are both shown to the model.
    pub async fn extract_criteria(
        &self,
        description: &str,
        feedback: Option<(&str, &[Criterion])>,
    ) -> Result<Vec<Criterion>> {
        let prompt = match feedback {
            None => format!(
                r#"Break this cohort description into atomic criteria.

Cohort description:
{description}

Rules:
- Each criterion is one clinical condition, demographic constraint, or measurement.
- "type" is "include" or "exclude". Negations ("without", "no history of") are exclude.
- "label" is a short chip label (2-4 words); "category" is one of: demographics, diagnosis, medication, procedure, measurement, other.

Return JSON: {{"criteria": [{{"type": "include", "text": "...", "label": "...", "category": "..."}}]}}"#
            ),
            Some((fb, previous)) => {
                let prior = previous
                    .iter()
                    .map(|c| format!("- [{}] {}", c.kind.as_str(), c.text))
                    .collect::<Vec<_>>()
                    .join("\n");
                format!(
                    r#"A previous extraction of this cohort description needs correction.

Cohort description:
{description}

Previously extracted criteria:
{prior}

User feedback:
{fb}

Re-extract the COMPLETE corrected criteria list, applying the feedback. Keep criteria the feedback does not touch.

Return JSON: {{"criteria": [{{"type": "include", "text": "...", "label": "...", "category": "..."}}]}}"#
                )
            }
        };
        let response = self.llm.complete(EXTRACT_SYSTEM, &prompt).await?;
        let parsed: ExtractionResponse = parse_structured(&response)?;
        tracing::info!(count = parsed.criteria.len(), "extracted criteria");
        Ok(into_criteria(parsed.criteria))
    }

    /// Extract only criteria that are new relative to `existing`. The model
    /// is explicitly shown the current list so it does not repeat entries.
    pub async fn extract_additions(
        &self,
        instruction: &str,
        existing: &[Criterion],
    ) -> Result<Vec<Criterion>> {
        let current = existing
            .iter()
            .map(|c| format!("- [{}] {}", c.kind.as_str(), c.text))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            r#"The user wants to ADD criteria to an existing cohort definition.

Current criteria (do NOT repeat any of these):
{current}

User request:
{instruction}

Extract ONLY the new criteria the request introduces.

Return JSON: {{"criteria": [{{"type": "include", "text": "...", "label": "...", "category": "..."}}]}}"#
        );
        let response = self.llm.complete(EXTRACT_SYSTEM, &prompt).await?;
        let parsed: ExtractionResponse = parse_structured(&response)?;
        Ok(into_criteria(parsed.criteria))
    }

    /// Re-extract the complete updated list after a replace-style edit.
    /// The caller runs text-normalized de-duplication on the result.
    pub async fn extract_replacement(
        &self,
        instruction: &str,
        existing: &[Criterion],
    ) -> Result<Vec<Criterion>> {
        let current = existing
            .iter()
            .map(|c| format!("- [{}] {}", c.kind.as_str(), c.text))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            r#"The user wants to MODIFY an existing cohort definition.

Current criteria:
{current}

User request:
{instruction}

Apply the request and return the COMPLETE updated criteria list: every surviving criterion plus the changed ones. Do not drop criteria the request does not mention.

Return JSON: {{"criteria": [{{"type": "include", "text": "...", "label": "...", "category": "..."}}]}}"#
        );
        let response = self.llm.complete(EXTRACT_SYSTEM, &prompt).await?;
        let parsed: ExtractionResponse = parse_structured(&response)?;
        Ok(into_criteria(parsed.criteria))
    }

    /// Pull attribute/value pairs out of one criterion's text. Failures
    /// degrade to an empty list; the criterion stays in the session
    /// unmapped rather than taking the whole stage down.
    pub async fn extract_entities(&self, criterion_text: &str) -> Vec<EntityPair> {
        let prompt = format!(
            r#"Extract the attribute/value pairs from this cohort criterion.

Criterion: {criterion_text}

Examples:
- "female patients" -> [{{"attribute": "gender", "entity": "female"}}]
- "hemoglobin < 8" -> [{{"attribute": "hemoglobin", "entity": "hemoglobin < 8"}}]
- "diagnosed with type 2 diabetes" -> [{{"attribute": "diagnosis", "entity": "type 2 diabetes"}}]

Return JSON: {{"entities": [{{"attribute": "...", "entity": "..."}}]}}"#
        );
        match self.llm.complete(EXTRACT_SYSTEM, &prompt).await {
            Ok(response) => match parse_structured::<EntityResponse>(&response) {
                Ok(parsed) => parsed.entities,
                Err(e) => {
                    tracing::warn!(error = %e, criterion = criterion_text, "entity extraction returned malformed JSON, treating as no entities");
                    Vec::new()
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, criterion = criterion_text, "entity extraction call failed, treating as no entities");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_criteria_maps_kind_and_label() {
        let raw = vec![
            ExtractedCriterion {
                kind: "include".to_string(),
                text: "female patients".to_string(),
                label: "Female".to_string(),
                category: "demographics".to_string(),
            },
            ExtractedCriterion {
                kind: "EXCLUDE".to_string(),
                text: "prior chemotherapy".to_string(),
                label: String::new(),
                category: String::new(),
            },
        ];
        let criteria = into_criteria(raw);
        assert_eq!(criteria[0].kind, CriterionKind::Include);
        assert_eq!(criteria[0].label, "Female");
        assert_eq!(criteria[1].kind, CriterionKind::Exclude);
        // Empty label falls back to the criterion text.
        assert_eq!(criteria[1].label, "prior chemotherapy");
    }

    #[test]
    fn test_entity_response_shape() {
        let parsed: EntityResponse = serde_json::from_str(
            r#"{"entities": [{"attribute": "gender", "entity": "female"}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.entities[0].attribute, "gender");
    }
}
