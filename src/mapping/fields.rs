//! Field resolution: entity text -> `table.field`.
//!
//! Three independent candidate generators run concurrently and their
//! outputs are merged with order-preserving de-duplication before one
//! final rerank. A strategy that fails contributes nothing; resolution
//! as a whole fails only when all three come back empty.

use super::MappingEngine;
use crate::error::Result;
use crate::llm::parse_structured;
use itertools::Itertools;
use serde::Deserialize;

/// Candidates retained for the editing surface.
pub const MAX_CANDIDATES: usize = 5;

const RESOLVE_SYSTEM: &str = "You map clinical concepts to database fields. Respond with strict JSON only, no prose, no markdown fences.";

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedField {
    /// Winning `table.field`.
    pub field: String,
    /// Ranked candidates including the winner, at most five.
    pub candidates: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceResponse {
    choice: String,
}

#[derive(Debug, Deserialize)]
struct TableChoice {
    table: String,
}

#[derive(Debug, Deserialize)]
struct FieldChoice {
    field: String,
}

impl MappingEngine {
    /// Resolve one attribute/entity pair to a field reference. Returns
    /// `None` when every strategy came back empty; the criterion is left
    /// unmapped instead of failing the stage.
    pub async fn resolve_field(
        &self,
        attribute: &str,
        entity: &str,
        criterion_text: &str,
    ) -> Option<ResolvedField> {
        let (a, b, c) = tokio::join!(
            self.embed_and_rerank(attribute, entity, criterion_text),
            self.guided_descent(attribute, entity),
            self.value_anchored(entity),
        );

        let mut merged: Vec<String> = Vec::new();
        for (name, outcome) in [("embed_rerank", a), ("guided_descent", b), ("value_anchored", c)]
        {
            match outcome {
                Ok(candidates) => merged.extend(candidates),
                Err(e) => {
                    tracing::warn!(strategy = name, error = %e, "field resolution strategy failed, skipping");
                }
            }
        }
        let merged: Vec<String> = merged.into_iter().unique().collect();
        if merged.is_empty() {
            tracing::warn!(attribute, entity, "no field candidates from any strategy");
            return None;
        }

        let field = self
            .final_rerank(attribute, criterion_text, &merged)
            .await
            .unwrap_or_else(|| merged[0].clone());

        // Winner first, then the rest in arrival order, capped.
        let mut candidates = vec![field.clone()];
        candidates.extend(merged.into_iter().filter(|c| *c != field));
        candidates.truncate(MAX_CANDIDATES);

        Some(ResolvedField { field, candidates })
    }

    /// Strategy 1: embed attribute + entity, take the five nearest field
    /// descriptions, let the model pick, promote the pick to front.
    async fn embed_and_rerank(
        &self,
        attribute: &str,
        entity: &str,
        criterion_text: &str,
    ) -> Result<Vec<String>> {
        let query = self.embedder.embed(&format!("{} {}", attribute, entity)).await?;
        let nearest = self.bundle.field_index.top_k(&query, MAX_CANDIDATES);
        if nearest.is_empty() {
            return Ok(Vec::new());
        }
        let mut candidates: Vec<String> = nearest.into_iter().map(|(k, _)| k).collect();

        let listing = candidates
            .iter()
            .map(|key| format!("- {}: {}", key, self.bundle.field_index.text_of(key)))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            r#"Which field best represents "{attribute}" in the criterion "{criterion_text}"?

Candidate fields:
{listing}

Return JSON: {{"choice": "table.field"}} using one of the listed keys."#
        );
        if let Ok(response) = self.llm.complete(RESOLVE_SYSTEM, &prompt).await {
            if let Ok(parsed) = parse_structured::<ChoiceResponse>(&response) {
                if let Some(pos) = candidates.iter().position(|c| *c == parsed.choice) {
                    candidates.swap(0, pos);
                }
            }
        }
        Ok(candidates)
    }

    /// Strategy 2: model picks a table from the table descriptions, then a
    /// field from that table, then the pick is expanded with its embedding
    /// neighborhood.
    async fn guided_descent(&self, attribute: &str, entity: &str) -> Result<Vec<String>> {
        let tables = self
            .bundle
            .catalog
            .tables
            .iter()
            .map(|(name, info)| format!("- {}: {}", name, info.table_description))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            r#"Which table most likely holds "{attribute}" = "{entity}"?

Tables:
{tables}

Return JSON: {{"table": "name"}} using one of the listed names."#
        );
        let response = self.llm.complete(RESOLVE_SYSTEM, &prompt).await?;
        let table_choice: TableChoice = parse_structured(&response)?;
        let table = self
            .bundle
            .catalog
            .table(&table_choice.table)
            .ok_or_else(|| {
                crate::error::AgentError::Mapping(format!(
                    "model chose unknown table '{}'",
                    table_choice.table
                ))
            })?;

        let fields = table
            .fields
            .iter()
            .map(|(name, info)| format!("- {}: {}", name, info.field_description))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            r#"Within table "{table_name}", which field holds "{attribute}" = "{entity}"?

Fields:
{fields}

Return JSON: {{"field": "name"}} using one of the listed names."#,
            table_name = table_choice.table,
        );
        let response = self.llm.complete(RESOLVE_SYSTEM, &prompt).await?;
        let field_choice: FieldChoice = parse_structured(&response)?;

        let key = format!("{}.{}", table_choice.table, field_choice.field);
        let mut candidates = vec![key.clone()];
        if let Some(anchor) = self.bundle.field_index.vector(&key) {
            let anchor = anchor.clone();
            for (neighbor, _) in self.bundle.field_index.top_k(&anchor, MAX_CANDIDATES) {
                candidates.push(neighbor);
            }
        }
        Ok(candidates.into_iter().unique().collect())
    }

    /// Strategy 3: nearest concept rows for the raw entity text, mapped
    /// back to their owning fields.
    async fn value_anchored(&self, entity: &str) -> Result<Vec<String>> {
        if self.bundle.concept_index.is_empty() {
            return Ok(Vec::new());
        }
        let query = self.embedder.embed(entity).await?;
        let nearest = self.bundle.concept_index.top_k(&query, MAX_CANDIDATES);
        let owners: Vec<String> = nearest
            .into_iter()
            .filter_map(|(key, _)| self.bundle.concept_table.owner_of(&key))
            .unique()
            .collect();
        Ok(owners)
    }

    /// Rerank the merged list with expanded context. `None` means the
    /// rerank failed or returned something outside the list; the caller
    /// falls back to arrival order.
    async fn final_rerank(
        &self,
        attribute: &str,
        criterion_text: &str,
        candidates: &[String],
    ) -> Option<String> {
        let listing = candidates
            .iter()
            .map(|key| {
                let desc = self.bundle.field_index.text_of(key);
                if desc.is_empty() {
                    format!("- {}", key)
                } else {
                    format!("- {}: {}", key, desc)
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            r#"Pick the single field that best captures "{attribute}" in the criterion "{criterion_text}".

Candidates (from multiple search strategies):
{listing}

Return JSON: {{"choice": "table.field"}} using one of the listed keys."#
        );
        let response = self.llm.complete(RESOLVE_SYSTEM, &prompt).await.ok()?;
        let parsed: ChoiceResponse = parse_structured(&response).ok()?;
        candidates.iter().find(|c| **c == parsed.choice).cloned()
    }
}
