//! Conversational routing over the mapping pipeline.
//!
//! One agent instance serves one project+user conversation for one
//! request. State arrives reconstructed from turn history, is mutated in
//! place, and is persisted again by the orchestration layer.

use super::intent::{self, Action, AgentDecision};
use super::state::{ConversationState, Stage};
use crate::error::{AgentError, Result};
use crate::execute;
use crate::mapping::{Criterion, CriterionKind, CriterionOrigin, FieldMapping, MappingEngine};
use crate::storage::ObjectStore;
use crate::turns::Turn;
use crate::ui::UiShapeGenerator;
use std::sync::Arc;

const GUIDANCE: &str = "I build patient cohorts from plain-language descriptions. Describe the group you are looking for, e.g. \"female patients over 40 with type 2 diabetes and no prior chemotherapy\".";

pub struct ConversationalAgent {
    engine: MappingEngine,
    store: Arc<dyn ObjectStore>,
    shaper: Arc<dyn UiShapeGenerator>,
    project_key: String,
}

impl ConversationalAgent {
    pub fn new(
        engine: MappingEngine,
        store: Arc<dyn ObjectStore>,
        shaper: Arc<dyn UiShapeGenerator>,
        project_key: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            store,
            shaper,
            project_key: project_key.into(),
        }
    }

    /// Route one user message. State is mutated in place; the returned
    /// string is the assistant reply for this turn.
    pub async fn handle(
        &self,
        message: &str,
        history: &[Turn],
        state: &mut ConversationState,
    ) -> Result<String> {
        let decision = intent::classify(self.engine_llm(), message, history, state).await;
        tracing::info!(action = ?decision.action, stage = state.stage.as_u8(), "routing turn");
        self.apply(message, decision, state).await
    }

    fn engine_llm(&self) -> &dyn crate::llm::LlmService {
        self.engine.llm_ref()
    }

    async fn apply(
        &self,
        message: &str,
        decision: AgentDecision,
        state: &mut ConversationState,
    ) -> Result<String> {
        match decision.action {
            Action::Advance => self.advance(state).await,
            Action::StartNew => self.start_new(message, state).await,
            Action::Edit => {
                let instruction = decision.modifications.as_deref().unwrap_or(message);
                self.edit(instruction, state).await
            }
            Action::Undo => Ok(self.undo(state)),
            Action::Reject => Ok(GUIDANCE.to_string()),
            Action::Clarify => Ok(self.clarify(message, decision.question.as_deref(), state)),
            Action::DbQuestion => self.answer_db_question(message).await,
        }
    }

    // ---- stage advancement ----

    /// Execute exactly the next pipeline stage. Terminal stage is a no-op.
    async fn advance(&self, state: &mut ConversationState) -> Result<String> {
        if state.criteria.is_empty() {
            return Ok(GUIDANCE.to_string());
        }
        match state.stage {
            Stage::Extracting => self.map_fields(state).await,
            Stage::SchemaMapped => self.map_concepts(state).await,
            Stage::ConceptMapped => self.generate_sql(state).await,
            Stage::SqlGenerated => self.execute_query(state).await,
            Stage::Executed => {
                Ok("The cohort query has already run. Describe a new cohort or edit the criteria to go again.".to_string())
            }
        }
    }

    async fn start_new(&self, message: &str, state: &mut ConversationState) -> Result<String> {
        let criteria = self.engine.extract_criteria(message, None).await?;
        *state = ConversationState::default();
        state.criteria = criteria;
        Ok(format!(
            "Extracted {} criteria:\n{}\nSay \"continue\" to map them to the database.",
            state.criteria.len(),
            render_list(&state.criteria)
        ))
    }

    /// Stage 0 -> 1: entity extraction and field resolution per criterion.
    async fn map_fields(&self, state: &mut ConversationState) -> Result<String> {
        let mut unmapped = Vec::new();
        for criterion in &mut state.criteria {
            if criterion.origin == CriterionOrigin::User {
                continue;
            }
            let pairs = self.engine.extract_entities(&criterion.text).await;
            criterion.entities = pairs.iter().map(|p| p.entity.clone()).collect();
            criterion.mappings.clear();
            for pair in pairs {
                let mut mapping = FieldMapping {
                    attribute: pair.attribute.clone(),
                    value: pair.entity.clone(),
                    ..Default::default()
                };
                match self
                    .engine
                    .resolve_field(&pair.attribute, &pair.entity, &criterion.text)
                    .await
                {
                    Some(resolved) => {
                        mapping.field = resolved.field;
                        mapping.candidates = resolved.candidates;
                    }
                    None => unmapped.push(format!("{} ({})", pair.entity, criterion.label)),
                }
                criterion.mappings.insert(pair.entity, mapping);
            }
        }
        state.stage = Stage::SchemaMapped;

        let mut reply = format!(
            "Mapped criteria to database fields:\n{}",
            render_mappings(&state.criteria)
        );
        if !unmapped.is_empty() {
            reply.push_str(&format!(
                "\nNo field found for: {}. You can adjust these manually.",
                unmapped.join(", ")
            ));
        }
        reply.push_str("\nSay \"continue\" to match values.");
        Ok(reply)
    }

    /// Stage 1 -> 2: concept resolution plus UI shape hints.
    async fn map_concepts(&self, state: &mut ConversationState) -> Result<String> {
        for criterion in &mut state.criteria {
            if criterion.origin == CriterionOrigin::User {
                continue;
            }
            for mapping in criterion.mappings.values_mut() {
                if mapping.field.is_empty() {
                    continue;
                }
                let concepts = self
                    .engine
                    .resolve_concepts(&mapping.field, &mapping.value)
                    .await?;
                mapping.concepts = concepts;
            }
        }
        state.criteria = self.shaper.generate(
            &state.criteria,
            &self.engine.bundle().catalog,
            &self.engine.bundle().concept_table,
        );
        state.stage = Stage::ConceptMapped;
        Ok(format!(
            "Matched values against the project vocabulary:\n{}\nSay \"continue\" to generate SQL.",
            render_mappings(&state.criteria)
        ))
    }

    /// Stage 2 -> 3: per-criterion synthesis, assembly, validation.
    async fn generate_sql(&self, state: &mut ConversationState) -> Result<String> {
        for criterion in &mut state.criteria {
            if criterion.mappings.values().all(|m| m.field.is_empty()) {
                criterion.sql = None;
                continue;
            }
            match self.engine.synthesize_sql(criterion).await {
                Ok(sql) => criterion.sql = Some(sql),
                Err(e) => {
                    tracing::warn!(criterion = %criterion.label, error = %e, "SQL synthesis failed, leaving criterion out of the query");
                    criterion.sql = None;
                }
            }
        }
        let query = self.engine.build_query(&state.criteria)?;
        let report = self.engine.validate(&state.criteria);
        state.sql = Some(query.clone());
        state.stage = Stage::SqlGenerated;

        let mut reply = format!("Generated query:\n{}", query);
        if !report.errors.is_empty() {
            reply.push_str(&format!(
                "\nValidation errors (fix before running):\n{}",
                report.errors.join("\n")
            ));
        }
        if !report.warnings.is_empty() {
            reply.push_str(&format!("\nWarnings:\n{}", report.warnings.join("\n")));
        }
        reply.push_str("\nSay \"continue\" to run it.");
        Ok(reply)
    }

    /// Stage 3 -> 4. A query that fails validation is never executed:
    /// unresolved values and unknown table or field references both roll
    /// the stage back to concept mapping with a regeneration prompt, so
    /// the conversation always has a route forward.
    async fn execute_query(&self, state: &mut ConversationState) -> Result<String> {
        let report = self.engine.validate(&state.criteria);
        if !report.valid {
            state.stage = Stage::ConceptMapped;
            state.sql = None;
            let reason = if report
                .errors
                .iter()
                .any(|e| e.contains("unresolved value"))
            {
                "Some values never resolved to the project vocabulary, so the query cannot run."
            } else {
                "The generated SQL references fields that do not exist in this project's schema, so the query cannot run."
            };
            return Ok(format!(
                "{}\n{}\nI rolled back to value matching; say \"continue\" to regenerate the SQL.",
                reason,
                report.errors.join("\n")
            ));
        }

        let sql = state
            .sql
            .clone()
            .ok_or_else(|| AgentError::Validation("no SQL generated yet".into()))?;
        let db_path = self
            .engine
            .bundle()
            .db_path
            .clone()
            .ok_or_else(|| AgentError::Database("no database file for this project".into()))?;

        let result =
            execute::run_query(&db_path, &sql, self.store.as_ref(), &self.project_key).await?;
        state.stage = Stage::Executed;

        let mut reply = format!(
            "Cohort query matched {} patients in {} ms (query {}).",
            result.row_count, result.elapsed_ms, result.query_id
        );
        if let Some(path) = &result.results_path {
            reply.push_str(&format!(" Full results: {}", path));
        }
        state.last_result = Some(result);
        Ok(reply)
    }

    // ---- edits ----

    /// Snapshot, then apply the edit. At stage zero this is a criteria
    /// mutation; at any later stage the mapping progress is discarded and
    /// extraction restarts with the instruction as feedback.
    async fn edit(&self, instruction: &str, state: &mut ConversationState) -> Result<String> {
        state.snapshot_for_undo();

        if state.stage > Stage::Extracting {
            let existing = state.criteria.clone();
            let description = existing
                .iter()
                .map(|c| c.text.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            let criteria = self
                .engine
                .extract_criteria(&description, Some((instruction, &existing)))
                .await?;
            state.criteria = criteria;
            state.stage = Stage::Extracting;
            state.sql = None;
            state.last_result = None;
            return Ok(format!(
                "Applied your change and restarted mapping:\n{}\nSay \"continue\" to map the updated criteria.",
                render_list(&state.criteria)
            ));
        }

        let lower = instruction.to_lowercase();
        if lower.contains("remove") || lower.contains("delete") {
            let before = state.criteria.len();
            state
                .criteria
                .retain(|c| !mentions(&lower, c));
            if state.criteria.len() < before {
                return Ok(format!(
                    "Removed {} criteria:\n{}",
                    before - state.criteria.len(),
                    render_list(&state.criteria)
                ));
            }
            // Nothing matched by keyword; fall through to a replace-style
            // re-extraction which can interpret the request.
        }

        if lower.starts_with("add ") || lower.contains(" add ") {
            let additions = self
                .engine
                .extract_additions(instruction, &state.criteria)
                .await?;
            state.criteria.extend(additions);
            state.criteria = dedup_criteria(std::mem::take(&mut state.criteria));
            return Ok(format!(
                "Added. Current criteria:\n{}",
                render_list(&state.criteria)
            ));
        }

        let replaced = self
            .engine
            .extract_replacement(instruction, &state.criteria)
            .await?;
        state.criteria = dedup_criteria(replaced);
        Ok(format!(
            "Updated criteria:\n{}",
            render_list(&state.criteria)
        ))
    }

    fn undo(&self, state: &mut ConversationState) -> String {
        if state.restore_undo() {
            format!(
                "Reverted the last change. Current criteria:\n{}",
                render_list(&state.criteria)
            )
        } else {
            "Nothing to undo.".to_string()
        }
    }

    fn clarify(
        &self,
        message: &str,
        question: Option<&str>,
        state: &ConversationState,
    ) -> String {
        let lower = message.to_lowercase();
        let asking_for_current = lower.contains("what do i have")
            || lower.contains("current criteria")
            || lower.contains("show me the criteria")
            || lower.contains("what are the criteria");
        if asking_for_current {
            format!("Current criteria:\n{}", render_list(&state.criteria))
        } else {
            question
                .unwrap_or("Could you rephrase what you would like to change or do next?")
                .to_string()
        }
    }

    async fn answer_db_question(&self, message: &str) -> Result<String> {
        let summary = self.engine.bundle().catalog.summary();
        let prompt = format!(
            r#"Answer the user's question about the available data using this catalog summary.

Catalog:
{summary}

Question: {message}

Answer in two or three sentences of plain prose."#
        );
        self.engine_llm()
            .complete(
                "You describe a clinical database schema to a non-technical user.",
                &prompt,
            )
            .await
    }

    /// Merge manually edited field mappings from the editing surface:
    /// user-provided criteria replace the previous user-provided set,
    /// agent-derived criteria are untouched, and the pipeline treats the
    /// merged list as already field- and value-resolved.
    pub fn merge_field_mappings(
        &self,
        state: &mut ConversationState,
        mut updated: Vec<Criterion>,
    ) {
        for criterion in &mut updated {
            criterion.origin = CriterionOrigin::User;
        }
        state
            .criteria
            .retain(|c| c.origin != CriterionOrigin::User);
        state.criteria.extend(updated);
        if state.stage < Stage::ConceptMapped {
            state.stage = Stage::ConceptMapped;
        }
    }
}

/// Words this similar count as a mention despite typos.
const MENTION_SIMILARITY: f64 = 0.92;

/// Does the instruction mention this criterion, by text or chip label.
/// Exact substring first, then per-word fuzzy match so "remove diabetis"
/// still hits the diabetes criterion.
fn mentions(instruction_lower: &str, criterion: &Criterion) -> bool {
    let text = criterion.normalized_text();
    let label = criterion.label.trim().to_lowercase();
    if (!text.is_empty() && instruction_lower.contains(&text))
        || (!label.is_empty() && instruction_lower.contains(&label))
    {
        return true;
    }
    instruction_lower.split_whitespace().any(|word| {
        label
            .split_whitespace()
            .any(|lw| strsim::jaro_winkler(word, lw) >= MENTION_SIMILARITY)
    })
}

/// Text-normalized de-duplication, first occurrence keeps its position.
/// On an exact collision between an include and an exclude, include wins.
pub fn dedup_criteria(criteria: Vec<Criterion>) -> Vec<Criterion> {
    let mut result: Vec<Criterion> = Vec::new();
    for criterion in criteria {
        let key = criterion.normalized_text();
        match result.iter_mut().find(|c| c.normalized_text() == key) {
            Some(existing) => {
                if existing.kind == CriterionKind::Exclude
                    && criterion.kind == CriterionKind::Include
                {
                    *existing = criterion;
                }
            }
            None => result.push(criterion),
        }
    }
    result
}

fn render_list(criteria: &[Criterion]) -> String {
    if criteria.is_empty() {
        return "(none)".to_string();
    }
    criteria
        .iter()
        .map(|c| format!("- [{}] {}", c.kind.as_str(), c.label))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_mappings(criteria: &[Criterion]) -> String {
    criteria
        .iter()
        .map(|c| {
            let details = c
                .mappings
                .values()
                .map(|m| {
                    let field = if m.field.is_empty() { "?" } else { &m.field };
                    if m.concepts.is_empty() {
                        format!("{} -> {}", m.value, field)
                    } else {
                        format!("{} -> {} = {}", m.value, field, m.concepts.join(", "))
                    }
                })
                .collect::<Vec<_>>()
                .join("; ");
            if details.is_empty() {
                format!("- [{}] {} (no entities)", c.kind.as_str(), c.label)
            } else {
                format!("- [{}] {}: {}", c.kind.as_str(), c.label, details)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn include(text: &str) -> Criterion {
        Criterion::new(CriterionKind::Include, text)
    }

    fn exclude(text: &str) -> Criterion {
        Criterion::new(CriterionKind::Exclude, text)
    }

    #[test]
    fn test_dedup_prefers_include_on_collision() {
        let deduped = dedup_criteria(vec![exclude("smoker"), include("female"), include("Smoker")]);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].kind, CriterionKind::Include);
        assert_eq!(deduped[0].text, "Smoker");
        // Position of the first occurrence is kept.
        assert_eq!(deduped[1].text, "female");
    }

    #[test]
    fn test_dedup_replace_scenario_keeps_two_entries() {
        // "change asian to caucasian" over ["female", "asian"] comes back
        // from re-extraction as the complete updated list.
        let replaced = vec![include("female"), include("caucasian")];
        let deduped = dedup_criteria(replaced);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].text, "female");
        assert_eq!(deduped[1].text, "caucasian");
    }

    #[test]
    fn test_mentions_matches_label_or_text() {
        let mut c = include("patients with type 2 diabetes");
        c.label = "Diabetes".to_string();
        assert!(mentions("remove the diabetes one", &c));
        assert!(mentions("delete patients with type 2 diabetes", &c));
        // Near-miss spelling still matches.
        assert!(mentions("remove diabetese", &c));
        assert!(!mentions("remove hypertension", &c));
    }

    struct NoLlm;
    #[async_trait::async_trait]
    impl crate::llm::LlmService for NoLlm {
        async fn complete(&self, _: &str, _: &str) -> crate::error::Result<String> {
            Err(AgentError::Llm("unused".into()))
        }
    }

    struct NoEmbed;
    #[async_trait::async_trait]
    impl crate::embedder::EmbeddingService for NoEmbed {
        async fn embed(&self, _: &str) -> crate::error::Result<crate::embedder::Embedding> {
            Err(AgentError::Embedding("unused".into()))
        }
        async fn embed_batch(
            &self,
            _: &[String],
        ) -> crate::error::Result<Vec<crate::embedder::Embedding>> {
            Err(AgentError::Embedding("unused".into()))
        }
    }

    /// Agent over a patient table with just an id and a gender field.
    fn offline_agent() -> ConversationalAgent {
        use crate::cache::ArtifactBundle;
        use crate::concepts::ConceptTable;
        use crate::index::{EmbeddingIndex, FieldEmbeddingIndex};
        use crate::schema::{FieldInfo, KeyGraph, SchemaCatalog, TableInfo};
        use crate::storage::FsObjectStore;
        use crate::ui::NullShaper;
        use std::collections::BTreeMap;

        let mut catalog = SchemaCatalog::default();
        catalog.tables.insert(
            "patient".to_string(),
            TableInfo {
                table_description: "one row per patient".to_string(),
                fields: BTreeMap::from([
                    ("patient_id".to_string(), FieldInfo::default()),
                    ("gender".to_string(), FieldInfo::default()),
                ]),
            },
        );
        let bundle = ArtifactBundle {
            catalog,
            key_graph: KeyGraph::default(),
            field_index: FieldEmbeddingIndex::default(),
            concept_table: ConceptTable::default(),
            concept_index: EmbeddingIndex::default(),
            db_path: None,
        };
        let engine = MappingEngine::new(Arc::new(bundle), Arc::new(NoLlm), Arc::new(NoEmbed));
        ConversationalAgent::new(
            engine,
            Arc::new(FsObjectStore::new(std::env::temp_dir())),
            Arc::new(NullShaper),
            "p1",
        )
    }

    #[test]
    fn test_merge_replaces_only_user_criteria() {
        let agent = offline_agent();
        let mut state = ConversationState::default();
        let agent_criterion = include("female");
        let mut old_user = include("asian");
        old_user.origin = CriterionOrigin::User;
        state.criteria = vec![agent_criterion.clone(), old_user];

        agent.merge_field_mappings(&mut state, vec![include("caucasian")]);
        assert_eq!(state.criteria.len(), 2);
        assert_eq!(state.criteria[0].text, "female");
        assert_eq!(state.criteria[0].origin, CriterionOrigin::Agent);
        assert_eq!(state.criteria[1].text, "caucasian");
        assert_eq!(state.criteria[1].origin, CriterionOrigin::User);
        assert_eq!(state.stage, Stage::ConceptMapped);
    }

    #[tokio::test]
    async fn test_unknown_field_at_execution_rolls_back_to_value_matching() {
        let agent = offline_agent();
        let mut state = ConversationState::default();
        let mut criterion = include("smoker");
        criterion.label = "smoker".to_string();
        criterion.sql = Some("patient.smoking_status = 'Current'".to_string());
        state.criteria = vec![criterion];
        state.stage = Stage::SqlGenerated;
        state.sql = Some(
            "SELECT patient.patient_id FROM patient WHERE patient.smoking_status = 'Current'"
                .to_string(),
        );

        let reply = agent.advance(&mut state).await.unwrap();
        assert_eq!(state.stage, Stage::ConceptMapped);
        assert!(state.sql.is_none());
        assert!(reply.contains("patient.smoking_status"));
        assert!(reply.contains("regenerate"));
    }

    #[tokio::test]
    async fn test_unresolved_value_at_execution_rolls_back_to_value_matching() {
        let agent = offline_agent();
        let mut state = ConversationState::default();
        let mut criterion = include("female");
        criterion.label = "female".to_string();
        criterion.sql = Some("patient.None = 'Female'".to_string());
        state.criteria = vec![criterion];
        state.stage = Stage::SqlGenerated;
        state.sql = Some("SELECT patient.patient_id FROM patient WHERE patient.None = 'Female'".to_string());

        let reply = agent.advance(&mut state).await.unwrap();
        assert_eq!(state.stage, Stage::ConceptMapped);
        assert!(state.sql.is_none());
        assert!(reply.contains("vocabulary"));
    }
}
