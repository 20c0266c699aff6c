//! Top-level wiring: project key -> cached artifacts -> mapping engine ->
//! conversational agent, with the error boundary around stage calls.

use crate::cache::{ArtifactBundle, ArtifactCache};
use crate::concepts::ConceptTable;
use crate::config::EMBEDDING_DIM;
use crate::embedder::EmbeddingService;
use crate::error::Result;
use crate::index::{EmbeddingIndex, FieldEmbeddingIndex};
use crate::llm::LlmService;
use crate::mapping::MappingEngine;
use crate::schema::{KeyGraph, SchemaCatalog};
use crate::session::{ConversationState, ConversationalAgent};
use crate::storage::{self, ArtifactPaths, ObjectStore};
use crate::turns::{Role, Turn, TurnStore};
use crate::ui::UiShapeGenerator;
use std::path::PathBuf;
use std::sync::Arc;

pub struct Orchestrator {
    cache: Arc<ArtifactCache>,
    store: Arc<dyn ObjectStore>,
    turns: Arc<dyn TurnStore>,
    llm: Arc<dyn LlmService>,
    embedder: Arc<dyn EmbeddingService>,
    shaper: Arc<dyn UiShapeGenerator>,
    artifact_prefix: String,
    /// Scratch dir for database files pulled from storage.
    scratch_dir: PathBuf,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<ArtifactCache>,
        store: Arc<dyn ObjectStore>,
        turns: Arc<dyn TurnStore>,
        llm: Arc<dyn LlmService>,
        embedder: Arc<dyn EmbeddingService>,
        shaper: Arc<dyn UiShapeGenerator>,
        artifact_prefix: impl Into<String>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cache,
            store,
            turns,
            llm,
            embedder,
            shaper,
            artifact_prefix: artifact_prefix.into(),
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Handle one user message for a project+user conversation. Failures
    /// inside a stage call are recorded as an error turn and the
    /// conversation stays at its pre-call stage.
    pub async fn handle_message(
        &self,
        project_key: &str,
        user_key: &str,
        message: &str,
    ) -> Result<String> {
        let history = self.turns.history(project_key, user_key)?;
        let mut state = ConversationState::from_turns(&history);
        let pre_call_stage = state.stage;

        self.turns.append(
            project_key,
            user_key,
            &Turn::new(Role::User, pre_call_stage.as_u8(), message),
        )?;

        let bundle = self.bundle_for(project_key).await?;
        let engine = MappingEngine::new(bundle, Arc::clone(&self.llm), Arc::clone(&self.embedder));
        let agent = ConversationalAgent::new(
            engine,
            Arc::clone(&self.store),
            Arc::clone(&self.shaper),
            project_key,
        );

        match agent.handle(message, &history, &mut state).await {
            Ok(reply) => {
                self.turns.append(
                    project_key,
                    user_key,
                    &Turn::new(Role::Assistant, state.stage.as_u8(), reply.as_str())
                        .with_metadata(state.to_metadata()),
                )?;
                Ok(reply)
            }
            Err(e) => {
                tracing::error!(project = project_key, error = %e, "stage call failed");
                // Error turns carry no state payload, so reconstruction
                // keeps the last assistant turn's stage.
                self.turns.append(
                    project_key,
                    user_key,
                    &Turn::new(Role::Error, pre_call_stage.as_u8(), e.to_string()),
                )?;
                Ok(format!(
                    "Something went wrong while processing that ({}). The session is unchanged; try again or rephrase.",
                    e
                ))
            }
        }
    }

    /// Cached bundle for the project, fetching from cold storage on miss.
    pub async fn bundle_for(&self, project_key: &str) -> Result<Arc<ArtifactBundle>> {
        if let Some(bundle) = self.cache.get(project_key) {
            return Ok(bundle);
        }
        tracing::info!(project = project_key, "fetching artifacts from storage");
        let bundle = self.fetch_bundle(project_key).await?;
        self.cache.put(project_key, bundle)
    }

    async fn fetch_bundle(&self, project_key: &str) -> Result<ArtifactBundle> {
        let paths = ArtifactPaths::for_project(&self.artifact_prefix, project_key);

        let catalog = SchemaCatalog::from_json(&self.store.download(&paths.schema).await?)?;
        let key_graph = KeyGraph::from_json(&self.store.download(&paths.schema_keys).await?)?;
        let field_index =
            FieldEmbeddingIndex::from_json(&self.store.download(&paths.field_embeddings).await?)?;
        let concept_table =
            ConceptTable::from_csv(&self.store.download(&paths.concept_table).await?)?;

        let concept_keys: Vec<String> =
            serde_json::from_slice(&self.store.download(&paths.concept_keys).await?)?;
        let matrix_bytes = self.store.download(&paths.concept_matrix).await?;
        let matrix = if concept_keys.is_empty() {
            Vec::new()
        } else {
            let dim = matrix_bytes.len() / (concept_keys.len() * 4);
            let dim = if dim == 0 { EMBEDDING_DIM } else { dim };
            storage::bytes_to_matrix(&matrix_bytes, dim)?
        };
        let concept_index = EmbeddingIndex::new(concept_keys, matrix)?;

        let db_path = match storage::find_database_file(self.store.as_ref(), &paths.prefix).await? {
            Some(remote) => {
                let bytes = self.store.download(&remote).await?;
                std::fs::create_dir_all(&self.scratch_dir)?;
                let file_name = remote.rsplit('/').next().unwrap_or("project.db");
                let local = self.scratch_dir.join(format!("{}_{}", project_key, file_name));
                std::fs::write(&local, bytes)?;
                Some(local)
            }
            None => {
                tracing::warn!(project = project_key, "no database file under artifact prefix");
                None
            }
        };

        Ok(ArtifactBundle {
            catalog,
            key_graph,
            field_index,
            concept_table,
            concept_index,
            db_path,
        })
    }
}
