//! Two-tier artifact cache.
//!
//! Tier 1 is an in-process map shared across sessions for the same project,
//! guarded by a mutex; values are handed out as shared references and must
//! not be mutated in place. Tier 2 is a per-project directory plus a
//! metadata record carrying a freshness deadline. Expiry is lazy: checked on
//! the next `get`, never actively swept.

use crate::concepts::ConceptTable;
use crate::error::{AgentError, Result};
use crate::index::{EmbeddingIndex, FieldEmbeddingIndex};
use crate::schema::{KeyGraph, SchemaCatalog};
use crate::storage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Everything the mapping engine needs for one project.
pub struct ArtifactBundle {
    pub catalog: SchemaCatalog,
    pub key_graph: KeyGraph,
    pub field_index: FieldEmbeddingIndex,
    pub concept_table: ConceptTable,
    pub concept_index: EmbeddingIndex,
    /// Local path of the project's query database, when one exists.
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheMeta {
    project_key: String,
    expires_at: DateTime<Utc>,
    /// Artifact name -> file path. Every file must still exist for the
    /// entry to count as a hit.
    files: BTreeMap<String, PathBuf>,
}

pub struct ArtifactCache {
    root: PathBuf,
    ttl: Duration,
    memory: Mutex<HashMap<String, Arc<ArtifactBundle>>>,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            root: root.into(),
            ttl,
            memory: Mutex::new(HashMap::new()),
        }
    }

    fn project_dir(&self, project_key: &str) -> PathBuf {
        self.root.join(project_key)
    }

    fn meta_path(&self, project_key: &str) -> PathBuf {
        self.project_dir(project_key).join("meta.json")
    }

    /// In-process map first, then the persisted directory. A disk entry is
    /// discarded whole if it is past its deadline or any backing file is
    /// missing; a returned bundle is never partially populated.
    pub fn get(&self, project_key: &str) -> Option<Arc<ArtifactBundle>> {
        {
            let memory = self.memory.lock().expect("cache lock poisoned");
            if let Some(bundle) = memory.get(project_key) {
                tracing::debug!(project = project_key, "artifact cache memory hit");
                return Some(Arc::clone(bundle));
            }
        }

        let meta = match self.read_meta(project_key) {
            Some(meta) => meta,
            None => {
                tracing::info!(project = project_key, "artifact cache miss: no metadata");
                return None;
            }
        };

        if meta.expires_at <= Utc::now() {
            tracing::info!(project = project_key, "artifact cache miss: entry expired");
            self.drop_meta(project_key);
            return None;
        }

        if let Some(missing) = meta.files.values().find(|p| !p.exists()) {
            tracing::warn!(
                project = project_key,
                file = %missing.display(),
                "artifact cache miss: backing file gone, dropping entry"
            );
            self.drop_meta(project_key);
            return None;
        }

        match self.load_from_disk(&meta) {
            Ok(bundle) => {
                let bundle = Arc::new(bundle);
                let mut memory = self.memory.lock().expect("cache lock poisoned");
                memory.insert(project_key.to_string(), Arc::clone(&bundle));
                tracing::info!(project = project_key, "artifact cache disk hit");
                Some(bundle)
            }
            Err(e) => {
                tracing::warn!(project = project_key, error = %e, "failed to load cached artifacts");
                self.drop_meta(project_key);
                None
            }
        }
    }

    /// Persist the bundle to disk and publish it in the in-process map. The
    /// concept-embedding matrix is written as a flat f32 array plus a
    /// parallel key list, never one serialized blob.
    pub fn put(&self, project_key: &str, bundle: ArtifactBundle) -> Result<Arc<ArtifactBundle>> {
        let dir = self.project_dir(project_key);
        std::fs::create_dir_all(&dir)?;

        let mut files = BTreeMap::new();

        let schema_path = dir.join("schema.json");
        std::fs::write(&schema_path, serde_json::to_vec(&bundle.catalog)?)?;
        files.insert("schema".to_string(), schema_path);

        let keys_path = dir.join("schema_keys.json");
        std::fs::write(&keys_path, serde_json::to_vec(&bundle.key_graph)?)?;
        files.insert("schema_keys".to_string(), keys_path);

        let field_path = dir.join("schema_field_embeddings.json");
        std::fs::write(&field_path, bundle.field_index.to_json()?)?;
        files.insert("field_embeddings".to_string(), field_path);

        let concept_path = dir.join("concept_table.csv");
        std::fs::write(&concept_path, bundle.concept_table.to_csv()?)?;
        files.insert("concept_table".to_string(), concept_path);

        let concept_keys_path = dir.join("concept_keys.json");
        std::fs::write(
            &concept_keys_path,
            serde_json::to_vec(bundle.concept_index.keys())?,
        )?;
        files.insert("concept_keys".to_string(), concept_keys_path);

        let matrix_path = dir.join("concept_matrix.f32");
        storage::write_matrix_file(&matrix_path, bundle.concept_index.matrix())?;
        files.insert("concept_matrix".to_string(), matrix_path);

        let bundle = if let Some(src) = bundle.db_path.as_ref() {
            let dest = dir.join(src.file_name().unwrap_or_else(|| "project.db".as_ref()));
            if src != &dest {
                std::fs::copy(src, &dest)?;
            }
            files.insert("db".to_string(), dest.clone());
            ArtifactBundle {
                db_path: Some(dest),
                ..bundle
            }
        } else {
            bundle
        };

        let meta = CacheMeta {
            project_key: project_key.to_string(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(self.ttl)
                    .map_err(|e| AgentError::Cache(format!("invalid ttl: {}", e)))?,
            files,
        };
        std::fs::write(self.meta_path(project_key), serde_json::to_vec_pretty(&meta)?)?;

        let bundle = Arc::new(bundle);
        let mut memory = self.memory.lock().expect("cache lock poisoned");
        memory.insert(project_key.to_string(), Arc::clone(&bundle));
        tracing::info!(project = project_key, "cached artifact bundle");
        Ok(bundle)
    }

    pub fn invalidate(&self, project_key: &str) {
        {
            let mut memory = self.memory.lock().expect("cache lock poisoned");
            memory.remove(project_key);
        }
        let dir = self.project_dir(project_key);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                tracing::warn!(project = project_key, error = %e, "failed to clear cache dir");
            }
        }
        tracing::info!(project = project_key, "invalidated artifact cache entry");
    }

    fn read_meta(&self, project_key: &str) -> Option<CacheMeta> {
        let bytes = std::fs::read(self.meta_path(project_key)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn drop_meta(&self, project_key: &str) {
        let _ = std::fs::remove_file(self.meta_path(project_key));
    }

    fn load_from_disk(&self, meta: &CacheMeta) -> Result<ArtifactBundle> {
        let read = |name: &str| -> Result<Vec<u8>> {
            let path = meta
                .files
                .get(name)
                .ok_or_else(|| AgentError::Cache(format!("missing artifact '{}'", name)))?;
            Ok(std::fs::read(path)?)
        };

        let catalog = SchemaCatalog::from_json(&read("schema")?)?;
        let key_graph = KeyGraph::from_json(&read("schema_keys")?)?;
        let field_index = FieldEmbeddingIndex::from_json(&read("field_embeddings")?)?;
        let concept_table = ConceptTable::from_csv(&read("concept_table")?)?;

        let concept_keys: Vec<String> = serde_json::from_slice(&read("concept_keys")?)?;
        let matrix_bytes = read("concept_matrix")?;
        let dim = if concept_keys.is_empty() {
            crate::config::EMBEDDING_DIM
        } else {
            matrix_bytes.len() / (concept_keys.len() * 4)
        };
        let matrix = if concept_keys.is_empty() {
            Vec::new()
        } else {
            storage::bytes_to_matrix(&matrix_bytes, dim)?
        };
        let concept_index = EmbeddingIndex::new(concept_keys, matrix)?;

        let db_path = meta.files.get("db").cloned();

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

/// Convenience for tests and the CLI: delete any on-disk state for a project.
pub fn clear_project_dir(root: &Path, project_key: &str) {
    let dir = root.join(project_key);
    if dir.exists() {
        let _ = std::fs::remove_dir_all(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concepts::{context_key, ConceptRow};

    fn tiny_bundle() -> ArtifactBundle {
        let mut catalog = SchemaCatalog::default();
        catalog
            .tables
            .insert("patient".to_string(), Default::default());
        let concept_table = ConceptTable::new(vec![ConceptRow {
            concept_name: "Male".to_string(),
            table_name: "patient".to_string(),
            field_name: "gender".to_string(),
            concept_with_context: context_key("patient", "gender", "Male"),
        }]);
        let concept_index = EmbeddingIndex::new(
            vec![context_key("patient", "gender", "Male")],
            vec![vec![0.5, 0.5]],
        )
        .unwrap();
        ArtifactBundle {
            catalog,
            key_graph: KeyGraph::default(),
            field_index: FieldEmbeddingIndex::default(),
            concept_table,
            concept_index,
            db_path: None,
        }
    }

    fn temp_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cohort_cache_test_{}_{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_miss_then_put_then_hit() {
        let root = temp_root("hit");
        let cache = ArtifactCache::new(&root, Duration::from_secs(60));
        assert!(cache.get("p1").is_none());

        cache.put("p1", tiny_bundle()).unwrap();
        let bundle = cache.get("p1").expect("hit after put");
        assert_eq!(bundle.concept_table.len(), 1);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn test_disk_hit_survives_memory_drop() {
        let root = temp_root("disk");
        {
            let cache = ArtifactCache::new(&root, Duration::from_secs(60));
            cache.put("p1", tiny_bundle()).unwrap();
        }
        let fresh = ArtifactCache::new(&root, Duration::from_secs(60));
        assert!(fresh.get("p1").is_some());
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn test_missing_file_discards_whole_entry() {
        let root = temp_root("partial");
        let cache = ArtifactCache::new(&root, Duration::from_secs(60));
        cache.put("p1", tiny_bundle()).unwrap();

        // Evict from memory, then delete one backing file.
        {
            let mut memory = cache.memory.lock().unwrap();
            memory.clear();
        }
        std::fs::remove_file(root.join("p1").join("concept_matrix.f32")).unwrap();

        assert!(cache.get("p1").is_none());
        // Metadata record must also be gone.
        assert!(!root.join("p1").join("meta.json").exists());
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn test_lazy_expiry() {
        let root = temp_root("ttl");
        let cache = ArtifactCache::new(&root, Duration::from_secs(0));
        cache.put("p1", tiny_bundle()).unwrap();
        {
            let mut memory = cache.memory.lock().unwrap();
            memory.clear();
        }
        assert!(cache.get("p1").is_none());
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn test_invalidate() {
        let root = temp_root("inv");
        let cache = ArtifactCache::new(&root, Duration::from_secs(60));
        cache.put("p1", tiny_bundle()).unwrap();
        cache.invalidate("p1");
        assert!(cache.get("p1").is_none());
        let _ = std::fs::remove_dir_all(root);
    }
}
