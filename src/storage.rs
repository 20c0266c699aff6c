//! Cold object storage boundary.
//!
//! Per-project artifacts live under a stable prefix:
//! `{prefix}/{project}/schema.json`, `schema_keys.json`,
//! `schema_field_embeddings.json`, `concept_table.csv`,
//! `concept_keys.json`, `concept_matrix.f32`, and a `.db` database file.

use crate::error::{AgentError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn download(&self, path: &str) -> Result<Vec<u8>>;
    async fn upload(&self, bytes: &[u8], path: &str) -> Result<String>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn exists(&self, path: &str) -> Result<bool>;
}

/// Artifact paths for one project under the stable prefix scheme.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub schema: String,
    pub schema_keys: String,
    pub field_embeddings: String,
    pub concept_table: String,
    pub concept_keys: String,
    pub concept_matrix: String,
    pub prefix: String,
}

impl ArtifactPaths {
    pub fn for_project(prefix: &str, project_key: &str) -> Self {
        let base = format!("{}/{}", prefix, project_key);
        Self {
            schema: format!("{}/schema.json", base),
            schema_keys: format!("{}/schema_keys.json", base),
            field_embeddings: format!("{}/schema_field_embeddings.json", base),
            concept_table: format!("{}/concept_table.csv", base),
            concept_keys: format!("{}/concept_keys.json", base),
            concept_matrix: format!("{}/concept_matrix.f32", base),
            prefix: base,
        }
    }
}

/// Filesystem-backed object store, used by the CLI and tests in place of a
/// cloud bucket.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path);
        std::fs::read(&full)
            .map_err(|e| AgentError::Storage(format!("download {} failed: {}", path, e)))
    }

    async fn upload(&self, bytes: &[u8], path: &str) -> Result<String> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full, bytes)
            .map_err(|e| AgentError::Storage(format!("upload {} failed: {}", path, e)))?;
        Ok(full.display().to_string())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.resolve(prefix);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.path().is_file() {
                paths.push(format!(
                    "{}/{}",
                    prefix.trim_end_matches('/'),
                    entry.file_name().to_string_lossy()
                ));
            }
        }
        paths.sort();
        Ok(paths)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.resolve(path).exists())
    }
}

/// Find the project's query database file under its artifact prefix.
pub async fn find_database_file(store: &dyn ObjectStore, prefix: &str) -> Result<Option<String>> {
    let files = store.list(prefix).await?;
    Ok(files.into_iter().find(|f| f.ends_with(".db")))
}

/// Serialize an f32 matrix as flat little-endian bytes (row-major). The
/// matrix is persisted separately from its key list so it can be read back
/// without deserializing one large blob.
pub fn matrix_to_bytes(matrix: &[Vec<f32>]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(matrix.iter().map(|r| r.len() * 4).sum());
    for row in matrix {
        for value in row {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }
    bytes
}

pub fn bytes_to_matrix(bytes: &[u8], dim: usize) -> Result<Vec<Vec<f32>>> {
    if dim == 0 || bytes.len() % (dim * 4) != 0 {
        return Err(AgentError::Storage(format!(
            "matrix byte length {} not divisible by row size {}",
            bytes.len(),
            dim * 4
        )));
    }
    let rows = bytes.len() / (dim * 4);
    let mut matrix = Vec::with_capacity(rows);
    for row_idx in 0..rows {
        let mut row = Vec::with_capacity(dim);
        for col_idx in 0..dim {
            let offset = (row_idx * dim + col_idx) * 4;
            let value = f32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ]);
            row.push(value);
        }
        matrix.push(row);
    }
    Ok(matrix)
}

/// Write a matrix to a local file path.
pub fn write_matrix_file(path: &Path, matrix: &[Vec<f32>]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, matrix_to_bytes(matrix))?;
    Ok(())
}
