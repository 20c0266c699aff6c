//! In-memory embedding indexes with cosine-similarity search.
//!
//! Indexes are stored as a key list parallel to a flat vector matrix and
//! persisted in that shape (keys as JSON, matrix as raw f32 bytes) so the
//! matrix never round-trips through one large serialized blob.

use crate::embedder::Embedding;
use crate::error::{AgentError, Result};
use std::collections::HashMap;

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Key-aligned embedding index. One entry per key; lookup by key is O(1),
/// search is linear over the matrix.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingIndex {
    keys: Vec<String>,
    matrix: Vec<Embedding>,
    key_to_idx: HashMap<String, usize>,
}

impl EmbeddingIndex {
    pub fn new(keys: Vec<String>, matrix: Vec<Embedding>) -> Result<Self> {
        if keys.len() != matrix.len() {
            return Err(AgentError::Embedding(format!(
                "index key count {} does not match matrix rows {}",
                keys.len(),
                matrix.len()
            )));
        }
        let key_to_idx = keys
            .iter()
            .enumerate()
            .map(|(i, k)| (k.clone(), i))
            .collect();
        Ok(Self {
            keys,
            matrix,
            key_to_idx,
        })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn matrix(&self) -> &[Embedding] {
        &self.matrix
    }

    pub fn vector(&self, key: &str) -> Option<&Embedding> {
        self.key_to_idx.get(key).map(|&i| &self.matrix[i])
    }

    pub fn contains(&self, key: &str) -> bool {
        self.key_to_idx.contains_key(key)
    }

    /// Top-k nearest keys by cosine similarity, best first.
    pub fn top_k(&self, query: &Embedding, k: usize) -> Vec<(String, f32)> {
        let mut scored: Vec<(usize, f32)> = self
            .matrix
            .iter()
            .enumerate()
            .map(|(i, v)| (i, cosine_similarity(query, v)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(k)
            .map(|(i, score)| (self.keys[i].clone(), score))
            .collect()
    }

    /// Top-k search restricted to a subset of keys.
    pub fn top_k_within(
        &self,
        query: &Embedding,
        candidates: &[&str],
        k: usize,
    ) -> Vec<(String, f32)> {
        let mut scored: Vec<(String, f32)> = candidates
            .iter()
            .filter_map(|key| {
                self.vector(key)
                    .map(|v| (key.to_string(), cosine_similarity(query, v)))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }
}

/// Field index entry: the descriptive text that was embedded alongside its
/// `table.field` key.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FieldEntry {
    pub text: String,
    pub embedding: Embedding,
}

/// `table.field` -> {descriptive text, vector}. One entry per catalog field.
#[derive(Debug, Clone, Default)]
pub struct FieldEmbeddingIndex {
    pub entries: Vec<(String, FieldEntry)>,
    index: EmbeddingIndex,
    texts: HashMap<String, String>,
}

impl FieldEmbeddingIndex {
    pub fn new(entries: Vec<(String, FieldEntry)>) -> Result<Self> {
        let keys: Vec<String> = entries.iter().map(|(k, _)| k.clone()).collect();
        let matrix: Vec<Embedding> = entries.iter().map(|(_, e)| e.embedding.clone()).collect();
        let texts = entries
            .iter()
            .map(|(k, e)| (k.clone(), e.text.clone()))
            .collect();
        Ok(Self {
            index: EmbeddingIndex::new(keys, matrix)?,
            texts,
            entries,
        })
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let map: std::collections::BTreeMap<String, FieldEntry> = serde_json::from_slice(bytes)?;
        Self::new(map.into_iter().collect())
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        let map: std::collections::BTreeMap<&String, &FieldEntry> =
            self.entries.iter().map(|(k, e)| (k, e)).collect();
        Ok(serde_json::to_vec(&map)?)
    }

    pub fn text_of(&self, key: &str) -> &str {
        self.texts.get(key).map(|s| s.as_str()).unwrap_or("")
    }

    pub fn vector(&self, key: &str) -> Option<&Embedding> {
        self.index.vector(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains(key)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn top_k(&self, query: &Embedding, k: usize) -> Vec<(String, f32)> {
        self.index.top_k(query, k)
    }
}
