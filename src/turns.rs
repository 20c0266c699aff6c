//! Conversation turn persistence.
//!
//! Append-only ordered turns per project+user. This is the only
//! durability mechanism for conversation state: the session layer
//! reconstructs its working state by replaying assistant-turn metadata.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    /// Pipeline stage the conversation was at when this turn was recorded.
    pub stage: u8,
    pub content: String,
    /// Free-form state payload; assistant turns carry the serialized
    /// criteria list and generated SQL here.
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, stage: u8, content: impl Into<String>) -> Self {
        Self {
            role,
            stage,
            content: content.into(),
            metadata: serde_json::Value::Null,
            at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

pub trait TurnStore: Send + Sync {
    fn append(&self, project_key: &str, user_key: &str, turn: &Turn) -> Result<()>;
    fn history(&self, project_key: &str, user_key: &str) -> Result<Vec<Turn>>;
}

/// One JSON-lines file per project+user pair.
pub struct FsTurnStore {
    root: PathBuf,
}

impl FsTurnStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, project_key: &str, user_key: &str) -> PathBuf {
        self.root.join(format!("{}_{}.jsonl", project_key, user_key))
    }
}

impl TurnStore for FsTurnStore {
    fn append(&self, project_key: &str, user_key: &str, turn: &Turn) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(project_key, user_key))?;
        let line = serde_json::to_string(turn)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn history(&self, project_key: &str, user_key: &str) -> Result<Vec<Turn>> {
        let path = self.path_for(project_key, user_key);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(path)?;
        let mut turns = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            turns.push(serde_json::from_str(line)?);
        }
        Ok(turns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_replay_ordering() {
        let root = std::env::temp_dir().join(format!("cohort_turns_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        let store = FsTurnStore::new(&root);

        store
            .append("p1", "u1", &Turn::new(Role::User, 0, "female patients"))
            .unwrap();
        store
            .append(
                "p1",
                "u1",
                &Turn::new(Role::Assistant, 0, "extracted 1 criterion")
                    .with_metadata(serde_json::json!({"criteria": []})),
            )
            .unwrap();

        let turns = store.history("p1", "u1").unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[1].role, Role::Assistant);
        assert!(turns[1].metadata.get("criteria").is_some());

        assert!(store.history("p1", "other").unwrap().is_empty());
        let _ = std::fs::remove_dir_all(root);
    }
}
