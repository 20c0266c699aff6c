//! Conversation state and its reconstruction from turn history.

use crate::execute::QueryResult;
use crate::mapping::Criterion;
use crate::turns::{Role, Turn};
use serde::{Deserialize, Serialize};

/// Pipeline stage of a conversation, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Stage {
    Extracting = 0,
    SchemaMapped = 1,
    ConceptMapped = 2,
    SqlGenerated = 3,
    Executed = 4,
}

impl Stage {
    pub fn from_u8(value: u8) -> Stage {
        match value {
            0 => Stage::Extracting,
            1 => Stage::SchemaMapped,
            2 => Stage::ConceptMapped,
            3 => Stage::SqlGenerated,
            _ => Stage::Executed,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_terminal(self) -> bool {
        self == Stage::Executed
    }

    pub fn next(self) -> Stage {
        Stage::from_u8(self.as_u8().saturating_add(1))
    }
}

/// Everything an edit can touch, captured whole for one-level undo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub stage: Stage,
    pub criteria: Vec<Criterion>,
    pub sql: Option<String>,
    #[serde(default)]
    pub last_result: Option<QueryResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub stage: Stage,
    pub criteria: Vec<Criterion>,
    /// Single-slot undo buffer; every edit overwrites it.
    #[serde(default)]
    pub undo: Option<Snapshot>,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub last_result: Option<QueryResult>,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self {
            stage: Stage::Extracting,
            criteria: Vec::new(),
            undo: None,
            sql: None,
            last_result: None,
        }
    }
}

impl ConversationState {
    /// Rebuild working state from persisted turns: the newest assistant
    /// turn with a state payload wins. No turns means a fresh session.
    pub fn from_turns(turns: &[Turn]) -> Self {
        for turn in turns.iter().rev() {
            if turn.role != Role::Assistant {
                continue;
            }
            if let Ok(state) = serde_json::from_value::<ConversationState>(turn.metadata.clone()) {
                return state;
            }
        }
        Self::default()
    }

    /// Serialize for an assistant turn's metadata payload.
    pub fn to_metadata(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Capture the mutable parts before an edit. Overwrites any prior
    /// snapshot; only one level of undo is ever retained.
    pub fn snapshot_for_undo(&mut self) {
        self.undo = Some(Snapshot {
            stage: self.stage,
            criteria: self.criteria.clone(),
            sql: self.sql.clone(),
            last_result: self.last_result.clone(),
        });
    }

    /// Restore the snapshot and clear it. Returns false when there is
    /// nothing to undo; a second undo with no intervening edit is a no-op.
    pub fn restore_undo(&mut self) -> bool {
        match self.undo.take() {
            Some(snapshot) => {
                self.stage = snapshot.stage;
                self.criteria = snapshot.criteria;
                self.sql = snapshot.sql;
                self.last_result = snapshot.last_result;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::CriterionKind;

    #[test]
    fn test_stage_ordering_and_terminal() {
        assert_eq!(Stage::Extracting.next(), Stage::SchemaMapped);
        assert_eq!(Stage::Executed.next(), Stage::Executed);
        assert!(Stage::Executed.is_terminal());
        assert!(!Stage::SqlGenerated.is_terminal());
    }

    #[test]
    fn test_undo_restores_and_clears() {
        let mut state = ConversationState::default();
        state
            .criteria
            .push(Criterion::new(CriterionKind::Include, "female"));
        state.stage = Stage::SchemaMapped;

        state.snapshot_for_undo();
        state.criteria.clear();
        state.stage = Stage::Extracting;

        assert!(state.restore_undo());
        assert_eq!(state.stage, Stage::SchemaMapped);
        assert_eq!(state.criteria.len(), 1);
        // Second undo with no intervening edit does nothing.
        assert!(!state.restore_undo());
        assert_eq!(state.criteria.len(), 1);
    }

    #[test]
    fn test_undo_restores_last_result() {
        let mut state = ConversationState::default();
        state.stage = Stage::Executed;
        state.last_result = Some(crate::execute::QueryResult {
            query_id: "q-1".to_string(),
            sql: "SELECT patient.patient_id FROM patient WHERE 1=1".to_string(),
            columns: vec!["patient_id".to_string()],
            preview: vec![vec!["p001".to_string()]],
            row_count: 1,
            elapsed_ms: 3,
            results_path: None,
        });

        // An edit after execution snapshots, then drops the stale result.
        state.snapshot_for_undo();
        state.stage = Stage::Extracting;
        state.last_result = None;

        assert!(state.restore_undo());
        assert_eq!(state.stage, Stage::Executed);
        let result = state.last_result.expect("undo should bring the result back");
        assert_eq!(result.row_count, 1);
        assert_eq!(result.query_id, "q-1");
    }

    #[test]
    fn test_snapshot_overwritten_by_next_edit() {
        let mut state = ConversationState::default();
        state
            .criteria
            .push(Criterion::new(CriterionKind::Include, "female"));
        state.snapshot_for_undo();

        state
            .criteria
            .push(Criterion::new(CriterionKind::Include, "asian"));
        state.snapshot_for_undo();
        state.criteria.clear();

        assert!(state.restore_undo());
        // Restores the second snapshot, not the first.
        assert_eq!(state.criteria.len(), 2);
    }

    #[test]
    fn test_reconstruction_prefers_latest_assistant_turn() {
        let mut old_state = ConversationState::default();
        old_state.stage = Stage::SchemaMapped;
        let mut new_state = ConversationState::default();
        new_state.stage = Stage::SqlGenerated;
        new_state.sql = Some("SELECT 1".to_string());

        let turns = vec![
            Turn::new(Role::User, 0, "female patients"),
            Turn::new(Role::Assistant, 1, "mapped").with_metadata(old_state.to_metadata()),
            Turn::new(Role::User, 1, "go on"),
            Turn::new(Role::Assistant, 3, "sql ready").with_metadata(new_state.to_metadata()),
        ];
        let rebuilt = ConversationState::from_turns(&turns);
        assert_eq!(rebuilt.stage, Stage::SqlGenerated);
        assert_eq!(rebuilt.sql.as_deref(), Some("SELECT 1"));
    }

    #[test]
    fn test_reconstruction_empty_history_is_fresh() {
        let rebuilt = ConversationState::from_turns(&[]);
        assert_eq!(rebuilt.stage, Stage::Extracting);
        assert!(rebuilt.criteria.is_empty());
    }
}
