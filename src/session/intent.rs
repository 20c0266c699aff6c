//! Intent classification for conversation turns.
//!
//! LLM-backed with a deterministic keyword fallback so a dead model
//! endpoint degrades to predictable routing instead of an error.

use super::state::{ConversationState, Stage};
use crate::llm::{parse_structured, LlmService};
use crate::mapping::Criterion;
use crate::turns::{Role, Turn};
use serde::{Deserialize, Serialize};

const INTENT_SYSTEM: &str = "You route messages in a cohort-building conversation to the correct action. Respond with strict JSON only, no prose, no markdown fences.";

/// How many prior turns of context the classifier sees.
const CONTEXT_TURNS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Advance,
    Edit,
    Clarify,
    StartNew,
    Reject,
    Undo,
    DbQuestion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDecision {
    #[serde(default)]
    pub thinking: String,
    pub action: Action,
    /// Clarifying question to relay, for `clarify`.
    #[serde(default)]
    pub question: Option<String>,
    /// Edit description in the user's words, for `edit`.
    #[serde(default)]
    pub modifications: Option<String>,
}

impl AgentDecision {
    fn plain(action: Action) -> Self {
        Self {
            thinking: String::new(),
            action,
            question: None,
            modifications: None,
        }
    }
}

fn render_criteria(criteria: &[Criterion]) -> String {
    if criteria.is_empty() {
        return "(none)".to_string();
    }
    criteria
        .iter()
        .map(|c| format!("- [{}] {}", c.kind.as_str(), c.text))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_history(history: &[Turn]) -> String {
    history
        .iter()
        .rev()
        .take(CONTEXT_TURNS)
        .rev()
        .map(|t| {
            let who = match t.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Error => "error",
            };
            format!("{}: {}", who, t.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Classify the latest utterance given recent turns and current stage.
pub async fn classify(
    llm: &dyn LlmService,
    message: &str,
    history: &[Turn],
    state: &ConversationState,
) -> AgentDecision {
    let prompt = format!(
        r#"Decide how to handle the user's latest message.

Current pipeline stage: {stage} (0 extract, 1 fields mapped, 2 values mapped, 3 SQL generated, 4 executed)
Current criteria:
{criteria}

Recent turns:
{history}

Latest user message:
{message}

Actions:
- "advance": user confirms / wants the next step ("looks good", "continue", "run it")
- "edit": user wants to change, add, or remove criteria; put their change request in "modifications"
- "clarify": the message is ambiguous or asks what the current criteria are; put a clarifying question in "question" when one is needed
- "start_new": user describes a brand new cohort, discarding the current one
- "reject": greeting or off-topic input
- "undo": user wants the last change reverted
- "db_question": user asks about the available data, tables, or fields

Return JSON: {{"thinking": "...", "action": "...", "question": null, "modifications": null}}"#,
        stage = state.stage.as_u8(),
        criteria = render_criteria(&state.criteria),
        history = render_history(history),
    );

    match llm.complete(INTENT_SYSTEM, &prompt).await {
        Ok(response) => match parse_structured::<AgentDecision>(&response) {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(error = %e, "intent response malformed, falling back to keywords");
                keyword_classify(message, state)
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "intent call failed, falling back to keywords");
            keyword_classify(message, state)
        }
    }
}

/// Deterministic fallback. Checks the unambiguous verbs first, then
/// routes anything that names no known intent: to extraction when there
/// are no criteria yet, otherwise to a clarification.
pub fn keyword_classify(message: &str, state: &ConversationState) -> AgentDecision {
    let lower = message.trim().to_lowercase();

    if lower.contains("undo") || lower.contains("revert") {
        return AgentDecision::plain(Action::Undo);
    }
    if ["hello", "hi", "hey", "thanks", "thank you"]
        .iter()
        .any(|g| lower == *g)
    {
        return AgentDecision::plain(Action::Reject);
    }
    if lower.starts_with("what tables")
        || lower.starts_with("what fields")
        || lower.contains("what data")
        || lower.contains("which tables")
    {
        return AgentDecision::plain(Action::DbQuestion);
    }
    if lower.contains("start over") || lower.contains("new cohort") || lower.contains("start again")
    {
        return AgentDecision::plain(Action::StartNew);
    }
    if ["remove", "delete", "change", "instead", "add ", "replace"]
        .iter()
        .any(|k| lower.contains(k))
    {
        return AgentDecision {
            thinking: String::new(),
            action: Action::Edit,
            question: None,
            modifications: Some(message.to_string()),
        };
    }
    if ["yes", "ok", "okay", "looks good", "continue", "next", "proceed", "run it", "go ahead"]
        .iter()
        .any(|k| lower == *k || lower.starts_with(k))
    {
        return AgentDecision::plain(Action::Advance);
    }

    if state.criteria.is_empty() && state.stage == Stage::Extracting {
        // A fresh session with a sentence of free text is a cohort
        // description until proven otherwise.
        AgentDecision::plain(Action::StartNew)
    } else {
        AgentDecision {
            thinking: String::new(),
            action: Action::Clarify,
            question: Some("Could you rephrase what you would like to change or do next?".to_string()),
            modifications: None,
        }
    }
}
