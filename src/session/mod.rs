//! Conversation state machine: stage tracking, intent routing, edits.

pub mod agent;
pub mod intent;
pub mod state;

pub use agent::ConversationalAgent;
pub use intent::{Action, AgentDecision};
pub use state::{ConversationState, Stage};
