//! Cohort query agent: turns free-text clinical cohort descriptions into
//! validated SQL against a per-project database.
//!
//! The pipeline runs in five stages over a multi-turn conversation:
//! criteria extraction, field mapping, value matching, SQL generation,
//! and execution. Per-project schema and embedding artifacts are served
//! through a two-tier cache.

pub mod cache;
pub mod concepts;
pub mod config;
pub mod embedder;
pub mod error;
pub mod execute;
pub mod index;
pub mod llm;
pub mod mapping;
pub mod orchestrator;
pub mod schema;
pub mod schema_gen;
pub mod session;
pub mod storage;
pub mod turns;
pub mod ui;

pub use error::{AgentError, Result};
pub use orchestrator::Orchestrator;
