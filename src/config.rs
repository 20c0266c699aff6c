//! Runtime configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Default TTL for cached artifact bundles: 4 hours.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 14_400;

/// Dimension of the embedding vectors (text-embedding-3-small).
pub const EMBEDDING_DIM: usize = 1536;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub base_url: String,
    pub chat_model: String,
    pub embedding_model: String,
    pub cache_dir: PathBuf,
    pub cache_ttl: Duration,
    /// Object-storage prefix under which per-project artifacts live.
    pub artifact_prefix: String,
}

impl Config {
    pub fn from_env() -> Self {
        let cache_dir = std::env::var("AGENT_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("atlas_cache"));

        let cache_ttl_secs = std::env::var("AGENT_CACHE_TTL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CACHE_TTL_SECS);

        Self {
            api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            chat_model: std::env::var("AGENT_CHAT_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            embedding_model: std::env::var("AGENT_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
            cache_dir,
            cache_ttl: Duration::from_secs(cache_ttl_secs),
            artifact_prefix: std::env::var("AGENT_ARTIFACT_PREFIX")
                .unwrap_or_else(|_| "atlases".to_string()),
        }
    }
}
