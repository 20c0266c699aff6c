//! LLM completion service.
//!
//! Thin client over an OpenAI-compatible chat-completions endpoint. All
//! structured responses are requested as strict JSON and parsed at the call
//! site; a malformed response raises so callers can apply their fallbacks.

use crate::error::{AgentError, Result};
use async_trait::async_trait;

/// Boundary interface for chat completion. Must fail closed on malformed
/// output so callers can apply fallback logic.
#[async_trait]
pub trait LlmService: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}

pub struct OpenAiChat {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiChat {
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            api_key,
            base_url,
            model,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LlmService for OpenAiChat {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt}
            ],
            "temperature": 0.0,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AgentError::Llm(format!(
                "LLM API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AgentError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| AgentError::Llm("No content in LLM response".to_string()))?;

        if content.trim().is_empty() {
            return Err(AgentError::Llm("Empty LLM response".to_string()));
        }

        Ok(content.to_string())
    }
}

/// Strip markdown code fences from an LLM response before JSON parsing.
pub fn clean_json_response(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Parse a structured JSON response, failing closed with the raw text in the
/// error so callers can log it.
pub fn parse_structured<T: serde::de::DeserializeOwned>(response: &str) -> Result<T> {
    let cleaned = clean_json_response(response);
    serde_json::from_str(cleaned).map_err(|e| {
        AgentError::Llm(format!(
            "Failed to parse structured response: {}. Response: {}",
            e, cleaned
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_json_response() {
        let fenced = "```json\n{\"a\": 1}\n```";
        assert_eq!(clean_json_response(fenced), "{\"a\": 1}");
        assert_eq!(clean_json_response("{\"a\": 1}"), "{\"a\": 1}");
    }

    #[test]
    fn test_parse_structured_fails_closed() {
        let result: Result<serde_json::Value> = parse_structured("not json at all");
        assert!(result.is_err());
    }
}
