//! LLM port: summarizes runs and judges admission decisions (§4.2).

mod gemini;
mod openai;
pub mod parsing;

pub use gemini::GeminiLlm;
pub use openai::OpenAiLlm;

use async_trait::async_trait;
use std::sync::Mutex;

use crate::domain::Outcome;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("empty response from LLM provider")]
    Empty,

    #[error("LLM provider error: {0}")]
    Provider(String),
}

/// The two LLM-backed operations the core needs. Summarization and
/// admission judging never require different providers, so one trait
/// covers both (§9: "capability interfaces over a concrete config").
#[async_trait]
pub trait LlmPort: Send + Sync {
    /// Produces a prose summary and a rendered, `•`-prefixed `reason_added`
    /// block from a run tree and its outcome.
    async fn summarize(
        &self,
        run_tree: &serde_json::Value,
        outcome: Outcome,
    ) -> Result<(String, String), LlmError>;

    /// Requests a raw admission-decision JSON string for `prompt`. Parsing
    /// and fail-open behavior are the decision layer's responsibility.
    async fn decide(&self, prompt: &str) -> Result<String, LlmError>;
}

pub fn build_llm(config: &crate::config::Config) -> Result<Box<dyn LlmPort>, LlmError> {
    match config.provider {
        crate::config::Provider::OpenAi => {
            let api_key = config
                .openai_api_key
                .clone()
                .ok_or_else(|| LlmError::Provider("OPENAI_API_KEY not set".to_string()))?;
            Ok(Box::new(OpenAiLlm::new(api_key, config.openai_chat_model.clone())))
        }
        crate::config::Provider::Gemini => {
            let api_key = config
                .gemini_api_key
                .clone()
                .ok_or_else(|| LlmError::Provider("GEMINI_API_KEY not set".to_string()))?;
            Ok(Box::new(GeminiLlm::new(api_key, config.gemini_chat_model.clone())))
        }
    }
}

/// Deterministic stand-in for tests: returns a canned `summarize` output and
/// a queue of canned `decide` responses (defaulting to ADD once the queue
/// drains), so tests can assert on call order without a real provider.
pub struct MockLlmClient {
    decide_queue: Mutex<Vec<String>>,
    fail_decide: bool,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self {
            decide_queue: Mutex::new(Vec::new()),
            fail_decide: false,
        }
    }

    pub fn with_decisions(responses: Vec<&str>) -> Self {
        Self {
            decide_queue: Mutex::new(responses.into_iter().map(|s| s.to_string()).collect()),
            fail_decide: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            decide_queue: Mutex::new(Vec::new()),
            fail_decide: true,
        }
    }
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmPort for MockLlmClient {
    async fn summarize(
        &self,
        run_tree: &serde_json::Value,
        outcome: Outcome,
    ) -> Result<(String, String), LlmError> {
        let step_count = run_tree
            .get("steps")
            .and_then(|s| s.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        let summary = format!(
            "Agent run completed with outcome {} across {} step(s).",
            outcome.as_label(),
            step_count
        );
        let bullets = parsing::fallback_bullets(&summary, outcome.as_label());
        Ok((summary, parsing::render_bullets(&bullets)))
    }

    async fn decide(&self, _prompt: &str) -> Result<String, LlmError> {
        if self.fail_decide {
            return Err(LlmError::Provider("mock provider unreachable".to_string()));
        }
        let mut queue = self.decide_queue.lock().unwrap();
        if queue.is_empty() {
            return Ok(r#"{"decision":"ADD","target_run_id":null,"reason":"novel"}"#.to_string());
        }
        Ok(queue.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_summarize_mentions_outcome() {
        let llm = MockLlmClient::new();
        let tree = serde_json::json!({"steps": [{}, {}]});
        let (summary, reason) = llm.summarize(&tree, Outcome::Success).await.unwrap();
        assert!(summary.contains("success"));
        assert!(reason.starts_with('•'));
    }

    #[tokio::test]
    async fn mock_decide_queue_drains_in_order() {
        let llm = MockLlmClient::with_decisions(vec![r#"{"decision":"NOT","reason":"dup"}"#]);
        let first = llm.decide("prompt").await.unwrap();
        assert!(first.contains("NOT"));
        let second = llm.decide("prompt").await.unwrap();
        assert!(second.contains("ADD"));
    }

    #[tokio::test]
    async fn mock_failing_client_errors() {
        let llm = MockLlmClient::failing();
        assert!(llm.decide("prompt").await.is_err());
    }
}
