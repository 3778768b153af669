//! OpenAI chat-completions backend (`POST /v1/chat/completions`).

use super::parsing::{fallback_bullets, parse_summary_response, render_bullets};
use super::{LlmError, LlmPort};
use crate::domain::Outcome;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

pub struct OpenAiLlm {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiLlm {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }

    async fn chat(&self, system: &str, user: &str, json_mode: bool) -> Result<String, LlmError> {
        let mut body = json!({
            "model": self.model,
            "temperature": 0.1,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });
        if json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Provider(e.to_string()))?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::Provider("rate limited by OpenAI".to_string()));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Provider(format!("OpenAI chat returned {status}: {body}")));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| LlmError::Provider(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        if content.is_empty() {
            return Err(LlmError::Empty);
        }
        Ok(content)
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[async_trait]
impl LlmPort for OpenAiLlm {
    async fn summarize(
        &self,
        run_tree: &serde_json::Value,
        outcome: Outcome,
    ) -> Result<(String, String), LlmError> {
        let user = format!(
            "Summarize this completed agent run (outcome: {}) as a JSON object with keys \
             \"summary\" (2-4 sentences of prose) and \"why_added\" (array of 2-4 short \
             justification strings). Run tree:\n{}",
            outcome.as_label(),
            run_tree
        );
        let raw = self
            .chat(
                "You write concise, factual summaries of agent execution traces. Respond with JSON only.",
                &user,
                true,
            )
            .await?;

        let parsed = parse_summary_response(&raw).ok_or(LlmError::Empty)?;
        let bullets = if parsed.why_added.is_empty() {
            fallback_bullets(&parsed.summary, outcome.as_label())
        } else {
            parsed.why_added
        };
        Ok((parsed.summary, render_bullets(&bullets)))
    }

    async fn decide(&self, prompt: &str) -> Result<String, LlmError> {
        let raw = self
            .chat(
                "You are an admission-control judge for an agent memory system. Respond with \
                 strict JSON only: {\"decision\": ..., \"target_run_id\": ..., \"reason\": ...}.",
                prompt,
                true,
            )
            .await?;
        if raw.trim().is_empty() {
            return Err(LlmError::Empty);
        }
        Ok(raw)
    }
}
