//! Gemini chat backend (`POST /v1beta/models/{model}:generateContent`).

use super::parsing::{fallback_bullets, parse_summary_response, render_bullets};
use super::{LlmError, LlmPort};
use crate::domain::Outcome;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

pub struct GeminiLlm {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiLlm {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }

    async fn generate(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );
        let body = json!({
            "systemInstruction": {"parts": [{"text": system}]},
            "contents": [{"role": "user", "parts": [{"text": user}]}],
            "generationConfig": {"temperature": 0.1, "responseMimeType": "application/json"},
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Provider(e.to_string()))?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::Provider("rate limited by Gemini".to_string()));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Provider(format!("Gemini generateContent returned {status}: {body}")));
        }

        let parsed: GenerateResponse = response.json().await.map_err(|e| LlmError::Provider(e.to_string()))?;
        let content = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .unwrap_or_default();
        if content.is_empty() {
            return Err(LlmError::Empty);
        }
        Ok(content)
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl LlmPort for GeminiLlm {
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
            .generate(
                "You write concise, factual summaries of agent execution traces. Respond with JSON only.",
                &user,
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
            .generate(
                "You are an admission-control judge for an agent memory system. Respond with \
                 strict JSON only: {\"decision\": ..., \"target_run_id\": ..., \"reason\": ...}.",
                prompt,
            )
            .await?;
        if raw.trim().is_empty() {
            return Err(LlmError::Empty);
        }
        Ok(raw)
    }
}
