//! Runtime configuration, loaded from the environment (optionally via `.env`).

use std::env;

/// Which external provider backs embeddings and chat completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Gemini,
}

impl Provider {
    fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "gemini" => Provider::Gemini,
            _ => Provider::OpenAi,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub provider: Provider,

    pub openai_api_key: Option<String>,
    pub openai_embedding_model: String,
    pub openai_chat_model: String,

    pub gemini_api_key: Option<String>,
    pub gemini_embedding_model: String,
    pub gemini_chat_model: String,

    pub embedding_dimension: usize,

    /// τ_task — minimum cosine similarity for task-node reuse.
    pub similarity_threshold: f32,
    /// τ_low — below this, the decision layer admits deterministically without an LLM call.
    pub decision_similarity_floor: f32,
    pub decision_top_k: usize,

    pub db_path: String,
    pub api_host: String,
    pub api_port: u16,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(String),
}

impl Config {
    /// Load configuration from process environment, falling back to defaults.
    /// Loads a `.env` file first if present (errors from a missing file are ignored).
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();

        let provider = Provider::parse(&env_or("PROVIDER", "openai"));

        let embedding_dimension = env::var("EMBEDDING_DIMENSION")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(match provider {
                Provider::OpenAi => 1536,
                Provider::Gemini => 768,
            });

        Self {
            provider,
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            openai_embedding_model: env_or("OPENAI_EMBEDDING_MODEL", "text-embedding-3-small"),
            openai_chat_model: env_or("OPENAI_CHAT_MODEL", "gpt-4-turbo-preview"),
            gemini_api_key: env::var("GEMINI_API_KEY").ok(),
            gemini_embedding_model: env_or("GEMINI_EMBEDDING_MODEL", "gemini-embedding-001"),
            gemini_chat_model: env_or("GEMINI_CHAT_MODEL", "gemini-2.5-flash"),
            embedding_dimension,
            similarity_threshold: env_or("SIMILARITY_THRESHOLD", "0.85").parse().unwrap_or(0.85),
            decision_similarity_floor: env_or("DECISION_SIMILARITY_FLOOR", "0.70")
                .parse()
                .unwrap_or(0.70),
            decision_top_k: env_or("DECISION_TOP_K", "3").parse().unwrap_or(3),
            db_path: env_or("DB_PATH", "./agent_memory.db"),
            api_host: env_or("API_HOST", "0.0.0.0"),
            api_port: env_or("API_PORT", "8000").parse().unwrap_or(8000),
            cors_origins: env_or("CORS_ORIGINS", "http://localhost:3000")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Validate that the configured provider has the credentials it needs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.provider {
            Provider::OpenAi if self.openai_api_key.is_none() => {
                Err(ConfigError::Missing("OPENAI_API_KEY".to_string()))
            }
            Provider::Gemini if self.gemini_api_key.is_none() => {
                Err(ConfigError::Missing("GEMINI_API_KEY".to_string()))
            }
            _ => Ok(()),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
