//! Ingestion orchestrator (§4.5): normalizes a run payload, summarizes it,
//! extracts references/artifacts, runs admission control, and commits the
//! result to the graph with the right relationships and status transitions.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument};

use crate::config::Config;
use crate::decision::{self, DecisionRequest, SimilarRun};
use crate::domain::{content_id, Decision, Outcome};
use crate::embedding::{embed_validated, Embedder};
use crate::error::{KbError, KbResult};
use crate::extractor;
use crate::llm::LlmPort;
use crate::storage::GraphStore;

/// A run payload as received at `POST /runs`. Accepts both the "new" shape
/// (`task_text`, explicit `outcome`) and the "legacy" shape (`user_task`,
/// `status`), per §6.
#[derive(Debug, Deserialize)]
pub struct RunPayload {
    pub run_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_task: Option<String>,
    #[serde(default)]
    pub task_text: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub steps: Option<Value>,
    #[serde(default)]
    pub run_tree: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub final_output: Option<Value>,
    #[serde(default)]
    pub duration: Option<Value>,
    #[serde(default)]
    pub start_timestamp: Option<Value>,
    #[serde(default)]
    pub end_timestamp: Option<Value>,
    #[serde(default)]
    pub agent_prompt: Option<Value>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl RunPayload {
    fn task_text(&self) -> KbResult<&str> {
        self.user_task
            .as_deref()
            .or(self.task_text.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| KbError::InvalidInput("user_task or task_text is required".to_string()))
    }

    fn outcome(&self) -> Outcome {
        if let Some(raw) = &self.outcome {
            return Outcome::parse(raw);
        }
        match self.status.as_deref() {
            Some("complete") | Some("success") => Outcome::Success,
            Some("failure") => Outcome::Failure,
            _ => Outcome::Partial,
        }
    }

    /// Builds the opaque `run_tree` the extractor walks and the store
    /// persists: `steps` (or a client-supplied `run_tree`) plus the other
    /// opaque fields folded in for later replay/inspection.
    fn run_tree_value(&self) -> Value {
        let mut tree = if let Some(steps) = &self.steps {
            serde_json::json!({ "steps": steps })
        } else {
            self.run_tree.clone().unwrap_or_else(|| serde_json::json!({}))
        };
        if let Value::Object(map) = &mut tree {
            for (key, value) in [
                ("metadata", &self.metadata),
                ("final_output", &self.final_output),
                ("duration", &self.duration),
                ("start_timestamp", &self.start_timestamp),
                ("end_timestamp", &self.end_timestamp),
                ("agent_prompt", &self.agent_prompt),
            ] {
                if let Some(v) = value {
                    map.insert(key.to_string(), v.clone());
                }
            }
        }
        tree
    }

    #[allow(dead_code)]
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
            .as_deref()
            .or_else(|| self.start_timestamp.as_ref().and_then(Value::as_str))
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now)
    }
}

pub enum IngestResponse {
    Not {
        reason: String,
        similarity_score: Option<f32>,
        similar_runs: Vec<SimilarRun>,
    },
    Admitted {
        decision: Decision,
        run_id: String,
        task_id: String,
        references_count: usize,
        artifacts_count: usize,
        target_run_id: Option<String>,
        reason: String,
        summary: String,
        reason_added: String,
    },
}

pub struct MemoryBuilder<'a> {
    pub store: &'a dyn GraphStore,
    pub embedder: &'a dyn Embedder,
    pub llm: &'a dyn LlmPort,
    pub config: &'a Config,
}

impl<'a> MemoryBuilder<'a> {
    pub fn new(
        store: &'a dyn GraphStore,
        embedder: &'a dyn Embedder,
        llm: &'a dyn LlmPort,
        config: &'a Config,
    ) -> Self {
        Self {
            store,
            embedder,
            llm,
            config,
        }
    }

    #[instrument(skip(self, payload), fields(run_id = %payload.run_id, agent_id = %payload.agent_id))]
    pub async fn ingest(&self, payload: RunPayload) -> KbResult<IngestResponse> {
        let task_text = payload.task_text()?.to_string();
        let outcome = payload.outcome();
        let run_tree = payload.run_tree_value();

        if let Some(user_id) = &payload.user_id {
            self.store.upsert_user(user_id).await?;
        }
        self.store
            .upsert_agent(&payload.agent_id, payload.user_id.as_deref())
            .await?;

        let task_id = self.resolve_task(&task_text).await?;

        let (summary, reason_added) = self.llm.summarize(&run_tree, outcome).await.unwrap_or_else(|e| {
            // Summarization is not on the §7 fail-open path (only the decision
            // layer is), but a down provider still shouldn't abort ingestion.
            (
                format!("Agent run {} completed with outcome {}.", payload.run_id, outcome.as_label()),
                format!("• Summary unavailable ({e})"),
            )
        });
        let run_embedding = embed_validated(self.embedder, &summary).await?;

        let (references, artifacts) = extractor::extract(&run_tree, self.embedder).await?;

        let decision_req = DecisionRequest {
            run_id: &payload.run_id,
            run_summary: &summary,
            run_embedding: &run_embedding,
            task_text: &task_text,
            outcome,
            references: &references,
            artifacts: &artifacts,
            agent_id: Some(payload.agent_id.as_str()),
            user_id: payload.user_id.as_deref(),
        };
        let decision_outcome = decision::decide(self.store, self.llm, self.config, decision_req).await?;
        let memory_decision = decision_outcome.memory_decision;

        info!(decision = memory_decision.decision.as_str(), "admission decision made");

        if memory_decision.decision == Decision::Not {
            return Ok(IngestResponse::Not {
                reason: memory_decision.reason,
                similarity_score: memory_decision.similarity_score,
                similar_runs: decision_outcome.similar_runs,
            });
        }

        for reference in &references {
            self.store
                .upsert_reference(
                    &reference.id,
                    reference.ref_type,
                    reference.embedding.as_deref(),
                    &reference.source_ref,
                )
                .await?;
        }
        for artifact in &artifacts {
            self.store
                .upsert_artifact(
                    &artifact.id,
                    artifact.artifact_type,
                    artifact.embedding.as_deref(),
                    &artifact.hash,
                )
                .await?;
        }

        let reason_added_for_run = if reason_added.trim().is_empty() {
            "• Added to memory".to_string()
        } else {
            reason_added.clone()
        };

        let reference_ids: Vec<String> = references.iter().map(|r| r.id.clone()).collect();
        let artifact_ids: Vec<String> = artifacts.iter().map(|a| a.id.clone()).collect();

        self.store
            .create_run(
                &payload.run_id,
                &payload.agent_id,
                &task_id,
                &summary,
                Some(&reason_added_for_run),
                Some(&run_embedding),
                &run_tree,
                outcome,
                &reference_ids,
                &artifact_ids,
            )
            .await?;

        if memory_decision.decision == Decision::Replace {
            if let Some(target) = &memory_decision.target_run_id {
                self.store.mark_superseded(target, &payload.run_id).await?;
            }
        }

        Ok(IngestResponse::Admitted {
            decision: memory_decision.decision,
            run_id: payload.run_id.clone(),
            task_id,
            references_count: references.len(),
            artifacts_count: artifacts.len(),
            target_run_id: memory_decision.target_run_id,
            reason: memory_decision.reason,
            summary,
            reason_added: reason_added_for_run,
        })
    }

    /// Task dedup (§3, §9 Open Questions): reuse an existing task only when a
    /// best match clears τ_task; otherwise mint a content-derived id. Task
    /// rows carry no partition of their own, so the match is global, mirroring
    /// the original's unscoped `MATCH (t:Task)` scan.
    async fn resolve_task(&self, task_text: &str) -> KbResult<String> {
        let embedding = embed_validated(self.embedder, task_text).await?;
        if let Some(existing) = self
            .store
            .find_matching_task(&embedding, self.config.similarity_threshold)
            .await?
        {
            return Ok(existing.id);
        }
        let task_id = content_id("task", &task_text);
        self.store.upsert_task(&task_id, task_text, &embedding).await?;
        Ok(task_id)
    }
}
