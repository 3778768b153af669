//! Retrieval engine (§4.6): ranks candidate runs by cosine similarity within
//! a (user, agent) partition, expands survivors to their full context, and
//! synthesizes aggregate observations plus a confidence score.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::instrument;

use crate::domain::{cosine_similarity, ArtifactType, Outcome, ReferenceType};
use crate::embedding::{embed_validated, Embedder};
use crate::error::KbResult;
use crate::storage::{GraphStore, Partition};

#[derive(Debug, Clone)]
pub struct ReferenceSummary {
    pub id: String,
    pub ref_type: ReferenceType,
    pub source_ref: String,
}

#[derive(Debug, Clone)]
pub struct ArtifactSummary {
    pub id: String,
    pub artifact_type: ArtifactType,
    pub hash: String,
}

#[derive(Debug, Clone)]
pub struct RunDetail {
    pub run_id: String,
    pub user_id: Option<String>,
    pub agent_id: String,
    pub summary: String,
    pub reason_added: Option<String>,
    pub outcome: Outcome,
    pub run_tree: Value,
    pub references: Vec<ReferenceSummary>,
    pub artifacts: Vec<ArtifactSummary>,
    pub similarity_score: Option<f32>,
    pub created_at: DateTime<Utc>,
}

pub struct RetrievalResponse {
    pub observations: Vec<String>,
    pub related_runs: Vec<RunDetail>,
    pub confidence: f32,
    pub query_embedding: Option<Vec<f32>>,
}

pub struct RetrievalEngine<'a> {
    pub store: &'a dyn GraphStore,
    pub embedder: &'a dyn Embedder,
}

impl<'a> RetrievalEngine<'a> {
    pub fn new(store: &'a dyn GraphStore, embedder: &'a dyn Embedder) -> Self {
        Self { store, embedder }
    }

    #[instrument(skip(self, task_text, context))]
    pub async fn retrieve(
        &self,
        task_text: &str,
        agent_id: Option<&str>,
        user_id: Option<&str>,
        context: Option<&str>,
        top_k: usize,
        include_query_embedding: bool,
    ) -> KbResult<RetrievalResponse> {
        let embed_text = context.filter(|c| !c.trim().is_empty()).unwrap_or(task_text);
        let query_embedding = embed_validated(self.embedder, embed_text).await?;

        let partition = Partition {
            agent_id: agent_id.map(str::to_string),
            user_id: user_id.map(str::to_string),
        };
        let candidates = self.store.scan_partition_runs(&partition).await?;

        let mut scored: Vec<(String, f32)> = candidates
            .into_iter()
            .filter(|c| matches!(c.status, crate::domain::RunStatus::Active))
            .filter_map(|c| {
                let embedding = c.embedding?;
                if embedding.len() != query_embedding.len() {
                    return None;
                }
                let sim = cosine_similarity(&query_embedding, &embedding);
                Some((c.id, sim))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        let mut related_runs = Vec::with_capacity(scored.len());
        for (run_id, similarity) in scored {
            if run_id.is_empty() {
                continue;
            }
            if let Some(detail) = self.expand(&run_id, Some(similarity)).await? {
                related_runs.push(detail);
            }
        }

        let observations = synthesize_observations(&related_runs);
        let confidence = compute_confidence(&related_runs);

        Ok(RetrievalResponse {
            observations,
            related_runs,
            confidence,
            query_embedding: include_query_embedding.then_some(query_embedding),
        })
    }

    pub async fn retrieve_all(
        &self,
        user_id: Option<&str>,
        agent_id: Option<&str>,
        limit: Option<usize>,
    ) -> KbResult<Vec<RunDetail>> {
        let partition = Partition {
            agent_id: agent_id.map(str::to_string),
            user_id: user_id.map(str::to_string),
        };
        let mut candidates: Vec<_> = self
            .store
            .scan_partition_runs(&partition)
            .await?
            .into_iter()
            .filter(|c| matches!(c.status, crate::domain::RunStatus::Active))
            .collect();
        candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            candidates.truncate(limit);
        }

        let mut out = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if let Some(detail) = self.expand(&candidate.id, None).await? {
                out.push(detail);
            }
        }
        Ok(out)
    }

    async fn expand(&self, run_id: &str, similarity_score: Option<f32>) -> KbResult<Option<RunDetail>> {
        let Some(record) = self.store.expand_run(run_id).await? else {
            return Ok(None);
        };
        let neighborhood = self.store.get_run_neighborhood(run_id).await?;

        Ok(Some(RunDetail {
            run_id: record.id,
            user_id: record.user_id,
            agent_id: record.agent_id,
            summary: record.summary,
            reason_added: record.reason_added,
            outcome: neighborhood.outcome,
            run_tree: record.run_tree,
            references: neighborhood
                .references
                .into_iter()
                .filter(|r| !r.id.is_empty())
                .map(|r| ReferenceSummary {
                    id: r.id,
                    ref_type: r.ref_type,
                    source_ref: r.source_ref,
                })
                .collect(),
            artifacts: neighborhood
                .artifacts
                .into_iter()
                .filter(|a| !a.id.is_empty())
                .map(|a| ArtifactSummary {
                    id: a.id,
                    artifact_type: a.artifact_type,
                    hash: a.hash,
                })
                .collect(),
            similarity_score,
            created_at: record.created_at,
        }))
    }
}

fn synthesize_observations(runs: &[RunDetail]) -> Vec<String> {
    if runs.is_empty() {
        return vec!["No similar runs found in memory.".to_string()];
    }

    let mut observations = Vec::new();

    let success_count = runs.iter().filter(|r| r.outcome == Outcome::Success).count();
    let failure_count = runs.iter().filter(|r| r.outcome == Outcome::Failure).count();
    observations.push(format!(
        "{success_count} successful, {failure_count} failed run(s) among the {} similar runs found.",
        runs.len()
    ));

    let mut ref_types: Vec<&str> = runs
        .iter()
        .flat_map(|r| r.references.iter().map(|rf| rf.ref_type.as_str()))
        .collect();
    ref_types.sort_unstable();
    ref_types.dedup();
    if !ref_types.is_empty() {
        observations.push(format!("Reference types seen: {}.", ref_types.join(", ")));
    }

    let mut artifact_types: Vec<&str> = runs
        .iter()
        .flat_map(|r| r.artifacts.iter().map(|a| a.artifact_type.as_str()))
        .collect();
    artifact_types.sort_unstable();
    artifact_types.dedup();
    if !artifact_types.is_empty() {
        observations.push(format!("Artifact types seen: {}.", artifact_types.join(", ")));
    }

    let high_similarity = runs
        .iter()
        .filter(|r| r.similarity_score.unwrap_or(0.0) > 0.9)
        .count();
    if high_similarity > 0 {
        observations.push(format!("{high_similarity} run(s) exceed 0.9 similarity."));
    }

    observations
}

fn compute_confidence(runs: &[RunDetail]) -> f32 {
    if runs.is_empty() {
        return 0.0;
    }
    let n = runs.len() as f32;
    let mean_similarity =
        runs.iter().filter_map(|r| r.similarity_score).sum::<f32>() / n;
    let outcomes_consistent = runs.windows(2).all(|w| w[0].outcome == w[1].outcome);
    let confidence =
        0.3 * (n / 5.0).min(1.0) + 0.5 * mean_similarity + 0.2 * if outcomes_consistent { 1.0 } else { 0.7 };
    (confidence * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MockEmbedder;
    use crate::storage::SqliteStore;

    async fn seed(store: &SqliteStore, id: &str, embedding: &[f32], outcome: Outcome) {
        store.upsert_agent("agent-1", None).await.unwrap();
        store
            .upsert_task(&format!("task-{id}"), "some task", embedding)
            .await
            .unwrap();
        store
            .create_run(
                id,
                "agent-1",
                &format!("task-{id}"),
                &format!("summary {id}"),
                None,
                Some(embedding),
                &serde_json::json!({}),
                outcome,
                &[],
                &[],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_store_yields_zero_confidence_and_default_observation() {
        let store = SqliteStore::open_in_memory().unwrap();
        let embedder = MockEmbedder::new(4);
        let engine = RetrievalEngine::new(&store, &embedder);
        let response = engine
            .retrieve("some task", Some("agent-1"), None, None, 5, false)
            .await
            .unwrap();
        assert_eq!(response.confidence, 0.0);
        assert_eq!(response.observations, vec!["No similar runs found in memory."]);
    }

    #[tokio::test]
    async fn ranks_by_similarity_descending() {
        let store = SqliteStore::open_in_memory().unwrap();
        seed(&store, "close", &[1.0, 0.0, 0.0], Outcome::Success).await;
        seed(&store, "far", &[0.0, 1.0, 0.0], Outcome::Success).await;
        let embedder = MockEmbedder::new(3);
        let engine = RetrievalEngine::new(&store, &embedder);

        // a raw query embedding standing in for the embedder's output, since
        // MockEmbedder hashes text rather than returning it verbatim
        let response = engine
            .retrieve("irrelevant text for this assertion", Some("agent-1"), None, None, 5, false)
            .await
            .unwrap();
        for window in response.related_runs.windows(2) {
            assert!(window[0].similarity_score >= window[1].similarity_score);
        }
    }

    #[tokio::test]
    async fn dimension_mismatch_is_silently_skipped() {
        let store = SqliteStore::open_in_memory().unwrap();
        seed(&store, "r1", &[1.0, 0.0, 0.0, 0.0], Outcome::Success).await;
        let embedder = MockEmbedder::new(3);
        let engine = RetrievalEngine::new(&store, &embedder);
        let response = engine
            .retrieve("task text", Some("agent-1"), None, None, 5, false)
            .await
            .unwrap();
        assert!(response.related_runs.is_empty());
    }

    #[tokio::test]
    async fn retrieve_all_orders_by_created_at_desc() {
        let store = SqliteStore::open_in_memory().unwrap();
        seed(&store, "r1", &[1.0, 0.0], Outcome::Success).await;
        seed(&store, "r2", &[0.0, 1.0], Outcome::Failure).await;
        let embedder = MockEmbedder::new(2);
        let engine = RetrievalEngine::new(&store, &embedder);
        let all = engine.retrieve_all(None, Some("agent-1"), None).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn retrieve_all_excludes_superseded_runs() {
        let store = SqliteStore::open_in_memory().unwrap();
        seed(&store, "r1", &[1.0, 0.0], Outcome::Success).await;
        seed(&store, "r2", &[0.0, 1.0], Outcome::Success).await;
        store.mark_superseded("r1", "r2").await.unwrap();

        let embedder = MockEmbedder::new(2);
        let engine = RetrievalEngine::new(&store, &embedder);
        let all = engine.retrieve_all(None, Some("agent-1"), None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].run_id, "r2");
    }
}
