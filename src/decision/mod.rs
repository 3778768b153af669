//! Admission-control decision layer (§4.4): a two-stage policy scoped to the
//! (user, agent) partition. Stage 1 is a deterministic similarity scan and
//! pre-filter; stage 3 is an LLM judge consulted only when stage 2 can't
//! short-circuit. Every path — including provider failure — ends in exactly
//! one decision, persisted as a `MemoryDecision` (§9: "collapse to ADD at
//! exactly one site").

use chrono::Utc;
use tracing::{instrument, warn};

use crate::config::Config;
use crate::domain::{cosine_similarity, Artifact, Decision, MemoryDecision, Outcome, Reference};
use crate::error::KbResult;
use crate::llm::{parsing::repair_decision_json, LlmPort};
use crate::storage::{GraphStore, Partition, RunScanRow};

pub struct DecisionRequest<'a> {
    pub run_id: &'a str,
    pub run_summary: &'a str,
    pub run_embedding: &'a [f32],
    pub task_text: &'a str,
    pub outcome: Outcome,
    pub references: &'a [Reference],
    pub artifacts: &'a [Artifact],
    pub agent_id: Option<&'a str>,
    pub user_id: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct SimilarRun {
    pub run_id: String,
    pub summary: String,
    pub outcome: Outcome,
    pub similarity: f32,
}

pub struct DecisionOutcome {
    pub memory_decision: MemoryDecision,
    /// Monotonically non-increasing by similarity (§8 invariant 6).
    pub similar_runs: Vec<SimilarRun>,
}

#[instrument(skip(store, llm, config, req), fields(run_id = req.run_id))]
pub async fn decide(
    store: &dyn GraphStore,
    llm: &dyn LlmPort,
    config: &Config,
    req: DecisionRequest<'_>,
) -> KbResult<DecisionOutcome> {
    let partition = Partition {
        agent_id: req.agent_id.map(str::to_string),
        user_id: req.user_id.map(str::to_string),
    };

    let candidates = store.scan_partition_runs(&partition).await?;
    let mut scored: Vec<(RunScanRow, f32)> = candidates
        .into_iter()
        .filter(|c| c.id != req.run_id)
        .filter(|c| matches!(c.status, crate::domain::RunStatus::Active))
        .filter_map(|c| {
            let embedding = c.embedding.as_ref()?;
            if embedding.len() != req.run_embedding.len() {
                return None;
            }
            let sim = cosine_similarity(req.run_embedding, embedding);
            Some((c, sim))
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let best_similarity = scored.first().map(|(_, sim)| *sim);
    let kept: Vec<(RunScanRow, f32)> = scored
        .into_iter()
        .filter(|(_, sim)| *sim >= config.decision_similarity_floor)
        .take(config.decision_top_k)
        .collect();

    // Stage 2: deterministic pre-filter short-circuits.
    if kept.is_empty() {
        let reason = match best_similarity {
            None => "No similar runs".to_string(),
            Some(sim) => format!("No similar runs above threshold (best similarity {sim:.2})"),
        };
        let decision = MemoryDecision {
            run_id: req.run_id.to_string(),
            decision: Decision::Add,
            target_run_id: None,
            reason,
            similarity_score: best_similarity,
            timestamp: Utc::now(),
        };
        store.save_decision(&decision).await?;
        return Ok(DecisionOutcome {
            memory_decision: decision,
            similar_runs: Vec::new(),
        });
    }

    // Stage 3: consult the LLM judge with the top candidates expanded.
    let mut similar_runs = Vec::with_capacity(kept.len());
    for (row, sim) in &kept {
        let expanded = store.expand_run(&row.id).await?;
        let (summary, outcome) = expanded
            .map(|r| (r.summary, r.outcome))
            .unwrap_or_else(|| (String::new(), Outcome::Partial));
        similar_runs.push(SimilarRun {
            run_id: row.id.clone(),
            summary,
            outcome,
            similarity: *sim,
        });
    }

    let prompt = build_judge_prompt(&req, &similar_runs);
    let decision = match llm.decide(&prompt).await {
        Ok(raw) => parse_llm_decision(&raw, req.run_id, &similar_runs, best_similarity),
        Err(e) => fail_open(req.run_id, best_similarity, &format!("LLM error: {e}")),
    };

    store.save_decision(&decision).await?;
    Ok(DecisionOutcome {
        memory_decision: decision,
        similar_runs,
    })
}

fn build_judge_prompt(req: &DecisionRequest<'_>, similar_runs: &[SimilarRun]) -> String {
    let mut prompt = format!(
        "New run:\n  task: {}\n  outcome: {}\n  references: {}\n  artifacts: {}\n\n\
         Similar runs already in memory:\n",
        req.task_text,
        req.outcome.as_label(),
        req.references.len(),
        req.artifacts.len(),
    );
    for similar in similar_runs.iter().take(2) {
        let prefix: String = similar.run_id.chars().take(8).collect();
        prompt.push_str(&format!(
            "  - {{run_id: \"{prefix}\", outcome: \"{}\", similarity: {:.2}}}\n",
            similar.outcome.as_label(),
            similar.similarity
        ));
    }
    prompt.push_str(
        "\nDecide ADD if the new run is novel, NOT if it is redundant with a similar run, \
         REPLACE if it is strictly better than a specific similar run, or MERGE if it is \
         complementary to a specific similar run. Respond with JSON: \
         {\"decision\": ..., \"target_run_id\": ..., \"reason\": ...}.",
    );
    prompt
}

fn parse_llm_decision(
    raw: &str,
    run_id: &str,
    similar_runs: &[SimilarRun],
    best_similarity: Option<f32>,
) -> MemoryDecision {
    let Some(parsed) = repair_decision_json(raw) else {
        return fail_open(run_id, best_similarity, "Error in LLM decision; defaulting to ADD");
    };

    let decision = parsed
        .decision
        .as_deref()
        .and_then(Decision::parse)
        .unwrap_or(Decision::Add);

    let mut target_run_id = parsed.target_run_id.filter(|t| !t.is_empty() && t != "null");

    let decision = match decision {
        Decision::Replace | Decision::Merge if target_run_id.is_none() => {
            match similar_runs.first() {
                Some(top) => {
                    target_run_id = Some(top.run_id.clone());
                    decision
                }
                None => {
                    warn!("REPLACE/MERGE with no target candidate; coercing to ADD");
                    Decision::Add
                }
            }
        }
        other => other,
    };
    if !matches!(decision, Decision::Replace | Decision::Merge) {
        target_run_id = None;
    }

    MemoryDecision {
        run_id: run_id.to_string(),
        decision,
        target_run_id,
        reason: parsed.reason.unwrap_or_else(|| "No reason given".to_string()),
        similarity_score: similar_runs.first().map(|s| s.similarity).or(best_similarity),
        timestamp: Utc::now(),
    }
}

fn fail_open(run_id: &str, similarity_score: Option<f32>, reason: &str) -> MemoryDecision {
    warn!(reason, "decision layer failing open to ADD");
    MemoryDecision {
        run_id: run_id.to_string(),
        decision: Decision::Add,
        target_run_id: None,
        reason: reason.to_string(),
        similarity_score,
        timestamp: Utc::now(),
    }
}
