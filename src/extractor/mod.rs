//! Extracts References and Artifacts from a heterogeneous run tree (§4.3).
//!
//! The run tree is treated as the tagged sum it already is once parsed from
//! JSON (`serde_json::Value`'s Object/Array/scalar variants), per the
//! REDESIGN FLAGS note to model it as a visitor over a tagged sum rather than
//! a dynamic document.

use serde_json::Value;

use crate::domain::{content_id, full_hash, Artifact, ArtifactType, Reference, ReferenceType};
use crate::embedding::{embed_validated, Embedder};
use crate::error::KbResult;

const REFERENCE_VOCAB: &[&str] = &["schema", "document", "api_response", "prior_run"];
const ARTIFACT_VOCAB: &[&str] = &["plan", "report", "code"];

struct RefDraft {
    ref_type: ReferenceType,
    source_ref: String,
    payload: Value,
}

struct ArtDraft {
    artifact_type: ArtifactType,
    payload: Value,
}

/// Extracts and embeds References/Artifacts from `run_tree`.
pub async fn extract(
    run_tree: &Value,
    embedder: &dyn Embedder,
) -> KbResult<(Vec<Reference>, Vec<Artifact>)> {
    let (mut ref_drafts, mut art_drafts) = extract_structured_steps(run_tree);
    if ref_drafts.is_empty() && art_drafts.is_empty() {
        extract_fallback(run_tree, &mut ref_drafts, &mut art_drafts);
    }

    let references = embed_references(ref_drafts, embedder).await?;
    let artifacts = embed_artifacts(art_drafts, embedder).await?;
    Ok((dedup_by_id(references, |r| &r.id), dedup_by_id(artifacts, |a| &a.id)))
}

/// Rule 1: the structured-steps path (§4.3).
fn extract_structured_steps(run_tree: &Value) -> (Vec<RefDraft>, Vec<ArtDraft>) {
    let mut references = Vec::new();
    let mut artifacts = Vec::new();

    let Some(steps) = run_tree.get("steps").and_then(Value::as_array) else {
        return (references, artifacts);
    };

    for (index, step) in steps.iter().enumerate() {
        let step_id = step
            .get("step_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| index.to_string());
        let step_type = step.get("step_type").and_then(Value::as_str).unwrap_or("");
        let step_name = step.get("step_name").and_then(Value::as_str).unwrap_or("");
        let step_input = step.get("step_input");
        let step_output = step.get("step_output");

        if let Some(email_data) = step_input
            .and_then(|si| si.get("context"))
            .and_then(|ctx| ctx.get("emailData"))
        {
            references.push(RefDraft {
                ref_type: ReferenceType::ApiResponse,
                source_ref: format!("step_{step_id}.emailData"),
                payload: email_data.clone(),
            });
        }

        if let Some(data) = step_output.and_then(|so| so.get("data")) {
            if data.get("id").is_some() || data.get("messageId").is_some() {
                references.push(RefDraft {
                    ref_type: ReferenceType::ApiResponse,
                    source_ref: format!("step_{step_id}.output_data"),
                    payload: data.clone(),
                });
            }
        }

        if step_type == "llm_call" {
            if let Some(data) = step_output.and_then(|so| so.get("data")) {
                artifacts.push(ArtDraft {
                    artifact_type: infer_artifact_type(step_name),
                    payload: data.clone(),
                });
            }
        }

        if let Some(si) = step_input {
            let generated = si.get("reply").or_else(|| si.get("summary"));
            if let Some(generated) = generated {
                artifacts.push(ArtDraft {
                    artifact_type: ArtifactType::Report,
                    payload: generated.clone(),
                });
            }
        }
    }

    (references, artifacts)
}

fn infer_artifact_type(step_name: &str) -> ArtifactType {
    let lower = step_name.to_lowercase();
    if lower.contains("summary") {
        ArtifactType::Report
    } else if lower.contains("reply") || lower.contains("generate") {
        ArtifactType::Code
    } else if lower.contains("reasoning") {
        ArtifactType::Plan
    } else {
        ArtifactType::Report
    }
}

/// Rule 2: fallback traversal, used only when the structured pass found
/// nothing. The `steps` key is skipped wherever encountered to avoid
/// double-counting against rule 1.
fn extract_fallback(value: &Value, references: &mut Vec<RefDraft>, artifacts: &mut Vec<ArtDraft>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(type_value)) = map.get("type") {
                if REFERENCE_VOCAB.contains(&type_value.as_str()) {
                    let source_ref = map
                        .get("source_ref")
                        .and_then(Value::as_str)
                        .or_else(|| map.get("path").and_then(Value::as_str))
                        .unwrap_or("unknown")
                        .to_string();
                    references.push(RefDraft {
                        ref_type: ReferenceType::parse(type_value),
                        source_ref,
                        payload: value.clone(),
                    });
                    return;
                }
                if ARTIFACT_VOCAB.contains(&type_value.as_str()) {
                    artifacts.push(ArtDraft {
                        artifact_type: ArtifactType::parse(type_value),
                        payload: value.clone(),
                    });
                    return;
                }
            }
            for (key, child) in map {
                if key == "steps" {
                    continue;
                }
                extract_fallback(child, references, artifacts);
            }
        }
        Value::Array(items) => {
            for item in items {
                extract_fallback(item, references, artifacts);
            }
        }
        _ => {}
    }
}

async fn embed_references(
    drafts: Vec<RefDraft>,
    embedder: &dyn Embedder,
) -> KbResult<Vec<Reference>> {
    let mut out = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let id = content_id("ref", &draft.payload);
        let text = serde_json::to_string(&draft.payload).unwrap_or_default();
        let embedding = embed_validated(embedder, &text).await.ok();
        out.push(Reference {
            id,
            ref_type: draft.ref_type,
            embedding,
            source_ref: draft.source_ref,
        });
    }
    Ok(out)
}

async fn embed_artifacts(drafts: Vec<ArtDraft>, embedder: &dyn Embedder) -> KbResult<Vec<Artifact>> {
    let mut out = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let id = content_id("artifact", &draft.payload);
        let hash = full_hash(&draft.payload);
        let text = serde_json::to_string(&draft.payload).unwrap_or_default();
        let embedding = embed_validated(embedder, &text).await.ok();
        out.push(Artifact {
            id,
            artifact_type: draft.artifact_type,
            embedding,
            hash,
        });
    }
    Ok(out)
}

fn dedup_by_id<T>(items: Vec<T>, key: impl Fn(&T) -> &String) -> Vec<T> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(key(item).clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MockEmbedder;
    use serde_json::json;

    #[tokio::test]
    async fn structured_steps_extract_reference_and_artifact() {
        let tree = json!({
            "steps": [
                {
                    "step_id": "1",
                    "step_type": "fetch",
                    "step_input": {"context": {"emailData": {"id": "m1", "subject": "hi"}}},
                    "step_output": {"data": {"id": "m1"}}
                },
                {
                    "step_id": "2",
                    "step_type": "llm_call",
                    "step_name": "generate_reply",
                    "step_output": {"data": {"text": "Sure thing"}}
                }
            ]
        });
        let embedder = MockEmbedder::new(8);
        let (refs, artifacts) = extract(&tree, &embedder).await.unwrap();
        assert_eq!(refs.len(), 2);
        assert!(refs.iter().any(|r| r.source_ref == "step_1.emailData"));
        assert!(refs.iter().any(|r| r.source_ref == "step_1.output_data"));
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].artifact_type, ArtifactType::Code);
    }

    #[tokio::test]
    async fn reply_in_step_input_yields_report_artifact() {
        let tree = json!({
            "steps": [
                {"step_id": "1", "step_type": "noop", "step_input": {"reply": "thanks!"}}
            ]
        });
        let embedder = MockEmbedder::new(8);
        let (_refs, artifacts) = extract(&tree, &embedder).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].artifact_type, ArtifactType::Report);
    }

    #[tokio::test]
    async fn fallback_traversal_only_runs_when_structured_pass_is_empty() {
        let tree = json!({
            "steps": [{"step_id": "1", "step_type": "noop"}],
            "extra": {"type": "document", "source_ref": "doc://x"}
        });
        let embedder = MockEmbedder::new(8);
        let (refs, artifacts) = extract(&tree, &embedder).await.unwrap();
        // structured pass found nothing from the single noop step, so fallback runs
        // and the "steps" subtree itself must be skipped (no entries from it).
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].source_ref, "doc://x");
        assert!(artifacts.is_empty());
    }

    #[tokio::test]
    async fn fallback_skipped_when_structured_pass_found_something() {
        let tree = json!({
            "steps": [
                {
                    "step_id": "1",
                    "step_type": "fetch",
                    "step_output": {"data": {"id": "m1"}}
                }
            ],
            "extra": {"type": "document", "source_ref": "doc://x"}
        });
        let embedder = MockEmbedder::new(8);
        let (refs, _artifacts) = extract(&tree, &embedder).await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].source_ref, "step_1.output_data");
    }

    #[tokio::test]
    async fn duplicate_payloads_coalesce_to_one_reference() {
        let tree = json!({
            "a": {"type": "schema", "source_ref": "s1"},
            "b": {"type": "schema", "source_ref": "s1"}
        });
        let embedder = MockEmbedder::new(8);
        let (refs, _) = extract(&tree, &embedder).await.unwrap();
        assert_eq!(refs.len(), 1);
    }
}
