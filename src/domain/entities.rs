//! Core domain types: the node labels and enums of the knowledge graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Partial,
}

impl Outcome {
    pub fn as_label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Partial => "partial",
        }
    }

    pub fn parse(label: &str) -> Self {
        match label {
            "success" => Outcome::Success,
            "failure" => Outcome::Failure,
            _ => Outcome::Partial,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    Schema,
    Document,
    ApiResponse,
    PriorRun,
    Unknown,
}

impl ReferenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceType::Schema => "schema",
            ReferenceType::Document => "document",
            ReferenceType::ApiResponse => "api_response",
            ReferenceType::PriorRun => "prior_run",
            ReferenceType::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "schema" => ReferenceType::Schema,
            "document" => ReferenceType::Document,
            "api_response" => ReferenceType::ApiResponse,
            "prior_run" => ReferenceType::PriorRun,
            _ => ReferenceType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Schema,
    Plan,
    Report,
    Code,
    Unknown,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::Schema => "schema",
            ArtifactType::Plan => "plan",
            ArtifactType::Report => "report",
            ArtifactType::Code => "code",
            ArtifactType::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "schema" => ArtifactType::Schema,
            "plan" => ArtifactType::Plan,
            "report" => ArtifactType::Report,
            "code" => ArtifactType::Code,
            _ => ArtifactType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Add,
    Not,
    Replace,
    Merge,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Add => "ADD",
            Decision::Not => "NOT",
            Decision::Replace => "REPLACE",
            Decision::Merge => "MERGE",
        }
    }

    /// Parse a decision string, returning `None` for anything outside the
    /// four-element set so callers can coerce to ADD (§4.4 post-validation).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "ADD" => Some(Decision::Add),
            "NOT" => Some(Decision::Not),
            "REPLACE" => Some(Decision::Replace),
            "MERGE" => Some(Decision::Merge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Active,
    Superseded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    pub id: String,
    #[serde(rename = "type")]
    pub ref_type: ReferenceType,
    pub embedding: Option<Vec<f32>>,
    pub source_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    pub embedding: Option<Vec<f32>>,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub agent_id: String,
    pub summary: String,
    pub reason_added: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub run_tree: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub status: RunStatus,
    pub superseded_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryDecision {
    pub run_id: String,
    pub decision: Decision,
    pub target_run_id: Option<String>,
    pub reason: String,
    pub similarity_score: Option<f32>,
    pub timestamp: DateTime<Utc>,
}

/// A fully expanded run, as returned to retrieval/ingestion callers.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: String,
    pub agent_id: String,
    pub user_id: Option<String>,
    pub task_id: String,
    pub task_text: String,
    pub summary: String,
    pub reason_added: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub run_tree: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub status: RunStatus,
    pub superseded_by: Option<String>,
    pub outcome: Outcome,
}

/// A Run's neighborhood: its references, artifacts, and outcome, read in one call (§4.7).
#[derive(Debug, Clone)]
pub struct RunNeighborhood {
    pub references: Vec<Reference>,
    pub artifacts: Vec<Artifact>,
    pub outcome: Outcome,
}
