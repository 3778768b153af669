//! The `GraphStore` port: the one interface the rest of the crate uses to
//! persist and query the knowledge graph.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use thiserror::Error;

use crate::domain::{
    ArtifactType, MemoryDecision, Outcome, ReferenceType, RunNeighborhood, RunRecord, RunStatus,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Counts returned by `/stats`: node counts per label, relationship counts per type.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub node_counts: Vec<(String, i64)>,
    pub relationship_counts: Vec<(String, i64)>,
}

/// A stored task row, as resolved by `find_matching_task`/`upsert_task`.
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// A run's light descriptor, as scanned during admission/retrieval (no full
/// expansion — callers that need references/artifacts/outcome call
/// `get_run_neighborhood` for the survivors only).
#[derive(Debug, Clone)]
pub struct RunScanRow {
    pub id: String,
    pub agent_id: String,
    pub user_id: Option<String>,
    pub task_id: String,
    pub embedding: Option<Vec<f32>>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
}

/// The partition key a run or task is scoped to (§4.4's three-way match).
#[derive(Debug, Clone, Default)]
pub struct Partition {
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn upsert_user(&self, id: &str) -> StorageResult<()>;

    async fn upsert_agent(&self, id: &str, user_id: Option<&str>) -> StorageResult<()>;

    /// Iteratively scans all existing tasks (no partition scoping — the
    /// original scans `MATCH (t:Task)` globally, and Task rows carry no
    /// `agent_id`/`user_id` of their own) for the best cosine match above
    /// `threshold`; returns `None` if no task clears the bar.
    async fn find_matching_task(
        &self,
        embedding: &[f32],
        threshold: f32,
    ) -> StorageResult<Option<TaskRow>>;

    async fn upsert_task(&self, id: &str, text: &str, embedding: &[f32]) -> StorageResult<()>;

    async fn upsert_reference(
        &self,
        id: &str,
        ref_type: ReferenceType,
        embedding: Option<&[f32]>,
        source_ref: &str,
    ) -> StorageResult<()>;

    async fn upsert_artifact(
        &self,
        id: &str,
        artifact_type: ArtifactType,
        embedding: Option<&[f32]>,
        hash: &str,
    ) -> StorageResult<()>;

    /// Creates a Run node plus its TRIGGERED/EXECUTED/READS/WRITES/ENDED_WITH
    /// edges. Idempotent on re-seen `run_id`: no duplicate nodes or edges.
    #[allow(clippy::too_many_arguments)]
    async fn create_run(
        &self,
        run_id: &str,
        agent_id: &str,
        task_id: &str,
        summary: &str,
        reason_added: Option<&str>,
        embedding: Option<&[f32]>,
        run_tree: &serde_json::Value,
        outcome: Outcome,
        reference_ids: &[String],
        artifact_ids: &[String],
    ) -> StorageResult<()>;

    /// Marks `old_run_id` as superseded by `new_run_id`. Must run after the
    /// new Run is persisted.
    async fn mark_superseded(&self, old_run_id: &str, new_run_id: &str) -> StorageResult<()>;

    async fn get_run(&self, run_id: &str) -> StorageResult<Option<RunScanRow>>;

    /// All runs matching `partition`, regardless of status, for similarity
    /// scanning and retrieval. Dimension filtering against the query vector
    /// is the caller's responsibility.
    async fn scan_partition_runs(&self, partition: &Partition) -> StorageResult<Vec<RunScanRow>>;

    /// Expands a run's task/references/artifacts/outcome/run_tree into a full record.
    async fn expand_run(&self, run_id: &str) -> StorageResult<Option<RunRecord>>;

    async fn get_run_neighborhood(&self, run_id: &str) -> StorageResult<RunNeighborhood>;

    /// Upserted by `run_id`: re-ingesting the same run overwrites its decision record.
    async fn save_decision(&self, decision: &MemoryDecision) -> StorageResult<()>;

    async fn stats(&self) -> StorageResult<Stats>;

    async fn clear_all(&self) -> StorageResult<()>;

    /// Nulls out embeddings whose stored dimension no longer matches `expected`,
    /// across tasks/runs/references/artifacts. Returns the number of rows touched.
    async fn fix_embedding_dimensions(&self, expected: usize) -> StorageResult<u64>;
}

/// Extension trait for opening stores from paths, mirroring how callers
/// construct any other store implementation before handing it off as a
/// trait object.
pub trait OpenStore: GraphStore + Sized {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self>;

    fn open_in_memory() -> StorageResult<Self>;
}
