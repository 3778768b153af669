//! SQLite storage backend for the knowledge base.

use super::traits::{
    GraphStore, OpenStore, Partition, RunScanRow, Stats, StorageError, StorageResult, TaskRow,
};
use crate::domain::{
    cosine_similarity, ArtifactType, MemoryDecision, Outcome, Reference, ReferenceType,
    RunNeighborhood, RunRecord, RunStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Base schema plus migrations, mirroring the two-phase pattern used
    /// elsewhere in this codebase: `CREATE TABLE IF NOT EXISTS` first, then
    /// `ALTER TABLE` migrations gated on `pragma_table_info` so repeated opens
    /// against an older on-disk schema don't error.
    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                user_id TEXT REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                text TEXT NOT NULL,
                embedding TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS "references" (
                id TEXT PRIMARY KEY,
                ref_type TEXT NOT NULL,
                embedding TEXT,
                source_ref TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS artifacts (
                id TEXT PRIMARY KEY,
                artifact_type TEXT NOT NULL,
                embedding TEXT,
                hash TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS outcomes (
                label TEXT PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                user_id TEXT,
                task_id TEXT NOT NULL,
                summary TEXT NOT NULL,
                reason_added TEXT,
                embedding TEXT,
                run_tree TEXT NOT NULL,
                outcome TEXT NOT NULL,
                status TEXT NOT NULL,
                superseded_by TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (task_id) REFERENCES tasks(id),
                FOREIGN KEY (agent_id) REFERENCES agents(id)
            );
            CREATE INDEX IF NOT EXISTS idx_runs_partition ON runs(agent_id, user_id);
            CREATE INDEX IF NOT EXISTS idx_runs_task ON runs(task_id);

            CREATE TABLE IF NOT EXISTS run_references (
                run_id TEXT NOT NULL,
                reference_id TEXT NOT NULL,
                PRIMARY KEY (run_id, reference_id)
            );

            CREATE TABLE IF NOT EXISTS run_artifacts (
                run_id TEXT NOT NULL,
                artifact_id TEXT NOT NULL,
                PRIMARY KEY (run_id, artifact_id)
            );

            CREATE TABLE IF NOT EXISTS memory_decisions (
                run_id TEXT PRIMARY KEY,
                decision TEXT NOT NULL,
                target_run_id TEXT,
                reason TEXT NOT NULL,
                similarity_score REAL,
                timestamp TEXT NOT NULL
            );
            "#,
        )?;
        Self::migrate_add_user_id_to_agents(conn)?;
        Ok(())
    }

    /// Early schema revisions created `agents` without `user_id`; add it if missing.
    fn migrate_add_user_id_to_agents(conn: &Connection) -> StorageResult<()> {
        let has_column: bool = conn
            .prepare("SELECT 1 FROM pragma_table_info('agents') WHERE name = 'user_id'")?
            .exists([])?;
        if !has_column {
            conn.execute("ALTER TABLE agents ADD COLUMN user_id TEXT", [])?;
        }
        Ok(())
    }

    fn encode_embedding(embedding: Option<&[f32]>) -> Option<String> {
        embedding.map(|e| serde_json::to_string(e).unwrap_or_default())
    }

    fn decode_embedding(raw: Option<String>) -> StorageResult<Option<Vec<f32>>> {
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    fn row_to_scan(row: &rusqlite::Row) -> rusqlite::Result<(String, String, Option<String>, String, Option<String>, String, String)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
        ))
    }
}

impl OpenStore for SqliteStore {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// Builds the `WHERE` partition clause per §4.4's three-way match: agent-only,
/// user-only, or both — whichever fields the caller actually populated.
fn partition_clause(partition: &Partition, table: &str) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
    let mut clauses = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(agent_id) = &partition.agent_id {
        clauses.push(format!("{table}.agent_id = ?"));
        values.push(Box::new(agent_id.clone()));
    }
    if let Some(user_id) = &partition.user_id {
        clauses.push(format!("{table}.user_id = ?"));
        values.push(Box::new(user_id.clone()));
    }
    if clauses.is_empty() {
        ("1=1".to_string(), values)
    } else {
        (clauses.join(" AND "), values)
    }
}

#[async_trait]
impl GraphStore for SqliteStore {
    async fn upsert_user(&self, id: &str) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (id) VALUES (?1) ON CONFLICT(id) DO NOTHING",
            params![id],
        )?;
        Ok(())
    }

    async fn upsert_agent(&self, id: &str, user_id: Option<&str>) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO agents (id, user_id) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET user_id = excluded.user_id",
            params![id, user_id],
        )?;
        Ok(())
    }

    async fn find_matching_task(
        &self,
        embedding: &[f32],
        threshold: f32,
    ) -> StorageResult<Option<TaskRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, text, embedding FROM tasks WHERE embedding IS NOT NULL")?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let text: String = row.get(1)?;
            let raw: Option<String> = row.get(2)?;
            Ok((id, text, raw))
        })?;

        let mut best: Option<(f32, TaskRow)> = None;
        for row in rows {
            let (id, text, raw) = row?;
            let Some(candidate) = Self::decode_embedding(raw)? else {
                continue;
            };
            if candidate.len() != embedding.len() {
                continue;
            }
            let sim = cosine_similarity(embedding, &candidate);
            if sim < threshold {
                continue;
            }
            if best.as_ref().map(|(s, _)| sim > *s).unwrap_or(true) {
                best = Some((
                    sim,
                    TaskRow {
                        id,
                        text,
                        embedding: candidate,
                    },
                ));
            }
        }
        Ok(best.map(|(_, task)| task))
    }

    async fn upsert_task(&self, id: &str, text: &str, embedding: &[f32]) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let encoded = Self::encode_embedding(Some(embedding));
        conn.execute(
            "INSERT INTO tasks (id, text, embedding, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET text = excluded.text, embedding = excluded.embedding",
            params![id, text, encoded, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn upsert_reference(
        &self,
        id: &str,
        ref_type: ReferenceType,
        embedding: Option<&[f32]>,
        source_ref: &str,
    ) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let encoded = Self::encode_embedding(embedding);
        conn.execute(
            r#"INSERT INTO "references" (id, ref_type, embedding, source_ref) VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT(id) DO UPDATE SET ref_type = excluded.ref_type,
                   embedding = excluded.embedding, source_ref = excluded.source_ref"#,
            params![id, ref_type.as_str(), encoded, source_ref],
        )?;
        Ok(())
    }

    async fn upsert_artifact(
        &self,
        id: &str,
        artifact_type: ArtifactType,
        embedding: Option<&[f32]>,
        hash: &str,
    ) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let encoded = Self::encode_embedding(embedding);
        conn.execute(
            "INSERT INTO artifacts (id, artifact_type, embedding, hash) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET artifact_type = excluded.artifact_type,
                 embedding = excluded.embedding, hash = excluded.hash",
            params![id, artifact_type.as_str(), encoded, hash],
        )?;
        Ok(())
    }

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
    ) -> StorageResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let user_id: Option<String> = tx
            .query_row(
                "SELECT user_id FROM agents WHERE id = ?1",
                params![agent_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        let encoded = Self::encode_embedding(embedding);
        let run_tree_json = serde_json::to_string(run_tree)?;

        tx.execute(
            "INSERT INTO runs (id, agent_id, user_id, task_id, summary, reason_added, embedding,
                 run_tree, outcome, status, superseded_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'active', NULL, ?10)
             ON CONFLICT(id) DO NOTHING",
            params![
                run_id,
                agent_id,
                user_id,
                task_id,
                summary,
                reason_added,
                encoded,
                run_tree_json,
                outcome.as_label(),
                Utc::now().to_rfc3339(),
            ],
        )?;

        tx.execute(
            "INSERT INTO outcomes (label) VALUES (?1) ON CONFLICT(label) DO NOTHING",
            params![outcome.as_label()],
        )?;

        for reference_id in reference_ids {
            tx.execute(
                "INSERT INTO run_references (run_id, reference_id) VALUES (?1, ?2)
                 ON CONFLICT(run_id, reference_id) DO NOTHING",
                params![run_id, reference_id],
            )?;
        }
        for artifact_id in artifact_ids {
            tx.execute(
                "INSERT INTO run_artifacts (run_id, artifact_id) VALUES (?1, ?2)
                 ON CONFLICT(run_id, artifact_id) DO NOTHING",
                params![run_id, artifact_id],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    async fn mark_superseded(&self, old_run_id: &str, new_run_id: &str) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE runs SET status = 'superseded', superseded_by = ?1 WHERE id = ?2",
            params![new_run_id, old_run_id],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(old_run_id.to_string()));
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> StorageResult<Option<RunScanRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, agent_id, user_id, task_id, embedding, status, created_at
                 FROM runs WHERE id = ?1",
                params![run_id],
                Self::row_to_scan,
            )
            .optional()?;
        row.map(scan_row_from_tuple).transpose()
    }

    async fn scan_partition_runs(&self, partition: &Partition) -> StorageResult<Vec<RunScanRow>> {
        let conn = self.conn.lock().unwrap();
        let (clause, values) = partition_clause(partition, "runs");
        let sql = format!(
            "SELECT id, agent_id, user_id, task_id, embedding, status, created_at
             FROM runs WHERE {clause}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let rows = stmt.query_map(param_refs.as_slice(), Self::row_to_scan)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(scan_row_from_tuple(row?)?);
        }
        Ok(out)
    }

    async fn expand_run(&self, run_id: &str) -> StorageResult<Option<RunRecord>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT r.id, r.agent_id, r.user_id, r.task_id, t.text, r.summary,
                        r.reason_added, r.embedding, r.run_tree, r.created_at, r.status,
                        r.superseded_by, r.outcome
                 FROM runs r JOIN tasks t ON t.id = r.task_id
                 WHERE r.id = ?1",
                params![run_id],
                |row| {
                    let id: String = row.get(0)?;
                    let agent_id: String = row.get(1)?;
                    let user_id: Option<String> = row.get(2)?;
                    let task_id: String = row.get(3)?;
                    let task_text: String = row.get(4)?;
                    let summary: String = row.get(5)?;
                    let reason_added: Option<String> = row.get(6)?;
                    let embedding_raw: Option<String> = row.get(7)?;
                    let run_tree_raw: String = row.get(8)?;
                    let created_at: String = row.get(9)?;
                    let status: String = row.get(10)?;
                    let superseded_by: Option<String> = row.get(11)?;
                    let outcome: String = row.get(12)?;
                    Ok((
                        id,
                        agent_id,
                        user_id,
                        task_id,
                        task_text,
                        summary,
                        reason_added,
                        embedding_raw,
                        run_tree_raw,
                        created_at,
                        status,
                        superseded_by,
                        outcome,
                    ))
                },
            )
            .optional()?;

        let Some((
            id,
            agent_id,
            user_id,
            task_id,
            task_text,
            summary,
            reason_added,
            embedding_raw,
            run_tree_raw,
            created_at,
            status,
            superseded_by,
            outcome,
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(RunRecord {
            id,
            agent_id,
            user_id,
            task_id,
            task_text,
            summary,
            reason_added,
            embedding: Self::decode_embedding(embedding_raw)?,
            run_tree: serde_json::from_str(&run_tree_raw)?,
            created_at: parse_timestamp(&created_at),
            status: status_from_str(&status),
            superseded_by,
            outcome: Outcome::parse(&outcome),
        }))
    }

    async fn get_run_neighborhood(&self, run_id: &str) -> StorageResult<RunNeighborhood> {
        let conn = self.conn.lock().unwrap();

        let outcome: String = conn.query_row(
            "SELECT outcome FROM runs WHERE id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;

        let mut ref_stmt = conn.prepare(
            r#"SELECT rf.id, rf.ref_type, rf.embedding, rf.source_ref
               FROM run_references rr JOIN "references" rf ON rf.id = rr.reference_id
               WHERE rr.run_id = ?1"#,
        )?;
        let references = ref_stmt
            .query_map(params![run_id], |row| {
                let id: String = row.get(0)?;
                let ref_type: String = row.get(1)?;
                let embedding_raw: Option<String> = row.get(2)?;
                let source_ref: String = row.get(3)?;
                Ok((id, ref_type, embedding_raw, source_ref))
            })?
            .map(|r| {
                let (id, ref_type, embedding_raw, source_ref) = r?;
                Ok::<_, StorageError>(Reference {
                    id,
                    ref_type: ReferenceType::parse(&ref_type),
                    embedding: Self::decode_embedding(embedding_raw)?,
                    source_ref,
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;

        let mut art_stmt = conn.prepare(
            "SELECT a.id, a.artifact_type, a.embedding, a.hash
             FROM run_artifacts ra JOIN artifacts a ON a.id = ra.artifact_id
             WHERE ra.run_id = ?1",
        )?;
        let artifacts = art_stmt
            .query_map(params![run_id], |row| {
                let id: String = row.get(0)?;
                let artifact_type: String = row.get(1)?;
                let embedding_raw: Option<String> = row.get(2)?;
                let hash: String = row.get(3)?;
                Ok((id, artifact_type, embedding_raw, hash))
            })?
            .map(|r| {
                let (id, artifact_type, embedding_raw, hash) = r?;
                Ok::<_, StorageError>(crate::domain::Artifact {
                    id,
                    artifact_type: ArtifactType::parse(&artifact_type),
                    embedding: Self::decode_embedding(embedding_raw)?,
                    hash,
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(RunNeighborhood {
            references,
            artifacts,
            outcome: Outcome::parse(&outcome),
        })
    }

    async fn save_decision(&self, decision: &MemoryDecision) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO memory_decisions (run_id, decision, target_run_id, reason,
                 similarity_score, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(run_id) DO UPDATE SET decision = excluded.decision,
                 target_run_id = excluded.target_run_id, reason = excluded.reason,
                 similarity_score = excluded.similarity_score, timestamp = excluded.timestamp",
            params![
                decision.run_id,
                decision.decision.as_str(),
                decision.target_run_id,
                decision.reason,
                decision.similarity_score,
                decision.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn stats(&self) -> StorageResult<Stats> {
        let conn = self.conn.lock().unwrap();
        let mut node_counts = Vec::new();
        for (label, table) in [
            ("User", "users"),
            ("Agent", "agents"),
            ("Task", "tasks"),
            ("Run", "runs"),
            ("Reference", "\"references\""),
            ("Artifact", "artifacts"),
            ("Outcome", "outcomes"),
        ] {
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            node_counts.push((label.to_string(), count));
        }

        let has_agent: i64 = conn.query_row(
            "SELECT COUNT(*) FROM agents WHERE user_id IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        let executed: i64 = conn.query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))?;
        let triggered = executed;
        let ended_with = executed;
        let reads: i64 =
            conn.query_row("SELECT COUNT(*) FROM run_references", [], |row| row.get(0))?;
        let writes: i64 =
            conn.query_row("SELECT COUNT(*) FROM run_artifacts", [], |row| row.get(0))?;

        Ok(Stats {
            node_counts,
            relationship_counts: vec![
                ("HAS_AGENT".to_string(), has_agent),
                ("EXECUTED".to_string(), executed),
                ("TRIGGERED".to_string(), triggered),
                ("READS".to_string(), reads),
                ("WRITES".to_string(), writes),
                ("ENDED_WITH".to_string(), ended_with),
            ],
        })
    }

    async fn clear_all(&self) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            DELETE FROM memory_decisions;
            DELETE FROM run_artifacts;
            DELETE FROM run_references;
            DELETE FROM runs;
            DELETE FROM outcomes;
            DELETE FROM artifacts;
            DELETE FROM "references";
            DELETE FROM tasks;
            DELETE FROM agents;
            DELETE FROM users;
            "#,
        )?;
        Ok(())
    }

    async fn fix_embedding_dimensions(&self, expected: usize) -> StorageResult<u64> {
        let conn = self.conn.lock().unwrap();
        let mut touched = 0u64;
        for (table, id_col) in [
            ("tasks", "id"),
            ("runs", "id"),
            ("\"references\"", "id"),
            ("artifacts", "id"),
        ] {
            let mut stmt = conn.prepare(&format!(
                "SELECT {id_col}, embedding FROM {table} WHERE embedding IS NOT NULL"
            ))?;
            let bad_ids: Vec<String> = stmt
                .query_map([], |row| {
                    let id: String = row.get(0)?;
                    let raw: String = row.get(1)?;
                    Ok((id, raw))
                })?
                .filter_map(|r| r.ok())
                .filter_map(|(id, raw)| {
                    let decoded: Vec<f32> = serde_json::from_str(&raw).ok()?;
                    (decoded.len() != expected).then_some(id)
                })
                .collect();
            for id in bad_ids {
                conn.execute(
                    &format!("UPDATE {table} SET embedding = NULL WHERE {id_col} = ?1"),
                    params![id],
                )?;
                touched += 1;
            }
        }
        Ok(touched)
    }
}

fn scan_row_from_tuple(
    row: (String, String, Option<String>, String, Option<String>, String, String),
) -> StorageResult<RunScanRow> {
    let (id, agent_id, user_id, task_id, embedding_raw, status, created_at) = row;
    Ok(RunScanRow {
        id,
        agent_id,
        user_id,
        task_id,
        embedding: SqliteStore::decode_embedding(embedding_raw)?,
        status: status_from_str(&status),
        created_at: parse_timestamp(&created_at),
    })
}

fn status_from_str(s: &str) -> RunStatus {
    match s {
        "superseded" => RunStatus::Superseded,
        _ => RunStatus::Active,
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ReferenceType;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn upserts_user_and_agent_idempotently() {
        let store = store();
        store.upsert_user("user-1").await.unwrap();
        store.upsert_user("user-1").await.unwrap();
        store.upsert_agent("agent-1", Some("user-1")).await.unwrap();
        store.upsert_agent("agent-1", Some("user-1")).await.unwrap();
        let stats = store.stats().await.unwrap();
        let users = stats
            .node_counts
            .iter()
            .find(|(label, _)| label == "User")
            .unwrap()
            .1;
        assert_eq!(users, 1);
    }

    #[tokio::test]
    async fn find_matching_task_respects_threshold() {
        let store = store();
        store
            .upsert_task("task-1", "deploy the service", &[1.0, 0.0, 0.0])
            .await
            .unwrap();

        let hit = store
            .find_matching_task(&[0.99, 0.01, 0.0], 0.85)
            .await
            .unwrap();
        assert!(hit.is_some());

        let miss = store
            .find_matching_task(&[0.0, 1.0, 0.0], 0.85)
            .await
            .unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn find_matching_task_is_not_scoped_to_a_partition() {
        // Task rows carry no agent_id/user_id of their own (§3); a near-duplicate
        // task minted under a different agent must still be found and reused.
        let store = store();
        store.upsert_agent("agent-a", None).await.unwrap();
        store.upsert_agent("agent-b", None).await.unwrap();
        store
            .upsert_task("task-1", "deploy the service", &[1.0, 0.0, 0.0])
            .await
            .unwrap();

        let hit = store
            .find_matching_task(&[0.99, 0.01, 0.0], 0.85)
            .await
            .unwrap();
        assert_eq!(hit.unwrap().id, "task-1");
    }

    #[tokio::test]
    async fn create_run_is_idempotent_on_repeated_id() {
        let store = store();
        store.upsert_agent("agent-1", None).await.unwrap();
        store
            .upsert_task("task-1", "do a thing", &[1.0, 0.0])
            .await
            .unwrap();
        let tree = serde_json::json!({"steps": []});

        for _ in 0..2 {
            store
                .create_run(
                    "run-1",
                    "agent-1",
                    "task-1",
                    "did the thing",
                    None,
                    Some(&[1.0, 0.0]),
                    &tree,
                    Outcome::Success,
                    &[],
                    &[],
                )
                .await
                .unwrap();
        }

        let stats = store.stats().await.unwrap();
        let runs = stats
            .node_counts
            .iter()
            .find(|(label, _)| label == "Run")
            .unwrap()
            .1;
        assert_eq!(runs, 1);
    }

    #[tokio::test]
    async fn supersede_sets_status_and_pointer() {
        let store = store();
        store.upsert_agent("agent-1", None).await.unwrap();
        store
            .upsert_task("task-1", "do a thing", &[1.0, 0.0])
            .await
            .unwrap();
        let tree = serde_json::json!({});
        for run_id in ["run-1", "run-2"] {
            store
                .create_run(
                    run_id,
                    "agent-1",
                    "task-1",
                    "summary",
                    None,
                    None,
                    &tree,
                    Outcome::Success,
                    &[],
                    &[],
                )
                .await
                .unwrap();
        }
        store.mark_superseded("run-1", "run-2").await.unwrap();
        let row = store.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(row.status, RunStatus::Superseded);
    }

    #[tokio::test]
    async fn partition_scan_only_returns_matching_runs() {
        let store = store();
        store.upsert_agent("agent-a", None).await.unwrap();
        store.upsert_agent("agent-b", None).await.unwrap();
        store
            .upsert_task("task-1", "shared task", &[1.0, 0.0])
            .await
            .unwrap();
        let tree = serde_json::json!({});
        store
            .create_run(
                "run-a",
                "agent-a",
                "task-1",
                "a",
                None,
                None,
                &tree,
                Outcome::Success,
                &[],
                &[],
            )
            .await
            .unwrap();
        store
            .create_run(
                "run-b",
                "agent-b",
                "task-1",
                "b",
                None,
                None,
                &tree,
                Outcome::Success,
                &[],
                &[],
            )
            .await
            .unwrap();

        let partition = Partition {
            agent_id: Some("agent-a".to_string()),
            user_id: None,
        };
        let rows = store.scan_partition_runs(&partition).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "run-a");
    }

    #[tokio::test]
    async fn neighborhood_returns_linked_references_and_artifacts() {
        let store = store();
        store.upsert_agent("agent-1", None).await.unwrap();
        store
            .upsert_task("task-1", "task text", &[1.0])
            .await
            .unwrap();
        store
            .upsert_reference("ref_1", ReferenceType::Document, None, "doc://a")
            .await
            .unwrap();
        store
            .upsert_artifact("artifact_1", ArtifactType::Report, None, "deadbeef")
            .await
            .unwrap();
        let tree = serde_json::json!({});
        store
            .create_run(
                "run-1",
                "agent-1",
                "task-1",
                "summary",
                None,
                None,
                &tree,
                Outcome::Partial,
                &["ref_1".to_string()],
                &["artifact_1".to_string()],
            )
            .await
            .unwrap();

        let neighborhood = store.get_run_neighborhood("run-1").await.unwrap();
        assert_eq!(neighborhood.references.len(), 1);
        assert_eq!(neighborhood.artifacts.len(), 1);
        assert_eq!(neighborhood.outcome, Outcome::Partial);
    }

    #[tokio::test]
    async fn fix_embedding_dimensions_nulls_mismatched_rows() {
        let store = store();
        store
            .upsert_task("task-1", "x", &[1.0, 2.0, 3.0])
            .await
            .unwrap();
        let touched = store.fix_embedding_dimensions(2).await.unwrap();
        assert_eq!(touched, 1);
        let hit = store
            .find_matching_task(&[1.0, 2.0], 0.0)
            .await
            .unwrap();
        assert!(hit.is_none());
    }
}
