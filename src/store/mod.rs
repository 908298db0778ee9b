//! SQLite store — the single source of truth.
//!
//! All persisted state lives here: tasks, sessions, comments, events, the
//! rate-limit snapshot, and projects. Every other component receives
//! snapshot values and writes back through this API; nothing shares
//! in-memory mutable state.

pub mod models;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use self::models::{
    Comment, Event, Project, ProjectCreate, RateLimitSnapshot, Session, SessionPatch,
    SessionStatus, Task, TaskCreate, TaskPatch, TaskStatus,
};

/// A pending duplicate removed by `dedupe_pending`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupedTask {
    pub removed_id: i64,
    pub removed_uuid: String,
    pub kept_id: i64,
}

/// Database handle with async-safe locking.
///
/// The mutex is only ever held across synchronous rusqlite calls — never
/// across an await point — so store access cannot stall the runtime.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at the given path and apply the schema.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening database: {}", path.display()))?;

        // WAL for concurrent reads; FKs for comment cascade
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000; PRAGMA foreign_keys=ON;",
        )?;
        apply_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA busy_timeout=5000; PRAGMA foreign_keys=ON;")?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // --- Tasks ---

    /// Create a task at the end of the queue.
    ///
    /// Rejects a parent id that does not reference an existing task, or a
    /// parent chain that loops.
    pub async fn create_task(&self, create: TaskCreate) -> anyhow::Result<Task> {
        let conn = self.conn.lock().await;

        if let Some(parent_id) = create.parent_task_id {
            ensure_acyclic_parent(&conn, parent_id)?;
        }

        let next_position: i64 = conn
            .query_row("SELECT COALESCE(MAX(position), 0) + 1 FROM tasks", [], |r| {
                r.get(0)
            })?;

        let uuid = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO tasks (uuid, title, description, priority, position, parent_task_id, project_id, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                uuid,
                create.title,
                create.description,
                create.priority,
                next_position,
                create.parent_task_id,
                create.project_id,
                Value::Object(create.metadata).to_string(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        get_task_sync(&conn, id)?.context("task vanished after insert")
    }

    pub async fn get_task(&self, id: i64) -> anyhow::Result<Option<Task>> {
        let conn = self.conn.lock().await;
        get_task_sync(&conn, id)
    }

    /// List tasks ordered by (position, priority DESC, id).
    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> anyhow::Result<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut out = Vec::new();
        match status {
            Some(s) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM tasks WHERE status = ?1
                     ORDER BY position, priority DESC, id",
                )?;
                let rows = stmt.query_map([s.as_str()], row_to_task)?;
                for t in rows {
                    out.push(t?);
                }
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT * FROM tasks ORDER BY position, priority DESC, id")?;
                let rows = stmt.query_map([], row_to_task)?;
                for t in rows {
                    out.push(t?);
                }
            }
        }
        Ok(out)
    }

    /// Children of a parent task.
    pub async fn subtasks(&self, parent_id: i64) -> anyhow::Result<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM tasks WHERE parent_task_id = ?1
             ORDER BY position, priority DESC, id",
        )?;
        let rows = stmt.query_map([parent_id], row_to_task)?;
        let mut out = Vec::new();
        for t in rows {
            out.push(t?);
        }
        Ok(out)
    }

    /// Apply a partial update. Metadata merges shallowly; `null` values
    /// delete the key.
    pub async fn update_task(&self, id: i64, patch: TaskPatch) -> anyhow::Result<Option<Task>> {
        let conn = self.conn.lock().await;

        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(v) = patch.title {
            sets.push("title = ?".into());
            values.push(Box::new(v));
        }
        if let Some(v) = patch.description {
            sets.push("description = ?".into());
            values.push(Box::new(v));
        }
        if let Some(v) = patch.status {
            sets.push("status = ?".into());
            values.push(Box::new(v.as_str().to_string()));
        }
        if let Some(v) = patch.priority {
            sets.push("priority = ?".into());
            values.push(Box::new(v));
        }
        if let Some(v) = patch.position {
            sets.push("position = ?".into());
            values.push(Box::new(v));
        }
        if let Some(v) = patch.complexity {
            sets.push("complexity = ?".into());
            values.push(Box::new(v));
        }
        if let Some(v) = patch.recommended_model {
            sets.push("recommended_model = ?".into());
            values.push(Box::new(v));
        }
        if let Some(v) = patch.active_session_id {
            sets.push("active_session_id = ?".into());
            values.push(Box::new(v));
        }
        if let Some(v) = patch.started_at {
            sets.push("started_at = ?".into());
            values.push(Box::new(v.map(fmt_ts)));
        }
        if let Some(v) = patch.completed_at {
            sets.push("completed_at = ?".into());
            values.push(Box::new(v.map(fmt_ts)));
        }
        if let Some(merge) = patch.metadata {
            let current: Option<String> = conn
                .query_row("SELECT metadata FROM tasks WHERE id = ?1", [id], |r| {
                    r.get(0)
                })
                .optional()?;
            let Some(current) = current else {
                return Ok(None);
            };
            let mut map: Map<String, Value> =
                serde_json::from_str(&current).unwrap_or_default();
            merge_into(&mut map, merge);
            sets.push("metadata = ?".into());
            values.push(Box::new(Value::Object(map).to_string()));
        }

        if sets.is_empty() {
            return get_task_sync(&conn, id);
        }

        values.push(Box::new(id));
        let sql = format!("UPDATE tasks SET {} WHERE id = ?", sets.join(", "));
        let n = conn.execute(
            &sql,
            &values.iter().map(|v| v.as_ref()).collect::<Vec<&dyn rusqlite::ToSql>>()[..],
        )?;
        if n == 0 {
            return Ok(None);
        }
        get_task_sync(&conn, id)
    }

    /// Shallow-merge a metadata patch; `null` values delete keys.
    pub async fn merge_metadata(
        &self,
        task_id: i64,
        patch: Map<String, Value>,
    ) -> anyhow::Result<Option<Task>> {
        self.update_task(task_id, TaskPatch::metadata(patch)).await
    }

    /// Apply a user-supplied `(id, position)` vector in one transaction.
    pub async fn reorder_tasks(&self, positions: &[(i64, i64)]) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        for (id, position) in positions {
            tx.execute(
                "UPDATE tasks SET position = ?1 WHERE id = ?2",
                params![position, id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Up to `limit` pending tasks with no complexity yet, in queue order.
    pub async fn next_pending_unassessed(&self, limit: usize) -> anyhow::Result<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM tasks
             WHERE status = 'pending' AND complexity IS NULL
             ORDER BY position, priority DESC, id LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], row_to_task)?;
        let mut out = Vec::new();
        for t in rows {
            out.push(t?);
        }
        Ok(out)
    }

    /// Up to `limit` assessed, user-activated pending tasks that are not
    /// awaiting decomposition, in queue order.
    pub async fn next_executable(&self, limit: usize) -> anyhow::Result<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM tasks
             WHERE status = 'pending'
               AND complexity IS NOT NULL
               AND json_extract(metadata, '$.active') = 1
               AND COALESCE(json_extract(metadata, '$.assessment.should_decompose'), 0) = 0
             ORDER BY position, priority DESC, id LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], row_to_task)?;
        let mut out = Vec::new();
        for t in rows {
            out.push(t?);
        }
        Ok(out)
    }

    /// Sessions currently counting against the concurrency cap.
    pub async fn count_running_sessions(&self) -> anyhow::Result<usize> {
        let conn = self.conn.lock().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE status IN ('created', 'running')",
            [],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    /// Collapse exact (title, description, parent) duplicates among pending
    /// tasks. The lowest id in each group survives; the rest are deleted in
    /// one transaction.
    pub async fn dedupe_pending(&self) -> anyhow::Result<Vec<DedupedTask>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let removed = {
            let mut stmt = tx.prepare(
                "SELECT t.id, t.uuid, keep.min_id FROM tasks t
                 JOIN (
                     SELECT title, description,
                            COALESCE(parent_task_id, -1) AS parent_key,
                            MIN(id) AS min_id
                     FROM tasks WHERE status = 'pending'
                     GROUP BY title, description, parent_key
                     HAVING COUNT(*) > 1
                 ) keep
                   ON t.title = keep.title
                  AND t.description = keep.description
                  AND COALESCE(t.parent_task_id, -1) = keep.parent_key
                 WHERE t.status = 'pending' AND t.id != keep.min_id
                 ORDER BY t.id",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok(DedupedTask {
                    removed_id: r.get(0)?,
                    removed_uuid: r.get(1)?,
                    kept_id: r.get(2)?,
                })
            })?;
            let mut removed = Vec::new();
            for row in rows {
                removed.push(row?);
            }
            removed
        };
        for dup in &removed {
            tx.execute("DELETE FROM tasks WHERE id = ?1", [dup.removed_id])?;
        }
        tx.commit()?;
        Ok(removed)
    }

    // --- Sessions ---

    /// Insert a session row. Stdout/stderr paths must already be decided —
    /// they are recorded before the process is launched.
    pub async fn create_session(
        &self,
        task_id: i64,
        working_directory: &str,
        model: &str,
        stdout_path: &str,
        stderr_path: &str,
        uuid: &str,
    ) -> anyhow::Result<Session> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sessions (uuid, task_id, working_directory, model, stdout_path, stderr_path, artifacts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, '{}')",
            params![uuid, task_id, working_directory, model, stdout_path, stderr_path],
        )?;
        let id = conn.last_insert_rowid();
        get_session_sync(&conn, id)?.context("session vanished after insert")
    }

    pub async fn get_session(&self, id: i64) -> anyhow::Result<Option<Session>> {
        let conn = self.conn.lock().await;
        get_session_sync(&conn, id)
    }

    pub async fn list_sessions(
        &self,
        task_id: Option<i64>,
        status: Option<SessionStatus>,
    ) -> anyhow::Result<Vec<Session>> {
        let conn = self.conn.lock().await;
        let mut sql = String::from("SELECT * FROM sessions WHERE 1=1");
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(tid) = task_id {
            sql.push_str(" AND task_id = ?");
            values.push(Box::new(tid));
        }
        if let Some(s) = status {
            sql.push_str(" AND status = ?");
            values.push(Box::new(s.as_str().to_string()));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            &values.iter().map(|v| v.as_ref()).collect::<Vec<&dyn rusqlite::ToSql>>()[..],
            row_to_session,
        )?;
        let mut out = Vec::new();
        for s in rows {
            out.push(s?);
        }
        Ok(out)
    }

    pub async fn update_session(
        &self,
        id: i64,
        patch: SessionPatch,
    ) -> anyhow::Result<Option<Session>> {
        let conn = self.conn.lock().await;

        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(v) = patch.status {
            sets.push("status = ?".into());
            values.push(Box::new(v.as_str().to_string()));
        }
        if let Some(v) = patch.turn_count {
            sets.push("turn_count = ?".into());
            values.push(Box::new(v));
        }
        if let Some(v) = patch.pid {
            sets.push("pid = ?".into());
            values.push(Box::new(v));
        }
        if let Some(v) = patch.exit_code {
            sets.push("exit_code = ?".into());
            values.push(Box::new(v));
        }
        if let Some(v) = patch.claude_session_id {
            sets.push("claude_session_id = ?".into());
            values.push(Box::new(v));
        }
        if let Some(v) = patch.started_at {
            sets.push("started_at = ?".into());
            values.push(Box::new(fmt_ts(v)));
        }
        if let Some(v) = patch.completed_at {
            sets.push("completed_at = ?".into());
            values.push(Box::new(fmt_ts(v)));
        }
        if let Some(v) = patch.last_heartbeat {
            sets.push("last_heartbeat = ?".into());
            values.push(Box::new(fmt_ts(v)));
        }
        if let Some(v) = patch.artifacts {
            sets.push("artifacts = ?".into());
            values.push(Box::new(Value::Object(v).to_string()));
        }

        if sets.is_empty() {
            return get_session_sync(&conn, id);
        }

        values.push(Box::new(id));
        let sql = format!("UPDATE sessions SET {} WHERE id = ?", sets.join(", "));
        let n = conn.execute(
            &sql,
            &values.iter().map(|v| v.as_ref()).collect::<Vec<&dyn rusqlite::ToSql>>()[..],
        )?;
        if n == 0 {
            return Ok(None);
        }
        get_session_sync(&conn, id)
    }

    // --- Comments ---

    pub async fn create_comment(
        &self,
        task_id: i64,
        content: &str,
        author: &str,
    ) -> anyhow::Result<Comment> {
        let conn = self.conn.lock().await;
        let uuid = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO comments (uuid, task_id, content, author) VALUES (?1, ?2, ?3, ?4)",
            params![uuid, task_id, content, author],
        )?;
        let id = conn.last_insert_rowid();
        let comment = conn.query_row("SELECT * FROM comments WHERE id = ?1", [id], row_to_comment)?;
        Ok(comment)
    }

    pub async fn list_comments(&self, task_id: i64) -> anyhow::Result<Vec<Comment>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT * FROM comments WHERE task_id = ?1 ORDER BY created_at, id")?;
        let rows = stmt.query_map([task_id], row_to_comment)?;
        let mut out = Vec::new();
        for c in rows {
            out.push(c?);
        }
        Ok(out)
    }

    // --- Events ---

    /// Append to the event log and return the stored row.
    pub async fn append_event(
        &self,
        event_type: &str,
        entity_type: &str,
        entity_id: Option<&str>,
        payload: &Value,
    ) -> anyhow::Result<Event> {
        let conn = self.conn.lock().await;
        let uuid = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO events (uuid, event_type, entity_type, entity_id, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![uuid, event_type, entity_type, entity_id, payload.to_string()],
        )?;
        let id = conn.last_insert_rowid();
        let event = conn.query_row("SELECT * FROM events WHERE id = ?1", [id], row_to_event)?;
        Ok(event)
    }

    pub async fn list_events(
        &self,
        event_type: Option<&str>,
        entity_id: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<Event>> {
        let conn = self.conn.lock().await;
        let mut sql = String::from("SELECT * FROM events WHERE 1=1");
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(t) = event_type {
            sql.push_str(" AND event_type = ?");
            values.push(Box::new(t.to_string()));
        }
        if let Some(e) = entity_id {
            sql.push_str(" AND entity_id = ?");
            values.push(Box::new(e.to_string()));
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");
        values.push(Box::new(limit as i64));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            &values.iter().map(|v| v.as_ref()).collect::<Vec<&dyn rusqlite::ToSql>>()[..],
            row_to_event,
        )?;
        let mut out = Vec::new();
        for e in rows {
            out.push(e?);
        }
        Ok(out)
    }

    // --- Rate limit snapshot ---

    pub async fn get_rate_limit(&self) -> anyhow::Result<Option<RateLimitSnapshot>> {
        let conn = self.conn.lock().await;
        let snap = conn
            .query_row("SELECT * FROM rate_limits WHERE id = 1", [], |row| {
                Ok(RateLimitSnapshot {
                    tier: row.get("tier")?,
                    messages_used: row.get("messages_used")?,
                    messages_limit: row.get("messages_limit")?,
                    percent_used: row.get("percent_used")?,
                    is_limited: row.get::<_, i64>("is_limited")? != 0,
                    reset_at: parse_opt_ts(row.get::<_, Option<String>>("reset_at")?),
                    updated_at: parse_opt_ts(row.get::<_, Option<String>>("updated_at")?),
                })
            })
            .optional()?;
        Ok(snap)
    }

    /// Upsert the singleton snapshot row.
    pub async fn update_rate_limit(
        &self,
        snap: &RateLimitSnapshot,
        raw: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO rate_limits
                 (id, tier, messages_used, messages_limit, percent_used, is_limited, reset_at, raw_output, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))",
            params![
                snap.tier,
                snap.messages_used,
                snap.messages_limit,
                snap.percent_used,
                snap.is_limited as i64,
                snap.reset_at.map(fmt_ts),
                truncate_chars(raw, 2000),
            ],
        )?;
        Ok(())
    }

    // --- Projects ---

    pub async fn create_project(&self, create: ProjectCreate) -> anyhow::Result<Project> {
        let conn = self.conn.lock().await;
        let uuid = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO projects (uuid, name, working_directory, git_repo, default_branch)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                uuid,
                create.name,
                create.working_directory,
                create.git_repo,
                create.default_branch,
            ],
        )?;
        let id = conn.last_insert_rowid();
        let project = conn.query_row("SELECT * FROM projects WHERE id = ?1", [id], row_to_project)?;
        Ok(project)
    }

    pub async fn get_project(&self, id: i64) -> anyhow::Result<Option<Project>> {
        let conn = self.conn.lock().await;
        let project = conn
            .query_row("SELECT * FROM projects WHERE id = ?1", [id], row_to_project)
            .optional()?;
        Ok(project)
    }

    pub async fn list_projects(&self) -> anyhow::Result<Vec<Project>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM projects ORDER BY name")?;
        let rows = stmt.query_map([], row_to_project)?;
        let mut out = Vec::new();
        for p in rows {
            out.push(p?);
        }
        Ok(out)
    }
}

/// Truncate raw probe output to avoid bloating the snapshot row.
fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Shallow merge with the `null` delete sentinel.
fn merge_into(target: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        if value.is_null() {
            target.remove(&key);
        } else {
            target.insert(key, value);
        }
    }
}

/// Walk the ancestor chain, rejecting a missing parent or a loop.
fn ensure_acyclic_parent(conn: &Connection, parent_id: i64) -> anyhow::Result<()> {
    let mut seen = std::collections::HashSet::new();
    let mut current = Some(parent_id);
    while let Some(id) = current {
        if !seen.insert(id) {
            anyhow::bail!("parent chain contains a cycle at task {id}");
        }
        let next: Option<Option<i64>> = conn
            .query_row("SELECT parent_task_id FROM tasks WHERE id = ?1", [id], |r| {
                r.get(0)
            })
            .optional()?;
        match next {
            None => anyhow::bail!("parent task {id} does not exist"),
            Some(p) => current = p,
        }
    }
    Ok(())
}

fn get_task_sync(conn: &Connection, id: i64) -> anyhow::Result<Option<Task>> {
    let task = conn
        .query_row("SELECT * FROM tasks WHERE id = ?1", [id], row_to_task)
        .optional()?;
    Ok(task)
}

fn get_session_sync(conn: &Connection, id: i64) -> anyhow::Result<Option<Session>> {
    let session = conn
        .query_row("SELECT * FROM sessions WHERE id = ?1", [id], row_to_session)
        .optional()?;
    Ok(session)
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(parse_ts)
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get("status")?;
    let metadata: Option<String> = row.get("metadata")?;
    Ok(Task {
        id: row.get("id")?,
        uuid: row.get("uuid")?,
        title: row.get("title")?,
        description: row.get("description")?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Pending),
        priority: row.get("priority")?,
        position: row.get("position")?,
        parent_task_id: row.get("parent_task_id")?,
        project_id: row.get("project_id")?,
        complexity: row.get("complexity")?,
        recommended_model: row.get("recommended_model")?,
        active_session_id: row.get("active_session_id")?,
        created_at: parse_ts(row.get("created_at")?),
        started_at: parse_opt_ts(row.get("started_at")?),
        completed_at: parse_opt_ts(row.get("completed_at")?),
        metadata: metadata
            .and_then(|m| serde_json::from_str(&m).ok())
            .unwrap_or_default(),
    })
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get("status")?;
    let artifacts: Option<String> = row.get("artifacts")?;
    Ok(Session {
        id: row.get("id")?,
        uuid: row.get("uuid")?,
        task_id: row.get("task_id")?,
        claude_session_id: row.get("claude_session_id")?,
        working_directory: row.get("working_directory")?,
        model: row.get("model")?,
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Created),
        turn_count: row.get("turn_count")?,
        stdout_path: row.get("stdout_path")?,
        stderr_path: row.get("stderr_path")?,
        pid: row.get("pid")?,
        exit_code: row.get("exit_code")?,
        created_at: parse_ts(row.get("created_at")?),
        started_at: parse_opt_ts(row.get("started_at")?),
        completed_at: parse_opt_ts(row.get("completed_at")?),
        last_heartbeat: parse_opt_ts(row.get("last_heartbeat")?),
        artifacts: artifacts
            .and_then(|a| serde_json::from_str(&a).ok())
            .unwrap_or_default(),
    })
}

fn row_to_comment(row: &Row<'_>) -> rusqlite::Result<Comment> {
    Ok(Comment {
        id: row.get("id")?,
        uuid: row.get("uuid")?,
        task_id: row.get("task_id")?,
        content: row.get("content")?,
        author: row.get("author")?,
        created_at: parse_ts(row.get("created_at")?),
        updated_at: parse_ts(row.get("updated_at")?),
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let payload: String = row.get("payload")?;
    Ok(Event {
        id: row.get("id")?,
        uuid: row.get("uuid")?,
        event_type: row.get("event_type")?,
        entity_type: row.get("entity_type")?,
        entity_id: row.get("entity_id")?,
        payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
        created_at: parse_ts(row.get("created_at")?),
    })
}

fn row_to_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get("id")?,
        uuid: row.get("uuid")?,
        name: row.get("name")?,
        working_directory: row.get("working_directory")?,
        git_repo: row.get("git_repo")?,
        default_branch: row.get("default_branch")?,
        created_at: parse_ts(row.get("created_at")?),
        updated_at: parse_ts(row.get("updated_at")?),
    })
}

fn apply_schema(conn: &Connection) -> anyhow::Result<()> {
    for (i, script) in SCHEMA.iter().enumerate() {
        conn.execute_batch(script)
            .with_context(|| format!("applying schema step {}", i + 1))?;
    }
    Ok(())
}

/// Ordered, idempotent schema steps applied on every open.
const SCHEMA: &[&str] = &[
    // 001: core entities
    r#"
CREATE TABLE IF NOT EXISTS tasks (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid               TEXT NOT NULL UNIQUE,
    title              TEXT NOT NULL,
    description        TEXT NOT NULL DEFAULT '',
    status             TEXT NOT NULL DEFAULT 'pending',
    priority           INTEGER NOT NULL DEFAULT 0,
    position           INTEGER NOT NULL DEFAULT 0,
    parent_task_id     INTEGER REFERENCES tasks(id),
    project_id         INTEGER REFERENCES projects(id),
    complexity         TEXT,
    recommended_model  TEXT,
    active_session_id  INTEGER,
    created_at         TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    started_at         TEXT,
    completed_at       TEXT,
    metadata           TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS sessions (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid               TEXT NOT NULL UNIQUE,
    task_id            INTEGER NOT NULL REFERENCES tasks(id),
    claude_session_id  TEXT,
    working_directory  TEXT NOT NULL,
    model              TEXT NOT NULL,
    status             TEXT NOT NULL DEFAULT 'created',
    turn_count         INTEGER NOT NULL DEFAULT 0,
    stdout_path        TEXT NOT NULL,
    stderr_path        TEXT NOT NULL,
    pid                INTEGER,
    exit_code          INTEGER,
    created_at         TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    started_at         TEXT,
    completed_at       TEXT,
    last_heartbeat     TEXT,
    artifacts          TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS comments (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid        TEXT NOT NULL UNIQUE,
    task_id     INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    content     TEXT NOT NULL,
    author      TEXT NOT NULL DEFAULT 'user',
    created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    updated_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);
"#,
    // 002: event log, rate-limit snapshot, projects
    r#"
CREATE TABLE IF NOT EXISTS events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid         TEXT NOT NULL UNIQUE,
    event_type   TEXT NOT NULL,
    entity_type  TEXT NOT NULL DEFAULT 'system',
    entity_id    TEXT,
    payload      TEXT NOT NULL DEFAULT '{}',
    created_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE TABLE IF NOT EXISTS rate_limits (
    id              INTEGER PRIMARY KEY CHECK (id = 1),
    tier            TEXT,
    messages_used   INTEGER NOT NULL DEFAULT 0,
    messages_limit  INTEGER NOT NULL DEFAULT 0,
    percent_used    REAL NOT NULL DEFAULT 0.0,
    is_limited      INTEGER NOT NULL DEFAULT 0,
    reset_at        TEXT,
    raw_output      TEXT,
    updated_at      TEXT
);

CREATE TABLE IF NOT EXISTS projects (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid               TEXT NOT NULL UNIQUE,
    name               TEXT NOT NULL UNIQUE,
    working_directory  TEXT NOT NULL,
    git_repo           TEXT NOT NULL DEFAULT '',
    default_branch     TEXT NOT NULL DEFAULT 'main',
    created_at         TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    updated_at         TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);
"#,
    // 003: indexes
    r#"
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_position ON tasks(position, priority);
CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_task_id);
CREATE INDEX IF NOT EXISTS idx_sessions_task ON sessions(task_id, status);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);
CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at);
CREATE INDEX IF NOT EXISTS idx_comments_task ON comments(task_id);
"#,
];
