//! Task scheduler — the state machine over the store.
//!
//! Phases are invoked by the heartbeat: dedupe + assess on odd beats,
//! execute on even beats, worktree GC every tenth. Session terminations
//! re-enter through `on_session_terminated`. Every per-task action is
//! isolated; one task's failure never stops the batch.

use anyhow::Context;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::agent::{self, AgentRunner, SessionExit, SpawnSpec};
use crate::assess::{AssessmentInput, Assessor};
use crate::config::Config;
use crate::events::EventBus;
use crate::rate_limit::RateLimitProbe;
use crate::store::models::{
    Session, SessionPatch, SessionStatus, Task, TaskCreate, TaskPatch, TaskStatus,
};
use crate::store::Store;
use crate::vcs::{branch_name, Vcs};

/// Tasks classified per assess phase.
const ASSESS_BATCH_SIZE: usize = 10;

pub struct Scheduler {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    vcs: Arc<dyn Vcs>,
    agent: Arc<dyn AgentRunner>,
    assessor: Arc<dyn Assessor>,
    probe: Arc<RateLimitProbe>,
    config: Config,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        vcs: Arc<dyn Vcs>,
        agent: Arc<dyn AgentRunner>,
        assessor: Arc<dyn Assessor>,
        probe: Arc<RateLimitProbe>,
        config: Config,
    ) -> Self {
        Self {
            store,
            bus,
            vcs,
            agent,
            assessor,
            probe,
            config,
        }
    }

    // --- Dedupe ---

    /// Collapse exact duplicates among pending tasks. Returns the number
    /// removed.
    pub async fn dedupe_tasks(&self) -> anyhow::Result<usize> {
        let removed = self.store.dedupe_pending().await?;
        for dup in &removed {
            tracing::info!(
                removed = dup.removed_id,
                kept = dup.kept_id,
                "removed duplicate pending task"
            );
            self.bus
                .emit(
                    "task.deduped",
                    "task",
                    Some(&dup.removed_uuid),
                    json!({"task_id": dup.removed_id, "kept_task_id": dup.kept_id}),
                )
                .await?;
        }
        Ok(removed.len())
    }

    // --- Assess phase ---

    /// Classify up to `ASSESS_BATCH_SIZE` unassessed pending tasks.
    /// Returns the number assessed.
    pub async fn assess_batch(&self) -> anyhow::Result<usize> {
        let tasks = self.store.next_pending_unassessed(ASSESS_BATCH_SIZE).await?;
        if tasks.is_empty() {
            tracing::debug!("no unassessed tasks");
            return Ok(0);
        }

        tracing::info!(count = tasks.len(), "assessing batch");
        let mut assessed = 0;
        for task in tasks {
            match self.assess_one(&task).await {
                Ok(()) => assessed += 1,
                Err(e) => {
                    tracing::warn!(task_id = task.id, ?e, "assessment failed");
                    if let Err(e) = self.assess_failed(&task, &e.to_string()).await {
                        tracing::error!(task_id = task.id, ?e, "failed to record assess failure");
                    }
                }
            }
        }
        Ok(assessed)
    }

    async fn assess_one(&self, task: &Task) -> anyhow::Result<()> {
        self.store
            .update_task(task.id, TaskPatch::status(TaskStatus::Assessing))
            .await?;

        let parent_title = match task.parent_task_id {
            Some(pid) => self.store.get_task(pid).await?.map(|p| p.title),
            None => None,
        };

        let result = self
            .assessor
            .assess(&AssessmentInput {
                title: task.title.clone(),
                description: task.description.clone(),
                parent_title,
            })
            .await?;

        let assessment = json!({
            "reasoning": result.reasoning,
            "subtasks": result.subtasks,
            "should_decompose": result.should_decompose,
        });
        self.store
            .update_task(
                task.id,
                TaskPatch {
                    complexity: Some(result.complexity.clone()),
                    recommended_model: Some(result.recommended_model.clone()),
                    metadata: Some(obj(json!({"assessment": assessment}))),
                    ..Default::default()
                },
            )
            .await?;

        self.bus
            .emit(
                "task.assessed",
                "task",
                Some(&task.uuid),
                json!({
                    "task_id": task.id,
                    "complexity": result.complexity,
                    "recommended_model": result.recommended_model,
                }),
            )
            .await?;

        if let Some(comment) = &result.comment {
            self.store
                .create_comment(task.id, comment, "system")
                .await?;
            self.bus
                .emit(
                    "comment.created",
                    "task",
                    Some(&task.uuid),
                    json!({"task_id": task.id, "author": "system"}),
                )
                .await?;
        }

        // Decompose only for clearly independent multi-session work, or
        // when the user flagged the task for it.
        let force = task.meta().decompose_on_heartbeat;
        if (result.should_decompose || force) && !result.subtasks.is_empty() {
            self.decompose_task(task, &result.subtasks).await?;
        } else {
            self.store
                .update_task(task.id, TaskPatch::status(TaskStatus::Pending))
                .await?;
        }

        tracing::info!(
            task_id = task.id,
            complexity = %result.complexity,
            model = %result.recommended_model,
            "task assessed"
        );
        Ok(())
    }

    async fn assess_failed(&self, task: &Task, error: &str) -> anyhow::Result<()> {
        let retry_count = task.meta().retry_count + 1;
        if retry_count > self.config.max_task_retries {
            self.store
                .update_task(
                    task.id,
                    TaskPatch {
                        status: Some(TaskStatus::Failed),
                        completed_at: Some(Some(Utc::now())),
                        metadata: Some(obj(json!({
                            "retry_count": retry_count,
                            "error": format!("assessment failed after {} attempts: {error}",
                                             retry_count),
                        }))),
                        ..Default::default()
                    },
                )
                .await?;
            self.bus
                .emit(
                    "task.failed",
                    "task",
                    Some(&task.uuid),
                    json!({"task_id": task.id, "error": error}),
                )
                .await?;
        } else {
            self.store
                .update_task(
                    task.id,
                    TaskPatch {
                        status: Some(TaskStatus::Pending),
                        metadata: Some(obj(json!({
                            "retry_count": retry_count,
                            "error": error,
                        }))),
                        ..Default::default()
                    },
                )
                .await?;
            self.bus
                .emit(
                    "task.assess_failed",
                    "task",
                    Some(&task.uuid),
                    json!({"task_id": task.id, "error": error, "retry_count": retry_count}),
                )
                .await?;
        }
        Ok(())
    }

    async fn decompose_task(&self, parent: &Task, subtasks: &[String]) -> anyhow::Result<()> {
        // Children go to the front of the queue, strictly ordered.
        let all = self.store.list_tasks(None).await?;
        let min_position = all.iter().map(|t| t.position).min().unwrap_or(1);

        let mut child_ids = Vec::new();
        for (i, title) in subtasks.iter().enumerate() {
            let child = self
                .store
                .create_task(TaskCreate {
                    title: title.clone(),
                    description: format!("Subtask of: {}", parent.title),
                    priority: parent.priority,
                    parent_task_id: Some(parent.id),
                    project_id: parent.project_id,
                    metadata: obj(json!({"active": true})),
                })
                .await?;
            self.store
                .update_task(
                    child.id,
                    TaskPatch {
                        position: Some(min_position - subtasks.len() as i64 + i as i64),
                        ..Default::default()
                    },
                )
                .await?;
            self.bus
                .emit(
                    "task.created",
                    "task",
                    Some(&child.uuid),
                    json!({"task_id": child.id, "title": child.title, "parent_task_id": parent.id}),
                )
                .await?;
            child_ids.push(child.id);
        }

        self.store
            .update_task(
                parent.id,
                TaskPatch {
                    status: Some(TaskStatus::Decomposed),
                    metadata: Some(obj(json!({
                        "decompose_on_heartbeat": null,
                        "decomposed_into": child_ids,
                    }))),
                    ..Default::default()
                },
            )
            .await?;
        self.bus
            .emit(
                "task.decomposed",
                "task",
                Some(&parent.uuid),
                json!({"task_id": parent.id, "subtask_ids": child_ids}),
            )
            .await?;

        tracing::info!(
            task_id = parent.id,
            children = child_ids.len(),
            "task decomposed"
        );
        Ok(())
    }

    // --- Execute phase ---

    /// Reconcile executing tasks, then fill free execution slots in queue
    /// order. Returns the number of tasks acted on.
    pub async fn execute_next_tasks(&self, max_concurrent: usize) -> anyhow::Result<usize> {
        self.reconcile_executing().await?;

        let running = self.store.count_running_sessions().await?;
        let slots = max_concurrent.saturating_sub(running);
        if slots == 0 {
            tracing::debug!(running, "all execution slots occupied");
            return Ok(0);
        }

        let tasks = self.store.next_executable(slots).await?;
        if tasks.is_empty() {
            tracing::debug!("no executable tasks");
            return Ok(0);
        }

        let mut acted = 0;
        for task in tasks {
            match self.execute_one(&task).await {
                Ok(()) => acted += 1,
                Err(e) => {
                    tracing::warn!(task_id = task.id, ?e, "execution launch failed");
                    if let Err(e) = self.fail_with_retry(task.id, &e.to_string()).await {
                        tracing::error!(task_id = task.id, ?e, "failed to requeue task");
                    }
                }
            }
        }
        Ok(acted)
    }

    /// Catch tasks whose sessions died without a termination callback
    /// (process crash, harness restart).
    async fn reconcile_executing(&self) -> anyhow::Result<()> {
        let executing = self.store.list_tasks(Some(TaskStatus::Executing)).await?;
        if executing.is_empty() {
            return Ok(());
        }

        let supervised: std::collections::HashSet<i64> = self
            .agent
            .list_running()
            .await
            .into_iter()
            .map(|r| r.session_id)
            .collect();

        for task in executing {
            let verdict = match task.active_session_id {
                None => Some("executing task has no active session".to_string()),
                Some(sid) => match self.store.get_session(sid).await? {
                    None => Some(format!("session {sid} not found")),
                    Some(session) if session.status.is_live() && !supervised.contains(&sid) => {
                        // Orphaned: the process is not under supervision
                        // (crashed harness, killed child).
                        self.store
                            .update_session(
                                sid,
                                SessionPatch {
                                    status: Some(SessionStatus::Failed),
                                    completed_at: Some(Utc::now()),
                                    ..Default::default()
                                },
                            )
                            .await?;
                        Some(format!("session {sid} has no supervised process"))
                    }
                    Some(session) if session.status == SessionStatus::Failed => {
                        Some(format!(
                            "session {sid} failed with exit code {}",
                            session.exit_code.unwrap_or(-1)
                        ))
                    }
                    Some(session) if session.status == SessionStatus::Completed => {
                        // Termination callback was lost (restart between
                        // exit and finalize) — finish now.
                        tracing::warn!(task_id = task.id, sid, "reaping finished session");
                        if let Err(e) = self
                            .finish_task(&task, &session, session.exit_code.unwrap_or(0))
                            .await
                        {
                            tracing::error!(task_id = task.id, ?e, "late finalize failed");
                        }
                        None
                    }
                    Some(session) if session.status == SessionStatus::Cancelled => {
                        self.store
                            .update_task(
                                task.id,
                                TaskPatch {
                                    status: Some(TaskStatus::Cancelled),
                                    active_session_id: Some(None),
                                    completed_at: Some(Some(Utc::now())),
                                    ..Default::default()
                                },
                            )
                            .await?;
                        self.bus
                            .emit(
                                "task.cancelled",
                                "task",
                                Some(&task.uuid),
                                json!({"task_id": task.id}),
                            )
                            .await?;
                        None
                    }
                    _ => None,
                },
            };

            if let Some(reason) = verdict {
                tracing::warn!(task_id = task.id, %reason, "reconciling executing task");
                if let Err(e) = self.fail_with_retry(task.id, &reason).await {
                    tracing::error!(task_id = task.id, ?e, "failed to reconcile task");
                }
            }
        }
        Ok(())
    }

    async fn execute_one(&self, task: &Task) -> anyhow::Result<()> {
        let project = match task.project_id {
            Some(pid) => self.store.get_project(pid).await?,
            None => None,
        };

        // (i) Worktree, when the project has a git origin.
        let mut branch = None;
        let mut worktree = None;
        let working_dir = match &project {
            Some(p) if !p.git_repo.is_empty() => {
                let repo_dir = PathBuf::from(&p.working_directory);
                let name = branch_name(task.id, &task.title);
                let path = self
                    .vcs
                    .create_worktree(&repo_dir, &name, &p.default_branch)
                    .await
                    .with_context(|| format!("creating worktree for task {}", task.id))?;
                self.store
                    .merge_metadata(
                        task.id,
                        obj(json!({
                            "branch": name,
                            "worktree_path": path.to_string_lossy(),
                            "repo_dir": p.working_directory,
                        })),
                    )
                    .await?;
                branch = Some(name);
                worktree = Some(path.clone());
                path
            }
            Some(p) => PathBuf::from(&p.working_directory),
            None => dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
        };

        // (ii) Session row with log paths decided up front.
        let session_uuid = Uuid::new_v4().to_string();
        let session_dir = self.config.session_dir(&session_uuid);
        let stdout_path = session_dir.join("stdout.log");
        let stderr_path = session_dir.join("stderr.log");
        let model = task
            .recommended_model
            .clone()
            .unwrap_or_else(|| "sonnet".to_string());

        std::fs::create_dir_all(&session_dir)?;
        let session = self
            .store
            .create_session(
                task.id,
                &working_dir.to_string_lossy(),
                &model,
                &stdout_path.to_string_lossy(),
                &stderr_path.to_string_lossy(),
                &session_uuid,
            )
            .await?;

        let launch = async {
            // (iii) Session row exists before the status flips, so an
            // executing task always has a live session to point at.
            self.store
                .update_task(
                    task.id,
                    TaskPatch {
                        status: Some(TaskStatus::Executing),
                        active_session_id: Some(Some(session.id)),
                        started_at: Some(Some(Utc::now())),
                        ..Default::default()
                    },
                )
                .await?;
            self.bus
                .emit(
                    "task.executing",
                    "task",
                    Some(&task.uuid),
                    json!({"task_id": task.id, "session_id": session.id}),
                )
                .await?;

            // (iv) Spawn.
            let prompt = self.build_session_prompt(task).await?;
            let pid = self
                .agent
                .spawn(SpawnSpec {
                    session_id: session.id,
                    session_uuid: session_uuid.clone(),
                    working_dir: working_dir.clone(),
                    prompt,
                    model: model.clone(),
                    stdout_path,
                    stderr_path,
                })
                .await?;

            self.store
                .update_session(
                    session.id,
                    SessionPatch {
                        status: Some(SessionStatus::Running),
                        pid: Some(pid as i64),
                        started_at: Some(Utc::now()),
                        last_heartbeat: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;

            // (v) Announce.
            self.bus
                .emit(
                    "session.started",
                    "session",
                    Some(&session_uuid),
                    json!({"session_id": session.id, "task_id": task.id, "model": model}),
                )
                .await?;

            tracing::info!(task_id = task.id, session_id = session.id, "task executing");
            anyhow::Ok(())
        }
        .await;

        if let Err(e) = launch {
            // The session never ran; a live row would hold a concurrency
            // slot until someone noticed.
            if let Err(e) = self
                .store
                .update_session(
                    session.id,
                    SessionPatch {
                        status: Some(SessionStatus::Failed),
                        completed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await
            {
                tracing::warn!(task_id = task.id, ?e, "rollback session update failed");
            }
            // Roll back the worktree so a retry starts clean.
            if let (Some(branch), Some(worktree), Some(p)) = (&branch, &worktree, &project) {
                let repo_dir = PathBuf::from(&p.working_directory);
                if let Err(e) = self.vcs.remove_worktree(&repo_dir, worktree).await {
                    tracing::warn!(task_id = task.id, ?e, "rollback worktree removal failed");
                }
                if let Err(e) = self.vcs.delete_branch(&repo_dir, branch, true).await {
                    tracing::warn!(task_id = task.id, ?e, "rollback branch delete failed");
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Prompt for the agent: task text, prior comments, and the standing
    /// rules (the harness owns git; finish with testing instructions).
    async fn build_session_prompt(&self, task: &Task) -> anyhow::Result<String> {
        let mut parts = vec![task.title.clone(), task.description.clone()];

        let comments = self.store.list_comments(task.id).await?;
        if !comments.is_empty() {
            parts.push("---\n## Comment history".to_string());
            for c in &comments {
                parts.push(format!("[{}]: {}", c.author, c.content));
            }
            parts.push(
                "\nThis task was previously attempted. A reviewer sent it back. \
                 Address the feedback in the comments above, then continue."
                    .to_string(),
            );
        }

        parts.push(
            "---\n## Git rules\n\
             You are already on a dedicated branch in an isolated worktree. \
             Do NOT run git checkout, git branch, git commit, git push, \
             gh pr create, or any other git/gh commands. The harness that \
             launched you handles all git operations after your session ends. \
             Just write code, edit files, and run tests."
                .to_string(),
        );
        parts.push(
            "---\nIMPORTANT: When you finish, end your response with a section \
             titled '## How to test' that explains step-by-step how to verify \
             your changes work. A human will review before marking this task \
             complete."
                .to_string(),
        );

        Ok(parts.join("\n\n"))
    }

    // --- Session termination ---

    /// Finalize a session whose process exited. Invoked from the agent
    /// adapter's exit channel; interleaves freely with the heartbeat.
    pub async fn on_session_terminated(&self, exit: SessionExit) -> anyhow::Result<()> {
        let Some(session) = self.store.get_session(exit.session_id).await? else {
            tracing::warn!(session_id = exit.session_id, "terminated session not found");
            return Ok(());
        };

        if exit.rate_limited {
            self.probe.mark_limited(None).await;
            self.bus
                .emit(
                    "session.rate_limited",
                    "session",
                    Some(&session.uuid),
                    json!({"session_id": session.id}),
                )
                .await?;
        }

        // A cancel already finalized the session and task.
        if session.status == SessionStatus::Cancelled {
            self.store
                .update_session(
                    session.id,
                    SessionPatch {
                        exit_code: Some(exit.exit_code),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        }

        let succeeded = exit.exit_code == 0;
        let status = if succeeded {
            SessionStatus::Completed
        } else {
            SessionStatus::Failed
        };
        self.store
            .update_session(
                session.id,
                SessionPatch {
                    status: Some(status),
                    exit_code: Some(exit.exit_code),
                    turn_count: (exit.turn_count > 0).then_some(exit.turn_count),
                    claude_session_id: exit.claude_session_id.clone(),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        self.bus
            .emit(
                if succeeded {
                    "session.completed"
                } else {
                    "session.failed"
                },
                "session",
                Some(&session.uuid),
                json!({
                    "session_id": session.id,
                    "exit_code": exit.exit_code,
                    "turn_count": exit.turn_count,
                }),
            )
            .await?;

        let Some(task) = self.store.get_task(session.task_id).await? else {
            return Ok(());
        };
        if task.status != TaskStatus::Executing {
            tracing::debug!(
                task_id = task.id,
                status = task.status.as_str(),
                "session ended for non-executing task"
            );
            return Ok(());
        }

        if succeeded {
            self.finish_task(&task, &session, exit.exit_code).await
        } else {
            self.fail_with_retry(task.id, &format!("agent exited with code {}", exit.exit_code))
                .await
        }
    }

    /// Successful session: commit, push, open a PR, hand the task to review.
    async fn finish_task(
        &self,
        task: &Task,
        session: &Session,
        exit_code: i64,
    ) -> anyhow::Result<()> {
        let meta = task.meta();
        let mut review_comment = build_review_comment(Path::new(&session.stdout_path), exit_code);

        if let (Some(branch), Some(worktree_path)) = (&meta.branch, &meta.worktree_path) {
            let worktree = PathBuf::from(worktree_path);
            let repo_dir = self.repo_dir_for(task).await;

            let pushed = self
                .vcs
                .commit_and_push(
                    &worktree,
                    branch,
                    &format!("Task #{}: {}", task.id, task.title),
                )
                .await
                .context("commit and push failed")?;

            match pushed {
                Some(_sha) => {
                    // No PR means nothing for a human to review.
                    let pr_url = match self
                        .vcs
                        .create_pr(&worktree, branch, &task.title, &review_comment)
                        .await
                    {
                        Ok(url) => url,
                        Err(e) => {
                            self.remove_worktree_best_effort(&repo_dir, &worktree).await;
                            self.fail_permanently(task, &format!("PR creation failed: {e}"))
                                .await?;
                            return Ok(());
                        }
                    };
                    self.store
                        .merge_metadata(task.id, obj(json!({"pr_url": pr_url})))
                        .await?;
                    review_comment.push_str(&format!("\n\n**Pull Request:** {pr_url}"));
                }
                None => {
                    review_comment.push_str("\n\n*No file changes were produced.*");
                }
            }

            // Code is on the remote branch now; the worktree is disposable.
            self.remove_worktree_best_effort(&repo_dir, &worktree).await;
        }

        self.store
            .update_task(
                task.id,
                TaskPatch {
                    status: Some(TaskStatus::ReadyForReview),
                    active_session_id: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        self.store
            .create_comment(task.id, &review_comment, "system")
            .await?;
        self.bus
            .emit(
                "task.ready_for_review",
                "task",
                Some(&task.uuid),
                json!({"task_id": task.id, "exit_code": exit_code}),
            )
            .await?;
        tracing::info!(task_id = task.id, "task ready for review");

        if let Some(parent_id) = task.parent_task_id {
            self.roll_up_parent(parent_id).await?;
        }
        Ok(())
    }

    /// Transient failure: clean up, bump the retry counter, and requeue —
    /// or fail permanently once the budget is spent.
    pub async fn fail_with_retry(&self, task_id: i64, error: &str) -> anyhow::Result<()> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(());
        };

        // A session row left live by a failed launch or a lost callback
        // would hold a concurrency slot forever.
        if let Some(session_id) = task.active_session_id {
            if let Some(session) = self.store.get_session(session_id).await? {
                if session.status.is_live() {
                    self.store
                        .update_session(
                            session_id,
                            SessionPatch {
                                status: Some(SessionStatus::Failed),
                                completed_at: Some(Utc::now()),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
            }
        }

        self.cleanup_task_worktree(&task).await;

        let retry_count = task.meta().retry_count + 1;
        if retry_count > self.config.max_task_retries {
            self.fail_permanently(&task, error).await?;
            return Ok(());
        }

        self.store
            .update_task(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::Pending),
                    active_session_id: Some(None),
                    started_at: Some(None),
                    completed_at: Some(None),
                    metadata: Some(obj(json!({
                        "error": error,
                        "retry_count": retry_count,
                        "last_failure": Utc::now().to_rfc3339(),
                        "branch": null,
                        "worktree_path": null,
                        "repo_dir": null,
                    }))),
                    ..Default::default()
                },
            )
            .await?;
        self.bus
            .emit(
                "task.requeued",
                "task",
                Some(&task.uuid),
                json!({"task_id": task_id, "error": error, "retry_count": retry_count}),
            )
            .await?;
        tracing::warn!(task_id, retry_count, %error, "task failed, requeued");

        if let Some(parent_id) = task.parent_task_id {
            self.roll_up_parent(parent_id).await?;
        }
        Ok(())
    }

    async fn fail_permanently(&self, task: &Task, error: &str) -> anyhow::Result<()> {
        self.store
            .update_task(
                task.id,
                TaskPatch {
                    status: Some(TaskStatus::Failed),
                    active_session_id: Some(None),
                    completed_at: Some(Some(Utc::now())),
                    metadata: Some(obj(json!({"error": error}))),
                    ..Default::default()
                },
            )
            .await?;
        self.bus
            .emit(
                "task.failed",
                "task",
                Some(&task.uuid),
                json!({"task_id": task.id, "error": error}),
            )
            .await?;
        tracing::error!(task_id = task.id, %error, "task failed permanently");

        if let Some(parent_id) = task.parent_task_id {
            self.roll_up_parent(parent_id).await?;
        }
        Ok(())
    }

    /// When every child of a decomposed parent is terminal, settle the
    /// parent: failed beats in-review beats completed.
    async fn roll_up_parent(&self, parent_id: i64) -> anyhow::Result<()> {
        let Some(parent) = self.store.get_task(parent_id).await? else {
            return Ok(());
        };
        if parent.status != TaskStatus::Decomposed {
            return Ok(());
        }

        let children = self.store.subtasks(parent_id).await?;
        if children.is_empty() {
            return Ok(());
        }
        let settled = children.iter().all(|c| {
            c.status.is_terminal() || c.status == TaskStatus::ReadyForReview
        });
        if !settled {
            return Ok(());
        }

        let any_failed = children.iter().any(|c| c.status == TaskStatus::Failed);
        let any_reviewing = children
            .iter()
            .any(|c| c.status == TaskStatus::ReadyForReview);
        let new_status = if any_failed {
            TaskStatus::Failed
        } else if any_reviewing {
            TaskStatus::ReadyForReview
        } else {
            TaskStatus::Completed
        };

        self.store
            .update_task(
                parent_id,
                TaskPatch {
                    status: Some(new_status),
                    completed_at: new_status
                        .is_terminal()
                        .then_some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await?;
        self.bus
            .emit(
                &format!("task.{}", new_status.as_str()),
                "task",
                Some(&parent.uuid),
                json!({"task_id": parent_id, "rolled_up": true}),
            )
            .await?;
        tracing::info!(
            task_id = parent_id,
            status = new_status.as_str(),
            "decomposed parent settled"
        );
        Ok(())
    }

    // --- Cancel ---

    /// Cancel a task and its active session. Idempotent: cancelling a
    /// terminal task leaves it unchanged.
    pub async fn cancel_task(&self, task_id: i64) -> anyhow::Result<bool> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(false);
        };
        if task.status.is_terminal() {
            return Ok(true);
        }

        if let Some(session_id) = task.active_session_id {
            self.store
                .update_session(
                    session_id,
                    SessionPatch {
                        status: Some(SessionStatus::Cancelled),
                        completed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;
            if let Err(e) = self.agent.cancel(session_id).await {
                tracing::warn!(session_id, ?e, "agent cancel failed");
            }
            if let Some(session) = self.store.get_session(session_id).await? {
                self.bus
                    .emit(
                        "session.cancelled",
                        "session",
                        Some(&session.uuid),
                        json!({"session_id": session_id}),
                    )
                    .await?;
            }
        }

        self.cleanup_task_worktree(&task).await;

        self.store
            .update_task(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::Cancelled),
                    active_session_id: Some(None),
                    completed_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await?;
        self.bus
            .emit(
                "task.cancelled",
                "task",
                Some(&task.uuid),
                json!({"task_id": task_id}),
            )
            .await?;
        tracing::info!(task_id, "task cancelled");
        Ok(true)
    }

    // --- Worktree GC ---

    /// Remove worktrees whose branch no longer belongs to a live task.
    /// Failures are warnings; this never propagates an error.
    pub async fn cleanup_stale_worktrees(&self) -> anyhow::Result<()> {
        let projects = self.store.list_projects().await?;
        let git_projects: Vec<_> = projects.iter().filter(|p| !p.git_repo.is_empty()).collect();
        if git_projects.is_empty() {
            return Ok(());
        }

        // Branches of tasks that may still need their checkout.
        let mut active_branches = std::collections::HashSet::new();
        for status in [
            TaskStatus::Pending,
            TaskStatus::Assessing,
            TaskStatus::Executing,
        ] {
            for task in self.store.list_tasks(Some(status)).await? {
                if let Some(branch) = task.meta().branch {
                    active_branches.insert(branch);
                }
            }
        }

        for project in git_projects {
            let repo_dir = PathBuf::from(&project.working_directory);
            if !repo_dir.exists() {
                continue;
            }
            let worktrees = match self.vcs.list_worktrees(&repo_dir).await {
                Ok(w) => w,
                Err(e) => {
                    tracing::warn!(project = %project.name, ?e, "listing worktrees failed");
                    continue;
                }
            };
            for wt in worktrees {
                // Never touch the main checkout; only our worktree root is
                // in scope.
                if !wt.path.starts_with(&self.config.worktrees_dir) {
                    continue;
                }
                let stale = match &wt.branch {
                    Some(branch) => !active_branches.contains(branch),
                    None => true,
                };
                if stale {
                    tracing::info!(
                        worktree = %wt.path.display(),
                        branch = wt.branch.as_deref().unwrap_or("(detached)"),
                        "removing stale worktree"
                    );
                    if let Err(e) = self.vcs.remove_worktree(&repo_dir, &wt.path).await {
                        tracing::warn!(worktree = %wt.path.display(), ?e, "GC removal failed");
                    }
                }
            }
        }
        Ok(())
    }

    // --- Helpers ---

    async fn repo_dir_for(&self, task: &Task) -> PathBuf {
        if let Some(repo_dir) = task
            .metadata
            .get("repo_dir")
            .and_then(Value::as_str)
        {
            return PathBuf::from(repo_dir);
        }
        if let Some(pid) = task.project_id {
            if let Ok(Some(project)) = self.store.get_project(pid).await {
                return PathBuf::from(project.working_directory);
            }
        }
        PathBuf::from(".")
    }

    async fn cleanup_task_worktree(&self, task: &Task) {
        let meta = task.meta();
        let Some(worktree_path) = &meta.worktree_path else {
            return;
        };
        let repo_dir = self.repo_dir_for(task).await;
        let worktree = PathBuf::from(worktree_path);
        self.remove_worktree_best_effort(&repo_dir, &worktree).await;
        if let Some(branch) = &meta.branch {
            if let Err(e) = self.vcs.delete_branch(&repo_dir, branch, true).await {
                tracing::warn!(task_id = task.id, ?e, "branch cleanup failed");
            }
        }
    }

    async fn remove_worktree_best_effort(&self, repo_dir: &Path, worktree: &Path) {
        if let Err(e) = self.vcs.remove_worktree(repo_dir, worktree).await {
            tracing::warn!(worktree = %worktree.display(), ?e, "worktree removal failed");
        }
    }
}

/// Extract testing instructions from the captured session log, falling
/// back to the tail of the assistant's output.
pub fn build_review_comment(stdout_path: &Path, exit_code: i64) -> String {
    let Ok(raw) = std::fs::read_to_string(stdout_path) else {
        return format!("Session finished (exit code {exit_code}). Session log not found.");
    };
    let text = agent::extract_session_text(&raw);
    if text.trim().is_empty() {
        return format!("Session finished (exit code {exit_code}). No readable output found.");
    }

    // Look for a "How to test" heading and keep everything from there.
    for (offset, line) in text.lines().scan(0usize, |pos, line| {
        let start = *pos;
        *pos += line.len() + 1;
        Some((start, line))
    }) {
        let trimmed = line.trim_start_matches('#').trim().to_lowercase();
        if line.starts_with('#') && trimmed.starts_with("how to test") {
            let section = text[offset..].trim();
            return clip(section, 1500);
        }
    }

    // No section — take the tail.
    let lines: Vec<&str> = text.trim().lines().collect();
    let start = lines.len().saturating_sub(40);
    let tail = lines[start..].join("\n");
    format!(
        "Session finished (exit code {exit_code}). No 'How to test' section found. Last output:\n\n{}",
        clip(&tail, 1500)
    )
}

fn clip(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let clipped: String = s.chars().take(max).collect();
        format!("{clipped}...")
    }
}

fn obj(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
