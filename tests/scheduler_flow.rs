//! End-to-end scheduler scenarios against an in-memory store and fake
//! adapters. The fakes record every call so tests can assert on ordering,
//! rollback, and cleanup without touching git or a real agent CLI.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use agent_queue::agent::{AgentRunner, RunningSession, SessionExit, SpawnSpec};
use agent_queue::assess::{Assessment, AssessmentInput, Assessor};
use agent_queue::config::Config;
use agent_queue::engine::heartbeat::Heartbeat;
use agent_queue::engine::scheduler::Scheduler;
use agent_queue::events::EventBus;
use agent_queue::rate_limit::RateLimitProbe;
use agent_queue::store::models::{
    ProjectCreate, SessionStatus, TaskCreate, TaskStatus,
};
use agent_queue::store::Store;
use agent_queue::vcs::{Vcs, WorktreeInfo};

// --- Fakes ---

struct FakeVcs {
    root: PathBuf,
    worktrees: Mutex<HashMap<String, PathBuf>>,
    removed: Mutex<Vec<PathBuf>>,
    pushed: Mutex<Vec<String>>,
    prs: Mutex<Vec<String>>,
    fail_create: AtomicBool,
    fail_pr: AtomicBool,
}

impl FakeVcs {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            worktrees: Mutex::new(HashMap::new()),
            removed: Mutex::new(Vec::new()),
            pushed: Mutex::new(Vec::new()),
            prs: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
            fail_pr: AtomicBool::new(false),
        }
    }

    async fn live_branches(&self) -> HashSet<String> {
        self.worktrees.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl Vcs for FakeVcs {
    async fn create_worktree(
        &self,
        _repo_dir: &Path,
        branch: &str,
        _base: &str,
    ) -> anyhow::Result<PathBuf> {
        if self.fail_create.load(Ordering::SeqCst) {
            anyhow::bail!("simulated worktree failure");
        }
        let path = self.root.join(branch);
        std::fs::create_dir_all(&path)?;
        self.worktrees
            .lock()
            .await
            .insert(branch.to_string(), path.clone());
        Ok(path)
    }

    async fn commit_and_push(
        &self,
        _worktree: &Path,
        branch: &str,
        _message: &str,
    ) -> anyhow::Result<Option<String>> {
        self.pushed.lock().await.push(branch.to_string());
        Ok(Some("abc123".to_string()))
    }

    async fn create_pr(
        &self,
        _worktree: &Path,
        branch: &str,
        _title: &str,
        _body: &str,
    ) -> anyhow::Result<String> {
        if self.fail_pr.load(Ordering::SeqCst) {
            anyhow::bail!("simulated PR failure");
        }
        let url = format!("https://example.com/pr/{branch}");
        self.prs.lock().await.push(url.clone());
        Ok(url)
    }

    async fn remove_worktree(&self, _repo_dir: &Path, worktree: &Path) -> anyhow::Result<()> {
        let mut worktrees = self.worktrees.lock().await;
        worktrees.retain(|_, path| path != worktree);
        self.removed.lock().await.push(worktree.to_path_buf());
        Ok(())
    }

    async fn delete_branch(
        &self,
        _repo_dir: &Path,
        _branch: &str,
        _local_only: bool,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn list_worktrees(&self, repo_dir: &Path) -> anyhow::Result<Vec<WorktreeInfo>> {
        let mut out = vec![WorktreeInfo {
            path: repo_dir.to_path_buf(),
            branch: Some("main".to_string()),
            head: Some("abc".to_string()),
        }];
        for (branch, path) in self.worktrees.lock().await.iter() {
            out.push(WorktreeInfo {
                path: path.clone(),
                branch: Some(branch.clone()),
                head: Some("def".to_string()),
            });
        }
        Ok(out)
    }
}

#[derive(Default)]
struct FakeAgent {
    spawned: Mutex<Vec<SpawnSpec>>,
    running: Mutex<HashMap<i64, u32>>,
    cancelled: Mutex<Vec<i64>>,
    fail_spawn: AtomicBool,
}

impl FakeAgent {
    async fn spawn_count(&self) -> usize {
        self.spawned.lock().await.len()
    }

    /// Simulate process exit: drop supervision so reconciliation and
    /// termination behave like the real adapter.
    async fn finish(&self, session_id: i64) {
        self.running.lock().await.remove(&session_id);
    }
}

#[async_trait]
impl AgentRunner for FakeAgent {
    async fn spawn(&self, spec: SpawnSpec) -> anyhow::Result<u32> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            anyhow::bail!("simulated spawn failure");
        }
        let pid = 1000 + spec.session_id as u32;
        self.running.lock().await.insert(spec.session_id, pid);
        self.spawned.lock().await.push(spec);
        Ok(pid)
    }

    async fn cancel(&self, session_id: i64) -> anyhow::Result<()> {
        self.running.lock().await.remove(&session_id);
        self.cancelled.lock().await.push(session_id);
        Ok(())
    }

    async fn list_running(&self) -> Vec<RunningSession> {
        self.running
            .lock()
            .await
            .iter()
            .map(|(&session_id, &pid)| RunningSession { session_id, pid })
            .collect()
    }
}

struct FakeAssessor {
    by_title: Mutex<HashMap<String, Assessment>>,
    fail_all: AtomicBool,
}

impl FakeAssessor {
    fn new() -> Self {
        Self {
            by_title: Mutex::new(HashMap::new()),
            fail_all: AtomicBool::new(false),
        }
    }

    async fn script(&self, title: &str, assessment: Assessment) {
        self.by_title
            .lock()
            .await
            .insert(title.to_string(), assessment);
    }
}

fn simple_assessment() -> Assessment {
    Assessment {
        complexity: "simple".to_string(),
        recommended_model: "sonnet".to_string(),
        should_decompose: false,
        subtasks: vec![],
        reasoning: "small change".to_string(),
        comment: None,
    }
}

#[async_trait]
impl Assessor for FakeAssessor {
    async fn assess(&self, input: &AssessmentInput) -> anyhow::Result<Assessment> {
        if self.fail_all.load(Ordering::SeqCst) {
            anyhow::bail!("simulated assessment failure");
        }
        Ok(self
            .by_title
            .lock()
            .await
            .get(&input.title)
            .cloned()
            .unwrap_or_else(simple_assessment))
    }
}

// --- Harness ---

struct Harness {
    store: Arc<Store>,
    scheduler: Arc<Scheduler>,
    heartbeat: Arc<Heartbeat>,
    vcs: Arc<FakeVcs>,
    agent: Arc<FakeAgent>,
    assessor: Arc<FakeAssessor>,
    tmp: tempfile::TempDir,
}

impl Harness {
    fn new(max_concurrent: usize) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: tmp.path().join("data"),
            worktrees_dir: tmp.path().join("worktrees"),
            heartbeat_interval_secs: 60,
            max_concurrent_tasks: max_concurrent,
            max_task_retries: 3,
            assessment_model: "test-model".to_string(),
            anthropic_api_key: String::new(),
            agent_bin: "claude".to_string(),
            usage_cache_path: tmp.path().join("usage-cache.json"),
            host: "127.0.0.1".to_string(),
            port: 0,
        };

        let store = Arc::new(Store::open_memory().unwrap());
        let bus = Arc::new(EventBus::new(store.clone()));
        let vcs = Arc::new(FakeVcs::new(config.worktrees_dir.clone()));
        let agent = Arc::new(FakeAgent::default());
        let assessor = Arc::new(FakeAssessor::new());
        let probe = Arc::new(RateLimitProbe::new(
            config.usage_cache_path.clone(),
            store.clone(),
        ));

        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            bus.clone(),
            vcs.clone(),
            agent.clone(),
            assessor.clone(),
            probe.clone(),
            config.clone(),
        ));
        let heartbeat = Arc::new(Heartbeat::new(
            scheduler.clone(),
            probe,
            bus.clone(),
            config.heartbeat_interval_secs,
            max_concurrent,
        ));

        Self {
            store,
            scheduler,
            heartbeat,
            vcs,
            agent,
            assessor,
            tmp,
        }
    }

    async fn add_project(&self) -> i64 {
        let repo_dir = self.tmp.path().join("repo");
        std::fs::create_dir_all(&repo_dir).unwrap();
        self.store
            .create_project(ProjectCreate {
                name: "demo".to_string(),
                working_directory: repo_dir.to_string_lossy().to_string(),
                git_repo: "owner/demo".to_string(),
                default_branch: "main".to_string(),
            })
            .await
            .unwrap()
            .id
    }

    async fn add_task(&self, title: &str, active: bool, project_id: Option<i64>) -> i64 {
        let metadata = if active {
            json!({"active": true}).as_object().cloned().unwrap()
        } else {
            Default::default()
        };
        self.store
            .create_task(TaskCreate {
                title: title.to_string(),
                description: format!("Description for {title}"),
                priority: 0,
                parent_task_id: None,
                project_id,
                metadata,
            })
            .await
            .unwrap()
            .id
    }

    async fn task_status(&self, id: i64) -> TaskStatus {
        self.store.get_task(id).await.unwrap().unwrap().status
    }

    async fn events_of_type(&self, event_type: &str) -> usize {
        self.store
            .list_events(Some(event_type), None, 1000)
            .await
            .unwrap()
            .len()
    }

    /// Complete a task's active session with the given exit code, writing a
    /// stdout log first like the real adapter would.
    async fn finish_session(&self, task_id: i64, exit_code: i64, stdout: &str) {
        let task = self.store.get_task(task_id).await.unwrap().unwrap();
        let session_id = task.active_session_id.expect("task has active session");
        let session = self.store.get_session(session_id).await.unwrap().unwrap();

        let path = PathBuf::from(&session.stdout_path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, stdout).unwrap();

        self.agent.finish(session_id).await;
        self.scheduler
            .on_session_terminated(SessionExit {
                session_id,
                exit_code,
                turn_count: 3,
                rate_limited: false,
                claude_session_id: Some("cc-session".to_string()),
            })
            .await
            .unwrap();
    }

    fn mark_rate_limited(&self) {
        let cache = json!({
            "tier": "pro",
            "messages_used": 500,
            "messages_limit": 500,
            "is_limited": true,
            "reset_at": (chrono::Utc::now() + chrono::Duration::hours(2)).to_rfc3339(),
        });
        std::fs::write(
            self.tmp.path().join("usage-cache.json"),
            cache.to_string(),
        )
        .unwrap();
    }
}

const RESULT_LOG: &str = r#"{"type":"result","result":"Done.\n## How to test\nRun cargo test.","num_turns":3}"#;

// --- Scenario 1: happy path ---

#[tokio::test]
async fn happy_path_assess_execute_review() {
    let h = Harness::new(1);
    let project_id = h.add_project().await;
    let task_id = h.add_task("Add README", true, Some(project_id)).await;

    // Beat 1 (odd): assess.
    let diag = h.heartbeat.beat().await;
    assert_eq!(diag["phase"], "assess");
    assert_eq!(diag["tasks_assessed"], 1);
    let task = h.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.complexity.as_deref(), Some("simple"));
    assert_eq!(task.recommended_model.as_deref(), Some("sonnet"));
    assert_eq!(h.events_of_type("task.assessed").await, 1);

    // Beat 2 (even): execute.
    let diag = h.heartbeat.beat().await;
    assert_eq!(diag["phase"], "execute");
    assert_eq!(diag["tasks_launched"], 1);
    let task = h.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Executing);
    let session_id = task.active_session_id.unwrap();
    let session = h.store.get_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Running);
    assert_eq!(task.meta().branch.as_deref(), Some("task-1-add-readme"));

    let spawned = h.agent.spawned.lock().await;
    assert_eq!(spawned.len(), 1);
    assert!(spawned[0].prompt.contains("Add README"));
    assert!(spawned[0].prompt.contains("How to test"));
    drop(spawned);

    // Agent succeeds.
    h.finish_session(task_id, 0, RESULT_LOG).await;

    let task = h.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::ReadyForReview);
    assert!(task.active_session_id.is_none());
    assert!(task.meta().pr_url.is_some());
    assert_eq!(h.events_of_type("task.ready_for_review").await, 1);
    assert_eq!(h.events_of_type("session.completed").await, 1);

    // Review comment extracted from the log.
    let comments = h.store.list_comments(task_id).await.unwrap();
    assert!(comments.iter().any(|c| c.content.contains("How to test")));

    // Branch pushed, PR opened, worktree cleaned up.
    assert_eq!(h.vcs.pushed.lock().await.as_slice(), &["task-1-add-readme"]);
    assert_eq!(h.vcs.prs.lock().await.len(), 1);
    assert!(h.vcs.live_branches().await.is_empty());
    assert!(!h.vcs.removed.lock().await.is_empty());
}

// --- Scenario 2: rate-limited pause ---

#[tokio::test]
async fn rate_limited_beats_do_no_work() {
    let h = Harness::new(2);
    let task_id = h.add_task("Idle task", true, None).await;
    h.mark_rate_limited();

    for _ in 0..3 {
        h.heartbeat.beat().await;
    }

    assert_eq!(h.events_of_type("heartbeat.rate_limited").await, 3);
    assert_eq!(h.events_of_type("heartbeat.tick").await, 3);
    let task = h.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.complexity.is_none(), "no assessment while limited");
    assert_eq!(h.agent.spawn_count().await, 0);
}

// --- Scenario 3: decomposition ---

#[tokio::test]
async fn decomposition_creates_ordered_children() {
    let h = Harness::new(2);
    let task_id = h.add_task("Build the platform", true, None).await;
    h.assessor
        .script(
            "Build the platform",
            Assessment {
                complexity: "complex".to_string(),
                recommended_model: "opus".to_string(),
                should_decompose: true,
                subtasks: vec!["A".to_string(), "B".to_string(), "C".to_string()],
                reasoning: "independent pieces".to_string(),
                comment: None,
            },
        )
        .await;

    h.heartbeat.beat().await; // odd: assess + decompose

    let parent = h.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(parent.status, TaskStatus::Decomposed);
    assert_eq!(parent.meta().decomposed_into.len(), 3);

    let children = h.store.subtasks(task_id).await.unwrap();
    assert_eq!(children.len(), 3);
    let titles: Vec<&str> = children.iter().map(|c| c.title.as_str()).collect();
    assert_eq!(titles, vec!["A", "B", "C"]);
    for pair in children.windows(2) {
        assert!(pair[0].position < pair[1].position, "positions strictly ordered");
    }
    for child in &children {
        assert_eq!(child.parent_task_id, Some(task_id));
        assert_eq!(child.status, TaskStatus::Pending);
        assert!(child.complexity.is_none(), "children start unassessed");
        assert!(child.meta().active, "children are activated");
    }
}

// --- Scenario 4: crash recovery ---

#[tokio::test]
async fn crash_recovery_reconciles_and_gc_removes_worktree() {
    let h = Harness::new(2);
    let project_id = h.add_project().await;
    let task_id = h.add_task("Crashy work", true, Some(project_id)).await;

    h.heartbeat.beat().await; // assess
    h.heartbeat.beat().await; // execute
    assert_eq!(h.task_status(task_id).await, TaskStatus::Executing);

    // Simulate a crash: the process vanishes without a callback.
    let task = h.store.get_task(task_id).await.unwrap().unwrap();
    let session_id = task.active_session_id.unwrap();
    h.agent.finish(session_id).await;
    assert!(!h.vcs.live_branches().await.is_empty());

    // Next execute beat reconciles the orphan.
    h.heartbeat.beat().await; // beat 3, assess (no-op for this task)
    h.heartbeat.beat().await; // beat 4, execute → reconcile

    let task = h.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending, "failed-with-retry requeues");
    assert!(task.active_session_id.is_none());
    assert_eq!(task.meta().retry_count, 1);
    let session = h.store.get_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Failed);

    // GC leaves nothing behind for the dead branch.
    h.scheduler.cleanup_stale_worktrees().await.unwrap();
    assert!(h.vcs.live_branches().await.is_empty());
}

// --- Scenario 5: concurrency cap ---

#[tokio::test]
async fn concurrency_cap_is_respected() {
    let h = Harness::new(2);
    let project_id = h.add_project().await;
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(h.add_task(&format!("Task {i}"), true, Some(project_id)).await);
    }

    h.heartbeat.beat().await; // assess all five
    let launched = h.scheduler.execute_next_tasks(2).await.unwrap();
    assert_eq!(launched, 2);
    assert_eq!(h.store.count_running_sessions().await.unwrap(), 2);

    // Slots full: nothing new starts.
    let launched = h.scheduler.execute_next_tasks(2).await.unwrap();
    assert_eq!(launched, 0);
    assert_eq!(h.store.count_running_sessions().await.unwrap(), 2);

    // One finishes; exactly one more starts.
    h.finish_session(ids[0], 0, RESULT_LOG).await;
    let launched = h.scheduler.execute_next_tasks(2).await.unwrap();
    assert_eq!(launched, 1);
    assert_eq!(h.store.count_running_sessions().await.unwrap(), 2);
    assert_eq!(h.agent.spawn_count().await, 3);
}

// --- Scenario 6: dedupe ---

#[tokio::test]
async fn dedupe_removes_exact_duplicates() {
    let h = Harness::new(2);
    let store = &h.store;
    let first = store
        .create_task(TaskCreate {
            title: "Duplicate".to_string(),
            description: "same".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let second = store
        .create_task(TaskCreate {
            title: "Duplicate".to_string(),
            description: "same".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let bystander = store
        .create_task(TaskCreate {
            title: "Other".to_string(),
            description: "".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let bystander_position = bystander.position;

    h.heartbeat.beat().await; // odd beat runs dedupe

    assert!(store.get_task(first.id).await.unwrap().is_some(), "lower id survives");
    assert!(store.get_task(second.id).await.unwrap().is_none());
    assert_eq!(h.events_of_type("task.deduped").await, 1);
    let bystander = store.get_task(bystander.id).await.unwrap().unwrap();
    assert_eq!(bystander.position, bystander_position);
}

// --- Ordering invariant ---

#[tokio::test]
async fn execution_selects_in_queue_order() {
    let h = Harness::new(10);
    let project_id = h.add_project().await;

    let a = h.add_task("Alpha", true, Some(project_id)).await;
    let b = h.add_task("Bravo", true, Some(project_id)).await;
    let c = h.add_task("Charlie", true, Some(project_id)).await;
    // Move Charlie to the front; give Bravo a priority boost at the same
    // position as Alpha.
    let alpha_pos = h.store.get_task(a).await.unwrap().unwrap().position;
    h.store.reorder_tasks(&[(c, 0), (b, alpha_pos)]).await.unwrap();
    h.store
        .update_task(
            b,
            agent_queue::store::models::TaskPatch {
                priority: Some(10),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    h.heartbeat.beat().await; // assess
    let launched = h.scheduler.execute_next_tasks(2).await.unwrap();
    assert_eq!(launched, 2, "min(k, free_slots, N) tasks start");

    let spawned = h.agent.spawned.lock().await;
    let order: Vec<i64> = spawned
        .iter()
        .map(|s| s.session_id)
        .collect();
    assert_eq!(order.len(), 2);
    // Charlie (position 0) first, then Bravo (priority beats Alpha).
    let first_task = h
        .store
        .get_session(order[0])
        .await
        .unwrap()
        .unwrap()
        .task_id;
    let second_task = h
        .store
        .get_session(order[1])
        .await
        .unwrap()
        .unwrap()
        .task_id;
    assert_eq!(first_task, c);
    assert_eq!(second_task, b);
}

// --- Failure handling ---

#[tokio::test]
async fn failed_session_requeues_until_budget_exhausted() {
    let h = Harness::new(1);
    let project_id = h.add_project().await;
    let task_id = h.add_task("Flaky", true, Some(project_id)).await;

    h.heartbeat.beat().await; // assess

    for attempt in 1..=3 {
        h.scheduler.execute_next_tasks(1).await.unwrap();
        assert_eq!(h.task_status(task_id).await, TaskStatus::Executing);
        h.finish_session(task_id, 1, "").await;

        let task = h.store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending, "attempt {attempt} requeued");
        assert_eq!(task.meta().retry_count, attempt);
        assert!(task.meta().branch.is_none(), "worktree metadata cleared");
    }

    // Fourth failure exceeds the budget.
    h.scheduler.execute_next_tasks(1).await.unwrap();
    h.finish_session(task_id, 1, "").await;
    let task = h.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.meta().error.is_some());
    assert!(task.completed_at.is_some());
    assert_eq!(h.events_of_type("task.failed").await, 1);
}

#[tokio::test]
async fn pr_failure_is_permanent() {
    let h = Harness::new(1);
    let project_id = h.add_project().await;
    let task_id = h.add_task("Doomed", true, Some(project_id)).await;

    h.heartbeat.beat().await;
    h.scheduler.execute_next_tasks(1).await.unwrap();
    h.vcs.fail_pr.store(true, Ordering::SeqCst);
    h.finish_session(task_id, 0, RESULT_LOG).await;

    let task = h.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.meta().error.unwrap().contains("PR creation failed"));
}

#[tokio::test]
async fn worktree_failure_rolls_back_and_requeues() {
    let h = Harness::new(1);
    let project_id = h.add_project().await;
    let task_id = h.add_task("No worktree", true, Some(project_id)).await;

    h.heartbeat.beat().await;
    h.vcs.fail_create.store(true, Ordering::SeqCst);
    h.scheduler.execute_next_tasks(1).await.unwrap();

    let task = h.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.meta().retry_count, 1);
    assert!(task.active_session_id.is_none());
    assert_eq!(h.agent.spawn_count().await, 0, "agent never spawned");
}

#[tokio::test]
async fn spawn_failure_releases_the_session_slot() {
    let h = Harness::new(1);
    let project_id = h.add_project().await;
    let task_id = h.add_task("Unspawnable", true, Some(project_id)).await;

    h.heartbeat.beat().await; // assess
    h.agent.fail_spawn.store(true, Ordering::SeqCst);
    h.scheduler.execute_next_tasks(1).await.unwrap();

    // Spawn failed after the session row existed and the task had flipped
    // to executing: both must be rolled back.
    let task = h.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.active_session_id.is_none());
    assert_eq!(task.meta().retry_count, 1);

    let sessions = h.store.list_sessions(Some(task_id), None).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Failed);
    assert_eq!(
        h.store.count_running_sessions().await.unwrap(),
        0,
        "orphaned session must not hold a concurrency slot"
    );

    // The freed slot is usable on the next attempt.
    h.agent.fail_spawn.store(false, Ordering::SeqCst);
    let launched = h.scheduler.execute_next_tasks(1).await.unwrap();
    assert_eq!(launched, 1);
    assert_eq!(h.task_status(task_id).await, TaskStatus::Executing);
}

#[tokio::test]
async fn assess_failure_requeues_with_retry() {
    let h = Harness::new(2);
    let task_id = h.add_task("Unassessable", true, None).await;
    h.assessor.fail_all.store(true, Ordering::SeqCst);

    h.heartbeat.beat().await;

    let task = h.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.complexity.is_none());
    assert_eq!(task.meta().retry_count, 1);
    assert_eq!(h.events_of_type("task.assess_failed").await, 1);
}

// --- Cancellation ---

#[tokio::test]
async fn cancel_is_idempotent_and_kills_the_session() {
    let h = Harness::new(1);
    let project_id = h.add_project().await;
    let task_id = h.add_task("Cancel me", true, Some(project_id)).await;

    h.heartbeat.beat().await;
    h.scheduler.execute_next_tasks(1).await.unwrap();
    let session_id = h
        .store
        .get_task(task_id)
        .await
        .unwrap()
        .unwrap()
        .active_session_id
        .unwrap();

    assert!(h.scheduler.cancel_task(task_id).await.unwrap());
    let task = h.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.active_session_id.is_none());
    assert_eq!(h.agent.cancelled.lock().await.as_slice(), &[session_id]);
    let session = h.store.get_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Cancelled);
    let completed_at = task.completed_at;

    // Second cancel leaves everything as-is.
    assert!(h.scheduler.cancel_task(task_id).await.unwrap());
    let task = h.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.completed_at, completed_at);
    assert_eq!(h.events_of_type("task.cancelled").await, 1);

    // The late exit callback does not resurrect the task.
    h.agent.finish(session_id).await;
    h.scheduler
        .on_session_terminated(SessionExit {
            session_id,
            exit_code: -1,
            turn_count: 0,
            rate_limited: false,
            claude_session_id: None,
        })
        .await
        .unwrap();
    assert_eq!(h.task_status(task_id).await, TaskStatus::Cancelled);
}

// --- Parent roll-up ---

#[tokio::test]
async fn decomposed_parent_settles_when_children_finish() {
    let h = Harness::new(5);
    let project_id = h.add_project().await;
    let parent_id = h.add_task("Split work", true, Some(project_id)).await;
    h.assessor
        .script(
            "Split work",
            Assessment {
                complexity: "complex".to_string(),
                recommended_model: "sonnet".to_string(),
                should_decompose: true,
                subtasks: vec!["Part one".to_string(), "Part two".to_string()],
                reasoning: "".to_string(),
                comment: None,
            },
        )
        .await;

    h.heartbeat.beat().await; // assess + decompose parent; children pending
    h.heartbeat.beat().await; // execute: nothing (children unassessed)
    h.heartbeat.beat().await; // assess children
    h.scheduler.execute_next_tasks(5).await.unwrap();

    let children = h.store.subtasks(parent_id).await.unwrap();
    assert_eq!(children.len(), 2);
    for child in &children {
        assert_eq!(child.status, TaskStatus::Executing);
    }

    h.finish_session(children[0].id, 0, RESULT_LOG).await;
    assert_eq!(h.task_status(parent_id).await, TaskStatus::Decomposed);

    h.finish_session(children[1].id, 0, RESULT_LOG).await;
    assert_eq!(
        h.task_status(parent_id).await,
        TaskStatus::ReadyForReview,
        "all children in review rolls the parent up"
    );
}

// --- Heartbeat invariants ---

#[tokio::test]
async fn every_beat_ticks_with_phase_parity() {
    let h = Harness::new(1);
    for _ in 0..4 {
        h.heartbeat.beat().await;
    }

    let ticks = h
        .store
        .list_events(Some("heartbeat.tick"), None, 100)
        .await
        .unwrap();
    assert_eq!(ticks.len(), 4);
    // list_events returns newest first.
    for tick in &ticks {
        let beat = tick.payload["beat"].as_u64().unwrap();
        let expected = if beat % 2 == 1 { "assess" } else { "execute" };
        assert_eq!(tick.payload["phase"], expected, "beat {beat}");
    }
    let beats: HashSet<u64> = ticks
        .iter()
        .map(|t| t.payload["beat"].as_u64().unwrap())
        .collect();
    assert_eq!(beats.len(), 4, "exactly one tick per beat");
}

#[tokio::test]
async fn heartbeat_survives_phase_failures() {
    let h = Harness::new(1);
    h.add_task("Task", true, None).await;
    h.assessor.fail_all.store(true, Ordering::SeqCst);

    // Even with the assessor down, beats keep completing.
    for _ in 0..4 {
        let diag = h.heartbeat.beat().await;
        assert!(diag["beat"].as_u64().unwrap() > 0);
    }
    assert_eq!(h.events_of_type("heartbeat.tick").await, 4);
}

// --- Executing invariant ---

#[tokio::test]
async fn executing_implies_live_session() {
    let h = Harness::new(3);
    let project_id = h.add_project().await;
    for i in 0..3 {
        h.add_task(&format!("Inv {i}"), true, Some(project_id)).await;
    }

    h.heartbeat.beat().await;
    h.scheduler.execute_next_tasks(3).await.unwrap();

    for task in h.store.list_tasks(Some(TaskStatus::Executing)).await.unwrap() {
        let session_id = task.active_session_id.expect("active session set");
        let session = h.store.get_session(session_id).await.unwrap().unwrap();
        assert!(session.status.is_live());
        // At most one live session per task.
        let live = h
            .store
            .list_sessions(Some(task.id), None)
            .await
            .unwrap()
            .into_iter()
            .filter(|s| s.status.is_live())
            .count();
        assert_eq!(live, 1);
    }
}
