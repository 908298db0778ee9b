//! Git worktree and PR plumbing.
//!
//! Each executing task gets an isolated worktree on its own branch so
//! concurrent sessions never collide on the filesystem. All operations go
//! through subprocesses (`git`, `gh`); results carry captured stderr on
//! failure. Operations on the same repository's metadata are serialized by
//! a per-repo lock.

use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

/// Timeout for local git operations.
const GIT_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for operations that touch the network (push, PR).
const REMOTE_TIMEOUT: Duration = Duration::from_secs(120);

/// One entry from `git worktree list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head: Option<String>,
}

/// Version-control operations the scheduler depends on.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Create a new branch off the remote default and add a worktree for it.
    /// Returns the worktree path.
    async fn create_worktree(
        &self,
        repo_dir: &Path,
        branch: &str,
        base: &str,
    ) -> anyhow::Result<PathBuf>;

    /// Stage everything, commit, and push the branch. Returns the commit
    /// sha, or `None` when there was nothing to commit.
    async fn commit_and_push(
        &self,
        worktree: &Path,
        branch: &str,
        message: &str,
    ) -> anyhow::Result<Option<String>>;

    /// Create a pull request for the branch. Returns the PR URL.
    async fn create_pr(
        &self,
        worktree: &Path,
        branch: &str,
        title: &str,
        body: &str,
    ) -> anyhow::Result<String>;

    /// Remove a worktree and prune. Succeeds if the path is already gone.
    async fn remove_worktree(&self, repo_dir: &Path, worktree: &Path) -> anyhow::Result<()>;

    /// Delete a branch locally (and from the remote unless `local_only`).
    async fn delete_branch(
        &self,
        repo_dir: &Path,
        branch: &str,
        local_only: bool,
    ) -> anyhow::Result<()>;

    /// List worktrees registered in the repository.
    async fn list_worktrees(&self, repo_dir: &Path) -> anyhow::Result<Vec<WorktreeInfo>>;
}

/// Sanitize text into a git-branch-safe slug (max 40 chars).
pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    let mut last_hyphen = true;
    for c in text.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }
    let slug = slug.trim_matches('-');
    let truncated: String = slug.chars().take(40).collect();
    truncated.trim_end_matches('-').to_string()
}

/// Branch name for a task: `task-{id}-{slug}`.
pub fn branch_name(task_id: i64, title: &str) -> String {
    let slug = slugify(title);
    if slug.is_empty() {
        format!("task-{task_id}")
    } else {
        format!("task-{task_id}-{slug}")
    }
}

/// Parse `git worktree list --porcelain` output.
pub fn parse_worktree_list(output: &str) -> Vec<WorktreeInfo> {
    let mut result = Vec::new();
    let mut current: Option<WorktreeInfo> = None;
    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(info) = current.take() {
                result.push(info);
            }
            current = Some(WorktreeInfo {
                path: PathBuf::from(path),
                branch: None,
                head: None,
            });
        } else if let Some(branch) = line.strip_prefix("branch ") {
            if let Some(info) = current.as_mut() {
                info.branch = Some(branch.trim_start_matches("refs/heads/").to_string());
            }
        } else if let Some(head) = line.strip_prefix("HEAD ") {
            if let Some(info) = current.as_mut() {
                info.head = Some(head.to_string());
            }
        }
    }
    if let Some(info) = current {
        result.push(info);
    }
    result
}

/// Real implementation backed by the `git` and `gh` binaries.
pub struct GitVcs {
    /// Root directory for task worktrees.
    worktrees_dir: PathBuf,
    /// Per-repo locks so concurrent worktree operations on one repository
    /// never interleave.
    repo_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl GitVcs {
    pub fn new(worktrees_dir: PathBuf) -> Self {
        Self {
            worktrees_dir,
            repo_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn repo_lock(&self, repo_dir: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.repo_locks.lock().await;
        locks
            .entry(repo_dir.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run a git subcommand and fail with captured stderr on non-zero exit.
    /// Spawn errors name the binary so a missing `git` is obvious.
    async fn git(
        &self,
        repo_dir: &Path,
        args: &[&str],
        deadline: Duration,
    ) -> anyhow::Result<String> {
        let output = timeout(
            deadline,
            Command::new("git").args(args).current_dir(repo_dir).output(),
        )
        .await
        .with_context(|| format!("git {} timed out", args.first().unwrap_or(&"")))?
        .with_context(|| format!("failed to run `git {}`", args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Detect the default branch from the remote HEAD, falling back to the
    /// current local branch, then "main".
    pub async fn detect_default_branch(&self, repo_dir: &Path) -> String {
        if let Ok(out) = self
            .git(
                repo_dir,
                &["symbolic-ref", "refs/remotes/origin/HEAD", "--short"],
                GIT_TIMEOUT,
            )
            .await
        {
            if !out.is_empty() {
                return out.trim_start_matches("origin/").to_string();
            }
        }
        if let Ok(out) = self
            .git(repo_dir, &["branch", "--show-current"], GIT_TIMEOUT)
            .await
        {
            if !out.is_empty() {
                return out;
            }
        }
        "main".to_string()
    }
}

#[async_trait]
impl Vcs for GitVcs {
    async fn create_worktree(
        &self,
        repo_dir: &Path,
        branch: &str,
        base: &str,
    ) -> anyhow::Result<PathBuf> {
        let lock = self.repo_lock(repo_dir).await;
        let _guard = lock.lock().await;

        std::fs::create_dir_all(&self.worktrees_dir)?;
        let worktree_path = self.worktrees_dir.join(branch);

        // Refresh the base ref from origin; tolerate offline repos.
        if let Err(e) = self
            .git(repo_dir, &["fetch", "origin", "--prune"], REMOTE_TIMEOUT)
            .await
        {
            tracing::warn!(?e, "fetch failed, branching from local base");
        } else {
            // Fast-forward the local base to origin even if not checked out.
            let _ = self
                .git(
                    repo_dir,
                    &[
                        "update-ref",
                        &format!("refs/heads/{base}"),
                        &format!("refs/remotes/origin/{base}"),
                    ],
                    GIT_TIMEOUT,
                )
                .await;
        }

        // Branch from origin/<base> when it exists, local <base> otherwise.
        let origin_base = format!("origin/{base}");
        let start_point = match self
            .git(repo_dir, &["rev-parse", "--verify", &origin_base], GIT_TIMEOUT)
            .await
        {
            Ok(_) => origin_base,
            Err(_) => base.to_string(),
        };

        self.git(
            repo_dir,
            &[
                "worktree",
                "add",
                "-b",
                branch,
                &worktree_path.to_string_lossy(),
                &start_point,
            ],
            GIT_TIMEOUT,
        )
        .await
        .with_context(|| format!("creating worktree for branch {branch}"))?;

        tracing::info!(branch, worktree = %worktree_path.display(), "created worktree");
        Ok(worktree_path)
    }

    async fn commit_and_push(
        &self,
        worktree: &Path,
        branch: &str,
        message: &str,
    ) -> anyhow::Result<Option<String>> {
        self.git(worktree, &["add", "-A"], GIT_TIMEOUT).await?;

        // Anything staged?
        let staged = Command::new("git")
            .args(["diff", "--cached", "--quiet"])
            .current_dir(worktree)
            .output()
            .await
            .context("failed to run `git diff`")?;
        if staged.status.success() {
            tracing::info!(branch, "no changes to commit");
            return Ok(None);
        }

        self.git(worktree, &["commit", "-m", message], GIT_TIMEOUT)
            .await
            .context("commit failed")?;
        let sha = self.git(worktree, &["rev-parse", "HEAD"], GIT_TIMEOUT).await?;

        self.git(
            worktree,
            &["push", "-u", "origin", branch],
            REMOTE_TIMEOUT,
        )
        .await
        .with_context(|| format!("pushing branch {branch}"))?;

        tracing::info!(branch, sha = %sha, "pushed branch");
        Ok(Some(sha))
    }

    async fn create_pr(
        &self,
        worktree: &Path,
        branch: &str,
        title: &str,
        body: &str,
    ) -> anyhow::Result<String> {
        let output = timeout(
            REMOTE_TIMEOUT,
            Command::new("gh")
                .args([
                    "pr", "create", "--head", branch, "--title", title, "--body", body,
                ])
                .current_dir(worktree)
                .output(),
        )
        .await
        .context("gh pr create timed out")?
        .context("failed to run `gh`")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("gh pr create failed: {}", stderr.trim());
        }

        let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
        tracing::info!(branch, pr_url = %url, "created PR");
        Ok(url)
    }

    async fn remove_worktree(&self, repo_dir: &Path, worktree: &Path) -> anyhow::Result<()> {
        let lock = self.repo_lock(repo_dir).await;
        let _guard = lock.lock().await;

        if worktree.exists() {
            if let Err(e) = self
                .git(
                    repo_dir,
                    &["worktree", "remove", &worktree.to_string_lossy(), "--force"],
                    GIT_TIMEOUT,
                )
                .await
            {
                tracing::warn!(worktree = %worktree.display(), ?e, "worktree remove failed");
            }
        }
        // Prune clears metadata for paths deleted out from under git.
        let _ = self
            .git(repo_dir, &["worktree", "prune"], GIT_TIMEOUT)
            .await;
        Ok(())
    }

    async fn delete_branch(
        &self,
        repo_dir: &Path,
        branch: &str,
        local_only: bool,
    ) -> anyhow::Result<()> {
        let lock = self.repo_lock(repo_dir).await;
        let _guard = lock.lock().await;

        if let Err(e) = self
            .git(repo_dir, &["branch", "-D", branch], GIT_TIMEOUT)
            .await
        {
            tracing::debug!(branch, ?e, "local branch delete failed (may not exist)");
        }
        if !local_only {
            if let Err(e) = self
                .git(
                    repo_dir,
                    &["push", "origin", "--delete", branch],
                    REMOTE_TIMEOUT,
                )
                .await
            {
                tracing::debug!(branch, ?e, "remote branch delete failed");
            }
        }
        Ok(())
    }

    async fn list_worktrees(&self, repo_dir: &Path) -> anyhow::Result<Vec<WorktreeInfo>> {
        let out = self
            .git(repo_dir, &["worktree", "list", "--porcelain"], GIT_TIMEOUT)
            .await?;
        Ok(parse_worktree_list(&out))
    }
}
