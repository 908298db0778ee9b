//! Environment-driven configuration.
//!
//! Every knob has a default so `agent-queue serve` works out of the box;
//! the assessment API key is the only thing that must come from outside.

use std::path::PathBuf;

/// Application configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root for the database and session logs.
    pub data_dir: PathBuf,
    /// Root for task worktrees.
    pub worktrees_dir: PathBuf,
    /// Seconds between heartbeats.
    pub heartbeat_interval_secs: u64,
    /// Execution slots per even beat.
    pub max_concurrent_tasks: usize,
    /// Retries before a task failure becomes permanent.
    pub max_task_retries: i64,
    /// Fixed model label for assessment calls.
    pub assessment_model: String,
    /// API key for the assessment service (empty = assessment disabled).
    pub anthropic_api_key: String,
    /// Agent CLI binary name.
    pub agent_bin: String,
    /// Usage-cache file maintained by the agent CLI.
    pub usage_cache_path: PathBuf,
    /// HTTP facade bind address.
    pub host: String,
    pub port: u16,
}

impl Config {
    /// Resolve configuration from the environment.
    pub fn from_env() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));

        Self {
            data_dir: env_path("DATA_DIR", PathBuf::from("data")),
            worktrees_dir: env_path("WORKTREES_DIR", home.join("agent-queue-worktrees")),
            heartbeat_interval_secs: env_parse("HEARTBEAT_INTERVAL_SECONDS", 60),
            max_concurrent_tasks: env_parse("MAX_CONCURRENT_TASKS", 2),
            max_task_retries: env_parse("MAX_TASK_RETRIES", 3),
            assessment_model: env_string("ASSESSMENT_MODEL", "claude-sonnet-4-5"),
            anthropic_api_key: env_string("ANTHROPIC_API_KEY", ""),
            agent_bin: env_string("AGENT_BIN", "claude"),
            usage_cache_path: env_path(
                "USAGE_CACHE_PATH",
                home.join(".claude").join("usage-cache.json"),
            ),
            host: env_string("HOST", "0.0.0.0"),
            port: env_parse("PORT", 8000),
        }
    }

    /// Path to the sqlite database file.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("queue.db")
    }

    /// Directory for a session's captured output files.
    pub fn session_dir(&self, session_uuid: &str) -> PathBuf {
        self.data_dir.join("sessions").join(session_uuid)
    }

    /// Create the data and worktree directories if missing.
    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(self.data_dir.join("sessions"))?;
        std::fs::create_dir_all(&self.worktrees_dir)?;
        Ok(())
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
