//! Rate-limit probe — reads the agent CLI's usage cache.
//!
//! The agent CLI maintains a small JSON file describing subscription usage.
//! The probe reads it on every beat; a missing or malformed file is a
//! warning, never an error — scheduling continues when usage is unknowable.
//! Every result is persisted to the store's singleton snapshot row.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::store::models::RateLimitSnapshot;
use crate::store::Store;

/// Usage at or above this share of the limit pauses scheduling.
const LIMITED_THRESHOLD: f64 = 90.0;

/// Outcome of one probe. Never an error.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub snapshot: RateLimitSnapshot,
    pub raw: String,
    /// Set when the cache was missing or unreadable.
    pub warning: Option<String>,
}

pub struct RateLimitProbe {
    cache_path: PathBuf,
    store: Arc<Store>,
    /// Override window set when a session's output reported a limit.
    limited_until: Mutex<Option<DateTime<Utc>>>,
}

impl RateLimitProbe {
    pub fn new(cache_path: PathBuf, store: Arc<Store>) -> Self {
        Self {
            cache_path,
            store,
            limited_until: Mutex::new(None),
        }
    }

    /// Read the usage cache and persist the snapshot.
    pub async fn probe(&self) -> ProbeResult {
        // An unexpired override from session output wins over the cache.
        {
            let mut until = self.limited_until.lock().await;
            if let Some(reset_at) = *until {
                if Utc::now() < reset_at {
                    let snapshot = limited_snapshot(Some(reset_at));
                    self.persist(&snapshot, "session-reported limit").await;
                    return ProbeResult {
                        snapshot,
                        raw: String::new(),
                        warning: None,
                    };
                }
                tracing::info!("rate-limit window has passed, resuming probes");
                *until = None;
            }
        }

        let result = match tokio::fs::read_to_string(&self.cache_path).await {
            Ok(raw) => match parse_usage_cache(&raw) {
                Some(snapshot) => ProbeResult {
                    snapshot,
                    raw,
                    warning: None,
                },
                None => ProbeResult {
                    snapshot: unknown_snapshot(),
                    raw,
                    warning: Some(format!(
                        "usage cache at {} is not valid JSON",
                        self.cache_path.display()
                    )),
                },
            },
            Err(e) => ProbeResult {
                snapshot: unknown_snapshot(),
                raw: String::new(),
                warning: Some(format!(
                    "usage cache at {} unreadable: {e}",
                    self.cache_path.display()
                )),
            },
        };

        self.persist(&result.snapshot, &result.raw).await;
        result
    }

    /// Externally mark as limited (a session's output hit the limit).
    pub async fn mark_limited(&self, reset_at: Option<DateTime<Utc>>) {
        let until = reset_at.unwrap_or_else(|| Utc::now() + chrono::Duration::hours(1));
        *self.limited_until.lock().await = Some(until);
        tracing::warn!(reset_at = %until, "marked rate limited from session output");
    }

    async fn persist(&self, snapshot: &RateLimitSnapshot, raw: &str) {
        if let Err(e) = self.store.update_rate_limit(snapshot, raw).await {
            tracing::warn!(?e, "failed to persist rate-limit snapshot");
        }
    }
}

/// Parse the usage-cache JSON. Returns `None` when it isn't a JSON object.
pub fn parse_usage_cache(raw: &str) -> Option<RateLimitSnapshot> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let obj = value.as_object()?;

    let messages_used = obj.get("messages_used").and_then(Value::as_i64).unwrap_or(0);
    let messages_limit = obj
        .get("messages_limit")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let percent_used = obj
        .get("percent_used")
        .and_then(Value::as_f64)
        .unwrap_or_else(|| {
            if messages_limit > 0 {
                messages_used as f64 / messages_limit as f64 * 100.0
            } else {
                0.0
            }
        });
    let reset_at = obj
        .get("reset_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let is_limited = obj
        .get("is_limited")
        .and_then(Value::as_bool)
        .unwrap_or(percent_used >= LIMITED_THRESHOLD);

    Some(RateLimitSnapshot {
        tier: obj
            .get("tier")
            .and_then(Value::as_str)
            .map(String::from)
            .or(Some("unknown".to_string())),
        messages_used,
        messages_limit,
        percent_used,
        is_limited,
        reset_at,
        updated_at: Some(Utc::now()),
    })
}

fn unknown_snapshot() -> RateLimitSnapshot {
    RateLimitSnapshot {
        tier: Some("unknown".to_string()),
        is_limited: false,
        updated_at: Some(Utc::now()),
        ..Default::default()
    }
}

fn limited_snapshot(reset_at: Option<DateTime<Utc>>) -> RateLimitSnapshot {
    RateLimitSnapshot {
        tier: Some("unknown".to_string()),
        percent_used: 100.0,
        is_limited: true,
        reset_at,
        updated_at: Some(Utc::now()),
        ..Default::default()
    }
}
