//! Heartbeat — the periodic driver.
//!
//! Odd beats assess, even beats execute, every tenth beat garbage-collects
//! worktrees. Each phase is isolated: failures are logged and emitted as
//! `heartbeat.error`, and the beat always completes. The loop itself never
//! exits except through shutdown.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use super::scheduler::Scheduler;
use crate::events::EventBus;
use crate::rate_limit::RateLimitProbe;

pub struct Heartbeat {
    scheduler: Arc<Scheduler>,
    probe: Arc<RateLimitProbe>,
    bus: Arc<EventBus>,
    interval_secs: u64,
    max_concurrent: usize,
    beat_count: AtomicU64,
}

impl Heartbeat {
    pub fn new(
        scheduler: Arc<Scheduler>,
        probe: Arc<RateLimitProbe>,
        bus: Arc<EventBus>,
        interval_secs: u64,
        max_concurrent: usize,
    ) -> Self {
        Self {
            scheduler,
            probe,
            bus,
            interval_secs,
            max_concurrent,
            beat_count: AtomicU64::new(0),
        }
    }

    /// Run the loop until shutdown flips. Beats never overlap — the next
    /// interval tick is consumed only after the current beat returns.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.interval_secs, "heartbeat started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.beat().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("heartbeat stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Manually trigger a single beat and return its diagnostics.
    pub async fn trigger(&self) -> Value {
        tracing::info!("manual heartbeat triggered");
        self.beat().await
    }

    /// One full beat. Never returns an error; everything is caught here.
    pub async fn beat(&self) -> Value {
        let beat = self.beat_count.fetch_add(1, Ordering::SeqCst) + 1;
        let phase = if beat % 2 == 1 { "assess" } else { "execute" };
        let mut diag = json!({
            "beat": beat,
            "phase": phase,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        // 1. Probe the rate limit. A probe warning is itself an event.
        let probe = self.probe.probe().await;
        if let Some(warning) = &probe.warning {
            tracing::warn!(%warning, "rate-limit probe warning");
            self.emit_quiet(
                "heartbeat.probe_warning",
                json!({"beat": beat, "warning": warning}),
            )
            .await;
        }
        diag["rate_limit"] = serde_json::to_value(&probe.snapshot).unwrap_or(Value::Null);

        self.emit_quiet(
            "heartbeat.tick",
            json!({
                "beat": beat,
                "phase": phase,
                "rate_limit": serde_json::to_value(&probe.snapshot).unwrap_or(Value::Null),
            }),
        )
        .await;

        // 2. Limited: record it and skip the scheduling phases.
        if probe.snapshot.is_limited {
            tracing::info!(
                reset_at = ?probe.snapshot.reset_at,
                "rate limited, skipping phases"
            );
            self.emit_quiet(
                "heartbeat.rate_limited",
                json!({
                    "beat": beat,
                    "percent_used": probe.snapshot.percent_used,
                    "reset_at": probe.snapshot.reset_at.map(|t| t.to_rfc3339()),
                }),
            )
            .await;
            diag["rate_limited"] = json!(true);
            return diag;
        }

        // 3. Phase action.
        if phase == "assess" {
            match self.scheduler.dedupe_tasks().await {
                Ok(n) => diag["dupes_removed"] = json!(n),
                Err(e) => self.phase_error(beat, "dedupe", &e, &mut diag).await,
            }
            match self.scheduler.assess_batch().await {
                Ok(n) => {
                    if n > 0 {
                        tracing::info!(beat, assessed = n, "assess phase done");
                    }
                    diag["tasks_assessed"] = json!(n);
                }
                Err(e) => self.phase_error(beat, "assess", &e, &mut diag).await,
            }
        } else {
            match self.scheduler.execute_next_tasks(self.max_concurrent).await {
                Ok(n) => {
                    if n > 0 {
                        tracing::info!(beat, launched = n, "execute phase done");
                    }
                    diag["tasks_launched"] = json!(n);
                }
                Err(e) => self.phase_error(beat, "execute", &e, &mut diag).await,
            }
        }

        // 4. Periodic garbage collection.
        if beat % 10 == 0 {
            if let Err(e) = self.scheduler.cleanup_stale_worktrees().await {
                self.phase_error(beat, "gc", &e, &mut diag).await;
            } else {
                diag["gc"] = json!(true);
            }
        }

        diag
    }

    async fn phase_error(&self, beat: u64, phase: &str, error: &anyhow::Error, diag: &mut Value) {
        tracing::error!(beat, phase, ?error, "heartbeat phase failed");
        diag[format!("{phase}_error")] = json!(error.to_string());
        self.emit_quiet(
            "heartbeat.error",
            json!({"beat": beat, "phase": phase, "error": format!("{error:#}")}),
        )
        .await;
    }

    /// Emit without letting a store failure escape the beat.
    async fn emit_quiet(&self, event_type: &str, payload: Value) {
        if let Err(e) = self.bus.emit(event_type, "system", None, payload).await {
            tracing::warn!(event_type, ?e, "event emit failed");
        }
    }
}
