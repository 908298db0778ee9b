//! Engine — wiring and the serve loop.
//!
//! The orchestrator owns every component. Initialization order is
//! Store → EventBus → adapters → Scheduler → Heartbeat; teardown reverses:
//! the heartbeat stops first, then in-flight session callbacks drain, then
//! everything else drops.

pub mod heartbeat;
pub mod scheduler;

use anyhow::Context;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::agent::ClaudeCliRunner;
use crate::assess::AnthropicAssessor;
use crate::config::Config;
use crate::events::EventBus;
use crate::rate_limit::RateLimitProbe;
use crate::store::Store;
use crate::vcs::GitVcs;
use self::heartbeat::Heartbeat;
use self::scheduler::Scheduler;

/// Process-wide orchestrator value, constructed once at startup and handed
/// to the HTTP facade.
pub struct Orchestrator {
    pub config: Config,
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,
    pub scheduler: Arc<Scheduler>,
    pub heartbeat: Arc<Heartbeat>,
}

impl Orchestrator {
    /// Build the full component graph against the real adapters.
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        config.ensure_directories()?;

        let store = Arc::new(Store::open(&config.db_path())?);
        tracing::info!(db = %config.db_path().display(), "store ready");

        let bus = Arc::new(EventBus::new(store.clone()));

        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let agent = Arc::new(ClaudeCliRunner::new(
            config.agent_bin.clone(),
            bus.clone(),
            exit_tx,
        ));
        let vcs = Arc::new(GitVcs::new(config.worktrees_dir.clone()));
        let assessor = Arc::new(AnthropicAssessor::new(
            config.anthropic_api_key.clone(),
            config.assessment_model.clone(),
        ));
        let probe = Arc::new(RateLimitProbe::new(
            config.usage_cache_path.clone(),
            store.clone(),
        ));

        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            bus.clone(),
            vcs,
            agent,
            assessor,
            probe.clone(),
            config.clone(),
        ));

        let heartbeat = Arc::new(Heartbeat::new(
            scheduler.clone(),
            probe,
            bus.clone(),
            config.heartbeat_interval_secs,
            config.max_concurrent_tasks,
        ));

        // Session terminations re-enter the scheduler from here.
        spawn_exit_pump(scheduler.clone(), exit_rx);

        Ok(Arc::new(Self {
            config,
            store,
            bus,
            scheduler,
            heartbeat,
        }))
    }
}

fn spawn_exit_pump(
    scheduler: Arc<Scheduler>,
    mut exit_rx: mpsc::UnboundedReceiver<crate::agent::SessionExit>,
) {
    tokio::spawn(async move {
        while let Some(exit) = exit_rx.recv().await {
            let session_id = exit.session_id;
            if let Err(e) = scheduler.on_session_terminated(exit).await {
                tracing::error!(session_id, ?e, "session finalize failed");
            }
        }
    });
}

/// Start the orchestrator service: heartbeat loop plus HTTP facade.
/// Returns when a shutdown signal arrives.
pub async fn serve() -> anyhow::Result<()> {
    let config = Config::from_env();
    tracing::info!(
        interval = config.heartbeat_interval_secs,
        max_concurrent = config.max_concurrent_tasks,
        "agent-queue starting"
    );

    let orchestrator = Orchestrator::new(config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let heartbeat_handle = tokio::spawn(orchestrator.heartbeat.clone().run(shutdown_rx));

    let addr = format!(
        "{}:{}",
        orchestrator.config.host, orchestrator.config.port
    );
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "http facade listening");

    let app = crate::http::router(orchestrator.clone());
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(?e, "http server stopped");
        }
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    // Teardown in reverse: heartbeat first, then the HTTP surface. Agent
    // processes keep running; reconciliation picks them up on restart.
    let _ = shutdown_tx.send(true);
    let _ = heartbeat_handle.await;
    server.abort();
    tracing::info!("agent-queue stopped");
    Ok(())
}
