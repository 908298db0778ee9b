use agent_queue::{config, engine, store};
use clap::{Parser, Subcommand};
use serde_json::json;

#[derive(Parser)]
#[command(name = "agent-queue", version, about = "Autonomous task queue for a coding-agent CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator service (heartbeat + HTTP facade)
    Serve,
    /// Run one heartbeat cycle and print its diagnostics
    Trigger,
    /// Print queue counts and the cached rate-limit snapshot
    Status,
    /// Manage tasks from the command line
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Add a task to the queue
    Add {
        title: String,
        /// Task description (prompt body)
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value_t = 0)]
        priority: i64,
        /// Activate immediately so the next beats pick it up
        #[arg(long)]
        active: bool,
        /// Project id to execute against
        #[arg(long)]
        project: Option<i64>,
    },
    /// List tasks, optionally filtered by status
    List {
        #[arg(long)]
        status: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("agent_queue=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => {
            engine::serve().await?;
        }
        Commands::Trigger => {
            let orchestrator = engine::Orchestrator::new(config::Config::from_env())?;
            let diag = orchestrator.heartbeat.trigger().await;
            println!("{}", serde_json::to_string_pretty(&diag)?);
        }
        Commands::Status => {
            let cfg = config::Config::from_env();
            let store = store::Store::open(&cfg.db_path())?;
            let tasks = store.list_tasks(None).await?;
            let mut counts = std::collections::BTreeMap::new();
            for task in &tasks {
                *counts.entry(task.status.as_str()).or_insert(0usize) += 1;
            }
            let rate_limit = store.get_rate_limit().await?;
            let running = store.count_running_sessions().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "tasks_by_status": counts,
                    "total_tasks": tasks.len(),
                    "running_sessions": running,
                    "rate_limit": rate_limit,
                }))?
            );
        }
        Commands::Task { action } => match action {
            TaskAction::Add {
                title,
                description,
                priority,
                active,
                project,
            } => {
                let cfg = config::Config::from_env();
                let store = store::Store::open(&cfg.db_path())?;
                let mut metadata = serde_json::Map::new();
                if active {
                    metadata.insert("active".to_string(), json!(true));
                }
                let task = store
                    .create_task(store::models::TaskCreate {
                        title,
                        description,
                        priority,
                        parent_task_id: None,
                        project_id: project,
                        metadata,
                    })
                    .await?;
                println!("created task {} ({})", task.id, task.title);
            }
            TaskAction::List { status } => {
                let cfg = config::Config::from_env();
                let store = store::Store::open(&cfg.db_path())?;
                let status = match status.as_deref() {
                    Some(s) => Some(
                        store::models::TaskStatus::parse(s)
                            .ok_or_else(|| anyhow::anyhow!("invalid status: {s}"))?,
                    ),
                    None => None,
                };
                for task in store.list_tasks(status).await? {
                    println!(
                        "#{:<5} {:<18} p{:<3} {}",
                        task.id,
                        task.status.as_str(),
                        task.priority,
                        task.title
                    );
                }
            }
        },
    }

    Ok(())
}
