use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vtq_core::domain::{DEFAULT_TASK_PRIORITY, TaskError, VirtualQueue};
use vtq_core::{BrokerConfig, Coordinator, QueueCounts, SqliteStore, Task, TaskId, TaskRecord, TaskUpdate};

#[derive(Parser)]
#[command(name = "vtq", version, about = "Priority-aware task queue over SQLite")]
struct Cli {
    /// Broker configuration (TOML)
    #[arg(long, global = true, env = "VTQ_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite file; overrides `store.path`
    #[arg(long, global = true, env = "VTQ_DB")]
    db: Option<PathBuf>,

    /// Table prefix; overrides `store.workspace`
    #[arg(long, global = true)]
    workspace: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the workspace tables
    Init,

    /// Add a task
    Enqueue {
        /// Payload (UTF-8)
        data: String,
        #[arg(long, default_value = "")]
        vqueue: String,
        #[arg(long, default_value_t = DEFAULT_TASK_PRIORITY)]
        priority: i64,
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },

    /// Lease tasks and print them as JSON lines
    Receive {
        #[arg(long, default_value_t = 1)]
        max: usize,
        #[arg(long, default_value_t = 0)]
        wait_secs: u64,
    },

    /// Lease, print and ack tasks until interrupted
    Consume {
        #[arg(long, default_value_t = 10)]
        batch: usize,
        #[arg(long, default_value_t = 20)]
        wait_secs: u64,
    },

    Ack { id: String },

    Nack {
        id: String,
        #[arg(long, default_value = "")]
        message: String,
    },

    Requeue { id: String },

    Retry {
        id: String,
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
        #[arg(long, default_value = "")]
        message: String,
    },

    Delete { id: String },

    /// Extend a lease or postpone a pending task
    Update {
        id: String,
        #[arg(long)]
        visible_after_secs: u64,
    },

    /// Show one task with its error history
    Get { id: String },

    /// Number of unfinished tasks
    Len,

    /// Task counts and virtual queues
    Stats,

    /// Stop dispatching from a virtual queue
    Pause { vqueue: String },

    /// Resume a paused virtual queue
    Resume { vqueue: String },

    /// Delete every task and virtual queue of the workspace
    Flush {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Serialize)]
struct TaskView<'a> {
    id: TaskId,
    vqueue: &'a str,
    priority: i64,
    lease_count: i64,
    lease_until: String,
    data: String,
}

impl<'a> From<&'a Task> for TaskView<'a> {
    fn from(task: &'a Task) -> Self {
        Self {
            id: task.id,
            vqueue: &task.vqueue_name,
            priority: task.priority,
            lease_count: task.lease_count,
            lease_until: task.visible_at.to_rfc3339(),
            data: String::from_utf8_lossy(&task.data).into_owned(),
        }
    }
}

#[derive(Serialize)]
struct Inspection {
    task: TaskRecord,
    errors: Vec<TaskError>,
}

#[derive(Serialize)]
struct Stats {
    workspace: String,
    counts: QueueCounts,
    vqueues: Vec<VirtualQueue>,
}

fn load_config(cli: &Cli, ticker: bool) -> anyhow::Result<BrokerConfig> {
    let mut config = match &cli.config {
        Some(path) => BrokerConfig::load(path)?,
        None => BrokerConfig::default(),
    };
    if let Some(db) = &cli.db {
        config.store.path = db.clone();
    }
    if let Some(workspace) = &cli.workspace {
        config.store.workspace = workspace.clone();
    }
    // 単発コマンドでは ticker は要らない
    config.ticker.enabled = ticker;
    Ok(config)
}

fn parse_id(raw: &str) -> anyhow::Result<TaskId> {
    raw.parse::<TaskId>()
        .with_context(|| format!("not a task id: {raw}"))
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn report(done: bool, what: &str, id: &str) -> anyhow::Result<()> {
    if !done {
        anyhow::bail!("{what} rejected for {id}");
    }
    println!("{what} {id}");
    Ok(())
}

async fn consume(
    coordinator: &Coordinator<SqliteStore>,
    batch: usize,
    wait: Duration,
) -> anyhow::Result<()> {
    loop {
        let tasks = tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            tasks = coordinator.receive(batch, wait) => tasks?,
        };
        for task in &tasks {
            print_json(&TaskView::from(task))?;
            coordinator.ack(task.id).await?;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let long_running = matches!(cli.cmd, Command::Consume { .. });
    let config = load_config(&cli, long_running)?;
    let workspace = config.store.workspace.clone();
    let coordinator = Coordinator::builder()
        .config(config)
        .open()
        .context("opening store")?;

    match cli.cmd {
        Command::Init => {
            println!("initialized workspace {workspace}");
        }
        Command::Enqueue {
            data,
            vqueue,
            priority,
            delay_ms,
        } => {
            let id = coordinator
                .enqueue(data.into_bytes(), &vqueue, priority, Duration::from_millis(delay_ms))
                .await?;
            println!("{id}");
        }
        Command::Receive { max, wait_secs } => {
            let tasks = coordinator
                .receive(max, Duration::from_secs(wait_secs))
                .await?;
            for task in &tasks {
                print_json(&TaskView::from(task))?;
            }
        }
        Command::Consume { batch, wait_secs } => {
            info!(workspace = %workspace, batch, "consuming, press Ctrl-C to stop");
            consume(&coordinator, batch, Duration::from_secs(wait_secs)).await?;
        }
        Command::Ack { id } => {
            report(coordinator.ack(parse_id(&id)?).await?, "acked", &id)?;
        }
        Command::Nack { id, message } => {
            report(coordinator.nack(parse_id(&id)?, &message).await?, "nacked", &id)?;
        }
        Command::Requeue { id } => {
            report(coordinator.requeue(parse_id(&id)?).await?, "requeued", &id)?;
        }
        Command::Retry {
            id,
            delay_ms,
            message,
        } => {
            let done = coordinator
                .retry(parse_id(&id)?, Duration::from_millis(delay_ms), &message)
                .await?;
            report(done, "retried", &id)?;
        }
        Command::Delete { id } => {
            report(coordinator.delete(parse_id(&id)?).await?, "deleted", &id)?;
        }
        Command::Update {
            id,
            visible_after_secs,
        } => {
            let update = TaskUpdate::visible_after(Duration::from_secs(visible_after_secs));
            report(coordinator.update(parse_id(&id)?, update).await?, "updated", &id)?;
        }
        Command::Get { id } => {
            let task_id = parse_id(&id)?;
            let task = coordinator
                .get(task_id)
                .await?
                .with_context(|| format!("no such task: {id}"))?;
            let errors = coordinator.errors(task_id).await?;
            print_json(&Inspection { task, errors })?;
        }
        Command::Len => {
            println!("{}", coordinator.len().await?);
        }
        Command::Stats => {
            print_json(&Stats {
                workspace,
                counts: coordinator.counts().await?,
                vqueues: coordinator.vqueues().await?,
            })?;
        }
        Command::Pause { vqueue } => {
            coordinator.ensure_vqueue(&vqueue).await?;
            let changed = coordinator.set_vqueue_hidden(&vqueue, true).await?;
            println!("{vqueue} paused{}", if changed { "" } else { " (already)" });
        }
        Command::Resume { vqueue } => {
            let changed = coordinator.set_vqueue_hidden(&vqueue, false).await?;
            println!("{vqueue} resumed{}", if changed { "" } else { " (not paused)" });
        }
        Command::Flush { yes } => {
            if !yes {
                anyhow::bail!("refusing to flush workspace {workspace} without --yes");
            }
            coordinator.flush().await?;
            println!("flushed workspace {workspace}");
        }
    }

    coordinator.close().await;
    Ok(())
}
