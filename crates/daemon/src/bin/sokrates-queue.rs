//! Command-line access to the task queue: enqueue task files and inspect tasks.

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use sokrates_core::{NewTask, TaskFile, TaskId, TaskStatus};
use sokrates_daemon::DaemonConfig;
use sokrates_queue::{QueueStore, SqliteQueueStore};

#[derive(Debug, Parser)]
#[command(name = "sokrates-queue", version, about = "Manage the sokrates task queue")]
struct Cli {
    /// Queue database (defaults to the configured database path).
    #[arg(long, env = "SOKRATES_DATABASE_PATH")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Add a task file to the queue.
    Add { file: PathBuf },
    /// List tasks, oldest first.
    List {
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one task and its error history as JSON.
    Show { task_id: TaskId },
    /// Task counts per status.
    Stats,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    sokrates_observability::init();
    let cli = Cli::parse();

    let database = match cli.database {
        Some(path) => path,
        None => DaemonConfig::from_env()?.database_path,
    };
    let store = SqliteQueueStore::new(database);
    let result = run(&store, cli.command).await;
    store.close().await;
    result
}

async fn run(store: &SqliteQueueStore, command: Cmd) -> anyhow::Result<()> {
    match command {
        Cmd::Add { file } => {
            let path = std::fs::canonicalize(&file)
                .with_context(|| format!("cannot resolve {}", file.display()))?;
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            TaskFile::from_json(&raw)?;

            let task = store.enqueue(NewTask::new(path)).await?;
            println!("{}", task.task_id);
        }
        Cmd::List { status, limit } => {
            for task in store.list_tasks(status, limit).await? {
                println!(
                    "{}  {:<11}  attempts={}  {}  {}",
                    task.task_id,
                    task.status.as_str(),
                    task.attempt_count,
                    task.updated_at.format("%Y-%m-%d %H:%M:%S"),
                    task.file_path.display()
                );
            }
        }
        Cmd::Show { task_id } => {
            let Some(task) = store.get_task(task_id).await? else {
                bail!("task not found: {task_id}");
            };
            let errors = store.list_errors(task_id).await?;
            let doc = serde_json::json!({ "task": task, "errors": errors });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Cmd::Stats => {
            let stats = store.stats().await?;
            for status in TaskStatus::ALL {
                println!("{:<11} {}", status.as_str(), stats.count(status));
            }
            println!("{:<11} {}", "total", stats.total());
        }
    }
    Ok(())
}
