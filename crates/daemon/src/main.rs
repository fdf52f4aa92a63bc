use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sokrates_daemon::{
    CommandSubtaskHandler, ControlError, Daemon, DaemonConfig, DaemonStatus, DetachedLauncher,
    PgrepDiscovery, ProcessController, StartOutcome, StopOutcome, UnixSignals,
};
use sokrates_queue::{Processor, SequentialTaskRunner, SqliteQueueStore};

/// Background worker for the sokrates task queue.
#[derive(Debug, Parser)]
#[command(name = "sokrates-daemon", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Start the daemon in the background (no-op if it is already running).
    Start,
    /// Stop the running daemon.
    Stop {
        /// Stop this PID instead of the discovered daemon.
        #[arg(long)]
        pid: Option<u32>,
    },
    /// Stop, then start the daemon.
    Restart,
    /// Report whether the daemon is running.
    Status,
    /// Run the polling loop in the foreground.
    #[command(hide = true)]
    Run,
}

type Controller = ProcessController<PgrepDiscovery, UnixSignals, DetachedLauncher>;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Cmd::Run => run_daemon(),
        Cmd::Start => start(),
        Cmd::Stop { pid } => stop(pid),
        Cmd::Restart => restart(),
        Cmd::Status => status(),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "command failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn controller() -> anyhow::Result<(DaemonConfig, Controller)> {
    sokrates_observability::init();
    let config = DaemonConfig::from_env().context("invalid configuration")?;
    let launcher = DetachedLauncher::current_exe(&config.log_file)
        .context("failed to locate the daemon executable")?;
    Ok((config, ProcessController::new(PgrepDiscovery, UnixSignals, launcher)))
}

fn start() -> anyhow::Result<bool> {
    let (config, controller) = controller()?;
    let outcome = controller.start_with(|| {
        config
            .require_subtask_command()
            .map(drop)
            .map_err(|e| ControlError::NotReady(e.to_string()))
    })?;
    report_start(outcome, &config);
    Ok(true)
}

fn stop(pid: Option<u32>) -> anyhow::Result<bool> {
    let (_, controller) = controller()?;
    Ok(report_stop(controller.stop(pid)?))
}

fn restart() -> anyhow::Result<bool> {
    let (config, controller) = controller()?;
    config.require_subtask_command()?;
    let outcome = controller.restart()?;
    report_stop(outcome.stopped);
    report_start(outcome.started, &config);
    Ok(true)
}

fn status() -> anyhow::Result<bool> {
    let (_, controller) = controller()?;
    match controller.status()? {
        DaemonStatus::Running(pid) => {
            println!("Daemon is running (PID {pid})");
            Ok(true)
        }
        DaemonStatus::NotRunning => {
            println!("Daemon is not running");
            Ok(false)
        }
    }
}

fn report_start(outcome: StartOutcome, config: &DaemonConfig) {
    match outcome {
        StartOutcome::AlreadyRunning(pid) => println!("Daemon is already running (PID {pid})"),
        StartOutcome::Started(pid) => println!(
            "Daemon started (PID {pid}); logging to {}",
            config.log_file.display()
        ),
    }
}

fn report_stop(outcome: StopOutcome) -> bool {
    match outcome {
        StopOutcome::NotRunning => println!("No running daemon found"),
        StopOutcome::Stopped { pid, forced: false } => println!("Daemon stopped (PID {pid})"),
        StopOutcome::Stopped { pid, forced: true } => {
            println!("Daemon did not exit in time and was killed (PID {pid})")
        }
    }
    outcome.is_success()
}

/// Foreground loop. Output goes wherever the launcher pointed stdout/stderr.
fn run_daemon() -> anyhow::Result<bool> {
    sokrates_observability::init_json();
    let config = DaemonConfig::from_env().context("invalid configuration")?;
    let command = config.require_subtask_command()?.to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(async {
        let store = SqliteQueueStore::new(&config.database_path);
        let runner = SequentialTaskRunner::new(CommandSubtaskHandler::new(
            command,
            &config.results_dir,
        ));
        let processor = Processor::new(store, runner, config.processor_config());
        let mut daemon = Daemon::new(processor, config.processing_interval, config.batch_limit);

        tracing::info!(
            pid = std::process::id(),
            database = %config.database_path.display(),
            "sokrates daemon starting"
        );
        daemon.run().await.context("failed to install signal handlers")?;
        Ok::<_, anyhow::Error>(true)
    })
}
