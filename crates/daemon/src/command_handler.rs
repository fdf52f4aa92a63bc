//! Runs each subtask through an external shell command.
//!
//! The command gets the subtask's description on stdin and in
//! `SOKRATES_SUBTASK_DESCRIPTION`, its id in `SOKRATES_SUBTASK_ID`, and the
//! task file's top-level description (if any) in `SOKRATES_MAIN_TASK`.
//! Whatever it prints on stdout is saved as `task_<id>_result.md` in the
//! results directory.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use sokrates_queue::{SubtaskContext, SubtaskError, SubtaskHandler};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

pub const ENV_SUBTASK_ID: &str = "SOKRATES_SUBTASK_ID";
pub const ENV_SUBTASK_DESCRIPTION: &str = "SOKRATES_SUBTASK_DESCRIPTION";
pub const ENV_MAIN_TASK: &str = "SOKRATES_MAIN_TASK";

#[derive(Debug, Clone)]
pub struct CommandSubtaskHandler {
    shell: PathBuf,
    command: String,
    results_dir: PathBuf,
}

impl CommandSubtaskHandler {
    pub fn new(command: impl Into<String>, results_dir: impl Into<PathBuf>) -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
            command: command.into(),
            results_dir: results_dir.into(),
        }
    }

    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    async fn run_command(&self, ctx: &SubtaskContext<'_>) -> Result<Vec<u8>, SubtaskError> {
        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&self.command)
            .env(ENV_SUBTASK_ID, &ctx.subtask.id)
            .env(ENV_SUBTASK_DESCRIPTION, &ctx.subtask.description)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match ctx.main_task {
            Some(main) => command.env(ENV_MAIN_TASK, main),
            None => command.env_remove(ENV_MAIN_TASK),
        };

        let mut child = command.spawn().map_err(|e| {
            SubtaskError::Unavailable(format!("failed to start `{}`: {e}", self.command))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores stdin may close it early.
            if let Err(e) = stdin.write_all(ctx.subtask.description.as_bytes()).await {
                debug!(error = %e, "subtask command did not read stdin");
            }
        }

        let output = child.wait_with_output().await.map_err(|e| {
            SubtaskError::Unavailable(format!("failed waiting for `{}`: {e}", self.command))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SubtaskError::Failed(format!(
                "Error executing task: command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait::async_trait]
impl SubtaskHandler for CommandSubtaskHandler {
    async fn handle(&self, ctx: SubtaskContext<'_>) -> Result<String, SubtaskError> {
        let stdout = self.run_command(&ctx).await?;

        tokio::fs::create_dir_all(&self.results_dir)
            .await
            .map_err(|e| {
                SubtaskError::Failed(format!(
                    "failed to create {}: {e}",
                    self.results_dir.display()
                ))
            })?;
        let path = unique_result_path(&self.results_dir, &ctx.subtask.id);
        tokio::fs::write(&path, &stdout).await.map_err(|e| {
            SubtaskError::Failed(format!("failed to write {}: {e}", path.display()))
        })?;

        debug!(subtask_id = %ctx.subtask.id, path = %path.display(), "subtask result saved");
        Ok(format!(
            "Task executed successfully; result saved to {}",
            path.display()
        ))
    }
}

/// `task_<id>_result.md`, or `task_<id>_result_<n>.md` for the first free `n`.
fn unique_result_path(dir: &Path, subtask_id: &str) -> PathBuf {
    let stem = format!("task_{}_result", sanitize(subtask_id));
    let first = dir.join(format!("{stem}.md"));
    if !first.exists() {
        return first;
    }
    (1..)
        .map(|n| dir.join(format!("{stem}_{n}.md")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(first)
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
