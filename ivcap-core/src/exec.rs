use std::process::Output;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

/// Seam for the external media tools (ffmpeg, ffprobe).
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
        command.kill_on_drop(true).output().await
    }
}

/// How an external tool invocation went wrong.
#[derive(Debug)]
pub enum CommandOutcome {
    Spawn(std::io::Error),
    TimedOut(Duration),
    Failed { status: Option<i32>, stderr: String },
}

/// Runs `command` under a deadline and requires a zero exit status.
pub async fn run_checked(
    executor: &dyn CommandExecutor,
    command: &mut Command,
    limit: Duration,
) -> Result<Output, CommandOutcome> {
    let output = match timeout(limit, executor.run(command)).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => return Err(CommandOutcome::Spawn(err)),
        Err(_) => return Err(CommandOutcome::TimedOut(limit)),
    };
    if !output.status.success() {
        return Err(CommandOutcome::Failed {
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

/// Program plus arguments, for diagnostics.
pub fn describe(command: &Command) -> String {
    let std = command.as_std();
    let mut parts = vec![std.get_program().to_string_lossy().into_owned()];
    parts.extend(std.get_args().map(|arg| arg.to_string_lossy().into_owned()));
    parts.join(" ")
}
