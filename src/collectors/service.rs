use crate::collectors::{CommandFailure, ProbeError};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time;
use tracing::{debug, warn};

pub const STATUS_PREFIX: &str = "Service Status: \n";

/// Runs a status command such as `service nginx status` and returns
/// `"Service Status: \n{stdout}"`.
///
/// The command line is split on whitespace; quoting is not understood, so an
/// argument cannot contain spaces.
pub async fn check_service(command_line: &str, timeout: Duration) -> Result<String, ProbeError> {
    let stdout = run_status_command(command_line, timeout).await?;
    Ok(format!("{STATUS_PREFIX}{stdout}"))
}

async fn run_status_command(command_line: &str, timeout: Duration) -> Result<String, ProbeError> {
    let failed = |failure| ProbeError::CommandExecutionFailed {
        command: command_line.to_string(),
        failure,
    };

    let mut argv = command_line.split_whitespace();
    let Some(program) = argv.next() else {
        return Err(failed(CommandFailure::Empty));
    };

    let mut cmd = Command::new(program);
    cmd.args(argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(command = %command_line, timeout = ?timeout, "running service status command");
    let output = match time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            warn!(command = %command_line, error = %err, "service command could not start");
            return Err(failed(CommandFailure::Spawn(err)));
        }
        Err(_elapsed) => {
            warn!(command = %command_line, "service command timeout");
            return Err(failed(CommandFailure::Timeout(timeout)));
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        warn!(
            command = %command_line,
            status = ?output.status.code(),
            "service command exited non-zero"
        );
        return Err(failed(CommandFailure::Exit {
            code: output.status.code(),
            stderr,
        }));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
