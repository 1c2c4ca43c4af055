//! Running external tools: structured argv, captured output, hard timeout.

use super::EngineError;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Timeout for `--version` style availability probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Captured output of a successful run.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `cmd` to completion within `timeout`.
///
/// The child is spawned with `kill_on_drop`, so when the timeout fires and
/// the wait future is dropped the process is killed. A non-zero exit is
/// `EngineError::Failed` carrying stderr for the server log.
pub async fn run(tool: &str, mut cmd: Command, timeout: Duration) -> Result<CommandOutput, EngineError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("spawning {}: {:?}", tool, cmd.as_std());
    let child = cmd.spawn().map_err(|source| EngineError::Spawn {
        tool: tool.to_string(),
        source,
    })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            warn!("{} exceeded {:?}, killed", tool, timeout);
            return Err(EngineError::Timeout {
                tool: tool.to_string(),
                after: timeout,
            });
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        warn!("{} exited with {}: {}", tool, output.status, stderr.trim());
        return Err(EngineError::Failed {
            tool: tool.to_string(),
            status: output.status.to_string(),
            stderr: stderr.trim().to_string(),
        });
    }

    if !stderr.trim().is_empty() {
        debug!("{} stderr: {}", tool, stderr.trim());
    }
    Ok(CommandOutput { stdout, stderr })
}

/// Check that `binary` starts and exits cleanly with `version_arg`.
pub async fn probe_binary(tool: &str, binary: &str, version_arg: &str) -> Result<(), EngineError> {
    let mut cmd = Command::new(binary);
    cmd.arg(version_arg);
    run(tool, cmd, PROBE_TIMEOUT).await.map(|_| ())
}

/// Argument list of a command as strings, for logging and tests.
pub fn command_args(cmd: &Command) -> Vec<String> {
    cmd.as_std()
        .get_args()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}
