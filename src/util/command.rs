//! Running external tools

use crate::error::{EngineError, Result};
use std::ffi::OsStr;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Run a command to completion. The child is killed when `cancel` fires.
pub async fn run<S: AsRef<OsStr>>(
    program: S,
    args: &[String],
    stdin: Option<&[u8]>,
    cancel: Option<&CancellationToken>,
) -> Result<CommandOutput> {
    let program = program.as_ref();
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!("Running {} {}", program.to_string_lossy(), args.join(" "));
    let mut child = cmd.spawn()?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        match pipe.write_all(input).await {
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e.into()),
            _ => {}
        }
    }

    let wait = child.wait_with_output();
    let output = match cancel {
        Some(token) => tokio::select! {
            output = wait => output?,
            _ = token.cancelled() => {
                return Err(EngineError::Cancelled(program.to_string_lossy().into_owned()));
            }
        },
        None => wait.await?,
    };

    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}
