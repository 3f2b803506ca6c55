//! Low-level process launcher
//!
//! The launcher executes the runtime spec written to a container's bundle.
//! [`CommandLauncher`] drives an OCI runtime command line (runc, crun).

use crate::container::runtime::Container;
use crate::error::{EngineError, Result};
use crate::util::command;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Name of the pid file the launcher writes into the run directory
pub const PID_FILE: &str = "pidfile";

/// Read a pid file written by the launcher
pub fn read_pid_file(path: &Path) -> Result<u32> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Launcher(format!("reading pid file {}: {}", path.display(), e)))?;
    content
        .trim()
        .parse()
        .map_err(|_| EngineError::Launcher(format!("invalid pid file {}: {:?}", path.display(), content.trim())))
}

/// Low-level launcher
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Launcher name, for messages
    fn name(&self) -> &str;

    /// Whether the launcher can checkpoint and restore containers
    async fn supports_checkpoint(&self) -> bool;

    /// Create the container process from the bundle's config.json and
    /// return its PID
    async fn create(&self, container: &Container) -> Result<u32>;

    /// Start a created container
    async fn start(&self, id: &str) -> Result<()>;

    /// Send a signal to the container's main process
    async fn kill(&self, id: &str, signal: u32) -> Result<()>;

    /// Delete the launcher's record of the container
    async fn delete(&self, id: &str, force: bool) -> Result<()>;
}

/// OCI runtime command line
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    path: PathBuf,
    /// Runtime state directory (`--root`)
    state_dir: PathBuf,
}

impl CommandLauncher {
    pub fn new(path: PathBuf, state_dir: PathBuf) -> Self {
        Self { path, state_dir }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Global arguments followed by `args`
    pub(crate) fn args(&self, args: &[&str]) -> Vec<String> {
        let mut all = vec!["--root".to_string(), self.state_dir.display().to_string()];
        all.extend(args.iter().map(|a| a.to_string()));
        all
    }

    async fn run(&self, args: Vec<String>) -> Result<()> {
        let output = command::run(&self.path, &args, None, None)
            .await
            .map_err(|e| EngineError::Launcher(format!("running {}: {}", self.path.display(), e)))?;
        if !output.success {
            return Err(EngineError::Launcher(format!(
                "{} {} failed: {}",
                self.path.display(),
                args.join(" "),
                output.stderr
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Launcher for CommandLauncher {
    fn name(&self) -> &str {
        self.path.file_name().and_then(|n| n.to_str()).unwrap_or("launcher")
    }

    async fn supports_checkpoint(&self) -> bool {
        let args = vec!["checkpoint".to_string(), "--help".to_string()];
        matches!(command::run(&self.path, &args, None, None).await, Ok(output) if output.success)
    }

    async fn create(&self, container: &Container) -> Result<u32> {
        let pid_file = container.run_dir().join(PID_FILE);
        let bundle = container.bundle_path().display().to_string();
        let pid_arg = pid_file.display().to_string();
        self.run(self.args(&["create", "--bundle", &bundle, "--pid-file", &pid_arg, container.id()]))
            .await?;
        read_pid_file(&pid_file)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.run(self.args(&["start", id])).await
    }

    async fn kill(&self, id: &str, signal: u32) -> Result<()> {
        let signal = signal.to_string();
        self.run(self.args(&["kill", id, &signal])).await
    }

    async fn delete(&self, id: &str, force: bool) -> Result<()> {
        if force {
            self.run(self.args(&["delete", "--force", id])).await
        } else {
            self.run(self.args(&["delete", id])).await
        }
    }
}
