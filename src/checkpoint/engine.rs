//! Dump engine adapter
//!
//! The core checkpoint logic only sees [`DumpEngine`]. The command
//! implementation drives the dump engine through the OCI runtime's
//! `checkpoint` and `restore` subcommands, the way runc and crun expose it.

use super::stats::{DumpStatistics, RestoreStatistics, StatsDecoder};
use crate::error::{EngineError, Result};
use crate::launcher::read_pid_file;
use crate::util::command;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Marker file every complete dump contains
pub const INVENTORY_FILE: &str = "inventory.img";

/// What to dump and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpRequest {
    pub container_id: String,
    /// Image directory receiving the dump
    pub image_path: PathBuf,
    /// Directory for logs and statistics
    pub work_path: PathBuf,
    pub leave_running: bool,
    pub pre_dump: bool,
    /// Parent image directory, relative to `image_path`
    pub parent_path: Option<PathBuf>,
}

/// What to restore from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    pub container_id: String,
    pub bundle: PathBuf,
    pub image_path: PathBuf,
    pub work_path: PathBuf,
    pub pid_file: PathBuf,
}

/// Process checkpoint/restore engine
#[async_trait]
pub trait DumpEngine: Send + Sync {
    /// Engine version as `major * 10000 + minor * 100 + patch`
    async fn version(&self) -> Result<u32>;

    /// Dump a running container
    async fn dump(&self, request: &DumpRequest, cancel: &CancellationToken) -> Result<()>;

    /// Statistics of the last dump written to `work_path`
    async fn dump_statistics(&self, work_path: &Path) -> Result<DumpStatistics>;

    /// Restore a container and return its new PID
    async fn restore(&self, request: &RestoreRequest, cancel: &CancellationToken) -> Result<u32>;

    /// Statistics of the last restore written to `work_path`
    async fn restore_statistics(&self, work_path: &Path) -> Result<RestoreStatistics>;
}

/// Parse `--version` output such as `Version: 3.16.1`
pub fn parse_version(output: &str) -> Result<u32> {
    let version = output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Version:"))
        .map(str::trim)
        .ok_or_else(|| EngineError::Capability(format!("unrecognised dump engine version output: {:?}", output.trim())))?;
    let mut parts = version.split('.').map(|p| p.parse::<u32>());
    let mut next = || -> Result<u32> {
        match parts.next() {
            None => Ok(0),
            Some(Ok(n)) => Ok(n),
            Some(Err(_)) => Err(EngineError::Capability(format!("invalid dump engine version {}", version))),
        }
    };
    let (major, minor, patch) = (next()?, next()?, next()?);
    Ok(major * 10000 + minor * 100 + patch)
}

/// Dump engine reached through the OCI runtime command line
pub struct LauncherDumpEngine {
    engine: PathBuf,
    launcher: PathBuf,
    state_dir: PathBuf,
    decoder: StatsDecoder,
}

impl LauncherDumpEngine {
    pub fn new(engine: PathBuf, launcher: PathBuf, state_dir: PathBuf, decoder: StatsDecoder) -> Self {
        Self {
            engine,
            launcher,
            state_dir,
            decoder,
        }
    }

    pub(crate) fn dump_args(&self, request: &DumpRequest) -> Vec<String> {
        let mut args = vec![
            "--root".to_string(),
            self.state_dir.display().to_string(),
            "checkpoint".to_string(),
            "--image-path".to_string(),
            request.image_path.display().to_string(),
            "--work-path".to_string(),
            request.work_path.display().to_string(),
        ];
        if request.leave_running {
            args.push("--leave-running".to_string());
        }
        if request.pre_dump {
            args.push("--pre-dump".to_string());
        }
        if let Some(parent) = &request.parent_path {
            args.push("--parent-path".to_string());
            args.push(parent.display().to_string());
        }
        args.push(request.container_id.clone());
        args
    }

    pub(crate) fn restore_args(&self, request: &RestoreRequest) -> Vec<String> {
        vec![
            "--root".to_string(),
            self.state_dir.display().to_string(),
            "restore".to_string(),
            "--detach".to_string(),
            "--image-path".to_string(),
            request.image_path.display().to_string(),
            "--work-path".to_string(),
            request.work_path.display().to_string(),
            "--bundle".to_string(),
            request.bundle.display().to_string(),
            "--pid-file".to_string(),
            request.pid_file.display().to_string(),
            request.container_id.clone(),
        ]
    }

    async fn run(&self, args: Vec<String>, cancel: &CancellationToken, what: &str, log: &Path) -> Result<()> {
        let output = command::run(&self.launcher, &args, None, Some(cancel)).await?;
        if !output.success {
            return Err(EngineError::DumpEngine(format!(
                "{} failed (see {}): {}",
                what,
                log.display(),
                output.stderr
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DumpEngine for LauncherDumpEngine {
    async fn version(&self) -> Result<u32> {
        let output = command::run(&self.engine, &["--version".to_string()], None, None)
            .await
            .map_err(|e| EngineError::Capability(format!("{} is not usable: {}", self.engine.display(), e)))?;
        if !output.success {
            return Err(EngineError::Capability(format!(
                "{} --version failed: {}",
                self.engine.display(),
                output.stderr
            )));
        }
        parse_version(&output.stdout_str())
    }

    async fn dump(&self, request: &DumpRequest, cancel: &CancellationToken) -> Result<()> {
        let log = request.work_path.join("dump.log");
        self.run(self.dump_args(request), cancel, "checkpoint", &log).await
    }

    async fn dump_statistics(&self, work_path: &Path) -> Result<DumpStatistics> {
        self.decoder.dump_statistics(work_path).await
    }

    async fn restore(&self, request: &RestoreRequest, cancel: &CancellationToken) -> Result<u32> {
        let log = request.work_path.join("restore.log");
        self.run(self.restore_args(request), cancel, "restore", &log).await?;
        read_pid_file(&request.pid_file)
    }

    async fn restore_statistics(&self, work_path: &Path) -> Result<RestoreStatistics> {
        self.decoder.restore_statistics(work_path).await
    }
}
