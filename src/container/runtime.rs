//! Container entity

use super::config::ContainerConfig;
use super::state::{ContainerPhase, ContainerState};
use crate::error::{EngineError, Result};
use std::path::{Path, PathBuf};

/// Checkpoint image directory inside the bundle
pub const CHECKPOINT_DIR: &str = "checkpoint";
/// Pre-checkpoint image directory inside the bundle
pub const PRE_CHECKPOINT_DIR: &str = "pre-checkpoint";

/// A container: its immutable configuration plus its current state
#[derive(Debug, Clone)]
pub struct Container {
    /// Container configuration
    pub config: ContainerConfig,
    /// Current state
    pub state: ContainerState,
    /// Bundle (static) directory holding config.json and generated files
    bundle: PathBuf,
    /// Volatile run directory
    run_dir: PathBuf,
}

impl Container {
    /// Assemble a container from its parts; `containers_dir` and `run_root`
    /// come from the engine configuration
    pub fn new(
        config: ContainerConfig,
        state: ContainerState,
        containers_dir: &Path,
        run_root: &Path,
    ) -> Self {
        let bundle = containers_dir.join(&config.id).join("userdata");
        let run_dir = run_root.join("containers").join(&config.id);
        Self {
            config,
            state,
            bundle,
            run_dir,
        }
    }

    /// Get container ID
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Get container name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Bundle directory
    pub fn bundle_path(&self) -> &Path {
        &self.bundle
    }

    /// Run directory
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Runtime spec consumed by the launcher
    pub fn config_json_path(&self) -> PathBuf {
        self.bundle.join("config.json")
    }

    /// Checkpoint image directory
    pub fn checkpoint_path(&self) -> PathBuf {
        self.bundle.join(CHECKPOINT_DIR)
    }

    /// Pre-checkpoint image directory
    pub fn pre_checkpoint_path(&self) -> PathBuf {
        self.bundle.join(PRE_CHECKPOINT_DIR)
    }

    /// Mounted root filesystem
    pub fn mountpoint(&self) -> Result<&Path> {
        match (&self.state.mountpoint, self.state.mounted) {
            (Some(path), true) => Ok(path),
            _ => Err(EngineError::Storage(format!(
                "container {} root filesystem is not mounted",
                self.id()
            ))),
        }
    }

    /// Host UID that container root maps to
    pub fn root_uid(&self) -> u32 {
        self.config.id_mappings.host_uid(0).unwrap_or(0)
    }

    /// Host GID that container root maps to
    pub fn root_gid(&self) -> u32 {
        self.config.id_mappings.host_gid(0).unwrap_or(0)
    }

    /// Hostname: spec hostname, then configured hostname, then short ID
    pub fn hostname(&self) -> String {
        if let Some(hostname) = self.config.spec.hostname() {
            if !hostname.is_empty() {
                return hostname.clone();
            }
        }
        if !self.config.hostname.is_empty() {
            return self.config.hostname.clone();
        }
        self.config.short_id().to_string()
    }

    /// Read-only root filesystem
    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    /// Whether the container is in one of `phases`
    pub fn is_in(&self, phases: &[ContainerPhase]) -> bool {
        self.state.is_in(phases)
    }

    /// Fail with a precondition error unless the container is in one of `phases`
    pub fn ensure_phase(&self, phases: &[ContainerPhase], operation: &str) -> Result<()> {
        if self.is_in(phases) {
            Ok(())
        } else {
            Err(EngineError::state(self.id(), self.state.phase, operation))
        }
    }

    /// Create the bundle and run directories
    pub fn create_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.bundle)?;
        std::fs::create_dir_all(&self.run_dir)?;
        Ok(())
    }
}
