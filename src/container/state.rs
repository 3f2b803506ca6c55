//! Persisted container state

use crate::network::config::PerNetworkOptions;
use crate::network::status::NetworkStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerPhase {
    /// Configured but never started
    #[default]
    Configured,
    /// Process created by the launcher but not yet started
    Created,
    /// Running
    Running,
    /// Process has exited or was checkpointed
    Stopped,
}

impl std::fmt::Display for ContainerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerPhase::Configured => write!(f, "configured"),
            ContainerPhase::Created => write!(f, "created"),
            ContainerPhase::Running => write!(f, "running"),
            ContainerPhase::Stopped => write!(f, "stopped"),
        }
    }
}

/// Externally visible lifecycle, folding in the checkpoint flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Configured,
    Running,
    Checkpointed,
    Restored,
    Stopped,
}

/// Destination path inside the container -> host source path.
///
/// Several producers write here (hosts, resolv.conf, identity files,
/// secrets, notify socket). [`BindMounts::insert_if_absent`] keeps an
/// existing entry; [`BindMounts::replace`] overrides it and says so.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BindMounts(BTreeMap<String, PathBuf>);

impl BindMounts {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Add an entry unless the destination is taken. Returns whether it was added.
    pub fn insert_if_absent(&mut self, dest: &str, source: impl Into<PathBuf>) -> bool {
        if self.0.contains_key(dest) {
            tracing::debug!("Bind mount at {} already present, keeping it", dest);
            return false;
        }
        self.0.insert(dest.to_string(), source.into());
        true
    }

    /// Add an entry, overriding any existing one
    pub fn replace(&mut self, dest: &str, source: impl Into<PathBuf>) {
        let source = source.into();
        if let Some(old) = self.0.insert(dest.to_string(), source.clone()) {
            if old != source {
                tracing::debug!(
                    "Bind mount at {} now sourced from {} instead of {}",
                    dest,
                    source.display(),
                    old.display()
                );
            }
        }
    }

    pub fn get(&self, dest: &str) -> Option<&Path> {
        self.0.get(dest).map(PathBuf::as_path)
    }

    pub fn contains(&self, dest: &str) -> bool {
        self.0.contains_key(dest)
    }

    pub fn remove(&mut self, dest: &str) -> Option<PathBuf> {
        self.0.remove(dest)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PathBuf)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Container state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerState {
    /// Lifecycle phase
    pub phase: ContainerPhase,
    /// Root filesystem is mounted
    pub mounted: bool,
    /// Root filesystem mountpoint
    pub mountpoint: Option<PathBuf>,
    /// Standard bind mounts
    pub bind_mounts: BindMounts,
    /// Network namespace handle (path or jail name)
    pub net_ns: Option<String>,
    /// Per-network assignment
    pub network_status: NetworkStatus,
    /// Main process ID
    pub pid: Option<u32>,
    /// Checkpointed and not yet restored
    pub checkpointed: bool,
    pub checkpointed_at: Option<DateTime<Utc>>,
    /// Restored from a checkpoint
    pub restored: bool,
    pub restored_at: Option<DateTime<Utc>>,
    /// Dump engine log of the last checkpoint
    pub checkpoint_log: Option<PathBuf>,
    /// Dump engine log of the last restore
    pub restore_log: Option<PathBuf>,
    /// Checkpoint image directory
    pub checkpoint_path: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Network options overriding the configuration for the next setup
    /// (restore with the previous MAC/IP)
    #[serde(skip)]
    pub network_override: Option<BTreeMap<String, PerNetworkOptions>>,
}

impl ContainerState {
    /// Lifecycle view
    pub fn lifecycle(&self) -> Lifecycle {
        match self.phase {
            ContainerPhase::Configured => Lifecycle::Configured,
            ContainerPhase::Created | ContainerPhase::Running if self.restored => Lifecycle::Restored,
            ContainerPhase::Created | ContainerPhase::Running => Lifecycle::Running,
            ContainerPhase::Stopped if self.checkpointed => Lifecycle::Checkpointed,
            ContainerPhase::Stopped => Lifecycle::Stopped,
        }
    }

    /// Whether the phase is one of `phases`
    pub fn is_in(&self, phases: &[ContainerPhase]) -> bool {
        phases.contains(&self.phase)
    }
}
