//! Network backends
//!
//! A backend creates network namespaces (or vnet jails) and attaches them to
//! networks. The engine only drives it; firewall, bridge and DNS setup are
//! the backend's business.

use super::config::{NetworkOptions, PortMapping};
use super::status::NetworkStatus;
use crate::error::{EngineError, Result};
use crate::platform::{HostCommand, Platform};
use crate::util::command;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Network backend
#[async_trait]
pub trait NetworkBackend: Send + Sync {
    /// Create a network namespace for a container and return its handle
    async fn create_namespace(&self, container_id: &str) -> Result<String>;

    /// Attach the namespace to every network in `options`
    async fn setup(&self, ns: &str, options: &NetworkOptions) -> Result<NetworkStatus>;

    /// Detach the namespace from every network in `options`
    async fn teardown(&self, ns: &str, options: &NetworkOptions) -> Result<()>;

    /// Release a namespace created by [`NetworkBackend::create_namespace`]
    async fn release_namespace(&self, ns: &str) -> Result<()>;

    /// Forward published ports from the machine VM's host
    async fn expose_machine_ports(&self, _ports: &[PortMapping]) -> Result<()> {
        Ok(())
    }

    /// Stop forwarding published ports from the machine VM's host
    async fn unexpose_machine_ports(&self, _ports: &[PortMapping]) -> Result<()> {
        Ok(())
    }
}

/// Backend driving the platform's namespace commands and a network plugin
/// binary that reads options as JSON on stdin and prints the status as JSON.
pub struct CommandNetworkBackend {
    platform: Arc<dyn Platform>,
    plugin: PathBuf,
    config_dir: PathBuf,
}

impl CommandNetworkBackend {
    pub fn new(platform: Arc<dyn Platform>, plugin: PathBuf, config_dir: PathBuf) -> Self {
        Self {
            platform,
            plugin,
            config_dir,
        }
    }

    async fn host_command(cmd: &HostCommand) -> Result<()> {
        let output = command::run(&cmd.program, &cmd.args, None, None)
            .await
            .map_err(|e| EngineError::Network(format!("running {}: {}", cmd.program, e)))?;
        if !output.success {
            return Err(EngineError::Network(format!(
                "{} {} failed: {}",
                cmd.program,
                cmd.args.join(" "),
                output.stderr
            )));
        }
        Ok(())
    }

    async fn plugin(&self, action: &str, ns: &str, options: &NetworkOptions) -> Result<Vec<u8>> {
        let args = vec![
            "--config".to_string(),
            self.config_dir.display().to_string(),
            action.to_string(),
            ns.to_string(),
        ];
        let input = serde_json::to_vec(options)?;
        let output = command::run(&self.plugin, &args, Some(&input), None)
            .await
            .map_err(|e| EngineError::Network(format!("running {}: {}", self.plugin.display(), e)))?;
        if !output.success {
            return Err(EngineError::Network(format!(
                "network {} for {} failed: {}",
                action, options.container_id, output.stderr
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl NetworkBackend for CommandNetworkBackend {
    async fn create_namespace(&self, container_id: &str) -> Result<String> {
        let name = self.platform.net_ns_name(container_id);
        Self::host_command(&self.platform.create_net_ns_command(&name)).await?;
        Ok(self.platform.net_ns_handle(&name))
    }

    async fn setup(&self, ns: &str, options: &NetworkOptions) -> Result<NetworkStatus> {
        let stdout = self.plugin("setup", ns, options).await?;
        serde_json::from_slice(&stdout)
            .map_err(|e| EngineError::Network(format!("decoding network status: {}", e)))
    }

    async fn teardown(&self, ns: &str, options: &NetworkOptions) -> Result<()> {
        self.plugin("teardown", ns, options).await?;
        Ok(())
    }

    async fn release_namespace(&self, ns: &str) -> Result<()> {
        let name = Path::new(ns)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| ns.to_string());
        Self::host_command(&self.platform.release_net_ns_command(&name)).await
    }
}
