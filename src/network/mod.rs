//! Network management module
//!
//! [`NetworkManager`] drives a [`NetworkBackend`] for one container at a
//! time: namespace creation and setup during preparation, teardown during
//! cleanup, and attaching or detaching networks while the container runs.

pub mod backend;
pub mod config;
pub mod hosts;
pub mod resolv;
pub mod status;

pub use backend::{CommandNetworkBackend, NetworkBackend};
pub use config::{NetworkOptions, PerNetworkOptions, PortMapping, Protocol};
pub use status::{NetworkStatus, StatusBlock};

use crate::container::config::NamespaceMode;
use crate::container::runtime::Container;
use crate::error::{EngineError, ErrorAccumulator, Result};
use crate::spec::bind_mounts::{HOSTS, RESOLV_CONF};
use config::{free_interface_name, machine_port_mappings};
use hosts::HostEntry;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Result of creating a container's network namespace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetNsSetup {
    /// Namespace handle
    pub handle: String,
    /// Status of every attached network
    pub status: NetworkStatus,
}

/// Drives network setup for containers
pub struct NetworkManager {
    backend: Arc<dyn NetworkBackend>,
    machine_enabled: bool,
}

impl NetworkManager {
    pub fn new(backend: Arc<dyn NetworkBackend>, machine_enabled: bool) -> Self {
        Self {
            backend,
            machine_enabled,
        }
    }

    /// Networks of a container, with the restore override applied and an
    /// interface name assigned to each
    fn networks(container: &Container) -> BTreeMap<String, PerNetworkOptions> {
        let mut networks = container
            .state
            .network_override
            .clone()
            .unwrap_or_else(|| container.config.networks.clone());
        let names: Vec<String> = networks.keys().cloned().collect();
        for name in names {
            let unnamed = networks
                .get(&name)
                .is_some_and(|opts| opts.interface_name.is_empty());
            if unnamed {
                let iface = free_interface_name(&networks).unwrap_or_default();
                if let Some(opts) = networks.get_mut(&name) {
                    opts.interface_name = iface;
                }
            }
        }
        networks
    }

    /// Options handed to the backend
    pub fn options(&self, container: &Container) -> NetworkOptions {
        NetworkOptions {
            container_id: container.id().to_string(),
            container_name: container.name().to_string(),
            port_mappings: container.config.port_mappings.clone(),
            networks: Self::networks(container),
        }
    }

    fn configures_networks(container: &Container) -> bool {
        !container.config.network_disabled()
            && container.config.namespaces.net != NamespaceMode::NoNetwork
    }

    /// Create the container's network namespace and attach its networks.
    /// On failure the namespace is released again.
    pub async fn create_net_ns(&self, container: &Container) -> Result<NetNsSetup> {
        let handle = self.backend.create_namespace(container.id()).await?;
        tracing::debug!("Created network namespace {} for {}", handle, container.id());

        let options = self.options(container);
        if !Self::configures_networks(container) || options.networks.is_empty() {
            return Ok(NetNsSetup {
                handle,
                status: NetworkStatus::new(),
            });
        }

        let ports = machine_port_mappings(&options.port_mappings, self.machine_enabled);
        let result = async {
            if self.machine_enabled {
                self.backend.expose_machine_ports(&ports).await?;
            }
            self.backend.setup(&handle, &options).await
        }
        .await;

        match result {
            Ok(status) => Ok(NetNsSetup { handle, status }),
            Err(err) => {
                let mut errors = ErrorAccumulator::new(format!("cleaning up network of {}", container.id()));
                errors.push(err);
                if self.machine_enabled {
                    errors.record(self.backend.unexpose_machine_ports(&ports).await);
                }
                errors.record(self.backend.release_namespace(&handle).await);
                Err(errors.finish().err().unwrap_or_else(|| {
                    EngineError::Internal("network setup failed without an error".to_string())
                }))
            }
        }
    }

    /// Detach every network and release the namespace. Unexposing machine
    /// ports is best-effort.
    pub async fn teardown(&self, container: &Container) -> Result<()> {
        let handle = match &container.state.net_ns {
            Some(handle) => handle.clone(),
            None => return Ok(()),
        };
        let options = self.options(container);
        let mut errors = ErrorAccumulator::new(format!("tearing down network of {}", container.id()));

        if Self::configures_networks(container) && !options.networks.is_empty() {
            errors.record(self.backend.teardown(&handle, &options).await);
            if self.machine_enabled {
                let ports = machine_port_mappings(&options.port_mappings, true);
                if let Err(e) = self.backend.unexpose_machine_ports(&ports).await {
                    tracing::warn!("Failed to unexpose ports of {}: {}", container.id(), e);
                }
            }
        }
        errors.record(self.backend.release_namespace(&handle).await);
        errors.finish()
    }

    /// Attach a running container to one more network
    pub async fn connect(
        &self,
        container: &mut Container,
        network: &str,
        mut opts: PerNetworkOptions,
    ) -> Result<()> {
        let handle = container.state.net_ns.clone().ok_or_else(|| {
            EngineError::Network(format!("container {} has no network namespace", container.id()))
        })?;
        if container.state.network_status.contains_key(network) {
            return Err(EngineError::Network(format!(
                "container {} is already connected to network {}",
                container.id(),
                network
            )));
        }
        if opts.interface_name.is_empty() {
            opts.interface_name = free_interface_name(&Self::networks(container)).unwrap_or_default();
        }

        let options = NetworkOptions {
            container_id: container.id().to_string(),
            container_name: container.name().to_string(),
            port_mappings: Vec::new(),
            networks: BTreeMap::from([(network.to_string(), opts)]),
        };
        let status = self.backend.setup(&handle, &options).await?;
        let block = status.get(network).cloned().unwrap_or_default();
        container.state.network_status.insert(network.to_string(), block.clone());

        // A v6 server is usable as soon as any interface, including the new
        // one, has a v6 address.
        let ipv6 = status::has_ipv6(&container.state.network_status);
        let servers: Vec<String> = block
            .dns_server_ips
            .iter()
            .filter(|ip| ip.is_ipv4() || ipv6)
            .map(|ip| ip.to_string())
            .collect();
        if let Some(path) = container.state.bind_mounts.get(RESOLV_CONF) {
            if !servers.is_empty() && path.starts_with(container.run_dir()) {
                resolv::add_nameservers(path, &servers)?;
            }
        }

        let single = NetworkStatus::from([(network.to_string(), block)]);
        let hostname = container.hostname();
        let names: Vec<&str> = vec![hostname.as_str(), container.name()];
        let entries: Vec<HostEntry> = status::container_ips(&single)
            .into_iter()
            .map(|ip| HostEntry::new(ip, &names))
            .collect();
        if let Some(path) = container.state.bind_mounts.get(HOSTS) {
            if !entries.is_empty() && path.starts_with(container.run_dir()) {
                hosts::add_entries(path, &entries)?;
            }
        }
        tracing::info!("Connected container {} to network {}", container.id(), network);
        Ok(())
    }

    /// Detach a running container from a network
    pub async fn disconnect(&self, container: &mut Container, network: &str) -> Result<()> {
        let handle = container.state.net_ns.clone().ok_or_else(|| {
            EngineError::Network(format!("container {} has no network namespace", container.id()))
        })?;
        let block = container.state.network_status.get(network).cloned().ok_or_else(|| {
            EngineError::Network(format!(
                "container {} is not connected to network {}",
                container.id(),
                network
            ))
        })?;

        let mut opts = Self::networks(container).remove(network).unwrap_or_default();
        if opts.interface_name.is_empty() {
            opts.interface_name = block.interfaces.keys().next().cloned().unwrap_or_default();
        }
        let options = NetworkOptions {
            container_id: container.id().to_string(),
            container_name: container.name().to_string(),
            port_mappings: Vec::new(),
            networks: BTreeMap::from([(network.to_string(), opts)]),
        };
        self.backend.teardown(&handle, &options).await?;
        container.state.network_status.remove(network);

        let servers: Vec<String> = block.dns_server_ips.iter().map(|ip| ip.to_string()).collect();
        if let Some(path) = container.state.bind_mounts.get(RESOLV_CONF) {
            if !servers.is_empty() && path.starts_with(container.run_dir()) {
                resolv::remove_nameservers(path, &servers)?;
            }
        }
        let single = NetworkStatus::from([(network.to_string(), block)]);
        let ips = status::container_ips(&single);
        if let Some(path) = container.state.bind_mounts.get(HOSTS) {
            if !ips.is_empty() && path.starts_with(container.run_dir()) {
                hosts::remove_entries(path, &ips)?;
            }
        }
        tracing::info!("Disconnected container {} from network {}", container.id(), network);
        Ok(())
    }
}
