//! Network attachment configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Network protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Sctp => write!(f, "sctp"),
        }
    }
}

/// Port mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host address to bind; empty binds all addresses
    #[serde(default)]
    pub host_ip: String,
    pub container_port: u16,
    pub host_port: u16,
    /// Number of consecutive ports
    #[serde(default = "default_range")]
    pub range: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

fn default_range() -> u16 {
    1
}

impl PortMapping {
    /// Create a single-port TCP mapping
    pub fn tcp(host_port: u16, container_port: u16) -> Self {
        Self {
            host_ip: String::new(),
            container_port,
            host_port,
            range: 1,
            protocol: Protocol::Tcp,
        }
    }
}

/// Options for one network a container is attached to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerNetworkOptions {
    /// Requested addresses
    pub static_ips: Vec<IpAddr>,
    /// Requested MAC address
    pub static_mac: Option<String>,
    /// DNS aliases
    pub aliases: Vec<String>,
    /// Interface name inside the container
    pub interface_name: String,
}

/// Everything a network backend needs to set up or tear down a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkOptions {
    pub container_id: String,
    pub container_name: String,
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
    #[serde(default)]
    pub networks: BTreeMap<String, PerNetworkOptions>,
}

/// First `ethN` name not used by any attached network
pub fn free_interface_name(networks: &BTreeMap<String, PerNetworkOptions>) -> Option<String> {
    (0..100_000)
        .map(|i| format!("eth{}", i))
        .find(|name| !networks.values().any(|opts| &opts.interface_name == name))
}

/// Strip host IPs from port mappings when running inside a machine VM.
/// A host IP such as 127.0.0.1 would keep the VM's forwarder from reaching
/// the port.
pub fn machine_port_mappings(ports: &[PortMapping], machine_enabled: bool) -> Vec<PortMapping> {
    if !machine_enabled {
        return ports.to_vec();
    }
    ports
        .iter()
        .cloned()
        .map(|mut port| {
            port.host_ip = String::new();
            port
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_interface_name() {
        let mut networks = BTreeMap::new();
        assert_eq!(free_interface_name(&networks).as_deref(), Some("eth0"));

        networks.insert(
            "a".to_string(),
            PerNetworkOptions { interface_name: "eth0".to_string(), ..Default::default() },
        );
        networks.insert(
            "b".to_string(),
            PerNetworkOptions { interface_name: "eth2".to_string(), ..Default::default() },
        );
        assert_eq!(free_interface_name(&networks).as_deref(), Some("eth1"));
    }

    #[test]
    fn test_machine_port_mappings() {
        let mut port = PortMapping::tcp(8080, 80);
        port.host_ip = "127.0.0.1".to_string();
        let ports = vec![port];

        assert_eq!(machine_port_mappings(&ports, false)[0].host_ip, "127.0.0.1");
        assert_eq!(machine_port_mappings(&ports, true)[0].host_ip, "");
    }

    #[test]
    fn test_port_mapping_defaults() {
        let port: PortMapping =
            serde_json::from_str(r#"{"container_port":80,"host_port":8080}"#).unwrap();
        assert_eq!(port.range, 1);
        assert_eq!(port.protocol, Protocol::Tcp);
    }
}
