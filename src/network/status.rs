//! Network status reported by the backend
//!
//! Per-network name, per-interface name: MAC address, subnets and DNS data.
//! This is what gets persisted in container state and in the checkpoint
//! archive's `network.status` file.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::str::FromStr;

/// An address with its prefix length, serialized as `addr/prefix`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpNet {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl IpNet {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(EngineError::Network(format!(
                "invalid prefix length {} for {}",
                prefix, addr
            )));
        }
        Ok(Self { addr, prefix })
    }
}

impl std::fmt::Display for IpNet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for IpNet {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| EngineError::Network(format!("invalid CIDR address: {}", s)))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| EngineError::Network(format!("invalid IP address: {}", addr)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| EngineError::Network(format!("invalid prefix length: {}", prefix)))?;
        IpNet::new(addr, prefix)
    }
}

impl Serialize for IpNet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpNet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One assigned address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetAddress {
    pub ipnet: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}

/// One interface inside the container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInterface {
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub subnets: Vec<NetAddress>,
}

/// Result of attaching to one network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBlock {
    #[serde(default)]
    pub interfaces: BTreeMap<String, NetInterface>,
    #[serde(default)]
    pub dns_server_ips: Vec<IpAddr>,
    #[serde(default)]
    pub dns_search_domains: Vec<String>,
}

/// Status of every attached network, keyed by network name
pub type NetworkStatus = BTreeMap<String, StatusBlock>;

/// Whether any interface carries an IPv6 address
pub fn has_ipv6(status: &NetworkStatus) -> bool {
    status
        .values()
        .flat_map(|block| block.interfaces.values())
        .flat_map(|iface| iface.subnets.iter())
        .any(|subnet| subnet.ipnet.addr.is_ipv6())
}

/// All container addresses, in network order
pub fn container_ips(status: &NetworkStatus) -> Vec<IpAddr> {
    status
        .values()
        .flat_map(|block| block.interfaces.values())
        .flat_map(|iface| iface.subnets.iter())
        .map(|subnet| subnet.ipnet.addr)
        .collect()
}

/// First gateway of any attached network
pub fn first_gateway(status: &NetworkStatus) -> Option<IpAddr> {
    status
        .values()
        .flat_map(|block| block.interfaces.values())
        .flat_map(|iface| iface.subnets.iter())
        .find_map(|subnet| subnet.gateway)
}
