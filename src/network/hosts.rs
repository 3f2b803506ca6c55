//! /etc/hosts generation

use crate::error::{EngineError, Result};
use std::net::IpAddr;
use std::path::Path;

/// Name resolving to the host from inside containers
pub const HOST_GATEWAY_NAME: &str = "host.containers.internal";

/// One hosts line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub ip: IpAddr,
    pub names: Vec<String>,
}

impl HostEntry {
    pub fn new(ip: IpAddr, names: &[&str]) -> Self {
        Self {
            ip,
            names: names.iter().map(|n| n.to_string()).collect(),
        }
    }

    fn render(&self) -> String {
        format!("{}\t{}\n", self.ip, self.names.join(" "))
    }
}

/// Parse a `name:ip` extra-host entry
pub fn parse_host_add(entry: &str) -> Result<HostEntry> {
    let (name, ip) = entry
        .split_once(':')
        .ok_or_else(|| EngineError::Network(format!("invalid extra host {}", entry)))?;
    let ip: IpAddr = ip
        .trim_matches(|c| c == '[' || c == ']')
        .parse()
        .map_err(|_| EngineError::Network(format!("invalid IP address in extra host {}", entry)))?;
    Ok(HostEntry {
        ip,
        names: name.split(';').map(str::to_string).collect(),
    })
}

/// Inputs for a container hosts file
#[derive(Debug, Clone, Default)]
pub struct HostsParams {
    /// Existing content to start from
    pub base: String,
    /// `name:ip` entries
    pub extra: Vec<String>,
    /// Container addresses
    pub container_ips: Vec<IpAddr>,
    pub hostname: String,
    pub name: String,
    /// Gateway of the first attached network
    pub gateway: Option<IpAddr>,
}

/// Build hosts file content
pub fn generate(params: &HostsParams) -> Result<String> {
    let mut out = String::new();
    let base = params.base.trim_end();
    let has_localhost = base
        .lines()
        .any(|l| !l.starts_with('#') && l.split_whitespace().skip(1).any(|n| n == "localhost"));
    if !base.is_empty() {
        out.push_str(base);
        out.push('\n');
    }
    if !has_localhost {
        out.push_str("127.0.0.1\tlocalhost localhost.localdomain localhost4 localhost4.localdomain4\n");
        out.push_str("::1\tlocalhost localhost.localdomain localhost6 localhost6.localdomain6\n");
    }

    for extra in &params.extra {
        out.push_str(&parse_host_add(extra)?.render());
    }

    let mut names: Vec<&str> = Vec::new();
    for name in [params.hostname.as_str(), params.name.as_str()] {
        if !name.is_empty() && !names.contains(&name) {
            names.push(name);
        }
    }
    if !names.is_empty() {
        for ip in &params.container_ips {
            out.push_str(&HostEntry::new(*ip, &names).render());
        }
    }

    if let Some(gateway) = params.gateway {
        out.push_str(&HostEntry::new(gateway, &[HOST_GATEWAY_NAME]).render());
    }
    Ok(out)
}

/// Append entries to an existing hosts file
pub fn add_entries(path: &Path, entries: &[HostEntry]) -> Result<()> {
    let mut content = std::fs::read_to_string(path)?;
    for entry in entries {
        content.push_str(&entry.render());
    }
    std::fs::write(path, content)?;
    Ok(())
}

/// Remove every line for the given addresses
pub fn remove_entries(path: &Path, ips: &[IpAddr]) -> Result<()> {
    let content = std::fs::read_to_string(path)?;
    let kept: String = content
        .lines()
        .filter(|line| {
            let ip = line.split_whitespace().next().and_then(|f| f.parse::<IpAddr>().ok());
            !ip.is_some_and(|ip| ips.contains(&ip))
        })
        .map(|line| format!("{}\n", line))
        .collect();
    std::fs::write(path, kept)?;
    Ok(())
}
