//! resolv.conf generation

use crate::error::Result;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Stub resolver address used by systemd-resolved
const RESOLVED_STUB: &str = "127.0.0.53";
/// Upstream servers file of systemd-resolved
const RESOLVED_UPSTREAM: &str = "/run/systemd/resolve/resolv.conf";

const DEFAULT_V4_SERVERS: [&str; 2] = ["8.8.8.8", "8.8.4.4"];
const DEFAULT_V6_SERVERS: [&str; 2] = ["2001:4860:4860::8888", "2001:4860:4860::8844"];

/// Parsed resolv.conf
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvConf {
    pub nameservers: Vec<String>,
    pub searches: Vec<String>,
    pub options: Vec<String>,
}

impl ResolvConf {
    pub fn parse(content: &str) -> Self {
        let mut conf = Self::default();
        for line in content.lines() {
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("nameserver") => conf.nameservers.extend(fields.next().map(str::to_string)),
                Some("search") | Some("domain") => {
                    conf.searches = fields.map(str::to_string).collect();
                }
                Some("options") => conf.options.extend(fields.map(str::to_string)),
                _ => {}
            }
        }
        conf
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.searches.is_empty() {
            out.push_str(&format!("search {}\n", self.searches.join(" ")));
        }
        for server in &self.nameservers {
            out.push_str(&format!("nameserver {}\n", server));
        }
        if !self.options.is_empty() {
            out.push_str(&format!("options {}\n", self.options.join(" ")));
        }
        out
    }

    fn read(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_localhost(server: &str) -> bool {
    server
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

fn is_ipv6(server: &str) -> bool {
    server
        .parse::<IpAddr>()
        .map(|ip| ip.is_ipv6())
        .unwrap_or(false)
}

/// Inputs for a container's resolv.conf
#[derive(Debug, Clone, Default)]
pub struct ResolvParams {
    /// Host resolv.conf
    pub host_file: PathBuf,
    /// Requested nameservers, in order
    pub nameservers: Vec<String>,
    /// Keep the host's servers after the requested ones
    pub keep_host_servers: bool,
    /// Search domains; `None` uses the host's
    pub searches: Option<Vec<String>>,
    /// Search domains of attached networks, placed before the host's
    pub network_searches: Vec<String>,
    pub options: Vec<String>,
    /// Whether the container has IPv6 connectivity
    pub ipv6_enabled: bool,
}

/// Host servers usable from inside a container
fn host_servers(params: &ResolvParams, host: &ResolvConf) -> Result<Vec<String>> {
    let mut servers = host.nameservers.clone();
    if servers.iter().any(|s| s == RESOLVED_STUB) {
        let upstream = ResolvConf::read(Path::new(RESOLVED_UPSTREAM))?;
        if !upstream.nameservers.is_empty() {
            servers = upstream.nameservers;
        }
    }
    servers.retain(|s| !is_localhost(s));
    if !params.ipv6_enabled {
        servers.retain(|s| !is_ipv6(s));
    }
    Ok(servers)
}

/// Build a container resolv.conf
pub fn generate(params: &ResolvParams) -> Result<ResolvConf> {
    let host = ResolvConf::read(&params.host_file)?;

    let mut nameservers = params.nameservers.clone();
    if nameservers.is_empty() || params.keep_host_servers {
        for server in host_servers(params, &host)? {
            if !nameservers.contains(&server) {
                nameservers.push(server);
            }
        }
    }
    if nameservers.is_empty() {
        nameservers.extend(DEFAULT_V4_SERVERS.iter().map(|s| s.to_string()));
        if params.ipv6_enabled {
            nameservers.extend(DEFAULT_V6_SERVERS.iter().map(|s| s.to_string()));
        }
    }

    let searches = match &params.searches {
        Some(searches) => searches.clone(),
        None => {
            let mut searches = params.network_searches.clone();
            searches.extend(host.searches.iter().filter(|s| !params.network_searches.contains(s)).cloned());
            searches
        }
    };

    let mut options = host.options.clone();
    for option in &params.options {
        if !options.contains(option) {
            options.push(option.clone());
        }
    }

    Ok(ResolvConf {
        nameservers,
        searches,
        options,
    })
}

/// Prepend nameservers to an existing file
pub fn add_nameservers(path: &Path, servers: &[String]) -> Result<()> {
    let mut conf = ResolvConf::read(path)?;
    let mut merged: Vec<String> = servers.to_vec();
    merged.extend(conf.nameservers.into_iter().filter(|s| !servers.contains(s)));
    conf.nameservers = merged;
    std::fs::write(path, conf.render())?;
    Ok(())
}

/// Remove nameservers from an existing file
pub fn remove_nameservers(path: &Path, servers: &[String]) -> Result<()> {
    let mut conf = ResolvConf::read(path)?;
    conf.nameservers.retain(|s| !servers.contains(s));
    std::fs::write(path, conf.render())?;
    Ok(())
}
