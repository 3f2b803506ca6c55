//! Container configuration
//!
//! Everything the caller asked for at create time. A configuration is never
//! mutated once the container exists; the create-time runtime spec derived
//! from it is stored alongside in [`ContainerConfig::spec`].

use crate::network::config::{PerNetworkOptions, PortMapping};
use chrono::{DateTime, Utc};
use oci_spec::runtime::{LinuxNamespaceType, Mount, Spec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use uuid::Uuid;

/// How a namespace kind is provided to the container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum NamespaceMode {
    /// Share the host's namespace
    Host,
    /// Create a new namespace
    #[default]
    Private,
    /// Join the namespace at this path
    Path(PathBuf),
    /// Share the namespace of the pod's infra container
    FromPod,
    /// Share the namespace of another container
    FromContainer(String),
    /// Private network namespace with no interfaces configured
    NoNetwork,
}

impl NamespaceMode {
    pub fn is_host(&self) -> bool {
        matches!(self, NamespaceMode::Host)
    }
}

/// Namespace kinds the engine configures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    Pid,
    Ipc,
    Uts,
    User,
    Cgroup,
    Network,
}

impl NamespaceKind {
    /// All kinds, in the order they are applied
    pub const ALL: [NamespaceKind; 6] = [
        NamespaceKind::Pid,
        NamespaceKind::Ipc,
        NamespaceKind::Uts,
        NamespaceKind::User,
        NamespaceKind::Cgroup,
        NamespaceKind::Network,
    ];

    /// Runtime spec namespace type
    pub fn oci_type(&self) -> LinuxNamespaceType {
        match self {
            NamespaceKind::Pid => LinuxNamespaceType::Pid,
            NamespaceKind::Ipc => LinuxNamespaceType::Ipc,
            NamespaceKind::Uts => LinuxNamespaceType::Uts,
            NamespaceKind::User => LinuxNamespaceType::User,
            NamespaceKind::Cgroup => LinuxNamespaceType::Cgroup,
            NamespaceKind::Network => LinuxNamespaceType::Network,
        }
    }

    /// Name of the namespace file under /proc/<pid>/ns/
    pub fn proc_name(&self) -> &'static str {
        match self {
            NamespaceKind::Pid => "pid",
            NamespaceKind::Ipc => "ipc",
            NamespaceKind::Uts => "uts",
            NamespaceKind::User => "user",
            NamespaceKind::Cgroup => "cgroup",
            NamespaceKind::Network => "net",
        }
    }
}

impl std::fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NamespaceKind::Pid => write!(f, "PID"),
            NamespaceKind::Ipc => write!(f, "IPC"),
            NamespaceKind::Uts => write!(f, "UTS"),
            NamespaceKind::User => write!(f, "user"),
            NamespaceKind::Cgroup => write!(f, "cgroup"),
            NamespaceKind::Network => write!(f, "network"),
        }
    }
}

/// Requested mode for every namespace kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    pub pid: NamespaceMode,
    pub ipc: NamespaceMode,
    pub uts: NamespaceMode,
    pub user: NamespaceMode,
    pub cgroup: NamespaceMode,
    pub net: NamespaceMode,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            pid: NamespaceMode::Private,
            ipc: NamespaceMode::Private,
            uts: NamespaceMode::Private,
            user: NamespaceMode::Host,
            cgroup: NamespaceMode::Private,
            net: NamespaceMode::Private,
        }
    }
}

impl NamespaceConfig {
    /// Mode for a namespace kind
    pub fn mode(&self, kind: NamespaceKind) -> &NamespaceMode {
        match kind {
            NamespaceKind::Pid => &self.pid,
            NamespaceKind::Ipc => &self.ipc,
            NamespaceKind::Uts => &self.uts,
            NamespaceKind::User => &self.user,
            NamespaceKind::Cgroup => &self.cgroup,
            NamespaceKind::Network => &self.net,
        }
    }
}

/// One range of an ID mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMap {
    /// Whether a container ID falls inside this range
    pub fn contains(&self, id: u32) -> bool {
        id >= self.container_id && (id - self.container_id) < self.size
    }
}

/// UID and GID mappings for a user namespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMappings {
    pub uid_map: Vec<IdMap>,
    pub gid_map: Vec<IdMap>,
}

impl IdMappings {
    fn to_host(maps: &[IdMap], id: u32) -> Option<u32> {
        if maps.is_empty() {
            return Some(id);
        }
        maps.iter()
            .find(|m| m.contains(id))
            .map(|m| m.host_id + (id - m.container_id))
    }

    /// Host UID for a container UID
    pub fn host_uid(&self, uid: u32) -> Option<u32> {
        Self::to_host(&self.uid_map, uid)
    }

    /// Host GID for a container GID
    pub fn host_gid(&self, gid: u32) -> Option<u32> {
        Self::to_host(&self.gid_map, gid)
    }
}

/// A named volume attached to the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedVolume {
    pub name: String,
    pub dest: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// A host directory mounted as a copy-on-write overlay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayVolume {
    pub source: PathBuf,
    pub dest: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// An image mounted into the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageVolume {
    pub source: String,
    pub dest: String,
    #[serde(default)]
    pub read_write: bool,
}

/// A secret exposed as a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    /// Target file name or absolute path; defaults to the secret name
    #[serde(default)]
    pub target: Option<String>,
}

/// Pod membership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub hostname: String,
    /// Infra container whose namespaces are shared
    #[serde(default)]
    pub infra_id: Option<String>,
}

/// Image metadata consulted when building the create-time spec
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub id: String,
    pub name: String,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Vec<String>,
}

/// Container configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Unique container ID
    pub id: String,
    /// Container name
    pub name: String,
    /// Image reference
    pub image: String,
    /// Image ID
    pub image_id: String,
    /// Explicit entrypoint; `None` falls back to the image
    pub entrypoint: Option<Vec<String>>,
    /// Explicit command
    pub command: Vec<String>,
    /// Environment
    pub env: BTreeMap<String, String>,
    /// Environment variables filled from secrets (variable -> secret name)
    pub env_secrets: BTreeMap<String, String>,
    /// Working directory
    pub working_dir: String,
    /// Create the working directory if it is missing
    pub create_working_dir: bool,
    /// User spec: name, UID, or "user:group"
    pub user: String,
    /// Additional groups
    pub groups: Vec<String>,
    /// Host users copied into the container's /etc/passwd
    pub host_users: Vec<String>,
    /// Add the invoking (non-root) user to /etc/passwd and /etc/group
    pub add_current_user_passwd_entry: bool,
    /// Manage /etc/passwd and /etc/group at all
    pub passwd: bool,
    /// Custom passwd line template
    pub passwd_entry: Option<String>,
    /// Octal umask
    pub umask: Option<String>,
    /// Explicit mounts
    pub mounts: Vec<Mount>,
    /// Named volumes
    pub named_volumes: Vec<NamedVolume>,
    /// Overlay volumes
    pub overlay_volumes: Vec<OverlayVolume>,
    /// Image volumes
    pub image_volumes: Vec<ImageVolume>,
    /// Namespace modes
    pub namespaces: NamespaceConfig,
    /// User namespace ID mappings
    pub id_mappings: IdMappings,
    /// Device strings (`SRC[:DST][:PERMISSIONS]`)
    pub devices: Vec<String>,
    /// Fully-qualified device-injection names
    pub cdi_devices: Vec<String>,
    /// Hostname override
    pub hostname: String,
    /// Pod membership
    pub pod: Option<PodRef>,
    /// Containers that must exist for this one to run
    pub dependencies: Vec<String>,
    /// Networks and their per-network options
    pub networks: BTreeMap<String, PerNetworkOptions>,
    /// Published ports
    pub port_mappings: Vec<PortMapping>,
    /// Publish every exposed port
    pub publish_exposed_ports: bool,
    /// Nameservers
    pub dns_servers: Vec<IpAddr>,
    /// Search domains
    pub dns_search: Vec<String>,
    /// resolv.conf options
    pub dns_options: Vec<String>,
    /// Extra hosts entries ("name:ip")
    pub host_add: Vec<String>,
    /// Keep the image's resolv.conf
    pub use_image_resolv_conf: bool,
    /// Keep the image's hosts file
    pub use_image_hosts: bool,
    /// Read-only root filesystem
    pub read_only: bool,
    /// Privileged mode
    pub privileged: bool,
    /// Remove the container when it exits
    pub auto_remove: bool,
    /// Run an init process as PID 1
    pub init: bool,
    /// Init binary override
    pub init_path: Option<PathBuf>,
    /// Allocate a terminal
    pub terminal: bool,
    /// OOM score adjustment
    pub oom_score_adj: Option<i32>,
    /// Explicit pids limit
    pub pids_limit: Option<i64>,
    /// Containers whose volumes were copied in
    pub volumes_from: Vec<String>,
    /// User annotations
    pub annotations: BTreeMap<String, String>,
    /// Stop signal
    pub stop_signal: u32,
    /// Timezone ("local" or a zone name)
    pub timezone: Option<String>,
    /// Secrets
    pub secrets: Vec<SecretRef>,
    /// Extra root directories that receive the standard bind mounts
    pub chroot_dirs: Vec<String>,
    /// Hand the notify socket to the container
    pub sd_notify_container: bool,
    /// Log driver
    pub log_driver: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Create-time runtime spec
    pub spec: Spec,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            name: String::new(),
            image: String::new(),
            image_id: String::new(),
            entrypoint: None,
            command: Vec::new(),
            env: BTreeMap::new(),
            env_secrets: BTreeMap::new(),
            working_dir: "/".to_string(),
            create_working_dir: false,
            user: String::new(),
            groups: Vec::new(),
            host_users: Vec::new(),
            add_current_user_passwd_entry: false,
            passwd: true,
            passwd_entry: None,
            umask: None,
            mounts: Vec::new(),
            named_volumes: Vec::new(),
            overlay_volumes: Vec::new(),
            image_volumes: Vec::new(),
            namespaces: NamespaceConfig::default(),
            id_mappings: IdMappings::default(),
            devices: Vec::new(),
            cdi_devices: Vec::new(),
            hostname: String::new(),
            pod: None,
            dependencies: Vec::new(),
            networks: BTreeMap::new(),
            port_mappings: Vec::new(),
            publish_exposed_ports: false,
            dns_servers: Vec::new(),
            dns_search: Vec::new(),
            dns_options: Vec::new(),
            host_add: Vec::new(),
            use_image_resolv_conf: false,
            use_image_hosts: false,
            read_only: false,
            privileged: false,
            auto_remove: false,
            init: false,
            init_path: None,
            terminal: false,
            oom_score_adj: None,
            pids_limit: None,
            volumes_from: Vec::new(),
            annotations: BTreeMap::new(),
            stop_signal: 15,
            timezone: None,
            secrets: Vec::new(),
            chroot_dirs: Vec::new(),
            sd_notify_container: false,
            log_driver: "k8s-file".to_string(),
            created_at: Utc::now(),
            spec: unnamed_spec(),
        }
    }
}

/// Default runtime spec without the library's placeholder hostname
fn unnamed_spec() -> Spec {
    let mut spec = Spec::default();
    spec.set_hostname(None);
    spec
}

impl ContainerConfig {
    /// Create a new container configuration
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            ..Self::default()
        }
    }

    /// Set the command
    pub fn command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    /// Set the entrypoint
    pub fn entrypoint(mut self, entrypoint: Vec<String>) -> Self {
        self.entrypoint = Some(entrypoint);
        self
    }

    /// Add an environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Set the user spec
    pub fn user(mut self, user: &str) -> Self {
        self.user = user.to_string();
        self
    }

    /// Set the working directory
    pub fn working_dir(mut self, dir: &str) -> Self {
        self.working_dir = dir.to_string();
        self
    }

    /// Attach a named volume
    pub fn named_volume(mut self, name: &str, dest: &str, options: &[&str]) -> Self {
        self.named_volumes.push(NamedVolume {
            name: name.to_string(),
            dest: dest.to_string(),
            options: options.iter().map(|o| o.to_string()).collect(),
        });
        self
    }

    /// Connect to a network
    pub fn network(mut self, name: &str, options: PerNetworkOptions) -> Self {
        self.networks.insert(name.to_string(), options);
        self
    }

    /// Add a device string
    pub fn device(mut self, device: &str) -> Self {
        self.devices.push(device.to_string());
        self
    }

    /// Short form of the ID
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }

    /// Whether the engine creates a network namespace of its own
    pub fn creates_net_ns(&self) -> bool {
        matches!(self.namespaces.net, NamespaceMode::Private | NamespaceMode::NoNetwork)
    }

    /// Whether networking is configured by something other than the engine
    pub fn network_disabled(&self) -> bool {
        !matches!(
            self.namespaces.net,
            NamespaceMode::Private | NamespaceMode::FromContainer(_) | NamespaceMode::FromPod
        )
    }

    /// Container whose network namespace is shared, if any
    pub fn net_ns_container(&self) -> Option<&str> {
        match &self.namespaces.net {
            NamespaceMode::FromContainer(id) => Some(id),
            NamespaceMode::FromPod => self.pod.as_ref().and_then(|p| p.infra_id.as_deref()),
            _ => None,
        }
    }

    /// Destinations of named volumes and explicit mounts
    pub fn user_volumes(&self) -> Vec<String> {
        let mut dests: Vec<String> = self.named_volumes.iter().map(|v| v.dest.clone()).collect();
        dests.extend(self.mounts.iter().map(|m| m.destination().to_string_lossy().into_owned()));
        dests
    }
}
