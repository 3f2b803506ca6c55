//! Engine-wide configuration
//!
//! A single immutable [`EngineConfig`] value is built at startup and handed
//! to every component that needs limits, paths or DNS defaults. Values that
//! would otherwise come from the process environment (`NOTIFY_SOCKET`,
//! `LISTEN_*`) are captured here once.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default process-count limit applied to new containers
pub const DEFAULT_PIDS_LIMIT: i64 = 2048;

/// Oldest dump engine release able to checkpoint containers (3.16)
pub const MIN_DUMP_ENGINE_VERSION: u32 = 31600;

/// Environment variables handed to socket-activated containers
pub const LISTEN_ENV_KEYS: [&str; 3] = ["LISTEN_PID", "LISTEN_FDS", "LISTEN_FDNAMES"];

/// Cgroup management mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupsMode {
    #[default]
    Enabled,
    Disabled,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Persistent state root (container records, bundles, volumes)
    pub root: PathBuf,
    /// Volatile state root (per-container run directories)
    pub run_root: PathBuf,
    /// Default pids limit; 0 disables it
    pub pids_limit: i64,
    /// Cgroup mode
    pub cgroups: CgroupsMode,
    /// Nameservers added to every container
    pub dns_servers: Vec<String>,
    /// Search domains added to every container
    pub dns_searches: Vec<String>,
    /// resolv.conf options added to every container
    pub dns_options: Vec<String>,
    /// Base hosts file; empty uses the image's own /etc/hosts, "none" disables it
    pub base_hosts_file: String,
    /// Host configuration directory (resolv.conf, localtime, passwd)
    pub host_etc_dir: PathBuf,
    /// Timezone database
    pub zoneinfo_dir: PathBuf,
    /// Where secret payloads live on the host
    pub secrets_dir: PathBuf,
    /// Directories holding device-injection specs
    pub cdi_spec_dirs: Vec<PathBuf>,
    /// Init binary bind-mounted at /dev/init
    pub init_path: Option<PathBuf>,
    /// Low-level launcher binary
    pub launcher_path: PathBuf,
    /// Dump engine binary
    pub dump_engine_path: PathBuf,
    /// Statistics decoder shipped with the dump engine
    pub stats_decoder_path: PathBuf,
    /// Network plugin binary
    pub network_plugin_path: PathBuf,
    /// Network plugin configuration directory
    pub network_config_dir: PathBuf,
    /// Minimum dump engine version
    pub min_dump_engine_version: u32,
    /// Running inside a machine VM; host IPs are stripped from port mappings
    pub machine_enabled: bool,
    /// Captured NOTIFY_SOCKET
    pub notify_socket: Option<String>,
    /// Captured LISTEN_* variables
    pub listen_env: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let root = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("rune-engine");
        let run_root = dirs::runtime_dir()
            .unwrap_or_else(|| PathBuf::from("/run"))
            .join("rune-engine");
        Self::with_roots(root, run_root)
    }
}

impl EngineConfig {
    /// Default configuration rooted at the given directories
    pub fn with_roots(root: impl Into<PathBuf>, run_root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            secrets_dir: root.join("secrets").join("filedriver"),
            root,
            run_root: run_root.into(),
            pids_limit: DEFAULT_PIDS_LIMIT,
            cgroups: CgroupsMode::Enabled,
            dns_servers: Vec::new(),
            dns_searches: Vec::new(),
            dns_options: Vec::new(),
            base_hosts_file: String::new(),
            host_etc_dir: PathBuf::from("/etc"),
            zoneinfo_dir: PathBuf::from("/usr/share/zoneinfo"),
            cdi_spec_dirs: vec![PathBuf::from("/etc/cdi"), PathBuf::from("/var/run/cdi")],
            init_path: None,
            launcher_path: PathBuf::from("runc"),
            dump_engine_path: PathBuf::from("criu"),
            stats_decoder_path: PathBuf::from("crit"),
            network_plugin_path: PathBuf::from("netavark"),
            network_config_dir: PathBuf::from("/etc/containers/networks"),
            min_dump_engine_version: MIN_DUMP_ENGINE_VERSION,
            machine_enabled: false,
            notify_socket: None,
            listen_env: BTreeMap::new(),
        }
    }

    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML; missing keys take their defaults
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Capture `NOTIFY_SOCKET` and `LISTEN_*` from the current process
    pub fn with_process_env(mut self) -> Self {
        self.notify_socket = std::env::var("NOTIFY_SOCKET").ok();
        for key in LISTEN_ENV_KEYS {
            if let Ok(value) = std::env::var(key) {
                self.listen_env.insert(key.to_string(), value);
            }
        }
        self
    }

    /// Directory holding persisted container records
    pub fn containers_dir(&self) -> PathBuf {
        self.root.join("containers")
    }

    /// Directory holding named volumes
    pub fn volumes_dir(&self) -> PathBuf {
        self.root.join("volumes")
    }

    /// Directory holding container root filesystems
    pub fn storage_dir(&self) -> PathBuf {
        self.root.join("storage")
    }

    /// Directory holding unpacked images
    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Whether a default pids limit should be applied
    pub fn default_pids_limit(&self) -> Option<i64> {
        if self.cgroups == CgroupsMode::Disabled || self.pids_limit == 0 {
            None
        } else {
            Some(self.pids_limit)
        }
    }
}
