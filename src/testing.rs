//! Test doubles for the engine's external collaborators

use crate::checkpoint::engine::{DumpEngine, DumpRequest, RestoreRequest, INVENTORY_FILE};
use crate::checkpoint::stats::{DumpStatistics, RestoreStatistics, STATS_DUMP_FILE, STATS_RESTORE_FILE};
use crate::container::config::ContainerConfig;
use crate::container::runtime::Container;
use crate::container::store::ContainerLookup;
use crate::error::{EngineError, Result};
use crate::launcher::Launcher;
use crate::network::status::{IpNet, NetAddress, NetInterface};
use crate::network::{NetworkBackend, NetworkOptions, NetworkStatus, StatusBlock};
use crate::spec::identity::HostUser;
use crate::spec::HostAccounts;
use crate::storage::{RootfsChanges, StorageBackend};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Lookup that knows no containers
pub struct NoContainers;

impl ContainerLookup for NoContainers {
    fn lookup(&self, name_or_id: &str) -> Result<Container> {
        Err(EngineError::ContainerNotFound(name_or_id.to_string()))
    }
}

/// Host without any known accounts
pub struct NoHostAccounts;

impl HostAccounts for NoHostAccounts {
    fn lookup_user(&self, name_or_uid: &str) -> Result<HostUser> {
        Err(EngineError::Identity(format!("no host user {}", name_or_uid)))
    }

    fn current_user(&self) -> Result<Option<HostUser>> {
        Ok(None)
    }

    fn group_name(&self, _gid: u32) -> Option<String> {
        None
    }
}

/// In-memory network backend handing out 10.89.<network>.<n>/24 addresses
#[derive(Default)]
pub struct FakeNetwork {
    fail_setup: bool,
    created: AtomicUsize,
    next_host: AtomicU32,
    subnets: Mutex<Vec<String>>,
    released: Mutex<Vec<String>>,
    torn_down: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeNetwork {
    pub fn failing_setup() -> Self {
        Self {
            fail_setup: true,
            ..Self::default()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }

    /// Namespace handle and network names of every teardown
    pub fn torn_down(&self) -> Vec<(String, Vec<String>)> {
        self.torn_down.lock().unwrap().clone()
    }

    fn subnet_index(&self, network: &str) -> u8 {
        let mut subnets = self.subnets.lock().unwrap();
        let index = match subnets.iter().position(|n| n == network) {
            Some(index) => index,
            None => {
                subnets.push(network.to_string());
                subnets.len() - 1
            }
        };
        index as u8
    }
}

#[async_trait]
impl NetworkBackend for FakeNetwork {
    async fn create_namespace(&self, container_id: &str) -> Result<String> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("/run/netns/rune-{}", container_id))
    }

    async fn setup(&self, _ns: &str, options: &NetworkOptions) -> Result<NetworkStatus> {
        if self.fail_setup {
            return Err(EngineError::Network("network plugin exited with status 1".to_string()));
        }
        let mut status = NetworkStatus::new();
        for (name, opts) in &options.networks {
            let index = self.subnet_index(name);
            let gateway = IpAddr::V4(Ipv4Addr::new(10, 89, index, 1));
            let ips = if opts.static_ips.is_empty() {
                let host = self.next_host.fetch_add(1, Ordering::SeqCst) + 2;
                vec![IpAddr::V4(Ipv4Addr::new(10, 89, index, host as u8))]
            } else {
                opts.static_ips.clone()
            };
            let mac = opts.static_mac.clone().unwrap_or_else(|| {
                let host = self.next_host.fetch_add(1, Ordering::SeqCst);
                format!("0a:58:0a:59:{:02x}:{:02x}", index, host as u8)
            });
            let interface = if opts.interface_name.is_empty() {
                "eth0".to_string()
            } else {
                opts.interface_name.clone()
            };
            let subnets = ips
                .into_iter()
                .map(|addr| {
                    Ok(NetAddress {
                        ipnet: IpNet::new(addr, if addr.is_ipv4() { 24 } else { 64 })?,
                        gateway: Some(gateway),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let mut interfaces = BTreeMap::new();
            interfaces.insert(interface, NetInterface { mac_address: mac, subnets });
            status.insert(
                name.clone(),
                StatusBlock {
                    interfaces,
                    dns_server_ips: vec![gateway],
                    dns_search_domains: vec!["dns.rune".to_string()],
                },
            );
        }
        Ok(status)
    }

    async fn teardown(&self, ns: &str, options: &NetworkOptions) -> Result<()> {
        self.torn_down
            .lock()
            .unwrap()
            .push((ns.to_string(), options.networks.keys().cloned().collect()));
        Ok(())
    }

    async fn release_namespace(&self, ns: &str) -> Result<()> {
        self.released.lock().unwrap().push(ns.to_string());
        Ok(())
    }
}

/// Storage backend creating empty root filesystems under a directory
pub struct FakeStorage {
    root: PathBuf,
    fail: bool,
    unmounted: Mutex<Vec<String>>,
    changes: Mutex<RootfsChanges>,
}

impl FakeStorage {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            fail: false,
            unmounted: Mutex::new(Vec::new()),
            changes: Mutex::new(RootfsChanges::default()),
        }
    }

    pub fn failing(root: PathBuf) -> Self {
        Self {
            fail: true,
            ..Self::new(root)
        }
    }

    pub fn unmounted(&self) -> Vec<String> {
        self.unmounted.lock().unwrap().clone()
    }

    /// Changes reported for every container from now on
    pub fn set_changes(&self, changes: RootfsChanges) {
        *self.changes.lock().unwrap() = changes;
    }
}

#[async_trait]
impl StorageBackend for FakeStorage {
    async fn mount(&self, config: &ContainerConfig) -> Result<PathBuf> {
        if self.fail {
            return Err(EngineError::Storage(format!("no space left mounting {}", config.id)));
        }
        let rootfs = self.root.join(&config.id).join("rootfs");
        std::fs::create_dir_all(rootfs.join("etc"))?;
        Ok(rootfs)
    }

    async fn unmount(&self, id: &str) -> Result<()> {
        self.unmounted.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn changes(&self, _id: &str) -> Result<RootfsChanges> {
        Ok(self.changes.lock().unwrap().clone())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let dir = self.root.join(id);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Dump engine that writes an inventory marker instead of dumping
pub struct FakeDumpEngine {
    version: u32,
    fail_dump: bool,
    fail_stats: bool,
    dumps: Mutex<Vec<DumpRequest>>,
    restores: Mutex<Vec<RestoreRequest>>,
}

impl Default for FakeDumpEngine {
    fn default() -> Self {
        Self::with_version(31800)
    }
}

impl FakeDumpEngine {
    pub fn with_version(version: u32) -> Self {
        Self {
            version,
            fail_dump: false,
            fail_stats: false,
            dumps: Mutex::new(Vec::new()),
            restores: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_dump() -> Self {
        Self {
            fail_dump: true,
            ..Self::default()
        }
    }

    /// Dumps and restores succeed but their statistics cannot be decoded
    pub fn failing_stats() -> Self {
        Self {
            fail_stats: true,
            ..Self::default()
        }
    }

    pub fn dumps(&self) -> Vec<DumpRequest> {
        self.dumps.lock().unwrap().clone()
    }

    pub fn restores(&self) -> Vec<RestoreRequest> {
        self.restores.lock().unwrap().clone()
    }

    fn read_stats(&self, work_path: &Path, file: &str) -> Result<()> {
        if self.fail_stats {
            return Err(EngineError::Statistics(format!("decoding {} failed", file)));
        }
        if !work_path.join(file).is_file() {
            return Err(EngineError::Statistics(format!("{} not found", file)));
        }
        Ok(())
    }
}

#[async_trait]
impl DumpEngine for FakeDumpEngine {
    async fn version(&self) -> Result<u32> {
        Ok(self.version)
    }

    async fn dump(&self, request: &DumpRequest, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled(format!("checkpoint of {}", request.container_id)));
        }
        if self.fail_dump {
            return Err(EngineError::DumpEngine("criu failed: type NOTIFY errno 0".to_string()));
        }
        std::fs::create_dir_all(&request.image_path)?;
        std::fs::write(request.image_path.join(INVENTORY_FILE), b"inventory")?;
        std::fs::write(request.work_path.join(STATS_DUMP_FILE), b"stats")?;
        self.dumps.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn dump_statistics(&self, work_path: &Path) -> Result<DumpStatistics> {
        self.read_stats(work_path, STATS_DUMP_FILE)?;
        Ok(DumpStatistics {
            frozen_time: 1500,
            pages_written: 42,
            ..Default::default()
        })
    }

    async fn restore(&self, request: &RestoreRequest, _cancel: &CancellationToken) -> Result<u32> {
        if !request.image_path.join(INVENTORY_FILE).is_file() {
            return Err(EngineError::DumpEngine(format!(
                "no images in {}",
                request.image_path.display()
            )));
        }
        std::fs::write(&request.pid_file, b"4321")?;
        std::fs::write(request.work_path.join(STATS_RESTORE_FILE), b"stats")?;
        self.restores.lock().unwrap().push(request.clone());
        Ok(4321)
    }

    async fn restore_statistics(&self, work_path: &Path) -> Result<RestoreStatistics> {
        self.read_stats(work_path, STATS_RESTORE_FILE)?;
        Ok(RestoreStatistics {
            restore_time: 900,
            ..Default::default()
        })
    }
}

/// Launcher that records calls and hands out increasing PIDs
pub struct FakeLauncher {
    checkpoint: bool,
    next_pid: AtomicU32,
    calls: Mutex<Vec<String>>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self {
            checkpoint: true,
            next_pid: AtomicU32::new(1000),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeLauncher {
    pub fn without_checkpoint() -> Self {
        Self {
            checkpoint: false,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    fn name(&self) -> &str {
        "fake"
    }

    async fn supports_checkpoint(&self) -> bool {
        self.checkpoint
    }

    async fn create(&self, container: &Container) -> Result<u32> {
        if !container.config_json_path().is_file() {
            return Err(EngineError::Launcher(format!("{} has no config.json", container.id())));
        }
        self.record(format!("create {}", container.id()));
        Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.record(format!("start {}", id));
        Ok(())
    }

    async fn kill(&self, id: &str, signal: u32) -> Result<()> {
        self.record(format!("kill {} {}", id, signal));
        Ok(())
    }

    async fn delete(&self, id: &str, _force: bool) -> Result<()> {
        self.record(format!("delete {}", id));
        Ok(())
    }
}
