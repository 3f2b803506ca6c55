//! Checkpoint and restore
//!
//! [`CheckpointManager`] moves containers between the running and the
//! checkpointed state. The caller holds the container's lock for the whole
//! operation. State is only marked checkpointed after the dump engine
//! reported success.

pub mod archive;
pub mod engine;
pub mod stats;

pub use archive::Compression;
pub use engine::{DumpEngine, LauncherDumpEngine};
pub use stats::{DumpStatistics, RestoreStatistics, StatsDecoder};

use crate::config::EngineConfig;
use crate::container::runtime::{Container, CHECKPOINT_DIR, PRE_CHECKPOINT_DIR};
use crate::container::state::ContainerPhase;
use crate::container::store::StateStore;
use crate::error::{EngineError, Result};
use crate::launcher::{Launcher, PID_FILE};
use crate::network::{NetworkStatus, PerNetworkOptions};
use crate::prepare::Preparer;
use crate::spec::SpecBuilder;
use crate::storage::backend::blocking;
use crate::storage::{StorageBackend, Volume, VolumeStore};
use archive::{
    ExportOptions, CONFIG_DUMP_FILE, DELETED_FILES_FILE, DUMP_LOG_FILE, NETWORK_STATUS_FILE,
    RESTORE_LOG_FILE, ROOTFS_DIFF_FILE, SPEC_DUMP_FILE, VOLUMES_DIR,
};
use chrono::Utc;
use engine::{DumpRequest, RestoreRequest, INVENTORY_FILE};
use stats::{STATS_DUMP_FILE, STATS_RESTORE_FILE};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Parent link inside the checkpoint directory, relative so that it
/// survives moving the bundle to another host
const PARENT_LINK: &str = "parent";
const PARENT_TARGET: &str = "../pre-checkpoint";

/// Checkpoint settings
#[derive(Debug, Clone, Default)]
pub struct CheckpointOptions {
    /// Keep the dump engine's log and statistics files
    pub keep: bool,
    /// Leave the container running after the dump
    pub keep_running: bool,
    /// Dump memory only, as the base of a later checkpoint
    pub pre_checkpoint: bool,
    /// Dump on top of an earlier pre-checkpoint
    pub with_previous: bool,
    /// Export the checkpoint to this archive
    pub export: Option<PathBuf>,
    pub compression: Compression,
    pub ignore_rootfs: bool,
    pub ignore_volumes: bool,
    pub print_stats: bool,
}

/// Restore settings
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Keep the checkpoint files after restoring
    pub keep: bool,
    /// Restore from this exported archive
    pub import: Option<PathBuf>,
    /// Pre-checkpoint archive to unpack first
    pub import_previous: Option<PathBuf>,
    /// New container name. The restored container then gets new addresses.
    pub name: Option<String>,
    pub ignore_static_ip: bool,
    pub ignore_static_mac: bool,
    pub ignore_rootfs: bool,
    pub ignore_volumes: bool,
    pub print_stats: bool,
}

/// Result of a checkpoint
#[derive(Debug, Clone)]
pub struct CheckpointReport {
    pub id: String,
    pub statistics: Option<DumpStatistics>,
    /// Time spent in the dump engine
    pub duration: Duration,
}

/// Result of a restore
#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub id: String,
    pub pid: u32,
    pub statistics: Option<RestoreStatistics>,
    /// Time spent in the dump engine
    pub duration: Duration,
}

/// Remove checkpoint leftovers, logging what could not be removed
fn remove_leftovers(bundle: &Path, names: &[&str]) {
    for name in names {
        let path = bundle.join(name);
        let result = match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&path),
            Ok(_) => std::fs::remove_file(&path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::debug!("Unable to remove {}: {}", path.display(), e);
        }
    }
}

/// Per-network options that bring back the addresses in `status`
fn previous_addresses(
    networks: &BTreeMap<String, PerNetworkOptions>,
    status: &NetworkStatus,
    options: &RestoreOptions,
) -> BTreeMap<String, PerNetworkOptions> {
    networks
        .iter()
        .map(|(name, opts)| {
            let mut opts = opts.clone();
            if let Some((interface, iface)) = status.get(name).and_then(|block| block.interfaces.iter().next()) {
                opts.interface_name = interface.clone();
                if !options.ignore_static_mac && !iface.mac_address.is_empty() {
                    opts.static_mac = Some(iface.mac_address.clone());
                }
                if !options.ignore_static_ip {
                    opts.static_ips = iface.subnets.iter().map(|s| s.ipnet.addr).collect();
                }
            }
            (name.clone(), opts)
        })
        .collect()
}

/// Checkpoints and restores containers
pub struct CheckpointManager {
    engine: Arc<EngineConfig>,
    dump: Arc<dyn DumpEngine>,
    launcher: Arc<dyn Launcher>,
    preparer: Arc<Preparer>,
    storage: Arc<dyn StorageBackend>,
    volumes: Arc<dyn VolumeStore>,
    specs: Arc<SpecBuilder>,
    store: Arc<StateStore>,
}

impl CheckpointManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<EngineConfig>,
        dump: Arc<dyn DumpEngine>,
        launcher: Arc<dyn Launcher>,
        preparer: Arc<Preparer>,
        storage: Arc<dyn StorageBackend>,
        volumes: Arc<dyn VolumeStore>,
        specs: Arc<SpecBuilder>,
        store: Arc<StateStore>,
    ) -> Self {
        Self {
            engine,
            dump,
            launcher,
            preparer,
            storage,
            volumes,
            specs,
            store,
        }
    }

    /// Fail with a capability error unless both the dump engine and the
    /// launcher can checkpoint
    pub async fn ensure_supported(&self) -> Result<()> {
        let version = self.dump.version().await?;
        if version < self.engine.min_dump_engine_version {
            return Err(EngineError::Capability(format!(
                "checkpoint/restore requires at least dump engine version {}, found {}",
                self.engine.min_dump_engine_version, version
            )));
        }
        if !self.launcher.supports_checkpoint().await {
            return Err(EngineError::Capability(format!(
                "launcher {} does not support checkpoint/restore",
                self.launcher.name()
            )));
        }
        Ok(())
    }

    fn named_volumes(&self, container: &Container) -> Result<Vec<Volume>> {
        container
            .config
            .named_volumes
            .iter()
            .map(|v| self.volumes.get(&v.name))
            .collect()
    }

    fn check_export(container: &Container) -> Result<()> {
        let infra = container.config.pod.as_ref().and_then(|p| p.infra_id.as_deref());
        let deps = &container.config.dependencies;
        let only_infra = deps.len() == 1 && infra == Some(deps[0].as_str());
        if deps.is_empty() || only_infra {
            return Ok(());
        }
        Err(EngineError::config(
            container.id(),
            "cannot export checkpoints of containers with dependencies",
        ))
    }

    async fn export(&self, container: &Container, options: &CheckpointOptions, target: &Path) -> Result<()> {
        let changes = if options.ignore_rootfs || options.pre_checkpoint {
            None
        } else {
            Some(self.storage.changes(container.id()).await?)
        };
        let volumes = if options.ignore_volumes {
            Vec::new()
        } else {
            self.named_volumes(container)?
        };
        let export = ExportOptions {
            target: target.to_path_buf(),
            compression: options.compression,
            pre_checkpoint: options.pre_checkpoint,
            ignore_rootfs: options.ignore_rootfs,
            ignore_volumes: options.ignore_volumes,
        };
        let ctr = container.clone();
        blocking(move || archive::export(&ctr, &export, changes.as_ref(), &volumes)).await
    }

    /// Checkpoint a running container
    pub async fn checkpoint(
        &self,
        container: &mut Container,
        options: &CheckpointOptions,
        cancel: &CancellationToken,
    ) -> Result<CheckpointReport> {
        self.ensure_supported().await?;
        container.ensure_phase(&[ContainerPhase::Running], "checkpoint")?;
        if container.config.auto_remove && options.export.is_none() {
            return Err(EngineError::config(
                container.id(),
                "cannot checkpoint containers that have been started with auto-remove unless the checkpoint is exported",
            ));
        }
        if options.export.is_some() {
            Self::check_export(container)?;
        }

        let bundle = container.bundle_path().to_path_buf();
        let dump_log = bundle.join(DUMP_LOG_FILE);
        std::fs::File::create(&dump_log)?;
        container.state.checkpoint_log = Some(dump_log);
        container.state.checkpoint_path = Some(container.checkpoint_path());

        let request = DumpRequest {
            container_id: container.id().to_string(),
            image_path: if options.pre_checkpoint {
                container.pre_checkpoint_path()
            } else {
                container.checkpoint_path()
            },
            work_path: bundle.clone(),
            leave_running: options.keep_running || options.pre_checkpoint,
            pre_dump: options.pre_checkpoint,
            parent_path: options.with_previous.then(|| PathBuf::from(PARENT_TARGET)),
        };
        tracing::debug!("Checkpointing container {}", container.id());
        let started = Instant::now();
        self.dump.dump(&request, cancel).await?;
        let duration = started.elapsed();

        std::fs::write(
            bundle.join(NETWORK_STATUS_FILE),
            serde_json::to_vec(&container.state.network_status)?,
        )?;
        if options.with_previous {
            let link = container.checkpoint_path().join(PARENT_LINK);
            if std::fs::symlink_metadata(&link).is_err() {
                std::os::unix::fs::symlink(PARENT_TARGET, &link)?;
            }
        }
        if let Some(target) = &options.export {
            self.export(container, options, target).await?;
        }

        if !options.keep_running && !options.pre_checkpoint {
            container.state.phase = ContainerPhase::Stopped;
            container.state.checkpointed = true;
            container.state.checkpointed_at = Some(Utc::now());
            container.state.restored = false;
            container.state.pid = None;
            self.store.save(container)?;
            self.preparer.cleanup(container).await?;
        }

        // The dump is committed at this point; a statistics failure is
        // reported without undoing it.
        let statistics = if options.print_stats {
            Some(self.dump.dump_statistics(&bundle).await)
        } else {
            None
        };

        if !options.keep && !options.pre_checkpoint {
            remove_leftovers(&bundle, &[DUMP_LOG_FILE, STATS_DUMP_FILE, CONFIG_DUMP_FILE, SPEC_DUMP_FILE]);
            container.state.checkpoint_log = None;
        }

        container.state.finished_at = Some(Utc::now());
        self.store.save(container)?;
        tracing::info!("Checkpointed container {}", container.id());
        let statistics = statistics.transpose()?;
        Ok(CheckpointReport {
            id: container.id().to_string(),
            statistics,
            duration,
        })
    }

    /// Unpack archives into the bundle. Returns whether a checkpoint was
    /// imported.
    async fn import(&self, container: &Container, options: &RestoreOptions) -> Result<bool> {
        let bundle = container.bundle_path().to_path_buf();
        if let Some(previous) = options.import_previous.clone() {
            let dir = bundle.clone();
            blocking(move || archive::import(&previous, &dir, &[])).await?;
        }
        let Some(input) = options.import.clone() else {
            return Ok(false);
        };
        let dir = bundle.clone();
        blocking(move || archive::import(&input, &dir, &[CONFIG_DUMP_FILE, SPEC_DUMP_FILE])).await?;

        let parent = container.checkpoint_path().join(PARENT_LINK);
        if container.pre_checkpoint_path().is_dir() && std::fs::symlink_metadata(&parent).is_err() {
            std::os::unix::fs::symlink(PARENT_TARGET, &parent)?;
        }
        container.config.spec.save(container.config_json_path())?;
        Ok(true)
    }

    /// Restore a checkpointed container
    pub async fn restore(
        &self,
        container: &mut Container,
        options: &RestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        self.ensure_supported().await?;
        let imported = self.import(container, options).await?;
        container.ensure_phase(&[ContainerPhase::Configured, ContainerPhase::Stopped], "restore")?;
        if !container.checkpoint_path().join(INVENTORY_FILE).is_file() {
            return Err(EngineError::CheckpointNotFound(container.id().to_string()));
        }

        let bundle = container.bundle_path().to_path_buf();
        let restore_log = bundle.join(RESTORE_LOG_FILE);
        std::fs::File::create(&restore_log)?;
        container.state.restore_log = Some(restore_log);

        let status_path = bundle.join(NETWORK_STATUS_FILE);
        let keep_addresses = options.name.is_none() && !(options.ignore_static_ip && options.ignore_static_mac);
        if keep_addresses && status_path.is_file() {
            let status: NetworkStatus = serde_json::from_slice(&std::fs::read(&status_path)?)?;
            container.state.network_override = Some(previous_addresses(&container.config.networks, &status, options));
        }

        let mut restored = match self.restore_prepared(container, options, imported, cancel).await {
            Ok(restored) => restored,
            Err(e) => {
                if let Err(cleanup) = self.preparer.cleanup(container).await {
                    tracing::warn!("Cleaning up container {} after failed restore: {}", container.id(), cleanup);
                }
                return Err(e);
            }
        };

        // The process runs again; a statistics failure must not tear it down.
        let statistics = if options.print_stats {
            Some(self.dump.restore_statistics(&bundle).await)
        } else {
            None
        };

        if !options.keep {
            remove_leftovers(
                &bundle,
                &[
                    CHECKPOINT_DIR,
                    PRE_CHECKPOINT_DIR,
                    RESTORE_LOG_FILE,
                    DUMP_LOG_FILE,
                    STATS_DUMP_FILE,
                    STATS_RESTORE_FILE,
                    NETWORK_STATUS_FILE,
                    ROOTFS_DIFF_FILE,
                    DELETED_FILES_FILE,
                    VOLUMES_DIR,
                ],
            );
            container.state.checkpoint_log = None;
            container.state.restore_log = None;
            container.state.checkpoint_path = None;
            self.store.save(container)?;
        }
        tracing::info!("Restored container {}", container.id());
        restored.statistics = statistics.transpose()?;
        Ok(restored)
    }

    async fn restore_prepared(
        &self,
        container: &mut Container,
        options: &RestoreOptions,
        imported: bool,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        self.preparer.prepare(container).await?;
        let spec = self.specs.restore_spec(container, imported)?;
        spec.save(container.config_json_path())?;

        let bundle = container.bundle_path().to_path_buf();
        if imported && !options.ignore_volumes {
            for volume in self.named_volumes(container)? {
                let dir = bundle.clone();
                blocking(move || archive::restore_volume(&dir, &volume)).await?;
            }
        }
        if !options.ignore_rootfs {
            let rootfs = container.mountpoint()?.to_path_buf();
            let dir = bundle.clone();
            blocking(move || archive::apply_rootfs_diff(&dir, &rootfs)).await?;
        }

        let request = RestoreRequest {
            container_id: container.id().to_string(),
            bundle: bundle.clone(),
            image_path: container.checkpoint_path(),
            work_path: bundle,
            pid_file: container.run_dir().join(PID_FILE),
        };
        let started = Instant::now();
        let pid = self.dump.restore(&request, cancel).await?;
        let duration = started.elapsed();

        let now = Utc::now();
        container.state.pid = Some(pid);
        container.state.phase = ContainerPhase::Running;
        container.state.checkpointed = false;
        container.state.restored = true;
        container.state.restored_at = Some(now);
        container.state.started_at = Some(now);
        self.store.save(container)?;
        Ok(RestoreReport {
            id: container.id().to_string(),
            pid,
            statistics: None,
            duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::config::ContainerConfig;
    use crate::container::state::{ContainerState, Lifecycle};
    use crate::container::store::ContainerLookup;
    use crate::network::NetworkManager;
    use crate::storage::{DirectoryImageStore, LocalVolumeStore, RootfsChanges};
    use crate::testing::{FakeDumpEngine, FakeLauncher, FakeNetwork, FakeStorage, NoHostAccounts};
    use std::net::IpAddr;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        dir: TempDir,
        store: Arc<StateStore>,
        volumes: Arc<LocalVolumeStore>,
        network: Arc<FakeNetwork>,
        storage: Arc<FakeStorage>,
        dump: Arc<FakeDumpEngine>,
        preparer: Arc<Preparer>,
        specs: Arc<SpecBuilder>,
        manager: CheckpointManager,
    }

    fn fixture_with(dump: FakeDumpEngine, launcher: FakeLauncher) -> Fixture {
        let dir = tempdir().unwrap();
        let etc = dir.path().join("hostetc");
        std::fs::create_dir_all(&etc).unwrap();
        std::fs::write(etc.join("resolv.conf"), "nameserver 10.0.0.2\n").unwrap();
        let mut config = EngineConfig::with_roots(dir.path().join("root"), dir.path().join("run"));
        config.host_etc_dir = etc;
        config.cdi_spec_dirs = Vec::new();
        let engine = Arc::new(config);

        let store = Arc::new(StateStore::new(engine.containers_dir(), engine.run_root.clone()).unwrap());
        let volumes = Arc::new(LocalVolumeStore::new(engine.volumes_dir()).unwrap());
        let network = Arc::new(FakeNetwork::default());
        let storage = Arc::new(FakeStorage::new(engine.storage_dir()));
        let dump = Arc::new(dump);
        let preparer = Arc::new(Preparer::new(
            Arc::new(NetworkManager::new(network.clone(), false)),
            storage.clone(),
            store.clone(),
        ));
        let lookup: Arc<dyn ContainerLookup> = store.clone();
        let specs = Arc::new(SpecBuilder::new(
            engine.clone(),
            crate::platform::native(),
            volumes.clone(),
            Arc::new(DirectoryImageStore::new(engine.images_dir())),
            Arc::new(NoHostAccounts),
            lookup,
        ));
        let manager = CheckpointManager::new(
            engine,
            dump.clone(),
            Arc::new(launcher),
            preparer.clone(),
            storage.clone(),
            volumes.clone(),
            specs.clone(),
            store.clone(),
        );
        Fixture {
            dir,
            store,
            volumes,
            network,
            storage,
            dump,
            preparer,
            specs,
            manager,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(FakeDumpEngine::default(), FakeLauncher::default())
    }

    impl Fixture {
        /// A running container with one network and one named volume
        async fn running(&self) -> Container {
            self.volumes.create("data").unwrap();
            let mut config = ContainerConfig::new("web", "alpine")
                .command(vec!["sleep".to_string(), "inf".to_string()])
                .named_volume("data", "/data", &[])
                .network("rune", PerNetworkOptions::default());
            config.spec = self.specs.base_spec(&config, None).unwrap();
            let mut ctr = self.store.add(&config, &ContainerState::default()).unwrap();

            self.preparer.prepare(&mut ctr).await.unwrap();
            let spec = self.specs.generate(&mut ctr).unwrap();
            spec.save(ctr.config_json_path()).unwrap();
            ctr.state.phase = ContainerPhase::Running;
            ctr.state.pid = Some(1000);
            self.store.save(&ctr).unwrap();
            ctr
        }
    }

    fn address(ctr: &Container) -> (String, IpAddr) {
        let iface = &ctr.state.network_status["rune"].interfaces["eth0"];
        (iface.mac_address.clone(), iface.subnets[0].ipnet.addr)
    }

    #[tokio::test]
    async fn test_round_trip_keeps_addresses() {
        let fx = fixture();
        let mut ctr = fx.running().await;
        let before = address(&ctr);

        let report = fx
            .manager
            .checkpoint(&mut ctr, &CheckpointOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.statistics.is_none());
        assert_eq!(ctr.state.lifecycle(), Lifecycle::Checkpointed);
        assert!(ctr.state.net_ns.is_none());
        assert!(!ctr.state.mounted);
        assert!(ctr.state.checkpoint_log.is_none());
        assert!(!ctr.bundle_path().join(DUMP_LOG_FILE).exists());
        assert!(ctr.bundle_path().join(NETWORK_STATUS_FILE).is_file());
        assert_eq!(fx.store.get(ctr.id()).unwrap().state.lifecycle(), Lifecycle::Checkpointed);

        let report = fx
            .manager
            .restore(&mut ctr, &RestoreOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.pid, 4321);
        assert_eq!(ctr.state.lifecycle(), Lifecycle::Restored);
        assert!(!ctr.state.checkpointed);
        assert_eq!(address(&ctr), before);
        assert!(ctr.state.network_override.is_none());
        assert!(!ctr.checkpoint_path().exists());
        assert!(ctr.state.checkpoint_path.is_none());

        let saved = fx.store.get(ctr.id()).unwrap();
        assert_eq!(saved.state.pid, Some(4321));
        assert!(saved.state.restored);
    }

    #[tokio::test]
    async fn test_restore_with_new_name_gets_new_addresses() {
        let fx = fixture();
        let mut ctr = fx.running().await;
        let before = address(&ctr);
        fx.manager
            .checkpoint(&mut ctr, &CheckpointOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        let options = RestoreOptions {
            name: Some("web2".to_string()),
            ..Default::default()
        };
        fx.manager.restore(&mut ctr, &options, &CancellationToken::new()).await.unwrap();
        let after = address(&ctr);
        assert_ne!(after.0, before.0);
        assert_ne!(after.1, before.1);
    }

    #[tokio::test]
    async fn test_ignore_static_mac_keeps_ip() {
        let fx = fixture();
        let mut ctr = fx.running().await;
        let before = address(&ctr);
        fx.manager
            .checkpoint(&mut ctr, &CheckpointOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        let options = RestoreOptions {
            ignore_static_mac: true,
            ..Default::default()
        };
        fx.manager.restore(&mut ctr, &options, &CancellationToken::new()).await.unwrap();
        let after = address(&ctr);
        assert_ne!(after.0, before.0);
        assert_eq!(after.1, before.1);
    }

    #[tokio::test]
    async fn test_keep_running_and_stats() {
        let fx = fixture();
        let mut ctr = fx.running().await;
        let options = CheckpointOptions {
            keep: true,
            keep_running: true,
            print_stats: true,
            ..Default::default()
        };
        let report = fx
            .manager
            .checkpoint(&mut ctr, &options, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.statistics.unwrap().pages_written, 42);
        assert_eq!(ctr.state.lifecycle(), Lifecycle::Running);
        assert!(ctr.state.net_ns.is_some());
        assert!(ctr.bundle_path().join(DUMP_LOG_FILE).is_file());
        assert!(fx.dump.dumps()[0].leave_running);
    }

    #[tokio::test]
    async fn test_pre_checkpoint_then_with_previous() {
        let fx = fixture();
        let mut ctr = fx.running().await;
        let pre = CheckpointOptions {
            pre_checkpoint: true,
            ..Default::default()
        };
        fx.manager.checkpoint(&mut ctr, &pre, &CancellationToken::new()).await.unwrap();
        assert_eq!(ctr.state.phase, ContainerPhase::Running);
        assert!(ctr.pre_checkpoint_path().join(INVENTORY_FILE).is_file());

        let full = CheckpointOptions {
            with_previous: true,
            ..Default::default()
        };
        fx.manager.checkpoint(&mut ctr, &full, &CancellationToken::new()).await.unwrap();
        let link = ctr.checkpoint_path().join(PARENT_LINK);
        assert_eq!(std::fs::read_link(link).unwrap(), PathBuf::from(PARENT_TARGET));
        let dumps = fx.dump.dumps();
        assert!(dumps[0].pre_dump);
        assert_eq!(dumps[1].parent_path, Some(PathBuf::from(PARENT_TARGET)));
    }

    #[tokio::test]
    async fn test_export_and_import() {
        let fx = fixture();
        let mut ctr = fx.running().await;
        let volume = fx.volumes.get("data").unwrap();
        std::fs::write(volume.mountpoint.join("rows"), "1,2,3").unwrap();
        let target = fx.dir.path().join("web.tar.gz");

        let options = CheckpointOptions {
            export: Some(target.clone()),
            ..Default::default()
        };
        fx.manager.checkpoint(&mut ctr, &options, &CancellationToken::new()).await.unwrap();
        assert!(target.is_file());

        std::fs::remove_dir_all(ctr.checkpoint_path()).unwrap();
        std::fs::remove_file(volume.mountpoint.join("rows")).unwrap();
        let options = RestoreOptions {
            import: Some(target),
            ..Default::default()
        };
        fx.manager.restore(&mut ctr, &options, &CancellationToken::new()).await.unwrap();
        assert_eq!(std::fs::read_to_string(volume.mountpoint.join("rows")).unwrap(), "1,2,3");

        let spec: serde_json::Value =
            serde_json::from_slice(&std::fs::read(ctr.config_json_path()).unwrap()).unwrap();
        assert_eq!(spec["root"]["path"], ctr.mountpoint().unwrap().display().to_string());
    }

    #[tokio::test]
    async fn test_checkpoint_preconditions() {
        let fx = fixture();
        let mut ctr = fx.running().await;

        ctr.config.auto_remove = true;
        let err = fx
            .manager
            .checkpoint(&mut ctr, &CheckpointOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig { .. }));
        ctr.config.auto_remove = false;

        ctr.config.dependencies = vec!["db".to_string()];
        let options = CheckpointOptions {
            export: Some(fx.dir.path().join("out.tar")),
            ..Default::default()
        };
        assert!(fx.manager.checkpoint(&mut ctr, &options, &CancellationToken::new()).await.is_err());
        ctr.config.dependencies.clear();

        ctr.state.phase = ContainerPhase::Stopped;
        let err = fx
            .manager
            .checkpoint(&mut ctr, &CheckpointOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_capabilities() {
        let fx = fixture_with(FakeDumpEngine::with_version(31500), FakeLauncher::default());
        let mut ctr = fx.running().await;
        let err = fx
            .manager
            .checkpoint(&mut ctr, &CheckpointOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Capability(_)));

        let fx = fixture_with(FakeDumpEngine::default(), FakeLauncher::without_checkpoint());
        let mut ctr = fx.running().await;
        let err = fx
            .manager
            .restore(&mut ctr, &RestoreOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Capability(_)));
    }

    #[tokio::test]
    async fn test_failed_dump_leaves_state_running() {
        let fx = fixture_with(FakeDumpEngine::failing_dump(), FakeLauncher::default());
        let mut ctr = fx.running().await;
        let err = fx
            .manager
            .checkpoint(&mut ctr, &CheckpointOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DumpEngine(_)));
        assert!(!ctr.state.checkpointed);
        assert_eq!(fx.store.get(ctr.id()).unwrap().state.phase, ContainerPhase::Running);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let fx = fixture();
        let mut ctr = fx.running().await;
        let err = fx
            .manager
            .checkpoint(&mut ctr, &CheckpointOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled(_)));
        assert!(!ctr.state.checkpointed);
    }

    #[tokio::test]
    async fn test_restore_without_checkpoint() {
        let fx = fixture();
        let mut ctr = fx.running().await;
        ctr.state.phase = ContainerPhase::Stopped;
        let err = fx
            .manager
            .restore(&mut ctr, &RestoreOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CheckpointNotFound(_)));

        ctr.state.phase = ContainerPhase::Running;
        let err = fx
            .manager
            .restore(&mut ctr, &RestoreOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_failed_restore_cleans_up() {
        let fx = fixture();
        let mut ctr = fx.running().await;
        fx.manager
            .checkpoint(&mut ctr, &CheckpointOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        std::fs::remove_file(ctr.config_json_path()).unwrap();

        let err = fx
            .manager
            .restore(&mut ctr, &RestoreOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CheckpointNotFound(_)));
        assert!(ctr.state.net_ns.is_none());
        assert!(!ctr.state.mounted);
        assert_eq!(fx.network.released().len(), 2);
    }

    #[tokio::test]
    async fn test_checkpoint_tears_down_configured_networks() {
        let fx = fixture();
        let mut ctr = fx.running().await;
        let ns = ctr.state.net_ns.clone().unwrap();
        fx.manager
            .checkpoint(&mut ctr, &CheckpointOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fx.network.torn_down(), vec![(ns.clone(), vec!["rune".to_string()])]);
        assert_eq!(fx.network.released(), vec![ns]);
    }

    #[tokio::test]
    async fn test_stats_failure_after_dump_keeps_checkpoint() {
        let fx = fixture_with(FakeDumpEngine::failing_stats(), FakeLauncher::default());
        let mut ctr = fx.running().await;
        let options = CheckpointOptions {
            print_stats: true,
            ..Default::default()
        };
        let err = fx
            .manager
            .checkpoint(&mut ctr, &options, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Statistics(_)));
        assert_eq!(ctr.state.lifecycle(), Lifecycle::Checkpointed);
        assert!(ctr.state.net_ns.is_none());
        assert!(!ctr.state.mounted);
        assert!(ctr.checkpoint_path().join(INVENTORY_FILE).is_file());
        assert!(ctr.bundle_path().join(NETWORK_STATUS_FILE).is_file());
        let saved = fx.store.get(ctr.id()).unwrap();
        assert_eq!(saved.state.lifecycle(), Lifecycle::Checkpointed);
        assert_eq!(fx.network.released().len(), 1);
    }

    #[tokio::test]
    async fn test_stats_failure_after_restore_keeps_process() {
        let fx = fixture_with(FakeDumpEngine::failing_stats(), FakeLauncher::default());
        let mut ctr = fx.running().await;
        let before = address(&ctr);
        fx.manager
            .checkpoint(&mut ctr, &CheckpointOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        let options = RestoreOptions {
            print_stats: true,
            ..Default::default()
        };
        let err = fx
            .manager
            .restore(&mut ctr, &options, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Statistics(_)));
        assert_eq!(ctr.state.lifecycle(), Lifecycle::Restored);
        assert_eq!(ctr.state.pid, Some(4321));
        assert!(ctr.state.net_ns.is_some());
        assert!(ctr.state.mounted);
        assert_eq!(address(&ctr), before);
        // only the checkpoint released a namespace
        assert_eq!(fx.network.released().len(), 1);
        let saved = fx.store.get(ctr.id()).unwrap();
        assert_eq!(saved.state.phase, ContainerPhase::Running);
        assert!(saved.state.restored);
    }

    #[tokio::test]
    async fn test_restore_stats() {
        let fx = fixture();
        let mut ctr = fx.running().await;
        fx.manager
            .checkpoint(&mut ctr, &CheckpointOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        let options = RestoreOptions {
            print_stats: true,
            ..Default::default()
        };
        let report = fx.manager.restore(&mut ctr, &options, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.statistics.unwrap().restore_time, 900);
        assert!(!ctr.bundle_path().join(STATS_RESTORE_FILE).exists());

        let restores = fx.dump.restores();
        assert_eq!(restores.len(), 1);
        assert_eq!(restores[0].image_path, ctr.checkpoint_path());
        assert_eq!(restores[0].pid_file, ctr.run_dir().join(PID_FILE));
    }

    #[tokio::test]
    async fn test_export_carries_rootfs_changes() {
        let fx = fixture();
        let mut ctr = fx.running().await;
        let rootfs = ctr.mountpoint().unwrap().to_path_buf();
        std::fs::write(rootfs.join("etc/motd"), "welcome").unwrap();
        fx.storage.set_changes(RootfsChanges {
            changed: vec![PathBuf::from("etc/motd")],
            deleted: vec![PathBuf::from("etc/issue")],
        });
        let target = fx.dir.path().join("web.tar");
        let options = CheckpointOptions {
            export: Some(target.clone()),
            compression: Compression::None,
            ..Default::default()
        };
        fx.manager.checkpoint(&mut ctr, &options, &CancellationToken::new()).await.unwrap();

        let deleted: Vec<PathBuf> =
            serde_json::from_slice(&archive::read_file(&target, DELETED_FILES_FILE).unwrap()).unwrap();
        assert_eq!(deleted, vec![PathBuf::from("etc/issue")]);
        assert!(archive::read_file(&target, ROOTFS_DIFF_FILE).is_ok());

        std::fs::remove_dir_all(ctr.checkpoint_path()).unwrap();
        std::fs::remove_file(rootfs.join("etc/motd")).unwrap();
        std::fs::write(rootfs.join("etc/issue"), "old").unwrap();
        let options = RestoreOptions {
            import: Some(target),
            ..Default::default()
        };
        fx.manager.restore(&mut ctr, &options, &CancellationToken::new()).await.unwrap();
        assert_eq!(std::fs::read_to_string(rootfs.join("etc/motd")).unwrap(), "welcome");
        assert!(!rootfs.join("etc/issue").exists());
    }
}
