//! Engine runtime
//!
//! [`Runtime`] wires the engine's components together and runs every
//! container operation under that container's exclusive lock.

use crate::checkpoint::{
    archive, CheckpointManager, CheckpointOptions, CheckpointReport, DumpEngine, LauncherDumpEngine,
    RestoreOptions, RestoreReport, StatsDecoder,
};
use crate::config::EngineConfig;
use crate::container::config::{ContainerConfig, ImageMetadata};
use crate::container::runtime::Container;
use crate::container::state::{ContainerPhase, ContainerState};
use crate::container::store::{ContainerLookup, StateStore};
use crate::error::{EngineError, Result};
use crate::launcher::{CommandLauncher, Launcher};
use crate::network::{CommandNetworkBackend, NetworkBackend, NetworkManager, PerNetworkOptions};
use crate::platform::{self, Platform};
use crate::prepare::Preparer;
use crate::spec::{EtcHostAccounts, HostAccounts, SpecBuilder};
use crate::storage::{DirectoryImageStore, DirectoryStorage, ImageMounter, LocalVolumeStore, StorageBackend, VolumeStore};
use chrono::Utc;
use oci_spec::runtime::Spec;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Signal used to stop a container that is removed by force
const SIGKILL: u32 = 9;

/// External collaborators of the runtime
pub struct Backends {
    pub network: Arc<dyn NetworkBackend>,
    pub storage: Arc<dyn StorageBackend>,
    pub volumes: Arc<dyn VolumeStore>,
    pub images: Arc<dyn ImageMounter>,
    pub host: Arc<dyn HostAccounts>,
    pub launcher: Arc<dyn Launcher>,
    pub dump: Arc<dyn DumpEngine>,
}

impl Backends {
    /// Backends driving the host's tools as named in `engine`
    pub fn from_config(engine: &EngineConfig, platform: Arc<dyn Platform>) -> Result<Self> {
        let images: Arc<dyn ImageMounter> = Arc::new(DirectoryImageStore::new(engine.images_dir()));
        let launcher_state = engine.run_root.join("launcher");
        Ok(Self {
            network: Arc::new(CommandNetworkBackend::new(
                platform,
                engine.network_plugin_path.clone(),
                engine.network_config_dir.clone(),
            )),
            storage: Arc::new(DirectoryStorage::new(engine.storage_dir(), images.clone())),
            volumes: Arc::new(LocalVolumeStore::new(engine.volumes_dir())?),
            images,
            host: Arc::new(EtcHostAccounts::new(&engine.host_etc_dir)),
            launcher: Arc::new(CommandLauncher::new(engine.launcher_path.clone(), launcher_state.clone())),
            dump: Arc::new(LauncherDumpEngine::new(
                engine.dump_engine_path.clone(),
                engine.launcher_path.clone(),
                launcher_state,
                StatsDecoder::new(engine.stats_decoder_path.clone()),
            )),
        })
    }
}

/// Container engine runtime
pub struct Runtime {
    store: Arc<StateStore>,
    volumes: Arc<dyn VolumeStore>,
    images: Arc<dyn ImageMounter>,
    storage: Arc<dyn StorageBackend>,
    network: Arc<NetworkManager>,
    preparer: Arc<Preparer>,
    specs: Arc<SpecBuilder>,
    launcher: Arc<dyn Launcher>,
    checkpoints: CheckpointManager,
}

impl Runtime {
    /// Assemble a runtime from explicit parts
    pub fn new(engine: EngineConfig, platform: Arc<dyn Platform>, backends: Backends) -> Result<Self> {
        let engine = Arc::new(engine);
        let store = Arc::new(StateStore::new(engine.containers_dir(), engine.run_root.clone())?);
        let network = Arc::new(NetworkManager::new(backends.network, engine.machine_enabled));
        let preparer = Arc::new(Preparer::new(network.clone(), backends.storage.clone(), store.clone()));
        let lookup: Arc<dyn ContainerLookup> = store.clone();
        let specs = Arc::new(SpecBuilder::new(
            engine.clone(),
            platform,
            backends.volumes.clone(),
            backends.images.clone(),
            backends.host,
            lookup,
        ));
        let checkpoints = CheckpointManager::new(
            engine,
            backends.dump,
            backends.launcher.clone(),
            preparer.clone(),
            backends.storage.clone(),
            backends.volumes.clone(),
            specs.clone(),
            store.clone(),
        );
        Ok(Self {
            store,
            volumes: backends.volumes,
            images: backends.images,
            storage: backends.storage,
            network,
            preparer,
            specs,
            launcher: backends.launcher,
            checkpoints,
        })
    }

    /// Runtime for this host, configured by `engine`
    pub fn from_config(engine: EngineConfig) -> Result<Self> {
        let platform = platform::native();
        let backends = Backends::from_config(&engine, platform.clone())?;
        Self::new(engine, platform, backends)
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Load a container by name or ID
    pub fn get(&self, name_or_id: &str) -> Result<Container> {
        self.store.lookup(name_or_id)
    }

    fn image_metadata(&self, config: &ContainerConfig) -> Result<Option<ImageMetadata>> {
        if config.image.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.images.metadata(&config.image)?))
    }

    fn reference_volumes(&self, config: &ContainerConfig) -> Result<()> {
        for volume in &config.named_volumes {
            self.volumes.get_or_create(&volume.name)?;
            self.volumes.add_reference(&volume.name)?;
        }
        Ok(())
    }

    /// Register a new container with its create-time spec
    pub fn create(&self, mut config: ContainerConfig) -> Result<Container> {
        let image = self.image_metadata(&config)?;
        if config.image_id.is_empty() {
            if let Some(image) = &image {
                config.image_id = image.id.clone();
            }
        }
        config.spec = self.specs.base_spec(&config, image.as_ref())?;
        self.reference_volumes(&config)?;
        let container = self.store.add(&config, &ContainerState::default())?;
        tracing::info!("Created container {} ({})", container.name(), container.id());
        Ok(container)
    }

    /// Prepare the container and write its final runtime spec
    async fn prepare_spec(&self, container: &mut Container) -> Result<Spec> {
        self.preparer.prepare(container).await?;
        let spec = self.specs.generate(container)?;
        spec.save(container.config_json_path())?;
        self.store.save(container)?;
        Ok(spec)
    }

    /// Generate the final runtime spec of a container without starting it
    pub async fn spec(&self, name_or_id: &str) -> Result<Spec> {
        let id = self.store.resolve(name_or_id)?;
        let _lock = self.store.lock(&id).await?;
        let mut container = self.store.get(&id)?;
        self.prepare_spec(&mut container).await
    }

    /// Prepare, create and start a container
    pub async fn start(&self, name_or_id: &str) -> Result<Container> {
        let id = self.store.resolve(name_or_id)?;
        let _lock = self.store.lock(&id).await?;
        let mut container = self.store.get(&id)?;
        container.ensure_phase(&[ContainerPhase::Configured, ContainerPhase::Stopped], "start")?;

        if let Err(e) = self.launch(&mut container).await {
            if let Err(cleanup) = self.preparer.cleanup(&mut container).await {
                tracing::warn!("Cleaning up container {} after failed start: {}", id, cleanup);
            }
            return Err(e);
        }
        tracing::info!("Started container {}", id);
        Ok(container)
    }

    async fn launch(&self, container: &mut Container) -> Result<()> {
        self.prepare_spec(container).await?;
        let pid = self.launcher.create(container).await?;
        container.state.pid = Some(pid);
        container.state.phase = ContainerPhase::Created;
        self.store.save(container)?;

        self.launcher.start(container.id()).await?;
        container.state.phase = ContainerPhase::Running;
        container.state.started_at = Some(Utc::now());
        container.state.checkpointed = false;
        container.state.restored = false;
        self.store.save(container)
    }

    /// Release the network and root filesystem of a container that is not running
    pub async fn cleanup(&self, name_or_id: &str) -> Result<()> {
        let id = self.store.resolve(name_or_id)?;
        let _lock = self.store.lock(&id).await?;
        let mut container = self.store.get(&id)?;
        container.ensure_phase(
            &[ContainerPhase::Configured, ContainerPhase::Created, ContainerPhase::Stopped],
            "clean up",
        )?;
        self.preparer.cleanup(&mut container).await
    }

    async fn remove_locked(&self, container: &mut Container, force: bool) -> Result<()> {
        if container.is_in(&[ContainerPhase::Running, ContainerPhase::Created]) {
            if !force {
                return Err(EngineError::state(container.id(), container.state.phase, "remove"));
            }
            self.launcher.kill(container.id(), SIGKILL).await?;
            self.launcher.delete(container.id(), true).await?;
            container.state.phase = ContainerPhase::Stopped;
            container.state.pid = None;
        }
        self.preparer.cleanup(container).await?;
        self.storage.remove(container.id()).await?;
        for volume in &container.config.named_volumes {
            if let Err(e) = self.volumes.remove_reference(&volume.name) {
                tracing::warn!("Releasing volume {} of {}: {}", volume.name, container.id(), e);
            }
        }
        self.store.remove(container.id())?;
        tracing::info!("Removed container {}", container.id());
        Ok(())
    }

    /// Remove a container; a running one only with `force`
    pub async fn remove(&self, name_or_id: &str, force: bool) -> Result<()> {
        let id = self.store.resolve(name_or_id)?;
        let _lock = self.store.lock(&id).await?;
        let mut container = self.store.get(&id)?;
        self.remove_locked(&mut container, force).await
    }

    /// Attach a running container to a network
    pub async fn connect(&self, name_or_id: &str, network: &str, options: PerNetworkOptions) -> Result<()> {
        let id = self.store.resolve(name_or_id)?;
        let _lock = self.store.lock(&id).await?;
        let mut container = self.store.get(&id)?;
        if container.config.networks.contains_key(network) {
            return Err(EngineError::Network(format!(
                "container {} is already configured for network {}",
                id, network
            )));
        }

        let mut stored = options.clone();
        if container.state.net_ns.is_some() {
            self.network.connect(&mut container, network, options).await?;
            if let Some(block) = container.state.network_status.get(network) {
                stored.interface_name = block.interfaces.keys().next().cloned().unwrap_or_default();
            }
        }
        container.config.networks.insert(network.to_string(), stored);
        self.store.update_config(&container)?;
        self.store.save(&container)
    }

    /// Detach a container from a network
    pub async fn disconnect(&self, name_or_id: &str, network: &str) -> Result<()> {
        let id = self.store.resolve(name_or_id)?;
        let _lock = self.store.lock(&id).await?;
        let mut container = self.store.get(&id)?;
        if !container.config.networks.contains_key(network) {
            return Err(EngineError::Network(format!(
                "container {} is not connected to network {}",
                id, network
            )));
        }
        if container.state.network_status.contains_key(network) {
            self.network.disconnect(&mut container, network).await?;
        }
        container.config.networks.remove(network);
        self.store.update_config(&container)?;
        self.store.save(&container)
    }

    /// Checkpoint a running container. Containers created with auto-remove
    /// are removed once their exported checkpoint is written.
    pub async fn checkpoint(
        &self,
        name_or_id: &str,
        options: &CheckpointOptions,
        cancel: &CancellationToken,
    ) -> Result<CheckpointReport> {
        let id = self.store.resolve(name_or_id)?;
        let _lock = self.store.lock(&id).await?;
        let mut container = self.store.get(&id)?;
        let report = self.checkpoints.checkpoint(&mut container, options, cancel).await?;
        if container.config.auto_remove && !options.keep_running && !options.pre_checkpoint {
            self.remove_locked(&mut container, false).await?;
        }
        Ok(report)
    }

    /// Restore a checkpointed container in place
    pub async fn restore(
        &self,
        name_or_id: &str,
        options: &RestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        let id = self.store.resolve(name_or_id)?;
        let _lock = self.store.lock(&id).await?;
        let mut container = self.store.get(&id)?;
        self.checkpoints.restore(&mut container, options, cancel).await
    }

    /// Register the container stored in an exported checkpoint. A new name
    /// also gives the container a new ID.
    fn import_container(&self, archive_path: &Path, name: Option<&str>) -> Result<Container> {
        let data = archive::read_file(archive_path, archive::CONFIG_DUMP_FILE)?;
        let mut config: ContainerConfig = serde_json::from_slice(&data)?;
        if let Some(name) = name {
            config.id = Uuid::new_v4().simple().to_string();
            config.name = name.to_string();
            config.spec.set_hostname(None);
        }
        self.reference_volumes(&config)?;
        let container = self.store.add(&config, &ContainerState::default())?;
        tracing::info!("Imported container {} ({}) from {}", container.name(), container.id(), archive_path.display());
        Ok(container)
    }

    /// Create a container from an exported checkpoint and restore it
    pub async fn restore_from_archive(
        &self,
        options: &RestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        let archive_path = options
            .import
            .as_deref()
            .ok_or_else(|| EngineError::Archive("no checkpoint archive given".to_string()))?;
        let imported = self.import_container(archive_path, options.name.as_deref())?;
        let id = imported.id().to_string();
        let _lock = self.store.lock(&id).await?;
        let mut container = self.store.get(&id)?;
        match self.checkpoints.restore(&mut container, options, cancel).await {
            Ok(report) => Ok(report),
            Err(e) => {
                if let Err(cleanup) = self.remove_locked(&mut container, true).await {
                    tracing::warn!("Removing container {} after failed import: {}", id, cleanup);
                }
                Err(e)
            }
        }
    }
}
