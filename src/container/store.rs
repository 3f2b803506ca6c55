//! Persistent container store
//!
//! Each container lives in `<root>/containers/<id>/` as two JSON documents:
//! `container.json` (configuration, written once) and `state.json`
//! (rewritten atomically on every save). Mutations of a container are
//! serialized by its per-container lock.

use super::config::ContainerConfig;
use super::runtime::Container;
use super::state::ContainerState;
use crate::error::{EngineError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};

const CONFIG_FILE: &str = "container.json";
const STATE_FILE: &str = "state.json";

/// Read access to other containers, used to resolve dependencies
pub trait ContainerLookup: Send + Sync {
    /// Load a container by ID or name
    fn lookup(&self, name_or_id: &str) -> Result<Container>;
}

/// Container store backed by JSON files
pub struct StateStore {
    /// Directory holding one subdirectory per container
    containers_dir: PathBuf,
    /// Volatile run root
    run_root: PathBuf,
    /// Per-container exclusive locks
    locks: Arc<RwLock<HashMap<String, Arc<Mutex<()>>>>>,
}

impl StateStore {
    /// Create a new store
    pub fn new(containers_dir: PathBuf, run_root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&containers_dir)?;
        Ok(Self {
            containers_dir,
            run_root,
            locks: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Directory holding container records
    pub fn containers_dir(&self) -> &Path {
        &self.containers_dir
    }

    fn record_dir(&self, id: &str) -> PathBuf {
        self.containers_dir.join(id)
    }

    /// Acquire the exclusive lock of a container
    pub async fn lock(&self, id: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self
                .locks
                .write()
                .map_err(|_| EngineError::Lock("Failed to acquire write lock".to_string()))?;
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        Ok(lock.lock_owned().await)
    }

    /// Register a new container
    pub fn add(&self, config: &ContainerConfig, state: &ContainerState) -> Result<Container> {
        let dir = self.record_dir(&config.id);
        if dir.join(CONFIG_FILE).exists() {
            return Err(EngineError::ContainerExists(config.id.clone()));
        }
        if !config.name.is_empty() && self.find_by_name(&config.name)?.is_some() {
            return Err(EngineError::ContainerExists(config.name.clone()));
        }
        std::fs::create_dir_all(&dir)?;
        write_json(&dir.join(CONFIG_FILE), config)?;
        write_json(&dir.join(STATE_FILE), state)?;

        let container = Container::new(
            config.clone(),
            state.clone(),
            &self.containers_dir,
            &self.run_root,
        );
        container.create_dirs()?;
        tracing::debug!("Registered container {}", config.id);
        Ok(container)
    }

    /// Load a container by ID
    pub fn get(&self, id: &str) -> Result<Container> {
        let dir = self.record_dir(id);
        if !dir.join(CONFIG_FILE).exists() {
            return Err(EngineError::ContainerNotFound(id.to_string()));
        }
        let config: ContainerConfig = read_json(&dir.join(CONFIG_FILE))?;
        let state: ContainerState = if dir.join(STATE_FILE).exists() {
            read_json(&dir.join(STATE_FILE))?
        } else {
            ContainerState::default()
        };
        Ok(Container::new(config, state, &self.containers_dir, &self.run_root))
    }

    /// Re-read the state of a container from disk
    pub fn sync(&self, container: &mut Container) -> Result<()> {
        let path = self.record_dir(container.id()).join(STATE_FILE);
        let network_override = container.state.network_override.take();
        container.state = read_json(&path)?;
        container.state.network_override = network_override;
        Ok(())
    }

    /// Persist the state of a container
    pub fn save(&self, container: &Container) -> Result<()> {
        let dir = self.record_dir(container.id());
        if !dir.exists() {
            return Err(EngineError::ContainerNotFound(container.id().to_string()));
        }
        write_json(&dir.join(STATE_FILE), &container.state)
    }

    /// Persist a new configuration generation of a container
    pub fn update_config(&self, container: &Container) -> Result<()> {
        let dir = self.record_dir(container.id());
        if !dir.exists() {
            return Err(EngineError::ContainerNotFound(container.id().to_string()));
        }
        write_json(&dir.join(CONFIG_FILE), &container.config)
    }

    /// Remove a container record and its bundle
    pub fn remove(&self, id: &str) -> Result<()> {
        let dir = self.record_dir(id);
        if !dir.exists() {
            return Err(EngineError::ContainerNotFound(id.to_string()));
        }
        std::fs::remove_dir_all(&dir)?;
        let run_dir = self.run_root.join("containers").join(id);
        if run_dir.exists() {
            std::fs::remove_dir_all(&run_dir)?;
        }
        let mut locks = self
            .locks
            .write()
            .map_err(|_| EngineError::Lock("Failed to acquire write lock".to_string()))?;
        locks.remove(id);
        Ok(())
    }

    /// IDs of all stored containers
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.containers_dir)? {
            let entry = entry?;
            if entry.path().join(CONFIG_FILE).exists() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Find container by name
    pub fn find_by_name(&self, name: &str) -> Result<Option<String>> {
        for id in self.list()? {
            let config: ContainerConfig = read_json(&self.record_dir(&id).join(CONFIG_FILE))?;
            if config.name == name {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Resolve a name or ID to an ID
    pub fn resolve(&self, name_or_id: &str) -> Result<String> {
        if self.record_dir(name_or_id).join(CONFIG_FILE).exists() {
            return Ok(name_or_id.to_string());
        }
        self.find_by_name(name_or_id)?
            .ok_or_else(|| EngineError::ContainerNotFound(name_or_id.to_string()))
    }
}

impl ContainerLookup for StateStore {
    fn lookup(&self, name_or_id: &str) -> Result<Container> {
        let id = self.resolve(name_or_id)?;
        self.get(&id)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read(path)?;
    Ok(serde_json::from_slice(&content)?)
}

/// Write through a temporary file and rename so readers never see a torn file
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let content = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
