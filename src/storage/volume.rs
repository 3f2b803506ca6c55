//! Named volumes

use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Metadata file kept next to a volume's data directory
const VOLUME_FILE: &str = "volume.json";

/// A named volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name
    pub name: String,
    /// Directory holding the volume's content
    pub mountpoint: PathBuf,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Number of containers using this volume
    #[serde(default)]
    pub ref_count: u32,
}

impl Volume {
    /// Create a new volume rooted under `base_path`
    pub fn new(name: &str, base_path: &Path) -> Self {
        Self {
            name: name.to_string(),
            mountpoint: base_path.join(name).join("_data"),
            created_at: Utc::now(),
            ref_count: 0,
        }
    }
}

/// Volume storage used when mounting, checkpointing and restoring
pub trait VolumeStore: Send + Sync {
    /// Create a volume
    fn create(&self, name: &str) -> Result<Volume>;

    /// Get a volume by name
    fn get(&self, name: &str) -> Result<Volume>;

    /// Remove a volume; volumes in use need `force`
    fn remove(&self, name: &str, force: bool) -> Result<()>;

    /// Record one more container using the volume
    fn add_reference(&self, name: &str) -> Result<()>;

    /// Record one container fewer using the volume
    fn remove_reference(&self, name: &str) -> Result<()>;

    /// Get a volume, creating it when it does not exist
    fn get_or_create(&self, name: &str) -> Result<Volume> {
        match self.get(name) {
            Err(EngineError::VolumeNotFound(_)) => self.create(name),
            other => other,
        }
    }
}

/// Volumes stored as local directories, `<base>/<name>/_data`
pub struct LocalVolumeStore {
    /// Volumes indexed by name
    volumes: Arc<RwLock<HashMap<String, Volume>>>,
    /// Base path for volume storage
    base_path: PathBuf,
}

impl LocalVolumeStore {
    /// Open the store, loading volumes already on disk
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)?;

        let mut volumes = HashMap::new();
        for entry in std::fs::read_dir(&base_path)? {
            let meta_file = entry?.path().join(VOLUME_FILE);
            if !meta_file.is_file() {
                continue;
            }
            match std::fs::read(&meta_file)
                .map_err(EngineError::from)
                .and_then(|data| Ok(serde_json::from_slice::<Volume>(&data)?))
            {
                Ok(volume) => {
                    volumes.insert(volume.name.clone(), volume);
                }
                Err(e) => tracing::warn!("Skipping volume at {}: {}", meta_file.display(), e),
            }
        }

        Ok(Self {
            volumes: Arc::new(RwLock::new(volumes)),
            base_path,
        })
    }

    fn persist(&self, volume: &Volume) -> Result<()> {
        let path = self.base_path.join(&volume.name).join(VOLUME_FILE);
        std::fs::write(path, serde_json::to_vec_pretty(volume)?)?;
        Ok(())
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        && !name.starts_with('.')
}

impl VolumeStore for LocalVolumeStore {
    fn create(&self, name: &str) -> Result<Volume> {
        if !valid_name(name) {
            return Err(EngineError::Volume(format!("invalid volume name {:?}", name)));
        }
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| EngineError::Lock("Failed to acquire write lock".to_string()))?;

        if volumes.contains_key(name) {
            return Err(EngineError::Volume(format!("Volume {} already exists", name)));
        }

        let volume = Volume::new(name, &self.base_path);
        std::fs::create_dir_all(&volume.mountpoint)?;
        self.persist(&volume)?;
        volumes.insert(name.to_string(), volume.clone());
        tracing::debug!("Created volume {}", name);

        Ok(volume)
    }

    fn get(&self, name: &str) -> Result<Volume> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| EngineError::Lock("Failed to acquire read lock".to_string()))?;

        volumes
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::VolumeNotFound(name.to_string()))
    }

    fn remove(&self, name: &str, force: bool) -> Result<()> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| EngineError::Lock("Failed to acquire write lock".to_string()))?;

        let volume = volumes
            .get(name)
            .ok_or_else(|| EngineError::VolumeNotFound(name.to_string()))?;

        if volume.ref_count > 0 && !force {
            return Err(EngineError::Volume(format!(
                "Volume {} is in use by {} container(s)",
                name, volume.ref_count
            )));
        }

        let dir = self.base_path.join(name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        volumes.remove(name);

        Ok(())
    }

    fn add_reference(&self, name: &str) -> Result<()> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| EngineError::Lock("Failed to acquire write lock".to_string()))?;

        let volume = volumes
            .get_mut(name)
            .ok_or_else(|| EngineError::VolumeNotFound(name.to_string()))?;
        volume.ref_count += 1;
        self.persist(volume)
    }

    fn remove_reference(&self, name: &str) -> Result<()> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| EngineError::Lock("Failed to acquire write lock".to_string()))?;

        let volume = volumes
            .get_mut(name)
            .ok_or_else(|| EngineError::VolumeNotFound(name.to_string()))?;
        volume.ref_count = volume.ref_count.saturating_sub(1);
        self.persist(volume)
    }
}
