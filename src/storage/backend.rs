//! Container root filesystems

use super::image::ImageMounter;
use crate::container::config::ContainerConfig;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MANIFEST_FILE: &str = "manifest.json";

/// Paths changed in a root filesystem since it was first mounted, relative
/// to the root
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootfsChanges {
    /// Added or modified
    pub changed: Vec<PathBuf>,
    /// Removed
    pub deleted: Vec<PathBuf>,
}

/// Root filesystem provider
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Mount the container's root filesystem and return the mountpoint
    async fn mount(&self, config: &ContainerConfig) -> Result<PathBuf>;

    /// Unmount the container's root filesystem
    async fn unmount(&self, id: &str) -> Result<()>;

    /// Changes made to the root filesystem
    async fn changes(&self, id: &str) -> Result<RootfsChanges>;

    /// Delete the container's root filesystem
    async fn remove(&self, id: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FileStamp {
    mode: u32,
    size: u64,
    mtime: i64,
    mtime_nsec: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    link: Option<PathBuf>,
}

impl FileStamp {
    fn of(path: &Path) -> Result<Self> {
        let meta = std::fs::symlink_metadata(path)?;
        let link = if meta.file_type().is_symlink() {
            Some(std::fs::read_link(path)?)
        } else {
            None
        };
        Ok(Self {
            mode: meta.mode(),
            size: if meta.is_dir() { 0 } else { meta.size() },
            mtime: if meta.is_dir() { 0 } else { meta.mtime() },
            mtime_nsec: if meta.is_dir() { 0 } else { meta.mtime_nsec() },
            link,
        })
    }
}

type Manifest = BTreeMap<PathBuf, FileStamp>;

fn walk_error(e: walkdir::Error) -> EngineError {
    EngineError::Storage(e.to_string())
}

fn snapshot(root: &Path) -> Result<Manifest> {
    let mut manifest = Manifest::new();
    for entry in walkdir::WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = entry.map_err(walk_error)?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| EngineError::Internal(e.to_string()))?
            .to_path_buf();
        manifest.insert(rel, FileStamp::of(entry.path())?);
    }
    Ok(manifest)
}

/// Copy a directory tree, keeping symlinks and permissions
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in walkdir::WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.map_err(walk_error)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            std::fs::set_permissions(&target, entry.metadata().map_err(walk_error)?.permissions())?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            if target.symlink_metadata().is_ok() {
                std::fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(link, &target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Root filesystems kept as plain directory copies of the image,
/// `<storage>/<id>/rootfs`
pub struct DirectoryStorage {
    storage_dir: PathBuf,
    images: Arc<dyn ImageMounter>,
}

impl DirectoryStorage {
    pub fn new(storage_dir: PathBuf, images: Arc<dyn ImageMounter>) -> Self {
        Self { storage_dir, images }
    }

    /// Root filesystem directory of a container
    pub fn rootfs_path(&self, id: &str) -> PathBuf {
        self.storage_dir.join(id).join("rootfs")
    }

    fn manifest_path(&self, id: &str) -> PathBuf {
        self.storage_dir.join(id).join(MANIFEST_FILE)
    }
}

/// Run filesystem work off the async runtime
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task failed: {}", e)))?
}

#[async_trait]
impl StorageBackend for DirectoryStorage {
    async fn mount(&self, config: &ContainerConfig) -> Result<PathBuf> {
        let rootfs = self.rootfs_path(&config.id);
        let manifest_path = self.manifest_path(&config.id);
        if manifest_path.is_file() {
            tracing::debug!("Root filesystem of {} already present", config.id);
            return Ok(rootfs);
        }

        let source = if config.image.is_empty() {
            None
        } else {
            Some(self.images.mount_image(&config.image)?)
        };
        let target = rootfs.clone();
        blocking(move || {
            match source {
                Some(source) => copy_tree(&source, &target)?,
                None => std::fs::create_dir_all(&target)?,
            }
            let manifest = snapshot(&target)?;
            std::fs::write(&manifest_path, serde_json::to_vec(&manifest)?)?;
            Ok(())
        })
        .await?;
        tracing::debug!("Mounted root filesystem of {} at {}", config.id, rootfs.display());
        Ok(rootfs)
    }

    async fn unmount(&self, id: &str) -> Result<()> {
        tracing::debug!("Unmounted root filesystem of {}", id);
        Ok(())
    }

    async fn changes(&self, id: &str) -> Result<RootfsChanges> {
        let rootfs = self.rootfs_path(id);
        let manifest_path = self.manifest_path(id);
        blocking(move || {
            let data = std::fs::read(&manifest_path).map_err(|e| {
                EngineError::Storage(format!("reading {}: {}", manifest_path.display(), e))
            })?;
            let base: Manifest = serde_json::from_slice(&data)?;
            let current = snapshot(&rootfs)?;

            let changed = current
                .iter()
                .filter(|(path, stamp)| base.get(*path) != Some(*stamp))
                .map(|(path, _)| path.clone())
                .collect();
            let deleted = base
                .keys()
                .filter(|path| !current.contains_key(*path))
                .cloned()
                .collect();
            Ok(RootfsChanges { changed, deleted })
        })
        .await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let dir = self.storage_dir.join(id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }
}
