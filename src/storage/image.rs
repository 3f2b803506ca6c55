//! Unpacked images
//!
//! Images are pulled and unpacked by other tooling. The engine only needs
//! an image's root filesystem and its metadata, stored as
//! `<images>/<reference>/rootfs` and `<images>/<reference>/image.json`.

use crate::container::config::ImageMetadata;
use crate::error::{EngineError, Result};
use std::path::PathBuf;

const METADATA_FILE: &str = "image.json";

/// Access to image root filesystems
pub trait ImageMounter: Send + Sync {
    /// Root filesystem of an image, for image volumes and container roots
    fn mount_image(&self, reference: &str) -> Result<PathBuf>;

    /// Image metadata
    fn metadata(&self, reference: &str) -> Result<ImageMetadata>;
}

/// Directory name of an image reference
pub fn image_key(reference: &str) -> String {
    reference
        .chars()
        .map(|c| match c {
            '/' | ':' | '@' => '_',
            c => c,
        })
        .collect()
}

/// Images unpacked under a local directory
#[derive(Debug, Clone)]
pub struct DirectoryImageStore {
    images_dir: PathBuf,
}

impl DirectoryImageStore {
    pub fn new(images_dir: PathBuf) -> Self {
        Self { images_dir }
    }

    /// Directory of an image, by reference or by ID
    fn image_dir(&self, reference: &str) -> Result<PathBuf> {
        let direct = self.images_dir.join(image_key(reference));
        if direct.is_dir() {
            return Ok(direct);
        }
        if self.images_dir.is_dir() {
            for entry in std::fs::read_dir(&self.images_dir)? {
                let dir = entry?.path();
                if let Ok(data) = std::fs::read(dir.join(METADATA_FILE)) {
                    let meta: ImageMetadata = serde_json::from_slice(&data)?;
                    if meta.id == reference || (!meta.id.is_empty() && meta.id.starts_with(reference)) {
                        return Ok(dir);
                    }
                }
            }
        }
        Err(EngineError::Image(format!("image {} not found", reference)))
    }
}

impl ImageMounter for DirectoryImageStore {
    fn mount_image(&self, reference: &str) -> Result<PathBuf> {
        let rootfs = self.image_dir(reference)?.join("rootfs");
        if !rootfs.is_dir() {
            return Err(EngineError::Image(format!(
                "image {} has no root filesystem",
                reference
            )));
        }
        Ok(rootfs)
    }

    fn metadata(&self, reference: &str) -> Result<ImageMetadata> {
        let path = self.image_dir(reference)?.join(METADATA_FILE);
        match std::fs::read(&path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ImageMetadata {
                name: reference.to_string(),
                ..Default::default()
            }),
            Err(e) => Err(e.into()),
        }
    }
}
