//! Storage module
//!
//! Container root filesystems, unpacked images and named volumes.

pub mod backend;
pub mod image;
pub mod volume;

pub use backend::{DirectoryStorage, RootfsChanges, StorageBackend};
pub use image::{DirectoryImageStore, ImageMounter};
pub use volume::{LocalVolumeStore, Volume, VolumeStore};
