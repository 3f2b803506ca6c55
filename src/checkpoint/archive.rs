//! Checkpoint archives
//!
//! An exported checkpoint is a tar archive (optionally gzip compressed) of
//! files from the container's bundle:
//!
//! ```text
//! checkpoint/ or pre-checkpoint/   dump engine images
//! artifacts/                       extra files the dump engine left
//! config.dump                      container configuration (JSON)
//! spec.dump                        runtime spec (JSON)
//! network.status                   network status (JSON)
//! stats-dump                       raw dump statistics
//! ctr.log                          container log for file log drivers
//! rootfs-diff.tar                  changed root filesystem files
//! deleted.files                    removed root filesystem paths (JSON)
//! volumes/<name>.tar               named volume contents, uncompressed
//! ```

use super::stats::STATS_DUMP_FILE;
use crate::container::runtime::{Container, CHECKPOINT_DIR, PRE_CHECKPOINT_DIR};
use crate::error::{EngineError, Result};
use crate::storage::{RootfsChanges, Volume};
use crate::util::secure_join;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

pub const CONFIG_DUMP_FILE: &str = "config.dump";
pub const SPEC_DUMP_FILE: &str = "spec.dump";
pub const NETWORK_STATUS_FILE: &str = "network.status";
pub const ROOTFS_DIFF_FILE: &str = "rootfs-diff.tar";
pub const DELETED_FILES_FILE: &str = "deleted.files";
pub const VOLUMES_DIR: &str = "volumes";
pub const ARTIFACTS_DIR: &str = "artifacts";
pub const CONTAINER_LOG_FILE: &str = "ctr.log";
pub const DUMP_LOG_FILE: &str = "dump.log";
pub const RESTORE_LOG_FILE: &str = "restore.log";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Log drivers whose log file travels with the checkpoint
const FILE_LOG_DRIVERS: [&str; 2] = ["k8s-file", "json-file"];

/// Archive compression
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    None,
    #[default]
    Gzip,
}

impl std::str::FromStr for Compression {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            other => Err(EngineError::Archive(format!("unsupported compression {}", other))),
        }
    }
}

/// Export settings
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub target: PathBuf,
    pub compression: Compression,
    pub pre_checkpoint: bool,
    pub ignore_rootfs: bool,
    pub ignore_volumes: bool,
}

fn archive_error(what: &str, path: &Path, e: impl std::fmt::Display) -> EngineError {
    EngineError::Archive(format!("{} {}: {}", what, path.display(), e))
}

/// Write the changed files of the root filesystem as `rootfs-diff.tar` and
/// the removed paths as `deleted.files`
fn write_rootfs_diff(bundle: &Path, rootfs: &Path, changes: &RootfsChanges) -> Result<()> {
    let diff_path = bundle.join(ROOTFS_DIFF_FILE);
    let file = File::create(&diff_path)?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);
    for rel in &changes.changed {
        let full = rootfs.join(rel);
        let meta = match std::fs::symlink_metadata(&full) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        let added = if meta.is_dir() {
            builder.append_dir(rel, &full)
        } else {
            builder.append_path_with_name(&full, rel)
        };
        added.map_err(|e| archive_error("adding to root filesystem diff", &full, e))?;
    }
    builder.finish().map_err(|e| archive_error("writing", &diff_path, e))?;

    if !changes.deleted.is_empty() {
        std::fs::write(bundle.join(DELETED_FILES_FILE), serde_json::to_vec(&changes.deleted)?)?;
    }
    tracing::debug!(
        "Root filesystem diff: {} changed, {} deleted",
        changes.changed.len(),
        changes.deleted.len()
    );
    Ok(())
}

/// Store each volume as `volumes/<name>.tar`
fn write_volumes(bundle: &Path, volumes: &[Volume]) -> Result<()> {
    let dir = bundle.join(VOLUMES_DIR);
    std::fs::create_dir_all(&dir)?;
    for volume in volumes {
        let path = dir.join(format!("{}.tar", volume.name));
        let mut builder = tar::Builder::new(File::create(&path)?);
        builder.follow_symlinks(false);
        builder
            .append_dir_all(".", &volume.mountpoint)
            .map_err(|e| archive_error("archiving volume", &volume.mountpoint, e))?;
        builder.finish().map_err(|e| archive_error("writing", &path, e))?;
    }
    Ok(())
}

fn append_entries<W: Write>(builder: &mut tar::Builder<W>, bundle: &Path, entries: &[&str]) -> Result<()> {
    for name in entries {
        let path = bundle.join(name);
        let meta = match std::fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        let added = if meta.is_dir() {
            builder.append_dir_all(name, &path)
        } else {
            builder.append_path_with_name(&path, name)
        };
        added.map_err(|e| archive_error("adding", &path, e))?;
    }
    Ok(())
}

fn write_archive(bundle: &Path, target: &Path, compression: Compression, entries: &[&str]) -> Result<()> {
    let file = File::create(target).map_err(|e| archive_error("creating", target, e))?;
    match compression {
        Compression::Gzip => {
            let mut builder = tar::Builder::new(GzEncoder::new(file, flate2::Compression::default()));
            append_entries(&mut builder, bundle, entries)?;
            builder
                .into_inner()
                .and_then(|encoder| encoder.finish())
                .map_err(|e| archive_error("writing", target, e))?;
        }
        Compression::None => {
            let mut builder = tar::Builder::new(file);
            append_entries(&mut builder, bundle, entries)?;
            builder.finish().map_err(|e| archive_error("writing", target, e))?;
        }
    }
    Ok(())
}

/// Export a checkpointed container. `changes` is `None` when the root
/// filesystem is not part of the export.
pub fn export(
    container: &Container,
    options: &ExportOptions,
    changes: Option<&RootfsChanges>,
    volumes: &[Volume],
) -> Result<()> {
    let bundle = container.bundle_path();
    tracing::debug!("Exporting checkpoint of {} to {}", container.id(), options.target.display());

    std::fs::write(bundle.join(CONFIG_DUMP_FILE), serde_json::to_vec_pretty(&container.config)?)?;
    std::fs::write(bundle.join(SPEC_DUMP_FILE), serde_json::to_vec_pretty(&container.config.spec)?)?;

    let mut entries = vec![
        ARTIFACTS_DIR,
        CONFIG_DUMP_FILE,
        SPEC_DUMP_FILE,
        NETWORK_STATUS_FILE,
        STATS_DUMP_FILE,
    ];
    entries.push(if options.pre_checkpoint {
        PRE_CHECKPOINT_DIR
    } else {
        CHECKPOINT_DIR
    });
    if FILE_LOG_DRIVERS.contains(&container.config.log_driver.as_str()) {
        entries.push(CONTAINER_LOG_FILE);
    }

    if let (false, Some(changes)) = (options.ignore_rootfs, changes) {
        write_rootfs_diff(bundle, container.mountpoint()?, changes)?;
        entries.push(ROOTFS_DIFF_FILE);
        entries.push(DELETED_FILES_FILE);
    }
    let with_volumes = !options.ignore_volumes && !volumes.is_empty();
    if with_volumes {
        entries.push(VOLUMES_DIR);
    }
    let written = if with_volumes { write_volumes(bundle, volumes) } else { Ok(()) }
        .and_then(|()| write_archive(bundle, &options.target, options.compression, &entries));

    // The per-volume tars only live for the duration of the export
    if with_volumes {
        let removed = std::fs::remove_dir_all(bundle.join(VOLUMES_DIR));
        written?;
        removed?;
    } else {
        written?;
    }
    std::fs::set_permissions(&options.target, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

/// Open an archive, decompressing it when it starts with the gzip magic
fn open(path: &Path) -> Result<tar::Archive<Box<dyn Read>>> {
    let mut file = File::open(path).map_err(|e| archive_error("opening", path, e))?;
    let mut magic = [0u8; 2];
    let gzip = file.read_exact(&mut magic).is_ok() && magic == GZIP_MAGIC;
    let file = File::open(path)?;
    let reader: Box<dyn Read> = if gzip {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    Ok(archive)
}

fn top_level(path: &Path) -> Option<String> {
    path.components().find_map(|c| match c {
        Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
        _ => None,
    })
}

/// Unpack an archive into `dir`, skipping top-level entries named in `exclude`
pub fn import(archive: &Path, dir: &Path, exclude: &[&str]) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut tar = open(archive)?;
    let entries = tar.entries().map_err(|e| archive_error("reading", archive, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| archive_error("reading", archive, e))?;
        let path = entry.path().map_err(|e| archive_error("reading", archive, e))?.into_owned();
        if top_level(&path).is_some_and(|top| exclude.contains(&top.as_str())) {
            continue;
        }
        entry
            .unpack_in(dir)
            .map_err(|e| archive_error("unpacking", &path, e))?;
    }
    Ok(())
}

/// Read one top-level file of an archive
pub fn read_file(archive: &Path, name: &str) -> Result<Vec<u8>> {
    let mut tar = open(archive)?;
    let entries = tar.entries().map_err(|e| archive_error("reading", archive, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| archive_error("reading", archive, e))?;
        let path = entry.path().map_err(|e| archive_error("reading", archive, e))?;
        let mut parts = path.components().filter(|c| matches!(c, Component::Normal(_)));
        let matches = parts.next().is_some_and(|c| c.as_os_str() == name) && parts.next().is_none();
        if matches {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            return Ok(content);
        }
    }
    Err(EngineError::Archive(format!("{} has no {}", archive.display(), name)))
}

/// Apply an exported root filesystem diff from `bundle` to `rootfs`
pub fn apply_rootfs_diff(bundle: &Path, rootfs: &Path) -> Result<()> {
    let diff = bundle.join(ROOTFS_DIFF_FILE);
    if diff.is_file() {
        let mut tar = tar::Archive::new(File::open(&diff)?);
        tar.set_preserve_permissions(true);
        tar.unpack(rootfs).map_err(|e| archive_error("applying", &diff, e))?;
    }

    let deleted_path = bundle.join(DELETED_FILES_FILE);
    if !deleted_path.is_file() {
        return Ok(());
    }
    let deleted: Vec<PathBuf> = serde_json::from_slice(&std::fs::read(&deleted_path)?)?;
    for rel in deleted {
        let path = secure_join(rootfs, &rel)?;
        let result = match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&path),
            Ok(_) => std::fs::remove_file(&path),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(archive_error("removing", &path, e)),
        }
    }
    Ok(())
}

/// Unpack `volumes/<name>.tar` from `bundle` into the volume
pub fn restore_volume(bundle: &Path, volume: &Volume) -> Result<()> {
    let path = bundle.join(VOLUMES_DIR).join(format!("{}.tar", volume.name));
    let file = File::open(&path).map_err(|e| archive_error("opening volume archive", &path, e))?;
    std::fs::create_dir_all(&volume.mountpoint)?;
    let mut tar = tar::Archive::new(file);
    tar.set_preserve_permissions(true);
    tar.unpack(&volume.mountpoint)
        .map_err(|e| archive_error("unpacking", &path, e))
}
