//! Mount assembly
//!
//! Builds the final mount list of a runtime spec. Inputs are applied in
//! order: named volumes, option post-processing of existing mounts, engine
//! bind mounts, overlay volumes, image volumes. Every step replaces or skips
//! by destination, so running the assembly again over its own output
//! changes nothing.

use crate::container::config::{ImageVolume, NamedVolume, OverlayVolume};
use crate::container::state::BindMounts;
use crate::error::{EngineError, Result};
use crate::platform::Platform;
use crate::util::{change_ownership, chown_if_needed, secure_join};
use oci_spec::runtime::{Mount, MountBuilder};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};

/// Option asking for a copy-on-write overlay
pub const OVERLAY_OPTION: &str = "O";
/// Option asking for a one-time ownership change
pub const CHOWN_OPTION: &str = "U";
/// Relabel options (shared, private)
pub const RELABEL_OPTIONS: [&str; 2] = ["z", "Z"];

/// A named volume with its host path resolved
#[derive(Debug, Clone)]
pub struct ResolvedVolume {
    pub volume: NamedVolume,
    pub source: PathBuf,
}

/// An image volume with the image mounted
#[derive(Debug, Clone)]
pub struct ResolvedImageVolume {
    pub volume: ImageVolume,
    pub source: PathBuf,
}

/// Whether a mount targets `dest`
pub fn mount_exists(mounts: &[Mount], dest: impl AsRef<Path>) -> bool {
    mounts.iter().any(|m| m.destination() == dest.as_ref())
}

/// Insert a mount, replacing any mount at the same destination
pub fn upsert_mount(mounts: &mut Vec<Mount>, mount: Mount) {
    match mounts.iter_mut().find(|m| m.destination() == mount.destination()) {
        Some(existing) => *existing = mount,
        None => mounts.push(mount),
    }
}

fn depth(path: &Path) -> usize {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count()
}

/// Order mounts so that a parent directory is always mounted before anything
/// below it. The order is total and stable: by depth, then by path.
pub fn sort_mounts(mounts: &mut [Mount]) {
    mounts.sort_by(|a, b| {
        let (a, b) = (a.destination(), b.destination());
        depth(a).cmp(&depth(b)).then_with(|| a.cmp(b))
    });
}

/// Resolve tmpfs destinations through symlinks inside the root filesystem so
/// the launcher mounts them where the container will see them.
pub fn secure_tmpfs_destinations(mounts: &mut [Mount], rootfs: &Path) -> Result<()> {
    for mount in mounts.iter_mut() {
        if mount.typ().as_deref() != Some("tmpfs") {
            continue;
        }
        let resolved = secure_join(rootfs, mount.destination())?;
        let relative = resolved
            .strip_prefix(rootfs)
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        mount.set_destination(Path::new("/").join(relative));
    }
    Ok(())
}

/// Split `upperdir=`/`workdir=` out of overlay options
fn overlay_dirs(
    container_id: &str,
    volume: &str,
    options: &[String],
) -> Result<(Option<String>, Option<String>, Vec<String>)> {
    let mut upper = None;
    let mut work = None;
    let mut rest = Vec::new();
    for option in options {
        if let Some(dir) = option.strip_prefix("upperdir=") {
            upper = Some(dir.to_string());
        } else if let Some(dir) = option.strip_prefix("workdir=") {
            work = Some(dir.to_string());
        } else if option != OVERLAY_OPTION {
            rest.push(option.clone());
        }
    }
    if upper.is_some() != work.is_some() {
        return Err(EngineError::OverlayPair {
            id: container_id.to_string(),
            volume: volume.to_string(),
        });
    }
    Ok((upper, work, rest))
}

/// Builds the mount list of one container
pub struct MountAssembler<'a> {
    pub container_id: &'a str,
    pub platform: &'a dyn Platform,
    /// Directory holding overlay content directories
    pub static_dir: &'a Path,
    /// Host owner of container root, when it is not the engine's own user
    pub root_owner: Option<(u32, u32)>,
    /// Host UID/GID for `U` ownership changes
    pub chown_target: (u32, u32),
}

impl MountAssembler<'_> {
    /// Upper and work directories for an overlay over `source`
    fn content_dirs(&self, source: &Path) -> Result<(PathBuf, PathBuf)> {
        let mut hasher = Sha256::new();
        hasher.update(source.to_string_lossy().as_bytes());
        let dir = self
            .static_dir
            .join("overlay")
            .join(format!("{:x}", hasher.finalize()));
        let upper = dir.join("upper");
        let work = dir.join("work");
        std::fs::create_dir_all(&upper)?;
        std::fs::create_dir_all(&work)?;
        if let Some((uid, gid)) = self.root_owner {
            chown_if_needed(&upper, uid, gid)?;
            chown_if_needed(&work, uid, gid)?;
        }
        Ok((upper, work))
    }

    fn overlay_mount(
        &self,
        name: &str,
        lower: &Path,
        dest: &str,
        options: &[String],
    ) -> Result<Mount> {
        let (upper, work, rest) = overlay_dirs(self.container_id, name, options)?;
        let (upper, work) = match (upper, work) {
            (Some(upper), Some(work)) => (PathBuf::from(upper), PathBuf::from(work)),
            _ => self.content_dirs(lower)?,
        };
        let mut overlay_options = vec![
            format!("lowerdir={}", lower.display()),
            format!("upperdir={}", upper.display()),
            format!("workdir={}", work.display()),
        ];
        overlay_options.extend(rest.into_iter().filter(|o| {
            o != CHOWN_OPTION && !RELABEL_OPTIONS.contains(&o.as_str())
        }));
        Ok(MountBuilder::default()
            .destination(dest)
            .typ("overlay")
            .source("overlay")
            .options(overlay_options)
            .build()?)
    }

    fn bind_mount(&self, source: &Path, dest: &str, extra: &[String]) -> Result<Mount> {
        let read_only = extra.iter().any(|o| o == "ro");
        let mut options = self.platform.bind_options(read_only);
        for option in extra {
            if option == "ro" || option == "rw" || options.contains(option) {
                continue;
            }
            options.push(option.clone());
        }
        Ok(MountBuilder::default()
            .destination(dest)
            .typ(self.platform.bind_mount_type())
            .source(source.to_path_buf())
            .options(options)
            .build()?)
    }

    /// Named volumes: bind mounts, or overlays when `O` is given
    pub fn add_named_volumes(&self, mounts: &mut Vec<Mount>, volumes: &[ResolvedVolume]) -> Result<()> {
        for resolved in volumes {
            let options = &resolved.volume.options;
            if options.iter().any(|o| o == CHOWN_OPTION) {
                let (uid, gid) = self.chown_target;
                change_ownership(&resolved.source, true, uid, gid)?;
            }
            let mount = if options.iter().any(|o| o == OVERLAY_OPTION) {
                self.overlay_mount(
                    &resolved.volume.name,
                    &resolved.source,
                    &resolved.volume.dest,
                    options,
                )?
            } else {
                let extra: Vec<String> = options
                    .iter()
                    .filter(|o| o.as_str() != CHOWN_OPTION && !RELABEL_OPTIONS.contains(&o.as_str()))
                    .cloned()
                    .collect();
                self.bind_mount(&resolved.source, &resolved.volume.dest, &extra)?
            };
            upsert_mount(mounts, mount);
        }
        Ok(())
    }

    /// Strip `U`, `z` and `Z` from every mount after acting on them. `U` on a
    /// tmpfs becomes `uid=`/`gid=` options; elsewhere it changes ownership of
    /// the source.
    pub fn process_options(&self, mounts: &mut [Mount]) -> Result<()> {
        for mount in mounts.iter_mut() {
            let options = match mount.options() {
                Some(options) => options.clone(),
                None => continue,
            };
            let chown = options.iter().any(|o| o == CHOWN_OPTION);
            let relabel = options.iter().any(|o| RELABEL_OPTIONS.contains(&o.as_str()));
            if !chown && !relabel {
                continue;
            }
            let mut kept: Vec<String> = options
                .into_iter()
                .filter(|o| o != CHOWN_OPTION && !RELABEL_OPTIONS.contains(&o.as_str()))
                .collect();
            if relabel {
                tracing::debug!(
                    "Relabel requested for {} but labeling is not enabled, ignoring",
                    mount.destination().display()
                );
            }
            if chown {
                let (uid, gid) = self.chown_target;
                if mount.typ().as_deref() == Some("tmpfs") {
                    kept.push(format!("uid={}", uid));
                    kept.push(format!("gid={}", gid));
                } else if let Some(source) = mount.source() {
                    change_ownership(source, true, uid, gid)?;
                }
            }
            mount.set_options(Some(kept));
        }
        Ok(())
    }

    /// Engine bind mounts. A mount the user already placed at a destination wins.
    pub fn add_bind_mounts(&self, mounts: &mut Vec<Mount>, bind_mounts: &BindMounts) -> Result<()> {
        for (dest, source) in bind_mounts.iter() {
            let wanted = self.bind_mount(source, dest, &[])?;
            match mounts.iter().find(|m| m.destination() == Path::new(dest)) {
                Some(existing) if existing == &wanted => {}
                Some(_) => tracing::info!("User mount overriding engine mount at {}", dest),
                None => mounts.push(wanted),
            }
        }
        Ok(())
    }

    /// Overlay volumes over host directories
    pub fn add_overlay_volumes(&self, mounts: &mut Vec<Mount>, volumes: &[OverlayVolume]) -> Result<()> {
        for volume in volumes {
            let name = volume.source.display().to_string();
            let mount = self.overlay_mount(&name, &volume.source, &volume.dest, &volume.options)?;
            upsert_mount(mounts, mount);
        }
        Ok(())
    }

    /// Image volumes: read-only binds, or overlays when writable
    pub fn add_image_volumes(
        &self,
        mounts: &mut Vec<Mount>,
        volumes: &[ResolvedImageVolume],
    ) -> Result<()> {
        for resolved in volumes {
            let mount = if resolved.volume.read_write {
                self.overlay_mount(&resolved.volume.source, &resolved.source, &resolved.volume.dest, &[])?
            } else {
                self.bind_mount(&resolved.source, &resolved.volume.dest, &["ro".to_string()])?
            };
            upsert_mount(mounts, mount);
        }
        Ok(())
    }
}
