//! Runtime spec generation
//!
//! [`SpecBuilder::base_spec`] derives the create-time spec stored with a
//! container's configuration. [`SpecBuilder::generate`] completes it once
//! the container's root filesystem is mounted and its network namespace
//! exists: volumes, engine bind mounts, the process identity, namespaces
//! shared with other containers and injected devices.

pub mod annotations;
pub mod bind_mounts;
pub mod cdi;
pub mod command;
pub mod device;
pub mod identity;
pub mod mount;
pub mod namespace;
pub mod user;

pub use device::{parse_device, DeviceSpec};
pub use identity::{EtcHostAccounts, HostAccounts};

use crate::config::{EngineConfig, LISTEN_ENV_KEYS};
use crate::container::config::{ContainerConfig, IdMap, ImageMetadata};
use crate::container::runtime::Container;
use crate::container::store::ContainerLookup;
use crate::error::{EngineError, Result};
use crate::platform::Platform;
use crate::storage::{ImageMounter, VolumeStore};
use crate::util::{chown_if_needed, is_rootless, secure_join};
use bind_mounts::{BindMountContext, NOTIFY_DIR, NOTIFY_SOCKET};
use cdi::CdiRegistry;
use command::{init_binary, make_command, INIT_DESTINATION};
use mount::{
    mount_exists, secure_tmpfs_destinations, sort_mounts, upsert_mount, MountAssembler,
    ResolvedImageVolume, ResolvedVolume,
};
use oci_spec::runtime::{LinuxPidsBuilder, Mount, MountBuilder, Spec};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use user::{lookup_user, resolve_group, ExecUser, IdentityFiles};

fn working_dir(config: &ContainerConfig) -> &str {
    if config.working_dir.is_empty() {
        "/"
    } else {
        &config.working_dir
    }
}

fn env_key(entry: &str) -> &str {
    entry.split_once('=').map(|(k, _)| k).unwrap_or(entry)
}

fn set_env(env: &mut Vec<String>, key: &str, value: &str) {
    let entry = format!("{}={}", key, value);
    match env.iter_mut().find(|e| env_key(e) == key) {
        Some(existing) => *existing = entry,
        None => env.push(entry),
    }
}

fn set_env_if_absent(env: &mut Vec<String>, key: &str, value: &str) {
    if !env.iter().any(|e| env_key(e) == key) {
        env.push(format!("{}={}", key, value));
    }
}

/// Whether a container GID is usable inside the user namespace
fn gid_available(gid_map: &[IdMap], gid: u32) -> bool {
    gid_map.is_empty() || gid_map.iter().any(|m| m.contains(gid))
}

/// Builds runtime specs for containers
pub struct SpecBuilder {
    engine: Arc<EngineConfig>,
    platform: Arc<dyn Platform>,
    volumes: Arc<dyn VolumeStore>,
    images: Arc<dyn ImageMounter>,
    host: Arc<dyn HostAccounts>,
    lookup: Arc<dyn ContainerLookup>,
}

impl SpecBuilder {
    pub fn new(
        engine: Arc<EngineConfig>,
        platform: Arc<dyn Platform>,
        volumes: Arc<dyn VolumeStore>,
        images: Arc<dyn ImageMounter>,
        host: Arc<dyn HostAccounts>,
        lookup: Arc<dyn ContainerLookup>,
    ) -> Self {
        Self {
            engine,
            platform,
            volumes,
            images,
            host,
            lookup,
        }
    }

    fn bind(&self, source: PathBuf, dest: &str, read_only: bool) -> Result<Mount> {
        Ok(MountBuilder::default()
            .destination(dest)
            .typ(self.platform.bind_mount_type())
            .source(source)
            .options(self.platform.bind_options(read_only))
            .build()?)
    }

    /// Create-time spec of a container
    pub fn base_spec(&self, config: &ContainerConfig, image: Option<&ImageMetadata>) -> Result<Spec> {
        let platform = self.platform.as_ref();
        let mut spec = config.spec.clone();

        let mut process = spec.process().clone().unwrap_or_default();
        process.set_args(Some(make_command(config, image)?));
        process.set_cwd(PathBuf::from(working_dir(config)));
        process.set_terminal(Some(config.terminal));
        process.set_oom_score_adj(config.oom_score_adj);
        let mut env = process.env().clone().unwrap_or_default();
        for (key, value) in &config.env {
            set_env(&mut env, key, value);
        }
        process.set_env(Some(env));
        spec.set_process(Some(process));

        let mut root = spec.root().clone().unwrap_or_default();
        root.set_readonly(Some(config.read_only));
        spec.set_root(Some(root));

        let mut mounts = spec.mounts().clone().unwrap_or_default();
        for user_mount in &config.mounts {
            upsert_mount(&mut mounts, user_mount.clone());
        }
        if config.init {
            let init = init_binary(config, self.engine.init_path.as_deref())?;
            upsert_mount(&mut mounts, self.bind(init, INIT_DESTINATION, true)?);
        }
        spec.set_mounts(Some(mounts));

        namespace::apply_namespaces(&mut spec, config, platform)?;
        namespace::apply_hostname(&mut spec, config, self.lookup.as_ref(), platform)?;
        device::add_devices(&mut spec, &config.devices, platform, is_rootless())?;

        let limit = config
            .pids_limit
            .filter(|limit| *limit > 0)
            .or_else(|| self.engine.default_pids_limit());
        if let Some(limit) = limit {
            let mut linux = spec.linux().clone().unwrap_or_default();
            let mut resources = linux.resources().clone().unwrap_or_default();
            resources.set_pids(Some(LinuxPidsBuilder::default().limit(limit).build()?));
            linux.set_resources(Some(resources));
            spec.set_linux(Some(linux));
        }

        spec.set_annotations(Some(annotations::container_annotations(config)));
        Ok(spec)
    }

    /// Resolve the process user; users listed in `host_users` fall back to
    /// the host's account database
    fn exec_user(&self, config: &ContainerConfig, files: &IdentityFiles) -> Result<ExecUser> {
        match lookup_user(files, &config.user) {
            Ok(user) => Ok(user),
            Err(err) if config.host_users.contains(&config.user) => {
                let host = self.host.lookup_user(&config.user).map_err(|_| err)?;
                Ok(ExecUser {
                    uid: host.uid,
                    gid: host.gid,
                    home: host.home,
                    sgids: Vec::new(),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Home directory for `HOME`: the user's home when it is mounted in or
    /// exists in the image, the working directory otherwise
    fn home_dir(config: &ContainerConfig, exec: &ExecUser, rootfs: &Path, mounts: &[Mount]) -> String {
        let home = Path::new(&exec.home);
        let mounted = home
            .ancestors()
            .take_while(|p| *p != Path::new("/"))
            .any(|p| mount_exists(mounts, p))
            || config.user_volumes().iter().any(|v| Path::new(v) == home);
        let exists = secure_join(rootfs, home).map(|p| p.exists()).unwrap_or(false);
        if mounted || exists {
            exec.home.clone()
        } else {
            working_dir(config).to_string()
        }
    }

    /// Verify the working directory, creating it when allowed
    fn ensure_working_dir(
        config: &ContainerConfig,
        rootfs: &Path,
        mounts: &[Mount],
        owner: (u32, u32),
    ) -> Result<()> {
        let dir = working_dir(config);
        if dir == "/" || mount_exists(mounts, dir) {
            return Ok(());
        }
        let path = secure_join(rootfs, dir)?;
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(EngineError::config(
                &config.id,
                format!("working directory {} is not a directory", dir),
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if !config.create_working_dir {
                    return Err(EngineError::config(
                        &config.id,
                        format!("working directory {} does not exist", dir),
                    ));
                }
                std::fs::create_dir_all(&path)?;
                chown_if_needed(&path, owner.0, owner.1)?;
                tracing::debug!("Created working directory {} for {}", dir, config.id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn supplementary_gids(config: &ContainerConfig, exec: &ExecUser, files: &IdentityFiles) -> Result<Vec<u32>> {
        let mut gids: Vec<u32> = Vec::new();
        for group in &config.groups {
            let gid = resolve_group(files, group).map_err(|e| {
                EngineError::config(&config.id, format!("looking up supplemental group {}: {}", group, e))
            })?;
            if !gids.contains(&gid) {
                gids.push(gid);
            }
        }
        if !config.user.contains(':') {
            for gid in &exec.sgids {
                if !gid_available(&config.id_mappings.gid_map, *gid) {
                    tracing::warn!(
                        "Additional gid={} is not present in the user namespace of {}, skipping",
                        gid,
                        config.id
                    );
                    continue;
                }
                if !gids.contains(gid) {
                    gids.push(*gid);
                }
            }
        }
        Ok(gids)
    }

    /// Final runtime spec of a prepared container. Records the engine's bind
    /// mounts in the container's state as a side effect.
    pub fn generate(&self, container: &mut Container) -> Result<Spec> {
        let platform = self.platform.as_ref();
        let rootfs = container.mountpoint()?.to_path_buf();
        let bundle = container.bundle_path().to_path_buf();
        let config = container.config.clone();
        let mut spec = config.spec.clone();
        let mut mounts = spec.mounts().clone().unwrap_or_default();

        let files = IdentityFiles::locate(&rootfs, &mounts)?;
        let exec = self.exec_user(&config, &files)?;
        let host_uid = config.id_mappings.host_uid(exec.uid).unwrap_or(exec.uid);
        let host_gid = config.id_mappings.host_gid(exec.gid).unwrap_or(exec.gid);
        let root_owner = if config.id_mappings.uid_map.is_empty() && config.id_mappings.gid_map.is_empty() {
            None
        } else {
            Some((container.root_uid(), container.root_gid()))
        };

        let assembler = MountAssembler {
            container_id: &config.id,
            platform,
            static_dir: &bundle,
            root_owner,
            chown_target: (host_uid, host_gid),
        };

        let volumes = config
            .named_volumes
            .iter()
            .map(|volume| {
                Ok(ResolvedVolume {
                    volume: volume.clone(),
                    source: self.volumes.get(&volume.name)?.mountpoint,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        assembler.add_named_volumes(&mut mounts, &volumes)?;
        assembler.process_options(&mut mounts)?;

        let ctx = BindMountContext {
            engine: &self.engine,
            lookup: self.lookup.as_ref(),
            host: self.host.as_ref(),
        };
        bind_mounts::make_bind_mounts(&ctx, container, &mounts)?;
        assembler.add_bind_mounts(&mut mounts, &container.state.bind_mounts)?;
        assembler.add_overlay_volumes(&mut mounts, &config.overlay_volumes)?;

        let image_volumes = config
            .image_volumes
            .iter()
            .map(|volume| {
                Ok(ResolvedImageVolume {
                    volume: volume.clone(),
                    source: self.images.mount_image(&volume.source)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        assembler.add_image_volumes(&mut mounts, &image_volumes)?;

        let mut process = spec.process().clone().unwrap_or_default();
        let mut env = process.env().clone().unwrap_or_default();
        set_env_if_absent(&mut env, "HOME", &Self::home_dir(&config, &exec, &rootfs, &mounts));

        let mut user = process.user().clone();
        if !config.user.is_empty() {
            user.set_uid(exec.uid);
            user.set_gid(exec.gid);
        }
        if let Some(umask) = &config.umask {
            let value = u32::from_str_radix(umask, 8)
                .map_err(|_| EngineError::config(&config.id, format!("invalid umask {}", umask)))?;
            user.set_umask(Some(value));
        }
        let gids = Self::supplementary_gids(&config, &exec, &files)?;
        if !gids.is_empty() {
            user.set_additional_gids(Some(gids));
        }
        process.set_user(user);

        namespace::join_dependency_namespaces(&mut spec, &config, self.lookup.as_ref(), platform)?;
        if config.creates_net_ns() {
            if let Some(handle) = &container.state.net_ns {
                namespace::set_network_namespace(&mut spec, platform, handle)?;
            }
        }

        let hostname = if config.namespaces.uts.is_host() {
            platform.host_hostname()
        } else {
            let hostname = container.hostname();
            spec.set_hostname(Some(hostname.clone()));
            hostname
        };
        set_env_if_absent(&mut env, "HOSTNAME", &hostname);

        for (var, secret) in &config.env_secrets {
            let path = self.engine.secrets_dir.join(secret);
            let value = std::fs::read_to_string(&path).map_err(|_| {
                EngineError::config(&config.id, format!("secret {} does not exist", secret))
            })?;
            set_env(&mut env, var, value.trim_end_matches('\n'));
        }
        if container.state.bind_mounts.contains(NOTIFY_DIR) {
            set_env(&mut env, "NOTIFY_SOCKET", NOTIFY_SOCKET);
        }
        for key in LISTEN_ENV_KEYS {
            if let Some(value) = self.engine.listen_env.get(key) {
                let value = if key == "LISTEN_PID" { "1" } else { value.as_str() };
                set_env_if_absent(&mut env, key, value);
            }
        }
        process.set_env(Some(env));
        spec.set_process(Some(process));

        let mut root = spec.root().clone().unwrap_or_default();
        root.set_path(rootfs.clone());
        spec.set_root(Some(root));
        spec.set_mounts(Some(mounts));

        if !config.cdi_devices.is_empty() {
            let registry = CdiRegistry::load(&self.engine.cdi_spec_dirs);
            for error in registry.errors() {
                tracing::warn!("Device injection registry: {}", error);
            }
            registry.inject(&mut spec, &config.cdi_devices, platform)?;
        }

        let mut mounts = spec.mounts().clone().unwrap_or_default();
        sort_mounts(&mut mounts);
        secure_tmpfs_destinations(&mut mounts, &rootfs)?;
        Self::ensure_working_dir(&config, &rootfs, &mounts, (host_uid, host_gid))?;
        spec.set_mounts(Some(mounts));

        tracing::debug!("Generated runtime spec for {}", config.id);
        Ok(spec)
    }

    /// Runtime spec for a restore: the spec saved at checkpoint time with
    /// this host's bind mounts and network namespace. A spec that came from
    /// an imported archive also gets the local mountpoint as its root and
    /// any engine bind mount it lacks.
    pub fn restore_spec(&self, container: &mut Container, imported: bool) -> Result<Spec> {
        let path = container.config_json_path();
        let mut spec = Spec::load(&path).map_err(|e| {
            EngineError::CheckpointNotFound(format!("{}: loading {}: {}", container.id(), path.display(), e))
        })?;
        let rootfs = container.mountpoint()?.to_path_buf();
        if imported {
            let mut root = spec.root().clone().unwrap_or_default();
            root.set_path(rootfs);
            spec.set_root(Some(root));
        }

        let mut mounts = spec.mounts().clone().unwrap_or_default();
        let ctx = BindMountContext {
            engine: &self.engine,
            lookup: self.lookup.as_ref(),
            host: self.host.as_ref(),
        };
        bind_mounts::make_bind_mounts(&ctx, container, &mounts)?;
        if imported {
            let bind_mounts = container.state.bind_mounts.clone();
            for (dest, source) in bind_mounts.iter() {
                if !mount_exists(&mounts, dest) {
                    mounts.push(self.bind(source.clone(), dest, false)?);
                }
            }
            sort_mounts(&mut mounts);
        }
        spec.set_mounts(Some(mounts));

        if container.config.creates_net_ns() {
            if let Some(handle) = &container.state.net_ns {
                namespace::set_network_namespace(&mut spec, self.platform.as_ref(), handle)?;
            }
        }
        Ok(spec)
    }
}
