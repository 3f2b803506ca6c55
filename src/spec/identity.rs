//! Synthetic `/etc/passwd` and `/etc/group` entries
//!
//! Containers started with a numeric user that the image does not know about
//! get a passwd and group entry so that tools calling `getpwuid` keep
//! working. Host users and the invoking user can be added the same way.

use super::user::{split_user_spec, IdentityFiles};
use crate::container::config::ContainerConfig;
use crate::error::{EngineError, Result};
use crate::util::{secure_join, write_file};
use oci_spec::runtime::Mount;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// A user account on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home: String,
}

/// Host account database
pub trait HostAccounts: Send + Sync {
    /// Look up a host user by name or UID
    fn lookup_user(&self, name_or_uid: &str) -> Result<HostUser>;

    /// The invoking user, or `None` when running as root
    fn current_user(&self) -> Result<Option<HostUser>>;

    /// Name of a host group
    fn group_name(&self, gid: u32) -> Option<String>;
}

/// Host accounts read from the host's passwd and group files
#[derive(Debug, Clone)]
pub struct EtcHostAccounts {
    files: IdentityFiles,
}

impl EtcHostAccounts {
    pub fn new(etc_dir: &Path) -> Self {
        Self {
            files: IdentityFiles {
                passwd: etc_dir.join("passwd"),
                group: etc_dir.join("group"),
            },
        }
    }
}

impl HostAccounts for EtcHostAccounts {
    fn lookup_user(&self, name_or_uid: &str) -> Result<HostUser> {
        let entry = self.files.find_user(name_or_uid)?.ok_or_else(|| {
            EngineError::Identity(format!("host user {} not found", name_or_uid))
        })?;
        Ok(HostUser {
            name: entry.name,
            uid: entry.uid,
            gid: entry.gid,
            gecos: entry.gecos,
            home: entry.home,
        })
    }

    fn current_user(&self) -> Result<Option<HostUser>> {
        // SAFETY: geteuid has no preconditions
        let uid = unsafe { libc::geteuid() };
        if uid == 0 {
            return Ok(None);
        }
        self.lookup_user(&uid.to_string()).map(Some)
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        self.files
            .find_group(&gid.to_string())
            .ok()
            .flatten()
            .map(|g| g.name)
    }
}

/// Inputs of the synthesizer
pub struct IdentityContext<'a> {
    pub config: &'a ContainerConfig,
    /// Mounted root filesystem
    pub rootfs: &'a Path,
    /// Directory for generated files
    pub static_dir: &'a Path,
    /// Mounts of the spec being built
    pub mounts: &'a [Mount],
}

/// Generated files that must be bind-mounted (read-only containers only)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedIdentity {
    pub passwd: Option<PathBuf>,
    pub group: Option<PathBuf>,
}

fn mount_exists(mounts: &[Mount], dest: &Path) -> bool {
    mounts.iter().any(|m| m.destination() == dest)
}

fn working_dir(config: &ContainerConfig) -> &str {
    if config.working_dir.is_empty() {
        "/"
    } else {
        &config.working_dir
    }
}

/// Render an entry through the configured template
fn templated_entry(template: &str, username: &str, uid: &str, gid: &str, name: &str, home: &str) -> String {
    let entry = template
        .replace("$USERNAME", username)
        .replace("$UID", uid)
        .replace("$GID", gid)
        .replace("$NAME", name)
        .replace("$HOME", home);
    format!("{}\n", entry)
}

struct Synthesizer<'a> {
    ctx: &'a IdentityContext<'a>,
    files: IdentityFiles,
}

impl<'a> Synthesizer<'a> {
    fn passwd_line(&self, username: &str, uid: u32, gid: u32, name: &str, home: &str) -> String {
        match &self.ctx.config.passwd_entry {
            Some(template) => templated_entry(
                template,
                username,
                &uid.to_string(),
                &gid.to_string(),
                name,
                home,
            ),
            None => format!("{}:*:{}:{}:{}:{}:/bin/sh\n", username, uid, gid, name, home),
        }
    }

    /// Entry for a host user, unless the image already knows the name or UID
    fn host_user_entry(&self, user: &HostUser) -> Result<String> {
        if self.files.find_user(&user.name)?.is_some()
            || self.files.find_user(&user.uid.to_string())?.is_some()
        {
            return Ok(String::new());
        }

        // Prefer the user's real home if something is mounted there
        let mut home = working_dir(self.ctx.config).to_string();
        let mut dir = Path::new(&user.home);
        loop {
            if mount_exists(self.ctx.mounts, dir) {
                home = user.home.clone();
                break;
            }
            match dir.parent() {
                Some(parent) if dir != Path::new("/") => dir = parent,
                _ => break,
            }
        }
        if home != user.home && self.ctx.config.named_volumes.iter().any(|v| v.dest == user.home) {
            home = user.home.clone();
        }

        Ok(self.passwd_line(&user.name, user.uid, user.gid, &user.gecos, &home))
    }

    /// Entry for a numeric `--user`
    fn user_entry(&self, added: &[u32]) -> Result<String> {
        let (user, group) = split_user_spec(&self.ctx.config.user);
        let uid: u32 = match user.parse() {
            Ok(uid) => uid,
            Err(_) => return Ok(String::new()),
        };
        if added.contains(&uid) || self.files.find_user(user)?.is_some() {
            return Ok(String::new());
        }

        let gid = match group {
            Some(group) if !group.is_empty() => match group.parse::<u32>() {
                Ok(gid) => gid,
                Err(_) => self
                    .files
                    .find_group(group)?
                    .map(|g| g.gid)
                    .ok_or_else(|| {
                        EngineError::Identity(format!(
                            "unable to get gid {} from group file",
                            group
                        ))
                    })?,
            },
            _ => 0,
        };

        Ok(self.passwd_line(
            &uid.to_string(),
            uid,
            gid,
            "container user",
            working_dir(self.ctx.config),
        ))
    }

    fn passwd_entries(&self, host: &dyn HostAccounts) -> Result<String> {
        let mut entries = String::new();
        let mut added: Vec<u32> = Vec::new();

        let mut users = Vec::new();
        for name in &self.ctx.config.host_users {
            users.push(host.lookup_user(name)?);
        }
        if self.ctx.config.add_current_user_passwd_entry {
            users.extend(host.current_user()?);
        }
        for user in users {
            if added.contains(&user.uid) {
                continue;
            }
            entries.push_str(&self.host_user_entry(&user)?);
            added.push(user.uid);
        }
        if !self.ctx.config.user.is_empty() {
            entries.push_str(&self.user_entry(&added)?);
        }
        Ok(entries)
    }

    fn group_entries(&self, host: &dyn HostAccounts) -> Result<String> {
        let mut entries = String::new();
        let mut added_gid = None;

        if self.ctx.config.add_current_user_passwd_entry {
            if let Some(user) = host.current_user()? {
                if self.files.find_group(&user.gid.to_string())?.is_none() {
                    let name = host.group_name(user.gid).unwrap_or_else(|| user.name.clone());
                    entries.push_str(&format!("{}:x:{}:{}\n", name, user.gid, user.name));
                }
                added_gid = Some(user.gid);
            }
        }

        if !self.ctx.config.user.is_empty() {
            let (user, group) = split_user_spec(&self.ctx.config.user);
            let group = group.unwrap_or(user);
            if let Ok(gid) = group.parse::<u32>() {
                if added_gid != Some(gid) && self.files.find_group(group)?.is_none() {
                    entries.push_str(&format!("{}:x:{}:{}\n", gid, gid, user));
                }
            }
        }
        Ok(entries)
    }
}

/// Write `entries` either to a new static file (read-only root) or by
/// appending to the image's file in place.
fn write_entries(ctx: &IdentityContext<'_>, name: &str, entries: &str) -> Result<Option<PathBuf>> {
    if entries.is_empty() {
        tracing::debug!("Not modifying container {} /etc/{}", ctx.config.id, name);
        return Ok(None);
    }
    let image_file = secure_join(ctx.rootfs, Path::new("/etc").join(name))?;

    if ctx.config.read_only {
        tracing::debug!("Making /etc/{} for container {}", name, ctx.config.id);
        let original = match std::fs::read_to_string(&image_file) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let path = write_file(ctx.static_dir, name, &format!("{}{}", original, entries))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))?;
        return Ok(Some(path));
    }

    tracing::debug!("Modifying container {} /etc/{}", ctx.config.id, name);
    let mut file = std::fs::OpenOptions::new().append(true).open(&image_file)?;
    file.write_all(entries.as_bytes())?;
    Ok(None)
}

/// Add passwd and group entries for the container's user, host users and
/// the invoking user where the image lacks them.
///
/// Nothing is done for a file that is mounted over, that was already
/// generated for this container, or that the image does not have at all.
pub fn generate_passwd_and_group(
    ctx: &IdentityContext<'_>,
    host: &dyn HostAccounts,
) -> Result<GeneratedIdentity> {
    let config = ctx.config;
    if !config.passwd
        || (!config.add_current_user_passwd_entry && config.user.is_empty() && config.host_users.is_empty())
    {
        return Ok(GeneratedIdentity::default());
    }

    let needed = |name: &str| -> Result<bool> {
        let dest = Path::new("/etc").join(name);
        if mount_exists(ctx.mounts, &dest) || ctx.static_dir.join(name).exists() {
            return Ok(false);
        }
        Ok(secure_join(ctx.rootfs, &dest)?.exists())
    };
    let need_passwd = needed("passwd")?;
    let need_group = needed("group")?;
    if !need_passwd && !need_group {
        return Ok(GeneratedIdentity::default());
    }

    let synth = Synthesizer {
        ctx,
        files: IdentityFiles::locate(ctx.rootfs, ctx.mounts)?,
    };
    let mut generated = GeneratedIdentity::default();
    if need_passwd {
        let entries = synth.passwd_entries(host)?;
        generated.passwd = write_entries(ctx, "passwd", &entries)?;
    }
    if need_group {
        let entries = synth.group_entries(host)?;
        generated.group = write_entries(ctx, "group", &entries)?;
    }
    Ok(generated)
}
