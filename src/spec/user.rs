//! User and group lookup inside a container root filesystem

use crate::error::{EngineError, Result};
use crate::util::secure_join;
use oci_spec::runtime::Mount;
use std::path::{Path, PathBuf};

/// One `/etc/passwd` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home: String,
    pub shell: String,
}

/// One `/etc/group` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub gid: u32,
    pub members: Vec<String>,
}

/// Parse passwd content; malformed lines are skipped
pub fn parse_passwd(content: &str) -> Vec<PasswdEntry> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 7 {
                return None;
            }
            Some(PasswdEntry {
                name: fields[0].to_string(),
                uid: fields[2].parse().ok()?,
                gid: fields[3].parse().ok()?,
                gecos: fields[4].to_string(),
                home: fields[5].to_string(),
                shell: fields[6].to_string(),
            })
        })
        .collect()
}

/// Parse group content; malformed lines are skipped
pub fn parse_group(content: &str) -> Vec<GroupEntry> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 4 {
                return None;
            }
            Some(GroupEntry {
                name: fields[0].to_string(),
                gid: fields[2].parse().ok()?,
                members: fields[3]
                    .split(',')
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
                    .collect(),
            })
        })
        .collect()
}

/// Resolved identity of the container process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecUser {
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    /// Supplementary groups from the group file
    pub sgids: Vec<u32>,
}

impl Default for ExecUser {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            home: "/".to_string(),
            sgids: Vec::new(),
        }
    }
}

/// Split a `user[:group]` spec
pub fn split_user_spec(spec: &str) -> (&str, Option<&str>) {
    match spec.split_once(':') {
        Some((user, group)) => (user, Some(group)),
        None => (spec, None),
    }
}

/// Identity files as the container will see them: a mount at the file or at
/// `/etc` takes precedence over the image's copy.
#[derive(Debug, Clone)]
pub struct IdentityFiles {
    pub passwd: PathBuf,
    pub group: PathBuf,
}

impl IdentityFiles {
    /// Locate the files for a root filesystem and mount list
    pub fn locate(rootfs: &Path, mounts: &[Mount]) -> Result<Self> {
        Ok(Self {
            passwd: locate_file(rootfs, mounts, "passwd")?,
            group: locate_file(rootfs, mounts, "group")?,
        })
    }

    fn read(path: &Path) -> Result<String> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn users(&self) -> Result<Vec<PasswdEntry>> {
        Ok(parse_passwd(&Self::read(&self.passwd)?))
    }

    pub fn groups(&self) -> Result<Vec<GroupEntry>> {
        Ok(parse_group(&Self::read(&self.group)?))
    }

    /// Find a user by name or numeric ID
    pub fn find_user(&self, user: &str) -> Result<Option<PasswdEntry>> {
        let uid: Option<u32> = user.parse().ok();
        Ok(self
            .users()?
            .into_iter()
            .find(|u| u.name == user || Some(u.uid) == uid))
    }

    /// Find a group by name or numeric ID
    pub fn find_group(&self, group: &str) -> Result<Option<GroupEntry>> {
        let gid: Option<u32> = group.parse().ok();
        Ok(self
            .groups()?
            .into_iter()
            .find(|g| g.name == group || Some(g.gid) == gid))
    }
}

fn locate_file(rootfs: &Path, mounts: &[Mount], name: &str) -> Result<PathBuf> {
    let file_dest = PathBuf::from("/etc").join(name);
    if let Some(source) = mounts
        .iter()
        .find(|m| m.destination() == &file_dest)
        .and_then(|m| m.source().clone())
    {
        return Ok(source);
    }
    if let Some(source) = mounts
        .iter()
        .find(|m| m.destination() == Path::new("/etc"))
        .and_then(|m| m.source().clone())
    {
        return Ok(source.join(name));
    }
    secure_join(rootfs, &file_dest)
}

/// Resolve a `user[:group]` spec against the container's identity files.
///
/// Numeric IDs need no entry; names must exist. A numeric user without an
/// entry gets GID 0 and home `/`.
pub fn lookup_user(files: &IdentityFiles, user_spec: &str) -> Result<ExecUser> {
    let mut exec = ExecUser::default();
    if user_spec.is_empty() {
        return Ok(exec);
    }
    let (user, group) = split_user_spec(user_spec);

    let entry = files.find_user(user)?;
    match (user.parse::<u32>(), &entry) {
        (Ok(uid), _) => exec.uid = uid,
        (Err(_), Some(entry)) => exec.uid = entry.uid,
        (Err(_), None) => {
            return Err(EngineError::Identity(format!(
                "unable to find user {}: no matching entries in passwd file",
                user
            )))
        }
    }
    if let Some(entry) = &entry {
        if entry.uid == exec.uid {
            exec.gid = entry.gid;
            exec.home = entry.home.clone();
            exec.sgids = files
                .groups()?
                .into_iter()
                .filter(|g| g.members.iter().any(|m| m == &entry.name) && g.gid != entry.gid)
                .map(|g| g.gid)
                .collect();
        }
    }

    if let Some(group) = group {
        exec.gid = resolve_group(files, group)?;
    }
    Ok(exec)
}

/// Resolve a group name or numeric ID to a GID
pub fn resolve_group(files: &IdentityFiles, group: &str) -> Result<u32> {
    if let Ok(gid) = group.parse::<u32>() {
        return Ok(gid);
    }
    files.find_group(group)?.map(|g| g.gid).ok_or_else(|| {
        EngineError::Identity(format!(
            "unable to find group {}: no matching entries in group file",
            group
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::runtime::MountBuilder;
    use tempfile::tempdir;

    const PASSWD: &str = "root:x:0:0:root:/root:/bin/sh\n\
                          daemon:x:2:2:daemon:/sbin:/sbin/nologin\n\
                          alice:x:1000:1000:Alice:/home/alice:/bin/bash\n";
    const GROUP: &str = "root:x:0:\nwheel:x:10:alice\nalice:x:1000:\naudio:x:63:alice,bob\n";

    fn rootfs() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(dir.path().join("etc/passwd"), PASSWD).unwrap();
        std::fs::write(dir.path().join("etc/group"), GROUP).unwrap();
        dir
    }

    #[test]
    fn test_parse_passwd_and_group() {
        let users = parse_passwd(PASSWD);
        assert_eq!(users.len(), 3);
        assert_eq!(users[2].home, "/home/alice");
        let groups = parse_group(GROUP);
        assert_eq!(groups[3].members, vec!["alice", "bob"]);
        assert!(parse_passwd("broken line\n").is_empty());
    }

    #[test]
    fn test_lookup_symbolic_user() {
        let root = rootfs();
        let files = IdentityFiles::locate(root.path(), &[]).unwrap();
        let user = lookup_user(&files, "alice").unwrap();
        assert_eq!(user.uid, 1000);
        assert_eq!(user.gid, 1000);
        assert_eq!(user.home, "/home/alice");
        assert_eq!(user.sgids, vec![10, 63]);
    }

    #[test]
    fn test_lookup_numeric_user_without_entry() {
        let root = rootfs();
        let files = IdentityFiles::locate(root.path(), &[]).unwrap();
        let user = lookup_user(&files, "4242").unwrap();
        assert_eq!(user, ExecUser { uid: 4242, gid: 0, home: "/".to_string(), sgids: vec![] });

        let user = lookup_user(&files, "4242:wheel").unwrap();
        assert_eq!(user.gid, 10);
    }

    #[test]
    fn test_lookup_errors() {
        let root = rootfs();
        let files = IdentityFiles::locate(root.path(), &[]).unwrap();
        assert!(matches!(lookup_user(&files, "nobody"), Err(EngineError::Identity(_))));
        assert!(lookup_user(&files, "alice:nogroup").is_err());
    }

    #[test]
    fn test_mount_overrides_image_file() {
        let root = rootfs();
        let other = tempdir().unwrap();
        let passwd = other.path().join("passwd");
        std::fs::write(&passwd, "carol:x:2000:2000::/home/carol:/bin/sh\n").unwrap();
        let mount = MountBuilder::default()
            .destination("/etc/passwd")
            .typ("bind")
            .source(passwd.clone())
            .build()
            .unwrap();

        let files = IdentityFiles::locate(root.path(), &[mount]).unwrap();
        assert_eq!(files.passwd, passwd);
        assert_eq!(lookup_user(&files, "carol").unwrap().uid, 2000);
        assert!(lookup_user(&files, "alice").is_err());
    }

    #[test]
    fn test_missing_files_are_empty() {
        let root = tempdir().unwrap();
        let files = IdentityFiles::locate(root.path(), &[]).unwrap();
        assert!(files.users().unwrap().is_empty());
        assert_eq!(lookup_user(&files, "").unwrap(), ExecUser::default());
    }
}
