//! Scoped path resolution and ownership changes

use crate::error::{EngineError, Result};
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

/// Symlinks followed before giving up
const MAX_SYMLINKS: usize = 255;

const PARENT: &str = "..";

/// Join `unsafe_path` onto `root`, resolving symlinks as if `root` were `/`.
///
/// The result is always inside `root`: `..` never climbs above it and absolute
/// symlink targets are re-rooted. Components that do not exist are appended
/// verbatim.
pub fn secure_join(root: &Path, unsafe_path: impl AsRef<Path>) -> Result<PathBuf> {
    let mut resolved = PathBuf::new();
    let mut pending: Vec<OsString> = split_reversed(unsafe_path.as_ref());
    let mut links = 0;

    while let Some(part) = pending.pop() {
        if part == PARENT {
            resolved.pop();
            continue;
        }

        let candidate = resolved.join(&part);
        let full = root.join(&candidate);
        match fs::symlink_metadata(&full) {
            Ok(meta) if meta.file_type().is_symlink() => {
                links += 1;
                if links > MAX_SYMLINKS {
                    return Err(EngineError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("too many symlinks resolving {}", unsafe_path.as_ref().display()),
                    )));
                }
                let target = fs::read_link(&full)?;
                if target.is_absolute() {
                    resolved = PathBuf::new();
                }
                pending.extend(split_reversed(&target));
            }
            _ => resolved = candidate,
        }
    }

    Ok(root.join(resolved))
}

/// Components of `path` in reverse order, kept as raw OS strings
fn split_reversed(path: &Path) -> Vec<OsString> {
    let mut parts: Vec<OsString> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_os_string()),
            Component::ParentDir => Some(OsString::from(PARENT)),
            _ => None,
        })
        .collect();
    parts.reverse();
    parts
}

/// Change ownership of `path`, optionally recursing into directories.
/// Symlinks are not followed.
pub fn change_ownership(path: &Path, recurse: bool, uid: u32, gid: u32) -> Result<()> {
    if !recurse {
        std::os::unix::fs::lchown(path, Some(uid), Some(gid))?;
        return Ok(());
    }
    for entry in walkdir::WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|e| EngineError::Io(std::io::Error::other(e.to_string())))?;
        std::os::unix::fs::lchown(entry.path(), Some(uid), Some(gid))?;
    }
    Ok(())
}

/// Chown `path` only if its current owner differs
pub fn chown_if_needed(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.uid() == uid && meta.gid() == gid {
        return Ok(());
    }
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))?;
    Ok(())
}

/// Write `content` to `dir/name`, replacing any existing file
pub fn write_file(dir: &Path, name: &str, content: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(name);
    let mut file = fs::File::create(&path)?;
    file.write_all(content.as_bytes())?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    #[test]
    fn test_secure_join_plain() {
        let root = tempdir().unwrap();
        let joined = secure_join(root.path(), "/etc/passwd").unwrap();
        assert_eq!(joined, root.path().join("etc/passwd"));
    }

    #[test]
    fn test_secure_join_dotdot_stays_inside() {
        let root = tempdir().unwrap();
        let joined = secure_join(root.path(), "/../../etc/../../shadow").unwrap();
        assert_eq!(joined, root.path().join("shadow"));
    }

    #[test]
    fn test_secure_join_absolute_symlink_rerooted() {
        let root = tempdir().unwrap();
        fs::create_dir_all(root.path().join("real/tmp")).unwrap();
        symlink("/real/tmp", root.path().join("tmp")).unwrap();

        let joined = secure_join(root.path(), "/tmp/cache").unwrap();
        assert_eq!(joined, root.path().join("real/tmp/cache"));
    }

    #[test]
    fn test_secure_join_relative_symlink() {
        let root = tempdir().unwrap();
        fs::create_dir_all(root.path().join("var/run")).unwrap();
        symlink("../var/run", root.path().join("run_link")).unwrap();
        fs::create_dir_all(root.path().join("x")).unwrap();
        symlink("../var/run", root.path().join("x/link")).unwrap();

        let joined = secure_join(root.path(), "/x/link").unwrap();
        assert_eq!(joined, root.path().join("var/run"));
    }

    #[test]
    fn test_secure_join_symlink_loop() {
        let root = tempdir().unwrap();
        symlink("/b", root.path().join("a")).unwrap();
        symlink("/a", root.path().join("b")).unwrap();
        assert!(secure_join(root.path(), "/a").is_err());
    }

    #[test]
    fn test_chown_if_needed_noop_for_current_owner() {
        let dir = tempdir().unwrap();
        let meta = fs::metadata(dir.path()).unwrap();
        chown_if_needed(dir.path(), meta.uid(), meta.gid()).unwrap();
        change_ownership(dir.path(), true, meta.uid(), meta.gid()).unwrap();
    }

    #[test]
    fn test_write_file() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir.path().join("sub"), "hosts", "127.0.0.1 localhost\n").unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "127.0.0.1 localhost\n");
    }

    #[test]
    fn test_secure_join_keeps_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let root = tempdir().unwrap();
        let name = OsStr::from_bytes(b"caf\xe9");
        std::fs::create_dir_all(root.path().join("data")).unwrap();
        std::fs::write(root.path().join("data").join(name), "latin1").unwrap();

        let joined = secure_join(root.path(), Path::new("/data").join(name)).unwrap();
        assert_eq!(joined, root.path().join("data").join(name));
        assert_eq!(std::fs::read_to_string(joined).unwrap(), "latin1");
    }
}
