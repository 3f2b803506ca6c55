//! Device strings and host device nodes
//!
//! A device string is `SRC[:DST][:PERMISSIONS]`. PERMISSIONS is a non-empty
//! set of the letters `r`, `w`, `m`, each at most once.

use crate::error::{EngineError, Result};
use crate::platform::Platform;
use oci_spec::runtime::{
    LinuxDevice, LinuxDeviceBuilder, LinuxDeviceCgroup, LinuxDeviceCgroupBuilder, LinuxDeviceType,
    Mount, MountBuilder, Spec,
};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Permissions granted when a device string names none
pub const DEFAULT_DEVICE_PERMISSIONS: &str = "rwm";

/// A parsed device string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    /// Host path
    pub source: String,
    /// Path inside the container
    pub destination: String,
    /// Cgroup access letters
    pub permissions: String,
}

/// Whether `mode` is a valid permission string
pub fn is_valid_device_mode(mode: &str) -> bool {
    if mode.is_empty() {
        return false;
    }
    let mut seen = [false; 3];
    for c in mode.chars() {
        let slot = match c {
            'r' => 0,
            'w' => 1,
            'm' => 2,
            _ => return false,
        };
        if seen[slot] {
            return false;
        }
        seen[slot] = true;
    }
    true
}

/// Parse a device string
pub fn parse_device(device: &str) -> Result<DeviceSpec> {
    let fields: Vec<&str> = device.split(':').collect();
    let (source, destination, permissions) = match fields.as_slice() {
        [src] => (*src, *src, DEFAULT_DEVICE_PERMISSIONS),
        [src, second] if is_valid_device_mode(second) => (*src, *src, *second),
        [src, second] => {
            if !second.starts_with('/') {
                return Err(EngineError::InvalidDeviceMode(second.to_string()));
            }
            (*src, *second, DEFAULT_DEVICE_PERMISSIONS)
        }
        [src, dst, mode] => {
            if !is_valid_device_mode(mode) {
                return Err(EngineError::InvalidDeviceMode(mode.to_string()));
            }
            if !dst.starts_with('/') {
                return Err(EngineError::InvalidDevice(device.to_string()));
            }
            (*src, *dst, *mode)
        }
        _ => return Err(EngineError::InvalidDevice(device.to_string())),
    };

    if source.is_empty() {
        return Err(EngineError::InvalidDevice(device.to_string()));
    }

    Ok(DeviceSpec {
        source: source.to_string(),
        destination: destination.to_string(),
        permissions: permissions.to_string(),
    })
}

impl FromStr for DeviceSpec {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        parse_device(s)
    }
}

/// A host device node ready to be added to a spec
#[derive(Debug, Clone)]
pub struct HostDevice {
    pub device: LinuxDevice,
    pub rule: LinuxDeviceCgroup,
    pub source: PathBuf,
}

fn device_type(path: &Path, metadata: &std::fs::Metadata) -> Result<LinuxDeviceType> {
    let file_type = metadata.file_type();
    if file_type.is_block_device() {
        Ok(LinuxDeviceType::B)
    } else if file_type.is_char_device() {
        Ok(LinuxDeviceType::C)
    } else if file_type.is_fifo() {
        Ok(LinuxDeviceType::P)
    } else {
        Err(EngineError::InvalidDevice(format!(
            "{} is not a device node",
            path.display()
        )))
    }
}

fn host_device(
    source: &Path,
    destination: &Path,
    permissions: &str,
    platform: &dyn Platform,
) -> Result<HostDevice> {
    let metadata = std::fs::metadata(source)?;
    let typ = device_type(source, &metadata)?;
    let (major, minor) = platform.device_numbers(&metadata);

    let device = LinuxDeviceBuilder::default()
        .path(destination.to_path_buf())
        .typ(typ)
        .major(major)
        .minor(minor)
        .file_mode(metadata.mode() & 0o7777)
        .uid(metadata.uid())
        .gid(metadata.gid())
        .build()?;
    let rule = LinuxDeviceCgroupBuilder::default()
        .allow(true)
        .typ(typ)
        .major(major)
        .minor(minor)
        .access(permissions.to_string())
        .build()?;

    Ok(HostDevice {
        device,
        rule,
        source: source.to_path_buf(),
    })
}

/// Resolve a device string to host device nodes. A directory yields every
/// device node below it, placed under the destination directory.
pub fn host_devices(spec: &DeviceSpec, platform: &dyn Platform) -> Result<Vec<HostDevice>> {
    let source = Path::new(&spec.source);
    let metadata = std::fs::metadata(source).map_err(|e| {
        EngineError::InvalidDevice(format!("{}: {}", spec.source, e))
    })?;

    if !metadata.is_dir() {
        return Ok(vec![host_device(
            source,
            Path::new(&spec.destination),
            &spec.permissions,
            platform,
        )?]);
    }

    let mut devices = Vec::new();
    for entry in walkdir::WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| EngineError::Io(std::io::Error::other(e.to_string())))?;
        if entry.file_type().is_dir() || entry.file_type().is_symlink() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        let destination = Path::new(&spec.destination).join(relative);
        match host_device(entry.path(), &destination, &spec.permissions, platform) {
            Ok(device) => devices.push(device),
            Err(EngineError::InvalidDevice(msg)) => {
                tracing::debug!("Skipping {}: {}", entry.path().display(), msg)
            }
            Err(err) => return Err(err),
        }
    }
    Ok(devices)
}

/// Add a device node and its cgroup rule to a spec
pub fn add_device(spec: &mut Spec, device: HostDevice) -> Result<()> {
    let mut linux = spec.linux().clone().unwrap_or_default();

    let mut devices = linux.devices().clone().unwrap_or_default();
    devices.retain(|d| d.path() != device.device.path());
    devices.push(device.device);
    linux.set_devices(Some(devices));

    let mut resources = linux.resources().clone().unwrap_or_default();
    let mut rules = resources.devices().clone().unwrap_or_default();
    rules.push(device.rule);
    resources.set_devices(Some(rules));
    linux.set_resources(Some(resources));

    spec.set_linux(Some(linux));
    Ok(())
}

/// Expose a device through a bind mount instead of a device node. Used when
/// the engine cannot create device nodes (rootless).
pub fn device_bind_mount(device: &HostDevice, platform: &dyn Platform) -> Result<Mount> {
    let mut options = platform.bind_options(false);
    options.push("nosuid".to_string());
    options.push("noexec".to_string());
    Ok(MountBuilder::default()
        .destination(device.device.path().clone())
        .typ(platform.bind_mount_type())
        .source(device.source.clone())
        .options(options)
        .build()?)
}

/// Add every device string of a container to its spec
pub fn add_devices(
    spec: &mut Spec,
    devices: &[String],
    platform: &dyn Platform,
    rootless: bool,
) -> Result<()> {
    for device in devices {
        let parsed = parse_device(device)?;
        for host in host_devices(&parsed, platform)? {
            if rootless {
                let mount = device_bind_mount(&host, platform)?;
                let mut mounts = spec.mounts().clone().unwrap_or_default();
                mounts.retain(|m| m.destination() != mount.destination());
                mounts.push(mount);
                spec.set_mounts(Some(mounts));
            } else {
                add_device(spec, host)?;
            }
        }
    }
    Ok(())
}
