//! Device-injection registry
//!
//! Vendor spec files (JSON) describe named devices as a set of edits to the
//! runtime spec: environment, device nodes and mounts. Devices are requested
//! by fully-qualified name, `vendor.com/class=name`.

use super::device::{add_device, HostDevice};
use super::mount::upsert_mount;
use crate::error::{EngineError, Result};
use crate::platform::Platform;
use oci_spec::runtime::{
    LinuxDeviceBuilder, LinuxDeviceCgroupBuilder, LinuxDeviceType, MountBuilder, Spec,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Edits applied to a spec
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerEdits {
    pub env: Vec<String>,
    pub device_nodes: Vec<DeviceNode>,
    pub mounts: Vec<EditMount>,
}

/// A device node edit
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNode {
    pub path: String,
    #[serde(default)]
    pub host_path: Option<String>,
    #[serde(default, rename = "type")]
    pub typ: Option<String>,
    #[serde(default)]
    pub major: Option<i64>,
    #[serde(default)]
    pub minor: Option<i64>,
    #[serde(default)]
    pub permissions: Option<String>,
}

/// A mount edit
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMount {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// A named device
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdiDevice {
    pub name: String,
    #[serde(default)]
    pub container_edits: ContainerEdits,
}

/// One vendor spec file
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdiSpec {
    pub cdi_version: String,
    pub kind: String,
    #[serde(default)]
    pub devices: Vec<CdiDevice>,
    /// Edits applied once when any device of this kind is injected
    #[serde(default)]
    pub container_edits: ContainerEdits,
}

/// Loaded vendor specs, keyed by kind
#[derive(Debug, Clone, Default)]
pub struct CdiRegistry {
    specs: BTreeMap<String, CdiSpec>,
    errors: Vec<String>,
}

impl CdiRegistry {
    /// Load every `*.json` spec from the given directories. Unreadable or
    /// invalid files are recorded and skipped.
    pub fn load(dirs: &[PathBuf]) -> Self {
        let mut registry = Self::default();
        for dir in dirs {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    registry.errors.push(format!("{}: {}", dir.display(), e));
                    continue;
                }
            };
            let mut paths: Vec<PathBuf> = entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            paths.sort();
            for path in paths {
                match Self::read_spec(&path) {
                    Ok(spec) => {
                        registry.specs.insert(spec.kind.clone(), spec);
                    }
                    Err(e) => registry.errors.push(format!("{}: {}", path.display(), e)),
                }
            }
        }
        registry
    }

    fn read_spec(path: &Path) -> Result<CdiSpec> {
        let content = std::fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Errors seen while loading
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    fn find(&self, qualified: &str) -> Result<(&CdiSpec, &CdiDevice)> {
        let (kind, name) = qualified.split_once('=').ok_or_else(|| {
            EngineError::DeviceInjection(format!("{} is not a fully-qualified device name", qualified))
        })?;
        let spec = self
            .specs
            .get(kind)
            .ok_or_else(|| EngineError::DeviceInjection(format!("unresolvable device {}", qualified)))?;
        let device = spec
            .devices
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| EngineError::DeviceInjection(format!("unresolvable device {}", qualified)))?;
        Ok((spec, device))
    }

    /// Apply the edits of the named devices to a spec
    pub fn inject(&self, spec: &mut Spec, devices: &[String], platform: &dyn Platform) -> Result<()> {
        let mut kinds_applied: Vec<&str> = Vec::new();
        for qualified in devices {
            let (cdi_spec, device) = self.find(qualified)?;
            if !kinds_applied.contains(&cdi_spec.kind.as_str()) {
                apply_edits(spec, &cdi_spec.container_edits, platform)?;
                kinds_applied.push(&cdi_spec.kind);
            }
            apply_edits(spec, &device.container_edits, platform)?;
            tracing::debug!("Injected device {}", qualified);
        }
        Ok(())
    }
}

fn parse_type(typ: Option<&str>) -> Result<Option<LinuxDeviceType>> {
    match typ {
        None => Ok(None),
        Some("c") | Some("u") => Ok(Some(LinuxDeviceType::C)),
        Some("b") => Ok(Some(LinuxDeviceType::B)),
        Some("p") => Ok(Some(LinuxDeviceType::P)),
        Some(other) => Err(EngineError::DeviceInjection(format!("invalid device type {}", other))),
    }
}

fn device_node(node: &DeviceNode, platform: &dyn Platform) -> Result<HostDevice> {
    let host_path = PathBuf::from(node.host_path.as_deref().unwrap_or(&node.path));
    let permissions = node.permissions.clone().unwrap_or_else(|| "rwm".to_string());

    let (typ, major, minor) = match (parse_type(node.typ.as_deref())?, node.major, node.minor) {
        (Some(typ), Some(major), Some(minor)) => (typ, major, minor),
        _ => {
            let spec = super::device::DeviceSpec {
                source: host_path.display().to_string(),
                destination: node.path.clone(),
                permissions: permissions.clone(),
            };
            let host = super::device::host_devices(&spec, platform)
                .map_err(|e| EngineError::DeviceInjection(e.to_string()))?;
            return host.into_iter().next().ok_or_else(|| {
                EngineError::DeviceInjection(format!("{} is not a device node", host_path.display()))
            });
        }
    };

    let device = LinuxDeviceBuilder::default()
        .path(PathBuf::from(&node.path))
        .typ(typ)
        .major(major)
        .minor(minor)
        .build()?;
    let rule = LinuxDeviceCgroupBuilder::default()
        .allow(true)
        .typ(typ)
        .major(major)
        .minor(minor)
        .access(permissions)
        .build()?;
    Ok(HostDevice {
        device,
        rule,
        source: host_path,
    })
}

fn apply_edits(spec: &mut Spec, edits: &ContainerEdits, platform: &dyn Platform) -> Result<()> {
    if !edits.env.is_empty() {
        let mut process = spec.process().clone().unwrap_or_default();
        let mut env = process.env().clone().unwrap_or_default();
        for var in &edits.env {
            let key = var.split('=').next().unwrap_or(var);
            env.retain(|e| e.split('=').next() != Some(key));
            env.push(var.clone());
        }
        process.set_env(Some(env));
        spec.set_process(Some(process));
    }

    for node in &edits.device_nodes {
        add_device(spec, device_node(node, platform)?)?;
    }

    if !edits.mounts.is_empty() {
        let mut mounts = spec.mounts().clone().unwrap_or_default();
        for edit in &edits.mounts {
            let options = if edit.options.is_empty() {
                platform.bind_options(false)
            } else {
                edit.options.clone()
            };
            let mount = MountBuilder::default()
                .destination(edit.container_path.as_str())
                .typ(platform.bind_mount_type())
                .source(edit.host_path.as_str())
                .options(options)
                .build()?;
            upsert_mount(&mut mounts, mount);
        }
        spec.set_mounts(Some(mounts));
    }
    Ok(())
}
