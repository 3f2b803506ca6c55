//! FreeBSD platform
//!
//! Containers are jails. Networking lives in a vnet jail that the container
//! jail is nested under, named through an annotation instead of a namespace.

use super::{HostCommand, Platform};
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

/// Annotation naming the parent jail
pub const PARENT_JAIL_ANNOTATION: &str = "org.freebsd.parentJail";

#[derive(Debug, Clone, Copy, Default)]
pub struct FreeBsdPlatform;

/// Split a FreeBSD `dev_t` into major and minor numbers
pub fn split_dev(dev: u64) -> (i64, i64) {
    let major = ((dev >> 32) & 0xffff_ff00) | ((dev >> 8) & 0xff);
    let minor = ((dev >> 24) & 0xff00) | (dev & 0xffff_00ff);
    (major as i64, minor as i64)
}

impl Platform for FreeBsdPlatform {
    fn name(&self) -> &'static str {
        "freebsd"
    }

    fn bind_mount_type(&self) -> &'static str {
        "nullfs"
    }

    fn bind_options(&self, read_only: bool) -> Vec<String> {
        vec![if read_only { "ro" } else { "rw" }.to_string()]
    }

    fn supports_namespaces(&self) -> bool {
        false
    }

    fn supports_checkpoint(&self) -> bool {
        false
    }

    fn network_annotation(&self) -> Option<&'static str> {
        Some(PARENT_JAIL_ANNOTATION)
    }

    fn net_ns_name(&self, container_id: &str) -> String {
        format!("{}-vnet", container_id)
    }

    fn net_ns_handle(&self, name: &str) -> String {
        name.to_string()
    }

    fn create_net_ns_command(&self, name: &str) -> HostCommand {
        let name = format!("name={}", name);
        HostCommand::new("jail", &["-c", &name, "vnet", "persist"])
    }

    fn release_net_ns_command(&self, name: &str) -> HostCommand {
        HostCommand::new("jail", &["-r", name])
    }

    fn process_namespace_path(&self, _pid: u32, _proc_name: &str) -> PathBuf {
        PathBuf::new()
    }

    fn device_numbers(&self, metadata: &Metadata) -> (i64, i64) {
        split_dev(metadata.rdev())
    }
}
