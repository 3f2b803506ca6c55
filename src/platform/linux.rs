//! Linux platform

use super::{HostCommand, Platform};
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

/// Directory where named network namespaces are pinned
const NETNS_DIR: &str = "/run/netns";

/// Linux: namespaces, bind mounts, checkpoint through the dump engine
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxPlatform;

/// Split a Linux `dev_t` into major and minor numbers
pub fn split_dev(dev: u64) -> (i64, i64) {
    let major = ((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff);
    let minor = (dev & 0xff) | ((dev >> 12) & !0xff);
    (major as i64, minor as i64)
}

impl Platform for LinuxPlatform {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn bind_mount_type(&self) -> &'static str {
        "bind"
    }

    fn bind_options(&self, read_only: bool) -> Vec<String> {
        let mut options = vec!["rbind".to_string(), "rprivate".to_string()];
        if read_only {
            options.push("ro".to_string());
        }
        options
    }

    fn supports_namespaces(&self) -> bool {
        true
    }

    fn supports_checkpoint(&self) -> bool {
        true
    }

    fn network_annotation(&self) -> Option<&'static str> {
        None
    }

    fn net_ns_name(&self, container_id: &str) -> String {
        format!("rune-{}", container_id)
    }

    fn net_ns_handle(&self, name: &str) -> String {
        format!("{}/{}", NETNS_DIR, name)
    }

    fn create_net_ns_command(&self, name: &str) -> HostCommand {
        HostCommand::new("ip", &["netns", "add", name])
    }

    fn release_net_ns_command(&self, name: &str) -> HostCommand {
        HostCommand::new("ip", &["netns", "delete", name])
    }

    fn process_namespace_path(&self, pid: u32, proc_name: &str) -> PathBuf {
        PathBuf::from(format!("/proc/{}/ns/{}", pid, proc_name))
    }

    fn device_numbers(&self, metadata: &Metadata) -> (i64, i64) {
        split_dev(metadata.rdev())
    }
}
