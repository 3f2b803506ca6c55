//! Host platform capabilities
//!
//! Everything that differs between host operating systems sits behind the
//! [`Platform`] trait. The implementation for the build target is picked at
//! compile time by [`native`]; shared logic never checks the OS itself.

pub mod freebsd;
pub mod linux;

use std::fs::Metadata;
use std::path::PathBuf;
use std::sync::Arc;

pub use freebsd::FreeBsdPlatform;
pub use linux::LinuxPlatform;

/// A command line to run on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl HostCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Host operating system capabilities
pub trait Platform: Send + Sync + std::fmt::Debug {
    /// Platform name
    fn name(&self) -> &'static str;

    /// Mount type used for bind mounts
    fn bind_mount_type(&self) -> &'static str;

    /// Options for a bind mount
    fn bind_options(&self, read_only: bool) -> Vec<String>;

    /// Whether runtime specs carry Linux namespaces
    fn supports_namespaces(&self) -> bool;

    /// Whether checkpoint and restore are available
    fn supports_checkpoint(&self) -> bool;

    /// Annotation naming the network jail or namespace to join, for platforms
    /// that have no namespace list in the runtime spec
    fn network_annotation(&self) -> Option<&'static str>;

    /// Name of the network namespace created for a container
    fn net_ns_name(&self, container_id: &str) -> String;

    /// Handle stored in container state for a created network namespace
    fn net_ns_handle(&self, name: &str) -> String;

    /// Command that creates a network namespace
    fn create_net_ns_command(&self, name: &str) -> HostCommand;

    /// Command that releases a network namespace
    fn release_net_ns_command(&self, name: &str) -> HostCommand;

    /// Path of a namespace of a running process
    fn process_namespace_path(&self, pid: u32, proc_name: &str) -> PathBuf;

    /// Device major and minor numbers of a device node
    fn device_numbers(&self, metadata: &Metadata) -> (i64, i64);

    /// Hostname of the host
    fn host_hostname(&self) -> String {
        gethostname::gethostname().to_string_lossy().into_owned()
    }
}

/// Platform of the build target
#[cfg(not(target_os = "freebsd"))]
pub fn native() -> Arc<dyn Platform> {
    Arc::new(LinuxPlatform)
}

/// Platform of the build target
#[cfg(target_os = "freebsd")]
pub fn native() -> Arc<dyn Platform> {
    Arc::new(FreeBsdPlatform)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_platform() {
        let platform = native();
        assert!(!platform.name().is_empty());
        assert!(!platform.host_hostname().is_empty());
    }

    #[test]
    fn test_platforms_differ() {
        let linux = LinuxPlatform;
        let freebsd = FreeBsdPlatform;
        assert_eq!(linux.bind_mount_type(), "bind");
        assert_eq!(freebsd.bind_mount_type(), "nullfs");
        assert!(linux.supports_namespaces());
        assert!(!freebsd.supports_namespaces());
        assert!(linux.network_annotation().is_none());
        assert!(freebsd.network_annotation().is_some());
    }
}
