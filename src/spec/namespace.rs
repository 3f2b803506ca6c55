//! Namespace resolution
//!
//! Each namespace kind resolves to one action on the runtime spec: drop the
//! namespace (share the host's), create a fresh one, or join an existing one.
//! Namespaces shared with another container resolve to [`NamespaceAction::Inherit`]
//! at create time and become a join once that container is running.

use crate::container::config::{ContainerConfig, NamespaceKind, NamespaceMode};
use crate::container::state::ContainerPhase;
use crate::container::store::ContainerLookup;
use crate::error::{EngineError, Result};
use crate::platform::Platform;
use oci_spec::runtime::{
    LinuxIdMapping, LinuxIdMappingBuilder, LinuxNamespace, LinuxNamespaceBuilder, Spec,
};
use std::collections::HashMap;
use std::path::PathBuf;

/// What to do with one namespace kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceAction {
    /// Remove it from the spec; the container shares the host's
    Remove,
    /// Create a new one
    Create,
    /// Join the namespace at a path
    Join(PathBuf),
    /// Share the namespace of another container
    Inherit(String),
}

/// Resolve the action for one namespace kind
pub fn resolve_namespace(config: &ContainerConfig, kind: NamespaceKind) -> Result<NamespaceAction> {
    match config.namespaces.mode(kind) {
        NamespaceMode::Host => Ok(NamespaceAction::Remove),
        NamespaceMode::Private | NamespaceMode::NoNetwork => {
            if kind == NamespaceKind::User
                && (config.id_mappings.uid_map.is_empty() || config.id_mappings.gid_map.is_empty())
            {
                return Err(EngineError::config(
                    &config.id,
                    "a private user namespace requires UID and GID mappings",
                ));
            }
            Ok(NamespaceAction::Create)
        }
        NamespaceMode::Path(path) => {
            if !path.exists() {
                return Err(EngineError::NamespacePathMissing {
                    kind: kind.to_string(),
                    path: path.display().to_string(),
                });
            }
            Ok(NamespaceAction::Join(path.clone()))
        }
        NamespaceMode::FromContainer(id) => Ok(NamespaceAction::Inherit(id.clone())),
        NamespaceMode::FromPod => config
            .pod
            .as_ref()
            .and_then(|pod| pod.infra_id.clone())
            .map(NamespaceAction::Inherit)
            .ok_or_else(|| {
                EngineError::config(
                    &config.id,
                    format!("{} namespace shared with a pod, but the container has no pod infra container", kind),
                )
            }),
    }
}

fn set_namespace(spec: &mut Spec, kind: NamespaceKind, path: Option<PathBuf>) -> Result<()> {
    let mut linux = spec.linux().clone().unwrap_or_default();
    let mut namespaces: Vec<LinuxNamespace> = linux.namespaces().clone().unwrap_or_default();
    namespaces.retain(|ns| ns.typ() != kind.oci_type());

    let mut builder = LinuxNamespaceBuilder::default().typ(kind.oci_type());
    if let Some(path) = path {
        builder = builder.path(path);
    }
    namespaces.push(builder.build()?);
    linux.set_namespaces(Some(namespaces));
    spec.set_linux(Some(linux));
    Ok(())
}

fn remove_namespace(spec: &mut Spec, kind: NamespaceKind) {
    if let Some(mut linux) = spec.linux().clone() {
        if let Some(mut namespaces) = linux.namespaces().clone() {
            namespaces.retain(|ns| ns.typ() != kind.oci_type());
            linux.set_namespaces(Some(namespaces));
        }
        spec.set_linux(Some(linux));
    }
}

fn id_mappings(maps: &[crate::container::config::IdMap]) -> Result<Vec<LinuxIdMapping>> {
    maps.iter()
        .map(|m| {
            LinuxIdMappingBuilder::default()
                .container_id(m.container_id)
                .host_id(m.host_id)
                .size(m.size)
                .build()
                .map_err(EngineError::from)
        })
        .collect()
}

/// Apply the create-time namespace configuration to a spec
pub fn apply_namespaces(spec: &mut Spec, config: &ContainerConfig, platform: &dyn Platform) -> Result<()> {
    if !platform.supports_namespaces() {
        return Ok(());
    }

    for kind in NamespaceKind::ALL {
        match resolve_namespace(config, kind)? {
            NamespaceAction::Remove => remove_namespace(spec, kind),
            NamespaceAction::Create | NamespaceAction::Inherit(_) => set_namespace(spec, kind, None)?,
            NamespaceAction::Join(path) => set_namespace(spec, kind, Some(path))?,
        }
    }

    if config.namespaces.user != NamespaceMode::Host {
        let mut linux = spec.linux().clone().unwrap_or_default();
        linux.set_uid_mappings(Some(id_mappings(&config.id_mappings.uid_map)?));
        linux.set_gid_mappings(Some(id_mappings(&config.id_mappings.gid_map)?));
        spec.set_linux(Some(linux));
    }
    Ok(())
}

/// Point inherited namespaces at the running container that owns them
pub fn join_dependency_namespaces(
    spec: &mut Spec,
    config: &ContainerConfig,
    lookup: &dyn ContainerLookup,
    platform: &dyn Platform,
) -> Result<()> {
    if !platform.supports_namespaces() {
        return Ok(());
    }
    for kind in NamespaceKind::ALL {
        if let NamespaceAction::Inherit(dep_id) = resolve_namespace(config, kind)? {
            let dep = lookup.lookup(&dep_id)?;
            let pid = match (dep.state.phase, dep.state.pid) {
                (ContainerPhase::Running, Some(pid)) => pid,
                (phase, _) => {
                    return Err(EngineError::state(
                        dep.id(),
                        phase,
                        &format!("share its {} namespace with {}", kind, config.id),
                    ))
                }
            };
            let path = if kind == NamespaceKind::Network {
                dep.state
                    .net_ns
                    .clone()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| platform.process_namespace_path(pid, kind.proc_name()))
            } else {
                platform.process_namespace_path(pid, kind.proc_name())
            };
            set_namespace(spec, kind, Some(path))?;
        }
    }
    Ok(())
}

/// Point the spec's network namespace at a namespace handle. Platforms
/// without namespaces name the network jail through an annotation.
pub fn set_network_namespace(spec: &mut Spec, platform: &dyn Platform, handle: &str) -> Result<()> {
    if let Some(key) = platform.network_annotation() {
        let mut annotations: HashMap<String, String> = spec.annotations().clone().unwrap_or_default();
        annotations.insert(key.to_string(), handle.to_string());
        spec.set_annotations(Some(annotations));
        return Ok(());
    }
    set_namespace(spec, NamespaceKind::Network, Some(PathBuf::from(handle)))
}

/// Hostname precedence: explicit, pod, dependency container, host
/// (when sharing the host UTS or network namespace). `None` leaves the
/// choice to the runtime default.
pub fn resolve_hostname(
    config: &ContainerConfig,
    lookup: &dyn ContainerLookup,
    platform: &dyn Platform,
) -> Result<Option<String>> {
    if !config.hostname.is_empty() {
        return Ok(Some(config.hostname.clone()));
    }
    match &config.namespaces.uts {
        // An empty pod hostname falls through to the host check below
        NamespaceMode::FromPod => {
            if let Some(pod) = &config.pod {
                if !pod.hostname.is_empty() {
                    return Ok(Some(pod.hostname.clone()));
                }
            }
        }
        NamespaceMode::FromContainer(dep_id) => {
            let dep = lookup.lookup(dep_id)?;
            return Ok(Some(dep.hostname()));
        }
        _ => {}
    }
    if config.namespaces.uts.is_host() || config.namespaces.net.is_host() {
        return Ok(Some(platform.host_hostname()));
    }
    Ok(None)
}

/// Set the spec hostname and `HOSTNAME` variable for a create-time spec
pub fn apply_hostname(
    spec: &mut Spec,
    config: &ContainerConfig,
    lookup: &dyn ContainerLookup,
    platform: &dyn Platform,
) -> Result<()> {
    let hostname = match resolve_hostname(config, lookup, platform)? {
        Some(hostname) => hostname,
        None => return Ok(()),
    };
    if !config.hostname.is_empty() || !config.namespaces.uts.is_host() {
        spec.set_hostname(Some(hostname.clone()));
    }
    add_env_if_absent(spec, "HOSTNAME", &hostname);
    Ok(())
}

/// Add `KEY=value` to the process environment unless `KEY` is already set
pub fn add_env_if_absent(spec: &mut Spec, key: &str, value: &str) {
    let mut process = spec.process().clone().unwrap_or_default();
    let mut env = process.env().clone().unwrap_or_default();
    let prefix = format!("{}=", key);
    if env.iter().any(|e| e.starts_with(&prefix)) {
        return;
    }
    env.push(format!("{}={}", key, value));
    process.set_env(Some(env));
    spec.set_process(Some(process));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::config::{IdMap, PodRef};
    use crate::container::runtime::Container;
    use crate::container::state::ContainerState;
    use crate::platform::{FreeBsdPlatform, LinuxPlatform};
    use oci_spec::runtime::LinuxNamespaceType;
    use std::collections::HashMap;
    use std::path::Path;

    struct Fixed(HashMap<String, Container>);

    impl ContainerLookup for Fixed {
        fn lookup(&self, id: &str) -> Result<Container> {
            self.0
                .get(id)
                .cloned()
                .ok_or_else(|| EngineError::ContainerNotFound(id.to_string()))
        }
    }

    fn dependency(id: &str, hostname: &str, pid: Option<u32>) -> Container {
        let mut config = ContainerConfig::new(id, "img");
        config.id = id.to_string();
        config.hostname = hostname.to_string();
        let mut state = ContainerState::default();
        if let Some(pid) = pid {
            state.phase = ContainerPhase::Running;
            state.pid = Some(pid);
        }
        Container::new(config, state, Path::new("/c"), Path::new("/r"))
    }

    fn lookup_with(containers: Vec<Container>) -> Fixed {
        Fixed(containers.into_iter().map(|c| (c.id().to_string(), c)).collect())
    }

    fn namespace(spec: &Spec, typ: LinuxNamespaceType) -> Option<LinuxNamespace> {
        spec.linux()
            .as_ref()
            .and_then(|l| l.namespaces().clone())
            .and_then(|ns| ns.into_iter().find(|n| n.typ() == typ))
    }

    #[test]
    fn test_resolve_modes() {
        let mut config = ContainerConfig::new("a", "img");
        assert_eq!(resolve_namespace(&config, NamespaceKind::Pid).unwrap(), NamespaceAction::Create);
        assert_eq!(resolve_namespace(&config, NamespaceKind::User).unwrap(), NamespaceAction::Remove);

        config.namespaces.ipc = NamespaceMode::FromContainer("dep".to_string());
        assert_eq!(
            resolve_namespace(&config, NamespaceKind::Ipc).unwrap(),
            NamespaceAction::Inherit("dep".to_string())
        );
    }

    #[test]
    fn test_missing_namespace_path() {
        let mut config = ContainerConfig::new("a", "img");
        config.namespaces.net = NamespaceMode::Path(PathBuf::from("/nonexistent/ns/net"));
        let err = resolve_namespace(&config, NamespaceKind::Network).unwrap_err();
        assert!(matches!(err, EngineError::NamespacePathMissing { .. }));
        assert!(err.to_string().contains("/nonexistent/ns/net"));
        assert_eq!(err.kind(), crate::error::ErrorKind::Precondition);
    }

    #[test]
    fn test_existing_namespace_path_is_joined() {
        let dir = tempfile::tempdir().unwrap();
        let ns = dir.path().join("net");
        std::fs::write(&ns, "").unwrap();
        let mut config = ContainerConfig::new("a", "img");
        config.namespaces.net = NamespaceMode::Path(ns.clone());

        let mut spec = Spec::default();
        apply_namespaces(&mut spec, &config, &LinuxPlatform).unwrap();
        let net = namespace(&spec, LinuxNamespaceType::Network).unwrap();
        assert_eq!(net.path().as_deref(), Some(ns.as_path()));
    }

    #[test]
    fn test_private_user_namespace_needs_mappings() {
        let mut config = ContainerConfig::new("a", "img");
        config.namespaces.user = NamespaceMode::Private;
        assert!(resolve_namespace(&config, NamespaceKind::User).is_err());

        config.id_mappings.uid_map = vec![IdMap { container_id: 0, host_id: 100000, size: 65536 }];
        config.id_mappings.gid_map = vec![IdMap { container_id: 0, host_id: 100000, size: 65536 }];
        let mut spec = Spec::default();
        apply_namespaces(&mut spec, &config, &LinuxPlatform).unwrap();
        assert!(namespace(&spec, LinuxNamespaceType::User).is_some());
        let linux = spec.linux().as_ref().unwrap();
        assert_eq!(linux.uid_mappings().as_ref().unwrap()[0].host_id(), 100000);
    }

    #[test]
    fn test_host_mode_removes_namespace() {
        let mut config = ContainerConfig::new("a", "img");
        config.namespaces.pid = NamespaceMode::Host;
        let mut spec = Spec::default();
        apply_namespaces(&mut spec, &config, &LinuxPlatform).unwrap();
        assert!(namespace(&spec, LinuxNamespaceType::Pid).is_none());
        assert!(namespace(&spec, LinuxNamespaceType::Ipc).is_some());
    }

    #[test]
    fn test_join_dependency_namespaces() {
        let mut config = ContainerConfig::new("a", "img");
        config.namespaces.ipc = NamespaceMode::FromContainer("dep".to_string());
        let mut spec = Spec::default();
        apply_namespaces(&mut spec, &config, &LinuxPlatform).unwrap();

        let stopped = lookup_with(vec![dependency("dep", "", None)]);
        let err = join_dependency_namespaces(&mut spec, &config, &stopped, &LinuxPlatform).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Precondition);

        let running = lookup_with(vec![dependency("dep", "", Some(77))]);
        join_dependency_namespaces(&mut spec, &config, &running, &LinuxPlatform).unwrap();
        let ipc = namespace(&spec, LinuxNamespaceType::Ipc).unwrap();
        assert_eq!(ipc.path().as_deref(), Some(Path::new("/proc/77/ns/ipc")));
    }

    #[test]
    fn test_hostname_precedence() {
        let lookup = lookup_with(vec![dependency("dep", "dephost", Some(1))]);
        let mut config = ContainerConfig::new("a", "img");
        assert_eq!(resolve_hostname(&config, &lookup, &LinuxPlatform).unwrap(), None);

        config.namespaces.uts = NamespaceMode::FromContainer("dep".to_string());
        assert_eq!(
            resolve_hostname(&config, &lookup, &LinuxPlatform).unwrap().as_deref(),
            Some("dephost")
        );

        config.namespaces.uts = NamespaceMode::FromPod;
        config.pod = Some(PodRef {
            id: "p".to_string(),
            name: "pod".to_string(),
            hostname: "podhost".to_string(),
            infra_id: None,
        });
        assert_eq!(
            resolve_hostname(&config, &lookup, &LinuxPlatform).unwrap().as_deref(),
            Some("podhost")
        );

        config.hostname = "explicit".to_string();
        assert_eq!(
            resolve_hostname(&config, &lookup, &LinuxPlatform).unwrap().as_deref(),
            Some("explicit")
        );

        let mut host = ContainerConfig::new("b", "img");
        host.namespaces.net = NamespaceMode::Host;
        assert_eq!(
            resolve_hostname(&host, &lookup, &LinuxPlatform).unwrap(),
            Some(LinuxPlatform.host_hostname())
        );
    }

    #[test]
    fn test_empty_pod_hostname_falls_through() {
        let lookup = lookup_with(vec![]);
        let mut config = ContainerConfig::new("a", "img");
        config.namespaces.uts = NamespaceMode::FromPod;
        config.pod = Some(PodRef {
            id: "p".to_string(),
            name: "pod".to_string(),
            hostname: String::new(),
            infra_id: None,
        });
        assert_eq!(resolve_hostname(&config, &lookup, &LinuxPlatform).unwrap(), None);

        config.namespaces.net = NamespaceMode::Host;
        assert_eq!(
            resolve_hostname(&config, &lookup, &LinuxPlatform).unwrap(),
            Some(LinuxPlatform.host_hostname())
        );
    }

    #[test]
    fn test_hostname_env_not_overridden() {
        let lookup = lookup_with(vec![]);
        let mut config = ContainerConfig::new("a", "img");
        config.hostname = "web".to_string();

        let mut spec = Spec::default();
        add_env_if_absent(&mut spec, "HOSTNAME", "mine");
        apply_hostname(&mut spec, &config, &lookup, &LinuxPlatform).unwrap();

        assert_eq!(spec.hostname().as_deref(), Some("web"));
        let env = spec.process().as_ref().unwrap().env().clone().unwrap();
        assert_eq!(env.iter().filter(|e| e.starts_with("HOSTNAME=")).count(), 1);
        assert!(env.contains(&"HOSTNAME=mine".to_string()));
    }

    #[test]
    fn test_network_annotation_on_jail_platform() {
        let mut spec = Spec::default();
        set_network_namespace(&mut spec, &FreeBsdPlatform, "abc-vnet").unwrap();
        let annotations = spec.annotations().clone().unwrap();
        assert_eq!(annotations["org.freebsd.parentJail"], "abc-vnet");

        let mut spec = Spec::default();
        set_network_namespace(&mut spec, &LinuxPlatform, "/run/netns/x").unwrap();
        let net = namespace(&spec, LinuxNamespaceType::Network).unwrap();
        assert_eq!(net.path().as_deref(), Some(Path::new("/run/netns/x")));
    }
}
