//! Annotation keys written into runtime specs

use crate::container::config::ContainerConfig;
use chrono::SecondsFormat;
use std::collections::HashMap;

pub const AUTO_REMOVE: &str = "io.rune.annotations.autoremove";
pub const PRIVILEGED: &str = "io.rune.annotations.privileged";
pub const INIT: &str = "io.rune.annotations.init";
pub const PUBLISH_ALL: &str = "io.rune.annotations.publish-all";
pub const VOLUMES_FROM: &str = "io.rune.annotations.volumes-from";
pub const CREATED: &str = "io.rune.annotations.created";
pub const STOP_SIGNAL: &str = "org.opencontainers.image.stopSignal";
pub const CONTAINER_MANAGER: &str = "io.container.manager";

/// Value of [`CONTAINER_MANAGER`] for containers this engine creates
pub const MANAGER_NAME: &str = "rune";

fn flag(value: bool) -> String {
    if value { "true" } else { "false" }.to_string()
}

/// Annotations for a container's create-time spec. User annotations are
/// kept; the engine's own keys take precedence over them.
pub fn container_annotations(config: &ContainerConfig) -> HashMap<String, String> {
    let mut annotations: HashMap<String, String> = config
        .annotations
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    annotations
        .entry(CONTAINER_MANAGER.to_string())
        .or_insert_with(|| MANAGER_NAME.to_string());
    annotations.insert(AUTO_REMOVE.to_string(), flag(config.auto_remove));
    annotations.insert(PRIVILEGED.to_string(), flag(config.privileged));
    annotations.insert(INIT.to_string(), flag(config.init));
    annotations.insert(PUBLISH_ALL.to_string(), flag(config.publish_exposed_ports));
    if !config.volumes_from.is_empty() {
        annotations.insert(VOLUMES_FROM.to_string(), config.volumes_from.join(","));
    }
    annotations.insert(
        CREATED.to_string(),
        config.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
    );
    annotations.insert(STOP_SIGNAL.to_string(), config.stop_signal.to_string());
    annotations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_annotations() {
        let mut config = ContainerConfig::new("web", "nginx");
        config.auto_remove = true;
        config.publish_exposed_ports = true;
        config.volumes_from = vec!["a".to_string(), "b:ro".to_string()];
        config.annotations.insert(AUTO_REMOVE.to_string(), "false".to_string());
        config.annotations.insert("custom".to_string(), "x".to_string());

        let annotations = container_annotations(&config);
        assert_eq!(annotations[AUTO_REMOVE], "true");
        assert_eq!(annotations[PRIVILEGED], "false");
        assert_eq!(annotations[PUBLISH_ALL], "true");
        assert_eq!(annotations[VOLUMES_FROM], "a,b:ro");
        assert_eq!(annotations[STOP_SIGNAL], "15");
        assert_eq!(annotations[CONTAINER_MANAGER], "rune");
        assert_eq!(annotations["custom"], "x");
        assert!(annotations[CREATED].ends_with('Z'));
    }

    #[test]
    fn test_manager_not_overridden() {
        let mut config = ContainerConfig::new("web", "nginx");
        config.annotations.insert(CONTAINER_MANAGER.to_string(), "other".to_string());
        assert_eq!(container_annotations(&config)[CONTAINER_MANAGER], "other");
        assert!(!container_annotations(&config).contains_key(VOLUMES_FROM));
    }
}
