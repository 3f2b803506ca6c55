//! Process command resolution

use crate::container::config::{ContainerConfig, ImageMetadata};
use crate::error::{EngineError, Result};
use std::path::{Path, PathBuf};

/// Where the init binary is mounted inside the container
pub const INIT_DESTINATION: &str = "/dev/init";

/// Build the process arguments.
///
/// An explicit entrypoint replaces the image's; a single empty string means
/// "no entrypoint". The image command is used only when neither a command
/// nor an explicit entrypoint was given.
pub fn make_command(config: &ContainerConfig, image: Option<&ImageMetadata>) -> Result<Vec<String>> {
    let entrypoint: Vec<String> = match (&config.entrypoint, image) {
        (Some(entrypoint), _) => entrypoint.clone(),
        (None, Some(image)) => image.entrypoint.clone().unwrap_or_default(),
        (None, None) => Vec::new(),
    };

    let mut command = Vec::new();
    if !(entrypoint.len() == 1 && entrypoint[0].is_empty()) {
        command.extend(entrypoint);
    }

    let explicit_entrypoint = config.entrypoint.as_ref().is_some_and(|e| !e.is_empty());
    if !config.command.is_empty() {
        command.extend(config.command.iter().cloned());
    } else if let (Some(image), false) = (image, explicit_entrypoint) {
        command.extend(image.cmd.iter().cloned());
    }

    if command.is_empty() {
        return Err(EngineError::NoCommand(config.id.clone()));
    }

    if config.init {
        let mut wrapped = vec![INIT_DESTINATION.to_string(), "--".to_string()];
        wrapped.extend(command);
        return Ok(wrapped);
    }
    Ok(command)
}

/// Host path of the init binary: the container's override, then the engine's
pub fn init_binary(config: &ContainerConfig, engine_init: Option<&Path>) -> Result<PathBuf> {
    config
        .init_path
        .clone()
        .or_else(|| engine_init.map(Path::to_path_buf))
        .ok_or_else(|| EngineError::config(&config.id, "init requested but no init binary is configured"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn image(entrypoint: Option<&[&str]>, cmd: &[&str]) -> ImageMetadata {
        ImageMetadata {
            entrypoint: entrypoint.map(strings),
            cmd: strings(cmd),
            ..Default::default()
        }
    }

    #[test]
    fn test_image_defaults() {
        let config = ContainerConfig::new("a", "img");
        let img = image(Some(&["/entry"]), &["serve"]);
        assert_eq!(make_command(&config, Some(&img)).unwrap(), strings(&["/entry", "serve"]));
    }

    #[test]
    fn test_explicit_command_keeps_image_entrypoint() {
        let config = ContainerConfig::new("a", "img").command(strings(&["debug"]));
        let img = image(Some(&["/entry"]), &["serve"]);
        assert_eq!(make_command(&config, Some(&img)).unwrap(), strings(&["/entry", "debug"]));
    }

    #[test]
    fn test_explicit_entrypoint_drops_image_cmd() {
        let config = ContainerConfig::new("a", "img").entrypoint(strings(&["/bin/sh"]));
        let img = image(Some(&["/entry"]), &["serve"]);
        assert_eq!(make_command(&config, Some(&img)).unwrap(), strings(&["/bin/sh"]));
    }

    #[test]
    fn test_empty_string_entrypoint_means_none() {
        let config = ContainerConfig::new("a", "img")
            .entrypoint(strings(&[""]))
            .command(strings(&["ls"]));
        let img = image(Some(&["/entry"]), &["serve"]);
        assert_eq!(make_command(&config, Some(&img)).unwrap(), strings(&["ls"]));
    }

    #[test]
    fn test_no_command() {
        let config = ContainerConfig::new("a", "img");
        let err = make_command(&config, Some(&image(None, &[]))).unwrap_err();
        assert!(matches!(err, EngineError::NoCommand(ref id) if id == &config.id));
        assert!(make_command(&config, None).is_err());
    }

    #[test]
    fn test_init_wraps_command() {
        let mut config = ContainerConfig::new("a", "img").command(strings(&["app"]));
        config.init = true;
        assert_eq!(make_command(&config, None).unwrap(), strings(&["/dev/init", "--", "app"]));

        assert!(init_binary(&config, None).is_err());
        assert_eq!(
            init_binary(&config, Some(Path::new("/usr/libexec/catatonit"))).unwrap(),
            PathBuf::from("/usr/libexec/catatonit")
        );
    }
}
