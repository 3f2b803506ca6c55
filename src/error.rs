//! Error types for the engine core

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine error types
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid configuration for container {id}: {message}")]
    InvalidConfig { id: String, message: String },

    #[error("Invalid device specification: {0}")]
    InvalidDevice(String),

    #[error("Invalid device mode: {0}")]
    InvalidDeviceMode(String),

    #[error("Container {0}: no command or entrypoint provided, and no CMD or ENTRYPOINT from image")]
    NoCommand(String),

    #[error("Container {id}: must specify both upperdir and workdir for overlay volume {volume}")]
    OverlayPair { id: String, volume: String },

    #[error("Cannot find specified {kind} namespace path {path}")]
    NamespacePathMissing { kind: String, path: String },

    #[error("Container {id} is {state}, cannot {operation}")]
    InvalidState {
        id: String,
        state: String,
        operation: String,
    },

    #[error("A complete checkpoint for container {0} cannot be found, cannot restore")]
    CheckpointNotFound(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Capability error: {0}")]
    Capability(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container already exists: {0}")]
    ContainerExists(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Volume error: {0}")]
    Volume(String),

    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Device injection error: {0}")]
    DeviceInjection(String),

    #[error("Launcher error: {0}")]
    Launcher(String),

    #[error("Dump engine error: {0}")]
    DumpEngine(String),

    #[error("Statistics error: {0}")]
    Statistics(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("OCI spec error: {0}")]
    OciSpec(#[from] oci_spec::OciSpecError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad classification of an [`EngineError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid user input; nothing was mutated
    Configuration,
    /// The container or host is not in a state that allows the operation
    Precondition,
    /// An external dependency lacks a required capability
    Capability,
    /// The operation is not available on this platform
    NotSupported,
    /// Everything else
    Runtime,
}

impl EngineError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidConfig { .. }
            | EngineError::InvalidDevice(_)
            | EngineError::InvalidDeviceMode(_)
            | EngineError::NoCommand(_)
            | EngineError::OverlayPair { .. } => ErrorKind::Configuration,
            EngineError::NamespacePathMissing { .. }
            | EngineError::InvalidState { .. }
            | EngineError::CheckpointNotFound(_)
            | EngineError::ContainerNotFound(_)
            | EngineError::ContainerExists(_) => ErrorKind::Precondition,
            EngineError::Capability(_) => ErrorKind::Capability,
            EngineError::NotSupported(_) => ErrorKind::NotSupported,
            _ => ErrorKind::Runtime,
        }
    }

    /// Shorthand for [`EngineError::InvalidConfig`]
    pub fn config(id: &str, message: impl Into<String>) -> Self {
        EngineError::InvalidConfig {
            id: id.to_string(),
            message: message.into(),
        }
    }

    /// Shorthand for [`EngineError::InvalidState`]
    pub fn state(id: &str, state: impl std::fmt::Display, operation: &str) -> Self {
        EngineError::InvalidState {
            id: id.to_string(),
            state: state.to_string(),
            operation: operation.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::Yaml(err.to_string())
    }
}

/// Collects one primary error and any number of advisory ones.
///
/// The first error recorded is the primary and is the only one handed back
/// to the caller. Everything recorded afterwards is logged when the
/// accumulator is finished.
#[derive(Debug, Default)]
pub struct ErrorAccumulator {
    context: String,
    primary: Option<EngineError>,
    secondary: Vec<EngineError>,
}

impl ErrorAccumulator {
    /// Create an accumulator; `context` prefixes logged secondary errors
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            primary: None,
            secondary: Vec::new(),
        }
    }

    /// Record an error
    pub fn push(&mut self, err: EngineError) {
        if self.primary.is_none() {
            self.primary = Some(err);
        } else {
            self.secondary.push(err);
        }
    }

    /// Record the error of a result, if any
    pub fn record<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.push(err);
                None
            }
        }
    }

    /// Whether any error was recorded
    pub fn is_empty(&self) -> bool {
        self.primary.is_none()
    }

    /// The primary error, if one was recorded
    pub fn primary(&self) -> Option<&EngineError> {
        self.primary.as_ref()
    }

    /// Errors recorded after the primary one
    pub fn secondary(&self) -> &[EngineError] {
        &self.secondary
    }

    /// Log advisory errors and return the primary one
    pub fn finish(self) -> Result<()> {
        for err in &self.secondary {
            tracing::warn!("{}: {}", self.context, err);
        }
        match self.primary {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            EngineError::InvalidDevice("x".to_string()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            EngineError::CheckpointNotFound("abc".to_string()).kind(),
            ErrorKind::Precondition
        );
        assert_eq!(
            EngineError::NotSupported("pod restore".to_string()).kind(),
            ErrorKind::NotSupported
        );
        assert_eq!(
            EngineError::Capability("criu".to_string()).kind(),
            ErrorKind::Capability
        );
        assert_eq!(
            EngineError::Network("boom".to_string()).kind(),
            ErrorKind::Runtime
        );
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = EngineError::state("abc123", "stopped", "checkpoint");
        assert_eq!(err.to_string(), "Container abc123 is stopped, cannot checkpoint");

        let err = EngineError::config("abc123", "invalid umask 99");
        assert!(err.to_string().contains("abc123"));
        assert!(err.to_string().contains("99"));
    }

    #[test]
    fn test_accumulator_keeps_first_error() {
        let mut acc = ErrorAccumulator::new("preparing container");
        assert!(acc.is_empty());
        acc.push(EngineError::Network("first".to_string()));
        acc.push(EngineError::Storage("second".to_string()));

        assert_eq!(acc.secondary().len(), 1);
        match acc.finish() {
            Err(EngineError::Network(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_accumulator_record() {
        let mut acc = ErrorAccumulator::new("cleanup");
        assert_eq!(acc.record(Ok::<_, EngineError>(5)), Some(5));
        assert!(acc.is_empty());
        assert_eq!(acc.record::<()>(Err(EngineError::Internal("x".into()))), None);
        assert!(acc.primary().is_some());
        assert!(acc.finish().is_err());
    }
}
