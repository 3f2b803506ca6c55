//! Container management module
//!
//! Configuration, persisted state and the store that keeps both on disk.

pub mod config;
pub mod runtime;
pub mod state;
pub mod store;

pub use config::{ContainerConfig, NamespaceKind, NamespaceMode};
pub use runtime::Container;
pub use state::{ContainerPhase, ContainerState, Lifecycle};
pub use store::{ContainerLookup, StateStore};
