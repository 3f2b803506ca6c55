//! Rune engine - container engine core
//!
//! The engine turns stored container configurations into runnable OCI
//! bundles and manages what the low-level runtime does not:
//!
//! - Runtime spec generation (mounts, devices, users, namespaces)
//! - Network namespace and root filesystem preparation
//! - Checkpoint, export, import and restore of running containers

pub mod checkpoint;
pub mod config;
pub mod container;
pub mod error;
pub mod launcher;
pub mod network;
pub mod platform;
pub mod prepare;
pub mod runtime;
pub mod spec;
pub mod storage;
pub mod util;

#[cfg(test)]
mod testing;

pub use error::{EngineError, Result};
pub use runtime::Runtime;
