//! Filesystem and process helpers shared across the engine

pub mod command;
pub mod path;

pub use path::{change_ownership, chown_if_needed, secure_join, write_file};

/// Whether the engine runs without root privileges
pub fn is_rootless() -> bool {
    // SAFETY: geteuid has no preconditions
    unsafe { libc::geteuid() != 0 }
}
