//! RamFS Core: in-memory hierarchical filesystem
//!
//! A tree of directories, regular files, symlinks and special nodes held
//! entirely in memory. [`MountSession`] is the entry point: it builds a
//! [`FilesystemTree`] from [`MountOptions`] and tears it down on unmount.
//! Nothing survives teardown.

pub mod config;
pub mod content;
pub mod directory;
pub mod error;
pub mod mount;
pub mod node;
pub mod tree;
pub mod types;

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-export key types for convenience
pub use config::{FsLimits, MemoryPolicy, MountOptions};
pub use content::{MemoryRegion, PAGE_SIZE};
pub use error::{FsError, FsResult};
pub use mount::{registry, FileSystemType, FsRegistry, MountSession, FS_TYPE_NAME};
pub use tree::FilesystemTree;
pub use types::*;

/// Lock `mutex`, carrying on with the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
