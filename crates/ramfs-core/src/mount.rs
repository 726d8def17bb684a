//! Mount sessions and the filesystem-type registry

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::config::MountOptions;
use crate::error::{FsError, FsResult};
use crate::lock;
use crate::tree::FilesystemTree;

/// Name this filesystem registers under
pub const FS_TYPE_NAME: &str = "ramfs";

/// Filesystem type flags
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FsTypeFlags {
    /// Mountable from inside a user namespace
    pub userns_mount: bool,
}

/// A mountable filesystem type as seen by the registry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileSystemType {
    pub name: String,
    pub flags: FsTypeFlags,
}

impl FileSystemType {
    /// The in-memory filesystem implemented by this crate.
    pub fn ramfs() -> Self {
        Self {
            name: FS_TYPE_NAME.to_string(),
            flags: FsTypeFlags { userns_mount: true },
        }
    }
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// One mounted instance: the handle returned to the host.
#[derive(Debug)]
pub struct MountSession {
    id: u64,
    fs_type: String,
    tree: Arc<FilesystemTree>,
}

impl MountSession {
    /// Mount a fresh, empty tree with `options`.
    pub fn mount(options: MountOptions) -> FsResult<Self> {
        Self::mount_as(FS_TYPE_NAME, options)
    }

    fn mount_as(fs_type: &str, options: MountOptions) -> FsResult<Self> {
        let tree = FilesystemTree::mount(options).map_err(|e| {
            error!("{} mounting failed: {}", fs_type, e);
            e
        })?;
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        info!(session = id, "{} mounted", fs_type);
        Ok(Self {
            id,
            fs_type: fs_type.to_string(),
            tree: Arc::new(tree),
        })
    }

    /// Parse `options` and mount.
    pub fn mount_with_str(options: &str) -> FsResult<Self> {
        Self::mount(MountOptions::parse(options)?)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fs_type(&self) -> &str {
        &self.fs_type
    }

    pub fn options(&self) -> &MountOptions {
        self.tree.options()
    }

    /// Shared handle on the mounted tree, for concurrent callers.
    pub fn tree(&self) -> Arc<FilesystemTree> {
        self.tree.clone()
    }

    /// Tear the tree down. Content is gone afterwards.
    pub fn unmount(self) {
        debug!(session = self.id, "killing {} instance", self.fs_type);
        self.tree.teardown();
        info!(session = self.id, "{} unmounted", self.fs_type);
    }
}

/// Table of registered filesystem types, used to route mount requests
#[derive(Debug, Default)]
pub struct FsRegistry {
    types: Mutex<HashMap<String, FileSystemType>>,
}

impl FsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, fs_type: FileSystemType) -> FsResult<()> {
        let mut types = lock(&self.types);
        if types.contains_key(&fs_type.name) {
            return Err(FsError::AlreadyRegistered(fs_type.name));
        }
        debug!("registered filesystem type {}", fs_type.name);
        types.insert(fs_type.name.clone(), fs_type);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> FsResult<()> {
        if lock(&self.types).remove(name).is_none() {
            return Err(FsError::NotFound);
        }
        debug!("unregistered filesystem type {}", name);
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        lock(&self.types).contains_key(name)
    }

    /// Route a mount request to the filesystem type registered as `name`.
    pub fn mount(&self, name: &str, options: &str) -> FsResult<MountSession> {
        self.mount_with(name, MountOptions::parse(options)?)
    }

    /// Like `mount`, with options already assembled by the caller.
    pub fn mount_with(&self, name: &str, options: MountOptions) -> FsResult<MountSession> {
        let fs_type = lock(&self.types).get(name).cloned().ok_or(FsError::NotFound)?;
        MountSession::mount_as(&fs_type.name, options)
    }
}

lazy_static::lazy_static! {
    static ref REGISTRY: FsRegistry = FsRegistry::new();
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// The process-wide registry.
pub fn registry() -> &'static FsRegistry {
    &REGISTRY
}

/// Register `ramfs` with the process-wide registry.
///
/// Only the first call registers; later calls return `Ok(())` without
/// touching the registry. If the name is already taken by someone else the
/// error is returned and the guard is reset so a later call may retry.
pub fn init() -> FsResult<()> {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return Ok(());
    }
    if let Err(e) = REGISTRY.register(FileSystemType::ramfs()) {
        error!("unable to register {}: {}", FS_TYPE_NAME, e);
        INITIALIZED.store(false, Ordering::Release);
        return Err(e);
    }
    debug!("{} module loaded", FS_TYPE_NAME);
    Ok(())
}

/// Unregister `ramfs`. A missing registration is logged, not returned.
pub fn exit() {
    if !INITIALIZED.swap(false, Ordering::AcqRel) {
        return;
    }
    if let Err(e) = REGISTRY.unregister(FS_TYPE_NAME) {
        warn!("unable to unregister {}: {}", FS_TYPE_NAME, e);
    }
    debug!("{} module unloaded", FS_TYPE_NAME);
}
