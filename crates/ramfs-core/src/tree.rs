//! The mounted tree: structural operations, handles and teardown

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::config::{MountOptions, MODE_MASK};
use crate::content::{MemoryBudget, MemoryRegion, SharedContent, PAGE_SIZE};
use crate::error::{FsError, FsResult};
use crate::lock;
use crate::node::{Node, NodePayload, NodeTable};
use crate::types::{Attributes, DirEntry, FsStats, HandleId, NodeId, NodeKind, SetAttributes};

/// Magic number reported through `statfs`
pub const RAMFS_MAGIC: u32 = 123456789;

/// Longest accepted directory entry name, in bytes
pub const NAME_MAX: usize = 255;

/// An open reference to a node
#[derive(Debug)]
struct OpenHandle {
    node: NodeId,
    content: Option<SharedContent>,
}

#[derive(Debug)]
struct TreeState {
    nodes: NodeTable,
    handles: HashMap<HandleId, OpenHandle>,
    next_handle: u64,
    torn_down: bool,
}

/// A mounted in-memory filesystem.
///
/// Structural changes (create, link, unlink, rename, link and open counts)
/// are serialized by one tree-wide lock. File content has its own lock per
/// file, and handle I/O takes only that lock, so reads and writes on
/// different files never wait on each other or on a tree mutation.
#[derive(Debug)]
pub struct FilesystemTree {
    options: MountOptions,
    budget: Arc<MemoryBudget>,
    root: NodeId,
    state: Mutex<TreeState>,
}

fn validate_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(FsError::InvalidArgument);
    }
    if name.len() > NAME_MAX {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

impl FilesystemTree {
    /// Build a fresh tree whose root directory carries `options.mode`.
    pub fn mount(options: MountOptions) -> FsResult<Self> {
        let budget = Arc::new(MemoryBudget::new(options.memory.max_bytes_in_memory));
        let mut nodes = NodeTable::new(
            budget.clone(),
            options.limits.max_nodes,
            options.uid,
            options.gid,
        );
        let root = nodes.allocate(NodeKind::Directory, None, options.mode & MODE_MASK)?;
        debug!(root = root.get(), "mounted tree with root mode {:o}", options.mode);

        Ok(Self {
            options,
            budget,
            root,
            state: Mutex::new(TreeState {
                nodes,
                handles: HashMap::new(),
                next_handle: 1,
                torn_down: false,
            }),
        })
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    fn state(&self) -> FsResult<MutexGuard<'_, TreeState>> {
        let state = lock(&self.state);
        if state.torn_down {
            return Err(FsError::Stale);
        }
        Ok(state)
    }

    /// Number of live nodes, including unlinked nodes still held open.
    pub fn node_count(&self) -> usize {
        lock(&self.state).nodes.len()
    }

    /// Resolve `name` in directory `parent`; "." and ".." are implicit.
    pub fn lookup(&self, parent: NodeId, name: &str) -> FsResult<NodeId> {
        let state = self.state()?;
        Self::lookup_in(&state.nodes, parent, name)
    }

    fn lookup_in(nodes: &NodeTable, parent: NodeId, name: &str) -> FsResult<NodeId> {
        let dir = nodes.get(parent)?;
        let index = dir.directory()?;
        match name {
            "." => Ok(parent),
            ".." => Ok(dir.parent.unwrap_or(parent)),
            _ => index.lookup(name).ok_or(FsError::NotFound),
        }
    }

    /// Walk a slash-separated path from the root. Symlinks are not followed.
    pub fn resolve(&self, path: &str) -> FsResult<NodeId> {
        let state = self.state()?;
        path.split('/')
            .filter(|c| !c.is_empty())
            .try_fold(self.root, |dir, component| {
                Self::lookup_in(&state.nodes, dir, component)
            })
    }

    /// Create a node of `kind` named `name` in `parent`.
    ///
    /// Symlinks need a target and go through [`FilesystemTree::symlink`].
    pub fn create(&self, parent: NodeId, name: &str, kind: NodeKind, mode: u32) -> FsResult<NodeId> {
        if kind == NodeKind::Symlink {
            return Err(FsError::InvalidArgument);
        }
        let mut state = self.state()?;
        Self::add_entry(&mut state.nodes, parent, name, kind, mode)
    }

    pub fn mkdir(&self, parent: NodeId, name: &str, mode: u32) -> FsResult<NodeId> {
        self.create(parent, name, NodeKind::Directory, mode)
    }

    /// Create a special (device) node carrying device number `rdev`.
    pub fn mknod(&self, parent: NodeId, name: &str, mode: u32, rdev: u32) -> FsResult<NodeId> {
        let mut state = self.state()?;
        let id = Self::add_entry(&mut state.nodes, parent, name, NodeKind::Special, mode)?;
        state.nodes.get_mut(id)?.payload = NodePayload::Special { rdev };
        Ok(id)
    }

    /// Create a symlink pointing at `target`. The target is fixed for the
    /// node's lifetime and, with its terminator, must fit in one page.
    pub fn symlink(&self, parent: NodeId, name: &str, target: &str) -> FsResult<NodeId> {
        if target.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        if target.len() + 1 > PAGE_SIZE {
            return Err(FsError::NameTooLong);
        }
        let mut state = self.state()?;
        let id = Self::add_entry(&mut state.nodes, parent, name, NodeKind::Symlink, 0o777)?;
        state.nodes.get_mut(id)?.payload = NodePayload::Symlink(target.to_string());
        Ok(id)
    }

    /// Allocate a node and enter it into `parent`, leaving nothing behind on failure.
    fn add_entry(
        nodes: &mut NodeTable,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
        mode: u32,
    ) -> FsResult<NodeId> {
        validate_name(name)?;
        if nodes.get(parent)?.directory()?.lookup(name).is_some() {
            return Err(FsError::NameExists);
        }

        let id = nodes.allocate(kind, Some(parent), mode & MODE_MASK)?;
        let dir = nodes.get_mut(parent)?;
        if let Err(e) = dir.directory_mut().and_then(|index| index.insert(name, id)) {
            nodes.release(id);
            return Err(e);
        }
        dir.touch_mtime();
        if kind == NodeKind::Directory {
            dir.nlink += 1;
        }
        Ok(id)
    }

    /// Add a hard link `name` in `parent` to the non-directory `existing`.
    ///
    /// A node that is only kept alive by open handles cannot be linked again.
    pub fn link(&self, parent: NodeId, name: &str, existing: NodeId) -> FsResult<()> {
        let mut state = self.state()?;
        let nodes = &mut state.nodes;
        let target = nodes.get(existing)?;
        if target.is_dir() {
            return Err(FsError::IsADirectory);
        }
        if target.nlink == 0 {
            return Err(FsError::NotFound);
        }
        validate_name(name)?;

        let dir = nodes.get_mut(parent)?;
        dir.directory_mut()?.insert(name, existing)?;
        dir.touch_mtime();
        nodes.increment_link(existing)
    }

    /// Remove the non-directory entry `name` from `parent`.
    ///
    /// The node is destroyed once its last link and last open handle are gone;
    /// until then an open handle keeps its content reachable.
    pub fn unlink(&self, parent: NodeId, name: &str) -> FsResult<()> {
        let mut state = self.state()?;
        let nodes = &mut state.nodes;
        validate_name(name)?;

        let child = nodes.get(parent)?.directory()?.lookup(name).ok_or(FsError::NotFound)?;
        if nodes.get(child)?.is_dir() {
            return Err(FsError::IsADirectory);
        }

        let dir = nodes.get_mut(parent)?;
        dir.directory_mut()?.remove(name)?;
        dir.touch_mtime();
        if nodes.decrement_link(child)? {
            trace!(node = child.get(), "unlinked and destroyed");
        }
        Ok(())
    }

    /// Remove the empty directory `name` from `parent`.
    pub fn rmdir(&self, parent: NodeId, name: &str) -> FsResult<()> {
        let mut state = self.state()?;
        let nodes = &mut state.nodes;
        validate_name(name)?;

        let child = nodes.get(parent)?.directory()?.lookup(name).ok_or(FsError::NotFound)?;
        if !nodes.get(child)?.directory()?.is_empty() {
            return Err(FsError::NotEmpty);
        }

        let dir = nodes.get_mut(parent)?;
        dir.directory_mut()?.remove(name)?;
        dir.touch_mtime();
        nodes.decrement_link(parent)?;
        nodes.clear_links(child)?;
        Ok(())
    }

    /// Move `old_name` in `old_parent` to `new_name` in `new_parent`.
    ///
    /// An existing destination is replaced when the kinds agree: a
    /// non-directory replaces a non-directory, and a directory replaces an
    /// empty directory.
    pub fn rename(
        &self,
        old_parent: NodeId,
        old_name: &str,
        new_parent: NodeId,
        new_name: &str,
    ) -> FsResult<()> {
        let mut state = self.state()?;
        let nodes = &mut state.nodes;
        validate_name(old_name)?;
        validate_name(new_name)?;

        let source = nodes.get(old_parent)?.directory()?.lookup(old_name).ok_or(FsError::NotFound)?;
        let dest = nodes.get(new_parent)?.directory()?.lookup(new_name);
        if dest == Some(source) {
            return Ok(());
        }

        let source_is_dir = nodes.get(source)?.is_dir();
        if source_is_dir && Self::is_within(nodes, new_parent, source)? {
            return Err(FsError::InvalidArgument);
        }

        let dest_is_dir = match dest.map(|dest| nodes.get(dest)).transpose()? {
            Some(dest_node) => match (source_is_dir, &dest_node.payload) {
                (true, NodePayload::Directory(index)) if !index.is_empty() => {
                    return Err(FsError::NotEmpty)
                }
                (true, NodePayload::Directory(_)) => true,
                (true, _) => return Err(FsError::NotADirectory),
                (false, NodePayload::Directory(_)) => return Err(FsError::IsADirectory),
                (false, _) => false,
            },
            None => false,
        };

        let displaced = if old_parent == new_parent {
            nodes.get_mut(old_parent)?.directory_mut()?.rename(old_name, new_name, None)?
        } else {
            let mut source_index = mem::take(nodes.get_mut(old_parent)?.directory_mut()?);
            let moved = nodes
                .get_mut(new_parent)
                .and_then(Node::directory_mut)
                .and_then(|target| source_index.rename(old_name, new_name, Some(target)));
            *nodes.get_mut(old_parent)?.directory_mut()? = source_index;
            moved?
        };

        if let Some(displaced) = displaced {
            if dest_is_dir {
                nodes.clear_links(displaced)?;
                nodes.decrement_link(new_parent)?;
            } else {
                nodes.decrement_link(displaced)?;
            }
        }
        if source_is_dir && old_parent != new_parent {
            nodes.decrement_link(old_parent)?;
            nodes.increment_link(new_parent)?;
        }

        let moved = nodes.get_mut(source)?;
        moved.parent = Some(new_parent);
        moved.touch_ctime();
        nodes.get_mut(old_parent)?.touch_mtime();
        nodes.get_mut(new_parent)?.touch_mtime();
        Ok(())
    }

    /// True if `node` is `ancestor` or lies below it.
    fn is_within(nodes: &NodeTable, node: NodeId, ancestor: NodeId) -> FsResult<bool> {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return Ok(true);
            }
            current = nodes.get(id)?.parent;
        }
        Ok(false)
    }

    pub fn readlink(&self, node: NodeId) -> FsResult<String> {
        let state = self.state()?;
        match &state.nodes.get(node)?.payload {
            NodePayload::Symlink(target) => Ok(target.clone()),
            _ => Err(FsError::InvalidArgument),
        }
    }

    /// List `dir` starting after `cookie` (0 lists from the beginning).
    pub fn readdir(&self, dir: NodeId, cookie: u64) -> FsResult<Vec<DirEntry>> {
        let state = self.state()?;
        let nodes = &state.nodes;
        nodes
            .get(dir)?
            .directory()?
            .entries_from(cookie)
            .map(|(cookie, name, id)| -> FsResult<DirEntry> {
                Ok(DirEntry {
                    name,
                    id,
                    kind: nodes.get(id)?.kind(),
                    cookie,
                })
            })
            .collect()
    }

    pub fn getattr(&self, node: NodeId) -> FsResult<Attributes> {
        let state = self.state()?;
        let node = state.nodes.get(node)?;

        let mut times = node.times;
        let (size, rdev) = match &node.payload {
            NodePayload::Directory(_) => (0, 0),
            NodePayload::Regular(content) => {
                let content = content.lock();
                times.mtime = times.mtime.max(content.modified());
                times.ctime = times.ctime.max(content.modified());
                (content.size(), 0)
            }
            NodePayload::Symlink(target) => (target.len() as u64, 0),
            NodePayload::Special { rdev } => (0, *rdev),
        };

        Ok(Attributes {
            id: node.id,
            kind: node.kind(),
            mode: node.mode,
            uid: node.uid,
            gid: node.gid,
            nlink: node.nlink,
            size,
            rdev,
            times,
        })
    }

    pub fn setattr(&self, node: NodeId, attrs: SetAttributes) -> FsResult<Attributes> {
        {
            let mut state = self.state()?;
            let node = state.nodes.get_mut(node)?;

            if let Some(size) = attrs.size {
                match &node.payload {
                    NodePayload::Regular(content) => content.lock().truncate(size)?,
                    NodePayload::Directory(_) => return Err(FsError::IsADirectory),
                    _ => return Err(FsError::InvalidArgument),
                }
            }
            if let Some(mode) = attrs.mode {
                node.mode = mode & MODE_MASK;
            }
            if let Some(uid) = attrs.uid {
                node.uid = uid;
            }
            if let Some(gid) = attrs.gid {
                node.gid = gid;
            }
            if let Some(atime) = attrs.atime {
                node.times.atime = atime;
            }
            if let Some(mtime) = attrs.mtime {
                node.times.mtime = mtime;
            }
            node.touch_ctime();
        }
        self.getattr(node)
    }

    /// Open `node`, pinning it until the returned handle is closed.
    pub fn open(&self, node: NodeId) -> FsResult<HandleId> {
        let mut state = self.state()?;
        if state.handles.len() >= self.options.limits.max_open_handles as usize {
            return Err(FsError::Busy);
        }

        let content = match &state.nodes.get(node)?.payload {
            NodePayload::Regular(content) => Some(content.clone()),
            _ => None,
        };
        state.nodes.open(node)?;

        let id = HandleId(state.next_handle);
        state.next_handle += 1;
        state.handles.insert(id, OpenHandle { node, content });
        Ok(id)
    }

    pub fn close(&self, handle: HandleId) -> FsResult<()> {
        let mut state = self.state()?;
        let open = state.handles.remove(&handle).ok_or(FsError::InvalidHandle)?;
        if state.nodes.close(open.node)? {
            trace!(node = open.node.get(), "last handle closed on unlinked node");
        }
        Ok(())
    }

    /// The content behind `handle`, fetched under the tree lock and used after
    /// it is released.
    fn content(&self, handle: HandleId) -> FsResult<SharedContent> {
        let state = self.state()?;
        let open = state.handles.get(&handle).ok_or(FsError::InvalidHandle)?;
        if let Some(content) = &open.content {
            return Ok(content.clone());
        }
        match state.nodes.get(open.node)?.kind() {
            NodeKind::Directory => Err(FsError::IsADirectory),
            _ => Err(FsError::InvalidArgument),
        }
    }

    pub fn read(&self, handle: HandleId, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        Ok(self.content(handle)?.lock().read(offset, len))
    }

    /// Like `read`, but always `len` bytes long with zeros past end-of-file.
    pub fn read_zero_extended(&self, handle: HandleId, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        Ok(self.content(handle)?.lock().read_zero_extended(offset, len))
    }

    pub fn write(&self, handle: HandleId, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.content(handle)?.lock().write(offset, data)
    }

    pub fn truncate(&self, handle: HandleId, size: u64) -> FsResult<()> {
        self.content(handle)?.lock().truncate(size)
    }

    /// Shared mapping of `len` bytes at the page-aligned `offset`.
    pub fn map_shared(&self, handle: HandleId, offset: u64, len: usize) -> FsResult<MemoryRegion> {
        self.content(handle)?.map_shared(offset, len)
    }

    pub fn statfs(&self) -> FsResult<FsStats> {
        let state = self.state()?;
        Ok(FsStats {
            magic: RAMFS_MAGIC,
            block_size: PAGE_SIZE as u32,
            name_max: NAME_MAX as u32,
            nodes: state.nodes.len() as u64,
            max_nodes: self.options.limits.max_nodes,
            bytes_used: self.budget.used(),
            max_bytes: self.budget.limit(),
        })
    }

    /// Release every node and all content.
    ///
    /// Walks the tree depth-first from the root, then drops unlinked nodes
    /// still held by handles, and finally the handles themselves. Calling it
    /// again is a no-op. The caller must ensure no other operation runs on
    /// this tree concurrently.
    pub fn teardown(&self) {
        let mut state = lock(&self.state);
        if state.torn_down {
            return;
        }

        let mut released = 0usize;
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let Some(node) = state.nodes.release(id) else {
                continue;
            };
            if let NodePayload::Directory(index) = &node.payload {
                stack.extend(index.entries().map(|(_, _, child)| child));
            }
            released += 1;
        }

        let orphans = state.nodes.len();
        state.nodes.clear();
        state.handles.clear();
        state.torn_down = true;
        debug!(released, orphans, "tree torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        lock(&self.state).torn_down
    }
}
