//! Node storage and link/reference counting

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::content::{MemoryBudget, SharedContent};
use crate::directory::DirectoryIndex;
use crate::error::{FsError, FsResult};
use crate::types::{current_timestamp, FileTimes, NodeId, NodeKind, S_ISGID};

/// Kind-specific node payload
#[derive(Debug)]
pub enum NodePayload {
    Directory(DirectoryIndex),
    Regular(SharedContent),
    Symlink(String),
    Special { rdev: u32 },
}

/// Filesystem node
#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub payload: NodePayload,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    /// Open handles pinning this node
    pub open_count: u32,
    /// Directory holding this node's primary entry; never an ownership edge
    pub parent: Option<NodeId>,
    pub times: FileTimes,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self.payload {
            NodePayload::Directory(_) => NodeKind::Directory,
            NodePayload::Regular(_) => NodeKind::Regular,
            NodePayload::Symlink(_) => NodeKind::Symlink,
            NodePayload::Special { .. } => NodeKind::Special,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.payload, NodePayload::Directory(_))
    }

    pub fn directory(&self) -> FsResult<&DirectoryIndex> {
        match &self.payload {
            NodePayload::Directory(index) => Ok(index),
            _ => Err(FsError::NotADirectory),
        }
    }

    pub fn directory_mut(&mut self) -> FsResult<&mut DirectoryIndex> {
        match &mut self.payload {
            NodePayload::Directory(index) => Ok(index),
            _ => Err(FsError::NotADirectory),
        }
    }

    pub fn touch_ctime(&mut self) {
        self.times.ctime = current_timestamp();
    }

    pub fn touch_mtime(&mut self) {
        let now = current_timestamp();
        self.times.mtime = now;
        self.times.ctime = now;
    }
}

/// Owner of every node of one mount, indexed by id
#[derive(Debug)]
pub struct NodeTable {
    nodes: HashMap<NodeId, Node>,
    next_id: u64,
    max_nodes: Option<u64>,
    budget: Arc<MemoryBudget>,
    uid: u32,
    gid: u32,
}

impl NodeTable {
    /// Create an empty table. `uid`/`gid` are the credentials stamped on new nodes.
    pub fn new(budget: Arc<MemoryBudget>, max_nodes: Option<u64>, uid: u32, gid: u32) -> Self {
        Self {
            nodes: HashMap::new(),
            next_id: 1,
            max_nodes,
            budget,
            uid,
            gid,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Allocate a node of `kind` owned by `owner_dir` (None for the root).
    ///
    /// Directories start with a link count of 2, everything else with 1. The
    /// group comes from a set-group-id owner directory, and directories created
    /// under one inherit the bit.
    pub fn allocate(&mut self, kind: NodeKind, owner_dir: Option<NodeId>, mode: u32) -> FsResult<NodeId> {
        if let Some(max) = self.max_nodes {
            if self.nodes.len() as u64 >= max {
                return Err(FsError::OutOfMemory);
            }
        }
        self.nodes
            .try_reserve(1)
            .map_err(|_| FsError::OutOfMemory)?;

        let (mut gid, mut mode) = (self.gid, mode);
        if let Some(dir) = owner_dir {
            let dir = self.get(dir)?;
            if dir.mode & S_ISGID != 0 {
                gid = dir.gid;
                if kind == NodeKind::Directory {
                    mode |= S_ISGID;
                }
            }
        }

        let (payload, nlink) = match kind {
            NodeKind::Directory => (NodePayload::Directory(DirectoryIndex::new()), 2),
            NodeKind::Regular => (NodePayload::Regular(SharedContent::new(self.budget.clone())), 1),
            NodeKind::Symlink => (NodePayload::Symlink(String::new()), 1),
            NodeKind::Special => (NodePayload::Special { rdev: 0 }, 1),
        };

        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            Node {
                id,
                payload,
                mode,
                uid: self.uid,
                gid,
                nlink,
                open_count: 0,
                parent: owner_dir,
                times: FileTimes::now(),
            },
        );
        trace!(node = id.0, ?kind, "allocated node");
        Ok(id)
    }

    pub fn get(&self, id: NodeId) -> FsResult<&Node> {
        self.nodes.get(&id).ok_or(FsError::NotFound)
    }

    pub fn get_mut(&mut self, id: NodeId) -> FsResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(FsError::NotFound)
    }

    pub fn increment_link(&mut self, id: NodeId) -> FsResult<()> {
        let node = self.get_mut(id)?;
        node.nlink = node.nlink.saturating_add(1);
        node.touch_ctime();
        Ok(())
    }

    /// Drop one link; returns true if that destroyed the node.
    pub fn decrement_link(&mut self, id: NodeId) -> FsResult<bool> {
        let node = self.get_mut(id)?;
        node.nlink = node.nlink.saturating_sub(1);
        node.touch_ctime();
        Ok(self.release_if_unused(id))
    }

    /// Force the link count to zero (a removed directory loses "." as well).
    pub fn clear_links(&mut self, id: NodeId) -> FsResult<bool> {
        let node = self.get_mut(id)?;
        node.nlink = 0;
        node.touch_ctime();
        Ok(self.release_if_unused(id))
    }

    pub fn open(&mut self, id: NodeId) -> FsResult<()> {
        let node = self.get_mut(id)?;
        node.open_count = node.open_count.saturating_add(1);
        Ok(())
    }

    /// Drop one open reference; returns true if that destroyed the node.
    pub fn close(&mut self, id: NodeId) -> FsResult<bool> {
        let node = self.get_mut(id)?;
        node.open_count = node.open_count.saturating_sub(1);
        Ok(self.release_if_unused(id))
    }

    /// Remove a node unconditionally, returning it.
    pub fn release(&mut self, id: NodeId) -> Option<Node> {
        self.nodes.remove(&id)
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    fn release_if_unused(&mut self, id: NodeId) -> bool {
        match self.nodes.get(&id) {
            Some(node) if node.nlink == 0 && node.open_count == 0 => {
                self.nodes.remove(&id);
                trace!(node = id.0, "destroyed node");
                true
            }
            _ => false,
        }
    }
}
