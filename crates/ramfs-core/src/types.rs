//! Core type definitions for RamFS

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Node identifier, unique for the lifetime of a mount
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Opaque handle identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleId(pub(crate) u64);

impl HandleId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

/// The closed set of node kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Directory,
    Regular,
    Symlink,
    Special,
}

/// Node timestamps, in nanoseconds since the Unix epoch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTimes {
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileTimes {
    pub fn now() -> Self {
        let now = current_timestamp();
        Self {
            atime: now,
            mtime: now,
            ctime: now,
        }
    }
}

pub(crate) fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Set-group-id bit; on a directory, new children inherit its group
pub const S_ISGID: u32 = 0o2000;

/// Node attributes as handed to the host ("stat")
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    pub id: NodeId,
    pub kind: NodeKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub rdev: u32,
    pub times: FileTimes,
}

/// Directory entry information
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub id: NodeId,
    pub kind: NodeKind,
    /// Position to restart a listing after this entry
    pub cookie: u64,
}

/// Attribute changes requested through `setattr`; `None` leaves a field as is
#[derive(Clone, Debug, Default)]
pub struct SetAttributes {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<i64>,
    pub mtime: Option<i64>,
}

/// Filesystem-wide statistics ("statfs")
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsStats {
    pub magic: u32,
    pub block_size: u32,
    pub name_max: u32,
    pub nodes: u64,
    pub max_nodes: Option<u64>,
    pub bytes_used: u64,
    pub max_bytes: Option<u64>,
}
