//! Configuration types for RamFS Core

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FsError, FsResult};

/// Root permission mode used when no `mode=` option is given
pub const DEFAULT_MODE: u32 = 0o755;

/// Permission and special bits accepted from a mount option
pub const MODE_MASK: u32 = 0o7777;

/// Memory policy for file content
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryPolicy {
    /// Upper bound on bytes of resident content pages (None = unlimited)
    pub max_bytes_in_memory: Option<u64>,
}

/// System limits
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsLimits {
    pub max_nodes: Option<u64>,
    pub max_open_handles: u32,
}

impl Default for FsLimits {
    fn default() -> Self {
        Self {
            max_nodes: None,
            max_open_handles: 65536,
        }
    }
}

/// Mount configuration for one filesystem instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Permission bits of the root directory
    pub mode: u32,
    /// Owner credentials stamped on created nodes
    pub uid: u32,
    pub gid: u32,
    pub memory: MemoryPolicy,
    pub limits: FsLimits,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            mode: DEFAULT_MODE,
            uid: 0,
            gid: 0,
            memory: MemoryPolicy::default(),
            limits: FsLimits::default(),
        }
    }
}

impl MountOptions {
    /// Parse a comma-separated mount option string, e.g. `"mode=0700"`.
    ///
    /// Only `mode=<octal>` is recognized; any other key is ignored.
    pub fn parse(options: &str) -> FsResult<Self> {
        let mut parsed = Self::default();
        parsed.apply(options)?;
        Ok(parsed)
    }

    /// Overlay an option string onto an existing configuration.
    pub fn apply(&mut self, options: &str) -> FsResult<()> {
        for token in options.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }

            match token.split_once('=') {
                Some(("mode", value)) => {
                    let mode = u32::from_str_radix(value, 8)
                        .map_err(|_| FsError::InvalidOption(token.to_string()))?;
                    self.mode = mode & MODE_MASK;
                }
                _ => debug!("ignoring unrecognized mount option {:?}", token),
            }
        }
        Ok(())
    }
}
