//! Line-oriented command scripts run against a mounted tree

use std::io::{BufRead, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use ramfs_core::{FilesystemTree, FsError, NodeId, NodeKind, SetAttributes};
use tracing::{debug, warn};

/// One parsed script command
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Mkdir { path: String, mode: u32 },
    Touch { path: String },
    Write { path: String, offset: u64, text: String },
    Cat { path: String, range: Option<(u64, usize)> },
    Ls { path: String },
    Rm { path: String },
    Rmdir { path: String },
    Mv { from: String, to: String },
    Ln { target: String, link: String },
    Symlink { target: String, link: String },
    Readlink { path: String },
    Mknod { path: String, mode: u32, rdev: u32 },
    Stat { path: String },
    Truncate { path: String, size: u64 },
    Chmod { path: String, mode: u32 },
    Statfs,
}

fn parse_mode(value: &str) -> Result<u32> {
    u32::from_str_radix(value, 8).with_context(|| format!("invalid mode {:?}", value))
}

impl Command {
    /// Parse one line; `Ok(None)` for blank lines and `#` comments.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let args: Vec<&str> = rest.split_whitespace().collect();
        let arg = |i: usize| -> Result<String> {
            args.get(i)
                .map(|s| s.to_string())
                .ok_or_else(|| anyhow!("{}: missing argument {}", verb, i + 1))
        };

        let command = match verb {
            "mkdir" => Command::Mkdir {
                path: arg(0)?,
                mode: args.get(1).map(|m| parse_mode(m)).transpose()?.unwrap_or(0o755),
            },
            "touch" => Command::Touch { path: arg(0)? },
            "write" => {
                let mut parts = rest.trim_start().splitn(3, ' ');
                let path = parts.next().filter(|p| !p.is_empty());
                let offset = parts.next();
                match (path, offset) {
                    (Some(path), Some(offset)) => Command::Write {
                        path: path.to_string(),
                        offset: offset.parse().context("invalid offset")?,
                        text: parts.next().unwrap_or("").to_string(),
                    },
                    _ => bail!("write: expected PATH OFFSET TEXT"),
                }
            }
            "cat" => Command::Cat {
                path: arg(0)?,
                range: match (args.get(1), args.get(2)) {
                    (Some(offset), Some(len)) => Some((
                        offset.parse().context("invalid offset")?,
                        len.parse().context("invalid length")?,
                    )),
                    _ => None,
                },
            },
            "ls" => Command::Ls {
                path: args.first().map(|s| s.to_string()).unwrap_or_else(|| "/".to_string()),
            },
            "rm" => Command::Rm { path: arg(0)? },
            "rmdir" => Command::Rmdir { path: arg(0)? },
            "mv" => Command::Mv { from: arg(0)?, to: arg(1)? },
            "ln" => Command::Ln { target: arg(0)?, link: arg(1)? },
            "symlink" => Command::Symlink { target: arg(0)?, link: arg(1)? },
            "readlink" => Command::Readlink { path: arg(0)? },
            "mknod" => Command::Mknod {
                path: arg(0)?,
                mode: parse_mode(&arg(1)?)?,
                rdev: arg(2)?.parse().context("invalid device number")?,
            },
            "stat" => Command::Stat { path: arg(0)? },
            "truncate" => Command::Truncate {
                path: arg(0)?,
                size: arg(1)?.parse().context("invalid size")?,
            },
            "chmod" => Command::Chmod {
                path: arg(0)?,
                mode: parse_mode(&arg(1)?)?,
            },
            "statfs" => Command::Statfs,
            other => bail!("unknown command {:?}", other),
        };
        Ok(Some(command))
    }
}

/// Split "/a/b/c" into ("/a/b", "c").
fn split_parent(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, name)) if !name.is_empty() => Ok((parent, name)),
        None if !trimmed.is_empty() => Ok(("", trimmed)),
        _ => bail!("{:?} has no final component", path),
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Executes commands against one tree, printing results to `out`
pub struct ScriptRunner<'a, W: Write> {
    fs: &'a FilesystemTree,
    out: W,
}

impl<'a, W: Write> ScriptRunner<'a, W> {
    pub fn new(fs: &'a FilesystemTree, out: W) -> Self {
        Self { fs, out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Run every line of `input`. Failing commands are reported and skipped;
    /// returns the number of failures.
    pub fn run<R: BufRead>(&mut self, input: R) -> Result<usize> {
        let mut failures = 0;
        for (number, line) in input.lines().enumerate() {
            let line = line?;
            let outcome = Command::parse(&line).and_then(|command| match command {
                Some(command) => self.execute(&command),
                None => Ok(()),
            });
            if let Err(e) = outcome {
                failures += 1;
                warn!(line = number + 1, "command failed: {:#}", e);
                match e.downcast_ref::<FsError>() {
                    Some(fs_err) => writeln!(
                        self.out,
                        "line {}: error: {:#} (errno {})",
                        number + 1,
                        e,
                        fs_err.errno()
                    )?,
                    None => writeln!(self.out, "line {}: error: {:#}", number + 1, e)?,
                }
            }
        }
        Ok(failures)
    }

    fn parent_of<'p>(&self, path: &'p str) -> Result<(NodeId, &'p str)> {
        let (parent, name) = split_parent(path)?;
        let dir = self
            .fs
            .resolve(parent)
            .with_context(|| format!("cannot resolve {:?}", parent))?;
        Ok((dir, name))
    }

    fn node(&self, path: &str) -> Result<NodeId> {
        Ok(self.fs.resolve(path).with_context(|| format!("cannot resolve {:?}", path))?)
    }

    pub fn execute(&mut self, command: &Command) -> Result<()> {
        debug!(?command, "executing");
        let fs = self.fs;
        match command {
            Command::Mkdir { path, mode } => {
                let (dir, name) = self.parent_of(path)?;
                fs.mkdir(dir, name, *mode)?;
            }
            Command::Touch { path } => {
                let (dir, name) = self.parent_of(path)?;
                match fs.create(dir, name, NodeKind::Regular, 0o644) {
                    Err(FsError::NameExists) => {
                        let node = fs.lookup(dir, name)?;
                        let ts = now();
                        fs.setattr(
                            node,
                            SetAttributes {
                                atime: Some(ts),
                                mtime: Some(ts),
                                ..Default::default()
                            },
                        )?;
                    }
                    other => {
                        other?;
                    }
                }
            }
            Command::Write { path, offset, text } => {
                let node = self.node(path)?;
                let handle = fs.open(node)?;
                let written = fs.write(handle, *offset, text.as_bytes());
                fs.close(handle)?;
                writeln!(self.out, "{}", written?)?;
            }
            Command::Cat { path, range } => {
                let node = self.node(path)?;
                let (offset, len) = match range {
                    Some(range) => *range,
                    None => (0, fs.getattr(node)?.size as usize),
                };
                let handle = fs.open(node)?;
                let data = fs.read(handle, offset, len);
                fs.close(handle)?;
                writeln!(self.out, "{}", String::from_utf8_lossy(&data?).escape_debug())?;
            }
            Command::Ls { path } => {
                let dir = self.node(path)?;
                for entry in fs.readdir(dir, 0)? {
                    let tag = match entry.kind {
                        NodeKind::Directory => 'd',
                        NodeKind::Regular => '-',
                        NodeKind::Symlink => 'l',
                        NodeKind::Special => 'c',
                    };
                    writeln!(self.out, "{} {}", tag, entry.name)?;
                }
            }
            Command::Rm { path } => {
                let (dir, name) = self.parent_of(path)?;
                fs.unlink(dir, name)?;
            }
            Command::Rmdir { path } => {
                let (dir, name) = self.parent_of(path)?;
                fs.rmdir(dir, name)?;
            }
            Command::Mv { from, to } => {
                let (old_dir, old_name) = self.parent_of(from)?;
                let (new_dir, new_name) = self.parent_of(to)?;
                fs.rename(old_dir, old_name, new_dir, new_name)?;
            }
            Command::Ln { target, link } => {
                let node = self.node(target)?;
                let (dir, name) = self.parent_of(link)?;
                fs.link(dir, name, node)?;
            }
            Command::Symlink { target, link } => {
                let (dir, name) = self.parent_of(link)?;
                fs.symlink(dir, name, target)?;
            }
            Command::Readlink { path } => {
                let target = fs.readlink(self.node(path)?)?;
                writeln!(self.out, "{}", target)?;
            }
            Command::Mknod { path, mode, rdev } => {
                let (dir, name) = self.parent_of(path)?;
                fs.mknod(dir, name, *mode, *rdev)?;
            }
            Command::Stat { path } => {
                let attrs = fs.getattr(self.node(path)?)?;
                writeln!(self.out, "{}", serde_json::to_string(&attrs)?)?;
            }
            Command::Truncate { path, size } => {
                let node = self.node(path)?;
                fs.setattr(
                    node,
                    SetAttributes {
                        size: Some(*size),
                        ..Default::default()
                    },
                )?;
            }
            Command::Chmod { path, mode } => {
                let node = self.node(path)?;
                fs.setattr(
                    node,
                    SetAttributes {
                        mode: Some(*mode),
                        ..Default::default()
                    },
                )?;
            }
            Command::Statfs => {
                writeln!(self.out, "{}", serde_json::to_string(&fs.statfs()?)?)?;
            }
        }
        Ok(())
    }
}
