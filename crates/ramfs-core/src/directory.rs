//! Per-directory name index

use std::collections::{BTreeMap, HashMap};

use crate::error::{FsError, FsResult};
use crate::types::NodeId;

/// Mapping from child name to node, kept in insertion order.
///
/// Every entry is stamped with a cookie from a per-directory counter; the
/// cookie orders the listing and lets a reader resume after any entry it has
/// already seen. "." and ".." are never stored.
#[derive(Debug, Default)]
pub struct DirectoryIndex {
    by_name: HashMap<String, (u64, NodeId)>,
    by_cookie: BTreeMap<u64, String>,
    next_cookie: u64,
}

impl DirectoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).map(|(_, id)| *id)
    }

    pub fn insert(&mut self, name: &str, id: NodeId) -> FsResult<()> {
        if self.by_name.contains_key(name) {
            return Err(FsError::NameExists);
        }
        self.push(name, id)
    }

    pub fn remove(&mut self, name: &str) -> FsResult<NodeId> {
        let (cookie, id) = self.by_name.remove(name).ok_or(FsError::NotFound)?;
        self.by_cookie.remove(&cookie);
        Ok(id)
    }

    /// Insert `name`, overwriting an existing entry; returns the displaced node.
    ///
    /// Room for the new entry is reserved before anything is removed, so on
    /// failure the index, cookies included, is left as it was.
    pub fn replace(&mut self, name: &str, id: NodeId) -> FsResult<Option<NodeId>> {
        self.reserve()?;
        let displaced = self.remove(name).ok();
        self.push(name, id)?;
        Ok(displaced)
    }

    /// Move `old_name` to `new_name`, in `target` or, when `target` is `None`,
    /// within this directory. An existing destination entry is overwritten and
    /// returned. The caller holds the tree lock across the call and has already
    /// applied the kind checks, so observers see the move as one step.
    pub fn rename(
        &mut self,
        old_name: &str,
        new_name: &str,
        target: Option<&mut DirectoryIndex>,
    ) -> FsResult<Option<NodeId>> {
        let id = self.lookup(old_name).ok_or(FsError::NotFound)?;
        match target {
            Some(target) => {
                let displaced = target.replace(new_name, id)?;
                self.remove(old_name)?;
                Ok(displaced)
            }
            None => {
                if old_name == new_name {
                    return Ok(None);
                }
                let displaced = self.replace(new_name, id)?;
                self.remove(old_name)?;
                Ok(displaced)
            }
        }
    }

    /// Snapshot of the whole listing in insertion order.
    pub fn entries(&self) -> DirEntries {
        self.entries_from(0)
    }

    /// Snapshot of the entries added after `cookie`.
    pub fn entries_from(&self, cookie: u64) -> DirEntries {
        let items = self
            .by_cookie
            .range(cookie.saturating_add(1)..)
            .filter_map(|(cookie, name)| {
                self.by_name
                    .get(name)
                    .map(|(_, id)| (*cookie, name.clone(), *id))
            })
            .collect();
        DirEntries { items, pos: 0 }
    }

    fn reserve(&mut self) -> FsResult<()> {
        self.by_name
            .try_reserve(1)
            .map_err(|_| FsError::OutOfMemory)
    }

    fn push(&mut self, name: &str, id: NodeId) -> FsResult<()> {
        self.reserve()?;
        self.next_cookie += 1;
        let cookie = self.next_cookie;
        self.by_cookie.insert(cookie, name.to_string());
        self.by_name.insert(name.to_string(), (cookie, id));
        Ok(())
    }
}

/// Restartable iterator over a directory listing snapshot.
///
/// Yields `(cookie, name, id)`; passing the last cookie seen to
/// `DirectoryIndex::entries_from` resumes the listing.
#[derive(Clone, Debug)]
pub struct DirEntries {
    items: Vec<(u64, String, NodeId)>,
    pos: usize,
}

impl DirEntries {
    /// Rewind to the first entry of the snapshot.
    pub fn restart(&mut self) {
        self.pos = 0;
    }
}

impl Iterator for DirEntries {
    type Item = (u64, String, NodeId);

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.items.get(self.pos).cloned()?;
        self.pos += 1;
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(entries: DirEntries) -> Vec<String> {
        entries.map(|(_, name, _)| name).collect()
    }

    #[test]
    fn test_insert_lookup_remove() {
        let mut dir = DirectoryIndex::new();
        dir.insert("a", NodeId(2)).unwrap();
        assert_eq!(dir.lookup("a"), Some(NodeId(2)));
        assert_eq!(dir.lookup("A"), None);
        assert_eq!(dir.insert("a", NodeId(3)), Err(FsError::NameExists));

        assert_eq!(dir.remove("a"), Ok(NodeId(2)));
        assert_eq!(dir.remove("a"), Err(FsError::NotFound));
        assert!(dir.is_empty());
    }

    #[test]
    fn test_insertion_order_is_kept() {
        let mut dir = DirectoryIndex::new();
        for (i, name) in ["zeta", "alpha", "mid"].iter().enumerate() {
            dir.insert(name, NodeId(i as u64 + 2)).unwrap();
        }
        dir.remove("alpha").unwrap();
        dir.insert("alpha", NodeId(9)).unwrap();
        assert_eq!(names(dir.entries()), vec!["zeta", "mid", "alpha"]);
    }

    #[test]
    fn test_replace_keeps_other_cookies() {
        let mut dir = DirectoryIndex::new();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            dir.insert(name, NodeId(i as u64 + 2)).unwrap();
        }
        let before: Vec<_> = dir.entries().collect();

        assert_eq!(dir.replace("b", NodeId(9)), Ok(Some(NodeId(3))));
        assert_eq!(dir.replace("d", NodeId(10)), Ok(None));
        let after: Vec<_> = dir.entries().collect();

        assert_eq!(after[0], before[0]);
        assert_eq!(after[1], before[2]);
        assert_eq!(&after[2].1, "b");
        assert_eq!(after[2].2, NodeId(9));
        assert!(after[2].0 > before[2].0);
        assert_eq!(dir.lookup("d"), Some(NodeId(10)));
        assert_eq!(dir.len(), 4);
    }

    #[test]
    fn test_listing_resumes_after_cookie() {
        let mut dir = DirectoryIndex::new();
        for name in ["a", "b", "c", "d"] {
            dir.insert(name, NodeId(1)).unwrap();
        }
        let mut first = dir.entries();
        let (cookie, _, _) = first.nth(1).unwrap();

        dir.remove("c").unwrap();
        assert_eq!(names(dir.entries_from(cookie)), vec!["d"]);

        first.restart();
        assert_eq!(first.count(), 4);
    }

    #[test]
    fn test_rename_within_directory_overwrites() {
        let mut dir = DirectoryIndex::new();
        dir.insert("a", NodeId(2)).unwrap();
        dir.insert("b", NodeId(3)).unwrap();

        assert_eq!(dir.rename("a", "b", None), Ok(Some(NodeId(3))));
        assert_eq!(dir.lookup("a"), None);
        assert_eq!(dir.lookup("b"), Some(NodeId(2)));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_rename_across_directories() {
        let mut src = DirectoryIndex::new();
        let mut dst = DirectoryIndex::new();
        src.insert("f", NodeId(4)).unwrap();

        assert_eq!(src.rename("f", "g", Some(&mut dst)), Ok(None));
        assert!(src.is_empty());
        assert_eq!(dst.lookup("g"), Some(NodeId(4)));
        assert_eq!(
            src.rename("missing", "x", Some(&mut dst)),
            Err(FsError::NotFound)
        );
    }
}
