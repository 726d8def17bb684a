//! Page-granular content storage for regular files

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{FsError, FsResult};
use crate::lock;
use crate::types::current_timestamp;

pub const PAGE_SIZE: usize = 4096;

type Page = Box<[u8]>;

/// Byte accounting shared by every content store of one mount
#[derive(Debug, Default)]
pub struct MemoryBudget {
    limit: Option<u64>,
    used: AtomicU64,
}

impl MemoryBudget {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            used: AtomicU64::new(0),
        }
    }

    /// Reserve `bytes`, failing with `OutOfMemory` when the limit would be exceeded.
    pub fn charge(&self, bytes: u64) -> FsResult<()> {
        let Some(limit) = self.limit else {
            self.used.fetch_add(bytes, Ordering::Relaxed);
            return Ok(());
        };

        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= limit)
            })
            .map(|_| ())
            .map_err(|_| FsError::OutOfMemory)
    }

    pub fn refund(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }
}

fn new_page() -> FsResult<Page> {
    let mut page = Vec::new();
    page.try_reserve_exact(PAGE_SIZE)
        .map_err(|_| FsError::OutOfMemory)?;
    page.resize(PAGE_SIZE, 0);
    Ok(page.into_boxed_slice())
}

fn page_index(offset: u64) -> FsResult<usize> {
    usize::try_from(offset / PAGE_SIZE as u64).map_err(|_| FsError::InvalidArgument)
}

/// Split a byte position into (page index, offset within the page).
fn locate(pos: u64) -> (usize, usize) {
    ((pos / PAGE_SIZE as u64) as usize, (pos % PAGE_SIZE as u64) as usize)
}

/// Sparse, growable byte store; absent pages read as zero
///
/// Only resident pages take up index space, so a write far past the end costs
/// one page regardless of the offset.
#[derive(Debug)]
pub struct ContentStore {
    pages: BTreeMap<usize, Page>,
    size: u64,
    dirty: BTreeSet<usize>,
    modified: i64,
    budget: Arc<MemoryBudget>,
}

impl ContentStore {
    pub fn new(budget: Arc<MemoryBudget>) -> Self {
        Self {
            pages: BTreeMap::new(),
            size: 0,
            dirty: BTreeSet::new(),
            modified: current_timestamp(),
            budget,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Time of the last content change, in nanoseconds since the epoch
    pub fn modified(&self) -> i64 {
        self.modified
    }

    pub fn resident_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn dirty_pages(&self) -> Vec<usize> {
        self.dirty.iter().copied().collect()
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    /// Read up to `len` bytes at `offset`, clamped to the current size.
    pub fn read(&self, offset: u64, len: usize) -> Vec<u8> {
        if offset >= self.size {
            return Vec::new();
        }
        let available = (self.size - offset).min(len as u64) as usize;
        let mut buf = vec![0u8; available];
        self.copy_out(offset, &mut buf);
        buf
    }

    /// Read exactly `len` bytes at `offset`; anything past the end reads as zero.
    pub fn read_zero_extended(&self, offset: u64, len: usize) -> Vec<u8> {
        let mut buf = self.read(offset, len);
        buf.resize(len, 0);
        buf
    }

    /// Write the whole of `data` at `offset`, growing the store as needed.
    ///
    /// Either every byte lands or nothing changes and `OutOfMemory` is returned.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> FsResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(FsError::InvalidArgument)?;
        let pages = page_index(offset)?..page_index(end - 1)? + 1;

        let fresh = self.prepare_pages(pages.clone())?;
        self.install_pages(fresh);

        if offset > self.size {
            self.zero_range(self.size, offset);
        }
        self.copy_in(offset, data);
        self.dirty.extend(pages);
        self.size = self.size.max(end);
        self.modified = current_timestamp();
        Ok(data.len())
    }

    /// Shrink or zero-extend the store to `new_size` bytes.
    pub fn truncate(&mut self, new_size: u64) -> FsResult<()> {
        if new_size < self.size {
            let keep = usize::try_from(new_size.div_ceil(PAGE_SIZE as u64))
                .map_err(|_| FsError::InvalidArgument)?;
            let released = self.pages.split_off(&keep).len();
            self.budget.refund((released * PAGE_SIZE) as u64);
            self.dirty.retain(|index| *index < keep);
            self.zero_range(new_size, self.size);
        } else if new_size > self.size {
            self.zero_range(self.size, new_size);
        }

        self.size = new_size;
        self.modified = current_timestamp();
        Ok(())
    }

    /// Make page `index` resident, charging the budget if it was a hole.
    pub fn allocate_page(&mut self, index: usize) -> FsResult<()> {
        let fresh = self.prepare_pages(index..index + 1)?;
        self.install_pages(fresh);
        Ok(())
    }

    /// Mutable view of a resident page.
    pub fn map_page(&mut self, index: usize) -> Option<&mut [u8]> {
        self.pages.get_mut(&index).map(|page| &mut page[..])
    }

    pub fn mark_dirty(&mut self, index: usize) {
        self.dirty.insert(index);
        self.modified = current_timestamp();
    }

    /// Allocate every missing page in `range` without touching `self`, so a
    /// failure leaves the store unchanged.
    fn prepare_pages(&mut self, range: Range<usize>) -> FsResult<Vec<(usize, Page)>> {
        let missing: Vec<usize> = range
            .filter(|index| !self.pages.contains_key(index))
            .collect();
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        let bytes = (missing.len() * PAGE_SIZE) as u64;
        self.budget.charge(bytes)?;

        let allocated = missing
            .iter()
            .map(|index| new_page().map(|page| (*index, page)))
            .collect::<FsResult<Vec<_>>>();

        if allocated.is_err() {
            self.budget.refund(bytes);
        }
        allocated
    }

    fn install_pages(&mut self, fresh: Vec<(usize, Page)>) {
        self.pages.extend(fresh);
    }

    fn copy_out(&self, offset: u64, buf: &mut [u8]) {
        let mut done = 0;
        while done < buf.len() {
            let (index, within) = locate(offset + done as u64);
            let chunk = (PAGE_SIZE - within).min(buf.len() - done);
            match self.pages.get(&index) {
                Some(page) => buf[done..done + chunk].copy_from_slice(&page[within..within + chunk]),
                None => buf[done..done + chunk].fill(0),
            }
            done += chunk;
        }
    }

    fn copy_in(&mut self, offset: u64, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            let (index, within) = locate(offset + done as u64);
            let chunk = (PAGE_SIZE - within).min(data.len() - done);
            if let Some(page) = self.map_page(index) {
                page[within..within + chunk].copy_from_slice(&data[done..done + chunk]);
            }
            done += chunk;
        }
    }

    /// Zero the bytes of resident pages in `[from, to)`.
    fn zero_range(&mut self, from: u64, to: u64) {
        if from >= to {
            return;
        }
        let (first, _) = locate(from);
        let (last, _) = locate(to - 1);
        for (index, page) in self.pages.range_mut(first..=last) {
            let base = *index as u64 * PAGE_SIZE as u64;
            let start = from.saturating_sub(base) as usize;
            let end = (to - base).min(PAGE_SIZE as u64) as usize;
            page[start..end].fill(0);
        }
    }
}

impl Drop for ContentStore {
    fn drop(&mut self) {
        self.budget
            .refund((self.resident_pages() * PAGE_SIZE) as u64);
    }
}

/// A content store shared between its node and any open handles or mappings
#[derive(Clone, Debug)]
pub struct SharedContent(Arc<Mutex<ContentStore>>);

impl SharedContent {
    pub fn new(budget: Arc<MemoryBudget>) -> Self {
        Self(Arc::new(Mutex::new(ContentStore::new(budget))))
    }

    pub fn lock(&self) -> MutexGuard<'_, ContentStore> {
        lock(&self.0)
    }

    /// Map `len` bytes starting at the page-aligned `offset`.
    pub fn map_shared(&self, offset: u64, len: usize) -> FsResult<MemoryRegion> {
        if offset % PAGE_SIZE as u64 != 0 || len == 0 {
            return Err(FsError::InvalidArgument);
        }
        offset
            .checked_add(len as u64)
            .ok_or(FsError::InvalidArgument)?;
        Ok(MemoryRegion {
            content: self.clone(),
            offset,
            len,
        })
    }
}

/// Shared mapping over part of a file's content.
///
/// Reads and writes go straight to the file's pages, so they are visible to
/// ordinary `read` calls. Writes never change the file size; bytes at or past
/// the end of the page holding end-of-file are not written.
#[derive(Clone, Debug)]
pub struct MemoryRegion {
    content: SharedContent,
    offset: u64,
    len: usize,
}

impl MemoryRegion {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read from the mapping at `at` bytes into the region.
    pub fn read(&self, at: usize, len: usize) -> Vec<u8> {
        if at >= self.len {
            return Vec::new();
        }
        let len = len.min(self.len - at);
        let store = self.content.lock();
        let mut buf = vec![0u8; len];
        store.copy_out(self.offset + at as u64, &mut buf);
        buf
    }

    /// Write through the mapping at `at` bytes into the region, returning the
    /// number of bytes stored.
    pub fn write(&self, at: usize, data: &[u8]) -> FsResult<usize> {
        if at >= self.len {
            return Ok(0);
        }
        // `offset + len` was checked when the region was mapped.
        let start = self.offset + at as u64;
        let end = start + data.len().min(self.len - at) as u64;

        let mut store = self.content.lock();
        let mapped_end = store.size().div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64;
        let end = end.min(mapped_end);
        if start >= end {
            return Ok(0);
        }

        let count = (end - start) as usize;
        let pages = page_index(start)?..page_index(end - 1)? + 1;
        let fresh = store.prepare_pages(pages.clone())?;
        store.install_pages(fresh);
        store.copy_in(start, &data[..count]);
        for index in pages {
            store.mark_dirty(index);
        }
        Ok(count)
    }
}
