//! Per-blob accounting.
//!
//! A stat pairs one blob file's space map with its size accounting and write
//! lock. The registry hands out stats by `Arc`; everything that mutates the
//! space map or the sizes goes through [`BlobStat::lock`]. The read-only flag
//! and the max-capacity hint live outside the mutex: the flag flips once and
//! never back, and the hint is read optimistically during stat selection.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::entry::BlobId;
use crate::error::Result;
use crate::spacemap::{SpaceMap, SpaceMapKind};

pub struct BlobStat {
    id: BlobId,
    /// Root directory holding this blob's file.
    path: PathBuf,
    read_only: AtomicBool,
    /// Soft upper bound on the largest allocation still possible. Decremented
    /// speculatively while choosing a stat, made accurate again by
    /// [`BlobStat::recalculate_capacity`].
    max_caps: AtomicU64,
    inner: Mutex<StatInner>,
}

pub struct StatInner {
    pub smap: SpaceMap,
    /// Bytes the blob file logically extends to.
    pub total_size: u64,
    /// Bytes still referenced by live entries.
    pub valid_size: u64,
    /// `valid_size / used_boundary`, refreshed wherever sizes change.
    pub valid_rate: f64,
}

impl BlobStat {
    pub fn new(id: BlobId, path: PathBuf, kind: SpaceMapKind, capacity: u64) -> Self {
        Self {
            id,
            path,
            read_only: AtomicBool::new(false),
            max_caps: AtomicU64::new(capacity),
            inner: Mutex::new(StatInner {
                smap: SpaceMap::new(kind, capacity),
                total_size: 0,
                valid_size: 0,
                valid_rate: 0.0,
            }),
        }
    }

    pub fn id(&self) -> BlobId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Freezes the stat. Read-only stats accept no allocations and exist
    /// only for reads and eventual removal; there is no way back.
    pub fn mark_read_only(&self) {
        self.read_only.store(true, Ordering::SeqCst);
    }

    pub fn max_caps(&self) -> u64 {
        self.max_caps.load(Ordering::SeqCst)
    }

    /// Speculatively shrinks the capacity hint before the real allocation
    /// lands, so concurrent selectors don't all commit to this stat.
    pub fn reduce_max_caps(&self, size: u64) -> u64 {
        self.max_caps
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |caps| {
                Some(caps.saturating_sub(size))
            })
            .unwrap_or(0)
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, StatInner>> {
        self.inner.lock().map_err(Into::into)
    }

    /// Allocates `size` bytes from the space map, extending the logical file
    /// size when the region lands beyond it. `None` when nothing fits, which
    /// callers treat as a stale capacity hint.
    pub fn allocate(&self, inner: &mut StatInner, size: u64) -> Option<u64> {
        let offset = inner.smap.allocate(size)?;
        let end = offset + size;
        if end > inner.total_size {
            tracing::trace!(blob_id = self.id, total_size = end, "blob expanded");
            inner.total_size = end;
        }
        inner.valid_size += size;
        inner.refresh_rate();
        Some(offset)
    }

    /// Releases `[offset, offset + size)` and returns the remaining valid
    /// size so the caller can decide whether the blob is removable. A release
    /// of an unallocated range is a logic error in debug builds and a logged
    /// no-op in release builds.
    pub fn release(&self, inner: &mut StatInner, offset: u64, size: u64) -> Result<u64> {
        if let Err(err) = inner.smap.release(offset, size) {
            if cfg!(debug_assertions) {
                return Err(err);
            }
            tracing::warn!(
                blob_id = self.id,
                offset,
                size,
                error = %err,
                "ignoring release of unallocated range"
            );
            return Ok(inner.valid_size);
        }
        inner.valid_size = inner.valid_size.saturating_sub(size);
        inner.refresh_rate();
        Ok(inner.valid_size)
    }

    /// Re-marks a directory entry's region as used while rebuilding state at
    /// startup.
    pub fn restore_used(&self, inner: &mut StatInner, offset: u64, size: u64) -> Result<()> {
        inner.smap.mark_used(offset, size)?;
        inner.valid_size += size;
        let end = offset + size;
        if end > inner.total_size {
            inner.total_size = end;
        }
        inner.refresh_rate();
        Ok(())
    }

    /// Recomputes the capacity hint from the space map's actual largest free
    /// extent.
    pub fn recalculate_capacity(&self, inner: &StatInner) {
        self.max_caps
            .store(inner.smap.max_free_extent(), Ordering::SeqCst);
    }
}

impl StatInner {
    pub fn refresh_rate(&mut self) {
        let boundary = self.smap.used_boundary();
        self.valid_rate = if boundary > 0 {
            self.valid_size as f64 / boundary as f64
        } else {
            0.0
        };
    }
}
