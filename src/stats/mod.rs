//! Registry of blob stats.
//!
//! The registry owns every [`BlobStat`] by id, grouped per root directory,
//! and is the only component that creates or erases them. All other parts of
//! the store refer to blobs by integer id and go through the registry to
//! reach a stat, so no component ever holds a cycle of references.
//!
//! Locking: the registry mutex is the top of the lock hierarchy. A stat's
//! own lock may be acquired while the registry is held (stat selection does
//! exactly that, so two writers cannot both commit to the last bytes of one
//! stat); the reverse order is forbidden.

pub mod stat;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::entry::BlobId;
use crate::errlogic;
use crate::error::Result;
use crate::spacemap::SpaceMapKind;

pub use stat::{BlobStat, StatInner};

pub struct BlobStats {
    inner: Mutex<StatsInner>,
}

pub struct StatsInner {
    paths: Vec<PathBuf>,
    stats_by_path: Vec<Vec<Arc<BlobStat>>>,
    /// Round-robin start position across paths.
    path_cursor: usize,
    /// Per-path round-robin start position among that path's stats.
    stat_cursors: Vec<usize>,
    next_blob_id: BlobId,
}

impl BlobStats {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        let stats_by_path = paths.iter().map(|_| Vec::new()).collect();
        let stat_cursors = paths.iter().map(|_| 0).collect();
        Self {
            inner: Mutex::new(StatsInner {
                paths,
                stats_by_path,
                path_cursor: 0,
                stat_cursors,
                next_blob_id: 1,
            }),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, StatsInner>> {
        self.inner.lock().map_err(Into::into)
    }

    /// Copy of every registered stat, for lock-free iteration afterwards.
    pub fn snapshot(&self) -> Result<Vec<Arc<BlobStat>>> {
        let inner = self.lock()?;
        Ok(inner
            .stats_by_path
            .iter()
            .flat_map(|stats| stats.iter().cloned())
            .collect())
    }

    pub fn blob_id_to_stat(&self, blob_id: BlobId) -> Result<Option<Arc<BlobStat>>> {
        let inner = self.lock()?;
        Ok(inner.find(blob_id))
    }
}

impl StatsInner {
    /// First writable stat whose capacity hint fits `size`. Paths are
    /// scanned round-robin from the path cursor, and within each path the
    /// scan starts after the stat chosen last time and wraps, so writes
    /// spread across every writable blob instead of pinning the first one.
    /// `None` means the caller should create a fresh blob.
    pub fn choose_stat(&mut self, size: u64) -> Option<Arc<BlobStat>> {
        let path_count = self.paths.len();
        for step in 0..path_count {
            let path_idx = (self.path_cursor + step) % path_count;
            let stats = &self.stats_by_path[path_idx];
            if stats.is_empty() {
                continue;
            }
            // Erasures may have shrunk the list since the cursor last moved.
            let start = self.stat_cursors[path_idx] % stats.len();
            let found = (0..stats.len())
                .map(|k| (start + k) % stats.len())
                .find(|&idx| {
                    let stat = &stats[idx];
                    !stat.is_read_only() && stat.max_caps() >= size
                });
            if let Some(idx) = found {
                let stat = stats[idx].clone();
                self.stat_cursors[path_idx] = (idx + 1) % stats.len();
                self.path_cursor = (path_idx + 1) % path_count;
                return Some(stat);
            }
        }
        None
    }

    /// Reserves the next blob id. Ids are monotone and never reused.
    pub fn next_id(&mut self) -> BlobId {
        let id = self.next_blob_id;
        self.next_blob_id += 1;
        id
    }

    /// Registers a fresh stat for `blob_id` under `path`. The id must come
    /// from [`StatsInner::next_id`] and be unused.
    pub fn create_stat(
        &mut self,
        blob_id: BlobId,
        capacity: u64,
        kind: SpaceMapKind,
        path: PathBuf,
    ) -> Result<Arc<BlobStat>> {
        if self.find(blob_id).is_some() {
            return Err(errlogic!("blob stat already exists, blob_id={blob_id}"));
        }
        let stat = Arc::new(BlobStat::new(blob_id, path.clone(), kind, capacity));
        let path_idx = self.path_index(path);
        self.stats_by_path[path_idx].push(stat.clone());
        tracing::debug!(blob_id, capacity, "created blob stat");
        Ok(stat)
    }

    /// Registers a stat for a blob file found on disk during startup. Keeps
    /// the id counter ahead of every registered id.
    pub fn register_stat(
        &mut self,
        blob_id: BlobId,
        capacity: u64,
        disk_size: u64,
        kind: SpaceMapKind,
        path: PathBuf,
    ) -> Result<Arc<BlobStat>> {
        let stat = self.create_stat(blob_id, capacity, kind, path)?;
        {
            let mut inner = stat.lock()?;
            inner.total_size = disk_size;
        }
        if blob_id >= self.next_blob_id {
            self.next_blob_id = blob_id + 1;
        }
        Ok(stat)
    }

    /// Drops a stat from the registry. Only legal once the stat is read-only
    /// and holds no valid bytes.
    pub fn erase_stat(&mut self, blob_id: BlobId) -> Result<()> {
        for stats in &mut self.stats_by_path {
            if let Some(idx) = stats.iter().position(|s| s.id() == blob_id) {
                let stat = stats.remove(idx);
                debug_assert!(stat.is_read_only());
                tracing::info!(blob_id, "erased blob stat");
                return Ok(());
            }
        }
        Err(errlogic!("erasing unknown blob stat, blob_id={blob_id}"))
    }

    pub fn find(&self, blob_id: BlobId) -> Option<Arc<BlobStat>> {
        self.stats_by_path
            .iter()
            .flat_map(|stats| stats.iter())
            .find(|stat| stat.id() == blob_id)
            .cloned()
    }

    fn path_index(&mut self, path: PathBuf) -> usize {
        match self.paths.iter().position(|p| *p == path) {
            Some(idx) => idx,
            None => {
                self.paths.push(path);
                self.stats_by_path.push(Vec::new());
                self.stat_cursors.push(0);
                self.paths.len() - 1
            }
        }
    }
}
