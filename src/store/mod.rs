//! Page-level blob storage engine.
//!
//! Pages are opaque byte payloads packed into append-only container files
//! (`blobfile_<id>`) spread over one or more root directories. The store
//! hands every caller an *entry* describing where a payload landed; the
//! caller's page directory owns those entries and feeds them back for reads,
//! removal, and GC.
//!
//! ```text
//!            write batch                       entries
//!  caller ────────────────► BlobStore ◄──────────────────── caller
//!                              │
//!              ┌───────────────┼──────────────────┐
//!              ▼               ▼                  ▼
//!         BlobStats       blob_files         GC planning
//!      (per-blob stat,   (open handle       (valid-rate scan,
//!       space map,         cache)            live-page migration)
//!       selection)
//!              │               │
//!              ▼               ▼
//!         blobfile_1      blobfile_2   ...   (raw payload bytes)
//! ```
//!
//! # Concurrency
//!
//! Many threads may call `write`/`read`/`remove` concurrently while one
//! background task runs GC. Lock order is registry → stat → file cache;
//! the only sanctioned exception is removal, which drops the stat lock
//! before taking the registry lock to retire an empty read-only blob.
//! Reads touch neither the registry nor any stat.

pub(crate) mod gc;
pub mod metrics;
pub(crate) mod read;
pub mod tasks;
pub(crate) mod write;

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use crate::batch::WriteBatch;
use crate::blobfile::{blob_file_name, parse_blob_file_name, BlobFile};
use crate::config::BlobConfig;
use crate::edit::EntriesEdit;
use crate::entry::{BlobId, PageEntry, PageId};
use crate::errlogic;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::limiter::{NoLimit, RateLimiter};
use crate::page::Page;
use crate::paths::{FixedPathDelegator, PathDelegator};
use crate::provider::{FileProvider, LocalFileProvider};
use crate::stats::BlobStats;

pub use gc::GcEntries;
pub use metrics::FileUsage;
pub use read::FieldReadInfo;
pub use tasks::{GcDirectory, GcTask, MetricsTask};

const LOCK_FILE: &str = "emberstore.lock";

pub struct BlobStore {
    config: RwLock<BlobConfig>,
    pub(crate) provider: Arc<dyn FileProvider>,
    pub(crate) delegator: Arc<dyn PathDelegator>,
    pub(crate) write_limiter: Arc<dyn RateLimiter>,
    pub(crate) read_limiter: Arc<dyn RateLimiter>,
    pub(crate) stats: BlobStats,
    blob_files: Mutex<HashMap<BlobId, Arc<BlobFile>>>,
    root_locks: Mutex<Vec<FileLock>>,
}

impl BlobStore {
    /// Builds a store from explicit capabilities. Call
    /// [`BlobStore::register_paths`] before serving traffic.
    pub fn new(
        provider: Arc<dyn FileProvider>,
        delegator: Arc<dyn PathDelegator>,
        write_limiter: Arc<dyn RateLimiter>,
        read_limiter: Arc<dyn RateLimiter>,
        config: BlobConfig,
    ) -> Self {
        let stats = BlobStats::new(delegator.list_paths());
        Self {
            config: RwLock::new(config),
            provider,
            delegator,
            write_limiter,
            read_limiter,
            stats,
            blob_files: Mutex::new(HashMap::new()),
            root_locks: Mutex::new(Vec::new()),
        }
    }

    /// Opens a single-root store with local files, no rate limiting and the
    /// given config, scanning the root for existing blob files.
    pub fn open_with_config(dir: impl Into<PathBuf>, config: BlobConfig) -> Result<Self> {
        let store = Self::new(
            Arc::new(LocalFileProvider),
            Arc::new(FixedPathDelegator::single(dir.into())),
            Arc::new(NoLimit),
            Arc::new(NoLimit),
            config,
        );
        store.register_paths()?;
        Ok(store)
    }

    /// Opens a single-root store with the default configuration.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_config(dir, BlobConfig::default())
    }

    /// Rebuilds the stat registry from the blob files present in each root.
    /// There is no manifest; the directory listing is the source of truth.
    /// Each root is locked against other processes for the store's lifetime.
    pub fn register_paths(&self) -> Result<()> {
        let config = self.config()?;
        for path in self.delegator.list_paths() {
            fs::create_dir_all(&path)?;
            self.root_locks
                .lock()?
                .push(FileLock::lock(path.join(LOCK_FILE))?);

            for dir_entry in fs::read_dir(&path)? {
                let dir_entry = dir_entry?;
                if !dir_entry.file_type()?.is_file() {
                    continue;
                }
                let name = dir_entry.file_name();
                let name = name.to_string_lossy();
                match parse_blob_file_name(&name) {
                    Some(blob_id) => {
                        let disk_size = dir_entry.metadata()?.len();
                        self.delegator.add_used_size(blob_id, disk_size, &path);
                        let mut reg = self.stats.lock()?;
                        reg.register_stat(
                            blob_id,
                            disk_size.max(config.file_limit_size),
                            disk_size,
                            config.spacemap_type,
                            path.clone(),
                        )?;
                        tracing::info!(blob_id, disk_size, dir = %path.display(), "registered blob file");
                    }
                    None => {
                        tracing::info!(dir = %path.display(), file = %name, "ignoring non-blob file");
                    }
                }
            }
        }
        Ok(())
    }

    /// Re-marks one directory entry's region as live while the directory
    /// replays its log after [`BlobStore::register_paths`]. Entries without
    /// local bytes are ignored.
    pub fn restore_entry(&self, entry: &PageEntry) -> Result<()> {
        if !entry.is_valid() || entry.total_size() == 0 {
            return Ok(());
        }
        let stat = self
            .stats
            .blob_id_to_stat(entry.file_id)?
            .ok_or_else(|| errlogic!("restoring entry for unknown blob, entry={entry}"))?;
        let mut inner = stat.lock()?;
        stat.restore_used(&mut inner, entry.offset, entry.total_size())
    }

    /// Finishes a restore: recomputes every capacity hint and valid rate.
    pub fn finalize_restore(&self) -> Result<()> {
        for stat in self.stats.snapshot()? {
            let mut inner = stat.lock()?;
            inner.refresh_rate();
            stat.recalculate_capacity(&inner);
        }
        Ok(())
    }

    /// Applies a write batch and returns the edit for the directory to
    /// record. Payloads are durable once this returns.
    pub fn write<Id: PageId>(&self, batch: WriteBatch<Id>) -> Result<EntriesEdit<Id>> {
        write::write_batch(self, batch)
    }

    /// Materializes one page from its entry.
    pub fn read_page<Id: PageId>(&self, page_id: Id, entry: &PageEntry) -> Result<Page<Id>> {
        read::read_page(self, page_id, entry)
    }

    /// Materializes a batch of whole pages, all backed by one shared buffer.
    pub fn read_pages<Id: PageId>(
        &self,
        entries: Vec<(Id, PageEntry)>,
    ) -> Result<HashMap<Id, Page<Id>>> {
        read::read_pages(self, entries)
    }

    /// Materializes selected fields of a batch of pages.
    pub fn read_fields<Id: PageId>(
        &self,
        to_read: Vec<FieldReadInfo<Id>>,
    ) -> Result<HashMap<Id, Page<Id>>> {
        read::read_fields(self, to_read)
    }

    /// Invalidates a batch of entries, releasing their regions. A blob whose
    /// stat is read-only and reaches zero valid bytes is erased and its file
    /// unlinked.
    pub fn remove(&self, entries: &[PageEntry]) -> Result<()> {
        let mut touched = BTreeSet::new();
        for entry in entries {
            if !entry.is_valid() || entry.size == 0 {
                continue;
            }
            touched.insert(entry.file_id);
            self.remove_pos_from_stats(entry.file_id, entry.offset, entry.total_size())
                .map_err(|err| add_context(err, &format!("while removing entry {entry}")))?;
        }

        // Releases change the free layout, so refresh the capacity hints of
        // every touched blob that still exists.
        for blob_id in touched {
            if let Some(stat) = self.stats.blob_id_to_stat(blob_id)? {
                let inner = stat.lock()?;
                stat.recalculate_capacity(&inner);
                tracing::trace!(
                    blob_id,
                    max_caps = stat.max_caps(),
                    total_size = inner.total_size,
                    valid_size = inner.valid_size,
                    valid_rate = inner.valid_rate,
                    "recalculated blob capacity"
                );
            }
        }
        Ok(())
    }

    /// Scans every stat, truncating reclaimable tails and marking blobs below
    /// the valid-rate threshold read-only. Returns the blob ids whose live
    /// entries must be migrated.
    pub fn get_gc_stats(&self) -> Result<Vec<BlobId>> {
        gc::get_gc_stats(self)
    }

    /// Migrates the given live entries into fresh blobs and returns the
    /// upsert edit. Source blobs are never deleted here; they drain through
    /// [`BlobStore::remove`] once the directory applies the edit.
    pub fn gc<Id: PageId>(
        &self,
        entries_need_gc: GcEntries<Id>,
        total_size: u64,
    ) -> Result<EntriesEdit<Id>> {
        gc::gc(self, entries_need_gc, total_size)
    }

    /// Aggregate disk/valid sizes across all blobs.
    pub fn file_usage(&self) -> Result<FileUsage> {
        metrics::file_usage(self)
    }

    /// Swaps the tunables at runtime.
    pub fn reload_config(&self, config: BlobConfig) -> Result<()> {
        *self.config.write()? = config;
        Ok(())
    }

    /// Testing hook: freezes every stat so the next GC round selects nothing
    /// for writing and all blobs drain through removal.
    pub fn force_all_read_only(&self) -> Result<()> {
        for stat in self.stats.snapshot()? {
            stat.mark_read_only();
        }
        tracing::warn!("all blob stats forced read-only");
        Ok(())
    }

    /// Drops the cached handle for `blob_id`. In-flight readers keep their
    /// clone of the handle; the descriptor closes when the last clone drops.
    pub fn evict_file(&self, blob_id: BlobId) -> Result<()> {
        self.blob_files.lock()?.remove(&blob_id);
        Ok(())
    }

    pub(crate) fn config(&self) -> Result<BlobConfig> {
        Ok(self.config.read()?.clone())
    }

    /// Allocates `size` bytes somewhere, creating a new blob when no existing
    /// stat fits. The chosen stat's lock is acquired under the registry lock
    /// so concurrent writers cannot both commit to its last bytes.
    pub(crate) fn get_pos_from_stats(&self, size: u64) -> Result<(BlobId, u64)> {
        let config = self.config()?;
        let mut reg = self.stats.lock()?;
        let stat = match reg.choose_stat(size) {
            Some(stat) => stat,
            None => {
                let blob_id = reg.next_id();
                let path = self.delegator.blob_path(blob_id);
                reg.create_stat(
                    blob_id,
                    size.max(config.file_limit_size),
                    config.spacemap_type,
                    path,
                )?
            }
        };
        let mut inner = stat.lock()?;
        drop(reg);

        let old_caps = stat.reduce_max_caps(size);
        match stat.allocate(&mut inner, size) {
            Some(offset) => Ok((stat.id(), offset)),
            None => Err(Error::AllocationFailed(format!(
                "no span for {size} bytes in blob {}, capacity hint was stale, old_max_caps={old_caps}",
                stat.id()
            ))),
        }
    }

    /// Releases `[offset, offset + size)` from `blob_id`'s stat. When that
    /// leaves a read-only stat empty, the stat is erased and the blob file
    /// unlinked. The stat lock is dropped before the registry lock is taken.
    pub(crate) fn remove_pos_from_stats(
        &self,
        blob_id: BlobId,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        let stat = self
            .stats
            .blob_id_to_stat(blob_id)?
            .ok_or_else(|| errlogic!("releasing span of unknown blob, blob_id={blob_id}"))?;
        {
            let mut inner = stat.lock()?;
            let remaining = stat.release(&mut inner, offset, size)?;
            if !(stat.is_read_only() && remaining == 0) {
                return Ok(());
            }
            // Read-only and empty: nothing will ever be written to or read
            // from this blob again.
        }

        tracing::info!(blob_id, "removing empty read-only blob file");
        self.stats.lock()?.erase_stat(blob_id)?;

        let cached = self.blob_files.lock()?.remove(&blob_id);
        match cached {
            Some(file) => file.remove()?,
            None => {
                // Never opened in this process; unlink the path directly.
                let path = self.delegator.blob_path(blob_id).join(blob_file_name(blob_id));
                if let Ok(meta) = fs::metadata(&path) {
                    self.provider.remove(&path)?;
                    self.delegator.free_used_size(blob_id, meta.len());
                }
            }
        }
        Ok(())
    }

    /// Cached open handle for `blob_id`, opening (and creating) the file on
    /// first use.
    pub(crate) fn get_blob_file(&self, blob_id: BlobId) -> Result<Arc<BlobFile>> {
        let mut files = self.blob_files.lock()?;
        if let Some(file) = files.get(&blob_id) {
            return Ok(file.clone());
        }
        let parent = self.delegator.blob_path(blob_id);
        fs::create_dir_all(&parent)?;
        let file = Arc::new(BlobFile::open(
            blob_id,
            &parent,
            self.provider.clone(),
            self.delegator.clone(),
        )?);
        files.insert(blob_id, file.clone());
        Ok(file)
    }
}

pub(crate) fn add_context(err: Error, context: &str) -> Error {
    match err {
        Error::Logic(msg) => Error::Logic(format!("{msg} ({context})")),
        Error::Io(msg) => Error::Io(format!("{msg} ({context})")),
        Error::ChecksumMismatch(msg) => Error::ChecksumMismatch(format!("{msg} ({context})")),
        Error::AllocationFailed(msg) => Error::AllocationFailed(format!("{msg} ({context})")),
    }
}
