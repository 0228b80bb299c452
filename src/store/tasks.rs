//! Background tasks driving GC and metrics.
//!
//! The GC task owns the full round: plan with `get_gc_stats`, ask the page
//! directory which entries of the selected blobs are still live, migrate
//! them, and hand the upsert edit back to the directory to apply atomically.
//! The store itself never talks to the directory outside this seam.

use std::sync::Arc;
use std::time::Duration;

use crate::edit::EntriesEdit;
use crate::entry::{BlobId, PageId};
use crate::error::Result;
use crate::scheduler::BackgroundTask;
use crate::store::gc::GcEntries;
use crate::store::{metrics, BlobStore};

/// The directory-side half of a GC round.
pub trait GcDirectory<Id: PageId>: Send + Sync {
    /// Live entries of the given blobs, grouped by source blob id, plus
    /// their total payload size.
    fn live_entries(&self, blob_ids: &[BlobId]) -> Result<(GcEntries<Id>, u64)>;

    /// Applies the upsert edit atomically. Stale source entries are expected
    /// to come back through [`BlobStore::remove`] afterwards.
    fn apply_gc_edit(&self, edit: EntriesEdit<Id>) -> Result<()>;
}

pub struct GcTask<Id: PageId> {
    store: Arc<BlobStore>,
    directory: Arc<dyn GcDirectory<Id>>,
    interval: Duration,
}

impl<Id: PageId> GcTask<Id> {
    pub fn new(
        store: Arc<BlobStore>,
        directory: Arc<dyn GcDirectory<Id>>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            directory,
            interval,
        }
    }
}

impl<Id: PageId> BackgroundTask for GcTask<Id> {
    fn name(&self) -> &'static str {
        "blob-gc"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn execute(&self) -> Result<()> {
        let need_gc = self.store.get_gc_stats()?;
        if need_gc.is_empty() {
            return Ok(());
        }

        let (entries, total_size) = self.directory.live_entries(&need_gc)?;
        if total_size == 0 || entries.is_empty() {
            // Every selected blob is fully dead; removal will drain them.
            tracing::debug!(blobs = need_gc.len(), "gc round found nothing live");
            return Ok(());
        }

        let edit = self.store.gc(entries, total_size)?;
        self.directory.apply_gc_edit(edit)
    }
}

pub struct MetricsTask {
    store: Arc<BlobStore>,
    interval: Duration,
}

impl MetricsTask {
    pub fn new(store: Arc<BlobStore>, interval: Duration) -> Self {
        Self { store, interval }
    }
}

impl BackgroundTask for MetricsTask {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn execute(&self) -> Result<()> {
        metrics::collect_metrics(&self.store)
    }
}
