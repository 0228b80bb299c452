use std::time::Duration;

use crate::spacemap::SpaceMapKind;

/// Configuration for the blob store
#[derive(Debug, Clone)]
pub struct BlobConfig {
    /// Maximum payload-group size written with a single allocation; batches
    /// above this are split per-put (default: 256MB)
    pub file_limit_size: u64,

    /// Representation of the per-blob free-interval map (default: IntervalTree)
    pub spacemap_type: SpaceMapKind,

    /// When non-zero, small-batch allocations are rounded up to a multiple of
    /// this many bytes (default: 0, disabled)
    pub block_alignment_bytes: u64,

    /// Valid-rate threshold at or below which a blob is selected for GC
    /// (default: 0.5)
    pub heavy_gc_valid_rate: f64,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the GC task plans and runs a round (default: 60s)
    pub gc_interval: Duration,

    /// How often to log file usage metrics (default: 5s)
    pub metrics_interval: Duration,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            file_limit_size: 256 * 1024 * 1024, // 256MB
            spacemap_type: SpaceMapKind::IntervalTree,
            block_alignment_bytes: 0,
            heavy_gc_valid_rate: 0.5,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(60),
            metrics_interval: Duration::from_secs(5),
        }
    }
}

impl BlobConfig {
    /// Set the single-allocation size limit
    pub fn file_limit_size(mut self, size: u64) -> Self {
        self.file_limit_size = size;
        self
    }

    /// Set the space-map representation
    pub fn spacemap_type(mut self, kind: SpaceMapKind) -> Self {
        self.spacemap_type = kind;
        self
    }

    /// Set the block alignment in bytes (0 disables padding)
    pub fn block_alignment_bytes(mut self, bytes: u64) -> Self {
        self.block_alignment_bytes = bytes;
        self
    }

    /// Set the GC valid-rate threshold
    pub fn heavy_gc_valid_rate(mut self, rate: f64) -> Self {
        self.heavy_gc_valid_rate = rate;
        self
    }
}

impl SchedulerConfig {
    /// Set the GC round interval
    pub fn gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Set the metrics logging interval
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }
}
