//! Blob placement capability.
//!
//! The delegator owns the mapping from blob ids to root directories and the
//! per-root usage accounting that drives placement. The store asks it where a
//! blob lives (or should live) and reports every byte added or freed; it
//! never walks directories itself outside of `register_paths`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::entry::BlobId;

pub trait PathDelegator: Send + Sync {
    /// Root directories to scan at startup.
    fn list_paths(&self) -> Vec<PathBuf>;

    /// Directory holding `blob_id`'s file. For an unseen id this decides the
    /// placement and records it, so subsequent lookups agree.
    fn blob_path(&self, blob_id: BlobId) -> PathBuf;

    /// Accounts `bytes` of growth for `blob_id` under `path`, recording the
    /// id's location if it is not yet known.
    fn add_used_size(&self, blob_id: BlobId, bytes: u64, path: &Path);

    /// Accounts `bytes` reclaimed from `blob_id` (truncate or remove).
    fn free_used_size(&self, blob_id: BlobId, bytes: u64);
}

/// Delegator over a fixed set of roots. New blobs are placed on the root with
/// the fewest accounted bytes.
pub struct FixedPathDelegator {
    paths: Vec<PathBuf>,
    inner: Mutex<DelegatorInner>,
}

struct DelegatorInner {
    locations: HashMap<BlobId, usize>,
    used: Vec<u64>,
}

impl FixedPathDelegator {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        assert!(!paths.is_empty(), "at least one root path required");
        let used = vec![0; paths.len()];
        Self {
            paths,
            inner: Mutex::new(DelegatorInner {
                locations: HashMap::new(),
                used,
            }),
        }
    }

    pub fn single(path: impl Into<PathBuf>) -> Self {
        Self::new(vec![path.into()])
    }

    fn path_index(&self, path: &Path) -> Option<usize> {
        self.paths.iter().position(|p| p == path)
    }
}

impl PathDelegator for FixedPathDelegator {
    fn list_paths(&self) -> Vec<PathBuf> {
        self.paths.clone()
    }

    fn blob_path(&self, blob_id: BlobId) -> PathBuf {
        let mut inner = self.inner.lock().unwrap();
        let idx = match inner.locations.get(&blob_id) {
            Some(&idx) => idx,
            None => {
                let idx = inner
                    .used
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, &used)| used)
                    .map(|(idx, _)| idx)
                    .unwrap_or(0);
                inner.locations.insert(blob_id, idx);
                idx
            }
        };
        self.paths[idx].clone()
    }

    fn add_used_size(&self, blob_id: BlobId, bytes: u64, path: &Path) {
        let mut inner = self.inner.lock().unwrap();
        let idx = match inner.locations.get(&blob_id) {
            Some(&idx) => idx,
            None => {
                let idx = self.path_index(path).unwrap_or(0);
                inner.locations.insert(blob_id, idx);
                idx
            }
        };
        inner.used[idx] += bytes;
    }

    fn free_used_size(&self, blob_id: BlobId, bytes: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&idx) = inner.locations.get(&blob_id) {
            inner.used[idx] = inner.used[idx].saturating_sub(bytes);
        }
    }
}
