use crate::error::Result;
use crate::store::BlobStore;

/// Aggregate sizes across all blob files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileUsage {
    pub total_disk_size: u64,
    pub total_valid_size: u64,
    pub total_file_num: usize,
}

pub(crate) fn file_usage(store: &BlobStore) -> Result<FileUsage> {
    let stats = store.stats.snapshot()?;
    let mut usage = FileUsage {
        total_file_num: stats.len(),
        ..Default::default()
    };
    for stat in &stats {
        let inner = stat.lock()?;
        usage.total_disk_size += inner.total_size;
        usage.total_valid_size += inner.valid_size;
    }
    Ok(usage)
}

/// Collect usage from the store and log it
pub fn collect_metrics(store: &BlobStore) -> Result<()> {
    let usage = file_usage(store)?;
    tracing::info!(
        total_disk_size = usage.total_disk_size,
        total_valid_size = usage.total_valid_size,
        total_file_num = usage.total_file_num,
        "blob store usage"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::WriteBatch;
    use crate::config::BlobConfig;
    use crate::tmpfs::TempDir;
    use std::io::Cursor;

    #[test]
    fn test_usage_tracks_writes_and_removes() {
        let dir = TempDir::new().unwrap();
        let store =
            BlobStore::open_with_config(dir.path(), BlobConfig::default().file_limit_size(512))
                .unwrap();
        assert_eq!(store.file_usage().unwrap(), FileUsage::default());

        let mut batch: WriteBatch<String> = WriteBatch::new();
        batch.put("a".into(), 0, Cursor::new(vec![1; 100]), 100, vec![]);
        batch.put("b".into(), 0, Cursor::new(vec![2; 60]), 60, vec![]);
        let edit = store.write(batch).unwrap();

        let usage = store.file_usage().unwrap();
        assert_eq!(usage.total_file_num, 1);
        assert_eq!(usage.total_disk_size, 160);
        assert_eq!(usage.total_valid_size, 160);

        let entries: Vec<_> = edit
            .into_records()
            .into_iter()
            .filter_map(|record| match record {
                crate::edit::EditRecord::Put { entry, .. } => Some(entry),
                _ => None,
            })
            .collect();
        store.remove(&entries[..1]).unwrap();

        let usage = store.file_usage().unwrap();
        assert_eq!(usage.total_disk_size, 160);
        assert_eq!(usage.total_valid_size, 60);
    }
}
