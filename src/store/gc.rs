//! Online garbage collection.
//!
//! Planning scans every stat: blobs whose valid fraction sank to the
//! configured threshold are frozen read-only and reported for migration;
//! reclaimable tails are truncated along the way. Execution copies the
//! still-live entries (supplied by the directory) into fresh blobs through a
//! bounded staging buffer and returns an upsert edit. Source blobs are never
//! deleted here; they drain to zero through removal once the directory has
//! switched every reference over.

use std::collections::BTreeMap;
use std::fmt;

use itertools::Itertools;

use crate::edit::EntriesEdit;
use crate::entry::{BlobId, PageEntry, PageId, PageVersion};
use crate::errlogic;
use crate::error::Result;
use crate::store::{read, BlobStore};

/// Live entries to migrate, grouped by source blob id, in migration order.
pub type GcEntries<Id> = BTreeMap<BlobId, Vec<(Id, PageVersion, PageEntry)>>;

/// What one planning round saw, logged once per round.
#[derive(Default)]
pub(crate) struct GcRoundInfo {
    read_only: Vec<(BlobId, f64)>,
    truncated: Vec<(BlobId, u64, u64)>,
    need_gc: Vec<(BlobId, f64)>,
    healthy: Vec<(BlobId, f64)>,
}

impl GcRoundInfo {
    fn notable(&self) -> bool {
        !self.need_gc.is_empty() || !self.truncated.is_empty()
    }
}

impl fmt::Display for GcRoundInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "need_gc=[{}] truncated=[{}] read_only=[{}] healthy=[{}]",
            self.need_gc
                .iter()
                .map(|(id, rate)| format!("{id}:{rate:.2}"))
                .join(","),
            self.truncated
                .iter()
                .map(|(id, from, to)| format!("{id}:{from}->{to}"))
                .join(","),
            self.read_only
                .iter()
                .map(|(id, rate)| format!("{id}:{rate:.2}"))
                .join(","),
            self.healthy
                .iter()
                .map(|(id, rate)| format!("{id}:{rate:.2}"))
                .join(","),
        )
    }
}

pub(crate) fn get_gc_stats(store: &BlobStore) -> Result<Vec<BlobId>> {
    let config = store.config()?;
    let stats = store.stats.snapshot()?;

    let mut need_gc = Vec::new();
    let mut info = GcRoundInfo::default();

    for stat in stats {
        if stat.is_read_only() {
            let inner = stat.lock()?;
            info.read_only.push((stat.id(), inner.valid_rate));
            tracing::trace!(blob_id = stat.id(), "blob is read-only");
            continue;
        }

        let mut inner = stat.lock()?;
        let boundary = inner.smap.used_boundary();

        if boundary == 0 {
            if inner.valid_size != 0 {
                return Err(errlogic!(
                    "empty blob with nonzero valid size, blob_id={} valid_size={}",
                    stat.id(),
                    inner.valid_size
                ));
            }
            // Everything was released but the file may still hold bytes from
            // a previous life; shrink it and keep the blob writable.
            if inner.total_size != 0 {
                let blob_file = store.get_blob_file(stat.id())?;
                blob_file.truncate(0)?;
                tracing::info!(
                    blob_id = stat.id(),
                    total_size = inner.total_size,
                    "empty blob file truncated to zero"
                );
                info.truncated.push((stat.id(), inner.total_size, 0));
                inner.total_size = 0;
            }
            continue;
        }

        inner.valid_rate = inner.valid_size as f64 / boundary as f64;

        if inner.valid_rate > 1.0 {
            tracing::error!(
                blob_id = stat.id(),
                valid_rate = inner.valid_rate,
                valid_size = inner.valid_size,
                total_size = inner.total_size,
                used_boundary = boundary,
                "blob valid rate above 1.0"
            );
            debug_assert!(false, "valid rate above 1.0");
            continue;
        }

        if inner.valid_rate <= config.heavy_gc_valid_rate {
            tracing::trace!(
                blob_id = stat.id(),
                valid_rate = inner.valid_rate,
                "blob selected for gc"
            );
            stat.mark_read_only();
            need_gc.push(stat.id());
            info.need_gc.push((stat.id(), inner.valid_rate));
        } else {
            info.healthy.push((stat.id(), inner.valid_rate));
        }

        if boundary < inner.total_size {
            let blob_file = store.get_blob_file(stat.id())?;
            blob_file.truncate(boundary)?;
            tracing::trace!(
                blob_id = stat.id(),
                from = inner.total_size,
                to = boundary,
                "truncated blob tail"
            );
            info.truncated.push((stat.id(), inner.total_size, boundary));
            inner.total_size = boundary;
            inner.refresh_rate();
        }
    }

    if info.notable() {
        tracing::info!(round = %info, "gc planning done");
    } else {
        tracing::debug!(round = %info, "gc planning done");
    }
    Ok(need_gc)
}

pub(crate) fn gc<Id: PageId>(
    store: &BlobStore,
    entries_need_gc: GcEntries<Id>,
    total_size: u64,
) -> Result<EntriesEdit<Id>> {
    if total_size == 0 {
        return Err(errlogic!("gc called with nothing to migrate"));
    }

    let config = store.config()?;
    tracing::info!(
        total_size,
        source_blobs = entries_need_gc.len(),
        "gc migrating live pages into new blobs"
    );

    // Bound the staging buffer by the file limit, but a single entry must
    // always fit in one region.
    let alloc_size = if total_size > config.file_limit_size {
        let biggest = entries_need_gc
            .values()
            .flatten()
            .map(|(_, _, entry)| entry.size)
            .max()
            .unwrap_or(0);
        config.file_limit_size.max(biggest)
    } else {
        total_size
    };

    let mut remaining = total_size - alloc_size.min(total_size);
    let mut staging = vec![0u8; alloc_size as usize];
    // Every region this invocation allocated, with the byte count still held
    // there; on failure all of them are rolled back.
    let mut regions: Vec<(BlobId, u64, u64)> = Vec::new();

    let (first_blob, first_offset) = store.get_pos_from_stats(alloc_size)?;
    regions.push((first_blob, first_offset, alloc_size));
    let mut blob_id = first_blob;
    let mut file_offset = first_offset;
    let mut region_size = alloc_size;
    let mut offset_in_data: u64 = 0;

    let mut edit = EntriesEdit::new();
    let mut migrate = |regions: &mut Vec<(BlobId, u64, u64)>,
                       edit: &mut EntriesEdit<Id>|
     -> Result<()> {
        for (&source_blob, live_entries) in &entries_need_gc {
            for (page_id, version, entry) in live_entries {
                // A full region is flushed and replaced before the entry
                // that would overflow it.
                if offset_in_data + entry.size > region_size {
                    if offset_in_data != region_size {
                        store.remove_pos_from_stats(
                            blob_id,
                            file_offset + offset_in_data,
                            region_size - offset_in_data,
                        )?;
                        if let Some(last) = regions.last_mut() {
                            last.2 = offset_in_data;
                        }
                    }
                    remaining += region_size - offset_in_data;

                    flush_region(
                        store,
                        blob_id,
                        &staging[..offset_in_data as usize],
                        file_offset,
                        total_size,
                    )?;

                    let next_alloc = remaining.min(alloc_size);
                    if next_alloc == 0 {
                        return Err(errlogic!(
                            "gc total size smaller than its live entries, total_size={total_size}"
                        ));
                    }
                    remaining -= next_alloc;
                    let (next_blob, next_offset) = store.get_pos_from_stats(next_alloc)?;
                    regions.push((next_blob, next_offset, next_alloc));
                    blob_id = next_blob;
                    file_offset = next_offset;
                    region_size = next_alloc;
                    offset_in_data = 0;
                }

                if entry.size > region_size {
                    return Err(errlogic!(
                        "gc entry does not fit its region, page_id={page_id} entry={entry} region_size={region_size}"
                    ));
                }

                // Pull the payload from its old home straight into staging.
                let begin = offset_in_data as usize;
                let slice = &mut staging[begin..begin + entry.size as usize];
                read::read_raw(store, page_id, source_blob, entry.offset, slice, true)?;

                let mut new_entry = entry.clone();
                new_entry.file_id = blob_id;
                new_entry.offset = file_offset + offset_in_data;
                new_entry.padded_size = 0;
                offset_in_data += entry.size;

                edit.upsert(page_id.clone(), *version, new_entry);
            }
        }

        if offset_in_data != 0 {
            flush_region(
                store,
                blob_id,
                &staging[..offset_in_data as usize],
                file_offset,
                total_size,
            )?;
        }
        Ok(())
    };

    if let Err(err) = migrate(&mut regions, &mut edit) {
        // Roll back every destination region; the edit is discarded with the
        // error, so nothing references the bytes that did land.
        for (region_blob, region_offset, size) in regions {
            if size == 0 {
                continue;
            }
            if let Err(release_err) =
                store.remove_pos_from_stats(region_blob, region_offset, size)
            {
                tracing::error!(
                    blob_id = region_blob,
                    offset = region_offset,
                    size,
                    error = %release_err,
                    "failed to roll back gc destination region"
                );
            }
        }
        return Err(err);
    }

    Ok(edit)
}

fn flush_region(
    store: &BlobStore,
    blob_id: BlobId,
    data: &[u8],
    file_offset: u64,
    total_size: u64,
) -> Result<()> {
    tracing::info!(
        blob_id,
        file_offset,
        size = data.len(),
        total_size,
        "gc region write"
    );
    let blob_file = store.get_blob_file(blob_id)?;
    blob_file.write(data, file_offset, &*store.write_limiter, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::WriteBatch;
    use crate::config::BlobConfig;
    use crate::edit::EditRecord;
    use crate::error::Error;
    use crate::tmpfs::TempDir;
    use std::io::Cursor;

    fn put_bytes(store: &BlobStore, id: &str, bytes: Vec<u8>) -> PageEntry {
        let mut batch: WriteBatch<String> = WriteBatch::new();
        let size = bytes.len() as u64;
        batch.put(id.to_string(), 0, Cursor::new(bytes), size, vec![]);
        let edit = store.write(batch).unwrap();
        match edit.into_records().remove(0) {
            EditRecord::Put { entry, .. } => entry,
            other => panic!("expected put, got {other:?}"),
        }
    }

    fn upserts(edit: &EntriesEdit<String>) -> Vec<(String, PageEntry)> {
        edit.records()
            .iter()
            .map(|record| match record {
                EditRecord::Upsert { page_id, entry, .. } => (page_id.clone(), entry.clone()),
                other => panic!("expected upsert, got {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_gc_with_nothing_to_migrate_is_logic_error() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let result = store.gc(GcEntries::<String>::new(), 0);
        assert!(matches!(result, Err(Error::Logic(_))));
    }

    #[test]
    fn test_gc_spans_multiple_regions() {
        let dir = TempDir::new().unwrap();
        let store =
            BlobStore::open_with_config(dir.path(), BlobConfig::default().file_limit_size(300))
                .unwrap();

        // Six live pages of 100 bytes each; alloc regions hold 300 bytes, so
        // the migration needs three regions.
        let mut live: GcEntries<String> = GcEntries::new();
        let mut originals = Vec::new();
        for i in 0..6u8 {
            let entry = put_bytes(&store, &format!("p{i}"), vec![i + 1; 100]);
            live.entry(entry.file_id).or_default().push((
                format!("p{i}"),
                PageVersion::new(i as u64, 0),
                entry.clone(),
            ));
            originals.push(entry);
        }

        let edit = store.gc(live, 600).unwrap();
        let migrated = upserts(&edit);
        assert_eq!(migrated.len(), 6);

        for (i, (page_id, new_entry)) in migrated.iter().enumerate() {
            assert_eq!(new_entry.padded_size, 0);
            assert_eq!(new_entry.checksum, originals[i].checksum);
            let old = store.read_page(page_id.clone(), &originals[i]).unwrap();
            let new = store.read_page(page_id.clone(), new_entry).unwrap();
            assert_eq!(old.data(), new.data());
        }
    }

    #[test]
    fn test_gc_raises_alloc_for_oversized_entry() {
        let dir = TempDir::new().unwrap();
        let store =
            BlobStore::open_with_config(dir.path(), BlobConfig::default().file_limit_size(4096))
                .unwrap();

        // One entry larger than file_limit_size: written through the split
        // path, then migrated in one piece.
        let big = put_bytes(&store, "big", vec![0x42; 5000]);
        let small = put_bytes(&store, "small", vec![0x43; 100]);

        let mut live: GcEntries<String> = GcEntries::new();
        live.entry(big.file_id).or_default().push((
            "big".to_string(),
            PageVersion::default(),
            big.clone(),
        ));
        live.entry(small.file_id).or_default().push((
            "small".to_string(),
            PageVersion::default(),
            small.clone(),
        ));

        let edit = store.gc(live, 5100).unwrap();
        for (page_id, new_entry) in upserts(&edit) {
            let old = if page_id == "big" { &big } else { &small };
            assert_eq!(
                store.read_page(page_id.clone(), old).unwrap().data(),
                store.read_page(page_id, &new_entry).unwrap().data()
            );
        }
    }

    #[test]
    fn test_gc_preserves_field_offsets() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let mut batch: WriteBatch<String> = WriteBatch::new();
        let mut payload = vec![0xAA; 10];
        payload.extend_from_slice(&[0xBB; 6]);
        batch.put("x".into(), 0, Cursor::new(payload), 16, vec![0, 10]);
        let entry = match store.write(batch).unwrap().into_records().remove(0) {
            EditRecord::Put { entry, .. } => entry,
            other => panic!("unexpected {other:?}"),
        };

        let mut live: GcEntries<String> = GcEntries::new();
        live.entry(entry.file_id).or_default().push((
            "x".to_string(),
            PageVersion::default(),
            entry.clone(),
        ));
        let edit = store.gc(live, 16).unwrap();

        let (_, new_entry) = upserts(&edit).remove(0);
        assert_eq!(new_entry.field_offsets, entry.field_offsets);
        let page = store.read_page("x".to_string(), &new_entry).unwrap();
        assert_eq!(page.field_data(1), Some(&[0xBB; 6][..]));
    }

    #[test]
    fn test_planning_truncates_reclaimable_tail() {
        let dir = TempDir::new().unwrap();
        let store =
            BlobStore::open_with_config(dir.path(), BlobConfig::default().file_limit_size(1024))
                .unwrap();

        let keep = put_bytes(&store, "keep", vec![1; 600]);
        let drop_me = put_bytes(&store, "drop", vec![2; 200]);
        assert_eq!(keep.file_id, drop_me.file_id);
        let blob_path = dir
            .path()
            .join(crate::blobfile::blob_file_name(keep.file_id));
        assert_eq!(std::fs::metadata(&blob_path).unwrap().len(), 800);

        // Dropping the tail page pulls the boundary back to 600; planning
        // truncates the file but rate 1.0 keeps the blob writable.
        store.remove(&[drop_me]).unwrap();
        assert!(store.get_gc_stats().unwrap().is_empty());
        assert_eq!(std::fs::metadata(&blob_path).unwrap().len(), 600);

        let stat = store.stats.blob_id_to_stat(keep.file_id).unwrap().unwrap();
        assert!(!stat.is_read_only());
        assert_eq!(stat.lock().unwrap().total_size, 600);
    }

    #[test]
    fn test_planning_truncates_fully_released_blob_to_zero() {
        let dir = TempDir::new().unwrap();
        let store =
            BlobStore::open_with_config(dir.path(), BlobConfig::default().file_limit_size(1024))
                .unwrap();

        let entry = put_bytes(&store, "a", vec![1; 128]);
        let blob_path = dir
            .path()
            .join(crate::blobfile::blob_file_name(entry.file_id));
        store.remove(std::slice::from_ref(&entry)).unwrap();

        // Fully released: truncated to zero, still writable for reuse.
        assert!(store.get_gc_stats().unwrap().is_empty());
        assert_eq!(std::fs::metadata(&blob_path).unwrap().len(), 0);

        let reused = put_bytes(&store, "b", vec![2; 64]);
        assert_eq!(reused.file_id, entry.file_id);
        assert_eq!(reused.offset, 0);
    }
}
