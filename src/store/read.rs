//! Page read paths.
//!
//! Reads come in three shapes: one page, a batch of whole pages, and a batch
//! of selected fields. Batch reads sort by file offset to linearize disk
//! access and materialize everything into one buffer shared by the returned
//! pages through a ref-counted holder. Checksums are re-verified on read
//! unless the compile-time knob below is turned off.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::ops::Range;
use std::sync::Arc;

use itertools::Itertools;

use crate::blobfile::BlobFile;
use crate::entry::{BlobId, PageEntry, PageId};
use crate::errlogic;
use crate::error::{Error, Result};
use crate::hasher;
use crate::page::{MemHolder, Page};
use crate::store::{add_context, BlobStore};

/// Re-verify CRC64s when reading. Flip to `false` to trade integrity checks
/// for read throughput.
pub(crate) const CHECKSUM_ON_READ: bool = true;

/// One page of a field read: which entry, and which of its fields.
#[derive(Debug, Clone)]
pub struct FieldReadInfo<Id: PageId> {
    pub page_id: Id,
    pub entry: PageEntry,
    pub fields: Vec<usize>,
}

pub(crate) fn read_page<Id: PageId>(
    store: &BlobStore,
    page_id: Id,
    entry: &PageEntry,
) -> Result<Page<Id>> {
    if !entry.is_valid() {
        tracing::debug!(page_id = %page_id, "read of remote entry yields no local bytes");
        return Ok(Page::empty(page_id));
    }
    if entry.size == 0 {
        // The caller could have skipped this read entirely.
        tracing::info!(page_id = %page_id, %entry, "read entry without size");
        return Ok(Page::empty(page_id));
    }

    let mut buf = vec![0u8; entry.size as usize];
    let blob_file = read_raw(store, &page_id, entry.file_id, entry.offset, &mut buf, false)?;
    if CHECKSUM_ON_READ {
        verify_page_checksum(&page_id, entry, &buf, &blob_file)?;
    }

    let field_offsets = whole_page_fields(entry);
    let size = buf.len();
    Ok(Page::new(page_id, Arc::new(buf), 0..size, field_offsets))
}

pub(crate) fn read_pages<Id: PageId>(
    store: &BlobStore,
    mut entries: Vec<(Id, PageEntry)>,
) -> Result<HashMap<Id, Page<Id>>> {
    if entries.is_empty() {
        return Ok(HashMap::new());
    }

    // Ascending file offsets make the underlying reads near-sequential.
    entries.sort_by_key(|(_, entry)| entry.offset);

    let buf_size: u64 = entries.iter().map(|(_, entry)| entry.size).sum();
    if buf_size == 0 {
        let mut pages = HashMap::new();
        for (page_id, entry) in entries {
            tracing::info!(page_id = %page_id, %entry, "read entry without size");
            pages.insert(page_id.clone(), Page::empty(page_id));
        }
        return Ok(pages);
    }

    let mut buf = vec![0u8; buf_size as usize];
    let mut staged: Vec<(Id, Range<usize>, BTreeMap<usize, usize>)> =
        Vec::with_capacity(entries.len());
    let mut pos = 0usize;

    for (page_id, entry) in &entries {
        if !entry.is_valid() || entry.size == 0 {
            staged.push((page_id.clone(), pos..pos, BTreeMap::new()));
            continue;
        }
        let end = pos + entry.size as usize;
        let blob_file = read_raw(
            store,
            page_id,
            entry.file_id,
            entry.offset,
            &mut buf[pos..end],
            false,
        )?;
        if CHECKSUM_ON_READ {
            verify_page_checksum(page_id, entry, &buf[pos..end], &blob_file)?;
        }
        staged.push((page_id.clone(), pos..end, whole_page_fields(entry)));
        pos = end;
    }

    if pos != buf.len() {
        return Err(errlogic!(
            "unexpected batch read size, expected={} actual={pos}",
            buf.len()
        ));
    }

    let holder: MemHolder = Arc::new(buf);
    Ok(staged
        .into_iter()
        .map(|(page_id, range, fields)| {
            (
                page_id.clone(),
                Page::new(page_id, holder.clone(), range, fields),
            )
        })
        .collect())
}

pub(crate) fn read_fields<Id: PageId>(
    store: &BlobStore,
    mut to_read: Vec<FieldReadInfo<Id>>,
) -> Result<HashMap<Id, Page<Id>>> {
    if to_read.is_empty() {
        return Ok(HashMap::new());
    }

    to_read.sort_by_key(|info| info.entry.offset);

    let mut buf_size: u64 = 0;
    for info in &mut to_read {
        // Ascending field indices read each page front to back.
        info.fields.sort_unstable();
        for &field_index in &info.fields {
            buf_size += info.entry.field_size(field_index).ok_or_else(|| {
                errlogic!(
                    "field index out of range, page_id={} field_index={field_index} entry={}",
                    info.page_id,
                    info.entry
                )
            })?;
        }
    }

    if buf_size == 0 {
        // Nothing to read means the caller should have elided the call.
        let detail = to_read
            .iter()
            .map(|info| {
                format!(
                    "{{page_id: {}, fields: {:?}, entry: {}}}",
                    info.page_id, info.fields, info.entry
                )
            })
            .join(", ");
        if cfg!(debug_assertions) {
            return Err(errlogic!(
                "field read with zero total size, read_info=[{detail}]"
            ));
        }
        tracing::warn!(read_info = %detail, "field read with zero total size");
        return Ok(to_read
            .into_iter()
            .map(|info| (info.page_id.clone(), Page::empty(info.page_id)))
            .collect());
    }

    let mut buf = vec![0u8; buf_size as usize];
    let mut staged: Vec<(Id, Range<usize>, BTreeMap<usize, usize>)> =
        Vec::with_capacity(to_read.len());
    let mut pos = 0usize;

    for info in &to_read {
        let page_begin = pos;
        let mut offset_in_page = 0usize;
        let mut fields_in_page = BTreeMap::new();

        for &field_index in &info.fields {
            let (field_begin, field_end) =
                info.entry.field_range(field_index).ok_or_else(|| {
                    errlogic!(
                        "field index out of range, page_id={} field_index={field_index}",
                        info.page_id
                    )
                })?;
            let field_len = (field_end - field_begin) as usize;
            let slice_end = pos + field_len;
            let blob_file = read_raw(
                store,
                &info.page_id,
                info.entry.file_id,
                info.entry.offset + field_begin,
                &mut buf[pos..slice_end],
                false,
            )?;

            if CHECKSUM_ON_READ && info.entry.size != 0 {
                let expected = info.entry.field_checksum(field_index).ok_or_else(|| {
                    errlogic!(
                        "field index out of range, page_id={} field_index={field_index}",
                        info.page_id
                    )
                })?;
                let actual = hasher::checksum(&buf[pos..slice_end]);
                if actual != expected {
                    return Err(Error::ChecksumMismatch(format!(
                        "page {} field {field_index} expected={expected:#x} actual={actual:#x} \
                         field_offset={field_begin} field_size={field_len} entry={} file={}",
                        info.page_id,
                        info.entry,
                        blob_file.path().display()
                    )));
                }
            }

            fields_in_page.insert(field_index, offset_in_page);
            offset_in_page += field_len;
            pos = slice_end;
        }

        staged.push((info.page_id.clone(), page_begin..pos, fields_in_page));
    }

    if pos != buf.len() {
        return Err(errlogic!(
            "unexpected field read size, expected={} actual={pos}",
            buf.len()
        ));
    }

    let holder: MemHolder = Arc::new(buf);
    Ok(staged
        .into_iter()
        .map(|(page_id, range, fields)| {
            (
                page_id.clone(),
                Page::new(page_id, holder.clone(), range, fields),
            )
        })
        .collect())
}

/// Positional read with page-level context attached to any failure. Returns
/// the blob file so callers can name its path in their own errors.
pub(crate) fn read_raw<Id: Display>(
    store: &BlobStore,
    page_id: &Id,
    blob_id: BlobId,
    offset: u64,
    buf: &mut [u8],
    background: bool,
) -> Result<Arc<BlobFile>> {
    let blob_file = store.get_blob_file(blob_id)?;
    blob_file
        .read(buf, offset, &*store.read_limiter, background)
        .map_err(|err| {
            add_context(
                err,
                &format!(
                    "while reading page {page_id}, blob_id={blob_id} offset={offset} size={} background={background}",
                    buf.len()
                ),
            )
        })?;
    Ok(blob_file)
}

fn verify_page_checksum<Id: Display>(
    page_id: &Id,
    entry: &PageEntry,
    data: &[u8],
    blob_file: &BlobFile,
) -> Result<()> {
    let actual = hasher::checksum(data);
    if entry.size != 0 && actual != entry.checksum {
        return Err(Error::ChecksumMismatch(format!(
            "page {page_id} expected={:#x} actual={actual:#x} entry={entry} file={}",
            entry.checksum,
            blob_file.path().display()
        )));
    }
    Ok(())
}

/// Field starts of a fully materialized page, keyed by field index.
fn whole_page_fields(entry: &PageEntry) -> BTreeMap<usize, usize> {
    entry
        .field_offsets
        .iter()
        .enumerate()
        .map(|(index, &(offset, _))| (index, offset as usize))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::WriteBatch;
    use crate::config::BlobConfig;
    use crate::edit::EditRecord;
    use crate::tmpfs::TempDir;
    use std::io::Cursor;

    fn open_store(dir: &TempDir) -> BlobStore {
        BlobStore::open_with_config(dir.path(), BlobConfig::default().file_limit_size(4096))
            .unwrap()
    }

    fn put_with_fields(
        store: &BlobStore,
        id: &str,
        payload: Vec<u8>,
        fields: Vec<u64>,
    ) -> PageEntry {
        let mut batch: WriteBatch<String> = WriteBatch::new();
        let size = payload.len() as u64;
        batch.put(id.to_string(), 0, Cursor::new(payload), size, fields);
        let edit = store.write(batch).unwrap();
        match edit.into_records().remove(0) {
            EditRecord::Put { entry, .. } => entry,
            other => panic!("expected put, got {other:?}"),
        }
    }

    #[test]
    fn test_batch_read_shares_buffer() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let e1 = put_with_fields(&store, "a", vec![1; 100], vec![]);
        let e2 = put_with_fields(&store, "b", vec![2; 50], vec![]);
        let e3 = put_with_fields(&store, "c", vec![3; 25], vec![]);

        // Hand the entries over in scrambled order; sorting is internal.
        let pages = store
            .read_pages(vec![
                ("c".to_string(), e3),
                ("a".to_string(), e1),
                ("b".to_string(), e2),
            ])
            .unwrap();

        assert_eq!(pages.len(), 3);
        assert_eq!(pages["a"].data(), &[1; 100][..]);
        assert_eq!(pages["b"].data(), &[2; 50][..]);
        assert_eq!(pages["c"].data(), &[3; 25][..]);
    }

    #[test]
    fn test_whole_page_read_exposes_field_offsets() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut payload = vec![0xAA; 10];
        payload.extend_from_slice(&[0xBB; 6]);
        let entry = put_with_fields(&store, "x", payload, vec![0, 10]);

        let page = store.read_page("x".to_string(), &entry).unwrap();
        assert_eq!(page.field_data(0), Some(&[0xAA; 10][..]));
        assert_eq!(page.field_data(1), Some(&[0xBB; 6][..]));
    }

    #[test]
    fn test_single_field_read() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut payload = vec![0xAA; 10];
        payload.extend_from_slice(&[0xBB; 6]);
        let entry = put_with_fields(&store, "x", payload, vec![0, 10]);

        let pages = store
            .read_fields(vec![FieldReadInfo {
                page_id: "x".to_string(),
                entry,
                fields: vec![1],
            }])
            .unwrap();

        let page = &pages["x"];
        assert_eq!(page.len(), 6);
        assert_eq!(page.field_data(1), Some(&[0xBB; 6][..]));
        assert_eq!(page.field_data(0), None);
    }

    #[test]
    fn test_field_read_any_order_concatenates_by_index() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        // Four fields of different lengths and content.
        let payload: Vec<u8> = (0..4u8).flat_map(|i| vec![i; (i as usize + 1) * 3]).collect();
        let entry = put_with_fields(&store, "p", payload, vec![0, 3, 9, 18]);

        // Request out of order; fields come back sorted by index.
        let pages = store
            .read_fields(vec![FieldReadInfo {
                page_id: "p".to_string(),
                entry,
                fields: vec![3, 0],
            }])
            .unwrap();

        let page = &pages["p"];
        assert_eq!(page.field_data(0), Some(&[0u8; 3][..]));
        assert_eq!(page.field_data(3), Some(&[3u8; 12][..]));
        let expected: Vec<u8> = [vec![0u8; 3], vec![3u8; 12]].concat();
        assert_eq!(page.data(), &expected[..]);
    }

    #[test]
    fn test_field_read_across_pages() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let e1 = put_with_fields(&store, "a", vec![1; 20], vec![0, 10]);
        let e2 = put_with_fields(&store, "b", vec![2; 30], vec![0, 15]);

        let pages = store
            .read_fields(vec![
                FieldReadInfo {
                    page_id: "b".to_string(),
                    entry: e2,
                    fields: vec![0],
                },
                FieldReadInfo {
                    page_id: "a".to_string(),
                    entry: e1,
                    fields: vec![1],
                },
            ])
            .unwrap();

        assert_eq!(pages["a"].field_data(1), Some(&[1; 10][..]));
        assert_eq!(pages["b"].field_data(0), Some(&[2; 15][..]));
    }

    #[test]
    fn test_field_checksum_mismatch_names_field() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut payload = vec![0x11; 8];
        payload.extend_from_slice(&[0x22; 8]);
        let entry = put_with_fields(&store, "f", payload, vec![0, 8]);

        // Corrupt the second field on disk.
        let path = dir
            .path()
            .join(crate::blobfile::blob_file_name(entry.file_id));
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[(entry.offset + 12) as usize] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();
        store.evict_file(entry.file_id).unwrap();

        let err = store
            .read_fields(vec![FieldReadInfo {
                page_id: "f".to_string(),
                entry: entry.clone(),
                fields: vec![1],
            }])
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch(_)));

        // Field 0 is untouched and still readable.
        let pages = store
            .read_fields(vec![FieldReadInfo {
                page_id: "f".to_string(),
                entry,
                fields: vec![0],
            }])
            .unwrap();
        assert_eq!(pages["f"].field_data(0), Some(&[0x11; 8][..]));
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_zero_size_field_read_fails_in_debug() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let entry = PageEntry {
            file_id: 1,
            size: 0,
            field_offsets: vec![(0, 0)],
            ..Default::default()
        };
        let result = store.read_fields(vec![FieldReadInfo {
            page_id: "z".to_string(),
            entry,
            fields: vec![0],
        }]);
        assert!(matches!(result, Err(Error::Logic(_))));
    }

    #[test]
    fn test_empty_inputs() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        assert!(store
            .read_pages(Vec::<(String, PageEntry)>::new())
            .unwrap()
            .is_empty());
        assert!(store
            .read_fields(Vec::<FieldReadInfo<String>>::new())
            .unwrap()
            .is_empty());
    }
}
