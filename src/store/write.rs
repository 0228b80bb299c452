//! Batch write paths.
//!
//! A batch whose payloads fit `file_limit_size` is staged into one heap
//! buffer, checksummed in a single pass and written with one positional
//! write into one allocated region. Larger batches are split: every put gets
//! its own allocation and write, which keeps memory flat at the cost of more
//! syscalls. Alignment padding only exists on the single-allocation path.

use std::io::Read;

use crate::batch::{WriteBatch, WriteKind, WriteOp};
use crate::edit::EntriesEdit;
use crate::entry::{BlobId, PageEntry, PageId, INVALID_BLOB_ID};
use crate::errlogic;
use crate::error::{Error, Result};
use crate::hasher;
use crate::store::BlobStore;

pub(crate) fn write_batch<Id: PageId>(
    store: &BlobStore,
    batch: WriteBatch<Id>,
) -> Result<EntriesEdit<Id>> {
    let total = batch.total_data_size();
    tracing::trace!(
        puts = batch.put_count(),
        ops = batch.len(),
        total_data_size = total,
        "applying write batch"
    );

    // Batches without payload bytes never touch a blob file.
    if total == 0 {
        let mut edit = EntriesEdit::new();
        for mut write in batch.writes {
            match write.kind {
                WriteKind::Put | WriteKind::UpdateFromRemote => {
                    return Err(errlogic!(
                        "write batch has total size 0 but contains a data write, page={}",
                        write.page_id
                    ));
                }
                WriteKind::PutRemote => {
                    let entry = remote_entry(&mut write)?;
                    edit.put(write.page_id, entry);
                }
                WriteKind::Del => edit.del(write.page_id),
                WriteKind::Ref => {
                    let origin = ref_origin(&mut write)?;
                    edit.reference(write.page_id, origin);
                }
                WriteKind::PutExternal => edit.put_external(write.page_id),
            }
        }
        return Ok(edit);
    }

    let config = store.config()?;
    if total > config.file_limit_size {
        return handle_large_write(store, batch);
    }

    // Round the allocation up to the block alignment; the slack rides along
    // as the last put's padded_size so removal releases it too.
    let replenish = match config.block_alignment_bytes {
        0 => 0,
        align if total % align == 0 => 0,
        align => align - total % align,
    };
    let alloc_size = total + replenish;

    let (blob_id, offset_in_file) = store.get_pos_from_stats(alloc_size)?;
    match build_and_write_small(store, batch, blob_id, offset_in_file, total, replenish) {
        Ok(edit) => Ok(edit),
        Err(err) => {
            tracing::error!(
                blob_id,
                offset_in_file,
                size = total,
                alloc_size,
                error = %err,
                "write batch failed"
            );
            if let Err(release_err) =
                store.remove_pos_from_stats(blob_id, offset_in_file, alloc_size)
            {
                tracing::error!(blob_id, error = %release_err, "failed to release span of failed write");
            }
            Err(err)
        }
    }
}

/// Single-allocation path: stage every payload into one buffer, then write it
/// with one call. Any failure makes the caller release the whole region.
fn build_and_write_small<Id: PageId>(
    store: &BlobStore,
    batch: WriteBatch<Id>,
    blob_id: BlobId,
    offset_in_file: u64,
    total: u64,
    replenish: u64,
) -> Result<EntriesEdit<Id>> {
    let mut edit = EntriesEdit::new();
    let mut buffer = vec![0u8; total as usize];
    let mut offset_in_allocated: u64 = 0;

    let last_data_idx = batch
        .writes
        .iter()
        .rposition(|w| matches!(w.kind, WriteKind::Put | WriteKind::UpdateFromRemote));

    for (idx, mut write) in batch.writes.into_iter().enumerate() {
        match write.kind {
            WriteKind::Put | WriteKind::UpdateFromRemote => {
                let begin = offset_in_allocated as usize;
                let slice = &mut buffer[begin..begin + write.size as usize];
                read_payload(&mut write, slice)?;

                let mut entry = PageEntry {
                    file_id: blob_id,
                    offset: offset_in_file + offset_in_allocated,
                    size: write.size,
                    padded_size: if Some(idx) == last_data_idx {
                        replenish
                    } else {
                        0
                    },
                    tag: write.tag,
                    checksum: hasher::checksum(slice),
                    field_offsets: Vec::new(),
                    remote_location: None,
                };
                offset_in_allocated += write.size;

                fill_field_checksums(&mut write.field_offsets, slice)?;
                entry.field_offsets = std::mem::take(&mut write.field_offsets);

                if write.kind == WriteKind::Put {
                    edit.put(write.page_id, entry);
                } else {
                    edit.update_remote(write.page_id, entry);
                }
            }
            WriteKind::PutRemote => {
                let entry = remote_entry(&mut write)?;
                edit.put(write.page_id, entry);
            }
            WriteKind::Del => edit.del(write.page_id),
            WriteKind::Ref => {
                let origin = ref_origin(&mut write)?;
                edit.reference(write.page_id, origin);
            }
            WriteKind::PutExternal => edit.put_external(write.page_id),
        }
    }

    if offset_in_allocated != total {
        return Err(errlogic!(
            "write batch total size does not match its writes, expected={total} actual={offset_in_allocated}"
        ));
    }

    let blob_file = store.get_blob_file(blob_id)?;
    blob_file.write(&buffer, offset_in_file, &*store.write_limiter, false)?;
    Ok(edit)
}

/// Split path for oversized batches: one allocation and one write per put,
/// no shared buffer, no padding. An earlier put that already hit disk stays
/// durable even when a later one fails; its space drains through removal.
fn handle_large_write<Id: PageId>(
    store: &BlobStore,
    batch: WriteBatch<Id>,
) -> Result<EntriesEdit<Id>> {
    let mut edit = EntriesEdit::new();
    for mut write in batch.writes {
        match write.kind {
            WriteKind::Put | WriteKind::UpdateFromRemote => {
                if write.size == 0 {
                    return Err(errlogic!(
                        "zero-size data write in split batch, page={}",
                        write.page_id
                    ));
                }
                let (blob_id, offset_in_file) = store.get_pos_from_stats(write.size)?;
                let entry = match write_single_put(store, &mut write, blob_id, offset_in_file) {
                    Ok(entry) => entry,
                    Err(err) => {
                        tracing::error!(
                            blob_id,
                            offset_in_file,
                            size = write.size,
                            error = %err,
                            "split batch write failed"
                        );
                        if let Err(release_err) =
                            store.remove_pos_from_stats(blob_id, offset_in_file, write.size)
                        {
                            tracing::error!(blob_id, error = %release_err, "failed to release span of failed write");
                        }
                        return Err(err);
                    }
                };
                if write.kind == WriteKind::Put {
                    edit.put(write.page_id, entry);
                } else {
                    edit.update_remote(write.page_id, entry);
                }
            }
            WriteKind::PutRemote => {
                let entry = remote_entry(&mut write)?;
                edit.put(write.page_id, entry);
            }
            WriteKind::Del => edit.del(write.page_id),
            WriteKind::Ref => {
                let origin = ref_origin(&mut write)?;
                edit.reference(write.page_id, origin);
            }
            WriteKind::PutExternal => edit.put_external(write.page_id),
        }
    }
    Ok(edit)
}

fn write_single_put<Id: PageId>(
    store: &BlobStore,
    write: &mut WriteOp<Id>,
    blob_id: BlobId,
    offset_in_file: u64,
) -> Result<PageEntry> {
    let mut buffer = vec![0u8; write.size as usize];
    read_payload(write, &mut buffer)?;

    let mut entry = PageEntry {
        file_id: blob_id,
        offset: offset_in_file,
        size: write.size,
        padded_size: 0,
        tag: write.tag,
        checksum: hasher::checksum(&buffer),
        field_offsets: Vec::new(),
        remote_location: None,
    };
    fill_field_checksums(&mut write.field_offsets, &buffer)?;
    entry.field_offsets = std::mem::take(&mut write.field_offsets);

    let blob_file = store.get_blob_file(blob_id)?;
    blob_file.write(&buffer, offset_in_file, &*store.write_limiter, false)?;
    Ok(entry)
}

fn read_payload<Id: PageId>(write: &mut WriteOp<Id>, buf: &mut [u8]) -> Result<()> {
    let payload = write
        .payload
        .as_mut()
        .ok_or_else(|| errlogic!("data write without payload source, page={}", write.page_id))?;
    payload.read_exact(buf).map_err(|err| {
        Error::Io(format!(
            "{err} (while buffering payload of page {})",
            write.page_id
        ))
    })
}

/// Computes per-field CRC64s in place. `fields[i]` covers
/// `[start_i, start_{i+1})`, the last field running to the payload end.
fn fill_field_checksums(fields: &mut [(u64, u64)], payload: &[u8]) -> Result<()> {
    let size = payload.len() as u64;
    for i in 0..fields.len() {
        let begin = fields[i].0;
        let end = if i + 1 < fields.len() {
            fields[i + 1].0
        } else {
            size
        };
        if begin > end || end > size {
            return Err(errlogic!(
                "field offsets out of payload bounds, begin={begin} end={end} size={size}"
            ));
        }
        fields[i].1 = hasher::checksum(&payload[begin as usize..end as usize]);
    }
    Ok(())
}

fn remote_entry<Id: PageId>(write: &mut WriteOp<Id>) -> Result<PageEntry> {
    let location = write
        .location
        .take()
        .ok_or_else(|| errlogic!("remote put without location, page={}", write.page_id))?;
    Ok(PageEntry {
        file_id: INVALID_BLOB_ID,
        tag: write.tag,
        field_offsets: std::mem::take(&mut write.field_offsets),
        remote_location: Some(location),
        ..Default::default()
    })
}

fn ref_origin<Id: PageId>(write: &mut WriteOp<Id>) -> Result<Id> {
    write
        .origin
        .take()
        .ok_or_else(|| errlogic!("ref without origin page, page={}", write.page_id))
}
