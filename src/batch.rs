//! Write batches.
//!
//! A batch is an ordered sequence of page operations applied together by
//! [`crate::store::BlobStore::write`]. Payload bytes are pulled from a
//! readable source while the batch is applied, so callers can hand over
//! buffers, files, or any other `Read` without an extra copy here.

use std::io::Read;

use crate::entry::{PageId, RemoteLocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Put,
    PutExternal,
    PutRemote,
    UpdateFromRemote,
    Del,
    Ref,
}

pub(crate) struct WriteOp<Id: PageId> {
    pub(crate) kind: WriteKind,
    pub(crate) page_id: Id,
    pub(crate) tag: u64,
    pub(crate) size: u64,
    pub(crate) payload: Option<Box<dyn Read + Send>>,
    /// `(field_start, field_crc64)` pairs. Puts arrive with zeroed checksums
    /// that the write path fills in; remote puts arrive with both halves.
    pub(crate) field_offsets: Vec<(u64, u64)>,
    pub(crate) origin: Option<Id>,
    pub(crate) location: Option<RemoteLocation>,
}

/// Ordered sequence of put/del/ref operations, applied in one store call.
pub struct WriteBatch<Id: PageId> {
    pub(crate) writes: Vec<WriteOp<Id>>,
    total_data_size: u64,
}

impl<Id: PageId> WriteBatch<Id> {
    pub fn new() -> Self {
        Self {
            writes: Vec::new(),
            total_data_size: 0,
        }
    }

    /// Stores `size` bytes read from `payload`. `field_offsets` are ascending
    /// field starts; the first must be 0 when any are given.
    pub fn put(
        &mut self,
        page_id: Id,
        tag: u64,
        payload: impl Read + Send + 'static,
        size: u64,
        field_offsets: Vec<u64>,
    ) {
        self.push_data_write(WriteKind::Put, page_id, tag, payload, size, field_offsets);
    }

    /// A local put that semantically replaces a remote entry for `page_id`.
    pub fn update_from_remote(
        &mut self,
        page_id: Id,
        tag: u64,
        payload: impl Read + Send + 'static,
        size: u64,
        field_offsets: Vec<u64>,
    ) {
        self.push_data_write(
            WriteKind::UpdateFromRemote,
            page_id,
            tag,
            payload,
            size,
            field_offsets,
        );
    }

    /// Zero-length marker for a page whose payload lives outside any blob.
    pub fn put_external(&mut self, page_id: Id) {
        self.writes.push(WriteOp {
            kind: WriteKind::PutExternal,
            page_id,
            tag: 0,
            size: 0,
            payload: None,
            field_offsets: Vec::new(),
            origin: None,
            location: None,
        });
    }

    /// Entry-only put describing a payload stored remotely. `field_offsets`
    /// carry checksums computed when the remote copy was produced.
    pub fn put_remote(
        &mut self,
        page_id: Id,
        tag: u64,
        location: RemoteLocation,
        field_offsets: Vec<(u64, u64)>,
    ) {
        self.writes.push(WriteOp {
            kind: WriteKind::PutRemote,
            page_id,
            tag,
            size: 0,
            payload: None,
            field_offsets,
            origin: None,
            location: Some(location),
        });
    }

    pub fn del(&mut self, page_id: Id) {
        self.writes.push(WriteOp {
            kind: WriteKind::Del,
            page_id,
            tag: 0,
            size: 0,
            payload: None,
            field_offsets: Vec::new(),
            origin: None,
            location: None,
        });
    }

    /// Aliases `page_id` to `origin`'s entry.
    pub fn reference(&mut self, page_id: Id, origin: Id) {
        self.writes.push(WriteOp {
            kind: WriteKind::Ref,
            page_id,
            tag: 0,
            size: 0,
            payload: None,
            field_offsets: Vec::new(),
            origin: Some(origin),
            location: None,
        });
    }

    /// Sum of payload bytes across puts in this batch.
    pub fn total_data_size(&self) -> u64 {
        self.total_data_size
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub(crate) fn put_count(&self) -> usize {
        self.writes
            .iter()
            .filter(|w| matches!(w.kind, WriteKind::Put | WriteKind::UpdateFromRemote))
            .count()
    }

    fn push_data_write(
        &mut self,
        kind: WriteKind,
        page_id: Id,
        tag: u64,
        payload: impl Read + Send + 'static,
        size: u64,
        field_offsets: Vec<u64>,
    ) {
        debug_assert!(
            field_offsets.is_empty() || field_offsets[0] == 0,
            "first field must start at offset 0"
        );
        debug_assert!(
            field_offsets.windows(2).all(|w| w[0] < w[1]),
            "field offsets must be strictly ascending"
        );
        self.total_data_size += size;
        self.writes.push(WriteOp {
            kind,
            page_id,
            tag,
            size,
            payload: Some(Box::new(payload)),
            field_offsets: field_offsets.into_iter().map(|off| (off, 0)).collect(),
            origin: None,
            location: None,
        });
    }
}

impl<Id: PageId> Default for WriteBatch<Id> {
    fn default() -> Self {
        Self::new()
    }
}
