//! Durable page descriptors.
//!
//! An entry records where a page physically lives: which blob file, at what
//! offset, how many bytes, plus its CRC64 and optional per-field CRC64s. The
//! caller's page directory owns the persistent form of entries; this crate
//! only produces and consumes them.

use std::fmt;
use std::hash::Hash;

/// Stable positive integer naming a blob file. `0` is reserved invalid.
pub type BlobId = u64;

pub const INVALID_BLOB_ID: BlobId = 0;

/// Capability bounds for external page identifiers. Identifiers only need to
/// be usable as map keys and printable in diagnostics, so both integer-keyed
/// (`u128`) and string-keyed directories share one code path.
pub trait PageId:
    Clone + fmt::Debug + fmt::Display + Eq + Hash + Send + Sync + 'static
{
}

impl<T> PageId for T where
    T: Clone + fmt::Debug + fmt::Display + Eq + Hash + Send + Sync + 'static
{
}

/// Directory-assigned version of a page entry, carried through GC upserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PageVersion {
    pub sequence: u64,
    pub epoch: u64,
}

impl PageVersion {
    pub fn new(sequence: u64, epoch: u64) -> Self {
        Self { sequence, epoch }
    }
}

/// Location of a payload that lives outside this store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLocation {
    pub data_file: String,
    pub offset: u64,
    pub size: u64,
}

/// Physical descriptor of one page.
///
/// `field_offsets` holds `(field_start, field_crc64)` pairs in ascending
/// start order; the last field runs to `size`. An entry with
/// `file_id == INVALID_BLOB_ID` describes a remote payload and carries a
/// [`RemoteLocation`] instead of local bytes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageEntry {
    pub file_id: BlobId,
    pub offset: u64,
    pub size: u64,
    pub padded_size: u64,
    pub tag: u64,
    pub checksum: u64,
    pub field_offsets: Vec<(u64, u64)>,
    pub remote_location: Option<RemoteLocation>,
}

impl PageEntry {
    /// Whether the entry points at local bytes in a blob file.
    pub fn is_valid(&self) -> bool {
        self.file_id != INVALID_BLOB_ID
    }

    /// Bytes the entry occupies in its blob file, alignment padding included.
    pub fn total_size(&self) -> u64 {
        self.size + self.padded_size
    }

    /// Half-open byte range of field `index` within the page, or `None` when
    /// the index is out of bounds.
    pub fn field_range(&self, index: usize) -> Option<(u64, u64)> {
        let (begin, _) = *self.field_offsets.get(index)?;
        let end = match self.field_offsets.get(index + 1) {
            Some(&(next_begin, _)) => next_begin,
            None => self.size,
        };
        Some((begin, end))
    }

    pub fn field_size(&self, index: usize) -> Option<u64> {
        self.field_range(index).map(|(begin, end)| end - begin)
    }

    pub fn field_checksum(&self, index: usize) -> Option<u64> {
        self.field_offsets.get(index).map(|&(_, checksum)| checksum)
    }
}

impl fmt::Display for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{file_id={} offset={} size={} padded_size={} tag={} checksum={:#x} fields={}}}",
            self.file_id,
            self.offset,
            self.size,
            self.padded_size,
            self.tag,
            self.checksum,
            self.field_offsets.len()
        )
    }
}
