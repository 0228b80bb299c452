//! Directory edits.
//!
//! Applying a write batch or a GC round produces an ordered list of records
//! for the page directory to apply atomically. This layer never persists
//! edits itself; the directory's write-ahead log owns their durable form.

use crate::entry::{PageEntry, PageId, PageVersion};

#[derive(Debug, Clone, PartialEq)]
pub enum EditRecord<Id: PageId> {
    /// A page was written; the directory should map `page_id` to `entry`.
    Put { page_id: Id, entry: PageEntry },
    /// A zero-length external marker.
    PutExternal { page_id: Id },
    /// A local write that replaces a remote entry for the same page.
    UpdateRemote { page_id: Id, entry: PageEntry },
    /// Logical deletion.
    Del { page_id: Id },
    /// Alias `page_id` to `origin`'s entry.
    Ref { page_id: Id, origin: Id },
    /// GC migrated a live entry; replaces the entry at exactly `version`.
    Upsert {
        page_id: Id,
        version: PageVersion,
        entry: PageEntry,
    },
}

/// Ordered result of applying a write batch or GC round at this layer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntriesEdit<Id: PageId> {
    records: Vec<EditRecord<Id>>,
}

impl<Id: PageId> EntriesEdit<Id> {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn put(&mut self, page_id: Id, entry: PageEntry) {
        self.records.push(EditRecord::Put { page_id, entry });
    }

    pub fn put_external(&mut self, page_id: Id) {
        self.records.push(EditRecord::PutExternal { page_id });
    }

    pub fn update_remote(&mut self, page_id: Id, entry: PageEntry) {
        self.records.push(EditRecord::UpdateRemote { page_id, entry });
    }

    pub fn del(&mut self, page_id: Id) {
        self.records.push(EditRecord::Del { page_id });
    }

    pub fn reference(&mut self, page_id: Id, origin: Id) {
        self.records.push(EditRecord::Ref { page_id, origin });
    }

    pub fn upsert(&mut self, page_id: Id, version: PageVersion, entry: PageEntry) {
        self.records.push(EditRecord::Upsert {
            page_id,
            version,
            entry,
        });
    }

    pub fn records(&self) -> &[EditRecord<Id>] {
        &self.records
    }

    pub fn into_records(self) -> Vec<EditRecord<Id>> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
