//! Blob container files.
//!
//! A blob file is a raw concatenation of payload regions named
//! `blobfile_<id>`: no framing, no header, no internal index. Integrity
//! lives entirely in the entry-level checksums the directory keeps. Writes
//! to a blob are serialized region-by-region by the owning stat's allocator;
//! reads are concurrent positional reads.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::entry::BlobId;
use crate::error::Result;
use crate::limiter::RateLimiter;
use crate::paths::PathDelegator;
use crate::provider::FileProvider;

pub(crate) const BLOB_FILE_PREFIX: &str = "blobfile_";

pub(crate) fn blob_file_name(blob_id: BlobId) -> String {
    format!("{BLOB_FILE_PREFIX}{blob_id}")
}

/// Parses `blobfile_<decimal-id>` names found while scanning a root.
pub(crate) fn parse_blob_file_name(name: &str) -> Option<BlobId> {
    let digits = name.strip_prefix(BLOB_FILE_PREFIX)?;
    if digits.is_empty() || digits.starts_with('0') {
        return None;
    }
    digits.parse().ok()
}

pub(crate) struct BlobFile {
    blob_id: BlobId,
    path: PathBuf,
    file: File,
    /// Bytes the file extends to on disk, kept for usage accounting.
    size: AtomicU64,
    provider: Arc<dyn FileProvider>,
    delegator: Arc<dyn PathDelegator>,
}

impl BlobFile {
    pub(crate) fn open(
        blob_id: BlobId,
        parent: &Path,
        provider: Arc<dyn FileProvider>,
        delegator: Arc<dyn PathDelegator>,
    ) -> Result<Self> {
        let path = parent.join(blob_file_name(blob_id));
        let file = provider.open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            blob_id,
            path,
            file,
            size: AtomicU64::new(size),
            provider,
            delegator,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Writes all of `buf` at `offset`, growing the file as needed. There is
    /// no partial-success signaling; on error the caller must assume the
    /// region is corrupt and release it.
    pub(crate) fn write(
        &self,
        buf: &[u8],
        offset: u64,
        limiter: &dyn RateLimiter,
        background: bool,
    ) -> Result<()> {
        limiter.request(buf.len(), background);
        write_all_at(&self.file, buf, offset)?;
        self.file.sync_data()?;

        let end = offset + buf.len() as u64;
        let prev = self.size.fetch_max(end, Ordering::SeqCst);
        if end > prev {
            self.delegator
                .add_used_size(self.blob_id, end - prev, parent_of(&self.path));
        }
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes at `offset`. `background` lets the
    /// limiter deprioritize GC traffic.
    pub(crate) fn read(
        &self,
        buf: &mut [u8],
        offset: u64,
        limiter: &dyn RateLimiter,
        background: bool,
    ) -> Result<()> {
        limiter.request(buf.len(), background);
        read_exact_at(&self.file, buf, offset)?;
        Ok(())
    }

    /// Shrinks the file to `new_size`. The caller guarantees no live payload
    /// sits at or beyond it.
    pub(crate) fn truncate(&self, new_size: u64) -> Result<()> {
        self.file.set_len(new_size)?;
        let prev = self.size.swap(new_size, Ordering::SeqCst);
        if prev > new_size {
            self.delegator.free_used_size(self.blob_id, prev - new_size);
        }
        Ok(())
    }

    /// Unlinks the file. Readers holding a clone of this handle keep a valid
    /// descriptor until they drop it.
    pub(crate) fn remove(&self) -> Result<()> {
        self.provider.remove(&self.path)?;
        let prev = self.size.swap(0, Ordering::SeqCst);
        if prev > 0 {
            self.delegator.free_used_size(self.blob_id, prev);
        }
        Ok(())
    }
}

fn parent_of(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new(""))
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let written = file.seek_write(buf, offset)?;
        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "failed to write whole buffer",
            ));
        }
        buf = &buf[written..];
        offset += written as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let read = file.seek_read(buf, offset)?;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "failed to fill whole buffer",
            ));
        }
        let rest = buf;
        buf = &mut rest[read..];
        offset += read as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::NoLimit;
    use crate::paths::FixedPathDelegator;
    use crate::provider::LocalFileProvider;
    use crate::tmpfs::TempDir;

    fn open_blob(dir: &TempDir, blob_id: BlobId) -> (BlobFile, Arc<FixedPathDelegator>) {
        let delegator = Arc::new(FixedPathDelegator::single(dir.path()));
        let file = BlobFile::open(
            blob_id,
            dir.path(),
            Arc::new(LocalFileProvider),
            delegator.clone(),
        )
        .unwrap();
        (file, delegator)
    }

    #[test]
    fn test_name_parsing() {
        assert_eq!(parse_blob_file_name("blobfile_1"), Some(1));
        assert_eq!(parse_blob_file_name("blobfile_1024"), Some(1024));
        assert_eq!(parse_blob_file_name("blobfile_"), None);
        assert_eq!(parse_blob_file_name("blobfile_0"), None);
        assert_eq!(parse_blob_file_name("blobfile_01"), None);
        assert_eq!(parse_blob_file_name("emberstore.lock"), None);
        assert_eq!(parse_blob_file_name("blobfile_x7"), None);
        assert_eq!(blob_file_name(7), "blobfile_7");
    }

    #[test]
    fn test_positional_write_and_read() {
        let dir = TempDir::new().unwrap();
        let (blob, _) = open_blob(&dir, 1);

        blob.write(b"hello", 0, &NoLimit, false).unwrap();
        blob.write(b"world", 100, &NoLimit, false).unwrap();

        let mut buf = [0u8; 5];
        blob.read(&mut buf, 100, &NoLimit, false).unwrap();
        assert_eq!(&buf, b"world");
        blob.read(&mut buf, 0, &NoLimit, false).unwrap();
        assert_eq!(&buf, b"hello");

        // The hole between regions reads as zeros.
        let mut hole = [0xFFu8; 4];
        blob.read(&mut hole, 50, &NoLimit, false).unwrap();
        assert_eq!(hole, [0, 0, 0, 0]);
    }

    #[test]
    fn test_short_read_is_io_error() {
        let dir = TempDir::new().unwrap();
        let (blob, _) = open_blob(&dir, 1);
        blob.write(b"abc", 0, &NoLimit, false).unwrap();

        let mut buf = [0u8; 8];
        assert!(blob.read(&mut buf, 0, &NoLimit, false).is_err());
    }

    #[test]
    fn test_truncate_shrinks_file() {
        let dir = TempDir::new().unwrap();
        let (blob, _) = open_blob(&dir, 1);
        blob.write(&[7u8; 256], 0, &NoLimit, false).unwrap();

        blob.truncate(100).unwrap();
        let on_disk = std::fs::metadata(blob.path()).unwrap().len();
        assert_eq!(on_disk, 100);
    }

    #[test]
    fn test_remove_unlinks() {
        let dir = TempDir::new().unwrap();
        let (blob, _) = open_blob(&dir, 3);
        blob.write(b"x", 0, &NoLimit, false).unwrap();

        let path = blob.path().to_path_buf();
        assert!(path.exists());
        blob.remove().unwrap();
        assert!(!path.exists());
    }
}
