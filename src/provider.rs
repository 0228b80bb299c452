//! Filesystem access seam.
//!
//! Everything the store does to a file goes through a `FileProvider`, so a
//! deployment can interpose encryption-at-rest or fault injection without
//! touching the engine. The provider stays narrow: open and unlink; all
//! positional I/O happens on the returned handle.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

pub trait FileProvider: Send + Sync {
    /// Opens `path` for positional read/write, creating it if absent.
    fn open(&self, path: &Path) -> io::Result<File>;

    /// Unlinks `path`.
    fn remove(&self, path: &Path) -> io::Result<()>;
}

/// Plain local-filesystem provider.
pub struct LocalFileProvider;

impl FileProvider for LocalFileProvider {
    fn open(&self, path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }
}
