use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Emberstore errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// An internal invariant was violated (double release, unknown batch op,
    /// inconsistent accounting). Data integrity is in doubt; the enclosing
    /// process should abort or restart rather than continue.
    Logic(String),
    /// A filesystem failure during read/write/truncate/remove. The caller may
    /// retry the whole operation.
    Io(String),
    /// CRC64 verification failed while reading a page or a page field.
    ChecksumMismatch(String),
    /// No blob had room for an allocation and a new one could not be created.
    AllocationFailed(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Logic(msg) => write!(f, "logic error: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::ChecksumMismatch(msg) => write!(f, "checksum mismatch: {msg}"),
            Error::AllocationFailed(msg) => write!(f, "allocation failed: {msg}"),
        }
    }
}

/// Constructs an Error::Logic for the given format string.
#[macro_export]
macro_rules! errlogic {
    ($($args:tt)*) => { $crate::error::Error::Logic(format!($($args)*)) };
}

/// An emberstore Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

// A poisoned lock means a writer panicked mid-update; treat the state as
// corrupt rather than limping on.
impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Logic(format!("lock poisoned: {err}"))
    }
}
