//! Crate-level error type.  The mmap layer reports raw errno values;
//! everything above folds them into this enum.
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The caller passed something we cannot act on (misaligned
    /// address, zero capacity, write on a read-only datastore, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A system call failed.  `errno` is the raw OS error.
    #[error("{context}: errno={errno}")]
    Os { context: &'static str, errno: i32 },

    /// A file operation failed.
    #[error("{context} ({path:?})")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The on-disk state cannot be trusted: missing properly-closed
    /// mark, version mismatch, or a corrupt serialized directory.
    #[error("inconsistent datastore: {0}")]
    Inconsistent(String),

    /// The segment cannot grow any further, or no chunk run can
    /// satisfy the request.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(&'static str),
}

impl Error {
    pub(crate) fn os(context: &'static str, errno: i32) -> Self {
        Error::Os { context, errno }
    }

    pub(crate) fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            context,
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
