use std::fmt::Display;
use std::io;
use std::path::PathBuf;
use std::sync::PoisonError;

/// Index errors. Each failure kind callers can react to is a distinct variant.
#[derive(Debug)]
pub enum Error {
    /// The operation targeted a handle whose underlying engine has been closed.
    Closed,
    /// A mutating operation was attempted on a read-only handle.
    ReadOnly,
    /// The looked-up key is not present. This is the normal negative result
    /// of `find`, not a fault.
    NotFound,
    /// The encoded key length did not match `Key::ENCODED_SIZE`.
    InvalidKeySize { expected: usize, found: usize },
    /// The encoded value length did not match `Value::ENCODED_SIZE`.
    InvalidValueSize { expected: usize, found: usize },
    /// Another writer holds the advisory lock on this root.
    Locked(PathBuf),
    /// An I/O error from the backend, propagated unchanged.
    Io(io::Error),
    /// On-disk data failed validation: bad magic, bad checksum, truncated
    /// header, or an undecodable entry.
    Corruption(String),
    /// An internal contract was broken (e.g. the log file shrank under a
    /// read-only observer). Fatal; the instance should be closed.
    InvariantViolation(String),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Closed => write!(f, "operation on a closed index"),
            Error::ReadOnly => write!(f, "write attempted on a read-only index"),
            Error::NotFound => write!(f, "key not found"),
            Error::InvalidKeySize { expected, found } => {
                write!(f, "invalid key size: expected {expected} bytes, got {found}")
            }
            Error::InvalidValueSize { expected, found } => {
                write!(f, "invalid value size: expected {expected} bytes, got {found}")
            }
            Error::Locked(path) => write!(f, "index is locked by another writer: {}", path.display()),
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Corruption(msg) => write!(f, "corrupted data: {msg}"),
            Error::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
        }
    }
}

/// Constructs an `Error::Corruption` from a format string.
#[macro_export]
macro_rules! corruption {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)) };
}

/// A tephra Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(err: PoisonError<T>) -> Self {
        Error::InvariantViolation(err.to_string())
    }
}
