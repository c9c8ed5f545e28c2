//! Error taxonomy and backend result-code translation
//!
//! Every failing driver call reports an [`ErrorKind`], which maps onto a
//! POSIX errno. Backends report failures as [`RemoteCode`]s; [`translate`]
//! turns those into kinds.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Largest errno value accepted from a backend mapping (Linux `EHWPOISON`).
pub const MAX_ERRNO: i32 = 133;

/// POSIX-style error kinds surfaced by the driver
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[error("no such file or directory")]
    NotFound,

    #[error("operation not permitted")]
    PermissionDenied,

    #[error("permission denied")]
    AccessDenied,

    #[error("is a directory")]
    IsADirectory,

    #[error("not a directory")]
    NotADirectory,

    #[error("file exists")]
    AlreadyExists,

    #[error("directory not empty")]
    DirectoryNotEmpty,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("could not connect to host")]
    ConnectFailed,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("broken pipe")]
    BrokenPipe,

    #[error("resource temporarily unavailable")]
    TryAgain,

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("credentials or protocol environment unavailable")]
    ConfigError,

    #[error("input/output error")]
    IoError,
}

impl ErrorKind {
    /// Map to libc errno
    pub fn to_errno(self) -> i32 {
        match self {
            ErrorKind::NotFound => libc::ENOENT,
            ErrorKind::PermissionDenied => libc::EPERM,
            ErrorKind::AccessDenied => libc::EACCES,
            ErrorKind::IsADirectory => libc::EISDIR,
            ErrorKind::NotADirectory => libc::ENOTDIR,
            ErrorKind::AlreadyExists => libc::EEXIST,
            ErrorKind::DirectoryNotEmpty => libc::ENOTEMPTY,
            ErrorKind::InvalidArgument => libc::EINVAL,
            ErrorKind::ConnectionReset => libc::ECONNRESET,
            ErrorKind::ConnectFailed => libc::ECONNREFUSED,
            ErrorKind::ConnectionRefused => libc::ECONNREFUSED,
            ErrorKind::BrokenPipe => libc::EPIPE,
            ErrorKind::TryAgain => libc::EAGAIN,
            ErrorKind::Timeout => libc::ETIMEDOUT,
            ErrorKind::Cancelled => libc::ECANCELED,
            ErrorKind::ConfigError => libc::EACCES,
            ErrorKind::IoError => libc::EIO,
        }
    }

    /// Classify a libc errno. Unknown values become `IoError`.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOENT => ErrorKind::NotFound,
            libc::EPERM => ErrorKind::PermissionDenied,
            libc::EACCES => ErrorKind::AccessDenied,
            libc::EISDIR => ErrorKind::IsADirectory,
            libc::ENOTDIR => ErrorKind::NotADirectory,
            libc::EEXIST => ErrorKind::AlreadyExists,
            libc::ENOTEMPTY => ErrorKind::DirectoryNotEmpty,
            libc::EINVAL => ErrorKind::InvalidArgument,
            libc::ECONNRESET => ErrorKind::ConnectionReset,
            // Some backends report a connection closed during connect as "in progress".
            libc::ECONNREFUSED | libc::EINPROGRESS | libc::EHOSTUNREACH | libc::ENETUNREACH => {
                ErrorKind::ConnectFailed
            }
            libc::EPIPE => ErrorKind::BrokenPipe,
            e if e == libc::EAGAIN || e == libc::EWOULDBLOCK => ErrorKind::TryAgain,
            libc::ETIMEDOUT => ErrorKind::Timeout,
            libc::ECANCELED => ErrorKind::Cancelled,
            _ => ErrorKind::IoError,
        }
    }

    /// The connection carrying the failed request must be discarded
    pub fn requires_reconnect(self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectionReset | ErrorKind::ConnectFailed | ErrorKind::BrokenPipe
        )
    }

    /// Errors that describe the request itself rather than the transport.
    pub fn is_semantic(self) -> bool {
        matches!(
            self,
            ErrorKind::NotFound
                | ErrorKind::PermissionDenied
                | ErrorKind::AccessDenied
                | ErrorKind::IsADirectory
                | ErrorKind::NotADirectory
        )
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => ErrorKind::from_errno(errno),
            None => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                std::io::ErrorKind::PermissionDenied => ErrorKind::AccessDenied,
                std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
                std::io::ErrorKind::InvalidInput => ErrorKind::InvalidArgument,
                std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
                std::io::ErrorKind::WouldBlock => ErrorKind::TryAgain,
                std::io::ErrorKind::BrokenPipe => ErrorKind::BrokenPipe,
                std::io::ErrorKind::ConnectionReset => ErrorKind::ConnectionReset,
                std::io::ErrorKind::ConnectionRefused => ErrorKind::ConnectFailed,
                _ => ErrorKind::IoError,
            },
        }
    }
}

/// Result code reported by a storage backend
///
/// Negative values are failures. Unix-originated failures are encoded as
/// `-(UNIX_ERROR_BASE + errno)`, so the errno sits in the low three digits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteCode(pub i32);

impl RemoteCode {
    /// Base offset for codes that wrap a Unix errno
    pub const UNIX_ERROR_BASE: i32 = 510_000;

    /// Catalog query matched nothing. Also how directories answer an open.
    pub const NO_ROWS_FOUND: RemoteCode = RemoteCode(-808_000);

    /// Login rejected by the server
    pub const AUTH_FAILED: RemoteCode = RemoteCode(-826_000);

    /// Wrap a Unix errno
    pub const fn from_errno(errno: i32) -> Self {
        RemoteCode(-(Self::UNIX_ERROR_BASE + errno))
    }

    /// Encode an error kind as the Unix code a backend would report
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self::from_errno(kind.to_errno())
    }

    /// Default code→errno mapping: the low three digits of a negative code
    pub fn unix_errno(self) -> i32 {
        if self.0 < 0 {
            ((-(self.0 as i64)) % 1000) as i32
        } else {
            0
        }
    }

    pub fn is_no_rows(self) -> bool {
        self == Self::NO_ROWS_FOUND
    }
}

impl fmt::Display for RemoteCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Translate a backend code with the default errno mapping
pub fn translate(code: RemoteCode) -> ErrorKind {
    translate_with(code, RemoteCode::unix_errno)
}

/// Translate a backend code using the backend's own errno mapping.
///
/// "No rows found" is `NotFound`. A mapped errno outside `1..=MAX_ERRNO`
/// means the backend produced a code with no Unix meaning; that becomes
/// `IoError` and is logged.
pub fn translate_with<F>(code: RemoteCode, errno_of: F) -> ErrorKind
where
    F: FnOnce(RemoteCode) -> i32,
{
    if code.is_no_rows() {
        return ErrorKind::NotFound;
    }

    let errno = errno_of(code);
    if !(1..=MAX_ERRNO).contains(&errno) {
        warn!("backend returned unexpected error code {}", code);
        return ErrorKind::IoError;
    }

    ErrorKind::from_errno(errno)
}

/// Wire-level errors of the reference store protocol
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("path rejected: {0}")]
    PathRejected(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("protocol version mismatch (expected {expected}, got {actual})")]
    VersionMismatch { expected: u32, actual: u32 },
}

impl From<bincode::Error> for ProtocolError {
    fn from(e: bincode::Error) -> Self {
        ProtocolError::Deserialization(e.to_string())
    }
}

impl From<&ProtocolError> for RemoteCode {
    fn from(e: &ProtocolError) -> Self {
        match e {
            // The stream is out of step with the peer; only a new session helps.
            ProtocolError::UnexpectedMessage(_) | ProtocolError::Deserialization(_) => {
                RemoteCode::from_errno(libc::ECONNRESET)
            }
            ProtocolError::PathRejected(_) => RemoteCode::from_errno(libc::EACCES),
            ProtocolError::Serialization(_) => RemoteCode::from_errno(libc::EIO),
            ProtocolError::MessageTooLarge { .. } => RemoteCode::from_errno(libc::EINVAL),
            ProtocolError::VersionMismatch { .. } => RemoteCode::from_errno(libc::ECONNREFUSED),
        }
    }
}
