//! Error taxonomy shared by every Tidepool crate.
//!
//! Each variant carries a complete, human readable message and maps to a stable numeric code so
//! that errors can cross a process boundary and be re-raised with the same kind and message.

use thiserror::Error;

/// Result type alias for storage, IO and protocol operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for storage, IO and protocol operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Invalid use of an API: bad path expression, dry-run violation, write on read-only storage.
    #[error("assertion failed: {0}")]
    Assert(String),

    /// File or path does not exist.
    #[error("missing target: {0}")]
    MissingTarget(String),

    /// The OS or service refused access.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The target already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A file, path or object could not be opened.
    #[error("open failed: {0}")]
    OpenFailed(String),

    /// Reading from an open stream failed.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// Writing to an open stream failed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// Closing or finalizing a stream failed.
    #[error("close failed: {0}")]
    CloseFailed(String),

    /// Flushing a file or path to durable storage failed.
    #[error("sync failed: {0}")]
    SyncFailed(String),

    /// Renaming a file failed.
    #[error("move failed: {0}")]
    MoveFailed(String),

    /// Removing a file or path failed.
    #[error("remove failed: {0}")]
    RemoveFailed(String),

    /// Creating a path failed.
    #[error("path create failed: {0}")]
    PathCreateFailed(String),

    /// Reading file or path metadata failed.
    #[error("info failed: {0}")]
    InfoFailed(String),

    /// Malformed chunk frame, protocol frame or remote response.
    #[error("format error: {0}")]
    Format(String),

    /// Protocol violation: bad greeting, unknown command, lock failure.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No data arrived before the read timeout elapsed.
    #[error("read timeout: {0}")]
    ReadTimeout(String),

    /// The operation is not available on this driver.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Encryption or decryption failed (including authentication failure).
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Compression or decompression failed.
    #[error("compression error: {0}")]
    Compression(String),

    /// An object store or other service returned an unexpected status.
    #[error("service error: {0}")]
    Service(String),

    /// Configuration is invalid or incomplete.
    #[error("config error: {0}")]
    Config(String),
}

impl StorageError {
    /// Stable numeric code used on the wire.
    pub fn code(&self) -> u16 {
        match self {
            StorageError::Assert(_) => 1,
            StorageError::MissingTarget(_) => 2,
            StorageError::PermissionDenied(_) => 3,
            StorageError::AlreadyExists(_) => 4,
            StorageError::OpenFailed(_) => 5,
            StorageError::ReadFailed(_) => 6,
            StorageError::WriteFailed(_) => 7,
            StorageError::CloseFailed(_) => 8,
            StorageError::SyncFailed(_) => 9,
            StorageError::MoveFailed(_) => 10,
            StorageError::RemoveFailed(_) => 11,
            StorageError::PathCreateFailed(_) => 12,
            StorageError::InfoFailed(_) => 13,
            StorageError::Format(_) => 14,
            StorageError::Protocol(_) => 15,
            StorageError::ReadTimeout(_) => 16,
            StorageError::NotImplemented(_) => 17,
            StorageError::Crypto(_) => 18,
            StorageError::Compression(_) => 19,
            StorageError::Service(_) => 20,
            StorageError::Config(_) => 21,
        }
    }

    /// The message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            StorageError::Assert(m)
            | StorageError::MissingTarget(m)
            | StorageError::PermissionDenied(m)
            | StorageError::AlreadyExists(m)
            | StorageError::OpenFailed(m)
            | StorageError::ReadFailed(m)
            | StorageError::WriteFailed(m)
            | StorageError::CloseFailed(m)
            | StorageError::SyncFailed(m)
            | StorageError::MoveFailed(m)
            | StorageError::RemoveFailed(m)
            | StorageError::PathCreateFailed(m)
            | StorageError::InfoFailed(m)
            | StorageError::Format(m)
            | StorageError::Protocol(m)
            | StorageError::ReadTimeout(m)
            | StorageError::NotImplemented(m)
            | StorageError::Crypto(m)
            | StorageError::Compression(m)
            | StorageError::Service(m)
            | StorageError::Config(m) => m,
        }
    }

    /// Rebuild an error from its wire code and message.
    ///
    /// Unknown codes become [`StorageError::Protocol`] so a newer peer cannot crash an older one.
    pub fn from_code(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            1 => StorageError::Assert(message),
            2 => StorageError::MissingTarget(message),
            3 => StorageError::PermissionDenied(message),
            4 => StorageError::AlreadyExists(message),
            5 => StorageError::OpenFailed(message),
            6 => StorageError::ReadFailed(message),
            7 => StorageError::WriteFailed(message),
            8 => StorageError::CloseFailed(message),
            9 => StorageError::SyncFailed(message),
            10 => StorageError::MoveFailed(message),
            11 => StorageError::RemoveFailed(message),
            12 => StorageError::PathCreateFailed(message),
            13 => StorageError::InfoFailed(message),
            14 => StorageError::Format(message),
            15 => StorageError::Protocol(message),
            16 => StorageError::ReadTimeout(message),
            17 => StorageError::NotImplemented(message),
            18 => StorageError::Crypto(message),
            19 => StorageError::Compression(message),
            20 => StorageError::Service(message),
            21 => StorageError::Config(message),
            _ => StorageError::Protocol(format!("unknown error code {}: {}", code, message)),
        }
    }

    /// Map an OS error to a kind, appending the OS error text to `context`.
    ///
    /// Not-found, permission and already-exists errors keep their own kinds; everything else
    /// becomes whatever `fallback` builds.
    pub fn from_io(
        err: &std::io::Error,
        context: impl AsRef<str>,
        fallback: fn(String) -> StorageError,
    ) -> Self {
        let message = format!("{}: {}", context.as_ref(), err);
        match err.kind() {
            std::io::ErrorKind::NotFound => StorageError::MissingTarget(message),
            std::io::ErrorKind::PermissionDenied => StorageError::PermissionDenied(message),
            std::io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(message),
            _ => fallback(message),
        }
    }

    /// True for [`StorageError::MissingTarget`].
    pub fn is_missing(&self) -> bool {
        matches!(self, StorageError::MissingTarget(_))
    }
}
