//! VFS error types.

use std::io;
use thiserror::Error;

use crate::locator::Locator;

/// Operation kinds, carried by errors so callers know what failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum FileOp {
    Read,
    Write,
    Append,
    RandomRead,
    RandomWrite,
    List,
    Stat,
    Mkdir,
    Delete,
    Rename,
    ChangePermission,
    ChangePermissions,
    ChangeDate,
    Connect,
    Search,
}

/// VFS error type.
#[derive(Debug, Error)]
pub enum VfsError {
    /// Locator string could not be parsed.
    #[error("malformed locator {input:?}: {reason}")]
    MalformedLocator { input: String, reason: String },

    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Invalid path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// No adapter registered for the scheme.
    #[error("unknown scheme: {0}")]
    UnknownScheme(String),

    /// Credentials missing or rejected.
    #[error("authentication failed for {target}: {message}")]
    Auth { target: String, message: String },

    /// The backend cannot perform this operation on this file.
    #[error("{op} is not supported for {locator}")]
    Unsupported { op: FileOp, locator: String },

    /// Network or protocol failure.
    #[error("transport error on {target}: {message}")]
    Transport { target: String, message: String },

    /// A bounded wait expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The guard's handler was evicted. `acquire` retries past it, so only a
    /// guard kept after a fatal error sees it.
    #[error("connection faulted: {0}")]
    Faulted(String),

    /// Rename between different backends or authorities.
    #[error("cannot rename across backends: {from} -> {to}")]
    CrossBackend { from: String, to: String },

    /// Search options could not be compiled.
    #[error("invalid search: {0}")]
    InvalidSearch(String),

    /// Configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// Context wrapper: which operation on which file failed.
    #[error("{op} {locator}: {source}")]
    Operation {
        op: FileOp,
        locator: String,
        #[source]
        source: Box<VfsError>,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl VfsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Create a MalformedLocator error.
    pub fn malformed(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedLocator {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Create an Unsupported error for `op` on `locator`.
    pub fn unsupported(op: FileOp, locator: &Locator) -> Self {
        Self::Unsupported {
            op,
            locator: locator.redacted(),
        }
    }

    /// Create an Auth error.
    pub fn auth(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Auth {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Create a Transport error.
    pub fn transport(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Map an I/O error on `locator` onto the matching variant.
    pub fn from_io(err: io::Error, locator: &Locator) -> Self {
        let loc = locator.redacted();
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(loc),
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(loc),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(loc),
            io::ErrorKind::NotADirectory => Self::NotADirectory(loc),
            io::ErrorKind::DirectoryNotEmpty => Self::DirectoryNotEmpty(loc),
            _ => Self::Io(err),
        }
    }

    /// The innermost error, looking through `Operation` wrappers.
    pub fn root(&self) -> &VfsError {
        match self {
            Self::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.root(), Self::Auth { .. })
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self.root(), Self::Unsupported { .. })
    }

    /// Whether the error means the underlying session can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        match self.root() {
            Self::Transport { .. } | Self::Timeout(_) | Self::Faulted(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Attach operation context to a result.
pub trait ResultExt<T> {
    /// Wrap an error with the operation and locator it happened on.
    ///
    /// `Unsupported` and already-wrapped errors pass through unchanged.
    fn during(self, op: FileOp, locator: &Locator) -> VfsResult<T>;
}

impl<T> ResultExt<T> for VfsResult<T> {
    fn during(self, op: FileOp, locator: &Locator) -> VfsResult<T> {
        self.map_err(|e| match e {
            e @ (VfsError::Operation { .. } | VfsError::Unsupported { .. }) => e,
            e => VfsError::Operation {
                op,
                locator: locator.redacted(),
                source: Box::new(e),
            },
        })
    }
}

/// Convert VfsError to std::io::Error for stream adapters.
impl From<VfsError> for io::Error {
    fn from(e: VfsError) -> Self {
        match e {
            VfsError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            VfsError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            VfsError::PermissionDenied(msg) => {
                io::Error::new(io::ErrorKind::PermissionDenied, msg)
            }
            VfsError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            VfsError::DirectoryNotEmpty(msg) => {
                io::Error::new(io::ErrorKind::DirectoryNotEmpty, msg)
            }
            VfsError::InvalidPath(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            e @ VfsError::MalformedLocator { .. } => {
                io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
            }
            e @ VfsError::Unsupported { .. } => {
                io::Error::new(io::ErrorKind::Unsupported, e.to_string())
            }
            e @ VfsError::Auth { .. } => {
                io::Error::new(io::ErrorKind::PermissionDenied, e.to_string())
            }
            VfsError::Timeout(msg) => io::Error::new(io::ErrorKind::TimedOut, msg),
            e @ VfsError::Transport { .. } => {
                io::Error::new(io::ErrorKind::ConnectionAborted, e.to_string())
            }
            VfsError::Io(e) => e,
            other => io::Error::other(other.to_string()),
        }
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;
