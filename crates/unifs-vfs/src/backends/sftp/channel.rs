//! The SFTP session seam.
//!
//! [`SftpChannel`] is the set of remote calls the SFTP node needs;
//! [`SftpDialer`] opens one. The russh implementation lives in
//! [`super::ssh`], the in-memory one in [`super::memory`].

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::error::VfsResult;
use crate::pool::ConnectionKey;
use crate::types::{FileAttributes, FilePermissions, RandomReadStream, ReadStream, WriteStream};

/// File type bits of a POSIX mode.
const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    File,
    Directory,
    Symlink,
    Other,
}

impl RemoteKind {
    /// Kind encoded in the file-type bits of a mode.
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => Self::Directory,
            S_IFLNK => Self::Symlink,
            S_IFREG => Self::File,
            _ => Self::Other,
        }
    }
}

/// Attributes as reported by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAttrs {
    pub kind: RemoteKind,
    pub size: u64,
    /// Permission bits without the file type.
    pub permissions: u32,
    /// Seconds since the epoch.
    pub mtime: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
}

impl RemoteAttrs {
    pub fn to_attributes(&self) -> FileAttributes {
        FileAttributes {
            exists: true,
            is_directory: self.kind == RemoteKind::Directory,
            is_symlink: self.kind == RemoteKind::Symlink,
            size: if self.kind == RemoteKind::Directory { 0 } else { self.size },
            modified: self
                .mtime
                .map(|t| UNIX_EPOCH + Duration::from_secs(u64::from(t))),
            permissions: FilePermissions::from_mode(self.permissions),
            owner: self.owner.clone(),
            group: self.group.clone(),
        }
    }
}

/// One `read_dir` entry. Servers may include `.` and `..`.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub name: String,
    pub attrs: RemoteAttrs,
}

/// Seconds since the epoch as SFTP v3 carries them.
pub fn to_sftp_time(time: SystemTime) -> u32 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().min(u64::from(u32::MAX)) as u32)
        .unwrap_or(0)
}

/// Remote calls over one SFTP session.
#[async_trait]
pub trait SftpChannel: Send + Sync {
    /// Attributes of the path itself.
    async fn lstat(&self, path: &str) -> VfsResult<RemoteAttrs>;

    /// Attributes following symlinks.
    async fn stat(&self, path: &str) -> VfsResult<RemoteAttrs>;

    async fn canonicalize(&self, path: &str) -> VfsResult<String>;

    async fn read_dir(&self, path: &str) -> VfsResult<Vec<RemoteEntry>>;

    async fn open_read(&self, path: &str) -> VfsResult<ReadStream>;

    async fn open_random(&self, path: &str) -> VfsResult<RandomReadStream>;

    /// Create or truncate (or append to) a file.
    async fn open_write(&self, path: &str, append: bool) -> VfsResult<WriteStream>;

    async fn mkdir(&self, path: &str) -> VfsResult<()>;

    async fn remove_file(&self, path: &str) -> VfsResult<()>;

    async fn remove_dir(&self, path: &str) -> VfsResult<()>;

    async fn rename(&self, from: &str, to: &str) -> VfsResult<()>;

    async fn set_permissions(&self, path: &str, mode: u32) -> VfsResult<()>;

    async fn set_mtime(&self, path: &str, mtime: u32) -> VfsResult<()>;

    /// No-op round trip.
    async fn ping(&self) -> VfsResult<()> {
        self.canonicalize(".").await.map(|_| ())
    }

    async fn close(&self) -> VfsResult<()> {
        Ok(())
    }
}

/// Opens authenticated SFTP sessions.
#[async_trait]
pub trait SftpDialer: Send + Sync + 'static {
    async fn dial(&self, key: &ConnectionKey) -> VfsResult<Arc<dyn SftpChannel>>;
}
