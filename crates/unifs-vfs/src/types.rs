//! Core VFS types.

use std::fmt;
use std::pin::Pin;
use std::time::SystemTime;

use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

/// Sequential read stream.
pub type ReadStream = Pin<Box<dyn AsyncRead + Send>>;

/// Sequential write stream. Callers must `shutdown()` it to commit.
pub type WriteStream = Pin<Box<dyn AsyncWrite + Send>>;

/// Seekable read stream.
pub trait RandomRead: AsyncRead + AsyncSeek + Send {}
impl<T: AsyncRead + AsyncSeek + Send> RandomRead for T {}

/// Seekable write stream.
pub trait RandomWrite: AsyncWrite + AsyncSeek + Send {}
impl<T: AsyncWrite + AsyncSeek + Send> RandomWrite for T {}

pub type RandomReadStream = Pin<Box<dyn RandomRead>>;
pub type RandomWriteStream = Pin<Box<dyn RandomWrite>>;

/// Who a permission bit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PermissionAccess {
    User,
    Group,
    Other,
}

impl PermissionAccess {
    fn shift(self) -> u32 {
        match self {
            Self::User => 6,
            Self::Group => 3,
            Self::Other => 0,
        }
    }
}

/// Which right a permission bit grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PermissionKind {
    Read,
    Write,
    Execute,
}

impl PermissionKind {
    fn bit(self) -> u32 {
        match self {
            Self::Read => 4,
            Self::Write => 2,
            Self::Execute => 1,
        }
    }
}

/// Unix-style permission bits plus the mask of bits the backend reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilePermissions {
    pub bits: u32,
    pub mask: u32,
}

impl FilePermissions {
    /// Full `rwxrwxrwx` mask.
    pub const FULL_MASK: u32 = 0o777;

    pub fn new(bits: u32, mask: u32) -> Self {
        Self {
            bits: bits & mask,
            mask,
        }
    }

    /// Permissions with every bit supported.
    pub fn from_mode(mode: u32) -> Self {
        Self::new(mode & Self::FULL_MASK, Self::FULL_MASK)
    }

    pub fn bit(access: PermissionAccess, kind: PermissionKind) -> u32 {
        kind.bit() << access.shift()
    }

    pub fn get(&self, access: PermissionAccess, kind: PermissionKind) -> bool {
        self.bits & Self::bit(access, kind) != 0
    }

    /// Copy with one bit set or cleared.
    pub fn with(&self, access: PermissionAccess, kind: PermissionKind, enabled: bool) -> Self {
        let bit = Self::bit(access, kind);
        let bits = if enabled { self.bits | bit } else { self.bits & !bit };
        Self { bits, mask: self.mask }
    }
}

impl fmt::Display for FilePermissions {
    /// `rwxr-x---`, with `?` for bits the backend does not report.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for access in [PermissionAccess::User, PermissionAccess::Group, PermissionAccess::Other] {
            for (kind, c) in [
                (PermissionKind::Read, 'r'),
                (PermissionKind::Write, 'w'),
                (PermissionKind::Execute, 'x'),
            ] {
                let bit = Self::bit(access, kind);
                let ch = if self.mask & bit == 0 {
                    '?'
                } else if self.bits & bit != 0 {
                    c
                } else {
                    '-'
                };
                write!(f, "{ch}")?;
            }
        }
        Ok(())
    }
}

/// Snapshot of a file's metadata.
///
/// A symlink to a directory reports both `is_symlink` and `is_directory`;
/// size, date and permissions describe the target.
#[derive(Debug, Clone, PartialEq)]
pub struct FileAttributes {
    pub exists: bool,
    pub is_directory: bool,
    pub is_symlink: bool,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub permissions: FilePermissions,
    pub owner: Option<String>,
    pub group: Option<String>,
}

impl FileAttributes {
    /// Attributes of a file that does not exist.
    pub fn missing() -> Self {
        Self {
            exists: false,
            is_directory: false,
            is_symlink: false,
            size: 0,
            modified: None,
            permissions: FilePermissions::default(),
            owner: None,
            group: None,
        }
    }

    /// Create attributes for a regular file.
    pub fn file(size: u64, perm: u32) -> Self {
        Self {
            exists: true,
            size,
            modified: Some(SystemTime::now()),
            permissions: FilePermissions::from_mode(perm),
            ..Self::missing()
        }
    }

    /// Create attributes for a directory.
    pub fn directory(perm: u32) -> Self {
        Self {
            exists: true,
            is_directory: true,
            modified: Some(SystemTime::now()),
            permissions: FilePermissions::from_mode(perm),
            ..Self::missing()
        }
    }

    pub fn with_modified(mut self, modified: Option<SystemTime>) -> Self {
        self.modified = modified;
        self
    }

    pub fn with_owner(mut self, owner: Option<String>, group: Option<String>) -> Self {
        self.owner = owner;
        self.group = group;
        self
    }
}

impl Default for FileAttributes {
    fn default() -> Self {
        Self::missing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_bits_follow_unix_layout() {
        assert_eq!(
            FilePermissions::bit(PermissionAccess::User, PermissionKind::Read),
            0o400
        );
        assert_eq!(
            FilePermissions::bit(PermissionAccess::Other, PermissionKind::Execute),
            0o001
        );
    }

    #[test]
    fn permissions_display_and_toggle() {
        let p = FilePermissions::from_mode(0o750);
        assert_eq!(p.to_string(), "rwxr-x---");
        let p = p.with(PermissionAccess::Other, PermissionKind::Read, true);
        assert_eq!(p.bits, 0o754);
        assert!(p.get(PermissionAccess::Other, PermissionKind::Read));
        let p = p.with(PermissionAccess::User, PermissionKind::Write, false);
        assert_eq!(p.to_string(), "r-xr-xr--");
    }

    #[test]
    fn unreported_bits_render_as_unknown() {
        let p = FilePermissions::new(0o600, 0o700);
        assert_eq!(p.to_string(), "rw-??????");
    }

    #[test]
    fn constructors() {
        let f = FileAttributes::file(10, 0o644);
        assert!(f.exists && !f.is_directory);
        assert_eq!(f.size, 10);
        let d = FileAttributes::directory(0o755);
        assert!(d.exists && d.is_directory);
        assert!(!FileAttributes::missing().exists);
    }
}
