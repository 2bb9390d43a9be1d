//! Local filesystem backend.
//!
//! Attribute caching defaults to off (zero TTL): local metadata calls are
//! cheap and other processes change files underneath us.

use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::fs;
use tracing::warn;

use crate::attr_cache::AttributeCache;
use crate::config::VfsConfig;
use crate::error::{FileOp, ResultExt, VfsError, VfsResult};
use crate::locator::Locator;
use crate::node::{FileNode, NodeRef, set_permission_bit};
use crate::registry::{ExtraParams, ProtocolAdapter, ProtocolRegistry};
use crate::types::{
    FileAttributes, FilePermissions, PermissionAccess, PermissionKind, RandomReadStream,
    RandomWriteStream, ReadStream, WriteStream,
};

/// Adapter for `file://` locators.
#[derive(Debug, Clone)]
pub struct LocalAdapter {
    ttl: Duration,
}

impl LocalAdapter {
    pub fn new(config: &VfsConfig) -> Self {
        Self {
            ttl: config.cache.ttl_for("file"),
        }
    }
}

impl ProtocolAdapter for LocalAdapter {
    fn create(
        &self,
        _registry: &Arc<ProtocolRegistry>,
        locator: Locator,
        _params: &ExtraParams,
    ) -> VfsResult<NodeRef> {
        if !matches!(locator.host(), "" | "localhost") {
            return Err(VfsError::invalid_path(format!(
                "{} names a remote host",
                locator.redacted()
            )));
        }
        Ok(Arc::new(LocalNode::new(locator, self.ttl)))
    }
}

/// A file or directory on the local disk.
#[derive(Debug)]
pub struct LocalNode {
    locator: Locator,
    path: PathBuf,
    ttl: Duration,
    cache: AttributeCache,
}

impl LocalNode {
    pub fn new(locator: Locator, ttl: Duration) -> Self {
        let path = locator.to_local_path();
        Self {
            locator,
            path,
            ttl,
            cache: AttributeCache::new(ttl),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, locator: Locator) -> LocalNode {
        LocalNode::new(locator, self.ttl)
    }

    fn io<T>(&self, op: FileOp, result: io::Result<T>) -> VfsResult<T> {
        result
            .map_err(|e| VfsError::from_io(e, &self.locator))
            .during(op, &self.locator)
    }

    /// Convert std::fs::Metadata to FileAttributes.
    fn metadata_to_attrs(meta: &std::fs::Metadata, is_symlink: bool) -> FileAttributes {
        FileAttributes {
            exists: true,
            is_directory: meta.is_dir(),
            is_symlink,
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified: meta.modified().ok(),
            permissions: FilePermissions::from_mode(meta.permissions().mode()),
            owner: Some(meta.uid().to_string()),
            group: Some(meta.gid().to_string()),
        }
    }
}

#[async_trait]
impl FileNode for LocalNode {
    fn locator(&self) -> &Locator {
        &self.locator
    }

    fn attribute_cache(&self) -> &AttributeCache {
        &self.cache
    }

    async fn fetch_attributes(&self) -> VfsResult<FileAttributes> {
        let link = fs::symlink_metadata(&self.path)
            .await
            .map_err(|e| VfsError::from_io(e, &self.locator))?;
        if !link.file_type().is_symlink() {
            return Ok(Self::metadata_to_attrs(&link, false));
        }
        match fs::metadata(&self.path).await {
            Ok(target) => Ok(Self::metadata_to_attrs(&target, true)),
            // Dangling link: the link itself exists.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Ok(Self::metadata_to_attrs(&link, true))
            }
            Err(e) => Err(VfsError::from_io(e, &self.locator)),
        }
    }

    fn changeable_permissions(&self) -> u32 {
        FilePermissions::FULL_MASK
    }

    async fn list(&self) -> VfsResult<Vec<NodeRef>> {
        let attrs = self.attributes().await?;
        if !attrs.exists {
            return Err(VfsError::not_found(self.locator.redacted()));
        }
        if !attrs.is_directory {
            return Err(VfsError::unsupported(FileOp::List, &self.locator));
        }
        let mut dir = self.io(FileOp::List, fs::read_dir(&self.path).await)?;
        let mut children: Vec<LocalNode> = Vec::new();
        while let Some(entry) = self.io(FileOp::List, dir.next_entry().await)? {
            // Locators are UTF-8; such a name could never be resolved back.
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    warn!(dir = %self.path.display(), name = ?raw, "skipping entry with non-UTF-8 name");
                    continue;
                }
            };
            let child = self.sibling(self.locator.child(&name));
            // Symlinks are resolved lazily on first query.
            if let Ok(meta) = entry.metadata().await
                && !meta.file_type().is_symlink()
            {
                child.cache.prime(Self::metadata_to_attrs(&meta, false));
            }
            children.push(child);
        }
        children.sort_by(|a, b| a.locator.name().cmp(b.locator.name()));
        Ok(children
            .into_iter()
            .map(|c| Arc::new(c) as NodeRef)
            .collect())
    }

    async fn parent(&self) -> VfsResult<Option<NodeRef>> {
        Ok(self
            .locator
            .parent()
            .map(|p| Arc::new(self.sibling(p)) as NodeRef))
    }

    async fn canonical(&self) -> VfsResult<Locator> {
        let real = self.io(FileOp::Stat, fs::canonicalize(&self.path).await)?;
        Ok(Locator::from_local_path(&real))
    }

    async fn input_stream(&self) -> VfsResult<ReadStream> {
        let file = self.io(FileOp::Read, fs::File::open(&self.path).await)?;
        Ok(Box::pin(file))
    }

    async fn random_read(&self) -> VfsResult<RandomReadStream> {
        let file = self.io(FileOp::RandomRead, fs::File::open(&self.path).await)?;
        Ok(Box::pin(file))
    }

    async fn output_stream(&self) -> VfsResult<WriteStream> {
        let file = self.io(FileOp::Write, fs::File::create(&self.path).await)?;
        self.cache.invalidate();
        Ok(Box::pin(file))
    }

    async fn append_stream(&self) -> VfsResult<WriteStream> {
        let opened = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await;
        let file = self.io(FileOp::Append, opened)?;
        self.cache.invalidate();
        Ok(Box::pin(file))
    }

    async fn random_write(&self) -> VfsResult<RandomWriteStream> {
        let opened = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .await;
        let file = self.io(FileOp::RandomWrite, opened)?;
        self.cache.invalidate();
        Ok(Box::pin(file))
    }

    async fn mkdir(&self) -> VfsResult<()> {
        self.io(FileOp::Mkdir, fs::create_dir(&self.path).await)?;
        self.cache.update_local(|a| {
            *a = FileAttributes::directory(0o755);
        });
        Ok(())
    }

    async fn delete(&self) -> VfsResult<()> {
        let attrs = self.attributes().await?;
        if !attrs.exists {
            return Err(VfsError::not_found(self.locator.redacted()));
        }
        if attrs.is_directory && !attrs.is_symlink {
            self.io(FileOp::Delete, fs::remove_dir(&self.path).await)?;
        } else {
            self.io(FileOp::Delete, fs::remove_file(&self.path).await)?;
        }
        self.cache.update_local(|a| *a = FileAttributes::missing());
        Ok(())
    }

    async fn rename_to(&self, target: &Locator) -> VfsResult<()> {
        if target.scheme() != "file" {
            return Err(VfsError::CrossBackend {
                from: self.locator.redacted(),
                to: target.redacted(),
            });
        }
        self.io(
            FileOp::Rename,
            fs::rename(&self.path, target.to_local_path()).await,
        )?;
        self.cache.update_local(|a| *a = FileAttributes::missing());
        Ok(())
    }

    async fn change_permissions(&self, bits: u32) -> VfsResult<()> {
        let perms = std::fs::Permissions::from_mode(bits & FilePermissions::FULL_MASK);
        self.io(
            FileOp::ChangePermissions,
            fs::set_permissions(&self.path, perms).await,
        )?;
        self.cache.patch(|a| {
            a.permissions = FilePermissions::from_mode(bits);
        });
        Ok(())
    }

    async fn change_permission(
        &self,
        access: PermissionAccess,
        kind: PermissionKind,
        enabled: bool,
    ) -> VfsResult<()> {
        set_permission_bit(self, access, kind, enabled).await
    }

    async fn change_modified(&self, time: SystemTime) -> VfsResult<()> {
        let path = self.path.clone();
        let joined = tokio::task::spawn_blocking(move || {
            std::fs::File::open(&path)?.set_modified(time)
        })
        .await
        .map_err(|e| io::Error::other(e.to_string()));
        self.io(FileOp::ChangeDate, joined.and_then(|r| r))?;
        self.cache.patch(|a| a.modified = Some(time));
        Ok(())
    }
}
