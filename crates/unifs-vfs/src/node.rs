//! The abstract file.
//!
//! [`FileNode`] is implemented once per backend. Metadata getters go through
//! the node's [`AttributeCache`]; everything a backend cannot do defaults to
//! a typed [`VfsError::Unsupported`] naming the operation and the locator.
//!
//! Behavior shared by every backend lives in the free functions below rather
//! than in a base type.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::attr_cache::AttributeCache;
use crate::error::{FileOp, ResultExt, VfsError, VfsResult};
use crate::locator::Locator;
use crate::registry::ProtocolRegistry;
use crate::types::{
    FileAttributes, FilePermissions, PermissionAccess, PermissionKind, RandomReadStream,
    RandomWriteStream, ReadStream, WriteStream,
};

/// Shared handle to a file node.
pub type NodeRef = Arc<dyn FileNode>;

/// Operations every backend exposes.
#[async_trait]
pub trait FileNode: Send + Sync + fmt::Debug {
    fn locator(&self) -> &Locator;

    fn attribute_cache(&self) -> &AttributeCache;

    /// Uncached metadata round trip.
    async fn fetch_attributes(&self) -> VfsResult<FileAttributes>;

    // =========================================================================
    // Metadata (cached)
    // =========================================================================

    async fn attributes(&self) -> VfsResult<FileAttributes> {
        self.attribute_cache()
            .get_or_refresh(|| self.fetch_attributes())
            .await
            .during(FileOp::Stat, self.locator())
    }

    async fn exists(&self) -> VfsResult<bool> {
        Ok(self.attributes().await?.exists)
    }

    async fn is_directory(&self) -> VfsResult<bool> {
        Ok(self.attributes().await?.is_directory)
    }

    async fn is_symlink(&self) -> VfsResult<bool> {
        Ok(self.attributes().await?.is_symlink)
    }

    async fn size(&self) -> VfsResult<u64> {
        Ok(self.attributes().await?.size)
    }

    async fn modified(&self) -> VfsResult<Option<SystemTime>> {
        Ok(self.attributes().await?.modified)
    }

    async fn permissions(&self) -> VfsResult<FilePermissions> {
        Ok(self.attributes().await?.permissions)
    }

    async fn owner(&self) -> VfsResult<Option<String>> {
        Ok(self.attributes().await?.owner)
    }

    async fn group(&self) -> VfsResult<Option<String>> {
        Ok(self.attributes().await?.group)
    }

    /// Permission bits this backend can change.
    fn changeable_permissions(&self) -> u32 {
        0
    }

    // =========================================================================
    // Navigation
    // =========================================================================

    /// Children, without `.` and `..`. Fails on non-directories.
    async fn list(&self) -> VfsResult<Vec<NodeRef>> {
        Err(VfsError::unsupported(FileOp::List, self.locator()))
    }

    /// Parent node, `None` at the root.
    async fn parent(&self) -> VfsResult<Option<NodeRef>> {
        Ok(None)
    }

    /// Locator with symlinks resolved, where the backend can tell.
    async fn canonical(&self) -> VfsResult<Locator> {
        Ok(self.locator().clone())
    }

    // =========================================================================
    // Streams
    // =========================================================================

    async fn input_stream(&self) -> VfsResult<ReadStream> {
        Err(VfsError::unsupported(FileOp::Read, self.locator()))
    }

    async fn random_read(&self) -> VfsResult<RandomReadStream> {
        Err(VfsError::unsupported(FileOp::RandomRead, self.locator()))
    }

    /// Truncating writer. Callers `shutdown()` it to commit.
    async fn output_stream(&self) -> VfsResult<WriteStream> {
        Err(VfsError::unsupported(FileOp::Write, self.locator()))
    }

    async fn append_stream(&self) -> VfsResult<WriteStream> {
        Err(VfsError::unsupported(FileOp::Append, self.locator()))
    }

    async fn random_write(&self) -> VfsResult<RandomWriteStream> {
        Err(VfsError::unsupported(FileOp::RandomWrite, self.locator()))
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    async fn mkdir(&self) -> VfsResult<()> {
        Err(VfsError::unsupported(FileOp::Mkdir, self.locator()))
    }

    /// Delete a file or an empty directory.
    async fn delete(&self) -> VfsResult<()> {
        Err(VfsError::unsupported(FileOp::Delete, self.locator()))
    }

    /// Rename within the same backend and authority.
    async fn rename_to(&self, _target: &Locator) -> VfsResult<()> {
        Err(VfsError::unsupported(FileOp::Rename, self.locator()))
    }

    /// Replace all permission bits.
    async fn change_permissions(&self, _bits: u32) -> VfsResult<()> {
        Err(VfsError::unsupported(FileOp::ChangePermissions, self.locator()))
    }

    /// Change a single permission bit.
    async fn change_permission(
        &self,
        _access: PermissionAccess,
        _kind: PermissionKind,
        _enabled: bool,
    ) -> VfsResult<()> {
        Err(VfsError::unsupported(FileOp::ChangePermission, self.locator()))
    }

    async fn change_modified(&self, _time: SystemTime) -> VfsResult<()> {
        Err(VfsError::unsupported(FileOp::ChangeDate, self.locator()))
    }
}

/// Locator of `name` inside `parent`.
pub fn child_locator(parent: &dyn FileNode, name: &str) -> Locator {
    parent.locator().child(name)
}

/// Resolve `name` inside `parent` through the registry.
pub fn get_child(
    registry: &Arc<ProtocolRegistry>,
    parent: &dyn FileNode,
    name: &str,
) -> VfsResult<NodeRef> {
    if name.is_empty() || name.contains('/') {
        return Err(VfsError::invalid_path(name));
    }
    registry.resolve(&child_locator(parent, name))
}

/// Dot-files are hidden.
pub fn is_hidden(node: &dyn FileNode) -> bool {
    node.locator().name().starts_with('.')
}

/// Read a whole file into memory.
pub async fn read_to_end(node: &dyn FileNode) -> VfsResult<Vec<u8>> {
    let mut stream = node.input_stream().await?;
    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .await
        .map_err(VfsError::from)
        .during(FileOp::Read, node.locator())?;
    Ok(buf)
}

/// Copy the contents of `src` into `dst`, returning the byte count.
pub async fn copy_file(src: &dyn FileNode, dst: &dyn FileNode) -> VfsResult<u64> {
    let mut reader = src.input_stream().await?;
    let mut writer = dst.output_stream().await?;
    let copied = tokio::io::copy(&mut reader, &mut writer)
        .await
        .map_err(VfsError::from)
        .during(FileOp::Write, dst.locator())?;
    writer
        .shutdown()
        .await
        .map_err(VfsError::from)
        .during(FileOp::Write, dst.locator())?;
    dst.attribute_cache().invalidate();
    debug!(from = %src.locator().redacted(), to = %dst.locator().redacted(), bytes = copied, "copied");
    Ok(copied)
}

/// Move `src` to `dst`: rename when both share a backend and authority,
/// otherwise copy then delete the source.
pub async fn move_file(src: &dyn FileNode, dst: &dyn FileNode) -> VfsResult<()> {
    if src.locator().same_authority(dst.locator()) {
        match src.rename_to(dst.locator()).await {
            Ok(()) => {
                dst.attribute_cache().invalidate();
                return Ok(());
            }
            Err(e) if matches!(e.root(), VfsError::CrossBackend { .. }) || e.is_unsupported() => {}
            Err(e) => return Err(e),
        }
    }
    if src.is_directory().await? {
        return Err(VfsError::CrossBackend {
            from: src.locator().redacted(),
            to: dst.locator().redacted(),
        });
    }
    copy_file(src, dst).await?;
    src.delete().await
}

/// Flip one permission bit through a whole-value change.
///
/// For backends that only support `change_permissions`.
pub async fn set_permission_bit(
    node: &dyn FileNode,
    access: PermissionAccess,
    kind: PermissionKind,
    enabled: bool,
) -> VfsResult<()> {
    let bit = FilePermissions::bit(access, kind);
    if node.changeable_permissions() & bit == 0 {
        return Err(VfsError::unsupported(FileOp::ChangePermission, node.locator()));
    }
    let current = node.permissions().await?;
    let wanted = current.with(access, kind, enabled);
    if wanted.bits == current.bits {
        return Ok(());
    }
    node.change_permissions(wanted.bits).await
}
