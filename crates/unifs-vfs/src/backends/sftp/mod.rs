//! SFTP backend.
//!
//! Every remote call goes through the adapter's [`ConnectionPool`]: reads
//! take any idle session for the authority, mutations wait for the primary
//! one so they reach the server in order. Fatal transport errors fault the
//! session and the next call reconnects.
//!
//! Listings prime each child's attribute cache, so walking a tree costs one
//! round trip per directory. Symlinks are the exception: their attributes
//! describe the target and are fetched lazily.

mod channel;
pub mod memory;
mod ssh;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use channel::{RemoteAttrs, RemoteEntry, RemoteKind, SftpChannel, SftpDialer, to_sftp_time};
pub use memory::MemorySftp;
pub use ssh::RusshDialer;

use crate::attr_cache::AttributeCache;
use crate::config::VfsConfig;
use crate::error::{FileOp, ResultExt, VfsError, VfsResult};
use crate::locator::Locator;
use crate::node::{FileNode, NodeRef};
use crate::pool::{ConnectionGuard, ConnectionKey, ConnectionPool, Connector, Leased, PoolSettings};
use crate::registry::{ExtraParams, ProtocolAdapter, ProtocolRegistry};
use crate::types::{FileAttributes, FilePermissions, RandomReadStream, ReadStream, WriteStream};

/// Pool connector that dials SFTP sessions.
pub struct SftpConnector {
    dialer: Arc<dyn SftpDialer>,
}

#[async_trait]
impl Connector for SftpConnector {
    type Session = Arc<dyn SftpChannel>;

    async fn connect(&self, key: &ConnectionKey) -> VfsResult<Self::Session> {
        self.dialer.dial(key).await
    }

    async fn keep_alive(&self, session: &Self::Session) -> VfsResult<()> {
        session.ping().await
    }

    async fn disconnect(&self, session: Self::Session) {
        if let Err(e) = session.close().await {
            debug!(error = %e, "sftp disconnect failed");
        }
    }
}

#[derive(Debug)]
struct SftpShared {
    pool: ConnectionPool<SftpConnector>,
    ttl: Duration,
    symlink_ttl: Duration,
}

/// Adapter for `sftp://` locators.
#[derive(Debug, Clone)]
pub struct SftpAdapter {
    shared: Arc<SftpShared>,
}

impl SftpAdapter {
    /// Adapter dialing real servers over russh.
    pub fn new(config: &VfsConfig) -> Self {
        Self::with_dialer(config, Arc::new(RusshDialer::new(config.sftp.clone())))
    }

    pub fn with_dialer(config: &VfsConfig, dialer: Arc<dyn SftpDialer>) -> Self {
        let connector = SftpConnector { dialer };
        Self {
            shared: Arc::new(SftpShared {
                pool: ConnectionPool::new(connector, PoolSettings::from(&config.pool)),
                ttl: config.cache.ttl_for("sftp"),
                symlink_ttl: config.cache.symlink_ttl(),
            }),
        }
    }

    pub fn pool(&self) -> &ConnectionPool<SftpConnector> {
        &self.shared.pool
    }

    /// Ping and reap idle sessions in the background until `cancel` fires.
    pub fn spawn_keep_alive(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.shared.pool.settings().keep_alive_interval;
        self.shared.pool.spawn_keep_alive(period, cancel)
    }
}

impl ProtocolAdapter for SftpAdapter {
    fn create(
        &self,
        _registry: &Arc<ProtocolRegistry>,
        locator: Locator,
        _params: &ExtraParams,
    ) -> VfsResult<NodeRef> {
        if locator.host().is_empty() {
            return Err(VfsError::invalid_path(format!(
                "{} has no host",
                locator.redacted()
            )));
        }
        Ok(Arc::new(SftpNode::new(locator, self.shared.clone())))
    }
}

impl std::fmt::Debug for SftpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpConnector").finish_non_exhaustive()
    }
}

/// A file or directory on an SFTP server.
#[derive(Debug)]
pub struct SftpNode {
    locator: Locator,
    shared: Arc<SftpShared>,
    cache: AttributeCache,
    /// Resolved symlink target and when it was looked up.
    link_target: Mutex<Option<(String, Instant)>>,
}

impl SftpNode {
    fn new(locator: Locator, shared: Arc<SftpShared>) -> Self {
        let cache = AttributeCache::new(shared.ttl);
        Self {
            locator,
            shared,
            cache,
            link_target: Mutex::new(None),
        }
    }

    fn sibling(&self, locator: Locator) -> SftpNode {
        SftpNode::new(locator, self.shared.clone())
    }

    fn remote_path(&self) -> String {
        self.locator.path().to_string()
    }

    /// A started session on a pooled handler.
    async fn checkout(
        &self,
        op: FileOp,
        exclusive: bool,
    ) -> VfsResult<(ConnectionGuard<SftpConnector>, Arc<dyn SftpChannel>)> {
        let mut guard = self
            .shared
            .pool
            .acquire(&self.locator, exclusive)
            .await
            .during(op, &self.locator)?;
        let session = guard
            .session()
            .await
            .map(Arc::clone)
            .during(FileOp::Connect, &self.locator)?;
        Ok((guard, session))
    }

    /// Run one remote call on a pooled session.
    async fn call<T, F, Fut>(&self, op: FileOp, exclusive: bool, f: F) -> VfsResult<T>
    where
        F: FnOnce(Arc<dyn SftpChannel>) -> Fut + Send,
        Fut: Future<Output = VfsResult<T>> + Send,
        T: Send,
    {
        let (mut guard, session) = self.checkout(op, exclusive).await?;
        let result = f(session).await;
        guard.check(result).during(op, &self.locator)
    }

    /// Open a stream that keeps its session leased until it is dropped, so
    /// the idle sweep never closes a session under a long transfer.
    async fn open_leased<S, F, Fut>(&self, op: FileOp, exclusive: bool, f: F) -> VfsResult<Leased<S>>
    where
        F: FnOnce(Arc<dyn SftpChannel>) -> Fut + Send,
        Fut: Future<Output = VfsResult<S>> + Send,
        S: Send,
    {
        let (mut guard, session) = self.checkout(op, exclusive).await?;
        let lease = guard.lease();
        let result = f(session).await;
        let stream = guard.check(result).during(op, &self.locator)?;
        Ok(Leased::new(stream, lease))
    }

    async fn resolved_target(&self) -> VfsResult<String> {
        let cached = self.link_target.lock().clone();
        if let Some((target, at)) = cached
            && at.elapsed() < self.shared.symlink_ttl
        {
            return Ok(target);
        }
        let path = self.remote_path();
        let target = self
            .call(FileOp::Stat, false, move |s| async move { s.canonicalize(&path).await })
            .await?;
        *self.link_target.lock() = Some((target.clone(), Instant::now()));
        Ok(target)
    }

    async fn require_directory(&self) -> VfsResult<()> {
        let attrs = self.attributes().await?;
        if !attrs.exists {
            return Err(VfsError::not_found(self.locator.redacted()));
        }
        if !attrs.is_directory {
            return Err(VfsError::unsupported(FileOp::List, &self.locator));
        }
        Ok(())
    }
}

#[async_trait]
impl FileNode for SftpNode {
    fn locator(&self) -> &Locator {
        &self.locator
    }

    fn attribute_cache(&self) -> &AttributeCache {
        &self.cache
    }

    async fn fetch_attributes(&self) -> VfsResult<FileAttributes> {
        let path = self.remote_path();
        let link = self
            .call(FileOp::Stat, false, move |s| async move { s.lstat(&path).await })
            .await?;
        if link.kind != RemoteKind::Symlink {
            return Ok(link.to_attributes());
        }

        let target = match self.resolved_target().await {
            Ok(target) => target,
            // Dangling link: the link itself exists.
            Err(e) if e.is_not_found() => return Ok(link.to_attributes()),
            Err(e) => return Err(e),
        };
        match self
            .call(FileOp::Stat, false, move |s| async move { s.stat(&target).await })
            .await
        {
            Ok(resolved) => {
                let mut attrs = resolved.to_attributes();
                attrs.is_symlink = true;
                Ok(attrs)
            }
            Err(e) if e.is_not_found() => Ok(link.to_attributes()),
            Err(e) => Err(e),
        }
    }

    fn changeable_permissions(&self) -> u32 {
        FilePermissions::FULL_MASK
    }

    async fn list(&self) -> VfsResult<Vec<NodeRef>> {
        self.require_directory().await?;
        let path = self.remote_path();
        let entries = self
            .call(FileOp::List, false, move |s| async move { s.read_dir(&path).await })
            .await?;

        let mut children: Vec<SftpNode> = entries
            .into_iter()
            .filter(|e| e.name != "." && e.name != "..")
            .map(|e| {
                let child = self.sibling(self.locator.child(&e.name));
                if e.attrs.kind != RemoteKind::Symlink {
                    child.cache.prime(e.attrs.to_attributes());
                }
                child
            })
            .collect();
        children.sort_by(|a, b| a.locator.name().cmp(b.locator.name()));
        debug!(locator = %self.locator.redacted(), count = children.len(), "listed");
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
        let target = self.resolved_target().await?;
        Ok(self.locator.with_path(&target))
    }

    async fn input_stream(&self) -> VfsResult<ReadStream> {
        let path = self.remote_path();
        let stream = self
            .open_leased(FileOp::Read, false, move |s| async move { s.open_read(&path).await })
            .await?;
        Ok(Box::pin(stream))
    }

    async fn random_read(&self) -> VfsResult<RandomReadStream> {
        let path = self.remote_path();
        let stream = self
            .open_leased(FileOp::RandomRead, false, move |s| async move {
                s.open_random(&path).await
            })
            .await?;
        Ok(Box::pin(stream))
    }

    async fn output_stream(&self) -> VfsResult<WriteStream> {
        let path = self.remote_path();
        let stream = self
            .open_leased(FileOp::Write, true, move |s| async move {
                s.open_write(&path, false).await
            })
            .await?;
        self.cache.invalidate();
        Ok(Box::pin(stream))
    }

    async fn append_stream(&self) -> VfsResult<WriteStream> {
        let path = self.remote_path();
        let stream = self
            .open_leased(FileOp::Append, true, move |s| async move {
                s.open_write(&path, true).await
            })
            .await?;
        self.cache.invalidate();
        Ok(Box::pin(stream))
    }

    async fn mkdir(&self) -> VfsResult<()> {
        let path = self.remote_path();
        self.call(FileOp::Mkdir, true, move |s| async move { s.mkdir(&path).await })
            .await?;
        self.cache.update_local(|a| *a = FileAttributes::directory(0o755));
        Ok(())
    }

    async fn delete(&self) -> VfsResult<()> {
        let attrs = self.attributes().await?;
        if !attrs.exists {
            return Err(VfsError::not_found(self.locator.redacted()));
        }
        let path = self.remote_path();
        let is_dir = attrs.is_directory && !attrs.is_symlink;
        self.call(FileOp::Delete, true, move |s| async move {
            if is_dir {
                s.remove_dir(&path).await
            } else {
                s.remove_file(&path).await
            }
        })
        .await?;
        self.cache.update_local(|a| *a = FileAttributes::missing());
        Ok(())
    }

    async fn rename_to(&self, target: &Locator) -> VfsResult<()> {
        if !self.locator.same_authority(target) {
            return Err(VfsError::CrossBackend {
                from: self.locator.redacted(),
                to: target.redacted(),
            });
        }
        let from = self.remote_path();
        let to = target.path().to_string();
        self.call(FileOp::Rename, true, move |s| async move {
            s.rename(&from, &to).await
        })
        .await?;
        self.cache.update_local(|a| *a = FileAttributes::missing());
        Ok(())
    }

    async fn change_permissions(&self, bits: u32) -> VfsResult<()> {
        let path = self.remote_path();
        let mode = bits & FilePermissions::FULL_MASK;
        self.call(FileOp::ChangePermissions, true, move |s| async move {
            s.set_permissions(&path, mode).await
        })
        .await?;
        self.cache
            .patch(|a| a.permissions = FilePermissions::from_mode(mode));
        Ok(())
    }

    async fn change_modified(&self, time: SystemTime) -> VfsResult<()> {
        let path = self.remote_path();
        let secs = to_sftp_time(time);
        self.call(FileOp::ChangeDate, true, move |s| async move {
            s.set_mtime(&path, secs).await
        })
        .await?;
        self.cache.patch(|a| a.modified = Some(time));
        Ok(())
    }
}
