//! Google Drive backend.
//!
//! Drive has no paths, only ids and parent links. Paths are synthesized:
//! the root of `gdrive://<account>/` holds three fixed folders (`My Drive`,
//! `Shared with me`, `Trash`) and everything below them is found by walking
//! names through parent-id queries.
//!
//! The pool keeps authorized clients per account. A client whose token is
//! about to expire is reopened before use, which refreshes the token. Auth
//! failures count as fatal, so a revoked token evicts the client and the next
//! call dials again through the token store.

pub mod api;
pub mod credentials;
pub mod memory;
pub mod upload;

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use tracing::{debug, info};

pub use api::{DriveApi, DriveFile, DriveQuery, DriveUpdate, HttpDriveApi, ROOT_ID, UploadTarget};
pub use credentials::{
    DriveClient, DriveDialer, OAuthClient, OAuthDriveDialer, StoredToken, TokenStore,
};
pub use memory::MemoryDrive;
pub use upload::{UploadWriter, spawn_upload};

use crate::attr_cache::AttributeCache;
use crate::config::VfsConfig;
use crate::error::{FileOp, ResultExt, VfsError, VfsResult};
use crate::locator::Locator;
use crate::node::{FileNode, NodeRef};
use crate::pool::{ConnectionKey, ConnectionPool, Connector, PoolSettings};
use crate::registry::{ExtraParams, ProtocolAdapter, ProtocolRegistry};
use crate::types::{FileAttributes, ReadStream, WriteStream};

/// The fixed folders under an account root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
pub enum Section {
    #[strum(serialize = "My Drive")]
    MyDrive,
    #[strum(serialize = "Shared with me")]
    Shared,
    #[strum(serialize = "Trash")]
    Trash,
}

impl Section {
    fn is_trash(self) -> bool {
        self == Section::Trash
    }

    /// Listing query for the section folder itself.
    fn listing(self) -> DriveQuery {
        match self {
            Section::MyDrive => DriveQuery::Children {
                parent: ROOT_ID.into(),
                include_trashed: false,
            },
            Section::Shared => DriveQuery::SharedWithMe,
            Section::Trash => DriveQuery::Trashed,
        }
    }
}

/// Where a locator points inside an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Place {
    Root,
    Section(Section),
    Item(Section),
    /// First segment is not a section name.
    Nowhere,
}

impl Place {
    fn of(locator: &Locator) -> Self {
        let mut segments = locator.segments();
        let Some(first) = segments.next() else {
            return Place::Root;
        };
        match Section::from_str(first) {
            Ok(section) if segments.next().is_none() => Place::Section(section),
            Ok(section) => Place::Item(section),
            Err(_) => Place::Nowhere,
        }
    }

    /// Items that can be written, created or moved.
    fn writable_section(self) -> Option<Section> {
        match self {
            Place::Item(s @ (Section::MyDrive | Section::Shared)) => Some(s),
            _ => None,
        }
    }
}

/// Pool connector handing out authorized Drive clients.
pub struct DriveConnector {
    dialer: Arc<dyn DriveDialer>,
}

#[async_trait]
impl Connector for DriveConnector {
    type Session = DriveClient;

    async fn connect(&self, key: &ConnectionKey) -> VfsResult<Self::Session> {
        self.dialer.dial(key).await
    }

    fn is_fatal(&self, err: &VfsError) -> bool {
        err.is_fatal() || err.is_auth()
    }

    fn is_expired(&self, client: &DriveClient) -> bool {
        client.needs_refresh(Utc::now())
    }
}

impl std::fmt::Debug for DriveConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveConnector").finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct DriveShared {
    pool: ConnectionPool<DriveConnector>,
    ttl: Duration,
    upload_chunks: usize,
}

/// Adapter for `gdrive://` locators. The host names the account.
#[derive(Debug, Clone)]
pub struct DriveAdapter {
    shared: Arc<DriveShared>,
}

impl DriveAdapter {
    /// Adapter using stored OAuth tokens.
    pub fn new(config: &VfsConfig) -> Self {
        Self::with_dialer(config, Arc::new(OAuthDriveDialer::new(&config.gdrive)))
    }

    pub fn with_dialer(config: &VfsConfig, dialer: Arc<dyn DriveDialer>) -> Self {
        Self {
            shared: Arc::new(DriveShared {
                pool: ConnectionPool::new(DriveConnector { dialer }, PoolSettings::from(&config.pool)),
                ttl: config.cache.ttl_for("gdrive"),
                upload_chunks: config.gdrive.upload_buffer_chunks,
            }),
        }
    }

    pub fn pool(&self) -> &ConnectionPool<DriveConnector> {
        &self.shared.pool
    }
}

impl ProtocolAdapter for DriveAdapter {
    fn create(
        &self,
        _registry: &Arc<ProtocolRegistry>,
        locator: Locator,
        _params: &ExtraParams,
    ) -> VfsResult<NodeRef> {
        Ok(Arc::new(DriveNode::new(locator, self.shared.clone())))
    }
}

/// A file, folder or synthetic folder in a Drive account.
#[derive(Debug)]
pub struct DriveNode {
    locator: Locator,
    place: Place,
    shared: Arc<DriveShared>,
    cache: AttributeCache,
    /// The resource this node resolved to, if known.
    file: RwLock<Option<DriveFile>>,
}

impl DriveNode {
    fn new(locator: Locator, shared: Arc<DriveShared>) -> Self {
        let cache = AttributeCache::new(shared.ttl);
        Self {
            place: Place::of(&locator),
            locator,
            shared,
            cache,
            file: RwLock::new(None),
        }
    }

    fn sibling(&self, locator: Locator) -> DriveNode {
        DriveNode::new(locator, self.shared.clone())
    }

    fn not_found(&self) -> VfsError {
        VfsError::not_found(self.locator.redacted())
    }

    fn remember(&self, file: Option<DriveFile>) {
        *self.file.write() = file;
    }

    async fn call<T, F, Fut>(&self, op: FileOp, f: F) -> VfsResult<T>
    where
        F: FnOnce(Arc<dyn DriveApi>) -> Fut + Send,
        Fut: Future<Output = VfsResult<T>> + Send,
        T: Send,
    {
        let mut guard = self
            .shared
            .pool
            .acquire(&self.locator, false)
            .await
            .during(op, &self.locator)?;
        let api = guard
            .session()
            .await
            .map(|client| client.api.clone())
            .during(FileOp::Connect, &self.locator)?;
        let result = f(api).await;
        guard.check(result).during(op, &self.locator)
    }

    /// A client that outlives the guard, for uploads that run in the background.
    async fn client(&self, op: FileOp) -> VfsResult<Arc<dyn DriveApi>> {
        self.call(op, |api| async move { Ok(api) }).await
    }

    /// The resource behind this node, walking the path when the id is unknown.
    async fn resolve(&self, op: FileOp) -> VfsResult<DriveFile> {
        if let Some(file) = self.file.read().clone() {
            return Ok(file);
        }
        let file = self.lookup(op).await?;
        self.remember(Some(file.clone()));
        Ok(file)
    }

    async fn lookup(&self, op: FileOp) -> VfsResult<DriveFile> {
        let Place::Item(section) = self.place else {
            return Err(self.not_found());
        };
        let mut parent = (section == Section::MyDrive).then(|| ROOT_ID.to_string());
        let mut current = None;
        for name in self.locator.segments().skip(1) {
            let query = match &parent {
                Some(id) => DriveQuery::Named {
                    parent: id.clone(),
                    name: name.to_string(),
                    include_trashed: section.is_trash(),
                },
                None => section.listing(),
            };
            let found = self
                .call(op, move |api| async move { api.list(&query).await })
                .await?
                .into_iter()
                .find(|f| f.name == name)
                .ok_or_else(|| self.not_found())?;
            parent = Some(found.id.clone());
            current = Some(found);
        }
        current.ok_or_else(|| self.not_found())
    }

    /// Id of the folder new items at this locator go into.
    async fn parent_folder_id(&self, op: FileOp) -> VfsResult<String> {
        let parent = self.locator.parent().ok_or_else(|| self.not_found())?;
        let parent = self.sibling(parent);
        match parent.place {
            Place::Section(Section::MyDrive) => Ok(ROOT_ID.to_string()),
            Place::Item(Section::MyDrive | Section::Shared) => {
                let folder = parent.resolve(op).await?;
                if !folder.is_folder() {
                    return Err(VfsError::not_a_directory(parent.locator.redacted()));
                }
                Ok(folder.id)
            }
            _ => Err(VfsError::unsupported(op, &self.locator)),
        }
    }

    fn child_node(&self, file: DriveFile) -> DriveNode {
        let child = self.sibling(self.locator.child(&file.name));
        child.cache.prime(file.to_attributes());
        child.remember(Some(file));
        child
    }
}

#[async_trait]
impl FileNode for DriveNode {
    fn locator(&self) -> &Locator {
        &self.locator
    }

    fn attribute_cache(&self) -> &AttributeCache {
        &self.cache
    }

    async fn fetch_attributes(&self) -> VfsResult<FileAttributes> {
        let section = match self.place {
            Place::Root | Place::Section(_) => return Ok(FileAttributes::directory(0o500)),
            Place::Nowhere => return Err(self.not_found()),
            Place::Item(section) => section,
        };
        let known = self.file.read().as_ref().map(|f| f.id.clone());
        let file = match known {
            Some(id) => match self.call(FileOp::Stat, move |api| async move { api.get(&id).await }).await {
                Ok(file) => file,
                Err(e) if e.is_not_found() => {
                    self.remember(None);
                    self.lookup(FileOp::Stat).await?
                }
                Err(e) => return Err(e),
            },
            None => self.lookup(FileOp::Stat).await?,
        };
        if file.trashed != section.is_trash() || file.name != self.locator.name() {
            self.remember(None);
            return Err(self.not_found());
        }
        let attrs = file.to_attributes();
        self.remember(Some(file));
        Ok(attrs)
    }

    async fn list(&self) -> VfsResult<Vec<NodeRef>> {
        let query = match self.place {
            Place::Root => {
                let children = Section::iter()
                    .map(|s| {
                        let child = self.sibling(self.locator.child(&s.to_string()));
                        child.cache.prime(FileAttributes::directory(0o500));
                        Arc::new(child) as NodeRef
                    })
                    .collect();
                return Ok(children);
            }
            Place::Section(section) => section.listing(),
            Place::Item(section) => {
                let folder = self.resolve(FileOp::List).await?;
                if !folder.is_folder() {
                    return Err(VfsError::unsupported(FileOp::List, &self.locator));
                }
                DriveQuery::Children {
                    parent: folder.id,
                    include_trashed: section.is_trash(),
                }
            }
            Place::Nowhere => return Err(self.not_found()),
        };

        let files = self
            .call(FileOp::List, move |api| async move { api.list(&query).await })
            .await?;
        let mut children: Vec<DriveNode> = files
            .into_iter()
            .filter(|f| !f.name.is_empty() && !f.name.contains('/'))
            .map(|f| self.child_node(f))
            .collect();
        children.sort_by(|a, b| a.locator.name().cmp(b.locator.name()));
        debug!(locator = %self.locator.redacted(), count = children.len(), "listed");
        Ok(children.into_iter().map(|c| Arc::new(c) as NodeRef).collect())
    }

    async fn parent(&self) -> VfsResult<Option<NodeRef>> {
        Ok(self
            .locator
            .parent()
            .map(|p| Arc::new(self.sibling(p)) as NodeRef))
    }

    async fn input_stream(&self) -> VfsResult<ReadStream> {
        if !matches!(self.place, Place::Item(_)) {
            return Err(VfsError::unsupported(FileOp::Read, &self.locator));
        }
        let file = self.resolve(FileOp::Read).await?;
        if file.is_folder() {
            return Err(VfsError::unsupported(FileOp::Read, &self.locator));
        }
        self.call(FileOp::Read, move |api| async move { api.download(&file.id).await })
            .await
    }

    async fn output_stream(&self) -> VfsResult<WriteStream> {
        if self.place.writable_section().is_none() {
            return Err(VfsError::unsupported(FileOp::Write, &self.locator));
        }
        let target = match self.resolve(FileOp::Write).await {
            Ok(file) if file.is_folder() => {
                return Err(VfsError::unsupported(FileOp::Write, &self.locator));
            }
            Ok(file) => UploadTarget::Existing { id: file.id },
            Err(e) if e.is_not_found() => UploadTarget::New {
                parent: self.parent_folder_id(FileOp::Write).await?,
                name: self.locator.name().to_string(),
            },
            Err(e) => return Err(e),
        };
        let api = self.client(FileOp::Write).await?;
        self.cache.invalidate();
        self.remember(None);
        debug!(locator = %self.locator.redacted(), ?target, "starting upload");
        Ok(Box::pin(spawn_upload(api, target, self.shared.upload_chunks)))
    }

    async fn mkdir(&self) -> VfsResult<()> {
        if self.place.writable_section().is_none() {
            return Err(VfsError::unsupported(FileOp::Mkdir, &self.locator));
        }
        if self.exists().await? {
            return Err(VfsError::already_exists(self.locator.redacted()));
        }
        let parent = self.parent_folder_id(FileOp::Mkdir).await?;
        let name = self.locator.name().to_string();
        let folder = self
            .call(FileOp::Mkdir, move |api| async move {
                api.create_folder(&parent, &name).await
            })
            .await?;
        let attrs = folder.to_attributes();
        self.cache.update_local(|a| *a = attrs);
        self.remember(Some(folder));
        Ok(())
    }

    /// Trash the item, or delete it for good when it is already in the trash.
    async fn delete(&self) -> VfsResult<()> {
        let Place::Item(section) = self.place else {
            return Err(VfsError::unsupported(FileOp::Delete, &self.locator));
        };
        let file = self.resolve(FileOp::Delete).await?;
        let id = file.id;
        if section.is_trash() {
            self.call(FileOp::Delete, move |api| async move { api.delete(&id).await })
                .await?;
            info!(locator = %self.locator.redacted(), "deleted permanently");
        } else {
            let change = DriveUpdate {
                trashed: Some(true),
                ..DriveUpdate::default()
            };
            self.call(FileOp::Delete, move |api| async move {
                api.update(&id, &change).await
            })
            .await?;
            debug!(locator = %self.locator.redacted(), "moved to trash");
        }
        self.cache.update_local(|a| *a = FileAttributes::missing());
        self.remember(None);
        Ok(())
    }

    async fn rename_to(&self, target: &Locator) -> VfsResult<()> {
        if !self.locator.same_authority(target) {
            return Err(VfsError::CrossBackend {
                from: self.locator.redacted(),
                to: target.redacted(),
            });
        }
        let destination = self.sibling(target.clone());
        if self.place.writable_section().is_none() || destination.place.writable_section().is_none() {
            return Err(VfsError::unsupported(FileOp::Rename, &self.locator));
        }
        let file = self.resolve(FileOp::Rename).await?;
        let new_parent = destination.parent_folder_id(FileOp::Rename).await?;
        let old_parent = file.parents.first().cloned();

        let moving = old_parent.as_deref() != Some(new_parent.as_str());
        let change = DriveUpdate {
            name: (file.name != target.name()).then(|| target.name().to_string()),
            add_parent: moving.then(|| new_parent.clone()),
            remove_parent: if moving { old_parent } else { None },
            ..DriveUpdate::default()
        };
        let id = file.id;
        self.call(FileOp::Rename, move |api| async move { api.update(&id, &change).await })
            .await?;
        self.cache.update_local(|a| *a = FileAttributes::missing());
        self.remember(None);
        Ok(())
    }

    async fn change_modified(&self, time: SystemTime) -> VfsResult<()> {
        if self.place.writable_section().is_none() {
            return Err(VfsError::unsupported(FileOp::ChangeDate, &self.locator));
        }
        let file = self.resolve(FileOp::ChangeDate).await?;
        let change = DriveUpdate {
            modified_time: Some(DateTime::<Utc>::from(time)),
            ..DriveUpdate::default()
        };
        let id = file.id;
        let updated = self
            .call(FileOp::ChangeDate, move |api| async move {
                api.update(&id, &change).await
            })
            .await?;
        self.cache.patch(|a| a.modified = Some(time));
        self.remember(Some(updated));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::read_to_end;
    use tokio::io::AsyncWriteExt;

    fn setup() -> (Arc<ProtocolRegistry>, MemoryDrive) {
        let drive = MemoryDrive::new();
        let docs = drive.add_folder(ROOT_ID, "docs");
        drive.add_file(&docs, "plan.txt", "the plan");
        drive.add_file(ROOT_ID, "notes.txt", "notes");
        let old = drive.add_file(ROOT_ID, "old.txt", "stale");
        drive.set_trashed(&old, true);
        let theirs = drive.add_folder("elsewhere", "team");
        drive.share(&theirs);

        let config = VfsConfig::default();
        let registry = ProtocolRegistry::new(config.clone());
        registry.register(
            "gdrive",
            Arc::new(DriveAdapter::with_dialer(&config, Arc::new(drive.clone()))),
        );
        (registry, drive)
    }

    fn names(nodes: &[NodeRef]) -> Vec<String> {
        nodes.iter().map(|n| n.locator().name().to_string()).collect()
    }

    #[tokio::test]
    async fn root_has_three_synthetic_folders() {
        let (registry, drive) = setup();
        let root = registry.resolve_str("gdrive://me/").unwrap();
        let children = root.list().await.unwrap();
        assert_eq!(names(&children), ["My Drive", "Shared with me", "Trash"]);
        for child in &children {
            assert!(child.is_directory().await.unwrap());
        }
        assert_eq!(drive.calls(), 0);
    }

    #[tokio::test]
    async fn trashed_items_only_show_under_trash() {
        let (registry, _) = setup();
        let mine = registry.resolve_str("gdrive://me/My Drive").unwrap();
        assert_eq!(names(&mine.list().await.unwrap()), ["docs", "notes.txt"]);

        let trash = registry.resolve_str("gdrive://me/Trash").unwrap();
        assert_eq!(names(&trash.list().await.unwrap()), ["old.txt"]);

        let hidden = registry.resolve_str("gdrive://me/My Drive/old.txt").unwrap();
        assert!(!hidden.exists().await.unwrap());
        let trashed = registry.resolve_str("gdrive://me/Trash/old.txt").unwrap();
        assert!(trashed.exists().await.unwrap());
    }

    #[tokio::test]
    async fn shared_items_are_listed_by_name() {
        let (registry, _) = setup();
        let shared = registry.resolve_str("gdrive://me/Shared with me").unwrap();
        assert_eq!(names(&shared.list().await.unwrap()), ["team"]);
        let team = registry.resolve_str("gdrive://me/Shared with me/team").unwrap();
        assert!(team.is_directory().await.unwrap());
    }

    #[tokio::test]
    async fn nested_paths_resolve_through_parent_queries() {
        let (registry, drive) = setup();
        let plan = registry.resolve_str("gdrive://me/My Drive/docs/plan.txt").unwrap();
        assert_eq!(read_to_end(plan.as_ref()).await.unwrap(), b"the plan");
        assert_eq!(plan.size().await.unwrap(), 8);

        let unknown = registry.resolve_str("gdrive://me/Elsewhere/x").unwrap();
        assert!(!unknown.exists().await.unwrap());

        let listed = registry.resolve_str("gdrive://me/My Drive/docs").unwrap();
        let children = listed.list().await.unwrap();
        let before = drive.calls();
        assert_eq!(children[0].size().await.unwrap(), 8);
        assert_eq!(drive.calls(), before, "listing primes children");
    }

    #[tokio::test]
    async fn writes_create_then_replace_files() {
        let (registry, drive) = setup();
        let node = registry.resolve_str("gdrive://me/My Drive/docs/new.txt").unwrap();
        let mut out = node.output_stream().await.unwrap();
        out.write_all(b"first").await.unwrap();
        out.shutdown().await.unwrap();
        let created = drive.find("new.txt").unwrap();
        assert_eq!(drive.content(&created.id).unwrap(), b"first");

        let mut out = node.output_stream().await.unwrap();
        out.write_all(b"second").await.unwrap();
        out.shutdown().await.unwrap();
        assert_eq!(drive.content(&created.id).unwrap(), b"second");
        assert_eq!(node.size().await.unwrap(), 6);

        let section = registry.resolve_str("gdrive://me/Trash/x.txt").unwrap();
        assert!(section.output_stream().await.err().unwrap().is_unsupported());
    }

    #[tokio::test]
    async fn delete_trashes_then_purges() {
        let (registry, drive) = setup();
        let notes = registry.resolve_str("gdrive://me/My Drive/notes.txt").unwrap();
        let id = drive.find("notes.txt").unwrap().id;
        notes.delete().await.unwrap();
        assert!(!notes.exists().await.unwrap());
        assert!(drive.file(&id).unwrap().trashed);

        let trashed = registry.resolve_str("gdrive://me/Trash/notes.txt").unwrap();
        trashed.delete().await.unwrap();
        assert!(drive.file(&id).is_none());
    }

    #[tokio::test]
    async fn mkdir_is_visible_without_a_round_trip() {
        let (registry, drive) = setup();
        let dir = registry.resolve_str("gdrive://me/My Drive/docs/sub").unwrap();
        dir.mkdir().await.unwrap();
        let before = drive.calls();
        assert!(dir.is_directory().await.unwrap());
        assert_eq!(drive.calls(), before);
        assert!(drive.find("sub").unwrap().is_folder());

        let again = registry.resolve_str("gdrive://me/My Drive/docs/sub").unwrap();
        assert!(matches!(again.mkdir().await.unwrap_err().root(), VfsError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn rename_moves_between_folders() {
        let (registry, drive) = setup();
        let notes = registry.resolve_str("gdrive://me/My Drive/notes.txt").unwrap();
        let target = Locator::parse("gdrive://me/My Drive/docs/renamed.txt").unwrap();
        notes.rename_to(&target).await.unwrap();

        let moved = drive.find("renamed.txt").unwrap();
        let docs = drive.find("docs").unwrap();
        assert_eq!(moved.parents, vec![docs.id]);
        assert!(registry.resolve(&target).unwrap().exists().await.unwrap());
        assert!(!notes.exists().await.unwrap());
    }

    #[tokio::test]
    async fn auth_failures_evict_the_client() {
        let (registry, drive) = setup();
        let notes = registry.resolve_str("gdrive://me/My Drive/notes.txt").unwrap();
        assert!(notes.exists().await.unwrap());
        assert_eq!(drive.dials(), 1);

        drive.revoke(true);
        notes.attribute_cache().invalidate();
        assert!(notes.attributes().await.unwrap_err().is_auth());

        drive.revoke(false);
        assert!(notes.exists().await.unwrap());
        assert_eq!(drive.dials(), 2);
    }

    #[test]
    fn places_follow_the_first_segment() {
        let place = |s: &str| Place::of(&Locator::parse(s).unwrap());
        assert_eq!(place("gdrive://me/"), Place::Root);
        assert_eq!(place("gdrive://me/Trash"), Place::Section(Section::Trash));
        assert_eq!(place("gdrive://me/My Drive/a"), Place::Item(Section::MyDrive));
        assert_eq!(place("gdrive://me/Photos/a"), Place::Nowhere);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_before_the_next_call() {
        let (registry, drive) = setup();
        drive.set_token_lifetime(chrono::Duration::seconds(-5));
        let notes = registry.resolve_str("gdrive://me/My Drive/notes.txt").unwrap();
        assert!(notes.exists().await.unwrap());
        assert_eq!(drive.dials(), 1);

        notes.attribute_cache().invalidate();
        assert!(notes.exists().await.unwrap());
        assert_eq!(drive.dials(), 2, "pooled client with an expired token must be reopened");
    }

    #[tokio::test]
    async fn fresh_token_keeps_the_pooled_client() {
        let (registry, drive) = setup();
        drive.set_token_lifetime(chrono::Duration::hours(1));
        let notes = registry.resolve_str("gdrive://me/My Drive/notes.txt").unwrap();
        assert!(notes.exists().await.unwrap());
        notes.attribute_cache().invalidate();
        assert!(notes.exists().await.unwrap());
        assert_eq!(drive.dials(), 1);
    }
}
