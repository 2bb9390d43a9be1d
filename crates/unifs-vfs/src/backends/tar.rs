//! Read-only TAR archives.
//!
//! `tar://host/dir/archive.tar!/member/path?via=sftp` names a member of the
//! archive `sftp://host/dir/archive.tar`. Without `via` the archive is a
//! local file. The archive is scanned once, sequentially, and the resulting
//! index is shared by every node of that archive until the archive's size or
//! modification time changes. At most `cache.archive_indexes` indexes are
//! kept; the least recently used one is dropped first.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read, SeekFrom};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info, instrument};

use crate::attr_cache::AttributeCache;
use crate::config::VfsConfig;
use crate::error::{FileOp, ResultExt, VfsError, VfsResult};
use crate::locator::Locator;
use crate::node::{FileNode, NodeRef};
use crate::registry::{ExtraParams, ProtocolAdapter, ProtocolRegistry};
use crate::types::{FileAttributes, ReadStream};

/// Marks the end of the archive path inside a `tar://` locator.
const ARCHIVE_SEPARATOR: char = '!';

/// Query key holding the archive's own scheme.
pub const VIA_KEY: &str = "via";

/// Symlink hops followed inside an archive before giving up.
const MAX_LINK_HOPS: usize = 8;

/// Whether a file name looks like a TAR archive.
pub fn is_archive_name(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".tar")
}

/// The `tar://` locator of the root of the archive at `archive`.
pub fn archive_root_locator(archive: &Locator) -> Locator {
    let root = archive
        .with_scheme("tar")
        .with_path(&format!("{}{ARCHIVE_SEPARATOR}", archive.path()));
    if archive.scheme() == "file" {
        root.with_query(None)
    } else {
        root.with_query_pairs([(VIA_KEY, archive.scheme())])
    }
}

/// Split a `tar://` locator into the archive locator and the member path.
///
/// Member paths have no leading or trailing slash; the archive root is `""`.
fn split_locator(locator: &Locator) -> VfsResult<(Locator, String)> {
    let segments: Vec<&str> = locator.segments().collect();
    let cut = segments
        .iter()
        .position(|s| s.ends_with(ARCHIVE_SEPARATOR))
        .ok_or_else(|| {
            VfsError::invalid_path(format!(
                "{} has no '{ARCHIVE_SEPARATOR}' after the archive name",
                locator.redacted()
            ))
        })?;
    let mut archive_path = format!("/{}", segments[..=cut].join("/"));
    archive_path.pop();
    let member = segments[cut + 1..].join("/");

    let via = locator.query_value(VIA_KEY).unwrap_or_else(|| "file".to_string());
    let archive = locator
        .with_scheme(&via)
        .with_path(&archive_path)
        .with_query(None);
    Ok((archive, member))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// One indexed member.
#[derive(Debug, Clone, PartialEq)]
pub struct TarEntry {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub modified: Option<SystemTime>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub link_target: Option<String>,
    /// Offset of the member's header block; `None` for implied directories.
    pub header_offset: Option<u64>,
    /// Offset of the member's first data byte.
    pub data_offset: u64,
}

impl TarEntry {
    fn implied_directory(path: String) -> Self {
        Self {
            path,
            kind: EntryKind::Directory,
            size: 0,
            mode: 0o755,
            modified: None,
            owner: None,
            group: None,
            link_target: None,
            header_offset: None,
            data_offset: 0,
        }
    }

    fn to_attributes(&self) -> FileAttributes {
        let attrs = match self.kind {
            EntryKind::Directory => FileAttributes::directory(self.mode),
            _ => FileAttributes::file(self.size, self.mode),
        };
        let mut attrs = attrs
            .with_modified(self.modified)
            .with_owner(self.owner.clone(), self.group.clone());
        attrs.is_symlink = self.kind == EntryKind::Symlink;
        attrs
    }
}

/// Every member of one archive, by path.
#[derive(Debug, Default)]
pub struct TarIndex {
    entries: BTreeMap<String, TarEntry>,
    children: BTreeMap<String, BTreeSet<String>>,
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(parent, _)| parent)
}

fn clean_member_path(raw: &str) -> String {
    raw.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

impl TarIndex {
    /// Scan an archive front to back.
    pub fn build(reader: impl Read) -> io::Result<Self> {
        let mut index = TarIndex::default();
        let mut archive = tar::Archive::new(reader);
        for entry in archive.entries()? {
            let entry = entry?;
            let raw_path = entry.path()?.to_string_lossy().into_owned();
            let path = clean_member_path(&raw_path);
            if path.is_empty() {
                continue;
            }
            let header = entry.header();
            let kind = match header.entry_type() {
                tar::EntryType::Directory => EntryKind::Directory,
                _ if raw_path.ends_with('/') => EntryKind::Directory,
                tar::EntryType::Symlink => EntryKind::Symlink,
                tar::EntryType::Regular | tar::EntryType::Continuous => EntryKind::File,
                _ => EntryKind::Other,
            };
            let link_target = entry
                .link_name()?
                .map(|l| l.to_string_lossy().into_owned());
            let owner = match header.username() {
                Ok(Some(name)) if !name.is_empty() => Some(name.to_string()),
                _ => header.uid().ok().map(|uid| uid.to_string()),
            };
            let group = match header.groupname() {
                Ok(Some(name)) if !name.is_empty() => Some(name.to_string()),
                _ => header.gid().ok().map(|gid| gid.to_string()),
            };
            let record = TarEntry {
                kind,
                size: if kind == EntryKind::Directory { 0 } else { header.size()? },
                mode: header.mode()? & 0o7777,
                modified: header
                    .mtime()
                    .ok()
                    .map(|secs| UNIX_EPOCH + Duration::from_secs(secs)),
                owner,
                group,
                link_target,
                header_offset: Some(entry.raw_header_position()),
                data_offset: entry.raw_file_position(),
                path: path.clone(),
            };
            index.insert(record);
        }
        Ok(index)
    }

    fn insert(&mut self, entry: TarEntry) {
        let mut path = entry.path.clone();
        self.entries.insert(path.clone(), entry);
        while !path.is_empty() {
            let parent = parent_of(&path).to_string();
            let name = path[parent.len()..].trim_start_matches('/').to_string();
            self.children.entry(parent.clone()).or_default().insert(name);
            if !parent.is_empty() && !self.entries.contains_key(&parent) {
                self.entries
                    .insert(parent.clone(), TarEntry::implied_directory(parent.clone()));
            }
            path = parent;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&TarEntry> {
        self.entries.get(path)
    }

    /// Names directly under `dir`, sorted.
    pub fn children(&self, dir: &str) -> impl Iterator<Item = &str> {
        self.children
            .get(dir)
            .into_iter()
            .flat_map(|names| names.iter().map(String::as_str))
    }

    /// Follow symlinks to the entry they finally name.
    pub fn resolve(&self, path: &str) -> Option<&TarEntry> {
        let mut entry = self.entries.get(path)?;
        for _ in 0..MAX_LINK_HOPS {
            let (EntryKind::Symlink, Some(target)) = (entry.kind, &entry.link_target) else {
                return Some(entry);
            };
            let joined = if target.starts_with('/') {
                target.clone()
            } else {
                format!("{}/{}", parent_of(&entry.path), target)
            };
            entry = self.entries.get(&normalize_member(&joined))?;
        }
        None
    }
}

/// Resolve `.` and `..` in a member path.
fn normalize_member(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            s => out.push(s),
        }
    }
    out.join("/")
}

/// What an index was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ArchiveStamp {
    size: u64,
    modified: Option<SystemTime>,
}

#[derive(Debug)]
struct CachedIndex {
    stamp: ArchiveStamp,
    index: Arc<TarIndex>,
    last_used: AtomicU64,
}

#[derive(Debug)]
struct TarShared {
    indexes: DashMap<Locator, CachedIndex>,
    /// Logical clock ordering index uses.
    uses: AtomicU64,
    capacity: usize,
    ttl: Duration,
}

impl TarShared {
    fn tick(&self) -> u64 {
        self.uses.fetch_add(1, Ordering::Relaxed)
    }

    /// The cached index if it was built from this stamp. A stale one is
    /// dropped.
    fn lookup(&self, archive: &Locator, stamp: ArchiveStamp) -> Option<Arc<TarIndex>> {
        if let Some(cached) = self.indexes.get(archive)
            && cached.stamp == stamp
        {
            cached.last_used.store(self.tick(), Ordering::Relaxed);
            return Some(cached.index.clone());
        }
        if self
            .indexes
            .remove_if(archive, |_, cached| cached.stamp != stamp)
            .is_some()
        {
            debug!(archive = %archive.redacted(), "dropped stale archive index");
        }
        None
    }

    fn forget(&self, archive: &Locator) {
        if self.indexes.remove(archive).is_some() {
            debug!(archive = %archive.redacted(), "dropped index of missing archive");
        }
    }

    fn store(&self, archive: Locator, stamp: ArchiveStamp, index: Arc<TarIndex>) {
        let cached = CachedIndex {
            stamp,
            index,
            last_used: AtomicU64::new(self.tick()),
        };
        self.indexes.insert(archive, cached);
        while self.indexes.len() > self.capacity {
            let oldest = self
                .indexes
                .iter()
                .min_by_key(|e| e.value().last_used.load(Ordering::Relaxed))
                .map(|e| e.key().clone());
            let Some(oldest) = oldest else { break };
            self.indexes.remove(&oldest);
            debug!(archive = %oldest.redacted(), "evicted archive index");
        }
    }
}

/// Adapter for `tar://` locators.
#[derive(Debug, Clone)]
pub struct TarAdapter {
    shared: Arc<TarShared>,
}

impl TarAdapter {
    pub fn new(config: &VfsConfig) -> Self {
        Self {
            shared: Arc::new(TarShared {
                indexes: DashMap::new(),
                uses: AtomicU64::new(0),
                capacity: config.cache.archive_indexes.max(1),
                ttl: config.cache.ttl_for("tar"),
            }),
        }
    }

    /// Archives with a cached index.
    pub fn indexed_archives(&self) -> usize {
        self.shared.indexes.len()
    }

    pub fn is_indexed(&self, archive: &Locator) -> bool {
        self.shared.indexes.contains_key(archive)
    }
}

impl ProtocolAdapter for TarAdapter {
    fn create(
        &self,
        registry: &Arc<ProtocolRegistry>,
        locator: Locator,
        _params: &ExtraParams,
    ) -> VfsResult<NodeRef> {
        let (archive, member) = split_locator(&locator)?;
        Ok(Arc::new(TarNode {
            cache: AttributeCache::new(self.shared.ttl),
            locator,
            archive,
            member,
            registry: registry.clone(),
            shared: self.shared.clone(),
        }))
    }
}

/// A member of a TAR archive, or the archive root.
#[derive(Debug)]
pub struct TarNode {
    locator: Locator,
    archive: Locator,
    member: String,
    registry: Arc<ProtocolRegistry>,
    shared: Arc<TarShared>,
    cache: AttributeCache,
}

impl TarNode {
    /// The archive this member lives in.
    pub fn archive(&self) -> &Locator {
        &self.archive
    }

    fn sibling(&self, member: String) -> TarNode {
        let path = format!(
            "{}{ARCHIVE_SEPARATOR}/{member}",
            self.archive.path()
        );
        TarNode {
            locator: self
                .locator
                .with_path(&path)
                .with_query(self.locator.query()),
            archive: self.archive.clone(),
            member,
            registry: self.registry.clone(),
            shared: self.shared.clone(),
            cache: AttributeCache::new(self.shared.ttl),
        }
    }

    fn not_found(&self) -> VfsError {
        VfsError::not_found(self.locator.redacted())
    }

    /// The archive index, rebuilt when the archive changed.
    #[instrument(skip(self), fields(archive = %self.archive.redacted()))]
    async fn index(&self) -> VfsResult<Arc<TarIndex>> {
        let archive = self.registry.resolve(&self.archive)?;
        let attrs = archive.attributes().await?;
        if !attrs.exists {
            self.shared.forget(&self.archive);
            return Err(VfsError::not_found(self.archive.redacted()));
        }
        let stamp = ArchiveStamp {
            size: attrs.size,
            modified: attrs.modified,
        };
        if let Some(index) = self.shared.lookup(&self.archive, stamp) {
            return Ok(index);
        }

        let stream = archive.input_stream().await?;
        let bridge = SyncIoBridge::new(stream);
        let index = tokio::task::spawn_blocking(move || TarIndex::build(bridge))
            .await
            .map_err(|e| VfsError::other(format!("archive scan task failed: {e}")))?
            .map_err(|e| VfsError::from_io(e, &self.archive))?;
        let index = Arc::new(index);
        info!(entries = index.len(), "indexed archive");
        self.shared.store(self.archive.clone(), stamp, index.clone());
        Ok(index)
    }

    /// Stream `len` bytes starting at `offset` of the archive.
    async fn open_range(&self, offset: u64, len: u64) -> VfsResult<ReadStream> {
        let archive = self.registry.resolve(&self.archive)?;
        match archive.random_read().await {
            Ok(mut reader) => {
                reader
                    .seek(SeekFrom::Start(offset))
                    .await
                    .map_err(|e| VfsError::from_io(e, &self.archive))?;
                Ok(Box::pin(reader.take(len)))
            }
            Err(e) if e.is_unsupported() => {
                let mut stream = archive.input_stream().await?;
                let skipped = tokio::io::copy(&mut (&mut stream).take(offset), &mut tokio::io::sink())
                    .await
                    .map_err(|e| VfsError::from_io(e, &self.archive))?;
                if skipped < offset {
                    return Err(VfsError::other(format!(
                        "{} ended before offset {offset}",
                        self.archive.redacted()
                    )));
                }
                Ok(Box::pin(stream.take(len)))
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl FileNode for TarNode {
    fn locator(&self) -> &Locator {
        &self.locator
    }

    fn attribute_cache(&self) -> &AttributeCache {
        &self.cache
    }

    async fn fetch_attributes(&self) -> VfsResult<FileAttributes> {
        let index = self.index().await?;
        if self.member.is_empty() {
            return Ok(FileAttributes::directory(0o555));
        }
        let entry = index.get(&self.member).ok_or_else(|| self.not_found())?;
        if entry.kind != EntryKind::Symlink {
            return Ok(entry.to_attributes());
        }
        // Links describe their target, like on a real filesystem.
        Ok(match index.resolve(&self.member) {
            Some(target) => {
                let mut attrs = target.to_attributes();
                attrs.is_symlink = true;
                attrs
            }
            None => entry.to_attributes(),
        })
    }

    async fn list(&self) -> VfsResult<Vec<NodeRef>> {
        let index = self.index().await.during(FileOp::List, &self.locator)?;
        if !self.member.is_empty() {
            let entry = index
                .resolve(&self.member)
                .ok_or_else(|| self.not_found())?;
            if entry.kind != EntryKind::Directory {
                return Err(VfsError::unsupported(FileOp::List, &self.locator));
            }
        }
        let dir = match index.resolve(&self.member) {
            Some(entry) if !self.member.is_empty() => entry.path.clone(),
            _ => String::new(),
        };
        let children: Vec<NodeRef> = index
            .children(&dir)
            .map(|name| {
                let member = if self.member.is_empty() {
                    name.to_string()
                } else {
                    format!("{}/{name}", self.member)
                };
                let inner = if dir.is_empty() {
                    name.to_string()
                } else {
                    format!("{dir}/{name}")
                };
                let child = self.sibling(member);
                if let Some(entry) = index.get(&inner)
                    && entry.kind != EntryKind::Symlink
                {
                    child.cache.prime(entry.to_attributes());
                }
                Arc::new(child) as NodeRef
            })
            .collect();
        debug!(locator = %self.locator.redacted(), count = children.len(), "listed archive");
        Ok(children)
    }

    /// The archive root's parent is the directory holding the archive.
    async fn parent(&self) -> VfsResult<Option<NodeRef>> {
        if self.member.is_empty() {
            return match self.archive.parent() {
                Some(dir) => self.registry.resolve(&dir).map(Some),
                None => Ok(None),
            };
        }
        let parent = parent_of(&self.member).to_string();
        Ok(Some(Arc::new(self.sibling(parent))))
    }

    async fn input_stream(&self) -> VfsResult<ReadStream> {
        let index = self.index().await.during(FileOp::Read, &self.locator)?;
        let entry = index
            .resolve(&self.member)
            .ok_or_else(|| self.not_found())
            .during(FileOp::Read, &self.locator)?;
        if self.member.is_empty() || entry.kind != EntryKind::File {
            return Err(VfsError::unsupported(FileOp::Read, &self.locator));
        }
        self.open_range(entry.data_offset, entry.size)
            .await
            .during(FileOp::Read, &self.locator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::read_to_end;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_archive(path: &Path, files: &[(&str, &str)]) {
        let mut builder = tar::Builder::new(std::fs::File::create(path).unwrap());
        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o755);
        builder.append_data(&mut dir, "docs/", io::empty()).unwrap();
        for (name, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(1_700_000_000);
            builder.append_data(&mut header, name, body.as_bytes()).unwrap();
        }
        let mut link = tar::Header::new_gnu();
        link.set_entry_type(tar::EntryType::Symlink);
        link.set_size(0);
        link.set_mode(0o777);
        builder.append_link(&mut link, "docs/latest", "a.txt").unwrap();
        builder.finish().unwrap();
    }

    fn setup() -> (TempDir, Arc<ProtocolRegistry>, Locator) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bundle.tar");
        write_archive(
            &path,
            &[("docs/a.txt", "alpha"), ("src/lib/x.rs", "fn x() {}"), ("top.txt", "top")],
        );
        let registry = ProtocolRegistry::with_defaults(VfsConfig::default());
        let root = archive_root_locator(&Locator::from_local_path(&path));
        (tmp, registry, root)
    }

    fn names(nodes: &[NodeRef]) -> Vec<String> {
        nodes.iter().map(|n| n.locator().name().to_string()).collect()
    }

    #[test]
    fn archive_locators_round_trip() {
        let remote = Locator::parse("sftp://amy@host/srv/a.tar").unwrap();
        let root = archive_root_locator(&remote);
        assert_eq!(root.to_string(), "tar://amy@host/srv/a.tar!?via=sftp");
        let (archive, member) = split_locator(&root.child("x").with_query(root.query())).unwrap();
        assert_eq!(archive, remote);
        assert_eq!(member, "x");

        let local = Locator::from_local_path(Path::new("/tmp/b.TAR"));
        assert!(is_archive_name(local.name()));
        assert_eq!(archive_root_locator(&local).query(), None);
        assert!(split_locator(&Locator::parse("tar:///tmp/b.tar").unwrap()).is_err());
    }

    #[tokio::test]
    async fn lists_explicit_and_implied_directories() {
        let (_tmp, registry, root) = setup();
        let root = registry.resolve(&root).unwrap();
        assert!(root.is_directory().await.unwrap());
        let children = root.list().await.unwrap();
        assert_eq!(names(&children), ["docs", "src", "top.txt"]);
        assert!(children[1].is_directory().await.unwrap());

        let lib = children[1].list().await.unwrap();
        assert_eq!(names(&lib), ["lib"]);
        let files = lib[0].list().await.unwrap();
        assert_eq!(names(&files), ["x.rs"]);
        assert_eq!(files[0].size().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn members_read_their_own_bytes() {
        let (_tmp, registry, root) = setup();
        let docs = registry.resolve(&root).unwrap().list().await.unwrap()[0].clone();
        let entries = docs.list().await.unwrap();
        assert_eq!(names(&entries), ["a.txt", "latest"]);
        assert_eq!(read_to_end(entries[0].as_ref()).await.unwrap(), b"alpha");

        let link = &entries[1];
        assert!(link.is_symlink().await.unwrap());
        assert_eq!(link.size().await.unwrap(), 5);
        assert_eq!(read_to_end(link.as_ref()).await.unwrap(), b"alpha");
    }

    #[tokio::test]
    async fn archives_are_read_only() {
        let (_tmp, registry, root) = setup();
        let top = registry.resolve(&root).unwrap().list().await.unwrap()[2].clone();
        assert!(top.output_stream().await.err().unwrap().is_unsupported());
        assert!(top.delete().await.unwrap_err().is_unsupported());
        assert!(top.mkdir().await.unwrap_err().is_unsupported());
        assert!(top.list().await.unwrap_err().is_unsupported());
    }

    #[tokio::test]
    async fn index_is_rebuilt_when_the_archive_changes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("live.tar");
        write_archive(&path, &[("one.txt", "1")]);
        let adapter = TarAdapter::new(&VfsConfig::default());
        let registry = ProtocolRegistry::with_defaults(VfsConfig::default());
        registry.register("tar", Arc::new(adapter.clone()));
        let root = archive_root_locator(&Locator::from_local_path(&path));

        let listed = registry.resolve(&root).unwrap().list().await.unwrap();
        assert_eq!(names(&listed), ["docs", "one.txt"]);
        assert_eq!(adapter.indexed_archives(), 1);

        write_archive(&path, &[("one.txt", "1"), ("two.txt", "22")]);
        let listed = registry.resolve(&root).unwrap().list().await.unwrap();
        assert_eq!(names(&listed), ["docs", "one.txt", "two.txt"]);
        assert_eq!(adapter.indexed_archives(), 1);
    }

    #[tokio::test]
    async fn index_of_a_removed_archive_is_dropped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gone.tar");
        write_archive(&path, &[("one.txt", "1")]);
        let adapter = TarAdapter::new(&VfsConfig::default());
        let registry = ProtocolRegistry::with_defaults(VfsConfig::default());
        registry.register("tar", Arc::new(adapter.clone()));
        let root = archive_root_locator(&Locator::from_local_path(&path));
        registry.resolve(&root).unwrap().list().await.unwrap();
        assert_eq!(adapter.indexed_archives(), 1);

        std::fs::remove_file(&path).unwrap();
        let err = registry.resolve(&root).unwrap().list().await.unwrap_err();
        assert!(err.is_not_found(), "{err}");
        assert_eq!(adapter.indexed_archives(), 0);
    }

    #[tokio::test]
    async fn least_recently_used_index_is_evicted() {
        let tmp = TempDir::new().unwrap();
        let mut config = VfsConfig::default();
        config.cache.archive_indexes = 2;
        let adapter = TarAdapter::new(&config);
        let registry = ProtocolRegistry::with_defaults(config);
        registry.register("tar", Arc::new(adapter.clone()));

        let mut archives = Vec::new();
        for name in ["a.tar", "b.tar", "c.tar"] {
            let path = tmp.path().join(name);
            write_archive(&path, &[("one.txt", "1")]);
            archives.push(Locator::from_local_path(&path));
        }
        let list = |archive: &Locator| {
            let node = registry.resolve(&archive_root_locator(archive)).unwrap();
            async move { node.list().await.unwrap() }
        };

        list(&archives[0]).await;
        list(&archives[1]).await;
        list(&archives[0]).await;
        list(&archives[2]).await;
        assert_eq!(adapter.indexed_archives(), 2);
        assert!(adapter.is_indexed(&archives[0]));
        assert!(!adapter.is_indexed(&archives[1]));
        assert!(adapter.is_indexed(&archives[2]));
    }

    #[tokio::test]
    async fn tar_files_are_browsable_as_their_root() {
        let (tmp, registry, _) = setup();
        let file = registry
            .resolve(&Locator::from_local_path(&tmp.path().join("bundle.tar")))
            .unwrap();
        let root = registry.as_browsable(file).await.unwrap().unwrap();
        assert_eq!(root.locator().scheme(), "tar");
        let parent = root.parent().await.unwrap().unwrap();
        assert_eq!(parent.locator(), &Locator::from_local_path(tmp.path()));
    }
}
