//! In-memory SFTP server for tests.
//!
//! Counts round trips and dials so tests can assert what the node layer
//! caches, and can refuse a password or drop the connection on demand.

use std::collections::BTreeMap;
use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;

use super::channel::{RemoteAttrs, RemoteEntry, RemoteKind, SftpChannel, SftpDialer};
use crate::error::{VfsError, VfsResult};
use crate::pool::ConnectionKey;
use crate::types::{RandomReadStream, ReadStream, WriteStream};

const MAX_LINK_DEPTH: usize = 8;

#[derive(Debug, Clone)]
enum MemKind {
    File(Vec<u8>),
    Dir,
    Symlink(String),
}

#[derive(Debug, Clone)]
struct MemEntry {
    kind: MemKind,
    mode: u32,
    mtime: u32,
}

impl MemEntry {
    fn attrs(&self) -> RemoteAttrs {
        let (kind, size) = match &self.kind {
            MemKind::File(data) => (RemoteKind::File, data.len() as u64),
            MemKind::Dir => (RemoteKind::Directory, 0),
            MemKind::Symlink(target) => (RemoteKind::Symlink, target.len() as u64),
        };
        RemoteAttrs {
            kind,
            size,
            permissions: self.mode,
            mtime: Some(self.mtime),
            owner: Some("sftp".into()),
            group: Some("sftp".into()),
        }
    }
}

#[derive(Debug, Default)]
struct MemState {
    tree: Mutex<BTreeMap<String, MemEntry>>,
    calls: AtomicUsize,
    dials: AtomicUsize,
    password: Mutex<Option<String>>,
    broken: AtomicBool,
}

/// An in-memory SFTP tree that is both the dialer and the session.
#[derive(Debug, Clone)]
pub struct MemorySftp {
    state: Arc<MemState>,
}

impl Default for MemorySftp {
    fn default() -> Self {
        Self::new()
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

fn is_child(dir: &str, path: &str) -> bool {
    path != dir && parent_of(path) == dir
}

impl MemorySftp {
    pub fn new() -> Self {
        let sftp = Self {
            state: Arc::new(MemState::default()),
        };
        sftp.state.tree.lock().insert(
            "/".into(),
            MemEntry {
                kind: MemKind::Dir,
                mode: 0o755,
                mtime: 0,
            },
        );
        sftp
    }

    /// Create a directory and its missing parents.
    pub fn add_dir(&self, path: &str) -> &Self {
        let mut tree = self.state.tree.lock();
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            tree.entry(current.clone()).or_insert(MemEntry {
                kind: MemKind::Dir,
                mode: 0o755,
                mtime: 0,
            });
        }
        self
    }

    pub fn add_file(&self, path: &str, data: impl Into<Vec<u8>>) -> &Self {
        self.add_dir(parent_of(path));
        self.state.tree.lock().insert(
            path.into(),
            MemEntry {
                kind: MemKind::File(data.into()),
                mode: 0o644,
                mtime: 0,
            },
        );
        self
    }

    pub fn add_symlink(&self, path: &str, target: &str) -> &Self {
        self.add_dir(parent_of(path));
        self.state.tree.lock().insert(
            path.into(),
            MemEntry {
                kind: MemKind::Symlink(target.into()),
                mode: 0o777,
                mtime: 0,
            },
        );
        self
    }

    /// Reject dials that do not carry this password.
    pub fn require_password(&self, password: &str) -> &Self {
        *self.state.password.lock() = Some(password.into());
        self
    }

    /// Fail every call with a transport error until [`repair`](Self::repair).
    pub fn break_connection(&self) {
        self.state.broken.store(true, Ordering::SeqCst);
    }

    pub fn repair(&self) {
        self.state.broken.store(false, Ordering::SeqCst);
    }

    /// Remote calls served so far.
    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Sessions opened so far.
    pub fn dials(&self) -> usize {
        self.state.dials.load(Ordering::SeqCst)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.state.tree.lock().contains_key(path)
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.tree.lock().get(path).map(|e| &e.kind) {
            Some(MemKind::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn mode(&self, path: &str) -> Option<u32> {
        self.state.tree.lock().get(path).map(|e| e.mode)
    }

    fn begin(&self) -> VfsResult<()> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        if self.state.broken.load(Ordering::SeqCst) {
            return Err(VfsError::transport("memory", "connection reset"));
        }
        Ok(())
    }

    /// Follow symlinks from `path` to a non-link entry path.
    fn resolve(tree: &BTreeMap<String, MemEntry>, path: &str) -> VfsResult<String> {
        let mut current = path.to_string();
        for _ in 0..MAX_LINK_DEPTH {
            match tree.get(&current).map(|e| &e.kind) {
                None => return Err(VfsError::not_found(path)),
                Some(MemKind::Symlink(target)) => {
                    current = if target.starts_with('/') {
                        target.clone()
                    } else {
                        join(parent_of(&current), target)
                    };
                }
                Some(_) => return Ok(current),
            }
        }
        Err(VfsError::other(format!("{path}: too many levels of symbolic links")))
    }

    fn file_data(&self, path: &str) -> VfsResult<Vec<u8>> {
        let tree = self.state.tree.lock();
        let resolved = Self::resolve(&tree, path)?;
        match tree.get(&resolved).map(|e| &e.kind) {
            Some(MemKind::File(data)) => Ok(data.clone()),
            Some(_) => Err(VfsError::other(format!("{path}: not a regular file"))),
            None => Err(VfsError::not_found(path)),
        }
    }

    fn require_dir(tree: &BTreeMap<String, MemEntry>, path: &str) -> VfsResult<()> {
        match tree.get(path).map(|e| &e.kind) {
            Some(MemKind::Dir) => Ok(()),
            Some(_) => Err(VfsError::not_a_directory(path)),
            None => Err(VfsError::not_found(path)),
        }
    }
}

#[async_trait]
impl SftpDialer for MemorySftp {
    async fn dial(&self, key: &ConnectionKey) -> VfsResult<Arc<dyn SftpChannel>> {
        self.state.dials.fetch_add(1, Ordering::SeqCst);
        if let Some(expected) = self.state.password.lock().as_deref()
            && key.password() != Some(expected)
        {
            return Err(VfsError::auth(key.to_string(), "password rejected"));
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl SftpChannel for MemorySftp {
    async fn lstat(&self, path: &str) -> VfsResult<RemoteAttrs> {
        self.begin()?;
        self.state
            .tree
            .lock()
            .get(path)
            .map(MemEntry::attrs)
            .ok_or_else(|| VfsError::not_found(path))
    }

    async fn stat(&self, path: &str) -> VfsResult<RemoteAttrs> {
        self.begin()?;
        let tree = self.state.tree.lock();
        let resolved = Self::resolve(&tree, path)?;
        tree.get(&resolved)
            .map(MemEntry::attrs)
            .ok_or_else(|| VfsError::not_found(path))
    }

    async fn canonicalize(&self, path: &str) -> VfsResult<String> {
        self.begin()?;
        if path == "." {
            return Ok("/".into());
        }
        Self::resolve(&self.state.tree.lock(), path)
    }

    async fn read_dir(&self, path: &str) -> VfsResult<Vec<RemoteEntry>> {
        self.begin()?;
        let tree = self.state.tree.lock();
        let dir = Self::resolve(&tree, path)?;
        Self::require_dir(&tree, &dir)?;
        let mut entries = vec![
            RemoteEntry {
                name: ".".into(),
                attrs: tree[&dir].attrs(),
            },
            RemoteEntry {
                name: "..".into(),
                attrs: tree[parent_of(&dir)].attrs(),
            },
        ];
        entries.extend(tree.iter().filter(|(p, _)| is_child(&dir, p)).map(|(p, e)| {
            RemoteEntry {
                name: p.rsplit('/').next().unwrap_or_default().to_string(),
                attrs: e.attrs(),
            }
        }));
        Ok(entries)
    }

    async fn open_read(&self, path: &str) -> VfsResult<ReadStream> {
        self.begin()?;
        Ok(Box::pin(Cursor::new(self.file_data(path)?)))
    }

    async fn open_random(&self, path: &str) -> VfsResult<RandomReadStream> {
        self.begin()?;
        Ok(Box::pin(Cursor::new(self.file_data(path)?)))
    }

    async fn open_write(&self, path: &str, append: bool) -> VfsResult<WriteStream> {
        self.begin()?;
        let mut tree = self.state.tree.lock();
        Self::require_dir(&tree, parent_of(path))?;
        match tree.get_mut(path) {
            Some(MemEntry {
                kind: MemKind::File(data),
                ..
            }) => {
                if !append {
                    data.clear();
                }
            }
            Some(_) => return Err(VfsError::other(format!("{path}: not a regular file"))),
            None => {
                tree.insert(
                    path.into(),
                    MemEntry {
                        kind: MemKind::File(Vec::new()),
                        mode: 0o644,
                        mtime: 0,
                    },
                );
            }
        }
        Ok(Box::pin(MemWriter {
            state: self.state.clone(),
            path: path.into(),
        }))
    }

    async fn mkdir(&self, path: &str) -> VfsResult<()> {
        self.begin()?;
        let mut tree = self.state.tree.lock();
        Self::require_dir(&tree, parent_of(path))?;
        if tree.contains_key(path) {
            return Err(VfsError::already_exists(path));
        }
        tree.insert(
            path.into(),
            MemEntry {
                kind: MemKind::Dir,
                mode: 0o755,
                mtime: 0,
            },
        );
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> VfsResult<()> {
        self.begin()?;
        let mut tree = self.state.tree.lock();
        match tree.get(path).map(|e| &e.kind) {
            None => Err(VfsError::not_found(path)),
            Some(MemKind::Dir) => Err(VfsError::other(format!("{path}: is a directory"))),
            Some(_) => {
                tree.remove(path);
                Ok(())
            }
        }
    }

    async fn remove_dir(&self, path: &str) -> VfsResult<()> {
        self.begin()?;
        let mut tree = self.state.tree.lock();
        Self::require_dir(&tree, path)?;
        if tree.keys().any(|p| is_child(path, p)) {
            return Err(VfsError::DirectoryNotEmpty(path.into()));
        }
        tree.remove(path);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        self.begin()?;
        let mut tree = self.state.tree.lock();
        if !tree.contains_key(from) {
            return Err(VfsError::not_found(from));
        }
        if tree.contains_key(to) {
            return Err(VfsError::already_exists(to));
        }
        Self::require_dir(&tree, parent_of(to))?;
        let prefix = format!("{from}/");
        let moved: Vec<String> = tree
            .keys()
            .filter(|p| p.as_str() == from || p.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(entry) = tree.remove(&old) {
                let new = format!("{to}{}", &old[from.len()..]);
                tree.insert(new, entry);
            }
        }
        Ok(())
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> VfsResult<()> {
        self.begin()?;
        let mut tree = self.state.tree.lock();
        let entry = tree.get_mut(path).ok_or_else(|| VfsError::not_found(path))?;
        entry.mode = mode & 0o7777;
        Ok(())
    }

    async fn set_mtime(&self, path: &str, mtime: u32) -> VfsResult<()> {
        self.begin()?;
        let mut tree = self.state.tree.lock();
        let entry = tree.get_mut(path).ok_or_else(|| VfsError::not_found(path))?;
        entry.mtime = mtime;
        Ok(())
    }
}

struct MemWriter {
    state: Arc<MemState>,
    path: String,
}

impl AsyncWrite for MemWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut tree = self.state.tree.lock();
        match tree.get_mut(&self.path).map(|e| &mut e.kind) {
            Some(MemKind::File(data)) => {
                data.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            }
            _ => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} vanished during write", self.path),
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listing_includes_dot_entries_and_direct_children_only() {
        let sftp = MemorySftp::new();
        sftp.add_file("/home/x/a.txt", "a").add_file("/home/x/sub/b.txt", "b");
        let names: Vec<String> = sftp
            .read_dir("/home/x")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, [".", "..", "a.txt", "sub"]);
    }

    #[tokio::test]
    async fn rename_moves_descendants() {
        let sftp = MemorySftp::new();
        sftp.add_file("/d/inner/f", "x");
        sftp.rename("/d", "/e").await.unwrap();
        assert!(!sftp.contains("/d/inner/f"));
        assert_eq!(sftp.read("/e/inner/f").unwrap(), b"x");
    }

    #[tokio::test]
    async fn symlinks_resolve_relative_targets() {
        let sftp = MemorySftp::new();
        sftp.add_file("/data/real.txt", "hi").add_symlink("/data/link", "real.txt");
        assert_eq!(sftp.canonicalize("/data/link").await.unwrap(), "/data/real.txt");
        assert_eq!(sftp.lstat("/data/link").await.unwrap().kind, RemoteKind::Symlink);
        assert_eq!(sftp.stat("/data/link").await.unwrap().size, 2);
    }

    #[tokio::test]
    async fn non_empty_directories_are_not_removed() {
        let sftp = MemorySftp::new();
        sftp.add_file("/d/f", "x");
        assert!(matches!(
            sftp.remove_dir("/d").await,
            Err(VfsError::DirectoryNotEmpty(_))
        ));
    }
}
