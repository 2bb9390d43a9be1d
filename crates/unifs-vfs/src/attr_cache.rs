//! Time-bounded attribute snapshots.
//!
//! Every file node owns one [`AttributeCache`]. Reads inside the TTL are
//! served from the snapshot; the first read after expiry performs exactly one
//! backend fetch (concurrent readers wait on it) and replaces the snapshot
//! atomically.
//!
//! Fetch errors that mean "not found" are stored as `exists = false`. Any
//! other error propagates and the previous snapshot stays in place.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};

use crate::error::VfsResult;
use crate::types::{FileAttributes, FilePermissions};

/// Time source for cache expiry.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

/// One attribute of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AttrField {
    Exists,
    IsDirectory,
    IsSymlink,
    Size,
    Modified,
    Permissions,
    Owner,
    Group,
}

/// Value of one attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    Size(u64),
    Time(Option<SystemTime>),
    Permissions(FilePermissions),
    Name(Option<String>),
}

impl FileAttributes {
    /// Read one field.
    pub fn field(&self, field: AttrField) -> AttrValue {
        match field {
            AttrField::Exists => AttrValue::Bool(self.exists),
            AttrField::IsDirectory => AttrValue::Bool(self.is_directory),
            AttrField::IsSymlink => AttrValue::Bool(self.is_symlink),
            AttrField::Size => AttrValue::Size(self.size),
            AttrField::Modified => AttrValue::Time(self.modified),
            AttrField::Permissions => AttrValue::Permissions(self.permissions),
            AttrField::Owner => AttrValue::Name(self.owner.clone()),
            AttrField::Group => AttrValue::Name(self.group.clone()),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    attrs: FileAttributes,
    expires_at: Instant,
}

/// Attribute snapshot with expiry.
pub struct AttributeCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entry: RwLock<Option<Entry>>,
    /// Serializes refreshes so one expiry costs one fetch.
    refresh: tokio::sync::Mutex<()>,
}

impl AttributeCache {
    /// Cache on the wall clock. A zero TTL disables caching.
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entry: RwLock::new(None),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Snapshot if still fresh.
    pub fn peek(&self) -> Option<FileAttributes> {
        let now = self.clock.now();
        self.entry
            .read()
            .as_ref()
            .filter(|e| e.expires_at > now)
            .map(|e| e.attrs.clone())
    }

    /// Last stored snapshot, fresh or not.
    pub fn last_known(&self) -> Option<FileAttributes> {
        self.entry.read().as_ref().map(|e| e.attrs.clone())
    }

    /// Return the snapshot, fetching first if it expired.
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> VfsResult<FileAttributes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = VfsResult<FileAttributes>>,
    {
        if let Some(attrs) = self.peek() {
            return Ok(attrs);
        }

        let _refreshing = self.refresh.lock().await;
        // Another reader may have refreshed while we waited.
        if let Some(attrs) = self.peek() {
            return Ok(attrs);
        }

        match fetch().await {
            Ok(attrs) => {
                self.store(attrs.clone());
                Ok(attrs)
            }
            Err(e) if e.is_not_found() => {
                let attrs = FileAttributes::missing();
                self.store(attrs.clone());
                Ok(attrs)
            }
            Err(e) => Err(e),
        }
    }

    /// Read one field through the cache.
    pub async fn get<F, Fut>(&self, field: AttrField, fetch: F) -> VfsResult<AttrValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = VfsResult<FileAttributes>>,
    {
        Ok(self.get_or_refresh(fetch).await?.field(field))
    }

    /// Store a snapshot obtained elsewhere, e.g. from a directory listing.
    pub fn prime(&self, attrs: FileAttributes) {
        self.store(attrs);
    }

    /// Apply a local mutation and restart the TTL.
    ///
    /// Used after operations whose outcome is known without asking the
    /// backend (mkdir, delete, rename).
    pub fn update_local(&self, mutate: impl FnOnce(&mut FileAttributes)) {
        let mut entry = self.entry.write();
        let mut attrs = entry
            .take()
            .map(|e| e.attrs)
            .unwrap_or_else(FileAttributes::missing);
        mutate(&mut attrs);
        *entry = Some(Entry {
            attrs,
            expires_at: self.clock.now() + self.ttl,
        });
    }

    /// Like [`update_local`](Self::update_local) but only when a snapshot
    /// exists; partial changes to an unknown file are left to the next fetch.
    pub fn patch(&self, mutate: impl FnOnce(&mut FileAttributes)) {
        let mut entry = self.entry.write();
        if let Some(e) = entry.as_mut() {
            mutate(&mut e.attrs);
            e.expires_at = self.clock.now() + self.ttl;
        }
    }

    /// Force the next read to refresh.
    pub fn invalidate(&self) {
        if let Some(e) = self.entry.write().as_mut() {
            e.expires_at = self.clock.now();
        }
    }

    fn store(&self, attrs: FileAttributes) {
        *self.entry.write() = Some(Entry {
            attrs,
            expires_at: self.clock.now() + self.ttl,
        });
    }
}

impl fmt::Debug for AttributeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeCache")
            .field("ttl", &self.ttl)
            .field("fresh", &self.peek().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VfsError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted(
        calls: &AtomicUsize,
        attrs: FileAttributes,
    ) -> impl Future<Output = VfsResult<FileAttributes>> + '_ {
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(attrs)
        }
    }

    #[tokio::test]
    async fn reads_within_ttl_hit_the_snapshot() {
        let clock = Arc::new(ManualClock::new());
        let cache = AttributeCache::with_clock(Duration::from_secs(10), clock.clone());
        let calls = AtomicUsize::new(0);

        let a = cache
            .get_or_refresh(|| counted(&calls, FileAttributes::file(5, 0o644)))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(9));
        let b = cache
            .get_or_refresh(|| counted(&calls, FileAttributes::file(6, 0o644)))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.size, b.size);

        clock.advance(Duration::from_secs(2));
        let c = cache
            .get_or_refresh(|| counted(&calls, FileAttributes::file(6, 0o644)))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(c.size, 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_expired_readers_share_one_fetch() {
        let cache = Arc::new(AttributeCache::new(Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_refresh(|| async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(FileAttributes::file(42, 0o600))
                    })
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().size, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn not_found_is_stored_as_missing() {
        let cache = AttributeCache::new(Duration::from_secs(60));
        let attrs = cache
            .get_or_refresh(|| async { Err(VfsError::not_found("/gone")) })
            .await
            .unwrap();
        assert!(!attrs.exists);
        assert_eq!(cache.peek().map(|a| a.exists), Some(false));
    }

    #[tokio::test]
    async fn other_errors_propagate_and_keep_the_old_snapshot() {
        let clock = Arc::new(ManualClock::new());
        let cache = AttributeCache::with_clock(Duration::from_secs(1), clock.clone());
        cache.prime(FileAttributes::file(7, 0o644));
        clock.advance(Duration::from_secs(2));

        let err = cache
            .get_or_refresh(|| async { Err(VfsError::transport("box", "reset")) })
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(cache.last_known().map(|a| a.size), Some(7));
        assert!(cache.peek().is_none());
    }

    #[tokio::test]
    async fn local_update_is_served_without_fetch() {
        let cache = AttributeCache::new(Duration::from_secs(60));
        cache.update_local(|a| {
            a.exists = true;
            a.is_directory = true;
        });
        let value = cache
            .get(AttrField::IsDirectory, || async {
                Err(VfsError::other("backend must not be called"))
            })
            .await
            .unwrap();
        assert_eq!(value, AttrValue::Bool(true));
    }

    #[tokio::test]
    async fn invalidate_forces_refresh() {
        let cache = AttributeCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        cache.prime(FileAttributes::file(1, 0o644));
        cache.invalidate();
        let attrs = cache
            .get_or_refresh(|| counted(&calls, FileAttributes::file(2, 0o644)))
            .await
            .unwrap();
        assert_eq!(attrs.size, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_ttl_always_fetches() {
        let cache = AttributeCache::new(Duration::ZERO);
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            cache
                .get_or_refresh(|| counted(&calls, FileAttributes::directory(0o755)))
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn patch_needs_an_existing_snapshot() {
        let cache = AttributeCache::new(Duration::from_secs(60));
        cache.patch(|a| a.size = 9);
        assert!(cache.last_known().is_none());

        cache.prime(FileAttributes::file(1, 0o644));
        cache.patch(|a| a.size = 9);
        assert_eq!(cache.peek().unwrap().size, 9);
    }
}
