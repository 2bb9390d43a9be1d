//! Connection handlers and the per-authority pool.
//!
//! Stateful protocols (SFTP) keep one session per authority. A
//! [`ConnectionPool`] hands out [`ConnectionGuard`]s: owning a guard means
//! owning the handler's lock, and dropping it releases the lock on every exit
//! path, panics included.
//!
//! # Handler lifecycle
//!
//! ```text
//! Unopened ──session()──▶ Starting ──ok──▶ Started ──close()──▶ Closed
//!                            │                 │                  │
//!                            └──err──▶ Faulted ◀──fatal error──┘  └─▶ Starting
//! ```
//!
//! A faulted handler is evicted immediately; the next acquire builds a new
//! one. `Faulted` never reaches callers; they see the original error.
//!
//! Streams outlive the guard that opened them. They carry a [`SessionLease`]
//! instead, which keeps the idle sweep away from the session until the stream
//! is dropped.

use std::fmt;
use std::io::{self, IoSlice, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, ReadBuf};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::constants;
use crate::error::{VfsError, VfsResult};
use crate::locator::{Credentials, Locator};

/// Identity of a pooled connection: scheme, host, port and credentials.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub credentials: Option<Credentials>,
}

impl ConnectionKey {
    pub fn from_locator(locator: &Locator) -> Self {
        Self {
            scheme: locator.scheme().to_string(),
            host: locator.host().to_string(),
            port: locator.port(),
            credentials: locator.credentials().cloned(),
        }
    }

    pub fn user(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.user())
    }

    pub fn password(&self) -> Option<&str> {
        self.credentials.as_ref().and_then(|c| c.password())
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        if let Some(user) = self.user() {
            write!(f, "{user}@")?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionKey({self})")
    }
}

/// Opens, pings and closes sessions for one protocol.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: Send + Sync + 'static;

    /// Establish and authenticate a session.
    async fn connect(&self, key: &ConnectionKey) -> VfsResult<Self::Session>;

    /// Cheap no-op round trip keeping the session alive.
    async fn keep_alive(&self, _session: &Self::Session) -> VfsResult<()> {
        Ok(())
    }

    async fn disconnect(&self, _session: Self::Session) {}

    /// Whether `err` means the session must be discarded.
    fn is_fatal(&self, err: &VfsError) -> bool {
        err.is_fatal()
    }

    /// Whether a started session must be reopened before its next use, for
    /// example because its credentials are about to expire.
    fn is_expired(&self, _session: &Self::Session) -> bool {
        false
    }
}

/// Handler lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    Unopened,
    Starting,
    Started,
    Closed,
    Faulted,
}

/// Pool limits.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub connect_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_per_host: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            connect_timeout: constants::CONNECT_TIMEOUT,
            keep_alive_interval: constants::KEEP_ALIVE_INTERVAL,
            idle_timeout: Some(constants::IDLE_TIMEOUT),
            max_per_host: constants::MAX_CONNECTIONS_PER_HOST,
        }
    }
}

impl From<&PoolConfig> for PoolSettings {
    fn from(c: &PoolConfig) -> Self {
        Self {
            connect_timeout: c.connect_timeout(),
            keep_alive_interval: c.keep_alive_interval(),
            idle_timeout: c.idle_timeout(),
            max_per_host: c.max_connections_per_host.max(1),
        }
    }
}

/// Outcome of one idle sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub pinged: usize,
    pub closed: usize,
    pub faulted: usize,
}

/// When a handler was last used and how many streams still lease it.
#[derive(Debug)]
struct Activity {
    last_used: Mutex<Instant>,
    leases: AtomicUsize,
}

impl Activity {
    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn is_leased(&self) -> bool {
        self.leases.load(Ordering::SeqCst) > 0
    }
}

struct Handler<C: Connector> {
    key: ConnectionKey,
    slot: Arc<AsyncMutex<Option<C::Session>>>,
    state: Mutex<ConnectionState>,
    activity: Arc<Activity>,
}

impl<C: Connector> Handler<C> {
    fn new(key: ConnectionKey) -> Self {
        Self {
            key,
            slot: Arc::new(AsyncMutex::new(None)),
            state: Mutex::new(ConnectionState::Unopened),
            activity: Arc::new(Activity {
                last_used: Mutex::new(Instant::now()),
                leases: AtomicUsize::new(0),
            }),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }
}

struct PoolInner<C: Connector> {
    connector: Arc<C>,
    settings: PoolSettings,
    handlers: DashMap<ConnectionKey, Vec<Arc<Handler<C>>>>,
}

/// Per-authority connection handlers for one protocol.
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self
            .inner
            .handlers
            .iter()
            .map(|e| format!("{}×{}", e.key(), e.value().len()))
            .collect();
        f.debug_struct("ConnectionPool")
            .field("handlers", &keys)
            .finish()
    }
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, settings: PoolSettings) -> Self {
        Self::with_connector(Arc::new(connector), settings)
    }

    pub fn with_connector(connector: Arc<C>, settings: PoolSettings) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                settings,
                handlers: DashMap::new(),
            }),
        }
    }

    pub fn connector(&self) -> &Arc<C> {
        &self.inner.connector
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Acquire a handler for the locator's authority.
    ///
    /// `exclusive` waits for the authority's primary handler. Otherwise any
    /// idle handler is taken, a new one is created while under the
    /// per-authority cap, and only then does the call wait on the primary.
    pub async fn acquire(&self, locator: &Locator, exclusive: bool) -> VfsResult<ConnectionGuard<C>> {
        let key = locator.authority_key();
        loop {
            let idle = if exclusive { None } else { self.try_idle(&key) };
            let guard = match idle {
                Some(guard) => guard,
                None => {
                    let handler = if exclusive {
                        self.primary(&key)
                    } else {
                        self.grow_or_primary(&key)
                    };
                    let slot = handler.slot.clone().lock_owned().await;
                    self.guard(handler, slot)
                }
            };
            match guard.ensure_live() {
                Ok(()) => return Ok(guard),
                Err(e) => {
                    // Evicted or closed out while we waited.
                    debug!(error = %e, "retrying acquire");
                    continue;
                }
            }
        }
    }

    /// Number of live handlers for a key.
    pub fn handler_count(&self, key: &ConnectionKey) -> usize {
        self.inner.handlers.get(key).map(|v| v.len()).unwrap_or(0)
    }

    /// States of the live handlers for a key, primary first.
    pub fn states(&self, key: &ConnectionKey) -> Vec<ConnectionState> {
        self.inner
            .handlers
            .get(key)
            .map(|v| v.iter().map(|h| h.state()).collect())
            .unwrap_or_default()
    }

    /// Ping handlers idle past the keep-alive interval and close those idle
    /// past the idle timeout. Handlers in use or leased by a stream are
    /// skipped.
    pub async fn sweep_idle(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        let handlers: Vec<Arc<Handler<C>>> = self
            .inner
            .handlers
            .iter()
            .flat_map(|e| e.value().clone())
            .collect();
        let now = Instant::now();

        for handler in handlers {
            let Ok(slot) = handler.slot.clone().try_lock_owned() else {
                continue;
            };
            let mut guard = self.guard(handler, slot);
            guard.touch_on_drop = false;
            if guard.slot.is_none() || guard.handler.activity.is_leased() {
                continue;
            }

            let idle = now.saturating_duration_since(*guard.handler.activity.last_used.lock());
            if let Some(limit) = self.inner.settings.idle_timeout
                && idle >= limit
            {
                debug!(key = %guard.handler.key, idle = ?idle, "closing idle connection");
                guard.close().await;
                stats.closed += 1;
            } else if idle >= self.inner.settings.keep_alive_interval {
                let result = match (*guard.slot).as_ref() {
                    Some(session) => self.inner.connector.keep_alive(session).await,
                    None => continue,
                };
                match result {
                    Ok(()) => stats.pinged += 1,
                    Err(e) => {
                        guard.fault(&e);
                        stats.faulted += 1;
                    }
                }
            }
        }
        stats
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every `period` until cancelled.
    pub fn spawn_keep_alive(
        &self,
        period: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let stats = pool.sweep_idle().await;
                        if stats != SweepStats::default() {
                            debug!(?stats, "keep-alive sweep");
                        }
                    }
                }
            }
        })
    }

    /// Close every handler, waiting for in-flight operations.
    ///
    /// Acquires already waiting on a removed handler retry against the map
    /// and get a fresh one.
    pub async fn close_all(&self) {
        let handlers: Vec<Arc<Handler<C>>> = self
            .inner
            .handlers
            .iter()
            .flat_map(|e| e.value().clone())
            .collect();
        for handler in &handlers {
            if handler.state() != ConnectionState::Faulted {
                handler.set_state(ConnectionState::Closed);
            }
        }
        self.inner.handlers.clear();
        let count = handlers.len();
        for handler in handlers {
            let slot = handler.slot.clone().lock_owned().await;
            self.guard(handler, slot).close().await;
        }
        info!(count, "closed all connections");
    }

    fn guard(
        &self,
        handler: Arc<Handler<C>>,
        slot: OwnedMutexGuard<Option<C::Session>>,
    ) -> ConnectionGuard<C> {
        ConnectionGuard {
            pool: self.clone(),
            handler,
            slot,
            touch_on_drop: true,
        }
    }

    fn try_idle(&self, key: &ConnectionKey) -> Option<ConnectionGuard<C>> {
        let handlers = self.inner.handlers.get(key).map(|v| v.clone())?;
        handlers.into_iter().find_map(|h| {
            let slot = h.slot.clone().try_lock_owned().ok()?;
            Some(self.guard(h, slot))
        })
    }

    fn primary(&self, key: &ConnectionKey) -> Arc<Handler<C>> {
        let mut handlers = self.inner.handlers.entry(key.clone()).or_default();
        if handlers.is_empty() {
            handlers.push(Arc::new(Handler::new(key.clone())));
        }
        handlers[0].clone()
    }

    fn grow_or_primary(&self, key: &ConnectionKey) -> Arc<Handler<C>> {
        let mut handlers = self.inner.handlers.entry(key.clone()).or_default();
        if handlers.len() < self.inner.settings.max_per_host.max(1) {
            let handler = Arc::new(Handler::new(key.clone()));
            handlers.push(handler.clone());
            debug!(key = %key, count = handlers.len(), "added connection handler");
            handler
        } else {
            handlers[0].clone()
        }
    }

    /// Whether the handler is still one the map hands out.
    fn is_live(&self, handler: &Arc<Handler<C>>) -> bool {
        self.inner
            .handlers
            .get(&handler.key)
            .is_some_and(|v| v.iter().any(|h| Arc::ptr_eq(h, handler)))
    }

    fn evict(&self, handler: &Arc<Handler<C>>) {
        if let Some(mut handlers) = self.inner.handlers.get_mut(&handler.key) {
            handlers.retain(|h| !Arc::ptr_eq(h, handler));
        }
        self.inner
            .handlers
            .remove_if(&handler.key, |_, handlers| handlers.is_empty());
    }
}

/// Exclusive hold on one connection handler.
pub struct ConnectionGuard<C: Connector> {
    pool: ConnectionPool<C>,
    handler: Arc<Handler<C>>,
    slot: OwnedMutexGuard<Option<C::Session>>,
    touch_on_drop: bool,
}

impl<C: Connector> ConnectionGuard<C> {
    pub fn key(&self) -> &ConnectionKey {
        &self.handler.key
    }

    pub fn state(&self) -> ConnectionState {
        self.handler.state()
    }

    /// The started session, opening it first if needed.
    ///
    /// A session the connector reports as expired is closed and reopened.
    pub async fn session(&mut self) -> VfsResult<&C::Session> {
        if let Some(session) = (*self.slot).as_ref()
            && self.pool.inner.connector.is_expired(session)
        {
            debug!(key = %self.handler.key, "session expired, reopening");
            self.close().await;
        }
        if self.slot.is_none() {
            self.ensure_live()?;
            self.start().await?;
        }
        match (*self.slot).as_ref() {
            Some(session) => Ok(session),
            None => Err(VfsError::other(format!(
                "{} has no session after start",
                self.handler.key
            ))),
        }
    }

    /// Pass an operation result through, faulting the handler on fatal errors.
    pub fn check<T>(&mut self, result: VfsResult<T>) -> VfsResult<T> {
        if let Err(e) = &result
            && self.pool.inner.connector.is_fatal(e)
        {
            self.fault(e);
        }
        result
    }

    /// Keep the handler busy for as long as the lease lives. Used by streams
    /// that keep reading from the session after the guard is dropped.
    pub fn lease(&self) -> SessionLease {
        self.handler.activity.leases.fetch_add(1, Ordering::SeqCst);
        SessionLease {
            activity: self.handler.activity.clone(),
        }
    }

    /// Tear the session down. The next `session()` reopens it.
    pub async fn close(&mut self) {
        if let Some(session) = self.slot.take() {
            self.pool.inner.connector.disconnect(session).await;
        }
        if self.handler.state() != ConnectionState::Faulted {
            self.handler.set_state(ConnectionState::Closed);
        }
    }

    /// Fails with `Faulted` once the handler was evicted or the pool closed
    /// it out; reopening it would leave a session nothing sweeps or closes.
    fn ensure_live(&self) -> VfsResult<()> {
        if self.handler.state() == ConnectionState::Faulted || !self.pool.is_live(&self.handler) {
            return Err(VfsError::Faulted(self.handler.key.to_string()));
        }
        Ok(())
    }

    async fn start(&mut self) -> VfsResult<()> {
        let key = self.handler.key.clone();
        let timeout = self.pool.inner.settings.connect_timeout;
        self.handler.set_state(ConnectionState::Starting);

        let connecting = self.pool.inner.connector.connect(&key);
        let result = match tokio::time::timeout(timeout, connecting).await {
            Ok(result) => result,
            Err(_) => Err(VfsError::Timeout(format!(
                "connecting to {key} took longer than {timeout:?}"
            ))),
        };

        match result {
            Ok(session) => {
                *self.slot = Some(session);
                self.handler.set_state(ConnectionState::Started);
                info!(key = %key, "connection started");
                Ok(())
            }
            Err(e) => {
                warn!(key = %key, error = %e, "connection failed to start");
                self.handler.set_state(ConnectionState::Faulted);
                self.pool.evict(&self.handler);
                Err(e)
            }
        }
    }

    fn fault(&mut self, err: &VfsError) {
        warn!(key = %self.handler.key, error = %err, "connection faulted, evicting");
        self.handler.set_state(ConnectionState::Faulted);
        if let Some(session) = self.slot.take() {
            let connector = self.pool.inner.connector.clone();
            let key = self.handler.key.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        connector.disconnect(session).await;
                        debug!(key = %key, "faulted connection disconnected");
                    });
                }
                Err(_) => drop(session),
            }
        }
        self.pool.evict(&self.handler);
    }
}

impl<C: Connector> Drop for ConnectionGuard<C> {
    fn drop(&mut self) {
        if self.touch_on_drop {
            self.handler.activity.touch();
        }
    }
}

impl<C: Connector> fmt::Debug for ConnectionGuard<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("key", &self.handler.key)
            .field("state", &self.handler.state())
            .finish()
    }
}

/// Marks a handler busy without holding its lock. Dropping it counts as a use.
#[must_use]
#[derive(Debug)]
pub struct SessionLease {
    activity: Arc<Activity>,
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.activity.leases.fetch_sub(1, Ordering::SeqCst);
        self.activity.touch();
    }
}

/// A stream that holds a [`SessionLease`] until it is dropped.
#[derive(Debug)]
pub struct Leased<S> {
    inner: S,
    _lease: SessionLease,
}

impl<S> Leased<S> {
    pub fn new(inner: S, lease: SessionLease) -> Self {
        Self {
            inner,
            _lease: lease,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Leased<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Leased<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S: AsyncSeek + Unpin> AsyncSeek for Leased<S> {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.get_mut().inner).start_seek(position)
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.get_mut().inner).poll_complete(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeConnector {
        connects: AtomicUsize,
        pings: AtomicUsize,
        disconnects: AtomicUsize,
        fail_ping: AtomicBool,
        expired: AtomicBool,
        reject: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        type Session = usize;

        async fn connect(&self, key: &ConnectionKey) -> VfsResult<usize> {
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            if self.reject {
                return Err(VfsError::auth(key.to_string(), "bad password"));
            }
            Ok(self.connects.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn keep_alive(&self, _session: &usize) -> VfsResult<()> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.fail_ping.load(Ordering::SeqCst) {
                Err(VfsError::transport("fake", "no reply"))
            } else {
                Ok(())
            }
        }

        async fn disconnect(&self, _session: usize) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }

        fn is_expired(&self, _session: &usize) -> bool {
            self.expired.load(Ordering::SeqCst)
        }
    }

    fn loc() -> Locator {
        Locator::parse("sftp://amy@box/home/amy").unwrap()
    }

    fn pool(connector: FakeConnector) -> ConnectionPool<FakeConnector> {
        ConnectionPool::new(connector, PoolSettings::default())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn exclusive_acquires_never_overlap() {
        let pool = pool(FakeConnector::default());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let pool = pool.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            tasks.push(tokio::spawn(async move {
                let mut guard = pool.acquire(&loc(), true).await.unwrap();
                guard.session().await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(pool.connector().connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lock_is_released_on_error_and_panic() {
        let pool = pool(FakeConnector::default());

        let p = pool.clone();
        let failed: VfsResult<()> = async move {
            let mut guard = p.acquire(&loc(), true).await?;
            guard.session().await?;
            Err(VfsError::other("operation failed mid-way"))
        }
        .await;
        assert!(failed.is_err());

        let p = pool.clone();
        let panicked = tokio::spawn(async move {
            let _guard = p.acquire(&loc(), true).await.unwrap();
            panic!("critical section panicked");
        })
        .await;
        assert!(panicked.is_err());

        let guard = tokio::time::timeout(Duration::from_secs(1), pool.acquire(&loc(), true)).await;
        assert!(guard.is_ok(), "handler lock leaked");
    }

    #[tokio::test]
    async fn fatal_error_evicts_and_next_acquire_reconnects() {
        let pool = pool(FakeConnector::default());
        let key = ConnectionKey::from_locator(&loc());

        let mut guard = pool.acquire(&loc(), true).await.unwrap();
        assert_eq!(*guard.session().await.unwrap(), 1);
        let err = guard
            .check::<()>(Err(VfsError::transport("box", "connection reset")))
            .unwrap_err();
        assert!(matches!(err, VfsError::Transport { .. }));
        drop(guard);
        assert_eq!(pool.handler_count(&key), 0);
        tokio::task::yield_now().await;
        assert_eq!(pool.connector().disconnects.load(Ordering::SeqCst), 1);

        let mut guard = pool.acquire(&loc(), true).await.unwrap();
        assert_eq!(*guard.session().await.unwrap(), 2);
        assert_eq!(pool.states(&key), vec![ConnectionState::Started]);
    }

    #[tokio::test]
    async fn non_fatal_error_keeps_the_session() {
        let pool = pool(FakeConnector::default());
        let mut guard = pool.acquire(&loc(), true).await.unwrap();
        guard.session().await.unwrap();
        let _ = guard.check::<()>(Err(VfsError::not_found("/nope")));
        drop(guard);

        let mut guard = pool.acquire(&loc(), true).await.unwrap();
        assert_eq!(*guard.session().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_connect_times_out() {
        let connector = FakeConnector {
            delay: Some(Duration::from_secs(3600)),
            ..Default::default()
        };
        let pool = ConnectionPool::new(
            connector,
            PoolSettings {
                connect_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        );
        let mut guard = pool.acquire(&loc(), true).await.unwrap();
        let err = guard.session().await.unwrap_err();
        assert!(matches!(err, VfsError::Timeout(_)), "{err}");
        drop(guard);
        assert_eq!(pool.handler_count(&ConnectionKey::from_locator(&loc())), 0);
    }

    #[tokio::test]
    async fn rejected_credentials_surface_as_auth() {
        let pool = pool(FakeConnector {
            reject: true,
            ..Default::default()
        });
        let mut guard = pool.acquire(&loc(), false).await.unwrap();
        assert!(guard.session().await.unwrap_err().is_auth());
    }

    #[tokio::test]
    async fn shared_acquires_grow_to_the_cap_then_wait() {
        let pool = ConnectionPool::new(
            FakeConnector::default(),
            PoolSettings {
                max_per_host: 2,
                ..Default::default()
            },
        );
        let key = ConnectionKey::from_locator(&loc());

        let first = pool.acquire(&loc(), false).await.unwrap();
        let second = pool.acquire(&loc(), false).await.unwrap();
        assert_eq!(pool.handler_count(&key), 2);

        let third = tokio::time::timeout(Duration::from_millis(50), pool.acquire(&loc(), false)).await;
        assert!(third.is_err(), "third acquire should wait");

        drop(second);
        let third = tokio::time::timeout(Duration::from_secs(1), pool.acquire(&loc(), false)).await;
        assert!(third.is_ok());
        drop(first);
    }

    #[tokio::test]
    async fn closed_handler_restarts_on_next_use() {
        let pool = pool(FakeConnector::default());
        let key = ConnectionKey::from_locator(&loc());

        let mut guard = pool.acquire(&loc(), true).await.unwrap();
        guard.session().await.unwrap();
        guard.close().await;
        assert_eq!(guard.state(), ConnectionState::Closed);
        assert_eq!(*guard.session().await.unwrap(), 2);
        drop(guard);

        assert_eq!(pool.states(&key), vec![ConnectionState::Started]);
        assert_eq!(pool.connector().disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_pings_then_closes_idle_handlers() {
        let pool = pool(FakeConnector::default());
        let key = ConnectionKey::from_locator(&loc());
        {
            let mut guard = pool.acquire(&loc(), true).await.unwrap();
            guard.session().await.unwrap();
        }

        tokio::time::advance(constants::KEEP_ALIVE_INTERVAL + Duration::from_secs(1)).await;
        let stats = pool.sweep_idle().await;
        assert_eq!(stats.pinged, 1);

        tokio::time::advance(constants::IDLE_TIMEOUT).await;
        let stats = pool.sweep_idle().await;
        assert_eq!(stats.closed, 1);
        assert_eq!(pool.states(&key), vec![ConnectionState::Closed]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_ping_faults_the_handler() {
        let pool = pool(FakeConnector::default());
        let key = ConnectionKey::from_locator(&loc());
        {
            let mut guard = pool.acquire(&loc(), true).await.unwrap();
            guard.session().await.unwrap();
        }
        pool.connector().fail_ping.store(true, Ordering::SeqCst);
        tokio::time::advance(constants::KEEP_ALIVE_INTERVAL + Duration::from_secs(1)).await;

        let stats = pool.sweep_idle().await;
        assert_eq!(stats.faulted, 1);
        assert_eq!(pool.handler_count(&key), 0);
    }

    #[tokio::test]
    async fn close_all_disconnects_everything() {
        let pool = pool(FakeConnector::default());
        for path in ["sftp://a@one/", "sftp://b@two/"] {
            let mut guard = pool.acquire(&Locator::parse(path).unwrap(), true).await.unwrap();
            guard.session().await.unwrap();
        }
        pool.close_all().await;
        assert_eq!(pool.connector().disconnects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn evicted_guard_does_not_redial() {
        let pool = pool(FakeConnector::default());
        let mut guard = pool.acquire(&loc(), true).await.unwrap();
        guard.session().await.unwrap();
        let _ = guard.check::<()>(Err(VfsError::transport("box", "connection reset")));

        let err = guard.session().await.unwrap_err();
        assert!(matches!(err, VfsError::Faulted(_)), "{err}");
        assert_eq!(pool.connector().connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn leased_session_survives_idle_sweep() {
        let pool = pool(FakeConnector::default());
        let key = ConnectionKey::from_locator(&loc());
        let lease = {
            let mut guard = pool.acquire(&loc(), false).await.unwrap();
            guard.session().await.unwrap();
            guard.lease()
        };

        tokio::time::advance(constants::IDLE_TIMEOUT + Duration::from_secs(1)).await;
        let stats = pool.sweep_idle().await;
        assert_eq!(stats, SweepStats::default());
        assert_eq!(pool.states(&key), vec![ConnectionState::Started]);

        // Releasing the lease counts as a use, so the idle clock restarts.
        drop(lease);
        assert_eq!(pool.sweep_idle().await.closed, 0);
        tokio::time::advance(constants::IDLE_TIMEOUT).await;
        assert_eq!(pool.sweep_idle().await.closed, 1);
        assert_eq!(pool.connector().connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waiting_during_close_all_gets_a_live_handler() {
        let pool = pool(FakeConnector::default());
        let key = ConnectionKey::from_locator(&loc());
        let mut held = pool.acquire(&loc(), true).await.unwrap();
        held.session().await.unwrap();

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move {
                let mut guard = pool.acquire(&loc(), true).await.unwrap();
                *guard.session().await.unwrap()
            }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;
        let closing = tokio::spawn({
            let pool = pool.clone();
            async move { pool.close_all().await }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;

        drop(held);
        closing.await.unwrap();
        assert_eq!(waiter.await.unwrap(), 2);
        assert_eq!(pool.states(&key), vec![ConnectionState::Started]);
        assert_eq!(pool.connector().disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_session_is_reopened_before_use() {
        let pool = pool(FakeConnector::default());
        {
            let mut guard = pool.acquire(&loc(), true).await.unwrap();
            assert_eq!(*guard.session().await.unwrap(), 1);
        }
        pool.connector().expired.store(true, Ordering::SeqCst);

        let mut guard = pool.acquire(&loc(), true).await.unwrap();
        assert_eq!(*guard.session().await.unwrap(), 2);
        assert_eq!(pool.connector().disconnects.load(Ordering::SeqCst), 1);
    }
}
