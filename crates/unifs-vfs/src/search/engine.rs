//! Breadth-first search job.
//!
//! Each level lists its whole frontier concurrently, up to `threads`
//! listings at a time, then filters the children in listing order. The set
//! of matches for a tree and a depth bound does not depend on `threads`.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::predicate::{DescendPredicate, Directories, MatchAll, MatchPredicate};
use crate::constants::SEARCH_THREADS;
use crate::locator::Locator;
use crate::node::NodeRef;
use crate::registry::ProtocolRegistry;

/// Events buffered per subscriber before old ones are dropped.
const EVENT_CAPACITY: usize = 256;

/// How many levels a search lists.
///
/// Externally encoded as a number where `0` means [`Unlimited`](Self::Unlimited).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchDepth {
    #[default]
    Unlimited,
    /// List at most this many levels; level 1 lists the entrypoints.
    Levels(u32),
}

impl SearchDepth {
    pub fn from_encoded(n: u32) -> Self {
        match n {
            0 => Self::Unlimited,
            n => Self::Levels(n),
        }
    }

    pub fn encoded(self) -> u32 {
        match self {
            Self::Unlimited => 0,
            Self::Levels(n) => n,
        }
    }

    /// Whether level `level` (1-based) may be listed.
    pub fn allows(self, level: u32) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Levels(n) => level <= n,
        }
    }
}

/// Progress notifications for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchEvent {
    /// A non-empty batch was appended; `total` counts all matches so far.
    Matched { batch: usize, total: usize },
    /// A level finished; `frontier` directories are queued for the next one.
    LevelCompleted { level: u32, frontier: usize },
    Finished { matches: usize, cancelled: bool },
}

/// Match collection shared with observers.
#[derive(Clone, Default)]
pub struct SearchResults {
    inner: Arc<RwLock<Vec<NodeRef>>>,
}

impl SearchResults {
    /// Append a batch, returning the new total.
    fn append(&self, batch: Vec<NodeRef>) -> usize {
        let mut inner = self.inner.write();
        inner.extend(batch);
        inner.len()
    }

    /// Current matches, in discovery order.
    pub fn snapshot(&self) -> Vec<NodeRef> {
        self.inner.read().clone()
    }

    pub fn locators(&self) -> Vec<Locator> {
        self.inner
            .read()
            .iter()
            .map(|n| n.locator().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl fmt::Debug for SearchResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchResults").field("len", &self.len()).finish()
    }
}

/// One search over a set of entrypoints.
pub struct SearchJob {
    entrypoints: Vec<NodeRef>,
    matcher: Arc<dyn MatchPredicate>,
    browser: Arc<dyn DescendPredicate>,
    depth: SearchDepth,
    threads: usize,
    registry: Option<Arc<ProtocolRegistry>>,
    results: SearchResults,
    events: broadcast::Sender<SearchEvent>,
    cancel: CancellationToken,
}

/// Builder for [`SearchJob`].
pub struct SearchJobBuilder {
    entrypoints: Vec<NodeRef>,
    matcher: Arc<dyn MatchPredicate>,
    browser: Arc<dyn DescendPredicate>,
    depth: SearchDepth,
    threads: usize,
    registry: Option<Arc<ProtocolRegistry>>,
}

impl SearchJobBuilder {
    pub fn matcher(mut self, matcher: impl MatchPredicate + 'static) -> Self {
        self.matcher = Arc::new(matcher);
        self
    }

    pub fn browser(mut self, browser: impl DescendPredicate + 'static) -> Self {
        self.browser = Arc::new(browser);
        self
    }

    pub fn depth(mut self, depth: SearchDepth) -> Self {
        self.depth = depth;
        self
    }

    /// Concurrent listings per level; at least one.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Needed to descend into archives.
    pub fn registry(mut self, registry: Arc<ProtocolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> SearchJob {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        SearchJob {
            entrypoints: self.entrypoints,
            matcher: self.matcher,
            browser: self.browser,
            depth: self.depth,
            threads: self.threads,
            registry: self.registry,
            results: SearchResults::default(),
            events,
            cancel: CancellationToken::new(),
        }
    }
}

impl SearchJob {
    /// A job matching everything under `entrypoints`, descending into
    /// directories without a depth bound.
    pub fn builder(entrypoints: impl IntoIterator<Item = NodeRef>) -> SearchJobBuilder {
        SearchJobBuilder {
            entrypoints: entrypoints.into_iter().collect(),
            matcher: Arc::new(MatchAll),
            browser: Arc::new(Directories),
            depth: SearchDepth::Unlimited,
            threads: SEARCH_THREADS,
            registry: None,
        }
    }

    pub fn results(&self) -> SearchResults {
        self.results.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SearchEvent> {
        self.events.subscribe()
    }

    /// Stop scheduling listings. Listings already running finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run on a background task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<SearchResults> {
        let job = self.clone();
        tokio::spawn(async move { job.run().await })
    }

    fn notify(&self, event: SearchEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// What a descended node is listed as: archives become their root.
    async fn browsable(&self, node: NodeRef) -> Option<NodeRef> {
        let Some(registry) = &self.registry else {
            return Some(node);
        };
        match registry.as_browsable(node.clone()).await {
            Ok(Some(dir)) => Some(dir),
            Ok(None) => None,
            Err(e) => {
                debug!(locator = %node.locator().redacted(), error = %e, "cannot browse");
                None
            }
        }
    }

    /// Identity used to detect loops: symlinked directories by their target.
    async fn visit_key(node: &NodeRef) -> Locator {
        if node.is_symlink().await.unwrap_or(false)
            && let Ok(target) = node.canonical().await
        {
            return target;
        }
        node.locator().clone()
    }

    async fn list_one(&self, dir: NodeRef) -> Vec<NodeRef> {
        if self.cancel.is_cancelled() {
            return Vec::new();
        }
        match dir.list().await {
            Ok(children) => children,
            Err(e) => {
                warn!(locator = %dir.locator().redacted(), error = %e, "listing failed, skipping");
                Vec::new()
            }
        }
    }

    /// Run to completion or cancellation.
    #[instrument(skip(self), fields(entrypoints = self.entrypoints.len(), depth = self.depth.encoded(), threads = self.threads))]
    pub async fn run(&self) -> SearchResults {
        let mut visited: HashSet<Locator> = HashSet::new();
        let mut frontier = Vec::new();
        for entry in &self.entrypoints {
            if visited.insert(Self::visit_key(entry).await) {
                frontier.push(entry.clone());
            }
        }

        let mut level = 0;
        while !frontier.is_empty() && !self.cancel.is_cancelled() {
            level += 1;
            if !self.depth.allows(level) {
                break;
            }

            // Listings finish in any order; children are put back in
            // frontier order so the discovery order is stable.
            let mut listings: Vec<(usize, Vec<NodeRef>)> = stream::iter(frontier.into_iter().enumerate())
                .map(|(i, dir)| async move { (i, self.list_one(dir).await) })
                .boxed()
                .buffer_unordered(self.threads)
                .collect()
                .await;
            listings.sort_by_key(|(i, _)| *i);
            let children = listings.into_iter().flat_map(|(_, c)| c);

            let checked: Vec<(NodeRef, bool, bool)> = stream::iter(children)
                .map(|child| async move {
                    let matched = self.matcher.matches(child.as_ref()).await;
                    let descend = self.browser.descend(child.as_ref()).await;
                    (child, matched, descend)
                })
                .boxed()
                .buffered(self.threads)
                .collect()
                .await;

            let mut batch = Vec::new();
            let mut next = Vec::new();
            for (child, matched, descend) in checked {
                if matched {
                    batch.push(child.clone());
                }
                if !descend {
                    continue;
                }
                if !visited.insert(Self::visit_key(&child).await) {
                    debug!(locator = %child.locator().redacted(), "already visited");
                    continue;
                }
                if let Some(dir) = self.browsable(child).await {
                    next.push(dir);
                }
            }

            if !batch.is_empty() {
                let count = batch.len();
                let total = self.results.append(batch);
                self.notify(SearchEvent::Matched { batch: count, total });
            }
            debug!(level, next = next.len(), "level complete");
            self.notify(SearchEvent::LevelCompleted {
                level,
                frontier: next.len(),
            });
            frontier = next;
        }

        let cancelled = self.cancel.is_cancelled();
        let matches = self.results.len();
        info!(matches, levels = level, cancelled, "search finished");
        self.notify(SearchEvent::Finished { matches, cancelled });
        self.results.clone()
    }
}

impl fmt::Debug for SearchJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchJob")
            .field("entrypoints", &self.entrypoints.len())
            .field("matcher", &self.matcher)
            .field("browser", &self.browser)
            .field("depth", &self.depth)
            .field("threads", &self.threads)
            .finish_non_exhaustive()
    }
}
