//! Search results as a directory.
//!
//! `search://host/path?q=...&in=sftp` lists the matches of a search rooted
//! at `sftp://host/path`. Every `list()` runs the search again.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::attr_cache::AttributeCache;
use crate::config::VfsConfig;
use crate::error::{FileOp, ResultExt, VfsResult};
use crate::locator::Locator;
use crate::node::{FileNode, NodeRef};
use crate::registry::{ExtraParams, ProtocolAdapter, ProtocolRegistry};
use crate::search::{SearchJob, SearchQuery};
use crate::types::FileAttributes;

/// Adapter for `search://` locators.
#[derive(Debug, Clone)]
pub struct SearchAdapter {
    default_threads: usize,
    max_text_bytes: u64,
}

impl SearchAdapter {
    pub fn new(config: &VfsConfig) -> Self {
        Self {
            default_threads: config.search.default_threads,
            max_text_bytes: config.search.max_text_bytes,
        }
    }
}

impl ProtocolAdapter for SearchAdapter {
    fn create(
        &self,
        registry: &Arc<ProtocolRegistry>,
        locator: Locator,
        _params: &ExtraParams,
    ) -> VfsResult<NodeRef> {
        let query = SearchQuery::from_locator(&locator)?;
        let target = locator
            .with_scheme(&query.target_scheme)
            .with_query(None);
        Ok(Arc::new(SearchNode {
            locator,
            target,
            query,
            threads: self.default_threads,
            max_text_bytes: self.max_text_bytes,
            registry: registry.clone(),
            // Results change with the tree; never cache.
            cache: AttributeCache::new(std::time::Duration::ZERO),
        }))
    }
}

/// A saved search, listed by running it.
#[derive(Debug)]
pub struct SearchNode {
    locator: Locator,
    target: Locator,
    query: SearchQuery,
    threads: usize,
    max_text_bytes: u64,
    registry: Arc<ProtocolRegistry>,
    cache: AttributeCache,
}

impl SearchNode {
    /// The tree being searched.
    pub fn target(&self) -> &Locator {
        &self.target
    }

    pub fn query(&self) -> &SearchQuery {
        &self.query
    }

    /// A job for this search, not yet started.
    pub fn job(&self) -> VfsResult<SearchJob> {
        let root = self.registry.resolve(&self.target)?;
        Ok(SearchJob::builder([root])
            .matcher(self.query.filter(self.max_text_bytes)?)
            .browser(self.query.browser())
            .depth(self.query.depth)
            .threads(self.query.threads.unwrap_or(self.threads))
            .registry(self.registry.clone())
            .build())
    }
}

#[async_trait]
impl FileNode for SearchNode {
    fn locator(&self) -> &Locator {
        &self.locator
    }

    fn attribute_cache(&self) -> &AttributeCache {
        &self.cache
    }

    /// A search exists while its root is a directory.
    async fn fetch_attributes(&self) -> VfsResult<FileAttributes> {
        let root = self.registry.resolve(&self.target)?;
        let attrs = root.attributes().await?;
        if !attrs.exists || !attrs.is_directory {
            return Ok(FileAttributes::missing());
        }
        Ok(FileAttributes::directory(0o555).with_modified(attrs.modified))
    }

    async fn list(&self) -> VfsResult<Vec<NodeRef>> {
        let job = self.job().during(FileOp::Search, &self.locator)?;
        let results = job.run().await;
        debug!(locator = %self.locator.redacted(), matches = results.len(), "search listed");
        Ok(results.snapshot())
    }

    /// The directory the search is rooted at.
    async fn parent(&self) -> VfsResult<Option<NodeRef>> {
        self.registry.resolve(&self.target).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn listing_runs_the_query() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        std::fs::write(tmp.path().join("a/one.log"), "1").unwrap();
        std::fs::write(tmp.path().join("a/b/two.log"), "22").unwrap();
        std::fs::write(tmp.path().join("a/skip.txt"), "").unwrap();

        let registry = ProtocolRegistry::with_defaults(VfsConfig::default());
        let target = Locator::from_local_path(tmp.path());
        let query = SearchQuery::from_pairs([("q", "*.log")]).unwrap();
        let node = registry.resolve(&query.to_locator(&target)).unwrap();

        assert!(node.is_directory().await.unwrap());
        let mut found: Vec<String> = node
            .list()
            .await
            .unwrap()
            .iter()
            .map(|n| n.locator().name().to_string())
            .collect();
        found.sort();
        assert_eq!(found, ["one.log", "two.log"]);
        assert_eq!(node.parent().await.unwrap().unwrap().locator(), &target);
    }

    #[tokio::test]
    async fn invalid_queries_fail_at_resolution() {
        let registry = ProtocolRegistry::with_defaults(VfsConfig::default());
        assert!(registry.resolve_str("search:///tmp?depth=x").is_err());
        let bad_regex = registry
            .resolve_str("search:///tmp?q=(&regex=true")
            .unwrap();
        assert!(bad_regex.list().await.is_err());
    }

    #[tokio::test]
    async fn missing_roots_do_not_exist() {
        let registry = ProtocolRegistry::with_defaults(VfsConfig::default());
        let node = registry
            .resolve_str("search:///definitely/not/here?q=x")
            .unwrap();
        assert!(!node.exists().await.unwrap());
    }
}
