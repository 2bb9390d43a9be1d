//! Scheme to adapter mapping.
//!
//! The registry is an ordinary value built at startup and shared as
//! `Arc<ProtocolRegistry>`; there is no process-global table. Adapters own
//! their connection pools, so dropping the registry drops every pool.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::backends::gdrive::DriveAdapter;
use crate::backends::local::LocalAdapter;
use crate::backends::search::SearchAdapter;
use crate::backends::sftp::SftpAdapter;
use crate::backends::tar::{TarAdapter, archive_root_locator, is_archive_name};
use crate::config::VfsConfig;
use crate::error::{VfsError, VfsResult};
use crate::locator::Locator;
use crate::node::NodeRef;

/// Extra construction parameters for an adapter, e.g. a Drive file id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtraParams(BTreeMap<String, String>);

impl ExtraParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// Builds file nodes for one scheme.
pub trait ProtocolAdapter: Send + Sync {
    fn create(
        &self,
        registry: &Arc<ProtocolRegistry>,
        locator: Locator,
        params: &ExtraParams,
    ) -> VfsResult<NodeRef>;
}

impl<F> ProtocolAdapter for F
where
    F: Fn(&Arc<ProtocolRegistry>, Locator, &ExtraParams) -> VfsResult<NodeRef> + Send + Sync,
{
    fn create(
        &self,
        registry: &Arc<ProtocolRegistry>,
        locator: Locator,
        params: &ExtraParams,
    ) -> VfsResult<NodeRef> {
        self(registry, locator, params)
    }
}

/// Scheme to adapter table.
pub struct ProtocolRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn ProtocolAdapter>>>,
    config: VfsConfig,
}

impl ProtocolRegistry {
    /// Empty registry.
    pub fn new(config: VfsConfig) -> Arc<Self> {
        Arc::new(Self {
            adapters: RwLock::new(HashMap::new()),
            config,
        })
    }

    /// Registry with `file`, `sftp`, `gdrive`, `tar` and `search`.
    pub fn with_defaults(config: VfsConfig) -> Arc<Self> {
        let registry = Self::new(config);
        let config = registry.config().clone();
        registry.register("file", Arc::new(LocalAdapter::new(&config)));
        registry.register("sftp", Arc::new(SftpAdapter::new(&config)));
        registry.register("gdrive", Arc::new(DriveAdapter::new(&config)));
        registry.register("tar", Arc::new(TarAdapter::new(&config)));
        registry.register("search", Arc::new(SearchAdapter::new(&config)));
        registry
    }

    pub fn config(&self) -> &VfsConfig {
        &self.config
    }

    /// Register an adapter, returning the one it replaces.
    pub fn register(
        &self,
        scheme: &str,
        adapter: Arc<dyn ProtocolAdapter>,
    ) -> Option<Arc<dyn ProtocolAdapter>> {
        let scheme = scheme.to_ascii_lowercase();
        info!(scheme = %scheme, "registered protocol adapter");
        self.adapters.write().insert(scheme, adapter)
    }

    pub fn unregister(&self, scheme: &str) -> Option<Arc<dyn ProtocolAdapter>> {
        self.adapters.write().remove(&scheme.to_ascii_lowercase())
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.adapters.read().keys().cloned().collect();
        schemes.sort();
        schemes
    }

    pub fn adapter(&self, scheme: &str) -> Option<Arc<dyn ProtocolAdapter>> {
        self.adapters.read().get(scheme).cloned()
    }

    /// Node for a locator.
    pub fn resolve(self: &Arc<Self>, locator: &Locator) -> VfsResult<NodeRef> {
        self.resolve_with(locator, &ExtraParams::default())
    }

    pub fn resolve_with(self: &Arc<Self>, locator: &Locator, params: &ExtraParams) -> VfsResult<NodeRef> {
        let adapter = self
            .adapter(locator.scheme())
            .ok_or_else(|| VfsError::UnknownScheme(locator.scheme().to_string()))?;
        debug!(locator = %locator.redacted(), "resolving");
        adapter.create(self, locator.clone(), params)
    }

    /// Parse and resolve. Bare absolute paths are local files.
    pub fn resolve_str(self: &Arc<Self>, input: &str) -> VfsResult<NodeRef> {
        let locator = if input.starts_with('/') {
            Locator::from_local_path(std::path::Path::new(input))
        } else {
            Locator::parse(input)?
        };
        self.resolve(&locator)
    }

    /// A node that can be listed: directories as they are, archives as their
    /// archive root, `None` for everything else.
    pub async fn as_browsable(self: &Arc<Self>, node: NodeRef) -> VfsResult<Option<NodeRef>> {
        if node.is_directory().await? {
            return Ok(Some(node));
        }
        let locator = node.locator();
        if locator.scheme() != "tar" && is_archive_name(locator.name()) && node.exists().await? {
            return self.resolve(&archive_root_locator(locator)).map(Some);
        }
        Ok(None)
    }
}

impl fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}
