//! unifs virtual file layer.
//!
//! One abstract file interface over local disks, SFTP servers, Google Drive,
//! TAR archives and search results, so callers never write protocol-specific
//! code.
//!
//! # Layers
//!
//! Leaf to root:
//!
//! - [`Locator`]: parsed, normalized address of a file.
//! - [`AttributeCache`]: time-bounded metadata snapshot per node.
//! - [`ConnectionPool`]: per-authority connection handlers with mutual
//!   exclusion for stateful protocols.
//! - [`FileNode`]: the operations every backend exposes.
//! - [`ProtocolRegistry`]: scheme to adapter mapping, explicit and owned by
//!   the caller.
//! - [`search`]: parallel, depth-bounded recursive search.
//!
//! # Example
//!
//! ```no_run
//! # async fn demo() -> unifs_vfs::VfsResult<()> {
//! use unifs_vfs::{ProtocolRegistry, VfsConfig};
//!
//! let registry = ProtocolRegistry::with_defaults(VfsConfig::default());
//! let dir = registry.resolve_str("sftp://amy@build-box/var/log")?;
//! for child in dir.list().await? {
//!     println!("{} {}", child.locator(), child.size().await?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod attr_cache;
pub mod backends;
pub mod config;
pub mod constants;
pub mod error;
pub mod locator;
pub mod node;
pub mod pool;
pub mod registry;
pub mod search;
pub mod types;

pub use attr_cache::{AttrField, AttrValue, AttributeCache, Clock, ManualClock, SystemClock};
pub use config::VfsConfig;
pub use error::{FileOp, ResultExt, VfsError, VfsResult};
pub use locator::{Credentials, Locator};
pub use node::{FileNode, NodeRef};
pub use pool::{
    ConnectionGuard, ConnectionKey, ConnectionPool, ConnectionState, Connector, Leased, SessionLease,
};
pub use registry::{ExtraParams, ProtocolAdapter, ProtocolRegistry};
pub use types::{
    FileAttributes, FilePermissions, PermissionAccess, PermissionKind, RandomReadStream,
    RandomWriteStream, ReadStream, WriteStream,
};
