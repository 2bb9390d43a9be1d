//! Parallel, depth-bounded recursive search over file nodes.
//!
//! ```no_run
//! # async fn demo() -> unifs_vfs::VfsResult<()> {
//! use unifs_vfs::search::{SearchJob, SearchQuery};
//! use unifs_vfs::{ProtocolRegistry, VfsConfig};
//!
//! let registry = ProtocolRegistry::with_defaults(VfsConfig::default());
//! let query = SearchQuery::from_pairs([("q", "*.log"), ("depth", "2")])?;
//! let job = SearchJob::builder([registry.resolve_str("/var/log")?])
//!     .matcher(query.filter(1 << 20)?)
//!     .browser(query.browser())
//!     .depth(query.depth)
//!     .registry(registry.clone())
//!     .build();
//! for hit in job.run().await.snapshot() {
//!     println!("{}", hit.locator());
//! }
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod predicate;
pub mod query;

pub use engine::{SearchDepth, SearchEvent, SearchJob, SearchJobBuilder, SearchResults};
pub use predicate::{
    Browser, DescendPredicate, Directories, FileFilter, MatchAll, MatchPredicate, NameMatcher,
    TextMatcher,
};
pub use query::{SearchQuery, SizeClause, SizeRelation, SizeUnit};
