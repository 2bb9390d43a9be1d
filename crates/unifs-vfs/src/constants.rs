//! VFS configuration defaults.
//!
//! Centralizes hardcoded values; `VfsConfig` overrides them.

use std::time::Duration;

/// Attribute TTL for the local filesystem. Zero disables caching.
pub const LOCAL_ATTR_TTL: Duration = Duration::ZERO;

/// Attribute TTL for remote backends.
pub const REMOTE_ATTR_TTL: Duration = Duration::from_secs(30);

/// Archive indexes kept in memory; the least recently used go first.
pub const MAX_ARCHIVE_INDEXES: usize = 32;

/// TTL of the SFTP symlink canonical-path lookup.
pub const SYMLINK_TARGET_TTL: Duration = Duration::from_secs(60);

/// Bound on establishing a remote session.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Idle handlers older than this are pinged.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Idle handlers older than this are closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Handlers per authority for non-exclusive acquires.
pub const MAX_CONNECTIONS_PER_HOST: usize = 4;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// SSH inactivity timeout.
pub const SSH_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

/// SSH keep-alive interval at the transport level.
pub const SSH_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// SSH keep-alive max retries.
pub const SSH_KEEPALIVE_MAX: usize = 3;

/// Google Drive REST endpoint.
pub const DRIVE_API_BASE: &str = "https://www.googleapis.com";

/// OAuth token endpoint used to refresh Drive access tokens.
pub const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// OAuth consent page for the Drive login flow.
pub const OAUTH_AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";

/// Scope requested for Drive access.
pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";

/// Access tokens this close to expiry are refreshed before use.
pub const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Chunks buffered between a Drive writer and its uploader task.
pub const UPLOAD_BUFFER_CHUNKS: usize = 16;

/// Parallel listings per search job.
pub const SEARCH_THREADS: usize = 2;

/// Bytes scanned per file when matching content.
pub const MAX_TEXT_BYTES: u64 = 16 * 1024 * 1024;
