//! VFS configuration.
//!
//! Loaded from TOML. Every field has a default from [`crate::constants`], so
//! an empty file (or no file at all) is a valid configuration.
//!
//! ```toml
//! [cache]
//! remote_ttl_ms = 10000
//! ttl_overrides = { gdrive = 60000 }
//!
//! [pool]
//! max_connections_per_host = 2
//!
//! [gdrive]
//! client_id_env = "MY_DRIVE_CLIENT_ID"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{VfsError, VfsResult};

/// Top-level VFS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VfsConfig {
    pub cache: CacheConfig,
    pub pool: PoolConfig,
    pub sftp: SftpConfig,
    pub gdrive: DriveConfig,
    pub search: SearchConfig,
}

/// Attribute cache lifetimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL for the `file` scheme. Zero disables caching.
    pub local_ttl_ms: u64,
    /// TTL for every other scheme unless overridden.
    pub remote_ttl_ms: u64,
    /// TTL of SFTP symlink target lookups.
    pub symlink_ttl_ms: u64,
    /// Per-scheme TTL overrides.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub ttl_overrides: HashMap<String, u64>,
    /// TAR indexes kept in memory at once.
    pub archive_indexes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_ttl_ms: constants::LOCAL_ATTR_TTL.as_millis() as u64,
            remote_ttl_ms: constants::REMOTE_ATTR_TTL.as_millis() as u64,
            symlink_ttl_ms: constants::SYMLINK_TARGET_TTL.as_millis() as u64,
            ttl_overrides: HashMap::new(),
            archive_indexes: constants::MAX_ARCHIVE_INDEXES,
        }
    }
}

impl CacheConfig {
    /// Attribute TTL for a scheme.
    pub fn ttl_for(&self, scheme: &str) -> Duration {
        if let Some(ms) = self.ttl_overrides.get(scheme) {
            return Duration::from_millis(*ms);
        }
        if scheme == "file" {
            Duration::from_millis(self.local_ttl_ms)
        } else {
            Duration::from_millis(self.remote_ttl_ms)
        }
    }

    pub fn symlink_ttl(&self) -> Duration {
        Duration::from_millis(self.symlink_ttl_ms)
    }
}

/// Connection pool limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub connect_timeout_secs: u64,
    pub keep_alive_interval_secs: u64,
    /// Zero keeps idle handlers open forever.
    pub idle_timeout_secs: u64,
    pub max_connections_per_host: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: constants::CONNECT_TIMEOUT.as_secs(),
            keep_alive_interval_secs: constants::KEEP_ALIVE_INTERVAL.as_secs(),
            idle_timeout_secs: constants::IDLE_TIMEOUT.as_secs(),
            max_connections_per_host: constants::MAX_CONNECTIONS_PER_HOST,
        }
    }
}

impl PoolConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// SSH transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SftpConfig {
    /// Reject hosts missing from `known_hosts` instead of warning.
    pub strict_host_keys: bool,
    pub inactivity_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self {
            strict_host_keys: false,
            inactivity_timeout_secs: constants::SSH_INACTIVITY_TIMEOUT.as_secs(),
            keepalive_interval_secs: constants::SSH_KEEPALIVE_INTERVAL.as_secs(),
        }
    }
}

/// Google Drive settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// Where per-host OAuth tokens are stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Environment variable holding the client id (alternative to inline).
    pub client_id_env: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    pub client_secret_env: String,

    pub api_base_url: String,
    pub token_url: String,
    pub upload_buffer_chunks: usize,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            credentials_dir: None,
            client_id: None,
            client_id_env: "UNIFS_GDRIVE_CLIENT_ID".into(),
            client_secret: None,
            client_secret_env: "UNIFS_GDRIVE_CLIENT_SECRET".into(),
            api_base_url: constants::DRIVE_API_BASE.into(),
            token_url: constants::OAUTH_TOKEN_URL.into(),
            upload_buffer_chunks: constants::UPLOAD_BUFFER_CHUNKS,
        }
    }
}

impl DriveConfig {
    /// Resolve the OAuth client id from config or environment.
    pub fn resolve_client_id(&self) -> Option<String> {
        self.client_id
            .clone()
            .or_else(|| std::env::var(&self.client_id_env).ok())
    }

    /// Resolve the OAuth client secret from config or environment.
    pub fn resolve_client_secret(&self) -> Option<String> {
        self.client_secret
            .clone()
            .or_else(|| std::env::var(&self.client_secret_env).ok())
    }

    /// Token directory, defaulting to `<config_dir>/unifs/credentials/gdrive`.
    pub fn resolve_credentials_dir(&self) -> PathBuf {
        self.credentials_dir.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("unifs")
                .join("credentials")
                .join("gdrive")
        })
    }
}

/// Search defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_threads: usize,
    pub max_text_bytes: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_threads: constants::SEARCH_THREADS,
            max_text_bytes: constants::MAX_TEXT_BYTES,
        }
    }
}

impl VfsConfig {
    /// Default config file location, `<config_dir>/unifs/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("unifs").join("config.toml"))
    }

    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> VfsResult<Self> {
        toml::from_str(text).map_err(|e| VfsError::Config(e.to_string()))
    }

    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, the default location is
    /// used when present; otherwise defaults apply.
    pub fn load(path: Option<&Path>) -> VfsResult<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) if p.exists() => p,
                _ => {
                    tracing::debug!("no config file, using defaults");
                    return Ok(Self::default());
                }
            },
        };
        let text = std::fs::read_to_string(&path)
            .map_err(|e| VfsError::Config(format!("{}: {e}", path.display())))?;
        let config = Self::from_toml(&text)?;
        tracing::info!(path = %path.display(), "loaded config");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let c = VfsConfig::from_toml("").unwrap();
        assert_eq!(c.cache.ttl_for("file"), Duration::ZERO);
        assert_eq!(c.cache.ttl_for("sftp"), constants::REMOTE_ATTR_TTL);
        assert_eq!(c.pool.max_connections_per_host, constants::MAX_CONNECTIONS_PER_HOST);
        assert_eq!(c.search.default_threads, constants::SEARCH_THREADS);
    }

    #[test]
    fn overrides_apply_per_scheme() {
        let c = VfsConfig::from_toml(
            r#"
            [cache]
            remote_ttl_ms = 5000
            ttl_overrides = { gdrive = 60000 }

            [pool]
            idle_timeout_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(c.cache.ttl_for("sftp"), Duration::from_secs(5));
        assert_eq!(c.cache.ttl_for("gdrive"), Duration::from_secs(60));
        assert_eq!(c.pool.idle_timeout(), None);
    }

    #[test]
    fn bad_toml_is_config_error() {
        let err = VfsConfig::from_toml("[cache\nremote").unwrap_err();
        assert!(matches!(err, VfsError::Config(_)));
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[search]\ndefault_threads = 8\n").unwrap();
        let c = VfsConfig::load(Some(&path)).unwrap();
        assert_eq!(c.search.default_threads, 8);

        let missing = dir.path().join("nope.toml");
        assert!(VfsConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn inline_client_id_wins_over_env() {
        let mut c = DriveConfig::default();
        c.client_id = Some("inline".into());
        c.client_id_env = "UNIFS_TEST_UNSET_CLIENT_ID".into();
        assert_eq!(c.resolve_client_id().as_deref(), Some("inline"));
        c.client_id = None;
        assert_eq!(c.resolve_client_id(), None);
    }
}
