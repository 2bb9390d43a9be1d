//! OAuth credentials for Drive.
//!
//! Tokens are stored per host label as JSON files under the credentials
//! directory. The dialer loads the token, refreshes it through the token
//! endpoint when it is about to expire, and hands out an authorized
//! [`HttpDriveApi`] together with the token's expiry. The pool reopens a
//! client whose token is about to expire before handing it out again.

use std::fmt;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use super::api::{DriveApi, HttpDriveApi, check_status, request_error};
use crate::config::DriveConfig;
use crate::constants::{DRIVE_SCOPE, OAUTH_AUTHORIZE_URL, TOKEN_REFRESH_MARGIN};
use crate::error::{VfsError, VfsResult};
use crate::pool::ConnectionKey;

/// Host label used when a locator has none.
const DEFAULT_ACCOUNT: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

fn expires_soon(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    let margin = chrono::Duration::from_std(TOKEN_REFRESH_MARGIN).unwrap_or_default();
    expires_at.is_some_and(|at| at <= now + margin)
}

impl StoredToken {
    /// Expired, or within the refresh margin of expiring.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        expires_soon(self.expires_at, now)
    }
}

/// An authorized client and the expiry of the token it was built with.
#[derive(Clone)]
pub struct DriveClient {
    pub api: Arc<dyn DriveApi>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl DriveClient {
    /// A client whose token never expires.
    pub fn new(api: Arc<dyn DriveApi>) -> Self {
        Self {
            api,
            expires_at: None,
        }
    }

    pub fn expiring(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        expires_soon(self.expires_at, now)
    }
}

impl fmt::Debug for DriveClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriveClient")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Per-host token files.
#[derive(Debug, Clone)]
pub struct TokenStore {
    dir: PathBuf,
}

impl TokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the token for `host`.
    pub fn path_for(&self, host: &str) -> PathBuf {
        let host = if host.is_empty() { DEFAULT_ACCOUNT } else { host };
        let label: String = host
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || "-_.@".contains(c) { c } else { '_' })
            .collect();
        self.dir.join(format!("{label}.json"))
    }

    pub async fn load(&self, host: &str) -> VfsResult<Option<StoredToken>> {
        let path = self.path_for(host);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| VfsError::Config(format!("{}: {e}", path.display())))
    }

    pub async fn save(&self, host: &str, token: &StoredToken) -> VfsResult<()> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(host);
        let text = serde_json::to_string_pretty(token)
            .map_err(|e| VfsError::other(format!("encoding token: {e}")))?;
        fs::write(&path, text).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        debug!(path = %path.display(), "saved drive token");
        Ok(())
    }

    pub async fn remove(&self, host: &str) -> VfsResult<()> {
        match fs::remove_file(self.path_for(host)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl TokenResponse {
    fn into_token(self, previous_refresh: Option<String>) -> StoredToken {
        StoredToken {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at: self
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        }
    }
}

/// OAuth installed-app client for Google.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: reqwest::Client,
    token_url: String,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl OAuthClient {
    pub fn new(http: reqwest::Client, config: &DriveConfig) -> Self {
        Self {
            http,
            token_url: config.token_url.clone(),
            client_id: config.resolve_client_id(),
            client_secret: config.resolve_client_secret(),
        }
    }

    fn client_id(&self) -> VfsResult<&str> {
        self.client_id
            .as_deref()
            .ok_or_else(|| VfsError::Config("no Drive OAuth client id configured".into()))
    }

    /// Consent page the user opens to grant access.
    pub fn authorize_url(&self, redirect_uri: &str) -> VfsResult<String> {
        Ok(format!(
            "{OAUTH_AUTHORIZE_URL}?client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&prompt=consent",
            urlencoding::encode(self.client_id()?),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(DRIVE_SCOPE),
        ))
    }

    /// Trade an authorization code for tokens.
    pub async fn exchange_code(&self, code: &str, redirect_uri: &str) -> VfsResult<StoredToken> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.client_id()?),
            ("client_secret", self.client_secret.as_deref().unwrap_or_default()),
        ];
        self.token_request(&form, None).await
    }

    pub async fn refresh(&self, token: &StoredToken) -> VfsResult<StoredToken> {
        let refresh_token = token.refresh_token.as_deref().ok_or_else(|| {
            VfsError::auth("gdrive", "access token expired and no refresh token is stored")
        })?;
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id()?),
            ("client_secret", self.client_secret.as_deref().unwrap_or_default()),
        ];
        self.token_request(&form, token.refresh_token.clone()).await
    }

    async fn token_request(
        &self,
        form: &[(&str, &str)],
        previous_refresh: Option<String>,
    ) -> VfsResult<StoredToken> {
        let response = self
            .http
            .post(&self.token_url)
            .form(form)
            .send()
            .await
            .map_err(|e| request_error("oauth", e))?;
        // The token endpoint answers 400 for revoked or invalid grants.
        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            return Err(VfsError::auth("oauth", body));
        }
        let parsed: TokenResponse = check_status("oauth", "token", response)
            .await?
            .json()
            .await
            .map_err(|e| VfsError::transport("oauth", format!("bad token response: {e}")))?;
        Ok(parsed.into_token(previous_refresh))
    }
}

/// Opens authorized Drive clients.
#[async_trait]
pub trait DriveDialer: Send + Sync + 'static {
    async fn dial(&self, key: &ConnectionKey) -> VfsResult<DriveClient>;
}

/// Dialer backed by the token store and the OAuth endpoint.
#[derive(Debug, Clone)]
pub struct OAuthDriveDialer {
    store: TokenStore,
    oauth: OAuthClient,
    http: reqwest::Client,
    api_base_url: String,
}

impl OAuthDriveDialer {
    pub fn new(config: &DriveConfig) -> Self {
        let http = reqwest::Client::new();
        Self {
            store: TokenStore::new(config.resolve_credentials_dir()),
            oauth: OAuthClient::new(http.clone(), config),
            http,
            api_base_url: config.api_base_url.clone(),
        }
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub fn oauth(&self) -> &OAuthClient {
        &self.oauth
    }
}

#[async_trait]
impl DriveDialer for OAuthDriveDialer {
    async fn dial(&self, key: &ConnectionKey) -> VfsResult<DriveClient> {
        let target = key.to_string();
        let mut token = self.store.load(&key.host).await?.ok_or_else(|| {
            VfsError::auth(
                &target,
                format!("no stored credentials; run `unifs drive-login {}`", key.host),
            )
        })?;
        if token.needs_refresh(Utc::now()) {
            token = self.oauth.refresh(&token).await?;
            self.store.save(&key.host, &token).await?;
            info!(target = %target, "refreshed drive token");
        }
        let api = HttpDriveApi::new(self.http.clone(), &self.api_base_url, token.access_token, target);
        Ok(DriveClient::new(Arc::new(api)).expiring(token.expires_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn token(expires_at: Option<DateTime<Utc>>) -> StoredToken {
        StoredToken {
            access_token: "a".into(),
            refresh_token: Some("r".into()),
            expires_at,
        }
    }

    #[tokio::test]
    async fn store_round_trips_tokens_per_host() {
        let tmp = TempDir::new().unwrap();
        let store = TokenStore::new(tmp.path().join("gdrive"));
        assert_eq!(store.load("work").await.unwrap(), None);

        let saved = token(Some(Utc::now()));
        store.save("work", &saved).await.unwrap();
        assert_eq!(store.load("work").await.unwrap(), Some(saved));
        assert_eq!(store.load("home").await.unwrap(), None);

        store.remove("work").await.unwrap();
        store.remove("work").await.unwrap();
        assert_eq!(store.load("work").await.unwrap(), None);
    }

    #[test]
    fn host_labels_become_safe_file_names() {
        let store = TokenStore::new("/creds");
        assert_eq!(store.path_for(""), Path::new("/creds/default.json"));
        assert_eq!(store.path_for("a/b"), Path::new("/creds/a_b.json"));
    }

    #[test]
    fn refresh_is_needed_near_expiry() {
        let now = Utc::now();
        assert!(!token(None).needs_refresh(now));
        assert!(token(Some(now + chrono::Duration::seconds(30))).needs_refresh(now));
        assert!(!token(Some(now + chrono::Duration::hours(1))).needs_refresh(now));
    }

    #[tokio::test]
    async fn stored_expiry_reaches_the_pooled_client() {
        let tmp = TempDir::new().unwrap();
        let config = DriveConfig {
            credentials_dir: Some(tmp.path().to_path_buf()),
            ..DriveConfig::default()
        };
        let dialer = OAuthDriveDialer::new(&config);
        let expires_at = Utc::now() + chrono::Duration::hours(1);
        dialer.store().save("work", &token(Some(expires_at))).await.unwrap();

        let key = ConnectionKey::from_locator(&crate::Locator::parse("gdrive://work/").unwrap());
        let client = dialer.dial(&key).await.unwrap();
        assert_eq!(client.expires_at, Some(expires_at));
        assert!(!client.needs_refresh(Utc::now()));
        assert!(client.needs_refresh(expires_at));
    }

    #[tokio::test]
    async fn missing_credentials_are_an_auth_error() {
        let tmp = TempDir::new().unwrap();
        let config = DriveConfig {
            credentials_dir: Some(tmp.path().to_path_buf()),
            ..DriveConfig::default()
        };
        let dialer = OAuthDriveDialer::new(&config);
        let key = ConnectionKey::from_locator(&crate::Locator::parse("gdrive://work/").unwrap());
        let err = dialer.dial(&key).await.err().unwrap();
        assert!(err.is_auth());
    }

    #[test]
    fn authorize_url_requires_a_client_id() {
        let config = DriveConfig {
            client_id: Some("cid".into()),
            ..DriveConfig::default()
        };
        let oauth = OAuthClient::new(reqwest::Client::new(), &config);
        let url = oauth.authorize_url("http://localhost").unwrap();
        assert!(url.contains("client_id=cid"));
        assert!(url.contains("access_type=offline"));
    }
}
