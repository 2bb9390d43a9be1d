//! russh transport for the SFTP backend.
//!
//! Authenticates with the locator's password when one is given, otherwise
//! with every identity the SSH agent offers. Host keys are checked against
//! `~/.ssh/known_hosts`; unknown hosts are accepted with a warning unless
//! `strict_host_keys` is set. A changed key is always rejected.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::keys::agent::client::AgentClient;
use russh::keys::{HashAlg, PublicKey};
use russh::Disconnect;
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::{FileAttributes as SftpAttributes, OpenFlags, StatusCode};
use tracing::{debug, info, warn};

use super::channel::{RemoteAttrs, RemoteEntry, RemoteKind, SftpChannel, SftpDialer};
use crate::config::SftpConfig;
use crate::constants::{DEFAULT_SSH_PORT, SSH_KEEPALIVE_MAX};
use crate::error::{VfsError, VfsResult};
use crate::pool::ConnectionKey;
use crate::types::{RandomReadStream, ReadStream, WriteStream};

#[derive(Debug, thiserror::Error)]
enum SshError {
    #[error(transparent)]
    Ssh(#[from] russh::Error),
    #[error("host key rejected: {0}")]
    HostKey(String),
}

struct HostKeyCheck {
    host: String,
    port: u16,
    strict: bool,
}

impl client::Handler for HostKeyCheck {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256);
        match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) if !self.strict => {
                warn!(host = %self.host, %fingerprint, "accepting host key missing from known_hosts");
                Ok(true)
            }
            Ok(false) => Err(SshError::HostKey(format!(
                "{} ({fingerprint}) is not in known_hosts",
                self.host
            ))),
            Err(e) => Err(SshError::HostKey(format!("{} ({fingerprint}): {e}", self.host))),
        }
    }
}

/// Opens SFTP sessions over russh.
#[derive(Debug, Clone)]
pub struct RusshDialer {
    config: SftpConfig,
}

impl RusshDialer {
    pub fn new(config: SftpConfig) -> Self {
        Self { config }
    }

    fn client_config(&self) -> Config {
        Config {
            inactivity_timeout: Some(Duration::from_secs(self.config.inactivity_timeout_secs)),
            keepalive_interval: Some(Duration::from_secs(self.config.keepalive_interval_secs)),
            keepalive_max: SSH_KEEPALIVE_MAX,
            ..<_>::default()
        }
    }
}

#[async_trait]
impl SftpDialer for RusshDialer {
    async fn dial(&self, key: &ConnectionKey) -> VfsResult<Arc<dyn SftpChannel>> {
        let target = key.to_string();
        let host = key.host.trim_start_matches('[').trim_end_matches(']').to_string();
        let port = key.port.unwrap_or(DEFAULT_SSH_PORT);
        let user = key
            .user()
            .map(str::to_string)
            .unwrap_or_else(whoami::username);

        let handler = HostKeyCheck {
            host: host.clone(),
            port,
            strict: self.config.strict_host_keys,
        };
        let mut session = client::connect(Arc::new(self.client_config()), (host.as_str(), port), handler)
            .await
            .map_err(|e| match e {
                SshError::HostKey(msg) => VfsError::auth(&target, msg),
                SshError::Ssh(e) => VfsError::transport(&target, e.to_string()),
            })?;
        debug!(target = %target, "ssh connected, authenticating");

        let authenticated = match key.password() {
            Some(password) => session
                .authenticate_password(user.clone(), password)
                .await
                .map_err(|e| VfsError::transport(&target, e.to_string()))?
                .success(),
            None => authenticate_with_agent(&mut session, &user, &target).await?,
        };
        if !authenticated {
            return Err(VfsError::auth(&target, format!("credentials for {user} rejected")));
        }

        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| VfsError::transport(&target, e.to_string()))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| VfsError::transport(&target, e.to_string()))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| map_error(&target, "/", e))?;

        info!(target = %target, user = %user, "sftp session open");
        Ok(Arc::new(RusshSftp {
            target,
            handle: session,
            sftp,
        }))
    }
}

async fn authenticate_with_agent(
    session: &mut Handle<HostKeyCheck>,
    user: &str,
    target: &str,
) -> VfsResult<bool> {
    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|e| VfsError::auth(target, format!("ssh agent: {e}")))?;
    let keys = agent
        .request_identities()
        .await
        .map_err(|e| VfsError::auth(target, format!("ssh agent: {e}")))?;
    if keys.is_empty() {
        return Err(VfsError::auth(target, "no password given and the ssh agent holds no keys"));
    }

    for key in &keys {
        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        match session
            .authenticate_publickey_with(user, key.clone(), hash_alg, &mut agent)
            .await
        {
            Ok(result) if result.success() => {
                debug!(user, fingerprint = %key.fingerprint(HashAlg::Sha256), "agent key accepted");
                return Ok(true);
            }
            Ok(_) => debug!(fingerprint = %key.fingerprint(HashAlg::Sha256), "agent key rejected"),
            Err(e) => warn!(error = %e, "agent authentication error"),
        }
    }
    Ok(false)
}

fn map_error(target: &str, path: &str, err: SftpError) -> VfsError {
    match err {
        SftpError::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => VfsError::not_found(path),
            StatusCode::PermissionDenied => VfsError::PermissionDenied(path.to_string()),
            StatusCode::NoConnection | StatusCode::ConnectionLost => {
                VfsError::transport(target, status.error_message)
            }
            StatusCode::OpUnsupported => {
                VfsError::other(format!("{path}: not supported by the server"))
            }
            _ => VfsError::other(format!("{path}: {}", status.error_message)),
        },
        SftpError::Timeout => VfsError::Timeout(format!("{target}: sftp request timed out")),
        other => VfsError::transport(target, other.to_string()),
    }
}

fn remote_attrs(attrs: &SftpAttributes) -> RemoteAttrs {
    let mode = attrs.permissions.unwrap_or(0);
    RemoteAttrs {
        kind: RemoteKind::from_mode(mode),
        size: attrs.size.unwrap_or(0),
        permissions: mode & 0o7777,
        mtime: attrs.mtime,
        owner: attrs.user.clone().or_else(|| attrs.uid.map(|u| u.to_string())),
        group: attrs.group.clone().or_else(|| attrs.gid.map(|g| g.to_string())),
    }
}

/// One SSH connection carrying one SFTP subsystem channel.
struct RusshSftp {
    target: String,
    handle: Handle<HostKeyCheck>,
    sftp: SftpSession,
}

impl RusshSftp {
    fn err(&self, path: &str) -> impl FnOnce(SftpError) -> VfsError + '_ {
        let path = path.to_string();
        move |e| map_error(&self.target, &path, e)
    }
}

#[async_trait]
impl SftpChannel for RusshSftp {
    async fn lstat(&self, path: &str) -> VfsResult<RemoteAttrs> {
        let attrs = self.sftp.symlink_metadata(path).await.map_err(self.err(path))?;
        Ok(remote_attrs(&attrs))
    }

    async fn stat(&self, path: &str) -> VfsResult<RemoteAttrs> {
        let attrs = self.sftp.metadata(path).await.map_err(self.err(path))?;
        Ok(remote_attrs(&attrs))
    }

    async fn canonicalize(&self, path: &str) -> VfsResult<String> {
        self.sftp.canonicalize(path).await.map_err(self.err(path))
    }

    async fn read_dir(&self, path: &str) -> VfsResult<Vec<RemoteEntry>> {
        let dir = self.sftp.read_dir(path).await.map_err(self.err(path))?;
        Ok(dir
            .map(|entry| RemoteEntry {
                name: entry.file_name(),
                attrs: remote_attrs(&entry.metadata()),
            })
            .collect())
    }

    async fn open_read(&self, path: &str) -> VfsResult<ReadStream> {
        let file = self.sftp.open(path).await.map_err(self.err(path))?;
        Ok(Box::pin(file))
    }

    async fn open_random(&self, path: &str) -> VfsResult<RandomReadStream> {
        let file = self.sftp.open(path).await.map_err(self.err(path))?;
        Ok(Box::pin(file))
    }

    async fn open_write(&self, path: &str, append: bool) -> VfsResult<WriteStream> {
        let mode = if append {
            OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::APPEND
        } else {
            OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::TRUNCATE
        };
        let file = self
            .sftp
            .open_with_flags(path, mode)
            .await
            .map_err(self.err(path))?;
        Ok(Box::pin(file))
    }

    async fn mkdir(&self, path: &str) -> VfsResult<()> {
        self.sftp.create_dir(path).await.map_err(self.err(path))
    }

    async fn remove_file(&self, path: &str) -> VfsResult<()> {
        self.sftp.remove_file(path).await.map_err(self.err(path))
    }

    async fn remove_dir(&self, path: &str) -> VfsResult<()> {
        self.sftp.remove_dir(path).await.map_err(self.err(path))
    }

    async fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        self.sftp.rename(from, to).await.map_err(self.err(from))
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> VfsResult<()> {
        let mut attrs = SftpAttributes::empty();
        attrs.permissions = Some(mode & 0o7777);
        self.sftp.set_metadata(path, attrs).await.map_err(self.err(path))
    }

    async fn set_mtime(&self, path: &str, mtime: u32) -> VfsResult<()> {
        // SFTP v3 sets access and modification times together.
        let mut attrs = SftpAttributes::empty();
        attrs.atime = Some(mtime);
        attrs.mtime = Some(mtime);
        self.sftp.set_metadata(path, attrs).await.map_err(self.err(path))
    }

    async fn close(&self) -> VfsResult<()> {
        if let Err(e) = self.sftp.close().await {
            debug!(target = %self.target, error = %e, "sftp close failed");
        }
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| VfsError::transport(&self.target, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_sftp::protocol::Status;

    fn status(code: StatusCode) -> SftpError {
        SftpError::Status(Status {
            id: 1,
            status_code: code,
            error_message: "nope".into(),
            language_tag: "en".into(),
        })
    }

    #[test]
    fn status_codes_map_to_error_kinds() {
        assert!(map_error("h", "/a", status(StatusCode::NoSuchFile)).is_not_found());
        assert!(matches!(
            map_error("h", "/a", status(StatusCode::PermissionDenied)),
            VfsError::PermissionDenied(_)
        ));
        assert!(map_error("h", "/a", status(StatusCode::ConnectionLost)).is_fatal());
        assert!(!map_error("h", "/a", status(StatusCode::Failure)).is_fatal());
        assert!(map_error("h", "/a", SftpError::Timeout).is_fatal());
    }

    #[test]
    fn attributes_split_type_and_permission_bits() {
        let mut attrs = SftpAttributes::empty();
        attrs.permissions = Some(0o120777);
        attrs.uid = Some(1000);
        let remote = remote_attrs(&attrs);
        assert_eq!(remote.kind, RemoteKind::Symlink);
        assert_eq!(remote.permissions, 0o777);
        assert_eq!(remote.owner.as_deref(), Some("1000"));
    }
}
