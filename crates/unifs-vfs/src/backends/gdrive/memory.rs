//! In-memory Drive for tests.

use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::api::{
    ByteStream, DriveApi, DriveFile, DriveQuery, DriveUpdate, DriveUser, FOLDER_MIME, ROOT_ID,
    UploadTarget,
};
use super::credentials::{DriveClient, DriveDialer};
use crate::error::{VfsError, VfsResult};
use crate::pool::ConnectionKey;
use crate::types::ReadStream;

#[derive(Debug, Default)]
struct DriveState {
    files: Mutex<BTreeMap<String, (DriveFile, Vec<u8>)>>,
    shared: Mutex<HashSet<String>>,
    next_id: AtomicU64,
    calls: AtomicUsize,
    dials: AtomicUsize,
    revoked: AtomicBool,
    token_lifetime: Mutex<Option<chrono::Duration>>,
    hold_uploads: AtomicBool,
    upload_gate: Notify,
}

/// An in-memory Drive account that is both the dialer and the client.
#[derive(Debug, Clone, Default)]
pub struct MemoryDrive {
    state: Arc<DriveState>,
}

impl MemoryDrive {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, parent: &str, name: &str, mime: &str, data: Vec<u8>) -> String {
        let id = format!("id{}", self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let file = DriveFile {
            id: id.clone(),
            name: name.into(),
            mime_type: mime.into(),
            parents: vec![parent.into()],
            size: (mime != FOLDER_MIME).then_some(data.len() as u64),
            modified_time: Some(Utc::now()),
            trashed: false,
            owners: vec![DriveUser {
                display_name: Some("Test".into()),
                email_address: Some("test@example.com".into()),
            }],
        };
        self.state.files.lock().insert(id.clone(), (file, data));
        id
    }

    pub fn add_folder(&self, parent: &str, name: &str) -> String {
        self.insert(parent, name, FOLDER_MIME, Vec::new())
    }

    pub fn add_file(&self, parent: &str, name: &str, data: impl Into<Vec<u8>>) -> String {
        self.insert(parent, name, "application/octet-stream", data.into())
    }

    pub fn set_trashed(&self, id: &str, trashed: bool) {
        if let Some((file, _)) = self.state.files.lock().get_mut(id) {
            file.trashed = trashed;
        }
    }

    /// Mark an item as shared with the account.
    pub fn share(&self, id: &str) {
        self.state.shared.lock().insert(id.into());
    }

    pub fn file(&self, id: &str) -> Option<DriveFile> {
        self.state.files.lock().get(id).map(|(f, _)| f.clone())
    }

    /// First item with this name, trashed or not.
    pub fn find(&self, name: &str) -> Option<DriveFile> {
        self.state
            .files
            .lock()
            .values()
            .find(|(f, _)| f.name == name)
            .map(|(f, _)| f.clone())
    }

    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        self.state.files.lock().get(id).map(|(_, d)| d.clone())
    }

    /// API calls served so far.
    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn dials(&self) -> usize {
        self.state.dials.load(Ordering::SeqCst)
    }

    /// Reject calls as if the access token had been revoked.
    pub fn revoke(&self, revoked: bool) {
        self.state.revoked.store(revoked, Ordering::SeqCst);
    }

    /// Tokens handed out by later dials expire this long after the dial.
    /// Negative lifetimes hand out tokens that are already expired.
    pub fn set_token_lifetime(&self, lifetime: chrono::Duration) {
        *self.state.token_lifetime.lock() = Some(lifetime);
    }

    /// Uploads wait for [`release_uploads`](Self::release_uploads) before
    /// reading their body.
    pub fn hold_uploads(&self) {
        self.state.hold_uploads.store(true, Ordering::SeqCst);
    }

    pub fn release_uploads(&self) {
        self.state.hold_uploads.store(false, Ordering::SeqCst);
        self.state.upload_gate.notify_waiters();
        self.state.upload_gate.notify_one();
    }

    fn begin(&self) -> VfsResult<()> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        if self.state.revoked.load(Ordering::SeqCst) {
            return Err(VfsError::auth("gdrive", "token revoked"));
        }
        Ok(())
    }

    fn require_folder(&self, id: &str) -> VfsResult<()> {
        if id == ROOT_ID {
            return Ok(());
        }
        match self.state.files.lock().get(id) {
            Some((f, _)) if f.is_folder() => Ok(()),
            Some(_) => Err(VfsError::not_a_directory(id)),
            None => Err(VfsError::not_found(id)),
        }
    }

    fn matches(&self, query: &DriveQuery, file: &DriveFile) -> bool {
        match query {
            DriveQuery::Children { parent, include_trashed } => {
                file.parents.contains(parent) && (*include_trashed || !file.trashed)
            }
            DriveQuery::Named {
                parent,
                name,
                include_trashed,
            } => &file.name == name && file.parents.contains(parent) && (*include_trashed || !file.trashed),
            DriveQuery::SharedWithMe => !file.trashed && self.state.shared.lock().contains(&file.id),
            DriveQuery::Trashed => file.trashed,
        }
    }
}

#[async_trait]
impl DriveDialer for MemoryDrive {
    async fn dial(&self, _key: &ConnectionKey) -> VfsResult<DriveClient> {
        self.state.dials.fetch_add(1, Ordering::SeqCst);
        let expires_at = self.state.token_lifetime.lock().map(|l| Utc::now() + l);
        Ok(DriveClient::new(Arc::new(self.clone())).expiring(expires_at))
    }
}

#[async_trait]
impl DriveApi for MemoryDrive {
    async fn list(&self, query: &DriveQuery) -> VfsResult<Vec<DriveFile>> {
        self.begin()?;
        let files: Vec<DriveFile> = self
            .state
            .files
            .lock()
            .values()
            .map(|(f, _)| f.clone())
            .collect();
        Ok(files.into_iter().filter(|f| self.matches(query, f)).collect())
    }

    async fn get(&self, id: &str) -> VfsResult<DriveFile> {
        self.begin()?;
        self.file(id).ok_or_else(|| VfsError::not_found(id))
    }

    async fn create_folder(&self, parent: &str, name: &str) -> VfsResult<DriveFile> {
        self.begin()?;
        self.require_folder(parent)?;
        let id = self.add_folder(parent, name);
        self.file(&id).ok_or_else(|| VfsError::not_found(id))
    }

    async fn update(&self, id: &str, change: &DriveUpdate) -> VfsResult<DriveFile> {
        self.begin()?;
        if let Some(parent) = &change.add_parent {
            self.require_folder(parent)?;
        }
        let mut files = self.state.files.lock();
        let (file, _) = files.get_mut(id).ok_or_else(|| VfsError::not_found(id))?;
        if let Some(name) = &change.name {
            file.name = name.clone();
        }
        if let Some(parent) = &change.remove_parent {
            file.parents.retain(|p| p != parent);
        }
        if let Some(parent) = &change.add_parent {
            file.parents.push(parent.clone());
        }
        if let Some(time) = change.modified_time {
            file.modified_time = Some(time);
        }
        if let Some(trashed) = change.trashed {
            file.trashed = trashed;
        }
        Ok(file.clone())
    }

    async fn delete(&self, id: &str) -> VfsResult<()> {
        self.begin()?;
        self.state
            .files
            .lock()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| VfsError::not_found(id))
    }

    async fn download(&self, id: &str) -> VfsResult<ReadStream> {
        self.begin()?;
        let data = self.content(id).ok_or_else(|| VfsError::not_found(id))?;
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn upload(&self, target: UploadTarget, mut body: ByteStream) -> VfsResult<DriveFile> {
        self.begin()?;
        match &target {
            UploadTarget::New { parent, .. } => self.require_folder(parent)?,
            UploadTarget::Existing { id } => {
                if self.file(id).is_none() {
                    return Err(VfsError::not_found(id.as_str()));
                }
            }
        }
        if self.state.hold_uploads.load(Ordering::SeqCst) {
            self.state.upload_gate.notified().await;
        }

        let mut data = Vec::new();
        while let Some(chunk) = body.next().await {
            data.extend_from_slice(&chunk?);
        }

        let id = match target {
            UploadTarget::New { parent, name } => self.add_file(&parent, &name, data),
            UploadTarget::Existing { id } => {
                let mut files = self.state.files.lock();
                let (file, content) = files.get_mut(&id).ok_or_else(|| VfsError::not_found(id.as_str()))?;
                file.size = Some(data.len() as u64);
                file.modified_time = Some(Utc::now());
                *content = data;
                id
            }
        };
        self.file(&id).ok_or_else(|| VfsError::not_found(id))
    }
}
