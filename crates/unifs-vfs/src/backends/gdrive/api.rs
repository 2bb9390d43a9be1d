//! Drive v3 REST surface.

use std::io;
use std::pin::Pin;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Deserializer};
use serde_json::json;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::error::{VfsError, VfsResult};
use crate::types::{FileAttributes, ReadStream};

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// Alias Drive accepts for the "My Drive" folder id.
pub const ROOT_ID: &str = "root";

/// Fields requested for every file resource.
const FILE_FIELDS: &str = "id,name,mimeType,parents,size,modifiedTime,trashed,owners(displayName,emailAddress)";
const LIST_FIELDS: &str =
    "nextPageToken,files(id,name,mimeType,parents,size,modifiedTime,trashed,owners(displayName,emailAddress))";
const PAGE_SIZE: &str = "1000";

/// Upload body: chunks as the caller writes them.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveUser {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email_address: Option<String>,
}

/// A Drive file resource.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    #[serde(default)]
    pub parents: Vec<String>,
    /// Drive sends sizes as decimal strings; folders have none.
    #[serde(default, deserialize_with = "size_from_string")]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub owners: Vec<DriveUser>,
}

fn size_from_string<'de, D: Deserializer<'de>>(de: D) -> Result<Option<u64>, D::Error> {
    let raw: Option<String> = Option::deserialize(de)?;
    raw.map(|s| s.parse().map_err(serde::de::Error::custom))
        .transpose()
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }

    pub fn to_attributes(&self) -> FileAttributes {
        let owner = self
            .owners
            .first()
            .and_then(|o| o.email_address.clone().or_else(|| o.display_name.clone()));
        let attrs = if self.is_folder() {
            FileAttributes::directory(0o700)
        } else {
            FileAttributes::file(self.size.unwrap_or(0), 0o600)
        };
        attrs
            .with_modified(self.modified_time.map(SystemTime::from))
            .with_owner(owner, None)
    }
}

/// Listing queries the node layer issues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveQuery {
    Children { parent: String, include_trashed: bool },
    Named { parent: String, name: String, include_trashed: bool },
    SharedWithMe,
    Trashed,
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

impl DriveQuery {
    /// The `q` parameter for `files.list`.
    pub fn to_q(&self) -> String {
        let trashed = |include: bool| if include { "" } else { " and trashed = false" };
        match self {
            Self::Children { parent, include_trashed } => {
                format!("{} in parents{}", quote(parent), trashed(*include_trashed))
            }
            Self::Named { parent, name, include_trashed } => format!(
                "name = {} and {} in parents{}",
                quote(name),
                quote(parent),
                trashed(*include_trashed)
            ),
            Self::SharedWithMe => "sharedWithMe = true and trashed = false".into(),
            Self::Trashed => "trashed = true".into(),
        }
    }
}

/// Metadata changes for `files.update`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriveUpdate {
    pub name: Option<String>,
    pub add_parent: Option<String>,
    pub remove_parent: Option<String>,
    pub modified_time: Option<DateTime<Utc>>,
    pub trashed: Option<bool>,
}

impl DriveUpdate {
    fn body(&self) -> serde_json::Value {
        let mut body = serde_json::Map::new();
        if let Some(name) = &self.name {
            body.insert("name".into(), json!(name));
        }
        if let Some(time) = &self.modified_time {
            body.insert("modifiedTime".into(), json!(time.to_rfc3339()));
        }
        if let Some(trashed) = self.trashed {
            body.insert("trashed".into(), json!(trashed));
        }
        serde_json::Value::Object(body)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    New { parent: String, name: String },
    Existing { id: String },
}

/// Drive operations over one authorized client.
#[async_trait]
pub trait DriveApi: Send + Sync {
    /// Every page of a listing query.
    async fn list(&self, query: &DriveQuery) -> VfsResult<Vec<DriveFile>>;

    async fn get(&self, id: &str) -> VfsResult<DriveFile>;

    async fn create_folder(&self, parent: &str, name: &str) -> VfsResult<DriveFile>;

    async fn update(&self, id: &str, change: &DriveUpdate) -> VfsResult<DriveFile>;

    /// Permanent delete, bypassing the trash.
    async fn delete(&self, id: &str) -> VfsResult<()>;

    async fn download(&self, id: &str) -> VfsResult<ReadStream>;

    /// Stream `body` into a new or existing file.
    async fn upload(&self, target: UploadTarget, body: ByteStream) -> VfsResult<DriveFile>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    files: Vec<DriveFile>,
}

/// Map a non-success response onto the matching error.
pub(crate) async fn check_status(target: &str, subject: &str, response: Response) -> VfsResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED => VfsError::auth(target, body),
        StatusCode::FORBIDDEN => VfsError::PermissionDenied(subject.to_string()),
        StatusCode::NOT_FOUND => VfsError::not_found(subject),
        StatusCode::TOO_MANY_REQUESTS => VfsError::transport(target, format!("rate limited: {body}")),
        s if s.is_server_error() => VfsError::transport(target, format!("HTTP {s}: {body}")),
        s => VfsError::other(format!("{subject}: HTTP {s}: {body}")),
    })
}

pub(crate) fn request_error(target: &str, err: reqwest::Error) -> VfsError {
    if err.is_timeout() {
        VfsError::Timeout(format!("{target}: {err}"))
    } else {
        VfsError::transport(target, err.to_string())
    }
}

/// Drive v3 over reqwest with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpDriveApi {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
    target: String,
}

impl HttpDriveApi {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        access_token: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
            target: target.into(),
        }
    }

    fn files_url(&self, id: Option<&str>) -> String {
        match id {
            Some(id) => format!("{}/drive/v3/files/{}", self.base_url, urlencoding::encode(id)),
            None => format!("{}/drive/v3/files", self.base_url),
        }
    }

    async fn send(&self, request: RequestBuilder, subject: &str) -> VfsResult<Response> {
        let response = request
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| request_error(&self.target, e))?;
        check_status(&self.target, subject, response).await
    }

    async fn file_from(&self, response: Response) -> VfsResult<DriveFile> {
        response
            .json()
            .await
            .map_err(|e| VfsError::transport(&self.target, format!("bad file resource: {e}")))
    }
}

#[async_trait]
impl DriveApi for HttpDriveApi {
    async fn list(&self, query: &DriveQuery) -> VfsResult<Vec<DriveFile>> {
        let q = query.to_q();
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self.client.get(self.files_url(None)).query(&[
                ("q", q.as_str()),
                ("fields", LIST_FIELDS),
                ("pageSize", PAGE_SIZE),
            ]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let page: FileList = self
                .send(request, &q)
                .await?
                .json()
                .await
                .map_err(|e| VfsError::transport(&self.target, format!("bad file list: {e}")))?;
            files.extend(page.files);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        debug!(q = %q, count = files.len(), "drive list");
        Ok(files)
    }

    async fn get(&self, id: &str) -> VfsResult<DriveFile> {
        let request = self
            .client
            .get(self.files_url(Some(id)))
            .query(&[("fields", FILE_FIELDS)]);
        let response = self.send(request, id).await?;
        self.file_from(response).await
    }

    async fn create_folder(&self, parent: &str, name: &str) -> VfsResult<DriveFile> {
        let request = self
            .client
            .post(self.files_url(None))
            .query(&[("fields", FILE_FIELDS)])
            .json(&json!({ "name": name, "mimeType": FOLDER_MIME, "parents": [parent] }));
        let response = self.send(request, name).await?;
        self.file_from(response).await
    }

    async fn update(&self, id: &str, change: &DriveUpdate) -> VfsResult<DriveFile> {
        let mut request = self
            .client
            .patch(self.files_url(Some(id)))
            .query(&[("fields", FILE_FIELDS)])
            .json(&change.body());
        if let Some(parent) = &change.add_parent {
            request = request.query(&[("addParents", parent.as_str())]);
        }
        if let Some(parent) = &change.remove_parent {
            request = request.query(&[("removeParents", parent.as_str())]);
        }
        let response = self.send(request, id).await?;
        self.file_from(response).await
    }

    async fn delete(&self, id: &str) -> VfsResult<()> {
        self.send(self.client.delete(self.files_url(Some(id))), id)
            .await
            .map(|_| ())
    }

    async fn download(&self, id: &str) -> VfsResult<ReadStream> {
        let request = self
            .client
            .get(self.files_url(Some(id)))
            .query(&[("alt", "media")]);
        let response = self.send(request, id).await?;
        let chunks = response.bytes_stream().map(|r| r.map_err(io::Error::other));
        Ok(Box::pin(StreamReader::new(chunks)))
    }

    async fn upload(&self, target: UploadTarget, body: ByteStream) -> VfsResult<DriveFile> {
        let (start, subject) = match &target {
            UploadTarget::New { parent, name } => (
                self.client
                    .post(format!("{}/upload/drive/v3/files", self.base_url))
                    .json(&json!({ "name": name, "parents": [parent] })),
                name.clone(),
            ),
            UploadTarget::Existing { id } => (
                self.client
                    .patch(format!(
                        "{}/upload/drive/v3/files/{}",
                        self.base_url,
                        urlencoding::encode(id)
                    ))
                    .json(&json!({})),
                id.clone(),
            ),
        };
        let start = start.query(&[("uploadType", "resumable"), ("fields", FILE_FIELDS)]);
        let response = self.send(start, &subject).await?;
        let session_url = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                VfsError::transport(&self.target, "resumable upload returned no session URL")
            })?;

        let put = self
            .client
            .put(session_url)
            .body(reqwest::Body::wrap_stream(body));
        let response = self.send(put, &subject).await?;
        let file = self.file_from(response).await?;
        debug!(id = %file.id, name = %file.name, size = ?file.size, "drive upload complete");
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queries_escape_quotes() {
        let q = DriveQuery::Named {
            parent: "root".into(),
            name: "it's".into(),
            include_trashed: false,
        };
        assert_eq!(
            q.to_q(),
            r"name = 'it\'s' and 'root' in parents and trashed = false"
        );
        let q = DriveQuery::Children {
            parent: "abc".into(),
            include_trashed: true,
        };
        assert_eq!(q.to_q(), "'abc' in parents");
    }

    #[test]
    fn file_resources_deserialize_with_string_sizes() {
        let file: DriveFile = serde_json::from_str(
            r#"{"id":"1","name":"a.txt","mimeType":"text/plain","parents":["root"],
                "size":"2048","modifiedTime":"2024-05-01T10:00:00Z",
                "owners":[{"displayName":"Amy","emailAddress":"amy@example.com"}]}"#,
        )
        .unwrap();
        assert_eq!(file.size, Some(2048));
        assert!(!file.trashed);
        let attrs = file.to_attributes();
        assert_eq!(attrs.size, 2048);
        assert_eq!(attrs.owner.as_deref(), Some("amy@example.com"));
        assert!(attrs.modified.is_some());

        let folder: DriveFile =
            serde_json::from_str(r#"{"id":"2","name":"d","mimeType":"application/vnd.google-apps.folder"}"#)
                .unwrap();
        assert!(folder.is_folder());
        assert!(folder.to_attributes().is_directory);
    }

    #[test]
    fn update_body_only_carries_set_fields() {
        let change = DriveUpdate {
            name: Some("b".into()),
            add_parent: Some("p2".into()),
            ..Default::default()
        };
        assert_eq!(change.body(), json!({ "name": "b" }));
    }
}
