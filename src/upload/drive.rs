use super::remote::{ListFilter, RemoteObject, RemoteStore};
use crate::backup::BackupArtifact;
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Body, Client, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const ARTIFACT_MIME: &str = "application/octet-stream";
const FILE_FIELDS: &str = "id,name,createdTime,size";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    size: Option<String>,
}

/// Listing entries without `createdTime` cannot be ranked by age, so they
/// are left out of retention instead of being treated as brand new.
fn listed_objects(files: Vec<DriveFile>, name_prefix: &str) -> Vec<RemoteObject> {
    files
        .into_iter()
        .filter(|f| f.name.starts_with(name_prefix))
        .filter_map(|f| match f.created_time {
            Some(created_at) => Some(RemoteObject {
                id: f.id,
                name: f.name,
                created_at,
                size: f.size.and_then(|s| s.parse().ok()),
            }),
            None => {
                debug!("Skipping {} ({}): no createdTime in listing", f.name, f.id);
                None
            }
        })
        .collect()
}

// Only used for the file just uploaded, where "now" is a fair stand-in.
impl From<DriveFile> for RemoteObject {
    fn from(file: DriveFile) -> Self {
        RemoteObject {
            id: file.id,
            name: file.name,
            created_at: file.created_time.unwrap_or_else(Utc::now),
            size: file.size.and_then(|s| s.parse().ok()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

pub struct GoogleDrive {
    client: Client,
}

/// Escapes a value for a single-quoted Drive query literal.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn list_query(filter: &ListFilter) -> String {
    format!(
        "{} in parents and trashed = false and name contains {} and \
         appProperties has {{ key='database' and value={} }}",
        quote(&filter.folder_id),
        quote(&filter.name_prefix),
        quote(&filter.database)
    )
}

fn is_rate_limit(body: &str) -> bool {
    body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded")
}

/// Maps a non-success response onto the uploader's retry classes.
pub(crate) fn classify(status: StatusCode, body: &str, action: &str) -> BackupError {
    let msg = format!("{}: {} - {}", action, status, body);
    match status {
        StatusCode::UNAUTHORIZED => BackupError::AuthenticationRejected(msg),
        StatusCode::FORBIDDEN if is_rate_limit(body) => BackupError::UploadTransient(msg),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => BackupError::UploadTransient(msg),
        s if s.is_server_error() => BackupError::UploadTransient(msg),
        _ => BackupError::UploadPermanent(msg),
    }
}

async fn check(response: Response, action: &str) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    Err(classify(status, &text, action))
}

impl GoogleDrive {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent("pg-drive-backup/0.1")
            .connect_timeout(Duration::from_secs(30))
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client })
    }

    async fn find_folder(&self, token: &str, name: &str) -> Result<Option<String>> {
        let query = format!(
            "name = {} and mimeType = '{}' and trashed = false",
            quote(name),
            FOLDER_MIME
        );
        let response = self
            .client
            .get(format!("{}/files", DRIVE_API_BASE))
            .bearer_auth(token)
            .query(&[("q", query.as_str()), ("spaces", "drive"), ("fields", "files(id,name)")])
            .send()
            .await?;
        let list: FileList = check(response, "Failed to search for folder").await?.json().await?;
        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    async fn start_resumable_session(
        &self,
        token: &str,
        folder_id: &str,
        artifact: &BackupArtifact,
    ) -> Result<String> {
        let metadata = serde_json::json!({
            "name": artifact.file_name(),
            "parents": [folder_id],
            "mimeType": ARTIFACT_MIME,
            "appProperties": {
                "database": artifact.database,
                "sha256": artifact.sha256,
            },
        });

        let response = self
            .client
            .post(format!("{}/files", DRIVE_UPLOAD_BASE))
            .bearer_auth(token)
            .query(&[("uploadType", "resumable"), ("fields", FILE_FIELDS)])
            .header("X-Upload-Content-Type", ARTIFACT_MIME)
            .header("X-Upload-Content-Length", artifact.size.to_string())
            .json(&metadata)
            .send()
            .await?;
        let response = check(response, "Failed to start upload session").await?;

        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| BackupError::UploadPermanent("upload session has no Location header".to_string()))
    }
}

#[async_trait]
impl RemoteStore for GoogleDrive {
    async fn ensure_folder(&self, access_token: &str, name: &str) -> Result<String> {
        if let Some(id) = self.find_folder(access_token, name).await? {
            debug!("Found existing folder: {} ({})", name, id);
            return Ok(id);
        }

        info!("Creating Google Drive folder: {}", name);
        let body = serde_json::json!({ "name": name, "mimeType": FOLDER_MIME });
        let response = self
            .client
            .post(format!("{}/files", DRIVE_API_BASE))
            .bearer_auth(access_token)
            .query(&[("fields", "id,name")])
            .json(&body)
            .send()
            .await?;
        let folder: DriveFile = check(response, "Failed to create folder").await?.json().await?;
        Ok(folder.id)
    }

    async fn upload(
        &self,
        access_token: &str,
        folder_id: &str,
        artifact: &BackupArtifact,
    ) -> Result<RemoteObject> {
        let session = self.start_resumable_session(access_token, folder_id, artifact).await?;
        debug!("Upload session opened for {}", artifact.file_name());

        let file = File::open(&artifact.path).await?;
        let body = Body::wrap_stream(ReaderStream::new(file));
        let response = self
            .client
            .put(&session)
            .bearer_auth(access_token)
            .header(CONTENT_TYPE, ARTIFACT_MIME)
            .header(CONTENT_LENGTH, artifact.size)
            .body(body)
            .send()
            .await?;
        let uploaded: DriveFile = check(response, "Failed to upload backup").await?.json().await?;
        Ok(uploaded.into())
    }

    async fn list(&self, access_token: &str, filter: &ListFilter) -> Result<Vec<RemoteObject>> {
        let query = list_query(filter);
        let fields = format!("nextPageToken,files({})", FILE_FIELDS);
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .get(format!("{}/files", DRIVE_API_BASE))
                .bearer_auth(access_token)
                .query(&[
                    ("q", query.as_str()),
                    ("spaces", "drive"),
                    ("fields", fields.as_str()),
                    ("orderBy", "createdTime desc"),
                    ("pageSize", "1000"),
                ]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let page: FileList = check(request.send().await?, "Failed to list backups")
                .await?
                .json()
                .await?;
            objects.extend(listed_objects(page.files, &filter.name_prefix));

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(objects)
    }

    async fn delete(&self, access_token: &str, id: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/files/{}", DRIVE_API_BASE, id))
            .bearer_auth(access_token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("Backup {} already gone", id);
            return Ok(());
        }
        check(response, "Failed to delete backup").await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Google Drive"
    }
}
