use crate::backup::BackupArtifact;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObject {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ListFilter {
    pub folder_id: String,
    pub name_prefix: String,
    /// Matched against the `database` property recorded at upload.
    pub database: String,
}

/// Object store operations needed by a backup cycle. Every call carries the
/// bearer token so the caller controls refreshes.
///
/// Implementations map failures onto `AuthenticationRejected` (credential
/// refused), `UploadTransient` (worth retrying) and `UploadPermanent`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn ensure_folder(&self, access_token: &str, name: &str) -> Result<String>;
    async fn upload(
        &self,
        access_token: &str,
        folder_id: &str,
        artifact: &BackupArtifact,
    ) -> Result<RemoteObject>;
    async fn list(&self, access_token: &str, filter: &ListFilter) -> Result<Vec<RemoteObject>>;
    async fn delete(&self, access_token: &str, id: &str) -> Result<()>;
    fn name(&self) -> &'static str;
}
