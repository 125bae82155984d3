use super::remote::RemoteStore;
use crate::auth::CredentialStore;
use crate::backup::BackupArtifact;
use crate::config::UploadConfig;
use crate::error::{BackupError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct UploadResult {
    pub remote_id: String,
    pub name: String,
    pub folder_id: String,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_transient_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            max_transient_retries: config.max_transient_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before retry number `retry` (1-based), doubling each time.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

pub struct Uploader {
    store: Arc<dyn RemoteStore>,
    folder_name: String,
    retry: RetryPolicy,
}

impl Uploader {
    pub fn new(store: Arc<dyn RemoteStore>, folder_name: &str, retry: RetryPolicy) -> Self {
        Self {
            store,
            folder_name: folder_name.to_string(),
            retry,
        }
    }

    async fn attempt(&self, access_token: &str, artifact: &BackupArtifact) -> Result<UploadResult> {
        let folder_id = self.store.ensure_folder(access_token, &self.folder_name).await?;
        let object = self.store.upload(access_token, &folder_id, artifact).await?;
        Ok(UploadResult {
            remote_id: object.id,
            name: object.name,
            folder_id,
            uploaded_at: Utc::now(),
        })
    }

    /// Uploads `artifact`. A rejected credential is refreshed exactly once;
    /// transient failures are retried with exponential backoff up to the
    /// policy bound; anything else fails immediately.
    pub async fn upload(
        &self,
        artifact: &BackupArtifact,
        credentials: &mut CredentialStore,
    ) -> Result<UploadResult> {
        info!(
            "Uploading {} ({:.2} MB) to {}",
            artifact.file_name(),
            artifact.size as f64 / 1024.0 / 1024.0,
            self.store.name()
        );

        let mut credential = credentials.credential().await?;
        let mut refreshed = false;
        let mut transient_retries = 0u32;

        loop {
            match self.attempt(credential.access_token(), artifact).await {
                Ok(result) => {
                    info!("Upload successful, file ID: {}", result.remote_id);
                    return Ok(result);
                }
                Err(BackupError::AuthenticationRejected(msg)) if !refreshed => {
                    warn!("Credential rejected ({}), refreshing once", msg);
                    refreshed = true;
                    credential = credentials.refresh_after_rejection().await?;
                }
                Err(BackupError::AuthenticationRejected(msg)) => {
                    return Err(BackupError::AuthenticationExpiredUnrecoverable(format!(
                        "credential still rejected after refresh: {}",
                        msg
                    )));
                }
                Err(BackupError::UploadTransient(msg))
                    if transient_retries < self.retry.max_transient_retries =>
                {
                    transient_retries += 1;
                    let delay = self.retry.backoff(transient_retries);
                    warn!(
                        "Upload attempt failed ({}), retry {}/{} in {:?}",
                        msg, transient_retries, self.retry.max_transient_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(BackupError::UploadTransient(msg)) => {
                    return Err(BackupError::UploadTransient(format!(
                        "giving up after {} retries: {}",
                        transient_retries, msg
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_support::{drive_config, token, FakeEndpoint};
    use crate::error::ErrorKind;
    use crate::upload::test_support::{artifact, MemoryStore, Scripted};
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    fn fast_policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_transient_retries: retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn store_with_token(dir: &std::path::Path, endpoint: Arc<FakeEndpoint>) -> CredentialStore {
        let store = CredentialStore::open(&drive_config(dir), endpoint, false).unwrap();
        store.persist_token(&token("live", ChronoDuration::hours(1))).unwrap();
        store
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_transient_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(5));
        assert_eq!(policy.backoff(40), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_upload_success() {
        let dir = tempdir().unwrap();
        let remote = Arc::new(MemoryStore::default());
        let mut credentials = store_with_token(dir.path(), Arc::new(FakeEndpoint::default()));
        let uploader = Uploader::new(remote.clone(), "backups", fast_policy(3));
        let art = artifact(dir.path(), "shop");

        let result = uploader.upload(&art, &mut credentials).await.unwrap();

        assert_eq!(result.name, art.file_name());
        assert_eq!(remote.upload_calls(), 1);
        assert_eq!(remote.tokens_seen(), vec!["live".to_string()]);
        assert_eq!(remote.names(&result.folder_id), vec![art.file_name()]);
    }

    #[tokio::test]
    async fn test_auth_rejection_refreshes_once_then_succeeds() {
        let dir = tempdir().unwrap();
        let remote = Arc::new(MemoryStore::default());
        remote.script(vec![Scripted::Unauthorized]);
        let endpoint = Arc::new(FakeEndpoint::default());
        let mut credentials = store_with_token(dir.path(), endpoint.clone());
        let uploader = Uploader::new(remote.clone(), "backups", fast_policy(3));

        uploader.upload(&artifact(dir.path(), "shop"), &mut credentials).await.unwrap();

        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(remote.upload_calls(), 2);
        assert_eq!(remote.tokens_seen(), vec!["live".to_string(), "refreshed-1".to_string()]);
    }

    #[tokio::test]
    async fn test_second_auth_rejection_is_terminal() {
        let dir = tempdir().unwrap();
        let remote = Arc::new(MemoryStore::default());
        remote.script(vec![Scripted::Unauthorized, Scripted::Unauthorized, Scripted::Unauthorized]);
        let endpoint = Arc::new(FakeEndpoint::default());
        let mut credentials = store_with_token(dir.path(), endpoint.clone());
        let uploader = Uploader::new(remote.clone(), "backups", fast_policy(3));

        let err = uploader
            .upload(&artifact(dir.path(), "shop"), &mut credentials)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::AuthenticationExpiredUnrecoverable);
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(remote.upload_calls(), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_retried_within_bound() {
        let dir = tempdir().unwrap();
        let remote = Arc::new(MemoryStore::default());
        remote.script(vec![Scripted::Unavailable; 3]);
        let mut credentials = store_with_token(dir.path(), Arc::new(FakeEndpoint::default()));
        let uploader = Uploader::new(remote.clone(), "backups", fast_policy(3));

        uploader.upload(&artifact(dir.path(), "shop"), &mut credentials).await.unwrap();
        assert_eq!(remote.upload_calls(), 4);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_bound() {
        let dir = tempdir().unwrap();
        let remote = Arc::new(MemoryStore::default());
        remote.script(vec![Scripted::Unavailable; 5]);
        let mut credentials = store_with_token(dir.path(), Arc::new(FakeEndpoint::default()));
        let uploader = Uploader::new(remote.clone(), "backups", fast_policy(2));

        let err = uploader
            .upload(&artifact(dir.path(), "shop"), &mut credentials)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UploadTransient);
        assert_eq!(remote.upload_calls(), 3);
    }

    #[tokio::test]
    async fn test_permanent_rejection_not_retried() {
        let dir = tempdir().unwrap();
        let remote = Arc::new(MemoryStore::default());
        remote.script(vec![Scripted::Forbidden]);
        let endpoint = Arc::new(FakeEndpoint::default());
        let mut credentials = store_with_token(dir.path(), endpoint.clone());
        let uploader = Uploader::new(remote.clone(), "backups", fast_policy(3));

        let err = uploader
            .upload(&artifact(dir.path(), "shop"), &mut credentials)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UploadPermanent);
        assert_eq!(remote.upload_calls(), 1);
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_before_any_request() {
        let dir = tempdir().unwrap();
        let remote = Arc::new(MemoryStore::default());
        let mut credentials =
            CredentialStore::open(&drive_config(dir.path()), Arc::new(FakeEndpoint::default()), false)
                .unwrap();
        let uploader = Uploader::new(remote.clone(), "backups", fast_policy(3));

        let err = uploader
            .upload(&artifact(dir.path(), "shop"), &mut credentials)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::AuthenticationMissing);
        assert_eq!(remote.upload_calls(), 0);
    }
}
