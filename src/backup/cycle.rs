use super::artifact::BackupArtifact;
use super::dump::DumpExecutor;
use super::retention::{RetentionManager, RetentionPolicy};
use crate::auth::{CredentialStore, GoogleAuth, TokenEndpoint};
use crate::config::{AppConfig, DatabaseConfig};
use crate::database::{PostgresProbe, ServerProbe, VersionResolver};
use crate::error::{ErrorKind, Result};
use crate::upload::{GoogleDrive, RemoteStore, RetryPolicy, UploadResult, Uploader};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Terminal status of one cycle.
#[derive(Debug)]
pub enum CycleOutcome {
    Success {
        upload: UploadResult,
        duration_secs: u64,
    },
    Failure {
        kind: ErrorKind,
        message: String,
        duration_secs: u64,
    },
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Success { .. })
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            CycleOutcome::Success { .. } => None,
            CycleOutcome::Failure { kind, .. } => Some(*kind),
        }
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleOutcome::Success {
                upload,
                duration_secs,
            } => write!(
                f,
                "SUCCESS: {} uploaded as {} at {} in {} sec",
                upload.name,
                upload.remote_id,
                upload.uploaded_at.format("%Y-%m-%d %H:%M:%S UTC"),
                duration_secs
            ),
            CycleOutcome::Failure {
                kind,
                message,
                duration_secs,
            } => write!(f, "FAILURE [{}] after {} sec: {}", kind, duration_secs, message),
        }
    }
}

/// One dump-and-upload pipeline for the configured database. The credential
/// store lives as long as the cycle, so a scheduler reusing it keeps the
/// authentication mode fixed.
pub struct BackupCycle {
    database: DatabaseConfig,
    backup_dir: PathBuf,
    keep_local_copy: bool,
    resolver: VersionResolver,
    executor: DumpExecutor,
    credentials: CredentialStore,
    uploader: Uploader,
    store: Arc<dyn RemoteStore>,
    retention: RetentionManager,
}

impl BackupCycle {
    pub fn new(
        config: &AppConfig,
        probe: Arc<dyn ServerProbe>,
        endpoint: Arc<dyn TokenEndpoint>,
        store: Arc<dyn RemoteStore>,
    ) -> Result<Self> {
        let credentials = CredentialStore::open(&config.drive, endpoint, false)?;
        let retention = RetentionManager::new(RetentionPolicy::from_config(&config.retention));
        info!("Retention policy: {}", retention.policy());

        Ok(Self {
            database: config.database.clone(),
            backup_dir: config.local_backup_dir.clone(),
            keep_local_copy: config.dump.keep_local_copy,
            resolver: VersionResolver::new(probe, &config.dump),
            executor: DumpExecutor::new(&config.dump),
            credentials,
            uploader: Uploader::new(
                store.clone(),
                &config.drive.folder_name,
                RetryPolicy::from_config(&config.upload),
            ),
            store,
            retention,
        })
    }

    /// Wires the PostgreSQL probe and the Google endpoints.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let store = Arc::new(GoogleDrive::new(Duration::from_secs(
            config.upload.request_timeout_secs,
        ))?);
        let endpoint = Arc::new(GoogleAuth::new(config.drive.redirect_port)?);
        Self::new(config, Arc::new(PostgresProbe), endpoint, store)
    }

    pub async fn run(&mut self) -> CycleOutcome {
        let start = Instant::now();
        info!(
            "Starting backup cycle for {} on {}:{}",
            self.database.database, self.database.host, self.database.port
        );

        let outcome = match self.execute().await {
            Ok(upload) => CycleOutcome::Success {
                upload,
                duration_secs: start.elapsed().as_secs(),
            },
            Err(e) => CycleOutcome::Failure {
                kind: e.kind(),
                message: e.to_string(),
                duration_secs: start.elapsed().as_secs(),
            },
        };

        if outcome.is_success() {
            info!("Backup cycle finished: {}", outcome);
        } else {
            error!("Backup cycle finished: {}", outcome);
        }
        outcome
    }

    async fn execute(&mut self) -> Result<UploadResult> {
        let tool = self.resolver.resolve(&self.database).await;
        let artifact = self
            .executor
            .dump(&tool, &self.database, &self.backup_dir)
            .await?;

        let uploaded = match self.uploader.upload(&artifact, &mut self.credentials).await {
            Ok(uploaded) => uploaded,
            Err(e) => {
                warn!("Upload failed, local backup kept at {}", artifact.path.display());
                return Err(e);
            }
        };

        self.apply_retention(&artifact, &uploaded).await;
        self.dispose_local(&artifact);
        Ok(uploaded)
    }

    async fn apply_retention(&mut self, artifact: &BackupArtifact, uploaded: &UploadResult) {
        match self.credentials.credential().await {
            Ok(credential) => {
                let report = self
                    .retention
                    .prune_remote(
                        self.store.as_ref(),
                        credential.access_token(),
                        &artifact.database,
                        uploaded,
                    )
                    .await;
                if !report.failed.is_empty() {
                    warn!(
                        "Remote cleanup: {} deleted, {} failed",
                        report.deleted.len(),
                        report.failed.len()
                    );
                }
            }
            Err(e) => warn!("Skipping remote cleanup: {}", e),
        }

        self.retention
            .prune_local(&self.backup_dir, &artifact.database, &artifact.path);
    }

    fn dispose_local(&self, artifact: &BackupArtifact) {
        if self.keep_local_copy {
            info!("Local backup kept at {}", artifact.path.display());
            return;
        }
        match fs::remove_file(&artifact.path) {
            Ok(()) => info!("Removed local copy {}", artifact.path.display()),
            Err(e) => warn!("Could not remove local copy {}: {}", artifact.path.display(), e),
        }
    }
}
