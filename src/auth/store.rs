use super::google::TokenEndpoint;
use super::types::{
    AuthMode, ClientSecrets, Credential, CredentialState, OAuthToken, ServiceAccountKey,
    DRIVE_SCOPE,
};
use crate::config::DriveConfig;
use crate::error::{BackupError, Result};
use chrono::Utc;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const CLIENT_SECRETS_FILE: &str = "credentials.json";
pub const TOKEN_FILE: &str = "token.json";
pub const SERVICE_ACCOUNT_FILE: &str = "service_account.json";

/// Replaces `path` via a temp file in the same directory and a rename, so a
/// concurrent reader sees either the old or the new content.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

    let result = (|| -> io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    Ok(result?)
}

/// Owns the on-disk credential state in `secrets_dir`. The authentication
/// mode is decided once in [`CredentialStore::open`].
pub struct CredentialStore {
    mode: AuthMode,
    secrets_dir: PathBuf,
    endpoint: Arc<dyn TokenEndpoint>,
    interactive: bool,
    service_key: Option<ServiceAccountKey>,
    current: Option<Credential>,
}

impl CredentialStore {
    /// Persists any inline credential material from `config` and selects the
    /// mode. Configuring both OAuth and service-account material is an error.
    pub fn open(config: &DriveConfig, endpoint: Arc<dyn TokenEndpoint>, interactive: bool) -> Result<Self> {
        let dir = config.secrets_dir.clone();
        let sa_path = dir.join(SERVICE_ACCOUNT_FILE);
        let oauth_on_disk = dir.join(CLIENT_SECRETS_FILE).exists() || dir.join(TOKEN_FILE).exists();
        let oauth_configured = config.client_credentials_json.is_some() || config.token_json.is_some();
        let sa_configured = config.service_account_json.is_some() || sa_path.exists();

        if sa_configured && (oauth_configured || oauth_on_disk) {
            return Err(BackupError::Config(format!(
                "both OAuth ({} / {}) and service account ({}) credentials are configured; keep only one",
                CLIENT_SECRETS_FILE, TOKEN_FILE, SERVICE_ACCOUNT_FILE
            )));
        }

        let mode = if sa_configured {
            AuthMode::ServiceAccount
        } else {
            AuthMode::OAuth
        };

        let mut store = Self {
            mode,
            secrets_dir: dir,
            endpoint,
            interactive,
            service_key: None,
            current: None,
        };

        match mode {
            AuthMode::ServiceAccount => {
                if let Some(raw) = &config.service_account_json {
                    ServiceAccountKey::from_json(raw)?;
                    store.persist_if_changed(SERVICE_ACCOUNT_FILE, raw)?;
                }
                let raw = fs::read_to_string(store.path(SERVICE_ACCOUNT_FILE))?;
                store.service_key = Some(ServiceAccountKey::from_json(&raw)?);
            }
            AuthMode::OAuth => {
                if let Some(raw) = &config.client_credentials_json {
                    ClientSecrets::from_json(raw)?;
                    store.persist_if_changed(CLIENT_SECRETS_FILE, raw)?;
                }
                if let Some(raw) = &config.token_json {
                    if store.path(TOKEN_FILE).exists() {
                        debug!("Keeping existing {} over inline token material", TOKEN_FILE);
                    } else {
                        let token: OAuthToken = serde_json::from_str(raw)?;
                        store.persist_token(&token)?;
                    }
                }
            }
        }

        info!("Using {} authentication", mode);
        Ok(store)
    }

    fn path(&self, name: &str) -> PathBuf {
        self.secrets_dir.join(name)
    }

    fn persist_if_changed(&self, name: &str, raw: &str) -> Result<()> {
        let path = self.path(name);
        if fs::read_to_string(&path).ok().as_deref() == Some(raw) {
            return Ok(());
        }
        info!("Storing credential material in {}", path.display());
        write_atomic(&path, raw.as_bytes())
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    pub fn token_path(&self) -> PathBuf {
        self.path(TOKEN_FILE)
    }

    pub fn persist_token(&self, token: &OAuthToken) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(token)?;
        write_atomic(&self.token_path(), &bytes)
    }

    pub fn load_token(&self) -> Result<Option<OAuthToken>> {
        match fs::read(self.token_path()) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn load_client_secrets(&self) -> Result<Option<ClientSecrets>> {
        match fs::read_to_string(self.path(CLIENT_SECRETS_FILE)) {
            Ok(raw) => Ok(Some(ClientSecrets::from_json(&raw)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Drops the stored token so the next attempt starts a fresh authorization.
    fn revoke_token(&mut self) {
        self.current = None;
        match fs::remove_file(self.token_path()) {
            Ok(()) => warn!(
                "Removed unusable token {}; re-authorization required",
                self.token_path().display()
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", self.token_path().display(), e),
        }
    }

    pub fn state(&self) -> CredentialState {
        if self.mode == AuthMode::ServiceAccount {
            return CredentialState::Valid;
        }
        match self.load_token() {
            Ok(Some(token)) if token.is_expired(Utc::now()) => CredentialState::Expired,
            Ok(Some(_)) => CredentialState::Valid,
            _ if self.path(CLIENT_SECRETS_FILE).exists() => CredentialState::PendingAuthorization,
            _ => CredentialState::Absent,
        }
    }

    fn missing_material(&self) -> BackupError {
        BackupError::AuthenticationMissing(format!(
            "no Google Drive credentials: set GDRIVE_CREDENTIALS_JSON (OAuth client) or \
             GDRIVE_SERVICE_ACCOUNT_JSON, or place {} or {} in {}",
            CLIENT_SECRETS_FILE,
            SERVICE_ACCOUNT_FILE,
            self.secrets_dir.display()
        ))
    }

    /// Returns a credential that is valid right now, refreshing or minting
    /// as needed.
    pub async fn credential(&mut self) -> Result<Credential> {
        let now = Utc::now();
        if let Some(current) = &self.current {
            if !current.is_expired(now) {
                return Ok(current.clone());
            }
        }

        match self.mode {
            AuthMode::ServiceAccount => self.mint_service_token().await,
            AuthMode::OAuth => match self.load_token()? {
                Some(token) if !token.is_expired(now) => {
                    let credential = Credential::OAuth(token);
                    self.current = Some(credential.clone());
                    Ok(credential)
                }
                Some(token) => {
                    info!("Stored OAuth token expired, refreshing");
                    self.refresh_token(token).await
                }
                None => {
                    let client = self.load_client_secrets()?.ok_or_else(|| self.missing_material())?;
                    if !self.interactive {
                        return Err(BackupError::AuthenticationMissing(format!(
                            "no OAuth token at {}; run `pg-drive-backup authorize` once to grant access",
                            self.token_path().display()
                        )));
                    }
                    self.authorize_with(&client).await
                }
            },
        }
    }

    /// Called once when the destination rejects the current credential.
    pub async fn refresh_after_rejection(&mut self) -> Result<Credential> {
        self.current = None;
        match self.mode {
            AuthMode::ServiceAccount => self.mint_service_token().await,
            AuthMode::OAuth => match self.load_token()? {
                Some(token) => self.refresh_token(token).await,
                None => Err(BackupError::AuthenticationExpiredUnrecoverable(format!(
                    "token rejected and {} is gone",
                    self.token_path().display()
                ))),
            },
        }
    }

    /// Runs the first-run authorization regardless of the current state.
    pub async fn authorize(&mut self) -> Result<Credential> {
        if self.mode == AuthMode::ServiceAccount {
            return Err(BackupError::Config(
                "service account credentials need no interactive authorization".to_string(),
            ));
        }
        let client = self.load_client_secrets()?.ok_or_else(|| self.missing_material())?;
        self.authorize_with(&client).await
    }

    async fn authorize_with(&mut self, client: &ClientSecrets) -> Result<Credential> {
        let token = self.endpoint.authorize(client, &[DRIVE_SCOPE]).await?;
        self.persist_token(&token)?;
        info!("OAuth token stored in {}", self.token_path().display());
        let credential = Credential::OAuth(token);
        self.current = Some(credential.clone());
        Ok(credential)
    }

    async fn refresh_token(&mut self, token: OAuthToken) -> Result<Credential> {
        if token.refresh_token.is_none() {
            self.revoke_token();
            return Err(BackupError::AuthenticationExpiredUnrecoverable(
                "token expired and carries no refresh token".to_string(),
            ));
        }

        match self.endpoint.refresh(&token).await {
            Ok(refreshed) => {
                self.persist_token(&refreshed)?;
                info!("OAuth token refreshed");
                let credential = Credential::OAuth(refreshed);
                self.current = Some(credential.clone());
                Ok(credential)
            }
            Err(BackupError::AuthenticationRejected(msg)) => {
                self.revoke_token();
                Err(BackupError::AuthenticationExpiredUnrecoverable(msg))
            }
            Err(e) => {
                self.current = None;
                Err(BackupError::AuthenticationExpiredUnrecoverable(format!(
                    "token refresh failed, will retry next cycle: {}",
                    e
                )))
            }
        }
    }

    async fn mint_service_token(&mut self) -> Result<Credential> {
        let key = self.service_key.as_ref().ok_or_else(|| self.missing_material())?;
        let token = self.endpoint.service_account_token(key, &[DRIVE_SCOPE]).await?;
        debug!("Service account token minted, valid until {}", token.expires_at);
        let credential = Credential::ServiceAccount(token);
        self.current = Some(credential.clone());
        Ok(credential)
    }
}
