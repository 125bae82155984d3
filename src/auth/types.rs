use crate::error::{BackupError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
const GOOGLE_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Tokens this close to expiry are treated as expired.
const EXPIRY_SKEW_SECS: i64 = 60;

fn default_auth_uri() -> String {
    GOOGLE_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URI.to_string()
}

/// OAuth client registration as downloaded from the Google Cloud console.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

#[derive(Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

impl ClientSecrets {
    /// Accepts the console's `{"installed": {...}}` / `{"web": {...}}`
    /// wrapper or the bare object.
    pub fn from_json(raw: &str) -> Result<Self> {
        if let Ok(file) = serde_json::from_str::<ClientSecretsFile>(raw) {
            if let Some(secrets) = file.installed.or(file.web) {
                return Ok(secrets);
            }
        }
        serde_json::from_str(raw).map_err(|e| {
            BackupError::AuthenticationMissing(format!(
                "OAuth client credentials are not valid client_secret JSON: {}",
                e
            ))
        })
    }
}

impl fmt::Debug for ClientSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSecrets")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("auth_uri", &self.auth_uri)
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

/// Persisted user token. Field names follow Google's authorized-user JSON so
/// tokens written by other Google client libraries load as well.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthToken {
    #[serde(alias = "token")]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl OAuthToken {
    /// Tokens without a recorded expiry are assumed valid until rejected.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry
            .map_or(false, |expiry| expiry <= now + Duration::seconds(EXPIRY_SKEW_SECS))
    }
}

impl fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthToken")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expiry", &self.expiry)
            .field("client_id", &self.client_id)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl ServiceAccountKey {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| {
            BackupError::AuthenticationMissing(format!(
                "service account key is not valid JSON key material: {}",
                e
            ))
        })
    }
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

/// Short-lived bearer token minted from a service account key.
#[derive(Clone, PartialEq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now + Duration::seconds(EXPIRY_SKEW_SECS)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Credential {
    OAuth(OAuthToken),
    ServiceAccount(AccessToken),
}

impl Credential {
    pub fn access_token(&self) -> &str {
        match self {
            Credential::OAuth(token) => &token.access_token,
            Credential::ServiceAccount(token) => &token.token,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self {
            Credential::OAuth(token) => token.is_expired(now),
            Credential::ServiceAccount(token) => token.is_expired(now),
        }
    }
}

/// Fixed for the lifetime of a `CredentialStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    OAuth,
    ServiceAccount,
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::OAuth => write!(f, "OAuth user"),
            AuthMode::ServiceAccount => write!(f, "service account"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    /// No client credentials and no token.
    Absent,
    /// Client credentials present, no token yet (or it was revoked).
    PendingAuthorization,
    Valid,
    Expired,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_secrets_installed_wrapper() {
        let raw = r#"{"installed":{"client_id":"id.apps","client_secret":"shh","redirect_uris":["http://localhost"]}}"#;
        let secrets = ClientSecrets::from_json(raw).unwrap();
        assert_eq!(secrets.client_id, "id.apps");
        assert_eq!(secrets.token_uri, GOOGLE_TOKEN_URI);
    }

    #[test]
    fn test_client_secrets_bare_object() {
        let raw = r#"{"client_id":"a","client_secret":"b","token_uri":"http://t"}"#;
        let secrets = ClientSecrets::from_json(raw).unwrap();
        assert_eq!(secrets.token_uri, "http://t");
    }

    #[test]
    fn test_invalid_client_secrets() {
        assert!(ClientSecrets::from_json("{}").is_err());
    }

    #[test]
    fn test_token_accepts_google_library_format() {
        let raw = r#"{
            "token": "ya29.a0",
            "refresh_token": "1//0g",
            "token_uri": "https://oauth2.googleapis.com/token",
            "client_id": "id",
            "client_secret": "secret",
            "scopes": ["https://www.googleapis.com/auth/drive"],
            "expiry": "2030-01-01T00:00:00.000000Z"
        }"#;
        let token: OAuthToken = serde_json::from_str(raw).unwrap();
        assert_eq!(token.access_token, "ya29.a0");
        assert!(!token.is_expired(Utc::now()));
    }

    #[test]
    fn test_expiry_skew() {
        let now = Utc::now();
        let token = AccessToken {
            token: "t".to_string(),
            expires_at: now + Duration::seconds(30),
        };
        assert!(token.is_expired(now));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let token = OAuthToken {
            access_token: "ya29.secret".to_string(),
            refresh_token: Some("refresh-secret".to_string()),
            expiry: None,
            token_uri: default_token_uri(),
            client_id: "id".to_string(),
            client_secret: "client-secret".to_string(),
            scopes: vec![],
        };
        let printed = format!("{:?}", Credential::OAuth(token));
        assert!(!printed.contains("secret"));
    }
}
