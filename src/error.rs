use std::fmt;
use std::io;
use thiserror::Error;

/// Failure classes surfaced in a cycle's terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    VersionResolutionExhausted,
    DumpFailed,
    AuthenticationMissing,
    AuthenticationExpiredUnrecoverable,
    UploadTransient,
    UploadPermanent,
    RetentionDeleteFailed,
    Config,
    Database,
    Io,
    Serialization,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::VersionResolutionExhausted => "VersionResolutionExhausted",
            ErrorKind::DumpFailed => "DumpFailed",
            ErrorKind::AuthenticationMissing => "AuthenticationMissing",
            ErrorKind::AuthenticationExpiredUnrecoverable => "AuthenticationExpiredUnrecoverable",
            ErrorKind::UploadTransient => "UploadTransient",
            ErrorKind::UploadPermanent => "UploadPermanent",
            ErrorKind::RetentionDeleteFailed => "RetentionDeleteFailed",
            ErrorKind::Config => "Config",
            ErrorKind::Database => "Database",
            ErrorKind::Io => "Io",
            ErrorKind::Serialization => "Serialization",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("No compatible dump client found: {0}")]
    VersionResolutionExhausted(String),

    #[error("Dump failed: {0}")]
    DumpFailed(String),

    #[error("Authentication missing: {0}")]
    AuthenticationMissing(String),

    #[error("Authentication expired and could not be refreshed: {0}")]
    AuthenticationExpiredUnrecoverable(String),

    /// The destination rejected the credential. Only the uploader sees this;
    /// it triggers the single refresh-and-retry.
    #[error("Credential rejected by destination: {0}")]
    AuthenticationRejected(String),

    #[error("Transient upload failure: {0}")]
    UploadTransient(String),

    #[error("Upload rejected: {0}")]
    UploadPermanent(String),

    #[error("Failed to delete stale backup {id}: {reason}")]
    RetentionDeleteFailed { id: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BackupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::VersionResolutionExhausted(_) => ErrorKind::VersionResolutionExhausted,
            BackupError::DumpFailed(_) => ErrorKind::DumpFailed,
            BackupError::AuthenticationMissing(_) => ErrorKind::AuthenticationMissing,
            BackupError::AuthenticationExpiredUnrecoverable(_)
            | BackupError::AuthenticationRejected(_) => {
                ErrorKind::AuthenticationExpiredUnrecoverable
            }
            BackupError::UploadTransient(_) => ErrorKind::UploadTransient,
            BackupError::UploadPermanent(_) => ErrorKind::UploadPermanent,
            BackupError::RetentionDeleteFailed { .. } => ErrorKind::RetentionDeleteFailed,
            BackupError::Config(_) => ErrorKind::Config,
            BackupError::Database(_) => ErrorKind::Database,
            BackupError::Io(_) => ErrorKind::Io,
            BackupError::Serialization(_) => ErrorKind::Serialization,
        }
    }
}

impl From<toml::de::Error> for BackupError {
    fn from(err: toml::de::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for BackupError {
    fn from(err: sqlx::Error) -> Self {
        BackupError::Database(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for BackupError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        BackupError::AuthenticationMissing(format!("invalid service account key: {}", err))
    }
}

impl From<reqwest::Error> for BackupError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            BackupError::UploadTransient(err.to_string())
        } else {
            BackupError::UploadPermanent(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
