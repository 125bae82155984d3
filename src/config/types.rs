use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 5432,
            username: String::new(),
            password: String::new(),
            database: String::new(),
        }
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Schedule {
    Minutes(u32),
    Hours(u32),
    Days(u32),
}

impl Schedule {
    pub fn as_seconds(&self) -> u64 {
        match self {
            Schedule::Minutes(n) => *n as u64 * 60,
            Schedule::Hours(n) => *n as u64 * 3600,
            Schedule::Days(n) => *n as u64 * 86400,
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::Minutes(n) => write!(f, "Every {} minute(s)", n),
            Schedule::Hours(n) => write!(f, "Every {} hour(s)", n),
            Schedule::Days(n) => write!(f, "Every {} day(s)", n),
        }
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::Hours(24)
    }
}

/// Raw credential material may be supplied inline (usually through the
/// environment); it is written into `secrets_dir` on first use.
#[derive(Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    pub folder_name: String,
    pub secrets_dir: PathBuf,
    #[serde(default)]
    pub client_credentials_json: Option<String>,
    #[serde(default)]
    pub token_json: Option<String>,
    #[serde(default)]
    pub service_account_json: Option<String>,
    /// 0 picks a free port for the loopback redirect.
    #[serde(default)]
    pub redirect_port: u16,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            folder_name: "postgres_backups".to_string(),
            secrets_dir: PathBuf::from("/secrets"),
            client_credentials_json: None,
            token_json: None,
            service_account_json: None,
            redirect_port: 0,
        }
    }
}

impl std::fmt::Debug for DriveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveConfig")
            .field("folder_name", &self.folder_name)
            .field("secrets_dir", &self.secrets_dir)
            .field("client_credentials_json", &self.client_credentials_json.as_ref().map(|_| "<set>"))
            .field("token_json", &self.token_json.as_ref().map(|_| "<set>"))
            .field("service_account_json", &self.service_account_json.as_ref().map(|_| "<set>"))
            .field("redirect_port", &self.redirect_port)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetentionConfig {
    #[serde(default)]
    pub keep_last: Option<usize>,
    #[serde(default)]
    pub max_age_days: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub max_transient_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_transient_retries: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            request_timeout_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpConfig {
    pub connect_timeout_secs: u64,
    pub timeout_secs: u64,
    /// Probed in descending order when the server cannot be queried directly.
    pub supported_versions: Vec<u32>,
    /// `{version}` is replaced by the major version.
    pub install_path_template: String,
    pub keep_local_copy: bool,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            timeout_secs: 6 * 3600,
            supported_versions: vec![17, 16, 15, 14, 13, 12, 11, 10],
            install_path_template: "/usr/lib/postgresql/{version}/bin".to_string(),
            keep_local_copy: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub drive: DriveConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub dump: DumpConfig,
    #[serde(default)]
    pub schedule: Schedule,
    pub local_backup_dir: PathBuf,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            drive: DriveConfig::default(),
            retention: RetentionConfig::default(),
            upload: UploadConfig::default(),
            dump: DumpConfig::default(),
            schedule: Schedule::default(),
            local_backup_dir: PathBuf::from("/backups"),
            log_file: None,
        }
    }
}
