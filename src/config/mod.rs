mod types;

pub use types::*;

use crate::error::{BackupError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

const CONFIG_ENV: &str = "PG_DRIVE_BACKUP_CONFIG";

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".pg_drive_backup"))
        .unwrap_or_else(|| PathBuf::from(".pg_drive_backup"))
}
pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| config_dir().join("config.toml"))
}

/// Loads the config file (if any), overlays the process environment and
/// validates the result.
pub fn load() -> Result<AppConfig> {
    let mut config = load_from(&config_path())?;
    apply_env(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;
    Ok(config)
}
pub fn load_from(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        debug!("Config file not found at {:?}, using defaults", path);
        return Ok(AppConfig::default());
    }

    info!("Loading configuration from {:?}", path);
    let contents = fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&contents)?;
    Ok(config)
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| BackupError::Config(format!("{} has an invalid value: {:?}", key, value)))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(BackupError::Config(format!("{} has an invalid value: {:?}", key, value))),
    }
}

/// Overlays environment-style settings. Zero retention values mean "unset".
pub fn apply_env<F>(config: &mut AppConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = get("PGHOST") {
        config.database.host = v;
    }
    if let Some(v) = get("PGPORT") {
        config.database.port = parse_var("PGPORT", &v)?;
    }
    if let Some(v) = get("PGUSER") {
        config.database.username = v;
    }
    if let Some(v) = get("PGPASSWORD") {
        config.database.password = v;
    }
    if let Some(v) = get("PGDATABASE") {
        config.database.database = v;
    }
    if let Some(v) = get("BACKUP_DIR") {
        config.local_backup_dir = PathBuf::from(v);
    }
    if let Some(v) = get("GDRIVE_FOLDER") {
        config.drive.folder_name = v;
    }
    if let Some(v) = get("SECRETS_DIR") {
        config.drive.secrets_dir = PathBuf::from(v);
    }
    if let Some(v) = get("GDRIVE_CREDENTIALS_JSON") {
        config.drive.client_credentials_json = Some(v);
    }
    if let Some(v) = get("GDRIVE_TOKEN_JSON") {
        config.drive.token_json = Some(v);
    }
    if let Some(v) = get("GDRIVE_SERVICE_ACCOUNT_JSON") {
        config.drive.service_account_json = Some(v);
    }
    if let Some(v) = get("RETENTION_DAYS") {
        let days: u32 = parse_var("RETENTION_DAYS", &v)?;
        config.retention.max_age_days = (days > 0).then_some(days);
    }
    if let Some(v) = get("RETENTION_COUNT") {
        let count: usize = parse_var("RETENTION_COUNT", &v)?;
        config.retention.keep_last = (count > 0).then_some(count);
    }
    if let Some(v) = get("KEEP_LOCAL_BACKUP") {
        config.dump.keep_local_copy = parse_flag("KEEP_LOCAL_BACKUP", &v)?;
    }
    if let Some(v) = get("UPLOAD_MAX_RETRIES") {
        config.upload.max_transient_retries = parse_var("UPLOAD_MAX_RETRIES", &v)?;
    }
    if let Some(v) = get("BACKUP_INTERVAL_HOURS") {
        let hours: u32 = parse_var("BACKUP_INTERVAL_HOURS", &v)?;
        if hours == 0 {
            return Err(BackupError::Config("BACKUP_INTERVAL_HOURS must be at least 1".to_string()));
        }
        config.schedule = Schedule::Hours(hours);
    }
    if let Some(v) = get("LOG_FILE") {
        config.log_file = Some(PathBuf::from(v));
    }
    Ok(())
}

pub fn validate(config: &AppConfig) -> Result<()> {
    let db = &config.database;
    let missing: Vec<&str> = [
        ("PGHOST", db.host.is_empty()),
        ("PGUSER", db.username.is_empty()),
        ("PGDATABASE", db.database.is_empty()),
    ]
    .iter()
    .filter(|(_, empty)| *empty)
    .map(|(name, _)| *name)
    .collect();

    if !missing.is_empty() {
        return Err(BackupError::Config(format!(
            "required database settings are not set: {}",
            missing.join(", ")
        )));
    }
    if db.port == 0 {
        return Err(BackupError::Config("PGPORT must not be 0".to_string()));
    }
    if config.schedule.as_seconds() == 0 {
        return Err(BackupError::Config("schedule interval must be greater than zero".to_string()));
    }
    if config.dump.supported_versions.is_empty() {
        return Err(BackupError::Config("dump.supported_versions must not be empty".to_string()));
    }
    Ok(())
}
