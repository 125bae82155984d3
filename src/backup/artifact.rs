use crate::error::Result;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

pub const ARTIFACT_EXTENSION: &str = "dump";
pub const PARTIAL_EXTENSION: &str = "partial";

/// A finished dump on local storage.
#[derive(Debug, Clone)]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub database: String,
    pub sha256: String,
}

impl BackupArtifact {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| artifact_file_name(&self.database, self.created_at))
    }
}

/// Prefix shared by every artifact of `database`; retention matches on it.
pub fn artifact_prefix(database: &str) -> String {
    let safe: String = database
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{}_", safe)
}

/// Recognises artifact names generated for one database. A bare prefix
/// match is not enough: `shop_` is also the start of `shop_eu_...`.
pub struct ArtifactMatcher {
    pattern: Option<Regex>,
}

impl ArtifactMatcher {
    pub fn new(database: &str) -> Self {
        let pattern = Regex::new(&format!(
            r"^{}\d{{8}}_\d{{6}}_[0-9a-f]{{8}}\.{}$",
            regex::escape(&artifact_prefix(database)),
            ARTIFACT_EXTENSION
        ))
        .ok();
        Self { pattern }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.pattern.as_ref().map_or(false, |re| re.is_match(name))
    }
}

/// `<db>_<YYYYmmdd_HHMMSS>_<8 hex>.dump`. The random suffix keeps names
/// unique when two cycles start within the same second.
pub fn artifact_file_name(database: &str, at: DateTime<Utc>) -> String {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}{}_{}.{}",
        artifact_prefix(database),
        at.format("%Y%m%d_%H%M%S"),
        &nonce[..8],
        ARTIFACT_EXTENSION
    )
}

pub fn calculate_sha256(file_path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};

    let file = File::open(file_path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
