use super::artifact::{artifact_file_name, calculate_sha256, BackupArtifact, PARTIAL_EXTENSION};
use crate::config::{DatabaseConfig, DumpConfig};
use crate::database::DumpTool;
use crate::error::{BackupError, Result};
use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};
use tokio::process::Command;
use tracing::{debug, info, warn};

const STDERR_TAIL_LINES: usize = 20;

pub struct DumpExecutor {
    timeout: Duration,
    connect_timeout: Duration,
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

fn discard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed incomplete dump {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove incomplete dump {}: {}", path.display(), e),
    }
}

/// Removes `*.partial` files older than `max_age` left by interrupted runs.
pub(crate) fn clean_stale_partials(dir: &Path, max_age: Duration) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(PARTIAL_EXTENSION) {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age >= max_age {
            info!("Removing leftover partial dump {}", path.display());
            if fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
    }
    removed
}

impl DumpExecutor {
    pub fn new(config: &DumpConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }

    fn command(&self, tool: &DumpTool, db: &DatabaseConfig, output: &Path) -> Command {
        let mut cmd = Command::new(&tool.program);
        cmd.arg("-h")
            .arg(&db.host)
            .arg("-p")
            .arg(db.port.to_string())
            .arg("-U")
            .arg(&db.username)
            .arg("-F")
            .arg("c")
            .arg("-b")
            .arg("-v")
            .arg("-f")
            .arg(output)
            .arg(&db.database)
            .env("PGPASSWORD", &db.password)
            .env("PGCONNECT_TIMEOUT", self.connect_timeout.as_secs().max(1).to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Dumps `db` into a new file under `backup_dir`. On any failure no file
    /// from this invocation is left behind.
    pub async fn dump(
        &self,
        tool: &DumpTool,
        db: &DatabaseConfig,
        backup_dir: &Path,
    ) -> Result<BackupArtifact> {
        fs::create_dir_all(backup_dir)?;
        clean_stale_partials(backup_dir, self.timeout);

        let created_at = Utc::now();
        let file_name = artifact_file_name(&db.database, created_at);
        let final_path = backup_dir.join(&file_name);
        let partial_path = PathBuf::from(format!("{}.{}", final_path.display(), PARTIAL_EXTENSION));

        if tool.exact {
            info!("Dumping database {} with {}", db.database, tool);
        } else {
            warn!(
                "Dumping database {} with {}; the dump may fail or lose objects",
                db.database, tool
            );
        }

        let child = match self.command(tool, db, &partial_path).spawn() {
            Ok(child) => child,
            Err(e) => {
                discard(&partial_path);
                return Err(BackupError::DumpFailed(format!(
                    "cannot start {}: {}",
                    tool.program.display(),
                    e
                )));
            }
        };

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                discard(&partial_path);
                return Err(BackupError::DumpFailed(format!("waiting for pg_dump: {}", e)));
            }
            Err(_) => {
                discard(&partial_path);
                return Err(BackupError::DumpFailed(format!(
                    "pg_dump did not finish within {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        if !output.status.success() {
            discard(&partial_path);
            return Err(BackupError::DumpFailed(format!(
                "pg_dump exited with {}: {}",
                output.status,
                stderr_tail(&output.stderr)
            )));
        }
        debug!("pg_dump output:\n{}", String::from_utf8_lossy(&output.stderr));

        let size = fs::metadata(&partial_path).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            discard(&partial_path);
            return Err(BackupError::DumpFailed(
                "pg_dump reported success but produced no output".to_string(),
            ));
        }

        if let Err(e) = fs::rename(&partial_path, &final_path) {
            discard(&partial_path);
            return Err(e.into());
        }

        let hash_path = final_path.clone();
        let sha256 = match tokio::task::spawn_blocking(move || calculate_sha256(&hash_path)).await {
            Ok(Ok(hash)) => hash,
            Ok(Err(e)) => {
                discard(&final_path);
                return Err(e);
            }
            Err(e) => {
                discard(&final_path);
                return Err(io::Error::new(io::ErrorKind::Other, e).into());
            }
        };

        info!(
            "Dump completed: {} ({:.2} MB)",
            final_path.display(),
            size as f64 / 1024.0 / 1024.0
        );

        Ok(BackupArtifact {
            path: final_path,
            size,
            created_at,
            database: db.database.clone(),
            sha256,
        })
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use crate::database::ServerVersion;
    use crate::error::ErrorKind;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    /// Writes an executable that finds its `-f` target in `$out`, then runs `body`.
    pub(crate) fn fake_pg_dump(dir: &Path, body: &str) -> DumpTool {
        let path = dir.join("pg_dump");
        let script = format!(
            "#!/bin/sh\nout=\"\"\nall=\"$*\"\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = \"-f\" ]; then out=\"$2\"; fi\n  shift\ndone\n{}\n",
            body
        );
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        DumpTool {
            program: path,
            version: ServerVersion(15),
            exact: true,
        }
    }

    fn db() -> DatabaseConfig {
        DatabaseConfig {
            host: "localhost".to_string(),
            port: 5432,
            username: "postgres".to_string(),
            password: "s3cret".to_string(),
            database: "shop".to_string(),
        }
    }

    fn executor() -> DumpExecutor {
        DumpExecutor::new(&DumpConfig {
            timeout_secs: 5,
            ..DumpConfig::default()
        })
    }

    fn files_in(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .map(|entries| entries.flatten().map(|e| e.path()).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_successful_dump_produces_artifact() {
        let bin = tempdir().unwrap();
        let out = tempdir().unwrap();
        let tool = fake_pg_dump(bin.path(), "printf 'PGDMP payload' > \"$out\"");

        let artifact = executor().dump(&tool, &db(), out.path()).await.unwrap();

        assert!(artifact.path.exists());
        assert_eq!(artifact.size, "PGDMP payload".len() as u64);
        assert_eq!(artifact.database, "shop");
        assert!(artifact.file_name().starts_with("shop_"));
        assert_eq!(artifact.sha256.len(), 64);
        assert_eq!(files_in(out.path()), vec![artifact.path.clone()]);
    }

    #[tokio::test]
    async fn test_password_never_on_command_line() {
        let bin = tempdir().unwrap();
        let out = tempdir().unwrap();
        let tool = fake_pg_dump(bin.path(), "printf '%s|%s' \"$PGPASSWORD\" \"$all\" > \"$out\"");

        let artifact = executor().dump(&tool, &db(), out.path()).await.unwrap();
        let content = fs::read_to_string(&artifact.path).unwrap();
        let (env_pw, args) = content.split_once('|').unwrap();

        assert_eq!(env_pw, "s3cret");
        assert!(!args.contains("s3cret"));
        assert!(args.contains("-F c"));
        assert!(args.ends_with("shop"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_removes_partial_file() {
        let bin = tempdir().unwrap();
        let out = tempdir().unwrap();
        let tool = fake_pg_dump(
            bin.path(),
            "printf 'half' > \"$out\"\necho 'pg_dump: error: server version mismatch' >&2\nexit 1",
        );

        let err = executor().dump(&tool, &db(), out.path()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DumpFailed);
        assert!(err.to_string().contains("server version mismatch"));
        assert!(files_in(out.path()).is_empty());
    }

    #[tokio::test]
    async fn test_empty_output_is_failure() {
        let bin = tempdir().unwrap();
        let out = tempdir().unwrap();
        let tool = fake_pg_dump(bin.path(), ": > \"$out\"");

        let err = executor().dump(&tool, &db(), out.path()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DumpFailed);
        assert!(files_in(out.path()).is_empty());
    }

    #[tokio::test]
    async fn test_timeout_kills_and_cleans_up() {
        let bin = tempdir().unwrap();
        let out = tempdir().unwrap();
        let tool = fake_pg_dump(bin.path(), "printf 'x' > \"$out\"\nsleep 10");
        let executor = DumpExecutor {
            timeout: Duration::from_millis(300),
            connect_timeout: Duration::from_secs(1),
        };

        let err = executor.dump(&tool, &db(), out.path()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DumpFailed);
        assert!(files_in(out.path()).is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_is_dump_failure() {
        let out = tempdir().unwrap();
        let tool = DumpTool {
            program: out.path().join("does-not-exist"),
            version: ServerVersion(15),
            exact: false,
        };

        let err = executor().dump(&tool, &db(), out.path()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DumpFailed);
    }

    #[test]
    fn test_clean_stale_partials_keeps_finished_dumps() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("shop_1.dump.partial"), "x").unwrap();
        fs::write(dir.path().join("shop_1.dump"), "x").unwrap();

        assert_eq!(clean_stale_partials(dir.path(), Duration::ZERO), 1);
        assert_eq!(files_in(dir.path()), vec![dir.path().join("shop_1.dump")]);
    }

    #[test]
    fn test_recent_partials_survive() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("shop_2.dump.partial"), "x").unwrap();

        assert_eq!(clean_stale_partials(dir.path(), Duration::from_secs(3600)), 0);
    }
}
