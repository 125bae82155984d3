use crate::config::DatabaseConfig;
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use sqlx::postgres::PgConnectOptions;
use sqlx::{ConnectOptions, Connection};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const VERSION_QUERY: &str = "SELECT version()";

/// Asks a server for its version string, either through the built-in driver
/// or through an installed `psql` client.
#[async_trait]
pub trait ServerProbe: Send + Sync {
    async fn query_version(&self, db: &DatabaseConfig, timeout: Duration) -> Result<String>;
    async fn query_version_with_client(
        &self,
        psql: &Path,
        db: &DatabaseConfig,
        timeout: Duration,
    ) -> Result<String>;
}

pub struct PostgresProbe;

#[async_trait]
impl ServerProbe for PostgresProbe {
    async fn query_version(&self, db: &DatabaseConfig, timeout: Duration) -> Result<String> {
        debug!("Querying server version on {}:{}", db.host, db.port);
        let opts = PgConnectOptions::new()
            .host(&db.host)
            .port(db.port)
            .username(&db.username)
            .password(&db.password)
            .database(&db.database);

        let query = async {
            let mut conn = opts.connect().await?;
            let version: String = sqlx::query_scalar(VERSION_QUERY).fetch_one(&mut conn).await?;
            let _ = conn.close().await;
            Ok::<_, BackupError>(version)
        };

        tokio::time::timeout(timeout, query).await.map_err(|_| {
            BackupError::Database(format!(
                "connection to {}:{} timed out after {}s",
                db.host,
                db.port,
                timeout.as_secs()
            ))
        })?
    }

    async fn query_version_with_client(
        &self,
        psql: &Path,
        db: &DatabaseConfig,
        timeout: Duration,
    ) -> Result<String> {
        debug!("Querying server version with {}", psql.display());
        let child = Command::new(psql)
            .arg("-h")
            .arg(&db.host)
            .arg("-p")
            .arg(db.port.to_string())
            .arg("-U")
            .arg(&db.username)
            .arg("-d")
            .arg(&db.database)
            .arg("-w")
            .arg("-tAc")
            .arg(VERSION_QUERY)
            .env("PGPASSWORD", &db.password)
            .env("PGCONNECT_TIMEOUT", timeout.as_secs().max(1).to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                BackupError::Database(format!(
                    "{} did not answer within {}s",
                    psql.display(),
                    timeout.as_secs()
                ))
            })??;

        if !output.status.success() {
            return Err(BackupError::Database(format!(
                "{} exited with {}: {}",
                psql.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
