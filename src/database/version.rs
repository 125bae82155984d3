use super::probe::ServerProbe;
use crate::config::{DatabaseConfig, DumpConfig};
use crate::error::BackupError;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const VERSION_MARKER: &str = "PostgreSQL";
const GENERIC_DUMP: &str = "pg_dump";
const GENERIC_PSQL: &str = "psql";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion(pub u32);

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DumpTool {
    pub program: PathBuf,
    pub version: ServerVersion,
    /// False when the generic binary is used because nothing better was found.
    pub exact: bool,
}

impl fmt::Display for DumpTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (server {}", self.program.display(), self.version)?;
        if !self.exact {
            write!(f, ", no matching client installed")?;
        }
        write!(f, ")")
    }
}

/// `pg_dump` and `psql` of a single client installation.
#[derive(Debug, Clone)]
struct ClientBinaries {
    pg_dump: PathBuf,
    psql: PathBuf,
}

/// Extracts the first integer after `marker`, e.g. 15 from
/// "PostgreSQL 15.4 (Debian 15.4-1) on x86_64".
pub fn parse_major_version(version: &str, marker: &str) -> Option<u32> {
    let rest = &version[version.find(marker)? + marker.len()..];
    let start = rest.find(|c: char| c.is_ascii_digit())?;
    let digits: String = rest[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

pub struct VersionResolver {
    probe: Arc<dyn ServerProbe>,
    supported_versions: Vec<u32>,
    install_path_template: String,
    connect_timeout: Duration,
}

impl VersionResolver {
    pub fn new(probe: Arc<dyn ServerProbe>, config: &DumpConfig) -> Self {
        let mut supported_versions = config.supported_versions.clone();
        supported_versions.sort_unstable_by(|a, b| b.cmp(a));
        supported_versions.dedup();

        Self {
            probe,
            supported_versions,
            install_path_template: config.install_path_template.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }

    fn locate_client(&self, version: u32) -> Option<ClientBinaries> {
        let bin_dir = PathBuf::from(
            self.install_path_template
                .replace("{version}", &version.to_string()),
        );
        let pg_dump = bin_dir.join(GENERIC_DUMP);
        if pg_dump.is_file() {
            return Some(ClientBinaries {
                pg_dump,
                psql: bin_dir.join(GENERIC_PSQL),
            });
        }

        let pg_dump = which::which(format!("{}-{}", GENERIC_DUMP, version)).ok()?;
        let psql = which::which(format!("{}-{}", GENERIC_PSQL, version))
            .unwrap_or_else(|_| pg_dump.with_file_name(GENERIC_PSQL));
        Some(ClientBinaries { pg_dump, psql })
    }

    fn generic_tool(version: ServerVersion) -> DumpTool {
        DumpTool {
            program: which::which(GENERIC_DUMP).unwrap_or_else(|_| PathBuf::from(GENERIC_DUMP)),
            version,
            exact: false,
        }
    }

    fn highest_supported(&self) -> ServerVersion {
        ServerVersion(self.supported_versions.first().copied().unwrap_or(0))
    }

    /// A client of version `candidate` connected and reported `raw`. Newer
    /// clients connect to older servers, so the banner decides the version
    /// and an installed client of exactly that version is preferred.
    fn tool_for_banner(&self, candidate: u32, bins: ClientBinaries, raw: &str) -> DumpTool {
        let Some(major) = parse_major_version(raw, VERSION_MARKER) else {
            warn!(
                "Client {} connected but reported {:?}; assuming server version {}",
                candidate, raw, candidate
            );
            return DumpTool {
                program: bins.pg_dump,
                version: ServerVersion(candidate),
                exact: true,
            };
        };

        let version = ServerVersion(major);
        if major == candidate {
            info!("Client {} connected, using {}", candidate, bins.pg_dump.display());
            return DumpTool {
                program: bins.pg_dump,
                version,
                exact: true,
            };
        }

        match self.locate_client(major) {
            Some(exact) => {
                info!(
                    "Client {} reports server version {}, using {}",
                    candidate,
                    version,
                    exact.pg_dump.display()
                );
                DumpTool {
                    program: exact.pg_dump,
                    version,
                    exact: true,
                }
            }
            None => {
                warn!(
                    "Server version {} has no matching client, dumping with {}",
                    version,
                    bins.pg_dump.display()
                );
                DumpTool {
                    program: bins.pg_dump,
                    version,
                    exact: false,
                }
            }
        }
    }

    /// Never fails: when no compatible client can be confirmed the generic
    /// `pg_dump` is returned and the dump itself decides.
    pub async fn resolve(&self, db: &DatabaseConfig) -> DumpTool {
        match self.probe.query_version(db, self.connect_timeout).await {
            Ok(raw) => match parse_major_version(&raw, VERSION_MARKER) {
                Some(major) => {
                    let version = ServerVersion(major);
                    info!("Detected PostgreSQL server version {}", version);
                    return match self.locate_client(major) {
                        Some(bins) => DumpTool {
                            program: bins.pg_dump,
                            version,
                            exact: true,
                        },
                        None => {
                            warn!(
                                "No pg_dump {} installed, using the default {}",
                                version, GENERIC_DUMP
                            );
                            Self::generic_tool(version)
                        }
                    };
                }
                None => warn!("Could not parse server version from {:?}", raw),
            },
            Err(e) => warn!("Direct version query failed: {}", e),
        }

        for &candidate in &self.supported_versions {
            let Some(bins) = self.locate_client(candidate) else {
                debug!("No client installed for version {}", candidate);
                continue;
            };
            match self
                .probe
                .query_version_with_client(&bins.psql, db, self.connect_timeout)
                .await
            {
                Ok(raw) => return self.tool_for_banner(candidate, bins, &raw),
                Err(e) => debug!("Client {} could not connect: {}", candidate, e),
            }
        }

        let fallback = self.highest_supported();
        let reason = BackupError::VersionResolutionExhausted(format!(
            "tried versions {:?}",
            self.supported_versions
        ));
        warn!(
            "{}; falling back to {} for version {}",
            reason, GENERIC_DUMP, fallback
        );
        Self::generic_tool(fallback)
    }
}
