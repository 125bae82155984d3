use super::artifact::{artifact_prefix, ArtifactMatcher};
use crate::config::RetentionConfig;
use crate::error::BackupError;
use crate::upload::{ListFilter, RemoteObject, RemoteStore, UploadResult};
use chrono::{DateTime, Duration, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum RetentionPolicy {
    KeepAll,
    KeepLast(usize),
    MaxAge(Duration),
    /// Pruned when outside the newest `keep_last` or older than `max_age`.
    Both { keep_last: usize, max_age: Duration },
}

impl RetentionPolicy {
    pub fn from_config(config: &RetentionConfig) -> Self {
        let max_age = config.max_age_days.map(|d| Duration::days(d as i64));
        match (config.keep_last, max_age) {
            (None, None) => RetentionPolicy::KeepAll,
            (Some(n), None) => RetentionPolicy::KeepLast(n),
            (None, Some(age)) => RetentionPolicy::MaxAge(age),
            (Some(keep_last), Some(max_age)) => RetentionPolicy::Both { keep_last, max_age },
        }
    }

    fn keep_last(&self) -> Option<usize> {
        match self {
            RetentionPolicy::KeepLast(n) | RetentionPolicy::Both { keep_last: n, .. } => Some(*n),
            _ => None,
        }
    }

    fn max_age(&self) -> Option<Duration> {
        match self {
            RetentionPolicy::MaxAge(age) | RetentionPolicy::Both { max_age: age, .. } => Some(*age),
            _ => None,
        }
    }
}

impl std::fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetentionPolicy::KeepAll => write!(f, "keep all"),
            RetentionPolicy::KeepLast(n) => write!(f, "keep last {}", n),
            RetentionPolicy::MaxAge(age) => write!(f, "keep {} day(s)", age.num_days()),
            RetentionPolicy::Both { keep_last, max_age } => {
                write!(f, "keep last {} within {} day(s)", keep_last, max_age.num_days())
            }
        }
    }
}

/// Anything retention can rank by age.
pub trait Retainable {
    fn key(&self) -> &str;
    fn created_at(&self) -> DateTime<Utc>;
}

impl Retainable for RemoteObject {
    fn key(&self) -> &str {
        &self.id
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug, Clone)]
pub struct LocalArtifact {
    pub path: PathBuf,
    key: String,
    pub modified: DateTime<Utc>,
}

impl Retainable for LocalArtifact {
    fn key(&self) -> &str {
        &self.key
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.modified
    }
}

/// Items the policy no longer covers, newest first. `protected` is never
/// returned.
pub fn select_stale<T: Retainable + Clone>(
    items: &[T],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
    protected: &str,
) -> Vec<T> {
    if *policy == RetentionPolicy::KeepAll {
        return Vec::new();
    }

    let mut sorted: Vec<&T> = items.iter().collect();
    sorted.sort_by(|a, b| b.created_at().cmp(&a.created_at()));

    let cutoff = policy.max_age().map(|age| now - age);
    sorted
        .into_iter()
        .enumerate()
        .filter(|(rank, item)| {
            let beyond_count = policy.keep_last().map_or(false, |n| *rank >= n);
            let too_old = cutoff.map_or(false, |c| item.created_at() < c);
            (beyond_count || too_old) && item.key() != protected
        })
        .map(|(_, item)| item.clone())
        .collect()
}

#[derive(Debug, Default)]
pub struct RetentionReport {
    pub deleted: Vec<String>,
    pub failed: Vec<BackupError>,
}

pub struct RetentionManager {
    policy: RetentionPolicy,
}

impl RetentionManager {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Best-effort: listing or deletion failures are logged and reported but
    /// never abort the remaining deletions.
    pub async fn prune_remote(
        &self,
        store: &dyn RemoteStore,
        access_token: &str,
        database: &str,
        current: &UploadResult,
    ) -> RetentionReport {
        let mut report = RetentionReport::default();
        if self.policy == RetentionPolicy::KeepAll {
            debug!("Retention policy is keep-all, skipping remote cleanup");
            return report;
        }

        let filter = ListFilter {
            folder_id: current.folder_id.clone(),
            name_prefix: artifact_prefix(database),
            database: database.to_string(),
        };
        let matcher = ArtifactMatcher::new(database);
        let existing: Vec<RemoteObject> = match store.list(access_token, &filter).await {
            Ok(objects) => objects
                .into_iter()
                .filter(|o| matcher.matches(&o.name))
                .collect(),
            Err(e) => {
                warn!("Could not list remote backups for cleanup: {}", e);
                report.failed.push(e);
                return report;
            }
        };

        let stale = select_stale(&existing, &self.policy, Utc::now(), &current.remote_id);
        info!(
            "Remote retention ({}): {} backup(s) found, {} to delete",
            self.policy,
            existing.len(),
            stale.len()
        );

        for object in stale {
            match store.delete(access_token, &object.id).await {
                Ok(()) => {
                    info!("Deleted old backup from Google Drive: {}", object.name);
                    report.deleted.push(object.id);
                }
                Err(e) => {
                    let err = BackupError::RetentionDeleteFailed {
                        id: object.id.clone(),
                        reason: e.to_string(),
                    };
                    warn!("{}", err);
                    report.failed.push(err);
                }
            }
        }
        report
    }

    pub fn prune_local(&self, dir: &Path, database: &str, current: &Path) -> RetentionReport {
        let mut report = RetentionReport::default();
        if self.policy == RetentionPolicy::KeepAll {
            return report;
        }

        let artifacts = match list_local(dir, database) {
            Ok(artifacts) => artifacts,
            Err(e) => {
                warn!("Could not list local backups in {}: {}", dir.display(), e);
                report.failed.push(e.into());
                return report;
            }
        };

        let protected = current.to_string_lossy();
        for artifact in select_stale(&artifacts, &self.policy, Utc::now(), &protected) {
            match fs::remove_file(&artifact.path) {
                Ok(()) => {
                    info!("Deleting old local backup: {}", artifact.path.display());
                    report.deleted.push(artifact.key);
                }
                Err(e) => {
                    let err = BackupError::RetentionDeleteFailed {
                        id: artifact.key.clone(),
                        reason: e.to_string(),
                    };
                    warn!("{}", err);
                    report.failed.push(err);
                }
            }
        }
        report
    }
}

fn list_local(dir: &Path, database: &str) -> std::io::Result<Vec<LocalArtifact>> {
    let matcher = ArtifactMatcher::new(database);
    let mut artifacts = Vec::new();

    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if !matcher.matches(&name) || !path.is_file() {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        artifacts.push(LocalArtifact {
            key: path.to_string_lossy().to_string(),
            path,
            modified: DateTime::<Utc>::from(modified),
        });
    }
    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::artifact::artifact_file_name;
    use crate::error::Result;
    use crate::upload::test_support::MemoryStore;

    fn object(id: &str, age_days: i64) -> RemoteObject {
        RemoteObject {
            id: id.to_string(),
            name: format!("shop_{}.dump", id),
            created_at: Utc::now() - Duration::days(age_days),
            size: Some(1),
        }
    }

    fn ids(objects: &[RemoteObject]) -> Vec<&str> {
        objects.iter().map(|o| o.id.as_str()).collect()
    }

    #[test]
    fn test_policy_from_config() {
        assert_eq!(
            RetentionPolicy::from_config(&RetentionConfig::default()),
            RetentionPolicy::KeepAll
        );
        assert_eq!(
            RetentionPolicy::from_config(&RetentionConfig {
                keep_last: Some(3),
                max_age_days: None
            }),
            RetentionPolicy::KeepLast(3)
        );
        assert_eq!(
            RetentionPolicy::from_config(&RetentionConfig {
                keep_last: None,
                max_age_days: Some(7)
            }),
            RetentionPolicy::MaxAge(Duration::days(7))
        );
    }

    #[test]
    fn test_keep_last_deletes_n_minus_k() {
        let items: Vec<RemoteObject> = (0..6).map(|i| object(&format!("f{}", i), i)).collect();
        let stale = select_stale(&items, &RetentionPolicy::KeepLast(2), Utc::now(), "f0");

        assert_eq!(stale.len(), 4);
        assert_eq!(ids(&stale), vec!["f2", "f3", "f4", "f5"]);
    }

    #[test]
    fn test_protected_item_survives_even_outside_window() {
        let items = vec![object("new", 0), object("old", 10), object("current", 20)];
        let stale = select_stale(&items, &RetentionPolicy::KeepLast(1), Utc::now(), "current");
        assert_eq!(ids(&stale), vec!["old"]);
    }

    #[test]
    fn test_max_age() {
        let items = vec![object("a", 1), object("b", 8), object("c", 30)];
        let stale = select_stale(
            &items,
            &RetentionPolicy::MaxAge(Duration::days(7)),
            Utc::now(),
            "a",
        );
        assert_eq!(ids(&stale), vec!["b", "c"]);
    }

    #[test]
    fn test_both_limits() {
        let items = vec![object("a", 0), object("b", 1), object("c", 2), object("d", 9)];
        let policy = RetentionPolicy::Both {
            keep_last: 3,
            max_age: Duration::days(5),
        };
        let stale = select_stale(&items, &policy, Utc::now(), "a");
        assert_eq!(ids(&stale), vec!["d"]);
    }

    #[test]
    fn test_keep_all_deletes_nothing() {
        let items = vec![object("a", 100)];
        assert!(select_stale(&items, &RetentionPolicy::KeepAll, Utc::now(), "").is_empty());
    }

    fn dump_name(database: &str, hours_ago: i64) -> String {
        artifact_file_name(database, Utc::now() - Duration::hours(hours_ago))
    }

    /// `count` generated artifacts for `shop`, one hour apart; names oldest last.
    async fn seeded_store(count: usize) -> (MemoryStore, String, Vec<String>) {
        let store = MemoryStore::default();
        let folder = store.ensure_folder("tok", "postgres_backups").await.unwrap();
        let mut names = Vec::new();
        for i in 0..count {
            let name = dump_name("shop", i as i64 + 1);
            store.insert(&folder, &name, Utc::now() - Duration::hours(i as i64 + 1));
            names.push(name);
        }
        (store, folder, names)
    }

    fn current(folder: &str, id: &str) -> UploadResult {
        UploadResult {
            remote_id: id.to_string(),
            name: "shop_current.dump".to_string(),
            folder_id: folder.to_string(),
            uploaded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_prune_remote_keeps_latest_and_current() {
        let (store, folder, names) = seeded_store(5).await;
        let latest_name = dump_name("shop", 0);
        let latest = store.insert(&folder, &latest_name, Utc::now());
        let manager = RetentionManager::new(RetentionPolicy::KeepLast(3));

        let report = manager
            .prune_remote(&store, "tok", "shop", &current(&folder, &latest))
            .await;

        assert_eq!(report.deleted.len(), 3);
        assert!(report.failed.is_empty());
        let remaining = store.names(&folder);
        assert_eq!(remaining.len(), 3);
        assert!(remaining.contains(&latest_name));
        assert!(remaining.contains(&names[0]));
        assert!(remaining.contains(&names[1]));
    }

    #[tokio::test]
    async fn test_prune_remote_ignores_other_databases() {
        let (store, folder, _) = seeded_store(2).await;
        let billing = dump_name("billing", 24 * 30);
        store.insert(&folder, &billing, Utc::now() - Duration::days(30));
        let latest = store.insert(&folder, &dump_name("shop", 0), Utc::now());
        let manager = RetentionManager::new(RetentionPolicy::KeepLast(1));

        manager
            .prune_remote(&store, "tok", "shop", &current(&folder, &latest))
            .await;

        let remaining = store.names(&folder);
        assert!(remaining.contains(&billing));
        assert_eq!(remaining.len(), 2);
    }

    #[tokio::test]
    async fn test_prune_remote_spares_database_sharing_the_prefix() {
        let (store, folder, _) = seeded_store(3).await;
        let neighbours: Vec<String> = (0..3)
            .map(|i| {
                let name = dump_name("shop_eu", 24 * (i + 10));
                store.insert(&folder, &name, Utc::now() - Duration::days(i + 10));
                name
            })
            .collect();
        store.insert(&folder, "shop_manual.dump", Utc::now() - Duration::days(60));
        let latest = store.insert(&folder, &dump_name("shop", 0), Utc::now());
        let manager = RetentionManager::new(RetentionPolicy::KeepLast(1));

        let report = manager
            .prune_remote(&store, "tok", "shop", &current(&folder, &latest))
            .await;

        assert_eq!(report.deleted.len(), 3);
        let remaining = store.names(&folder);
        for name in &neighbours {
            assert!(remaining.contains(name), "{} was deleted", name);
        }
        assert!(remaining.contains(&"shop_manual.dump".to_string()));
        assert_eq!(remaining.len(), 5);
    }

    #[tokio::test]
    async fn test_single_delete_failure_does_not_stop_cleanup() {
        let (store, folder, names) = seeded_store(4).await;
        let latest = store.insert(&folder, &dump_name("shop", 0), Utc::now());
        let victim = store.id_of(&folder, &names[1]).unwrap();
        store.fail_delete_of(&victim);
        let manager = RetentionManager::new(RetentionPolicy::KeepLast(1));

        let report = manager
            .prune_remote(&store, "tok", "shop", &current(&folder, &latest))
            .await;

        assert_eq!(report.deleted.len(), 3);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(
            report.failed[0],
            BackupError::RetentionDeleteFailed { ref id, .. } if *id == victim
        ));
    }

    #[tokio::test]
    async fn test_list_failure_is_reported_not_raised() {
        let store = MemoryStore::default();
        store.fail_list();
        let manager = RetentionManager::new(RetentionPolicy::KeepLast(1));

        let report = manager
            .prune_remote(&store, "tok", "shop", &current("folder", "x"))
            .await;
        assert!(report.deleted.is_empty());
        assert_eq!(report.failed.len(), 1);
    }

    #[test]
    fn test_prune_local() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let own: Vec<String> = (0..3).map(|i| dump_name("shop", i)).collect();
        let other = dump_name("other", 5);
        let partial = format!("{}.partial", dump_name("shop", 6));
        for name in own.iter().chain([&other, &partial]) {
            fs::write(dir.path().join(name), "x")?;
        }
        let current = dir.path().join(&own[2]);
        let manager = RetentionManager::new(RetentionPolicy::KeepLast(0));

        let report = manager.prune_local(dir.path(), "shop", &current);

        assert_eq!(report.deleted.len(), 2);
        assert!(current.exists());
        assert!(dir.path().join(&other).exists());
        assert!(dir.path().join(&partial).exists());
        Ok(())
    }

    #[test]
    fn test_prune_local_spares_database_sharing_the_prefix() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let own = [dump_name("shop", 1), dump_name("shop", 2)];
        let neighbours = [dump_name("shop_eu", 3), dump_name("shop_eu", 4)];
        for name in own.iter().chain(neighbours.iter()) {
            fs::write(dir.path().join(name), "x")?;
        }
        let current = dir.path().join(&own[0]);
        let manager = RetentionManager::new(RetentionPolicy::KeepLast(0));

        let report = manager.prune_local(dir.path(), "shop", &current);

        assert!(report.failed.is_empty());
        assert_eq!(report.deleted.len(), 1);
        assert!(!dir.path().join(&own[1]).exists());
        for name in &neighbours {
            assert!(dir.path().join(name).exists(), "{} was deleted", name);
        }
        Ok(())
    }
}
