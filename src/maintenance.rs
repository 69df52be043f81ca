use std::{io::ErrorKind, path::Path, path::PathBuf, sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::registry::TaskRegistry;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Deletes files in `downloads_dir` last modified more than
/// `older_than_secs` ago. Zero disables the sweep.
pub async fn sweep_expired_artifacts(downloads_dir: &Path, older_than_secs: u64) -> usize {
    if older_than_secs == 0 {
        return 0;
    }

    let mut entries = match tokio::fs::read_dir(downloads_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open download directory for cleanup: {error}");
            }
            return 0;
        }
    };

    let max_age = Duration::from_secs(older_than_secs);
    let now = std::time::SystemTime::now();
    let mut removed = 0;

    loop {
        let maybe_entry = match entries.next_entry().await {
            Ok(value) => value,
            Err(error) => {
                warn!("Could not iterate download directory for cleanup: {error}");
                break;
            }
        };

        let Some(entry) = maybe_entry else {
            break;
        };

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("Could not read metadata of {:?}: {error}", path);
                continue;
            }
        };

        if !metadata.is_file() {
            continue;
        }

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified_at| now.duration_since(modified_at).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Could not delete expired artifact {:?}: {error}", path),
        }
    }

    removed
}

/// Periodic cleanup: expired artifacts on disk and, when `task_retention_secs`
/// is non-zero, finished tasks in the registry.
pub fn spawn_maintenance(
    registry: Arc<TaskRegistry>,
    downloads_dir: PathBuf,
    file_expiration_secs: u64,
    task_retention_secs: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            ticker.tick().await;

            let removed = sweep_expired_artifacts(&downloads_dir, file_expiration_secs).await;
            if removed > 0 {
                info!("Removed {removed} expired artifact(s)");
            }

            if task_retention_secs > 0 {
                let retention = i64::try_from(task_retention_secs)
                    .ok()
                    .and_then(chrono::Duration::try_seconds)
                    .unwrap_or(chrono::Duration::MAX);
                let pruned = registry.prune_finished(retention);
                if pruned > 0 {
                    info!("Pruned {pruned} finished task(s)");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn zero_expiration_keeps_everything() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.mp4"), b"x").await.unwrap();

        assert_eq!(sweep_expired_artifacts(dir.path(), 0).await, 0);
        assert!(dir.path().join("a.mp4").exists());
    }

    #[tokio::test]
    async fn fresh_files_survive_the_sweep() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.mp4"), b"x").await.unwrap();

        assert_eq!(sweep_expired_artifacts(dir.path(), 3600).await, 0);
        assert!(dir.path().join("a.mp4").exists());
    }

    #[tokio::test]
    async fn missing_directory_is_ignored() {
        let dir = tempdir().unwrap();
        assert_eq!(
            sweep_expired_artifacts(&dir.path().join("missing"), 60).await,
            0
        );
    }
}
