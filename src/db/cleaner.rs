use std::fs;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Task;
use crate::version::Version;

/// Deletes stale version directories left behind by rotation, off the cache
/// queue. Failures are absorbed: a directory that would not delete today gets
/// another chance after the next open.
pub(crate) fn spawn(
    sender: mpsc::WeakSender<Task>,
    generation: u64,
    base: PathBuf,
    active: Version,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let _ = tokio::task::spawn_blocking(move || clean(&base, active)).await;
        if let Some(sender) = sender.upgrade() {
            let _ = sender.send(Task::CleanerDone { generation }).await;
        }
    })
}

fn clean(base: &Path, active: Version) {
    let Ok(entries) = fs::read_dir(base) else {
        return;
    };
    for entry in entries.flatten() {
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        let Some(version) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<Version>().ok())
        else {
            continue;
        };
        if version == active {
            continue;
        }
        match fs::remove_dir_all(entry.path()) {
            Ok(()) => tracing::debug!(version, "removed stale version directory"),
            Err(error) => {
                tracing::debug!(version, %error, "failed to remove stale version directory")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_clean_keeps_active_and_foreign_entries() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("0")).unwrap();
        fs::create_dir(dir.path().join("1")).unwrap();
        fs::create_dir(dir.path().join("2")).unwrap();
        fs::create_dir(dir.path().join("not-a-version")).unwrap();
        fs::write(dir.path().join("0/binlog"), b"x").unwrap();
        fs::write(dir.path().join("version"), b"1").unwrap();

        clean(dir.path(), 1);

        assert!(!dir.path().join("0").exists());
        assert!(dir.path().join("1").exists());
        assert!(!dir.path().join("2").exists());
        assert!(dir.path().join("not-a-version").exists());
        assert!(dir.path().join("version").exists());
    }
}
