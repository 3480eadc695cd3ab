use crate::errors::ReplayError;
use std::fs;
use std::path::{Path, PathBuf};

/// Delete the oldest files in `dir` until the directory fits in `budget_bytes`.
///
/// Used for the run-log directory and for diagnostic screenshots, which pile
/// up quickly during long synthesis sessions.
pub fn enforce_total_budget(dir: &Path, budget_bytes: u64) -> Result<Vec<PathBuf>, ReplayError> {
    let mut files = fs::read_dir(dir)
        .map_err(|e| ReplayError::Io(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect::<Vec<_>>();

    files.sort_by_key(|path| fs::metadata(path).ok().and_then(|m| m.modified().ok()));

    let mut total = files
        .iter()
        .filter_map(|path| fs::metadata(path).ok().map(|meta| meta.len()))
        .sum::<u64>();

    let mut deleted = Vec::new();
    for path in files {
        if total <= budget_bytes {
            break;
        }
        let len = fs::metadata(&path)
            .map_err(|e| ReplayError::Io(e.to_string()))?
            .len();
        fs::remove_file(&path).map_err(|e| ReplayError::Io(e.to_string()))?;
        total = total.saturating_sub(len);
        deleted.push(path);
    }

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::enforce_total_budget;
    use std::fs;

    #[test]
    fn prunes_oldest_snapshots_until_budget_is_met() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("first-timeout.png"), vec![0u8; 40]).expect("first");
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(dir.path().join("second-timeout.png"), vec![0u8; 40]).expect("second");

        let deleted = enforce_total_budget(dir.path(), 50).expect("pruned");
        assert_eq!(deleted.len(), 1);
        assert!(deleted[0].ends_with("first-timeout.png"));
    }

    #[test]
    fn leaves_directory_alone_when_under_budget() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("run.jsonl"), vec![0u8; 10]).expect("log");
        let deleted = enforce_total_budget(dir.path(), 1024).expect("checked");
        assert!(deleted.is_empty());
    }
}
