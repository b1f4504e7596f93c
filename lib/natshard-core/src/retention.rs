//! Retention sweeper (§4.5 / §9 resolved open question): deletes shards
//! older than `LOG_RETENTION_DAYS`. Runs from the Processor's own tick loop,
//! at most once per day.

use crate::error::{RetentionSnafu, ShardError};
use chrono::NaiveDate;
use snafu::ResultExt;
use std::path::Path;

/// Lists shard filenames under `cold_dir`, parses each as a date, and
/// removes any shard older than `today - retention_days`. A single file's
/// delete failure is logged and does not abort the sweep; `Ok` lists
/// whatever did get removed.
pub fn sweep(cold_dir: &Path, today: NaiveDate, retention_days: u32) -> Vec<(NaiveDate, Result<(), ShardError>)> {
    let mut results = Vec::new();
    if retention_days == 0 {
        return results;
    }
    let cutoff = today - chrono::Duration::days(retention_days as i64);

    let Ok(entries) = std::fs::read_dir(cold_dir) else {
        return results;
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(stem) = name.to_str().and_then(|s| s.strip_suffix(".db")) else {
            continue;
        };
        let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") else {
            continue;
        };
        if date < cutoff {
            let path = entry.path();
            let outcome = std::fs::remove_file(&path).context(RetentionSnafu { path });
            if let Err(e) = &outcome {
                tracing::warn!(date = %date, error = %e, "retention sweep failed to remove shard, will retry next sweep");
            } else {
                tracing::info!(date = %date, "retention sweep removed expired shard");
            }
            results.push((date, outcome));
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn removes_shards_older_than_cutoff_only() {
        let dir = tempfile::tempdir().unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 7, 31).unwrap();

        let old = today - chrono::Duration::days(10);
        let recent = today - chrono::Duration::days(1);
        File::create(dir.path().join(format!("{}.db", old.format("%Y-%m-%d")))).unwrap();
        File::create(dir.path().join(format!("{}.db", recent.format("%Y-%m-%d")))).unwrap();

        sweep(dir.path(), today, 5);

        assert!(!dir.path().join(format!("{}.db", old.format("%Y-%m-%d"))).exists());
        assert!(dir.path().join(format!("{}.db", recent.format("%Y-%m-%d"))).exists());
    }

    #[test]
    fn disabled_when_retention_days_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 7, 31).unwrap();
        let ancient = today - chrono::Duration::days(9000);
        let path = dir.path().join(format!("{}.db", ancient.format("%Y-%m-%d")));
        File::create(&path).unwrap();

        sweep(dir.path(), today, 0);
        assert!(path.exists());
    }
}
