//! Offset/fingerprint persistence for the hot-buffer tail loop (§4.2.1,
//! §9 "Ad-hoc progress tracking via a file-tail helper" re-architected as an
//! explicit `(offset, fingerprint)` pair). Grounded on the teacher's
//! `file-source` checkpointer: a small JSON-friendly record written via a
//! temp-file-then-rename for atomicity, keyed here on device/inode rather
//! than a glob of many files since this pipeline tails exactly one.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Identifies one incarnation of the hot buffer file, so truncation/rotation
/// (new inode, or a shrunk file) can be told apart from ordinary growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferFingerprint {
    pub dev: u64,
    pub ino: u64,
}

impl BufferFingerprint {
    pub fn of_file(file: &fs::File) -> io::Result<Self> {
        let meta = file.metadata()?;
        Ok(BufferFingerprint {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
struct OffsetRecord {
    offset: u64,
    fingerprint: Option<BufferFingerprint>,
}

/// Tracks the durably-committed byte offset into the hot buffer, persisted
/// only after the corresponding batch has been committed to the shard
/// (§4.2.1's commit order: insert, commit, *then* write offset).
pub struct OffsetTracker {
    path: PathBuf,
    tmp_path: PathBuf,
    record: OffsetRecord,
}

impl OffsetTracker {
    /// Loads the persisted offset, or starts fresh at 0 if no offset file
    /// exists yet (first run).
    pub fn load(path: &Path) -> io::Result<Self> {
        let record = match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => OffsetRecord::default(),
            Err(e) => return Err(e),
        };
        Ok(OffsetTracker {
            path: path.to_path_buf(),
            tmp_path: path.with_extension("offset.tmp"),
            record,
        })
    }

    pub fn offset(&self) -> u64 {
        self.record.offset
    }

    /// Compares the buffer's current fingerprint/size against the stored
    /// one and resets to 0 on truncation or rotation (§3, §4.2.1).
    pub fn reconcile(&mut self, buffer_len: u64, fingerprint: BufferFingerprint) {
        let rotated = match self.record.fingerprint {
            Some(prev) => prev != fingerprint,
            None => false,
        };
        let truncated = buffer_len < self.record.offset;
        if rotated || truncated {
            tracing::info!(
                rotated,
                truncated,
                old_offset = self.record.offset,
                buffer_len,
                "hot buffer rotation detected, resetting offset to 0"
            );
            self.record.offset = 0;
        }
        self.record.fingerprint = Some(fingerprint);
    }

    /// Persists a new offset. Must only be called after the batch that
    /// produced it has been durably committed to the shard.
    pub fn commit(&mut self, new_offset: u64) -> io::Result<()> {
        debug_assert!(
            new_offset >= self.record.offset || new_offset == 0,
            "offset must advance monotonically except on rotation"
        );
        self.record.offset = new_offset;
        let serialized = serde_json::to_string(&self.record)?;
        fs::write(&self.tmp_path, serialized)?;
        fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    #[test]
    fn starts_at_zero_with_no_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = OffsetTracker::load(&dir.path().join(".processor.offset")).unwrap();
        assert_eq!(tracker.offset(), 0);
    }

    #[test]
    fn commit_persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".processor.offset");
        let mut tracker = OffsetTracker::load(&path).unwrap();
        tracker.commit(128).unwrap();

        let reloaded = OffsetTracker::load(&path).unwrap();
        assert_eq!(reloaded.offset(), 128);
    }

    #[test]
    fn reconcile_resets_on_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".processor.offset");
        let mut tracker = OffsetTracker::load(&path).unwrap();
        tracker.commit(500).unwrap();

        let fp = BufferFingerprint { dev: 1, ino: 1 };
        tracker.reconcile(100, fp);
        assert_eq!(tracker.offset(), 0);
    }

    #[test]
    fn reconcile_resets_on_fingerprint_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".processor.offset");
        let mut tracker = OffsetTracker::load(&path).unwrap();
        let fp_a = BufferFingerprint { dev: 1, ino: 1 };
        tracker.reconcile(1000, fp_a);
        tracker.commit(500).unwrap();

        let fp_b = BufferFingerprint { dev: 1, ino: 2 };
        tracker.reconcile(2000, fp_b);
        assert_eq!(tracker.offset(), 0);
    }

    #[test]
    fn reconcile_keeps_offset_on_ordinary_growth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".processor.offset");
        let mut tracker = OffsetTracker::load(&path).unwrap();
        let fp = BufferFingerprint { dev: 1, ino: 1 };
        tracker.reconcile(1000, fp);
        tracker.commit(500).unwrap();

        tracker.reconcile(2000, fp);
        assert_eq!(tracker.offset(), 500);
    }

    #[test]
    fn fingerprint_differs_across_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let path_a = dir.path().join("a");
        let path_b = dir.path().join("b");
        File::create(&path_a).unwrap().write_all(b"a").unwrap();
        File::create(&path_b).unwrap().write_all(b"b").unwrap();
        let fa = BufferFingerprint::of_file(&File::open(&path_a).unwrap()).unwrap();
        let fb = BufferFingerprint::of_file(&File::open(&path_b).unwrap()).unwrap();
        assert_ne!(fa, fb);
    }
}
