//! Backup and rollback
//!
//! Each session owns `backup_folder/<session id>/`. Before the first write to
//! a destination its original bytes are copied there as `<key>.bak` (or its
//! absence is recorded) and `manifest.json` is rewritten, so a session that
//! dies half way can still be restored with [`restore_session`].

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::hash;
use crate::paths;

use super::config::{ProgressCallback, ProgressEvent};

pub const BACKUP_MANIFEST_NAME: &str = "manifest.json";

/// Attempts per file during rollback
pub const RESTORE_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("I/O error on {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("Invalid backup manifest {}: {source}", path.display())]
    Manifest {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to hash {}: {message}", path.display())]
    Hash { path: PathBuf, message: String },

    #[error("Snapshot does not match its recorded hash, {} left as is", path.display())]
    HashMismatch { path: PathBuf },

    #[error("Backup lock poisoned")]
    Poisoned,
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> BackupError + '_ {
    move |source| BackupError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Snapshot of one destination taken before its first write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub sequence: u64,
    pub destination: String,
    /// Absolute path of the destination
    pub path: PathBuf,
    pub existed: bool,
    /// Snapshot file name inside the session directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_file: Option<String>,
    /// xxHash64 of the snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Parent directories the session may create for a new file, deepest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub created_dirs: Vec<PathBuf>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupManifest {
    session_id: Uuid,
    target: PathBuf,
    created_at: DateTime<Utc>,
    entries: Vec<BackupEntry>,
}

/// A file rollback could not put back
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreFailure {
    pub destination: String,
    pub error: String,
}

/// Outcome of a rollback
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackReport {
    pub restored: usize,
    pub removed: usize,
    pub failures: Vec<RestoreFailure>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Owns the backups of one session until commit or rollback
pub struct BackupManager {
    session_id: Uuid,
    session_dir: PathBuf,
    target: PathBuf,
    created_at: DateTime<Utc>,
    sequence: AtomicU64,
    /// One slot per destination key; a slot is locked while its snapshot is taken
    slots: Mutex<HashMap<String, Arc<Mutex<Option<BackupEntry>>>>>,
    /// Finished entries, in sequence order; guards manifest rewrites
    recorded: Mutex<Vec<BackupEntry>>,
}

impl BackupManager {
    /// Create the session directory and an empty manifest
    pub fn create(backup_root: &Path, session_id: Uuid, target: &Path) -> Result<Self, BackupError> {
        let session_dir = backup_root.join(session_id.to_string());
        fs::create_dir_all(&session_dir).map_err(io_err(&session_dir))?;

        let manager = Self {
            session_id,
            session_dir,
            target: target.to_path_buf(),
            created_at: Utc::now(),
            sequence: AtomicU64::new(0),
            slots: Mutex::new(HashMap::new()),
            recorded: Mutex::new(Vec::new()),
        };
        manager.save_manifest(&[])?;
        debug!("Backup session at {}", manager.session_dir.display());
        Ok(manager)
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Snapshot `path` unless this session already did. Returns the entry.
    ///
    /// Snapshots of different destinations run concurrently; only the
    /// manifest rewrite is serialized.
    pub fn snapshot(&self, destination: &str, path: &Path) -> Result<BackupEntry, BackupError> {
        let key = hash::destination_key(destination);
        let slot = {
            let mut slots = self.slots.lock().map_err(|_| BackupError::Poisoned)?;
            Arc::clone(slots.entry(key.clone()).or_default())
        };
        let mut taken = slot.lock().map_err(|_| BackupError::Poisoned)?;
        if let Some(existing) = taken.as_ref() {
            return Ok(existing.clone());
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let entry = self.capture(&key, sequence, destination, path)?;

        {
            let mut recorded = self.recorded.lock().map_err(|_| BackupError::Poisoned)?;
            recorded.push(entry.clone());
            recorded.sort_by_key(|e| e.sequence);
            self.save_manifest(&recorded)?;
        }

        *taken = Some(entry.clone());
        Ok(entry)
    }

    fn capture(&self, key: &str, sequence: u64, destination: &str, path: &Path) -> Result<BackupEntry, BackupError> {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => {
                let file_name = format!("{}.bak", key);
                let backup_path = self.session_dir.join(&file_name);
                reflink_copy::reflink_or_copy(path, &backup_path).map_err(io_err(path))?;
                let digest = hash::compute_file_hash(&backup_path).map_err(|e| BackupError::Hash {
                    path: backup_path.clone(),
                    message: e.to_string(),
                })?;
                Ok(BackupEntry {
                    sequence,
                    destination: destination.to_string(),
                    path: path.to_path_buf(),
                    existed: true,
                    backup_file: Some(file_name),
                    hash: Some(digest),
                    created_dirs: Vec::new(),
                    created_at: Utc::now(),
                })
            }
            Ok(_) => Err(BackupError::Io {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            }),
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory) => Ok(BackupEntry {
                sequence,
                destination: destination.to_string(),
                path: path.to_path_buf(),
                existed: false,
                backup_file: None,
                hash: None,
                created_dirs: missing_ancestors(&self.target, path),
                created_at: Utc::now(),
            }),
            Err(e) => Err(io_err(path)(e)),
        }
    }

    /// Entries in backup order
    pub fn entries(&self) -> Vec<BackupEntry> {
        match self.recorded.lock() {
            Ok(recorded) => recorded.clone(),
            Err(_) => Vec::new(),
        }
    }

    /// Restore every snapshot of this session. The backup directory is kept
    /// when anything failed so the session can be restored by hand.
    pub fn rollback(&self, progress: Option<&ProgressCallback>) -> RollbackReport {
        let report = restore_entries(&self.session_dir, self.entries(), progress);
        if report.is_clean() {
            if let Err(e) = fs::remove_dir_all(&self.session_dir) {
                warn!("Failed to remove backup dir {}: {}", self.session_dir.display(), e);
            }
        } else {
            warn!(
                "Rollback incomplete, backups kept at {}",
                self.session_dir.display()
            );
        }
        report
    }

    /// Discard the session's backups
    pub fn commit(self) -> Result<(), BackupError> {
        fs::remove_dir_all(&self.session_dir).map_err(io_err(&self.session_dir))?;
        debug!("Backup session {} committed", self.session_id);
        Ok(())
    }

    fn save_manifest(&self, entries: &[BackupEntry]) -> Result<(), BackupError> {
        let manifest = BackupManifest {
            session_id: self.session_id,
            target: self.target.clone(),
            created_at: self.created_at,
            entries: entries.to_vec(),
        };
        let path = self.session_dir.join(BACKUP_MANIFEST_NAME);
        let json = serde_json::to_string_pretty(&manifest).map_err(|source| BackupError::Manifest {
            path: path.clone(),
            source,
        })?;

        let tmp = self.session_dir.join(format!("{}.tmp", BACKUP_MANIFEST_NAME));
        fs::write(&tmp, json).map_err(io_err(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_err(&path))?;
        Ok(())
    }
}

/// Replay a backup session directory left behind on disk
pub fn restore_session(session_dir: &Path, progress: Option<&ProgressCallback>) -> Result<RollbackReport, BackupError> {
    let path = session_dir.join(BACKUP_MANIFEST_NAME);
    let content = fs::read_to_string(&path).map_err(io_err(&path))?;
    let manifest: BackupManifest =
        serde_json::from_str(&content).map_err(|source| BackupError::Manifest {
            path: path.clone(),
            source,
        })?;

    info!(
        "Restoring session {} ({} entries) into {}",
        manifest.session_id,
        manifest.entries.len(),
        manifest.target.display()
    );

    let report = restore_entries(session_dir, manifest.entries, progress);
    if report.is_clean() {
        fs::remove_dir_all(session_dir).map_err(io_err(session_dir))?;
    }
    Ok(report)
}

/// Put pre-existing files back in reverse backup order, then remove files
/// that did not exist before the session.
fn restore_entries(session_dir: &Path, mut entries: Vec<BackupEntry>, progress: Option<&ProgressCallback>) -> RollbackReport {
    entries.sort_by_key(|e| std::cmp::Reverse(e.sequence));
    let mut report = RollbackReport::default();

    for entry in entries.iter().filter(|e| e.existed) {
        match with_retries(|| restore_one(session_dir, entry)) {
            Ok(()) => {
                report.restored += 1;
                if let Some(cb) = progress {
                    cb(ProgressEvent::FileRestored {
                        destination: entry.path.clone(),
                    });
                }
            }
            Err(e) => {
                warn!("Failed to restore {}: {}", entry.destination, e);
                report.failures.push(RestoreFailure {
                    destination: entry.destination.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    for entry in entries.iter().filter(|e| !e.existed) {
        match with_retries(|| remove_created(entry)) {
            Ok(removed) => {
                if removed {
                    report.removed += 1;
                }
            }
            Err(e) => {
                warn!("Failed to remove {}: {}", entry.destination, e);
                report.failures.push(RestoreFailure {
                    destination: entry.destination.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    // Only empty directories go; deepest first across all new files
    let mut dirs: Vec<&PathBuf> = entries.iter().flat_map(|e| e.created_dirs.iter()).collect();
    dirs.sort_by(|a, b| {
        b.components()
            .count()
            .cmp(&a.components().count())
            .then_with(|| a.cmp(b))
    });
    dirs.dedup();
    for dir in dirs {
        let _ = fs::remove_dir(dir);
    }

    info!(
        "Rollback: {} restored, {} removed, {} failed",
        report.restored,
        report.removed,
        report.failures.len()
    );
    report
}

fn with_retries<T>(mut op: impl FnMut() -> Result<T, BackupError>) -> Result<T, BackupError> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= RESTORE_ATTEMPTS => return Err(e),
            Err(e) => {
                debug!("Restore attempt {} failed: {}", attempt, e);
                std::thread::sleep(Duration::from_millis(25 * attempt as u64));
                attempt += 1;
            }
        }
    }
}

fn restore_one(session_dir: &Path, entry: &BackupEntry) -> Result<(), BackupError> {
    let file_name = entry.backup_file.as_deref().ok_or_else(|| BackupError::Io {
        path: entry.path.clone(),
        source: io::Error::new(io::ErrorKind::NotFound, "backup entry has no snapshot file"),
    })?;
    let backup_path = session_dir.join(file_name);

    paths::ensure_parent_dirs(&entry.path).map_err(io_err(&entry.path))?;

    // Copy beside the destination and check it before it replaces anything
    let staging = sibling_path(&entry.path, "modsplice-restore");
    fs::copy(&backup_path, &staging).map_err(io_err(&backup_path))?;

    if let Some(expected) = &entry.hash {
        let failure = match hash::verify_file_hash(&staging, expected) {
            Ok(true) => None,
            Ok(false) => Some(BackupError::HashMismatch {
                path: entry.path.clone(),
            }),
            Err(e) => Some(BackupError::Hash {
                path: staging.clone(),
                message: e.to_string(),
            }),
        };
        if let Some(err) = failure {
            let _ = fs::remove_file(&staging);
            return Err(err);
        }
    }

    if let Err(e) = fs::rename(&staging, &entry.path) {
        let _ = fs::remove_file(&staging);
        return Err(io_err(&entry.path)(e));
    }

    Ok(())
}

fn remove_created(entry: &BackupEntry) -> Result<bool, BackupError> {
    match fs::remove_file(&entry.path) {
        Ok(()) => Ok(true),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory) => Ok(false),
        Err(e) => Err(io_err(&entry.path)(e)),
    }
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}", name, suffix))
}

/// Ancestors of `path` under `root` that do not exist yet, deepest first
fn missing_ancestors(root: &Path, path: &Path) -> Vec<PathBuf> {
    path.ancestors()
        .skip(1)
        .take_while(|dir| dir.starts_with(root) && *dir != root)
        .filter(|dir| !dir.exists())
        .map(Path::to_path_buf)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;
    use tempfile::tempdir;

    fn manager(backups: &Path, target: &Path) -> BackupManager {
        BackupManager::create(backups, Uuid::new_v4(), target).unwrap()
    }

    #[test]
    fn test_snapshot_once_per_destination() {
        let target = tempdir().unwrap();
        let backups = tempdir().unwrap();
        let file = target.path().join("a.bin");
        fs::write(&file, b"original").unwrap();

        let mgr = manager(backups.path(), target.path());
        let first = mgr.snapshot("a.bin", &file).unwrap();
        fs::write(&file, b"changed").unwrap();
        let second = mgr.snapshot("A.BIN", &file).unwrap();

        assert_eq!(first, second);
        assert!(first.existed);
        assert_eq!(first.hash.as_deref(), Some(hash::hash_bytes(b"original").as_str()));
        assert!(mgr.session_dir().join(BACKUP_MANIFEST_NAME).is_file());
    }

    #[test]
    fn test_rollback_restores_and_removes() {
        let target = tempdir().unwrap();
        let backups = tempdir().unwrap();
        let existing = target.path().join("a.bin");
        let created = target.path().join("new").join("deep").join("b.bin");
        fs::write(&existing, b"original").unwrap();

        let mgr = manager(backups.path(), target.path());
        mgr.snapshot("a.bin", &existing).unwrap();
        let entry = mgr.snapshot("new/deep/b.bin", &created).unwrap();
        assert_eq!(entry.created_dirs.len(), 2);

        fs::write(&existing, b"modified by mod").unwrap();
        paths::ensure_parent_dirs(&created).unwrap();
        fs::write(&created, b"added").unwrap();

        let restored = Arc::new(Mutex::new(Vec::new()));
        let sink = restored.clone();
        let progress: ProgressCallback = Arc::new(move |event| {
            if let ProgressEvent::FileRestored { destination } = event {
                sink.lock().unwrap().push(destination);
            }
        });

        let session_dir = mgr.session_dir().to_path_buf();
        let report = mgr.rollback(Some(&progress));
        assert!(report.is_clean());
        assert_eq!(report.restored, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(fs::read(&existing).unwrap(), b"original");
        assert!(!created.exists());
        assert!(!target.path().join("new").exists());
        assert!(!session_dir.exists());
        assert_eq!(restored.lock().unwrap().as_slice(), &[existing]);
    }

    #[test]
    fn test_rollback_restores_deleted_file() {
        let target = tempdir().unwrap();
        let backups = tempdir().unwrap();
        let file = target.path().join("gone.txt");
        fs::write(&file, b"keep me").unwrap();

        let mgr = manager(backups.path(), target.path());
        mgr.snapshot("gone.txt", &file).unwrap();
        fs::remove_file(&file).unwrap();

        assert!(mgr.rollback(None).is_clean());
        assert_eq!(fs::read(&file).unwrap(), b"keep me");
    }

    #[test]
    fn test_corrupt_snapshot_is_reported() {
        let target = tempdir().unwrap();
        let backups = tempdir().unwrap();
        let file = target.path().join("a.bin");
        fs::write(&file, b"original").unwrap();

        let mgr = manager(backups.path(), target.path());
        let entry = mgr.snapshot("a.bin", &file).unwrap();
        let snapshot = mgr.session_dir().join(entry.backup_file.unwrap());
        fs::write(&snapshot, b"bitrot").unwrap();

        let session_dir = mgr.session_dir().to_path_buf();
        let report = mgr.rollback(None);
        assert!(!report.is_clean());
        assert_eq!(report.failures[0].destination, "a.bin");
        assert!(report.failures[0].error.contains("does not match"));
        assert_eq!(fs::read(&file).unwrap(), b"original");
        assert!(!target.path().join(".a.bin.modsplice-restore").exists());
        // Kept for manual recovery
        assert!(session_dir.join(BACKUP_MANIFEST_NAME).is_file());
    }

    #[test]
    fn test_restore_session_from_disk() {
        let target = tempdir().unwrap();
        let backups = tempdir().unwrap();
        let file = target.path().join("a.bin");
        fs::write(&file, b"original").unwrap();

        let session_dir = {
            let mgr = manager(backups.path(), target.path());
            mgr.snapshot("a.bin", &file).unwrap();
            mgr.session_dir().to_path_buf()
        };
        fs::write(&file, b"half written").unwrap();

        let report = restore_session(&session_dir, None).unwrap();
        assert!(report.is_clean());
        assert_eq!(fs::read(&file).unwrap(), b"original");
        assert!(!session_dir.exists());
    }

    #[test]
    fn test_restore_order_is_reverse_sequence() {
        let target = tempdir().unwrap();
        let backups = tempdir().unwrap();
        let mgr = manager(backups.path(), target.path());

        for name in ["one", "two", "three"] {
            let path = target.path().join(name);
            fs::write(&path, name).unwrap();
            mgr.snapshot(name, &path).unwrap();
        }

        let seqs: Vec<u64> = mgr.entries().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);

        let order = Arc::new(Mutex::new(Vec::new()));
        let sink = order.clone();
        let progress: ProgressCallback = Arc::new(move |event| {
            if let ProgressEvent::FileRestored { destination } = event {
                sink.lock().unwrap().push(destination.file_name().unwrap().to_string_lossy().into_owned());
            }
        });
        assert!(mgr.rollback(Some(&progress)).is_clean());
        assert_eq!(*order.lock().unwrap(), vec!["three", "two", "one"]);
    }

    #[test]
    fn test_parallel_snapshots_are_all_recorded() {
        let target = tempdir().unwrap();
        let backups = tempdir().unwrap();
        let names: Vec<String> = (0..32).map(|i| format!("file{}.bin", i)).collect();
        for name in &names {
            fs::write(target.path().join(name), name.as_bytes()).unwrap();
        }

        let mgr = manager(backups.path(), target.path());
        names
            .par_iter()
            .for_each(|name| {
                let path = target.path().join(name);
                mgr.snapshot(name, &path).unwrap();
                mgr.snapshot(name, &path).unwrap();
            });

        let entries = mgr.entries();
        assert_eq!(entries.len(), names.len());
        let seqs: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, (0..names.len() as u64).collect::<Vec<_>>());

        let manifest: BackupManifest = serde_json::from_str(
            &fs::read_to_string(mgr.session_dir().join(BACKUP_MANIFEST_NAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest.entries, entries);
    }

    #[test]
    fn test_commit_removes_session_dir() {
        let target = tempdir().unwrap();
        let backups = tempdir().unwrap();
        let mgr = manager(backups.path(), target.path());
        let dir = mgr.session_dir().to_path_buf();
        mgr.commit().unwrap();
        assert!(!dir.exists());
    }
}
