//! Post-apply verification
//!
//! Re-reads every applied file and compares it with what the apply step
//! intended to write.
//!
//! # Checks
//!
//! 1. Written files: final length, then every written region byte for byte
//! 2. Deleted and moved-away files: the path no longer exists
//! 3. Move targets: length and hash match the source before the move

use rayon::prelude::*;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::hash;

use super::apply::{AppliedFile, Expectation, Region};

/// A file that did not verify
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyFailure {
    pub destination: String,
    pub reason: String,
}

/// Summary of verification results
#[derive(Debug, Default)]
pub struct VerificationSummary {
    /// Total files verified
    pub total: usize,
    /// Files that passed verification
    pub passed: usize,
    pub failures: Vec<VerifyFailure>,
}

impl VerificationSummary {
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Verify applied files in parallel
pub fn verify_applied(files: &[AppliedFile]) -> VerificationSummary {
    let passed = AtomicUsize::new(0);
    let failures: Mutex<Vec<VerifyFailure>> = Mutex::new(Vec::new());

    files.par_iter().for_each(|file| match check(&file.path, &file.expectation) {
        Ok(()) => {
            passed.fetch_add(1, Ordering::Relaxed);
        }
        Err(reason) => {
            warn!("Verification failed for {}: {}", file.destination, reason);
            if let Ok(mut failures) = failures.lock() {
                failures.push(VerifyFailure {
                    destination: file.destination.clone(),
                    reason,
                });
            }
        }
    });

    let mut failures = failures.into_inner().unwrap_or_default();
    failures.sort_by(|a, b| a.destination.cmp(&b.destination));

    let summary = VerificationSummary {
        total: files.len(),
        passed: passed.load(Ordering::Relaxed),
        failures,
    };
    debug!(
        "Verification: {} of {} files passed",
        summary.passed, summary.total
    );
    summary
}

fn check(path: &Path, expectation: &Expectation) -> Result<(), String> {
    match expectation {
        Expectation::Absent => {
            if path.exists() {
                Err("file still exists".into())
            } else {
                Ok(())
            }
        }
        Expectation::Hash { len, hash: expected } => {
            check_len(path, *len)?;
            let actual = hash::compute_file_hash(path).map_err(|e| e.to_string())?;
            if &actual == expected {
                Ok(())
            } else {
                Err(format!("hash {} does not match {}", actual, expected))
            }
        }
        Expectation::Content { len, regions } => {
            check_len(path, *len)?;
            check_regions(path, regions)
        }
    }
}

fn check_len(path: &Path, expected: u64) -> Result<(), String> {
    let actual = fs::metadata(path).map_err(|e| e.to_string())?.len();
    if actual == expected {
        Ok(())
    } else {
        Err(format!("length {} (expected {})", actual, expected))
    }
}

fn check_regions(path: &Path, regions: &[Region]) -> Result<(), String> {
    let mut file = File::open(path).map_err(|e| e.to_string())?;
    let mut buf = Vec::new();

    for region in regions {
        buf.resize(region.expected.len(), 0);
        file.seek(SeekFrom::Start(region.offset))
            .and_then(|_| file.read_exact(&mut buf))
            .map_err(|e| format!("cannot read {} bytes at {}: {}", buf.len(), region.offset, e))?;
        if buf != region.expected {
            return Err(format!(
                "{} bytes at offset {} differ from what was written",
                region.expected.len(),
                region.offset
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::ledger::ChangeKinds;
    use tempfile::tempdir;

    fn applied(dir: &Path, name: &str, expectation: Expectation) -> AppliedFile {
        AppliedFile {
            key: name.into(),
            destination: name.into(),
            path: dir.join(name),
            expectation,
            kinds: ChangeKinds::EDITED,
            mods: Vec::new(),
        }
    }

    #[test]
    fn test_verify_content_regions() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("ok.bin"), b"01AA23").unwrap();
        fs::write(dir.path().join("bad.bin"), b"01XX23").unwrap();
        fs::write(dir.path().join("short.bin"), b"01AA").unwrap();

        let expect = || Expectation::Content {
            len: 6,
            regions: vec![Region { offset: 2, expected: b"AA".to_vec() }],
        };
        let files = vec![
            applied(dir.path(), "ok.bin", expect()),
            applied(dir.path(), "bad.bin", expect()),
            applied(dir.path(), "short.bin", expect()),
        ];

        let summary = verify_applied(&files);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 1);
        assert!(!summary.all_passed());
        assert_eq!(summary.failures[0].destination, "bad.bin");
        assert!(summary.failures[0].reason.contains("offset 2"));
        assert!(summary.failures[1].reason.contains("length 4"));
    }

    #[test]
    fn test_verify_absent_and_hash() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("moved.txt"), b"payload").unwrap();

        let files = vec![
            applied(dir.path(), "gone.txt", Expectation::Absent),
            applied(
                dir.path(),
                "moved.txt",
                Expectation::Hash {
                    len: 7,
                    hash: hash::hash_bytes(b"payload"),
                },
            ),
        ];
        assert!(verify_applied(&files).all_passed());

        let still_there = vec![applied(dir.path(), "moved.txt", Expectation::Absent)];
        assert_eq!(verify_applied(&still_there).failures.len(), 1);
    }
}
