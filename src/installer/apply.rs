//! Applying planned operations to the target
//!
//! One call to [`apply_unit`] handles one independent unit of the plan (a
//! single destination, or both ends of a move). The unit's snapshots are
//! taken before anything in it is touched.

use std::fs;
use std::io::{self, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::hash;
use crate::manifest::ModId;
use crate::paths;

use super::backup::{BackupError, BackupManager};
use super::config::Precedence;
use super::ledger::ChangeKinds;
use super::planner::{OpKind, PlannedFile, PlannedOp, WritePlan};

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("I/O error on {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("{} changed since planning (expected {expected} bytes, found {actual})", path.display())]
    Changed {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("Rendered {} to {actual} bytes, planned {expected}", path.display())]
    Layout {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("Plan has no entry for '{0}'")]
    MissingEntry(String),

    #[error("Failed to hash {}: {message}", path.display())]
    Hash { path: PathBuf, message: String },

    #[error(transparent)]
    Backup(#[from] BackupError),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ApplyError + '_ {
    move |source| ApplyError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Bytes expected at a final offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub offset: u64,
    pub expected: Vec<u8>,
}

/// What verification should find on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    Content { len: u64, regions: Vec<Region> },
    Absent,
    /// Moved file: same bytes as the source had
    Hash { len: u64, hash: String },
}

/// A destination after its unit was applied
#[derive(Debug, Clone)]
pub struct AppliedFile {
    pub key: String,
    pub destination: String,
    pub path: PathBuf,
    pub expectation: Expectation,
    pub kinds: ChangeKinds,
    pub mods: Vec<ModId>,
}

/// Final bytes of a file and the regions written into it
#[derive(Debug)]
pub struct Rendered {
    pub bytes: Vec<u8>,
    pub regions: Vec<Region>,
}

/// Lay out `ops` over `original`.
///
/// Replaces go first, in ascending precedence rank then planning order, so
/// the preferred mod's bytes survive an overlap. Inserts are spliced in
/// afterwards by start offset.
pub fn render(original: &[u8], ops: &[PlannedOp], precedence: Precedence) -> Rendered {
    let mut base = original.to_vec();

    let mut replaces: Vec<&PlannedOp> = ops.iter().filter(|op| op.kind == OpKind::Replace).collect();
    replaces.sort_by_key(|op| (precedence.apply_rank(op.install_index), op.sequence));
    for op in &replaces {
        let Range { start, end } = op.range();
        let (start, end) = (start as usize, end as usize);
        if base.len() < end {
            base.resize(end, 0);
        }
        let payload_end = start + op.payload.len();
        base[start..payload_end].copy_from_slice(&op.payload);
        base[payload_end..end].fill(0);
    }

    let mut inserts: Vec<&PlannedOp> = ops.iter().filter(|op| op.kind == OpKind::Insert).collect();
    inserts.sort_by_key(|op| (op.write.local_start_offset, op.sequence));

    let inserted: u64 = inserts.iter().map(|op| op.payload.len() as u64).sum();
    let mut bytes = Vec::with_capacity(base.len() + inserted as usize);
    let mut regions = Vec::new();
    let mut cursor = 0usize;
    // (base offset, length) of every insert, in splice order
    let mut splices: Vec<(u64, u64)> = Vec::with_capacity(inserts.len());

    for op in &inserts {
        // Appends planned past a replace that collision resolution dropped
        let at = (op.write.local_start_offset as usize).min(base.len());
        bytes.extend_from_slice(&base[cursor..at]);
        cursor = at;
        regions.push(Region {
            offset: bytes.len() as u64,
            expected: op.payload.to_vec(),
        });
        bytes.extend_from_slice(&op.payload);
        splices.push((at as u64, op.payload.len() as u64));
    }
    bytes.extend_from_slice(&base[cursor..]);

    for op in &replaces {
        for (offset, range) in map_base_range(&splices, op.range()) {
            regions.push(Region {
                offset,
                expected: base[range.start as usize..range.end as usize].to_vec(),
            });
        }
    }
    regions.sort_by_key(|r| r.offset);

    Rendered { bytes, regions }
}

/// Split a range of the replace layer at insert points and map each piece
/// to its offset in the final file
fn map_base_range(splices: &[(u64, u64)], range: Range<u64>) -> Vec<(u64, Range<u64>)> {
    let shift = |p: u64| -> u64 {
        splices
            .iter()
            .filter(|(at, _)| *at <= p)
            .map(|(_, len)| len)
            .sum()
    };

    let mut cuts: Vec<u64> = splices
        .iter()
        .map(|(at, _)| *at)
        .filter(|at| *at > range.start && *at < range.end)
        .collect();
    cuts.dedup();

    let mut pieces = Vec::new();
    let mut start = range.start;
    for cut in cuts.into_iter().chain(std::iter::once(range.end)) {
        if cut > start {
            pieces.push((start + shift(start), start..cut));
        }
        start = cut;
    }
    pieces
}

/// Back up and apply one unit of the plan
pub fn apply_unit(
    unit: &[String],
    plan: &WritePlan,
    backups: &BackupManager,
    precedence: Precedence,
) -> Result<Vec<AppliedFile>, ApplyError> {
    let files = unit
        .iter()
        .map(|key| plan.files.get(key).ok_or_else(|| ApplyError::MissingEntry(key.clone())))
        .collect::<Result<Vec<&PlannedFile>, _>>()?;

    match files.as_slice() {
        [source, target] => apply_move(source, target, backups),
        [file] => apply_file(file, backups, precedence).map(|applied| applied.into_iter().collect()),
        _ => Ok(Vec::new()),
    }
}

fn applied(file: &PlannedFile, expectation: Expectation) -> AppliedFile {
    AppliedFile {
        key: file.key.clone(),
        destination: file.destination.clone(),
        path: file.absolute.clone(),
        expectation,
        kinds: file.change_kinds(),
        mods: file.owners(),
    }
}

fn apply_file(file: &PlannedFile, backups: &BackupManager, precedence: Precedence) -> Result<Option<AppliedFile>, ApplyError> {
    if file.ops.is_empty() {
        return Ok(None);
    }

    backups.snapshot(&file.destination, &file.absolute)?;

    if file.ops.iter().any(|op| op.kind == OpKind::Delete) {
        fs::remove_file(&file.absolute).map_err(io_err(&file.absolute))?;
        debug!("Deleted {}", file.absolute.display());
        return Ok(Some(applied(file, Expectation::Absent)));
    }

    let original = match file.original_len {
        Some(expected) => {
            let bytes = fs::read(&file.absolute).map_err(io_err(&file.absolute))?;
            if bytes.len() as u64 != expected {
                return Err(ApplyError::Changed {
                    path: file.absolute.clone(),
                    expected,
                    actual: bytes.len() as u64,
                });
            }
            bytes
        }
        None => Vec::new(),
    };

    let rendered = render(&original, &file.ops, precedence);
    let len = rendered.bytes.len() as u64;
    if len != file.planned_len() {
        return Err(ApplyError::Layout {
            path: file.absolute.clone(),
            expected: file.planned_len(),
            actual: len,
        });
    }

    write_replacing(&file.absolute, &rendered.bytes)?;
    debug!(
        "Wrote {} ({} -> {} bytes, {} ops)",
        file.absolute.display(),
        original.len(),
        len,
        file.ops.len()
    );

    Ok(Some(applied(
        file,
        Expectation::Content {
            len,
            regions: rendered.regions,
        },
    )))
}

fn apply_move(source: &PlannedFile, target: &PlannedFile, backups: &BackupManager) -> Result<Vec<AppliedFile>, ApplyError> {
    backups.snapshot(&source.destination, &source.absolute)?;
    backups.snapshot(&target.destination, &target.absolute)?;

    let len = fs::metadata(&source.absolute)
        .map_err(io_err(&source.absolute))?
        .len();
    let digest = hash::compute_file_hash(&source.absolute).map_err(|e| ApplyError::Hash {
        path: source.absolute.clone(),
        message: e.to_string(),
    })?;

    paths::ensure_parent_dirs(&target.absolute).map_err(io_err(&target.absolute))?;
    move_file(&source.absolute, &target.absolute)?;
    debug!(
        "Moved {} -> {}",
        source.absolute.display(),
        target.absolute.display()
    );

    Ok(vec![
        applied(source, Expectation::Absent),
        applied(target, Expectation::Hash { len, hash: digest }),
    ])
}

/// Rename, falling back to copy and remove only across filesystems
fn move_file(from: &Path, to: &Path) -> Result<(), ApplyError> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if needs_copy(&e) => {
            reflink_copy::reflink_or_copy(from, to).map_err(io_err(to))?;
            fs::remove_file(from).map_err(io_err(from))
        }
        Err(e) => Err(io_err(to)(e)),
    }
}

fn needs_copy(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::CrossesDevices
}

/// Write through a temp file in the destination directory, keeping the
/// permissions of the file being replaced
fn write_replacing(path: &Path, bytes: &[u8]) -> Result<(), ApplyError> {
    paths::ensure_parent_dirs(path).map_err(io_err(path))?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(io_err(parent))?;
    tmp.write_all(bytes).map_err(io_err(tmp.path()))?;
    tmp.as_file().sync_all().map_err(io_err(path))?;

    if let Ok(meta) = fs::metadata(path) {
        fs::set_permissions(tmp.path(), meta.permissions()).map_err(io_err(path))?;
    }

    tmp.persist(path).map_err(|e| ApplyError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}
