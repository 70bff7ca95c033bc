//! Write planner
//!
//! Resolves each mod's declarative [`WriteContent`] list into concrete
//! byte-range operations grouped by destination file. Nothing under the
//! target directory is modified here; destinations are only stat'ed.
//!
//! # Coordinates
//!
//! Every offset in a manifest is relative to the destination file as it
//! existed when the session started. Replaces overlay that coordinate space
//! in place (growing it when they run past end-of-file); inserts are
//! spliced in afterwards and shift everything after them. The running
//! length counter kept per file is what lets the final layout place each
//! write without re-reading the file between steps; an insert declared at
//! the running end of the file appends, so a mod can build a new file from
//! several sequential writes.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::manifest::{FileAction, ManifestError, ModId, ModPackage, WriteContent, WritePayload};
use crate::paths;

use super::ledger::ChangeKinds;

/// End of a whole-file claim (delete and move)
pub const WHOLE_FILE_END: u64 = u64::MAX;

/// Most zero bytes one replace may add past the end of its file
pub const MAX_ZERO_FILL: u64 = 64 * 1024 * 1024;

/// Planning errors. Any of them aborts the session before a byte is written.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("Invalid write in mod '{mod_id}' for '{destination}': {reason}")]
    InvalidWriteSpec {
        mod_id: ModId,
        destination: String,
        reason: String,
    },

    #[error("Duplicate mod id in session: {0}")]
    DuplicateMod(ModId),

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// A resolved write operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileWrite {
    pub local_start_offset: u64,
    pub local_end_offset: u64,
    pub bytes_written: u64,
    /// Net growth of the file caused by this write
    pub bytes_added: u64,
}

/// Kind of a planned operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    Replace,
    Delete,
    /// This path is renamed to `to` (normalized key)
    MoveOut { to: String },
    /// This path receives the file currently at `from` (normalized key)
    MoveIn { from: String },
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Replace => "replace",
            OpKind::Delete => "delete",
            OpKind::MoveOut { .. } => "move",
            OpKind::MoveIn { .. } => "move target",
        }
    }

    pub fn is_move(&self) -> bool {
        matches!(self, OpKind::MoveOut { .. } | OpKind::MoveIn { .. })
    }

    pub fn is_byte_write(&self) -> bool {
        matches!(self, OpKind::Insert | OpKind::Replace)
    }

    pub fn change_kinds(&self) -> ChangeKinds {
        match self {
            OpKind::Insert => ChangeKinds::EDITED,
            OpKind::Replace => ChangeKinds::REPLACED,
            OpKind::Delete => ChangeKinds::DELETED,
            OpKind::MoveOut { .. } => ChangeKinds::MOVED,
            OpKind::MoveIn { .. } => ChangeKinds::MOVED | ChangeKinds::ADDED,
        }
    }
}

/// One operation against one destination, tagged with its owner
#[derive(Debug, Clone)]
pub struct PlannedOp {
    pub mod_id: ModId,
    /// Position of the owning mod in install order
    pub install_index: usize,
    /// Planning order within the destination file
    pub sequence: usize,
    pub kind: OpKind,
    pub write: FileWrite,
    pub payload: Arc<[u8]>,
    /// Mods contributing this exact operation (grows on deduplication)
    pub attributed: Vec<ModId>,
}

impl PlannedOp {
    /// Byte range claimed in session-start coordinates (half-open)
    pub fn range(&self) -> Range<u64> {
        self.write.local_start_offset..self.write.local_end_offset
    }
}

/// Everything planned for one destination path
#[derive(Debug, Clone)]
pub struct PlannedFile {
    /// Destination as first declared
    pub destination: String,
    /// Normalized lookup key
    pub key: String,
    /// Resolved on-disk location
    pub absolute: PathBuf,
    /// Length at session start, None when the file did not exist
    pub original_len: Option<u64>,
    /// Flagged reserved by at least one mod
    pub reserved: bool,
    pub ops: Vec<PlannedOp>,
    /// Extent of the session-start coordinate space after replaces
    base_extent: u64,
    /// Bytes added by inserts
    inserted: u64,
}

impl PlannedFile {
    pub(crate) fn new(destination: &str, key: String, absolute: PathBuf, original_len: Option<u64>) -> Self {
        let base = original_len.unwrap_or(0);
        Self {
            destination: destination.to_string(),
            key,
            absolute,
            original_len,
            reserved: false,
            ops: Vec::new(),
            base_extent: base,
            inserted: 0,
        }
    }

    pub fn existed(&self) -> bool {
        self.original_len.is_some()
    }

    /// Length the file reaches once every planned write lands
    pub fn planned_len(&self) -> u64 {
        self.base_extent + self.inserted
    }

    /// Union of change kinds of the operations currently planned
    pub fn change_kinds(&self) -> ChangeKinds {
        let mut kinds = self
            .ops
            .iter()
            .fold(ChangeKinds::empty(), |acc, op| acc | op.kind.change_kinds());
        if !self.existed() && self.ops.iter().any(|op| op.kind.is_byte_write()) {
            kinds |= ChangeKinds::ADDED;
        }
        kinds
    }

    /// Mods owning at least one planned operation, in install order
    pub fn owners(&self) -> Vec<ModId> {
        let mut owners: Vec<(usize, ModId)> = Vec::new();
        for op in &self.ops {
            for id in &op.attributed {
                if !owners.iter().any(|(_, o)| o == id) {
                    owners.push((op.install_index, id.clone()));
                }
            }
        }
        owners.sort_by_key(|(index, _)| *index);
        owners.into_iter().map(|(_, id)| id).collect()
    }

    /// Key of the other end of a move, if this file takes part in one
    pub fn move_partner(&self) -> Option<&str> {
        self.ops.iter().find_map(|op| match &op.kind {
            OpKind::MoveOut { to } => Some(to.as_str()),
            OpKind::MoveIn { from } => Some(from.as_str()),
            _ => None,
        })
    }

    /// Drop operations and recompute the running length counters
    pub(crate) fn retain_ops<F: FnMut(&PlannedOp) -> bool>(&mut self, keep: F) {
        self.ops.retain(keep);
        self.base_extent = self.original_len.unwrap_or(0);
        self.inserted = 0;
        for op in &self.ops {
            match op.kind {
                OpKind::Replace => {
                    self.base_extent = self.base_extent.max(op.write.local_end_offset)
                }
                OpKind::Insert => self.inserted += op.write.bytes_written,
                _ => {}
            }
        }
    }

    fn push(&mut self, mut op: PlannedOp) {
        op.sequence = self.ops.len();
        match op.kind {
            OpKind::Replace => {
                self.base_extent = self.base_extent.max(op.write.local_end_offset);
            }
            OpKind::Insert => self.inserted += op.write.bytes_written,
            _ => {}
        }
        self.ops.push(op);
    }
}

/// The planned operations of a whole session, keyed by normalized destination
#[derive(Debug, Clone, Default)]
pub struct WritePlan {
    pub files: BTreeMap<String, PlannedFile>,
}

impl WritePlan {
    pub fn op_count(&self) -> usize {
        self.files.values().map(|f| f.ops.len()).sum()
    }

    /// Groups of destination keys that must be applied together.
    ///
    /// A move joins its two paths into one unit; every other file is its own
    /// unit. Units never share a path, so they can be applied in parallel.
    pub fn apply_units(&self) -> Vec<Vec<String>> {
        let mut units = Vec::new();
        for (key, file) in &self.files {
            match file.move_partner() {
                Some(partner) => {
                    // Emit each pair once, from its source side
                    let is_source = file
                        .ops
                        .iter()
                        .any(|op| matches!(op.kind, OpKind::MoveOut { .. }));
                    if is_source {
                        units.push(vec![key.clone(), partner.to_string()]);
                    }
                }
                None => units.push(vec![key.clone()]),
            }
        }
        units
    }
}

/// Role a mod gives a destination; used to reject contradictory manifests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Write,
    Delete,
    MoveSource,
    MoveTarget,
}

/// Resolves manifests into a [`WritePlan`]
pub struct WritePlanner<'a> {
    target: &'a Path,
    plan: WritePlan,
    seen_mods: Vec<ModId>,
}

impl<'a> WritePlanner<'a> {
    pub fn new(target: &'a Path) -> Self {
        Self {
            target,
            plan: WritePlan::default(),
            seen_mods: Vec::new(),
        }
    }

    /// Plan one mod. `install_index` is its position in install order,
    /// `extracted` the directory its archives were unpacked into.
    pub fn plan_mod(
        &mut self,
        install_index: usize,
        package: &ModPackage,
        extracted: Option<&Path>,
    ) -> Result<(), PlanError> {
        let mod_id = package.id().clone();
        if self.seen_mods.contains(&mod_id) {
            return Err(PlanError::DuplicateMod(mod_id));
        }
        self.seen_mods.push(mod_id.clone());

        let mut roles: HashMap<String, Role> = HashMap::new();

        for file in &package.manifest.files {
            let invalid = |reason: String| PlanError::InvalidWriteSpec {
                mod_id: mod_id.clone(),
                destination: file.destination.clone(),
                reason,
            };

            if !paths::is_contained_relative(&file.destination) {
                return Err(invalid("destination must be relative to the target".into()));
            }
            let key = paths::normalize_for_lookup(&file.destination);

            match &file.action {
                FileAction::Write { writes } => {
                    claim_role(&mut roles, &key, Role::Write).map_err(invalid)?;
                    let planned = self.file_entry(&file.destination, &key).map_err(invalid)?;
                    planned.reserved |= file.reserved;

                    for write in writes {
                        let payload = load_payload(write, &package.root, extracted).map_err(invalid)?;
                        let (kind, resolved) =
                            resolve_write(write, payload.len() as u64, planned).map_err(invalid)?;

                        if resolved.local_end_offset == resolved.local_start_offset {
                            debug!(
                                "Skipping empty {} at {} in {} ({})",
                                kind.name(),
                                resolved.local_start_offset,
                                file.destination,
                                mod_id
                            );
                            continue;
                        }

                        planned.push(PlannedOp {
                            mod_id: mod_id.clone(),
                            install_index,
                            sequence: 0,
                            kind,
                            write: resolved,
                            payload: payload.into(),
                            attributed: vec![mod_id.clone()],
                        });
                    }
                }
                FileAction::Delete => {
                    claim_role(&mut roles, &key, Role::Delete).map_err(invalid)?;
                    let planned = self.file_entry(&file.destination, &key).map_err(invalid)?;
                    if !planned.existed() {
                        return Err(invalid("cannot delete a file that does not exist".into()));
                    }
                    planned.reserved |= file.reserved;
                    planned.push(whole_file_op(&mod_id, install_index, OpKind::Delete));
                }
                FileAction::Move { to } => {
                    if !paths::is_contained_relative(to) {
                        return Err(invalid(format!("move target '{}' must be relative", to)));
                    }
                    let to_key = paths::normalize_for_lookup(to);
                    if to_key == key {
                        return Err(invalid("move target equals its source".into()));
                    }
                    claim_role(&mut roles, &key, Role::MoveSource).map_err(invalid)?;
                    claim_role(&mut roles, &to_key, Role::MoveTarget).map_err(invalid)?;

                    let source = self.file_entry(&file.destination, &key).map_err(invalid)?;
                    if !source.existed() {
                        return Err(invalid("cannot move a file that does not exist".into()));
                    }
                    source.reserved |= file.reserved;
                    source.push(whole_file_op(
                        &mod_id,
                        install_index,
                        OpKind::MoveOut { to: to_key.clone() },
                    ));

                    let target = self.file_entry(to, &to_key).map_err(invalid)?;
                    if target.existed() {
                        return Err(invalid(format!("move target '{}' already exists", to)));
                    }
                    target.reserved |= file.reserved;
                    target.push(whole_file_op(
                        &mod_id,
                        install_index,
                        OpKind::MoveIn { from: key.clone() },
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn finish(self) -> WritePlan {
        self.plan
    }

    /// Look up or create the entry for a destination, stat'ing it on first touch
    fn file_entry(&mut self, destination: &str, key: &str) -> Result<&mut PlannedFile, String> {
        if !self.plan.files.contains_key(key) {
            let absolute = paths::resolve_destination(self.target, destination);
            let original_len = match fs::metadata(&absolute) {
                Ok(meta) if meta.is_file() => Some(meta.len()),
                Ok(_) => return Err(format!("{} is not a regular file", absolute.display())),
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
                    ) =>
                {
                    None
                }
                Err(e) => return Err(format!("cannot stat {}: {}", absolute.display(), e)),
            };
            self.plan.files.insert(
                key.to_string(),
                PlannedFile::new(destination, key.to_string(), absolute, original_len),
            );
        }
        self.plan
            .files
            .get_mut(key)
            .ok_or_else(|| format!("planner lost entry for {}", destination))
    }
}

fn claim_role(roles: &mut HashMap<String, Role>, key: &str, role: Role) -> Result<(), String> {
    match roles.get(key) {
        None => {
            roles.insert(key.to_string(), role);
            Ok(())
        }
        Some(Role::Write) if role == Role::Write => Ok(()),
        Some(existing) => Err(format!(
            "destination used as {:?} and {:?} by the same mod",
            existing, role
        )),
    }
}

fn whole_file_op(mod_id: &ModId, install_index: usize, kind: OpKind) -> PlannedOp {
    PlannedOp {
        mod_id: mod_id.clone(),
        install_index,
        sequence: 0,
        kind,
        write: FileWrite {
            local_start_offset: 0,
            local_end_offset: WHOLE_FILE_END,
            bytes_written: 0,
            bytes_added: 0,
        },
        payload: Arc::from(Vec::new()),
        attributed: vec![mod_id.clone()],
    }
}

/// Read the bytes a write will put into the file.
///
/// File references are looked up in the mod root first, then in the mod's
/// extraction output.
fn load_payload(write: &WriteContent, root: &Path, extracted: Option<&Path>) -> Result<Vec<u8>, String> {
    match &write.payload {
        WritePayload::Text(text) => Ok(text.as_bytes().to_vec()),
        WritePayload::File(relative) => {
            if !paths::is_contained_relative(relative) {
                return Err(format!("source file '{}' must be relative to the mod", relative));
            }

            let candidates = std::iter::once(root).chain(extracted);
            let source = candidates
                .filter_map(|base| paths::resolve_case_insensitive(base, relative))
                .find(|p| p.is_file())
                .ok_or_else(|| format!("source file '{}' not found", relative))?;

            fs::read(&source).map_err(|e| format!("cannot read source {}: {}", source.display(), e))
        }
    }
}

/// Turn one declared write into a [`FileWrite`] against `file`'s running state
fn resolve_write(write: &WriteContent, payload_len: u64, file: &PlannedFile) -> Result<(OpKind, FileWrite), String> {
    if write.start_offset < 0 {
        return Err(format!("negative start offset {}", write.start_offset));
    }
    if let Some(end) = write.end_offset {
        if end < write.start_offset {
            return Err(format!(
                "end offset {} is before start offset {}",
                end, write.start_offset
            ));
        }
    }

    let start = write.start_offset as u64;
    // An insert at the running end of the file appends after everything
    // planned so far; any other offset refers to the session-start layout
    // as grown by replaces.
    let appends = !write.replace && start > file.base_extent && start == file.planned_len();
    if start > file.base_extent && !appends {
        return Err(format!(
            "start offset {} is beyond the end of the file ({} bytes, {} with planned writes)",
            start,
            file.base_extent,
            file.planned_len()
        ));
    }
    let start = if appends { file.base_extent } else { start };

    let payload_end = start
        .checked_add(payload_len)
        .ok_or_else(|| "write overflows the file offset range".to_string())?;

    if write.replace {
        let declared_end = write.end_offset.map(|e| e as u64).unwrap_or(payload_end);
        let local_end = declared_end.max(payload_end);

        let fill_past_end = local_end.saturating_sub(payload_end.max(file.base_extent));
        if fill_past_end > MAX_ZERO_FILL || usize::try_from(local_end).is_err() {
            return Err(format!(
                "end offset {} would zero-fill {} bytes past the end of the file (limit {})",
                local_end, fill_past_end, MAX_ZERO_FILL
            ));
        }

        let span = local_end - start;
        // Bytes of the span that already exist; the rest grows the file
        let existing = local_end.min(file.base_extent).saturating_sub(start);

        Ok((
            OpKind::Replace,
            FileWrite {
                local_start_offset: start,
                local_end_offset: local_end,
                bytes_written: payload_len,
                bytes_added: span - existing,
            },
        ))
    } else {
        Ok((
            OpKind::Insert,
            FileWrite {
                local_start_offset: start,
                local_end_offset: payload_end,
                bytes_written: payload_len,
                bytes_added: payload_len,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ModFile, ModManifest};
    use tempfile::tempdir;

    fn package(id: &str, root: &Path, files: Vec<ModFile>) -> ModPackage {
        ModPackage::new(
            ModManifest {
                id: ModId::new(id),
                name: String::new(),
                version: String::new(),
                extract: Vec::new(),
                files,
            },
            root,
        )
    }

    fn writes(destination: &str, writes: Vec<WriteContent>) -> ModFile {
        ModFile {
            destination: destination.into(),
            reserved: false,
            action: FileAction::Write { writes },
        }
    }

    fn plan_error(result: Result<(), PlanError>) -> String {
        match result {
            Err(PlanError::InvalidWriteSpec { reason, .. }) => reason,
            other => panic!("expected InvalidWriteSpec, got {:?}", other),
        }
    }

    #[test]
    fn test_replace_and_insert_resolution() {
        let target = tempdir().unwrap();
        fs::write(target.path().join("data.bin"), vec![0u8; 20]).unwrap();

        let mut planner = WritePlanner::new(target.path());
        let pkg = package(
            "a",
            target.path(),
            vec![writes(
                "data.bin",
                vec![
                    WriteContent::replace_text(0, Some(2), "XY"),
                    WriteContent::replace_text(4, Some(10), "ab"),
                    WriteContent::insert_text(10, "AA"),
                    WriteContent::replace_text(18, None, "tail"),
                ],
            )],
        );
        planner.plan_mod(0, &pkg, None).unwrap();
        let plan = planner.finish();
        let file = &plan.files["data.bin"];

        let w: Vec<FileWrite> = file.ops.iter().map(|op| op.write).collect();
        assert_eq!(w[0], FileWrite { local_start_offset: 0, local_end_offset: 2, bytes_written: 2, bytes_added: 0 });
        // Declared span wider than the payload keeps the span
        assert_eq!(w[1], FileWrite { local_start_offset: 4, local_end_offset: 10, bytes_written: 2, bytes_added: 0 });
        assert_eq!(w[2], FileWrite { local_start_offset: 10, local_end_offset: 12, bytes_written: 2, bytes_added: 2 });
        // 2 of 4 bytes exist past offset 18
        assert_eq!(w[3], FileWrite { local_start_offset: 18, local_end_offset: 22, bytes_written: 4, bytes_added: 2 });

        assert_eq!(file.planned_len(), 24);
        assert_eq!(file.ops[2].kind, OpKind::Insert);
        assert!(file.change_kinds().contains(ChangeKinds::EDITED | ChangeKinds::REPLACED));
        assert!(!file.change_kinds().contains(ChangeKinds::ADDED));
    }

    #[test]
    fn test_invalid_offsets() {
        let target = tempdir().unwrap();
        fs::write(target.path().join("f.txt"), b"0123456789").unwrap();

        let cases = [
            (WriteContent::insert_text(-1, "x"), "negative"),
            (WriteContent::replace_text(5, Some(3), "x"), "before start"),
            (WriteContent::insert_text(11, "x"), "beyond the end"),
        ];

        for (write, expected) in cases {
            let mut planner = WritePlanner::new(target.path());
            let pkg = package("a", target.path(), vec![writes("f.txt", vec![write])]);
            let reason = plan_error(planner.plan_mod(0, &pkg, None));
            assert!(reason.contains(expected), "{} vs {}", reason, expected);
        }
    }

    #[test]
    fn test_unbounded_zero_fill_is_invalid() {
        let target = tempdir().unwrap();
        fs::write(target.path().join("f.txt"), b"0123456789").unwrap();

        let mut planner = WritePlanner::new(target.path());
        let pkg = package(
            "a",
            target.path(),
            vec![writes("f.txt", vec![WriteContent::replace_text(0, Some(i64::MAX), "X")])],
        );
        assert!(plan_error(planner.plan_mod(0, &pkg, None)).contains("zero-fill"));

        // A wide span inside the existing bytes is fine
        let mut planner = WritePlanner::new(target.path());
        let pkg = package(
            "a",
            target.path(),
            vec![writes("f.txt", vec![WriteContent::replace_text(0, Some(10), "X")])],
        );
        planner.plan_mod(0, &pkg, None).unwrap();
        assert_eq!(planner.finish().files["f.txt"].planned_len(), 10);
    }

    #[test]
    fn test_sequential_writes_build_new_file() {
        let target = tempdir().unwrap();
        let mut planner = WritePlanner::new(target.path());
        let pkg = package(
            "a",
            target.path(),
            vec![
                writes(
                    "new.txt",
                    vec![
                        WriteContent::insert_text(0, "hello"),
                        WriteContent::insert_text(5, " world"),
                        WriteContent::insert_text(11, "!"),
                    ],
                ),
                writes(
                    "grown.txt",
                    vec![
                        WriteContent::replace_text(0, None, "abc"),
                        WriteContent::replace_text(3, None, "def"),
                    ],
                ),
            ],
        );
        planner.plan_mod(0, &pkg, None).unwrap();
        let plan = planner.finish();

        let new = &plan.files["new.txt"];
        assert_eq!(new.planned_len(), 12);
        // Appends land at the end of the session-start layout, in declared order
        let starts: Vec<u64> = new.ops.iter().map(|op| op.write.local_start_offset).collect();
        assert_eq!(starts, vec![0, 0, 0]);
        let rendered = crate::installer::apply::render(&[], &new.ops, Default::default());
        assert_eq!(rendered.bytes, b"hello world!");

        assert_eq!(plan.files["grown.txt"].planned_len(), 6);
    }

    #[test]
    fn test_offset_inside_planned_inserts_is_invalid() {
        let target = tempdir().unwrap();
        let mut planner = WritePlanner::new(target.path());
        let pkg = package(
            "a",
            target.path(),
            vec![writes(
                "new.txt",
                vec![WriteContent::insert_text(0, "hello"), WriteContent::insert_text(3, "X")],
            )],
        );
        assert!(plan_error(planner.plan_mod(0, &pkg, None)).contains("beyond the end"));
    }

    #[test]
    fn test_destination_aliases_share_one_entry() {
        let target = tempdir().unwrap();
        fs::create_dir_all(target.path().join("Data")).unwrap();
        fs::write(target.path().join("Data/x.bin"), b"0123").unwrap();
        fs::write(target.path().join("core.pak"), b"0123").unwrap();

        let mut planner = WritePlanner::new(target.path());
        let a = package(
            "a",
            target.path(),
            vec![
                writes("Data/x.bin", vec![WriteContent::insert_text(2, "a")]),
                writes("core.pak", vec![WriteContent::insert_text(0, "a")]),
            ],
        );
        let b = package(
            "b",
            target.path(),
            vec![
                writes("Data//x.bin", vec![WriteContent::insert_text(2, "b")]),
                writes("./core.pak", vec![WriteContent::insert_text(0, "b")]),
            ],
        );
        planner.plan_mod(0, &a, None).unwrap();
        planner.plan_mod(1, &b, None).unwrap();
        let plan = planner.finish();

        assert_eq!(plan.files.len(), 2);
        assert_eq!(plan.files["data/x.bin"].ops.len(), 2);
        assert_eq!(plan.files["core.pak"].ops.len(), 2);
        assert_eq!(plan.files["core.pak"].absolute, target.path().join("core.pak"));
    }

    #[test]
    fn test_missing_source_file_is_invalid() {
        let target = tempdir().unwrap();
        let mod_root = tempdir().unwrap();
        let write = WriteContent {
            start_offset: 0,
            end_offset: None,
            payload: WritePayload::File("missing.bin".into()),
            replace: false,
        };
        let mut planner = WritePlanner::new(target.path());
        let pkg = package("a", mod_root.path(), vec![writes("new.bin", vec![write])]);
        assert!(plan_error(planner.plan_mod(0, &pkg, None)).contains("not found"));
    }

    #[test]
    fn test_source_file_falls_back_to_extraction_dir() {
        let target = tempdir().unwrap();
        let mod_root = tempdir().unwrap();
        let extracted = tempdir().unwrap();
        fs::write(extracted.path().join("Payload.BIN"), b"hello").unwrap();

        let write = WriteContent {
            start_offset: 0,
            end_offset: None,
            payload: WritePayload::File("payload.bin".into()),
            replace: false,
        };
        let mut planner = WritePlanner::new(target.path());
        let pkg = package("a", mod_root.path(), vec![writes("new.bin", vec![write])]);
        planner.plan_mod(0, &pkg, Some(extracted.path())).unwrap();

        let plan = planner.finish();
        let file = &plan.files["new.bin"];
        assert!(!file.existed());
        assert_eq!(&*file.ops[0].payload, b"hello");
        assert!(file.change_kinds().contains(ChangeKinds::ADDED));
    }

    #[test]
    fn test_move_and_delete_claims() {
        let target = tempdir().unwrap();
        fs::write(target.path().join("a.txt"), b"a").unwrap();
        fs::write(target.path().join("old.txt"), b"old").unwrap();

        let mut planner = WritePlanner::new(target.path());
        let pkg = package(
            "m",
            target.path(),
            vec![
                ModFile {
                    destination: "a.txt".into(),
                    reserved: false,
                    action: FileAction::Move { to: "sub/b.txt".into() },
                },
                ModFile {
                    destination: "old.txt".into(),
                    reserved: false,
                    action: FileAction::Delete,
                },
            ],
        );
        planner.plan_mod(0, &pkg, None).unwrap();
        let plan = planner.finish();

        assert_eq!(plan.files["a.txt"].ops[0].range(), 0..WHOLE_FILE_END);
        assert_eq!(plan.files["sub/b.txt"].ops[0].kind, OpKind::MoveIn { from: "a.txt".into() });
        assert_eq!(plan.files["old.txt"].change_kinds(), ChangeKinds::DELETED);

        let units = plan.apply_units();
        assert!(units.contains(&vec!["a.txt".to_string(), "sub/b.txt".to_string()]));
        assert!(units.contains(&vec!["old.txt".to_string()]));
        assert_eq!(units.len(), 2);
    }

    #[test]
    fn test_same_mod_cannot_move_and_write() {
        let target = tempdir().unwrap();
        fs::write(target.path().join("a.txt"), b"a").unwrap();

        let mut planner = WritePlanner::new(target.path());
        let pkg = package(
            "m",
            target.path(),
            vec![
                ModFile {
                    destination: "a.txt".into(),
                    reserved: false,
                    action: FileAction::Move { to: "b.txt".into() },
                },
                writes("A.TXT", vec![WriteContent::insert_text(0, "x")]),
            ],
        );
        assert!(plan_error(planner.plan_mod(0, &pkg, None)).contains("same mod"));
    }

    #[test]
    fn test_duplicate_mod_ids_rejected() {
        let target = tempdir().unwrap();
        let mut planner = WritePlanner::new(target.path());
        let pkg = package("same", target.path(), Vec::new());
        planner.plan_mod(0, &pkg, None).unwrap();
        assert!(matches!(
            planner.plan_mod(1, &pkg, None),
            Err(PlanError::DuplicateMod(_))
        ));
    }

    #[test]
    fn test_escaping_destination_rejected() {
        let target = tempdir().unwrap();
        let mut planner = WritePlanner::new(target.path());
        let pkg = package(
            "a",
            target.path(),
            vec![writes("../outside.txt", vec![WriteContent::insert_text(0, "x")])],
        );
        assert!(plan_error(planner.plan_mod(0, &pkg, None)).contains("relative"));
    }
}
