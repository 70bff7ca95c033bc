//! Collision detection between mods
//!
//! Operations on one destination are sorted by start offset and swept with
//! an active set. Two operations collide when their half-open ranges
//! intersect and they belong to different mods; overlaps inside one mod are
//! declared-order overrides and never reported.
//!
//! Classification, in order:
//! 1. Same range, same kind, same bytes: duplicate, merged into one write
//! 2. Reserved destination: unresolvable
//! 3. Either side is a move: unresolvable
//! 4. Both sides insert: unresolvable (resulting order is ambiguous)
//! 5. Otherwise resolved by precedence, a warning when checks are enabled

use std::collections::HashSet;
use std::ops::Range;

use tracing::debug;

use crate::manifest::ModId;

use super::config::Precedence;
use super::ledger::FileModificationLedger;
use super::planner::{OpKind, PlannedFile, PlannedOp, WritePlan};
use super::status::{Severity, ValidationResponse};

/// How a collision was classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollisionKind {
    /// Identical writes; deduplicated, both mods attributed
    Duplicate,
    /// Overlap resolved by precedence and reported
    Resolvable { winner: ModId },
    /// Overlap resolved by precedence with collision checks disabled
    Overridden { winner: ModId },
    /// Overlap that aborts the session
    Unresolvable { reason: String },
}

/// One side of a collision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollisionSide {
    pub mod_id: ModId,
    pub operation: &'static str,
    pub range: Range<u64>,
}

impl CollisionSide {
    fn of(op: &PlannedOp) -> Self {
        Self {
            mod_id: op.mod_id.clone(),
            operation: op.kind.name(),
            range: op.range(),
        }
    }
}

/// A classified overlap between two mods on one destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collision {
    pub destination: String,
    pub kind: CollisionKind,
    pub first: CollisionSide,
    pub second: CollisionSide,
}

impl Collision {
    pub fn severity(&self) -> Severity {
        match self.kind {
            CollisionKind::Duplicate | CollisionKind::Overridden { .. } => Severity::None,
            CollisionKind::Resolvable { .. } => Severity::Warning,
            CollisionKind::Unresolvable { .. } => Severity::Error,
        }
    }

    pub fn is_unresolvable(&self) -> bool {
        matches!(self.kind, CollisionKind::Unresolvable { .. })
    }

    pub fn to_response(&self) -> ValidationResponse {
        let sides = format!(
            "'{}' {} {} and '{}' {} {}",
            self.first.mod_id,
            self.first.operation,
            fmt_range(&self.first.range),
            self.second.mod_id,
            self.second.operation,
            fmt_range(&self.second.range),
        );
        let message = match &self.kind {
            CollisionKind::Duplicate => format!("identical writes merged: {}", sides),
            CollisionKind::Resolvable { winner } => {
                format!("overlapping writes: {}; '{}' takes precedence", sides, winner)
            }
            CollisionKind::Overridden { winner } => {
                format!("overlap not checked: {}; '{}' takes precedence", sides, winner)
            }
            CollisionKind::Unresolvable { reason } => {
                format!("unresolvable collision ({}): {}", reason, sides)
            }
        };
        ValidationResponse::new(self.severity(), message).for_destination(self.destination.clone())
    }
}

fn fmt_range(range: &Range<u64>) -> String {
    if range.end == u64::MAX {
        "[whole file]".to_string()
    } else {
        format!("[{}, {})", range.start, range.end)
    }
}

/// Result of collision detection
#[derive(Debug, Default)]
pub struct CollisionReport {
    pub collisions: Vec<Collision>,
}

impl CollisionReport {
    pub fn has_unresolvable(&self) -> bool {
        self.collisions.iter().any(Collision::is_unresolvable)
    }

    pub fn resolvable_count(&self) -> usize {
        self.collisions
            .iter()
            .filter(|c| matches!(c.kind, CollisionKind::Resolvable { .. }))
            .count()
    }

    pub fn responses(&self) -> Vec<ValidationResponse> {
        self.collisions.iter().map(Collision::to_response).collect()
    }

    /// Destinations with at least one unresolvable collision
    pub fn blocked_destinations(&self) -> Vec<&str> {
        let mut blocked: Vec<&str> = self
            .collisions
            .iter()
            .filter(|c| c.is_unresolvable())
            .map(|c| c.destination.as_str())
            .collect();
        blocked.dedup();
        blocked
    }
}

/// Classifies and resolves overlaps across mods
pub struct CollisionDetector {
    check_for_collisions: bool,
    precedence: Precedence,
}

impl CollisionDetector {
    pub fn new(check_for_collisions: bool, precedence: Precedence) -> Self {
        Self {
            check_for_collisions,
            precedence,
        }
    }

    /// Detect collisions in `plan`, dropping losing and duplicate operations in place.
    ///
    /// Files with an unresolvable collision keep all their operations; the
    /// caller must not apply the plan when the report has any.
    pub fn detect(&self, plan: &mut WritePlan, ledger: &FileModificationLedger) -> CollisionReport {
        let mut report = CollisionReport::default();

        for file in plan.files.values_mut() {
            let reserved = file.reserved || ledger.is_reserved(&file.destination);
            self.detect_file(file, reserved, &mut report);
        }

        debug!(
            "Collision check: {} collisions ({} resolvable, unresolvable: {})",
            report.collisions.len(),
            report.resolvable_count(),
            report.has_unresolvable()
        );

        report
    }

    fn detect_file(&self, file: &mut PlannedFile, reserved: bool, report: &mut CollisionReport) {
        let mut order: Vec<usize> = (0..file.ops.len()).collect();
        order.sort_by_key(|&i| (file.ops[i].write.local_start_offset, file.ops[i].write.local_end_offset, i));

        let mut dropped: HashSet<usize> = HashSet::new();
        let mut merged: HashSet<usize> = HashSet::new();
        let mut blocked = false;
        let mut active: Vec<usize> = Vec::new();

        for &i in &order {
            let start = file.ops[i].write.local_start_offset;
            active.retain(|&j| file.ops[j].write.local_end_offset > start);

            for &j in &active {
                if merged.contains(&j) || merged.contains(&i) {
                    continue;
                }
                let (a, b) = (&file.ops[j], &file.ops[i]);
                if a.mod_id == b.mod_id || !overlaps(&a.range(), &b.range()) {
                    continue;
                }

                let kind = self.classify(a, b, reserved);
                match &kind {
                    CollisionKind::Duplicate => {
                        merged.insert(i);
                    }
                    CollisionKind::Unresolvable { .. } => blocked = true,
                    CollisionKind::Resolvable { winner } | CollisionKind::Overridden { winner } => {
                        // Overlapping replaces both stay; apply order puts the winner last
                        if !(a.kind == OpKind::Replace && b.kind == OpKind::Replace) {
                            let loser = if *winner == a.mod_id { i } else { j };
                            dropped.insert(loser);
                        }
                    }
                }

                report.collisions.push(Collision {
                    destination: file.destination.clone(),
                    kind,
                    first: CollisionSide::of(a),
                    second: CollisionSide::of(b),
                });
            }

            active.push(i);
        }

        if blocked {
            return;
        }

        // Attribute merged duplicates to the write that survives
        let mut attributions: Vec<(usize, ModId)> = Vec::new();
        for &m in &merged {
            let dup = &file.ops[m];
            if let Some(keep) = (0..file.ops.len()).find(|&k| {
                k != m && !merged.contains(&k) && same_write(&file.ops[k], dup)
            }) {
                attributions.push((keep, dup.mod_id.clone()));
            }
        }
        for (keep, mod_id) in attributions {
            if !file.ops[keep].attributed.contains(&mod_id) {
                file.ops[keep].attributed.push(mod_id);
            }
        }

        let mut index = 0;
        file.retain_ops(|_| {
            let keep = !dropped.contains(&index) && !merged.contains(&index);
            index += 1;
            keep
        });
    }

    fn classify(&self, a: &PlannedOp, b: &PlannedOp, reserved: bool) -> CollisionKind {
        if same_write(a, b) {
            return CollisionKind::Duplicate;
        }
        if reserved {
            return CollisionKind::Unresolvable {
                reason: "reserved file".into(),
            };
        }
        if a.kind.is_move() || b.kind.is_move() {
            return CollisionKind::Unresolvable {
                reason: "move overlaps another change".into(),
            };
        }
        if a.kind == OpKind::Insert && b.kind == OpKind::Insert {
            return CollisionKind::Unresolvable {
                reason: "ambiguous insert order".into(),
            };
        }

        let winner = if self.precedence.prefers(a.install_index, b.install_index) {
            a.mod_id.clone()
        } else {
            b.mod_id.clone()
        };

        if self.check_for_collisions {
            CollisionKind::Resolvable { winner }
        } else {
            CollisionKind::Overridden { winner }
        }
    }
}

fn overlaps(a: &Range<u64>, b: &Range<u64>) -> bool {
    a.start < b.end && b.start < a.end
}

fn same_write(a: &PlannedOp, b: &PlannedOp) -> bool {
    a.range() == b.range() && a.kind == b.kind && a.payload == b.payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::planner::{FileWrite, WHOLE_FILE_END};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn op(mod_id: &str, index: usize, kind: OpKind, start: u64, payload: &[u8], span: Option<u64>) -> PlannedOp {
        let len = payload.len() as u64;
        let end = match kind {
            OpKind::Insert | OpKind::Replace => start + span.unwrap_or(len).max(len),
            _ => WHOLE_FILE_END,
        };
        PlannedOp {
            mod_id: ModId::new(mod_id),
            install_index: index,
            sequence: 0,
            kind,
            write: FileWrite {
                local_start_offset: start,
                local_end_offset: end,
                bytes_written: len,
                bytes_added: 0,
            },
            payload: Arc::from(payload.to_vec()),
            attributed: vec![ModId::new(mod_id)],
        }
    }

    fn plan_with(ops: Vec<PlannedOp>, reserved: bool) -> WritePlan {
        let mut file = PlannedFile::new(
            "data.bin",
            "data.bin".into(),
            PathBuf::from("/tmp/data.bin"),
            Some(100),
        );
        file.reserved = reserved;
        for (i, mut o) in ops.into_iter().enumerate() {
            o.sequence = i;
            file.ops.push(o);
        }
        file.retain_ops(|_| true);

        let mut plan = WritePlan::default();
        plan.files.insert("data.bin".into(), file);
        plan
    }

    fn detect(ops: Vec<PlannedOp>, reserved: bool, check: bool) -> (WritePlan, CollisionReport) {
        let mut plan = plan_with(ops, reserved);
        let ledger = FileModificationLedger::new(&[]);
        let report = CollisionDetector::new(check, Precedence::LastInstalledWins).detect(&mut plan, &ledger);
        (plan, report)
    }

    #[test]
    fn test_identical_replace_is_deduplicated() {
        let (plan, report) = detect(
            vec![
                op("a", 0, OpKind::Replace, 0, b"XY", None),
                op("b", 1, OpKind::Replace, 0, b"XY", None),
            ],
            false,
            true,
        );
        assert_eq!(report.collisions.len(), 1);
        assert_eq!(report.collisions[0].kind, CollisionKind::Duplicate);
        assert_eq!(report.collisions[0].severity(), Severity::None);
        assert_eq!(report.resolvable_count(), 0);

        let ops = &plan.files["data.bin"].ops;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].attributed, vec![ModId::new("a"), ModId::new("b")]);
    }

    #[test]
    fn test_overlapping_inserts_are_unresolvable() {
        let (plan, report) = detect(
            vec![
                op("a", 0, OpKind::Insert, 10, b"AA", None),
                op("b", 1, OpKind::Insert, 10, b"BB", None),
            ],
            false,
            true,
        );
        assert!(report.has_unresolvable());
        assert_eq!(report.blocked_destinations(), vec!["data.bin"]);
        assert_eq!(plan.files["data.bin"].ops.len(), 2);
    }

    #[test]
    fn test_reserved_file_is_unresolvable_even_without_checks() {
        let (_, report) = detect(
            vec![
                op("a", 0, OpKind::Replace, 0, b"AAAA", None),
                op("b", 1, OpKind::Replace, 2, b"BBBB", None),
            ],
            true,
            false,
        );
        assert!(report.has_unresolvable());
        assert_eq!(report.collisions[0].severity(), Severity::Error);
    }

    #[test]
    fn test_overlapping_replaces_resolve_by_precedence() {
        let (plan, report) = detect(
            vec![
                op("a", 0, OpKind::Replace, 0, b"AAAA", None),
                op("b", 1, OpKind::Replace, 2, b"BBBB", None),
            ],
            false,
            true,
        );
        assert_eq!(report.resolvable_count(), 1);
        assert_eq!(
            report.collisions[0].kind,
            CollisionKind::Resolvable { winner: ModId::new("b") }
        );
        assert_eq!(report.collisions[0].first.range, 0..4);
        assert_eq!(report.collisions[0].second.range, 2..6);
        // Both kept; the apply order lets "b" win the overlap
        assert_eq!(plan.files["data.bin"].ops.len(), 2);
    }

    #[test]
    fn test_insert_losing_to_replace_is_dropped() {
        let (plan, report) = detect(
            vec![
                op("a", 0, OpKind::Insert, 5, b"ins", None),
                op("b", 1, OpKind::Replace, 4, b"rep", None),
            ],
            false,
            true,
        );
        assert_eq!(report.resolvable_count(), 1);
        let ops = &plan.files["data.bin"].ops;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].mod_id, ModId::new("b"));
    }

    #[test]
    fn test_first_installed_precedence() {
        let mut plan = plan_with(
            vec![
                op("a", 0, OpKind::Delete, 0, b"", None),
                op("b", 1, OpKind::Replace, 0, b"new", None),
            ],
            false,
        );
        let ledger = FileModificationLedger::new(&[]);
        let report = CollisionDetector::new(true, Precedence::FirstInstalledWins).detect(&mut plan, &ledger);
        assert_eq!(
            report.collisions[0].kind,
            CollisionKind::Resolvable { winner: ModId::new("a") }
        );
        let ops = &plan.files["data.bin"].ops;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OpKind::Delete);
    }

    #[test]
    fn test_unchecked_overlap_is_silent() {
        let (plan, report) = detect(
            vec![
                op("a", 0, OpKind::Replace, 0, b"AAAA", None),
                op("b", 1, OpKind::Insert, 1, b"B", None),
            ],
            false,
            false,
        );
        assert_eq!(
            report.collisions[0].kind,
            CollisionKind::Overridden { winner: ModId::new("b") }
        );
        assert_eq!(report.responses()[0].severity, Severity::None);
        assert_eq!(plan.files["data.bin"].ops.len(), 1);
    }

    #[test]
    fn test_move_collision_is_unresolvable() {
        let (_, report) = detect(
            vec![
                op("a", 0, OpKind::MoveOut { to: "b.bin".into() }, 0, b"", None),
                op("b", 1, OpKind::Replace, 50, b"x", None),
            ],
            false,
            true,
        );
        assert!(report.has_unresolvable());
    }

    #[test]
    fn test_disjoint_and_same_mod_writes_do_not_collide() {
        let (plan, report) = detect(
            vec![
                op("a", 0, OpKind::Replace, 0, b"AA", None),
                op("b", 1, OpKind::Replace, 2, b"BB", None),
                op("b", 1, OpKind::Insert, 2, b"CC", None),
            ],
            false,
            true,
        );
        assert!(report.collisions.is_empty());
        assert_eq!(plan.files["data.bin"].ops.len(), 3);
    }

    #[test]
    fn test_response_message_names_both_mods() {
        let (_, report) = detect(
            vec![
                op("a", 0, OpKind::Insert, 10, b"AA", None),
                op("b", 1, OpKind::Insert, 10, b"BB", None),
            ],
            false,
            true,
        );
        let response = &report.responses()[0];
        assert_eq!(response.destination.as_deref(), Some("data.bin"));
        assert!(response.message.contains("'a' insert [10, 12)"));
        assert!(response.message.contains("'b' insert [10, 12)"));
    }
}
