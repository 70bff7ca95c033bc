//! Installation orchestrator
//!
//! Drives one session through its phases:
//! 1. Planning        - run extraction batches, resolve every mod's writes
//! 2. CollisionCheck  - classify overlaps, stop on anything unresolvable
//! 3. Applying        - per unit: back up, then write (parallel across units)
//! 4. Verifying       - re-read what was written
//!
//! and ends in Committed, RolledBack or Failed. Failed means nothing under
//! the target was touched; RolledBack means changes were made and undone
//! (or undoing them failed, see [`InstallationStatus::RolledBackError`]).

pub mod apply;
pub mod backup;
pub mod collision;
pub mod config;
pub mod ledger;
pub mod logging;
pub mod planner;
pub mod status;
pub mod verify;

pub use collision::{Collision, CollisionDetector, CollisionKind, CollisionReport};
pub use config::{ConfigError, InstallerConfig, Precedence, ProgressCallback, ProgressEvent};
pub use ledger::{ChangeKinds, FileModification, FileModificationLedger};
pub use logging::{LogSeverity, LogSink, MemorySink, TracingSink};
pub use planner::{PlanError, WritePlan, WritePlanner};
pub use status::{InstallationStatus, Severity, ValidationResponse};

use rayon::prelude::*;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::archive::{self, ExtractionBatch, ExtractionWorkspace, QuickBmsRunner};
use crate::manifest::{ManifestError, ModPackage};
use crate::paths;

use apply::{AppliedFile, ApplyError};
use backup::{BackupManager, RollbackReport};

/// Shared flag; set it to make the session stop before the next file
pub type CancellationToken = Arc<AtomicBool>;

/// Session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Planning,
    CollisionCheck,
    Applying,
    Verifying,
    Committed,
    RolledBack,
    Failed,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Planning => "Planning",
            SessionState::CollisionCheck => "CollisionCheck",
            SessionState::Applying => "Applying",
            SessionState::Verifying => "Verifying",
            SessionState::Committed => "Committed",
            SessionState::RolledBack => "RolledBack",
            SessionState::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Committed | SessionState::RolledBack | SessionState::Failed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything a finished session reports back
#[derive(Debug)]
pub struct InstallOutcome {
    pub session_id: Uuid,
    pub status: InstallationStatus,
    pub final_state: SessionState,
    pub responses: Vec<ValidationResponse>,
    pub collisions: Vec<Collision>,
    /// Committed ledger entries; empty unless the session committed
    pub modifications: Vec<FileModification>,
    pub rollback: Option<RollbackReport>,
}

impl InstallOutcome {
    /// Outcome for mods whose manifests could not be loaded
    pub fn from_manifest_error(err: &ManifestError) -> Self {
        Self {
            session_id: Uuid::nil(),
            status: InstallationStatus::InvalidActions,
            final_state: SessionState::Failed,
            responses: vec![ValidationResponse::error(err.to_string())],
            collisions: Vec::new(),
            modifications: Vec::new(),
            rollback: None,
        }
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationResponse> {
        self.responses.iter().filter(|r| r.severity == Severity::Warning)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationResponse> {
        self.responses.iter().filter(|r| r.severity == Severity::Error)
    }
}

/// Result of a dry run through CollisionCheck
#[derive(Debug)]
pub struct DryRun {
    /// Status the install would start applying with, or the failure it would stop at
    pub status: InstallationStatus,
    pub plan: WritePlan,
    pub collisions: CollisionReport,
    pub responses: Vec<ValidationResponse>,
}

/// Why planning stopped
struct Rejected {
    status: InstallationStatus,
    responses: Vec<ValidationResponse>,
}

impl Rejected {
    fn new(status: InstallationStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            responses: vec![ValidationResponse::error(message)],
        }
    }
}

/// Per-unit failure during Applying
enum UnitFailure {
    Cancelled,
    /// Another unit already failed
    Skipped,
    Failed(ApplyError),
}

/// One installation session
pub struct InstallSession {
    id: Uuid,
    config: InstallerConfig,
    sink: Arc<dyn LogSink>,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
    ledger: FileModificationLedger,
    state: SessionState,
}

impl InstallSession {
    /// Create a session. The configuration is validated and then fixed.
    pub fn new(config: InstallerConfig, sink: Arc<dyn LogSink>) -> Result<Self, ConfigError> {
        config.validate()?;
        let ledger = FileModificationLedger::new(&config.reserved_files);
        Ok(Self {
            id: Uuid::new_v4(),
            config,
            sink,
            progress: None,
            cancel: Arc::new(AtomicBool::new(false)),
            ledger,
            state: SessionState::Planning,
        })
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    pub fn ledger(&self) -> &FileModificationLedger {
        &self.ledger
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn report_progress(&self, event: ProgressEvent) {
        if let Some(ref callback) = self.progress {
            callback(event);
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session {}: {} -> {}", self.id, self.state, next);
        self.state = next;
        if !next.is_terminal() {
            self.sink.info(&format!("{}...", next));
            self.report_progress(ProgressEvent::PhaseStarted { phase: next.name() });
        }
    }

    /// Run Planning and CollisionCheck only; the target is never written
    pub fn plan_only(&mut self, mods: &[ModPackage]) -> DryRun {
        let workspace = ExtractionWorkspace::new(&self.config.temp_folder, self.id);
        let result = self.prepare(mods, &workspace);
        workspace.remove();

        match result {
            Ok((plan, collisions)) => {
                let status = if collisions.resolvable_count() > 0 {
                    InstallationStatus::ResolvableConflict
                } else {
                    InstallationStatus::Success
                };
                let responses = collisions.responses();
                DryRun {
                    status,
                    plan,
                    collisions,
                    responses,
                }
            }
            Err((rejected, collisions)) => DryRun {
                status: rejected.status,
                plan: WritePlan::default(),
                collisions,
                responses: rejected.responses,
            },
        }
    }

    /// Install `mods` in the given order
    pub fn install(mut self, mods: &[ModPackage]) -> InstallOutcome {
        let started = Instant::now();
        info!(
            "Session {}: installing {} mods into {}",
            self.id,
            mods.len(),
            self.config.target_path.display()
        );

        let workspace = ExtractionWorkspace::new(&self.config.temp_folder, self.id);
        let (plan, report) = match self.prepare(mods, &workspace) {
            Ok(prepared) => prepared,
            Err((rejected, report)) => {
                workspace.remove();
                self.ledger.discard_staged();
                return self.finish(SessionState::Failed, rejected.status, rejected.responses, report, None);
            }
        };
        let mut responses = report.responses();

        // === Applying ===
        self.transition(SessionState::Applying);
        let backups = match BackupManager::create(&self.config.backup_folder, self.id, &self.config.target_path) {
            Ok(backups) => backups,
            Err(e) => {
                workspace.remove();
                self.ledger.discard_staged();
                self.sink.error(&e.to_string());
                responses.push(ValidationResponse::error(e.to_string()));
                return self.finish(SessionState::Failed, InstallationStatus::FatalError, responses, report, None);
            }
        };

        let applied = match self.apply_all(&plan, &backups) {
            Ok(applied) => applied,
            Err(failures) => {
                responses.extend(failures);
                return self.roll_back(backups, &workspace, responses, report);
            }
        };

        // === Verifying ===
        self.transition(SessionState::Verifying);
        let summary = verify::verify_applied(&applied);
        if !summary.all_passed() {
            for failure in &summary.failures {
                let message = format!("verification failed: {}", failure.reason);
                self.sink.error(&format!("{}: {}", failure.destination, message));
                responses.push(ValidationResponse::error(message).for_destination(failure.destination.clone()));
            }
            return self.roll_back(backups, &workspace, responses, report);
        }

        // === Committed ===
        for file in &applied {
            self.ledger.commit(&file.destination);
            responses.push(
                ValidationResponse::info(format!(
                    "{} by {}",
                    file.kinds.names().join(" | ").to_lowercase(),
                    file.mods.iter().map(|m| m.as_str()).collect::<Vec<_>>().join(", ")
                ))
                .for_destination(file.destination.clone()),
            );
        }
        // Entries whose every operation was resolved away
        self.ledger.discard_staged();

        if let Err(e) = backups.commit() {
            self.sink.warn(&format!("Failed to remove backups: {}", e));
        }
        workspace.remove();

        let status = if report.resolvable_count() > 0 {
            InstallationStatus::ResolvableConflict
        } else {
            InstallationStatus::Success
        };
        self.sink.info(&format!(
            "Installed {} files in {:.1}s ({})",
            applied.len(),
            started.elapsed().as_secs_f64(),
            status
        ));
        self.finish(SessionState::Committed, status, responses, report, None)
    }

    /// Planning and CollisionCheck
    fn prepare(
        &mut self,
        mods: &[ModPackage],
        workspace: &ExtractionWorkspace,
    ) -> Result<(WritePlan, CollisionReport), (Rejected, CollisionReport)> {
        // === Planning ===
        self.transition(SessionState::Planning);
        let no_report = CollisionReport::default;

        self.extract(mods, workspace).map_err(|r| (r, no_report()))?;

        let mut planner = WritePlanner::new(&self.config.target_path);
        for (index, package) in mods.iter().enumerate() {
            let extracted = workspace.mod_dir(package.id());
            let extracted = extracted.is_dir().then_some(extracted.as_path());
            if let Err(e) = planner.plan_mod(index, package, extracted) {
                self.sink.error(&e.to_string());
                let status = match e {
                    PlanError::Manifest(_) => InstallationStatus::FatalError,
                    _ => InstallationStatus::InvalidActions,
                };
                return Err((Rejected::new(status, e.to_string()), no_report()));
            }
        }
        let mut plan = planner.finish();

        for file in plan.files.values() {
            let reserved = file.reserved || self.config.is_reserved(&file.destination);
            for op in &file.ops {
                self.ledger.touch(&file.destination, &op.mod_id, reserved);
            }
        }
        info!(
            "Planned {} operations on {} files",
            plan.op_count(),
            plan.files.len()
        );

        // === CollisionCheck ===
        self.transition(SessionState::CollisionCheck);
        let detector = CollisionDetector::new(self.config.check_for_collisions, self.config.precedence);
        let report = detector.detect(&mut plan, &self.ledger);

        for collision in &report.collisions {
            let response = collision.to_response();
            match response.severity {
                Severity::Error => self.sink.error(&response.to_string()),
                Severity::Warning => self.sink.warn(&response.to_string()),
                Severity::None => {}
            }
        }

        if report.has_unresolvable() {
            let responses = report.responses();
            return Err((
                Rejected {
                    status: InstallationStatus::UnresolvableConflict,
                    responses,
                },
                report,
            ));
        }

        for file in plan.files.values() {
            if !file.ops.is_empty() {
                self.ledger.record(&file.destination, file.change_kinds(), &file.owners());
            }
        }

        Ok((plan, report))
    }

    /// Run every mod's extraction batches into the workspace
    fn extract(&self, mods: &[ModPackage], workspace: &ExtractionWorkspace) -> Result<(), Rejected> {
        let mut batches = Vec::new();
        for package in mods {
            for request in &package.manifest.extract {
                let resolve = |relative: &str, what: &str| {
                    paths::resolve_case_insensitive(&package.root, relative)
                        .filter(|p| p.is_file() && paths::is_contained_relative(relative))
                        .ok_or_else(|| {
                            Rejected::new(
                                InstallationStatus::InvalidActions,
                                format!("mod '{}': {} '{}' not found", package.id(), what, relative),
                            )
                        })
                };
                batches.push(ExtractionBatch {
                    mod_id: package.id().clone(),
                    archive: resolve(&request.archive, "archive")?,
                    script: resolve(&request.script, "script")?,
                    output_dir: workspace.mod_dir(package.id()),
                });
            }
        }

        if batches.is_empty() {
            return Ok(());
        }

        let fatal = |e: archive::ToolError| {
            self.sink.error(&e.to_string());
            Rejected::new(InstallationStatus::FatalError, e.to_string())
        };
        let tool = archive::locate(self.config.tool_path.as_deref()).map_err(fatal)?;
        let runner = QuickBmsRunner::new(tool, self.config.max_quickbms_batches);
        let counts = runner.run_all(&batches, self.progress.as_ref()).map_err(fatal)?;

        self.sink.info(&format!(
            "Extracted {} files from {} archives",
            counts.iter().sum::<usize>(),
            batches.len()
        ));
        Ok(())
    }

    /// Back up and apply every unit, in parallel across units
    fn apply_all(&self, plan: &WritePlan, backups: &BackupManager) -> Result<Vec<AppliedFile>, Vec<ValidationResponse>> {
        let units = plan.apply_units();
        let total = units.len();
        let done = AtomicUsize::new(0);
        let failed = AtomicBool::new(false);
        let precedence = self.config.precedence;

        let results: Vec<Result<Vec<AppliedFile>, UnitFailure>> = units
            .par_iter()
            .map(|unit| {
                if self.cancel.load(Ordering::SeqCst) {
                    return Err(UnitFailure::Cancelled);
                }
                if failed.load(Ordering::SeqCst) {
                    return Err(UnitFailure::Skipped);
                }

                match apply::apply_unit(unit, plan, backups, precedence) {
                    Ok(files) => {
                        let current = done.fetch_add(1, Ordering::SeqCst) + 1;
                        for file in &files {
                            self.report_progress(ProgressEvent::FileApplied {
                                destination: file.destination.clone(),
                                current,
                                total,
                            });
                        }
                        Ok(files)
                    }
                    Err(e) => {
                        failed.store(true, Ordering::SeqCst);
                        Err(UnitFailure::Failed(e))
                    }
                }
            })
            .collect();

        let mut applied = Vec::new();
        let mut failures = Vec::new();
        let mut cancelled = false;
        for result in results {
            match result {
                Ok(files) => applied.extend(files),
                Err(UnitFailure::Failed(e)) => {
                    self.sink.error(&e.to_string());
                    failures.push(ValidationResponse::error(e.to_string()));
                }
                Err(UnitFailure::Cancelled) => cancelled = true,
                Err(UnitFailure::Skipped) => {}
            }
        }
        if cancelled {
            self.sink.warn("Installation cancelled");
            failures.push(ValidationResponse::error("installation cancelled"));
        }

        if failures.is_empty() {
            Ok(applied)
        } else {
            Err(failures)
        }
    }

    fn roll_back(
        mut self,
        backups: BackupManager,
        workspace: &ExtractionWorkspace,
        mut responses: Vec<ValidationResponse>,
        report: CollisionReport,
    ) -> InstallOutcome {
        self.sink.warn("Rolling back...");
        let rollback = backups.rollback(self.progress.as_ref());
        self.ledger.discard_staged();
        workspace.remove();

        let status = if rollback.is_clean() {
            InstallationStatus::FatalError
        } else {
            for failure in &rollback.failures {
                let message = format!("rollback failed: {}", failure.error);
                self.sink.error(&format!("{}: {}", failure.destination, message));
                responses.push(ValidationResponse::error(message).for_destination(failure.destination.clone()));
            }
            responses.push(ValidationResponse::error(format!(
                "target may be partially modified; backups kept in {}",
                backups.session_dir().display()
            )));
            InstallationStatus::RolledBackError
        };
        self.finish(SessionState::RolledBack, status, responses, report, Some(rollback))
    }

    fn finish(
        mut self,
        state: SessionState,
        status: InstallationStatus,
        responses: Vec<ValidationResponse>,
        report: CollisionReport,
        rollback: Option<RollbackReport>,
    ) -> InstallOutcome {
        self.transition(state);
        let message = format!("Session {} ended {}: {}", self.id, state, status);
        match status {
            s if s.is_success() => self.sink.info(&message),
            _ => self.sink.error(&message),
        }

        InstallOutcome {
            session_id: self.id,
            status,
            final_state: state,
            responses,
            collisions: report.collisions,
            modifications: self.ledger.committed(),
            rollback,
        }
    }
}

/// Replay the backups a crashed session left in `session_dir`
pub fn restore_session(session_dir: &Path, sink: &dyn LogSink, progress: Option<&ProgressCallback>) -> Result<RollbackReport, backup::BackupError> {
    let report = backup::restore_session(session_dir, progress)?;
    for failure in &report.failures {
        sink.error(&format!("{}: {}", failure.destination, failure.error));
    }
    sink.info(&format!(
        "Restored {} files, removed {} new files",
        report.restored, report.removed
    ));
    Ok(report)
}
