//! Installation configuration
//!
//! Defines the per-session configuration and progress events.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::paths;

/// Which mod wins a resolvable collision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precedence {
    /// The mod installed later in the session overrides earlier ones
    #[default]
    LastInstalledWins,
    /// The first mod to claim a range keeps it
    FirstInstalledWins,
}

impl Precedence {
    /// Whether the mod at install position `a` beats the one at `b`
    pub fn prefers(&self, a: usize, b: usize) -> bool {
        match self {
            Precedence::LastInstalledWins => a > b,
            Precedence::FirstInstalledWins => a < b,
        }
    }

    /// Rank of a mod when overlapping replaces are applied in ascending
    /// rank; the preferred mod gets the highest rank and lands last
    pub fn apply_rank(&self, install_index: usize) -> usize {
        match self {
            Precedence::LastInstalledWins => install_index,
            Precedence::FirstInstalledWins => usize::MAX - install_index,
        }
    }
}

impl std::fmt::Display for Precedence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Precedence::LastInstalledWins => write!(f, "last-installed wins"),
            Precedence::FirstInstalledWins => write!(f, "first-installed wins"),
        }
    }
}

/// Configuration for one installation session
///
/// Read-only once the session starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    /// Report overlapping writes on ordinary files as warnings
    pub check_for_collisions: bool,

    /// Directory of the application being modded
    pub target_path: PathBuf,

    /// Working area for extraction output
    pub temp_folder: PathBuf,

    /// Root for per-session backups
    pub backup_folder: PathBuf,

    /// External extraction tool (QuickBMS); looked up on PATH when None
    pub tool_path: Option<PathBuf>,

    /// Maximum extraction batches running at once
    pub max_quickbms_batches: usize,

    /// Tie-break for resolvable collisions
    pub precedence: Precedence,

    /// Destinations (relative to target) with zero-tolerance collision policy
    pub reserved_files: Vec<String>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        let thread_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        let cache_base = dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".cache"));
        let data_base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".local"));

        Self {
            check_for_collisions: true,
            target_path: PathBuf::new(),
            temp_folder: cache_base.join("modsplice").join("temp"),
            backup_folder: data_base.join("modsplice").join("backups"),
            tool_path: None,
            max_quickbms_batches: thread_count,
            precedence: Precedence::default(),
            reserved_files: Vec::new(),
        }
    }
}

impl InstallerConfig {
    /// Config with defaults for everything but the target directory
    pub fn for_target(target_path: impl Into<PathBuf>) -> Self {
        Self {
            target_path: target_path.into(),
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {:?}", path))?;

        Ok(config)
    }

    /// Whether a destination is listed in `reserved_files`
    pub fn is_reserved(&self, destination: &str) -> bool {
        self.reserved_files
            .iter()
            .any(|r| paths::paths_equal(r, destination))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.target_path.is_dir() {
            return Err(ConfigError::TargetNotFound(self.target_path.clone()));
        }

        if self.max_quickbms_batches == 0 {
            return Err(ConfigError::ZeroBatches);
        }

        if self.backup_folder == self.target_path || self.temp_folder == self.target_path {
            return Err(ConfigError::WorkDirIsTarget(self.target_path.clone()));
        }

        if let Some(ref tool) = self.tool_path {
            if !tool.is_file() && which::which(tool).is_err() {
                return Err(ConfigError::ToolNotFound(tool.clone()));
            }
        }

        if let Some(bad) = self
            .reserved_files
            .iter()
            .find(|r| !paths::is_contained_relative(r))
        {
            return Err(ConfigError::InvalidReservedPath(bad.clone()));
        }

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Target directory not found: {0}")]
    TargetNotFound(PathBuf),

    #[error("max_quickbms_batches must be at least 1")]
    ZeroBatches,

    #[error("Backup and temp folders must differ from the target directory: {0}")]
    WorkDirIsTarget(PathBuf),

    #[error("Extraction tool not found: {0}")]
    ToolNotFound(PathBuf),

    #[error("Reserved file path must be relative to the target: {0}")]
    InvalidReservedPath(String),
}

/// Progress events reported during a session
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A state-machine phase began
    PhaseStarted { phase: &'static str },
    /// An extraction batch finished
    BatchFinished { archive: PathBuf, current: usize, total: usize },
    /// A destination file was backed up and written
    FileApplied { destination: String, current: usize, total: usize },
    /// A backed-up file was restored during rollback
    FileRestored { destination: PathBuf },
}

/// Progress callback for reporting installation status
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;
