//! QuickBMS binary integration for archive extraction.
//!
//! Each batch is one invocation of the tool:
//!
//! ```text
//! quickbms -o -Y <script.bms> <archive> <output dir>
//! ```
//!
//! - `-o`: Overwrite existing output files
//! - `-Y`: Answer yes to every prompt
//!
//! Batches run on a dedicated pool sized by `max_quickbms_batches`; extra
//! batches queue until a slot frees up. The tool is looked up as configured,
//! then at `bin/quickbms` next to the executable, then on PATH.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::installer::config::{ProgressCallback, ProgressEvent};
use crate::manifest::ModId;

/// External tool failures
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("QuickBMS not found (configured: {configured:?})")]
    NotFound { configured: Option<PathBuf> },

    #[error("Failed to run {}: {source}", tool.display())]
    Spawn { tool: PathBuf, source: io::Error },

    #[error("QuickBMS failed for {} (exit code {code:?}): {stderr}", archive.display())]
    ExitStatus {
        archive: PathBuf,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to start extraction pool: {0}")]
    Pool(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

/// One tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionBatch {
    pub mod_id: ModId,
    pub script: PathBuf,
    pub archive: PathBuf,
    pub output_dir: PathBuf,
}

/// Find the QuickBMS binary.
///
/// Looks in the following locations:
/// 1. The configured path (a file, or a name resolved on PATH)
/// 2. `bin/quickbms` relative to the executable
/// 3. System PATH (`quickbms`)
pub fn locate(configured: Option<&Path>) -> Result<PathBuf, ToolError> {
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return which::which(path).map_err(|_| ToolError::NotFound {
            configured: Some(path.to_path_buf()),
        });
    }

    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            let bin_path = exe_dir.join("bin/quickbms");
            if bin_path.is_file() {
                return Ok(bin_path);
            }
        }
    }

    which::which("quickbms").map_err(|_| ToolError::NotFound { configured: None })
}

/// Runs extraction batches with bounded concurrency
#[derive(Debug, Clone)]
pub struct QuickBmsRunner {
    tool: PathBuf,
    max_batches: usize,
}

impl QuickBmsRunner {
    pub fn new(tool: impl Into<PathBuf>, max_batches: usize) -> Self {
        Self {
            tool: tool.into(),
            max_batches: max_batches.max(1),
        }
    }

    pub fn tool(&self) -> &Path {
        &self.tool
    }

    /// Run one batch and return how many files it produced
    pub fn run_batch(&self, batch: &ExtractionBatch) -> Result<usize, ToolError> {
        fs::create_dir_all(&batch.output_dir).map_err(|source| ToolError::Io {
            path: batch.output_dir.clone(),
            source,
        })?;

        debug!(
            "Extracting {} with {} into {}",
            batch.archive.display(),
            batch.script.display(),
            batch.output_dir.display()
        );

        let output = Command::new(&self.tool)
            .arg("-o")
            .arg("-Y")
            .arg(&batch.script)
            .arg(&batch.archive)
            .arg(&batch.output_dir)
            .output()
            .map_err(|source| ToolError::Spawn {
                tool: self.tool.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ToolError::ExitStatus {
                archive: batch.archive.clone(),
                code: output.status.code(),
                stderr,
            });
        }

        // Count extracted files
        let count = walkdir::WalkDir::new(&batch.output_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count();

        Ok(count)
    }

    /// Run every batch, at most `max_batches` at a time.
    ///
    /// Returns per-batch file counts in input order, or the first failure.
    pub fn run_all(&self, batches: &[ExtractionBatch], progress: Option<&ProgressCallback>) -> Result<Vec<usize>, ToolError> {
        if batches.is_empty() {
            return Ok(Vec::new());
        }

        let threads = self.max_batches.min(batches.len());
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("quickbms-{}", i))
            .build()
            .map_err(|e| ToolError::Pool(e.to_string()))?;

        info!(
            "Running {} extraction batches ({} at a time)",
            batches.len(),
            threads
        );

        let done = AtomicUsize::new(0);
        let total = batches.len();

        pool.install(|| {
            batches
                .par_iter()
                .map(|batch| {
                    let result = self.run_batch(batch);
                    match &result {
                        Ok(files) => {
                            let current = done.fetch_add(1, Ordering::SeqCst) + 1;
                            debug!(
                                "Batch {}/{} done: {} ({} files)",
                                current,
                                total,
                                batch.archive.display(),
                                files
                            );
                            if let Some(cb) = progress {
                                cb(ProgressEvent::BatchFinished {
                                    archive: batch.archive.clone(),
                                    current,
                                    total,
                                });
                            }
                        }
                        Err(e) => warn!("{}", e),
                    }
                    result
                })
                .collect::<Result<Vec<usize>, ToolError>>()
        })
    }
}

/// Per-session extraction area under the temp folder
#[derive(Debug)]
pub struct ExtractionWorkspace {
    root: PathBuf,
}

impl ExtractionWorkspace {
    pub fn new(temp_folder: &Path, session_id: Uuid) -> Self {
        Self {
            root: temp_folder.join(session_id.to_string()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Output directory for one mod's archives.
    ///
    /// The readable part is sanitized; the hash of the raw id keeps ids that
    /// sanitize alike (`my mod`, `my_mod`) apart.
    pub fn mod_dir(&self, mod_id: &ModId) -> PathBuf {
        let safe: String = mod_id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        let digest = xxhash_rust::xxh64::xxh64(mod_id.as_str().as_bytes(), 0);
        self.root.join(format!("{}-{:016x}", safe, digest))
    }

    /// Delete everything extracted this session
    pub fn remove(&self) {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => debug!("Removed extraction workspace {}", self.root.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove extraction workspace {}: {}",
                self.root.display(),
                e
            ),
        }
    }
}
