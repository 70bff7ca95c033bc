//! Mod manifest loading
//!
//! A mod is a directory holding a `mod.json` manifest plus the payload
//! files its writes reference.

mod types;

pub use types::*;

use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// File name looked up when a mod directory is given instead of a manifest
pub const MANIFEST_FILE_NAME: &str = "mod.json";

/// Manifest loading errors
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Mod manifest not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read mod manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid mod manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A parsed manifest together with the directory its relative paths resolve against
#[derive(Debug, Clone)]
pub struct ModPackage {
    pub manifest: ModManifest,
    pub root: PathBuf,
}

impl ModPackage {
    pub fn new(manifest: ModManifest, root: impl Into<PathBuf>) -> Self {
        Self {
            manifest,
            root: root.into(),
        }
    }

    pub fn id(&self) -> &ModId {
        &self.manifest.id
    }
}

/// Load a mod from a manifest file or a directory containing `mod.json`
pub fn load_mod(path: &Path) -> Result<ModPackage, ManifestError> {
    let manifest_path = if path.is_dir() {
        path.join(MANIFEST_FILE_NAME)
    } else {
        path.to_path_buf()
    };

    if !manifest_path.is_file() {
        return Err(ManifestError::NotFound(manifest_path));
    }

    let content = fs::read_to_string(&manifest_path).map_err(|source| ManifestError::Read {
        path: manifest_path.clone(),
        source,
    })?;

    let manifest: ModManifest =
        serde_json::from_str(&content).map_err(|source| ManifestError::Parse {
            path: manifest_path.clone(),
            source,
        })?;

    let root = manifest_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    info!(
        "Loaded mod '{}' ({} files, {} extractions) from {}",
        manifest.display_name(),
        manifest.files.len(),
        manifest.extract.len(),
        manifest_path.display()
    );

    Ok(ModPackage { manifest, root })
}

/// Load several mods, keeping the given order (the install order)
pub fn load_mods(paths: &[PathBuf]) -> Result<Vec<ModPackage>, ManifestError> {
    paths.iter().map(|p| load_mod(p)).collect()
}
