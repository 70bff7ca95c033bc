//! Case-insensitive path handling for mod destination paths
//!
//! Mod manifests name destinations with either separator style.
//! This module handles:
//! - Converting `\` to `/` for filesystem operations
//! - Case-insensitive lookups (mods target Windows-style game trees)
//! - Rejecting destinations that would escape the target directory

use std::path::{Component, Path, PathBuf};

/// Convert Windows path separators to Linux
/// `Data\Textures\armor.dds` -> `Data/Textures/armor.dds`
pub fn to_linux_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// Canonical key for lookups and comparisons.
///
/// Lowercase, forward slashes, no `.` segments and no empty segments, so
/// `Data//x.bin`, `./data/X.bin` and `Data\\x.bin` share one key.
pub fn normalize_for_lookup(path: &str) -> String {
    let lower = to_linux_path(path).to_lowercase();
    let segments: Vec<&str> = Path::new(&lower)
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            Component::ParentDir => Some(".."),
            _ => None,
        })
        .collect();
    segments.join("/")
}

/// Non-empty segments of a destination, skipping `.`
fn segments(relative: &str) -> impl Iterator<Item = &str> {
    relative.split(['\\', '/']).filter(|s| !s.is_empty() && *s != ".")
}

/// Check if two paths are equal (case-insensitive)
pub fn paths_equal(a: &str, b: &str) -> bool {
    normalize_for_lookup(a) == normalize_for_lookup(b)
}

/// Check that a relative destination stays inside the directory it is joined to.
///
/// Rejects empty paths, absolute paths, drive prefixes and any `..` component.
pub fn is_contained_relative(path: &str) -> bool {
    let linux = to_linux_path(path);
    if linux.trim_matches('/').is_empty() || linux.starts_with('/') {
        return false;
    }
    // `C:` style prefixes are not caught by Path on Linux
    if linux.len() >= 2 && linux.as_bytes()[1] == b':' {
        return false;
    }

    Path::new(&linux)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Find a file case-insensitively within a directory
///
/// Given a base directory and a relative path like `Data\Textures\armor.dds`,
/// finds the actual file even if the real path is `data\TEXTURES\Armor.DDS`
pub fn resolve_case_insensitive(base: &Path, relative: &str) -> Option<PathBuf> {
    let components: Vec<&str> = segments(relative).collect();

    if components.is_empty() {
        return Some(base.to_path_buf());
    }

    let mut current = base.to_path_buf();

    for component in components {
        // Exact match first, avoids a directory scan for the common case
        let exact = current.join(component);
        if exact.exists() {
            current = exact;
            continue;
        }

        let target_lower = component.to_lowercase();
        let found = std::fs::read_dir(&current).ok()?.find_map(|entry| {
            let entry = entry.ok()?;
            let name = entry.file_name();
            let name_str = name.to_string_lossy();

            if name_str.to_lowercase() == target_lower {
                Some(entry.path())
            } else {
                None
            }
        });

        match found {
            Some(path) => current = path,
            None => return None,
        }
    }

    Some(current)
}

/// Resolve a destination under the target directory.
///
/// The longest existing prefix keeps its on-disk casing; components that
/// don't exist yet use the case given in the manifest.
pub fn resolve_destination(base: &Path, relative: &str) -> PathBuf {
    let mut current = base.to_path_buf();
    let mut components = segments(relative);

    for component in components.by_ref() {
        match resolve_case_insensitive(&current, component) {
            Some(found) => current = found,
            None => {
                current.push(component);
                break;
            }
        }
    }
    for rest in components {
        current.push(rest);
    }

    current
}

/// Create parent directories for a path if they don't exist
pub fn ensure_parent_dirs(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
