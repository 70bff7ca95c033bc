//! Hash utilities for backup snapshots and backup keys.
//!
//! Snapshots are fingerprinted with xxHash64 encoded as base64 so a restore
//! can be checked against the bytes that were saved.

use anyhow::{Context, Result};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::paths;

/// Compute xxHash64 of a file and return as base64 string.
///
/// Uses streaming to handle large files without loading into memory.
pub fn compute_file_hash(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;

    let mut reader = BufReader::with_capacity(1024 * 1024, file); // 1MB buffer
    let mut buf = vec![0u8; 1024 * 1024];
    let mut hasher = xxhash_rust::xxh64::Xxh64::new(0);

    loop {
        let bytes_read = reader
            .read(&mut buf)
            .with_context(|| format!("Failed to read file for hashing: {}", path.display()))?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buf[..bytes_read]);
    }

    Ok(STANDARD.encode(hasher.digest().to_le_bytes()))
}

/// Hash an in-memory buffer, same encoding as [`compute_file_hash`].
pub fn hash_bytes(data: &[u8]) -> String {
    STANDARD.encode(xxhash_rust::xxh64::xxh64(data, 0).to_le_bytes())
}

/// Verify a file's hash matches the expected hash.
pub fn verify_file_hash(path: &Path, expected_hash: &str) -> Result<bool> {
    let actual_hash = compute_file_hash(path)?;
    Ok(actual_hash == expected_hash)
}

/// Deterministic, filesystem-safe key for a destination path.
///
/// Every spelling [`paths::normalize_for_lookup`] folds together maps to the same key.
pub fn destination_key(destination: &str) -> String {
    let normalized = paths::normalize_for_lookup(destination);
    let digest = xxhash_rust::xxh64::xxh64(normalized.as_bytes(), 0);
    URL_SAFE_NO_PAD.encode(digest.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_file_hash_matches_buffer_hash() -> Result<()> {
        let mut tmp = NamedTempFile::new()?;
        tmp.write_all(b"Hello, World!")?;
        tmp.flush()?;

        assert_eq!(compute_file_hash(tmp.path())?, hash_bytes(b"Hello, World!"));
        Ok(())
    }

    #[test]
    fn test_verify_hash() -> Result<()> {
        let mut tmp = NamedTempFile::new()?;
        tmp.write_all(b"Test content for hashing")?;
        tmp.flush()?;

        let hash = compute_file_hash(tmp.path())?;
        assert!(verify_file_hash(tmp.path(), &hash)?);
        assert!(!verify_file_hash(tmp.path(), "wronghash==")?);
        Ok(())
    }

    #[test]
    fn test_destination_key_is_case_insensitive() {
        let a = destination_key("Data\\Scripts\\Main.lua");
        let b = destination_key("data/scripts/main.lua");
        assert_eq!(a, b);
        assert_ne!(a, destination_key("data/scripts/other.lua"));
        assert_eq!(a, destination_key("./Data//Scripts/./main.lua"));
        assert!(!a.contains('/'));
    }
}
