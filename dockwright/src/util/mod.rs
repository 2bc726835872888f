pub mod process;

use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};

use dockwright_shared::errors::{DockwrightError, DockwrightResult};

/// `sha256:<hex>` digest of a byte slice.
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Strip the `sha256:` prefix, validating the digest format.
pub fn digest_hex(digest: &str) -> DockwrightResult<&str> {
    let hex_part = digest.strip_prefix("sha256:").ok_or_else(|| {
        DockwrightError::Storage(format!("Invalid digest format, expected sha256: {digest}"))
    })?;

    if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(DockwrightError::Storage(format!(
            "Invalid sha256 digest: {digest}"
        )));
    }

    Ok(hex_part)
}

/// Serialize `value` as pretty JSON and atomically replace `path`.
///
/// Writes to a sibling temp file first so readers never observe a partially
/// written document.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> DockwrightResult<()> {
    let json = serde_json::to_vec_pretty(value)?;

    let parent = path.parent().ok_or_else(|| {
        DockwrightError::Storage(format!("{} has no parent directory", path.display()))
    })?;
    std::fs::create_dir_all(parent).map_err(|e| {
        DockwrightError::Storage(format!("failed to create {}: {e}", parent.display()))
    })?;

    let tmp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    std::fs::write(&tmp_path, json).map_err(|e| {
        DockwrightError::Storage(format!("failed to write {}: {e}", tmp_path.display()))
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        DockwrightError::Storage(format!("failed to replace {}: {e}", path.display()))
    })
}

/// Locate an executable by name.
///
/// Names containing a slash are taken as paths; bare names are searched in
/// `PATH`.
pub fn find_executable(name: &str) -> DockwrightResult<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        if path.is_file() {
            return Ok(path);
        }
        return Err(DockwrightError::NotFound(format!(
            "executable '{}' does not exist",
            name
        )));
    }

    let search_path = std::env::var_os("PATH").unwrap_or_default();
    let mut candidates = Vec::new();

    for dir in std::env::split_paths(&search_path) {
        let candidate = dir.join(name);
        tracing::trace!("Finding executable {:?} in path: {:?}", name, candidate);
        if candidate.is_file() {
            tracing::debug!(executable = %candidate.display(), "Found executable");
            return Ok(candidate);
        }
        candidates.push(candidate);
    }

    let locations = candidates
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(DockwrightError::NotFound(format!(
        "executable '{}' not found.\nSearched locations:\n{}",
        name, locations
    )))
}
