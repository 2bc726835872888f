pub mod build;
pub mod completions;
pub mod export;
pub mod images;
pub mod init;
pub mod inspect;
pub mod launch;
pub mod plan;
pub mod render;

use std::path::Path;

/// Shorten a `sha256:` digest for tables.
pub(crate) fn short_digest(digest: &str) -> &str {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    &hex[..hex.len().min(12)]
}

/// Default tag for a context: `<dir name>:latest`.
pub(crate) fn default_tag(context: &Path) -> String {
    let name = context
        .canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_lowercase()))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "dashboard".to_string());
    format!("{name}:latest")
}
