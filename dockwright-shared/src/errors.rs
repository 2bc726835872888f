//! Error taxonomy shared by the builder, the launcher and the CLI.
//!
//! Variants follow the recovery path an operator would take:
//! - [`DockwrightError::Fetch`]: base image or package index unreachable (retry the build)
//! - [`DockwrightError::Resolve`]: dependency manifest cannot be satisfied (fix the manifest)
//! - [`DockwrightError::Recipe`] / [`DockwrightError::Config`]: user-fixable input
//! - [`DockwrightError::Startup`]: the application cannot be brought online

use thiserror::Error;

/// Errors produced by dockwright operations.
#[derive(Debug, Error)]
pub enum DockwrightError {
    /// Base image or system package source unreachable.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// A dependency manifest entry is unresolvable or incompatible.
    #[error("dependency resolution failed: {0}")]
    Resolve(String),

    /// The build recipe violates an invariant.
    #[error("invalid recipe: {0}")]
    Recipe(String),

    /// Runtime configuration value could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A build step could not be executed.
    #[error("step execution failed: {0}")]
    Execution(String),

    /// Blob store, index or cache I/O failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// The application process could not be started.
    #[error("startup failed: {0}")]
    Startup(String),

    /// Illegal state machine transition.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Requested image or object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl DockwrightError {
    /// True for failures that abort a build before an image is produced.
    pub fn is_build_failure(&self) -> bool {
        matches!(
            self,
            DockwrightError::Fetch(_)
                | DockwrightError::Resolve(_)
                | DockwrightError::Recipe(_)
                | DockwrightError::Execution(_)
        )
    }
}

/// Result alias used across dockwright crates.
pub type DockwrightResult<T> = Result<T, DockwrightError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_category() {
        let err = DockwrightError::Resolve("pandas==99.0 not found".into());
        assert_eq!(
            err.to_string(),
            "dependency resolution failed: pandas==99.0 not found"
        );
    }

    #[test]
    fn test_build_failure_classification() {
        assert!(DockwrightError::Fetch("x".into()).is_build_failure());
        assert!(DockwrightError::Resolve("x".into()).is_build_failure());
        assert!(!DockwrightError::Startup("x".into()).is_build_failure());
        assert!(!DockwrightError::NotFound("x".into()).is_build_failure());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: DockwrightError = io.into();
        assert!(matches!(err, DockwrightError::Io(_)));
    }
}
