//! Build stages and the linear build state machine.

use serde::{Deserialize, Serialize};

use dockwright_shared::errors::{DockwrightError, DockwrightResult};

/// State reached after each build step completes.
///
/// ```text
/// BASE_SELECTED → SYSTEM_PACKAGES_INSTALLED → WORKDIR_SET → MANIFEST_COPIED
///   → DEPS_INSTALLED → PAYLOAD_COPIED → ENV_CONFIGURED → PORT_DECLARED
///   → ENTRYPOINT_SET
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStage {
    BaseSelected,
    SystemPackagesInstalled,
    WorkdirSet,
    ManifestCopied,
    DepsInstalled,
    PayloadCopied,
    EnvConfigured,
    PortDeclared,
    EntrypointSet,
}

impl BuildStage {
    pub const ALL: [BuildStage; 9] = [
        BuildStage::BaseSelected,
        BuildStage::SystemPackagesInstalled,
        BuildStage::WorkdirSet,
        BuildStage::ManifestCopied,
        BuildStage::DepsInstalled,
        BuildStage::PayloadCopied,
        BuildStage::EnvConfigured,
        BuildStage::PortDeclared,
        BuildStage::EntrypointSet,
    ];

    pub fn first() -> Self {
        BuildStage::BaseSelected
    }

    /// Immediate successor, or `None` for the terminal stage.
    pub fn next(&self) -> Option<BuildStage> {
        use BuildStage::*;
        match self {
            BaseSelected => Some(SystemPackagesInstalled),
            SystemPackagesInstalled => Some(WorkdirSet),
            WorkdirSet => Some(ManifestCopied),
            ManifestCopied => Some(DepsInstalled),
            DepsInstalled => Some(PayloadCopied),
            PayloadCopied => Some(EnvConfigured),
            EnvConfigured => Some(PortDeclared),
            PortDeclared => Some(EntrypointSet),
            EntrypointSet => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.next().is_none()
    }

    /// 1-based step number.
    pub fn step_number(&self) -> usize {
        *self as usize + 1
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStage::BaseSelected => "BASE_SELECTED",
            BuildStage::SystemPackagesInstalled => "SYSTEM_PACKAGES_INSTALLED",
            BuildStage::WorkdirSet => "WORKDIR_SET",
            BuildStage::ManifestCopied => "MANIFEST_COPIED",
            BuildStage::DepsInstalled => "DEPS_INSTALLED",
            BuildStage::PayloadCopied => "PAYLOAD_COPIED",
            BuildStage::EnvConfigured => "ENV_CONFIGURED",
            BuildStage::PortDeclared => "PORT_DECLARED",
            BuildStage::EntrypointSet => "ENTRYPOINT_SET",
        }
    }
}

impl std::fmt::Display for BuildStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks how far a build has progressed.
///
/// Starts before the first stage; each `advance` must name the immediate
/// successor of the current stage.
#[derive(Debug, Clone, Default)]
pub struct BuildProgress {
    current: Option<BuildStage>,
}

impl BuildProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<BuildStage> {
        self.current
    }

    /// Stage the build is allowed to enter next.
    pub fn expected(&self) -> Option<BuildStage> {
        match self.current {
            None => Some(BuildStage::first()),
            Some(stage) => stage.next(),
        }
    }

    pub fn advance(&mut self, target: BuildStage) -> DockwrightResult<()> {
        if self.expected() != Some(target) {
            return Err(DockwrightError::InvalidState(format!(
                "cannot enter {} from {}",
                target,
                self.current.map(|s| s.as_str()).unwrap_or("START")
            )));
        }
        self.current = Some(target);
        Ok(())
    }

    /// True once the entrypoint has been recorded.
    pub fn is_complete(&self) -> bool {
        self.current.is_some_and(|s| s.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_is_the_successor_chain() {
        let mut stage = BuildStage::first();
        for expected in BuildStage::ALL.iter().skip(1) {
            stage = stage.next().unwrap();
            assert_eq!(stage, *expected);
        }
        assert!(stage.is_terminal());
        assert_eq!(stage.step_number(), 9);
    }

    #[test]
    fn test_progress_walks_all_stages() {
        let mut progress = BuildProgress::new();
        assert!(!progress.is_complete());
        for stage in BuildStage::ALL {
            progress.advance(stage).unwrap();
        }
        assert!(progress.is_complete());
        assert!(progress.advance(BuildStage::BaseSelected).is_err());
    }

    #[test]
    fn test_progress_rejects_skips_and_repeats() {
        let mut progress = BuildProgress::new();
        let err = progress.advance(BuildStage::WorkdirSet).unwrap_err();
        assert!(matches!(err, DockwrightError::InvalidState(_)));

        progress.advance(BuildStage::BaseSelected).unwrap();
        assert!(progress.advance(BuildStage::BaseSelected).is_err());
        assert!(progress.advance(BuildStage::DepsInstalled).is_err());
        assert_eq!(progress.current(), Some(BuildStage::BaseSelected));
    }

    #[test]
    fn test_payload_never_precedes_install() {
        assert!(BuildStage::DepsInstalled < BuildStage::PayloadCopied);
        assert!(BuildStage::ManifestCopied < BuildStage::DepsInstalled);
    }

    #[test]
    fn test_serde_names_match_display() {
        for stage in BuildStage::ALL {
            let json = serde_json::to_string(&stage).unwrap();
            assert_eq!(json, format!("\"{}\"", stage.as_str()));
        }
    }
}
